//! Commit ranges for review
//!
//! Works out which commits a reviewer has to look at between two points in
//! history, even after the older point was rewritten away.

use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::object::CommitId;
use crate::store::HistoryStore;

/// Computes ordered, gap-free commit ranges
pub struct HistoryResolver {
    store: Arc<dyn HistoryStore>,
}

impl HistoryResolver {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Commits after `from` up to and including `to`, oldest first.
    ///
    /// If `from` is not an ancestor of `to` (a rebase abandoned it, say),
    /// the merge base of the two is used as the starting point instead.
    /// Histories with no common ancestor yield the whole history of `to`.
    /// The range is empty when `from == to` or `to` is not ahead of `from`.
    pub fn list_commits_between(&self, from: CommitId, to: CommitId) -> Result<Vec<CommitId>> {
        if from == to {
            return Ok(Vec::new());
        }
        if self.store.is_ancestor(from, to)? {
            return self.store.commits_between(Some(from), to);
        }

        let base = self.store.merge_base(from, to)?;
        debug!(
            from = %from.short(),
            to = %to.short(),
            base = ?base.map(|b| b.short()),
            "Start is not an ancestor, falling back to merge base"
        );
        match base {
            Some(base) if base == to => Ok(Vec::new()),
            base => self.store.commits_between(base, to),
        }
    }

    /// Resolve a ref name or commit id.
    pub fn resolve(&self, rev: &str) -> Result<CommitId> {
        self.store.resolve_ref(rev)
    }

    /// [`list_commits_between`](Self::list_commits_between) on ref names or
    /// commit ids.
    pub fn list_commits_between_refs(&self, from: &str, to: &str) -> Result<Vec<CommitId>> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        self.list_commits_between(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn chain(store: &MemoryStore, base: Option<CommitId>, names: &[&str]) -> Vec<CommitId> {
        let mut parent = base;
        let mut ids = Vec::new();
        for name in names {
            let parents: Vec<CommitId> = parent.into_iter().collect();
            let id = store.commit(&parents, name).unwrap();
            ids.push(id);
            parent = Some(id);
        }
        ids
    }

    fn setup() -> (Arc<MemoryStore>, HistoryResolver) {
        let store = MemoryStore::shared("a");
        let resolver = HistoryResolver::new(store.clone());
        (store, resolver)
    }

    #[test]
    fn test_same_commit_is_empty() {
        let (store, resolver) = setup();
        let ids = chain(&store, None, &["a"]);
        assert!(resolver.list_commits_between(ids[0], ids[0]).unwrap().is_empty());
    }

    #[test]
    fn test_range_is_chronological_and_excludes_from() {
        let (store, resolver) = setup();
        let ids = chain(&store, None, &["a", "b", "c"]);
        assert_eq!(
            resolver.list_commits_between(ids[0], ids[2]).unwrap(),
            vec![ids[1], ids[2]]
        );
    }

    #[test]
    fn test_to_behind_from_is_empty() {
        let (store, resolver) = setup();
        let ids = chain(&store, None, &["a", "b", "c"]);
        assert!(resolver.list_commits_between(ids[2], ids[0]).unwrap().is_empty());
    }

    #[test]
    fn test_rewritten_start_falls_back_to_merge_base() {
        let (store, resolver) = setup();
        // base - old1 - old2     (abandoned)
        //     \
        //      new1 - new2
        let base = chain(&store, None, &["base"])[0];
        let old = chain(&store, Some(base), &["old1", "old2"]);
        let new = chain(&store, Some(base), &["new1", "new2"]);

        let range = resolver.list_commits_between(old[1], new[1]).unwrap();
        assert_eq!(range, new);
        assert_eq!(range, resolver.list_commits_between(base, new[1]).unwrap());
    }

    #[test]
    fn test_unrelated_histories_give_whole_history() {
        let (store, resolver) = setup();
        let first = chain(&store, None, &["a", "b"]);
        let second = chain(&store, None, &["x", "y"]);
        assert_eq!(
            resolver.list_commits_between(first[1], second[1]).unwrap(),
            second
        );
    }

    #[test]
    fn test_refs_are_resolved() {
        let (store, resolver) = setup();
        let ids = chain(&store, None, &["a", "b", "c"]);
        store.set_ref("refs/heads/main", ids[2]).unwrap();
        assert_eq!(
            resolver
                .list_commits_between_refs(&ids[0].to_hex(), "refs/heads/main")
                .unwrap(),
            vec![ids[1], ids[2]]
        );
        assert!(resolver
            .list_commits_between_refs("refs/heads/nope", "refs/heads/main")
            .unwrap_err()
            .is_not_found());
    }
}
