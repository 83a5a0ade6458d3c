//! Append-only annotation log
//!
//! Records attach to one commit under one channel and are never edited or
//! removed. Review state changes are new records; interpreting the
//! sequence is up to the caller.

use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::object::{ChannelContents, CommitId};
use crate::store::HistoryStore;

/// Per-commit record store over a [`HistoryStore`]
#[derive(Clone)]
pub struct AnnotationLog {
    store: Arc<dyn HistoryStore>,
}

impl AnnotationLog {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Add `record` to the annotations of `commit` under `channel`.
    ///
    /// Existing records never cause a failure; only a rejected write does.
    pub fn append(&self, channel: &str, commit: CommitId, record: &[u8]) -> Result<()> {
        self.store.append_channel_record(channel, commit, record)?;
        debug!(channel, commit = %commit.short(), bytes = record.len(), "Appended record");
        Ok(())
    }

    /// All records for `commit` under `channel`. No records is not an error.
    pub fn read(&self, channel: &str, commit: CommitId) -> Result<Vec<Bytes>> {
        self.store.read_channel_records(channel, commit)
    }

    /// Every locally known commit with at least one record under `channel`.
    ///
    /// Entries for objects this replica has not fetched yet, or that are not
    /// commits, are skipped.
    pub fn list_annotated_commits(&self, channel: &str) -> Result<BTreeSet<CommitId>> {
        let mut commits = BTreeSet::new();
        for id in self.store.list_channel_entries(channel)? {
            if self.store.contains_commit(id)? {
                commits.insert(id);
            } else {
                debug!(channel, object = %id.short(), "Skipping annotation on unknown object");
            }
        }
        Ok(commits)
    }

    /// Full content of a channel.
    ///
    /// Unlike [`list_annotated_commits`](Self::list_annotated_commits) this
    /// keeps entries for objects not present locally: a merge must carry
    /// them forward rather than drop them.
    pub fn snapshot(&self, channel: &str) -> Result<ChannelContents> {
        let mut contents = ChannelContents::new();
        for id in self.store.list_channel_entries(channel)? {
            let records = self.store.read_channel_records(channel, id)?;
            if !records.is_empty() {
                contents.insert(id, records);
            }
        }
        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::memory::MemoryStore;

    const REVIEWS: &str = "refs/notes/devtools/reviews";

    fn setup() -> (Arc<MemoryStore>, AnnotationLog, CommitId) {
        let store = MemoryStore::shared("a");
        let head = store.commit(&[], "initial").unwrap();
        let log = AnnotationLog::new(store.clone());
        (store, log, head)
    }

    #[test]
    fn test_read_without_annotations_is_empty() {
        let (_store, log, head) = setup();
        assert!(log.read(REVIEWS, head).unwrap().is_empty());
        assert!(log.list_annotated_commits(REVIEWS).unwrap().is_empty());
        assert!(log.snapshot(REVIEWS).unwrap().is_empty());
    }

    #[test]
    fn test_append_then_read_keeps_insertion_order() {
        let (_store, log, head) = setup();
        log.append(REVIEWS, head, b"request:alice").unwrap();
        log.append(REVIEWS, head, b"lgtm:bob").unwrap();
        log.append(REVIEWS, head, b"lgtm:bob").unwrap();

        let records = log.read(REVIEWS, head).unwrap();
        assert_eq!(
            records,
            vec![
                Bytes::from_static(b"request:alice"),
                Bytes::from_static(b"lgtm:bob"),
                Bytes::from_static(b"lgtm:bob"),
            ]
        );
    }

    #[test]
    fn test_channels_are_independent() {
        let (_store, log, head) = setup();
        log.append(REVIEWS, head, b"review").unwrap();
        log.append("refs/notes/devtools/discuss", head, b"comment").unwrap();

        assert_eq!(log.read(REVIEWS, head).unwrap(), vec![Bytes::from_static(b"review")]);
        assert_eq!(
            log.read("refs/notes/devtools/discuss", head).unwrap(),
            vec![Bytes::from_static(b"comment")]
        );
    }

    #[test]
    fn test_append_to_unknown_commit_is_a_write_error() {
        let (_store, log, _head) = setup();
        let bogus = CommitId::from_data(b"never created");
        let err = log.append(REVIEWS, bogus, b"lgtm").unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
    }

    #[test]
    fn test_list_annotated_commits_skips_unknown_objects() {
        let (store, log, head) = setup();
        let second = store.commit(&[head], "second").unwrap();
        log.append(REVIEWS, head, b"lgtm").unwrap();
        log.append(REVIEWS, second, b"lgtm").unwrap();

        // a channel version that annotates an object this replica lacks
        let phantom = CommitId::from_data(b"not fetched yet");
        let mut contents = log.snapshot(REVIEWS).unwrap();
        contents.insert(phantom, vec![Bytes::from_static(b"lgtm")]);
        let tip = store.resolve_ref(REVIEWS).unwrap();
        store.write_channel(REVIEWS, &contents, &[tip]).unwrap();

        let listed = log.list_annotated_commits(REVIEWS).unwrap();
        assert_eq!(listed, BTreeSet::from([head, second]));
        assert!(log.snapshot(REVIEWS).unwrap().contains_key(&phantom));
    }
}
