//! Channel replication between replicas
//!
//! `push` sends local channels to a remote; `pull` fetches the remote's
//! channels into remote tracking refs and merges each one into the local
//! channel.
//!
//! Merging is a union of record sets with exact duplicates collapsed, emitted
//! in ascending byte order. The result depends only on the two sets, so
//! merging is commutative, associative and idempotent and replicas converge
//! whatever order they sync in.

use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::annotations::AnnotationLog;
use crate::error::{PushError, StoreError, SyncError};
use crate::object::{ChannelContents, CommitId};
use crate::store::{HistoryStore, RefSpec};

const NOTES_PREFIX: &str = "refs/notes/";

/// Where a remote's copy of `channel` is tracked locally.
///
/// `refs/notes/<rel>` from remote `R` lives at `refs/notes/R/<rel>`, so
/// several remotes' views of one channel never collide. Works on patterns
/// too.
pub fn remote_tracking_ref(remote: &str, channel: &str) -> String {
    let relative = channel.strip_prefix(NOTES_PREFIX).unwrap_or(channel);
    format!("{NOTES_PREFIX}{remote}/{relative}")
}

/// Union of two record sequences with exact duplicates collapsed.
pub fn union_records(local: &[Bytes], remote: &[Bytes]) -> Vec<Bytes> {
    local
        .iter()
        .chain(remote)
        .cloned()
        .collect::<BTreeSet<Bytes>>()
        .into_iter()
        .collect()
}

/// Per-commit [`union_records`] over two whole channels.
pub fn union_channels(local: &ChannelContents, remote: &ChannelContents) -> ChannelContents {
    let mut merged = ChannelContents::new();
    for commit in local.keys().chain(remote.keys()) {
        if merged.contains_key(commit) {
            continue;
        }
        let ours = local.get(commit).map(Vec::as_slice).unwrap_or_default();
        let theirs = remote.get(commit).map(Vec::as_slice).unwrap_or_default();
        merged.insert(*commit, union_records(ours, theirs));
    }
    merged
}

/// What pulling one channel did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The local channel already contained the remote state.
    UpToDate,
    /// The local channel moved to the remote version unchanged.
    FastForward(CommitId),
    /// A new version joining both sides was written.
    Merged { version: CommitId, annotated: usize },
}

/// Result of a successful push
#[derive(Debug, Clone)]
pub struct PushReport {
    pub remote: String,
    pub refs: Vec<String>,
}

/// Result of a pull: channels merged and channels that failed
#[derive(Debug)]
pub struct PullReport {
    pub remote: String,
    pub merged: Vec<(String, MergeOutcome)>,
    pub failed: Vec<SyncError>,
}

impl PullReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Push/pull engine for annotation channels
pub struct Replicator {
    store: Arc<dyn HistoryStore>,
    log: AnnotationLog,
}

impl Replicator {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        let log = AnnotationLog::new(store.clone());
        Self { store, log }
    }

    /// Send local channels matching `pattern` to `remote`.
    ///
    /// A rejection usually means the remote has records we have not pulled
    /// yet; the caller should pull and retry.
    pub fn push(&self, remote: &str, pattern: &str) -> Result<PushReport, PushError> {
        let push_error = |source| PushError {
            remote: remote.to_string(),
            source,
        };
        let refs: Vec<String> = self
            .store
            .list_refs(pattern)
            .map_err(push_error)?
            .into_keys()
            .collect();
        if refs.is_empty() {
            debug!(remote, pattern, "No local channels to push");
        } else {
            self.store.push_channel(remote, &refs).map_err(push_error)?;
            info!(remote, channels = refs.len(), "Pushed channels");
        }
        Ok(PushReport {
            remote: remote.to_string(),
            refs,
        })
    }

    /// Fetch channels matching `pattern` from `remote` and merge each into
    /// its local channel.
    ///
    /// A failed fetch fails the whole pull. A failed merge is reported for
    /// that channel only, leaves it untouched, and does not stop the others.
    pub fn pull(&self, remote: &str, pattern: &str) -> Result<PullReport, SyncError> {
        let sync_error = |channel: &str, source| SyncError {
            remote: remote.to_string(),
            channel: channel.to_string(),
            source,
        };

        let refspec = RefSpec::new(pattern, remote_tracking_ref(remote, pattern), true);
        self.store
            .fetch_channel(remote, &refspec)
            .map_err(|e| sync_error(pattern, e))?;
        let channels = self
            .store
            .list_remote_channel(remote, pattern)
            .map_err(|e| sync_error(pattern, e))?;

        let mut report = PullReport {
            remote: remote.to_string(),
            merged: Vec::new(),
            failed: Vec::new(),
        };
        for channel in channels.into_keys() {
            let tracking = remote_tracking_ref(remote, &channel);
            match self.merge_channel(&channel, &tracking) {
                Ok(outcome) => {
                    debug!(remote, channel = %channel, ?outcome, "Merged channel");
                    report.merged.push((channel, outcome));
                }
                Err(e) => {
                    warn!(remote, channel = %channel, error = %e, "Failed to merge channel");
                    report.failed.push(sync_error(&channel, e));
                }
            }
        }
        info!(
            remote,
            merged = report.merged.len(),
            failed = report.failed.len(),
            "Pulled channels"
        );
        Ok(report)
    }

    /// Merge the channel version at `tracking` into `channel`.
    pub fn merge_channel(&self, channel: &str, tracking: &str) -> Result<MergeOutcome, StoreError> {
        let theirs = self.store.resolve_ref(tracking)?;
        let ours = match self.store.find_ref(channel)? {
            None => {
                self.store.set_ref(channel, theirs)?;
                return Ok(MergeOutcome::FastForward(theirs));
            }
            Some(ours) => ours,
        };

        if self.store.is_ancestor(theirs, ours)? {
            return Ok(MergeOutcome::UpToDate);
        }
        if self.store.is_ancestor(ours, theirs)? {
            self.store.set_ref(channel, theirs)?;
            return Ok(MergeOutcome::FastForward(theirs));
        }

        let merged = union_channels(&self.log.snapshot(channel)?, &self.log.snapshot(tracking)?);
        let annotated = merged.len();
        let version = self.store.write_channel(channel, &merged, &[ours, theirs])?;
        Ok(MergeOutcome::Merged { version, annotated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    const REVIEWS: &str = "refs/notes/devtools/reviews";
    const PATTERN: &str = "refs/notes/devtools/*";

    fn rec(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    /// Two replicas sharing one commit, each naming the other "peer".
    fn replicas() -> (Arc<MemoryStore>, Arc<MemoryStore>, CommitId) {
        let a = MemoryStore::shared("a");
        let b = MemoryStore::shared("b");
        a.add_remote("peer", &b).unwrap();
        b.add_remote("peer", &a).unwrap();

        let head = a.commit(&[], "initial").unwrap();
        a.set_ref("refs/heads/main", head).unwrap();
        b.fetch_channel("peer", &RefSpec::new("refs/heads/*", "refs/heads/*", true))
            .unwrap();
        (a, b, head)
    }

    #[test]
    fn test_remote_tracking_ref() {
        assert_eq!(
            remote_tracking_ref("origin", "refs/notes/devtools/reviews"),
            "refs/notes/origin/devtools/reviews"
        );
        assert_eq!(
            remote_tracking_ref("origin", "refs/notes/devtools/*"),
            "refs/notes/origin/devtools/*"
        );
        assert_ne!(
            remote_tracking_ref("a", REVIEWS),
            remote_tracking_ref("b", REVIEWS)
        );
    }

    #[test]
    fn test_union_records_collapses_duplicates() {
        let merged = union_records(
            &[rec("lgtm:bob"), rec("lgtm:alice"), rec("lgtm:alice")],
            &[rec("lgtm:alice"), rec("nit:carol")],
        );
        assert_eq!(merged, vec![rec("lgtm:alice"), rec("lgtm:bob"), rec("nit:carol")]);
    }

    #[test]
    fn test_union_channels_keeps_one_sided_entries() {
        let x = CommitId::from_data(b"x");
        let y = CommitId::from_data(b"y");
        let local = ChannelContents::from([(x, vec![rec("a")])]);
        let remote = ChannelContents::from([(x, vec![rec("b")]), (y, vec![rec("c")])]);

        let merged = union_channels(&local, &remote);
        assert_eq!(merged[&x], vec![rec("a"), rec("b")]);
        assert_eq!(merged[&y], vec![rec("c")]);
    }

    #[test]
    fn test_pull_into_empty_channel_fast_forwards() {
        let (a, b, head) = replicas();
        b.append_channel_record(REVIEWS, head, b"lgtm:bob").unwrap();

        let report = Replicator::new(a.clone()).pull("peer", PATTERN).unwrap();
        assert!(report.is_success());
        let tip = b.resolve_ref(REVIEWS).unwrap();
        assert_eq!(report.merged, vec![(REVIEWS.to_string(), MergeOutcome::FastForward(tip))]);
        assert_eq!(a.resolve_ref(REVIEWS).unwrap(), tip);
        assert_eq!(
            a.resolve_ref(&remote_tracking_ref("peer", REVIEWS)).unwrap(),
            tip
        );
    }

    #[test]
    fn test_concurrent_appends_converge() {
        let (a, b, head) = replicas();
        a.append_channel_record(REVIEWS, head, b"lgtm:alice").unwrap();
        b.append_channel_record(REVIEWS, head, b"lgtm:bob").unwrap();

        let report = Replicator::new(a.clone()).pull("peer", PATTERN).unwrap();
        assert!(matches!(report.merged[0].1, MergeOutcome::Merged { annotated: 1, .. }));
        Replicator::new(b.clone()).pull("peer", PATTERN).unwrap();

        let expected = vec![rec("lgtm:alice"), rec("lgtm:bob")];
        assert_eq!(a.read_channel_records(REVIEWS, head).unwrap(), expected);
        assert_eq!(b.read_channel_records(REVIEWS, head).unwrap(), expected);
        // b fast-forwarded onto a's merge, so both sides agree on the version
        assert_eq!(a.resolve_ref(REVIEWS).unwrap(), b.resolve_ref(REVIEWS).unwrap());
    }

    #[test]
    fn test_pull_twice_is_idempotent() {
        let (a, b, head) = replicas();
        a.append_channel_record(REVIEWS, head, b"lgtm:alice").unwrap();
        b.append_channel_record(REVIEWS, head, b"lgtm:bob").unwrap();

        let replicator = Replicator::new(a.clone());
        replicator.pull("peer", PATTERN).unwrap();
        let after_first = a.resolve_ref(REVIEWS).unwrap();

        let report = replicator.pull("peer", PATTERN).unwrap();
        assert_eq!(report.merged, vec![(REVIEWS.to_string(), MergeOutcome::UpToDate)]);
        assert_eq!(a.resolve_ref(REVIEWS).unwrap(), after_first);
    }

    #[test]
    fn test_push_after_pull_fast_forwards_remote() {
        let (a, b, head) = replicas();
        a.append_channel_record(REVIEWS, head, b"lgtm:alice").unwrap();
        b.append_channel_record(REVIEWS, head, b"lgtm:bob").unwrap();

        let replicator = Replicator::new(a.clone());
        let err = replicator.push("peer", PATTERN).unwrap_err();
        assert_eq!(err.remote, "peer");
        assert!(matches!(err.source, StoreError::Transport { .. }));

        replicator.pull("peer", PATTERN).unwrap();
        let report = replicator.push("peer", PATTERN).unwrap();
        assert_eq!(report.refs, vec![REVIEWS.to_string()]);
        assert_eq!(
            b.read_channel_records(REVIEWS, head).unwrap(),
            vec![rec("lgtm:alice"), rec("lgtm:bob")]
        );
    }

    #[test]
    fn test_push_to_unreachable_remote_is_recoverable() {
        let (a, b, head) = replicas();
        a.append_channel_record(REVIEWS, head, b"lgtm:alice").unwrap();
        b.set_offline(true).unwrap();

        let err = Replicator::new(a.clone()).push("peer", PATTERN).unwrap_err();
        assert_eq!(err.remote, "peer");
        assert!(err.to_string().contains("peer"));
    }

    #[test]
    fn test_push_with_nothing_to_send() {
        let (a, _b, _head) = replicas();
        let report = Replicator::new(a).push("peer", PATTERN).unwrap();
        assert!(report.refs.is_empty());
    }

    #[test]
    fn test_failed_merge_leaves_channel_untouched() {
        let (a, b, head) = replicas();
        a.append_channel_record(REVIEWS, head, b"lgtm:alice").unwrap();
        b.append_channel_record(REVIEWS, head, b"lgtm:bob").unwrap();
        let before_tip = a.resolve_ref(REVIEWS).unwrap();
        let before = a.read_channel_records(REVIEWS, head).unwrap();

        // fetch succeeds, then the merge write is refused
        let replicator = Replicator::new(a.clone());
        let refspec = RefSpec::new(PATTERN, remote_tracking_ref("peer", PATTERN), true);
        a.fetch_channel("peer", &refspec).unwrap();
        a.set_fail_writes(true).unwrap();

        let err = replicator
            .merge_channel(REVIEWS, &remote_tracking_ref("peer", REVIEWS))
            .unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(a.resolve_ref(REVIEWS).unwrap(), before_tip);
        assert_eq!(a.read_channel_records(REVIEWS, head).unwrap(), before);
    }

    #[test]
    fn test_failed_channel_does_not_abort_others() {
        let (a, b, head) = replicas();
        let discuss = "refs/notes/devtools/discuss";
        b.append_channel_record(REVIEWS, head, b"lgtm:bob").unwrap();
        b.append_channel_record(discuss, head, b"question:bob").unwrap();
        a.append_channel_record(discuss, head, b"answer:alice").unwrap();
        a.reject_writes_to(REVIEWS).unwrap();

        let report = Replicator::new(a.clone()).pull("peer", PATTERN).unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].channel, REVIEWS);
        assert!(a.find_ref(REVIEWS).unwrap().is_none());

        assert_eq!(report.merged.len(), 1);
        assert_eq!(
            a.read_channel_records(discuss, head).unwrap(),
            vec![rec("answer:alice"), rec("question:bob")]
        );
    }

    #[test]
    fn test_pull_from_unreachable_remote_is_sync_error() {
        let (a, b, _head) = replicas();
        b.set_offline(true).unwrap();
        let err = Replicator::new(a).pull("peer", PATTERN).unwrap_err();
        assert_eq!(err.remote, "peer");
        assert_eq!(err.channel, PATTERN);
    }
}
