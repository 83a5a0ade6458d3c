//! Object store adapter interface
//!
//! Everything dreview needs from the versioned object store goes through
//! [`HistoryStore`]. The core never speaks a store's wire or file format;
//! see [`crate::git::GitStore`] and [`crate::memory::MemoryStore`].

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::object::{ChannelContents, CommitId};

/// Narrow interface onto an immutable, content-addressed history graph
/// plus its annotation channels.
///
/// All calls are synchronous and run to completion. Implementations do not
/// serialize concurrent sync operations; holding a repository lock is the
/// caller's job.
pub trait HistoryStore: Send + Sync {
    /// Look up a ref name (or commit id) without treating absence as an error.
    fn find_ref(&self, name: &str) -> Result<Option<CommitId>>;

    /// Resolve a ref name (or commit id) to the commit it points at.
    fn resolve_ref(&self, name: &str) -> Result<CommitId> {
        self.find_ref(name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Point `name` at `target`, creating or moving the ref.
    fn set_ref(&self, name: &str, target: CommitId) -> Result<()>;

    /// Whether `ancestor` is reachable from `descendant`. A commit is its
    /// own ancestor.
    fn is_ancestor(&self, ancestor: CommitId, descendant: CommitId) -> Result<bool>;

    /// Most recent common ancestor, or `None` for unrelated histories.
    fn merge_base(&self, a: CommitId, b: CommitId) -> Result<Option<CommitId>>;

    /// Commits reachable from `to` that descend from `from` (exclusive),
    /// oldest first. With no `from`, the whole history of `to`.
    fn commits_between(&self, from: Option<CommitId>, to: CommitId) -> Result<Vec<CommitId>>;

    /// Refs matching `pattern` and their direct targets.
    fn list_refs(&self, pattern: &str) -> Result<BTreeMap<String, CommitId>>;

    /// Whether `id` names a commit known to this store.
    fn contains_commit(&self, id: CommitId) -> Result<bool>;

    /// Fetch refs from `remote` according to `refspec`.
    fn fetch_channel(&self, remote: &str, refspec: &RefSpec) -> Result<()>;

    /// Refs on `remote` matching `pattern`.
    fn list_remote_channel(
        &self,
        remote: &str,
        pattern: &str,
    ) -> Result<BTreeMap<String, CommitId>>;

    /// Push each named local ref to the same name on `remote`. Updates that
    /// are not fast-forwards are rejected.
    fn push_channel(&self, remote: &str, refs: &[String]) -> Result<()>;

    /// Records attached to `commit` under `channel`, in stored order.
    fn read_channel_records(&self, channel: &str, commit: CommitId) -> Result<Vec<Bytes>>;

    /// Append one record to `commit` under `channel`.
    fn append_channel_record(&self, channel: &str, commit: CommitId, payload: &[u8]) -> Result<()>;

    /// Every object annotated under `channel`, including objects this store
    /// has not fetched yet.
    fn list_channel_entries(&self, channel: &str) -> Result<Vec<CommitId>>;

    /// Replace the whole content of `channel` with `contents`, recording
    /// `parents` as the previous channel versions. Either the channel moves
    /// to the new version or it is left untouched.
    fn write_channel(
        &self,
        channel: &str,
        contents: &ChannelContents,
        parents: &[CommitId],
    ) -> Result<CommitId>;
}

/// A fetch mapping from remote ref names to local ones, in git's
/// `[+]<src>:<dst>` form. Both sides may carry a single `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSpec {
    pub src: String,
    pub dst: String,
    pub force: bool,
}

impl RefSpec {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, force: bool) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            force,
        }
    }

    /// Map a source ref name to its destination, if this refspec covers it.
    pub fn transform(&self, name: &str) -> Option<String> {
        match (self.src.split_once('*'), self.dst.split_once('*')) {
            (Some(_), Some((dst_prefix, dst_suffix))) => {
                let matched = wildcard_capture(&self.src, name)?;
                Some(format!("{dst_prefix}{matched}{dst_suffix}"))
            }
            (None, _) if self.src == name => Some(self.dst.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Display for RefSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.force {
            write!(f, "+")?;
        }
        write!(f, "{}:{}", self.src, self.dst)
    }
}

/// Whether `name` matches a ref pattern with at most one `*`.
/// As in git refspecs, `*` may span `/`.
pub fn ref_matches(pattern: &str, name: &str) -> bool {
    if pattern.contains('*') {
        wildcard_capture(pattern, name).is_some()
    } else {
        pattern == name
    }
}

fn wildcard_capture<'a>(pattern: &str, name: &'a str) -> Option<&'a str> {
    let (prefix, suffix) = pattern.split_once('*')?;
    let rest = name.strip_prefix(prefix)?;
    let matched = rest.strip_suffix(suffix)?;
    if matched.is_empty() {
        return None;
    }
    Some(matched)
}

/// Check a payload can be stored as a single record.
///
/// Records of one (channel, commit) entry are stored newline-separated, so a
/// record must be non-empty and free of newlines.
pub fn validate_record(channel: &str, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(StoreError::write(channel, "record is empty"));
    }
    if payload.contains(&b'\n') {
        return Err(StoreError::write(channel, "record contains a newline"));
    }
    Ok(())
}

/// Serialize the records of one entry.
pub fn encode_records(records: &[Bytes]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.iter().map(|r| r.len() + 1).sum());
    for record in records {
        out.extend_from_slice(record);
        out.push(b'\n');
    }
    out
}

/// Split stored entry content back into records. Blank lines are skipped.
pub fn decode_records(data: &[u8]) -> Vec<Bytes> {
    data.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(Bytes::copy_from_slice)
        .collect()
}
