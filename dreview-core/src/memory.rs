//! In-memory history store
//!
//! A self-contained commit graph with refs, annotation channels and
//! in-process remotes. Channels are versioned the same way git notes are:
//! every append or merge creates a new version commit in the graph, and the
//! channel ref points at the latest one.
//!
//! Useful wherever an isolated repository context is needed (tests,
//! embedding), and for injecting write or transport failures.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::{Result, StoreError};
use crate::object::{ChannelContents, CommitId};
use crate::store::{HistoryStore, RefSpec, encode_records, ref_matches, validate_record};

const VERSION_MESSAGE: &str = "Notes added by dreview";

#[derive(Debug, Clone)]
struct CommitNode {
    parents: Vec<CommitId>,
    message: String,
    /// Local creation order; parents always sort before children.
    seq: u64,
}

/// A closed slice of a store: some refs, every commit reachable from them,
/// and the channel versions among those commits.
struct Bundle {
    refs: BTreeMap<String, CommitId>,
    commits: Vec<(CommitId, CommitNode)>,
    channels: Vec<(CommitId, ChannelContents)>,
}

#[derive(Default)]
struct Inner {
    commits: HashMap<CommitId, CommitNode>,
    refs: BTreeMap<String, CommitId>,
    /// Channel version commit -> full channel content at that version
    channels: HashMap<CommitId, ChannelContents>,
    remotes: HashMap<String, Weak<MemoryStore>>,
    clock: u64,
    fail_writes: bool,
    rejected_refs: HashSet<String>,
    offline: bool,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn require(&self, id: CommitId) -> Result<&CommitNode> {
        self.commits
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("commit {}", id)))
    }

    fn add_commit(
        &mut self,
        author: &str,
        parents: Vec<CommitId>,
        message: &str,
        payload: &[u8],
    ) -> CommitId {
        let seq = self.next_seq();
        let mut data = format!("{author}\0{seq}\0{message}\0").into_bytes();
        for parent in &parents {
            data.extend_from_slice(parent.as_bytes());
        }
        data.extend_from_slice(payload);
        let id = CommitId::from_data(&data);
        self.commits.insert(
            id,
            CommitNode {
                parents,
                message: message.to_string(),
                seq,
            },
        );
        id
    }

    fn add_version(
        &mut self,
        author: &str,
        contents: ChannelContents,
        parents: Vec<CommitId>,
    ) -> CommitId {
        let mut payload = Vec::new();
        for (commit, records) in &contents {
            payload.extend_from_slice(commit.as_bytes());
            payload.extend_from_slice(&encode_records(records));
        }
        let id = self.add_commit(author, parents, VERSION_MESSAGE, &payload);
        self.channels.insert(id, contents);
        id
    }

    fn ancestors(&self, id: CommitId) -> HashSet<CommitId> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(node) = self.commits.get(&next) {
                stack.extend(node.parents.iter().copied());
            }
        }
        seen
    }

    fn channel(&self, channel: &str) -> Option<&ChannelContents> {
        self.refs.get(channel).and_then(|tip| self.channels.get(tip))
    }

    fn check_writable(&self, name: &str) -> Result<()> {
        if self.fail_writes || self.rejected_refs.contains(name) {
            return Err(StoreError::write(name, "store is refusing writes"));
        }
        Ok(())
    }

    fn export(&self, select: impl Fn(&str) -> bool) -> Bundle {
        let refs: BTreeMap<String, CommitId> = self
            .refs
            .iter()
            .filter(|(name, _)| select(name))
            .map(|(name, id)| (name.clone(), *id))
            .collect();

        let mut reachable = HashSet::new();
        for tip in refs.values() {
            reachable.extend(self.ancestors(*tip));
        }
        let mut commits: Vec<(CommitId, CommitNode)> = reachable
            .iter()
            .filter_map(|id| self.commits.get(id).map(|node| (*id, node.clone())))
            .collect();
        commits.sort_by_key(|(_, node)| node.seq);

        let channels = reachable
            .iter()
            .filter_map(|id| self.channels.get(id).map(|c| (*id, c.clone())))
            .collect();

        Bundle { refs, commits, channels }
    }

    /// Copy a bundle's objects in, then apply ref updates all-or-nothing.
    fn import(
        &mut self,
        bundle: Bundle,
        updates: Vec<(String, CommitId, bool)>,
    ) -> std::result::Result<(), String> {
        for (id, node) in bundle.commits {
            if !self.commits.contains_key(&id) {
                let seq = self.next_seq();
                self.commits.insert(id, CommitNode { seq, ..node });
            }
        }
        for (id, contents) in bundle.channels {
            self.channels.entry(id).or_insert(contents);
        }

        if self.fail_writes {
            return Err("remote refused the update".to_string());
        }
        for (name, new, force) in &updates {
            if let Some(old) = self.refs.get(name) {
                if !force && old != new && !self.ancestors(*new).contains(old) {
                    return Err(format!("{name}: rejected (non-fast-forward)"));
                }
            }
        }
        for (name, new, _) in updates {
            self.refs.insert(name, new);
        }
        Ok(())
    }
}

/// In-memory implementation of [`HistoryStore`]
pub struct MemoryStore {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store. `name` identifies this replica in the
    /// commits it creates.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create an empty store behind an `Arc`, ready to be wired to remotes.
    pub fn shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend(format!("store '{}' lock poisoned", self.name)))
    }

    /// Create a history commit on top of `parents`.
    pub fn commit(&self, parents: &[CommitId], message: &str) -> Result<CommitId> {
        let mut inner = self.lock()?;
        for parent in parents {
            inner.require(*parent)?;
        }
        Ok(inner.add_commit(&self.name, parents.to_vec(), message, &[]))
    }

    /// Message of a commit
    pub fn commit_message(&self, id: CommitId) -> Result<String> {
        Ok(self.lock()?.require(id)?.message.clone())
    }

    /// Register `remote` under `name`. Only a weak handle is kept, so two
    /// stores may name each other.
    pub fn add_remote(&self, name: &str, remote: &Arc<MemoryStore>) -> Result<()> {
        self.lock()?
            .remotes
            .insert(name.to_string(), Arc::downgrade(remote));
        Ok(())
    }

    /// Remove a ref. Returns whether it existed.
    pub fn delete_ref(&self, name: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        inner.check_writable(name)?;
        Ok(inner.refs.remove(name).is_some())
    }

    /// Make every subsequent write fail with `StoreError::Write`.
    pub fn set_fail_writes(&self, fail: bool) -> Result<()> {
        self.lock()?.fail_writes = fail;
        Ok(())
    }

    /// Make every subsequent write to one ref fail.
    pub fn reject_writes_to(&self, name: &str) -> Result<()> {
        self.lock()?.rejected_refs.insert(name.to_string());
        Ok(())
    }

    /// Make this store unreachable to replicas that use it as a remote.
    pub fn set_offline(&self, offline: bool) -> Result<()> {
        self.lock()?.offline = offline;
        Ok(())
    }

    fn remote(&self, name: &str) -> Result<Arc<MemoryStore>> {
        let weak = self
            .lock()?
            .remotes
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::transport(name, "no such remote"))?;
        let remote = weak
            .upgrade()
            .ok_or_else(|| StoreError::transport(name, "remote store was dropped"))?;
        if remote.lock()?.offline {
            return Err(StoreError::transport(name, "remote is unreachable"));
        }
        Ok(remote)
    }
}

impl HistoryStore for MemoryStore {
    fn find_ref(&self, name: &str) -> Result<Option<CommitId>> {
        let inner = self.lock()?;
        if let Some(id) = inner.refs.get(name) {
            return Ok(Some(*id));
        }
        Ok(CommitId::from_hex(name)
            .ok()
            .filter(|id| inner.commits.contains_key(id)))
    }

    fn set_ref(&self, name: &str, target: CommitId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.check_writable(name)?;
        inner.require(target)?;
        inner.refs.insert(name.to_string(), target);
        Ok(())
    }

    fn is_ancestor(&self, ancestor: CommitId, descendant: CommitId) -> Result<bool> {
        let inner = self.lock()?;
        inner.require(ancestor)?;
        inner.require(descendant)?;
        Ok(inner.ancestors(descendant).contains(&ancestor))
    }

    fn merge_base(&self, a: CommitId, b: CommitId) -> Result<Option<CommitId>> {
        let inner = self.lock()?;
        inner.require(a)?;
        inner.require(b)?;
        let of_b = inner.ancestors(b);
        Ok(inner
            .ancestors(a)
            .into_iter()
            .filter(|id| of_b.contains(id))
            .max_by_key(|id| inner.commits.get(id).map(|n| n.seq).unwrap_or(0)))
    }

    fn commits_between(&self, from: Option<CommitId>, to: CommitId) -> Result<Vec<CommitId>> {
        let inner = self.lock()?;
        inner.require(to)?;
        let excluded = match from {
            Some(from) => {
                inner.require(from)?;
                inner.ancestors(from)
            }
            None => HashSet::new(),
        };

        let mut candidates: Vec<(&CommitId, &CommitNode)> = inner
            .ancestors(to)
            .difference(&excluded)
            .filter_map(|id| inner.commits.get_key_value(id))
            .collect();
        candidates.sort_by_key(|(_, node)| node.seq);

        let Some(from) = from else {
            return Ok(candidates.into_iter().map(|(id, _)| *id).collect());
        };
        // keep only commits on an ancestry path from `from`
        let mut on_path = HashSet::from([from]);
        let mut result = Vec::new();
        for (id, node) in candidates {
            if node.parents.iter().any(|p| on_path.contains(p)) {
                on_path.insert(*id);
                result.push(*id);
            }
        }
        Ok(result)
    }

    fn list_refs(&self, pattern: &str) -> Result<BTreeMap<String, CommitId>> {
        Ok(self
            .lock()?
            .refs
            .iter()
            .filter(|(name, _)| ref_matches(pattern, name))
            .map(|(name, id)| (name.clone(), *id))
            .collect())
    }

    fn contains_commit(&self, id: CommitId) -> Result<bool> {
        Ok(self.lock()?.commits.contains_key(&id))
    }

    fn fetch_channel(&self, remote: &str, refspec: &RefSpec) -> Result<()> {
        let source = self.remote(remote)?;
        let bundle = source.lock()?.export(|name| ref_matches(&refspec.src, name));
        let updates = bundle
            .refs
            .iter()
            .filter_map(|(name, id)| refspec.transform(name).map(|dst| (dst, *id, refspec.force)))
            .collect();
        self.lock()?
            .import(bundle, updates)
            .map_err(|reason| StoreError::transport(remote, reason))
    }

    fn list_remote_channel(
        &self,
        remote: &str,
        pattern: &str,
    ) -> Result<BTreeMap<String, CommitId>> {
        self.remote(remote)?.list_refs(pattern)
    }

    fn push_channel(&self, remote: &str, refs: &[String]) -> Result<()> {
        let target = self.remote(remote)?;
        let bundle = self.lock()?.export(|name| refs.iter().any(|r| r == name));
        if let Some(missing) = refs.iter().find(|r| !bundle.refs.contains_key(*r)) {
            return Err(StoreError::NotFound(missing.clone()));
        }
        let updates = bundle
            .refs
            .iter()
            .map(|(name, id)| (name.clone(), *id, false))
            .collect();
        target
            .lock()?
            .import(bundle, updates)
            .map_err(|reason| StoreError::transport(remote, reason))
    }

    fn read_channel_records(&self, channel: &str, commit: CommitId) -> Result<Vec<Bytes>> {
        Ok(self
            .lock()?
            .channel(channel)
            .and_then(|contents| contents.get(&commit))
            .cloned()
            .unwrap_or_default())
    }

    fn append_channel_record(&self, channel: &str, commit: CommitId, payload: &[u8]) -> Result<()> {
        validate_record(channel, payload)?;
        let mut inner = self.lock()?;
        inner.check_writable(channel)?;
        if !inner.commits.contains_key(&commit) {
            return Err(StoreError::write(channel, format!("unknown commit {}", commit)));
        }
        let parent = inner.refs.get(channel).copied();
        let mut contents = inner.channel(channel).cloned().unwrap_or_default();
        contents
            .entry(commit)
            .or_default()
            .push(Bytes::copy_from_slice(payload));
        let version = inner.add_version(&self.name, contents, parent.into_iter().collect());
        inner.refs.insert(channel.to_string(), version);
        Ok(())
    }

    fn list_channel_entries(&self, channel: &str) -> Result<Vec<CommitId>> {
        Ok(self
            .lock()?
            .channel(channel)
            .map(|contents| contents.keys().copied().collect())
            .unwrap_or_default())
    }

    fn write_channel(
        &self,
        channel: &str,
        contents: &ChannelContents,
        parents: &[CommitId],
    ) -> Result<CommitId> {
        for records in contents.values() {
            for record in records {
                validate_record(channel, record)?;
            }
        }
        let mut inner = self.lock()?;
        inner.check_writable(channel)?;
        if let Some(missing) = parents.iter().find(|p| !inner.commits.contains_key(*p)) {
            return Err(StoreError::write(channel, format!("unknown parent {}", missing)));
        }
        let kept = contents
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(commit, records)| (*commit, records.clone()))
            .collect();
        let version = inner.add_version(&self.name, kept, parents.to_vec());
        inner.refs.insert(channel.to_string(), version);
        Ok(version)
    }
}
