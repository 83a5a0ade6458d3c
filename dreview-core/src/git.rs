//! Git-backed history store
//!
//! Channels are git notes refs (`refs/notes/...`): the note attached to a
//! commit holds that commit's records, one per line. Merged channel
//! versions are written as a fresh notes tree and commit, and the notes ref
//! is moved only once everything else is in the object database.

use bytes::Bytes;
use git2::{
    Cred, Direction, ErrorCode, FetchOptions, ObjectType, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature, Sort,
};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::object::{ChannelContents, CommitId};
use crate::store::{
    HistoryStore, RefSpec, decode_records, encode_records, ref_matches, validate_record,
};

const MERGE_MESSAGE: &str = "Notes merged by dreview";
const APPEND_MESSAGE: &str = "Notes added by dreview";
const FILE_MODE_BLOB: i32 = 0o100644;

fn to_oid(id: CommitId) -> Result<Oid> {
    Ok(Oid::from_bytes(id.as_bytes())?)
}

fn to_commit_id(oid: Oid) -> Result<CommitId> {
    CommitId::from_slice(oid.as_bytes())
        .ok_or_else(|| StoreError::Backend(format!("unsupported object id width: {}", oid)))
}

fn is_absent(e: &git2::Error) -> bool {
    matches!(
        e.code(),
        ErrorCode::NotFound | ErrorCode::InvalidSpec | ErrorCode::UnbornBranch
    )
}

/// [`HistoryStore`] over a git repository, via libgit2
pub struct GitStore {
    repo: Mutex<Repository>,
    git_dir: PathBuf,
}

impl GitStore {
    /// Open the repository at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_repository(Repository::open(path)?))
    }

    /// Find the repository containing `path`.
    pub fn discover(path: &Path) -> Result<Self> {
        Ok(Self::from_repository(Repository::discover(path)?))
    }

    pub fn from_repository(repo: Repository) -> Self {
        let git_dir = repo.path().to_path_buf();
        Self {
            repo: Mutex::new(repo),
            git_dir,
        }
    }

    /// The `.git` directory.
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    fn repo(&self) -> Result<MutexGuard<'_, Repository>> {
        self.repo
            .lock()
            .map_err(|_| StoreError::Backend("repository lock poisoned".to_string()))
    }

    /// The ref HEAD points at, or `None` when HEAD is detached.
    pub fn head_ref(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = repo.find_reference("HEAD")?;
        Ok(head.symbolic_target().map(str::to_string))
    }

    /// Full message of a commit.
    pub fn commit_message(&self, id: CommitId) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.find_commit(to_oid(id)?)?;
        Ok(String::from_utf8_lossy(commit.message_bytes()).into_owned())
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        match repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Ok(Signature::now("dreview", "dreview@localhost")?),
        }
    }
}

impl HistoryStore for GitStore {
    fn find_ref(&self, name: &str) -> Result<Option<CommitId>> {
        let repo = self.repo()?;
        let object = match repo.revparse_single(name) {
            Ok(object) => object,
            Err(e) if is_absent(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match object.peel_to_commit() {
            Ok(commit) => Ok(Some(to_commit_id(commit.id())?)),
            Err(e) if is_absent(&e) || e.code() == ErrorCode::Peel => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_ref(&self, name: &str, target: CommitId) -> Result<()> {
        let repo = self.repo()?;
        repo.reference(name, to_oid(target)?, true, "dreview: update ref")
            .map_err(|e| StoreError::write(name, e.message()))?;
        Ok(())
    }

    fn is_ancestor(&self, ancestor: CommitId, descendant: CommitId) -> Result<bool> {
        if ancestor == descendant {
            return Ok(true);
        }
        let repo = self.repo()?;
        Ok(repo.graph_descendant_of(to_oid(descendant)?, to_oid(ancestor)?)?)
    }

    fn merge_base(&self, a: CommitId, b: CommitId) -> Result<Option<CommitId>> {
        let repo = self.repo()?;
        match repo.merge_base(to_oid(a)?, to_oid(b)?) {
            Ok(base) => Ok(Some(to_commit_id(base)?)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn commits_between(&self, from: Option<CommitId>, to: CommitId) -> Result<Vec<CommitId>> {
        let repo = self.repo()?;
        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME | Sort::REVERSE)?;
        walk.push(to_oid(to)?)?;

        let Some(from) = from else {
            return walk.map(|oid| to_commit_id(oid?)).collect();
        };
        let from = to_oid(from)?;
        walk.hide(from)?;

        // --ancestry-path: keep commits descending from `from`
        let mut on_path = HashSet::from([from]);
        let mut result = Vec::new();
        for oid in walk {
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            if commit.parent_ids().any(|p| on_path.contains(&p)) {
                on_path.insert(oid);
                result.push(to_commit_id(oid)?);
            }
        }
        Ok(result)
    }

    fn list_refs(&self, pattern: &str) -> Result<BTreeMap<String, CommitId>> {
        let repo = self.repo()?;
        let mut refs = BTreeMap::new();
        for reference in repo.references()? {
            let reference = reference?;
            let Some(name) = reference.name() else {
                continue;
            };
            if !ref_matches(pattern, name) {
                continue;
            }
            let target = match reference.target() {
                Some(target) => target,
                None => match reference.resolve().ok().and_then(|r| r.target()) {
                    Some(target) => target,
                    None => continue,
                },
            };
            refs.insert(name.to_string(), to_commit_id(target)?);
        }
        Ok(refs)
    }

    fn contains_commit(&self, id: CommitId) -> Result<bool> {
        let repo = self.repo()?;
        match repo.find_object(to_oid(id)?, None) {
            Ok(object) => Ok(object.kind() == Some(ObjectType::Commit)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn fetch_channel(&self, remote: &str, refspec: &RefSpec) -> Result<()> {
        let repo = self.repo()?;
        let mut handle = repo
            .find_remote(remote)
            .map_err(|e| StoreError::transport(remote, e.message()))?;
        debug!(remote, refspec = %refspec, "Fetching");
        let mut options = FetchOptions::new();
        options.remote_callbacks(remote_callbacks(&repo));
        handle
            .fetch(&[refspec.to_string()], Some(&mut options), None)
            .map_err(|e| StoreError::transport(remote, e.message()))
    }

    fn list_remote_channel(
        &self,
        remote: &str,
        pattern: &str,
    ) -> Result<BTreeMap<String, CommitId>> {
        let repo = self.repo()?;
        let mut handle = repo
            .find_remote(remote)
            .map_err(|e| StoreError::transport(remote, e.message()))?;
        let connection = handle
            .connect_auth(Direction::Fetch, Some(remote_callbacks(&repo)), None)
            .map_err(|e| StoreError::transport(remote, e.message()))?;
        let mut refs = BTreeMap::new();
        for head in connection.list()? {
            if ref_matches(pattern, head.name()) {
                refs.insert(head.name().to_string(), to_commit_id(head.oid())?);
            }
        }
        Ok(refs)
    }

    fn push_channel(&self, remote: &str, refs: &[String]) -> Result<()> {
        let repo = self.repo()?;
        let mut handle = repo
            .find_remote(remote)
            .map_err(|e| StoreError::transport(remote, e.message()))?;
        let specs: Vec<String> = refs.iter().map(|r| format!("{r}:{r}")).collect();

        let mut rejected = Vec::new();
        {
            let mut callbacks = remote_callbacks(&repo);
            callbacks.push_update_reference(|name, status| {
                if let Some(status) = status {
                    rejected.push(format!("{name}: {status}"));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            handle
                .push(&specs, Some(&mut options))
                .map_err(|e| StoreError::transport(remote, e.message()))?;
        }
        if !rejected.is_empty() {
            return Err(StoreError::transport(remote, rejected.join(", ")));
        }
        Ok(())
    }

    fn read_channel_records(&self, channel: &str, commit: CommitId) -> Result<Vec<Bytes>> {
        let repo = self.repo()?;
        match repo.find_note(Some(channel), to_oid(commit)?) {
            Ok(note) => Ok(decode_records(repo.find_blob(note.id())?.content())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn append_channel_record(&self, channel: &str, commit: CommitId, payload: &[u8]) -> Result<()> {
        validate_record(channel, payload)?;
        let repo = self.repo()?;
        repo.find_commit(to_oid(commit)?)
            .map_err(|_| StoreError::write(channel, format!("unknown commit {}", commit)))?;

        let mut contents = read_notes(&repo, channel)?;
        contents
            .entry(commit)
            .or_default()
            .push(Bytes::copy_from_slice(payload));

        let parents = match repo.refname_to_id(channel) {
            Ok(tip) => vec![repo
                .find_commit(tip)
                .map_err(|e| StoreError::write(channel, e.message()))?],
            Err(e) if e.code() == ErrorCode::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        commit_notes(&repo, channel, &contents, &parents, APPEND_MESSAGE)?;
        Ok(())
    }

    fn list_channel_entries(&self, channel: &str) -> Result<Vec<CommitId>> {
        let repo = self.repo()?;
        let notes = match repo.notes(Some(channel)) {
            Ok(notes) => notes,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for note in notes {
            let (_note_id, annotated) = note?;
            entries.push(to_commit_id(annotated)?);
        }
        Ok(entries)
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
        let repo = self.repo()?;
        let mut parent_commits = Vec::with_capacity(parents.len());
        for parent in parents {
            let commit = repo
                .find_commit(to_oid(*parent)?)
                .map_err(|e| StoreError::write(channel, e.message()))?;
            parent_commits.push(commit);
        }
        let version = commit_notes(&repo, channel, contents, &parent_commits, MERGE_MESSAGE)?;
        to_commit_id(version)
    }
}

/// Callbacks for talking to remotes: ssh agent keys, then git credential
/// helpers, then libgit2's defaults.
fn remote_callbacks<'a>(repo: &Repository) -> RemoteCallbacks<'a> {
    let config = repo.config().ok();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        if allowed.is_ssh_key() {
            if let Some(user) = username_from_url {
                return Cred::ssh_key_from_agent(user);
            }
        }
        if allowed.is_user_pass_plaintext() {
            if let Some(config) = &config {
                if let Ok(cred) = Cred::credential_helper(config, url, username_from_url) {
                    return Ok(cred);
                }
            }
        }
        Cred::default()
    });
    callbacks
}

/// Every note under `channel`, read as raw blob bytes.
fn read_notes(repo: &Repository, channel: &str) -> Result<ChannelContents> {
    let notes = match repo.notes(Some(channel)) {
        Ok(notes) => notes,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(ChannelContents::new()),
        Err(e) => return Err(e.into()),
    };
    let mut contents = ChannelContents::new();
    for note in notes {
        let (blob, annotated) = note?;
        let records = decode_records(repo.find_blob(blob)?.content());
        if !records.is_empty() {
            contents.insert(to_commit_id(annotated)?, records);
        }
    }
    Ok(contents)
}

/// Write `contents` as a flat notes tree, commit it on top of `parents`
/// and point `channel` at the new commit. The ref is the last thing
/// touched, so a failure leaves the channel where it was.
fn commit_notes(
    repo: &Repository,
    channel: &str,
    contents: &ChannelContents,
    parents: &[git2::Commit<'_>],
    message: &str,
) -> Result<Oid> {
    let write_err = |e: git2::Error| StoreError::write(channel, e.message());

    let mut builder = repo.treebuilder(None).map_err(write_err)?;
    for (commit, records) in contents {
        if records.is_empty() {
            continue;
        }
        let blob = repo.blob(&encode_records(records)).map_err(write_err)?;
        builder
            .insert(commit.to_hex(), blob, FILE_MODE_BLOB)
            .map_err(write_err)?;
    }
    let tree = repo
        .find_tree(builder.write().map_err(write_err)?)
        .map_err(write_err)?;

    let sig = GitStore::signature(repo)?;
    let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
    let version = repo
        .commit(None, &sig, &sig, message, &tree, &parent_refs)
        .map_err(write_err)?;
    repo.reference(channel, version, true, message)
        .map_err(write_err)?;
    Ok(version)
}
