//! Repository state fingerprint
//!
//! A digest over every ref and its target, for cheap "has anything changed
//! since last time" checks. Not a security primitive.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::object::CommitId;
use crate::store::HistoryStore;

/// Pattern covering every ref in a repository.
pub const ALL_REFS: &str = "refs/*";

/// Hex SHA-1 digest of a repository's ref state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateFingerprint(String);

impl StateFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Render refs as `<id> <name>` lines sorted by name, the text form of
/// `git show-ref`.
pub fn summarize_refs(refs: &BTreeMap<String, CommitId>) -> String {
    refs.iter()
        .map(|(name, id)| format!("{} {}", id, name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fingerprint a set of refs.
pub fn fingerprint_refs(refs: &BTreeMap<String, CommitId>) -> StateFingerprint {
    let digest = Sha1::digest(summarize_refs(refs).as_bytes());
    StateFingerprint(hex::encode(digest))
}

/// Fingerprint the current ref state of `store`.
pub fn state_fingerprint(store: &dyn HistoryStore) -> Result<StateFingerprint> {
    Ok(fingerprint_refs(&store.list_refs(ALL_REFS)?))
}
