//! Core identifiers for dreview
//!
//! Commits are owned by the underlying object store; dreview only ever
//! refers to them by their content address.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Width of a commit identifier in bytes (SHA-1 object ids).
pub const COMMIT_ID_LEN: usize = 20;

/// Content address of a commit in the history graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitId([u8; COMMIT_ID_LEN]);

impl CommitId {
    /// Create a new CommitId from raw bytes
    pub fn new(bytes: [u8; COMMIT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a byte slice, if it has the right width
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; COMMIT_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Compute a CommitId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; COMMIT_ID_LEN] {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for CommitId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Everything stored under one channel: annotated commit -> records.
///
/// Records keep the order the store reports them in.
pub type ChannelContents = BTreeMap<CommitId, Vec<Bytes>>;
