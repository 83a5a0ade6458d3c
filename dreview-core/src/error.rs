//! Error types for dreview
//!
//! `StoreError` is what the object store adapter reports. The replication
//! engine wraps it into `PushError` (recoverable, pull and retry) or
//! `SyncError` (fatal for one channel's pull).

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by a [`HistoryStore`](crate::store::HistoryStore)
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A ref or commit does not exist locally.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store rejected a write.
    #[error("store rejected write to {channel}: {reason}")]
    Write { channel: String, reason: String },

    /// The remote was unreachable or refused the request.
    #[error("remote '{remote}': {reason}")]
    Transport { remote: String, reason: String },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

impl StoreError {
    pub(crate) fn write(channel: &str, reason: impl Into<String>) -> Self {
        StoreError::Write {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(remote: &str, reason: impl std::fmt::Display) -> Self {
        StoreError::Transport {
            remote: remote.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this is the "absence is normal" case.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Git(e) => e.code() == git2::ErrorCode::NotFound,
            _ => false,
        }
    }
}

/// Push to a remote failed; usually the local view is stale and the
/// caller should pull before retrying.
#[derive(Debug, thiserror::Error)]
#[error("failed to push to the remote '{remote}': {source}")]
pub struct PushError {
    pub remote: String,
    #[source]
    pub source: StoreError,
}

/// Fetching or merging a channel from a remote failed. The local channel
/// is left as it was before the pull.
#[derive(Debug, thiserror::Error)]
#[error("failed to sync {channel} from the remote '{remote}': {source}")]
pub struct SyncError {
    pub remote: String,
    pub channel: String,
    #[source]
    pub source: StoreError,
}
