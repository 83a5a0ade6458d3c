//! DReview Core Library
//!
//! Distributed code review metadata kept next to the code it describes:
//! - Annotation log (append-only records attached to commits, per channel)
//! - Replication of channels between replicas (push, pull, union merge)
//! - Commit range resolution that survives rewritten history
//! - Repository state fingerprint
//! - History store abstraction with git and in-memory backends

pub mod object;
pub mod error;
pub mod store;
pub mod memory;
pub mod git;
pub mod annotations;
pub mod replication;
pub mod history;
pub mod fingerprint;
pub mod config;

pub use object::{ChannelContents, CommitId};
pub use error::{PushError, Result, StoreError, SyncError};
pub use store::{HistoryStore, RefSpec};
pub use memory::MemoryStore;
pub use git::GitStore;
pub use annotations::AnnotationLog;
pub use replication::{
    MergeOutcome, PullReport, PushReport, Replicator, remote_tracking_ref, union_records,
};
pub use history::HistoryResolver;
pub use fingerprint::{StateFingerprint, state_fingerprint};
pub use config::{ReviewConfig, channels};
