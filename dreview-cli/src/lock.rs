//! Repository lock for commands that write channels.
//!
//! Core operations assume a single writer per repository. The lock is a file
//! at `<git dir>/dreview.lock` created exclusively and holding a
//! `host:pid:timestamp` token; it is removed when the guard drops.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_FILE: &str = "dreview.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Repository is already locked by: {holder}")]
    Held { holder: String },

    #[error("Failed to create lock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held repository lock
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
    token: String,
}

impl RepoLock {
    pub fn acquire(git_dir: &Path) -> Result<Self, LockError> {
        let path = git_dir.join(LOCK_FILE);
        let token = format!(
            "{}:{}:{}",
            hostname(),
            std::process::id(),
            chrono::Utc::now().timestamp()
        );

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(LockError::Held { holder });
            }
            Err(source) => return Err(LockError::Io { path, source }),
        };
        if let Err(source) = file.write_all(token.as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(LockError::Io { path, source });
        }

        debug!(path = ?path, token = %token, "Acquired repository lock");
        Ok(Self { path, token })
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "Failed to remove repository lock");
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}
