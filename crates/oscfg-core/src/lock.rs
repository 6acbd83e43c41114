//! Singleton process lock.
//!
//! The agent holds an OS-level advisory lock for its whole lifetime so that
//! at most one instance mutates the host. A second instance fails fast at
//! startup instead of racing the first over package databases and repo
//! files. The lock must be released on every exit path; callers register
//! [`SingletonLock::release`] on the deferred-cleanup stack.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

/// Errors acquiring the singleton lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another agent process already holds the lock.
    #[error("another agent instance holds the lock at {}", path.display())]
    Contended {
        /// Lock file path.
        path: PathBuf,
    },

    /// The lock file could not be created or locked.
    #[error("lock file {}: {source}", path.display())]
    Io {
        /// Lock file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Default platform lock path.
#[must_use]
pub fn default_lock_path() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/var/run/oscfg_agent.lock")
    } else {
        std::env::temp_dir().join("oscfg_agent.lock")
    }
}

/// An acquired exclusive advisory lock.
///
/// Dropping the handle releases the lock, but exit paths should call
/// [`release`](Self::release) explicitly so the unlock is ordered with the
/// rest of the deferred cleanups.
#[derive(Debug)]
pub struct SingletonLock {
    file: Option<File>,
    path: PathBuf,
}

impl SingletonLock {
    /// Acquire the lock at `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// [`LockError::Contended`] if another process holds the lock;
    /// [`LockError::Io`] for any other failure.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file: Some(file),
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(LockError::Contended {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Release the lock.
    ///
    /// Idempotent; errors are logged, not returned, because release runs on
    /// exit paths that cannot recover anyway.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to unlock");
            }
        }
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        self.release();
    }
}
