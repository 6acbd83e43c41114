//! Atomic file I/O and checksum helpers.
//!
//! Repo files, GPG keyrings, and file resources are all written with the
//! temp-file + rename protocol: a crash at any point leaves either the old
//! complete file or the new complete file on disk, never a partial write.
//! Checksums are SHA-256 hex; desired-state checks compare a file's digest
//! against the digest computed at validate time.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The target path has no parent directory.
    #[error("path {} has no parent directory", path.display())]
    NoParentDirectory {
        /// Offending path.
        path: PathBuf,
    },

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// SHA-256 hex digest of a byte slice.
#[must_use]
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// SHA-256 hex digest of a file's contents.
///
/// # Errors
///
/// Returns [`FsError::Io`] if the file cannot be read.
pub fn file_checksum(path: &Path) -> Result<String, FsError> {
    let data = std::fs::read(path)
        .map_err(|e| FsError::io(format!("read {}", path.display()), e))?;
    Ok(checksum(&data))
}

/// Whether the file at `path` exists and its contents hash to `expected`.
///
/// A missing file is a clean mismatch, not an error.
///
/// # Errors
///
/// Returns [`FsError::Io`] for any failure other than the file not existing.
pub fn contents_match(path: &Path, expected: &str) -> Result<bool, FsError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "file not found");
            return Ok(false);
        }
        Err(e) => return Err(FsError::io(format!("read {}", path.display()), e)),
    };

    let actual = checksum(&data);
    if actual != expected {
        tracing::debug!(
            path = %path.display(),
            expected,
            actual,
            "checksum mismatch"
        );
        return Ok(false);
    }
    Ok(true)
}

/// Write `data` to `path` atomically via temp file + fsync + rename.
///
/// The parent directory is created if missing. On unix the final file is
/// chmod'd to 0644 so package managers can read it.
///
/// # Errors
///
/// Returns [`FsError`] if any filesystem operation fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsError> {
    let parent = path
        .parent()
        .ok_or_else(|| FsError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    std::fs::create_dir_all(parent)
        .map_err(|e| FsError::io(format!("create {}", parent.display()), e))?;

    // Temp file in the same directory so the rename stays on one filesystem.
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| FsError::io("write temp file", e))?;
    tmp.flush().map_err(|e| FsError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| FsError::io(format!("rename to {}", path.display()), e.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
            .map_err(|e| FsError::io(format!("chmod {}", path.display()), e))?;
    }

    Ok(())
}

/// Whether a path exists (files and directories alike).
#[must_use]
pub fn exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_stable() {
        // Digest of the empty input is a fixed vector.
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(checksum(b"abc").len(), 64);
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
    }

    #[test]
    fn test_atomic_write_and_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("file.txt");

        atomic_write(&path, b"hello\n").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello\n");
        assert!(contents_match(&path, &checksum(b"hello\n")).unwrap());
        assert!(!contents_match(&path, &checksum(b"other")).unwrap());

        // Overwrite is atomic and leaves the new contents.
        atomic_write(&path, b"world\n").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"world\n");
    }

    #[test]
    fn test_contents_match_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(!contents_match(&path, "whatever").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.list");
        atomic_write(&path, b"deb http://example stable main\n").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
