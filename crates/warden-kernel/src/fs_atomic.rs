//! Crash-safe file primitives.
//!
//! Two helpers used everywhere the kernel touches workspace or state
//! files:
//!
//! 1. [`atomic_write`]: temp file in the target's directory, fsync the
//!    data, rename over the final path, fsync the directory. A crash at
//!    any point leaves either the old complete file or the new complete
//!    file, never a torn one.
//! 2. [`bounded_read`]: refuses symlinks and non-regular files, checks
//!    size on the open handle, and caps the read so a hostile or corrupt
//!    file cannot exhaust memory.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors from atomic writes and bounded reads.
#[derive(Debug, Error)]
pub enum FsAtomicError {
    /// File exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds {max}")]
    FileTooLarge {
        /// Observed size.
        size: u64,
        /// Configured cap.
        max: u64,
    },

    /// The target is a symlink; following it is refused.
    #[error("refusing symlink at {}", path.display())]
    SymlinkRefused {
        /// The symlink path.
        path: std::path::PathBuf,
    },

    /// The target is not a regular file.
    #[error("not a regular file: {}", path.display())]
    NotRegularFile {
        /// The offending path.
        path: std::path::PathBuf,
    },

    /// The target path has no parent directory.
    #[error("path has no parent directory: {}", path.display())]
    NoParent {
        /// The offending path.
        path: std::path::PathBuf,
    },

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An underlying I/O failure.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What was being attempted.
        context: &'static str,
        /// The OS error.
        #[source]
        source: std::io::Error,
    },
}

fn io_err(context: &'static str) -> impl FnOnce(std::io::Error) -> FsAtomicError {
    move |source| FsAtomicError::Io { context, source }
}

/// Writes `data` to `path` via the temp + fsync + rename protocol.
///
/// # Errors
///
/// Returns [`FsAtomicError`] if any step of the protocol fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsAtomicError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).ok_or_else(|| {
        FsAtomicError::NoParent {
            path: path.to_path_buf(),
        }
    })?;
    fs::create_dir_all(parent).map_err(io_err("create parent directory"))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err("create temp file"))?;
    tmp.write_all(data).map_err(io_err("write temp file"))?;
    tmp.flush().map_err(io_err("flush temp file"))?;
    tmp.as_file()
        .sync_all()
        .map_err(io_err("fsync temp file"))?;
    tmp.persist(path)
        .map_err(|e| FsAtomicError::Io {
            context: "rename temp file",
            source: e.error,
        })?;

    fsync_dir(parent)
}

/// Serializes `value` as JSON and writes it atomically.
///
/// # Errors
///
/// Returns [`FsAtomicError`] on serialization or I/O failure.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsAtomicError> {
    let json = serde_json::to_vec(value)?;
    atomic_write(path, &json)
}

/// Reads up to `max_size` bytes from a regular, non-symlinked file.
///
/// # Errors
///
/// Returns [`FsAtomicError`] if the path is a symlink, not a regular file,
/// over the cap, or unreadable.
pub fn bounded_read(path: &Path, max_size: u64) -> Result<Vec<u8>, FsAtomicError> {
    let meta = fs::symlink_metadata(path).map_err(io_err("stat file"))?;
    if meta.file_type().is_symlink() {
        return Err(FsAtomicError::SymlinkRefused {
            path: path.to_path_buf(),
        });
    }
    if !meta.is_file() {
        return Err(FsAtomicError::NotRegularFile {
            path: path.to_path_buf(),
        });
    }
    if meta.len() > max_size {
        return Err(FsAtomicError::FileTooLarge {
            size: meta.len(),
            max: max_size,
        });
    }

    let file = File::open(path).map_err(io_err("open file"))?;
    let mut buf = Vec::with_capacity(usize::try_from(meta.len()).unwrap_or(0));
    file.take(max_size.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(io_err("bounded read"))?;

    // The file may have grown between stat and read.
    if buf.len() as u64 > max_size {
        return Err(FsAtomicError::FileTooLarge {
            size: buf.len() as u64,
            max: max_size,
        });
    }
    Ok(buf)
}

/// Reads and deserializes a JSON state file with a size cap.
///
/// # Errors
///
/// Returns [`FsAtomicError`] on read or parse failure.
pub fn bounded_read_json<T: DeserializeOwned>(
    path: &Path,
    max_size: u64,
) -> Result<T, FsAtomicError> {
    let bytes = bounded_read(path, max_size)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Fsyncs a directory so a completed rename is durable.
///
/// # Errors
///
/// Returns [`FsAtomicError`] if the directory cannot be opened or synced.
pub fn fsync_dir(dir: &Path) -> Result<(), FsAtomicError> {
    let handle = File::open(dir).map_err(io_err("open directory"))?;
    handle.sync_all().map_err(io_err("fsync directory"))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Probe {
        n: u64,
        tag: String,
    }

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let probe = Probe {
            n: 7,
            tag: "x".to_string(),
        };
        atomic_write_json(&path, &probe).unwrap();
        let back: Probe = bounded_read_json(&path, 1024).unwrap();
        assert_eq!(back, probe);
    }

    #[test]
    fn atomic_write_replaces_whole_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        atomic_write(&path, b"first version, long").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn atomic_write_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");
        atomic_write(&path, b"deep").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "deep");
    }

    #[test]
    fn bounded_read_enforces_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        fs::write(&path, vec![0u8; 300]).unwrap();

        assert!(bounded_read(&path, 300).is_ok());
        assert!(matches!(
            bounded_read(&path, 299),
            Err(FsAtomicError::FileTooLarge { size: 300, max: 299 })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn bounded_read_refuses_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.txt");
        let link = dir.path().join("link.txt");
        fs::write(&target, "content").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(matches!(
            bounded_read(&link, 1024),
            Err(FsAtomicError::SymlinkRefused { .. })
        ));
    }

    #[test]
    fn bounded_read_refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            bounded_read(dir.path(), 1024),
            Err(FsAtomicError::NotRegularFile { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn overwrite_through_symlink_replaces_the_link_not_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let sensitive = dir.path().join("sensitive.txt");
        let state = dir.path().join("state.txt");
        fs::write(&sensitive, "keep me").unwrap();
        std::os::unix::fs::symlink(&sensitive, &state).unwrap();

        atomic_write(&state, b"new state").unwrap();

        assert_eq!(fs::read_to_string(&sensitive).unwrap(), "keep me");
        assert!(!fs::symlink_metadata(&state).unwrap().file_type().is_symlink());
    }
}
