//! Path confinement.
//!
//! Two layers, both required. The lexical layer rejects paths that are
//! malformed on their face (absolute, traversal, NUL, blocked segments)
//! without touching the filesystem. The resolution layer expands symlinks
//! against the real workspace root and requires the result to be a strict
//! descendant, so a link planted inside the workspace cannot smuggle a
//! write outside it.
//!
//! Resolution is read-only and handles paths whose tail does not exist yet:
//! the deepest existing ancestor is canonicalized and the remaining
//! (lexically clean) components are appended, which is what lets an
//! approved write create a new file in a new directory.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::action::MAX_PATH_BYTES;

/// Path segments that are never acceptable in any proposed path.
pub const BLOCKED_SEGMENTS: &[&str] = &[".git", ".ssh"];

/// A confinement violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PathViolation {
    /// Empty or whitespace-only path.
    #[error("empty path")]
    Empty,

    /// Path contains a NUL byte.
    #[error("NUL byte in path")]
    NulByte,

    /// Path exceeds [`MAX_PATH_BYTES`].
    #[error("path longer than {MAX_PATH_BYTES} bytes")]
    TooLong,

    /// Absolute paths, home expansion, and drive prefixes are refused.
    #[error("path is not workspace-relative: {path}")]
    NotRelative {
        /// The offending path.
        path: String,
    },

    /// `..` traversal is refused before resolution even runs.
    #[error("path traversal: {path}")]
    Traversal {
        /// The offending path.
        path: String,
    },

    /// The path names a blocked segment such as `.git` or `.ssh`.
    #[error("blocked segment '{segment}' in path")]
    BlockedSegment {
        /// The blocked segment that matched.
        segment: String,
    },

    /// The resolved real path is not a strict descendant of the workspace.
    #[error("path escapes workspace: {path}")]
    Escapes {
        /// The offending path.
        path: String,
    },

    /// The resolved path is a device node or other non-regular special file.
    #[error("path resolves to a special file: {path}")]
    SpecialFile {
        /// The offending path.
        path: String,
    },
}

/// Validates a workspace-relative path without touching the filesystem.
///
/// # Errors
///
/// Returns the first [`PathViolation`] found.
pub fn lexical_check(path: &str) -> Result<(), PathViolation> {
    if path.trim().is_empty() {
        return Err(PathViolation::Empty);
    }
    if path.as_bytes().contains(&0) {
        return Err(PathViolation::NulByte);
    }
    if path.len() > MAX_PATH_BYTES {
        return Err(PathViolation::TooLong);
    }

    let normalized = path.replace('\\', "/");
    if normalized.starts_with('/') || normalized.starts_with('~') {
        return Err(PathViolation::NotRelative {
            path: path.to_string(),
        });
    }
    if let Some(first) = normalized.split('/').next() {
        if first.contains(':') {
            return Err(PathViolation::NotRelative {
                path: path.to_string(),
            });
        }
    }

    for segment in normalized.split('/') {
        if segment == ".." {
            return Err(PathViolation::Traversal {
                path: path.to_string(),
            });
        }
        if BLOCKED_SEGMENTS.contains(&segment) {
            return Err(PathViolation::BlockedSegment {
                segment: segment.to_string(),
            });
        }
    }

    Ok(())
}

/// True if any byte of `payload` is NUL.
#[must_use]
pub fn contains_nul(payload: &str) -> bool {
    payload.as_bytes().contains(&0)
}

/// Resolves `rel` against an already-canonicalized workspace root and
/// requires the result to be a strict descendant.
///
/// Symlinks along the existing portion of the path are expanded; the
/// not-yet-existing tail is appended lexically (it was already checked for
/// traversal). A symlink whose target lies outside the workspace, or a
/// dangling symlink, is a violation.
///
/// # Errors
///
/// Returns a [`PathViolation`] if the path is lexically invalid, resolves
/// outside the workspace, or resolves to a special file.
pub fn resolve_within(workspace_real: &Path, rel: &str) -> Result<PathBuf, PathViolation> {
    lexical_check(rel)?;

    let joined = workspace_real.join(rel);

    // Peel non-existent components off the tail.
    let mut existing = joined.clone();
    let mut pending: Vec<OsString> = Vec::new();
    while fs::symlink_metadata(&existing).is_err() {
        match existing.file_name() {
            Some(name) => {
                pending.push(name.to_os_string());
                existing.pop();
            },
            None => break,
        }
    }

    let real_prefix = fs::canonicalize(&existing).map_err(|_| PathViolation::Escapes {
        path: rel.to_string(),
    })?;

    let mut resolved = real_prefix;
    for component in pending.iter().rev() {
        resolved.push(component);
    }

    if resolved == workspace_real || !resolved.starts_with(workspace_real) {
        return Err(PathViolation::Escapes {
            path: rel.to_string(),
        });
    }

    if let Ok(meta) = fs::symlink_metadata(&resolved) {
        if is_special(&meta.file_type()) {
            return Err(PathViolation::SpecialFile {
                path: rel.to_string(),
            });
        }
    }

    Ok(resolved)
}

#[cfg(unix)]
fn is_special(file_type: &fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_block_device()
        || file_type.is_char_device()
        || file_type.is_fifo()
        || file_type.is_socket()
}

#[cfg(not(unix))]
fn is_special(file_type: &fs::FileType) -> bool {
    !(file_type.is_file() || file_type.is_dir() || file_type.is_symlink())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let real = fs::canonicalize(dir.path()).unwrap();
        (dir, real)
    }

    #[test]
    fn lexical_rejects_obvious_escapes() {
        assert!(matches!(
            lexical_check("../outside.txt"),
            Err(PathViolation::Traversal { .. })
        ));
        assert!(matches!(
            lexical_check("/etc/passwd"),
            Err(PathViolation::NotRelative { .. })
        ));
        assert!(matches!(
            lexical_check("~/x"),
            Err(PathViolation::NotRelative { .. })
        ));
        assert!(matches!(
            lexical_check("C:/windows"),
            Err(PathViolation::NotRelative { .. })
        ));
        assert!(matches!(lexical_check(""), Err(PathViolation::Empty)));
        assert!(matches!(
            lexical_check("a/../b"),
            Err(PathViolation::Traversal { .. })
        ));
    }

    #[test]
    fn lexical_rejects_blocked_segments() {
        assert!(matches!(
            lexical_check(".git/config"),
            Err(PathViolation::BlockedSegment { .. })
        ));
        assert!(matches!(
            lexical_check("nested/.ssh/id_rsa"),
            Err(PathViolation::BlockedSegment { .. })
        ));
        // A name merely containing ".git" is fine.
        assert!(lexical_check("src/gitlog.rs").is_ok());
    }

    #[test]
    fn lexical_rejects_nul_and_overlong() {
        assert!(matches!(
            lexical_check("a\0b"),
            Err(PathViolation::NulByte)
        ));
        let long = "a/".repeat(MAX_PATH_BYTES);
        assert!(matches!(lexical_check(&long), Err(PathViolation::TooLong)));
    }

    #[test]
    fn resolves_existing_file() {
        let (_dir, ws) = workspace();
        fs::create_dir(ws.join("src")).unwrap();
        fs::write(ws.join("src/a.py"), "x=1\n").unwrap();
        let resolved = resolve_within(&ws, "src/a.py").unwrap();
        assert_eq!(resolved, ws.join("src/a.py"));
    }

    #[test]
    fn resolves_nonexistent_tail() {
        let (_dir, ws) = workspace();
        let resolved = resolve_within(&ws, "new_dir/new_file.txt").unwrap();
        assert_eq!(resolved, ws.join("new_dir/new_file.txt"));
    }

    #[test]
    fn workspace_root_itself_is_not_a_valid_target() {
        let (_dir, ws) = workspace();
        assert!(matches!(
            resolve_within(&ws, "."),
            Err(PathViolation::Escapes { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_detected() {
        let (_dir, ws) = workspace();
        std::os::unix::fs::symlink("/etc", ws.join("out")).unwrap();
        let err = resolve_within(&ws, "out/x").unwrap_err();
        assert!(matches!(err, PathViolation::Escapes { .. }), "{err:?}");
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_rejected() {
        let (_dir, ws) = workspace();
        std::os::unix::fs::symlink("/nonexistent/target", ws.join("link")).unwrap();
        assert!(resolve_within(&ws, "link").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn internal_symlink_stays_confined() {
        let (_dir, ws) = workspace();
        fs::create_dir(ws.join("real")).unwrap();
        std::os::unix::fs::symlink(ws.join("real"), ws.join("alias")).unwrap();
        let resolved = resolve_within(&ws, "alias/file.txt").unwrap();
        assert_eq!(resolved, ws.join("real/file.txt"));
    }
}
