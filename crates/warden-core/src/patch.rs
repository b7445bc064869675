//! Unified-diff safety scanning.
//!
//! Before the gate will sign off on an `APPLY_PATCH`, the diff text is
//! scanned to enumerate every path it would touch (old side, new side,
//! rename targets) and to measure what it adds. The scanner is strict
//! where git is lenient: binary patches, missing `a/`/`b/` prefixes,
//! executable-bit introduction, and modes outside the plain-file set are
//! all hard rejections. Confinement of the extracted paths against the
//! workspace is the gate's job; this module is purely lexical.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static DIFF_GIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git (\S+) (\S+)\s*$").expect("static regex"));
static BINARY_FILES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Binary files .* differ\s*$").expect("static regex"));

/// The only file modes a patch may carry.
pub const ALLOWED_MODES: &[&str] = &["100644", "100755"];

/// Plain non-executable file mode; the only mode a patch may *introduce*.
pub const PLAIN_FILE_MODE: &str = "100644";

/// Hard limits applied while scanning a diff.
#[derive(Clone, Copy, Debug)]
pub struct PatchLimits {
    /// Maximum number of files one diff may touch.
    pub max_files: usize,
    /// Maximum added-plus-removed line count.
    pub max_changed_lines: u64,
    /// Maximum estimated added bytes.
    pub max_added_bytes: u64,
}

/// A scanning failure; the gate maps these onto decision reasons.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PatchError {
    /// A file header began but never completed.
    #[error("unterminated diff header near line {line}")]
    UnterminatedHeader {
        /// 1-based line number of the offending header.
        line: usize,
    },

    /// A `---`/`+++` path lacked the `a/`/`b/` prefix.
    #[error("diff path missing a/ or b/ prefix: {path}")]
    MissingPrefix {
        /// The raw path text.
        path: String,
    },

    /// The diff contains a binary patch.
    #[error("binary patches are refused")]
    BinaryPatch,

    /// A mode line carried a forbidden mode.
    #[error("forbidden file mode {mode}")]
    BadMode {
        /// The mode string as written.
        mode: String,
    },

    /// `--- /dev/null` appeared without a `new file mode` header.
    #[error("new file without 'new file mode' header")]
    MissingNewFileMode,

    /// The diff contains no file headers at all.
    #[error("diff contains no file headers")]
    NoFiles,

    /// More files than [`PatchLimits::max_files`].
    #[error("diff touches {count} files, more than allowed")]
    TooManyFiles {
        /// Observed file count.
        count: usize,
    },

    /// More changed lines than [`PatchLimits::max_changed_lines`].
    #[error("diff changes {count} lines, more than allowed")]
    TooManyChangedLines {
        /// Observed changed-line count.
        count: u64,
    },

    /// More added bytes than [`PatchLimits::max_added_bytes`].
    #[error("diff adds {bytes} bytes, more than allowed")]
    AddedBytesExceeded {
        /// Observed added bytes.
        bytes: u64,
    },
}

/// One file touched by a diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Pre-image path, absent for created files.
    pub old_path: Option<String>,
    /// Post-image path, absent for deleted files.
    pub new_path: Option<String>,
    /// True when the file is created by this diff.
    pub created: bool,
    /// True when the file is deleted by this diff.
    pub deleted: bool,
}

/// What a diff would do, as measured by the scanner.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PatchSummary {
    /// Files touched, in diff order.
    pub files: Vec<FileChange>,
    /// Estimated bytes added (lengths of `+` lines).
    pub added_bytes: u64,
    /// Added plus removed line count.
    pub changed_lines: u64,
}

impl PatchSummary {
    /// Every workspace-relative path the diff references, deduplicated.
    #[must_use]
    pub fn touched_paths(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for f in &self.files {
            if let Some(p) = &f.old_path {
                out.insert(p.as_str());
            }
            if let Some(p) = &f.new_path {
                out.insert(p.as_str());
            }
        }
        out
    }
}

#[derive(Debug, Default)]
struct Block {
    header_line: usize,
    old: Option<Side>,
    new: Option<Side>,
    rename_from: Option<String>,
    rename_to: Option<String>,
    new_file_mode: Option<String>,
    deleted_file: bool,
    saw_body: bool,
    from_git_header: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Side {
    DevNull,
    Path(String),
}

fn strip_side(raw: &str) -> Result<Side, PatchError> {
    let raw = raw.trim();
    // git appends a tab + timestamp in some diff styles; keep the first field.
    let raw = raw.split('\t').next().unwrap_or(raw);
    if raw == "/dev/null" {
        return Ok(Side::DevNull);
    }
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .map(|p| Side::Path(p.to_string()))
        .ok_or_else(|| PatchError::MissingPrefix {
            path: raw.to_string(),
        })
}

fn check_mode(mode: &str, may_be_executable: bool) -> Result<(), PatchError> {
    if !ALLOWED_MODES.contains(&mode) {
        return Err(PatchError::BadMode {
            mode: mode.to_string(),
        });
    }
    if !may_be_executable && mode != PLAIN_FILE_MODE {
        return Err(PatchError::BadMode {
            mode: mode.to_string(),
        });
    }
    Ok(())
}

fn finalize(block: Block, files: &mut Vec<FileChange>) -> Result<(), PatchError> {
    // Rename blocks carry authoritative raw paths and may have no hunks.
    if block.rename_from.is_some() || block.rename_to.is_some() {
        let (Some(from), Some(to)) = (block.rename_from, block.rename_to) else {
            return Err(PatchError::UnterminatedHeader {
                line: block.header_line,
            });
        };
        files.push(FileChange {
            old_path: Some(from),
            new_path: Some(to),
            created: false,
            deleted: false,
        });
        return Ok(());
    }

    let created = block.new_file_mode.is_some() || block.old == Some(Side::DevNull);
    if block.old == Some(Side::DevNull) && block.new_file_mode.is_none() {
        return Err(PatchError::MissingNewFileMode);
    }

    let deleted = block.deleted_file || block.new == Some(Side::DevNull);

    match (&block.old, &block.new) {
        (None, None) | (Some(_), None) | (None, Some(_)) => Err(PatchError::UnterminatedHeader {
            line: block.header_line,
        }),
        (Some(old), Some(new)) => {
            let old_path = match old {
                Side::DevNull => None,
                Side::Path(p) => Some(p.clone()),
            };
            let new_path = match new {
                Side::DevNull => None,
                Side::Path(p) => Some(p.clone()),
            };
            if old_path.is_none() && new_path.is_none() {
                return Err(PatchError::UnterminatedHeader {
                    line: block.header_line,
                });
            }
            files.push(FileChange {
                old_path,
                new_path,
                created,
                deleted,
            });
            Ok(())
        },
    }
}

/// Scans a unified diff, enumerating touched files and enforcing limits.
///
/// # Errors
///
/// Returns a [`PatchError`] describing the first rule the diff breaks.
#[allow(clippy::too_many_lines)]
pub fn scan(diff: &str, limits: &PatchLimits) -> Result<PatchSummary, PatchError> {
    let mut summary = PatchSummary::default();
    let mut block: Option<Block> = None;
    let mut expecting_new_side = false;

    for (idx, line) in diff.lines().enumerate() {
        let lineno = idx + 1;

        if line.starts_with("GIT binary patch") || BINARY_FILES_RE.is_match(line) {
            return Err(PatchError::BinaryPatch);
        }

        if let Some(caps) = DIFF_GIT_RE.captures(line) {
            if expecting_new_side {
                return Err(PatchError::UnterminatedHeader {
                    line: lineno.saturating_sub(1),
                });
            }
            if let Some(prev) = block.take() {
                finalize(prev, &mut summary.files)?;
            }
            let mut fresh = Block {
                header_line: lineno,
                from_git_header: true,
                ..Block::default()
            };
            // Header paths are provisional; `---`/`+++`/rename lines refine
            // them. They still must carry the prefixes.
            fresh.old = Some(strip_side(&caps[1])?);
            fresh.new = Some(strip_side(&caps[2])?);
            block = Some(fresh);
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            if expecting_new_side {
                return Err(PatchError::UnterminatedHeader {
                    line: lineno.saturating_sub(1),
                });
            }
            let side = strip_side(rest)?;
            match &mut block {
                Some(b) if b.from_git_header && !b.saw_body => {
                    b.old = Some(side);
                },
                _ => {
                    if let Some(prev) = block.take() {
                        finalize(prev, &mut summary.files)?;
                    }
                    block = Some(Block {
                        header_line: lineno,
                        old: Some(side),
                        ..Block::default()
                    });
                },
            }
            expecting_new_side = true;
            continue;
        }

        if let Some(rest) = line.strip_prefix("+++ ") {
            let Some(b) = &mut block else {
                return Err(PatchError::UnterminatedHeader { line: lineno });
            };
            if !expecting_new_side && !b.from_git_header {
                return Err(PatchError::UnterminatedHeader { line: lineno });
            }
            b.new = Some(strip_side(rest)?);
            expecting_new_side = false;
            continue;
        }

        if expecting_new_side {
            return Err(PatchError::UnterminatedHeader {
                line: lineno.saturating_sub(1),
            });
        }

        if let Some(b) = &mut block {
            if let Some(mode) = line.strip_prefix("new file mode ") {
                check_mode(mode.trim(), false)?;
                b.new_file_mode = Some(mode.trim().to_string());
                continue;
            }
            if let Some(mode) = line.strip_prefix("deleted file mode ") {
                // Deleting an executable file is fine; creating one is not.
                check_mode(mode.trim(), true)?;
                b.deleted_file = true;
                continue;
            }
            if let Some(mode) = line.strip_prefix("old mode ") {
                check_mode(mode.trim(), true)?;
                continue;
            }
            if let Some(mode) = line.strip_prefix("new mode ") {
                // A mode flip to executable is an executable-bit
                // introduction, same as a new 100755 file.
                check_mode(mode.trim(), false)?;
                continue;
            }
            if let Some(path) = line.strip_prefix("rename from ") {
                b.rename_from = Some(path.trim().to_string());
                continue;
            }
            if let Some(path) = line.strip_prefix("rename to ") {
                b.rename_to = Some(path.trim().to_string());
                continue;
            }
            if line.starts_with("index ")
                || line.starts_with("similarity index ")
                || line.starts_with("dissimilarity index ")
                || line.starts_with("\\ No newline")
            {
                continue;
            }
            if line.starts_with("@@") {
                b.saw_body = true;
                continue;
            }
            if b.saw_body {
                if let Some(added) = line.strip_prefix('+') {
                    summary.changed_lines += 1;
                    summary.added_bytes += added.len() as u64 + 1;
                } else if line.starts_with('-') {
                    summary.changed_lines += 1;
                }
            }
        }
    }

    if expecting_new_side {
        let line = diff.lines().count();
        return Err(PatchError::UnterminatedHeader { line });
    }
    if let Some(prev) = block.take() {
        finalize(prev, &mut summary.files)?;
    }

    if summary.files.is_empty() {
        return Err(PatchError::NoFiles);
    }
    if summary.files.len() > limits.max_files {
        return Err(PatchError::TooManyFiles {
            count: summary.files.len(),
        });
    }
    if summary.changed_lines > limits.max_changed_lines {
        return Err(PatchError::TooManyChangedLines {
            count: summary.changed_lines,
        });
    }
    if summary.added_bytes > limits.max_added_bytes {
        return Err(PatchError::AddedBytesExceeded {
            bytes: summary.added_bytes,
        });
    }

    Ok(summary)
}
