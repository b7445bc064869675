//! Value types crossing the proposer boundary.
//!
//! Every type here is immutable once constructed and has a stable serde
//! shape; the canonical encoder in [`crate::canonical`] turns that shape
//! into the bytes the kernel hashes. `Action` is a closed tagged variant on
//! purpose: a safety reviewer must be able to enumerate everything the gate
//! can approve.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maximum number of actions a proposal may carry.
pub const MAX_ACTIONS_PER_PROPOSAL: usize = 64;

/// Per-file cap on `WRITE_FILE` content, in bytes (512 KiB).
pub const MAX_WRITE_BYTES: u64 = 512 * 1024;

/// Per-proposal cap on total proposed write bytes, including estimated
/// patch additions (2 MiB).
pub const MAX_TOTAL_WRITE_BYTES: u64 = 2 * 1024 * 1024;

/// Maximum accepted path length in bytes.
pub const MAX_PATH_BYTES: usize = 4096;

fn default_diff_context() -> u32 {
    3
}

/// One proposed operation against the workspace.
///
/// Decoding a payload whose `kind` is not one of these variants fails;
/// the wire layer surfaces that as an `unknown_action` rejection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Read a text file inside the workspace.
    ReadFile {
        /// Workspace-relative path.
        path: String,
    },

    /// Create or overwrite a text file inside the workspace.
    WriteFile {
        /// Workspace-relative path.
        path: String,
        /// Full replacement content.
        content: String,
    },

    /// Apply a unified diff through the controlled patch path.
    ApplyPatch {
        /// Unified diff text.
        unified_diff: String,
    },

    /// Invoke the allowlisted test command.
    RunTests {
        /// Exact argv; validated against the allowlist.
        argv: Vec<String>,
    },

    /// Produce a working-tree diff (read-only).
    GitDiff {
        /// Optional path filters, workspace-relative.
        #[serde(default)]
        paths: Vec<String>,
        /// Context lines around each hunk.
        #[serde(default = "default_diff_context")]
        context: u32,
    },

    /// Bounded read-only content search.
    Grep {
        /// Regular expression to match.
        pattern: String,
        /// Optional path filters, workspace-relative.
        #[serde(default)]
        paths: Vec<String>,
    },
}

impl Action {
    /// Returns the kind tag of this action.
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::ReadFile { .. } => ActionKind::ReadFile,
            Self::WriteFile { .. } => ActionKind::WriteFile,
            Self::ApplyPatch { .. } => ActionKind::ApplyPatch,
            Self::RunTests { .. } => ActionKind::RunTests,
            Self::GitDiff { .. } => ActionKind::GitDiff,
            Self::Grep { .. } => ActionKind::Grep,
        }
    }

    /// True for actions that can change workspace state.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        matches!(self, Self::WriteFile { .. } | Self::ApplyPatch { .. })
    }
}

/// Kind tag for an [`Action`], used in execution records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// `READ_FILE`.
    ReadFile,
    /// `WRITE_FILE`.
    WriteFile,
    /// `APPLY_PATCH`.
    ApplyPatch,
    /// `RUN_TESTS`.
    RunTests,
    /// `GIT_DIFF`.
    GitDiff,
    /// `GREP`.
    Grep,
}

/// The workspace context visible to the gate.
///
/// `workspace_root` must be an absolute real path; it anchors every
/// confinement check. `notes` is an opaque caller-chosen map that is hashed
/// into ledger entries for audit but never consulted by the gate verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateSnapshot {
    /// Absolute path of the workspace root.
    pub workspace_root: String,
    /// Opaque audit notes.
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

impl StateSnapshot {
    /// Builds a snapshot with empty notes.
    #[must_use]
    pub fn new(workspace_root: impl Into<String>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            notes: BTreeMap::new(),
        }
    }
}

/// Ordered, non-empty bundle of actions plus opaque metadata.
///
/// Actions execute in declaration order on approval. `meta` is echoed into
/// the gate input hash but does not alter the verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Proposal {
    /// Proposed actions, in execution order.
    pub actions: Vec<Action>,
    /// Opaque proposer metadata.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Proposal {
    /// Builds a proposal with empty metadata.
    #[must_use]
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions,
            meta: BTreeMap::new(),
        }
    }
}

/// Why an action's execution failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Wall-clock cap exceeded; the process was terminated.
    Timeout,
    /// Filesystem or pipe failure.
    IoError,
    /// The patch did not apply cleanly; nothing was committed.
    PatchFailed,
    /// A write failed re-validation at execution time.
    WriteRefused,
    /// The configured test runner could not be invoked.
    RunnerUnavailable,
    /// The decision's signature did not verify against the live key.
    SignatureInvalid,
    /// The decision's input hash was already consumed this episode.
    DecisionReused,
    /// A preceding action failed, so this one was never attempted.
    NotAttempted,
}

/// Per-action execution outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecResult {
    /// Index of the action within the approved sequence.
    pub action_index: u32,
    /// Kind tag of the executed action.
    pub kind: ActionKind,
    /// Whether the action succeeded.
    pub ok: bool,
    /// Captured stdout (or file content for reads), capped with a
    /// truncation marker.
    pub stdout: String,
    /// Captured stderr, capped with a truncation marker.
    pub stderr: String,
    /// Bytes read from the workspace.
    pub bytes_read: u64,
    /// Bytes written to the workspace.
    pub bytes_written: u64,
    /// Wall-clock duration of the action.
    pub duration_ms: u64,
    /// Failure classification when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ExecResult {
    /// A result for an action that was skipped after an earlier failure.
    #[must_use]
    pub fn not_attempted(action_index: u32, kind: ActionKind) -> Self {
        Self {
            action_index,
            kind,
            ok: false,
            stdout: String::new(),
            stderr: String::new(),
            bytes_read: 0,
            bytes_written: 0,
            duration_ms: 0,
            error_kind: Some(ErrorKind::NotAttempted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serde_uses_snake_case_kind_tags() {
        let a = Action::WriteFile {
            path: "src/a.py".to_string(),
            content: "x=2\n".to_string(),
        };
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["kind"], "write_file");
        assert_eq!(json["path"], "src/a.py");
    }

    #[test]
    fn unknown_kind_is_rejected_at_decode() {
        let err = serde_json::from_str::<Action>(r#"{"kind":"spawn_shell","argv":[]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn git_diff_defaults() {
        let a: Action = serde_json::from_str(r#"{"kind":"git_diff"}"#).unwrap();
        assert_eq!(
            a,
            Action::GitDiff {
                paths: vec![],
                context: 3
            }
        );
    }

    #[test]
    fn mutating_classification() {
        assert!(Action::WriteFile {
            path: "a".into(),
            content: String::new()
        }
        .is_mutating());
        assert!(Action::ApplyPatch {
            unified_diff: String::new()
        }
        .is_mutating());
        assert!(!Action::RunTests { argv: vec![] }.is_mutating());
        assert!(!Action::Grep {
            pattern: ".".into(),
            paths: vec![]
        }
        .is_mutating());
    }

    #[test]
    fn exec_result_round_trip() {
        let r = ExecResult {
            action_index: 1,
            kind: ActionKind::RunTests,
            ok: false,
            stdout: "1 failed".to_string(),
            stderr: String::new(),
            bytes_read: 0,
            bytes_written: 0,
            duration_ms: 1200,
            error_kind: None,
        };
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("error_kind"));
        let back: ExecResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
