//! Controlled unified-diff application.
//!
//! Patches go through `git apply` in two phases: a `--check` pass that
//! proves the whole diff applies cleanly, then the real application. The
//! check-first protocol means a diff that would only half-apply touches
//! nothing and leaves no `.rej` droppings; partial application is never
//! committed.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::runner::{self, RunnerError, RunnerLimits, RESTRICTED_PATH};

/// Wall-clock cap for each `git apply` invocation.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(20);

/// Why a patch was not applied. In every case the workspace is unchanged.
#[derive(Debug, Error)]
pub enum PatchApplyError {
    /// The workspace has no `.git`; the patch utility needs one.
    #[error("workspace is not a git repository")]
    NotAGitRepo,

    /// The pre-flight check found the diff does not apply.
    #[error("patch failed pre-flight check: {stderr}")]
    CheckFailed {
        /// Captured check stderr.
        stderr: String,
    },

    /// The real application failed after the check passed.
    #[error("patch application failed: {stderr}")]
    ApplyFailed {
        /// Captured apply stderr.
        stderr: String,
    },

    /// `git` could not be invoked at all.
    #[error("patch utility unavailable: {0}")]
    Runner(#[from] RunnerError),

    /// An invocation exceeded [`APPLY_TIMEOUT`].
    #[error("patch utility timed out")]
    Timeout,
}

/// Output of a successful application.
#[derive(Clone, Debug, Default)]
pub struct PatchApplyOutput {
    /// Captured stdout of the apply pass.
    pub stdout: String,
    /// Captured stderr of the apply pass.
    pub stderr: String,
}

fn git_apply(workspace: &Path, diff: &str, check: bool) -> Result<runner::RunOutput, PatchApplyError> {
    let mut cmd = Command::new("git");
    cmd.arg("apply");
    if check {
        cmd.arg("--check");
    }
    cmd.arg("--whitespace=nowarn")
        .arg("-")
        .current_dir(workspace)
        .env_clear()
        .env("PATH", RESTRICTED_PATH)
        .env("HOME", workspace);

    let limits = RunnerLimits::new(APPLY_TIMEOUT, 64 * 1024, Duration::from_secs(5));
    let out = runner::run_bounded(cmd, Some(diff.as_bytes().to_vec()), &limits)?;
    if out.timed_out {
        return Err(PatchApplyError::Timeout);
    }
    Ok(out)
}

/// Applies a unified diff to the workspace, all-or-nothing.
///
/// # Errors
///
/// Returns [`PatchApplyError`] when the diff is refused; the workspace is
/// left exactly as it was.
pub fn apply_unified_diff(workspace: &Path, diff: &str) -> Result<PatchApplyOutput, PatchApplyError> {
    if !workspace.join(".git").is_dir() {
        return Err(PatchApplyError::NotAGitRepo);
    }

    let check = git_apply(workspace, diff, true)?;
    if !check.success() {
        debug!(stderr = %check.stderr, "patch pre-flight check failed");
        return Err(PatchApplyError::CheckFailed {
            stderr: check.stderr,
        });
    }

    let apply = git_apply(workspace, diff, false)?;
    if !apply.success() {
        return Err(PatchApplyError::ApplyFailed {
            stderr: apply.stderr,
        });
    }

    info!("patch applied cleanly");
    Ok(PatchApplyOutput {
        stdout: apply.stdout,
        stderr: apply.stderr,
    })
}
