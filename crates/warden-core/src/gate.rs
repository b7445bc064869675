//! The gate: a deterministic validator for proposals.
//!
//! `evaluate` is the only entry point. It never panics and never returns an
//! error: every anomalous input becomes a denied [`Decision`] with an
//! enumerated reason. It performs no mutation, reads no clocks, samples no
//! randomness, and touches the filesystem only to resolve symlinks under
//! the snapshot's workspace root.
//!
//! Rule evaluation order is fixed, so the first violated rule determines
//! the recorded reason and repeated evaluations of the same input produce
//! byte-identical decisions.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::action::{
    Action, Proposal, StateSnapshot, MAX_ACTIONS_PER_PROPOSAL, MAX_TOTAL_WRITE_BYTES,
    MAX_WRITE_BYTES,
};
use crate::decision::{gate_input_hash, Decision, KernelKey, ReasonCode};
use crate::patch::{self, PatchError, PatchLimits};
use crate::paths::{self, PathViolation};

/// Kernel version folded into every gate input hash.
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ruleset version folded into every gate input hash.
pub const RULESET_VERSION: &str = "rules-v1";

/// Exact argv prefixes the test runner accepts.
pub const ALLOWED_TEST_PREFIXES: &[&[&str]] =
    &[&["pytest", "-q"], &["python", "-m", "pytest", "-q"]];

/// Maximum length of a single test node-id token.
pub const MAX_NODEID_LEN: usize = 256;

static NODEID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_./:\-]+$").expect("static regex"));

/// Static hard limits the gate enforces. These are not learned and not
/// configurable at runtime; changing them is a ruleset version change.
#[derive(Clone, Copy, Debug)]
pub struct Ruleset {
    /// Maximum actions per proposal.
    pub max_actions: usize,
    /// Per-file `WRITE_FILE` byte cap.
    pub max_write_bytes: u64,
    /// Per-proposal byte budget across writes and patch additions.
    pub max_total_write_bytes: u64,
    /// Maximum files one patch may touch.
    pub max_patch_files: usize,
    /// Maximum changed lines per patch.
    pub max_patch_lines: u64,
}

impl Default for Ruleset {
    fn default() -> Self {
        Self {
            max_actions: MAX_ACTIONS_PER_PROPOSAL,
            max_write_bytes: MAX_WRITE_BYTES,
            max_total_write_bytes: MAX_TOTAL_WRITE_BYTES,
            max_patch_files: 8,
            max_patch_lines: 500,
        }
    }
}

/// Rules on a snapshot/proposal pair and returns the signed verdict.
///
/// All-or-nothing: `approved_actions` equals the input actions when every
/// rule passes and is empty otherwise. Partial approvals are not supported;
/// atomicity keeps replay simple.
#[must_use]
pub fn evaluate(
    snapshot: &StateSnapshot,
    proposal: &Proposal,
    ruleset: &Ruleset,
    key: &KernelKey,
) -> Decision {
    let verdict = check(snapshot, proposal, ruleset);
    let input_hash = gate_input_hash(snapshot, proposal);

    let (allowed, reason, approved_actions) = match verdict {
        Ok(()) => (true, ReasonCode::Ok, proposal.actions.clone()),
        Err(reason) => (false, reason, Vec::new()),
    };

    let signature = key.sign(&input_hash, allowed, reason, &approved_actions);
    Decision {
        allowed,
        reason,
        approved_actions,
        input_hash,
        signature,
    }
}

fn check(
    snapshot: &StateSnapshot,
    proposal: &Proposal,
    ruleset: &Ruleset,
) -> Result<(), ReasonCode> {
    let workspace_real = fs::canonicalize(&snapshot.workspace_root)
        .ok()
        .filter(|p| p.is_dir())
        .ok_or(ReasonCode::WorkspaceMissing)?;

    if proposal.actions.is_empty() {
        return Err(ReasonCode::EmptyProposal);
    }
    if proposal.actions.len() > ruleset.max_actions {
        return Err(ReasonCode::TooManyActions);
    }

    let mut total_write_bytes: u64 = 0;
    let mut write_targets: BTreeSet<PathBuf> = BTreeSet::new();

    for action in &proposal.actions {
        match action {
            Action::ReadFile { path } => {
                confine(&workspace_real, path)?;
            },

            Action::WriteFile { path, content } => {
                let resolved = confine(&workspace_real, path)?;
                if paths::contains_nul(content) {
                    return Err(ReasonCode::NulInPayload);
                }
                let nbytes = content.len() as u64;
                if nbytes > ruleset.max_write_bytes {
                    return Err(ReasonCode::BudgetExceeded);
                }
                total_write_bytes += nbytes;
                if total_write_bytes > ruleset.max_total_write_bytes {
                    return Err(ReasonCode::BudgetExceeded);
                }
                if !write_targets.insert(resolved) {
                    return Err(ReasonCode::DuplicateWrite);
                }
            },

            Action::ApplyPatch { unified_diff } => {
                if paths::contains_nul(unified_diff) {
                    return Err(ReasonCode::NulInPayload);
                }
                let limits = PatchLimits {
                    max_files: ruleset.max_patch_files,
                    max_changed_lines: ruleset.max_patch_lines,
                    max_added_bytes: ruleset.max_total_write_bytes,
                };
                let summary =
                    patch::scan(unified_diff, &limits).map_err(patch_reason)?;
                for touched in summary.touched_paths() {
                    confine(&workspace_real, touched)?;
                }
                total_write_bytes += summary.added_bytes;
                if total_write_bytes > ruleset.max_total_write_bytes {
                    return Err(ReasonCode::BudgetExceeded);
                }
            },

            Action::RunTests { argv } => {
                if !allowed_test_argv(argv, &workspace_real) {
                    return Err(ReasonCode::BadTestArgv);
                }
            },

            Action::GitDiff { paths: filters, .. } => {
                for p in filters {
                    confine(&workspace_real, p)?;
                }
            },

            Action::Grep {
                pattern,
                paths: filters,
            } => {
                if paths::contains_nul(pattern) {
                    return Err(ReasonCode::NulInPayload);
                }
                for p in filters {
                    confine(&workspace_real, p)?;
                }
            },
        }
    }

    Ok(())
}

fn confine(workspace_real: &Path, rel: &str) -> Result<PathBuf, ReasonCode> {
    paths::resolve_within(workspace_real, rel).map_err(|violation| match violation {
        PathViolation::NulByte => ReasonCode::NulInPayload,
        PathViolation::BlockedSegment { .. } => ReasonCode::BlockedSegment,
        _ => ReasonCode::PathEscape,
    })
}

fn patch_reason(err: PatchError) -> ReasonCode {
    match err {
        PatchError::BadMode { .. } => ReasonCode::BadMode,
        PatchError::TooManyFiles { .. }
        | PatchError::TooManyChangedLines { .. }
        | PatchError::AddedBytesExceeded { .. } => ReasonCode::BudgetExceeded,
        _ => ReasonCode::PatchParseError,
    }
}

/// Checks a `RUN_TESTS` argv against the allowlist.
///
/// An argv is acceptable iff it starts with one of the exact
/// [`ALLOWED_TEST_PREFIXES`] and every following token is a literal test
/// node-id: safe character set, bounded length, never a flag, and a file
/// segment that stays confined to the workspace.
#[must_use]
pub fn allowed_test_argv(argv: &[String], workspace_real: &Path) -> bool {
    let norm: Vec<&str> = argv
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();

    for prefix in ALLOWED_TEST_PREFIXES {
        if norm.len() < prefix.len() {
            continue;
        }
        if norm[..prefix.len()] != **prefix {
            continue;
        }
        return norm[prefix.len()..]
            .iter()
            .all(|token| valid_nodeid(token, workspace_real));
    }
    false
}

fn valid_nodeid(token: &str, workspace_real: &Path) -> bool {
    if token.len() > MAX_NODEID_LEN || token.starts_with('-') {
        return false;
    }
    if !NODEID_RE.is_match(token) {
        return false;
    }
    let file_part = token.split("::").next().unwrap_or(token);
    paths::resolve_within(workspace_real, file_part).is_ok()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::canonical;

    fn workspace() -> (tempfile::TempDir, StateSnapshot) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::create_dir(dir.path().join("tests")).unwrap();
        fs::write(dir.path().join("src/a.py"), "x=1\n").unwrap();
        fs::write(dir.path().join("tests/t.py"), "def test_ok():\n    pass\n").unwrap();
        let root = fs::canonicalize(dir.path())
            .unwrap()
            .to_string_lossy()
            .into_owned();
        (dir, StateSnapshot::new(root))
    }

    fn key() -> KernelKey {
        KernelKey::development_default()
    }

    fn eval(snapshot: &StateSnapshot, actions: Vec<Action>) -> Decision {
        evaluate(
            snapshot,
            &Proposal::new(actions),
            &Ruleset::default(),
            &key(),
        )
    }

    fn write(path: &str, content: &str) -> Action {
        Action::WriteFile {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    fn run_tests(argv: &[&str]) -> Action {
        Action::RunTests {
            argv: argv.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn approves_write_then_tests() {
        let (_dir, snapshot) = workspace();
        let d = eval(
            &snapshot,
            vec![write("src/a.py", "x=2\n"), run_tests(&["pytest", "-q"])],
        );
        assert!(d.allowed, "{:?}", d.reason);
        assert_eq!(d.reason, ReasonCode::Ok);
        assert_eq!(d.approved_actions.len(), 2);
        assert!(key().verify(&d));
    }

    #[test]
    fn denies_path_escape_with_empty_approvals() {
        let (_dir, snapshot) = workspace();
        let d = eval(&snapshot, vec![write("../outside.txt", "hi")]);
        assert!(!d.allowed);
        assert_eq!(d.reason, ReasonCode::PathEscape);
        assert!(d.approved_actions.is_empty());
        assert!(key().verify(&d));
    }

    #[test]
    fn denies_blocked_segments() {
        let (_dir, snapshot) = workspace();
        let d = eval(&snapshot, vec![write(".git/config", "[core]")]);
        assert_eq!(d.reason, ReasonCode::BlockedSegment);
        let d = eval(
            &snapshot,
            vec![Action::ReadFile {
                path: ".ssh/id_rsa".to_string(),
            }],
        );
        assert_eq!(d.reason, ReasonCode::BlockedSegment);
    }

    #[cfg(unix)]
    #[test]
    fn denies_symlink_escape() {
        let (dir, snapshot) = workspace();
        std::os::unix::fs::symlink("/etc", dir.path().join("out")).unwrap();
        let d = eval(&snapshot, vec![write("out/x", "boom")]);
        assert_eq!(d.reason, ReasonCode::PathEscape);
    }

    #[test]
    fn denies_empty_proposal() {
        let (_dir, snapshot) = workspace();
        let d = eval(&snapshot, vec![]);
        assert_eq!(d.reason, ReasonCode::EmptyProposal);
    }

    #[test]
    fn action_count_boundary() {
        let (_dir, snapshot) = workspace();
        let ok: Vec<Action> = (0..64)
            .map(|_| Action::ReadFile {
                path: "src/a.py".to_string(),
            })
            .collect();
        assert!(eval(&snapshot, ok).allowed);

        let too_many: Vec<Action> = (0..65)
            .map(|_| Action::ReadFile {
                path: "src/a.py".to_string(),
            })
            .collect();
        assert_eq!(eval(&snapshot, too_many).reason, ReasonCode::TooManyActions);
    }

    #[test]
    fn per_file_write_boundary() {
        let (_dir, snapshot) = workspace();
        let exactly = "x".repeat(512 * 1024);
        assert!(eval(&snapshot, vec![write("src/big.py", &exactly)]).allowed);

        let over = "x".repeat(512 * 1024 + 1);
        assert_eq!(
            eval(&snapshot, vec![write("src/big.py", &over)]).reason,
            ReasonCode::BudgetExceeded
        );
    }

    #[test]
    fn total_write_budget_boundary() {
        let (_dir, snapshot) = workspace();
        let chunk = "y".repeat(400 * 1024);
        let under: Vec<Action> = (0..5)
            .map(|i| write(&format!("src/f{i}.py"), &chunk))
            .collect();
        assert!(eval(&snapshot, under).allowed);

        let mut over: Vec<Action> = (0..5)
            .map(|i| write(&format!("src/f{i}.py"), &chunk))
            .collect();
        over.push(write("src/f5.py", &"y".repeat(200 * 1024)));
        assert_eq!(eval(&snapshot, over).reason, ReasonCode::BudgetExceeded);
    }

    #[test]
    fn duplicate_write_is_ambiguous() {
        let (_dir, snapshot) = workspace();
        let d = eval(
            &snapshot,
            vec![write("src/a.py", "one"), write("src/a.py", "two")],
        );
        assert_eq!(d.reason, ReasonCode::DuplicateWrite);
    }

    #[test]
    fn nul_in_content_is_refused() {
        let (_dir, snapshot) = workspace();
        let d = eval(&snapshot, vec![write("src/a.py", "x\0y")]);
        assert_eq!(d.reason, ReasonCode::NulInPayload);
    }

    #[test]
    fn test_argv_allowlist() {
        let (_dir, snapshot) = workspace();
        assert!(eval(&snapshot, vec![run_tests(&["pytest", "-q"])]).allowed);
        assert!(
            eval(
                &snapshot,
                vec![run_tests(&["python", "-m", "pytest", "-q"])]
            )
            .allowed
        );
        assert!(
            eval(
                &snapshot,
                vec![run_tests(&["pytest", "-q", "tests/t.py::test_ok"])]
            )
            .allowed
        );

        for bad in [
            vec!["pytest", "-q", "-s"],
            vec!["pytest", "-q", "--cov"],
            vec!["pytest", "-q", "-x"],
            vec!["pytest", "-q", "../etc/passwd"],
            vec!["pytest"],
            vec!["bash", "-lc", "pytest -q"],
            vec!["pytest", "-q", "tests/t.py::test_ok;rm"],
        ] {
            let d = eval(&snapshot, vec![run_tests(&bad)]);
            assert_eq!(d.reason, ReasonCode::BadTestArgv, "argv {bad:?}");
        }
    }

    #[test]
    fn nodeid_length_cap() {
        let (_dir, snapshot) = workspace();
        let long = format!("tests/t.py::{}", "a".repeat(MAX_NODEID_LEN));
        let d = eval(&snapshot, vec![run_tests(&["pytest", "-q", &long])]);
        assert_eq!(d.reason, ReasonCode::BadTestArgv);
    }

    #[test]
    fn patch_confinement_feeds_reasons_through() {
        let (_dir, snapshot) = workspace();

        let escape = "\
--- a/../escape.py
+++ b/../escape.py
@@ -1 +1 @@
-x
+y
";
        let d = eval(
            &snapshot,
            vec![Action::ApplyPatch {
                unified_diff: escape.to_string(),
            }],
        );
        assert_eq!(d.reason, ReasonCode::PathEscape);

        let garbled = "not a diff at all\n";
        let d = eval(
            &snapshot,
            vec![Action::ApplyPatch {
                unified_diff: garbled.to_string(),
            }],
        );
        assert_eq!(d.reason, ReasonCode::PatchParseError);

        let exec_bit = "\
diff --git a/tool.sh b/tool.sh
new file mode 100755
--- /dev/null
+++ b/tool.sh
@@ -0,0 +1 @@
+echo
";
        let d = eval(
            &snapshot,
            vec![Action::ApplyPatch {
                unified_diff: exec_bit.to_string(),
            }],
        );
        assert_eq!(d.reason, ReasonCode::BadMode);
    }

    #[test]
    fn patch_bytes_count_toward_the_budget() {
        let (_dir, snapshot) = workspace();
        let mut diff = String::from("--- a/src/a.py\n+++ b/src/a.py\n@@ -0,0 +1,3 @@\n");
        for _ in 0..3 {
            diff.push('+');
            diff.push_str(&"z".repeat(100));
            diff.push('\n');
        }
        // Four maximal writes land exactly on the proposal budget; the
        // patch's added bytes push it over.
        let chunk = "w".repeat(512 * 1024);
        let mut actions: Vec<Action> = (0..4)
            .map(|i| write(&format!("src/w{i}.py"), &chunk))
            .collect();
        actions.push(Action::ApplyPatch { unified_diff: diff });
        let d = eval(&snapshot, actions);
        assert_eq!(d.reason, ReasonCode::BudgetExceeded);
    }

    #[test]
    fn meta_never_changes_the_verdict() {
        let (_dir, snapshot) = workspace();
        let actions = vec![write("src/a.py", "x=2\n")];
        let plain = eval(&snapshot, actions.clone());

        let mut tagged = Proposal::new(actions);
        tagged.meta.insert("hint".to_string(), "be evil".to_string());
        let d = evaluate(&snapshot, &tagged, &Ruleset::default(), &key());

        assert_eq!(plain.allowed, d.allowed);
        assert_eq!(plain.reason, d.reason);
        // The meta still shows up in the input hash.
        assert_ne!(plain.input_hash, d.input_hash);
    }

    #[test]
    fn missing_workspace_denies() {
        let snapshot = StateSnapshot::new("/definitely/not/a/real/workspace");
        let d = eval(&snapshot, vec![run_tests(&["pytest", "-q"])]);
        assert_eq!(d.reason, ReasonCode::WorkspaceMissing);
    }

    #[test]
    fn repeated_evaluation_is_byte_identical() {
        let (_dir, snapshot) = workspace();
        let proposal = Proposal::new(vec![
            write("src/a.py", "x=2\n"),
            run_tests(&["pytest", "-q"]),
        ]);
        let first = evaluate(&snapshot, &proposal, &Ruleset::default(), &key());
        let first_bytes = canonical::to_canonical_string(&first).unwrap();
        for _ in 0..50 {
            let again = evaluate(&snapshot, &proposal, &Ruleset::default(), &key());
            assert_eq!(
                canonical::to_canonical_string(&again).unwrap(),
                first_bytes
            );
        }
    }
}
