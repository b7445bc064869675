//! Sequential executor for gate-approved actions.
//!
//! The controller trusts nothing it is handed. It refuses decisions whose
//! signature does not verify against the live key, refuses decisions whose
//! input hash was already consumed this episode, and re-validates path and
//! byte constraints on every action before touching the workspace —
//! approval at the gate is necessary but not sufficient.
//!
//! Actions execute strictly in declaration order. The first action that
//! fails with `timeout`, `io_error`, `patch_failed`, or `write_refused`
//! stops the episode: the remaining actions are reported as
//! `not_attempted` rather than executed. Every approved action yields
//! exactly one [`ExecResult`] no matter what.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{info, warn};

use warden_core::action::{
    Action, ActionKind, ErrorKind, ExecResult, StateSnapshot, MAX_WRITE_BYTES,
};
use warden_core::decision::{Decision, KernelKey};
use warden_core::gate::{self, Ruleset};
use warden_core::hashing::Digest;
use warden_core::patch::{self, PatchLimits};
use warden_core::paths;

use crate::episode::CancelToken;
use crate::fs_atomic;
use crate::patch_apply::{self, PatchApplyError};
use crate::runner::{self, RunnerLimits, TestRunner, TRUNCATION_MARKER};

/// Maximum grep matches reported per action.
pub const MAX_GREP_MATCHES: usize = 100;

/// Maximum bytes of any single file grep will scan.
pub const MAX_GREP_FILE_BYTES: u64 = 1024 * 1024;

/// Decision hashes remembered per episode for reuse detection.
const CONSUMED_CAP: usize = 1024;

/// Execution-side knobs; budgets the gate already enforced are re-checked
/// here with the same ruleset.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Per-action wall-clock cap.
    pub action_timeout: Duration,
    /// Total wall-clock cap for one `RUN_TESTS`.
    pub tests_timeout: Duration,
    /// Per-stream capture cap in bytes.
    pub stream_cap: usize,
    /// SIGTERM grace before SIGKILL.
    pub grace: Duration,
    /// Ruleset used for defense-in-depth re-validation.
    pub ruleset: Ruleset,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(60),
            tests_timeout: Duration::from_secs(900),
            stream_cap: 1024 * 1024,
            grace: Duration::from_secs(5),
            ruleset: Ruleset::default(),
        }
    }
}

/// Bounded first-in-first-out memory of consumed decision hashes.
#[derive(Debug, Default)]
struct ConsumedSet {
    seen: HashSet<Digest>,
    order: VecDeque<Digest>,
}

impl ConsumedSet {
    /// Returns false when the hash was already consumed.
    fn try_consume(&mut self, digest: Digest) -> bool {
        if !self.seen.insert(digest) {
            return false;
        }
        self.order.push_back(digest);
        while self.order.len() > CONSUMED_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// The executor. One controller serves one episode at a time; parallel
/// episodes use separate controllers on disjoint workspaces.
pub struct Controller {
    key: KernelKey,
    config: ControllerConfig,
    runner: Box<dyn TestRunner>,
    consumed: ConsumedSet,
}

impl Controller {
    /// Builds a controller around a test-runner backend.
    #[must_use]
    pub fn new(key: KernelKey, config: ControllerConfig, runner: Box<dyn TestRunner>) -> Self {
        Self {
            key,
            config,
            runner,
            consumed: ConsumedSet::default(),
        }
    }

    /// Executes a decision's approved actions in order.
    ///
    /// A denied decision yields no results. A decision that fails
    /// signature verification or was already consumed yields one failed
    /// result per approved action, without touching the workspace.
    pub fn execute(
        &mut self,
        snapshot: &StateSnapshot,
        decision: &Decision,
        cancel: &CancelToken,
    ) -> Vec<ExecResult> {
        if !decision.allowed || decision.approved_actions.is_empty() {
            return Vec::new();
        }

        if !self.key.verify(decision) {
            warn!(input_hash = %decision.input_hash, "refusing decision: bad signature");
            return refuse_all(&decision.approved_actions, ErrorKind::SignatureInvalid);
        }

        if !self.consumed.try_consume(decision.input_hash) {
            warn!(input_hash = %decision.input_hash, "refusing decision: already consumed");
            return refuse_all(&decision.approved_actions, ErrorKind::DecisionReused);
        }

        let Ok(workspace) = fs::canonicalize(&snapshot.workspace_root) else {
            return refuse_all(&decision.approved_actions, ErrorKind::IoError);
        };

        let mut results = Vec::with_capacity(decision.approved_actions.len());
        let mut stopped = false;

        for (index, action) in decision.approved_actions.iter().enumerate() {
            let index_u32 = u32::try_from(index).unwrap_or(u32::MAX);

            if stopped || cancel.is_cancelled() {
                results.push(ExecResult::not_attempted(index_u32, action.kind()));
                continue;
            }

            let result = self.run_action(&workspace, index_u32, action);
            if matches!(
                result.error_kind,
                Some(
                    ErrorKind::Timeout
                        | ErrorKind::IoError
                        | ErrorKind::PatchFailed
                        | ErrorKind::WriteRefused
                )
            ) {
                stopped = true;
            }
            results.push(result);
        }

        info!(
            input_hash = %decision.input_hash,
            actions = results.len(),
            stopped,
            "decision executed"
        );
        results
    }

    fn run_action(&mut self, workspace: &Path, index: u32, action: &Action) -> ExecResult {
        let started = Instant::now();
        let mut result = match action {
            Action::ReadFile { path } => self.read_file(workspace, path),
            Action::WriteFile { path, content } => self.write_file(workspace, path, content),
            Action::ApplyPatch { unified_diff } => self.apply_patch(workspace, unified_diff),
            Action::RunTests { argv } => self.run_tests(workspace, argv),
            Action::GitDiff { paths, context } => self.git_diff(workspace, paths, *context),
            Action::Grep { pattern, paths } => self.grep(workspace, pattern, paths),
        };
        result.action_index = index;
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result
    }

    fn read_file(&self, workspace: &Path, rel: &str) -> ExecResult {
        let mut result = blank(ActionKind::ReadFile);
        let resolved = match paths::resolve_within(workspace, rel) {
            Ok(p) => p,
            Err(v) => return fail(result, ErrorKind::IoError, &v.to_string()),
        };

        match fs_atomic::bounded_read(&resolved, self.config.stream_cap as u64) {
            Ok(bytes) => {
                result.bytes_read = bytes.len() as u64;
                result.stdout = runner::truncate_with_marker(&bytes, self.config.stream_cap);
                result.ok = true;
                result
            },
            Err(fs_atomic::FsAtomicError::FileTooLarge { .. }) => {
                // Too big to return whole: deliver the capped prefix.
                result.bytes_read = self.config.stream_cap as u64;
                result.stdout = read_prefix(&resolved, self.config.stream_cap);
                result.ok = true;
                result
            },
            Err(e) => fail(result, ErrorKind::IoError, &e.to_string()),
        }
    }

    fn write_file(&self, workspace: &Path, rel: &str, content: &str) -> ExecResult {
        let result = blank(ActionKind::WriteFile);
        let resolved = match paths::resolve_within(workspace, rel) {
            Ok(p) => p,
            Err(v) => return fail(result, ErrorKind::WriteRefused, &v.to_string()),
        };
        if content.len() as u64 > MAX_WRITE_BYTES {
            return fail(
                result,
                ErrorKind::WriteRefused,
                "content exceeds the per-file write cap",
            );
        }

        match fs_atomic::atomic_write(&resolved, content.as_bytes()) {
            Ok(()) => {
                let mut result = result;
                result.bytes_written = content.len() as u64;
                result.ok = true;
                result
            },
            Err(e) => fail(result, ErrorKind::IoError, &e.to_string()),
        }
    }

    fn apply_patch(&self, workspace: &Path, diff: &str) -> ExecResult {
        let result = blank(ActionKind::ApplyPatch);

        // Same scan the gate ran; a decision is not a license to skip it.
        let limits = PatchLimits {
            max_files: self.config.ruleset.max_patch_files,
            max_changed_lines: self.config.ruleset.max_patch_lines,
            max_added_bytes: self.config.ruleset.max_total_write_bytes,
        };
        let summary = match patch::scan(diff, &limits) {
            Ok(s) => s,
            Err(e) => return fail(result, ErrorKind::PatchFailed, &e.to_string()),
        };
        for touched in summary.touched_paths() {
            if let Err(v) = paths::resolve_within(workspace, touched) {
                return fail(result, ErrorKind::PatchFailed, &v.to_string());
            }
        }

        match patch_apply::apply_unified_diff(workspace, diff) {
            Ok(out) => {
                let mut result = result;
                result.stdout = out.stdout;
                result.stderr = out.stderr;
                result.bytes_written = summary.added_bytes;
                result.ok = true;
                result
            },
            Err(PatchApplyError::Timeout) => fail(result, ErrorKind::Timeout, "patch timed out"),
            Err(e) => fail(result, ErrorKind::PatchFailed, &e.to_string()),
        }
    }

    fn run_tests(&mut self, workspace: &Path, argv: &[String]) -> ExecResult {
        let result = blank(ActionKind::RunTests);
        if !gate::allowed_test_argv(argv, workspace) {
            return fail(
                result,
                ErrorKind::RunnerUnavailable,
                "argv failed the allowlist re-check",
            );
        }

        let limits = RunnerLimits::new(
            self.config.tests_timeout,
            self.config.stream_cap,
            self.config.grace,
        );
        match self.runner.run(workspace, argv, &limits) {
            Ok(out) => {
                let mut result = result;
                result.stdout = out.stdout;
                result.stderr = out.stderr;
                if out.timed_out {
                    result.error_kind = Some(ErrorKind::Timeout);
                } else {
                    result.ok = out.exit_code == Some(0);
                }
                result
            },
            Err(e) => fail(result, ErrorKind::RunnerUnavailable, &e.to_string()),
        }
    }

    fn git_diff(&self, workspace: &Path, filters: &[String], context: u32) -> ExecResult {
        let result = blank(ActionKind::GitDiff);

        let mut resolved_filters = Vec::with_capacity(filters.len());
        for rel in filters {
            match paths::resolve_within(workspace, rel) {
                Ok(_) => resolved_filters.push(rel.clone()),
                Err(v) => return fail(result, ErrorKind::IoError, &v.to_string()),
            }
        }

        let mut cmd = std::process::Command::new("git");
        cmd.arg("diff")
            .arg(format!("-U{}", context.min(10)))
            .current_dir(workspace)
            .env_clear()
            .env("PATH", runner::RESTRICTED_PATH)
            .env("HOME", workspace);
        if !resolved_filters.is_empty() {
            cmd.arg("--");
            cmd.args(&resolved_filters);
        }

        let limits = RunnerLimits::new(
            self.config.action_timeout,
            self.config.stream_cap,
            self.config.grace,
        );
        match runner::run_bounded(cmd, None, &limits) {
            Ok(out) => {
                let mut result = result;
                result.stdout = out.stdout;
                result.stderr = out.stderr;
                if out.timed_out {
                    result.error_kind = Some(ErrorKind::Timeout);
                } else {
                    result.ok = out.exit_code == Some(0);
                }
                result
            },
            Err(e) => fail(result, ErrorKind::IoError, &e.to_string()),
        }
    }

    fn grep(&self, workspace: &Path, pattern: &str, filters: &[String]) -> ExecResult {
        let mut result = blank(ActionKind::Grep);

        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return fail(result, ErrorKind::IoError, &e.to_string()),
        };

        let mut roots = Vec::new();
        if filters.is_empty() {
            roots.push(workspace.to_path_buf());
        } else {
            for rel in filters {
                match paths::resolve_within(workspace, rel) {
                    Ok(p) => roots.push(p),
                    Err(v) => return fail(result, ErrorKind::IoError, &v.to_string()),
                }
            }
        }

        let mut matches: Vec<String> = Vec::new();
        let mut bytes_read: u64 = 0;
        let mut truncated = false;

        'roots: for root in roots {
            let mut stack = vec![root];
            while let Some(current) = stack.pop() {
                let Ok(meta) = fs::symlink_metadata(&current) else {
                    continue;
                };
                if meta.file_type().is_symlink() {
                    continue;
                }
                if meta.is_dir() {
                    let Ok(reader) = fs::read_dir(&current) else {
                        continue;
                    };
                    let mut children: Vec<PathBuf> =
                        reader.filter_map(|e| e.ok().map(|e| e.path())).collect();
                    // Reverse-sorted so the stack pops in lexicographic
                    // order: grep output is deterministic.
                    children.sort();
                    children.reverse();
                    for child in children {
                        let name = child.file_name().map(|n| n.to_string_lossy().into_owned());
                        if matches!(name.as_deref(), Some(".git" | ".ssh")) {
                            continue;
                        }
                        stack.push(child);
                    }
                    continue;
                }
                if meta.len() > MAX_GREP_FILE_BYTES {
                    continue;
                }

                let Ok(bytes) = fs_atomic::bounded_read(&current, MAX_GREP_FILE_BYTES) else {
                    continue;
                };
                bytes_read += bytes.len() as u64;
                if bytes[..bytes.len().min(4096)].contains(&0) {
                    // Binary file.
                    continue;
                }
                let text = String::from_utf8_lossy(&bytes);
                let rel = current
                    .strip_prefix(workspace)
                    .unwrap_or(&current)
                    .to_string_lossy()
                    .into_owned();
                for (lineno, line) in text.lines().enumerate() {
                    if regex.is_match(line) {
                        matches.push(format!("{rel}:{}:{line}", lineno + 1));
                        if matches.len() >= MAX_GREP_MATCHES {
                            truncated = true;
                            break 'roots;
                        }
                    }
                }
            }
        }

        let mut stdout = matches.join("\n");
        if stdout.len() > self.config.stream_cap {
            stdout = runner::truncate_with_marker(stdout.as_bytes(), self.config.stream_cap);
        } else if truncated {
            stdout.push('\n');
            stdout.push_str(TRUNCATION_MARKER);
        }

        result.bytes_read = bytes_read;
        result.stdout = stdout;
        result.ok = true;
        result
    }
}

fn blank(kind: ActionKind) -> ExecResult {
    ExecResult {
        action_index: 0,
        kind,
        ok: false,
        stdout: String::new(),
        stderr: String::new(),
        bytes_read: 0,
        bytes_written: 0,
        duration_ms: 0,
        error_kind: None,
    }
}

fn fail(mut result: ExecResult, kind: ErrorKind, message: &str) -> ExecResult {
    result.ok = false;
    result.error_kind = Some(kind);
    result.stderr = message.to_string();
    result
}

fn refuse_all(actions: &[Action], kind: ErrorKind) -> Vec<ExecResult> {
    actions
        .iter()
        .enumerate()
        .map(|(i, action)| {
            let mut r = blank(action.kind());
            r.action_index = u32::try_from(i).unwrap_or(u32::MAX);
            r.error_kind = Some(kind);
            r
        })
        .collect()
}

fn read_prefix(path: &Path, cap: usize) -> String {
    use std::io::Read;
    let Ok(file) = fs::File::open(path) else {
        return String::new();
    };
    let mut buf = Vec::with_capacity(cap);
    let _ = file.take(cap as u64 + 1).read_to_end(&mut buf);
    runner::truncate_with_marker(&buf, cap)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use warden_core::action::Proposal;
    use warden_core::decision::ReasonCode;

    use super::*;
    use crate::runner::{RunOutput, RunnerError};

    /// Runner double that never spawns anything.
    struct FakeRunner {
        exit_code: i32,
        stdout: &'static str,
    }

    impl TestRunner for FakeRunner {
        fn run(
            &self,
            _workspace: &Path,
            _argv: &[String],
            _limits: &RunnerLimits,
        ) -> Result<RunOutput, RunnerError> {
            Ok(RunOutput {
                exit_code: Some(self.exit_code),
                stdout: self.stdout.to_string(),
                stderr: String::new(),
                duration_ms: 5,
                timed_out: false,
            })
        }
    }

    fn controller_with(exit_code: i32) -> Controller {
        Controller::new(
            KernelKey::development_default(),
            ControllerConfig::default(),
            Box::new(FakeRunner {
                exit_code,
                stdout: "1 passed",
            }),
        )
    }

    fn workspace() -> (tempfile::TempDir, StateSnapshot) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.py"), "x=1\n").unwrap();
        let root = fs::canonicalize(dir.path())
            .unwrap()
            .to_string_lossy()
            .into_owned();
        (dir, StateSnapshot::new(root))
    }

    /// Signs a decision directly, standing in for the gate. Used both for
    /// legitimate decisions and for crafted ones that probe the
    /// controller's own re-validation.
    fn signed(snapshot: &StateSnapshot, actions: Vec<Action>) -> Decision {
        let key = KernelKey::development_default();
        let proposal = Proposal::new(actions.clone());
        let input_hash = warden_core::decision::gate_input_hash(snapshot, &proposal);
        let signature = key.sign(&input_hash, true, ReasonCode::Ok, &actions);
        Decision {
            allowed: true,
            reason: ReasonCode::Ok,
            approved_actions: actions,
            input_hash,
            signature,
        }
    }

    #[test]
    fn bad_signature_refuses_every_action() {
        let (_dir, snapshot) = workspace();
        let mut decision = signed(
            &snapshot,
            vec![Action::ReadFile {
                path: "src/a.py".to_string(),
            }],
        );
        decision.signature = Digest::ZERO;

        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind, Some(ErrorKind::SignatureInvalid));
        assert!(!results[0].ok);
    }

    #[test]
    fn consumed_decision_is_refused_on_replay() {
        let (_dir, snapshot) = workspace();
        let decision = signed(
            &snapshot,
            vec![Action::ReadFile {
                path: "src/a.py".to_string(),
            }],
        );
        let mut controller = controller_with(0);
        let cancel = CancelToken::new();

        let first = controller.execute(&snapshot, &decision, &cancel);
        assert!(first[0].ok);

        let second = controller.execute(&snapshot, &decision, &cancel);
        assert_eq!(second[0].error_kind, Some(ErrorKind::DecisionReused));
    }

    #[test]
    fn write_then_read_round_trips_exact_bytes() {
        let (_dir, snapshot) = workspace();
        let content = "x=2\nprint('done')\n";
        let decision = signed(
            &snapshot,
            vec![
                Action::WriteFile {
                    path: "src/a.py".to_string(),
                    content: content.to_string(),
                },
                Action::ReadFile {
                    path: "src/a.py".to_string(),
                },
            ],
        );
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());

        assert!(results[0].ok);
        assert_eq!(results[0].bytes_written, content.len() as u64);
        assert!(results[1].ok);
        assert_eq!(results[1].stdout, content);
        assert_eq!(results[1].bytes_read, content.len() as u64);
    }

    #[test]
    fn write_creates_missing_directories_inside_the_workspace() {
        let (dir, snapshot) = workspace();
        let decision = signed(
            &snapshot,
            vec![Action::WriteFile {
                path: "brand/new/file.txt".to_string(),
                content: "fresh".to_string(),
            }],
        );
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());
        assert!(results[0].ok, "{:?}", results[0]);
        assert_eq!(
            fs::read_to_string(dir.path().join("brand/new/file.txt")).unwrap(),
            "fresh"
        );
    }

    #[test]
    fn crafted_escape_is_refused_even_with_a_valid_signature() {
        let (_dir, snapshot) = workspace();
        // The gate would never approve this; the controller still must not
        // execute it.
        let decision = signed(
            &snapshot,
            vec![Action::WriteFile {
                path: "../escape.txt".to_string(),
                content: "boom".to_string(),
            }],
        );
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());
        assert_eq!(results[0].error_kind, Some(ErrorKind::WriteRefused));
    }

    #[test]
    fn oversized_write_is_refused_at_execution() {
        let (_dir, snapshot) = workspace();
        let decision = signed(
            &snapshot,
            vec![Action::WriteFile {
                path: "src/big.py".to_string(),
                content: "z".repeat(512 * 1024 + 1),
            }],
        );
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());
        assert_eq!(results[0].error_kind, Some(ErrorKind::WriteRefused));
    }

    #[test]
    fn fatal_failure_marks_the_rest_not_attempted() {
        let (_dir, snapshot) = workspace();
        let decision = signed(
            &snapshot,
            vec![
                Action::ReadFile {
                    path: "src/missing.py".to_string(),
                },
                Action::WriteFile {
                    path: "src/next.py".to_string(),
                    content: "never".to_string(),
                },
                Action::RunTests {
                    argv: vec!["pytest".to_string(), "-q".to_string()],
                },
            ],
        );
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].error_kind, Some(ErrorKind::IoError));
        assert_eq!(results[1].error_kind, Some(ErrorKind::NotAttempted));
        assert_eq!(results[2].error_kind, Some(ErrorKind::NotAttempted));
        assert_eq!(results[2].action_index, 2);
    }

    #[test]
    fn failing_tests_are_not_fatal() {
        let (_dir, snapshot) = workspace();
        let decision = signed(
            &snapshot,
            vec![
                Action::RunTests {
                    argv: vec!["pytest".to_string(), "-q".to_string()],
                },
                Action::ReadFile {
                    path: "src/a.py".to_string(),
                },
            ],
        );
        let mut controller = controller_with(1);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());

        assert!(!results[0].ok);
        assert_eq!(results[0].error_kind, None);
        assert!(results[1].ok, "a failed test run must not stop the episode");
    }

    #[test]
    fn cancellation_skips_pending_actions() {
        let (_dir, snapshot) = workspace();
        let decision = signed(
            &snapshot,
            vec![
                Action::ReadFile {
                    path: "src/a.py".to_string(),
                },
                Action::ReadFile {
                    path: "src/a.py".to_string(),
                },
            ],
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &cancel);
        assert!(results
            .iter()
            .all(|r| r.error_kind == Some(ErrorKind::NotAttempted)));
    }

    #[test]
    fn denied_decision_yields_no_results() {
        let (_dir, snapshot) = workspace();
        let key = KernelKey::development_default();
        let proposal = Proposal::new(vec![]);
        let input_hash = warden_core::decision::gate_input_hash(&snapshot, &proposal);
        let signature = key.sign(&input_hash, false, ReasonCode::EmptyProposal, &[]);
        let decision = Decision {
            allowed: false,
            reason: ReasonCode::EmptyProposal,
            approved_actions: vec![],
            input_hash,
            signature,
        };
        let mut controller = controller_with(0);
        assert!(controller
            .execute(&snapshot, &decision, &CancelToken::new())
            .is_empty());
    }

    #[test]
    fn grep_reports_matches_deterministically() {
        let (dir, snapshot) = workspace();
        fs::write(
            dir.path().join("src/b.py"),
            "def test_one(): pass\ndef helper(): pass\ndef test_two(): pass\n",
        )
        .unwrap();
        let decision = signed(
            &snapshot,
            vec![Action::Grep {
                pattern: "def test_".to_string(),
                paths: vec![],
            }],
        );
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());

        assert!(results[0].ok);
        let lines: Vec<&str> = results[0].stdout.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("src/b.py:1:"));
        assert!(lines[1].starts_with("src/b.py:3:"));
        assert!(results[0].bytes_read > 0);
    }

    #[test]
    fn grep_with_invalid_pattern_fails_cleanly() {
        let (_dir, snapshot) = workspace();
        let decision = signed(
            &snapshot,
            vec![Action::Grep {
                pattern: "(unclosed".to_string(),
                paths: vec![],
            }],
        );
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());
        assert_eq!(results[0].error_kind, Some(ErrorKind::IoError));
    }

    #[test]
    fn run_tests_records_pass_and_output() {
        let (_dir, snapshot) = workspace();
        let decision = signed(
            &snapshot,
            vec![Action::RunTests {
                argv: vec!["pytest".to_string(), "-q".to_string()],
            }],
        );
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());
        assert!(results[0].ok);
        assert_eq!(results[0].stdout, "1 passed");
    }

    #[test]
    fn tampered_argv_fails_the_allowlist_recheck() {
        let (_dir, snapshot) = workspace();
        let decision = signed(
            &snapshot,
            vec![Action::RunTests {
                argv: vec!["pytest".to_string(), "-q".to_string(), "-s".to_string()],
            }],
        );
        let mut controller = controller_with(0);
        let results = controller.execute(&snapshot, &decision, &CancelToken::new());
        assert_eq!(results[0].error_kind, Some(ErrorKind::RunnerUnavailable));
    }
}
