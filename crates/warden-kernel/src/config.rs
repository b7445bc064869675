//! Runtime configuration.
//!
//! Defaults are safe; every knob can be overridden through a `WARDEN_*`
//! environment variable and the CLI layers its flags on top. `validate`
//! returns every violation at once instead of failing on the first, so an
//! operator can fix a config file in one pass.
//!
//! The proposer-side variables (`LLM_API_KEY`, `LLM_MODEL`, `LLM_BASE_URL`)
//! are deliberately not read here; the kernel never talks to a model.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use warden_core::decision::KernelKey;

/// Default per-action wall-clock cap.
pub const DEFAULT_ACTION_TIMEOUT_S: u64 = 60;

/// Hard ceiling on the per-action wall-clock cap.
pub const MAX_ACTION_TIMEOUT_S: u64 = 600;

/// Default total wall-clock cap for one `RUN_TESTS`.
pub const DEFAULT_TESTS_TIMEOUT_S: u64 = 900;

/// Grace period between SIGTERM and SIGKILL.
pub const TERM_GRACE_S: u64 = 5;

/// Default per-stream capture cap (1 MiB).
pub const DEFAULT_STREAM_CAP_BYTES: usize = 1024 * 1024;

/// Checkpoint cadence, in ledger entries.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 64;

/// Kernel runtime configuration.
#[derive(Clone, Debug)]
pub struct WardenConfig {
    /// Workspace root the episode operates on.
    pub workspace: PathBuf,
    /// Directory holding the ledger and checkpoint files.
    pub run_logs_dir: PathBuf,
    /// Path of the bandit outcomes database.
    pub outcomes_db: PathBuf,
    /// Per-action wall-clock cap.
    pub action_timeout: Duration,
    /// Total wall-clock cap for one `RUN_TESTS`.
    pub tests_timeout: Duration,
    /// Per-stream capture cap in bytes.
    pub stream_cap_bytes: usize,
    /// Checkpoint cadence in entries.
    pub checkpoint_interval: u64,
    /// Hex-encoded kernel key; absent means the development default.
    pub kernel_key_hex: Option<String>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            run_logs_dir: PathBuf::from("run_logs"),
            outcomes_db: PathBuf::from("outcomes.sqlite"),
            action_timeout: Duration::from_secs(DEFAULT_ACTION_TIMEOUT_S),
            tests_timeout: Duration::from_secs(DEFAULT_TESTS_TIMEOUT_S),
            stream_cap_bytes: DEFAULT_STREAM_CAP_BYTES,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            kernel_key_hex: None,
        }
    }
}

impl WardenConfig {
    /// Loads the default configuration with `WARDEN_*` overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_var("WARDEN_WORKSPACE") {
            cfg.workspace = PathBuf::from(v);
        }
        if let Some(v) = env_var("WARDEN_RUN_LOGS") {
            cfg.run_logs_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("WARDEN_OUTCOMES_DB") {
            cfg.outcomes_db = PathBuf::from(v);
        }
        if let Some(v) = env_var("WARDEN_ACTION_TIMEOUT_S").and_then(|v| v.parse().ok()) {
            cfg.action_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_var("WARDEN_TESTS_TIMEOUT_S").and_then(|v| v.parse().ok()) {
            cfg.tests_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_var("WARDEN_STREAM_CAP_BYTES").and_then(|v| v.parse().ok()) {
            cfg.stream_cap_bytes = v;
        }
        if let Some(v) = env_var("WARDEN_CHECKPOINT_INTERVAL").and_then(|v| v.parse().ok()) {
            cfg.checkpoint_interval = v;
        }
        if let Some(v) = env_var("WARDEN_KERNEL_KEY") {
            cfg.kernel_key_hex = Some(v);
        }
        cfg
    }

    /// Path of the ledger file under the run-logs directory.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.run_logs_dir.join("ledger.jsonl")
    }

    /// Path of the checkpoint file under the run-logs directory.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.run_logs_dir.join("checkpoint")
    }

    /// Resolves the kernel signing key.
    ///
    /// # Errors
    ///
    /// Returns a message when a configured key is malformed. An absent key
    /// falls back to the development default.
    pub fn kernel_key(&self) -> Result<KernelKey, String> {
        match &self.kernel_key_hex {
            None => Ok(KernelKey::development_default()),
            Some(hex_key) => KernelKey::from_hex(hex_key)
                .map_err(|e| format!("WARDEN_KERNEL_KEY: {e}")),
        }
    }

    /// Checks every bound and returns the full list of violations.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let action_s = self.action_timeout.as_secs();
        if action_s == 0 {
            errors.push("action timeout must be positive".to_string());
        }
        if action_s > MAX_ACTION_TIMEOUT_S {
            errors.push(format!(
                "action timeout {action_s}s exceeds the {MAX_ACTION_TIMEOUT_S}s ceiling"
            ));
        }

        let tests_s = self.tests_timeout.as_secs();
        if tests_s == 0 {
            errors.push("tests timeout must be positive".to_string());
        }
        if tests_s > 3600 {
            errors.push(format!("tests timeout {tests_s}s exceeds the 1h ceiling"));
        }

        if self.stream_cap_bytes == 0 {
            errors.push("stream cap must be positive".to_string());
        }
        if self.stream_cap_bytes > 16 * 1024 * 1024 {
            errors.push("stream cap exceeds the 16 MiB ceiling".to_string());
        }

        if self.checkpoint_interval == 0 {
            errors.push("checkpoint interval must be positive".to_string());
        }

        if let Err(e) = self.kernel_key() {
            errors.push(e);
        }

        errors
    }

    /// Workspace root as a [`Path`].
    #[must_use]
    pub fn workspace_path(&self) -> &Path {
        &self.workspace
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}
