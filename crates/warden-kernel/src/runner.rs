//! Bounded subprocess execution and the test-runner seam.
//!
//! Every process the kernel starts runs under the same discipline: a
//! cleared environment with a minimal PATH, piped streams captured by
//! dedicated reader threads with hard byte caps, a wall-clock deadline
//! enforced by the calling thread, and a SIGTERM → grace → SIGKILL
//! termination protocol on timeout. The reader threads never touch the
//! child handle, so the calling thread keeps exclusive kill authority and
//! a blocked `read` can always be unblocked by closing the pipes.
//!
//! [`TestRunner`] is the seam for `RUN_TESTS` backends. The default
//! [`SubprocessRunner`] executes directly on the host; a container-backed
//! runner with network isolation and memory/CPU quotas plugs in behind
//! the same trait.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

/// Marker appended when a captured stream hits its cap.
pub const TRUNCATION_MARKER: &str = "…[TRUNCATED]";

/// PATH handed to every child process.
pub const RESTRICTED_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to wait for reader threads after the child is gone.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval for child exit and reader completion.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Resource limits for one child process.
#[derive(Clone, Copy, Debug)]
pub struct RunnerLimits {
    /// Wall-clock cap.
    pub wall: Duration,
    /// Per-stream capture cap in bytes.
    pub stream_cap: usize,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// Memory cap; honored by container backends only.
    pub mem_bytes: Option<u64>,
    /// CPU quota in cores; honored by container backends only.
    pub cpu_quota: Option<f32>,
    /// Whether the child may reach the network; container backends
    /// guarantee `false`, the subprocess backend cannot.
    pub network: bool,
}

impl RunnerLimits {
    /// Limits with the given wall clock and stream cap, no network.
    #[must_use]
    pub const fn new(wall: Duration, stream_cap: usize, grace: Duration) -> Self {
        Self {
            wall,
            stream_cap,
            grace,
            mem_bytes: None,
            cpu_quota: None,
            network: false,
        }
    }
}

/// Outcome of a bounded run.
#[derive(Clone, Debug)]
pub struct RunOutput {
    /// Exit code; `None` when the child died to a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout, truncated at the cap with a marker.
    pub stdout: String,
    /// Captured stderr, truncated at the cap with a marker.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// True when the wall-clock cap fired.
    pub timed_out: bool,
}

impl RunOutput {
    /// True iff the child exited zero without timing out.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runner failures that prevented any run at all.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The command could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// The OS error.
        #[source]
        source: std::io::Error,
    },

    /// The child's pipes could not be wired up.
    #[error("failed to capture child streams")]
    Pipes,
}

/// Seam for `RUN_TESTS` execution backends.
pub trait TestRunner {
    /// Runs `argv` rooted at `workspace` under `limits`.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] only when the run could not start; a
    /// failing or timed-out child is a normal [`RunOutput`].
    fn run(
        &self,
        workspace: &Path,
        argv: &[String],
        limits: &RunnerLimits,
    ) -> Result<RunOutput, RunnerError>;
}

/// Direct host-subprocess backend.
///
/// The child sees a cleared environment (PATH plus HOME pointed at the
/// workspace) and cannot inherit credentials from the kernel process.
/// Network isolation is *not* provided by this backend.
#[derive(Clone, Debug)]
pub struct SubprocessRunner {
    /// PATH value handed to children.
    pub path_env: String,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self {
            path_env: RESTRICTED_PATH.to_string(),
        }
    }
}

impl TestRunner for SubprocessRunner {
    fn run(
        &self,
        workspace: &Path,
        argv: &[String],
        limits: &RunnerLimits,
    ) -> Result<RunOutput, RunnerError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(RunnerError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace)
            .env_clear()
            .env("PATH", &self.path_env)
            .env("HOME", workspace)
            .env("LC_ALL", "C");

        run_bounded(cmd, None, limits)
    }
}

/// Spawns `cmd` and enforces capture caps and the timeout protocol.
///
/// `stdin_bytes`, when present, is fed to the child from a dedicated
/// writer thread so a non-reading child cannot deadlock the kernel.
///
/// # Errors
///
/// Returns [`RunnerError`] when the child cannot be spawned or its pipes
/// cannot be taken.
pub fn run_bounded(
    mut cmd: Command,
    stdin_bytes: Option<Vec<u8>>,
    limits: &RunnerLimits,
) -> Result<RunOutput, RunnerError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin_bytes.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = child.stdout.take().ok_or(RunnerError::Pipes)?;
    let stderr = child.stderr.take().ok_or(RunnerError::Pipes)?;

    let writer = stdin_bytes.map(|bytes| {
        let mut stdin = child.stdin.take();
        std::thread::spawn(move || {
            if let Some(pipe) = stdin.as_mut() {
                let _ = pipe.write_all(&bytes);
            }
            // Dropping stdin closes the pipe and signals EOF.
        })
    });

    let cap = limits.stream_cap;
    let out_reader = spawn_reader(stdout, cap);
    let err_reader = spawn_reader(stderr, cap);

    let deadline = started + limits.wall;
    let mut timed_out = false;
    let exit_code;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                exit_code = status.code();
                break;
            },
            Ok(None) => {},
            Err(_) => {
                exit_code = None;
                break;
            },
        }

        if Instant::now() >= deadline {
            timed_out = true;
            terminate(&mut child, limits.grace);
            exit_code = None;
            break;
        }

        std::thread::sleep(POLL_INTERVAL);
    }

    // Close our copies of the pipe write ends so the readers see EOF even
    // if a grandchild holds them open.
    drop(child);
    if let Some(handle) = writer {
        let _ = handle.join();
    }

    let stdout = join_reader(out_reader, cap);
    let stderr = join_reader(err_reader, cap);

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    debug!(%program, ?exit_code, timed_out, duration_ms, "bounded run finished");

    Ok(RunOutput {
        exit_code,
        stdout,
        stderr,
        duration_ms,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    cap: usize,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let mut bounded = source.take(cap as u64 + 1);
        let _ = bounded.read_to_end(&mut buf);
        // Drain the remainder so the child never blocks on a full pipe.
        let mut sink = [0u8; 8192];
        let mut rest = bounded.into_inner();
        while matches!(rest.read(&mut sink), Ok(n) if n > 0) {}
        buf
    })
}

fn join_reader(handle: std::thread::JoinHandle<Vec<u8>>, cap: usize) -> String {
    let deadline = Instant::now() + READER_JOIN_TIMEOUT;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("abandoning stuck stream reader");
            return String::new();
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    let bytes = handle.join().unwrap_or_default();
    truncate_with_marker(&bytes, cap)
}

/// Converts captured bytes to text, truncating at `cap` bytes on a char
/// boundary and appending [`TRUNCATION_MARKER`].
#[must_use]
pub fn truncate_with_marker(bytes: &[u8], cap: usize) -> String {
    if bytes.len() <= cap {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    // Back the cut off any UTF-8 continuation bytes so the truncation
    // never splits a character.
    let mut end = cap;
    while end > 0 && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    let mut text = String::from_utf8_lossy(&bytes[..end]).into_owned();
    text.push_str(TRUNCATION_MARKER);
    text
}

/// SIGTERM, wait out the grace period, then SIGKILL.
fn terminate(child: &mut Child, grace: Duration) {
    let pid = Pid::from_raw(i32::try_from(child.id()).unwrap_or(0));
    if kill(pid, Signal::SIGTERM).is_err() {
        // Already gone.
        let _ = child.try_wait();
        return;
    }

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {},
            Err(_) => return,
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    warn!(pid = child.id(), "SIGTERM grace expired, sending SIGKILL");
    let _ = kill(pid, Signal::SIGKILL);
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(wall_ms: u64) -> RunnerLimits {
        RunnerLimits::new(
            Duration::from_millis(wall_ms),
            64 * 1024,
            Duration::from_millis(200),
        )
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script).env_clear().env("PATH", RESTRICTED_PATH);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run_bounded(sh("echo hello; exit 3"), None, &limits(5000)).unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn success_requires_exit_zero() {
        let out = run_bounded(sh("exit 0"), None, &limits(5000)).unwrap();
        assert!(out.success());
    }

    #[test]
    fn stdin_is_delivered() {
        let out = run_bounded(sh("cat"), Some(b"fed via pipe".to_vec()), &limits(5000)).unwrap();
        assert_eq!(out.stdout, "fed via pipe");
    }

    #[test]
    fn wall_clock_timeout_kills_the_child() {
        let started = Instant::now();
        let out = run_bounded(sh("sleep 30"), None, &limits(300)).unwrap();
        assert!(out.timed_out);
        assert!(out.exit_code.is_none());
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "timeout protocol took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn oversized_output_is_truncated_with_marker() {
        let mut tight = limits(5000);
        tight.stream_cap = 100;
        let out = run_bounded(sh("yes x | head -c 4096"), None, &tight).unwrap();
        assert!(out.stdout.ends_with(TRUNCATION_MARKER), "{}", out.stdout);
        assert!(out.stdout.len() <= 100 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn truncate_marker_respects_char_boundaries() {
        let text = "héllo wörld".repeat(20);
        let cut = truncate_with_marker(text.as_bytes(), 13);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        // No panic and no replacement char garbage at the cut point.
        assert!(cut.chars().all(|c| c != char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn subprocess_runner_strips_the_environment() {
        std::env::set_var("WARDEN_TEST_SECRET", "leak-me");
        let dir = tempfile::tempdir().unwrap();
        let runner = SubprocessRunner::default();
        let out = runner
            .run(
                dir.path(),
                &["/usr/bin/env".to_string()],
                &limits(5000),
            )
            .unwrap();
        assert!(!out.stdout.contains("WARDEN_TEST_SECRET"));
        assert!(out.stdout.contains("PATH="));
        std::env::remove_var("WARDEN_TEST_SECRET");
    }

    #[test]
    fn empty_argv_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SubprocessRunner::default();
        assert!(runner.run(dir.path(), &[], &limits(1000)).is_err());
    }
}
