//! Episode supervision.
//!
//! An episode is one snapshot plus one proposal, delimited by
//! `episode_begin`/`episode_end` ledger entries. The supervisor wires the
//! pieces together in the only order the ledger permits:
//!
//! ```text
//! episode_begin → proposal_seen → gate_decision → exec_result(0..k) → episode_end
//! ```
//!
//! The proposer is a seam: the kernel calls [`Proposer::propose`] and
//! never cares whether an LLM, a script, or a test fixture is behind it.
//! A ledger append failure aborts the episode immediately; an episode
//! whose trail cannot be recorded must not keep executing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use warden_core::action::{ActionKind, Proposal, StateSnapshot};
use warden_core::chain::EventType;
use warden_core::decision::KernelKey;
use warden_core::events::{
    EpisodeBegin, EpisodeEnd, EpisodeStatus, ExecResultRecorded, GateDecision, ProposalSeen,
};
use warden_core::gate::{self, Ruleset};

use crate::controller::Controller;
use crate::ledger::{Ledger, LedgerError};

/// Time source, injectable for tests.
pub trait Clock {
    /// Microseconds since the Unix epoch.
    fn now_micros(&self) -> u64;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Supervisor-facing cancellation flag.
///
/// Cancelling refuses actions that have not started yet; the in-flight
/// action is bounded by its own timeout. The episode then closes with
/// `status: cancelled`. Writes already committed are not rolled back; the
/// ledger records exactly what happened.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Builds proposals from workspace context and a bandit arm.
pub trait Proposer {
    /// Produces the next proposal for this snapshot.
    fn propose(&mut self, snapshot: &StateSnapshot, arm_id: &str) -> Proposal;
}

/// What an episode amounted to.
#[derive(Clone, Debug)]
pub struct EpisodeOutcome {
    /// Identifier the episode ran under.
    pub episode_id: String,
    /// Terminal status recorded in the ledger.
    pub status: EpisodeStatus,
    /// Whether the gate allowed the proposal.
    pub allowed: bool,
    /// Whether the last `RUN_TESTS` in the episode passed.
    pub tests_passed: bool,
    /// Per-action results, empty for denied episodes.
    pub results: Vec<warden_core::action::ExecResult>,
}

/// Episode failures. Everything except ledger loss is recorded *in* the
/// ledger rather than surfaced here.
#[derive(Debug, thiserror::Error)]
pub enum EpisodeError {
    /// The ledger could not be appended to; the episode is unfinished.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Runs episodes against one ledger and one controller.
pub struct EpisodeRunner<'a> {
    ledger: &'a mut Ledger,
    controller: &'a mut Controller,
    key: KernelKey,
    ruleset: Ruleset,
    clock: Box<dyn Clock>,
}

impl<'a> EpisodeRunner<'a> {
    /// Wires a runner over borrowed ledger and controller.
    #[must_use]
    pub fn new(
        ledger: &'a mut Ledger,
        controller: &'a mut Controller,
        key: KernelKey,
        ruleset: Ruleset,
    ) -> Self {
        Self {
            ledger,
            controller,
            key,
            ruleset,
            clock: Box::new(SystemClock),
        }
    }

    /// Replaces the time source (tests pin this for stable ledgers).
    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs one full episode: propose, gate, execute, record.
    ///
    /// # Errors
    ///
    /// Returns [`EpisodeError::Ledger`] when the trail could not be
    /// written; the caller must treat the episode as unfinished.
    pub fn run(
        &mut self,
        snapshot: &StateSnapshot,
        proposer: &mut dyn Proposer,
        arm_id: &str,
        episode_id: &str,
        cancel: &CancelToken,
    ) -> Result<EpisodeOutcome, EpisodeError> {
        self.append(
            EventType::EpisodeBegin,
            &EpisodeBegin {
                episode_id: episode_id.to_string(),
                arm_id: Some(arm_id.to_string()),
                snapshot: snapshot.clone(),
            },
        )?;

        if cancel.is_cancelled() {
            return self.close(episode_id, EpisodeStatus::Cancelled, false, false, Vec::new());
        }

        let proposal = proposer.propose(snapshot, arm_id);
        let decision = gate::evaluate(snapshot, &proposal, &self.ruleset, &self.key);

        self.append(
            EventType::ProposalSeen,
            &ProposalSeen {
                episode_id: episode_id.to_string(),
                input_hash: decision.input_hash,
                snapshot: snapshot.clone(),
                proposal,
            },
        )?;

        self.append(
            EventType::GateDecision,
            &GateDecision {
                episode_id: episode_id.to_string(),
                decision: decision.clone(),
            },
        )?;

        if !decision.allowed {
            info!(episode_id, reason = decision.reason.as_str(), "proposal denied");
            return self.close(episode_id, EpisodeStatus::Denied, false, false, Vec::new());
        }

        let results = self.controller.execute(snapshot, &decision, cancel);
        for result in &results {
            self.append(
                EventType::ExecResult,
                &ExecResultRecorded {
                    episode_id: episode_id.to_string(),
                    input_hash: decision.input_hash,
                    result: result.clone(),
                },
            )?;
        }

        let tests_passed = results
            .iter()
            .filter(|r| r.kind == ActionKind::RunTests)
            .next_back()
            .is_some_and(|r| r.ok);

        let status = if cancel.is_cancelled() {
            warn!(episode_id, "episode cancelled");
            EpisodeStatus::Cancelled
        } else {
            EpisodeStatus::Completed
        };

        self.close(episode_id, status, true, tests_passed, results)
    }

    fn close(
        &mut self,
        episode_id: &str,
        status: EpisodeStatus,
        allowed: bool,
        tests_passed: bool,
        results: Vec<warden_core::action::ExecResult>,
    ) -> Result<EpisodeOutcome, EpisodeError> {
        self.append(
            EventType::EpisodeEnd,
            &EpisodeEnd {
                episode_id: episode_id.to_string(),
                status,
                tests_passed,
            },
        )?;
        Ok(EpisodeOutcome {
            episode_id: episode_id.to_string(),
            status,
            allowed,
            tests_passed,
            results,
        })
    }

    fn append<T: serde::Serialize>(
        &mut self,
        event_type: EventType,
        payload: &T,
    ) -> Result<(), EpisodeError> {
        let value = serde_json::to_value(payload).map_err(|e| {
            LedgerError::CorruptEntry {
                line: 0,
                message: e.to_string(),
            }
        })?;
        let ts = self.clock.now_micros();
        self.ledger.append(event_type, value, ts)?;
        Ok(())
    }
}

/// Deterministic proposer used by the CLI and tests: read-only probes plus
/// a test run, shaped by the arm id.
#[derive(Clone, Debug, Default)]
pub struct StubProposer;

impl Proposer for StubProposer {
    fn propose(&mut self, _snapshot: &StateSnapshot, arm_id: &str) -> Proposal {
        use warden_core::action::Action;

        let run_tests = Action::RunTests {
            argv: vec!["pytest".to_string(), "-q".to_string()],
        };
        let actions = match arm_id {
            "diff_then_tests" => vec![
                Action::GitDiff {
                    paths: vec![],
                    context: 3,
                },
                run_tests,
            ],
            "grep_then_tests" => vec![
                Action::Grep {
                    pattern: "def test_".to_string(),
                    paths: vec![],
                },
                run_tests,
            ],
            _ => vec![run_tests],
        };

        let mut proposal = Proposal::new(actions);
        proposal.meta.insert("arm".to_string(), arm_id.to_string());
        proposal
    }
}

/// Test proposer that replays a scripted queue of proposals.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProposer {
    queue: std::collections::VecDeque<Proposal>,
}

impl ScriptedProposer {
    /// Queues proposals to be returned in order.
    #[must_use]
    pub fn new(proposals: Vec<Proposal>) -> Self {
        Self {
            queue: proposals.into(),
        }
    }
}

impl Proposer for ScriptedProposer {
    fn propose(&mut self, _snapshot: &StateSnapshot, _arm_id: &str) -> Proposal {
        self.queue.pop_front().unwrap_or_else(|| Proposal::new(vec![]))
    }
}
