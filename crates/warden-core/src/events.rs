//! Payload schemas for ledger events.
//!
//! Each [`EventType`](crate::chain::EventType) carries a payload with one of
//! these shapes. The writer (`warden-kernel`) serializes them; the replay
//! verifier deserializes and schema-checks them. Unknown fields are
//! tolerated on decode so old ledgers stay readable across additive
//! changes; the hash chain already pins the exact recorded bytes.

use serde::{Deserialize, Serialize};

use crate::action::{ExecResult, Proposal, StateSnapshot};
use crate::decision::Decision;
use crate::hashing::Digest;

/// How an episode ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    /// Every approved action executed (successfully or not).
    Completed,
    /// The gate denied the proposal.
    Denied,
    /// A supervisor signal cancelled the episode mid-flight.
    Cancelled,
    /// The episode aborted before reaching a verdict (e.g. ledger failure).
    Aborted,
}

/// Payload of `episode_begin`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeBegin {
    /// Caller-chosen episode identifier.
    pub episode_id: String,
    /// Bandit arm driving the proposer, when one was consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arm_id: Option<String>,
    /// The workspace context for the whole episode.
    pub snapshot: StateSnapshot,
}

/// Payload of `proposal_seen`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSeen {
    /// Episode this proposal belongs to.
    pub episode_id: String,
    /// Canonical hash of `(snapshot, proposal)`.
    pub input_hash: Digest,
    /// The snapshot, embedded so replay can re-run the gate.
    pub snapshot: StateSnapshot,
    /// The proposal, embedded so replay can re-run the gate.
    pub proposal: Proposal,
}

/// Payload of `gate_decision`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    /// Episode this decision belongs to.
    pub episode_id: String,
    /// The signed verdict, verbatim.
    #[serde(flatten)]
    pub decision: Decision,
}

/// Payload of `exec_result`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResultRecorded {
    /// Episode this result belongs to.
    pub episode_id: String,
    /// Input hash of the decision that authorized the action.
    pub input_hash: Digest,
    /// The per-action outcome.
    pub result: ExecResult,
}

/// Payload of `episode_end`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeEnd {
    /// Episode being closed.
    pub episode_id: String,
    /// Terminal status.
    pub status: EpisodeStatus,
    /// Whether the final `RUN_TESTS` in the episode passed.
    #[serde(default)]
    pub tests_passed: bool,
}
