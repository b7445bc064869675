//! Replay verification.
//!
//! Given the parsed entries of a ledger, certify three things: the hash
//! chain reproduces, every recorded decision's signature verifies under the
//! live key, and the gate — re-run on each embedded snapshot/proposal pair
//! — produces a byte-identical decision. Execution results are historical
//! facts; they are schema-checked, never re-executed.
//!
//! The verifier has no side effects beyond the gate's own read-only path
//! resolution, which means gate re-evaluation assumes the recorded
//! workspace still exists where the snapshot says it does.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::chain::{self, ChainFault, EventType, LedgerEntry};
use crate::decision::KernelKey;
use crate::events::{
    EpisodeBegin, EpisodeEnd, ExecResultRecorded, GateDecision, ProposalSeen,
};
use crate::gate::{self, Ruleset};
use crate::hashing::Digest;

/// Why replay verification failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayFault {
    /// An entry hash (or prev-hash link) does not reproduce.
    HashMismatch,
    /// Sequence numbers are not contiguous from zero.
    SeqGap,
    /// A recorded decision's signature does not verify.
    SignatureInvalid,
    /// Re-running the gate produced different decision bytes.
    GateDivergence,
    /// A payload does not match its event schema.
    SchemaInvalid,
}

impl ReplayFault {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HashMismatch => "hash_mismatch",
            Self::SeqGap => "seq_gap",
            Self::SignatureInvalid => "signature_invalid",
            Self::GateDivergence => "gate_divergence",
            Self::SchemaInvalid => "schema_invalid",
        }
    }
}

/// Reference to the first divergent entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRef {
    /// Sequence number of the entry.
    pub seq: u64,
}

/// Structured replay verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// True iff every check passed.
    pub valid: bool,
    /// `"ok"` or the fault's stable string.
    pub reason: String,
    /// Number of entries examined.
    pub entry_count: u64,
    /// First divergent entry, when invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_divergence: Option<EntryRef>,
}

impl ReplayReport {
    fn ok(entry_count: u64) -> Self {
        Self {
            valid: true,
            reason: "ok".to_string(),
            entry_count,
            first_divergence: None,
        }
    }

    fn fault(fault: ReplayFault, seq: u64, entry_count: u64) -> Self {
        Self {
            valid: false,
            reason: fault.as_str().to_string(),
            entry_count,
            first_divergence: Some(EntryRef { seq }),
        }
    }

    /// The fault, if any, parsed back from the reason string.
    #[must_use]
    pub fn fault_kind(&self) -> Option<ReplayFault> {
        match self.reason.as_str() {
            "hash_mismatch" => Some(ReplayFault::HashMismatch),
            "seq_gap" => Some(ReplayFault::SeqGap),
            "signature_invalid" => Some(ReplayFault::SignatureInvalid),
            "gate_divergence" => Some(ReplayFault::GateDivergence),
            "schema_invalid" => Some(ReplayFault::SchemaInvalid),
            _ => None,
        }
    }
}

/// Verifies a parsed ledger end to end.
#[must_use]
pub fn verify(entries: &[LedgerEntry], key: &KernelKey, ruleset: &Ruleset) -> ReplayReport {
    let entry_count = entries.len() as u64;

    // Chain integrity first; nothing else is trustworthy until the bytes
    // are pinned.
    if let Err(fault) = chain::verify_chain(entries.iter()) {
        let (kind, seq) = match fault {
            ChainFault::HashMismatch { seq } | ChainFault::PrevHashMismatch { seq } => {
                (ReplayFault::HashMismatch, seq)
            },
            ChainFault::SeqGap { found, .. } => (ReplayFault::SeqGap, found),
            ChainFault::UnhashablePayload { seq } => (ReplayFault::SchemaInvalid, seq),
        };
        return ReplayReport::fault(kind, seq, entry_count);
    }

    let mut proposals_by_hash: HashMap<Digest, ProposalSeen> = HashMap::new();

    for entry in entries {
        match entry.event_type {
            EventType::EpisodeBegin => {
                if decode::<EpisodeBegin>(entry).is_none() {
                    return ReplayReport::fault(ReplayFault::SchemaInvalid, entry.seq, entry_count);
                }
            },

            EventType::ProposalSeen => {
                let Some(seen) = decode::<ProposalSeen>(entry) else {
                    return ReplayReport::fault(ReplayFault::SchemaInvalid, entry.seq, entry_count);
                };
                proposals_by_hash.insert(seen.input_hash, seen);
            },

            EventType::GateDecision => {
                let Some(recorded) = decode::<GateDecision>(entry) else {
                    return ReplayReport::fault(ReplayFault::SchemaInvalid, entry.seq, entry_count);
                };

                if !key.verify(&recorded.decision) {
                    return ReplayReport::fault(
                        ReplayFault::SignatureInvalid,
                        entry.seq,
                        entry_count,
                    );
                }

                let Some(seen) = proposals_by_hash.get(&recorded.decision.input_hash) else {
                    // A decision with no recorded inputs cannot be replayed.
                    return ReplayReport::fault(ReplayFault::SchemaInvalid, entry.seq, entry_count);
                };

                let rerun = gate::evaluate(&seen.snapshot, &seen.proposal, ruleset, key);
                if !decisions_byte_identical(&recorded, &rerun) {
                    return ReplayReport::fault(
                        ReplayFault::GateDivergence,
                        entry.seq,
                        entry_count,
                    );
                }
            },

            EventType::ExecResult => {
                if decode::<ExecResultRecorded>(entry).is_none() {
                    return ReplayReport::fault(ReplayFault::SchemaInvalid, entry.seq, entry_count);
                }
            },

            EventType::EpisodeEnd => {
                if decode::<EpisodeEnd>(entry).is_none() {
                    return ReplayReport::fault(ReplayFault::SchemaInvalid, entry.seq, entry_count);
                }
            },
        }
    }

    ReplayReport::ok(entry_count)
}

fn decode<T: serde::de::DeserializeOwned>(entry: &LedgerEntry) -> Option<T> {
    serde_json::from_value(entry.payload.clone()).ok()
}

fn decisions_byte_identical(
    recorded: &GateDecision,
    rerun: &crate::decision::Decision,
) -> bool {
    let recorded_bytes = canonical::to_canonical_string(&recorded.decision);
    let rerun_bytes = canonical::to_canonical_string(rerun);
    matches!((recorded_bytes, rerun_bytes), (Ok(a), Ok(b)) if a == b)
}
