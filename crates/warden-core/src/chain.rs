//! Hash-chain model of the ledger.
//!
//! A ledger is a sequence of entries where each entry commits to its
//! predecessor: `entry_hash = SHA256(domain ‖ prev_hash ‖ u64_be(seq) ‖
//! u64_be(ts_micros) ‖ event_type ‖ canonical(payload))`. The first entry's
//! `prev_hash` is 32 zero bytes. This module owns the entry type, the line
//! encoding (one canonical-JSON object per line, keys in fixed order), and
//! pure chain verification; durable append lives in `warden-kernel`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::{self, CanonicalError};
use crate::hashing::{Digest, LEDGER_ENTRY_DOMAIN};

/// Event kinds a ledger may record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Episode opened.
    EpisodeBegin,
    /// A proposal arrived at the gate.
    ProposalSeen,
    /// The gate ruled.
    GateDecision,
    /// One action's execution outcome.
    ExecResult,
    /// Episode closed.
    EpisodeEnd,
}

impl EventType {
    /// Stable string form used in ledger lines and hash preimages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EpisodeBegin => "episode_begin",
            Self::ProposalSeen => "proposal_seen",
            Self::GateDecision => "gate_decision",
            Self::ExecResult => "exec_result",
            Self::EpisodeEnd => "episode_end",
        }
    }
}

/// One immutable ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerEntry {
    /// Zero-based, strictly incrementing sequence number.
    pub seq: u64,
    /// Microseconds since the Unix epoch.
    pub ts: u64,
    /// Hash of the previous entry; [`Digest::ZERO`] for the first.
    pub prev_hash: Digest,
    /// This entry's own hash.
    pub entry_hash: Digest,
    /// What happened.
    pub event_type: EventType,
    /// Event payload, canonical-encodable JSON.
    pub payload: Value,
}

/// Errors turning text into entries or entries into text.
#[derive(Debug, Error)]
pub enum LineError {
    /// The line is not valid JSON or not a valid entry object.
    #[error("malformed ledger line: {message}")]
    Malformed {
        /// Parser description.
        message: String,
    },

    /// The payload cannot be canonically encoded.
    #[error("payload not canonical: {0}")]
    Payload(#[from] CanonicalError),
}

/// Computes an entry hash from its constituent parts.
#[must_use]
pub fn compute_entry_hash(
    prev_hash: &Digest,
    seq: u64,
    ts_micros: u64,
    event_type: EventType,
    payload_canonical: &str,
) -> Digest {
    Digest::of_parts(
        LEDGER_ENTRY_DOMAIN,
        &[
            prev_hash.as_bytes(),
            &seq.to_be_bytes(),
            &ts_micros.to_be_bytes(),
            event_type.as_str().as_bytes(),
            payload_canonical.as_bytes(),
        ],
    )
}

/// Builds a fully-hashed entry on top of `prev_hash`.
///
/// # Errors
///
/// Returns [`LineError::Payload`] if the payload is not canonical-encodable
/// (floats, oversized numbers, absurd nesting).
pub fn make_entry(
    seq: u64,
    ts_micros: u64,
    prev_hash: Digest,
    event_type: EventType,
    payload: Value,
) -> Result<LedgerEntry, LineError> {
    let payload_canonical = canonical::canonicalize_value(&payload)?;
    // Reparse so the held value round-trips to the exact hashed bytes
    // (string normalization happens during encoding).
    let payload: Value =
        serde_json::from_str(&payload_canonical).map_err(|e| LineError::Malformed {
            message: e.to_string(),
        })?;
    let entry_hash = compute_entry_hash(&prev_hash, seq, ts_micros, event_type, &payload_canonical);
    Ok(LedgerEntry {
        seq,
        ts: ts_micros,
        prev_hash,
        entry_hash,
        event_type,
        payload,
    })
}

/// Encodes an entry as one ledger line (no trailing newline), keys in the
/// fixed order `seq, ts, prev_hash, entry_hash, event_type, payload`.
///
/// # Errors
///
/// Returns [`LineError::Payload`] if the payload is not canonical-encodable.
pub fn encode_line(entry: &LedgerEntry) -> Result<String, LineError> {
    let payload = canonical::canonicalize_value(&entry.payload)?;
    Ok(format!(
        r#"{{"seq":{},"ts":{},"prev_hash":"{}","entry_hash":"{}","event_type":"{}","payload":{}}}"#,
        entry.seq,
        entry.ts,
        entry.prev_hash,
        entry.entry_hash,
        entry.event_type.as_str(),
        payload,
    ))
}

/// Decodes one ledger line.
///
/// # Errors
///
/// Returns [`LineError::Malformed`] if the line is not a well-formed entry.
pub fn decode_line(line: &str) -> Result<LedgerEntry, LineError> {
    serde_json::from_str(line).map_err(|e| LineError::Malformed {
        message: e.to_string(),
    })
}

/// A break in the hash chain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainFault {
    /// The recomputed entry hash does not match the recorded one.
    #[error("entry hash mismatch at seq {seq}")]
    HashMismatch {
        /// Sequence number of the first bad entry.
        seq: u64,
    },

    /// An entry's `prev_hash` does not match its predecessor.
    #[error("prev hash mismatch at seq {seq}")]
    PrevHashMismatch {
        /// Sequence number of the first bad entry.
        seq: u64,
    },

    /// Sequence numbers are not contiguous from zero.
    #[error("sequence gap: expected {expected}, found {found}")]
    SeqGap {
        /// The expected sequence number.
        expected: u64,
        /// The sequence number actually recorded.
        found: u64,
    },

    /// An entry's payload is not canonical-encodable, so its hash cannot
    /// even be recomputed.
    #[error("unhashable payload at seq {seq}")]
    UnhashablePayload {
        /// Sequence number of the offending entry.
        seq: u64,
    },
}

/// Verifies hash-chain integrity over entries in file order.
///
/// # Errors
///
/// Returns the first [`ChainFault`] encountered.
pub fn verify_chain<'a, I>(entries: I) -> Result<u64, ChainFault>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let mut expected_seq: u64 = 0;
    let mut prev_hash = Digest::ZERO;
    let mut count: u64 = 0;

    for entry in entries {
        if entry.seq != expected_seq {
            return Err(ChainFault::SeqGap {
                expected: expected_seq,
                found: entry.seq,
            });
        }
        if entry.prev_hash != prev_hash {
            return Err(ChainFault::PrevHashMismatch { seq: entry.seq });
        }
        let payload_canonical = canonical::canonicalize_value(&entry.payload)
            .map_err(|_| ChainFault::UnhashablePayload { seq: entry.seq })?;
        let recomputed = compute_entry_hash(
            &entry.prev_hash,
            entry.seq,
            entry.ts,
            entry.event_type,
            &payload_canonical,
        );
        if recomputed != entry.entry_hash {
            return Err(ChainFault::HashMismatch { seq: entry.seq });
        }
        prev_hash = entry.entry_hash;
        expected_seq += 1;
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn build_chain(payloads: &[Value]) -> Vec<LedgerEntry> {
        let mut entries = Vec::new();
        let mut prev = Digest::ZERO;
        for (i, payload) in payloads.iter().enumerate() {
            let entry = make_entry(
                i as u64,
                1_707_006_123_000_000 + i as u64,
                prev,
                EventType::ProposalSeen,
                payload.clone(),
            )
            .unwrap();
            prev = entry.entry_hash;
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn line_round_trip_preserves_hash() {
        let entry = make_entry(
            3,
            1_707_006_123_000_000,
            Digest::ZERO,
            EventType::GateDecision,
            json!({"allowed": true, "reason": "ok"}),
        )
        .unwrap();
        let line = encode_line(&entry).unwrap();
        assert!(line.starts_with(r#"{"seq":3,"ts":1707006123000000,"prev_hash":"#));
        let back = decode_line(&line).unwrap();
        assert_eq!(back, entry);
        assert!(verify_chain([&back]).is_err(), "seq 3 cannot open a chain");
    }

    #[test]
    fn valid_chain_verifies() {
        let entries = build_chain(&[json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]);
        assert_eq!(verify_chain(entries.iter()).unwrap(), 3);
    }

    #[test]
    fn payload_tamper_is_detected_at_the_right_seq() {
        let mut entries = build_chain(&[json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]);
        entries[2].payload = json!({"c": 4});
        assert_eq!(
            verify_chain(entries.iter()),
            Err(ChainFault::HashMismatch { seq: 2 })
        );
    }

    #[test]
    fn dropped_entry_is_a_gap() {
        let mut entries = build_chain(&[json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]);
        entries.remove(1);
        assert_eq!(
            verify_chain(entries.iter()),
            Err(ChainFault::SeqGap {
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn rewired_prev_hash_is_detected() {
        let mut entries = build_chain(&[json!({"a": 1}), json!({"b": 2})]);
        entries[1].prev_hash = Digest::ZERO;
        assert_eq!(
            verify_chain(entries.iter()),
            Err(ChainFault::PrevHashMismatch { seq: 1 })
        );
    }

    #[test]
    fn event_type_strings_are_stable() {
        assert_eq!(EventType::EpisodeBegin.as_str(), "episode_begin");
        assert_eq!(EventType::ExecResult.as_str(), "exec_result");
        assert_eq!(
            serde_json::to_string(&EventType::GateDecision).unwrap(),
            "\"gate_decision\""
        );
    }

    #[test]
    fn entry_hash_depends_on_every_part() {
        let base = make_entry(
            0,
            1000,
            Digest::ZERO,
            EventType::EpisodeBegin,
            json!({"k": "v"}),
        )
        .unwrap();

        let other_ts = make_entry(
            0,
            1001,
            Digest::ZERO,
            EventType::EpisodeBegin,
            json!({"k": "v"}),
        )
        .unwrap();
        assert_ne!(base.entry_hash, other_ts.entry_hash);

        let other_type = make_entry(
            0,
            1000,
            Digest::ZERO,
            EventType::EpisodeEnd,
            json!({"k": "v"}),
        )
        .unwrap();
        assert_ne!(base.entry_hash, other_type.entry_hash);
    }
}
