//! Decisions and the kernel signing key.
//!
//! A [`Decision`] is the gate's signed verdict on a proposal. The signature
//! is an HMAC-SHA256 tag over the decision's canonical bytes under a
//! process-scoped key; producer and consumer are the same process, so a
//! symmetric tag is sufficient. The controller refuses any decision whose
//! tag does not verify against the live key.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::action::{Action, Proposal, StateSnapshot};
use crate::canonical;
use crate::gate::{KERNEL_VERSION, RULESET_VERSION};
use crate::hashing::{Digest, DECISION_SIG_DOMAIN, GATE_INPUT_DOMAIN};

type HmacSha256 = Hmac<Sha256>;

/// Stable reason codes for gate verdicts.
///
/// The set is closed: every denial maps to exactly one of these, and the
/// snake_case encoding is part of the ledger format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// All rules passed.
    Ok,
    /// The proposal carried no actions.
    EmptyProposal,
    /// More actions than the per-proposal cap.
    TooManyActions,
    /// Two `WRITE_FILE` actions target the same path.
    DuplicateWrite,
    /// A wire payload carried an unrecognized action kind.
    UnknownAction,
    /// `RUN_TESTS` argv is not on the allowlist.
    BadTestArgv,
    /// A path resolves outside the workspace.
    PathEscape,
    /// A path names a blocked segment such as `.git`.
    BlockedSegment,
    /// A NUL byte appeared in a path or payload.
    NulInPayload,
    /// Proposed write volume exceeds a byte budget.
    BudgetExceeded,
    /// The unified diff could not be parsed safely.
    PatchParseError,
    /// A patch introduces a forbidden file mode.
    BadMode,
    /// The snapshot's workspace root is not a directory.
    WorkspaceMissing,
}

impl ReasonCode {
    /// The stable string form recorded in ledgers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::EmptyProposal => "empty_proposal",
            Self::TooManyActions => "too_many_actions",
            Self::DuplicateWrite => "duplicate_write",
            Self::UnknownAction => "unknown_action",
            Self::BadTestArgv => "bad_test_argv",
            Self::PathEscape => "path_escape",
            Self::BlockedSegment => "blocked_segment",
            Self::NulInPayload => "nul_in_payload",
            Self::BudgetExceeded => "budget_exceeded",
            Self::PatchParseError => "patch_parse_error",
            Self::BadMode => "bad_mode",
            Self::WorkspaceMissing => "workspace_missing",
        }
    }
}

/// The gate's signed verdict on a proposal.
///
/// Tolerant of unknown fields on decode: this struct is flattened into the
/// `gate_decision` ledger payload, and the signature pins the fields that
/// matter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// True iff every rule passed.
    pub allowed: bool,
    /// Reason code; [`ReasonCode::Ok`] when allowed.
    pub reason: ReasonCode,
    /// The input actions, verbatim, when allowed; empty otherwise.
    /// Partial approvals do not exist.
    pub approved_actions: Vec<Action>,
    /// Canonical hash of `(snapshot, proposal)` plus kernel and ruleset
    /// versions.
    pub input_hash: Digest,
    /// HMAC-SHA256 tag binding this decision to the kernel key.
    pub signature: Digest,
}

/// Errors constructing a [`KernelKey`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid kernel key: expected 64 hex characters")]
pub struct KeyParseError;

/// Process-scoped symmetric signing key, read once at startup and held
/// immutably.
#[derive(Clone)]
pub struct KernelKey {
    bytes: [u8; 32],
}

impl std::fmt::Debug for KernelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never render key material.
        f.write_str("KernelKey(..)")
    }
}

impl KernelKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Parses a key from 64 hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`KeyParseError`] on malformed input.
    pub fn from_hex(hex_key: &str) -> Result<Self, KeyParseError> {
        if hex_key.len() != 64 {
            return Err(KeyParseError);
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_key, &mut bytes).map_err(|_| KeyParseError)?;
        Ok(Self::new(bytes))
    }

    /// Fixed development key for environments that do not configure one.
    ///
    /// Signatures under this key prove only that the decision passed
    /// through the gate code path of this process, which is all the
    /// single-process trust model requires.
    #[must_use]
    pub const fn development_default() -> Self {
        Self::new(*b"warden-dev-key-0warden-dev-key-0")
    }

    /// Computes the signature tag for the given decision fields.
    #[must_use]
    pub fn sign(
        &self,
        input_hash: &Digest,
        allowed: bool,
        reason: ReasonCode,
        approved_actions: &[Action],
    ) -> Digest {
        #[derive(Serialize)]
        struct SigPayload<'a> {
            input_hash: &'a Digest,
            allowed: bool,
            reason: ReasonCode,
            approved_actions: &'a [Action],
        }

        let canonical = canonical::to_canonical_string(&SigPayload {
            input_hash,
            allowed,
            reason,
            approved_actions,
        })
        .expect("decision fields are always canonical-encodable");

        let mut mac = HmacSha256::new_from_slice(&self.bytes)
            .expect("HMAC accepts 32-byte keys");
        mac.update(DECISION_SIG_DOMAIN);
        mac.update(canonical.as_bytes());
        let tag = mac.finalize().into_bytes();

        let mut out = [0u8; 32];
        out.copy_from_slice(&tag);
        Digest(out)
    }

    /// Verifies a decision's signature in constant time.
    #[must_use]
    pub fn verify(&self, decision: &Decision) -> bool {
        let expected = self.sign(
            &decision.input_hash,
            decision.allowed,
            decision.reason,
            &decision.approved_actions,
        );
        expected
            .as_bytes()
            .ct_eq(decision.signature.as_bytes())
            .into()
    }
}

/// Computes the canonical input hash over a snapshot/proposal pair.
///
/// Kernel and ruleset versions are folded in so that a rule change is
/// visible as a different input, never as a silent divergence.
#[must_use]
pub fn gate_input_hash(snapshot: &StateSnapshot, proposal: &Proposal) -> Digest {
    #[derive(Serialize)]
    struct InputPayload<'a> {
        kernel_version: &'static str,
        ruleset_version: &'static str,
        snapshot: &'a StateSnapshot,
        proposal: &'a Proposal,
    }

    let canonical = canonical::to_canonical_string(&InputPayload {
        kernel_version: KERNEL_VERSION,
        ruleset_version: RULESET_VERSION,
        snapshot,
        proposal,
    })
    .expect("snapshot and proposal are always canonical-encodable");

    Digest::of_parts(GATE_INPUT_DOMAIN, &[canonical.as_bytes()])
}
