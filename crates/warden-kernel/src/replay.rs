//! On-disk ledger verification.
//!
//! Thin I/O shim over the core replay verifier: read the file, decode the
//! lines, hand the entries to [`warden_core::replay::verify`], and map the
//! verdict onto the process exit codes the CLI contract fixes.

use std::path::Path;

use thiserror::Error;
use tracing::info;

use warden_core::decision::KernelKey;
use warden_core::gate::Ruleset;
use warden_core::replay::{ReplayFault, ReplayReport};

use crate::ledger::{Ledger, LedgerError};

/// Exit code for a valid ledger.
pub const EXIT_VALID: i32 = 0;

/// Exit code for a structurally invalid ledger.
pub const EXIT_LEDGER_INVALID: i32 = 2;

/// Exit code for a gate divergence.
pub const EXIT_GATE_DIVERGENCE: i32 = 3;

/// Exit code for an I/O failure.
pub const EXIT_IO_ERROR: i32 = 4;

/// Failures before verification could even run.
#[derive(Debug, Error)]
pub enum ReplayIoError {
    /// The ledger file could not be read or decoded.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Reads and verifies a ledger file.
///
/// # Errors
///
/// Returns [`ReplayIoError`] when the file cannot be read or a line will
/// not decode; verification verdicts (including tampering) come back as a
/// [`ReplayReport`].
pub fn verify_ledger_file(
    path: &Path,
    key: &KernelKey,
    ruleset: &Ruleset,
) -> Result<ReplayReport, ReplayIoError> {
    let entries = Ledger::read_entries(path)?;
    let report = warden_core::replay::verify(&entries, key, ruleset);
    info!(
        path = %path.display(),
        valid = report.valid,
        entries = report.entry_count,
        reason = %report.reason,
        "ledger verified"
    );
    Ok(report)
}

/// Maps a report onto the CLI exit-code contract.
#[must_use]
pub fn exit_code_for(report: &ReplayReport) -> i32 {
    if report.valid {
        EXIT_VALID
    } else if report.fault_kind() == Some(ReplayFault::GateDivergence) {
        EXIT_GATE_DIVERGENCE
    } else {
        EXIT_LEDGER_INVALID
    }
}

#[cfg(test)]
mod tests {
    use warden_core::replay::EntryRef;

    use super::*;

    fn report(valid: bool, reason: &str) -> ReplayReport {
        ReplayReport {
            valid,
            reason: reason.to_string(),
            entry_count: 5,
            first_divergence: if valid { None } else { Some(EntryRef { seq: 2 }) },
        }
    }

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(exit_code_for(&report(true, "ok")), EXIT_VALID);
        assert_eq!(
            exit_code_for(&report(false, "hash_mismatch")),
            EXIT_LEDGER_INVALID
        );
        assert_eq!(
            exit_code_for(&report(false, "seq_gap")),
            EXIT_LEDGER_INVALID
        );
        assert_eq!(
            exit_code_for(&report(false, "signature_invalid")),
            EXIT_LEDGER_INVALID
        );
        assert_eq!(
            exit_code_for(&report(false, "gate_divergence")),
            EXIT_GATE_DIVERGENCE
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = verify_ledger_file(
            Path::new("/definitely/missing/ledger.jsonl"),
            &KernelKey::development_default(),
            &Ruleset::default(),
        );
        assert!(err.is_err());
    }
}
