//! `warden replay`: verify a recorded ledger.

use std::path::Path;

use tracing::error;

use warden_core::gate::Ruleset;
use warden_kernel::config::WardenConfig;
use warden_kernel::replay::{exit_code_for, verify_ledger_file};

const EXIT_IO: u8 = 4;
const EXIT_USAGE: u8 = 64;

/// Verifies `ledger` and prints the verdict. Returns the process exit
/// code.
pub fn execute(ledger: &Path) -> u8 {
    let config = WardenConfig::from_env();
    let key = match config.kernel_key() {
        Ok(key) => key,
        Err(e) => {
            error!("config: {e}");
            return EXIT_USAGE;
        },
    };

    let report = match verify_ledger_file(ledger, &key, &Ruleset::default()) {
        Ok(report) => report,
        Err(e) => {
            error!("replay: {e}");
            return EXIT_IO;
        },
    };

    if report.valid {
        println!("ledger valid: {} entries", report.entry_count);
    } else {
        let seq = report
            .first_divergence
            .map_or_else(|| "?".to_string(), |r| r.seq.to_string());
        println!(
            "ledger INVALID: {} at seq {seq} ({} entries examined)",
            report.reason, report.entry_count
        );
    }

    u8::try_from(exit_code_for(&report)).unwrap_or(EXIT_IO)
}
