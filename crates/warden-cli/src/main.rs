//! warden - deterministic safety kernel for code-repair agents
//!
//! `warden run` drives gated episodes against a workspace; `warden replay`
//! verifies a recorded ledger. Exit codes: 0 success, 2 invalid ledger,
//! 3 gate divergence, 4 I/O error, 64 usage error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

const EXIT_USAGE: u8 = 64;

/// warden - deterministic safety kernel
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run gated episodes against a workspace
    Run {
        /// Workspace root the episodes operate on
        #[arg(long)]
        workspace: PathBuf,

        /// Number of episodes to run
        #[arg(long, default_value_t = 1)]
        episodes: u32,

        /// Verbose logging (same as --log-level debug)
        #[arg(long)]
        verbose: bool,
    },

    /// Verify a recorded ledger's integrity and gate determinism
    Replay {
        /// Path of the ledger file
        #[arg(long)]
        ledger: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            return ExitCode::from(code);
        },
    };

    let level = match &cli.command {
        Commands::Run { verbose: true, .. } => "debug",
        _ => cli.log_level.as_str(),
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let code = match cli.command {
        Commands::Run {
            workspace,
            episodes,
            ..
        } => commands::run::execute(&workspace, episodes),
        Commands::Replay { ledger } => commands::replay::execute(&ledger),
    };
    ExitCode::from(code)
}
