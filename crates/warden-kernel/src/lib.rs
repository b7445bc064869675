//! # warden-kernel
//!
//! The effectful half of the warden safety kernel: the controller that
//! executes approved actions under confinement and budget caps, the
//! durable hash-chained ledger, the constrained test runner, the episode
//! supervisor that wires proposer → gate → controller → ledger, the
//! bandit outcome store, and ledger replay from disk.
//!
//! # Modules
//!
//! - [`config`]: runtime configuration with environment overrides
//! - [`controller`]: sequential executor for approved actions
//! - [`episode`]: episode supervision and the proposer seam
//! - [`fs_atomic`]: crash-safe file primitives
//! - [`ledger`]: append-only JSONL ledger with checkpointing
//! - [`outcomes`]: SQLite-backed bandit persistence
//! - [`patch_apply`]: controlled unified-diff application
//! - [`replay`]: on-disk ledger verification
//! - [`runner`]: bounded subprocess execution and the test-runner seam

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod episode;
pub mod fs_atomic;
pub mod ledger;
pub mod outcomes;
pub mod patch_apply;
pub mod replay;
pub mod runner;

pub use config::WardenConfig;
pub use controller::Controller;
pub use episode::{CancelToken, EpisodeOutcome, EpisodeRunner, Proposer};
pub use ledger::Ledger;
