//! # warden-core
//!
//! Deterministic heart of the warden safety kernel: the value types that
//! cross the proposer boundary, the canonical encoding they hash under,
//! the gate that rules on proposals, patch safety, the hash-chain model of
//! the ledger, the replay verifier, and the Thompson-sampling bandit.
//!
//! Everything in this crate is deterministic: no clocks, no randomness
//! outside caller-supplied seeds, no mutation of anything it is handed.
//! The only filesystem access is read-only symlink resolution during path
//! confinement. All effects (subprocesses, ledger files, databases) live
//! in `warden-kernel`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod action;
pub mod bandit;
pub mod canonical;
pub mod chain;
pub mod decision;
pub mod events;
pub mod gate;
pub mod hashing;
pub mod paths;
pub mod patch;
pub mod replay;

pub use action::{Action, ActionKind, ErrorKind, ExecResult, Proposal, StateSnapshot};
pub use decision::{Decision, KernelKey, ReasonCode};
pub use gate::{Ruleset, KERNEL_VERSION, RULESET_VERSION};
pub use hashing::Digest;
