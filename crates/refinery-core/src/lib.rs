//! Refinery-core - coordination for a rig's merge queue
//!
//! This crate provides:
//! - Advisory resource locks with heartbeats and stale-owner reclamation
//! - A durable checkpoint of in-flight queue work
//! - An append-only event log of lock and queue transitions
//! - The merge queue engine that rebases, verifies and pushes worker branches
//!
//! All fallible operations return [`Result`]; no `unwrap`, `expect` or `panic`
//! outside tests.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
mod fsutil;
pub mod git;
pub mod layout;
pub mod ledger;
pub mod lock;
pub mod notify;
pub mod shutdown;

pub use checkpoint::{Checkpoint, CheckpointStore, Stage};
pub use config::{load_config, MergeQueueConfig, OnConflict, RefineryConfig, RuntimeConfig};
pub use discovery::{Candidate, CandidateSource, GitBranchSource};
pub use engine::{
    CandidateOutcome, EngineState, Fleet, GateClearance, MainFixer, MergeQueueEngine, Recovery,
    RunMode, RunSummary,
};
pub use error::{Error, Result};
pub use events::{Event, EventKind, EventLog};
pub use git::{GitCli, GitOps};
pub use layout::RigLayout;
pub use ledger::QueueLedger;
pub use lock::{LockManager, OwnerId, ResourceKey};
pub use notify::{IssueTracker, JsonlOutbox, OwnerNotifier, RejectionReason};
