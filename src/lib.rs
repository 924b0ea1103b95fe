//! Drover - role-based multi-agent orchestrator.
//!
//! Coordinates independent AI coding agents into a collaborative
//! pipeline: goals decompose into a per-group task DAG, role-based
//! agent loops claim work through a race-free protocol backed by
//! SQLite, and a routing policy turns completed work into follow-up
//! tasks until the group is terminal. The fleet autoscales per role and
//! recovers orphaned work through heartbeats.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use services::{Orchestrator, ShutdownOutcome};
