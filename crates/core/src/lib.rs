//! # Crucible
//!
//! An orchestrator for iterative, adversarial experimentation. Hypotheses are
//! classified and gated, built by an external agent on an isolated branch,
//! attacked by challenger and doubter passes, verified component by
//! component, and resolved: merged, cycled back with accumulated guidance, or
//! recorded as a dead end whose constraints future experiments must respect.
//! A swarm mode runs several mechanism-distinct experiments in parallel
//! worktrees and merges the single best result.

pub mod agent;
pub mod breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod lifecycle;
pub mod resolve;
pub mod state;
pub mod swarm;
pub mod tools;
pub mod workflow;

pub use config::CycleConfig;
pub use context::CycleContext;
pub use error::CoreError;
pub use lifecycle::ExperimentStatus;
