//! # Domain Errors
//!
//! Typed failures that callers branch on. Everything else flows through
//! `anyhow` with context, in keeping with the rest of the crate.

use thiserror::Error;

use crate::agent::AgentRole;
use crate::lifecycle::ExperimentStatus;

/// Hard domain failures. State-machine and grade-computation violations
/// propagate uncaught to the command layer; subprocess failures are caught
/// at the boundary where they occur and downgraded to warnings.
#[derive(Debug, Error)]
pub enum CoreError {
    /// All three extraction tiers failed. Loud by design: callers must hold
    /// the workflow at its current status, never substitute a default.
    #[error("all extraction tiers failed for {role} output ({raw_len} raw chars preserved)")]
    ExtractionFailure { role: AgentRole, raw_len: usize },

    /// Requested status change is not in the adjacency table.
    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    /// A version-control / metrics / build-verification command failed.
    #[error("subprocess `{command}` failed: {reason}")]
    SubprocessFailure { command: String, reason: String },

    /// A subprocess exceeded its deadline. Treated as a failed attempt for
    /// that step, never as a process crash.
    #[error("subprocess `{command}` timed out after {seconds}s")]
    SubprocessTimeout { command: String, seconds: u64 },

    /// Grade resolution was called with zero verification grades. This is a
    /// data-integrity bug upstream, not a recoverable condition.
    #[error("worst_grade called with an empty verification set")]
    EmptyVerificationSet,

    /// The per-sub_type failure tally reached its threshold. No further
    /// automatic cycling on this category without explicit review.
    #[error("circuit breaker tripped for sub_type `{sub_type}` ({tally} failures >= threshold {threshold})")]
    BreakerTripped {
        sub_type: String,
        tally: u32,
        threshold: u32,
    },

    /// The shared working copy has uncommitted changes; a swarm refuses to
    /// start on a dirty tree.
    #[error("working tree has uncommitted changes; commit or stash before starting a swarm")]
    DirtyWorkingTree,
}
