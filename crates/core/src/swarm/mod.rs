//! # Swarm
//!
//! Parallel workers over isolated checkouts and fresh stores, plus the
//! transactional import that folds their results back into the canonical one.

pub mod coordinator;
pub mod import;

pub use coordinator::{run_swarm, MemberSummary, SwarmOutcome};
pub use import::import_worker;
