//! # Resolution
//!
//! Grade aggregation, guidance accumulation, and the engine that turns a
//! verified experiment into a merge, a cycle-back, or a dead end.

pub mod engine;
pub mod grade;
pub mod guidance;

pub use engine::{resolve_db_only, resolve_experiment, Disposition, ResolutionOutcome};
pub use grade::worst_grade;
