//! # State Layer
//!
//! SQLite-backed store plus the entity managers. One canonical instance per
//! project; swarm workers run against fresh instances that get imported back.

pub mod db;
pub mod experiment;
pub mod io;
pub mod records;

pub use db::ExperimentDb;
pub use experiment::{generate_slug, Experiment, ExperimentManager};
pub use records::{
    Challenge, ChallengeManager, DeadEnd, DeadEndCategory, DeadEndManager, Decision,
    DecisionManager, DecisionStatus, Doubt, DoubtManager, DoubtOutcome, DoubtSeverity,
    EvidenceLevel, FragilityManager, Grade, MetricManager, MetricPhase, MetricSample,
    SwarmManager, TallyManager, Verification, VerificationManager,
};
