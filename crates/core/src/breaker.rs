//! # Circuit Breaker
//!
//! Repeated weak/rejected outcomes within one problem category (`sub_type`)
//! stop automatic cycling. The tally is cumulative across experiments and
//! only resets through explicit operator review, which today means editing
//! the store by hand.

use anyhow::Result;

use crate::error::CoreError;
use crate::lifecycle::{self, ExperimentStatus};
use crate::state::{
    DeadEndCategory, DeadEndManager, Experiment, ExperimentDb, ExperimentManager, TallyManager,
};

/// Snapshot of the breaker for one sub_type.
#[derive(Debug, Clone)]
pub struct BreakerStatus {
    pub sub_type: String,
    pub tally: u32,
    pub threshold: u32,
}

impl BreakerStatus {
    pub fn tripped(&self) -> bool {
        self.tally >= self.threshold
    }
}

/// Current breaker state for a sub_type.
pub fn check(db: &ExperimentDb, sub_type: &str, threshold: u32) -> Result<BreakerStatus> {
    let tally = TallyManager::new(db).get(sub_type)?;
    Ok(BreakerStatus {
        sub_type: sub_type.to_string(),
        tally,
        threshold,
    })
}

/// Count one weak/rejected outcome and return the updated state.
pub fn record_failure(db: &ExperimentDb, sub_type: &str, threshold: u32) -> Result<BreakerStatus> {
    let tally = TallyManager::new(db).increment(sub_type)?;
    let status = BreakerStatus {
        sub_type: sub_type.to_string(),
        tally,
        threshold,
    };
    if status.tripped() {
        tracing::warn!(
            sub_type,
            tally,
            threshold,
            "circuit breaker threshold reached"
        );
    }
    Ok(status)
}

/// Called before any build or cycle-back on a sub_type. A tripped breaker
/// records a procedural dead end citing the breaker, moves the experiment to
/// DEAD_END, and returns the typed error so the caller stops the loop.
pub fn enforce(db: &ExperimentDb, experiment: &Experiment, threshold: u32) -> Result<()> {
    let status = check(db, &experiment.sub_type, threshold)?;
    if !status.tripped() {
        return Ok(());
    }

    DeadEndManager::new(db).record(
        experiment.id,
        &experiment.hypothesis,
        &format!(
            "circuit breaker: {} weak/rejected outcomes in sub_type `{}` (threshold {})",
            status.tally, experiment.sub_type, threshold
        ),
        "",
        &experiment.sub_type,
        DeadEndCategory::Procedural,
    )?;

    if !lifecycle::is_terminal(experiment.status) {
        ExperimentManager::new(db).set_status(&experiment.slug, ExperimentStatus::DeadEnd)?;
    }
    tracing::warn!(
        slug = %experiment.slug,
        sub_type = %experiment.sub_type,
        tally = status.tally,
        "experiment closed by circuit breaker"
    );

    Err(CoreError::BreakerTripped {
        sub_type: experiment.sub_type.clone(),
        tally: status.tally,
        threshold,
    }
    .into())
}
