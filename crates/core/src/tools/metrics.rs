//! # Metrics Capture
//!
//! Runs the configured metrics command, parses its fixtures/metrics JSON, and
//! records snapshots. Comparison against the before-phase drives gating and
//! regression detection at resolution time.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::config::{CycleConfig, Direction};
use crate::error::CoreError;
use crate::state::{ExperimentDb, MetricManager, MetricPhase};

/// One metric compared across phases.
#[derive(Debug, Clone)]
pub struct MetricComparison {
    pub fixture: String,
    pub metric: String,
    pub before: f64,
    pub after: f64,
    pub direction: Direction,
    /// True when the after-phase value moved against the metric's direction.
    pub regressed: bool,
    /// True when the fixture is a configured gate fixture.
    pub gated: bool,
}

/// Run the metrics command and record a snapshot for `phase`.
/// No metrics command configured means no snapshot, silently.
pub async fn capture_snapshot(
    db: &ExperimentDb,
    config: &CycleConfig,
    project_root: &Path,
    experiment_id: i64,
    phase: MetricPhase,
) -> Result<usize> {
    let Some(command) = &config.metrics_command else {
        return Ok(0);
    };

    let output = tokio::time::timeout(
        config.subprocess_timeout(),
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(project_root)
            .output(),
    )
    .await
    .map_err(|_| CoreError::SubprocessTimeout {
        command: command.clone(),
        seconds: config.subprocess_timeout_secs,
    })?
    .with_context(|| format!("Failed to run metrics command `{command}`"))?;

    if !output.status.success() {
        return Err(CoreError::SubprocessFailure {
            command: command.clone(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }

    let samples = parse_metrics_json(&String::from_utf8_lossy(&output.stdout))?;
    let manager = MetricManager::new(db);
    for ((fixture, metric), value) in &samples {
        manager.record(experiment_id, phase, fixture, metric, *value)?;
    }
    tracing::debug!(
        experiment_id,
        phase = phase.as_str(),
        count = samples.len(),
        "metrics snapshot recorded"
    );
    Ok(samples.len())
}

/// Parse `{"fixtures": {"<fixture>": {"<metric>": <number>, ...}, ...}}`.
/// Non-numeric values are skipped.
pub fn parse_metrics_json(raw: &str) -> Result<BTreeMap<(String, String), f64>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("Metrics command did not emit valid JSON")?;
    let fixtures = value
        .get("fixtures")
        .and_then(|f| f.as_object())
        .context("Metrics JSON missing `fixtures` object")?;

    let mut samples = BTreeMap::new();
    for (fixture, metrics) in fixtures {
        let Some(metrics) = metrics.as_object() else {
            continue;
        };
        for (metric, value) in metrics {
            if let Some(number) = value.as_f64() {
                samples.insert((fixture.clone(), metric.clone()), number);
            }
        }
    }
    Ok(samples)
}

/// Pair up before/after samples for an experiment. Metrics present in only
/// one phase are skipped; regression requires both sides.
pub fn comparisons(
    db: &ExperimentDb,
    config: &CycleConfig,
    experiment_id: i64,
) -> Result<Vec<MetricComparison>> {
    let samples = MetricManager::new(db).list_for_experiment(experiment_id)?;

    let mut before = BTreeMap::new();
    let mut after = BTreeMap::new();
    for s in samples {
        let key = (s.fixture.clone(), s.metric.clone());
        match s.phase {
            MetricPhase::Before => before.insert(key, s.value),
            MetricPhase::After => after.insert(key, s.value),
        };
    }

    let mut result = Vec::new();
    for ((fixture, metric), before_value) in before {
        let Some(&after_value) = after.get(&(fixture.clone(), metric.clone())) else {
            continue;
        };
        let direction = config.direction_for(&metric);
        let regressed = match direction {
            Direction::HigherIsBetter => after_value < before_value,
            Direction::LowerIsBetter => after_value > before_value,
            // Ground-truth distance is not evaluated; never flags regression.
            Direction::TowardTruth => false,
        };
        result.push(MetricComparison {
            gated: config.is_gate_fixture(&fixture),
            fixture,
            metric,
            before: before_value,
            after: after_value,
            direction,
            regressed,
        });
    }
    Ok(result)
}

/// Gate-fixture regressions: any one of these forces a cycle-back regardless
/// of grade.
pub fn gate_regressions(comparisons: &[MetricComparison]) -> Vec<&MetricComparison> {
    comparisons.iter().filter(|c| c.gated && c.regressed).collect()
}
