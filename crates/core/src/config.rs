//! # Cycle Configuration
//!
//! Thresholds, gate fixtures, and per-role model selection, loaded from
//! `.crucible/config.toml`. Read-only to the core: the config is constructed
//! once per invocation and threaded through the [`crate::context::CycleContext`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;

/// Improvement direction for a metric.
///
/// `toward_truth` is defined here but never evaluated: comparisons in that
/// mode are always treated as non-regressing. This is a known gap carried
/// deliberately rather than inventing ground-truth comparison logic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    HigherIsBetter,
    LowerIsBetter,
    TowardTruth,
}

/// Configuration for one full experiment cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// External agent binary invoked for every reasoning step.
    pub agent_command: String,
    /// Default model when no per-role override exists.
    pub default_model: String,
    /// Per-role model overrides (role name -> model).
    pub models: HashMap<String, String>,
    /// Weak+rejected outcomes per sub_type before the breaker trips.
    pub breaker_threshold: u32,
    /// Retry cycles between guidance compressions.
    pub compression_interval: u32,
    /// Whether a doubt pass is required before verification.
    pub require_doubts: bool,
    /// Whether a challenge pass is required before verification.
    pub require_challenges: bool,
    /// External command emitting the fixtures/metrics JSON document.
    pub metrics_command: Option<String>,
    /// Fixtures that act as hard quality floors.
    pub gate_fixtures: Vec<String>,
    /// Per-metric improvement direction.
    pub metric_directions: HashMap<String, Direction>,
    /// Character budget for accumulated builder guidance.
    pub guidance_budget: usize,
    /// Steps one swarm worker may take before it is abandoned.
    pub worker_step_budget: u32,
    /// Default swarm parallelism.
    pub max_parallel: usize,
    /// Deadline for every external subprocess call, in seconds.
    pub subprocess_timeout_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            agent_command: "crucible-agent".to_string(),
            default_model: "sonnet".to_string(),
            models: HashMap::new(),
            breaker_threshold: 3,
            compression_interval: 4,
            require_doubts: true,
            require_challenges: true,
            metrics_command: None,
            gate_fixtures: Vec::new(),
            metric_directions: HashMap::new(),
            guidance_budget: 8_000,
            worker_step_budget: 24,
            max_parallel: 4,
            subprocess_timeout_secs: 900,
        }
    }
}

/// Hard ceiling on swarm width regardless of configuration.
pub const MAX_SWARM_WORKERS: usize = 8;

impl CycleConfig {
    /// Load from `<root>/.crucible/config.toml`; a missing file yields defaults.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(".crucible").join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("Malformed config at {:?}", path))
    }

    /// Model for a role: per-role override -> default.
    pub fn model_for(&self, role: AgentRole) -> String {
        self.models
            .get(role.as_str())
            .cloned()
            .unwrap_or_else(|| self.default_model.clone())
    }

    pub fn direction_for(&self, metric: &str) -> Direction {
        self.metric_directions
            .get(metric)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_gate_fixture(&self, fixture: &str) -> bool {
        self.gate_fixtures.iter().any(|f| f == fixture)
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_secs)
    }

    /// Effective swarm width for a request.
    pub fn effective_parallel(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.max_parallel)
            .clamp(1, MAX_SWARM_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CycleConfig::default();
        assert_eq!(config.breaker_threshold, 3);
        assert_eq!(config.compression_interval, 4);
        assert!(config.require_doubts);
    }

    #[test]
    fn test_toml_parsing() {
        let raw = r#"
            default_model = "opus"
            breaker_threshold = 5
            gate_fixtures = ["latency_suite"]

            [metric_directions]
            latency_ms = "lower_is_better"
            drift = "toward_truth"

            [models]
            verifier = "opus-strict"
        "#;
        let config: CycleConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.breaker_threshold, 5);
        assert!(config.is_gate_fixture("latency_suite"));
        assert_eq!(config.direction_for("latency_ms"), Direction::LowerIsBetter);
        assert_eq!(config.direction_for("drift"), Direction::TowardTruth);
        assert_eq!(config.direction_for("accuracy"), Direction::HigherIsBetter);
        assert_eq!(config.model_for(AgentRole::Verifier), "opus-strict");
        assert_eq!(config.model_for(AgentRole::Builder), "opus");
    }

    #[test]
    fn test_parallel_clamped() {
        let config = CycleConfig::default();
        assert_eq!(config.effective_parallel(Some(99)), MAX_SWARM_WORKERS);
        assert_eq!(config.effective_parallel(Some(0)), 1);
        assert_eq!(config.effective_parallel(None), 4);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CycleConfig::load(dir.path()).unwrap();
        assert_eq!(config.agent_command, "crucible-agent");
    }
}
