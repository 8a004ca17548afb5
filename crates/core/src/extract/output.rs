//! Structured output types, one per agent role. These are what the workflow
//! consumes; everything upstream of them is free-text transcript.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;
use crate::state::{DoubtOutcome, DoubtSeverity, EvidenceLevel, Grade};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DecisionClaim {
    pub claim: String,
    pub evidence_level: Option<EvidenceLevel>,
}

/// Builder output: what was changed, the decisions made, and any approaches
/// found to be dead during the attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BuildReport {
    pub summary: String,
    pub decisions: Vec<DecisionClaim>,
    pub dead_approaches: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ChallengeItem {
    pub target_claim: String,
    pub objection: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ChallengeReport {
    pub challenges: Vec<ChallengeItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DoubtItem {
    pub claim: String,
    pub evidence_level: Option<EvidenceLevel>,
    pub evidence: String,
    pub severity: Option<DoubtSeverity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DoubtReport {
    pub doubts: Vec<DoubtItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DoubtResolutionItem {
    /// Database id of the doubt, when the scout echoed it correctly.
    pub doubt_id: Option<i64>,
    pub outcome: Option<DoubtOutcome>,
    pub evidence: String,
}

/// Scout output: investigation findings plus resolutions for open doubts,
/// in the same order the doubts were presented.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ScoutReport {
    pub findings: String,
    pub doubt_resolutions: Vec<DoubtResolutionItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ComponentVerdict {
    pub component: String,
    pub grade: Option<Grade>,
    pub provenance_intact: Option<bool>,
    pub content_correct: Option<bool>,
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VerifyReport {
    pub components: Vec<ComponentVerdict>,
}

/// Gatekeeper output, used both for classification and for the worth-doing
/// gate. A rejection carries its reason; the hypothesis may come back
/// reframed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GateReport {
    pub approved: bool,
    pub reason: String,
    pub sub_type: Option<String>,
    pub reframed_hypothesis: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Hypothesis {
    pub hypothesis: String,
    /// The causal mechanism; candidates sharing one are duplicates.
    pub mechanism: String,
    pub sub_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PlanReport {
    pub hypotheses: Vec<Hypothesis>,
}

/// Summarizer output when synthesizing builder guidance from a weak cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SummaryReport {
    pub guidance: String,
    pub dead_approaches: Vec<String>,
}

/// Structured output of one agent invocation, tagged by role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StructuredOutput {
    Build(BuildReport),
    Challenge(ChallengeReport),
    Doubt(DoubtReport),
    Scout(ScoutReport),
    Verify(VerifyReport),
    Gate(GateReport),
    Plan(PlanReport),
    Summary(SummaryReport),
}

impl StructuredOutput {
    /// Parse a JSON document as the output shape for `role`.
    pub fn parse_for_role(role: AgentRole, json: &str) -> Result<Self, serde_json::Error> {
        Ok(match role {
            AgentRole::Builder => Self::Build(serde_json::from_str(json)?),
            AgentRole::Challenger => Self::Challenge(serde_json::from_str(json)?),
            AgentRole::Doubter => Self::Doubt(serde_json::from_str(json)?),
            AgentRole::Scout => Self::Scout(serde_json::from_str(json)?),
            AgentRole::Verifier => Self::Verify(serde_json::from_str(json)?),
            AgentRole::Gatekeeper => Self::Gate(serde_json::from_str(json)?),
            AgentRole::Planner => Self::Plan(serde_json::from_str(json)?),
            AgentRole::Summarizer => Self::Summary(serde_json::from_str(json)?),
        })
    }

    /// JSON schema for the role's output shape, given to the reconstruction
    /// agent so it knows the exact target format.
    pub fn schema_for_role(role: AgentRole) -> schemars::Schema {
        match role {
            AgentRole::Builder => schemars::schema_for!(BuildReport),
            AgentRole::Challenger => schemars::schema_for!(ChallengeReport),
            AgentRole::Doubter => schemars::schema_for!(DoubtReport),
            AgentRole::Scout => schemars::schema_for!(ScoutReport),
            AgentRole::Verifier => schemars::schema_for!(VerifyReport),
            AgentRole::Gatekeeper => schemars::schema_for!(GateReport),
            AgentRole::Planner => schemars::schema_for!(PlanReport),
            AgentRole::Summarizer => schemars::schema_for!(SummaryReport),
        }
    }

    /// Per-role required-field check. Callers consult this to decide whether
    /// degraded (tier 2/3) output is trustworthy enough to advance the
    /// workflow; an exact parse is accepted without it.
    pub fn validate(&self) -> (bool, Vec<&'static str>) {
        let mut missing = Vec::new();
        match self {
            Self::Build(r) => {
                if r.summary.trim().is_empty() {
                    missing.push("summary");
                }
                if r.decisions.is_empty() {
                    missing.push("decisions");
                }
            }
            Self::Challenge(r) => {
                if r.challenges.is_empty() {
                    missing.push("challenges");
                }
            }
            Self::Doubt(r) => {
                if r.doubts.is_empty() {
                    missing.push("doubts");
                }
            }
            Self::Scout(r) => {
                if r.doubt_resolutions.is_empty() {
                    missing.push("doubt_resolutions");
                }
            }
            Self::Verify(r) => {
                if !r.components.iter().any(|c| c.grade.is_some()) {
                    missing.push("components");
                }
            }
            Self::Gate(r) => {
                if !r.approved && r.reason.trim().is_empty() {
                    missing.push("reason");
                }
            }
            Self::Plan(r) => {
                if r.hypotheses.is_empty() {
                    missing.push("hypotheses");
                }
            }
            Self::Summary(r) => {
                if r.guidance.trim().is_empty() {
                    missing.push("guidance");
                }
            }
        }
        (missing.is_empty(), missing)
    }

    /// At least one meaningful field carries content. Pattern extraction only
    /// succeeds on populated output; an all-empty parse is treated as a miss.
    pub fn is_populated(&self) -> bool {
        match self {
            Self::Build(r) => {
                !r.summary.trim().is_empty()
                    || !r.decisions.is_empty()
                    || !r.dead_approaches.is_empty()
            }
            Self::Challenge(r) => !r.challenges.is_empty(),
            Self::Doubt(r) => !r.doubts.is_empty(),
            Self::Scout(r) => {
                !r.findings.trim().is_empty() || !r.doubt_resolutions.is_empty()
            }
            Self::Verify(r) => r.components.iter().any(|c| c.grade.is_some()),
            Self::Gate(r) => r.approved || !r.reason.trim().is_empty(),
            Self::Plan(r) => !r.hypotheses.is_empty(),
            Self::Summary(r) => {
                !r.guidance.trim().is_empty() || !r.dead_approaches.is_empty()
            }
        }
    }
}
