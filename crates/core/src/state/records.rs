//! # Child Entity Storage
//!
//! Decisions, metrics, dead-ends, verifications, doubts, challenges,
//! fragility entries, sub-type failure tallies and swarm bookkeeping. All of
//! these are append-only except for the overturn pointer on decisions and the
//! resolution column on doubts.

use super::db::ExperimentDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

// ============================================================================
// Shared enums
// ============================================================================

/// Strength of the evidence backing a decision or doubt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceLevel {
    Proof,
    Test,
    StrongConsensus,
    Consensus,
    Analogy,
    Judgment,
}

impl EvidenceLevel {
    pub const ALL: [EvidenceLevel; 6] = [
        Self::Proof,
        Self::Test,
        Self::StrongConsensus,
        Self::Consensus,
        Self::Analogy,
        Self::Judgment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proof => "proof",
            Self::Test => "test",
            Self::StrongConsensus => "strong_consensus",
            Self::Consensus => "consensus",
            Self::Analogy => "analogy",
            Self::Judgment => "judgment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }
}

/// Verification grade for one component.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Sound,
    Good,
    Weak,
    Rejected,
}

impl Grade {
    pub const ALL: [Grade; 4] = [Self::Sound, Self::Good, Self::Weak, Self::Rejected];

    /// Fixed severity order: rejected > weak > good > sound.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Sound => 0,
            Self::Good => 1,
            Self::Weak => 2,
            Self::Rejected => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sound => "sound",
            Self::Good => "good",
            Self::Weak => "weak",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoubtSeverity {
    Minor,
    Moderate,
    Critical,
}

impl DoubtSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Minor, Self::Moderate, Self::Critical]
            .into_iter()
            .find(|v| v.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoubtOutcome {
    Confirmed,
    Dismissed,
    Inconclusive,
}

impl DoubtOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Dismissed => "dismissed",
            Self::Inconclusive => "inconclusive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Confirmed, Self::Dismissed, Self::Inconclusive]
            .into_iter()
            .find(|v| v.as_str() == s)
    }
}

/// Structural dead-ends are hard constraints blocking repetition of the same
/// approach; procedural ones record a process failure only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeadEndCategory {
    Structural,
    Procedural,
}

impl DeadEndCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Procedural => "procedural",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Structural, Self::Procedural]
            .into_iter()
            .find(|v| v.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Active,
    Overturned,
    Superseded,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Overturned => "overturned",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Active, Self::Overturned, Self::Superseded]
            .into_iter()
            .find(|v| v.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricPhase {
    Before,
    After,
}

impl MetricPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: i64,
    pub experiment_id: i64,
    pub claim: String,
    pub evidence_level: EvidenceLevel,
    pub status: DecisionStatus,
    pub superseded_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub id: i64,
    pub experiment_id: i64,
    pub phase: MetricPhase,
    pub fixture: String,
    pub metric: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadEnd {
    pub id: i64,
    pub experiment_id: i64,
    pub approach: String,
    pub why_failed: String,
    pub structural_constraint: String,
    pub sub_type: String,
    pub category: DeadEndCategory,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub id: i64,
    pub experiment_id: i64,
    pub component: String,
    pub grade: Grade,
    pub provenance_intact: Option<bool>,
    pub content_correct: Option<bool>,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doubt {
    pub id: i64,
    pub experiment_id: i64,
    pub claim: String,
    pub evidence_level: EvidenceLevel,
    pub evidence: String,
    pub severity: DoubtSeverity,
    pub resolution: Option<DoubtOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: i64,
    pub experiment_id: i64,
    pub target_claim: String,
    pub objection: String,
}

// ============================================================================
// Managers
// ============================================================================

macro_rules! lock {
    ($self:ident) => {
        $self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
    };
}

pub struct DecisionManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl DecisionManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    pub fn record(
        &self,
        experiment_id: i64,
        claim: &str,
        evidence_level: EvidenceLevel,
    ) -> Result<i64> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO decisions (experiment_id, claim, evidence_level, status, created_at)
             VALUES (?1, ?2, ?3, 'active', ?4)",
            params![
                experiment_id,
                claim,
                evidence_level.as_str(),
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to record decision")?;
        Ok(conn.last_insert_rowid())
    }

    /// Overturn by pointer: the old row gains a reference to the superseding
    /// decision and flips status; its claim text is never edited.
    pub fn overturn(&self, decision_id: i64, superseding_id: i64) -> Result<()> {
        let conn = lock!(self);
        let affected = conn.execute(
            "UPDATE decisions SET status = 'overturned', superseded_by = ?1 WHERE id = ?2",
            params![superseding_id, decision_id],
        )?;
        if affected == 0 {
            anyhow::bail!("Decision not found: {decision_id}");
        }
        Ok(())
    }

    pub fn list_for_experiment(&self, experiment_id: i64) -> Result<Vec<Decision>> {
        let conn = lock!(self);
        let mut stmt = conn.prepare(
            "SELECT id, experiment_id, claim, evidence_level, status, superseded_by, created_at
             FROM decisions WHERE experiment_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![experiment_id], |row| {
                let level: String = row.get(3)?;
                let status: String = row.get(4)?;
                let created: String = row.get(6)?;
                Ok(Decision {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    claim: row.get(2)?,
                    evidence_level: EvidenceLevel::parse(&level)
                        .unwrap_or(EvidenceLevel::Judgment),
                    status: DecisionStatus::parse(&status).unwrap_or(DecisionStatus::Active),
                    superseded_by: row.get(5)?,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub struct MetricManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl MetricManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    pub fn record(
        &self,
        experiment_id: i64,
        phase: MetricPhase,
        fixture: &str,
        metric: &str,
        value: f64,
    ) -> Result<()> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO metrics (experiment_id, phase, fixture, metric, value, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                experiment_id,
                phase.as_str(),
                fixture,
                metric,
                value,
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to record metric")?;
        Ok(())
    }

    pub fn has_phase(&self, experiment_id: i64, phase: MetricPhase) -> Result<bool> {
        let conn = lock!(self);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM metrics WHERE experiment_id = ?1 AND phase = ?2",
            params![experiment_id, phase.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_for_experiment(&self, experiment_id: i64) -> Result<Vec<MetricSample>> {
        let conn = lock!(self);
        let mut stmt = conn.prepare(
            "SELECT id, experiment_id, phase, fixture, metric, value
             FROM metrics WHERE experiment_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![experiment_id], |row| {
                let phase: String = row.get(2)?;
                Ok(MetricSample {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    phase: if phase == "after" {
                        MetricPhase::After
                    } else {
                        MetricPhase::Before
                    },
                    fixture: row.get(3)?,
                    metric: row.get(4)?,
                    value: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub struct DeadEndManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl DeadEndManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    pub fn record(
        &self,
        experiment_id: i64,
        approach: &str,
        why_failed: &str,
        structural_constraint: &str,
        sub_type: &str,
        category: DeadEndCategory,
    ) -> Result<i64> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO dead_ends
             (experiment_id, approach, why_failed, structural_constraint, sub_type, category, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                experiment_id,
                approach,
                why_failed,
                structural_constraint,
                sub_type,
                category.as_str(),
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to record dead end")?;
        tracing::warn!(
            sub_type,
            category = category.as_str(),
            approach,
            why_failed,
            "dead end recorded"
        );
        Ok(conn.last_insert_rowid())
    }

    /// Structural constraints for a sub_type, fed back into builder prompts
    /// so a blocked approach is never repeated.
    pub fn structural_constraints(&self, sub_type: &str) -> Result<Vec<DeadEnd>> {
        self.list_filtered(
            "SELECT id, experiment_id, approach, why_failed, structural_constraint, sub_type, category, created_at
             FROM dead_ends WHERE sub_type = ?1 AND category = 'structural' ORDER BY id",
            params![sub_type],
        )
    }

    /// Every structural constraint, regardless of sub_type. Planning calls
    /// span categories, so they see the whole blocked-approach history.
    pub fn all_structural_constraints(&self) -> Result<Vec<DeadEnd>> {
        self.list_filtered(
            "SELECT id, experiment_id, approach, why_failed, structural_constraint, sub_type, category, created_at
             FROM dead_ends WHERE category = 'structural' ORDER BY id",
            params![],
        )
    }

    pub fn list_for_experiment(&self, experiment_id: i64) -> Result<Vec<DeadEnd>> {
        self.list_filtered(
            "SELECT id, experiment_id, approach, why_failed, structural_constraint, sub_type, category, created_at
             FROM dead_ends WHERE experiment_id = ?1 ORDER BY id",
            params![experiment_id],
        )
    }

    fn list_filtered(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<DeadEnd>> {
        let conn = lock!(self);
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, |row| {
                let category: String = row.get(6)?;
                let created: String = row.get(7)?;
                Ok(DeadEnd {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    approach: row.get(2)?,
                    why_failed: row.get(3)?,
                    structural_constraint: row.get(4)?,
                    sub_type: row.get(5)?,
                    category: DeadEndCategory::parse(&category)
                        .unwrap_or(DeadEndCategory::Procedural),
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub struct VerificationManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl VerificationManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        experiment_id: i64,
        component: &str,
        grade: Grade,
        provenance_intact: Option<bool>,
        content_correct: Option<bool>,
        notes: &str,
    ) -> Result<i64> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO verifications
             (experiment_id, component, grade, provenance_intact, content_correct, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                experiment_id,
                component,
                grade.as_str(),
                provenance_intact,
                content_correct,
                notes,
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to record verification")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_for_experiment(&self, experiment_id: i64) -> Result<Vec<Verification>> {
        let conn = lock!(self);
        let mut stmt = conn.prepare(
            "SELECT id, experiment_id, component, grade, provenance_intact, content_correct, notes
             FROM verifications WHERE experiment_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![experiment_id], |row| {
                let grade: String = row.get(3)?;
                Ok(Verification {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    component: row.get(2)?,
                    grade: Grade::parse(&grade).unwrap_or(Grade::Weak),
                    provenance_intact: row.get(4)?,
                    content_correct: row.get(5)?,
                    notes: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub struct DoubtManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl DoubtManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    pub fn record(
        &self,
        experiment_id: i64,
        claim: &str,
        evidence_level: EvidenceLevel,
        evidence: &str,
        severity: DoubtSeverity,
    ) -> Result<i64> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO doubts (experiment_id, claim, evidence_level, evidence, severity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                experiment_id,
                claim,
                evidence_level.as_str(),
                evidence,
                severity.as_str(),
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to record doubt")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_for_experiment(&self, experiment_id: i64) -> Result<Vec<Doubt>> {
        let conn = lock!(self);
        let mut stmt = conn.prepare(
            "SELECT id, experiment_id, claim, evidence_level, evidence, severity, resolution
             FROM doubts WHERE experiment_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![experiment_id], |row| {
                let level: String = row.get(3)?;
                let severity: String = row.get(5)?;
                let resolution: Option<String> = row.get(6)?;
                Ok(Doubt {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    claim: row.get(2)?,
                    evidence_level: EvidenceLevel::parse(&level)
                        .unwrap_or(EvidenceLevel::Judgment),
                    evidence: row.get(4)?,
                    severity: DoubtSeverity::parse(&severity).unwrap_or(DoubtSeverity::Minor),
                    resolution: resolution.as_deref().and_then(DoubtOutcome::parse),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn confirmed_for_experiment(&self, experiment_id: i64) -> Result<Vec<Doubt>> {
        Ok(self
            .list_for_experiment(experiment_id)?
            .into_iter()
            .filter(|d| d.resolution == Some(DoubtOutcome::Confirmed))
            .collect())
    }

    /// Apply a resolution by id. When the id is unknown, falls back to
    /// positional matching against the experiment's doubts with a visible
    /// warning. Recovery heuristic only, not a guarantee.
    pub fn resolve(
        &self,
        experiment_id: i64,
        doubt_id: Option<i64>,
        position: usize,
        outcome: DoubtOutcome,
    ) -> Result<()> {
        let doubts = self.list_for_experiment(experiment_id)?;

        let target = match doubt_id {
            Some(id) if doubts.iter().any(|d| d.id == id) => id,
            Some(id) => {
                let Some(fallback) = doubts.get(position) else {
                    anyhow::bail!(
                        "Doubt id {id} unknown and position {position} out of range for experiment {experiment_id}"
                    );
                };
                tracing::warn!(
                    experiment_id,
                    unknown_id = id,
                    position,
                    matched_id = fallback.id,
                    "doubt resolution referenced an unknown doubt id; fell back to positional match"
                );
                fallback.id
            }
            None => {
                let Some(fallback) = doubts.get(position) else {
                    anyhow::bail!(
                        "Doubt position {position} out of range for experiment {experiment_id}"
                    );
                };
                fallback.id
            }
        };

        let conn = lock!(self);
        conn.execute(
            "UPDATE doubts SET resolution = ?1 WHERE id = ?2",
            params![outcome.as_str(), target],
        )?;
        Ok(())
    }
}

pub struct ChallengeManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl ChallengeManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    pub fn record(&self, experiment_id: i64, target_claim: &str, objection: &str) -> Result<i64> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO challenges (experiment_id, target_claim, objection, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![experiment_id, target_claim, objection, Utc::now().to_rfc3339()],
        )
        .context("Failed to record challenge")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_for_experiment(&self, experiment_id: i64) -> Result<Vec<Challenge>> {
        let conn = lock!(self);
        let mut stmt = conn.prepare(
            "SELECT id, experiment_id, target_claim, objection
             FROM challenges WHERE experiment_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![experiment_id], |row| {
                Ok(Challenge {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    target_claim: row.get(2)?,
                    objection: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub struct FragilityManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl FragilityManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Append one dated entry. The record is never overwritten or edited.
    pub fn append(&self, experiment_id: i64, component: &str, notes: &str) -> Result<()> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO fragility (experiment_id, component, notes, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![experiment_id, component, notes, Utc::now().to_rfc3339()],
        )
        .context("Failed to append fragility entry")?;
        Ok(())
    }

    pub fn count_for_experiment(&self, experiment_id: i64) -> Result<i64> {
        let conn = lock!(self);
        let count = conn.query_row(
            "SELECT COUNT(*) FROM fragility WHERE experiment_id = ?1",
            params![experiment_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

pub struct TallyManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl TallyManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Count one weak/rejected outcome for a sub_type; returns the new tally.
    pub fn increment(&self, sub_type: &str) -> Result<u32> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO sub_type_failures (sub_type, tally) VALUES (?1, 1)
             ON CONFLICT(sub_type) DO UPDATE SET tally = tally + 1",
            params![sub_type],
        )?;
        conn.query_row(
            "SELECT tally FROM sub_type_failures WHERE sub_type = ?1",
            params![sub_type],
            |row| row.get(0),
        )
        .context("Failed to read sub_type tally")
    }

    pub fn get(&self, sub_type: &str) -> Result<u32> {
        let conn = lock!(self);
        let tally = conn
            .query_row(
                "SELECT tally FROM sub_type_failures WHERE sub_type = ?1",
                params![sub_type],
                |row| row.get(0),
            )
            .unwrap_or(0);
        Ok(tally)
    }

    /// Fold another store's tallies into this one (swarm aggregation).
    pub fn merge_from(&self, sub_type: &str, amount: u32) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO sub_type_failures (sub_type, tally) VALUES (?1, ?2)
             ON CONFLICT(sub_type) DO UPDATE SET tally = tally + ?2",
            params![sub_type, amount],
        )?;
        Ok(())
    }
}

pub struct SwarmManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SwarmManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    pub fn create_run(&self, goal: &str) -> Result<i64> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO swarm_runs (goal, created_at) VALUES (?1, ?2)",
            params![goal, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_member(
        &self,
        run_id: i64,
        experiment_slug: &str,
        status: &str,
        grade: Option<Grade>,
        cost_usd: f64,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = lock!(self);
        conn.execute(
            "INSERT INTO swarm_members (run_id, experiment_slug, status, grade, cost_usd, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                experiment_slug,
                status,
                grade.map(|g| g.as_str()),
                cost_usd,
                error
            ],
        )?;
        Ok(())
    }
}
