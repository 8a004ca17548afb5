//! # Experiment Storage
//!
//! Each experiment is a row in the `experiments` table. Status only changes
//! through [`ExperimentManager::set_status`], which validates the edge
//! against the lifecycle adjacency table; terminal experiments are never
//! deleted.

use super::db::ExperimentDb;
use crate::lifecycle::{self, ExperimentStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// An experiment under the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    /// Unique human-traceable identifier; preserved across swarm imports.
    pub slug: String,
    /// Git branch carrying the experiment's work.
    pub branch: String,
    pub status: ExperimentStatus,
    pub hypothesis: String,
    /// Free-text problem category used for circuit breaking.
    pub sub_type: String,
    /// Accumulated iteration guidance fed to the builder.
    pub builder_guidance: String,
    /// Monotonic guidance iteration counter; never reset, even after truncation.
    pub guidance_iteration: u32,
    /// Weak/gate cycle-backs so far.
    pub retry_count: u32,
    pub depends_on: Option<String>,
    pub gate_rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Manager for experiment rows.
pub struct ExperimentManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl ExperimentManager {
    pub fn new(db: &ExperimentDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Create a new experiment in CLASSIFIED.
    pub fn create(&self, slug: &str, hypothesis: &str, sub_type: &str) -> Result<Experiment> {
        let now = Utc::now();
        let experiment = Experiment {
            id: 0,
            slug: slug.to_string(),
            branch: format!("crucible/{slug}"),
            status: ExperimentStatus::Classified,
            hypothesis: hypothesis.to_string(),
            sub_type: sub_type.to_string(),
            builder_guidance: String::new(),
            guidance_iteration: 0,
            retry_count: 0,
            depends_on: None,
            gate_rejection_reason: None,
            created_at: now,
            updated_at: now,
        };

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT INTO experiments
            (slug, branch, status, hypothesis, sub_type, builder_guidance,
             guidance_iteration, retry_count, depends_on, gate_rejection_reason,
             created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                experiment.slug,
                experiment.branch,
                experiment.status.as_str(),
                experiment.hypothesis,
                experiment.sub_type,
                experiment.builder_guidance,
                experiment.guidance_iteration,
                experiment.retry_count,
                experiment.depends_on,
                experiment.gate_rejection_reason,
                experiment.created_at.to_rfc3339(),
                experiment.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to create experiment '{slug}'"))?;

        let id = conn.last_insert_rowid();
        Ok(Experiment { id, ..experiment })
    }

    /// Load by slug.
    pub fn load(&self, slug: &str) -> Result<Experiment> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.query_row(
            &format!("SELECT {COLUMNS} FROM experiments WHERE slug = ?1"),
            params![slug],
            row_to_experiment,
        )
        .with_context(|| format!("Experiment '{slug}' not found"))
    }

    /// Load by row id.
    pub fn load_by_id(&self, id: i64) -> Result<Experiment> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.query_row(
            &format!("SELECT {COLUMNS} FROM experiments WHERE id = ?1"),
            params![id],
            row_to_experiment,
        )
        .with_context(|| format!("Experiment id {id} not found"))
    }

    /// List every experiment, newest first.
    pub fn list_all(&self) -> Result<Vec<Experiment>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM experiments ORDER BY created_at DESC, id DESC"
        ))?;
        let experiments = stmt
            .query_map([], row_to_experiment)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list experiments")?;
        Ok(experiments)
    }

    /// Validated status change. The durable write happens before the caller
    /// starts the next step.
    pub fn set_status(&self, slug: &str, to: ExperimentStatus) -> Result<ExperimentStatus> {
        let current = self.load(slug)?;
        let to = lifecycle::transition(current.status, to)?;

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        conn.execute(
            "UPDATE experiments SET status = ?1, updated_at = ?2 WHERE slug = ?3",
            params![to.as_str(), Utc::now().to_rfc3339(), slug],
        )?;
        tracing::debug!(slug, from = %current.status, to = %to, "status transition");
        Ok(to)
    }

    /// Replace accumulated guidance and bump the monotonic iteration counter.
    pub fn set_guidance(&self, slug: &str, guidance: &str, iteration: u32) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let affected = conn.execute(
            "UPDATE experiments SET builder_guidance = ?1, guidance_iteration = ?2, updated_at = ?3 WHERE slug = ?4",
            params![guidance, iteration, Utc::now().to_rfc3339(), slug],
        )?;
        if affected == 0 {
            anyhow::bail!("Experiment not found: {slug}");
        }
        Ok(())
    }

    pub fn increment_retry(&self, slug: &str) -> Result<u32> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        conn.execute(
            "UPDATE experiments SET retry_count = retry_count + 1, updated_at = ?1 WHERE slug = ?2",
            params![Utc::now().to_rfc3339(), slug],
        )?;
        conn.query_row(
            "SELECT retry_count FROM experiments WHERE slug = ?1",
            params![slug],
            |row| row.get(0),
        )
        .with_context(|| format!("Experiment not found: {slug}"))
    }

    pub fn set_gate_rejection(&self, slug: &str, reason: Option<&str>) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        conn.execute(
            "UPDATE experiments SET gate_rejection_reason = ?1, updated_at = ?2 WHERE slug = ?3",
            params![reason, Utc::now().to_rfc3339(), slug],
        )?;
        Ok(())
    }

    pub fn set_depends_on(&self, slug: &str, depends_on: Option<&str>) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        conn.execute(
            "UPDATE experiments SET depends_on = ?1, updated_at = ?2 WHERE slug = ?3",
            params![depends_on, Utc::now().to_rfc3339(), slug],
        )?;
        Ok(())
    }
}

const COLUMNS: &str = "id, slug, branch, status, hypothesis, sub_type, builder_guidance, \
                       guidance_iteration, retry_count, depends_on, gate_rejection_reason, \
                       created_at, updated_at";

fn row_to_experiment(row: &rusqlite::Row) -> rusqlite::Result<Experiment> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok(Experiment {
        id: row.get(0)?,
        slug: row.get(1)?,
        branch: row.get(2)?,
        status: ExperimentStatus::parse(&status).unwrap_or(ExperimentStatus::Classified),
        hypothesis: row.get(4)?,
        sub_type: row.get(5)?,
        builder_guidance: row.get(6)?,
        guidance_iteration: row.get(7)?,
        retry_count: row.get(8)?,
        depends_on: row.get(9)?,
        gate_rejection_reason: row.get(10)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Generate a unique experiment slug from a hypothesis.
pub fn generate_slug(hypothesis: &str) -> String {
    let stem: String = hypothesis
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(4)
        .collect::<Vec<_>>()
        .join("-");
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    if stem.is_empty() {
        format!("exp-{stamp}")
    } else {
        format!("{stem}-{stamp}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ExperimentDb, ExperimentManager) {
        let db = ExperimentDb::open_memory().unwrap();
        let mgr = ExperimentManager::new(&db);
        (db, mgr)
    }

    #[test]
    fn test_create_and_load() {
        let (_db, mgr) = manager();
        let created = mgr
            .create("cache-keys", "Cache keys are recomputed too often", "caching")
            .unwrap();
        assert!(created.id > 0);

        let loaded = mgr.load("cache-keys").unwrap();
        assert_eq!(loaded.status, ExperimentStatus::Classified);
        assert_eq!(loaded.branch, "crucible/cache-keys");
        assert_eq!(loaded.sub_type, "caching");
    }

    #[test]
    fn test_set_status_validates_edges() {
        let (_db, mgr) = manager();
        mgr.create("a", "h", "general").unwrap();

        mgr.set_status("a", ExperimentStatus::Gated).unwrap();
        mgr.set_status("a", ExperimentStatus::Building).unwrap();

        // BUILDING -> VERIFIED is not in the adjacency table.
        let err = mgr.set_status("a", ExperimentStatus::Verified).unwrap_err();
        assert!(err
            .downcast_ref::<crate::error::CoreError>()
            .map(|e| matches!(e, crate::error::CoreError::InvalidTransition { .. }))
            .unwrap_or(false));

        // Status unchanged after the failed transition.
        assert_eq!(mgr.load("a").unwrap().status, ExperimentStatus::Building);
    }

    #[test]
    fn test_guidance_and_retry_updates() {
        let (_db, mgr) = manager();
        mgr.create("a", "h", "general").unwrap();
        mgr.set_guidance("a", "## Iteration 1 (latest)\nfix x", 1)
            .unwrap();
        assert_eq!(mgr.increment_retry("a").unwrap(), 1);
        assert_eq!(mgr.increment_retry("a").unwrap(), 2);

        let exp = mgr.load("a").unwrap();
        assert_eq!(exp.guidance_iteration, 1);
        assert!(exp.builder_guidance.contains("fix x"));
    }

    #[test]
    fn test_slug_generation() {
        let slug = generate_slug("Reduce planner latency via memoization");
        assert!(slug.starts_with("reduce-planner-latency-via-"));
        assert!(generate_slug("!!!").starts_with("exp-"));
    }
}
