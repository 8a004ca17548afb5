//! Import a worker store's experiment into the canonical store. All row ids
//! are remapped; the slug is preserved. The whole import is one transaction,
//! so a failed worker copy never leaves partial rows behind.

use anyhow::{Context, Result};
use rusqlite::params;
use std::collections::HashMap;

use crate::state::{ExperimentDb, ExperimentManager};

/// Copy one experiment and all of its child rows from `worker` into
/// `canonical`. Returns the experiment's id in the canonical store.
pub fn import_worker(canonical: &ExperimentDb, worker: &ExperimentDb, slug: &str) -> Result<i64> {
    let experiment = ExperimentManager::new(worker)
        .load(slug)
        .with_context(|| format!("Worker store has no experiment '{slug}'"))?;

    // Read everything from the worker store up front; the canonical lock is
    // held only for the write transaction.
    let worker_conn = worker.connection();
    let worker_conn = worker_conn
        .lock()
        .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

    let decisions = read_rows(
        &worker_conn,
        "SELECT id, claim, evidence_level, status, superseded_by, created_at
         FROM decisions WHERE experiment_id = ?1 ORDER BY id",
        experiment.id,
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, String>(5)?,
            ))
        },
    )?;

    let metrics = read_rows(
        &worker_conn,
        "SELECT phase, fixture, metric, value, created_at
         FROM metrics WHERE experiment_id = ?1 ORDER BY id",
        experiment.id,
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        },
    )?;

    let dead_ends = read_rows(
        &worker_conn,
        "SELECT approach, why_failed, structural_constraint, sub_type, category, created_at
         FROM dead_ends WHERE experiment_id = ?1 ORDER BY id",
        experiment.id,
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        },
    )?;

    let verifications = read_rows(
        &worker_conn,
        "SELECT component, grade, provenance_intact, content_correct, notes, created_at
         FROM verifications WHERE experiment_id = ?1 ORDER BY id",
        experiment.id,
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<bool>>(2)?,
                row.get::<_, Option<bool>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        },
    )?;

    let doubts = read_rows(
        &worker_conn,
        "SELECT claim, evidence_level, evidence, severity, resolution, created_at
         FROM doubts WHERE experiment_id = ?1 ORDER BY id",
        experiment.id,
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        },
    )?;

    let challenges = read_rows(
        &worker_conn,
        "SELECT target_claim, objection, created_at
         FROM challenges WHERE experiment_id = ?1 ORDER BY id",
        experiment.id,
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        },
    )?;

    let fragility = read_rows(
        &worker_conn,
        "SELECT component, notes, created_at
         FROM fragility WHERE experiment_id = ?1 ORDER BY id",
        experiment.id,
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        },
    )?;

    let mut tallies_stmt =
        worker_conn.prepare("SELECT sub_type, tally FROM sub_type_failures")?;
    let tallies: Vec<(String, u32)> = tallies_stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(tallies_stmt);
    drop(worker_conn);

    let canonical_conn = canonical.connection();
    let mut canonical_conn = canonical_conn
        .lock()
        .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
    let tx = canonical_conn.transaction()?;

    tx.execute(
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
    .with_context(|| format!("Failed to import experiment '{slug}'"))?;
    let new_experiment_id = tx.last_insert_rowid();

    // Decisions in two passes: insert first, then rewrite overturn pointers
    // against the id map.
    let mut id_map: HashMap<i64, i64> = HashMap::new();
    for (old_id, claim, level, status, _superseded_by, created_at) in &decisions {
        tx.execute(
            "INSERT INTO decisions (experiment_id, claim, evidence_level, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![new_experiment_id, claim, level, status, created_at],
        )?;
        id_map.insert(*old_id, tx.last_insert_rowid());
    }
    for (old_id, _, _, _, superseded_by, _) in &decisions {
        if let Some(old_target) = superseded_by {
            let new_id = id_map[old_id];
            let new_target = id_map.get(old_target).copied();
            tx.execute(
                "UPDATE decisions SET superseded_by = ?1 WHERE id = ?2",
                params![new_target, new_id],
            )?;
        }
    }

    for (phase, fixture, metric, value, created_at) in &metrics {
        tx.execute(
            "INSERT INTO metrics (experiment_id, phase, fixture, metric, value, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![new_experiment_id, phase, fixture, metric, value, created_at],
        )?;
    }
    for (approach, why_failed, constraint, sub_type, category, created_at) in &dead_ends {
        tx.execute(
            "INSERT INTO dead_ends
             (experiment_id, approach, why_failed, structural_constraint, sub_type, category, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![new_experiment_id, approach, why_failed, constraint, sub_type, category, created_at],
        )?;
    }
    for (component, grade, provenance, content, notes, created_at) in &verifications {
        tx.execute(
            "INSERT INTO verifications
             (experiment_id, component, grade, provenance_intact, content_correct, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![new_experiment_id, component, grade, provenance, content, notes, created_at],
        )?;
    }
    for (claim, level, evidence, severity, resolution, created_at) in &doubts {
        tx.execute(
            "INSERT INTO doubts
             (experiment_id, claim, evidence_level, evidence, severity, resolution, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![new_experiment_id, claim, level, evidence, severity, resolution, created_at],
        )?;
    }
    for (target_claim, objection, created_at) in &challenges {
        tx.execute(
            "INSERT INTO challenges (experiment_id, target_claim, objection, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![new_experiment_id, target_claim, objection, created_at],
        )?;
    }
    for (component, notes, created_at) in &fragility {
        tx.execute(
            "INSERT INTO fragility (experiment_id, component, notes, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![new_experiment_id, component, notes, created_at],
        )?;
    }
    for (sub_type, tally) in &tallies {
        tx.execute(
            "INSERT INTO sub_type_failures (sub_type, tally) VALUES (?1, ?2)
             ON CONFLICT(sub_type) DO UPDATE SET tally = tally + ?2",
            params![sub_type, tally],
        )?;
    }

    tx.commit().context("Failed to commit worker import")?;
    tracing::info!(slug, new_experiment_id, "worker store imported");
    Ok(new_experiment_id)
}

fn read_rows<T>(
    conn: &rusqlite::Connection,
    sql: &str,
    experiment_id: i64,
    map: impl FnMut(&rusqlite::Row) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![experiment_id], map)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        DeadEndCategory, DeadEndManager, DecisionManager, DoubtManager, DoubtOutcome,
        DoubtSeverity, EvidenceLevel, Grade, TallyManager, VerificationManager,
    };

    fn seed_worker(slug: &str) -> ExperimentDb {
        let worker = ExperimentDb::open_memory().unwrap();
        let experiments = ExperimentManager::new(&worker);
        let exp = experiments.create(slug, "worker hypothesis", "caching").unwrap();

        let decisions = DecisionManager::new(&worker);
        let first = decisions
            .record(exp.id, "original claim", EvidenceLevel::Analogy)
            .unwrap();
        let second = decisions
            .record(exp.id, "better claim", EvidenceLevel::Test)
            .unwrap();
        decisions.overturn(first, second).unwrap();

        VerificationManager::new(&worker)
            .record(exp.id, "cache", Grade::Sound, Some(true), Some(true), "")
            .unwrap();
        DoubtManager::new(&worker)
            .record(exp.id, "d", EvidenceLevel::Judgment, "", DoubtSeverity::Minor)
            .unwrap();
        DoubtManager::new(&worker)
            .resolve(exp.id, None, 0, DoubtOutcome::Dismissed)
            .unwrap();
        DeadEndManager::new(&worker)
            .record(exp.id, "a", "w", "c", "caching", DeadEndCategory::Structural)
            .unwrap();
        TallyManager::new(&worker).increment("caching").unwrap();
        worker
    }

    #[test]
    fn test_import_remaps_ids_and_preserves_slug() {
        let canonical = ExperimentDb::open_memory().unwrap();
        // Pre-existing canonical rows shift the id space.
        ExperimentManager::new(&canonical)
            .create("existing", "h", "general")
            .unwrap();

        let worker = seed_worker("swarm-a");
        let new_id = import_worker(&canonical, &worker, "swarm-a").unwrap();

        let imported = ExperimentManager::new(&canonical).load("swarm-a").unwrap();
        assert_eq!(imported.id, new_id);
        assert!(new_id > 1);
        assert_eq!(imported.hypothesis, "worker hypothesis");

        // Overturn pointer remapped to the new id space.
        let decisions = DecisionManager::new(&canonical)
            .list_for_experiment(new_id)
            .unwrap();
        assert_eq!(decisions.len(), 2);
        let overturned = decisions
            .iter()
            .find(|d| d.claim == "original claim")
            .unwrap();
        let superseding = decisions.iter().find(|d| d.claim == "better claim").unwrap();
        assert_eq!(overturned.superseded_by, Some(superseding.id));

        // Children follow the new experiment id.
        assert_eq!(
            VerificationManager::new(&canonical)
                .list_for_experiment(new_id)
                .unwrap()
                .len(),
            1
        );
        let doubts = DoubtManager::new(&canonical)
            .list_for_experiment(new_id)
            .unwrap();
        assert_eq!(doubts[0].resolution, Some(DoubtOutcome::Dismissed));
        assert_eq!(
            DeadEndManager::new(&canonical)
                .structural_constraints("caching")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_import_merges_tallies() {
        let canonical = ExperimentDb::open_memory().unwrap();
        TallyManager::new(&canonical).increment("caching").unwrap();

        let worker = seed_worker("swarm-b");
        import_worker(&canonical, &worker, "swarm-b").unwrap();

        assert_eq!(TallyManager::new(&canonical).get("caching").unwrap(), 2);
    }

    #[test]
    fn test_import_from_two_workers() {
        let canonical = ExperimentDb::open_memory().unwrap();
        let a = seed_worker("swarm-a");
        let b = seed_worker("swarm-b");

        let id_a = import_worker(&canonical, &a, "swarm-a").unwrap();
        let id_b = import_worker(&canonical, &b, "swarm-b").unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(ExperimentManager::new(&canonical).list_all().unwrap().len(), 2);
    }
}
