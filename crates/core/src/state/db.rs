//! # Experiment Database
//!
//! Single SQLite database per store instance. The canonical store lives at
//! `.crucible/crucible.db`; every swarm worker gets its own fresh instance
//! under `.crucible/worker-dbs/`, outside the worktrees. Child rows only ever
//! reference experiments in the same instance; cross-store imports rewrite
//! all identifiers.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Handle to one store instance.
pub struct ExperimentDb {
    conn: Arc<Mutex<Connection>>,
}

impl ExperimentDb {
    /// Open the canonical store for a project root.
    pub fn open_in(project_root: &Path) -> Result<Self> {
        Self::open_at(super::io::db_path(project_root))
    }

    /// Open a store at a specific path (fresh worker instances, testing).
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open crucible database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Fresh in-memory instance (tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Shared connection for the entity managers.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            self.migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - complete schema
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS experiments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slug TEXT NOT NULL UNIQUE,
                branch TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'classified',
                hypothesis TEXT NOT NULL,
                sub_type TEXT NOT NULL DEFAULT 'general',
                builder_guidance TEXT NOT NULL DEFAULT '',
                guidance_iteration INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                depends_on TEXT,
                gate_rejection_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        // Append-only; overturn is a pointer to the superseding row, never an edit.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id INTEGER NOT NULL REFERENCES experiments(id),
                claim TEXT NOT NULL,
                evidence_level TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                superseded_by INTEGER,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        // Append-only time series used for before/after comparison.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id INTEGER NOT NULL REFERENCES experiments(id),
                phase TEXT NOT NULL CHECK (phase IN ('before', 'after')),
                fixture TEXT NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS dead_ends (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id INTEGER NOT NULL REFERENCES experiments(id),
                approach TEXT NOT NULL,
                why_failed TEXT NOT NULL,
                structural_constraint TEXT NOT NULL DEFAULT '',
                sub_type TEXT NOT NULL,
                category TEXT NOT NULL CHECK (category IN ('structural', 'procedural')),
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS verifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id INTEGER NOT NULL REFERENCES experiments(id),
                component TEXT NOT NULL,
                grade TEXT NOT NULL,
                provenance_intact INTEGER,
                content_correct INTEGER,
                notes TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS doubts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id INTEGER NOT NULL REFERENCES experiments(id),
                claim TEXT NOT NULL,
                evidence_level TEXT NOT NULL,
                evidence TEXT NOT NULL DEFAULT '',
                severity TEXT NOT NULL,
                resolution TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS challenges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id INTEGER NOT NULL REFERENCES experiments(id),
                target_claim TEXT NOT NULL,
                objection TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        // Never overwritten, never edited.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS fragility (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id INTEGER NOT NULL REFERENCES experiments(id),
                component TEXT NOT NULL,
                notes TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sub_type_failures (
                sub_type TEXT PRIMARY KEY,
                tally INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS swarm_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                goal TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS swarm_members (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES swarm_runs(id),
                experiment_slug TEXT NOT NULL,
                status TEXT NOT NULL,
                grade TEXT,
                cost_usd REAL NOT NULL DEFAULT 0,
                error TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_experiments_sub_type ON experiments(sub_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_decisions_experiment ON decisions(experiment_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_metrics_experiment ON metrics(experiment_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_dead_ends_sub_type ON dead_ends(sub_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_verifications_experiment ON verifications(experiment_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_doubts_experiment ON doubts(experiment_id)",
            [],
        )?;

        tracing::info!(
            "ExperimentDb initialized with schema version {}",
            SCHEMA_VERSION
        );

        Ok(())
    }
}
