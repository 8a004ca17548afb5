//! # Cycle Context
//!
//! Everything a step needs, threaded explicitly. No globals: swarm workers
//! build their own contexts over fresh stores and isolated checkouts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::agent::{AgentInvoker, SubprocessInvoker};
use crate::config::CycleConfig;
use crate::state::ExperimentDb;

/// Shared context for one orchestration run.
#[derive(Clone)]
pub struct CycleContext {
    pub config: Arc<CycleConfig>,
    pub db: Arc<ExperimentDb>,
    pub project_root: PathBuf,
    pub invoker: Arc<dyn AgentInvoker>,
    shutdown: Arc<AtomicBool>,
}

impl CycleContext {
    /// Context over explicit parts. Production callers prefer [`Self::open`].
    pub fn new(
        config: Arc<CycleConfig>,
        db: Arc<ExperimentDb>,
        project_root: PathBuf,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Self {
        Self {
            config,
            db,
            project_root,
            invoker,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context for the canonical store at a project root.
    pub fn open(project_root: PathBuf) -> Result<Self> {
        let config = CycleConfig::load(&project_root)?;
        crate::state::io::ensure_runtime_excluded(&project_root)?;
        let db = ExperimentDb::open_in(&project_root)?;
        let invoker = SubprocessInvoker::new(&config.agent_command);
        Ok(Self::new(
            Arc::new(config),
            Arc::new(db),
            project_root,
            Arc::new(invoker),
        ))
    }

    /// Context for a swarm worker: same config and invoker, fresh store,
    /// isolated checkout, shared shutdown flag.
    pub fn for_worker(&self, db: Arc<ExperimentDb>, checkout: PathBuf) -> Self {
        Self {
            config: Arc::clone(&self.config),
            db,
            project_root: checkout,
            invoker: Arc::clone(&self.invoker),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Swap the invoker (cost tracking wrappers, test doubles).
    pub fn with_invoker(mut self, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Polled between steps; a set flag stops after the current durable write.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
