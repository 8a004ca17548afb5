//! # External Agent Invocation
//!
//! Every reasoning step is an external OS process: Crucible hands it a role,
//! a prompt, an allowed-capability list and a model name, and concatenates
//! the incremental text stream into one transcript. The core never inspects
//! internal reasoning, only the final text.

mod subprocess;

pub use subprocess::SubprocessInvoker;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Roles an external agent can be invoked as. One role per workflow step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Builder,
    Challenger,
    Doubter,
    Scout,
    Verifier,
    Gatekeeper,
    Planner,
    Summarizer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builder => "builder",
            Self::Challenger => "challenger",
            Self::Doubter => "doubter",
            Self::Scout => "scout",
            Self::Verifier => "verifier",
            Self::Gatekeeper => "gatekeeper",
            Self::Planner => "planner",
            Self::Summarizer => "summarizer",
        }
    }

    /// Capabilities granted to the external process for this role.
    /// Only the builder may touch the working tree or run commands.
    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::Builder => &["read", "write", "run"],
            Self::Scout => &["read", "run"],
            _ => &["read"],
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: AgentRole,
    pub prompt: String,
    pub capabilities: Vec<String>,
    pub model: String,
    /// Working directory for the process (the experiment's checkout).
    pub cwd: PathBuf,
    pub timeout: Duration,
}

impl AgentRequest {
    pub fn new(role: AgentRole, prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            role,
            prompt: prompt.into(),
            capabilities: role.capabilities().iter().map(|c| c.to_string()).collect(),
            model: model.into(),
            cwd: PathBuf::from("."),
            timeout: Duration::from_secs(900),
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Final transcript of an agent invocation.
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// Concatenated text stream.
    pub text: String,
    /// Cost reported by the agent runner, if any.
    pub cost_usd: Option<f64>,
}

/// The seam between the workflow and the external agent process.
/// Production uses [`SubprocessInvoker`]; tests substitute fakes.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply>;
}
