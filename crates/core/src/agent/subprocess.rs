//! # Subprocess Agent Runner
//!
//! Spawns the configured agent command, feeds the prompt on stdin, and
//! concatenates the stdout stream into one transcript. A timeout is a failed
//! attempt for the calling step, never a crash of the run.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{AgentInvoker, AgentReply, AgentRequest};
use crate::error::CoreError;

/// Invokes an external agent binary per request.
///
/// The command receives `--role`, `--model` and `--allow` arguments, the
/// prompt on stdin, and is expected to stream plain text on stdout. An
/// optional final line of the form `{"cost_usd": 0.12}` is parsed as run
/// statistics and stripped from the transcript.
pub struct SubprocessInvoker {
    command: String,
}

impl SubprocessInvoker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl AgentInvoker for SubprocessInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        let mut child = Command::new(&self.command)
            .arg("--role")
            .arg(request.role.as_str())
            .arg("--model")
            .arg(&request.model)
            .arg("--allow")
            .arg(request.capabilities.join(","))
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn agent command `{}`", self.command))?;

        let mut stdin = child
            .stdin
            .take()
            .context("Agent process has no stdin handle")?;
        let stdout = child
            .stdout
            .take()
            .context("Agent process has no stdout handle")?;

        let prompt = request.prompt.clone();
        let writer = tokio::spawn(async move {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            // Dropping stdin closes the pipe so the agent sees EOF.
            drop(stdin);
        });

        let collect = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut transcript = String::new();
            while let Some(line) = lines.next_line().await? {
                transcript.push_str(&line);
                transcript.push('\n');
            }
            let status = child.wait().await?;
            anyhow::Ok((transcript, status))
        };

        let (transcript, status) = match tokio::time::timeout(request.timeout, collect).await {
            Ok(result) => result?,
            Err(_) => {
                // Stop waiting; the process is left to finish on its own.
                tracing::warn!(
                    role = %request.role,
                    seconds = request.timeout.as_secs(),
                    "agent invocation timed out"
                );
                let _ = writer.await;
                return Err(CoreError::SubprocessTimeout {
                    command: self.command.clone(),
                    seconds: request.timeout.as_secs(),
                }
                .into());
            }
        };
        let _ = writer.await;

        if !status.success() {
            return Err(CoreError::SubprocessFailure {
                command: self.command.clone(),
                reason: format!("agent exited with {status}"),
            }
            .into());
        }

        Ok(split_stats(transcript))
    }
}

/// Strip a trailing JSON stats line, if present, and lift out `cost_usd`.
fn split_stats(transcript: String) -> AgentReply {
    let trimmed = transcript.trim_end();
    if let Some(last) = trimmed.lines().last() {
        if last.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(last) {
                if let Some(cost) = value.get("cost_usd").and_then(|c| c.as_f64()) {
                    let body = trimmed[..trimmed.len() - last.len()].trim_end().to_string();
                    return AgentReply {
                        text: body,
                        cost_usd: Some(cost),
                    };
                }
            }
        }
    }
    AgentReply {
        text: transcript,
        cost_usd: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_stats_with_cost_line() {
        let reply = split_stats("work done\n{\"cost_usd\": 0.25}\n".to_string());
        assert_eq!(reply.text, "work done");
        assert_eq!(reply.cost_usd, Some(0.25));
    }

    #[test]
    fn test_split_stats_without_cost_line() {
        let reply = split_stats("plain text output\n".to_string());
        assert_eq!(reply.text, "plain text output\n");
        assert!(reply.cost_usd.is_none());
    }

    #[test]
    fn test_split_stats_ignores_non_stats_json() {
        // A JSON line without cost_usd stays part of the transcript.
        let reply = split_stats("{\"grade\": \"sound\"}\n".to_string());
        assert!(reply.text.contains("grade"));
        assert!(reply.cost_usd.is_none());
    }
}
