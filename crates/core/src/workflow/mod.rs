//! # Workflow
//!
//! Step drivers and the loop that walks an experiment through its lifecycle.
//! The loop consults the deterministic next-step policy, polls the shutdown
//! flag between steps, and stops after at most `step_budget` steps.

pub mod prompts;
pub mod steps;

pub use steps::{
    build_step, challenge_step, classify_and_create, compress_step, doubt_step, gate_step,
    scout_step, verify_step,
};

use anyhow::Result;

use crate::context::CycleContext;
use crate::lifecycle::{self, ExperimentStatus};
use crate::resolve::{self, Disposition};
use crate::state::{
    ChallengeManager, DeadEndCategory, DeadEndManager, DoubtManager, ExperimentManager,
};

/// Resolution mode for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Full effects: merges and discards touch the working tree.
    Canonical,
    /// Swarm worker: sound/good outcomes are held at RESOLVED for the
    /// coordinator to merge centrally.
    Worker,
}

/// Drive one experiment until it is terminal, held for the coordinator, or
/// out of step budget. Returns the status the experiment ended at.
pub async fn run_experiment(
    ctx: &CycleContext,
    slug: &str,
    mode: RunMode,
    step_budget: u32,
) -> Result<ExperimentStatus> {
    let experiments = ExperimentManager::new(&ctx.db);

    for _ in 0..step_budget {
        if ctx.shutdown_requested() {
            tracing::info!(slug, "shutdown requested; stopping after durable write");
            break;
        }

        let experiment = experiments.load(slug)?;
        if lifecycle::is_terminal(experiment.status) {
            return Ok(experiment.status);
        }

        match experiment.status {
            ExperimentStatus::Classified | ExperimentStatus::Reframed => {
                let report = gate_step(ctx, slug).await?;
                if !report.approved {
                    reject_at_gate(ctx, slug, &report.reason)?;
                    return Ok(ExperimentStatus::DeadEnd);
                }
            }
            ExperimentStatus::Gated => {
                let experiment = experiments.load(slug)?;
                if experiment.gate_rejection_reason.is_some() {
                    // A rejected hypothesis needs operator revision; the
                    // automatic loop does not ride the GATED self-loop.
                    reject_at_gate(ctx, slug, "gate rejection pending revision")?;
                    return Ok(ExperimentStatus::DeadEnd);
                }
                build_step(ctx, slug).await?;
            }
            ExperimentStatus::Building => {
                build_step(ctx, slug).await?;
            }
            ExperimentStatus::Built
            | ExperimentStatus::Challenged
            | ExperimentStatus::Doubted => {
                dispatch_review(ctx, slug, experiment.status).await?;
            }
            ExperimentStatus::Scouted => {
                verify_step(ctx, slug).await?;
            }
            ExperimentStatus::Verifying => {
                // Crashed mid-verification; re-enter the step.
                verify_step(ctx, slug).await?;
            }
            ExperimentStatus::Verified | ExperimentStatus::Resolved => {
                let outcome = match mode {
                    RunMode::Canonical => resolve::resolve_experiment(ctx, slug).await?,
                    RunMode::Worker => resolve::resolve_db_only(ctx, slug).await?,
                };
                match outcome.disposition {
                    Disposition::HeldForCoordinator => return Ok(ExperimentStatus::Resolved),
                    Disposition::MergeConflict { paths } => {
                        tracing::warn!(slug, ?paths, "merge conflict; manual action required");
                        return Ok(ExperimentStatus::Resolved);
                    }
                    _ => {}
                }
            }
            ExperimentStatus::Compressed => {
                compress_step(ctx, slug).await?;
            }
            ExperimentStatus::Merged | ExperimentStatus::DeadEnd => unreachable!(),
        }
    }

    let status = experiments.load(slug)?.status;
    if !lifecycle::is_terminal(status) {
        tracing::warn!(slug, %status, "run stopped before a terminal status");
    }
    Ok(status)
}

/// Classify a goal into an experiment and drive it to completion.
pub async fn run_goal(ctx: &CycleContext, goal: &str) -> Result<(String, ExperimentStatus)> {
    let experiment = classify_and_create(ctx, goal).await?;
    let status = run_experiment(
        ctx,
        &experiment.slug,
        RunMode::Canonical,
        ctx.config.worker_step_budget,
    )
    .await?;
    Ok((experiment.slug, status))
}

async fn dispatch_review(
    ctx: &CycleContext,
    slug: &str,
    status: ExperimentStatus,
) -> Result<()> {
    let experiments = ExperimentManager::new(&ctx.db);
    let experiment = experiments.load(slug)?;

    // A disabled review requirement counts as already satisfied.
    let has_doubts = !ctx.config.require_doubts
        || !DoubtManager::new(&ctx.db)
            .list_for_experiment(experiment.id)?
            .is_empty();
    let has_challenges = !ctx.config.require_challenges
        || !ChallengeManager::new(&ctx.db)
            .list_for_experiment(experiment.id)?
            .is_empty();

    match lifecycle::determine_next_step(status, has_doubts, has_challenges) {
        Some(ExperimentStatus::Doubted) => {
            doubt_step(ctx, slug).await?;
        }
        Some(ExperimentStatus::Challenged) => {
            challenge_step(ctx, slug).await?;
        }
        Some(ExperimentStatus::Verifying) => {
            // Unresolved doubts get a scout pass before verification.
            let unresolved = DoubtManager::new(&ctx.db)
                .list_for_experiment(experiment.id)?
                .iter()
                .any(|d| d.resolution.is_none());
            if unresolved {
                scout_step(ctx, slug).await?;
            } else {
                verify_step(ctx, slug).await?;
            }
        }
        other => anyhow::bail!("unexpected next step {other:?} from {status}"),
    }
    Ok(())
}

fn reject_at_gate(ctx: &CycleContext, slug: &str, reason: &str) -> Result<()> {
    let experiments = ExperimentManager::new(&ctx.db);
    let experiment = experiments.load(slug)?;
    DeadEndManager::new(&ctx.db).record(
        experiment.id,
        &experiment.hypothesis,
        reason,
        "",
        &experiment.sub_type,
        DeadEndCategory::Procedural,
    )?;
    experiments.set_status(slug, ExperimentStatus::DeadEnd)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInvoker, AgentReply, AgentRequest};
    use crate::config::CycleConfig;
    use crate::state::ExperimentDb;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Replies keyed by role, so the loop can run several steps end to end.
    struct RoleInvoker {
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentInvoker for RoleInvoker {
        async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
            self.log.lock().unwrap().push(request.role.to_string());
            let text = match request.role.as_str() {
                "gatekeeper" => {
                    "```json\n{\"approved\": true, \"reason\": \"\", \"sub_type\": \"caching\"}\n```"
                }
                "doubter" => {
                    "```json\n{\"doubts\": [{\"claim\": \"c\", \"evidence\": \"\", \"severity\": \"minor\"}]}\n```"
                }
                "challenger" => {
                    "```json\n{\"challenges\": [{\"target_claim\": \"c\", \"objection\": \"o\"}]}\n```"
                }
                "scout" => {
                    "```json\n{\"findings\": \"ok\", \"doubt_resolutions\": [{\"doubt_id\": 1, \"outcome\": \"dismissed\", \"evidence\": \"\"}]}\n```"
                }
                "verifier" => {
                    "```json\n{\"components\": [{\"component\": \"all\", \"grade\": \"sound\", \"notes\": \"\"}]}\n```"
                }
                _ => "```json\n{\"guidance\": \"g\", \"dead_approaches\": []}\n```",
            };
            Ok(AgentReply {
                text: text.to_string(),
                cost_usd: Some(0.01),
            })
        }
    }

    fn worker_ctx() -> (tempfile::TempDir, CycleContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CycleContext::new(
            Arc::new(CycleConfig::default()),
            Arc::new(ExperimentDb::open_memory().unwrap()),
            dir.path().to_path_buf(),
            Arc::new(RoleInvoker {
                log: Mutex::new(Vec::new()),
            }),
        );
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_worker_run_from_built_holds_sound_at_resolved() {
        // Starting from BUILT skips the git-dependent build step.
        let (_dir, ctx) = worker_ctx();
        let experiments = ExperimentManager::new(&ctx.db);
        experiments.create("w", "h", "caching").unwrap();
        for status in [
            ExperimentStatus::Gated,
            ExperimentStatus::Building,
            ExperimentStatus::Built,
        ] {
            experiments.set_status("w", status).unwrap();
        }

        let status = run_experiment(&ctx, "w", RunMode::Worker, 24).await.unwrap();
        assert_eq!(status, ExperimentStatus::Resolved);

        // Doubt, challenge, scout and verify all ran.
        let exp = experiments.load("w").unwrap();
        assert!(!DoubtManager::new(&ctx.db)
            .list_for_experiment(exp.id)
            .unwrap()
            .is_empty());
        assert!(!ChallengeManager::new(&ctx.db)
            .list_for_experiment(exp.id)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_between_steps() {
        let (_dir, ctx) = worker_ctx();
        let experiments = ExperimentManager::new(&ctx.db);
        experiments.create("s", "h", "caching").unwrap();
        for status in [
            ExperimentStatus::Gated,
            ExperimentStatus::Building,
            ExperimentStatus::Built,
        ] {
            experiments.set_status("s", status).unwrap();
        }

        ctx.request_shutdown();
        let status = run_experiment(&ctx, "s", RunMode::Worker, 24).await.unwrap();
        // Nothing ran; the experiment is exactly where it was.
        assert_eq!(status, ExperimentStatus::Built);
    }

    #[tokio::test]
    async fn test_step_budget_caps_the_loop() {
        let (_dir, ctx) = worker_ctx();
        let experiments = ExperimentManager::new(&ctx.db);
        experiments.create("b", "h", "caching").unwrap();
        for status in [
            ExperimentStatus::Gated,
            ExperimentStatus::Building,
            ExperimentStatus::Built,
        ] {
            experiments.set_status("b", status).unwrap();
        }

        // One step only: the doubt pass runs, nothing further.
        let status = run_experiment(&ctx, "b", RunMode::Worker, 1).await.unwrap();
        assert_eq!(status, ExperimentStatus::Doubted);
    }
}
