//! Parallel experimentation. The planner proposes mechanism-distinct
//! hypotheses; each runs in its own git worktree against its own fresh store.
//! The coordinator joins all workers, imports every store into the canonical
//! one, merges the single best branch, and always cleans up its worktrees.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::agent::{AgentInvoker, AgentReply, AgentRequest, AgentRole};
use crate::context::CycleContext;
use crate::error::CoreError;
use crate::extract::{self, Hypothesis, StructuredOutput};
use crate::lifecycle::ExperimentStatus;
use crate::resolve::worst_grade;
use crate::state::{
    io, DeadEndCategory, DeadEndManager, ExperimentDb, ExperimentManager, Grade, SwarmManager,
    VerificationManager, generate_slug,
};
use crate::tools::git;
use crate::workflow::{self, prompts, RunMode};

use super::import::import_worker;

/// One worker's result as seen by the coordinator.
#[derive(Debug, Clone)]
pub struct MemberSummary {
    pub slug: String,
    pub branch: String,
    pub status: ExperimentStatus,
    pub grade: Option<Grade>,
    pub cost_usd: f64,
    pub error: Option<String>,
    pub winner: bool,
}

#[derive(Debug, Clone)]
pub struct SwarmOutcome {
    pub run_id: i64,
    pub goal: String,
    pub members: Vec<MemberSummary>,
    /// Slug of the merged winner, if any worker graded sound or good.
    pub winner: Option<String>,
    pub merged: usize,
    /// Members actually finalized as DEAD_END in the canonical store.
    pub dead_ended: usize,
    pub errored: usize,
}

/// Wraps an invoker and accumulates reported costs for one worker.
struct CostTrackingInvoker {
    inner: Arc<dyn AgentInvoker>,
    total: Mutex<f64>,
}

impl CostTrackingInvoker {
    fn new(inner: Arc<dyn AgentInvoker>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            total: Mutex::new(0.0),
        })
    }

    fn total(&self) -> f64 {
        self.total.lock().map(|t| *t).unwrap_or(0.0)
    }
}

#[async_trait]
impl AgentInvoker for CostTrackingInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        let reply = self.inner.invoke(request).await?;
        if let Some(cost) = reply.cost_usd {
            if let Ok(mut total) = self.total.lock() {
                *total += cost;
            }
        }
        Ok(reply)
    }
}

/// Two hypotheses are duplicates when their mechanisms match after
/// lowercasing and whitespace collapsing. First occurrence wins.
pub fn dedupe_mechanisms(hypotheses: Vec<Hypothesis>) -> Vec<Hypothesis> {
    let mut seen = std::collections::HashSet::new();
    hypotheses
        .into_iter()
        .filter(|h| {
            let key = h
                .mechanism
                .to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            seen.insert(key)
        })
        .collect()
}

struct Worker {
    index: usize,
    slug: String,
    branch: String,
    worktree: PathBuf,
    db: Arc<ExperimentDb>,
    db_path: PathBuf,
    cost: Arc<CostTrackingInvoker>,
}

/// Run a swarm toward `goal`. Refuses to start on a dirty working tree;
/// stale worktrees from a crashed run are pruned first.
pub async fn run_swarm(
    ctx: &CycleContext,
    goal: &str,
    parallel: Option<usize>,
) -> Result<SwarmOutcome> {
    if !git::is_clean(&ctx.project_root)? {
        return Err(CoreError::DirtyWorkingTree.into());
    }
    git::prune_stale_swarm_worktrees(&ctx.project_root).await?;

    let width = ctx.config.effective_parallel(parallel);
    let hypotheses = plan_hypotheses(ctx, goal, width).await?;
    if hypotheses.is_empty() {
        anyhow::bail!("Planner produced no usable hypotheses for goal: {goal}");
    }

    let run_id = SwarmManager::new(&ctx.db).create_run(goal)?;
    tracing::info!(run_id, goal, workers = hypotheses.len(), "swarm starting");

    let mut workers = Vec::new();
    for (index, hypothesis) in hypotheses.iter().enumerate() {
        workers.push(spawn_preparation(ctx, index, hypothesis).await?);
    }

    let handles: Vec<JoinHandle<Result<ExperimentStatus>>> = workers
        .iter()
        .map(|w| {
            let worker_ctx = ctx
                .for_worker(Arc::clone(&w.db), w.worktree.clone())
                .with_invoker(w.cost.clone() as Arc<dyn AgentInvoker>);
            let slug = w.slug.clone();
            let budget = ctx.config.worker_step_budget;
            tokio::spawn(async move {
                workflow::run_experiment(&worker_ctx, &slug, RunMode::Worker, budget).await
            })
        })
        .collect();

    // All-settled join: every worker's outcome is collected, panics included.
    let mut results = Vec::new();
    for (worker, handle) in workers.iter().zip(handles) {
        let outcome = match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(anyhow::anyhow!("worker task failed: {join_error}")),
        };
        results.push((worker.index, outcome));
    }

    let outcome = aggregate(ctx, run_id, goal, &workers, results).await;

    // Cleanup runs regardless of how aggregation went.
    for worker in &workers {
        git::remove_worktree(&ctx.project_root, &worker.worktree, &worker.branch).await?;
        std::fs::remove_file(&worker.db_path).ok();
    }

    outcome
}

async fn plan_hypotheses(ctx: &CycleContext, goal: &str, width: usize) -> Result<Vec<Hypothesis>> {
    let constraints = DeadEndManager::new(&ctx.db).all_structural_constraints()?;
    let request = AgentRequest::new(
        AgentRole::Planner,
        prompts::plan(goal, width, &constraints),
        ctx.config.model_for(AgentRole::Planner),
    )
    .in_dir(&ctx.project_root)
    .with_timeout(ctx.config.subprocess_timeout());
    let reply = ctx.invoker.invoke(&request).await?;
    let (output, _) = extract::extract(ctx, "swarm-plan", AgentRole::Planner, &reply.text).await?;
    let StructuredOutput::Plan(report) = output else {
        anyhow::bail!("extraction returned a non-planner output variant");
    };

    let mut hypotheses = dedupe_mechanisms(report.hypotheses);
    hypotheses.retain(|h| !h.hypothesis.trim().is_empty());
    hypotheses.truncate(width);
    Ok(hypotheses)
}

async fn spawn_preparation(
    ctx: &CycleContext,
    index: usize,
    hypothesis: &Hypothesis,
) -> Result<Worker> {
    let slug = format!("swarm-{}-w{index}", generate_slug(&hypothesis.hypothesis));
    let branch = format!("crucible/{slug}");
    let worktree = io::worktrees_dir(&ctx.project_root).join(&slug);

    git::create_worktree(&ctx.project_root, &worktree, &branch)
        .await
        .with_context(|| format!("Failed to prepare worktree for worker {index}"))?;

    // Worker stores live outside the worktrees so checkouts stay clean.
    let db_path = io::runtime_dir(&ctx.project_root)
        .join("worker-dbs")
        .join(format!("{slug}.db"));
    let db = Arc::new(ExperimentDb::open_at(&db_path)?);
    ExperimentManager::new(&db).create(
        &slug,
        &hypothesis.hypothesis,
        hypothesis.sub_type.as_deref().unwrap_or("general"),
    )?;

    Ok(Worker {
        index,
        slug,
        branch,
        worktree,
        db,
        db_path,
        cost: CostTrackingInvoker::new(Arc::clone(&ctx.invoker)),
    })
}

async fn aggregate(
    ctx: &CycleContext,
    run_id: i64,
    goal: &str,
    workers: &[Worker],
    results: Vec<(usize, Result<ExperimentStatus>)>,
) -> Result<SwarmOutcome> {
    let mut members = Vec::new();

    for worker in workers {
        let (_, outcome) = &results[worker.index];

        // Whatever state the worker reached is imported, errors included;
        // its dead ends and doubts inform future runs either way.
        if let Err(e) = import_worker(&ctx.db, &worker.db, &worker.slug) {
            tracing::error!(slug = %worker.slug, error = %e, "worker import failed");
        }

        let status = match outcome {
            Ok(status) => *status,
            Err(_) => ExperimentManager::new(&worker.db)
                .load(&worker.slug)
                .map(|e| e.status)
                .unwrap_or(ExperimentStatus::Classified),
        };
        let grades: Vec<Grade> = VerificationManager::new(&worker.db)
            .list_for_experiment(
                ExperimentManager::new(&worker.db)
                    .load(&worker.slug)
                    .map(|e| e.id)
                    .unwrap_or(0),
            )
            .unwrap_or_default()
            .iter()
            .map(|v| v.grade)
            .collect();

        members.push(MemberSummary {
            slug: worker.slug.clone(),
            branch: worker.branch.clone(),
            status,
            grade: worst_grade(&grades).ok(),
            cost_usd: worker.cost.total(),
            error: outcome.as_ref().err().map(|e| format!("{e:#}")),
            winner: false,
        });
    }

    let winner_index = select_winner(&members);

    let experiments = ExperimentManager::new(&ctx.db);
    let mut conflicted_index = None;
    if let Some(winner_index) = winner_index {
        let winner_slug = members[winner_index].slug.clone();
        let winner_branch = members[winner_index].branch.clone();

        let merge = git::merge_branch(
            &ctx.project_root,
            &winner_branch,
            &format!("Merge swarm winner {winner_slug}: {goal}"),
        )
        .await?;
        match merge {
            git::MergeResult::Success => {
                experiments.set_status(&winner_slug, ExperimentStatus::Merged)?;
                members[winner_index].status = ExperimentStatus::Merged;
                members[winner_index].winner = true;
            }
            git::MergeResult::Conflicts(paths) => {
                tracing::warn!(slug = %winner_slug, ?paths, "winner merge conflicted; left at RESOLVED");
                conflicted_index = Some(winner_index);
            }
        }
    }

    // Every non-winning worker is closed out in the canonical store, whatever
    // state its budget left it in; the worktrees and branches are about to be
    // deleted. A conflicted winner stays at RESOLVED for manual action.
    let merged_winner = members.iter().find(|m| m.winner).map(|m| m.slug.clone());
    let mut dead_ended = 0;
    for (index, member) in members.iter_mut().enumerate() {
        if member.winner || member.error.is_some() || conflicted_index == Some(index) {
            continue;
        }
        let Ok(exp) = experiments.load(&member.slug) else {
            continue;
        };
        if crate::lifecycle::is_terminal(exp.status) {
            if exp.status == ExperimentStatus::DeadEnd {
                dead_ended += 1;
            }
            member.status = exp.status;
            continue;
        }
        let why = match &merged_winner {
            Some(winner_slug) => format!("superseded by winning swarm sibling {winner_slug}"),
            None => "swarm ended without a mergeable winner".to_string(),
        };
        DeadEndManager::new(&ctx.db).record(
            exp.id,
            &exp.hypothesis,
            &why,
            "",
            &exp.sub_type,
            DeadEndCategory::Procedural,
        )?;
        experiments.set_status(&member.slug, ExperimentStatus::DeadEnd)?;
        member.status = ExperimentStatus::DeadEnd;
        dead_ended += 1;
    }

    let swarm = SwarmManager::new(&ctx.db);
    for member in &members {
        swarm.add_member(
            run_id,
            &member.slug,
            member.status.as_str(),
            member.grade,
            member.cost_usd,
            member.error.as_deref(),
        )?;
    }

    let winner = members.iter().find(|m| m.winner).map(|m| m.slug.clone());
    let merged = members.iter().filter(|m| m.winner).count();
    let errored = members.iter().filter(|m| m.error.is_some()).count();
    tracing::info!(
        run_id,
        ?winner,
        merged,
        dead_ended,
        errored,
        "swarm complete"
    );
    Ok(SwarmOutcome {
        run_id,
        goal: goal.to_string(),
        members,
        winner,
        merged,
        dead_ended,
        errored,
    })
}

/// Winner: best grade among workers held at RESOLVED, ties broken by spawn
/// order. Deterministic across completion orderings.
fn select_winner(members: &[MemberSummary]) -> Option<usize> {
    members
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            m.status == ExperimentStatus::Resolved
                && matches!(m.grade, Some(Grade::Sound) | Some(Grade::Good))
        })
        .min_by_key(|(index, m)| (m.grade.map(|g| g.severity()).unwrap_or(u8::MAX), *index))
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hypothesis(text: &str, mechanism: &str) -> Hypothesis {
        Hypothesis {
            hypothesis: text.to_string(),
            mechanism: mechanism.to_string(),
            sub_type: None,
        }
    }

    #[test]
    fn test_dedupe_is_case_and_whitespace_insensitive() {
        let kept = dedupe_mechanisms(vec![
            hypothesis("a", "memoize  the Planner"),
            hypothesis("b", "memoize the planner"),
            hypothesis("c", "batch writes"),
        ]);
        assert_eq!(kept.len(), 2);
        // First occurrence wins.
        assert_eq!(kept[0].hypothesis, "a");
        assert_eq!(kept[1].hypothesis, "c");
    }

    #[test]
    fn test_winner_selection_prefers_grade_then_spawn_order() {
        let member = |index: usize, status, grade| MemberSummary {
            slug: format!("w{index}"),
            branch: String::new(),
            status,
            grade,
            cost_usd: 0.0,
            error: None,
            winner: false,
        };
        let members = vec![
            member(0, ExperimentStatus::Resolved, Some(Grade::Good)),
            member(1, ExperimentStatus::Resolved, Some(Grade::Sound)),
            member(2, ExperimentStatus::Resolved, Some(Grade::Sound)),
            member(3, ExperimentStatus::DeadEnd, Some(Grade::Rejected)),
        ];

        // Sound beats good; the earlier-spawned sound worker wins the tie.
        assert_eq!(select_winner(&members), Some(1));
    }

    struct SilentInvoker;

    #[async_trait]
    impl AgentInvoker for SilentInvoker {
        async fn invoke(&self, _request: &AgentRequest) -> Result<AgentReply> {
            Ok(AgentReply {
                text: String::new(),
                cost_usd: None,
            })
        }
    }

    async fn repo_git(dir: &std::path::Path, args: &[&str]) {
        let status = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    async fn init_repo(dir: &std::path::Path) {
        repo_git(dir, &["init", "-b", "main"]).await;
        repo_git(dir, &["config", "user.email", "t@example.com"]).await;
        repo_git(dir, &["config", "user.name", "Test"]).await;
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        repo_git(dir, &["add", "-A"]).await;
        repo_git(dir, &["commit", "-m", "init"]).await;
    }

    fn test_ctx(dir: &std::path::Path) -> CycleContext {
        CycleContext::new(
            Arc::new(crate::config::CycleConfig::default()),
            Arc::new(ExperimentDb::open_memory().unwrap()),
            dir.to_path_buf(),
            Arc::new(SilentInvoker),
        )
    }

    fn seeded_worker(
        index: usize,
        slug: &str,
        dir: &std::path::Path,
        statuses: &[ExperimentStatus],
        grade: Option<Grade>,
    ) -> Worker {
        let db = Arc::new(ExperimentDb::open_memory().unwrap());
        let experiments = ExperimentManager::new(&db);
        let exp = experiments.create(slug, "hypothesis", "general").unwrap();
        for status in statuses {
            experiments.set_status(slug, *status).unwrap();
        }
        if let Some(grade) = grade {
            VerificationManager::new(&db)
                .record(exp.id, "all", grade, Some(true), Some(true), "")
                .unwrap();
        }
        Worker {
            index,
            slug: slug.to_string(),
            branch: format!("crucible/{slug}"),
            worktree: dir.join(slug),
            db,
            db_path: dir.join(format!("{slug}.db")),
            cost: CostTrackingInvoker::new(Arc::new(SilentInvoker)),
        }
    }

    use ExperimentStatus::{
        Building, Built, DeadEnd, Gated, Merged, Resolved, Verified, Verifying,
    };

    const FULL_CYCLE: &[ExperimentStatus] =
        &[Gated, Building, Built, Verifying, Verified, Resolved];

    #[tokio::test]
    async fn test_aggregate_merges_winner_and_finalizes_losers() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let ctx = test_ctx(dir.path());

        let workers = vec![
            seeded_worker(0, "swarm-a-w0", dir.path(), FULL_CYCLE, Some(Grade::Sound)),
            // Budget exhausted mid-build, no resolution.
            seeded_worker(1, "swarm-b-w1", dir.path(), &[Gated, Building], Some(Grade::Weak)),
            seeded_worker(
                2,
                "swarm-c-w2",
                dir.path(),
                &[Gated, Building, Built, Verifying, Verified, Resolved, DeadEnd],
                Some(Grade::Rejected),
            ),
        ];

        // The winner's branch carries one commit to merge.
        git::ensure_branch(dir.path(), &workers[0].branch).unwrap();
        std::fs::write(dir.path().join("feature.txt"), "work\n").unwrap();
        git::commit_all(dir.path(), "worker result").await.unwrap();

        let run_id = SwarmManager::new(&ctx.db).create_run("goal").unwrap();
        let results = vec![
            (0, Ok(Resolved)),
            (1, Ok(Building)),
            (2, Ok(DeadEnd)),
        ];
        let outcome = aggregate(&ctx, run_id, "goal", &workers, results)
            .await
            .unwrap();

        assert_eq!(outcome.winner.as_deref(), Some("swarm-a-w0"));
        assert_eq!(outcome.merged, 1);
        assert_eq!(outcome.dead_ended, 2);
        assert_eq!(outcome.errored, 0);

        // Winner merged into trunk, every loser terminal in the canonical store.
        assert!(dir.path().join("feature.txt").exists());
        let experiments = ExperimentManager::new(&ctx.db);
        assert_eq!(experiments.load("swarm-a-w0").unwrap().status, Merged);
        assert_eq!(experiments.load("swarm-b-w1").unwrap().status, DeadEnd);
        assert_eq!(experiments.load("swarm-c-w2").unwrap().status, DeadEnd);

        // The unfinished loser's learnings are preserved as a procedural entry.
        let unfinished = experiments.load("swarm-b-w1").unwrap();
        let dead = DeadEndManager::new(&ctx.db)
            .list_for_experiment(unfinished.id)
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].why_failed.contains("swarm-a-w0"));

        // Member rows record the canonical final statuses.
        let stored: Vec<(String, String)> = {
            let conn = ctx.db.connection();
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT experiment_slug, status FROM swarm_members
                     WHERE run_id = ?1 ORDER BY id",
                )
                .unwrap();
            stmt.query_map([run_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .unwrap()
                .collect::<std::result::Result<_, _>>()
                .unwrap()
        };
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].1, "merged");
        assert_eq!(stored[1].1, "dead_end");
        assert_eq!(stored[2].1, "dead_end");
    }

    #[tokio::test]
    async fn test_aggregate_without_winner_still_finalizes_losers() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let ctx = test_ctx(dir.path());

        let workers = vec![
            seeded_worker(0, "swarm-d-w0", dir.path(), &[Gated, Building], Some(Grade::Weak)),
            seeded_worker(1, "swarm-e-w1", dir.path(), &[Gated], None),
        ];

        let run_id = SwarmManager::new(&ctx.db).create_run("goal").unwrap();
        let results = vec![
            (0, Ok(Building)),
            (1, Err(anyhow::anyhow!("worker task failed"))),
        ];
        let outcome = aggregate(&ctx, run_id, "goal", &workers, results)
            .await
            .unwrap();

        assert!(outcome.winner.is_none());
        assert_eq!(outcome.merged, 0);
        assert_eq!(outcome.errored, 1);
        // Only the non-errored loser is finalized; the errored one keeps its
        // imported status for inspection.
        assert_eq!(outcome.dead_ended, 1);

        let experiments = ExperimentManager::new(&ctx.db);
        assert_eq!(experiments.load("swarm-d-w0").unwrap().status, DeadEnd);
        assert_eq!(experiments.load("swarm-e-w1").unwrap().status, Gated);

        let loser = experiments.load("swarm-d-w0").unwrap();
        let dead = DeadEndManager::new(&ctx.db)
            .list_for_experiment(loser.id)
            .unwrap();
        assert!(dead[0].why_failed.contains("without a mergeable winner"));
    }
}
