//! Resolution: turn a verified experiment's grades and metric comparisons
//! into a disposition. Sound and good merge, weak cycles back with
//! accumulated guidance, rejected discards. A regression on any gate fixture
//! turns an otherwise-mergeable result into a cycle-back.

use anyhow::{Context, Result};

use crate::agent::{AgentRequest, AgentRole};
use crate::breaker;
use crate::context::CycleContext;
use crate::extract::{self, StructuredOutput, SummaryReport};
use crate::lifecycle::ExperimentStatus;
use crate::state::{
    DeadEndCategory, DeadEndManager, DoubtManager, Experiment, ExperimentManager,
    FragilityManager, Grade, VerificationManager,
};
use crate::tools::{git, metrics};

use super::grade::worst_grade;
use super::guidance;

/// What resolution did with the experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Branch merged into trunk, experiment MERGED.
    Merged { fragility_noted: usize },
    /// Merge hit conflicts; experiment held at RESOLVED for manual action.
    MergeConflict { paths: Vec<String> },
    /// Cycled back to BUILDING (or COMPRESSED first) with fresh guidance.
    CycledBack {
        gate_regression: bool,
        compressed: bool,
        retry_count: u32,
    },
    /// Changes discarded, experiment DEAD_END.
    Discarded,
    /// Worker store outcome: sound/good held at RESOLVED for the coordinator.
    HeldForCoordinator,
}

#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub grade: Grade,
    pub disposition: Disposition,
}

/// Resolve with full version-control effects against the canonical store.
pub async fn resolve_experiment(ctx: &CycleContext, slug: &str) -> Result<ResolutionOutcome> {
    let experiments = ExperimentManager::new(&ctx.db);
    let experiment = enter_resolved(&experiments, slug)?;

    let grade = overall_grade(ctx, &experiment)?;
    let gate_regressions = gate_regression_names(ctx, &experiment)?;

    // A gate regression only downgrades a grade that would otherwise merge.
    // Weak cycles back anyway (the regressions feed its guidance) and
    // rejected dead-ends no matter what the gates say.
    let disposition = match grade {
        Grade::Sound | Grade::Good if !gate_regressions.is_empty() => {
            tracing::warn!(
                slug,
                fixtures = ?gate_regressions,
                "gate fixture regression forces cycle-back"
            );
            cycle_back(ctx, &experiment, grade, &gate_regressions).await?
        }
        Grade::Sound | Grade::Good => merge(ctx, &experiment, grade).await?,
        Grade::Weak => cycle_back(ctx, &experiment, grade, &gate_regressions).await?,
        Grade::Rejected => discard(ctx, &experiment).await?,
    };
    Ok(ResolutionOutcome { grade, disposition })
}

/// Resolution for swarm worker stores: no version-control effects. Sound and
/// good outcomes stay at RESOLVED so the coordinator can pick a winner and
/// merge centrally; weak and rejected behave as in the full path minus git.
pub async fn resolve_db_only(ctx: &CycleContext, slug: &str) -> Result<ResolutionOutcome> {
    let experiments = ExperimentManager::new(&ctx.db);
    let experiment = enter_resolved(&experiments, slug)?;

    let grade = overall_grade(ctx, &experiment)?;
    let gate_regressions = gate_regression_names(ctx, &experiment)?;

    let disposition = match grade {
        Grade::Sound | Grade::Good if !gate_regressions.is_empty() => {
            tracing::warn!(
                slug,
                fixtures = ?gate_regressions,
                "gate fixture regression forces cycle-back"
            );
            cycle_back_db(ctx, &experiment, grade, &gate_regressions).await?
        }
        Grade::Sound | Grade::Good => Disposition::HeldForCoordinator,
        Grade::Weak => cycle_back_db(ctx, &experiment, grade, &gate_regressions).await?,
        Grade::Rejected => {
            record_rejection_dead_end(ctx, &experiment)?;
            experiments.set_status(&experiment.slug, ExperimentStatus::DeadEnd)?;
            breaker::record_failure(&ctx.db, &experiment.sub_type, ctx.config.breaker_threshold)?;
            Disposition::Discarded
        }
    };
    Ok(ResolutionOutcome { grade, disposition })
}

fn enter_resolved(experiments: &ExperimentManager, slug: &str) -> Result<Experiment> {
    let experiment = experiments.load(slug)?;
    if experiment.status == ExperimentStatus::Verified {
        experiments.set_status(slug, ExperimentStatus::Resolved)?;
        return experiments.load(slug);
    }
    if experiment.status == ExperimentStatus::Resolved {
        return Ok(experiment);
    }
    anyhow::bail!(
        "Experiment '{slug}' is {}; resolution requires VERIFIED or RESOLVED",
        experiment.status
    )
}

fn overall_grade(ctx: &CycleContext, experiment: &Experiment) -> Result<Grade> {
    let grades: Vec<Grade> = VerificationManager::new(&ctx.db)
        .list_for_experiment(experiment.id)?
        .iter()
        .map(|v| v.grade)
        .collect();
    worst_grade(&grades)
}

fn gate_regression_names(ctx: &CycleContext, experiment: &Experiment) -> Result<Vec<String>> {
    let comparisons = metrics::comparisons(&ctx.db, &ctx.config, experiment.id)?;
    Ok(metrics::gate_regressions(&comparisons)
        .iter()
        .map(|c| format!("{}/{}: {} -> {}", c.fixture, c.metric, c.before, c.after))
        .collect())
}

async fn merge(
    ctx: &CycleContext,
    experiment: &Experiment,
    grade: Grade,
) -> Result<Disposition> {
    let message = format!(
        "Merge experiment {}: {}",
        experiment.slug, experiment.hypothesis
    );
    let result = git::merge_branch(&ctx.project_root, &experiment.branch, &message).await?;

    if let git::MergeResult::Conflicts(paths) = result {
        return Ok(Disposition::MergeConflict { paths });
    }

    // Good-grade merges carry their concerns forward in the fragility record.
    let mut fragility_noted = 0;
    if grade == Grade::Good {
        let fragility = FragilityManager::new(&ctx.db);
        for v in VerificationManager::new(&ctx.db).list_for_experiment(experiment.id)? {
            if v.grade == Grade::Good {
                fragility.append(experiment.id, &v.component, &v.notes)?;
                fragility_noted += 1;
            }
        }
    }

    ExperimentManager::new(&ctx.db).set_status(&experiment.slug, ExperimentStatus::Merged)?;
    tracing::info!(slug = %experiment.slug, %grade, "experiment merged");
    Ok(Disposition::Merged { fragility_noted })
}

async fn cycle_back(
    ctx: &CycleContext,
    experiment: &Experiment,
    grade: Grade,
    gate_regressions: &[String],
) -> Result<Disposition> {
    breaker::enforce(&ctx.db, experiment, ctx.config.breaker_threshold)?;
    cycle_back_db(ctx, experiment, grade, gate_regressions).await
}

async fn cycle_back_db(
    ctx: &CycleContext,
    experiment: &Experiment,
    grade: Grade,
    gate_regressions: &[String],
) -> Result<Disposition> {
    let summary = synthesize_guidance(ctx, experiment, gate_regressions).await;

    // Dead approaches named by the summarizer become structural constraints.
    let dead_ends = DeadEndManager::new(&ctx.db);
    for approach in &summary.dead_approaches {
        dead_ends.record(
            experiment.id,
            approach,
            "identified as dead during weak-cycle synthesis",
            approach,
            &experiment.sub_type,
            DeadEndCategory::Structural,
        )?;
    }

    // A rejected component inside a cycled-back result is its own narrower
    // constraint, even though the experiment as a whole lives on.
    for v in VerificationManager::new(&ctx.db).list_for_experiment(experiment.id)? {
        if v.grade == Grade::Rejected {
            dead_ends.record(
                experiment.id,
                &format!("{}: {}", experiment.hypothesis, v.component),
                &v.notes,
                &v.notes,
                &experiment.sub_type,
                DeadEndCategory::Structural,
            )?;
        }
    }

    let experiments = ExperimentManager::new(&ctx.db);
    let iteration = experiment.guidance_iteration + 1;
    let accumulated = guidance::append_iteration(
        &experiment.builder_guidance,
        iteration,
        &summary.guidance,
        ctx.config.guidance_budget,
    );
    experiments.set_guidance(&experiment.slug, &accumulated, iteration)?;
    let retry_count = experiments.increment_retry(&experiment.slug)?;

    breaker::record_failure(&ctx.db, &experiment.sub_type, ctx.config.breaker_threshold)?;

    let compressed = ctx.config.compression_interval > 0
        && retry_count % ctx.config.compression_interval == 0;
    let target = if compressed {
        ExperimentStatus::Compressed
    } else {
        ExperimentStatus::Building
    };
    experiments.set_status(&experiment.slug, target)?;

    tracing::info!(
        slug = %experiment.slug,
        %grade,
        retry_count,
        compressed,
        "experiment cycled back"
    );
    Ok(Disposition::CycledBack {
        gate_regression: !gate_regressions.is_empty(),
        compressed,
        retry_count,
    })
}

/// Ask the summarizer to turn the cycle's evidence into builder guidance.
/// A failed synthesis degrades to a mechanical digest rather than blocking
/// the cycle-back.
async fn synthesize_guidance(
    ctx: &CycleContext,
    experiment: &Experiment,
    gate_regressions: &[String],
) -> SummaryReport {
    let digest = match evidence_digest(ctx, experiment, gate_regressions) {
        Ok(digest) => digest,
        Err(e) => {
            tracing::warn!(slug = %experiment.slug, error = %e, "evidence digest failed");
            return SummaryReport::default();
        }
    };

    let prompt = format!(
        "An experiment iteration graded weak. Synthesize concise guidance for \
         the next build attempt and list any approaches that are now known \
         dead. End with a single fenced ```json block: \
         {{\"guidance\": \"...\", \"dead_approaches\": [\"...\"]}}\n\n\
         Hypothesis: {}\n\nEvidence:\n{digest}",
        experiment.hypothesis
    );
    let request = AgentRequest::new(
        AgentRole::Summarizer,
        prompt,
        ctx.config.model_for(AgentRole::Summarizer),
    )
    .in_dir(&ctx.project_root)
    .with_timeout(ctx.config.subprocess_timeout());

    let synthesized = match ctx.invoker.invoke(&request).await {
        Ok(reply) => {
            match extract::extract(ctx, &experiment.slug, AgentRole::Summarizer, &reply.text).await
            {
                Ok((StructuredOutput::Summary(report), _)) => Some(report),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(slug = %experiment.slug, error = %e, "guidance extraction failed");
                    None
                }
            }
        }
        Err(e) => {
            tracing::warn!(slug = %experiment.slug, error = %e, "guidance synthesis failed");
            None
        }
    };

    synthesized.unwrap_or(SummaryReport {
        guidance: digest,
        dead_approaches: Vec::new(),
    })
}

/// Mechanical digest of the cycle's negative evidence: confirmed doubts,
/// weak/rejected verification notes, gate regressions.
fn evidence_digest(
    ctx: &CycleContext,
    experiment: &Experiment,
    gate_regressions: &[String],
) -> Result<String> {
    let mut lines = Vec::new();

    for fixture in gate_regressions {
        lines.push(format!("- gate fixture regressed: {fixture}"));
    }
    for doubt in DoubtManager::new(&ctx.db).confirmed_for_experiment(experiment.id)? {
        lines.push(format!("- confirmed doubt: {}", doubt.claim));
    }
    for v in VerificationManager::new(&ctx.db).list_for_experiment(experiment.id)? {
        if v.grade.severity() >= Grade::Weak.severity() && !v.notes.trim().is_empty() {
            lines.push(format!("- {} graded {}: {}", v.component, v.grade, v.notes));
        }
    }
    if lines.is_empty() {
        lines.push("- iteration graded weak with no specific findings recorded".to_string());
    }
    Ok(lines.join("\n"))
}

async fn discard(ctx: &CycleContext, experiment: &Experiment) -> Result<Disposition> {
    git::discard_working_changes(&ctx.project_root)
        .await
        .context("Failed to discard rejected experiment changes")?;
    record_rejection_dead_end(ctx, experiment)?;
    ExperimentManager::new(&ctx.db).set_status(&experiment.slug, ExperimentStatus::DeadEnd)?;
    breaker::record_failure(&ctx.db, &experiment.sub_type, ctx.config.breaker_threshold)?;
    tracing::warn!(slug = %experiment.slug, "experiment rejected and discarded");
    Ok(Disposition::Discarded)
}

/// Each rejected component becomes its own, narrower structural constraint.
fn record_rejection_dead_end(ctx: &CycleContext, experiment: &Experiment) -> Result<()> {
    let dead_ends = DeadEndManager::new(&ctx.db);
    let rejected: Vec<_> = VerificationManager::new(&ctx.db)
        .list_for_experiment(experiment.id)?
        .into_iter()
        .filter(|v| v.grade == Grade::Rejected)
        .collect();

    if rejected.is_empty() {
        dead_ends.record(
            experiment.id,
            &experiment.hypothesis,
            "verification rejected the experiment",
            "",
            &experiment.sub_type,
            DeadEndCategory::Structural,
        )?;
        return Ok(());
    }
    for v in rejected {
        dead_ends.record(
            experiment.id,
            &format!("{}: {}", experiment.hypothesis, v.component),
            &v.notes,
            &v.notes,
            &experiment.sub_type,
            DeadEndCategory::Structural,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInvoker, AgentReply};
    use crate::config::CycleConfig;
    use crate::state::{ExperimentDb, MetricManager, MetricPhase};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct CannedInvoker(String);

    #[async_trait]
    impl AgentInvoker for CannedInvoker {
        async fn invoke(&self, _request: &AgentRequest) -> Result<AgentReply> {
            Ok(AgentReply {
                text: self.0.clone(),
                cost_usd: None,
            })
        }
    }

    fn ctx_with(config: CycleConfig, reply: &str) -> (tempfile::TempDir, CycleContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CycleContext::new(
            Arc::new(config),
            Arc::new(ExperimentDb::open_memory().unwrap()),
            dir.path().to_path_buf(),
            Arc::new(CannedInvoker(reply.to_string())),
        );
        (dir, ctx)
    }

    fn seed_verified(ctx: &CycleContext, slug: &str, grades: &[(&str, Grade, &str)]) -> Experiment {
        let experiments = ExperimentManager::new(&ctx.db);
        let exp = experiments.create(slug, "hypothesis", "caching").unwrap();
        for status in [
            ExperimentStatus::Gated,
            ExperimentStatus::Building,
            ExperimentStatus::Built,
            ExperimentStatus::Verifying,
            ExperimentStatus::Verified,
        ] {
            experiments.set_status(slug, status).unwrap();
        }
        let verifications = VerificationManager::new(&ctx.db);
        for (component, grade, notes) in grades {
            verifications
                .record(exp.id, component, *grade, Some(true), Some(true), notes)
                .unwrap();
        }
        experiments.load(slug).unwrap()
    }

    const SUMMARY_REPLY: &str = "```json\n{\"guidance\": \"focus on invalidation\", \"dead_approaches\": [\"global lock\"]}\n```";

    #[tokio::test]
    async fn test_weak_cycles_back_with_guidance() {
        let (_dir, ctx) = ctx_with(CycleConfig::default(), SUMMARY_REPLY);
        seed_verified(&ctx, "w", &[("cache", Grade::Weak, "misses unexplained")]);

        let outcome = resolve_db_only(&ctx, "w").await.unwrap();
        assert_eq!(outcome.grade, Grade::Weak);
        assert!(matches!(
            outcome.disposition,
            Disposition::CycledBack {
                compressed: false,
                retry_count: 1,
                ..
            }
        ));

        let exp = ExperimentManager::new(&ctx.db).load("w").unwrap();
        assert_eq!(exp.status, ExperimentStatus::Building);
        assert_eq!(exp.guidance_iteration, 1);
        assert!(exp.builder_guidance.contains("## Iteration 1 (latest)"));
        assert!(exp.builder_guidance.contains("focus on invalidation"));

        // Summarizer's dead approach recorded as a structural constraint.
        let dead = DeadEndManager::new(&ctx.db)
            .structural_constraints("caching")
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].approach, "global lock");

        // Tally counted toward the breaker.
        assert_eq!(
            breaker::check(&ctx.db, "caching", 3).unwrap().tally,
            1
        );
    }

    #[tokio::test]
    async fn test_compression_routing_on_interval() {
        let mut config = CycleConfig::default();
        config.compression_interval = 2;
        config.breaker_threshold = 100;
        let (_dir, ctx) = ctx_with(config, SUMMARY_REPLY);
        seed_verified(&ctx, "c", &[("x", Grade::Weak, "")]);

        // retry 1: straight back to building.
        let outcome = resolve_db_only(&ctx, "c").await.unwrap();
        assert!(matches!(
            outcome.disposition,
            Disposition::CycledBack {
                compressed: false,
                ..
            }
        ));

        // Walk back to VERIFIED and resolve again; retry 2 hits the interval.
        let experiments = ExperimentManager::new(&ctx.db);
        for status in [
            ExperimentStatus::Built,
            ExperimentStatus::Verifying,
            ExperimentStatus::Verified,
        ] {
            experiments.set_status("c", status).unwrap();
        }
        let outcome = resolve_db_only(&ctx, "c").await.unwrap();
        assert!(matches!(
            outcome.disposition,
            Disposition::CycledBack {
                compressed: true,
                retry_count: 2,
                ..
            }
        ));
        assert_eq!(
            experiments.load("c").unwrap().status,
            ExperimentStatus::Compressed
        );
    }

    #[tokio::test]
    async fn test_rejected_dead_ends_db_only() {
        let (_dir, ctx) = ctx_with(CycleConfig::default(), SUMMARY_REPLY);
        seed_verified(
            &ctx,
            "r",
            &[
                ("parser", Grade::Sound, ""),
                ("cache", Grade::Rejected, "corrupts entries under load"),
            ],
        );

        let outcome = resolve_db_only(&ctx, "r").await.unwrap();
        assert_eq!(outcome.grade, Grade::Rejected);
        assert_eq!(outcome.disposition, Disposition::Discarded);

        let exp = ExperimentManager::new(&ctx.db).load("r").unwrap();
        assert_eq!(exp.status, ExperimentStatus::DeadEnd);

        // One narrow constraint per rejected component, not a blanket one.
        let dead = DeadEndManager::new(&ctx.db).list_for_experiment(exp.id).unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].approach.contains("cache"));
        assert!(dead[0].why_failed.contains("corrupts"));
    }

    #[tokio::test]
    async fn test_sound_held_for_coordinator_in_db_only_mode() {
        let (_dir, ctx) = ctx_with(CycleConfig::default(), SUMMARY_REPLY);
        seed_verified(&ctx, "s", &[("all", Grade::Sound, "")]);

        let outcome = resolve_db_only(&ctx, "s").await.unwrap();
        assert_eq!(outcome.grade, Grade::Sound);
        assert_eq!(outcome.disposition, Disposition::HeldForCoordinator);
        assert_eq!(
            ExperimentManager::new(&ctx.db).load("s").unwrap().status,
            ExperimentStatus::Resolved
        );
    }

    #[tokio::test]
    async fn test_gate_regression_overrides_sound_grade() {
        let mut config = CycleConfig::default();
        config.gate_fixtures = vec!["gate_suite".to_string()];
        let (_dir, ctx) = ctx_with(config, SUMMARY_REPLY);
        let exp = seed_verified(&ctx, "g", &[("all", Grade::Sound, "")]);

        let samples = MetricManager::new(&ctx.db);
        samples
            .record(exp.id, MetricPhase::Before, "gate_suite", "accuracy", 0.9)
            .unwrap();
        samples
            .record(exp.id, MetricPhase::After, "gate_suite", "accuracy", 0.5)
            .unwrap();

        let outcome = resolve_db_only(&ctx, "g").await.unwrap();
        // Grade stays sound but the disposition is a forced cycle-back.
        assert_eq!(outcome.grade, Grade::Sound);
        assert!(matches!(
            outcome.disposition,
            Disposition::CycledBack {
                gate_regression: true,
                ..
            }
        ));
        assert_eq!(
            ExperimentManager::new(&ctx.db).load("g").unwrap().status,
            ExperimentStatus::Building
        );
    }

    #[tokio::test]
    async fn test_gate_regression_does_not_rescue_rejected() {
        let mut config = CycleConfig::default();
        config.gate_fixtures = vec!["gate_suite".to_string()];
        let (_dir, ctx) = ctx_with(config, SUMMARY_REPLY);
        let exp = seed_verified(&ctx, "rg", &[("cache", Grade::Rejected, "corrupts entries")]);

        let samples = MetricManager::new(&ctx.db);
        samples
            .record(exp.id, MetricPhase::Before, "gate_suite", "accuracy", 0.9)
            .unwrap();
        samples
            .record(exp.id, MetricPhase::After, "gate_suite", "accuracy", 0.5)
            .unwrap();

        let outcome = resolve_db_only(&ctx, "rg").await.unwrap();
        assert_eq!(outcome.grade, Grade::Rejected);
        assert_eq!(outcome.disposition, Disposition::Discarded);
        assert_eq!(
            ExperimentManager::new(&ctx.db).load("rg").unwrap().status,
            ExperimentStatus::DeadEnd
        );
    }

    #[tokio::test]
    async fn test_breaker_trip_closes_experiment() {
        let mut config = CycleConfig::default();
        config.breaker_threshold = 1;
        let (_dir, ctx) = ctx_with(config, SUMMARY_REPLY);
        seed_verified(&ctx, "b1", &[("x", Grade::Weak, "")]);
        // One prior failure trips a threshold of 1.
        breaker::record_failure(&ctx.db, "caching", 1).unwrap();

        let err = resolve_experiment(&ctx, "b1").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::CoreError>(),
            Some(crate::error::CoreError::BreakerTripped { .. })
        ));
        assert_eq!(
            ExperimentManager::new(&ctx.db).load("b1").unwrap().status,
            ExperimentStatus::DeadEnd
        );
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

    #[tokio::test]
    async fn test_good_grade_merges_and_notes_fragility() {
        let (dir, ctx) = ctx_with(CycleConfig::default(), SUMMARY_REPLY);
        init_repo(dir.path()).await;

        let exp = seed_verified(
            &ctx,
            "m",
            &[
                ("parser", Grade::Sound, ""),
                ("cache", Grade::Good, "eviction is timing sensitive"),
            ],
        );
        git::ensure_branch(dir.path(), &exp.branch).unwrap();
        std::fs::write(dir.path().join("feature.txt"), "work\n").unwrap();
        git::commit_all(dir.path(), "experiment work").await.unwrap();

        let outcome = resolve_experiment(&ctx, "m").await.unwrap();
        assert_eq!(outcome.grade, Grade::Good);
        assert_eq!(outcome.disposition, Disposition::Merged { fragility_noted: 1 });

        // Branch landed on trunk; the good component left a fragility note.
        assert!(dir.path().join("feature.txt").exists());
        assert_eq!(git::trunk_branch(dir.path()).unwrap(), "main");
        assert_eq!(
            ExperimentManager::new(&ctx.db).load("m").unwrap().status,
            ExperimentStatus::Merged
        );
        assert_eq!(
            FragilityManager::new(&ctx.db)
                .count_for_experiment(exp.id)
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_rejected_discards_changes_but_keeps_branch() {
        let (dir, ctx) = ctx_with(CycleConfig::default(), SUMMARY_REPLY);
        init_repo(dir.path()).await;

        let exp = seed_verified(&ctx, "x", &[("cache", Grade::Rejected, "corrupts entries")]);
        git::ensure_branch(dir.path(), &exp.branch).unwrap();
        std::fs::write(dir.path().join("junk.txt"), "junk").unwrap();

        let outcome = resolve_experiment(&ctx, "x").await.unwrap();
        assert_eq!(outcome.disposition, Disposition::Discarded);
        assert!(!dir.path().join("junk.txt").exists());
        assert!(git::is_clean(dir.path()).unwrap());
        assert_eq!(
            ExperimentManager::new(&ctx.db).load("x").unwrap().status,
            ExperimentStatus::DeadEnd
        );
    }

    #[tokio::test]
    async fn test_summarizer_failure_degrades_to_digest() {
        // Invoker replies with garbage; guidance falls back to the digest.
        let (_dir, ctx) = ctx_with(CycleConfig::default(), "no structure at all");
        seed_verified(&ctx, "d", &[("cache", Grade::Weak, "eviction untested")]);

        let outcome = resolve_db_only(&ctx, "d").await.unwrap();
        assert!(matches!(outcome.disposition, Disposition::CycledBack { .. }));
        let exp = ExperimentManager::new(&ctx.db).load("d").unwrap();
        assert!(exp.builder_guidance.contains("eviction untested"));
    }
}
