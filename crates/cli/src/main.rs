//! # Crucible CLI
//!
//! Thin command layer over `crucible_core`: one subcommand per workflow step,
//! plus the full run loop and swarm mode.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crucible_core::workflow::{self, RunMode};
use crucible_core::{swarm, CycleContext, ExperimentStatus};

#[derive(Parser)]
#[command(name = "crucible", about = "Iterative adversarial experimentation", version)]
struct Cli {
    /// Project root; defaults to the current directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify a hypothesis into a new experiment
    New {
        hypothesis: String,
        /// Slug of an experiment this one builds on
        #[arg(long)]
        depends_on: Option<String>,
    },
    /// Run the worth-doing gate for an experiment
    Gate { slug: String },
    /// Run a build attempt
    Build { slug: String },
    /// Run a challenger pass against recorded decisions
    Challenge { slug: String },
    /// Run a doubter pass
    Doubt { slug: String },
    /// Investigate open doubts
    Scout { slug: String },
    /// Verify the implementation component by component
    Verify { slug: String },
    /// Resolve a verified experiment: merge, cycle back, or dead-end
    Resolve { slug: String },
    /// Compress accumulated builder guidance
    Compress { slug: String },
    /// Advance an experiment by its next step
    Next {
        slug: String,
        /// Keep stepping until the experiment is terminal
        #[arg(long)]
        auto: bool,
    },
    /// Classify a goal and drive the experiment to completion
    Run { goal: String },
    /// Run mechanism-distinct experiments in parallel and merge the best
    Swarm {
        goal: String,
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// List experiments and their statuses
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let ctx = CycleContext::open(root)?;

    // First Ctrl-C requests a stop after the current durable write; a second
    // one falls through to the default handler.
    let shutdown = ctx.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("shutdown requested; finishing the current step");
            shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    match cli.command {
        Command::New {
            hypothesis,
            depends_on,
        } => {
            let experiment = workflow::classify_and_create(&ctx, &hypothesis).await?;
            if let Some(parent) = depends_on {
                crucible_core::state::ExperimentManager::new(&ctx.db)
                    .set_depends_on(&experiment.slug, Some(&parent))?;
            }
            println!("{}  {}", experiment.slug, experiment.status);
        }
        Command::Gate { slug } => {
            let report = workflow::gate_step(&ctx, &slug).await?;
            if report.approved {
                println!("{slug}: approved");
            } else {
                println!("{slug}: rejected: {}", report.reason);
            }
        }
        Command::Build { slug } => {
            let report = workflow::build_step(&ctx, &slug).await?;
            println!("{slug}: built ({} decisions)", report.decisions.len());
        }
        Command::Challenge { slug } => {
            let report = workflow::challenge_step(&ctx, &slug).await?;
            println!("{slug}: {} challenges", report.challenges.len());
        }
        Command::Doubt { slug } => {
            let report = workflow::doubt_step(&ctx, &slug).await?;
            println!("{slug}: {} doubts", report.doubts.len());
        }
        Command::Scout { slug } => {
            let report = workflow::scout_step(&ctx, &slug).await?;
            println!("{slug}: {} resolutions", report.doubt_resolutions.len());
        }
        Command::Verify { slug } => {
            let grade = workflow::verify_step(&ctx, &slug).await?;
            println!("{slug}: {grade}");
        }
        Command::Resolve { slug } => {
            let outcome = crucible_core::resolve::resolve_experiment(&ctx, &slug).await?;
            println!("{slug}: {} -> {:?}", outcome.grade, outcome.disposition);
        }
        Command::Compress { slug } => {
            workflow::compress_step(&ctx, &slug).await?;
            println!("{slug}: guidance compressed");
        }
        Command::Next { slug, auto } => {
            let budget = if auto { ctx.config.worker_step_budget } else { 1 };
            let status = workflow::run_experiment(&ctx, &slug, RunMode::Canonical, budget).await?;
            println!("{slug}: {status}");
        }
        Command::Run { goal } => {
            let (slug, status) = workflow::run_goal(&ctx, &goal).await?;
            println!("{slug}: {status}");
            if status != ExperimentStatus::Merged {
                std::process::exit(1);
            }
        }
        Command::Swarm { goal, parallel } => {
            let outcome = swarm::run_swarm(&ctx, &goal, parallel).await?;
            for member in &outcome.members {
                let marker = if member.winner { "*" } else { " " };
                let grade = member
                    .grade
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{marker} {}  {}  {}  ${:.2}{}",
                    member.slug,
                    member.status,
                    grade,
                    member.cost_usd,
                    member
                        .error
                        .as_deref()
                        .map(|e| format!("  error: {e}"))
                        .unwrap_or_default()
                );
            }
            match &outcome.winner {
                Some(winner) => println!("winner: {winner}"),
                None => println!("no winner"),
            }
            println!(
                "merged: {}  dead-ended: {}  errored: {}",
                outcome.merged, outcome.dead_ended, outcome.errored
            );
        }
        Command::Status { json } => {
            let experiments =
                crucible_core::state::ExperimentManager::new(&ctx.db).list_all()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&experiments)?);
            } else {
                for e in experiments {
                    println!(
                        "{:<40} {:<12} {:<16} retries={}",
                        e.slug, e.status, e.sub_type, e.retry_count
                    );
                }
            }
        }
    }
    Ok(())
}
