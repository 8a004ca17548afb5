//! # Version Control Operations
//!
//! Branch, worktree and merge plumbing. Repository inspection and branch
//! creation go through `git2`; merges and worktrees go through the `git` CLI,
//! whose conflict handling and worktree bookkeeping are the behavior users
//! expect.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::Repository;
use tokio::process::Command;

use crate::error::CoreError;

/// Outcome of merging an experiment branch into trunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    /// Conflicting paths; the merge was aborted and trunk left untouched.
    Conflicts(Vec<String>),
}

/// True when the working tree has no uncommitted changes (untracked included).
pub fn is_clean(repo_path: &Path) -> Result<bool> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Failed to open repository at {:?}", repo_path))?;
    let mut options = git2::StatusOptions::new();
    options.include_untracked(true);
    let statuses = repo.statuses(Some(&mut options))?;
    Ok(statuses.is_empty())
}

/// Name of the trunk branch: `main` when it exists, `master` otherwise.
pub fn trunk_branch(repo_path: &Path) -> Result<String> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Failed to open repository at {:?}", repo_path))?;
    for candidate in ["main", "master"] {
        if repo.find_branch(candidate, git2::BranchType::Local).is_ok() {
            return Ok(candidate.to_string());
        }
    }
    anyhow::bail!("No trunk branch (main or master) in {:?}", repo_path)
}

/// Create a branch off current HEAD and check it out.
pub fn create_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let head = repo.head()?.peel_to_commit()?;
    repo.branch(name, &head, false)
        .with_context(|| format!("Failed to create branch '{name}'"))?;
    checkout(repo_path, name)?;
    Ok(())
}

async fn run_git(repo_path: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .await
        .with_context(|| format!("Failed to run git {:?}", args))?;
    if !output.status.success() {
        return Err(CoreError::SubprocessFailure {
            command: format!("git {}", args.join(" ")),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn checkout(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let (object, reference) = repo.revparse_ext(name)?;
    repo.checkout_tree(&object, None)
        .with_context(|| format!("Failed to checkout '{name}'"))?;
    match reference {
        Some(r) => repo.set_head(r.name().context("Unnamed reference")?)?,
        None => repo.set_head_detached(object.id())?,
    }
    Ok(())
}

/// Checkout an existing branch, creating it off HEAD when missing.
pub fn ensure_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    if repo.find_branch(name, git2::BranchType::Local).is_err() {
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(name, &head, false)
            .with_context(|| format!("Failed to create branch '{name}'"))?;
    }
    drop(repo);
    checkout(repo_path, name)
}

/// Checkout trunk.
pub fn checkout_trunk(repo_path: &Path) -> Result<String> {
    let trunk = trunk_branch(repo_path)?;
    checkout(repo_path, &trunk)?;
    Ok(trunk)
}

/// Stage everything and commit. No-op when there is nothing to commit.
pub async fn commit_all(repo_path: &Path, message: &str) -> Result<()> {
    run_git(repo_path, &["add", "-A"]).await?;
    if is_clean(repo_path)? {
        return Ok(());
    }
    run_git(repo_path, &["commit", "-m", message]).await?;
    Ok(())
}

/// Merge `branch` into trunk with a merge commit. On conflict the merge is
/// aborted and the conflicting paths are returned; trunk is left untouched.
pub async fn merge_branch(repo_path: &Path, branch: &str, message: &str) -> Result<MergeResult> {
    let trunk = checkout_trunk(repo_path)?;

    let merge = Command::new("git")
        .args(["merge", "--no-commit", "--no-ff", branch])
        .current_dir(repo_path)
        .output()
        .await
        .context("Failed to run git merge")?;

    if !merge.status.success() {
        let conflicts = run_git(repo_path, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .unwrap_or_default()
            .lines()
            .map(|l| l.to_string())
            .collect();
        run_git(repo_path, &["merge", "--abort"]).await.ok();
        tracing::warn!(branch, trunk, "merge conflicts; aborted");
        return Ok(MergeResult::Conflicts(conflicts));
    }

    run_git(repo_path, &["commit", "-m", message]).await?;
    tracing::info!(branch, trunk, "merged");
    Ok(MergeResult::Success)
}

/// Drop all uncommitted work on the current branch and return to trunk.
/// The branch itself is kept for audit.
pub async fn discard_working_changes(repo_path: &Path) -> Result<()> {
    run_git(repo_path, &["reset", "--hard", "HEAD"]).await?;
    run_git(repo_path, &["clean", "-fd"]).await?;
    checkout_trunk(repo_path)?;
    Ok(())
}

/// Create a detached worktree for `branch` at `path`.
pub async fn create_worktree(repo_path: &Path, path: &Path, branch: &str) -> Result<()> {
    let path_str = path.to_string_lossy();
    run_git(repo_path, &["worktree", "add", "-b", branch, &path_str]).await?;
    Ok(())
}

/// Remove a worktree and its branch.
pub async fn remove_worktree(repo_path: &Path, path: &Path, branch: &str) -> Result<()> {
    let path_str = path.to_string_lossy();
    run_git(repo_path, &["worktree", "remove", "--force", &path_str])
        .await
        .ok();
    run_git(repo_path, &["branch", "-D", branch]).await.ok();
    Ok(())
}

/// Remove leftover swarm worktrees and branches from a previous crashed run.
/// Identified purely by the `crucible/swarm-` naming convention.
pub async fn prune_stale_swarm_worktrees(repo_path: &Path) -> Result<usize> {
    run_git(repo_path, &["worktree", "prune"]).await.ok();

    let worktrees_root = crate::state::io::worktrees_dir(repo_path);
    let mut removed = 0;
    if worktrees_root.exists() {
        let entries: Vec<PathBuf> = std::fs::read_dir(&worktrees_root)
            .with_context(|| format!("Failed to read {:?}", worktrees_root))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        for path in entries {
            let path_str = path.to_string_lossy();
            run_git(repo_path, &["worktree", "remove", "--force", &path_str])
                .await
                .ok();
            std::fs::remove_dir_all(&path).ok();
            removed += 1;
        }
    }

    let branches = run_git(repo_path, &["branch", "--list", "crucible/swarm-*"])
        .await
        .unwrap_or_default();
    for line in branches.lines() {
        let name = line.trim().trim_start_matches("* ").trim();
        if !name.is_empty() {
            run_git(repo_path, &["branch", "-D", name]).await.ok();
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::info!(removed, "pruned stale swarm worktrees/branches");
    }
    Ok(removed)
}
