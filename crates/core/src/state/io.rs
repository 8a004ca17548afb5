//! # IO Utilities
//!
//! Runtime path layout under the `.crucible` directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Runtime directory for a project root.
pub fn runtime_dir(root: &Path) -> PathBuf {
    root.join(".crucible")
}

/// Canonical database path for a project root.
pub fn db_path(root: &Path) -> PathBuf {
    runtime_dir(root).join("crucible.db")
}

/// Directory holding isolated swarm checkouts.
pub fn worktrees_dir(root: &Path) -> PathBuf {
    runtime_dir(root).join("worktrees")
}

/// Directory preserving raw agent transcripts after failed extractions.
pub fn raw_dir(root: &Path) -> PathBuf {
    runtime_dir(root).join("raw")
}

/// Keep the runtime directory out of version control. Uses the repository's
/// local exclude file, which linked worktrees share, so experiment commits
/// never pick up the store or raw transcripts. A non-repository root is a
/// no-op.
pub fn ensure_runtime_excluded(root: &Path) -> Result<()> {
    let git_dir = root.join(".git");
    if !git_dir.is_dir() {
        return Ok(());
    }
    let info_dir = git_dir.join("info");
    let exclude = info_dir.join("exclude");
    let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == ".crucible/") {
        return Ok(());
    }
    std::fs::create_dir_all(&info_dir)
        .with_context(|| format!("Failed to create {:?}", info_dir))?;
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(".crucible/\n");
    std::fs::write(&exclude, updated)
        .with_context(|| format!("Failed to update {:?}", exclude))?;
    Ok(())
}

/// Preserve a raw transcript for manual inspection; returns the written path.
pub fn preserve_raw(root: &Path, slug: &str, role: &str, raw: &str) -> Result<PathBuf> {
    let dir = raw_dir(root);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create raw transcript directory: {:?}", dir))?;
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%f");
    let path = dir.join(format!("{slug}-{role}-{stamp}.txt"));
    std::fs::write(&path, raw)
        .with_context(|| format!("Failed to preserve raw transcript: {:?}", path))?;
    Ok(path)
}
