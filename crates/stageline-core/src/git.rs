//! Git helpers for capturing the state of the main repository.

use std::path::Path;
use std::process::Command;

use crate::error::{PipelineError, Result};

fn git_stdout(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| PipelineError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if out.is_empty() {
        return Err(PipelineError::Git(format!(
            "git {} returned empty output",
            args.join(" ")
        )));
    }
    Ok(out)
}

/// Capture the HEAD commit SHA from a git repository.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    git_stdout(repo_dir, &["rev-parse", "HEAD"])
}

/// Name of the checked-out branch. Fails on a detached HEAD.
pub fn current_branch(repo_dir: &Path) -> Result<String> {
    let branch = git_stdout(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if branch == "HEAD" {
        return Err(PipelineError::Git("HEAD is detached".to_string()));
    }
    Ok(branch)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
