//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use stageline_core::{PipelineDefinition, Stage, StageKind};

pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    run_git(dir, &["init", "-b", "main"]);
    run_git(dir, &["config", "user.name", "test-user"]);
    run_git(dir, &["config", "user.email", "test@example.com"]);
}

/// Commit a file and return the new HEAD.
pub fn commit_file(dir: &Path, name: &str, content: &str) -> String {
    std::fs::write(dir.join(name), content).unwrap();
    run_git(dir, &["add", name]);
    run_git(dir, &["commit", "-m", &format!("update {name}")]);
    run_git(dir, &["rev-parse", "HEAD"])
}

/// An upstream repository standing in for the dependency. Returns its
/// directory and the first commit.
pub fn upstream_repo() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let sha = commit_file(dir.path(), "README", "dynamorio fixture\n");
    (dir, sha)
}

pub fn definition(format: &str, build: &str, test: &str) -> PipelineDefinition {
    PipelineDefinition::new(vec![
        Stage::from_kind(StageKind::Format).with_script([format]),
        Stage::from_kind(StageKind::Build).with_script([build]),
        Stage::from_kind(StageKind::Test).with_script([test]),
    ])
    .unwrap()
}
