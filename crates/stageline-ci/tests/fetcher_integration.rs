//! Integration tests for the dependency fetcher against local repositories.

mod common;

use std::collections::BTreeMap;
use std::path::Path;

use common::{commit_file, init_repo, run_git, upstream_repo};
use stageline_ci::DependencyFetcher;
use stageline_core::{
    DependencyBuild, StageFailure, StageOutcome, SubmoduleConfig, SubmoduleRef,
    SubmoduleStrategy,
};
use tokio_util::sync::CancellationToken;

fn reference(url: &Path, revision: &str) -> SubmoduleRef {
    SubmoduleRef {
        path: "dynamorio".into(),
        url: url.display().to_string(),
        revision: revision.to_string(),
    }
}

fn fetcher(workdir: &Path) -> DependencyFetcher {
    DependencyFetcher::new(workdir, BTreeMap::new())
}

/// Lets git clone nested submodules from local paths.
fn file_transport_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("GIT_CONFIG_COUNT".to_string(), "1".to_string()),
        ("GIT_CONFIG_KEY_0".to_string(), "protocol.file.allow".to_string()),
        ("GIT_CONFIG_VALUE_0".to_string(), "always".to_string()),
    ])
}

/// An upstream that itself pins a submodule at `ext/inner`. Returns both
/// repositories, the nested commit and the upstream commit.
fn upstream_with_nested() -> (tempfile::TempDir, tempfile::TempDir, String, String) {
    let inner = tempfile::tempdir().unwrap();
    init_repo(inner.path());
    let inner_sha = commit_file(inner.path(), "inner.txt", "nested\n");

    let (upstream, _) = upstream_repo();
    let inner_url = inner.path().display().to_string();
    run_git(
        upstream.path(),
        &["-c", "protocol.file.allow=always", "submodule", "add", &inner_url, "ext/inner"],
    );
    run_git(upstream.path(), &["commit", "-m", "add nested dependency"]);
    let sha = run_git(upstream.path(), &["rev-parse", "HEAD"]);
    (inner, upstream, inner_sha, sha)
}

fn failure_reason(failure: &Option<StageFailure>) -> &str {
    match failure {
        Some(StageFailure::FetchError { reason }) => reason,
        other => panic!("expected FetchError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_clone_checks_out_pinned_commit() {
    let (upstream, first) = upstream_repo();
    commit_file(upstream.path(), "README", "newer\n");
    let workdir = tempfile::tempdir().unwrap();

    let result = fetcher(workdir.path())
        .fetch(
            &reference(upstream.path(), &first),
            SubmoduleStrategy::Normal,
            None,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.outcome, StageOutcome::Passed, "{}", result.output);
    assert_eq!(result.revision.as_deref(), Some(first.as_str()));
    let dest = workdir.path().join("dynamorio");
    assert_eq!(run_git(&dest, &["rev-parse", "HEAD"]), first);
    assert_eq!(
        std::fs::read_to_string(dest.join("README")).unwrap(),
        "dynamorio fixture\n"
    );
    assert!(result.commands.iter().any(|c| c.command.starts_with("git clone")));
}

#[tokio::test]
async fn test_tag_revision_resolves() {
    let (upstream, first) = upstream_repo();
    run_git(upstream.path(), &["tag", "release_7.0.0"]);
    commit_file(upstream.path(), "README", "after release\n");
    let workdir = tempfile::tempdir().unwrap();

    let result = fetcher(workdir.path())
        .fetch(
            &reference(upstream.path(), "release_7.0.0"),
            SubmoduleStrategy::Normal,
            None,
            &CancellationToken::new(),
        )
        .await;

    assert!(result.passed(), "{}", result.output);
    assert_eq!(result.revision.as_deref(), Some(first.as_str()));
}

#[tokio::test]
async fn test_existing_checkout_is_fetched_not_recloned() {
    let (upstream, _) = upstream_repo();
    let workdir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let first = fetcher(workdir.path())
        .fetch(&reference(upstream.path(), "main"), SubmoduleStrategy::Normal, None, &cancel)
        .await;
    assert!(first.passed(), "{}", first.output);

    let newer = commit_file(upstream.path(), "README", "moved on\n");
    let second = fetcher(workdir.path())
        .fetch(&reference(upstream.path(), "main"), SubmoduleStrategy::Normal, None, &cancel)
        .await;

    assert!(second.passed(), "{}", second.output);
    assert_eq!(second.revision.as_deref(), Some(newer.as_str()));
    assert!(second.commands.iter().any(|c| c.command.starts_with("git fetch")));
    assert!(!second.commands.iter().any(|c| c.command.starts_with("git clone")));
}

#[tokio::test]
async fn test_recursive_strategy_checks_out_nested_submodules() {
    let (_inner, upstream, inner_sha, sha) = upstream_with_nested();
    let cancel = CancellationToken::new();

    let normal_dir = tempfile::tempdir().unwrap();
    let normal = DependencyFetcher::new(normal_dir.path(), file_transport_env())
        .fetch(&reference(upstream.path(), &sha), SubmoduleStrategy::Normal, None, &cancel)
        .await;
    assert!(normal.passed(), "{}", normal.output);
    assert!(!normal_dir.path().join("dynamorio/ext/inner/inner.txt").exists());

    let recursive_dir = tempfile::tempdir().unwrap();
    let recursive = DependencyFetcher::new(recursive_dir.path(), file_transport_env())
        .fetch(
            &reference(upstream.path(), &sha),
            SubmoduleStrategy::Recursive,
            None,
            &cancel,
        )
        .await;
    assert!(recursive.passed(), "{}", recursive.output);
    assert_eq!(recursive.revision.as_deref(), Some(sha.as_str()));

    let nested = recursive_dir.path().join("dynamorio/ext/inner");
    assert_eq!(
        std::fs::read_to_string(nested.join("inner.txt")).unwrap(),
        "nested\n"
    );
    assert_eq!(run_git(&nested, &["rev-parse", "HEAD"]), inner_sha);
    assert!(recursive
        .commands
        .iter()
        .any(|c| c.command.starts_with("git submodule update")));
}

#[tokio::test]
async fn test_missing_revision_fails() {
    let (upstream, _) = upstream_repo();
    let workdir = tempfile::tempdir().unwrap();

    let result = fetcher(workdir.path())
        .fetch(
            &reference(upstream.path(), "no-such-branch"),
            SubmoduleStrategy::Normal,
            None,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.outcome, StageOutcome::Failed);
    assert!(failure_reason(&result.failure).contains("no-such-branch"));
}

#[tokio::test]
async fn test_unreachable_url_fails() {
    let workdir = tempfile::tempdir().unwrap();
    let missing = workdir.path().join("missing.git");

    let result = fetcher(workdir.path())
        .fetch(
            &reference(&missing, "main"),
            SubmoduleStrategy::Normal,
            None,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.outcome, StageOutcome::Failed);
    assert!(failure_reason(&result.failure).contains("unreachable"));
    assert!(result.revision.is_none());
}

#[tokio::test]
async fn test_strategy_none_requires_directory() {
    let workdir = tempfile::tempdir().unwrap();
    let config = SubmoduleConfig::default();
    let cancel = CancellationToken::new();

    let missing = fetcher(workdir.path())
        .run(&config, SubmoduleStrategy::None, &cancel)
        .await;
    assert_eq!(missing.outcome, StageOutcome::Failed);
    assert!(failure_reason(&missing.failure).contains("strategy is none"));

    std::fs::create_dir_all(workdir.path().join("dynamorio")).unwrap();
    let present = fetcher(workdir.path())
        .run(&config, SubmoduleStrategy::None, &cancel)
        .await;
    assert!(present.passed());
    assert!(present.commands.is_empty());
}

#[tokio::test]
async fn test_resolve_from_gitmodules_and_gitlink() {
    let (upstream, sha) = upstream_repo();
    let parent = tempfile::tempdir().unwrap();
    init_repo(parent.path());
    let url = upstream.path().display().to_string();
    run_git(
        parent.path(),
        &["-c", "protocol.file.allow=always", "submodule", "add", &url, "dynamorio"],
    );
    run_git(parent.path(), &["commit", "-m", "add dynamorio"]);

    let resolved = fetcher(parent.path())
        .resolve(&SubmoduleConfig::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resolved.url, url);
    assert_eq!(resolved.revision, sha);

    let result = fetcher(parent.path())
        .run(
            &SubmoduleConfig::default(),
            SubmoduleStrategy::Normal,
            &CancellationToken::new(),
        )
        .await;
    assert!(result.passed(), "{}", result.output);
    assert_eq!(result.revision.as_deref(), Some(sha.as_str()));
}

#[tokio::test]
async fn test_unpinned_submodule_fails() {
    let parent = tempfile::tempdir().unwrap();
    init_repo(parent.path());
    commit_file(parent.path(), "Cargo.toml", "[package]\n");

    let config = SubmoduleConfig {
        url: Some("https://example.invalid/dynamorio.git".to_string()),
        ..SubmoduleConfig::default()
    };
    let result = fetcher(parent.path())
        .run(&config, SubmoduleStrategy::Normal, &CancellationToken::new())
        .await;
    assert_eq!(result.outcome, StageOutcome::Failed);
    assert!(failure_reason(&result.failure).contains("no revision"));
}

#[tokio::test]
async fn test_dependency_build_expands_jobs() {
    let (upstream, sha) = upstream_repo();
    let workdir = tempfile::tempdir().unwrap();
    let build = DependencyBuild {
        build_dir: "build".into(),
        commands: vec!["echo \"jobs={jobs}\" > jobs.txt".to_string()],
    };

    let result = fetcher(workdir.path())
        .fetch(
            &reference(upstream.path(), &sha),
            SubmoduleStrategy::Normal,
            Some(&build),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.passed(), "{}", result.output);
    let jobs = std::fs::read_to_string(workdir.path().join("dynamorio/build/jobs.txt")).unwrap();
    assert!(!jobs.contains("{jobs}"));
    let count: usize = jobs.trim().trim_start_matches("jobs=").parse().unwrap();
    assert!(count >= 1);
}

#[tokio::test]
async fn test_dependency_build_failure() {
    let (upstream, sha) = upstream_repo();
    let workdir = tempfile::tempdir().unwrap();
    let build = DependencyBuild {
        build_dir: "build".into(),
        commands: vec!["echo 'CMake Error' >&2; exit 1".to_string()],
    };

    let result = fetcher(workdir.path())
        .fetch(
            &reference(upstream.path(), &sha),
            SubmoduleStrategy::Normal,
            Some(&build),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.outcome, StageOutcome::Failed);
    assert!(failure_reason(&result.failure).contains("CMake Error"));
}

#[tokio::test]
async fn test_cancelled_fetch() {
    let (upstream, sha) = upstream_repo();
    let workdir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = fetcher(workdir.path())
        .fetch(&reference(upstream.path(), &sha), SubmoduleStrategy::Normal, None, &cancel)
        .await;

    assert_eq!(result.outcome, StageOutcome::Cancelled);
    assert!(result.failure.is_none());
}
