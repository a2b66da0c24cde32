//! Dependency fetcher: brings the pinned submodule into the workdir.
//!
//! With the `normal` strategy the checkout is cloned (or fetched, when a
//! repository is already present, e.g. restored from cache), the pinned
//! revision is checked out detached, and `HEAD` is verified against it.
//! `recursive` also initializes nested submodules. `none` only checks that
//! the directory exists.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use stageline_core::{
    CommandRecord, DependencyBuild, DependencyResult, StageFailure, StageOutcome, SubmoduleConfig,
    SubmoduleRef, SubmoduleStrategy,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::runner::{run_program, run_shell, CommandContext, CommandOutput, Termination};

/// Placeholder in dependency build commands replaced by the job count.
pub const JOBS_PLACEHOLDER: &str = "{jobs}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("git failed: {0}")]
    Git(String),

    #[error("repository {url} is unreachable: {detail}")]
    Unreachable { url: String, detail: String },

    #[error("revision {revision} not found in {url}: {detail}")]
    RevisionMissing {
        url: String,
        revision: String,
        detail: String,
    },

    #[error("checked out {actual}, expected {expected}")]
    RevisionMismatch { expected: String, actual: String },

    #[error("{0} does not exist and the submodule strategy is none")]
    Missing(String),

    #[error("no url configured for {0} and none found in .gitmodules")]
    NoUrl(String),

    #[error("no revision configured for {0} and no commit pinned in HEAD")]
    Unpinned(String),

    #[error("dependency build failed at `{command}`: {detail}")]
    DependencyBuild { command: String, detail: String },

    #[error("fetch cancelled")]
    Cancelled,
}

/// Commands and output accumulated while fetching.
#[derive(Default)]
struct FetchLog {
    commands: Vec<CommandRecord>,
    output: String,
}

impl FetchLog {
    fn push(&mut self, out: &CommandOutput) {
        self.commands.push(out.record());
        self.output.push_str(&format!("$ {}\n", out.command));
        self.output.push_str(&out.stdout);
        self.output.push_str(&out.stderr);
    }
}

/// Detail for a failed command: trimmed stderr, else how it ended.
fn failure_detail(out: &CommandOutput) -> String {
    let stderr = out.stderr.trim();
    if stderr.is_empty() {
        out.termination.describe()
    } else {
        stderr.lines().last().unwrap_or(stderr).to_string()
    }
}

pub struct DependencyFetcher {
    workdir: PathBuf,
    env: BTreeMap<String, String>,
}

impl DependencyFetcher {
    pub fn new(workdir: impl Into<PathBuf>, env: BTreeMap<String, String>) -> Self {
        let mut env = env;
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        Self {
            workdir: workdir.into(),
            env,
        }
    }

    fn context(&self, dir: &Path) -> CommandContext {
        CommandContext::new(dir, self.env.clone()).labelled("fetch")
    }

    async fn git(
        &self,
        dir: &Path,
        args: &[&str],
        log: &mut FetchLog,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, FetchError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let display = format!("git {}", args.join(" "));
        let out = run_program("git", &args, &display, &self.context(dir), None, cancel).await;
        log.push(&out);
        match &out.termination {
            Termination::Cancelled => Err(FetchError::Cancelled),
            Termination::SpawnFailed(e) => Err(FetchError::Git(e.clone())),
            _ => Ok(out),
        }
    }

    /// Resolve the configured submodule to a concrete url and revision.
    ///
    /// Missing values come from `.gitmodules` and the gitlink in `HEAD`.
    pub async fn resolve(
        &self,
        config: &SubmoduleConfig,
        cancel: &CancellationToken,
    ) -> Result<SubmoduleRef, FetchError> {
        let mut log = FetchLog::default();
        let path = config.path.display().to_string();

        let url = match &config.url {
            Some(url) => url.clone(),
            None => self
                .url_from_gitmodules(&path, &mut log, cancel)
                .await?
                .ok_or_else(|| FetchError::NoUrl(path.clone()))?,
        };
        let revision = match &config.revision {
            Some(revision) => revision.clone(),
            None => self
                .pinned_revision(&path, &mut log, cancel)
                .await?
                .ok_or_else(|| FetchError::Unpinned(path.clone()))?,
        };

        Ok(SubmoduleRef {
            path: config.path.clone(),
            url,
            revision,
        })
    }

    async fn url_from_gitmodules(
        &self,
        path: &str,
        log: &mut FetchLog,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FetchError> {
        if !self.workdir.join(".gitmodules").exists() {
            return Ok(None);
        }
        let out = self
            .git(
                &self.workdir,
                &["config", "-f", ".gitmodules", "--get-regexp", r"^submodule\..*\.path$"],
                log,
                cancel,
            )
            .await?;
        if !out.success() {
            return Ok(None);
        }
        // Lines look like `submodule.<name>.path <path>`.
        let name = out.stdout.lines().find_map(|line| {
            let (key, value) = line.split_once(' ')?;
            (value.trim() == path).then(|| {
                key.trim_start_matches("submodule.")
                    .trim_end_matches(".path")
                    .to_string()
            })
        });
        let Some(name) = name else {
            return Ok(None);
        };

        let key = format!("submodule.{name}.url");
        let out = self
            .git(&self.workdir, &["config", "-f", ".gitmodules", "--get", &key], log, cancel)
            .await?;
        let url = out.stdout.trim();
        Ok((out.success() && !url.is_empty()).then(|| url.to_string()))
    }

    async fn pinned_revision(
        &self,
        path: &str,
        log: &mut FetchLog,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FetchError> {
        let out = self
            .git(&self.workdir, &["ls-tree", "HEAD", "--", path], log, cancel)
            .await?;
        if !out.success() {
            return Ok(None);
        }
        // `160000 commit <sha>\t<path>`
        Ok(out.stdout.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some("160000"), Some("commit"), Some(sha)) => Some(sha.to_string()),
                _ => None,
            }
        }))
    }

    /// Resolve and fetch in one step, reporting any error as a failed result.
    pub async fn run(
        &self,
        config: &SubmoduleConfig,
        strategy: SubmoduleStrategy,
        cancel: &CancellationToken,
    ) -> DependencyResult {
        let start = Instant::now();
        if strategy == SubmoduleStrategy::None {
            let reference = SubmoduleRef {
                path: config.path.clone(),
                url: config.url.clone().unwrap_or_default(),
                revision: config.revision.clone().unwrap_or_default(),
            };
            return self.fetch(&reference, strategy, None, cancel).await;
        }
        match self.resolve(config, cancel).await {
            Ok(reference) => {
                let build = config.dependency_build();
                self.fetch(&reference, strategy, build.as_ref(), cancel).await
            }
            Err(e) => result_from(&config.path, strategy, Err(e), FetchLog::default(), start),
        }
    }

    /// Bring `reference` into the workdir and optionally build it.
    pub async fn fetch(
        &self,
        reference: &SubmoduleRef,
        strategy: SubmoduleStrategy,
        build: Option<&DependencyBuild>,
        cancel: &CancellationToken,
    ) -> DependencyResult {
        let start = Instant::now();
        let mut log = FetchLog::default();
        let dest = self.workdir.join(&reference.path);

        info!(
            path = %reference.path.display(),
            strategy = %strategy,
            revision = %reference.revision,
            "fetching dependency"
        );

        let checked_out = match strategy {
            SubmoduleStrategy::None => {
                if dest.is_dir() {
                    Ok(None)
                } else {
                    Err(FetchError::Missing(reference.path.display().to_string()))
                }
            }
            SubmoduleStrategy::Normal | SubmoduleStrategy::Recursive => self
                .checkout(reference, &dest, strategy, &mut log, cancel)
                .await
                .map(Some),
        };

        let checked_out = match (checked_out, build) {
            (Ok(revision), Some(build)) => self
                .build(&dest, build, &mut log, cancel)
                .await
                .map(|()| revision),
            (other, _) => other,
        };

        result_from(&reference.path, strategy, checked_out, log, start)
    }

    async fn checkout(
        &self,
        reference: &SubmoduleRef,
        dest: &Path,
        strategy: SubmoduleStrategy,
        log: &mut FetchLog,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let url = reference.url.as_str();

        if self.is_own_repo(dest, log, cancel).await? {
            let out = self
                .git(
                    dest,
                    &["fetch", "--force", "--tags", url, "+refs/heads/*:refs/remotes/origin/*"],
                    log,
                    cancel,
                )
                .await?;
            if !out.success() {
                return Err(FetchError::Unreachable {
                    url: url.to_string(),
                    detail: failure_detail(&out),
                });
            }
        } else {
            if dest.exists() {
                debug!(path = %dest.display(), "replacing non-repository directory");
                tokio::fs::remove_dir_all(dest)
                    .await
                    .map_err(|e| FetchError::Git(format!("cannot clear {}: {e}", dest.display())))?;
            }
            let dest_arg = dest.display().to_string();
            let out = self
                .git(&self.workdir, &["clone", "--no-checkout", url, &dest_arg], log, cancel)
                .await?;
            if !out.success() {
                return Err(FetchError::Unreachable {
                    url: url.to_string(),
                    detail: failure_detail(&out),
                });
            }
        }

        let expected = self
            .resolve_commit(dest, &reference.revision, log, cancel)
            .await?
            .ok_or_else(|| FetchError::RevisionMissing {
                url: url.to_string(),
                revision: reference.revision.clone(),
                detail: "no such commit, tag or branch".to_string(),
            })?;

        let out = self
            .git(dest, &["checkout", "--force", "--detach", &expected], log, cancel)
            .await?;
        if !out.success() {
            return Err(FetchError::RevisionMissing {
                url: url.to_string(),
                revision: reference.revision.clone(),
                detail: failure_detail(&out),
            });
        }

        let out = self.git(dest, &["rev-parse", "HEAD"], log, cancel).await?;
        let actual = out.stdout.trim().to_string();
        if actual != expected {
            return Err(FetchError::RevisionMismatch { expected, actual });
        }

        if strategy == SubmoduleStrategy::Recursive {
            let out = self
                .git(dest, &["submodule", "update", "--init", "--recursive", "--force"], log, cancel)
                .await?;
            if !out.success() {
                return Err(FetchError::Unreachable {
                    url: format!("nested submodules of {url}"),
                    detail: failure_detail(&out),
                });
            }
        }

        Ok(actual)
    }

    /// Commit for `revision`. Branch names resolve against the freshly
    /// fetched remote-tracking refs before local ones.
    async fn resolve_commit(
        &self,
        dest: &Path,
        revision: &str,
        log: &mut FetchLog,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FetchError> {
        for candidate in [format!("origin/{revision}"), revision.to_string()] {
            let spec = format!("{candidate}^{{commit}}");
            let out = self
                .git(dest, &["rev-parse", "--verify", "--quiet", &spec], log, cancel)
                .await?;
            let sha = out.stdout.trim();
            if out.success() && !sha.is_empty() {
                return Ok(Some(sha.to_string()));
            }
        }
        Ok(None)
    }

    /// Whether `dest` is the top of its own repository (not a directory inside
    /// the parent's work tree).
    async fn is_own_repo(
        &self,
        dest: &Path,
        log: &mut FetchLog,
        cancel: &CancellationToken,
    ) -> Result<bool, FetchError> {
        if !dest.join(".git").exists() {
            return Ok(false);
        }
        let out = self
            .git(dest, &["rev-parse", "--show-toplevel"], log, cancel)
            .await?;
        if !out.success() {
            return Ok(false);
        }
        let top = PathBuf::from(out.stdout.trim());
        let same = match (top.canonicalize(), dest.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        Ok(same)
    }

    async fn build(
        &self,
        dest: &Path,
        build: &DependencyBuild,
        log: &mut FetchLog,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let build_dir = dest.join(&build.build_dir);
        tokio::fs::create_dir_all(&build_dir)
            .await
            .map_err(|e| FetchError::DependencyBuild {
                command: format!("mkdir {}", build_dir.display()),
                detail: e.to_string(),
            })?;

        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .to_string();
        let ctx = self.context(&build_dir).labelled("dependency-build");

        for template in &build.commands {
            let command = template.replace(JOBS_PLACEHOLDER, &jobs);
            let out = run_shell(&command, &ctx, None, cancel).await;
            log.push(&out);
            match out.termination {
                Termination::Exited(0) => {}
                Termination::Cancelled => return Err(FetchError::Cancelled),
                _ => {
                    return Err(FetchError::DependencyBuild {
                        command,
                        detail: failure_detail(&out),
                    })
                }
            }
        }
        Ok(())
    }
}

fn result_from(
    path: &Path,
    strategy: SubmoduleStrategy,
    checked_out: Result<Option<String>, FetchError>,
    log: FetchLog,
    start: Instant,
) -> DependencyResult {
    let (outcome, failure, revision) = match checked_out {
        Ok(revision) => (StageOutcome::Passed, None, revision),
        Err(FetchError::Cancelled) => (StageOutcome::Cancelled, None, None),
        Err(e) => (
            StageOutcome::Failed,
            Some(StageFailure::FetchError {
                reason: e.to_string(),
            }),
            None,
        ),
    };
    DependencyResult {
        path: path.to_path_buf(),
        strategy,
        revision,
        outcome,
        failure,
        commands: log.commands,
        output: log.output,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}
