//! stageline - local runner for the format/build/test pipeline
//!
//! ## Commands
//!
//! - `run`: fetch the submodule and execute `format -> build -> test`
//! - `fetch`: only bring the pinned submodule into the workdir
//! - `cache`: list, restore or save cache snapshots
//! - `check`: validate `stageline.toml` and print the resolved pipeline
//! - `init`: write a default `stageline.toml`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use stageline_ci::{
    CachePlan, CacheStore, DependencyFetcher, DependencyPlan, FsCacheStore, JsonlRunLedger,
    Pipeline, RestoreOutcome, RunGate, SaveOutcome,
};
use stageline_core::config::CONFIG_TEMPLATE;
use stageline_core::vars::{CI_COMMIT_REF_NAME, CI_COMMIT_SHA, CI_PROJECT_DIR};
use stageline_core::{
    capture_head_sha, current_branch, obs, CacheEntry, CacheKey, LogFormat, PipelineConfig,
    PipelineRun, RunState, StageOutcome, CONFIG_FILE_NAME,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// Ledger files, relative to the workdir.
const RUNS_DIR: &str = ".stageline/runs";

#[derive(Parser)]
#[command(name = "stageline")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run the format/build/test pipeline with a pinned submodule and shared caches", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where to run and with which configuration.
#[derive(Args, Debug, Clone)]
struct Target {
    /// Project directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Configuration file (default: <workdir>/stageline.toml)
    #[arg(short, long, env = "STAGELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Branch name used for the cache key (default: current git branch)
    #[arg(short, long, env = "CI_COMMIT_REF_NAME")]
    branch: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline run
    Run {
        #[command(flatten)]
        target: Target,

        /// Skip cache restore and save
        #[arg(long)]
        no_cache: bool,

        /// Cache directory (default: [cache].root from the config)
        #[arg(long, env = "STAGELINE_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        /// Write the finished run as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Fetch the pinned submodule only
    Fetch {
        #[command(flatten)]
        target: Target,
    },

    /// Artifact cache operations
    Cache {
        #[command(flatten)]
        target: Target,

        /// Cache directory (default: [cache].root from the config)
        #[arg(long, env = "STAGELINE_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        #[command(subcommand)]
        action: CacheAction,
    },

    /// Validate the configuration and print the resolved pipeline
    Check {
        #[command(flatten)]
        target: Target,
    },

    /// Write a default stageline.toml
    Init {
        /// Project directory (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List snapshots for this project and branch
    List,

    /// Restore snapshots into the workdir
    Restore {
        /// Entry name (default: all entries)
        entry: Option<String>,
    },

    /// Save workdir directories as snapshots
    Save {
        /// Entry name (default: all entries)
        entry: Option<String>,
    },
}

/// A loaded project: workdir, config and the identity of its checkout.
struct Workspace {
    workdir: PathBuf,
    config: PipelineConfig,
    variables: BTreeMap<String, String>,
    project: String,
    branch: String,
    commit: String,
}

impl Workspace {
    fn load(target: &Target) -> Result<Self> {
        let workdir = target
            .workdir
            .canonicalize()
            .with_context(|| format!("Workdir not found: {}", target.workdir.display()))?;
        let config_path = target
            .config
            .clone()
            .unwrap_or_else(|| workdir.join(CONFIG_FILE_NAME));
        let config = PipelineConfig::load_or_default(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;

        let commit = capture_head_sha(&workdir).unwrap_or_else(|e| {
            warn!(error = %e, "could not read HEAD, recording commit as unknown");
            "unknown".to_string()
        });
        let branch = target
            .branch
            .clone()
            .or_else(|| config.project.branch.clone())
            .or_else(|| current_branch(&workdir).ok())
            .unwrap_or_else(|| "detached".to_string());
        let project = config.project_name(&workdir);

        let mut builtins: BTreeMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        builtins.insert(CI_PROJECT_DIR.to_string(), workdir.display().to_string());
        builtins.insert(CI_COMMIT_SHA.to_string(), commit.clone());
        builtins.insert(CI_COMMIT_REF_NAME.to_string(), branch.clone());
        let variables = config
            .resolve_variables(&builtins)
            .context("Failed to resolve [variables]")?;

        Ok(Self {
            workdir,
            config,
            variables,
            project,
            branch,
            commit,
        })
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.project.clone(), self.branch.clone())
    }

    fn cache_store(&self, cache_dir: Option<&Path>) -> Result<FsCacheStore> {
        let root = match cache_dir {
            Some(dir) => dir.to_path_buf(),
            None => self.config.cache_root(&self.workdir),
        };
        FsCacheStore::new(&root)
            .with_context(|| format!("Failed to open cache at {}", root.display()))
    }

    fn dependency_plan(&self) -> Result<DependencyPlan> {
        Ok(DependencyPlan {
            config: self.config.submodule.clone(),
            strategy: PipelineConfig::submodule_strategy(&self.variables)?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    stageline_core::init_tracing(LogFormat::from_json_flag(cli.json), level);

    match cli.command {
        Commands::Run {
            target,
            no_cache,
            cache_dir,
            report,
        } => cmd_run(&target, no_cache, cache_dir.as_deref(), report.as_deref()).await,
        Commands::Fetch { target } => cmd_fetch(&target).await,
        Commands::Cache {
            target,
            cache_dir,
            action,
        } => cmd_cache(&target, cache_dir.as_deref(), action),
        Commands::Check { target } => cmd_check(&target),
        Commands::Init { path, force } => cmd_init(&path, force),
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            token.cancel();
        }
    });
}

fn exit_code(state: RunState) -> ExitCode {
    match state {
        RunState::Succeeded => ExitCode::SUCCESS,
        RunState::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}

fn outcome_mark(outcome: StageOutcome) -> &'static str {
    match outcome {
        StageOutcome::Passed => "✓",
        StageOutcome::AdvisoryFailed => "~",
        StageOutcome::Failed => "✗",
        StageOutcome::Cancelled => "-",
    }
}

/// Execute a pipeline run
async fn cmd_run(
    target: &Target,
    no_cache: bool,
    cache_dir: Option<&Path>,
    report: Option<&Path>,
) -> Result<ExitCode> {
    let ws = Workspace::load(target)?;
    let definition = ws.config.definition()?;

    println!("Running pipeline for {} ({})", ws.project, ws.workdir.display());
    println!("Branch: {}", ws.branch);
    println!("Commit: {}", ws.commit);
    println!();

    let ledger = Arc::new(
        JsonlRunLedger::new(ws.workdir.join(RUNS_DIR)).context("Failed to open run ledger")?,
    );
    let mut pipeline = Pipeline::new(&ws.workdir, definition, ledger)
        .with_identity(ws.project.clone(), ws.branch.clone(), ws.commit.clone())
        .with_variables(ws.variables.clone())
        .with_dependency(ws.dependency_plan()?);

    if ws.config.cache.enabled && !no_cache {
        let store: Arc<dyn CacheStore> = Arc::new(ws.cache_store(cache_dir)?);
        pipeline = pipeline.with_cache(CachePlan {
            store,
            key: ws.cache_key(),
            entries: ws.config.cache_entries()?,
        });
    } else {
        info!("cache disabled for this run");
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let run = pipeline
        .run(cancel)
        .await
        .context("Pipeline failed to run")?;

    print_run(&run);

    let verdict = RunGate::evaluate(&run);
    obs::emit_gate_evaluated(
        &run.run_id().to_string(),
        verdict.passed,
        verdict.violations.len(),
    );
    println!();
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }
    if !verdict.advisories.is_empty() {
        println!("Advisories:");
        for advisory in &verdict.advisories {
            println!("  - {}", advisory);
        }
    }

    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&run)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        println!("\nReport written to {}", path.display());
    }

    Ok(exit_code(run.state()))
}

fn print_run(run: &PipelineRun) {
    println!("Run ID: {}", run.run_id());
    let status = match run.state() {
        RunState::Succeeded => "✓ SUCCEEDED".to_string(),
        RunState::Cancelled => "- CANCELLED".to_string(),
        state => match run.failed_in() {
            Some(phase) => format!("✗ {} (in {})", state, phase),
            None => format!("✗ {}", state),
        },
    };
    println!("Status: {}", status);
    println!("Duration: {}ms", run.duration_ms());
    println!();

    if let Some(dependency) = run.dependency() {
        println!(
            "  {} fetch {} @ {} ({}ms)",
            outcome_mark(dependency.outcome),
            dependency.path.display(),
            dependency.revision.as_deref().unwrap_or("-"),
            dependency.duration_ms
        );
        if let Some(failure) = &dependency.failure {
            println!("      {}", failure.summary());
        }
    }

    for stage in run.stages() {
        let exit = stage
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "  {} {} ({}ms, exit code: {})",
            outcome_mark(stage.outcome),
            stage.name(),
            stage.duration_ms,
            exit
        );
        if let Some(failure) = &stage.failure {
            println!("      {}", failure.summary());
        }
        if let Some(report) = stage.format_report() {
            for file in &report.files {
                println!("      {} (lines {:?})", file.path, file.lines);
            }
        }
        if let Some(report) = stage.test_report() {
            if !report.cases.is_empty() {
                println!(
                    "      tests: {} passed, {} failed, {} ignored",
                    report.passed(),
                    report.failed(),
                    report.ignored()
                );
            }
        }
    }

    if !run.cache_records().is_empty() {
        println!();
        println!("Cache:");
        for record in run.cache_records() {
            println!(
                "  {:?} {}: {:?}{}",
                record.operation,
                record.entry,
                record.outcome,
                record
                    .detail
                    .as_deref()
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default()
            );
        }
    }

    println!();
    println!(
        "Summary: {}/{} stages passed",
        run.passed_count(),
        run.stages().len()
    );
}

/// Fetch the pinned submodule only
async fn cmd_fetch(target: &Target) -> Result<ExitCode> {
    let ws = Workspace::load(target)?;
    let plan = ws.dependency_plan()?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let fetcher = DependencyFetcher::new(&ws.workdir, ws.variables.clone());
    let result = fetcher.run(&plan.config, plan.strategy, &cancel).await;

    println!(
        "{} {} ({}, {}ms)",
        outcome_mark(result.outcome),
        result.path.display(),
        result.strategy,
        result.duration_ms
    );
    if let Some(revision) = &result.revision {
        println!("Revision: {}", revision);
    }
    if let Some(failure) = &result.failure {
        println!("Error: {}", failure.summary());
    }

    Ok(match result.outcome {
        StageOutcome::Passed => ExitCode::SUCCESS,
        StageOutcome::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}

/// Entries named by `filter`, or all of them.
fn select_entries(entries: Vec<CacheEntry>, filter: Option<&str>) -> Result<Vec<CacheEntry>> {
    match filter {
        None => Ok(entries),
        Some(name) => {
            let selected: Vec<_> = entries.into_iter().filter(|e| e.name == name).collect();
            if selected.is_empty() {
                anyhow::bail!("Unknown cache entry: {}", name);
            }
            Ok(selected)
        }
    }
}

/// Artifact cache operations
fn cmd_cache(target: &Target, cache_dir: Option<&Path>, action: CacheAction) -> Result<ExitCode> {
    let ws = Workspace::load(target)?;
    let store = ws.cache_store(cache_dir)?;
    let key = ws.cache_key();

    match action {
        CacheAction::List => {
            let snapshots = store.list(&key)?;
            if snapshots.is_empty() {
                println!("No snapshots for {}/{}", key.project, key.branch);
            }
            for snapshot in snapshots {
                println!(
                    "{:<12} {:>12} bytes  {}  {}",
                    snapshot.entry,
                    snapshot.bytes,
                    snapshot.saved_at.format("%Y-%m-%d %H:%M:%S"),
                    &snapshot.sha256[..12.min(snapshot.sha256.len())]
                );
            }
        }
        CacheAction::Restore { entry } => {
            for entry in select_entries(ws.config.cache_entries()?, entry.as_deref())? {
                let dest = entry.resolve(&ws.workdir);
                match store.restore(&key, &entry, &dest)? {
                    RestoreOutcome::Hit { bytes } => {
                        println!("✓ {} restored ({} bytes)", entry.name, bytes)
                    }
                    RestoreOutcome::Miss => println!("- {} not cached", entry.name),
                }
            }
        }
        CacheAction::Save { entry } => {
            for entry in select_entries(ws.config.cache_entries()?, entry.as_deref())? {
                let src = entry.resolve(&ws.workdir);
                match store.save(&key, &entry, &src)? {
                    SaveOutcome::Saved { bytes, .. } => {
                        println!("✓ {} saved ({} bytes)", entry.name, bytes)
                    }
                    SaveOutcome::Skipped => {
                        println!("- {} skipped ({} missing)", entry.name, src.display())
                    }
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Validate the configuration and print the resolved pipeline
fn cmd_check(target: &Target) -> Result<ExitCode> {
    let ws = Workspace::load(target)?;
    let definition = ws.config.definition()?;
    let strategy = PipelineConfig::submodule_strategy(&ws.variables)?;
    let entries = ws.config.cache_entries()?;

    println!("Project: {} (branch {})", ws.project, ws.branch);
    println!("Definition digest: {}", definition.digest());
    println!();
    println!("Stages:");
    for stage in definition.stages() {
        let timeout = if stage.timeout_secs > 0 {
            format!(", timeout {}s", stage.timeout_secs)
        } else {
            String::new()
        };
        println!(
            "  {:<8} {}{}",
            stage.name(),
            if stage.is_blocking() { "blocking" } else { "advisory" },
            timeout
        );
        for command in &stage.script {
            println!("      $ {}", command);
        }
    }
    println!();
    if ws.config.submodule.enabled {
        println!(
            "Submodule: {} (strategy {})",
            ws.config.submodule.path.display(),
            strategy
        );
    } else {
        println!("Submodule: disabled");
    }
    println!();
    println!(
        "Cache ({}):",
        if ws.config.cache.enabled { "enabled" } else { "disabled" }
    );
    for entry in &entries {
        println!(
            "  {:<12} {:<12} saved after {}",
            entry.name,
            entry.path.display(),
            entry.save_after.name()
        );
    }
    println!("\n✓ Configuration is valid");
    Ok(ExitCode::SUCCESS)
}

/// Write a default stageline.toml
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    let file = path.join(CONFIG_FILE_NAME);
    if file.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", file.display());
    }
    std::fs::write(&file, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", file.display()))?;
    println!("✓ Wrote {}", file.display());
    Ok(ExitCode::SUCCESS)
}
