//! Pipeline orchestration and run recording.
//!
//! A run restores the cache, fetches the dependency, then executes
//! `format -> build -> test`, advancing the run state machine after each
//! phase. Cache entries are saved as soon as the phase that owns them
//! succeeds, so a later failure still keeps the work done before it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use stageline_core::obs;
use stageline_core::{
    CacheEntry, CacheKey, CacheOperation, CacheOutcome, CacheRecord, Phase, PhaseOutcome,
    PipelineDefinition, PipelineError, PipelineRun, Result, RunIdentity, RunInProgress,
    StageOutcome, SubmoduleConfig, SubmoduleStrategy,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

use crate::cache::{CacheStore, RestoreOutcome, SaveOutcome};
use crate::fetcher::DependencyFetcher;
use crate::ledger::{LedgerError, RunLedger, RunRecorder};
use crate::runner::{CommandContext, StageRunner};

/// Where snapshots live and which directories to keep.
#[derive(Clone)]
pub struct CachePlan {
    pub store: Arc<dyn CacheStore>,
    pub key: CacheKey,
    pub entries: Vec<CacheEntry>,
}

/// The submodule to fetch and how.
#[derive(Debug, Clone)]
pub struct DependencyPlan {
    pub config: SubmoduleConfig,
    pub strategy: SubmoduleStrategy,
}

fn ledger_err(e: LedgerError) -> PipelineError {
    PipelineError::Ledger(e.to_string())
}

/// Pipeline orchestrator.
pub struct Pipeline {
    workdir: PathBuf,
    definition: PipelineDefinition,
    ledger: Arc<dyn RunLedger>,
    variables: BTreeMap<String, String>,
    project: String,
    branch: String,
    commit: String,
    dependency: Option<DependencyPlan>,
    cache: Option<CachePlan>,
}

impl Pipeline {
    pub fn new(
        workdir: impl Into<PathBuf>,
        definition: PipelineDefinition,
        ledger: Arc<dyn RunLedger>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            definition,
            ledger,
            variables: BTreeMap::new(),
            project: "project".to_string(),
            branch: "unknown".to_string(),
            commit: "unknown".to_string(),
            dependency: None,
            cache: None,
        }
    }

    pub fn with_identity(
        mut self,
        project: impl Into<String>,
        branch: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        self.project = project.into();
        self.branch = branch.into();
        self.commit = commit.into();
        self
    }

    /// Resolved variables, exported to every command.
    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_dependency(mut self, plan: DependencyPlan) -> Self {
        self.dependency = Some(plan);
        self
    }

    pub fn with_cache(mut self, plan: CachePlan) -> Self {
        self.cache = Some(plan);
        self
    }

    /// Execute the pipeline and record all events into the ledger.
    ///
    /// Stage failures are reported in the returned run; `Err` means the
    /// runner itself could not operate.
    pub async fn run(&self, cancel: CancellationToken) -> Result<PipelineRun> {
        let identity = RunIdentity::new(
            self.project.clone(),
            self.branch.clone(),
            self.commit.clone(),
            self.definition.digest(),
        );
        let span = obs::run_span(&identity.run_id.to_string());
        self.execute(identity, cancel).instrument(span).await
    }

    async fn execute(
        &self,
        identity: RunIdentity,
        cancel: CancellationToken,
    ) -> Result<PipelineRun> {
        let start = Instant::now();
        let run_id = identity.run_id.to_string();

        let recorder = RunRecorder::start(self.ledger.clone(), &identity)
            .await
            .map_err(ledger_err)?;
        obs::emit_run_started(&run_id, &identity.project, &identity.branch, &identity.commit);

        let mut run = RunInProgress::new(identity);

        self.restore_cache(&mut run, &recorder).await?;

        let started = if cancel.is_cancelled() {
            PhaseOutcome::Cancelled
        } else {
            PhaseOutcome::Started
        };
        self.advance(&mut run, &recorder, started).await?;

        if !run.state().is_terminal() {
            let outcome = self.fetch_dependency(&mut run, &recorder, &cancel).await?;
            if outcome == StageOutcome::Passed {
                self.save_cache(Phase::Fetch, &mut run, &recorder).await?;
            }
            self.advance(&mut run, &recorder, outcome.phase_outcome())
                .await?;
        }

        let ctx = CommandContext::new(&self.workdir, self.variables.clone());
        for stage in self.definition.stages() {
            if run.state().is_terminal() {
                break;
            }
            if cancel.is_cancelled() {
                self.advance(&mut run, &recorder, PhaseOutcome::Cancelled)
                    .await?;
                break;
            }

            obs::emit_stage_started(&run_id, stage.name(), stage.is_blocking());
            recorder
                .record(
                    "stage_started",
                    json!({
                        "stage": stage.name(),
                        "blocking": stage.is_blocking(),
                        "script": &stage.script,
                    }),
                )
                .await
                .map_err(ledger_err)?;

            let result = StageRunner::execute_stage(stage, &ctx, &cancel).await;

            obs::emit_stage_finished(
                &run_id,
                stage.name(),
                result.outcome,
                result.exit_code,
                result.duration_ms,
            );
            recorder
                .record(
                    "stage_finished",
                    json!({
                        "stage": stage.name(),
                        "outcome": result.outcome,
                        "exit_code": result.exit_code,
                        "failure": &result.failure,
                        "duration_ms": result.duration_ms,
                    }),
                )
                .await
                .map_err(ledger_err)?;

            let outcome = result.outcome;
            run.record_stage(result)?;
            if outcome == StageOutcome::Passed {
                self.save_cache(stage.kind.phase(), &mut run, &recorder)
                    .await?;
            }
            self.advance(&mut run, &recorder, outcome.phase_outcome())
                .await?;
        }

        let run = run.finish()?;
        recorder.finish(run.state()).await.map_err(ledger_err)?;
        obs::emit_run_finished(&run_id, run.state(), start.elapsed().as_millis() as u64);
        info!(
            run_id = %run_id,
            state = %run.state(),
            passed = run.passed_count(),
            failed = run.failed_count(),
            "pipeline finished"
        );
        Ok(run)
    }

    async fn advance(
        &self,
        run: &mut RunInProgress,
        recorder: &RunRecorder,
        outcome: PhaseOutcome,
    ) -> Result<()> {
        let change = run.advance(outcome)?;
        obs::emit_state_changed(&recorder.run_id().to_string(), change.from, change.to);
        recorder
            .record(
                "state_changed",
                json!({ "from": change.from, "to": change.to }),
            )
            .await
            .map_err(ledger_err)
    }

    async fn fetch_dependency(
        &self,
        run: &mut RunInProgress,
        recorder: &RunRecorder,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let Some(plan) = &self.dependency else {
            return Ok(StageOutcome::Passed);
        };
        if !plan.config.enabled {
            return Ok(StageOutcome::Passed);
        }

        let fetcher = DependencyFetcher::new(&self.workdir, self.variables.clone());
        let result = fetcher.run(&plan.config, plan.strategy, cancel).await;

        recorder
            .record(
                "dependency_fetched",
                json!({
                    "path": result.path,
                    "strategy": result.strategy,
                    "revision": &result.revision,
                    "outcome": result.outcome,
                    "failure": &result.failure,
                    "duration_ms": result.duration_ms,
                }),
            )
            .await
            .map_err(ledger_err)?;

        let outcome = result.outcome;
        run.record_dependency(result)?;
        Ok(outcome)
    }

    async fn restore_cache(&self, run: &mut RunInProgress, recorder: &RunRecorder) -> Result<()> {
        let Some(plan) = &self.cache else {
            return Ok(());
        };
        for entry in &plan.entries {
            let store = plan.store.clone();
            let key = plan.key.clone();
            let owned = entry.clone();
            let dest = entry.resolve(&self.workdir);
            let restored =
                tokio::task::spawn_blocking(move || store.restore(&key, &owned, &dest)).await;

            let (outcome, detail) = match restored {
                Ok(Ok(RestoreOutcome::Hit { bytes })) => {
                    (CacheOutcome::Hit, Some(format!("{bytes} bytes")))
                }
                Ok(Ok(RestoreOutcome::Miss)) => (CacheOutcome::Miss, None),
                Ok(Err(e)) => {
                    obs::emit_cache_error(&entry.name, CacheOperation::Restore, &e);
                    (CacheOutcome::Error, Some(e.to_string()))
                }
                Err(e) => {
                    obs::emit_cache_error(&entry.name, CacheOperation::Restore, &e);
                    (CacheOutcome::Error, Some(e.to_string()))
                }
            };
            self.record_cache(run, recorder, entry, CacheOperation::Restore, outcome, detail)
                .await?;
        }
        Ok(())
    }

    /// Save the entries owned by `phase`.
    async fn save_cache(
        &self,
        phase: Phase,
        run: &mut RunInProgress,
        recorder: &RunRecorder,
    ) -> Result<()> {
        let Some(plan) = &self.cache else {
            return Ok(());
        };
        for entry in plan.entries.iter().filter(|e| e.save_after == phase) {
            let store = plan.store.clone();
            let key = plan.key.clone();
            let owned = entry.clone();
            let src = entry.resolve(&self.workdir);
            let saved = tokio::task::spawn_blocking(move || store.save(&key, &owned, &src)).await;

            let (outcome, detail) = match saved {
                Ok(Ok(SaveOutcome::Saved { bytes, sha256 })) => (
                    CacheOutcome::Saved,
                    Some(format!("{bytes} bytes, sha256 {sha256}")),
                ),
                Ok(Ok(SaveOutcome::Skipped)) => {
                    (CacheOutcome::Skipped, Some("source missing".to_string()))
                }
                Ok(Err(e)) => {
                    obs::emit_cache_error(&entry.name, CacheOperation::Save, &e);
                    (CacheOutcome::Error, Some(e.to_string()))
                }
                Err(e) => {
                    obs::emit_cache_error(&entry.name, CacheOperation::Save, &e);
                    (CacheOutcome::Error, Some(e.to_string()))
                }
            };
            self.record_cache(run, recorder, entry, CacheOperation::Save, outcome, detail)
                .await?;
        }
        Ok(())
    }

    async fn record_cache(
        &self,
        run: &mut RunInProgress,
        recorder: &RunRecorder,
        entry: &CacheEntry,
        operation: CacheOperation,
        outcome: CacheOutcome,
        detail: Option<String>,
    ) -> Result<()> {
        obs::emit_cache_op(&entry.name, operation, outcome);
        let kind = match operation {
            CacheOperation::Restore => "cache_restored",
            CacheOperation::Save => "cache_saved",
        };
        recorder
            .record(
                kind,
                json!({ "entry": &entry.name, "outcome": outcome, "detail": &detail }),
            )
            .await
            .map_err(ledger_err)?;
        run.record_cache(CacheRecord {
            entry: entry.name.clone(),
            operation,
            outcome,
            detail,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::ledger::MemoryRunLedger;
    use stageline_core::{RunState, Stage, StageKind};

    fn definition(format: &str, build: &str, test: &str) -> PipelineDefinition {
        PipelineDefinition::new(vec![
            Stage::from_kind(StageKind::Format).with_script([format]),
            Stage::from_kind(StageKind::Build).with_script([build]),
            Stage::from_kind(StageKind::Test).with_script([test]),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_records_every_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryRunLedger::new());
        let pipeline = Pipeline::new(dir.path(), definition("true", "true", "true"), ledger.clone());

        let run = pipeline.run(CancellationToken::new()).await.unwrap();
        assert_eq!(run.state(), RunState::Succeeded);

        let events = ledger.get_events(run.run_id()).await.unwrap();
        let changes = events.iter().filter(|e| e.kind == "state_changed").count();
        assert_eq!(changes, run.transitions().len());
        assert_eq!(changes, 5);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(
            ledger.final_state(run.run_id()).await.unwrap(),
            Some(RunState::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryRunLedger::new());
        let pipeline = Pipeline::new(dir.path(), definition("true", "true", "true"), ledger);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = pipeline.run(cancel).await.unwrap();
        assert_eq!(run.state(), RunState::Cancelled);
        assert!(run.stages().is_empty());
    }

    #[tokio::test]
    async fn test_save_only_after_owning_phase_passes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::create_dir_all(dir.path().join("cargo")).unwrap();

        let store = Arc::new(MemoryCacheStore::new());
        let key = CacheKey::new("b7", "master");
        let plan = CachePlan {
            store: store.clone(),
            key: key.clone(),
            entries: vec![
                CacheEntry::new("cargo", "cargo", Phase::Build),
                CacheEntry::new("target", "target", Phase::Test),
            ],
        };
        let pipeline = Pipeline::new(
            dir.path(),
            definition("true", "true", "false"),
            Arc::new(MemoryRunLedger::new()),
        )
        .with_cache(plan);

        let run = pipeline.run(CancellationToken::new()).await.unwrap();
        assert_eq!(run.state(), RunState::Failed);
        assert_eq!(run.saved_cache_entries(), vec!["cargo"]);
        assert!(store.contains(&key, "cargo"));
        assert!(!store.contains(&key, "target"));
    }
}
