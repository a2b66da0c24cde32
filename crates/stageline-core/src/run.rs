//! Pipeline run records.
//!
//! A [`RunInProgress`] is owned by the orchestrator while stages execute and
//! is the only way to change a run. [`RunInProgress::finish`] turns it into
//! an immutable [`PipelineRun`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CacheOperation, CacheOutcome, CacheRecord};
use crate::error::{PipelineError, Result};
use crate::result::StageResult;
use crate::stage::StageKind;
use crate::state::{PhaseOutcome, RunState};
use crate::submodule::DependencyResult;

/// Who and what a run is for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunIdentity {
    pub run_id: Uuid,
    pub project: String,
    pub branch: String,

    /// Commit SHA the run executed against, or `unknown`.
    pub commit: String,

    /// Digest of the pipeline definition.
    pub definition_digest: String,
}

impl RunIdentity {
    pub fn new(
        project: impl Into<String>,
        branch: impl Into<String>,
        commit: impl Into<String>,
        definition_digest: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            project: project.into(),
            branch: branch.into(),
            commit: commit.into(),
            definition_digest: definition_digest.into(),
        }
    }
}

/// One edge taken through the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateChange {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
}

/// A finished pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineRun {
    identity: RunIdentity,
    state: RunState,
    failed_in: Option<RunState>,
    dependency: Option<DependencyResult>,
    stages: Vec<StageResult>,
    cache: Vec<CacheRecord>,
    transitions: Vec<StateChange>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    pub fn run_id(&self) -> Uuid {
        self.identity.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// The state the run was in when it failed.
    pub fn failed_in(&self) -> Option<RunState> {
        self.failed_in
    }

    pub fn dependency(&self) -> Option<&DependencyResult> {
        self.dependency.as_ref()
    }

    /// Stage results in execution order.
    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == kind)
    }

    pub fn cache_records(&self) -> &[CacheRecord] {
        &self.cache
    }

    /// Names of the cache entries written during this run.
    pub fn saved_cache_entries(&self) -> Vec<&str> {
        self.cache
            .iter()
            .filter(|r| r.operation == CacheOperation::Save && r.outcome == CacheOutcome::Saved)
            .map(|r| r.entry.as_str())
            .collect()
    }

    pub fn transitions(&self) -> &[StateChange] {
        &self.transitions
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    /// Number of stages that passed outright.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// Number of stages that did not pass (advisory failures included).
    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.passed()).count()
    }
}

/// A run whose stages are still executing.
#[derive(Debug)]
pub struct RunInProgress {
    identity: RunIdentity,
    state: RunState,
    failed_in: Option<RunState>,
    dependency: Option<DependencyResult>,
    stages: Vec<StageResult>,
    cache: Vec<CacheRecord>,
    transitions: Vec<StateChange>,
    started_at: DateTime<Utc>,
}

impl RunInProgress {
    pub fn new(identity: RunIdentity) -> Self {
        Self {
            identity,
            state: RunState::Pending,
            failed_in: None,
            dependency: None,
            stages: Vec::new(),
            cache: Vec::new(),
            transitions: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Apply a phase outcome to the state machine.
    pub fn advance(&mut self, outcome: PhaseOutcome) -> Result<StateChange> {
        let from = self.state;
        let to = from.next(outcome)?;
        if to == RunState::Failed {
            self.failed_in = Some(from);
        }
        self.state = to;
        let change = StateChange {
            from,
            to,
            at: Utc::now(),
        };
        self.transitions.push(change.clone());
        Ok(change)
    }

    /// Record the dependency fetch; only valid while `FETCHING`.
    pub fn record_dependency(&mut self, result: DependencyResult) -> Result<()> {
        if self.state != RunState::Fetching {
            return Err(PipelineError::StageOutOfOrder {
                stage: "fetch".to_string(),
                state: self.state,
            });
        }
        self.dependency = Some(result);
        Ok(())
    }

    /// Record a stage result; the run must be in that stage's state.
    pub fn record_stage(&mut self, result: StageResult) -> Result<()> {
        if self.state != result.stage.state() {
            return Err(PipelineError::StageOutOfOrder {
                stage: result.stage.name().to_string(),
                state: self.state,
            });
        }
        self.stages.push(result);
        Ok(())
    }

    pub fn record_cache(&mut self, record: CacheRecord) {
        self.cache.push(record);
    }

    /// Freeze the run. Fails unless the state machine reached a terminal state.
    pub fn finish(self) -> Result<PipelineRun> {
        if !self.state.is_terminal() {
            return Err(PipelineError::NotFinished(self.state));
        }
        Ok(PipelineRun {
            identity: self.identity,
            state: self.state,
            failed_in: self.failed_in,
            dependency: self.dependency,
            stages: self.stages,
            cache: self.cache,
            transitions: self.transitions,
            started_at: self.started_at,
            finished_at: Utc::now(),
        })
    }
}
