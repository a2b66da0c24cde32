//! Structured lifecycle events for pipeline runs.
//!
//! Every record carries an `event` field so log pipelines can filter on it,
//! e.g. `event=stage.finished stage=build outcome=failed`.

use tracing::{info, warn};

use crate::cache::{CacheOperation, CacheOutcome};
use crate::result::StageOutcome;
use crate::state::RunState;

/// Span covering one run. Attach with `tracing::Instrument` so it follows
/// the run future across await points.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("stageline.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, project: &str, branch: &str, commit: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        project = %project,
        branch = %branch,
        commit = %commit,
    );
}

pub fn emit_state_changed(run_id: &str, from: RunState, to: RunState) {
    info!(event = "run.state_changed", run_id = %run_id, from = %from, to = %to);
}

pub fn emit_stage_started(run_id: &str, stage: &str, blocking: bool) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage, blocking = blocking);
}

pub fn emit_stage_finished(
    run_id: &str,
    stage: &str,
    outcome: StageOutcome,
    exit_code: Option<i32>,
    duration_ms: u64,
) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        outcome = outcome.as_str(),
        exit_code = ?exit_code,
        duration_ms = duration_ms,
    );
}

pub fn emit_cache_op(entry: &str, operation: CacheOperation, outcome: CacheOutcome) {
    let event = match operation {
        CacheOperation::Restore => "cache.restored",
        CacheOperation::Save => "cache.saved",
    };
    info!(event = event, entry = %entry, outcome = ?outcome);
}

pub fn emit_cache_error(entry: &str, operation: CacheOperation, error: &dyn std::fmt::Display) {
    warn!(event = "cache.error", entry = %entry, operation = ?operation, error = %error);
}

pub fn emit_run_finished(run_id: &str, state: RunState, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        state = %state,
        duration_ms = duration_ms,
    );
}

pub fn emit_gate_evaluated(run_id: &str, passed: bool, violations: usize) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        passed = passed,
        violations = violations,
    );
}
