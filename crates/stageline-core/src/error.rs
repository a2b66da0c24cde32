//! Error taxonomy for stageline.
//!
//! Stage failures (a build that does not compile, a failing test) are data
//! carried in [`crate::StageFailure`]. The errors here are for the runner
//! itself being unable to operate.

use crate::state::{PhaseOutcome, RunState};

/// Errors loading or resolving a pipeline configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("unknown submodule strategy: {0} (expected none, normal or recursive)")]
    UnknownStrategy(String),

    #[error("stage order must be format, build, test; got {0}")]
    StageOrder(String),

    #[error("stage {0} has an empty script")]
    EmptyScript(String),

    #[error("stage {0} cannot allow failure; only format is advisory")]
    AdvisoryNotAllowed(String),

    #[error("cache entry {name} has an invalid path: {path}")]
    InvalidCachePath { name: String, path: String },

    #[error("duplicate cache entry: {0}")]
    DuplicateCacheEntry(String),

    #[error("variable cycle detected at ${0}")]
    VariableCycle(String),

    #[error("failed to serialize config: {0}")]
    Serialize(String),
}

/// Errors produced while driving a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid run state transition: {from} on {outcome:?}")]
    InvalidTransition { from: RunState, outcome: PhaseOutcome },

    #[error("stage {stage} recorded while run is {state}")]
    StageOutOfOrder { stage: String, state: RunState },

    #[error("run is not finished (state {0})")]
    NotFinished(RunState),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("git error: {0}")]
    Git(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for stageline pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
