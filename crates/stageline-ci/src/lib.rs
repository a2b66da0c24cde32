//! stageline pipeline execution
//!
//! Runs a [`stageline_core::PipelineDefinition`] against a workdir:
//! - Fetches the pinned submodule (`fetcher`)
//! - Executes stages in their own process groups (`runner`)
//! - Parses formatter and test output into reports (`report`)
//! - Restores and saves cache snapshots (`cache`)
//! - Records run events (`ledger`) and evaluates the result (`gate`)

pub mod cache;
pub mod fetcher;
pub mod gate;
pub mod ledger;
pub mod pipeline;
pub mod report;
pub mod runner;

pub use cache::{
    CacheError, CacheStore, FsCacheStore, MemoryCacheStore, RestoreOutcome, SaveOutcome,
    SnapshotInfo,
};
pub use fetcher::{DependencyFetcher, FetchError};
pub use gate::{GateVerdict, RunGate};
pub use ledger::{JsonlRunLedger, LedgerError, MemoryRunLedger, RunEvent, RunLedger, RunRecorder};
pub use pipeline::{CachePlan, DependencyPlan, Pipeline};
pub use report::{parse_format_report, parse_test_report};
pub use runner::{CommandContext, CommandOutput, StageRunner, Termination};
