//! stageline core
//!
//! Domain model for the stageline pipeline runner:
//! - Stages (`format`, `build`, `test`) and their results
//! - The run state machine and the immutable `PipelineRun` record
//! - Cache entries, the submodule reference, and `stageline.toml`

pub mod cache;
pub mod config;
pub mod definition;
pub mod error;
pub mod git;
pub mod obs;
pub mod result;
pub mod run;
pub mod stage;
pub mod state;
pub mod submodule;
pub mod telemetry;
pub mod vars;

pub use cache::{CacheEntry, CacheKey, CacheOperation, CacheOutcome, CacheRecord};
pub use config::{PipelineConfig, StageConfig, SubmoduleConfig, CONFIG_FILE_NAME};
pub use definition::PipelineDefinition;
pub use error::{ConfigError, PipelineError, Result};
pub use git::{capture_head_sha, current_branch, is_git_repo};
pub use result::{
    CommandRecord, FormatReport, MisformattedFile, StageDetail, StageFailure, StageOutcome,
    StageResult, TestCase, TestReport, TestStatus,
};
pub use run::{PipelineRun, RunIdentity, RunInProgress, StateChange};
pub use stage::{Stage, StageKind};
pub use state::{Phase, PhaseOutcome, RunState};
pub use submodule::{DependencyBuild, DependencyResult, SubmoduleRef, SubmoduleStrategy};
pub use telemetry::{init_tracing, LogFormat};
