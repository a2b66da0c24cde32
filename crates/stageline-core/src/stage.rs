//! Stage definitions and configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::state::{Phase, RunState};

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// cargo fmt --all -- --check
    Format,

    /// cargo build --verbose
    Build,

    /// rustc --version; cargo --version; cargo test --verbose
    Test,
}

impl StageKind {
    /// Declaration order every pipeline must follow.
    pub const ORDER: [StageKind; 3] = [StageKind::Format, StageKind::Build, StageKind::Test];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Format => "format",
            StageKind::Build => "build",
            StageKind::Test => "test",
        }
    }

    /// Get the stage's default command sequence.
    pub fn default_script(&self) -> Vec<String> {
        match self {
            StageKind::Format => vec!["cargo fmt --all -- --check".to_string()],
            StageKind::Build => vec!["cargo build --verbose".to_string()],
            StageKind::Test => vec![
                "rustc --version".to_string(),
                "cargo --version".to_string(),
                "cargo test --verbose".to_string(),
            ],
        }
    }

    /// Only the formatter is advisory by default.
    pub fn default_allow_failure(&self) -> bool {
        self.can_be_advisory()
    }

    /// Whether a failure of this stage may be tolerated at all. Build and
    /// test failures always end the run.
    pub fn can_be_advisory(&self) -> bool {
        matches!(self, StageKind::Format)
    }

    /// Environment the stage sets on top of the pipeline variables.
    pub fn default_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let StageKind::Build = self {
            env.insert("RUST_BACKTRACE".to_string(), "1".to_string());
        }
        env
    }

    pub fn phase(&self) -> Phase {
        match self {
            StageKind::Format => Phase::Format,
            StageKind::Build => Phase::Build,
            StageKind::Test => Phase::Test,
        }
    }

    /// The run state in which this stage executes.
    pub fn state(&self) -> RunState {
        self.phase().state()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "format" | "fmt" => Ok(StageKind::Format),
            "build" => Ok(StageKind::Build),
            "test" => Ok(StageKind::Test),
            other => Err(ConfigError::UnknownStage(other.to_string())),
        }
    }
}

/// Configuration for a pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stage {
    pub kind: StageKind,

    /// Shell commands, run in order; the first failure ends the stage.
    pub script: Vec<String>,

    /// A failing advisory stage does not halt the run.
    pub allow_failure: bool,

    /// Extra environment for this stage only.
    pub env: BTreeMap<String, String>,

    /// Timeout in seconds for the whole stage (0 = none).
    pub timeout_secs: u64,
}

impl Stage {
    /// Create a stage with its default commands and policy.
    pub fn from_kind(kind: StageKind) -> Self {
        Self {
            kind,
            script: kind.default_script(),
            allow_failure: kind.default_allow_failure(),
            env: kind.default_env(),
            timeout_secs: 0,
        }
    }

    /// Replace the command sequence.
    pub fn with_script<I, S>(mut self, script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script = script.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allow_failure(mut self, allow_failure: bool) -> Self {
        self.allow_failure = allow_failure;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Whether a failure of this stage halts the run.
    pub fn is_blocking(&self) -> bool {
        !(self.allow_failure && self.kind.can_be_advisory())
    }
}
