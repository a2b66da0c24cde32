//! Pipeline definition and identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::stage::{Stage, StageKind};

/// The ordered stages of a pipeline.
///
/// Construction (and deserialization) validates that the stages are exactly
/// `format, build, test` in that order, each with a non-empty script, and
/// that only `format` allows failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawDefinition")]
pub struct PipelineDefinition {
    stages: Vec<Stage>,
}

#[derive(Deserialize)]
struct RawDefinition {
    stages: Vec<Stage>,
}

impl TryFrom<RawDefinition> for PipelineDefinition {
    type Error = ConfigError;

    fn try_from(raw: RawDefinition) -> Result<Self, Self::Error> {
        Self::new(raw.stages)
    }
}

impl PipelineDefinition {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        let kinds: Vec<StageKind> = stages.iter().map(|s| s.kind).collect();
        if kinds != StageKind::ORDER {
            let got = kinds
                .iter()
                .map(StageKind::name)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConfigError::StageOrder(got));
        }
        if let Some(stage) = stages.iter().find(|s| s.script.is_empty()) {
            return Err(ConfigError::EmptyScript(stage.name().to_string()));
        }
        if let Some(stage) = stages
            .iter()
            .find(|s| s.allow_failure && !s.kind.can_be_advisory())
        {
            return Err(ConfigError::AdvisoryNotAllowed(stage.name().to_string()));
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// SHA-256 over the ordered stage names, scripts and blocking flags.
    ///
    /// Deterministic and order-sensitive; environment and timeouts are
    /// excluded so tuning them does not change the pipeline's identity.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for stage in &self.stages {
            hasher.update(stage.name().as_bytes());
            hasher.update(b"\0");
            hasher.update(if stage.is_blocking() { b"1" } else { b"0" });
            for command in &stage.script {
                hasher.update(command.as_bytes());
                hasher.update(b"\n");
            }
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

impl Default for PipelineDefinition {
    fn default() -> Self {
        Self {
            stages: StageKind::ORDER.iter().copied().map(Stage::from_kind).collect(),
        }
    }
}
