//! The pinned external dependency and the result of resolving it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::result::{CommandRecord, StageFailure, StageOutcome};

/// Environment variable selecting how the submodule is checked out.
pub const SUBMODULE_STRATEGY_VAR: &str = "GIT_SUBMODULE_STRATEGY";

/// How the dependency fetcher checks out the submodule.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmoduleStrategy {
    /// Leave the directory as found (restored from cache or checked out by hand).
    None,
    /// Fetch and check out the pinned revision on every run.
    #[default]
    Normal,
    /// As `Normal`, plus nested submodules.
    Recursive,
}

impl SubmoduleStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmoduleStrategy::None => "none",
            SubmoduleStrategy::Normal => "normal",
            SubmoduleStrategy::Recursive => "recursive",
        }
    }
}

impl fmt::Display for SubmoduleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmoduleStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(SubmoduleStrategy::None),
            "normal" => Ok(SubmoduleStrategy::Normal),
            "recursive" => Ok(SubmoduleStrategy::Recursive),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// A resolved pointer from the main tree to an external repository's commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmoduleRef {
    /// Checkout directory, relative to the workdir.
    pub path: PathBuf,

    pub url: String,

    /// Commit, tag or branch to check out.
    pub revision: String,
}

/// Commands that compile the dependency after checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyBuild {
    /// Directory inside the dependency, created if missing.
    pub build_dir: PathBuf,

    /// Shell commands; `{jobs}` expands to the host's available parallelism.
    pub commands: Vec<String>,
}

/// Outcome of the dependency fetch phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyResult {
    pub path: PathBuf,

    pub strategy: SubmoduleStrategy,

    /// Commit checked out, when known.
    pub revision: Option<String>,

    pub outcome: StageOutcome,

    pub failure: Option<StageFailure>,

    pub commands: Vec<CommandRecord>,

    /// Combined output of the git and build commands.
    pub output: String,

    pub duration_ms: u64,
}

impl DependencyResult {
    pub fn passed(&self) -> bool {
        self.outcome == StageOutcome::Passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "normal".parse::<SubmoduleStrategy>().unwrap(),
            SubmoduleStrategy::Normal
        );
        assert_eq!(
            "RECURSIVE".parse::<SubmoduleStrategy>().unwrap(),
            SubmoduleStrategy::Recursive
        );
        assert_eq!(
            "none".parse::<SubmoduleStrategy>().unwrap(),
            SubmoduleStrategy::None
        );
        assert!("shallow".parse::<SubmoduleStrategy>().is_err());
    }

    #[test]
    fn test_strategy_default_is_normal() {
        assert_eq!(SubmoduleStrategy::default(), SubmoduleStrategy::Normal);
        assert_eq!(SubmoduleStrategy::default().to_string(), "normal");
    }
}
