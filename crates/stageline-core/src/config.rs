//! `stageline.toml` configuration.
//!
//! Every section has defaults that reproduce the stock pipeline, so a
//! missing file (or an empty one) means: fetch `dynamorio/`, run
//! `format -> build -> test` with cargo, and cache `dynamorio/`, `cargo/`
//! and `target/`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::definition::PipelineDefinition;
use crate::error::ConfigError;
use crate::stage::{Stage, StageKind};
use crate::submodule::{DependencyBuild, SubmoduleStrategy, SUBMODULE_STRATEGY_VAR};
use crate::vars::resolve_variables;

/// Default configuration file name, looked up in the workdir.
pub const CONFIG_FILE_NAME: &str = "stageline.toml";

/// Template written by `stageline init`.
pub const CONFIG_TEMPLATE: &str = r#"[project]
name = "b7"

[variables]
CARGO_HOME = "$CI_PROJECT_DIR/cargo"
GIT_SUBMODULE_STRATEGY = "normal"

[submodule]
path = "dynamorio"
# url and revision default to .gitmodules and the commit pinned in HEAD
# url = "https://github.com/DynamoRIO/dynamorio.git"
# revision = "release_7.0.0"
build_dir = "build"
# build = ["cmake .. -DDISABLE_WARNINGS=yes", "make -j {jobs}"]

[cache]
enabled = true
root = ".stageline/cache"

[[cache.entries]]
name = "dynamorio"
path = "dynamorio"
save_after = "fetch"

[[cache.entries]]
name = "cargo"
path = "cargo"
save_after = "build"

[[cache.entries]]
name = "target"
path = "target"
save_after = "build"

[[stages]]
name = "format"
script = ["cargo fmt --all -- --check"]
allow_failure = true

[[stages]]
name = "build"
script = ["cargo build --verbose"]
env = { RUST_BACKTRACE = "1" }

[[stages]]
name = "test"
script = ["rustc --version", "cargo --version", "cargo test --verbose"]
"#;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Defaults to the workdir's directory name.
    pub name: Option<String>,

    /// Defaults to the current git branch.
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SubmoduleConfig {
    pub enabled: bool,
    pub path: PathBuf,

    /// Falls back to the `.gitmodules` entry for `path`.
    pub url: Option<String>,

    /// Falls back to the gitlink recorded in the parent's HEAD.
    pub revision: Option<String>,

    pub build_dir: PathBuf,
    pub build: Vec<String>,
}

impl Default for SubmoduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("dynamorio"),
            url: None,
            revision: None,
            build_dir: PathBuf::from("build"),
            build: Vec::new(),
        }
    }
}

impl SubmoduleConfig {
    pub fn dependency_build(&self) -> Option<DependencyBuild> {
        if self.build.is_empty() {
            return None;
        }
        Some(DependencyBuild {
            build_dir: self.build_dir.clone(),
            commands: self.build.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Store location; relative paths are taken from the workdir.
    pub root: PathBuf,

    pub entries: Vec<CacheEntry>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from(".stageline/cache"),
            entries: CacheEntry::defaults(),
        }
    }
}

/// One `[[stages]]` table. Omitted fields take the stage's defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_failure: Option<bool>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub timeout_secs: u64,
}

impl StageConfig {
    fn from_kind(kind: StageKind) -> Self {
        Self {
            name: kind.name().to_string(),
            script: None,
            allow_failure: None,
            env: BTreeMap::new(),
            timeout_secs: 0,
        }
    }

    pub fn to_stage(&self) -> Result<Stage, ConfigError> {
        let kind: StageKind = self.name.parse()?;
        let mut stage = Stage::from_kind(kind).with_timeout(self.timeout_secs);
        if let Some(script) = &self.script {
            stage = stage.with_script(script.iter().cloned());
        }
        if let Some(allow_failure) = self.allow_failure {
            stage = stage.with_allow_failure(allow_failure);
        }
        for (key, value) in &self.env {
            stage = stage.with_env(key.clone(), value.clone());
        }
        Ok(stage)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub project: ProjectConfig,
    pub variables: BTreeMap<String, String>,
    pub submodule: SubmoduleConfig,
    pub cache: CacheConfig,
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut variables = BTreeMap::new();
        variables.insert("CARGO_HOME".to_string(), "$CI_PROJECT_DIR/cargo".to_string());
        variables.insert(SUBMODULE_STRATEGY_VAR.to_string(), "normal".to_string());
        Self {
            project: ProjectConfig::default(),
            variables,
            submodule: SubmoduleConfig::default(),
            cache: CacheConfig::default(),
            stages: StageKind::ORDER.iter().copied().map(StageConfig::from_kind).collect(),
        }
    }
}

impl PipelineConfig {
    /// Parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Parse `path` if it exists, otherwise use the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.definition()?;
        self.cache_entries()?;
        Ok(())
    }

    /// Build the validated stage sequence.
    pub fn definition(&self) -> Result<PipelineDefinition, ConfigError> {
        let stages = self
            .stages
            .iter()
            .map(StageConfig::to_stage)
            .collect::<Result<Vec<_>, _>>()?;
        PipelineDefinition::new(stages)
    }

    /// Cache entries, validated and checked for duplicate names.
    pub fn cache_entries(&self) -> Result<Vec<CacheEntry>, ConfigError> {
        let mut seen = HashSet::new();
        for entry in &self.cache.entries {
            entry.validate()?;
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateCacheEntry(entry.name.clone()));
            }
        }
        Ok(self.cache.entries.clone())
    }

    pub fn cache_root(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.cache.root)
    }

    pub fn project_name(&self, workdir: &Path) -> String {
        self.project
            .name
            .clone()
            .or_else(|| {
                workdir
                    .canonicalize()
                    .ok()
                    .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            })
            .unwrap_or_else(|| "project".to_string())
    }

    /// Resolve `[variables]` against the built-in variables.
    pub fn resolve_variables(
        &self,
        builtins: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ConfigError> {
        resolve_variables(&self.variables, builtins)
    }

    /// Checkout strategy from the resolved `GIT_SUBMODULE_STRATEGY` variable.
    pub fn submodule_strategy(
        variables: &BTreeMap<String, String>,
    ) -> Result<SubmoduleStrategy, ConfigError> {
        variables
            .get(SUBMODULE_STRATEGY_VAR)
            .map(|s| s.parse())
            .unwrap_or(Ok(SubmoduleStrategy::Normal))
    }
}
