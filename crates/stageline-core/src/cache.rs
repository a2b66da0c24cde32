//! Cache entries and the keys they are stored under.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::state::Phase;

/// Scope of a cache snapshot: one project on one branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub project: String,
    pub branch: String,
}

impl CacheKey {
    pub fn new(project: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            branch: branch.into(),
        }
    }

    /// Key components made safe to use as directory names.
    ///
    /// Names made only of `[A-Za-z0-9._-]` are kept as they are. Anything
    /// else is cleaned up and suffixed with `~` and a digest of the raw name,
    /// so `feature/x` and `feature-x` stay apart.
    pub fn components(&self) -> (String, String) {
        (sanitize(&self.project), sanitize(&self.branch))
    }
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    let cleaned = if cleaned.is_empty() { "_" } else { cleaned };
    if cleaned == component {
        return cleaned.to_string();
    }
    // `~` never survives cleaning, so suffixed names cannot collide with kept ones.
    let digest = hex::encode(Sha256::digest(component.as_bytes()));
    format!("{cleaned}~{}", &digest[..12])
}

/// A directory tree persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub name: String,

    /// Path relative to the workdir.
    pub path: PathBuf,

    /// Saved once this phase finishes successfully.
    pub save_after: Phase,
}

impl CacheEntry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, save_after: Phase) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            save_after,
        }
    }

    /// The three entries of the default pipeline.
    pub fn defaults() -> Vec<CacheEntry> {
        vec![
            CacheEntry::new("dynamorio", "dynamorio", Phase::Fetch),
            CacheEntry::new("cargo", "cargo", Phase::Build),
            CacheEntry::new("target", "target", Phase::Build),
        ]
    }

    /// Reject absolute paths and paths escaping the workdir.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidCachePath {
            name: self.name.clone(),
            path: self.path.display().to_string(),
        };
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(invalid());
        }
        if self.path.as_os_str().is_empty() || self.path.is_absolute() {
            return Err(invalid());
        }
        if self
            .path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(invalid());
        }
        Ok(())
    }

    pub fn resolve(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.path)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheOperation {
    Restore,
    Save,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    Saved,
    /// Nothing to save (source directory absent).
    Skipped,
    /// The store reported an error; the run carried on.
    Error,
}

/// One cache operation performed during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheRecord {
    pub entry: String,
    pub operation: CacheOperation,
    pub outcome: CacheOutcome,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_components_sanitized() {
        let key = CacheKey::new("b7", "master");
        assert_eq!(key.components(), ("b7".to_string(), "master".to_string()));

        let (_, branch) = CacheKey::new("b7", "feature/perf counters").components();
        assert!(branch.starts_with("feature-perf-counters~"));
        assert!(!branch.contains('/'));

        let (project, branch) = CacheKey::new("..", "").components();
        assert!(project.starts_with("_~"));
        assert!(branch.starts_with("_~"));
    }

    #[test]
    fn test_distinct_branches_get_distinct_directories() {
        let slash = CacheKey::new("b7", "feature/x").components();
        let dash = CacheKey::new("b7", "feature-x").components();
        assert_eq!(dash.1, "feature-x");
        assert_ne!(slash, dash);
        assert_eq!(slash, CacheKey::new("b7", "feature/x").components());
    }

    #[test]
    fn test_default_entries() {
        let entries = CacheEntry::defaults();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["dynamorio", "cargo", "target"]);
        assert_eq!(entries[0].save_after, Phase::Fetch);
        assert_eq!(entries[2].save_after, Phase::Build);
    }

    #[test]
    fn test_validate_rejects_escaping_paths() {
        assert!(CacheEntry::new("t", "target", Phase::Build).validate().is_ok());
        assert!(CacheEntry::new("t", "./build/out", Phase::Build).validate().is_ok());
        assert!(CacheEntry::new("t", "../outside", Phase::Build).validate().is_err());
        assert!(CacheEntry::new("t", "/abs", Phase::Build).validate().is_err());
        assert!(CacheEntry::new("a/b", "x", Phase::Build).validate().is_err());
        assert!(CacheEntry::new("t", "", Phase::Build).validate().is_err());
    }
}
