//! Pipeline variables and `$VAR` / `${VAR}` expansion.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::ConfigError;

pub const CI_PROJECT_DIR: &str = "CI_PROJECT_DIR";
pub const CI_COMMIT_SHA: &str = "CI_COMMIT_SHA";
pub const CI_COMMIT_REF_NAME: &str = "CI_COMMIT_REF_NAME";

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("variable pattern is valid")
    })
}

/// Resolve user variables against each other and the built-in variables.
///
/// References to unknown names are left untouched. A variable may refer to
/// its own name, which reads the built-in (or process) value, so
/// `PATH = "$PATH:/opt/bin"` works. Cycles between distinct variables are
/// rejected.
pub fn resolve_variables(
    raw: &BTreeMap<String, String>,
    builtins: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut resolved = builtins.clone();
    let mut cache = BTreeMap::new();
    for name in raw.keys() {
        let value = resolve_one(name, raw, builtins, &mut cache, &mut Vec::new())?;
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

fn resolve_one(
    name: &str,
    raw: &BTreeMap<String, String>,
    builtins: &BTreeMap<String, String>,
    cache: &mut BTreeMap<String, String>,
    visiting: &mut Vec<String>,
) -> Result<String, ConfigError> {
    if let Some(done) = cache.get(name) {
        return Ok(done.clone());
    }
    if visiting.iter().any(|v| v == name) {
        return Err(ConfigError::VariableCycle(name.to_string()));
    }
    let Some(template) = raw.get(name) else {
        return Ok(builtins.get(name).cloned().unwrap_or_default());
    };

    visiting.push(name.to_string());
    let mut error = None;
    let expanded = var_pattern().replace_all(template, |caps: &Captures<'_>| {
        let reference = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        if reference == name || !raw.contains_key(reference) {
            return builtins
                .get(reference)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string());
        }
        match resolve_one(reference, raw, builtins, cache, visiting) {
            Ok(value) => value,
            Err(e) => {
                error.get_or_insert(e);
                String::new()
            }
        }
    });
    let expanded = expanded.into_owned();
    visiting.pop();

    if let Some(e) = error {
        return Err(e);
    }
    cache.insert(name.to_string(), expanded.clone());
    Ok(expanded)
}
