//! Persisted env and facts snapshots.
//!
//! Two files are maintained: an env file of `export NAME="value"` lines meant
//! to be sourced by shell tooling, and a facts file of `name:value` lines.
//! Both are sorted by name and rewritten wholesale on every update. There is
//! no locking; writers must be serialized by the caller.

use log::debug;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_ENV_FILE: &str = "/etc/nodeward/env";
pub const DEFAULT_FACTS_FILE: &str = "/etc/nodeward/node_info";

#[derive(Debug, Error)]
pub enum FactsError {
    #[error("creating directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Locations of the two snapshot files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactsPaths {
    pub env_file: PathBuf,
    pub facts_file: PathBuf,
}

impl Default for FactsPaths {
    fn default() -> Self {
        Self {
            env_file: PathBuf::from(DEFAULT_ENV_FILE),
            facts_file: PathBuf::from(DEFAULT_FACTS_FILE),
        }
    }
}

impl FactsPaths {
    /// Defaults, overridden by `NODEWARD_ENV_FILE` / `NODEWARD_FACTS_FILE`.
    pub fn from_env() -> Self {
        let mut paths = Self::default();
        if let Some(path) = std::env::var_os("NODEWARD_ENV_FILE").filter(|p| !p.is_empty()) {
            paths.env_file = PathBuf::from(path);
        }
        if let Some(path) = std::env::var_os("NODEWARD_FACTS_FILE").filter(|p| !p.is_empty()) {
            paths.facts_file = PathBuf::from(path);
        }
        paths
    }
}

/// Render `export NAME="value"` lines, sorted by name.
pub fn render_env(vars: &Map<String, Value>) -> String {
    sorted(vars)
        .into_iter()
        .map(|(name, value)| format!("export {}=\"{}\"\n", name, escape_double_quoted(&value)))
        .collect()
}

/// Render `name:value` lines, sorted by name.
pub fn render_facts(facts: &Map<String, Value>) -> String {
    sorted(facts)
        .into_iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect()
}

pub fn write_env_file(path: &Path, vars: &Map<String, Value>) -> Result<(), FactsError> {
    write_snapshot(path, &render_env(vars))
}

pub fn write_facts_file(path: &Path, facts: &Map<String, Value>) -> Result<(), FactsError> {
    write_snapshot(path, &render_facts(facts))
}

fn sorted(map: &Map<String, Value>) -> BTreeMap<&str, String> {
    map.iter()
        .map(|(name, value)| (name.as_str(), snapshot_text(value)))
        .collect()
}

/// Strings are written bare, `null` as nothing, everything else as JSON text.
/// Zero and `false` are facts too and are kept as written.
fn snapshot_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Keep the value literal inside a double-quoted shell word.
fn escape_double_quoted(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn write_snapshot(path: &Path, contents: &str) -> Result<(), FactsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| FactsError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| FactsError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Wrote {} ({} bytes)", path.display(), contents.len());
    Ok(())
}
