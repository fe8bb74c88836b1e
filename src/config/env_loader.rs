//! Environment file (`.env` / `env_file:`) loading.
//!
//! Two distinct consumers:
//!
//! - the interpolation lookup reads a `.env` file next to the first
//!   manifest, layered under the process environment;
//! - each service's `env_file:` list is loaded at create time, later files
//!   overriding earlier ones, with the inline `environment:` mapping
//!   winning over both.

use std::collections::HashMap;
use std::path::Path;

use crate::config::interpolation::EnvironmentLookup;
use crate::config::shapes::Environment;
use crate::error::{Error, Result};

/// Load a single `K=V` file. Comments (`#`) and blank lines are ignored,
/// quoted values are unquoted; dotenvy does the parsing.
pub fn load_env_file<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(Error::InvalidManifest(format!(
            "environment file not found: {}",
            path.display()
        )));
    }

    let mut env_vars = HashMap::new();
    let iter = dotenvy::from_path_iter(path).map_err(|e| {
        Error::InvalidManifest(format!(
            "failed to read environment file {}: {e}",
            path.display()
        ))
    })?;
    for item in iter {
        let (key, value) = item.map_err(|e| {
            Error::InvalidManifest(format!(
                "failed to parse environment file {}: {e}",
                path.display()
            ))
        })?;
        validate_env_name(&key)?;
        env_vars.insert(key, value);
    }

    Ok(env_vars)
}

/// Load and merge a service's `env_file:` list. Later files override
/// earlier ones. Paths are resolved relative to the manifest directory.
pub fn load_env_files<P: AsRef<Path>>(
    paths: &[String],
    base_dir: P,
) -> Result<HashMap<String, String>> {
    let base_dir = base_dir.as_ref();
    let mut merged = HashMap::new();

    for path_str in paths {
        let path = base_dir.join(path_str);
        merged.extend(load_env_file(&path)?);
    }

    Ok(merged)
}

/// Merge a service's effective environment. Priority, highest first:
/// inline `environment:` entries, `env_file` values, then the caller's
/// lookup for entries declared without a value.
pub fn effective_environment(
    inline: &Environment,
    from_files: HashMap<String, String>,
    lookup: &dyn EnvironmentLookup,
    service: &str,
) -> Vec<String> {
    let mut merged: HashMap<String, String> = from_files;

    for (key, value) in &inline.0 {
        match value {
            Some(v) => {
                merged.insert(key.clone(), v.clone());
            }
            // `- KEY` without a value inherits from the caller environment;
            // an unset variable drops the entry entirely.
            None => match lookup.lookup(key, Some(service)) {
                Some(v) => {
                    merged.insert(key.clone(), v);
                }
                None => {
                    merged.remove(key);
                }
            },
        }
    }

    let mut pairs: Vec<String> = merged
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    pairs.sort();
    pairs
}

/// POSIX environment variable name check: letter or underscore first, then
/// alphanumerics and underscores.
pub fn validate_env_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidManifest(format!(
            "invalid environment variable name {name:?}"
        )));
    }
    Ok(())
}

/// Interpolation lookup that layers a `.env` file under the process
/// environment: real environment variables win, the file supplies
/// defaults.
pub struct DotEnvLookup {
    file: HashMap<String, String>,
}

impl DotEnvLookup {
    /// Load `.env` from the directory holding the first manifest. A missing
    /// file yields an empty layer; a malformed one is an error.
    pub fn beside<P: AsRef<Path>>(manifest_path: P) -> Result<Self> {
        let dir = manifest_path
            .as_ref()
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let dotenv = dir.join(".env");
        let file = if dotenv.exists() {
            load_env_file(&dotenv)?
        } else {
            HashMap::new()
        };
        Ok(DotEnvLookup { file })
    }
}

impl EnvironmentLookup for DotEnvLookup {
    fn lookup(&self, name: &str, _service: Option<&str>) -> Option<String> {
        std::env::var(name).ok().or_else(|| self.file.get(name).cloned())
    }
}
