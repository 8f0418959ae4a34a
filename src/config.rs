// src/config.rs
//
// =============================================================================
// RAILYARD: CONFIGURATION LAYERING
// =============================================================================
//
// CLI flags always win; an optional TOML file fills in anything a flag
// left at its clap default; built-in defaults are the floor. Implemented
// with the `config` crate rather than hand-rolled merging, the same way
// the rest of this codebase reaches for an ecosystem crate instead of
// rolling its own.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
pub struct MasterFileConfig {
    pub listen: Option<String>,
    pub store: Option<String>,
    pub retention_days: Option<i64>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct WorkerFileConfig {
    pub master_url: Option<String>,
    pub auth_token: Option<String>,
    pub max_concurrent_jobs: Option<usize>,
    pub engines: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

pub fn load_master_file(path: Option<&Path>) -> anyhow::Result<MasterFileConfig> {
    load_file(path)
}

pub fn load_worker_file(path: Option<&Path>) -> anyhow::Result<WorkerFileConfig> {
    load_file(path)
}

fn load_file<T: for<'de> Deserialize<'de> + Default>(path: Option<&Path>) -> anyhow::Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    if !path.exists() {
        anyhow::bail!("config file {} not found", path.display());
    }
    let settings = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml))
        .build()?;
    Ok(settings.try_deserialize()?)
}

/// Picks the CLI value if present, else the file value, else the default.
pub fn layer<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}
