//! Command handler modules for the seedline CLI.
//!
//! Shared startup helpers live here; command logic lives in the submodules.

pub mod migrate;

use anyhow::Result;
use seedline_config::{
    report_unused_keys, LoadedConfig, SeedlineConfig, UnusedKeyPolicy, DEFAULT_CONFIG_FILE,
};
use serde_json::Value;
use std::path::Path;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Load layered config. With no `--config`, `seedline.yaml` is used when it
/// exists; otherwise built-in defaults apply.
pub fn load_config(paths: &[String]) -> Result<LoadedConfig> {
    let mut refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    if refs.is_empty() && Path::new(DEFAULT_CONFIG_FILE).exists() {
        refs.push(DEFAULT_CONFIG_FILE);
    }
    seedline_config::load_layered_yaml(&refs)
}

/// RUST_LOG wins over `log.level`; `--quiet` wins over both.
/// Logs go to stderr so stdout stays machine-readable.
pub fn init_tracing(config: &SeedlineConfig, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("off")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn warn_unused_keys(config_json: &Value) -> Result<()> {
    let report = report_unused_keys(config_json, UnusedKeyPolicy::Warn)?;
    for key in &report.unused_leaf_pointers {
        warn!(key = %key, "unused config key");
    }
    Ok(())
}
