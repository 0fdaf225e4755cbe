use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use token_monitor_connector::{config::MonitorConfig, workers::MonitorTarget, MonitorError};
use token_monitor_logger::LogConfig;

/// The top-level configuration of the `token-monitor` binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub connector: MonitorConfig,
    pub log: LogConfig,
    pub output: OutputFormat,
    pub targets: TargetsConfig,
    /// How long Ctrl+C waits for in-flight transactions before exiting anyway.
    pub shutdown_timeout_ms: u64,
}

impl AppConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connector: MonitorConfig::default(),
            log: LogConfig::default(),
            output: OutputFormat::default(),
            targets: TargetsConfig::default(),
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// How detected transfers are printed.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// A human-readable block per transfer.
    #[default]
    Console,
    /// One JSON document per line.
    Json,
}

/// The mints to monitor when none is given on the command line.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TargetsConfig {
    pub monitor_all: bool,
    pub mints: Vec<String>,
}

/// Environment variables prefixed with `TOKEN_MONITOR__`, `__` between path segments.
///
/// `TOKEN_MONITOR__TARGETS__MINTS` is read as a comma-separated list.
pub fn environment() -> config::Environment {
    config::Environment::with_prefix("TOKEN_MONITOR")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("targets.mints")
        .try_parsing(true)
}

/// Loads the configuration: defaults, then the optional TOML file at `path`, then the
/// process environment.
pub fn load_config(path: Option<&str>) -> Result<AppConfig> {
    build_config(path, environment())
}

/// Like [`load_config`] with an explicit environment source.
pub fn build_config(path: Option<&str>, environment: config::Environment) -> Result<AppConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path));
    }

    let settings: AppConfig = builder
        .add_source(environment)
        .build()
        .context(format!(
            "Failed to build configuration from '{}'",
            path.unwrap_or("environment")
        ))?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    Ok(settings)
}

/// Picks the monitor targets: the command-line mint, then `monitor_all`, then the
/// configured mints. Without any of them every mint is monitored.
pub fn resolve_targets(
    cli_mint: Option<&str>,
    targets: &TargetsConfig,
) -> Result<Vec<MonitorTarget>, MonitorError> {
    if let Some(mint) = cli_mint {
        return Ok(vec![MonitorTarget::mint(mint)?]);
    }
    if targets.monitor_all {
        return Ok(vec![MonitorTarget::AllMints]);
    }

    let mut resolved = Vec::new();
    for mint in targets.mints.iter().filter(|m| !m.trim().is_empty()) {
        let target = MonitorTarget::mint(mint)?;
        if !resolved.contains(&target) {
            resolved.push(target);
        }
    }
    if resolved.is_empty() {
        resolved.push(MonitorTarget::AllMints);
    }
    Ok(resolved)
}
