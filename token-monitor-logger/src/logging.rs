use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs::OpenOptions, sync::Mutex};
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    prelude::*,
    EnvFilter, Registry,
};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Plain,
}

/// Where log records are written. Transfers themselves go to stdout, so the default
/// keeps diagnostics on stderr.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    #[default]
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// A level (`info`) or a full filter directive (`info,token_monitor_connector=debug`).
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
        }
    }
}

/// `RUST_LOG` wins over the configured level. An unparsable level falls back to `info`.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global tracing subscriber described by `config`.
///
/// Fails if the log file cannot be opened or a global subscriber is already set.
pub fn init(config: &LogConfig) -> Result<()> {
    init_with_filter(config, env_filter(config))
}

fn init_with_filter(config: &LogConfig, filter: EnvFilter) -> Result<()> {
    let (writer, ansi) = match config.output {
        LogOutput::Stdout => (BoxMakeWriter::new(std::io::stdout), true),
        LogOutput::Stderr => (BoxMakeWriter::new(std::io::stderr), true),
        LogOutput::File => {
            let file_path = config.file_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!("Log output is 'file' but 'file_path' is not specified")
            })?;
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)
                .with_context(|| format!("Failed to open log file {file_path}"))?;
            (BoxMakeWriter::new(Mutex::new(log_file)), false)
        }
    };

    let subscriber = Registry::default().with(filter);
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
    match config.format {
        LogFormat::Json => subscriber.with(layer.json()).try_init(),
        LogFormat::Plain => subscriber.with(layer.pretty()).try_init(),
    }
    .context("Failed to install the tracing subscriber")?;

    Ok(())
}
