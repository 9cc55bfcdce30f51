//! Structured logging for memloom
//!
//! Uses `tracing` with configurable output formats and destinations.
//!
//! - **Pretty format**: human-friendly output for interactive use
//! - **JSON format**: machine-parseable JSON lines for CI and ops
//! - **File output**: optional log file for diagnostic bundles
//!
//! Initialize once at startup:
//!
//! ```ignore
//! use memloom_core::logging::{LogConfig, init_logging};
//!
//! init_logging(&LogConfig::default())?;
//! ```
//!
//! Use these field names consistently in spans and events: `identity_hash`,
//! `chunk_id`, `lora_id`, `status`, `operation`.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Global flag to track if logging has been initialized
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// Can be overridden by the RUST_LOG environment variable.
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional path to a log file. When set, logs are written to this file
    /// instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),
}

/// Initialize the global tracing subscriber.
///
/// Safe to call once per process; subsequent calls return
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|_| LogError::InvalidLevel(config.level.clone()))?;

    let file_writer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Some(OpenOptions::new().create(true).append(true).open(path)?)
        }
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let init_result = match (config.format, file_writer) {
        (LogFormat::Pretty, None) => registry
            .with(fmt::layer().with_writer(io::stderr))
            .try_init(),
        (LogFormat::Pretty, Some(file)) => {
            registry.with(fmt::layer().with_writer(file)).try_init()
        }
        (LogFormat::Json, None) => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init(),
        (LogFormat::Json, Some(file)) => registry
            .with(fmt::layer().json().with_writer(file))
            .try_init(),
    };
    init_result.map_err(|_| LogError::AlreadyInitialized)?;

    let _ = LOGGING_INITIALIZED.set(true);
    Ok(())
}
