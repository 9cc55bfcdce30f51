//! Error types for memloom-core

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for memloom-core
#[derive(Error, Debug)]
pub enum Error {
    /// A required argument is absent or malformed
    #[error("invalid input: {0}")]
    Input(String),

    /// A referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Model fingerprinting errors
    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    /// Registry document errors
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An illegal chunk lifecycle transition
    #[error("invalid transition for {chunk_id}: {from} -> {to}")]
    InvalidTransition {
        chunk_id: String,
        from: &'static str,
        to: &'static str,
    },

    /// The data directory is already owned by another process
    #[error("data directory is locked by another process: {}", .0.display())]
    DataDirLocked(PathBuf),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking background task failed to complete
    #[error("background task failed: {0}")]
    Background(String),
}

/// Fingerprinting errors.
///
/// Missing weight files and unreadable configuration are degradations, not
/// errors; the only hard failure is I/O on the file selected for
/// checksumming.
#[derive(Error, Debug)]
pub enum FingerprintError {
    /// Reading the selected weight file failed
    #[error("failed to read weight file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Inspecting the selected weight file failed
    #[error("failed to inspect weight file {}: {source}", .path.display())]
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Registry document errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The on-disk document exists but could not be parsed. The file is left
    /// untouched for operator inspection; all writes to this registry are
    /// refused until it is repaired or removed.
    #[error(
        "registry document {} is corrupt; writes disabled until the file is repaired or removed",
        .path.display()
    )]
    Poisoned { path: PathBuf },

    /// A record could not be serialized for persistence
    #[error("failed to serialize registry record {id}: {source}")]
    Serialize {
        id: String,
        source: serde_json::Error,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the config file failed
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file is not valid TOML
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
