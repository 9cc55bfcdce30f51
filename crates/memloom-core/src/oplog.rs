//! Append-only operation log.
//!
//! Every significant mutation is recorded as one JSON line in
//! `operations.jsonl`: `{timestamp, operation, details}`. The log is a
//! diagnostic trail, not a source of truth; the registries stay
//! authoritative, and a failed append never fails the operation that
//! produced it.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::clock::now_iso;

/// Operations recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ModelRegistered,
    ModelSwitch,
    ChunkCreated,
    ChunkStatusChanged,
    LoraRegistered,
    LoraMarkedUnusable,
    LoraDeleted,
    ChunksRestored,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModelRegistered => "model_registered",
            Self::ModelSwitch => "model_switch",
            Self::ChunkCreated => "chunk_created",
            Self::ChunkStatusChanged => "chunk_status_changed",
            Self::LoraRegistered => "lora_registered",
            Self::LoraMarkedUnusable => "lora_marked_unusable",
            Self::LoraDeleted => "lora_deleted",
            Self::ChunksRestored => "chunks_restored",
        }
    }
}

/// One log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEntry {
    pub timestamp: String,
    pub operation: String,
    #[serde(default)]
    pub details: Value,
}

/// The append-only log file. Appends are serialized under a dedicated lock
/// to preserve line atomicity.
#[derive(Debug)]
pub struct OperationLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl OperationLog {
    pub fn new(history_dir: &std::path::Path) -> Self {
        Self {
            path: history_dir.join("operations.jsonl"),
            append_lock: Mutex::new(()),
        }
    }

    /// Append one entry. Failures are logged and swallowed: losing a
    /// diagnostic line must not abort the mutation it describes.
    pub fn record(&self, operation: Operation, details: Value) {
        let entry = OperationEntry {
            timestamp: now_iso(),
            operation: operation.as_str().to_string(),
            details,
        };
        if let Err(err) = self.append(&entry) {
            warn!(
                operation = operation.as_str(),
                error = %err,
                "Failed to append to operation log"
            );
        }
    }

    fn append(&self, entry: &OperationEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Read the last `limit` entries, skipping malformed lines.
    pub fn tail(&self, limit: usize) -> crate::Result<Vec<OperationEntry>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let entries: Vec<OperationEntry> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
