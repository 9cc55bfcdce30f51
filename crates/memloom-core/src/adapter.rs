//! Adapter (LoRA) records.
//!
//! An adapter is the fine-tuned delta produced from one or more chunks,
//! bound to exactly one base model identity. The binding is immutable: when
//! the operator switches models, adapters trained against the previous model
//! are marked unusable rather than rebound.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_iso;
use crate::error::Result;
use crate::registry::RegistryTable;

const REGISTRY_FILE: &str = "lora_registry.json";

/// Lifecycle state of an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    #[default]
    Active,
    /// The base model changed; the adapter is semantically invalid.
    Unusable,
    Deleted,
}

impl AdapterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unusable => "unusable",
            Self::Deleted => "deleted",
        }
    }
}

/// A trained adapter and its relationships to chunks and models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterRecord {
    pub lora_id: String,
    pub created_at: String,
    /// The model that was current at creation time; immutable thereafter.
    pub model_identity_hash: Option<String>,
    /// Display snapshot of the model at creation time.
    pub model_name: Option<String>,
    pub model_type: Option<String>,
    /// Chunks consumed to produce this adapter.
    pub chunk_ids: Vec<String>,
    /// Directory holding the adapter artifact files.
    pub path: Option<String>,
    pub status: AdapterStatus,
    pub training_config: Value,
    pub metrics: Value,
    pub notes: String,
    pub unusable_reason: Option<String>,
    pub marked_unusable_at: Option<String>,
    pub deleted_at: Option<String>,
}

impl Default for AdapterRecord {
    fn default() -> Self {
        Self {
            lora_id: String::new(),
            created_at: String::new(),
            model_identity_hash: None,
            model_name: None,
            model_type: None,
            chunk_ids: Vec::new(),
            path: None,
            status: AdapterStatus::Active,
            training_config: Value::Object(serde_json::Map::new()),
            metrics: Value::Object(serde_json::Map::new()),
            notes: String::new(),
            unusable_reason: None,
            marked_unusable_at: None,
            deleted_at: None,
        }
    }
}

/// The adapter registry.
#[derive(Debug)]
pub struct AdapterStore {
    registry: RegistryTable<AdapterRecord>,
}

impl AdapterStore {
    pub fn open(loras_dir: &Path) -> Result<Self> {
        fs::create_dir_all(loras_dir)?;
        let registry = RegistryTable::load(loras_dir.join(REGISTRY_FILE));
        Ok(Self { registry })
    }

    pub fn is_poisoned(&self) -> bool {
        self.registry.is_poisoned()
    }

    pub fn ensure_writable(&self) -> Result<()> {
        self.registry.ensure_writable()
    }

    /// Allocate the next `lora_NNNN` id. The id is only persisted once the
    /// corresponding record is inserted and saved.
    pub fn allocate_id(&mut self) -> String {
        self.registry.next_id("lora")
    }

    pub fn insert(&mut self, record: AdapterRecord) -> Result<()> {
        self.registry.insert(record.lora_id.clone(), record);
        self.registry.save()
    }

    pub fn get(&self, lora_id: &str) -> Option<&AdapterRecord> {
        self.registry.get(lora_id)
    }

    /// Mark an adapter unusable. Returns the updated record, `None` when the
    /// id is unknown.
    pub fn mark_unusable(&mut self, lora_id: &str, reason: &str) -> Result<Option<AdapterRecord>> {
        self.registry.ensure_writable()?;
        let Some(record) = self.registry.get_mut(lora_id) else {
            return Ok(None);
        };
        record.status = AdapterStatus::Unusable;
        record.unusable_reason = Some(reason.to_string());
        record.marked_unusable_at = Some(now_iso());
        let updated = record.clone();
        self.registry.save()?;
        Ok(Some(updated))
    }

    /// Mark an adapter deleted. Returns the updated record, `None` when the
    /// id is unknown.
    pub fn mark_deleted(&mut self, lora_id: &str) -> Result<Option<AdapterRecord>> {
        self.registry.ensure_writable()?;
        let Some(record) = self.registry.get_mut(lora_id) else {
            return Ok(None);
        };
        record.status = AdapterStatus::Deleted;
        record.deleted_at = Some(now_iso());
        let updated = record.clone();
        self.registry.save()?;
        Ok(Some(updated))
    }

    /// All adapters, newest first.
    pub fn list(&self, include_deleted: bool) -> Vec<AdapterRecord> {
        let mut records: Vec<AdapterRecord> = self
            .registry
            .records()
            .filter(|(_, record)| include_deleted || record.status != AdapterStatus::Deleted)
            .map(|(_, record)| record.clone())
            .collect();
        sort_newest_first(&mut records);
        records
    }

    /// ACTIVE adapters bound to `target_model`, newest first. An adapter
    /// invalidated by a switch stays unusable even when its model becomes
    /// current again; re-activation is not something the core does.
    pub fn compatible(&self, target_model: &str) -> Vec<AdapterRecord> {
        let mut records: Vec<AdapterRecord> = self
            .registry
            .records()
            .filter(|(_, record)| record.status == AdapterStatus::Active)
            .filter(|(_, record)| record.model_identity_hash.as_deref() == Some(target_model))
            .map(|(_, record)| record.clone())
            .collect();
        sort_newest_first(&mut records);
        records
    }

    /// Ids of ACTIVE adapters bound to `model`, ascending id order.
    pub fn active_for_model(&self, model: &str) -> Vec<String> {
        self.registry
            .records()
            .filter(|(_, record)| record.status == AdapterStatus::Active)
            .filter(|(_, record)| record.model_identity_hash.as_deref() == Some(model))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// ACTIVE adapters whose target model is not the current one. A nonzero
    /// count means a crash interrupted a switch before the invalidation pass
    /// finished; the next switch reconciles it.
    pub fn stale_active(&self, current_model: Option<&str>) -> usize {
        self.registry
            .records()
            .filter(|(_, record)| record.status == AdapterStatus::Active)
            .filter(|(_, record)| record.model_identity_hash.as_deref() != current_model)
            .count()
    }

    pub fn total(&self) -> usize {
        self.registry.record_count()
    }

    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (_, record) in self.registry.records() {
            *counts
                .entry(record.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        counts
    }
}

fn sort_newest_first(records: &mut [AdapterRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.lora_id.cmp(&a.lora_id))
    });
}

/// Copy an adapter artifact tree into the managed layout. A single file is
/// copied into the destination directory; a directory is copied recursively.
pub fn copy_artifact_tree(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    if source.is_file() {
        let name = source.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no file name")
        })?;
        fs::copy(source, dest.join(name))?;
        return Ok(());
    }
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("artifact source not found: {}", source.display()),
        ));
    }
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_artifact_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
