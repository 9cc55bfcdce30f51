//! Data chunk lifecycle.
//!
//! A chunk is a batch of documents that entered the training pipeline. Its
//! source documents are preserved verbatim next to the chunk manifest so the
//! retrieval layer can reabsorb them whenever the adapter trained from the
//! chunk stops being valid.
//!
//! Lifecycle:
//!
//! ```text
//! PENDING -> TRAINING -> TRAINED -> RESTORED
//!                |           |          |
//!                +-> FAILED <+----------+   (FAILED/RESTORED may re-enter TRAINING)
//!
//! ARCHIVED is terminal and reachable from every settled state.
//! ```
//!
//! The registry is authoritative; the per-chunk `manifest.json` is a
//! convenience mirror rewritten on every status change.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::now_iso;
use crate::error::{Error, Result};
use crate::registry::{RegistryTable, write_document_atomic};

/// Preserved documents are open-shaped objects; the core never interprets
/// them beyond an optional `id` field.
pub type Document = Value;

const REGISTRY_FILE: &str = "chunk_registry.json";
const MANIFEST_FILE: &str = "manifest.json";
const DOCUMENTS_FILE: &str = "documents.json";

/// Lifecycle state of a data chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Initial state after creation; documents live in retrieval.
    #[default]
    Pending,
    /// A fine-tuning run has claimed this chunk.
    Training,
    /// Run completed; `lora_id` bound.
    Trained,
    /// Training errored; documents remain preserved and recoverable.
    Failed,
    /// Documents were handed back to the retrieval layer.
    Restored,
    /// Terminal; excluded from all working views.
    Archived,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Training => "training",
            Self::Trained => "trained",
            Self::Failed => "failed",
            Self::Restored => "restored",
            Self::Archived => "archived",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Archived
    }

    /// The permitted transition matrix. RESTORED -> RESTORED covers
    /// re-restoring a chunk that is still sitting in the restored state.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ChunkStatus::{Archived, Failed, Pending, Restored, Trained, Training};
        matches!(
            (self, next),
            (Pending, Training)
                | (Pending, Archived)
                | (Training, Trained)
                | (Training, Failed)
                | (Trained, Restored)
                | (Trained, Failed)
                | (Trained, Archived)
                | (Failed, Training)
                | (Failed, Restored)
                | (Failed, Archived)
                | (Restored, Training)
                | (Restored, Restored)
                | (Restored, Failed)
                | (Restored, Archived)
        )
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "training" => Ok(Self::Training),
            "trained" => Ok(Self::Trained),
            "failed" => Ok(Self::Failed),
            "restored" => Ok(Self::Restored),
            "archived" => Ok(Self::Archived),
            other => Err(Error::Input(format!("unknown chunk status: {other}"))),
        }
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only history line on a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub action: String,
    #[serde(default)]
    pub details: String,
}

/// A tracked batch of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChunk {
    pub chunk_id: String,
    pub created_at: String,
    pub status: ChunkStatus,
    /// Model that was current when the chunk was created.
    pub model_identity_hash: Option<String>,
    /// Populated when and only when the chunk reaches TRAINED.
    pub lora_id: Option<String>,
    pub document_ids: Vec<String>,
    pub document_count: u64,
    /// Optional categorization label.
    pub character: Option<String>,
    pub metadata: Value,
    pub history: Vec<HistoryEntry>,
}

impl Default for DataChunk {
    fn default() -> Self {
        Self {
            chunk_id: String::new(),
            created_at: String::new(),
            status: ChunkStatus::Pending,
            model_identity_hash: None,
            lora_id: None,
            document_ids: Vec::new(),
            document_count: 0,
            character: None,
            metadata: Value::Object(serde_json::Map::new()),
            history: Vec::new(),
        }
    }
}

impl DataChunk {
    fn push_history(&mut self, action: &str, details: String) {
        self.history.push(HistoryEntry {
            timestamp: now_iso(),
            action: action.to_string(),
            details,
        });
    }
}

/// A restorable chunk together with why it is restorable.
#[derive(Debug, Clone, Serialize)]
pub struct RestorableChunk {
    #[serde(flatten)]
    pub chunk: DataChunk,
    /// `model_mismatch` for TRAINED chunks bound to another model,
    /// otherwise the chunk's current status.
    pub restore_reason: String,
}

/// Chunk lifecycle manager: the registry plus the per-chunk directories.
#[derive(Debug)]
pub struct ChunkStore {
    dir: PathBuf,
    registry: RegistryTable<DataChunk>,
}

impl ChunkStore {
    pub fn open(chunks_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&chunks_dir)?;
        let registry = RegistryTable::load(chunks_dir.join(REGISTRY_FILE));
        Ok(Self {
            dir: chunks_dir,
            registry,
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.registry.is_poisoned()
    }

    pub fn ensure_writable(&self) -> Result<()> {
        self.registry.ensure_writable()
    }

    /// Create a chunk: allocate the next id, preserve the documents next to
    /// the manifest, then register it as PENDING under the given model.
    pub fn create(
        &mut self,
        documents: &[Document],
        model_identity_hash: Option<&str>,
        character: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<DataChunk> {
        self.registry.ensure_writable()?;

        let chunk_id = self.registry.next_id("chunk");
        let document_ids = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| document_id(doc, index))
            .collect();

        let mut chunk = DataChunk {
            chunk_id: chunk_id.clone(),
            created_at: now_iso(),
            status: ChunkStatus::Pending,
            model_identity_hash: model_identity_hash.map(str::to_string),
            document_ids,
            document_count: documents.len() as u64,
            character: character.map(str::to_string),
            metadata: metadata.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            ..DataChunk::default()
        };
        chunk.push_history("created", format!("{} documents", documents.len()));

        let chunk_dir = self.dir.join(&chunk_id);
        fs::create_dir_all(&chunk_dir)?;
        write_document_atomic(&chunk_dir.join(MANIFEST_FILE), &serde_json::to_value(&chunk)?)?;
        write_document_atomic(
            &chunk_dir.join(DOCUMENTS_FILE),
            &Value::Array(documents.to_vec()),
        )?;

        self.registry.insert(chunk_id, chunk.clone());
        self.registry.save()?;

        info!(
            chunk_id = %chunk.chunk_id,
            documents = documents.len(),
            model = chunk.model_identity_hash.as_deref().unwrap_or("none"),
            "Created chunk"
        );
        Ok(chunk)
    }

    /// Apply a validated status transition.
    ///
    /// An unknown chunk id is logged at warning level and ignored: downstream
    /// callers may report state for chunks the operator has removed, and that
    /// must not crash the system. Returns the updated chunk when applied.
    pub fn transition(
        &mut self,
        chunk_id: &str,
        new_status: ChunkStatus,
        details: &str,
    ) -> Result<Option<DataChunk>> {
        self.registry.ensure_writable()?;

        let Some(chunk) = self.registry.get_mut(chunk_id) else {
            warn!(chunk_id, status = new_status.as_str(), "Chunk not found in registry; ignoring transition");
            return Ok(None);
        };
        let from = chunk.status;
        if !from.can_transition_to(new_status) {
            return Err(Error::InvalidTransition {
                chunk_id: chunk_id.to_string(),
                from: from.as_str(),
                to: new_status.as_str(),
            });
        }

        chunk.status = new_status;
        chunk.push_history(new_status.as_str(), details.to_string());
        let updated = chunk.clone();

        self.registry.save()?;
        self.write_manifest(&updated);
        Ok(Some(updated))
    }

    pub fn mark_training(&mut self, chunk_id: &str) -> Result<Option<DataChunk>> {
        self.transition(chunk_id, ChunkStatus::Training, "Training started")
    }

    /// Bind the adapter id and mark TRAINED in one registry rewrite, so a
    /// crash can never leave a `lora_id` on a non-TRAINED chunk.
    pub fn mark_trained(&mut self, chunk_id: &str, lora_id: &str) -> Result<Option<DataChunk>> {
        self.registry.ensure_writable()?;

        let Some(chunk) = self.registry.get_mut(chunk_id) else {
            warn!(chunk_id, lora_id, "Chunk not found in registry; ignoring trained mark");
            return Ok(None);
        };
        let from = chunk.status;
        if !from.can_transition_to(ChunkStatus::Trained) {
            return Err(Error::InvalidTransition {
                chunk_id: chunk_id.to_string(),
                from: from.as_str(),
                to: ChunkStatus::Trained.as_str(),
            });
        }

        chunk.lora_id = Some(lora_id.to_string());
        chunk.status = ChunkStatus::Trained;
        chunk.push_history("trained", format!("Trained into LoRA {lora_id}"));
        let updated = chunk.clone();

        self.registry.save()?;
        self.write_manifest(&updated);
        Ok(Some(updated))
    }

    pub fn mark_failed(&mut self, chunk_id: &str, error: &str) -> Result<Option<DataChunk>> {
        self.transition(
            chunk_id,
            ChunkStatus::Failed,
            &format!("Training failed: {error}"),
        )
    }

    pub fn mark_restored(&mut self, chunk_id: &str) -> Result<Option<DataChunk>> {
        self.transition(
            chunk_id,
            ChunkStatus::Restored,
            "Documents restored to retrieval",
        )
    }

    /// Archive a chunk. Preserved documents may only be deleted here, once
    /// the chunk has left every working view.
    pub fn mark_archived(
        &mut self,
        chunk_id: &str,
        delete_documents: bool,
    ) -> Result<Option<DataChunk>> {
        let updated = self.transition(chunk_id, ChunkStatus::Archived, "Chunk archived")?;
        if updated.is_some() && delete_documents {
            let path = self.documents_path(chunk_id);
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != ErrorKind::NotFound {
                    warn!(chunk_id, error = %err, "Failed to delete preserved documents");
                }
            }
        }
        Ok(updated)
    }

    pub fn get(&self, chunk_id: &str) -> Option<&DataChunk> {
        self.registry.get(chunk_id)
    }

    pub fn documents_path(&self, chunk_id: &str) -> PathBuf {
        self.dir.join(chunk_id).join(DOCUMENTS_FILE)
    }

    /// Read the preserved documents for a chunk, `None` when absent.
    pub fn documents(&self, chunk_id: &str) -> Result<Option<Vec<Document>>> {
        let raw = match fs::read_to_string(self.documents_path(chunk_id)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Chunks filtered by status and/or model, newest first.
    pub fn by_status(
        &self,
        status: Option<ChunkStatus>,
        model_identity_hash: Option<&str>,
    ) -> Vec<DataChunk> {
        let mut chunks: Vec<DataChunk> = self
            .registry
            .records()
            .filter(|(_, chunk)| status.is_none_or(|s| chunk.status == s))
            .filter(|(_, chunk)| {
                model_identity_hash.is_none_or(|m| chunk.model_identity_hash.as_deref() == Some(m))
            })
            .map(|(_, chunk)| chunk.clone())
            .collect();
        chunks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.chunk_id.cmp(&a.chunk_id))
        });
        chunks
    }

    /// Chunks that have not been trained: PENDING, FAILED or RESTORED.
    pub fn untrained(&self) -> Vec<DataChunk> {
        self.registry
            .records()
            .filter(|(_, chunk)| {
                matches!(
                    chunk.status,
                    ChunkStatus::Pending | ChunkStatus::Failed | ChunkStatus::Restored
                )
            })
            .map(|(_, chunk)| chunk.clone())
            .collect()
    }

    /// Chunks whose documents can be handed back to the retrieval layer for
    /// `target_model`: FAILED, RESTORED, or TRAINED against a different
    /// model. Each candidate's preserved documents are verified to exist, so
    /// callers may safely restore any chunk returned here. Ascending id
    /// order (creation order).
    pub fn restorable(&self, target_model: Option<&str>) -> Vec<RestorableChunk> {
        let mut result = Vec::new();
        for (_, chunk) in self.registry.records() {
            let eligible = match chunk.status {
                ChunkStatus::Failed | ChunkStatus::Restored => true,
                ChunkStatus::Trained => chunk.model_identity_hash.as_deref() != target_model,
                _ => false,
            };
            if !eligible || !self.documents_path(&chunk.chunk_id).is_file() {
                continue;
            }
            let restore_reason = if chunk.status == ChunkStatus::Trained {
                "model_mismatch".to_string()
            } else {
                chunk.status.as_str().to_string()
            };
            result.push(RestorableChunk {
                chunk: chunk.clone(),
                restore_reason,
            });
        }
        result
    }

    /// Count of well-formed chunk records.
    pub fn total(&self) -> usize {
        self.registry.record_count()
    }

    /// Chunk counts keyed by status string.
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (_, chunk) in self.registry.records() {
            *counts.entry(chunk.status.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    fn write_manifest(&self, chunk: &DataChunk) {
        let path = self.dir.join(&chunk.chunk_id).join(MANIFEST_FILE);
        let value = match serde_json::to_value(chunk) {
            Ok(value) => value,
            Err(err) => {
                warn!(chunk_id = %chunk.chunk_id, error = %err, "Failed to serialize chunk manifest");
                return;
            }
        };
        if let Err(err) = write_document_atomic(&path, &value) {
            // The registry stays authoritative when the mirror diverges.
            warn!(chunk_id = %chunk.chunk_id, error = %err, "Failed to update chunk manifest");
        }
    }
}

fn document_id(doc: &Document, index: usize) -> String {
    match doc.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => index.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> ChunkStore {
        ChunkStore::open(dir.path().join("chunks")).unwrap()
    }

    fn docs() -> Vec<Document> {
        vec![json!({"id": "d1", "text": "x"}), json!({"text": "anonymous"})]
    }

    #[test]
    fn create_assigns_sequential_ids_and_pending_status() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let first = store.create(&docs(), Some("abc123"), None, None).unwrap();
        let second = store.create(&docs(), Some("abc123"), None, None).unwrap();

        assert_eq!(first.chunk_id, "chunk_0001");
        assert_eq!(second.chunk_id, "chunk_0002");
        assert_eq!(first.status, ChunkStatus::Pending);
        assert_eq!(first.document_count, 2);
        assert_eq!(first.document_ids, vec!["d1".to_string(), "1".to_string()]);
        assert_eq!(first.model_identity_hash.as_deref(), Some("abc123"));
        assert_eq!(first.history.len(), 1);
        assert_eq!(first.history[0].action, "created");
    }

    #[test]
    fn counter_survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open_store(&dir);
            store.create(&docs(), None, None, None).unwrap();
            store.create(&docs(), None, None, None).unwrap();
        }
        let mut store = open_store(&dir);
        let chunk = store.create(&docs(), None, None, None).unwrap();
        assert_eq!(chunk.chunk_id, "chunk_0003");
    }

    #[test]
    fn preserved_documents_roundtrip_exactly() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let documents = docs();
        let chunk = store.create(&documents, None, None, None).unwrap();

        let read_back = store.documents(&chunk.chunk_id).unwrap().unwrap();
        assert_eq!(read_back, documents);
    }

    #[test]
    fn transition_validates_matrix() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let chunk = store.create(&docs(), None, None, None).unwrap();

        // pending -> trained is illegal without a training claim
        let err = store
            .mark_trained(&chunk.chunk_id, "lora_0001")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        store.mark_training(&chunk.chunk_id).unwrap().unwrap();
        let trained = store
            .mark_trained(&chunk.chunk_id, "lora_0001")
            .unwrap()
            .unwrap();
        assert_eq!(trained.status, ChunkStatus::Trained);
        assert_eq!(trained.lora_id.as_deref(), Some("lora_0001"));
    }

    #[test]
    fn unknown_chunk_is_ignored_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        assert!(store.mark_training("chunk_9999").unwrap().is_none());
    }

    #[test]
    fn archived_is_terminal() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let chunk = store.create(&docs(), None, None, None).unwrap();
        store.mark_archived(&chunk.chunk_id, false).unwrap();

        let err = store.mark_training(&chunk.chunk_id).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn archiving_may_delete_preserved_documents() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let chunk = store.create(&docs(), None, None, None).unwrap();
        assert!(store.documents_path(&chunk.chunk_id).is_file());

        store.mark_archived(&chunk.chunk_id, true).unwrap();
        assert!(!store.documents_path(&chunk.chunk_id).is_file());
        assert!(store.documents(&chunk.chunk_id).unwrap().is_none());
    }

    #[test]
    fn restorable_requires_eligible_status_and_documents() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let failed = store.create(&docs(), Some("model_a"), None, None).unwrap();
        store.mark_training(&failed.chunk_id).unwrap();
        store.mark_failed(&failed.chunk_id, "oom").unwrap();

        let trained = store.create(&docs(), Some("model_a"), None, None).unwrap();
        store.mark_training(&trained.chunk_id).unwrap();
        store.mark_trained(&trained.chunk_id, "lora_0001").unwrap();

        let pending = store.create(&docs(), Some("model_a"), None, None).unwrap();

        // Against the same model only the failed chunk is restorable.
        let same = store.restorable(Some("model_a"));
        assert_eq!(same.len(), 1);
        assert_eq!(same[0].chunk.chunk_id, failed.chunk_id);
        assert_eq!(same[0].restore_reason, "failed");

        // Against another model the trained chunk becomes restorable too.
        let other = store.restorable(Some("model_b"));
        let ids: Vec<&str> = other.iter().map(|r| r.chunk.chunk_id.as_str()).collect();
        assert_eq!(ids, vec![failed.chunk_id.as_str(), trained.chunk_id.as_str()]);
        assert_eq!(other[1].restore_reason, "model_mismatch");
        assert!(!ids.contains(&pending.chunk_id.as_str()));

        // Without preserved documents the chunk drops out.
        fs::remove_file(store.documents_path(&failed.chunk_id)).unwrap();
        let after_delete = store.restorable(Some("model_b"));
        assert_eq!(after_delete.len(), 1);
        assert_eq!(after_delete[0].chunk.chunk_id, trained.chunk_id);
    }

    #[test]
    fn by_status_filters_and_sorts_newest_first() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let a = store.create(&docs(), Some("m1"), None, None).unwrap();
        let b = store.create(&docs(), Some("m2"), None, None).unwrap();

        let all = store.by_status(None, None);
        assert_eq!(all[0].chunk_id, b.chunk_id);
        assert_eq!(all[1].chunk_id, a.chunk_id);

        let only_m1 = store.by_status(None, Some("m1"));
        assert_eq!(only_m1.len(), 1);
        assert_eq!(only_m1[0].chunk_id, a.chunk_id);

        store.mark_training(&a.chunk_id).unwrap();
        let pending = store.by_status(Some(ChunkStatus::Pending), None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].chunk_id, b.chunk_id);
    }

    #[test]
    fn untrained_covers_pending_failed_restored() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let pending = store.create(&docs(), None, None, None).unwrap();
        let failed = store.create(&docs(), None, None, None).unwrap();
        store.mark_training(&failed.chunk_id).unwrap();
        store.mark_failed(&failed.chunk_id, "boom").unwrap();
        let trained = store.create(&docs(), None, None, None).unwrap();
        store.mark_training(&trained.chunk_id).unwrap();
        store.mark_trained(&trained.chunk_id, "lora_0001").unwrap();

        let untrained: Vec<String> = store
            .untrained()
            .into_iter()
            .map(|c| c.chunk_id)
            .collect();
        assert_eq!(untrained, vec![pending.chunk_id, failed.chunk_id]);
    }

    #[test]
    fn manifest_mirrors_registry_state() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let chunk = store.create(&docs(), None, None, None).unwrap();
        store.mark_training(&chunk.chunk_id).unwrap();

        let manifest_path = dir
            .path()
            .join("chunks")
            .join(&chunk.chunk_id)
            .join("manifest.json");
        let manifest: DataChunk =
            serde_json::from_str(&fs::read_to_string(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.status, ChunkStatus::Training);
    }
}
