//! Switch coordinator - the user-visible surface of the core.
//!
//! Binds the fingerprinter, the chunk lifecycle manager and the registries
//! behind one mediator. A single registry-wide mutex serializes every
//! mutating sequence, so concurrent switches can never interleave their
//! invalidation passes. The `*_async` wrappers run whole operations on a
//! blocking thread; fingerprinting a large weight file or copying an adapter
//! artifact tree must never run on a request-handling thread.
//!
//! No cross-registry transaction is promised. A crash between the models
//! rewrite and the adapter invalidation pass can leave adapters `active`
//! under a stale model; [`Overview::stale_active_loras`] makes that drift
//! visible, and the next switch reconciles it.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::adapter::{AdapterRecord, AdapterStatus, AdapterStore, copy_artifact_tree};
use crate::chunk::{ChunkStatus, ChunkStore, DataChunk, Document, RestorableChunk};
use crate::clock::now_iso;
use crate::error::{Error, Result};
use crate::fingerprint::{ModelIdentity, identify_model};
use crate::model::{KnownModel, ModelStore};
use crate::oplog::{Operation, OperationEntry, OperationLog};

/// Result of registering (or re-registering) a model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRegistration {
    pub identity_hash: String,
    pub identity: ModelIdentity,
    pub is_new: bool,
    /// True when a different model was current before this registration.
    pub model_changed: bool,
    pub previous_model: Option<String>,
    pub friendly_name: String,
}

/// Non-mutating answer to "has the model changed since last time?".
#[derive(Debug, Clone, Serialize)]
pub struct ModelChangeProbe {
    pub changed: bool,
    pub known: bool,
    pub current_hash: Option<String>,
    pub new_hash: String,
    pub new_name: String,
}

/// Display row for a known model, newest `last_seen` first.
#[derive(Debug, Clone, Serialize)]
pub struct KnownModelSummary {
    pub identity_hash: String,
    pub name: String,
    pub model_type: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
    pub times_used: u64,
    pub lora_count: usize,
    pub is_current: bool,
}

/// Outcome of `handle_model_switch`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SwitchOutcome {
    Unchanged(SwitchUnchanged),
    Switched(SwitchSummary),
}

impl SwitchOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Switched(_))
    }
}

/// The same model is still current; nothing was invalidated.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchUnchanged {
    pub changed: bool,
    pub message: String,
    pub model: ModelRegistration,
}

/// The model changed: what became unusable and what can be restored.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchSummary {
    pub changed: bool,
    pub previous_model: Option<String>,
    pub new_model: String,
    pub model_info: ModelRegistration,
    pub unusable_loras: Vec<String>,
    pub unusable_lora_count: usize,
    pub restorable_chunks: Vec<String>,
    pub restorable_chunk_count: usize,
    pub restorable_document_count: u64,
    pub compatible_loras: Vec<String>,
    pub compatible_lora_count: usize,
    pub action_needed: bool,
}

/// Outcome of `restore_chunks`. The caller re-ingests `documents` into the
/// retrieval store; the core never does.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub restored: Vec<String>,
    pub failed: Vec<String>,
    pub document_count: u64,
    pub documents: Vec<Document>,
}

/// Compatibility envelope for `select_adapter`. Unknown and deleted ids
/// yield `None` instead; the asymmetry is deliberate.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AdapterSelection {
    Compatible {
        compatible: bool,
        lora: AdapterRecord,
        path: Option<String>,
    },
    Incompatible {
        compatible: bool,
        lora: AdapterRecord,
        reason: String,
    },
}

impl AdapterSelection {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Self::Compatible { .. })
    }
}

/// Counts per status per entity, plus the adapter drift counter.
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub current_model: Option<String>,
    pub current_model_name: Option<String>,
    pub known_models: usize,
    pub total_chunks: usize,
    pub chunks_by_status: BTreeMap<String, usize>,
    pub total_loras: usize,
    pub loras_by_status: BTreeMap<String, usize>,
    pub compatible_loras: usize,
    pub restorable_chunks: usize,
    pub untrained_chunks: usize,
    /// ACTIVE adapters whose target model is not current. Nonzero means a
    /// crash interrupted a switch; the next switch reconciles it.
    pub stale_active_loras: usize,
}

struct CoreState {
    chunks: ChunkStore,
    adapters: AdapterStore,
    models: ModelStore,
}

struct Inner {
    state: Mutex<CoreState>,
    oplog: OperationLog,
    loras_dir: PathBuf,
    /// Advisory lock making a second process fail fast instead of racing the
    /// registries. Held for the life of the coordinator.
    _dir_lock: std::fs::File,
}

/// The top-level mediator. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Open (or initialize) the data directory and take ownership of it.
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;

        let lock_path = data_dir.join(".lock");
        let dir_lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        dir_lock
            .try_lock_exclusive()
            .map_err(|_| Error::DataDirLocked(data_dir.to_path_buf()))?;

        let chunks = ChunkStore::open(data_dir.join("chunks"))?;
        let loras_dir = data_dir.join("loras");
        let adapters = AdapterStore::open(&loras_dir)?;
        let models = ModelStore::open(&data_dir.join("models"))?;
        let oplog = OperationLog::new(&data_dir.join("history"));

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoreState {
                    chunks,
                    adapters,
                    models,
                }),
                oplog,
                loras_dir,
                _dir_lock: dir_lock,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, CoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Model management
    // =========================================================================

    /// Register or re-register a model and make it current.
    ///
    /// Idempotent under identical inputs except for `last_seen` and
    /// `times_used`.
    pub fn register_model(
        &self,
        model_path: &Path,
        friendly_name: Option<&str>,
    ) -> Result<ModelRegistration> {
        let identity = self.identify(model_path)?;
        let mut state = self.state();
        self.apply_registration(&mut state, identity, friendly_name)
    }

    /// Async wrapper; fingerprinting can block for a long time.
    pub async fn register_model_async(
        &self,
        model_path: PathBuf,
        friendly_name: Option<String>,
    ) -> Result<ModelRegistration> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.register_model(&model_path, friendly_name.as_deref())
        })
        .await
        .map_err(|err| Error::Background(err.to_string()))?
    }

    /// Check whether the model at `model_path` differs from the current one,
    /// without mutating anything.
    pub fn detect_model_change(&self, model_path: &Path) -> Result<ModelChangeProbe> {
        let identity = self.identify(model_path)?;
        let state = self.state();
        let current = state.models.current_model().map(str::to_string);
        Ok(ModelChangeProbe {
            changed: current
                .as_deref()
                .is_some_and(|c| c != identity.identity_hash),
            known: state.models.contains(&identity.identity_hash),
            current_hash: current,
            new_hash: identity.identity_hash,
            new_name: identity.name,
        })
    }

    /// All known models, newest `last_seen` first.
    pub fn list_known_models(&self) -> Vec<KnownModelSummary> {
        let state = self.state();
        let current = state.models.current_model().map(str::to_string);
        let mut models: Vec<KnownModelSummary> = state
            .models
            .records()
            .map(|(hash, record)| KnownModelSummary {
                identity_hash: hash.clone(),
                name: if record.friendly_name.is_empty() {
                    record.identity.name.clone()
                } else {
                    record.friendly_name.clone()
                },
                model_type: record.identity.model_type.clone(),
                first_seen: record.first_seen.clone(),
                last_seen: record.last_seen.clone(),
                times_used: record.times_used,
                lora_count: record.lora_ids.len(),
                is_current: current.as_deref() == Some(hash.as_str()),
            })
            .collect();
        models.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        models
    }

    /// Identity hash of the current model, if one was ever registered.
    pub fn current_model(&self) -> Option<String> {
        self.state().models.current_model().map(str::to_string)
    }

    // =========================================================================
    // Model switch protocol
    // =========================================================================

    /// The central protocol: register the model at `model_path`, and when it
    /// differs from the previous one, invalidate every adapter trained
    /// against the previous model and report which chunks can be restored.
    ///
    /// A repeated call with the same path is idempotent on the model side and
    /// a no-op on adapters already marked unusable.
    pub fn handle_model_switch(
        &self,
        model_path: &Path,
        friendly_name: Option<&str>,
    ) -> Result<SwitchOutcome> {
        let identity = self.identify(model_path)?;
        let mut state = self.state();

        let previous = state.models.current_model().map(str::to_string);
        let registration = self.apply_registration(&mut state, identity, friendly_name)?;

        if !registration.model_changed {
            return Ok(SwitchOutcome::Unchanged(SwitchUnchanged {
                changed: false,
                message: "Same model detected, no changes needed".to_string(),
                model: registration,
            }));
        }

        let new_model = registration.identity_hash.clone();

        // Invalidate adapters bound to the previous model. A failed
        // invalidation is logged and skipped; the adapter stays active and
        // the next switch retries it.
        let mut unusable_loras = Vec::new();
        if let Some(previous_model) = &previous {
            let reason = format!("Model changed from {previous_model} to {new_model}");
            for lora_id in state.adapters.active_for_model(previous_model) {
                match state.adapters.mark_unusable(&lora_id, &reason) {
                    Ok(Some(_)) => {
                        self.inner.oplog.record(
                            Operation::LoraMarkedUnusable,
                            json!({"lora_id": &lora_id, "reason": &reason}),
                        );
                        unusable_loras.push(lora_id);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(lora_id, error = %err, "Failed to invalidate adapter during switch");
                    }
                }
            }
        }

        let restorable = state.chunks.restorable(Some(&new_model));
        let restorable_chunks: Vec<String> = restorable
            .iter()
            .map(|r| r.chunk.chunk_id.clone())
            .collect();
        let restorable_document_count: u64 =
            restorable.iter().map(|r| r.chunk.document_count).sum();

        let compatible_loras: Vec<String> = state
            .adapters
            .compatible(&new_model)
            .into_iter()
            .map(|record| record.lora_id)
            .collect();

        let summary = SwitchSummary {
            changed: true,
            previous_model: previous.clone(),
            new_model: new_model.clone(),
            model_info: registration,
            unusable_lora_count: unusable_loras.len(),
            unusable_loras,
            restorable_chunk_count: restorable_chunks.len(),
            restorable_document_count,
            action_needed: !restorable_chunks.is_empty(),
            restorable_chunks,
            compatible_lora_count: compatible_loras.len(),
            compatible_loras,
        };

        self.inner.oplog.record(
            Operation::ModelSwitch,
            serde_json::to_value(&summary).unwrap_or(Value::Null),
        );
        info!(
            previous = previous.as_deref().unwrap_or("none"),
            new = %new_model,
            unusable = summary.unusable_lora_count,
            restorable = summary.restorable_chunk_count,
            "Model switched"
        );

        Ok(SwitchOutcome::Switched(summary))
    }

    /// Async wrapper for [`Self::handle_model_switch`].
    pub async fn handle_model_switch_async(
        &self,
        model_path: PathBuf,
        friendly_name: Option<String>,
    ) -> Result<SwitchOutcome> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.handle_model_switch(&model_path, friendly_name.as_deref())
        })
        .await
        .map_err(|err| Error::Background(err.to_string()))?
    }

    // =========================================================================
    // Chunk management
    // =========================================================================

    /// Create a chunk from documents; they are preserved for restoration.
    pub fn create_chunk(
        &self,
        documents: &[Document],
        character: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<DataChunk> {
        if documents.is_empty() {
            return Err(Error::Input("documents must not be empty".to_string()));
        }

        let mut state = self.state();
        let model = state.models.current_model().map(str::to_string);
        let chunk = state
            .chunks
            .create(documents, model.as_deref(), character, metadata)?;

        self.inner.oplog.record(
            Operation::ChunkCreated,
            json!({
                "chunk_id": &chunk.chunk_id,
                "document_count": chunk.document_count,
                "character": &chunk.character,
                "model": model,
            }),
        );
        Ok(chunk)
    }

    /// Apply a validated transition. Returns false for an unknown chunk id,
    /// which is deliberately not an error.
    pub fn transition_chunk(
        &self,
        chunk_id: &str,
        status: ChunkStatus,
        details: &str,
    ) -> Result<bool> {
        if status == ChunkStatus::Trained {
            return Err(Error::Input(
                "trained status requires an adapter id; use mark_chunk_trained".to_string(),
            ));
        }
        let mut state = self.state();
        let applied = state.chunks.transition(chunk_id, status, details)?;
        drop(state);
        if applied.is_some() {
            self.log_status_change(chunk_id, status, details);
        }
        Ok(applied.is_some())
    }

    pub fn mark_chunk_training(&self, chunk_id: &str) -> Result<bool> {
        self.transition_chunk(chunk_id, ChunkStatus::Training, "Training started")
    }

    pub fn mark_chunk_trained(&self, chunk_id: &str, lora_id: &str) -> Result<bool> {
        let mut state = self.state();
        let applied = state.chunks.mark_trained(chunk_id, lora_id)?;
        drop(state);
        if applied.is_some() {
            self.log_status_change(
                chunk_id,
                ChunkStatus::Trained,
                &format!("Trained into LoRA {lora_id}"),
            );
        }
        Ok(applied.is_some())
    }

    pub fn mark_chunk_failed(&self, chunk_id: &str, error: &str) -> Result<bool> {
        self.transition_chunk(
            chunk_id,
            ChunkStatus::Failed,
            &format!("Training failed: {error}"),
        )
    }

    pub fn mark_chunk_restored(&self, chunk_id: &str) -> Result<bool> {
        self.transition_chunk(
            chunk_id,
            ChunkStatus::Restored,
            "Documents restored to retrieval",
        )
    }

    /// Archive a chunk; only here may its preserved documents be deleted.
    pub fn archive_chunk(&self, chunk_id: &str, delete_documents: bool) -> Result<bool> {
        let mut state = self.state();
        let applied = state.chunks.mark_archived(chunk_id, delete_documents)?;
        drop(state);
        if applied.is_some() {
            self.log_status_change(chunk_id, ChunkStatus::Archived, "Chunk archived");
        }
        Ok(applied.is_some())
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Option<DataChunk> {
        self.state().chunks.get(chunk_id).cloned()
    }

    /// Preserved documents for a chunk, `None` when they no longer exist.
    pub fn get_chunk_documents(&self, chunk_id: &str) -> Result<Option<Vec<Document>>> {
        self.state().chunks.documents(chunk_id)
    }

    /// Chunks filtered by status and/or model, newest first.
    pub fn list_chunks(
        &self,
        status: Option<ChunkStatus>,
        model_identity_hash: Option<&str>,
    ) -> Vec<DataChunk> {
        self.state().chunks.by_status(status, model_identity_hash)
    }

    pub fn list_untrained_chunks(&self) -> Vec<DataChunk> {
        self.state().chunks.untrained()
    }

    /// Chunks restorable against `model` (default: the current model).
    pub fn list_restorable_chunks(&self, model: Option<&str>) -> Vec<RestorableChunk> {
        let state = self.state();
        let target = model
            .map(str::to_string)
            .or_else(|| state.models.current_model().map(str::to_string));
        state.chunks.restorable(target.as_deref())
    }

    // =========================================================================
    // Restoration
    // =========================================================================

    /// Hand preserved documents back to the caller and mark their chunks
    /// RESTORED. With `None`, every currently restorable chunk is selected.
    ///
    /// One chunk failing never aborts the others; the outcome lists
    /// `restored` and `failed` separately. Re-ingesting the documents into
    /// the retrieval store is the caller's responsibility.
    pub fn restore_chunks(&self, chunk_ids: Option<&[String]>) -> Result<RestoreOutcome> {
        let mut state = self.state();

        let selected: Vec<String> = match chunk_ids {
            Some(ids) => ids.to_vec(),
            None => {
                let target = state.models.current_model().map(str::to_string);
                state
                    .chunks
                    .restorable(target.as_deref())
                    .into_iter()
                    .map(|r| r.chunk.chunk_id)
                    .collect()
            }
        };

        let mut restored = Vec::new();
        let mut failed = Vec::new();
        let mut documents = Vec::new();

        for chunk_id in selected {
            let docs = match state.chunks.documents(&chunk_id) {
                Ok(Some(docs)) => docs,
                Ok(None) => {
                    warn!(chunk_id, "Could not restore chunk: documents not found");
                    failed.push(chunk_id);
                    continue;
                }
                Err(err) => {
                    warn!(chunk_id, error = %err, "Could not restore chunk: documents unreadable");
                    failed.push(chunk_id);
                    continue;
                }
            };
            match state.chunks.mark_restored(&chunk_id) {
                Ok(Some(_)) => {
                    self.inner.oplog.record(
                        Operation::ChunkStatusChanged,
                        json!({
                            "chunk_id": &chunk_id,
                            "new_status": ChunkStatus::Restored.as_str(),
                            "details": "Documents restored to retrieval",
                        }),
                    );
                    documents.extend(docs);
                    restored.push(chunk_id);
                }
                Ok(None) => {
                    failed.push(chunk_id);
                }
                Err(err) => {
                    warn!(chunk_id, error = %err, "Could not mark chunk restored");
                    failed.push(chunk_id);
                }
            }
        }

        let outcome = RestoreOutcome {
            document_count: documents.len() as u64,
            restored,
            failed,
            documents,
        };
        self.inner.oplog.record(
            Operation::ChunksRestored,
            json!({
                "restored": &outcome.restored,
                "failed": &outcome.failed,
                "document_count": outcome.document_count,
            }),
        );
        Ok(outcome)
    }

    /// Async wrapper; restoring many chunks reads many document files.
    pub async fn restore_chunks_async(
        &self,
        chunk_ids: Option<Vec<String>>,
    ) -> Result<RestoreOutcome> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.restore_chunks(chunk_ids.as_deref()))
            .await
            .map_err(|err| Error::Background(err.to_string()))?
    }

    // =========================================================================
    // Adapter management
    // =========================================================================

    /// Register a trained adapter: copy its artifact tree into the managed
    /// layout, bind it to the current model, and mark the consumed chunks
    /// TRAINED. If the copy fails, the adapter registry is not written.
    pub fn register_adapter(
        &self,
        chunk_ids: &[String],
        source_path: &Path,
        training_config: Option<Value>,
        metrics: Option<Value>,
    ) -> Result<AdapterRecord> {
        if chunk_ids.is_empty() {
            return Err(Error::Input("chunk_ids must not be empty".to_string()));
        }
        if source_path.as_os_str().is_empty() {
            return Err(Error::Input("adapter source path must not be empty".to_string()));
        }

        let mut state = self.state();
        state.adapters.ensure_writable()?;
        state.models.ensure_writable()?;
        state.chunks.ensure_writable()?;

        let current_model = state
            .models
            .current_model()
            .map(str::to_string)
            .ok_or_else(|| Error::Input("no base model registered".to_string()))?;

        let lora_id = state.adapters.allocate_id();
        let dest = self
            .inner
            .loras_dir
            .join(format!("model_{current_model}"))
            .join(&lora_id);
        copy_artifact_tree(source_path, &dest)?;

        let (model_name, model_type) = match state.models.get(&current_model) {
            Some(record) => (
                Some(record.friendly_name.clone()),
                record.identity.model_type.clone(),
            ),
            None => (None, None),
        };

        let record = AdapterRecord {
            lora_id: lora_id.clone(),
            created_at: now_iso(),
            model_identity_hash: Some(current_model.clone()),
            model_name,
            model_type,
            chunk_ids: chunk_ids.to_vec(),
            path: Some(dest.to_string_lossy().into_owned()),
            status: AdapterStatus::Active,
            training_config: training_config
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            metrics: metrics.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            ..AdapterRecord::default()
        };
        state.adapters.insert(record.clone())?;

        if let Some(model) = state.models.get_mut(&current_model) {
            if !model.lora_ids.contains(&lora_id) {
                model.lora_ids.push(lora_id.clone());
            }
        }
        state.models.save()?;

        for chunk_id in chunk_ids {
            match state.chunks.mark_trained(chunk_id, &lora_id) {
                Ok(Some(_)) => {
                    self.inner.oplog.record(
                        Operation::ChunkStatusChanged,
                        json!({
                            "chunk_id": chunk_id,
                            "new_status": ChunkStatus::Trained.as_str(),
                            "details": format!("Trained into LoRA {lora_id}"),
                        }),
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(chunk_id, lora_id, error = %err, "Could not mark chunk trained");
                }
            }
        }

        self.inner.oplog.record(
            Operation::LoraRegistered,
            json!({
                "lora_id": &lora_id,
                "model": &current_model,
                "chunk_ids": chunk_ids,
                "path": &record.path,
            }),
        );
        info!(lora_id, model = %current_model, "Registered adapter");
        Ok(record)
    }

    /// Async wrapper; the artifact copy can move gigabytes.
    pub async fn register_adapter_async(
        &self,
        chunk_ids: Vec<String>,
        source_path: PathBuf,
        training_config: Option<Value>,
        metrics: Option<Value>,
    ) -> Result<AdapterRecord> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.register_adapter(&chunk_ids, &source_path, training_config, metrics)
        })
        .await
        .map_err(|err| Error::Background(err.to_string()))?
    }

    /// Compatibility check for an adapter. `None` for unknown or deleted
    /// ids; a known-but-incompatible adapter yields a structured envelope.
    pub fn select_adapter(&self, lora_id: &str) -> Option<AdapterSelection> {
        let state = self.state();
        let record = state.adapters.get(lora_id)?.clone();
        if record.status == AdapterStatus::Deleted {
            return None;
        }

        let current = state.models.current_model();
        if record.model_identity_hash.is_some() && record.model_identity_hash.as_deref() != current
        {
            warn!(
                lora_id,
                trained_for = record.model_identity_hash.as_deref().unwrap_or("unknown"),
                current = current.unwrap_or("none"),
                "Adapter trained for a different model"
            );
            let reason = format!(
                "Adapter trained for a different model (trained: {}, current: {})",
                record.model_name.as_deref().unwrap_or("unknown"),
                current.unwrap_or("none"),
            );
            return Some(AdapterSelection::Incompatible {
                compatible: false,
                lora: record,
                reason,
            });
        }

        let path = record.path.clone();
        Some(AdapterSelection::Compatible {
            compatible: true,
            lora: record,
            path,
        })
    }

    /// ACTIVE adapters bound to `model` (default: the current model),
    /// newest first. Adapters invalidated by an earlier switch stay out of
    /// this list even when their model becomes current again.
    pub fn list_compatible_adapters(&self, model: Option<&str>) -> Vec<AdapterRecord> {
        let state = self.state();
        let target = model
            .map(str::to_string)
            .or_else(|| state.models.current_model().map(str::to_string));
        match target {
            Some(target) => state.adapters.compatible(&target),
            None => Vec::new(),
        }
    }

    /// All adapter records, newest first.
    pub fn list_adapters(&self, include_deleted: bool) -> Vec<AdapterRecord> {
        self.state().adapters.list(include_deleted)
    }

    pub fn get_adapter(&self, lora_id: &str) -> Option<AdapterRecord> {
        self.state().adapters.get(lora_id).cloned()
    }

    /// Mark an adapter unusable, e.g. after an out-of-band model change.
    pub fn mark_adapter_unusable(&self, lora_id: &str, reason: &str) -> Result<AdapterRecord> {
        let mut state = self.state();
        let updated = state
            .adapters
            .mark_unusable(lora_id, reason)?
            .ok_or_else(|| Error::NotFound(format!("adapter {lora_id}")))?;
        drop(state);
        self.inner.oplog.record(
            Operation::LoraMarkedUnusable,
            json!({"lora_id": lora_id, "reason": reason}),
        );
        Ok(updated)
    }

    /// Mark an adapter deleted, optionally removing its artifact files.
    pub fn delete_adapter(&self, lora_id: &str, delete_files: bool) -> Result<AdapterRecord> {
        let mut state = self.state();
        let record = state
            .adapters
            .get(lora_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("adapter {lora_id}")))?;

        if delete_files {
            if let Some(path) = &record.path {
                let path = Path::new(path);
                if path.exists() {
                    fs::remove_dir_all(path)?;
                    info!(lora_id, path = %path.display(), "Deleted adapter files");
                }
            }
        }

        let updated = state
            .adapters
            .mark_deleted(lora_id)?
            .ok_or_else(|| Error::NotFound(format!("adapter {lora_id}")))?;
        drop(state);
        self.inner.oplog.record(
            Operation::LoraDeleted,
            json!({"lora_id": lora_id, "files_deleted": delete_files}),
        );
        Ok(updated)
    }

    // =========================================================================
    // Status and history
    // =========================================================================

    /// Counts per status per entity, plus adapter drift visibility.
    pub fn overview(&self) -> Overview {
        let state = self.state();
        let current = state.models.current_model().map(str::to_string);
        let compatible = current
            .as_deref()
            .map_or(0, |model| state.adapters.compatible(model).len());
        let restorable = state.chunks.restorable(current.as_deref()).len();

        Overview {
            current_model_name: current
                .as_deref()
                .map(|hash| state.models.display_name(hash)),
            known_models: state.models.known_count(),
            total_chunks: state.chunks.total(),
            chunks_by_status: state.chunks.status_counts(),
            total_loras: state.adapters.total(),
            loras_by_status: state.adapters.status_counts(),
            compatible_loras: compatible,
            restorable_chunks: restorable,
            untrained_chunks: state.chunks.untrained().len(),
            stale_active_loras: state.adapters.stale_active(current.as_deref()),
            current_model: current,
        }
    }

    /// The last `limit` operation-log entries.
    pub fn operation_history(&self, limit: usize) -> Result<Vec<OperationEntry>> {
        self.inner.oplog.tail(limit)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn identify(&self, model_path: &Path) -> Result<ModelIdentity> {
        if model_path.as_os_str().is_empty() {
            return Err(Error::Input("model path must not be empty".to_string()));
        }
        Ok(identify_model(model_path)?)
    }

    fn apply_registration(
        &self,
        state: &mut CoreState,
        identity: ModelIdentity,
        friendly_name: Option<&str>,
    ) -> Result<ModelRegistration> {
        state.models.ensure_writable()?;

        let identity_hash = identity.identity_hash.clone();
        let now = now_iso();
        let is_new = !state.models.contains(&identity_hash);
        let previous_model = state.models.current_model().map(str::to_string);
        let model_changed = previous_model
            .as_deref()
            .is_some_and(|previous| previous != identity_hash);

        if is_new {
            state.models.insert(
                identity_hash.clone(),
                KnownModel {
                    identity: identity.clone(),
                    friendly_name: friendly_name.unwrap_or(&identity.name).to_string(),
                    first_seen: now.clone(),
                    last_seen: now,
                    times_used: 1,
                    lora_ids: Vec::new(),
                },
            );
            info!(identity_hash, name = %identity.name, "New model registered");
        } else if let Some(record) = state.models.get_mut(&identity_hash) {
            record.last_seen = now;
            record.times_used += 1;
        }

        state.models.set_current(&identity_hash);
        state.models.save()?;

        let friendly_name = state
            .models
            .get(&identity_hash)
            .map_or_else(|| identity.name.clone(), |m| m.friendly_name.clone());

        self.inner.oplog.record(
            Operation::ModelRegistered,
            json!({
                "identity_hash": &identity_hash,
                "name": &identity.name,
                "is_new": is_new,
                "model_changed": model_changed,
                "previous_model": &previous_model,
            }),
        );

        Ok(ModelRegistration {
            identity_hash,
            identity,
            is_new,
            model_changed,
            previous_model,
            friendly_name,
        })
    }

    fn log_status_change(&self, chunk_id: &str, status: ChunkStatus, details: &str) {
        self.inner.oplog.record(
            Operation::ChunkStatusChanged,
            json!({
                "chunk_id": chunk_id,
                "new_status": status.as_str(),
                "details": details,
            }),
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
