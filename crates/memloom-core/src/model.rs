//! Known-model records and the models registry document.
//!
//! The models document differs from the chunk and adapter registries: it
//! holds the `known_models` mapping plus the `current_model` pointer, which
//! together answer "which model is live right now" and "what have we seen
//! before". All cross-references are id-valued; a KnownModel lists adapter
//! ids, never embedded records.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{RegistryError, Result};
use crate::fingerprint::ModelIdentity;
use crate::registry::{Entry, load_document, write_document_atomic};

const REGISTRY_FILE: &str = "model_registry.json";
const KNOWN_MODELS_KEY: &str = "known_models";
const CURRENT_MODEL_KEY: &str = "current_model";

/// Persistent record for one base model, keyed by its identity hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnownModel {
    /// The identity as observed at registration.
    pub identity: ModelIdentity,
    /// Operator-supplied name, falling back to the artifact basename.
    pub friendly_name: String,
    pub first_seen: String,
    pub last_seen: String,
    pub times_used: u64,
    /// Adapters trained against this model.
    pub lora_ids: Vec<String>,
}

/// The models registry: known models plus the current-model pointer.
#[derive(Debug)]
pub struct ModelStore {
    path: PathBuf,
    known: BTreeMap<String, Entry<KnownModel>>,
    current: Option<String>,
    extra: serde_json::Map<String, Value>,
    poisoned: bool,
}

impl ModelStore {
    pub fn open(models_dir: &Path) -> Result<Self> {
        fs::create_dir_all(models_dir)?;
        let path = models_dir.join(REGISTRY_FILE);
        let (mut map, mut poisoned) = load_document(&path);

        let mut known = BTreeMap::new();
        match map.remove(KNOWN_MODELS_KEY) {
            Some(Value::Object(models)) => {
                for (hash, value) in models {
                    let entry = match serde_json::from_value::<KnownModel>(value.clone()) {
                        Ok(record) => Entry::Record(record),
                        Err(err) => {
                            warn!(identity_hash = %hash, error = %err, "Known-model entry has unexpected shape; preserving verbatim");
                            Entry::Unknown(value)
                        }
                    };
                    known.insert(hash, entry);
                }
            }
            Some(_) => {
                warn!(path = %path.display(), "known_models is not a mapping; gating writes");
                poisoned = true;
            }
            None => {}
        }

        let current = match map.remove(CURRENT_MODEL_KEY) {
            Some(Value::String(hash)) => Some(hash),
            Some(Value::Null) | None => None,
            Some(_) => {
                warn!(path = %path.display(), "current_model is not a string; gating writes");
                poisoned = true;
                None
            }
        };

        Ok(Self {
            path,
            known,
            current,
            extra: map,
            poisoned,
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn ensure_writable(&self) -> Result<()> {
        if self.poisoned {
            return Err(RegistryError::Poisoned {
                path: self.path.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Identity hash of the model that is currently live, if any.
    pub fn current_model(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn set_current(&mut self, identity_hash: &str) {
        self.current = Some(identity_hash.to_string());
    }

    pub fn contains(&self, identity_hash: &str) -> bool {
        matches!(self.known.get(identity_hash), Some(Entry::Record(_)))
    }

    pub fn get(&self, identity_hash: &str) -> Option<&KnownModel> {
        match self.known.get(identity_hash) {
            Some(Entry::Record(record)) => Some(record),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, identity_hash: &str) -> Option<&mut KnownModel> {
        match self.known.get_mut(identity_hash) {
            Some(Entry::Record(record)) => Some(record),
            _ => None,
        }
    }

    pub fn insert(&mut self, identity_hash: String, record: KnownModel) {
        self.known.insert(identity_hash, Entry::Record(record));
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &KnownModel)> {
        self.known.iter().filter_map(|(hash, entry)| match entry {
            Entry::Record(record) => Some((hash, record)),
            Entry::Unknown(_) => None,
        })
    }

    pub fn known_count(&self) -> usize {
        self.records().count()
    }

    /// Human-facing name for a model hash: the friendly name when known,
    /// otherwise the hash prefix.
    pub fn display_name(&self, identity_hash: &str) -> String {
        match self.get(identity_hash) {
            Some(record) if !record.friendly_name.is_empty() => record.friendly_name.clone(),
            _ => identity_hash.chars().take(8).collect(),
        }
    }

    /// Rewrite the models document atomically.
    pub fn save(&self) -> Result<()> {
        self.ensure_writable()?;

        let mut models = serde_json::Map::new();
        for (hash, entry) in &self.known {
            let value = match entry {
                Entry::Record(record) => {
                    serde_json::to_value(record).map_err(|source| RegistryError::Serialize {
                        id: hash.clone(),
                        source,
                    })?
                }
                Entry::Unknown(raw) => raw.clone(),
            };
            models.insert(hash.clone(), value);
        }

        let mut doc = serde_json::Map::new();
        doc.insert(KNOWN_MODELS_KEY.to_string(), Value::Object(models));
        doc.insert(
            CURRENT_MODEL_KEY.to_string(),
            self.current.clone().map_or(Value::Null, Value::String),
        );
        for (key, value) in &self.extra {
            doc.insert(key.clone(), value.clone());
        }

        write_document_atomic(&self.path, &Value::Object(doc))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn known(name: &str) -> KnownModel {
        KnownModel {
            friendly_name: name.to_string(),
            first_seen: "2026-01-01T00:00:00Z".to_string(),
            last_seen: "2026-01-02T00:00:00Z".to_string(),
            times_used: 1,
            ..KnownModel::default()
        }
    }

    #[test]
    fn empty_store_has_no_current_model() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        assert!(store.current_model().is_none());
        assert_eq!(store.known_count(), 0);
    }

    #[test]
    fn save_load_roundtrip_keeps_current_pointer() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = ModelStore::open(dir.path()).unwrap();
            store.insert("abcd1234abcd1234".to_string(), known("llama"));
            store.set_current("abcd1234abcd1234");
            store.save().unwrap();
        }

        let store = ModelStore::open(dir.path()).unwrap();
        assert_eq!(store.current_model(), Some("abcd1234abcd1234"));
        assert_eq!(
            store.get("abcd1234abcd1234").unwrap().friendly_name,
            "llama"
        );
        assert_eq!(store.display_name("abcd1234abcd1234"), "llama");
        assert_eq!(store.display_name("ffff0000ffff0000"), "ffff0000");
    }

    #[test]
    fn corrupt_document_gates_writes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("model_registry.json"), "not json").unwrap();

        let mut store = ModelStore::open(dir.path()).unwrap();
        assert!(store.is_poisoned());
        store.set_current("abcd1234abcd1234");
        assert!(store.save().is_err());
        assert_eq!(
            fs::read_to_string(dir.path().join("model_registry.json")).unwrap(),
            "not json"
        );
    }

    #[test]
    fn unknown_shaped_entries_survive_rewrite() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("model_registry.json"),
            r#"{"known_models": {"weird": "just a string"}, "current_model": null, "_schema": 1}"#,
        )
        .unwrap();

        let mut store = ModelStore::open(dir.path()).unwrap();
        assert_eq!(store.known_count(), 0);
        store.insert("abcd1234abcd1234".to_string(), known("phi"));
        store.save().unwrap();

        let raw: Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("model_registry.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["known_models"]["weird"], "just a string");
        assert_eq!(raw["_schema"], 1);
    }
}
