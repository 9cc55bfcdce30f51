//! Persistent registry documents.
//!
//! Each registry is a single self-describing JSON document: a mapping from
//! entity id to record, plus bookkeeping keys prefixed with `_` (the
//! monotonic id counter lives under `_counter`). Every mutation is followed
//! by a full rewrite of the document, performed as write-then-rename from a
//! temporary file in the same directory so readers never observe a torn
//! document.
//!
//! Corrupt documents never cause silent data loss: an unparseable file loads
//! as an empty registry in memory, the on-disk file is left untouched for
//! operator inspection, and every subsequent write is refused until the file
//! is repaired or removed.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::RegistryError;

/// Bookkeeping key holding the monotonic id counter.
const COUNTER_KEY: &str = "_counter";

/// One registry slot: either a record of the expected shape, or a raw value
/// kept verbatim so a newer writer's entries survive a rewrite by this one.
#[derive(Debug, Clone)]
pub enum Entry<T> {
    Record(T),
    Unknown(Value),
}

/// A registry document mapping ids to records of type `T`.
#[derive(Debug)]
pub struct RegistryTable<T> {
    path: PathBuf,
    entries: BTreeMap<String, Entry<T>>,
    counter: u64,
    extra: serde_json::Map<String, Value>,
    poisoned: bool,
}

impl<T: DeserializeOwned> RegistryTable<T> {
    /// Load the registry at `path`. A missing file yields an empty registry;
    /// a present but unparseable file yields an empty *poisoned* registry
    /// whose writes are gated.
    pub fn load(path: PathBuf) -> Self {
        let (map, poisoned) = load_document(&path);

        let mut entries = BTreeMap::new();
        let mut extra = serde_json::Map::new();
        let mut counter = 0;
        for (key, value) in map {
            if key == COUNTER_KEY {
                counter = value.as_u64().unwrap_or(0);
                continue;
            }
            if key.starts_with('_') {
                extra.insert(key, value);
                continue;
            }
            let entry = match serde_json::from_value::<T>(value.clone()) {
                Ok(record) => Entry::Record(record),
                Err(err) => {
                    warn!(id = %key, error = %err, "Registry entry has unexpected shape; preserving verbatim");
                    Entry::Unknown(value)
                }
            };
            entries.insert(key, entry);
        }

        // A hand-edited file may have lost `_counter`; never re-issue an id
        // that already exists.
        let max_suffix = entries
            .keys()
            .filter_map(|id| numeric_suffix(id))
            .max()
            .unwrap_or(0);

        Self {
            path,
            entries,
            counter: counter.max(max_suffix),
            extra,
            poisoned,
        }
    }
}

impl<T> RegistryTable<T> {
    /// Whether the on-disk document was corrupt at load time.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Refuse mutation while the on-disk document is corrupt.
    pub fn ensure_writable(&self) -> crate::Result<()> {
        if self.poisoned {
            return Err(RegistryError::Poisoned {
                path: self.path.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Current counter value.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Allocate the next id with the given prefix (`prefix_NNNN`).
    pub fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}_{:04}", self.counter)
    }

    pub fn contains(&self, id: &str) -> bool {
        matches!(self.entries.get(id), Some(Entry::Record(_)))
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        match self.entries.get(id) {
            Some(Entry::Record(record)) => Some(record),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        match self.entries.get_mut(id) {
            Some(Entry::Record(record)) => Some(record),
            _ => None,
        }
    }

    pub fn insert(&mut self, id: String, record: T) {
        self.entries.insert(id, Entry::Record(record));
    }

    /// Iterate records in ascending id order, skipping unknown-shaped slots.
    pub fn records(&self) -> impl Iterator<Item = (&String, &T)> {
        self.entries.iter().filter_map(|(id, entry)| match entry {
            Entry::Record(record) => Some((id, record)),
            Entry::Unknown(_) => None,
        })
    }

    /// Number of well-formed records.
    pub fn record_count(&self) -> usize {
        self.records().count()
    }
}

impl<T: Serialize> RegistryTable<T> {
    /// Rewrite the whole document atomically (write temp, then rename).
    pub fn save(&self) -> crate::Result<()> {
        self.ensure_writable()?;

        let mut doc = serde_json::Map::new();
        for (id, entry) in &self.entries {
            let value = match entry {
                Entry::Record(record) => {
                    serde_json::to_value(record).map_err(|source| RegistryError::Serialize {
                        id: id.clone(),
                        source,
                    })?
                }
                Entry::Unknown(raw) => raw.clone(),
            };
            doc.insert(id.clone(), value);
        }
        for (key, value) in &self.extra {
            doc.insert(key.clone(), value.clone());
        }
        doc.insert(COUNTER_KEY.to_string(), Value::from(self.counter));

        write_document_atomic(&self.path, &Value::Object(doc))
    }
}

/// Read a JSON object document. Returns the parsed object and whether the
/// file was present but unusable (poisoned).
pub(crate) fn load_document(path: &Path) -> (serde_json::Map<String, Value>, bool) {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return (serde_json::Map::new(), false);
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Could not read registry document");
            return (serde_json::Map::new(), true);
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => (map, false),
        Ok(_) => {
            warn!(path = %path.display(), "Registry document is not a JSON object");
            (serde_json::Map::new(), true)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Registry document is corrupt");
            (serde_json::Map::new(), true)
        }
    }
}

/// Write a document as 2-space-indented JSON via a temporary sibling file
/// and an atomic rename. A failed write leaves the temporary file in place
/// for inspection; the document itself is whatever the last successful
/// rename produced.
pub(crate) fn write_document_atomic(path: &Path, value: &Value) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut buf = to_pretty_bytes(value)?;
    buf.push(b'\n');

    let tmp = temp_sibling(path);
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Serialize with a 2-space indent, the persisted-document convention.
pub(crate) fn to_pretty_bytes(value: &Value) -> crate::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(buf)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "registry".to_string(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!("{name}.tmp"))
}

fn numeric_suffix(id: &str) -> Option<u64> {
    id.rsplit_once('_').and_then(|(_, digits)| digits.parse().ok())
}

// =============================================================================
// Tests
// =============================================================================
