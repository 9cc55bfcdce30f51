//! Model fingerprinting - deterministic identity for opaque model artifacts.
//!
//! A base model is identified by what it contains, not by what the operator
//! calls it. Identity is assembled from up to four signals:
//!
//! 1. a fingerprint over the architecture-defining fields of `config.json`
//! 2. a SHA-256 checksum of the largest weight file
//! 3. the weight file size in bytes
//! 4. the artifact basename
//!
//! Missing signals degrade the identity instead of failing it; the only hard
//! error is I/O on the file selected for checksumming. The combined
//! `identity_hash` (16 hex chars) is the primary key for every registry that
//! references a model.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::clock::now_iso;
use crate::error::FingerprintError;

/// Configuration fields that define a model architecture. Only these
/// participate in the config fingerprint; fields like paths or dtype hints
/// must not change a model's identity.
pub const CONFIG_FINGERPRINT_FIELDS: &[&str] = &[
    "model_type",
    "architectures",
    "vocab_size",
    "hidden_size",
    "num_hidden_layers",
    "num_attention_heads",
    "intermediate_size",
    "max_position_embeddings",
    "num_key_value_heads",
];

/// File extensions recognized as model weight files.
const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "bin", "gguf", "ggml", "pt"];

/// Above this size the checksum switches to the partial three-window scheme.
pub const PARTIAL_HASH_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Read granularity for full-file checksums.
const STREAM_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// Window size for partial checksums (start, middle, end of file).
const PARTIAL_WINDOW_BYTES: u64 = 64 * 1024 * 1024;

/// Derived identity of one base model.
///
/// `identity_hash` is the primary key; everything else is either an identity
/// signal or informational. `path` never participates in the hash unless no
/// other signal is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelIdentity {
    /// Filesystem path the model was identified from (informational).
    pub path: String,
    /// Basename of the path.
    pub name: String,
    /// When this identity was computed (ISO-8601).
    pub detected_at: String,
    /// SHA-256 of the largest weight file; `partial_`-prefixed above the
    /// size threshold.
    pub file_checksum: Option<String>,
    /// 32-hex-char digest over the architecture-defining config fields.
    pub config_fingerprint: Option<String>,
    /// Size in bytes of the checksummed weight file.
    pub file_size: Option<u64>,
    /// `model_type` from the parsed configuration.
    pub model_type: Option<String>,
    /// First entry of `architectures` from the parsed configuration.
    pub architecture: Option<String>,
    /// 16-hex-char combined digest; the model's primary key.
    pub identity_hash: String,
}

impl Default for ModelIdentity {
    fn default() -> Self {
        Self {
            path: String::new(),
            name: String::new(),
            detected_at: String::new(),
            file_checksum: None,
            config_fingerprint: None,
            file_size: None,
            model_type: None,
            architecture: None,
            identity_hash: String::new(),
        }
    }
}

/// Produce a [`ModelIdentity`] for a model file or directory.
///
/// Unreadable configuration and absent weight files degrade the identity;
/// an I/O failure on the selected weight file is the only hard error.
pub fn identify_model(path: &Path) -> Result<ModelIdentity, FingerprintError> {
    let name = path
        .file_name()
        .map_or_else(|| path.to_string_lossy().into_owned(), |n| {
            n.to_string_lossy().into_owned()
        });

    let mut identity = ModelIdentity {
        path: path.to_string_lossy().into_owned(),
        name,
        detected_at: now_iso(),
        ..ModelIdentity::default()
    };

    if let Some(config_path) = locate_config(path) {
        match read_config(&config_path) {
            Some(config) => {
                identity.config_fingerprint = config_fingerprint(&config);
                identity.model_type = Some(
                    config
                        .get("model_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                );
                identity.architecture = Some(
                    config
                        .get("architectures")
                        .and_then(|v| v.as_array())
                        .and_then(|a| a.first())
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                );
            }
            None => {
                warn!(config = %config_path.display(), "Could not read model config");
            }
        }
    }

    if let Some(weight_path) = select_weight_file(path) {
        let metadata = fs::metadata(&weight_path).map_err(|source| FingerprintError::Metadata {
            path: weight_path.clone(),
            source,
        })?;
        identity.file_size = Some(metadata.len());
        identity.file_checksum = Some(checksum_weight_file(&weight_path, metadata.len())?);
    }

    identity.identity_hash = combined_identity_hash(&identity);
    Ok(identity)
}

/// Async wrapper: checksumming a large weight file is a long blocking
/// computation, so the whole identification runs on a blocking thread.
pub async fn identify_model_async(path: PathBuf) -> crate::Result<ModelIdentity> {
    tokio::task::spawn_blocking(move || identify_model(&path))
        .await
        .map_err(|err| crate::Error::Background(err.to_string()))?
        .map_err(crate::Error::from)
}

/// Fingerprint the architecture-defining subset of a parsed configuration:
/// sorted-key JSON of the recognized fields, SHA-256, first 32 hex chars.
pub fn config_fingerprint(config: &serde_json::Value) -> Option<String> {
    let map = config.as_object()?;
    let mut subset: BTreeMap<&str, &serde_json::Value> = BTreeMap::new();
    for key in CONFIG_FINGERPRINT_FIELDS {
        if let Some(value) = map.get(*key) {
            subset.insert(key, value);
        }
    }
    let serialized = serde_json::to_string(&subset).ok()?;
    let digest = Sha256::digest(serialized.as_bytes());
    Some(hex::encode(digest)[..32].to_string())
}

/// Checksum a weight file, switching to the partial scheme above the size
/// threshold. Exposed so callers can checksum a known file directly.
pub fn compute_file_checksum(path: &Path) -> Result<String, FingerprintError> {
    let metadata = fs::metadata(path).map_err(|source| FingerprintError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    checksum_weight_file(path, metadata.len())
}

fn checksum_weight_file(path: &Path, size: u64) -> Result<String, FingerprintError> {
    if size > PARTIAL_HASH_THRESHOLD_BYTES {
        partial_checksum(path, size)
    } else {
        full_checksum(path)
    }
}

fn full_checksum(path: &Path) -> Result<String, FingerprintError> {
    let read_err = |source| FingerprintError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf).map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Partial scheme for very large files: hash three windows (start, middle,
/// end) plus the decimal byte size. The `partial_` prefix keeps these
/// digests from ever comparing equal to a full hash.
fn partial_checksum(path: &Path, size: u64) -> Result<String, FingerprintError> {
    let read_err = |source| FingerprintError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_err)?;
    let mut hasher = Sha256::new();
    let mut window = vec![0u8; usize::try_from(PARTIAL_WINDOW_BYTES).unwrap_or(usize::MAX)];

    let offsets = [0, size / 2, size.saturating_sub(PARTIAL_WINDOW_BYTES)];
    for offset in offsets {
        file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
        let mut filled = 0;
        while filled < window.len() {
            let n = file.read(&mut window[filled..]).map_err(read_err)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        hasher.update(&window[..filled]);
    }
    hasher.update(size.to_string().as_bytes());
    Ok(format!("partial_{}", hex::encode(hasher.finalize())))
}

/// Locate `config.json`: inside the path when it is a directory, next to it
/// when it is a file.
fn locate_config(path: &Path) -> Option<PathBuf> {
    let candidate = if path.is_dir() {
        path.join("config.json")
    } else {
        path.parent()?.join("config.json")
    };
    candidate.is_file().then_some(candidate)
}

fn read_config(path: &Path) -> Option<serde_json::Value> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Pick the single largest weight file. Ties break toward the
/// lexicographically smaller path so repeated scans are deterministic.
fn select_weight_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    if !path.is_dir() {
        return None;
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Could not enumerate model directory");
            return None;
        }
    };

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries.flatten() {
        let candidate = entry.path();
        if !candidate.is_file() {
            continue;
        }
        let recognized = candidate
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| WEIGHT_EXTENSIONS.contains(&ext));
        if !recognized {
            continue;
        }
        let size = entry.metadata().map_or(0, |m| m.len());
        let better = match &best {
            None => true,
            Some((best_size, best_path)) => {
                size > *best_size || (size == *best_size && candidate < *best_path)
            }
        };
        if better {
            best = Some((size, candidate));
        }
    }
    best.map(|(_, path)| path)
}

/// Combine the available signals into the 16-hex primary key. With no
/// signals at all, the raw path string keeps a degraded but stable identity.
fn combined_identity_hash(identity: &ModelIdentity) -> String {
    let mut components: Vec<String> = Vec::new();
    if let Some(fp) = &identity.config_fingerprint {
        components.push(fp.clone());
    }
    if let Some(checksum) = &identity.file_checksum {
        components.push(checksum.clone());
    }
    if let Some(size) = identity.file_size {
        components.push(size.to_string());
    }
    if !identity.name.is_empty() {
        components.push(identity.name.clone());
    }

    let seed = if components.is_empty() {
        identity.path.clone()
    } else {
        components.join("|")
    };
    hex::encode(Sha256::digest(seed.as_bytes()))[..16].to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_model_dir(config: &serde_json::Value, weights: &[(&str, &[u8])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.json"),
            serde_json::to_string_pretty(config).unwrap(),
        )
        .unwrap();
        for (name, bytes) in weights {
            fs::write(dir.path().join(name), bytes).unwrap();
        }
        dir
    }

    fn sample_config() -> serde_json::Value {
        json!({
            "model_type": "llama",
            "architectures": ["LlamaForCausalLM"],
            "vocab_size": 32000,
            "hidden_size": 4096,
            "torch_dtype": "bfloat16"
        })
    }

    #[test]
    fn identity_is_stable_across_runs() {
        let dir = write_model_dir(&sample_config(), &[("model.safetensors", b"weights")]);

        let first = identify_model(dir.path()).unwrap();
        let second = identify_model(dir.path()).unwrap();
        assert_eq!(first.identity_hash, second.identity_hash);
        assert_eq!(first.identity_hash.len(), 16);
        assert!(first.identity_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identity_reads_config_signals() {
        let dir = write_model_dir(&sample_config(), &[("model.safetensors", b"weights")]);

        let identity = identify_model(dir.path()).unwrap();
        assert_eq!(identity.model_type.as_deref(), Some("llama"));
        assert_eq!(identity.architecture.as_deref(), Some("LlamaForCausalLM"));
        assert_eq!(identity.file_size, Some(7));
        assert_eq!(identity.config_fingerprint.as_ref().unwrap().len(), 32);
    }

    #[test]
    fn changed_architecture_field_changes_identity() {
        let dir_a = write_model_dir(&sample_config(), &[("model.safetensors", b"weights")]);
        let mut other = sample_config();
        other["vocab_size"] = json!(50000);
        let dir_b = write_model_dir(&other, &[("model.safetensors", b"weights")]);

        let a = identify_model(dir_a.path()).unwrap();
        let b = identify_model(dir_b.path()).unwrap();
        assert_ne!(a.config_fingerprint, b.config_fingerprint);
    }

    #[test]
    fn unrecognized_config_field_does_not_change_fingerprint() {
        let base = config_fingerprint(&sample_config()).unwrap();
        let mut other = sample_config();
        other["torch_dtype"] = json!("float16");
        assert_eq!(config_fingerprint(&other).unwrap(), base);
    }

    #[test]
    fn largest_weight_file_wins() {
        let dir = write_model_dir(
            &sample_config(),
            &[
                ("small.bin", b"ab".as_slice()),
                ("large.safetensors", b"abcdefgh".as_slice()),
            ],
        );

        let identity = identify_model(dir.path()).unwrap();
        assert_eq!(identity.file_size, Some(8));
        assert_eq!(
            identity.file_checksum.as_deref().unwrap(),
            compute_file_checksum(&dir.path().join("large.safetensors"))
                .unwrap()
                .as_str()
        );
    }

    #[test]
    fn missing_config_degrades_without_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("model.gguf"), b"quantized").unwrap();

        let identity = identify_model(dir.path()).unwrap();
        assert!(identity.config_fingerprint.is_none());
        assert!(identity.model_type.is_none());
        assert!(identity.file_checksum.is_some());
        assert_eq!(identity.identity_hash.len(), 16);
    }

    #[test]
    fn config_next_to_single_file_model_is_used() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.json"),
            serde_json::to_string(&sample_config()).unwrap(),
        )
        .unwrap();
        let weight = dir.path().join("model.gguf");
        fs::write(&weight, b"quantized").unwrap();

        let identity = identify_model(&weight).unwrap();
        assert!(identity.config_fingerprint.is_some());
        assert_eq!(identity.name, "model.gguf");
    }

    #[test]
    fn nonexistent_path_yields_degraded_stable_identity() {
        let path = Path::new("/definitely/not/present/model-x");
        let first = identify_model(path).unwrap();
        let second = identify_model(path).unwrap();
        assert_eq!(first.identity_hash, second.identity_hash);
        assert!(first.file_checksum.is_none());
        assert!(first.config_fingerprint.is_none());
    }

    #[test]
    fn partial_checksum_carries_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.bin");
        fs::write(&path, b"0123456789").unwrap();

        let digest = partial_checksum(&path, 10).unwrap();
        assert!(digest.starts_with("partial_"));
        assert_eq!(digest, partial_checksum(&path, 10).unwrap());
        assert_ne!(digest, partial_checksum(&path, 11).unwrap());
    }

    #[tokio::test]
    async fn async_wrapper_matches_sync_result() {
        let dir = write_model_dir(&sample_config(), &[("model.safetensors", b"weights")]);

        let sync_identity = identify_model(dir.path()).unwrap();
        let async_identity = identify_model_async(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(sync_identity.identity_hash, async_identity.identity_hash);
    }
}
