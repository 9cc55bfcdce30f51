//! memloom-core: the chunk & versioning core of a memory-augmented
//! conversational AI backend.
//!
//! The core maintains a consistent bidirectional relationship between three
//! evolving entities: base models (identified by content, not by name), data
//! chunks (batches of documents that flowed through the training pipeline),
//! and adapter artifacts (the fine-tuned deltas produced from those chunks).
//! Switching the base model never silently corrupts retrieval or inference:
//! adapters bound to the previous model are invalidated, and every chunk
//! whose documents were consumed to produce them stays recoverable.
//!
//! # Architecture
//!
//! ```text
//! caller -> Coordinator -> Fingerprinter (model identity)
//!                       -> ChunkStore    (lifecycle + preserved documents)
//!                       -> AdapterStore  (LoRA records)
//!                       -> ModelStore    (known models + current pointer)
//!                       -> OperationLog  (append-only diagnostic trail)
//! ```
//!
//! # Modules
//!
//! - `fingerprint`: content-derived model identity
//! - `registry`: persistent JSON registry documents with atomic replacement
//! - `chunk`: data chunk lifecycle state machine and preserved documents
//! - `adapter`: adapter (LoRA) records and artifact management
//! - `model`: known-model records and the current-model pointer
//! - `coordinator`: the model-switch protocol and the public surface
//! - `oplog`: append-only operation log
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `error`: error taxonomy
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod chunk;
mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod model;
pub mod oplog;
pub mod registry;

pub use error::{ConfigError, Error, FingerprintError, RegistryError, Result};

/// Version of memloom-core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
