//! memloom CLI - thin operator surface over memloom-core.
//!
//! Every subcommand maps 1:1 to a coordinator operation and prints the
//! structured result as JSON, so the output can be piped into scripts the
//! same way the core's results flow to its callers.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use memloom_core::chunk::ChunkStatus;
use memloom_core::config::CoreConfig;
use memloom_core::coordinator::Coordinator;
use memloom_core::logging::init_logging;
use serde::Serialize;
use serde_json::{Value, json};

#[derive(Parser)]
#[command(
    name = "memloom",
    version,
    about = "Model-aware chunk and adapter versioning"
)]
struct Cli {
    /// Path to a memloom.toml config file
    #[arg(long, global = true, env = "MEMLOOM_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long, global = true, env = "MEMLOOM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Counts per status per entity, plus adapter drift
    Overview,
    /// Tail of the operation log
    History {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Model registration and switching
    #[command(subcommand)]
    Model(ModelCommand),
    /// Chunk lifecycle operations
    #[command(subcommand)]
    Chunk(ChunkCommand),
    /// Adapter (LoRA) operations
    #[command(subcommand)]
    Adapter(AdapterCommand),
}

#[derive(Subcommand)]
enum ModelCommand {
    /// Register a model and make it current
    Register {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Run the full switch protocol: invalidate stale adapters and report
    /// restorable chunks
    Switch {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Check whether the model changed, without mutating anything
    Detect { path: PathBuf },
    /// List known models, newest first
    List,
}

#[derive(Subcommand)]
enum ChunkCommand {
    /// Create a chunk from a JSON array of documents
    Create {
        /// File holding the JSON document array
        #[arg(long)]
        docs: PathBuf,
        #[arg(long)]
        character: Option<String>,
        /// Free-form JSON metadata
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List chunks, optionally filtered by status and/or model
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Show one chunk record
    Show { chunk_id: String },
    /// Print the preserved documents of a chunk
    Docs { chunk_id: String },
    /// Chunks that have not been trained yet
    Untrained,
    /// Chunks restorable against a model (default: current)
    Restorable {
        #[arg(long)]
        model: Option<String>,
    },
    /// Apply a status transition
    Mark {
        chunk_id: String,
        status: String,
        #[arg(long, default_value = "")]
        details: String,
    },
    /// Restore chunks; with no ids, every restorable chunk is selected
    Restore { chunk_ids: Vec<String> },
    /// Archive a chunk, optionally deleting its preserved documents
    Archive {
        chunk_id: String,
        #[arg(long)]
        delete_documents: bool,
    },
}

#[derive(Subcommand)]
enum AdapterCommand {
    /// Register a trained adapter for the current model
    Register {
        /// Chunks consumed by the training run
        #[arg(long, value_delimiter = ',')]
        chunks: Vec<String>,
        /// Adapter artifact file or directory to copy in
        #[arg(long)]
        source: PathBuf,
        /// Free-form JSON training config
        #[arg(long)]
        training_config: Option<String>,
        /// Free-form JSON metrics
        #[arg(long)]
        metrics: Option<String>,
    },
    /// List adapters, newest first
    List {
        /// Include deleted adapters
        #[arg(long)]
        all: bool,
    },
    /// Adapters compatible with a model (default: current)
    Compatible {
        #[arg(long)]
        model: Option<String>,
    },
    /// Compatibility envelope for one adapter
    Select { lora_id: String },
    /// Mark an adapter unusable
    Disable {
        lora_id: String,
        #[arg(long, default_value = "Marked unusable by operator")]
        reason: String,
    },
    /// Mark an adapter deleted, optionally removing its files
    Delete {
        lora_id: String,
        #[arg(long)]
        delete_files: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = CoreConfig::load_or_default(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Err(err) = init_logging(&config.logging) {
        eprintln!("warning: logging setup failed: {err}");
    }

    let coordinator = Coordinator::open(&config.data_dir)?;

    match cli.command {
        Command::Overview => print_json(&coordinator.overview()),
        Command::History { limit } => print_json(&coordinator.operation_history(limit)?),
        Command::Model(command) => run_model(&coordinator, command).await,
        Command::Chunk(command) => run_chunk(&coordinator, command).await,
        Command::Adapter(command) => run_adapter(&coordinator, command).await,
    }
}

async fn run_model(coordinator: &Coordinator, command: ModelCommand) -> anyhow::Result<()> {
    match command {
        ModelCommand::Register { path, name } => {
            print_json(&coordinator.register_model_async(path, name).await?)
        }
        ModelCommand::Switch { path, name } => {
            print_json(&coordinator.handle_model_switch_async(path, name).await?)
        }
        ModelCommand::Detect { path } => print_json(&coordinator.detect_model_change(&path)?),
        ModelCommand::List => print_json(&coordinator.list_known_models()),
    }
}

async fn run_chunk(coordinator: &Coordinator, command: ChunkCommand) -> anyhow::Result<()> {
    match command {
        ChunkCommand::Create {
            docs,
            character,
            metadata,
        } => {
            let documents = read_documents(&docs)?;
            let metadata = parse_json_arg(metadata.as_deref(), "--metadata")?;
            print_json(&coordinator.create_chunk(&documents, character.as_deref(), metadata)?)
        }
        ChunkCommand::List { status, model } => {
            let status = status
                .as_deref()
                .map(str::parse::<ChunkStatus>)
                .transpose()?;
            print_json(&coordinator.list_chunks(status, model.as_deref()))
        }
        ChunkCommand::Show { chunk_id } => {
            let chunk = coordinator
                .get_chunk(&chunk_id)
                .with_context(|| format!("unknown chunk: {chunk_id}"))?;
            print_json(&chunk)
        }
        ChunkCommand::Docs { chunk_id } => {
            let Some(documents) = coordinator.get_chunk_documents(&chunk_id)? else {
                bail!("no preserved documents for {chunk_id}");
            };
            print_json(&documents)
        }
        ChunkCommand::Untrained => print_json(&coordinator.list_untrained_chunks()),
        ChunkCommand::Restorable { model } => {
            print_json(&coordinator.list_restorable_chunks(model.as_deref()))
        }
        ChunkCommand::Mark {
            chunk_id,
            status,
            details,
        } => {
            let status: ChunkStatus = status.parse()?;
            let applied = coordinator.transition_chunk(&chunk_id, status, &details)?;
            print_json(&json!({"chunk_id": chunk_id, "applied": applied}))
        }
        ChunkCommand::Restore { chunk_ids } => {
            let selection = if chunk_ids.is_empty() {
                None
            } else {
                Some(chunk_ids)
            };
            print_json(&coordinator.restore_chunks_async(selection).await?)
        }
        ChunkCommand::Archive {
            chunk_id,
            delete_documents,
        } => {
            let applied = coordinator.archive_chunk(&chunk_id, delete_documents)?;
            print_json(&json!({"chunk_id": chunk_id, "applied": applied}))
        }
    }
}

async fn run_adapter(coordinator: &Coordinator, command: AdapterCommand) -> anyhow::Result<()> {
    match command {
        AdapterCommand::Register {
            chunks,
            source,
            training_config,
            metrics,
        } => {
            let training_config = parse_json_arg(training_config.as_deref(), "--training-config")?;
            let metrics = parse_json_arg(metrics.as_deref(), "--metrics")?;
            print_json(
                &coordinator
                    .register_adapter_async(chunks, source, training_config, metrics)
                    .await?,
            )
        }
        AdapterCommand::List { all } => print_json(&coordinator.list_adapters(all)),
        AdapterCommand::Compatible { model } => {
            print_json(&coordinator.list_compatible_adapters(model.as_deref()))
        }
        AdapterCommand::Select { lora_id } => print_json(&coordinator.select_adapter(&lora_id)),
        AdapterCommand::Disable { lora_id, reason } => {
            print_json(&coordinator.mark_adapter_unusable(&lora_id, &reason)?)
        }
        AdapterCommand::Delete {
            lora_id,
            delete_files,
        } => print_json(&coordinator.delete_adapter(&lora_id, delete_files)?),
    }
}

fn read_documents(path: &Path) -> anyhow::Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read documents file {}", path.display()))?;
    let documents: Vec<Value> = serde_json::from_str(&raw)
        .with_context(|| format!("{} must hold a JSON array of documents", path.display()))?;
    Ok(documents)
}

fn parse_json_arg(raw: Option<&str>, flag: &str) -> anyhow::Result<Option<Value>> {
    raw.map(|raw| serde_json::from_str(raw).with_context(|| format!("{flag} must be valid JSON")))
        .transpose()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
