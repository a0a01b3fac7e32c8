//! Packrat - bounded-context compression and crash-resilient summarization
//!
//! An engine that keeps an unbounded, continuously growing conversation
//! within a bounded effective token budget without any model call:
//! - Streaming chunker with overlap for cross-chunk continuity
//! - Instant compression (TF-IDF terms, graph-ranked sentences, simhash
//!   near-duplicate filtering) raced against a deadline
//! - Cross-chunk merge/deduplication into one snapshot per scope
//! - Resource-adaptive scheduling and checkpoint-based crash recovery

pub mod checkpoint;
pub mod chunker;
pub mod compress;
pub mod governor;
pub mod merge;
pub mod scheduler;
pub mod storage;
pub mod text;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointState, DisconnectionCause};
pub use chunker::{Chunk, ChunkProducer, ChunkStatus, Message, Role};
pub use compress::{ChunkSummary, CompressOutcome, Compressor, InstantSummary};
pub use governor::{PressureState, ResourceGovernor};
pub use merge::{MergeEngine, MergedContext};
pub use scheduler::{Scheduler, ScopeStatus, Summarizer, TickOutcome};
pub use storage::{ContextStore, JsonFileStore, MemoryStore};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for a Packrat engine instance.
///
/// Every field has a working default; hosts typically tweak only the chunk
/// threshold and the data directory. Loadable from a TOML file where every
/// section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PackratConfig {
    pub scheduler: scheduler::SchedulerConfig,
    pub compressor: compress::CompressorConfig,
    pub governor: governor::GovernorConfig,
    pub checkpoint: checkpoint::CheckpointConfig,
    /// Root directory for checkpoints and file-backed stores.
    pub data_dir: Option<PathBuf>,
}

impl PackratConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| PackratError::Config(e.to_string()))
    }

    /// Resolve the data directory: the configured value, the platform data
    /// dir, or `./packrat-data` as a last resort.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("packrat"))
            .unwrap_or_else(|| PathBuf::from("packrat-data"))
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    pub fn with_chunk_threshold(mut self, tokens: usize) -> Self {
        self.scheduler.chunk_token_threshold = tokens;
        self
    }

    pub fn with_merge_threshold(mut self, chunks: usize) -> Self {
        self.scheduler.merge_threshold = chunks;
        self
    }
}

/// Result type for Packrat operations
pub type Result<T> = std::result::Result<T, PackratError>;

/// Errors that can occur in Packrat
#[derive(Debug, thiserror::Error)]
pub enum PackratError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Recovery attempts exhausted for scope {scope_key} after {attempts} tries")]
    RecoveryExhausted { scope_key: String, attempts: u32 },

    #[error("Summarizer error: {0}")]
    Summarizer(String),

    #[error("Unrecoverable fault: {0}")]
    Fault(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
