//! Storage contract: the narrow, pluggable persistence surface the engine
//! depends on. Any conforming store is acceptable; the core never depends
//! on a concrete storage technology.
//!
//! Two implementations ship here: an in-memory store for tests and
//! embedding hosts, and a JSON-file store with atomic replace semantics.

use crate::chunker::Message;
use crate::merge::MergedContext;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::warn;

/// One appended conversation log entry for a scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: Message,
    /// Set once the entry has been folded into a merged snapshot.
    pub compressed: bool,
}

/// The persistence operations the engine requires.
#[allow(async_fn_in_trait)]
pub trait ContextStore {
    /// Append one log entry for a scope.
    async fn append_entry(&self, scope_key: &str, message: Message) -> Result<()>;

    /// Fetch the most recent `n` entries for a scope, oldest first.
    async fn recent_entries(&self, scope_key: &str, n: usize) -> Result<Vec<LogEntry>>;

    /// Fetch all not-yet-compressed entries for a scope, oldest first.
    async fn uncompressed_entries(&self, scope_key: &str) -> Result<Vec<LogEntry>>;

    /// Mark a set of entry ids compressed.
    async fn mark_compressed(&self, scope_key: &str, message_ids: &[String]) -> Result<()>;

    /// Get the single current summary-state record for a scope.
    async fn current_context(&self, scope_key: &str) -> Result<Option<MergedContext>>;

    /// Replace the single current summary-state record for a scope.
    async fn replace_current_context(&self, scope_key: &str, context: &MergedContext)
        -> Result<()>;

    /// Count not-yet-compressed entries for a scope.
    async fn uncompressed_count(&self, scope_key: &str) -> Result<usize>;
}

#[derive(Debug, Default)]
struct ScopeData {
    entries: Vec<LogEntry>,
    current: Option<MergedContext>,
}

/// In-memory store. State is lost on drop; useful for tests and hosts that
/// persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    scopes: Mutex<HashMap<String, ScopeData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextStore for MemoryStore {
    async fn append_entry(&self, scope_key: &str, message: Message) -> Result<()> {
        let mut scopes = self.scopes.lock().expect("store lock poisoned");
        scopes
            .entry(scope_key.to_string())
            .or_default()
            .entries
            .push(LogEntry {
                message,
                compressed: false,
            });
        Ok(())
    }

    async fn recent_entries(&self, scope_key: &str, n: usize) -> Result<Vec<LogEntry>> {
        let scopes = self.scopes.lock().expect("store lock poisoned");
        Ok(scopes
            .get(scope_key)
            .map(|data| {
                let skip = data.entries.len().saturating_sub(n);
                data.entries[skip..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn uncompressed_entries(&self, scope_key: &str) -> Result<Vec<LogEntry>> {
        let scopes = self.scopes.lock().expect("store lock poisoned");
        Ok(scopes
            .get(scope_key)
            .map(|data| {
                data.entries
                    .iter()
                    .filter(|e| !e.compressed)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_compressed(&self, scope_key: &str, message_ids: &[String]) -> Result<()> {
        let mut scopes = self.scopes.lock().expect("store lock poisoned");
        if let Some(data) = scopes.get_mut(scope_key) {
            for entry in data.entries.iter_mut() {
                if message_ids.contains(&entry.message.id) {
                    entry.compressed = true;
                }
            }
        }
        Ok(())
    }

    async fn current_context(&self, scope_key: &str) -> Result<Option<MergedContext>> {
        let scopes = self.scopes.lock().expect("store lock poisoned");
        Ok(scopes.get(scope_key).and_then(|data| data.current.clone()))
    }

    async fn replace_current_context(
        &self,
        scope_key: &str,
        context: &MergedContext,
    ) -> Result<()> {
        let mut scopes = self.scopes.lock().expect("store lock poisoned");
        scopes.entry(scope_key.to_string()).or_default().current = Some(context.clone());
        Ok(())
    }

    async fn uncompressed_count(&self, scope_key: &str) -> Result<usize> {
        let scopes = self.scopes.lock().expect("store lock poisoned");
        Ok(scopes
            .get(scope_key)
            .map(|data| data.entries.iter().filter(|e| !e.compressed).count())
            .unwrap_or(0))
    }
}

/// On-disk serialized form of one scope's data.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ScopeFile {
    entries: Vec<LogEntry>,
    current: Option<MergedContext>,
}

/// JSON-file store: one file per scope under a data directory.
///
/// The current snapshot file is a durable hand-off point between a crashed
/// run and its successor, so every write is write-new-then-rename.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`. Creates the directory if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn scope_path(&self, scope_key: &str) -> PathBuf {
        let safe: String = scope_key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.scope.json"))
    }

    /// A malformed scope file is treated as absent (start fresh).
    async fn load(&self, scope_key: &str) -> ScopeFile {
        let path = self.scope_path(scope_key);
        let Ok(content) = fs::read_to_string(&path).await else {
            return ScopeFile::default();
        };
        match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), "corrupt scope file, starting fresh: {e}");
                ScopeFile::default()
            }
        }
    }

    async fn save(&self, scope_key: &str, file: &ScopeFile) -> Result<()> {
        let path = self.scope_path(scope_key);
        write_atomic(&path, &serde_json::to_string_pretty(file)?).await
    }
}

impl ContextStore for JsonFileStore {
    async fn append_entry(&self, scope_key: &str, message: Message) -> Result<()> {
        let mut file = self.load(scope_key).await;
        file.entries.push(LogEntry {
            message,
            compressed: false,
        });
        self.save(scope_key, &file).await
    }

    async fn recent_entries(&self, scope_key: &str, n: usize) -> Result<Vec<LogEntry>> {
        let file = self.load(scope_key).await;
        let skip = file.entries.len().saturating_sub(n);
        Ok(file.entries[skip..].to_vec())
    }

    async fn uncompressed_entries(&self, scope_key: &str) -> Result<Vec<LogEntry>> {
        let file = self.load(scope_key).await;
        Ok(file.entries.into_iter().filter(|e| !e.compressed).collect())
    }

    async fn mark_compressed(&self, scope_key: &str, message_ids: &[String]) -> Result<()> {
        let mut file = self.load(scope_key).await;
        for entry in file.entries.iter_mut() {
            if message_ids.contains(&entry.message.id) {
                entry.compressed = true;
            }
        }
        self.save(scope_key, &file).await
    }

    async fn current_context(&self, scope_key: &str) -> Result<Option<MergedContext>> {
        Ok(self.load(scope_key).await.current)
    }

    async fn replace_current_context(
        &self,
        scope_key: &str,
        context: &MergedContext,
    ) -> Result<()> {
        let mut file = self.load(scope_key).await;
        file.current = Some(context.clone());
        self.save(scope_key, &file).await
    }

    async fn uncompressed_count(&self, scope_key: &str) -> Result<usize> {
        let file = self.load(scope_key).await;
        Ok(file.entries.iter().filter(|e| !e.compressed).count())
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
