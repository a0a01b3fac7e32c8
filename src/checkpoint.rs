//! Checkpoint/Recovery subsystem: durable, resumable progress records for
//! each scope's in-flight processing.
//!
//! Exactly one checkpoint is active per scope. Every state change rewrites
//! the full record plus a small pointer record; the pointer is the single
//! source of truth for "does this scope need recovery". Writes are
//! write-new-then-rename so a crash mid-write never leaves a torn file.

use crate::{PackratError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Lifecycle of a checkpoint. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Processing,
    Paused,
    Recovering,
    Completed,
    Failed,
}

/// Classified cause recorded when processing is interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectionCause {
    Network,
    UserInterrupt,
    SystemCrash,
    SessionExpired,
    Timeout,
    Unknown,
}

/// Progress through a scope's chunk backlog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointProgress {
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub last_chunk_id: Option<String>,
    pub percent_complete: f32,
}

impl CheckpointProgress {
    fn recompute(&mut self) {
        self.percent_complete = if self.total_chunks == 0 {
            0.0
        } else {
            (self.processed_chunks as f32 / self.total_chunks as f32) * 100.0
        };
    }
}

/// Recovery bookkeeping for a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub resumable: bool,
    pub last_disconnection_cause: Option<DisconnectionCause>,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// The durable, resumable progress record for one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub scope_key: String,
    pub state: CheckpointState,
    pub progress: CheckpointProgress,
    pub recovery: RecoveryInfo,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Small pointer record: the single source of truth for recovery detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPointer {
    pub current_checkpoint_id: String,
    pub scope_key: String,
    pub state: CheckpointState,
    pub updated_at: DateTime<Utc>,
    pub resumable: bool,
}

/// Heartbeat configuration: interval between beats, stall timeout, and the
/// number of consecutive misses before a stall is declared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_misses: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 5_000,
            max_misses: 3,
        }
    }
}

/// Tracks liveness for one scope's processing.
#[derive(Debug, Clone)]
struct Heartbeat {
    last_beat: Instant,
    misses: u32,
    cfg: HeartbeatConfig,
}

impl Heartbeat {
    fn new(cfg: HeartbeatConfig) -> Self {
        Self {
            last_beat: Instant::now(),
            misses: 0,
            cfg,
        }
    }

    fn beat(&mut self) {
        self.last_beat = Instant::now();
        self.misses = 0;
    }

    /// Check liveness at `now`; returns true once enough consecutive
    /// timeouts have accumulated to declare a silent stall.
    fn check(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_beat) > Duration::from_millis(self.cfg.timeout_ms) {
            self.misses += 1;
            // Each miss consumes one timeout window
            self.last_beat = now;
        }
        self.misses >= self.cfg.max_misses
    }
}

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub heartbeat: HeartbeatConfig,
    pub max_recovery_attempts: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            max_recovery_attempts: 5,
        }
    }
}

/// Owns the active checkpoints and their on-disk records.
///
/// Directory layout:
///   {dir}/{scope}__{checkpoint_id}.json
///   {dir}/{scope}.current.json        (pointer record)
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    cfg: CheckpointConfig,
    active: HashMap<String, Checkpoint>,
    heartbeats: HashMap<String, Heartbeat>,
    sequence: u64,
}

impl CheckpointManager {
    /// Create a manager rooted at `dir`. Creates the directory if needed.
    pub async fn new(dir: impl Into<PathBuf>, cfg: CheckpointConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            cfg,
            active: HashMap::new(),
            heartbeats: HashMap::new(),
            sequence: 0,
        })
    }

    /// Begin a new checkpoint for a scope, superseding any prior one.
    pub async fn begin(&mut self, scope_key: &str, total_chunks: usize) -> Result<String> {
        self.sequence += 1;
        let now = Utc::now();
        let id = format!("ckpt-{}-{}", now.timestamp_millis(), self.sequence);
        let mut progress = CheckpointProgress {
            total_chunks,
            ..Default::default()
        };
        progress.recompute();
        let checkpoint = Checkpoint {
            id: id.clone(),
            scope_key: scope_key.to_string(),
            state: CheckpointState::Processing,
            progress,
            recovery: RecoveryInfo {
                resumable: true,
                last_disconnection_cause: None,
                attempts: 0,
                max_attempts: self.cfg.max_recovery_attempts,
            },
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        self.persist(&checkpoint).await;
        self.active.insert(scope_key.to_string(), checkpoint);
        self.heartbeats
            .insert(scope_key.to_string(), Heartbeat::new(self.cfg.heartbeat));
        info!(scope = scope_key, checkpoint = %id, "checkpoint started");
        Ok(id)
    }

    /// Record chunk progress; recomputes percent and persists immediately.
    pub async fn record_progress(
        &mut self,
        scope_key: &str,
        processed_chunks: usize,
        last_chunk_id: Option<String>,
    ) {
        let Some(checkpoint) = self.active.get_mut(scope_key) else {
            return;
        };
        checkpoint.progress.processed_chunks = processed_chunks;
        if last_chunk_id.is_some() {
            checkpoint.progress.last_chunk_id = last_chunk_id;
        }
        checkpoint.progress.recompute();
        checkpoint.updated_at = Utc::now();
        let snapshot = checkpoint.clone();
        self.persist(&snapshot).await;
    }

    /// Grow the tracked total when new chunks arrive mid-run.
    pub async fn extend_total(&mut self, scope_key: &str, total_chunks: usize) {
        let Some(checkpoint) = self.active.get_mut(scope_key) else {
            return;
        };
        checkpoint.progress.total_chunks = total_chunks;
        checkpoint.progress.recompute();
        checkpoint.updated_at = Utc::now();
        let snapshot = checkpoint.clone();
        self.persist(&snapshot).await;
    }

    /// Mark a scope paused with a classified disconnection cause.
    pub async fn pause(&mut self, scope_key: &str, cause: DisconnectionCause) {
        let Some(checkpoint) = self.active.get_mut(scope_key) else {
            return;
        };
        if matches!(
            checkpoint.state,
            CheckpointState::Completed | CheckpointState::Failed
        ) {
            return;
        }
        checkpoint.state = CheckpointState::Paused;
        checkpoint.recovery.last_disconnection_cause = Some(cause);
        checkpoint.updated_at = Utc::now();
        let snapshot = checkpoint.clone();
        self.persist(&snapshot).await;
        info!(scope = scope_key, ?cause, "checkpoint paused");
    }

    /// Pause every active, non-terminal checkpoint. Used by signal
    /// interception before the process exits.
    pub async fn pause_all(&mut self, cause: DisconnectionCause) {
        let scopes: Vec<String> = self.active.keys().cloned().collect();
        for scope in scopes {
            self.pause(&scope, cause).await;
        }
    }

    /// Mark a scope's checkpoint completed (terminal).
    pub async fn complete(&mut self, scope_key: &str) {
        if let Some(checkpoint) = self.active.get_mut(scope_key) {
            checkpoint.state = CheckpointState::Completed;
            checkpoint.recovery.resumable = false;
            checkpoint.updated_at = Utc::now();
            let snapshot = checkpoint.clone();
            self.persist(&snapshot).await;
            info!(scope = scope_key, "checkpoint completed");
        }
        self.heartbeats.remove(scope_key);
    }

    /// Mark a scope's checkpoint failed (terminal).
    pub async fn fail(&mut self, scope_key: &str, reason: &str) {
        if let Some(checkpoint) = self.active.get_mut(scope_key) {
            checkpoint.state = CheckpointState::Failed;
            checkpoint.recovery.resumable = false;
            checkpoint
                .metadata
                .insert("failure_reason".to_string(), reason.to_string());
            checkpoint.updated_at = Utc::now();
            let snapshot = checkpoint.clone();
            self.persist(&snapshot).await;
            error!(scope = scope_key, reason, "checkpoint failed");
        }
        self.heartbeats.remove(scope_key);
    }

    /// Record liveness for a scope.
    pub fn heartbeat(&mut self, scope_key: &str) {
        if let Some(hb) = self.heartbeats.get_mut(scope_key) {
            hb.beat();
        }
    }

    /// Scopes whose heartbeats have missed too many consecutive windows.
    pub fn stalled_scopes(&mut self) -> Vec<String> {
        let now = Instant::now();
        let mut stalled = Vec::new();
        for (scope, hb) in self.heartbeats.iter_mut() {
            if hb.check(now) {
                stalled.push(scope.clone());
            }
        }
        stalled
    }

    /// Read the pointer record and decide whether the scope needs recovery:
    /// an interrupted or still-`processing` pointer that is resumable.
    pub async fn needs_recovery(&self, scope_key: &str) -> bool {
        match self.read_pointer(scope_key).await {
            Some(pointer) => {
                pointer.resumable
                    && matches!(
                        pointer.state,
                        CheckpointState::Processing | CheckpointState::Paused
                    )
            }
            None => false,
        }
    }

    /// Restore an interrupted scope: `Recovering -> Processing`, heartbeat
    /// reset, attempt counter incremented. Refused once attempts exceed the
    /// configured cap.
    pub async fn resume(&mut self, scope_key: &str) -> Result<Checkpoint> {
        let pointer = self.read_pointer(scope_key).await.ok_or_else(|| {
            PackratError::Checkpoint(format!("no checkpoint pointer for scope {scope_key}"))
        })?;
        let path = self.checkpoint_path(scope_key, &pointer.current_checkpoint_id);
        let mut checkpoint = self.read_checkpoint(&path).await.ok_or_else(|| {
            PackratError::Checkpoint(format!(
                "checkpoint {} missing or corrupt",
                pointer.current_checkpoint_id
            ))
        })?;

        if !checkpoint.recovery.resumable {
            return Err(PackratError::Checkpoint(format!(
                "checkpoint {} is not resumable",
                checkpoint.id
            )));
        }
        if checkpoint.recovery.attempts >= checkpoint.recovery.max_attempts {
            self.active.insert(scope_key.to_string(), checkpoint.clone());
            self.fail(scope_key, "recovery attempts exhausted").await;
            return Err(PackratError::RecoveryExhausted {
                scope_key: scope_key.to_string(),
                attempts: checkpoint.recovery.attempts,
            });
        }

        checkpoint.recovery.attempts += 1;
        checkpoint.state = CheckpointState::Recovering;
        checkpoint.updated_at = Utc::now();
        self.persist(&checkpoint).await;

        checkpoint.state = CheckpointState::Processing;
        checkpoint.updated_at = Utc::now();
        self.persist(&checkpoint).await;

        self.active
            .insert(scope_key.to_string(), checkpoint.clone());
        self.heartbeats
            .insert(scope_key.to_string(), Heartbeat::new(self.cfg.heartbeat));
        info!(
            scope = scope_key,
            attempt = checkpoint.recovery.attempts,
            last_chunk = ?checkpoint.progress.last_chunk_id,
            "checkpoint resumed"
        );
        Ok(checkpoint)
    }

    /// The in-memory checkpoint for a scope, if one is active.
    pub fn active(&self, scope_key: &str) -> Option<&Checkpoint> {
        self.active.get(scope_key)
    }

    /// List all checkpoint record files for a scope, newest first.
    pub async fn list(&self, scope_key: &str) -> Result<Vec<Checkpoint>> {
        let prefix = format!("{}__", sanitize(scope_key));
        let mut found = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                if let Some(checkpoint) = self.read_checkpoint(&entry.path()).await {
                    found.push(checkpoint);
                }
            }
        }
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(found)
    }

    /// Remove superseded checkpoint files, keeping the most recent `keep`.
    pub async fn cleanup(&self, scope_key: &str, keep: usize) -> Result<usize> {
        let checkpoints = self.list(scope_key).await?;
        let mut removed = 0;
        for stale in checkpoints.iter().skip(keep) {
            let path = self.checkpoint_path(scope_key, &stale.id);
            if fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(scope = scope_key, removed, "cleaned up superseded checkpoints");
        }
        Ok(removed)
    }

    /// Persist the full record plus the pointer record. A write failure is
    /// logged and tolerated: the in-memory state keeps operating and the
    /// next state change retries the write.
    async fn persist(&self, checkpoint: &Checkpoint) {
        let path = self.checkpoint_path(&checkpoint.scope_key, &checkpoint.id);
        if let Err(e) = write_json_atomic(&path, checkpoint).await {
            warn!(scope = %checkpoint.scope_key, "checkpoint write failed: {e}");
            return;
        }
        let pointer = CheckpointPointer {
            current_checkpoint_id: checkpoint.id.clone(),
            scope_key: checkpoint.scope_key.clone(),
            state: checkpoint.state,
            updated_at: checkpoint.updated_at,
            resumable: checkpoint.recovery.resumable,
        };
        let pointer_path = self.pointer_path(&checkpoint.scope_key);
        if let Err(e) = write_json_atomic(&pointer_path, &pointer).await {
            warn!(scope = %checkpoint.scope_key, "pointer write failed: {e}");
        }
    }

    async fn read_pointer(&self, scope_key: &str) -> Option<CheckpointPointer> {
        let path = self.pointer_path(scope_key);
        read_json_or_absent(&path).await
    }

    async fn read_checkpoint(&self, path: &Path) -> Option<Checkpoint> {
        read_json_or_absent(path).await
    }

    fn checkpoint_path(&self, scope_key: &str, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}__{}.json", sanitize(scope_key), sanitize(id)))
    }

    fn pointer_path(&self, scope_key: &str) -> PathBuf {
        self.dir.join(format!("{}.current.json", sanitize(scope_key)))
    }
}

/// Sanitize a scope key or id for use as a filename.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write a JSON record atomically: write a sibling temp file, then rename.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read and parse a JSON record; a missing or malformed file is treated as
/// absent rather than an error.
async fn read_json_or_absent<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), "malformed record treated as absent: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> CheckpointManager {
        CheckpointManager::new(dir.path(), CheckpointConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_begin_persists_record_and_pointer() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir).await;
        let id = mgr.begin("scope-a", 10).await.unwrap();

        let pointer: CheckpointPointer =
            read_json_or_absent(&dir.path().join("scope-a.current.json"))
                .await
                .unwrap();
        assert_eq!(pointer.current_checkpoint_id, id);
        assert_eq!(pointer.state, CheckpointState::Processing);
        assert!(pointer.resumable);
    }

    #[tokio::test]
    async fn test_progress_percent_recomputed() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir).await;
        mgr.begin("scope-a", 4).await.unwrap();
        mgr.record_progress("scope-a", 1, Some("chunk-1".to_string()))
            .await;
        let active = mgr.active("scope-a").unwrap();
        assert_eq!(active.progress.percent_complete, 25.0);
        assert_eq!(active.progress.last_chunk_id.as_deref(), Some("chunk-1"));
    }

    #[tokio::test]
    async fn test_recovery_detection_and_resume() {
        let dir = TempDir::new().unwrap();
        {
            let mut mgr = manager(&dir).await;
            mgr.begin("scope-a", 10).await.unwrap();
            mgr.record_progress("scope-a", 3, Some("chunk-3".to_string()))
                .await;
            // Simulated crash: manager dropped with state still Processing
        }

        let mut fresh = manager(&dir).await;
        assert!(fresh.needs_recovery("scope-a").await);
        let restored = fresh.resume("scope-a").await.unwrap();
        assert_eq!(restored.state, CheckpointState::Processing);
        assert_eq!(restored.progress.processed_chunks, 3);
        assert_eq!(restored.progress.last_chunk_id.as_deref(), Some("chunk-3"));
        assert_eq!(restored.recovery.attempts, 1);
    }

    #[tokio::test]
    async fn test_completed_scope_needs_no_recovery() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir).await;
        mgr.begin("scope-a", 1).await.unwrap();
        mgr.record_progress("scope-a", 1, Some("chunk-1".to_string()))
            .await;
        mgr.complete("scope-a").await;
        assert!(!mgr.needs_recovery("scope-a").await);
    }

    #[tokio::test]
    async fn test_resume_refused_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let mut mgr = CheckpointManager::new(
            dir.path(),
            CheckpointConfig {
                max_recovery_attempts: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        mgr.begin("scope-a", 10).await.unwrap();

        assert!(mgr.resume("scope-a").await.is_ok());
        assert!(mgr.resume("scope-a").await.is_ok());
        let refused = mgr.resume("scope-a").await;
        assert!(matches!(
            refused,
            Err(PackratError::RecoveryExhausted { .. })
        ));
        // Terminal failure is durable: pointer is no longer resumable
        assert!(!mgr.needs_recovery("scope-a").await);
    }

    #[tokio::test]
    async fn test_pause_records_cause() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir).await;
        mgr.begin("scope-a", 5).await.unwrap();
        mgr.pause("scope-a", DisconnectionCause::UserInterrupt).await;

        let active = mgr.active("scope-a").unwrap();
        assert_eq!(active.state, CheckpointState::Paused);
        assert_eq!(
            active.recovery.last_disconnection_cause,
            Some(DisconnectionCause::UserInterrupt)
        );
        // A paused, resumable scope is recoverable on restart
        assert!(mgr.needs_recovery("scope-a").await);
    }

    #[tokio::test]
    async fn test_corrupt_pointer_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        fs::write(dir.path().join("scope-a.current.json"), b"{not json")
            .await
            .unwrap();
        assert!(!mgr.needs_recovery("scope-a").await);
    }

    #[tokio::test]
    async fn test_heartbeat_stall_detection() {
        let dir = TempDir::new().unwrap();
        let mut mgr = CheckpointManager::new(
            dir.path(),
            CheckpointConfig {
                heartbeat: HeartbeatConfig {
                    interval_ms: 1,
                    timeout_ms: 1,
                    max_misses: 3,
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();
        mgr.begin("scope-a", 5).await.unwrap();

        mgr.heartbeat("scope-a");
        assert!(mgr.stalled_scopes().is_empty());

        // Three consecutive missed windows declare a stall
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(3));
            let _ = mgr.stalled_scopes();
        }
        std::thread::sleep(Duration::from_millis(3));
        assert_eq!(mgr.stalled_scopes(), vec!["scope-a".to_string()]);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir).await;
        for _ in 0..4 {
            mgr.begin("scope-a", 1).await.unwrap();
        }
        let removed = mgr.cleanup("scope-a", 2).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(mgr.list("scope-a").await.unwrap().len(), 2);
    }
}
