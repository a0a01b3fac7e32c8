//! Background Scheduler: the single cooperative loop that pulls pending
//! chunks through the compression orchestrator (or the optional summarizer
//! collaborator) and triggers merge cycles.
//!
//! Each tick processes at most one pending chunk; merge checks only run on
//! otherwise-idle ticks. One chunk's failure never halts the loop: the
//! chunk reverts to pending and is retried on a later tick.

use crate::checkpoint::{CheckpointConfig, CheckpointManager, CheckpointState, DisconnectionCause};
use crate::chunker::{Chunk, ChunkProducer, ChunkStatus, Message};
use crate::compress::{ChunkSummary, CompressOutcome, Compressor, CompressorConfig};
use crate::governor::{GovernorConfig, PressureState, ResourceGovernor};
use crate::merge::{AssistedSummary, MergeEngine};
use crate::storage::ContextStore;
use crate::{PackratError, Result};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Prompt sent to the summarizer collaborator for one chunk.
const SUMMARIZE_PROMPT: &str = "You are compressing one slice of a long conversation. \
Produce a JSON object with fields `summary` (a concise handoff paragraph), `decisions` \
(array of {description, importance: low|medium|high|critical}), `tasks` (array of \
{description, status: pending|in_progress|completed}), `code_changes` (array of \
{path, description}), and `tags` (array of short topical strings). Capture progress, \
key decisions, constraints and next steps; omit pleasantries.";

/// Placeholder summary attached when the collaborator's output cannot be
/// parsed; the instant pipeline's tags are kept alongside it.
const FALLBACK_SUMMARY: &str =
    "Summary unavailable for this segment; key terms were extracted instead.";

/// Optional external collaborator for model-assisted summarization.
///
/// Returns a serialized record with fields `{summary, decisions, tasks,
/// code_changes, tags}`. Parse failures never propagate upward; the
/// scheduler falls back to instant extraction.
#[allow(async_fn_in_trait)]
pub trait Summarizer {
    async fn summarize(&self, chunk: &Chunk, prompt: &str) -> Result<String>;
}

/// Placeholder type for schedulers with no summarizer configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSummarizer;

impl Summarizer for NoSummarizer {
    async fn summarize(&self, _chunk: &Chunk, _prompt: &str) -> Result<String> {
        Err(PackratError::Summarizer("no summarizer configured".to_string()))
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between scheduler ticks.
    pub tick_interval_ms: u64,
    /// Summarized chunks per scope that trigger a merge cycle.
    pub merge_threshold: usize,
    /// Per-chunk compression deadline.
    pub compression_deadline_ms: u64,
    /// Token band within which a chunk is offered to the summarizer.
    pub assisted_min_tokens: usize,
    pub assisted_max_tokens: usize,
    /// Chunk production settings.
    pub chunk_token_threshold: usize,
    pub overlap_percent: u8,
    /// Merge dedupe threshold.
    pub jaccard_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            merge_threshold: 5,
            compression_deadline_ms: 2_000,
            assisted_min_tokens: 100,
            assisted_max_tokens: 4_000,
            chunk_token_threshold: 500,
            overlap_percent: 10,
            jaccard_threshold: 0.7,
        }
    }
}

/// What one scheduler tick did. Callers see structured outcomes, never raw
/// faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing pending and no merge due.
    Idle,
    /// Governor reports no capacity; the loop idles without polling.
    Paused,
    /// One chunk was compressed (or summarizer-assisted) successfully.
    Summarized { chunk_id: String },
    /// One chunk was a near-duplicate and carries no summary.
    DuplicateDropped { chunk_id: String },
    /// Processing failed; the chunk reverted to pending for a later tick.
    Reverted { chunk_id: String },
    /// A merge cycle folded summarized chunks into a new snapshot.
    Merged { scope_key: String, consumed: usize },
}

/// Structured status snapshot for one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeStatus {
    pub scope_key: String,
    pub pending: usize,
    pub summarizing: usize,
    pub summarized: usize,
    pub merged: usize,
    pub percent_complete: f32,
    pub checkpoint_state: Option<CheckpointState>,
    pub resumable: bool,
    pub governor_state: PressureState,
}

/// One engine context: chunk producers, compressor, merge engine, governor
/// and checkpoints for a set of scopes, driving work from a single loop.
pub struct Scheduler<S: ContextStore, M: Summarizer = NoSummarizer> {
    cfg: SchedulerConfig,
    store: S,
    summarizer: Option<M>,
    compressor: Compressor,
    merger: MergeEngine,
    governor: ResourceGovernor,
    checkpoints: CheckpointManager,
    producers: HashMap<String, ChunkProducer>,
    chunks: HashMap<String, Vec<Chunk>>,
    /// Scopes in first-seen order, so iteration is deterministic.
    scope_order: Vec<String>,
}

impl<S: ContextStore> Scheduler<S, NoSummarizer> {
    /// Build a scheduler with no summarizer collaborator.
    pub async fn new(
        cfg: SchedulerConfig,
        compressor_cfg: CompressorConfig,
        governor_cfg: GovernorConfig,
        checkpoint_cfg: CheckpointConfig,
        checkpoint_dir: impl Into<PathBuf>,
        store: S,
    ) -> Result<Self> {
        Self::with_summarizer(
            cfg,
            compressor_cfg,
            governor_cfg,
            checkpoint_cfg,
            checkpoint_dir,
            store,
            None,
        )
        .await
    }
}

impl<S: ContextStore, M: Summarizer> Scheduler<S, M> {
    #[allow(clippy::too_many_arguments)]
    pub async fn with_summarizer(
        cfg: SchedulerConfig,
        compressor_cfg: CompressorConfig,
        governor_cfg: GovernorConfig,
        checkpoint_cfg: CheckpointConfig,
        checkpoint_dir: impl Into<PathBuf>,
        store: S,
        summarizer: Option<M>,
    ) -> Result<Self> {
        let merger = MergeEngine::new(cfg.jaccard_threshold);
        Ok(Self {
            merger,
            compressor: Compressor::new(compressor_cfg),
            governor: ResourceGovernor::new(governor_cfg),
            checkpoints: CheckpointManager::new(checkpoint_dir, checkpoint_cfg).await?,
            producers: HashMap::new(),
            chunks: HashMap::new(),
            scope_order: Vec::new(),
            cfg,
            store,
            summarizer,
        })
    }

    /// Accept one message: append it to the store and run it through the
    /// chunk producer. Emitted chunks enter the pending backlog.
    pub async fn ingest(&mut self, message: Message) -> Result<()> {
        let scope_key = message.scope_key.clone();
        self.store.append_entry(&scope_key, message.clone()).await?;

        if !self.producers.contains_key(&scope_key) {
            self.producers.insert(
                scope_key.clone(),
                ChunkProducer::new(
                    scope_key.clone(),
                    self.cfg.chunk_token_threshold,
                    self.cfg.overlap_percent,
                ),
            );
            self.scope_order.push(scope_key.clone());
        }
        let producer = self
            .producers
            .get_mut(&scope_key)
            .ok_or_else(|| PackratError::Storage("producer vanished".to_string()))?;

        let emitted = producer.push(message);
        if !emitted.is_empty() {
            self.track_chunks(&scope_key, emitted).await;
        }
        Ok(())
    }

    /// Flush a scope's partial buffer into a final pending chunk.
    pub async fn flush_scope(&mut self, scope_key: &str) {
        if let Some(producer) = self.producers.get_mut(scope_key) {
            if let Some(chunk) = producer.flush() {
                self.track_chunks(scope_key, vec![chunk]).await;
            }
        }
    }

    async fn track_chunks(&mut self, scope_key: &str, emitted: Vec<Chunk>) {
        let backlog = self.chunks.entry(scope_key.to_string()).or_default();
        backlog.extend(emitted);
        let total = backlog.len();
        if self.checkpoints.active(scope_key).is_none() {
            if let Err(e) = self.checkpoints.begin(scope_key, total).await {
                warn!(scope = scope_key, "could not start checkpoint: {e}");
            }
        } else {
            self.checkpoints.extend_total(scope_key, total).await;
        }
    }

    /// One scheduler tick.
    ///
    /// Pulls at most one pending chunk; when none is pending, checks every
    /// known scope for a due merge cycle. Per-chunk failures are logged and
    /// the chunk reverted, never propagated.
    pub async fn tick(&mut self) -> TickOutcome {
        // Silent-stall detection runs every tick
        for scope in self.checkpoints.stalled_scopes() {
            warn!(scope = %scope, "heartbeat stall detected");
            self.checkpoints
                .pause(&scope, DisconnectionCause::Timeout)
                .await;
        }

        if !self.governor.can_proceed() {
            debug!("governor paused, scheduler idling");
            return TickOutcome::Paused;
        }

        if let Some((scope_key, index)) = self.next_pending() {
            return self.process_chunk(&scope_key, index).await;
        }

        // No chunk was pending: merge check per scope
        for scope_key in self.scope_order.clone() {
            let due = self
                .chunks
                .get(&scope_key)
                .map(|chunks| {
                    chunks
                        .iter()
                        .filter(|c| c.status == ChunkStatus::Summarized)
                        .count()
                        >= self.cfg.merge_threshold
                })
                .unwrap_or(false);
            if due {
                return self.merge_scope(&scope_key, false).await;
            }
        }
        TickOutcome::Idle
    }

    /// Compress a scope's whole pending backlog in one streaming pass.
    ///
    /// The exhaustive tier fans out in waves whose width is the governor's
    /// current concurrency limit; chunks the deadline cut off revert to
    /// pending for a later pass. Returns the number of chunks summarized.
    /// Does nothing while the governor reports no capacity.
    pub async fn process_backlog(&mut self, scope_key: &str) -> usize {
        if !self.governor.can_proceed() {
            return 0;
        }
        let pending: Vec<Chunk> = self
            .chunks
            .get(scope_key)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| c.status == ChunkStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if pending.is_empty() {
            return 0;
        }
        if let Some(chunks) = self.chunks.get_mut(scope_key) {
            for chunk in chunks.iter_mut().filter(|c| c.status == ChunkStatus::Pending) {
                chunk.status = ChunkStatus::Summarizing;
            }
        }
        self.checkpoints.heartbeat(scope_key);

        let deadline = Instant::now() + Duration::from_millis(self.cfg.compression_deadline_ms);
        let parallelism = self.governor.concurrency().max(1);
        let outcomes = self
            .compressor
            .compress_stream(&pending, deadline, parallelism)
            .await;

        let mut summarized = 0usize;
        let mut last_chunk_id = None;
        if let Some(chunks) = self.chunks.get_mut(scope_key) {
            for (chunk_id, outcome) in outcomes {
                if let Some(chunk) = chunks.iter_mut().find(|c| c.id == chunk_id) {
                    chunk.status = ChunkStatus::Summarized;
                    chunk.summary = match outcome {
                        CompressOutcome::Kept(instant) => Some(ChunkSummary::Instant(instant)),
                        CompressOutcome::Duplicate => None,
                    };
                    summarized += 1;
                    last_chunk_id = Some(chunk.id.clone());
                }
            }
            // Whatever the deadline cut off goes back to pending
            for chunk in chunks
                .iter_mut()
                .filter(|c| c.status == ChunkStatus::Summarizing)
            {
                chunk.status = ChunkStatus::Pending;
            }
        }
        self.checkpoints.heartbeat(scope_key);

        let processed = self
            .chunks
            .get(scope_key)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| c.status >= ChunkStatus::Summarized)
                    .count()
            })
            .unwrap_or(0);
        self.checkpoints
            .record_progress(scope_key, processed, last_chunk_id)
            .await;
        debug!(scope = scope_key, summarized, parallelism, "backlog pass");
        summarized
    }

    /// Drive ticks until all ingested work is summarized and merged.
    ///
    /// Without a summarizer, pending backlogs are bulk-compressed first in
    /// governor-bounded waves; chunks in the assisted band go one at a time
    /// through `tick`. Ends with a final merge of any summarized remainder
    /// below the merge threshold, then completes the affected checkpoints.
    pub async fn drain(&mut self) -> Result<()> {
        if self.summarizer.is_none() {
            for scope_key in self.scope_order.clone() {
                loop {
                    if !self.governor.can_proceed()
                        && !self.governor.wait_for_capacity(60).await
                    {
                        return Err(PackratError::Storage(
                            "resource governor never released capacity".to_string(),
                        ));
                    }
                    if self.process_backlog(&scope_key).await == 0 {
                        break;
                    }
                }
            }
        }
        loop {
            match self.tick().await {
                TickOutcome::Idle => break,
                TickOutcome::Paused => {
                    if !self.governor.wait_for_capacity(60).await {
                        return Err(PackratError::Storage(
                            "resource governor never released capacity".to_string(),
                        ));
                    }
                }
                _ => {}
            }
        }
        for scope_key in self.scope_order.clone() {
            let leftover = self
                .chunks
                .get(&scope_key)
                .map(|chunks| {
                    chunks
                        .iter()
                        .any(|c| c.status == ChunkStatus::Summarized)
                })
                .unwrap_or(false);
            if leftover {
                self.merge_scope(&scope_key, true).await;
            }
            let all_merged = self
                .chunks
                .get(&scope_key)
                .map(|chunks| chunks.iter().all(|c| c.status == ChunkStatus::Merged))
                .unwrap_or(false);
            if all_merged {
                self.checkpoints.complete(&scope_key).await;
            }
        }
        Ok(())
    }

    /// One tick, guarded against uncaught faults.
    ///
    /// A panic anywhere inside processing pauses every active checkpoint
    /// with cause `SystemCrash` before the fault is surfaced as an error,
    /// so a restarted process finds the scopes resumable.
    pub async fn tick_guarded(&mut self) -> Result<TickOutcome> {
        match AssertUnwindSafe(self.tick()).catch_unwind().await {
            Ok(outcome) => Ok(outcome),
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(%reason, "uncaught fault in scheduler tick");
                self.checkpoints
                    .pause_all(DisconnectionCause::SystemCrash)
                    .await;
                Err(PackratError::Fault(reason))
            }
        }
    }

    /// Run forever: governor sampling on its own cadence, scheduler ticks
    /// on theirs, and signal interception that pauses checkpoints with a
    /// classified cause before returning.
    pub async fn run(&mut self) -> Result<()> {
        let mut scheduler_tick =
            tokio::time::interval(Duration::from_millis(self.cfg.tick_interval_ms));
        let mut governor_tick = tokio::time::interval(Duration::from_millis(
            self.governor.config().tick_interval_ms,
        ));
        loop {
            tokio::select! {
                _ = governor_tick.tick() => {
                    self.governor.tick();
                }
                _ = scheduler_tick.tick() => {
                    let outcome = self.tick_guarded().await?;
                    debug!(?outcome, "scheduler tick");
                }
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("interrupt received, pausing checkpoints before exit");
                        self.checkpoints
                            .pause_all(DisconnectionCause::UserInterrupt)
                            .await;
                    }
                    return Ok(());
                }
                _ = terminate_requested() => {
                    info!("terminate requested, pausing checkpoints before exit");
                    self.checkpoints
                        .pause_all(DisconnectionCause::Unknown)
                        .await;
                    return Ok(());
                }
            }
        }
    }

    /// First pending chunk across scopes, in scope-then-creation order.
    fn next_pending(&self) -> Option<(String, usize)> {
        for scope_key in &self.scope_order {
            if let Some(chunks) = self.chunks.get(scope_key) {
                if let Some(index) = chunks.iter().position(|c| c.status == ChunkStatus::Pending) {
                    return Some((scope_key.clone(), index));
                }
            }
        }
        None
    }

    async fn process_chunk(&mut self, scope_key: &str, index: usize) -> TickOutcome {
        let chunk = {
            let chunks = match self.chunks.get_mut(scope_key) {
                Some(chunks) => chunks,
                None => return TickOutcome::Idle,
            };
            chunks[index].status = ChunkStatus::Summarizing;
            chunks[index].clone()
        };
        self.checkpoints.heartbeat(scope_key);

        let assisted_band = self.cfg.assisted_min_tokens..=self.cfg.assisted_max_tokens;
        let use_summarizer =
            self.summarizer.is_some() && assisted_band.contains(&chunk.token_count);

        let summary = if use_summarizer {
            match self.summarize_assisted(&chunk).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(chunk_id = %chunk.id, "summarizer failed, reverting chunk: {e}");
                    if let Some(chunks) = self.chunks.get_mut(scope_key) {
                        chunks[index].status = ChunkStatus::Pending;
                    }
                    return TickOutcome::Reverted {
                        chunk_id: chunk.id.clone(),
                    };
                }
            }
        } else {
            let deadline =
                Instant::now() + Duration::from_millis(self.cfg.compression_deadline_ms);
            match self.compressor.compress_chunk(&chunk, deadline) {
                CompressOutcome::Kept(instant) => Some(ChunkSummary::Instant(instant)),
                CompressOutcome::Duplicate => None,
            }
        };

        let dropped = summary.is_none();
        if let Some(chunks) = self.chunks.get_mut(scope_key) {
            chunks[index].status = ChunkStatus::Summarized;
            chunks[index].summary = summary;
        }
        self.checkpoints.heartbeat(scope_key);

        let processed = self
            .chunks
            .get(scope_key)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| c.status >= ChunkStatus::Summarized)
                    .count()
            })
            .unwrap_or(0);
        self.checkpoints
            .record_progress(scope_key, processed, Some(chunk.id.clone()))
            .await;

        if dropped {
            TickOutcome::DuplicateDropped { chunk_id: chunk.id }
        } else {
            debug!(chunk_id = %chunk.id, "chunk summarized");
            TickOutcome::Summarized { chunk_id: chunk.id }
        }
    }

    /// Call the summarizer collaborator and parse its record. A parse
    /// failure falls back to the instant pipeline's tags plus a generic
    /// placeholder summary; it never propagates upward.
    async fn summarize_assisted(&mut self, chunk: &Chunk) -> Result<ChunkSummary> {
        let summarizer = self
            .summarizer
            .as_ref()
            .ok_or_else(|| PackratError::Summarizer("no summarizer configured".to_string()))?;
        let raw = summarizer.summarize(chunk, SUMMARIZE_PROMPT).await?;
        match serde_json::from_str::<AssistedSummary>(&raw) {
            Ok(parsed) => Ok(ChunkSummary::Assisted(parsed)),
            Err(e) => {
                warn!(chunk_id = %chunk.id, "unparseable summarizer output, using fallback: {e}");
                let deadline =
                    Instant::now() + Duration::from_millis(self.cfg.compression_deadline_ms);
                let tags = match self.compressor.compress_chunk(chunk, deadline) {
                    CompressOutcome::Kept(instant) => instant.keywords,
                    CompressOutcome::Duplicate => Vec::new(),
                };
                Ok(ChunkSummary::Assisted(AssistedSummary {
                    summary: FALLBACK_SUMMARY.to_string(),
                    tags,
                    ..Default::default()
                }))
            }
        }
    }

    /// Fold a scope's summarized chunks into a new merged snapshot.
    async fn merge_scope(&mut self, scope_key: &str, force: bool) -> TickOutcome {
        let batch: Vec<(String, ChunkSummary)> = self
            .chunks
            .get(scope_key)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| c.status == ChunkStatus::Summarized)
                    .filter_map(|c| c.summary.clone().map(|s| (c.id.clone(), s)))
                    .collect()
            })
            .unwrap_or_default();
        let consumed_ids: Vec<String> = self
            .chunks
            .get(scope_key)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| c.status == ChunkStatus::Summarized)
                    .map(|c| c.id.clone())
                    .collect()
            })
            .unwrap_or_default();

        if batch.is_empty() && !force {
            return TickOutcome::Idle;
        }

        let prior = match self.store.current_context(scope_key).await {
            Ok(prior) => prior,
            Err(e) => {
                warn!(scope = scope_key, "could not read prior snapshot: {e}");
                None
            }
        };
        let merged = self.merger.merge(scope_key, &batch, prior.as_ref());

        if let Err(e) = self.store.replace_current_context(scope_key, &merged).await {
            // Keep statuses untouched so the merge retries on a later tick
            warn!(scope = scope_key, "snapshot write failed, will retry: {e}");
            return TickOutcome::Idle;
        }

        // Advance statuses and mark the underlying entries compressed
        let mut message_ids = Vec::new();
        if let Some(chunks) = self.chunks.get_mut(scope_key) {
            for chunk in chunks
                .iter_mut()
                .filter(|c| c.status == ChunkStatus::Summarized)
            {
                chunk.status = ChunkStatus::Merged;
                message_ids.extend(
                    chunk
                        .non_overlap_messages()
                        .iter()
                        .map(|m| m.id.clone()),
                );
            }
        }
        if let Err(e) = self.store.mark_compressed(scope_key, &message_ids).await {
            warn!(scope = scope_key, "mark_compressed failed: {e}");
        }

        info!(
            scope = scope_key,
            consumed = consumed_ids.len(),
            tokens = merged.token_count,
            "merge cycle produced new snapshot"
        );
        TickOutcome::Merged {
            scope_key: scope_key.to_string(),
            consumed: consumed_ids.len(),
        }
    }

    /// Structured status for a scope.
    pub fn status(&self, scope_key: &str) -> ScopeStatus {
        let mut status = ScopeStatus {
            scope_key: scope_key.to_string(),
            pending: 0,
            summarizing: 0,
            summarized: 0,
            merged: 0,
            percent_complete: 0.0,
            checkpoint_state: None,
            resumable: false,
            governor_state: self.governor.state(),
        };
        if let Some(chunks) = self.chunks.get(scope_key) {
            for chunk in chunks {
                match chunk.status {
                    ChunkStatus::Pending => status.pending += 1,
                    ChunkStatus::Summarizing => status.summarizing += 1,
                    ChunkStatus::Summarized => status.summarized += 1,
                    ChunkStatus::Merged => status.merged += 1,
                }
            }
        }
        if let Some(checkpoint) = self.checkpoints.active(scope_key) {
            status.percent_complete = checkpoint.progress.percent_complete;
            status.checkpoint_state = Some(checkpoint.state);
            status.resumable = checkpoint.recovery.resumable;
        }
        status
    }

    /// Known scopes in first-seen order.
    pub fn scopes(&self) -> &[String] {
        &self.scope_order
    }

    pub fn governor_mut(&mut self) -> &mut ResourceGovernor {
        &mut self.governor
    }

    pub fn checkpoints_mut(&mut self) -> &mut CheckpointManager {
        &mut self.checkpoints
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

/// Resolve when the host delivers a terminate request (SIGTERM).
#[cfg(unix)]
async fn terminate_requested() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("could not register terminate handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_requested() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Role;
    use crate::storage::MemoryStore;
    use tempfile::TempDir;

    const LOREM: [&str; 5] = [
        "the authentication refactor replaced session cookies with signed tokens",
        "database migrations now run inside a transaction with rollback support",
        "the deployment pipeline gained a canary stage before full rollout",
        "search indexing was rebuilt around incremental shard updates",
        "billing reconciliation exports nightly ledgers to object storage",
    ];

    async fn scheduler(dir: &TempDir) -> Scheduler<MemoryStore> {
        let cfg = SchedulerConfig {
            chunk_token_threshold: 30,
            merge_threshold: 2,
            ..Default::default()
        };
        Scheduler::new(
            cfg,
            CompressorConfig::default(),
            GovernorConfig::default(),
            CheckpointConfig::default(),
            dir.path().join("checkpoints"),
            MemoryStore::new(),
        )
        .await
        .unwrap()
    }

    async fn feed(sched: &mut Scheduler<MemoryStore>, scope: &str, count: usize) {
        for i in 0..count {
            let content = format!("{} variant {i}", LOREM[i % LOREM.len()]);
            let message = Message::new(format!("{scope}-m{i}"), Role::User, content, scope);
            sched.ingest(message).await.unwrap();
        }
        sched.flush_scope(scope).await;
    }

    #[tokio::test]
    async fn test_tick_processes_one_chunk() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir).await;
        feed(&mut sched, "scope-a", 20).await;
        assert!(sched.status("scope-a").pending >= 1);

        let outcome = sched.tick().await;
        assert!(matches!(
            outcome,
            TickOutcome::Summarized { .. } | TickOutcome::DuplicateDropped { .. }
        ));
        assert_eq!(sched.status("scope-a").summarized, 1);
    }

    #[tokio::test]
    async fn test_drain_merges_everything() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir).await;
        feed(&mut sched, "scope-a", 40).await;

        sched.drain().await.unwrap();

        let status = sched.status("scope-a");
        assert_eq!(status.pending, 0);
        assert_eq!(status.summarized, 0);
        assert!(status.merged >= 1);
        assert_eq!(status.checkpoint_state, Some(CheckpointState::Completed));

        let snapshot = sched
            .store()
            .current_context("scope-a")
            .await
            .unwrap()
            .expect("merged snapshot written");
        assert!(!snapshot.consumed_chunk_ids.is_empty());
        assert!(!snapshot.summary.is_empty());
    }

    #[tokio::test]
    async fn test_paused_governor_idles_scheduler() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir).await;
        feed(&mut sched, "scope-a", 20).await;

        let sample = crate::governor::ResourceSample {
            cpu_percent: 95.0,
            memory_bytes: 0,
            taken_at: std::time::Instant::now(),
        };
        sched.governor_mut().apply_sample(sample);
        assert_eq!(sched.tick().await, TickOutcome::Paused);
        assert_eq!(sched.status("scope-a").summarized, 0);
    }

    #[tokio::test]
    async fn test_duplicate_chunks_dropped_from_output() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir).await;
        // Same content repeated: later chunks are near-duplicates
        for i in 0..30 {
            let message = Message::new(
                format!("m{i}"),
                Role::User,
                "the exact same sentence repeated forever without variation",
                "scope-a",
            );
            sched.ingest(message).await.unwrap();
        }
        sched.flush_scope("scope-a").await;
        sched.drain().await.unwrap();

        let snapshot = sched
            .store()
            .current_context("scope-a")
            .await
            .unwrap()
            .expect("snapshot");
        // All chunks consumed, but duplicate content contributed only once
        let status = sched.status("scope-a");
        assert!(status.merged >= 2);
        assert!(snapshot.summary.len() < 200);
    }

    struct FailingSummarizer;
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _chunk: &Chunk, _prompt: &str) -> Result<String> {
            Err(PackratError::Summarizer("model unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_summarizer_failure_reverts_chunk() {
        let dir = TempDir::new().unwrap();
        let cfg = SchedulerConfig {
            chunk_token_threshold: 30,
            merge_threshold: 2,
            assisted_min_tokens: 1,
            ..Default::default()
        };
        let mut sched = Scheduler::with_summarizer(
            cfg,
            CompressorConfig::default(),
            GovernorConfig::default(),
            CheckpointConfig::default(),
            dir.path().join("checkpoints"),
            MemoryStore::new(),
            Some(FailingSummarizer),
        )
        .await
        .unwrap();
        for i in 0..20 {
            let message = Message::new(
                format!("m{i}"),
                Role::User,
                format!("{} take {i}", LOREM[i % LOREM.len()]),
                "scope-a",
            );
            sched.ingest(message).await.unwrap();
        }
        sched.flush_scope("scope-a").await;

        let outcome = sched.tick().await;
        assert!(matches!(outcome, TickOutcome::Reverted { .. }));
        // Chunk is pending again and retried on the next tick
        assert!(sched.status("scope-a").pending >= 1);
        assert_eq!(sched.status("scope-a").summarizing, 0);
    }

    struct GarbageSummarizer;
    impl Summarizer for GarbageSummarizer {
        async fn summarize(&self, _chunk: &Chunk, _prompt: &str) -> Result<String> {
            Ok("this is not json at all".to_string())
        }
    }

    #[tokio::test]
    async fn test_unparseable_summarizer_output_falls_back() {
        let dir = TempDir::new().unwrap();
        let cfg = SchedulerConfig {
            chunk_token_threshold: 30,
            merge_threshold: 2,
            assisted_min_tokens: 1,
            ..Default::default()
        };
        let mut sched = Scheduler::with_summarizer(
            cfg,
            CompressorConfig::default(),
            GovernorConfig::default(),
            CheckpointConfig::default(),
            dir.path().join("checkpoints"),
            MemoryStore::new(),
            Some(GarbageSummarizer),
        )
        .await
        .unwrap();
        for i in 0..20 {
            let message = Message::new(
                format!("m{i}"),
                Role::User,
                format!("{} take {i}", LOREM[i % LOREM.len()]),
                "scope-a",
            );
            sched.ingest(message).await.unwrap();
        }
        sched.flush_scope("scope-a").await;

        let outcome = sched.tick().await;
        assert!(matches!(outcome, TickOutcome::Summarized { .. }));
        let status = sched.status("scope-a");
        assert_eq!(status.summarized, 1);
    }

    struct PanickingSummarizer;
    impl Summarizer for PanickingSummarizer {
        async fn summarize(&self, _chunk: &Chunk, _prompt: &str) -> Result<String> {
            panic!("summarizer worker crashed");
        }
    }

    #[tokio::test]
    async fn test_uncaught_fault_pauses_with_system_crash() {
        let dir = TempDir::new().unwrap();
        let cfg = SchedulerConfig {
            chunk_token_threshold: 30,
            merge_threshold: 2,
            assisted_min_tokens: 1,
            ..Default::default()
        };
        let mut sched = Scheduler::with_summarizer(
            cfg,
            CompressorConfig::default(),
            GovernorConfig::default(),
            CheckpointConfig::default(),
            dir.path().join("checkpoints"),
            MemoryStore::new(),
            Some(PanickingSummarizer),
        )
        .await
        .unwrap();
        feed_with(&mut sched, "scope-a", 20).await;

        let result = sched.tick_guarded().await;
        assert!(matches!(result, Err(PackratError::Fault(_))));

        let active = sched.checkpoints_mut().active("scope-a").unwrap();
        assert_eq!(active.state, CheckpointState::Paused);
        assert_eq!(
            active.recovery.last_disconnection_cause,
            Some(DisconnectionCause::SystemCrash)
        );
        // A restarted process finds the scope resumable
        assert!(sched.checkpoints_mut().needs_recovery("scope-a").await);
    }

    async fn feed_with<M: Summarizer>(
        sched: &mut Scheduler<MemoryStore, M>,
        scope: &str,
        count: usize,
    ) {
        for i in 0..count {
            let message = Message::new(
                format!("{scope}-m{i}"),
                Role::User,
                format!("{} take {i}", LOREM[i % LOREM.len()]),
                scope,
            );
            sched.ingest(message).await.unwrap();
        }
        sched.flush_scope(scope).await;
    }

    #[tokio::test]
    async fn test_backlog_fanout_follows_governor_limit() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir).await;
        feed(&mut sched, "scope-a", 40).await;
        let pending_before = sched.status("scope-a").pending;
        assert!(pending_before >= 2);

        // Paused governor: the backlog pass refuses to start
        sched.governor_mut().apply_sample(crate::governor::ResourceSample {
            cpu_percent: 95.0,
            memory_bytes: 0,
            taken_at: std::time::Instant::now(),
        });
        assert_eq!(sched.governor_mut().concurrency(), 0);
        assert_eq!(sched.process_backlog("scope-a").await, 0);
        assert_eq!(sched.status("scope-a").pending, pending_before);

        // Light load grows the limit; the pass fans out at that width
        for _ in 0..3 {
            sched.governor_mut().apply_sample(crate::governor::ResourceSample {
                cpu_percent: 10.0,
                memory_bytes: 0,
                taken_at: std::time::Instant::now(),
            });
        }
        assert_eq!(sched.governor_mut().concurrency(), 3);
        let summarized = sched.process_backlog("scope-a").await;
        assert_eq!(summarized, pending_before);
        let status = sched.status("scope-a");
        assert_eq!(status.pending, 0);
        assert_eq!(status.summarized, pending_before);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_signal_pauses_checkpoints() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir).await;
        feed(&mut sched, "scope-a", 20).await;

        let pid = std::process::id().to_string();
        tokio::spawn(async move {
            // Give run() time to register the signal handler first
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = std::process::Command::new("kill")
                .args(["-TERM", &pid])
                .status();
        });
        let result = tokio::time::timeout(Duration::from_secs(5), sched.run()).await;
        assert!(result.expect("run returned before timeout").is_ok());

        let active = sched.checkpoints_mut().active("scope-a").unwrap();
        assert_eq!(active.state, CheckpointState::Paused);
        assert_eq!(
            active.recovery.last_disconnection_cause,
            Some(DisconnectionCause::Unknown)
        );
        assert!(active.recovery.resumable);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let dir = TempDir::new().unwrap();
        let mut sched = scheduler(&dir).await;
        feed(&mut sched, "scope-a", 20).await;
        feed(&mut sched, "scope-b", 20).await;
        sched.drain().await.unwrap();

        let a = sched.store().current_context("scope-a").await.unwrap();
        let b = sched.store().current_context("scope-b").await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(a.unwrap().scope_key, "scope-a");
        assert_eq!(b.unwrap().scope_key, "scope-b");
    }
}
