//! Compression Orchestrator: composes term weighting, sentence ranking and
//! near-duplicate filtering per chunk, picks an execution tier by estimated
//! input size, and races every call against a caller-supplied deadline.
//!
//! On deadline expiry the best partial result accumulated so far is
//! returned, never an error: context continuity degrades gracefully.

pub mod fingerprint;
pub mod rank;
pub mod tfidf;

use crate::chunker::Chunk;
use crate::merge::AssistedSummary;
use crate::text::estimate_tokens;
use fingerprint::{DuplicateFilter, Fingerprint, FingerprintWidth};
use futures::future::join_all;
use rank::{pick_sentences_fast, rank_sentences};
use serde::{Deserialize, Serialize};
use tfidf::TermWeights;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Execution tiers of the orchestrator, chosen automatically by estimated
/// input size. Callers never select a tier explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionTier {
    /// Full graph ranking, 64-bit fingerprints, top-20 keywords.
    Exhaustive,
    /// Positional sentence picks, 32-bit fingerprints, sampled vocabulary.
    Fast,
}

/// Summary attached to a chunk after instant (non-model) compression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantSummary {
    pub keywords: Vec<String>,
    pub key_sentences: Vec<String>,
    pub fingerprint: Fingerprint,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
}

impl InstantSummary {
    /// Fraction of tokens removed by compression, in `[0, 1]`.
    pub fn compression_ratio(&self) -> f64 {
        if self.original_tokens == 0 {
            return 0.0;
        }
        1.0 - (self.compressed_tokens as f64 / self.original_tokens as f64)
    }

    /// Summary text used by the merge engine: key sentences joined.
    pub fn summary_text(&self) -> String {
        self.key_sentences.join(". ")
    }
}

/// Summary attached to exactly one chunk; written once, replaced only on
/// a retried attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkSummary {
    Instant(InstantSummary),
    Assisted(AssistedSummary),
}

/// Per-chunk compression result.
#[derive(Debug, Clone)]
pub enum CompressOutcome {
    /// Chunk was novel; a summary was produced (possibly partial on
    /// deadline expiry).
    Kept(InstantSummary),
    /// Chunk was within the Hamming threshold of an already-kept chunk
    /// and is dropped entirely.
    Duplicate,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    /// Top-K keywords in the exhaustive tier.
    pub keywords_exhaustive: usize,
    /// Smaller sampled vocabulary in the fast tier.
    pub keywords_fast: usize,
    /// Top-N key sentences per chunk.
    pub sentences_per_chunk: usize,
    /// Hamming distance at or below which chunks are near-duplicates.
    pub hamming_threshold: u32,
    /// Estimated total input (tokens) below which the exhaustive tier runs.
    pub exhaustive_cutoff_tokens: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            keywords_exhaustive: 20,
            keywords_fast: 8,
            sentences_per_chunk: 3,
            hamming_threshold: 3,
            exhaustive_cutoff_tokens: 50_000,
        }
    }
}

/// The instant-compression pipeline. Holds the streaming document-frequency
/// table and the session-scoped fingerprint set.
#[derive(Debug)]
pub struct Compressor {
    cfg: CompressorConfig,
    terms: TermWeights,
    dupes: DuplicateFilter,
}

impl Compressor {
    pub fn new(cfg: CompressorConfig) -> Self {
        let dupes = DuplicateFilter::new(cfg.hamming_threshold);
        Self {
            cfg,
            terms: TermWeights::new(),
            dupes,
        }
    }

    /// Pick the execution tier for an estimated total input size.
    pub fn select_tier(&self, estimated_total_tokens: usize) -> CompressionTier {
        if estimated_total_tokens < self.cfg.exhaustive_cutoff_tokens {
            CompressionTier::Exhaustive
        } else {
            CompressionTier::Fast
        }
    }

    /// Compress a single chunk against a deadline.
    ///
    /// The tier is selected from the chunk's own size. Stages run in cheap
    /// to expensive order; whatever completed before the deadline is
    /// returned.
    pub fn compress_chunk(&mut self, chunk: &Chunk, deadline: Instant) -> CompressOutcome {
        let tier = self.select_tier(chunk.token_count);
        let text = chunk.text();
        self.compress_text(&text, chunk.token_count, tier, deadline)
    }

    fn compress_text(
        &mut self,
        text: &str,
        original_tokens: usize,
        tier: CompressionTier,
        deadline: Instant,
    ) -> CompressOutcome {
        let width = match tier {
            CompressionTier::Exhaustive => FingerprintWidth::W64,
            CompressionTier::Fast => FingerprintWidth::W32,
        };

        let fp = Fingerprint::compute(text, width);
        if !self.dupes.keep(fp) {
            debug!("dropping near-duplicate chunk");
            return CompressOutcome::Duplicate;
        }
        self.terms.observe(text);

        let mut summary = InstantSummary {
            keywords: Vec::new(),
            key_sentences: Vec::new(),
            fingerprint: fp,
            original_tokens,
            compressed_tokens: 0,
        };

        if Instant::now() >= deadline {
            warn!("compression deadline expired before keyword extraction");
            return CompressOutcome::Kept(summary);
        }

        let k = match tier {
            CompressionTier::Exhaustive => self.cfg.keywords_exhaustive,
            CompressionTier::Fast => self.cfg.keywords_fast,
        };
        summary.keywords = self
            .terms
            .top_terms(text, k)
            .into_iter()
            .map(|t| t.term)
            .collect();

        if Instant::now() >= deadline {
            warn!("compression deadline expired before sentence ranking");
            summary.compressed_tokens = compressed_size(&summary, original_tokens);
            return CompressOutcome::Kept(summary);
        }

        summary.key_sentences = match tier {
            CompressionTier::Exhaustive => rank_sentences(text, self.cfg.sentences_per_chunk),
            CompressionTier::Fast => pick_sentences_fast(text, self.cfg.sentences_per_chunk),
        };
        summary.compressed_tokens = compressed_size(&summary, original_tokens);
        CompressOutcome::Kept(summary)
    }

    /// Compress a batch of chunks in streaming mode.
    ///
    /// The tier is chosen once from the estimated total input size. In the
    /// exhaustive tier, sentence ranking fans out over `parallelism` tasks
    /// per wave; results are joined in original chunk order. The deadline is
    /// checked between waves; on expiry the outcomes accumulated so far are
    /// returned.
    pub async fn compress_stream(
        &mut self,
        chunks: &[Chunk],
        deadline: Instant,
        parallelism: usize,
    ) -> Vec<(String, CompressOutcome)> {
        let total_tokens: usize = chunks.iter().map(|c| c.token_count).sum();
        let tier = self.select_tier(total_tokens);
        let mut outcomes = Vec::with_capacity(chunks.len());

        match tier {
            CompressionTier::Fast => {
                for chunk in chunks {
                    if Instant::now() >= deadline {
                        warn!(done = outcomes.len(), "stream deadline expired, returning partial");
                        break;
                    }
                    let outcome = self.compress_text(
                        &chunk.text(),
                        chunk.token_count,
                        CompressionTier::Fast,
                        deadline,
                    );
                    outcomes.push((chunk.id.clone(), outcome));
                }
            }
            CompressionTier::Exhaustive => {
                for wave in chunks.chunks(parallelism.max(1)) {
                    if Instant::now() >= deadline {
                        warn!(done = outcomes.len(), "stream deadline expired, returning partial");
                        break;
                    }
                    outcomes.extend(self.compress_wave(wave, deadline).await);
                }
            }
        }
        outcomes
    }

    /// One parallel wave of the exhaustive tier.
    async fn compress_wave(
        &mut self,
        wave: &[Chunk],
        deadline: Instant,
    ) -> Vec<(String, CompressOutcome)> {
        // Duplicate filtering and document-frequency updates are cheap and
        // order-dependent, so they stay sequential.
        let mut kept: Vec<(&Chunk, String, Fingerprint)> = Vec::new();
        let mut outcomes: Vec<(String, Option<usize>)> = Vec::new();
        for chunk in wave {
            let text = chunk.text();
            let fp = Fingerprint::compute(&text, FingerprintWidth::W64);
            if !self.dupes.keep(fp) {
                debug!(chunk_id = %chunk.id, "dropping near-duplicate chunk");
                outcomes.push((chunk.id.clone(), None));
                continue;
            }
            self.terms.observe(&text);
            outcomes.push((chunk.id.clone(), Some(kept.len())));
            kept.push((chunk, text, fp));
        }

        // Fan out the quadratic sentence ranking across tasks.
        let n = self.cfg.sentences_per_chunk;
        let handles: Vec<_> = kept
            .iter()
            .map(|(_, text, _)| {
                let text = text.clone();
                tokio::spawn(async move { rank_sentences(&text, n) })
            })
            .collect();
        let ranked = join_all(handles).await;

        let mut results = Vec::with_capacity(wave.len());
        for (chunk_id, slot) in outcomes {
            let Some(idx) = slot else {
                results.push((chunk_id, CompressOutcome::Duplicate));
                continue;
            };
            let (chunk, text, fp) = &kept[idx];
            let key_sentences = match &ranked[idx] {
                Ok(sentences) => sentences.clone(),
                Err(e) => {
                    warn!(chunk_id = %chunk.id, "sentence ranking task failed: {e}");
                    Vec::new()
                }
            };
            let mut summary = InstantSummary {
                keywords: Vec::new(),
                key_sentences,
                fingerprint: *fp,
                original_tokens: chunk.token_count,
                compressed_tokens: 0,
            };
            if Instant::now() < deadline {
                summary.keywords = self
                    .terms
                    .top_terms(text, self.cfg.keywords_exhaustive)
                    .into_iter()
                    .map(|t| t.term)
                    .collect();
            }
            summary.compressed_tokens = compressed_size(&summary, chunk.token_count);
            results.push((chunk_id, CompressOutcome::Kept(summary)));
        }
        results
    }

    /// Number of distinct chunks kept by the duplicate filter this session.
    pub fn kept_chunks(&self) -> usize {
        self.dupes.kept_count()
    }
}

/// Token size of a summary's retained content, clamped so compression never
/// reports growth.
fn compressed_size(summary: &InstantSummary, original_tokens: usize) -> usize {
    let keyword_tokens: usize = summary.keywords.iter().map(|k| estimate_tokens(k)).sum();
    let sentence_tokens: usize = summary
        .key_sentences
        .iter()
        .map(|s| estimate_tokens(s))
        .sum();
    (keyword_tokens + sentence_tokens).min(original_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Message, Role};
    use chrono::Utc;
    use std::time::Duration;

    fn chunk_of(text: &str) -> Chunk {
        let message = Message::new("m0", Role::User, text, "test-scope");
        Chunk {
            id: "test-scope-chunk-000001".to_string(),
            scope_key: "test-scope".to_string(),
            start_index: 0,
            end_index: 1,
            overlap_len: 0,
            token_count: estimate_tokens(text),
            status: crate::chunker::ChunkStatus::Pending,
            created_at: Utc::now(),
            summary: None,
            messages: vec![message],
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    const TEXT: &str = "The checkpoint subsystem persists progress after every chunk. \
        Progress records include the last processed chunk identifier. \
        Recovery reads the pointer file and resumes from the recorded position. \
        Lunch today was a rather forgettable sandwich.";

    #[test]
    fn test_compress_produces_summary() {
        let mut compressor = Compressor::new(CompressorConfig::default());
        let chunk = chunk_of(TEXT);
        match compressor.compress_chunk(&chunk, far_deadline()) {
            CompressOutcome::Kept(summary) => {
                assert!(!summary.keywords.is_empty());
                assert!(!summary.key_sentences.is_empty());
                assert!(summary.compressed_tokens <= summary.original_tokens);
                let ratio = summary.compression_ratio();
                assert!((0.0..=1.0).contains(&ratio));
            }
            CompressOutcome::Duplicate => panic!("first chunk cannot be a duplicate"),
        }
    }

    #[test]
    fn test_same_text_twice_kept_once() {
        let mut compressor = Compressor::new(CompressorConfig::default());
        let first = compressor.compress_chunk(&chunk_of(TEXT), far_deadline());
        let second = compressor.compress_chunk(&chunk_of(TEXT), far_deadline());
        assert!(matches!(first, CompressOutcome::Kept(_)));
        assert!(matches!(second, CompressOutcome::Duplicate));
        assert_eq!(compressor.kept_chunks(), 1);
    }

    #[test]
    fn test_expired_deadline_returns_partial_not_error() {
        let mut compressor = Compressor::new(CompressorConfig::default());
        let already_past = Instant::now() - Duration::from_millis(1);
        match compressor.compress_chunk(&chunk_of(TEXT), already_past) {
            CompressOutcome::Kept(summary) => {
                // Fingerprint stage always completes; later stages were cut
                assert!(summary.key_sentences.is_empty());
                assert!(summary.compressed_tokens <= summary.original_tokens);
            }
            CompressOutcome::Duplicate => panic!("not a duplicate"),
        }
    }

    #[test]
    fn test_tier_selection_by_size() {
        let compressor = Compressor::new(CompressorConfig::default());
        assert_eq!(compressor.select_tier(1_000), CompressionTier::Exhaustive);
        assert_eq!(compressor.select_tier(1_000_000), CompressionTier::Fast);
    }

    #[tokio::test]
    async fn test_stream_joins_in_original_order() {
        let mut compressor = Compressor::new(CompressorConfig::default());
        let topics = [
            "database migrations ran cleanly against the staging replica",
            "frontend styling moved to a shared component library",
            "authentication tokens rotate hourly behind the gateway",
            "billing invoices reconcile nightly with the ledger export",
            "search indexing latency dropped after the shard rebalance",
            "deployment pipelines gained canary stages last quarter",
        ];
        let chunks: Vec<Chunk> = topics
            .iter()
            .enumerate()
            .map(|(i, topic)| {
                let mut c = chunk_of(&format!("{topic}. In short: {topic}."));
                c.id = format!("test-scope-chunk-{i:06}");
                c
            })
            .collect();
        let outcomes = compressor
            .compress_stream(&chunks, far_deadline(), 2)
            .await;
        assert_eq!(outcomes.len(), 6);
        for (i, (id, outcome)) in outcomes.iter().enumerate() {
            assert_eq!(id, &format!("test-scope-chunk-{i:06}"));
            assert!(matches!(outcome, CompressOutcome::Kept(_)));
        }
    }

    #[tokio::test]
    async fn test_stream_expired_deadline_partial() {
        let mut compressor = Compressor::new(CompressorConfig::default());
        let chunks: Vec<Chunk> = (0..4).map(|_| chunk_of(TEXT)).collect();
        let already_past = Instant::now() - Duration::from_millis(1);
        let outcomes = compressor.compress_stream(&chunks, already_past, 2).await;
        // Expired before the first wave: empty partial result, no error
        assert!(outcomes.is_empty());
    }
}
