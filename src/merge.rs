//! Merge Engine: folds a batch of chunk summaries into one deduplicated,
//! tag-weighted context snapshot per scope.
//!
//! Each merge cycle produces a new MergedContext that supersedes the
//! scope's prior snapshot; chunk summaries themselves are never mutated.

use crate::compress::ChunkSummary;
use crate::text::{estimate_tokens, jaccard_similarity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Weight placed on tag frequency vs. batch recency.
const TAG_FREQUENCY_WEIGHT: f64 = 0.6;
const TAG_RECENCY_WEIGHT: f64 = 0.4;

/// Importance of a recorded decision. On merge collisions the higher
/// importance wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
    Critical,
}

/// Task progress. On merge collisions the more-advanced status wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// A decision extracted from a summarized chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub description: String,
    pub importance: Importance,
}

/// A task extracted from a summarized chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub description: String,
    pub status: TaskStatus,
}

/// A code change extracted from a summarized chunk. Later descriptions for
/// the same file path replace earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChange {
    pub path: String,
    pub description: String,
}

/// A tag with its aggregated weight, sorted descending in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedTag {
    pub tag: String,
    pub weight: f64,
}

/// Model-assisted chunk summary, as returned by the summarizer collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistedSummary {
    pub summary: String,
    pub decisions: Vec<DecisionRecord>,
    pub tasks: Vec<TaskRecord>,
    pub code_changes: Vec<CodeChange>,
    pub tags: Vec<String>,
}

/// The single current context snapshot for a scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedContext {
    pub id: String,
    pub scope_key: String,
    pub summary: String,
    pub decisions: Vec<DecisionRecord>,
    pub tasks: Vec<TaskRecord>,
    pub code_changes: Vec<CodeChange>,
    pub tags: Vec<WeightedTag>,
    pub consumed_chunk_ids: Vec<String>,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Merge engine configuration and entry point.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    /// Jaccard similarity at or above which two summary sentences are
    /// near-duplicates (keep first, drop later).
    jaccard_threshold: f64,
}

impl MergeEngine {
    pub fn new(jaccard_threshold: f64) -> Self {
        Self { jaccard_threshold }
    }

    /// Fold a batch of chunk summaries (in creation order) into a new
    /// snapshot superseding `prior`.
    pub fn merge(
        &self,
        scope_key: &str,
        batch: &[(String, ChunkSummary)],
        prior: Option<&MergedContext>,
    ) -> MergedContext {
        let now = Utc::now();
        let generation = prior
            .map(|p| p.consumed_chunk_ids.len())
            .unwrap_or(0);

        // Sentence-level dedupe across prior summary + batch, keep-first.
        let mut sentences: Vec<String> = Vec::new();
        if let Some(p) = prior {
            if !p.summary.is_empty() {
                sentences.push(p.summary.clone());
            }
        }
        for (_, summary) in batch {
            let text = match summary {
                ChunkSummary::Instant(s) => s.summary_text(),
                ChunkSummary::Assisted(s) => s.summary.clone(),
            };
            for candidate in text.split(". ").map(str::trim).filter(|s| !s.is_empty()) {
                let duplicate = sentences
                    .iter()
                    .any(|kept| jaccard_similarity(kept, candidate) >= self.jaccard_threshold);
                if duplicate {
                    debug!("dropping near-duplicate summary sentence");
                } else {
                    sentences.push(candidate.to_string());
                }
            }
        }
        let summary = sentences.join(". ");

        // Union decisions / tasks / code changes keyed by normalized
        // description, with collision rules per record kind.
        let mut decisions: Vec<DecisionRecord> = prior.map(|p| p.decisions.clone()).unwrap_or_default();
        let mut tasks: Vec<TaskRecord> = prior.map(|p| p.tasks.clone()).unwrap_or_default();
        let mut code_changes: Vec<CodeChange> = prior.map(|p| p.code_changes.clone()).unwrap_or_default();
        let mut tag_first_seen: Vec<(String, usize, usize)> = Vec::new(); // tag, freq, last batch index
        if let Some(p) = prior {
            for t in &p.tags {
                tag_first_seen.push((t.tag.clone(), 1, 0));
            }
        }

        for (batch_index, (_, summary)) in batch.iter().enumerate() {
            match summary {
                ChunkSummary::Instant(s) => {
                    for keyword in &s.keywords {
                        bump_tag(&mut tag_first_seen, keyword, batch_index);
                    }
                }
                ChunkSummary::Assisted(s) => {
                    for d in &s.decisions {
                        merge_decision(&mut decisions, d);
                    }
                    for t in &s.tasks {
                        merge_task(&mut tasks, t);
                    }
                    for c in &s.code_changes {
                        merge_code_change(&mut code_changes, c);
                    }
                    for tag in &s.tags {
                        bump_tag(&mut tag_first_seen, tag, batch_index);
                    }
                }
            }
        }

        let tags = weigh_tags(tag_first_seen, batch.len());

        let mut consumed_chunk_ids: Vec<String> =
            prior.map(|p| p.consumed_chunk_ids.clone()).unwrap_or_default();
        consumed_chunk_ids.extend(batch.iter().map(|(id, _)| id.clone()));

        let token_count = estimate_tokens(&summary);
        MergedContext {
            id: format!("{scope_key}-merged-{:06}", generation + batch.len()),
            scope_key: scope_key.to_string(),
            summary,
            decisions,
            tasks,
            code_changes,
            tags,
            consumed_chunk_ids,
            token_count,
            created_at: prior.map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
        }
    }
}

fn normalize_key(description: &str) -> String {
    description
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn merge_decision(decisions: &mut Vec<DecisionRecord>, incoming: &DecisionRecord) {
    let key = normalize_key(&incoming.description);
    match decisions
        .iter_mut()
        .find(|d| normalize_key(&d.description) == key)
    {
        Some(existing) => {
            // Higher importance wins
            if incoming.importance > existing.importance {
                existing.importance = incoming.importance;
            }
        }
        None => decisions.push(incoming.clone()),
    }
}

fn merge_task(tasks: &mut Vec<TaskRecord>, incoming: &TaskRecord) {
    let key = normalize_key(&incoming.description);
    match tasks
        .iter_mut()
        .find(|t| normalize_key(&t.description) == key)
    {
        Some(existing) => {
            // More-advanced status wins
            if incoming.status > existing.status {
                existing.status = incoming.status;
            }
        }
        None => tasks.push(incoming.clone()),
    }
}

fn merge_code_change(changes: &mut Vec<CodeChange>, incoming: &CodeChange) {
    match changes.iter_mut().find(|c| c.path == incoming.path) {
        // Latest change description for the same file path wins
        Some(existing) => existing.description = incoming.description.clone(),
        None => changes.push(incoming.clone()),
    }
}

fn bump_tag(tags: &mut Vec<(String, usize, usize)>, tag: &str, batch_index: usize) {
    let normalized = tag.to_lowercase();
    match tags.iter_mut().find(|(t, _, _)| *t == normalized) {
        Some((_, freq, last)) => {
            *freq += 1;
            *last = batch_index;
        }
        None => tags.push((normalized, 1, batch_index)),
    }
}

/// `weight = 0.6 * (frequency / maxFrequency) + 0.4 * recency`, where
/// recency is the tag's relative position within the batch (later = higher).
fn weigh_tags(tags: Vec<(String, usize, usize)>, batch_len: usize) -> Vec<WeightedTag> {
    let max_freq = tags.iter().map(|(_, f, _)| *f).max().unwrap_or(1) as f64;
    let denom = batch_len.max(1) as f64;
    let mut weighted: Vec<WeightedTag> = tags
        .into_iter()
        .map(|(tag, freq, last_index)| {
            let recency = (last_index + 1) as f64 / denom;
            WeightedTag {
                tag,
                weight: TAG_FREQUENCY_WEIGHT * (freq as f64 / max_freq)
                    + TAG_RECENCY_WEIGHT * recency,
            }
        })
        .collect();
    weighted.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tag.cmp(&b.tag))
    });
    weighted
}
