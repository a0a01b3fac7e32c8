//! Term-Weighting Extractor: streaming TF-IDF over chunks.
//!
//! Each chunk counts as one document. The document-frequency table is
//! updated incrementally so both update and scoring stay O(chunk size)
//! with no full-corpus rescan.

use crate::text::significant_tokens;
use std::collections::HashMap;

/// Incrementally updated document-frequency table.
#[derive(Debug, Clone, Default)]
pub struct TermWeights {
    doc_freq: HashMap<String, u32>,
    total_docs: u64,
}

impl TermWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents (chunks) observed so far.
    pub fn total_docs(&self) -> u64 {
        self.total_docs
    }

    /// Record one chunk as a document: each distinct significant token
    /// increments its document frequency by one.
    pub fn observe(&mut self, text: &str) {
        self.total_docs += 1;
        let mut seen: HashMap<String, ()> = HashMap::new();
        for token in significant_tokens(text) {
            if seen.insert(token.clone(), ()).is_none() {
                *self.doc_freq.entry(token).or_insert(0) += 1;
            }
        }
    }

    /// Score a chunk's vocabulary and return the top-k terms by weight.
    ///
    /// Term frequency is normalized by the chunk's max token count (0-1);
    /// the weight is `tf * ln(total_docs / (df + 1))`.
    pub fn top_terms(&self, text: &str, k: usize) -> Vec<ScoredTerm> {
        let tokens = significant_tokens(text);
        if tokens.is_empty() || self.total_docs == 0 {
            return Vec::new();
        }

        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *counts.entry(token).or_insert(0) += 1;
        }
        let max_count = counts.values().copied().max().unwrap_or(1) as f64;

        let mut scored: Vec<ScoredTerm> = counts
            .into_iter()
            .map(|(term, count)| {
                let tf = count as f64 / max_count;
                let df = self.doc_freq.get(&term).copied().unwrap_or(0) as f64;
                let idf = (self.total_docs as f64 / (df + 1.0)).ln();
                ScoredTerm {
                    weight: tf * idf,
                    term,
                }
            })
            .collect();

        // Deterministic order: weight descending, then term for ties
        scored.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.term.cmp(&b.term))
        });
        scored.truncate(k);
        scored
    }
}

/// A vocabulary term with its TF-IDF weight.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTerm {
    pub term: String,
    pub weight: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_scores_nothing() {
        let weights = TermWeights::new();
        assert!(weights.top_terms("some text here", 10).is_empty());
    }

    #[test]
    fn test_rare_terms_outrank_common() {
        let mut weights = TermWeights::new();
        // "database" appears in every document, "quaternion" in one
        weights.observe("database schema migration");
        weights.observe("database index tuning");
        weights.observe("database replication lag");
        weights.observe("quaternion rotation math database");

        let top = weights.top_terms("quaternion rotation math database", 2);
        assert_eq!(top.len(), 2);
        assert_ne!(top[0].term, "database");
    }

    #[test]
    fn test_top_k_bounded() {
        let mut weights = TermWeights::new();
        weights.observe("alpha beta gamma delta epsilon zeta");
        let top = weights.top_terms("alpha beta gamma delta epsilon zeta", 3);
        assert_eq!(top.len(), 3);
    }

    #[test]
    fn test_observe_counts_distinct_tokens_once() {
        let mut weights = TermWeights::new();
        weights.observe("cache cache cache cache");
        weights.observe("cache eviction");
        // df(cache) == 2 documents, idf = ln(2/3) < 0
        let top = weights.top_terms("cache eviction", 2);
        let cache = top.iter().find(|t| t.term == "cache").unwrap();
        let eviction = top.iter().find(|t| t.term == "eviction").unwrap();
        assert!(eviction.weight > cache.weight);
    }
}
