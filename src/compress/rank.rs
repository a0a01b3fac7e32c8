//! Sentence-Ranking Extractor: graph-based relevance over a chunk's
//! sentences, with a linear fast tier for large inputs.

use crate::text::{significant_tokens, split_sentences};
use std::collections::HashMap;

/// Sentences shorter than this many characters are not candidates.
const MIN_SENTENCE_LEN: usize = 10;

/// Fast-tier maximum sentence length filter.
const MAX_SENTENCE_LEN: usize = 400;

/// Damping factor for the rank iterations.
const DAMPING: f64 = 0.85;

/// Fixed number of weighted rank iterations.
const ITERATIONS: usize = 3;

/// Rank sentences by graph relevance and return the top `n`, in their
/// original order of appearance.
///
/// Graph construction is quadratic in the sentence count; callers with
/// large inputs should use [`pick_sentences_fast`] instead.
pub fn rank_sentences(text: &str, n: usize) -> Vec<String> {
    let sentences = split_sentences(text, MIN_SENTENCE_LEN);
    if sentences.len() <= n {
        return sentences;
    }

    let token_sets: Vec<HashMap<String, u32>> = sentences
        .iter()
        .map(|s| {
            let mut counts = HashMap::new();
            for token in significant_tokens(s) {
                *counts.entry(token).or_insert(0u32) += 1;
            }
            counts
        })
        .collect();

    let count = sentences.len();
    let mut weights = vec![vec![0.0f64; count]; count];
    for i in 0..count {
        for j in (i + 1)..count {
            let sim = cosine_similarity(&token_sets[i], &token_sets[j]);
            weights[i][j] = sim;
            weights[j][i] = sim;
        }
    }

    // Weighted PageRank, uniform start, fixed iteration count
    let mut scores = vec![1.0f64 / count as f64; count];
    for _ in 0..ITERATIONS {
        let mut next = vec![(1.0 - DAMPING) / count as f64; count];
        for i in 0..count {
            for j in 0..count {
                if i == j || weights[j][i] == 0.0 {
                    continue;
                }
                let out_sum: f64 = weights[j].iter().sum();
                if out_sum > 0.0 {
                    next[i] += DAMPING * scores[j] * weights[j][i] / out_sum;
                }
            }
        }
        scores = next;
    }

    let mut ranked: Vec<usize> = (0..count).collect();
    ranked.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(&b))
    });
    let mut picked: Vec<usize> = ranked.into_iter().take(n).collect();
    picked.sort_unstable();
    picked.into_iter().map(|i| sentences[i].clone()).collect()
}

/// Fast tier: first-N sentences passing min/max length filters, O(n)
/// single pass. Explicitly trades ranking quality for throughput.
pub fn pick_sentences_fast(text: &str, n: usize) -> Vec<String> {
    split_sentences(text, MIN_SENTENCE_LEN)
        .into_iter()
        .filter(|s| s.chars().count() <= MAX_SENTENCE_LEN)
        .take(n)
        .collect()
}

/// Cosine similarity between two sentence token-count vectors.
fn cosine_similarity(a: &HashMap<String, u32>, b: &HashMap<String, u32>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .filter_map(|(token, &count)| b.get(token).map(|&other| (count * other) as f64))
        .sum();
    if dot == 0.0 {
        return 0.0;
    }
    let norm_a: f64 = a.values().map(|&c| (c * c) as f64).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|&c| (c * c) as f64).sum::<f64>().sqrt();
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "The cache layer stores compressed summaries for reuse. \
        The cache layer also evicts stale compressed summaries. \
        Squirrels enjoy acorns in autumn. \
        Eviction from the cache layer happens under memory pressure. \
        A completely unrelated remark about weather patterns today.";

    #[test]
    fn test_rank_returns_n_sentences() {
        let picked = rank_sentences(SAMPLE, 3);
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_central_sentences_win() {
        // Three sentences about the cache layer reinforce each other;
        // the squirrel sentence is an outlier and should not rank top 3.
        let picked = rank_sentences(SAMPLE, 3);
        assert!(!picked.iter().any(|s| s.contains("Squirrels")));
    }

    #[test]
    fn test_short_sentences_dropped() {
        let picked = rank_sentences("Tiny. Too small. This sentence is long enough to keep.", 3);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn test_fast_tier_positional() {
        let picked = pick_sentences_fast(SAMPLE, 2);
        assert_eq!(picked.len(), 2);
        assert!(picked[0].contains("stores compressed summaries"));
    }

    #[test]
    fn test_rank_preserves_original_order() {
        let picked = rank_sentences(SAMPLE, 3);
        // Output order must follow appearance order in the text
        let positions: Vec<usize> = picked
            .iter()
            .map(|s| SAMPLE.find(&s[..20.min(s.len())]).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }
}
