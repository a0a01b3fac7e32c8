//! Shared text utilities: tokenization, token estimation, sentence splitting.
//!
//! Token counts here are an internal consistency unit used for chunk budgets
//! and compression ratios, not a wire contract with any real tokenizer.

use regex::Regex;
use std::sync::LazyLock;

/// Minimum length for a token to be considered significant.
const MIN_SIGNIFICANT_LEN: usize = 3;

/// Approximate characters per token, used for sub-word weighting.
const APPROX_CHARS_PER_TOKEN: usize = 4;

// Compile the sentence boundary regex once
static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+\s+|\n+").unwrap());

/// Common English stopwords excluded from term weighting, fingerprinting
/// and similarity comparisons.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can",
    "did", "do", "does", "for", "from", "had", "has", "have", "he", "her",
    "his", "i", "if", "in", "is", "it", "its", "me", "my", "no", "not", "of",
    "on", "or", "our", "she", "so", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "to", "was", "we", "were", "what",
    "when", "which", "who", "will", "with", "would", "you", "your",
];

/// Check whether a normalized token is a stopword.
pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.binary_search(&token).is_ok()
}

/// Normalize a raw word: lowercase, strip surrounding punctuation.
///
/// Returns None when nothing alphanumeric remains.
pub fn normalize_token(word: &str) -> Option<String> {
    let trimmed: String = word
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Split text into normalized tokens (stopwords included).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().filter_map(normalize_token).collect()
}

/// Split text into significant tokens: normalized, stopwords removed,
/// short fragments dropped.
pub fn significant_tokens(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.len() >= MIN_SIGNIFICANT_LEN && !is_stopword(t))
        .collect()
}

/// Estimate the token count of a text.
///
/// Each whitespace-separated word counts as at least one token; long words
/// count proportionally to their length so code identifiers and URLs are
/// not undercounted.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace()
        .map(|w| w.len().div_ceil(APPROX_CHARS_PER_TOKEN).max(1))
        .sum()
}

/// Split text into candidate sentences on `.`/`!`/`?` runs and newlines.
///
/// Sentences shorter than `min_len` characters are dropped.
pub fn split_sentences(text: &str, min_len: usize) -> Vec<String> {
    SENTENCE_BOUNDARY
        .split(text)
        .map(str::trim)
        .filter(|s| s.chars().count() >= min_len)
        .map(|s| s.trim_end_matches(['.', '!', '?']).to_string())
        .collect()
}

/// Jaccard similarity between the significant-token sets of two texts.
///
/// Returns a value in `[0, 1]`; two texts with no significant tokens at
/// all compare as identical (1.0).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;

    let set_a: HashSet<String> = significant_tokens(a).into_iter().collect();
    let set_b: HashSet<String> = significant_tokens(b).into_iter().collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}
