//! Near-Duplicate Filter: simhash-style fingerprints plus a session-scoped
//! kept set compared by Hamming distance.

use crate::text::significant_tokens;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Fingerprint widths supported by the two execution tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintWidth {
    /// Exhaustive tier: 64-bit.
    W64,
    /// Fast tier: 32-bit.
    W32,
}

impl FingerprintWidth {
    fn bits(self) -> u32 {
        match self {
            Self::W64 => 64,
            Self::W32 => 32,
        }
    }
}

/// A fixed-width bit signature summarizing a chunk's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    bits: u64,
    width: FingerprintWidth,
}

impl Fingerprint {
    /// Compute the simhash of a text's significant tokens.
    ///
    /// For each token, every bit position of its hash accumulates +1/-1
    /// into a per-bit counter; the final fingerprint sets bit `i` iff the
    /// counter for bit `i` is positive.
    pub fn compute(text: &str, width: FingerprintWidth) -> Self {
        let bit_count = width.bits();
        let mut counters = [0i32; 64];

        for token in significant_tokens(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let hashed = hasher.finish();
            for (i, counter) in counters.iter_mut().enumerate().take(bit_count as usize) {
                if hashed & (1u64 << i) != 0 {
                    *counter += 1;
                } else {
                    *counter -= 1;
                }
            }
        }

        let mut bits = 0u64;
        for (i, &counter) in counters.iter().enumerate().take(bit_count as usize) {
            if counter > 0 {
                bits |= 1u64 << i;
            }
        }
        Self { bits, width }
    }

    /// Hamming distance to another fingerprint (hardware popcount).
    ///
    /// Mixed-width comparisons use the narrower width's bit range.
    pub fn hamming(&self, other: &Fingerprint) -> u32 {
        let narrow = self.width.bits().min(other.width.bits());
        let mask = if narrow == 64 { u64::MAX } else { (1u64 << narrow) - 1 };
        ((self.bits ^ other.bits) & mask).count_ones()
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }
}

/// Session-scoped set of kept fingerprints.
///
/// Order-dependent by design: a chunk is only compared against fingerprints
/// already kept. The set is never pruned within a session, which is an
/// unbounded-growth risk for arbitrarily long-lived sessions.
#[derive(Debug, Clone)]
pub struct DuplicateFilter {
    kept: Vec<Fingerprint>,
    hamming_threshold: u32,
}

impl DuplicateFilter {
    pub fn new(hamming_threshold: u32) -> Self {
        Self {
            kept: Vec::new(),
            hamming_threshold,
        }
    }

    /// Check a fingerprint against the kept set.
    ///
    /// Returns `true` and records the fingerprint when it is novel;
    /// returns `false` when it is within the Hamming threshold of an
    /// already-kept fingerprint (a near-duplicate to drop).
    pub fn keep(&mut self, fingerprint: Fingerprint) -> bool {
        if self
            .kept
            .iter()
            .any(|existing| existing.hamming(&fingerprint) <= self.hamming_threshold)
        {
            return false;
        }
        self.kept.push(fingerprint);
        true
    }

    pub fn kept_count(&self) -> usize {
        self.kept.len()
    }
}
