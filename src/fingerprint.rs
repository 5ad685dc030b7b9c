//! Content fingerprints for the tiered change detector.
//!
//! Two fingerprints are computed from normalized text:
//!
//! - [`content_hash`] — SHA-256 hex digest, used for exact (tier 1)
//!   comparison.
//! - [`simhash`] — a 64-bit locality-sensitive hash where Hamming distance
//!   approximates content dissimilarity, used for fuzzy (tier 2)
//!   comparison via [`simhash_similarity`].
//!
//! The simhash is built from word-level shingles: each token hashes to a
//! 64-bit value, each bit position accumulates +1/-1 votes across tokens,
//! and the sign of each accumulator becomes the fingerprint bit. Small
//! edits flip few votes, so near-duplicate texts land at small Hamming
//! distances.

use sha2::{Digest, Sha256};

const SIMHASH_BITS: usize = 64;

/// SHA-256 hex digest of normalized text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 64-bit simhash over whitespace-delimited tokens.
///
/// Empty or whitespace-only text maps to 0.
pub fn simhash(text: &str) -> u64 {
    let mut votes = [0i64; SIMHASH_BITS];
    let mut saw_token = false;

    for token in text.split_whitespace() {
        saw_token = true;
        let h = token_hash(token);
        for (bit, vote) in votes.iter_mut().enumerate() {
            if (h >> bit) & 1 == 1 {
                *vote += 1;
            } else {
                *vote -= 1;
            }
        }
    }

    if !saw_token {
        return 0;
    }

    let mut fingerprint = 0u64;
    for (bit, vote) in votes.iter().enumerate() {
        if *vote > 0 {
            fingerprint |= 1 << bit;
        }
    }
    fingerprint
}

/// Normalized Hamming similarity between two simhashes: the fraction of
/// equal bits, in `[0.0, 1.0]`. Symmetric by construction.
pub fn simhash_similarity(a: u64, b: u64) -> f64 {
    let differing = (a ^ b).count_ones() as f64;
    1.0 - differing / SIMHASH_BITS as f64
}

/// Hash one token to 64 bits (first 8 bytes of its SHA-256 digest).
fn token_hash(token: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}
