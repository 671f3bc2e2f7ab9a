//! MinHash signatures and LSH band keys.
//!
//! The blocking predicate library uses banded minhash signatures as block
//! keys: records agreeing on any band become candidates. With the default
//! 128 permutations split into 16 bands of 8 rows, the candidate threshold
//! sits near 0.54 Jaccard similarity.

use siphasher::sip::SipHasher13;
use std::hash::{Hash, Hasher};

pub const DEFAULT_NUM_PERM: usize = 128;
pub const DEFAULT_BANDS: usize = 16;

/// MinHash signature generator with a fixed, deterministic hash family.
pub struct MinHasher {
    num_perm: usize,
    seeds: Vec<(u64, u64)>,
}

impl MinHasher {
    pub fn new(num_perm: usize) -> Self {
        let seeds: Vec<(u64, u64)> = (0..num_perm)
            .map(|i| {
                let a = (i as u64).wrapping_mul(6364136223846793005).wrapping_add(1);
                let b = (i as u64).wrapping_mul(1442695040888963407).wrapping_add(7);
                (a, b)
            })
            .collect();
        Self { num_perm, seeds }
    }

    pub fn with_default_perm() -> Self {
        Self::new(DEFAULT_NUM_PERM)
    }

    pub fn num_perm(&self) -> usize {
        self.num_perm
    }

    /// Signature of a token set: the minimum hash under each permutation.
    pub fn signature(&self, tokens: &[String]) -> Vec<u64> {
        let mut sig = vec![u64::MAX; self.num_perm];
        for token in tokens {
            for (i, &(key0, key1)) in self.seeds.iter().enumerate() {
                let mut hasher = SipHasher13::new_with_keys(key0, key1);
                token.hash(&mut hasher);
                let h = hasher.finish();
                if h < sig[i] {
                    sig[i] = h;
                }
            }
        }
        sig
    }

    /// Estimate Jaccard similarity from two signatures.
    pub fn jaccard(&self, sig_a: &[u64], sig_b: &[u64]) -> f64 {
        debug_assert_eq!(sig_a.len(), sig_b.len());
        let matches = sig_a.iter().zip(sig_b).filter(|(a, b)| a == b).count();
        matches as f64 / sig_a.len().max(1) as f64
    }

    /// Band keys for blocking: the signature split into `bands` slices, each
    /// hashed to one key. An empty token set produces no keys.
    pub fn band_keys(&self, tokens: &[String], bands: usize) -> Vec<String> {
        if tokens.is_empty() {
            return Vec::new();
        }
        let sig = self.signature(tokens);
        let rows = self.num_perm / bands;

        (0..bands)
            .map(|band| {
                let slice = &sig[band * rows..(band + 1) * rows];
                let mut hasher = SipHasher13::new_with_keys(band as u64, 0x5eed);
                for &v in slice {
                    v.hash(&mut hasher);
                }
                format!("{band}:{:016x}", hasher.finish())
            })
            .collect()
    }
}

impl Default for MinHasher {
    fn default() -> Self {
        Self::with_default_perm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn identical_sets_jaccard_one() {
        let mh = MinHasher::new(128);
        let sig = mh.signature(&toks(&["a", "b", "c"]));
        assert!((mh.jaccard(&sig, &sig) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn disjoint_sets_low_jaccard() {
        let mh = MinHasher::new(128);
        let a = mh.signature(&toks(&["a", "b", "c"]));
        let b = mh.signature(&toks(&["x", "y", "z"]));
        assert!(mh.jaccard(&a, &b) < 0.2);
    }

    #[test]
    fn overlapping_sets_high_jaccard() {
        let mh = MinHasher::new(256);
        let a: Vec<String> = (0..100).map(|i| format!("token_{i}")).collect();
        let mut b = a.clone();
        for (i, t) in b.iter_mut().take(10).enumerate() {
            *t = format!("different_{i}");
        }
        let j = mh.jaccard(&mh.signature(&a), &mh.signature(&b));
        assert!(j > 0.7, "expected high jaccard, got {j}");
    }

    #[test]
    fn deterministic_signature() {
        let mh = MinHasher::new(64);
        let tokens = toks(&["hello", "world"]);
        assert_eq!(mh.signature(&tokens), mh.signature(&tokens));
    }

    #[test]
    fn identical_sets_share_all_bands() {
        let mh = MinHasher::with_default_perm();
        let a = mh.band_keys(&toks(&["acme", "pipe", "supply"]), DEFAULT_BANDS);
        let b = mh.band_keys(&toks(&["acme", "pipe", "supply"]), DEFAULT_BANDS);
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_BANDS);
    }

    #[test]
    fn similar_sets_share_some_band() {
        let mh = MinHasher::with_default_perm();
        let a: Vec<String> = (0..30).map(|i| format!("t{i}")).collect();
        let mut b = a.clone();
        b[0] = "changed".into();
        let keys_a = mh.band_keys(&a, DEFAULT_BANDS);
        let keys_b = mh.band_keys(&b, DEFAULT_BANDS);
        let shared = keys_a.iter().filter(|k| keys_b.contains(k)).count();
        assert!(shared > 0, "near-identical sets should share a band");
    }

    #[test]
    fn disjoint_sets_share_no_band() {
        let mh = MinHasher::with_default_perm();
        let keys_a = mh.band_keys(&toks(&["a", "b", "c"]), DEFAULT_BANDS);
        let keys_b = mh.band_keys(&toks(&["x", "y", "z"]), DEFAULT_BANDS);
        let shared = keys_a.iter().filter(|k| keys_b.contains(k)).count();
        assert_eq!(shared, 0);
    }

    #[test]
    fn empty_tokens_no_band_keys() {
        let mh = MinHasher::with_default_perm();
        assert!(mh.band_keys(&[], DEFAULT_BANDS).is_empty());
    }

    #[test]
    fn band_keys_carry_band_index() {
        let mh = MinHasher::with_default_perm();
        let keys = mh.band_keys(&toks(&["a"]), DEFAULT_BANDS);
        assert!(keys[0].starts_with("0:"));
        assert!(keys[15].starts_with("15:"));
    }
}
