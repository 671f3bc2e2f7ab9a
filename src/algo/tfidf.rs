//! TF-IDF corpus statistics, cosine distance, and canopy construction.
//!
//! One [`Corpus`] per text-bearing field. Document frequencies are collected
//! in a single pass; records whose field is absent still count as (empty)
//! documents, so `N` reflects the full record set.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Sparse token-weight vector, L2-normalised unless noted.
pub type SparseVector = HashMap<String, f64>;

/// Document-frequency table for one field's corpus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    doc_freq: HashMap<String, u32>,
    num_docs: u32,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document's tokens. Each distinct token counts once toward its
    /// document frequency.
    pub fn add_document(&mut self, tokens: &[String]) {
        let distinct: HashSet<&String> = tokens.iter().collect();
        for token in distinct {
            *self.doc_freq.entry(token.clone()).or_insert(0) += 1;
        }
        self.num_docs += 1;
    }

    /// Count a record whose field is absent: an empty document. Keeps `N`
    /// honest without contributing any tokens.
    pub fn add_missing(&mut self) {
        self.num_docs += 1;
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn doc_freq(&self, token: &str) -> u32 {
        self.doc_freq.get(token).copied().unwrap_or(0)
    }

    /// Document-frequency cutoff above which a token is a stop word.
    pub fn stop_threshold(&self) -> f64 {
        (0.025 * self.num_docs as f64).max(500.0)
    }

    /// A token is dropped from weight vectors when it appears in fewer than
    /// two documents (it can never link two records) or in more documents
    /// than the stop threshold.
    pub fn is_dropped(&self, token: &str) -> bool {
        let df = self.doc_freq(token);
        df < 2 || df as f64 > self.stop_threshold()
    }

    /// All stop words (high-frequency tokens), for the settings artifact.
    pub fn stop_words(&self) -> Vec<String> {
        let threshold = self.stop_threshold();
        let mut words: Vec<String> = self
            .doc_freq
            .iter()
            .filter(|(_, &df)| df as f64 > threshold)
            .map(|(t, _)| t.clone())
            .collect();
        words.sort();
        info!(stop_words = words.len(), threshold, "stop word threshold");
        words
    }

    /// `ln(N / df)` for a seen token.
    pub fn idf(&self, token: &str) -> f64 {
        let df = self.doc_freq(token).max(1) as f64;
        (self.num_docs.max(1) as f64 / df).ln()
    }

    /// L2-normalised `tf · ln(N/df)` vector, with singleton and stop tokens
    /// dropped. May be empty.
    pub fn weight_vector(&self, tokens: &[String]) -> SparseVector {
        let mut counts: HashMap<&String, u32> = HashMap::new();
        for t in tokens {
            *counts.entry(t).or_insert(0) += 1;
        }

        let mut vector: SparseVector = counts
            .into_iter()
            .filter(|(t, _)| !self.is_dropped(t))
            .map(|(t, tf)| (t.clone(), tf as f64 * self.idf(t)))
            .collect();

        let norm: f64 = vector.values().map(|w| w * w).sum::<f64>().sqrt();
        if norm > 0.0 {
            for w in vector.values_mut() {
                *w /= norm;
            }
        }
        vector
    }

    /// IDF-weighted Jaccard distance between two token sets: one minus the
    /// ratio of intersection weight to union weight.
    pub fn weighted_jaccard_distance(&self, a: &[String], b: &[String]) -> f64 {
        let set_a: HashSet<&String> = a.iter().collect();
        let set_b: HashSet<&String> = b.iter().collect();
        if set_a.is_empty() && set_b.is_empty() {
            return 0.0;
        }

        let mut intersection = 0.0;
        let mut union = 0.0;
        for t in set_a.union(&set_b) {
            let idf = self.idf(t);
            union += idf;
            if set_a.contains(*t) && set_b.contains(*t) {
                intersection += idf;
            }
        }
        if union <= 0.0 {
            return 0.0;
        }
        1.0 - intersection / union
    }
}

/// Dot product of two normalised sparse vectors.
pub fn dot(a: &SparseVector, b: &SparseVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(t, wa)| large.get(t).map(|wb| wa * wb))
        .sum()
}

/// Cosine distance `1 − a·b` of two normalised vectors, clamped to `[0, 1]`.
pub fn cosine_distance(a: &SparseVector, b: &SparseVector) -> f64 {
    (1.0 - dot(a, b)).clamp(0.0, 1.0)
}

/// Greedy TF-IDF canopy assignment.
///
/// Walks documents in index order; each unassigned document becomes a canopy
/// centre and captures every unassigned document whose cosine similarity to
/// it exceeds `threshold`. Returns, for each document, the index of its
/// centre (itself if it is one). Deterministic for a given vector order.
pub fn canopies(vectors: &[SparseVector], threshold: f64) -> Vec<usize> {
    let n = vectors.len();
    let mut assignment: Vec<Option<usize>> = vec![None; n];

    // Inverted index: token -> documents containing it.
    let mut postings: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, v) in vectors.iter().enumerate() {
        for token in v.keys() {
            postings.entry(token).or_default().push(i);
        }
    }

    for center in 0..n {
        if assignment[center].is_some() {
            continue;
        }
        assignment[center] = Some(center);
        let center_vector = &vectors[center];
        if center_vector.is_empty() {
            continue;
        }

        let mut candidates: HashSet<usize> = HashSet::new();
        for token in center_vector.keys() {
            if let Some(docs) = postings.get(token.as_str()) {
                candidates.extend(docs.iter().copied());
            }
        }

        let mut members: Vec<usize> = candidates
            .into_iter()
            .filter(|&i| assignment[i].is_none())
            .collect();
        members.sort_unstable();

        for i in members {
            if dot(center_vector, &vectors[i]) > threshold {
                assignment[i] = Some(center);
            }
        }
    }

    assignment.into_iter().map(|a| a.unwrap_or(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn shared_corpus() -> Corpus {
        let mut c = Corpus::new();
        c.add_document(&toks(&["acme", "pipe", "supply"]));
        c.add_document(&toks(&["acme", "pipe", "works"]));
        c.add_document(&toks(&["zenith", "pipe", "corp"]));
        c
    }

    #[test]
    fn doc_freq_counts_documents_not_tokens() {
        let mut c = Corpus::new();
        c.add_document(&toks(&["a", "a", "a", "b"]));
        assert_eq!(c.doc_freq("a"), 1);
        assert_eq!(c.doc_freq("b"), 1);
    }

    #[test]
    fn missing_counts_as_empty_document() {
        let mut c = Corpus::new();
        c.add_document(&toks(&["a"]));
        c.add_missing();
        assert_eq!(c.num_docs(), 2);
        assert_eq!(c.doc_freq("a"), 1);
    }

    #[test]
    fn singletons_dropped_from_vectors() {
        let c = shared_corpus();
        // "supply" appears in one document only.
        let v = c.weight_vector(&toks(&["acme", "supply"]));
        assert!(v.contains_key("acme"));
        assert!(!v.contains_key("supply"));
    }

    #[test]
    fn weight_vector_is_normalised() {
        let c = shared_corpus();
        let v = c.weight_vector(&toks(&["acme", "pipe"]));
        let norm: f64 = v.values().map(|w| w * w).sum::<f64>();
        assert!((norm - 1.0).abs() < 1e-10, "norm^2 = {norm}");
    }

    #[test]
    fn rare_token_weighs_more() {
        let c = shared_corpus();
        // df(acme) = 2 < df(pipe) = 3, so acme carries more weight.
        let v = c.weight_vector(&toks(&["acme", "pipe"]));
        assert!(v["acme"] > v["pipe"]);
    }

    #[test]
    fn identical_documents_cosine_zero() {
        let c = shared_corpus();
        let a = c.weight_vector(&toks(&["acme", "pipe"]));
        let b = c.weight_vector(&toks(&["acme", "pipe"]));
        assert!(cosine_distance(&a, &b) < 1e-10);
    }

    #[test]
    fn disjoint_documents_cosine_one() {
        let c = shared_corpus();
        let a = c.weight_vector(&toks(&["acme"]));
        let b = c.weight_vector(&toks(&["zenith", "corp"]));
        // zenith and corp are singletons, so b is empty: distance 1.
        assert_eq!(cosine_distance(&a, &b), 1.0);
    }

    #[test]
    fn cosine_symmetry() {
        let c = shared_corpus();
        let a = c.weight_vector(&toks(&["acme", "pipe"]));
        let b = c.weight_vector(&toks(&["pipe", "corp"]));
        assert!((cosine_distance(&a, &b) - cosine_distance(&b, &a)).abs() < 1e-12);
    }

    #[test]
    fn stop_threshold_floor_is_500() {
        let c = shared_corpus();
        assert_eq!(c.stop_threshold(), 500.0);
    }

    #[test]
    fn stop_threshold_scales_with_corpus() {
        let mut c = Corpus::new();
        for _ in 0..40_000 {
            c.add_missing();
        }
        assert_eq!(c.stop_threshold(), 1000.0);
    }

    #[test]
    fn weighted_jaccard_identical_zero() {
        let c = shared_corpus();
        let d = c.weighted_jaccard_distance(&toks(&["acme", "pipe"]), &toks(&["acme", "pipe"]));
        assert!(d.abs() < 1e-10);
    }

    #[test]
    fn weighted_jaccard_disjoint_one() {
        let c = shared_corpus();
        let d = c.weighted_jaccard_distance(&toks(&["acme"]), &toks(&["zenith"]));
        assert!((d - 1.0).abs() < 1e-10);
    }

    #[test]
    fn weighted_jaccard_rare_overlap_closer() {
        let mut c = Corpus::new();
        c.add_document(&toks(&["common", "rare"]));
        c.add_document(&toks(&["common", "rare"]));
        for _ in 0..20 {
            c.add_document(&toks(&["common", "filler"]));
        }
        // Sharing the rare token should matter more than sharing the common one.
        let share_rare = c.weighted_jaccard_distance(&toks(&["rare", "x"]), &toks(&["rare", "y"]));
        let share_common =
            c.weighted_jaccard_distance(&toks(&["common", "x"]), &toks(&["common", "y"]));
        assert!(share_rare < share_common);
    }

    #[test]
    fn canopies_group_similar_documents() {
        let c = shared_corpus();
        let vectors: Vec<SparseVector> = vec![
            c.weight_vector(&toks(&["acme", "pipe"])),
            c.weight_vector(&toks(&["acme", "pipe"])),
            c.weight_vector(&toks(&["zenith", "pipe", "corp"])),
        ];
        let assignment = canopies(&vectors, 0.5);
        assert_eq!(assignment[0], 0);
        assert_eq!(assignment[1], 0, "identical doc joins the first canopy");
    }

    #[test]
    fn canopies_empty_vector_is_own_center() {
        let vectors: Vec<SparseVector> = vec![SparseVector::new(), SparseVector::new()];
        let assignment = canopies(&vectors, 0.2);
        assert_eq!(assignment, vec![0, 1]);
    }

    #[test]
    fn canopies_deterministic() {
        let c = shared_corpus();
        let vectors: Vec<SparseVector> = vec![
            c.weight_vector(&toks(&["acme", "pipe"])),
            c.weight_vector(&toks(&["pipe", "works"])),
            c.weight_vector(&toks(&["acme", "works"])),
        ];
        assert_eq!(canopies(&vectors, 0.3), canopies(&vectors, 0.3));
    }

    #[test]
    fn corpus_serde_roundtrip() {
        let c = shared_corpus();
        let json = serde_json::to_string(&c).unwrap();
        let c2: Corpus = serde_json::from_str(&json).unwrap();
        assert_eq!(c.num_docs(), c2.num_docs());
        assert!((c.idf("acme") - c2.idf("acme")).abs() < 1e-12);
    }
}
