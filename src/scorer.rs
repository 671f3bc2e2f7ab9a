//! Parallel pair scoring.
//!
//! Candidate pairs are chunked into fixed-size batches; worker threads
//! build each batch's feature matrix, apply the classifier, and filter by
//! the score threshold. Workers share only immutable state (the data model
//! and the trained weights), so batches are embarrassingly parallel.
//! Emission order across batches is arbitrary; the final sort-and-dedup
//! pass makes the output deterministic in content and guards against a
//! buggy upstream handing in a pair twice.

use rayon::prelude::*;
use tracing::debug;

use crate::algo::logistic::LogisticModel;
use crate::cancel::{self, CancelToken};
use crate::error::Result;
use crate::features;
use crate::model::{CompiledRecord, DataModel};

/// Pairs scored per batch. Bounds memory at
/// `chunk_size · feature_count · 4 bytes` per worker.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// A scored candidate pair of record positions, `a < b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredPair {
    pub a: usize,
    pub b: usize,
    pub score: f32,
}

/// Score candidate pairs, keeping those with `score > threshold`.
///
/// The cancellation token is observed at batch boundaries; a cancelled run
/// returns the error, never a partial result.
pub fn score_pairs(
    records: &[CompiledRecord],
    pairs: &[(usize, usize)],
    model: &DataModel,
    classifier: &LogisticModel,
    threshold: f32,
    chunk_size: usize,
    token: Option<&CancelToken>,
) -> Result<Vec<ScoredPair>> {
    let chunk_size = chunk_size.max(1);

    let scored: Vec<Vec<ScoredPair>> = pairs
        .par_chunks(chunk_size)
        .map(|chunk| -> Result<Vec<ScoredPair>> {
            cancel::check(token)?;

            let pair_refs: Vec<(&CompiledRecord, &CompiledRecord)> = chunk
                .iter()
                .map(|&(a, b)| (&records[a], &records[b]))
                .collect();
            let matrix = features::distances(&pair_refs, model)?;

            let mut kept = Vec::new();
            for (i, &(a, b)) in chunk.iter().enumerate() {
                let score = classifier.score(matrix.row(i));
                if score > threshold {
                    kept.push(ScoredPair { a, b, score });
                }
            }
            Ok(kept)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut out: Vec<ScoredPair> = scored.into_iter().flatten().collect();
    debug!(scored = out.len(), "pairs above threshold");

    // Deterministic order plus the duplicate guard.
    out.sort_by_key(|p| (p.a, p.b));
    out.dedup_by_key(|p| (p.a, p.b));
    debug!(unique = out.len(), "unique scored pairs");

    Ok(out)
}
