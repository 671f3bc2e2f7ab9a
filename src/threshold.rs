//! Threshold selection.
//!
//! Treats each candidate score as the probability that the pair is a true
//! match. Scanning the scores in descending order then gives, at every
//! prefix, an expected true-positive count and from it expected precision
//! and recall. The selected threshold maximises F-beta.

use ordered_float::OrderedFloat;
use tracing::info;

/// Default tradeoff: weigh recall 1.5 times as heavily as precision.
pub const DEFAULT_RECALL_WEIGHT: f64 = 1.5;

/// Score cut maximising expected `F_β` over a sample of scored pairs, with
/// `β = recall_weight`. An empty sample falls back to 0.5.
pub fn good_threshold(scores: &[f32], recall_weight: f64) -> f32 {
    if scores.is_empty() {
        return 0.5;
    }

    let mut sorted: Vec<f64> = scores.iter().map(|&s| s as f64).collect();
    sorted.sort_by_key(|&s| OrderedFloat(-s));

    let mut cumulative = Vec::with_capacity(sorted.len());
    let mut total = 0.0;
    for &s in &sorted {
        total += s;
        cumulative.push(total);
    }
    if total <= 0.0 {
        return 0.5;
    }

    let beta_sq = recall_weight * recall_weight;
    let mut best = (0usize, f64::MIN);
    for (i, &expected_tp) in cumulative.iter().enumerate() {
        let precision = expected_tp / (i + 1) as f64;
        let recall = expected_tp / total;
        let denominator = beta_sq * precision + recall;
        if denominator <= 0.0 {
            continue;
        }
        let f_beta = (1.0 + beta_sq) * precision * recall / denominator;
        if f_beta > best.1 {
            best = (i, f_beta);
        }
    }

    let (i, _) = best;
    let precision = cumulative[i] / (i + 1) as f64;
    let recall = cumulative[i] / total;
    info!(
        threshold = sorted[i],
        precision, recall, "maximum expected f-score"
    );

    sorted[i] as f32
}
