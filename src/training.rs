//! Labeled training pairs and classifier training.
//!
//! The labeled store keeps match and distinct pairs in insertion order so a
//! training session can be replayed, deduplicating structurally equal
//! pairs. The JSON document format has two top-level keys, `match` and
//! `distinct`, each an array of two-record arrays.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::algo::logistic::{self, LogisticModel};
use crate::error::{Error, Result};
use crate::features;
use crate::model::DataModel;
use crate::record::{Record, RecordId};

/// Ordered, deduplicated store of labeled record pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingPairs {
    #[serde(rename = "match")]
    matches: Vec<(Record, Record)>,
    #[serde(rename = "distinct")]
    distincts: Vec<(Record, Record)>,
}

impl TrainingPairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair labeled as a match. Structural duplicates are ignored.
    pub fn add_match(&mut self, a: Record, b: Record) {
        let pair = (a, b);
        if !self.matches.contains(&pair) {
            self.matches.push(pair);
        }
    }

    /// Add a pair labeled as distinct. Structural duplicates are ignored.
    pub fn add_distinct(&mut self, a: Record, b: Record) {
        let pair = (a, b);
        if !self.distincts.contains(&pair) {
            self.distincts.push(pair);
        }
    }

    pub fn matches(&self) -> &[(Record, Record)] {
        &self.matches
    }

    pub fn distincts(&self) -> &[(Record, Record)] {
        &self.distincts
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty() && self.distincts.is_empty()
    }

    /// Parse the two-key JSON training document.
    pub fn from_json(reader: impl Read) -> Result<Self> {
        serde_json::from_reader(reader)
            .map_err(|e| Error::Settings(format!("malformed training document: {e}")))
    }

    /// Write the training document.
    pub fn to_json(&self, writer: impl Write) -> Result<()> {
        serde_json::to_writer(writer, self)
            .map_err(|e| Error::Settings(format!("could not serialise training pairs: {e}")))
    }
}

/// Train the pair classifier from labeled examples.
///
/// With `alpha` unset, the regularisation strength is chosen by grid search
/// under k-fold cross-validation, k = min(20, max(2, n_matches / 3)).
pub fn train(
    model: &DataModel,
    pairs: &TrainingPairs,
    alpha: Option<f64>,
) -> Result<LogisticModel> {
    if pairs.matches.len() < 2 {
        return Err(Error::Training(format!(
            "need at least two match examples, have {}",
            pairs.matches.len()
        )));
    }
    if pairs.distincts.len() < 2 {
        return Err(Error::Training(format!(
            "need at least two distinct examples, have {}",
            pairs.distincts.len()
        )));
    }

    let cols = model.feature_count();
    let mut x = Vec::new();
    let mut y = Vec::new();
    for (label, examples) in [(true, &pairs.matches), (false, &pairs.distincts)] {
        let tag = if label { "match" } else { "distinct" };
        for (i, (a, b)) in examples.iter().enumerate() {
            let left = model.compile(&RecordId::Text(format!("{tag}[{i}].0")), a)?;
            let right = model.compile(&RecordId::Text(format!("{tag}[{i}].1")), b)?;
            x.extend(features::pair_vector(&left, &right, model)?);
            y.push(label);
        }
    }
    let rows = y.len();

    if degenerate(rows, cols, &x) {
        return Err(Error::Training(
            "degenerate feature matrix: no column varies".into(),
        ));
    }

    let alpha = match alpha {
        Some(a) => a,
        None => {
            let k = (pairs.matches.len() / 3).clamp(2, 20);
            info!(folds = k, "cross-validating regularisation strength");
            logistic::grid_search_alpha(rows, cols, &x, &y, k)
        }
    };

    let classifier = logistic::fit(rows, cols, &x, &y, alpha);
    for (name, weight) in model.column_names().iter().zip(&classifier.weights) {
        info!(field = name.as_str(), weight, "learned weight");
    }
    info!(bias = classifier.bias, alpha, "trained classifier");

    Ok(classifier)
}

/// True when every feature column is constant.
fn degenerate(rows: usize, cols: usize, x: &[f32]) -> bool {
    if rows == 0 || cols == 0 {
        return true;
    }
    for col in 0..cols {
        let first = x[col];
        for row in 1..rows {
            if x[row * cols + col] != first {
                return false;
            }
        }
    }
    true
}
