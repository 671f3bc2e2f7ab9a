//! Pair feature vectors.
//!
//! For each candidate pair the builder computes one distance per primary
//! field, appends categorical expansion indicators, interaction products,
//! and missing indicators, and packs everything into a dense row-major
//! `f32` matrix. Column order is fixed by the data model, so matrices are
//! layout-compatible across training and inference.

use std::collections::HashSet;

use crate::algo::{geo, string_distance, tfidf, tokenizer};
use crate::error::{Error, Result};
use crate::model::{CompiledRecord, DataModel, FieldKind};
use crate::record::FieldValue;

/// `|ln a − ln b|` beyond this ratio (about e^10 ≈ 22000×) is clamped.
const PRICE_CAP: f64 = 10.0;

/// Dense row-major feature matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub data: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
}

impl FeatureMatrix {
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// Build the feature matrix for a batch of record pairs.
pub fn distances(
    pairs: &[(&CompiledRecord, &CompiledRecord)],
    model: &DataModel,
) -> Result<FeatureMatrix> {
    let cols = model.feature_count();
    let mut data = Vec::with_capacity(pairs.len() * cols);
    for &(a, b) in pairs {
        pair_row(a, b, model, &mut data)?;
    }
    Ok(FeatureMatrix {
        data,
        rows: pairs.len(),
        cols,
    })
}

/// Feature vector for a single pair.
pub fn pair_vector(
    a: &CompiledRecord,
    b: &CompiledRecord,
    model: &DataModel,
) -> Result<Vec<f32>> {
    let mut row = Vec::with_capacity(model.feature_count());
    pair_row(a, b, model, &mut row)?;
    Ok(row)
}

fn pair_row(
    a: &CompiledRecord,
    b: &CompiledRecord,
    model: &DataModel,
    out: &mut Vec<f32>,
) -> Result<()> {
    // Primary distances, NaN marking a missing comparison.
    let mut primaries = Vec::with_capacity(model.primary_count());
    for (col, def) in model.primary_defs().enumerate() {
        let va = &a.values[col];
        let vb = &b.values[col];
        let d = primary_distance(def, model, va, vb)?;
        if !d.is_nan() && !d.is_finite() {
            return Err(Error::NonFiniteFeature {
                column: def.field.clone(),
            });
        }
        if d.is_nan() && !va.is_missing() && !vb.is_missing() && !def.has_missing {
            // A missing comparison from real values on a field that cannot
            // be missing: comparator bug.
            return Err(Error::NonFiniteFeature {
                column: def.field.clone(),
            });
        }
        primaries.push(d);
    }

    // Primary columns, with missing zeroed (the indicator below records it).
    for &d in &primaries {
        out.push(if d.is_nan() { 0.0 } else { d as f32 });
    }

    // Categorical expansion: one indicator per unordered category pair.
    for (col, categories) in model.categoricals() {
        let cat_a = category_index(&a.values[*col], categories);
        let cat_b = category_index(&b.values[*col], categories);
        for i in 0..categories.len() {
            for j in (i + 1)..categories.len() {
                let hit = match (cat_a, cat_b) {
                    (Some(x), Some(y)) if x != y => (x.min(y), x.max(y)) == (i, j),
                    _ => false,
                };
                out.push(if hit { 1.0 } else { 0.0 });
            }
        }
    }

    // Interaction products over the raw primaries; NaN propagates and is
    // then zeroed like any other missing value.
    for (_, parents) in model.interactions() {
        let product: f64 = parents.iter().map(|&p| primaries[p]).product();
        out.push(if product.is_nan() { 0.0 } else { product as f32 });
    }

    // Missing indicators: 1 when the primary comparison was present.
    for &col in model.missing_indicator_columns() {
        out.push(if primaries[col].is_nan() { 0.0 } else { 1.0 });
    }

    Ok(())
}

/// Distance for one primary field; NaN stands for a missing comparison.
fn primary_distance(
    def: &crate::model::FieldDef,
    model: &DataModel,
    a: &FieldValue,
    b: &FieldValue,
) -> Result<f64> {
    if a.is_missing() || b.is_missing() {
        if let FieldKind::Custom { comparator } = &def.kind {
            // Custom comparators see the raw values and decide for
            // themselves what absence means.
            return custom_distance(def, model, comparator, a, b);
        }
        return Ok(f64::NAN);
    }

    let d = match &def.kind {
        FieldKind::String | FieldKind::ShortString => match (a, b) {
            (FieldValue::Text(x), FieldValue::Text(y)) => string_distance::distance(x, y),
            _ => f64::NAN,
        },
        FieldKind::Text => match (a, b) {
            (FieldValue::Text(x), FieldValue::Text(y)) => {
                let corpus = model
                    .corpus(&def.field)
                    .ok_or_else(|| Error::Config(format!("no corpus for '{}'", def.field)))?;
                let va = corpus.weight_vector(&tokenizer::tokens(x));
                let vb = corpus.weight_vector(&tokenizer::tokens(y));
                tfidf::cosine_distance(&va, &vb)
            }
            _ => f64::NAN,
        },
        FieldKind::Exact => match (a, b) {
            (FieldValue::Text(x), FieldValue::Text(y)) => {
                if x == y {
                    0.0
                } else {
                    1.0
                }
            }
            (FieldValue::Number(x), FieldValue::Number(y)) => {
                if x == y {
                    0.0
                } else {
                    1.0
                }
            }
            _ => 1.0,
        },
        FieldKind::Price => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => (x.ln() - y.ln()).abs().min(PRICE_CAP) / PRICE_CAP,
            _ => f64::NAN,
        },
        FieldKind::LatLong => match (a, b) {
            (FieldValue::LatLong(lat1, lon1), FieldValue::LatLong(lat2, lon2)) => {
                geo::distance((*lat1, *lon1), (*lat2, *lon2))
            }
            _ => f64::NAN,
        },
        FieldKind::Set => match (a, b) {
            (FieldValue::Set(x), FieldValue::Set(y)) => match model.corpus(&def.field) {
                Some(corpus) => corpus.weighted_jaccard_distance(x, y),
                None => jaccard_distance(x, y),
            },
            _ => f64::NAN,
        },
        FieldKind::Categorical { .. } => match (a, b) {
            (FieldValue::Text(x), FieldValue::Text(y)) => {
                if x == y {
                    0.0
                } else {
                    1.0
                }
            }
            _ => f64::NAN,
        },
        FieldKind::Custom { comparator } => {
            return custom_distance(def, model, comparator, a, b);
        }
        FieldKind::Interaction { .. } => unreachable!("interactions are not primary fields"),
    };
    Ok(d)
}

/// Run a caller-supplied comparator. `None` maps to the missing sentinel;
/// a returned NaN is a bug in the comparator and fails the batch.
fn custom_distance(
    def: &crate::model::FieldDef,
    model: &DataModel,
    comparator: &str,
    a: &FieldValue,
    b: &FieldValue,
) -> Result<f64> {
    let f = model.custom_comparator(comparator)?;
    match f(a, b) {
        Some(v) if v.is_nan() => Err(Error::NonFiniteFeature {
            column: def.field.clone(),
        }),
        Some(v) => Ok(v),
        None => Ok(f64::NAN),
    }
}

fn category_index(value: &FieldValue, categories: &[String]) -> Option<usize> {
    let text = value.as_text()?;
    categories.iter().position(|c| c == text)
}

/// Plain Jaccard distance between two string sets.
fn jaccard_distance(a: &[String], b: &[String]) -> f64 {
    let set_a: HashSet<&String> = a.iter().collect();
    let set_b: HashSet<&String> = b.iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    1.0 - intersection / union
}
