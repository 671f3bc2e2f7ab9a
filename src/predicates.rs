//! Blocking predicates and the fingerprinter.
//!
//! A predicate is a pure function from one record to a set of block keys.
//! Compound predicates emit the cross product of their components' keys.
//! Indexed predicates (TF-IDF canopies) need a single-threaded scan over
//! the record set before use; everything else is stateless.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::algo::minhash::{MinHasher, DEFAULT_BANDS};
use crate::algo::{geo, tfidf, tokenizer};
use crate::model::{CompiledRecord, DataModel, FieldKind};
use crate::record::FieldValue;

/// Reserved delimiter between compound-key components. Normalised field
/// text never contains control characters.
const COMPOUND_DELIMITER: char = '\u{1f}';

/// Degrees per side of a geographic blocking cell (roughly 11 km of
/// latitude).
const GRID_CELL_DEGREES: f64 = 0.1;

/// TF-IDF cosine thresholds at which canopy predicates are generated.
pub const CANOPY_THRESHOLDS: [f64; 4] = [0.2, 0.4, 0.6, 0.8];

/// The simple predicate family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PredicateKind {
    /// The whole normalised value as one key.
    WholeField,
    /// One key per distinct token.
    TokenField,
    /// The first `k` characters.
    FirstChars(usize),
    /// The first token.
    FirstToken,
    /// One key per distinct integer in the value.
    CommonIntegers,
    /// Keys for each integer and its neighbours, linking off-by-one values.
    NearIntegers,
    /// One key per distinct character n-gram.
    Ngrams(usize),
    /// Initials of the tokens, sorted.
    SortedAcronym,
    /// Canopy membership at a cosine threshold. Requires indexing.
    TfidfCanopy(f64),
    /// LSH bands over a minhash signature of the tokens.
    MinhashBands,
    /// Geographic grid cell.
    GeoGrid,
}

/// A simple predicate bound to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplePredicate {
    pub field: String,
    /// Primary column of the field; fixes the value slot independent of
    /// field-name hashing.
    pub column: usize,
    pub kind: PredicateKind,
}

impl SimplePredicate {
    pub fn new(field: impl Into<String>, column: usize, kind: PredicateKind) -> Self {
        Self {
            field: field.into(),
            column,
            kind,
        }
    }

    /// Indexed predicates need [`Fingerprinter::index`] before use.
    pub fn is_indexed(&self) -> bool {
        matches!(self.kind, PredicateKind::TfidfCanopy(_))
    }

    fn keys(&self, position: usize, record: &CompiledRecord, context: &PredicateContext) -> Vec<String> {
        let value = &record.values[self.column];
        if value.is_missing() {
            return Vec::new();
        }
        match &self.kind {
            PredicateKind::WholeField => match value {
                FieldValue::Text(s) => vec![s.clone()],
                FieldValue::Number(n) => vec![n.to_string()],
                FieldValue::Set(items) => {
                    let mut sorted = items.clone();
                    sorted.sort();
                    vec![sorted.join(" ")]
                }
                _ => Vec::new(),
            },
            PredicateKind::TokenField => match value {
                FieldValue::Text(s) => distinct(tokenizer::tokens(s)),
                FieldValue::Set(items) => distinct(items.clone()),
                _ => Vec::new(),
            },
            PredicateKind::FirstChars(k) => text_key(value, |s| s.chars().take(*k).collect()),
            PredicateKind::FirstToken => match value.as_text() {
                Some(s) => tokenizer::tokens(s).into_iter().take(1).collect(),
                None => Vec::new(),
            },
            PredicateKind::CommonIntegers => match value.as_text() {
                Some(s) => distinct(tokenizer::integers(s)),
                None => Vec::new(),
            },
            PredicateKind::NearIntegers => match value.as_text() {
                Some(s) => {
                    let mut keys = Vec::new();
                    for raw in tokenizer::integers(s) {
                        if let Ok(n) = raw.parse::<i64>() {
                            keys.push((n.saturating_sub(1)).to_string());
                            keys.push(n.to_string());
                            keys.push((n.saturating_add(1)).to_string());
                        }
                    }
                    distinct(keys)
                }
                None => Vec::new(),
            },
            PredicateKind::Ngrams(n) => match value.as_text() {
                Some(s) => distinct(tokenizer::shingles(s, *n)),
                None => Vec::new(),
            },
            PredicateKind::SortedAcronym => match value.as_text() {
                Some(s) => {
                    let mut initials: Vec<char> = tokenizer::tokens(s)
                        .iter()
                        .filter_map(|t| t.chars().next())
                        .collect();
                    if initials.is_empty() {
                        return Vec::new();
                    }
                    initials.sort_unstable();
                    vec![initials.into_iter().collect()]
                }
                None => Vec::new(),
            },
            PredicateKind::TfidfCanopy(threshold) => {
                match context.canopy(self.column, *threshold) {
                    Some(assignment) if position < assignment.len() => {
                        vec![assignment[position].to_string()]
                    }
                    _ => Vec::new(),
                }
            }
            PredicateKind::MinhashBands => {
                let tokens = match value {
                    FieldValue::Text(s) => tokenizer::tokens(s),
                    FieldValue::Set(items) => items.clone(),
                    _ => return Vec::new(),
                };
                context.minhasher.band_keys(&tokens, DEFAULT_BANDS)
            }
            PredicateKind::GeoGrid => match value {
                FieldValue::LatLong(lat, lon) => {
                    vec![geo::grid_cell(*lat, *lon, GRID_CELL_DEGREES)]
                }
                _ => Vec::new(),
            },
        }
    }
}

fn text_key(value: &FieldValue, f: impl Fn(&str) -> String) -> Vec<String> {
    match value.as_text() {
        Some(s) if !s.is_empty() => vec![f(s)],
        _ => Vec::new(),
    }
}

fn distinct(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys.dedup();
    keys
}

/// A conjunction of 1..K simple predicates. A record's compound keys are
/// the cross product of its components' keys; any component with no keys
/// kills the product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundPredicate {
    pub simples: Vec<SimplePredicate>,
}

impl CompoundPredicate {
    pub fn simple(predicate: SimplePredicate) -> Self {
        Self {
            simples: vec![predicate],
        }
    }

    pub fn conjunction(a: SimplePredicate, b: SimplePredicate) -> Self {
        Self { simples: vec![a, b] }
    }

    pub fn is_simple(&self) -> bool {
        self.simples.len() == 1
    }

    pub fn is_indexed(&self) -> bool {
        self.simples.iter().any(SimplePredicate::is_indexed)
    }

    /// Lowest primary column among the components, for tie-breaking.
    pub fn min_column(&self) -> usize {
        self.simples.iter().map(|s| s.column).min().unwrap_or(0)
    }

    fn keys(&self, position: usize, record: &CompiledRecord, context: &PredicateContext) -> Vec<String> {
        let mut keys: Vec<String> = vec![String::new()];
        for (i, simple) in self.simples.iter().enumerate() {
            let component = simple.keys(position, record, context);
            if component.is_empty() {
                return Vec::new();
            }
            let mut next = Vec::with_capacity(keys.len() * component.len());
            for prefix in &keys {
                for part in &component {
                    if i == 0 {
                        next.push(part.clone());
                    } else {
                        next.push(format!("{prefix}{COMPOUND_DELIMITER}{part}"));
                    }
                }
            }
            keys = next;
        }
        keys
    }
}

/// Shared per-run predicate state: the minhash family and any seeded
/// canopy assignments. Populated single-threaded, read-only afterwards.
struct PredicateContext {
    minhasher: MinHasher,
    /// `(column, threshold in percent) -> record position -> canopy centre`.
    canopies: HashMap<(usize, u32), Vec<usize>>,
}

impl PredicateContext {
    fn new() -> Self {
        Self {
            minhasher: MinHasher::with_default_perm(),
            canopies: HashMap::new(),
        }
    }

    fn canopy(&self, column: usize, threshold: f64) -> Option<&Vec<usize>> {
        self.canopies.get(&(column, threshold_key(threshold)))
    }
}

fn threshold_key(threshold: f64) -> u32 {
    (threshold * 100.0).round() as u32
}

/// Applies a predicate disjunction to a record stream, emitting
/// `(block_key, record position)` pairs. Block keys carry the predicate's
/// index in the disjunction, so different predicates never collide.
pub struct Fingerprinter {
    predicates: Vec<CompoundPredicate>,
    context: PredicateContext,
}

impl Fingerprinter {
    pub fn new(predicates: Vec<CompoundPredicate>) -> Self {
        Self {
            predicates,
            context: PredicateContext::new(),
        }
    }

    pub fn predicates(&self) -> &[CompoundPredicate] {
        &self.predicates
    }

    /// Whether any predicate needs [`index`](Self::index) before
    /// fingerprinting.
    pub fn needs_index(&self) -> bool {
        self.predicates.iter().any(CompoundPredicate::is_indexed)
    }

    /// Seed the TF-IDF canopy tables over the records that will be
    /// fingerprinted. Record positions in later calls must line up with
    /// this slice.
    pub fn index(&mut self, records: &[CompiledRecord], model: &DataModel) {
        let mut canopy_specs: Vec<(usize, f64)> = Vec::new();
        for predicate in &self.predicates {
            for simple in &predicate.simples {
                if let PredicateKind::TfidfCanopy(threshold) = simple.kind {
                    let spec = (simple.column, threshold);
                    if !canopy_specs.contains(&spec) {
                        canopy_specs.push(spec);
                    }
                }
            }
        }
        if canopy_specs.is_empty() {
            return;
        }

        // One corpus and one set of weight vectors per column, shared by
        // every threshold on that column.
        let mut columns: Vec<usize> = canopy_specs.iter().map(|&(c, _)| c).collect();
        columns.sort_unstable();
        columns.dedup();

        let mut vectors_by_column: HashMap<usize, Vec<tfidf::SparseVector>> = HashMap::new();
        for &column in &columns {
            // Prefer the configured corpus when the model has one for this
            // field; otherwise derive frequencies from the records at hand.
            let field = model
                .primary_defs()
                .nth(column)
                .map(|d| d.field.clone())
                .unwrap_or_default();
            let corpus = match model.corpus(&field) {
                Some(c) => c.clone(),
                None => {
                    let mut c = tfidf::Corpus::new();
                    for record in records {
                        match &record.values[column] {
                            FieldValue::Text(s) => c.add_document(&tokenizer::tokens(s)),
                            _ => c.add_missing(),
                        }
                    }
                    c
                }
            };
            let vectors: Vec<tfidf::SparseVector> = records
                .iter()
                .map(|r| match &r.values[column] {
                    FieldValue::Text(s) => corpus.weight_vector(&tokenizer::tokens(s)),
                    _ => tfidf::SparseVector::new(),
                })
                .collect();
            vectors_by_column.insert(column, vectors);
        }

        for (column, threshold) in canopy_specs {
            let assignment = tfidf::canopies(&vectors_by_column[&column], threshold);
            self.context
                .canopies
                .insert((column, threshold_key(threshold)), assignment);
        }
    }

    /// Release the seeded indices.
    pub fn reset_indices(&mut self) {
        self.context.canopies.clear();
    }

    /// Keys of a single predicate in the disjunction, without the
    /// disambiguating prefix. The blocker learner scores candidate
    /// predicates individually through this.
    pub fn predicate_keys(
        &self,
        predicate: usize,
        position: usize,
        record: &CompiledRecord,
    ) -> Vec<String> {
        self.predicates[predicate].keys(position, record, &self.context)
    }

    /// Block keys for one record at a given position.
    pub fn keys_for(&self, position: usize, record: &CompiledRecord) -> Vec<String> {
        let mut out = Vec::new();
        for (p, predicate) in self.predicates.iter().enumerate() {
            for key in predicate.keys(position, record, &self.context) {
                out.push(format!("{p}:{key}"));
            }
        }
        out
    }

    /// Apply the whole disjunction to a record slice: the multiset union of
    /// per-predicate outputs. Deterministic and repeatable for the same
    /// input.
    pub fn fingerprint(&self, records: &[CompiledRecord]) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        for (position, record) in records.iter().enumerate() {
            for key in self.keys_for(position, record) {
                out.push((key, position));
            }
        }
        out
    }
}

/// The simple-predicate pool for one field, by kind.
pub fn field_predicates(field: &str, column: usize, kind: &FieldKind) -> Vec<SimplePredicate> {
    let p = |k: PredicateKind| SimplePredicate::new(field, column, k);
    match kind {
        FieldKind::String => vec![
            p(PredicateKind::WholeField),
            p(PredicateKind::TokenField),
            p(PredicateKind::FirstChars(3)),
            p(PredicateKind::FirstChars(5)),
            p(PredicateKind::FirstChars(7)),
            p(PredicateKind::FirstToken),
            p(PredicateKind::CommonIntegers),
            p(PredicateKind::NearIntegers),
            p(PredicateKind::Ngrams(4)),
            p(PredicateKind::Ngrams(6)),
            p(PredicateKind::SortedAcronym),
            p(PredicateKind::TfidfCanopy(CANOPY_THRESHOLDS[0])),
            p(PredicateKind::TfidfCanopy(CANOPY_THRESHOLDS[1])),
            p(PredicateKind::TfidfCanopy(CANOPY_THRESHOLDS[2])),
            p(PredicateKind::TfidfCanopy(CANOPY_THRESHOLDS[3])),
            p(PredicateKind::MinhashBands),
        ],
        // Short strings never get a TF-IDF index.
        FieldKind::ShortString => vec![
            p(PredicateKind::WholeField),
            p(PredicateKind::TokenField),
            p(PredicateKind::FirstChars(3)),
            p(PredicateKind::FirstChars(5)),
            p(PredicateKind::FirstChars(7)),
            p(PredicateKind::FirstToken),
            p(PredicateKind::CommonIntegers),
            p(PredicateKind::NearIntegers),
            p(PredicateKind::Ngrams(4)),
            p(PredicateKind::Ngrams(6)),
            p(PredicateKind::SortedAcronym),
            p(PredicateKind::MinhashBands),
        ],
        FieldKind::Text => vec![
            p(PredicateKind::TokenField),
            p(PredicateKind::CommonIntegers),
            p(PredicateKind::TfidfCanopy(CANOPY_THRESHOLDS[0])),
            p(PredicateKind::TfidfCanopy(CANOPY_THRESHOLDS[1])),
            p(PredicateKind::TfidfCanopy(CANOPY_THRESHOLDS[2])),
            p(PredicateKind::TfidfCanopy(CANOPY_THRESHOLDS[3])),
            p(PredicateKind::MinhashBands),
        ],
        FieldKind::Exact | FieldKind::Categorical { .. } | FieldKind::Price => {
            vec![p(PredicateKind::WholeField)]
        }
        FieldKind::LatLong => vec![p(PredicateKind::GeoGrid)],
        FieldKind::Set => vec![
            p(PredicateKind::WholeField),
            p(PredicateKind::TokenField),
            p(PredicateKind::MinhashBands),
        ],
        FieldKind::Custom { .. } | FieldKind::Interaction { .. } => Vec::new(),
    }
}
