//! Field definitions and the immutable data model.
//!
//! The data model is built once from field definitions and fixes the feature
//! column layout for the lifetime of the engine: primary kernel columns
//! first, then categorical expansion indicators, then interaction products,
//! then missing indicators. The layout is deterministic, so a model
//! reconstructed from a settings artifact scores identically.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::algo::{normalize, tfidf, tokenizer};
use crate::error::{Error, Result};
use crate::record::{FieldValue, Record, RecordId};

/// Distance kernel selector, one variant per field type.
///
/// A flat tagged sum rather than trait objects: the feature builder matches
/// on it directly and the cold branches stay out of the comparison loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Affine-gap distance over characters.
    String,
    /// Affine-gap as well, but no TF-IDF index is derived for blocking.
    ShortString,
    /// One minus TF-IDF cosine over the token bag. Requires a corpus.
    Text,
    /// 0 if equal, 1 otherwise.
    Exact,
    /// `|ln a − ln b|` for positive numbers, capped.
    Price,
    /// Great-circle distance.
    LatLong,
    /// One minus Jaccard; IDF-weighted when a corpus is given.
    Set,
    /// Equality over a closed set of categories, expanded into one
    /// indicator column per unordered category pair.
    Categorical { categories: Vec<String> },
    /// Caller-supplied comparator, registered by name.
    Custom { comparator: String },
    /// Pointwise product of other fields' primary columns.
    Interaction { fields: Vec<String> },
}

impl FieldKind {
    pub fn is_interaction(&self) -> bool {
        matches!(self, FieldKind::Interaction { .. })
    }
}

/// One field of the data model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub field: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub has_missing: bool,
    /// Optional corpus of example values for TF-IDF statistics. Consumed at
    /// model construction; the derived frequency tables are what persist.
    #[serde(skip)]
    pub corpus: Option<Vec<String>>,
}

impl FieldDef {
    pub fn new(field: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            field: field.into(),
            kind,
            has_missing: false,
            corpus: None,
        }
    }

    pub fn with_missing(mut self) -> Self {
        self.has_missing = true;
        self
    }

    pub fn with_corpus(mut self, corpus: Vec<String>) -> Self {
        self.corpus = Some(corpus);
        self
    }
}

/// Caller-supplied pure comparator: `R × R → [0,1]`, or `None` for missing.
pub type CustomComparator = Arc<dyn Fn(&FieldValue, &FieldValue) -> Option<f64> + Send + Sync>;

/// A record compiled against the model: one value slot per primary field,
/// already normalised. Built once at ingestion so the comparison loops
/// never hash field names.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRecord {
    pub values: Vec<FieldValue>,
}

/// Immutable catalogue of fields, feature columns, and kernel bindings.
pub struct DataModel {
    defs: Vec<FieldDef>,
    /// Indices into `defs` for non-interaction fields, in declaration order.
    /// Primary column `p` holds the distance for `defs[primaries[p]]`.
    primaries: Vec<usize>,
    /// `(def index, parent primary columns)` per interaction field.
    interactions: Vec<(usize, Vec<usize>)>,
    /// `(primary column, categories)` per categorical field.
    categoricals: Vec<(usize, Vec<String>)>,
    /// Primary columns that carry a trailing missing-indicator column.
    missing_indicator_columns: Vec<usize>,
    column_names: Vec<String>,
    corpora: HashMap<String, tfidf::Corpus>,
    custom: HashMap<String, CustomComparator>,
}

impl fmt::Debug for DataModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataModel")
            .field("defs", &self.defs)
            .field("columns", &self.column_names)
            .finish()
    }
}

impl DataModel {
    pub fn new(defs: Vec<FieldDef>) -> Result<Self> {
        let mut seen = HashSet::new();
        for def in &defs {
            if !seen.insert(def.field.as_str()) {
                return Err(Error::Config(format!("duplicate field '{}'", def.field)));
            }
        }

        let primaries: Vec<usize> = defs
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.kind.is_interaction())
            .map(|(i, _)| i)
            .collect();
        if primaries.is_empty() {
            return Err(Error::Config("no comparison fields defined".into()));
        }
        let primary_column: HashMap<&str, usize> = primaries
            .iter()
            .enumerate()
            .map(|(col, &i)| (defs[i].field.as_str(), col))
            .collect();

        let mut interactions = Vec::new();
        let mut categoricals = Vec::new();
        let mut corpora = HashMap::new();

        for (i, def) in defs.iter().enumerate() {
            match &def.kind {
                FieldKind::Interaction { fields } => {
                    if fields.len() < 2 {
                        return Err(Error::Config(format!(
                            "interaction '{}' needs at least two fields",
                            def.field
                        )));
                    }
                    let mut parents = Vec::with_capacity(fields.len());
                    for parent in fields {
                        let col = primary_column.get(parent.as_str()).ok_or_else(|| {
                            Error::Config(format!(
                                "interaction '{}' refers to undefined field '{parent}'",
                                def.field
                            ))
                        })?;
                        parents.push(*col);
                    }
                    interactions.push((i, parents));
                }
                FieldKind::Categorical { categories } => {
                    let normalised: Vec<String> = categories
                        .iter()
                        .filter_map(|c| normalize::normalize(c))
                        .collect();
                    if normalised.len() < 2 {
                        return Err(Error::Config(format!(
                            "categorical '{}' needs at least two categories",
                            def.field
                        )));
                    }
                    let distinct: HashSet<&String> = normalised.iter().collect();
                    if distinct.len() != normalised.len() {
                        return Err(Error::Config(format!(
                            "categorical '{}' has duplicate categories",
                            def.field
                        )));
                    }
                    categoricals.push((primary_column[def.field.as_str()], normalised));
                }
                FieldKind::Text => {
                    let docs = def.corpus.as_ref().ok_or_else(|| {
                        Error::Config(format!("text field '{}' requires a corpus", def.field))
                    })?;
                    corpora.insert(def.field.clone(), build_corpus(docs));
                }
                FieldKind::Set => {
                    if let Some(docs) = &def.corpus {
                        corpora.insert(def.field.clone(), build_corpus(docs));
                    }
                }
                FieldKind::Custom { comparator } => {
                    if comparator.is_empty() {
                        return Err(Error::Config(format!(
                            "custom field '{}' has no comparator name",
                            def.field
                        )));
                    }
                }
                _ => {}
            }
        }

        // Rebuild categoricals in primary-column order; interactions stay in
        // declaration order. Both orders are part of the layout contract.
        categoricals.sort_by_key(|&(col, _)| col);

        let missing_indicator_columns: Vec<usize> = primaries
            .iter()
            .enumerate()
            .filter(|(_, &i)| defs[i].has_missing)
            .map(|(col, _)| col)
            .collect();

        let mut column_names: Vec<String> =
            primaries.iter().map(|&i| defs[i].field.clone()).collect();
        for (col, categories) in &categoricals {
            let field = column_names[*col].clone();
            for i in 0..categories.len() {
                for j in (i + 1)..categories.len() {
                    column_names.push(format!("{field}:{}/{}", categories[i], categories[j]));
                }
            }
        }
        for (i, _) in &interactions {
            column_names.push(defs[*i].field.clone());
        }
        for &col in &missing_indicator_columns {
            let field = primaries[col];
            column_names.push(format!("{}:missing", defs[field].field));
        }

        Ok(Self {
            defs,
            primaries,
            interactions,
            categoricals,
            missing_indicator_columns,
            column_names,
            corpora,
            custom: HashMap::new(),
        })
    }

    /// Register the function behind a `Custom` field's comparator name.
    pub fn bind_custom(&mut self, name: impl Into<String>, f: CustomComparator) -> Result<()> {
        let name = name.into();
        let declared = self.defs.iter().any(
            |d| matches!(&d.kind, FieldKind::Custom { comparator } if *comparator == name),
        );
        if !declared {
            return Err(Error::Config(format!(
                "no field declares custom comparator '{name}'"
            )));
        }
        self.custom.insert(name, f);
        Ok(())
    }

    pub(crate) fn custom_comparator(&self, name: &str) -> Result<&CustomComparator> {
        self.custom.get(name).ok_or_else(|| {
            Error::Config(format!("custom comparator '{name}' is not bound"))
        })
    }

    pub fn defs(&self) -> &[FieldDef] {
        &self.defs
    }

    /// Non-interaction field definitions, in primary-column order.
    pub fn primary_defs(&self) -> impl Iterator<Item = &FieldDef> {
        self.primaries.iter().map(|&i| &self.defs[i])
    }

    pub(crate) fn interactions(&self) -> &[(usize, Vec<usize>)] {
        &self.interactions
    }

    pub(crate) fn categoricals(&self) -> &[(usize, Vec<String>)] {
        &self.categoricals
    }

    pub(crate) fn missing_indicator_columns(&self) -> &[usize] {
        &self.missing_indicator_columns
    }

    pub fn corpus(&self, field: &str) -> Option<&tfidf::Corpus> {
        self.corpora.get(field)
    }

    pub(crate) fn corpora(&self) -> &HashMap<String, tfidf::Corpus> {
        &self.corpora
    }

    /// Rebuild a model from persisted parts (settings artifact).
    pub(crate) fn from_parts(
        defs: Vec<FieldDef>,
        corpora: HashMap<String, tfidf::Corpus>,
    ) -> Result<Self> {
        // Text fields fail construction without a corpus, so thread the
        // persisted tables through as placeholders first.
        let defs_with_corpus: Vec<FieldDef> = defs
            .into_iter()
            .map(|mut d| {
                if matches!(d.kind, FieldKind::Text) {
                    d.corpus = Some(Vec::new());
                }
                d
            })
            .collect();
        let mut model = Self::new(defs_with_corpus)?;
        model.corpora = corpora;
        for def in &mut model.defs {
            def.corpus = None;
        }
        Ok(model)
    }

    pub fn field_count(&self) -> usize {
        self.defs.len()
    }

    pub fn primary_count(&self) -> usize {
        self.primaries.len()
    }

    /// Total feature vector width: primaries, categorical expansions,
    /// interactions, missing indicators. Identical across training and
    /// inference by construction.
    pub fn feature_count(&self) -> usize {
        self.column_names.len()
    }

    /// Ordered feature column names.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Validate a record against the model and normalise it into a fixed
    /// slot layout. Fatal per record: a declared field that is absent
    /// without `has_missing`, or a value of the wrong shape, aborts the
    /// call.
    pub fn compile(&self, id: &RecordId, record: &Record) -> Result<CompiledRecord> {
        let mut values = Vec::with_capacity(self.primaries.len());
        for &i in &self.primaries {
            let def = &self.defs[i];
            let raw = record.get(&def.field).unwrap_or(&FieldValue::Missing);
            let value = self.compile_value(def, raw).map_err(|reason| Error::Ingest {
                id: id.to_string(),
                reason,
            })?;
            if value.is_missing() && !def.has_missing {
                return Err(Error::Ingest {
                    id: id.to_string(),
                    reason: format!("field '{}' is missing but not declared as such", def.field),
                });
            }
            values.push(value);
        }
        Ok(CompiledRecord { values })
    }

    fn compile_value(
        &self,
        def: &FieldDef,
        raw: &FieldValue,
    ) -> std::result::Result<FieldValue, String> {
        if raw.is_missing() {
            return Ok(FieldValue::Missing);
        }
        match &def.kind {
            FieldKind::String | FieldKind::ShortString | FieldKind::Text => match raw {
                FieldValue::Text(s) => Ok(match normalize::normalize(s) {
                    Some(clean) => FieldValue::Text(clean),
                    None => FieldValue::Missing,
                }),
                other => Err(format!(
                    "field '{}' expects a string, got {other:?}",
                    def.field
                )),
            },
            FieldKind::Exact => match raw {
                FieldValue::Text(s) => Ok(match normalize::normalize(s) {
                    Some(clean) => FieldValue::Text(clean),
                    None => FieldValue::Missing,
                }),
                FieldValue::Number(n) => Ok(FieldValue::Number(*n)),
                other => Err(format!(
                    "field '{}' expects a string or number, got {other:?}",
                    def.field
                )),
            },
            FieldKind::Price => match raw {
                FieldValue::Number(n) if *n > 0.0 => Ok(FieldValue::Number(*n)),
                FieldValue::Number(n) => Err(format!(
                    "price field '{}' must be positive, got {n}",
                    def.field
                )),
                other => Err(format!(
                    "field '{}' expects a number, got {other:?}",
                    def.field
                )),
            },
            FieldKind::LatLong => match raw {
                FieldValue::LatLong(lat, lon) => Ok(FieldValue::LatLong(*lat, *lon)),
                other => Err(format!(
                    "field '{}' expects (lat, lon), got {other:?}",
                    def.field
                )),
            },
            FieldKind::Set => match raw {
                FieldValue::Set(items) => {
                    let clean: Vec<String> = items
                        .iter()
                        .filter_map(|s| normalize::normalize(s))
                        .collect();
                    if clean.is_empty() {
                        Ok(FieldValue::Missing)
                    } else {
                        Ok(FieldValue::Set(clean))
                    }
                }
                other => Err(format!(
                    "field '{}' expects a set of strings, got {other:?}",
                    def.field
                )),
            },
            FieldKind::Categorical { .. } => match raw {
                FieldValue::Text(s) => {
                    let clean = normalize::normalize(s);
                    let Some(clean) = clean else {
                        return Ok(FieldValue::Missing);
                    };
                    let known = self
                        .categoricals
                        .iter()
                        .find(|(col, _)| self.defs[self.primaries[*col]].field == def.field)
                        .map(|(_, cats)| cats.iter().any(|c| *c == clean))
                        .unwrap_or(false);
                    if known {
                        Ok(FieldValue::Text(clean))
                    } else {
                        Err(format!(
                            "field '{}' has unknown category '{clean}'",
                            def.field
                        ))
                    }
                }
                other => Err(format!(
                    "field '{}' expects a category string, got {other:?}",
                    def.field
                )),
            },
            FieldKind::Custom { .. } => Ok(raw.clone()),
            FieldKind::Interaction { .. } => unreachable!("interactions have no primary slot"),
        }
    }
}

/// Build a corpus from configuration documents: tokenised non-empty values,
/// with empty or unnormalisable entries counted as empty documents so the
/// document count stays honest.
fn build_corpus(docs: &[String]) -> tfidf::Corpus {
    let mut corpus = tfidf::Corpus::new();
    for doc in docs {
        match normalize::normalize(doc) {
            Some(clean) => corpus.add_document(&tokenizer::tokens(&clean)),
            None => corpus.add_missing(),
        }
    }
    corpus
}
