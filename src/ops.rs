//! The matching operations.
//!
//! [`Matcher`] wires the runtime pipeline (fingerprint, candidate
//! generation, parallel scoring, cluster formation) behind four
//! operations: `partition` (dedup), `join` (linkage), `threshold`
//! (probing), and, through [`Gazetteer`], `search` (top-k linkage against
//! a fixed canonical set). A matcher is immutable once built: operations
//! share the data model, weights, and predicate disjunction read-only.

use std::collections::HashSet;
use std::io::{Read, Write};

use tracing::info;

use crate::algo::clustering;
use crate::algo::logistic::LogisticModel;
use crate::blocking::{self, BlockerOptions};
use crate::cancel::{self, CancelToken};
use crate::candidates::CandidateGenerator;
use crate::error::{Error, Result};
use crate::model::{CompiledRecord, CustomComparator, DataModel};
use crate::predicates::{CompoundPredicate, Fingerprinter};
use crate::record::{Record, RecordId};
use crate::scorer::{self, ScoredPair, DEFAULT_CHUNK_SIZE};
use crate::settings::Settings;
use crate::threshold::good_threshold;
use crate::training::{self, TrainingPairs};

/// Scored pairs are kept down to this fraction of the match threshold for
/// clustering, so the dendrogram sees the sub-threshold edges it cuts on.
const CLUSTER_THRESHOLD_RATIO: f32 = 0.7;

/// A cluster of co-referent records with per-member confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub members: Vec<RecordId>,
    pub scores: Vec<f32>,
}

/// Knobs for [`Matcher::train`].
#[derive(Debug, Clone, Default)]
pub struct TrainingOptions {
    /// Fixed regularisation strength; `None` runs the cross-validated grid
    /// search.
    pub alpha: Option<f64>,
    pub blocker: BlockerOptions,
}

/// A trained matching engine.
pub struct Matcher {
    model: DataModel,
    classifier: LogisticModel,
    predicates: Vec<CompoundPredicate>,
    /// Candidate blocks above this size are dropped with a warning.
    pub max_block_size: Option<usize>,
    /// Pairs per scoring batch.
    pub chunk_size: usize,
}

impl Matcher {
    /// Train a matcher: fit the classifier on the labeled pairs, then learn
    /// the blocking disjunction against them plus a sample of unlabeled
    /// records.
    pub fn train(
        model: DataModel,
        pairs: &TrainingPairs,
        sample: &[(RecordId, Record)],
        options: &TrainingOptions,
    ) -> Result<Self> {
        let classifier = training::train(&model, pairs, options.alpha)?;

        let compile_pairs = |labelled: &[(Record, Record)]| -> Result<Vec<_>> {
            labelled
                .iter()
                .enumerate()
                .map(|(i, (a, b))| {
                    Ok((
                        model.compile(&RecordId::Text(format!("pair[{i}].0")), a)?,
                        model.compile(&RecordId::Text(format!("pair[{i}].1")), b)?,
                    ))
                })
                .collect()
        };
        let matches = compile_pairs(pairs.matches())?;
        let distincts = compile_pairs(pairs.distincts())?;
        let sample_records = compile_all(&model, sample)?;

        let predicates = blocking::learn(
            &model,
            &matches,
            &distincts,
            &sample_records,
            Some(&classifier),
            &options.blocker,
        )?;

        Ok(Self {
            model,
            classifier,
            predicates,
            max_block_size: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Rebuild a matcher from a settings artifact.
    pub fn from_settings(reader: impl Read) -> Result<Self> {
        let settings = Settings::read(reader)?;
        let model = DataModel::from_parts(settings.defs, settings.corpora)?;
        if model.feature_count() != settings.classifier.weights.len() {
            return Err(Error::Settings(format!(
                "model expects {} features, settings carry {}",
                model.feature_count(),
                settings.classifier.weights.len()
            )));
        }
        Ok(Self {
            model,
            classifier: settings.classifier,
            predicates: settings.predicates,
            max_block_size: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Persist the trained artifact.
    pub fn write_settings(&self, writer: impl Write) -> Result<()> {
        self.to_settings().write(writer)
    }

    fn to_settings(&self) -> Settings {
        let stop_words = self
            .model
            .corpora()
            .iter()
            .map(|(field, corpus)| (field.clone(), corpus.stop_words()))
            .collect();
        Settings {
            defs: self.model.defs().to_vec(),
            classifier: self.classifier.clone(),
            predicates: self.predicates.clone(),
            stop_words,
            corpora: self.model.corpora().clone(),
        }
    }

    pub fn model(&self) -> &DataModel {
        &self.model
    }

    pub fn classifier(&self) -> &LogisticModel {
        &self.classifier
    }

    pub fn predicates(&self) -> &[CompoundPredicate] {
        &self.predicates
    }

    /// Re-register a custom comparator after loading settings.
    pub fn bind_custom(&mut self, name: impl Into<String>, f: CustomComparator) -> Result<()> {
        self.model.bind_custom(name, f)
    }

    /// Partition one record set into clusters of co-referent records.
    ///
    /// Every input record lands in exactly one cluster; unmatched records
    /// come back as singletons with score 1. Empty input yields no
    /// clusters.
    pub fn partition(
        &self,
        records: &[(RecordId, Record)],
        threshold: f32,
        token: Option<&CancelToken>,
    ) -> Result<Vec<Cluster>> {
        let compiled = compile_all(&self.model, records)?;
        let cluster_threshold = threshold * CLUSTER_THRESHOLD_RATIO;

        let scored = self.score_blocked(&compiled, cluster_threshold, token)?;
        let tuples: Vec<(usize, usize, f32)> =
            scored.iter().map(|p| (p.a, p.b, p.score)).collect();
        let raw = clustering::cluster(&tuples, 1.0 - cluster_threshold as f64);

        // Map positions back to ids and retain unmatched records as
        // singletons, in input order.
        let mut clustered: HashSet<usize> = HashSet::new();
        let mut out = Vec::with_capacity(raw.len());
        for cluster in &raw {
            clustered.extend(cluster.members.iter().copied());
            out.push(Cluster {
                members: cluster
                    .members
                    .iter()
                    .map(|&p| records[p].0.clone())
                    .collect(),
                scores: cluster.scores.clone(),
            });
        }
        for (position, (id, _)) in records.iter().enumerate() {
            if !clustered.contains(&position) {
                out.push(Cluster {
                    members: vec![id.clone()],
                    scores: vec![1.0],
                });
            }
        }

        info!(
            records = records.len(),
            clusters = out.len(),
            "partition complete"
        );
        Ok(out)
    }

    /// One-to-one linkage between two record sets: the scored cross-set
    /// pairs above `threshold`, greedily matched best-first.
    pub fn join(
        &self,
        left: &[(RecordId, Record)],
        right: &[(RecordId, Record)],
        threshold: f32,
        token: Option<&CancelToken>,
    ) -> Result<Vec<((RecordId, RecordId), f32)>> {
        let boundary = left.len();
        let mut compiled = compile_all(&self.model, left)?;
        compiled.extend(compile_all(&self.model, right)?);

        let cross: Vec<(usize, usize)> = self
            .candidate_pairs(&compiled, token)?
            .into_iter()
            .filter(|&(a, b)| a < boundary && b >= boundary)
            .collect();
        let scored = scorer::score_pairs(
            &compiled,
            &cross,
            &self.model,
            &self.classifier,
            threshold,
            self.chunk_size,
            token,
        )?;

        let tuples: Vec<(usize, usize, f32)> =
            scored.iter().map(|p| (p.a, p.b, p.score)).collect();
        let matched = clustering::greedy_matching(&tuples);

        Ok(matched
            .into_iter()
            .map(|(a, b, score)| {
                (
                    (left[a].0.clone(), right[b - boundary].0.clone()),
                    score,
                )
            })
            .collect())
    }

    /// Probe for a good match threshold: score every candidate pair of the
    /// record set and pick the F-beta-maximising cut.
    pub fn threshold(
        &self,
        records: &[(RecordId, Record)],
        recall_weight: f64,
        token: Option<&CancelToken>,
    ) -> Result<f32> {
        let compiled = compile_all(&self.model, records)?;
        let scored = self.score_blocked(&compiled, 0.0, token)?;
        let scores: Vec<f32> = scored.iter().map(|p| p.score).collect();
        Ok(good_threshold(&scores, recall_weight))
    }

    /// Fingerprint, block, and generate unique candidate pairs.
    fn candidate_pairs(
        &self,
        compiled: &[CompiledRecord],
        token: Option<&CancelToken>,
    ) -> Result<Vec<(usize, usize)>> {
        cancel::check(token)?;
        let mut fingerprinter = Fingerprinter::new(self.predicates.clone());
        if fingerprinter.needs_index() {
            fingerprinter.index(compiled, &self.model);
        }
        let keyed = fingerprinter.fingerprint(compiled);
        let generator = CandidateGenerator::new(keyed, compiled.len(), self.max_block_size);
        let pairs = generator.collect_pairs(token)?;

        let n = compiled.len();
        let all_pairs = n.saturating_mul(n.saturating_sub(1)) / 2;
        if all_pairs > 0 {
            info!(
                candidates = pairs.len(),
                reduction = 1.0 - pairs.len() as f64 / all_pairs as f64,
                "blocking summary"
            );
        }
        Ok(pairs)
    }

    fn score_blocked(
        &self,
        compiled: &[CompiledRecord],
        threshold: f32,
        token: Option<&CancelToken>,
    ) -> Result<Vec<ScoredPair>> {
        let pairs = self.candidate_pairs(compiled, token)?;
        scorer::score_pairs(
            compiled,
            &pairs,
            &self.model,
            &self.classifier,
            threshold,
            self.chunk_size,
            token,
        )
    }
}

/// Top-k search against a fixed canonical record set.
pub struct Gazetteer {
    matcher: Matcher,
    canonical_ids: Vec<RecordId>,
    canonical: Vec<CompiledRecord>,
}

impl Gazetteer {
    /// Index the canonical set once; `search` then matches messy batches
    /// against it.
    pub fn new(matcher: Matcher, canonical: &[(RecordId, Record)]) -> Result<Self> {
        let compiled = compile_all(&matcher.model, canonical)?;
        Ok(Self {
            matcher,
            canonical_ids: canonical.iter().map(|(id, _)| id.clone()).collect(),
            canonical: compiled,
        })
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// For each messy record, up to `n_matches` canonical matches above
    /// `threshold`, best first. Every messy id appears in the output, with
    /// an empty match list when nothing qualifies.
    pub fn search(
        &self,
        messy: &[(RecordId, Record)],
        n_matches: usize,
        threshold: f32,
        token: Option<&CancelToken>,
    ) -> Result<Vec<(RecordId, Vec<(RecordId, f32)>)>> {
        let boundary = self.canonical.len();
        let mut compiled = self.canonical.clone();
        compiled.extend(compile_all(&self.matcher.model, messy)?);

        let cross: Vec<(usize, usize)> = self
            .matcher
            .candidate_pairs(&compiled, token)?
            .into_iter()
            .filter(|&(a, b)| a < boundary && b >= boundary)
            .collect();
        let scored = scorer::score_pairs(
            &compiled,
            &cross,
            &self.matcher.model,
            &self.matcher.classifier,
            threshold,
            self.matcher.chunk_size,
            token,
        )?;

        // Key on the messy side for the top-k selection.
        let tuples: Vec<(usize, usize, f32)> = scored
            .iter()
            .map(|p| (p.b - boundary, p.a, p.score))
            .collect();
        let ranked = clustering::gazetteer_matching(&tuples, n_matches);

        let mut by_messy: Vec<Vec<(RecordId, f32)>> = vec![Vec::new(); messy.len()];
        for (messy_position, matches) in ranked {
            by_messy[messy_position] = matches
                .into_iter()
                .map(|(canonical_position, score)| {
                    (self.canonical_ids[canonical_position].clone(), score)
                })
                .collect();
        }

        Ok(messy
            .iter()
            .map(|(id, _)| id.clone())
            .zip(by_messy)
            .collect())
    }
}

fn compile_all(model: &DataModel, records: &[(RecordId, Record)]) -> Result<Vec<CompiledRecord>> {
    records
        .iter()
        .map(|(id, record)| model.compile(id, record))
        .collect()
}
