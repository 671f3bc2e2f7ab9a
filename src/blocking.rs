//! Blocker learning: greedy weighted set cover over labeled match pairs.
//!
//! The universe is the set of labeled match pairs. Each candidate predicate
//! covers the match pairs whose two records share a block key under it, and
//! costs the distinct pairs it would put together, estimated on the known
//! distinct pairs plus the comparisons it generates over a sample of
//! unlabeled records. The learner repeatedly takes the candidate with the
//! lowest cost per newly covered match until the recall target is met.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::algo::logistic::LogisticModel;
use crate::algo::sampling;
use crate::error::{Error, Result};
use crate::features;
use crate::model::{CompiledRecord, DataModel};
use crate::predicates::{field_predicates, CompoundPredicate, Fingerprinter, SimplePredicate};

/// Knobs for blocker training.
#[derive(Debug, Clone)]
pub struct BlockerOptions {
    /// Fraction of labeled match pairs the disjunction must cover.
    pub recall_target: f64,
    /// Candidate predicates producing a sample block larger than this are
    /// discarded outright.
    pub max_block_size: usize,
    /// Random pairs drawn from the sample for semi-supervised distinct
    /// augmentation.
    pub sample_pairs: usize,
    /// Seed for the deterministic sampling.
    pub seed: u64,
}

impl Default for BlockerOptions {
    fn default() -> Self {
        Self {
            recall_target: 0.9,
            max_block_size: 1000,
            sample_pairs: 3000,
            seed: 0x5eed,
        }
    }
}

/// Classifier scores below this mark a sampled pair as confidently
/// distinct.
const CONFIDENT_DISTINCT: f32 = 0.2;

/// Learn an ordered predicate disjunction covering the match pairs.
///
/// Falling short of the recall target is recoverable: the best-effort
/// disjunction is returned with a warning.
pub fn learn(
    model: &DataModel,
    matches: &[(CompiledRecord, CompiledRecord)],
    distincts: &[(CompiledRecord, CompiledRecord)],
    sample: &[CompiledRecord],
    classifier: Option<&LogisticModel>,
    options: &BlockerOptions,
) -> Result<Vec<CompoundPredicate>> {
    if matches.is_empty() {
        return Err(Error::Training(
            "cannot learn blocking without match pairs".into(),
        ));
    }

    // One flat record list so canopy indexing sees everything at once.
    let mut records: Vec<CompiledRecord> = Vec::new();
    let mut match_positions = Vec::with_capacity(matches.len());
    for (a, b) in matches {
        match_positions.push((records.len(), records.len() + 1));
        records.push(a.clone());
        records.push(b.clone());
    }
    let mut distinct_positions = Vec::with_capacity(distincts.len());
    for (a, b) in distincts {
        distinct_positions.push((records.len(), records.len() + 1));
        records.push(a.clone());
        records.push(b.clone());
    }
    let sample_start = records.len();
    records.extend_from_slice(sample);

    // Semi-supervised augmentation: sampled pairs the trained classifier
    // is confident about join the known-distinct pool.
    if let Some(classifier) = classifier {
        let drawn = sampling::random_pairs(sample.len(), options.sample_pairs, options.seed);
        let mut added = 0usize;
        for (i, j) in drawn {
            let a = &records[sample_start + i];
            let b = &records[sample_start + j];
            let vector = features::pair_vector(a, b, model)?;
            if classifier.score(&vector) < CONFIDENT_DISTINCT {
                distinct_positions.push((sample_start + i, sample_start + j));
                added += 1;
            }
        }
        info!(pairs = added, "semi-supervised distinct pairs added");
    }

    let pool = predicate_pool(model);
    let mut fingerprinter = Fingerprinter::new(pool.clone());
    fingerprinter.index(&records, model);

    // Evaluate every candidate: match coverage, distinct-pair cost, and
    // comparison volume over the sample.
    let mut candidates: Vec<Candidate> = Vec::new();
    'pool: for (p, predicate) in pool.iter().enumerate() {
        let keys: Vec<HashSet<String>> = (0..records.len())
            .map(|position| {
                fingerprinter
                    .predicate_keys(p, position, &records[position])
                    .into_iter()
                    .collect()
            })
            .collect();

        let mut blocks: HashMap<&String, usize> = HashMap::new();
        for position in sample_start..records.len() {
            for key in &keys[position] {
                let count = blocks.entry(key).or_insert(0);
                *count += 1;
                if *count > options.max_block_size {
                    continue 'pool;
                }
            }
        }
        let sample_comparisons: usize = blocks
            .values()
            .map(|&c| c * (c - 1) / 2)
            .sum();

        let covered: HashSet<usize> = match_positions
            .iter()
            .enumerate()
            .filter(|(_, &(a, b))| !keys[a].is_disjoint(&keys[b]))
            .map(|(i, _)| i)
            .collect();
        if covered.is_empty() {
            continue;
        }

        let distinct_covered = distinct_positions
            .iter()
            .filter(|&&(a, b)| !keys[a].is_disjoint(&keys[b]))
            .count();

        candidates.push(Candidate {
            pool_index: p,
            covered,
            cost: (distinct_covered + sample_comparisons) as f64,
        });
    }

    // Greedy cover until few enough matches remain uncovered.
    let mut uncovered: HashSet<usize> = (0..matches.len()).collect();
    let allowed_uncovered =
        ((1.0 - options.recall_target) * matches.len() as f64).floor() as usize;
    let mut chosen: Vec<CompoundPredicate> = Vec::new();
    let mut used = vec![false; candidates.len()];

    while uncovered.len() > allowed_uncovered {
        let mut best: Option<(usize, f64, usize)> = None; // (candidate, ratio, new)
        for (c, candidate) in candidates.iter().enumerate() {
            if used[c] {
                continue;
            }
            let new = candidate.covered.intersection(&uncovered).count();
            if new == 0 {
                continue;
            }
            let ratio = candidate.cost / new as f64;
            let better = match best {
                None => true,
                Some((current, current_ratio, _)) => {
                    let lhs = rank(ratio, &pool[candidate.pool_index], candidate.pool_index);
                    let rhs = rank(
                        current_ratio,
                        &pool[candidates[current].pool_index],
                        candidates[current].pool_index,
                    );
                    lhs < rhs
                }
            };
            if better {
                best = Some((c, ratio, new));
            }
        }

        let Some((c, _, new)) = best else {
            break; // no candidate reduces the uncovered set further
        };
        used[c] = true;
        for i in &candidates[c].covered {
            uncovered.remove(i);
        }
        info!(
            predicate = ?pool[candidates[c].pool_index],
            newly_covered = new,
            uncovered = uncovered.len(),
            "selected blocking predicate"
        );
        chosen.push(pool[candidates[c].pool_index].clone());
    }

    if uncovered.len() > allowed_uncovered {
        warn!(
            uncovered = uncovered.len(),
            target = allowed_uncovered,
            "recall target not met; returning best-effort disjunction"
        );
    }

    Ok(chosen)
}

struct Candidate {
    pool_index: usize,
    covered: HashSet<usize>,
    cost: f64,
}

/// Greedy selection order: cheapest per new match, then simple before
/// compound, then lower field columns, then pool position.
fn rank(
    ratio: f64,
    predicate: &CompoundPredicate,
    pool_index: usize,
) -> (ordered_float::OrderedFloat<f64>, usize, usize, usize) {
    (
        ordered_float::OrderedFloat(ratio),
        predicate.simples.len(),
        predicate.min_column(),
        pool_index,
    )
}

/// Candidate predicates for a model: every simple predicate plus every
/// two-term conjunction across them.
pub fn predicate_pool(model: &DataModel) -> Vec<CompoundPredicate> {
    let simples: Vec<SimplePredicate> = model
        .primary_defs()
        .enumerate()
        .flat_map(|(column, def)| field_predicates(&def.field, column, &def.kind))
        .collect();

    let mut pool: Vec<CompoundPredicate> = simples
        .iter()
        .cloned()
        .map(CompoundPredicate::simple)
        .collect();
    for i in 0..simples.len() {
        for j in (i + 1)..simples.len() {
            pool.push(CompoundPredicate::conjunction(
                simples[i].clone(),
                simples[j].clone(),
            ));
        }
    }
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataModel, FieldDef, FieldKind};
    use crate::record::{record, Record, RecordId};

    fn name_model() -> DataModel {
        DataModel::new(vec![FieldDef::new("name", FieldKind::ShortString)]).unwrap()
    }

    fn compiled(model: &DataModel, name: &str) -> CompiledRecord {
        model
            .compile(&RecordId::from(0), &record([("name", name)]))
            .unwrap()
    }

    fn pair(model: &DataModel, a: &str, b: &str) -> (CompiledRecord, CompiledRecord) {
        (compiled(model, a), compiled(model, b))
    }

    #[test]
    fn pool_contains_simples_and_conjunctions() {
        let model = name_model();
        let pool = predicate_pool(&model);
        let simple_count = pool.iter().filter(|p| p.is_simple()).count();
        let compound_count = pool.len() - simple_count;
        assert!(simple_count >= 10);
        assert_eq!(compound_count, simple_count * (simple_count - 1) / 2);
    }

    #[test]
    fn learn_covers_identical_names() {
        let model = name_model();
        let matches = vec![
            pair(&model, "acme corp", "acme corp"),
            pair(&model, "zenith ltd", "zenith ltd"),
            pair(&model, "apex supply", "apex supply"),
        ];
        let distincts = vec![
            pair(&model, "acme corp", "zenith ltd"),
            pair(&model, "apex supply", "delta freight"),
        ];
        let sample: Vec<CompiledRecord> = ["gamma co", "omega inc", "sigma llc"]
            .iter()
            .map(|n| compiled(&model, n))
            .collect();

        let learned = learn(
            &model,
            &matches,
            &distincts,
            &sample,
            None,
            &BlockerOptions::default(),
        )
        .unwrap();
        assert!(!learned.is_empty());

        // Every match pair shares a key under the learned disjunction.
        let fp = Fingerprinter::new(learned);
        for (a, b) in &matches {
            let keys_a: std::collections::HashSet<String> =
                fp.keys_for(0, a).into_iter().collect();
            let keys_b: std::collections::HashSet<String> =
                fp.keys_for(0, b).into_iter().collect();
            assert!(!keys_a.is_disjoint(&keys_b));
        }
    }

    #[test]
    fn learn_meets_recall_target_on_prefix_matches() {
        let model = name_model();
        // Matches share 3-char prefixes but not whole fields.
        let matches: Vec<_> = (0..20)
            .map(|i| {
                pair(
                    &model,
                    &format!("prefix{i} alpha"),
                    &format!("prefix{i} beta"),
                )
            })
            .collect();
        let distincts = vec![
            pair(&model, "prefix1 alpha", "prefix2 beta"),
            pair(&model, "other one", "another two"),
        ];
        let sample: Vec<CompiledRecord> =
            (0..10).map(|i| compiled(&model, &format!("filler {i}"))).collect();

        let options = BlockerOptions {
            recall_target: 0.9,
            ..BlockerOptions::default()
        };
        let learned = learn(&model, &matches, &distincts, &sample, None, &options).unwrap();
        assert!(!learned.is_empty());

        let fp = Fingerprinter::new(learned);
        let covered = matches
            .iter()
            .filter(|(a, b)| {
                let ka: std::collections::HashSet<String> =
                    fp.keys_for(0, a).into_iter().collect();
                let kb: std::collections::HashSet<String> =
                    fp.keys_for(0, b).into_iter().collect();
                !ka.is_disjoint(&kb)
            })
            .count();
        assert!(covered >= 18, "only {covered}/20 match pairs covered");
    }

    #[test]
    fn no_matches_is_an_error() {
        let model = name_model();
        let result = learn(
            &model,
            &[],
            &[],
            &[],
            None,
            &BlockerOptions::default(),
        );
        assert!(matches!(result, Err(Error::Training(_))));
    }

    #[test]
    fn uncoverable_matches_return_best_effort() {
        let model = name_model();
        // No predicate can cover totally unrelated strings beyond chance;
        // the learner should still return without error.
        let matches = vec![
            pair(&model, "aaa bbb", "zzz yyy"),
            pair(&model, "ccc ddd", "www vvv"),
        ];
        let distincts = vec![pair(&model, "aaa bbb", "ccc ddd")];
        let result = learn(
            &model,
            &matches,
            &distincts,
            &[],
            None,
            &BlockerOptions::default(),
        )
        .unwrap();
        // Best effort may be empty; the call itself is recoverable.
        let _ = result;
    }

    #[test]
    fn deterministic() {
        let model = name_model();
        let matches = vec![
            pair(&model, "acme corp", "acme corporation"),
            pair(&model, "zenith ltd", "zenith limited"),
        ];
        let distincts = vec![pair(&model, "acme corp", "zenith ltd")];
        let sample: Vec<CompiledRecord> = ["one", "two", "three"]
            .iter()
            .map(|n| compiled(&model, n))
            .collect();
        let options = BlockerOptions::default();
        let a = learn(&model, &matches, &distincts, &sample, None, &options).unwrap();
        let b = learn(&model, &matches, &distincts, &sample, None, &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_fields_never_panic() {
        let model = DataModel::new(vec![
            FieldDef::new("name", FieldKind::ShortString).with_missing()
        ])
        .unwrap();
        let absent = model.compile(&RecordId::from(0), &Record::new()).unwrap();
        let present = compiled(&model, "acme");
        let matches = vec![(present.clone(), present.clone()), (absent.clone(), absent)];
        let distincts = vec![(present.clone(), present)];
        let learned = learn(
            &model,
            &matches,
            &distincts,
            &[],
            None,
            &BlockerOptions::default(),
        )
        .unwrap();
        let _ = learned;
    }
}
