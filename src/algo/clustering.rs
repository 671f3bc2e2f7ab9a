//! Cluster formation over scored pairs.
//!
//! Deduplication builds connected components from the scored-pair graph,
//! runs single-linkage hierarchical clustering inside each component on the
//! condensed `1 − score` matrix, and cuts at a distance threshold. Linkage
//! and gazetteer matching instead pick greedily from the globally sorted
//! pair list, so results never depend on the scorer's emission order.

use std::collections::{HashMap, HashSet};

use ordered_float::OrderedFloat;

/// A cluster: member indices with a parallel per-member confidence score.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub members: Vec<usize>,
    pub scores: Vec<f32>,
}

/// Union-find with path halving.
pub struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Partition scored pairs into clusters, cutting single-linkage trees at
/// `cut_distance` (distances are `1 − score`).
///
/// Only records that appear in some pair are returned; the caller retains
/// unmatched records as singletons. Each member's score is its mean
/// similarity to the rest of its cluster; singletons score 1.
pub fn cluster(pairs: &[(usize, usize, f32)], cut_distance: f64) -> Vec<Cluster> {
    if pairs.is_empty() {
        return Vec::new();
    }

    // Remap the record ids appearing in pairs to dense component-local ids.
    let mut ids: Vec<usize> = pairs.iter().flat_map(|&(a, b, _)| [a, b]).collect();
    ids.sort_unstable();
    ids.dedup();
    let dense: HashMap<usize, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let mut uf = UnionFind::new(ids.len());
    for &(a, b, _) in pairs {
        uf.union(dense[&a], dense[&b]);
    }

    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..ids.len() {
        let root = uf.find(i);
        components.entry(root).or_default().push(i);
    }

    let mut component_list: Vec<Vec<usize>> = components.into_values().collect();
    component_list.sort_by_key(|members| members[0]);

    let mut clusters = Vec::new();
    for members in component_list {
        let n = members.len();
        if n == 1 {
            clusters.push(Cluster {
                members: vec![ids[members[0]]],
                scores: vec![1.0],
            });
            continue;
        }

        // Condensed distance matrix local to this component. Pairs the
        // scorer never produced sit at the maximum distance.
        let local: HashMap<usize, usize> =
            members.iter().enumerate().map(|(i, &m)| (m, i)).collect();
        let mut distances = vec![1.0f64; n * (n - 1) / 2];
        for &(a, b, score) in pairs {
            let (Some(&i), Some(&j)) = (local.get(&dense[&a]), local.get(&dense[&b])) else {
                continue;
            };
            let (i, j) = (i.min(j), i.max(j));
            let idx = condensed_index(i, j, n);
            distances[idx] = distances[idx].min(1.0 - score as f64);
        }

        let merges = single_linkage(&distances, n);
        let labels = cut_at_distance(&merges, n, cut_distance);

        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, &label) in labels.iter().enumerate() {
            groups.entry(label).or_default().push(i);
        }
        let mut group_list: Vec<Vec<usize>> = groups.into_values().collect();
        group_list.sort_by_key(|g| g[0]);

        for group in group_list {
            let scores = membership_scores(&group, &distances, n);
            clusters.push(Cluster {
                members: group.into_iter().map(|i| ids[members[i]]).collect(),
                scores,
            });
        }
    }

    clusters
}

/// One merge step of the dendrogram.
#[derive(Debug, Clone)]
struct Merge {
    cluster_a: usize,
    cluster_b: usize,
    distance: f64,
}

/// Single-linkage agglomerative clustering on a condensed distance matrix.
fn single_linkage(distances: &[f64], n: usize) -> Vec<Merge> {
    let mut dist = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = distances[condensed_index(i, j, n)];
            dist[i][j] = d;
            dist[j][i] = d;
        }
    }

    let mut active = vec![true; n];
    let mut cluster_id: Vec<usize> = (0..n).collect();
    let mut next_id = n;
    let mut merges = Vec::with_capacity(n.saturating_sub(1));

    for _ in 0..n.saturating_sub(1) {
        let mut best = (0usize, 0usize, f64::INFINITY);
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in (i + 1)..n {
                if active[j] && dist[i][j] < best.2 {
                    best = (i, j, dist[i][j]);
                }
            }
        }

        let (bi, bj, d) = best;
        merges.push(Merge {
            cluster_a: cluster_id[bi],
            cluster_b: cluster_id[bj],
            distance: d,
        });

        for k in 0..n {
            if active[k] && k != bi && k != bj {
                let merged = dist[bi][k].min(dist[bj][k]);
                dist[bi][k] = merged;
                dist[k][bi] = merged;
            }
        }
        active[bj] = false;
        cluster_id[bi] = next_id;
        next_id += 1;
    }

    merges
}

/// Flat cluster labels after applying every merge at or below the distance
/// threshold.
fn cut_at_distance(merges: &[Merge], n: usize, cut_distance: f64) -> Vec<usize> {
    let mut parent: HashMap<usize, usize> = HashMap::new();
    let mut next_id = n;
    for merge in merges {
        if merge.distance <= cut_distance {
            parent.insert(merge.cluster_a, next_id);
            parent.insert(merge.cluster_b, next_id);
        }
        next_id += 1;
    }

    let find_root = |mut id: usize| -> usize {
        while let Some(&p) = parent.get(&id) {
            id = p;
        }
        id
    };

    let roots: Vec<usize> = (0..n).map(find_root).collect();
    let mut label_map: HashMap<usize, usize> = HashMap::new();
    let mut next_label = 0;
    roots
        .iter()
        .map(|&r| {
            *label_map.entry(r).or_insert_with(|| {
                let l = next_label;
                next_label += 1;
                l
            })
        })
        .collect()
}

/// Mean similarity of each member to the others in its group.
fn membership_scores(group: &[usize], distances: &[f64], n: usize) -> Vec<f32> {
    if group.len() == 1 {
        return vec![1.0];
    }
    group
        .iter()
        .map(|&i| {
            let total: f64 = group
                .iter()
                .filter(|&&j| j != i)
                .map(|&j| {
                    let (lo, hi) = (i.min(j), i.max(j));
                    1.0 - distances[condensed_index(lo, hi, n)]
                })
                .sum();
            (total / (group.len() - 1) as f64) as f32
        })
        .collect()
}

/// Index into a condensed distance matrix for pair (i, j), i < j.
fn condensed_index(i: usize, j: usize, n: usize) -> usize {
    debug_assert!(i < j);
    i * n - i * (i + 1) / 2 + j - i - 1
}

/// Greedy one-to-one bipartite matching for record linkage.
///
/// Pairs are `(left, right, score)`. Repeatedly takes the highest-scoring
/// pair whose sides are both unassigned. Ties break on the pair ids, so the
/// result is independent of input order.
pub fn greedy_matching(pairs: &[(usize, usize, f32)]) -> Vec<(usize, usize, f32)> {
    let mut sorted: Vec<&(usize, usize, f32)> = pairs.iter().collect();
    sorted.sort_by_key(|&&(a, b, score)| (OrderedFloat(-score), a, b));

    let mut left_taken: HashSet<usize> = HashSet::new();
    let mut right_taken: HashSet<usize> = HashSet::new();
    let mut matches = Vec::new();

    for &&(a, b, score) in &sorted {
        if left_taken.contains(&a) || right_taken.contains(&b) {
            continue;
        }
        left_taken.insert(a);
        right_taken.insert(b);
        matches.push((a, b, score));
    }

    matches.sort_by_key(|&(a, b, _)| (a, b));
    matches
}

/// Top-k matching for gazetteer search: each messy record keeps up to
/// `n_matches` canonical matches, best first.
pub fn gazetteer_matching(
    pairs: &[(usize, usize, f32)],
    n_matches: usize,
) -> Vec<(usize, Vec<(usize, f32)>)> {
    let mut by_messy: HashMap<usize, Vec<(usize, f32)>> = HashMap::new();
    for &(messy, canonical, score) in pairs {
        by_messy.entry(messy).or_default().push((canonical, score));
    }

    let mut results: Vec<(usize, Vec<(usize, f32)>)> = by_messy
        .into_iter()
        .map(|(messy, mut candidates)| {
            candidates.sort_by_key(|&(id, score)| (OrderedFloat(-score), id));
            candidates.truncate(n_matches);
            (messy, candidates)
        })
        .collect();
    results.sort_by_key(|&(messy, _)| messy);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_empty_output() {
        assert!(cluster(&[], 0.5).is_empty());
    }

    #[test]
    fn single_pair_clusters_together() {
        let clusters = cluster(&[(1, 2, 0.95f32)], 0.5);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, vec![1, 2]);
        assert!(clusters[0].scores.iter().all(|&s| s > 0.9));
    }

    #[test]
    fn distant_pair_stays_split() {
        // Distance 0.8 exceeds the 0.5 cut: two singletons.
        let clusters = cluster(&[(1, 2, 0.2f32)], 0.5);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![1]);
        assert_eq!(clusters[0].scores, vec![1.0]);
    }

    #[test]
    fn chain_merges_within_cut() {
        let pairs = [(1, 2, 0.9f32), (2, 3, 0.9), (3, 4, 0.9)];
        let clusters = cluster(&pairs, 0.5);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, vec![1, 2, 3, 4]);
    }

    #[test]
    fn separate_components_stay_separate() {
        let pairs = [(1, 2, 0.9f32), (10, 11, 0.9)];
        let clusters = cluster(&pairs, 0.5);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![1, 2]);
        assert_eq!(clusters[1].members, vec![10, 11]);
    }

    #[test]
    fn weak_bridge_is_cut() {
        // Two tight pairs joined by one weak edge: the weak edge exceeds
        // the cut distance, so the component splits in two.
        let pairs = [
            (1, 2, 0.95f32),
            (3, 4, 0.95),
            (2, 3, 0.55), // distance 0.45 > 0.3 cut
        ];
        let clusters = cluster(&pairs, 0.3);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![1, 2]);
        assert_eq!(clusters[1].members, vec![3, 4]);
    }

    #[test]
    fn lower_cut_refines_partition() {
        let pairs = [(1, 2, 0.95f32), (2, 3, 0.6)];
        let coarse = cluster(&pairs, 0.5);
        let fine = cluster(&pairs, 0.1);
        assert_eq!(coarse.len(), 1);
        assert!(fine.len() > coarse.len());
    }

    #[test]
    fn membership_scores_reflect_similarity() {
        let pairs = [(1, 2, 0.9f32), (1, 3, 0.9), (2, 3, 0.9)];
        let clusters = cluster(&pairs, 0.5);
        assert_eq!(clusters.len(), 1);
        for &s in &clusters[0].scores {
            assert!((s - 0.9).abs() < 1e-6, "score {s}");
        }
    }

    #[test]
    fn cluster_deterministic_under_pair_order() {
        let pairs_a = [(1, 2, 0.9f32), (2, 3, 0.8), (5, 6, 0.95)];
        let pairs_b = [(5, 6, 0.95f32), (2, 3, 0.8), (1, 2, 0.9)];
        assert_eq!(cluster(&pairs_a, 0.5), cluster(&pairs_b, 0.5));
    }

    #[test]
    fn greedy_matching_picks_best_first() {
        let pairs = [(0, 10, 0.7f32), (0, 11, 0.9), (1, 11, 0.8), (1, 10, 0.6)];
        let matches = greedy_matching(&pairs);
        // (0,11) wins at 0.9, which forces (1,10) at 0.6.
        assert_eq!(matches, vec![(0, 11, 0.9), (1, 10, 0.6)]);
    }

    #[test]
    fn greedy_matching_consumes_both_sides() {
        let pairs = [(0, 10, 0.9f32), (0, 11, 0.8), (1, 10, 0.85)];
        let matches = greedy_matching(&pairs);
        // Once (0,10) is taken, neither 0 nor 10 can match again, and 1's
        // only candidate was 10.
        assert_eq!(matches, vec![(0, 10, 0.9)]);
    }

    #[test]
    fn greedy_matching_order_independent() {
        let mut pairs = vec![(0, 10, 0.7f32), (1, 11, 0.7), (0, 11, 0.5)];
        let forward = greedy_matching(&pairs);
        pairs.reverse();
        let backward = greedy_matching(&pairs);
        assert_eq!(forward, backward);
    }

    #[test]
    fn gazetteer_keeps_top_k() {
        let pairs = [(0, 10, 0.6f32), (0, 11, 0.9), (0, 12, 0.7), (1, 10, 0.8)];
        let results = gazetteer_matching(&pairs, 2);
        assert_eq!(results.len(), 2);
        let (messy, matches) = &results[0];
        assert_eq!(*messy, 0);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0], (11, 0.9));
        assert_eq!(matches[1], (12, 0.7));
    }

    #[test]
    fn condensed_index_layout() {
        // n = 4: (0,1)=0 (0,2)=1 (0,3)=2 (1,2)=3 (1,3)=4 (2,3)=5
        assert_eq!(condensed_index(0, 1, 4), 0);
        assert_eq!(condensed_index(0, 3, 4), 2);
        assert_eq!(condensed_index(1, 2, 4), 3);
        assert_eq!(condensed_index(2, 3, 4), 5);
    }
}
