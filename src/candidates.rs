//! Candidate pair generation.
//!
//! Turns the fingerprinter's `(block_key, record)` stream into unique
//! unordered record pairs. A pair that co-occurs in several blocks is
//! emitted exactly once, from the block with the smallest id, by checking
//! that the two records share no earlier block (the redundant-free
//! comparison scheme of Kolb et al.). The source implementation tracked
//! this with sorted id-list strings; here each record simply keeps its
//! ascending list of block ids.

use tracing::{debug, warn};

use crate::cancel::{self, CancelToken};
use crate::error::Result;

/// A materialised block partition, ready to enumerate candidate pairs.
pub struct CandidateGenerator {
    /// Multi-member blocks in block-key order, members sorted ascending.
    blocks: Vec<Vec<u32>>,
    /// Record position -> ascending ids of the blocks containing it.
    memberships: Vec<Vec<u32>>,
}

impl CandidateGenerator {
    /// Partition a keyed stream. Blocks of size one cover no pair and are
    /// dropped; blocks larger than `max_block_size` are dropped with a
    /// warning. Output is deterministic given the input ordering.
    pub fn new(
        mut keyed: Vec<(String, usize)>,
        n_records: usize,
        max_block_size: Option<usize>,
    ) -> Self {
        keyed.sort();
        keyed.dedup();

        let mut blocks: Vec<Vec<u32>> = Vec::new();
        let mut memberships: Vec<Vec<u32>> = vec![Vec::new(); n_records];
        let mut oversized = 0usize;

        let mut start = 0;
        while start < keyed.len() {
            let key = &keyed[start].0;
            let mut end = start;
            while end < keyed.len() && keyed[end].0 == *key {
                end += 1;
            }

            let size = end - start;
            if size >= 2 {
                if max_block_size.is_some_and(|cap| size > cap) {
                    oversized += 1;
                } else {
                    let block_id = blocks.len() as u32;
                    let members: Vec<u32> =
                        keyed[start..end].iter().map(|&(_, p)| p as u32).collect();
                    for &m in &members {
                        memberships[m as usize].push(block_id);
                    }
                    blocks.push(members);
                }
            }
            start = end;
        }

        if oversized > 0 {
            warn!(
                blocks = oversized,
                cap = max_block_size.unwrap_or(0),
                "dropped oversized blocks"
            );
        }
        debug!(blocks = blocks.len(), "block partition built");

        Self {
            blocks,
            memberships,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Lazy iterator over unique unordered pairs `(a, b)`, `a < b`.
    pub fn pairs(&self) -> CandidatePairs<'_> {
        CandidatePairs {
            generator: self,
            block: 0,
            i: 0,
            j: 1,
        }
    }

    /// Collect all pairs, observing the cancellation token between blocks.
    pub fn collect_pairs(&self, token: Option<&CancelToken>) -> Result<Vec<(usize, usize)>> {
        let mut pairs = Vec::new();
        for block_id in 0..self.blocks.len() {
            cancel::check(token)?;
            self.block_pairs(block_id, &mut pairs);
        }
        Ok(pairs)
    }

    fn block_pairs(&self, block_id: usize, out: &mut Vec<(usize, usize)>) {
        let members = &self.blocks[block_id];
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                if let Some(pair) = self.emit(block_id, members[i], members[j]) {
                    out.push(pair);
                }
            }
        }
    }

    fn emit(&self, block_id: usize, x: u32, y: u32) -> Option<(usize, usize)> {
        if shares_earlier_block(
            &self.memberships[x as usize],
            &self.memberships[y as usize],
            block_id as u32,
        ) {
            return None;
        }
        let (a, b) = if x < y { (x, y) } else { (y, x) };
        Some((a as usize, b as usize))
    }
}

/// Whether two ascending block-id lists intersect below `current`.
fn shares_earlier_block(a: &[u32], b: &[u32], current: u32) -> bool {
    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() && a[i] < current && b[j] < current {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Equal => return true,
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
        }
    }
    false
}

/// Iterator over the generator's unique pairs, block by block.
pub struct CandidatePairs<'a> {
    generator: &'a CandidateGenerator,
    block: usize,
    i: usize,
    j: usize,
}

impl Iterator for CandidatePairs<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        loop {
            let blocks = &self.generator.blocks;
            if self.block >= blocks.len() {
                return None;
            }
            let members = &blocks[self.block];
            if self.i + 1 >= members.len() {
                self.block += 1;
                self.i = 0;
                self.j = 1;
                continue;
            }
            if self.j >= members.len() {
                self.i += 1;
                self.j = self.i + 1;
                continue;
            }

            let (x, y) = (members[self.i], members[self.j]);
            self.j += 1;
            if let Some(pair) = self.generator.emit(self.block, x, y) {
                return Some(pair);
            }
        }
    }
}
