//! Tournament merge over prefetcher-fed block cursors.
//!
//! A loser tree keeps the losers of pairwise comparisons in its internal
//! nodes and the overall winner at the root, so replacing the winner costs
//! one leaf-to-root replay of log2(k) comparisons.
//!
//! Cursors are not tied to runs: whichever cursor drains its block next
//! receives the next block of the global consumption schedule. Because the
//! schedule is sorted by head key and runs are sorted across block
//! boundaries, every cursor's local stream stays non-decreasing.

use bytemuck::Pod;

use crate::block::Block;
use crate::error::SortError;
use crate::order::SentinelOrd;
use crate::prefetch::Prefetcher;

/// Read position within the stream of blocks a merge slot receives.
struct RunCursor<V> {
    block: Option<Block<V>>,
    offset: usize,
}

impl<V: Pod + Send + Sync> RunCursor<V> {
    fn seeded(block: Block<V>) -> Self {
        RunCursor {
            block: Some(block),
            offset: 0,
        }
    }

    fn vacant() -> Self {
        RunCursor {
            block: None,
            offset: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.block.is_none()
    }

    fn current(&self) -> &V {
        &self.block.as_ref().expect("read past cursor end")[self.offset]
    }

    fn advance(&mut self, prefetcher: &mut Prefetcher<V>) -> Result<(), SortError> {
        self.offset += 1;
        if self.offset == self.block.as_ref().map_or(0, |b| b.len()) {
            let drained = self.block.take().unwrap();
            prefetcher.block_consumed(drained);
            if !prefetcher.empty() {
                self.block = Some(prefetcher.pull_block()?);
                self.offset = 0;
            }
        }
        Ok(())
    }
}

/// K-way tournament merger.
pub struct LoserTree<V, C> {
    cmp: C,
    /// Number of leaves, padded to a power of two; `tree[0]` is the winner.
    k2: usize,
    tree: Vec<usize>,
    cursors: Vec<RunCursor<V>>,
    prefetcher: Prefetcher<V>,
}

impl<V, C> LoserTree<V, C>
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V>,
{
    /// Seeds `num_runs` cursors with the first blocks of the schedule and
    /// plays the initial tournament.
    pub fn new(
        cmp: C,
        mut prefetcher: Prefetcher<V>,
        num_runs: usize,
    ) -> Result<Self, SortError> {
        assert!(num_runs > 0, "cannot merge zero runs");

        let k2 = num_runs.next_power_of_two();
        let mut cursors = Vec::with_capacity(k2);
        for _ in 0..num_runs {
            cursors.push(RunCursor::seeded(prefetcher.pull_block()?));
        }
        for _ in num_runs..k2 {
            cursors.push(RunCursor::vacant());
        }

        let mut tree = LoserTree {
            cmp,
            k2,
            tree: vec![0; k2],
            cursors,
            prefetcher,
        };
        let winner = tree.init_winner(1);
        tree.tree[0] = winner;
        Ok(tree)
    }

    /// Total order over cursors: value order, then exhausted cursors last,
    /// index as the final tie-break.
    fn cursor_less(&self, a: usize, b: usize) -> bool {
        let (ca, cb) = (&self.cursors[a], &self.cursors[b]);
        match (ca.is_empty(), cb.is_empty()) {
            (true, true) => a < b,
            (true, false) => false,
            (false, true) => true,
            (false, false) => {
                if self.cmp.lt(ca.current(), cb.current()) {
                    true
                } else if self.cmp.lt(cb.current(), ca.current()) {
                    false
                } else {
                    a < b
                }
            }
        }
    }

    fn init_winner(&mut self, root: usize) -> usize {
        if root >= self.k2 {
            return root - self.k2;
        }
        let left = self.init_winner(2 * root);
        let right = self.init_winner(2 * root + 1);
        if self.cursor_less(left, right) {
            self.tree[root] = right;
            left
        } else {
            self.tree[root] = left;
            right
        }
    }

    /// Writes the next `out.len()` records in merge order.
    ///
    /// The caller bounds `out` by the number of records remaining, so the
    /// winning cursor always holds a real record here.
    pub fn multi_merge(&mut self, out: &mut [V]) -> Result<(), SortError> {
        for slot in out.iter_mut() {
            let mut winner = self.tree[0];
            debug_assert!(!self.cursors[winner].is_empty(), "merged past the last record");

            *slot = *self.cursors[winner].current();
            self.cursors[winner].advance(&mut self.prefetcher)?;

            let mut node = (self.k2 + winner) / 2;
            while node > 0 {
                let loser = self.tree[node];
                if self.cursor_less(loser, winner) {
                    self.tree[node] = winner;
                    winner = loser;
                }
                node /= 2;
            }
            self.tree[0] = winner;
        }
        Ok(())
    }
}
