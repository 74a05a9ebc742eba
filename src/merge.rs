//! Run merging: the second sorting phase.
//!
//! A [`RunsMerger`] turns a [`SortedRuns`] into a lazy pull cursor. Inputs
//! of at most one block never left memory and are served directly. External
//! runs are merged through a loser tree fed by the prefetcher; when the
//! fan-in exceeds what the memory budget can buffer, recursive merge passes
//! first reduce the number of runs, rewriting the shared runs object in
//! place.
//!
//! Blocks of the input runs are only freed when the runs object itself is
//! dropped or cleared, never while the cursor is reading, so a merger can be
//! re-initialized on the same runs to replay the output.

use std::sync::Arc;

use bytemuck::Pod;

use crate::block::{div_ceil, BlockId};
use crate::device::{BlockWriter, Storage};
use crate::error::SortError;
use crate::losertree::LoserTree;
use crate::order::{verify_sentinel_ord, SentinelOrd};
use crate::prefetch::Prefetcher;
use crate::runs::{trigger_ordering, Run, SortedRuns, TriggerEntry};

/// Merges sorted runs into a single ordered stream of records.
pub struct RunsMerger<V, C>
where
    V: Pod + Send + Sync,
{
    cmp: C,
    memory: usize,
    sruns: Option<SortedRuns<V>>,
    /// Records not yet emitted.
    remaining: u64,
    /// Current output buffer (one block, or the whole small run).
    out: Vec<V>,
    cur: usize,
    out_block_elems: usize,
    tree: Option<LoserTree<V, C>>,
    #[cfg(debug_assertions)]
    last: Option<V>,
}

impl<V, C> RunsMerger<V, C>
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V> + Sync,
{
    /// Creates a merger with `memory` bytes of buffer budget. No work
    /// happens until [`initialize`](Self::initialize).
    pub fn new(cmp: C, memory: usize) -> Result<Self, SortError> {
        verify_sentinel_ord(&cmp)?;
        Ok(RunsMerger {
            cmp,
            memory,
            sruns: None,
            remaining: 0,
            out: Vec::new(),
            cur: 0,
            out_block_elems: 0,
            tree: None,
            #[cfg(debug_assertions)]
            last: None,
        })
    }

    /// Adjusts the byte budget used by the next `initialize`.
    pub fn set_memory(&mut self, memory: usize) {
        self.memory = memory;
    }

    /// Starts merging `sruns`; afterwards the cursor serves the first
    /// record.
    pub fn initialize(&mut self, sruns: SortedRuns<V>) -> Result<(), SortError> {
        self.deallocate();
        self.remaining = sruns.elements();
        self.cur = 0;
        self.out.clear();
        self.sruns = Some(sruns.clone());
        #[cfg(debug_assertions)]
        {
            self.last = None;
        }

        if self.remaining == 0 {
            return Ok(());
        }

        {
            let data = sruns.lock();
            if !data.small_run.is_empty() {
                // kept in memory by the creator, nothing to prefetch
                self.out = data.small_run.clone();
                self.out_block_elems = data.storage.block_elems();
                return Ok(());
            }
        }

        let storage = Arc::clone(&sruns.lock().storage);
        let block_bytes = storage.block_bytes();
        let block_elems = storage.block_elems();
        self.out_block_elems = block_elems;

        let p_min = 2 * storage.num_disks();
        let input_buffers = self.memory.saturating_sub(block_bytes) / block_bytes;
        let mut num_runs = sruns.num_runs();

        if input_buffers < num_runs + p_min {
            log::warn!(
                "{} runs do not fit one merge pass ({} input buffers, {} reserved); \
                 merging recursively — a larger merge budget or smaller blocks would avoid \
                 the extra pass",
                num_runs,
                input_buffers,
                p_min
            );

            let merge_buffers = self.memory / block_bytes;
            if merge_buffers < 2 * p_min + 1 + 2 {
                // need read-ahead + write-behind + an output block, and at
                // least two input blocks
                return Err(SortError::InsufficientMemory {
                    required: (2 * p_min + 3) * block_bytes,
                    provided: self.memory,
                });
            }

            self.merge_recursively(&sruns, &storage)?;
            num_runs = sruns.num_runs();
        }

        debug_assert!(num_runs + p_min <= input_buffers);

        let mut schedule: Vec<TriggerEntry<V>> = {
            let data = sruns.lock();
            data.runs.iter().flatten().copied().collect()
        };
        // stable: blocks of one run keep their relative order among equal
        // head keys
        schedule.sort_by(trigger_ordering(&self.cmp));

        let n_prefetch = p_min.max(input_buffers - num_runs);
        let n_buffers = (num_runs + n_prefetch).min(schedule.len());
        let bids: Vec<BlockId> = schedule.iter().map(|entry| entry.bid).collect();
        let issue_order = Prefetcher::<V>::identity_order(bids.len());

        log::debug!(
            "merging {} runs over {} blocks with {} buffers",
            num_runs,
            bids.len(),
            n_buffers
        );

        let prefetcher = Prefetcher::new(storage, bids, issue_order, n_buffers);
        self.tree = Some(LoserTree::new(self.cmp.clone(), prefetcher, num_runs)?);
        self.fill_output_buffer()?;
        Ok(())
    }

    /// Releases the merge structures and the reference on the runs object.
    pub fn deallocate(&mut self) {
        self.tree = None;
        self.sruns = None;
        self.remaining = 0;
        self.out.clear();
        self.cur = 0;
    }

    pub fn empty(&self) -> bool {
        self.remaining == 0
    }

    /// Records left to emit.
    pub fn size(&self) -> u64 {
        self.remaining
    }

    pub fn current(&self) -> &V {
        assert!(!self.empty(), "current() on a drained merger");
        &self.out[self.cur]
    }

    /// Steps to the next record, refilling the output buffer when the
    /// current one drains.
    pub fn advance(&mut self) -> Result<(), SortError> {
        assert!(!self.empty(), "advance() on a drained merger");
        self.remaining -= 1;
        self.cur += 1;
        if self.cur == self.out.len() && self.remaining > 0 {
            self.fill_output_buffer()?;
        }
        Ok(())
    }

    /// True when the next `advance` has to merge a new output block.
    pub fn next_output_would_block(&self) -> bool {
        self.cur + 1 == self.out.len()
    }

    /// Records per merged output block.
    pub fn output_block_size(&self) -> usize {
        self.out_block_elems
    }

    fn fill_output_buffer(&mut self) -> Result<(), SortError> {
        let n = (self.out_block_elems as u64).min(self.remaining) as usize;
        self.out.clear();
        self.out.resize(n, V::zeroed());
        self.cur = 0;

        let tree = self.tree.as_mut().expect("merge state gone before the last record");
        tree.multi_merge(&mut self.out)?;

        #[cfg(debug_assertions)]
        {
            for pair in self.out.windows(2) {
                debug_assert!(!self.cmp.lt(&pair[1], &pair[0]), "merge output out of order");
            }
            if let (Some(last), Some(first)) = (self.last.as_ref(), self.out.first()) {
                debug_assert!(!self.cmp.lt(first, last), "merge output out of order");
            }
            self.last = self.out.last().copied();
        }

        if self.remaining <= self.out.len() as u64 {
            // everything left is in the output buffer; release the
            // prefetch buffers early
            self.tree = None;
        }
        Ok(())
    }

    /// Reduces the number of runs below the single-pass limit by merging
    /// groups of runs into longer ones, swapping the result into `sruns`.
    fn merge_recursively(
        &mut self,
        sruns: &SortedRuns<V>,
        storage: &Arc<Storage<V>>,
    ) -> Result<(), SortError> {
        let block_bytes = storage.block_bytes();
        let block_elems = storage.block_elems();
        let p_min = 2 * storage.num_disks();
        let write_buffers = p_min;

        // read-ahead, write-behind and the inner merger's output block
        let memory_for_buffers = (write_buffers + p_min + 1) * block_bytes;
        let max_arity = (self.memory.saturating_sub(memory_for_buffers) / block_bytes).max(2);

        let mut num_runs = sruns.num_runs();
        let merge_factor = optimal_merge_factor(num_runs, max_arity);

        while num_runs > max_arity {
            let new_num_runs = div_ceil(num_runs as u64, merge_factor as u64) as usize;
            log::debug!(
                "merge pass: {} runs -> {} runs (factor {}, max arity {})",
                num_runs,
                new_num_runs,
                merge_factor,
                max_arity
            );

            // take ownership of the current runs; the runs object keeps its
            // element count
            let (old_runs, old_sizes) = {
                let mut data = sruns.lock();
                (
                    std::mem::take(&mut data.runs),
                    std::mem::take(&mut data.run_sizes),
                )
            };

            let mut new_runs: Vec<Run<V>> = Vec::with_capacity(new_num_runs);
            let mut new_sizes: Vec<u64> = Vec::with_capacity(new_num_runs);

            let mut runs_iter = old_runs.into_iter().zip(old_sizes);
            loop {
                let group: Vec<(Run<V>, u64)> = runs_iter.by_ref().take(merge_factor).collect();
                if group.is_empty() {
                    break;
                }
                if group.len() == 1 {
                    // nothing to merge, transfer the blocks as they are
                    let (run, size) = group.into_iter().next().unwrap();
                    new_runs.push(run);
                    new_sizes.push(size);
                    continue;
                }

                let total: u64 = group.iter().map(|(_, size)| size).sum();
                let num_blocks = div_ceil(total, block_elems as u64) as usize;
                let out_bids = storage.new_blocks(num_blocks);

                // the group becomes its own runs object so that dropping it
                // afterwards frees the merged input blocks
                let group_runs = SortedRuns::new(Arc::clone(storage));
                {
                    let mut data = group_runs.lock();
                    for (run, size) in group {
                        data.add_run(run, size);
                    }
                }

                let mut inner =
                    RunsMerger::new(self.cmp.clone(), self.memory - write_buffers * block_bytes)?;
                inner.initialize(group_runs.clone())?;

                let new_run = write_merged_run(
                    storage,
                    &self.cmp,
                    &mut inner,
                    &out_bids,
                    total,
                    write_buffers,
                )?;

                inner.deallocate();
                drop(group_runs);

                new_runs.push(new_run);
                new_sizes.push(total);
            }

            debug_assert_eq!(new_runs.len(), new_num_runs);
            {
                let mut data = sruns.lock();
                data.runs = new_runs;
                data.run_sizes = new_sizes;
            }
            num_runs = new_num_runs;
        }
        Ok(())
    }
}

/// Streams `total` records out of `inner` into the preallocated blocks,
/// recording each block's head key and padding the final block.
fn write_merged_run<V, C>(
    storage: &Arc<Storage<V>>,
    cmp: &C,
    inner: &mut RunsMerger<V, C>,
    out_bids: &[BlockId],
    total: u64,
    write_buffers: usize,
) -> Result<Run<V>, SortError>
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V> + Sync,
{
    let block_elems = storage.block_elems();
    let mut writer = BlockWriter::new(Arc::clone(storage), write_buffers);
    let mut run: Run<V> = Vec::with_capacity(out_bids.len());

    let mut block = writer.take_block()?;
    let mut offset = 0;
    for _ in 0..total {
        block[offset] = *inner.current();
        offset += 1;
        inner.advance()?;

        if offset == block_elems {
            let bid = out_bids[run.len()];
            run.push(TriggerEntry {
                bid,
                value: block[0],
            });
            writer.write(bid, block);
            block = writer.take_block()?;
            offset = 0;
        }
    }
    debug_assert!(inner.empty());

    if offset > 0 {
        let max = cmp.max_value();
        for slot in &mut block[offset..] {
            *slot = max;
        }
        let bid = out_bids[run.len()];
        run.push(TriggerEntry {
            bid,
            value: block[0],
        });
        writer.write(bid, block);
    }
    writer.flush()?;

    debug_assert_eq!(run.len(), out_bids.len());
    Ok(run)
}

/// Smallest merge factor that achieves the minimal number of passes for
/// reducing `num_runs` runs with at most `max_arity` inputs per merge.
fn optimal_merge_factor(num_runs: usize, max_arity: usize) -> usize {
    debug_assert!(max_arity >= 2);
    if num_runs <= max_arity {
        return num_runs.max(2);
    }

    let passes_needed = |factor: usize| {
        let mut passes = 0usize;
        let mut reach: u128 = 1;
        while reach < num_runs as u128 {
            reach *= factor as u128;
            passes += 1;
        }
        passes
    };

    let min_passes = passes_needed(max_arity);
    let mut factor = max_arity;
    // binary search the smallest factor still finishing in min_passes
    let (mut lo, mut hi) = (2usize, max_arity);
    while lo <= hi {
        let mid = (lo + hi) / 2;
        if passes_needed(mid) <= min_passes {
            factor = mid;
            hi = mid - 1;
        } else {
            lo = mid + 1;
        }
    }
    factor
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::*;

    use super::{optimal_merge_factor, RunsMerger};
    use crate::create::PushRunsCreator;
    use crate::device::{Storage, StorageOptions};
    use crate::order::NaturalOrder;
    use crate::runs::SortedRuns;

    const BLOCK_ELEMS: usize = 8;
    const BLOCK_BYTES: usize = BLOCK_ELEMS * 4;

    fn mem_for_blocks(m_blocks: usize) -> usize {
        m_blocks * BLOCK_BYTES * crate::create::MEM_FACTOR
    }

    #[fixture]
    fn storage() -> Arc<Storage<u32>> {
        Storage::new(StorageOptions {
            dir: None,
            num_disks: 1,
            block_elems: BLOCK_ELEMS,
        })
        .unwrap()
    }

    fn make_runs(storage: &Arc<Storage<u32>>, input: &[u32], creator_mem: usize) -> SortedRuns<u32> {
        let mut creator = PushRunsCreator::new(
            NaturalOrder::<u32>::new(),
            Arc::clone(storage),
            creator_mem,
        )
        .unwrap();
        for &v in input {
            creator.push(v).unwrap();
        }
        creator.result().unwrap()
    }

    fn drain(merger: &mut RunsMerger<u32, NaturalOrder<u32>>) -> Vec<u32> {
        let mut out = Vec::new();
        while !merger.empty() {
            out.push(*merger.current());
            merger.advance().unwrap();
        }
        out
    }

    #[rstest]
    fn test_empty_input(storage: Arc<Storage<u32>>) {
        let sruns = make_runs(&storage, &[], mem_for_blocks(2));
        let mut merger = RunsMerger::new(NaturalOrder::<u32>::new(), 1024).unwrap();
        merger.initialize(sruns).unwrap();
        assert!(merger.empty());
        assert_eq!(merger.size(), 0);
    }

    #[rstest]
    fn test_two_runs_single_pass(storage: Arc<Storage<u32>>) {
        // nine reverse-sorted records with one-block runs: runs of 8 and 1
        let input: Vec<u32> = (0..9).rev().collect();
        let sruns = make_runs(&storage, &input, mem_for_blocks(2));
        assert_eq!(sruns.num_runs(), 2);

        let mut merger = RunsMerger::new(NaturalOrder::<u32>::new(), 8 * BLOCK_BYTES).unwrap();
        merger.initialize(sruns).unwrap();
        assert_eq!(merger.size(), 9);
        assert_eq!(drain(&mut merger), (0..9).collect::<Vec<u32>>());
    }

    #[rstest]
    fn test_random_input_with_recursive_merge(storage: Arc<Storage<u32>>) {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let input: Vec<u32> = (0..1000).map(|_| rng.gen()).collect();

        // runs of 32 records: 32 runs, more than one pass can buffer with
        // a 32-block merge budget
        let sruns = make_runs(&storage, &input, mem_for_blocks(8));
        assert_eq!(sruns.num_runs(), 32);

        let mut merger = RunsMerger::new(NaturalOrder::<u32>::new(), 32 * BLOCK_BYTES).unwrap();
        merger.initialize(sruns.clone()).unwrap();

        // the recursive pass rewrote the shared runs object
        assert!(sruns.num_runs() < 32);
        assert_eq!(sruns.elements(), 1000);

        let out = drain(&mut merger);
        let mut expected = input;
        expected.sort_unstable();
        assert_eq!(out, expected);

        drop(merger);
        drop(sruns);
        assert_eq!(storage.blocks_in_use(), 0);
    }

    #[rstest]
    // the smallest budget that still admits a recursive pass, a mid-size
    // budget, and one that merges in a single pass
    #[case(7 * BLOCK_BYTES)]
    #[case(16 * BLOCK_BYTES)]
    #[case(1 << 20)]
    fn test_output_independent_of_merge_budget(storage: Arc<Storage<u32>>, #[case] memory: usize) {
        let mut rng = StdRng::seed_from_u64(7);
        let input: Vec<u32> = (0..200).map(|_| rng.gen_range(0..50)).collect();
        let sruns = make_runs(&storage, &input, mem_for_blocks(2));

        let mut merger = RunsMerger::new(NaturalOrder::<u32>::new(), memory).unwrap();
        merger.initialize(sruns).unwrap();
        let out = drain(&mut merger);

        let mut expected = input;
        expected.sort_unstable();
        assert_eq!(out, expected);
    }

    #[rstest]
    fn test_reinitialize_replays_the_stream(storage: Arc<Storage<u32>>) {
        let input: Vec<u32> = (0..100).rev().collect();
        let sruns = make_runs(&storage, &input, mem_for_blocks(2));

        let mut merger = RunsMerger::new(NaturalOrder::<u32>::new(), 16 * BLOCK_BYTES).unwrap();
        merger.initialize(sruns.clone()).unwrap();
        let first = drain(&mut merger);

        merger.initialize(sruns).unwrap();
        let second = drain(&mut merger);
        assert_eq!(first, second);
        assert_eq!(first, (0..100).collect::<Vec<u32>>());
    }

    #[test]
    fn test_optimal_merge_factor() {
        // one pass possible: keep the fan-in
        assert_eq!(optimal_merge_factor(5, 8), 5);
        // two passes: spread evenly instead of maxing the first pass
        assert_eq!(optimal_merge_factor(32, 27), 6);
        assert_eq!(optimal_merge_factor(100, 10), 10);
        assert_eq!(optimal_merge_factor(101, 100), 11);
    }
}
