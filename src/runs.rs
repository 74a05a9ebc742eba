//! Sorted runs: the hand-off between run creation and merging.

use std::sync::{Arc, Mutex, MutexGuard};

use bytemuck::Pod;

use crate::block::{Block, BlockId};
use crate::device::Storage;
use crate::error::SortError;
use crate::order::SentinelOrd;

/// Head key of one block within a run.
///
/// `value` duplicates the first record of the block at `bid`, so a merger
/// can schedule block reads by key without touching the device.
#[derive(Debug, Clone, Copy)]
pub struct TriggerEntry<V> {
    pub bid: BlockId,
    pub value: V,
}

/// The value ordering lifted to trigger entries, for sorting merge
/// schedules by head key.
pub fn trigger_ordering<V, C: SentinelOrd<V>>(
    cmp: &C,
) -> impl Fn(&TriggerEntry<V>, &TriggerEntry<V>) -> std::cmp::Ordering + '_ {
    let ord = crate::order::to_ordering(cmp);
    move |a, b| ord(&a.value, &b.value)
}

/// One run: the trigger entries of its blocks, in key order.
pub type Run<V> = Vec<TriggerEntry<V>>;

pub(crate) struct RunsData<V> {
    /// A whole input of at most one block, kept in memory. Mutually
    /// exclusive with `runs`.
    pub(crate) small_run: Vec<V>,
    pub(crate) runs: Vec<Run<V>>,
    /// Records per run, excluding padding.
    pub(crate) run_sizes: Vec<u64>,
    /// Total records over all runs plus the small run.
    pub(crate) elements: u64,
    pub(crate) storage: Arc<Storage<V>>,
}

impl<V> RunsData<V> {
    fn release_blocks(&mut self) {
        for run in self.runs.drain(..) {
            let bids: Vec<BlockId> = run.iter().map(|entry| entry.bid).collect();
            self.storage.delete_blocks(&bids);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.release_blocks();
        self.small_run.clear();
        self.run_sizes.clear();
        self.elements = 0;
    }

    pub(crate) fn add_run(&mut self, run: Run<V>, size: u64) {
        debug_assert!(self.small_run.is_empty());
        self.runs.push(run);
        self.run_sizes.push(size);
        self.elements += size;
    }
}

impl<V> Drop for RunsData<V> {
    fn drop(&mut self) {
        self.release_blocks();
    }
}

/// Shared aggregate of sorted runs.
///
/// The object exclusively owns the block identifiers of its runs and frees
/// them when the last holder drops it (or on [`clear`](Self::clear)). The
/// merger holds a clone while reading, which is what makes rewinding the
/// output phase possible: blocks are never freed mid-stream.
pub struct SortedRuns<V> {
    inner: Arc<Mutex<RunsData<V>>>,
}

impl<V> Clone for SortedRuns<V> {
    fn clone(&self) -> Self {
        SortedRuns {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Pod + Send + Sync> SortedRuns<V> {
    pub(crate) fn new(storage: Arc<Storage<V>>) -> Self {
        SortedRuns {
            inner: Arc::new(Mutex::new(RunsData {
                small_run: Vec::new(),
                runs: Vec::new(),
                run_sizes: Vec::new(),
                elements: 0,
                storage,
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RunsData<V>> {
        self.inner.lock().unwrap()
    }

    /// Total number of records.
    pub fn elements(&self) -> u64 {
        self.lock().elements
    }

    /// Number of external runs (zero for a small in-memory run).
    pub fn num_runs(&self) -> usize {
        self.lock().runs.len()
    }

    /// True if the data is held as a single in-memory run without any
    /// allocated blocks.
    pub fn is_small(&self) -> bool {
        let data = self.lock();
        data.runs.is_empty()
    }

    /// Discards all runs and frees their blocks.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Reads every block of `sruns` back and verifies the run invariants:
/// each trigger value equals the first record of its block, and every run
/// is non-decreasing, including the padded tail of its last block.
pub fn check_sorted_runs<V, C>(sruns: &SortedRuns<V>, cmp: &C) -> Result<bool, SortError>
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V>,
{
    let data = sruns.lock();
    let storage = Arc::clone(&data.storage);
    let block_elems = storage.block_elems();

    for (run_no, run) in data.runs.iter().enumerate() {
        let handles: Vec<_> = run
            .iter()
            .map(|entry| storage.read(entry.bid, Block::new(block_elems)))
            .collect();
        let mut blocks = Vec::with_capacity(run.len());
        for handle in handles {
            blocks.push(handle.wait()?);
        }

        for (entry, block) in run.iter().zip(&blocks) {
            let head = &block[0];
            if cmp.lt(head, &entry.value) || cmp.lt(&entry.value, head) {
                log::debug!("run {}: trigger value does not match block head", run_no);
                return Ok(false);
            }
        }

        let mut prev: Option<V> = None;
        let mut remaining = data.run_sizes[run_no];
        for block in &blocks {
            for value in block.iter() {
                if remaining == 0 {
                    // padded tail of the last block
                    if cmp.lt(value, &cmp.max_value()) || cmp.lt(&cmp.max_value(), value) {
                        log::debug!("run {}: padding is not the maximum sentinel", run_no);
                        return Ok(false);
                    }
                    continue;
                }
                remaining -= 1;
                if let Some(prev) = prev {
                    if cmp.lt(value, &prev) {
                        log::debug!("run {}: records out of order", run_no);
                        return Ok(false);
                    }
                }
                prev = Some(*value);
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::*;

    use super::{check_sorted_runs, SortedRuns, TriggerEntry};
    use crate::block::Block;
    use crate::device::{Storage, StorageOptions};
    use crate::order::NaturalOrder;

    #[fixture]
    fn storage() -> Arc<Storage<u32>> {
        Storage::new(StorageOptions {
            dir: None,
            num_disks: 1,
            block_elems: 4,
        })
        .unwrap()
    }

    fn write_run(storage: &Arc<Storage<u32>>, values: &[u32]) -> (Vec<TriggerEntry<u32>>, u64) {
        let mut padded = values.to_vec();
        while padded.len() % 4 != 0 {
            padded.push(u32::MAX);
        }
        let bids = storage.new_blocks(padded.len() / 4);
        let mut run = Vec::new();
        for (chunk, &bid) in padded.chunks(4).zip(&bids) {
            let mut block: Block<u32> = Block::new(4);
            block.as_mut_slice().copy_from_slice(chunk);
            run.push(TriggerEntry {
                bid,
                value: chunk[0],
            });
            storage.write(bid, block).wait().unwrap();
        }
        (run, values.len() as u64)
    }

    #[rstest]
    fn test_blocks_freed_on_last_drop(storage: Arc<Storage<u32>>) {
        let sruns = SortedRuns::new(Arc::clone(&storage));
        let (run, size) = write_run(&storage, &[1, 2, 3, 4, 5]);
        sruns.lock().add_run(run, size);
        assert_eq!(storage.blocks_in_use(), 2);

        let other = sruns.clone();
        drop(sruns);
        assert_eq!(storage.blocks_in_use(), 2);

        drop(other);
        assert_eq!(storage.blocks_in_use(), 0);
    }

    #[rstest]
    fn test_check_accepts_valid_runs(storage: Arc<Storage<u32>>) {
        let sruns = SortedRuns::new(Arc::clone(&storage));
        {
            let mut data = sruns.lock();
            let (run, size) = write_run(&storage, &[1, 3, 5, 7, 9]);
            data.add_run(run, size);
            let (run, size) = write_run(&storage, &[2, 2, 8]);
            data.add_run(run, size);
        }
        assert!(check_sorted_runs(&sruns, &NaturalOrder::<u32>::new()).unwrap());
        assert_eq!(sruns.elements(), 8);
        assert!(!sruns.is_small());
    }

    #[rstest]
    fn test_check_rejects_bad_trigger(storage: Arc<Storage<u32>>) {
        let sruns = SortedRuns::new(Arc::clone(&storage));
        {
            let mut data = sruns.lock();
            let (mut run, size) = write_run(&storage, &[1, 3, 5, 7]);
            run[0].value = 2; // no longer the block head
            data.add_run(run, size);
        }
        assert!(!check_sorted_runs(&sruns, &NaturalOrder::<u32>::new()).unwrap());
    }
}
