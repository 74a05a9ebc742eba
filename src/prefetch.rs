//! Read-ahead over a block schedule.
//!
//! The merger knows the global order in which blocks will be consumed (the
//! schedule `S`, sorted by head key) before it reads the first one. The
//! prefetcher exploits that: it keeps up to `n_buffers` reads in flight,
//! issuing them in a caller-supplied order `P`, while delivering blocks
//! strictly in `S`-order. Consumption order and issue order are decoupled
//! so a device-aware `P` can keep all disks busy; correctness never depends
//! on `P`.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::Pod;

use crate::block::{Block, BlockId};
use crate::device::{IoHandle, Storage};
use crate::error::SortError;

pub struct Prefetcher<V> {
    storage: Arc<Storage<V>>,
    /// Consumption-order block ids (`S`).
    schedule: Vec<BlockId>,
    /// Issue order: indices into `schedule` (`P`).
    issue_order: Vec<usize>,
    issued: Vec<bool>,
    pending: HashMap<usize, IoHandle<Block<V>>>,
    free: Vec<Block<V>>,
    /// Scan position in `issue_order`.
    next_issue: usize,
    /// Next `schedule` index to deliver.
    next_deliver: usize,
}

impl<V: Pod + Send + Sync> Prefetcher<V> {
    /// Creates a prefetcher over `schedule` with `n_buffers` block buffers
    /// and starts the first reads.
    ///
    /// `issue_order` must be a permutation of `0..schedule.len()`.
    pub fn new(
        storage: Arc<Storage<V>>,
        schedule: Vec<BlockId>,
        issue_order: Vec<usize>,
        n_buffers: usize,
    ) -> Self {
        assert_eq!(schedule.len(), issue_order.len());
        assert!(n_buffers > 0 || schedule.is_empty());

        let n_buffers = n_buffers.min(schedule.len());
        let block_elems = storage.block_elems();
        let mut prefetcher = Prefetcher {
            storage,
            issued: vec![false; schedule.len()],
            pending: HashMap::with_capacity(n_buffers),
            free: (0..n_buffers).map(|_| Block::new(block_elems)).collect(),
            schedule,
            issue_order,
            next_issue: 0,
            next_deliver: 0,
        };
        prefetcher.refill();
        prefetcher
    }

    /// Identity issue order for a schedule of `n` blocks.
    pub fn identity_order(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    /// True once every scheduled block has been delivered.
    pub fn empty(&self) -> bool {
        self.next_deliver == self.schedule.len()
    }

    /// Index into the schedule of the next block to be delivered.
    pub fn pos(&self) -> usize {
        self.next_deliver
    }

    /// Returns the next block in schedule order, blocking until its read
    /// completed.
    pub fn pull_block(&mut self) -> Result<Block<V>, SortError> {
        assert!(!self.empty(), "pull_block on a drained prefetcher");

        let idx = self.next_deliver;
        if !self.issued[idx] {
            // An adversarial issue order can leave the pool tied up in reads
            // for later schedule positions. Reclaim the buffer of the
            // furthest-out read and fetch the needed block with it.
            let buf = match self.free.pop() {
                Some(buf) => buf,
                None => {
                    let steal = *self
                        .pending
                        .keys()
                        .max()
                        .expect("no buffers left to deliver the next block");
                    let buf = self.pending.remove(&steal).unwrap().wait()?;
                    self.issued[steal] = false;
                    self.next_issue = 0;
                    buf
                }
            };
            self.issued[idx] = true;
            self.pending.insert(idx, self.storage.read(self.schedule[idx], buf));
        }

        let handle = self
            .pending
            .remove(&idx)
            .expect("scheduled read vanished");
        let block = handle.wait()?;
        self.next_deliver += 1;
        Ok(block)
    }

    /// Returns a drained buffer to the pool and starts the next read.
    pub fn block_consumed(&mut self, buf: Block<V>) {
        self.free.push(buf);
        self.refill();
    }

    fn refill(&mut self) {
        while !self.free.is_empty() {
            while self.next_issue < self.issue_order.len()
                && self.issued[self.issue_order[self.next_issue]]
            {
                self.next_issue += 1;
            }

            let deliver_pending =
                self.next_deliver < self.schedule.len() && !self.issued[self.next_deliver];
            let target = if deliver_pending
                && (self.free.len() == 1 || self.next_issue == self.issue_order.len())
            {
                // The last free buffer is reserved for the block the merge
                // needs next, whatever the issue order says.
                self.next_deliver
            } else if self.next_issue < self.issue_order.len() {
                self.issue_order[self.next_issue]
            } else {
                break;
            };

            let buf = self.free.pop().unwrap();
            self.issued[target] = true;
            self.pending.insert(target, self.storage.read(self.schedule[target], buf));
        }
    }
}

impl<V> Drop for Prefetcher<V> {
    fn drop(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.cancel();
            let _ = handle.wait();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::*;

    use super::Prefetcher;
    use crate::block::{Block, BlockId};
    use crate::device::{Storage, StorageOptions};

    #[fixture]
    fn storage() -> Arc<Storage<u32>> {
        Storage::new(StorageOptions {
            dir: None,
            num_disks: 2,
            block_elems: 4,
        })
        .unwrap()
    }

    /// Writes `n` blocks where block `i` is filled with the value `i`.
    fn seed_blocks(storage: &Arc<Storage<u32>>, n: usize) -> Vec<BlockId> {
        let bids = storage.new_blocks(n);
        for (i, &bid) in bids.iter().enumerate() {
            let mut block: Block<u32> = Block::new(4);
            block.fill(i as u32);
            storage.write(bid, block).wait().unwrap();
        }
        bids
    }

    fn drain(mut prefetcher: Prefetcher<u32>) -> Vec<u32> {
        let mut seen = Vec::new();
        while !prefetcher.empty() {
            assert_eq!(prefetcher.pos(), seen.len());
            let block = prefetcher.pull_block().unwrap();
            seen.push(block[0]);
            prefetcher.block_consumed(block);
        }
        seen
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(16)]
    fn test_delivers_in_schedule_order(storage: Arc<Storage<u32>>, #[case] n_buffers: usize) {
        let bids = seed_blocks(&storage, 9);
        let prefetcher = Prefetcher::new(
            Arc::clone(&storage),
            bids,
            Prefetcher::<u32>::identity_order(9),
            n_buffers,
        );
        assert_eq!(drain(prefetcher), (0..9).collect::<Vec<u32>>());
    }

    #[rstest]
    #[case(2)]
    #[case(4)]
    fn test_reversed_issue_order_still_delivers_in_order(
        storage: Arc<Storage<u32>>,
        #[case] n_buffers: usize,
    ) {
        let bids = seed_blocks(&storage, 8);
        let issue_order: Vec<usize> = (0..8).rev().collect();
        let prefetcher = Prefetcher::new(Arc::clone(&storage), bids, issue_order, n_buffers);
        assert_eq!(drain(prefetcher), (0..8).collect::<Vec<u32>>());
    }

    #[rstest]
    fn test_burst_pulls_with_adversarial_issue_order(storage: Arc<Storage<u32>>) {
        // Seeding a merge pulls several blocks before consuming any; with a
        // reversed issue order the pool is tied up in far-out reads and the
        // prefetcher has to reclaim buffers for the blocks needed now.
        let bids = seed_blocks(&storage, 6);
        let issue_order: Vec<usize> = (0..6).rev().collect();
        let mut prefetcher = Prefetcher::new(Arc::clone(&storage), bids, issue_order, 3);

        let mut held = Vec::new();
        for i in 0..3u32 {
            let block = prefetcher.pull_block().unwrap();
            assert_eq!(block[0], i);
            held.push(block);
        }
        for block in held {
            prefetcher.block_consumed(block);
        }
        let mut seen = Vec::new();
        while !prefetcher.empty() {
            let block = prefetcher.pull_block().unwrap();
            seen.push(block[0]);
            prefetcher.block_consumed(block);
        }
        assert_eq!(seen, vec![3, 4, 5]);
    }

    #[rstest]
    fn test_partial_consumption_then_drop(storage: Arc<Storage<u32>>) {
        let bids = seed_blocks(&storage, 6);
        let mut prefetcher = Prefetcher::new(
            Arc::clone(&storage),
            bids,
            Prefetcher::<u32>::identity_order(6),
            3,
        );
        let block = prefetcher.pull_block().unwrap();
        assert_eq!(block[0], 0);
        prefetcher.block_consumed(block);
        // outstanding reads are settled on drop
        drop(prefetcher);
    }
}
