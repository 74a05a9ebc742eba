//! Run creation: the first sorting phase.
//!
//! A creator consumes records, cuts them into memory-sized runs, sorts each
//! run with the rayon pool and writes it to block storage with write-behind,
//! producing a [`SortedRuns`] for the merge phase. Three drivers share that
//! output contract:
//!
//! * [`RunsCreator`] pulls from an iterator,
//! * [`PushRunsCreator`] is caller-driven (`push`), and
//! * [`PresortedRunsCreator`] accepts pre-sorted groups delimited by
//!   `finish()`.
//!
//! Half of the buffer memory accumulates the next run while the other half
//! is being written, so compute and device transfers overlap.

use std::iter::Peekable;
use std::sync::Arc;

use bytemuck::Pod;
use rayon::slice::ParallelSliceMut;

use crate::block::{div_ceil, Block};
use crate::device::{BlockWriter, IoHandle, Storage};
use crate::error::SortError;
use crate::order::{to_ordering, verify_sentinel_ord, SentinelOrd};
use crate::runs::{Run, SortedRuns, TriggerEntry};

/// Headroom factor between the caller's byte budget and the run buffers, to
/// cover the in-memory sort and outstanding request bookkeeping.
pub(crate) const MEM_FACTOR: usize = 2;

/// Converts a byte budget into a buffer block count, requiring room for at
/// least two blocks.
pub(crate) fn budget_blocks(memory: usize, block_bytes: usize) -> Result<usize, SortError> {
    let m_blocks = memory / block_bytes / MEM_FACTOR;
    if m_blocks < 2 {
        return Err(SortError::InsufficientMemory {
            required: 2 * block_bytes * MEM_FACTOR,
            provided: memory,
        });
    }
    Ok(m_blocks)
}

fn sort_run<V, C>(data: &mut [V], cmp: &C)
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V> + Sync,
{
    data.par_sort_unstable_by(to_ordering(cmp));
}

/// A sorted run buffer with its writes in flight.
struct RunFlush<V> {
    data: Arc<Vec<V>>,
    handles: Vec<IoHandle<()>>,
}

impl<V> RunFlush<V> {
    /// Waits for every write and reclaims the buffer. The first error (if
    /// any) is reported after all handles settled, so the buffer is always
    /// recovered.
    fn settle(self) -> (Vec<V>, Option<SortError>) {
        let mut first_err = None;
        for handle in self.handles {
            if let Err(err) = handle.wait() {
                first_err.get_or_insert(err);
            }
        }
        let data = Arc::try_unwrap(self.data)
            .unwrap_or_else(|_| panic!("device workers still hold the run buffer"));
        (data, first_err)
    }

    fn cancel(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }
}

/// Pads `data` to a whole number of blocks, captures the trigger entries and
/// starts one write per block. `data` must already be sorted.
fn flush_run<V, C>(
    storage: &Arc<Storage<V>>,
    cmp: &C,
    mut data: Vec<V>,
) -> (Run<V>, u64, RunFlush<V>)
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V>,
{
    let block_elems = storage.block_elems();
    let size = data.len() as u64;
    let num_blocks = div_ceil(size, block_elems as u64) as usize;
    data.resize(num_blocks * block_elems, cmp.max_value());

    let bids = storage.new_blocks(num_blocks);
    let data = Arc::new(data);
    let mut run = Vec::with_capacity(num_blocks);
    let mut handles = Vec::with_capacity(num_blocks);
    for (i, &bid) in bids.iter().enumerate() {
        let start = i * block_elems;
        run.push(TriggerEntry {
            bid,
            value: data[start],
        });
        handles.push(storage.write_shared(bid, Arc::clone(&data), start));
    }

    log::debug!("run of {} records flushed to {} blocks", size, num_blocks);

    (run, size, RunFlush { data, handles })
}

/// Forms sorted runs from an iterator.
pub struct RunsCreator<I, C>
where
    I: Iterator,
    I::Item: Pod + Send + Sync,
{
    input: Peekable<I>,
    cmp: C,
    storage: Arc<Storage<I::Item>>,
    /// Blocks per buffer half.
    m2: usize,
    result: Option<SortedRuns<I::Item>>,
}

impl<V, I, C> RunsCreator<I, C>
where
    V: Pod + Send + Sync,
    I: Iterator<Item = V>,
    C: SentinelOrd<V> + Sync,
{
    /// Creates a runs creator over `input` with `memory` bytes of buffer
    /// budget.
    pub fn new(
        input: I,
        cmp: C,
        storage: Arc<Storage<V>>,
        memory: usize,
    ) -> Result<Self, SortError> {
        verify_sentinel_ord(&cmp)?;
        let m_blocks = budget_blocks(memory, storage.block_bytes())?;
        Ok(RunsCreator {
            input: input.peekable(),
            cmp,
            storage,
            m2: m_blocks / 2,
            result: None,
        })
    }

    /// Records per run.
    pub fn num_elems_in_run(&self) -> usize {
        self.m2 * self.storage.block_elems()
    }

    /// Consumes the input and returns the sorted runs. Computed once; later
    /// calls return the same object.
    pub fn result(&mut self) -> Result<SortedRuns<V>, SortError> {
        if self.result.is_none() {
            self.result = Some(self.compute_result()?);
        }
        Ok(self.result.clone().unwrap())
    }

    fn fill(&mut self, buf: &mut Vec<V>) {
        let run_elems = self.m2 * self.storage.block_elems();
        while buf.len() < run_elems {
            match self.input.next() {
                Some(v) => buf.push(v),
                None => break,
            }
        }
    }

    fn compute_result(&mut self) -> Result<SortedRuns<V>, SortError> {
        let sruns = SortedRuns::new(Arc::clone(&self.storage));
        let block_elems = self.storage.block_elems();
        let run_elems = self.m2 * block_elems;

        let mut cur: Vec<V> = Vec::with_capacity(run_elems);
        self.fill(&mut cur);
        sort_run(&mut cur, &self.cmp);

        if cur.len() <= block_elems && self.input.peek().is_none() {
            // the whole input fits in one block, keep it in memory
            log::debug!("small input of {} records, no blocks allocated", cur.len());
            let mut data = sruns.lock();
            data.elements = cur.len() as u64;
            data.small_run = cur;
            drop(data);
            return Ok(sruns);
        }

        let mut prev_flush: Option<RunFlush<V>> = None;
        loop {
            let (run, size, flush) = flush_run(&self.storage, &self.cmp, cur);
            sruns.lock().add_run(run, size);

            // reclaim the half written two runs ago while this one is
            // still in flight
            let mut next = match prev_flush.take() {
                Some(prev) => {
                    let (mut buf, err) = prev.settle();
                    if let Some(err) = err {
                        let (_, _) = flush.settle();
                        return Err(err);
                    }
                    buf.clear();
                    buf
                }
                None => Vec::with_capacity(run_elems),
            };

            if self.input.peek().is_none() {
                let (_, err) = flush.settle();
                if let Some(err) = err {
                    return Err(err);
                }
                break;
            }

            self.fill(&mut next);
            sort_run(&mut next, &self.cmp);
            cur = next;
            prev_flush = Some(flush);
        }

        Ok(sruns)
    }
}

/// Forms sorted runs from records handed in by the caller.
pub struct PushRunsCreator<V, C>
where
    V: Pod + Send + Sync,
{
    cmp: C,
    storage: Arc<Storage<V>>,
    memory: usize,
    /// Blocks per buffer half.
    m2: usize,
    result: SortedRuns<V>,
    result_computed: bool,
    /// Accumulating half; `None` while buffers are deallocated.
    active: Option<Vec<V>>,
    /// Recycled half that is neither accumulating nor in flight.
    spare: Option<Vec<V>>,
    inflight: Option<RunFlush<V>>,
}

impl<V, C> PushRunsCreator<V, C>
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V> + Sync,
{
    pub fn new(cmp: C, storage: Arc<Storage<V>>, memory: usize) -> Result<Self, SortError> {
        verify_sentinel_ord(&cmp)?;
        let m_blocks = budget_blocks(memory, storage.block_bytes())?;
        let result = SortedRuns::new(Arc::clone(&storage));
        let mut creator = PushRunsCreator {
            cmp,
            storage,
            memory,
            m2: m_blocks / 2,
            result,
            result_computed: false,
            active: None,
            spare: None,
            inflight: None,
        };
        creator.allocate();
        Ok(creator)
    }

    /// Records per run.
    pub fn num_elems_in_run(&self) -> usize {
        self.m2 * self.storage.block_elems()
    }

    /// Byte budget this creator was constructed with.
    pub fn memory_used(&self) -> usize {
        self.memory
    }

    pub fn cmp(&self) -> &C {
        &self.cmp
    }

    /// Number of records pushed since the last `clear()`.
    pub fn size(&self) -> u64 {
        self.result.elements() + self.active.as_ref().map_or(0, |buf| buf.len() as u64)
    }

    /// Adds a record. Flushes the active half as a run when it reaches the
    /// run size.
    pub fn push(&mut self, value: V) -> Result<(), SortError> {
        assert!(!self.result_computed, "push after the result was computed");
        let active = self.active.as_mut().expect("buffers are deallocated");
        active.push(value);
        if active.len() == self.m2 * self.storage.block_elems() {
            self.flush_active()?;
        }
        Ok(())
    }

    fn flush_active(&mut self) -> Result<(), SortError> {
        // reclaim the previously flushed half before issuing new writes
        let next = match self.inflight.take() {
            Some(prev) => {
                let (mut buf, err) = prev.settle();
                if let Some(err) = err {
                    return Err(err);
                }
                buf.clear();
                buf
            }
            None => self
                .spare
                .take()
                .unwrap_or_else(|| Vec::with_capacity(self.m2 * self.storage.block_elems())),
        };

        let mut data = self.active.replace(next).unwrap();
        sort_run(&mut data, &self.cmp);
        let (run, size, flush) = flush_run(&self.storage, &self.cmp, data);
        self.result.lock().add_run(run, size);
        self.inflight = Some(flush);
        Ok(())
    }

    /// Finishes run formation and returns the sorted runs. The first call
    /// sorts and flushes the remainder; later calls return the same object.
    pub fn result(&mut self) -> Result<SortedRuns<V>, SortError> {
        if !self.result_computed {
            self.compute_result()?;
            self.result_computed = true;
        }
        Ok(self.result.clone())
    }

    fn compute_result(&mut self) -> Result<(), SortError> {
        let remainder = match self.active.as_mut() {
            Some(active) if !active.is_empty() => {
                let mut data = std::mem::take(active);
                sort_run(&mut data, &self.cmp);
                Some(data)
            }
            _ => None,
        };

        if let Some(mut data) = remainder {
            if data.len() <= self.storage.block_elems() && self.result.elements() == 0 {
                // whole input fits in one block, keep it in memory
                log::debug!("small input of {} records, no blocks allocated", data.len());
                let mut runs = self.result.lock();
                runs.elements = data.len() as u64;
                runs.small_run = data.clone();
                drop(runs);
                data.clear();
                self.active = Some(data);
            } else {
                let (run, size, flush) = flush_run(&self.storage, &self.cmp, data);
                self.result.lock().add_run(run, size);
                let (mut buf, err) = flush.settle();
                if let Some(err) = err {
                    return Err(err);
                }
                buf.clear();
                self.active = Some(buf);
            }
        }

        if let Some(prev) = self.inflight.take() {
            let (mut buf, err) = prev.settle();
            if let Some(err) = err {
                return Err(err);
            }
            buf.clear();
            self.spare = Some(buf);
        }
        Ok(())
    }

    /// Cancels outstanding writes, frees the blocks of any prior result and
    /// returns to the accepting state.
    pub fn clear(&mut self) {
        if let Some(prev) = self.inflight.take() {
            prev.cancel();
            let (mut buf, _) = prev.settle();
            buf.clear();
            self.spare = Some(buf);
        }
        self.result.clear();
        self.result_computed = false;
        if let Some(active) = self.active.as_mut() {
            active.clear();
        }
    }

    /// Allocates the accumulation buffers (no-op when present) and clears
    /// all state.
    pub fn allocate(&mut self) {
        if self.active.is_none() {
            let run_elems = self.m2 * self.storage.block_elems();
            self.active = Some(Vec::with_capacity(run_elems));
        }
        self.clear();
    }

    /// Finishes the result and releases the accumulation buffers.
    pub fn deallocate(&mut self) -> Result<(), SortError> {
        self.result()?;
        self.active = None;
        self.spare = None;
        Ok(())
    }
}

impl<V, C> Drop for PushRunsCreator<V, C>
where
    V: Pod + Send + Sync,
{
    fn drop(&mut self) {
        if let Some(flush) = self.inflight.take() {
            flush.cancel();
            let _ = flush.settle();
        }
    }
}

/// Writes runs from already-sorted groups of records; `finish()` closes the
/// current group, `result()` the whole input.
pub struct PresortedRunsCreator<V, C>
where
    V: Pod + Send + Sync,
{
    cmp: C,
    storage: Arc<Storage<V>>,
    result: SortedRuns<V>,
    writer: BlockWriter<V>,
    cur_block: Option<Block<V>>,
    offset: usize,
    cur_run: Run<V>,
    cur_run_elems: u64,
}

impl<V, C> PresortedRunsCreator<V, C>
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V>,
{
    pub fn new(cmp: C, storage: Arc<Storage<V>>, memory: usize) -> Result<Self, SortError> {
        verify_sentinel_ord(&cmp)?;
        let m_blocks = budget_blocks(memory, storage.block_bytes())?;
        let mut writer = BlockWriter::new(Arc::clone(&storage), m_blocks);
        let cur_block = writer.take_block()?;
        Ok(PresortedRunsCreator {
            cmp,
            result: SortedRuns::new(Arc::clone(&storage)),
            storage,
            writer,
            cur_block: Some(cur_block),
            offset: 0,
            cur_run: Vec::new(),
            cur_run_elems: 0,
        })
    }

    /// Appends a record to the current run; records must arrive in sorted
    /// order within a run.
    pub fn push(&mut self, value: V) -> Result<(), SortError> {
        let block = self.cur_block.as_mut().expect("creator already finished");
        block[self.offset] = value;
        self.offset += 1;
        self.cur_run_elems += 1;
        if self.offset == block.len() {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<(), SortError> {
        let block = self.cur_block.take().unwrap();
        let bid = self.storage.new_blocks(1)[0];
        self.cur_run.push(TriggerEntry {
            bid,
            value: block[0],
        });
        self.writer.write(bid, block);
        self.cur_block = Some(self.writer.take_block()?);
        self.offset = 0;
        Ok(())
    }

    /// Closes the current run and starts a fresh one. Closing an empty run
    /// is a no-op.
    pub fn finish(&mut self) -> Result<(), SortError> {
        if self.offset == 0 && self.cur_run.is_empty() {
            return Ok(());
        }

        if self.offset > 0 {
            let block = self.cur_block.as_mut().unwrap();
            let max = self.cmp.max_value();
            for slot in &mut block[self.offset..] {
                *slot = max;
            }
            self.flush_block()?;
        }

        let run = std::mem::take(&mut self.cur_run);
        let elems = self.cur_run_elems;
        self.cur_run_elems = 0;
        log::debug!("presorted run of {} records closed", elems);
        self.result.lock().add_run(run, elems);
        Ok(())
    }

    /// Closes the open run, waits for outstanding writes and returns the
    /// sorted runs.
    pub fn result(&mut self) -> Result<SortedRuns<V>, SortError> {
        self.finish()?;
        self.writer.flush()?;
        Ok(self.result.clone())
    }
}
