//! The two-phase sorter container and the pull-stream composition.

use std::sync::Arc;

use bytemuck::Pod;

use crate::create::{PushRunsCreator, RunsCreator};
use crate::device::Storage;
use crate::error::SortError;
use crate::merge::RunsMerger;
use crate::order::SentinelOrd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Input,
    Output,
}

/// External sorter container.
///
/// In the `INPUT` state records are added with [`push`](Self::push) and
/// presorted into runs of the creator's memory size. [`sort`](Self::sort)
/// switches to the `OUTPUT` state, where the records come back in sorted
/// order through the pull cursor ([`current`](Self::current),
/// [`advance`](Self::advance), [`empty`](Self::empty)).
///
/// [`rewind`](Self::rewind) restarts the output phase from the beginning —
/// the sorted runs stay on disk until [`clear`](Self::clear) or drop — and
/// [`clear`](Self::clear) discards everything and returns to `INPUT`.
pub struct Sorter<V, C>
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V> + Sync,
{
    state: State,
    creator: PushRunsCreator<V, C>,
    merger: RunsMerger<V, C>,
}

impl<V, C> Sorter<V, C>
where
    V: Pod + Send + Sync,
    C: SentinelOrd<V> + Sync,
{
    /// Creates a sorter that uses `memory` bytes in each phase.
    pub fn new(cmp: C, storage: Arc<Storage<V>>, memory: usize) -> Result<Self, SortError> {
        Sorter::with_memories(cmp, storage, memory, memory)
    }

    /// Creates a sorter with separate byte budgets for run creation and
    /// merging.
    pub fn with_memories(
        cmp: C,
        storage: Arc<Storage<V>>,
        creator_memory: usize,
        merger_memory: usize,
    ) -> Result<Self, SortError> {
        Ok(Sorter {
            state: State::Input,
            creator: PushRunsCreator::new(cmp.clone(), storage, creator_memory)?,
            merger: RunsMerger::new(cmp, merger_memory)?,
        })
    }

    /// Adds a record (`INPUT` state only).
    pub fn push(&mut self, value: V) -> Result<(), SortError> {
        assert_eq!(self.state, State::Input, "push in output state");
        self.creator.push(value)
    }

    /// Finishes the input phase, frees the creator buffers and starts the
    /// sorted output phase.
    pub fn sort(&mut self) -> Result<(), SortError> {
        if self.state == State::Output {
            self.merger.deallocate();
        }
        self.creator.deallocate()?;
        let runs = self.creator.result()?;
        self.merger.initialize(runs)?;
        self.state = State::Output;
        Ok(())
    }

    /// Like [`sort`](Self::sort) with a one-off merger budget.
    pub fn sort_with_memory(&mut self, merger_memory: usize) -> Result<(), SortError> {
        self.merger.set_memory(merger_memory);
        self.sort()
    }

    /// Starts the output phase keeping the creator buffers allocated, so a
    /// later [`clear`](Self::clear) does not have to reallocate them.
    pub fn sort_reuse(&mut self) -> Result<(), SortError> {
        assert_eq!(self.state, State::Input, "sort_reuse in output state");
        let runs = self.creator.result()?;
        self.merger.initialize(runs)?;
        self.state = State::Output;
        Ok(())
    }

    /// Restarts the output phase from the first record (`OUTPUT` state
    /// only).
    pub fn rewind(&mut self) -> Result<(), SortError> {
        assert_eq!(self.state, State::Output, "rewind in input state");
        self.merger.deallocate();
        self.state = State::Input;
        self.sort()
    }

    /// Discards all records and returns to the `INPUT` state.
    pub fn clear(&mut self) {
        if self.state == State::Output {
            self.merger.deallocate();
        }
        self.creator.allocate();
        self.state = State::Input;
    }

    /// Releases the input buffers; the result (if any) stays readable.
    pub fn finish(&mut self) -> Result<(), SortError> {
        if self.state == State::Output {
            self.merger.deallocate();
        }
        self.creator.deallocate()
    }

    /// Releases the input buffers and discards the sorted result.
    pub fn finish_clear(&mut self) -> Result<(), SortError> {
        if self.state == State::Output {
            self.merger.deallocate();
            self.creator.result()?.clear();
        }
        self.creator.deallocate()
    }

    /// Changes the merger's byte budget for subsequent sorts.
    pub fn set_merger_memory(&mut self, merger_memory: usize) {
        self.merger.set_memory(merger_memory);
    }

    /// Records pushed so far (`INPUT`) or records remaining (`OUTPUT`).
    pub fn size(&self) -> u64 {
        match self.state {
            State::Input => self.creator.size(),
            State::Output => self.merger.size(),
        }
    }

    /// True once the sorted stream is exhausted (`OUTPUT` state only).
    pub fn empty(&self) -> bool {
        assert_eq!(self.state, State::Output, "empty() in input state");
        self.merger.empty()
    }

    /// The current record of the sorted stream.
    pub fn current(&self) -> &V {
        assert_eq!(self.state, State::Output, "current() in input state");
        self.merger.current()
    }

    /// Alias for [`current`](Self::current).
    pub fn peek(&self) -> &V {
        self.current()
    }

    /// Steps the sorted stream to the next record.
    pub fn advance(&mut self) -> Result<(), SortError> {
        assert_eq!(self.state, State::Output, "advance() in input state");
        self.merger.advance()
    }

    /// Records per run formed in the input phase.
    pub fn num_elems_in_run(&self) -> usize {
        self.creator.num_elems_in_run()
    }

    /// Records per merged output block.
    pub fn output_block_size(&self) -> usize {
        self.merger.output_block_size()
    }

    /// True when the next [`advance`](Self::advance) has to merge a new
    /// output block and may wait on the device.
    pub fn next_output_would_block(&self) -> bool {
        self.merger.next_output_would_block()
    }
}

/// Lazily sorted stream over an input iterator: the pull composition of a
/// runs creator and a runs merger.
pub struct SortStream<I, C>
where
    I: Iterator,
    I::Item: Pod + Send + Sync,
{
    merger: RunsMerger<I::Item, C>,
}

impl<V, I, C> SortStream<I, C>
where
    V: Pod + Send + Sync,
    I: Iterator<Item = V>,
    C: SentinelOrd<V> + Sync,
{
    /// Sorts `input` with `memory` bytes for each phase. Run creation
    /// happens here; merging is lazy.
    pub fn new(
        input: I,
        cmp: C,
        storage: Arc<Storage<V>>,
        memory: usize,
    ) -> Result<Self, SortError> {
        SortStream::with_memories(input, cmp, storage, memory, memory)
    }

    /// Sorts `input` with separate budgets for run creation and merging.
    pub fn with_memories(
        input: I,
        cmp: C,
        storage: Arc<Storage<V>>,
        creator_memory: usize,
        merger_memory: usize,
    ) -> Result<Self, SortError> {
        let mut creator = RunsCreator::new(input, cmp.clone(), storage, creator_memory)?;
        let mut merger = RunsMerger::new(cmp, merger_memory)?;
        merger.initialize(creator.result()?)?;
        Ok(SortStream { merger })
    }

    /// Records remaining.
    pub fn size(&self) -> u64 {
        self.merger.size()
    }
}

impl<V, I, C> Iterator for SortStream<I, C>
where
    V: Pod + Send + Sync,
    I: Iterator<Item = V>,
    C: SentinelOrd<V> + Sync,
{
    type Item = Result<V, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.merger.empty() {
            return None;
        }
        let value = *self.merger.current();
        match self.merger.advance() {
            Ok(()) => Some(Ok(value)),
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::*;

    use super::{SortStream, Sorter};
    use crate::device::{Storage, StorageOptions};
    use crate::order::NaturalOrder;

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

    fn sorter(storage: &Arc<Storage<u32>>) -> Sorter<u32, NaturalOrder<u32>> {
        Sorter::with_memories(
            NaturalOrder::new(),
            Arc::clone(storage),
            mem_for_blocks(2),
            8 * BLOCK_BYTES,
        )
        .unwrap()
    }

    fn drain(sorter: &mut Sorter<u32, NaturalOrder<u32>>) -> Vec<u32> {
        let mut out = Vec::new();
        while !sorter.empty() {
            out.push(*sorter.current());
            sorter.advance().unwrap();
        }
        out
    }

    #[rstest]
    fn test_empty_input(storage: Arc<Storage<u32>>) {
        let mut sorter = sorter(&storage);
        assert_eq!(sorter.size(), 0);
        sorter.sort().unwrap();
        assert_eq!(sorter.size(), 0);
        assert!(sorter.empty());
    }

    #[rstest]
    fn test_single_record(storage: Arc<Storage<u32>>) {
        let mut sorter = sorter(&storage);
        sorter.push(5).unwrap();
        sorter.sort().unwrap();
        assert_eq!(drain(&mut sorter), vec![5]);
    }

    #[rstest]
    fn test_rewind_replays_identically(storage: Arc<Storage<u32>>) {
        let mut sorter = sorter(&storage);
        for v in [2u32, 2, 1, 1, 3, 3] {
            sorter.push(v).unwrap();
        }
        sorter.sort().unwrap();
        let first = drain(&mut sorter);
        assert_eq!(first, vec![1, 1, 2, 2, 3, 3]);

        sorter.rewind().unwrap();
        assert_eq!(sorter.size(), 6);
        assert_eq!(drain(&mut sorter), first);
    }

    #[rstest]
    fn test_rewind_with_external_runs(storage: Arc<Storage<u32>>) {
        let mut sorter = sorter(&storage);
        for v in (0..100u32).rev() {
            sorter.push(v).unwrap();
        }
        sorter.sort().unwrap();
        let first = drain(&mut sorter);
        assert_eq!(first, (0..100).collect::<Vec<u32>>());

        // blocks must survive the first consumption
        sorter.rewind().unwrap();
        assert_eq!(drain(&mut sorter), first);
    }

    #[rstest]
    fn test_clear_then_same_input_is_identical(storage: Arc<Storage<u32>>) {
        let mut rng = StdRng::seed_from_u64(42);
        let input: Vec<u32> = (0..300).map(|_| rng.gen()).collect();

        let mut sorter = sorter(&storage);
        for &v in &input {
            sorter.push(v).unwrap();
        }
        sorter.sort().unwrap();
        let first = drain(&mut sorter);

        sorter.clear();
        assert_eq!(sorter.size(), 0);
        for &v in &input {
            sorter.push(v).unwrap();
        }
        sorter.sort().unwrap();
        let second = drain(&mut sorter);

        assert_eq!(first, second);
        let mut expected = input;
        expected.sort_unstable();
        assert_eq!(first, expected);
    }

    #[rstest]
    fn test_sorting_sorted_input_is_identity(storage: Arc<Storage<u32>>) {
        let input: Vec<u32> = (0..200).collect();
        let mut sorter = sorter(&storage);
        for &v in &input {
            sorter.push(v).unwrap();
        }
        sorter.sort().unwrap();
        assert_eq!(drain(&mut sorter), input);
    }

    #[rstest]
    fn test_sort_reuse_keeps_buffers_for_clear(storage: Arc<Storage<u32>>) {
        let mut sorter = sorter(&storage);
        for v in [9u32, 4, 7, 1] {
            sorter.push(v).unwrap();
        }
        sorter.sort_reuse().unwrap();
        assert_eq!(drain(&mut sorter), vec![1, 4, 7, 9]);

        sorter.clear();
        for v in [8u32, 6] {
            sorter.push(v).unwrap();
        }
        sorter.sort().unwrap();
        assert_eq!(drain(&mut sorter), vec![6, 8]);
    }

    #[rstest]
    fn test_push_counts_and_introspection(storage: Arc<Storage<u32>>) {
        let mut sorter = sorter(&storage);
        assert_eq!(sorter.num_elems_in_run(), BLOCK_ELEMS);
        for i in 0..20u32 {
            sorter.push(i).unwrap();
            assert_eq!(sorter.size(), u64::from(i) + 1);
        }
        sorter.sort().unwrap();
        assert_eq!(sorter.size(), 20);
        assert_eq!(sorter.output_block_size(), BLOCK_ELEMS);

        // the first block holds eight records; the eighth read would block
        let mut would_block_seen = false;
        while !sorter.empty() {
            would_block_seen |= sorter.next_output_would_block();
            sorter.advance().unwrap();
        }
        assert!(would_block_seen);
    }

    #[rstest]
    fn test_sort_with_memory_override(storage: Arc<Storage<u32>>) {
        let mut rng = StdRng::seed_from_u64(3);
        let input: Vec<u32> = (0..500).map(|_| rng.gen_range(0..100)).collect();

        let mut sorter = sorter(&storage);
        for &v in &input {
            sorter.push(v).unwrap();
        }
        // a budget forcing recursive merging must not change the output
        sorter.sort_with_memory(7 * BLOCK_BYTES).unwrap();
        let out = drain(&mut sorter);

        let mut expected = input;
        expected.sort_unstable();
        assert_eq!(out, expected);
    }

    #[rstest]
    fn test_finish_clear_releases_everything(storage: Arc<Storage<u32>>) {
        let mut sorter = sorter(&storage);
        for v in (0..50u32).rev() {
            sorter.push(v).unwrap();
        }
        sorter.sort().unwrap();
        assert_eq!(*sorter.current(), 0);
        sorter.finish_clear().unwrap();
        assert_eq!(storage.blocks_in_use(), 0);
    }

    #[rstest]
    #[should_panic(expected = "push in output state")]
    fn test_push_after_sort_panics(storage: Arc<Storage<u32>>) {
        let mut sorter = sorter(&storage);
        sorter.push(1).unwrap();
        sorter.sort().unwrap();
        let _ = sorter.push(2);
    }

    #[rstest]
    fn test_sort_stream(storage: Arc<Storage<u32>>) {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let input: Vec<u32> = (0..1000).map(|_| rng.gen()).collect();

        let stream = SortStream::with_memories(
            input.clone().into_iter(),
            NaturalOrder::new(),
            Arc::clone(&storage),
            mem_for_blocks(8),
            32 * BLOCK_BYTES,
        )
        .unwrap();
        assert_eq!(stream.size(), 1000);

        let out: Result<Vec<u32>, _> = stream.collect();
        let out = out.unwrap();

        let mut expected = input;
        expected.sort_unstable();
        assert_eq!(out, expected);
    }
}
