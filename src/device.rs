//! Block storage: identifier allocation and asynchronous device I/O.
//!
//! A [`Storage`] owns one backing temporary file per simulated disk, a free
//! list of block slots, and one worker thread per disk consuming a request
//! queue. Reads and writes return [`IoHandle`]s; the caller blocks on
//! `wait()` only at the points where the sorting pipeline genuinely needs
//! the data (delivering a prefetched block, reusing a write buffer).
//!
//! Buffers travel *through* requests: a read takes an owned [`Block`] and
//! hands it back filled from `wait()`; a run-sized buffer is written block
//! by block through a shared reference and reclaimed once all its writes
//! completed.

use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use bytemuck::Pod;
use crossbeam_channel as channel;

use crate::block::{Block, BlockId};
use crate::error::SortError;

/// Backing store configuration.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Directory for the backing files; the OS temporary directory if unset.
    pub dir: Option<PathBuf>,
    /// Number of simulated disks, each with its own file and worker thread.
    pub num_disks: usize,
    /// Records per block, fixed for the lifetime of the storage.
    pub block_elems: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        StorageOptions {
            dir: None,
            num_disks: 1,
            block_elems: 4096,
        }
    }
}

enum Request<V> {
    Read {
        offset: u64,
        block: Block<V>,
        done: Arc<Completion<Block<V>>>,
    },
    Write {
        offset: u64,
        block: Block<V>,
        done: Arc<Completion<Block<V>>>,
    },
    WriteShared {
        offset: u64,
        data: Arc<Vec<V>>,
        start: usize,
        len: usize,
        done: Arc<Completion<()>>,
    },
}

struct Completion<T> {
    state: Mutex<Option<Result<T, SortError>>>,
    cond: Condvar,
    cancelled: AtomicBool,
}

impl<T> Completion<T> {
    fn new() -> Arc<Self> {
        Arc::new(Completion {
            state: Mutex::new(None),
            cond: Condvar::new(),
            cancelled: AtomicBool::new(false),
        })
    }

    fn complete(&self, result: Result<T, SortError>) {
        let mut state = self.state.lock().unwrap();
        *state = Some(result);
        self.cond.notify_all();
    }
}

/// Completion handle for an in-flight device request.
///
/// `wait()` blocks until the worker finished the request and yields its
/// payload: the filled buffer for reads, the released buffer for writes.
#[must_use = "dropping a handle detaches the request; buffers are lost"]
pub struct IoHandle<T> {
    inner: Arc<Completion<T>>,
}

impl<T> IoHandle<T> {
    /// Blocks until the request completed and returns its payload.
    pub fn wait(self) -> Result<T, SortError> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(result) = state.take() {
                return result;
            }
            state = self.inner.cond.wait(state).unwrap();
        }
    }

    /// Requests cancellation. A request the worker has not picked up yet
    /// completes with [`SortError::Cancelled`] without touching the device;
    /// one already in progress runs to completion.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }
}

struct AllocState {
    /// Reusable slots per disk.
    free: Vec<Vec<u64>>,
    /// High-water slot per disk.
    next_slot: Vec<u64>,
    /// Round-robin striping position.
    rr: usize,
    in_use: usize,
}

/// Block manager and request queues over a set of temp-file backed disks.
pub struct Storage<V> {
    block_elems: usize,
    block_bytes: usize,
    queues: Vec<channel::Sender<Request<V>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    alloc: Mutex<AllocState>,
}

impl<V: Pod + Send + Sync> Storage<V> {
    /// Opens `opts.num_disks` backing files and spawns their worker threads.
    pub fn new(opts: StorageOptions) -> Result<Arc<Self>, SortError> {
        assert!(opts.num_disks > 0, "at least one disk is required");
        assert!(opts.block_elems > 0, "blocks must hold at least one record");

        let block_bytes = opts.block_elems * std::mem::size_of::<V>();
        let mut queues = Vec::with_capacity(opts.num_disks);
        let mut workers = Vec::with_capacity(opts.num_disks);

        for disk_no in 0..opts.num_disks {
            let file = match &opts.dir {
                Some(dir) => tempfile::tempfile_in(dir),
                None => tempfile::tempfile(),
            }
            .map_err(SortError::TempFile)?;

            let (tx, rx) = channel::unbounded::<Request<V>>();
            let thread = thread::Builder::new()
                .name(format!("runsort-disk-{}", disk_no))
                .spawn(move || run_device(file, rx))
                .map_err(SortError::TempFile)?;

            log::debug!("device {} online, block size {} bytes", disk_no, block_bytes);

            queues.push(tx);
            workers.push(thread);
        }

        Ok(Arc::new(Storage {
            block_elems: opts.block_elems,
            block_bytes,
            queues,
            workers: Mutex::new(workers),
            alloc: Mutex::new(AllocState {
                free: vec![Vec::new(); opts.num_disks],
                next_slot: vec![0; opts.num_disks],
                rr: 0,
                in_use: 0,
            }),
        }))
    }

    fn offset_of(&self, bid: BlockId) -> u64 {
        bid.slot * self.block_bytes as u64
    }

    /// Issues an asynchronous read of `bid` into `block`.
    pub fn read(&self, bid: BlockId, block: Block<V>) -> IoHandle<Block<V>> {
        debug_assert_eq!(block.len(), self.block_elems);
        let done = Completion::new();
        let handle = IoHandle {
            inner: Arc::clone(&done),
        };
        self.queues[bid.disk as usize]
            .send(Request::Read {
                offset: self.offset_of(bid),
                block,
                done,
            })
            .expect("device worker terminated");
        handle
    }

    /// Issues an asynchronous write of `block` to `bid`; `wait()` releases
    /// the buffer back to the caller.
    pub fn write(&self, bid: BlockId, block: Block<V>) -> IoHandle<Block<V>> {
        debug_assert_eq!(block.len(), self.block_elems);
        let done = Completion::new();
        let handle = IoHandle {
            inner: Arc::clone(&done),
        };
        self.queues[bid.disk as usize]
            .send(Request::Write {
                offset: self.offset_of(bid),
                block,
                done,
            })
            .expect("device worker terminated");
        handle
    }

    /// Writes one block-sized window of a shared run buffer to `bid`.
    ///
    /// The worker drops its buffer reference before signalling completion,
    /// so once every window of a buffer has been waited on the caller holds
    /// the only reference again.
    pub fn write_shared(
        &self,
        bid: BlockId,
        data: Arc<Vec<V>>,
        start: usize,
    ) -> IoHandle<()> {
        debug_assert!(start + self.block_elems <= data.len());
        let done = Completion::new();
        let handle = IoHandle {
            inner: Arc::clone(&done),
        };
        self.queues[bid.disk as usize]
            .send(Request::WriteShared {
                offset: self.offset_of(bid),
                data,
                start,
                len: self.block_elems,
                done,
            })
            .expect("device worker terminated");
        handle
    }
}

impl<V> Storage<V> {
    /// Records per block.
    pub fn block_elems(&self) -> usize {
        self.block_elems
    }

    /// Bytes per block.
    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    pub fn num_disks(&self) -> usize {
        self.queues.len()
    }

    /// Number of allocated, not yet freed block identifiers.
    pub fn blocks_in_use(&self) -> usize {
        self.alloc.lock().unwrap().in_use
    }

    /// Allocates `n` block identifiers, striped round-robin across disks.
    /// Freed slots are reused before the files grow.
    pub fn new_blocks(&self, n: usize) -> Vec<BlockId> {
        let mut alloc = self.alloc.lock().unwrap();
        let num_disks = self.queues.len();
        let mut bids = Vec::with_capacity(n);
        for _ in 0..n {
            let disk = alloc.rr % num_disks;
            alloc.rr = alloc.rr.wrapping_add(1);
            let slot = match alloc.free[disk].pop() {
                Some(slot) => slot,
                None => {
                    let slot = alloc.next_slot[disk];
                    alloc.next_slot[disk] += 1;
                    slot
                }
            };
            bids.push(BlockId {
                disk: disk as u32,
                slot,
            });
        }
        alloc.in_use += n;
        bids
    }

    /// Returns block identifiers to the free pool.
    pub fn delete_blocks(&self, bids: &[BlockId]) {
        if bids.is_empty() {
            return;
        }
        let mut alloc = self.alloc.lock().unwrap();
        for bid in bids {
            alloc.free[bid.disk as usize].push(bid.slot);
        }
        alloc.in_use -= bids.len();
    }
}

impl<V> Drop for Storage<V> {
    fn drop(&mut self) {
        // Disconnecting the queues lets the workers drain and exit.
        self.queues.clear();
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_device<V: Pod>(file: fs::File, rx: channel::Receiver<Request<V>>) {
    while let Ok(req) = rx.recv() {
        match req {
            Request::Read {
                offset,
                mut block,
                done,
            } => {
                if done.cancelled.load(Ordering::Relaxed) {
                    done.complete(Err(SortError::Cancelled));
                    continue;
                }
                let result = file
                    .read_exact_at(block.as_bytes_mut(), offset)
                    .map(|_| block)
                    .map_err(SortError::Io);
                done.complete(result);
            }
            Request::Write { offset, block, done } => {
                if done.cancelled.load(Ordering::Relaxed) {
                    done.complete(Err(SortError::Cancelled));
                    continue;
                }
                let result = file
                    .write_all_at(block.as_bytes(), offset)
                    .map(|_| block)
                    .map_err(SortError::Io);
                done.complete(result);
            }
            Request::WriteShared {
                offset,
                data,
                start,
                len,
                done,
            } => {
                let result = if done.cancelled.load(Ordering::Relaxed) {
                    Err(SortError::Cancelled)
                } else {
                    write_window(&file, &data[start..start + len], offset)
                };
                // The buffer reference must be gone before completion is
                // observable, otherwise the creator cannot reclaim it.
                drop(data);
                done.complete(result);
            }
        }
    }
}

fn write_window<V: Pod>(file: &fs::File, window: &[V], offset: u64) -> Result<(), SortError> {
    file.write_all_at(bytemuck::cast_slice(window), offset)
        .map_err(SortError::Io)
}

/// Write-behind pool: a fixed set of blocks cycling between the caller and
/// outstanding writes. `take_block` blocks once every buffer is in flight.
pub struct BlockWriter<V> {
    storage: Arc<Storage<V>>,
    free: Vec<Block<V>>,
    pending: VecDeque<IoHandle<Block<V>>>,
}

impl<V: Pod + Send + Sync> BlockWriter<V> {
    pub fn new(storage: Arc<Storage<V>>, n_buffers: usize) -> Self {
        assert!(n_buffers > 0);
        let free = (0..n_buffers)
            .map(|_| Block::new(storage.block_elems()))
            .collect();
        BlockWriter {
            storage,
            free,
            pending: VecDeque::new(),
        }
    }

    /// Hands out a free block, waiting on the oldest outstanding write when
    /// the pool is exhausted.
    pub fn take_block(&mut self) -> Result<Block<V>, SortError> {
        if let Some(block) = self.free.pop() {
            return Ok(block);
        }
        let oldest = self
            .pending
            .pop_front()
            .expect("block writer pool lost its buffers");
        oldest.wait()
    }

    /// Queues `block` for writing to `bid`.
    pub fn write(&mut self, bid: BlockId, block: Block<V>) {
        self.pending.push_back(self.storage.write(bid, block));
    }

    /// Waits for all outstanding writes.
    pub fn flush(&mut self) -> Result<(), SortError> {
        while let Some(handle) = self.pending.pop_front() {
            self.free.push(handle.wait()?);
        }
        Ok(())
    }
}
