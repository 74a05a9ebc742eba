//! `runsort` is an external-memory sorter: it orders arbitrarily large
//! sequences of fixed-size records using a bounded amount of RAM, keeping
//! the bulk of the data in blocks on backing storage.
//!
//! Sorting runs in two phases. The first phase cuts the input into
//! memory-sized runs, sorts each run in parallel and writes it to block
//! storage with write-behind. The second phase merges all runs through a
//! tournament tree fed by a prefetcher, overlapping device reads with
//! merging, and serves the result through a lazy pull cursor. When the
//! number of runs exceeds what the memory budget can buffer, recursive
//! merge passes reduce it first.
//!
//! # Overview
//!
//! * **Bounded memory:** both phases honor caller-provided byte budgets; a
//!   sort never holds more than the configured number of blocks in RAM.
//! * **Asynchronous I/O:** block reads and writes run on per-disk worker
//!   threads and overlap with sorting and merging; data can be striped
//!   round-robin over several backing files.
//! * **Raw fixed-size records:** any [`bytemuck::Pod`] type works as a
//!   record; blocks cross the device boundary as plain byte arrays.
//! * **Custom orderings:** sorting uses a strict weak ordering with
//!   sentinel values ([`SentinelOrd`]); [`NaturalOrder`] covers primitive
//!   keys.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use runsort::{NaturalOrder, Sorter, Storage, StorageOptions};
//!
//! fn main() {
//!     let storage: Arc<Storage<u64>> = Storage::new(StorageOptions::default()).unwrap();
//!     let mut sorter = Sorter::new(NaturalOrder::new(), storage, 64 << 20).unwrap();
//!
//!     for value in [40u64, 2, 42, 7] {
//!         sorter.push(value).unwrap();
//!     }
//!
//!     sorter.sort().unwrap();
//!     while !sorter.empty() {
//!         println!("{}", sorter.current());
//!         sorter.advance().unwrap();
//!     }
//! }
//! ```

pub mod block;
pub mod create;
pub mod device;
pub mod error;
pub mod losertree;
pub mod merge;
pub mod order;
pub mod prefetch;
pub mod runs;
pub mod sorter;

pub use block::{Block, BlockId};
pub use create::{PresortedRunsCreator, PushRunsCreator, RunsCreator};
pub use device::{BlockWriter, IoHandle, Storage, StorageOptions};
pub use error::SortError;
pub use merge::RunsMerger;
pub use order::{Bounded, NaturalOrder, SentinelOrd};
pub use runs::{check_sorted_runs, trigger_ordering, Run, SortedRuns, TriggerEntry};
pub use sorter::{SortStream, Sorter};
