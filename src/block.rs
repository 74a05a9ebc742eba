//! Fixed-size typed blocks and block identifiers.

use std::ops::{Deref, DerefMut};

use bytemuck::Pod;

/// Opaque handle to one block slot on a backing device.
///
/// Identifiers are ephemeral: they are only meaningful to the [`Storage`]
/// that allocated them and only for its lifetime.
///
/// [`Storage`]: crate::device::Storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub(crate) disk: u32,
    pub(crate) slot: u64,
}

/// A contiguous array of exactly `block_elems` records.
///
/// The element count is fixed when the block is allocated and never changes;
/// a block crosses the device boundary as a raw byte slice.
pub struct Block<V> {
    data: Vec<V>,
}

impl<V: Pod> Block<V> {
    /// Allocates a zero-filled block of `block_elems` records.
    pub fn new(block_elems: usize) -> Self {
        Block {
            data: vec![V::zeroed(); block_elems],
        }
    }

    /// Number of records in the block.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[V] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [V] {
        &mut self.data
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.data)
    }
}

impl<V> Deref for Block<V> {
    type Target = [V];

    fn deref(&self) -> &[V] {
        &self.data
    }
}

impl<V> DerefMut for Block<V> {
    fn deref_mut(&mut self) -> &mut [V] {
        &mut self.data
    }
}

/// Ceiling division, used wherever element counts are turned into block
/// counts.
pub(crate) fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}
