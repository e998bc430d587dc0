//! Offset-returning arena allocator with a coalescing free list.
//!
//! The allocator runs the whole planning phase on offsets alone: `alloc` and
//! `free` shuffle bookkeeping, and no device memory is touched until the
//! first [`ArenaAllocator::base`] call materialises a single backing region
//! of `peak` bytes. This lets a graph discover its exact footprint before
//! the runtime is asked for anything.
//!
//! Allocation is lowest-offset first-fit with a tail-extension fallback:
//! new blocks are biased low in the arena, which keeps the tail cheap to
//! extend when a just-freed tail block is undersized. Freeing coalesces
//! with both neighbours, so the free list never holds two adjacent blocks.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::runtime::RuntimeRef;

/// Fixed block alignment, the widest scalar a tensor dtype can carry.
pub const ARENA_ALIGNMENT: usize = std::mem::size_of::<u64>();

/// Snapshot of the allocator's high-water marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// First offset past the last live byte, ignoring the free list.
    pub used: usize,
    /// Maximum `used` ever observed; the size requested from the runtime.
    pub peak: usize,
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "used memory: {}, peak memory: {}", self.used, self.peak)
    }
}

pub struct ArenaAllocator {
    runtime: RuntimeRef,
    alignment: usize,
    used: usize,
    peak: usize,
    base: Option<NonNull<u8>>,
    /// Coalesced free regions below `used`, keyed and ordered by offset.
    free_blocks: BTreeMap<usize, usize>,
}

impl ArenaAllocator {
    pub fn new(runtime: RuntimeRef) -> Self {
        ArenaAllocator {
            runtime,
            alignment: ARENA_ALIGNMENT,
            used: 0,
            peak: 0,
            base: None,
            free_blocks: BTreeMap::new(),
        }
    }

    /// Reserves `size` bytes and returns the offset of the block within the
    /// (not yet materialised) arena.
    ///
    /// Panics when called after [`ArenaAllocator::base`]: a materialised
    /// arena can no longer be re-planned.
    pub fn alloc(&mut self, size: usize) -> usize {
        assert!(
            self.base.is_none(),
            "arena is already materialised, no further planning is possible"
        );
        let size = self.aligned(size);

        // Lowest-offset block that fits; carve from its low end.
        let mut found = None;
        for (&offset, &block_size) in self.free_blocks.iter() {
            if block_size >= size {
                found = Some((offset, block_size));
                break;
            }
        }
        if let Some((offset, block_size)) = found {
            self.free_blocks.remove(&offset);
            if block_size > size {
                self.free_blocks.insert(offset + size, block_size - size);
            }
            return offset;
        }

        // An undersized block touching the tail can be grown in place.
        if let Some((&offset, &block_size)) = self.free_blocks.iter().next_back() {
            if offset + block_size == self.used {
                self.free_blocks.remove(&offset);
                self.used += size - block_size;
                self.peak = self.peak.max(self.used);
                return offset;
            }
        }

        let offset = self.used;
        self.used += size;
        self.peak = self.peak.max(self.used);
        offset
    }

    /// Returns a previously reserved block to the free list, merging it with
    /// adjacent free neighbours.
    ///
    /// Panics when called after [`ArenaAllocator::base`].
    pub fn free(&mut self, offset: usize, size: usize) {
        assert!(
            self.base.is_none(),
            "arena is already materialised, no further planning is possible"
        );
        let mut offset = offset;
        let mut size = self.aligned(size);

        if let Some((&prev_offset, &prev_size)) = self.free_blocks.range(..offset).next_back() {
            if prev_offset + prev_size == offset {
                self.free_blocks.remove(&prev_offset);
                offset = prev_offset;
                size += prev_size;
            }
        }
        if let Some((&next_offset, &next_size)) = self.free_blocks.range(offset..).next() {
            if offset + size == next_offset {
                self.free_blocks.remove(&next_offset);
                size += next_size;
            }
        }
        self.free_blocks.insert(offset, size);
    }

    /// Materialises the arena on first call and returns its base address.
    ///
    /// The runtime is asked for exactly `peak` bytes; subsequent calls return
    /// the cached base.
    pub fn base(&mut self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.base {
            return Ok(ptr);
        }
        let ptr = NonNull::new(self.runtime.alloc(self.peak))
            .ok_or(Error::AllocFailed { bytes: self.peak })?;
        self.base = Some(ptr);
        Ok(ptr)
    }

    /// Diagnostic summary of the current high-water marks.
    pub fn info(&self) -> MemoryInfo {
        MemoryInfo {
            used: self.used,
            peak: self.peak,
        }
    }

    pub fn is_materialised(&self) -> bool {
        self.base.is_some()
    }

    #[cfg(test)]
    fn free_list(&self) -> Vec<(usize, usize)> {
        self.free_blocks.iter().map(|(&o, &s)| (o, s)).collect()
    }

    fn aligned(&self, size: usize) -> usize {
        (size + self.alignment - 1) / self.alignment * self.alignment
    }
}

impl Drop for ArenaAllocator {
    fn drop(&mut self) {
        if let Some(ptr) = self.base.take() {
            self.runtime.dealloc(ptr.as_ptr());
        }
    }
}

impl fmt::Debug for ArenaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("runtime", &self.runtime.name())
            .field("used", &self.used)
            .field("peak", &self.peak)
            .field("materialised", &self.base.is_some())
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}
