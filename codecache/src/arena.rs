//! Best-fit allocator over a fixed address range.
//!
//! Bookkeeping lives on the Rust heap, never inside the managed range: the
//! code region is not writable outside a write scope, and side tables in the
//! data region must not be disturbed by allocator metadata.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
    ptr::NonNull,
};

use crate::system::{checked_align_up, is_aligned};

#[derive(Debug)]
pub struct Arena {
    name: &'static str,
    base: usize,
    size: usize,
    granule: usize,
    /// start -> length
    free_by_addr: BTreeMap<usize, usize>,
    /// (length, start)
    free_by_size: BTreeSet<(usize, usize)>,
    /// start -> length of every live block
    live: HashMap<usize, usize, ahash::RandomState>,
    bytes_allocated: usize,
}

impl Arena {
    /// Creates an arena managing `[base, base + size)` in units of `granule`.
    pub fn new(
        name: &'static str,
        base: NonNull<u8>,
        size: usize,
        granule: usize,
    ) -> Self {
        assert!(granule.is_power_of_two());
        let base = base.as_ptr() as usize;
        debug_assert!(is_aligned(base, granule));
        let size = size & !(granule - 1);

        let mut arena = Self {
            name,
            base,
            size,
            granule,
            free_by_addr: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            live: HashMap::default(),
            bytes_allocated: 0,
        };
        if size > 0 {
            arena.insert_free(base, size);
        }
        arena
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn granule(&self) -> usize {
        self.granule
    }

    /// Bytes handed out and not yet freed, rounded to the granule.
    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.base + self.size
    }

    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    pub fn largest_free_block(&self) -> usize {
        self.free_by_size.last().map_or(0, |&(len, _)| len)
    }

    /// Size of the live block starting at `ptr`.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.live.get(&(ptr.as_ptr() as usize)).copied()
    }

    /// Allocates `size` bytes aligned to `align`, picking the smallest free
    /// block that fits. Returns `None` when no block fits.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(self.granule);
        let size = checked_align_up(size.max(1), self.granule)?;
        if size > self.size {
            return None;
        }

        let (len, start, aligned) = self
            .free_by_size
            .range((Bound::Included((size, 0)), Bound::Unbounded))
            .find_map(|&(len, start)| {
                let aligned = checked_align_up(start, align)?;
                (aligned.checked_add(size)? <= start + len).then_some((len, start, aligned))
            })?;

        self.remove_free(start, len);
        if aligned > start {
            self.insert_free(start, aligned - start);
        }
        let end = start + len;
        if aligned + size < end {
            self.insert_free(aligned + size, end - (aligned + size));
        }

        self.live.insert(aligned, size);
        self.bytes_allocated += size;
        log::trace!("{}: alloc {size} bytes at {aligned:#x}", self.name);
        NonNull::new(aligned as *mut u8)
    }

    /// Returns a block to the arena, merging it with free neighbours.
    ///
    /// Freeing an address that is not the start of a live block is reported
    /// and ignored.
    pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
        let start = ptr.as_ptr() as usize;
        let Some(len) = self.live.remove(&start) else {
            log::warn!(
                "{}: ignoring free of {start:#x}, not a live block",
                self.name
            );
            return false;
        };
        self.bytes_allocated -= len;
        log::trace!("{}: free {len} bytes at {start:#x}", self.name);

        let mut start = start;
        let mut len = len;

        if let Some((&prev, &prev_len)) = self.free_by_addr.range(..start).next_back()
            && prev + prev_len == start
        {
            self.remove_free(prev, prev_len);
            start = prev;
            len += prev_len;
        }

        let end = start + len;
        if let Some(&next_len) = self.free_by_addr.get(&end) {
            self.remove_free(end, next_len);
            len += next_len;
        }

        self.insert_free(start, len);
        true
    }

    fn insert_free(&mut self, start: usize, len: usize) {
        self.free_by_addr.insert(start, len);
        self.free_by_size.insert((len, start));
    }

    fn remove_free(&mut self, start: usize, len: usize) {
        self.free_by_addr.remove(&start);
        self.free_by_size.remove(&(len, start));
    }
}
