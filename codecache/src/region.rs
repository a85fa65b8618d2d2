//! The two adjacent regions backing the code cache.
//!
//! One anonymous mapping is split in two: the low quarter holds side tables
//! (data region), the rest holds method headers and machine code (code
//! region). Keeping both in one mapping bounds their distance, so a method
//! header can reach its side tables through 32-bit backward offsets.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::{
    CodeCacheError,
    system::{
        Protection, align_up, map_memory, name_memory, page_size,
        protect_memory, unmap_memory,
    },
};

/// Largest capacity accepted by [`RegionPair::create`].
pub const MAX_CAPACITY: usize = 1 << 30;

#[derive(Debug)]
pub struct MemoryRegion {
    name: &'static str,
    begin: NonNull<u8>,
    size: usize,
}

impl MemoryRegion {
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.begin
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin.as_ptr()
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.begin.as_ptr().wrapping_add(self.size)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let begin = self.begin() as usize;
        begin <= addr && addr < begin + self.size
    }

    /// Whether `[addr, addr + len)` lies entirely inside the region.
    #[inline]
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        let begin = self.begin() as usize;
        addr >= begin
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= begin + self.size)
    }
}

#[derive(Debug)]
pub struct RegionPair {
    mapping: NonNull<u8>,
    mapped_size: usize,
    data: MemoryRegion,
    code: MemoryRegion,
    code_protection: AtomicU8,
}

// SAFETY: the mapping is owned by the pair; mutation of its contents is
// serialized by the cache monitor.
unsafe impl Send for RegionPair {}
// SAFETY: see above
unsafe impl Sync for RegionPair {}

impl RegionPair {
    pub fn create(capacity: usize) -> Result<Self, CodeCacheError> {
        if capacity == 0 || capacity >= MAX_CAPACITY {
            return Err(CodeCacheError::CapacityInvalid {
                capacity,
                max: MAX_CAPACITY,
            });
        }

        let page = page_size();
        let mapped_size = align_up(capacity, page).max(2 * page);
        let mapping = map_memory(mapped_size, Protection::ALL).map_err(
            |source| CodeCacheError::MappingFailed {
                size: mapped_size,
                source,
            },
        )?;

        let data_size = align_up(mapped_size / 4, page);
        let code_size = mapped_size - data_size;
        debug_assert!(code_size >= page);

        // SAFETY: data_size < mapped_size
        let code_begin =
            unsafe { NonNull::new_unchecked(mapping.as_ptr().add(data_size)) };

        let data = MemoryRegion {
            name: "jit-data-cache",
            begin: mapping,
            size: data_size,
        };
        let code = MemoryRegion {
            name: "jit-code-cache",
            begin: code_begin,
            size: code_size,
        };
        name_memory(data.begin, data.size, c"jit-data-cache");
        name_memory(code.begin, code.size, c"jit-code-cache");

        let pair = Self {
            mapping,
            mapped_size,
            data,
            code,
            code_protection: AtomicU8::new(Protection::ALL.bits()),
        };

        pair.set_code_protection(Protection::CODE)
            .map_err(CodeCacheError::ProtectionFailure)?;
        // SAFETY: the data region is part of our mapping
        unsafe { protect_memory(pair.data.begin, pair.data.size, Protection::DATA) }
            .map_err(CodeCacheError::ProtectionFailure)?;

        log::debug!(
            "mapped code cache at {:p}: data={} bytes, code={} bytes",
            mapping,
            data_size,
            code_size
        );
        Ok(pair)
    }

    #[inline]
    pub fn data(&self) -> &MemoryRegion {
        &self.data
    }

    #[inline]
    pub fn code(&self) -> &MemoryRegion {
        &self.code
    }

    #[inline]
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// Current protection of the code region.
    pub fn code_protection(&self) -> Protection {
        Protection::from_bits_truncate(
            self.code_protection.load(Ordering::Acquire),
        )
    }

    fn set_code_protection(&self, prot: Protection) -> std::io::Result<()> {
        // SAFETY: the code region is part of our mapping
        unsafe { protect_memory(self.code.begin, self.code.size, prot) }?;
        self.code_protection.store(prot.bits(), Ordering::Release);
        Ok(())
    }

    /// Makes the code region writable until the returned scope is dropped.
    ///
    /// Must only be called with the cache monitor held: protection is global
    /// to the region, so the holder has exclusive write access to all code.
    pub(crate) fn write_scope(&self) -> CodeWriteScope<'_> {
        if let Err(err) = self.set_code_protection(Protection::ALL) {
            protection_failure(err);
        }
        CodeWriteScope { regions: self }
    }
}

impl Drop for RegionPair {
    fn drop(&mut self) {
        // SAFETY: the pair owns the whole mapping and is going away
        unsafe { unmap_memory(self.mapping, self.mapped_size) };
    }
}

/// Code region is `R+W+X` while this is alive.
#[derive(Debug)]
pub struct CodeWriteScope<'a> {
    regions: &'a RegionPair,
}

impl Drop for CodeWriteScope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.regions.set_code_protection(Protection::CODE) {
            protection_failure(err);
        }
    }
}

/// Mutators may be executing stale or half-written code; there is no safe
/// way to continue.
#[cold]
fn protection_failure(err: std::io::Error) -> ! {
    log::error!("failed to mprotect jit code cache: {err}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_and_oversized_capacity() {
        assert!(matches!(
            RegionPair::create(0),
            Err(CodeCacheError::CapacityInvalid { capacity: 0, .. })
        ));
        assert!(matches!(
            RegionPair::create(MAX_CAPACITY),
            Err(CodeCacheError::CapacityInvalid { .. })
        ));
        assert!(matches!(
            RegionPair::create(usize::MAX),
            Err(CodeCacheError::CapacityInvalid { .. })
        ));
    }

    #[test]
    fn splits_a_quarter_for_data() {
        let capacity = 256 * 1024;
        let pair = RegionPair::create(capacity).expect("create regions");
        let page = page_size();

        assert_eq!(pair.mapped_size(), align_up(capacity, page));
        assert_eq!(pair.data().size(), align_up(pair.mapped_size() / 4, page));
        assert_eq!(
            pair.data().size() + pair.code().size(),
            pair.mapped_size()
        );
        // data is below code and they are adjacent
        assert_eq!(pair.data().end(), pair.code().begin());
        assert!(pair.code().end() as usize - pair.data().begin() as usize <= u32::MAX as usize);
    }

    #[test]
    fn tiny_capacity_still_gets_both_regions() {
        let pair = RegionPair::create(1).expect("create regions");
        assert!(pair.data().size() >= page_size());
        assert!(pair.code().size() >= page_size());
    }

    #[test]
    fn code_is_not_writable_at_rest() {
        let pair = RegionPair::create(64 * 1024).expect("create regions");
        assert_eq!(pair.code_protection(), Protection::CODE);
        {
            let _scope = pair.write_scope();
            assert_eq!(pair.code_protection(), Protection::ALL);
            // SAFETY: writable inside the scope
            unsafe { pair.code().begin().write(0xC3) };
        }
        assert_eq!(pair.code_protection(), Protection::CODE);
        assert!(!pair.code_protection().contains(Protection::WRITE));
        // SAFETY: still readable
        assert_eq!(unsafe { pair.code().begin().read() }, 0xC3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn page_protection_follows_write_scope() {
        use crate::system::mapped_permissions;

        let pair = RegionPair::create(64 * 1024).expect("create regions");
        let code = pair.code().begin() as usize;
        let last = pair.code().end() as usize - 1;
        let data = pair.data().begin() as usize;

        assert_eq!(mapped_permissions(code).as_deref(), Some("r-xp"));
        assert_eq!(mapped_permissions(last).as_deref(), Some("r-xp"));
        assert_eq!(mapped_permissions(data).as_deref(), Some("rw-p"));
        {
            let _scope = pair.write_scope();
            assert_eq!(mapped_permissions(code).as_deref(), Some("rwxp"));
            assert_eq!(mapped_permissions(last).as_deref(), Some("rwxp"));
            assert_eq!(mapped_permissions(data).as_deref(), Some("rw-p"));
        }
        assert_eq!(mapped_permissions(code).as_deref(), Some("r-xp"));
        assert_eq!(mapped_permissions(last).as_deref(), Some("r-xp"));
    }

    #[test]
    fn data_is_writable_at_rest() {
        let pair = RegionPair::create(64 * 1024).expect("create regions");
        // SAFETY: data region is R+W
        unsafe {
            pair.data().begin().write_bytes(7, pair.data().size());
            assert_eq!(pair.data().end().sub(1).read(), 7);
        }
    }

    #[test]
    fn range_containment() {
        let pair = RegionPair::create(64 * 1024).expect("create regions");
        let code = pair.code();
        let begin = code.begin() as usize;
        assert!(code.contains(begin));
        assert!(!code.contains(begin - 1));
        assert!(!code.contains(code.end() as usize));
        assert!(code.contains_range(begin, code.size()));
        assert!(!code.contains_range(begin, code.size() + 1));
        assert!(!code.contains_range(usize::MAX, 2));
    }
}
