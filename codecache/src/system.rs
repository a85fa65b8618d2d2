use std::{
    ffi::CStr,
    io,
    ptr::{self, NonNull},
    sync::{
        OnceLock,
        atomic::{Ordering, fence},
    },
};

use bitflags::bitflags;

bitflags! {
    /// Page protection of a mapped range.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;

        /// Resting protection of the data region.
        const DATA = Self::READ.bits() | Self::WRITE.bits();
        /// Resting protection of the code region.
        const CODE = Self::READ.bits() | Self::EXEC.bits();
        /// Code region inside a write scope.
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

impl Protection {
    fn to_native(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Protection::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Size of a host page in bytes.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 4096 } else { size as usize }
    })
}

#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// [`align_up`] that reports overflow instead of wrapping.
#[inline(always)]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Maps `size` bytes of anonymous, private memory with protection `prot`.
///
/// On Linux the pages are populated up front so the cache never takes a
/// lazy-commit fault while a mutator is running inside it.
pub fn map_memory(size: usize, prot: Protection) -> io::Result<NonNull<u8>> {
    #[allow(unused_mut)]
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        flags |= libc::MAP_POPULATE;
    }

    // SAFETY: anonymous mapping at a kernel chosen address
    let ptr = unsafe {
        libc::mmap(ptr::null_mut(), size, prot.to_native(), flags, -1, 0)
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| io::Error::other("mmap returned a null mapping"))
}

/// # Safety
/// `ptr` and `size` must describe a mapping returned by [`map_memory`] that
/// nothing references anymore.
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: guaranteed by caller
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
    if rc != 0 {
        log::warn!(
            "munmap of {:p} ({} bytes) failed: {}",
            ptr,
            size,
            io::Error::last_os_error()
        );
    }
}

/// Changes the protection of a page aligned range.
///
/// # Safety
/// The range must lie inside a live mapping owned by the caller. Removing
/// `EXEC` or `READ` from pages other threads are executing is the caller's
/// responsibility.
pub unsafe fn protect_memory(
    ptr: NonNull<u8>,
    size: usize,
    prot: Protection,
) -> io::Result<()> {
    debug_assert!(is_aligned(ptr.as_ptr() as usize, page_size()));
    // SAFETY: guaranteed by caller
    let rc =
        unsafe { libc::mprotect(ptr.as_ptr().cast(), size, prot.to_native()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Attaches a name to an anonymous range so it shows up in `/proc/self/maps`.
/// Kernels without anonymous VMA names reject the call; that is not an error.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn name_memory(ptr: NonNull<u8>, size: usize, name: &CStr) {
    const PR_SET_VMA: libc::c_int = 0x5356_4d41;
    const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;

    // SAFETY: prctl only reads `name` and does not touch the range itself
    let rc = unsafe {
        libc::prctl(
            PR_SET_VMA,
            PR_SET_VMA_ANON_NAME,
            ptr.as_ptr() as libc::c_ulong,
            size as libc::c_ulong,
            name.as_ptr() as libc::c_ulong,
        )
    };
    if rc != 0 {
        log::trace!("could not name {:?}: {}", name, io::Error::last_os_error());
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn name_memory(_ptr: NonNull<u8>, _size: usize, _name: &CStr) {}

/// Makes freshly written instructions in `[begin, begin + len)` visible to
/// instruction fetch on every core.
///
/// # Safety
/// The range must be mapped.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub unsafe fn flush_instruction_cache(_begin: *const u8, _len: usize) {
    // x86 keeps the i-cache coherent with stores.
    fence(Ordering::SeqCst);
}

/// Makes freshly written instructions in `[begin, begin + len)` visible to
/// instruction fetch on every core.
///
/// # Safety
/// The range must be mapped.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub unsafe fn flush_instruction_cache(begin: *const u8, len: usize) {
    unsafe extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }

    let begin = begin as *mut libc::c_char;
    // SAFETY: guaranteed by caller
    unsafe { __clear_cache(begin, begin.add(len)) };
    fence(Ordering::SeqCst);
}

/// Permission column (`r-xp`, ...) of the mapping containing `addr`, as the
/// kernel reports it.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn mapped_permissions(addr: usize) -> Option<String> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        let perms = fields.next()?;
        (start <= addr && addr < end).then(|| perms.to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 4096);
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(28, 16), 32);
        assert_eq!(align_up(32, 16), 32);
        assert_eq!(checked_align_up(28, 16), Some(32));
        assert_eq!(checked_align_up(usize::MAX - 3, 8), None);
        assert_eq!(checked_align_up(usize::MAX - 7, 8), Some(usize::MAX - 7));
        assert!(is_aligned(4096, 4096));
        assert!(!is_aligned(4097, 8));
    }

    #[test]
    fn protection_native_bits() {
        assert_eq!(Protection::DATA.to_native(), libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(Protection::CODE.to_native(), libc::PROT_READ | libc::PROT_EXEC);
        assert_eq!(
            Protection::ALL.to_native(),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        );
        assert_eq!(Protection::empty().to_native(), libc::PROT_NONE);
    }

    #[test]
    fn map_write_protect_unmap() {
        let size = page_size() * 2;
        let ptr = map_memory(size, Protection::DATA).expect("map memory");
        assert!(is_aligned(ptr.as_ptr() as usize, page_size()));

        // SAFETY: freshly mapped and writable
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, size);
            assert_eq!(*ptr.as_ptr().add(size - 1), 0xAB);
        }

        // SAFETY: range is our mapping
        unsafe { protect_memory(ptr, size, Protection::READ) }
            .expect("mprotect read only");
        // SAFETY: still readable
        assert_eq!(unsafe { *ptr.as_ptr() }, 0xAB);

        name_memory(ptr, size, c"codecache-test");
        // SAFETY: nothing references the mapping anymore
        unsafe { unmap_memory(ptr, size) };
    }
}
