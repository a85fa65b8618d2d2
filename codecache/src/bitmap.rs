use std::sync::atomic::{AtomicU64, Ordering};

use crate::isa::JIT_CODE_ALIGNMENT;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Liveness marks for the code region, one bit per allocation granule.
///
/// Marking is lock free so checkpoint closures running on many threads can
/// set bits concurrently; clearing and sweeping happen under the cache
/// monitor.
#[derive(Debug)]
pub struct CodeCacheBitmap {
    words: Box<[AtomicU64]>,
    base: usize,
    size: usize,
}

impl CodeCacheBitmap {
    pub fn new(base: usize, size: usize) -> Self {
        let granules = size.div_ceil(JIT_CODE_ALIGNMENT);
        let words = (0..granules.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, base, size }
    }

    #[inline]
    fn index(&self, addr: usize) -> Option<(usize, u64)> {
        if addr < self.base || addr >= self.base + self.size {
            return None;
        }
        let granule = (addr - self.base) / JIT_CODE_ALIGNMENT;
        Some((granule / BITS_PER_WORD, 1 << (granule % BITS_PER_WORD)))
    }

    #[inline]
    pub fn has_address(&self, addr: usize) -> bool {
        self.index(addr).is_some()
    }

    /// Marks the granule holding `addr`. Returns whether it was newly set;
    /// addresses outside the region are ignored.
    #[inline]
    pub fn set(&self, addr: usize) -> bool {
        match self.index(addr) {
            Some((word, mask)) => {
                self.words[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
            }
            None => false,
        }
    }

    #[inline]
    pub fn test(&self, addr: usize) -> bool {
        self.index(addr).is_some_and(|(word, mask)| {
            self.words[word].load(Ordering::Acquire) & mask != 0
        })
    }

    pub fn clear_all(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn count_marked(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    const BASE: usize = 0x4000_0000;

    #[test]
    fn one_bit_per_granule() {
        let bitmap = CodeCacheBitmap::new(BASE, 4096);
        assert!(bitmap.set(BASE + 32));
        assert!(bitmap.test(BASE + 32));
        // same granule
        assert!(bitmap.test(BASE + 47));
        assert!(!bitmap.set(BASE + 40));
        assert!(!bitmap.test(BASE + 48));
        assert!(!bitmap.test(BASE + 16));
        assert_eq!(bitmap.count_marked(), 1);
    }

    #[test]
    fn out_of_range_is_ignored() {
        let bitmap = CodeCacheBitmap::new(BASE, 4096);
        assert!(!bitmap.set(BASE - 1));
        assert!(!bitmap.set(BASE + 4096));
        assert!(!bitmap.test(BASE + 4096));
        assert!(bitmap.has_address(BASE + 4095));
        assert_eq!(bitmap.count_marked(), 0);
    }

    #[test]
    fn clear_resets_every_word() {
        let bitmap = CodeCacheBitmap::new(BASE, 64 * 1024);
        for i in (0..64 * 1024).step_by(1024) {
            bitmap.set(BASE + i);
        }
        assert_eq!(bitmap.count_marked(), 64);
        bitmap.clear_all();
        assert_eq!(bitmap.count_marked(), 0);
    }

    #[test]
    fn concurrent_marking() {
        let bitmap = Arc::new(CodeCacheBitmap::new(BASE, 64 * 1024));
        let handles = (0..4)
            .map(|t| {
                let bitmap = bitmap.clone();
                thread::spawn(move || {
                    for g in (t..4096).step_by(4) {
                        bitmap.set(BASE + g * JIT_CODE_ALIGNMENT);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bitmap.count_marked(), 4096);
    }
}
