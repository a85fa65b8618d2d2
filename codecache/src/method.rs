use std::{
    fmt,
    sync::atomic::{AtomicU16, AtomicUsize, Ordering},
};

/// A method as seen by the code cache.
///
/// The cache never owns methods; it stores them by identity in its index and
/// only ever touches the entry point and the hotness counter.
pub trait JitMethod: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Address that calls to this method jump to.
    fn entry_point(&self) -> usize;

    fn set_entry_point(&self, entry: usize);

    /// Resets the invocation counter, so an evicted method has to warm up
    /// again before it is recompiled.
    fn clear_counter(&self);

    /// Bumps the invocation counter and returns the new value.
    fn increment_counter(&self) -> u16;
}

/// Identity of a method, independent of vtable pointers.
#[inline]
pub(crate) fn same_method(a: &dyn JitMethod, b: &dyn JitMethod) -> bool {
    std::ptr::addr_eq(a as *const dyn JitMethod, b as *const dyn JitMethod)
}

/// Plain method with an atomic entry point and a saturating hotness counter.
pub struct ManagedMethod {
    name: String,
    entry_point: AtomicUsize,
    counter: AtomicU16,
}

impl ManagedMethod {
    pub fn new(name: impl Into<String>, entry_point: usize) -> Self {
        Self {
            name: name.into(),
            entry_point: AtomicUsize::new(entry_point),
            counter: AtomicU16::new(0),
        }
    }

    pub fn counter(&self) -> u16 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ManagedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedMethod")
            .field("name", &self.name)
            .field("entry_point", &format_args!("{:#x}", self.entry_point()))
            .field("counter", &self.counter())
            .finish()
    }
}

impl JitMethod for ManagedMethod {
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn entry_point(&self) -> usize {
        self.entry_point.load(Ordering::Acquire)
    }

    #[inline]
    fn set_entry_point(&self, entry: usize) {
        self.entry_point.store(entry, Ordering::Release);
    }

    fn clear_counter(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }

    fn increment_counter(&self) -> u16 {
        match self.counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            c.checked_add(1)
        }) {
            Ok(prev) => prev + 1,
            Err(max) => max,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn counter_saturates() {
        let method = ManagedMethod::new("m", 0);
        method.counter.store(u16::MAX - 1, Ordering::Relaxed);
        assert_eq!(method.increment_counter(), u16::MAX);
        assert_eq!(method.increment_counter(), u16::MAX);
        method.clear_counter();
        assert_eq!(method.counter(), 0);
        assert_eq!(method.increment_counter(), 1);
    }

    #[test]
    fn entry_point_updates() {
        let method = ManagedMethod::new("m", 0x1000);
        assert_eq!(method.entry_point(), 0x1000);
        method.set_entry_point(0x2001);
        assert_eq!(method.entry_point(), 0x2001);
    }

    #[test]
    fn identity_not_equality() {
        let a: Arc<dyn JitMethod> = Arc::new(ManagedMethod::new("same", 0));
        let b: Arc<dyn JitMethod> = Arc::new(ManagedMethod::new("same", 0));
        assert!(same_method(&*a, &*a.clone()));
        assert!(!same_method(&*a, &*b));
    }
}
