use parking_lot::{Condvar, Mutex};

/// Counting barrier used to wait for checkpoint closures.
///
/// Threads that finish a checkpoint call [`Barrier::pass`]; the requester
/// calls [`Barrier::increment`] with the number of threads it handed the
/// closure to and sleeps until all of them have passed. Passes may happen
/// before the requester starts waiting, so the count can go negative.
#[derive(Debug, Default)]
pub struct Barrier {
    count: Mutex<isize>,
    cvar: Condvar,
}

impl Barrier {
    pub fn new(count: isize) -> Self {
        Self {
            count: Mutex::new(count),
            cvar: Condvar::new(),
        }
    }

    /// Decrements the count, waking the waiter when it reaches zero.
    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cvar.notify_all();
        }
    }

    /// Adds `delta` to the count and blocks until it drops back to zero.
    pub fn increment(&self, delta: usize) {
        let mut count = self.count.lock();
        *count += delta as isize;
        while *count != 0 {
            self.cvar.wait(&mut count);
        }
    }

    pub fn count(&self) -> isize {
        *self.count.lock()
    }
}
