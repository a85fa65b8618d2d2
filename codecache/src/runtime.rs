//! Services the code cache needs from the surrounding runtime, and a small
//! thread registry implementing them.
//!
//! The cache talks to the runtime through [`Runtime`]: it asks for the
//! interpreter bridge address, voluntarily suspends the calling thread around
//! monitor acquisition, and broadcasts [`Checkpoint`] closures that every
//! mutator runs against its own stack.
//!
//! [`ThreadRegistry`] is a cooperative implementation. Attached threads keep
//! a shadow stack of native PCs ([`Mutator::push_frame`]) and poll
//! [`Mutator::safepoint`]. A checkpoint is run immediately on behalf of
//! suspended threads and queued for runnable ones, which pick it up at their
//! next safepoint or when they suspend.

use std::{
    cell::RefCell,
    fmt,
    marker::PhantomData,
    mem,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

/// One thread's stack, as seen by a checkpoint.
pub trait StackWalker {
    /// Calls `visit` with the PC of every frame, innermost first, until it
    /// returns `false`.
    fn walk_stack(&self, visit: &mut dyn FnMut(usize) -> bool);

    /// Whether the walked thread is running the checkpoint itself. `false`
    /// when the stack is walked on behalf of a suspended thread.
    fn is_runnable(&self) -> bool;
}

/// A closure run once per mutator thread.
pub trait Checkpoint: Send + Sync {
    fn run(&self, thread: &dyn StackWalker);
}

pub trait Runtime: Send + Sync {
    /// Entry point that makes calls fall back to the interpreter. Never
    /// inside the code cache.
    fn interpreter_bridge(&self) -> usize;

    /// Runs `checkpoint` for every mutator. Returns how many runnable
    /// threads will run it themselves; each of those must eventually call
    /// back into the checkpoint with a runnable walker.
    fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize;

    /// Marks the calling thread as suspended, so checkpoints walk its stack
    /// on its behalf instead of waiting for it.
    fn suspend_current_thread(&self);

    fn resume_current_thread(&self);
}

/// Keeps the current thread suspended for the lifetime of the guard.
pub struct ScopedThreadSuspension<'a> {
    runtime: &'a dyn Runtime,
}

impl<'a> ScopedThreadSuspension<'a> {
    pub fn new(runtime: &'a dyn Runtime) -> Self {
        runtime.suspend_current_thread();
        Self { runtime }
    }
}

impl Drop for ScopedThreadSuspension<'_> {
    fn drop(&mut self) {
        self.runtime.resume_current_thread();
    }
}

/// Stand-in for the interpreter entry stub.
#[inline(never)]
extern "C" fn interpreter_bridge_stub() {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    Suspended,
}

struct ThreadData {
    state: ThreadState,
    suspend_count: usize,
    /// outermost first
    frames: Vec<usize>,
    pending: Vec<Arc<dyn Checkpoint>>,
}

impl ThreadData {
    /// Runs every queued checkpoint against this thread's stack.
    fn run_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = mem::take(&mut self.pending);
        let walker = FrameWalker {
            frames: &self.frames,
            runnable: true,
        };
        for checkpoint in pending {
            checkpoint.run(&walker);
        }
    }
}

struct MutatorShared {
    id: usize,
    registry: usize,
    name: String,
    data: Mutex<ThreadData>,
}

impl fmt::Debug for MutatorShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorShared")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct FrameWalker<'a> {
    frames: &'a [usize],
    runnable: bool,
}

impl StackWalker for FrameWalker<'_> {
    fn walk_stack(&self, visit: &mut dyn FnMut(usize) -> bool) {
        for &pc in self.frames.iter().rev() {
            if !visit(pc) {
                break;
            }
        }
    }

    fn is_runnable(&self) -> bool {
        self.runnable
    }
}

thread_local! {
    static CURRENT: RefCell<Vec<Arc<MutatorShared>>> = const { RefCell::new(Vec::new()) };
}

static NEXT_REGISTRY_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug)]
struct RegistryInner {
    id: usize,
    threads: Mutex<Vec<Arc<MutatorShared>>>,
    next_thread_id: AtomicUsize,
    checkpoints: AtomicUsize,
}

/// Cooperative thread list backing [`Runtime`].
#[derive(Debug, Clone)]
pub struct ThreadRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                threads: Mutex::new(Vec::new()),
                next_thread_id: AtomicUsize::new(0),
                checkpoints: AtomicUsize::new(0),
            }),
        }
    }

    /// Registers the calling thread as a runnable mutator.
    ///
    /// # Panics
    /// If the thread is already attached to this registry.
    pub fn attach_current_thread(&self) -> Mutator {
        let name = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_owned();
        let shared = Arc::new(MutatorShared {
            id: self.inner.next_thread_id.fetch_add(1, Ordering::Relaxed),
            registry: self.inner.id,
            name,
            data: Mutex::new(ThreadData {
                state: ThreadState::Runnable,
                suspend_count: 0,
                frames: Vec::new(),
                pending: Vec::new(),
            }),
        });

        CURRENT.with_borrow_mut(|current| {
            assert!(
                !current.iter().any(|m| m.registry == self.inner.id),
                "thread attached twice"
            );
            current.push(shared.clone());
        });
        self.inner.threads.lock().push(shared.clone());
        log::trace!("attached mutator {} ({})", shared.id, shared.name);

        Mutator {
            registry: self.clone(),
            shared,
            _not_send: PhantomData,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.inner.threads.lock().len()
    }

    /// Number of checkpoints broadcast so far.
    pub fn checkpoints(&self) -> usize {
        self.inner.checkpoints.load(Ordering::Relaxed)
    }

    fn current(&self) -> Option<Arc<MutatorShared>> {
        CURRENT.with_borrow(|current| {
            current
                .iter()
                .find(|m| m.registry == self.inner.id)
                .cloned()
        })
    }

    fn detach(&self, shared: &Arc<MutatorShared>) {
        let mut threads = self.inner.threads.lock();
        threads.retain(|m| !Arc::ptr_eq(m, shared));
        // no new checkpoints can be queued once we are off the list
        shared.data.lock().run_pending();
        drop(threads);

        CURRENT.with_borrow_mut(|current| {
            current.retain(|m| !Arc::ptr_eq(m, shared));
        });
        log::trace!("detached mutator {} ({})", shared.id, shared.name);
    }
}

impl Runtime for ThreadRegistry {
    fn interpreter_bridge(&self) -> usize {
        interpreter_bridge_stub as *const () as usize
    }

    fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize {
        self.inner.checkpoints.fetch_add(1, Ordering::Relaxed);
        let threads = self.inner.threads.lock();
        let mut queued = 0;
        for thread in threads.iter() {
            let mut data = thread.data.lock();
            match data.state {
                ThreadState::Suspended => {
                    let walker = FrameWalker {
                        frames: &data.frames,
                        runnable: false,
                    };
                    checkpoint.run(&walker);
                }
                ThreadState::Runnable => {
                    data.pending.push(checkpoint.clone());
                    queued += 1;
                }
            }
        }
        log::trace!(
            "checkpoint: {} threads, {} queued",
            threads.len(),
            queued
        );
        queued
    }

    fn suspend_current_thread(&self) {
        if let Some(current) = self.current() {
            let mut data = current.data.lock();
            data.run_pending();
            data.suspend_count += 1;
            data.state = ThreadState::Suspended;
        }
    }

    fn resume_current_thread(&self) {
        if let Some(current) = self.current() {
            let mut data = current.data.lock();
            debug_assert!(data.suspend_count > 0);
            data.suspend_count = data.suspend_count.saturating_sub(1);
            if data.suspend_count == 0 {
                data.state = ThreadState::Runnable;
            }
        }
    }
}

/// Handle of an attached thread. Detaches on drop.
pub struct Mutator {
    registry: ThreadRegistry,
    shared: Arc<MutatorShared>,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Mutator").field(&self.shared).finish()
    }
}

impl Mutator {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn state(&self) -> ThreadState {
        self.shared.data.lock().state
    }

    /// Enters a frame executing at `pc`.
    pub fn push_frame(&self, pc: usize) {
        self.shared.data.lock().frames.push(pc);
    }

    pub fn pop_frame(&self) -> Option<usize> {
        self.shared.data.lock().frames.pop()
    }

    /// Moves the innermost frame to `pc`.
    pub fn set_pc(&self, pc: usize) {
        if let Some(top) = self.shared.data.lock().frames.last_mut() {
            *top = pc;
        }
    }

    pub fn depth(&self) -> usize {
        self.shared.data.lock().frames.len()
    }

    /// Runs every checkpoint queued for this thread.
    pub fn safepoint(&self) {
        self.shared.data.lock().run_pending();
    }

    /// Runs `f` with this thread suspended.
    pub fn suspended<R>(&self, f: impl FnOnce() -> R) -> R {
        let _suspension = ScopedThreadSuspension::new(&self.registry);
        f()
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.registry.detach(&self.shared);
    }
}
