use std::{ptr::NonNull, sync::Arc};

use super::{CacheShared, CacheState, JitCodeCache, pretty_size};
use crate::{
    Barrier, MethodHeader,
    runtime::{Checkpoint, ScopedThreadSuspension, StackWalker},
};

/// Marks every cached body found on a thread's stack.
struct MarkCodeClosure {
    cache: Arc<CacheShared>,
    barrier: Arc<Barrier>,
}

impl Checkpoint for MarkCodeClosure {
    fn run(&self, thread: &dyn StackWalker) {
        thread.walk_stack(&mut |pc| {
            if let Some(header) = self.cache.lookup_method_header(pc, None) {
                // the bitmap is indexed by allocation start, which is the header
                self.cache.bitmap.set(header.as_ptr() as usize);
            }
            true
        });
        if thread.is_runnable() {
            self.barrier.pass();
        }
    }
}

impl JitCodeCache {
    /// Runs one collection, or waits for the one already running.
    pub fn garbage_collect_cache(&self) {
        let shared = &*self.inner;
        let _suspension = ScopedThreadSuspension::new(&*shared.runtime);

        let mut state = shared.lock.lock();
        if shared.wait_for_potential_collection_to_complete(&mut state) {
            // someone else just collected
            return;
        }

        let before = shared.stats_locked(&state);
        state.collection_in_progress = true;
        shared.bitmap.clear_all();

        if state.methods.is_empty() {
            state.collection_in_progress = false;
            state.collections += 1;
            shared.lock_cond.notify_all();
            log::debug!("jit code cache is empty, nothing to collect");
            return;
        }

        let map_size = state.methods.len();
        let bridge = shared.runtime.interpreter_bridge();
        for method in state.methods.values() {
            method.set_entry_point(bridge);
        }
        drop(state);

        // Walk stacks without the monitor: mutators look headers up while
        // marking.
        let barrier = Arc::new(Barrier::new(0));
        let closure = Arc::new(MarkCodeClosure {
            cache: self.inner.clone(),
            barrier: barrier.clone(),
        });
        let threads = shared.runtime.run_checkpoint(closure);
        barrier.increment(threads);

        let mut state = shared.lock.lock();
        if state.methods.len() != map_size {
            index_corrupted(map_size, state.methods.len());
        }
        let freed = {
            let _scope = shared.regions.write_scope();
            shared.sweep(&mut state)
        };

        state.collection_in_progress = false;
        state.collections += 1;
        shared.lock_cond.notify_all();

        let after = shared.stats_locked(&state);
        log::info!(
            "jit code cache collection #{}: freed {} methods, code {} -> {}, data {} -> {}",
            after.collections,
            freed,
            pretty_size(before.code_bytes),
            pretty_size(after.code_bytes),
            pretty_size(before.data_bytes),
            pretty_size(after.data_bytes)
        );
    }
}

/// Commits wait for the collection flag; the index cannot change while
/// marking.
#[cold]
fn index_corrupted(expected: usize, found: usize) -> ! {
    log::error!(
        "jit code cache index changed during collection: {expected} methods before marking, {found} after"
    );
    std::process::abort()
}

impl CacheShared {
    /// Restores marked methods and frees the rest. Returns how many methods
    /// were freed. Must run inside a write scope.
    fn sweep(&self, state: &mut CacheState) -> usize {
        let CacheState {
            methods,
            code_arena,
            data_arena,
            ..
        } = state;
        let before = methods.len();

        methods.retain(|&code, method| {
            let header_ptr = MethodHeader::from_code_ptr(code);
            // SAFETY: every index key is the code start of an installed header
            let header = unsafe { &*header_ptr };

            if self.bitmap.test(header_ptr as usize) {
                method.set_entry_point(header.entry_point(self.isa));
                return true;
            }

            method.clear_counter();
            if let Some(gc_map) = header.gc_map() {
                data_arena.free(gc_map);
            }
            if let Some(mapping_table) = header.mapping_table() {
                data_arena.free(mapping_table);
            }
            // The vmap table is only ever reached through its offset, so it is
            // freed here and nowhere else.
            if let Some(vmap_table) = header.vmap_table() {
                data_arena.free(vmap_table);
            }
            if let Some(allocation) = NonNull::new(header_ptr.cast::<u8>()) {
                code_arena.free(allocation);
            }
            log::trace!("evicted {} from {:#x}", method.name(), code);
            false
        });

        before - methods.len()
    }
}
