//! The JIT code cache.
//!
//! Compiled method bodies live in the code region behind a [`MethodHeader`];
//! their side tables live in the data region. A single monitor guards both
//! allocators and the method index, and a condition variable lets commits and
//! lookups that need a stable index wait out a running collection.
//!
//! Collection is mark-sweep driven by thread stacks: every indexed method is
//! pointed back at the interpreter, each mutator marks the bodies it is
//! executing in a checkpoint, and everything left unmarked is freed.

use std::{
    collections::BTreeMap,
    fmt,
    mem,
    ptr::NonNull,
    sync::Arc,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    CodeCacheError, FrameInfo, InstructionSet, JitMethod, MethodHeader,
    Runtime,
    arena::Arena,
    bitmap::CodeCacheBitmap,
    isa::{JIT_CODE_ALIGNMENT, RUNTIME_ISA},
    method::same_method,
    region::{MAX_CAPACITY, RegionPair},
};

mod collect;
mod commit;
mod lookup;

pub use commit::CompiledMethod;

/// Capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 2 * 1024 * 1024;

/// Parameters for [`JitCodeCache::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeCacheCreateInfo {
    /// Bytes to map for both regions together.
    pub capacity: usize,
    /// Instruction set of the code that will be committed; defaults to the
    /// host's.
    pub isa: Option<InstructionSet>,
}

impl Default for CodeCacheCreateInfo {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            isa: None,
        }
    }
}

impl CodeCacheCreateInfo {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    #[inline]
    fn validate(&self) -> Result<(), &'static str> {
        if self.capacity == 0 {
            return Err("capacity must be > 0");
        }
        if self.capacity >= MAX_CAPACITY {
            return Err("capacity must be below the maximum cache size");
        }
        Ok(())
    }
}

/// State guarded by the cache monitor.
#[derive(Debug)]
pub(crate) struct CacheState {
    pub code_arena: Arena,
    pub data_arena: Arena,
    /// code start -> owning method
    pub methods: BTreeMap<usize, Arc<dyn JitMethod>>,
    pub collection_in_progress: bool,
    pub collections: usize,
}

pub(crate) struct CacheShared {
    pub regions: RegionPair,
    pub bitmap: CodeCacheBitmap,
    pub isa: InstructionSet,
    pub runtime: Arc<dyn Runtime>,
    pub lock: Mutex<CacheState>,
    pub lock_cond: Condvar,
}

impl CacheShared {
    /// Blocks while a collection is running. Returns whether it had to wait.
    pub fn wait_for_potential_collection_to_complete(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
    ) -> bool {
        let mut waited = false;
        while state.collection_in_progress {
            waited = true;
            self.lock_cond.wait(state);
        }
        waited
    }

    fn stats_locked(&self, state: &CacheState) -> CodeCacheStats {
        CodeCacheStats {
            code_capacity: state.code_arena.capacity(),
            data_capacity: state.data_arena.capacity(),
            code_bytes: state.code_arena.bytes_allocated(),
            data_bytes: state.data_arena.bytes_allocated(),
            compiled_methods: state.methods.len(),
            collections: state.collections,
        }
    }
}

/// Handle to a code cache. Clones share the same cache.
#[derive(Clone)]
pub struct JitCodeCache {
    inner: Arc<CacheShared>,
}

impl fmt::Debug for JitCodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitCodeCache")
            .field("isa", &self.inner.isa)
            .field("data", self.inner.regions.data())
            .field("code", self.inner.regions.code())
            .finish_non_exhaustive()
    }
}

impl JitCodeCache {
    pub fn create(
        info: CodeCacheCreateInfo,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Self, CodeCacheError> {
        if let Err(reason) = info.validate() {
            log::error!("invalid code cache settings: {reason}");
            return Err(CodeCacheError::CapacityInvalid {
                capacity: info.capacity,
                max: MAX_CAPACITY,
            });
        }

        let isa = info.isa.unwrap_or(RUNTIME_ISA);
        let regions = RegionPair::create(info.capacity)?;

        let data = regions.data();
        let code = regions.code();
        let data_arena = Arena::new(
            data.name(),
            data.base(),
            data.size(),
            mem::size_of::<usize>(),
        );
        let code_arena = Arena::new(
            code.name(),
            code.base(),
            code.size(),
            JIT_CODE_ALIGNMENT,
        );
        let bitmap = CodeCacheBitmap::new(code.begin() as usize, code.size());

        log::info!(
            "created jit code cache for {isa}: data {}, code {}",
            pretty_size(data.size()),
            pretty_size(code.size())
        );

        Ok(Self {
            inner: Arc::new(CacheShared {
                regions,
                bitmap,
                isa,
                runtime,
                lock: Mutex::new(CacheState {
                    code_arena,
                    data_arena,
                    methods: BTreeMap::new(),
                    collection_in_progress: false,
                    collections: 0,
                }),
                lock_cond: Condvar::new(),
            }),
        })
    }

    #[inline]
    pub fn isa(&self) -> InstructionSet {
        self.inner.isa
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.inner.runtime
    }

    pub fn regions(&self) -> &RegionPair {
        &self.inner.regions
    }

    /// Whether `pc` lies in the code region. Says nothing about whether a
    /// method is installed there.
    #[inline]
    pub fn contains_pc(&self, pc: usize) -> bool {
        self.inner.regions.code().contains(pc)
    }

    pub fn contains_method(&self, method: &Arc<dyn JitMethod>) -> bool {
        self.header_of_method(method).is_some()
    }

    fn header_of_method(
        &self,
        method: &Arc<dyn JitMethod>,
    ) -> Option<NonNull<MethodHeader>> {
        let state = self.inner.lock.lock();
        state
            .methods
            .iter()
            .find(|(_, m)| same_method(&***m, &**method))
            .and_then(|(&code, _)| NonNull::new(MethodHeader::from_code_ptr(code)))
    }

    /// Bytes allocated in the code region, headers included.
    pub fn code_cache_size(&self) -> usize {
        self.inner.lock.lock().code_arena.bytes_allocated()
    }

    /// Bytes allocated in the data region.
    pub fn data_cache_size(&self) -> usize {
        self.inner.lock.lock().data_arena.bytes_allocated()
    }

    pub fn number_of_compiled_code(&self) -> usize {
        self.inner.lock.lock().methods.len()
    }

    /// Completed collection cycles.
    pub fn collections(&self) -> usize {
        self.inner.lock.lock().collections
    }

    pub fn code_capacity(&self) -> usize {
        self.inner.regions.code().size()
    }

    pub fn data_capacity(&self) -> usize {
        self.inner.regions.data().size()
    }

    pub fn stats(&self) -> CodeCacheStats {
        let state = self.inner.lock.lock();
        self.inner.stats_locked(&state)
    }
}

/// Snapshot of a method found by [`JitCodeCache::lookup_method`].
#[derive(Debug, Clone)]
pub struct CodeInfo {
    pub code_start: usize,
    pub code_size: usize,
    pub frame_info: FrameInfo,
    pub method: Arc<dyn JitMethod>,
}

impl CodeInfo {
    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        self.code_start <= pc && pc < self.code_start + self.code_size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub code_capacity: usize,
    pub data_capacity: usize,
    pub code_bytes: usize,
    pub data_bytes: usize,
    pub compiled_methods: usize,
    pub collections: usize,
}

impl fmt::Display for CodeCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "code: {}/{}, data: {}/{}, methods: {}, collections: {}",
            pretty_size(self.code_bytes),
            pretty_size(self.code_capacity),
            pretty_size(self.data_bytes),
            pretty_size(self.data_capacity),
            self.compiled_methods,
            self.collections
        )
    }
}

/// Formats a byte count with the largest unit that keeps at least two
/// significant digits, rounding down.
pub fn pretty_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    match bytes {
        b if b >= 10 * GB => format!("{}GB", b / GB),
        b if b >= 10 * MB => format!("{}MB", b / MB),
        b if b >= 10 * KB => format!("{}KB", b / KB),
        b => format!("{b}B"),
    }
}
