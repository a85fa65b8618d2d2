use std::{mem, ptr, ptr::NonNull, sync::Arc};

use super::{CacheShared, JitCodeCache};
use crate::{
    CodeCacheError, FrameInfo, JitMethod, MethodHeader, SideTables,
    header::aligned_header_size,
    runtime::ScopedThreadSuspension,
    system::{checked_align_up, flush_instruction_cache, is_aligned},
};

/// Output of a method compiler, before it is linked into the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledMethod {
    pub code: Vec<u8>,
    pub mapping_table: Option<Vec<u8>>,
    pub vmap_table: Option<Vec<u8>>,
    pub gc_map: Option<Vec<u8>>,
    pub frame_info: FrameInfo,
}

impl CompiledMethod {
    pub fn new(code: Vec<u8>, frame_info: FrameInfo) -> Self {
        Self {
            code,
            frame_info,
            ..Self::default()
        }
    }
}

impl JitCodeCache {
    /// Installs `code` for `method` and points the method at it.
    ///
    /// The side tables must already live in the data region (see
    /// [`JitCodeCache::add_data_array`]). If the code region is full, one
    /// collection is run before giving up with [`CodeCacheError::CacheFull`].
    pub fn commit_code(
        &self,
        method: &Arc<dyn JitMethod>,
        tables: SideTables,
        frame_info: FrameInfo,
        code: &[u8],
    ) -> Result<NonNull<MethodHeader>, CodeCacheError> {
        if code.is_empty() {
            return Err(CodeCacheError::EmptyCode);
        }
        let data = self.inner.regions.data();
        if let Some(table) = tables.iter().find(|t| !data.contains(t.as_ptr() as usize)) {
            return Err(CodeCacheError::SideTableOutOfRange {
                ptr: table.as_ptr() as usize,
            });
        }
        let requested = aligned_header_size(self.inner.isa).saturating_add(code.len());
        let code_size = u32::try_from(code.len())
            .map_err(|_| CodeCacheError::CacheFull { requested })?;

        if let Some(header) =
            self.inner.commit_code_internal(method, &tables, frame_info, code, code_size)
        {
            return Ok(header);
        }

        log::warn!(
            "no room for {} bytes of code for {}, collecting",
            requested,
            method.name()
        );
        self.garbage_collect_cache();

        self.inner
            .commit_code_internal(method, &tables, frame_info, code, code_size)
            .ok_or_else(|| {
                log::warn!(
                    "code cache full, {} bytes for {} do not fit",
                    requested,
                    method.name()
                );
                CodeCacheError::CacheFull { requested }
            })
    }

    /// Reserves `size` bytes in the data region, rounded up to pointer size.
    /// Collects once before giving up.
    pub fn reserve_data(&self, size: usize) -> Result<NonNull<u8>, CodeCacheError> {
        let size = checked_align_up(size, mem::size_of::<usize>())
            .ok_or(CodeCacheError::CacheFull { requested: size })?;
        if let Some(data) = self.inner.reserve_data_internal(size) {
            return Ok(data);
        }

        log::warn!("no room for {size} bytes of side tables, collecting");
        self.garbage_collect_cache();

        self.inner
            .reserve_data_internal(size)
            .ok_or(CodeCacheError::CacheFull { requested: size })
    }

    /// Copies `bytes` into freshly reserved data space.
    pub fn add_data_array(&self, bytes: &[u8]) -> Result<NonNull<u8>, CodeCacheError> {
        let data = self.reserve_data(bytes.len())?;
        // SAFETY: the data region is writable and the block holds at least
        // `bytes.len()` bytes
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), data.as_ptr(), bytes.len())
        };
        Ok(data)
    }

    /// Copies the side tables of `compiled` into the data region and commits
    /// its code. Returns the existing header if `method` is already compiled.
    pub fn add_compiled_method(
        &self,
        method: &Arc<dyn JitMethod>,
        compiled: &CompiledMethod,
    ) -> Result<NonNull<MethodHeader>, CodeCacheError> {
        if let Some(header) = self.header_of_method(method) {
            log::debug!("{} is already compiled", method.name());
            return Ok(header);
        }

        let mut tables = SideTables::default();
        let copied = [
            (&compiled.mapping_table, &mut tables.mapping_table),
            (&compiled.vmap_table, &mut tables.vmap_table),
            (&compiled.gc_map, &mut tables.gc_map),
        ]
        .into_iter()
        .filter_map(|(bytes, slot)| bytes.as_ref().map(|bytes| (bytes, slot)))
        .try_for_each(|(bytes, slot)| {
            *slot = Some(self.add_data_array(bytes)?);
            Ok::<_, CodeCacheError>(())
        });

        let result = copied.and_then(|()| {
            self.commit_code(method, tables, compiled.frame_info, &compiled.code)
        });
        if result.is_err() {
            self.inner.release_data(&tables);
        }
        result
    }
}

impl CacheShared {
    fn commit_code_internal(
        &self,
        method: &Arc<dyn JitMethod>,
        tables: &SideTables,
        frame_info: FrameInfo,
        code: &[u8],
        code_size: u32,
    ) -> Option<NonNull<MethodHeader>> {
        let alignment = self.isa.alignment();
        let header_size = aligned_header_size(self.isa);
        let total = header_size + code.len();

        let _suspension = ScopedThreadSuspension::new(&*self.runtime);
        let mut state = self.lock.lock();
        self.wait_for_potential_collection_to_complete(&mut state);

        let memory = state.code_arena.alloc(total, alignment)?;
        let header_ptr = memory.cast::<MethodHeader>();
        // SAFETY: the block is `header_size + code.len()` bytes long
        let code_ptr = unsafe { memory.add(header_size) };
        debug_assert!(is_aligned(code_ptr.as_ptr() as usize, alignment));

        {
            let _scope = self.regions.write_scope();
            // SAFETY: the block was just allocated in the code region, which
            // is writable inside the scope; the header fits before `code_ptr`
            unsafe {
                header_ptr.write(MethodHeader::new(
                    code_ptr, tables, frame_info, code_size,
                ));
                ptr::copy_nonoverlapping(code.as_ptr(), code_ptr.as_ptr(), code.len());
                flush_instruction_cache(code_ptr.as_ptr(), code.len());
            }
        }

        let code_start = code_ptr.as_ptr() as usize;
        state.methods.insert(code_start, method.clone());
        method.set_entry_point(code_start + self.isa.code_delta());

        log::debug!(
            "committed {} at {:#x} ({} bytes), code cache {} / data {}",
            method.name(),
            code_start,
            code.len(),
            super::pretty_size(state.code_arena.bytes_allocated()),
            super::pretty_size(state.data_arena.bytes_allocated())
        );
        Some(header_ptr)
    }

    fn reserve_data_internal(&self, size: usize) -> Option<NonNull<u8>> {
        let _suspension = ScopedThreadSuspension::new(&*self.runtime);
        let mut state = self.lock.lock();
        self.wait_for_potential_collection_to_complete(&mut state);
        state.data_arena.alloc(size, mem::size_of::<usize>())
    }

    /// Returns side tables that were reserved for a commit that failed.
    fn release_data(&self, tables: &SideTables) {
        let _suspension = ScopedThreadSuspension::new(&*self.runtime);
        let mut state = self.lock.lock();
        self.wait_for_potential_collection_to_complete(&mut state);
        for table in tables.iter() {
            state.data_arena.free(table);
        }
    }
}
