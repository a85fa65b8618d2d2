use std::{ptr::NonNull, sync::Arc};

use super::{CacheShared, CacheState, CodeInfo, JitCodeCache};
use crate::{JitMethod, MethodHeader, method::same_method};

impl CacheShared {
    /// Strips the mode bit from `pc` on instruction sets that have one:
    /// return addresses and entry points point one past the instruction.
    #[inline]
    fn adjust_pc(&self, pc: usize) -> usize {
        if self.isa.has_mode_bit() {
            pc.wrapping_sub(self.isa.code_delta())
        } else {
            pc
        }
    }

    /// Header and owner of the method containing `pc`, already adjusted.
    fn find_locked<'a>(
        &self,
        state: &'a CacheState,
        pc: usize,
    ) -> Option<(&'a MethodHeader, &'a Arc<dyn JitMethod>)> {
        if state.methods.is_empty() {
            return None;
        }
        let (&code, method) = state.methods.range(..=pc).next_back()?;
        // SAFETY: keys are code starts of installed headers, which stay put
        // while the monitor is held
        let header = unsafe { &*MethodHeader::from_code_ptr(code) };
        header.contains(pc).then_some((header, method))
    }

    /// Finds the header of the method whose body contains `pc`.
    ///
    /// Does not wait for a running collection; the collector's own
    /// checkpoint calls this.
    pub fn lookup_method_header(
        &self,
        pc: usize,
        method: Option<&Arc<dyn JitMethod>>,
    ) -> Option<NonNull<MethodHeader>> {
        let pc = self.adjust_pc(pc);
        if !self.regions.code().contains(pc) {
            return None;
        }

        let state = self.lock.lock();
        let (header, found) = self.find_locked(&state, pc)?;
        if let Some(method) = method {
            debug_assert!(
                same_method(&**method, &**found),
                "pc {pc:#x} belongs to {}, expected {}",
                found.name(),
                method.name()
            );
        }
        Some(NonNull::from(header))
    }

    fn lookup_method(&self, pc: usize) -> Option<CodeInfo> {
        let pc = self.adjust_pc(pc);
        if !self.regions.code().contains(pc) {
            return None;
        }

        let state = self.lock.lock();
        let (header, method) = self.find_locked(&state, pc)?;
        Some(CodeInfo {
            code_start: header.code_start(),
            code_size: header.code_size(),
            frame_info: header.frame_info(),
            method: method.clone(),
        })
    }
}

impl JitCodeCache {
    /// Header of the method whose code contains `pc`, or `None` for PCs
    /// outside any installed method.
    ///
    /// The pointer is only valid until the method is collected; stack walkers
    /// running concurrently with collection should prefer
    /// [`JitCodeCache::lookup_method`].
    pub fn lookup_method_header(
        &self,
        pc: usize,
        method: Option<&Arc<dyn JitMethod>>,
    ) -> Option<NonNull<MethodHeader>> {
        self.inner.lookup_method_header(pc, method)
    }

    /// Snapshot of the method whose code contains `pc`, taken under the
    /// cache monitor.
    pub fn lookup_method(&self, pc: usize) -> Option<CodeInfo> {
        self.inner.lookup_method(pc)
    }
}
