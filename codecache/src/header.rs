use std::{mem, ptr::NonNull, slice};

use crate::{
    isa::{InstructionSet, JIT_CODE_ALIGNMENT},
    system::align_up,
};

/// Stack frame layout of a compiled method.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_size_in_bytes: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
}

impl FrameInfo {
    pub const fn new(
        frame_size_in_bytes: u32,
        core_spill_mask: u32,
        fp_spill_mask: u32,
    ) -> Self {
        Self {
            frame_size_in_bytes,
            core_spill_mask,
            fp_spill_mask,
        }
    }
}

/// Side tables of a method, already placed in the data region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SideTables {
    pub mapping_table: Option<NonNull<u8>>,
    pub vmap_table: Option<NonNull<u8>>,
    pub gc_map: Option<NonNull<u8>>,
}

impl SideTables {
    pub fn iter(&self) -> impl Iterator<Item = NonNull<u8>> {
        [self.mapping_table, self.vmap_table, self.gc_map]
            .into_iter()
            .flatten()
    }
}

/// Descriptor placed directly in front of every compiled method body.
///
/// Side tables are found by subtracting their offset from the code pointer;
/// they live in the data region, which is mapped below the code region.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader {
    mapping_table_offset: u32,
    vmap_table_offset: u32,
    gc_map_offset: u32,
    frame_info: FrameInfo,
    code_size: u32,
}

/// Bytes between an allocation start and its code body.
pub const HEADER_SIZE: usize = mem::size_of::<MethodHeader>();

const _: () = assert!(HEADER_SIZE % JIT_CODE_ALIGNMENT == 0);

/// `round_up(size_of::<MethodHeader>(), isa.alignment())`. The header is
/// padded to [`JIT_CODE_ALIGNMENT`], so this is [`HEADER_SIZE`] for every
/// instruction set.
pub const fn aligned_header_size(isa: InstructionSet) -> usize {
    align_up(HEADER_SIZE, isa.alignment())
}

fn backward_offset(code: usize, table: Option<NonNull<u8>>) -> u32 {
    match table {
        Some(table) => {
            let offset = code - table.as_ptr() as usize;
            debug_assert!(offset > 0 && offset <= u32::MAX as usize);
            offset as u32
        }
        None => 0,
    }
}

impl MethodHeader {
    /// Builds the header for a body at `code`. Every side table must lie
    /// below `code` and within 4 GiB of it.
    pub fn new(
        code: NonNull<u8>,
        tables: &SideTables,
        frame_info: FrameInfo,
        code_size: u32,
    ) -> Self {
        let code = code.as_ptr() as usize;
        Self {
            mapping_table_offset: backward_offset(code, tables.mapping_table),
            vmap_table_offset: backward_offset(code, tables.vmap_table),
            gc_map_offset: backward_offset(code, tables.gc_map),
            frame_info,
            code_size,
        }
    }

    /// Header of the body starting at `code`.
    #[inline]
    pub fn from_code_ptr(code: usize) -> *mut MethodHeader {
        (code - HEADER_SIZE) as *mut MethodHeader
    }

    #[inline]
    pub fn code_ptr(&self) -> *const u8 {
        (self as *const Self as *const u8).wrapping_add(HEADER_SIZE)
    }

    #[inline]
    pub fn code_start(&self) -> usize {
        self.code_ptr() as usize
    }

    #[inline]
    pub fn code_size(&self) -> usize {
        self.code_size as usize
    }

    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        let code = self.code_start();
        code <= pc && pc < code + self.code_size()
    }

    /// Callable address of the body on `isa`.
    #[inline]
    pub fn entry_point(&self, isa: InstructionSet) -> usize {
        self.code_start() + isa.code_delta()
    }

    #[inline]
    pub fn frame_info(&self) -> FrameInfo {
        self.frame_info
    }

    pub fn mapping_table_offset(&self) -> u32 {
        self.mapping_table_offset
    }

    pub fn vmap_table_offset(&self) -> u32 {
        self.vmap_table_offset
    }

    pub fn gc_map_offset(&self) -> u32 {
        self.gc_map_offset
    }

    fn table(&self, offset: u32) -> Option<NonNull<u8>> {
        if offset == 0 {
            return None;
        }
        NonNull::new(self.code_ptr().wrapping_sub(offset as usize) as *mut u8)
    }

    pub fn mapping_table(&self) -> Option<NonNull<u8>> {
        self.table(self.mapping_table_offset)
    }

    pub fn vmap_table(&self) -> Option<NonNull<u8>> {
        self.table(self.vmap_table_offset)
    }

    pub fn gc_map(&self) -> Option<NonNull<u8>> {
        self.table(self.gc_map_offset)
    }

    /// The machine code following this header.
    ///
    /// # Safety
    /// `self` must be a header installed in a live code cache.
    pub unsafe fn code(&self) -> &[u8] {
        // SAFETY: guaranteed by caller
        unsafe { slice::from_raw_parts(self.code_ptr(), self.code_size()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_one_aligned_block() {
        assert_eq!(HEADER_SIZE, 32);
        assert_eq!(mem::align_of::<MethodHeader>(), JIT_CODE_ALIGNMENT);
        for isa in [
            InstructionSet::Thumb2,
            InstructionSet::Arm64,
            InstructionSet::X86,
            InstructionSet::X86_64,
            InstructionSet::Mips,
            InstructionSet::Mips64,
        ] {
            assert_eq!(aligned_header_size(isa), HEADER_SIZE);
        }
    }

    #[test]
    fn side_tables_roundtrip_through_offsets() {
        let mut block = [0u128; 8];
        let base = block.as_mut_ptr() as *mut u8;
        // SAFETY: all inside `block`
        let (mapping, gc_map, header_ptr) =
            unsafe { (base, base.add(16), base.add(64) as *mut MethodHeader) };
        let code = unsafe { NonNull::new_unchecked(base.add(64 + HEADER_SIZE)) };

        let tables = SideTables {
            mapping_table: NonNull::new(mapping),
            vmap_table: None,
            gc_map: NonNull::new(gc_map),
        };
        let header = MethodHeader::new(code, &tables, FrameInfo::new(64, 0b11, 0), 16);
        // SAFETY: header_ptr is aligned and inside `block`
        let header = unsafe {
            header_ptr.write(header);
            &*header_ptr
        };

        assert_eq!(header.code_start(), code.as_ptr() as usize);
        assert_eq!(header.mapping_table(), NonNull::new(mapping));
        assert_eq!(header.gc_map(), NonNull::new(gc_map));
        assert_eq!(header.vmap_table(), None);
        assert_eq!(header.vmap_table_offset(), 0);
        assert_eq!(header.gc_map_offset(), 64 + HEADER_SIZE as u32 - 16);
        assert_eq!(header.frame_info().frame_size_in_bytes, 64);
        assert_eq!(
            MethodHeader::from_code_ptr(header.code_start()),
            header_ptr
        );
    }

    #[test]
    fn contains_is_half_open() {
        let mut block = [0u128; 4];
        let header_ptr = block.as_mut_ptr() as *mut MethodHeader;
        // SAFETY: aligned and in bounds
        let header = unsafe {
            let code = NonNull::new_unchecked((header_ptr as *mut u8).add(HEADER_SIZE));
            header_ptr.write(MethodHeader::new(code, &SideTables::default(), FrameInfo::default(), 24));
            &*header_ptr
        };
        let code = header.code_start();
        assert!(header.contains(code));
        assert!(header.contains(code + 23));
        assert!(!header.contains(code + 24));
        assert!(!header.contains(code - 1));
        assert!(!header.contains(header_ptr as usize));
        assert_eq!(header.entry_point(InstructionSet::Thumb2), code + 1);
        assert_eq!(header.entry_point(InstructionSet::Arm64), code);
    }
}
