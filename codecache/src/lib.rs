mod arena;
mod barrier;
mod bitmap;
mod cache;
mod error;
mod header;
mod isa;
mod jit;
mod method;
mod region;
mod runtime;
mod system;

pub use arena::Arena;
pub use barrier::Barrier;
pub use bitmap::CodeCacheBitmap;
pub use cache::{
    CodeCacheCreateInfo, CodeCacheStats, CodeInfo, CompiledMethod,
    DEFAULT_CAPACITY, JitCodeCache, pretty_size,
};
pub use error::CodeCacheError;
pub use header::{FrameInfo, HEADER_SIZE, MethodHeader, SideTables, aligned_header_size};
pub use isa::{InstructionSet, JIT_CODE_ALIGNMENT, RUNTIME_ISA};
pub use jit::{Jit, JitOptions, MethodCompiler};
pub use method::{JitMethod, ManagedMethod};
pub use region::{MAX_CAPACITY, MemoryRegion, RegionPair};
pub use runtime::{
    Checkpoint, Mutator, Runtime, ScopedThreadSuspension, StackWalker,
    ThreadRegistry, ThreadState,
};
pub use system::{Protection, page_size};

#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
