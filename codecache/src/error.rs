use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodeCacheError {
    #[error("invalid code cache capacity {capacity} (must be in 1..{max})")]
    CapacityInvalid { capacity: usize, max: usize },

    #[error("failed to map {size} bytes for the code cache: {source}")]
    MappingFailed {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("code cache is full, could not fit {requested} bytes after a collection")]
    CacheFull { requested: usize },

    #[error("failed to change protection of the code cache: {0}")]
    ProtectionFailure(#[source] io::Error),

    #[error("refusing to commit an empty code buffer")]
    EmptyCode,

    #[error("side table at {ptr:#x} is not in the data region")]
    SideTableOutOfRange { ptr: usize },

    #[error("invalid jit options: {0}")]
    InvalidOptions(&'static str),
}

impl CodeCacheError {
    /// Whether the runtime can keep going by interpreting the method.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CodeCacheError::CacheFull { .. }
                | CodeCacheError::EmptyCode
                | CodeCacheError::SideTableOutOfRange { .. }
        )
    }
}
