//! Hotness-driven compilation on top of the code cache.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    CodeCacheCreateInfo, CodeCacheError, CompiledMethod, JitCodeCache,
    JitMethod, Runtime, ScopedThreadSuspension, cache::DEFAULT_CAPACITY,
};

/// Produces machine code for a method. Returning `None` leaves the method
/// to the interpreter.
pub trait MethodCompiler: Send + Sync {
    fn compile(&self, method: &dyn JitMethod) -> Option<CompiledMethod>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitOptions {
    pub code_cache_capacity: usize,
    /// Invocations before a method is compiled.
    pub compile_threshold: u16,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            code_cache_capacity: DEFAULT_CAPACITY,
            compile_threshold: 1000,
        }
    }
}

impl JitOptions {
    /// Cache capacity is checked when the cache is created.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.compile_threshold == 0 {
            return Err("compile_threshold must be > 0");
        }
        Ok(())
    }
}

pub struct Jit {
    cache: JitCodeCache,
    compiler: Box<dyn MethodCompiler>,
    options: JitOptions,
    /// one compilation at a time, so a method is never committed twice
    compile_lock: Mutex<()>,
    compiled: AtomicUsize,
    skipped: AtomicUsize,
}

impl std::fmt::Debug for Jit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jit")
            .field("cache", &self.cache)
            .field("options", &self.options)
            .field("compiled", &self.compiled)
            .field("skipped", &self.skipped)
            .finish_non_exhaustive()
    }
}

impl Jit {
    pub fn create(
        options: JitOptions,
        compiler: Box<dyn MethodCompiler>,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Self, CodeCacheError> {
        options.validate().map_err(CodeCacheError::InvalidOptions)?;
        let cache = JitCodeCache::create(
            CodeCacheCreateInfo::with_capacity(options.code_cache_capacity),
            runtime,
        )?;
        Ok(Self {
            cache,
            compiler,
            options,
            compile_lock: Mutex::new(()),
            compiled: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn code_cache(&self) -> &JitCodeCache {
        &self.cache
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    /// Methods successfully compiled so far.
    pub fn compiled(&self) -> usize {
        self.compiled.load(Ordering::Relaxed)
    }

    /// Compilations dropped because the cache was full.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Records an invocation of `method`, compiling it once it is hot.
    /// Returns whether the method has compiled code afterwards.
    pub fn method_entered(&self, method: &Arc<dyn JitMethod>) -> bool {
        if self.cache.contains_pc(method.entry_point()) {
            return true;
        }
        if method.increment_counter() < self.options.compile_threshold {
            return false;
        }
        self.compile_method(method)
    }

    /// Compiles `method` and installs it, unless it is already installed.
    pub fn compile_method(&self, method: &Arc<dyn JitMethod>) -> bool {
        // a thread blocked here must not hold up a collection's checkpoint
        let _guard = {
            let _suspension = ScopedThreadSuspension::new(&**self.cache.runtime());
            self.compile_lock.lock()
        };
        if self.cache.contains_method(method) {
            return true;
        }

        let Some(compiled) = self.compiler.compile(&**method) else {
            log::debug!("compiler declined {}", method.name());
            method.clear_counter();
            return false;
        };

        match self.cache.add_compiled_method(method, &compiled) {
            Ok(_) => {
                self.compiled.fetch_add(1, Ordering::Relaxed);
                log::debug!("compiled {}", method.name());
                true
            }
            Err(err) if err.is_recoverable() => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                method.clear_counter();
                log::info!("not compiling {}: {err}", method.name());
                false
            }
            Err(err) => {
                log::error!("compiling {} failed: {err}", method.name());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameInfo, ManagedMethod, ThreadRegistry, init_test_logging};

    struct FixedSize(usize);

    impl MethodCompiler for FixedSize {
        fn compile(&self, _method: &dyn JitMethod) -> Option<CompiledMethod> {
            let mut compiled =
                CompiledMethod::new(vec![0x90; self.0], FrameInfo::new(32, 0, 0));
            compiled.mapping_table = Some(vec![1, 2, 3]);
            compiled.gc_map = Some(vec![4; 12]);
            Some(compiled)
        }
    }

    struct Declines;

    impl MethodCompiler for Declines {
        fn compile(&self, _method: &dyn JitMethod) -> Option<CompiledMethod> {
            None
        }
    }

    fn jit(compiler: impl MethodCompiler + 'static, threshold: u16) -> (Jit, ThreadRegistry) {
        init_test_logging();
        let registry = ThreadRegistry::new();
        let options = JitOptions {
            code_cache_capacity: 64 * 1024,
            compile_threshold: threshold,
        };
        let jit = Jit::create(options, Box::new(compiler), Arc::new(registry.clone()))
            .expect("create jit");
        (jit, registry)
    }

    fn method(registry: &ThreadRegistry, name: &str) -> Arc<dyn JitMethod> {
        Arc::new(ManagedMethod::new(name, registry.interpreter_bridge()))
    }

    #[test]
    fn compiles_once_hot() {
        let (jit, registry) = jit(FixedSize(64), 3);
        let m = method(&registry, "hot");

        assert!(!jit.method_entered(&m));
        assert!(!jit.method_entered(&m));
        assert!(jit.method_entered(&m));
        assert!(jit.code_cache().contains_pc(m.entry_point()));
        assert_eq!(jit.compiled(), 1);

        // further calls do not recompile
        assert!(jit.method_entered(&m));
        assert_eq!(jit.compiled(), 1);
        assert_eq!(jit.code_cache().number_of_compiled_code(), 1);
        assert!(jit.code_cache().data_cache_size() >= 8 + 16);
    }

    #[test]
    fn declined_methods_stay_interpreted() {
        let (jit, registry) = jit(Declines, 1);
        let m = method(&registry, "cold");
        assert!(!jit.method_entered(&m));
        assert_eq!(m.entry_point(), registry.interpreter_bridge());
        assert_eq!(jit.compiled(), 0);
    }

    #[test]
    fn full_cache_skips_compilation() {
        let (jit, registry) = jit(FixedSize(1 << 20), 1);
        let m = method(&registry, "huge");
        assert!(!jit.method_entered(&m));
        assert_eq!(jit.skipped(), 1);
        assert_eq!(m.entry_point(), registry.interpreter_bridge());
        // side tables of the failed attempt were returned
        assert_eq!(jit.code_cache().data_cache_size(), 0);
    }

    #[test]
    fn evicted_methods_warm_up_again() {
        let (jit, registry) = jit(FixedSize(64), 2);
        let m = method(&registry, "evicted");
        jit.method_entered(&m);
        assert!(jit.method_entered(&m));

        jit.code_cache().garbage_collect_cache();
        assert_eq!(m.entry_point(), registry.interpreter_bridge());
        assert_eq!(jit.code_cache().number_of_compiled_code(), 0);
        assert_eq!(jit.code_cache().data_cache_size(), 0);

        assert!(!jit.method_entered(&m));
        assert!(jit.method_entered(&m));
        assert_eq!(jit.compiled(), 2);
    }

    #[test]
    fn rejects_zero_threshold() {
        let registry = ThreadRegistry::new();
        let options = JitOptions {
            compile_threshold: 0,
            ..JitOptions::default()
        };
        assert!(options.validate().is_err());
        assert!(matches!(
            Jit::create(options, Box::new(Declines), Arc::new(registry)),
            Err(CodeCacheError::InvalidOptions(_))
        ));
    }

    #[test]
    fn rejects_zero_capacity() {
        let registry = ThreadRegistry::new();
        let options = JitOptions {
            code_cache_capacity: 0,
            ..JitOptions::default()
        };
        assert!(matches!(
            Jit::create(options, Box::new(Declines), Arc::new(registry)),
            Err(CodeCacheError::CapacityInvalid { .. })
        ));
    }
}
