use clap::Parser as ClapParser;
use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use codecache::{
    CompiledMethod, FrameInfo, Jit, JitMethod, JitOptions, ManagedMethod,
    MethodCompiler, Runtime, ThreadRegistry,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Capacity of the code cache in KiB (code and data together)
    #[arg(long, default_value_t = 256)]
    code_cache_kb: usize,

    /// Invocations before a method gets compiled
    #[arg(long, default_value_t = 50)]
    compile_threshold: u16,

    /// Number of distinct methods the mutators call
    #[arg(long, default_value_t = 128)]
    methods: usize,

    /// Number of mutator threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Average size of a compiled method body in bytes
    #[arg(long, default_value_t = 512)]
    code_size: usize,

    /// Calls made by each mutator thread
    #[arg(long, default_value_t = 20_000)]
    rounds: usize,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

/// Emits filler instead of real machine code; nothing ever jumps into it.
struct SyntheticCompiler {
    code_size: usize,
}

impl MethodCompiler for SyntheticCompiler {
    fn compile(&self, method: &dyn JitMethod) -> Option<CompiledMethod> {
        let spread = method.name().bytes().map(usize::from).sum::<usize>() % 64;
        let len = (self.code_size / 2 + spread * self.code_size / 64).max(16);
        let mut compiled = CompiledMethod::new(vec![0xCC; len], FrameInfo::new(64, 0x4de0, 0));
        compiled.mapping_table = Some(vec![0; len / 16]);
        compiled.gc_map = Some(vec![0; len / 32 + 1]);
        if len % 3 == 0 {
            compiled.vmap_table = Some(vec![0; 12]);
        }
        Some(compiled)
    }
}

/// xorshift, enough to spread calls over the methods
fn next_random(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .init();

    let registry = ThreadRegistry::new();
    let options = JitOptions {
        code_cache_capacity: cli.code_cache_kb * 1024,
        compile_threshold: cli.compile_threshold,
    };
    let compiler = SyntheticCompiler {
        code_size: cli.code_size,
    };
    let jit = match Jit::create(options, Box::new(compiler), Arc::new(registry.clone())) {
        Ok(jit) => Arc::new(jit),
        Err(err) => {
            eprintln!("Error creating the jit: {err}");
            process::exit(1);
        }
    };

    let methods: Arc<Vec<Arc<dyn JitMethod>>> = Arc::new(
        (0..cli.methods)
            .map(|i| {
                Arc::new(ManagedMethod::new(format!("method#{i}"), registry.interpreter_bridge()))
                    as Arc<dyn JitMethod>
            })
            .collect(),
    );

    let start = Instant::now();
    let stop = Arc::new(AtomicBool::new(false));

    let collector = {
        let jit = jit.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("collector".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(20));
                    jit.code_cache().garbage_collect_cache();
                }
            })
    };

    let mutators = (0..cli.threads)
        .map(|t| {
            let jit = jit.clone();
            let registry = registry.clone();
            let methods = methods.clone();
            let rounds = cli.rounds;
            thread::Builder::new()
                .name(format!("mutator-{t}"))
                .spawn(move || {
                    let mutator = registry.attach_current_thread();
                    let mut seed = 0x9E37_79B9_7F4A_7C15 ^ (t as u64 + 1);
                    let mut compiled_calls = 0usize;
                    for _ in 0..rounds {
                        if methods.is_empty() {
                            break;
                        }
                        let method = &methods[next_random(&mut seed) as usize % methods.len()];
                        if jit.method_entered(method) {
                            let entry = method.entry_point();
                            if jit.code_cache().contains_pc(entry) {
                                // "execute" for the length of a safepoint poll
                                mutator.push_frame(entry + 8);
                                mutator.safepoint();
                                mutator.pop_frame();
                                compiled_calls += 1;
                            }
                        }
                        mutator.safepoint();
                    }
                    compiled_calls
                })
        })
        .collect::<Vec<_>>();

    let mut compiled_calls = 0;
    for mutator in mutators {
        match mutator.map(|handle| handle.join()) {
            Ok(Ok(calls)) => compiled_calls += calls,
            Ok(Err(_)) => eprintln!("a mutator thread panicked"),
            Err(err) => eprintln!("Error spawning mutator: {err}"),
        }
    }

    stop.store(true, Ordering::Release);
    match collector {
        Ok(handle) => {
            if handle.join().is_err() {
                eprintln!("the collector thread panicked");
            }
        }
        Err(err) => eprintln!("Error spawning collector: {err}"),
    }

    let stats = jit.code_cache().stats();
    println!("finished in {:?}", start.elapsed());
    println!(
        "compiled {} methods, skipped {}, {} calls ran compiled code",
        jit.compiled(),
        jit.skipped(),
        compiled_calls
    );
    println!("{stats}");
}
