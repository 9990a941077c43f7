//! Vesper demo harness: loads a program image and runs its entry function.
//!
//! This is not a language toolchain — no parser, formatter, or package
//! manager lives here. A DAP server, a profiler reporter, or a full CLI
//! driving `vesper::hooks` is a peripheral consumer of the library; this
//! binary only proves the library runs a program end to end.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser as ClapParser;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use vesper::config::SchedulerMode;
use vesper::scheduler::{CooperativeScheduler, WorkStealingScheduler};
use vesper::{Config, Gc, JitCompiler, Profiler, ProgramImage, Registry, StepOutcome, Vm};

/// OS thread stack for the worker running the VM loop — distinct from
/// `Config::stack_size`, which sizes the interpreter's own operand stack.
const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(ClapParser)]
#[command(name = "vesper", version, about = "Runs a vesper program image")]
struct Cli {
    /// Path to a program image (JSON, per `vesper::loader::ProgramImage`)
    image: PathBuf,

    /// Optional TOML configuration file; falls back to defaults plus
    /// environment overrides (`VESPER_WORKER_COUNT`, `VESPER_LOG`, ...)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path).map_err(|e| miette::miette!("{e}"))?,
        None => Config::with_env_overrides(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = std::thread::Builder::new()
        .name("vesper-worker".into())
        .stack_size(WORKER_STACK_SIZE)
        .spawn(move || std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli.image, config))))
        .expect("failed to spawn vesper worker thread")
        .join();

    match result {
        Ok(inner) => inner,
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unexpected panic in vesper runtime".to_string()
            };
            Err(miette::miette!("vesper crashed: {msg}"))
        }
    }
}

fn run(image_path: PathBuf, config: Config) -> Result<()> {
    let text = std::fs::read_to_string(&image_path)
        .map_err(|e| miette::miette!("cannot read '{}': {e}", image_path.display()))?;
    let image: ProgramImage = serde_json::from_str(&text).into_diagnostic()?;

    let registry = Arc::new(Registry::new());
    registry
        .load_image(&image)
        .map_err(|e| miette::miette!("failed to load program image: {e}"))?;
    registry.freeze();

    let entry = registry
        .entry_function()
        .ok_or_else(|| miette::miette!("program image names no entry function"))?;

    let gc = Arc::new(Gc::new(config.young_threshold, config.old_threshold, config.promotion_threshold, config.mark_work_limit));
    let profiler = Arc::new(Profiler::new(vesper::profile::ProfilerConfig {
        hot_threshold: config.jit_hot_threshold,
        ..Default::default()
    }));
    let jit = Arc::new(JitCompiler::new());
    let mut vm = Vm::new(registry, gc, profiler.clone(), jit, &config);

    // The `WorkStealingScheduler`'s per-worker deques aren't driven by a
    // multi-threaded executor yet; under this mode we still run every task
    // on the single-threaded cooperative driver below, but attach the real
    // `StwController` so `Vm::step` pays the safepoint-poll cost a future
    // multi-worker driver would require.
    if config.scheduler_mode == SchedulerMode::WorkStealing {
        let (ws, _workers) = WorkStealingScheduler::new(config.worker_count);
        vm = vm.with_stw(ws.stw.clone());
        tracing::info!(worker_count = config.worker_count, "work-stealing mode requested; running on the cooperative driver with STW polling attached");
    }

    let mut scheduler = CooperativeScheduler::new(config.time_slice, config.stack_size, config.call_stack_size);
    let main_task = scheduler.spawn(entry, None, Vec::new(), None);

    match vm.drive(&mut scheduler, main_task, config.time_slice) {
        StepOutcome::Finished(value) => {
            println!("{}", value.display());
            profiler.log_summary();
            Ok(())
        }
        StepOutcome::Unhandled(value) => {
            profiler.log_summary();
            Err(miette::miette!("unhandled exception: {}", value.display()))
        }
        StepOutcome::SliceExpired | StepOutcome::Blocked => {
            unreachable!("Vm::drive never returns while the main task is still runnable or blocked")
        }
    }
}
