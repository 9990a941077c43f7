//! Debugger and profiler control surfaces.
//!
//! These are the hooks a DAP server or a profiler reporter drives the
//! runtime through; neither protocol is implemented here; this module only
//! exposes the control points (`Debugger`, `ProfilerControl`) and the event
//! stream a host subscribes to. Source-level concerns the bytecode layer
//! doesn't retain — variable names, file paths per function — are named by
//! slot index or left to the caller to supply, since that mapping belongs
//! to whatever produced the program image, not to the runtime core.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::bytecode::Chunk;
use crate::class::Function;
use crate::interpreter::GlobalStore;
use crate::loader::Registry;
use crate::profile::Profiler;
use crate::task::Task;
use crate::value::Value;

// ---------------------------------------------------------------------
// Debugger
// ---------------------------------------------------------------------

/// Where a breakpoint is anchored. The runtime has no notion of source
/// files of its own; `file` is whatever label the host attaches to a
/// function's chunk when it loads the program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    Line { file: String, line: u32 },
    FunctionEntry { name: String },
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: u64,
    pub location: BreakpointLocation,
    pub condition: Option<String>,
    pub log_message: Option<String>,
    pub enabled: bool,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint(u64),
    Step,
    Pause,
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Into,
    Over,
    Out,
}

#[derive(Debug, Clone)]
pub enum DebugEvent {
    Stopped { task_id: u64, reason: StopReason },
    Continued { task_id: u64 },
    Breakpoint { task_id: u64, id: u64 },
    Step { task_id: u64 },
    Exception { task_id: u64, message: String },
    Terminated { task_id: u64 },
}

#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub function_name: String,
    pub line: u32,
    pub ip: usize,
    pub base: usize,
}

/// One local, named by its stack slot rather than a source identifier.
#[derive(Debug, Clone)]
pub struct LocalSlot {
    pub slot: usize,
    pub value: Value,
}

struct PendingStep {
    mode: StepMode,
    /// Frame count at the moment the step was requested; `Over`/`Out`
    /// resume interpretation (rather than stopping) until the frame count
    /// returns to or below this depth.
    depth: usize,
}

/// Per-task run-control state the interpreter's call site (or a harness
/// wrapping `Vm::run_slice`) consults between instructions.
#[derive(Default)]
struct TaskControl {
    pause_requested: AtomicBool,
    terminate_requested: AtomicBool,
    step: Mutex<Option<PendingStep>>,
}

/// Breakpoint bookkeeping, per-task run control, and the event stream a
/// host subscribes to. One instance is shared by every task in a process,
/// matching the registry's and profiler's own scoping.
pub struct Debugger {
    breakpoints: DashMap<u64, Breakpoint>,
    next_bp_id: AtomicU64,
    controls: DashMap<u64, Arc<TaskControl>>,
    events_tx: Sender<DebugEvent>,
    events_rx: Receiver<DebugEvent>,
}

impl Debugger {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Debugger {
            breakpoints: DashMap::new(),
            next_bp_id: AtomicU64::new(1),
            controls: DashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// A cloned receiver over the shared event stream; `crossbeam::channel`
    /// receivers are multi-consumer, so every subscriber sees every event.
    pub fn subscribe(&self) -> Receiver<DebugEvent> {
        self.events_rx.clone()
    }

    fn emit(&self, event: DebugEvent) {
        let _ = self.events_tx.send(event);
    }

    fn control(&self, task_id: u64) -> Arc<TaskControl> {
        self.controls.entry(task_id).or_insert_with(|| Arc::new(TaskControl::default())).clone()
    }

    pub fn set_line_breakpoint(&self, file: String, line: u32, condition: Option<String>, log_message: Option<String>) -> u64 {
        let id = self.next_bp_id.fetch_add(1, Ordering::Relaxed);
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                location: BreakpointLocation::Line { file, line },
                condition,
                log_message,
                enabled: true,
                hit_count: 0,
            },
        );
        id
    }

    pub fn set_function_breakpoint(&self, name: String, condition: Option<String>, log_message: Option<String>) -> u64 {
        let id = self.next_bp_id.fetch_add(1, Ordering::Relaxed);
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                location: BreakpointLocation::FunctionEntry { name },
                condition,
                log_message,
                enabled: true,
                hit_count: 0,
            },
        );
        id
    }

    pub fn clear_breakpoint(&self, id: u64) -> bool {
        self.breakpoints.remove(&id).is_some()
    }

    pub fn set_breakpoint_enabled(&self, id: u64, enabled: bool) -> bool {
        match self.breakpoints.get_mut(&id) {
            Some(mut bp) => {
                bp.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn list_breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.iter().map(|e| e.value().clone()).collect()
    }

    /// Called on function entry, ahead of the first instruction of the
    /// callee. Returns the breakpoint id if a function-entry breakpoint on
    /// `function` is enabled and its condition (if any) passes.
    pub fn check_call(&self, function: &Function, frame_depth: usize) -> Option<StopReason> {
        for mut entry in self.breakpoints.iter_mut() {
            let bp = entry.value_mut();
            if !bp.enabled {
                continue;
            }
            if let BreakpointLocation::FunctionEntry { name } = &bp.location {
                if name == &function.name {
                    bp.hit_count += 1;
                    let id = bp.id;
                    drop(entry);
                    let _ = frame_depth;
                    return Some(StopReason::Breakpoint(id));
                }
            }
        }
        None
    }

    /// Called at a line boundary (a harness-defined granularity, typically
    /// once per source line change within a function). Checks line
    /// breakpoints anchored to `file` and resolves any pending step
    /// request against the current frame depth.
    pub fn check_line(&self, file: &str, line: u32, frame_depth: usize, task_id: u64) -> Option<StopReason> {
        for mut entry in self.breakpoints.iter_mut() {
            let bp = entry.value_mut();
            if !bp.enabled {
                continue;
            }
            if let BreakpointLocation::Line { file: bp_file, line: bp_line } = &bp.location {
                if bp_file == file && *bp_line == line {
                    bp.hit_count += 1;
                    let id = bp.id;
                    drop(entry);
                    return Some(StopReason::Breakpoint(id));
                }
            }
        }

        let control = self.control(task_id);
        let mut pending = control.step.lock();
        if let Some(step) = pending.as_ref() {
            let reached = match step.mode {
                StepMode::Into => true,
                StepMode::Over => frame_depth <= step.depth,
                StepMode::Out => frame_depth < step.depth,
            };
            if reached {
                *pending = None;
                return Some(StopReason::Step);
            }
        }
        None
    }

    /// Convenience wrapper over `check_line` for a dispatch loop that only
    /// has a function and a byte offset on hand: derives the source line
    /// from the function's chunk line table and uses the function's own
    /// name as the file label, since the runtime retains no source paths.
    pub fn check_step_at(&self, function: &Function, chunk: &Chunk, ip: usize, frame_depth: usize, task_id: u64) -> Option<StopReason> {
        let line = line_for_offset(&chunk.line_info, ip);
        self.check_line(&function.name, line, frame_depth, task_id)
    }

    /// Records that `task_id` has stopped and publishes the event; a
    /// harness calls this once it has actually parked the task, after
    /// `check_call`/`check_line` returned a reason.
    pub fn record_stop(&self, task_id: u64, reason: StopReason) {
        self.emit(DebugEvent::Stopped { task_id, reason });
    }

    pub fn record_exception(&self, task_id: u64, message: String) {
        self.emit(DebugEvent::Exception { task_id, message });
    }

    pub fn record_terminated(&self, task_id: u64) {
        self.controls.remove(&task_id);
        self.emit(DebugEvent::Terminated { task_id });
    }

    pub fn pause(&self, task_id: u64) {
        self.control(task_id).pause_requested.store(true, Ordering::SeqCst);
    }

    /// Checked by the harness once per instruction or basic block; clears
    /// the flag on observation so a pause fires exactly once.
    pub fn pause_requested(&self, task_id: u64) -> bool {
        match self.controls.get(&task_id) {
            Some(c) => c.pause_requested.swap(false, Ordering::SeqCst),
            None => false,
        }
    }

    pub fn continue_task(&self, task_id: u64) {
        if let Some(c) = self.controls.get(&task_id) {
            *c.step.lock() = None;
        }
        self.emit(DebugEvent::Continued { task_id });
    }

    pub fn request_step(&self, task_id: u64, mode: StepMode, current_frame_depth: usize) {
        *self.control(task_id).step.lock() = Some(PendingStep { mode, depth: current_frame_depth });
        self.emit(DebugEvent::Step { task_id });
    }

    pub fn request_terminate(&self, task_id: u64) {
        self.control(task_id).terminate_requested.store(true, Ordering::SeqCst);
    }

    pub fn terminate_requested(&self, task_id: u64) -> bool {
        match self.controls.get(&task_id) {
            Some(c) => c.terminate_requested.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Innermost-first stack snapshot. `line` is the best-effort source
    /// line for the frame's current `ip`, derived from the function's
    /// chunk line table.
    pub fn query_stack(&self, task: &Task) -> Vec<FrameSnapshot> {
        task.frames
            .iter()
            .rev()
            .map(|frame| {
                let line = frame
                    .function
                    .code
                    .as_ref()
                    .map(|chunk| line_for_offset(&chunk.line_info, frame.ip))
                    .unwrap_or(0);
                FrameSnapshot {
                    function_name: frame.function.name.clone(),
                    line,
                    ip: frame.ip,
                    base: frame.base,
                }
            })
            .collect()
    }

    /// Locals of the frame at `frame_index` (0 = innermost), by slot.
    pub fn query_locals(&self, task: &Task, frame_index: usize) -> Vec<LocalSlot> {
        let Some(frame) = task.frames.iter().rev().nth(frame_index) else {
            return Vec::new();
        };
        (0..frame.function.local_slot_count)
            .map(|slot| LocalSlot { slot, value: task.operand_stack.get(frame.base + slot).clone() })
            .collect()
    }

    pub fn query_globals(&self, globals: &GlobalStore) -> Vec<(String, Value)> {
        globals.snapshot_named()
    }

    /// Evaluates a small expression language in the context of one frame:
    /// integer/float/bool/null/string literals, `$N` for local slot `N`,
    /// and a bare identifier resolved as a global. Anything beyond that —
    /// arithmetic, method calls — belongs to a real expression parser,
    /// which is outside what the runtime core carries.
    pub fn evaluate(&self, task: &Task, frame_index: usize, globals: &GlobalStore, registry: &Registry, expr: &str) -> Result<Value, String> {
        let expr = expr.trim();
        if let Some(rest) = expr.strip_prefix('$') {
            let slot: usize = rest.parse().map_err(|_| format!("not a local reference: {expr}"))?;
            let frame = task.frames.iter().rev().nth(frame_index).ok_or_else(|| "no such frame".to_string())?;
            return Ok(task.operand_stack.get(frame.base + slot).clone());
        }
        if expr == "true" {
            return Ok(Value::Bool(true));
        }
        if expr == "false" {
            return Ok(Value::Bool(false));
        }
        if expr == "null" {
            return Ok(Value::Null);
        }
        if let Some(inner) = expr.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            return Ok(Value::Str(Arc::from(inner)));
        }
        if let Ok(i) = expr.parse::<i64>() {
            return Ok(Value::Int(i));
        }
        if let Ok(f) = expr.parse::<f64>() {
            return Ok(Value::Float(f));
        }
        Ok(globals.load_named(expr, registry))
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary-searches `line_info` (offset-ascending `(offset, line)` pairs)
/// for the line covering `ip`; falls back to the last recorded line.
fn line_for_offset(line_info: &[(usize, u32)], ip: usize) -> u32 {
    match line_info.binary_search_by(|(off, _)| off.cmp(&ip)) {
        Ok(i) => line_info[i].1,
        Err(0) => 0,
        Err(i) => line_info[i - 1].1,
    }
}

// ---------------------------------------------------------------------
// Profiler control
// ---------------------------------------------------------------------

/// One CPU-usage sample: a snapshot of cumulative instruction and
/// allocation counters at the moment the sampling thread woke up.
#[derive(Debug, Clone)]
pub struct CpuSample {
    pub at: Instant,
    pub instructions_executed: u64,
    pub top_functions: Vec<(u64, u64)>,
}

/// One allocation site's running totals, keyed by a host-supplied
/// `(type_name, site)` label pair (e.g. `("Array", "MakeArray@142")`).
#[derive(Debug, Clone, Default)]
pub struct AllocRecord {
    pub bytes: u64,
    pub count: u64,
}

/// Start/stop control over CPU sampling and per-site memory tracking,
/// layered on top of `Profiler`'s always-on counters rather than
/// duplicating them.
pub struct ProfilerControl {
    profiler: Arc<Profiler>,
    memory_tracking: AtomicBool,
    alloc_sites: DashMap<(String, String), AllocRecord>,
    sampler: Mutex<Option<SamplerHandle>>,
    samples: Arc<Mutex<Vec<CpuSample>>>,
}

struct SamplerHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl ProfilerControl {
    pub fn new(profiler: Arc<Profiler>) -> Self {
        ProfilerControl {
            profiler,
            memory_tracking: AtomicBool::new(false),
            alloc_sites: DashMap::new(),
            sampler: Mutex::new(None),
            samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawns a background thread that snapshots the profiler's counters
    /// every `interval`. A no-op if sampling is already running.
    pub fn start_cpu_sampling(&self, interval: Duration) {
        let mut guard = self.sampler.lock();
        if guard.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = unbounded();
        let profiler = self.profiler.clone();
        let samples = self.samples.clone();
        let thread = std::thread::Builder::new()
            .name("vesper-cpu-sampler".into())
            .spawn(move || loop {
                if stop_rx.recv_timeout(interval).is_ok() {
                    return;
                }
                let sample = CpuSample {
                    at: Instant::now(),
                    instructions_executed: profiler.instructions_executed(),
                    top_functions: profiler.calls.top_n(8).into_iter().map(|(id, p)| (id, p.self_time_ns)).collect(),
                };
                debug!(instructions = sample.instructions_executed, "cpu sampler tick");
                samples.lock().push(sample);
            })
            .expect("failed to spawn cpu sampler thread");
        *guard = Some(SamplerHandle { stop_tx, thread });
    }

    pub fn stop_cpu_sampling(&self) {
        if let Some(handle) = self.sampler.lock().take() {
            let _ = handle.stop_tx.send(());
            let _ = handle.thread.join();
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.lock().is_some()
    }

    pub fn samples(&self) -> Vec<CpuSample> {
        self.samples.lock().clone()
    }

    pub fn start_memory_tracking(&self) {
        self.memory_tracking.store(true, Ordering::SeqCst);
    }

    pub fn stop_memory_tracking(&self) {
        self.memory_tracking.store(false, Ordering::SeqCst);
    }

    /// Attributes one allocation of `bytes` to `(type_name, site)`, and to
    /// the profiler's aggregate byte counter. A no-op when memory tracking
    /// is stopped, so disabling it drops the per-site bookkeeping cost.
    pub fn record_alloc(&self, type_name: &str, site: &str, bytes: usize) {
        self.profiler.record_alloc(bytes);
        if !self.memory_tracking.load(Ordering::Relaxed) {
            return;
        }
        let key = (type_name.to_string(), site.to_string());
        let mut entry = self.alloc_sites.entry(key).or_default();
        entry.bytes += bytes as u64;
        entry.count += 1;
    }

    pub fn alloc_sites(&self) -> Vec<((String, String), AllocRecord)> {
        self.alloc_sites.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::next_function_id;
    use crate::frame::CallFrame;
    use crate::loader::Registry;
    use crate::profile::ProfilerConfig;
    use crate::task::Task;

    fn plain_function(name: &str, local_slot_count: usize) -> Arc<Function> {
        Arc::new(Function {
            id: next_function_id(),
            name: name.to_string(),
            param_count: 0,
            min_arity: 0,
            defaults: Vec::new(),
            variadic: false,
            code: Some(Arc::new(crate::bytecode::Chunk::new())),
            local_slot_count,
            upvalue_count: 0,
            native: None,
            owning_class: None,
        })
    }

    #[test]
    fn function_breakpoint_fires_on_matching_call() {
        let dbg = Debugger::new();
        dbg.set_function_breakpoint("greet".into(), None, None);
        let f = plain_function("greet", 0);
        assert!(matches!(dbg.check_call(&f, 1), Some(StopReason::Breakpoint(_))));
        let other = plain_function("other", 0);
        assert!(dbg.check_call(&other, 1).is_none());
    }

    #[test]
    fn line_breakpoint_fires_once_for_matching_file_and_line() {
        let dbg = Debugger::new();
        let id = dbg.set_line_breakpoint("main.vsr".into(), 10, None, None);
        let hit = dbg.check_line("main.vsr", 10, 1, 99);
        assert_eq!(hit, Some(StopReason::Breakpoint(id)));
        assert!(dbg.check_line("main.vsr", 11, 1, 99).is_none());
    }

    #[test]
    fn step_over_stops_only_once_frame_depth_returns() {
        let dbg = Debugger::new();
        dbg.request_step(1, StepMode::Over, 3);
        assert!(dbg.check_line("f.vsr", 1, 4, 1).is_none());
        assert_eq!(dbg.check_line("f.vsr", 2, 3, 1), Some(StopReason::Step));
    }

    #[test]
    fn pause_flag_is_consumed_on_first_check() {
        let dbg = Debugger::new();
        dbg.pause(7);
        assert!(dbg.pause_requested(7));
        assert!(!dbg.pause_requested(7));
    }

    #[test]
    fn subscribe_receives_stop_event() {
        let dbg = Debugger::new();
        let rx = dbg.subscribe();
        dbg.record_stop(1, StopReason::Pause);
        match rx.try_recv() {
            Ok(DebugEvent::Stopped { task_id: 1, reason: StopReason::Pause }) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn query_stack_and_locals_reflect_pushed_frame() {
        let mut task = Task::new(1, None, 64, 16);
        let f = plain_function("main", 2);
        let mut frame = CallFrame::new(f, None, 0, false);
        frame.ip = 4;
        task.operand_stack.set(0, Value::Int(10));
        task.operand_stack.set(1, Value::Int(20));
        task.frames.push(frame);

        let dbg = Debugger::new();
        let stack = dbg.query_stack(&task);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].function_name, "main");

        let locals = dbg.query_locals(&task, 0);
        assert_eq!(locals.len(), 2);
        assert!(matches!(locals[0].value, Value::Int(10)));
        assert!(matches!(locals[1].value, Value::Int(20)));
    }

    #[test]
    fn evaluate_reads_local_slot_and_literal() {
        let mut task = Task::new(1, None, 64, 16);
        let f = plain_function("main", 1);
        let frame = CallFrame::new(f, None, 0, false);
        task.operand_stack.set(0, Value::Int(42));
        task.frames.push(frame);

        let dbg = Debugger::new();
        let registry = Registry::new();
        let globals = GlobalStore::new(4);
        assert!(matches!(dbg.evaluate(&task, 0, &globals, &registry, "$0"), Ok(Value::Int(42))));
        assert!(matches!(dbg.evaluate(&task, 0, &globals, &registry, "7"), Ok(Value::Int(7))));
        assert!(matches!(dbg.evaluate(&task, 0, &globals, &registry, "true"), Ok(Value::Bool(true))));
    }

    fn make_profiler_control() -> ProfilerControl {
        ProfilerControl::new(Arc::new(Profiler::new(ProfilerConfig::default())))
    }

    #[test]
    fn cpu_sampling_can_be_started_and_stopped() {
        let ctrl = make_profiler_control();
        assert!(!ctrl.is_sampling());
        ctrl.start_cpu_sampling(Duration::from_millis(5));
        assert!(ctrl.is_sampling());
        std::thread::sleep(Duration::from_millis(20));
        ctrl.stop_cpu_sampling();
        assert!(!ctrl.is_sampling());
        assert!(!ctrl.samples().is_empty());
    }

    #[test]
    fn alloc_records_accumulate_only_while_tracking_enabled() {
        let ctrl = make_profiler_control();
        ctrl.record_alloc("Array", "MakeArray", 32);
        assert!(ctrl.alloc_sites().is_empty());

        ctrl.start_memory_tracking();
        ctrl.record_alloc("Array", "MakeArray", 32);
        ctrl.record_alloc("Array", "MakeArray", 16);
        let sites = ctrl.alloc_sites();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].1.bytes, 48);
        assert_eq!(sites[0].1.count, 2);

        ctrl.stop_memory_tracking();
        ctrl.record_alloc("Array", "MakeArray", 100);
        assert_eq!(ctrl.alloc_sites()[0].1.bytes, 48);
    }
}
