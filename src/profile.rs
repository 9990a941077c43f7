//! Execution profiling: opcode and call counters, loop back-edge detection,
//! per-argument type feedback, branch bias, and the hotspot state machine
//! that promotes functions and loops to JIT candidates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::bytecode::Op;

const OPCODE_SLOTS: usize = 64;

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub enabled: bool,
    pub opcode_counters: bool,
    pub call_tracking: bool,
    pub hot_loop_detect: bool,
    pub alloc_tracking: bool,
    /// Function execution-counter threshold before `Hot`; `Warm` triggers at
    /// a tenth of this.
    pub hot_threshold: u64,
    /// Loop back-edge threshold, independent of the function threshold.
    pub loop_hot_threshold: u32,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            enabled: true,
            opcode_counters: true,
            call_tracking: true,
            hot_loop_detect: true,
            alloc_tracking: true,
            hot_threshold: 1000,
            loop_hot_threshold: 1000,
        }
    }
}

/// Per-opcode execution counter, indexed by the opcode's byte value.
pub struct OpcodeCounters {
    counts: [AtomicU64; OPCODE_SLOTS],
}

impl OpcodeCounters {
    pub fn new() -> Self {
        OpcodeCounters {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline(always)]
    pub fn record(&self, op: Op) {
        self.counts[op as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, op: Op) -> u64 {
        self.counts[op as usize].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FuncProfile {
    pub calls: u64,
    pub self_time_ns: u64,
}

/// Wall-clock call tracking keyed by function id, with a per-worker call
/// stack for self-time accounting.
pub struct CallTracker {
    profiles: Mutex<HashMap<u64, FuncProfile>>,
    call_stack: Mutex<Vec<(u64, Instant)>>,
}

impl CallTracker {
    pub fn new() -> Self {
        CallTracker {
            profiles: Mutex::new(HashMap::new()),
            call_stack: Mutex::new(Vec::new()),
        }
    }

    pub fn enter(&self, function_id: u64) {
        self.profiles.lock().entry(function_id).or_default().calls += 1;
        self.call_stack.lock().push((function_id, Instant::now()));
    }

    pub fn exit(&self) {
        let mut stack = self.call_stack.lock();
        if let Some((id, start)) = stack.pop() {
            let elapsed = start.elapsed().as_nanos() as u64;
            if let Some(p) = self.profiles.lock().get_mut(&id) {
                p.self_time_ns += elapsed;
            }
        }
    }

    pub fn calls(&self, function_id: u64) -> u64 {
        self.profiles.lock().get(&function_id).map(|p| p.calls).unwrap_or(0)
    }

    pub fn top_n(&self, n: usize) -> Vec<(u64, FuncProfile)> {
        let profiles = self.profiles.lock();
        let mut entries: Vec<(u64, FuncProfile)> = profiles.iter().map(|(id, p)| (*id, p.clone())).collect();
        entries.sort_by(|a, b| b.1.self_time_ns.cmp(&a.1.self_time_ns));
        entries.truncate(n);
        entries
    }
}

/// Per-function hotspot classification, and analogously for individual
/// loops keyed by `(function, header offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotspotState {
    Cold,
    Warm,
    Hot,
    Compiled,
}

/// Tracks a function's execution counter and derives its hotspot state.
/// `Warm` begins at a tenth of `hot_threshold`; `Hot` at the full threshold.
/// `Compiled` is set explicitly once the JIT has installed native code and
/// is sticky — the counter keeps incrementing but no longer changes state.
pub struct HotspotTracker {
    exec_counts: Mutex<HashMap<u64, u64>>,
    compiled: Mutex<std::collections::HashSet<u64>>,
    loop_counts: Mutex<HashMap<(u64, usize), u32>>,
    hot_loops: Mutex<std::collections::HashSet<(u64, usize)>>,
    hot_threshold: u64,
    loop_hot_threshold: u32,
}

impl HotspotTracker {
    pub fn new(hot_threshold: u64, loop_hot_threshold: u32) -> Self {
        HotspotTracker {
            exec_counts: Mutex::new(HashMap::new()),
            compiled: Mutex::new(std::collections::HashSet::new()),
            loop_counts: Mutex::new(HashMap::new()),
            hot_loops: Mutex::new(std::collections::HashSet::new()),
            hot_threshold,
            loop_hot_threshold,
        }
    }

    /// Called on function entry. Returns `true` exactly once, the call that
    /// crosses the hot threshold, signalling the caller to enqueue
    /// compilation.
    pub fn enter_function(&self, function_id: u64) -> bool {
        let mut counts = self.exec_counts.lock();
        let count = counts.entry(function_id).or_insert(0);
        *count += 1;
        *count == self.hot_threshold
    }

    pub fn function_state(&self, function_id: u64) -> HotspotState {
        if self.compiled.lock().contains(&function_id) {
            return HotspotState::Compiled;
        }
        let count = self.exec_counts.lock().get(&function_id).copied().unwrap_or(0);
        if count >= self.hot_threshold {
            HotspotState::Hot
        } else if count >= self.hot_threshold / 10 {
            HotspotState::Warm
        } else {
            HotspotState::Cold
        }
    }

    pub fn mark_compiled(&self, function_id: u64) {
        self.compiled.lock().insert(function_id);
    }

    /// Called on every loop back-edge. Returns `true` the call that newly
    /// crosses the loop threshold.
    pub fn tick_loop(&self, function_id: u64, header_offset: usize) -> bool {
        let key = (function_id, header_offset);
        let mut counts = self.loop_counts.lock();
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        if *count == self.loop_hot_threshold {
            self.hot_loops.lock().insert(key);
            return true;
        }
        false
    }

    pub fn is_loop_hot(&self, function_id: u64, header_offset: usize) -> bool {
        self.hot_loops.lock().contains(&(function_id, header_offset))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservedType {
    Int,
    Float,
    String,
    Other,
}

/// Per-argument-position type feedback, converging to a single observed
/// type or `None` once two distinct types have been seen (mixed).
#[derive(Debug, Clone, Default)]
struct ArgFeedback {
    seen: Option<ObservedType>,
    mixed: bool,
}

/// Type feedback keyed by `(function, argument position)`, and branch bias
/// keyed by `(function, branch instruction offset)`.
pub struct TypeProfile {
    args: Mutex<HashMap<(u64, usize), ArgFeedback>>,
    branches: Mutex<HashMap<(u64, usize), (u64, u64)>>,
}

impl TypeProfile {
    pub fn new() -> Self {
        TypeProfile {
            args: Mutex::new(HashMap::new()),
            branches: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe_arg(&self, function_id: u64, position: usize, ty: ObservedType) {
        let mut args = self.args.lock();
        let entry = args.entry((function_id, position)).or_default();
        match entry.seen {
            None => entry.seen = Some(ty),
            Some(prev) if prev == ty => {}
            Some(_) => entry.mixed = true,
        }
    }

    /// `None` if unobserved or mixed; `Some(ty)` if monomorphic so far.
    pub fn stable_arg_type(&self, function_id: u64, position: usize) -> Option<ObservedType> {
        let args = self.args.lock();
        let entry = args.get(&(function_id, position))?;
        if entry.mixed {
            None
        } else {
            entry.seen
        }
    }

    pub fn observe_branch(&self, function_id: u64, offset: usize, taken: bool) {
        let mut branches = self.branches.lock();
        let (taken_count, not_taken_count) = branches.entry((function_id, offset)).or_insert((0, 0));
        if taken {
            *taken_count += 1;
        } else {
            *not_taken_count += 1;
        }
    }

    /// Fraction of observations where the branch was taken; `None` if
    /// unobserved.
    pub fn branch_bias(&self, function_id: u64, offset: usize) -> Option<f64> {
        let branches = self.branches.lock();
        let (taken, not_taken) = *branches.get(&(function_id, offset))?;
        let total = taken + not_taken;
        if total == 0 {
            None
        } else {
            Some(taken as f64 / total as f64)
        }
    }
}

pub struct AllocTracker {
    total_bytes: AtomicU64,
    total_allocs: AtomicU64,
    start_time: Instant,
}

impl AllocTracker {
    pub fn new() -> Self {
        AllocTracker {
            total_bytes: AtomicU64::new(0),
            total_allocs: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline(always)]
    pub fn record(&self, bytes: usize) {
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_mb_per_sec(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.total_bytes.load(Ordering::Relaxed) as f64 / elapsed / (1024.0 * 1024.0)
    }
}

/// Ties every counter together behind the runtime's single profiling
/// entry point; each sub-tracker is independently toggleable via
/// `ProfilerConfig` so a release build can drop to near-zero overhead.
pub struct Profiler {
    pub config: ProfilerConfig,
    pub opcodes: OpcodeCounters,
    pub calls: CallTracker,
    pub hotspots: HotspotTracker,
    pub types: TypeProfile,
    pub allocs: AllocTracker,
    instruction_count: AtomicU64,
    start_time: Instant,
}

impl Profiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Profiler {
            hotspots: HotspotTracker::new(config.hot_threshold, config.loop_hot_threshold),
            opcodes: OpcodeCounters::new(),
            calls: CallTracker::new(),
            types: TypeProfile::new(),
            allocs: AllocTracker::new(),
            config,
            instruction_count: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline(always)]
    pub fn record_op(&self, op: Op) {
        if self.config.opcode_counters {
            self.opcodes.record(op);
        }
        self.instruction_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Called on function entry. Returns `true` the call that crosses the
    /// hot threshold, meaning the caller should enqueue JIT compilation.
    pub fn enter_function(&self, function_id: u64) -> bool {
        if self.config.call_tracking {
            self.calls.enter(function_id);
        }
        self.hotspots.enter_function(function_id)
    }

    pub fn exit_function(&self) {
        if self.config.call_tracking {
            self.calls.exit();
        }
    }

    pub fn loop_tick(&self, function_id: u64, header_offset: usize) -> bool {
        if !self.config.hot_loop_detect {
            return false;
        }
        self.hotspots.tick_loop(function_id, header_offset)
    }

    pub fn record_alloc(&self, bytes: usize) {
        if self.config.alloc_tracking {
            self.allocs.record(bytes);
        }
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instruction_count.load(Ordering::Relaxed)
    }

    pub fn log_summary(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let instrs = self.instructions_executed();
        let mips = if elapsed > 0.001 { instrs as f64 / elapsed / 1_000_000.0 } else { 0.0 };
        debug!(instrs, mips, alloc_rate_mb_s = self.allocs.rate_mb_per_sec(), "profile summary");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_hotspot_state_progresses_cold_warm_hot() {
        let tracker = HotspotTracker::new(100, 1000);
        assert_eq!(tracker.function_state(1), HotspotState::Cold);
        for _ in 0..10 {
            tracker.enter_function(1);
        }
        assert_eq!(tracker.function_state(1), HotspotState::Warm);
        let mut crossed = false;
        for _ in 10..100 {
            crossed |= tracker.enter_function(1);
        }
        assert!(crossed);
        assert_eq!(tracker.function_state(1), HotspotState::Hot);
    }

    #[test]
    fn mark_compiled_is_sticky() {
        let tracker = HotspotTracker::new(10, 1000);
        for _ in 0..10 {
            tracker.enter_function(1);
        }
        tracker.mark_compiled(1);
        tracker.enter_function(1);
        assert_eq!(tracker.function_state(1), HotspotState::Compiled);
    }

    #[test]
    fn loop_tick_reports_hot_crossing_exactly_once() {
        let tracker = HotspotTracker::new(100, 3);
        assert!(!tracker.tick_loop(1, 20));
        assert!(!tracker.tick_loop(1, 20));
        assert!(tracker.tick_loop(1, 20));
        assert!(!tracker.tick_loop(1, 20));
        assert!(tracker.is_loop_hot(1, 20));
    }

    #[test]
    fn type_profile_goes_mixed_after_second_distinct_type() {
        let profile = TypeProfile::new();
        profile.observe_arg(1, 0, ObservedType::Int);
        profile.observe_arg(1, 0, ObservedType::Int);
        assert_eq!(profile.stable_arg_type(1, 0), Some(ObservedType::Int));
        profile.observe_arg(1, 0, ObservedType::Float);
        assert_eq!(profile.stable_arg_type(1, 0), None);
    }

    #[test]
    fn branch_bias_reflects_taken_ratio() {
        let profile = TypeProfile::new();
        profile.observe_branch(1, 5, true);
        profile.observe_branch(1, 5, true);
        profile.observe_branch(1, 5, false);
        assert!((profile.branch_bias(1, 5).unwrap() - (2.0 / 3.0)).abs() < 1e-9);
    }
}
