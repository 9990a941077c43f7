//! The stack-machine dispatch loop: one `Vm` per process, consulted by the
//! scheduler to advance a `Task` by one time slice at a time.
//!
//! The loop itself never recurses at the Rust level — a language-level call
//! pushes a `CallFrame` onto the task's frame array and the loop keeps
//! stepping the new top frame; a language-level return pops it back off.
//! Locals live at `frame.base + slot` on the task's single shared operand
//! stack; upvalue slots beyond `local_slot_count` are redirected to the
//! active closure's capture list instead.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::bytecode::{ConstValue, Op};
use crate::channel::{Channel, ReceiveOutcome, SendOutcome, WakeEvent};
use crate::class::{Class, Closure, Function, Method, Upvalue, Visibility};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::frame::CallFrame;
use crate::gc::Gc;
use crate::hooks::Debugger;
use crate::inline_cache::InlineCacheManager;
use crate::jit::JitCompiler;
use crate::loader::Registry;
use crate::object::Object;
use crate::profile::Profiler;
use crate::scheduler::{CooperativeScheduler, StwController};
use crate::task::{BlockReason, Task, TaskStatus};
use crate::value::{IterSource, Iterator_, MapKey, SuperArray, SuperKey, Value};

/// Outcome of running a task for one scheduling slice.
pub enum StepOutcome {
    /// The task's frame stack emptied: it ran to completion with this value.
    Finished(Value),
    /// The task hit its instruction budget for this slice and is still runnable.
    SliceExpired,
    /// The task blocked on a channel send/receive; it stays off the run
    /// queue until a matching channel operation wakes it.
    Blocked,
    /// An exception propagated past every frame; this is its terminal value.
    Unhandled(Value),
}

enum ExceptionOutcome {
    Handled,
    Unhandled(Value),
}

/// Global variable storage. `LoadGlobal`/`StoreGlobal`'s operand indexes the
/// current chunk's constant pool: if that constant is a name string, the
/// variable resolves against `named` (falling back to a registered function
/// of the same name); otherwise the raw index addresses `positional`
/// directly.
pub struct GlobalStore {
    named: DashMap<String, Value>,
    positional: Mutex<Vec<Value>>,
}

impl GlobalStore {
    pub fn new(capacity: usize) -> Self {
        GlobalStore {
            named: DashMap::new(),
            positional: Mutex::new(vec![Value::Null; capacity]),
        }
    }

    pub fn load_named(&self, name: &str, registry: &Registry) -> Value {
        if let Some(v) = self.named.get(name) {
            return v.clone();
        }
        registry.lookup_function(name).map(Value::Function).unwrap_or(Value::Null)
    }

    fn store_named(&self, name: &str, value: Value) {
        self.named.insert(name.to_string(), value);
    }

    fn load_positional(&self, idx: usize) -> Value {
        self.positional.lock().get(idx).cloned().unwrap_or(Value::Null)
    }

    fn store_positional(&self, idx: usize, value: Value) {
        let mut slots = self.positional.lock();
        if idx >= slots.len() {
            slots.resize(idx + 1, Value::Null);
        }
        slots[idx] = value;
    }

    /// Every named global, for the debugger hook's global-scope query.
    pub fn snapshot_named(&self) -> Vec<(String, Value)> {
        self.named.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

/// Owns everything a program's execution needs that isn't task-local: the
/// function/class table, the GC's retention bookkeeping, the profiler, the
/// JIT's installed-code cache, the inline caches, and the global variable
/// store. One instance serves every task the scheduler runs.
pub struct Vm {
    pub registry: Arc<Registry>,
    pub gc: Arc<Gc>,
    pub profiler: Arc<Profiler>,
    pub jit: Arc<JitCompiler>,
    pub globals: GlobalStore,
    pub debugger: Arc<Debugger>,
    inline_caches: Mutex<InlineCacheManager>,
    jit_enabled: bool,
    call_stack_size: usize,
    /// Set only when `Config::scheduler_mode` is `WorkStealing`: polled once
    /// per instruction so a stop-the-world request can actually pause this
    /// worker. `None` under the cooperative scheduler, which has no other
    /// worker to coordinate with.
    stw: Option<Arc<StwController>>,
}

impl Vm {
    pub fn new(registry: Arc<Registry>, gc: Arc<Gc>, profiler: Arc<Profiler>, jit: Arc<JitCompiler>, config: &Config) -> Self {
        Vm {
            registry,
            gc,
            profiler,
            jit,
            globals: GlobalStore::new(config.globals_size),
            debugger: Arc::new(Debugger::new()),
            inline_caches: Mutex::new(InlineCacheManager::new(config.max_call_site_entries, config.max_property_cache_entries)),
            jit_enabled: config.jit_enabled,
            call_stack_size: config.call_stack_size,
            stw: None,
        }
    }

    /// Attaches the work-stealing scheduler's stop-the-world controller so
    /// `step()` polls it. Only meaningful when the host drives this `Vm`
    /// under `SchedulerMode::WorkStealing`.
    pub fn with_stw(mut self, stw: Arc<StwController>) -> Self {
        self.stw = Some(stw);
        self
    }

    /// Runs `task` for up to `max_instructions`, returning why it stopped.
    /// The caller (a scheduler) is responsible for re-invoking this on the
    /// next slice if the result is `SliceExpired`, or once the task is
    /// rescheduled after a `Blocked` channel wait.
    pub fn run_slice(&self, task: &mut Task, max_instructions: u32, scheduler: &mut CooperativeScheduler) -> StepOutcome {
        let mut executed = 0u32;
        loop {
            if task.frames.is_empty() {
                self.debugger.record_terminated(task.id);
                return StepOutcome::Finished(task.operand_stack.pop());
            }
            if task.status == TaskStatus::Blocked {
                return StepOutcome::Blocked;
            }
            if executed >= max_instructions {
                return StepOutcome::SliceExpired;
            }
            executed += 1;
            task.instructions_run_in_slice = executed;

            if let Err(e) = self.step(task, scheduler) {
                match self.raise(task, e) {
                    ExceptionOutcome::Handled => continue,
                    ExceptionOutcome::Unhandled(v) => {
                        task.status = TaskStatus::Dead;
                        task.exception = Some(v.clone());
                        self.debugger.record_terminated(task.id);
                        return StepOutcome::Unhandled(v);
                    }
                }
            }
        }
    }

    /// Drives every task in `scheduler` to completion, one scheduling slice
    /// at a time, and returns `main_task`'s own terminal outcome once it
    /// hits one — other tasks (spawned children) keep running after that
    /// point only if the caller drives further slices; their own faults
    /// terminate only themselves, never the caller's result.
    ///
    /// A task is detached from the scheduler's table for the duration of its
    /// slice (`CooperativeScheduler::take`/`put_back`) so `step()` can hold
    /// `&mut Task` and `&mut CooperativeScheduler` at once without aliasing.
    pub fn drive(&self, scheduler: &mut CooperativeScheduler, main_task: u64, time_slice: u32) -> StepOutcome {
        loop {
            let Some(id) = scheduler.schedule() else {
                if scheduler.is_empty() {
                    return StepOutcome::Finished(Value::Null);
                }
                // Every remaining task is blocked and nothing can unblock it.
                return StepOutcome::Unhandled(Value::Null);
            };
            let Some(mut task) = scheduler.take(id) else { continue };
            if let Some(pending) = task.pending_value.take() {
                let _ = task.operand_stack.push(pending);
            }

            let outcome = self.run_slice(&mut task, time_slice, scheduler);
            match outcome {
                StepOutcome::SliceExpired => {
                    task.status = TaskStatus::Runnable;
                    scheduler.put_back(task);
                    scheduler.yield_current();
                }
                StepOutcome::Blocked => {
                    scheduler.put_back(task);
                    scheduler.release_current();
                }
                StepOutcome::Finished(value) => {
                    scheduler.release_current();
                    scheduler.retire_taken(task);
                    if id == main_task {
                        return StepOutcome::Finished(value);
                    }
                }
                StepOutcome::Unhandled(value) => {
                    scheduler.release_current();
                    scheduler.retire_taken(task);
                    if id == main_task {
                        return StepOutcome::Unhandled(value);
                    }
                }
            }
        }
    }

    /// Starts a fresh call at the bottom of `task`'s (empty) frame stack.
    /// Used by the host to kick off a program's entry function and by tests.
    pub fn invoke(
        &self,
        task: &mut Task,
        function: Arc<Function>,
        closure: Option<Arc<Closure>>,
        receiver: Option<Value>,
        mut args: Vec<Value>,
        is_static: bool,
    ) -> Result<(), RuntimeError> {
        if args.len() < function.min_arity {
            return Err(RuntimeError::ArityBelowMinimum {
                name: function.name.clone(),
                min: function.min_arity,
                got: args.len(),
            });
        }
        if args.len() > function.max_arity() && !function.variadic {
            return Err(RuntimeError::ArityAboveMaximum {
                name: function.name.clone(),
                max: function.max_arity(),
                got: args.len(),
            });
        }
        while args.len() < function.param_count {
            let default_idx = args.len() - function.min_arity;
            args.push(function.defaults.get(default_idx).cloned().unwrap_or(Value::Null));
        }

        if let Some(native) = &function.native {
            let result = native(&args);
            task.operand_stack.push(result)?;
            return Ok(());
        }

        if self.jit_enabled && receiver.is_none() && closure.is_none() {
            if let Some(installed) = self.jit.lookup(function.id) {
                if let Some(int_args) = args_as_ints(&args) {
                    let result = unsafe { installed.invoke(&int_args) };
                    task.operand_stack.push(Value::Int(result))?;
                    return Ok(());
                }
            }
        }

        if task.frames.len() >= self.call_stack_size {
            return Err(RuntimeError::CallStackOverflow { depth: task.frames.len() });
        }

        let base = task.operand_stack.len();
        let mut filled = 0usize;
        if let Some(r) = receiver {
            task.operand_stack.push(r)?;
            filled += 1;
        }
        for arg in args {
            task.operand_stack.push(arg)?;
            filled += 1;
        }
        for _ in filled..function.local_slot_count {
            task.operand_stack.push(Value::Null)?;
        }

        let crossed_hot_threshold = self.profiler.enter_function(function.id);
        if self.jit_enabled && crossed_hot_threshold {
            self.jit.try_compile(&function);
        }

        task.frames.push(CallFrame::new(function.clone(), closure, base, is_static));
        if let Some(reason) = self.debugger.check_call(&function, task.frames.len()) {
            self.debugger.record_stop(task.id, reason);
        }
        Ok(())
    }

    /// Walks the frame stack inward-out looking for a `TryContext` covering
    /// the faulting instruction. On a match, truncates the stack to the
    /// frame's base, binds the exception at `catch_slot`, and resumes at
    /// `handler_ip`. Frames with no covering context are unwound entirely.
    fn raise(&self, task: &mut Task, err: RuntimeError) -> ExceptionOutcome {
        self.debugger.record_exception(task.id, err.to_string());
        let exc_value = self.make_exception(&err);
        loop {
            let Some(frame) = task.frames.last_mut() else {
                return ExceptionOutcome::Unhandled(exc_value);
            };
            if let Some(ctx) = frame.covering_try_context(frame.ip) {
                task.operand_stack.truncate(frame.base);
                frame.ip = ctx.handler_ip;
                task.operand_stack.set(frame.base + ctx.catch_slot as usize, exc_value);
                return ExceptionOutcome::Handled;
            }
            let popped = task.frames.pop().expect("checked Some above");
            task.operand_stack.truncate(popped.base);
        }
    }

    /// Builds the first-class exception `Object` a `RuntimeError` unwinds
    /// as, with its class bearing the `is_exception` marker and a `message`
    /// field carrying the fault's display text. Falls back to a bare string
    /// only if the builtin exception table (populated by `Registry::new`)
    /// is somehow missing the class, which never happens in practice.
    fn make_exception(&self, err: &RuntimeError) -> Value {
        match self.registry.lookup_class(err.exception_class_name()) {
            Some(class) => {
                let obj = Object::new(class);
                obj.set_field("message".to_string(), Value::Str(Arc::from(err.to_string())));
                let value = Value::Object(Arc::new(obj));
                self.gc.register(&value);
                value
            }
            None => Value::Str(Arc::from(err.to_string())),
        }
    }

    fn load_local(&self, task: &Task, base: usize, slot: usize) -> Value {
        let frame = task.frames.last().expect("load_local with no active frame");
        if slot < frame.function.local_slot_count {
            return task.operand_stack.get(base + slot).clone();
        }
        let idx = slot - frame.function.local_slot_count;
        match frame.closure.as_ref().and_then(|c| c.upvalues.get(idx)) {
            Some(uv) => match &*uv.read().unwrap() {
                Upvalue::Closed(v) => v.clone(),
                Upvalue::Open { slot, .. } => task.operand_stack.get(*slot).clone(),
            },
            None => Value::Null,
        }
    }

    fn store_local(&self, task: &mut Task, base: usize, slot: usize, value: Value) {
        let local_slot_count = task.frames.last().expect("store_local with no active frame").function.local_slot_count;
        if slot < local_slot_count {
            task.operand_stack.set(base + slot, value);
            return;
        }
        let idx = slot - local_slot_count;
        let uv = task
            .frames
            .last()
            .unwrap()
            .closure
            .as_ref()
            .and_then(|c| c.upvalues.get(idx))
            .cloned();
        let Some(uv) = uv else { return };
        let open_slot = match &*uv.read().unwrap() {
            Upvalue::Open { slot, .. } => Some(*slot),
            Upvalue::Closed(_) => None,
        };
        match open_slot {
            Some(s) => task.operand_stack.set(s, value),
            None => *uv.write().unwrap() = Upvalue::Closed(value),
        }
    }

    /// Roots for collection: the task's live operand stack plus every
    /// global binding, named or positional — a heap value reachable only
    /// from a global would otherwise be invisible to the collector.
    fn collection_roots(&self, task: &Task) -> Vec<Value> {
        let mut roots: Vec<Value> = task.operand_stack.as_slice().to_vec();
        roots.extend(self.globals.snapshot_named().into_iter().map(|(_, v)| v));
        roots.extend(self.globals.positional.lock().iter().cloned());
        roots
    }

    /// Translates the channel's wake-up report into scheduler state changes.
    /// The woken tasks are not the current one (it is mid-`step`, detached
    /// from the scheduler's task table by the caller of `run_slice`), so
    /// mutating the scheduler here never aliases the task being stepped.
    fn apply_wake_events(&self, scheduler: &mut CooperativeScheduler, events: Vec<WakeEvent>) {
        for event in events {
            match event {
                WakeEvent::Receiver { task_id, value, .. } => scheduler.unblock(task_id, Some(value)),
                WakeEvent::Sender { task_id } => scheduler.unblock(task_id, None),
            }
        }
    }

    fn maybe_collect(&self, task: &Task) {
        match self.gc.collection_needed() {
            crate::gc::CollectionKind::None => {}
            crate::gc::CollectionKind::Minor => self.gc.minor_gc(&self.collection_roots(task)),
            crate::gc::CollectionKind::Major => self.gc.major_gc(&self.collection_roots(task)),
        }
    }

    /// Executes exactly one instruction of the task's current top frame.
    fn step(&self, task: &mut Task, scheduler: &mut CooperativeScheduler) -> Result<(), RuntimeError> {
        if let Some(stw) = &self.stw {
            stw.poll_safepoint();
        }

        let (function, base, mut ip) = {
            let frame = task.frames.last().expect("step called with no active frame");
            (frame.function.clone(), frame.base, frame.ip)
        };
        let chunk = function.code.clone().ok_or_else(|| RuntimeError::CorruptBytecode {
            detail: format!("'{}' has no bytecode to interpret", function.name),
        })?;
        let instr_start = ip;
        if let Some(reason) = self.debugger.check_step_at(&function, &chunk, instr_start, task.frames.len(), task.id) {
            self.debugger.record_stop(task.id, reason);
        }
        let op = Op::from_byte(chunk.read_u8(ip))?;
        ip += 1;
        self.profiler.record_op(op);

        match op {
            Op::PushConst => {
                let idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let value = chunk.constants.get(idx).map(|c| resolve_const(c, &self.registry)).unwrap_or(Value::Null);
                task.operand_stack.push(value)?;
            }
            Op::Pop => {
                task.operand_stack.pop();
            }
            Op::Dup => task.operand_stack.dup()?,
            Op::PushNull => task.operand_stack.push(Value::Null)?,
            Op::PushTrue => task.operand_stack.push(Value::Bool(true))?,
            Op::PushFalse => task.operand_stack.push(Value::Bool(false))?,
            Op::PushZero => task.operand_stack.push(Value::Int(0))?,
            Op::PushOne => task.operand_stack.push(Value::Int(1))?,

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                let b = task.operand_stack.pop();
                let a = task.operand_stack.pop();
                task.operand_stack.push(arith(op, a, b)?)?;
            }
            Op::Neg => {
                let a = task.operand_stack.pop();
                let result = match a {
                    Value::Int(i) => Value::Int(-i),
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "numeric operand".into(),
                            found: other.tag().to_string(),
                        })
                    }
                };
                task.operand_stack.push(result)?;
            }

            Op::BitAnd | Op::BitOr | Op::BitXor | Op::Shl | Op::Shr => {
                let b = task.operand_stack.pop();
                let a = task.operand_stack.pop();
                task.operand_stack.push(bit_op(op, a, b)?)?;
            }
            Op::BitNot => {
                let a = task.operand_stack.pop();
                let Value::Int(i) = a else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "int operand".into(),
                        found: a.tag().to_string(),
                    });
                };
                task.operand_stack.push(Value::Int(!i))?;
            }

            Op::Eq => {
                let b = task.operand_stack.pop();
                let a = task.operand_stack.pop();
                task.operand_stack.push(Value::Bool(a.value_eq(&b)))?;
            }
            Op::Ne => {
                let b = task.operand_stack.pop();
                let a = task.operand_stack.pop();
                task.operand_stack.push(Value::Bool(!a.value_eq(&b)))?;
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let b = task.operand_stack.pop();
                let a = task.operand_stack.pop();
                let result = compare(op, &a, &b)?;
                task.operand_stack.push(Value::Bool(result))?;
            }

            Op::Not => {
                let a = task.operand_stack.pop();
                task.operand_stack.push(Value::Bool(!a.is_truthy()))?;
            }
            // Neither short-circuits: both operands are already evaluated and
            // on the stack. Each returns whichever operand decided the
            // result, not a coerced bool.
            Op::And => {
                let b = task.operand_stack.pop();
                let a = task.operand_stack.pop();
                task.operand_stack.push(if !a.is_truthy() { a } else { b })?;
            }
            Op::Or => {
                let b = task.operand_stack.pop();
                let a = task.operand_stack.pop();
                task.operand_stack.push(if a.is_truthy() { a } else { b })?;
            }

            Op::LoadLocal => {
                let slot = chunk.read_u16(ip) as usize;
                ip += 2;
                let value = self.load_local(task, base, slot);
                task.operand_stack.push(value)?;
            }
            Op::StoreLocal => {
                let slot = chunk.read_u16(ip) as usize;
                ip += 2;
                let value = task.operand_stack.pop();
                self.store_local(task, base, slot, value);
            }
            Op::LoadGlobal => {
                let idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let value = match chunk.constants.get(idx) {
                    Some(ConstValue::Str(name)) => self.globals.load_named(name, &self.registry),
                    _ => self.globals.load_positional(idx),
                };
                task.operand_stack.push(value)?;
            }
            Op::StoreGlobal => {
                let idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let value = task.operand_stack.pop();
                match chunk.constants.get(idx) {
                    Some(ConstValue::Str(name)) => self.globals.store_named(name, value),
                    _ => self.globals.store_positional(idx, value),
                }
            }

            Op::Jump => {
                let offset = chunk.read_i16(ip) as i64;
                ip += 2;
                ip = (ip as i64 + offset) as usize;
            }
            // Peeks rather than pops: if the branch is taken the condition
            // value itself is the short-circuit result and stays on the
            // stack; only the fallthrough path consumes it.
            Op::JumpIfTrue => {
                let offset = chunk.read_i16(ip) as i64;
                ip += 2;
                let truthy = task.operand_stack.peek().is_truthy();
                self.profiler.types.observe_branch(function.id, instr_start, truthy);
                if truthy {
                    ip = (ip as i64 + offset) as usize;
                } else {
                    task.operand_stack.pop();
                }
            }
            Op::JumpIfFalse => {
                let offset = chunk.read_i16(ip) as i64;
                ip += 2;
                let truthy = task.operand_stack.peek().is_truthy();
                self.profiler.types.observe_branch(function.id, instr_start, truthy);
                if !truthy {
                    ip = (ip as i64 + offset) as usize;
                } else {
                    task.operand_stack.pop();
                }
            }
            Op::LoopJump => {
                let offset = chunk.read_i16(ip) as i64;
                ip += 2;
                let target = (ip as i64 + offset) as usize;
                if self.profiler.loop_tick(function.id, target) {
                    self.jit.try_compile(&function);
                }
                ip = target;
            }

            Op::Call => {
                let argc = chunk.read_u8(ip) as usize;
                ip += 1;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(task.operand_stack.pop());
                }
                args.reverse();
                let callee = task.operand_stack.pop();
                task.frames.last_mut().unwrap().ip = ip;
                match callee {
                    Value::Function(f) => self.invoke(task, f, None, None, args, false)?,
                    Value::Closure(c) => {
                        let f = c.function.clone();
                        self.invoke(task, f, Some(c), None, args, false)?;
                    }
                    other => {
                        return Err(RuntimeError::NotCallable {
                            name: other.tag().to_string(),
                        })
                    }
                }
                return Ok(());
            }
            Op::CallMethod => {
                let name_idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let argc = chunk.read_u8(ip) as usize;
                ip += 1;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(task.operand_stack.pop());
                }
                args.reverse();
                let receiver = task.operand_stack.pop();
                let Value::Object(obj) = receiver.clone() else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "object receiver".into(),
                        found: receiver.tag().to_string(),
                    });
                };
                let name = match chunk.constants.get(name_idx) {
                    Some(ConstValue::Str(s)) => s.clone(),
                    _ => {
                        return Err(RuntimeError::CorruptBytecode {
                            detail: "CallMethod operand is not a method name".into(),
                        })
                    }
                };
                let class_id = Arc::as_ptr(&obj.class) as u64;
                let site = (function.id, instr_start);
                let cached = self.inline_caches.lock().lookup_method(site, class_id);
                let method = match cached {
                    Some(m) => m,
                    None => {
                        let m = obj
                            .class
                            .resolve_method(&name, argc)
                            .ok_or_else(|| RuntimeError::UndefinedMethod {
                                class: obj.class.name.clone(),
                                name: name.clone(),
                                argc,
                            })?;
                        if !obj.class.check_visibility(&m, function.owning_class.as_deref(), &self.registry) {
                            return Err(RuntimeError::AccessViolation {
                                class: obj.class.name.clone(),
                                member: name.clone(),
                                visibility: visibility_label(m.visibility),
                            });
                        }
                        self.inline_caches.lock().update_method(site, class_id, m.clone());
                        m
                    }
                };
                let target_fn = method.as_function();
                task.frames.last_mut().unwrap().ip = ip;
                self.invoke(task, target_fn, None, Some(receiver), args, false)?;
                return Ok(());
            }
            Op::CallStatic => {
                let class_idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let method_idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let argc = chunk.read_u8(ip) as usize;
                ip += 1;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(task.operand_stack.pop());
                }
                args.reverse();
                let class_name = match chunk.constants.get(class_idx) {
                    Some(ConstValue::Str(s)) => s.clone(),
                    _ => {
                        return Err(RuntimeError::CorruptBytecode {
                            detail: "CallStatic class operand is not a name".into(),
                        })
                    }
                };
                let method_name = match chunk.constants.get(method_idx) {
                    Some(ConstValue::Str(s)) => s.clone(),
                    _ => {
                        return Err(RuntimeError::CorruptBytecode {
                            detail: "CallStatic method operand is not a name".into(),
                        })
                    }
                };
                let class = self
                    .registry
                    .lookup_class(&class_name)
                    .ok_or_else(|| RuntimeError::UndefinedClass { name: class_name.clone() })?;
                let method = class.resolve_method(&method_name, argc).ok_or_else(|| RuntimeError::UndefinedMethod {
                    class: class_name.clone(),
                    name: method_name.clone(),
                    argc,
                })?;
                let target_fn = method.as_function();
                task.frames.last_mut().unwrap().ip = ip;
                self.invoke(task, target_fn, None, None, args, true)?;
                return Ok(());
            }
            Op::Return => {
                let ret = task.operand_stack.pop();
                let mut popped = task.frames.pop().expect("Return with no active frame");
                popped.close_upvalues(&task.operand_stack);
                task.operand_stack.truncate(popped.base);
                self.profiler.exit_function();
                task.operand_stack.push(ret)?;
                return Ok(());
            }

            Op::NewObject => {
                let const_idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let class_name = match chunk.constants.get(const_idx) {
                    Some(ConstValue::Str(s)) => s.clone(),
                    _ => {
                        return Err(RuntimeError::CorruptBytecode {
                            detail: "NewObject operand is not a class name".into(),
                        })
                    }
                };
                let class = self
                    .registry
                    .lookup_class(&class_name)
                    .ok_or_else(|| RuntimeError::UndefinedClass { name: class_name.clone() })?;
                if class.is_abstract || class.is_interface {
                    return Err(RuntimeError::AbstractInstantiation { name: class_name });
                }
                let value = Value::Object(Arc::new(Object::new(class)));
                self.gc.register(&value);
                task.operand_stack.push(value)?;
                self.maybe_collect(task);
            }
            Op::GetField => {
                let const_idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let field_name: Arc<str> = match chunk.constants.get(const_idx) {
                    Some(ConstValue::Str(s)) => Arc::from(s.as_str()),
                    _ => {
                        return Err(RuntimeError::CorruptBytecode {
                            detail: "GetField operand is not a field name".into(),
                        })
                    }
                };
                let receiver = task.operand_stack.pop();
                let Value::Object(obj) = &receiver else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "object".into(),
                        found: receiver.tag().to_string(),
                    });
                };
                let class_id = Arc::as_ptr(&obj.class) as u64;
                let site = (function.id, instr_start);
                {
                    let mut ic = self.inline_caches.lock();
                    ic.check_property(site, class_id, &field_name);
                    ic.update_property(site, class_id, field_name.clone());
                }
                match obj.get_field(&field_name) {
                    Some(v) => task.operand_stack.push(v)?,
                    None => {
                        return Err(RuntimeError::UndefinedField {
                            class: obj.class.name.clone(),
                            name: field_name.to_string(),
                        })
                    }
                }
            }
            Op::SetField => {
                let const_idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let field_name: Arc<str> = match chunk.constants.get(const_idx) {
                    Some(ConstValue::Str(s)) => Arc::from(s.as_str()),
                    _ => {
                        return Err(RuntimeError::CorruptBytecode {
                            detail: "SetField operand is not a field name".into(),
                        })
                    }
                };
                let value = task.operand_stack.pop();
                let receiver = task.operand_stack.pop();
                let Value::Object(obj) = &receiver else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "object".into(),
                        found: receiver.tag().to_string(),
                    });
                };
                let class_id = Arc::as_ptr(&obj.class) as u64;
                let site = (function.id, instr_start);
                self.inline_caches.lock().update_property(site, class_id, field_name.clone());
                self.gc.write_barrier(&receiver, &value);
                obj.set_field(field_name.to_string(), value);
            }

            Op::MakeArray => {
                let n = chunk.read_u8(ip) as usize;
                ip += 1;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(task.operand_stack.pop());
                }
                items.reverse();
                let value = Value::Array(Arc::new(RwLock::new(items)));
                self.gc.register(&value);
                task.operand_stack.push(value)?;
                self.maybe_collect(task);
            }
            Op::ArrayGet => {
                let key = task.operand_stack.pop();
                let receiver = task.operand_stack.pop();
                let value = match &receiver {
                    Value::Array(a) => {
                        let Value::Int(i) = key else {
                            return Err(RuntimeError::TypeMismatch {
                                expected: "int index".into(),
                                found: key.tag().to_string(),
                            });
                        };
                        let guard = a.read();
                        if i < 0 || i as usize >= guard.len() {
                            Value::Null
                        } else {
                            guard[i as usize].clone()
                        }
                    }
                    Value::SuperArray(s) => {
                        let guard = s.read();
                        match super_key_from(&key)? {
                            SuperKey::Index(i) => guard.get_index(i).cloned().unwrap_or(Value::Null),
                            SuperKey::Name(n) => guard.get_name(&n).cloned().unwrap_or(Value::Null),
                        }
                    }
                    _ => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "array or superarray".into(),
                            found: receiver.tag().to_string(),
                        })
                    }
                };
                task.operand_stack.push(value)?;
            }
            Op::ArraySet => {
                let value = task.operand_stack.pop();
                let key = task.operand_stack.pop();
                let receiver = task.operand_stack.pop();
                match &receiver {
                    Value::Array(a) => {
                        let Value::Int(i) = key else {
                            return Err(RuntimeError::TypeMismatch {
                                expected: "int index".into(),
                                found: key.tag().to_string(),
                            });
                        };
                        if i < 0 {
                            return Err(RuntimeError::TypeMismatch {
                                expected: "non-negative index".into(),
                                found: i.to_string(),
                            });
                        }
                        let mut guard = a.write();
                        let idx = i as usize;
                        if idx >= guard.len() {
                            guard.resize(idx + 1, Value::Null);
                        }
                        guard[idx] = value.clone();
                    }
                    Value::SuperArray(s) => {
                        let mut guard = s.write();
                        match super_key_from(&key)? {
                            SuperKey::Index(i) => guard.set_index(i, value.clone()),
                            SuperKey::Name(n) => guard.set_name(n, value.clone()),
                        }
                    }
                    _ => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "array or superarray".into(),
                            found: receiver.tag().to_string(),
                        })
                    }
                }
                self.gc.write_barrier(&receiver, &value);
            }
            Op::ArrayLen => {
                let receiver = task.operand_stack.pop();
                let len = match &receiver {
                    Value::Array(a) => a.read().len(),
                    Value::SuperArray(s) => s.read().len(),
                    Value::NativeArray(a) => a.read().len(),
                    Value::FixedArray(a) => a.len(),
                    Value::Map(m) => m.read().len(),
                    _ => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "container".into(),
                            found: receiver.tag().to_string(),
                        })
                    }
                };
                task.operand_stack.push(Value::Int(len as i64))?;
            }

            Op::MakeMap => {
                let n = chunk.read_u8(ip) as usize;
                ip += 1;
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    let v = task.operand_stack.pop();
                    let k = task.operand_stack.pop();
                    pairs.push((k, v));
                }
                pairs.reverse();
                let mut map = indexmap::IndexMap::new();
                for (k, v) in pairs {
                    map.insert(MapKey(k), v);
                }
                let value = Value::Map(Arc::new(RwLock::new(map)));
                self.gc.register(&value);
                task.operand_stack.push(value)?;
                self.maybe_collect(task);
            }
            Op::MapGet => {
                let key = task.operand_stack.pop();
                let receiver = task.operand_stack.pop();
                let Value::Map(m) = &receiver else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "map".into(),
                        found: receiver.tag().to_string(),
                    });
                };
                let result = m.read().get(&MapKey(key)).cloned().unwrap_or(Value::Null);
                task.operand_stack.push(result)?;
            }
            Op::MapSet => {
                let value = task.operand_stack.pop();
                let key = task.operand_stack.pop();
                let receiver = task.operand_stack.pop();
                let Value::Map(m) = &receiver else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "map".into(),
                        found: receiver.tag().to_string(),
                    });
                };
                self.gc.write_barrier(&receiver, &value);
                m.write().insert(MapKey(key), value);
            }

            Op::MakeSuperArray => {
                let n = chunk.read_u8(ip) as usize;
                ip += 1;
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    let v = task.operand_stack.pop();
                    let k = task.operand_stack.pop();
                    pairs.push((k, v));
                }
                pairs.reverse();
                let mut sa = SuperArray::new();
                for (k, v) in pairs {
                    match super_key_from(&k)? {
                        SuperKey::Index(i) => sa.set_index(i, v),
                        SuperKey::Name(n) => sa.set_name(n, v),
                    }
                }
                let value = Value::SuperArray(Arc::new(RwLock::new(sa)));
                self.gc.register(&value);
                task.operand_stack.push(value)?;
                self.maybe_collect(task);
            }

            Op::IterInit => {
                let receiver = task.operand_stack.pop();
                let source = match &receiver {
                    Value::Array(a) => IterSource::Array(a.clone()),
                    Value::Map(m) => IterSource::Map(m.clone()),
                    Value::SuperArray(s) => IterSource::SuperArray(s.clone()),
                    _ => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "iterable container".into(),
                            found: receiver.tag().to_string(),
                        })
                    }
                };
                let value = Value::Iterator(Arc::new(Mutex::new(Iterator_ { source, position: 0 })));
                self.gc.register(&value);
                task.operand_stack.push(value)?;
            }
            // Peeks, not pops: the iterator stays on the stack so a
            // subsequent `IterKey`/`IterValue` can read from the element
            // this call just advanced past.
            Op::IterNext => {
                let iter_value = task.operand_stack.peek().clone();
                let Value::Iterator(it) = &iter_value else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "iterator".into(),
                        found: iter_value.tag().to_string(),
                    });
                };
                let mut guard = it.lock();
                let len = match &guard.source {
                    IterSource::Array(a) => a.read().len(),
                    IterSource::Map(m) => m.read().len(),
                    IterSource::SuperArray(s) => s.read().len(),
                };
                let has_more = guard.position < len;
                if has_more {
                    guard.position += 1;
                }
                drop(guard);
                task.operand_stack.push(Value::Bool(has_more))?;
            }
            Op::IterKey => {
                let iter_value = task.operand_stack.peek().clone();
                let Value::Iterator(it) = &iter_value else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "iterator".into(),
                        found: iter_value.tag().to_string(),
                    });
                };
                let guard = it.lock();
                let idx = guard.position.saturating_sub(1);
                let key = match &guard.source {
                    IterSource::Array(_) => Value::Int(idx as i64),
                    IterSource::Map(m) => m.read().get_index(idx).map(|(k, _)| k.0.clone()).unwrap_or(Value::Null),
                    IterSource::SuperArray(s) => match s.read().key_at(idx) {
                        Some(SuperKey::Index(i)) => Value::Int(i),
                        Some(SuperKey::Name(n)) => Value::Str(n),
                        None => Value::Null,
                    },
                };
                drop(guard);
                task.operand_stack.push(key)?;
            }
            Op::IterValue => {
                let iter_value = task.operand_stack.peek().clone();
                let Value::Iterator(it) = &iter_value else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "iterator".into(),
                        found: iter_value.tag().to_string(),
                    });
                };
                let guard = it.lock();
                let idx = guard.position.saturating_sub(1);
                let value = match &guard.source {
                    IterSource::Array(a) => a.read().get(idx).cloned().unwrap_or(Value::Null),
                    IterSource::Map(m) => m.read().get_index(idx).map(|(_, v)| v.clone()).unwrap_or(Value::Null),
                    IterSource::SuperArray(s) => s.read().value_at(idx).cloned().unwrap_or(Value::Null),
                };
                drop(guard);
                task.operand_stack.push(value)?;
            }

            Op::Cast | Op::CastSafe => {
                let const_idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let target = match chunk.constants.get(const_idx) {
                    Some(ConstValue::Str(s)) => s.clone(),
                    _ => {
                        return Err(RuntimeError::CorruptBytecode {
                            detail: "Cast operand is not a type name".into(),
                        })
                    }
                };
                let value = task.operand_stack.pop();
                match cast_value(&value, &target) {
                    Some(result) => task.operand_stack.push(result)?,
                    None if op == Op::CastSafe => task.operand_stack.push(Value::Null)?,
                    None => {
                        return Err(RuntimeError::BadCast {
                            from: value.tag().to_string(),
                            to: target,
                        })
                    }
                }
            }

            Op::Closure => {
                let const_idx = chunk.read_u16(ip) as usize;
                ip += 2;
                let target_id = match chunk.constants.get(const_idx) {
                    Some(ConstValue::FunctionRef(id)) => *id as u64,
                    _ => {
                        return Err(RuntimeError::CorruptBytecode {
                            detail: "Closure operand does not reference a function".into(),
                        })
                    }
                };
                let target_fn = self.registry.lookup_function_by_id(target_id).ok_or_else(|| RuntimeError::CorruptBytecode {
                    detail: format!("unknown function id {target_id}"),
                })?;
                let target_chunk = target_fn.code.clone().ok_or_else(|| RuntimeError::CorruptBytecode {
                    detail: "closed-over function has no bytecode".into(),
                })?;

                let frame_depth = task.frames.len();
                let frame = task.frames.last_mut().expect("Closure with no active frame");
                let mut upvalues = Vec::with_capacity(target_chunk.upvalues.len());
                for desc in &target_chunk.upvalues {
                    let uv = if desc.is_local {
                        let slot = frame.base + desc.index as usize;
                        frame.find_open_upvalue(slot).unwrap_or_else(|| {
                            let uv = Arc::new(std::sync::RwLock::new(Upvalue::Open { frame_depth, slot }));
                            frame.open_upvalues.push((slot, uv.clone()));
                            uv
                        })
                    } else {
                        frame
                            .closure
                            .as_ref()
                            .and_then(|c| c.upvalues.get(desc.index as usize).cloned())
                            .unwrap_or_else(|| Arc::new(std::sync::RwLock::new(Upvalue::Closed(Value::Null))))
                    };
                    upvalues.push(uv);
                }

                let value = Value::Closure(Arc::new(Closure { function: target_fn, upvalues }));
                self.gc.register(&value);
                task.operand_stack.push(value)?;
            }

            Op::Spawn => {
                let argc = chunk.read_u8(ip) as usize;
                ip += 1;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(task.operand_stack.pop());
                }
                args.reverse();
                let callee = task.operand_stack.pop();
                let new_id = match callee {
                    Value::Function(f) => scheduler.spawn(f, None, args, Some(task.id)),
                    Value::Closure(c) => {
                        let f = c.function.clone();
                        scheduler.spawn(f, Some(c), args, Some(task.id))
                    }
                    other => {
                        return Err(RuntimeError::NotCallable {
                            name: other.tag().to_string(),
                        })
                    }
                };
                task.operand_stack.push(Value::Int(new_id as i64))?;
            }
            Op::ChannelNew => {
                let capacity = chunk.read_u8(ip) as usize;
                ip += 1;
                let value = Value::Channel(Arc::new(Channel::new(capacity, None)));
                self.gc.register(&value);
                task.operand_stack.push(value)?;
            }
            Op::Send => {
                let value = task.operand_stack.pop();
                let receiver = task.operand_stack.pop();
                let Value::Channel(ch) = receiver else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "channel".into(),
                        found: receiver.tag().to_string(),
                    });
                };
                match ch.send(task.id, value.clone())? {
                    SendOutcome::Sent(events) => {
                        self.apply_wake_events(scheduler, events);
                        task.operand_stack.push(Value::Null)?;
                    }
                    SendOutcome::Blocked => {
                        task.status = TaskStatus::Blocked;
                        task.block_reason = Some(BlockReason::Send { channel: ch, value });
                        task.operand_stack.push(Value::Null)?;
                    }
                    SendOutcome::ChannelClosed => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "open channel".into(),
                            found: "closed channel".into(),
                        })
                    }
                }
            }
            Op::Receive => {
                let receiver = task.operand_stack.pop();
                let Value::Channel(ch) = receiver else {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "channel".into(),
                        found: receiver.tag().to_string(),
                    });
                };
                match ch.receive(task.id) {
                    ReceiveOutcome::Value(v, events) => {
                        self.apply_wake_events(scheduler, events);
                        task.operand_stack.push(v)?;
                    }
                    ReceiveOutcome::Closed => task.operand_stack.push(Value::Null)?,
                    ReceiveOutcome::Blocked => {
                        task.status = TaskStatus::Blocked;
                        task.block_reason = Some(BlockReason::Receive { channel: ch });
                    }
                }
            }
        }

        task.frames.last_mut().unwrap().ip = ip;
        Ok(())
    }
}

fn args_as_ints(args: &[Value]) -> Option<Vec<i64>> {
    args.iter()
        .map(|v| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        })
        .collect()
}

fn visibility_label(v: Visibility) -> &'static str {
    match v {
        Visibility::Public => "public",
        Visibility::Protected => "protected",
        Visibility::Private => "private",
    }
}

fn resolve_const(c: &ConstValue, registry: &Registry) -> Value {
    match c {
        ConstValue::Null => Value::Null,
        ConstValue::Bool(b) => Value::Bool(*b),
        ConstValue::Int(i) => Value::Int(*i),
        ConstValue::Float(f) => Value::Float(*f),
        ConstValue::Str(s) => Value::Str(Arc::from(s.as_str())),
        ConstValue::FunctionRef(id) => registry.lookup_function_by_id(*id as u64).map(Value::Function).unwrap_or(Value::Null),
    }
}

fn super_key_from(v: &Value) -> Result<SuperKey, RuntimeError> {
    match v {
        Value::Int(i) => Ok(SuperKey::Index(*i)),
        Value::Str(s) => Ok(SuperKey::Name(s.clone())),
        other => Err(RuntimeError::TypeMismatch {
            expected: "int or string key".into(),
            found: other.tag().to_string(),
        }),
    }
}

fn cast_value(value: &Value, target: &str) -> Option<Value> {
    match target {
        "string" => Some(Value::Str(Arc::from(value.display()))),
        "bool" => Some(Value::Bool(value.is_truthy())),
        "int" => match value {
            Value::Int(i) => Some(Value::Int(*i)),
            Value::Float(f) => Some(Value::Int(*f as i64)),
            Value::Bool(b) => Some(Value::Int(if *b { 1 } else { 0 })),
            Value::Str(s) => s.trim().parse::<i64>().ok().map(Value::Int),
            _ => None,
        },
        "float" => match value {
            Value::Int(i) => Some(Value::Float(*i as f64)),
            Value::Float(f) => Some(Value::Float(*f)),
            Value::Bool(b) => Some(Value::Float(if *b { 1.0 } else { 0.0 })),
            Value::Str(s) => s.trim().parse::<f64>().ok().map(Value::Float),
            _ => None,
        },
        _ => None,
    }
}

fn arith(op: Op, a: Value, b: Value) -> Result<Value, RuntimeError> {
    use Value::*;
    match (op, a, b) {
        (Op::Add, Str(x), Str(y)) => Ok(Str(Arc::from(format!("{x}{y}")))),
        (Op::Add, Int(x), Int(y)) => Ok(Int(x.wrapping_add(y))),
        (Op::Sub, Int(x), Int(y)) => Ok(Int(x.wrapping_sub(y))),
        (Op::Mul, Int(x), Int(y)) => Ok(Int(x.wrapping_mul(y))),
        (Op::Div, Int(x), Int(y)) => {
            if y == 0 {
                Err(RuntimeError::DivisionByZero)
            } else {
                Ok(Int(x.wrapping_div(y)))
            }
        }
        (Op::Mod, Int(x), Int(y)) => {
            if y == 0 {
                Err(RuntimeError::ModuloByZero)
            } else {
                Ok(Int(x.wrapping_rem(y)))
            }
        }
        (op, Int(x), Float(y)) => float_arith(op, x as f64, y),
        (op, Float(x), Int(y)) => float_arith(op, x, y as f64),
        (op, Float(x), Float(y)) => float_arith(op, x, y),
        (_, a, b) => Err(RuntimeError::TypeMismatch {
            expected: "numeric operands".into(),
            found: format!("{}/{}", a.tag(), b.tag()),
        }),
    }
}

fn float_arith(op: Op, x: f64, y: f64) -> Result<Value, RuntimeError> {
    match op {
        Op::Add => Ok(Value::Float(x + y)),
        Op::Sub => Ok(Value::Float(x - y)),
        Op::Mul => Ok(Value::Float(x * y)),
        Op::Div => {
            if y == 0.0 {
                Err(RuntimeError::DivisionByZero)
            } else {
                Ok(Value::Float(x / y))
            }
        }
        Op::Mod => {
            if y == 0.0 {
                Err(RuntimeError::ModuloByZero)
            } else {
                Ok(Value::Float(x % y))
            }
        }
        _ => unreachable!("float_arith called with a non-arithmetic op"),
    }
}

fn bit_op(op: Op, a: Value, b: Value) -> Result<Value, RuntimeError> {
    let (Value::Int(x), Value::Int(y)) = (&a, &b) else {
        return Err(RuntimeError::TypeMismatch {
            expected: "int operands".into(),
            found: format!("{}/{}", a.tag(), b.tag()),
        });
    };
    let (x, y) = (*x, *y);
    Ok(Value::Int(match op {
        Op::BitAnd => x & y,
        Op::BitOr => x | y,
        Op::BitXor => x ^ y,
        Op::Shl => x.wrapping_shl(y as u32),
        Op::Shr => x.wrapping_shr(y as u32),
        _ => unreachable!("bit_op called with a non-bitwise op"),
    }))
}

fn compare(op: Op, a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    use Value::*;
    let ord = match (a, b) {
        (Int(x), Int(y)) => x.partial_cmp(y),
        (Float(x), Float(y)) => x.partial_cmp(y),
        (Int(x), Float(y)) => (*x as f64).partial_cmp(y),
        (Float(x), Int(y)) => x.partial_cmp(&(*y as f64)),
        (Str(x), Str(y)) => x.partial_cmp(y),
        _ => {
            return Err(RuntimeError::TypeMismatch {
                expected: "comparable operands".into(),
                found: format!("{}/{}", a.tag(), b.tag()),
            })
        }
    };
    let Some(ord) = ord else { return Ok(false) };
    Ok(match op {
        Op::Lt => ord.is_lt(),
        Op::Le => ord.is_le(),
        Op::Gt => ord.is_gt(),
        Op::Ge => ord.is_ge(),
        _ => unreachable!("compare called with a non-comparison op"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, UpvalDesc};
    use crate::class::next_function_id;
    use crate::frame::TryContext;
    use crate::profile::ProfilerConfig;

    fn make_vm() -> Vm {
        let config = Config::default();
        Vm::new(
            Arc::new(Registry::new()),
            Arc::new(Gc::new(1024, 4096, 3, 512)),
            Arc::new(Profiler::new(ProfilerConfig::default())),
            Arc::new(JitCompiler::new()),
            &config,
        )
    }

    fn plain_function(name: &str, chunk: Chunk, local_slot_count: usize) -> Arc<Function> {
        Arc::new(Function {
            id: next_function_id(),
            name: name.to_string(),
            param_count: 0,
            min_arity: 0,
            defaults: vec![],
            variadic: false,
            code: Some(Arc::new(chunk)),
            local_slot_count,
            upvalue_count: 0,
            native: None,
            owning_class: None,
        })
    }

    #[test]
    fn runs_simple_arithmetic_function_and_returns() {
        let vm = make_vm();
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::PushConst);
        let c1 = chunk.add_constant(ConstValue::Int(3));
        chunk.emit_u16(c1);
        chunk.emit_op(Op::PushConst);
        let c2 = chunk.add_constant(ConstValue::Int(4));
        chunk.emit_u16(c2);
        chunk.emit_op(Op::Add);
        chunk.emit_op(Op::Return);

        let function = plain_function("sum", chunk, 0);
        let mut task = Task::new(1, None, 256, 64);
        vm.invoke(&mut task, function, None, None, vec![], false).unwrap();
        let mut scheduler = CooperativeScheduler::new(1000, 256, 64);
        match vm.run_slice(&mut task, 1000, &mut scheduler) {
            StepOutcome::Finished(Value::Int(7)) => {}
            _ => panic!("expected Finished(Int(7))"),
        }
    }

    #[test]
    fn store_global_then_load_global_round_trips() {
        let vm = make_vm();
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::PushConst);
        let c7 = chunk.add_constant(ConstValue::Int(7));
        chunk.emit_u16(c7);
        chunk.emit_op(Op::StoreGlobal);
        let name_const = chunk.add_constant(ConstValue::Str("counter".to_string()));
        chunk.emit_u16(name_const);
        chunk.emit_op(Op::LoadGlobal);
        chunk.emit_u16(name_const);
        chunk.emit_op(Op::Return);

        let function = plain_function("g", chunk, 0);
        let mut task = Task::new(1, None, 256, 64);
        vm.invoke(&mut task, function, None, None, vec![], false).unwrap();
        let mut scheduler = CooperativeScheduler::new(1000, 256, 64);
        match vm.run_slice(&mut task, 1000, &mut scheduler) {
            StepOutcome::Finished(Value::Int(7)) => {}
            _ => panic!("expected Finished(Int(7))"),
        }
    }

    #[test]
    fn try_context_catches_division_by_zero() {
        let vm = make_vm();
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::PushConst);
        let one = chunk.add_constant(ConstValue::Int(1));
        chunk.emit_u16(one);
        chunk.emit_op(Op::PushConst);
        let zero = chunk.add_constant(ConstValue::Int(0));
        chunk.emit_u16(zero);
        let div_at = chunk.emit_op(Op::Div);
        chunk.emit_op(Op::Return);
        let handler_ip = chunk.code.len();
        chunk.emit_op(Op::LoadLocal);
        chunk.emit_u16(0);
        chunk.emit_op(Op::Return);

        let function = plain_function("divider", chunk, 1);
        let mut task = Task::new(1, None, 256, 64);
        vm.invoke(&mut task, function, None, None, vec![], false).unwrap();
        task.frames.last_mut().unwrap().try_contexts.push(TryContext {
            start: 0,
            end: div_at + 1,
            handler_ip,
            catch_slot: 0,
        });
        let mut scheduler = CooperativeScheduler::new(1000, 256, 64);
        match vm.run_slice(&mut task, 1000, &mut scheduler) {
            StepOutcome::Finished(Value::Object(obj)) => {
                assert_eq!(obj.class.name, "DivisionByZero");
                assert!(obj.class.is_exception);
                match obj.get_field("message") {
                    Some(Value::Str(s)) => assert!(s.contains("division by zero")),
                    _ => panic!("expected a message field"),
                }
            }
            _ => panic!("expected the division fault to be caught as an exception object"),
        }
    }

    #[test]
    fn closure_closes_captured_local_on_return() {
        let vm = make_vm();

        let mut inner_chunk = Chunk::new();
        inner_chunk.emit_op(Op::LoadLocal);
        inner_chunk.emit_u16(0);
        inner_chunk.emit_op(Op::Return);
        inner_chunk.upvalues.push(UpvalDesc { is_local: true, index: 0 });
        let inner = plain_function("inner", inner_chunk, 0);
        vm.registry.register_function("inner".to_string(), inner.clone());

        let mut outer_chunk = Chunk::new();
        outer_chunk.emit_op(Op::PushConst);
        let c42 = outer_chunk.add_constant(ConstValue::Int(42));
        outer_chunk.emit_u16(c42);
        outer_chunk.emit_op(Op::StoreLocal);
        outer_chunk.emit_u16(0);
        outer_chunk.emit_op(Op::Closure);
        let fn_ref = outer_chunk.add_constant(ConstValue::FunctionRef(inner.id as u32));
        outer_chunk.emit_u16(fn_ref);
        outer_chunk.emit_op(Op::Return);
        let outer = plain_function("outer", outer_chunk, 1);

        let mut task = Task::new(1, None, 256, 64);
        vm.invoke(&mut task, outer, None, None, vec![], false).unwrap();
        let mut scheduler = CooperativeScheduler::new(1000, 256, 64);
        let closure = match vm.run_slice(&mut task, 1000, &mut scheduler) {
            StepOutcome::Finished(Value::Closure(c)) => c,
            _ => panic!("expected a closure value"),
        };

        let mut task2 = Task::new(2, None, 256, 64);
        vm.invoke(&mut task2, closure.function.clone(), Some(closure), None, vec![], false).unwrap();
        match vm.run_slice(&mut task2, 1000, &mut scheduler) {
            StepOutcome::Finished(Value::Int(42)) => {}
            _ => panic!("expected the closed-over value"),
        }
    }

    #[test]
    fn array_make_get_set_and_len() {
        let vm = make_vm();
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::PushConst);
        let a = chunk.add_constant(ConstValue::Int(10));
        chunk.emit_u16(a);
        chunk.emit_op(Op::PushConst);
        let b = chunk.add_constant(ConstValue::Int(20));
        chunk.emit_u16(b);
        chunk.emit_op(Op::MakeArray);
        chunk.emit_u8(2);
        chunk.emit_op(Op::Dup);
        chunk.emit_op(Op::ArrayLen);
        chunk.emit_op(Op::Pop);
        chunk.emit_op(Op::PushZero);
        chunk.emit_op(Op::ArrayGet);
        chunk.emit_op(Op::Return);

        let function = plain_function("arr", chunk, 0);
        let mut task = Task::new(1, None, 256, 64);
        vm.invoke(&mut task, function, None, None, vec![], false).unwrap();
        let mut scheduler = CooperativeScheduler::new(1000, 256, 64);
        match vm.run_slice(&mut task, 1000, &mut scheduler) {
            StepOutcome::Finished(Value::Int(10)) => {}
            _ => panic!("expected Finished(Int(10))"),
        }
    }
}
