//! Method-level JIT: hotspot-triggered compilation of a function's
//! bytecode to native code, installed into executable pages and invoked
//! ahead of interpretation once present.
//!
//! Pipeline: `Chunk` --(`ir::lower_chunk`)--> `IrFunction`
//!   --(`regalloc::allocate`)--> `RegAlloc`
//!   --(backend `compile`)--> `CompiledCode`
//!   --(`exec_memory::install`)--> `ExecutableMemory`, cached by function id.
//!
//! Any failure along this path (an ineligible opcode, a relocation with
//! no matching block, a failed page mapping) is swallowed into a `None`
//! result by `JitCompiler::try_compile` — the caller always has
//! interpretation as a fallback, so JIT failure is never fatal.

pub mod backend;
pub mod exec_memory;
pub mod helpers;
pub mod ir;
pub mod regalloc;

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::class::Function;
use crate::error::JitError;

use backend::x86_64::X86_64Backend;
#[cfg(target_arch = "aarch64")]
use backend::arm64::Arm64Backend;
use backend::{CodegenBackend, TargetArch};
use exec_memory::ExecutableMemory;
use helpers::HelperRegistry;

/// A function's installed native entry point, callable via the
/// platform's C calling convention: `extern "C" fn(args: *const i64, argc: u32) -> i64`.
/// Argument and return marshalling is restricted to integers for this
/// tier, matching the IR's integer-only instruction set.
pub struct InstalledFunction {
    memory: ExecutableMemory,
    entry_offset: usize,
}

pub type NativeEntry = unsafe extern "C" fn(*const i64, u32) -> i64;

impl InstalledFunction {
    /// # Safety
    /// The caller must supply exactly as many `args` as the source
    /// function's arity and must not call this after the owning
    /// `JitCompiler` (and thus this mapping) has been dropped.
    pub unsafe fn invoke(&self, args: &[i64]) -> i64 {
        let entry: NativeEntry = std::mem::transmute(self.memory.entry_ptr(self.entry_offset));
        entry(args.as_ptr(), args.len() as u32)
    }
}

fn native_backend() -> Box<dyn CodegenBackend> {
    #[cfg(target_arch = "aarch64")]
    {
        Box::new(Arm64Backend)
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        Box::new(X86_64Backend)
    }
}

fn available_registers(arch: TargetArch) -> &'static [u8] {
    match arch {
        TargetArch::X86_64 => &backend::x86_64::AVAILABLE_REGISTERS,
        TargetArch::Arm64 => &backend::arm64::AVAILABLE_REGISTERS,
    }
}

/// Owns the installed-code cache (keyed by `Function` identity) and the
/// helper registry; one instance per VM, mirroring the registry's own
/// process-but-not-cross-VM scoping.
pub struct JitCompiler {
    backend: Box<dyn CodegenBackend>,
    cache: DashMap<u64, Arc<InstalledFunction>>,
    pub helpers: HelperRegistry,
}

impl JitCompiler {
    pub fn new() -> Self {
        JitCompiler { backend: native_backend(), cache: DashMap::new(), helpers: HelperRegistry::new() }
    }

    pub fn lookup(&self, function_id: u64) -> Option<Arc<InstalledFunction>> {
        self.cache.get(&function_id).map(|e| e.clone())
    }

    pub fn is_compiled(&self, function_id: u64) -> bool {
        self.cache.contains_key(&function_id)
    }

    /// Attempts to compile and install `function`. Returns `false` (and
    /// logs at debug level) on any ineligibility or backend failure,
    /// leaving the function to keep interpreting.
    pub fn try_compile(&self, function: &Arc<Function>) -> bool {
        if self.cache.contains_key(&function.id) {
            return true;
        }
        match self.compile_inner(function) {
            Ok(installed) => {
                debug!(function_id = function.id, name = %function.name, "jit: installed native code");
                self.cache.insert(function.id, Arc::new(installed));
                true
            }
            Err(e) => {
                debug!(function_id = function.id, name = %function.name, error = %e, "jit: compilation declined, falling back to interpretation");
                false
            }
        }
    }

    fn compile_inner(&self, function: &Arc<Function>) -> Result<InstalledFunction, JitError> {
        let chunk = function.code.as_ref().ok_or(JitError::UnsupportedInstruction {
            detail: "native function has no bytecode to compile".into(),
        })?;
        let ir = ir::lower_chunk(chunk, function.param_count as u16, function.local_slot_count as u16)?;
        let info = self.backend.target_info();
        let regs = regalloc::allocate(&ir, available_registers(info.arch));
        let compiled = self.backend.compile(&ir, &regs)?;
        let memory = ExecutableMemory::install(&compiled.code)?;
        Ok(InstalledFunction { memory, entry_offset: compiled.entry_offset })
    }

    /// Drops a function's installed code, forcing the next hot-threshold
    /// crossing to recompile it. Used when a function is redefined —
    /// which, per the registry's one-way freeze, can only happen before
    /// the program image is frozen.
    pub fn invalidate(&self, function_id: u64) {
        if self.cache.remove(&function_id).is_some() {
            warn!(function_id, "jit: invalidated installed code for redefined function");
        }
    }
}

impl Default for JitCompiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, ConstValue, Op};
    use crate::class::Function;

    fn make_function(chunk: Chunk, param_count: usize, local_slot_count: usize) -> Arc<Function> {
        Arc::new(Function {
            id: crate::class::next_function_id(),
            name: "add_one".to_string(),
            param_count,
            min_arity: param_count,
            defaults: Vec::new(),
            variadic: false,
            code: Some(Arc::new(chunk)),
            local_slot_count,
            upvalue_count: 0,
            native: None,
            owning_class: None,
        })
    }

    fn add_const_chunk(value: i64) -> Chunk {
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::LoadLocal);
        chunk.emit_u16(0);
        chunk.emit_op(Op::PushConst);
        let idx = chunk.add_constant(ConstValue::Int(value));
        chunk.emit_u16(idx);
        chunk.emit_op(Op::Add);
        chunk.emit_op(Op::Return);
        chunk
    }

    #[test]
    fn compiles_eligible_function_and_caches_it() {
        let jit = JitCompiler::new();
        let function = make_function(add_const_chunk(1), 1, 1);
        assert!(jit.try_compile(&function));
        assert!(jit.is_compiled(function.id));
        assert!(jit.lookup(function.id).is_some());
    }

    #[test]
    fn declines_function_with_no_bytecode() {
        let jit = JitCompiler::new();
        let function = Arc::new(Function {
            id: crate::class::next_function_id(),
            name: "native_stub".to_string(),
            param_count: 0,
            min_arity: 0,
            defaults: Vec::new(),
            variadic: false,
            code: None,
            local_slot_count: 0,
            upvalue_count: 0,
            native: None,
            owning_class: None,
        });
        assert!(!jit.try_compile(&function));
    }

    #[test]
    fn invalidate_clears_cached_entry() {
        let jit = JitCompiler::new();
        let function = make_function(add_const_chunk(5), 1, 1);
        jit.try_compile(&function);
        jit.invalidate(function.id);
        assert!(!jit.is_compiled(function.id));
    }
}
