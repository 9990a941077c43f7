//! Per-target code generation backends. Each backend turns an `IrFunction`
//! plus an externally supplied `RegAlloc` into a relocatable byte buffer;
//! relocation application and executable-page installation are handled
//! uniformly by `jit::exec_memory` once a backend finishes.

pub mod arm64;
pub mod x86_64;

use crate::error::JitError;
use crate::jit::ir::{BlockId, IrFunction};
use crate::jit::regalloc::RegAlloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    Arm64,
}

#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: usize,
}

/// A branch relocation keyed by the destination block id, resolved once
/// every block's start offset is known.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub code_offset: usize,
    pub target: BlockId,
}

#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    pub entry_offset: usize,
}

/// Backends implement this to generate native code from the JIT IR.
/// Compilation is: `IrFunction + RegAlloc -> compile() -> CompiledCode`,
/// with relocations already resolved against the emitted block offsets.
pub trait CodegenBackend: Send + Sync {
    fn name(&self) -> &str;
    fn target_info(&self) -> TargetInfo;
    fn compile(&self, func: &IrFunction, regs: &RegAlloc) -> Result<CompiledCode, JitError>;
}

/// Aligns `n` up to the nearest multiple of 16, as both prologues need a
/// 16-byte-aligned stack frame regardless of target.
pub(super) fn align16(n: usize) -> usize {
    (n + 15) & !15
}
