//! x86-64 backend: System V frame, `rbp`-relative local/spill slots,
//! `rax` as the universal scratch register for any spilled operand.

use std::collections::HashMap;

use crate::error::JitError;
use crate::jit::ir::{BasicBlock, BlockId, IrFunction, IrInst, Terminator};
use crate::jit::regalloc::RegAlloc;

use super::{align16, CodegenBackend, CompiledCode, Relocation, TargetArch, TargetInfo};

/// Caller-saved-by-us GPRs available to the allocator, named by their
/// encoding in the 0-15 GPR space (`rbx`, `r12`-`r15`); `rax`/`rdx` are
/// reserved for scratch and division, `rbp`/`rsp` for the frame.
pub const AVAILABLE_REGISTERS: [u8; 5] = [3, 12, 13, 14, 15];

const RAX: u8 = 0;
const RDX: u8 = 2;

fn rex(w: bool, reg: u8, rm: u8) -> u8 {
    0x40 | ((w as u8) << 3) | (((reg >= 8) as u8) << 2) | ((rm >= 8) as u8)
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

pub struct X86_64Backend;

impl X86_64Backend {
    fn emit_mov_imm64(&self, code: &mut Vec<u8>, dst: u8, value: i64) {
        code.push(rex(true, 0, dst));
        code.push(0xB8 + (dst & 7));
        code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_mov_reg_reg(&self, code: &mut Vec<u8>, dst: u8, src: u8) {
        code.push(rex(true, src, dst));
        code.push(0x89);
        code.push(modrm(0b11, src, dst));
    }

    fn emit_load_slot(&self, code: &mut Vec<u8>, dst: u8, slot_index: u32) {
        let disp = -(8 * (slot_index as i64 + 1));
        code.push(rex(true, dst, 5));
        code.push(0x8B);
        code.push(modrm(0b01, dst, 5));
        code.push(disp as i8 as u8);
    }

    fn emit_store_slot(&self, code: &mut Vec<u8>, slot_index: u32, src: u8) {
        let disp = -(8 * (slot_index as i64 + 1));
        code.push(rex(true, src, 5));
        code.push(0x89);
        code.push(modrm(0b01, src, 5));
        code.push(disp as i8 as u8);
    }

    fn emit_arith(&self, code: &mut Vec<u8>, op: IrInst, dst: u8, lhs: u8, rhs: u8) {
        if dst != lhs {
            self.emit_mov_reg_reg(code, dst, lhs);
        }
        match op {
            IrInst::Add { .. } => {
                code.push(rex(true, rhs, dst));
                code.push(0x01);
                code.push(modrm(0b11, rhs, dst));
            }
            IrInst::Sub { .. } => {
                code.push(rex(true, rhs, dst));
                code.push(0x29);
                code.push(modrm(0b11, rhs, dst));
            }
            IrInst::Mul { .. } => {
                code.push(rex(true, dst, rhs));
                code.push(0x0F);
                code.push(0xAF);
                code.push(modrm(0b11, dst, rhs));
            }
            IrInst::Div { .. } => {
                self.emit_mov_reg_reg(code, RAX, dst);
                code.push(rex(true, 0, 0));
                code.push(0x99); // cqo
                code.push(rex(true, 0, rhs));
                code.push(0xF7);
                code.push(modrm(0b11, 7, rhs)); // idiv rhs
                self.emit_mov_reg_reg(code, dst, RAX);
            }
            _ => unreachable!("non-arithmetic instruction"),
        }
    }

    /// Loads `vreg` into `scratch`, respecting spill placement; returns
    /// the register actually holding the value (either the scratch, or
    /// the vreg's own physical register when it isn't spilled).
    fn materialize(
        &self,
        code: &mut Vec<u8>,
        regs: &RegAlloc,
        vreg: crate::jit::ir::VReg,
        scratch: u8,
    ) -> u8 {
        if let Some(slot) = regs.slot_of(vreg) {
            self.emit_load_slot(code, scratch, slot);
            scratch
        } else {
            regs.physical_of(vreg).expect("vreg neither spilled nor allocated")
        }
    }

    fn store_result(&self, code: &mut Vec<u8>, regs: &RegAlloc, vreg: crate::jit::ir::VReg, value_reg: u8) {
        if let Some(slot) = regs.slot_of(vreg) {
            self.emit_store_slot(code, slot, value_reg);
        }
    }
}

impl CodegenBackend for X86_64Backend {
    fn name(&self) -> &str {
        "x86_64"
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo { arch: TargetArch::X86_64, pointer_size: 8 }
    }

    fn compile(&self, func: &IrFunction, regs: &RegAlloc) -> Result<CompiledCode, JitError> {
        let total_slots = func.local_slot_count as usize + regs.spill_slot_count as usize;
        let frame_bytes = align16(total_slots * 8);

        let mut code = Vec::new();
        code.push(0x55); // push rbp
        code.push(rex(true, 5, 4));
        code.push(0x89);
        code.push(modrm(0b11, 4, 5)); // mov rbp, rsp
        if frame_bytes > 0 {
            code.push(rex(true, 0, 4));
            code.push(0x81);
            code.push(modrm(0b11, 5, 4));
            code.extend_from_slice(&(frame_bytes as u32).to_le_bytes()); // sub rsp, frame_bytes
        }

        let mut block_offsets: HashMap<BlockId, usize> = HashMap::new();
        let mut relocations: Vec<Relocation> = Vec::new();

        for block in &func.blocks {
            block_offsets.insert(block.id, code.len());
            self.compile_block(block, func, regs, &mut code, &mut relocations)?;
        }

        for reloc in &relocations {
            let target_offset = *block_offsets
                .get(&reloc.target)
                .ok_or(JitError::MissingRelocationTarget { block_id: reloc.target.0 })?;
            let instr_end = reloc.code_offset + 4;
            let rel = target_offset as i64 - instr_end as i64;
            code[reloc.code_offset..instr_end].copy_from_slice(&(rel as i32).to_le_bytes());
        }

        Ok(CompiledCode { code, entry_offset: 0 })
    }
}

impl X86_64Backend {
    fn compile_block(
        &self,
        block: &BasicBlock,
        func: &IrFunction,
        regs: &RegAlloc,
        code: &mut Vec<u8>,
        relocations: &mut Vec<Relocation>,
    ) -> Result<(), JitError> {
        for inst in &block.insts {
            match *inst {
                IrInst::LoadConst { dst, value } => {
                    if let Some(slot) = regs.slot_of(dst) {
                        self.emit_mov_imm64(code, RAX, value);
                        self.emit_store_slot(code, slot, RAX);
                    } else {
                        let phys = regs.physical_of(dst).unwrap();
                        self.emit_mov_imm64(code, phys, value);
                    }
                }
                IrInst::LoadLocal { dst, slot } => {
                    if let Some(spill) = regs.slot_of(dst) {
                        self.emit_load_slot(code, RAX, local_slot(slot, func));
                        self.emit_store_slot(code, spill, RAX);
                    } else {
                        let phys = regs.physical_of(dst).unwrap();
                        self.emit_load_slot(code, phys, local_slot(slot, func));
                    }
                }
                IrInst::StoreLocal { slot, src } => {
                    let value_reg = self.materialize(code, regs, src, RAX);
                    self.emit_store_slot(code, local_slot(slot, func), value_reg);
                }
                IrInst::Add { dst, lhs, rhs } | IrInst::Sub { dst, lhs, rhs } | IrInst::Mul { dst, lhs, rhs } | IrInst::Div { dst, lhs, rhs } => {
                    let lhs_reg = self.materialize(code, regs, lhs, RAX);
                    let rhs_reg = self.materialize(code, regs, rhs, RDX);
                    let dst_reg = regs.physical_of(dst).unwrap_or(RAX);
                    self.emit_arith(code, *inst, dst_reg, lhs_reg, rhs_reg);
                    self.store_result(code, regs, dst, dst_reg);
                }
            }
        }

        match block.terminator {
            Terminator::Jump(target) => {
                code.push(0xE9);
                let at = code.len();
                code.extend_from_slice(&0i32.to_le_bytes());
                relocations.push(Relocation { code_offset: at, target });
            }
            Terminator::BranchIfZero { cond, zero, nonzero } => {
                let reg = self.materialize(code, regs, cond, RAX);
                code.push(rex(true, reg, reg));
                code.push(0x85);
                code.push(modrm(0b11, reg, reg)); // test reg, reg
                code.push(0x0F);
                code.push(0x84); // je rel32
                let at = code.len();
                code.extend_from_slice(&0i32.to_le_bytes());
                relocations.push(Relocation { code_offset: at, target: zero });
                code.push(0xE9); // jmp rel32 (fallthrough target)
                let at2 = code.len();
                code.extend_from_slice(&0i32.to_le_bytes());
                relocations.push(Relocation { code_offset: at2, target: nonzero });
            }
            Terminator::Return(value) => {
                if let Some(vreg) = value {
                    let reg = self.materialize(code, regs, vreg, RAX);
                    if reg != RAX {
                        self.emit_mov_reg_reg(code, RAX, reg);
                    }
                }
                code.push(rex(true, 4, 5));
                code.push(0x89);
                code.push(modrm(0b11, 4, 5)); // mov rsp, rbp
                code.push(0x5D); // pop rbp
                code.push(0xC3); // ret
            }
        }
        Ok(())
    }
}

/// Local slots are addressed as the low indices of the combined local +
/// spill slot region, ahead of the spill slots that come after them.
fn local_slot(slot: u16, func: &IrFunction) -> u32 {
    debug_assert!(slot < func.local_slot_count);
    slot as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{lower_chunk, VReg};
    use crate::jit::regalloc::allocate;
    use crate::bytecode::{Chunk, Op};

    fn add_one_and_return(n: i64) -> Chunk {
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::LoadLocal);
        chunk.emit_u16(0);
        chunk.emit_op(Op::PushConst);
        let idx = chunk.add_constant(crate::bytecode::ConstValue::Int(n));
        chunk.emit_u16(idx);
        chunk.emit_op(Op::Add);
        chunk.emit_op(Op::Return);
        chunk
    }

    #[test]
    fn compiles_straight_line_function_without_error() {
        let chunk = add_one_and_return(1);
        let ir = lower_chunk(&chunk, 1, 1).unwrap();
        let regs = allocate(&ir, &AVAILABLE_REGISTERS);
        let backend = X86_64Backend;
        let compiled = backend.compile(&ir, &regs).unwrap();
        assert!(!compiled.code.is_empty());
        assert_eq!(*compiled.code.last().unwrap(), 0xC3);
    }

    #[test]
    fn branching_function_resolves_all_relocations() {
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::LoadLocal);
        chunk.emit_u16(0);
        let exit = chunk.emit_jump(Op::JumpIfFalse);
        chunk.emit_op(Op::PushOne);
        chunk.emit_op(Op::Return);
        chunk.patch_jump(exit);
        chunk.emit_op(Op::PushZero);
        chunk.emit_op(Op::Return);
        let ir = lower_chunk(&chunk, 1, 1).unwrap();
        let regs = allocate(&ir, &AVAILABLE_REGISTERS);
        let backend = X86_64Backend;
        let compiled = backend.compile(&ir, &regs);
        assert!(compiled.is_ok());
        let _ = VReg(0);
    }
}
