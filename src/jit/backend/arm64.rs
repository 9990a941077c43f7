//! ARM64 (AArch64) backend: `x29`/`x30` frame, slots addressed as
//! `[sp, #imm]` after the prologue reserves the frame, 64-bit constants
//! composed from up to four 16-bit `MOVZ`/`MOVK` pieces.

use std::collections::HashMap;

use crate::error::JitError;
use crate::jit::ir::{BasicBlock, BlockId, IrFunction, IrInst, Terminator};
use crate::jit::regalloc::RegAlloc;

use super::{align16, CodegenBackend, CompiledCode, Relocation, TargetArch, TargetInfo};

/// General-purpose registers handed to the allocator; `x8` is reserved as
/// scratch for spilled operands, `x0` holds the return value.
pub const AVAILABLE_REGISTERS: [u8; 5] = [9, 10, 11, 12, 13];

const SCRATCH: u8 = 8;
const SP: u8 = 31;

fn push_word(code: &mut Vec<u8>, word: u32) {
    code.extend_from_slice(&word.to_le_bytes());
}

fn movz(rd: u8, imm16: u16, hw: u8) -> u32 {
    0xD2800000 | ((hw as u32) << 21) | ((imm16 as u32) << 5) | rd as u32
}

fn movk(rd: u8, imm16: u16, hw: u8) -> u32 {
    0xF2800000 | ((hw as u32) << 21) | ((imm16 as u32) << 5) | rd as u32
}

fn mov_reg(rd: u8, rn: u8) -> u32 {
    0xAA0003E0 | ((rn as u32) << 16) | rd as u32
}

fn add_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0x8B000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

fn sub_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0xCB000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

fn mul_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9B007C00 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

fn sdiv_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9AC00C00 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

fn str_imm(rt: u8, rn: u8, byte_offset: u32) -> u32 {
    debug_assert!(byte_offset % 8 == 0);
    0xF9000000 | ((byte_offset / 8) << 10) | ((rn as u32) << 5) | rt as u32
}

fn ldr_imm(rt: u8, rn: u8, byte_offset: u32) -> u32 {
    debug_assert!(byte_offset % 8 == 0);
    0xF9400000 | ((byte_offset / 8) << 10) | ((rn as u32) << 5) | rt as u32
}

fn ret() -> u32 {
    0xD65F03C0
}

pub struct Arm64Backend;

impl Arm64Backend {
    fn emit_const(&self, code: &mut Vec<u8>, rd: u8, value: i64) {
        let bits = value as u64;
        let pieces = [bits as u16, (bits >> 16) as u16, (bits >> 32) as u16, (bits >> 48) as u16];
        push_word(code, movz(rd, pieces[0], 0));
        for (hw, piece) in pieces.iter().enumerate().skip(1) {
            if *piece != 0 {
                push_word(code, movk(rd, *piece, hw as u8));
            }
        }
    }

    fn materialize(&self, code: &mut Vec<u8>, regs: &RegAlloc, vreg: crate::jit::ir::VReg, scratch: u8) -> u8 {
        if let Some(slot) = regs.slot_of(vreg) {
            push_word(code, ldr_imm(scratch, SP, slot * 8));
            scratch
        } else {
            regs.physical_of(vreg).expect("vreg neither spilled nor allocated")
        }
    }

    fn store_result(&self, code: &mut Vec<u8>, regs: &RegAlloc, vreg: crate::jit::ir::VReg, value_reg: u8) {
        if let Some(slot) = regs.slot_of(vreg) {
            push_word(code, str_imm(value_reg, SP, slot * 8));
        }
    }
}

impl CodegenBackend for Arm64Backend {
    fn name(&self) -> &str {
        "arm64"
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo { arch: TargetArch::Arm64, pointer_size: 8 }
    }

    fn compile(&self, func: &IrFunction, regs: &RegAlloc) -> Result<CompiledCode, JitError> {
        let total_slots = func.local_slot_count as usize + regs.spill_slot_count as usize;
        let frame_bytes = align16(total_slots * 8);

        let mut code = Vec::new();
        // stp x29, x30, [sp, #-16]!
        push_word(&mut code, 0xA9BF7BFD);
        // mov x29, sp
        push_word(&mut code, mov_reg(29, SP));
        if frame_bytes > 0 {
            // sub sp, sp, #frame_bytes (12-bit unsigned immediate, unshifted)
            push_word(&mut code, 0xD1000000 | ((frame_bytes as u32) << 10) | ((SP as u32) << 5) | SP as u32);
        }

        let mut block_offsets: HashMap<BlockId, usize> = HashMap::new();
        let mut relocations: Vec<Relocation> = Vec::new();

        for block in &func.blocks {
            block_offsets.insert(block.id, code.len());
            self.compile_block(block, func, regs, frame_bytes, &mut code, &mut relocations)?;
        }

        for reloc in &relocations {
            let target_offset = *block_offsets
                .get(&reloc.target)
                .ok_or(JitError::MissingRelocationTarget { block_id: reloc.target.0 })?;
            let delta = target_offset as i64 - reloc.code_offset as i64;
            debug_assert!(delta % 4 == 0);
            let word_delta = (delta / 4) as i32;
            let existing = u32::from_le_bytes(code[reloc.code_offset..reloc.code_offset + 4].try_into().unwrap());
            let patched = if existing & 0xFC000000 == 0x14000000 {
                (existing & 0xFC000000) | ((word_delta as u32) & 0x03FF_FFFF)
            } else {
                (existing & 0xFF00_001F) | (((word_delta as u32) & 0x0007_FFFF) << 5)
            };
            code[reloc.code_offset..reloc.code_offset + 4].copy_from_slice(&patched.to_le_bytes());
        }

        Ok(CompiledCode { code, entry_offset: 0 })
    }
}

impl Arm64Backend {
    fn compile_block(
        &self,
        block: &BasicBlock,
        func: &IrFunction,
        regs: &RegAlloc,
        frame_bytes: usize,
        code: &mut Vec<u8>,
        relocations: &mut Vec<Relocation>,
    ) -> Result<(), JitError> {
        for inst in &block.insts {
            match *inst {
                IrInst::LoadConst { dst, value } => {
                    if let Some(slot) = regs.slot_of(dst) {
                        self.emit_const(code, SCRATCH, value);
                        push_word(code, str_imm(SCRATCH, SP, slot * 8));
                    } else {
                        let phys = regs.physical_of(dst).unwrap();
                        self.emit_const(code, phys, value);
                    }
                }
                IrInst::LoadLocal { dst, slot } => {
                    let offset = local_offset(slot, func);
                    if let Some(spill) = regs.slot_of(dst) {
                        push_word(code, ldr_imm(SCRATCH, SP, offset));
                        push_word(code, str_imm(SCRATCH, SP, spill * 8));
                    } else {
                        let phys = regs.physical_of(dst).unwrap();
                        push_word(code, ldr_imm(phys, SP, offset));
                    }
                }
                IrInst::StoreLocal { slot, src } => {
                    let value_reg = self.materialize(code, regs, src, SCRATCH);
                    push_word(code, str_imm(value_reg, SP, local_offset(slot, func)));
                }
                IrInst::Add { dst, lhs, rhs } | IrInst::Sub { dst, lhs, rhs } | IrInst::Mul { dst, lhs, rhs } | IrInst::Div { dst, lhs, rhs } => {
                    let lhs_reg = self.materialize(code, regs, lhs, SCRATCH);
                    let rhs_reg = self.materialize(code, regs, rhs, 0);
                    let dst_reg = regs.physical_of(dst).unwrap_or(SCRATCH);
                    let word = match *inst {
                        IrInst::Add { .. } => add_reg(dst_reg, lhs_reg, rhs_reg),
                        IrInst::Sub { .. } => sub_reg(dst_reg, lhs_reg, rhs_reg),
                        IrInst::Mul { .. } => mul_reg(dst_reg, lhs_reg, rhs_reg),
                        _ => sdiv_reg(dst_reg, lhs_reg, rhs_reg),
                    };
                    push_word(code, word);
                    self.store_result(code, regs, dst, dst_reg);
                }
            }
        }

        match block.terminator {
            Terminator::Jump(target) => {
                let at = code.len();
                push_word(code, 0x14000000);
                relocations.push(Relocation { code_offset: at, target });
            }
            Terminator::BranchIfZero { cond, zero, nonzero } => {
                let reg = self.materialize(code, regs, cond, SCRATCH);
                let at = code.len();
                push_word(code, 0xB4000000 | reg as u32); // cbz reg, <placeholder>
                relocations.push(Relocation { code_offset: at, target: zero });
                let at2 = code.len();
                push_word(code, 0x14000000); // b <placeholder>
                relocations.push(Relocation { code_offset: at2, target: nonzero });
            }
            Terminator::Return(value) => {
                if let Some(vreg) = value {
                    let reg = self.materialize(code, regs, vreg, SCRATCH);
                    if reg != 0 {
                        push_word(code, mov_reg(0, reg));
                    }
                }
                if frame_bytes > 0 {
                    push_word(code, 0x91000000 | ((frame_bytes as u32) << 10) | ((SP as u32) << 5) | SP as u32);
                }
                push_word(code, 0xA8C17BFD); // ldp x29, x30, [sp], #16
                push_word(code, ret());
            }
        }
        Ok(())
    }
}

fn local_offset(slot: u16, func: &IrFunction) -> u32 {
    debug_assert!(slot < func.local_slot_count);
    slot as u32 * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, ConstValue, Op};
    use crate::jit::ir::lower_chunk;
    use crate::jit::regalloc::allocate;

    #[test]
    fn compiles_straight_line_function_without_error() {
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::LoadLocal);
        chunk.emit_u16(0);
        chunk.emit_op(Op::PushConst);
        let idx = chunk.add_constant(ConstValue::Int(42));
        chunk.emit_u16(idx);
        chunk.emit_op(Op::Add);
        chunk.emit_op(Op::Return);

        let ir = lower_chunk(&chunk, 1, 1).unwrap();
        let regs = allocate(&ir, &AVAILABLE_REGISTERS);
        let backend = Arm64Backend;
        let compiled = backend.compile(&ir, &regs).unwrap();
        assert!(compiled.code.len() % 4 == 0);
        assert!(!compiled.code.is_empty());
    }

    #[test]
    fn large_constant_emits_multiple_movk_pieces() {
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::PushConst);
        let idx = chunk.add_constant(ConstValue::Int(0x1122_3344_5566_7788u64 as i64));
        chunk.emit_u16(idx);
        chunk.emit_op(Op::Return);
        let ir = lower_chunk(&chunk, 0, 0).unwrap();
        let regs = allocate(&ir, &AVAILABLE_REGISTERS);
        let backend = Arm64Backend;
        let compiled = backend.compile(&ir, &regs).unwrap();
        // movz + 3 movk + mov x0 + epilogue(2) at minimum
        assert!(compiled.code.len() >= 4 * 6);
    }
}
