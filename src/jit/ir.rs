//! JIT intermediate representation: a control-flow graph of basic blocks
//! over typed instructions, lowered from a function's bytecode `Chunk`.
//!
//! Lowering assumes the operand stack is empty at every basic block
//! boundary (true of well-formed bytecode, where branches land on
//! statement edges rather than mid-expression) — each block's stack is
//! simulated from empty, so no cross-block value numbering is needed.

use std::collections::HashMap;

use crate::bytecode::{Chunk, ConstValue, Op};
use crate::error::JitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy)]
pub enum IrInst {
    LoadLocal { dst: VReg, slot: u16 },
    StoreLocal { slot: u16, src: VReg },
    LoadConst { dst: VReg, value: i64 },
    Add { dst: VReg, lhs: VReg, rhs: VReg },
    Sub { dst: VReg, lhs: VReg, rhs: VReg },
    Mul { dst: VReg, lhs: VReg, rhs: VReg },
    Div { dst: VReg, lhs: VReg, rhs: VReg },
}

#[derive(Debug, Clone, Copy)]
pub enum Terminator {
    Jump(BlockId),
    BranchIfZero { cond: VReg, zero: BlockId, nonzero: BlockId },
    Return(Option<VReg>),
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub insts: Vec<IrInst>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone)]
pub struct IrFunction {
    pub blocks: Vec<BasicBlock>,
    pub vreg_count: u32,
    pub param_count: u16,
    pub local_slot_count: u16,
}

/// Per-block translation state: a simulated operand stack of vregs plus
/// the fresh-vreg counter shared across the whole function.
struct Lowerer<'a> {
    chunk: &'a Chunk,
    vreg_count: u32,
    block_starts: Vec<usize>,
}

impl<'a> Lowerer<'a> {
    fn fresh(&mut self) -> VReg {
        let id = self.vreg_count;
        self.vreg_count += 1;
        VReg(id)
    }
}

/// Scans the byte stream for jump targets to establish block boundaries.
/// Only the IR-eligible opcode subset is recognised; anything else aborts
/// lowering so the caller falls back to interpretation.
fn find_block_starts(chunk: &Chunk) -> Result<Vec<usize>, JitError> {
    let mut starts = vec![0usize];
    let mut ip = 0usize;
    while ip < chunk.code.len() {
        let op = Op::from_byte(chunk.code[ip]).map_err(|_| JitError::UnsupportedInstruction { detail: "bad opcode byte".into() })?;
        ip += 1;
        match op {
            Op::Jump | Op::JumpIfTrue | Op::JumpIfFalse | Op::LoopJump => {
                let offset = chunk.read_i16(ip) as i32;
                let after_operand = ip + 2;
                let target = (after_operand as i32 + offset) as usize;
                starts.push(target);
                starts.push(after_operand);
                ip = after_operand;
            }
            Op::PushConst => ip += 2,
            Op::LoadLocal | Op::StoreLocal => ip += 2,
            Op::Return
            | Op::PushZero
            | Op::PushOne
            | Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Pop
            | Op::Dup => {}
            _ => return Err(JitError::UnsupportedInstruction { detail: format!("{op:?} not eligible for JIT") }),
        }
    }
    starts.sort_unstable();
    starts.dedup();
    starts.retain(|&s| s < chunk.code.len());
    Ok(starts)
}

fn block_id_for(starts: &[usize], offset: usize) -> BlockId {
    let idx = starts.binary_search(&offset).unwrap_or_else(|i| i.saturating_sub(1));
    BlockId(idx as u32)
}

/// Lowers a function body to the JIT IR. Only a restricted opcode subset
/// (const push, local load/store, integer arithmetic, unconditional and
/// zero-tested branches, return) is eligible; any other opcode in the
/// chunk causes the whole function to be rejected for this tier.
pub fn lower_chunk(chunk: &Chunk, param_count: u16, local_slot_count: u16) -> Result<IrFunction, JitError> {
    let starts = find_block_starts(chunk)?;
    let mut lowerer = Lowerer { chunk, vreg_count: 0, block_starts: starts.clone() };

    let mut blocks = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(chunk.code.len());
        let block = lower_block(&mut lowerer, start, end)?;
        blocks.push(block);
    }

    Ok(IrFunction { blocks, vreg_count: lowerer.vreg_count, param_count, local_slot_count })
}

fn lower_block(lowerer: &mut Lowerer, start: usize, end: usize) -> Result<BasicBlock, JitError> {
    let id = block_id_for(&lowerer.block_starts, start);
    let mut insts = Vec::new();
    let mut stack: Vec<VReg> = Vec::new();
    let mut ip = start;
    let mut terminator = None;

    while ip < end {
        let op = Op::from_byte(lowerer.chunk.code[ip]).map_err(|_| JitError::UnsupportedInstruction { detail: "malformed opcode stream".into() })?;
        ip += 1;
        match op {
            Op::PushConst => {
                let idx = lowerer.chunk.read_u16(ip) as usize;
                ip += 2;
                let value = match lowerer.chunk.constants.get(idx) {
                    Some(ConstValue::Int(i)) => *i,
                    Some(ConstValue::Bool(b)) => *b as i64,
                    _ => return Err(JitError::UnsupportedInstruction { detail: "non-integer constant in JIT-eligible function".into() }),
                };
                let dst = lowerer.fresh();
                insts.push(IrInst::LoadConst { dst, value });
                stack.push(dst);
            }
            Op::PushZero => {
                let dst = lowerer.fresh();
                insts.push(IrInst::LoadConst { dst, value: 0 });
                stack.push(dst);
            }
            Op::PushOne => {
                let dst = lowerer.fresh();
                insts.push(IrInst::LoadConst { dst, value: 1 });
                stack.push(dst);
            }
            Op::LoadLocal => {
                let slot = lowerer.chunk.read_u16(ip);
                ip += 2;
                let dst = lowerer.fresh();
                insts.push(IrInst::LoadLocal { dst, slot });
                stack.push(dst);
            }
            Op::StoreLocal => {
                let slot = lowerer.chunk.read_u16(ip);
                ip += 2;
                let src = stack.pop().ok_or(JitError::UnsupportedInstruction { detail: "malformed opcode stream".into() })?;
                insts.push(IrInst::StoreLocal { slot, src });
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div => {
                let rhs = stack.pop().ok_or(JitError::UnsupportedInstruction { detail: "malformed opcode stream".into() })?;
                let lhs = stack.pop().ok_or(JitError::UnsupportedInstruction { detail: "malformed opcode stream".into() })?;
                let dst = lowerer.fresh();
                insts.push(match op {
                    Op::Add => IrInst::Add { dst, lhs, rhs },
                    Op::Sub => IrInst::Sub { dst, lhs, rhs },
                    Op::Mul => IrInst::Mul { dst, lhs, rhs },
                    _ => IrInst::Div { dst, lhs, rhs },
                });
                stack.push(dst);
            }
            Op::Pop => {
                stack.pop();
            }
            Op::Dup => {
                let top = *stack.last().ok_or(JitError::UnsupportedInstruction { detail: "malformed opcode stream".into() })?;
                stack.push(top);
            }
            Op::Jump | Op::LoopJump => {
                let offset = lowerer.chunk.read_i16(ip) as i32;
                let target = (ip as i32 + 2 + offset) as usize;
                ip += 2;
                terminator = Some(Terminator::Jump(block_id_for(&lowerer.block_starts, target)));
            }
            Op::JumpIfFalse | Op::JumpIfTrue => {
                let offset = lowerer.chunk.read_i16(ip) as i32;
                let branch_target = (ip as i32 + 2 + offset) as usize;
                ip += 2;
                let cond = stack.pop().ok_or(JitError::UnsupportedInstruction { detail: "malformed opcode stream".into() })?;
                let fallthrough = block_id_for(&lowerer.block_starts, ip);
                let taken = block_id_for(&lowerer.block_starts, branch_target);
                terminator = Some(if op == Op::JumpIfFalse {
                    Terminator::BranchIfZero { cond, zero: taken, nonzero: fallthrough }
                } else {
                    Terminator::BranchIfZero { cond, zero: fallthrough, nonzero: taken }
                });
            }
            Op::Return => {
                terminator = Some(Terminator::Return(stack.pop()));
            }
            _ => return Err(JitError::UnsupportedInstruction { detail: format!("{op:?} not eligible for JIT") }),
        }
    }

    let terminator = match terminator {
        Some(t) => t,
        None if (id.0 as usize) + 1 < lowerer.block_starts.len() => Terminator::Jump(BlockId(id.0 + 1)),
        None => Terminator::Return(stack.pop()),
    };

    Ok(BasicBlock { id, insts, terminator })
}

/// Maps each basic block id to its intended physical label offset once
/// emitted, populated by the backend during codegen. Kept here since
/// both backends share the same bookkeeping shape.
pub type BlockOffsets = HashMap<BlockId, usize>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;

    fn counting_loop_chunk() -> Chunk {
        // i = 0; while (i) { i = i - 1 }; return i
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::PushZero);
        chunk.emit_op(Op::StoreLocal);
        chunk.emit_u16(0);
        let loop_start = chunk.code.len();
        chunk.emit_op(Op::LoadLocal);
        chunk.emit_u16(0);
        let exit_jump = chunk.emit_jump(Op::JumpIfFalse);
        chunk.emit_op(Op::LoadLocal);
        chunk.emit_u16(0);
        chunk.emit_op(Op::PushOne);
        chunk.emit_op(Op::Sub);
        chunk.emit_op(Op::StoreLocal);
        chunk.emit_u16(0);
        let back_at = chunk.emit_jump(Op::LoopJump);
        let back_target = loop_start as i16 - back_at as i16 - 2;
        chunk.code[back_at..back_at + 2].copy_from_slice(&back_target.to_be_bytes());
        chunk.patch_jump(exit_jump);
        chunk.emit_op(Op::LoadLocal);
        chunk.emit_u16(0);
        chunk.emit_op(Op::Return);
        chunk
    }

    #[test]
    fn lowers_counting_loop_to_multiple_blocks() {
        let chunk = counting_loop_chunk();
        let func = lower_chunk(&chunk, 0, 1).unwrap();
        assert!(func.blocks.len() >= 3);
        assert!(matches!(func.blocks.last().unwrap().terminator, Terminator::Return(Some(_))));
    }

    #[test]
    fn rejects_unsupported_opcode() {
        let mut chunk = Chunk::new();
        chunk.emit_op(Op::NewObject);
        chunk.emit_u16(0);
        assert!(lower_chunk(&chunk, 0, 0).is_err());
    }
}
