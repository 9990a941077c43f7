//! Register allocation is supplied to the backend as a plain data shape
//! rather than computed by it — per the design note, this keeps codegen
//! simple and testable, and leaves room for a smarter allocator later
//! without touching backend code. What's here is a linear-scan-shaped
//! greedy allocator: the first N distinct vregs get physical registers in
//! order of first definition, the rest spill to stack slots in the same
//! order.

use std::collections::HashMap;

use super::ir::{IrFunction, IrInst, VReg};

/// A virtual-register allocation: some vregs live in physical registers,
/// the rest live in numbered stack slots.
#[derive(Debug, Clone, Default)]
pub struct RegAlloc {
    pub physical: HashMap<VReg, u8>,
    pub spill_slots: HashMap<VReg, u32>,
    pub spill_slot_count: u32,
}

impl RegAlloc {
    pub fn is_spilled(&self, vreg: VReg) -> bool {
        self.spill_slots.contains_key(&vreg)
    }

    pub fn physical_of(&self, vreg: VReg) -> Option<u8> {
        self.physical.get(&vreg).copied()
    }

    pub fn slot_of(&self, vreg: VReg) -> Option<u32> {
        self.spill_slots.get(&vreg).copied()
    }
}

/// Allocates `available` as the scratch-excluded physical register pool.
/// Visits vregs in order of first appearance across all blocks so that
/// short-lived temporaries within a block tend to land in registers.
pub fn allocate(func: &IrFunction, available: &[u8]) -> RegAlloc {
    let mut order = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for block in &func.blocks {
        for inst in &block.insts {
            for vreg in inst_operands(inst) {
                if seen.insert(vreg) {
                    order.push(vreg);
                }
            }
        }
    }

    let mut alloc = RegAlloc::default();
    let mut next_slot = 0u32;
    for (idx, vreg) in order.into_iter().enumerate() {
        if idx < available.len() {
            alloc.physical.insert(vreg, available[idx]);
        } else {
            alloc.spill_slots.insert(vreg, next_slot);
            next_slot += 1;
        }
    }
    alloc.spill_slot_count = next_slot;
    alloc
}

fn inst_operands(inst: &IrInst) -> Vec<VReg> {
    match *inst {
        IrInst::LoadLocal { dst, .. } => vec![dst],
        IrInst::StoreLocal { src, .. } => vec![src],
        IrInst::LoadConst { dst, .. } => vec![dst],
        IrInst::Add { dst, lhs, rhs }
        | IrInst::Sub { dst, lhs, rhs }
        | IrInst::Mul { dst, lhs, rhs }
        | IrInst::Div { dst, lhs, rhs } => vec![dst, lhs, rhs],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{BasicBlock, BlockId, Terminator};

    fn sample_func() -> IrFunction {
        let v = |n| VReg(n);
        let block = BasicBlock {
            id: BlockId(0),
            insts: vec![
                IrInst::LoadConst { dst: v(0), value: 1 },
                IrInst::LoadConst { dst: v(1), value: 2 },
                IrInst::Add { dst: v(2), lhs: v(0), rhs: v(1) },
            ],
            terminator: Terminator::Return(Some(v(2))),
        };
        IrFunction { blocks: vec![block], vreg_count: 3, param_count: 0, local_slot_count: 0 }
    }

    #[test]
    fn vregs_within_register_budget_are_not_spilled() {
        let func = sample_func();
        let alloc = allocate(&func, &[0, 1, 2, 3]);
        assert_eq!(alloc.spill_slot_count, 0);
        assert!(alloc.physical_of(VReg(0)).is_some());
    }

    #[test]
    fn overflow_vregs_spill_to_stack_slots() {
        let func = sample_func();
        let alloc = allocate(&func, &[0]);
        assert_eq!(alloc.spill_slot_count, 2);
        assert!(alloc.is_spilled(VReg(1)));
        assert!(alloc.is_spilled(VReg(2)));
    }
}
