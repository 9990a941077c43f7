//! The operand stack and call-frame array the interpreter runs on.

use std::sync::{Arc, RwLock};

use crate::class::{Closure, Function, Upvalue};
use crate::error::RuntimeError;
use crate::value::Value;

/// One activation record. Locals live at `base..base+local_slot_count` of
/// the shared operand stack; `base` is the frame's base pointer.
pub struct CallFrame {
    pub function: Arc<Function>,
    pub closure: Option<Arc<Closure>>,
    pub ip: usize,
    pub base: usize,
    pub is_static_call: bool,
    /// Innermost-first list of `(start, end, handler_ip, catch_slot)` active
    /// try-contexts, consulted by exception propagation (§4.6).
    pub try_contexts: Vec<TryContext>,
    /// Upvalues captured as `Open` pointers into this frame's locals,
    /// keyed by absolute stack slot. Closed when the frame is popped.
    pub open_upvalues: Vec<(usize, Arc<RwLock<Upvalue>>)>,
}

#[derive(Debug, Clone, Copy)]
pub struct TryContext {
    pub start: usize,
    pub end: usize,
    pub handler_ip: usize,
    pub catch_slot: u16,
}

impl CallFrame {
    pub fn new(function: Arc<Function>, closure: Option<Arc<Closure>>, base: usize, is_static_call: bool) -> Self {
        CallFrame {
            function,
            closure,
            ip: 0,
            base,
            is_static_call,
            try_contexts: Vec::new(),
            open_upvalues: Vec::new(),
        }
    }

    pub fn covering_try_context(&self, ip: usize) -> Option<TryContext> {
        self.try_contexts
            .iter()
            .rev()
            .find(|t| ip >= t.start && ip < t.end)
            .copied()
    }

    /// Finds an already-open upvalue pointing at `slot`, for the "inherit
    /// from an existing open capture" case instead of double-opening it.
    pub fn find_open_upvalue(&self, slot: usize) -> Option<Arc<RwLock<Upvalue>>> {
        self.open_upvalues.iter().find(|(s, _)| *s == slot).map(|(_, uv)| uv.clone())
    }

    /// Closes every open upvalue captured from this frame, snapshotting the
    /// live stack value at the moment the frame is popped.
    pub fn close_upvalues(&mut self, stack: &OperandStack) {
        for (slot, uv) in self.open_upvalues.drain(..) {
            let value = stack.get(slot).clone();
            uv.write().unwrap().close(value);
        }
    }
}

/// A fixed-capacity operand stack. Overflow raises `StackOverflow` instead
/// of growing, matching the "fixed-capacity array plus stack pointer" design.
pub struct OperandStack {
    slots: Vec<Value>,
    capacity: usize,
}

impl OperandStack {
    pub fn new(capacity: usize) -> Self {
        OperandStack {
            slots: Vec::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.slots.len() >= self.capacity {
            return Err(RuntimeError::StackOverflow {
                capacity: self.capacity,
            });
        }
        self.slots.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.slots.pop().unwrap_or(Value::Null)
    }

    pub fn peek(&self) -> &Value {
        self.slots.last().unwrap_or(&Value::Null)
    }

    pub fn dup(&mut self) -> Result<(), RuntimeError> {
        let top = self.peek().clone();
        self.push(top)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    pub fn get(&self, index: usize) -> &Value {
        self.slots.get(index).unwrap_or(&Value::Null)
    }

    pub fn set(&mut self, index: usize, value: Value) {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Value::Null);
        }
        self.slots[index] = value;
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_after_push_returns_same_value() {
        let mut stack = OperandStack::new(8);
        stack.push(Value::Int(7)).unwrap();
        assert!(matches!(stack.pop(), Value::Int(7)));
    }

    #[test]
    fn dup_after_push_duplicates_top() {
        let mut stack = OperandStack::new(8);
        stack.push(Value::Int(5)).unwrap();
        stack.dup().unwrap();
        assert_eq!(stack.len(), 2);
        assert!(matches!(stack.pop(), Value::Int(5)));
        assert!(matches!(stack.pop(), Value::Int(5)));
    }

    #[test]
    fn overflow_raises_capacity_fault() {
        let mut stack = OperandStack::new(2);
        stack.push(Value::Int(1)).unwrap();
        stack.push(Value::Int(2)).unwrap();
        assert!(stack.push(Value::Int(3)).is_err());
    }
}
