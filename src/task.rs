//! A lightweight scheduled unit of execution: its own operand stack and
//! call-frame array, continuation-like rather than a language-level
//! coroutine — suspension points are discrete opcodes that hand control to
//! the scheduler, not stack switches.

use std::sync::Arc;

use crate::channel::Channel;
use crate::frame::{CallFrame, OperandStack};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Runnable,
    Running,
    Blocked,
    Waiting,
    Dead,
}

/// What a blocked task is waiting on. `Select` enrolls across every listed
/// channel and is resolved by whichever becomes ready first.
pub enum BlockReason {
    Send { channel: Arc<Channel>, value: Value },
    Receive { channel: Arc<Channel> },
    Select { cases: Vec<SelectCase> },
}

pub enum SelectCase {
    Send { channel: Arc<Channel>, value: Value },
    Receive { channel: Arc<Channel> },
}

pub struct Task {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub status: TaskStatus,
    pub operand_stack: OperandStack,
    pub frames: Vec<CallFrame>,
    pub exception: Option<Value>,
    pub block_reason: Option<BlockReason>,
    /// Set by the scheduler glue when a blocked receive/select-receive
    /// resolves, so the interpreter can push it once the task resumes.
    pub pending_value: Option<Value>,
    pub instructions_run_in_slice: u32,
}

impl Task {
    pub fn new(id: u64, parent_id: Option<u64>, stack_size: usize, call_stack_size: usize) -> Self {
        Task {
            id,
            parent_id,
            status: TaskStatus::Runnable,
            operand_stack: OperandStack::new(stack_size),
            frames: Vec::with_capacity(call_stack_size.min(64)),
            exception: None,
            block_reason: None,
            pending_value: None,
            instructions_run_in_slice: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == TaskStatus::Dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_runnable_with_empty_frames() {
        let task = Task::new(1, None, 256, 64);
        assert_eq!(task.status, TaskStatus::Runnable);
        assert!(task.frames.is_empty());
        assert!(!task.is_terminal());
    }
}
