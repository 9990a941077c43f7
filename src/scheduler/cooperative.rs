//! Single OS thread running every task. No data races are possible and no
//! STW is needed; suspension points are channel operations, `select`, and a
//! configurable instruction-count time slice.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::class::{Closure, Function};
use crate::frame::CallFrame;
use crate::task::{BlockReason, SelectCase, Task, TaskStatus};
use crate::value::Value;

pub struct CooperativeScheduler {
    run_queue: VecDeque<u64>,
    tasks: HashMap<u64, Task>,
    task_pool: Vec<Task>,
    current: Option<u64>,
    next_id: u64,
    pub time_slice: u32,
    stack_size: usize,
    call_stack_size: usize,
}

impl CooperativeScheduler {
    pub fn new(time_slice: u32, stack_size: usize, call_stack_size: usize) -> Self {
        CooperativeScheduler {
            run_queue: VecDeque::new(),
            tasks: HashMap::new(),
            task_pool: Vec::new(),
            current: None,
            next_id: 1,
            time_slice,
            stack_size,
            call_stack_size,
        }
    }

    pub fn spawn(&mut self, function: Arc<Function>, closure: Option<Arc<Closure>>, args: Vec<Value>, parent_id: Option<u64>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let mut task = self
            .task_pool
            .pop()
            .unwrap_or_else(|| Task::new(id, parent_id, self.stack_size, self.call_stack_size));
        task.id = id;
        task.parent_id = parent_id;
        task.status = TaskStatus::Runnable;
        task.exception = None;
        task.block_reason = None;
        task.pending_value = None;
        task.instructions_run_in_slice = 0;

        let base = 0;
        let mut frame = CallFrame::new(function, closure, base, false);
        for (i, arg) in args.into_iter().enumerate() {
            task.operand_stack.set(base + i, arg);
        }
        frame.ip = 0;
        task.frames.push(frame);

        self.tasks.insert(id, task);
        self.run_queue.push_back(id);
        debug!(task_id = id, "spawned task");
        id
    }

    /// Pops the head of the run queue, marks it running, and returns its id.
    pub fn schedule(&mut self) -> Option<u64> {
        while let Some(id) = self.run_queue.pop_front() {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = TaskStatus::Running;
                task.instructions_run_in_slice = 0;
                self.current = Some(id);
                return Some(id);
            }
        }
        None
    }

    pub fn yield_current(&mut self) {
        if let Some(id) = self.current.take() {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = TaskStatus::Runnable;
            }
            self.run_queue.push_back(id);
        }
    }

    pub fn block(&mut self, reason: BlockReason) {
        if let Some(id) = self.current.take() {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = TaskStatus::Blocked;
                task.block_reason = Some(reason);
            }
        }
    }

    pub fn unblock(&mut self, task_id: u64, pending_value: Option<Value>) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Runnable;
            task.block_reason = None;
            task.pending_value = pending_value;
            self.run_queue.push_back(task_id);
        }
    }

    pub fn kill(&mut self, task_id: u64) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Dead;
            if let Some(reason) = task.block_reason.take() {
                match reason {
                    BlockReason::Send { channel, .. } | BlockReason::Receive { channel } => {
                        channel.remove_waiter(task_id);
                    }
                    BlockReason::Select { cases } => {
                        for case in cases {
                            match case {
                                SelectCase::Send { channel, .. } | SelectCase::Receive { channel } => {
                                    channel.remove_waiter(task_id);
                                }
                            }
                        }
                    }
                }
            }
        }
        self.run_queue.retain(|&id| id != task_id);
    }

    pub fn retire_dead(&mut self, task_id: u64) {
        if let Some(task) = self.tasks.remove(&task_id) {
            if self.task_pool.len() < 64 {
                self.task_pool.push(task);
            }
        }
    }

    /// Pools a task taken out via `take` once it has run to completion,
    /// without requiring it to still be present in the table.
    pub fn retire_taken(&mut self, task: Task) {
        if self.task_pool.len() < 64 {
            self.task_pool.push(task);
        }
    }

    /// Clears `current` without re-queueing it, for a driver that already
    /// decided the task's fate (blocked, dead, or reinserted by hand) via
    /// `take`/`put_back` rather than through `yield_current`/`block`.
    pub fn release_current(&mut self) {
        self.current = None;
    }

    pub fn task_mut(&mut self, id: u64) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Removes `id`'s `Task` from the table so a driver can run it with a
    /// plain `&mut Task` while also holding `&mut self` (e.g. to apply
    /// channel wake-ups to other tasks mid-step). Pair with `put_back`.
    pub fn take(&mut self, id: u64) -> Option<Task> {
        self.tasks.remove(&id)
    }

    /// Reinserts a task removed via `take`, without touching the run queue;
    /// the driver decides separately whether to re-queue it based on the
    /// task's status after running.
    pub fn put_back(&mut self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    pub fn tasks(&self) -> &HashMap<u64, Task> {
        &self.tasks
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.values().all(|t| t.is_terminal())
    }

    pub fn has_runnable(&self) -> bool {
        self.tasks
            .values()
            .any(|t| t.status == TaskStatus::Runnable || t.status == TaskStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;
    use crate::class::next_function_id;

    fn noop_function() -> Arc<Function> {
        Arc::new(Function {
            id: next_function_id(),
            name: "main".into(),
            param_count: 0,
            min_arity: 0,
            defaults: vec![],
            variadic: false,
            code: Some(Arc::new(Chunk::new())),
            local_slot_count: 0,
            upvalue_count: 0,
            native: None,
            owning_class: None,
        })
    }

    #[test]
    fn schedule_yields_runnable_tasks_in_fifo_order() {
        let mut sched = CooperativeScheduler::new(1000, 64, 16);
        let a = sched.spawn(noop_function(), None, vec![], None);
        let b = sched.spawn(noop_function(), None, vec![], None);

        assert_eq!(sched.schedule(), Some(a));
        sched.yield_current();
        assert_eq!(sched.schedule(), Some(b));
        sched.yield_current();
        assert_eq!(sched.schedule(), Some(a));
    }

    #[test]
    fn blocked_task_is_not_scheduled_until_unblocked() {
        let mut sched = CooperativeScheduler::new(1000, 64, 16);
        let a = sched.spawn(noop_function(), None, vec![], None);
        sched.schedule();
        let ch = Arc::new(crate::channel::Channel::new(0, None));
        sched.block(BlockReason::Receive { channel: ch });
        assert!(sched.schedule().is_none());
        sched.unblock(a, Some(Value::Int(1)));
        assert_eq!(sched.schedule(), Some(a));
    }
}
