//! Diagnostic deadlock detection: the runtime is deadlocked if there are
//! non-dead tasks but none runnable. A wait graph is built — a task waiting
//! to receive on a channel waits on every task currently enrolled to send on
//! it (and the unbuffered-channel case is symmetric for senders) — and DFS
//! over that graph finds a cycle.

use std::collections::HashMap;

use petgraph::graphmap::DiGraphMap;

use crate::channel::Channel;
use crate::task::{BlockReason, SelectCase, Task, TaskStatus};

/// Returns `Some(cycle)` (a list of task ids forming the cycle) if the task
/// set is deadlocked.
pub fn detect(tasks: &HashMap<u64, Task>) -> Option<Vec<u64>> {
    let any_runnable = tasks.values().any(|t| t.status == TaskStatus::Runnable || t.status == TaskStatus::Running);
    let any_blocked = tasks.values().any(|t| t.status == TaskStatus::Blocked || t.status == TaskStatus::Waiting);
    if any_runnable || !any_blocked {
        return None;
    }

    let mut graph: DiGraphMap<u64, ()> = DiGraphMap::new();
    for task in tasks.values() {
        graph.add_node(task.id);
    }
    for task in tasks.values() {
        let channels: Vec<(&std::sync::Arc<Channel>, bool)> = match &task.block_reason {
            Some(BlockReason::Send { channel, .. }) => vec![(channel, true)],
            Some(BlockReason::Receive { channel }) => vec![(channel, false)],
            Some(BlockReason::Select { cases }) => cases
                .iter()
                .map(|c| match c {
                    SelectCase::Send { channel, .. } => (channel, true),
                    SelectCase::Receive { channel } => (channel, false),
                })
                .collect(),
            None => vec![],
        };
        for (channel, is_sender) in channels {
            let (senders, receivers) = channel.waiter_ids();
            let counterparties = if is_sender { &receivers } else { &senders };
            for &other in counterparties {
                if other != task.id && tasks.contains_key(&other) {
                    graph.add_edge(task.id, other, ());
                }
            }
        }
    }

    find_cycle(&graph)
}

fn find_cycle(graph: &DiGraphMap<u64, ()>) -> Option<Vec<u64>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let mut color: HashMap<u64, Color> = graph.nodes().map(|n| (n, Color::White)).collect();
    let mut stack_path: Vec<u64> = Vec::new();

    fn visit(
        node: u64,
        graph: &DiGraphMap<u64, ()>,
        color: &mut HashMap<u64, Color>,
        path: &mut Vec<u64>,
    ) -> Option<Vec<u64>> {
        color.insert(node, Color::Gray);
        path.push(node);
        for (_, neighbor, _) in graph.edges(node) {
            match color.get(&neighbor).copied().unwrap_or(Color::White) {
                Color::White => {
                    if let Some(cycle) = visit(neighbor, graph, color, path) {
                        return Some(cycle);
                    }
                }
                Color::Gray => {
                    let start = path.iter().position(|&n| n == neighbor).unwrap();
                    return Some(path[start..].to_vec());
                }
                Color::Black => {}
            }
        }
        path.pop();
        color.insert(node, Color::Black);
        None
    }

    for node in graph.nodes() {
        if color.get(&node).copied() == Some(Color::White) {
            if let Some(cycle) = visit(node, graph, &mut color, &mut stack_path) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::sync::Arc;

    #[test]
    fn two_tasks_waiting_on_each_others_unbuffered_send_is_a_deadlock() {
        let ch_a = Arc::new(Channel::new(0, None));
        let ch_b = Arc::new(Channel::new(0, None));

        let mut t1 = Task::new(1, None, 64, 16);
        t1.status = TaskStatus::Blocked;
        t1.block_reason = Some(BlockReason::Receive { channel: ch_a.clone() });

        let mut t2 = Task::new(2, None, 64, 16);
        t2.status = TaskStatus::Blocked;
        t2.block_reason = Some(BlockReason::Receive { channel: ch_b.clone() });

        ch_a.enroll_send_waiter(2, crate::value::Value::Int(1));
        ch_b.enroll_send_waiter(1, crate::value::Value::Int(1));

        let mut tasks = HashMap::new();
        tasks.insert(1, t1);
        tasks.insert(2, t2);

        let cycle = detect(&tasks);
        assert!(cycle.is_some());
    }

    #[test]
    fn no_deadlock_when_a_task_is_runnable() {
        let mut t1 = Task::new(1, None, 64, 16);
        t1.status = TaskStatus::Runnable;
        let mut tasks = HashMap::new();
        tasks.insert(1, t1);
        assert!(detect(&tasks).is_none());
    }
}
