//! CSP-style channel: ring buffer plus FIFO waiter queues for blocked
//! senders and receivers. All mutation happens under one mutex; wake-ups
//! are reported back to the caller as data rather than performed in place,
//! so the scheduler (which owns task state) decides how to act on them,
//! avoiding a lock-ordering cycle between channel and scheduler.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::value::{Tag, Value};

struct Waiter {
    task_id: u64,
    /// `Some` for a blocked sender carrying its payload; `None` for a
    /// blocked receiver.
    payload: Option<Value>,
}

/// A task that should be unblocked as a result of a channel operation,
/// together with what it was waiting for.
#[derive(Debug)]
pub enum WakeEvent {
    /// A blocked receiver can now proceed with this value (`closed` marks
    /// the "closed and drained" case where the value is meaningless).
    Receiver { task_id: u64, value: Value, closed: bool },
    /// A blocked sender's value has been accepted; it may proceed.
    Sender { task_id: u64 },
}

pub enum SendOutcome {
    Sent(Vec<WakeEvent>),
    Blocked,
    ChannelClosed,
}

pub enum ReceiveOutcome {
    Value(Value, Vec<WakeEvent>),
    Closed,
    Blocked,
}

pub enum TryOutcome<T> {
    Ready(T),
    NotReady,
}

struct Inner {
    buffer: VecDeque<Value>,
    capacity: usize,
    closed: bool,
    send_waiters: VecDeque<Waiter>,
    recv_waiters: VecDeque<Waiter>,
}

pub struct Channel {
    element_tag: Option<Tag>,
    inner: Mutex<Inner>,
}

impl Channel {
    pub fn new(capacity: usize, element_tag: Option<Tag>) -> Self {
        Channel {
            element_tag,
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity.max(1)),
                capacity,
                closed: false,
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
            }),
        }
    }

    fn check_type(&self, value: &Value) -> Result<(), RuntimeError> {
        if let Some(expected) = self.element_tag {
            if value.tag() != expected {
                return Err(RuntimeError::ChannelTypeMismatch {
                    expected: expected.to_string(),
                    found: value.tag().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn send(&self, task_id: u64, value: Value) -> Result<SendOutcome, RuntimeError> {
        self.check_type(&value)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(SendOutcome::ChannelClosed);
        }
        if let Some(receiver) = inner.recv_waiters.pop_front() {
            return Ok(SendOutcome::Sent(vec![WakeEvent::Receiver {
                task_id: receiver.task_id,
                value,
                closed: false,
            }]));
        }
        if inner.buffer.len() < inner.capacity {
            inner.buffer.push_back(value);
            return Ok(SendOutcome::Sent(vec![]));
        }
        inner.send_waiters.push_back(Waiter {
            task_id,
            payload: Some(value),
        });
        Ok(SendOutcome::Blocked)
    }

    pub fn receive(&self, task_id: u64) -> ReceiveOutcome {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.buffer.pop_front() {
            let mut events = Vec::new();
            if let Some(sender) = inner.send_waiters.pop_front() {
                inner.buffer.push_back(sender.payload.expect("sender waiter always carries a value"));
                events.push(WakeEvent::Sender { task_id: sender.task_id });
            }
            return ReceiveOutcome::Value(value, events);
        }
        if let Some(sender) = inner.send_waiters.pop_front() {
            let value = sender.payload.expect("sender waiter always carries a value");
            return ReceiveOutcome::Value(value, vec![WakeEvent::Sender { task_id: sender.task_id }]);
        }
        if inner.closed {
            return ReceiveOutcome::Closed;
        }
        inner.recv_waiters.push_back(Waiter { task_id, payload: None });
        ReceiveOutcome::Blocked
    }

    pub fn try_send(&self, task_id: u64, value: Value) -> Result<TryOutcome<Vec<WakeEvent>>, RuntimeError> {
        match self.send(task_id, value)? {
            SendOutcome::Sent(events) => Ok(TryOutcome::Ready(events)),
            SendOutcome::ChannelClosed => Err(RuntimeError::TypeMismatch {
                expected: "open channel".into(),
                found: "closed channel".into(),
            }),
            SendOutcome::Blocked => {
                // trySend never enqueues; undo the enqueue performed by send().
                let mut inner = self.inner.lock();
                if let Some(pos) = inner.send_waiters.iter().position(|w| w.task_id == task_id) {
                    inner.send_waiters.remove(pos);
                }
                Ok(TryOutcome::NotReady)
            }
        }
    }

    pub fn try_receive(&self, task_id: u64) -> TryOutcome<(Value, Vec<WakeEvent>, bool)> {
        match self.receive(task_id) {
            ReceiveOutcome::Value(v, events) => TryOutcome::Ready((v, events, true)),
            ReceiveOutcome::Closed => TryOutcome::Ready((Value::Null, vec![], false)),
            ReceiveOutcome::Blocked => {
                let mut inner = self.inner.lock();
                if let Some(pos) = inner.recv_waiters.iter().position(|w| w.task_id == task_id) {
                    inner.recv_waiters.remove(pos);
                }
                TryOutcome::NotReady
            }
        }
    }

    /// Idempotent. Wakes every waiting receiver with the closed marker and
    /// every waiting sender (the caller decides whether that surfaces as an
    /// error to the sending task).
    pub fn close(&self) -> Vec<WakeEvent> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return vec![];
        }
        inner.closed = true;
        let mut events: Vec<WakeEvent> = inner
            .recv_waiters
            .drain(..)
            .map(|w| WakeEvent::Receiver {
                task_id: w.task_id,
                value: Value::Null,
                closed: true,
            })
            .collect();
        events.extend(inner.send_waiters.drain(..).map(|w| WakeEvent::Sender { task_id: w.task_id }));
        events
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn enroll_recv_waiter(&self, task_id: u64) {
        self.inner.lock().recv_waiters.push_back(Waiter { task_id, payload: None });
    }

    pub fn enroll_send_waiter(&self, task_id: u64, value: Value) {
        self.inner.lock().send_waiters.push_back(Waiter {
            task_id,
            payload: Some(value),
        });
    }

    pub fn remove_waiter(&self, task_id: u64) {
        let mut inner = self.inner.lock();
        inner.recv_waiters.retain(|w| w.task_id != task_id);
        inner.send_waiters.retain(|w| w.task_id != task_id);
    }

    pub fn is_ready_to_send(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed && (inner.buffer.len() < inner.capacity || !inner.recv_waiters.is_empty())
    }

    pub fn is_ready_to_receive(&self) -> bool {
        let inner = self.inner.lock();
        inner.closed || !inner.buffer.is_empty() || !inner.send_waiters.is_empty()
    }

    /// Snapshot of currently blocked sender/receiver task ids, used only by
    /// the diagnostic deadlock detector's wait-graph construction.
    pub fn waiter_ids(&self) -> (Vec<u64>, Vec<u64>) {
        let inner = self.inner.lock();
        (
            inner.send_waiters.iter().map(|w| w.task_id).collect(),
            inner.recv_waiters.iter().map(|w| w.task_id).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbuffered_rendezvous_hands_value_directly() {
        let ch = Channel::new(0, None);
        match ch.send(1, Value::Int(42)).unwrap() {
            SendOutcome::Blocked => {}
            _ => panic!("expected sender to block on unbuffered channel with no receiver"),
        }
        match ch.receive(2) {
            ReceiveOutcome::Value(v, events) => {
                assert!(matches!(v, Value::Int(42)));
                assert!(matches!(events[0], WakeEvent::Sender { task_id: 1 }));
            }
            _ => panic!("receive should have taken the buffered sender's value"),
        }
    }

    #[test]
    fn senders_unblock_in_fifo_order() {
        let ch = Channel::new(0, None);
        assert!(matches!(ch.send(1, Value::Int(1)).unwrap(), SendOutcome::Blocked));
        assert!(matches!(ch.send(2, Value::Int(2)).unwrap(), SendOutcome::Blocked));

        let (v1, events1) = match ch.receive(10) {
            ReceiveOutcome::Value(v, e) => (v, e),
            _ => panic!(),
        };
        assert!(matches!(v1, Value::Int(1)));
        assert!(matches!(events1[0], WakeEvent::Sender { task_id: 1 }));

        let (v2, events2) = match ch.receive(11) {
            ReceiveOutcome::Value(v, e) => (v, e),
            _ => panic!(),
        };
        assert!(matches!(v2, Value::Int(2)));
        assert!(matches!(events2[0], WakeEvent::Sender { task_id: 2 }));
    }

    #[test]
    fn buffered_close_drains_then_reports_closed() {
        let ch = Channel::new(2, None);
        assert!(matches!(ch.send(1, Value::Int(1)).unwrap(), SendOutcome::Sent(_)));
        assert!(matches!(ch.send(1, Value::Int(2)).unwrap(), SendOutcome::Sent(_)));
        ch.close();

        assert!(matches!(ch.receive(2), ReceiveOutcome::Value(Value::Int(1), _)));
        assert!(matches!(ch.receive(2), ReceiveOutcome::Value(Value::Int(2), _)));
        assert!(matches!(ch.receive(2), ReceiveOutcome::Closed));
    }

    #[test]
    fn type_check_rejects_mismatched_tag() {
        let ch = Channel::new(1, Some(Tag::Int));
        assert!(ch.send(1, Value::Str(std::sync::Arc::from("x"))).is_err());
        assert!(ch.send(1, Value::Int(1)).is_ok());
    }
}
