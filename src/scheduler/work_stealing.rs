//! N OS threads, each with a private execution context, a Chase-Lev-style
//! lock-free deque (crossbeam's `Worker`/`Stealer`), and a shared bounded
//! global queue for overflow and externally submitted tasks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use rand::Rng;
use tracing::{debug, warn};

use crate::error::SchedulerError;

const DEFAULT_GLOBAL_CAPACITY: usize = 4096;

/// The global overflow queue, bounded by an explicit counter since
/// `crossbeam::deque::Injector` itself has no capacity limit.
pub struct GlobalQueue {
    injector: Injector<u64>,
    len: AtomicUsize,
    capacity: usize,
}

impl GlobalQueue {
    pub fn new(capacity: usize) -> Self {
        GlobalQueue {
            injector: Injector::new(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn try_push(&self, task_id: u64) -> bool {
        if self.len.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        self.injector.push(task_id);
        true
    }

    pub fn steal_into<'a>(&self, dest: &Worker<u64>) -> Steal<u64> {
        let result = self.injector.steal_batch_and_pop(dest);
        if matches!(result, Steal::Success(_)) {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }
}

/// Per-worker handles: the local deque end the owner pushes/pops from, and
/// the stealer end other workers steal from.
pub struct WorkerHandle {
    pub id: usize,
    pub local: Worker<u64>,
}

/// Stop-the-world coordination shared by every worker and the collector.
pub struct StwController {
    flag: AtomicBool,
    parked: AtomicUsize,
    total_workers: usize,
    lock: Mutex<()>,
    condvar: Condvar,
    pub stats: Mutex<StwStats>,
}

#[derive(Debug, Clone, Default)]
pub struct StwStats {
    pub count: u64,
    pub total_us: u64,
    pub last_us: u64,
    pub max_us: u64,
}

impl StwStats {
    pub fn average_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_us as f64 / self.count as f64
        }
    }

    fn record(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.count += 1;
        self.total_us += us;
        self.last_us = us;
        self.max_us = self.max_us.max(us);
    }
}

impl StwController {
    pub fn new(total_workers: usize) -> Self {
        StwController {
            flag: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
            total_workers,
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            stats: Mutex::new(StwStats::default()),
        }
    }

    /// Called by a worker at a safepoint (function boundary, loop back-edge,
    /// allocation). Parks until the flag clears if it is currently set.
    pub fn poll_safepoint(&self) {
        if !self.flag.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.lock.lock().unwrap();
        self.parked.fetch_add(1, Ordering::AcqRel);
        self.condvar.notify_all();
        while self.flag.load(Ordering::Acquire) {
            guard = self.condvar.wait(guard).unwrap();
        }
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }

    /// Requests STW, waits up to `timeout` for every worker to park, runs
    /// `during_stw`, then clears the flag and wakes everyone.
    pub fn with_stop_the_world<R>(
        &self,
        timeout: Duration,
        during_stw: impl FnOnce() -> R,
    ) -> Result<R, SchedulerError> {
        let start = Instant::now();
        self.flag.store(true, Ordering::Release);

        let guard = self.lock.lock().unwrap();
        let _ = self
            .condvar
            .wait_timeout_while(guard, timeout, |_| {
                self.parked.load(Ordering::Acquire) < self.total_workers
            })
            .unwrap();

        let parked = self.parked.load(Ordering::Acquire);
        if parked < self.total_workers {
            warn!(parked, total = self.total_workers, "STW wait timed out; proceeding conservatively");
        }

        let result = during_stw();

        self.flag.store(false, Ordering::Release);
        self.condvar.notify_all();

        self.stats.lock().unwrap().record(start.elapsed());

        if parked < self.total_workers {
            return Err(SchedulerError::StwTimeout {
                waited_ms: start.elapsed().as_millis() as u64,
                parked,
                total: self.total_workers,
            });
        }
        Ok(result)
    }
}

/// Owns the global queue, every worker's stealer handle, and the STW
/// controller. Workers are handed their `WorkerHandle` + the shared parts at
/// spawn time by the caller that drives actual task execution.
pub struct WorkStealingScheduler {
    pub global: Arc<GlobalQueue>,
    pub stealers: Vec<Stealer<u64>>,
    pub stw: Arc<StwController>,
    worker_count: usize,
}

impl WorkStealingScheduler {
    pub fn new(worker_count: usize) -> (Self, Vec<WorkerHandle>) {
        let worker_count = worker_count.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        let mut stealers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let local = Worker::new_fifo();
            stealers.push(local.stealer());
            handles.push(WorkerHandle { id, local });
        }
        let scheduler = WorkStealingScheduler {
            global: Arc::new(GlobalQueue::new(DEFAULT_GLOBAL_CAPACITY)),
            stealers,
            stw: Arc::new(StwController::new(worker_count)),
            worker_count,
        };
        (scheduler, handles)
    }

    /// Submit policy: try the global queue; if it's at capacity, push to the
    /// locally least-loaded worker (approximated here as a random worker,
    /// since deque length isn't observable without popping).
    pub fn submit(&self, task_id: u64, handles: &[WorkerHandle]) {
        if self.global.try_push(task_id) {
            return;
        }
        let idx = rand::thread_rng().gen_range(0..handles.len());
        handles[idx].local.push(task_id);
        debug!(task_id, worker = idx, "global queue full, routed to worker");
    }

    /// Finds work for `worker`: local pop, then global pop, then a
    /// random-start sweep stealing one task from another worker's deque tail.
    pub fn find_work(&self, worker: &WorkerHandle) -> Option<u64> {
        if let Some(task) = worker.local.pop() {
            return Some(task);
        }
        if let Steal::Success(task) = self.global.steal_into(&worker.local) {
            return Some(task);
        }
        let n = self.stealers.len();
        if n <= 1 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..n);
        for offset in 0..n {
            let idx = (start + offset) % n;
            if idx == worker.id {
                continue;
            }
            if let Steal::Success(task) = self.stealers[idx].steal() {
                return Some(task);
            }
        }
        None
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_queue_respects_capacity() {
        let q = GlobalQueue::new(2);
        assert!(q.try_push(1));
        assert!(q.try_push(2));
        assert!(!q.try_push(3));
    }

    #[test]
    fn find_work_steals_from_another_worker() {
        let (scheduler, handles) = WorkStealingScheduler::new(2);
        handles[1].local.push(99);
        let found = scheduler.find_work(&handles[0]);
        assert_eq!(found, Some(99));
    }

    #[test]
    fn stw_round_trip_without_parked_workers_times_out_but_still_runs() {
        let (scheduler, _handles) = WorkStealingScheduler::new(2);
        let result = scheduler.stw.with_stop_the_world(Duration::from_millis(5), || 42);
        assert!(result.is_err());
    }
}
