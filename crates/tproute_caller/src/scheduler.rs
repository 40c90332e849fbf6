//! Delayed-task executor for deferred work (topology-change discovery).
//!
//! One named worker thread drains a deadline-ordered heap. The heap is
//! bounded: `schedule` refuses new work once `capacity` tasks are pending,
//! which is how callers learn the executor is saturated.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use tproute_common::crash_domain::catch_task;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("scheduler saturated ({capacity} tasks pending)")]
    Saturated { capacity: usize },
    #[error("scheduler is shut down")]
    ShutDown,
}

/// Runs a task once after a delay.
pub trait DelayedExecutor: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> Result<(), ScheduleError>;
}

struct Scheduled {
    due: Instant,
    seq: u64,
    task: Task,
}

// Reversed so the max-heap pops the earliest deadline, FIFO among equals.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

struct SchedulerShared {
    queue: Mutex<BinaryHeap<Scheduled>>,
    cond: Condvar,
    capacity: usize,
    stopped: AtomicBool,
    next_seq: AtomicU64,
    executed: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending: usize,
    pub executed: u64,
    pub rejected: u64,
}

pub struct DelayScheduler {
    shared: Arc<SchedulerShared>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DelayScheduler {
    /// Start the worker thread.
    ///
    /// Returns `Err` if the thread cannot be spawned.
    pub fn start(name: &str, capacity: usize) -> Result<Arc<Self>, std::io::Error> {
        let shared = Arc::new(SchedulerShared {
            queue: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            capacity,
            stopped: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });
        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::info!(capacity = worker.capacity, "delay scheduler started");
                Self::run(&worker);
                tracing::info!("delay scheduler stopped");
            })
            .map_err(|e| {
                tracing::error!(component = "delay-scheduler", error = %e, "failed to spawn scheduler thread");
                e
            })?;
        Ok(Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }))
    }

    fn run(shared: &SchedulerShared) {
        let mut queue = shared.queue.lock();
        loop {
            if shared.stopped.load(Ordering::Acquire) {
                let dropped = queue.len();
                if dropped > 0 {
                    tracing::warn!(dropped = dropped, "scheduler stopped with pending tasks");
                }
                queue.clear();
                return;
            }
            let next_due = queue.peek().map(|s| s.due);
            match next_due {
                None => shared.cond.wait(&mut queue),
                Some(due) if due <= Instant::now() => {
                    let next = queue.pop();
                    if let Some(scheduled) = next {
                        drop(queue);
                        let _ = catch_task("scheduled_task", "delay-scheduler", scheduled.task);
                        shared.executed.fetch_add(1, Ordering::Relaxed);
                        queue = shared.queue.lock();
                    }
                }
                Some(due) => {
                    let _ = shared.cond.wait_until(&mut queue, due);
                }
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pending: self.shared.queue.lock().len(),
            executed: self.shared.executed.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker and wait for it. Pending tasks are discarded.
    pub fn shutdown(&self) {
        {
            let _queue = self.shared.queue.lock();
            self.shared.stopped.store(true, Ordering::Release);
            self.shared.cond.notify_all();
        }
        let handle = self.handle.lock().take();
        if let Some(h) = handle {
            if h.thread().id() != std::thread::current().id() {
                let _ = h.join();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl DelayedExecutor for DelayScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<(), ScheduleError> {
        let mut queue = self.shared.queue.lock();
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(ScheduleError::ShutDown);
        }
        if queue.len() >= self.shared.capacity {
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ScheduleError::Saturated {
                capacity: self.shared.capacity,
            });
        }
        queue.push(Scheduled {
            due: Instant::now() + delay,
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            task,
        });
        self.shared.cond.notify_one();
        Ok(())
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_runs_in_deadline_order() {
        let scheduler = DelayScheduler::start("test-sched", 16).unwrap();
        let (tx, rx) = mpsc::channel();
        let late = tx.clone();
        scheduler
            .schedule(Duration::from_millis(60), Box::new(move || late.send("late").unwrap()))
            .unwrap();
        scheduler
            .schedule(Duration::from_millis(5), Box::new(move || tx.send("early").unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
        scheduler.shutdown();
        assert_eq!(scheduler.stats().executed, 2);
    }

    #[test]
    fn test_saturated_rejects() {
        let scheduler = DelayScheduler::start("test-sched", 2).unwrap();
        for _ in 0..2 {
            scheduler
                .schedule(Duration::from_secs(60), Box::new(|| {}))
                .unwrap();
        }
        let err = scheduler
            .schedule(Duration::from_secs(60), Box::new(|| {}))
            .unwrap_err();
        assert_eq!(err, ScheduleError::Saturated { capacity: 2 });
        assert_eq!(scheduler.stats().rejected, 1);
        assert_eq!(scheduler.stats().pending, 2);
    }

    #[test]
    fn test_shutdown_rejects_and_stops_thread() {
        let scheduler = DelayScheduler::start("test-sched", 4).unwrap();
        assert!(scheduler.is_running());
        scheduler.shutdown();
        assert!(!scheduler.is_running());
        let err = scheduler.schedule(Duration::ZERO, Box::new(|| {})).unwrap_err();
        assert_eq!(err, ScheduleError::ShutDown);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let scheduler = DelayScheduler::start("test-sched", 4).unwrap();
        scheduler
            .schedule(Duration::ZERO, Box::new(|| panic!("task blew up")))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        scheduler
            .schedule(Duration::from_millis(1), Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
