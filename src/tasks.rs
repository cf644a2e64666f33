//! Background task runner.
//!
//! OS worker threads drain a priority queue ordered by wake time; tasks
//! cooperate by returning a snooze interval after each run. A task can be
//! pulled forward to "now" by name (the pager's scheduleNow path); its
//! own single-flight latch is responsible for coalescing.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// What a task wants after one run.
pub enum TaskControl {
    /// Run again after the given delay.
    Snooze(Duration),
    /// Never run again.
    Stop,
}

/// A cooperative background task.
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self) -> TaskControl;
}

struct Scheduled {
    at: Instant,
    seq: u64,
    task: Arc<dyn BackgroundTask>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest wake pops
        // first, ties broken by insertion order.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<Scheduled>>,
    condvar: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// A pool of worker threads servicing scheduled tasks.
pub struct TaskRunner {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskRunner {
    /// Spawns `num_threads` workers named after the pool.
    pub fn new(pool: &'static str, num_threads: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });
        let workers = (0..num_threads.max(1))
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("{pool}-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawn worker thread")
            })
            .collect();
        Self { shared, workers }
    }

    /// Schedules `task` to first run after `delay`.
    pub fn schedule(&self, task: Arc<dyn BackgroundTask>, delay: Duration) {
        let mut queue = self.shared.queue.lock();
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        queue.push(Scheduled {
            at: Instant::now() + delay,
            seq,
            task,
        });
        drop(queue);
        self.shared.condvar.notify_one();
    }

    /// Pulls the named task's earliest entry forward to now. A no-op
    /// when the task is not scheduled (it may be mid-run).
    pub fn wake_by_name(&self, name: &str) {
        let mut queue = self.shared.queue.lock();
        let mut entries: Vec<Scheduled> = std::mem::take(&mut *queue).into_vec();
        if let Some(entry) = entries
            .iter_mut()
            .filter(|e| e.task.name() == name)
            .min_by_key(|e| e.at)
        {
            entry.at = Instant::now();
        }
        *queue = entries.into();
        drop(queue);
        self.shared.condvar.notify_all();
    }

    /// Names and time-until-run of every scheduled entry, soonest first.
    pub fn scheduled_tasks(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let queue = self.shared.queue.lock();
        let mut out: Vec<(String, Duration)> = queue
            .iter()
            .map(|e| {
                (
                    e.task.name().to_owned(),
                    e.at.saturating_duration_since(now),
                )
            })
            .collect();
        out.sort_by_key(|(_, d)| *d);
        out
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let due = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                match queue.peek() {
                    None => {
                        shared.condvar.wait(&mut queue);
                    }
                    Some(next) if next.at <= Instant::now() => {
                        break queue.pop().expect("peeked");
                    }
                    Some(next) => {
                        let at = next.at;
                        shared.condvar.wait_until(&mut queue, at);
                    }
                }
            }
        };
        match due.task.run() {
            TaskControl::Snooze(delay) => {
                let mut queue = shared.queue.lock();
                let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
                queue.push(Scheduled {
                    at: Instant::now() + delay,
                    seq,
                    task: due.task,
                });
                drop(queue);
                shared.condvar.notify_one();
            }
            TaskControl::Stop => {
                debug!(task = due.task.name(), "background task stopped");
            }
        }
    }
}
