//! Fixed-size work-stealing thread pool.
//!
//! Two parallel queue arrays, both MPMC: the steal queues carry ordinary
//! jobs a submitter places on a random worker, and the no-steal queues carry
//! broadcast jobs that must run exactly once on every worker (log flushes,
//! callback drains). A worker services its own no-steal queue first, then
//! its own steal queue, then scans the other workers' steal queues; a full
//! idle scan ends in an exponential-backoff sleep.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::backoff::retry_with_exponential_backoff;

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
    static SUBMIT_RNG: std::cell::RefCell<SmallRng> =
        std::cell::RefCell::new(SmallRng::seed_from_u64(0xDEAD_BEEF));
}

/// Index of the pool worker running the current thread, if any.
pub(crate) fn current_worker_index() -> Option<usize> {
    WORKER_INDEX.with(|slot| slot.get())
}

struct PoolShared {
    accepting_stopped: AtomicBool,
    shutdown: AtomicBool,
    steal_queues: Vec<SegQueue<Job>>,
    no_steal_queues: Vec<SegQueue<Job>>,
}

impl PoolShared {
    fn is_empty(&self) -> bool {
        self.steal_queues.iter().all(|queue| queue.is_empty())
            && self.no_steal_queues.iter().all(|queue| queue.is_empty())
    }

    /// Runs at most one job. Returns false when every queue this worker may
    /// touch was empty.
    fn dequeue(&self, worker: usize) -> bool {
        if let Some(job) = self.no_steal_queues[worker].pop() {
            job();
            return true;
        }
        if let Some(job) = self.steal_queues[worker].pop() {
            job();
            return true;
        }
        let n = self.steal_queues.len();
        for offset in 1..n {
            let victim = (worker + offset) % n;
            if let Some(job) = self.steal_queues[victim].pop() {
                job();
                return true;
            }
        }
        false
    }
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        let shared = Arc::new(PoolShared {
            accepting_stopped: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            steal_queues: (0..pool_size).map(|_| SegQueue::new()).collect(),
            no_steal_queues: (0..pool_size).map(|_| SegQueue::new()).collect(),
        });

        let workers = (0..pool_size)
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("basalt-worker-{index}"))
                    .spawn(move || worker_loop(shared, index))
                    .expect("failed to spawn a pool worker")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.shared.steal_queues.len()
    }

    /// Places `job` on a randomly chosen steal queue. Returns false once
    /// the pool has stopped accepting work.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.shared.accepting_stopped.load(Ordering::Acquire) {
            return false;
        }
        let index = SUBMIT_RNG.with(|rng| rng.borrow_mut().gen_range(0..self.pool_size()));
        self.shared.steal_queues[index].push(Box::new(job));
        true
    }

    /// Enqueues `job` exactly once into every worker's no-steal queue.
    pub fn enqueue_for_all_threads(&self, job: Arc<dyn Fn() + Send + Sync + 'static>) -> bool {
        if self.shared.accepting_stopped.load(Ordering::Acquire) {
            return false;
        }
        for queue in &self.shared.no_steal_queues {
            let job = job.clone();
            queue.push(Box::new(move || job()));
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn stop_accepting_transactions(&self) {
        self.shared.accepting_stopped.store(true, Ordering::Release);
    }

    /// Blocks until every job enqueued before this call has been executed,
    /// by running a sentinel through every no-steal queue. Works during
    /// teardown, after the pool stopped accepting external work.
    pub fn wait_for_queues_to_become_empty(&self) {
        let ends = Arc::new(AtomicUsize::new(0));
        for queue in &self.shared.no_steal_queues {
            let ends = ends.clone();
            queue.push(Box::new(move || {
                ends.fetch_add(1, Ordering::Release);
            }));
        }
        let worker_count = self.pool_size();
        retry_with_exponential_backoff(|| ends.load(Ordering::Acquire) >= worker_count);
    }

    /// Second phase of shutdown: workers drain their queues and exit.
    pub fn shutdown(&self) {
        self.shared.accepting_stopped.store(true, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    WORKER_INDEX.with(|slot| slot.set(Some(index)));
    let mut sleep_ns = 100u64;
    loop {
        if shared.dequeue(index) {
            sleep_ns = 100;
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) && shared.is_empty() {
            return;
        }
        thread::sleep(Duration::from_nanos(sleep_ns));
        sleep_ns = (sleep_ns * 2).min(1 << 20);
    }
}
