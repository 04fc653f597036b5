//! Commit-callback engine, gated by epoch durability.
//!
//! A committed transaction's callback is queued with the epoch it committed
//! in and fires only once that epoch is safe: below the durable epoch when
//! logging is on, below the closed epoch otherwise. Callbacks enqueued by
//! pool workers stay on the worker's own slot; callbacks from host threads
//! (the handler API) are "entrusted" to a shared work-stealing queue any
//! worker may drain.

use std::collections::VecDeque;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::thread_pool::current_worker_index;
use crate::types::{EpochNumber, TxStatus};

pub(crate) type CommitCallback = Box<dyn FnOnce(TxStatus) + Send + 'static>;

struct CallbackSlot {
    queue: Mutex<VecDeque<(EpochNumber, CommitCallback)>>,
}

pub(crate) struct CallbackManager {
    slots: Vec<CallbackSlot>,
    entrusted: SegQueue<(EpochNumber, CommitCallback)>,
}

impl CallbackManager {
    pub fn new(worker_count: usize) -> Self {
        Self {
            slots: (0..worker_count)
                .map(|_| CallbackSlot {
                    queue: Mutex::new(VecDeque::new()),
                })
                .collect(),
            entrusted: SegQueue::new(),
        }
    }

    /// Queues `callback` to fire with `Committed` once `epoch` is safe.
    /// `entrusting` hands the callback to whichever worker drains it first.
    pub fn enqueue(&self, callback: CommitCallback, epoch: EpochNumber, entrusting: bool) {
        match current_worker_index() {
            Some(worker) if !entrusting => {
                self.slots[worker].queue.lock().push_back((epoch, callback));
            }
            _ => self.entrusted.push((epoch, callback)),
        }
    }

    /// Fires every queued callback whose epoch precedes `safe_epoch`.
    /// Runs on a worker for its own slot; any caller helps with the
    /// entrusted queue.
    pub fn execute_callbacks(&self, safe_epoch: EpochNumber) {
        if let Some(worker) = current_worker_index() {
            loop {
                let mut queue = self.slots[worker].queue.lock();
                let ready = matches!(queue.front(), Some((epoch, _)) if *epoch < safe_epoch);
                if !ready {
                    break;
                }
                let (_, callback) = queue.pop_front().expect("front observed above");
                // Do not hold the slot lock across user code.
                drop(queue);
                callback(TxStatus::Committed);
            }
        }

        while let Some((epoch, callback)) = self.entrusted.pop() {
            if epoch < safe_epoch {
                callback(TxStatus::Committed);
            } else {
                // Not safe yet; put it back and let a later pass retry.
                self.entrusted.push((epoch, callback));
                break;
            }
        }
    }

    /// Spins until every per-worker queue and the entrusted queue are
    /// empty. The epoch writer keeps broadcasting drain jobs, so progress
    /// is guaranteed as long as epochs advance.
    pub fn wait_for_all_callbacks_to_be_executed(&self) {
        for slot in &self.slots {
            while !slot.queue.lock().is_empty() {
                std::thread::yield_now();
            }
        }
        while !self.entrusted.is_empty() {
            std::thread::yield_now();
        }
    }
}
