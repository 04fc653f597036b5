//! Epoch framework: a monotonically increasing number shared by all threads.
//!
//! The global epoch advances only when every online thread has caught up to
//! it, so "epoch `e` is two behind the global" implies no thread still
//! operates inside `e`. That property drives group commit, phantom-avoidance
//! draining, and safe memory reclamation throughout the engine.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::tls::ThreadKeyStorage;
use crate::types::{EpochNumber, THREAD_OFFLINE};

/// Per-thread epoch slot. Defaults to offline.
pub struct ThreadEpoch(AtomicU32);

impl Default for ThreadEpoch {
    fn default() -> Self {
        Self(AtomicU32::new(THREAD_OFFLINE))
    }
}

struct EpochShared {
    started: AtomicBool,
    stopped: AtomicBool,
    global_epoch: AtomicU32,
    tls: ThreadKeyStorage<ThreadEpoch>,
}

impl EpochShared {
    fn smallest_epoch(&self) -> EpochNumber {
        let mut min_epoch = THREAD_OFFLINE;
        self.tls.for_each(|node| {
            let e = node.0.load(Ordering::Acquire);
            if 0 < e && e < min_epoch {
                min_epoch = e;
            }
        });
        min_epoch
    }
}

pub struct EpochFramework {
    shared: Arc<EpochShared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl EpochFramework {
    pub fn new(epoch_duration_ms: u64) -> Self {
        Self::with_on_advance(epoch_duration_ms, |_| {})
    }

    /// `on_advance` runs synchronously on the epoch-writer thread after each
    /// successful bump, receiving the epoch that just closed.
    pub fn with_on_advance(
        epoch_duration_ms: u64,
        on_advance: impl Fn(EpochNumber) + Send + 'static,
    ) -> Self {
        let shared = Arc::new(EpochShared {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            global_epoch: AtomicU32::new(1),
            tls: ThreadKeyStorage::new(),
        });

        let writer_shared = shared.clone();
        let writer = thread::Builder::new()
            .name("basalt-epoch".to_string())
            .spawn(move || epoch_writer_job(writer_shared, epoch_duration_ms, on_advance))
            .expect("failed to spawn the epoch-writer thread");

        Self {
            shared,
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn global_epoch(&self) -> EpochNumber {
        self.shared.global_epoch.load(Ordering::Acquire)
    }

    pub fn set_global_epoch(&self, epoch: EpochNumber) {
        self.shared.global_epoch.store(epoch, Ordering::Release);
    }

    pub fn my_thread_local_epoch(&self) -> EpochNumber {
        self.shared.tls.get().0.load(Ordering::Acquire)
    }

    pub fn set_my_thread_local_epoch(&self, epoch: EpochNumber) {
        self.shared.tls.get().0.store(epoch, Ordering::Release);
    }

    pub fn make_me_online(&self) {
        let node = self.shared.tls.get();
        debug_assert_eq!(node.0.load(Ordering::Relaxed), THREAD_OFFLINE);
        node.0.store(self.global_epoch(), Ordering::Release);
    }

    pub fn make_me_offline(&self) {
        let node = self.shared.tls.get();
        debug_assert_ne!(node.0.load(Ordering::Relaxed), THREAD_OFFLINE);
        node.0.store(THREAD_OFFLINE, Ordering::Release);
    }

    /// Minimum epoch over all online threads, or `THREAD_OFFLINE` when no
    /// thread is online.
    pub fn smallest_epoch(&self) -> EpochNumber {
        self.shared.smallest_epoch()
    }

    /// Waits until two global-epoch transitions have occurred since entry.
    ///
    /// Every online thread belongs to either the epoch current at the time of
    /// the call or the one before it, so after two transitions all of them
    /// have moved on (or gone offline). Must be called from an offline
    /// thread. Returns early once the framework is stopped so that
    /// background maintenance threads can shut down.
    pub fn sync(&self) -> EpochNumber {
        debug_assert_eq!(self.my_thread_local_epoch(), THREAD_OFFLINE);
        let mut reload_epoch = self.global_epoch();
        for _ in 0..2 {
            let current_epoch = reload_epoch;
            while current_epoch == reload_epoch {
                if self.shared.stopped.load(Ordering::Acquire) {
                    return reload_epoch;
                }
                thread::yield_now();
                reload_epoch = self.global_epoch();
            }
        }
        reload_epoch
    }

    /// Lets the writer thread begin advancing epochs.
    pub fn start(&self) {
        self.shared.started.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stops and joins the writer thread. Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.started.store(true, Ordering::Release);
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.join();
        }
    }
}

impl Drop for EpochFramework {
    fn drop(&mut self) {
        self.stop();
    }
}

fn epoch_writer_job(
    shared: Arc<EpochShared>,
    epoch_duration_ms: u64,
    on_advance: impl Fn(EpochNumber),
) {
    while !shared.started.load(Ordering::Acquire) {
        thread::yield_now();
    }

    loop {
        thread::sleep(Duration::from_millis(epoch_duration_ms));
        let min_epoch = shared.smallest_epoch();
        let old_epoch = shared.global_epoch.load(Ordering::Acquire);
        if min_epoch == THREAD_OFFLINE || min_epoch == old_epoch {
            let closed = shared.global_epoch.fetch_add(1, Ordering::AcqRel);
            on_advance(closed);
        }
        // Keep bumping after a stop request until every thread has drained;
        // sync() callers depend on the epoch still moving during teardown.
        if shared.stopped.load(Ordering::Acquire) && shared.smallest_epoch() == THREAD_OFFLINE {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn online_threads_pin_the_global_epoch() {
        let epochs = EpochFramework::new(1);
        epochs.start();
        epochs.make_me_online();
        let pinned = epochs.my_thread_local_epoch();

        // The writer cannot advance past an online thread that lags behind.
        thread::sleep(Duration::from_millis(20));
        assert!(epochs.global_epoch() <= pinned + 1);

        epochs.make_me_offline();
        thread::sleep(Duration::from_millis(20));
        assert!(epochs.global_epoch() > pinned);
        epochs.stop();
    }

    #[test]
    fn sync_waits_for_two_transitions() {
        let epochs = EpochFramework::new(1);
        epochs.start();
        let before = epochs.global_epoch();
        let after = epochs.sync();
        assert!(after >= before + 2);
        epochs.stop();
    }

    #[test]
    fn on_advance_runs_per_bump() {
        let advances = Arc::new(AtomicUsize::new(0));
        let counter = advances.clone();
        let epochs = EpochFramework::with_on_advance(1, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        epochs.start();
        thread::sleep(Duration::from_millis(30));
        epochs.stop();
        assert!(advances.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn smallest_epoch_ignores_offline_threads() {
        let epochs = EpochFramework::new(10);
        assert_eq!(epochs.smallest_epoch(), THREAD_OFFLINE);
        epochs.make_me_online();
        assert_eq!(epochs.smallest_epoch(), epochs.my_thread_local_epoch());
        epochs.make_me_offline();
        assert_eq!(epochs.smallest_epoch(), THREAD_OFFLINE);
        epochs.stop();
    }
}
