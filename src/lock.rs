//! Word-sized lock primitives.
//!
//! Neither lock is starvation-free. That is acceptable here: the pessimistic
//! protocol tolerates aborting a transaction that fails to acquire a lock
//! within its retry budget, and the optimistic protocols hold these locks
//! only for the short commit window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

const UNLOCKED: u64 = 0;
const EXCLUSIVE: u64 = 1;
// Reader count lives above the exclusive bit.
const READER: u64 = 2;
const READERS_FULL: u64 = !1;

/// Test-then-test-and-set exclusive spinlock on a single 64-bit word.
pub struct TtasLock {
    lock_bit: AtomicU64,
}

impl TtasLock {
    pub const fn new() -> Self {
        Self {
            lock_bit: AtomicU64::new(UNLOCKED),
        }
    }

    pub fn try_lock(&self) -> bool {
        if self.lock_bit.load(Ordering::Relaxed) == EXCLUSIVE {
            return false;
        }
        self.lock_bit
            .compare_exchange_weak(UNLOCKED, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            thread::yield_now();
        }
    }

    /// Contended variant that sleeps with doubling backoff instead of
    /// yielding.
    #[allow(dead_code)]
    pub fn lock_backoff(&self) {
        let mut sleep_ns = 100u64;
        while !self.try_lock() {
            thread::sleep(Duration::from_nanos(sleep_ns));
            sleep_ns = (sleep_ns * 2).min(1 << 20);
        }
    }

    pub fn unlock(&self) {
        debug_assert_eq!(self.lock_bit.load(Ordering::Relaxed), EXCLUSIVE);
        self.lock_bit.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for TtasLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock mode requested from [`RwLockWord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwLockMode {
    Shared,
    Exclusive,
    /// Promote a shared lock held by the caller to exclusive. Succeeds only
    /// while the caller is the sole reader.
    Upgrade,
}

/// Reader/writer lock in one 64-bit word: `0` unlocked, `1` exclusively
/// locked, reader count shifted above the exclusive bit.
///
/// Unlike the guard-based locks of the standard library, acquisition and
/// release are separate calls: transaction protocols hold these locks across
/// arbitrarily many method boundaries.
pub struct RwLockWord {
    lock_bit: AtomicU64,
}

impl RwLockWord {
    pub const fn new() -> Self {
        Self {
            lock_bit: AtomicU64::new(UNLOCKED),
        }
    }

    pub fn try_lock(&self, mode: RwLockMode) -> bool {
        match mode {
            RwLockMode::Shared => {
                let current = self.lock_bit.load(Ordering::Relaxed);
                if current == EXCLUSIVE || current >= READERS_FULL {
                    return false;
                }
                self.lock_bit
                    .compare_exchange_weak(
                        current,
                        current + READER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            }
            RwLockMode::Exclusive => {
                if self.lock_bit.load(Ordering::Relaxed) != UNLOCKED {
                    return false;
                }
                self.lock_bit
                    .compare_exchange_weak(
                        UNLOCKED,
                        EXCLUSIVE,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            }
            RwLockMode::Upgrade => {
                let current = self.lock_bit.load(Ordering::Relaxed);
                debug_assert!(current >= READER, "upgrade requested without a reader");
                if current != READER {
                    // Someone else is still reading.
                    return false;
                }
                self.lock_bit
                    .compare_exchange_weak(READER, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            }
        }
    }

    pub fn lock(&self, mode: RwLockMode) {
        while !self.try_lock(mode) {
            thread::yield_now();
        }
    }

    /// Contended variant with doubling sleeps instead of yields.
    pub fn lock_backoff(&self, mode: RwLockMode) {
        let mut sleep_ns = 100u64;
        while !self.try_lock(mode) {
            thread::sleep(Duration::from_nanos(sleep_ns));
            sleep_ns = (sleep_ns * 2).min(1 << 20);
        }
    }

    pub fn unlock(&self) {
        let current = self.lock_bit.load(Ordering::Relaxed);
        debug_assert_ne!(current, UNLOCKED);
        if current == EXCLUSIVE {
            self.lock_bit.store(UNLOCKED, Ordering::Release);
            return;
        }
        loop {
            let current = self.lock_bit.load(Ordering::Relaxed);
            debug_assert!(current >= READER);
            if self
                .lock_bit
                .compare_exchange_weak(
                    current,
                    current - READER,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }
}

impl Default for RwLockWord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ttas_lock_is_mutually_exclusive() {
        let lock = TtasLock::new();
        lock.lock();
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn rw_lock_allows_concurrent_readers() {
        let lock = RwLockWord::new();
        assert!(lock.try_lock(RwLockMode::Shared));
        assert!(lock.try_lock(RwLockMode::Shared));
        assert!(!lock.try_lock(RwLockMode::Exclusive));
        lock.unlock();
        lock.unlock();
        assert!(lock.try_lock(RwLockMode::Exclusive));
        lock.unlock();
    }

    #[test]
    fn rw_lock_excludes_readers_while_exclusive() {
        let lock = RwLockWord::new();
        lock.lock(RwLockMode::Exclusive);
        assert!(!lock.try_lock(RwLockMode::Shared));
        lock.unlock();
    }

    #[test]
    fn upgrade_succeeds_only_for_the_sole_reader() {
        let lock = RwLockWord::new();
        lock.lock(RwLockMode::Shared);
        assert!(lock.try_lock(RwLockMode::Upgrade));
        // Now exclusive.
        assert!(!lock.try_lock(RwLockMode::Shared));
        lock.unlock();

        lock.lock(RwLockMode::Shared);
        lock.lock(RwLockMode::Shared);
        assert!(!lock.try_lock(RwLockMode::Upgrade));
        lock.unlock();
        lock.unlock();
    }

    #[test]
    fn contended_increments_stay_consistent() {
        let lock = Arc::new(TtasLock::new());
        let counter = Arc::new(std::cell::UnsafeCell::new(0u64));
        struct Shared(Arc<std::cell::UnsafeCell<u64>>);
        unsafe impl Send for Shared {}

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let shared = Shared(counter.clone());
            handles.push(std::thread::spawn(move || {
                let shared = shared;
                for _ in 0..1000 {
                    lock.lock();
                    unsafe { *shared.0.get() += 1 };
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { *counter.get() }, 4000);
    }
}
