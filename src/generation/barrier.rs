use crate::error::{Result, StrataError};
use crate::logger::{log, LogSeverity};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

thread_local! {
    static IS_WORKER: Cell<bool> = Cell::new(false);
}

/// Marks the calling thread as a scheduler worker. Workers never request a pause.
pub fn mark_worker_thread() {
    IS_WORKER.with(|flag| flag.set(true));
}

pub fn is_worker_thread() -> bool {
    IS_WORKER.with(|flag| flag.get())
}

/// Stops all scheduler threads at a safe point.
///
/// The counter is 0 while running. A requester moves it to 1, every worker
/// that reaches [`checkpoint`](PauseBarrier::checkpoint) adds one and parks,
/// and the pause holds once the counter equals `1 + thread_count`.
#[derive(Debug, Default)]
pub struct PauseBarrier {
    counter: AtomicI32,
    thread_count: AtomicUsize,
    /// Bumped on every resume so a parked worker wakes for its own pause only
    epoch: AtomicU64,
    lock: Mutex<()>,
    resumed: Condvar,
}

impl PauseBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_thread_count(&self, count: usize) {
        self.thread_count.store(count, Ordering::Release);
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.counter.load(Ordering::Acquire) != 0
    }

    /// Blocks until every worker is parked. Fails with `PauseTimeout` if that
    /// does not happen within `timeout`, leaving the workers running.
    pub fn request_pause(&self, timeout: Duration) -> Result<PauseGuard<'_>> {
        if is_worker_thread() {
            log(
                "Worker thread tried to pause the scheduler".to_string(),
                LogSeverity::Warning,
            );
            return Err(StrataError::PauseTimeout);
        }
        let deadline = Instant::now() + timeout;

        while self
            .counter
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if Instant::now() >= deadline {
                return Err(StrataError::PauseTimeout);
            }
            thread::yield_now();
        }

        let target = 1 + self.thread_count() as i32;
        while self.counter.load(Ordering::Acquire) < target {
            if Instant::now() >= deadline {
                self.resume();
                return Err(StrataError::PauseTimeout);
            }
            thread::yield_now();
        }
        Ok(PauseGuard { barrier: self })
    }

    fn resume(&self) {
        let _lock = self.lock.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.counter.store(0, Ordering::Release);
        self.resumed.notify_all();
    }

    /// Called by workers between units of work. Parks the thread while a
    /// pause is in effect; returns whether it parked.
    pub fn checkpoint(&self) -> bool {
        let mut guard = self.lock.lock();
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut current = self.counter.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        while self.epoch.load(Ordering::Acquire) == epoch {
            self.resumed.wait(&mut guard);
        }
        true
    }
}

/// Resumes the workers when dropped
#[must_use]
pub struct PauseGuard<'a> {
    barrier: &'a PauseBarrier,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.barrier.resume();
    }
}

/// Wakes idle workers when new work arrives.
#[derive(Debug, Default)]
pub struct WorkSignal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    /// Waits for a notification or `timeout`, whichever comes first
    pub fn wait(&self, timeout: Duration) {
        let mut generation = self.generation.lock();
        let seen = *generation;
        let deadline = Instant::now() + timeout;
        while *generation == seen {
            if self.changed.wait_until(&mut generation, deadline).timed_out() {
                break;
            }
        }
    }
}
