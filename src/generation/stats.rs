use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters, updated from every scheduler thread
#[derive(Debug, Default)]
pub struct Counters {
    pub generated: AtomicU64,
    pub loaded_from_store: AtomicU64,
    pub resumed: AtomicU64,
    pub passes_applied: AtomicU64,
    pub handed_off: AtomicU64,
    pub neighbours_admitted: AtomicU64,
    pub swapped_out: AtomicU64,
    pub evicted: AtomicU64,
    pub deferred: AtomicU64,
    pub disposed: AtomicU64,
    pub backpressure_events: AtomicU64,
    pub backpressure_flushes: AtomicU64,
    pub callback_failures: AtomicU64,
    pub terrain_retries: AtomicU64,
    pub records_written: AtomicU64,
    /// Bumped whenever any request moves; used for stall detection
    pub progress: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    pub fn note_progress(&self) {
        self.progress.fetch_add(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub queue_capacity: usize,
    pub deferred: usize,
    pub pending_handoff: usize,
    pub loaded: usize,
    pub cached_metadata: usize,
    pub cached_regions: usize,
    pub generated: u64,
    pub loaded_from_store: u64,
    pub resumed: u64,
    pub passes_applied: u64,
    pub handed_off: u64,
    pub neighbours_admitted: u64,
    pub swapped_out: u64,
    pub evicted: u64,
    pub deferred_total: u64,
    pub disposed: u64,
    pub backpressure_events: u64,
    pub backpressure_flushes: u64,
    pub callback_failures: u64,
    pub terrain_retries: u64,
    pub records_written: u64,
}

impl SchedulerStats {
    pub(crate) fn fill_counters(&mut self, counters: &Counters) {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        self.generated = load(&counters.generated);
        self.loaded_from_store = load(&counters.loaded_from_store);
        self.resumed = load(&counters.resumed);
        self.passes_applied = load(&counters.passes_applied);
        self.handed_off = load(&counters.handed_off);
        self.neighbours_admitted = load(&counters.neighbours_admitted);
        self.swapped_out = load(&counters.swapped_out);
        self.evicted = load(&counters.evicted);
        self.deferred_total = load(&counters.deferred);
        self.disposed = load(&counters.disposed);
        self.backpressure_events = load(&counters.backpressure_events);
        self.backpressure_flushes = load(&counters.backpressure_flushes);
        self.callback_failures = load(&counters.callback_failures);
        self.terrain_retries = load(&counters.terrain_retries);
        self.records_written = load(&counters.records_written);
    }
}
