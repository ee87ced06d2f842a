use crate::codec::Tag;
use crate::error::{Result, StrataError};
use crate::generation::barrier::{mark_worker_thread, PauseGuard};
use crate::generation::deferred::DeferredEntry;
use crate::generation::request::{
    AreaCallback, ClaimGuard, ColumnOutcome, ColumnRequest, RequestSpec,
};
use crate::generation::scheduler::Scheduler;
use crate::generation::stats::Counters;
use crate::logger::{log, LogSeverity};
use crate::world::coord::ColumnPos;
use crate::world::loaded::ColumnData;
use crate::world::pass::{Pass, TRANSITION_COUNT};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use LogSeverity::*;

impl Scheduler {
    /// Adds a request for `spec.pos`, merging it into whatever already
    /// tracks that column. Runs backpressure when the queue is full.
    pub fn admit(&self, spec: RequestSpec) -> Result<()> {
        if !self.in_map(spec.pos) {
            return Err(StrataError::OutOfBounds { pos: spec.pos });
        }
        let mut spec = spec;
        spec.until = spec.until.max(Pass::Terrain);
        loop {
            spec = match self.merge_existing(spec) {
                Some(spec) => spec,
                None => return Ok(()),
            };
            if !self.queue.has_room(self.config.queue_margin) {
                return self.relieve_backpressure(spec);
            }
            let request = self.new_request(spec);
            match self.queue.enqueue(request.clone()) {
                Ok(()) => {
                    self.admitted();
                    return Ok(());
                }
                Err(StrataError::DuplicateKey) => spec = reclaim(&request),
                Err(StrataError::QueueCapacityExceeded { .. }) => {
                    return self.relieve_backpressure(reclaim(&request));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn admitted(&self) {
        self.counters.note_progress();
        self.signal.notify();
    }

    /// Folds `spec` into the live world, a queued request, a pending hand-off
    /// or a deferred entry. Hands the spec back if none of them has the column.
    fn merge_existing(&self, mut spec: RequestSpec) -> Option<RequestSpec> {
        if let Some(data) = self.loaded.try_get(spec.pos) {
            for waiter in spec.waiters.drain(..) {
                waiter(ColumnOutcome::Ready(data.clone()));
            }
            return None;
        }
        if let Some(request) = self.queue.get(spec.pos) {
            spec = self.merge_into(&request, spec)?;
            self.signal.notify();
        }
        if let Some(request) = self.handoff_request(spec.pos) {
            // A handed-off peek stays a peek; a real load starts over
            if spec.peek || !request.is_peek() {
                spec = self.merge_into(&request, spec)?;
            }
        }
        self.deferred.lock().merge(spec).err()
    }

    /// Raises `request` to what `spec` asks for and moves the waiters over.
    /// Waiters whose pass the request already sits at are answered on the
    /// next hand-off. Hands the spec back once the request has stopped
    /// taking waiters.
    fn merge_into(&self, request: &ColumnRequest, mut spec: RequestSpec) -> Option<RequestSpec> {
        if spec.blocking {
            request.set_blocking();
        }
        if !spec.peek {
            request.clear_peek();
        }
        let waiters = std::mem::take(&mut spec.waiters);
        if let Err(waiters) = request.add_waiters(spec.until, waiters) {
            spec.waiters = waiters;
            return Some(spec);
        }
        self.notify_reached(request);
        None
    }

    /// Tries to enqueue after some room was freed
    fn try_enqueue(&self, spec: RequestSpec) -> Result<Option<RequestSpec>> {
        if !spec.blocking && !self.queue.has_room(self.config.queue_margin) {
            return Ok(Some(spec));
        }
        let request = self.new_request(spec);
        match self.queue.enqueue(request.clone()) {
            Ok(()) => {
                self.admitted();
                Ok(None)
            }
            Err(StrataError::QueueCapacityExceeded { .. }) => Ok(Some(reclaim(&request))),
            Err(StrataError::DuplicateKey) => Ok(self.merge_existing(reclaim(&request))),
            Err(e) => Err(e),
        }
    }

    /// Frees queue slots for `spec`, escalating step by step. Whatever does
    /// not fit ends up on the deferred list, so nothing is dropped.
    fn relieve_backpressure(&self, spec: RequestSpec) -> Result<()> {
        Counters::bump(&self.counters.backpressure_events);
        log(
            format!(
                "Request queue full ({}/{}), relieving backpressure for {}",
                self.queue.count(),
                self.queue.capacity(),
                spec.pos
            ),
            Debug,
        );
        // A blocking load on this thread may already hold the barrier
        let _pause = if self.barrier.is_paused() {
            None
        } else {
            match self.pause_workers() {
                Ok(pause) => Some(pause),
                Err(StrataError::PauseTimeout) => {
                    log(
                        format!("Workers did not pause, deferring {}", spec.pos),
                        Warning,
                    );
                    let pass = self.persisted_pass(spec.pos);
                    self.deferred.lock().push(DeferredEntry { spec, pass });
                    Counters::bump(&self.counters.deferred);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };

        self.flush_queued_dirty()?;
        Counters::bump(&self.counters.backpressure_flushes);
        let Some(spec) = self.try_enqueue(spec)? else {
            return Ok(());
        };

        self.evict_parked(usize::MAX)?;
        let Some(spec) = self.try_enqueue(spec)? else {
            return Ok(());
        };

        self.defer_queued(|request| !request.is_blocking())?;
        let Some(mut spec) = self.try_enqueue(spec)? else {
            return Ok(());
        };

        if spec.blocking {
            log(
                format!("Deferring every queued request to admit {}", spec.pos),
                Warning,
            );
            self.defer_queued(|_| true)?;
            spec = match self.try_enqueue(spec)? {
                Some(spec) => spec,
                None => return Ok(()),
            };
        }

        let pass = self.persisted_pass(spec.pos);
        self.deferred.lock().push(DeferredEntry { spec, pass });
        Counters::bump(&self.counters.deferred);
        Ok(())
    }

    /// Drops up to `limit` parked requests nobody waits for. They are
    /// persisted first, so their progress survives.
    pub(crate) fn evict_parked(&self, limit: usize) -> Result<usize> {
        let mut evicted = 0;
        for request in self.queue.snapshot() {
            if evicted >= limit {
                break;
            }
            if !evictable(&request) {
                continue;
            }
            let Some(_claim) = ClaimGuard::try_new(&request) else {
                continue;
            };
            if evictable(&request) {
                self.evict_request(&request)?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Moves every claimable queued request accepted by `filter` to the
    /// deferred list
    fn defer_queued<F>(&self, filter: F) -> Result<usize>
    where
        F: Fn(&ColumnRequest) -> bool,
    {
        let mut moved = 0;
        for request in self.queue.snapshot() {
            if !request.is_live() || !filter(&request) {
                continue;
            }
            let Some(_claim) = ClaimGuard::try_new(&request) else {
                continue;
            };
            if request.is_live() {
                self.defer_request(&request)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Moves deferred entries back into the queue while it has room, making
    /// room from parked requests if needed
    pub fn admit_deferred(&self) -> Result<usize> {
        let mut admitted = 0;
        while !self.deferred.lock().is_empty() {
            if !self.queue.has_room(0) {
                if self.evict_parked(1)? == 0 {
                    break;
                }
                continue;
            }
            let Some(DeferredEntry { spec, pass }) = self.deferred.lock().pop_next() else {
                break;
            };
            let request = self.new_request(spec);
            match self.queue.enqueue(request.clone()) {
                Ok(()) => {
                    admitted += 1;
                    self.admitted();
                }
                Err(StrataError::DuplicateKey) => {
                    if let Some(spec) = self.merge_existing(reclaim(&request)) {
                        self.deferred.lock().push_front(DeferredEntry { spec, pass });
                        break;
                    }
                }
                Err(StrataError::QueueCapacityExceeded { .. }) => {
                    self.deferred
                        .lock()
                        .push_front(DeferredEntry { spec: reclaim(&request), pass });
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(admitted)
    }

    /// Drains flagged requests from the front of the queue. Unloaded
    /// requests are saved on the way out; the first failure is returned
    /// once the drain is done.
    pub(crate) fn cleanup_queue(&self) -> Result<usize> {
        let mut failure = None;
        let removed = self.queue.cleanup_stale_flags(|request| {
            if let Err(e) = self.on_disposed(&request) {
                failure.get_or_insert(e);
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Queue cleanup callback for requests that were unloaded while queued
    fn on_disposed(&self, request: &Arc<ColumnRequest>) -> Result<()> {
        self.finish_disposal(
            request,
            request.current_pass(),
            format!("column {} was unloaded", request.pos),
        )
    }

    /// Parks every worker thread at its next checkpoint
    pub fn pause_workers(&self) -> Result<PauseGuard<'_>> {
        self.signal.notify();
        self.barrier.request_pause(self.config.pause_timeout())
    }

    pub fn set_queue_capacity(&self, capacity: usize) -> Result<()> {
        let _pause = self.pause_workers()?;
        self.queue.set_capacity(capacity)?;
        log(format!("Request queue capacity set to {}", capacity), Info);
        Ok(())
    }

    /// Loads or generates every column in `positions` and drives the
    /// pipeline on the calling thread until all of them reached `until`.
    /// `on_each` sees every outcome as it arrives. Results come back in the
    /// order of `positions`.
    pub fn load_blocking(
        &self,
        positions: &[ColumnPos],
        until: Pass,
        peek: bool,
        params: &Tag,
        on_each: Option<AreaCallback>,
    ) -> Result<Vec<Arc<ColumnData>>> {
        if let Some(pos) = positions.iter().find(|pos| !self.in_map(**pos)) {
            return Err(StrataError::OutOfBounds { pos: *pos });
        }
        if self.is_halted() {
            return Err(self.fatal_error());
        }

        let outcomes = Arc::new(Mutex::new(HashMap::new()));
        let unique: HashSet<ColumnPos> = positions.iter().copied().collect();
        let remaining = Arc::new(AtomicUsize::new(unique.len()));
        for pos in unique {
            let mut spec = RequestSpec::new(pos, until);
            spec.blocking = true;
            spec.peek = peek;
            spec.params = params.clone();
            let outcomes = outcomes.clone();
            let remaining = remaining.clone();
            let on_each = on_each.clone();
            spec.waiters.push(Box::new(move |outcome: ColumnOutcome| {
                if let Some(on_each) = &on_each {
                    on_each(&outcome);
                }
                outcomes.lock().insert(pos, outcome);
                remaining.fetch_sub(1, Ordering::AcqRel);
            }));
            self.admit(spec)?;
        }

        let _pause = if self.barrier.is_paused() {
            None
        } else {
            match self.pause_workers() {
                Ok(pause) => Some(pause),
                // Another caller got the workers parked while this one waited
                Err(StrataError::PauseTimeout) if self.barrier.is_paused() => None,
                Err(e) => return Err(e),
            }
        };
        let mut last_progress = self.counters.progress();
        let mut last_change = Instant::now();
        while remaining.load(Ordering::Acquire) > 0 {
            if self.is_halted() {
                return Err(self.fatal_error());
            }
            if let Err(e) = self.blocking_step() {
                if e.is_fatal() {
                    self.halt(e);
                    return Err(self.fatal_error());
                }
                return Err(e);
            }

            let progress = self.counters.progress();
            if progress != last_progress {
                last_progress = progress;
                last_change = Instant::now();
            } else if last_change.elapsed() >= self.config.blocking_stall_timeout() {
                let diagnostics = self.diagnostics();
                log(format!("Blocking load stalled:\n{}", diagnostics), Fatal);
                return Err(StrataError::SchedulerStall {
                    waited_ms: last_change.elapsed().as_millis() as u64,
                    diagnostics,
                });
            } else {
                thread::yield_now();
            }
        }

        let outcomes = std::mem::take(&mut *outcomes.lock());
        positions
            .iter()
            .map(|pos| match outcomes.get(pos) {
                Some(ColumnOutcome::Ready(data)) => Ok(data.clone()),
                Some(ColumnOutcome::Failed { pos, pass, reason }) => {
                    Err(StrataError::GeneratorCallbackFailure {
                        pos: *pos,
                        pass: *pass,
                        reason: reason.clone(),
                    })
                }
                None => Err(StrataError::Halted(format!("no outcome for column {}", pos))),
            })
            .collect()
    }

    fn blocking_step(&self) -> Result<()> {
        self.cleanup_queue()?;
        self.admit_deferred()?;
        self.run_step(0..TRANSITION_COUNT, self.queue.count())?;
        self.hand_off();
        Ok(())
    }

    /// Removes a column from wherever it is. Loaded columns are saved
    /// first; queued ones are disposed by the next queue cleanup. Returns
    /// whether the column was known.
    pub fn unload_column(&self, pos: ColumnPos) -> Result<bool> {
        if let Some(data) = self.loaded.remove(pos) {
            self.persist_column(&data)?;
            self.forget_metadata(pos);
            self.release_data(data);
            return Ok(true);
        }
        if let Some(request) = self.queue.get(pos) {
            if request.request_dispose() {
                self.signal.notify();
            }
            return Ok(true);
        }
        let entry = self.deferred.lock().take(pos);
        if let Some(entry) = entry {
            let reason = format!("column {} was unloaded", pos);
            self.notify_failure(pos, entry.pass, reason, entry.spec.waiters);
            return Ok(true);
        }
        Ok(false)
    }
}

fn evictable(request: &ColumnRequest) -> bool {
    request.is_live()
        && request.is_parked()
        && request.waiter_count() == 0
        && !request.is_peek()
        && !request.is_blocking()
}

/// Turns a request that never made it into the queue back into its spec
fn reclaim(request: &ColumnRequest) -> RequestSpec {
    request.to_spec(request.close_waiters())
}

/// Transition ranges per scheduler thread. The first thread always owns
/// transition 0 (load or generate); the rest split the remaining
/// transitions into contiguous ranges.
pub fn pass_ranges(worker_threads: usize) -> Vec<Range<u8>> {
    if worker_threads == 0 {
        return vec![0..TRANSITION_COUNT];
    }
    let span = (TRANSITION_COUNT - 1) as usize;
    let parts = worker_threads.min(span);
    let mut ranges = vec![0..1];
    let mut start = 1;
    for i in 0..parts {
        let len = span / parts + usize::from(i < span % parts);
        let end = start + len as u8;
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Owns the scheduler threads
pub struct WorkerCoordinator {
    scheduler: Arc<Scheduler>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerCoordinator {
    pub fn start(scheduler: Arc<Scheduler>) -> Result<Self> {
        let ranges = pass_ranges(scheduler.config.worker_threads);
        scheduler.barrier.set_thread_count(ranges.len());
        let mut coordinator = WorkerCoordinator {
            scheduler: scheduler.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(ranges.len()),
        };

        for (i, range) in ranges.into_iter().enumerate() {
            let name = if i == 0 {
                "strata-chunk".to_string()
            } else {
                format!("strata-worker-{}", i)
            };
            let worker = scheduler.clone();
            let stop = coordinator.stop.clone();
            let spawned = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(worker, range, stop));
            match spawned {
                Ok(handle) => coordinator.handles.push(handle),
                Err(e) => {
                    coordinator.stop_threads();
                    return Err(e.into());
                }
            }
        }
        log(
            format!("Started {} scheduler threads", coordinator.handles.len()),
            Info,
        );
        Ok(coordinator)
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        self.scheduler.signal.notify();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log("Scheduler thread panicked".to_string(), Error);
            }
        }
        self.scheduler.barrier.set_thread_count(0);
        log("Scheduler threads stopped".to_string(), Info);
    }
}

impl Drop for WorkerCoordinator {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

fn worker_loop(scheduler: Arc<Scheduler>, transitions: Range<u8>, stop: Arc<AtomicBool>) {
    mark_worker_thread();
    let idle = scheduler.config.idle_sleep();
    let owns_cleanup = transitions.start == 0;
    while !stop.load(Ordering::Acquire) {
        if scheduler.barrier.checkpoint() {
            continue;
        }
        if scheduler.is_halted() || scheduler.is_shutdown() {
            scheduler.signal.wait(idle);
            continue;
        }
        if owns_cleanup {
            match scheduler.cleanup_queue() {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    scheduler.halt(e);
                    continue;
                }
                Err(e) => log(format!("Queue cleanup failed: {}", e), Warning),
            }
        }
        match scheduler.run_step(transitions.clone(), scheduler.config.scan_batch_size) {
            Ok(true) => {}
            Ok(false) => scheduler.signal.wait(idle),
            Err(e) if e.is_fatal() => scheduler.halt(e),
            Err(e) => {
                log(format!("Scheduler step failed: {}", e), Warning);
                scheduler.signal.wait(idle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamerConfig;
    use crate::generation::registry::GeneratorRegistry;
    use crate::storage::MemoryColumnStore;
    use assert_matches::assert_matches;

    fn scheduler(configure: impl FnOnce(&mut StreamerConfig)) -> Scheduler {
        let mut config = StreamerConfig {
            map_size_x: 16,
            map_size_z: 16,
            slabs_per_column: 1,
            worker_threads: 0,
            ..StreamerConfig::default()
        };
        configure(&mut config);
        Scheduler::new(
            config,
            Arc::new(MemoryColumnStore::new()),
            GeneratorRegistry::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_pass_ranges_cover_every_transition_once() {
        assert_eq!(pass_ranges(0), vec![0..5]);
        assert_eq!(pass_ranges(1), vec![0..1, 1..5]);
        assert_eq!(pass_ranges(2), vec![0..1, 1..3, 3..5]);
        assert_eq!(pass_ranges(3), vec![0..1, 1..3, 3..4, 4..5]);
        let ranges = pass_ranges(7);
        assert_eq!(ranges.len(), 5);
        for (transition, range) in ranges.iter().enumerate() {
            assert_eq!(*range, transition as u8..transition as u8 + 1);
        }
    }

    #[test]
    fn test_admit_merges_into_queued_request() {
        let scheduler = scheduler(|_| {});
        let pos = ColumnPos::new(3, 3, 0);
        scheduler.admit(RequestSpec::new(pos, Pass::Terrain)).unwrap();
        let mut spec = RequestSpec::new(pos, Pass::Done);
        spec.blocking = true;
        spec.waiters.push(Box::new(|_| {}));
        scheduler.admit(spec).unwrap();

        assert_eq!(scheduler.queue.count(), 1);
        let request = scheduler.queue.get(pos).unwrap();
        assert_eq!(request.until_pass(), Pass::Done);
        assert!(request.is_blocking());
        assert_eq!(request.waiter_count(), 1);
    }

    #[test]
    fn test_admit_rejects_out_of_bounds() {
        let scheduler = scheduler(|_| {});
        assert_matches!(
            scheduler.admit(RequestSpec::new(ColumnPos::new(16, 0, 0), Pass::Done)),
            Err(StrataError::OutOfBounds { .. })
        );
        assert_matches!(
            scheduler.load_blocking(
                &[ColumnPos::new(-1, 0, 0)],
                Pass::Done,
                false,
                &Tag::default(),
                None
            ),
            Err(StrataError::OutOfBounds { .. })
        );
    }

    #[test]
    fn test_full_queue_defers_instead_of_dropping() {
        let scheduler = scheduler(|config| {
            config.queue_capacity = 4;
            config.queue_margin = 0;
        });
        for x in 0..6 {
            scheduler
                .admit(RequestSpec::new(ColumnPos::new(x, 0, 0), Pass::Done))
                .unwrap();
        }
        let stats = scheduler.stats();
        assert_eq!(stats.queued + stats.deferred, 6);
        assert!(stats.queued <= 4);
        assert!(stats.backpressure_events >= 1);
        assert_eq!(stats.backpressure_events, stats.backpressure_flushes);
    }

    #[test]
    fn test_backpressure_without_pause_defers_request() {
        let scheduler = scheduler(|config| {
            config.queue_capacity = 2;
            config.queue_margin = 0;
            config.pause_timeout_ms = 20;
        });
        // One scheduler thread that never reaches a checkpoint
        scheduler.barrier.set_thread_count(1);
        for x in 0..3 {
            scheduler
                .admit(RequestSpec::new(ColumnPos::new(x, 0, 0), Pass::Done))
                .unwrap();
        }

        let stats = scheduler.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.backpressure_events, 1);
        assert_eq!(stats.backpressure_flushes, 0);
        assert_eq!(stats.deferred_total, 1);
        assert!(scheduler.deferred.lock().contains(ColumnPos::new(2, 0, 0)));
        assert!(!scheduler.barrier.is_paused());
        assert_matches!(
            scheduler.load_blocking(
                &[ColumnPos::new(0, 0, 0)],
                Pass::Done,
                false,
                &Tag::default(),
                None
            ),
            Err(StrataError::PauseTimeout)
        );
    }

    #[test]
    fn test_merge_answers_waiter_of_reached_pass() {
        let scheduler = scheduler(|_| {});
        let pos = ColumnPos::new(3, 3, 0);
        scheduler.admit(RequestSpec::new(pos, Pass::Terrain)).unwrap();
        scheduler.run_step(0..1, 1).unwrap();

        let answered = Arc::new(AtomicBool::new(false));
        let flag = answered.clone();
        let mut spec = RequestSpec::new(pos, Pass::Terrain);
        spec.waiters.push(Box::new(move |outcome: ColumnOutcome| {
            flag.store(matches!(outcome, ColumnOutcome::Ready(_)), Ordering::SeqCst);
        }));
        scheduler.admit(spec).unwrap();
        assert!(!answered.load(Ordering::SeqCst));
        scheduler.hand_off();
        assert!(answered.load(Ordering::SeqCst));
        assert_eq!(scheduler.queue.get(pos).unwrap().waiter_count(), 0);
    }

    #[test]
    fn test_unload_of_deferred_entry_notifies_waiter() {
        let scheduler = scheduler(|config| {
            config.queue_capacity = 1;
            config.queue_margin = 0;
        });
        let mut urgent = RequestSpec::new(ColumnPos::new(0, 0, 0), Pass::Done);
        urgent.blocking = true;
        scheduler.admit(urgent).unwrap();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let mut spec = RequestSpec::new(ColumnPos::new(1, 0, 0), Pass::Done);
        spec.waiters.push(Box::new(move |outcome: ColumnOutcome| {
            flag.store(matches!(outcome, ColumnOutcome::Failed { .. }), Ordering::SeqCst);
        }));
        scheduler.admit(spec).unwrap();
        assert!(scheduler.deferred.lock().contains(ColumnPos::new(1, 0, 0)));

        assert!(scheduler.unload_column(ColumnPos::new(1, 0, 0)).unwrap());
        scheduler.hand_off();
        assert!(failed.load(Ordering::SeqCst));
        assert!(!scheduler.unload_column(ColumnPos::new(9, 9, 0)).unwrap());
    }

    #[test]
    fn test_queue_capacity_change() {
        let scheduler = scheduler(|_| {});
        scheduler
            .admit(RequestSpec::new(ColumnPos::new(0, 0, 0), Pass::Done))
            .unwrap();
        scheduler
            .admit(RequestSpec::new(ColumnPos::new(1, 0, 0), Pass::Done))
            .unwrap();
        assert_matches!(
            scheduler.set_queue_capacity(1),
            Err(StrataError::QueueCapacityExceeded { .. })
        );
        scheduler.set_queue_capacity(64).unwrap();
        assert_eq!(scheduler.queue.capacity(), 64);
    }
}
