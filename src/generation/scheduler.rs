use crate::codec::Tag;
use crate::config::StreamerConfig;
use crate::error::{Result, StrataError};
use crate::generation::barrier::{PauseBarrier, WorkSignal};
use crate::generation::deferred::{DeferredEntry, DeferredList};
use crate::generation::queue::RequestQueue;
use crate::generation::registry::{GeneratorRegistry, PassContext};
use crate::generation::request::{
    ClaimGuard, ColumnOutcome, ColumnRequest, ReadyCallback, RequestFlag, RequestSpec,
};
use crate::generation::stats::{Counters, SchedulerStats};
use crate::logger::{log, LogSeverity};
use crate::storage::{ColumnStore, WriteBatch};
use crate::world::coord::{ColumnPos, RegionPos};
use crate::world::loaded::{ColumnData, LoadedColumns};
use crate::world::metadata::MapColumnMetadata;
use crate::world::pass::Pass;
use crate::world::pool::SlabPool;
use crate::world::region::Region;
use crate::world::slab::VerticalSlab;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use LogSeverity::*;

/// Version string stamped into every newly generated slab
pub const CREATED_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Arrays kept for reuse per configured slab of a column
const POOLED_COLUMNS: usize = 64;

/// How far a neighbour has got, as seen from the scheduler
enum Neighbour {
    /// Live, handed off, or persisted at this pass
    Known(Pass),
    Queued(Arc<ColumnRequest>),
    /// Sitting in the deferred list with data persisted up to this pass
    Deferred(Pass),
    Unknown,
}

/// Outcome of the neighbour check for a request
enum Readiness {
    Ready,
    Waiting { admitted: bool },
    SwappedOut,
}

/// How a neighbour admission went
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Admitted,
    Present,
    Full,
}

/// Columns that reached Done (or a peek's target pass) and wait for the
/// main thread, plus waiter notifications for it to run
#[derive(Default)]
struct HandOff {
    ready: VecDeque<Arc<ColumnRequest>>,
    positions: HashMap<ColumnPos, Arc<ColumnRequest>>,
    outcomes: Vec<(ColumnOutcome, Vec<ReadyCallback>)>,
}

#[derive(Default)]
struct FatalState {
    error: Option<StrataError>,
    message: Option<String>,
}

/// Shared state of the generation pipeline: the bounded request queue, the
/// deferred overflow list, the hand-off queue, caches and counters. Worker
/// threads and caller threads all drive requests through [`run_step`].
///
/// [`run_step`]: Scheduler::run_step
pub struct Scheduler {
    pub(crate) config: StreamerConfig,
    pub(crate) store: Arc<dyn ColumnStore>,
    pub(crate) registry: Arc<GeneratorRegistry>,
    pub(crate) queue: RequestQueue<ColumnRequest>,
    pub(crate) deferred: Mutex<DeferredList>,
    handoff: Mutex<HandOff>,
    metadata_cache: RwLock<HashMap<ColumnPos, Arc<MapColumnMetadata>>>,
    regions: RwLock<HashMap<RegionPos, Arc<Region>>>,
    region_creation: Mutex<()>,
    pub(crate) loaded: Arc<LoadedColumns>,
    pool: SlabPool,
    pub(crate) barrier: PauseBarrier,
    pub(crate) signal: WorkSignal,
    pub(crate) counters: Counters,
    halted: AtomicBool,
    fatal: Mutex<FatalState>,
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new(
        config: StreamerConfig,
        store: Arc<dyn ColumnStore>,
        registry: GeneratorRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let pooled = POOLED_COLUMNS * config.slabs_per_column;
        Ok(Scheduler {
            queue: RequestQueue::new(config.queue_capacity),
            store,
            registry: Arc::new(registry),
            deferred: Mutex::new(DeferredList::new()),
            handoff: Mutex::new(HandOff::default()),
            metadata_cache: RwLock::new(HashMap::new()),
            regions: RwLock::new(HashMap::new()),
            region_creation: Mutex::new(()),
            loaded: Arc::new(LoadedColumns::new()),
            pool: SlabPool::new(pooled),
            barrier: PauseBarrier::new(),
            signal: WorkSignal::new(),
            counters: Counters::default(),
            halted: AtomicBool::new(false),
            fatal: Mutex::new(FatalState::default()),
            shutdown: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.signal.notify();
    }

    /// Stops all processing after a fatal error. The first error is kept
    /// and handed to the next caller of [`fatal_error`](Scheduler::fatal_error).
    pub fn halt(&self, error: StrataError) {
        log(format!("Scheduler halted: {}", error), Fatal);
        let mut fatal = self.fatal.lock();
        if fatal.message.is_none() {
            fatal.message = Some(error.to_string());
            fatal.error = Some(error);
        }
        self.halted.store(true, Ordering::Release);
        self.signal.notify();
    }

    pub fn fatal_error(&self) -> StrataError {
        let mut fatal = self.fatal.lock();
        match fatal.error.take() {
            Some(error) => error,
            None => StrataError::Halted(
                fatal
                    .message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
        }
    }

    pub(crate) fn in_map(&self, pos: ColumnPos) -> bool {
        pos.in_bounds(self.config.map_size_x, self.config.map_size_z)
    }

    pub(crate) fn new_request(&self, spec: RequestSpec) -> Arc<ColumnRequest> {
        Arc::new(ColumnRequest::new(spec, self.config.map_size_x))
    }

    /// Scans up to `budget` queued requests and advances every one whose
    /// next transition lies in `transitions`. Returns whether anything moved.
    pub fn run_step(&self, transitions: Range<u8>, budget: usize) -> Result<bool> {
        let mut progressed = false;
        let mut remaining = budget.max(1);
        while remaining > 0 && !self.is_halted() {
            let (picked, scanned) = self.queue.rotate_scan(remaining, |request| {
                request.is_live()
                    && !request.is_parked()
                    && transitions.contains(&request.current_pass().transition())
                    && request.try_claim()
            });
            remaining = remaining.saturating_sub(scanned.max(1));
            let Some(request) = picked else {
                break;
            };
            let _claim = ClaimGuard::adopt(&request);
            progressed |= self.process(&request)?;
        }
        Ok(progressed)
    }

    /// Applies the next transition of a claimed request
    fn process(&self, request: &Arc<ColumnRequest>) -> Result<bool> {
        if !request.is_live() || request.is_parked() {
            return Ok(false);
        }
        let current = request.current_pass();
        let Some(target) = current.next() else {
            return Ok(false);
        };
        if current == Pass::None {
            return self.load_or_generate(request);
        }
        if !request.prettified() {
            match self.check_neighbours(request)? {
                Readiness::Ready => request.set_prettified(),
                Readiness::Waiting { admitted } => return Ok(admitted),
                Readiness::SwappedOut => return Ok(true),
            }
        }
        self.apply_pass(request, target)?;
        Ok(true)
    }

    fn column_data(&self, request: &ColumnRequest) -> Result<Arc<ColumnData>> {
        request.data().ok_or_else(|| {
            StrataError::Halted(format!(
                "request for {} at {:?} has no column data",
                request.pos,
                request.current_pass()
            ))
        })
    }

    fn apply_pass(&self, request: &Arc<ColumnRequest>, target: Pass) -> Result<()> {
        let data = self.column_data(request)?;
        let region = self.region_for(request.pos, &request.params)?;
        let mut ctx = PassContext {
            pos: request.pos,
            pass: target,
            column: &data,
            region: &region,
            params: &request.params,
        };
        for failure in self.registry.run_pass(&mut ctx) {
            Counters::bump(&self.counters.callback_failures);
            log(failure.to_string(), Warning);
        }
        self.complete_pass(request, target)
    }

    fn complete_pass(&self, request: &Arc<ColumnRequest>, target: Pass) -> Result<()> {
        request.advance_to(target);
        if let Some(data) = request.data() {
            data.metadata.advance_pass(target);
        }
        Counters::bump(&self.counters.passes_applied);
        self.counters.note_progress();
        self.signal.notify();
        self.settle(request)
    }

    /// Done columns and peeks at their target go to the main thread; other
    /// requests parked at their ceiling notify the waiters asking for it.
    fn settle(&self, request: &Arc<ColumnRequest>) -> Result<()> {
        if request.current_pass() == Pass::Done {
            return self.finish_column(request);
        }
        if request.is_peek() {
            if request.is_parked() && request.waiter_count() > 0 {
                return self.finish_column(request);
            }
            return Ok(());
        }
        self.notify_reached(request);
        Ok(())
    }

    /// Queues a Ready notification for waiters whose pass has been reached
    pub(crate) fn notify_reached(&self, request: &ColumnRequest) {
        let waiters = request.take_reached_waiters();
        if waiters.is_empty() {
            return;
        }
        let outcome = match request.data() {
            Some(data) => ColumnOutcome::Ready(data),
            None => ColumnOutcome::Failed {
                pos: request.pos,
                pass: request.current_pass(),
                reason: "column data was released".to_string(),
            },
        };
        self.handoff.lock().outcomes.push((outcome, waiters));
    }

    /// Persists a finished column and queues it for the main thread
    fn finish_column(&self, request: &Arc<ColumnRequest>) -> Result<()> {
        let data = self.column_data(request)?;
        if !request.is_peek() {
            self.persist_column(&data)?;
        }
        {
            let mut handoff = self.handoff.lock();
            handoff.ready.push_back(request.clone());
            handoff.positions.insert(request.pos, request.clone());
        }
        self.queue.remove_by_key(request.pos);
        self.counters.note_progress();
        Ok(())
    }

    /// Transition 0: bring the column in from the store, resume persisted
    /// progress, or generate it from scratch.
    fn load_or_generate(&self, request: &Arc<ColumnRequest>) -> Result<bool> {
        let pos = request.pos;
        let metadata = match self.resolve_metadata(pos) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.corruption(pos, format!("column metadata: {}", e))?;
                None
            }
        };

        if let Some(metadata) = metadata.filter(|m| m.is_current_format() && m.pass() > Pass::None)
        {
            match self.load_slabs(pos) {
                Ok(Some(slabs)) => return self.resume_column(request, slabs, metadata),
                Ok(None) => log(
                    format!("Column {} has metadata but missing slabs, regenerating", pos),
                    Debug,
                ),
                Err(e) => self.corruption(pos, format!("slab: {}", e))?,
            }
        }
        self.generate_column(request)
    }

    fn resume_column(
        &self,
        request: &Arc<ColumnRequest>,
        slabs: Vec<VerticalSlab>,
        metadata: Arc<MapColumnMetadata>,
    ) -> Result<bool> {
        let pass = metadata.pass();
        request.set_data(Arc::new(ColumnData::new(request.pos, slabs, metadata)));
        request.advance_to(pass);
        self.counters.note_progress();
        self.signal.notify();
        if pass == Pass::Done {
            Counters::bump(&self.counters.loaded_from_store);
        } else {
            Counters::bump(&self.counters.resumed);
            log(
                format!("Resuming column {} at {:?}", request.pos, pass),
                Debug,
            );
        }
        self.settle(request)?;
        Ok(true)
    }

    fn generate_column(&self, request: &Arc<ColumnRequest>) -> Result<bool> {
        let pos = request.pos;
        let metadata = Arc::new(MapColumnMetadata::new(pos));
        for reason in self.registry.run_map_chunk(&metadata) {
            Counters::bump(&self.counters.callback_failures);
            log(format!("Map chunk hook failed for {}: {}", pos, reason), Warning);
        }
        let region = self.region_for(pos, &request.params)?;
        for structure in region.structures_overlapping(pos) {
            metadata.add_structure(structure);
        }
        let slabs = (0..self.config.slabs_per_column)
            .map(|_| VerticalSlab::new(self.pool.acquire(), CREATED_VERSION))
            .collect();
        let data = Arc::new(ColumnData::new(pos, slabs, metadata.clone()));

        let mut ctx = PassContext {
            pos,
            pass: Pass::Terrain,
            column: &data,
            region: &region,
            params: &request.params,
        };
        let failures = self.registry.run_pass(&mut ctx);
        if let Some(first) = failures.first() {
            let reason = first.to_string();
            for failure in &failures {
                Counters::bump(&self.counters.callback_failures);
                log(failure.to_string(), Warning);
            }
            self.release_data(data);
            let attempt = request.next_terrain_attempt();
            if attempt >= self.config.terrain_retry_limit {
                log(
                    format!(
                        "Giving up on column {} after {} terrain attempts",
                        pos, attempt
                    ),
                    Error,
                );
                self.dispose(request, Pass::Terrain, reason)?;
                return Ok(true);
            }
            Counters::bump(&self.counters.terrain_retries);
            return Ok(false);
        }

        self.metadata_cache.write().insert(pos, metadata);
        request.set_data(data);
        Counters::bump(&self.counters.generated);
        self.complete_pass(request, Pass::Terrain)?;
        Ok(true)
    }

    /// Corrupt stored data: regenerate in repair mode, otherwise a fatal error
    fn corruption(&self, pos: ColumnPos, reason: String) -> Result<()> {
        if self.config.repair_mode {
            log(
                format!("Corrupt data for column {} ({}), regenerating", pos, reason),
                Warning,
            );
            return Ok(());
        }
        Err(StrataError::LoadCorruption { pos, reason })
    }

    /// Metadata for `pos` from the cache. On a miss the whole 3×3
    /// neighbourhood is read from the store in one go.
    fn resolve_metadata(&self, pos: ColumnPos) -> io::Result<Option<Arc<MapColumnMetadata>>> {
        let positions: Vec<ColumnPos> = {
            let cache = self.metadata_cache.read();
            if let Some(metadata) = cache.get(&pos) {
                return Ok(Some(metadata.clone()));
            }
            std::iter::once(pos)
                .chain(
                    pos.neighbours(self.config.map_size_x, self.config.map_size_z)
                        .map(|(_, neighbour)| neighbour)
                        .filter(|neighbour| !cache.contains_key(neighbour)),
                )
                .collect()
        };
        let records = self.store.get_map_chunks_bytes(&positions)?;

        let mut result = None;
        let mut cache = self.metadata_cache.write();
        for (position, record) in positions.iter().zip(records) {
            let Some(bytes) = record else {
                continue;
            };
            match MapColumnMetadata::from_bytes(*position, &bytes) {
                Ok(metadata) => {
                    let cached = cache
                        .entry(*position)
                        .or_insert_with(|| Arc::new(metadata))
                        .clone();
                    if *position == pos {
                        result = Some(cached);
                    }
                }
                Err(e) if *position == pos => return Err(e),
                Err(_) => {}
            }
        }
        Ok(result)
    }

    /// Single-column metadata lookup used for readiness checks
    fn cached_metadata(&self, pos: ColumnPos) -> io::Result<Option<Arc<MapColumnMetadata>>> {
        if let Some(metadata) = self.metadata_cache.read().get(&pos) {
            return Ok(Some(metadata.clone()));
        }
        let Some(bytes) = self.store.get_map_chunk_bytes(pos)? else {
            return Ok(None);
        };
        let metadata = Arc::new(MapColumnMetadata::from_bytes(pos, &bytes)?);
        Ok(Some(
            self.metadata_cache
                .write()
                .entry(pos)
                .or_insert(metadata)
                .clone(),
        ))
    }

    /// Pass reached by the column's persisted data
    pub(crate) fn persisted_pass(&self, pos: ColumnPos) -> Pass {
        match self.cached_metadata(pos) {
            Ok(Some(metadata)) if metadata.is_current_format() => metadata.pass(),
            _ => Pass::None,
        }
    }

    /// All slabs of a column, or `None` if any is missing
    fn load_slabs(&self, pos: ColumnPos) -> io::Result<Option<Vec<VerticalSlab>>> {
        let mut slabs = Vec::with_capacity(self.config.slabs_per_column);
        for y in 0..self.config.slabs_per_column {
            let Some(bytes) = self.store.get_chunk_bytes(pos.slab(y as i32))? else {
                return Ok(None);
            };
            slabs.push(VerticalSlab::from_bytes(&bytes)?);
        }
        Ok(Some(slabs))
    }

    /// The region containing `pos`, loading or generating it on first use
    fn region_for(&self, pos: ColumnPos, params: &Tag) -> Result<Arc<Region>> {
        let region_pos = pos.region(self.config.region_size);
        if let Some(region) = self.regions.read().get(&region_pos) {
            return Ok(region.clone());
        }
        let _creation = self.region_creation.lock();
        if let Some(region) = self.regions.read().get(&region_pos) {
            return Ok(region.clone());
        }

        let size = self.config.region_size;
        let stored = match self.store.get_region_bytes(region_pos)? {
            Some(bytes) => match Region::from_bytes(region_pos, size, &bytes) {
                Ok(region) => Some(region),
                Err(e) => {
                    self.corruption(pos, format!("region: {}", e))?;
                    None
                }
            },
            None => None,
        };
        let region = match stored {
            Some(region) => region,
            None => {
                let region = Region::new(region_pos, size);
                for reason in self.registry.run_region(&region, params) {
                    Counters::bump(&self.counters.callback_failures);
                    log(
                        format!("Region hook failed for {:?}: {}", region_pos, reason),
                        Warning,
                    );
                }
                region
            }
        };
        let region = Arc::new(region);
        self.regions.write().insert(region_pos, region.clone());
        Ok(region)
    }

    fn neighbour_state(&self, pos: ColumnPos) -> Neighbour {
        if self.loaded.contains(pos) {
            return Neighbour::Known(Pass::Done);
        }
        if let Some(request) = self.queue.get(pos) {
            return Neighbour::Queued(request);
        }
        if let Some(request) = self.handoff_request(pos) {
            return Neighbour::Known(request.current_pass());
        }
        if let Some(pass) = self.deferred.lock().pass_of(pos) {
            return Neighbour::Deferred(pass);
        }
        match self.cached_metadata(pos) {
            Ok(Some(metadata)) if metadata.is_current_format() => Neighbour::Known(metadata.pass()),
            _ => Neighbour::Unknown,
        }
    }

    /// Every in-bounds neighbour has to be at least at the request's pass
    /// before it may advance. Missing neighbours are admitted, queued ones
    /// get their ceiling raised. When a neighbour cannot get into the queue
    /// the request gives up its own slot. Neighbours admitted for a peek are
    /// peeks themselves and are dropped once the peek is handed off.
    fn check_neighbours(&self, request: &Arc<ColumnRequest>) -> Result<Readiness> {
        let need = request.current_pass();
        let peek = request.is_peek();
        let neighbour_spec = |pos: ColumnPos| {
            let mut spec = RequestSpec::new(pos, need);
            spec.peek = peek;
            spec
        };
        let mut waiting = false;
        let mut admitted = false;
        let mut blocked_by = None;

        for (_, neighbour) in request
            .pos
            .neighbours(self.config.map_size_x, self.config.map_size_z)
        {
            let admission = match self.neighbour_state(neighbour) {
                Neighbour::Known(pass) if pass >= need => continue,
                Neighbour::Deferred(pass) if pass >= need => continue,
                Neighbour::Queued(other) => {
                    if other.current_pass() >= need {
                        continue;
                    }
                    waiting = true;
                    if !peek {
                        other.clear_peek();
                    }
                    if other.raise_until(need) {
                        admitted = true;
                        self.signal.notify();
                    }
                    continue;
                }
                Neighbour::Deferred(_) => {
                    waiting = true;
                    self.raise_deferred(neighbour_spec(neighbour))?
                }
                Neighbour::Known(_) | Neighbour::Unknown => {
                    waiting = true;
                    self.admit_neighbour(neighbour_spec(neighbour))?
                }
            };
            match admission {
                Admission::Admitted => admitted = true,
                Admission::Present => {}
                Admission::Full => {
                    blocked_by.get_or_insert(neighbour);
                }
            }
        }

        if !waiting {
            return Ok(Readiness::Ready);
        }
        if let Some(neighbour) = blocked_by {
            self.swap_out(request, neighbour, need)?;
            return Ok(Readiness::SwappedOut);
        }
        request.compare_flag(RequestFlag::Live, RequestFlag::RequeueRequested);
        Ok(Readiness::Waiting { admitted })
    }

    /// Puts a neighbour straight into the queue. Neighbour admissions may
    /// use the reserved margin.
    fn admit_neighbour(&self, spec: RequestSpec) -> Result<Admission> {
        match self.queue.enqueue(self.new_request(spec)) {
            Ok(()) => {
                Counters::bump(&self.counters.neighbours_admitted);
                self.counters.note_progress();
                self.signal.notify();
                Ok(Admission::Admitted)
            }
            Err(StrataError::DuplicateKey) => Ok(Admission::Present),
            Err(StrataError::QueueCapacityExceeded { .. }) => Ok(Admission::Full),
            Err(e) => Err(e),
        }
    }

    /// Raises a deferred neighbour's ceiling. One that left the deferred list
    /// since it was looked up is admitted directly instead.
    fn raise_deferred(&self, spec: RequestSpec) -> Result<Admission> {
        let merged = self.deferred.lock().merge(spec);
        match merged {
            Ok(()) => Ok(Admission::Full),
            Err(spec) => self.admit_neighbour(spec),
        }
    }

    /// Moves `request` to the deferred list and lets `neighbour` take its slot
    fn swap_out(&self, request: &Arc<ColumnRequest>, neighbour: ColumnPos, need: Pass) -> Result<()> {
        self.defer_request(request)?;
        Counters::bump(&self.counters.swapped_out);
        log(
            format!(
                "Swapped {} out of the queue to make room for neighbour {}",
                request.pos, neighbour
            ),
            Debug,
        );

        let entry = self.deferred.lock().take(neighbour);
        let (mut spec, pass) = match entry {
            Some(entry) => (entry.spec, entry.pass),
            None => (RequestSpec::new(neighbour, need), Pass::None),
        };
        spec.until = spec.until.max(need);
        let incoming = self.new_request(spec);
        if let Err(e) = self.queue.enqueue(incoming.clone()) {
            log(
                format!("Neighbour {} could not take the freed slot: {}", neighbour, e),
                Debug,
            );
            let spec = incoming.to_spec(incoming.close_waiters());
            self.deferred.lock().push_front(DeferredEntry { spec, pass });
        }
        self.signal.notify();
        Ok(())
    }

    /// Persists what the claimed `request` has so far and moves it to the
    /// deferred list. Peek requests are dropped back to pass None instead.
    /// The stored metadata speaks for the column from here on.
    pub(crate) fn defer_request(&self, request: &Arc<ColumnRequest>) -> Result<()> {
        let pass = if request.is_peek() {
            Pass::None
        } else {
            if let Some(data) = request.data() {
                self.persist_column(&data)?;
            }
            request.current_pass()
        };
        self.forget_metadata(request.pos);
        let waiters = request.close_waiters();
        let spec = request.to_spec(waiters);
        self.deferred.lock().push(DeferredEntry { spec, pass });
        self.queue.remove_by_key(request.pos);
        request.mark_disposed();
        if let Some(data) = request.take_data() {
            self.release_data(data);
        }
        Counters::bump(&self.counters.deferred);
        self.counters.note_progress();
        Ok(())
    }

    /// Drops a parked, waiter-less request after persisting it. Its progress
    /// stays visible through the stored metadata.
    pub(crate) fn evict_request(&self, request: &Arc<ColumnRequest>) -> Result<()> {
        if let Some(data) = request.data() {
            self.persist_column(&data)?;
        }
        let waiters = request.close_waiters();
        if !waiters.is_empty() {
            let spec = request.to_spec(waiters);
            let pass = request.current_pass();
            self.deferred.lock().push(DeferredEntry { spec, pass });
        }
        self.queue.remove_by_key(request.pos);
        request.mark_disposed();
        self.forget_metadata(request.pos);
        if let Some(data) = request.take_data() {
            self.release_data(data);
        }
        Counters::bump(&self.counters.evicted);
        self.counters.note_progress();
        Ok(())
    }

    /// Removes a request for good and tells its waiters why
    pub(crate) fn dispose(
        &self,
        request: &Arc<ColumnRequest>,
        pass: Pass,
        reason: String,
    ) -> Result<()> {
        self.queue.remove_by_key(request.pos);
        self.finish_disposal(request, pass, reason)
    }

    /// Clean-up for a request that already left the queue. Whatever it
    /// generated is written out before the slabs go back to the pool.
    pub(crate) fn finish_disposal(
        &self,
        request: &Arc<ColumnRequest>,
        pass: Pass,
        reason: String,
    ) -> Result<()> {
        request.mark_disposed();
        self.forget_metadata(request.pos);
        let mut saved = Ok(());
        if let Some(data) = request.take_data() {
            if !request.is_peek() {
                saved = self.persist_column(&data).map(|_| ());
            }
            self.release_data(data);
        }
        let waiters = request.close_waiters();
        self.notify_failure(request.pos, pass, reason, waiters);
        Counters::bump(&self.counters.disposed);
        self.counters.note_progress();
        saved
    }

    /// Drops parked peek requests nobody waits for. These are the temporary
    /// neighbourhoods of peeks, so nothing is saved.
    fn drop_idle_peeks(&self) -> usize {
        let mut dropped = 0;
        for request in self.queue.snapshot() {
            if !idle_peek(&request) {
                continue;
            }
            let Some(_claim) = ClaimGuard::try_new(&request) else {
                continue;
            };
            if !idle_peek(&request) {
                continue;
            }
            self.queue.remove_by_key(request.pos);
            request.mark_disposed();
            self.forget_metadata(request.pos);
            if let Some(data) = request.take_data() {
                self.release_data(data);
            }
            dropped += 1;
        }
        if dropped > 0 {
            Counters::add(&self.counters.disposed, dropped as u64);
            self.counters.note_progress();
        }
        dropped
    }

    pub(crate) fn notify_failure(
        &self,
        pos: ColumnPos,
        pass: Pass,
        reason: String,
        waiters: Vec<ReadyCallback>,
    ) {
        if waiters.is_empty() {
            return;
        }
        let outcome = ColumnOutcome::Failed { pos, pass, reason };
        self.handoff.lock().outcomes.push((outcome, waiters));
    }

    pub(crate) fn release_data(&self, data: Arc<ColumnData>) {
        if let Ok(column) = Arc::try_unwrap(data) {
            for slab in column.slabs.into_inner() {
                if let Some(arrays) = slab.into_arrays() {
                    self.pool.release(arrays);
                }
            }
        }
    }

    pub(crate) fn check_disk(&self) -> Result<()> {
        let free = self.store.free_space_bytes()?;
        let required = self.config.min_free_disk_bytes;
        if free < required {
            log(
                format!(
                    "Only {} bytes free, {} required; shutting down",
                    free, required
                ),
                Fatal,
            );
            self.request_shutdown();
            return Err(StrataError::DiskPressure { free, required });
        }
        Ok(())
    }

    /// Writes every dirty slab, the metadata and the region of a column
    pub(crate) fn persist_column(&self, data: &ColumnData) -> Result<usize> {
        self.check_disk()?;
        let mut batch = WriteBatch::new(self.store.as_ref(), self.config.store_flush_every);
        let mut buffer = Vec::new();
        for (y, slab) in data.slabs.read().iter().enumerate() {
            if slab.snapshot_for_save(&mut buffer)? {
                batch.push_chunk(data.pos.slab(y as i32), &buffer)?;
            }
        }
        if let Some(bytes) = data.metadata.snapshot_for_save()? {
            batch.push_map_chunk(data.pos, bytes)?;
        }
        let region_pos = data.pos.region(self.config.region_size);
        let region = self.regions.read().get(&region_pos).cloned();
        if let Some(region) = region {
            if let Some(bytes) = region.snapshot_for_save()? {
                batch.push_region(region_pos, bytes)?;
            }
        }
        let written = batch.finish()?;
        Counters::add(&self.counters.records_written, written as u64);
        Ok(written)
    }

    /// Persists the dirty state of every queued request that can be claimed
    pub(crate) fn flush_queued_dirty(&self) -> Result<usize> {
        let mut written = 0;
        for request in self.queue.snapshot() {
            if request.is_peek() {
                continue;
            }
            if let Some(_claim) = ClaimGuard::try_new(&request) {
                if let Some(data) = request.data() {
                    written += self.persist_column(&data)?;
                }
            }
        }
        Ok(written)
    }

    /// Persists every column of the live world and any dirty region
    pub(crate) fn flush_loaded_dirty(&self) -> Result<usize> {
        let mut written = 0;
        for pos in self.loaded.positions() {
            if let Some(data) = self.loaded.try_get(pos) {
                written += self.persist_column(&data)?;
            }
        }
        let regions: Vec<Arc<Region>> = self.regions.read().values().cloned().collect();
        let mut records = Vec::new();
        for region in regions {
            if let Some(bytes) = region.snapshot_for_save()? {
                records.push((region.pos, Bytes::from(bytes)));
            }
        }
        if !records.is_empty() {
            written += records.len();
            self.store.set_regions(records)?;
        }
        Ok(written)
    }

    pub(crate) fn forget_metadata(&self, pos: ColumnPos) {
        self.metadata_cache.write().remove(&pos);
    }

    pub(crate) fn handoff_request(&self, pos: ColumnPos) -> Option<Arc<ColumnRequest>> {
        self.handoff.lock().positions.get(&pos).cloned()
    }

    pub(crate) fn metadata_cache_len(&self) -> usize {
        self.metadata_cache.read().len()
    }

    /// Drops cached metadata of columns that are neither live, queued,
    /// pending hand-off nor deferred; their stored record is authoritative.
    /// With `regions` set, regions holding none of those columns are saved
    /// and dropped too, which is only safe while the workers are paused.
    /// Returns how many metadata entries and regions were dropped.
    pub(crate) fn trim_caches(&self, regions: bool) -> Result<(usize, usize)> {
        let mut tracked: HashSet<ColumnPos> = self.loaded.positions().into_iter().collect();
        tracked.extend(self.queue.snapshot().map(|request| request.pos));
        tracked.extend(self.handoff.lock().positions.keys().copied());
        tracked.extend(self.deferred.lock().positions());

        let metadata = {
            let mut cache = self.metadata_cache.write();
            let before = cache.len();
            cache.retain(|pos, _| tracked.contains(pos));
            before - cache.len()
        };
        if !regions {
            return Ok((metadata, 0));
        }

        let size = self.config.region_size;
        let live: HashSet<RegionPos> = tracked.iter().map(|pos| pos.region(size)).collect();
        let _creation = self.region_creation.lock();
        let idle: Vec<Arc<Region>> = self
            .regions
            .read()
            .iter()
            .filter(|(pos, _)| !live.contains(*pos))
            .map(|(_, region)| region.clone())
            .collect();
        let mut records = Vec::new();
        for region in &idle {
            if let Some(bytes) = region.snapshot_for_save()? {
                records.push((region.pos, Bytes::from(bytes)));
            }
        }
        if !records.is_empty() {
            self.check_disk()?;
            Counters::add(&self.counters.records_written, records.len() as u64);
            self.store.set_regions(records)?;
        }
        let mut map = self.regions.write();
        for region in &idle {
            map.remove(&region.pos);
        }
        if metadata > 0 || !idle.is_empty() {
            log(
                format!(
                    "Dropped {} cached metadata entries and {} regions",
                    metadata,
                    idle.len()
                ),
                Debug,
            );
        }
        Ok((metadata, idle.len()))
    }

    /// Main-thread half of completion: finished columns join the live world,
    /// their load hooks run, then their waiters. Returns how many columns
    /// were handed off.
    pub fn hand_off(&self) -> usize {
        let (ready, outcomes) = {
            let mut handoff = self.handoff.lock();
            (
                std::mem::take(&mut handoff.ready),
                std::mem::take(&mut handoff.outcomes),
            )
        };

        let mut handed = 0;
        let mut peeked = false;
        for request in ready {
            let Some(data) = request.data() else {
                self.handoff.lock().positions.remove(&request.pos);
                continue;
            };
            if request.is_peek() {
                self.forget_metadata(request.pos);
                peeked = true;
            } else {
                self.loaded.insert(data.clone());
                for reason in self.registry.run_loaded(&data) {
                    Counters::bump(&self.counters.callback_failures);
                    log(
                        format!("Load hook failed for {}: {}", request.pos, reason),
                        Warning,
                    );
                }
            }
            let waiters = request.close_waiters();
            self.handoff.lock().positions.remove(&request.pos);
            request.mark_disposed();
            for waiter in waiters {
                waiter(ColumnOutcome::Ready(data.clone()));
            }
            handed += 1;
            Counters::bump(&self.counters.handed_off);
            self.counters.note_progress();
        }

        for (outcome, waiters) in outcomes {
            for waiter in waiters {
                waiter(outcome.clone());
            }
        }
        if peeked {
            self.drop_idle_peeks();
        }
        handed
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            queued: self.queue.count(),
            queue_capacity: self.queue.capacity(),
            deferred: self.deferred.lock().len(),
            pending_handoff: self.handoff.lock().positions.len(),
            loaded: self.loaded.len(),
            cached_metadata: self.metadata_cache_len(),
            cached_regions: self.regions.read().len(),
            ..SchedulerStats::default()
        };
        stats.fill_counters(&self.counters);
        stats
    }

    /// Human-readable dump of every queued and deferred request
    pub fn diagnostics(&self) -> String {
        let stats = self.stats();
        let mut lines = vec![format!(
            "queue {}/{}, deferred {}, hand-off {}, loaded {}, halted {}",
            stats.queued,
            stats.queue_capacity,
            stats.deferred,
            stats.pending_handoff,
            stats.loaded,
            self.is_halted()
        )];
        for request in self.queue.snapshot() {
            lines.push(format!(
                "queued {} pass={:?} until={:?} flag={:?} claimed={} blocking={} peek={} prettified={} waiters={} created={}",
                request.pos,
                request.current_pass(),
                request.until_pass(),
                request.flag(),
                request.is_claimed(),
                request.is_blocking(),
                request.is_peek(),
                request.prettified(),
                request.waiter_count(),
                request.creation_time,
            ));
        }
        lines.extend(self.deferred.lock().describe());
        lines.join("\n")
    }
}

fn idle_peek(request: &ColumnRequest) -> bool {
    request.is_live() && request.is_peek() && request.is_parked() && request.waiter_count() == 0
}
