use crate::codec::Tag;
use crate::config::StreamerConfig;
use crate::error::{Result, StrataError};
use crate::generation::barrier::PauseGuard;
use crate::generation::coordinator::WorkerCoordinator;
use crate::generation::registry::GeneratorRegistry;
use crate::generation::request::{AreaCallback, ColumnOutcome, ReadyCallback, RequestSpec};
use crate::generation::scheduler::Scheduler;
use crate::generation::stats::SchedulerStats;
use crate::logger::{log, LogSeverity};
use crate::storage::{ColumnStore, StoredKind};
use crate::world::coord::{ColumnPos, SlabPos};
use crate::world::loaded::{ColumnData, LoadedColumns};
use crate::world::metadata::MapColumnMetadata;
use crate::world::pass::Pass;
use parking_lot::Mutex;
use std::sync::Arc;
use LogSeverity::*;

/// Streams world columns in and out of the live world. This is the public
/// entry point: it owns the scheduler and its worker threads and is what the
/// game thread talks to.
///
/// Requests made with [`request_column`](ChunkStreamer::request_column) are
/// processed by the worker threads started with
/// [`start`](ChunkStreamer::start); finished columns join the live world
/// during [`tick`](ChunkStreamer::tick), which must be called regularly from
/// the game thread. Blocking [`request_area`](ChunkStreamer::request_area)
/// calls drive the pipeline on the calling thread and work without workers.
pub struct ChunkStreamer {
    scheduler: Arc<Scheduler>,
    coordinator: Mutex<Option<WorkerCoordinator>>,
}

impl ChunkStreamer {
    pub fn new(
        config: StreamerConfig,
        store: Arc<dyn ColumnStore>,
        registry: GeneratorRegistry,
    ) -> Result<Self> {
        Ok(ChunkStreamer {
            scheduler: Arc::new(Scheduler::new(config, store, registry)?),
            coordinator: Mutex::new(None),
        })
    }

    /// Starts the worker threads. Does nothing if they already run.
    pub fn start(&self) -> Result<()> {
        let mut coordinator = self.coordinator.lock();
        if coordinator.is_none() {
            *coordinator = Some(WorkerCoordinator::start(self.scheduler.clone())?);
        }
        Ok(())
    }

    /// Stops the worker threads and saves everything dirty. Returns the
    /// number of records written.
    pub fn shutdown(&self) -> Result<usize> {
        let coordinator = self.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            coordinator.shutdown();
        }
        let written = self.save_dirty()?;
        log(
            format!("Streamer shut down, {} records written", written),
            Info,
        );
        Ok(written)
    }

    /// Asks for a column up to `until` without waiting. `on_ready` runs on
    /// the thread calling [`tick`](ChunkStreamer::tick) once the column got
    /// there, or right away if it is already live.
    pub fn request_column(
        &self,
        pos: ColumnPos,
        until: Pass,
        params: Tag,
        on_ready: Option<ReadyCallback>,
    ) -> Result<()> {
        self.ensure_running()?;
        let mut spec = RequestSpec::new(pos, until);
        spec.params = params;
        spec.waiters.extend(on_ready);
        self.scheduler.admit(spec)
    }

    /// Asks for every column of the rectangle spanned by `first` and `last`
    /// (inclusive, in `first`'s dimension). `on_each` sees every outcome.
    ///
    /// A blocking call drives the pipeline until all columns reached `until`
    /// and returns them row by row; a non-blocking one queues them for the
    /// workers and returns nothing.
    pub fn request_area(
        &self,
        first: ColumnPos,
        last: ColumnPos,
        until: Pass,
        blocking: bool,
        on_each: Option<AreaCallback>,
    ) -> Result<Vec<Arc<ColumnData>>> {
        self.ensure_running()?;
        let positions = area(first, last);
        if blocking {
            return self
                .scheduler
                .load_blocking(&positions, until, false, &Tag::default(), on_each);
        }
        for pos in positions {
            let mut spec = RequestSpec::new(pos, until);
            if let Some(on_each) = on_each.clone() {
                spec.waiters
                    .push(Box::new(move |outcome: ColumnOutcome| on_each(&outcome)));
            }
            self.scheduler.admit(spec)?;
        }
        Ok(Vec::new())
    }

    /// Loads or generates every column in `positions` with the given
    /// generator parameters and returns them in the same order. Blocks until
    /// all are live.
    pub fn load_area(&self, positions: &[ColumnPos], params: &Tag) -> Result<Vec<Arc<ColumnData>>> {
        self.scheduler
            .load_blocking(positions, Pass::Done, false, params, None)
    }

    /// Generates a column up to `until` without adding it to the live world
    /// or writing it, nor the temporary neighbourhood it needs, to the
    /// store. `on_generated` runs during [`tick`](ChunkStreamer::tick).
    pub fn peek_column(&self, pos: ColumnPos, until: Pass, on_generated: ReadyCallback) -> Result<()> {
        self.ensure_running()?;
        let mut spec = RequestSpec::new(pos, until);
        spec.peek = true;
        spec.waiters.push(on_generated);
        self.scheduler.admit(spec)
    }

    /// [`peek_column`](ChunkStreamer::peek_column) driven on the calling thread
    pub fn peek_column_blocking(&self, pos: ColumnPos, until: Pass) -> Result<Arc<ColumnData>> {
        if let Some(column) = self.scheduler.loaded.try_get(pos) {
            return Ok(column);
        }
        let mut columns = self
            .scheduler
            .load_blocking(&[pos], until, true, &Tag::default(), None)?;
        Ok(columns.remove(0))
    }

    /// Whether the store holds a record of `kind` covering `pos`, without
    /// loading it
    pub fn test_exists(&self, pos: SlabPos, kind: StoredKind) -> Result<bool> {
        let store = &self.scheduler.store;
        let column = pos.column();
        let exists = match kind {
            StoredKind::Chunk => store.chunk_exists(pos)?,
            StoredKind::MapChunk => store.map_chunk_exists(column)?,
            StoredKind::Region => {
                store.region_exists(column.region(self.scheduler.config.region_size))?
            }
        };
        Ok(exists)
    }

    /// Whether the column is live or completely generated in the store
    pub fn is_generated(&self, pos: ColumnPos) -> Result<bool> {
        if self.scheduler.loaded.contains(pos) {
            return Ok(true);
        }
        let Some(bytes) = self.scheduler.store.get_map_chunk_bytes(pos)? else {
            return Ok(false);
        };
        Ok(match MapColumnMetadata::from_bytes(pos, &bytes) {
            Ok(metadata) => metadata.is_current_format() && metadata.pass() == Pass::Done,
            Err(e) => {
                log(format!("Unreadable metadata for {}: {}", pos, e), Warning);
                false
            }
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.scheduler.is_halted() {
            return Err(self.scheduler.fatal_error());
        }
        Ok(())
    }

    pub fn unload_column(&self, pos: ColumnPos) -> Result<bool> {
        self.scheduler.unload_column(pos)
    }

    /// Game-thread step: re-admits deferred requests and hands finished
    /// columns to the live world. Returns how many columns were handed off.
    pub fn tick(&self) -> Result<usize> {
        if let Err(e) = self.scheduler.admit_deferred() {
            if e.is_fatal() {
                self.scheduler.halt(e);
                return Err(self.scheduler.fatal_error());
            }
            log(format!("Deferred admission failed: {}", e), Warning);
        }
        let handed = self.scheduler.hand_off();
        if self.scheduler.metadata_cache_len() > self.scheduler.config.cache_trim_threshold {
            self.scheduler.trim_caches(false)?;
        }
        Ok(handed)
    }

    /// Writes every dirty live column, queued column and region, then drops
    /// cached metadata and regions no tracked column needs. Regions are only
    /// dropped when the workers could be paused.
    pub fn save_dirty(&self) -> Result<usize> {
        let written = self.scheduler.flush_loaded_dirty()? + self.scheduler.flush_queued_dirty()?;
        if written > 0 {
            log(format!("Saved {} dirty records", written), Debug);
        }
        let pause = if self.scheduler.barrier.is_paused() {
            None
        } else {
            self.scheduler.pause_workers().ok()
        };
        self.scheduler.trim_caches(pause.is_some())?;
        Ok(written)
    }

    pub fn set_queue_capacity(&self, capacity: usize) -> Result<()> {
        self.scheduler.set_queue_capacity(capacity)
    }

    /// Parks all worker threads until the guard is dropped
    pub fn pause(&self) -> Result<PauseGuard<'_>> {
        self.scheduler.pause_workers()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn diagnostics(&self) -> String {
        self.scheduler.diagnostics()
    }

    pub fn loaded(&self) -> Arc<LoadedColumns> {
        self.scheduler.loaded.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.scheduler.is_halted()
    }

    /// The error that halted the scheduler, if it halted
    pub fn take_fatal_error(&self) -> Option<StrataError> {
        self.scheduler
            .is_halted()
            .then(|| self.scheduler.fatal_error())
    }

    pub fn config(&self) -> &StreamerConfig {
        self.scheduler.config()
    }
}

/// Every column of the rectangle spanned by two corners, row by row
fn area(first: ColumnPos, last: ColumnPos) -> Vec<ColumnPos> {
    let (x0, x1) = (first.x.min(last.x), first.x.max(last.x));
    let (z0, z1) = (first.z.min(last.z), first.z.max(last.z));
    let mut positions = Vec::with_capacity(((x1 - x0 + 1) * (z1 - z0 + 1)) as usize);
    for z in z0..=z1 {
        for x in x0..=x1 {
            positions.push(ColumnPos::new(x, z, first.dimension));
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area_spans_corners_in_any_order() {
        let a = ColumnPos::new(3, 1, 2);
        let b = ColumnPos::new(2, 2, 2);
        assert_eq!(
            area(a, b),
            vec![
                ColumnPos::new(2, 1, 2),
                ColumnPos::new(3, 1, 2),
                ColumnPos::new(2, 2, 2),
                ColumnPos::new(3, 2, 2),
            ]
        );
        assert_eq!(area(a, a), vec![a]);
    }
}
