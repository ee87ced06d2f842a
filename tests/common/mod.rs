#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata::generation::GeneratorRegistry;
use strata::storage::{ColumnStore, MemoryColumnStore};
use strata::world::{ColumnPos, RegionPos, SlabPos};
use strata::{ChunkStreamer, Pass, StreamerConfig};

/// In-memory store that counts slab writes
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryColumnStore,
    set_chunks_calls: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_chunks_calls(&self) -> usize {
        self.set_chunks_calls.load(Ordering::SeqCst)
    }

    /// Writes unreadable metadata for every column of the 3×3 block around `center`
    pub fn corrupt_around(&self, center: ColumnPos) {
        let mut records = Vec::new();
        for dz in -1..=1 {
            for dx in -1..=1 {
                let pos = ColumnPos::new(center.x + dx, center.z + dz, center.dimension);
                records.push((pos, Bytes::from_static(&[0xff, 0xff])));
            }
        }
        self.inner.set_map_chunks(records).unwrap();
    }
}

impl ColumnStore for RecordingStore {
    fn get_chunk_bytes(&self, pos: SlabPos) -> io::Result<Option<Bytes>> {
        self.inner.get_chunk_bytes(pos)
    }

    fn set_chunks(&self, records: Vec<(SlabPos, Bytes)>) -> io::Result<()> {
        self.set_chunks_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_chunks(records)
    }

    fn delete_chunks(&self, positions: &[SlabPos]) -> io::Result<()> {
        self.inner.delete_chunks(positions)
    }

    fn chunk_exists(&self, pos: SlabPos) -> io::Result<bool> {
        self.inner.chunk_exists(pos)
    }

    fn get_map_chunk_bytes(&self, pos: ColumnPos) -> io::Result<Option<Bytes>> {
        self.inner.get_map_chunk_bytes(pos)
    }

    fn set_map_chunks(&self, records: Vec<(ColumnPos, Bytes)>) -> io::Result<()> {
        self.inner.set_map_chunks(records)
    }

    fn delete_map_chunks(&self, positions: &[ColumnPos]) -> io::Result<()> {
        self.inner.delete_map_chunks(positions)
    }

    fn map_chunk_exists(&self, pos: ColumnPos) -> io::Result<bool> {
        self.inner.map_chunk_exists(pos)
    }

    fn get_region_bytes(&self, pos: RegionPos) -> io::Result<Option<Bytes>> {
        self.inner.get_region_bytes(pos)
    }

    fn set_regions(&self, records: Vec<(RegionPos, Bytes)>) -> io::Result<()> {
        self.inner.set_regions(records)
    }

    fn delete_regions(&self, positions: &[RegionPos]) -> io::Result<()> {
        self.inner.delete_regions(positions)
    }

    fn region_exists(&self, pos: RegionPos) -> io::Result<bool> {
        self.inner.region_exists(pos)
    }

    fn free_space_bytes(&self) -> io::Result<u64> {
        self.inner.free_space_bytes()
    }
}

/// Which passes ran for which column, plus any neighbour rule violation
/// seen while they ran
#[derive(Default)]
pub struct PassLog {
    applied: Mutex<HashMap<ColumnPos, Vec<Pass>>>,
    violations: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl PassLog {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().clone()
    }

    pub fn applied(&self, pos: ColumnPos) -> Vec<Pass> {
        self.applied.lock().get(&pos).cloned().unwrap_or_default()
    }

    fn record(&self, pos: ColumnPos, pass: Pass, map_size: (i32, i32)) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut applied = self.applied.lock();
        let entry = applied.entry(pos).or_default();
        if entry.last().is_some_and(|last| *last >= pass) {
            self.violations
                .lock()
                .push(format!("{} ran {:?} after {:?}", pos, pass, entry));
        }
        entry.push(pass);

        let need = pass as u8 - 1;
        if need == Pass::None as u8 {
            return;
        }
        for (_, neighbour) in pos.neighbours(map_size.0, map_size.1) {
            let reached = applied
                .get(&neighbour)
                .and_then(|passes| passes.last())
                .map_or(0, |pass| *pass as u8);
            if reached < need {
                self.violations.lock().push(format!(
                    "{} ran {:?} while neighbour {} was at {}",
                    pos, pass, neighbour, reached
                ));
            }
        }
    }
}

pub const ALL_PASSES: [Pass; 5] = [
    Pass::Terrain,
    Pass::Vegetation,
    Pass::NeighbourSunlightFlood,
    Pass::Structures,
    Pass::Done,
];

/// Registry whose callbacks only record what ran
pub fn recording_registry(log: Arc<PassLog>, config: &StreamerConfig) -> GeneratorRegistry {
    let map_size = (config.map_size_x, config.map_size_z);
    let mut registry = GeneratorRegistry::new();
    for pass in ALL_PASSES {
        let log = log.clone();
        registry
            .on_pass(pass, move |ctx| {
                log.record(ctx.pos, ctx.pass, map_size);
                Ok(())
            })
            .unwrap();
    }
    registry
}

pub fn small_config(map_size: i32) -> StreamerConfig {
    StreamerConfig {
        map_size_x: map_size,
        map_size_z: map_size,
        slabs_per_column: 1,
        region_size: 4,
        queue_capacity: 256,
        queue_margin: 4,
        worker_threads: 0,
        min_free_disk_bytes: 0,
        ..StreamerConfig::default()
    }
}

pub fn streamer_with(
    config: StreamerConfig,
    store: Arc<RecordingStore>,
) -> (ChunkStreamer, Arc<PassLog>) {
    let log = Arc::new(PassLog::default());
    let registry = recording_registry(log.clone(), &config);
    let streamer = ChunkStreamer::new(config, store, registry).unwrap();
    (streamer, log)
}

pub fn block_around(center: ColumnPos) -> Vec<ColumnPos> {
    let mut positions = Vec::new();
    for dz in -1..=1 {
        for dx in -1..=1 {
            positions.push(ColumnPos::new(center.x + dx, center.z + dz, center.dimension));
        }
    }
    positions
}
