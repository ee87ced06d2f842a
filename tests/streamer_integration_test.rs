mod common;

use assert_matches::assert_matches;
use common::*;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strata::codec::Tag;
use strata::generation::{AreaCallback, GeneratorRegistry};
use strata::storage::ColumnStore;
use strata::world::MapColumnMetadata;
use strata::{ChunkStreamer, ColumnOutcome, ColumnPos, Pass, StoredKind, StrataError};
use tokio_test::{assert_err, assert_ok};

fn pos(x: i32, z: i32) -> ColumnPos {
    ColumnPos::new(x, z, 0)
}

#[test]
fn test_fresh_column_is_generated_and_persisted() {
    let store = RecordingStore::new();
    let (streamer, log) = streamer_with(small_config(8), store.clone());

    let columns = streamer.load_area(&[pos(0, 0)], &Tag::default()).unwrap();
    assert_eq!(columns.len(), 1);
    assert_eq!(columns[0].pos, pos(0, 0));
    assert_eq!(columns[0].metadata.pass(), Pass::Done);
    assert!(streamer.loaded().contains(pos(0, 0)));
    assert!(store.set_chunks_calls() > 0);
    assert!(store.inner.map_chunk_exists(pos(0, 0)).unwrap());
    assert_eq!(log.applied(pos(0, 0)), ALL_PASSES.to_vec());
    assert!(log.violations().is_empty(), "{:?}", log.violations());
    assert!(streamer.is_generated(pos(0, 0)).unwrap());
    assert!(streamer.test_exists(pos(0, 0).slab(0), StoredKind::Chunk).unwrap());
    assert!(streamer.test_exists(pos(0, 0).slab(0), StoredKind::MapChunk).unwrap());
    assert!(streamer.test_exists(pos(0, 0).slab(0), StoredKind::Region).unwrap());
    assert!(!streamer.test_exists(pos(0, 0).slab(1), StoredKind::Chunk).unwrap());
    assert!(!streamer.test_exists(pos(7, 7).slab(0), StoredKind::MapChunk).unwrap());
    assert!(!streamer.test_exists(pos(7, 7).slab(0), StoredKind::Region).unwrap());
}

#[test]
fn test_corrupt_neighbourhood_halts_outside_repair_mode() {
    let store = RecordingStore::new();
    store.corrupt_around(pos(4, 4));
    let (streamer, _) = streamer_with(small_config(8), store);

    let result = streamer.load_area(&[pos(4, 4)], &Tag::default());
    assert_matches!(result, Err(StrataError::LoadCorruption { pos: p, .. }) if p == pos(4, 4));
    assert!(streamer.is_halted());
    assert_matches!(
        streamer.request_column(pos(1, 1), Pass::Done, Tag::default(), None),
        Err(StrataError::Halted(_))
    );
}

#[test]
fn test_corrupt_neighbourhood_is_regenerated_in_repair_mode() {
    let store = RecordingStore::new();
    store.corrupt_around(pos(4, 4));
    let mut config = small_config(8);
    config.repair_mode = true;
    let (streamer, log) = streamer_with(config, store);

    let columns = streamer.load_area(&[pos(4, 4)], &Tag::default()).unwrap();
    assert_eq!(columns[0].metadata.pass(), Pass::Done);
    assert!(!streamer.is_halted());
    assert!(log.violations().is_empty(), "{:?}", log.violations());
}

#[test]
fn test_capacity_overflow_flushes_once_and_loads_everything() {
    let store = RecordingStore::new();
    let mut config = small_config(3);
    config.queue_capacity = 8;
    config.queue_margin = 0;
    let (streamer, log) = streamer_with(config, store);

    let area = block_around(pos(1, 1));
    let columns = streamer.load_area(&area, &Tag::default()).unwrap();
    assert_eq!(columns.len(), 9);
    for (column, expected) in columns.iter().zip(&area) {
        assert_eq!(column.pos, *expected);
        assert_eq!(column.metadata.pass(), Pass::Done);
    }

    let stats = streamer.stats();
    assert_eq!(stats.backpressure_flushes, 1);
    assert_eq!(stats.loaded, 9);
    assert!(stats.queued <= 8);
    assert!(log.violations().is_empty(), "{:?}", log.violations());
}

#[test]
fn test_passes_are_monotonic_and_respect_neighbours() {
    let store = RecordingStore::new();
    let mut config = small_config(12);
    config.worker_threads = 3;
    let (streamer, log) = streamer_with(config, store);
    streamer.start().unwrap();

    let area = block_around(pos(6, 6));
    let columns = streamer.load_area(&area, &Tag::default()).unwrap();
    assert_eq!(columns.len(), 9);
    streamer.shutdown().unwrap();

    assert!(log.violations().is_empty(), "{:?}", log.violations());
    for pos in area {
        assert_eq!(log.applied(pos), ALL_PASSES.to_vec());
    }
}

#[test]
fn test_no_callbacks_run_while_paused() {
    let store = RecordingStore::new();
    let mut config = small_config(16);
    config.worker_threads = 2;
    let (streamer, log) = streamer_with(config, store);
    streamer.start().unwrap();

    for z in 2..14 {
        for x in 2..14 {
            streamer.request_column(pos(x, z), Pass::Done, Tag::default(), None).unwrap();
        }
    }
    for _ in 0..5 {
        let guard = streamer.pause().unwrap();
        let before = log.calls();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(log.calls(), before);
        drop(guard);
        thread::sleep(Duration::from_millis(5));
    }
    streamer.shutdown().unwrap();
    assert!(log.violations().is_empty(), "{:?}", log.violations());
}

#[test]
fn test_peek_is_neither_loaded_nor_persisted() {
    let store = RecordingStore::new();
    let (streamer, _) = streamer_with(small_config(8), store.clone());

    let column = streamer.peek_column_blocking(pos(3, 3), Pass::Done).unwrap();
    assert_eq!(column.metadata.pass(), Pass::Done);
    assert!(!streamer.loaded().contains(pos(3, 3)));
    assert!(!streamer.is_generated(pos(3, 3)).unwrap());

    // The neighbourhood generated for the peek is gone and stays unsaved
    assert_eq!(streamer.stats().queued, 0);
    streamer.save_dirty().unwrap();
    for x in 0..8 {
        for z in 0..8 {
            assert!(!store.inner.map_chunk_exists(pos(x, z)).unwrap(), "{}", pos(x, z));
        }
    }
    assert_eq!(store.set_chunks_calls(), 0);

    streamer.load_area(&[pos(3, 3)], &Tag::default()).unwrap();
    assert!(streamer.loaded().contains(pos(3, 3)));
    assert!(streamer.is_generated(pos(3, 3)).unwrap());
}

#[test]
fn test_unloaded_column_resumes_from_store() {
    let store = RecordingStore::new();
    let (streamer, log) = streamer_with(small_config(8), store);

    streamer.load_area(&[pos(2, 5)], &Tag::default()).unwrap();
    assert!(streamer.unload_column(pos(2, 5)).unwrap());
    assert!(!streamer.loaded().contains(pos(2, 5)));
    assert!(streamer.is_generated(pos(2, 5)).unwrap());

    streamer.load_area(&[pos(2, 5)], &Tag::default()).unwrap();
    assert_eq!(log.applied(pos(2, 5)), ALL_PASSES.to_vec());
    assert!(streamer.stats().loaded_from_store >= 1);
}

#[test]
fn test_terrain_failure_is_retried_then_reported() {
    let store = RecordingStore::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut registry = GeneratorRegistry::new();
    registry
        .on_pass(Pass::Terrain, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StrataError::Generator("bedrock missing".to_string()))
        })
        .unwrap();
    let streamer = ChunkStreamer::new(small_config(8), store, registry).unwrap();

    let result = streamer.load_area(&[pos(1, 1)], &Tag::default());
    assert_matches!(
        result,
        Err(StrataError::GeneratorCallbackFailure { pass: Pass::Terrain, .. })
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(streamer.stats().terrain_retries, 2);
    assert!(!streamer.is_halted());
}

#[test]
fn test_low_disk_space_is_fatal() {
    let store = RecordingStore::new();
    store.inner.set_free_space(1024);
    let mut config = small_config(8);
    config.min_free_disk_bytes = 1 << 20;
    let (streamer, _) = streamer_with(config, store);

    let result = streamer.load_area(&[pos(0, 0)], &Tag::default());
    assert_matches!(result, Err(StrataError::DiskPressure { free: 1024, .. }));
    assert!(streamer.is_halted());
}

#[test]
fn test_ready_callback_runs_on_tick() {
    let store = RecordingStore::new();
    let mut config = small_config(8);
    config.worker_threads = 1;
    let (streamer, _) = streamer_with(config, store);
    streamer.start().unwrap();

    let ready = Arc::new(Mutex::new(None));
    let sink = ready.clone();
    streamer
        .request_column(
            pos(5, 2),
            Pass::Done,
            Tag::default(),
            Some(Box::new(move |outcome: ColumnOutcome| {
                *sink.lock() = Some(outcome)
            })),
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while ready.lock().is_none() {
        assert!(Instant::now() < deadline, "{}", streamer.diagnostics());
        streamer.tick().unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    assert_matches!(ready.lock().take(), Some(ColumnOutcome::Ready(column)) if column.pos == pos(5, 2));
    assert!(streamer.loaded().contains(pos(5, 2)));
    streamer.shutdown().unwrap();
}

#[test]
fn test_out_of_bounds_request_is_rejected() {
    let (streamer, _) = streamer_with(small_config(4), RecordingStore::new());
    assert_err!(streamer.request_column(pos(4, 0), Pass::Done, Tag::default(), None));
    assert_matches!(
        streamer.load_area(&[pos(0, -1)], &Tag::default()),
        Err(StrataError::OutOfBounds { .. })
    );
}

#[tokio::test]
async fn test_concurrent_blocking_loads() {
    let store = RecordingStore::new();
    let mut config = small_config(16);
    config.worker_threads = 2;
    let (streamer, log) = streamer_with(config, store);
    let streamer = Arc::new(streamer);
    streamer.start().unwrap();

    let centers = [pos(3, 3), pos(12, 3), pos(3, 12), pos(12, 12)];
    let handles = centers.iter().map(|center| {
        let streamer = streamer.clone();
        let area = block_around(*center);
        tokio::task::spawn_blocking(move || streamer.load_area(&area, &Tag::default()))
    });
    let results = join_all(handles).await;

    for result in results {
        let columns = assert_ok!(assert_ok!(result));
        assert_eq!(columns.len(), 9);
    }
    assert_eq!(streamer.loaded().len(), 36);
    assert!(log.violations().is_empty(), "{:?}", log.violations());
    assert_ok!(streamer.shutdown());
}

#[test]
fn test_unloaded_queued_column_keeps_its_progress() {
    let store = RecordingStore::new();
    let (streamer, log) = streamer_with(small_config(8), store.clone());

    let columns = streamer
        .request_area(pos(0, 0), pos(0, 0), Pass::Terrain, true, None)
        .unwrap();
    assert_eq!(columns[0].metadata.pass(), Pass::Terrain);
    assert!(!streamer.loaded().contains(pos(0, 0)));
    assert!(!store.inner.map_chunk_exists(pos(0, 0)).unwrap());

    assert!(streamer.unload_column(pos(0, 0)).unwrap());
    // Any blocking load drains the unloaded request from the queue
    streamer.load_area(&[pos(7, 7)], &Tag::default()).unwrap();
    let bytes = store.inner.get_map_chunk_bytes(pos(0, 0)).unwrap().unwrap();
    let metadata = MapColumnMetadata::from_bytes(pos(0, 0), &bytes).unwrap();
    assert_eq!(metadata.pass(), Pass::Terrain);
    assert!(store.inner.chunk_exists(pos(0, 0).slab(0)).unwrap());

    streamer.load_area(&[pos(0, 0)], &Tag::default()).unwrap();
    assert_eq!(log.applied(pos(0, 0)), ALL_PASSES.to_vec());
    assert!(streamer.stats().resumed >= 1);
}

#[test]
fn test_disposal_under_disk_pressure_is_fatal() {
    let store = RecordingStore::new();
    let mut config = small_config(8);
    config.min_free_disk_bytes = 1 << 20;
    let (streamer, _) = streamer_with(config, store.clone());

    streamer
        .request_area(pos(0, 0), pos(0, 0), Pass::Terrain, true, None)
        .unwrap();
    assert!(streamer.unload_column(pos(0, 0)).unwrap());
    store.inner.set_free_space(1024);
    assert_matches!(
        streamer.load_area(&[pos(7, 7)], &Tag::default()),
        Err(StrataError::DiskPressure { free: 1024, .. })
    );
    assert!(streamer.is_halted());
}

#[test]
fn test_area_request_reports_each_column() {
    let store = RecordingStore::new();
    let mut config = small_config(8);
    config.worker_threads = 1;
    let (streamer, _) = streamer_with(config, store);
    streamer.start().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let on_each: AreaCallback = Arc::new(move |outcome: &ColumnOutcome| {
        if let ColumnOutcome::Ready(column) = outcome {
            sink.lock().push(column.pos);
        }
    });
    let columns = streamer
        .request_area(pos(2, 3), pos(1, 1), Pass::Done, false, Some(on_each))
        .unwrap();
    assert!(columns.is_empty());

    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.lock().len() < 6 {
        assert!(Instant::now() < deadline, "{}", streamer.diagnostics());
        streamer.tick().unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    let mut seen = seen.lock().clone();
    seen.sort_by_key(|pos| (pos.z, pos.x));
    assert_eq!(
        seen,
        vec![pos(1, 1), pos(2, 1), pos(1, 2), pos(2, 2), pos(1, 3), pos(2, 3)]
    );
    streamer.shutdown().unwrap();
}

#[test]
fn test_peek_up_to_a_pass() {
    let store = RecordingStore::new();
    let (streamer, log) = streamer_with(small_config(8), store.clone());

    let column = streamer
        .peek_column_blocking(pos(4, 4), Pass::Vegetation)
        .unwrap();
    assert_eq!(column.metadata.pass(), Pass::Vegetation);
    assert_eq!(log.applied(pos(4, 4)), ALL_PASSES[..2].to_vec());
    assert_eq!(streamer.stats().queued, 0);
    assert_eq!(store.set_chunks_calls(), 0);
}

#[test]
fn test_later_pass_failure_still_reaches_done() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let mut registry = GeneratorRegistry::new();
    registry
        .on_pass(Pass::Vegetation, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StrataError::Generator("no seeds".to_string()))
        })
        .unwrap();
    let streamer = ChunkStreamer::new(small_config(8), RecordingStore::new(), registry).unwrap();

    let columns = streamer.load_area(&[pos(4, 4)], &Tag::default()).unwrap();
    assert_eq!(columns[0].metadata.pass(), Pass::Done);
    assert!(!streamer.is_halted());
    let failed = failures.load(Ordering::SeqCst) as u64;
    assert!(failed >= 9);
    assert_eq!(streamer.stats().callback_failures, failed);
}

#[test]
fn test_blocking_load_reports_stall() {
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let (inside, gate) = (entered.clone(), release.clone());
    let mut registry = GeneratorRegistry::new();
    registry
        .on_pass(Pass::Vegetation, move |ctx| {
            if ctx.pos == pos(4, 4) {
                inside.store(true, Ordering::SeqCst);
                while !gate.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            Ok(())
        })
        .unwrap();
    let mut config = small_config(8);
    config.blocking_stall_timeout_ms = 150;
    let streamer = Arc::new(ChunkStreamer::new(config, RecordingStore::new(), registry).unwrap());

    let first = {
        let streamer = streamer.clone();
        thread::spawn(move || streamer.load_area(&[pos(4, 4)], &Tag::default()))
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    while !entered.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }

    // The column is held by the first caller, so this one cannot move it
    let result = streamer.load_area(&[pos(4, 4)], &Tag::default());
    release.store(true, Ordering::SeqCst);
    assert_matches!(
        result,
        Err(StrataError::SchedulerStall { ref diagnostics, .. })
            if diagnostics.contains(&format!("queued {}", pos(4, 4))) && diagnostics.contains("claimed=true")
    );

    let columns = first.join().unwrap().unwrap();
    assert_eq!(columns[0].metadata.pass(), Pass::Done);
}

#[test]
fn test_idle_caches_are_dropped_after_save() {
    let store = RecordingStore::new();
    let (streamer, _) = streamer_with(small_config(1), store.clone());

    streamer.load_area(&[pos(0, 0)], &Tag::default()).unwrap();
    let stats = streamer.stats();
    assert_eq!(stats.cached_metadata, 1);
    assert_eq!(stats.cached_regions, 1);

    assert!(streamer.unload_column(pos(0, 0)).unwrap());
    streamer.save_dirty().unwrap();
    let stats = streamer.stats();
    assert_eq!(stats.cached_metadata, 0);
    assert_eq!(stats.cached_regions, 0);
    assert!(store.inner.region_exists(pos(0, 0).region(4)).unwrap());

    streamer.load_area(&[pos(0, 0)], &Tag::default()).unwrap();
    assert_eq!(streamer.stats().loaded_from_store, 1);
}
