use crate::codec::Tag;
use crate::config::StreamerConfig;
use crate::error::{Result, StrataError};
use crate::generation::registry::GeneratorRegistry;
use crate::logger::{log, LogSeverity};
use crate::storage::MemoryColumnStore;
use crate::streamer::ChunkStreamer;
use crate::world::coord::{ColumnPos, SLAB_SIZE};
use crate::world::pass::Pass;
use crate::world::region::GeneratedStructure;
use crate::world::slab::{voxel_index, SKY_LIGHT_MASK};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time::interval;
use LogSeverity::*;

const STONE: u16 = 1;
const GRASS: u16 = 2;
const FLOWER: i32 = 3;
const SURFACE_HEIGHT: usize = 64;
const FULL_SKY_LIGHT: u16 = 15;
const SAVE_INTERVAL: Duration = Duration::from_secs(30);
/// Ticks between two steps of the demo viewer
const VIEWER_STEP_TICKS: u64 = 100;

/// Runs the demo world: an in-memory store, a flat generator and a viewer
/// wandering across the map. Returns on Ctrl-C or a fatal scheduler error.
pub async fn run(config: StreamerConfig) -> Result<()> {
    let store = Arc::new(MemoryColumnStore::new());
    let streamer = Arc::new(ChunkStreamer::new(config.clone(), store, demo_registry()?)?);
    streamer.start()?;
    log(
        format!(
            "Streaming a {}x{} column map with {} worker threads",
            config.map_size_x, config.map_size_z, config.worker_threads
        ),
        Info,
    );

    let mut viewer = ColumnPos::new(config.map_size_x / 2, config.map_size_z / 2, 0);
    let spawn_area = columns_around(viewer, 1, &config);
    let preload = streamer.clone();
    let spawn = task::spawn_blocking(move || preload.load_area(&spawn_area, &Tag::default()))
        .await
        .map_err(|e| StrataError::Halted(e.to_string()))??;
    log(format!("Spawn area ready ({} columns)", spawn.len()), Info);

    let mut ticker = interval(Duration::from_millis(config.tick_interval_ms));
    let mut saver = interval(SAVE_INTERVAL);
    // The first tick of an interval completes immediately
    saver.tick().await;
    let mut ticks: u64 = 0;

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = streamer.tick() {
                    break Err(e);
                }
                if let Some(e) = streamer.take_fatal_error() {
                    break Err(e);
                }
                ticks += 1;
                if ticks % VIEWER_STEP_TICKS == 0 {
                    viewer = step_viewer(viewer, &config);
                    if let Err(e) = stream_around(&streamer, viewer, &config) {
                        break Err(e);
                    }
                }
            }
            _ = saver.tick() => {
                let saving = streamer.clone();
                match task::spawn_blocking(move || saving.save_dirty()).await {
                    Ok(Ok(_)) => {
                        let stats = streamer.stats();
                        log(
                            format!(
                                "{} loaded, {} queued, {} deferred, {} generated, {} passes",
                                stats.loaded, stats.queued, stats.deferred, stats.generated, stats.passes_applied
                            ),
                            Info,
                        );
                    }
                    Ok(Err(e)) => log(format!("Periodic save failed: {}", e), Warning),
                    Err(e) => break Err(StrataError::Halted(e.to_string())),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log("Ctrl-C received, shutting down".to_string(), Info);
                break Ok(());
            }
        }
    };

    let stopping = streamer.clone();
    let shutdown = task::spawn_blocking(move || stopping.shutdown())
        .await
        .map_err(|e| StrataError::Halted(e.to_string()))?;
    result.and(shutdown.map(|_| ()))
}

/// Requests the viewer's surroundings and unloads what fell out of range
fn stream_around(streamer: &ChunkStreamer, viewer: ColumnPos, config: &StreamerConfig) -> Result<()> {
    for pos in columns_around(viewer, config.view_radius, config) {
        streamer.request_column(pos, Pass::Done, Tag::default(), None)?;
    }
    let keep = config.view_radius + 2;
    for pos in streamer.loaded().positions() {
        if (pos.x - viewer.x).abs() > keep || (pos.z - viewer.z).abs() > keep {
            streamer.unload_column(pos)?;
        }
    }
    Ok(())
}

fn step_viewer(viewer: ColumnPos, config: &StreamerConfig) -> ColumnPos {
    let next = ColumnPos::new(viewer.x + 1, viewer.z, viewer.dimension);
    if next.in_bounds(config.map_size_x, config.map_size_z) {
        next
    } else {
        ColumnPos::new(0, viewer.z, viewer.dimension)
    }
}

fn columns_around(center: ColumnPos, radius: i32, config: &StreamerConfig) -> Vec<ColumnPos> {
    let mut positions = Vec::new();
    for z in center.z - radius..=center.z + radius {
        for x in center.x - radius..=center.x + radius {
            let pos = ColumnPos::new(x, z, center.dimension);
            if pos.in_bounds(config.map_size_x, config.map_size_z) {
                positions.push(pos);
            }
        }
    }
    positions
}

/// Deterministic per-column noise for the demo content
fn column_hash(pos: ColumnPos) -> i32 {
    let mut h = (pos.x as u32).wrapping_mul(0x9e37_79b1) ^ (pos.z as u32).wrapping_mul(0x85eb_ca77);
    h ^= h >> 15;
    (h & 0x7fff) as i32
}

/// Flat world: stone with a grass layer, flowers, full sky light above the
/// surface, and a marker structure every few columns.
pub fn demo_registry() -> Result<GeneratorRegistry> {
    let mut registry = GeneratorRegistry::new();
    registry.on_region_generate(|region, _, _, _| {
        region.with_grids_mut(|grids| {
            for (i, climate) in grids.climate.iter_mut().enumerate() {
                *climate = (i as i32 * 7) % 100;
            }
        });
    });

    registry.on_pass(Pass::Terrain, |ctx| {
        let slabs = ctx.column.slabs.read();
        for (sy, slab) in slabs.iter().enumerate() {
            let base = sy * SLAB_SIZE;
            if base >= SURFACE_HEIGHT {
                break;
            }
            slab.with_arrays_mut(|arrays| {
                for y in 0..SLAB_SIZE.min(SURFACE_HEIGHT - base) {
                    let id = if base + y + 1 == SURFACE_HEIGHT { GRASS } else { STONE };
                    for z in 0..SLAB_SIZE {
                        for x in 0..SLAB_SIZE {
                            arrays.blocks[voxel_index(x, y, z)] = id;
                        }
                    }
                }
            })?;
        }
        for z in 0..SLAB_SIZE {
            for x in 0..SLAB_SIZE {
                ctx.column.metadata.set_height(x, z, SURFACE_HEIGHT as u16);
            }
        }
        Ok(())
    })?;

    registry.on_pass(Pass::Vegetation, |ctx| {
        if ctx.region.climate_at(ctx.pos) < 30 {
            return Ok(());
        }
        let slabs = ctx.column.slabs.read();
        let Some(slab) = slabs.get(SURFACE_HEIGHT / SLAB_SIZE) else {
            return Ok(());
        };
        let seed = column_hash(ctx.pos) as usize;
        slab.with_contents_mut(|contents| {
            for i in 0..4 {
                let x = (seed + i * 7) % SLAB_SIZE;
                let z = (seed / 3 + i * 11) % SLAB_SIZE;
                contents.decor.push((voxel_index(x, 0, z) as i32, FLOWER));
            }
        });
        Ok(())
    })?;

    registry.on_pass(Pass::NeighbourSunlightFlood, |ctx| {
        let slabs = ctx.column.slabs.read();
        for (sy, slab) in slabs.iter().enumerate() {
            let base = sy * SLAB_SIZE;
            if base + SLAB_SIZE <= SURFACE_HEIGHT {
                continue;
            }
            slab.with_arrays_mut(|arrays| {
                let start = SURFACE_HEIGHT.saturating_sub(base);
                for y in start..SLAB_SIZE {
                    for z in 0..SLAB_SIZE {
                        for x in 0..SLAB_SIZE {
                            let light = &mut arrays.light[voxel_index(x, y, z)];
                            *light = (*light & !SKY_LIGHT_MASK) | FULL_SKY_LIGHT;
                        }
                    }
                }
            })?;
        }
        Ok(())
    })?;

    registry.on_pass(Pass::Structures, |ctx| {
        if ctx.pos.x % 7 != 0 || ctx.pos.z % 5 != 0 {
            return Ok(());
        }
        let (x, z) = (ctx.pos.x * SLAB_SIZE as i32, ctx.pos.z * SLAB_SIZE as i32);
        let height = SURFACE_HEIGHT as i32;
        let structure = GeneratedStructure {
            column: ctx.pos,
            bbox: [x + 4, height, z + 4, x + 8, height + 6, z + 8],
            code: column_hash(ctx.pos) % 16,
        };
        ctx.region.add_structure(structure.clone());
        ctx.column.metadata.add_structure(structure);
        Ok(())
    })?;

    Ok(registry)
}
