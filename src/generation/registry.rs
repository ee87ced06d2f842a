use crate::codec::Tag;
use crate::error::{Result, StrataError};
use crate::world::coord::ColumnPos;
use crate::world::loaded::ColumnData;
use crate::world::metadata::MapColumnMetadata;
use crate::world::pass::{Pass, TRANSITION_COUNT};
use crate::world::region::Region;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// What a pass callback gets to work on
pub struct PassContext<'a> {
    pub pos: ColumnPos,
    /// The pass being applied
    pub pass: Pass,
    pub column: &'a ColumnData,
    pub region: &'a Region,
    pub params: &'a Tag,
}

type RegionCallback = Box<dyn Fn(&Region, i32, i32, &Tag) + Send + Sync>;
type MapChunkCallback = Box<dyn Fn(&MapColumnMetadata, i32, i32) + Send + Sync>;
type PassCallback = Box<dyn Fn(&mut PassContext<'_>) -> Result<()> + Send + Sync>;
type LoadedCallback = Box<dyn Fn(&ColumnData) + Send + Sync>;

/// Content hooks. Generation itself is opaque to the scheduler; it only
/// decides when each hook may run.
#[derive(Default)]
pub struct GeneratorRegistry {
    region: Vec<RegionCallback>,
    map_chunk: Vec<MapChunkCallback>,
    passes: [Vec<PassCallback>; TRANSITION_COUNT as usize],
    loaded: Vec<LoadedCallback>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs once per newly created region with the region's coordinates
    pub fn on_region_generate<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Region, i32, i32, &Tag) + Send + Sync + 'static,
    {
        self.region.push(Box::new(callback));
        self
    }

    /// Runs once per newly created column metadata
    pub fn on_map_chunk_generate<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&MapColumnMetadata, i32, i32) + Send + Sync + 'static,
    {
        self.map_chunk.push(Box::new(callback));
        self
    }

    /// Registers a callback that applies `pass` (Terrain through Done)
    pub fn on_pass<F>(&mut self, pass: Pass, callback: F) -> Result<&mut Self>
    where
        F: Fn(&mut PassContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        if pass == Pass::None {
            return Err(StrataError::Generator(
                "no callbacks can be registered for Pass::None".to_string(),
            ));
        }
        self.passes[pass as usize - 1].push(Box::new(callback));
        Ok(self)
    }

    /// Runs on the main thread when a finished column joins the live world
    pub fn on_column_loaded<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&ColumnData) + Send + Sync + 'static,
    {
        self.loaded.push(Box::new(callback));
        self
    }

    pub fn run_region(&self, region: &Region, params: &Tag) -> Vec<String> {
        let (x, z) = (region.pos.x, region.pos.z);
        self.region
            .iter()
            .filter_map(|callback| {
                guarded(|| {
                    callback(region, x, z, params);
                    Ok(())
                })
                .err()
            })
            .collect()
    }

    pub fn run_map_chunk(&self, metadata: &MapColumnMetadata) -> Vec<String> {
        let (x, z) = (metadata.pos.x, metadata.pos.z);
        self.map_chunk
            .iter()
            .filter_map(|callback| {
                guarded(|| {
                    callback(metadata, x, z);
                    Ok(())
                })
                .err()
            })
            .collect()
    }

    /// Runs every callback of `ctx.pass`. A failing callback does not stop
    /// the others; each failure is returned.
    pub fn run_pass(&self, ctx: &mut PassContext<'_>) -> Vec<StrataError> {
        let Some(callbacks) = (ctx.pass as usize).checked_sub(1).and_then(|i| self.passes.get(i))
        else {
            return Vec::new();
        };
        let mut failures = Vec::new();
        for callback in callbacks {
            if let Err(reason) = guarded(|| callback(ctx)) {
                failures.push(StrataError::GeneratorCallbackFailure {
                    pos: ctx.pos,
                    pass: ctx.pass,
                    reason,
                });
            }
        }
        failures
    }

    pub fn run_loaded(&self, column: &ColumnData) -> Vec<String> {
        self.loaded
            .iter()
            .filter_map(|callback| {
                guarded(|| {
                    callback(column);
                    Ok(())
                })
                .err()
            })
            .collect()
    }

    pub fn pass_callback_count(&self, pass: Pass) -> usize {
        (pass as usize)
            .checked_sub(1)
            .and_then(|i| self.passes.get(i))
            .map_or(0, Vec::len)
    }
}

/// Runs content code, turning both errors and panics into a message
fn guarded<F>(f: F) -> std::result::Result<(), String>
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
