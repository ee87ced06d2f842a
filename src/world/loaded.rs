use crate::world::coord::{ColumnPos, Direction};
use crate::world::metadata::MapColumnMetadata;
use crate::world::slab::VerticalSlab;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// Slabs and metadata of one column, shared between the scheduler and the
/// live world.
#[derive(Debug)]
pub struct ColumnData {
    pub pos: ColumnPos,
    pub slabs: RwLock<Vec<VerticalSlab>>,
    pub metadata: Arc<MapColumnMetadata>,
}

impl ColumnData {
    pub fn new(pos: ColumnPos, slabs: Vec<VerticalSlab>, metadata: Arc<MapColumnMetadata>) -> Self {
        ColumnData {
            pos,
            slabs: RwLock::new(slabs),
            metadata,
        }
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.read().len()
    }

    pub fn has_dirty_slabs(&self) -> bool {
        self.slabs.read().iter().any(|slab| slab.is_dirty())
    }

    /// Block id at column-local block coordinates
    pub fn block(&self, x: usize, y: usize, z: usize) -> io::Result<u16> {
        let size = crate::world::coord::SLAB_SIZE;
        let slabs = self.slabs.read();
        match slabs.get(y / size) {
            Some(slab) => slab.block(x, y % size, z),
            None => Ok(0),
        }
    }
}

/// The live world: columns that finished generation and were handed off.
#[derive(Debug, Default)]
pub struct LoadedColumns {
    columns: RwLock<HashMap<ColumnPos, Arc<ColumnData>>>,
}

impl LoadedColumns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_get(&self, pos: ColumnPos) -> Option<Arc<ColumnData>> {
        self.columns.read().get(&pos).cloned()
    }

    /// Inserts a column and links the neighbour bits in both directions
    pub fn insert(&self, column: Arc<ColumnData>) {
        let mut columns = self.columns.write();
        for direction in Direction::ALL {
            if let Some(neighbour) = columns.get(&column.pos.offset(direction)) {
                column.metadata.set_neighbour_loaded(direction, true);
                neighbour
                    .metadata
                    .set_neighbour_loaded(direction.opposite(), true);
            }
        }
        columns.insert(column.pos, column);
    }

    pub fn remove(&self, pos: ColumnPos) -> Option<Arc<ColumnData>> {
        let mut columns = self.columns.write();
        let removed = columns.remove(&pos)?;
        for direction in Direction::ALL {
            if let Some(neighbour) = columns.get(&pos.offset(direction)) {
                neighbour
                    .metadata
                    .set_neighbour_loaded(direction.opposite(), false);
            }
            removed.metadata.set_neighbour_loaded(direction, false);
        }
        Some(removed)
    }

    pub fn contains(&self, pos: ColumnPos) -> bool {
        self.columns.read().contains_key(&pos)
    }

    pub fn len(&self) -> usize {
        self.columns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn positions(&self) -> Vec<ColumnPos> {
        let mut positions: Vec<ColumnPos> = self.columns.read().keys().copied().collect();
        positions.sort();
        positions
    }
}
