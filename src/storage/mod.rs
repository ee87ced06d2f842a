pub mod batch;
pub mod memory;

pub use batch::WriteBatch;
pub use memory::MemoryColumnStore;

use crate::world::coord::{ColumnPos, RegionPos, SlabPos};
use bytes::Bytes;
use std::io;

/// The record families a [`ColumnStore`] keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKind {
    Chunk,
    MapChunk,
    Region,
}

/// Key-value storage for slabs ("chunks"), column metadata ("map chunks")
/// and regions. This is all the scheduler knows of persistence; the real
/// database lives outside this crate. Implementations must be safe to call
/// from every scheduler thread at once.
pub trait ColumnStore: Send + Sync {
    fn get_chunk_bytes(&self, pos: SlabPos) -> io::Result<Option<Bytes>>;
    fn set_chunks(&self, records: Vec<(SlabPos, Bytes)>) -> io::Result<()>;
    fn delete_chunks(&self, positions: &[SlabPos]) -> io::Result<()>;
    fn chunk_exists(&self, pos: SlabPos) -> io::Result<bool>;

    fn get_map_chunk_bytes(&self, pos: ColumnPos) -> io::Result<Option<Bytes>>;
    fn set_map_chunks(&self, records: Vec<(ColumnPos, Bytes)>) -> io::Result<()>;
    fn delete_map_chunks(&self, positions: &[ColumnPos]) -> io::Result<()>;
    fn map_chunk_exists(&self, pos: ColumnPos) -> io::Result<bool>;

    /// Bulk metadata read; stores with a cheaper multi-get should override it
    fn get_map_chunks_bytes(&self, positions: &[ColumnPos]) -> io::Result<Vec<Option<Bytes>>> {
        positions
            .iter()
            .map(|pos| self.get_map_chunk_bytes(*pos))
            .collect()
    }

    fn get_region_bytes(&self, pos: RegionPos) -> io::Result<Option<Bytes>>;
    fn set_regions(&self, records: Vec<(RegionPos, Bytes)>) -> io::Result<()>;
    fn delete_regions(&self, positions: &[RegionPos]) -> io::Result<()>;
    fn region_exists(&self, pos: RegionPos) -> io::Result<bool>;

    /// Free space left on the volume backing the store
    fn free_space_bytes(&self) -> io::Result<u64>;
}
