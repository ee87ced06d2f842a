use crate::storage::ColumnStore;
use crate::world::coord::{ColumnPos, RegionPos, SlabPos};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Store that keeps every record in memory. Used by the demo server and tests.
#[derive(Debug)]
pub struct MemoryColumnStore {
    chunks: RwLock<HashMap<SlabPos, Bytes>>,
    map_chunks: RwLock<HashMap<ColumnPos, Bytes>>,
    regions: RwLock<HashMap<RegionPos, Bytes>>,
    free_space: AtomicU64,
}

impl Default for MemoryColumnStore {
    fn default() -> Self {
        MemoryColumnStore {
            chunks: RwLock::new(HashMap::new()),
            map_chunks: RwLock::new(HashMap::new()),
            regions: RwLock::new(HashMap::new()),
            free_space: AtomicU64::new(u64::MAX),
        }
    }
}

impl MemoryColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends the backing volume has `bytes` free
    pub fn set_free_space(&self, bytes: u64) {
        self.free_space.store(bytes, Ordering::Relaxed);
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn map_chunk_count(&self) -> usize {
        self.map_chunks.read().len()
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }
}

impl ColumnStore for MemoryColumnStore {
    fn get_chunk_bytes(&self, pos: SlabPos) -> io::Result<Option<Bytes>> {
        Ok(self.chunks.read().get(&pos).cloned())
    }

    fn set_chunks(&self, records: Vec<(SlabPos, Bytes)>) -> io::Result<()> {
        self.chunks.write().extend(records);
        Ok(())
    }

    fn delete_chunks(&self, positions: &[SlabPos]) -> io::Result<()> {
        let mut chunks = self.chunks.write();
        for pos in positions {
            chunks.remove(pos);
        }
        Ok(())
    }

    fn chunk_exists(&self, pos: SlabPos) -> io::Result<bool> {
        Ok(self.chunks.read().contains_key(&pos))
    }

    fn get_map_chunk_bytes(&self, pos: ColumnPos) -> io::Result<Option<Bytes>> {
        Ok(self.map_chunks.read().get(&pos).cloned())
    }

    fn get_map_chunks_bytes(&self, positions: &[ColumnPos]) -> io::Result<Vec<Option<Bytes>>> {
        let map_chunks = self.map_chunks.read();
        Ok(positions
            .iter()
            .map(|pos| map_chunks.get(pos).cloned())
            .collect())
    }

    fn set_map_chunks(&self, records: Vec<(ColumnPos, Bytes)>) -> io::Result<()> {
        self.map_chunks.write().extend(records);
        Ok(())
    }

    fn delete_map_chunks(&self, positions: &[ColumnPos]) -> io::Result<()> {
        let mut map_chunks = self.map_chunks.write();
        for pos in positions {
            map_chunks.remove(pos);
        }
        Ok(())
    }

    fn map_chunk_exists(&self, pos: ColumnPos) -> io::Result<bool> {
        Ok(self.map_chunks.read().contains_key(&pos))
    }

    fn get_region_bytes(&self, pos: RegionPos) -> io::Result<Option<Bytes>> {
        Ok(self.regions.read().get(&pos).cloned())
    }

    fn set_regions(&self, records: Vec<(RegionPos, Bytes)>) -> io::Result<()> {
        self.regions.write().extend(records);
        Ok(())
    }

    fn delete_regions(&self, positions: &[RegionPos]) -> io::Result<()> {
        let mut regions = self.regions.write();
        for pos in positions {
            regions.remove(pos);
        }
        Ok(())
    }

    fn region_exists(&self, pos: RegionPos) -> io::Result<bool> {
        Ok(self.regions.read().contains_key(&pos))
    }

    fn free_space_bytes(&self) -> io::Result<u64> {
        Ok(self.free_space.load(Ordering::Relaxed))
    }
}
