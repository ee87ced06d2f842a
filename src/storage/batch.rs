use crate::storage::ColumnStore;
use crate::world::coord::{ColumnPos, RegionPos, SlabPos};
use bytes::Bytes;
use std::io;

/// Buffers records and hands them to the store in groups of `flush_every`.
pub struct WriteBatch<'a> {
    store: &'a dyn ColumnStore,
    flush_every: usize,
    chunks: Vec<(SlabPos, Bytes)>,
    map_chunks: Vec<(ColumnPos, Bytes)>,
    regions: Vec<(RegionPos, Bytes)>,
    written: usize,
}

impl<'a> WriteBatch<'a> {
    pub fn new(store: &'a dyn ColumnStore, flush_every: usize) -> Self {
        WriteBatch {
            store,
            flush_every: flush_every.max(1),
            chunks: Vec::new(),
            map_chunks: Vec::new(),
            regions: Vec::new(),
            written: 0,
        }
    }

    /// Copies an encoded slab out of a scratch buffer the caller keeps reusing
    pub fn push_chunk(&mut self, pos: SlabPos, bytes: &[u8]) -> io::Result<()> {
        self.chunks.push((pos, Bytes::copy_from_slice(bytes)));
        self.flush_if_full()
    }

    pub fn push_map_chunk(&mut self, pos: ColumnPos, bytes: Vec<u8>) -> io::Result<()> {
        self.map_chunks.push((pos, Bytes::from(bytes)));
        self.flush_if_full()
    }

    pub fn push_region(&mut self, pos: RegionPos, bytes: Vec<u8>) -> io::Result<()> {
        self.regions.push((pos, Bytes::from(bytes)));
        self.flush_if_full()
    }

    fn pending(&self) -> usize {
        self.chunks.len() + self.map_chunks.len() + self.regions.len()
    }

    fn flush_if_full(&mut self) -> io::Result<()> {
        if self.pending() >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.written += self.pending();
        if !self.chunks.is_empty() {
            self.store.set_chunks(std::mem::take(&mut self.chunks))?;
        }
        if !self.map_chunks.is_empty() {
            self.store.set_map_chunks(std::mem::take(&mut self.map_chunks))?;
        }
        if !self.regions.is_empty() {
            self.store.set_regions(std::mem::take(&mut self.regions))?;
        }
        Ok(())
    }

    /// Flushes what is left; returns the number of records written
    pub fn finish(mut self) -> io::Result<usize> {
        self.flush()?;
        Ok(self.written)
    }
}
