use crate::codec::compress;
use crate::codec::decoder::invalid;
use crate::codec::{Decoder, Encoder};
use crate::world::coord::{ColumnPos, Direction, SLAB_SIZE};
use crate::world::pass::Pass;
use crate::world::region::GeneratedStructure;
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Bumped whenever generation output changes incompatibly; columns saved
/// with another version are regenerated.
pub const METADATA_FORMAT_VERSION: i32 = 3;

const HEIGHTMAP_SIZE: usize = SLAB_SIZE * SLAB_SIZE;

const TAG_PASS: u8 = 1;
const TAG_NEIGHBOUR_MASK: u8 = 2;
const TAG_HEIGHTMAP: u8 = 3;
const TAG_STRUCTURES: u8 = 4;
const TAG_FORMAT_VERSION: u8 = 5;

/// Mask value once all 8 neighbours are loaded
pub const ALL_NEIGHBOURS: u8 = 0xff;

/// Small per-column record kept apart from the slabs so readiness checks can
/// be answered without loading voxel data.
#[derive(Debug)]
pub struct MapColumnMetadata {
    pub pos: ColumnPos,
    pass: AtomicU8,
    neighbour_mask: AtomicU8,
    heightmap: RwLock<Vec<u16>>,
    structures: RwLock<Vec<GeneratedStructure>>,
    format_version: i32,
    dirty: AtomicBool,
}

impl MapColumnMetadata {
    pub fn new(pos: ColumnPos) -> Self {
        MapColumnMetadata {
            pos,
            pass: AtomicU8::new(Pass::None as u8),
            neighbour_mask: AtomicU8::new(0),
            heightmap: RwLock::new(vec![0; HEIGHTMAP_SIZE]),
            structures: RwLock::new(Vec::new()),
            format_version: METADATA_FORMAT_VERSION,
            dirty: AtomicBool::new(true),
        }
    }

    /// Last pass fully applied to the column
    pub fn pass(&self) -> Pass {
        Pass::from_u8(self.pass.load(Ordering::Acquire)).unwrap_or(Pass::None)
    }

    /// Raises the recorded pass; never lowers it
    pub fn advance_pass(&self, pass: Pass) {
        let previous = self.pass.fetch_max(pass as u8, Ordering::AcqRel);
        if previous < pass as u8 {
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn format_version(&self) -> i32 {
        self.format_version
    }

    pub fn is_current_format(&self) -> bool {
        self.format_version == METADATA_FORMAT_VERSION
    }

    pub fn neighbour_mask(&self) -> u8 {
        self.neighbour_mask.load(Ordering::Acquire)
    }

    pub fn set_neighbour_loaded(&self, direction: Direction, loaded: bool) {
        if loaded {
            self.neighbour_mask.fetch_or(direction.bit(), Ordering::AcqRel);
        } else {
            self.neighbour_mask.fetch_and(!direction.bit(), Ordering::AcqRel);
        }
    }

    pub fn height(&self, x: usize, z: usize) -> u16 {
        self.heightmap.read()[z * SLAB_SIZE + x]
    }

    pub fn set_height(&self, x: usize, z: usize, height: u16) {
        self.heightmap.write()[z * SLAB_SIZE + x] = height;
        self.dirty.store(true, Ordering::Release);
    }

    pub fn add_structure(&self, structure: GeneratedStructure) {
        self.structures.write().push(structure);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn structures(&self) -> Vec<GeneratedStructure> {
        self.structures.read().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn snapshot_for_save(&self) -> io::Result<Option<Vec<u8>>> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(None);
        }
        match self.to_bytes() {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut encoder = Encoder::new(Vec::new());
        encoder.tag(TAG_PASS)?.u8(self.pass() as u8)?;
        encoder.tag(TAG_NEIGHBOUR_MASK)?.u8(self.neighbour_mask())?;
        let heightmap = compress::compress_u16(&self.heightmap.read())?;
        encoder.tag(TAG_HEIGHTMAP)?.bytes(&heightmap)?;
        let structures = self.structures.read();
        encoder.tag(TAG_STRUCTURES)?.count(structures.len())?;
        for structure in structures.iter() {
            structure.write(&mut encoder)?;
        }
        encoder.tag(TAG_FORMAT_VERSION)?.i32(self.format_version)?;
        encoder.finish()
    }

    pub fn from_bytes(pos: ColumnPos, data: &[u8]) -> io::Result<MapColumnMetadata> {
        let mut metadata = MapColumnMetadata::new(pos);
        // Records without a version field predate versioning
        metadata.format_version = 0;
        let mut decoder = Decoder::new(data);
        while let Some(tag) = decoder.next_tag()? {
            match tag {
                TAG_PASS => {
                    let raw = decoder.u8()?;
                    let pass = Pass::from_u8(raw)
                        .ok_or_else(|| invalid(format!("invalid pass {}", raw)))?;
                    metadata.pass = AtomicU8::new(pass as u8);
                }
                TAG_NEIGHBOUR_MASK => metadata.neighbour_mask = AtomicU8::new(decoder.u8()?),
                TAG_HEIGHTMAP => {
                    let packed = decoder.bytes()?;
                    metadata.heightmap =
                        RwLock::new(compress::decompress_u16(&packed, HEIGHTMAP_SIZE)?);
                }
                TAG_STRUCTURES => {
                    let count = decoder.count()?;
                    let mut structures = Vec::with_capacity(count);
                    for _ in 0..count {
                        structures.push(GeneratedStructure::read(&mut decoder)?);
                    }
                    metadata.structures = RwLock::new(structures);
                }
                TAG_FORMAT_VERSION => metadata.format_version = decoder.i32()?,
                other => return Err(invalid(format!("unknown metadata field tag {}", other))),
            }
        }
        decoder.expect_end()?;
        metadata.dirty = AtomicBool::new(false);
        Ok(metadata)
    }
}
