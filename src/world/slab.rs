use crate::codec::compress::{self, COMPRESSION_VERSION};
use crate::codec::decoder::invalid;
use crate::codec::{Decoder, Encoder, Tag};
use crate::world::coord::{SLAB_SIZE, SLAB_VOLUME};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io;

// Field tags of the packed slab record. Order and ids are part of the save format.
const TAG_BLOCKS: u8 = 1;
const TAG_LIGHT: u8 = 2;
const TAG_LIGHT_SATURATION: u8 = 3;
const TAG_ENTITIES: u8 = 4;
const TAG_BLOCK_ENTITIES: u8 = 5;
const TAG_MOD_DATA: u8 = 6;
const TAG_LIGHT_POSITIONS: u8 = 7;
const TAG_SERVER_MOD_DATA: u8 = 8;
const TAG_CREATED_VERSION: u8 = 9;
const TAG_EMPTY: u8 = 10;
const TAG_DECOR: u8 = 11;
const TAG_COMPRESSION_VERSION: u8 = 12;
const TAG_LIQUIDS: u8 = 13;
const TAG_BLOCK_COUNTERS: u8 = 14;

/// Mask of the sky light bits inside a light value
pub const SKY_LIGHT_MASK: u16 = 0x1f;

/// Uncompressed voxel arrays of one slab
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelArrays {
    pub blocks: Vec<u16>,
    /// Low 5 bits sky light, remaining bits block light
    pub light: Vec<u16>,
    pub light_saturation: Vec<u8>,
    pub liquids: Vec<u16>,
}

impl VoxelArrays {
    pub fn new() -> Self {
        VoxelArrays {
            blocks: vec![0; SLAB_VOLUME],
            light: vec![0; SLAB_VOLUME],
            light_saturation: vec![0; SLAB_VOLUME],
            liquids: vec![0; SLAB_VOLUME],
        }
    }

    pub fn clear(&mut self) {
        self.blocks.fill(0);
        self.light.fill(0);
        self.light_saturation.fill(0);
        self.liquids.fill(0);
    }

    fn is_air(&self) -> bool {
        self.blocks.iter().all(|&id| id == 0)
    }

    fn pack(&self) -> io::Result<PackedArrays> {
        Ok(PackedArrays {
            blocks: compress::compress_u16(&self.blocks)?,
            light: compress::compress_u16(&self.light)?,
            light_saturation: compress::compress_bytes(&self.light_saturation)?,
            liquids: compress::compress_u16(&self.liquids)?,
        })
    }

    fn unpack(packed: &PackedArrays) -> io::Result<VoxelArrays> {
        Ok(VoxelArrays {
            blocks: compress::decompress_u16(&packed.blocks, SLAB_VOLUME)?,
            light: compress::decompress_u16(&packed.light, SLAB_VOLUME)?,
            light_saturation: compress::decompress_bytes(&packed.light_saturation, SLAB_VOLUME)?,
            liquids: compress::decompress_u16(&packed.liquids, SLAB_VOLUME)?,
        })
    }
}

impl Default for VoxelArrays {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PackedArrays {
    blocks: Vec<u8>,
    light: Vec<u8>,
    light_saturation: Vec<u8>,
    liquids: Vec<u8>,
}

#[derive(Debug)]
enum Voxels {
    Unpacked(Box<VoxelArrays>),
    Packed(PackedArrays),
}

/// Everything in a slab besides the voxel arrays
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlabContents {
    pub entities: Vec<Tag>,
    /// Keyed by voxel index
    pub block_entities: BTreeMap<i32, Tag>,
    pub mod_data: BTreeMap<String, Vec<u8>>,
    pub light_positions: BTreeSet<i32>,
    pub server_mod_data: BTreeMap<String, Vec<u8>>,
    pub created_version: String,
    /// (voxel index, decor id)
    pub decor: Vec<(i32, i32)>,
    pub blocks_placed: i32,
    pub blocks_removed: i32,
}

#[derive(Debug)]
struct SlabInner {
    voxels: Voxels,
    contents: SlabContents,
    /// Cached "all air" flag, refreshed whenever the arrays are packed or encoded
    empty: bool,
    compression_version: i32,
    dirty_for_saving: bool,
}

/// One 32³ block of a column.
///
/// The voxel arrays are held either unpacked or packed; the slab mutex guards
/// the switch between the two and keeps encoding and clearing the dirty flag
/// in one critical section.
#[derive(Debug)]
pub struct VerticalSlab {
    inner: Mutex<SlabInner>,
}

pub fn voxel_index(x: usize, y: usize, z: usize) -> usize {
    (y * SLAB_SIZE + z) * SLAB_SIZE + x
}

impl VerticalSlab {
    /// New dirty slab over the given (already cleared) arrays
    pub fn new(arrays: Box<VoxelArrays>, created_version: &str) -> Self {
        VerticalSlab {
            inner: Mutex::new(SlabInner {
                voxels: Voxels::Unpacked(arrays),
                contents: SlabContents {
                    created_version: created_version.to_string(),
                    ..SlabContents::default()
                },
                empty: true,
                compression_version: COMPRESSION_VERSION,
                dirty_for_saving: true,
            }),
        }
    }

    pub fn block(&self, x: usize, y: usize, z: usize) -> io::Result<u16> {
        let mut inner = self.inner.lock();
        Ok(inner.arrays_mut()?.blocks[voxel_index(x, y, z)])
    }

    pub fn set_block(&self, x: usize, y: usize, z: usize, id: u16) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let index = voxel_index(x, y, z);
        let previous = std::mem::replace(&mut inner.arrays_mut()?.blocks[index], id);
        if previous == id {
            return Ok(());
        }
        if previous == 0 {
            inner.contents.blocks_placed += 1;
        } else if id == 0 {
            inner.contents.blocks_removed += 1;
        }
        if id != 0 {
            inner.empty = false;
        }
        inner.dirty_for_saving = true;
        Ok(())
    }

    pub fn sky_light(&self, x: usize, y: usize, z: usize) -> io::Result<u16> {
        let mut inner = self.inner.lock();
        Ok(inner.arrays_mut()?.light[voxel_index(x, y, z)] & SKY_LIGHT_MASK)
    }

    /// Runs `f` over the unpacked arrays and marks the slab dirty
    pub fn with_arrays_mut<R>(&self, f: impl FnOnce(&mut VoxelArrays) -> R) -> io::Result<R> {
        let mut inner = self.inner.lock();
        let result = f(inner.arrays_mut()?);
        inner.dirty_for_saving = true;
        Ok(result)
    }

    /// Runs `f` over the non-voxel contents and marks the slab dirty
    pub fn with_contents_mut<R>(&self, f: impl FnOnce(&mut SlabContents) -> R) -> R {
        let mut inner = self.inner.lock();
        inner.dirty_for_saving = true;
        f(&mut inner.contents)
    }

    pub fn with_contents<R>(&self, f: impl FnOnce(&SlabContents) -> R) -> R {
        f(&self.inner.lock().contents)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty_for_saving
    }

    pub fn mark_dirty(&self) {
        self.inner.lock().dirty_for_saving = true;
    }

    pub fn is_packed(&self) -> bool {
        matches!(self.inner.lock().voxels, Voxels::Packed(_))
    }

    /// Swaps the unpacked arrays for their compressed form. Returns the
    /// released arrays so the caller can recycle them.
    pub fn pack(&self) -> io::Result<Option<Box<VoxelArrays>>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let packed = match &inner.voxels {
            Voxels::Packed(_) => return Ok(None),
            Voxels::Unpacked(arrays) => {
                inner.empty = arrays.is_air();
                arrays.pack()?
            }
        };
        match std::mem::replace(&mut inner.voxels, Voxels::Packed(packed)) {
            Voxels::Unpacked(arrays) => Ok(Some(arrays)),
            Voxels::Packed(_) => Ok(None),
        }
    }

    pub fn unpack(&self) -> io::Result<()> {
        self.inner.lock().arrays_mut().map(|_| ())
    }

    /// Encodes the slab into `buffer` if it has unsaved changes and clears
    /// the dirty flag under the same lock, so a write landing between the two
    /// is never lost. Returns false, leaving `buffer` alone, when clean.
    pub fn snapshot_for_save(&self, buffer: &mut Vec<u8>) -> io::Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.dirty_for_saving {
            return Ok(false);
        }
        *buffer = inner.encode(std::mem::take(buffer))?;
        inner.dirty_for_saving = false;
        Ok(true)
    }

    /// Encodes the slab without touching the dirty flag
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        self.inner.lock().encode(Vec::new())
    }

    /// Decodes a packed record. The arrays are inflated once here so corrupt
    /// data is reported at load time rather than on first access.
    pub fn from_bytes(data: &[u8]) -> io::Result<VerticalSlab> {
        let mut decoder = Decoder::new(data);
        let mut packed = PackedArrays {
            blocks: Vec::new(),
            light: Vec::new(),
            light_saturation: Vec::new(),
            liquids: Vec::new(),
        };
        let mut contents = SlabContents::default();
        let mut empty = None;
        let mut compression_version = COMPRESSION_VERSION;

        while let Some(tag) = decoder.next_tag()? {
            match tag {
                TAG_BLOCKS => packed.blocks = decoder.bytes()?,
                TAG_LIGHT => packed.light = decoder.bytes()?,
                TAG_LIGHT_SATURATION => packed.light_saturation = decoder.bytes()?,
                TAG_ENTITIES => {
                    let count = decoder.count()?;
                    for _ in 0..count {
                        contents.entities.push(decoder.nbt()?);
                    }
                }
                TAG_BLOCK_ENTITIES => {
                    let count = decoder.count()?;
                    for _ in 0..count {
                        let index = decoder.i32()?;
                        contents.block_entities.insert(index, decoder.nbt()?);
                    }
                }
                TAG_MOD_DATA => contents.mod_data = read_blob_map(&mut decoder)?,
                TAG_LIGHT_POSITIONS => {
                    let count = decoder.count()?;
                    for _ in 0..count {
                        contents.light_positions.insert(decoder.i32()?);
                    }
                }
                TAG_SERVER_MOD_DATA => contents.server_mod_data = read_blob_map(&mut decoder)?,
                TAG_CREATED_VERSION => contents.created_version = decoder.string()?,
                TAG_EMPTY => empty = Some(decoder.bool()?),
                TAG_DECOR => {
                    let count = decoder.count()?;
                    for _ in 0..count {
                        let position = decoder.i32()?;
                        contents.decor.push((position, decoder.i32()?));
                    }
                }
                TAG_COMPRESSION_VERSION => compression_version = decoder.i32()?,
                TAG_LIQUIDS => packed.liquids = decoder.bytes()?,
                TAG_BLOCK_COUNTERS => {
                    contents.blocks_placed = decoder.i32()?;
                    contents.blocks_removed = decoder.i32()?;
                }
                other => return Err(invalid(format!("unknown slab field tag {}", other))),
            }
        }
        decoder.expect_end()?;

        if compression_version > COMPRESSION_VERSION {
            return Err(invalid(format!(
                "slab written with compression version {}, newest supported is {}",
                compression_version, COMPRESSION_VERSION
            )));
        }

        let arrays = VoxelArrays {
            blocks: inflate_u16_or_zero(&packed.blocks)?,
            light: inflate_u16_or_zero(&packed.light)?,
            light_saturation: if packed.light_saturation.is_empty() {
                vec![0; SLAB_VOLUME]
            } else {
                compress::decompress_bytes(&packed.light_saturation, SLAB_VOLUME)?
            },
            liquids: inflate_u16_or_zero(&packed.liquids)?,
        };
        let empty = empty.unwrap_or_else(|| arrays.is_air());

        Ok(VerticalSlab {
            inner: Mutex::new(SlabInner {
                voxels: Voxels::Unpacked(Box::new(arrays)),
                contents,
                empty,
                compression_version: COMPRESSION_VERSION,
                dirty_for_saving: false,
            }),
        })
    }

    pub fn is_empty(&self) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Voxels::Unpacked(arrays) = &inner.voxels {
            let empty = arrays.is_air();
            inner.empty = empty;
        }
        inner.empty
    }

    /// Gives the voxel arrays back for recycling, if unpacked
    pub fn into_arrays(self) -> Option<Box<VoxelArrays>> {
        match self.inner.into_inner().voxels {
            Voxels::Unpacked(arrays) => Some(arrays),
            Voxels::Packed(_) => None,
        }
    }
}

impl SlabInner {
    fn arrays_mut(&mut self) -> io::Result<&mut VoxelArrays> {
        if let Voxels::Packed(packed) = &self.voxels {
            let arrays = VoxelArrays::unpack(packed)?;
            self.voxels = Voxels::Unpacked(Box::new(arrays));
        }
        match &mut self.voxels {
            Voxels::Unpacked(arrays) => Ok(arrays),
            Voxels::Packed(_) => Err(invalid("slab still packed after unpack".to_string())),
        }
    }

    fn encode(&mut self, buffer: Vec<u8>) -> io::Result<Vec<u8>> {
        let fresh;
        let packed = match &self.voxels {
            Voxels::Packed(packed) => packed,
            Voxels::Unpacked(arrays) => {
                self.empty = arrays.is_air();
                fresh = arrays.pack()?;
                &fresh
            }
        };
        let contents = &self.contents;

        let mut encoder = Encoder::new(buffer);
        encoder.tag(TAG_BLOCKS)?.bytes(&packed.blocks)?;
        encoder.tag(TAG_LIGHT)?.bytes(&packed.light)?;
        encoder.tag(TAG_LIGHT_SATURATION)?.bytes(&packed.light_saturation)?;

        encoder.tag(TAG_ENTITIES)?.count(contents.entities.len())?;
        for entity in &contents.entities {
            encoder.nbt(entity)?;
        }

        encoder.tag(TAG_BLOCK_ENTITIES)?.count(contents.block_entities.len())?;
        for (index, block_entity) in &contents.block_entities {
            encoder.i32(*index)?.nbt(block_entity)?;
        }

        encoder.tag(TAG_MOD_DATA)?;
        write_blob_map(&mut encoder, &contents.mod_data)?;

        encoder.tag(TAG_LIGHT_POSITIONS)?.count(contents.light_positions.len())?;
        for position in &contents.light_positions {
            encoder.i32(*position)?;
        }

        encoder.tag(TAG_SERVER_MOD_DATA)?;
        write_blob_map(&mut encoder, &contents.server_mod_data)?;

        encoder.tag(TAG_CREATED_VERSION)?.string(&contents.created_version)?;
        encoder.tag(TAG_EMPTY)?.bool(self.empty)?;

        encoder.tag(TAG_DECOR)?.count(contents.decor.len())?;
        for (position, id) in &contents.decor {
            encoder.i32(*position)?.i32(*id)?;
        }

        encoder.tag(TAG_COMPRESSION_VERSION)?.i32(self.compression_version)?;
        encoder.tag(TAG_LIQUIDS)?.bytes(&packed.liquids)?;
        encoder
            .tag(TAG_BLOCK_COUNTERS)?
            .i32(contents.blocks_placed)?
            .i32(contents.blocks_removed)?;
        encoder.finish()
    }
}

fn write_blob_map(encoder: &mut Encoder, map: &BTreeMap<String, Vec<u8>>) -> io::Result<()> {
    encoder.count(map.len())?;
    for (key, value) in map {
        encoder.string(key)?.bytes(value)?;
    }
    Ok(())
}

fn read_blob_map(decoder: &mut Decoder<'_>) -> io::Result<BTreeMap<String, Vec<u8>>> {
    let count = decoder.count()?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = decoder.string()?;
        map.insert(key, decoder.bytes()?);
    }
    Ok(map)
}

fn inflate_u16_or_zero(data: &[u8]) -> io::Result<Vec<u16>> {
    if data.is_empty() {
        return Ok(vec![0; SLAB_VOLUME]);
    }
    compress::decompress_u16(data, SLAB_VOLUME)
}
