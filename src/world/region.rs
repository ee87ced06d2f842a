use crate::codec::decoder::invalid;
use crate::codec::{Decoder, Encoder};
use crate::world::coord::{ColumnPos, RegionPos};
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

const TAG_CLIMATE: u8 = 1;
const TAG_FOREST: u8 = 2;
const TAG_SHRUB: u8 = 3;
const TAG_STRUCTURES: u8 = 4;

/// A structure placed by generation, recorded so it can be restored when one
/// of the columns it overlaps is regenerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedStructure {
    /// Column the structure was started from
    pub column: ColumnPos,
    /// min x, min y, min z, max x, max y, max z in block coordinates
    pub bbox: [i32; 6],
    pub code: i32,
}

impl GeneratedStructure {
    pub(crate) fn write(&self, encoder: &mut Encoder) -> io::Result<()> {
        encoder
            .i32(self.column.x)?
            .i32(self.column.z)?
            .u8(self.column.dimension)?;
        for value in self.bbox {
            encoder.i32(value)?;
        }
        encoder.i32(self.code)?;
        Ok(())
    }

    pub(crate) fn read(decoder: &mut Decoder<'_>) -> io::Result<Self> {
        let x = decoder.i32()?;
        let z = decoder.i32()?;
        let dimension = decoder.u8()?;
        let mut bbox = [0i32; 6];
        for value in bbox.iter_mut() {
            *value = decoder.i32()?;
        }
        Ok(GeneratedStructure {
            column: ColumnPos::new(x, z, dimension),
            bbox,
            code: decoder.i32()?,
        })
    }

    /// Whether the bounding box covers any block of `column`
    pub fn overlaps(&self, column: ColumnPos) -> bool {
        let size = crate::world::coord::SLAB_SIZE as i32;
        let (min_x, min_z) = (column.x * size, column.z * size);
        let (max_x, max_z) = (min_x + size - 1, min_z + size - 1);
        column.dimension == self.column.dimension
            && self.bbox[0] <= max_x
            && self.bbox[3] >= min_x
            && self.bbox[2] <= max_z
            && self.bbox[5] >= min_z
    }
}

/// Per-region sample grids, `size * size` values each, row-major by z
#[derive(Debug, Clone, PartialEq)]
pub struct RegionGrids {
    pub climate: Vec<i32>,
    pub forest: Vec<i32>,
    pub shrub: Vec<i32>,
}

/// Coarse per-region data shared by every column in the region.
#[derive(Debug)]
pub struct Region {
    pub pos: RegionPos,
    pub size: i32,
    grids: RwLock<RegionGrids>,
    structures: RwLock<Vec<GeneratedStructure>>,
    dirty: AtomicBool,
}

impl Region {
    pub fn new(pos: RegionPos, size: i32) -> Self {
        let cells = (size * size) as usize;
        Region {
            pos,
            size,
            grids: RwLock::new(RegionGrids {
                climate: vec![0; cells],
                forest: vec![0; cells],
                shrub: vec![0; cells],
            }),
            structures: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(true),
        }
    }

    pub fn grids(&self) -> RegionGrids {
        self.grids.read().clone()
    }

    pub fn with_grids_mut<R>(&self, f: impl FnOnce(&mut RegionGrids) -> R) -> R {
        self.dirty.store(true, Ordering::Release);
        f(&mut self.grids.write())
    }

    /// Climate sample for a column inside this region
    pub fn climate_at(&self, column: ColumnPos) -> i32 {
        let index = self.cell_index(column);
        self.grids.read().climate[index]
    }

    fn cell_index(&self, column: ColumnPos) -> usize {
        let local_x = column.x.rem_euclid(self.size);
        let local_z = column.z.rem_euclid(self.size);
        (local_z * self.size + local_x) as usize
    }

    pub fn add_structure(&self, structure: GeneratedStructure) {
        self.structures.write().push(structure);
        self.dirty.store(true, Ordering::Release);
    }

    /// Structures whose bounding box reaches into `column`
    pub fn structures_overlapping(&self, column: ColumnPos) -> Vec<GeneratedStructure> {
        self.structures
            .read()
            .iter()
            .filter(|structure| structure.overlaps(column))
            .cloned()
            .collect()
    }

    pub fn structure_count(&self) -> usize {
        self.structures.read().len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Encodes the region and clears the dirty flag if it was set
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
        let grids = self.grids.read();
        let mut encoder = Encoder::new(Vec::new());
        for (tag, grid) in [
            (TAG_CLIMATE, &grids.climate),
            (TAG_FOREST, &grids.forest),
            (TAG_SHRUB, &grids.shrub),
        ] {
            encoder.tag(tag)?.count(grid.len())?;
            for value in grid.iter() {
                encoder.i32(*value)?;
            }
        }
        let structures = self.structures.read();
        encoder.tag(TAG_STRUCTURES)?.count(structures.len())?;
        for structure in structures.iter() {
            structure.write(&mut encoder)?;
        }
        encoder.finish()
    }

    pub fn from_bytes(pos: RegionPos, size: i32, data: &[u8]) -> io::Result<Region> {
        let region = Region::new(pos, size);
        let cells = (size * size) as usize;
        let mut decoder = Decoder::new(data);
        {
            let mut grids = region.grids.write();
            let mut structures = region.structures.write();
            while let Some(tag) = decoder.next_tag()? {
                match tag {
                    TAG_CLIMATE => grids.climate = read_grid(&mut decoder, cells)?,
                    TAG_FOREST => grids.forest = read_grid(&mut decoder, cells)?,
                    TAG_SHRUB => grids.shrub = read_grid(&mut decoder, cells)?,
                    TAG_STRUCTURES => {
                        let count = decoder.count()?;
                        for _ in 0..count {
                            structures.push(GeneratedStructure::read(&mut decoder)?);
                        }
                    }
                    other => return Err(invalid(format!("unknown region field tag {}", other))),
                }
            }
            decoder.expect_end()?;
        }
        region.dirty.store(false, Ordering::Release);
        Ok(region)
    }
}

fn read_grid(decoder: &mut Decoder<'_>, cells: usize) -> io::Result<Vec<i32>> {
    let count = decoder.count()?;
    if count != cells {
        return Err(invalid(format!(
            "region grid has {} cells, expected {}",
            count, cells
        )));
    }
    let mut grid = Vec::with_capacity(count);
    for _ in 0..count {
        grid.push(decoder.i32()?);
    }
    Ok(grid)
}
