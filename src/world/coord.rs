use std::fmt;

/// Edge length of a slab and of a column, in blocks
pub const SLAB_SIZE: usize = 32;
/// Voxels in one slab
pub const SLAB_VOLUME: usize = SLAB_SIZE * SLAB_SIZE * SLAB_SIZE;

/// Horizontal neighbour directions. The discriminant is the bit index used
/// in neighbour-loaded masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    North = 0,
    NorthEast = 1,
    East = 2,
    SouthEast = 3,
    South = 4,
    SouthWest = 5,
    West = 6,
    NorthWest = 7,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    /// (dx, dz); north is -z
    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::NorthEast => (1, -1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, 1),
            Direction::South => (0, 1),
            Direction::SouthWest => (-1, 1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
        }
    }

    pub fn opposite(self) -> Direction {
        Direction::ALL[(self as usize + 4) % 8]
    }

    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Position of one column in the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnPos {
    pub x: i32,
    pub z: i32,
    pub dimension: u8,
}

impl ColumnPos {
    pub const fn new(x: i32, z: i32, dimension: u8) -> Self {
        ColumnPos { x, z, dimension }
    }

    /// Row-major index of the column inside a map `map_size_x` columns wide
    pub fn map_index(&self, map_size_x: i32) -> u64 {
        (self.z as i64 * map_size_x as i64 + self.x as i64) as u64
    }

    pub fn in_bounds(&self, map_size_x: i32, map_size_z: i32) -> bool {
        self.x >= 0 && self.z >= 0 && self.x < map_size_x && self.z < map_size_z
    }

    pub fn offset(&self, direction: Direction) -> ColumnPos {
        let (dx, dz) = direction.offset();
        ColumnPos::new(self.x + dx, self.z + dz, self.dimension)
    }

    /// The 8 horizontal neighbours that lie inside the map
    pub fn neighbours(
        &self,
        map_size_x: i32,
        map_size_z: i32,
    ) -> impl Iterator<Item = (Direction, ColumnPos)> + '_ {
        Direction::ALL
            .into_iter()
            .map(move |direction| (direction, self.offset(direction)))
            .filter(move |(_, pos)| pos.in_bounds(map_size_x, map_size_z))
    }

    pub fn region(&self, region_size: i32) -> RegionPos {
        RegionPos {
            x: self.x.div_euclid(region_size),
            z: self.z.div_euclid(region_size),
            dimension: self.dimension,
        }
    }

    pub fn slab(&self, y: i32) -> SlabPos {
        SlabPos {
            x: self.x,
            y,
            z: self.z,
            dimension: self.dimension,
        }
    }
}

impl fmt::Display for ColumnPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}) dim {}", self.x, self.z, self.dimension)
    }
}

/// Position of one 32³ slab; `y` is the slab index inside its column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlabPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub dimension: u8,
}

impl SlabPos {
    pub fn column(&self) -> ColumnPos {
        ColumnPos::new(self.x, self.z, self.dimension)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
    pub dimension: u8,
}
