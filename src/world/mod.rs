pub mod coord;
pub mod loaded;
pub mod metadata;
pub mod pass;
pub mod pool;
pub mod region;
pub mod slab;

pub use coord::{ColumnPos, Direction, RegionPos, SlabPos};
pub use loaded::{ColumnData, LoadedColumns};
pub use metadata::MapColumnMetadata;
pub use pass::Pass;
pub use region::{GeneratedStructure, Region};
pub use slab::VerticalSlab;
