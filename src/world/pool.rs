use crate::world::slab::VoxelArrays;
use parking_lot::Mutex;

/// Recycles voxel arrays of packed or unloaded slabs so generation does not
/// allocate four 32³ arrays per new slab.
#[derive(Debug)]
pub struct SlabPool {
    free: Mutex<Vec<Box<VoxelArrays>>>,
    max_pooled: usize,
}

impl SlabPool {
    pub fn new(max_pooled: usize) -> Self {
        SlabPool {
            free: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Zeroed arrays, reused when available
    pub fn acquire(&self) -> Box<VoxelArrays> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(VoxelArrays::new()))
    }

    pub fn release(&self, mut arrays: Box<VoxelArrays>) {
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            arrays.clear();
            free.push(arrays);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_arrays_come_back_cleared() {
        let pool = SlabPool::new(1);
        let mut arrays = pool.acquire();
        arrays.blocks[10] = 3;
        pool.release(arrays);
        assert_eq!(pool.pooled(), 1);
        assert!(pool.acquire().blocks.iter().all(|&id| id == 0));
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = SlabPool::new(1);
        pool.release(Box::new(VoxelArrays::new()));
        pool.release(Box::new(VoxelArrays::new()));
        assert_eq!(pool.pooled(), 1);
    }
}
