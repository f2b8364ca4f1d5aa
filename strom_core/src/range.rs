//! Refcounted views into pool memory blocks.

use crate::MemoryBlock;
use std::fmt;
use std::sync::Arc;

/// A refcounted `(block, offset, size)` view into a memory block.
///
/// Holding a range counts as a reference on its block; cloning takes another
/// reference, dropping releases it. The block returns to its pool when the
/// last range (or other holder) over it drops.
#[derive(Clone)]
pub struct DataRange {
    block: Arc<MemoryBlock>,
    offset: usize,
    size: usize,
}

impl DataRange {
    pub fn new(block: Arc<MemoryBlock>, offset: usize, size: usize) -> Self {
        debug_assert!(offset + size <= block.len());
        Self {
            block,
            offset,
            size,
        }
    }

    /// A view over the whole block.
    pub fn whole(block: Arc<MemoryBlock>) -> Self {
        let size = block.len();
        Self {
            block,
            offset: 0,
            size,
        }
    }

    pub fn block(&self) -> &Arc<MemoryBlock> {
        &self.block
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.block.data()[self.offset..self.offset + self.size]
    }

    /// A sub view sharing the block reference.
    pub fn sub_range(&self, offset: usize, size: usize) -> Self {
        debug_assert!(offset + size <= self.size);
        Self {
            block: self.block.clone(),
            offset: self.offset + offset,
            size,
        }
    }

    /// Drop `n` bytes from the front of the view.
    pub fn advance_front(&mut self, n: usize) {
        debug_assert!(n <= self.size);
        self.offset += n;
        self.size -= n;
    }

    /// Keep only the first `n` bytes of the view.
    pub fn truncate(&mut self, n: usize) {
        debug_assert!(n <= self.size);
        self.size = n;
    }
}

impl fmt::Debug for DataRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataRange")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::DataRange;
    use crate::{HeapPool, MemoryPool};

    #[test]
    fn ranges_share_block_references() {
        let pool = HeapPool::new(1, 32);
        let mut blocks = Vec::new();
        pool.get_memory_blocks(&mut blocks, 1, "test").ok();
        let block = std::sync::Arc::new(blocks.remove(0));

        let a = DataRange::whole(block.clone());
        let b = a.sub_range(4, 8);
        drop(block);
        drop(a);
        assert_eq!(pool.free_blocks(), 0);
        drop(b);
        assert_eq!(pool.free_blocks(), 1);
    }
}
