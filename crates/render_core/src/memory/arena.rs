//! Arena blocks and their sub-allocation

use ash::vk;
use range_alloc::RangeAllocator;
use std::collections::BTreeMap;

use super::{align_up, MappedPtr, ResourceKind};

/// Sub-range bookkeeping for one memory block
///
/// Placement is delegated to [`RangeAllocator`]. Alignment is handled here: a
/// request reserves enough to slide its start to an aligned offset, then hands
/// the head and tail slack straight back, so only `offset..offset + size` stays
/// reserved.
#[derive(Debug)]
pub struct BlockRanges {
    capacity: vk::DeviceSize,
    ranges: RangeAllocator<vk::DeviceSize>,
    live: BTreeMap<vk::DeviceSize, vk::DeviceSize>,
    used: vk::DeviceSize,
}

impl BlockRanges {
    /// Bookkeeping for an empty block of `capacity` bytes
    pub fn new(capacity: vk::DeviceSize) -> Self {
        Self {
            capacity,
            ranges: RangeAllocator::new(0..capacity),
            live: BTreeMap::new(),
            used: 0,
        }
    }

    /// Total size managed
    pub const fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }

    /// Bytes currently handed out
    pub const fn used(&self) -> vk::DeviceSize {
        self.used
    }

    /// Whether nothing is allocated
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of live sub-allocations
    pub fn allocation_count(&self) -> usize {
        self.live.len()
    }

    /// Reserve `size` bytes aligned to `alignment`; returns the aligned offset
    pub fn allocate(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<vk::DeviceSize> {
        if size == 0 || size > self.capacity {
            return None;
        }
        let alignment = alignment.max(1);
        let slack = alignment - 1;

        let offset = match self.ranges.allocate_range(size + slack) {
            Ok(reserved) => {
                let offset = align_up(reserved.start, alignment);
                if reserved.start < offset {
                    self.ranges.free_range(reserved.start..offset);
                }
                if offset + size < reserved.end {
                    self.ranges.free_range(offset + size..reserved.end);
                }
                offset
            }
            // The padded request can miss an exact fit that happens to be aligned.
            Err(_) if slack > 0 => {
                let reserved = self.ranges.allocate_range(size).ok()?;
                if align_up(reserved.start, alignment) != reserved.start {
                    self.ranges.free_range(reserved);
                    return None;
                }
                reserved.start
            }
            Err(_) => return None,
        };

        self.live.insert(offset, size);
        self.used += size;
        Some(offset)
    }

    /// Return a range previously handed out by [`allocate`](Self::allocate)
    ///
    /// # Panics
    /// Panics if `offset` is not a live allocation of `size` bytes.
    pub fn free(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) {
        match self.live.remove(&offset) {
            Some(live) if live == size => {}
            Some(live) => panic!("freeing {offset}+{size}, but {offset}+{live} was allocated"),
            None => panic!("double free of {offset}+{size}"),
        }
        self.ranges.free_range(offset..offset + size);
        self.used -= size;
    }
}

/// One device memory object owned by an arena
#[derive(Debug)]
pub(super) struct MemoryBlock {
    pub memory: vk::DeviceMemory,
    pub mapped: Option<MappedPtr>,
    pub ranges: BlockRanges,
}

/// All blocks of one (memory type, resource kind) bucket
#[derive(Debug)]
pub(super) struct MemoryArena {
    pub memory_type_index: u32,
    pub kind: ResourceKind,
    pub properties: vk::MemoryPropertyFlags,
    pub block_size: vk::DeviceSize,
    pub blocks: Vec<MemoryBlock>,
}

impl MemoryArena {
    pub fn new(
        memory_type_index: u32,
        kind: ResourceKind,
        properties: vk::MemoryPropertyFlags,
        block_size: vk::DeviceSize,
    ) -> Self {
        Self {
            memory_type_index,
            kind,
            properties,
            block_size,
            blocks: Vec::new(),
        }
    }

    /// Try every block in order; returns (block, offset)
    pub fn sub_allocate(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<(usize, vk::DeviceSize)> {
        self.blocks
            .iter_mut()
            .enumerate()
            .find_map(|(index, block)| block.ranges.allocate(size, alignment).map(|offset| (index, offset)))
    }

    pub fn bytes_in_use(&self) -> vk::DeviceSize {
        self.blocks.iter().map(|block| block.ranges.used()).sum()
    }
}
