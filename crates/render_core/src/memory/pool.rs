//! Memory pool: arena routing with dedicated fallback

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::arena::{BlockRanges, MemoryArena, MemoryBlock};
use super::{
    find_memory_type, AllocationFlags, AllocationRequest, AllocationSource, Allocation,
    MappedPtr, ResourceKind,
};
use crate::backend::{DedicatedTarget, GpuDevice, MemoryAllocateDesc};
use crate::config::MemoryConfig;
use crate::error::{VulkanError, VulkanResult};

/// Snapshot of pool usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Arenas created so far
    pub arena_count: usize,
    /// Device memory blocks owned by arenas
    pub block_count: usize,
    /// Bytes handed out from arena blocks
    pub bytes_in_use: vk::DeviceSize,
    /// Live dedicated allocations
    pub dedicated_count: usize,
}

#[derive(Default)]
struct PoolState {
    arenas: HashMap<(u32, ResourceKind), MemoryArena>,
    dedicated_count: usize,
}

/// Process-wide device memory allocator
///
/// Arenas are created lazily on the first request for their (memory type,
/// resource kind) pair and live until [`destroy`](Self::destroy). All mutation is
/// serialized by one lock, so background loaders may allocate while the render
/// thread does.
pub struct MemoryPool {
    config: MemoryConfig,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    /// Create an empty pool for a device
    pub fn new(config: MemoryConfig, memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            config,
            memory_properties,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Memory types and heaps the pool chooses from
    pub const fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Property flags of a memory type
    pub fn type_properties(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
        self.memory_properties
            .memory_types
            .get(memory_type_index as usize)
            .map_or_else(vk::MemoryPropertyFlags::empty, |ty| ty.property_flags)
    }

    /// Allocate memory for a buffer or image
    ///
    /// Requests are served from the arena of their memory type and kind. When the
    /// arena cannot serve a request (every block full and the arena at its block
    /// limit, the request larger than a block, or the block allocation itself
    /// failing) the pool retries once with a dedicated allocation. `NO_POOL`
    /// requests go straight to a dedicated allocation.
    ///
    /// # Panics
    /// Panics if the request is incomplete (zero size, no memory types, no properties).
    pub fn allocate(
        &self,
        device: &dyn GpuDevice,
        request: &AllocationRequest,
    ) -> VulkanResult<Allocation> {
        assert!(request.is_valid(), "incomplete allocation request: {request:?}");

        let memory_type_index = find_memory_type(
            &self.memory_properties,
            request.requirements.memory_type_bits,
            request.properties,
        )
        .ok_or(VulkanError::NoSuitableMemoryType)?;

        let size = request.requirements.size;
        let needs_address = request.flags.contains(AllocationFlags::DEVICE_ADDRESS);
        let poolable = !request.flags.contains(AllocationFlags::NO_POOL)
            && !request.flags.contains(AllocationFlags::EXPORTABLE)
            && size <= self.config.arena_block_size
            && (!needs_address || self.config.buffer_device_address);

        if poolable {
            if let Some(allocation) = self.allocate_from_arena(device, memory_type_index, request)? {
                return Ok(allocation);
            }
            log::warn!(
                "Arena (type {}, {:?}) cannot serve {} bytes, falling back to a dedicated allocation",
                memory_type_index,
                request.kind,
                size
            );
        }

        self.allocate_dedicated(device, memory_type_index, request)
    }

    /// Return an allocation to its arena, or free its memory if it is dedicated
    pub fn free(&self, device: &dyn GpuDevice, allocation: Allocation) {
        let mut state = self.state.lock();
        match allocation.source {
            AllocationSource::Arena {
                memory_type_index,
                kind,
                block,
            } => {
                let Some(block) = state
                    .arenas
                    .get_mut(&(memory_type_index, kind))
                    .and_then(|arena| arena.blocks.get_mut(block))
                else {
                    log::error!("Freeing allocation of an unknown arena block: {allocation:?}");
                    return;
                };
                block.ranges.free(allocation.offset, allocation.size);
            }
            AllocationSource::Dedicated => {
                if allocation.mapped.is_some() {
                    device.unmap_memory(allocation.memory);
                }
                device.free_memory(allocation.memory);
                state.dedicated_count -= 1;
            }
        }
    }

    /// Current usage
    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            arena_count: state.arenas.len(),
            block_count: state.arenas.values().map(|arena| arena.blocks.len()).sum(),
            bytes_in_use: state.arenas.values().map(MemoryArena::bytes_in_use).sum(),
            dedicated_count: state.dedicated_count,
        }
    }

    /// Free every arena block; called once at shutdown after the device is idle
    pub fn destroy(&self, device: &dyn GpuDevice) {
        let mut state = self.state.lock();
        let stats_in_use: vk::DeviceSize =
            state.arenas.values().map(MemoryArena::bytes_in_use).sum();
        if stats_in_use > 0 || state.dedicated_count > 0 {
            log::warn!(
                "Destroying memory pool with {} bytes and {} dedicated allocations still in use",
                stats_in_use,
                state.dedicated_count
            );
        }
        for (_, arena) in state.arenas.drain() {
            for block in arena.blocks {
                if block.mapped.is_some() {
                    device.unmap_memory(block.memory);
                }
                device.free_memory(block.memory);
            }
        }
        log::debug!("Memory pool destroyed");
    }

    fn allocate_from_arena(
        &self,
        device: &dyn GpuDevice,
        memory_type_index: u32,
        request: &AllocationRequest,
    ) -> VulkanResult<Option<Allocation>> {
        let size = request.requirements.size;
        let alignment = request.requirements.alignment.max(1);
        let properties = self.type_properties(memory_type_index);
        let block_size = self.config.arena_block_size;

        let mut state = self.state.lock();
        let arena = state
            .arenas
            .entry((memory_type_index, request.kind))
            .or_insert_with(|| {
                log::info!(
                    "Created memory arena for type {} ({:?}, {:?}), {} byte blocks",
                    memory_type_index,
                    request.kind,
                    properties,
                    block_size
                );
                MemoryArena::new(memory_type_index, request.kind, properties, block_size)
            });

        let (block, offset) = match arena.sub_allocate(size, alignment) {
            Some(found) => found,
            None => {
                if arena.blocks.len() >= self.config.max_blocks_per_arena as usize {
                    return Ok(None);
                }
                let Some(new_block) = self.create_block(device, arena)? else {
                    return Ok(None);
                };
                arena.blocks.push(new_block);
                let index = arena.blocks.len() - 1;
                match arena.blocks[index].ranges.allocate(size, alignment) {
                    Some(offset) => (index, offset),
                    None => return Ok(None),
                }
            }
        };

        let block_ref = &arena.blocks[block];
        // SAFETY: `offset + size` lies inside the block, which is mapped whole.
        let mapped = block_ref.mapped.map(|ptr| unsafe { ptr.add(offset) });
        Ok(Some(Allocation {
            memory: block_ref.memory,
            offset,
            size,
            memory_size: arena.block_size,
            memory_type_index,
            properties,
            mapped,
            source: AllocationSource::Arena {
                memory_type_index,
                kind: request.kind,
                block,
            },
        }))
    }

    /// Allocate and map a new arena block; `None` if the device refused
    fn create_block(
        &self,
        device: &dyn GpuDevice,
        arena: &MemoryArena,
    ) -> VulkanResult<Option<MemoryBlock>> {
        let desc = MemoryAllocateDesc {
            size: arena.block_size,
            memory_type_index: arena.memory_type_index,
            priority: self.config.arena_priority,
            device_address: arena.kind == ResourceKind::Buffer && self.config.buffer_device_address,
            export_handle_types: vk::ExternalMemoryHandleTypeFlags::empty(),
            dedicated: DedicatedTarget::None,
        };
        let memory = match device.allocate_memory(&desc) {
            Ok(memory) => memory,
            Err(VulkanError::Api(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            )) => {
                log::warn!(
                    "Arena block of {} bytes for memory type {} could not be allocated",
                    arena.block_size,
                    arena.memory_type_index
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mapped = if arena.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            match device.map_memory(memory, 0, vk::WHOLE_SIZE) {
                Ok(ptr) => MappedPtr::new(ptr),
                Err(e) => {
                    device.free_memory(memory);
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::debug!(
            "Arena (type {}, {:?}) grew to {} blocks",
            arena.memory_type_index,
            arena.kind,
            arena.blocks.len() + 1
        );
        Ok(Some(MemoryBlock {
            memory,
            mapped,
            ranges: BlockRanges::new(arena.block_size),
        }))
    }

    fn allocate_dedicated(
        &self,
        device: &dyn GpuDevice,
        memory_type_index: u32,
        request: &AllocationRequest,
    ) -> VulkanResult<Allocation> {
        let size = request.requirements.size;
        let properties = self.type_properties(memory_type_index);
        let export_handle_types = if request.flags.contains(AllocationFlags::EXPORTABLE) {
            if cfg!(windows) {
                vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32
            } else {
                vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD
            }
        } else {
            vk::ExternalMemoryHandleTypeFlags::empty()
        };
        let desc = MemoryAllocateDesc {
            size,
            memory_type_index,
            priority: self.config.arena_priority,
            device_address: request.flags.contains(AllocationFlags::DEVICE_ADDRESS)
                || (request.kind == ResourceKind::Buffer && self.config.buffer_device_address),
            export_handle_types,
            dedicated: request.dedicated,
        };

        let memory = device.allocate_memory(&desc).map_err(|e| {
            log::error!("Dedicated allocation of {} bytes failed: {}", size, e);
            VulkanError::OutOfMemory { requested: size }
        })?;

        let mapped = if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            match device.map_memory(memory, 0, vk::WHOLE_SIZE) {
                Ok(ptr) => MappedPtr::new(ptr),
                Err(e) => {
                    device.free_memory(memory);
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.state.lock().dedicated_count += 1;
        log::debug!(
            "Dedicated allocation of {} bytes from memory type {}",
            size,
            memory_type_index
        );
        Ok(Allocation {
            memory,
            offset: 0,
            size,
            memory_size: size,
            memory_type_index,
            properties,
            mapped,
            source: AllocationSource::Dedicated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessConfig, HeadlessDevice};

    fn small_pool(device: &HeadlessDevice, block_size: u64, max_blocks: u32) -> MemoryPool {
        let config = MemoryConfig::default()
            .with_arena_block_size(block_size)
            .with_max_blocks_per_arena(max_blocks);
        MemoryPool::new(config, device.memory_properties())
    }

    fn request(size: u64, properties: vk::MemoryPropertyFlags, kind: ResourceKind) -> AllocationRequest {
        AllocationRequest {
            requirements: vk::MemoryRequirements {
                size,
                alignment: 256,
                memory_type_bits: u32::MAX,
            },
            properties,
            kind,
            flags: AllocationFlags::empty(),
            dedicated: DedicatedTarget::None,
        }
    }

    #[test]
    fn test_allocations_share_an_arena_block() {
        let device = HeadlessDevice::new();
        let pool = small_pool(&device, 4096, 4);
        let props = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let a = pool.allocate(&device, &request(1000, props, ResourceKind::Buffer)).unwrap();
        let b = pool.allocate(&device, &request(1000, props, ResourceKind::Buffer)).unwrap();
        assert_eq!(a.memory(), b.memory());
        assert_eq!(b.offset(), 1024);

        let stats = pool.stats();
        assert_eq!(stats.arena_count, 1);
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.bytes_in_use, 2000);

        pool.free(&device, a);
        pool.free(&device, b);
        assert_eq!(pool.stats().bytes_in_use, 0);
        pool.destroy(&device);
        assert_eq!(device.live_count(vk::ObjectType::DEVICE_MEMORY), 0);
    }

    #[test]
    fn test_buffers_and_images_use_separate_arenas() {
        let device = HeadlessDevice::new();
        let pool = small_pool(&device, 4096, 4);
        let props = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let buffer = pool.allocate(&device, &request(512, props, ResourceKind::Buffer)).unwrap();
        let image = pool.allocate(&device, &request(512, props, ResourceKind::Image)).unwrap();
        assert_ne!(buffer.memory(), image.memory());
        assert_eq!(pool.stats().arena_count, 2);
    }

    #[test]
    fn test_no_pool_gets_dedicated_memory() {
        let device = HeadlessDevice::new();
        let pool = small_pool(&device, 4096, 4);
        let req = request(512, vk::MemoryPropertyFlags::DEVICE_LOCAL, ResourceKind::Buffer)
            .with_flags(AllocationFlags::NO_POOL);

        let allocation = pool.allocate(&device, &req).unwrap();
        assert!(allocation.is_dedicated());
        assert_eq!(allocation.memory_size(), 512);
        assert_eq!(pool.stats().arena_count, 0);
        assert_eq!(pool.stats().dedicated_count, 1);

        pool.free(&device, allocation);
        assert_eq!(pool.stats().dedicated_count, 0);
        assert_eq!(device.live_count(vk::ObjectType::DEVICE_MEMORY), 0);
    }

    #[test]
    fn test_full_arena_falls_back_to_dedicated() {
        let device = HeadlessDevice::new();
        let pool = small_pool(&device, 1024, 1);
        let props = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let first = pool.allocate(&device, &request(1024, props, ResourceKind::Buffer)).unwrap();
        let second = pool.allocate(&device, &request(1024, props, ResourceKind::Buffer)).unwrap();
        assert!(!first.is_dedicated());
        assert!(second.is_dedicated());

        let oversized = pool.allocate(&device, &request(4096, props, ResourceKind::Buffer)).unwrap();
        assert!(oversized.is_dedicated());
    }

    #[test]
    fn test_freed_ranges_are_reused() {
        let device = HeadlessDevice::new();
        let pool = small_pool(&device, 1024, 1);
        let props = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let quarters: Vec<_> = (0..4)
            .map(|_| pool.allocate(&device, &request(256, props, ResourceKind::Buffer)).unwrap())
            .collect();
        let block = quarters[0].memory();
        assert!(quarters.iter().all(|a| !a.is_dedicated() && a.offset() % 256 == 0));
        for allocation in quarters {
            pool.free(&device, allocation);
        }

        let whole = pool.allocate(&device, &request(1024, props, ResourceKind::Buffer)).unwrap();
        assert!(!whole.is_dedicated());
        assert_eq!(whole.memory(), block);
        assert_eq!(whole.offset(), 0);
        assert_eq!(pool.stats().block_count, 1);
    }

    #[test]
    fn test_host_visible_blocks_are_mapped() {
        let device = HeadlessDevice::new();
        let pool = small_pool(&device, 4096, 2);
        let props = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let a = pool.allocate(&device, &request(256, props, ResourceKind::Buffer)).unwrap();
        let b = pool.allocate(&device, &request(256, props, ResourceKind::Buffer)).unwrap();
        let (pa, pb) = (a.mapped().unwrap(), b.mapped().unwrap());
        assert_eq!(pb.as_ptr() as usize - pa.as_ptr() as usize, 256);
        assert!(a.is_coherent());

        let device_local = pool
            .allocate(&device, &request(256, vk::MemoryPropertyFlags::DEVICE_LOCAL, ResourceKind::Buffer))
            .unwrap();
        assert!(device_local.mapped().is_none());
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let config = HeadlessConfig::default().with_heap_sizes(2048, 2048);
        let device = HeadlessDevice::with_config(config);
        let pool = small_pool(&device, 1024, 1);
        let props = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let _block = pool.allocate(&device, &request(1024, props, ResourceKind::Buffer)).unwrap();
        let _dedicated = pool.allocate(&device, &request(1024, props, ResourceKind::Buffer)).unwrap();
        let result = pool.allocate(&device, &request(1024, props, ResourceKind::Buffer));
        assert_eq!(result, Err(VulkanError::OutOfMemory { requested: 1024 }));
    }

    #[test]
    fn test_missing_memory_type() {
        let device = HeadlessDevice::new();
        let pool = small_pool(&device, 4096, 1);
        let props = vk::MemoryPropertyFlags::LAZILY_ALLOCATED;
        let result = pool.allocate(&device, &request(64, props, ResourceKind::Image));
        assert_eq!(result, Err(VulkanError::NoSuitableMemoryType));
    }
}
