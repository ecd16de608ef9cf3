//! # Device Memory Management
//!
//! Buffers and images never call `vkAllocateMemory` themselves. They describe what
//! they need with an [`AllocationRequest`] and receive an [`Allocation`] from the
//! [`MemoryPool`]:
//!
//! ```text
//! request ──► memory type lookup ──► arena (type, kind) ──► block ranges
//!                                         │ exhausted / NO_POOL / oversized
//!                                         ▼
//!                                   dedicated allocation
//! ```
//!
//! Buffers and images live in separate arenas so linear and optimal resources never
//! share a page (`bufferImageGranularity`). Host-visible blocks are mapped once when
//! created and stay mapped for their whole life.

use ash::vk;
use bitflags::bitflags;
use std::ptr::NonNull;

use crate::backend::DedicatedTarget;

mod arena;
mod pool;

pub use arena::BlockRanges;
pub use pool::{MemoryPool, MemoryStats};

/// Kind of resource an allocation backs; part of the arena key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Linear buffer memory
    Buffer,
    /// Optimal-tiling image memory
    Image,
}

bitflags! {
    /// Allocation behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocationFlags: u32 {
        /// Never sub-allocate: the resource gets memory of its own
        const NO_POOL = 1 << 0;
        /// Memory must support `vkGetBufferDeviceAddress`
        const DEVICE_ADDRESS = 1 << 1;
        /// Memory may be exported to another process or API
        const EXPORTABLE = 1 << 2;
    }
}

/// What a resource needs from the memory pool
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest {
    /// Size, alignment and compatible memory types reported by the driver
    pub requirements: vk::MemoryRequirements,
    /// Properties the chosen memory type must have
    pub properties: vk::MemoryPropertyFlags,
    /// Arena bucket
    pub kind: ResourceKind,
    /// Behaviour flags
    pub flags: AllocationFlags,
    /// Object a dedicated allocation is tied to
    pub dedicated: DedicatedTarget,
}

impl AllocationRequest {
    /// Request for a buffer
    pub fn buffer(
        buffer: vk::Buffer,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            requirements,
            properties,
            kind: ResourceKind::Buffer,
            flags: AllocationFlags::empty(),
            dedicated: DedicatedTarget::Buffer(buffer),
        }
    }

    /// Request for an image
    pub fn image(
        image: vk::Image,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            requirements,
            properties,
            kind: ResourceKind::Image,
            flags: AllocationFlags::empty(),
            dedicated: DedicatedTarget::Image(image),
        }
    }

    /// Add behaviour flags
    pub fn with_flags(mut self, flags: AllocationFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Whether the request is complete enough to allocate
    pub fn is_valid(&self) -> bool {
        self.requirements.size > 0
            && self.requirements.memory_type_bits != 0
            && !self.properties.is_empty()
    }
}

/// Host pointer into persistently mapped device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// The pointer refers to driver-owned memory that stays mapped until the block is
// freed; access is synchronized by the owning resource.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    /// Wrap a pointer returned by `map_memory`
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Raw pointer
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer advanced by `offset` bytes
    ///
    /// # Safety
    /// `offset` must lie within the mapped range.
    pub unsafe fn add(self, offset: vk::DeviceSize) -> Self {
        Self(NonNull::new_unchecked(self.0.as_ptr().add(offset as usize)))
    }
}

/// Where an allocation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationSource {
    /// Sub-allocated from block `block` of an arena
    Arena {
        /// Memory type of the arena
        memory_type_index: u32,
        /// Resource kind of the arena
        kind: ResourceKind,
        /// Block index inside the arena
        block: usize,
    },
    /// Owns its device memory
    Dedicated,
}

/// A range of device memory handed to one buffer or image
///
/// Deliberately not `Clone`: exactly one owner frees it, either the resource
/// itself or the delete queue after the resource was dropped.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    memory_size: vk::DeviceSize,
    memory_type_index: u32,
    properties: vk::MemoryPropertyFlags,
    mapped: Option<MappedPtr>,
    source: AllocationSource,
}

impl Allocation {
    /// Device memory object
    pub const fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Offset of the range inside the memory object
    pub const fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Size of the range
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Size of the whole memory object the range lives in
    pub const fn memory_size(&self) -> vk::DeviceSize {
        self.memory_size
    }

    /// Chosen memory type
    pub const fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Property flags of the chosen memory type
    pub const fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    /// Host pointer to the start of the range, for host-visible memory
    pub const fn mapped(&self) -> Option<MappedPtr> {
        self.mapped
    }

    /// Arena or dedicated
    pub const fn source(&self) -> AllocationSource {
        self.source
    }

    /// Whether this allocation owns its memory object
    pub const fn is_dedicated(&self) -> bool {
        matches!(self.source, AllocationSource::Dedicated)
    }

    /// Whether host writes need explicit flushes
    pub fn is_coherent(&self) -> bool {
        self.properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// Round `value` up to a multiple of `alignment` (any non-zero alignment)
pub const fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Round `value` down to a multiple of `alignment`
pub const fn align_down(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value / alignment * alignment
    }
}

/// First memory type allowed by `type_bits` that has every flag in `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&index| {
        type_bits & (1 << index) != 0
            && memory_properties.memory_types[index as usize]
                .property_flags
                .contains(properties)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(64, 1), 64);
        assert_eq!(align_up(64, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(100, 24), 120);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(130, 64), 128);
        assert_eq!(align_down(128, 64), 128);
        assert_eq!(align_down(7, 0), 7);
    }

    #[test]
    fn test_find_memory_type_respects_type_bits() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(find_memory_type(&props, 0b111, host), Some(1));
        assert_eq!(find_memory_type(&props, 0b100, host), Some(2));
        assert_eq!(find_memory_type(&props, 0b001, host), None);
    }

    #[test]
    fn test_request_validity() {
        let requirements = vk::MemoryRequirements {
            size: 256,
            alignment: 16,
            memory_type_bits: 1,
        };
        let request = AllocationRequest::buffer(
            vk::Buffer::null(),
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert!(request.is_valid());

        let empty = AllocationRequest::buffer(
            vk::Buffer::null(),
            requirements,
            vk::MemoryPropertyFlags::empty(),
        );
        assert!(!empty.is_valid());
    }
}
