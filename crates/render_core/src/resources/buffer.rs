//! GPU buffers
//!
//! A [`Buffer`] is an array of `instance_count` elements, each padded to a stride
//! that satisfies the caller's minimum offset alignment (uniform buffers bound with
//! dynamic offsets need 256 on most hardware). Host-visible buffers live in
//! persistently mapped memory; device-local buffers are written through a staging
//! copy, so callers never need to know which kind they hold.

use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use crate::context::GraphicsContext;
use crate::delete_queue::Garbage;
use crate::error::{VulkanError, VulkanResult};
use crate::memory::{align_down, align_up, Allocation, AllocationFlags, AllocationRequest, MappedPtr};

/// Construction parameters of a [`Buffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferCreateInfo {
    /// Size of one element in bytes
    pub instance_size: vk::DeviceSize,
    /// Number of elements
    pub instance_count: u32,
    /// Buffer usage
    pub usage: vk::BufferUsageFlags,
    /// Required memory properties
    pub memory_properties: vk::MemoryPropertyFlags,
    /// Every element starts at a multiple of this (1 for tightly packed)
    pub min_offset_alignment: vk::DeviceSize,
    /// Give the buffer memory of its own instead of an arena range
    pub no_pool: bool,
    /// Debug name
    pub name: Option<String>,
}

impl Default for BufferCreateInfo {
    fn default() -> Self {
        Self {
            instance_size: 0,
            instance_count: 1,
            usage: vk::BufferUsageFlags::empty(),
            memory_properties: vk::MemoryPropertyFlags::empty(),
            min_offset_alignment: 1,
            no_pool: false,
            name: None,
        }
    }
}

impl BufferCreateInfo {
    /// Describe a buffer of `instance_count` elements of `instance_size` bytes
    pub fn new(
        instance_size: vk::DeviceSize,
        instance_count: u32,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            instance_size,
            instance_count,
            usage,
            memory_properties,
            ..Self::default()
        }
    }

    /// Set the per-element alignment
    pub fn with_min_offset_alignment(mut self, alignment: vk::DeviceSize) -> Self {
        self.min_offset_alignment = alignment;
        self
    }

    /// Request a dedicated allocation
    pub fn with_no_pool(mut self, no_pool: bool) -> Self {
        self.no_pool = no_pool;
        self
    }

    /// Set the debug name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether every required field is set
    pub fn is_valid(&self) -> bool {
        self.instance_size > 0
            && self.instance_count > 0
            && !self.usage.is_empty()
            && !self.memory_properties.is_empty()
            && self.min_offset_alignment > 0
    }

    /// Padded size of one element
    pub fn stride(&self) -> vk::DeviceSize {
        align_up(self.instance_size, self.min_offset_alignment)
    }
}

/// Move-only owner of a buffer and its memory
///
/// Dropping a buffer queues it for deletion; the handle stays valid for the
/// frames that may still reference it.
pub struct Buffer {
    context: Arc<GraphicsContext>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    memory: vk::DeviceMemory,
    memory_offset: vk::DeviceSize,
    memory_size: vk::DeviceSize,
    persistent: Option<MappedPtr>,
    mapped: Option<MappedPtr>,
    instance_size: vk::DeviceSize,
    instance_count: u32,
    alignment_size: vk::DeviceSize,
    buffer_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
}

impl Buffer {
    /// Create a buffer and bind memory to it
    ///
    /// Device-local buffers are created with `TRANSFER_DST` in addition to the
    /// requested usage so that [`write_to_buffer`](Self::write_to_buffer) can stage.
    ///
    /// # Panics
    /// Panics if `info` is incomplete.
    pub fn new(context: &Arc<GraphicsContext>, info: &BufferCreateInfo) -> VulkanResult<Self> {
        assert!(info.is_valid(), "incomplete buffer create info: {info:?}");

        let alignment_size = info.stride();
        let buffer_size = alignment_size * vk::DeviceSize::from(info.instance_count);
        let host_visible = info
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let mut create_usage = info.usage;
        if !host_visible {
            create_usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let device = context.device();
        let buffer = device.create_buffer(buffer_size, create_usage)?;
        let requirements = device.buffer_memory_requirements(buffer);

        let mut flags = AllocationFlags::empty();
        if info.no_pool {
            flags |= AllocationFlags::NO_POOL;
        }
        if info.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            flags |= AllocationFlags::DEVICE_ADDRESS;
        }
        let request = AllocationRequest::buffer(buffer, requirements, info.memory_properties)
            .with_flags(flags);
        let allocation = match context.memory_pool().allocate(device, &request) {
            Ok(allocation) => allocation,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };
        if let Err(e) = device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) {
            device.destroy_buffer(buffer);
            context.memory_pool().free(device, allocation);
            return Err(e);
        }
        if let Some(name) = &info.name {
            context.set_object_name(buffer, name);
        }

        Ok(Self {
            context: Arc::clone(context),
            buffer,
            memory: allocation.memory(),
            memory_offset: allocation.offset(),
            memory_size: allocation.memory_size(),
            persistent: allocation.mapped(),
            mapped: None,
            allocation: Some(allocation),
            instance_size: info.instance_size,
            instance_count: info.instance_count,
            alignment_size,
            buffer_size,
            usage: info.usage,
            memory_properties: info.memory_properties,
        })
    }

    /// Expose the buffer's memory to the CPU
    ///
    /// # Panics
    /// Panics if the buffer is not host visible.
    pub fn map(&mut self) -> VulkanResult<()> {
        assert!(
            self.is_host_visible(),
            "cannot map buffer {:?}: memory is not host visible",
            self.buffer
        );
        self.mapped = Some(
            self.persistent
                .ok_or(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED))?,
        );
        Ok(())
    }

    /// End CPU access; does nothing if the buffer is not mapped
    pub fn unmap(&mut self) {
        self.mapped = None;
    }

    /// Whether [`map`](Self::map) is in effect
    pub const fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Pointer to the first byte of the buffer while mapped
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped.map(MappedPtr::as_ptr)
    }

    /// Contents of a mapped buffer
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        let len = usize::try_from(self.buffer_size).ok()?;
        // SAFETY: the mapping covers the whole buffer and lives as long as `self`.
        self.mapped
            .map(|ptr| unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast_const(), len) })
    }

    /// Write `size` bytes of `data` at `offset`
    ///
    /// `size` may be `vk::WHOLE_SIZE` for "from `offset` to the end". Host-visible
    /// buffers are written directly; device-local buffers are filled from a
    /// staging buffer with a copy recorded into `cmd`, or into a one-shot command
    /// buffer that is waited for when `cmd` is `None`.
    ///
    /// # Panics
    /// Panics if the range exceeds the buffer or `data` is shorter than `size`.
    pub fn write_to_buffer(
        &mut self,
        data: &[u8],
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
        cmd: Option<vk::CommandBuffer>,
    ) -> VulkanResult<()> {
        let size = if size == vk::WHOLE_SIZE {
            self.buffer_size.saturating_sub(offset)
        } else {
            size
        };
        assert!(
            offset + size <= self.buffer_size,
            "write of {size} bytes at {offset} overflows a buffer of {}",
            self.buffer_size
        );
        let len = usize::try_from(size).map_err(|_| VulkanError::OutOfMemory { requested: size })?;
        assert!(data.len() >= len, "write of {size} bytes from {} bytes of data", data.len());
        if len == 0 {
            return Ok(());
        }

        if let Some(base) = self.persistent {
            // SAFETY: `offset + size` lies inside the buffer's mapped range.
            unsafe {
                let dst = base.add(offset).as_ptr();
                std::ptr::copy_nonoverlapping(data.as_ptr(), dst, len);
            }
            return Ok(());
        }

        let staging_info = BufferCreateInfo::new(
            size,
            1,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .with_name("Staging buffer");
        let mut staging = Self::new(&self.context, &staging_info)?;
        staging.write_to_buffer(data, size, 0, None)?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size,
        };
        let (src, dst) = (staging.handle(), self.buffer);
        let device = self.context.device();
        self.context.with_commands(cmd, |cmd| {
            device.cmd_copy_buffer(cmd, src, dst, &[region]);
            Ok(())
        })
        // `staging` is queued for deletion here and outlives the recorded copy.
    }

    /// Write `data` from the start of the buffer
    pub fn write(&mut self, data: &[u8]) -> VulkanResult<()> {
        self.write_to_buffer(data, data.len() as vk::DeviceSize, 0, None)
    }

    /// Write one element at `index`
    pub fn write_to_index(&mut self, data: &[u8], index: u32) -> VulkanResult<()> {
        self.write_to_buffer(data, self.instance_size, self.index_offset(index), None)
    }

    /// Write plain-old-data values at `offset`
    pub fn write_slice<T: Pod>(&mut self, items: &[T], offset: vk::DeviceSize) -> VulkanResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(items);
        self.write_to_buffer(bytes, bytes.len() as vk::DeviceSize, offset, None)
    }

    /// Make host writes visible to the device (non-coherent memory only)
    pub fn flush(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        if self.is_coherent() {
            return Ok(());
        }
        let range = self.mapped_range(size, offset);
        self.context.device().flush_memory(&[range])
    }

    /// Make device writes visible to the host (non-coherent memory only)
    pub fn invalidate(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        if self.is_coherent() {
            return Ok(());
        }
        let range = self.mapped_range(size, offset);
        self.context.device().invalidate_memory(&[range])
    }

    /// Flush one element
    pub fn flush_index(&self, index: u32) -> VulkanResult<()> {
        self.flush(self.alignment_size, self.index_offset(index))
    }

    /// Invalidate one element
    pub fn invalidate_index(&self, index: u32) -> VulkanResult<()> {
        self.invalidate(self.alignment_size, self.index_offset(index))
    }

    /// Memory range covering `size` bytes at `offset`, widened to the device's
    /// `nonCoherentAtomSize` and clamped to the memory object
    fn mapped_range(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::MappedMemoryRange {
        let atom = self.context.limits().non_coherent_atom_size.max(1);
        let start = self.memory_offset + offset;
        let end = if size == vk::WHOLE_SIZE {
            self.memory_offset + self.buffer_size
        } else {
            start + size
        };
        let aligned_start = align_down(start, atom);
        let aligned_end = align_up(end, atom).min(self.memory_size);
        vk::MappedMemoryRange {
            memory: self.memory,
            offset: aligned_start,
            size: aligned_end - aligned_start,
            ..Default::default()
        }
    }

    /// Descriptor info for `size` bytes at `offset`
    pub const fn descriptor_info(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset,
            range: size,
        }
    }

    /// Descriptor info for the whole buffer
    pub const fn whole_descriptor_info(&self) -> vk::DescriptorBufferInfo {
        self.descriptor_info(vk::WHOLE_SIZE, 0)
    }

    /// Descriptor info for one element
    pub fn descriptor_info_for_index(&self, index: u32) -> vk::DescriptorBufferInfo {
        self.descriptor_info(self.alignment_size, self.index_offset(index))
    }

    /// Copy `size` bytes from the start of `src` to the start of this buffer
    pub fn copy_from(
        &mut self,
        src: &Self,
        size: vk::DeviceSize,
        cmd: Option<vk::CommandBuffer>,
    ) -> VulkanResult<()> {
        assert!(
            size <= src.buffer_size && size <= self.buffer_size,
            "copy of {size} bytes between buffers of {} and {} bytes",
            src.buffer_size,
            self.buffer_size
        );
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        let (src, dst) = (src.buffer, self.buffer);
        let device = self.context.device();
        self.context.with_commands(cmd, |cmd| {
            device.cmd_copy_buffer(cmd, src, dst, &[region]);
            Ok(())
        })
    }

    /// GPU virtual address of a buffer created with `SHADER_DEVICE_ADDRESS`
    ///
    /// # Panics
    /// Panics if the usage does not include `SHADER_DEVICE_ADDRESS`.
    pub fn device_address(&self) -> vk::DeviceAddress {
        assert!(
            self.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
            "buffer {:?} was created without SHADER_DEVICE_ADDRESS",
            self.buffer
        );
        self.context.device().buffer_device_address(self.buffer)
    }

    const fn index_offset(&self, index: u32) -> vk::DeviceSize {
        self.alignment_size * index as vk::DeviceSize
    }

    /// Native handle
    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Total size in bytes (stride times count)
    pub const fn size(&self) -> vk::DeviceSize {
        self.buffer_size
    }

    /// Unpadded element size
    pub const fn instance_size(&self) -> vk::DeviceSize {
        self.instance_size
    }

    /// Number of elements
    pub const fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Padded element size
    pub const fn alignment_size(&self) -> vk::DeviceSize {
        self.alignment_size
    }

    /// Requested usage
    pub const fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Requested memory properties
    pub const fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }

    /// Whether the CPU can access the buffer's memory
    pub fn is_host_visible(&self) -> bool {
        self.memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn is_coherent(&self) -> bool {
        self.allocation.as_ref().map_or(true, Allocation::is_coherent)
    }

    /// Device memory the buffer is bound to
    pub const fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Whether the buffer owns its memory object
    pub fn is_dedicated(&self) -> bool {
        self.allocation.as_ref().is_some_and(Allocation::is_dedicated)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.context.trash(Garbage::Buffer {
                buffer: self.buffer,
                allocation,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessConfig, HeadlessDevice};
    use crate::config::CoreConfig;

    fn context_with(config: HeadlessConfig) -> (Arc<HeadlessDevice>, Arc<GraphicsContext>) {
        let device = Arc::new(HeadlessDevice::with_config(config));
        let context = GraphicsContext::new(device.clone(), CoreConfig::default()).unwrap();
        (device, context)
    }

    fn context() -> (Arc<HeadlessDevice>, Arc<GraphicsContext>) {
        context_with(HeadlessConfig::default())
    }

    #[test]
    fn test_stride_rounds_to_alignment() {
        let info = BufferCreateInfo::new(
            100,
            4,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .with_min_offset_alignment(256);
        assert_eq!(info.stride(), 256);

        let packed = BufferCreateInfo {
            min_offset_alignment: 1,
            ..info
        };
        assert_eq!(packed.stride(), 100);
    }

    #[test]
    fn test_create_info_validity() {
        let info = BufferCreateInfo::new(
            64,
            3,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        assert!(info.is_valid());
        assert!(!BufferCreateInfo { instance_count: 0, ..info.clone() }.is_valid());
        assert!(!BufferCreateInfo { usage: vk::BufferUsageFlags::empty(), ..info.clone() }.is_valid());
        assert!(!BufferCreateInfo::default().is_valid());
    }

    #[test]
    #[should_panic(expected = "incomplete buffer create info")]
    fn test_incomplete_info_panics() {
        let (_device, context) = context();
        let _ = Buffer::new(&context, &BufferCreateInfo::default());
    }

    #[test]
    #[should_panic(expected = "not host visible")]
    fn test_mapping_device_local_panics() {
        let (_device, context) = context();
        let info = BufferCreateInfo::new(
            64,
            1,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let mut buffer = Buffer::new(&context, &info).unwrap();
        let _ = buffer.map();
    }

    #[test]
    fn test_unmap_is_idempotent() {
        let (_device, context) = context();
        let info = BufferCreateInfo::new(
            16,
            1,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        let mut buffer = Buffer::new(&context, &info).unwrap();
        buffer.unmap();
        buffer.map().unwrap();
        assert!(buffer.is_mapped());
        buffer.unmap();
        buffer.unmap();
        assert!(!buffer.is_mapped());
        assert!(buffer.mapped_slice().is_none());
    }

    #[test]
    fn test_write_to_index_uses_stride() {
        let (_device, context) = context();
        let info = BufferCreateInfo::new(
            4,
            3,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .with_min_offset_alignment(16);
        let mut buffer = Buffer::new(&context, &info).unwrap();
        buffer.write_to_index(&[1, 2, 3, 4], 2).unwrap();
        buffer.map().unwrap();

        let bytes = buffer.mapped_slice().unwrap();
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[32..36], &[1, 2, 3, 4]);
        assert!(bytes[..32].iter().all(|b| *b == 0));

        let info = buffer.descriptor_info_for_index(2);
        assert_eq!((info.offset, info.range), (32, 16));
    }

    #[test]
    fn test_flush_ranges_respect_atom_size() {
        let (device, context) = context();
        let info = BufferCreateInfo::new(
            40,
            3,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        );
        let mut buffer = Buffer::new(&context, &info).unwrap();
        buffer.write_slice(&[7u32; 30], 0).unwrap();
        buffer.flush(vk::WHOLE_SIZE, 0).unwrap();
        buffer.flush(10, 50).unwrap();
        buffer.flush_index(1).unwrap();
        buffer.invalidate_index(2).unwrap();
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_drop_defers_destruction() {
        let (device, context) = context();
        let info = BufferCreateInfo::new(
            64,
            1,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let buffer = Buffer::new(&context, &info).unwrap();
        let handle = buffer.handle();
        drop(buffer);

        assert!(device.is_alive(handle));
        for _ in 0..context.frames_in_flight() {
            context.update_delete_queue();
            assert!(device.is_alive(handle));
        }
        context.update_delete_queue();
        assert!(!device.is_alive(handle));
    }

    #[test]
    fn test_no_pool_buffer_is_dedicated() {
        let (_device, context) = context();
        let info = BufferCreateInfo::new(
            64,
            1,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .with_no_pool(true);
        let buffer = Buffer::new(&context, &info).unwrap();
        assert!(buffer.is_dedicated());
    }

    #[test]
    fn test_device_address_of_pooled_buffer() {
        let (device, context) = context();
        let info = BufferCreateInfo::new(
            64,
            2,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let a = Buffer::new(&context, &info).unwrap();
        let b = Buffer::new(&context, &info).unwrap();
        assert_ne!(a.device_address(), 0);
        assert_ne!(a.device_address(), b.device_address());
        assert!(device.validation_errors().is_empty());
    }
}
