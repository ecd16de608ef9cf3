//! # Headless Device
//!
//! A CPU simulation of [`GpuDevice`] that keeps the same contract as the Vulkan
//! backend while running anywhere:
//!
//! - device memory is a zeroed byte vector per allocation, host-visible memory can be
//!   mapped and written through the returned pointer
//! - handles are `slotmap` keys, so stale or double-destroyed handles are caught
//! - descriptor pools enforce their `max_sets` and per-type capacities and report
//!   `ERROR_OUT_OF_POOL_MEMORY` exactly like a driver
//! - submissions stay pending until the host waits on their fence or idles the
//!   queue, then execute in order (copies, blits and layout transitions included)
//! - the surface can be resized and acquire indices can be scripted, so swapchain
//!   recreation and image reuse are reproducible
//!
//! Anything the real validation layers would flag is logged and collected in
//! [`HeadlessDevice::validation_errors`], and every submit, completion, fence wait,
//! acquire, present and destroy is appended to an event log.

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;

mod objects;
mod queue;

use objects::{
    image_bytes, key_of, raw_of, BufferObject, Command, CommandBufferObject, CommandBufferState,
    DescriptorPoolObject, DescriptorSetObject, ImageBarrierRecord, ImageObject, LayoutBinding,
    MemoryObject, Object, PendingSubmission, State, SwapchainObject,
};

use super::{
    ComputePipelineDesc, DescriptorResources, DescriptorWrite, GpuDevice, GraphicsPipelineDesc,
    ImageDesc, ImageViewDesc, MemoryAllocateDesc, QueueKind, RayTracingPipelineDesc, SamplerDesc,
    SubmitBatch, SwapchainDesc, SwapchainImages,
};
use crate::error::{VulkanError, VulkanResult};

/// SPIR-V magic number expected as the first word of every shader module
const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Something the simulated GPU did, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadlessEvent {
    /// Work was queued
    Submit {
        /// Monotonic submission id
        submission: u64,
        /// Fence signaled on completion (null for none)
        fence: vk::Fence,
    },
    /// Queued work finished executing
    Complete {
        /// Submission id reported by the matching `Submit`
        submission: u64,
    },
    /// The host blocked on a fence
    FenceWait {
        /// Fence waited on
        fence: vk::Fence,
    },
    /// The host waited for a queue or the device to drain
    Idle,
    /// A presentable image was acquired
    Acquire {
        /// Acquired image index
        image_index: u32,
    },
    /// A presentable image was queued for display
    Present {
        /// Presented image index
        image_index: u32,
    },
    /// An object was destroyed or freed
    Destroy {
        /// Kind of object
        object_type: vk::ObjectType,
        /// Raw handle value
        handle: u64,
    },
}

/// Shape of the simulated physical device
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Memory types as (property flags, heap index)
    pub memory_types: Vec<(vk::MemoryPropertyFlags, u32)>,
    /// Heaps as (size, flags)
    pub memory_heaps: Vec<(vk::DeviceSize, vk::MemoryHeapFlags)>,
    /// `minUniformBufferOffsetAlignment`
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    /// `minStorageBufferOffsetAlignment`
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
    /// `nonCoherentAtomSize`
    pub non_coherent_atom_size: vk::DeviceSize,
    /// Formats supporting linear filtering and blits with optimal tiling
    pub linear_filter_formats: Vec<vk::Format>,
    /// Window surface extent, `None` for a device without presentation
    pub surface_extent: Option<vk::Extent2D>,
    /// Images per swapchain
    pub swapchain_image_count: u32,
    /// Whether ray tracing pipelines can be created
    pub ray_tracing: bool,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            memory_types: vec![
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
                (
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                    1,
                ),
                (
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
                    1,
                ),
                (
                    vk::MemoryPropertyFlags::DEVICE_LOCAL
                        | vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    0,
                ),
            ],
            memory_heaps: vec![
                (512 * 1024 * 1024, vk::MemoryHeapFlags::DEVICE_LOCAL),
                (256 * 1024 * 1024, vk::MemoryHeapFlags::empty()),
            ],
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            non_coherent_atom_size: 64,
            linear_filter_formats: vec![
                vk::Format::R8G8B8A8_UNORM,
                vk::Format::R8G8B8A8_SRGB,
                vk::Format::B8G8R8A8_UNORM,
                vk::Format::B8G8R8A8_SRGB,
                vk::Format::R16G16B16A16_SFLOAT,
            ],
            surface_extent: Some(vk::Extent2D {
                width: 800,
                height: 600,
            }),
            swapchain_image_count: 3,
            ray_tracing: false,
        }
    }
}

impl HeadlessConfig {
    /// Set the heap sizes, keeping their flags
    pub fn with_heap_sizes(mut self, device: vk::DeviceSize, host: vk::DeviceSize) -> Self {
        self.memory_heaps[0].0 = device;
        self.memory_heaps[1].0 = host;
        self
    }

    /// Set the surface extent (`None` removes the surface)
    pub fn with_surface_extent(mut self, extent: Option<vk::Extent2D>) -> Self {
        self.surface_extent = extent;
        self
    }

    /// Enable or disable ray tracing pipelines
    pub fn with_ray_tracing(mut self, enabled: bool) -> Self {
        self.ray_tracing = enabled;
        self
    }
}

/// CPU-simulated GPU device
pub struct HeadlessDevice {
    config: HeadlessConfig,
    surface: Option<vk::SurfaceKHR>,
    state: Mutex<State>,
}

impl HeadlessDevice {
    /// Create a headless device with the default shape
    pub fn new() -> Self {
        Self::with_config(HeadlessConfig::default())
    }

    /// Create a headless device with a custom shape
    pub fn with_config(config: HeadlessConfig) -> Self {
        let mut state = State::new(config.memory_heaps.len(), config.surface_extent);
        let surface = config
            .surface_extent
            .map(|_| vk::SurfaceKHR::from_raw(state.insert(Object::Surface)));
        log::info!(
            "Created headless device ({} memory types, surface: {})",
            config.memory_types.len(),
            surface.is_some()
        );
        Self {
            config,
            surface,
            state: Mutex::new(state),
        }
    }

    /// Snapshot of the event log
    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.state.lock().events.clone()
    }

    /// Clear the event log
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Contract violations observed so far
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation_errors.clone()
    }

    /// Whether a handle refers to a live object
    pub fn is_alive<H: Handle>(&self, handle: H) -> bool {
        let raw = handle.as_raw();
        raw != 0 && self.state.lock().objects.contains_key(key_of(raw))
    }

    /// Number of live objects of one kind
    pub fn live_count(&self, object_type: vk::ObjectType) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|object| object.object_type() == object_type)
            .count()
    }

    /// Submissions queued but not yet executed
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Bytes allocated from a heap
    pub fn heap_usage(&self, heap_index: usize) -> vk::DeviceSize {
        self.state.lock().heap_usage.get(heap_index).copied().unwrap_or(0)
    }

    /// Debug name attached to an object
    pub fn object_name<H: Handle>(&self, handle: H) -> Option<String> {
        self.state.lock().names.get(&handle.as_raw()).cloned()
    }

    /// Resources last written to a descriptor binding
    pub fn descriptor_binding(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
    ) -> Option<DescriptorResources> {
        self.state
            .lock()
            .descriptor_set(set.as_raw())
            .and_then(|set| set.writes.get(&binding).cloned())
    }

    /// Layout of one image subresource on the simulated GPU timeline
    pub fn image_layout(&self, image: vk::Image, mip: u32, layer: u32) -> Option<vk::ImageLayout> {
        let mut state = self.state.lock();
        let image = state.image(image.as_raw())?;
        let index = image.layout_index(mip, layer);
        image.layouts.get(index).copied()
    }

    /// Resize the window surface; swapchains of another extent become out of date
    pub fn set_surface_extent(&self, extent: vk::Extent2D) {
        self.state.lock().surface_extent = Some(extent);
    }

    /// Force the next acquires to return these image indices
    pub fn script_acquire_indices(&self, indices: impl IntoIterator<Item = u32>) {
        self.state.lock().scripted_indices.extend(indices);
    }

    /// Report `suboptimal` from acquire and present
    pub fn set_suboptimal(&self, suboptimal: bool) {
        self.state.lock().report_suboptimal = suboptimal;
    }

    /// Make the next queue submission fail with `result` without queueing anything
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().submit_failure = Some(result);
    }

    fn memory_type(&self, index: u32) -> Option<(vk::MemoryPropertyFlags, u32)> {
        self.config.memory_types.get(index as usize).copied()
    }

    fn all_memory_types(&self) -> u32 {
        (1u32 << self.config.memory_types.len()) - 1
    }

    fn record(&self, cmd: vk::CommandBuffer, command: Command) {
        let mut state = self.state.lock();
        match state.command_buffer(cmd.as_raw()) {
            Some(buffer) if buffer.state == CommandBufferState::Recording => {
                buffer.commands.push(command);
            }
            Some(_) => state.violation(format!("recording into {cmd:?} outside begin/end")),
            None => state.violation(format!("recording into unknown command buffer {cmd:?}")),
        }
    }

    fn destroy(&self, raw: u64, object_type: vk::ObjectType) {
        self.state.lock().remove(raw, object_type);
    }

    fn check_alive(state: &mut State, raw: u64, object_type: vk::ObjectType, what: &str) -> bool {
        if state.is_kind(raw, object_type) {
            true
        } else {
            state.violation(format!("{what} {raw:#x} is not a live {object_type:?}"));
            false
        }
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "Headless Device"
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        for (i, (flags, heap)) in self.config.memory_types.iter().enumerate() {
            properties.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: *heap,
            };
        }
        for (i, (size, flags)) in self.config.memory_heaps.iter().enumerate() {
            properties.memory_heaps[i] = vk::MemoryHeap {
                size: *size,
                flags: *flags,
            };
        }
        properties.memory_type_count = u32::try_from(self.config.memory_types.len()).unwrap_or(0);
        properties.memory_heap_count = u32::try_from(self.config.memory_heaps.len()).unwrap_or(0);
        properties
    }

    fn limits(&self) -> vk::PhysicalDeviceLimits {
        vk::PhysicalDeviceLimits {
            min_uniform_buffer_offset_alignment: self.config.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: self.config.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: self.config.non_coherent_atom_size,
            max_sampler_anisotropy: 16.0,
            max_bound_descriptor_sets: 8,
            ..Default::default()
        }
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        let transfer = vk::FormatFeatureFlags::TRANSFER_SRC | vk::FormatFeatureFlags::TRANSFER_DST;
        let optimal = if self.config.linear_filter_formats.contains(&format) {
            transfer
                | vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
                | vk::FormatFeatureFlags::BLIT_SRC
                | vk::FormatFeatureFlags::BLIT_DST
                | vk::FormatFeatureFlags::COLOR_ATTACHMENT
        } else if matches!(format, vk::Format::D32_SFLOAT | vk::Format::D24_UNORM_S8_UINT) {
            transfer
                | vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
        } else if format == vk::Format::UNDEFINED {
            vk::FormatFeatureFlags::empty()
        } else {
            transfer | vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::STORAGE_IMAGE
        };
        vk::FormatProperties {
            linear_tiling_features: transfer,
            optimal_tiling_features: optimal,
            buffer_features: vk::FormatFeatureFlags::empty(),
        }
    }

    fn queue_family_index(&self, _queue: QueueKind) -> u32 {
        0
    }

    fn set_object_name(&self, _object_type: vk::ObjectType, handle: u64, name: &str) {
        self.state.lock().names.insert(handle, name.to_string());
    }

    fn allocate_memory(&self, desc: &MemoryAllocateDesc) -> VulkanResult<vk::DeviceMemory> {
        let Some((flags, heap_index)) = self.memory_type(desc.memory_type_index) else {
            return Err(VulkanError::NoSuitableMemoryType);
        };
        let mut state = self.state.lock();
        match desc.dedicated {
            super::DedicatedTarget::Buffer(buffer) => {
                Self::check_alive(&mut state, buffer.as_raw(), vk::ObjectType::BUFFER, "dedicated buffer");
            }
            super::DedicatedTarget::Image(image) => {
                Self::check_alive(&mut state, image.as_raw(), vk::ObjectType::IMAGE, "dedicated image");
            }
            super::DedicatedTarget::None => {}
        }

        let heap = heap_index as usize;
        let budget = self.config.memory_heaps[heap].0;
        if state.heap_usage[heap] + desc.size > budget {
            log::warn!(
                "Headless heap {} exhausted: {} + {} > {}",
                heap,
                state.heap_usage[heap],
                desc.size,
                budget
            );
            return Err(VulkanError::Api(
                if flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                } else {
                    vk::Result::ERROR_OUT_OF_HOST_MEMORY
                },
            ));
        }
        let len = usize::try_from(desc.size)
            .map_err(|_| VulkanError::OutOfMemory { requested: desc.size })?;
        state.heap_usage[heap] += desc.size;
        let base_address = state.next_address;
        state.next_address += desc.size.next_multiple_of(0x1_0000);

        let raw = state.insert(Object::Memory(MemoryObject {
            data: vec![0; len],
            type_index: desc.memory_type_index,
            heap_index,
            mapped: false,
            base_address,
            device_address: desc.device_address,
            internal: false,
        }));
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        if let Some(Object::Memory(object)) = state.remove(memory.as_raw(), vk::ObjectType::DEVICE_MEMORY) {
            if !object.internal {
                state.heap_usage[object.heap_index as usize] -= object.data.len() as u64;
            }
        }
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VulkanResult<*mut u8> {
        let host_visible = |index: u32| {
            self.memory_type(index)
                .is_some_and(|(flags, _)| flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE))
        };
        let mut state = self.state.lock();
        let Some(object) = state.memory(memory.as_raw()) else {
            state.violation(format!("mapping unknown memory {memory:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED));
        };
        if !host_visible(object.type_index) {
            state.violation(format!("mapping memory {memory:?} that is not host visible"));
            return Err(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        if object.mapped {
            state.violation(format!("memory {memory:?} is already mapped"));
            return Err(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let Ok(start) = usize::try_from(offset) else {
            return Err(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED));
        };
        if start >= object.data.len() {
            return Err(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        object.mapped = true;
        // SAFETY: `start` is within the allocation, whose storage never reallocates.
        Ok(unsafe { object.data.as_mut_ptr().add(start) })
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        match state.memory(memory.as_raw()) {
            Some(object) if object.mapped => object.mapped = false,
            _ => state.violation(format!("unmapping memory {memory:?} that is not mapped")),
        }
    }

    fn flush_memory(&self, ranges: &[vk::MappedMemoryRange]) -> VulkanResult<()> {
        let atom = self.config.non_coherent_atom_size;
        let mut state = self.state.lock();
        for range in ranges {
            let Some(object) = state.memory(range.memory.as_raw()) else {
                state.violation("flushing unknown memory");
                continue;
            };
            let len = object.data.len() as u64;
            let mapped = object.mapped;
            let aligned_size = range.size == vk::WHOLE_SIZE
                || range.size % atom == 0
                || range.offset + range.size == len;
            if !mapped {
                state.violation("flushing memory that is not mapped");
            }
            if range.offset % atom != 0 || !aligned_size {
                state.violation(format!(
                    "flush range {}+{} is not aligned to nonCoherentAtomSize {atom}",
                    range.offset, range.size
                ));
            }
        }
        Ok(())
    }

    fn invalidate_memory(&self, ranges: &[vk::MappedMemoryRange]) -> VulkanResult<()> {
        self.flush_memory(ranges)
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<vk::Buffer> {
        let mut state = self.state.lock();
        if size == 0 || usage.is_empty() {
            state.violation("buffer created with zero size or no usage");
            return Err(VulkanError::InvalidOperation {
                reason: "buffer size and usage must be non-zero".to_string(),
            });
        }
        let raw = state.insert(Object::Buffer(BufferObject {
            size,
            usage,
            binding: None,
        }));
        Ok(vk::Buffer::from_raw(raw))
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let mut state = self.state.lock();
        let (size, usage) = state
            .buffer(buffer.as_raw())
            .map_or((0, vk::BufferUsageFlags::empty()), |b| (b.size, b.usage));
        let alignment = if usage.intersects(
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
        ) {
            self.config.min_uniform_buffer_offset_alignment
        } else {
            16
        };
        vk::MemoryRequirements {
            size: size.next_multiple_of(alignment),
            alignment,
            memory_type_bits: self.all_memory_types(),
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VulkanResult<()> {
        let mut state = self.state.lock();
        let Some(memory_len) = state.memory(memory.as_raw()).map(|m| m.data.len() as u64) else {
            state.violation(format!("binding buffer to unknown memory {memory:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        };
        let Some(object) = state.buffer(buffer.as_raw()) else {
            state.violation(format!("binding unknown buffer {buffer:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        };
        let already_bound = object.binding.is_some();
        let overflow = offset + object.size > memory_len;
        if !already_bound && !overflow {
            object.binding = Some((key_of(memory.as_raw()), offset));
        }
        if already_bound {
            state.violation(format!("buffer {buffer:?} is already bound"));
        }
        if overflow {
            state.violation(format!("buffer {buffer:?} bound past the end of its memory"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        }
        Ok(())
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let mut state = self.state.lock();
        let Some((usage, binding)) = state.buffer(buffer.as_raw()).map(|b| (b.usage, b.binding))
        else {
            state.violation(format!("device address of unknown buffer {buffer:?}"));
            return 0;
        };
        if !usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            state.violation(format!("buffer {buffer:?} lacks SHADER_DEVICE_ADDRESS usage"));
        }
        let Some((memory, offset)) = binding else {
            return 0;
        };
        match state.objects.get(memory) {
            Some(Object::Memory(object)) => {
                if !object.device_address {
                    let message = format!(
                        "memory backing {buffer:?} was not allocated with DEVICE_ADDRESS"
                    );
                    state.violation(message);
                    return 0;
                }
                object.base_address + offset
            }
            _ => 0,
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.destroy(buffer.as_raw(), vk::ObjectType::BUFFER);
    }

    fn create_image(&self, desc: &ImageDesc) -> VulkanResult<vk::Image> {
        let mut state = self.state.lock();
        let extent = desc.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            state.violation("image created with a zero extent");
            return Err(VulkanError::InvalidOperation {
                reason: "image extent must be non-zero".to_string(),
            });
        }
        if desc.mip_levels == 0 || desc.array_layers == 0 {
            state.violation("image created without mips or layers");
            return Err(VulkanError::InvalidOperation {
                reason: "image needs at least one mip level and layer".to_string(),
            });
        }
        if desc.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE) && desc.array_layers % 6 != 0 {
            state.violation("cube-compatible image with a layer count that is not a multiple of 6");
        }
        let raw = state.insert(Object::Image(ImageObject::new(*desc)));
        Ok(vk::Image::from_raw(raw))
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let mut state = self.state.lock();
        let size = state
            .image(image.as_raw())
            .map_or(0, |object| image_bytes(&object.desc));
        vk::MemoryRequirements {
            size: size.next_multiple_of(1024),
            alignment: 1024,
            memory_type_bits: self.all_memory_types(),
        }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VulkanResult<()> {
        let mut state = self.state.lock();
        let Some(memory_len) = state.memory(memory.as_raw()).map(|m| m.data.len() as u64) else {
            state.violation(format!("binding image to unknown memory {memory:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        };
        let Some(object) = state.image(image.as_raw()) else {
            state.violation(format!("binding unknown image {image:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        };
        if object.binding.is_some() || offset + image_bytes(&object.desc) > memory_len {
            state.violation(format!("invalid memory binding for image {image:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        }
        object.binding = Some((key_of(memory.as_raw()), offset));
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        self.destroy(image.as_raw(), vk::ObjectType::IMAGE);
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> VulkanResult<vk::ImageView> {
        let mut state = self.state.lock();
        let Some(image) = state.image(desc.image.as_raw()) else {
            state.violation(format!("view of unknown image {:?}", desc.image));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        };
        let in_range = desc.base_mip_level + desc.level_count <= image.desc.mip_levels
            && desc.base_array_layer + desc.layer_count <= image.desc.array_layers;
        if !in_range {
            state.violation(format!("view range outside image {:?}", desc.image));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        }
        let raw = state.insert(Object::ImageView { image: desc.image });
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.destroy(view.as_raw(), vk::ObjectType::IMAGE_VIEW);
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> VulkanResult<vk::Sampler> {
        let mut state = self.state.lock();
        if desc.max_anisotropy.is_some_and(|anisotropy| anisotropy > 16.0) {
            state.violation("sampler anisotropy exceeds maxSamplerAnisotropy");
        }
        let raw = state.insert(Object::Sampler);
        Ok(vk::Sampler::from_raw(raw))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.destroy(sampler.as_raw(), vk::ObjectType::SAMPLER);
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
        _flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> VulkanResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let mut seen = Vec::with_capacity(bindings.len());
        for binding in bindings {
            if seen.contains(&binding.binding) {
                state.violation(format!("duplicate layout binding {}", binding.binding));
            }
            seen.push(binding.binding);
        }
        let bindings = bindings
            .iter()
            .map(|binding| LayoutBinding {
                binding: binding.binding,
                ty: binding.descriptor_type,
                count: binding.descriptor_count,
            })
            .collect();
        let raw = state.insert(Object::DescriptorSetLayout(bindings));
        Ok(vk::DescriptorSetLayout::from_raw(raw))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.destroy(layout.as_raw(), vk::ObjectType::DESCRIPTOR_SET_LAYOUT);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> VulkanResult<vk::DescriptorPool> {
        let mut remaining = HashMap::new();
        for size in pool_sizes {
            *remaining.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        let raw = self.state.lock().insert(Object::DescriptorPool(DescriptorPoolObject {
            max_sets,
            flags,
            remaining,
            sets: Vec::new(),
        }));
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        if let Some(Object::DescriptorPool(object)) =
            state.remove(pool.as_raw(), vk::ObjectType::DESCRIPTOR_POOL)
        {
            for set in object.sets {
                state.objects.remove(set);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        let Some(bindings) = state.layout_bindings(layout.as_raw()) else {
            state.violation(format!("allocating with unknown layout {layout:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        };
        let Some(object) = state.descriptor_pool(pool.as_raw()) else {
            state.violation(format!("allocating from unknown pool {pool:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        };
        if object.sets.len() >= object.max_sets as usize {
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        let mut needed: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for binding in &bindings {
            *needed.entry(binding.ty).or_insert(0) += binding.count;
        }
        let fits = needed
            .iter()
            .all(|(ty, count)| object.remaining.get(ty).copied().unwrap_or(0) >= *count);
        if !fits {
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        for (ty, count) in &needed {
            if let Some(remaining) = object.remaining.get_mut(ty) {
                *remaining -= count;
            }
        }

        let pool_key = key_of(pool.as_raw());
        let set = state.objects.insert(Object::DescriptorSet(DescriptorSetObject {
            pool: pool_key,
            bindings,
            writes: HashMap::new(),
        }));
        if let Some(object) = state.descriptor_pool(pool.as_raw()) {
            object.sets.push(set);
        }
        Ok(vk::DescriptorSet::from_raw(raw_of(set)))
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VulkanResult<()> {
        let mut state = self.state.lock();
        let pool_key = key_of(pool.as_raw());
        let Some(flags) = state.descriptor_pool(pool.as_raw()).map(|p| p.flags) else {
            state.violation(format!("freeing sets into unknown pool {pool:?}"));
            return Ok(());
        };
        if !flags.contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            state.violation(format!("pool {pool:?} was not created with FREE_DESCRIPTOR_SET"));
            return Ok(());
        }
        for set in sets {
            let owner = state.descriptor_set(set.as_raw()).map(|s| s.pool);
            if owner != Some(pool_key) {
                state.violation(format!("set {set:?} does not belong to pool {pool:?}"));
                continue;
            }
            if let Some(Object::DescriptorSet(object)) =
                state.remove(set.as_raw(), vk::ObjectType::DESCRIPTOR_SET)
            {
                if let Some(pool) = state.descriptor_pool(pool.as_raw()) {
                    pool.sets.retain(|key| *key != key_of(set.as_raw()));
                    for binding in object.bindings {
                        *pool.remaining.entry(binding.ty).or_insert(0) += binding.count;
                    }
                }
            }
        }
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        for write in writes {
            let mut problems = Vec::new();
            match &write.resources {
                DescriptorResources::Buffers(infos) => {
                    for info in infos {
                        if !state.is_kind(info.buffer.as_raw(), vk::ObjectType::BUFFER) {
                            problems.push(format!("write references dead buffer {:?}", info.buffer));
                        }
                    }
                }
                DescriptorResources::Images(infos) => {
                    for info in infos {
                        if info.image_view != vk::ImageView::null()
                            && !state.is_kind(info.image_view.as_raw(), vk::ObjectType::IMAGE_VIEW)
                        {
                            problems.push(format!("write references dead view {:?}", info.image_view));
                        }
                        if info.sampler != vk::Sampler::null()
                            && !state.is_kind(info.sampler.as_raw(), vk::ObjectType::SAMPLER)
                        {
                            problems.push(format!("write references dead sampler {:?}", info.sampler));
                        }
                    }
                }
                DescriptorResources::AccelerationStructures(_) => {}
            }

            let Some(set) = state.descriptor_set(write.set.as_raw()) else {
                state.violation(format!("writing to unknown descriptor set {:?}", write.set));
                continue;
            };
            match set.bindings.iter().find(|b| b.binding == write.binding).copied() {
                None => problems.push(format!("binding {} not in layout", write.binding)),
                Some(binding) => {
                    if binding.ty != write.descriptor_type {
                        problems.push(format!(
                            "binding {} is {:?}, written as {:?}",
                            write.binding, binding.ty, write.descriptor_type
                        ));
                    }
                    if write.array_element as usize + write.resources.len() > binding.count as usize {
                        problems.push(format!("binding {} overflowed", write.binding));
                    }
                    set.writes.insert(write.binding, write.resources.clone());
                }
            }
            for problem in problems {
                state.violation(problem);
            }
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> VulkanResult<vk::ShaderModule> {
        let mut state = self.state.lock();
        if code.first() != Some(&SPIRV_MAGIC) {
            state.violation("shader module without the SPIR-V magic number");
            return Err(VulkanError::Api(vk::Result::ERROR_INVALID_SHADER_NV));
        }
        let raw = state.insert(Object::ShaderModule);
        Ok(vk::ShaderModule::from_raw(raw))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.destroy(module.as_raw(), vk::ObjectType::SHADER_MODULE);
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<vk::PipelineLayout> {
        let mut state = self.state.lock();
        for layout in set_layouts {
            Self::check_alive(
                &mut state,
                layout.as_raw(),
                vk::ObjectType::DESCRIPTOR_SET_LAYOUT,
                "pipeline layout set layout",
            );
        }
        let raw = state.insert(Object::PipelineLayout);
        Ok(vk::PipelineLayout::from_raw(raw))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.destroy(layout.as_raw(), vk::ObjectType::PIPELINE_LAYOUT);
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VulkanResult<vk::Pipeline> {
        let mut state = self.state.lock();
        Self::check_alive(&mut state, desc.layout.as_raw(), vk::ObjectType::PIPELINE_LAYOUT, "layout");
        for stage in &desc.stages {
            Self::check_alive(&mut state, stage.module.as_raw(), vk::ObjectType::SHADER_MODULE, "stage");
        }
        let raw = state.insert(Object::Pipeline(vk::PipelineBindPoint::GRAPHICS));
        Ok(vk::Pipeline::from_raw(raw))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> VulkanResult<vk::Pipeline> {
        let mut state = self.state.lock();
        Self::check_alive(&mut state, desc.layout.as_raw(), vk::ObjectType::PIPELINE_LAYOUT, "layout");
        Self::check_alive(
            &mut state,
            desc.stage.module.as_raw(),
            vk::ObjectType::SHADER_MODULE,
            "stage",
        );
        let raw = state.insert(Object::Pipeline(vk::PipelineBindPoint::COMPUTE));
        Ok(vk::Pipeline::from_raw(raw))
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> VulkanResult<vk::Pipeline> {
        if !self.config.ray_tracing {
            return Err(VulkanError::ExtensionNotLoaded("VK_KHR_ray_tracing_pipeline"));
        }
        let mut state = self.state.lock();
        Self::check_alive(&mut state, desc.layout.as_raw(), vk::ObjectType::PIPELINE_LAYOUT, "layout");
        for stage in &desc.stages {
            Self::check_alive(&mut state, stage.module.as_raw(), vk::ObjectType::SHADER_MODULE, "stage");
        }
        let raw = state.insert(Object::Pipeline(vk::PipelineBindPoint::RAY_TRACING_KHR));
        Ok(vk::Pipeline::from_raw(raw))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.destroy(pipeline.as_raw(), vk::ObjectType::PIPELINE);
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> VulkanResult<vk::CommandPool> {
        let raw = self.state.lock().insert(Object::CommandPool(Vec::new()));
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if let Some(Object::CommandPool(buffers)) =
            state.remove(pool.as_raw(), vk::ObjectType::COMMAND_POOL)
        {
            for buffer in buffers {
                if let Some(Object::CommandBuffer(object)) = state.objects.remove(buffer) {
                    if object.state == CommandBufferState::Pending {
                        state.violation("command pool destroyed while a buffer is pending");
                    }
                }
            }
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        let pool_key = key_of(pool.as_raw());
        if !state.is_kind(pool.as_raw(), vk::ObjectType::COMMAND_POOL) {
            state.violation(format!("allocating from unknown command pool {pool:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        }
        let keys: Vec<_> = (0..count)
            .map(|_| {
                state.objects.insert(Object::CommandBuffer(CommandBufferObject {
                    pool: pool_key,
                    state: CommandBufferState::Initial,
                    commands: Vec::new(),
                }))
            })
            .collect();
        if let Some(Object::CommandPool(buffers)) = state.objects.get_mut(pool_key) {
            buffers.extend(keys.iter().copied());
        }
        Ok(keys
            .into_iter()
            .map(|key| vk::CommandBuffer::from_raw(raw_of(key)))
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for buffer in buffers {
            let pending = state
                .command_buffer(buffer.as_raw())
                .is_some_and(|object| object.state == CommandBufferState::Pending);
            if pending {
                state.violation(format!("freeing pending command buffer {buffer:?}"));
            }
            if let Some(Object::CommandBuffer(object)) =
                state.remove(buffer.as_raw(), vk::ObjectType::COMMAND_BUFFER)
            {
                if let Some(Object::CommandPool(list)) = state.objects.get_mut(object.pool) {
                    list.retain(|key| *key != key_of(buffer.as_raw()));
                }
            }
        }
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _one_time_submit: bool,
    ) -> VulkanResult<()> {
        let mut state = self.state.lock();
        let Some(object) = state.command_buffer(cmd.as_raw()) else {
            state.violation(format!("beginning unknown command buffer {cmd:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN));
        };
        match object.state {
            CommandBufferState::Initial | CommandBufferState::Executable => {
                object.state = CommandBufferState::Recording;
                object.commands.clear();
                Ok(())
            }
            other => {
                state.violation(format!("beginning command buffer {cmd:?} in state {other:?}"));
                Err(VulkanError::InvalidOperation {
                    reason: format!("command buffer is {other:?}"),
                })
            }
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        let mut state = self.state.lock();
        match state.command_buffer(cmd.as_raw()) {
            Some(object) if object.state == CommandBufferState::Recording => {
                object.state = CommandBufferState::Executable;
                Ok(())
            }
            _ => {
                state.violation(format!("ending command buffer {cmd:?} that is not recording"));
                Err(VulkanError::InvalidOperation {
                    reason: "command buffer is not recording".to_string(),
                })
            }
        }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        let mut state = self.state.lock();
        match state.command_buffer(cmd.as_raw()) {
            Some(object) if object.state != CommandBufferState::Pending => {
                object.state = CommandBufferState::Initial;
                object.commands.clear();
                Ok(())
            }
            Some(_) => {
                state.violation(format!("resetting command buffer {cmd:?} while pending"));
                Err(VulkanError::InvalidOperation {
                    reason: "command buffer is pending".to_string(),
                })
            }
            None => {
                state.violation(format!("resetting unknown command buffer {cmd:?}"));
                Err(VulkanError::Api(vk::Result::ERROR_UNKNOWN))
            }
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        _memory_barriers: &[vk::MemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        let records = image_barriers
            .iter()
            .map(|barrier| ImageBarrierRecord {
                image: barrier.image,
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
                range: barrier.subresource_range,
            })
            .collect();
        self.record(cmd, Command::Barrier(records));
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(
            cmd,
            Command::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            cmd,
            Command::CopyBufferToImage {
                src,
                dst,
                layout: dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            cmd,
            Command::CopyImageToBuffer {
                src,
                layout: src_layout,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        self.record(
            cmd,
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        _filter: vk::Filter,
    ) {
        self.record(
            cmd,
            Command::Blit {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let raw = self.state.lock().insert(Object::Fence { signaled });
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        let key = key_of(fence.as_raw());
        if state.pending.iter().any(|submission| submission.fence == Some(key)) {
            state.violation(format!("destroying fence {fence:?} of a pending submission"));
        }
        state.remove(fence.as_raw(), vk::ObjectType::FENCE);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout: u64) -> VulkanResult<()> {
        let mut state = self.state.lock();
        for fence in fences {
            state.events.push(HeadlessEvent::FenceWait { fence: *fence });
            if !state.complete_until_fence(fence.as_raw()) {
                state.violation(format!("waiting on fence {fence:?} that will never signal"));
                return Err(VulkanError::Api(vk::Result::TIMEOUT));
            }
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VulkanResult<()> {
        let mut state = self.state.lock();
        for fence in fences {
            let key = key_of(fence.as_raw());
            if state.pending.iter().any(|submission| submission.fence == Some(key)) {
                state.violation(format!("resetting fence {fence:?} of a pending submission"));
            }
            if !state.set_fence(fence.as_raw(), false) {
                state.violation(format!("resetting unknown fence {fence:?}"));
            }
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> VulkanResult<bool> {
        self.state
            .lock()
            .fence_signaled(fence.as_raw())
            .ok_or(VulkanError::Api(vk::Result::ERROR_UNKNOWN))
    }

    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore> {
        let raw = self.state.lock().insert(Object::Semaphore { signaled: false });
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.destroy(semaphore.as_raw(), vk::ObjectType::SEMAPHORE);
    }

    fn queue_submit(
        &self,
        _queue: QueueKind,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VulkanResult<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.submit_failure.take() {
            return Err(VulkanError::Api(result));
        }
        let fence_key = if fence == vk::Fence::null() {
            None
        } else {
            if state.fence_signaled(fence.as_raw()) != Some(false) {
                state.violation(format!("submitting with fence {fence:?} that is signaled or unknown"));
            }
            Some(key_of(fence.as_raw()))
        };

        let mut command_buffers = Vec::new();
        let mut signal_semaphores = Vec::new();
        for batch in batches {
            if batch.wait_semaphores.len() != batch.wait_stages.len() {
                state.violation("wait semaphore and wait stage counts differ");
            }
            for semaphore in batch.wait_semaphores {
                state.set_semaphore(semaphore.as_raw(), false);
            }
            for cmd in batch.command_buffers {
                match state.command_buffer(cmd.as_raw()) {
                    Some(object) if object.state == CommandBufferState::Executable => {
                        object.state = CommandBufferState::Pending;
                    }
                    Some(object) => {
                        let current = object.state;
                        state.violation(format!("submitting {cmd:?} in state {current:?}"));
                    }
                    None => state.violation(format!("submitting unknown command buffer {cmd:?}")),
                }
                command_buffers.push(key_of(cmd.as_raw()));
            }
            signal_semaphores.extend(batch.signal_semaphores.iter().map(|s| key_of(s.as_raw())));
        }

        let id = state.next_submission;
        state.next_submission += 1;
        state.pending.push_back(PendingSubmission {
            id,
            command_buffers,
            signal_semaphores,
            fence: fence_key,
        });
        state.events.push(HeadlessEvent::Submit {
            submission: id,
            fence,
        });
        Ok(())
    }

    fn device_wait_idle(&self) -> VulkanResult<()> {
        let mut state = self.state.lock();
        state.events.push(HeadlessEvent::Idle);
        state.complete_all();
        Ok(())
    }

    fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VulkanResult<SwapchainImages> {
        let mut state = self.state.lock();
        if Some(desc.surface) != self.surface {
            return Err(VulkanError::Api(vk::Result::ERROR_SURFACE_LOST_KHR));
        }
        let extent = state.surface_extent.unwrap_or(desc.extent);
        let format = vk::SurfaceFormatKHR {
            format: match desc.preferred_format {
                vk::Format::B8G8R8A8_SRGB | vk::Format::B8G8R8A8_UNORM => desc.preferred_format,
                _ => vk::Format::B8G8R8A8_SRGB,
            },
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let image_desc = ImageDesc {
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            format: format.format,
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            flags: vk::ImageCreateFlags::empty(),
            samples: vk::SampleCountFlags::TYPE_1,
        };

        let mut images = Vec::new();
        let mut memory = Vec::new();
        for _ in 0..self.config.swapchain_image_count {
            let len = usize::try_from(image_bytes(&image_desc)).unwrap_or(0);
            let memory_key = state.objects.insert(Object::Memory(MemoryObject {
                data: vec![0; len],
                type_index: 0,
                heap_index: 0,
                mapped: false,
                base_address: 0,
                device_address: false,
                internal: true,
            }));
            let mut image = ImageObject::new(image_desc);
            image.binding = Some((memory_key, 0));
            images.push(vk::Image::from_raw(state.insert(Object::Image(image))));
            memory.push(memory_key);
        }

        let raw = state.insert(Object::Swapchain(SwapchainObject {
            images: images.clone(),
            memory,
            extent,
            next_index: 0,
        }));
        state.scripted_indices.clear();
        Ok(SwapchainImages {
            handle: vk::SwapchainKHR::from_raw(raw),
            images,
            format,
            extent,
            present_mode: if desc.prefer_mailbox {
                vk::PresentModeKHR::MAILBOX
            } else {
                vk::PresentModeKHR::FIFO
            },
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        if let Some(Object::Swapchain(object)) =
            state.remove(swapchain.as_raw(), vk::ObjectType::SWAPCHAIN_KHR)
        {
            for image in object.images {
                state.objects.remove(key_of(image.as_raw()));
            }
            for memory in object.memory {
                state.objects.remove(memory);
            }
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VulkanResult<(u32, bool)> {
        let mut state = self.state.lock();
        let surface_extent = state.surface_extent;
        let scripted = state.scripted_indices.pop_front();
        let suboptimal = state.report_suboptimal;
        let Some(object) = state.swapchain(swapchain.as_raw()) else {
            state.violation(format!("acquiring from unknown swapchain {swapchain:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR));
        };
        if surface_extent.is_some_and(|extent| extent != object.extent) {
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        let count = u32::try_from(object.images.len()).unwrap_or(1);
        let image_index = scripted.unwrap_or(object.next_index) % count;
        object.next_index = (image_index + 1) % count;
        state.set_semaphore(semaphore.as_raw(), true);
        state.events.push(HeadlessEvent::Acquire { image_index });
        Ok((image_index, suboptimal))
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VulkanResult<bool> {
        let mut state = self.state.lock();
        let surface_extent = state.surface_extent;
        let suboptimal = state.report_suboptimal;
        let Some(object) = state.swapchain(swapchain.as_raw()) else {
            state.violation(format!("presenting to unknown swapchain {swapchain:?}"));
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR));
        };
        let image_count = object.images.len();
        let stale = surface_extent.is_some_and(|extent| extent != object.extent);

        let semaphore_key = key_of(wait_semaphore.as_raw());
        let will_signal = state
            .pending
            .iter()
            .any(|submission| submission.signal_semaphores.contains(&semaphore_key));
        let signaled = matches!(
            state.objects.get(semaphore_key),
            Some(Object::Semaphore { signaled: true })
        );
        if !will_signal && !signaled {
            state.violation(format!("present waits on {wait_semaphore:?} that nothing signals"));
        }
        state.set_semaphore(wait_semaphore.as_raw(), false);

        if image_index as usize >= image_count {
            state.violation(format!("presenting image {image_index} of {image_count}"));
        }
        if stale {
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        state.events.push(HeadlessEvent::Present { image_index });
        Ok(suboptimal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique_and_nonzero() {
        let device = HeadlessDevice::new();
        let a = device.create_fence(false).unwrap();
        let b = device.create_fence(false).unwrap();
        assert_ne!(a.as_raw(), 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stale_handle_detected() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        device.destroy_fence(fence);
        assert!(!device.is_alive(fence));

        let replacement = device.create_fence(false).unwrap();
        assert_ne!(replacement, fence);
        device.destroy_fence(fence);
        assert_eq!(device.validation_errors().len(), 1);
    }

    #[test]
    fn test_submission_completes_on_fence_wait() {
        let device = HeadlessDevice::new();
        let pool = device.create_command_pool(0).unwrap();
        let cmd = device.allocate_command_buffers(pool, 1).unwrap()[0];
        let fence = device.create_fence(false).unwrap();

        device.begin_command_buffer(cmd, true).unwrap();
        device.end_command_buffer(cmd).unwrap();
        device
            .queue_submit(
                QueueKind::Graphics,
                &[SubmitBatch {
                    command_buffers: &[cmd],
                    ..Default::default()
                }],
                fence,
            )
            .unwrap();

        assert!(!device.fence_status(fence).unwrap());
        assert_eq!(device.pending_submissions(), 1);
        device.wait_for_fences(&[fence], u64::MAX).unwrap();
        assert!(device.fence_status(fence).unwrap());
        assert_eq!(device.pending_submissions(), 0);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_waiting_on_unsubmitted_fence_times_out() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        let result = device.wait_for_fences(&[fence], u64::MAX);
        assert_eq!(result, Err(VulkanError::Api(vk::Result::TIMEOUT)));
    }

    #[test]
    fn test_descriptor_pool_capacity() {
        let device = HeadlessDevice::new();
        let binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build();
        let layout = device
            .create_descriptor_set_layout(&[binding], vk::DescriptorSetLayoutCreateFlags::empty())
            .unwrap();
        let pool = device
            .create_descriptor_pool(
                2,
                &[vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 10,
                }],
                vk::DescriptorPoolCreateFlags::empty(),
            )
            .unwrap();

        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
        assert_eq!(
            device.allocate_descriptor_set(pool, layout),
            Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        );
    }

    #[test]
    fn test_map_device_local_memory_is_rejected() {
        let device = HeadlessDevice::new();
        let memory = device
            .allocate_memory(&MemoryAllocateDesc {
                size: 256,
                memory_type_index: 0,
                priority: 0.5,
                device_address: false,
                export_handle_types: vk::ExternalMemoryHandleTypeFlags::empty(),
                dedicated: crate::backend::DedicatedTarget::None,
            })
            .unwrap();
        assert!(device.map_memory(memory, 0, vk::WHOLE_SIZE).is_err());
        assert_eq!(device.validation_errors().len(), 1);
    }

    #[test]
    fn test_heap_budget_enforced() {
        let device =
            HeadlessDevice::with_config(HeadlessConfig::default().with_heap_sizes(1024, 1024));
        let desc = MemoryAllocateDesc {
            size: 1024,
            memory_type_index: 0,
            priority: 0.5,
            device_address: false,
            export_handle_types: vk::ExternalMemoryHandleTypeFlags::empty(),
            dedicated: crate::backend::DedicatedTarget::None,
        };
        let memory = device.allocate_memory(&desc).unwrap();
        assert_eq!(
            device.allocate_memory(&desc),
            Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        );
        device.free_memory(memory);
        assert_eq!(device.heap_usage(0), 0);
        assert!(device.allocate_memory(&desc).is_ok());
    }

    #[test]
    fn test_resized_surface_reports_out_of_date() {
        let device = HeadlessDevice::new();
        let surface = device.surface().unwrap();
        let swapchain = device
            .create_swapchain(&SwapchainDesc {
                surface,
                extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                preferred_format: vk::Format::B8G8R8A8_SRGB,
                prefer_mailbox: true,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap();
        let semaphore = device.create_semaphore().unwrap();

        assert_eq!(device.acquire_next_image(swapchain.handle, semaphore), Ok((0, false)));
        device.set_surface_extent(vk::Extent2D {
            width: 1024,
            height: 768,
        });
        let result = device.acquire_next_image(swapchain.handle, semaphore);
        assert!(result.unwrap_err().is_out_of_date());
    }
}
