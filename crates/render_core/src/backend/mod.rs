//! Device capability interface
//!
//! Every component of the core talks to the GPU through [`GpuDevice`], a narrow
//! trait expressed in `ash::vk` vocabulary. Two implementations exist:
//!
//! - [`vulkan::VulkanDevice`]: the real `ash` backend (instance, physical device
//!   selection, logical device, optional window surface).
//! - [`headless::HeadlessDevice`]: a CPU simulation of the same contract with an
//!   in-order queue, real descriptor pool limits and scripted presentation, used by
//!   the test suite and the demo application.
//!
//! The trait takes `&self` everywhere; implementations are `Send + Sync` so a
//! single device can be shared by the render thread and background loaders.

use ash::vk;
use std::ffi::CString;

use crate::error::VulkanResult;

/// Ash-backed Vulkan device
pub mod vulkan;

/// CPU-simulated device
pub mod headless;

pub use headless::{HeadlessConfig, HeadlessDevice, HeadlessEvent};
pub use vulkan::{VulkanDevice, VulkanDeviceConfig};

/// Hardware queue a submission targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics (and compute/transfer) queue
    Graphics,
    /// Presentation queue
    Present,
}

/// Object a dedicated allocation is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedicatedTarget {
    /// Ordinary allocation, may be sub-allocated
    #[default]
    None,
    /// Allocation owned by exactly this buffer
    Buffer(vk::Buffer),
    /// Allocation owned by exactly this image
    Image(vk::Image),
}

/// Parameters for a raw `vkAllocateMemory` call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryAllocateDesc {
    /// Allocation size in bytes
    pub size: vk::DeviceSize,
    /// Memory type index chosen by the memory pool
    pub memory_type_index: u32,
    /// Residency priority hint in `[0, 1]`
    pub priority: f32,
    /// Allocate with `VK_MEMORY_ALLOCATE_DEVICE_ADDRESS_BIT`
    pub device_address: bool,
    /// External handle types for cross-process sharing (empty for none)
    pub export_handle_types: vk::ExternalMemoryHandleTypeFlags,
    /// Dedicated allocation target
    pub dedicated: DedicatedTarget,
}

/// Parameters for image creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Image extent (depth 1 for 2D images)
    pub extent: vk::Extent3D,
    /// Texel format
    pub format: vk::Format,
    /// Number of mip levels
    pub mip_levels: u32,
    /// Number of array layers (6 for cubemaps)
    pub array_layers: u32,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Creation flags (`CUBE_COMPATIBLE` for cubemaps)
    pub flags: vk::ImageCreateFlags,
    /// Sample count
    pub samples: vk::SampleCountFlags,
}

/// Parameters for image view creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewDesc {
    /// Image the view refers to
    pub image: vk::Image,
    /// View dimensionality
    pub view_type: vk::ImageViewType,
    /// View format
    pub format: vk::Format,
    /// Aspect mask
    pub aspect: vk::ImageAspectFlags,
    /// First mip level visible through the view
    pub base_mip_level: u32,
    /// Number of mip levels visible through the view
    pub level_count: u32,
    /// First array layer visible through the view
    pub base_array_layer: u32,
    /// Number of array layers visible through the view
    pub layer_count: u32,
}

/// Sampler configuration carried by images
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    /// Magnification filter
    pub mag_filter: vk::Filter,
    /// Minification filter
    pub min_filter: vk::Filter,
    /// Mipmap filter
    pub mipmap_mode: vk::SamplerMipmapMode,
    /// Addressing for all three coordinates
    pub address_mode: vk::SamplerAddressMode,
    /// Anisotropy level, `None` disables anisotropic filtering
    pub max_anisotropy: Option<f32>,
    /// Maximum level of detail
    pub max_lod: f32,
    /// Border color for clamp-to-border addressing
    pub border_color: vk::BorderColor,
    /// Depth comparison, `None` disables compare
    pub compare_op: Option<vk::CompareOp>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
            compare_op: None,
        }
    }
}

/// Concrete resources written into one descriptor binding
#[derive(Debug, Clone)]
pub enum DescriptorResources {
    /// Uniform/storage buffer ranges
    Buffers(Vec<vk::DescriptorBufferInfo>),
    /// Sampled/storage images
    Images(Vec<vk::DescriptorImageInfo>),
    /// Top-level acceleration structures
    AccelerationStructures(Vec<vk::AccelerationStructureKHR>),
}

impl DescriptorResources {
    /// Number of descriptors carried by this write
    pub fn len(&self) -> usize {
        match self {
            Self::Buffers(infos) => infos.len(),
            Self::Images(infos) => infos.len(),
            Self::AccelerationStructures(structures) => structures.len(),
        }
    }

    /// Whether no descriptors are carried
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// `ash` only derives equality for a handful of plain structs, so compare the
// descriptor infos field by field.
impl PartialEq for DescriptorResources {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Buffers(a), Self::Buffers(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(a, b)| {
                        (a.buffer, a.offset, a.range) == (b.buffer, b.offset, b.range)
                    })
            }
            (Self::Images(a), Self::Images(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(a, b)| {
                        (a.sampler, a.image_view, a.image_layout)
                            == (b.sampler, b.image_view, b.image_layout)
                    })
            }
            (Self::AccelerationStructures(a), Self::AccelerationStructures(b)) => a == b,
            _ => false,
        }
    }
}

/// One batched descriptor update
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorWrite {
    /// Destination set
    pub set: vk::DescriptorSet,
    /// Destination binding slot
    pub binding: u32,
    /// First array element written
    pub array_element: u32,
    /// Descriptor type declared by the layout
    pub descriptor_type: vk::DescriptorType,
    /// Resources to bind
    pub resources: DescriptorResources,
}

/// One queue submission batch
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    /// Semaphores waited on before execution
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Stage at which each wait semaphore blocks
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Command buffers executed in order
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores signaled on completion
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Swapchain creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    /// Surface to present to
    pub surface: vk::SurfaceKHR,
    /// Desired extent, clamped to the surface capabilities
    pub extent: vk::Extent2D,
    /// Preferred surface format (falls back to the first supported one)
    pub preferred_format: vk::Format,
    /// Use mailbox presentation when available, FIFO otherwise
    pub prefer_mailbox: bool,
    /// Swapchain being replaced, or null
    pub old_swapchain: vk::SwapchainKHR,
}

/// Result of swapchain creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainImages {
    /// Swapchain handle
    pub handle: vk::SwapchainKHR,
    /// Presentable images owned by the swapchain
    pub images: Vec<vk::Image>,
    /// Chosen surface format
    pub format: vk::SurfaceFormatKHR,
    /// Chosen extent
    pub extent: vk::Extent2D,
    /// Chosen presentation mode
    pub present_mode: vk::PresentModeKHR,
}

/// Shader stage used by pipeline creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageDesc {
    /// Stage this module executes in
    pub stage: vk::ShaderStageFlags,
    /// Compiled module
    pub module: vk::ShaderModule,
    /// Entry point name
    pub entry_point: CString,
}

/// Fixed-function state and stages of a graphics pipeline
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    /// Shader stages (vertex + fragment at minimum)
    pub stages: Vec<ShaderStageDesc>,
    /// Vertex buffer bindings
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    /// Vertex attributes
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Polygon fill mode
    pub polygon_mode: vk::PolygonMode,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Winding order of front faces
    pub front_face: vk::FrontFace,
    /// Enable depth testing
    pub depth_test: bool,
    /// Enable depth writes
    pub depth_write: bool,
    /// Depth comparison
    pub depth_compare_op: vk::CompareOp,
    /// Enable alpha blending on every color attachment
    pub blend_enable: bool,
    /// Number of color attachments written by the fragment stage
    pub color_attachment_count: u32,
    /// Rasterization samples
    pub samples: vk::SampleCountFlags,
    /// Dynamic state (viewport and scissor by default)
    pub dynamic_states: Vec<vk::DynamicState>,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
    /// Render pass the pipeline is compatible with
    pub render_pass: vk::RenderPass,
    /// Subpass index
    pub subpass: u32,
}

/// Compute pipeline parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputePipelineDesc {
    /// Compute stage
    pub stage: ShaderStageDesc,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
}

/// Shader group of a ray tracing pipeline, indices refer to `stages`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayTracingGroup {
    /// Ray generation, miss or callable shader
    General(u32),
    /// Triangle hit group
    TrianglesHit {
        /// Closest-hit stage
        closest_hit: Option<u32>,
        /// Any-hit stage
        any_hit: Option<u32>,
    },
    /// Procedural hit group
    ProceduralHit {
        /// Intersection stage
        intersection: u32,
        /// Closest-hit stage
        closest_hit: Option<u32>,
        /// Any-hit stage
        any_hit: Option<u32>,
    },
}

/// Ray tracing pipeline parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RayTracingPipelineDesc {
    /// All shader stages referenced by the groups
    pub stages: Vec<ShaderStageDesc>,
    /// Shader groups
    pub groups: Vec<RayTracingGroup>,
    /// Maximum trace recursion depth
    pub max_recursion_depth: u32,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
}

/// GPU capability interface consumed by the whole core
///
/// # Safety contract
/// Handles passed in must have been created by the same device and not yet
/// destroyed. Destruction calls are only issued by the delete queue or by owners
/// that have already waited for the device to go idle.
pub trait GpuDevice: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> &str;

    /// Memory types and heaps exposed by the physical device
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    /// Physical device limits
    fn limits(&self) -> vk::PhysicalDeviceLimits;

    /// Optimal/linear/buffer feature support of a format
    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties;

    /// Queue family index backing a queue
    fn queue_family_index(&self, queue: QueueKind) -> u32;

    /// Attach a debug name to an object (no-op without debug utils)
    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str);

    // --- memory ---

    /// Allocate a block of device memory
    fn allocate_memory(&self, desc: &MemoryAllocateDesc) -> VulkanResult<vk::DeviceMemory>;

    /// Free device memory
    fn free_memory(&self, memory: vk::DeviceMemory);

    /// Map a range of host-visible memory
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<*mut u8>;

    /// Unmap previously mapped memory
    fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// Flush host writes of non-coherent memory
    fn flush_memory(&self, ranges: &[vk::MappedMemoryRange]) -> VulkanResult<()>;

    /// Invalidate host caches of non-coherent memory
    fn invalidate_memory(&self, ranges: &[vk::MappedMemoryRange]) -> VulkanResult<()>;

    // --- buffers ---

    /// Create a buffer object without memory
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<vk::Buffer>;

    /// Memory requirements of a buffer
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    /// Bind memory to a buffer
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VulkanResult<()>;

    /// GPU virtual address of a buffer created with `SHADER_DEVICE_ADDRESS`
    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress;

    /// Destroy a buffer object
    fn destroy_buffer(&self, buffer: vk::Buffer);

    // --- images ---

    /// Create an optimal-tiling image without memory
    fn create_image(&self, desc: &ImageDesc) -> VulkanResult<vk::Image>;

    /// Memory requirements of an image
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    /// Bind memory to an image
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VulkanResult<()>;

    /// Destroy an image object
    fn destroy_image(&self, image: vk::Image);

    /// Create an image view
    fn create_image_view(&self, desc: &ImageViewDesc) -> VulkanResult<vk::ImageView>;

    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);

    /// Create a sampler
    fn create_sampler(&self, desc: &SamplerDesc) -> VulkanResult<vk::Sampler>;

    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // --- descriptors ---

    /// Create a descriptor set layout
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> VulkanResult<vk::DescriptorSetLayout>;

    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Create a descriptor pool
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> VulkanResult<vk::DescriptorPool>;

    /// Destroy a descriptor pool and every set allocated from it
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate one descriptor set; pool exhaustion is reported as
    /// `ERROR_OUT_OF_POOL_MEMORY` or `ERROR_FRAGMENTED_POOL`
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet>;

    /// Return sets to a pool created with `FREE_DESCRIPTOR_SET`
    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VulkanResult<()>;

    /// Apply a batch of descriptor writes
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // --- shaders and pipelines ---

    /// Create a shader module from SPIR-V words
    fn create_shader_module(&self, code: &[u32]) -> VulkanResult<vk::ShaderModule>;

    /// Destroy a shader module
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    /// Create a pipeline layout
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<vk::PipelineLayout>;

    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    /// Create a graphics pipeline
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VulkanResult<vk::Pipeline>;

    /// Create a compute pipeline
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> VulkanResult<vk::Pipeline>;

    /// Create a ray tracing pipeline
    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> VulkanResult<vk::Pipeline>;

    /// Destroy a pipeline of any kind
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // --- commands ---

    /// Create a resettable command pool
    fn create_command_pool(&self, queue_family_index: u32) -> VulkanResult<vk::CommandPool>;

    /// Destroy a command pool and its command buffers
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocate primary command buffers
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VulkanResult<Vec<vk::CommandBuffer>>;

    /// Return command buffers to their pool
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    /// Begin recording
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time_submit: bool)
        -> VulkanResult<()>;

    /// End recording
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VulkanResult<()>;

    /// Reset a command buffer to the initial state
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VulkanResult<()>;

    /// Record a pipeline barrier
    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    );

    /// Record a buffer-to-buffer copy
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    /// Record a buffer-to-image copy
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    /// Record an image-to-buffer copy
    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );

    /// Record an image-to-image copy
    fn cmd_copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );

    /// Record a filtered image blit
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );

    // --- synchronization ---

    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence>;

    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);

    /// Block until every fence is signaled
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VulkanResult<()>;

    /// Return fences to the unsignaled state
    fn reset_fences(&self, fences: &[vk::Fence]) -> VulkanResult<()>;

    /// Whether a fence is signaled
    fn fence_status(&self, fence: vk::Fence) -> VulkanResult<bool>;

    /// Create a binary semaphore
    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore>;

    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // --- queues ---

    /// Submit batches to a queue, signaling `fence` when all complete
    fn queue_submit(
        &self,
        queue: QueueKind,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VulkanResult<()>;

    /// Block until the whole device is idle
    fn device_wait_idle(&self) -> VulkanResult<()>;

    // --- presentation ---

    /// Presentation surface, if the device was created with one
    fn surface(&self) -> Option<vk::SurfaceKHR>;

    /// Create (or recreate) a swapchain
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VulkanResult<SwapchainImages>;

    /// Destroy a swapchain
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Acquire the next presentable image; returns `(index, suboptimal)`
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VulkanResult<(u32, bool)>;

    /// Queue an image for presentation; returns `suboptimal`
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VulkanResult<bool>;
}
