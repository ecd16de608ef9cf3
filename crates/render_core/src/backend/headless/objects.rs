//! Object table of the headless device
//!
//! Every handle the headless device hands out is a `slotmap` key packed into the
//! 64-bit Vulkan handle, so stale handles are detected instead of aliasing a newer
//! object.

use ash::vk;
use slotmap::{DefaultKey, Key, KeyData, SlotMap};
use std::collections::HashMap;

use super::HeadlessEvent;
use crate::backend::{DescriptorResources, ImageDesc};

/// Convert a slotmap key to a raw Vulkan handle value
pub(super) fn raw_of(key: DefaultKey) -> u64 {
    key.data().as_ffi()
}

/// Convert a raw Vulkan handle value back to a slotmap key
pub(super) fn key_of(raw: u64) -> DefaultKey {
    KeyData::from_ffi(raw).into()
}

pub(super) struct MemoryObject {
    pub data: Vec<u8>,
    pub type_index: u32,
    pub heap_index: u32,
    pub mapped: bool,
    pub base_address: u64,
    pub device_address: bool,
    /// Swapchain-owned memory is not counted against heap budgets
    pub internal: bool,
}

pub(super) struct BufferObject {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub binding: Option<(DefaultKey, u64)>,
}

#[derive(Clone)]
pub(super) struct ImageObject {
    pub desc: ImageDesc,
    pub binding: Option<(DefaultKey, u64)>,
    /// One tracked layout per (mip, layer), mip-major
    pub layouts: Vec<vk::ImageLayout>,
}

impl ImageObject {
    pub fn new(desc: ImageDesc) -> Self {
        let subresources = (desc.mip_levels * desc.array_layers) as usize;
        Self {
            desc,
            binding: None,
            layouts: vec![vk::ImageLayout::UNDEFINED; subresources],
        }
    }

    pub fn layout_index(&self, mip: u32, layer: u32) -> usize {
        (mip * self.desc.array_layers + layer) as usize
    }

    /// Byte offset of a texel inside the image's linear backing store
    pub fn texel_offset(&self, mip: u32, layer: u32, x: u32, y: u32, z: u32) -> u64 {
        let texel = u64::from(texel_size(self.desc.format));
        let mut offset = 0;
        for level in 0..mip {
            offset += mip_bytes(&self.desc, level) * u64::from(self.desc.array_layers);
        }
        let extent = mip_extent(self.desc.extent, mip);
        offset += mip_bytes(&self.desc, mip) * u64::from(layer);
        let row = u64::from(extent.width) * texel;
        let slice = row * u64::from(extent.height);
        offset + u64::from(z) * slice + u64::from(y) * row + u64::from(x) * texel
    }
}

/// Size in bytes of one texel
pub(super) const fn texel_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::D32_SFLOAT_S8_UINT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

/// Extent of a mip level
pub(super) fn mip_extent(extent: vk::Extent3D, mip: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: (extent.width >> mip).max(1),
        height: (extent.height >> mip).max(1),
        depth: (extent.depth >> mip).max(1),
    }
}

/// Bytes of one layer of a mip level
pub(super) fn mip_bytes(desc: &ImageDesc, mip: u32) -> u64 {
    let extent = mip_extent(desc.extent, mip);
    u64::from(extent.width)
        * u64::from(extent.height)
        * u64::from(extent.depth)
        * u64::from(texel_size(desc.format))
}

/// Total linear backing size of an image
pub(super) fn image_bytes(desc: &ImageDesc) -> u64 {
    (0..desc.mip_levels)
        .map(|mip| mip_bytes(desc, mip) * u64::from(desc.array_layers))
        .sum()
}

#[derive(Clone, Copy)]
pub(super) struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
}

pub(super) struct DescriptorPoolObject {
    pub max_sets: u32,
    pub flags: vk::DescriptorPoolCreateFlags,
    pub remaining: HashMap<vk::DescriptorType, u32>,
    pub sets: Vec<DefaultKey>,
}

pub(super) struct DescriptorSetObject {
    pub pool: DefaultKey,
    pub bindings: Vec<LayoutBinding>,
    pub writes: HashMap<u32, DescriptorResources>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

#[derive(Clone)]
pub(super) struct ImageBarrierRecord {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub range: vk::ImageSubresourceRange,
}

#[derive(Clone)]
pub(super) enum Command {
    Barrier(Vec<ImageBarrierRecord>),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    Blit {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageBlit>,
    },
}

pub(super) struct CommandBufferObject {
    pub pool: DefaultKey,
    pub state: CommandBufferState,
    pub commands: Vec<Command>,
}

pub(super) struct SwapchainObject {
    pub images: Vec<vk::Image>,
    pub memory: Vec<DefaultKey>,
    pub extent: vk::Extent2D,
    pub next_index: u32,
}

pub(super) enum Object {
    Memory(MemoryObject),
    Buffer(BufferObject),
    Image(ImageObject),
    ImageView { image: vk::Image },
    Sampler,
    DescriptorSetLayout(Vec<LayoutBinding>),
    DescriptorPool(DescriptorPoolObject),
    DescriptorSet(DescriptorSetObject),
    ShaderModule,
    PipelineLayout,
    Pipeline(vk::PipelineBindPoint),
    CommandPool(Vec<DefaultKey>),
    CommandBuffer(CommandBufferObject),
    Fence { signaled: bool },
    Semaphore { signaled: bool },
    Surface,
    Swapchain(SwapchainObject),
}

impl Object {
    pub const fn object_type(&self) -> vk::ObjectType {
        match self {
            Self::Memory(_) => vk::ObjectType::DEVICE_MEMORY,
            Self::Buffer(_) => vk::ObjectType::BUFFER,
            Self::Image(_) => vk::ObjectType::IMAGE,
            Self::ImageView { .. } => vk::ObjectType::IMAGE_VIEW,
            Self::Sampler => vk::ObjectType::SAMPLER,
            Self::DescriptorSetLayout(_) => vk::ObjectType::DESCRIPTOR_SET_LAYOUT,
            Self::DescriptorPool(_) => vk::ObjectType::DESCRIPTOR_POOL,
            Self::DescriptorSet(_) => vk::ObjectType::DESCRIPTOR_SET,
            Self::ShaderModule => vk::ObjectType::SHADER_MODULE,
            Self::PipelineLayout => vk::ObjectType::PIPELINE_LAYOUT,
            Self::Pipeline(_) => vk::ObjectType::PIPELINE,
            Self::CommandPool(_) => vk::ObjectType::COMMAND_POOL,
            Self::CommandBuffer(_) => vk::ObjectType::COMMAND_BUFFER,
            Self::Fence { .. } => vk::ObjectType::FENCE,
            Self::Semaphore { .. } => vk::ObjectType::SEMAPHORE,
            Self::Surface => vk::ObjectType::SURFACE_KHR,
            Self::Swapchain(_) => vk::ObjectType::SWAPCHAIN_KHR,
        }
    }
}

pub(super) struct PendingSubmission {
    pub id: u64,
    pub command_buffers: Vec<DefaultKey>,
    pub signal_semaphores: Vec<DefaultKey>,
    pub fence: Option<DefaultKey>,
}

/// Mutable state of the headless device, guarded by one mutex
pub(super) struct State {
    pub objects: SlotMap<DefaultKey, Object>,
    pub heap_usage: Vec<u64>,
    pub next_address: u64,
    pub pending: std::collections::VecDeque<PendingSubmission>,
    pub next_submission: u64,
    pub events: Vec<HeadlessEvent>,
    pub validation_errors: Vec<String>,
    pub names: HashMap<u64, String>,
    pub surface_extent: Option<vk::Extent2D>,
    pub scripted_indices: std::collections::VecDeque<u32>,
    pub report_suboptimal: bool,
    pub submit_failure: Option<vk::Result>,
}

macro_rules! typed_access {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&mut self, raw: u64) -> Option<&mut $ty> {
            match self.objects.get_mut(key_of(raw)) {
                Some(Object::$variant(object)) => Some(object),
                _ => None,
            }
        }
    };
}

impl State {
    pub fn new(heap_count: usize, surface_extent: Option<vk::Extent2D>) -> Self {
        Self {
            objects: SlotMap::new(),
            heap_usage: vec![0; heap_count],
            next_address: 0x1_0000,
            pending: std::collections::VecDeque::new(),
            next_submission: 0,
            events: Vec::new(),
            validation_errors: Vec::new(),
            names: HashMap::new(),
            surface_extent,
            scripted_indices: std::collections::VecDeque::new(),
            report_suboptimal: false,
            submit_failure: None,
        }
    }

    pub fn insert(&mut self, object: Object) -> u64 {
        raw_of(self.objects.insert(object))
    }

    /// Record a contract violation the real validation layers would report
    pub fn violation(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!("[headless validation] {}", message);
        self.validation_errors.push(message);
    }

    /// Remove an object, reporting unknown or already destroyed handles
    pub fn remove(&mut self, raw: u64, expected: vk::ObjectType) -> Option<Object> {
        if raw == 0 {
            return None;
        }
        match self.objects.get(key_of(raw)) {
            Some(object) if object.object_type() == expected => {
                self.events.push(HeadlessEvent::Destroy {
                    object_type: expected,
                    handle: raw,
                });
                self.names.remove(&raw);
                self.objects.remove(key_of(raw))
            }
            Some(object) => {
                let actual = object.object_type();
                self.violation(format!(
                    "destroying {raw:#x} as {expected:?} but it is a {actual:?}"
                ));
                None
            }
            None => {
                self.violation(format!(
                    "destroying unknown or already destroyed {expected:?} {raw:#x}"
                ));
                None
            }
        }
    }

    typed_access!(memory, Memory, MemoryObject);
    typed_access!(buffer, Buffer, BufferObject);
    typed_access!(image, Image, ImageObject);
    typed_access!(descriptor_pool, DescriptorPool, DescriptorPoolObject);
    typed_access!(descriptor_set, DescriptorSet, DescriptorSetObject);
    typed_access!(command_buffer, CommandBuffer, CommandBufferObject);
    typed_access!(swapchain, Swapchain, SwapchainObject);

    pub fn layout_bindings(&self, raw: u64) -> Option<Vec<LayoutBinding>> {
        match self.objects.get(key_of(raw)) {
            Some(Object::DescriptorSetLayout(bindings)) => Some(bindings.clone()),
            _ => None,
        }
    }

    pub fn is_kind(&self, raw: u64, expected: vk::ObjectType) -> bool {
        self.objects
            .get(key_of(raw))
            .is_some_and(|object| object.object_type() == expected)
    }

    pub fn fence_signaled(&self, raw: u64) -> Option<bool> {
        match self.objects.get(key_of(raw)) {
            Some(Object::Fence { signaled }) => Some(*signaled),
            _ => None,
        }
    }

    pub fn set_fence(&mut self, raw: u64, value: bool) -> bool {
        match self.objects.get_mut(key_of(raw)) {
            Some(Object::Fence { signaled }) => {
                *signaled = value;
                true
            }
            _ => false,
        }
    }

    pub fn set_semaphore(&mut self, raw: u64, value: bool) -> bool {
        match self.objects.get_mut(key_of(raw)) {
            Some(Object::Semaphore { signaled }) => {
                *signaled = value;
                true
            }
            _ => false,
        }
    }

    pub fn read_memory(&self, memory: DefaultKey, offset: u64, len: u64) -> Option<Vec<u8>> {
        match self.objects.get(memory) {
            Some(Object::Memory(mem)) => {
                let start = usize::try_from(offset).ok()?;
                let len = usize::try_from(len).ok()?;
                if start.checked_add(len)? > mem.data.len() {
                    return None;
                }
                let mut out = vec![0u8; len];
                // Raw access keeps host pointers handed out by `map_memory` valid.
                unsafe {
                    std::ptr::copy_nonoverlapping(mem.data.as_ptr().add(start), out.as_mut_ptr(), len);
                }
                Some(out)
            }
            _ => None,
        }
    }

    pub fn write_memory(&mut self, memory: DefaultKey, offset: u64, bytes: &[u8]) -> bool {
        match self.objects.get_mut(memory) {
            Some(Object::Memory(mem)) => {
                let Ok(start) = usize::try_from(offset) else {
                    return false;
                };
                if start.saturating_add(bytes.len()) > mem.data.len() {
                    return false;
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        mem.data.as_mut_ptr().add(start),
                        bytes.len(),
                    );
                }
                true
            }
            _ => false,
        }
    }
}
