//! Images, views and samplers
//!
//! An [`Image`] owns a 2D texture with 1 to 6 array layers (6 for cubemaps), its
//! mip chain, one view per layer, a view over every layer, and an optional sampler.
//! The image's layout is tracked on the CPU and only changes through
//! [`Image::transition_layout`] and friends, which record the matching barrier.

use ash::vk;
use std::sync::Arc;

use super::barrier::{self, BarrierMasks};
use super::buffer::{Buffer, BufferCreateInfo};
use crate::backend::{ImageDesc, ImageViewDesc, SamplerDesc};
use crate::context::GraphicsContext;
use crate::delete_queue::Garbage;
use crate::error::{VulkanError, VulkanResult};
use crate::memory::{Allocation, AllocationFlags, AllocationRequest};

/// Maximum number of array layers an image may have
pub const MAX_IMAGE_LAYERS: u32 = 6;

/// Number of mip levels of a full chain for `extent`
pub const fn full_mip_chain(extent: vk::Extent2D) -> u32 {
    let largest = if extent.width > extent.height {
        extent.width
    } else {
        extent.height
    };
    if largest == 0 {
        0
    } else {
        u32::BITS - largest.leading_zeros()
    }
}

/// Construction parameters of an [`Image`]
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCreateInfo {
    /// Size of mip 0
    pub extent: vk::Extent2D,
    /// Texel format
    pub format: vk::Format,
    /// Image usage
    pub usage: vk::ImageUsageFlags,
    /// Required memory properties
    pub memory_properties: vk::MemoryPropertyFlags,
    /// Array layers, 1 to 6
    pub layers: u32,
    /// Create a cube-compatible image (requires 6 layers)
    pub cubemap: bool,
    /// Mip levels, 1 for none
    pub mip_levels: u32,
    /// Sample count
    pub samples: vk::SampleCountFlags,
    /// Sampler created alongside sampled images
    pub sampler: SamplerDesc,
    /// Give the image memory of its own instead of an arena range
    pub no_pool: bool,
    /// Debug name
    pub name: Option<String>,
}

impl Default for ImageCreateInfo {
    fn default() -> Self {
        Self {
            extent: vk::Extent2D::default(),
            format: vk::Format::UNDEFINED,
            usage: vk::ImageUsageFlags::empty(),
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            layers: 1,
            cubemap: false,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            sampler: SamplerDesc::default(),
            no_pool: false,
            name: None,
        }
    }
}

impl ImageCreateInfo {
    /// Describe a single-layer, single-mip device-local image
    pub fn new(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent,
            format,
            usage,
            ..Self::default()
        }
    }

    /// Set the number of array layers
    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    /// Make a cubemap (six layers, cube-compatible)
    pub fn with_cubemap(mut self) -> Self {
        self.cubemap = true;
        self.layers = 6;
        self
    }

    /// Use the full mip chain for the extent
    pub fn with_mipmaps(mut self) -> Self {
        self.mip_levels = full_mip_chain(self.extent);
        self
    }

    /// Set the memory properties
    pub fn with_memory_properties(mut self, properties: vk::MemoryPropertyFlags) -> Self {
        self.memory_properties = properties;
        self
    }

    /// Set the sampler description
    pub fn with_sampler(mut self, sampler: SamplerDesc) -> Self {
        self.sampler = sampler;
        self
    }

    /// Set the sample count
    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
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

    /// Whether every required field is set and consistent
    pub fn is_valid(&self) -> bool {
        self.extent.width > 0
            && self.extent.height > 0
            && self.format != vk::Format::UNDEFINED
            && !self.usage.is_empty()
            && !self.memory_properties.is_empty()
            && (1..=MAX_IMAGE_LAYERS).contains(&self.layers)
            && (!self.cubemap || self.layers == 6)
            && (1..=full_mip_chain(self.extent)).contains(&self.mip_levels)
    }
}

/// Move-only owner of an image, its views, sampler and memory
pub struct Image {
    context: Arc<GraphicsContext>,
    image: vk::Image,
    view: vk::ImageView,
    layer_views: Vec<vk::ImageView>,
    sampler: Option<vk::Sampler>,
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    mip_levels: u32,
    layers: u32,
    aspect: vk::ImageAspectFlags,
    usage: vk::ImageUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
    layout: vk::ImageLayout,
}

impl Image {
    /// Create an image with memory, views and (for sampled images) a sampler
    ///
    /// Mipmapped images get `TRANSFER_SRC | TRANSFER_DST` so their chain can be
    /// generated by blits. The image starts in `UNDEFINED`.
    ///
    /// # Panics
    /// Panics if `info` is incomplete or inconsistent.
    pub fn new(context: &Arc<GraphicsContext>, info: &ImageCreateInfo) -> VulkanResult<Self> {
        assert!(info.is_valid(), "invalid image create info: {info:?}");

        let mut usage = info.usage;
        if info.mip_levels > 1 {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        }
        let flags = if info.cubemap {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let device = context.device();
        let image = device.create_image(&ImageDesc {
            extent: vk::Extent3D {
                width: info.extent.width,
                height: info.extent.height,
                depth: 1,
            },
            format: info.format,
            mip_levels: info.mip_levels,
            array_layers: info.layers,
            usage,
            flags,
            samples: info.samples,
        })?;

        let requirements = device.image_memory_requirements(image);
        let mut allocation_flags = AllocationFlags::empty();
        if info.no_pool {
            allocation_flags |= AllocationFlags::NO_POOL;
        }
        let request = AllocationRequest::image(image, requirements, info.memory_properties)
            .with_flags(allocation_flags);
        let allocation = match context.memory_pool().allocate(device, &request) {
            Ok(allocation) => allocation,
            Err(e) => {
                device.destroy_image(image);
                return Err(e);
            }
        };

        let aspect = barrier::aspect_for_format(info.format);
        let mut views = Vec::new();
        let mut sampler = None;
        let created = device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
            .and_then(|()| {
                if info.layers > 1 {
                    for layer in 0..info.layers {
                        views.push(device.create_image_view(&ImageViewDesc {
                            image,
                            view_type: vk::ImageViewType::TYPE_2D,
                            format: info.format,
                            aspect,
                            base_mip_level: 0,
                            level_count: info.mip_levels,
                            base_array_layer: layer,
                            layer_count: 1,
                        })?);
                    }
                }
                let view_type = if info.cubemap {
                    vk::ImageViewType::CUBE
                } else if info.layers > 1 {
                    vk::ImageViewType::TYPE_2D_ARRAY
                } else {
                    vk::ImageViewType::TYPE_2D
                };
                views.push(device.create_image_view(&ImageViewDesc {
                    image,
                    view_type,
                    format: info.format,
                    aspect,
                    base_mip_level: 0,
                    level_count: info.mip_levels,
                    base_array_layer: 0,
                    layer_count: info.layers,
                })?);
                if usage.contains(vk::ImageUsageFlags::SAMPLED) {
                    sampler = Some(device.create_sampler(&info.sampler)?);
                }
                Ok(())
            });
        if let Err(e) = created {
            context.trash(Garbage::Image {
                image,
                views,
                sampler,
                allocation,
            });
            return Err(e);
        }

        if let Some(name) = &info.name {
            context.set_object_name(image, name);
        }
        let view = views.pop().unwrap_or_default();
        log::trace!(
            "Created image {:?}: {}x{} {:?}, {} mips, {} layers",
            image,
            info.extent.width,
            info.extent.height,
            info.format,
            info.mip_levels,
            info.layers
        );

        Ok(Self {
            context: Arc::clone(context),
            image,
            view,
            layer_views: views,
            sampler,
            allocation: Some(allocation),
            format: info.format,
            extent: info.extent,
            mip_levels: info.mip_levels,
            layers: info.layers,
            aspect,
            usage: info.usage,
            memory_properties: info.memory_properties,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Subresource range covering every mip and layer
    pub const fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }

    const fn mip_range(&self, mip: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: mip,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }

    const fn mip_layers(&self, mip: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: self.aspect,
            mip_level: mip,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }

    /// Transition every subresource to `new`, deriving the barrier masks from the
    /// two layouts
    pub fn transition_layout(
        &mut self,
        new: vk::ImageLayout,
        cmd: Option<vk::CommandBuffer>,
    ) -> VulkanResult<()> {
        let masks = BarrierMasks::for_transition(self.layout, new);
        self.record_transition(new, cmd, masks)
    }

    /// Transition every subresource to `new` with caller-chosen masks
    ///
    /// The masks are checked against the old and new layouts first; masks that do
    /// not order the previous use before the next one are rejected and nothing is
    /// recorded.
    pub fn transition_layout_with(
        &mut self,
        new: vk::ImageLayout,
        cmd: Option<vk::CommandBuffer>,
        masks: BarrierMasks,
    ) -> VulkanResult<()> {
        masks
            .validate(self.layout, new)
            .map_err(|reason| VulkanError::InvalidOperation {
                reason: format!(
                    "transition of {:?} from {:?} to {:?}: {reason}",
                    self.image, self.layout, new
                ),
            })?;
        self.record_transition(new, cmd, masks)
    }

    fn record_transition(
        &mut self,
        new: vk::ImageLayout,
        cmd: Option<vk::CommandBuffer>,
        masks: BarrierMasks,
    ) -> VulkanResult<()> {
        let (image, range, old) = (self.image, self.full_range(), self.layout);
        let device = self.context.device();
        self.context.with_commands(cmd, |cmd| {
            barrier::record_image_barrier(device, cmd, image, range, old, new, masks);
            Ok(())
        })?;
        self.layout = new;
        Ok(())
    }

    /// Record that something outside this type (a render pass final layout)
    /// moved the image to `layout`
    pub fn assume_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    /// Copy tightly packed texels from `buffer` into mip 0 of every layer
    ///
    /// # Panics
    /// Panics if the image is not in a transfer destination layout.
    pub fn copy_buffer_to_image(&self, buffer: &Buffer, cmd: Option<vk::CommandBuffer>) -> VulkanResult<()> {
        assert!(
            barrier::is_transfer_dst(self.layout),
            "copy into image {:?} in layout {:?}",
            self.image,
            self.layout
        );
        let region = self.buffer_region();
        let (src, dst, layout) = (buffer.handle(), self.image, self.layout);
        let device = self.context.device();
        self.context.with_commands(cmd, |cmd| {
            device.cmd_copy_buffer_to_image(cmd, src, dst, layout, &[region]);
            Ok(())
        })
    }

    /// Copy mip 0 of every layer into `buffer`, tightly packed
    ///
    /// # Panics
    /// Panics if the image is not in a transfer source layout.
    pub fn copy_image_to_buffer(&self, buffer: &Buffer, cmd: Option<vk::CommandBuffer>) -> VulkanResult<()> {
        assert!(
            barrier::is_transfer_src(self.layout),
            "copy from image {:?} in layout {:?}",
            self.image,
            self.layout
        );
        let region = self.buffer_region();
        let (src, dst, layout) = (self.image, buffer.handle(), self.layout);
        let device = self.context.device();
        self.context.with_commands(cmd, |cmd| {
            device.cmd_copy_image_to_buffer(cmd, src, layout, dst, &[region]);
            Ok(())
        })
    }

    fn buffer_region(&self) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: self.mip_layers(0),
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            },
        }
    }

    /// Copy mip 0 of this image into mip 0 of `dst` (same format and extent)
    ///
    /// # Panics
    /// Panics if either image is not in a transfer layout or the images differ in
    /// format, extent or layer count.
    pub fn copy_image_to_image(&self, dst: &Self, cmd: Option<vk::CommandBuffer>) -> VulkanResult<()> {
        self.assert_transfer_pair(dst);
        assert!(
            self.format == dst.format && self.extent == dst.extent && self.layers == dst.layers,
            "image copy between {:?} {:?} and {:?} {:?}",
            self.format,
            self.extent,
            dst.format,
            dst.extent
        );
        let region = vk::ImageCopy {
            src_subresource: self.mip_layers(0),
            src_offset: vk::Offset3D::default(),
            dst_subresource: dst.mip_layers(0),
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            },
        };
        let (src, src_layout, dst_image, dst_layout) = (self.image, self.layout, dst.image, dst.layout);
        let device = self.context.device();
        self.context.with_commands(cmd, |cmd| {
            device.cmd_copy_image(cmd, src, src_layout, dst_image, dst_layout, &[region]);
            Ok(())
        })
    }

    /// Scale mip 0 of this image onto mip 0 of `dst`
    ///
    /// # Panics
    /// Panics if either image is not in a transfer layout or the layer counts differ.
    pub fn blit_image_to_image(
        &self,
        dst: &Self,
        filter: vk::Filter,
        cmd: Option<vk::CommandBuffer>,
    ) -> VulkanResult<()> {
        self.assert_transfer_pair(dst);
        assert_eq!(self.layers, dst.layers, "blit between images with different layer counts");
        let region = vk::ImageBlit {
            src_subresource: self.mip_layers(0),
            src_offsets: [vk::Offset3D::default(), extent_offset(self.extent)],
            dst_subresource: dst.mip_layers(0),
            dst_offsets: [vk::Offset3D::default(), extent_offset(dst.extent)],
        };
        let (src, src_layout, dst_image, dst_layout) = (self.image, self.layout, dst.image, dst.layout);
        let device = self.context.device();
        self.context.with_commands(cmd, |cmd| {
            device.cmd_blit_image(cmd, src, src_layout, dst_image, dst_layout, &[region], filter);
            Ok(())
        })
    }

    fn assert_transfer_pair(&self, dst: &Self) {
        assert!(
            barrier::is_transfer_src(self.layout),
            "transfer source {:?} is in layout {:?}",
            self.image,
            self.layout
        );
        assert!(
            barrier::is_transfer_dst(dst.layout),
            "transfer destination {:?} is in layout {:?}",
            dst.image,
            dst.layout
        );
    }

    /// Upload texels for mip 0 of every layer and leave the image shader-readable
    ///
    /// `data` holds the layers back to back, each tightly packed. Mipmapped images
    /// get their chain generated from mip 0.
    pub fn upload(&mut self, data: &[u8], cmd: Option<vk::CommandBuffer>) -> VulkanResult<()> {
        assert!(!data.is_empty(), "upload of zero bytes into image {:?}", self.image);
        if self.mip_levels > 1 {
            self.check_linear_blit()?;
        }

        let staging_info = BufferCreateInfo::new(
            data.len() as vk::DeviceSize,
            1,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .with_name("Image staging buffer");
        let mut staging = Buffer::new(&self.context, &staging_info)?;
        staging.write(data)?;

        let context = Arc::clone(&self.context);
        context.with_commands(cmd, |cmd| {
            self.transition_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL, Some(cmd))?;
            self.copy_buffer_to_image(&staging, Some(cmd))?;
            if self.mip_levels > 1 {
                self.record_mipmaps(cmd);
                Ok(())
            } else {
                self.transition_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, Some(cmd))
            }
        })
    }

    /// Fill mips 1.. by successive linear blits from mip 0
    ///
    /// The image must be in `TRANSFER_DST_OPTIMAL` with mip 0 written; it ends in
    /// `SHADER_READ_ONLY_OPTIMAL`. Fails without recording anything if the format
    /// cannot be linearly filtered on this device.
    ///
    /// # Panics
    /// Panics if the image is not in `TRANSFER_DST_OPTIMAL`.
    pub fn generate_mipmaps(&mut self, cmd: Option<vk::CommandBuffer>) -> VulkanResult<()> {
        self.check_linear_blit()?;
        let context = Arc::clone(&self.context);
        context.with_commands(cmd, |cmd| {
            self.record_mipmaps(cmd);
            Ok(())
        })
    }

    fn check_linear_blit(&self) -> VulkanResult<()> {
        let feature = vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        if self.context.format_supports(self.format, feature) {
            Ok(())
        } else {
            Err(VulkanError::UnsupportedFormatFeature {
                format: self.format,
                feature,
            })
        }
    }

    fn record_mipmaps(&mut self, cmd: vk::CommandBuffer) {
        assert_eq!(
            self.layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            "mipmaps of image {:?} must start from TRANSFER_DST_OPTIMAL",
            self.image
        );
        let device = self.context.device();
        let to_src = BarrierMasks::for_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        let src_to_read = BarrierMasks::for_transition(
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let dst_to_read = BarrierMasks::for_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        let mut width = self.extent.width;
        let mut height = self.extent.height;
        for mip in 1..self.mip_levels {
            barrier::record_image_barrier(
                device,
                cmd,
                self.image,
                self.mip_range(mip - 1),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                to_src,
            );

            let next = vk::Extent2D {
                width: (width / 2).max(1),
                height: (height / 2).max(1),
            };
            let blit = vk::ImageBlit {
                src_subresource: self.mip_layers(mip - 1),
                src_offsets: [vk::Offset3D::default(), extent_offset(vk::Extent2D { width, height })],
                dst_subresource: self.mip_layers(mip),
                dst_offsets: [vk::Offset3D::default(), extent_offset(next)],
            };
            device.cmd_blit_image(
                cmd,
                self.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );

            barrier::record_image_barrier(
                device,
                cmd,
                self.image,
                self.mip_range(mip - 1),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                src_to_read,
            );
            width = next.width;
            height = next.height;
        }

        barrier::record_image_barrier(
            device,
            cmd,
            self.image,
            self.mip_range(self.mip_levels - 1),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            dst_to_read,
        );
        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    }

    /// Descriptor info for the whole-image view and sampler in `layout`
    pub fn descriptor_info(&self, layout: vk::ImageLayout) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.unwrap_or_default(),
            image_view: self.view,
            image_layout: layout,
        }
    }

    /// Native handle
    pub const fn handle(&self) -> vk::Image {
        self.image
    }

    /// Layout the image was last transitioned to
    pub const fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// View over every layer (cube view for cubemaps)
    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    /// View of a single layer, for rendering into one face or slice
    ///
    /// Single-layer images return their only view.
    pub fn layer_view(&self, layer: u32) -> Option<vk::ImageView> {
        if self.layers == 1 {
            return (layer == 0).then_some(self.view);
        }
        self.layer_views.get(layer as usize).copied()
    }

    /// Sampler of sampled images
    pub const fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    /// Texel format
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    /// Size of mip 0
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Number of mip levels
    pub const fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Number of array layers
    pub const fn layers(&self) -> u32 {
        self.layers
    }

    /// Aspect implied by the format
    pub const fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    /// Requested usage
    pub const fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    /// Requested memory properties
    pub const fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let mut views = std::mem::take(&mut self.layer_views);
            views.push(self.view);
            self.context.trash(Garbage::Image {
                image: self.image,
                views,
                sampler: self.sampler.take(),
                allocation,
            });
        }
    }
}

fn extent_offset(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: i32::try_from(extent.width).unwrap_or(i32::MAX),
        y: i32::try_from(extent.height).unwrap_or(i32::MAX),
        z: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::config::CoreConfig;

    fn context() -> (Arc<HeadlessDevice>, Arc<GraphicsContext>) {
        let device = Arc::new(HeadlessDevice::new());
        let context = GraphicsContext::new(device.clone(), CoreConfig::default()).unwrap();
        (device, context)
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn texture_info(width: u32, height: u32) -> ImageCreateInfo {
        ImageCreateInfo::new(
            extent(width, height),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::TRANSFER_SRC,
        )
    }

    fn readback(context: &Arc<GraphicsContext>, image: &mut Image, len: u64) -> Vec<u8> {
        let info = BufferCreateInfo::new(
            len,
            1,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        let mut buffer = Buffer::new(context, &info).unwrap();
        image
            .transition_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL, None)
            .unwrap();
        image.copy_image_to_buffer(&buffer, None).unwrap();
        buffer.map().unwrap();
        buffer.mapped_slice().unwrap().to_vec()
    }

    #[test]
    fn test_full_mip_chain() {
        assert_eq!(full_mip_chain(extent(1, 1)), 1);
        assert_eq!(full_mip_chain(extent(4, 4)), 3);
        assert_eq!(full_mip_chain(extent(1024, 512)), 11);
        assert_eq!(full_mip_chain(extent(5, 3)), 3);
        assert_eq!(full_mip_chain(extent(0, 0)), 0);
    }

    #[test]
    fn test_create_info_validity() {
        let info = texture_info(16, 16);
        assert!(info.is_valid());
        assert!(info.clone().with_mipmaps().is_valid());
        assert!(info.clone().with_cubemap().is_valid());
        assert!(!info.clone().with_layers(7).is_valid());
        assert!(!info.clone().with_layers(0).is_valid());
        assert!(!ImageCreateInfo { cubemap: true, ..info.clone() }.is_valid());
        assert!(!ImageCreateInfo { mip_levels: 6, ..info.clone() }.is_valid());
        assert!(!ImageCreateInfo { format: vk::Format::UNDEFINED, ..info }.is_valid());
    }

    #[test]
    #[should_panic(expected = "invalid image create info")]
    fn test_invalid_info_panics() {
        let (_device, context) = context();
        let _ = Image::new(&context, &ImageCreateInfo::default());
    }

    #[test]
    fn test_layout_tracks_last_transition() {
        let (device, context) = context();
        let mut image = Image::new(&context, &texture_info(8, 8)).unwrap();
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);

        image
            .transition_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL, None)
            .unwrap();
        assert_eq!(image.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        image
            .transition_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, None)
            .unwrap();
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(
            device.image_layout(image.handle(), 0, 0),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_explicit_masks_are_validated() {
        let (_device, context) = context();
        let mut image = Image::new(&context, &texture_info(8, 8)).unwrap();
        image
            .transition_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL, None)
            .unwrap();

        let missing_write = BarrierMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        };
        let result = image.transition_layout_with(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            None,
            missing_write,
        );
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
        assert_eq!(image.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let correct = BarrierMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            ..missing_write
        };
        image
            .transition_layout_with(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, None, correct)
            .unwrap();
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_upload_then_readback() {
        let (device, context) = context();
        let mut image = Image::new(&context, &texture_info(4, 2)).unwrap();
        let texels: Vec<u8> = (0..32).collect();

        image.upload(&texels, None).unwrap();
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let bytes = readback(&context, &mut image, 32);
        assert_eq!(bytes, texels);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_generate_mipmaps_leaves_chain_readable() {
        let (device, context) = context();
        let mut image = Image::new(&context, &texture_info(8, 4).with_mipmaps()).unwrap();
        assert_eq!(image.mip_levels(), 4);

        image.upload(&[200u8; 8 * 4 * 4], None).unwrap();
        for mip in 0..4 {
            assert_eq!(
                device.image_layout(image.handle(), mip, 0),
                Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            );
        }
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_mipmaps_require_linear_filtering() {
        let (device, context) = context();
        let info = ImageCreateInfo::new(
            extent(4, 4),
            vk::Format::R32G32B32A32_SFLOAT,
            vk::ImageUsageFlags::SAMPLED,
        )
        .with_mipmaps();
        let mut image = Image::new(&context, &info).unwrap();
        device.clear_events();

        let result = image.upload(&[0u8; 4 * 4 * 16], None);
        assert_eq!(
            result,
            Err(VulkanError::UnsupportedFormatFeature {
                format: vk::Format::R32G32B32A32_SFLOAT,
                feature: vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
            })
        );
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(device.pending_submissions(), 0);
    }

    #[test]
    fn test_copy_and_blit_between_images() {
        let (device, context) = context();
        let texels: Vec<u8> = (0..64).collect();
        let mut src = Image::new(&context, &texture_info(4, 4)).unwrap();
        src.upload(&texels, None).unwrap();
        src.transition_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL, None)
            .unwrap();

        let mut copy = Image::new(&context, &texture_info(4, 4)).unwrap();
        copy.transition_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL, None)
            .unwrap();
        src.copy_image_to_image(&copy, None).unwrap();
        assert_eq!(readback(&context, &mut copy, 64), texels);

        let mut small = Image::new(&context, &texture_info(2, 2)).unwrap();
        small
            .transition_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL, None)
            .unwrap();
        src.blit_image_to_image(&small, vk::Filter::NEAREST, None).unwrap();
        let bytes = readback(&context, &mut small, 16);
        // Nearest sampling picks texels (0,0), (2,0), (0,2), (2,2).
        assert_eq!(&bytes[0..4], &texels[0..4]);
        assert_eq!(&bytes[4..8], &texels[8..12]);
        assert_eq!(&bytes[8..12], &texels[32..36]);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    #[should_panic(expected = "copy into image")]
    fn test_copy_requires_transfer_layout() {
        let (_device, context) = context();
        let image = Image::new(&context, &texture_info(4, 4)).unwrap();
        let info = BufferCreateInfo::new(
            64,
            1,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        let buffer = Buffer::new(&context, &info).unwrap();
        let _ = image.copy_buffer_to_image(&buffer, None);
    }

    #[test]
    fn test_cubemap_views() {
        let (device, context) = context();
        let info = texture_info(16, 16).with_cubemap();
        let image = Image::new(&context, &info).unwrap();
        assert_eq!(image.layers(), 6);
        for layer in 0..6 {
            let view = image.layer_view(layer).unwrap();
            assert_ne!(view, image.view());
        }
        assert!(image.layer_view(6).is_none());
        assert!(image.sampler().is_some());
        assert_eq!(device.live_count(vk::ObjectType::IMAGE_VIEW), 7 + 1);
    }

    #[test]
    fn test_drop_queues_views_and_sampler() {
        let (device, context) = context();
        let image = Image::new(&context, &texture_info(4, 4).with_layers(2)).unwrap();
        let (handle, view) = (image.handle(), image.view());
        let sampler = image.sampler().unwrap();
        drop(image);

        assert!(device.is_alive(handle));
        for _ in 0..=context.frames_in_flight() {
            context.update_delete_queue();
        }
        assert!(!device.is_alive(handle));
        assert!(!device.is_alive(view));
        assert!(!device.is_alive(sampler));
    }
}
