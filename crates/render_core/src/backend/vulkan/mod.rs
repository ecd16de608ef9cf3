//! # Vulkan Device
//!
//! The `ash` implementation of [`GpuDevice`]. Bring-up follows the usual order:
//! instance (with the debug messenger routed to `log`), optional window surface
//! through `ash-window`, physical device selection, then the logical device with a
//! graphics and a present queue. Ray tracing and buffer device address are enabled
//! only when requested and supported.
//!
//! Every method is a thin, checked wrapper over the matching `vk*` call; policy
//! (pooling, deferral, retry) lives in the components above this layer.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{
    AccelerationStructure, DeferredHostOperations, RayTracingPipeline, Surface,
    Swapchain as SwapchainLoader,
};
use ash::vk;
use ash::Device;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{c_char, CString};

mod instance;
mod physical;

pub use instance::VulkanInstance;
pub use physical::PhysicalDeviceInfo;

use super::{
    ComputePipelineDesc, DedicatedTarget, DescriptorResources, DescriptorWrite, GpuDevice,
    GraphicsPipelineDesc, ImageDesc, ImageViewDesc, MemoryAllocateDesc, QueueKind,
    RayTracingGroup, RayTracingPipelineDesc, SamplerDesc, ShaderStageDesc, SubmitBatch,
    SwapchainDesc, SwapchainImages,
};
use crate::error::{VulkanError, VulkanResult};

/// Options for Vulkan device bring-up
#[derive(Debug, Clone)]
pub struct VulkanDeviceConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Whether to enable Vulkan validation layers
    pub enable_validation: bool,
    /// Enable ray tracing pipelines when the device supports them
    pub enable_ray_tracing: bool,
    /// Enable `bufferDeviceAddress`
    pub enable_buffer_device_address: bool,
}

impl Default for VulkanDeviceConfig {
    fn default() -> Self {
        Self {
            application_name: "render_core application".to_string(),
            enable_validation: cfg!(debug_assertions),
            enable_ray_tracing: false,
            enable_buffer_device_address: true,
        }
    }
}

struct RayTracingLoaders {
    pipeline: RayTracingPipeline,
    _acceleration_structure: AccelerationStructure,
}

/// Vulkan-backed GPU device
pub struct VulkanDevice {
    device: Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    physical: PhysicalDeviceInfo,
    name: String,
    surface: Option<(vk::SurfaceKHR, Surface)>,
    swapchain_loader: Option<SwapchainLoader>,
    ray_tracing: Option<RayTracingLoaders>,
    memory_priority: bool,
    instance: VulkanInstance,
}

impl VulkanDevice {
    /// Create a device that presents to a window
    pub fn with_window<W>(config: &VulkanDeviceConfig, window: &W) -> VulkanResult<Self>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        let display = window.raw_display_handle();
        let instance = VulkanInstance::new(
            &config.application_name,
            Some(display),
            config.enable_validation,
            vk::API_VERSION_1_2,
        )?;
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                display,
                window.raw_window_handle(),
                None,
            )
            .map_err(VulkanError::Api)?
        };
        let loader = Surface::new(&instance.entry, &instance.instance);
        Self::create(config, instance, Some((surface, loader)))
    }

    /// Create a device without presentation support (offline rendering, compute)
    pub fn without_surface(config: &VulkanDeviceConfig) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(
            &config.application_name,
            None,
            config.enable_validation,
            vk::API_VERSION_1_2,
        )?;
        Self::create(config, instance, None)
    }

    fn create(
        config: &VulkanDeviceConfig,
        instance: VulkanInstance,
        surface: Option<(vk::SurfaceKHR, Surface)>,
    ) -> VulkanResult<Self> {
        let physical = match PhysicalDeviceInfo::select_suitable_device(
            &instance.instance,
            surface.as_ref().map(|(handle, loader)| (*handle, loader)),
        ) {
            Ok(physical) => physical,
            Err(e) => {
                if let Some((handle, loader)) = &surface {
                    unsafe { loader.destroy_surface(*handle, None) };
                }
                return Err(e);
            }
        };

        let ray_tracing = config.enable_ray_tracing && physical.supports_ray_tracing;
        if config.enable_ray_tracing && !ray_tracing {
            log::warn!("Ray tracing requested but not supported by {}", physical.name());
        }

        let mut unique_families = vec![physical.graphics_family];
        if physical.present_family != physical.graphics_family {
            unique_families.push(physical.present_family);
        }
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut extensions: Vec<*const c_char> = Vec::new();
        if surface.is_some() {
            extensions.push(SwapchainLoader::name().as_ptr());
        }
        if physical.supports_memory_priority {
            extensions.push(vk::ExtMemoryPriorityFn::name().as_ptr());
        }
        if ray_tracing {
            extensions.push(RayTracingPipeline::name().as_ptr());
            extensions.push(AccelerationStructure::name().as_ptr());
            extensions.push(DeferredHostOperations::name().as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);
        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(config.enable_buffer_device_address || ray_tracing);
        let mut priority_features =
            vk::PhysicalDeviceMemoryPriorityFeaturesEXT::builder().memory_priority(true);
        let mut rt_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features12);
        if physical.supports_memory_priority {
            create_info = create_info.push_next(&mut priority_features);
        }
        if ray_tracing {
            create_info = create_info
                .push_next(&mut rt_features)
                .push_next(&mut as_features);
        }

        let device = match unsafe {
            instance
                .instance
                .create_device(physical.device, &create_info, None)
        } {
            Ok(device) => device,
            Err(e) => {
                if let Some((handle, loader)) = &surface {
                    unsafe { loader.destroy_surface(*handle, None) };
                }
                return Err(VulkanError::Api(e));
            }
        };

        let graphics_queue = unsafe { device.get_device_queue(physical.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(physical.present_family, 0) };
        let swapchain_loader = surface
            .as_ref()
            .map(|_| SwapchainLoader::new(&instance.instance, &device));
        let ray_tracing = ray_tracing.then(|| RayTracingLoaders {
            pipeline: RayTracingPipeline::new(&instance.instance, &device),
            _acceleration_structure: AccelerationStructure::new(&instance.instance, &device),
        });

        let name = physical.name();
        log::info!(
            "Created logical device on {} (graphics family {}, present family {})",
            name,
            physical.graphics_family,
            physical.present_family
        );

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            memory_priority: physical.supports_memory_priority,
            physical,
            name,
            surface,
            swapchain_loader,
            ray_tracing,
            instance,
        })
    }

    /// Raw `ash` device, for code outside the core that records its own commands
    pub fn raw(&self) -> &Device {
        &self.device
    }

    /// Selected physical device
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    const fn queue(&self, queue: QueueKind) -> vk::Queue {
        match queue {
            QueueKind::Graphics => self.graphics_queue,
            QueueKind::Present => self.present_queue,
        }
    }

    fn debug_utils(&self) -> Option<&DebugUtils> {
        self.instance.debug.as_ref().map(|(utils, _)| utils)
    }

    fn stage_infos(stages: &[ShaderStageDesc]) -> Vec<vk::PipelineShaderStageCreateInfo> {
        stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(stage.entry_point.as_c_str())
                    .build()
            })
            .collect::<Vec<_>>()
    }

    fn choose_surface_format(
        formats: &[vk::SurfaceFormatKHR],
        preferred: vk::Format,
    ) -> vk::SurfaceFormatKHR {
        formats
            .iter()
            .copied()
            .find(|format| {
                format.format == preferred
                    && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first().copied())
            .unwrap_or(vk::SurfaceFormatKHR {
                format: preferred,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            })
    }

    fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
        if caps.current_extent.width == u32::MAX {
            vk::Extent2D {
                width: desired
                    .width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: desired
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        } else {
            caps.current_extent
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            if let Some((surface, loader)) = &self.surface {
                loader.destroy_surface(*surface, None);
            }
        }
        log::debug!("Destroyed Vulkan device {}", self.name);
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.physical.memory_properties
    }

    fn limits(&self) -> vk::PhysicalDeviceLimits {
        self.physical.properties.limits
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical.device, format)
        }
    }

    fn queue_family_index(&self, queue: QueueKind) -> u32 {
        match queue {
            QueueKind::Graphics => self.physical.graphics_family,
            QueueKind::Present => self.physical.present_family,
        }
    }

    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        let Some(debug_utils) = self.debug_utils() else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(handle)
            .object_name(&name);
        if let Err(e) =
            unsafe { debug_utils.set_debug_utils_object_name(self.device.handle(), &info) }
        {
            log::warn!("Failed to name object {:#x}: {:?}", handle, e);
        }
    }

    fn allocate_memory(&self, desc: &MemoryAllocateDesc) -> VulkanResult<vk::DeviceMemory> {
        let mut flags_info = vk::MemoryAllocateFlagsInfo::builder()
            .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut priority_info =
            vk::MemoryPriorityAllocateInfoEXT::builder().priority(desc.priority.clamp(0.0, 1.0));
        let mut export_info =
            vk::ExportMemoryAllocateInfo::builder().handle_types(desc.export_handle_types);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder();
        match desc.dedicated {
            DedicatedTarget::Buffer(buffer) => dedicated_info = dedicated_info.buffer(buffer),
            DedicatedTarget::Image(image) => dedicated_info = dedicated_info.image(image),
            DedicatedTarget::None => {}
        }

        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(desc.size)
            .memory_type_index(desc.memory_type_index);
        if desc.device_address {
            info = info.push_next(&mut flags_info);
        }
        if self.memory_priority {
            info = info.push_next(&mut priority_info);
        }
        if !desc.export_handle_types.is_empty() {
            info = info.push_next(&mut export_info);
        }
        if !matches!(desc.dedicated, DedicatedTarget::None) {
            info = info.push_next(&mut dedicated_info);
        }

        unsafe { self.device.allocate_memory(&info, None) }.map_err(VulkanError::Api)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<*mut u8> {
        unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
                .map(|ptr| ptr.cast::<u8>())
                .map_err(VulkanError::Api)
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }

    fn flush_memory(&self, ranges: &[vk::MappedMemoryRange]) -> VulkanResult<()> {
        unsafe { self.device.flush_mapped_memory_ranges(ranges) }.map_err(VulkanError::Api)
    }

    fn invalidate_memory(&self, ranges: &[vk::MappedMemoryRange]) -> VulkanResult<()> {
        unsafe { self.device.invalidate_mapped_memory_ranges(ranges) }.map_err(VulkanError::Api)
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&info, None) }.map_err(VulkanError::Api)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VulkanResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }.map_err(VulkanError::Api)
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(&self, desc: &ImageDesc) -> VulkanResult<vk::Image> {
        let image_type = if desc.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let info = vk::ImageCreateInfo::builder()
            .image_type(image_type)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .flags(desc.flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_image(&info, None) }.map_err(VulkanError::Api)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VulkanResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }.map_err(VulkanError::Api)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> VulkanResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: desc.base_mip_level,
                level_count: desc.level_count,
                base_array_layer: desc.base_array_layer,
                layer_count: desc.layer_count,
            });
        unsafe { self.device.create_image_view(&info, None) }.map_err(VulkanError::Api)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> VulkanResult<vk::Sampler> {
        let max_anisotropy = desc
            .max_anisotropy
            .map(|requested| requested.min(self.physical.properties.limits.max_sampler_anisotropy));
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(max_anisotropy.is_some())
            .max_anisotropy(max_anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(desc.max_lod)
            .border_color(desc.border_color)
            .unnormalized_coordinates(false);
        unsafe { self.device.create_sampler(&info, None) }.map_err(VulkanError::Api)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> VulkanResult<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(bindings)
            .flags(flags);
        unsafe { self.device.create_descriptor_set_layout(&info, None) }.map_err(VulkanError::Api)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> VulkanResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(flags);
        unsafe { self.device.create_descriptor_pool(&info, None) }.map_err(VulkanError::Api)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets =
            unsafe { self.device.allocate_descriptor_sets(&info) }.map_err(VulkanError::Api)?;
        sets.into_iter()
            .next()
            .ok_or(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VulkanResult<()> {
        unsafe { self.device.free_descriptor_sets(pool, sets) }.map_err(VulkanError::Api)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut structure_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = writes
            .iter()
            .map(|write| match &write.resources {
                DescriptorResources::AccelerationStructures(structures) => {
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(structures)
                        .build()
                }
                _ => vk::WriteDescriptorSetAccelerationStructureKHR::default(),
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(structure_infos.iter_mut())
            .map(|(write, structure_info)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.descriptor_type);
                match &write.resources {
                    DescriptorResources::Buffers(infos) => builder.buffer_info(infos).build(),
                    DescriptorResources::Images(infos) => builder.image_info(infos).build(),
                    DescriptorResources::AccelerationStructures(structures) => {
                        let mut vk_write = builder.push_next(structure_info).build();
                        vk_write.descriptor_count = u32::try_from(structures.len()).unwrap_or(0);
                        vk_write
                    }
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_shader_module(&self, code: &[u32]) -> VulkanResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe { self.device.create_shader_module(&info, None) }.map_err(VulkanError::Api)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        unsafe { self.device.create_pipeline_layout(&info, None) }.map_err(VulkanError::Api)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VulkanResult<vk::Pipeline> {
        let stages = Self::stage_infos(&desc.stages);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.topology)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(desc.polygon_mode)
            .line_width(1.0)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(desc.samples);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare_op);
        let attachment = vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(desc.blend_enable)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build();
        let attachments = vec![attachment; desc.color_attachment_count as usize];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&attachments);
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&desc.dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(desc.subpass)
            .build();

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| VulkanError::Api(e))?;
        pipelines
            .into_iter()
            .next()
            .ok_or(VulkanError::Api(vk::Result::ERROR_UNKNOWN))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> VulkanResult<vk::Pipeline> {
        let stage = Self::stage_infos(std::slice::from_ref(&desc.stage));
        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage[0])
            .layout(desc.layout)
            .build();
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| VulkanError::Api(e))?;
        pipelines
            .into_iter()
            .next()
            .ok_or(VulkanError::Api(vk::Result::ERROR_UNKNOWN))
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> VulkanResult<vk::Pipeline> {
        let loaders = self
            .ray_tracing
            .as_ref()
            .ok_or(VulkanError::ExtensionNotLoaded("VK_KHR_ray_tracing_pipeline"))?;
        let stages = Self::stage_infos(&desc.stages);
        let unused = vk::SHADER_UNUSED_KHR;
        let groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = desc
            .groups
            .iter()
            .map(|group| {
                let builder = vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .general_shader(unused)
                    .closest_hit_shader(unused)
                    .any_hit_shader(unused)
                    .intersection_shader(unused);
                match *group {
                    RayTracingGroup::General(stage) => builder
                        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(stage),
                    RayTracingGroup::TrianglesHit {
                        closest_hit,
                        any_hit,
                    } => builder
                        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                        .closest_hit_shader(closest_hit.unwrap_or(unused))
                        .any_hit_shader(any_hit.unwrap_or(unused)),
                    RayTracingGroup::ProceduralHit {
                        intersection,
                        closest_hit,
                        any_hit,
                    } => builder
                        .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
                        .intersection_shader(intersection)
                        .closest_hit_shader(closest_hit.unwrap_or(unused))
                        .any_hit_shader(any_hit.unwrap_or(unused)),
                }
                .build()
            })
            .collect();

        let info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(desc.layout)
            .build();
        let pipelines = unsafe {
            loaders.pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[info],
                None,
            )
        }
        .map_err(VulkanError::Api)?;
        pipelines
            .into_iter()
            .next()
            .ok_or(VulkanError::Api(vk::Result::ERROR_UNKNOWN))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VulkanResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        unsafe { self.device.create_command_pool(&info, None) }.map_err(VulkanError::Api)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }.map_err(VulkanError::Api)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) };
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        one_time_submit: bool,
    ) -> VulkanResult<()> {
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.begin_command_buffer(cmd, &info) }.map_err(VulkanError::Api)
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }.map_err(VulkanError::Api)
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .map_err(VulkanError::Api)
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                memory_barriers,
                &[],
                image_barriers,
            );
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(cmd, src, dst, dst_layout, regions);
        }
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(cmd, src, src_layout, dst, regions);
        }
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
        unsafe {
            self.device
                .cmd_copy_image(cmd, src, src_layout, dst, dst_layout, regions);
        }
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device
                .cmd_blit_image(cmd, src, src_layout, dst, dst_layout, regions, filter);
        }
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }.map_err(VulkanError::Api)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VulkanResult<()> {
        unsafe { self.device.wait_for_fences(fences, true, timeout) }.map_err(VulkanError::Api)
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VulkanResult<()> {
        unsafe { self.device.reset_fences(fences) }.map_err(VulkanError::Api)
    }

    fn fence_status(&self, fence: vk::Fence) -> VulkanResult<bool> {
        unsafe { self.device.get_fence_status(fence) }.map_err(VulkanError::Api)
    }

    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&info, None) }.map_err(VulkanError::Api)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn queue_submit(
        &self,
        queue: QueueKind,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VulkanResult<()> {
        let infos: Vec<vk::SubmitInfo> = batches
            .iter()
            .map(|batch| {
                vk::SubmitInfo::builder()
                    .wait_semaphores(batch.wait_semaphores)
                    .wait_dst_stage_mask(batch.wait_stages)
                    .command_buffers(batch.command_buffers)
                    .signal_semaphores(batch.signal_semaphores)
                    .build()
            })
            .collect();
        unsafe { self.device.queue_submit(self.queue(queue), &infos, fence) }
            .map_err(VulkanError::Api)
    }

    fn device_wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(VulkanError::Api)
    }

    fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface.as_ref().map(|(surface, _)| *surface)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VulkanResult<SwapchainImages> {
        let (Some((_, surface_loader)), Some(swapchain_loader)) =
            (self.surface.as_ref(), self.swapchain_loader.as_ref())
        else {
            return Err(VulkanError::ExtensionNotLoaded("VK_KHR_swapchain"));
        };
        let physical = self.physical.device;

        let (caps, formats, present_modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(physical, desc.surface)
                    .map_err(VulkanError::Api)?,
                surface_loader
                    .get_physical_device_surface_formats(physical, desc.surface)
                    .map_err(VulkanError::Api)?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical, desc.surface)
                    .map_err(VulkanError::Api)?,
            )
        };

        let format = Self::choose_surface_format(&formats, desc.preferred_format);
        let present_mode = if desc.prefer_mailbox
            && present_modes.contains(&vk::PresentModeKHR::MAILBOX)
        {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        };
        let extent = Self::choose_extent(&caps, desc.extent);
        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let families = [self.physical.graphics_family, self.physical.present_family];
        let mut info = vk::SwapchainCreateInfoKHR::builder()
            .surface(desc.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);
        info = if families[0] == families[1] {
            info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            info.image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        };

        let handle =
            unsafe { swapchain_loader.create_swapchain(&info, None) }.map_err(VulkanError::Api)?;
        let images = match unsafe { swapchain_loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(handle, None) };
                return Err(VulkanError::Api(e));
            }
        };

        log::info!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            images.len(),
            format.format,
            present_mode
        );

        Ok(SwapchainImages {
            handle,
            images,
            format,
            extent,
            present_mode,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = &self.swapchain_loader {
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VulkanResult<(u32, bool)> {
        let loader = self
            .swapchain_loader
            .as_ref()
            .ok_or(VulkanError::ExtensionNotLoaded("VK_KHR_swapchain"))?;
        unsafe { loader.acquire_next_image(swapchain, u64::MAX, semaphore, vk::Fence::null()) }
            .map_err(VulkanError::Api)
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VulkanResult<bool> {
        let loader = self
            .swapchain_loader
            .as_ref()
            .ok_or(VulkanError::ExtensionNotLoaded("VK_KHR_swapchain"))?;
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { loader.queue_present(self.present_queue, &info) }.map_err(VulkanError::Api)
    }
}

// Queue access is serialized by the graphics context's submission lock.
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}
