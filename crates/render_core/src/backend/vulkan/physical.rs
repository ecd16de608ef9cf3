//! Physical device selection and capabilities

use ash::extensions::khr::{
    AccelerationStructure, DeferredHostOperations, RayTracingPipeline, Surface,
    Swapchain as SwapchainLoader,
};
use ash::{vk, Instance};
use std::ffi::CStr;

use crate::error::{VulkanError, VulkanResult};

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory types and heaps
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
    /// Ray tracing pipeline extensions are available
    pub supports_ray_tracing: bool,
    /// `VK_EXT_memory_priority` is available
    pub supports_memory_priority: bool,
}

impl PhysicalDeviceInfo {
    /// Select a suitable physical device, preferring discrete GPUs
    pub fn select_suitable_device(
        instance: &Instance,
        surface: Option<(vk::SurfaceKHR, &Surface)>,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        let mut candidates: Vec<Self> = devices
            .into_iter()
            .filter_map(|device| match Self::evaluate_device(instance, device, surface) {
                Ok(info) => Some(info),
                Err(e) => {
                    log::debug!("Skipping physical device {:?}: {}", device, e);
                    None
                }
            })
            .collect();
        candidates.sort_by_key(|info| {
            u8::from(info.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU)
        });

        let selected = candidates.into_iter().next().ok_or_else(|| {
            VulkanError::InitializationFailed("No suitable GPU found".to_string())
        })?;
        log::info!("Selected GPU: {}", selected.name());
        Ok(selected)
    }

    /// Device name reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: Option<(vk::SurfaceKHR, &Surface)>,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;

        for (index, family) in queue_families.iter().enumerate() {
            let index = u32::try_from(index)
                .map_err(|_| VulkanError::InitializationFailed("Too many queue families".into()))?;

            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }

            let present_support = match surface {
                Some((surface, loader)) => unsafe {
                    loader
                        .get_physical_device_surface_support(device, index, surface)
                        .map_err(VulkanError::Api)?
                },
                None => family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            };

            if present_support && present_family.is_none() {
                present_family = Some(index);
            }

            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let graphics_family = graphics_family.ok_or_else(|| {
            VulkanError::InitializationFailed("No graphics queue family found".to_string())
        })?;
        let present_family = present_family.ok_or_else(|| {
            VulkanError::InitializationFailed("No present queue family found".to_string())
        })?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let has = |required: &CStr| {
            extensions.iter().any(|available| {
                let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
                name == required
            })
        };

        if surface.is_some() && !has(SwapchainLoader::name()) {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            memory_properties,
            graphics_family,
            present_family,
            supports_ray_tracing: has(RayTracingPipeline::name())
                && has(AccelerationStructure::name())
                && has(DeferredHostOperations::name()),
            supports_memory_priority: has(vk::ExtMemoryPriorityFn::name()),
        })
    }
}
