//! # Graphics Context
//!
//! The one object every component of the core is built from. It owns the device
//! handle and everything that must exist exactly once per device:
//!
//! - the [`MemoryPool`] all buffers and images allocate from
//! - the [`DeleteQueue`] every dropped GPU object passes through
//! - per-thread command pools and the queue submission lock
//! - the "empty" buffer and image used to fill unwritten descriptor bindings
//!
//! Construction order is explicit: device first, then the context, then anything
//! built from it (swapchain, resources, pipelines). Resources hold an
//! `Arc<GraphicsContext>`, so the context is dropped last; its `Drop` waits for
//! the device to go idle, flushes the delete queue and releases the pools.

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

use crate::backend::{GpuDevice, ImageDesc, ImageViewDesc, QueueKind, SamplerDesc, SubmitBatch};
use crate::commands::CommandPools;
use crate::config::CoreConfig;
use crate::delete_queue::{DeleteQueue, DeleteQueueCreateInfo, Garbage};
use crate::error::{VulkanError, VulkanResult};
use crate::memory::{Allocation, AllocationRequest, MemoryPool};
use crate::resources::barrier::{record_image_barrier, BarrierMasks};

/// Size of the placeholder buffer bound to unwritten buffer bindings
const EMPTY_BUFFER_SIZE: vk::DeviceSize = 256;

/// Placeholder resources for descriptor bindings nobody wrote
struct DefaultResources {
    buffer: vk::Buffer,
    buffer_allocation: Allocation,
    image: vk::Image,
    view: vk::ImageView,
    sampler: vk::Sampler,
    image_allocation: Allocation,
}

/// Shared owner of the device and its process-wide allocators
pub struct GraphicsContext {
    device: Arc<dyn GpuDevice>,
    config: CoreConfig,
    limits: vk::PhysicalDeviceLimits,
    memory: MemoryPool,
    delete_queue: DeleteQueue,
    command_pools: CommandPools,
    submit_lock: Mutex<()>,
    defaults: OnceLock<DefaultResources>,
}

impl GraphicsContext {
    /// Build the context for a device
    pub fn new(device: Arc<dyn GpuDevice>, config: CoreConfig) -> VulkanResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| VulkanError::InitializationFailed(format!("invalid configuration: {e}")))?;

        let limits = device.limits();
        let memory = MemoryPool::new(config.memory.clone(), device.memory_properties());
        let delete_queue = DeleteQueue::new(&DeleteQueueCreateInfo {
            frames_in_flight: config.frames_in_flight,
        });
        let command_pools = CommandPools::new(device.queue_family_index(QueueKind::Graphics));

        let context = Self {
            device,
            config,
            limits,
            memory,
            delete_queue,
            command_pools,
            submit_lock: Mutex::new(()),
            defaults: OnceLock::new(),
        };
        let defaults = context.create_default_resources()?;
        // Freshly created, so the cell is still empty.
        let _ = context.defaults.set(defaults);

        log::info!(
            "Graphics context ready on {} ({} frames in flight)",
            context.device.name(),
            context.config.frames_in_flight
        );
        Ok(Arc::new(context))
    }

    /// The device every call goes through
    pub fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }

    /// Shared handle to the device, for objects that outlive a borrow
    pub fn device_arc(&self) -> Arc<dyn GpuDevice> {
        Arc::clone(&self.device)
    }

    /// Configuration the context was built with
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Physical device limits
    pub const fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    /// Frames kept in flight; also the deferred destruction grace period
    pub const fn frames_in_flight(&self) -> u32 {
        self.config.frames_in_flight
    }

    /// Device memory allocator
    pub const fn memory_pool(&self) -> &MemoryPool {
        &self.memory
    }

    /// Deferred destruction queue
    pub const fn delete_queue(&self) -> &DeleteQueue {
        &self.delete_queue
    }

    /// Per-thread command pools
    pub const fn command_pools(&self) -> &CommandPools {
        &self.command_pools
    }

    /// Advance the delete queue by one frame boundary
    ///
    /// Call exactly once per iteration of the application loop.
    pub fn update_delete_queue(&self) {
        self.delete_queue.update(self.device.as_ref(), &self.memory);
    }

    /// Hand objects of a dropped owner to the delete queue
    pub fn trash(&self, garbage: Garbage) {
        self.delete_queue.trash(garbage);
    }

    /// Whether `format` supports `feature` with optimal tiling
    pub fn format_supports(&self, format: vk::Format, feature: vk::FormatFeatureFlags) -> bool {
        self.device
            .format_properties(format)
            .optimal_tiling_features
            .contains(feature)
    }

    /// Attach a debug name to any handle
    pub fn set_object_name<H: Handle>(&self, handle: H, name: &str) {
        self.device.set_object_name(H::TYPE, handle.as_raw(), name);
    }

    /// Submit work to a queue
    ///
    /// Submissions from every thread are serialized on one lock, since a queue
    /// must not be accessed concurrently.
    pub fn submit(&self, queue: QueueKind, batches: &[SubmitBatch<'_>], fence: vk::Fence) -> VulkanResult<()> {
        let _guard = self.submit_lock.lock();
        self.device.queue_submit(queue, batches, fence)
    }

    /// Present a swapchain image under the submission lock; returns `suboptimal`
    pub fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VulkanResult<bool> {
        let _guard = self.submit_lock.lock();
        self.device.queue_present(swapchain, image_index, wait_semaphore)
    }

    /// Block until the device has finished all submitted work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        let _guard = self.submit_lock.lock();
        self.device.device_wait_idle()
    }

    /// Allocate primary command buffers from the calling thread's pool
    pub fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        self.command_pools.allocate(self.device.as_ref(), count)
    }

    /// Return command buffers to their pools
    pub fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        self.command_pools.free(self.device.as_ref(), buffers);
    }

    /// Allocate and begin a one-shot command buffer
    pub fn begin_single_time_commands(&self) -> VulkanResult<vk::CommandBuffer> {
        let cmd = self
            .allocate_command_buffers(1)?
            .pop()
            .ok_or(VulkanError::Api(vk::Result::ERROR_OUT_OF_HOST_MEMORY))?;
        if let Err(e) = self.device.begin_command_buffer(cmd, true) {
            self.free_command_buffers(&[cmd]);
            return Err(e);
        }
        Ok(cmd)
    }

    /// End, submit and wait for a one-shot command buffer, then free it
    ///
    /// Blocks until the GPU finished the work; meant for uploads, not per-frame work.
    pub fn end_single_time_commands(&self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        let result = self.submit_and_wait(cmd);
        self.free_command_buffers(&[cmd]);
        result
    }

    /// Record into `cmd` if given, otherwise into a one-shot buffer that is submitted
    /// and waited for before returning
    pub fn with_commands<F>(&self, cmd: Option<vk::CommandBuffer>, record: F) -> VulkanResult<()>
    where
        F: FnOnce(vk::CommandBuffer) -> VulkanResult<()>,
    {
        if let Some(cmd) = cmd {
            return record(cmd);
        }
        let cmd = self.begin_single_time_commands()?;
        if let Err(e) = record(cmd) {
            self.free_command_buffers(&[cmd]);
            return Err(e);
        }
        self.end_single_time_commands(cmd)
    }

    fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        self.device.end_command_buffer(cmd)?;
        let fence = self.device.create_fence(false)?;
        let command_buffers = [cmd];
        let batch = SubmitBatch {
            command_buffers: &command_buffers,
            ..Default::default()
        };
        let result = self
            .submit(QueueKind::Graphics, &[batch], fence)
            .and_then(|()| self.device.wait_for_fences(&[fence], u64::MAX));
        self.device.destroy_fence(fence);
        result
    }

    /// Buffer info for the placeholder buffer
    pub fn empty_buffer_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.defaults.get().map_or_else(vk::Buffer::null, |d| d.buffer),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    /// Image info for the placeholder 1x1 image and its sampler
    pub fn empty_image_info(&self) -> vk::DescriptorImageInfo {
        self.defaults.get().map_or_else(vk::DescriptorImageInfo::default, |d| {
            vk::DescriptorImageInfo {
                sampler: d.sampler,
                image_view: d.view,
                image_layout: vk::ImageLayout::GENERAL,
            }
        })
    }

    fn create_default_resources(&self) -> VulkanResult<DefaultResources> {
        let device = self.device.as_ref();

        let buffer = device.create_buffer(
            EMPTY_BUFFER_SIZE,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let requirements = device.buffer_memory_requirements(buffer);
        let buffer_allocation = self.memory.allocate(
            device,
            &AllocationRequest::buffer(buffer, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        )?;
        device.bind_buffer_memory(buffer, buffer_allocation.memory(), buffer_allocation.offset())?;
        self.set_object_name(buffer, "Empty descriptor buffer");

        let format = vk::Format::R8G8B8A8_UNORM;
        let image = device.create_image(&ImageDesc {
            extent: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            format,
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_DST,
            flags: vk::ImageCreateFlags::empty(),
            samples: vk::SampleCountFlags::TYPE_1,
        })?;
        let requirements = device.image_memory_requirements(image);
        let image_allocation = self.memory.allocate(
            device,
            &AllocationRequest::image(image, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        )?;
        device.bind_image_memory(image, image_allocation.memory(), image_allocation.offset())?;
        let view = device.create_image_view(&ImageViewDesc {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            aspect: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })?;
        let sampler = device.create_sampler(&SamplerDesc::default())?;
        self.set_object_name(image, "Empty descriptor image");

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        self.with_commands(None, |cmd| {
            record_image_barrier(
                device,
                cmd,
                image,
                range,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                BarrierMasks::for_transition(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
            );
            Ok(())
        })?;

        Ok(DefaultResources {
            buffer,
            buffer_allocation,
            image,
            view,
            sampler,
            image_allocation,
        })
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        log::debug!("Shutting down graphics context");
        let device = self.device.as_ref();
        if let Err(e) = device.device_wait_idle() {
            log::error!("Device did not go idle during shutdown: {}", e);
        }

        self.delete_queue.flush(device, &self.memory);

        if let Some(defaults) = self.defaults.take() {
            device.destroy_sampler(defaults.sampler);
            device.destroy_image_view(defaults.view);
            device.destroy_image(defaults.image);
            self.memory.free(device, defaults.image_allocation);
            device.destroy_buffer(defaults.buffer);
            self.memory.free(device, defaults.buffer_allocation);
        }

        self.memory.destroy(device);
        self.command_pools.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;

    fn context() -> (Arc<HeadlessDevice>, Arc<GraphicsContext>) {
        let device = Arc::new(HeadlessDevice::new());
        let config = CoreConfig::default().with_validation(false);
        let context = GraphicsContext::new(device.clone(), config).unwrap();
        (device, context)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let config = CoreConfig::default().with_frames_in_flight(0);
        let result = GraphicsContext::new(device, config);
        assert!(matches!(result, Err(VulkanError::InitializationFailed(_))));
    }

    #[test]
    fn test_default_resources_are_ready() {
        let (device, context) = context();
        let buffer = context.empty_buffer_info();
        let image = context.empty_image_info();

        assert!(device.is_alive(buffer.buffer));
        assert!(device.is_alive(image.image_view));
        assert!(device.is_alive(image.sampler));
        assert_eq!(image.image_layout, vk::ImageLayout::GENERAL);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_single_time_commands_complete_before_return() {
        let (device, context) = context();
        let cmd = context.begin_single_time_commands().unwrap();
        context.end_single_time_commands(cmd).unwrap();

        assert_eq!(device.pending_submissions(), 0);
        assert!(!device.is_alive(cmd));
    }

    #[test]
    fn test_drop_releases_everything() {
        let (device, context) = context();
        assert!(device.live_count(vk::ObjectType::DEVICE_MEMORY) > 0);
        drop(context);

        for object_type in [
            vk::ObjectType::DEVICE_MEMORY,
            vk::ObjectType::BUFFER,
            vk::ObjectType::IMAGE,
            vk::ObjectType::IMAGE_VIEW,
            vk::ObjectType::SAMPLER,
            vk::ObjectType::COMMAND_POOL,
        ] {
            assert_eq!(device.live_count(object_type), 0, "{object_type:?} leaked");
        }
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_object_names_reach_the_device() {
        let (device, context) = context();
        let fence = device.create_fence(false).unwrap();
        context.set_object_name(fence, "Frame fence");
        assert_eq!(device.object_name(fence).as_deref(), Some("Frame fence"));
    }
}
