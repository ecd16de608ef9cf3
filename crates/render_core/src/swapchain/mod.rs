//! # Swapchain Frame Protocol
//!
//! Each frame-in-flight slot owns an "image available" semaphore, a "render
//! finished" semaphore and an "in flight" fence, and moves through:
//!
//! ```text
//! Idle ──acquire──► AcquireWait (slot fence) ──► Acquired ──record──► Recording
//!   ▲                                                                     │
//!   └────────── Presenting ◄── Submitted (render finished + slot fence) ◄─┘
//! ```
//!
//! Besides the slot fence, every swapchain image remembers the fence of the last
//! submission that rendered to it; a submit targeting that image first waits on
//! it, so one image is never written by two frames at once even when the
//! presentation engine hands it out again early.
//!
//! Out-of-date and suboptimal surfaces are reported through [`AcquireOutcome`]
//! and [`PresentOutcome`]; rebuilding is up to the caller.

use ash::vk;
use std::sync::Arc;

mod frame;

pub use frame::FrameRenderer;

use crate::backend::{ImageViewDesc, QueueKind, SubmitBatch, SwapchainDesc};
use crate::config::SwapchainConfig;
use crate::context::GraphicsContext;
use crate::error::{VulkanError, VulkanResult};
use crate::sync::{Fence, FrameSync};

/// Swapchain construction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    /// Window extent in pixels
    pub extent: vk::Extent2D,
    /// Use mailbox presentation when supported
    pub prefer_mailbox: bool,
    /// Preferred surface format
    pub preferred_format: vk::Format,
}

impl SwapchainCreateInfo {
    /// Parameters for a window of `extent` with default presentation settings
    pub fn new(extent: vk::Extent2D) -> Self {
        Self::from_config(&SwapchainConfig::default(), extent)
    }

    /// Parameters from the swapchain section of the configuration
    pub fn from_config(config: &SwapchainConfig, extent: vk::Extent2D) -> Self {
        Self {
            extent,
            prefer_mailbox: config.prefer_mailbox,
            preferred_format: config.preferred_format.to_vk(),
        }
    }

    /// Whether the extent is non-empty
    pub const fn is_valid(&self) -> bool {
        self.extent.width > 0 && self.extent.height > 0
    }
}

/// Result of acquiring the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready to be rendered to
    Acquired {
        /// Swapchain image index
        image_index: u32,
        /// The surface no longer matches exactly; rebuild when convenient
        suboptimal: bool,
    },
    /// The swapchain must be rebuilt before rendering
    OutOfDate,
}

/// Result of submitting and presenting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the swapchain should be rebuilt
    Suboptimal,
    /// The frame was submitted but could not be presented; rebuild the swapchain
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the caller should rebuild the swapchain
    pub const fn needs_recreation(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Swapchain plus the synchronization objects of every frame in flight
pub struct Swapchain {
    context: Arc<GraphicsContext>,
    info: SwapchainCreateInfo,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    frames: Vec<FrameSync>,
    images_in_flight: Vec<vk::Fence>,
    current_frame: usize,
}

impl Swapchain {
    /// Create a swapchain for the device's surface
    ///
    /// # Panics
    /// Panics if `info` has an empty extent.
    pub fn new(context: &Arc<GraphicsContext>, info: &SwapchainCreateInfo) -> VulkanResult<Self> {
        assert!(info.is_valid(), "invalid swapchain create info: {info:?}");
        let device = context.device_arc();
        let frames = (0..context.frames_in_flight())
            .map(|_| FrameSync::new(&device))
            .collect::<VulkanResult<Vec<_>>>()?;

        let mut swapchain = Self {
            context: Arc::clone(context),
            info: *info,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: info.extent,
            present_mode: vk::PresentModeKHR::FIFO,
            frames,
            images_in_flight: Vec::new(),
            current_frame: 0,
        };
        swapchain.create(info.extent)?;
        Ok(swapchain)
    }

    fn create(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        let context = Arc::clone(&self.context);
        let device = context.device();
        let surface = device.surface().ok_or_else(|| {
            VulkanError::InitializationFailed("device has no presentation surface".to_string())
        })?;
        let old_swapchain = self.swapchain;
        let created = device.create_swapchain(&SwapchainDesc {
            surface,
            extent,
            preferred_format: self.info.preferred_format,
            prefer_mailbox: self.info.prefer_mailbox,
            old_swapchain,
        })?;

        self.destroy_views();
        if old_swapchain != vk::SwapchainKHR::null() {
            device.destroy_swapchain(old_swapchain);
        }
        self.swapchain = created.handle;
        self.images = created.images;
        self.format = created.format;
        self.extent = created.extent;
        self.present_mode = created.present_mode;
        self.images_in_flight = vec![vk::Fence::null(); self.images.len()];

        for &image in &self.images {
            let view = device.create_image_view(&ImageViewDesc {
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: self.format.format,
                aspect: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })?;
            self.image_views.push(view);
        }

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.format.format,
            self.present_mode
        );
        Ok(())
    }

    fn destroy_views(&mut self) {
        let device = self.context.device();
        for view in self.image_views.drain(..) {
            device.destroy_image_view(view);
        }
    }

    /// Rebuild the swapchain for a new window extent
    ///
    /// Waits for the device to go idle first; dependent framebuffers and
    /// pipelines must be rebuilt by the caller afterwards.
    pub fn recreate(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        self.context.wait_idle()?;
        log::info!(
            "Recreating swapchain: {}x{} -> {}x{}",
            self.extent.width,
            self.extent.height,
            extent.width,
            extent.height
        );
        self.info.extent = extent;
        self.create(extent)
    }

    /// Wait for the current slot, then acquire the next image
    pub fn acquire_next_image(&mut self) -> VulkanResult<AcquireOutcome> {
        let frame = &self.frames[self.current_frame];
        frame.in_flight.wait(u64::MAX)?;

        match self
            .context
            .device()
            .acquire_next_image(self.swapchain, frame.image_available.handle())
        {
            Ok((image_index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Acquired image {} from a suboptimal swapchain", image_index);
                }
                Ok(AcquireOutcome::Acquired {
                    image_index,
                    suboptimal,
                })
            }
            Err(e) if e.is_out_of_date() => {
                log::info!("Swapchain out of date on acquire");
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(e) => Err(e),
        }
    }

    /// Submit command buffers rendering to `image_index`, present it and advance
    /// to the next frame slot
    ///
    /// # Panics
    /// Panics if `image_index` is not an image of this swapchain.
    pub fn submit_command_buffers(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
        image_index: u32,
    ) -> VulkanResult<PresentOutcome> {
        let image = image_index as usize;
        assert!(
            image < self.images.len(),
            "image index {image_index} out of range for {} swapchain images",
            self.images.len()
        );

        let previous = self.images_in_flight[image];
        if previous != vk::Fence::null() {
            self.context.device().wait_for_fences(&[previous], u64::MAX)?;
        }
        let frame = &self.frames[self.current_frame];
        self.images_in_flight[image] = frame.in_flight.handle();

        let wait_semaphores = [frame.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished.handle()];
        let batch = SubmitBatch {
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            command_buffers,
            signal_semaphores: &signal_semaphores,
        };

        frame.in_flight.reset()?;
        if let Err(e) = self
            .context
            .submit(QueueKind::Graphics, &[batch], frame.in_flight.handle())
        {
            // Nothing will signal the reset fence; give the slot a signaled one.
            self.images_in_flight[image] = vk::Fence::null();
            self.frames[self.current_frame].in_flight = Fence::new(self.context.device_arc(), true)?;
            return Err(e);
        }
        let frame = &self.frames[self.current_frame];

        let presented = self
            .context
            .present(self.swapchain, image_index, frame.render_finished.handle());
        self.current_frame = (self.current_frame + 1) % self.frames.len();

        match presented {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(e) if e.is_out_of_date() => {
                log::info!("Swapchain out of date on present");
                Ok(PresentOutcome::OutOfDate)
            }
            Err(e) => Err(e),
        }
    }

    /// Get swapchain handle
    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Presentable images
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// One color view per image
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Get image count
    pub fn image_count(&self) -> u32 {
        u32::try_from(self.images.len()).unwrap_or(u32::MAX)
    }

    /// Surface format
    pub const fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Current extent
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Presentation mode
    pub const fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Slot used by the next acquire/submit pair
    pub const fn current_frame_index(&self) -> usize {
        self.current_frame
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Fence of the last submission that rendered to `image_index`, null if none
    pub fn image_in_flight(&self, image_index: u32) -> vk::Fence {
        self.images_in_flight
            .get(image_index as usize)
            .copied()
            .unwrap_or_else(vk::Fence::null)
    }

    /// In-flight fence of a frame slot
    pub fn frame_fence(&self, frame_index: usize) -> vk::Fence {
        self.frames[frame_index].in_flight.handle()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::error!("Failed to wait for idle before destroying swapchain: {}", e);
        }
        self.destroy_views();
        self.context.device().destroy_swapchain(self.swapchain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessConfig, HeadlessDevice, HeadlessEvent};
    use crate::config::CoreConfig;

    fn setup(config: HeadlessConfig) -> (Arc<HeadlessDevice>, Arc<GraphicsContext>, Swapchain) {
        let device = Arc::new(HeadlessDevice::with_config(config));
        let context = GraphicsContext::new(device.clone(), CoreConfig::default()).unwrap();
        let info = SwapchainCreateInfo::new(vk::Extent2D {
            width: 800,
            height: 600,
        });
        let swapchain = Swapchain::new(&context, &info).unwrap();
        (device, context, swapchain)
    }

    fn acquire(swapchain: &mut Swapchain) -> u32 {
        match swapchain.acquire_next_image().unwrap() {
            AcquireOutcome::Acquired { image_index, .. } => image_index,
            AcquireOutcome::OutOfDate => panic!("unexpected out-of-date swapchain"),
        }
    }

    #[test]
    fn test_create_info_validity() {
        let info = SwapchainCreateInfo::new(vk::Extent2D { width: 0, height: 600 });
        assert!(!info.is_valid());
        let info = SwapchainCreateInfo::new(vk::Extent2D { width: 1, height: 1 });
        assert!(info.is_valid());
        assert_eq!(info.preferred_format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn test_swapchain_properties() {
        let (device, _context, swapchain) = setup(HeadlessConfig::default());
        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(swapchain.image_views().len(), 3);
        assert_eq!(swapchain.extent(), vk::Extent2D { width: 800, height: 600 });
        assert_eq!(swapchain.format().format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(swapchain.frames_in_flight(), 2);

        let handle = swapchain.handle();
        drop(swapchain);
        assert!(!device.is_alive(handle));
    }

    #[test]
    fn test_no_surface_is_an_error() {
        let device = Arc::new(HeadlessDevice::with_config(
            HeadlessConfig::default().with_surface_extent(None),
        ));
        let context = GraphicsContext::new(device, CoreConfig::default()).unwrap();
        let info = SwapchainCreateInfo::new(vk::Extent2D { width: 64, height: 64 });
        assert!(matches!(
            Swapchain::new(&context, &info),
            Err(VulkanError::InitializationFailed(_))
        ));
    }

    #[test]
    fn test_frame_index_cycles() {
        let (device, _context, mut swapchain) = setup(HeadlessConfig::default());
        let mut indices = Vec::new();
        for _ in 0..7 {
            indices.push(swapchain.current_frame_index());
            let image = acquire(&mut swapchain);
            let outcome = swapchain.submit_command_buffers(&[], image).unwrap();
            assert_eq!(outcome, PresentOutcome::Presented);
        }
        assert_eq!(indices, vec![0, 1, 0, 1, 0, 1, 0]);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_image_reuse_waits_for_previous_frame() {
        let (device, _context, mut swapchain) = setup(HeadlessConfig::default());
        device.script_acquire_indices([0, 0]);

        let image = acquire(&mut swapchain);
        swapchain.submit_command_buffers(&[], image).unwrap();
        let first_fence = swapchain.image_in_flight(0);
        assert_eq!(first_fence, swapchain.frame_fence(0));
        assert_eq!(device.pending_submissions(), 1);

        device.clear_events();
        let image = acquire(&mut swapchain);
        assert_eq!(image, 0);
        swapchain.submit_command_buffers(&[], image).unwrap();

        let events = device.events();
        let wait = events
            .iter()
            .position(|e| *e == HeadlessEvent::FenceWait { fence: first_fence })
            .expect("second submit waits on the image's fence");
        let completed = events
            .iter()
            .position(|e| matches!(e, HeadlessEvent::Complete { .. }))
            .unwrap();
        let submitted = events
            .iter()
            .position(|e| matches!(e, HeadlessEvent::Submit { .. }))
            .unwrap();
        assert!(wait < completed && completed < submitted);
        assert_eq!(swapchain.image_in_flight(0), swapchain.frame_fence(1));
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_failed_submit_leaves_slot_usable() {
        let (device, _context, mut swapchain) = setup(HeadlessConfig::default());
        let reset_fence = swapchain.frame_fence(0);

        let image = acquire(&mut swapchain);
        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(
            swapchain.submit_command_buffers(&[], image),
            Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))
        );
        assert_eq!(swapchain.current_frame_index(), 0);
        assert_ne!(swapchain.frame_fence(0), reset_fence);
        assert!(!device.is_alive(reset_fence));
        assert_eq!(swapchain.image_in_flight(image), vk::Fence::null());

        // The slot's next acquire must not block on a fence nothing will signal.
        let image = acquire(&mut swapchain);
        assert_eq!(
            swapchain.submit_command_buffers(&[], image).unwrap(),
            PresentOutcome::Presented
        );
        assert_eq!(device.pending_submissions(), 1);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_resize_reports_out_of_date_until_recreated() {
        let (device, _context, mut swapchain) = setup(HeadlessConfig::default());
        let image = acquire(&mut swapchain);
        swapchain.submit_command_buffers(&[], image).unwrap();

        let resized = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        device.set_surface_extent(resized);
        assert_eq!(swapchain.acquire_next_image().unwrap(), AcquireOutcome::OutOfDate);

        let old = swapchain.handle();
        swapchain.recreate(resized).unwrap();
        assert_ne!(swapchain.handle(), old);
        assert!(!device.is_alive(old));
        assert_eq!(swapchain.extent(), resized);
        assert_eq!(swapchain.image_in_flight(0), vk::Fence::null());

        let image = acquire(&mut swapchain);
        assert_eq!(
            swapchain.submit_command_buffers(&[], image).unwrap(),
            PresentOutcome::Presented
        );
    }

    #[test]
    fn test_suboptimal_is_reported() {
        let (device, _context, mut swapchain) = setup(HeadlessConfig::default());
        device.set_suboptimal(true);
        let outcome = swapchain.acquire_next_image().unwrap();
        assert!(matches!(outcome, AcquireOutcome::Acquired { suboptimal: true, .. }));
        let AcquireOutcome::Acquired { image_index, .. } = outcome else {
            unreachable!()
        };
        let presented = swapchain.submit_command_buffers(&[], image_index).unwrap();
        assert_eq!(presented, PresentOutcome::Suboptimal);
        assert!(presented.needs_recreation());
    }
}
