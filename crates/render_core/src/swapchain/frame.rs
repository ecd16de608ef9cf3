//! Frame loop driver: one command buffer per frame in flight

use ash::vk;
use std::sync::Arc;

use super::{AcquireOutcome, PresentOutcome, Swapchain, SwapchainCreateInfo};
use crate::context::GraphicsContext;
use crate::error::VulkanResult;

/// Drives acquire, record, submit and present for render passes
///
/// ```text
/// let Some(cmd) = renderer.begin_frame()? else { rebuild; continue };
/// ... record into cmd ...
/// if renderer.end_frame()?.needs_recreation() { rebuild }
/// ```
pub struct FrameRenderer {
    context: Arc<GraphicsContext>,
    swapchain: Swapchain,
    command_buffers: Vec<vk::CommandBuffer>,
    current_image: Option<u32>,
}

impl FrameRenderer {
    /// Create the swapchain and one command buffer per frame slot
    pub fn new(context: &Arc<GraphicsContext>, info: &SwapchainCreateInfo) -> VulkanResult<Self> {
        let swapchain = Swapchain::new(context, info)?;
        let count = u32::try_from(swapchain.frames_in_flight()).unwrap_or(u32::MAX);
        let command_buffers = context.allocate_command_buffers(count)?;
        log::debug!("Frame renderer ready with {} frames in flight", count);
        Ok(Self {
            context: Arc::clone(context),
            swapchain,
            command_buffers,
            current_image: None,
        })
    }

    /// Acquire an image and open the current slot's command buffer
    ///
    /// Returns `None` when the swapchain is out of date; call
    /// [`recreate_swapchain`](Self::recreate_swapchain) and try again.
    ///
    /// # Panics
    /// Panics if the previous frame was not ended.
    pub fn begin_frame(&mut self) -> VulkanResult<Option<vk::CommandBuffer>> {
        assert!(self.current_image.is_none(), "begin_frame called twice without end_frame");

        let image_index = match self.swapchain.acquire_next_image()? {
            AcquireOutcome::Acquired { image_index, .. } => image_index,
            AcquireOutcome::OutOfDate => return Ok(None),
        };

        let cmd = self.current_command_buffer();
        let device = self.context.device();
        device.reset_command_buffer(cmd)?;
        device.begin_command_buffer(cmd, true)?;
        self.current_image = Some(image_index);
        Ok(Some(cmd))
    }

    /// Close, submit and present the current frame
    ///
    /// # Panics
    /// Panics if no frame was begun.
    pub fn end_frame(&mut self) -> VulkanResult<PresentOutcome> {
        let image_index = self
            .current_image
            .take()
            .unwrap_or_else(|| panic!("end_frame called without begin_frame"));
        let cmd = self.current_command_buffer();
        self.context.device().end_command_buffer(cmd)?;
        self.swapchain.submit_command_buffers(&[cmd], image_index)
    }

    /// Rebuild the swapchain after a resize or an out-of-date report
    ///
    /// # Panics
    /// Panics if called between `begin_frame` and `end_frame`.
    pub fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        assert!(
            self.current_image.is_none(),
            "swapchain recreated in the middle of a frame"
        );
        self.swapchain.recreate(extent)
    }

    /// Command buffer of the current frame slot
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffers[self.swapchain.current_frame_index()]
    }

    /// Current frame slot, in `0..frames_in_flight`
    pub const fn current_frame_index(&self) -> usize {
        self.swapchain.current_frame_index()
    }

    /// Image being rendered between `begin_frame` and `end_frame`
    pub const fn current_image_index(&self) -> Option<u32> {
        self.current_image
    }

    /// Whether a frame is being recorded
    pub const fn is_frame_in_progress(&self) -> bool {
        self.current_image.is_some()
    }

    /// The underlying swapchain
    pub const fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }
}

impl Drop for FrameRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::error!("Failed to wait for idle before freeing frame command buffers: {}", e);
        }
        self.context.free_command_buffers(&self.command_buffers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::config::CoreConfig;

    fn renderer(frames: u32) -> (Arc<HeadlessDevice>, Arc<GraphicsContext>, FrameRenderer) {
        let device = Arc::new(HeadlessDevice::new());
        let config = CoreConfig::default().with_frames_in_flight(frames);
        let context = GraphicsContext::new(device.clone(), config).unwrap();
        let info = SwapchainCreateInfo::new(vk::Extent2D {
            width: 800,
            height: 600,
        });
        let renderer = FrameRenderer::new(&context, &info).unwrap();
        (device, context, renderer)
    }

    #[test]
    fn test_frames_cycle_through_slots() {
        let (device, context, mut renderer) = renderer(3);
        let mut slots = Vec::new();
        let mut buffers = Vec::new();
        for _ in 0..6 {
            context.update_delete_queue();
            slots.push(renderer.current_frame_index());
            let cmd = renderer.begin_frame().unwrap().unwrap();
            assert_eq!(cmd, renderer.current_command_buffer());
            assert!(renderer.is_frame_in_progress());
            buffers.push(cmd);
            assert_eq!(renderer.end_frame().unwrap(), PresentOutcome::Presented);
        }
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(buffers[0], buffers[3]);
        assert_ne!(buffers[0], buffers[1]);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_out_of_date_then_recreate() {
        let (device, _context, mut renderer) = renderer(2);
        renderer.begin_frame().unwrap().unwrap();
        renderer.end_frame().unwrap();

        let extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        device.set_surface_extent(extent);
        assert!(renderer.begin_frame().unwrap().is_none());
        assert!(!renderer.is_frame_in_progress());

        renderer.recreate_swapchain(extent).unwrap();
        assert_eq!(renderer.swapchain().extent(), extent);
        assert!(renderer.begin_frame().unwrap().is_some());
        assert_eq!(renderer.end_frame().unwrap(), PresentOutcome::Presented);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    #[should_panic(expected = "end_frame called without begin_frame")]
    fn test_end_without_begin_panics() {
        let (_device, _context, mut renderer) = renderer(2);
        let _ = renderer.end_frame();
    }

    #[test]
    fn test_drop_frees_command_buffers() {
        let (device, _context, renderer) = renderer(2);
        let buffers = renderer.command_buffers.clone();
        drop(renderer);
        assert!(buffers.iter().all(|cmd| !device.is_alive(*cmd)));
    }
}
