//! Synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers over fences and binary semaphores. [`FrameSync`] bundles the three
//! objects one frame-in-flight slot of the swapchain protocol needs:
//!
//! ```text
//! acquire ──signals──► image_available ──waited by──► submit
//! submit  ──signals──► render_finished ──waited by──► present
//! submit  ──signals──► in_flight       ──waited by──► CPU, N frames later
//! ```

use ash::vk;
use std::sync::Arc;

use crate::backend::GpuDevice;
use crate::error::VulkanResult;

/// Semaphore wrapper with RAII cleanup
pub struct Semaphore {
    device: Arc<dyn GpuDevice>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new semaphore
    pub fn new(device: Arc<dyn GpuDevice>) -> VulkanResult<Self> {
        let semaphore = device.create_semaphore()?;
        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub const fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Arc<dyn GpuDevice>,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence, optionally already signaled
    pub fn new(device: Arc<dyn GpuDevice>, signaled: bool) -> VulkanResult<Self> {
        let fence = device.create_fence(signaled)?;
        Ok(Self { device, fence })
    }

    /// Block until the fence is signaled
    pub fn wait(&self, timeout: u64) -> VulkanResult<()> {
        self.device.wait_for_fences(&[self.fence], timeout)
    }

    /// Return the fence to the unsignaled state
    pub fn reset(&self) -> VulkanResult<()> {
        self.device.reset_fences(&[self.fence])
    }

    /// Whether the fence is signaled, without blocking
    pub fn is_signaled(&self) -> VulkanResult<bool> {
        self.device.fence_status(self.fence)
    }

    /// Get the fence handle
    pub const fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

/// Synchronization objects of one frame-in-flight slot
pub struct FrameSync {
    /// Signaled when the acquired swapchain image is ready to be written
    pub image_available: Semaphore,
    /// Signaled when the frame's command buffers finished executing
    pub render_finished: Semaphore,
    /// Signaled with `render_finished`; the CPU waits on it before reusing the slot
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create the slot's objects; the fence starts signaled so the first wait passes
    pub fn new(device: &Arc<dyn GpuDevice>) -> VulkanResult<Self> {
        Ok(Self {
            image_available: Semaphore::new(Arc::clone(device))?,
            render_finished: Semaphore::new(Arc::clone(device))?,
            in_flight: Fence::new(Arc::clone(device), true)?,
        })
    }
}
