//! # render_core
//!
//! GPU memory and resource lifetime management for an explicit, Vulkan-class
//! renderer. The crate gives render passes a uniform way to allocate, bind, mutate
//! and destroy GPU objects while earlier frames may still be executing against them.
//!
//! ## Architecture
//!
//! Everything hangs off one [`GraphicsContext`], built once from a [`GpuDevice`]
//! and shared through an `Arc`:
//!
//! - [`memory::MemoryPool`] carves device memory into arenas keyed by memory type
//!   and resource kind, falling back to dedicated allocations
//! - [`resources::Buffer`] and [`resources::Image`] are move-only owners of GPU
//!   objects; dropping them hands the objects to the [`DeleteQueue`]
//! - [`descriptors`] provides layouts, a growable pool, a validating writer and
//!   descriptor sets with partial writes and post-build updates
//! - [`pipeline`] wraps shader modules, pipeline layouts and the three pipeline kinds
//! - [`swapchain`] implements the acquire/submit/present protocol and the frame loop
//! - [`DeleteQueue`] frees each object only after every frame that could reference
//!   it has retired
//!
//! Two device backends exist: [`backend::VulkanDevice`] (ash) and
//! [`backend::HeadlessDevice`], a CPU simulation used by tests and the demo.
//!
//! ## Frame Lifecycle
//!
//! ```text
//! loop {
//!     poll window events
//!     context.update_delete_queue();        // exactly once per iteration
//!     let Some(cmd) = renderer.begin_frame()? else {   // waits on the slot's fence
//!         renderer.recreate_swapchain(window_extent)?;
//!         continue;
//!     };
//!     ... record render passes into cmd ...
//!     if renderer.end_frame()?.needs_recreation() {     // submit + present, advance slot
//!         renderer.recreate_swapchain(window_extent)?;
//!     }
//! }
//! ```

pub mod backend;
pub mod commands;
pub mod config;
pub mod context;
pub mod delete_queue;
pub mod descriptors;
pub mod error;
pub mod foundation;
pub mod memory;
pub mod pipeline;
pub mod resources;
pub mod swapchain;
pub mod sync;

pub use backend::{GpuDevice, HeadlessDevice, VulkanDevice};
pub use config::{Config, CoreConfig};
pub use context::GraphicsContext;
pub use delete_queue::{DeleteQueue, DeleteQueueCreateInfo};
pub use error::{VulkanError, VulkanResult};

/// Re-exported so downstream crates use the same `ash` version
pub use ash::vk;
