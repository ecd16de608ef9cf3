//! GPU resources with deferred destruction
//!
//! [`Buffer`] and [`Image`] are move-only: each native handle has exactly one live
//! owner, and dropping the owner moves the handle into the delete queue.

pub mod barrier;
mod buffer;
mod image;

pub use barrier::BarrierMasks;
pub use buffer::{Buffer, BufferCreateInfo};
pub use image::{full_mip_chain, Image, ImageCreateInfo, MAX_IMAGE_LAYERS};
