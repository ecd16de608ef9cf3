//! # Descriptor Management
//!
//! Binding resources to shaders goes through four types:
//!
//! - [`DescriptorSetLayout`]: immutable list of bindings, built with
//!   [`DescriptorSetLayoutBuilder`]
//! - [`DescriptorPool`]: a list of backing pools that grows by one whenever the
//!   newest pool is exhausted; sets stay with the backing pool they came from
//! - [`DescriptorWriter`]: buffers validated writes and applies them in one batch
//! - [`DescriptorSet`]: an owned set with partial writes before build and
//!   per-binding updates after it
//!
//! ```text
//! Uninitialized ──init──► Initialized ──add_*──► ... ──build──► Built ──update_*──► Built
//!                                                                  │
//!                                                                drop ──► delete queue
//! ```

use ash::vk;

mod layout;
mod pool;
mod set;
mod writer;

pub use layout::{DescriptorBinding, DescriptorSetLayout, DescriptorSetLayoutBuilder};
pub use pool::{BackingPool, DescriptorPool, DescriptorPoolCreateInfo, PooledSet};
pub use set::{DescriptorSet, DescriptorSetState};
pub use writer::DescriptorWriter;

/// Which kind of resource info a descriptor type is written with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorClass {
    /// `vk::DescriptorBufferInfo`
    Buffer,
    /// `vk::DescriptorImageInfo`
    Image,
    /// Top-level acceleration structure handles
    AccelerationStructure,
}

impl DescriptorClass {
    /// Class of a descriptor type, `None` for types this crate cannot write
    pub const fn of(ty: vk::DescriptorType) -> Option<Self> {
        match ty {
            vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => Some(Self::Buffer),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::SAMPLER
            | vk::DescriptorType::INPUT_ATTACHMENT => Some(Self::Image),
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => Some(Self::AccelerationStructure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_classes() {
        assert_eq!(
            DescriptorClass::of(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
            Some(DescriptorClass::Buffer)
        );
        assert_eq!(
            DescriptorClass::of(vk::DescriptorType::STORAGE_IMAGE),
            Some(DescriptorClass::Image)
        );
        assert_eq!(
            DescriptorClass::of(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
            Some(DescriptorClass::AccelerationStructure)
        );
        assert_eq!(DescriptorClass::of(vk::DescriptorType::UNIFORM_TEXEL_BUFFER), None);
    }
}
