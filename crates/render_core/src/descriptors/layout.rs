//! Descriptor set layouts

use ash::vk;
use std::sync::Arc;

use super::DescriptorClass;
use crate::context::GraphicsContext;
use crate::delete_queue::Garbage;
use crate::error::VulkanResult;

/// One slot of a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    /// Binding index in the shader
    pub binding: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Array size
    pub count: u32,
    /// Stages that access the binding
    pub stages: vk::ShaderStageFlags,
}

impl DescriptorBinding {
    /// Describe a binding
    pub const fn new(
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            descriptor_type,
            count,
            stages,
        }
    }

    /// Whether the binding can be used in a layout
    pub fn is_valid(&self) -> bool {
        self.count > 0 && !self.stages.is_empty() && DescriptorClass::of(self.descriptor_type).is_some()
    }

    /// Which resource info the binding is written with
    ///
    /// # Panics
    /// Panics for descriptor types that cannot be written; valid bindings never do.
    pub fn class(&self) -> DescriptorClass {
        DescriptorClass::of(self.descriptor_type).unwrap_or_else(|| {
            panic!(
                "binding {} has unsupported descriptor type {:?}",
                self.binding, self.descriptor_type
            )
        })
    }

    fn to_vk(self) -> vk::DescriptorSetLayoutBinding {
        vk::DescriptorSetLayoutBinding::builder()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .descriptor_count(self.count)
            .stage_flags(self.stages)
            .build()
    }
}

/// Descriptor set layout builder for creating reusable layouts
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<DescriptorBinding>,
    flags: vk::DescriptorSetLayoutCreateFlags,
}

impl DescriptorSetLayoutBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding
    pub fn add_binding(mut self, binding: DescriptorBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add_binding(DescriptorBinding::new(
            binding,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            stages,
        ))
    }

    /// Add a storage buffer binding
    pub fn add_storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add_binding(DescriptorBinding::new(
            binding,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            stages,
        ))
    }

    /// Add a combined image sampler binding with `count` array elements
    pub fn add_combined_image_sampler(
        self,
        binding: u32,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.add_binding(DescriptorBinding::new(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count,
            stages,
        ))
    }

    /// Add a storage image binding
    pub fn add_storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add_binding(DescriptorBinding::new(
            binding,
            vk::DescriptorType::STORAGE_IMAGE,
            1,
            stages,
        ))
    }

    /// Add a top-level acceleration structure binding
    pub fn add_acceleration_structure(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add_binding(DescriptorBinding::new(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            stages,
        ))
    }

    /// Set layout creation flags
    pub fn with_flags(mut self, flags: vk::DescriptorSetLayoutCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Build the descriptor set layout
    ///
    /// # Panics
    /// Panics if a binding is invalid or two bindings share a slot.
    pub fn build(self, context: &Arc<GraphicsContext>) -> VulkanResult<Arc<DescriptorSetLayout>> {
        for (i, binding) in self.bindings.iter().enumerate() {
            assert!(binding.is_valid(), "invalid descriptor binding {binding:?}");
            assert!(
                self.bindings[..i].iter().all(|b| b.binding != binding.binding),
                "descriptor binding {} declared twice",
                binding.binding
            );
        }
        let vk_bindings: Vec<_> = self.bindings.iter().map(|b| b.to_vk()).collect();
        let layout = context
            .device()
            .create_descriptor_set_layout(&vk_bindings, self.flags)?;
        log::trace!("Created descriptor set layout with {} bindings", self.bindings.len());

        Ok(Arc::new(DescriptorSetLayout {
            context: Arc::clone(context),
            layout,
            bindings: self.bindings,
        }))
    }
}

/// Immutable descriptor set layout
///
/// Shared through `Arc` by descriptor sets, writers and pipeline layouts; the native
/// layout is queued for deletion when the last reference drops.
pub struct DescriptorSetLayout {
    context: Arc<GraphicsContext>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub const fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get the bindings used in this layout
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    /// Binding declared at `slot`
    pub fn binding(&self, slot: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == slot)
    }

    pub(crate) const fn context(&self) -> &Arc<GraphicsContext> {
        &self.context
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.context
            .trash(Garbage::DescriptorSetLayout(self.layout));
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

    #[test]
    fn test_binding_validity() {
        let stages = vk::ShaderStageFlags::FRAGMENT;
        assert!(DescriptorBinding::new(0, vk::DescriptorType::UNIFORM_BUFFER, 1, stages).is_valid());
        assert!(!DescriptorBinding::new(0, vk::DescriptorType::UNIFORM_BUFFER, 0, stages).is_valid());
        assert!(!DescriptorBinding::new(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::empty()
        )
        .is_valid());
        assert!(!DescriptorBinding::new(0, vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1, stages)
            .is_valid());
    }

    #[test]
    fn test_layout_lookup() {
        let (_device, context) = context();
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_combined_image_sampler(2, 4, vk::ShaderStageFlags::FRAGMENT)
            .build(&context)
            .unwrap();

        assert_eq!(layout.bindings().len(), 2);
        assert_eq!(layout.binding(2).map(|b| b.count), Some(4));
        assert_eq!(layout.binding(2).map(DescriptorBinding::class), Some(DescriptorClass::Image));
        assert!(layout.binding(1).is_none());
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn test_duplicate_slot_panics() {
        let (_device, context) = context();
        let _ = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .build(&context);
    }

    #[test]
    fn test_layout_destruction_is_deferred() {
        let (device, context) = context();
        let layout = DescriptorSetLayoutBuilder::new()
            .add_storage_image(0, vk::ShaderStageFlags::COMPUTE)
            .build(&context)
            .unwrap();
        let handle = layout.handle();
        drop(layout);

        context.update_delete_queue();
        assert!(device.is_alive(handle));
        context.update_delete_queue();
        context.update_delete_queue();
        assert!(!device.is_alive(handle));
    }
}
