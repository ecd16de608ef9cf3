//! Validated, batched descriptor writes

use ash::vk;
use std::collections::BTreeMap;

use super::{DescriptorClass, DescriptorPool, DescriptorSetLayout, PooledSet};
use crate::backend::{DescriptorResources, DescriptorWrite};

/// Collects writes for one set and applies them in a single update
///
/// Every write is checked against the layout when it is added: the binding must
/// exist, the resource kind must match the binding's descriptor type, and the
/// number of descriptors must fit the binding's array size. Violations panic.
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    pool: &'a DescriptorPool,
    writes: BTreeMap<u32, DescriptorResources>,
}

impl<'a> DescriptorWriter<'a> {
    /// Start a writer for sets of `layout` allocated from `pool`
    pub fn new(layout: &'a DescriptorSetLayout, pool: &'a DescriptorPool) -> Self {
        Self {
            layout,
            pool,
            writes: BTreeMap::new(),
        }
    }

    /// Write one buffer range
    pub fn write_buffer(self, binding: u32, info: vk::DescriptorBufferInfo) -> Self {
        self.write_buffers(binding, &[info])
    }

    /// Write consecutive array elements of a buffer binding
    pub fn write_buffers(mut self, binding: u32, infos: &[vk::DescriptorBufferInfo]) -> Self {
        self.check(binding, DescriptorClass::Buffer, infos.len());
        self.writes
            .insert(binding, DescriptorResources::Buffers(infos.to_vec()));
        self
    }

    /// Write one image
    pub fn write_image(self, binding: u32, info: vk::DescriptorImageInfo) -> Self {
        self.write_images(binding, &[info])
    }

    /// Write consecutive array elements of an image binding
    pub fn write_images(mut self, binding: u32, infos: &[vk::DescriptorImageInfo]) -> Self {
        self.check(binding, DescriptorClass::Image, infos.len());
        self.writes
            .insert(binding, DescriptorResources::Images(infos.to_vec()));
        self
    }

    /// Write a top-level acceleration structure
    pub fn write_acceleration_structure(
        mut self,
        binding: u32,
        structure: vk::AccelerationStructureKHR,
    ) -> Self {
        self.check(binding, DescriptorClass::AccelerationStructure, 1);
        self.writes.insert(
            binding,
            DescriptorResources::AccelerationStructures(vec![structure]),
        );
        self
    }

    fn check(&self, binding: u32, class: DescriptorClass, count: usize) {
        let Some(declared) = self.layout.binding(binding) else {
            panic!("layout does not contain binding {binding}");
        };
        assert_eq!(
            declared.class(),
            class,
            "binding {binding} of type {:?} cannot be written with {class:?} info",
            declared.descriptor_type
        );
        assert!(
            count > 0 && count <= declared.count as usize,
            "write of {count} descriptors exceeds binding {binding} of count {}",
            declared.count
        );
    }

    /// Number of bindings written so far
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Allocate a new set from the pool and apply the writes to it
    ///
    /// Bindings that were not written, and the trailing elements of partially
    /// written arrays, receive the context's placeholder buffer or image so that
    /// every descriptor of the set is valid. Returns `None` if the pool could not
    /// allocate, even after growing.
    pub fn build(&self) -> Option<PooledSet> {
        let set = self.pool.allocate(self.layout)?;
        let context = self.layout.context();
        let mut writes = self.descriptor_writes(set.handle());

        for write in &mut writes {
            let Some(declared) = self.layout.binding(write.binding) else {
                continue;
            };
            let count = declared.count as usize;
            match &mut write.resources {
                DescriptorResources::Buffers(infos) => infos.resize(count, context.empty_buffer_info()),
                DescriptorResources::Images(infos) => infos.resize(count, context.empty_image_info()),
                DescriptorResources::AccelerationStructures(_) => {}
            }
        }

        for binding in self.layout.bindings() {
            if self.writes.contains_key(&binding.binding) {
                continue;
            }
            let count = binding.count as usize;
            let resources = match binding.class() {
                DescriptorClass::Buffer => {
                    DescriptorResources::Buffers(vec![context.empty_buffer_info(); count])
                }
                DescriptorClass::Image => {
                    DescriptorResources::Images(vec![context.empty_image_info(); count])
                }
                DescriptorClass::AccelerationStructure => {
                    log::warn!(
                        "Acceleration structure binding {} left unwritten in set {:?}",
                        binding.binding,
                        set.handle()
                    );
                    continue;
                }
            };
            writes.push(DescriptorWrite {
                set: set.handle(),
                binding: binding.binding,
                array_element: 0,
                descriptor_type: binding.descriptor_type,
                resources,
            });
        }

        context.device().update_descriptor_sets(&writes);
        Some(set)
    }

    /// Apply the writes to an existing set; other bindings keep their contents
    pub fn overwrite(&self, set: vk::DescriptorSet) {
        if self.writes.is_empty() {
            return;
        }
        let writes = self.descriptor_writes(set);
        self.layout.context().device().update_descriptor_sets(&writes);
    }

    fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<DescriptorWrite> {
        self.writes
            .iter()
            .filter_map(|(binding, resources)| {
                let declared = self.layout.binding(*binding)?;
                Some(DescriptorWrite {
                    set,
                    binding: *binding,
                    array_element: 0,
                    descriptor_type: declared.descriptor_type,
                    resources: resources.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::config::CoreConfig;
    use crate::context::GraphicsContext;
    use crate::descriptors::{DescriptorPoolCreateInfo, DescriptorSetLayoutBuilder};
    use std::sync::Arc;

    struct Fixture {
        device: Arc<HeadlessDevice>,
        context: Arc<GraphicsContext>,
        layout: Arc<DescriptorSetLayout>,
        pool: Arc<DescriptorPool>,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(HeadlessDevice::new());
        let context = GraphicsContext::new(device.clone(), CoreConfig::default()).unwrap();
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_combined_image_sampler(1, 2, vk::ShaderStageFlags::FRAGMENT)
            .add_storage_buffer(2, vk::ShaderStageFlags::COMPUTE)
            .build(&context)
            .unwrap();
        let info = DescriptorPoolCreateInfo::from_config(&context.config().descriptors);
        let pool = DescriptorPool::new(&context, info).unwrap();
        Fixture {
            device,
            context,
            layout,
            pool,
        }
    }

    #[test]
    fn test_unwritten_bindings_get_defaults() {
        let f = fixture();
        let info = f.context.empty_buffer_info();
        let set = DescriptorWriter::new(&f.layout, &f.pool)
            .write_buffer(0, info)
            .build()
            .unwrap();

        let images = f.device.descriptor_binding(set.handle(), 1);
        assert_eq!(
            images,
            Some(DescriptorResources::Images(vec![f.context.empty_image_info(); 2]))
        );
        let storage = f.device.descriptor_binding(set.handle(), 2);
        assert_eq!(
            storage,
            Some(DescriptorResources::Buffers(vec![f.context.empty_buffer_info()]))
        );
        assert!(f.device.validation_errors().is_empty(), "{:?}", f.device.validation_errors());
    }

    #[test]
    fn test_partial_array_write_is_padded() {
        let f = fixture();
        let layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, 3, vk::ShaderStageFlags::FRAGMENT)
            .build(&f.context)
            .unwrap();
        let texture = vk::DescriptorImageInfo {
            sampler: f.context.empty_image_info().sampler,
            image_view: f.context.empty_image_info().image_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let set = DescriptorWriter::new(&layout, &f.pool)
            .write_image(0, texture)
            .build()
            .unwrap();

        let placeholder = f.context.empty_image_info();
        assert_eq!(
            f.device.descriptor_binding(set.handle(), 0),
            Some(DescriptorResources::Images(vec![texture, placeholder, placeholder]))
        );
        assert!(f.device.validation_errors().is_empty(), "{:?}", f.device.validation_errors());
    }

    #[test]
    fn test_overwrite_touches_only_written_bindings() {
        let f = fixture();
        let set = DescriptorWriter::new(&f.layout, &f.pool).build().unwrap();
        let replacement = vk::DescriptorBufferInfo {
            buffer: f.context.empty_buffer_info().buffer,
            offset: 0,
            range: 64,
        };
        DescriptorWriter::new(&f.layout, &f.pool)
            .write_buffer(2, replacement)
            .overwrite(set.handle());

        assert_eq!(
            f.device.descriptor_binding(set.handle(), 2),
            Some(DescriptorResources::Buffers(vec![replacement]))
        );
        assert_eq!(
            f.device.descriptor_binding(set.handle(), 0),
            Some(DescriptorResources::Buffers(vec![f.context.empty_buffer_info()]))
        );
    }

    #[test]
    #[should_panic(expected = "does not contain binding 7")]
    fn test_unknown_binding_panics() {
        let f = fixture();
        let _ = DescriptorWriter::new(&f.layout, &f.pool).write_buffer(7, f.context.empty_buffer_info());
    }

    #[test]
    #[should_panic(expected = "cannot be written with Image info")]
    fn test_wrong_info_kind_panics() {
        let f = fixture();
        let _ = DescriptorWriter::new(&f.layout, &f.pool).write_image(0, f.context.empty_image_info());
    }

    #[test]
    #[should_panic(expected = "exceeds binding 1")]
    fn test_descriptor_count_is_enforced() {
        let f = fixture();
        let info = f.context.empty_image_info();
        let _ = DescriptorWriter::new(&f.layout, &f.pool).write_images(1, &[info; 3]);
    }
}
