//! Owned descriptor sets with partial writes and post-build updates

use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{DescriptorPool, DescriptorSetLayout, DescriptorWriter, PooledSet};
use crate::delete_queue::Garbage;

/// Lifecycle state of a [`DescriptorSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorSetState {
    /// No layout bound yet
    Uninitialized,
    /// Layout and pool bound, collecting writes
    Initialized,
    /// Allocated and written; bindable
    Built,
}

#[derive(Debug, Clone)]
enum Resource {
    Buffers(Vec<vk::DescriptorBufferInfo>),
    Images(Vec<vk::DescriptorImageInfo>),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

/// A descriptor set that remembers what is bound to each binding
///
/// Resources added before [`build`](Self::build) are written in one batch together
/// with placeholders for the bindings left empty. After the build, `update_*`
/// rewrites a single binding in place without reallocating the set.
///
/// The caller must not update a set that an in-flight command buffer still reads;
/// per-frame data uses one set per frame in flight.
pub struct DescriptorSet {
    state: DescriptorSetState,
    layout: Option<Arc<DescriptorSetLayout>>,
    pool: Option<Arc<DescriptorPool>>,
    set: Option<PooledSet>,
    resources: BTreeMap<u32, Resource>,
}

impl Default for DescriptorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorSet {
    /// Create an uninitialized set
    pub const fn new() -> Self {
        Self {
            state: DescriptorSetState::Uninitialized,
            layout: None,
            pool: None,
            set: None,
            resources: BTreeMap::new(),
        }
    }

    /// Bind the layout and the pool the set will be allocated from
    ///
    /// # Panics
    /// Panics if the set was already initialized.
    pub fn init(&mut self, pool: &Arc<DescriptorPool>, layout: &Arc<DescriptorSetLayout>) {
        assert_eq!(
            self.state,
            DescriptorSetState::Uninitialized,
            "descriptor set initialized twice"
        );
        self.pool = Some(Arc::clone(pool));
        self.layout = Some(Arc::clone(layout));
        self.state = DescriptorSetState::Initialized;
    }

    /// Convenience for [`new`](Self::new) followed by [`init`](Self::init)
    pub fn with_layout(pool: &Arc<DescriptorPool>, layout: &Arc<DescriptorSetLayout>) -> Self {
        let mut set = Self::new();
        set.init(pool, layout);
        set
    }

    /// Bind a buffer range before the set is built
    pub fn add_buffer(&mut self, binding: u32, info: vk::DescriptorBufferInfo) -> &mut Self {
        self.add_buffers(binding, &[info])
    }

    /// Bind consecutive array elements of a buffer binding before the set is built
    pub fn add_buffers(&mut self, binding: u32, infos: &[vk::DescriptorBufferInfo]) -> &mut Self {
        self.stage(binding, Resource::Buffers(infos.to_vec()))
    }

    /// Bind an image before the set is built
    pub fn add_image(&mut self, binding: u32, info: vk::DescriptorImageInfo) -> &mut Self {
        self.add_images(binding, &[info])
    }

    /// Bind consecutive array elements of an image binding before the set is built
    pub fn add_images(&mut self, binding: u32, infos: &[vk::DescriptorImageInfo]) -> &mut Self {
        self.stage(binding, Resource::Images(infos.to_vec()))
    }

    /// Bind an acceleration structure before the set is built
    pub fn add_acceleration_structure(
        &mut self,
        binding: u32,
        structure: vk::AccelerationStructureKHR,
    ) -> &mut Self {
        self.stage(binding, Resource::AccelerationStructure(structure))
    }

    fn stage(&mut self, binding: u32, resource: Resource) -> &mut Self {
        assert_eq!(
            self.state,
            DescriptorSetState::Initialized,
            "resources can only be added to an initialized, unbuilt descriptor set"
        );
        // Validate now so a bad binding fails at the call that introduced it.
        let _ = self.writer_for(binding, &resource);
        self.resources.insert(binding, resource);
        self
    }

    fn writer_for<'a>(&'a self, binding: u32, resource: &Resource) -> DescriptorWriter<'a> {
        let writer = self.writer();
        match resource {
            Resource::Buffers(infos) => writer.write_buffers(binding, infos),
            Resource::Images(infos) => writer.write_images(binding, infos),
            Resource::AccelerationStructure(structure) => {
                writer.write_acceleration_structure(binding, *structure)
            }
        }
    }

    fn writer(&self) -> DescriptorWriter<'_> {
        match (&self.layout, &self.pool) {
            (Some(layout), Some(pool)) => DescriptorWriter::new(layout, pool),
            _ => panic!("descriptor set used before init"),
        }
    }

    /// Allocate the set and write every added resource
    ///
    /// Returns `false` if the pool could not allocate even after growing; the set
    /// then stays initialized and the build may be retried.
    ///
    /// # Panics
    /// Panics unless the set is initialized and not yet built.
    pub fn build(&mut self) -> bool {
        assert_eq!(
            self.state,
            DescriptorSetState::Initialized,
            "only an initialized descriptor set can be built"
        );
        let mut writer = self.writer();
        for (binding, resource) in &self.resources {
            writer = match resource {
                Resource::Buffers(infos) => writer.write_buffers(*binding, infos),
                Resource::Images(infos) => writer.write_images(*binding, infos),
                Resource::AccelerationStructure(structure) => {
                    writer.write_acceleration_structure(*binding, *structure)
                }
            };
        }
        let Some(set) = writer.build() else {
            return false;
        };
        self.set = Some(set);
        self.state = DescriptorSetState::Built;
        true
    }

    /// Rebind a buffer range of a built set
    pub fn update_buffer(&mut self, binding: u32, info: vk::DescriptorBufferInfo) {
        self.update(binding, Resource::Buffers(vec![info]));
    }

    /// Rebind consecutive array elements of a buffer binding of a built set
    pub fn update_buffers(&mut self, binding: u32, infos: &[vk::DescriptorBufferInfo]) {
        self.update(binding, Resource::Buffers(infos.to_vec()));
    }

    /// Rebind an image of a built set
    pub fn update_image(&mut self, binding: u32, info: vk::DescriptorImageInfo) {
        self.update(binding, Resource::Images(vec![info]));
    }

    /// Rebind consecutive array elements of an image binding of a built set
    pub fn update_images(&mut self, binding: u32, infos: &[vk::DescriptorImageInfo]) {
        self.update(binding, Resource::Images(infos.to_vec()));
    }

    /// Rebind the acceleration structure of a built set
    pub fn update_acceleration_structure(&mut self, binding: u32, structure: vk::AccelerationStructureKHR) {
        self.update(binding, Resource::AccelerationStructure(structure));
    }

    fn update(&mut self, binding: u32, resource: Resource) {
        assert_eq!(
            self.state,
            DescriptorSetState::Built,
            "only a built descriptor set can be updated"
        );
        let handle = self.handle();
        self.writer_for(binding, &resource).overwrite(handle);
        self.resources.insert(binding, resource);
    }

    /// Native handle; null until built
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
            .as_ref()
            .map_or_else(vk::DescriptorSet::null, PooledSet::handle)
    }

    /// Current lifecycle state
    pub const fn state(&self) -> DescriptorSetState {
        self.state
    }

    /// Whether the set can be bound
    pub fn is_built(&self) -> bool {
        self.state == DescriptorSetState::Built
    }

    /// Layout bound by [`init`](Self::init)
    pub const fn layout(&self) -> Option<&Arc<DescriptorSetLayout>> {
        self.layout.as_ref()
    }

    /// Index of the backing pool the set was allocated from
    pub fn pool_index(&self) -> Option<usize> {
        self.set.as_ref().map(PooledSet::pool_index)
    }

    /// Buffer infos currently bound at `binding`
    pub fn buffer_infos(&self, binding: u32) -> Option<&[vk::DescriptorBufferInfo]> {
        match self.resources.get(&binding) {
            Some(Resource::Buffers(infos)) => Some(infos),
            _ => None,
        }
    }

    /// Image infos currently bound at `binding`
    pub fn image_infos(&self, binding: u32) -> Option<&[vk::DescriptorImageInfo]> {
        match self.resources.get(&binding) {
            Some(Resource::Images(infos)) => Some(infos),
            _ => None,
        }
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        let (Some(set), Some(pool)) = (self.set.take(), self.pool.as_ref()) else {
            return;
        };
        // Without FREE_DESCRIPTOR_SET the slot returns when the backing pool is
        // destroyed; dropping `set` releases our hold on it.
        if pool.frees_sets() {
            pool.context().trash(Garbage::DescriptorSet {
                pool: Arc::clone(set.backing_pool()),
                set: set.handle(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DescriptorResources, HeadlessDevice};
    use crate::config::CoreConfig;
    use crate::context::GraphicsContext;
    use crate::descriptors::{DescriptorPoolCreateInfo, DescriptorSetLayoutBuilder};

    fn setup(
        flags: vk::DescriptorPoolCreateFlags,
    ) -> (
        Arc<HeadlessDevice>,
        Arc<GraphicsContext>,
        Arc<DescriptorPool>,
        Arc<DescriptorSetLayout>,
    ) {
        let device = Arc::new(HeadlessDevice::new());
        let context = GraphicsContext::new(device.clone(), CoreConfig::default()).unwrap();
        let pool = DescriptorPool::from_config(&context, flags).unwrap();
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_combined_image_sampler(1, 1, vk::ShaderStageFlags::FRAGMENT)
            .build(&context)
            .unwrap();
        (device, context, pool, layout)
    }

    fn range(context: &GraphicsContext, size: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: context.empty_buffer_info().buffer,
            offset: 0,
            range: size,
        }
    }

    #[test]
    fn test_state_machine() {
        let (_device, context, pool, layout) = setup(vk::DescriptorPoolCreateFlags::empty());
        let mut set = DescriptorSet::new();
        assert_eq!(set.state(), DescriptorSetState::Uninitialized);
        assert_eq!(set.handle(), vk::DescriptorSet::null());

        set.init(&pool, &layout);
        assert_eq!(set.state(), DescriptorSetState::Initialized);
        set.add_buffer(0, range(&context, 16));
        assert!(set.build());
        assert!(set.is_built());
        assert_ne!(set.handle(), vk::DescriptorSet::null());
        assert_eq!(set.pool_index(), Some(0));
    }

    #[test]
    fn test_single_image_fills_whole_array() {
        let (device, context, pool, _layout) = setup(vk::DescriptorPoolCreateFlags::empty());
        let textures = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, 3, vk::ShaderStageFlags::FRAGMENT)
            .build(&context)
            .unwrap();
        let mut set = DescriptorSet::with_layout(&pool, &textures);
        set.add_image(0, context.empty_image_info());
        assert!(set.build());

        let written = device.descriptor_binding(set.handle(), 0).unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(
            written,
            DescriptorResources::Images(vec![context.empty_image_info(); 3])
        );
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_update_rebinds_in_place() {
        let (device, context, pool, layout) = setup(vk::DescriptorPoolCreateFlags::empty());
        let mut set = DescriptorSet::with_layout(&pool, &layout);
        set.add_buffer(0, range(&context, 16));
        assert!(set.build());
        let handle = set.handle();

        set.update_buffer(0, range(&context, 32));
        assert_eq!(set.handle(), handle);
        assert_eq!(
            device.descriptor_binding(handle, 0),
            Some(DescriptorResources::Buffers(vec![range(&context, 32)]))
        );
        assert_eq!(set.buffer_infos(0).map(|infos| infos[0].range), Some(32));
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    #[should_panic(expected = "only a built descriptor set can be updated")]
    fn test_update_before_build_panics() {
        let (_device, context, pool, layout) = setup(vk::DescriptorPoolCreateFlags::empty());
        let mut set = DescriptorSet::with_layout(&pool, &layout);
        set.update_buffer(0, range(&context, 16));
    }

    #[test]
    #[should_panic(expected = "cannot be written with Buffer info")]
    fn test_add_wrong_kind_panics() {
        let (_device, context, pool, layout) = setup(vk::DescriptorPoolCreateFlags::empty());
        let mut set = DescriptorSet::with_layout(&pool, &layout);
        set.add_buffer(1, range(&context, 16));
    }

    #[test]
    fn test_drop_frees_set_through_delete_queue() {
        let (device, context, pool, layout) = setup(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        let mut set = DescriptorSet::with_layout(&pool, &layout);
        assert!(set.build());
        let handle = set.handle();
        drop(set);

        assert!(device.is_alive(handle));
        for _ in 0..=context.frames_in_flight() {
            context.update_delete_queue();
        }
        assert!(!device.is_alive(handle));
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }
}
