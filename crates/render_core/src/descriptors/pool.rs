//! Growable descriptor pool
//!
//! A [`DescriptorPool`] is an ordered list of backing `vk::DescriptorPool`s that all
//! share one sizing policy. Allocation always targets the newest backing pool; when
//! it is exhausted a new one is appended and the allocation retried once. Sets keep
//! a reference to the backing pool they came from, so growth never migrates them
//! and a backing pool outlives every set allocated from it.

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use super::DescriptorSetLayout;
use crate::config::DescriptorConfig;
use crate::context::GraphicsContext;
use crate::delete_queue::Garbage;
use crate::error::{VulkanError, VulkanResult};

/// One native descriptor pool owned by a [`DescriptorPool`]
#[derive(Debug, PartialEq, Eq)]
pub struct BackingPool {
    handle: vk::DescriptorPool,
    index: usize,
}

impl BackingPool {
    pub(crate) const fn new(handle: vk::DescriptorPool, index: usize) -> Self {
        Self { handle, index }
    }

    /// Native handle
    pub const fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    /// Position in the owning pool's list
    pub const fn index(&self) -> usize {
        self.index
    }
}

/// Sizing policy shared by every backing pool
#[derive(Debug, Clone)]
pub struct DescriptorPoolCreateInfo {
    /// Sets per backing pool
    pub max_sets: u32,
    /// Descriptors of each type per backing pool
    pub pool_sizes: Vec<vk::DescriptorPoolSize>,
    /// Creation flags (`FREE_DESCRIPTOR_SET` lets dropped sets return their slots)
    pub flags: vk::DescriptorPoolCreateFlags,
}

impl DescriptorPoolCreateInfo {
    /// Explicit sizing
    pub fn new(max_sets: u32, pool_sizes: Vec<vk::DescriptorPoolSize>) -> Self {
        Self {
            max_sets,
            pool_sizes,
            flags: vk::DescriptorPoolCreateFlags::empty(),
        }
    }

    /// Sizing from the descriptor section of the configuration
    pub fn from_config(config: &DescriptorConfig) -> Self {
        Self::new(
            config.max_sets_per_pool,
            config.pool_size_ratios.pool_sizes(config.max_sets_per_pool),
        )
    }

    /// Set the creation flags
    pub fn with_flags(mut self, flags: vk::DescriptorPoolCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether the sizing can hold at least one set
    pub fn is_valid(&self) -> bool {
        self.max_sets > 0
            && !self.pool_sizes.is_empty()
            && self.pool_sizes.iter().all(|size| size.descriptor_count > 0)
    }
}

/// A set handle together with the backing pool it was allocated from
#[derive(Debug, Clone)]
pub struct PooledSet {
    set: vk::DescriptorSet,
    pool: Arc<BackingPool>,
}

impl PooledSet {
    /// Native set handle
    pub const fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Index of the backing pool that owns the set
    pub fn pool_index(&self) -> usize {
        self.pool.index()
    }

    pub(crate) fn backing_pool(&self) -> &Arc<BackingPool> {
        &self.pool
    }
}

/// Descriptor pool that grows on exhaustion
pub struct DescriptorPool {
    context: Arc<GraphicsContext>,
    info: DescriptorPoolCreateInfo,
    pools: Mutex<Vec<Arc<BackingPool>>>,
}

impl DescriptorPool {
    /// Create the pool with its first backing pool
    ///
    /// # Panics
    /// Panics if `info` cannot hold a single set.
    pub fn new(context: &Arc<GraphicsContext>, info: DescriptorPoolCreateInfo) -> VulkanResult<Arc<Self>> {
        assert!(info.is_valid(), "invalid descriptor pool create info: {info:?}");
        let first = Self::create_backing(context, &info, 0)?;
        Ok(Arc::new(Self {
            context: Arc::clone(context),
            info,
            pools: Mutex::new(vec![first]),
        }))
    }

    /// Create a pool sized from the context's configuration
    pub fn from_config(
        context: &Arc<GraphicsContext>,
        flags: vk::DescriptorPoolCreateFlags,
    ) -> VulkanResult<Arc<Self>> {
        let info = DescriptorPoolCreateInfo::from_config(&context.config().descriptors).with_flags(flags);
        Self::new(context, info)
    }

    fn create_backing(
        context: &GraphicsContext,
        info: &DescriptorPoolCreateInfo,
        index: usize,
    ) -> VulkanResult<Arc<BackingPool>> {
        let handle = context
            .device()
            .create_descriptor_pool(info.max_sets, &info.pool_sizes, info.flags)?;
        Ok(Arc::new(BackingPool::new(handle, index)))
    }

    /// Allocate a set from the newest backing pool
    ///
    /// When that pool is out of sets or descriptors, a new backing pool with the
    /// same sizing is appended and the allocation retried once. Returns `None` if
    /// the retry fails as well; callers may then rebuild the whole pool.
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> Option<PooledSet> {
        let device = self.context.device();
        let mut pools = self.pools.lock();
        let current = pools.last().map(Arc::clone)?;

        match device.allocate_descriptor_set(current.handle(), layout.handle()) {
            Ok(set) => return Some(PooledSet { set, pool: current }),
            Err(VulkanError::Api(
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL,
            )) => {}
            Err(e) => {
                log::error!("Descriptor set allocation failed: {}", e);
                return None;
            }
        }

        let index = pools.len();
        let grown = match Self::create_backing(&self.context, &self.info, index) {
            Ok(pool) => pool,
            Err(e) => {
                log::error!("Failed to create descriptor backing pool {}: {}", index, e);
                return None;
            }
        };
        log::info!(
            "Descriptor pool exhausted, created backing pool {} ({} sets)",
            index,
            self.info.max_sets
        );
        pools.push(Arc::clone(&grown));

        match device.allocate_descriptor_set(grown.handle(), layout.handle()) {
            Ok(set) => Some(PooledSet { set, pool: grown }),
            Err(e) => {
                log::warn!("Descriptor set allocation failed after growing the pool: {}", e);
                None
            }
        }
    }

    /// Handle of backing pool `index`
    pub fn descriptor_pool_handle(&self, index: usize) -> Option<vk::DescriptorPool> {
        self.pools.lock().get(index).map(|pool| pool.handle())
    }

    /// Number of backing pools created so far
    pub fn backing_pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Whether sets can be returned individually
    pub fn frees_sets(&self) -> bool {
        self.info
            .flags
            .contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
    }

    /// Sizing policy
    pub const fn info(&self) -> &DescriptorPoolCreateInfo {
        &self.info
    }

    pub(crate) const fn context(&self) -> &Arc<GraphicsContext> {
        &self.context
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        for pool in self.pools.get_mut().drain(..) {
            self.context.trash(Garbage::DescriptorPool(pool));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::config::CoreConfig;
    use crate::descriptors::DescriptorSetLayoutBuilder;

    fn context() -> (Arc<HeadlessDevice>, Arc<GraphicsContext>) {
        let device = Arc::new(HeadlessDevice::new());
        let context = GraphicsContext::new(device.clone(), CoreConfig::default()).unwrap();
        (device, context)
    }

    fn uniform_pool(context: &Arc<GraphicsContext>, max_sets: u32) -> Arc<DescriptorPool> {
        let info = DescriptorPoolCreateInfo::new(
            max_sets,
            vec![vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_sets,
            }],
        );
        DescriptorPool::new(context, info).unwrap()
    }

    #[test]
    fn test_create_info_validity() {
        let config = CoreConfig::default();
        let info = DescriptorPoolCreateInfo::from_config(&config.descriptors);
        assert!(info.is_valid());
        assert_eq!(info.max_sets, config.descriptors.max_sets_per_pool);
        assert!(!DescriptorPoolCreateInfo::new(0, info.pool_sizes.clone()).is_valid());
        assert!(!DescriptorPoolCreateInfo::new(4, Vec::new()).is_valid());
    }

    #[test]
    fn test_pool_grows_when_exhausted() {
        let (_device, context) = context();
        let pool = uniform_pool(&context, 2);
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(&context)
            .unwrap();

        let sets: Vec<_> = (0..5).map(|_| pool.allocate(&layout).unwrap()).collect();
        let indices: Vec<_> = sets.iter().map(PooledSet::pool_index).collect();
        assert_eq!(indices, vec![0, 0, 1, 1, 2]);
        assert_eq!(pool.backing_pool_count(), 3);
        assert_ne!(pool.descriptor_pool_handle(0), pool.descriptor_pool_handle(1));
        assert!(pool.descriptor_pool_handle(3).is_none());
    }

    #[test]
    fn test_layout_larger_than_pool_fails() {
        let (_device, context) = context();
        let pool = uniform_pool(&context, 2);
        let layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, 1, vk::ShaderStageFlags::FRAGMENT)
            .build(&context)
            .unwrap();

        assert!(pool.allocate(&layout).is_none());
        assert_eq!(pool.backing_pool_count(), 2);
    }

    #[test]
    fn test_backing_pools_outlive_their_sets() {
        let (device, context) = context();
        let pool = uniform_pool(&context, 1);
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(&context)
            .unwrap();
        let set = pool.allocate(&layout).unwrap();
        let handle = pool.descriptor_pool_handle(0).unwrap();
        drop(pool);

        for _ in 0..5 {
            context.update_delete_queue();
        }
        assert!(device.is_alive(handle));

        drop(set);
        context.update_delete_queue();
        assert!(!device.is_alive(handle));
    }
}
