//! Per-thread command pools
//!
//! Command pools are externally synchronized in Vulkan, so every thread that records
//! commands gets a pool of its own. Pools are created on first use and destroyed
//! with the graphics context.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::{self, ThreadId};

use crate::backend::GpuDevice;
use crate::error::VulkanResult;

#[derive(Default)]
struct PoolState {
    pools: HashMap<ThreadId, vk::CommandPool>,
    owners: HashMap<vk::CommandBuffer, vk::CommandPool>,
}

/// Command pools keyed by recording thread
pub struct CommandPools {
    queue_family_index: u32,
    state: Mutex<PoolState>,
}

impl CommandPools {
    /// Create the registry; no pool exists until a thread allocates
    pub fn new(queue_family_index: u32) -> Self {
        Self {
            queue_family_index,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Allocate primary command buffers from the calling thread's pool
    pub fn allocate(&self, device: &dyn GpuDevice, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        let thread = thread::current().id();
        let pool = match state.pools.get(&thread) {
            Some(pool) => *pool,
            None => {
                let pool = device.create_command_pool(self.queue_family_index)?;
                log::debug!("Created command pool for thread {:?}", thread);
                state.pools.insert(thread, pool);
                pool
            }
        };
        let buffers = device.allocate_command_buffers(pool, count)?;
        state.owners.extend(buffers.iter().map(|cmd| (*cmd, pool)));
        Ok(buffers)
    }

    /// Return command buffers to the pools they came from
    pub fn free(&self, device: &dyn GpuDevice, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in buffers {
            match state.owners.remove(cmd) {
                Some(pool) => device.free_command_buffers(pool, &[*cmd]),
                None => log::warn!("Freeing command buffer {:?} that no pool owns", cmd),
            }
        }
    }

    /// Number of threads that own a pool
    pub fn pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// Destroy every pool and the command buffers left in them
    pub fn destroy(&self, device: &dyn GpuDevice) {
        let mut state = self.state.lock();
        state.owners.clear();
        for (_, pool) in state.pools.drain() {
            device.destroy_command_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use std::sync::Arc;

    #[test]
    fn test_one_pool_per_thread() {
        let device = Arc::new(HeadlessDevice::new());
        let pools = Arc::new(CommandPools::new(0));

        let local = pools.allocate(device.as_ref(), 2).unwrap();
        assert_eq!(local.len(), 2);
        assert_eq!(pools.pool_count(), 1);

        let worker = {
            let device = Arc::clone(&device);
            let pools = Arc::clone(&pools);
            thread::spawn(move || pools.allocate(device.as_ref(), 1).unwrap())
        };
        let remote = worker.join().unwrap();
        assert_eq!(pools.pool_count(), 2);

        pools.free(device.as_ref(), &remote);
        pools.free(device.as_ref(), &local);
        assert_eq!(device.live_count(vk::ObjectType::COMMAND_BUFFER), 0);

        pools.destroy(device.as_ref());
        assert_eq!(device.live_count(vk::ObjectType::COMMAND_POOL), 0);
        assert!(device.validation_errors().is_empty());
    }
}
