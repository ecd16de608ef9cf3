//! # Deferred Destruction
//!
//! No GPU object owned by this crate is destroyed while it goes out of scope. Owners
//! hand their native handles and memory to the [`DeleteQueue`] instead, and the
//! queue frees them only after enough frame boundaries have passed that no command
//! buffer recorded against them can still be executing:
//!
//! ```text
//! live ──drop──► queued (counter = N) ──update──► N-1 ... 0 ──update──► freed
//! ```
//!
//! [`DeleteQueue::update`] must run exactly once per application frame. Skipping it
//! leaks every queued object; calling it twice in one frame halves the grace period.

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::backend::GpuDevice;
use crate::descriptors::BackingPool;
use crate::memory::{Allocation, MemoryPool};

/// Construction parameters of a [`DeleteQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteQueueCreateInfo {
    /// Frames the renderer keeps in flight; the grace period in frame boundaries
    pub frames_in_flight: u32,
}

impl DeleteQueueCreateInfo {
    /// Whether the grace period is usable
    pub const fn is_valid(&self) -> bool {
        self.frames_in_flight >= 1
    }
}

/// Native objects handed over by a dropped owner
#[derive(Debug)]
pub enum Garbage {
    /// A buffer and its memory
    Buffer {
        /// Buffer handle
        buffer: vk::Buffer,
        /// Backing memory
        allocation: Allocation,
    },
    /// An image, its views and sampler, and its memory
    Image {
        /// Image handle
        image: vk::Image,
        /// Per-layer and whole-image views
        views: Vec<vk::ImageView>,
        /// Sampler created with the image
        sampler: Option<vk::Sampler>,
        /// Backing memory
        allocation: Allocation,
    },
    /// A pipeline of any kind
    Pipeline(vk::Pipeline),
    /// A pipeline layout
    PipelineLayout(vk::PipelineLayout),
    /// A descriptor set layout
    DescriptorSetLayout(vk::DescriptorSetLayout),
    /// A descriptor set returned to the backing pool it was allocated from
    DescriptorSet {
        /// Backing pool that owns the set
        pool: Arc<BackingPool>,
        /// Set handle
        set: vk::DescriptorSet,
    },
    /// A backing descriptor pool
    DescriptorPool(Arc<BackingPool>),
}

impl Garbage {
    /// Index of the typed queue; sets are released before their pools
    const fn queue_index(&self) -> usize {
        match self {
            Self::DescriptorSet { .. } => 0,
            Self::Pipeline(_) => 1,
            Self::PipelineLayout(_) => 2,
            Self::DescriptorSetLayout(_) => 3,
            Self::Buffer { .. } => 4,
            Self::Image { .. } => 5,
            Self::DescriptorPool(_) => 6,
        }
    }
}

const QUEUE_COUNT: usize = 7;

#[derive(Debug)]
struct Entry {
    garbage: Garbage,
    frames_left: u32,
}

/// Process-wide deferred destruction queue
pub struct DeleteQueue {
    frames_in_flight: u32,
    queues: Mutex<[Vec<Entry>; QUEUE_COUNT]>,
}

impl DeleteQueue {
    /// Create an empty queue
    ///
    /// # Panics
    /// Panics if `info` has a zero grace period.
    pub fn new(info: &DeleteQueueCreateInfo) -> Self {
        assert!(info.is_valid(), "invalid delete queue create info: {info:?}");
        Self {
            frames_in_flight: info.frames_in_flight,
            queues: Mutex::new(Default::default()),
        }
    }

    /// Grace period in frame boundaries
    pub const fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Take ownership of objects whose owner was dropped
    pub fn trash(&self, garbage: Garbage) {
        log::trace!("Queued for deletion: {garbage:?}");
        let index = garbage.queue_index();
        self.queues.lock()[index].push(Entry {
            garbage,
            frames_left: self.frames_in_flight,
        });
    }

    /// Objects still waiting to be freed
    pub fn len(&self) -> usize {
        self.queues.lock().iter().map(Vec::len).sum()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance one frame boundary
    ///
    /// Entries whose counter already reached zero are destroyed, every other entry
    /// counts down by one. An object queued before update `k` is therefore freed by
    /// update `k + N`. Destruction runs after the queue lock is released, so objects
    /// may be queued while others are being freed.
    pub fn update(&self, device: &dyn GpuDevice, memory: &MemoryPool) {
        let due = {
            let mut queues = self.queues.lock();
            let mut due = Vec::new();
            for queue in queues.iter_mut() {
                let (ready, waiting): (Vec<Entry>, Vec<Entry>) = std::mem::take(queue)
                    .into_iter()
                    .partition(|entry| entry.frames_left == 0);
                *queue = waiting;
                for entry in queue.iter_mut() {
                    entry.frames_left -= 1;
                }
                due.extend(ready.into_iter().map(|entry| entry.garbage));
            }
            due
        };

        for garbage in due {
            if let Some(requeued) = Self::destroy(device, memory, garbage, false) {
                self.queues.lock()[requeued.queue_index()].push(Entry {
                    garbage: requeued,
                    frames_left: 0,
                });
            }
        }
    }

    /// Free everything, used at shutdown once the device is idle
    ///
    /// Runs `N + 1` updates so every entry expires, then releases whatever is left
    /// (descriptor pools whose sets are still referenced elsewhere).
    pub fn flush(&self, device: &dyn GpuDevice, memory: &MemoryPool) {
        let queued = self.len();
        for _ in 0..=self.frames_in_flight {
            self.update(device, memory);
        }

        let leftover: Vec<Garbage> = {
            let mut queues = self.queues.lock();
            queues
                .iter_mut()
                .flat_map(std::mem::take)
                .map(|entry| entry.garbage)
                .collect()
        };
        if !leftover.is_empty() {
            log::warn!(
                "Force-releasing {} objects still referenced at delete queue flush",
                leftover.len()
            );
        }
        for garbage in leftover {
            let _ = Self::destroy(device, memory, garbage, true);
        }
        log::debug!("Delete queue flushed ({} objects)", queued);
    }

    /// Destroy one entry; hands it back when a pool is still referenced
    fn destroy(
        device: &dyn GpuDevice,
        memory: &MemoryPool,
        garbage: Garbage,
        force: bool,
    ) -> Option<Garbage> {
        match garbage {
            Garbage::Buffer { buffer, allocation } => {
                device.destroy_buffer(buffer);
                memory.free(device, allocation);
            }
            Garbage::Image {
                image,
                views,
                sampler,
                allocation,
            } => {
                for view in views {
                    device.destroy_image_view(view);
                }
                if let Some(sampler) = sampler {
                    device.destroy_sampler(sampler);
                }
                device.destroy_image(image);
                memory.free(device, allocation);
            }
            Garbage::Pipeline(pipeline) => device.destroy_pipeline(pipeline),
            Garbage::PipelineLayout(layout) => device.destroy_pipeline_layout(layout),
            Garbage::DescriptorSetLayout(layout) => device.destroy_descriptor_set_layout(layout),
            Garbage::DescriptorSet { pool, set } => {
                if let Err(e) = device.free_descriptor_sets(pool.handle(), &[set]) {
                    log::error!("Failed to free descriptor set {:?}: {}", set, e);
                }
            }
            Garbage::DescriptorPool(pool) => {
                if Arc::strong_count(&pool) > 1 && !force {
                    return Some(Garbage::DescriptorPool(pool));
                }
                log::debug!("Destroying descriptor backing pool {}", pool.index());
                device.destroy_descriptor_pool(pool.handle());
            }
        }
        None
    }
}

impl Drop for DeleteQueue {
    fn drop(&mut self) {
        let remaining = self.queues.get_mut().iter().map(Vec::len).sum::<usize>();
        if remaining > 0 {
            log::error!("Delete queue dropped with {} objects never freed", remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessDevice, HeadlessEvent};
    use crate::config::MemoryConfig;
    use crate::memory::AllocationRequest;

    fn make_buffer(device: &HeadlessDevice, memory: &MemoryPool) -> Garbage {
        let buffer = device
            .create_buffer(256, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();
        let requirements = device.buffer_memory_requirements(buffer);
        let allocation = memory
            .allocate(
                device,
                &AllocationRequest::buffer(
                    buffer,
                    requirements,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                ),
            )
            .unwrap();
        device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            .unwrap();
        Garbage::Buffer { buffer, allocation }
    }

    fn setup() -> (HeadlessDevice, MemoryPool) {
        let device = HeadlessDevice::new();
        let memory = MemoryPool::new(
            MemoryConfig::default().with_arena_block_size(1 << 16),
            device.memory_properties(),
        );
        (device, memory)
    }

    #[test]
    fn test_create_info_validity() {
        assert!(DeleteQueueCreateInfo { frames_in_flight: 1 }.is_valid());
        assert!(!DeleteQueueCreateInfo { frames_in_flight: 0 }.is_valid());
    }

    #[test]
    #[should_panic(expected = "invalid delete queue create info")]
    fn test_zero_grace_period_panics() {
        let _ = DeleteQueue::new(&DeleteQueueCreateInfo { frames_in_flight: 0 });
    }

    #[test]
    fn test_object_survives_grace_period() {
        let (device, memory) = setup();
        for frames in 1..=3 {
            let queue = DeleteQueue::new(&DeleteQueueCreateInfo {
                frames_in_flight: frames,
            });
            let garbage = make_buffer(&device, &memory);
            let Garbage::Buffer { buffer, .. } = &garbage else {
                unreachable!()
            };
            let buffer = *buffer;
            queue.trash(garbage);

            for _ in 0..frames {
                queue.update(&device, &memory);
                assert!(device.is_alive(buffer), "freed early with N = {frames}");
            }
            queue.update(&device, &memory);
            assert!(!device.is_alive(buffer));
            assert!(queue.is_empty());
        }
        assert_eq!(memory.stats().bytes_in_use, 0);
    }

    #[test]
    fn test_entries_expire_independently() {
        let (device, memory) = setup();
        let queue = DeleteQueue::new(&DeleteQueueCreateInfo { frames_in_flight: 2 });

        queue.trash(make_buffer(&device, &memory));
        queue.update(&device, &memory);
        queue.trash(make_buffer(&device, &memory));
        assert_eq!(queue.len(), 2);

        queue.update(&device, &memory);
        queue.update(&device, &memory);
        assert_eq!(queue.len(), 1);
        queue.update(&device, &memory);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pool_waits_for_its_sets() {
        let (device, memory) = setup();
        let queue = DeleteQueue::new(&DeleteQueueCreateInfo { frames_in_flight: 1 });
        let handle = device
            .create_descriptor_pool(
                4,
                &[vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 4,
                }],
                vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            )
            .unwrap();
        let pool = Arc::new(BackingPool::new(handle, 0));
        let held = Arc::clone(&pool);

        queue.trash(Garbage::DescriptorPool(pool));
        queue.update(&device, &memory);
        queue.update(&device, &memory);
        assert!(device.is_alive(handle));

        drop(held);
        queue.update(&device, &memory);
        assert!(!device.is_alive(handle));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_frees_everything() {
        let (device, memory) = setup();
        let queue = DeleteQueue::new(&DeleteQueueCreateInfo { frames_in_flight: 3 });
        for _ in 0..4 {
            queue.trash(make_buffer(&device, &memory));
        }
        let layout = device
            .create_descriptor_set_layout(&[], vk::DescriptorSetLayoutCreateFlags::empty())
            .unwrap();
        queue.trash(Garbage::DescriptorSetLayout(layout));

        device.clear_events();
        queue.flush(&device, &memory);
        assert!(queue.is_empty());
        assert_eq!(device.live_count(vk::ObjectType::BUFFER), 0);
        let destroyed = device
            .events()
            .iter()
            .filter(|event| matches!(event, HeadlessEvent::Destroy { .. }))
            .count();
        assert_eq!(destroyed, 5);
    }
}
