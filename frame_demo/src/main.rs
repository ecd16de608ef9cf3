//! Frame loop demo
//!
//! Runs the render core against the headless device for a fixed number of frames.
//! Every frame rewrites a per-frame uniform slot, repoints a descriptor set at it,
//! allocates and drops a transient buffer, and records a layout transition, so the
//! deferred-destruction and swapchain protocols run the way a real renderer drives
//! them. Halfway through, the simulated window is resized.
//!
//! Usage: `frame_demo [config.toml|config.ron] [frames]`

use render_core::backend::HeadlessDevice;
use render_core::config::{Config, ConfigError, CoreConfig};
use render_core::descriptors::{DescriptorPool, DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutBuilder};
use render_core::foundation::logging;
use render_core::resources::{Buffer, BufferCreateInfo, Image, ImageCreateInfo};
use render_core::swapchain::{FrameRenderer, SwapchainCreateInfo};
use render_core::{vk, GraphicsContext, VulkanError};
use std::sync::Arc;

const DEFAULT_FRAMES: u32 = 120;

const INITIAL_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 800,
    height: 600,
};

const RESIZED_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 1280,
    height: 720,
};

#[derive(thiserror::Error, Debug)]
enum DemoError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid frame count: {0}")]
    InvalidFrameCount(String),

    #[error(transparent)]
    Vulkan(#[from] VulkanError),

    #[error("descriptor set for frame slot {0} could not be allocated")]
    DescriptorAllocation(usize),
}

/// Per-frame uniform block
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameUniforms {
    frame: u32,
    slot: u32,
    extent: [u32; 2],
}

struct FrameDemo {
    device: Arc<HeadlessDevice>,
    context: Arc<GraphicsContext>,
    renderer: FrameRenderer,
    uniforms: Buffer,
    texture: Image,
    frame_sets: Vec<DescriptorSet>,
    window_extent: vk::Extent2D,
    frames_rendered: u32,
    recreations: u32,
}

impl FrameDemo {
    fn new(config: CoreConfig) -> Result<Self, DemoError> {
        config.validate().map_err(DemoError::InvalidConfig)?;

        log::info!("Creating headless device...");
        let device = Arc::new(HeadlessDevice::new());
        let context = GraphicsContext::new(device.clone(), config)?;
        let frames = context.frames_in_flight();
        log::info!("Graphics context ready with {} frames in flight", frames);

        let swapchain_info = SwapchainCreateInfo::from_config(&context.config().swapchain, INITIAL_EXTENT);
        let renderer = FrameRenderer::new(&context, &swapchain_info)?;

        let uniform_info = BufferCreateInfo::new(
            std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
            frames,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .with_min_offset_alignment(context.limits().min_uniform_buffer_offset_alignment)
        .with_name("Frame uniforms");
        let uniforms = Buffer::new(&context, &uniform_info)?;

        let texture_info = ImageCreateInfo::new(
            vk::Extent2D {
                width: 64,
                height: 64,
            },
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )
        .with_mipmaps()
        .with_name("Checkerboard");
        let mut texture = Image::new(&context, &texture_info)?;
        texture.upload(&checkerboard(64), None)?;

        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .add_combined_image_sampler(1, 1, vk::ShaderStageFlags::FRAGMENT)
            .build(&context)?;
        let pool = DescriptorPool::from_config(&context, vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)?;
        let frame_sets = (0..frames)
            .map(|slot| build_frame_set(&pool, &layout, &uniforms, &texture, slot))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            device,
            context,
            renderer,
            uniforms,
            texture,
            frame_sets,
            window_extent: INITIAL_EXTENT,
            frames_rendered: 0,
            recreations: 0,
        })
    }

    fn run(&mut self, frame_count: u32) -> Result<(), DemoError> {
        log::info!("Rendering {} frames", frame_count);
        while self.frames_rendered < frame_count {
            if self.frames_rendered == frame_count / 2 && self.window_extent != RESIZED_EXTENT {
                log::info!("Simulating a window resize to {:?}", RESIZED_EXTENT);
                self.window_extent = RESIZED_EXTENT;
                self.device.set_surface_extent(RESIZED_EXTENT);
            }
            self.context.update_delete_queue();
            self.render_frame()?;
        }
        self.context.wait_idle()?;
        Ok(())
    }

    fn render_frame(&mut self) -> Result<(), DemoError> {
        let Some(cmd) = self.renderer.begin_frame()? else {
            self.recreate_swapchain()?;
            return Ok(());
        };
        let slot = self.renderer.current_frame_index();
        let extent = self.renderer.swapchain().extent();

        let uniforms = FrameUniforms {
            frame: self.frames_rendered,
            slot: u32::try_from(slot).unwrap_or(u32::MAX),
            extent: [extent.width, extent.height],
        };
        self.uniforms
            .write_to_index(bytemuck::bytes_of(&uniforms), uniforms.slot)?;
        self.frame_sets[slot].update_buffer(0, self.uniforms.descriptor_info_for_index(uniforms.slot));

        // Transient per-frame data; the drop at the end of this scope defers the free.
        let scratch_info = BufferCreateInfo::new(
            256,
            4,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .with_name("Scratch");
        let mut scratch = Buffer::new(&self.context, &scratch_info)?;
        scratch.write_to_buffer(&[0u8; 1024], vk::WHOLE_SIZE, 0, Some(cmd))?;

        self.texture
            .transition_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL, Some(cmd))?;
        self.texture
            .transition_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, Some(cmd))?;

        let outcome = self.renderer.end_frame()?;
        self.frames_rendered += 1;
        if outcome.needs_recreation() {
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<(), DemoError> {
        let extent = self.window_extent;
        self.renderer.recreate_swapchain(extent)?;
        self.recreations += 1;
        log::info!(
            "Swapchain recreated at {}x{} ({} recreation(s))",
            extent.width,
            extent.height,
            self.recreations
        );
        Ok(())
    }

    fn report(&self) {
        log::info!(
            "Rendered {} frames with {} swapchain recreation(s)",
            self.frames_rendered,
            self.recreations
        );
        log::info!(
            "Live objects: {} buffers, {} images, {} memory blocks, {} descriptor pools",
            self.device.live_count(vk::ObjectType::BUFFER),
            self.device.live_count(vk::ObjectType::IMAGE),
            self.device.live_count(vk::ObjectType::DEVICE_MEMORY),
            self.device.live_count(vk::ObjectType::DESCRIPTOR_POOL),
        );
        for error in self.device.validation_errors() {
            log::error!("Validation: {}", error);
        }
    }
}

fn build_frame_set(
    pool: &Arc<DescriptorPool>,
    layout: &Arc<DescriptorSetLayout>,
    uniforms: &Buffer,
    texture: &Image,
    slot: u32,
) -> Result<DescriptorSet, DemoError> {
    let mut set = DescriptorSet::with_layout(pool, layout);
    set.add_buffer(0, uniforms.descriptor_info_for_index(slot))
        .add_image(1, texture.descriptor_info(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
    if set.build() {
        Ok(set)
    } else {
        Err(DemoError::DescriptorAllocation(slot as usize))
    }
}

fn checkerboard(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if ((x / 8) + (y / 8)) % 2 == 0 {
                [230, 230, 230, 255]
            } else {
                [40, 40, 40, 255]
            }
        })
        .collect()
}

fn parse_args() -> Result<(CoreConfig, u32), DemoError> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            log::info!("Loading configuration from {}", path);
            CoreConfig::load_from_file(&path)?
        }
        None => CoreConfig::default(),
    };
    let frames = match args.next() {
        Some(count) => count
            .parse()
            .map_err(|_| DemoError::InvalidFrameCount(count))?,
        None => DEFAULT_FRAMES,
    };
    Ok((config, frames))
}

fn main() {
    logging::init_with_default("info");

    let result = parse_args().and_then(|(config, frames)| {
        let mut demo = FrameDemo::new(config)?;
        let outcome = demo.run(frames);
        demo.report();
        outcome
    });

    if let Err(e) = result {
        log::error!("Frame demo failed: {}", e);
        std::process::exit(1);
    }
    log::info!("Frame demo finished");
}
