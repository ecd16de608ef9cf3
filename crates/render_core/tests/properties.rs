//! Lifetime, allocation and frame-protocol properties checked end to end

mod common;

use common::{assert_clean, context_with_frames, pattern};
use render_core::backend::HeadlessEvent;
use render_core::descriptors::{DescriptorPool, DescriptorPoolCreateInfo, DescriptorSetLayoutBuilder};
use render_core::resources::{Buffer, BufferCreateInfo, Image, ImageCreateInfo};
use render_core::swapchain::{FrameRenderer, PresentOutcome, SwapchainCreateInfo};
use render_core::vk::{self, Handle};

const WINDOW: vk::Extent2D = vk::Extent2D {
    width: 800,
    height: 600,
};

#[test]
fn test_created_resources_report_requested_fields() {
    let (device, context) = context_with_frames(2);
    let cases = [
        (16, 1, vk::BufferUsageFlags::UNIFORM_BUFFER, 256),
        (12, 10, vk::BufferUsageFlags::VERTEX_BUFFER, 1),
        (100, 4, vk::BufferUsageFlags::STORAGE_BUFFER, 64),
    ];
    for (instance_size, count, usage, alignment) in cases {
        for properties in [
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ] {
            let info = BufferCreateInfo::new(instance_size, count, usage, properties)
                .with_min_offset_alignment(alignment);
            let buffer = Buffer::new(&context, &info).unwrap();
            let stride = instance_size.div_ceil(alignment) * alignment;
            assert_eq!(buffer.instance_size(), instance_size);
            assert_eq!(buffer.instance_count(), count);
            assert_eq!(buffer.alignment_size(), stride);
            assert_eq!(buffer.size(), stride * u64::from(count));
            assert_eq!(buffer.usage(), usage);
            assert_eq!(buffer.memory_properties(), properties);
        }
    }

    let extent = vk::Extent2D {
        width: 256,
        height: 128,
    };
    let usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
    let info = ImageCreateInfo::new(extent, vk::Format::R8G8B8A8_SRGB, usage).with_mipmaps();
    let image = Image::new(&context, &info).unwrap();
    assert_eq!(image.extent(), extent);
    assert_eq!(image.format(), vk::Format::R8G8B8A8_SRGB);
    assert_eq!(image.mip_levels(), 9);
    assert_eq!(image.layers(), 1);
    assert!(image.usage().contains(usage));
    assert_eq!(image.memory_properties(), vk::MemoryPropertyFlags::DEVICE_LOCAL);
    assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
    assert_clean(&device);
}

#[test]
fn test_trashed_objects_survive_the_grace_period() {
    for frames in 1..=4 {
        let (device, context) = context_with_frames(frames);
        // Advance to an arbitrary frame before queuing anything.
        for _ in 0..5 {
            context.update_delete_queue();
        }

        let info = BufferCreateInfo::new(
            64,
            1,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let buffer = Buffer::new(&context, &info).unwrap();
        let handle = buffer.handle();
        drop(buffer);

        for boundary in 1..=frames {
            context.update_delete_queue();
            assert!(device.is_alive(handle), "freed after {boundary} of {frames} boundaries");
        }
        context.update_delete_queue();
        assert!(!device.is_alive(handle), "still alive after {} boundaries", frames + 1);
        assert!(context.delete_queue().is_empty());
        assert_clean(&device);
    }
}

#[test]
fn test_pool_growth_is_never_capped() {
    let (device, context) = context_with_frames(2);
    let info = DescriptorPoolCreateInfo::new(
        3,
        vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 3,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 3,
            },
        ],
    );
    let pool = DescriptorPool::new(&context, info).unwrap();
    let layout = DescriptorSetLayoutBuilder::new()
        .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
        .add_combined_image_sampler(1, 1, vk::ShaderStageFlags::FRAGMENT)
        .build(&context)
        .unwrap();

    let requested = 20;
    let sets: Vec<_> = (0..requested).filter_map(|_| pool.allocate(&layout)).collect();
    assert_eq!(sets.len(), requested);
    assert_eq!(pool.backing_pool_count(), 7);

    let mut handles: Vec<_> = sets.iter().map(|set| set.handle().as_raw()).collect();
    handles.sort_unstable();
    handles.dedup();
    assert_eq!(handles.len(), requested);
    assert_clean(&device);
}

#[test]
fn test_layout_reports_most_recent_transition() {
    let (device, context) = context_with_frames(2);
    let usage = vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::COLOR_ATTACHMENT
        | vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST;
    let info = ImageCreateInfo::new(
        vk::Extent2D {
            width: 32,
            height: 32,
        },
        vk::Format::R8G8B8A8_UNORM,
        usage,
    );
    let mut image = Image::new(&context, &info).unwrap();

    let sequence = [
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    ];
    for layout in sequence {
        image.transition_layout(layout, None).unwrap();
        assert_eq!(image.layout(), layout);
        assert_eq!(device.image_layout(image.handle(), 0, 0), Some(layout));
    }

    // Recorded into a caller command buffer, the tracked layout changes at once.
    let cmd = context.begin_single_time_commands().unwrap();
    image.transition_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL, Some(cmd)).unwrap();
    image.transition_layout(vk::ImageLayout::GENERAL, Some(cmd)).unwrap();
    assert_eq!(image.layout(), vk::ImageLayout::GENERAL);
    context.end_single_time_commands(cmd).unwrap();
    assert_eq!(device.image_layout(image.handle(), 0, 0), Some(vk::ImageLayout::GENERAL));
    assert_clean(&device);
}

fn read_back(context: &std::sync::Arc<render_core::GraphicsContext>, src: &Buffer) -> Vec<u8> {
    let info = BufferCreateInfo::new(
        src.size(),
        1,
        vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    );
    let mut readback = Buffer::new(context, &info).unwrap();
    readback.copy_from(src, src.size(), None).unwrap();
    readback.map().unwrap();
    readback.mapped_slice().unwrap().to_vec()
}

#[test]
fn test_device_local_writes_match_host_visible_writes() {
    let (device, context) = context_with_frames(2);
    let usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC;
    let make = |properties| {
        let info = BufferCreateInfo::new(48, 5, usage, properties).with_min_offset_alignment(64);
        Buffer::new(&context, &info).unwrap()
    };
    let mut device_local = make(vk::MemoryPropertyFlags::DEVICE_LOCAL);
    let mut host_visible =
        make(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT);

    let whole = pattern(usize::try_from(device_local.size()).unwrap());
    let element = pattern(48).into_iter().rev().collect::<Vec<_>>();
    for buffer in [&mut device_local, &mut host_visible] {
        buffer.write(&whole).unwrap();
        buffer.write_to_index(&element, 3).unwrap();
        buffer.write_to_buffer(&[0xAB; 10], 10, 5, None).unwrap();
    }

    let expected = read_back(&context, &host_visible);
    assert_eq!(read_back(&context, &device_local), expected);
    assert_eq!(&expected[5..15], &[0xAB; 10]);
    assert_eq!(&expected[192..240], element.as_slice());
    assert_clean(&device);
}

#[test]
fn test_frame_index_cycles_and_images_are_never_reused_early() {
    let frames = 3;
    let (device, context) = context_with_frames(frames);
    let mut renderer = FrameRenderer::new(&context, &SwapchainCreateInfo::new(WINDOW)).unwrap();
    // Hand out the same image twice in a row to force the per-image wait.
    device.script_acquire_indices([0, 1, 1, 2, 0, 0, 2, 1, 1]);
    device.clear_events();

    let mut indices = Vec::new();
    for _ in 0..9 {
        context.update_delete_queue();
        indices.push(renderer.current_frame_index());
        renderer.begin_frame().unwrap().unwrap();
        assert_eq!(renderer.end_frame().unwrap(), PresentOutcome::Presented);
    }
    assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);

    // Before a submission starts, the previous submission that rendered into the
    // same image must have completed.
    let events = device.events();
    let mut last_image_submission = std::collections::HashMap::new();
    let mut completed = std::collections::HashSet::new();
    let mut acquired = None;
    for event in &events {
        match event {
            HeadlessEvent::Acquire { image_index } => acquired = Some(*image_index),
            HeadlessEvent::Complete { submission } => {
                completed.insert(*submission);
            }
            HeadlessEvent::Submit { submission, .. } => {
                let image = acquired.take().expect("submit follows an acquire");
                if let Some(previous) = last_image_submission.insert(image, *submission) {
                    assert!(
                        completed.contains(&previous),
                        "submission {submission} reuses image {image} before {previous} completed"
                    );
                }
            }
            _ => {}
        }
    }
    assert_eq!(last_image_submission.len(), 3);
    assert_clean(&device);
}
