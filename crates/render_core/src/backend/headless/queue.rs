//! Simulated queue of the headless device
//!
//! Submissions are executed strictly in submission order, and only when the host
//! observes them (fence wait, queue or device idle). Until then their fences stay
//! unsignaled, which models a GPU that is always one step behind the CPU.

use ash::vk::{self, Handle};
use slotmap::DefaultKey;

use super::objects::{
    key_of, raw_of, Command, CommandBufferState, ImageBarrierRecord, ImageObject, Object, State,
};
use super::HeadlessEvent;

const fn is_transfer_src(layout: vk::ImageLayout) -> bool {
    matches!(
        layout,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::GENERAL
    )
}

const fn is_transfer_dst(layout: vk::ImageLayout) -> bool {
    matches!(
        layout,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL | vk::ImageLayout::GENERAL
    )
}

fn resolve_count(count: u32, base: u32, total: u32) -> u32 {
    if count == vk::REMAINING_MIP_LEVELS {
        total.saturating_sub(base)
    } else {
        count
    }
}

impl State {
    /// Execute the oldest pending submission; returns false when the queue is empty
    pub fn complete_next(&mut self) -> bool {
        let Some(submission) = self.pending.pop_front() else {
            return false;
        };
        for cmd in &submission.command_buffers {
            self.execute_command_buffer(*cmd);
        }
        for semaphore in &submission.signal_semaphores {
            self.set_semaphore(raw_of(*semaphore), true);
        }
        if let Some(fence) = submission.fence {
            self.set_fence(raw_of(fence), true);
        }
        self.events.push(HeadlessEvent::Complete {
            submission: submission.id,
        });
        true
    }

    /// Execute submissions in order until `fence` is signaled
    pub fn complete_until_fence(&mut self, fence: u64) -> bool {
        loop {
            match self.fence_signaled(fence) {
                Some(true) => return true,
                Some(false) => {
                    if !self.complete_next() {
                        return false;
                    }
                }
                None => return false,
            }
        }
    }

    /// Execute every pending submission
    pub fn complete_all(&mut self) {
        while self.complete_next() {}
    }

    fn execute_command_buffer(&mut self, cmd: DefaultKey) {
        let commands = match self.objects.get_mut(cmd) {
            Some(Object::CommandBuffer(buffer)) => std::mem::take(&mut buffer.commands),
            _ => {
                self.violation("submitted command buffer was freed before execution");
                return;
            }
        };
        for command in &commands {
            self.execute(command);
        }
        if let Some(Object::CommandBuffer(buffer)) = self.objects.get_mut(cmd) {
            buffer.commands = commands;
            if buffer.state == CommandBufferState::Pending {
                buffer.state = CommandBufferState::Executable;
            }
        }
    }

    fn execute(&mut self, command: &Command) {
        match command {
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    self.apply_barrier(barrier);
                }
            }
            Command::CopyBuffer { src, dst, regions } => {
                let (Some(src), Some(dst)) =
                    (self.buffer_binding(src.as_raw()), self.buffer_binding(dst.as_raw()))
                else {
                    self.violation("buffer copy on unbound or destroyed buffer");
                    return;
                };
                for region in regions {
                    if region.src_offset + region.size > src.2 || region.dst_offset + region.size > dst.2
                    {
                        self.violation(format!("buffer copy region {region:?} out of bounds"));
                        continue;
                    }
                    if let Some(bytes) =
                        self.read_memory(src.0, src.1 + region.src_offset, region.size)
                    {
                        self.write_memory(dst.0, dst.1 + region.dst_offset, &bytes);
                    }
                }
            }
            Command::CopyBufferToImage {
                src,
                dst,
                layout,
                regions,
            } => {
                for region in regions {
                    self.copy_buffer_image(*src, *dst, *layout, region, true);
                }
            }
            Command::CopyImageToBuffer {
                src,
                layout,
                dst,
                regions,
            } => {
                for region in regions {
                    self.copy_buffer_image(*dst, *src, *layout, region, false);
                }
            }
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => {
                for region in regions {
                    self.copy_image(*src, *src_layout, *dst, *dst_layout, region);
                }
            }
            Command::Blit {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => {
                for region in regions {
                    self.blit_image(*src, *src_layout, *dst, *dst_layout, region);
                }
            }
        }
    }

    fn buffer_binding(&mut self, raw: u64) -> Option<(DefaultKey, u64, u64)> {
        let buffer = self.buffer(raw)?;
        let (memory, offset) = buffer.binding?;
        Some((memory, offset, buffer.size))
    }

    fn image_snapshot(&self, image: vk::Image) -> Option<ImageObject> {
        match self.objects.get(key_of(image.as_raw())) {
            Some(Object::Image(object)) if object.binding.is_some() => Some(object.clone()),
            _ => None,
        }
    }

    fn apply_barrier(&mut self, barrier: &ImageBarrierRecord) {
        let Some(image) = self.image(barrier.image.as_raw()) else {
            self.violation(format!("barrier on unknown image {:?}", barrier.image));
            return;
        };
        let range = barrier.range;
        let levels = resolve_count(range.level_count, range.base_mip_level, image.desc.mip_levels);
        let layers = resolve_count(
            range.layer_count,
            range.base_array_layer,
            image.desc.array_layers,
        );
        let mut mismatches = Vec::new();
        for mip in range.base_mip_level..range.base_mip_level + levels {
            for layer in range.base_array_layer..range.base_array_layer + layers {
                let index = image.layout_index(mip, layer);
                let Some(tracked) = image.layouts.get_mut(index) else {
                    mismatches.push(format!("subresource mip {mip} layer {layer} out of range"));
                    continue;
                };
                if barrier.old_layout != vk::ImageLayout::UNDEFINED && *tracked != barrier.old_layout
                {
                    mismatches.push(format!(
                        "barrier expects {:?} but mip {mip} layer {layer} is {:?}",
                        barrier.old_layout, *tracked
                    ));
                }
                *tracked = barrier.new_layout;
            }
        }
        for message in mismatches {
            self.violation(message);
        }
    }

    fn check_layouts(
        &mut self,
        image: &ImageObject,
        subresource: vk::ImageSubresourceLayers,
        layout: vk::ImageLayout,
        as_source: bool,
    ) {
        let allowed = if as_source {
            is_transfer_src(layout)
        } else {
            is_transfer_dst(layout)
        };
        if !allowed {
            self.violation(format!(
                "{layout:?} is not a valid transfer {} layout",
                if as_source { "source" } else { "destination" }
            ));
        }
        for layer in subresource.base_array_layer..subresource.base_array_layer + subresource.layer_count
        {
            let index = image.layout_index(subresource.mip_level, layer);
            let tracked = image.layouts.get(index).copied();
            if tracked != Some(layout) {
                self.violation(format!(
                    "image used as {layout:?} but mip {} layer {layer} is {tracked:?}",
                    subresource.mip_level
                ));
            }
        }
    }

    /// `to_image` copies buffer into image, otherwise image into buffer
    fn copy_buffer_image(
        &mut self,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        region: &vk::BufferImageCopy,
        to_image: bool,
    ) {
        let (Some(buffer), Some(image)) = (
            self.buffer_binding(buffer.as_raw()),
            self.image_snapshot(image),
        ) else {
            self.violation("buffer/image copy on unbound or destroyed resource");
            return;
        };
        self.check_layouts(&image, region.image_subresource, layout, !to_image);

        let Some((image_memory, image_base)) = image.binding else {
            return;
        };
        let texel = u64::from(super::objects::texel_size(image.desc.format));
        let extent = region.image_extent;
        let row_length = if region.buffer_row_length == 0 {
            extent.width
        } else {
            region.buffer_row_length
        };
        let image_height = if region.buffer_image_height == 0 {
            extent.height
        } else {
            region.buffer_image_height
        };
        let row_bytes = u64::from(extent.width) * texel;
        let subresource = region.image_subresource;

        for layer in 0..subresource.layer_count {
            for z in 0..extent.depth {
                for y in 0..extent.height {
                    let slice = u64::from(layer * extent.depth + z);
                    let buffer_offset = region.buffer_offset
                        + (slice * u64::from(image_height) + u64::from(y))
                            * u64::from(row_length)
                            * texel;
                    if buffer_offset + row_bytes > buffer.2 {
                        self.violation("buffer/image copy exceeds buffer size");
                        return;
                    }
                    let image_offset = image_base
                        + image.texel_offset(
                            subresource.mip_level,
                            subresource.base_array_layer + layer,
                            u32::try_from(region.image_offset.x).unwrap_or(0),
                            u32::try_from(region.image_offset.y).unwrap_or(0) + y,
                            u32::try_from(region.image_offset.z).unwrap_or(0) + z,
                        );
                    let (from, from_offset, to, to_offset) = if to_image {
                        (buffer.0, buffer.1 + buffer_offset, image_memory, image_offset)
                    } else {
                        (image_memory, image_offset, buffer.0, buffer.1 + buffer_offset)
                    };
                    if let Some(bytes) = self.read_memory(from, from_offset, row_bytes) {
                        self.write_memory(to, to_offset, &bytes);
                    }
                }
            }
        }
    }

    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::ImageCopy,
    ) {
        let (Some(src), Some(dst)) = (self.image_snapshot(src), self.image_snapshot(dst)) else {
            self.violation("image copy on unbound or destroyed image");
            return;
        };
        self.check_layouts(&src, region.src_subresource, src_layout, true);
        self.check_layouts(&dst, region.dst_subresource, dst_layout, false);
        if src.desc.format != dst.desc.format {
            self.violation("image copy between different formats");
            return;
        }
        let (Some((src_memory, src_base)), Some((dst_memory, dst_base))) =
            (src.binding, dst.binding)
        else {
            return;
        };
        let texel = u64::from(super::objects::texel_size(src.desc.format));
        let row_bytes = u64::from(region.extent.width) * texel;
        let src_origin = offset_to_u32(region.src_offset);
        let dst_origin = offset_to_u32(region.dst_offset);
        for layer in 0..region.src_subresource.layer_count {
            for z in 0..region.extent.depth {
                for y in 0..region.extent.height {
                    let from = src_base
                        + src.texel_offset(
                            region.src_subresource.mip_level,
                            region.src_subresource.base_array_layer + layer,
                            src_origin.0,
                            src_origin.1 + y,
                            src_origin.2 + z,
                        );
                    let to = dst_base
                        + dst.texel_offset(
                            region.dst_subresource.mip_level,
                            region.dst_subresource.base_array_layer + layer,
                            dst_origin.0,
                            dst_origin.1 + y,
                            dst_origin.2 + z,
                        );
                    if let Some(bytes) = self.read_memory(src_memory, from, row_bytes) {
                        self.write_memory(dst_memory, to, &bytes);
                    }
                }
            }
        }
    }

    /// Nearest-neighbour blit, enough to verify mip chains texel-exactly
    fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::ImageBlit,
    ) {
        let (Some(src), Some(dst)) = (self.image_snapshot(src), self.image_snapshot(dst)) else {
            self.violation("blit on unbound or destroyed image");
            return;
        };
        self.check_layouts(&src, region.src_subresource, src_layout, true);
        self.check_layouts(&dst, region.dst_subresource, dst_layout, false);
        let texel = super::objects::texel_size(src.desc.format);
        if texel != super::objects::texel_size(dst.desc.format) {
            self.violation("blit between formats of different texel size");
            return;
        }
        let (Some((src_memory, src_base)), Some((dst_memory, dst_base))) =
            (src.binding, dst.binding)
        else {
            return;
        };
        let [s0, s1] = region.src_offsets.map(offset_to_u32);
        let [d0, d1] = region.dst_offsets.map(offset_to_u32);
        let (src_w, src_h) = (s1.0.saturating_sub(s0.0), s1.1.saturating_sub(s0.1));
        let (dst_w, dst_h) = (d1.0.saturating_sub(d0.0), d1.1.saturating_sub(d0.1));
        if dst_w == 0 || dst_h == 0 {
            return;
        }
        for layer in 0..region.src_subresource.layer_count {
            for y in 0..dst_h {
                for x in 0..dst_w {
                    let sx = s0.0 + x * src_w / dst_w;
                    let sy = s0.1 + y * src_h / dst_h;
                    let from = src_base
                        + src.texel_offset(
                            region.src_subresource.mip_level,
                            region.src_subresource.base_array_layer + layer,
                            sx,
                            sy,
                            0,
                        );
                    let to = dst_base
                        + dst.texel_offset(
                            region.dst_subresource.mip_level,
                            region.dst_subresource.base_array_layer + layer,
                            d0.0 + x,
                            d0.1 + y,
                            0,
                        );
                    if let Some(bytes) = self.read_memory(src_memory, from, u64::from(texel)) {
                        self.write_memory(dst_memory, to, &bytes);
                    }
                }
            }
        }
    }
}

fn offset_to_u32(offset: vk::Offset3D) -> (u32, u32, u32) {
    (
        u32::try_from(offset.x).unwrap_or(0),
        u32::try_from(offset.y).unwrap_or(0),
        u32::try_from(offset.z).unwrap_or(0),
    )
}
