//! Image layout barriers
//!
//! Every layout has the access types and pipeline stages that use an image in that
//! layout. A transition must make the writes of the old layout available (source
//! masks) and visible to every access of the new layout (destination masks).
//! [`BarrierMasks::for_transition`] derives conservative masks from that table and
//! [`BarrierMasks::validate`] checks hand-written ones against it.

use ash::vk;

use crate::backend::GpuDevice;

const WRITE_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::SHADER_WRITE.as_raw()
        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags::HOST_WRITE.as_raw()
        | vk::AccessFlags::MEMORY_WRITE.as_raw(),
);

/// Access types and stages that touch an image while it is in `layout`
pub fn layout_usage(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        vk::ImageLayout::PREINITIALIZED => (vk::AccessFlags::HOST_WRITE, vk::PipelineStageFlags::HOST),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::TRANSFER_READ
                | vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        }
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Whether images in this layout can be the source of a transfer
pub fn is_transfer_src(layout: vk::ImageLayout) -> bool {
    matches!(layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::GENERAL)
}

/// Whether images in this layout can be the destination of a transfer
pub fn is_transfer_dst(layout: vk::ImageLayout) -> bool {
    matches!(layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL | vk::ImageLayout::GENERAL)
}

/// Aspect mask implied by a format
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Access and stage masks of one image barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierMasks {
    /// Accesses made available before the transition
    pub src_access: vk::AccessFlags,
    /// Accesses the transition is made visible to
    pub dst_access: vk::AccessFlags,
    /// Stages that must complete before the transition
    pub src_stage: vk::PipelineStageFlags,
    /// Stages that wait for the transition
    pub dst_stage: vk::PipelineStageFlags,
}

impl BarrierMasks {
    /// Conservative masks for a transition between two layouts
    pub fn for_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Self {
        let (old_access, old_stage) = layout_usage(old);
        let (new_access, new_stage) = layout_usage(new);
        Self {
            src_access: old_access & WRITE_ACCESS,
            dst_access: new_access,
            src_stage: old_stage,
            dst_stage: new_stage,
        }
    }

    /// Check that the masks bracket the last use in `old` and the next use in `new`
    pub fn validate(&self, old: vk::ImageLayout, new: vk::ImageLayout) -> Result<(), String> {
        let (old_access, old_stage) = layout_usage(old);
        let (new_access, new_stage) = layout_usage(new);
        let covers_stage = |stages: vk::PipelineStageFlags, needed: vk::PipelineStageFlags| {
            stages.contains(vk::PipelineStageFlags::ALL_COMMANDS) || stages.intersects(needed)
        };

        let old_writes = old_access & WRITE_ACCESS;
        if !self.src_access.contains(old_writes) {
            return Err(format!(
                "source access {:?} does not cover writes {:?} of {:?}",
                self.src_access, old_writes, old
            ));
        }
        if old != vk::ImageLayout::UNDEFINED && !covers_stage(self.src_stage, old_stage) {
            return Err(format!(
                "source stage {:?} does not wait for {:?} users {:?}",
                self.src_stage, old, old_stage
            ));
        }
        if !self.dst_access.contains(new_access) {
            return Err(format!(
                "destination access {:?} does not cover {:?} of {:?}",
                self.dst_access, new_access, new
            ));
        }
        if !new_access.is_empty() && !covers_stage(self.dst_stage, new_stage) {
            return Err(format!(
                "destination stage {:?} does not block {:?} users {:?}",
                self.dst_stage, new, new_stage
            ));
        }
        Ok(())
    }
}

/// Record one image layout transition
pub fn record_image_barrier(
    device: &dyn GpuDevice,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    masks: BarrierMasks,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .build();
    device.cmd_pipeline_barrier(cmd, masks.src_stage, masks.dst_stage, &[], &[barrier]);
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUTS: [vk::ImageLayout; 9] = [
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
    ];

    #[test]
    fn test_upload_transition_masks() {
        let masks = BarrierMasks::for_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(masks.src_access, vk::AccessFlags::empty());
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let masks = BarrierMasks::for_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(masks.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_derived_masks_always_validate() {
        for old in LAYOUTS {
            for new in LAYOUTS.iter().copied().filter(|l| *l != vk::ImageLayout::UNDEFINED) {
                let masks = BarrierMasks::for_transition(old, new);
                assert!(masks.validate(old, new).is_ok(), "{old:?} -> {new:?}");
            }
        }
    }

    #[test]
    fn test_missing_write_dependency_rejected() {
        // Write-after-write without making the attachment writes available
        let masks = BarrierMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        };
        let result = masks.validate(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert!(result.unwrap_err().contains("source access"));
    }

    #[test]
    fn test_wrong_destination_stage_rejected() {
        let masks = BarrierMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::VERTEX_INPUT,
        };
        let result = masks.validate(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert!(result.unwrap_err().contains("destination stage"));
    }

    #[test]
    fn test_aspect_for_format() {
        assert_eq!(aspect_for_format(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(aspect_for_format(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
