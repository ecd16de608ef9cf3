//! # Pipelines
//!
//! A [`Pipeline`] is created from exactly one [`PipelineKind`]; the kind decides the
//! bind point and which device entry point builds it:
//!
//! ```text
//! PipelineKind::Graphics(desc)   ──► vkCreateGraphicsPipelines     ──► GRAPHICS
//! PipelineKind::Compute(desc)    ──► vkCreateComputePipelines      ──► COMPUTE
//! PipelineKind::RayTracing(desc) ──► vkCreateRayTracingPipelinesKHR ──► RAY_TRACING_KHR
//! ```
//!
//! Pipelines and pipeline layouts are referenced by recorded command buffers, so
//! both are destroyed through the delete queue.

use ash::vk;
use std::sync::Arc;

mod shader;
mod shader_cache;

pub use shader::{spirv_words, ShaderModule};
pub use shader_cache::{ShaderCache, ShaderCacheError};

use crate::backend::{
    ComputePipelineDesc, GraphicsPipelineDesc, RayTracingGroup, RayTracingPipelineDesc,
    ShaderStageDesc,
};
use crate::context::GraphicsContext;
use crate::delete_queue::Garbage;
use crate::descriptors::DescriptorSetLayout;
use crate::error::VulkanResult;

/// Pipeline layout: descriptor set layouts plus push constant ranges
pub struct PipelineLayout {
    context: Arc<GraphicsContext>,
    layout: vk::PipelineLayout,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl PipelineLayout {
    /// Create a layout; set `i` of the shaders uses `set_layouts[i]`
    pub fn new(
        context: &Arc<GraphicsContext>,
        set_layouts: &[Arc<DescriptorSetLayout>],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<Self> {
        let handles: Vec<_> = set_layouts.iter().map(|layout| layout.handle()).collect();
        let layout = context
            .device()
            .create_pipeline_layout(&handles, push_constant_ranges)?;
        Ok(Self {
            context: Arc::clone(context),
            layout,
            set_layouts: set_layouts.to_vec(),
            push_constant_ranges: push_constant_ranges.to_vec(),
        })
    }

    /// Get pipeline layout handle
    pub const fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Descriptor set layouts, indexed by set number
    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    /// Push constant ranges
    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.context.trash(Garbage::PipelineLayout(self.layout));
    }
}

impl GraphicsPipelineDesc {
    /// Triangle-list pipeline with back-face culling, depth testing and dynamic
    /// viewport and scissor
    pub fn new(stages: Vec<ShaderStageDesc>, layout: vk::PipelineLayout, render_pass: vk::RenderPass) -> Self {
        Self {
            stages,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
            blend_enable: false,
            color_attachment_count: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            layout,
            render_pass,
            subpass: 0,
        }
    }

    /// Set the vertex input layout
    pub fn with_vertex_input(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
        self
    }

    /// Set depth test, depth write and compare op
    pub fn with_depth(mut self, test: bool, write: bool, compare_op: vk::CompareOp) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self.depth_compare_op = compare_op;
        self
    }

    /// Set face culling
    pub fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        self.cull_mode = cull_mode;
        self.front_face = front_face;
        self
    }

    /// Enable alpha blending
    pub fn with_blending(mut self, enabled: bool) -> Self {
        self.blend_enable = enabled;
        self
    }

    /// Set the number of color attachments
    pub fn with_color_attachments(mut self, count: u32) -> Self {
        self.color_attachment_count = count;
        self
    }

    /// Set the primitive topology
    pub fn with_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the subpass the pipeline is used in
    pub fn with_subpass(mut self, subpass: u32) -> Self {
        self.subpass = subpass;
        self
    }
}

/// What a [`Pipeline`] is built from
#[derive(Debug, Clone)]
pub enum PipelineKind {
    /// Rasterization pipeline
    Graphics(GraphicsPipelineDesc),
    /// Compute pipeline
    Compute(ComputePipelineDesc),
    /// Ray tracing pipeline; requires `VK_KHR_ray_tracing_pipeline`
    RayTracing(RayTracingPipelineDesc),
}

impl PipelineKind {
    /// Bind point pipelines of this kind are bound to
    pub const fn bind_point(&self) -> vk::PipelineBindPoint {
        match self {
            Self::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
            Self::Compute(_) => vk::PipelineBindPoint::COMPUTE,
            Self::RayTracing(_) => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }

    fn validate(&self) {
        match self {
            Self::Graphics(desc) => {
                assert!(
                    desc.stages.iter().any(|s| s.stage == vk::ShaderStageFlags::VERTEX),
                    "graphics pipeline without a vertex stage"
                );
            }
            Self::Compute(desc) => {
                assert_eq!(
                    desc.stage.stage,
                    vk::ShaderStageFlags::COMPUTE,
                    "compute pipeline stage must be COMPUTE"
                );
            }
            Self::RayTracing(desc) => {
                assert!(!desc.groups.is_empty(), "ray tracing pipeline without shader groups");
                let stage_count = u32::try_from(desc.stages.len()).unwrap_or(u32::MAX);
                let in_range = |index: &Option<u32>| index.map_or(true, |i| i < stage_count);
                for group in &desc.groups {
                    let valid = match group {
                        RayTracingGroup::General(index) => *index < stage_count,
                        RayTracingGroup::TrianglesHit { closest_hit, any_hit } => {
                            in_range(closest_hit) && in_range(any_hit)
                        }
                        RayTracingGroup::ProceduralHit {
                            intersection,
                            closest_hit,
                            any_hit,
                        } => *intersection < stage_count && in_range(closest_hit) && in_range(any_hit),
                    };
                    assert!(valid, "shader group {group:?} refers to a missing stage");
                }
            }
        }
    }
}

/// A pipeline of one of the three kinds
pub struct Pipeline {
    context: Arc<GraphicsContext>,
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
    layout: vk::PipelineLayout,
}

impl Pipeline {
    /// Create a pipeline
    ///
    /// # Panics
    /// Panics if the description is structurally invalid (missing vertex stage,
    /// compute stage of another type, hit group referencing a missing stage).
    pub fn new(context: &Arc<GraphicsContext>, kind: &PipelineKind) -> VulkanResult<Self> {
        kind.validate();
        let device = context.device();
        let (pipeline, layout) = match kind {
            PipelineKind::Graphics(desc) => (device.create_graphics_pipeline(desc)?, desc.layout),
            PipelineKind::Compute(desc) => (device.create_compute_pipeline(desc)?, desc.layout),
            PipelineKind::RayTracing(desc) => (device.create_ray_tracing_pipeline(desc)?, desc.layout),
        };
        let bind_point = kind.bind_point();
        log::debug!("Created {:?} pipeline {:?}", bind_point, pipeline);
        Ok(Self {
            context: Arc::clone(context),
            pipeline,
            bind_point,
            layout,
        })
    }

    /// Get pipeline handle
    pub const fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Bind point of the pipeline
    pub const fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    /// Layout the pipeline was created with
    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.context.trash(Garbage::Pipeline(self.pipeline));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessConfig, HeadlessDevice};
    use crate::config::CoreConfig;
    use crate::descriptors::DescriptorSetLayoutBuilder;
    use crate::error::VulkanError;

    fn context_with(config: HeadlessConfig) -> (Arc<HeadlessDevice>, Arc<GraphicsContext>) {
        let device = Arc::new(HeadlessDevice::with_config(config));
        let context = GraphicsContext::new(device.clone(), CoreConfig::default()).unwrap();
        (device, context)
    }

    fn module(context: &Arc<GraphicsContext>, stage: vk::ShaderStageFlags) -> ShaderModule {
        ShaderModule::from_bytes(context, stage, &shader::tests::fake_spirv()).unwrap()
    }

    fn layout(context: &Arc<GraphicsContext>) -> PipelineLayout {
        let set_layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(context)
            .unwrap();
        let push = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: 64,
        };
        PipelineLayout::new(context, &[set_layout], &[push]).unwrap()
    }

    #[test]
    fn test_graphics_and_compute_pipelines() {
        let (device, context) = context_with(HeadlessConfig::default());
        let layout = layout(&context);
        let vert = module(&context, vk::ShaderStageFlags::VERTEX);
        let frag = module(&context, vk::ShaderStageFlags::FRAGMENT);
        let comp = module(&context, vk::ShaderStageFlags::COMPUTE);

        let graphics = Pipeline::new(
            &context,
            &PipelineKind::Graphics(
                GraphicsPipelineDesc::new(
                    vec![vert.main_stage(), frag.main_stage()],
                    layout.handle(),
                    vk::RenderPass::null(),
                )
                .with_blending(true),
            ),
        )
        .unwrap();
        let compute = Pipeline::new(
            &context,
            &PipelineKind::Compute(ComputePipelineDesc {
                stage: comp.main_stage(),
                layout: layout.handle(),
            }),
        )
        .unwrap();

        assert_eq!(graphics.bind_point(), vk::PipelineBindPoint::GRAPHICS);
        assert_eq!(compute.bind_point(), vk::PipelineBindPoint::COMPUTE);
        assert_eq!(graphics.layout(), layout.handle());
        assert_eq!(layout.push_constant_ranges()[0].size, 64);
        assert_eq!(device.live_count(vk::ObjectType::PIPELINE), 2);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_ray_tracing_requires_extension() {
        let (_device, context) = context_with(HeadlessConfig::default());
        let layout = layout(&context);
        let rgen = module(&context, vk::ShaderStageFlags::RAYGEN_KHR);
        let kind = PipelineKind::RayTracing(RayTracingPipelineDesc {
            stages: vec![rgen.main_stage()],
            groups: vec![RayTracingGroup::General(0)],
            max_recursion_depth: 1,
            layout: layout.handle(),
        });

        let result = Pipeline::new(&context, &kind);
        assert!(matches!(result, Err(VulkanError::ExtensionNotLoaded(_))));

        let (_device, context) = context_with(HeadlessConfig::default().with_ray_tracing(true));
        let layout = self::layout(&context);
        let rgen = module(&context, vk::ShaderStageFlags::RAYGEN_KHR);
        let chit = module(&context, vk::ShaderStageFlags::CLOSEST_HIT_KHR);
        let kind = PipelineKind::RayTracing(RayTracingPipelineDesc {
            stages: vec![rgen.main_stage(), chit.main_stage()],
            groups: vec![
                RayTracingGroup::General(0),
                RayTracingGroup::TrianglesHit {
                    closest_hit: Some(1),
                    any_hit: None,
                },
            ],
            max_recursion_depth: 1,
            layout: layout.handle(),
        });
        let pipeline = Pipeline::new(&context, &kind).unwrap();
        assert_eq!(pipeline.bind_point(), vk::PipelineBindPoint::RAY_TRACING_KHR);
    }

    #[test]
    #[should_panic(expected = "refers to a missing stage")]
    fn test_hit_group_out_of_range_panics() {
        let (_device, context) = context_with(HeadlessConfig::default().with_ray_tracing(true));
        let layout = layout(&context);
        let rgen = module(&context, vk::ShaderStageFlags::RAYGEN_KHR);
        let kind = PipelineKind::RayTracing(RayTracingPipelineDesc {
            stages: vec![rgen.main_stage()],
            groups: vec![RayTracingGroup::TrianglesHit {
                closest_hit: Some(3),
                any_hit: None,
            }],
            max_recursion_depth: 1,
            layout: layout.handle(),
        });
        let _ = Pipeline::new(&context, &kind);
    }

    #[test]
    fn test_pipeline_destruction_is_deferred() {
        let (device, context) = context_with(HeadlessConfig::default());
        let layout = layout(&context);
        let comp = module(&context, vk::ShaderStageFlags::COMPUTE);
        let pipeline = Pipeline::new(
            &context,
            &PipelineKind::Compute(ComputePipelineDesc {
                stage: comp.main_stage(),
                layout: layout.handle(),
            }),
        )
        .unwrap();
        let pipeline_handle = pipeline.handle();
        let layout_handle = layout.handle();
        drop(pipeline);
        drop(layout);

        context.update_delete_queue();
        assert!(device.is_alive(pipeline_handle));
        assert!(device.is_alive(layout_handle));
        for _ in 0..context.frames_in_flight() {
            context.update_delete_queue();
        }
        assert!(!device.is_alive(pipeline_handle));
        assert!(!device.is_alive(layout_handle));
    }
}
