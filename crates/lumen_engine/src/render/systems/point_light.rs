//! Camera-facing billboards marking each point light
//!
//! Six vertices per light, generated in the vertex shader from the light
//! array in the global uniform block; one instance per light.

use ash::vk;

use super::{RenderSystem, ResizeContext, SystemInit};
use crate::render::backends::vulkan::rendering::{BlendMode, PipelineSettings, RenderPass, VertexInput};
use crate::render::backends::vulkan::{CommandRecorder, GraphicsPipeline, GraphicsPipelineBuilder, VulkanResult};
use crate::render::frame::FrameInfo;

const BILLBOARD_VERTICES: u32 = 6;

/// Blended light markers inside the opaque pass
pub struct PointLightSystem {
    pipeline: GraphicsPipeline,
}

impl PointLightSystem {
    /// Build against the opaque pass's `render_pass`
    pub fn new(init: &SystemInit, render_pass: &RenderPass) -> VulkanResult<Self> {
        let pipeline = GraphicsPipelineBuilder::new("point_light", "point_light.vert.spv")
            .fragment_shader("point_light.frag.spv")
            .settings(PipelineSettings {
                vertex_input: VertexInput::None,
                depth_write: false,
                blend: BlendMode::Alpha,
                ..Default::default()
            })
            .set_layouts(&[init.globals.layout().handle()])
            .build(init.context.device(), init.config, render_pass)?;
        Ok(Self { pipeline })
    }
}

impl RenderSystem for PointLightSystem {
    fn name(&self) -> &'static str {
        "point_light"
    }

    fn render(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        let count = u32::try_from(frame.lights.len()).unwrap_or(u32::MAX);
        if count == 0 {
            return Ok(());
        }
        recorder.bind_graphics_pipeline(&self.pipeline)?;
        recorder.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, 0, &[frame.global_set], &[0])?;
        recorder.draw(BILLBOARD_VERTICES, count)
    }

    fn on_resize(&mut self, _resize: &mut ResizeContext) -> VulkanResult<()> {
        Ok(())
    }
}
