//! Selection outline
//!
//! Redraws the selected mesh slightly enlarged, passing the stencil test only
//! where the pre-pass did not mark the mesh itself. What survives is a rim
//! around the silhouette.

use ash::vk;

use super::{RenderSystem, ResizeContext, SystemInit};
use crate::foundation::math::Mat4;
use crate::render::backends::vulkan::rendering::{stencil_outside_state, PipelineSettings, RenderPass};
use crate::render::backends::vulkan::{CommandRecorder, GraphicsPipeline, GraphicsPipelineBuilder, VulkanResult};
use crate::render::frame::FrameInfo;
use crate::scene::Entity;

const OUTLINE_COLOR: [f32; 4] = [1.0, 0.55, 0.1, 1.0];

/// Model matrix scaled about the object's own origin
pub fn outline_model(model: &Mat4, scale: f32) -> Mat4 {
    model * Mat4::new_scaling(scale)
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct OutlinePush {
    model: [[f32; 4]; 4],
    color: [f32; 4],
}

unsafe impl bytemuck::Pod for OutlinePush {}
unsafe impl bytemuck::Zeroable for OutlinePush {}

/// Stencil-gated outline inside the opaque pass
pub struct OutlineSystem {
    pipeline: GraphicsPipeline,
    scale: f32,
    last_outlined: Option<(Entity, Mat4)>,
}

impl OutlineSystem {
    /// Build against the opaque pass's `render_pass`
    pub fn new(init: &SystemInit, render_pass: &RenderPass) -> VulkanResult<Self> {
        let pipeline = GraphicsPipelineBuilder::new("outline", "outline.vert.spv")
            .fragment_shader("outline.frag.spv")
            .settings(PipelineSettings {
                depth_test: false,
                depth_write: false,
                stencil: Some(stencil_outside_state()),
                ..Default::default()
            })
            .set_layouts(&[init.globals.layout().handle()])
            .push_constants::<OutlinePush>(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(init.context.device(), init.config, render_pass)?;
        Ok(Self {
            pipeline,
            scale: init.config.outline_scale,
            last_outlined: None,
        })
    }

    /// Entity and scaled model drawn by the last frame
    pub fn last_outlined(&self) -> Option<(Entity, Mat4)> {
        self.last_outlined
    }
}

impl RenderSystem for OutlineSystem {
    fn name(&self) -> &'static str {
        "outline"
    }

    fn render(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        self.last_outlined = None;
        let Some(draw) = frame.selected_draw() else {
            return Ok(());
        };
        let Some(mesh) = frame.meshes.get(draw.mesh) else {
            return Ok(());
        };

        let model = outline_model(&draw.model, self.scale);
        let push = OutlinePush {
            model: model.into(),
            color: OUTLINE_COLOR,
        };
        recorder.bind_graphics_pipeline(&self.pipeline)?;
        recorder.set_stencil_reference(1)?;
        recorder.bind_descriptor_sets(
            vk::PipelineBindPoint::GRAPHICS,
            0,
            &[frame.global_set],
            &[frame.object_offset(draw)],
        )?;
        recorder.push_constants(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT, &push)?;
        recorder.bind_geometry(mesh.vertex_buffer.handle(), mesh.index_buffer.handle())?;
        recorder.draw_indexed(mesh.index_count, 1)?;

        self.last_outlined = Some((draw.entity, model));
        Ok(())
    }

    fn on_resize(&mut self, _resize: &mut ResizeContext) -> VulkanResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Point3, Vec3};
    use approx::assert_relative_eq;

    #[test]
    fn test_outline_scales_about_object_origin() {
        let model = Mat4::new_translation(&Vec3::new(5.0, 0.0, 0.0));
        let scaled = outline_model(&model, 1.02);
        let corner = scaled.transform_point(&Point3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(corner, Point3::new(6.02, 1.02, 1.02), epsilon = 1e-5);
    }

    #[test]
    fn test_outline_keeps_position() {
        let model = Mat4::new_translation(&Vec3::new(0.0, 2.0, 0.0));
        let origin = outline_model(&model, 1.02).transform_point(&Point3::origin());
        assert_relative_eq!(origin, Point3::new(0.0, 2.0, 0.0), epsilon = 1e-6);
    }
}
