//! Depth pre-pass
//!
//! Fills scene depth for every mesh entity, then writes stencil value 1 under
//! the selected entity so the outline pass can draw around it. The depth
//! image is owned here and borrowed by the opaque and picking passes.

use ash::vk;

use super::{draw_object, RenderSystem, ResizeContext, SystemInit};
use crate::render::backends::vulkan::rendering::{
    has_stencil_component, stencil_write_state, PipelineSettings, RenderInfo,
};
use crate::render::backends::vulkan::state::{AttachmentRef, AttachmentSpec, Framebuffer, FramebufferId};
use crate::render::backends::vulkan::{
    CommandRecorder, FramebufferArena, GraphicsPipeline, GraphicsPipelineBuilder, VulkanResult,
};
use crate::render::frame::{DrawItem, FrameInfo};
use crate::scene::Entity;

/// Which draws each sub-step of the pre-pass issues
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthPrepassPlan<'a> {
    /// Depth fill: every mesh entity
    pub fill: &'a [DrawItem],
    /// Stencil write: the selected entity, when it is drawn
    pub stencil: Option<&'a DrawItem>,
}

impl<'a> DepthPrepassPlan<'a> {
    /// Plan for `draws` with the current selection
    pub fn new(draws: &'a [DrawItem], selected: Option<Entity>) -> Self {
        let stencil = selected.and_then(|entity| draws.iter().find(|draw| draw.entity == entity));
        Self { fill: draws, stencil }
    }
}

/// Draw counts recorded by the last frame
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DepthPrepassStats {
    /// Depth fill draws
    pub fill_draws: u32,
    /// Stencil draws
    pub stencil_draws: u32,
}

/// Owner of the scene depth/stencil target
pub struct DepthPrepassSystem {
    fill: GraphicsPipeline,
    stencil: Option<GraphicsPipeline>,
    framebuffer: FramebufferId,
    format: vk::Format,
    stats: DepthPrepassStats,
}

impl DepthPrepassSystem {
    /// Create the depth target at swapchain size and both pipelines
    pub fn new(init: &SystemInit, arena: &mut FramebufferArena) -> VulkanResult<Self> {
        let format = init.swapchain.formats().depth;
        let mut framebuffer = Framebuffer::new(&init.context.allocator());
        Self::build_target(&mut framebuffer, format, init.swapchain.extent())?;

        let device = init.context.device();
        let set_layouts = [init.globals.layout().handle()];
        let render_pass = framebuffer.render_pass()?;
        let fill = GraphicsPipelineBuilder::new("depth_prepass", "depth_prepass.vert.spv")
            .settings(PipelineSettings {
                color_write: false,
                ..Default::default()
            })
            .set_layouts(&set_layouts)
            .build(device, init.config, render_pass)?;

        let stencil = if has_stencil_component(format) {
            let pipeline = GraphicsPipelineBuilder::new("selection_stencil", "depth_prepass.vert.spv")
                .settings(PipelineSettings {
                    depth_write: false,
                    stencil: Some(stencil_write_state()),
                    color_write: false,
                    ..Default::default()
                })
                .set_layouts(&set_layouts)
                .build(device, init.config, render_pass)?;
            Some(pipeline)
        } else {
            log::warn!("Depth format {:?} has no stencil; selection outline disabled", format);
            None
        };

        let framebuffer = arena.insert(framebuffer);
        log::debug!("Depth pre-pass ready ({:?})", format);
        Ok(Self {
            fill,
            stencil,
            framebuffer,
            format,
            stats: DepthPrepassStats::default(),
        })
    }

    fn build_target(framebuffer: &mut Framebuffer, format: vk::Format, extent: vk::Extent2D) -> VulkanResult<()> {
        framebuffer.create_attachment(&AttachmentSpec::depth(format, extent))?;
        framebuffer.create_render_pass()
    }

    /// Borrowable reference to the depth/stencil attachment
    pub fn depth_ref(&self) -> AttachmentRef {
        AttachmentRef {
            framebuffer: self.framebuffer,
            attachment: 0,
        }
    }

    /// Whether the stencil sub-step can run
    pub fn writes_stencil(&self) -> bool {
        self.stencil.is_some()
    }

    /// Counts from the last recorded frame
    pub fn last_stats(&self) -> DepthPrepassStats {
        self.stats
    }
}

impl RenderSystem for DepthPrepassSystem {
    fn name(&self) -> &'static str {
        "depth_prepass"
    }

    fn prepare_render_info(&self, frame: &FrameInfo) -> VulkanResult<Option<RenderInfo>> {
        let clear = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
        };
        frame.targets.get(self.framebuffer)?.render_info(vec![clear]).map(Some)
    }

    fn render(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        let plan = DepthPrepassPlan::new(frame.draws, frame.selected);
        let mut stats = DepthPrepassStats::default();

        recorder.bind_graphics_pipeline(&self.fill)?;
        for draw in plan.fill {
            if draw_object(frame, recorder, draw)? {
                stats.fill_draws += 1;
            }
        }

        if let (Some(pipeline), Some(selected)) = (&self.stencil, plan.stencil) {
            recorder.bind_graphics_pipeline(pipeline)?;
            recorder.set_stencil_reference(1)?;
            if draw_object(frame, recorder, selected)? {
                stats.stencil_draws += 1;
            }
        }

        log::trace!(
            "Depth pre-pass: {} fill, {} stencil",
            stats.fill_draws,
            stats.stencil_draws
        );
        self.stats = stats;
        Ok(())
    }

    fn on_resize(&mut self, resize: &mut ResizeContext) -> VulkanResult<()> {
        let framebuffer = resize.arena.get_mut(self.framebuffer)?;
        framebuffer.clear_framebuffer();
        Self::build_target(framebuffer, self.format, resize.extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Mat4;
    use crate::render::mesh::MeshHandle;
    use slotmap::KeyData;

    fn draws() -> Vec<DrawItem> {
        (0..2u32)
            .map(|i| DrawItem {
                entity: Entity::from(KeyData::from_ffi(u64::from(i) + 1)),
                mesh: MeshHandle::default(),
                object_index: i,
                model: Mat4::identity(),
            })
            .collect()
    }

    #[test]
    fn test_plan_without_selection_only_fills() {
        let draws = draws();
        let plan = DepthPrepassPlan::new(&draws, None);
        assert_eq!(plan.fill.len(), 2);
        assert!(plan.stencil.is_none());
    }

    #[test]
    fn test_plan_stencils_exactly_the_selected_entity() {
        let draws = draws();
        let plan = DepthPrepassPlan::new(&draws, Some(draws[1].entity));
        assert_eq!(plan.fill.len(), 2);
        assert_eq!(plan.stencil.map(|d| d.entity), Some(draws[1].entity));
    }

    #[test]
    fn test_plan_ignores_selection_without_mesh() {
        let draws = draws();
        let stray = Entity::from(KeyData::from_ffi(99));
        assert!(DepthPrepassPlan::new(&draws, Some(stray)).stencil.is_none());
    }
}
