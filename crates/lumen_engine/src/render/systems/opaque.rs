//! Main lit geometry pass
//!
//! Renders into an offscreen color target that the UI shows as the editor
//! viewport. Depth and the selection stencil are loaded from the pre-pass
//! through a borrowed attachment, so nothing here writes depth. The point
//! light and outline systems record into the same render pass.

use ash::vk;

use super::{borrowed_attachment, draw_object, RenderSystem, ResizeContext, ShadowSystem, SystemInit};
use crate::config::RendererConfig;
use crate::render::backends::vulkan::rendering::{PipelineSettings, RenderInfo};
use crate::render::backends::vulkan::state::{AttachmentRef, AttachmentSpec, Framebuffer, FramebufferId};
use crate::render::backends::vulkan::{
    CommandRecorder, DescriptorBudget, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    FramebufferArena, GraphicsPipeline, GraphicsPipelineBuilder, VulkanResult,
};
use crate::render::frame::FrameInfo;

/// Color format of the offscreen viewport
pub const VIEWPORT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Offscreen color target plus the lit mesh pipeline
pub struct OpaqueSystem {
    pipeline: GraphicsPipeline,
    shadow_set: vk::DescriptorSet,
    framebuffer: FramebufferId,
    depth: AttachmentRef,
    clear_color: [f32; 4],
    _shadow_layout: DescriptorSetLayout,
}

impl OpaqueSystem {
    /// One set sampling every shadow cube
    pub fn descriptor_budget(config: &RendererConfig) -> DescriptorBudget {
        let cubes = u32::try_from(config.max_point_lights).unwrap_or(u32::MAX);
        DescriptorBudget::new()
            .sets(1)
            .descriptors(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, cubes)
    }

    /// Create the viewport target around the borrowed pre-pass `depth`
    pub fn new(
        init: &SystemInit,
        arena: &mut FramebufferArena,
        depth: AttachmentRef,
        shadow: &ShadowSystem,
    ) -> VulkanResult<Self> {
        let device = init.context.device();
        let mut framebuffer = Framebuffer::new(&init.context.allocator());
        let borrowed = borrowed_attachment(arena, depth)?;
        Self::build_target(&mut framebuffer, borrowed, init.swapchain.extent())?;

        let cubes = shadow.cube_views();
        let cube_count = u32::try_from(cubes.len()).unwrap_or(u32::MAX);
        let builder = DescriptorSetLayoutBuilder::new();
        let builder = if init.context.physical_device().descriptor_indexing {
            builder.add_variable_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                cube_count,
            )?
        } else {
            builder.add_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                cube_count,
            )?
        };
        let shadow_layout = builder.build(device)?;
        let sampler = shadow.sampler();
        let images: Vec<vk::DescriptorImageInfo> = cubes
            .iter()
            .map(|&image_view| vk::DescriptorImageInfo {
                sampler,
                image_view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        let shadow_set = DescriptorWriter::new(&shadow_layout, init.pool)
            .write_images(0, &images)?
            .build()?;

        let pipeline = GraphicsPipelineBuilder::new("opaque", "simple_shader.vert.spv")
            .fragment_shader("simple_shader.frag.spv")
            .settings(PipelineSettings {
                depth_write: false,
                cull_mode: vk::CullModeFlags::BACK,
                ..Default::default()
            })
            .set_layouts(&[init.globals.layout().handle(), shadow_layout.handle()])
            .build(device, init.config, framebuffer.render_pass()?)?;

        let framebuffer = arena.insert(framebuffer);
        log::debug!("Opaque pass ready");
        Ok(Self {
            pipeline,
            shadow_set,
            framebuffer,
            depth,
            clear_color: init.config.clear_color,
            _shadow_layout: shadow_layout,
        })
    }

    fn build_target(
        framebuffer: &mut Framebuffer,
        (depth_spec, depth_view): (AttachmentSpec, vk::ImageView),
        extent: vk::Extent2D,
    ) -> VulkanResult<()> {
        framebuffer.create_attachment(&AttachmentSpec::color(VIEWPORT_FORMAT, extent))?;
        framebuffer.add_load_attachment(&depth_spec.loaded(), depth_view)?;
        framebuffer.create_render_pass()
    }

    /// The viewport color attachment
    pub fn color_ref(&self) -> AttachmentRef {
        AttachmentRef {
            framebuffer: self.framebuffer,
            attachment: 0,
        }
    }

    /// Arena id of the viewport framebuffer
    pub fn framebuffer_id(&self) -> FramebufferId {
        self.framebuffer
    }
}

impl RenderSystem for OpaqueSystem {
    fn name(&self) -> &'static str {
        "opaque"
    }

    fn prepare_render_info(&self, frame: &FrameInfo) -> VulkanResult<Option<RenderInfo>> {
        let clears = vec![
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        ];
        frame.targets.get(self.framebuffer)?.render_info(clears).map(Some)
    }

    fn render(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        recorder.bind_graphics_pipeline(&self.pipeline)?;
        recorder.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, 1, &[self.shadow_set], &[])?;
        let mut drawn = 0u32;
        for draw in frame.draws {
            if draw_object(frame, recorder, draw)? {
                drawn += 1;
            }
        }
        log::trace!("Opaque pass: {} draws", drawn);
        Ok(())
    }

    fn on_resize(&mut self, resize: &mut ResizeContext) -> VulkanResult<()> {
        // the pre-pass resized first, so this resolves to its new depth view
        let borrowed = borrowed_attachment(resize.arena, self.depth)?;
        let framebuffer = resize.arena.get_mut(self.framebuffer)?;
        framebuffer.clear_framebuffer();
        Self::build_target(framebuffer, borrowed, resize.extent)
    }
}
