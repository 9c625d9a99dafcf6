//! Viewport composite into the swapchain image
//!
//! Draws the offscreen viewport (raster or ray traced) as a full-screen
//! triangle. Editor widgets are recorded afterwards into the same pass by a
//! [`UiOverlay`] supplied by the application.

use ash::vk;
use ash::Device;

use super::{RenderSystem, ResizeContext, SystemInit};
use crate::render::backends::vulkan::rendering::{PipelineSettings, VertexInput};
use crate::render::backends::vulkan::state::AttachmentRef;
use crate::render::backends::vulkan::{
    CommandRecorder, DescriptorBudget, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    FramebufferArena, GraphicsPipeline, GraphicsPipelineBuilder, VulkanResult,
};
use crate::render::frame::FrameInfo;

/// Extra drawing inside the swapchain pass, after the viewport
pub trait UiOverlay {
    /// Record widgets; the recorder is inside the swapchain render pass
    fn record(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()>;
}

/// Overlay that draws nothing
impl UiOverlay for () {
    fn record(&mut self, _frame: &FrameInfo, _recorder: &mut CommandRecorder) -> VulkanResult<()> {
        Ok(())
    }
}

/// Samples the viewport image into the acquired swapchain image
pub struct UiSystem {
    device: Device,
    pipeline: GraphicsPipeline,
    sampler: vk::Sampler,
    set: vk::DescriptorSet,
    viewport: AttachmentRef,
    layout: DescriptorSetLayout,
}

impl UiSystem {
    /// The viewport sampler set
    pub fn descriptor_budget() -> DescriptorBudget {
        DescriptorBudget::new()
            .sets(1)
            .descriptors(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1)
    }

    /// Bind `viewport` and build against the swapchain's render pass
    pub fn new(init: &SystemInit, arena: &FramebufferArena, viewport: AttachmentRef) -> VulkanResult<Self> {
        let device = init.context.device();

        let layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
            )?
            .build(device)?;
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(1.0);
        let sampler = unsafe { device.create_sampler(&sampler_info, None)? };

        let mut system = Self {
            device: device.clone(),
            pipeline: GraphicsPipelineBuilder::new("ui", "ui.vert.spv")
                .fragment_shader("ui.frag.spv")
                .settings(PipelineSettings {
                    vertex_input: VertexInput::None,
                    depth_test: false,
                    depth_write: false,
                    ..Default::default()
                })
                .set_layouts(&[layout.handle()])
                .build(device, init.config, init.swapchain.framebuffer(0)?.render_pass()?)
                .map_err(|e| {
                    unsafe { device.destroy_sampler(sampler, None) };
                    e
                })?,
            sampler,
            set: vk::DescriptorSet::null(),
            viewport,
            layout,
        };
        system.set = DescriptorWriter::new(&system.layout, init.pool)
            .write_image(
                0,
                arena.resolve(viewport)?,
                sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?
            .build()?;
        Ok(system)
    }

    /// Attachment currently shown
    pub fn viewport(&self) -> AttachmentRef {
        self.viewport
    }
}

impl RenderSystem for UiSystem {
    fn name(&self) -> &'static str {
        "ui"
    }

    fn render(&mut self, _frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        recorder.bind_graphics_pipeline(&self.pipeline)?;
        recorder.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, 0, &[self.set], &[])?;
        recorder.draw(3, 1)
    }

    fn on_resize(&mut self, resize: &mut ResizeContext) -> VulkanResult<()> {
        if let Some(viewport) = resize.viewport {
            self.viewport = viewport;
        }
        DescriptorWriter::new(&self.layout, resize.pool)
            .write_image(
                0,
                resize.arena.resolve(self.viewport)?,
                self.sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?
            .overwrite(self.set);
        Ok(())
    }
}

impl Drop for UiSystem {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}
