//! Graphics pipelines
//!
//! Pipelines are built against a specific [`RenderPass`] and remember its
//! signature; binding one inside an incompatible pass is rejected by the
//! command recorder.

use ash::{vk, Device};

use super::render_pass::{RenderPass, RenderPassSignature};
use super::shader::ShaderModule;
use crate::config::RendererConfig;
use crate::render::backends::vulkan::VulkanResult;
use crate::render::mesh::Vertex;

/// Vertex input the pipeline expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexInput {
    /// Interleaved [`Vertex`] at binding 0
    Mesh,
    /// Vertices generated in the shader from `gl_VertexIndex`
    None,
}

/// Color blending for every color attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    /// Overwrite
    Opaque,
    /// Standard alpha blending
    Alpha,
}

/// Fixed-function settings with the defaults opaque mesh passes use
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Vertex input
    pub vertex_input: VertexInput,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Depth test enable
    pub depth_test: bool,
    /// Depth write enable
    pub depth_write: bool,
    /// Depth comparison
    pub depth_compare: vk::CompareOp,
    /// Stencil state applied to both faces; `None` disables stencil testing
    pub stencil: Option<vk::StencilOpState>,
    /// Color blending
    pub blend: BlendMode,
    /// Whether color attachments are written at all
    pub color_write: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            vertex_input: VertexInput::Mesh,
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            stencil: None,
            blend: BlendMode::Opaque,
            color_write: true,
        }
    }
}

impl PipelineSettings {
    /// One blend state per color attachment
    pub fn blend_attachments(&self, color_attachments: usize) -> Vec<vk::PipelineColorBlendAttachmentState> {
        let write_mask = if self.color_write {
            vk::ColorComponentFlags::RGBA
        } else {
            vk::ColorComponentFlags::empty()
        };
        let state = match self.blend {
            BlendMode::Opaque => vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(write_mask)
                .blend_enable(false)
                .build(),
            BlendMode::Alpha => vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(write_mask)
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
        };
        vec![state; color_attachments]
    }

    /// Dynamic state list; stencil reference is dynamic whenever stencil testing is on
    pub fn dynamic_states(&self) -> Vec<vk::DynamicState> {
        let mut states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        if self.stencil.is_some() {
            states.push(vk::DynamicState::STENCIL_REFERENCE);
        }
        states
    }
}

/// Stencil state writing the reference value wherever geometry lands
pub fn stencil_write_state() -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: vk::StencilOp::KEEP,
        pass_op: vk::StencilOp::REPLACE,
        depth_fail_op: vk::StencilOp::REPLACE,
        compare_op: vk::CompareOp::ALWAYS,
        compare_mask: 0xff,
        write_mask: 0xff,
        reference: 1,
    }
}

/// Stencil state passing only where the stored value differs from the reference
pub fn stencil_outside_state() -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: vk::StencilOp::KEEP,
        pass_op: vk::StencilOp::KEEP,
        depth_fail_op: vk::StencilOp::KEEP,
        compare_op: vk::CompareOp::NOT_EQUAL,
        compare_mask: 0xff,
        write_mask: 0,
        reference: 1,
    }
}

/// Graphics pipeline builder
pub struct GraphicsPipelineBuilder<'a> {
    name: &'static str,
    vertex_shader: &'a str,
    fragment_shader: Option<&'a str>,
    settings: PipelineSettings,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constants: Option<vk::PushConstantRange>,
}

impl<'a> GraphicsPipelineBuilder<'a> {
    /// Start a pipeline named `name` using the given vertex shader file
    pub fn new(name: &'static str, vertex_shader: &'a str) -> Self {
        Self {
            name,
            vertex_shader,
            fragment_shader: None,
            settings: PipelineSettings::default(),
            set_layouts: Vec::new(),
            push_constants: None,
        }
    }

    /// Fragment shader file; depth-only pipelines leave it out
    pub fn fragment_shader(mut self, file_name: &'a str) -> Self {
        self.fragment_shader = Some(file_name);
        self
    }

    /// Replace the fixed-function settings
    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Descriptor set layouts in set order
    pub fn set_layouts(mut self, layouts: &[vk::DescriptorSetLayout]) -> Self {
        self.set_layouts = layouts.to_vec();
        self
    }

    /// Push constant block of type `T`, starting at offset 0
    pub fn push_constants<T>(mut self, stages: vk::ShaderStageFlags) -> Self {
        self.push_constants = Some(vk::PushConstantRange {
            stage_flags: stages,
            offset: 0,
            size: std::mem::size_of::<T>() as u32,
        });
        self
    }

    /// Create the pipeline for subpass 0 of `render_pass`
    pub fn build(
        self,
        device: &Device,
        config: &RendererConfig,
        render_pass: &RenderPass,
    ) -> VulkanResult<GraphicsPipeline> {
        let vertex = ShaderModule::load(device.clone(), config, self.vertex_shader, vk::ShaderStageFlags::VERTEX)?;
        let fragment = self
            .fragment_shader
            .map(|file| ShaderModule::load(device.clone(), config, file, vk::ShaderStageFlags::FRAGMENT))
            .transpose()?;

        let mut stages = vec![vertex.stage_info()];
        if let Some(fragment) = fragment.as_ref() {
            stages.push(fragment.stage_info());
        }

        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input = match self.settings.vertex_input {
            VertexInput::Mesh => vk::PipelineVertexInputStateCreateInfo::builder()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes),
            VertexInput::None => vk::PipelineVertexInputStateCreateInfo::builder(),
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(self.settings.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let stencil = self.settings.stencil.unwrap_or_default();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.settings.depth_test)
            .depth_write_enable(self.settings.depth_write)
            .depth_compare_op(self.settings.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(self.settings.stencil.is_some())
            .front(stencil)
            .back(stencil);

        let blend_attachments = self
            .settings
            .blend_attachments(render_pass.signature().color_attachment_count());
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let dynamic_states = self.settings.dynamic_states();
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let push_constant_ranges: Vec<vk::PushConstantRange> = self.push_constants.into_iter().collect();
        let layout = PipelineLayout::new(device.clone(), &self.set_layouts, &push_constant_ranges)?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout.handle())
            .render_pass(render_pass.handle())
            .subpass(0);

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
                .map_err(|(_, err)| err)?
        };

        log::debug!("Created graphics pipeline '{}'", self.name);

        Ok(GraphicsPipeline {
            device: device.clone(),
            pipeline: pipelines[0],
            layout,
            signature: render_pass.signature().clone(),
            name: self.name,
        })
    }
}

/// Pipeline layout wrapper with RAII cleanup
pub struct PipelineLayout {
    device: Device,
    layout: vk::PipelineLayout,
}

impl PipelineLayout {
    /// Create a layout from set layouts and push constant ranges
    pub fn new(
        device: Device,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };
        Ok(Self { device, layout })
    }

    /// Get layout handle
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Graphics pipeline wrapper with RAII cleanup
pub struct GraphicsPipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: PipelineLayout,
    signature: RenderPassSignature,
    name: &'static str,
}

impl GraphicsPipeline {
    /// Get pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Get layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.handle()
    }

    /// Signature of the render pass this pipeline was built for
    pub fn signature(&self) -> &RenderPassSignature {
        &self.signature
    }

    /// Debug name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_attachments_match_color_count() {
        let settings = PipelineSettings {
            blend: BlendMode::Alpha,
            ..Default::default()
        };
        let states = settings.blend_attachments(2);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].blend_enable, vk::TRUE);
        assert!(PipelineSettings::default().blend_attachments(0).is_empty());
    }

    #[test]
    fn test_depth_only_pipeline_masks_color() {
        let settings = PipelineSettings {
            color_write: false,
            ..Default::default()
        };
        assert_eq!(settings.blend_attachments(1)[0].color_write_mask, vk::ColorComponentFlags::empty());
    }

    #[test]
    fn test_stencil_pipelines_make_reference_dynamic() {
        let plain = PipelineSettings::default();
        assert!(!plain.dynamic_states().contains(&vk::DynamicState::STENCIL_REFERENCE));

        let stenciled = PipelineSettings {
            stencil: Some(stencil_write_state()),
            ..Default::default()
        };
        assert!(stenciled.dynamic_states().contains(&vk::DynamicState::STENCIL_REFERENCE));
    }

    #[test]
    fn test_outline_stencil_rejects_marked_pixels() {
        let write = stencil_write_state();
        let outside = stencil_outside_state();
        assert_eq!(write.pass_op, vk::StencilOp::REPLACE);
        assert_eq!(outside.compare_op, vk::CompareOp::NOT_EQUAL);
        assert_eq!(outside.write_mask, 0);
        assert_eq!(write.reference, outside.reference);
    }
}
