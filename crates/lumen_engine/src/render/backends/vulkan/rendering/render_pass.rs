//! Render pass derivation and management
//!
//! A render pass is derived purely from the ordered attachment descriptions of
//! a framebuffer. The same descriptions always produce the same
//! [`RenderPassSignature`], which is what pipelines are checked against.

use ash::{vk, Device};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// View mask broadcasting one draw to all six cube faces
pub const CUBE_VIEW_MASK: u32 = 0b11_1111;

/// Whether `format` carries depth (and possibly stencil)
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Whether `format` carries a stencil component
pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// The part of an attachment list that decides pipeline compatibility
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPassSignature {
    attachments: Vec<(vk::Format, vk::SampleCountFlags)>,
    view_mask: u32,
}

impl RenderPassSignature {
    /// Signature of a pass built from `descriptions`
    pub fn from_descriptions(descriptions: &[vk::AttachmentDescription], view_mask: u32) -> Self {
        Self {
            attachments: descriptions.iter().map(|d| (d.format, d.samples)).collect(),
            view_mask,
        }
    }

    /// Pipelines built for `self` may be bound inside `other`
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self == other
    }

    /// Number of color attachments, which sizes the pipeline blend state
    pub fn color_attachment_count(&self) -> usize {
        self.attachments
            .iter()
            .filter(|(format, _)| !is_depth_format(*format))
            .count()
    }

    /// Multiview mask, zero when multiview is off
    pub fn view_mask(&self) -> u32 {
        self.view_mask
    }
}

/// Fail unless a pipeline built for `pipeline_signature` may run inside `active`
pub fn check_pipeline_compatibility(
    pipeline_name: &str,
    pipeline_signature: &RenderPassSignature,
    active: Option<&RenderPassSignature>,
) -> VulkanResult<()> {
    match active {
        None => Err(VulkanError::InvalidOperation {
            reason: format!("pipeline '{}' bound outside a render pass", pipeline_name),
        }),
        Some(active) if pipeline_signature.is_compatible_with(active) => Ok(()),
        Some(_) => Err(VulkanError::IncompatibleRenderPass {
            pipeline: pipeline_name.to_string(),
        }),
    }
}

/// Subpass references and dependencies derived from attachment descriptions
#[derive(Debug, Clone)]
pub struct RenderPassLayout {
    /// Color attachment references in declaration order
    pub color_refs: Vec<vk::AttachmentReference>,
    /// The single depth/stencil reference, if any
    pub depth_ref: Option<vk::AttachmentReference>,
    /// External-to-subpass and subpass-to-external dependencies
    pub dependencies: [vk::SubpassDependency; 2],
}

impl RenderPassLayout {
    /// Derive references and dependencies; more than one depth attachment is rejected
    pub fn derive(descriptions: &[vk::AttachmentDescription]) -> VulkanResult<Self> {
        let mut color_refs = Vec::new();
        let mut depth_ref = None;

        for (index, description) in (0u32..).zip(descriptions) {
            if is_depth_format(description.format) {
                if depth_ref.is_some() {
                    return Err(VulkanError::MultipleDepthAttachments);
                }
                depth_ref = Some(vk::AttachmentReference {
                    attachment: index,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                });
            } else {
                color_refs.push(vk::AttachmentReference {
                    attachment: index,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                });
            }
        }

        Ok(Self {
            color_refs,
            depth_ref,
            dependencies: Self::dependencies(),
        })
    }

    fn dependencies() -> [vk::SubpassDependency; 2] {
        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let attachment_writes =
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        let attachment_access = attachment_writes
            | vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
        let consumer_stages = vk::PipelineStageFlags::FRAGMENT_SHADER
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            | vk::PipelineStageFlags::COMPUTE_SHADER;

        [
            vk::SubpassDependency::builder()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
                .src_access_mask(attachment_writes | vk::AccessFlags::SHADER_READ)
                .dst_stage_mask(attachment_stages)
                .dst_access_mask(attachment_access)
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build(),
            vk::SubpassDependency::builder()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(attachment_stages)
                .src_access_mask(attachment_writes)
                .dst_stage_mask(consumer_stages)
                .dst_access_mask(
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
                )
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build(),
        ]
    }
}

/// Render pass wrapper with RAII cleanup
pub struct RenderPass {
    device: Device,
    render_pass: vk::RenderPass,
    signature: RenderPassSignature,
}

impl RenderPass {
    /// Single-subpass render pass over `descriptions`
    pub fn new(device: Device, descriptions: &[vk::AttachmentDescription]) -> VulkanResult<Self> {
        Self::create(device, descriptions, 0)
    }

    /// Multiview variant broadcasting each draw to the views in `view_mask`
    pub fn new_multiview(
        device: Device,
        descriptions: &[vk::AttachmentDescription],
        view_mask: u32,
    ) -> VulkanResult<Self> {
        Self::create(device, descriptions, view_mask)
    }

    fn create(device: Device, descriptions: &[vk::AttachmentDescription], view_mask: u32) -> VulkanResult<Self> {
        let layout = RenderPassLayout::derive(descriptions)?;

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&layout.color_refs);
        if let Some(depth_ref) = layout.depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass.build()];

        let view_masks = [view_mask];
        let mut multiview = vk::RenderPassMultiviewCreateInfo::builder()
            .view_masks(&view_masks)
            .correlation_masks(&view_masks);

        let mut create_info = vk::RenderPassCreateInfo::builder()
            .attachments(descriptions)
            .subpasses(&subpasses)
            .dependencies(&layout.dependencies);
        if view_mask != 0 {
            create_info = create_info.push_next(&mut multiview);
        }

        let render_pass = unsafe { device.create_render_pass(&create_info, None)? };
        log::debug!(
            "Created render pass with {} color and {} depth attachments (view mask {:#b})",
            layout.color_refs.len(),
            usize::from(layout.depth_ref.is_some()),
            view_mask
        );

        Ok(Self {
            device,
            render_pass,
            signature: RenderPassSignature::from_descriptions(descriptions, view_mask),
        })
    }

    /// Get the render pass handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Compatibility signature
    pub fn signature(&self) -> &RenderPassSignature {
        &self.signature
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Everything the orchestrator needs to begin a pass
#[derive(Clone)]
pub struct RenderInfo {
    /// Render pass handle
    pub render_pass: vk::RenderPass,
    /// Signature of `render_pass`
    pub signature: RenderPassSignature,
    /// Target framebuffer
    pub framebuffer: vk::Framebuffer,
    /// One clear value per attachment
    pub clear_values: Vec<vk::ClearValue>,
    /// Viewport set at pass begin
    pub viewport: vk::Viewport,
    /// Scissor set at pass begin
    pub scissor: vk::Rect2D,
}

impl RenderInfo {
    /// Full-extent viewport and scissor
    #[allow(clippy::cast_precision_loss)]
    pub fn full_extent(
        render_pass: &RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: Vec<vk::ClearValue>,
    ) -> Self {
        Self {
            render_pass: render_pass.handle(),
            signature: render_pass.signature().clone(),
            framebuffer,
            clear_values,
            viewport: vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            scissor: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
        }
    }

    /// Render area covering the whole viewport, independent of the scissor
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: self.viewport.width as u32,
                height: self.viewport.height as u32,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description(format: vk::Format) -> vk::AttachmentDescription {
        vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build()
    }

    #[test]
    fn test_derive_splits_color_and_depth() {
        let layout = RenderPassLayout::derive(&[
            description(vk::Format::R8G8B8A8_UNORM),
            description(vk::Format::D32_SFLOAT_S8_UINT),
            description(vk::Format::R32_UINT),
        ])
        .unwrap();
        let colors: Vec<u32> = layout.color_refs.iter().map(|r| r.attachment).collect();
        assert_eq!(colors, vec![0, 2]);
        assert_eq!(layout.depth_ref.map(|r| r.attachment), Some(1));
    }

    #[test]
    fn test_derive_rejects_second_depth() {
        let result = RenderPassLayout::derive(&[
            description(vk::Format::D32_SFLOAT),
            description(vk::Format::D24_UNORM_S8_UINT),
        ]);
        assert!(matches!(result, Err(VulkanError::MultipleDepthAttachments)));
    }

    #[test]
    fn test_dependencies_bracket_the_subpass() {
        let layout = RenderPassLayout::derive(&[description(vk::Format::R8G8B8A8_UNORM)]).unwrap();
        let [incoming, outgoing] = layout.dependencies;
        assert_eq!((incoming.src_subpass, incoming.dst_subpass), (vk::SUBPASS_EXTERNAL, 0));
        assert_eq!((outgoing.src_subpass, outgoing.dst_subpass), (0, vk::SUBPASS_EXTERNAL));
        assert!(outgoing.dst_access_mask.contains(vk::AccessFlags::SHADER_READ));
    }

    #[test]
    fn test_identical_descriptions_are_compatible_regardless_of_load_ops() {
        let a = [description(vk::Format::R8G8B8A8_UNORM), description(vk::Format::D32_SFLOAT)];
        let mut b = a;
        b[1].load_op = vk::AttachmentLoadOp::LOAD;
        let sig_a = RenderPassSignature::from_descriptions(&a, 0);
        let sig_b = RenderPassSignature::from_descriptions(&b, 0);
        assert!(sig_a.is_compatible_with(&sig_b));
        assert!(check_pipeline_compatibility("opaque", &sig_a, Some(&sig_b)).is_ok());
    }

    #[test]
    fn test_depth_format_or_count_mismatch_rejected() {
        let base = RenderPassSignature::from_descriptions(
            &[description(vk::Format::R8G8B8A8_UNORM), description(vk::Format::D32_SFLOAT)],
            0,
        );
        let other_depth = RenderPassSignature::from_descriptions(
            &[description(vk::Format::R8G8B8A8_UNORM), description(vk::Format::D24_UNORM_S8_UINT)],
            0,
        );
        let color_only =
            RenderPassSignature::from_descriptions(&[description(vk::Format::R8G8B8A8_UNORM)], 0);

        for active in [&other_depth, &color_only] {
            assert!(matches!(
                check_pipeline_compatibility("opaque", &base, Some(active)),
                Err(VulkanError::IncompatibleRenderPass { .. })
            ));
        }
    }

    #[test]
    fn test_multiview_mask_is_part_of_signature() {
        let attachments = [description(vk::Format::D32_SFLOAT)];
        let single = RenderPassSignature::from_descriptions(&attachments, 0);
        let cube = RenderPassSignature::from_descriptions(&attachments, CUBE_VIEW_MASK);
        assert!(!single.is_compatible_with(&cube));
        assert_eq!(cube.color_attachment_count(), 0);
    }

    #[test]
    fn test_binding_outside_pass_is_invalid() {
        let sig = RenderPassSignature::from_descriptions(&[description(vk::Format::R8G8B8A8_UNORM)], 0);
        assert!(matches!(
            check_pipeline_compatibility("ui", &sig, None),
            Err(VulkanError::InvalidOperation { .. })
        ));
    }
}
