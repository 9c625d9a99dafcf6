//! Offscreen framebuffers assembled from named attachments
//!
//! A [`Framebuffer`] records attachments one at a time, either allocating the
//! image itself ([`Framebuffer::create_attachment`]) or borrowing a view from
//! another framebuffer ([`Framebuffer::add_load_attachment`]). The render pass
//! is derived from the recorded descriptions, so two framebuffers built from
//! the same spec list always accept the same pipelines.

use ash::{vk, Device};

use crate::render::backends::vulkan::rendering::{has_stencil_component, is_depth_format, RenderInfo, RenderPass};
use crate::render::backends::vulkan::resources::MemoryAllocator;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Everything needed to create (or borrow) one attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentSpec {
    /// Image format
    pub format: vk::Format,
    /// Image usage; decides the aspect mask
    pub usage: vk::ImageUsageFlags,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Array layers (6 for cube maps)
    pub layer_count: u32,
    /// View type created for the attachment
    pub view_type: vk::ImageViewType,
    /// Sample count
    pub samples: vk::SampleCountFlags,
    /// Load op for color or depth
    pub load_op: vk::AttachmentLoadOp,
    /// Store op for color or depth
    pub store_op: vk::AttachmentStoreOp,
    /// Load op for stencil
    pub stencil_load_op: vk::AttachmentLoadOp,
    /// Store op for stencil
    pub stencil_store_op: vk::AttachmentStoreOp,
    /// Layout the pass expects on entry
    pub initial_layout: vk::ImageLayout,
    /// Layout the pass leaves behind
    pub final_layout: vk::ImageLayout,
}

impl AttachmentSpec {
    /// Cleared color target that later passes sample
    pub fn color(format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            width: extent.width,
            height: extent.height,
            layer_count: 1,
            view_type: vk::ImageViewType::TYPE_2D,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Cleared depth (and stencil, when the format has one) target kept for later passes
    pub fn depth(format: vk::Format, extent: vk::Extent2D) -> Self {
        let stencil_op = if has_stencil_component(format) {
            (vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE)
        } else {
            (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE)
        };
        Self {
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            stencil_load_op: stencil_op.0,
            stencil_store_op: stencil_op.1,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Self::color(format, extent)
        }
    }

    /// Keep the contents written by an earlier pass instead of clearing
    pub fn loaded(mut self) -> Self {
        self.load_op = vk::AttachmentLoadOp::LOAD;
        if has_stencil_component(self.format) {
            self.stencil_load_op = vk::AttachmentLoadOp::LOAD;
        }
        self.initial_layout = self.final_layout;
        self
    }

    /// Layered attachment, e.g. six layers viewed as a cube
    pub fn with_layers(mut self, layer_count: u32, view_type: vk::ImageViewType) -> Self {
        self.layer_count = layer_count;
        self.view_type = view_type;
        self
    }

    /// Add usage flags
    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    /// Override the layout left behind by the pass
    pub fn with_final_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.final_layout = layout;
        self
    }

    /// Extent of one layer
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    /// Attachment description recorded into the render pass
    pub fn description(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(self.stencil_load_op)
            .stencil_store_op(self.stencil_store_op)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
            .build()
    }

    /// Subresource range covering every layer
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_mask_for(self.format, self.usage),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.layer_count,
        }
    }
}

/// Aspect mask inferred from the usage flags
pub fn aspect_mask_for(format: vk::Format, usage: vk::ImageUsageFlags) -> vk::ImageAspectFlags {
    if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
        if has_stencil_component(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Refuse to build over a live render pass or framebuffer
///
/// [`Framebuffer::clear_framebuffer`] must run first so no handle leaks.
pub fn ensure_unbuilt(has_render_pass: bool, framebuffer: vk::Framebuffer) -> VulkanResult<()> {
    if has_render_pass || framebuffer != vk::Framebuffer::null() {
        return Err(VulkanError::InvalidOperation {
            reason: "render pass already built; clear the framebuffer before rebuilding".to_string(),
        });
    }
    Ok(())
}

/// Who frees an attachment's image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Image, memory and view were allocated here
    Owned {
        /// Image handle
        image: vk::Image,
        /// Backing memory
        memory: vk::DeviceMemory,
    },
    /// View belongs to another framebuffer
    Borrowed,
}

/// One attachment of a framebuffer
#[derive(Debug, Clone, Copy)]
pub struct Attachment {
    spec: AttachmentSpec,
    view: vk::ImageView,
    ownership: Ownership,
}

impl Attachment {
    /// Attachment whose image, memory and view were allocated for this framebuffer
    pub fn owned(spec: AttachmentSpec, image: vk::Image, memory: vk::DeviceMemory, view: vk::ImageView) -> Self {
        Self {
            spec,
            view,
            ownership: Ownership::Owned { image, memory },
        }
    }

    /// Attachment viewing another framebuffer's image
    pub fn borrowed(spec: AttachmentSpec, view: vk::ImageView) -> Self {
        Self {
            spec,
            view,
            ownership: Ownership::Borrowed,
        }
    }

    /// Image view used by the framebuffer and by samplers
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Image handle, only for owned attachments
    pub fn image(&self) -> Option<vk::Image> {
        match self.ownership {
            Ownership::Owned { image, .. } => Some(image),
            Ownership::Borrowed => None,
        }
    }

    /// Creation spec
    pub fn spec(&self) -> &AttachmentSpec {
        &self.spec
    }

    /// Image format
    pub fn format(&self) -> vk::Format {
        self.spec.format
    }

    /// Render pass description
    pub fn description(&self) -> vk::AttachmentDescription {
        self.spec.description()
    }
}

/// Handles released when an owned attachment is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedHandles {
    /// Image to destroy
    pub image: vk::Image,
    /// Memory to free
    pub memory: vk::DeviceMemory,
    /// View to destroy
    pub view: vk::ImageView,
}

/// Ordered attachment list with the single-depth rule
#[derive(Debug, Clone, Default)]
pub struct AttachmentSet {
    attachments: Vec<Attachment>,
    depth_index: Option<usize>,
}

impl AttachmentSet {
    /// Append an attachment and return its index
    pub fn push(&mut self, attachment: Attachment) -> VulkanResult<usize> {
        let index = self.attachments.len();
        if is_depth_format(attachment.format()) {
            if self.depth_index.is_some() {
                debug_assert!(false, "framebuffer already has a depth attachment");
                return Err(VulkanError::MultipleDepthAttachments);
            }
            self.depth_index = Some(index);
        }
        self.attachments.push(attachment);
        Ok(index)
    }

    /// Whether the list already holds a depth/stencil attachment
    pub fn has_depth(&self) -> bool {
        self.depth_index.is_some()
    }

    /// Index of the depth/stencil attachment
    pub fn depth_index(&self) -> Option<usize> {
        self.depth_index
    }

    /// Attachment at `index`
    pub fn get(&self, index: usize) -> Option<&Attachment> {
        self.attachments.get(index)
    }

    /// Number of attachments
    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    /// Descriptions in attachment order
    pub fn descriptions(&self) -> Vec<vk::AttachmentDescription> {
        self.attachments.iter().map(Attachment::description).collect()
    }

    /// Views in attachment order
    pub fn views(&self) -> Vec<vk::ImageView> {
        self.attachments.iter().map(Attachment::view).collect()
    }

    /// Largest layer count across attachments
    pub fn max_layer_count(&self) -> u32 {
        self.attachments
            .iter()
            .map(|a| a.spec.layer_count)
            .max()
            .unwrap_or(1)
    }

    /// Extent shared by the attachments (the first one decides)
    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.attachments.first().map(|a| a.spec.extent())
    }

    /// Empty the list, returning only the handles this set owns
    pub fn drain_owned(&mut self) -> Vec<OwnedHandles> {
        self.depth_index = None;
        self.attachments
            .drain(..)
            .filter_map(|attachment| match attachment.ownership {
                Ownership::Owned { image, memory } => Some(OwnedHandles {
                    image,
                    memory,
                    view: attachment.view,
                }),
                Ownership::Borrowed => None,
            })
            .collect()
    }
}

/// Render target plus its derived render pass
pub struct Framebuffer {
    allocator: MemoryAllocator,
    attachments: AttachmentSet,
    render_pass: Option<RenderPass>,
    framebuffer: vk::Framebuffer,
    sampler: vk::Sampler,
}

impl Framebuffer {
    /// Empty framebuffer; record attachments, then build the render pass
    pub fn new(allocator: &MemoryAllocator) -> Self {
        Self {
            allocator: allocator.clone(),
            attachments: AttachmentSet::default(),
            render_pass: None,
            framebuffer: vk::Framebuffer::null(),
            sampler: vk::Sampler::null(),
        }
    }

    fn device(&self) -> &Device {
        self.allocator.device()
    }

    /// Allocate image, memory and view for `spec`; returns the attachment index
    pub fn create_attachment(&mut self, spec: &AttachmentSpec) -> VulkanResult<usize> {
        if is_depth_format(spec.format) && self.attachments.has_depth() {
            debug_assert!(false, "framebuffer already has a depth attachment");
            return Err(VulkanError::MultipleDepthAttachments);
        }

        let flags = if spec.view_type == vk::ImageViewType::CUBE {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(spec.format)
            .extent(vk::Extent3D {
                width: spec.width,
                height: spec.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(spec.layer_count)
            .samples(spec.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(spec.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let device = self.device().clone();
        let image = unsafe { device.create_image(&image_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = match self
            .allocator
            .allocate(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL, false)
        {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .and_then(|()| {
                    let view_info = vk::ImageViewCreateInfo::builder()
                        .image(image)
                        .view_type(spec.view_type)
                        .format(spec.format)
                        .subresource_range(spec.subresource_range());
                    device.create_image_view(&view_info, None)
                })
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(e.into());
            }
        };

        log::debug!(
            "Created {:?} attachment {}x{}x{}",
            spec.format,
            spec.width,
            spec.height,
            spec.layer_count
        );
        self.attachments.push(Attachment::owned(*spec, image, memory, view))
    }

    /// Record an attachment whose view is owned by another framebuffer
    pub fn add_load_attachment(&mut self, spec: &AttachmentSpec, view: vk::ImageView) -> VulkanResult<usize> {
        self.attachments.push(Attachment::borrowed(*spec, view))
    }

    /// Build the render pass and framebuffer object from the recorded attachments
    pub fn create_render_pass(&mut self) -> VulkanResult<()> {
        ensure_unbuilt(self.render_pass.is_some(), self.framebuffer)?;
        let render_pass = RenderPass::new(self.device().clone(), &self.attachments.descriptions())?;
        let layers = self.attachments.max_layer_count();
        self.finish(render_pass, layers)
    }

    /// Multiview variant; the view mask selects the layers each draw reaches
    pub fn create_multiview_render_pass(&mut self, view_mask: u32) -> VulkanResult<()> {
        ensure_unbuilt(self.render_pass.is_some(), self.framebuffer)?;
        let render_pass =
            RenderPass::new_multiview(self.device().clone(), &self.attachments.descriptions(), view_mask)?;
        self.finish(render_pass, 1)
    }

    fn finish(&mut self, render_pass: RenderPass, layers: u32) -> VulkanResult<()> {
        let extent = self.attachments.extent().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "render pass requested for a framebuffer without attachments".to_string(),
        })?;
        let views = self.attachments.views();
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle())
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(layers);
        self.framebuffer = unsafe { self.device().create_framebuffer(&framebuffer_info, None)? };

        let sampled = (0..self.attachments.len())
            .filter_map(|i| self.attachments.get(i))
            .any(|a| a.spec.usage.contains(vk::ImageUsageFlags::SAMPLED));
        if sampled && self.sampler == vk::Sampler::null() {
            let sampler_info = vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .max_lod(1.0)
                .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
            self.sampler = unsafe { self.device().create_sampler(&sampler_info, None)? };
        }

        self.render_pass = Some(render_pass);
        Ok(())
    }

    /// Destroy owned attachments, the render pass, framebuffer and sampler
    ///
    /// Borrowed views are forgotten, never destroyed. The framebuffer is left
    /// empty and ready for a new attachment sequence.
    pub fn clear_framebuffer(&mut self) {
        let device = self.allocator.device().clone();
        unsafe {
            if self.framebuffer != vk::Framebuffer::null() {
                device.destroy_framebuffer(self.framebuffer, None);
                self.framebuffer = vk::Framebuffer::null();
            }
            if self.sampler != vk::Sampler::null() {
                device.destroy_sampler(self.sampler, None);
                self.sampler = vk::Sampler::null();
            }
        }
        self.render_pass = None;
        for handles in self.attachments.drain_owned() {
            unsafe {
                device.destroy_image_view(handles.view, None);
                device.destroy_image(handles.image, None);
                device.free_memory(handles.memory, None);
            }
        }
    }

    /// Render pass; fails before `create_render_pass`
    pub fn render_pass(&self) -> VulkanResult<&RenderPass> {
        self.render_pass.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "framebuffer has no render pass yet".to_string(),
        })
    }

    /// Begin info with full-extent viewport and scissor
    pub fn render_info(&self, clear_values: Vec<vk::ClearValue>) -> VulkanResult<RenderInfo> {
        Ok(RenderInfo::full_extent(
            self.render_pass()?,
            self.framebuffer,
            self.extent(),
            clear_values,
        ))
    }

    /// Framebuffer handle
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Sampler for attachments created with `SAMPLED` usage
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Extent of the attachments, zero when empty
    pub fn extent(&self) -> vk::Extent2D {
        self.attachments.extent().unwrap_or_default()
    }

    /// Attachment at `index`
    pub fn attachment(&self, index: usize) -> Option<&Attachment> {
        self.attachments.get(index)
    }

    /// All attachments
    pub fn attachments(&self) -> &AttachmentSet {
        &self.attachments
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.clear_framebuffer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const EXTENT: vk::Extent2D = vk::Extent2D { width: 640, height: 480 };

    fn owned(spec: AttachmentSpec, raw: u64) -> Attachment {
        Attachment::owned(
            spec,
            vk::Image::from_raw(raw),
            vk::DeviceMemory::from_raw(raw + 100),
            vk::ImageView::from_raw(raw + 200),
        )
    }

    #[test]
    fn test_aspect_mask_follows_usage() {
        let usage = vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        assert_eq!(
            aspect_mask_for(vk::Format::D24_UNORM_S8_UINT, usage),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask_for(vk::Format::D32_SFLOAT, usage), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask_for(vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn test_loaded_spec_keeps_previous_contents() {
        let depth = AttachmentSpec::depth(vk::Format::D32_SFLOAT_S8_UINT, EXTENT).loaded();
        let description = depth.description();
        assert_eq!(description.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(description.stencil_load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(description.initial_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "already has a depth attachment"))]
    fn test_second_depth_attachment_rejected() {
        let mut set = AttachmentSet::default();
        set.push(owned(AttachmentSpec::depth(vk::Format::D32_SFLOAT, EXTENT), 1)).unwrap();
        let result = set.push(owned(AttachmentSpec::depth(vk::Format::D32_SFLOAT, EXTENT), 2));
        assert!(matches!(result, Err(VulkanError::MultipleDepthAttachments)));
    }

    #[test]
    fn test_drain_releases_only_owned_attachments() {
        let mut set = AttachmentSet::default();
        let color = AttachmentSpec::color(vk::Format::R8G8B8A8_UNORM, EXTENT);
        let depth = AttachmentSpec::depth(vk::Format::D32_SFLOAT_S8_UINT, EXTENT).loaded();
        let borrowed_view = vk::ImageView::from_raw(999);

        assert_eq!(set.push(owned(color, 1)).unwrap(), 0);
        assert_eq!(set.push(Attachment::borrowed(depth, borrowed_view)).unwrap(), 1);
        assert_eq!(set.depth_index(), Some(1));

        let released = set.drain_owned();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].image, vk::Image::from_raw(1));
        assert!(released.iter().all(|h| h.view != borrowed_view));

        // a second clear finds nothing left to free
        assert!(set.is_empty());
        assert!(set.drain_owned().is_empty());
        assert!(!set.has_depth());
    }

    #[test]
    fn test_layer_count_and_extent() {
        let mut set = AttachmentSet::default();
        let cube = AttachmentSpec::depth(vk::Format::D32_SFLOAT, vk::Extent2D { width: 1024, height: 1024 })
            .with_layers(6, vk::ImageViewType::CUBE);
        set.push(owned(cube, 1)).unwrap();
        assert_eq!(set.max_layer_count(), 6);
        assert_eq!(set.extent(), Some(vk::Extent2D { width: 1024, height: 1024 }));
        assert_eq!(cube.subresource_range().layer_count, 6);
    }

    #[test]
    fn test_rebuild_over_live_handles_rejected() {
        assert!(ensure_unbuilt(false, vk::Framebuffer::null()).is_ok());
        assert!(matches!(
            ensure_unbuilt(true, vk::Framebuffer::null()),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert!(matches!(
            ensure_unbuilt(false, vk::Framebuffer::from_raw(7)),
            Err(VulkanError::InvalidOperation { .. })
        ));
    }
}
