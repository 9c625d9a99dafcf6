//! Swapchain creation and the surface negotiation rules behind it

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use super::{AttachmentSpec, Framebuffer};
use crate::config::PresentModePreference;
use crate::render::backends::vulkan::rendering::RenderInfo;
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Depth formats tried for swapchain and offscreen depth, stencil first
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT,
];

/// Result of acquiring the next presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Image ready
    Ready(u32),
    /// Image usable, but the swapchain should be rebuilt after presenting
    Suboptimal(u32),
    /// Surface changed; nothing was acquired
    OutOfDate,
}

/// Result of presenting an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly
    Suboptimal,
    /// Surface changed; the swapchain must be rebuilt
    OutOfDate,
}

/// Map the raw acquire result; anything but staleness is a hard error
pub fn classify_acquire(result: Result<(u32, bool), vk::Result>) -> VulkanResult<AcquireOutcome> {
    match result {
        Ok((index, false)) => Ok(AcquireOutcome::Ready(index)),
        Ok((index, true)) => Ok(AcquireOutcome::Suboptimal(index)),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(e) => Err(VulkanError::Api(e)),
    }
}

/// Map the raw present result; anything but staleness is a hard error
pub fn classify_present(result: Result<bool, vk::Result>) -> VulkanResult<PresentOutcome> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(PresentOutcome::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
        Err(e) => Err(VulkanError::Api(e)),
    }
}

/// Prefer sRGB BGRA8, otherwise the first format the surface offers
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_SRGB && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| available.first())
        .copied()
}

/// FIFO unless the configuration opts into a mode the surface supports
pub fn choose_present_mode(
    preference: PresentModePreference,
    available: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    let wanted = match preference {
        PresentModePreference::Fifo => return vk::PresentModeKHR::FIFO,
        PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
    };
    if available.contains(&wanted) {
        wanted
    } else {
        log::info!("Present mode {:?} unavailable, falling back to FIFO", wanted);
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent, or the window extent clamped to the surface limits
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window_extent
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window_extent
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (zero means unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

/// First candidate usable as an optimal-tiling depth attachment
pub fn choose_depth_format(supports: impl Fn(vk::Format) -> bool) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES.into_iter().find(|&format| supports(format))
}

/// Depth format supported by the context's device
pub fn find_depth_format(context: &VulkanContext) -> VulkanResult<vk::Format> {
    choose_depth_format(|format| {
        let props = unsafe {
            context
                .instance()
                .get_physical_device_format_properties(context.physical_device().device, format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
    .ok_or_else(|| VulkanError::InitializationFailed("No supported depth format".to_string()))
}

/// Color and depth formats a swapchain was built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainFormats {
    /// Presentable color format
    pub color: vk::Format,
    /// Per-image depth format
    pub depth: vk::Format,
}

/// Fail when a rebuilt swapchain changed formats under existing pipelines
pub fn ensure_formats_compatible(old: SwapchainFormats, new: SwapchainFormats) -> VulkanResult<()> {
    if old.color != new.color {
        return Err(VulkanError::SwapchainFormatChanged {
            old: old.color,
            new: new.color,
        });
    }
    if old.depth != new.depth {
        return Err(VulkanError::SwapchainFormatChanged {
            old: old.depth,
            new: new.depth,
        });
    }
    Ok(())
}

/// Presentable images with one color+depth framebuffer each
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<Framebuffer>,
    formats: SwapchainFormats,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    /// Create a swapchain, handing `old` to the driver for a smooth transition
    pub fn new(
        context: &VulkanContext,
        window_extent: vk::Extent2D,
        preference: PresentModePreference,
        old: Option<&Self>,
    ) -> VulkanResult<Self> {
        let physical = context.physical_device().device;
        let surface = context.surface();
        let surface_loader = context.surface_loader();

        let caps = unsafe { surface_loader.get_physical_device_surface_capabilities(physical, surface)? };
        let surface_formats = unsafe { surface_loader.get_physical_device_surface_formats(physical, surface)? };
        let present_modes = unsafe { surface_loader.get_physical_device_surface_present_modes(physical, surface)? };

        let format = choose_surface_format(&surface_formats)
            .ok_or_else(|| VulkanError::InitializationFailed("Surface reports no formats".to_string()))?;
        let present_mode = choose_present_mode(preference, &present_modes);
        let extent = choose_extent(&caps, window_extent);
        let image_count = choose_image_count(&caps);
        let depth_format = find_depth_format(context)?;

        let families = [
            context.physical_device().graphics_family,
            context.physical_device().present_family,
        ];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or_else(vk::SwapchainKHR::null, Self::handle));
        create_info = if families[0] == families[1] {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        };

        let loader = context.swapchain_loader().clone();
        let device = context.device().clone();
        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };

        let mut result = Self {
            device,
            loader,
            swapchain,
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            formats: SwapchainFormats {
                color: format.format,
                depth: depth_format,
            },
            extent,
            present_mode,
        };

        let images = unsafe { result.loader.get_swapchain_images(swapchain)? };
        let color_spec = AttachmentSpec {
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..AttachmentSpec::color(format.format, extent)
        };
        let depth_spec = AttachmentSpec {
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            ..AttachmentSpec::depth(depth_format, extent)
        };
        let allocator = context.allocator();

        for image in images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(color_spec.subresource_range());
            let view = unsafe { result.device.create_image_view(&view_info, None)? };
            result.image_views.push(view);

            let mut framebuffer = Framebuffer::new(&allocator);
            framebuffer.add_load_attachment(&color_spec, view)?;
            framebuffer.create_attachment(&depth_spec)?;
            framebuffer.create_render_pass()?;
            result.framebuffers.push(framebuffer);
        }

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}, depth {:?}, {:?}",
            extent.width,
            extent.height,
            result.image_views.len(),
            format.format,
            depth_format,
            present_mode
        );
        Ok(result)
    }

    /// Begin info for rendering into image `image_index`
    pub fn render_info(&self, image_index: u32, clear_color: [f32; 4]) -> VulkanResult<RenderInfo> {
        let clear_values = vec![
            vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        ];
        self.framebuffer(image_index)?.render_info(clear_values)
    }

    /// Framebuffer of image `image_index`
    pub fn framebuffer(&self, image_index: u32) -> VulkanResult<&Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("swapchain image {} out of range", image_index),
            })
    }

    /// Acquire the next image, signaling `semaphore` when it is ready
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> VulkanResult<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };
        classify_acquire(result)
    }

    /// Present `image_index` once `wait` is signaled
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: vk::Semaphore) -> VulkanResult<PresentOutcome> {
        let wait_semaphores = [wait];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        classify_present(unsafe { self.loader.queue_present(queue, &present_info) })
    }

    /// Swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Color and depth formats
    pub fn formats(&self) -> SwapchainFormats {
        self.formats
    }

    /// Number of presentable images
    pub fn image_count(&self) -> usize {
        self.image_views.len()
    }

    /// Present mode in use
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.framebuffers.clear();
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 2048 },
            ..Default::default()
        }
    }

    #[test]
    fn test_acquire_classification() {
        assert_eq!(classify_acquire(Ok((2, false))).unwrap(), AcquireOutcome::Ready(2));
        assert_eq!(classify_acquire(Ok((1, true))).unwrap(), AcquireOutcome::Suboptimal(1));
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert!(matches!(
            classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn test_present_classification() {
        assert_eq!(classify_present(Ok(false)).unwrap(), PresentOutcome::Presented);
        assert_eq!(classify_present(Ok(true)).unwrap(), PresentOutcome::Suboptimal);
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentOutcome::OutOfDate
        );
        assert!(classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
    }

    #[test]
    fn test_present_mode_defaults_to_fifo() {
        let all = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(PresentModePreference::Fifo, &all), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(PresentModePreference::Mailbox, &all), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(PresentModePreference::Immediate, &[vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_surface_format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_extent_uses_surface_or_clamps_window() {
        let fixed = caps((800, 600), 2, 3);
        assert_eq!(
            choose_extent(&fixed, vk::Extent2D { width: 1280, height: 720 }),
            vk::Extent2D { width: 800, height: 600 }
        );
        let free = caps((u32::MAX, u32::MAX), 2, 3);
        assert_eq!(
            choose_extent(&free, vk::Extent2D { width: 5000, height: 720 }),
            vk::Extent2D { width: 4096, height: 720 }
        );
    }

    #[test]
    fn test_image_count() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 0)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 2, 2)), 2);
    }

    #[test]
    fn test_depth_format_prefers_stencil() {
        assert_eq!(choose_depth_format(|_| true), Some(vk::Format::D32_SFLOAT_S8_UINT));
        assert_eq!(
            choose_depth_format(|f| f == vk::Format::D32_SFLOAT),
            Some(vk::Format::D32_SFLOAT)
        );
        assert_eq!(choose_depth_format(|_| false), None);
    }

    #[test]
    fn test_format_change_is_fatal() {
        let a = SwapchainFormats {
            color: vk::Format::B8G8R8A8_SRGB,
            depth: vk::Format::D32_SFLOAT_S8_UINT,
        };
        let b = SwapchainFormats {
            depth: vk::Format::D24_UNORM_S8_UINT,
            ..a
        };
        assert!(ensure_formats_compatible(a, a).is_ok());
        assert!(matches!(
            ensure_formats_compatible(a, b),
            Err(VulkanError::SwapchainFormatChanged {
                old: vk::Format::D32_SFLOAT_S8_UINT,
                new: vk::Format::D24_UNORM_S8_UINT,
            })
        ));
    }
}
