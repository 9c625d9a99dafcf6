//! Window management using GLFW
//!
//! Provides the window, the Vulkan surface and the event pump. The renderer
//! only sees the window through [`SurfaceExtentSource`] while it waits out a
//! minimized state.

mod event;

pub use event::{Event, MouseButton};

use ash::vk;
use thiserror::Error;

/// Window management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// `glfwInit` failed
    #[error("GLFW initialization failed")]
    InitializationFailed,

    /// `glfwCreateWindow` failed
    #[error("Window creation failed")]
    CreationFailed,

    /// Any other GLFW failure
    #[error("GLFW error: {0}")]
    GlfwError(String),
}

/// Result alias for window operations
pub type WindowResult<T> = Result<T, WindowError>;

/// Something that knows the drawable extent and can block for the next event
pub trait SurfaceExtentSource {
    /// Current drawable extent in pixels
    fn framebuffer_extent(&self) -> vk::Extent2D;

    /// Block until at least one window event arrives
    fn wait_events(&mut self);
}

/// Block until the drawable extent is non-zero, e.g. until a minimized window is restored
pub fn wait_for_nonzero_extent(source: &mut impl SurfaceExtentSource) -> vk::Extent2D {
    let mut extent = source.framebuffer_extent();
    while extent.width == 0 || extent.height == 0 {
        log::debug!("Framebuffer is {}x{}, waiting for restore", extent.width, extent.height);
        source.wait_events();
        extent = source.framebuffer_extent();
    }
    extent
}

/// Factor from screen coordinates to framebuffer pixels on each axis
///
/// HiDPI displays report cursor positions in screen coordinates while the
/// swapchain is sized in pixels. A zero-sized window scales by one.
pub fn pixel_scale(window_size: (i32, i32), framebuffer_size: (i32, i32)) -> (f64, f64) {
    let axis = |window: i32, framebuffer: i32| {
        if window <= 0 || framebuffer <= 0 {
            1.0
        } else {
            f64::from(framebuffer) / f64::from(window)
        }
    };
    (
        axis(window_size.0, framebuffer_size.0),
        axis(window_size.1, framebuffer_size.1),
    )
}

/// GLFW window wrapper
pub struct Window {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
    framebuffer_resized: bool,
}

impl Window {
    /// Create a resizable window with no client API
    pub fn new(title: &str, width: u32, height: u32) -> WindowResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors)
            .map_err(|_| WindowError::InitializationFailed)?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(width, height, title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_key_polling(true);
        window.set_mouse_button_polling(true);
        window.set_cursor_pos_polling(true);
        window.set_scroll_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        log::info!("Created window '{}' ({}x{})", title, width, height);

        Ok(Self {
            glfw,
            window,
            events,
            framebuffer_resized: false,
        })
    }

    /// Whether the user asked to close the window
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Request or cancel closing
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Pump pending events, handing each one to `handler` before returning
    pub fn poll_events(&mut self, mut handler: impl FnMut(&Event)) {
        self.glfw.poll_events();
        for (_, raw) in glfw::flush_messages(&self.events) {
            let Some(event) = Event::from_glfw(&raw) else {
                continue;
            };
            if matches!(event, Event::Resized { .. }) {
                self.framebuffer_resized = true;
            }
            handler(&event);
        }
    }

    /// Whether the framebuffer changed size since the last reset
    pub fn was_resized(&self) -> bool {
        self.framebuffer_resized
    }

    /// Clear the resize flag after the swapchain has caught up
    pub fn reset_resized_flag(&mut self) {
        self.framebuffer_resized = false;
    }

    /// Change the window size; the framebuffer follows on the next event pump
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.window.set_size(
            i32::try_from(width).unwrap_or(i32::MAX),
            i32::try_from(height).unwrap_or(i32::MAX),
        );
    }

    /// Convert a cursor position from screen coordinates to framebuffer pixels
    pub fn to_framebuffer_pixels(&self, (x, y): (f64, f64)) -> (f64, f64) {
        let (sx, sy) = pixel_scale(self.window.get_size(), self.window.get_framebuffer_size());
        (x * sx, y * sy)
    }

    /// Get required Vulkan instance extensions from GLFW
    pub fn required_instance_extensions(&self) -> WindowResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| WindowError::GlfwError("Failed to get required extensions".to_string()))
    }

    /// Create a Vulkan surface for this window
    pub fn create_vulkan_surface(&self, instance: vk::Instance) -> WindowResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self.window.create_window_surface(instance, std::ptr::null(), &mut surface);

        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(WindowError::GlfwError(format!("Failed to create Vulkan surface: {:?}", result)))
        }
    }
}

impl SurfaceExtentSource for Window {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        let (width, height) = self.window.get_framebuffer_size();
        vk::Extent2D {
            width: u32::try_from(width).unwrap_or(0),
            height: u32::try_from(height).unwrap_or(0),
        }
    }

    fn wait_events(&mut self) {
        self.glfw.wait_events();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_scale() {
        assert_eq!(pixel_scale((800, 600), (1600, 1200)), (2.0, 2.0));
        assert_eq!(pixel_scale((800, 600), (800, 600)), (1.0, 1.0));
        assert_eq!(pixel_scale((0, 0), (0, 0)), (1.0, 1.0));
    }

    /// Reports zero until `restore_after` waits have happened
    struct MinimizedWindow {
        waits: usize,
        restore_after: usize,
    }

    impl SurfaceExtentSource for MinimizedWindow {
        fn framebuffer_extent(&self) -> vk::Extent2D {
            if self.waits >= self.restore_after {
                vk::Extent2D { width: 800, height: 600 }
            } else {
                vk::Extent2D { width: 0, height: 0 }
            }
        }

        fn wait_events(&mut self) {
            self.waits += 1;
        }
    }

    #[test]
    fn test_wait_blocks_until_restored() {
        let mut window = MinimizedWindow { waits: 0, restore_after: 3 };
        let extent = wait_for_nonzero_extent(&mut window);
        assert_eq!(window.waits, 3);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_wait_returns_immediately_when_visible() {
        let mut window = MinimizedWindow { waits: 0, restore_after: 0 };
        wait_for_nonzero_extent(&mut window);
        assert_eq!(window.waits, 0);
    }
}
