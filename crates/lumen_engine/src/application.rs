//! Editor application loop
//!
//! Owns the window, the scene, input state and the renderer. Each iteration
//! pumps events, turns left clicks into pick requests, draws a frame and
//! applies finished picks to the selection.

use thiserror::Error;

use crate::config::{ApplicationConfig, ConfigError};
use crate::foundation::time::Timer;
use crate::input::InputState;
use crate::render::backends::vulkan::VulkanError;
use crate::render::{Renderer, UiOverlay};
use crate::scene::{Camera, Scene};
use crate::window::{Event, MouseButton, Window, WindowError};

/// Application-level errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Renderer or device failure
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] VulkanError),

    /// Window system failure
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Window, scene and renderer driven by one loop
pub struct Application {
    // Renderer holds the surface of the window; drop it first
    renderer: Renderer,
    window: Window,
    scene: Scene,
    input: InputState,
    timer: Timer,
    fallback_camera: Camera,
}

impl Application {
    /// Validate `config`, open the window and create the renderer
    pub fn new(config: &ApplicationConfig) -> Result<Self, AppError> {
        config.validate()?;
        let mut window = Window::new(&config.window.title, config.window.width, config.window.height)?;
        let renderer = Renderer::new(&mut window, &config.renderer)?;
        Ok(Self {
            renderer,
            window,
            scene: Scene::new(),
            input: InputState::new(),
            timer: Timer::new(),
            fallback_camera: Camera::default(),
        })
    }

    /// Scene being edited
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    /// Renderer, e.g. for mesh uploads
    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    /// Scene and renderer together, for building content
    pub fn scene_and_renderer(&mut self) -> (&mut Scene, &mut Renderer) {
        (&mut self.scene, &mut self.renderer)
    }

    /// Run until the window closes
    pub fn run(&mut self, overlay: &mut dyn UiOverlay) -> Result<(), AppError> {
        log::info!("Entering main loop");
        while !self.window.should_close() {
            let (mut close, mut deselect) = (false, false);
            let input = &mut self.input;
            self.window.poll_events(|event| {
                match event {
                    Event::CloseRequested => close = true,
                    Event::Key {
                        key: glfw::Key::Escape,
                        pressed: true,
                    } => deselect = true,
                    _ => {}
                }
                input.handle_event(event);
            });
            if close {
                self.window.set_should_close(true);
            }
            if deselect {
                self.renderer.select(None);
            }

            for (button, x, y) in self.input.take_clicks() {
                if button == MouseButton::Left {
                    let cursor = self.window.to_framebuffer_pixels((x, y));
                    self.renderer.request_pick(cursor);
                }
            }

            let frame_time = self.timer.tick();
            let extent = self.renderer.viewport_extent();
            let mut camera = self.scene.active_camera().unwrap_or(&self.fallback_camera).clone();
            camera.set_viewport(extent.width, extent.height);

            self.renderer
                .draw_frame(&mut self.window, &self.scene, &camera, frame_time, overlay)?;

            if let Some(result) = self.renderer.take_pick_result() {
                let selection = result.entity();
                log::info!("Picked {:?}", selection);
                self.renderer.select(selection);
            }
        }

        self.renderer.wait_idle()?;
        log::info!(
            "Main loop finished after {} frames ({:.1} fps average)",
            self.timer.frame_count(),
            self.timer.average_fps()
        );
        Ok(())
    }
}
