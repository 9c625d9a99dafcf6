//! Application, window and renderer settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{Config, ConfigError};
use crate::render::frame::MAX_POINT_LIGHTS;

/// Presentation mode preference
///
/// `Fifo` is always available. The others are opt-in and fall back to
/// `Fifo` when the surface does not offer them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PresentModePreference {
    /// V-Sync
    #[default]
    Fifo,
    /// Triple-buffered, no tearing
    Mailbox,
    /// No synchronization, may tear
    Immediate,
}

/// Core engine behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default log filter, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Window creation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window title
    pub title: String,
    /// Initial width in screen coordinates
    pub width: u32,
    /// Initial height in screen coordinates
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Lumen Editor".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// # Renderer Configuration
///
/// Vulkan backend settings: frame pacing, presentation, pass parameters and
/// where to find compiled shaders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Number of frame slots recorded ahead of the GPU
    pub max_frames_in_flight: usize,
    /// Requested presentation mode
    pub present_mode: PresentModePreference,
    /// Whether to enable Vulkan validation layers (`None` follows the build type)
    pub enable_validation: Option<bool>,
    /// Clear color of the offscreen viewport
    pub clear_color: [f32; 4],
    /// Edge length of each shadow cube face in texels
    pub shadow_map_size: u32,
    /// Number of point lights uploaded to the global uniform buffer
    pub max_point_lights: usize,
    /// Use the hardware ray tracing path when the device supports it
    pub enable_ray_tracing: bool,
    /// Uniform scale applied to the selected mesh for the outline
    pub outline_scale: f32,
    /// Capacity of the dynamic per-object uniform buffer
    pub max_objects: usize,
    /// Directories searched for compiled `.spv` files, in order
    pub shader_dirs: Vec<PathBuf>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Lumen Application")
    }
}

impl RendererConfig {
    /// Create a renderer configuration with defaults
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            max_frames_in_flight: 2,
            present_mode: PresentModePreference::Fifo,
            enable_validation: None,
            clear_color: [0.01, 0.01, 0.01, 1.0],
            shadow_map_size: 1024,
            max_point_lights: 4,
            enable_ray_tracing: false,
            outline_scale: 1.02,
            max_objects: 1024,
            shader_dirs: vec![PathBuf::from("target/shaders"), PathBuf::from("assets/shaders")],
        }
    }

    /// Set maximum frames in flight
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Set the preferred present mode
    pub fn with_present_mode(mut self, mode: PresentModePreference) -> Self {
        self.present_mode = mode;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Request the ray tracing path
    pub fn with_ray_tracing(mut self, enabled: bool) -> Self {
        self.enable_ray_tracing = enabled;
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Find a compiled shader by file name in the configured directories
    pub fn resolve_shader(&self, file_name: &str) -> Option<PathBuf> {
        self.shader_dirs
            .iter()
            .map(|dir| dir.join(file_name))
            .find(|candidate| Path::new(candidate).is_file())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(invalid("application name cannot be empty"));
        }
        if !(1..=3).contains(&self.max_frames_in_flight) {
            return Err(invalid(format!(
                "max_frames_in_flight must be between 1 and 3, got {}",
                self.max_frames_in_flight
            )));
        }
        if self.shadow_map_size == 0 {
            return Err(invalid("shadow_map_size must be non-zero"));
        }
        if self.max_point_lights == 0 || self.max_point_lights > MAX_POINT_LIGHTS {
            return Err(invalid(format!(
                "max_point_lights must be between 1 and {}, got {}",
                MAX_POINT_LIGHTS, self.max_point_lights
            )));
        }
        if self.max_objects == 0 {
            return Err(invalid("max_objects must be at least 1"));
        }
        if self.outline_scale <= 1.0 {
            return Err(invalid(format!(
                "outline_scale must be greater than 1.0, got {}",
                self.outline_scale
            )));
        }
        Ok(())
    }
}

/// # Complete Application Configuration
///
/// Top-level configuration the editor loads at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Engine core configuration
    pub engine: EngineConfig,
    /// Window configuration
    pub window: WindowConfig,
    /// Rendering system configuration
    pub renderer: RendererConfig,
}

impl ApplicationConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.title.is_empty() {
            return Err(invalid("window title cannot be empty"));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(invalid(format!(
                "window extent must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        self.renderer.validate()
    }
}

impl Config for ApplicationConfig {}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ApplicationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!((config.window.width, config.window.height), (1280, 720));
        assert_eq!(config.renderer.max_frames_in_flight, 2);
        assert_eq!(config.renderer.present_mode, PresentModePreference::Fifo);
    }

    #[test]
    fn test_frames_in_flight_range() {
        for frames in [0, 4] {
            let renderer = RendererConfig::default().with_max_frames_in_flight(frames);
            assert!(matches!(renderer.validate(), Err(ConfigError::Invalid(_))));
        }
        assert!(RendererConfig::default().with_max_frames_in_flight(3).validate().is_ok());
    }

    #[test]
    fn test_zero_window_extent_rejected() {
        let mut config = ApplicationConfig::default();
        config.window.height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_outline_scale_must_grow_mesh() {
        let mut renderer = RendererConfig::default();
        renderer.outline_scale = 1.0;
        assert!(renderer.validate().is_err());
    }

    #[test]
    fn test_point_light_count_bounded_by_shader_array() {
        let mut renderer = RendererConfig::default();
        renderer.max_point_lights = MAX_POINT_LIGHTS + 1;
        assert!(renderer.validate().is_err());
        renderer.max_point_lights = MAX_POINT_LIGHTS;
        assert!(renderer.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ApplicationConfig =
            toml::from_str("[window]\nwidth = 800\n[renderer]\npresent_mode = \"Immediate\"\n").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.renderer.present_mode, PresentModePreference::Immediate);
        assert_eq!(config.renderer.shadow_map_size, 1024);
    }

    #[test]
    fn test_validation_override() {
        assert!(RendererConfig::default().with_validation(true).validation_enabled());
        assert!(!RendererConfig::default().with_validation(false).validation_enabled());
    }
}
