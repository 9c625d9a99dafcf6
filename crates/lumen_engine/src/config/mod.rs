//! Configuration system
//!
//! Config structs are plain serde types loadable from `.toml` or `.ron`.

mod settings;

pub use serde::{Deserialize, Serialize};
pub use settings::{
    ApplicationConfig, EngineConfig, PresentModePreference, RendererConfig, WindowConfig,
};

use std::path::Path;

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file, picking the format from the extension
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => {
                toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            ConfigFormat::Ron => {
                ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
            }
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            ConfigFormat::Ron => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
        };

        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Ron,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("ron") => Ok(Self::Ron),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value parsed fine but is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a/b.toml")).ok(), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_path(Path::new("b.ron")).ok(), Some(ConfigFormat::Ron));
        assert!(matches!(
            ConfigFormat::from_path(Path::new("b.json")),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_toml_and_ron_round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("lumen_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut config = ApplicationConfig::default();
        config.window.width = 640;
        config.renderer.present_mode = PresentModePreference::Mailbox;

        for name in ["editor.toml", "editor.ron"] {
            let path = dir.join(name);
            config.save_to_file(&path).unwrap();
            let loaded = ApplicationConfig::load_from_file(&path).unwrap();
            assert_eq!(loaded.window.width, 640);
            assert_eq!(loaded.renderer.present_mode, PresentModePreference::Mailbox);
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = ApplicationConfig::load_from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
