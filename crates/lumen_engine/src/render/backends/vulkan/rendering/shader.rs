//! Shader loading
//!
//! Compiled SPIR-V is looked up by file name in the configured shader
//! directories. A missing file is fatal.

use ash::{vk, Device};
use std::ffi::CStr;
use std::path::Path;

use crate::config::RendererConfig;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Entry point every shader in the engine uses
pub const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Shader module wrapper with RAII cleanup
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
}

impl ShaderModule {
    /// Create shader module from SPIR-V bytecode
    pub fn from_bytes(device: Device, bytes: &[u8], stage: vk::ShaderStageFlags) -> VulkanResult<Self> {
        let words = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid SPIR-V: {}", e)))?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { device.create_shader_module(&create_info, None)? };

        Ok(Self { device, module, stage })
    }

    /// Load shader from a SPIR-V file
    pub fn from_file(device: Device, path: &Path, stage: vk::ShaderStageFlags) -> VulkanResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to read shader {}: {}", path.display(), e))
        })?;
        log::debug!("Loaded shader {}", path.display());
        Self::from_bytes(device, &bytes, stage)
    }

    /// Resolve `file_name` against the configured shader directories and load it
    pub fn load(
        device: Device,
        config: &RendererConfig,
        file_name: &str,
        stage: vk::ShaderStageFlags,
    ) -> VulkanResult<Self> {
        let path = config
            .resolve_shader(file_name)
            .ok_or_else(|| VulkanError::ShaderNotFound(file_name.to_string()))?;
        Self::from_file(device, &path, stage)
    }

    /// Get shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Pipeline stage this module is bound to
    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Create shader stage create info
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage)
            .module(self.module)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_shader_resolves_to_none() {
        let mut config = RendererConfig::default();
        config.shader_dirs = vec![PathBuf::from("/nonexistent/shaders")];
        assert!(config.resolve_shader("simple_shader.vert.spv").is_none());
    }

    #[test]
    fn test_resolution_prefers_earlier_directories() {
        let root = std::env::temp_dir().join(format!("lumen_shaders_{}", std::process::id()));
        let first = root.join("first");
        let second = root.join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join("ui.frag.spv"), [0u8; 4]).unwrap();

        let mut config = RendererConfig::default();
        config.shader_dirs = vec![first.clone(), second.clone()];
        assert_eq!(config.resolve_shader("ui.frag.spv"), Some(second.join("ui.frag.spv")));

        std::fs::write(first.join("ui.frag.spv"), [0u8; 4]).unwrap();
        assert_eq!(config.resolve_shader("ui.frag.spv"), Some(first.join("ui.frag.spv")));

        std::fs::remove_dir_all(&root).ok();
    }
}
