//! Rendering backends

/// Vulkan backend
pub mod vulkan;
