//! Vulkan backend implementation
//!
//! Organized into initialization, resources, rendering and state modules.

/// Vulkan initialization types (instance, device, context)
pub mod initialization;

/// Vulkan resource management (memory, buffers, descriptors, uploads)
pub mod resources;

/// Vulkan rendering operations (shaders, pipelines, render passes, commands)
pub mod rendering;

/// Presentation, synchronization and render targets
pub mod state;

// Re-export core initialization types
pub use initialization::context::{PhysicalDeviceInfo, VulkanContext, VulkanError, VulkanResult};

// Re-export resource types
pub use resources::{
    Buffer, DescriptorBudget, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    MemoryAllocator, MeshRegistry, UploadQueue,
};

// Re-export rendering types
pub use rendering::{
    ActiveRenderPass, CommandPool, CommandRecorder, GraphicsPipeline, GraphicsPipelineBuilder, RenderInfo, RenderPass,
    ShaderModule,
};

// Re-export state types
pub use state::{
    AttachmentRef, AttachmentSpec, Fence, Framebuffer, FramebufferArena, FramebufferId, FrameEnd, FrameStart,
    FrameSync, Presenter, Semaphore, Swapchain,
};
