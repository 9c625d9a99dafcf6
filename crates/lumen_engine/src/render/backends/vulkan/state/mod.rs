// Vulkan state management: presentation, frame pacing and render targets

pub mod framebuffer;
pub mod framebuffer_arena;
pub mod frame_pacer;
pub mod presenter;
pub mod swapchain;
pub mod sync;

pub use framebuffer::*;
pub use framebuffer_arena::*;
pub use frame_pacer::*;
pub use presenter::*;
pub use swapchain::*;
pub use sync::*;
