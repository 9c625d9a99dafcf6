//! Rendering: Vulkan backend, frame data, render systems and the renderer

pub mod backends;
pub mod frame;
pub mod globals;
pub mod mesh;
pub mod renderer;
pub mod systems;

pub use frame::{DrawItem, FrameInfo, LightItem};
pub use mesh::{Mesh, MeshHandle, Vertex};
pub use renderer::{FrameOutcome, Renderer};
pub use systems::{PickResult, RenderSystem, UiOverlay};
