// Vulkan rendering components

pub mod commands;
pub mod pipeline;
pub mod ray_tracing;
pub mod render_pass;
pub mod shader;

pub use commands::*;
pub use pipeline::*;
pub use ray_tracing::*;
pub use render_pass::*;
pub use shader::*;
