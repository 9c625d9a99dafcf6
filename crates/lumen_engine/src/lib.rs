//! # Lumen Engine
//!
//! A Vulkan renderer with an entity-component scene, built for an editor.
//!
//! ## Features
//!
//! - **Multi-pass frames**: depth pre-pass, cube shadows, lit geometry, light
//!   billboards, selection outline, UI composite and cursor picking
//! - **Optional ray tracing**: hardware ray traced viewport when the device
//!   supports it
//! - **Resize-safe targets**: offscreen framebuffers live in an arena with
//!   stable ids, so passes that borrow attachments survive swapchain rebuilds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lumen_engine::prelude::*;
//!
//! fn main() -> Result<(), AppError> {
//!     let config = ApplicationConfig::default();
//!     let mut app = Application::new(&config)?;
//!     let (scene, renderer) = app.scene_and_renderer();
//!     let cube = renderer.upload_mesh(&Mesh::cube(Vec3::new(0.8, 0.3, 0.2)))?;
//!     let entity = scene.create_entity();
//!     scene.insert(entity, TransformComponent::default());
//!     scene.insert(entity, MeshComponent { mesh: cube });
//!     app.run(&mut ())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod input;
pub mod render;
pub mod scene;
pub mod window;

mod application;

pub use application::{AppError, Application};

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{ApplicationConfig, Config, RendererConfig},
        foundation::{
            math::{Mat4, Quat, Vec3},
            time::Timer,
        },
        input::InputState,
        render::{FrameOutcome, Mesh, MeshHandle, PickResult, Renderer, UiOverlay},
        scene::{
            Camera, CameraComponent, Entity, MeshComponent, NameComponent, PointLightComponent, Scene,
            TransformComponent,
        },
        window::{Event, MouseButton, Window},
        AppError, Application,
    };
}
