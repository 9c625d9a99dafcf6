//! Scene components
//!
//! Pure data. Render systems read them; only editor tooling writes back.

use crate::foundation::math::{Mat4, Quat, Transform, Vec3};
use crate::render::mesh::MeshHandle;

use super::camera::Camera;

/// World-space placement of an entity
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformComponent {
    /// Position, rotation and scale
    pub transform: Transform,
}

impl TransformComponent {
    /// Create from position only
    pub fn from_position(position: Vec3) -> Self {
        Self {
            transform: Transform::from_position(position),
        }
    }

    /// Builder-style rotation
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.transform.rotation = rotation;
        self
    }

    /// Builder-style uniform scale
    pub fn with_uniform_scale(mut self, scale: f32) -> Self {
        self.transform.scale = Vec3::new(scale, scale, scale);
        self
    }

    /// Model matrix (TRS)
    pub fn matrix(&self) -> Mat4 {
        self.transform.to_matrix()
    }
}

/// Reference to a mesh uploaded to the GPU mesh registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshComponent {
    /// Registry handle
    pub mesh: MeshHandle,
}

/// Omnidirectional light; casts a cube shadow
#[derive(Debug, Clone, PartialEq)]
pub struct PointLightComponent {
    /// Linear RGB color
    pub color: Vec3,
    /// Intensity multiplier
    pub intensity: f32,
    /// Distance beyond which the light contributes nothing
    pub radius: f32,
}

impl Default for PointLightComponent {
    fn default() -> Self {
        Self {
            color: Vec3::new(1.0, 1.0, 1.0),
            intensity: 1.0,
            radius: 10.0,
        }
    }
}

/// Camera attached to an entity; the renderer uses the first one it finds
/// unless the caller passes an explicit camera.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CameraComponent {
    /// Camera parameters
    pub camera: Camera,
}

/// Display name for editor panels
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameComponent(pub String);
