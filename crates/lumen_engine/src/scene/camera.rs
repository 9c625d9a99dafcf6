//! # 3D Camera
//!
//! Perspective camera producing view and Vulkan-ready projection matrices.
//!
//! View space is right-handed Y-up looking down -Z. The projection folds in
//! the Y/Z flip into Vulkan clip space, so shaders use `proj * view * model`.

use crate::foundation::math::{utils, Mat4, Mat4Ext, Vec3};

/// 3D perspective camera
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    /// Camera position in world space
    pub position: Vec3,

    /// Point the camera is looking at in world space
    pub target: Vec3,

    /// Up vector for camera orientation (typically [0, 1, 0])
    pub up: Vec3,

    /// Vertical field of view in radians
    pub fov: f32,

    /// Aspect ratio (width / height)
    pub aspect: f32,

    /// Distance to near clipping plane
    pub near: f32,

    /// Distance to far clipping plane
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self::perspective(Vec3::new(0.0, 2.0, 6.0), 60.0, 16.0 / 9.0, 0.1, 100.0)
    }
}

impl Camera {
    /// Create a perspective camera looking at the origin
    pub fn perspective(position: Vec3, fov_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            target: Vec3::zeros(),
            up: Vec3::new(0.0, 1.0, 0.0),
            fov: utils::deg_to_rad(fov_degrees),
            aspect,
            near,
            far,
        }
    }

    /// Point the camera at `target` with the given up vector
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        self.target = target;
        self.up = up;
        log::trace!("Camera look_at updated - target: {:?}, up: {:?}", target, up);
    }

    /// Update the aspect ratio from a framebuffer extent
    ///
    /// Zero-height extents (minimized window) leave the aspect untouched.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    /// World-to-view matrix
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at(self.position, self.target, self.up)
    }

    /// View-to-clip matrix including the Vulkan axis flip
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective(self.fov, self.aspect, self.near, self.far) * Mat4::vulkan_coordinate_transform()
    }

    /// Combined `projection * view`
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec4;
    use approx::assert_relative_eq;

    #[test]
    fn test_target_projects_to_screen_centre() {
        let camera = Camera::perspective(Vec3::new(0.0, 0.0, 5.0), 60.0, 1.0, 0.1, 100.0);
        let clip = camera.view_projection_matrix() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(clip.x / clip.w, 0.0, epsilon = 1e-6);
        assert_relative_eq!(clip.y / clip.w, 0.0, epsilon = 1e-6);
        let depth = clip.z / clip.w;
        assert!(depth > 0.0 && depth < 1.0);
    }

    #[test]
    fn test_world_up_maps_to_negative_clip_y() {
        let camera = Camera::perspective(Vec3::new(0.0, 0.0, 5.0), 60.0, 1.0, 0.1, 100.0);
        let clip = camera.view_projection_matrix() * Vec4::new(0.0, 1.0, 0.0, 1.0);
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn test_set_viewport_ignores_zero_extent() {
        let mut camera = Camera::default();
        camera.set_viewport(640, 480);
        assert_relative_eq!(camera.aspect, 640.0 / 480.0);
        camera.set_viewport(0, 0);
        assert_relative_eq!(camera.aspect, 640.0 / 480.0);
    }
}
