//! Math utilities and types
//!
//! Provides fundamental math types for 3D graphics and the Vulkan clip-space
//! conventions used by every render system.

pub use nalgebra::{Matrix3, Matrix4, Quaternion, Unit, Vector3, Vector4};

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Transform representing position, rotation, and scale
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    /// Position in 3D space
    pub position: Vec3,

    /// Rotation quaternion
    pub rotation: Quat,

    /// Scale factors
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Create a transform with only position
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Convert to a transformation matrix (TRS order)
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::new_translation(&self.position)
            * self.rotation.to_homogeneous()
            * Mat4::new_nonuniform_scaling(&self.scale)
    }
}

/// Math constants
pub mod constants {
    /// Pi constant
    pub const PI: f32 = std::f32::consts::PI;

    /// Half pi constant
    pub const HALF_PI: f32 = std::f32::consts::FRAC_PI_2;

    /// Degrees to radians conversion factor
    pub const DEG_TO_RAD: f32 = PI / 180.0;
}

/// Math utility functions
pub mod utils {
    use super::constants;

    /// Convert degrees to radians
    pub fn deg_to_rad(degrees: f32) -> f32 {
        degrees * constants::DEG_TO_RAD
    }
}

/// Extension trait for Mat4 with Vulkan-oriented constructors
pub trait Mat4Ext {
    /// Create a perspective projection matrix with depth mapped to `[0, 1]`
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4;

    /// Create a right-handed look-at view matrix
    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4;

    /// Intermediate transform flipping Y and Z into Vulkan's Y-down, Z-forward clip space
    fn vulkan_coordinate_transform() -> Mat4;

    /// Inverse-transpose of the upper 3x3, widened back to 4x4 for std140 upload
    fn normal_matrix(&self) -> Mat4;
}

impl Mat4Ext for Mat4 {
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        let tan_half_fovy = (fov_y * 0.5).tan();

        let mut result = Mat4::zeros();
        result[(0, 0)] = 1.0 / (aspect * tan_half_fovy);
        result[(1, 1)] = 1.0 / tan_half_fovy;
        result[(2, 2)] = far / (far - near);
        result[(2, 3)] = -(near * far) / (far - near);
        result[(3, 2)] = 1.0;
        result
    }

    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
        let forward = (target - eye).normalize();
        let right = forward.cross(&up).normalize();
        let camera_up = right.cross(&forward);

        let translation = Mat4::new(
            1.0, 0.0, 0.0, -eye.x,
            0.0, 1.0, 0.0, -eye.y,
            0.0, 0.0, 1.0, -eye.z,
            0.0, 0.0, 0.0, 1.0,
        );

        let rotation = Mat4::new(
            right.x, right.y, right.z, 0.0,
            camera_up.x, camera_up.y, camera_up.z, 0.0,
            -forward.x, -forward.y, -forward.z, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );

        rotation * translation
    }

    fn vulkan_coordinate_transform() -> Mat4 {
        Mat4::new(
            1.0,  0.0,  0.0, 0.0,
            0.0, -1.0,  0.0, 0.0,
            0.0,  0.0, -1.0, 0.0,
            0.0,  0.0,  0.0, 1.0,
        )
    }

    fn normal_matrix(&self) -> Mat4 {
        let upper: Mat3 = self.fixed_view::<3, 3>(0, 0).into_owned();
        let inverse_transpose = upper.try_inverse().unwrap_or_else(Mat3::identity).transpose();
        inverse_transpose.to_homogeneous()
    }
}

/// View matrices for the six faces of a cube map centred on `eye`
///
/// Face order follows the Vulkan cube layer order: +X, -X, +Y, -Y, +Z, -Z.
pub fn cube_face_views(eye: Vec3) -> [Mat4; 6] {
    let faces = [
        (Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, -1.0, 0.0)),
        (Vec3::new(-1.0, 0.0, 0.0), Vec3::new(0.0, -1.0, 0.0)),
        (Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0)),
        (Vec3::new(0.0, -1.0, 0.0), Vec3::new(0.0, 0.0, -1.0)),
        (Vec3::new(0.0, 0.0, 1.0), Vec3::new(0.0, -1.0, 0.0)),
        (Vec3::new(0.0, 0.0, -1.0), Vec3::new(0.0, -1.0, 0.0)),
    ];
    faces.map(|(direction, up)| {
        Mat4::look_at_rh(&Point3::from(eye), &Point3::from(eye + direction), &up)
    })
}

/// Square 90-degree projection used for every cube face
pub fn cube_face_projection(near: f32, far: f32) -> Mat4 {
    Mat4::perspective(constants::HALF_PI, 1.0, near, far) * Mat4::vulkan_coordinate_transform()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_transform_to_matrix_applies_scale_then_translation() {
        let transform = Transform {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Quat::identity(),
            scale: Vec3::new(2.0, 2.0, 2.0),
        };
        let point = transform.to_matrix().transform_point(&Point3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(point, Point3::new(3.0, 2.0, 3.0), epsilon = 1e-6);
    }

    #[test]
    fn test_perspective_maps_near_and_far_to_unit_depth() {
        let proj = Mat4::perspective(constants::HALF_PI, 1.0, 0.1, 100.0);
        let near = proj * Vec4::new(0.0, 0.0, 0.1, 1.0);
        let far = proj * Vec4::new(0.0, 0.0, 100.0, 1.0);
        assert_relative_eq!(near.z / near.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far.z / far.w, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_normal_matrix_of_uniform_scale_is_rescaled_identity() {
        let model = Mat4::new_scaling(2.0);
        let normal = model.normal_matrix();
        assert_relative_eq!(normal[(0, 0)], 0.5, epsilon = 1e-6);
        assert_relative_eq!(normal[(3, 3)], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cube_face_views_look_down_each_axis() {
        let views = cube_face_views(Vec3::zeros());
        let forward = views[0].transform_vector(&Vec3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(forward, Vec3::new(0.0, 0.0, -1.0), epsilon = 1e-6);
    }
}
