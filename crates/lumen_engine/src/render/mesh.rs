//! CPU-side mesh data and vertex layout

use ash::vk;
use slotmap::new_key_type;
use std::mem::{offset_of, size_of};
use thiserror::Error;

use crate::foundation::math::Vec3;

new_key_type! {
    /// Handle to a mesh uploaded to the GPU registry
    pub struct MeshHandle;
}

/// Interleaved vertex as consumed by every mesh pipeline
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Linear RGB color
    pub color: [f32; 3],
    /// Texture coordinate
    pub uv: [f32; 2],
}

unsafe impl bytemuck::Pod for Vertex {}
unsafe impl bytemuck::Zeroable for Vertex {}

impl Vertex {
    /// Binding 0, per-vertex rate
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Locations 0..=3: position, normal, color, uv
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        let attribute = |location: u32, format: vk::Format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };
        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, color)),
            attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
        ]
    }
}

/// Mesh validation failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MeshError {
    /// Fewer than three vertices
    #[error("mesh needs at least 3 vertices, got {0}")]
    TooFewVertices(usize),

    /// Fewer than three indices
    #[error("mesh needs at least 3 indices, got {0}")]
    TooFewIndices(usize),

    /// Index count is not a whole number of triangles
    #[error("index count {0} is not a multiple of 3")]
    NotTriangles(usize),

    /// An index points past the vertex array
    #[error("index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        /// Offending index
        index: u32,
        /// Number of vertices
        vertex_count: usize,
    },
}

/// Indexed triangle list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// Vertex data
    pub vertices: Vec<Vertex>,
    /// Triangle indices
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Check the mesh is a drawable triangle list
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.vertices.len() < 3 {
            return Err(MeshError::TooFewVertices(self.vertices.len()));
        }
        if self.indices.len() < 3 {
            return Err(MeshError::TooFewIndices(self.indices.len()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(MeshError::NotTriangles(self.indices.len()));
        }
        let vertex_count = self.vertices.len();
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(MeshError::IndexOutOfRange { index, vertex_count });
        }
        Ok(())
    }

    /// Index count as drawn
    pub fn index_count(&self) -> u32 {
        u32::try_from(self.indices.len()).unwrap_or(u32::MAX)
    }

    /// Mean vertex color, used where per-vertex color is unavailable
    pub fn average_color(&self) -> Vec3 {
        if self.vertices.is_empty() {
            return Vec3::zeros();
        }
        let sum = self
            .vertices
            .iter()
            .fold(Vec3::zeros(), |acc, vertex| acc + Vec3::from(vertex.color));
        sum / self.vertices.len() as f32
    }

    /// Unit cube centred on the origin, one flat-shaded quad per face
    pub fn cube(color: Vec3) -> Self {
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
            ([0.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
            ([0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
            ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [-1.0, 0.0, 0.0]),
        ];

        let mut mesh = Self::default();
        for (normal, up, right) in faces {
            let n = Vec3::from(normal);
            let u = Vec3::from(up);
            let r = Vec3::from(right);
            let base = u32::try_from(mesh.vertices.len()).unwrap_or(0);
            for (du, dr, uv) in [(-1.0, -1.0, [0.0, 1.0]), (-1.0, 1.0, [1.0, 1.0]), (1.0, 1.0, [1.0, 0.0]), (1.0, -1.0, [0.0, 0.0])] {
                let position = (n + u * du + r * dr) * 0.5;
                mesh.vertices.push(Vertex {
                    position: position.into(),
                    normal,
                    color: color.into(),
                    uv,
                });
            }
            mesh.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    /// Unit quad in the XZ plane facing +Y
    pub fn quad(color: Vec3) -> Self {
        let corners = [
            ([-0.5, 0.0, -0.5], [0.0, 0.0]),
            ([0.5, 0.0, -0.5], [1.0, 0.0]),
            ([0.5, 0.0, 0.5], [1.0, 1.0]),
            ([-0.5, 0.0, 0.5], [0.0, 1.0]),
        ];
        Self {
            vertices: corners
                .iter()
                .map(|&(position, uv)| Vertex {
                    position,
                    normal: [0.0, 1.0, 0.0],
                    color: color.into(),
                    uv,
                })
                .collect(),
            indices: vec![0, 2, 1, 0, 3, 2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_matches_struct() {
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(Vertex::binding_description().stride, 44);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[3].offset, 36);
    }

    #[test]
    fn test_builtin_meshes_validate() {
        let cube = Mesh::cube(Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.index_count(), 36);
        assert!(cube.validate().is_ok());
        assert!(Mesh::quad(Vec3::zeros()).validate().is_ok());
    }

    #[test]
    fn test_average_color() {
        let mut mesh = Mesh::quad(Vec3::new(1.0, 0.0, 0.0));
        mesh.vertices[0].color = [0.0, 0.0, 1.0];
        assert_eq!(mesh.average_color(), Vec3::new(0.75, 0.0, 0.25));
        assert_eq!(Mesh::default().average_color(), Vec3::zeros());
    }

    #[test]
    fn test_validate_rejects_degenerate_meshes() {
        let mut mesh = Mesh::quad(Vec3::zeros());
        mesh.indices.truncate(2);
        assert_eq!(mesh.validate(), Err(MeshError::TooFewIndices(2)));

        mesh.indices = vec![0, 1, 2, 3];
        assert_eq!(mesh.validate(), Err(MeshError::NotTriangles(4)));

        mesh.indices = vec![0, 1, 9];
        assert_eq!(mesh.validate(), Err(MeshError::IndexOutOfRange { index: 9, vertex_count: 4 }));

        mesh.vertices.truncate(2);
        assert_eq!(mesh.validate(), Err(MeshError::TooFewVertices(2)));
    }

    #[test]
    fn test_cube_faces_point_outward() {
        let cube = Mesh::cube(Vec3::zeros());
        for vertex in &cube.vertices {
            let position = Vec3::from(vertex.position);
            let normal = Vec3::from(vertex.normal);
            assert!(position.dot(&normal) > 0.0);
        }
    }
}
