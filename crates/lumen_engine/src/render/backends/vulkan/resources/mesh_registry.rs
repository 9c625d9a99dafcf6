//! GPU-resident meshes addressed by [`MeshHandle`]

use ash::vk;
use slotmap::SlotMap;

use super::{Buffer, UploadQueue, UploadTicket};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::mesh::{Mesh, MeshHandle, Vertex};

/// Device-local vertex and index buffers of one mesh
pub struct GpuMesh {
    /// Interleaved [`Vertex`] data
    pub vertex_buffer: Buffer,
    /// `u32` indices
    pub index_buffer: Buffer,
    /// Indices drawn per instance
    pub index_count: u32,
    /// Vertices in the buffer
    pub vertex_count: u32,
    /// Mean vertex color, shaded by the ray traced viewport
    pub albedo: [f32; 4],
    upload: UploadTicket,
}

impl GpuMesh {
    /// Ticket of the transfer that filled the buffers
    pub fn upload_ticket(&self) -> UploadTicket {
        self.upload
    }
}

/// Owner of every uploaded mesh
#[derive(Default)]
pub struct MeshRegistry {
    meshes: SlotMap<MeshHandle, GpuMesh>,
    ray_tracing_inputs: bool,
}

impl MeshRegistry {
    /// Empty registry; `ray_tracing_inputs` makes buffers readable by acceleration structure builds
    pub fn new(ray_tracing_inputs: bool) -> Self {
        Self {
            meshes: SlotMap::with_key(),
            ray_tracing_inputs,
        }
    }

    /// Validate and upload `mesh`; the data is resident once its ticket completes
    pub fn upload(&mut self, uploads: &mut UploadQueue, mesh: &Mesh) -> VulkanResult<MeshHandle> {
        if let Err(e) = mesh.validate() {
            debug_assert!(false, "rejected mesh: {}", e);
            return Err(e.into());
        }

        let extra = if self.ray_tracing_inputs {
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::STORAGE_BUFFER
        } else {
            vk::BufferUsageFlags::empty()
        };

        let vertices = uploads.stage::<Vertex>(&mesh.vertices, vk::BufferUsageFlags::VERTEX_BUFFER | extra)?;
        let indices = uploads.stage::<u32>(&mesh.indices, vk::BufferUsageFlags::INDEX_BUFFER | extra)?;
        let (buffers, upload) = uploads.submit_copies(vec![vertices, indices])?;
        let [vertex_buffer, index_buffer]: [Buffer; 2] =
            buffers.try_into().map_err(|_| VulkanError::InvalidOperation {
                reason: "mesh upload returned wrong buffer count".to_string(),
            })?;

        let handle = self.meshes.insert(GpuMesh {
            vertex_buffer,
            index_buffer,
            index_count: mesh.index_count(),
            vertex_count: u32::try_from(mesh.vertices.len()).unwrap_or(u32::MAX),
            albedo: mesh.average_color().push(1.0).into(),
            upload,
        });
        log::debug!(
            "Uploaded mesh {:?}: {} vertices, {} indices",
            handle,
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(handle)
    }

    /// Mesh behind `handle`
    pub fn get(&self, handle: MeshHandle) -> Option<&GpuMesh> {
        self.meshes.get(handle)
    }

    /// Drop a mesh; the caller guarantees no in-flight frame still draws it
    pub fn remove(&mut self, handle: MeshHandle) -> Option<GpuMesh> {
        self.meshes.remove(handle)
    }

    /// Iterate all meshes
    pub fn iter(&self) -> impl Iterator<Item = (MeshHandle, &GpuMesh)> {
        self.meshes.iter()
    }

    /// Number of meshes
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    /// Whether no mesh was uploaded
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}
