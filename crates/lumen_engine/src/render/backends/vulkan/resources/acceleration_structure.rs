//! Ray tracing acceleration structures
//!
//! One bottom-level structure per mesh, built once through the upload queue.
//! The top level is rebuilt every frame into a per-slot [`TopLevel`] so a
//! frame in flight never sees its instances overwritten.

use ash::extensions::khr;
use ash::vk;

use super::{Buffer, GpuMesh, MemoryAllocator, UploadQueue, HOST_MEMORY};
use crate::foundation::math::Mat4;
use crate::render::backends::vulkan::rendering::CommandRecorder;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::mesh::Vertex;

/// Round `value` up to a multiple of `alignment` (a power of two or zero)
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Row-major 3x4 affine part of `transform`
pub fn transform_matrix(transform: &Mat4) -> vk::TransformMatrixKHR {
    let mut matrix = [0.0; 12];
    for row in 0..3 {
        for column in 0..4 {
            matrix[row * 4 + column] = transform[(row, column)];
        }
    }
    vk::TransformMatrixKHR { matrix }
}

/// Acceleration structure plus the buffer backing it
pub struct AccelerationStructure {
    loader: khr::AccelerationStructure,
    handle: vk::AccelerationStructureKHR,
    address: vk::DeviceAddress,
    _buffer: Buffer,
}

impl AccelerationStructure {
    fn create(
        loader: &khr::AccelerationStructure,
        allocator: &MemoryAllocator,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> VulkanResult<Self> {
        let buffer = Buffer::new(
            allocator,
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.handle())
            .size(size)
            .ty(ty);
        let handle = unsafe { loader.create_acceleration_structure(&create_info, None)? };

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
        let address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        Ok(Self {
            loader: loader.clone(),
            handle,
            address,
            _buffer: buffer,
        })
    }

    /// Build the bottom level structure of `mesh` on the upload queue
    ///
    /// The scratch buffer is released with the upload, so the structure is
    /// usable once the queue has been flushed.
    pub fn build_bottom_level(
        loader: &khr::AccelerationStructure,
        uploads: &mut UploadQueue,
        mesh: &GpuMesh,
        scratch_alignment: u32,
    ) -> VulkanResult<Self> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.vertex_buffer.device_address(),
            })
            .vertex_stride(std::mem::size_of::<Vertex>() as vk::DeviceSize)
            .max_vertex(mesh.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.index_buffer.device_address(),
            })
            .build();
        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build();
        let primitive_count = mesh.index_count / 3;

        let allocator = uploads.allocator().clone();
        let geometries = [geometry];
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .build();

        let sizes = unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
            )
        };

        let structure = Self::create(
            loader,
            &allocator,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            sizes.acceleration_structure_size,
        )?;
        let scratch = ScratchBuffer::new(&allocator, sizes.build_scratch_size, scratch_alignment)?;

        build_info.dst_acceleration_structure = structure.handle;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch.address,
        };
        let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(primitive_count)
            .build();

        let ticket = uploads.submit(vec![scratch.buffer], |recorder| {
            // Vertex and index copies may still be in flight on the same queue
            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR)
                .build();
            recorder.pipeline_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                &[barrier],
                &[],
            )?;
            unsafe {
                loader.cmd_build_acceleration_structures(recorder.handle(), &[build_info], &[&[range]]);
            }
            Ok(())
        })?;

        log::debug!(
            "Queued bottom level build ({} triangles, {} bytes) as {:?}",
            primitive_count,
            sizes.acceleration_structure_size,
            ticket
        );
        Ok(structure)
    }

    /// Raw handle
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Device address referenced by instances
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_acceleration_structure(self.handle, None);
        }
    }
}

struct ScratchBuffer {
    buffer: Buffer,
    address: vk::DeviceAddress,
}

impl ScratchBuffer {
    fn new(allocator: &MemoryAllocator, size: vk::DeviceSize, alignment: u32) -> VulkanResult<Self> {
        let alignment = u64::from(alignment);
        let buffer = Buffer::new(
            allocator,
            size + alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let address = align_up(buffer.device_address(), alignment);
        Ok(Self { buffer, address })
    }
}

/// One instance of a bottom level structure in the scene
#[derive(Debug, Clone, Copy)]
pub struct BlasInstance {
    /// Device address of the bottom level structure
    pub blas_address: vk::DeviceAddress,
    /// World transform
    pub transform: Mat4,
    /// Value of `gl_InstanceCustomIndexEXT` in hit shaders
    pub custom_index: u32,
}

impl BlasInstance {
    /// Instance record consumed by the top level build
    pub fn to_record(&self) -> vk::AccelerationStructureInstanceKHR {
        vk::AccelerationStructureInstanceKHR {
            transform: transform_matrix(&self.transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index & 0x00ff_ffff, 0xff),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        }
    }
}

/// Per-frame-slot top level structure, rebuilt from scratch each frame
pub struct TopLevel {
    loader: khr::AccelerationStructure,
    allocator: MemoryAllocator,
    capacity: u32,
    scratch_alignment: u32,
    instances: Buffer,
    scratch: Option<ScratchBuffer>,
    structure: Option<AccelerationStructure>,
}

impl TopLevel {
    /// Empty top level with room for `capacity` instances
    pub fn new(
        loader: &khr::AccelerationStructure,
        allocator: &MemoryAllocator,
        capacity: u32,
        scratch_alignment: u32,
    ) -> VulkanResult<Self> {
        let capacity = capacity.max(1);
        Ok(Self {
            loader: loader.clone(),
            allocator: allocator.clone(),
            capacity,
            scratch_alignment,
            instances: Self::instance_buffer(allocator, capacity)?,
            scratch: None,
            structure: None,
        })
    }

    fn instance_buffer(allocator: &MemoryAllocator, capacity: u32) -> VulkanResult<Buffer> {
        Buffer::new(
            allocator,
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as vk::DeviceSize * u64::from(capacity),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            HOST_MEMORY,
        )
    }

    /// Write `instances` and record a full rebuild
    ///
    /// The caller must have waited on this slot's fence, since the instance
    /// buffer is overwritten from the host.
    pub fn record_build(&mut self, recorder: &mut CommandRecorder, instances: &[BlasInstance]) -> VulkanResult<()> {
        let count = u32::try_from(instances.len()).map_err(|_| VulkanError::InvalidOperation {
            reason: "too many ray tracing instances".to_string(),
        })?;
        if count > self.capacity {
            // Grown structures are rebuilt at the new size below
            self.capacity = count.next_power_of_two();
            self.instances = Self::instance_buffer(&self.allocator, self.capacity)?;
            self.structure = None;
            self.scratch = None;
        }

        let records: Vec<vk::AccelerationStructureInstanceKHR> = instances.iter().map(BlasInstance::to_record).collect();
        // The instance record is plain data without padding, but ash does not mark it Pod
        let bytes = unsafe {
            std::slice::from_raw_parts(
                records.as_ptr().cast::<u8>(),
                records.len() * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            )
        };
        self.instances.write_bytes(0, bytes)?;

        let instance_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.instances.device_address(),
            })
            .build();
        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instance_data })
            .build();
        let geometries = [geometry];
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .build();

        if self.structure.is_none() {
            let sizes = unsafe {
                self.loader.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[self.capacity],
                )
            };
            self.structure = Some(AccelerationStructure::create(
                &self.loader,
                &self.allocator,
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                sizes.acceleration_structure_size,
            )?);
            self.scratch = Some(ScratchBuffer::new(
                &self.allocator,
                sizes.build_scratch_size,
                self.scratch_alignment,
            )?);
            log::debug!("Allocated top level structure for {} instances", self.capacity);
        }

        let (Some(structure), Some(scratch)) = (self.structure.as_ref(), self.scratch.as_ref()) else {
            return Err(VulkanError::InvalidOperation {
                reason: "top level structure missing after allocation".to_string(),
            });
        };
        build_info.dst_acceleration_structure = structure.handle;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch.address,
        };
        let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(count)
            .build();

        unsafe {
            self.loader
                .cmd_build_acceleration_structures(recorder.handle(), &[build_info], &[&[range]]);
        }

        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR)
            .build();
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            &[barrier],
            &[],
        )
    }

    /// Handle of the last built structure
    pub fn handle(&self) -> Option<vk::AccelerationStructureKHR> {
        self.structure.as_ref().map(AccelerationStructure::handle)
    }

    /// Instances the current allocation can hold
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(256, 128), 256);
        assert_eq!(align_up(257, 0), 257);
    }

    #[test]
    fn test_transform_matrix_is_row_major_with_translation_last() {
        let transform = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0)) * Mat4::new_scaling(2.0);
        let matrix = transform_matrix(&transform).matrix;
        assert_eq!(matrix[0], 2.0);
        assert_eq!(matrix[3], 1.0);
        assert_eq!(matrix[5], 2.0);
        assert_eq!(matrix[7], 2.0);
        assert_eq!(matrix[10], 2.0);
        assert_eq!(matrix[11], 3.0);
    }

    #[test]
    fn test_instance_record_packs_custom_index_and_full_mask() {
        let instance = BlasInstance {
            blas_address: 0xdead_0000,
            transform: Mat4::identity(),
            custom_index: 7,
        };
        let record = instance.to_record();
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 7);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xff);
        assert_eq!(unsafe { record.acceleration_structure_reference.device_handle }, 0xdead_0000);
    }
}
