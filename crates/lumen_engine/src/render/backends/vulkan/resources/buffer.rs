//! Buffer management for vertex data, uniforms and staging
//!
//! Memory management following RAII patterns with proper allocation and cleanup

use ash::{vk, Device};
use std::ffi::c_void;

use super::MemoryAllocator;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Host-visible and coherent, the flags every CPU-written buffer uses
pub const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Buffer wrapper with memory management
///
/// Host-visible buffers stay persistently mapped for their whole life.
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: Option<*mut c_void>,
}

impl Buffer {
    /// Create a new buffer with memory allocation
    pub fn new(
        allocator: &MemoryAllocator,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let device = allocator.device().clone();
        let device_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory = match allocator.allocate(requirements, properties, device_address) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut result = Self {
            device,
            buffer,
            memory,
            size,
            mapped: None,
        };

        unsafe { result.device.bind_buffer_memory(buffer, memory, 0)? };

        if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            let ptr = unsafe {
                result
                    .device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
            };
            result.mapped = Some(ptr);
        }

        log::trace!("Created buffer of {} bytes ({:?})", size, usage);
        Ok(result)
    }

    /// Copy `data` into the mapped buffer at byte `offset`
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        let ptr = self.mapped.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "write to a buffer that is not host visible".to_string(),
        })?;
        let end = offset.saturating_add(data.len() as vk::DeviceSize);
        if end > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!("write of {} bytes at {} overflows buffer of {}", data.len(), offset, self.size),
            });
        }
        let offset = usize::try_from(offset).map_err(|_| VulkanError::InvalidOperation {
            reason: "buffer offset exceeds address space".to_string(),
        })?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>().add(offset), data.len());
        }
        Ok(())
    }

    /// Write plain-old-data values starting at byte 0
    pub fn write_data<T: bytemuck::Pod>(&self, data: &[T]) -> VulkanResult<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Read back plain-old-data values from a mapped buffer
    pub fn read_data<T: bytemuck::Pod>(&self, count: usize) -> VulkanResult<Vec<T>> {
        let ptr = self.mapped.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "read from a buffer that is not host visible".to_string(),
        })?;
        let bytes = count * std::mem::size_of::<T>();
        if bytes as vk::DeviceSize > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!("read of {} bytes overflows buffer of {}", bytes, self.size),
            });
        }
        let slice = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), bytes) };
        let mut values = vec![T::zeroed(); count];
        bytemuck::cast_slice_mut(&mut values).copy_from_slice(slice);
        Ok(values)
    }

    /// Device address for ray tracing inputs
    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get size
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// One host-visible uniform buffer per frame slot
pub struct PerFrameBuffers {
    buffers: Vec<Buffer>,
}

impl PerFrameBuffers {
    /// Allocate `frames` buffers of `size` bytes
    pub fn new(
        allocator: &MemoryAllocator,
        frames: usize,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<Self> {
        let buffers = (0..frames)
            .map(|_| Buffer::new(allocator, size, usage, HOST_MEMORY))
            .collect::<VulkanResult<Vec<_>>>()?;
        Ok(Self { buffers })
    }

    /// Buffer owned by `frame_index`
    pub fn get(&self, frame_index: usize) -> &Buffer {
        &self.buffers[frame_index % self.buffers.len()]
    }

    /// Iterate all slots
    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }
}
