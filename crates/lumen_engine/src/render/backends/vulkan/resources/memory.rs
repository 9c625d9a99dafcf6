//! Device memory allocation
//!
//! One `vkAllocateMemory` per resource. The renderer's resource count is small
//! and fixed, so there is no sub-allocation.

use ash::{vk, Device};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Pick the first memory type allowed by `type_filter` that has all of `properties`
pub fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

/// Device handle plus memory type table; cheap to clone
#[derive(Clone)]
pub struct MemoryAllocator {
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_address: bool,
}

impl MemoryAllocator {
    /// Wrap a device and its memory properties
    pub fn new(
        device: Device,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        device_address: bool,
    ) -> Self {
        Self {
            device,
            memory_properties,
            device_address,
        }
    }

    /// The logical device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Allocate memory satisfying `requirements`
    pub fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        device_address: bool,
    ) -> VulkanResult<vk::DeviceMemory> {
        let memory_type_index =
            select_memory_type(&self.memory_properties, requirements.memory_type_bits, properties)
                .ok_or(VulkanError::NoSuitableMemoryType)?;

        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        if device_address && self.device_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        unsafe { Ok(self.device.allocate_memory(&alloc_info, None)?) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: u32::try_from(types.len()).unwrap(),
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn test_selects_first_matching_type() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(
            select_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
    }

    #[test]
    fn test_respects_type_filter() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            select_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
        assert_eq!(
            select_memory_type(&props, 0b11, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }
}
