//! Semaphores, fences and the per-slot synchronization bundle

use ash::{vk, Device};

use crate::render::backends::vulkan::VulkanResult;

/// GPU-GPU synchronization primitive with automatic resource management
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence, optionally already signaled
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { device.create_fence(&create_info, None)? };
        Ok(Self { device, fence })
    }

    /// Block until the fence is signaled
    pub fn wait(&self) -> VulkanResult<()> {
        unsafe { Ok(self.device.wait_for_fences(&[self.fence], true, u64::MAX)?) }
    }

    /// Non-blocking status query
    pub fn is_signaled(&self) -> VulkanResult<bool> {
        unsafe { Ok(self.device.get_fence_status(self.fence)?) }
    }

    /// Return the fence to the unsignaled state
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe { Ok(self.device.reset_fences(&[self.fence])?) }
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Synchronization objects owned by one frame slot
pub struct FrameSync {
    /// Signaled when the acquired swapchain image is ready to be rendered to
    pub image_available: Semaphore,
    /// Signaled by the GPU once the slot's submission completes
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create the slot's objects; the fence starts signaled so the first wait returns
    pub fn new(device: &Device) -> VulkanResult<Self> {
        Ok(Self {
            image_available: Semaphore::new(device.clone())?,
            in_flight: Fence::new(device.clone(), true)?,
        })
    }
}
