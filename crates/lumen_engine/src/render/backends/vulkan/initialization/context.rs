//! Vulkan context management
//!
//! Instance, debug messenger, physical device selection and logical device
//! creation. The swapchain lives in the presenter, not here.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{
    AccelerationStructure, DeferredHostOperations, RayTracingPipeline, Surface,
    Swapchain as SwapchainLoader,
};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{c_char, CStr, CString};
use thiserror::Error;

use crate::config::RendererConfig;
use crate::render::mesh::MeshError;
use crate::render::backends::vulkan::resources::MemoryAllocator;
use crate::window::Window;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Descriptor layout declared the same binding twice
    #[error("Descriptor binding {binding} declared twice")]
    DuplicateBinding {
        /// Binding index
        binding: u32,
    },

    /// Descriptor write targets a binding the layout does not declare
    #[error("Descriptor binding {binding} is not part of the layout")]
    UnknownBinding {
        /// Binding index
        binding: u32,
    },

    /// Descriptor write count differs from the declared count
    #[error("Descriptor binding {binding} expects {expected} descriptors, got {actual}")]
    DescriptorCountMismatch {
        /// Binding index
        binding: u32,
        /// Declared descriptor count
        expected: u32,
        /// Descriptors supplied by the write
        actual: u32,
    },

    /// A framebuffer may hold a single depth/stencil attachment
    #[error("Framebuffer already has a depth/stencil attachment")]
    MultipleDepthAttachments,

    /// Pipeline bound inside a render pass it was not built for
    #[error("Pipeline '{pipeline}' is incompatible with the active render pass")]
    IncompatibleRenderPass {
        /// Pipeline debug name
        pipeline: String,
    },

    /// Frame ended with a command buffer other than the one the frame began with
    #[error("Command buffer does not belong to the current frame slot")]
    CommandBufferMismatch,

    /// Swapchain recreation produced a different color or depth format
    #[error("Swapchain format changed from {old:?} to {new:?}")]
    SwapchainFormatChanged {
        /// Format before recreation
        old: vk::Format,
        /// Format after recreation
        new: vk::Format,
    },

    /// Compiled shader missing from every search directory
    #[error("Shader not found: {0}")]
    ShaderNotFound(String),

    /// Borrowed attachment whose owning framebuffer no longer exists
    #[error("Borrowed attachment refers to a framebuffer that no longer exists")]
    StaleAttachment,

    /// Command recorded outside `begin`/`end`
    #[error("Command buffer is not recording")]
    NotRecording,

    /// Ray tracing work requested on a raster-only device
    #[error("Ray tracing is not enabled on this device")]
    RayTracingUnavailable,

    /// Mesh data failed validation before upload
    #[error("Invalid mesh: {0}")]
    InvalidMesh(#[from] MeshError),
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

fn cstring(value: &str) -> VulkanResult<CString> {
    CString::new(value)
        .map_err(|e| VulkanError::InitializationFailed(format!("Invalid string '{}': {}", value, e)))
}

/// Log a failed idle wait in a destructor; teardown continues either way
pub(crate) fn idled_before_teardown<E: std::fmt::Display>(result: Result<(), E>, resource: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Device wait failed before destroying {}: {}", resource, e);
            false
        }
    }
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create a Vulkan 1.2 instance, with validation when requested and available
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;

        let app_name_cstr = cstring(app_name)?;
        let engine_name_cstr = cstring("Lumen")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let required_extensions = window.required_instance_extensions().map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to get required extensions: {}", e))
        })?;
        let cstr_extensions = required_extensions
            .iter()
            .map(|ext| cstring(ext))
            .collect::<VulkanResult<Vec<_>>>()?;
        let mut extensions: Vec<*const c_char> = cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();

        let validation = enable_validation && Self::validation_layer_available(&entry)?;
        if enable_validation && !validation {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }

        let mut layers: Vec<*const c_char> = Vec::new();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
            layers.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None)? };

        let debug = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&debug_utils)?;
            log::info!("Vulkan validation layers enabled");
            Some((debug_utils, messenger))
        } else {
            None
        };

        Ok(Self { entry, instance, debug })
    }

    fn validation_layer_available(entry: &Entry) -> VulkanResult<bool> {
        let layers = entry.enumerate_instance_layer_properties()?;
        Ok(layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        }))
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe { Ok(debug_utils.create_debug_utils_messenger(&create_info, None)?) }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Shader binding table sizes reported by a ray tracing capable device
#[derive(Debug, Clone, Copy)]
pub struct RayTracingProperties {
    /// Size of one shader group handle
    pub handle_size: u32,
    /// Required alignment of handles inside a region
    pub handle_alignment: u32,
    /// Required alignment of each region's base address
    pub base_alignment: u32,
    /// Required alignment of acceleration structure scratch buffers
    pub scratch_alignment: u32,
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
    /// Ray tracing limits, present when every ray tracing extension and feature is supported
    pub ray_tracing: Option<RayTracingProperties>,
    /// Variable-count, partially bound descriptor bindings are supported
    pub descriptor_indexing: bool,
}

impl PhysicalDeviceInfo {
    /// Select the first device that can render to `surface` with multiview
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices()? };

        for device in devices {
            match Self::evaluate_device(instance, device, surface, surface_loader) {
                Ok(info) => {
                    log::info!(
                        "Selected GPU: {} (ray tracing {})",
                        unsafe { CStr::from_ptr(info.properties.device_name.as_ptr()).to_string_lossy() },
                        if info.ray_tracing.is_some() { "available" } else { "unavailable" }
                    );
                    return Ok(info);
                }
                Err(e) => log::debug!("Skipping physical device: {}", e),
            }
        }

        Err(VulkanError::InitializationFailed("No suitable GPU found".to_string()))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;

        for (index, family) in (0u32..).zip(queue_families.iter()) {
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }

            let present_support =
                unsafe { surface_loader.get_physical_device_surface_support(device, index, surface)? };
            if present_support && present_family.is_none() {
                present_family = Some(index);
            }

            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let graphics_family = graphics_family
            .ok_or_else(|| VulkanError::InitializationFailed("No graphics queue family found".to_string()))?;
        let present_family = present_family
            .ok_or_else(|| VulkanError::InitializationFailed("No present queue family found".to_string()))?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(device)? };
        let available: Vec<&CStr> = extensions
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
            .collect();

        if !available.contains(&SwapchainLoader::name()) {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }

        let mut vulkan11 = vk::PhysicalDeviceVulkan11Features::default();
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut acceleration = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let has_ray_tracing_extensions = ray_tracing_extensions().iter().all(|ext| available.contains(ext));
        let core = {
            let mut features = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut vulkan11)
                .push_next(&mut vulkan12);
            if has_ray_tracing_extensions {
                features = features.push_next(&mut acceleration).push_next(&mut pipeline);
            }
            unsafe { instance.get_physical_device_features2(device, &mut features) };
            features.features
        };

        if vulkan11.multiview == vk::FALSE {
            return Err(VulkanError::InitializationFailed("Multiview not supported".to_string()));
        }
        // the picking pass writes entity ids from the fragment shader
        if core.fragment_stores_and_atomics == vk::FALSE {
            return Err(VulkanError::InitializationFailed(
                "Fragment stores not supported".to_string(),
            ));
        }

        let ray_tracing = if has_ray_tracing_extensions
            && vulkan12.buffer_device_address == vk::TRUE
            && acceleration.acceleration_structure == vk::TRUE
            && pipeline.ray_tracing_pipeline == vk::TRUE
        {
            let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            {
                let mut properties2 = vk::PhysicalDeviceProperties2::builder()
                    .push_next(&mut rt_properties)
                    .push_next(&mut as_properties);
                unsafe { instance.get_physical_device_properties2(device, &mut properties2) };
            }
            Some(RayTracingProperties {
                handle_size: rt_properties.shader_group_handle_size,
                handle_alignment: rt_properties.shader_group_handle_alignment,
                base_alignment: rt_properties.shader_group_base_alignment,
                scratch_alignment: as_properties.min_acceleration_structure_scratch_offset_alignment,
            })
        } else {
            None
        };

        let descriptor_indexing = vulkan12.descriptor_binding_variable_descriptor_count == vk::TRUE
            && vulkan12.descriptor_binding_partially_bound == vk::TRUE;

        Ok(Self {
            device,
            properties,
            memory_properties,
            graphics_family,
            present_family,
            ray_tracing,
            descriptor_indexing,
        })
    }

    /// Minimum offset alignment for dynamic uniform buffers
    pub fn min_uniform_alignment(&self) -> vk::DeviceSize {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }
}

fn ray_tracing_extensions() -> [&'static CStr; 3] {
    [
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        DeferredHostOperations::name(),
    ]
}

/// Extension loaders for acceleration structures and ray tracing pipelines
#[derive(Clone)]
pub struct RayTracingLoaders {
    /// `VK_KHR_acceleration_structure`
    pub acceleration_structure: AccelerationStructure,
    /// `VK_KHR_ray_tracing_pipeline`
    pub pipeline: RayTracingPipeline,
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue
    pub graphics_queue: vk::Queue,
    /// Surface presentation queue
    pub present_queue: vk::Queue,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
    /// Present only when the ray tracing extensions were enabled
    pub ray_tracing: Option<RayTracingLoaders>,
}

impl LogicalDevice {
    /// Create the logical device; ray tracing features are enabled only when `ray_tracing` is set
    pub fn new(instance: &Instance, info: &PhysicalDeviceInfo, ray_tracing: bool) -> VulkanResult<Self> {
        let mut unique_families = vec![info.graphics_family, info.present_family];
        unique_families.dedup();

        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut extension_names = vec![SwapchainLoader::name().as_ptr()];
        if ray_tracing {
            extension_names.extend(ray_tracing_extensions().iter().map(|ext| ext.as_ptr()));
        }

        let mut features = vk::PhysicalDeviceFeatures2::builder()
            .features(vk::PhysicalDeviceFeatures::builder().fragment_stores_and_atomics(true).build());
        let mut vulkan11 = vk::PhysicalDeviceVulkan11Features::builder().multiview(true);
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(ray_tracing)
            .descriptor_binding_variable_descriptor_count(info.descriptor_indexing)
            .descriptor_binding_partially_bound(info.descriptor_indexing);
        let mut acceleration =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features)
            .push_next(&mut vulkan11)
            .push_next(&mut vulkan12);
        if ray_tracing {
            create_info = create_info.push_next(&mut acceleration).push_next(&mut pipeline);
        }

        let device = unsafe { instance.create_device(info.device, &create_info, None)? };
        let graphics_queue = unsafe { device.get_device_queue(info.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(info.present_family, 0) };
        let swapchain_loader = SwapchainLoader::new(instance, &device);
        let ray_tracing = ray_tracing.then(|| RayTracingLoaders {
            acceleration_structure: AccelerationStructure::new(instance, &device),
            pipeline: RayTracingPipeline::new(instance, &device),
        });

        log::debug!(
            "Created logical device (graphics family {}, present family {})",
            info.graphics_family,
            info.present_family
        );

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            swapchain_loader,
            ray_tracing,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        idled_before_teardown(unsafe { self.device.device_wait_idle() }, "logical device");
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

/// Core Vulkan objects shared by every renderer component
///
/// Fields drop in declaration order, so the device goes before the instance.
pub struct VulkanContext {
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    physical_device: PhysicalDeviceInfo,
    ray_tracing_enabled: bool,
    device: LogicalDevice,
    instance: VulkanInstance,
}

impl VulkanContext {
    /// Create instance, surface and device for `window`
    pub fn new(window: &Window, config: &RendererConfig) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(window, &config.application_name, config.validation_enabled())?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window
            .create_vulkan_surface(instance.instance.handle())
            .map_err(|e| VulkanError::InitializationFailed(format!("Surface creation: {}", e)))?;

        let physical_device =
            PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader)?;

        let ray_tracing_enabled = config.enable_ray_tracing && physical_device.ray_tracing.is_some();
        if config.enable_ray_tracing && !ray_tracing_enabled {
            log::info!("Ray tracing requested but not supported by this device; using raster path");
        }

        let device = LogicalDevice::new(&instance.instance, &physical_device, ray_tracing_enabled)?;

        Ok(Self {
            surface,
            surface_loader,
            physical_device,
            ray_tracing_enabled,
            device,
            instance,
        })
    }

    /// Get a reference to the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the surface handle
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Get the surface loader
    pub fn surface_loader(&self) -> &Surface {
        &self.surface_loader
    }

    /// Get the physical device info
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical_device
    }

    /// Get the raw Device handle
    pub fn device(&self) -> &Device {
        &self.device.device
    }

    /// Get the swapchain loader
    pub fn swapchain_loader(&self) -> &SwapchainLoader {
        &self.device.swapchain_loader
    }

    /// Get the graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    /// Get the present queue
    pub fn present_queue(&self) -> vk::Queue {
        self.device.present_queue
    }

    /// Get the graphics queue family index
    pub fn graphics_queue_family(&self) -> u32 {
        self.physical_device.graphics_family
    }

    /// Whether the ray tracing extensions were enabled on the device
    pub fn ray_tracing_enabled(&self) -> bool {
        self.ray_tracing_enabled
    }

    /// Ray tracing extension loaders, if the device was created with them
    pub fn ray_tracing_loaders(&self) -> Option<&RayTracingLoaders> {
        self.device.ray_tracing.as_ref()
    }

    /// Allocator bound to this device's memory types
    pub fn allocator(&self) -> MemoryAllocator {
        MemoryAllocator::new(
            self.device.device.clone(),
            self.physical_device.memory_properties,
            self.ray_tracing_enabled,
        )
    }

    /// Block until the GPU has finished all submitted work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { Ok(self.device.device.device_wait_idle()?) }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        idled_before_teardown(self.wait_idle(), "surface");
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_teardown_wait_is_reported_not_raised() {
        assert!(idled_before_teardown(Ok::<(), vk::Result>(()), "command pool"));
        assert!(!idled_before_teardown(Err(vk::Result::ERROR_DEVICE_LOST), "command pool"));
        let lost: VulkanResult<()> = Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST));
        assert!(!idled_before_teardown(lost, "surface"));
    }
}
