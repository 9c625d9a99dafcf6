//! Ray tracing pipeline and shader binding table
//!
//! The pipeline has exactly three groups: one ray generation shader, one miss
//! shader and one triangle hit group with a closest hit shader.

use ash::extensions::khr;
use ash::{vk, Device};

use super::commands::CommandRecorder;
use super::pipeline::PipelineLayout;
use super::shader::ShaderModule;
use crate::config::RendererConfig;
use crate::render::backends::vulkan::initialization::RayTracingProperties;
use crate::render::backends::vulkan::resources::{align_up, Buffer, MemoryAllocator, HOST_MEMORY};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

const RAYGEN_STAGE: u32 = 0;
const MISS_STAGE: u32 = 1;
const CLOSEST_HIT_STAGE: u32 = 2;
const GROUP_COUNT: u32 = 3;

/// Offsets, strides and sizes of the three SBT regions inside one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    /// Handle size rounded up to the handle alignment
    pub handle_stride: u64,
    /// Ray generation region (offset, size); its stride must equal its size
    pub raygen: (u64, u64),
    /// Miss region (offset, size)
    pub miss: (u64, u64),
    /// Hit region (offset, size)
    pub hit: (u64, u64),
    /// Total bytes, excluding the slack used to align the base address
    pub total: u64,
}

impl SbtLayout {
    /// Lay out one handle per region
    pub fn new(properties: &RayTracingProperties) -> Self {
        let base = u64::from(properties.base_alignment);
        let handle_stride = align_up(u64::from(properties.handle_size), u64::from(properties.handle_alignment));
        let region = align_up(handle_stride, base);

        let raygen = (0, region);
        let miss = (raygen.0 + raygen.1, region);
        let hit = (miss.0 + miss.1, region);
        Self {
            handle_stride,
            raygen,
            miss,
            hit,
            total: hit.0 + hit.1,
        }
    }

    /// Strided address regions starting at `base_address`
    pub fn regions(&self, base_address: vk::DeviceAddress) -> [vk::StridedDeviceAddressRegionKHR; 3] {
        let region = |(offset, size): (u64, u64), stride: u64| vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + offset,
            stride,
            size,
        };
        [
            region(self.raygen, self.raygen.1),
            region(self.miss, self.handle_stride),
            region(self.hit, self.handle_stride),
        ]
    }
}

/// Ray tracing pipeline with its shader binding table
pub struct RayTracingPipeline {
    device: Device,
    loader: khr::RayTracingPipeline,
    pipeline: vk::Pipeline,
    layout: PipelineLayout,
    regions: [vk::StridedDeviceAddressRegionKHR; 3],
    _sbt: Buffer,
}

impl RayTracingPipeline {
    /// Create the pipeline from `raygen.rgen.spv`, `miss.rmiss.spv` and `closesthit.rchit.spv`
    pub fn new(
        device: &Device,
        loader: &khr::RayTracingPipeline,
        allocator: &MemoryAllocator,
        config: &RendererConfig,
        properties: &RayTracingProperties,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> VulkanResult<Self> {
        let raygen = ShaderModule::load(device.clone(), config, "raygen.rgen.spv", vk::ShaderStageFlags::RAYGEN_KHR)?;
        let miss = ShaderModule::load(device.clone(), config, "miss.rmiss.spv", vk::ShaderStageFlags::MISS_KHR)?;
        let closest_hit = ShaderModule::load(
            device.clone(),
            config,
            "closesthit.rchit.spv",
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        )?;
        let stages = [raygen.stage_info(), miss.stage_info(), closest_hit.stage_info()];

        let general = |shader: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(shader)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build()
        };
        let groups = [
            general(RAYGEN_STAGE),
            general(MISS_STAGE),
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(CLOSEST_HIT_STAGE)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
        ];

        let layout = PipelineLayout::new(device.clone(), set_layouts, &[])?;
        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(layout.handle());

        let pipeline = unsafe {
            loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info.build()],
                None,
            )?
        }
        .into_iter()
        .next()
        .ok_or_else(|| VulkanError::InitializationFailed("No ray tracing pipeline returned".to_string()))?;

        let sbt = match Self::create_sbt(loader, allocator, pipeline, properties) {
            Ok(sbt) => sbt,
            Err(e) => {
                unsafe { device.destroy_pipeline(pipeline, None) };
                return Err(e);
            }
        };

        log::debug!("Created ray tracing pipeline");
        Ok(Self {
            device: device.clone(),
            loader: loader.clone(),
            pipeline,
            layout,
            regions: sbt.1,
            _sbt: sbt.0,
        })
    }

    fn create_sbt(
        loader: &khr::RayTracingPipeline,
        allocator: &MemoryAllocator,
        pipeline: vk::Pipeline,
        properties: &RayTracingProperties,
    ) -> VulkanResult<(Buffer, [vk::StridedDeviceAddressRegionKHR; 3])> {
        let layout = SbtLayout::new(properties);
        let handle_size = properties.handle_size as usize;
        let handles = unsafe {
            loader.get_ray_tracing_shader_group_handles(pipeline, 0, GROUP_COUNT, handle_size * GROUP_COUNT as usize)?
        };

        let slack = u64::from(properties.base_alignment);
        let buffer = Buffer::new(
            allocator,
            layout.total + slack,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            HOST_MEMORY,
        )?;
        let raw_address = buffer.device_address();
        let base_address = align_up(raw_address, slack);
        let base_offset = base_address - raw_address;

        for (group, (offset, _)) in [layout.raygen, layout.miss, layout.hit].into_iter().enumerate() {
            let handle = &handles[group * handle_size..(group + 1) * handle_size];
            buffer.write_bytes(base_offset + offset, handle)?;
        }

        Ok((buffer, layout.regions(base_address)))
    }

    /// Bind the pipeline and trace one ray per pixel of `extent`
    pub fn trace(
        &self,
        recorder: &mut CommandRecorder,
        descriptor_sets: &[vk::DescriptorSet],
        extent: vk::Extent2D,
    ) -> VulkanResult<()> {
        recorder.bind_ray_tracing_pipeline(self.pipeline, self.layout.handle())?;
        recorder.bind_descriptor_sets(vk::PipelineBindPoint::RAY_TRACING_KHR, 0, descriptor_sets, &[])?;
        let callable = vk::StridedDeviceAddressRegionKHR::default();
        let [raygen, miss, hit] = &self.regions;
        unsafe {
            self.loader
                .cmd_trace_rays(recorder.handle(), raygen, miss, hit, &callable, extent.width, extent.height, 1);
        }
        Ok(())
    }

    /// Get pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Get layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.handle()
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> RayTracingProperties {
        RayTracingProperties {
            handle_size,
            handle_alignment,
            base_alignment,
            scratch_alignment: 128,
        }
    }

    #[test]
    fn test_regions_start_on_base_alignment() {
        let layout = SbtLayout::new(&properties(32, 32, 64));
        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.raygen, (0, 64));
        assert_eq!(layout.miss, (64, 64));
        assert_eq!(layout.hit, (128, 64));
        assert_eq!(layout.total, 192);
    }

    #[test]
    fn test_handle_stride_rounds_up_to_handle_alignment() {
        let layout = SbtLayout::new(&properties(24, 32, 32));
        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.raygen.1, 32);
    }

    #[test]
    fn test_raygen_region_stride_equals_size() {
        let layout = SbtLayout::new(&properties(32, 32, 64));
        let [raygen, miss, hit] = layout.regions(0x1000);
        assert_eq!(raygen.device_address, 0x1000);
        assert_eq!(raygen.stride, raygen.size);
        assert_eq!(miss.device_address, 0x1040);
        assert_eq!(miss.stride, 32);
        assert_eq!(hit.device_address, 0x1080);
    }
}
