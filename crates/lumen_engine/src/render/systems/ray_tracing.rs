//! Hardware ray traced viewport
//!
//! Replaces the raster viewport passes when enabled. Each mesh gets a bottom
//! level structure once it is uploaded; every frame the slot's top level
//! structure is rebuilt from the draw list and one ray per pixel is traced
//! into a storage image that the UI samples.

use ash::extensions::khr;
use ash::vk;
use slotmap::SecondaryMap;

use super::{RenderSystem, ResizeContext, SystemInit};
use crate::config::RendererConfig;
use crate::render::backends::vulkan::initialization::context::RayTracingProperties;
use crate::render::backends::vulkan::rendering::RayTracingPipeline;
use crate::render::backends::vulkan::resources::{AccelerationStructure, BlasInstance, PerFrameBuffers, TopLevel};
use crate::render::backends::vulkan::state::{AttachmentRef, AttachmentSpec, Framebuffer, FramebufferId};
use crate::render::backends::vulkan::{
    CommandRecorder, DescriptorBudget, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    FramebufferArena, MeshRegistry, UploadQueue, VulkanError, VulkanResult,
};
use crate::render::frame::{DrawItem, FrameInfo, GlobalUbo};
use crate::render::mesh::MeshHandle;

/// Format of the traced image; written with `rgba8` in the raygen shader
pub const RAY_TRACED_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

const COLOR_SIZE: vk::DeviceSize = std::mem::size_of::<[f32; 4]>() as vk::DeviceSize;
const GLOBAL_SIZE: vk::DeviceSize = std::mem::size_of::<GlobalUbo>() as vk::DeviceSize;

const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw(),
);

/// Instance records and per-instance colors for one frame
///
/// Draws whose mesh has no bottom level structure yet are skipped; at most
/// `capacity` instances are emitted. Custom indices address the color array.
pub fn build_instances(
    draws: &[DrawItem],
    capacity: usize,
    lookup: impl Fn(MeshHandle) -> Option<(vk::DeviceAddress, [f32; 4])>,
) -> (Vec<BlasInstance>, Vec<[f32; 4]>) {
    let mut instances = Vec::with_capacity(draws.len().min(capacity));
    let mut colors = Vec::with_capacity(draws.len().min(capacity));
    for draw in draws {
        if instances.len() == capacity {
            break;
        }
        let Some((blas_address, color)) = lookup(draw.mesh) else {
            continue;
        };
        instances.push(BlasInstance {
            blas_address,
            transform: draw.model,
            custom_index: u32::try_from(colors.len()).unwrap_or(u32::MAX),
        });
        colors.push(color);
    }
    (instances, colors)
}

/// Top level structures, traced image and the ray tracing pipeline
pub struct RayTracingSystem {
    pipeline: RayTracingPipeline,
    sets: Vec<vk::DescriptorSet>,
    top_levels: Vec<TopLevel>,
    colors: PerFrameBuffers,
    global_buffers: Vec<vk::Buffer>,
    bottom_levels: SecondaryMap<MeshHandle, AccelerationStructure>,
    loader: khr::AccelerationStructure,
    properties: RayTracingProperties,
    capacity: usize,
    framebuffer: FramebufferId,
    last_instances: usize,
    layout: DescriptorSetLayout,
}

impl RayTracingSystem {
    /// One set per frame slot: structure, output image, camera and colors
    pub fn descriptor_budget(config: &RendererConfig) -> DescriptorBudget {
        let slots = u32::try_from(config.max_frames_in_flight).unwrap_or(u32::MAX);
        [
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
        ]
        .into_iter()
        .fold(DescriptorBudget::new().sets(slots), |budget, ty| budget.descriptors(ty, slots))
    }

    /// Fails with [`VulkanError::RayTracingUnavailable`] unless the device was created with ray tracing
    pub fn new(init: &SystemInit, arena: &mut FramebufferArena) -> VulkanResult<Self> {
        let (Some(loaders), Some(properties)) = (
            init.context.ray_tracing_loaders(),
            init.context.physical_device().ray_tracing,
        ) else {
            return Err(VulkanError::RayTracingUnavailable);
        };
        let device = init.context.device();
        let allocator = init.context.allocator();
        let frames = init.config.max_frames_in_flight;
        let capacity = init.config.max_objects;

        let mut framebuffer = Framebuffer::new(&allocator);
        framebuffer.create_attachment(&Self::output_spec(init.swapchain.extent()))?;
        let framebuffer = arena.insert(framebuffer);

        let layout = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, STAGES, 1)?
            .add_binding(1, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::RAYGEN_KHR, 1)?
            .add_binding(2, vk::DescriptorType::UNIFORM_BUFFER, STAGES, 1)?
            .add_binding(3, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::CLOSEST_HIT_KHR, 1)?
            .build(device)?;
        let sets = (0..frames)
            .map(|_| init.pool.allocate_descriptor_set(&layout, None))
            .collect::<VulkanResult<Vec<_>>>()?;

        let colors = PerFrameBuffers::new(
            &allocator,
            frames,
            COLOR_SIZE * capacity.max(1) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let top_levels = (0..frames)
            .map(|_| {
                TopLevel::new(
                    &loaders.acceleration_structure,
                    &allocator,
                    u32::try_from(capacity).unwrap_or(u32::MAX),
                    properties.scratch_alignment,
                )
            })
            .collect::<VulkanResult<Vec<_>>>()?;
        let global_buffers = (0..frames).map(|i| init.globals.global_buffer(i).handle()).collect();

        let pipeline = RayTracingPipeline::new(
            device,
            &loaders.pipeline,
            &allocator,
            init.config,
            &properties,
            &[layout.handle()],
        )?;

        log::info!("Ray tracing viewport ready ({} instances per frame)", capacity);
        Ok(Self {
            pipeline,
            sets,
            top_levels,
            colors,
            global_buffers,
            bottom_levels: SecondaryMap::new(),
            loader: loaders.acceleration_structure.clone(),
            properties,
            capacity,
            framebuffer,
            last_instances: 0,
            layout,
        })
    }

    fn output_spec(extent: vk::Extent2D) -> AttachmentSpec {
        AttachmentSpec::color(RAY_TRACED_FORMAT, extent).with_usage(vk::ImageUsageFlags::STORAGE)
    }

    /// The traced image, shown by the UI in place of the raster viewport
    pub fn output_ref(&self) -> AttachmentRef {
        AttachmentRef {
            framebuffer: self.framebuffer,
            attachment: 0,
        }
    }

    /// Build bottom level structures for new meshes and drop those of removed ones
    ///
    /// Blocks until the builds finish; meshes are uploaded rarely.
    pub fn sync_meshes(&mut self, meshes: &MeshRegistry, uploads: &mut UploadQueue) -> VulkanResult<()> {
        self.bottom_levels.retain(|handle, _| meshes.get(handle).is_some());
        let mut built = 0;
        for (handle, mesh) in meshes.iter() {
            if self.bottom_levels.contains_key(handle) {
                continue;
            }
            let blas =
                AccelerationStructure::build_bottom_level(&self.loader, uploads, mesh, self.properties.scratch_alignment)?;
            self.bottom_levels.insert(handle, blas);
            built += 1;
        }
        if built > 0 {
            uploads.flush()?;
            log::debug!("Built {} bottom level structures", built);
        }
        Ok(())
    }

    /// Instances traced by the last frame
    pub fn last_instance_count(&self) -> usize {
        self.last_instances
    }

    fn image_barrier(
        image: vk::Image,
        (old_layout, new_layout): (vk::ImageLayout, vk::ImageLayout),
        (src_access, dst_access): (vk::AccessFlags, vk::AccessFlags),
    ) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build()
    }
}

impl RenderSystem for RayTracingSystem {
    fn name(&self) -> &'static str {
        "ray_tracing"
    }

    fn render(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        let slot = frame.frame_index % self.top_levels.len();
        let output = frame
            .targets
            .get(self.framebuffer)?
            .attachment(0)
            .ok_or(VulkanError::StaleAttachment)?;
        let (image, view) = (output.image().ok_or(VulkanError::StaleAttachment)?, output.view());

        let (instances, colors) = build_instances(frame.draws, self.capacity, |handle| {
            let blas = self.bottom_levels.get(handle)?;
            let mesh = frame.meshes.get(handle)?;
            Some((blas.device_address(), mesh.albedo))
        });
        if !colors.is_empty() {
            self.colors.get(slot).write_data(&colors)?;
        }

        let top_level = &mut self.top_levels[slot];
        top_level.record_build(recorder, &instances)?;
        let structure = top_level.handle().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "top level structure missing after build".to_string(),
        })?;

        DescriptorWriter::new(&self.layout, frame.pool)
            .write_acceleration_structures(0, &[structure])?
            .write_image(1, view, vk::Sampler::null(), vk::ImageLayout::GENERAL)?
            .write_buffer(2, self.global_buffers[slot], GLOBAL_SIZE)?
            .write_buffer(3, self.colors.get(slot).handle(), vk::WHOLE_SIZE)?
            .overwrite(self.sets[slot]);

        // the previous frame's UI may still be sampling the image
        let to_general = Self::image_barrier(
            image,
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
            (vk::AccessFlags::SHADER_READ, vk::AccessFlags::SHADER_WRITE),
        );
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            &[],
            &[to_general],
        )?;

        self.pipeline.trace(recorder, &[self.sets[slot]], frame.extent)?;

        let to_sampled = Self::image_barrier(
            image,
            (vk::ImageLayout::GENERAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            (vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_READ),
        );
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            &[],
            &[to_sampled],
        )?;

        self.last_instances = instances.len();
        log::trace!("Traced {} instances", instances.len());
        Ok(())
    }

    fn on_resize(&mut self, resize: &mut ResizeContext) -> VulkanResult<()> {
        let framebuffer = resize.arena.get_mut(self.framebuffer)?;
        framebuffer.clear_framebuffer();
        framebuffer.create_attachment(&Self::output_spec(resize.extent))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Mat4;
    use crate::scene::Entity;
    use slotmap::KeyData;

    fn draw(mesh: u64, object_index: u32) -> DrawItem {
        DrawItem {
            entity: Entity::default(),
            mesh: MeshHandle::from(KeyData::from_ffi(mesh)),
            object_index,
            model: Mat4::identity(),
        }
    }

    #[test]
    fn test_instances_skip_meshes_without_structures() {
        let draws = [draw(1, 0), draw(2, 1), draw(1, 2)];
        let known = MeshHandle::from(KeyData::from_ffi(1));
        let (instances, colors) = build_instances(&draws, 16, |handle| {
            (handle == known).then_some((0x1000, [1.0, 0.0, 0.0, 1.0]))
        });
        assert_eq!(instances.len(), 2);
        assert_eq!(colors.len(), 2);
        assert_eq!(instances[1].custom_index, 1);
        assert_eq!(instances[0].blas_address, 0x1000);
    }

    #[test]
    fn test_instances_respect_capacity() {
        let draws: Vec<DrawItem> = (0..5).map(|i| draw(1, i)).collect();
        let (instances, colors) = build_instances(&draws, 3, |_| Some((0x2000, [0.0; 4])));
        assert_eq!(instances.len(), 3);
        assert_eq!(colors.len(), 3);
    }

    #[test]
    fn test_output_is_storage_and_sampled() {
        let spec = RayTracingSystem::output_spec(vk::Extent2D { width: 8, height: 4 });
        assert!(spec.usage.contains(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED));
        assert_eq!(spec.format, RAY_TRACED_FORMAT);
    }
}
