//! Omnidirectional point light shadows
//!
//! One fixed-size depth cube per light slot, rendered with a multiview pass
//! so each mesh is drawn once and broadcast to all six faces. The cubes are
//! never resized; the opaque pass samples them.

use ash::vk;

use super::{RenderSystem, ResizeContext, SystemInit};
use crate::config::RendererConfig;
use crate::foundation::math::{cube_face_projection, cube_face_views};
use crate::render::backends::vulkan::rendering::{PipelineSettings, CUBE_VIEW_MASK};
use crate::render::backends::vulkan::resources::PerFrameBuffers;
use crate::render::backends::vulkan::state::{AttachmentSpec, Framebuffer};
use crate::render::backends::vulkan::{
    CommandRecorder, DescriptorBudget, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    GraphicsPipeline, GraphicsPipelineBuilder, VulkanError, VulkanResult,
};
use crate::render::frame::{aligned_stride, FrameInfo, LightItem};

/// Depth format of every shadow cube
pub const SHADOW_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

const SHADOW_NEAR: f32 = 0.05;
const SHADOW_UBO_SIZE: vk::DeviceSize = std::mem::size_of::<ShadowUbo>() as vk::DeviceSize;

/// Per-light view-projections, one per cube face
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowUbo {
    /// Face view-projections in cube layer order
    pub faces: [[[f32; 4]; 4]; 6],
    /// Light position in xyz, far plane in w
    pub light_position: [f32; 4],
}

unsafe impl bytemuck::Pod for ShadowUbo {}
unsafe impl bytemuck::Zeroable for ShadowUbo {}

impl ShadowUbo {
    /// Cube matrices for `light`; the far plane is its radius
    pub fn for_light(light: &LightItem) -> Self {
        let far = light.light.radius.max(SHADOW_NEAR * 2.0);
        let projection = cube_face_projection(SHADOW_NEAR, far);
        let faces = cube_face_views(light.position).map(|view| (projection * view).into());
        Self {
            faces,
            light_position: [light.position.x, light.position.y, light.position.z, far],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ModelPush {
    model: [[f32; 4]; 4],
}

unsafe impl bytemuck::Pod for ModelPush {}
unsafe impl bytemuck::Zeroable for ModelPush {}

/// Shadow cubes and the multiview pipeline that fills them
pub struct ShadowSystem {
    pipeline: GraphicsPipeline,
    sets: Vec<vk::DescriptorSet>,
    uniforms: PerFrameBuffers,
    stride: u64,
    cubes: Vec<Framebuffer>,
    _layout: DescriptorSetLayout,
}

impl ShadowSystem {
    /// One dynamic uniform set per frame slot
    pub fn descriptor_budget(config: &RendererConfig) -> DescriptorBudget {
        let slots = u32::try_from(config.max_frames_in_flight).unwrap_or(u32::MAX);
        DescriptorBudget::new()
            .sets(slots)
            .descriptors(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, slots)
    }

    /// Allocate `max_point_lights` cubes of `shadow_map_size` texels
    pub fn new(init: &SystemInit) -> VulkanResult<Self> {
        let device = init.context.device();
        let allocator = init.context.allocator();
        let lights = init.config.max_point_lights;
        let frames = init.config.max_frames_in_flight;
        let size = init.config.shadow_map_size;

        let cube_spec = AttachmentSpec::depth(SHADOW_FORMAT, vk::Extent2D { width: size, height: size })
            .with_layers(6, vk::ImageViewType::CUBE)
            .with_usage(vk::ImageUsageFlags::SAMPLED)
            .with_final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let cubes = (0..lights)
            .map(|_| {
                let mut cube = Framebuffer::new(&allocator);
                cube.create_attachment(&cube_spec)?;
                cube.create_multiview_render_pass(CUBE_VIEW_MASK)?;
                Ok(cube)
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        let layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                1,
            )?
            .build(device)?;

        let stride = aligned_stride(SHADOW_UBO_SIZE, init.context.physical_device().min_uniform_alignment());
        let uniforms = PerFrameBuffers::new(
            &allocator,
            frames,
            stride * lights as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        let sets = uniforms
            .iter()
            .map(|buffer| {
                DescriptorWriter::new(&layout, init.pool)
                    .write_buffer(0, buffer.handle(), SHADOW_UBO_SIZE)?
                    .build()
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        let render_pass = cubes
            .first()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "shadow system needs at least one light slot".to_string(),
            })?
            .render_pass()?;
        let pipeline = GraphicsPipelineBuilder::new("shadow_cube", "shadow_cube.vert.spv")
            .fragment_shader("shadow_cube.frag.spv")
            .settings(PipelineSettings {
                color_write: false,
                ..Default::default()
            })
            .set_layouts(&[layout.handle()])
            .push_constants::<ModelPush>(vk::ShaderStageFlags::VERTEX)
            .build(device, init.config, render_pass)?;

        log::info!("Shadow system: {} cubes of {}x{}", lights, size, size);
        Ok(Self {
            pipeline,
            sets,
            uniforms,
            stride,
            cubes,
            _layout: layout,
        })
    }

    /// Cube views in light order, sampled by the opaque pass
    pub fn cube_views(&self) -> Vec<vk::ImageView> {
        self.cubes
            .iter()
            .filter_map(|cube| cube.attachment(0).map(|a| a.view()))
            .collect()
    }

    /// Depth sampler shared by every cube
    pub fn sampler(&self) -> vk::Sampler {
        self.cubes.first().map_or_else(vk::Sampler::null, Framebuffer::sampler)
    }

    /// Number of light slots
    pub fn capacity(&self) -> usize {
        self.cubes.len()
    }

    fn write_uniforms(&self, frame_index: usize, lights: &[LightItem]) -> VulkanResult<()> {
        let buffer = self.uniforms.get(frame_index);
        for (index, light) in lights.iter().take(self.cubes.len()).enumerate() {
            let ubo = ShadowUbo::for_light(light);
            buffer.write_bytes(index as u64 * self.stride, bytemuck::bytes_of(&ubo))?;
        }
        Ok(())
    }
}

impl RenderSystem for ShadowSystem {
    fn name(&self) -> &'static str {
        "shadow"
    }

    fn render(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        self.write_uniforms(frame.frame_index, frame.lights)?;
        let set = self.sets[frame.frame_index % self.sets.len()];
        let clear = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
        };

        for (index, cube) in self.cubes.iter().enumerate() {
            let info = cube.render_info(vec![clear])?;
            let mut pass = recorder.begin_render_pass(&info)?;
            // unused slots are only cleared so the opaque pass samples "unlit"
            if index >= frame.lights.len() {
                continue;
            }

            pass.bind_graphics_pipeline(&self.pipeline)?;
            let offset = u32::try_from(index as u64 * self.stride).unwrap_or(u32::MAX);
            pass.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, 0, &[set], &[offset])?;
            for draw in frame.draws {
                let Some(mesh) = frame.meshes.get(draw.mesh) else {
                    continue;
                };
                let push = ModelPush {
                    model: draw.model.into(),
                };
                pass.push_constants(vk::ShaderStageFlags::VERTEX, &push)?;
                pass.bind_geometry(mesh.vertex_buffer.handle(), mesh.index_buffer.handle())?;
                pass.draw_indexed(mesh.index_count, 1)?;
            }
        }
        Ok(())
    }

    fn on_resize(&mut self, _resize: &mut ResizeContext) -> VulkanResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Mat4, Vec3, Vec4};
    use crate::scene::{Entity, PointLightComponent};
    use approx::assert_relative_eq;

    fn face_matrix(face: usize, far: f32) -> Mat4 {
        cube_face_projection(SHADOW_NEAR, far) * cube_face_views(Vec3::zeros())[face]
    }

    #[test]
    fn test_shadow_ubo_is_std140_sized() {
        assert_eq!(std::mem::size_of::<ShadowUbo>(), 6 * 64 + 16);
    }

    #[test]
    fn test_light_radius_sets_far_plane() {
        let light = LightItem {
            entity: Entity::default(),
            position: Vec3::new(1.0, 2.0, 3.0),
            light: PointLightComponent {
                radius: 12.0,
                ..Default::default()
            },
        };
        let ubo = ShadowUbo::for_light(&light);
        assert_eq!(ubo.light_position, [1.0, 2.0, 3.0, 12.0]);
    }

    #[test]
    fn test_positive_x_face_sees_points_on_positive_x() {
        let clip = face_matrix(0, 10.0) * Vec4::new(5.0, 0.0, 0.0, 1.0);
        let ndc_depth = clip.z / clip.w;
        assert!(clip.w > 0.0);
        assert!((0.0..=1.0).contains(&ndc_depth));
        assert_relative_eq!(clip.x / clip.w, 0.0, epsilon = 1e-5);
    }
}
