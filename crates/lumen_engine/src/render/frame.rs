//! Per-frame data shared by every render system
//!
//! [`FrameInfo`] is built on the stack once per frame by the renderer and
//! handed to each system by reference. Nothing in it outlives the frame.

use ash::vk;

use crate::foundation::math::{Mat4, Mat4Ext, Vec3};
use crate::render::backends::vulkan::{DescriptorPool, FramebufferArena, MeshRegistry, Swapchain};
use crate::render::mesh::MeshHandle;
use crate::scene::{Camera, Entity, MeshComponent, PointLightComponent, Scene, TransformComponent};

/// Size of the light array in the global uniform block
pub const MAX_POINT_LIGHTS: usize = 8;

/// Entity index written by the picking pass where nothing was hit
pub const NO_ENTITY: u32 = u32::MAX;

/// std140 point light: xyz position + radius, rgb color + intensity
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointLightData {
    /// World position in xyz, radius in w
    pub position_radius: [f32; 4],
    /// Linear color in rgb, intensity in a
    pub color_intensity: [f32; 4],
}

unsafe impl bytemuck::Pod for PointLightData {}
unsafe impl bytemuck::Zeroable for PointLightData {}

/// Set 0, binding 0: camera and lights
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalUbo {
    /// View-to-clip
    pub projection: [[f32; 4]; 4],
    /// World-to-view
    pub view: [[f32; 4]; 4],
    /// View-to-world, camera position in the last column
    pub inverse_view: [[f32; 4]; 4],
    /// Ambient rgb and strength
    pub ambient: [f32; 4],
    /// Number of valid entries in `lights`
    pub light_count: u32,
    _padding: [u32; 3],
    /// Point lights
    pub lights: [PointLightData; MAX_POINT_LIGHTS],
}

unsafe impl bytemuck::Pod for GlobalUbo {}
unsafe impl bytemuck::Zeroable for GlobalUbo {}

impl GlobalUbo {
    /// Fill from the camera and up to [`MAX_POINT_LIGHTS`] lights
    pub fn new(camera: &Camera, lights: &[LightItem], ambient: [f32; 4]) -> Self {
        let view = camera.view_matrix();
        let inverse_view = view.try_inverse().unwrap_or_else(Mat4::identity);
        let mut data = [PointLightData::default(); MAX_POINT_LIGHTS];
        for (slot, light) in data.iter_mut().zip(lights) {
            *slot = light.to_data();
        }
        Self {
            projection: camera.projection_matrix().into(),
            view: view.into(),
            inverse_view: inverse_view.into(),
            ambient,
            light_count: u32::try_from(lights.len().min(MAX_POINT_LIGHTS)).unwrap_or(0),
            _padding: [0; 3],
            lights: data,
        }
    }
}

/// Set 0, binding 1: one dynamic-offset block per drawn object
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectUbo {
    /// Object-to-world
    pub model: [[f32; 4]; 4],
    /// Inverse-transpose of `model`
    pub normal: [[f32; 4]; 4],
    /// Index into the frame's draw list, read back by picking
    pub entity_index: u32,
    _padding: [u32; 3],
}

unsafe impl bytemuck::Pod for ObjectUbo {}
unsafe impl bytemuck::Zeroable for ObjectUbo {}

impl ObjectUbo {
    /// Block for the object at `entity_index` with world transform `model`
    pub fn new(model: &Mat4, entity_index: u32) -> Self {
        Self {
            model: (*model).into(),
            normal: model.normal_matrix().into(),
            entity_index,
            _padding: [0; 3],
        }
    }
}

/// Round `size` up to the device's dynamic uniform offset alignment
pub fn aligned_stride(size: u64, min_alignment: u64) -> u64 {
    if min_alignment == 0 {
        size
    } else {
        size.div_ceil(min_alignment) * min_alignment
    }
}

/// One mesh entity to draw this frame
#[derive(Debug, Clone, PartialEq)]
pub struct DrawItem {
    /// Source entity
    pub entity: Entity,
    /// Registry mesh
    pub mesh: MeshHandle,
    /// Slot in the dynamic object buffer
    pub object_index: u32,
    /// World transform
    pub model: Mat4,
}

/// Every entity with both a transform and a mesh, numbered in view order
pub fn collect_draws(scene: &Scene, max_objects: usize) -> Vec<DrawItem> {
    scene
        .view2::<MeshComponent, TransformComponent>()
        .take(max_objects)
        .zip(0u32..)
        .map(|((entity, mesh, transform), object_index)| DrawItem {
            entity,
            mesh: mesh.mesh,
            object_index,
            model: transform.matrix(),
        })
        .collect()
}

/// One point light this frame
#[derive(Debug, Clone, PartialEq)]
pub struct LightItem {
    /// Source entity
    pub entity: Entity,
    /// World position
    pub position: Vec3,
    /// Light parameters
    pub light: PointLightComponent,
}

impl LightItem {
    fn to_data(&self) -> PointLightData {
        PointLightData {
            position_radius: [self.position.x, self.position.y, self.position.z, self.light.radius],
            color_intensity: [
                self.light.color.x,
                self.light.color.y,
                self.light.color.z,
                self.light.intensity,
            ],
        }
    }
}

/// Point lights with a transform, at most `max_lights`
pub fn collect_lights(scene: &Scene, max_lights: usize) -> Vec<LightItem> {
    scene
        .view2::<PointLightComponent, TransformComponent>()
        .take(max_lights.min(MAX_POINT_LIGHTS))
        .map(|(entity, light, transform)| LightItem {
            entity,
            position: transform.transform.position,
            light: light.clone(),
        })
        .collect()
}

/// Everything a render system may read while recording one frame
pub struct FrameInfo<'a> {
    /// Frame slot
    pub frame_index: usize,
    /// Seconds since the previous frame
    pub frame_time: f32,
    /// Acquired swapchain image
    pub image_index: u32,
    /// The slot's command buffer
    pub command_buffer: vk::CommandBuffer,
    /// Swapchain extent
    pub extent: vk::Extent2D,
    /// The slot's global descriptor set (camera, lights, objects)
    pub global_set: vk::DescriptorSet,
    /// Byte stride between object blocks in the dynamic buffer
    pub dynamic_stride: u32,
    /// Active camera
    pub camera: &'a Camera,
    /// Scene being drawn
    pub scene: &'a Scene,
    /// GPU meshes
    pub meshes: &'a MeshRegistry,
    /// Offscreen framebuffers
    pub targets: &'a FramebufferArena,
    /// Presentable images
    pub swapchain: &'a Swapchain,
    /// Shared descriptor pool, for systems rewriting their sets
    pub pool: &'a DescriptorPool,
    /// Mesh entities in object-buffer order
    pub draws: &'a [DrawItem],
    /// Lights in uniform-array order
    pub lights: &'a [LightItem],
    /// Editor selection
    pub selected: Option<Entity>,
    /// Cursor position when a pick was requested for this frame
    pub pick_cursor: Option<(f64, f64)>,
}

impl FrameInfo<'_> {
    /// Dynamic offset of `draw`'s object block
    pub fn object_offset(&self, draw: &DrawItem) -> u32 {
        draw.object_index * self.dynamic_stride
    }

    /// Draw item of the selected entity, if it is drawn at all
    pub fn selected_draw(&self) -> Option<&DrawItem> {
        let selected = self.selected?;
        self.draws.iter().find(|draw| draw.entity == selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::TransformComponent;
    use slotmap::KeyData;

    fn mesh_handle(index: u64) -> MeshHandle {
        MeshHandle::from(KeyData::from_ffi(index))
    }

    #[test]
    fn test_aligned_stride() {
        assert_eq!(aligned_stride(144, 256), 256);
        assert_eq!(aligned_stride(256, 256), 256);
        assert_eq!(aligned_stride(300, 64), 320);
        assert_eq!(aligned_stride(144, 0), 144);
    }

    #[test]
    fn test_ubo_layouts_are_std140_sized() {
        assert_eq!(std::mem::size_of::<PointLightData>(), 32);
        assert_eq!(std::mem::size_of::<ObjectUbo>(), 144);
        assert_eq!(std::mem::size_of::<GlobalUbo>() % 16, 0);
    }

    #[test]
    fn test_collect_draws_requires_transform_and_numbers_in_order() {
        let mut scene = Scene::new();
        let a = scene.create_entity();
        scene.insert(a, TransformComponent::default());
        scene.insert(a, MeshComponent { mesh: mesh_handle(1) });
        let untransformed = scene.create_entity();
        scene.insert(untransformed, MeshComponent { mesh: mesh_handle(1) });
        let b = scene.create_entity();
        scene.insert(b, TransformComponent::from_position(Vec3::new(1.0, 0.0, 0.0)));
        scene.insert(b, MeshComponent { mesh: mesh_handle(2) });

        let draws = collect_draws(&scene, 16);
        assert_eq!(draws.len(), 2);
        assert_eq!((draws[0].entity, draws[0].object_index), (a, 0));
        assert_eq!((draws[1].entity, draws[1].object_index), (b, 1));
        assert_eq!(draws[1].model[(0, 3)], 1.0);
    }

    #[test]
    fn test_collect_draws_respects_capacity() {
        let mut scene = Scene::new();
        for _ in 0..5 {
            let entity = scene.create_entity();
            scene.insert(entity, TransformComponent::default());
            scene.insert(entity, MeshComponent { mesh: mesh_handle(1) });
        }
        assert_eq!(collect_draws(&scene, 3).len(), 3);
    }

    #[test]
    fn test_global_ubo_packs_lights() {
        let mut scene = Scene::new();
        let light = scene.create_entity();
        scene.insert(light, TransformComponent::from_position(Vec3::new(0.0, 3.0, 0.0)));
        scene.insert(
            light,
            PointLightComponent {
                radius: 5.0,
                ..Default::default()
            },
        );
        let lights = collect_lights(&scene, 4);
        let ubo = GlobalUbo::new(&Camera::default(), &lights, [0.1, 0.1, 0.1, 1.0]);
        assert_eq!(ubo.light_count, 1);
        assert_eq!(ubo.lights[0].position_radius, [0.0, 3.0, 0.0, 5.0]);
    }
}
