//! Per-slot camera, light and object uniforms
//!
//! Set 0 of every scene pipeline: binding 0 is the [`GlobalUbo`], binding 1
//! a dynamic uniform buffer holding one [`ObjectUbo`] per drawn entity at a
//! stride aligned to the device's minimum offset alignment. Each frame slot
//! has its own buffers and set, so the CPU only writes a slot after its fence.

use ash::vk;

use crate::config::RendererConfig;
use crate::render::backends::vulkan::resources::PerFrameBuffers;
use crate::render::backends::vulkan::{
    Buffer, DescriptorBudget, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    VulkanContext, VulkanResult,
};
use crate::render::frame::{aligned_stride, DrawItem, GlobalUbo, ObjectUbo};

const GLOBAL_SIZE: vk::DeviceSize = std::mem::size_of::<GlobalUbo>() as vk::DeviceSize;
const OBJECT_SIZE: vk::DeviceSize = std::mem::size_of::<ObjectUbo>() as vk::DeviceSize;

/// Stages reading set 0
pub const GLOBAL_STAGES: vk::ShaderStageFlags =
    vk::ShaderStageFlags::from_raw(vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw());

/// Object blocks for `draws`, each at `draw.object_index * stride`
pub fn pack_objects(draws: &[DrawItem], stride: u64) -> Vec<u8> {
    let stride = usize::try_from(stride).unwrap_or(usize::MAX);
    let mut bytes = vec![0u8; draws.len() * stride];
    for draw in draws {
        let offset = draw.object_index as usize * stride;
        let object = ObjectUbo::new(&draw.model, draw.object_index);
        if let Some(slot) = bytes.get_mut(offset..offset + OBJECT_SIZE as usize) {
            slot.copy_from_slice(bytemuck::bytes_of(&object));
        }
    }
    bytes
}

/// Set 0 layout, buffers and one set per frame slot
pub struct GlobalResources {
    sets: Vec<vk::DescriptorSet>,
    globals: PerFrameBuffers,
    objects: PerFrameBuffers,
    object_stride: u64,
    max_objects: usize,
    layout: DescriptorSetLayout,
}

impl GlobalResources {
    /// One set per frame slot holding both uniform bindings
    pub fn descriptor_budget(config: &RendererConfig) -> DescriptorBudget {
        let slots = u32::try_from(config.max_frames_in_flight).unwrap_or(u32::MAX);
        DescriptorBudget::new()
            .sets(slots)
            .descriptors(vk::DescriptorType::UNIFORM_BUFFER, slots)
            .descriptors(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, slots)
    }

    /// Allocate buffers for `config.max_objects` objects in every slot
    pub fn new(context: &VulkanContext, config: &RendererConfig, pool: &DescriptorPool) -> VulkanResult<Self> {
        let device = context.device();
        let allocator = context.allocator();
        let frames = config.max_frames_in_flight;
        let object_stride = aligned_stride(OBJECT_SIZE, context.physical_device().min_uniform_alignment());

        let layout = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, GLOBAL_STAGES, 1)?
            .add_binding(1, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, GLOBAL_STAGES, 1)?
            .build(device)?;

        let globals = PerFrameBuffers::new(&allocator, frames, GLOBAL_SIZE, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        let objects = PerFrameBuffers::new(
            &allocator,
            frames,
            object_stride * config.max_objects as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;

        let sets = (0..frames)
            .map(|slot| {
                DescriptorWriter::new(&layout, pool)
                    .write_buffer(0, globals.get(slot).handle(), GLOBAL_SIZE)?
                    .write_buffer(1, objects.get(slot).handle(), OBJECT_SIZE)?
                    .build()
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        log::debug!(
            "Global uniforms: {} slots, {} objects at stride {}",
            frames,
            config.max_objects,
            object_stride
        );
        Ok(Self {
            sets,
            globals,
            objects,
            object_stride,
            max_objects: config.max_objects,
            layout,
        })
    }

    /// Write the slot's uniforms; the slot's fence must have been waited on
    pub fn update(&self, frame_index: usize, global: &GlobalUbo, draws: &[DrawItem]) -> VulkanResult<()> {
        self.globals.get(frame_index).write_data(std::slice::from_ref(global))?;
        if !draws.is_empty() {
            self.objects
                .get(frame_index)
                .write_bytes(0, &pack_objects(draws, self.object_stride))?;
        }
        Ok(())
    }

    /// Set 0 for `frame_index`
    pub fn set(&self, frame_index: usize) -> vk::DescriptorSet {
        self.sets[frame_index % self.sets.len()]
    }

    /// Set 0 layout
    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    /// Global uniform buffer of `frame_index`
    pub fn global_buffer(&self, frame_index: usize) -> &Buffer {
        self.globals.get(frame_index)
    }

    /// Byte stride between object blocks
    pub fn object_stride(&self) -> u32 {
        u32::try_from(self.object_stride).unwrap_or(u32::MAX)
    }

    /// Capacity of the object buffer
    pub fn max_objects(&self) -> usize {
        self.max_objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Mat4;
    use crate::render::mesh::MeshHandle;
    use crate::scene::Entity;
    use slotmap::KeyData;

    fn draw(object_index: u32) -> DrawItem {
        DrawItem {
            entity: Entity::from(KeyData::from_ffi(u64::from(object_index) + 1)),
            mesh: MeshHandle::default(),
            object_index,
            model: Mat4::new_translation(&crate::foundation::math::Vec3::new(object_index as f32, 0.0, 0.0)),
        }
    }

    #[test]
    fn test_pack_objects_places_blocks_at_stride() {
        let bytes = pack_objects(&[draw(0), draw(1)], 256);
        assert_eq!(bytes.len(), 512);

        let second: ObjectUbo = bytemuck::pod_read_unaligned(&bytes[256..256 + OBJECT_SIZE as usize]);
        assert_eq!(second.entity_index, 1);
        // column-major: translation lives in the fourth column
        assert_eq!(second.model[3][0], 1.0);
        assert!(bytes[OBJECT_SIZE as usize..256].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_pack_objects_empty() {
        assert!(pack_objects(&[], 256).is_empty());
    }
}
