//! Entity picking under the cursor
//!
//! Runs only on frames with a pending pick. Meshes are redrawn against the
//! pre-pass depth with a 1x1 scissor at the cursor; the fragment shader of
//! the frontmost surface writes its object index into a host-visible storage
//! buffer owned by the frame slot. The result is read once that slot's fence
//! has signalled, so picking never stalls the frame.

use ash::vk;

use super::{borrowed_attachment, draw_object, RenderSystem, ResizeContext, SystemInit};
use crate::config::RendererConfig;
use crate::render::backends::vulkan::rendering::{PipelineSettings, RenderInfo};
use crate::render::backends::vulkan::resources::PerFrameBuffers;
use crate::render::backends::vulkan::state::{AttachmentRef, AttachmentSpec, Framebuffer, FramebufferId};
use crate::render::backends::vulkan::{
    CommandRecorder, DescriptorBudget, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    FramebufferArena, GraphicsPipeline, GraphicsPipelineBuilder, VulkanResult,
};
use crate::render::frame::{FrameInfo, NO_ENTITY};
use crate::scene::Entity;

const RESULT_SIZE: vk::DeviceSize = std::mem::size_of::<u32>() as vk::DeviceSize;

/// Outcome of one pick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickResult {
    /// The frontmost mesh under the cursor
    Hit(Entity),
    /// Background, or an index that no longer maps to an entity
    Miss,
}

impl PickResult {
    /// Selection after this pick; a miss clears it
    pub fn entity(self) -> Option<Entity> {
        match self {
            Self::Hit(entity) => Some(entity),
            Self::Miss => None,
        }
    }
}

/// 1x1 scissor at the cursor, clamped into the framebuffer
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn picking_scissor(cursor: (f64, f64), extent: vk::Extent2D) -> vk::Rect2D {
    let clamp = |value: f64, size: u32| -> i32 {
        let max = size.saturating_sub(1);
        let value = if value.is_finite() { value.max(0.0) } else { 0.0 };
        (value as u32).min(max) as i32
    };
    vk::Rect2D {
        offset: vk::Offset2D {
            x: clamp(cursor.0, extent.width),
            y: clamp(cursor.1, extent.height),
        },
        extent: vk::Extent2D { width: 1, height: 1 },
    }
}

/// Map the index written by the shader back to the entity drawn at it
pub fn resolve_pick(raw: u32, entities: &[Entity]) -> PickResult {
    if raw == NO_ENTITY {
        return PickResult::Miss;
    }
    entities
        .get(raw as usize)
        .copied()
        .map_or(PickResult::Miss, PickResult::Hit)
}

/// Depth-tested id readback against the borrowed pre-pass depth
pub struct MousePickingSystem {
    pipeline: GraphicsPipeline,
    sets: Vec<vk::DescriptorSet>,
    results: PerFrameBuffers,
    /// Entities in object order for each slot with an unread pick
    pending: Vec<Option<Vec<Entity>>>,
    framebuffer: FramebufferId,
    depth: AttachmentRef,
    _layout: DescriptorSetLayout,
}

impl MousePickingSystem {
    /// One result buffer set per frame slot
    pub fn descriptor_budget(config: &RendererConfig) -> DescriptorBudget {
        let slots = u32::try_from(config.max_frames_in_flight).unwrap_or(u32::MAX);
        DescriptorBudget::new()
            .sets(slots)
            .descriptors(vk::DescriptorType::STORAGE_BUFFER, slots)
    }

    /// Create the depth-only target over the borrowed pre-pass `depth`
    pub fn new(init: &SystemInit, arena: &mut FramebufferArena, depth: AttachmentRef) -> VulkanResult<Self> {
        let device = init.context.device();
        let frames = init.config.max_frames_in_flight;

        let mut framebuffer = Framebuffer::new(&init.context.allocator());
        Self::build_target(&mut framebuffer, borrowed_attachment(arena, depth)?)?;

        let layout = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::FRAGMENT, 1)?
            .build(device)?;
        let results = PerFrameBuffers::new(
            &init.context.allocator(),
            frames,
            RESULT_SIZE,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let sets = results
            .iter()
            .map(|buffer| {
                DescriptorWriter::new(&layout, init.pool)
                    .write_buffer(0, buffer.handle(), RESULT_SIZE)?
                    .build()
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        let pipeline = GraphicsPipelineBuilder::new("mouse_picking", "picking.vert.spv")
            .fragment_shader("picking.frag.spv")
            .settings(PipelineSettings {
                depth_write: false,
                color_write: false,
                ..Default::default()
            })
            .set_layouts(&[init.globals.layout().handle(), layout.handle()])
            .build(device, init.config, framebuffer.render_pass()?)?;

        let framebuffer = arena.insert(framebuffer);
        Ok(Self {
            pipeline,
            sets,
            results,
            pending: vec![None; frames],
            framebuffer,
            depth,
            _layout: layout,
        })
    }

    fn build_target(
        framebuffer: &mut Framebuffer,
        (depth_spec, depth_view): (AttachmentSpec, vk::ImageView),
    ) -> VulkanResult<()> {
        framebuffer.add_load_attachment(&depth_spec.loaded(), depth_view)?;
        framebuffer.create_render_pass()
    }

    /// Read every pick whose slot `finished` reports as complete
    ///
    /// Returns the most recent result; older ones are superseded.
    pub fn collect(&mut self, finished: impl Fn(usize) -> VulkanResult<bool>) -> VulkanResult<Option<PickResult>> {
        let mut latest = None;
        for slot in 0..self.pending.len() {
            if self.pending[slot].is_none() || !finished(slot)? {
                continue;
            }
            let raw = self.results.get(slot).read_data::<u32>(1)?;
            if let Some(entities) = self.pending[slot].take() {
                let result = resolve_pick(raw.first().copied().unwrap_or(NO_ENTITY), &entities);
                log::debug!("Pick resolved in slot {}: {:?}", slot, result);
                latest = Some(result);
            }
        }
        Ok(latest)
    }

    /// Whether any slot still holds an unread pick
    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(Option::is_some)
    }
}

impl RenderSystem for MousePickingSystem {
    fn name(&self) -> &'static str {
        "mouse_picking"
    }

    fn prepare_render_info(&self, frame: &FrameInfo) -> VulkanResult<Option<RenderInfo>> {
        let clear = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
        };
        frame.targets.get(self.framebuffer)?.render_info(vec![clear]).map(Some)
    }

    fn before_pass(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        recorder.fill_buffer(self.results.get(frame.frame_index).handle(), NO_ENTITY)?;
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_WRITE)
            .build();
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            &[barrier],
            &[],
        )
    }

    fn render(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        let Some(cursor) = frame.pick_cursor else {
            return Ok(());
        };
        recorder.bind_graphics_pipeline(&self.pipeline)?;
        recorder.set_scissor(picking_scissor(cursor, frame.extent))?;
        let set = self.sets[frame.frame_index % self.sets.len()];
        recorder.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, 1, &[set], &[])?;
        for draw in frame.draws {
            draw_object(frame, recorder, draw)?;
        }

        let slot = frame.frame_index % self.pending.len();
        self.pending[slot] = Some(frame.draws.iter().map(|draw| draw.entity).collect());
        Ok(())
    }

    fn after_pass(&mut self, _frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()> {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .build();
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::HOST,
            &[barrier],
            &[],
        )
    }

    fn on_resize(&mut self, resize: &mut ResizeContext) -> VulkanResult<()> {
        let borrowed = borrowed_attachment(resize.arena, self.depth)?;
        let framebuffer = resize.arena.get_mut(self.framebuffer)?;
        framebuffer.clear_framebuffer();
        Self::build_target(framebuffer, borrowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_scissor_is_one_pixel_at_cursor() {
        let scissor = picking_scissor((100.7, 20.2), extent(640, 480));
        assert_eq!((scissor.offset.x, scissor.offset.y), (100, 20));
        assert_eq!((scissor.extent.width, scissor.extent.height), (1, 1));
    }

    #[test]
    fn test_negative_cursor_clamps_to_zero() {
        let scissor = picking_scissor((-15.0, -0.5), extent(640, 480));
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 0));
    }

    #[test]
    fn test_cursor_past_edge_clamps_inside() {
        let scissor = picking_scissor((900.0, 480.0), extent(640, 480));
        assert_eq!((scissor.offset.x, scissor.offset.y), (639, 479));
    }

    #[test]
    fn test_resolve_pick() {
        let a = Entity::from(KeyData::from_ffi(1));
        let b = Entity::from(KeyData::from_ffi(2));
        assert_eq!(resolve_pick(1, &[a, b]), PickResult::Hit(b));
        assert_eq!(resolve_pick(NO_ENTITY, &[a, b]), PickResult::Miss);
        assert_eq!(resolve_pick(7, &[a, b]), PickResult::Miss);
        assert_eq!(PickResult::Hit(a).entity(), Some(a));
        assert_eq!(PickResult::Miss.entity(), None);
    }
}
