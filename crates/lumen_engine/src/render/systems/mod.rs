//! Render systems and the per-frame pass schedule
//!
//! Every pass implements [`RenderSystem`]. The renderer builds a
//! [`FrameSchedule`] each frame from what the frame needs (a selection, a
//! pending pick, ray tracing) and walks its [`PassGroup`]s in order. Members
//! of one group record into the same render pass, so they must be built
//! against pipeline-compatible render passes.

pub mod depth_prepass;
pub mod mouse_picking;
pub mod opaque;
pub mod outline;
pub mod point_light;
pub mod ray_tracing;
pub mod shadow;
pub mod ui;

pub use depth_prepass::{DepthPrepassPlan, DepthPrepassSystem};
pub use mouse_picking::{picking_scissor, MousePickingSystem, PickResult};
pub use opaque::OpaqueSystem;
pub use outline::{outline_model, OutlineSystem};
pub use point_light::PointLightSystem;
pub use ray_tracing::RayTracingSystem;
pub use shadow::ShadowSystem;
pub use ui::{UiOverlay, UiSystem};

use ash::vk;
use bitflags::bitflags;

use crate::config::RendererConfig;
use crate::render::backends::vulkan::rendering::RenderInfo;
use crate::render::backends::vulkan::state::{AttachmentRef, AttachmentSpec};
use crate::render::backends::vulkan::{
    CommandRecorder, DescriptorBudget, DescriptorPool, FramebufferArena, Swapchain, VulkanContext, VulkanError,
    VulkanResult,
};
use crate::render::frame::{DrawItem, FrameInfo};
use crate::render::globals::GlobalResources;

/// One pass of the frame
///
/// `prepare_render_info` is called before the renderer begins the pass that
/// hosts the system; `before_pass` and `after_pass` record outside that pass
/// (clears, barriers) and `render` records inside it. Self-managed systems
/// return no render info and record everything from `render`.
pub trait RenderSystem {
    /// Debug name used in logs
    fn name(&self) -> &'static str;

    /// Begin info for the render pass this system owns, if any
    fn prepare_render_info(&self, _frame: &FrameInfo) -> VulkanResult<Option<RenderInfo>> {
        Ok(None)
    }

    /// Record work that must precede the pass
    fn before_pass(&mut self, _frame: &FrameInfo, _recorder: &mut CommandRecorder) -> VulkanResult<()> {
        Ok(())
    }

    /// Record the system's draws
    fn render(&mut self, frame: &FrameInfo, recorder: &mut CommandRecorder) -> VulkanResult<()>;

    /// Record work that must follow the pass
    fn after_pass(&mut self, _frame: &FrameInfo, _recorder: &mut CommandRecorder) -> VulkanResult<()> {
        Ok(())
    }

    /// Rebuild extent-dependent resources; borrowers re-resolve their refs
    fn on_resize(&mut self, resize: &mut ResizeContext) -> VulkanResult<()>;
}

/// What a system may touch while resizing
pub struct ResizeContext<'a> {
    /// New swapchain extent, never zero
    pub extent: vk::Extent2D,
    /// Owner of every offscreen framebuffer
    pub arena: &'a mut FramebufferArena,
    /// The rebuilt swapchain
    pub swapchain: &'a Swapchain,
    /// Shared pool the systems' sets came from
    pub pool: &'a DescriptorPool,
    /// Image the UI shows as the viewport, set once its owner has resized
    pub viewport: Option<AttachmentRef>,
}

/// Shared construction inputs
pub struct SystemInit<'a> {
    /// Device and loaders
    pub context: &'a VulkanContext,
    /// Renderer settings
    pub config: &'a RendererConfig,
    /// Swapchain the systems are first sized to
    pub swapchain: &'a Swapchain,
    /// Camera, light and object uniforms
    pub globals: &'a GlobalResources,
    /// Pool sized by [`SystemSet::descriptor_budget`], shared by every system
    pub pool: &'a DescriptorPool,
}

/// Identifies a concrete system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Scene depth and selection stencil
    DepthPrepass,
    /// Point light cube shadow maps
    Shadow,
    /// Lit mesh geometry
    Opaque,
    /// Light billboards
    PointLight,
    /// Selection outline
    Outline,
    /// Hardware ray traced viewport
    RayTracing,
    /// Viewport composite and editor overlay
    Ui,
    /// Entity id readback under the cursor
    MousePicking,
}

/// Render pass a group records into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTarget {
    /// The render pass owned by this system
    Owned(PassKind),
    /// The acquired swapchain image
    Swapchain,
    /// The system begins and ends its own passes
    SelfManaged,
}

/// Systems sharing one render pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassGroup {
    /// Pass the members record into
    pub target: PassTarget,
    /// Members in recording order
    pub members: Vec<PassKind>,
}

impl PassGroup {
    fn single(target: PassTarget, member: PassKind) -> Self {
        Self {
            target,
            members: vec![member],
        }
    }
}

bitflags! {
    /// What the current frame needs beyond the base passes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFeatures: u8 {
        /// An entity is selected; draw its outline
        const SELECTION = 1 << 0;
        /// A pick was requested for this frame
        const PICK_REQUESTED = 1 << 1;
        /// The viewport is ray traced
        const RAY_TRACING = 1 << 2;
        /// The depth format carries a stencil the outline can test against
        const STENCIL = 1 << 3;
    }
}

/// Ordered pass groups for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSchedule {
    groups: Vec<PassGroup>,
}

impl FrameSchedule {
    /// Pass order: depth pre-pass, shadow, opaque (with billboards and the
    /// outline), UI, then picking when a pick is pending
    ///
    /// The outline needs the selection stencil; without one it is skipped.
    /// Ray tracing replaces the raster viewport passes. The depth pre-pass
    /// survives only when picking needs its depth.
    pub fn build(features: FrameFeatures) -> Self {
        let mut groups = Vec::new();
        let picking = features.contains(FrameFeatures::PICK_REQUESTED);

        if features.contains(FrameFeatures::RAY_TRACING) {
            if picking {
                groups.push(PassGroup::single(
                    PassTarget::Owned(PassKind::DepthPrepass),
                    PassKind::DepthPrepass,
                ));
            }
            groups.push(PassGroup::single(PassTarget::SelfManaged, PassKind::RayTracing));
        } else {
            groups.push(PassGroup::single(
                PassTarget::Owned(PassKind::DepthPrepass),
                PassKind::DepthPrepass,
            ));
            groups.push(PassGroup::single(PassTarget::SelfManaged, PassKind::Shadow));

            let mut opaque = vec![PassKind::Opaque, PassKind::PointLight];
            if features.contains(FrameFeatures::SELECTION | FrameFeatures::STENCIL) {
                opaque.push(PassKind::Outline);
            }
            groups.push(PassGroup {
                target: PassTarget::Owned(PassKind::Opaque),
                members: opaque,
            });
        }

        groups.push(PassGroup::single(PassTarget::Swapchain, PassKind::Ui));
        if picking {
            groups.push(PassGroup::single(
                PassTarget::Owned(PassKind::MousePicking),
                PassKind::MousePicking,
            ));
        }
        Self { groups }
    }

    /// Groups in recording order
    pub fn groups(&self) -> &[PassGroup] {
        &self.groups
    }

    /// Every scheduled system in recording order
    pub fn passes(&self) -> impl Iterator<Item = PassKind> + '_ {
        self.groups.iter().flat_map(|group| group.members.iter().copied())
    }

    /// Whether `kind` records this frame
    pub fn contains(&self, kind: PassKind) -> bool {
        self.passes().any(|pass| pass == kind)
    }
}

/// Resize order: owners before borrowers, the UI last so it sees the new viewport
pub const RESIZE_ORDER: [PassKind; 8] = [
    PassKind::DepthPrepass,
    PassKind::Shadow,
    PassKind::Opaque,
    PassKind::PointLight,
    PassKind::Outline,
    PassKind::MousePicking,
    PassKind::RayTracing,
    PassKind::Ui,
];

/// Filters extents reported after swapchain recreation
///
/// Only a non-zero extent different from the last one applied triggers a
/// resize; repeated extents and minimized (zero) states are dropped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResizeTracker {
    applied: Option<(u32, u32)>,
}

impl ResizeTracker {
    /// Tracker already sized to `extent`
    pub fn new(extent: vk::Extent2D) -> Self {
        let mut tracker = Self::default();
        tracker.observe(extent);
        tracker
    }

    /// Returns the extent to resize to, if any
    pub fn observe(&mut self, extent: vk::Extent2D) -> Option<vk::Extent2D> {
        if extent.width == 0 || extent.height == 0 {
            return None;
        }
        let size = (extent.width, extent.height);
        if self.applied == Some(size) {
            return None;
        }
        self.applied = Some(size);
        Some(extent)
    }

    /// Last applied extent
    pub fn current(&self) -> Option<vk::Extent2D> {
        self.applied.map(|(width, height)| vk::Extent2D { width, height })
    }
}

/// Bind set 0 at `draw`'s object offset and draw its mesh
///
/// Returns `false` when the mesh is not in the registry; the draw is skipped.
pub(crate) fn draw_object(frame: &FrameInfo, recorder: &mut CommandRecorder, draw: &DrawItem) -> VulkanResult<bool> {
    let Some(mesh) = frame.meshes.get(draw.mesh) else {
        log::trace!("Entity {:?} references missing mesh {:?}", draw.entity, draw.mesh);
        return Ok(false);
    };
    recorder.bind_descriptor_sets(
        vk::PipelineBindPoint::GRAPHICS,
        0,
        &[frame.global_set],
        &[frame.object_offset(draw)],
    )?;
    recorder.bind_geometry(mesh.vertex_buffer.handle(), mesh.index_buffer.handle())?;
    recorder.draw_indexed(mesh.index_count, 1)?;
    Ok(true)
}

/// Spec and current view of an attachment owned by another system
pub(crate) fn borrowed_attachment(
    arena: &FramebufferArena,
    reference: AttachmentRef,
) -> VulkanResult<(AttachmentSpec, vk::ImageView)> {
    let spec = *arena
        .get(reference.framebuffer)?
        .attachment(reference.attachment)
        .ok_or(VulkanError::StaleAttachment)?
        .spec();
    Ok((spec, arena.resolve(reference)?))
}

/// Every concrete system, owned by the renderer
pub struct SystemSet {
    /// Depth and selection stencil
    pub depth_prepass: DepthPrepassSystem,
    /// Cube shadow maps
    pub shadow: ShadowSystem,
    /// Lit geometry
    pub opaque: OpaqueSystem,
    /// Light billboards
    pub point_light: PointLightSystem,
    /// Selection outline
    pub outline: OutlineSystem,
    /// Cursor picking
    pub mouse_picking: MousePickingSystem,
    /// Present only on ray tracing capable devices with the feature enabled
    pub ray_tracing: Option<RayTracingSystem>,
    /// Viewport composite
    pub ui: UiSystem,
}

impl SystemSet {
    /// Whether [`SystemSet::new`] builds the ray tracing system
    pub fn wants_ray_tracing(config: &RendererConfig, context: &VulkanContext) -> bool {
        config.enable_ray_tracing && context.ray_tracing_enabled()
    }

    /// Sets and descriptors every system allocates from the shared pool
    pub fn descriptor_budget(config: &RendererConfig, ray_tracing: bool) -> DescriptorBudget {
        let budget = DescriptorBudget::new()
            .merge(&ShadowSystem::descriptor_budget(config))
            .merge(&OpaqueSystem::descriptor_budget(config))
            .merge(&MousePickingSystem::descriptor_budget(config))
            .merge(&UiSystem::descriptor_budget());
        if ray_tracing {
            budget.merge(&RayTracingSystem::descriptor_budget(config))
        } else {
            budget
        }
    }

    /// Build every system, sizing owned targets to the swapchain
    pub fn new(init: &SystemInit, arena: &mut FramebufferArena) -> VulkanResult<Self> {
        let depth_prepass = DepthPrepassSystem::new(init, arena)?;
        let depth = depth_prepass.depth_ref();
        let shadow = ShadowSystem::new(init)?;
        let opaque = OpaqueSystem::new(init, arena, depth, &shadow)?;
        let color_pass = arena.get(opaque.framebuffer_id())?.render_pass()?;
        let point_light = PointLightSystem::new(init, color_pass)?;
        let outline = OutlineSystem::new(init, color_pass)?;
        let mouse_picking = MousePickingSystem::new(init, arena, depth)?;

        let ray_tracing = if Self::wants_ray_tracing(init.config, init.context) {
            Some(RayTracingSystem::new(init, arena)?)
        } else {
            None
        };
        let viewport = ray_tracing
            .as_ref()
            .map_or_else(|| opaque.color_ref(), RayTracingSystem::output_ref);
        let ui = UiSystem::new(init, arena, viewport)?;

        log::info!(
            "Render systems ready (ray tracing {})",
            if ray_tracing.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            depth_prepass,
            shadow,
            opaque,
            point_light,
            outline,
            mouse_picking,
            ray_tracing,
            ui,
        })
    }

    /// System behind `kind`; `None` for ray tracing when it is disabled
    pub fn system_mut(&mut self, kind: PassKind) -> Option<&mut dyn RenderSystem> {
        match kind {
            PassKind::DepthPrepass => Some(&mut self.depth_prepass),
            PassKind::Shadow => Some(&mut self.shadow),
            PassKind::Opaque => Some(&mut self.opaque),
            PassKind::PointLight => Some(&mut self.point_light),
            PassKind::Outline => Some(&mut self.outline),
            PassKind::RayTracing => self.ray_tracing.as_mut().map(|rt| rt as &mut dyn RenderSystem),
            PassKind::Ui => Some(&mut self.ui),
            PassKind::MousePicking => Some(&mut self.mouse_picking),
        }
    }

    /// Attachment the UI presents as the viewport
    pub fn viewport_ref(&self) -> AttachmentRef {
        self.ray_tracing
            .as_ref()
            .map_or_else(|| self.opaque.color_ref(), RayTracingSystem::output_ref)
    }

    /// Resize every system in [`RESIZE_ORDER`]
    pub fn resize(
        &mut self,
        extent: vk::Extent2D,
        arena: &mut FramebufferArena,
        swapchain: &Swapchain,
        pool: &DescriptorPool,
    ) -> VulkanResult<()> {
        let mut resize = ResizeContext {
            extent,
            arena,
            swapchain,
            pool,
            viewport: None,
        };
        for kind in RESIZE_ORDER {
            if kind == PassKind::Ui {
                resize.viewport = Some(self.viewport_ref());
            }
            if let Some(system) = self.system_mut(kind) {
                log::trace!("Resizing {} to {}x{}", system.name(), extent.width, extent.height);
                system.on_resize(&mut resize)?;
            }
        }
        log::info!("Render systems resized to {}x{}", extent.width, extent.height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_raster_schedule_order() {
        let schedule = FrameSchedule::build(
            FrameFeatures::SELECTION | FrameFeatures::STENCIL | FrameFeatures::PICK_REQUESTED,
        );
        let passes: Vec<_> = schedule.passes().collect();
        assert_eq!(
            passes,
            vec![
                PassKind::DepthPrepass,
                PassKind::Shadow,
                PassKind::Opaque,
                PassKind::PointLight,
                PassKind::Outline,
                PassKind::Ui,
                PassKind::MousePicking,
            ]
        );
        assert_eq!(schedule.groups()[2].target, PassTarget::Owned(PassKind::Opaque));
        assert_eq!(schedule.groups()[3].target, PassTarget::Swapchain);
    }

    #[test]
    fn test_outline_and_picking_are_conditional() {
        let schedule = FrameSchedule::build(FrameFeatures::empty());
        assert!(!schedule.contains(PassKind::Outline));
        assert!(!schedule.contains(PassKind::MousePicking));
        assert!(schedule.contains(PassKind::DepthPrepass));
        assert_eq!(schedule.groups().last().map(|g| g.target), Some(PassTarget::Swapchain));
    }

    #[test]
    fn test_selection_without_stencil_skips_outline() {
        let schedule = FrameSchedule::build(FrameFeatures::SELECTION);
        assert!(!schedule.contains(PassKind::Outline));
        assert_eq!(schedule.groups()[2].members, vec![PassKind::Opaque, PassKind::PointLight]);

        let stencil_only = FrameSchedule::build(FrameFeatures::STENCIL);
        assert!(!stencil_only.contains(PassKind::Outline));
    }

    #[test]
    fn test_system_budget_counts_ray_tracing_only_when_built() {
        let mut config = RendererConfig::new("budget");
        config.max_frames_in_flight = 2;
        config.max_point_lights = 4;

        let raster = SystemSet::descriptor_budget(&config, false);
        // shadow 2 + opaque 1 + picking 2 + ui 1
        assert_eq!(raster.set_count(), 6);
        let count = |budget: &DescriptorBudget, ty: vk::DescriptorType| {
            budget
                .pool_sizes()
                .iter()
                .find(|size| size.ty == ty)
                .map_or(0, |size| size.descriptor_count)
        };
        assert_eq!(count(&raster, vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 5);
        assert_eq!(count(&raster, vk::DescriptorType::STORAGE_BUFFER), 2);
        assert_eq!(count(&raster, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR), 0);

        let traced = SystemSet::descriptor_budget(&config, true);
        assert_eq!(traced.set_count(), 8);
        assert_eq!(count(&traced, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR), 2);
        assert_eq!(count(&traced, vk::DescriptorType::STORAGE_BUFFER), 4);
    }

    #[test]
    fn test_ray_tracing_replaces_raster_viewport() {
        let schedule = FrameSchedule::build(FrameFeatures::RAY_TRACING | FrameFeatures::SELECTION);
        let passes: Vec<_> = schedule.passes().collect();
        assert_eq!(passes, vec![PassKind::RayTracing, PassKind::Ui]);

        let picking = FrameSchedule::build(FrameFeatures::RAY_TRACING | FrameFeatures::PICK_REQUESTED);
        let passes: Vec<_> = picking.passes().collect();
        assert_eq!(
            passes,
            vec![PassKind::DepthPrepass, PassKind::RayTracing, PassKind::Ui, PassKind::MousePicking]
        );
    }

    #[test]
    fn test_resize_order_puts_owners_first_and_ui_last() {
        let position = |kind| RESIZE_ORDER.iter().position(|k| *k == kind);
        assert!(position(PassKind::DepthPrepass) < position(PassKind::Opaque));
        assert!(position(PassKind::DepthPrepass) < position(PassKind::MousePicking));
        assert_eq!(position(PassKind::Ui), Some(RESIZE_ORDER.len() - 1));
    }

    #[test]
    fn test_resize_tracker_ignores_zero_and_repeated_extents() {
        let mut tracker = ResizeTracker::new(extent(1280, 720));
        assert_eq!(tracker.observe(extent(1280, 720)), None);
        assert_eq!(tracker.observe(extent(0, 0)), None);
        assert_eq!(tracker.observe(extent(640, 0)), None);
        assert_eq!(tracker.observe(extent(640, 480)), Some(extent(640, 480)));
        assert_eq!(tracker.observe(extent(640, 480)), None);
        assert_eq!(tracker.current(), Some(extent(640, 480)));
    }

    #[test]
    fn test_minimize_restore_to_same_size_skips_resize() {
        let mut tracker = ResizeTracker::new(extent(800, 600));
        assert_eq!(tracker.observe(extent(0, 0)), None);
        assert_eq!(tracker.observe(extent(800, 600)), None);
        assert_eq!(tracker.current(), Some(extent(800, 600)));
    }
}
