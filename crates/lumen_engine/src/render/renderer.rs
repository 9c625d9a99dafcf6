//! Frame orchestration
//!
//! [`Renderer`] owns the device, the presenter and every render system. Each
//! [`Renderer::draw_frame`] acquires an image, refreshes the slot's uniforms,
//! walks the frame's [`FrameSchedule`] and presents. Whenever the presenter
//! rebuilds the swapchain, systems are resized before the next recording.

use ash::vk;

use crate::config::RendererConfig;
use crate::render::backends::vulkan::{
    AttachmentRef, CommandRecorder, DescriptorPool, FrameEnd, FramebufferArena, MeshRegistry, Presenter, UploadQueue,
    VulkanContext, VulkanError, VulkanResult,
};
use crate::render::frame::{collect_draws, collect_lights, FrameInfo, GlobalUbo};
use crate::render::globals::GlobalResources;
use crate::render::mesh::{Mesh, MeshHandle};
use crate::render::systems::{
    FrameFeatures, FrameSchedule, PassGroup, PassTarget, PickResult, ResizeTracker, SystemInit, SystemSet, UiOverlay,
};
use crate::scene::{Camera, Entity, Scene};
use crate::window::Window;

const AMBIENT: [f32; 4] = [1.0, 1.0, 1.0, 0.08];

/// What happened to one call of [`Renderer::draw_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Recorded, submitted and presented
    Presented,
    /// Presented, then the swapchain and systems were rebuilt
    Recreated,
    /// The surface was out of date at acquire; nothing was recorded
    Skipped,
}

impl FrameOutcome {
    /// Whether the swapchain was rebuilt, which consumes a pending resize
    pub fn rebuilt_swapchain(self) -> bool {
        matches!(self, FrameOutcome::Recreated | FrameOutcome::Skipped)
    }
}

/// Features of a frame from the renderer's state
pub fn frame_features(selection: bool, stencil: bool, pick: bool, ray_tracing: bool) -> FrameFeatures {
    let mut features = FrameFeatures::empty();
    features.set(FrameFeatures::SELECTION, selection);
    features.set(FrameFeatures::STENCIL, stencil);
    features.set(FrameFeatures::PICK_REQUESTED, pick);
    features.set(FrameFeatures::RAY_TRACING, ray_tracing);
    features
}

/// Device, presentation and the render systems
pub struct Renderer {
    // Systems reference arena targets and device objects; drop them first
    systems: SystemSet,
    globals: GlobalResources,
    descriptor_pool: DescriptorPool,
    arena: FramebufferArena,
    meshes: MeshRegistry,
    uploads: UploadQueue,
    presenter: Presenter,
    context: VulkanContext,

    config: RendererConfig,
    resize: ResizeTracker,
    selected: Option<Entity>,
    pick_request: Option<(f64, f64)>,
    pick_result: Option<PickResult>,
    last_schedule: Option<FrameSchedule>,
    frames_presented: u64,
}

impl Renderer {
    /// Create the device, swapchain and every render system
    pub fn new(window: &mut Window, config: &RendererConfig) -> VulkanResult<Self> {
        log::debug!("Creating renderer...");
        let context = VulkanContext::new(window, config)?;
        let presenter = Presenter::new(&context, window, config)?;
        let uploads = UploadQueue::new(&context)?;
        let meshes = MeshRegistry::new(context.ray_tracing_enabled());
        let budget = GlobalResources::descriptor_budget(config).merge(&SystemSet::descriptor_budget(
            config,
            SystemSet::wants_ray_tracing(config, &context),
        ));
        let descriptor_pool = DescriptorPool::from_budget(context.device().clone(), &budget, false)?;
        let globals = GlobalResources::new(&context, config, &descriptor_pool)?;
        let mut arena = FramebufferArena::new();

        let systems = {
            let init = SystemInit {
                context: &context,
                config,
                swapchain: presenter.swapchain()?,
                globals: &globals,
                pool: &descriptor_pool,
            };
            SystemSet::new(&init, &mut arena)?
        };
        let resize = ResizeTracker::new(presenter.extent());

        log::info!(
            "Renderer ready: {}x{}, {} offscreen targets",
            presenter.extent().width,
            presenter.extent().height,
            arena.len()
        );
        Ok(Self {
            systems,
            globals,
            descriptor_pool,
            arena,
            meshes,
            uploads,
            presenter,
            context,
            config: config.clone(),
            resize,
            selected: None,
            pick_request: None,
            pick_result: None,
            last_schedule: None,
            frames_presented: 0,
        })
    }

    /// Upload `mesh`; frames that draw it wait for the transfer first
    pub fn upload_mesh(&mut self, mesh: &Mesh) -> VulkanResult<MeshHandle> {
        let handle = self.meshes.upload(&mut self.uploads, mesh)?;
        if let Some(ray_tracing) = self.systems.ray_tracing.as_mut() {
            ray_tracing.sync_meshes(&self.meshes, &mut self.uploads)?;
        }
        Ok(handle)
    }

    /// Free a mesh once no frame in flight can still draw it
    pub fn remove_mesh(&mut self, handle: MeshHandle) -> VulkanResult<bool> {
        self.context.wait_idle()?;
        let removed = self.meshes.remove(handle).is_some();
        if let Some(ray_tracing) = self.systems.ray_tracing.as_mut() {
            ray_tracing.sync_meshes(&self.meshes, &mut self.uploads)?;
        }
        Ok(removed)
    }

    /// Entity outlined from the next frame on
    pub fn select(&mut self, entity: Option<Entity>) {
        self.selected = entity;
    }

    /// Current selection
    pub fn selected(&self) -> Option<Entity> {
        self.selected
    }

    /// Record a picking pass at `cursor` (framebuffer pixels) in the next frame
    pub fn request_pick(&mut self, cursor: (f64, f64)) {
        self.pick_request = Some(cursor);
    }

    /// Latest pick whose frame has finished on the GPU
    pub fn take_pick_result(&mut self) -> Option<PickResult> {
        self.pick_result.take()
    }

    /// Whether a pick is requested or recorded but not yet read back
    pub fn pick_pending(&self) -> bool {
        self.pick_request.is_some() || self.systems.mouse_picking.has_pending()
    }

    /// Extent of the viewport image, equal to the swapchain's
    pub fn viewport_extent(&self) -> vk::Extent2D {
        self.presenter.extent()
    }

    /// Current extent of the framebuffer behind `reference`
    pub fn target_extent(&self, reference: AttachmentRef) -> VulkanResult<vk::Extent2D> {
        Ok(self.arena.get(reference.framebuffer)?.extent())
    }

    /// Whether the viewport is ray traced
    pub fn ray_tracing_active(&self) -> bool {
        self.systems.ray_tracing.is_some()
    }

    /// Schedule of the last recorded frame
    pub fn last_schedule(&self) -> Option<&FrameSchedule> {
        self.last_schedule.as_ref()
    }

    /// Frames submitted since creation
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Render systems, for inspection
    pub fn systems(&self) -> &SystemSet {
        &self.systems
    }

    /// Block until the GPU is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.context.wait_idle()
    }

    /// Record and present one frame of `scene` seen from `camera`
    pub fn draw_frame(
        &mut self,
        window: &mut Window,
        scene: &Scene,
        camera: &Camera,
        frame_time: f32,
        overlay: &mut dyn UiOverlay,
    ) -> VulkanResult<FrameOutcome> {
        self.uploads.poll()?;

        let Some(start) = self.presenter.begin_frame(&self.context, window)? else {
            return self.settle(window, FrameOutcome::Skipped);
        };
        let mut recorder = start.recorder;
        let frame_index = start.frame_index;

        let presenter = &self.presenter;
        if let Some(result) = self.systems.mouse_picking.collect(|slot| {
            if slot == frame_index {
                Ok(true)
            } else {
                presenter.slot_finished(slot)
            }
        })? {
            self.pick_result = Some(result);
        }

        let draws = collect_draws(scene, self.config.max_objects);
        // Only meshes drawn this frame must be resident
        for draw in &draws {
            if let Some(mesh) = self.meshes.get(draw.mesh) {
                let ticket = mesh.upload_ticket();
                if !self.uploads.is_complete(ticket) {
                    self.uploads.wait(ticket)?;
                }
            }
        }
        let lights = collect_lights(scene, self.config.max_point_lights);
        self.globals
            .update(frame_index, &GlobalUbo::new(camera, &lights, AMBIENT), &draws)?;

        let pick_cursor = self.pick_request.take();
        let schedule = FrameSchedule::build(frame_features(
            self.selected.is_some(),
            self.systems.depth_prepass.writes_stencil(),
            pick_cursor.is_some(),
            self.systems.ray_tracing.is_some(),
        ));

        {
            let frame = FrameInfo {
                frame_index,
                frame_time,
                image_index: start.image_index,
                command_buffer: recorder.handle(),
                extent: self.presenter.extent(),
                global_set: self.globals.set(frame_index),
                dynamic_stride: self.globals.object_stride(),
                camera,
                scene,
                meshes: &self.meshes,
                targets: &self.arena,
                swapchain: self.presenter.swapchain()?,
                pool: &self.descriptor_pool,
                draws: &draws,
                lights: &lights,
                selected: self.selected,
                pick_cursor,
            };
            for group in schedule.groups() {
                record_group(&mut self.systems, group, &frame, &mut recorder, &self.config, overlay)?;
            }
        }
        log::trace!(
            "Recorded frame {} into slot {}: {} draws, {} lights",
            self.frames_presented,
            frame_index,
            draws.len(),
            lights.len()
        );
        self.last_schedule = Some(schedule);

        let resized = window.was_resized();
        let end = self.presenter.end_frame(&self.context, window, recorder, resized)?;
        self.frames_presented += 1;
        let outcome = match end {
            FrameEnd::Presented => FrameOutcome::Presented,
            FrameEnd::Recreated => FrameOutcome::Recreated,
        };
        self.settle(window, outcome)
    }

    /// After a rebuild the window's resize is consumed and systems follow the new extent
    fn settle(&mut self, window: &mut Window, outcome: FrameOutcome) -> VulkanResult<FrameOutcome> {
        if outcome.rebuilt_swapchain() {
            window.reset_resized_flag();
            self.resize_if_needed()?;
        }
        Ok(outcome)
    }

    fn resize_if_needed(&mut self) -> VulkanResult<()> {
        let Some(extent) = self.resize.observe(self.presenter.extent()) else {
            return Ok(());
        };
        let swapchain = self.presenter.swapchain()?;
        self.systems
            .resize(extent, &mut self.arena, swapchain, &self.descriptor_pool)
    }
}

fn record_group(
    systems: &mut SystemSet,
    group: &PassGroup,
    frame: &FrameInfo,
    recorder: &mut CommandRecorder,
    config: &RendererConfig,
    overlay: &mut dyn UiOverlay,
) -> VulkanResult<()> {
    match group.target {
        PassTarget::SelfManaged => {
            for &kind in &group.members {
                if let Some(system) = systems.system_mut(kind) {
                    system.render(frame, recorder)?;
                }
            }
        }
        PassTarget::Swapchain => {
            let info = frame.swapchain.render_info(frame.image_index, config.clear_color)?;
            let mut pass = recorder.begin_render_pass(&info)?;
            for &kind in &group.members {
                if let Some(system) = systems.system_mut(kind) {
                    system.render(frame, &mut pass)?;
                }
            }
            overlay.record(frame, &mut pass)?;
        }
        PassTarget::Owned(owner) => {
            let info = systems
                .system_mut(owner)
                .ok_or_else(|| missing_system(owner))?
                .prepare_render_info(frame)?
                .ok_or_else(|| VulkanError::InvalidOperation {
                    reason: format!("{:?} owns no render pass", owner),
                })?;
            for &kind in &group.members {
                if let Some(system) = systems.system_mut(kind) {
                    system.before_pass(frame, recorder)?;
                }
            }
            {
                let mut pass = recorder.begin_render_pass(&info)?;
                for &kind in &group.members {
                    if let Some(system) = systems.system_mut(kind) {
                        system.render(frame, &mut pass)?;
                    }
                }
            }
            for &kind in &group.members {
                if let Some(system) = systems.system_mut(kind) {
                    system.after_pass(frame, recorder)?;
                }
            }
        }
    }
    Ok(())
}

fn missing_system(kind: impl std::fmt::Debug) -> VulkanError {
    VulkanError::InvalidOperation {
        reason: format!("{:?} is scheduled but not built", kind),
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::error!("Failed to idle device before teardown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::systems::PassKind;

    #[test]
    fn test_frame_features_from_state() {
        assert_eq!(frame_features(false, false, false, false), FrameFeatures::empty());
        let features = frame_features(true, true, true, false);
        assert!(features.contains(
            FrameFeatures::SELECTION | FrameFeatures::STENCIL | FrameFeatures::PICK_REQUESTED
        ));
        assert!(!features.contains(FrameFeatures::RAY_TRACING));
    }

    #[test]
    fn test_depth_without_stencil_never_outlines() {
        let with_stencil = FrameSchedule::build(frame_features(true, true, false, false));
        assert!(with_stencil.contains(PassKind::Outline));
        let depth_only = FrameSchedule::build(frame_features(true, false, false, false));
        assert!(!depth_only.contains(PassKind::Outline));
    }

    #[test]
    fn test_every_swapchain_rebuild_consumes_the_resize() {
        assert!(FrameOutcome::Skipped.rebuilt_swapchain());
        assert!(FrameOutcome::Recreated.rebuilt_swapchain());
        assert!(!FrameOutcome::Presented.rebuilt_swapchain());
    }

    #[test]
    fn test_pick_request_schedules_picking_after_ui() {
        let schedule = FrameSchedule::build(frame_features(false, true, true, false));
        let passes: Vec<_> = schedule.passes().collect();
        let ui = passes.iter().position(|&p| p == PassKind::Ui);
        let picking = passes.iter().position(|&p| p == PassKind::MousePicking);
        assert!(ui < picking);
    }
}
