//! Presentation engine: acquire, submit, present and swapchain recreation
//!
//! One [`Presenter`] drives the swapchain for the whole process. Frame slots
//! rotate through [`FramePacer`]; the only places the CPU blocks are the slot
//! fence in [`Presenter::begin_frame`], the image collision fence in
//! [`Presenter::end_frame`] and the idle wait during recreation.

use ash::{vk, Device};

use super::{AcquireOutcome, FramePacer, FrameSync, PresentOutcome, Semaphore, Swapchain};
use crate::config::{PresentModePreference, RendererConfig};
use crate::render::backends::vulkan::rendering::{CommandPool, CommandRecorder};
use crate::render::backends::vulkan::initialization::context::idled_before_teardown;
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};
use crate::window::{wait_for_nonzero_extent, SurfaceExtentSource};

/// Where the presenter is in its frame cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterState {
    /// No swapchain yet
    Uninitialized,
    /// Ready to acquire
    Initialized,
    /// An image is acquired and the slot's command buffer is recording
    ImageAcquired {
        /// Acquired swapchain image
        image_index: u32,
    },
    /// Swapchain being rebuilt
    Recreating,
}

impl PresenterState {
    fn acquire(self, image_index: u32) -> VulkanResult<Self> {
        match self {
            Self::Initialized => Ok(Self::ImageAcquired { image_index }),
            other => Err(invalid_transition(other, "acquire")),
        }
    }

    fn present(self) -> VulkanResult<(u32, Self)> {
        match self {
            Self::ImageAcquired { image_index } => Ok((image_index, Self::Initialized)),
            other => Err(invalid_transition(other, "present")),
        }
    }

    fn recreate(self) -> VulkanResult<Self> {
        match self {
            Self::Uninitialized | Self::Initialized => Ok(Self::Recreating),
            other => Err(invalid_transition(other, "recreate")),
        }
    }
}

fn invalid_transition(state: PresenterState, action: &str) -> VulkanError {
    VulkanError::InvalidOperation {
        reason: format!("cannot {} while presenter is {:?}", action, state),
    }
}

/// A frame that acquired an image and is recording
pub struct FrameStart {
    /// Recorder over the slot's command buffer, already begun
    pub recorder: CommandRecorder,
    /// Acquired swapchain image
    pub image_index: u32,
    /// Frame slot
    pub frame_index: usize,
}

/// How a submitted frame finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    /// Presented; nothing changed
    Presented,
    /// Presented (or dropped) and the swapchain was rebuilt afterwards
    Recreated,
}

/// Owns the swapchain and every per-slot synchronization object
pub struct Presenter {
    device: Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    present_mode: PresentModePreference,
    frame_sync: Vec<FrameSync>,
    render_finished: Vec<Semaphore>,
    command_buffers: Vec<vk::CommandBuffer>,
    command_pool: CommandPool,
    pacer: FramePacer,
    state: PresenterState,
    needs_recreate: bool,
    swapchain: Option<Swapchain>,
}

impl Presenter {
    /// Create per-slot resources and the first swapchain
    pub fn new(
        context: &VulkanContext,
        window: &mut impl SurfaceExtentSource,
        config: &RendererConfig,
    ) -> VulkanResult<Self> {
        let device = context.device().clone();
        let frames = config.max_frames_in_flight;

        let command_pool = CommandPool::new(device.clone(), context.graphics_queue_family())?;
        let slot_count = u32::try_from(frames).map_err(|_| VulkanError::InvalidOperation {
            reason: "too many frames in flight".to_string(),
        })?;
        let command_buffers = command_pool.allocate_command_buffers(slot_count)?;
        let frame_sync = (0..frames)
            .map(|_| FrameSync::new(&device))
            .collect::<VulkanResult<Vec<_>>>()?;

        let mut presenter = Self {
            device,
            graphics_queue: context.graphics_queue(),
            present_queue: context.present_queue(),
            present_mode: config.present_mode,
            frame_sync,
            render_finished: Vec::new(),
            command_buffers,
            command_pool,
            pacer: FramePacer::new(frames, 0),
            state: PresenterState::Uninitialized,
            needs_recreate: false,
            swapchain: None,
        };
        presenter.recreate(context, window)?;
        log::info!("Presenter ready with {} frames in flight", frames);
        Ok(presenter)
    }

    /// Wait for the slot's fence and acquire the next image
    ///
    /// Returns `None` when the surface was out of date; the swapchain has then
    /// been rebuilt and the caller skips this frame.
    pub fn begin_frame(
        &mut self,
        context: &VulkanContext,
        window: &mut impl SurfaceExtentSource,
    ) -> VulkanResult<Option<FrameStart>> {
        let slot = self.pacer.current_slot();
        self.frame_sync[slot].in_flight.wait()?;

        let outcome = self
            .swapchain()?
            .acquire_next_image(self.frame_sync[slot].image_available.handle())?;
        let image_index = match outcome {
            AcquireOutcome::Ready(index) => index,
            AcquireOutcome::Suboptimal(index) => {
                self.needs_recreate = true;
                index
            }
            AcquireOutcome::OutOfDate => {
                log::warn!("Swapchain out of date during acquire; recreating and skipping frame");
                self.recreate(context, window)?;
                return Ok(None);
            }
        };

        self.state = self.state.acquire(image_index)?;
        let mut recorder = CommandRecorder::new(self.command_buffers[slot], self.device.clone());
        recorder.begin()?;
        log::trace!("Frame slot {} acquired image {}", slot, image_index);

        Ok(Some(FrameStart {
            recorder,
            image_index,
            frame_index: slot,
        }))
    }

    /// Submit the slot's command buffer and present the acquired image
    ///
    /// `resized` forces recreation even when presentation succeeded.
    pub fn end_frame(
        &mut self,
        context: &VulkanContext,
        window: &mut impl SurfaceExtentSource,
        recorder: CommandRecorder,
        resized: bool,
    ) -> VulkanResult<FrameEnd> {
        let slot = self.pacer.current_slot();
        if recorder.handle() != self.command_buffers[slot] {
            debug_assert!(false, "frame ended with a command buffer from another slot");
            return Err(VulkanError::CommandBufferMismatch);
        }
        let (image_index, next_state) = self.state.present()?;
        let command_buffer = recorder.end()?;

        if let Some(other) = self.pacer.claim_image(image_index as usize) {
            log::trace!("Image {} still owned by slot {}, waiting", image_index, other);
            self.frame_sync[other].in_flight.wait()?;
        }

        let sync = &self.frame_sync[slot];
        let render_finished = self
            .render_finished
            .get(image_index as usize)
            .map(Semaphore::handle)
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("no render-finished semaphore for image {}", image_index),
            })?;
        sync.in_flight.reset()?;

        let wait_semaphores = [sync.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info.build()], sync.in_flight.handle())?;
        }

        let outcome = self
            .swapchain()?
            .present(self.present_queue, image_index, render_finished)?;
        self.state = next_state;
        self.pacer.advance();

        if outcome != PresentOutcome::Presented || resized || self.needs_recreate {
            if outcome != PresentOutcome::Presented {
                log::warn!("Swapchain {:?} during present; recreating", outcome);
            }
            self.recreate(context, window)?;
            return Ok(FrameEnd::Recreated);
        }
        Ok(FrameEnd::Presented)
    }

    /// Rebuild the swapchain and everything sized to it
    ///
    /// Blocks while the window is minimized, then idles the GPU. A color or
    /// depth format change is fatal because existing pipelines depend on it.
    pub fn recreate(&mut self, context: &VulkanContext, window: &mut impl SurfaceExtentSource) -> VulkanResult<()> {
        self.state = self.state.recreate()?;
        let extent = wait_for_nonzero_extent(window);
        context.wait_idle()?;

        let old = self.swapchain.take();
        let swapchain = Swapchain::new(context, extent, self.present_mode, old.as_ref())?;
        if let Some(old) = &old {
            super::ensure_formats_compatible(old.formats(), swapchain.formats())?;
        }
        drop(old);

        self.render_finished = (0..swapchain.image_count())
            .map(|_| Semaphore::new(self.device.clone()))
            .collect::<VulkanResult<Vec<_>>>()?;
        self.pacer.reset_images(swapchain.image_count());
        self.swapchain = Some(swapchain);
        self.needs_recreate = false;
        self.state = PresenterState::Initialized;
        Ok(())
    }

    /// Whether the slot's last submission has finished, without blocking
    pub fn slot_finished(&self, slot: usize) -> VulkanResult<bool> {
        match self.frame_sync.get(slot) {
            Some(sync) => sync.in_flight.is_signaled(),
            None => Ok(true),
        }
    }

    /// Current swapchain
    pub fn swapchain(&self) -> VulkanResult<&Swapchain> {
        self.swapchain.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "presenter has no swapchain".to_string(),
        })
    }

    /// Swapchain extent, zero before initialization
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.as_ref().map(Swapchain::extent).unwrap_or_default()
    }

    /// Slot the next frame records into
    pub fn current_slot(&self) -> usize {
        self.pacer.current_slot()
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.pacer.frames_in_flight()
    }

    /// Lifecycle state
    pub fn state(&self) -> PresenterState {
        self.state
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        idled_before_teardown(unsafe { self.device.device_wait_idle() }, "frame command buffers");
        self.command_pool.free_command_buffers(&self.command_buffers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_cycle_transitions() {
        let state = PresenterState::Uninitialized.recreate().unwrap();
        assert_eq!(state, PresenterState::Recreating);

        let state = PresenterState::Initialized.acquire(2).unwrap();
        assert_eq!(state, PresenterState::ImageAcquired { image_index: 2 });
        let (image, state) = state.present().unwrap();
        assert_eq!((image, state), (2, PresenterState::Initialized));
    }

    #[test]
    fn test_out_of_order_transitions_rejected() {
        assert!(PresenterState::Initialized.present().is_err());
        assert!(PresenterState::Recreating.acquire(0).is_err());
        assert!(PresenterState::ImageAcquired { image_index: 0 }.acquire(1).is_err());
        // recreation must not discard an image that is still being recorded
        assert!(PresenterState::ImageAcquired { image_index: 0 }.recreate().is_err());
    }
}
