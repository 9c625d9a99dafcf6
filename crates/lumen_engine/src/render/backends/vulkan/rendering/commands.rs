//! Command buffer management
//!
//! Recording tracks whether a render pass is open and which signature it has,
//! so every pipeline bind is checked against the pass it lands in.

use ash::{vk, Device};
use std::ops::{Deref, DerefMut};

use super::pipeline::GraphicsPipeline;
use super::render_pass::{check_pipeline_compatibility, RenderInfo, RenderPassSignature};
use crate::render::backends::vulkan::initialization::context::idled_before_teardown;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool whose buffers can be reset individually
    pub fn new(device: Device, queue_family_index: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe { device.create_command_pool(&pool_create_info, None)? };

        Ok(Self { device, command_pool })
    }

    /// Allocate primary command buffers
    pub fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { Ok(self.device.allocate_command_buffers(&alloc_info)?) }
    }

    /// Return command buffers to the pool
    pub fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(self.command_pool, buffers) };
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        idled_before_teardown(unsafe { self.device.device_wait_idle() }, "command pool");
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Command buffer recorder
pub struct CommandRecorder {
    command_buffer: vk::CommandBuffer,
    device: Device,
    recording: bool,
    active_pass: Option<RenderPassSignature>,
    bound_layout: Option<vk::PipelineLayout>,
}

impl CommandRecorder {
    /// Wrap a command buffer; call [`CommandRecorder::begin`] before recording
    pub fn new(command_buffer: vk::CommandBuffer, device: Device) -> Self {
        Self {
            command_buffer,
            device,
            recording: false,
            active_pass: None,
            bound_layout: None,
        }
    }

    /// Reset the buffer and begin one-time-submit recording
    pub fn begin(&mut self) -> VulkanResult<()> {
        if self.recording {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer already recording".to_string(),
            });
        }

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(self.command_buffer, &begin_info)?;
        }

        self.recording = true;
        Ok(())
    }

    /// Finish recording and hand back the raw buffer for submission
    pub fn end(mut self) -> VulkanResult<vk::CommandBuffer> {
        self.ensure_recording()?;
        if self.active_pass.is_some() {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer ended inside a render pass".to_string(),
            });
        }

        unsafe { self.device.end_command_buffer(self.command_buffer)? };

        self.recording = false;
        Ok(self.command_buffer)
    }

    fn ensure_recording(&self) -> VulkanResult<()> {
        if self.recording {
            Ok(())
        } else {
            Err(VulkanError::NotRecording)
        }
    }

    /// Raw handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Device the buffer records for
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Begin a render pass and set its viewport and scissor; ends when the guard drops
    pub fn begin_render_pass(&mut self, info: &RenderInfo) -> VulkanResult<ActiveRenderPass<'_>> {
        self.ensure_recording()?;
        if self.active_pass.is_some() {
            return Err(VulkanError::InvalidOperation {
                reason: "Render passes cannot be nested".to_string(),
            });
        }

        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(info.render_pass)
            .framebuffer(info.framebuffer)
            .render_area(info.render_area())
            .clear_values(&info.clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(
                self.command_buffer,
                &render_pass_begin,
                vk::SubpassContents::INLINE,
            );
            self.device.cmd_set_viewport(self.command_buffer, 0, &[info.viewport]);
            self.device.cmd_set_scissor(self.command_buffer, 0, &[info.scissor]);
        }

        self.active_pass = Some(info.signature.clone());
        self.bound_layout = None;
        log::trace!("Begin render pass {:?}", info.render_pass);
        Ok(ActiveRenderPass { recorder: self })
    }

    fn end_render_pass(&mut self) {
        if self.active_pass.take().is_some() {
            unsafe { self.device.cmd_end_render_pass(self.command_buffer) };
        }
        self.bound_layout = None;
    }

    /// Bind a graphics pipeline; fails if it was built for a different pass
    pub fn bind_graphics_pipeline(&mut self, pipeline: &GraphicsPipeline) -> VulkanResult<()> {
        self.ensure_recording()?;
        check_pipeline_compatibility(pipeline.name(), pipeline.signature(), self.active_pass.as_ref())?;
        unsafe {
            self.device
                .cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
        }
        self.bound_layout = Some(pipeline.layout());
        Ok(())
    }

    /// Bind a ray tracing pipeline; only valid outside render passes
    pub fn bind_ray_tracing_pipeline(&mut self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) -> VulkanResult<()> {
        self.ensure_recording()?;
        if self.active_pass.is_some() {
            return Err(VulkanError::InvalidOperation {
                reason: "Ray tracing pipeline bound inside a render pass".to_string(),
            });
        }
        unsafe {
            self.device
                .cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline);
        }
        self.bound_layout = Some(layout);
        Ok(())
    }

    fn require_layout(&self) -> VulkanResult<vk::PipelineLayout> {
        self.bound_layout.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "No pipeline bound".to_string(),
        })
    }

    /// Bind descriptor sets against the bound pipeline's layout
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) -> VulkanResult<()> {
        self.ensure_recording()?;
        let layout = self.require_layout()?;
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            );
        }
        Ok(())
    }

    /// Push constants to the bound pipeline's layout
    pub fn push_constants<T: bytemuck::Pod>(&mut self, stages: vk::ShaderStageFlags, data: &T) -> VulkanResult<()> {
        self.ensure_recording()?;
        let layout = self.require_layout()?;
        unsafe {
            self.device
                .cmd_push_constants(self.command_buffer, layout, stages, 0, bytemuck::bytes_of(data));
        }
        Ok(())
    }

    /// Bind one vertex buffer at binding 0 and an u32 index buffer
    pub fn bind_geometry(&mut self, vertex_buffer: vk::Buffer, index_buffer: vk::Buffer) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.command_buffer, 0, &[vertex_buffer], &[0]);
            self.device
                .cmd_bind_index_buffer(self.command_buffer, index_buffer, 0, vk::IndexType::UINT32);
        }
        Ok(())
    }

    /// Draw indexed
    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe {
            self.device
                .cmd_draw_indexed(self.command_buffer, index_count, instance_count, 0, 0, 0);
        }
        Ok(())
    }

    /// Non-indexed draw
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe { self.device.cmd_draw(self.command_buffer, vertex_count, instance_count, 0, 0) };
        Ok(())
    }

    /// Override the scissor set at pass begin
    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe { self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]) };
        Ok(())
    }

    /// Set the stencil reference for both faces
    pub fn set_stencil_reference(&mut self, reference: u32) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe {
            self.device
                .cmd_set_stencil_reference(self.command_buffer, vk::StencilFaceFlags::FRONT_AND_BACK, reference);
        }
        Ok(())
    }

    /// Fill a buffer range with a repeated u32; outside render passes only
    pub fn fill_buffer(&mut self, buffer: vk::Buffer, value: u32) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe {
            self.device
                .cmd_fill_buffer(self.command_buffer, buffer, 0, vk::WHOLE_SIZE, value);
        }
        Ok(())
    }

    /// Record a pipeline barrier
    pub fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                memory_barriers,
                &[],
                image_barriers,
            );
        }
        Ok(())
    }

    /// Copy between buffers
    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> VulkanResult<()> {
        self.ensure_recording()?;
        let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
        unsafe { self.device.cmd_copy_buffer(self.command_buffer, src, dst, &[region]) };
        Ok(())
    }
}

/// Open render pass; ends the pass when dropped
pub struct ActiveRenderPass<'a> {
    recorder: &'a mut CommandRecorder,
}

impl Deref for ActiveRenderPass<'_> {
    type Target = CommandRecorder;

    fn deref(&self) -> &CommandRecorder {
        self.recorder
    }
}

impl DerefMut for ActiveRenderPass<'_> {
    fn deref_mut(&mut self) -> &mut CommandRecorder {
        self.recorder
    }
}

impl Drop for ActiveRenderPass<'_> {
    fn drop(&mut self) {
        self.recorder.end_render_pass();
    }
}
