//! Fenced transfer submissions
//!
//! Each [`UploadQueue::submit`] records into its own command buffer and fence,
//! so several transfers can be in flight at once. Staging buffers stay alive
//! until [`UploadQueue::poll`] sees the fence signal. Callers must
//! [`UploadQueue::flush`] (or wait on the ticket) before first use of the data.

use ash::{vk, Device};
use std::collections::{BTreeSet, VecDeque};

use super::{Buffer, MemoryAllocator, HOST_MEMORY};
use crate::render::backends::vulkan::rendering::{CommandPool, CommandRecorder};
use crate::render::backends::vulkan::state::Fence;
use crate::render::backends::vulkan::{VulkanContext, VulkanResult};

/// Identifies one submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UploadTicket(u64);

/// Issued and outstanding tickets; completion may arrive out of order
#[derive(Debug, Default)]
pub struct TicketLedger {
    next: u64,
    outstanding: BTreeSet<u64>,
}

impl TicketLedger {
    /// Hand out a new outstanding ticket
    pub fn issue(&mut self) -> UploadTicket {
        let ticket = self.next;
        self.next += 1;
        self.outstanding.insert(ticket);
        UploadTicket(ticket)
    }

    /// Mark a ticket complete
    pub fn retire(&mut self, ticket: UploadTicket) {
        self.outstanding.remove(&ticket.0);
    }

    /// Whether the ticket's transfer finished
    pub fn is_complete(&self, ticket: UploadTicket) -> bool {
        ticket.0 < self.next && !self.outstanding.contains(&ticket.0)
    }

    /// Number of transfers still in flight
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

/// Filled staging buffer plus the device-local buffer it will be copied into
pub struct StagedCopy {
    staging: Buffer,
    target: Buffer,
    size: vk::DeviceSize,
}

struct PendingUpload {
    ticket: UploadTicket,
    command_buffer: vk::CommandBuffer,
    fence: Fence,
    _staging: Vec<Buffer>,
}

/// Transfer queue with per-submission fences
pub struct UploadQueue {
    device: Device,
    queue: vk::Queue,
    allocator: MemoryAllocator,
    pending: VecDeque<PendingUpload>,
    ledger: TicketLedger,
    command_pool: CommandPool,
}

impl UploadQueue {
    /// Create a queue submitting to the context's graphics queue
    pub fn new(context: &VulkanContext) -> VulkanResult<Self> {
        let device = context.device().clone();
        Ok(Self {
            command_pool: CommandPool::new(device.clone(), context.graphics_queue_family())?,
            device,
            queue: context.graphics_queue(),
            allocator: context.allocator(),
            pending: VecDeque::new(),
            ledger: TicketLedger::default(),
        })
    }

    /// Record with `record` and submit; `staging` lives until the transfer completes
    pub fn submit(
        &mut self,
        staging: Vec<Buffer>,
        record: impl FnOnce(&mut CommandRecorder) -> VulkanResult<()>,
    ) -> VulkanResult<UploadTicket> {
        self.poll()?;

        let command_buffer = self
            .command_pool
            .allocate_command_buffers(1)?
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        let mut recorder = CommandRecorder::new(command_buffer, self.device.clone());
        recorder.begin()?;
        record(&mut recorder)?;
        let command_buffer = recorder.end()?;

        let fence = Fence::new(self.device.clone(), false)?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info.build()], fence.handle())?;
        }

        let ticket = self.ledger.issue();
        log::trace!("Submitted upload {:?} with {} staging buffers", ticket, staging.len());
        self.pending.push_back(PendingUpload {
            ticket,
            command_buffer,
            fence,
            _staging: staging,
        });
        Ok(ticket)
    }

    /// Prepare a host-visible copy of `data` and an empty device-local target
    pub fn stage<T: bytemuck::Pod>(&self, data: &[T], usage: vk::BufferUsageFlags) -> VulkanResult<StagedCopy> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;

        let staging = Buffer::new(&self.allocator, size, vk::BufferUsageFlags::TRANSFER_SRC, HOST_MEMORY)?;
        staging.write_bytes(0, bytes)?;
        let target = Buffer::new(
            &self.allocator,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        Ok(StagedCopy { staging, target, size })
    }

    /// Copy every staged buffer in one submission; targets come back in order
    pub fn submit_copies(&mut self, copies: Vec<StagedCopy>) -> VulkanResult<(Vec<Buffer>, UploadTicket)> {
        let regions: Vec<(vk::Buffer, vk::Buffer, vk::DeviceSize)> = copies
            .iter()
            .map(|c| (c.staging.handle(), c.target.handle(), c.size))
            .collect();
        let (staging, targets): (Vec<Buffer>, Vec<Buffer>) =
            copies.into_iter().map(|c| (c.staging, c.target)).unzip();

        let ticket = self.submit(staging, |recorder| {
            for &(src, dst, size) in &regions {
                recorder.copy_buffer(src, dst, size)?;
            }
            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                .build();
            recorder.pipeline_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                &[barrier],
                &[],
            )
        })?;
        Ok((targets, ticket))
    }

    /// Retire every finished transfer without blocking; returns how many retired
    pub fn poll(&mut self) -> VulkanResult<usize> {
        let mut retired = 0;
        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        while let Some(upload) = self.pending.pop_front() {
            if upload.fence.is_signaled()? {
                self.retire(upload);
                retired += 1;
            } else {
                still_pending.push_back(upload);
            }
        }
        self.pending = still_pending;
        Ok(retired)
    }

    /// Block until `ticket` has completed
    pub fn wait(&mut self, ticket: UploadTicket) -> VulkanResult<()> {
        if let Some(upload) = self.pending.iter().find(|u| u.ticket == ticket) {
            upload.fence.wait()?;
        }
        self.poll().map(|_| ())
    }

    /// Block until every submitted transfer has completed
    pub fn flush(&mut self) -> VulkanResult<()> {
        while let Some(upload) = self.pending.pop_front() {
            upload.fence.wait()?;
            self.retire(upload);
        }
        Ok(())
    }

    fn retire(&mut self, upload: PendingUpload) {
        self.command_pool.free_command_buffers(&[upload.command_buffer]);
        self.ledger.retire(upload.ticket);
    }

    /// Whether `ticket` has completed (as of the last poll)
    pub fn is_complete(&self, ticket: UploadTicket) -> bool {
        self.ledger.is_complete(ticket)
    }

    /// Number of transfers still in flight
    pub fn outstanding(&self) -> usize {
        self.ledger.outstanding()
    }

    /// Allocator used for staging and targets
    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Failed to drain upload queue: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tickets_complete_out_of_order() {
        let mut ledger = TicketLedger::default();
        let first = ledger.issue();
        let second = ledger.issue();
        assert_eq!(ledger.outstanding(), 2);

        ledger.retire(second);
        assert!(ledger.is_complete(second));
        assert!(!ledger.is_complete(first));

        ledger.retire(first);
        assert!(ledger.is_complete(first));
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_unissued_ticket_is_not_complete() {
        let ledger = TicketLedger::default();
        assert!(!ledger.is_complete(UploadTicket(3)));
    }
}
