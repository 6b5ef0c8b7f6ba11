//! Command pools and command buffers.
//!
//! A [`CommandBuffer`] moves through [`CommandBufferState`]s:
//!
//! ```text
//! Initial --begin--> Recording --end--> Executable --submit--> Submitted
//!    ^                                                            |
//!    +-------------------------- reset ---------------------------+
//! ```
//!
//! Every operation checks the current state and returns
//! [`GpuError::InvalidCommandBufferState`] when called out of order.

use crate::device::{Device, Queue, QueueType};
use crate::error::{GpuError, Result};
use crate::logging::Logger;
use crate::resources::{Buffer, GpuResource, Image};
use crate::sync::{Fence, Semaphore, SubmissionToken};
use ash::vk;
use std::sync::Arc;

/// Recording state of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

/// Operations that drive the command buffer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOp {
    Begin,
    Record,
    End,
    Submit,
    /// `submission_complete` reports whether the last submission finished.
    Reset { submission_complete: bool },
}

impl CommandOp {
    fn name(self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Record => "record into",
            Self::End => "end",
            Self::Submit => "submit",
            Self::Reset { .. } => "reset",
        }
    }
}

impl CommandBufferState {
    /// The state after applying `op`, or the contract error it violates.
    pub fn apply(self, op: CommandOp) -> Result<Self> {
        use CommandBufferState::{Executable, Initial, Recording, Submitted};
        let next = match (self, op) {
            (Initial, CommandOp::Begin) => Recording,
            (Recording, CommandOp::Record) => Recording,
            (Recording, CommandOp::End) => Executable,
            (Executable, CommandOp::Submit) => Submitted,
            (Submitted, CommandOp::Reset { submission_complete: false }) => {
                return Err(self.violation(op));
            }
            (_, CommandOp::Reset { .. }) => Initial,
            _ => return Err(self.violation(op)),
        };
        Ok(next)
    }

    /// Fail unless `self` is `expected`.
    pub fn expect(self, expected: Self, operation: &'static str) -> Result<()> {
        if self == expected {
            Ok(())
        } else {
            Err(GpuError::InvalidCommandBufferState {
                operation,
                state: self,
            })
        }
    }

    fn violation(self, op: CommandOp) -> GpuError {
        GpuError::InvalidCommandBufferState {
            operation: op.name(),
            state: self,
        }
    }
}

struct PoolInner {
    device: Arc<Device>,
    raw: vk::CommandPool,
    queue_type: QueueType,
    queue: Queue,
    logger: Logger,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Command buffers from this pool may still be executing.
        if let Err(e) = self.device.wait_idle() {
            tracing::error!(parent: self.logger.span(), error = %e, "wait idle failed before destroying command pool");
        }
        unsafe { self.device.raw().destroy_command_pool(self.raw, None) };
        tracing::debug!(parent: self.logger.span(), queue = ?self.queue_type, "command pool destroyed");
    }
}

/// Allocates command buffers for one queue.
///
/// The native pool lives until the pool and every command buffer allocated
/// from it are dropped; destruction blocks until the device is idle.
pub struct CommandPool {
    inner: Arc<PoolInner>,
}

impl CommandPool {
    pub fn new(device: Arc<Device>, queue_type: QueueType, logger: Logger) -> Result<Self> {
        let queue = *device.queue(queue_type);
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue.family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let raw = unsafe { device.raw().create_command_pool(&create_info, None)? };

        tracing::debug!(parent: logger.span(), queue = ?queue_type, family = queue.family, "command pool created");

        Ok(Self {
            inner: Arc::new(PoolInner {
                device,
                raw,
                queue_type,
                queue,
                logger,
            }),
        })
    }

    pub fn queue_type(&self) -> QueueType {
        self.inner.queue_type
    }

    pub fn queue_family(&self) -> u32 {
        self.inner.queue.family
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    /// Allocate a primary command buffer in the `Initial` state.
    pub fn allocate_primary(&self) -> Result<CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.inner.raw)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.inner.device.raw().allocate_command_buffers(&alloc_info)? };
        let raw = buffers
            .first()
            .copied()
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN))?;

        Ok(CommandBuffer {
            pool: Arc::clone(&self.inner),
            raw,
            state: CommandBufferState::Initial,
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
            retained: Vec::new(),
            submission: None,
            acquired: false,
        })
    }
}

/// A primary command buffer with its state, pending semaphores and the
/// resources its recorded commands use.
pub struct CommandBuffer {
    pool: Arc<PoolInner>,
    raw: vk::CommandBuffer,
    state: CommandBufferState,
    wait_semaphores: Vec<(Arc<Semaphore>, vk::PipelineStageFlags2)>,
    signal_semaphores: Vec<(Arc<Semaphore>, vk::PipelineStageFlags2)>,
    retained: Vec<Arc<dyn GpuResource>>,
    submission: Option<SubmissionToken>,
    /// Whether `retained` and the semaphores are counted as in flight.
    acquired: bool,
}

impl CommandBuffer {
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.pool.device
    }

    pub fn queue(&self) -> &Queue {
        &self.pool.queue
    }

    /// Number of resources kept alive for the current recording.
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    fn advance(&mut self, op: CommandOp) -> Result<()> {
        match self.state.apply(op) {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(e) => Err(self.report(e)),
        }
    }

    pub(crate) fn report(&self, error: GpuError) -> GpuError {
        tracing::error!(parent: self.pool.logger.span(), %error, "command buffer misuse");
        error
    }

    /// Start recording.
    pub fn begin(&mut self, one_time_submit: bool) -> Result<()> {
        self.advance(CommandOp::Begin)?;
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        if let Err(e) = unsafe { self.pool.device.raw().begin_command_buffer(self.raw, &begin_info) } {
            self.state = CommandBufferState::Initial;
            return Err(e.into());
        }
        Ok(())
    }

    /// Record raw commands. Only valid while recording.
    pub fn record<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        self.advance(CommandOp::Record)?;
        f(self.pool.device.raw(), self.raw);
        Ok(())
    }

    /// Keep `resource` alive until this command buffer is reset or dropped.
    ///
    /// Refused once submitted: the submission has already counted what it
    /// holds.
    pub fn retain(&mut self, resource: Arc<dyn GpuResource>) -> Result<()> {
        self.check_unsubmitted("retain a resource in")?;
        self.retained.push(resource);
        Ok(())
    }

    fn check_unsubmitted(&self, operation: &'static str) -> Result<()> {
        if self.state == CommandBufferState::Submitted {
            return Err(self.report(GpuError::InvalidCommandBufferState {
                operation,
                state: self.state,
            }));
        }
        Ok(())
    }

    /// Finish recording.
    pub fn end(&mut self) -> Result<()> {
        self.state
            .expect(CommandBufferState::Recording, "end")
            .map_err(|e| self.report(e))?;
        unsafe { self.pool.device.raw().end_command_buffer(self.raw)? };
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Wait on `semaphore` at `stage` before this submission executes.
    pub fn insert_wait_semaphore(
        &mut self,
        semaphore: &Arc<Semaphore>,
        stage: vk::PipelineStageFlags2,
    ) -> Result<()> {
        self.check_unsubmitted("add a wait semaphore to")?;
        self.wait_semaphores.push((Arc::clone(semaphore), stage));
        Ok(())
    }

    /// Signal `semaphore` once this submission reaches `stage`.
    pub fn insert_signal_semaphore(
        &mut self,
        semaphore: &Arc<Semaphore>,
        stage: vk::PipelineStageFlags2,
    ) -> Result<()> {
        self.check_unsubmitted("add a signal semaphore to")?;
        self.signal_semaphores.push((Arc::clone(semaphore), stage));
        Ok(())
    }

    /// Submit to the pool's queue, optionally signalling `fence`.
    pub fn submit(&mut self, fence: Option<&Arc<Fence>>) -> Result<()> {
        self.state
            .expect(CommandBufferState::Executable, "submit")
            .map_err(|e| self.report(e))?;

        let semaphore_info = |(semaphore, stage): &(Arc<Semaphore>, vk::PipelineStageFlags2)| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore.raw())
                .stage_mask(*stage)
        };
        let waits: Vec<vk::SemaphoreSubmitInfo> = self.wait_semaphores.iter().map(semaphore_info).collect();
        let signals: Vec<vk::SemaphoreSubmitInfo> = self.signal_semaphores.iter().map(semaphore_info).collect();
        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(self.raw)];

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);

        let raw_fence = fence.map_or(vk::Fence::null(), |f| f.raw());
        unsafe {
            self.pool
                .device
                .raw()
                .queue_submit2(self.pool.queue.raw, &[submit_info], raw_fence)
                .map_err(GpuError::Submit)?;
        }

        self.submission = fence.map(Fence::mark_submitted);
        self.state = CommandBufferState::Submitted;
        self.acquired = true;
        for resource in &self.retained {
            resource.in_flight().acquire();
        }
        for (semaphore, _) in self.wait_semaphores.iter().chain(&self.signal_semaphores) {
            semaphore.in_flight().acquire();
        }

        tracing::trace!(
            parent: self.pool.logger.span(),
            waits = waits.len(),
            signals = signals.len(),
            retained = self.retained.len(),
            "submitted"
        );
        Ok(())
    }

    /// Whether the last submission has completed. Without a fence this is
    /// only known after the queue has been waited on, so it reports `false`.
    pub fn is_complete(&self) -> Result<bool> {
        match (&self.submission, self.state) {
            (_, state) if state != CommandBufferState::Submitted => Ok(true),
            (Some(token), _) => token.is_complete(),
            (None, _) => Ok(false),
        }
    }

    /// Return to `Initial`, dropping semaphores and retained resources.
    ///
    /// A buffer submitted with a fence cannot be reset until that fence has
    /// signalled. A buffer submitted without one waits for its queue to go
    /// idle.
    pub fn reset(&mut self) -> Result<()> {
        let submission_complete = match (&self.submission, self.state) {
            (Some(token), CommandBufferState::Submitted) => token.is_complete()?,
            (None, CommandBufferState::Submitted) => {
                unsafe { self.pool.device.raw().queue_wait_idle(self.pool.queue.raw)? };
                true
            }
            _ => true,
        };
        self.advance(CommandOp::Reset { submission_complete })?;

        unsafe {
            self.pool
                .device
                .raw()
                .reset_command_buffer(self.raw, vk::CommandBufferResetFlags::empty())?;
        }
        self.release_resources();
        Ok(())
    }

    fn release_resources(&mut self) {
        if std::mem::take(&mut self.acquired) {
            let unbalanced = self
                .retained
                .iter()
                .map(|resource| resource.in_flight().release())
                .chain(
                    self.wait_semaphores
                        .iter()
                        .chain(&self.signal_semaphores)
                        .map(|(semaphore, _)| semaphore.in_flight().release()),
                )
                .filter(|released| !released)
                .count();
            if unbalanced > 0 {
                tracing::warn!(parent: self.pool.logger.span(), unbalanced, "released resources that were not in flight");
            }
        }
        self.retained.clear();
        self.wait_semaphores.clear();
        self.signal_semaphores.clear();
        self.submission = None;
    }

    /// Copy `size` bytes from the start of `src` to the start of `dst`.
    pub fn copy_buffer(&mut self, src: &Arc<Buffer>, dst: &Arc<Buffer>, size: u64) -> Result<()> {
        let region = vk::BufferCopy::default().size(size);
        self.record(|device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, src.raw(), dst.raw(), &[region]);
        })?;
        self.retain(src.clone())?;
        self.retain(dst.clone())
    }

    /// Copy tightly packed pixels from `src` into mip level 0 of `dst`, which
    /// must be in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_buffer_to_image(&mut self, src: &Arc<Buffer>, dst: &Arc<Image>) -> Result<()> {
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(dst.extent());
        self.record(|device, cmd| unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                src.raw(),
                dst.raw(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })?;
        self.retain(src.clone())?;
        self.retain(dst.clone())
    }

    /// Clear every mip level and layer of a colour image in `layout`.
    pub fn clear_color_image(
        &mut self,
        image: &Arc<Image>,
        layout: vk::ImageLayout,
        color: [f32; 4],
    ) -> Result<()> {
        let clear = vk::ClearColorValue { float32: color };
        let range = crate::barrier::full_subresource_range(vk::ImageAspectFlags::COLOR);
        self.record(|device, cmd| unsafe {
            device.cmd_clear_color_image(cmd, image.raw(), layout, &clear, &[range]);
        })?;
        self.retain(image.clone())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.state == CommandBufferState::Submitted {
            let waited = match &self.submission {
                Some(token) => token.wait(u64::MAX).map(|_| ()),
                None => unsafe { self.pool.device.raw().queue_wait_idle(self.pool.queue.raw) }
                    .map_err(GpuError::from),
            };
            if let Err(e) = waited {
                tracing::error!(parent: self.pool.logger.span(), error = %e, "failed to wait for submitted command buffer");
            }
        }
        self.release_resources();
        unsafe {
            self.pool
                .device
                .raw()
                .free_command_buffers(self.pool.raw, &[self.raw]);
        }
    }
}

/// Record, submit and wait for a one-shot command buffer.
pub fn execute_one_time<F>(pool: &CommandPool, f: F) -> Result<()>
where
    F: FnOnce(&mut CommandBuffer) -> Result<()>,
{
    let mut cmd = pool.allocate_primary()?;
    cmd.begin(true)?;
    f(&mut cmd)?;
    cmd.end()?;

    let fence = Fence::new(Arc::clone(pool.device()), false)?;
    cmd.submit(Some(&fence))?;
    fence.wait(u64::MAX)?;
    cmd.reset()
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandBufferState::{Executable, Initial, Recording, Submitted};

    #[test]
    fn happy_path() {
        let state = Initial.apply(CommandOp::Begin).unwrap();
        assert_eq!(state, Recording);
        let state = state.apply(CommandOp::Record).unwrap();
        let state = state.apply(CommandOp::End).unwrap();
        assert_eq!(state, Executable);
        let state = state.apply(CommandOp::Submit).unwrap();
        assert_eq!(state, Submitted);
        let state = state
            .apply(CommandOp::Reset {
                submission_complete: true,
            })
            .unwrap();
        assert_eq!(state, Initial);
    }

    #[test]
    fn out_of_order_operations_fail() {
        for (state, op) in [
            (Initial, CommandOp::End),
            (Initial, CommandOp::Record),
            (Initial, CommandOp::Submit),
            (Recording, CommandOp::Begin),
            (Recording, CommandOp::Submit),
            (Executable, CommandOp::Record),
            (Executable, CommandOp::Begin),
            (Submitted, CommandOp::Submit),
            (Submitted, CommandOp::Begin),
        ] {
            let err = state.apply(op).unwrap_err();
            assert!(
                matches!(err, GpuError::InvalidCommandBufferState { state: s, .. } if s == state),
                "{state:?} + {op:?}"
            );
        }
    }

    #[test]
    fn reset_waits_for_completion() {
        let err = Submitted
            .apply(CommandOp::Reset {
                submission_complete: false,
            })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot reset a command buffer in the Submitted state"
        );

        for state in [Initial, Recording, Executable] {
            assert_eq!(
                state
                    .apply(CommandOp::Reset {
                        submission_complete: false
                    })
                    .unwrap(),
                Initial
            );
        }
    }

    #[test]
    fn expect_reports_operation() {
        assert!(Recording.expect(Recording, "end").is_ok());
        let err = Initial.expect(Recording, "end").unwrap_err();
        assert_eq!(err.to_string(), "Cannot end a command buffer in the Initial state");
    }
}
