//! Device queue handles and submission helpers.
//!
//! A single CPU thread owns all command buffer recording and submission, so
//! queue access needs no internal locking; the handles are plain and clonable.

use anyhow::Result;
use ash::vk;

use crate::core::device::Device;
use crate::sync::Fence;

/// The graphics, compute and present queues retrieved from the device.
///
/// Graphics and compute may alias the same underlying queue on devices with a
/// single family; the engine never relies on them being distinct, only on the
/// explicit fence/semaphore ordering between their submissions.
#[derive(Debug, Clone)]
pub struct Queues {
    device: Device,
    graphics: vk::Queue,
    compute: vk::Queue,
    present: vk::Queue,
}

impl Queues {
    /// Retrieve queue 0 of each family the device was created with.
    pub fn new(device: Device) -> Self {
        let families = device.queue_families();
        let graphics = unsafe { device.get_device_queue(families.graphics, 0) };
        let compute = unsafe { device.get_device_queue(families.compute, 0) };
        let present = unsafe { device.get_device_queue(families.present, 0) };
        info!(
            "Device queues: graphics family {}, compute family {}, present family {}",
            families.graphics, families.compute, families.present
        );
        Queues {
            device,
            graphics,
            compute,
            present,
        }
    }

    /// Submit command buffers to the graphics queue with an optional semaphore
    /// chain and an optional fence to signal.
    pub fn submit_graphics(
        &self,
        cmd: vk::CommandBuffer,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
        fence: Option<&Fence>,
    ) -> Result<()> {
        self.submit(self.graphics, cmd, wait, signal, fence)
    }

    /// Submit a command buffer to the compute queue.
    pub fn submit_compute(
        &self,
        cmd: vk::CommandBuffer,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
        fence: Option<&Fence>,
    ) -> Result<()> {
        self.submit(self.compute, cmd, wait, signal, fence)
    }

    fn submit(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
        fence: Option<&Fence>,
    ) -> Result<()> {
        let wait_semaphores = wait.iter().map(|(sem, _)| *sem).collect::<Vec<_>>();
        let wait_stages = wait.iter().map(|(_, stage)| *stage).collect::<Vec<_>>();
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores.as_slice())
            .wait_dst_stage_mask(wait_stages.as_slice())
            .command_buffers(std::slice::from_ref(&cmd))
            .signal_semaphores(signal)
            .build();
        unsafe {
            self.device
                .queue_submit(
                    queue,
                    std::slice::from_ref(&info),
                    fence.map(|f| f.handle()).unwrap_or_else(vk::Fence::null),
                )
                .map_err(crate::Error::from)?;
        }
        Ok(())
    }

    /// The raw present queue handle, used by the swapchain for `vkQueuePresentKHR`.
    /// # Safety
    /// The caller must only use this handle for presentation.
    pub unsafe fn present_handle(&self) -> vk::Queue {
        self.present
    }

    /// Block until the present queue has drained. Exposed for the
    /// overloaded-GPU debugging override.
    pub fn wait_present_idle(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.present).map_err(crate::Error::from)? };
        Ok(())
    }
}
