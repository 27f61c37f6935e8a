//! The Vulkan context: instance, physical device selection, logical device and queues.
//!
//! Nothing in this module is global. Every component of the engine receives an
//! explicit [`DeviceContext`] (or one of its parts) through its constructor, so
//! multiple independent render contexts can coexist, notably in tests.

pub mod debug;
pub mod device;
pub mod error;
pub mod instance;
pub mod physical_device;
pub mod queue;

use anyhow::Result;
use ash::vk;

use crate::allocator::Allocator;
use crate::core::device::Device;
use crate::core::queue::Queues;
use crate::sync::Fence;

/// The handle bundle threaded through every component of the engine.
///
/// All members are cheaply clonable (internally reference counted), so this
/// struct can be cloned freely.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    // Declaration order is drop order: the allocator frees memory through the
    // device and must go first.
    pub allocator: Allocator,
    pub queues: Queues,
    pub device: Device,
}

impl DeviceContext {
    /// Record and submit a one-shot command buffer on the graphics queue and
    /// block until it completes. Used for setup-time transfers (staging
    /// uploads, initial layout transitions), never inside the frame loop.
    pub fn execute_transfer(&self, record: impl FnOnce(vk::CommandBuffer)) -> Result<()> {
        let device = &self.device;
        let pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                    .queue_family_index(device.queue_families().graphics),
                None,
            ).map_err(crate::Error::from)?
        };
        let result = (|| -> Result<()> {
            let cmd = unsafe {
                device.allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::builder()
                        .command_pool(pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                ).map_err(crate::Error::from)?[0]
            };
            unsafe {
                device.begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::builder()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                ).map_err(crate::Error::from)?;
            }
            record(cmd);
            unsafe {
                device.end_command_buffer(cmd).map_err(crate::Error::from)?;
            }
            let fence = Fence::new(device.clone(), false)?;
            self.queues.submit_graphics(cmd, &[], &[], Some(&fence))?;
            fence.wait()
        })();
        unsafe {
            device.destroy_command_pool(pool, None);
        }
        result
    }
}
