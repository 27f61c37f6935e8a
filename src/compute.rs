//! The compute pre-pass driving skeletal animation.
//!
//! The dispatch runs on the compute queue, which is distinct from the graphics
//! queue on most hardware, but the orchestrator serializes it behind a fence
//! wait before recording the deferred pass. The dependency this encodes
//! (skinned vertex output fully written before the geometry pass samples it)
//! is load-bearing; the queue overlap left on the table is not.

use anyhow::Result;
use ash::vk;

use crate::core::DeviceContext;
use crate::descriptor::DescriptorBinder;
use crate::resource::buffer::Buffer;
use crate::resource::pipeline::Pipeline;
use crate::shaders::ShaderSet;
use crate::sync::Fence;

/// Skeletal animation compute dispatch: a storage input buffer of rest-pose
/// vertices and joint matrices, a storage output buffer of skinned vertices.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct AnimationCompute {
    input: Buffer,
    output: Buffer,
    pipeline: Pipeline,
    descriptor_set: vk::DescriptorSet,
    cmd_pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: Fence,
    #[derivative(Debug = "ignore")]
    ctx: DeviceContext,
}

impl AnimationCompute {
    /// Create the compute pass with the given storage buffer sizes.
    pub fn new(
        ctx: &DeviceContext,
        binder: &DescriptorBinder,
        shaders: &ShaderSet,
        input_size: vk::DeviceSize,
        output_size: vk::DeviceSize,
    ) -> Result<Self> {
        let input = Buffer::new_storage(ctx, input_size)?;
        let output = Buffer::new_storage(ctx, output_size)?;
        input.map()?.zero();
        output.map()?.zero();

        let layout = binder.create_layout(&[
            (0, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
            (1, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
        ])?;
        let descriptor_set = binder.allocate(&layout)?;
        crate::descriptor::DescriptorWriter::new()
            .storage_buffer(descriptor_set, 0, &input)
            .storage_buffer(descriptor_set, 1, &output)
            .update(&ctx.device);
        let pipeline =
            Pipeline::new_compute(ctx.device.clone(), shaders.get("skinning.comp")?, vec![layout])?;

        let cmd_pool = unsafe {
            ctx.device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(ctx.device.queue_families().compute),
                None,
            ).map_err(crate::Error::from)?
        };
        let cmd = unsafe {
            ctx.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(cmd_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            ).map_err(crate::Error::from)?[0]
        };
        let fence = Fence::new(ctx.device.clone(), false)?;
        debug!("Created animation compute pass ({input_size}B in, {output_size}B out)");

        Ok(AnimationCompute {
            input,
            output,
            pipeline,
            descriptor_set,
            cmd_pool,
            cmd,
            fence,
            ctx: ctx.clone(),
        })
    }

    /// Write joint/vertex data into the input storage buffer.
    pub fn update_input(&self, data: &[u8], offset: u64) -> Result<()> {
        let mut mapped = self.input.map()?;
        mapped.copy_data(data, offset)?;
        mapped.flush()
    }

    /// Record and submit the dispatch on the compute queue, signaling the
    /// internal fence.
    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<()> {
        let device = &self.ctx.device;
        unsafe {
            device.begin_command_buffer(
                self.cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            ).map_err(crate::Error::from)?;
            device.cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline.handle());
            device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline.layout(),
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_dispatch(self.cmd, x, y, z);
            device.end_command_buffer(self.cmd).map_err(crate::Error::from)?;
        }
        self.ctx.queues.submit_compute(self.cmd, &[], &[], Some(&self.fence))
    }

    /// Block until the dispatch has completed, then reset the fence. The
    /// orchestrator calls this before recording any pass that samples the
    /// skinned output.
    pub fn wait(&self) -> Result<()> {
        self.fence.wait_and_reset()
    }

    /// The skinned output buffer, bound by the geometry pass.
    pub fn output(&self) -> &Buffer {
        &self.output
    }
}

impl Drop for AnimationCompute {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_command_pool(self.cmd_pool, None);
        }
    }
}
