//! Pass modules: one per visual effect, all sharing the same lifecycle.
//!
//! Every effect (shadows, the deferred G-buffer and composition, SSAO, SSR,
//! bloom, motion blur, depth of field, FXAA and TAA) implements
//! [`PassModule`]. The orchestrator treats them identically and always calls
//! the lifecycle in fixed order: `create_render_passes`,
//! `create_framebuffers`, `create_uniforms`, `create_pipelines` at init;
//! `create_render_passes`, `create_framebuffers`, `create_pipelines`,
//! `rebind` on resize (uniform buffers and descriptor sets survive, their
//! contents are rewritten); `update` then `draw` per frame for each declared
//! pass, in frame-graph order. It never calls a subset out of order.
//!
//! A disabled module is skipped entirely for the frame: no uniform update, no
//! draw recording, no GPU work.

pub mod bloom;
pub mod deferred;
pub mod dof;
pub mod fxaa;
pub mod motion_blur;
pub mod shadows;
pub mod ssao;
pub mod ssr;
pub mod taa;

use anyhow::Result;
use ash::vk;

use crate::camera::CameraState;
use crate::core::DeviceContext;
use crate::descriptor::DescriptorBinder;
use crate::renderer::RenderSettings;
use crate::resource::pipeline::Pipeline;
use crate::resource::render_pass::{Framebuffer, RenderPass};
use crate::shaders::ShaderSet;
use crate::targets::RenderTargetTable;
use crate::upload::UploadQueue;
use crate::wsi::swapchain::Swapchain;

/// One recordable pass of a module, with the target names it reads and
/// writes. The frame graph derives its edges from these declarations.
#[derive(Debug, Clone)]
pub struct PassDecl {
    pub name: &'static str,
    pub reads: Vec<&'static str>,
    pub writes: Vec<&'static str>,
}

impl PassDecl {
    pub fn new(name: &'static str, reads: &[&'static str], writes: &[&'static str]) -> Self {
        PassDecl {
            name,
            reads: reads.to_vec(),
            writes: writes.to_vec(),
        }
    }
}

/// Per-frame state handed to every enabled module's `update`.
pub struct FrameContext<'a> {
    pub camera: &'a CameraState,
    pub settings: &'a RenderSettings,
    pub upload: &'a UploadQueue,
    pub delta: f32,
}

/// An index range of one mesh inside a model's buffers.
#[derive(Debug, Copy, Clone)]
pub struct MeshRange {
    pub index_count: u32,
    pub index_offset: u32,
    pub vertex_offset: i32,
    /// Meshes with this flag cleared are skipped by every geometry pass.
    pub render: bool,
}

/// Externally owned geometry the geometry passes iterate. Vertex and index
/// buffers, textures and the per-model descriptor set are loaded and owned by
/// the caller; the engine only records binds and draws against them.
#[derive(Debug, Copy, Clone)]
pub struct ModelDraw {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    /// Material/texture bindings for the model, laid out as the G-buffer
    /// pipeline's set 1.
    pub descriptor_set: vk::DescriptorSet,
    /// Models with this flag cleared are skipped entirely.
    pub render: bool,
}

/// All geometry visible this frame.
#[derive(Debug, Default, Clone)]
pub struct DrawList {
    pub models: Vec<(ModelDraw, Vec<MeshRange>)>,
}

impl DrawList {
    /// True when there is nothing to draw. Not an error: geometry passes
    /// record nothing and the frame proceeds with cleared targets.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// The uniform lifecycle every effect implements.
pub trait PassModule {
    /// Module name, used in logs and graph dumps.
    fn name(&self) -> &'static str;

    /// The passes this module records, with their target accesses.
    fn passes(&self) -> Vec<PassDecl>;

    /// Whether the module should run given the current settings. Disabled
    /// modules are pruned from the frame plan before recording.
    fn enabled(&self, _settings: &RenderSettings) -> bool {
        true
    }

    /// Create the module's render pass objects.
    fn create_render_passes(
        &mut self,
        ctx: &DeviceContext,
        targets: &RenderTargetTable,
        swapchain: &Swapchain,
    ) -> Result<()>;

    /// Create per-swapchain-image framebuffers. Modules that own additional
    /// images (shadow cascades, TAA history) create them here and register
    /// shared ones in the target table.
    fn create_framebuffers(
        &mut self,
        ctx: &DeviceContext,
        swapchain: &Swapchain,
        targets: &mut RenderTargetTable,
    ) -> Result<()>;

    /// Build the module's pipelines. Pipelines are immutable; on resize the
    /// orchestrator destroys and re-runs this.
    fn create_pipelines(
        &mut self,
        ctx: &DeviceContext,
        shaders: &ShaderSet,
        targets: &RenderTargetTable,
        swapchain: &Swapchain,
    ) -> Result<()>;

    /// Allocate uniform buffers and descriptor sets. Called once at init.
    fn create_uniforms(
        &mut self,
        ctx: &DeviceContext,
        binder: &DescriptorBinder,
        targets: &RenderTargetTable,
    ) -> Result<()>;

    /// Rewrite descriptor sets after the bound resources changed (resize).
    fn rebind(&mut self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()>;

    /// Per-frame CPU-side state: push uniform writes into the upload queue.
    fn update(&mut self, frame: &FrameContext<'_>) -> Result<()>;

    /// Record one of the module's declared passes.
    fn draw(
        &mut self,
        pass: &str,
        cmd: vk::CommandBuffer,
        image_index: u32,
        targets: &mut RenderTargetTable,
        scene: &DrawList,
    ) -> Result<()>;

    /// Drop every GPU object the module owns. Calling this twice is a no-op;
    /// the orchestrator guarantees the device is idle first.
    fn destroy(&mut self);
}

/// The GPU objects of a single render pass within a module, bundled so the
/// fullscreen effects share their recording code.
#[derive(Default)]
pub(crate) struct EffectPass {
    pub render_pass: Option<RenderPass>,
    pub framebuffers: Vec<Framebuffer>,
    pub pipeline: Option<Pipeline>,
    pub descriptor_set: vk::DescriptorSet,
}

impl EffectPass {
    /// Drop everything; dependents (framebuffers, pipeline) before the render
    /// pass they reference. Safe to call twice.
    pub fn destroy(&mut self) {
        self.framebuffers.clear();
        self.pipeline = None;
        self.render_pass = None;
    }

    /// Record a fullscreen-triangle draw of this pass: begin the render pass,
    /// bind pipeline and descriptor set, draw 3 vertices, end.
    pub fn record_fullscreen(
        &self,
        device: &crate::core::device::Device,
        cmd: vk::CommandBuffer,
        image_index: u32,
        clear_values: &[vk::ClearValue],
    ) -> Result<()> {
        let render_pass = self
            .render_pass
            .as_ref()
            .ok_or(crate::Error::Uncategorized("pass drawn before creation"))?;
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or(crate::Error::Uncategorized("pass drawn before pipeline creation"))?;
        let framebuffer = &self.framebuffers[image_index as usize];

        let begin = vk::RenderPassBeginInfo::builder()
            .render_pass(unsafe { render_pass.handle() })
            .framebuffer(unsafe { framebuffer.handle() })
            .render_area(framebuffer.render_area())
            .clear_values(clear_values);
        unsafe {
            device.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout(),
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_draw(cmd, 3, 1, 0, 0);
            device.cmd_end_render_pass(cmd);
        }
        Ok(())
    }
}

/// Clear values for a pass with `count` color attachments.
pub(crate) fn color_clears(count: usize, color: [f32; 4]) -> Vec<vk::ClearValue> {
    vec![
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: color,
            },
        };
        count
    ]
}

/// The clear value for a depth attachment (far plane at 1.0).
pub(crate) fn depth_clear() -> vk::ClearValue {
    vk::ClearValue {
        depth_stencil: vk::ClearDepthStencilValue {
            depth: 1.0,
            stencil: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroying_a_pass_twice_is_a_no_op() {
        let mut effect = EffectPass::default();
        effect.destroy();
        // Everything is already cleared; a second call must not touch freed
        // handles.
        effect.destroy();
        assert!(effect.render_pass.is_none());
        assert!(effect.framebuffers.is_empty());
    }
}
