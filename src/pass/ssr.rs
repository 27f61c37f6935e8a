//! Screen-space reflections.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use static_assertions::assert_eq_size;

use crate::core::device::Device;
use crate::core::DeviceContext;
use crate::descriptor::{DescriptorBinder, DescriptorWriter, SetLayout};
use crate::pass::{color_clears, DrawList, EffectPass, FrameContext, PassDecl, PassModule};
use crate::renderer::RenderSettings;
use crate::resource::buffer::Buffer;
use crate::resource::image::LayoutState;
use crate::resource::pipeline::PipelineBuilder;
use crate::resource::render_pass::{AttachmentDesc, Framebuffer, RenderPass};
use crate::shaders::ShaderSet;
use crate::targets::RenderTargetTable;
use crate::util::as_bytes;
use crate::wsi::swapchain::Swapchain;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct SsrUbo {
    projection: [[f32; 4]; 4],
    view: [[f32; 4]; 4],
    inv_projection: [[f32; 4]; 4],
    inv_view_projection: [[f32; 4]; 4],
}

assert_eq_size!(SsrUbo, [u8; 256]);

/// Fullscreen reflection march over the G-buffer. Reads the previous frame's
/// lit result through `albedo`/`material` only; the temporal reuse of
/// `composition` is deliberately absent so the pass has no same-frame
/// dependency on lighting.
pub struct SsrPass {
    device: Device,
    effect: EffectPass,
    layout: Option<Arc<SetLayout>>,
    uniform: Option<Arc<Buffer>>,
}

impl SsrPass {
    pub fn new(ctx: &DeviceContext) -> Self {
        SsrPass {
            device: ctx.device.clone(),
            effect: EffectPass::default(),
            layout: None,
            uniform: None,
        }
    }

    fn write_set(&self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        DescriptorWriter::new()
            .sample_image(self.effect.descriptor_set, 0, targets.get("normal")?)
            .sample_depth(self.effect.descriptor_set, 1, targets.get("depth")?)
            .sample_image(self.effect.descriptor_set, 2, targets.get("material")?)
            .sample_image(self.effect.descriptor_set, 3, targets.get("albedo")?)
            .uniform_buffer(self.effect.descriptor_set, 4, self.uniform.as_ref().unwrap())
            .update(&ctx.device);
        Ok(())
    }
}

impl PassModule for SsrPass {
    fn name(&self) -> &'static str {
        "ssr"
    }

    fn passes(&self) -> Vec<PassDecl> {
        vec![PassDecl::new("ssr", &["normal", "depth", "material", "albedo"], &["ssr"])]
    }

    fn enabled(&self, settings: &RenderSettings) -> bool {
        settings.ssr
    }

    fn create_render_passes(
        &mut self,
        ctx: &DeviceContext,
        targets: &RenderTargetTable,
        _swapchain: &Swapchain,
    ) -> Result<()> {
        self.effect.destroy();
        self.effect.render_pass = Some(RenderPass::new(
            ctx.device.clone(),
            &[AttachmentDesc::color(targets.get("ssr")?.format())],
            None,
        )?);
        Ok(())
    }

    fn create_framebuffers(
        &mut self,
        ctx: &DeviceContext,
        swapchain: &Swapchain,
        targets: &mut RenderTargetTable,
    ) -> Result<()> {
        let extent = swapchain.extent();
        self.effect.framebuffers.clear();
        for _ in 0..swapchain.image_count() {
            self.effect.framebuffers.push(Framebuffer::new(
                ctx.device.clone(),
                self.effect.render_pass.as_ref().unwrap(),
                &[targets.get("ssr")?.view()],
                extent.width,
                extent.height,
            )?);
        }
        Ok(())
    }

    fn create_pipelines(
        &mut self,
        ctx: &DeviceContext,
        shaders: &ShaderSet,
        _targets: &RenderTargetTable,
        swapchain: &Swapchain,
    ) -> Result<()> {
        self.effect.pipeline = Some(
            PipelineBuilder::new(shaders.get("fullscreen.vert")?, shaders.get("ssr.frag")?)
                .extent(swapchain.extent())
                .set_layouts(vec![self
                    .layout
                    .clone()
                    .ok_or(crate::Error::Uncategorized("ssr pipeline built before uniforms"))?])
                .build(ctx.device.clone(), self.effect.render_pass.as_ref().unwrap())?,
        );
        Ok(())
    }

    fn create_uniforms(
        &mut self,
        ctx: &DeviceContext,
        binder: &DescriptorBinder,
        targets: &RenderTargetTable,
    ) -> Result<()> {
        let uniform = Arc::new(Buffer::new_uniform(
            ctx,
            std::mem::size_of::<SsrUbo>() as vk::DeviceSize,
        )?);
        uniform.map()?.zero();
        self.uniform = Some(uniform);

        let sampler = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
        let fragment = vk::ShaderStageFlags::FRAGMENT;
        let layout = binder.create_layout(&[
            (0, sampler, fragment),
            (1, sampler, fragment),
            (2, sampler, fragment),
            (3, sampler, fragment),
            (4, vk::DescriptorType::UNIFORM_BUFFER, fragment),
        ])?;
        self.effect.descriptor_set = binder.allocate(&layout)?;
        self.layout = Some(layout);
        self.write_set(ctx, targets)
    }

    fn rebind(&mut self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        self.write_set(ctx, targets)
    }

    fn update(&mut self, frame: &FrameContext<'_>) -> Result<()> {
        let camera = frame.camera;
        let ubo = SsrUbo {
            projection: camera.projection.to_cols_array_2d(),
            view: camera.view.to_cols_array_2d(),
            inv_projection: camera.inv_projection.to_cols_array_2d(),
            inv_view_projection: camera.inv_view_projection.to_cols_array_2d(),
        };
        frame
            .upload
            .request(self.uniform.as_ref().unwrap(), unsafe { as_bytes(&ubo).to_vec() }, 0);
        Ok(())
    }

    fn draw(
        &mut self,
        _pass: &str,
        cmd: vk::CommandBuffer,
        image_index: u32,
        targets: &mut RenderTargetTable,
        _scene: &DrawList,
    ) -> Result<()> {
        let clears = color_clears(1, [0.0, 0.0, 0.0, 0.0]);
        self.effect.record_fullscreen(&self.device, cmd, image_index, &clears)?;
        targets.get_mut("ssr")?.set_layout_state(LayoutState::ColorRead);
        Ok(())
    }

    fn destroy(&mut self) {
        self.effect.destroy();
        self.uniform = None;
        self.layout = None;
    }
}
