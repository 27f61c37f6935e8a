//! FXAA, the spatial anti-aliasing fallback when TAA is off.
//!
//! Reads the end of the post-process chain and writes straight into the
//! swapchain image, leaving it in present layout.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::core::device::Device;
use crate::core::DeviceContext;
use crate::descriptor::{DescriptorBinder, DescriptorWriter, SetLayout};
use crate::pass::{color_clears, DrawList, EffectPass, FrameContext, PassDecl, PassModule};
use crate::renderer::RenderSettings;
use crate::resource::pipeline::PipelineBuilder;
use crate::resource::render_pass::{AttachmentDesc, Framebuffer, RenderPass};
use crate::shaders::ShaderSet;
use crate::targets::RenderTargetTable;
use crate::wsi::swapchain::Swapchain;

pub struct FxaaPass {
    device: Device,
    effect: EffectPass,
    layout: Option<Arc<SetLayout>>,
}

impl FxaaPass {
    pub fn new(ctx: &DeviceContext) -> Self {
        FxaaPass {
            device: ctx.device.clone(),
            effect: EffectPass::default(),
            layout: None,
        }
    }

    fn write_set(&self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        DescriptorWriter::new()
            .sample_image(self.effect.descriptor_set, 0, targets.get("aa_input")?)
            .update(&ctx.device);
        Ok(())
    }
}

impl PassModule for FxaaPass {
    fn name(&self) -> &'static str {
        "fxaa"
    }

    fn passes(&self) -> Vec<PassDecl> {
        vec![PassDecl::new("fxaa", &["aa_input"], &["swapchain"])]
    }

    fn enabled(&self, settings: &RenderSettings) -> bool {
        // TAA owns the swapchain write when both are requested.
        settings.fxaa && !settings.taa
    }

    fn create_render_passes(
        &mut self,
        ctx: &DeviceContext,
        _targets: &RenderTargetTable,
        swapchain: &Swapchain,
    ) -> Result<()> {
        self.effect.destroy();
        self.effect.render_pass = Some(RenderPass::new(
            ctx.device.clone(),
            &[AttachmentDesc::present(swapchain.format().format)],
            None,
        )?);
        Ok(())
    }

    fn create_framebuffers(
        &mut self,
        ctx: &DeviceContext,
        swapchain: &Swapchain,
        _targets: &mut RenderTargetTable,
    ) -> Result<()> {
        let extent = swapchain.extent();
        self.effect.framebuffers.clear();
        for image in swapchain.images() {
            self.effect.framebuffers.push(Framebuffer::new(
                ctx.device.clone(),
                self.effect.render_pass.as_ref().unwrap(),
                &[image.view()],
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
            PipelineBuilder::new(shaders.get("fullscreen.vert")?, shaders.get("fxaa.frag")?)
                .extent(swapchain.extent())
                .set_layouts(vec![self
                    .layout
                    .clone()
                    .ok_or(crate::Error::Uncategorized("fxaa pipeline built before uniforms"))?])
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
        let layout = binder.create_layout(&[(
            0,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::FRAGMENT,
        )])?;
        self.effect.descriptor_set = binder.allocate(&layout)?;
        self.layout = Some(layout);
        self.write_set(ctx, targets)
    }

    fn rebind(&mut self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        self.write_set(ctx, targets)
    }

    fn update(&mut self, _frame: &FrameContext<'_>) -> Result<()> {
        Ok(())
    }

    fn draw(
        &mut self,
        _pass: &str,
        cmd: vk::CommandBuffer,
        image_index: u32,
        _targets: &mut RenderTargetTable,
        _scene: &DrawList,
    ) -> Result<()> {
        let clears = color_clears(1, [0.0, 0.0, 0.0, 1.0]);
        self.effect.record_fullscreen(&self.device, cmd, image_index, &clears)
    }

    fn destroy(&mut self) {
        self.effect.destroy();
        self.layout = None;
    }
}
