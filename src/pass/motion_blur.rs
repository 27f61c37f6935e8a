//! Per-pixel motion blur over the post-process chain.

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
struct MotionBlurUbo {
    inv_view_projection: [[f32; 4]; 4],
    previous_view_projection: [[f32; 4]; 4],
    // x: strength, y: frame delta, zw: unused.
    values: [f32; 4],
}

assert_eq_size!(MotionBlurUbo, [u8; 144]);

pub struct MotionBlurPass {
    device: Device,
    effect: EffectPass,
    layout: Option<Arc<SetLayout>>,
    uniform: Option<Arc<Buffer>>,
}

impl MotionBlurPass {
    pub fn new(ctx: &DeviceContext) -> Self {
        MotionBlurPass {
            device: ctx.device.clone(),
            effect: EffectPass::default(),
            layout: None,
            uniform: None,
        }
    }

    fn write_set(&self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        DescriptorWriter::new()
            .sample_image(self.effect.descriptor_set, 0, targets.get("motion_blur_input")?)
            .sample_depth(self.effect.descriptor_set, 1, targets.get("depth")?)
            .sample_image(self.effect.descriptor_set, 2, targets.get("velocity")?)
            .uniform_buffer(self.effect.descriptor_set, 3, self.uniform.as_ref().unwrap())
            .update(&ctx.device);
        Ok(())
    }
}

impl PassModule for MotionBlurPass {
    fn name(&self) -> &'static str {
        "motion_blur"
    }

    fn passes(&self) -> Vec<PassDecl> {
        vec![PassDecl::new(
            "motion_blur",
            &["motion_blur_input", "depth", "velocity"],
            &["motion_blur"],
        )]
    }

    fn enabled(&self, settings: &RenderSettings) -> bool {
        settings.motion_blur
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
            &[AttachmentDesc::color(targets.get("motion_blur")?.format())],
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
                &[targets.get("motion_blur")?.view()],
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
            PipelineBuilder::new(shaders.get("fullscreen.vert")?, shaders.get("motion_blur.frag")?)
                .extent(swapchain.extent())
                .set_layouts(vec![self
                    .layout
                    .clone()
                    .ok_or(crate::Error::Uncategorized("motion blur pipeline built before uniforms"))?])
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
            std::mem::size_of::<MotionBlurUbo>() as vk::DeviceSize,
        )?);
        uniform.map()?.zero();
        self.uniform = Some(uniform);

        let sampler = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
        let fragment = vk::ShaderStageFlags::FRAGMENT;
        let layout = binder.create_layout(&[
            (0, sampler, fragment),
            (1, sampler, fragment),
            (2, sampler, fragment),
            (3, vk::DescriptorType::UNIFORM_BUFFER, fragment),
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
        let ubo = MotionBlurUbo {
            inv_view_projection: camera.inv_view_projection.to_cols_array_2d(),
            previous_view_projection: (camera.projection * camera.previous_view)
                .to_cols_array_2d(),
            values: [frame.settings.motion_blur_strength, frame.delta, 0.0, 0.0],
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
        targets.get_mut("motion_blur")?.set_layout_state(LayoutState::ColorRead);
        Ok(())
    }

    fn destroy(&mut self) {
        self.effect.destroy();
        self.uniform = None;
        self.layout = None;
    }
}
