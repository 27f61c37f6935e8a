//! Temporal anti-aliasing.
//!
//! The blend pass reprojects the persistent `previous` history image with the
//! camera matrices and blends it against the current chain output, writing
//! both the swapchain image and `composition2`. The history is then refreshed
//! with an explicit image-to-image copy of `composition2`, bracketed by full
//! barrier pairs on both images. The copy is recorded after the frame's
//! composition is finalized and before presentation; present may recycle the
//! swapchain image, but `composition2` is ours and stable at that point.

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
use crate::resource::image::{Image, ImageCreateInfo, LayoutState};
use crate::resource::pipeline::PipelineBuilder;
use crate::resource::render_pass::{AttachmentDesc, Framebuffer, RenderPass};
use crate::shaders::ShaderSet;
use crate::targets::RenderTargetTable;
use crate::util::as_bytes;
use crate::wsi::swapchain::Swapchain;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct TaaUbo {
    inv_view_projection: [[f32; 4]; 4],
    previous_view_projection: [[f32; 4]; 4],
    // xy: jitter, z: feedback, w: sharpen strength.
    values: [f32; 4],
}

assert_eq_size!(TaaUbo, [u8; 144]);

pub struct TaaPass {
    device: Device,
    effect: EffectPass,
    layout: Option<Arc<SetLayout>>,
    uniform: Option<Arc<Buffer>>,
    /// Blended output of the previous frame.
    previous: Option<Image>,
}

impl TaaPass {
    pub fn new(ctx: &DeviceContext) -> Self {
        TaaPass {
            device: ctx.device.clone(),
            effect: EffectPass::default(),
            layout: None,
            uniform: None,
            previous: None,
        }
    }

    fn write_set(&self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        DescriptorWriter::new()
            .sample_image(self.effect.descriptor_set, 0, self.previous.as_ref().unwrap())
            .sample_image(self.effect.descriptor_set, 1, targets.get("aa_input")?)
            .sample_depth(self.effect.descriptor_set, 2, targets.get("depth")?)
            .sample_image(self.effect.descriptor_set, 3, targets.get("velocity")?)
            .uniform_buffer(self.effect.descriptor_set, 4, self.uniform.as_ref().unwrap())
            .update(&ctx.device);
        Ok(())
    }

    /// Refresh the history: transition both images into transfer layouts from
    /// their tracked states, copy, and return both to shader-read. The
    /// source's tracked state decides its source-side barrier, exactly like
    /// any other consumer of the target table.
    fn copy_to_history(&mut self, cmd: vk::CommandBuffer, source: &mut Image) {
        let device = self.device.clone();
        let previous = self.previous.as_mut().unwrap();
        previous.change_layout(cmd, LayoutState::TransferDst);
        source.change_layout(cmd, LayoutState::TransferSrc);

        let region = vk::ImageCopy {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offset: vk::Offset3D::default(),
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: previous.width(),
                height: previous.height(),
                depth: 1,
            },
        };
        unsafe {
            device.cmd_copy_image(
                cmd,
                source.handle(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                previous.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        previous.change_layout(cmd, LayoutState::ColorRead);
        source.change_layout(cmd, LayoutState::ColorRead);
    }
}

impl PassModule for TaaPass {
    fn name(&self) -> &'static str {
        "taa"
    }

    fn passes(&self) -> Vec<PassDecl> {
        vec![PassDecl::new(
            "taa",
            &["aa_input", "depth", "velocity"],
            &["swapchain", "composition2"],
        )]
    }

    fn enabled(&self, settings: &RenderSettings) -> bool {
        settings.taa
    }

    fn create_render_passes(
        &mut self,
        ctx: &DeviceContext,
        targets: &RenderTargetTable,
        swapchain: &Swapchain,
    ) -> Result<()> {
        self.effect.destroy();
        self.effect.render_pass = Some(RenderPass::new(
            ctx.device.clone(),
            &[
                AttachmentDesc::present(swapchain.format().format),
                AttachmentDesc::color(targets.get("composition2")?.format()),
            ],
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

        // The history image persists across frames; it is created here (and on
        // resize) and parked in shader-read layout so the first frame's blend
        // reads defined data.
        let mut previous = Image::new(
            ctx,
            ImageCreateInfo::render_target(extent.width, extent.height, vk::Format::R8G8B8A8_UNORM),
        )?;
        ctx.execute_transfer(|cmd| {
            previous.change_layout(cmd, LayoutState::ColorRead);
        })?;
        self.previous = Some(previous);

        self.effect.framebuffers.clear();
        for image in swapchain.images() {
            self.effect.framebuffers.push(Framebuffer::new(
                ctx.device.clone(),
                self.effect.render_pass.as_ref().unwrap(),
                &[image.view(), targets.get("composition2")?.view()],
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
            PipelineBuilder::new(shaders.get("fullscreen.vert")?, shaders.get("taa.frag")?)
                .extent(swapchain.extent())
                .blend_attachments(2)
                .set_layouts(vec![self
                    .layout
                    .clone()
                    .ok_or(crate::Error::Uncategorized("taa pipeline built before uniforms"))?])
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
            std::mem::size_of::<TaaUbo>() as vk::DeviceSize,
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
        let ubo = TaaUbo {
            inv_view_projection: camera.inv_view_projection.to_cols_array_2d(),
            previous_view_projection: (camera.projection * camera.previous_view)
                .to_cols_array_2d(),
            values: [
                camera.jitter.x,
                camera.jitter.y,
                frame.settings.taa_feedback,
                frame.settings.taa_sharpen,
            ],
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
        let clears = color_clears(2, [0.0, 0.0, 0.0, 1.0]);
        self.effect.record_fullscreen(&self.device, cmd, image_index, &clears)?;
        targets.get_mut("composition2")?.set_layout_state(LayoutState::ColorRead);

        let source = targets.get_mut("composition2")?;
        self.copy_to_history(cmd, source);
        Ok(())
    }

    fn destroy(&mut self) {
        self.effect.destroy();
        self.uniform = None;
        self.previous = None;
        self.layout = None;
    }
}
