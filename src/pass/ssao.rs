//! Screen-space ambient occlusion.
//!
//! Two chained sub-passes: the raw occlusion pass samples depth and normals
//! against a 16-sample hemisphere kernel rotated by a tiled 4x4 noise
//! texture, then a blur pass smooths the result. Kernel and noise are
//! generated once at creation time from OS entropy, never per frame.

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
use crate::resource::image::{Image, ImageCreateInfo, LayoutState, SamplerSettings};
use crate::resource::pipeline::PipelineBuilder;
use crate::resource::render_pass::{AttachmentDesc, Framebuffer, RenderPass};
use crate::allocator::MemoryLocation;
use crate::shaders::ShaderSet;
use crate::targets::RenderTargetTable;
use crate::util::as_bytes;
use crate::wsi::swapchain::Swapchain;

/// Hemisphere kernel size.
pub const KERNEL_SIZE: usize = 16;
/// Rotation noise texture side length.
pub const NOISE_DIM: u32 = 4;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct SsaoUbo {
    projection: [[f32; 4]; 4],
    view: [[f32; 4]; 4],
    inv_projection: [[f32; 4]; 4],
}

assert_eq_size!(SsaoUbo, [u8; 192]);

/// Uniform random floats in `[0, 1)` from OS entropy.
fn random_floats(count: usize) -> Result<Vec<f32>> {
    let mut bytes = vec![0u8; count * 4];
    getrandom::getrandom(&mut bytes)
        .map_err(|_| crate::Error::Uncategorized("OS entropy source unavailable"))?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| {
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            (raw >> 8) as f32 / (1u32 << 24) as f32
        })
        .collect())
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Generate the hemisphere sample kernel: unit-or-shorter vectors with
/// non-negative z, scaled so samples cluster near the origin.
pub(crate) fn generate_kernel() -> Result<[[f32; 4]; KERNEL_SIZE]> {
    let randoms = random_floats(KERNEL_SIZE * 4)?;
    let mut kernel = [[0.0f32; 4]; KERNEL_SIZE];
    for (i, sample) in kernel.iter_mut().enumerate() {
        let r = &randoms[i * 4..i * 4 + 4];
        let direction = glam::Vec3::new(r[0] * 2.0 - 1.0, r[1] * 2.0 - 1.0, r[2]).normalize_or_zero();
        let mut scale = i as f32 / KERNEL_SIZE as f32;
        scale = lerp(0.1, 1.0, scale * scale);
        let v = direction * r[3] * scale;
        *sample = [v.x, v.y, v.z, 0.0];
    }
    Ok(kernel)
}

/// Generate the 4x4 rotation noise texels (xy random direction, zw unused).
pub(crate) fn generate_noise() -> Result<[[f32; 4]; (NOISE_DIM * NOISE_DIM) as usize]> {
    let randoms = random_floats((NOISE_DIM * NOISE_DIM) as usize * 2)?;
    let mut noise = [[0.0f32; 4]; (NOISE_DIM * NOISE_DIM) as usize];
    for (i, texel) in noise.iter_mut().enumerate() {
        *texel = [randoms[i * 2] * 2.0 - 1.0, randoms[i * 2 + 1] * 2.0 - 1.0, 0.0, 1.0];
    }
    Ok(noise)
}

/// The SSAO module: raw occlusion then blur.
pub struct SsaoPass {
    device: Device,
    ssao: EffectPass,
    blur: EffectPass,
    ssao_layout: Option<Arc<SetLayout>>,
    blur_layout: Option<Arc<SetLayout>>,
    kernel_uniform: Option<Arc<Buffer>>,
    camera_uniform: Option<Arc<Buffer>>,
    noise: Option<Image>,
}

impl SsaoPass {
    pub fn new(ctx: &DeviceContext) -> Self {
        SsaoPass {
            device: ctx.device.clone(),
            ssao: EffectPass::default(),
            blur: EffectPass::default(),
            ssao_layout: None,
            blur_layout: None,
            kernel_uniform: None,
            camera_uniform: None,
            noise: None,
        }
    }

    /// Upload the noise texels through a staging buffer and leave the texture
    /// in shader-read layout.
    fn create_noise_texture(&mut self, ctx: &DeviceContext) -> Result<()> {
        let texels = generate_noise()?;
        let staging = Buffer::new(
            ctx,
            std::mem::size_of_val(&texels) as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        {
            let mut mapped = staging.map()?;
            mapped.copy_data(unsafe { as_bytes(&texels) }, 0)?;
            mapped.flush()?;
        }

        let mut info =
            ImageCreateInfo::render_target(NOISE_DIM, NOISE_DIM, vk::Format::R16G16B16A16_SFLOAT);
        info.usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
        info.sampler = Some(SamplerSettings::nearest());
        let mut noise = Image::new(ctx, info)?;

        ctx.execute_transfer(|cmd| {
            noise.change_layout(cmd, LayoutState::TransferDst);
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: NOISE_DIM,
                    height: NOISE_DIM,
                    depth: 1,
                },
            };
            unsafe {
                ctx.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    noise.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            noise.change_layout(cmd, LayoutState::ColorRead);
        })?;
        self.noise = Some(noise);
        Ok(())
    }

    fn write_sets(&self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        DescriptorWriter::new()
            .sample_depth(self.ssao.descriptor_set, 0, targets.get("depth")?)
            .sample_image(self.ssao.descriptor_set, 1, targets.get("normal")?)
            .sample_image(self.ssao.descriptor_set, 2, self.noise.as_ref().unwrap())
            .uniform_buffer(self.ssao.descriptor_set, 3, self.kernel_uniform.as_ref().unwrap())
            .uniform_buffer(self.ssao.descriptor_set, 4, self.camera_uniform.as_ref().unwrap())
            .sample_image(self.blur.descriptor_set, 0, targets.get("ssao")?)
            .update(&ctx.device);
        Ok(())
    }
}

impl PassModule for SsaoPass {
    fn name(&self) -> &'static str {
        "ssao"
    }

    fn passes(&self) -> Vec<PassDecl> {
        vec![
            PassDecl::new("ssao", &["depth", "normal"], &["ssao"]),
            PassDecl::new("ssao_blur", &["ssao"], &["ssao_blur"]),
        ]
    }

    fn enabled(&self, settings: &RenderSettings) -> bool {
        settings.ssao
    }

    fn create_render_passes(
        &mut self,
        ctx: &DeviceContext,
        targets: &RenderTargetTable,
        _swapchain: &Swapchain,
    ) -> Result<()> {
        self.ssao.destroy();
        self.blur.destroy();
        self.ssao.render_pass = Some(RenderPass::new(
            ctx.device.clone(),
            &[AttachmentDesc::color(targets.get("ssao")?.format())],
            None,
        )?);
        self.blur.render_pass = Some(RenderPass::new(
            ctx.device.clone(),
            &[AttachmentDesc::color(targets.get("ssao_blur")?.format())],
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
        self.ssao.framebuffers.clear();
        self.blur.framebuffers.clear();
        for _ in 0..swapchain.image_count() {
            self.ssao.framebuffers.push(Framebuffer::new(
                ctx.device.clone(),
                self.ssao.render_pass.as_ref().unwrap(),
                &[targets.get("ssao")?.view()],
                extent.width,
                extent.height,
            )?);
            self.blur.framebuffers.push(Framebuffer::new(
                ctx.device.clone(),
                self.blur.render_pass.as_ref().unwrap(),
                &[targets.get("ssao_blur")?.view()],
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
        let extent = swapchain.extent();
        self.ssao.pipeline = Some(
            PipelineBuilder::new(shaders.get("fullscreen.vert")?, shaders.get("ssao.frag")?)
                .extent(extent)
                .set_layouts(vec![self
                    .ssao_layout
                    .clone()
                    .ok_or(crate::Error::Uncategorized("ssao pipeline built before uniforms"))?])
                .build(ctx.device.clone(), self.ssao.render_pass.as_ref().unwrap())?,
        );
        self.blur.pipeline = Some(
            PipelineBuilder::new(shaders.get("fullscreen.vert")?, shaders.get("ssao_blur.frag")?)
                .extent(extent)
                .set_layouts(vec![self.blur_layout.clone().unwrap()])
                .build(ctx.device.clone(), self.blur.render_pass.as_ref().unwrap())?,
        );
        Ok(())
    }

    fn create_uniforms(
        &mut self,
        ctx: &DeviceContext,
        binder: &DescriptorBinder,
        targets: &RenderTargetTable,
    ) -> Result<()> {
        // Kernel buffer: written once here, never touched again.
        let kernel = generate_kernel()?;
        let kernel_uniform = Arc::new(Buffer::new_uniform(
            ctx,
            std::mem::size_of_val(&kernel) as vk::DeviceSize,
        )?);
        {
            let mut mapped = kernel_uniform.map()?;
            mapped.copy_data(unsafe { as_bytes(&kernel) }, 0)?;
            mapped.flush()?;
        }
        self.kernel_uniform = Some(kernel_uniform);

        let camera_uniform = Arc::new(Buffer::new_uniform(
            ctx,
            std::mem::size_of::<SsaoUbo>() as vk::DeviceSize,
        )?);
        camera_uniform.map()?.zero();
        self.camera_uniform = Some(camera_uniform);

        self.create_noise_texture(ctx)?;

        let sampler = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
        let uniform = vk::DescriptorType::UNIFORM_BUFFER;
        let fragment = vk::ShaderStageFlags::FRAGMENT;
        let ssao_layout = binder.create_layout(&[
            (0, sampler, fragment),
            (1, sampler, fragment),
            (2, sampler, fragment),
            (3, uniform, fragment),
            (4, uniform, fragment),
        ])?;
        let blur_layout = binder.create_layout(&[(0, sampler, fragment)])?;
        self.ssao.descriptor_set = binder.allocate(&ssao_layout)?;
        self.blur.descriptor_set = binder.allocate(&blur_layout)?;
        self.ssao_layout = Some(ssao_layout);
        self.blur_layout = Some(blur_layout);

        self.write_sets(ctx, targets)
    }

    fn rebind(&mut self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        self.write_sets(ctx, targets)
    }

    fn update(&mut self, frame: &FrameContext<'_>) -> Result<()> {
        let camera = frame.camera;
        let ubo = SsaoUbo {
            projection: camera.projection.to_cols_array_2d(),
            view: camera.view.to_cols_array_2d(),
            inv_projection: camera.inv_projection.to_cols_array_2d(),
        };
        frame.upload.request(
            self.camera_uniform.as_ref().unwrap(),
            unsafe { as_bytes(&ubo).to_vec() },
            0,
        );
        Ok(())
    }

    fn draw(
        &mut self,
        pass: &str,
        cmd: vk::CommandBuffer,
        image_index: u32,
        targets: &mut RenderTargetTable,
        _scene: &DrawList,
    ) -> Result<()> {
        let clears = color_clears(1, [1.0, 1.0, 1.0, 1.0]);
        match pass {
            "ssao" => {
                self.ssao.record_fullscreen(&self.device, cmd, image_index, &clears)?;
                targets.get_mut("ssao")?.set_layout_state(LayoutState::ColorRead);
            }
            "ssao_blur" => {
                self.blur.record_fullscreen(&self.device, cmd, image_index, &clears)?;
                targets.get_mut("ssao_blur")?.set_layout_state(LayoutState::ColorRead);
            }
            _ => return Err(crate::Error::Uncategorized("unknown ssao pass").into()),
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.ssao.destroy();
        self.blur.destroy();
        self.kernel_uniform = None;
        self.camera_uniform = None;
        self.noise = None;
        self.ssao_layout = None;
        self.blur_layout = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_samples_stay_in_the_hemisphere() {
        let kernel = generate_kernel().unwrap();
        assert_eq!(kernel.len(), KERNEL_SIZE);
        for sample in kernel {
            let v = glam::Vec3::new(sample[0], sample[1], sample[2]);
            assert!(v.z >= 0.0, "sample below the surface: {v:?}");
            assert!(v.length() <= 1.0 + 1e-5, "sample escapes the unit hemisphere: {v:?}");
        }
    }

    #[test]
    fn kernel_scale_biases_later_samples_outward() {
        // The scale factor applied to sample i is lerp(0.1, 1.0, (i/16)^2):
        // strictly increasing, so the reachable radius grows with the index.
        for i in 1..KERNEL_SIZE {
            let s_prev = super::lerp(0.1, 1.0, ((i - 1) as f32 / 16.0).powi(2));
            let s = super::lerp(0.1, 1.0, (i as f32 / 16.0).powi(2));
            assert!(s > s_prev);
        }
    }

    #[test]
    fn noise_covers_the_full_tile() {
        let noise = generate_noise().unwrap();
        assert_eq!(noise.len(), (NOISE_DIM * NOISE_DIM) as usize);
        for texel in noise {
            assert!((-1.0..=1.0).contains(&texel[0]));
            assert!((-1.0..=1.0).contains(&texel[1]));
        }
    }
}
