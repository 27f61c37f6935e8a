//! Cascaded shadow mapping.
//!
//! Depth-only rendering of every visible mesh from up to three sun cascades.
//! The cascades share one render pass and one framebuffer array indexed
//! `cascade * swapchain_image_count + image_index`; the cascade textures are
//! registered in the target table so the composition pass can sample them.
//! This module records into its own command buffer, submitted ahead of the
//! deferred buffer and chained to it with a semaphore.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use glam::{Mat4, Vec3};
use static_assertions::assert_eq_size;

use crate::camera::CameraState;
use crate::core::device::Device;
use crate::core::DeviceContext;
use crate::descriptor::{DescriptorBinder, DescriptorWriter, SetLayout};
use crate::pass::{depth_clear, DrawList, FrameContext, PassDecl, PassModule};
use crate::renderer::RenderSettings;
use crate::resource::buffer::Buffer;
use crate::resource::image::{Image, ImageCreateInfo, LayoutState};
use crate::resource::pipeline::{Pipeline, PipelineBuilder};
use crate::resource::render_pass::{Framebuffer, RenderPass};
use crate::shaders::ShaderSet;
use crate::targets::RenderTargetTable;
use crate::util::as_bytes;
use crate::wsi::swapchain::Swapchain;

/// Number of sun cascades.
pub const SHADOW_CASCADES: usize = 3;
/// Square size of each cascade texture.
pub const SHADOW_MAP_SIZE: u32 = 2048;
/// Target table names of the cascade textures.
pub const SHADOW_MAP_NAMES: [&str; SHADOW_CASCADES] =
    ["shadow_map_0", "shadow_map_1", "shadow_map_2"];

const CASCADE_EXTENTS: [f32; SHADOW_CASCADES] = [20.0, 60.0, 180.0];

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct ShadowUbo {
    light_view_projection: [[f32; 4]; 4],
    cast_shadows: f32,
    max_cascade_dist: [f32; 3],
}

assert_eq_size!(ShadowUbo, [u8; 80]);

/// Per-cascade light view-projection matrices and reach. Shared with the
/// composition pass so both sides agree on the reprojection without
/// cross-module wiring.
pub(crate) fn cascade_matrices(
    camera: &CameraState,
    sun_direction: Vec3,
) -> [(Mat4, f32); SHADOW_CASCADES] {
    let center = camera.view.inverse().w_axis.truncate();
    let sun = sun_direction.normalize_or_zero();
    let mut out = [(Mat4::IDENTITY, 0.0); SHADOW_CASCADES];
    for (cascade, slot) in out.iter_mut().enumerate() {
        let extent = CASCADE_EXTENTS[cascade];
        let eye = center - sun * extent * 2.0;
        let view = Mat4::look_at_rh(eye, center, Vec3::Y);
        let projection =
            Mat4::orthographic_rh(-extent, extent, -extent, extent, 0.1, extent * 4.0);
        *slot = (projection * view, extent);
    }
    out
}

/// The cascaded shadow pass module.
pub struct ShadowsPass {
    device: Device,
    model_layout: Arc<SetLayout>,
    ubo_layout: Option<Arc<SetLayout>>,
    render_pass: Option<RenderPass>,
    framebuffers: Vec<Framebuffer>,
    pipeline: Option<Pipeline>,
    uniforms: Vec<Arc<Buffer>>,
    descriptor_sets: Vec<vk::DescriptorSet>,
}

impl ShadowsPass {
    /// `model_layout` is the per-model descriptor layout shared with the
    /// G-buffer pass; the last module holding it deallocates it.
    pub fn new(ctx: &DeviceContext, model_layout: Arc<SetLayout>) -> Self {
        ShadowsPass {
            device: ctx.device.clone(),
            model_layout,
            ubo_layout: None,
            render_pass: None,
            framebuffers: vec![],
            pipeline: None,
            uniforms: vec![],
            descriptor_sets: vec![],
        }
    }
}

impl PassModule for ShadowsPass {
    fn name(&self) -> &'static str {
        "shadows"
    }

    fn passes(&self) -> Vec<PassDecl> {
        vec![PassDecl::new("shadows", &[], &SHADOW_MAP_NAMES)]
    }

    fn enabled(&self, settings: &RenderSettings) -> bool {
        settings.shadows
    }

    fn create_render_passes(
        &mut self,
        ctx: &DeviceContext,
        _targets: &RenderTargetTable,
        _swapchain: &Swapchain,
    ) -> Result<()> {
        // On resize this runs again: dependents go before the render pass
        // they were created for.
        self.framebuffers.clear();
        self.pipeline = None;
        self.render_pass = Some(RenderPass::new_depth_only(
            ctx.device.clone(),
            crate::targets::DEPTH_FORMAT,
        )?);
        Ok(())
    }

    fn create_framebuffers(
        &mut self,
        ctx: &DeviceContext,
        swapchain: &Swapchain,
        targets: &mut RenderTargetTable,
    ) -> Result<()> {
        let render_pass = self.render_pass.as_ref().unwrap();
        // One framebuffer per (cascade, swapchain image) over a shared array:
        // index = cascade * image_count + image_index.
        self.framebuffers.clear();
        for name in SHADOW_MAP_NAMES {
            let image = Image::new(
                ctx,
                ImageCreateInfo::depth_target(
                    SHADOW_MAP_SIZE,
                    SHADOW_MAP_SIZE,
                    crate::targets::DEPTH_FORMAT,
                ),
            )?;
            for _ in 0..swapchain.image_count() {
                self.framebuffers.push(Framebuffer::new(
                    ctx.device.clone(),
                    render_pass,
                    &[image.view()],
                    SHADOW_MAP_SIZE,
                    SHADOW_MAP_SIZE,
                )?);
            }
            targets.put(name, image);
        }
        Ok(())
    }

    fn create_pipelines(
        &mut self,
        ctx: &DeviceContext,
        shaders: &ShaderSet,
        _targets: &RenderTargetTable,
        _swapchain: &Swapchain,
    ) -> Result<()> {
        let ubo_layout = self
            .ubo_layout
            .clone()
            .ok_or(crate::Error::Uncategorized("shadow pipeline built before uniforms"))?;
        self.pipeline = Some(
            PipelineBuilder::new(shaders.get("shadows.vert")?, shaders.get("shadows.frag")?)
                .vertex_input(crate::pass::deferred::vertex_input())
                .extent(vk::Extent2D {
                    width: SHADOW_MAP_SIZE,
                    height: SHADOW_MAP_SIZE,
                })
                .cull_mode(vk::CullModeFlags::FRONT)
                .depth(true, true, vk::CompareOp::LESS_OR_EQUAL)
                .depth_bias()
                .blend_attachments(0)
                .set_layouts(vec![ubo_layout, self.model_layout.clone()])
                .build(ctx.device.clone(), self.render_pass.as_ref().unwrap())?,
        );
        Ok(())
    }

    fn create_uniforms(
        &mut self,
        ctx: &DeviceContext,
        binder: &DescriptorBinder,
        _targets: &RenderTargetTable,
    ) -> Result<()> {
        let layout = binder.create_layout(&[(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX,
        )])?;
        for _ in 0..SHADOW_CASCADES {
            let uniform = Arc::new(Buffer::new_uniform(
                ctx,
                std::mem::size_of::<ShadowUbo>() as vk::DeviceSize,
            )?);
            uniform.map()?.zero();
            let set = binder.allocate(&layout)?;
            DescriptorWriter::new().uniform_buffer(set, 0, &uniform).update(&ctx.device);
            self.uniforms.push(uniform);
            self.descriptor_sets.push(set);
        }
        self.ubo_layout = Some(layout);
        Ok(())
    }

    fn rebind(&mut self, _ctx: &DeviceContext, _targets: &RenderTargetTable) -> Result<()> {
        // Only uniform buffers are bound and they survive a resize untouched.
        Ok(())
    }

    fn update(&mut self, frame: &FrameContext<'_>) -> Result<()> {
        let matrices = cascade_matrices(frame.camera, Vec3::from(frame.settings.sun_direction));
        let reach = [matrices[0].1, matrices[1].1, matrices[2].1];
        for (cascade, (view_projection, _)) in matrices.iter().enumerate() {
            let ubo = ShadowUbo {
                light_view_projection: view_projection.to_cols_array_2d(),
                cast_shadows: 1.0,
                max_cascade_dist: reach,
            };
            frame
                .upload
                .request(&self.uniforms[cascade], unsafe { as_bytes(&ubo).to_vec() }, 0);
        }
        Ok(())
    }

    fn draw(
        &mut self,
        _pass: &str,
        cmd: vk::CommandBuffer,
        image_index: u32,
        targets: &mut RenderTargetTable,
        scene: &DrawList,
    ) -> Result<()> {
        let render_pass = self.render_pass.as_ref().unwrap();
        let pipeline = self.pipeline.as_ref().unwrap();
        let device = &self.device;
        let image_count = self.framebuffers.len() / SHADOW_CASCADES;
        let clear = [depth_clear()];

        for cascade in 0..SHADOW_CASCADES {
            let framebuffer = &self.framebuffers[cascade * image_count + image_index as usize];
            let begin = vk::RenderPassBeginInfo::builder()
                .render_pass(unsafe { render_pass.handle() })
                .framebuffer(unsafe { framebuffer.handle() })
                .render_area(framebuffer.render_area())
                .clear_values(&clear);
            unsafe {
                device.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
                for (model, meshes) in &scene.models {
                    if !model.render {
                        continue;
                    }
                    device.cmd_bind_vertex_buffers(cmd, 0, &[model.vertex_buffer], &[0]);
                    device.cmd_bind_index_buffer(cmd, model.index_buffer, 0, vk::IndexType::UINT32);
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline.layout(),
                        0,
                        &[self.descriptor_sets[cascade], model.descriptor_set],
                        &[],
                    );
                    for mesh in meshes {
                        if mesh.render {
                            device.cmd_draw_indexed(
                                cmd,
                                mesh.index_count,
                                1,
                                mesh.index_offset,
                                mesh.vertex_offset,
                                0,
                            );
                        }
                    }
                }
                device.cmd_end_render_pass(cmd);
            }
            targets
                .get_mut(SHADOW_MAP_NAMES[cascade])?
                .set_layout_state(LayoutState::DepthRead);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.framebuffers.clear();
        self.pipeline = None;
        self.render_pass = None;
        self.descriptor_sets.clear();
        self.uniforms.clear();
        self.ubo_layout = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn cascades_grow_monotonically() {
        let camera = CameraState::default();
        let matrices = cascade_matrices(&camera, Vec3::new(-0.5, -1.0, -0.3));
        assert!(matrices[0].1 < matrices[1].1);
        assert!(matrices[1].1 < matrices[2].1);
    }
}
