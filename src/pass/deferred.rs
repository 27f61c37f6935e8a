//! The deferred pipeline: G-buffer fill and lighting composition.
//!
//! Two render passes. The G-buffer pass rasterizes opaque geometry into the
//! normal/albedo/material/velocity attachments plus depth. The composition
//! pass is a fullscreen triangle consuming the G-buffer, the shadow cascades,
//! the blurred SSAO term and the SSR term into the lit `composition` target.
//! The frame graph guarantees composition records after every producer.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use glam::Vec3;
use static_assertions::assert_eq_size;

use crate::core::device::Device;
use crate::core::DeviceContext;
use crate::descriptor::{DescriptorBinder, DescriptorWriter, SetLayout};
use crate::pass::shadows::{cascade_matrices, SHADOW_MAP_NAMES};
use crate::pass::{color_clears, depth_clear, DrawList, EffectPass, FrameContext, PassDecl, PassModule};
use crate::resource::buffer::Buffer;
use crate::resource::image::LayoutState;
use crate::resource::pipeline::{PipelineBuilder, VertexInput};
use crate::resource::render_pass::{AttachmentDesc, Framebuffer, RenderPass};
use crate::shaders::ShaderSet;
use crate::targets::RenderTargetTable;
use crate::util::as_bytes;
use crate::wsi::swapchain::Swapchain;

/// Color attachments of the G-buffer pass, in attachment order.
pub const GBUFFER_TARGETS: [&str; 4] = ["normal", "albedo", "material", "velocity"];

/// The vertex layout geometry passes consume: position, normal, uv, tangent.
pub(crate) fn vertex_input() -> VertexInput {
    VertexInput {
        bindings: vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: 48,
            input_rate: vk::VertexInputRate::VERTEX,
        }],
        attributes: vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 24,
            },
            vk::VertexInputAttributeDescription {
                location: 3,
                binding: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 32,
            },
        ],
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct CameraUbo {
    view_projection: [[f32; 4]; 4],
    previous_view_projection: [[f32; 4]; 4],
    jitter: [f32; 4],
}

assert_eq_size!(CameraUbo, [u8; 144]);

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct CompositionUbo {
    inv_view_projection: [[f32; 4]; 4],
    shadow_view_projection: [[[f32; 4]; 4]; 3],
    cascade_reach: [f32; 4],
    // x: shadows, y: ssao, z: ssr, w: unused.
    effect_flags: [f32; 4],
}

assert_eq_size!(CompositionUbo, [u8; 288]);

/// The deferred G-buffer + composition module.
pub struct DeferredPass {
    device: Device,
    model_layout: Arc<SetLayout>,
    camera_layout: Option<Arc<SetLayout>>,
    composition_layout: Option<Arc<SetLayout>>,
    gbuffer_render_pass: Option<RenderPass>,
    gbuffer_framebuffers: Vec<Framebuffer>,
    gbuffer_pipeline: Option<crate::resource::pipeline::Pipeline>,
    camera_uniform: Option<Arc<Buffer>>,
    camera_set: vk::DescriptorSet,
    composition: EffectPass,
    composition_uniform: Option<Arc<Buffer>>,
}

impl DeferredPass {
    pub fn new(ctx: &DeviceContext, model_layout: Arc<SetLayout>) -> Self {
        DeferredPass {
            device: ctx.device.clone(),
            model_layout,
            camera_layout: None,
            composition_layout: None,
            gbuffer_render_pass: None,
            gbuffer_framebuffers: vec![],
            gbuffer_pipeline: None,
            camera_uniform: None,
            camera_set: vk::DescriptorSet::null(),
            composition: EffectPass::default(),
            composition_uniform: None,
        }
    }

    fn write_composition_set(&self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        let uniform = self.composition_uniform.as_ref().unwrap();
        let mut writer = DescriptorWriter::new()
            .sample_image(self.composition.descriptor_set, 0, targets.get("albedo")?)
            .sample_image(self.composition.descriptor_set, 1, targets.get("normal")?)
            .sample_image(self.composition.descriptor_set, 2, targets.get("material")?)
            .sample_depth(self.composition.descriptor_set, 3, targets.get("depth")?)
            .sample_image(self.composition.descriptor_set, 4, targets.get("ssao_blur")?)
            .sample_image(self.composition.descriptor_set, 5, targets.get("ssr")?);
        for (slot, name) in SHADOW_MAP_NAMES.iter().enumerate() {
            writer = writer.sample_depth(
                self.composition.descriptor_set,
                6 + slot as u32,
                targets.get(name)?,
            );
        }
        writer
            .uniform_buffer(self.composition.descriptor_set, 9, uniform)
            .update(&ctx.device);
        Ok(())
    }
}

impl PassModule for DeferredPass {
    fn name(&self) -> &'static str {
        "deferred"
    }

    fn passes(&self) -> Vec<PassDecl> {
        vec![
            PassDecl::new("gbuffer", &[], &["depth", "normal", "albedo", "material", "velocity"]),
            PassDecl::new(
                "composition",
                &[
                    "depth",
                    "normal",
                    "albedo",
                    "material",
                    "ssao_blur",
                    "ssr",
                    "shadow_map_0",
                    "shadow_map_1",
                    "shadow_map_2",
                ],
                &["composition"],
            ),
        ]
    }

    fn create_render_passes(
        &mut self,
        ctx: &DeviceContext,
        targets: &RenderTargetTable,
        _swapchain: &Swapchain,
    ) -> Result<()> {
        self.gbuffer_framebuffers.clear();
        self.gbuffer_pipeline = None;
        self.composition.destroy();
        let colors = GBUFFER_TARGETS
            .iter()
            .map(|name| Ok(AttachmentDesc::color(targets.get(name)?.format())))
            .collect::<Result<Vec<_>>>()?;
        self.gbuffer_render_pass = Some(RenderPass::new(
            ctx.device.clone(),
            &colors,
            Some(crate::targets::DEPTH_FORMAT),
        )?);
        self.composition.render_pass = Some(RenderPass::new(
            ctx.device.clone(),
            &[AttachmentDesc::color(targets.get("composition")?.format())],
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
        let mut gbuffer_views = GBUFFER_TARGETS
            .iter()
            .map(|name| Ok(targets.get(name)?.view()))
            .collect::<Result<Vec<_>>>()?;
        gbuffer_views.push(targets.get("depth")?.view());
        let composition_view = targets.get("composition")?.view();

        self.gbuffer_framebuffers.clear();
        self.composition.framebuffers.clear();
        for _ in 0..swapchain.image_count() {
            self.gbuffer_framebuffers.push(Framebuffer::new(
                ctx.device.clone(),
                self.gbuffer_render_pass.as_ref().unwrap(),
                &gbuffer_views,
                extent.width,
                extent.height,
            )?);
            self.composition.framebuffers.push(Framebuffer::new(
                ctx.device.clone(),
                self.composition.render_pass.as_ref().unwrap(),
                &[composition_view],
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
        let camera_layout = self
            .camera_layout
            .clone()
            .ok_or(crate::Error::Uncategorized("gbuffer pipeline built before uniforms"))?;
        let composition_layout = self.composition_layout.clone().unwrap();
        let extent = swapchain.extent();

        self.gbuffer_pipeline = Some(
            PipelineBuilder::new(shaders.get("gbuffer.vert")?, shaders.get("gbuffer.frag")?)
                .vertex_input(vertex_input())
                .extent(extent)
                .cull_mode(vk::CullModeFlags::BACK)
                .depth(true, true, vk::CompareOp::LESS_OR_EQUAL)
                .blend_attachments(GBUFFER_TARGETS.len() as u32)
                .set_layouts(vec![camera_layout, self.model_layout.clone()])
                .build(ctx.device.clone(), self.gbuffer_render_pass.as_ref().unwrap())?,
        );
        self.composition.pipeline = Some(
            PipelineBuilder::new(shaders.get("fullscreen.vert")?, shaders.get("composition.frag")?)
                .extent(extent)
                .blend_attachments(1)
                .set_layouts(vec![composition_layout])
                .build(ctx.device.clone(), self.composition.render_pass.as_ref().unwrap())?,
        );
        Ok(())
    }

    fn create_uniforms(
        &mut self,
        ctx: &DeviceContext,
        binder: &DescriptorBinder,
        targets: &RenderTargetTable,
    ) -> Result<()> {
        let camera_layout = binder.create_layout(&[(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX,
        )])?;
        let camera_uniform = Arc::new(Buffer::new_uniform(
            ctx,
            std::mem::size_of::<CameraUbo>() as vk::DeviceSize,
        )?);
        camera_uniform.map()?.zero();
        self.camera_set = binder.allocate(&camera_layout)?;
        DescriptorWriter::new()
            .uniform_buffer(self.camera_set, 0, &camera_uniform)
            .update(&ctx.device);
        self.camera_uniform = Some(camera_uniform);
        self.camera_layout = Some(camera_layout);

        let mut bindings = (0u32..9)
            .map(|binding| {
                (binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)
            })
            .collect::<Vec<_>>();
        bindings.push((9, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT));
        let composition_layout = binder.create_layout(&bindings)?;
        self.composition.descriptor_set = binder.allocate(&composition_layout)?;
        self.composition_layout = Some(composition_layout);

        let composition_uniform = Arc::new(Buffer::new_uniform(
            ctx,
            std::mem::size_of::<CompositionUbo>() as vk::DeviceSize,
        )?);
        composition_uniform.map()?.zero();
        self.composition_uniform = Some(composition_uniform);
        self.write_composition_set(ctx, targets)?;
        Ok(())
    }

    fn rebind(&mut self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        self.write_composition_set(ctx, targets)
    }

    fn update(&mut self, frame: &FrameContext<'_>) -> Result<()> {
        let camera = frame.camera;
        let camera_ubo = CameraUbo {
            view_projection: (camera.projection * camera.view).to_cols_array_2d(),
            previous_view_projection: (camera.projection * camera.previous_view)
                .to_cols_array_2d(),
            jitter: [camera.jitter.x, camera.jitter.y, 0.0, 0.0],
        };
        frame.upload.request(
            self.camera_uniform.as_ref().unwrap(),
            unsafe { as_bytes(&camera_ubo).to_vec() },
            0,
        );

        let cascades = cascade_matrices(camera, Vec3::from(frame.settings.sun_direction));
        let composition_ubo = CompositionUbo {
            inv_view_projection: camera.inv_view_projection.to_cols_array_2d(),
            shadow_view_projection: [
                cascades[0].0.to_cols_array_2d(),
                cascades[1].0.to_cols_array_2d(),
                cascades[2].0.to_cols_array_2d(),
            ],
            cascade_reach: [cascades[0].1, cascades[1].1, cascades[2].1, 0.0],
            effect_flags: [
                frame.settings.shadows as u32 as f32,
                frame.settings.ssao as u32 as f32,
                frame.settings.ssr as u32 as f32,
                0.0,
            ],
        };
        frame.upload.request(
            self.composition_uniform.as_ref().unwrap(),
            unsafe { as_bytes(&composition_ubo).to_vec() },
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
        scene: &DrawList,
    ) -> Result<()> {
        match pass {
            "gbuffer" => self.draw_gbuffer(cmd, image_index, targets, scene),
            "composition" => self.draw_composition(cmd, image_index, targets),
            _ => Err(crate::Error::Uncategorized("unknown deferred pass").into()),
        }
    }

    fn destroy(&mut self) {
        self.gbuffer_framebuffers.clear();
        self.gbuffer_pipeline = None;
        self.gbuffer_render_pass = None;
        self.composition.destroy();
        self.camera_uniform = None;
        self.composition_uniform = None;
        self.camera_layout = None;
        self.composition_layout = None;
    }
}

impl DeferredPass {
    fn draw_gbuffer(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: u32,
        targets: &mut RenderTargetTable,
        scene: &DrawList,
    ) -> Result<()> {
        let device = &self.device;
        let render_pass = self.gbuffer_render_pass.as_ref().unwrap();
        let pipeline = self.gbuffer_pipeline.as_ref().unwrap();
        let framebuffer = &self.gbuffer_framebuffers[image_index as usize];

        let mut clears = color_clears(GBUFFER_TARGETS.len(), [0.0, 0.0, 0.0, 0.0]);
        clears.push(depth_clear());
        let begin = vk::RenderPassBeginInfo::builder()
            .render_pass(unsafe { render_pass.handle() })
            .framebuffer(unsafe { framebuffer.handle() })
            .render_area(framebuffer.render_area())
            .clear_values(&clears);
        unsafe {
            device.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
            // Nothing loaded is not an error; the pass still clears its targets.
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
                    &[self.camera_set, model.descriptor_set],
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
        for name in GBUFFER_TARGETS {
            targets.get_mut(name)?.set_layout_state(LayoutState::ColorRead);
        }
        targets.get_mut("depth")?.set_layout_state(LayoutState::DepthRead);
        Ok(())
    }

    fn draw_composition(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: u32,
        targets: &mut RenderTargetTable,
    ) -> Result<()> {
        let clears = color_clears(1, [0.0, 0.0, 0.0, 1.0]);
        self.composition.record_fullscreen(&self.device, cmd, image_index, &clears)?;
        targets.get_mut("composition")?.set_layout_state(LayoutState::ColorRead);
        Ok(())
    }
}
