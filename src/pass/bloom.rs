//! Bloom: bright filter, separable gaussian blur, combine.
//!
//! Four chained fullscreen passes whose order is fixed purely by their render
//! target reads and writes: `bright_filter` extracts over-threshold pixels
//! from the chain input, `blur_h` and `blur_v` smear them, `combine` adds the
//! result back on top of the chain input into `bloom`.

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
struct BloomUbo {
    // x: threshold, y: strength, z: range, w: exposure.
    values: [f32; 4],
}

assert_eq_size!(BloomUbo, [u8; 16]);

const STAGES: [(&str, &str, &str); 4] = [
    ("bright_filter", "bloom_input", "bright_filter"),
    ("blur_h", "bright_filter", "blur_h"),
    ("blur_v", "blur_h", "blur_v"),
    ("bloom_combine", "blur_v", "bloom"),
];

/// The bloom module: one [`EffectPass`] per chain stage.
pub struct BloomPass {
    device: Device,
    stages: Vec<EffectPass>,
    layouts: Vec<Option<Arc<SetLayout>>>,
    uniform: Option<Arc<Buffer>>,
}

impl BloomPass {
    pub fn new(ctx: &DeviceContext) -> Self {
        BloomPass {
            device: ctx.device.clone(),
            stages: (0..STAGES.len()).map(|_| EffectPass::default()).collect(),
            layouts: vec![None; STAGES.len()],
            uniform: None,
        }
    }

    fn shader_name(stage: &str) -> String {
        format!("{stage}.frag")
    }

    fn write_sets(&self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        let mut writer = DescriptorWriter::new();
        for (index, (_, input, _)) in STAGES.iter().enumerate() {
            let set = self.stages[index].descriptor_set;
            writer = writer
                .sample_image(set, 0, targets.get(input)?)
                .uniform_buffer(set, 2, self.uniform.as_ref().unwrap());
            // Combine also re-reads the chain input it layers bloom over.
            if index == STAGES.len() - 1 {
                writer = writer.sample_image(set, 1, targets.get("bloom_input")?);
            }
        }
        writer.update(&ctx.device);
        Ok(())
    }
}

impl PassModule for BloomPass {
    fn name(&self) -> &'static str {
        "bloom"
    }

    fn passes(&self) -> Vec<PassDecl> {
        STAGES
            .iter()
            .map(|(name, input, output)| {
                if *name == "bloom_combine" {
                    PassDecl::new(name, &[input, "bloom_input"], &[output])
                } else {
                    PassDecl::new(name, &[input], &[output])
                }
            })
            .collect()
    }

    fn enabled(&self, settings: &RenderSettings) -> bool {
        settings.bloom
    }

    fn create_render_passes(
        &mut self,
        ctx: &DeviceContext,
        targets: &RenderTargetTable,
        _swapchain: &Swapchain,
    ) -> Result<()> {
        for stage in &mut self.stages {
            stage.destroy();
        }
        for (index, (_, _, output)) in STAGES.iter().enumerate() {
            self.stages[index].render_pass = Some(RenderPass::new(
                ctx.device.clone(),
                &[AttachmentDesc::color(targets.get(output)?.format())],
                None,
            )?);
        }
        Ok(())
    }

    fn create_framebuffers(
        &mut self,
        ctx: &DeviceContext,
        swapchain: &Swapchain,
        targets: &mut RenderTargetTable,
    ) -> Result<()> {
        let extent = swapchain.extent();
        for (index, (_, _, output)) in STAGES.iter().enumerate() {
            self.stages[index].framebuffers.clear();
            for _ in 0..swapchain.image_count() {
                let framebuffer = Framebuffer::new(
                    ctx.device.clone(),
                    self.stages[index].render_pass.as_ref().unwrap(),
                    &[targets.get(output)?.view()],
                    extent.width,
                    extent.height,
                )?;
                self.stages[index].framebuffers.push(framebuffer);
            }
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
        for (index, (name, _, _)) in STAGES.iter().enumerate() {
            let layout = self.layouts[index]
                .clone()
                .ok_or(crate::Error::Uncategorized("bloom pipeline built before uniforms"))?;
            self.stages[index].pipeline = Some(
                PipelineBuilder::new(
                    shaders.get("fullscreen.vert")?,
                    shaders.get(&Self::shader_name(name))?,
                )
                .extent(swapchain.extent())
                .set_layouts(vec![layout])
                .build(ctx.device.clone(), self.stages[index].render_pass.as_ref().unwrap())?,
            );
        }
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
            std::mem::size_of::<BloomUbo>() as vk::DeviceSize,
        )?);
        uniform.map()?.zero();
        self.uniform = Some(uniform);

        let sampler = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
        let fragment = vk::ShaderStageFlags::FRAGMENT;
        for (index, (name, _, _)) in STAGES.iter().enumerate() {
            let mut bindings = vec![(0, sampler, fragment)];
            if *name == "bloom_combine" {
                bindings.push((1, sampler, fragment));
            }
            bindings.push((2, vk::DescriptorType::UNIFORM_BUFFER, fragment));
            let layout = binder.create_layout(&bindings)?;
            self.stages[index].descriptor_set = binder.allocate(&layout)?;
            self.layouts[index] = Some(layout);
        }
        self.write_sets(ctx, targets)
    }

    fn rebind(&mut self, ctx: &DeviceContext, targets: &RenderTargetTable) -> Result<()> {
        self.write_sets(ctx, targets)
    }

    fn update(&mut self, frame: &FrameContext<'_>) -> Result<()> {
        let ubo = BloomUbo {
            values: frame.settings.bloom_values,
        };
        frame
            .upload
            .request(self.uniform.as_ref().unwrap(), unsafe { as_bytes(&ubo).to_vec() }, 0);
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
        let index = STAGES
            .iter()
            .position(|(name, _, _)| *name == pass)
            .ok_or(crate::Error::Uncategorized("unknown bloom pass"))?;
        let clears = color_clears(1, [0.0, 0.0, 0.0, 0.0]);
        self.stages[index].record_fullscreen(&self.device, cmd, image_index, &clears)?;
        targets.get_mut(STAGES[index].2)?.set_layout_state(LayoutState::ColorRead);
        Ok(())
    }

    fn destroy(&mut self) {
        for stage in &mut self.stages {
            stage.destroy();
        }
        self.layouts = vec![None; STAGES.len()];
        self.uniform = None;
    }
}
