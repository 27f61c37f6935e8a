//! Pipeline creation and ownership.
//!
//! Pipelines are immutable once built: a [`PipelineBuilder`] captures shader
//! stages, fixed-function state and layout references, and [`PipelineBuilder::build`]
//! bakes them into a [`Pipeline`]. On viewport resize every pipeline is
//! rebuilt wholesale; there is no dynamic viewport state in this engine.

use std::ffi::CStr;
use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::core::device::Device;
use crate::descriptor::SetLayout;
use crate::resource::render_pass::RenderPass;

/// An immutable graphics or compute pipeline together with its layout.
///
/// The pipeline keeps its descriptor set layouts alive through `Arc`s: the
/// last owner of a shared layout deallocates it.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Pipeline {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    #[derivative(Debug = "ignore")]
    set_layouts: Vec<Arc<SetLayout>>,
}

impl Pipeline {
    /// Get unsafe access to the underlying `VkPipeline` handle.
    /// # Safety
    /// The caller must not destroy the handle.
    pub unsafe fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    /// The pipeline layout, needed to bind descriptor sets.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Create a compute pipeline from a single compute shader.
    pub fn new_compute(
        device: Device,
        shader: &[u32],
        set_layouts: Vec<Arc<SetLayout>>,
    ) -> Result<Self> {
        let module = create_shader_module(&device, shader)?;
        let layout = create_pipeline_layout(&device, &set_layouts, &[])?;
        let entry = CStr::from_bytes_with_nul(b"main\0").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry)
            .build();
        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();
        let handle = unsafe {
            device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| crate::Error::from(err))?[0]
        };
        unsafe { device.destroy_shader_module(module, None) };
        #[cfg(feature = "log-objects")]
        trace!("Created new compute VkPipeline {:?}", handle);
        Ok(Pipeline {
            device,
            handle,
            layout,
            set_layouts,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkPipeline {:?}", self.handle);
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Vertex input description for geometry pipelines.
#[derive(Debug, Default, Clone)]
pub struct VertexInput {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// Builder for graphics pipelines.
///
/// Defaults match the engine's post-process passes: no vertex input (the
/// fullscreen triangle is generated in the vertex shader), back-face culling,
/// no depth test, one opaque blend attachment.
pub struct PipelineBuilder<'a> {
    vertex_shader: &'a [u32],
    fragment_shader: &'a [u32],
    vertex_input: VertexInput,
    extent: vk::Extent2D,
    cull_mode: vk::CullModeFlags,
    depth_test: bool,
    depth_write: bool,
    depth_compare: vk::CompareOp,
    depth_bias: bool,
    blend_attachment_count: u32,
    set_layouts: Vec<Arc<SetLayout>>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(vertex_shader: &'a [u32], fragment_shader: &'a [u32]) -> Self {
        PipelineBuilder {
            vertex_shader,
            fragment_shader,
            vertex_input: VertexInput::default(),
            extent: vk::Extent2D::default(),
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            depth_bias: false,
            blend_attachment_count: 1,
            set_layouts: vec![],
            push_constant_ranges: vec![],
        }
    }

    pub fn vertex_input(mut self, input: VertexInput) -> Self {
        self.vertex_input = input;
        self
    }

    pub fn extent(mut self, extent: vk::Extent2D) -> Self {
        self.extent = extent;
        self
    }

    pub fn cull_mode(mut self, mode: vk::CullModeFlags) -> Self {
        self.cull_mode = mode;
        self
    }

    pub fn depth(mut self, test: bool, write: bool, compare: vk::CompareOp) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self.depth_compare = compare;
        self
    }

    /// Enable dynamic depth bias, used by the shadow pipeline.
    pub fn depth_bias(mut self) -> Self {
        self.depth_bias = true;
        self
    }

    /// Number of color blend attachments. Must match the render pass.
    pub fn blend_attachments(mut self, count: u32) -> Self {
        self.blend_attachment_count = count;
        self
    }

    pub fn set_layouts(mut self, layouts: Vec<Arc<SetLayout>>) -> Self {
        self.set_layouts = layouts;
        self
    }

    pub fn push_constants(mut self, ranges: Vec<vk::PushConstantRange>) -> Self {
        self.push_constant_ranges = ranges;
        self
    }

    /// Bake the pipeline for the given render pass.
    pub fn build(self, device: Device, render_pass: &RenderPass) -> Result<Pipeline> {
        let vert_module = create_shader_module(&device, self.vertex_shader)?;
        let frag_module = create_shader_module(&device, self.fragment_shader)?;
        let entry = CStr::from_bytes_with_nul(b"main\0").unwrap();

        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(entry)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(entry)
                .build(),
        ];

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(self.vertex_input.bindings.as_slice())
            .vertex_attribute_descriptions(self.vertex_input.attributes.as_slice())
            .build();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .build();

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.extent.width as f32,
            height: self.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: 0,
                y: 0,
            },
            extent: self.extent,
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(std::slice::from_ref(&viewport))
            .scissors(std::slice::from_ref(&scissor))
            .build();

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(self.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(self.depth_bias)
            .line_width(1.0)
            .build();

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0)
            .build();

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(self.depth_compare)
            .build();

        let blend_attachments = (0..self.blend_attachment_count)
            .map(|_| vk::PipelineColorBlendAttachmentState {
                blend_enable: vk::FALSE,
                src_color_blend_factor: vk::BlendFactor::ONE,
                dst_color_blend_factor: vk::BlendFactor::ZERO,
                color_blend_op: vk::BlendOp::ADD,
                src_alpha_blend_factor: vk::BlendFactor::ONE,
                dst_alpha_blend_factor: vk::BlendFactor::ZERO,
                alpha_blend_op: vk::BlendOp::ADD,
                color_write_mask: vk::ColorComponentFlags::RGBA,
            })
            .collect::<Vec<_>>();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(blend_attachments.as_slice())
            .build();

        let dynamic_states = if self.depth_bias {
            vec![vk::DynamicState::DEPTH_BIAS]
        } else {
            vec![]
        };
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(dynamic_states.as_slice())
            .build();

        let layout = create_pipeline_layout(&device, &self.set_layouts, &self.push_constant_ranges)?;

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(unsafe { render_pass.handle() })
            .subpass(0)
            .build();

        let handle = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| crate::Error::from(err))?[0]
        };

        unsafe {
            device.destroy_shader_module(vert_module, None);
            device.destroy_shader_module(frag_module, None);
        }
        #[cfg(feature = "log-objects")]
        trace!("Created new VkPipeline {:?}", handle);

        Ok(Pipeline {
            device,
            handle,
            layout,
            set_layouts: self.set_layouts,
        })
    }
}

fn create_shader_module(device: &Device, words: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::builder().code(words);
    Ok(unsafe { device.create_shader_module(&info, None).map_err(crate::Error::from)? })
}

fn create_pipeline_layout(
    device: &Device,
    set_layouts: &[Arc<SetLayout>],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let raw_layouts = set_layouts
        .iter()
        .map(|layout| unsafe { layout.handle() })
        .collect::<Vec<_>>();
    let info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(raw_layouts.as_slice())
        .push_constant_ranges(push_constant_ranges);
    Ok(unsafe { device.create_pipeline_layout(&info, None).map_err(crate::Error::from)? })
}
