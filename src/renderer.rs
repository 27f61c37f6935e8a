//! The frame orchestrator.
//!
//! [`Renderer`] owns the device context, swapchain, render target table, pass
//! modules and the per-frame synchronization set, and drives the same strictly
//! ordered state machine every frame:
//!
//! ```text
//! Idle -> AnimationDispatch (optional) -> ImageAcquire -> ShadowRecord (optional)
//!      -> DeferredRecord -> Submit -> Present -> FenceWait
//! ```
//!
//! Submission is chained with semaphores: the shadow submission waits on the
//! acquire semaphore and signals the shadow semaphore; the deferred submission
//! waits on whichever of the two applies this frame, signals the rendered
//! semaphore plus the frame fence; present waits on the rendered semaphore.
//! The closing fence wait bounds CPU-ahead-of-GPU drift to a single frame,
//! a deliberate simplicity/latency trade-off that also makes single-buffered
//! uniforms safe: a buffer write can never race a not-yet-retired read.
//!
//! The recording order inside a frame is not hard-coded: it is a
//! [`FramePlan`] computed from each pass's declared render-target reads and
//! writes through the [`FrameGraph`], re-derived whenever the settings
//! toggles change.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::allocator::Allocator;
use crate::camera::CameraState;
use crate::compute::AnimationCompute;
use crate::core::debug::DebugMessenger;
use crate::core::device::Device;
use crate::core::instance::{Instance, InstanceSettings};
use crate::core::physical_device::PhysicalDevice;
use crate::core::queue::Queues;
use crate::core::DeviceContext;
use crate::descriptor::{DescriptorBinder, SetLayout};
use crate::graph::FrameGraph;
use crate::pass::bloom::BloomPass;
use crate::pass::deferred::DeferredPass;
use crate::pass::dof::DofPass;
use crate::pass::fxaa::FxaaPass;
use crate::pass::motion_blur::MotionBlurPass;
use crate::pass::shadows::ShadowsPass;
use crate::pass::ssao::SsaoPass;
use crate::pass::ssr::SsrPass;
use crate::pass::taa::TaaPass;
use crate::pass::{DrawList, FrameContext, PassDecl, PassModule};
use crate::resource::image::LayoutState;
use crate::shaders::ShaderSet;
use crate::sync::FrameSync;
use crate::targets::{create_standard_targets, RenderTargetTable};
use crate::upload::UploadQueue;
use crate::wsi::surface::Surface;
use crate::wsi::swapchain::Swapchain;
use crate::wsi::window::WindowInterface;

/// Runtime-flippable configuration, consumed once per frame. Toggling an
/// effect removes it from the frame plan entirely: a disabled effect records
/// no GPU work and does not update its uniforms.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    pub shadows: bool,
    pub ssao: bool,
    pub ssr: bool,
    pub bloom: bool,
    pub motion_blur: bool,
    pub dof: bool,
    pub taa: bool,
    /// Spatial AA fallback; only effective while `taa` is off.
    pub fxaa: bool,
    /// Run the skeletal animation compute pre-pass.
    pub animation: bool,
    /// Debugging override for overloaded-GPU scenarios: wait for the present
    /// queue to drain at the end of every frame.
    pub wait_idle_on_overload: bool,
    pub clear_color: [f32; 4],
    /// Constant factor, clamp, slope factor for shadow rendering.
    pub depth_bias: [f32; 3],
    pub sun_direction: [f32; 3],
    pub taa_feedback: f32,
    pub taa_sharpen: f32,
    /// Threshold, strength, range, exposure.
    pub bloom_values: [f32; 4],
    /// Focus distance, focus range, blur radius.
    pub dof_values: [f32; 4],
    pub motion_blur_strength: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            shadows: true,
            ssao: true,
            ssr: true,
            bloom: true,
            motion_blur: false,
            dof: false,
            taa: true,
            fxaa: false,
            animation: false,
            wait_idle_on_overload: false,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            depth_bias: [1.25, 0.0, 1.75],
            sun_direction: [-0.4, -1.0, -0.3],
            taa_feedback: 0.9,
            taa_sharpen: 0.2,
            bloom_values: [1.0, 1.5, 2.5, 1.0],
            dof_values: [10.0, 5.0, 3.0, 0.0],
            motion_blur_strength: 1.0,
        }
    }
}

/// Aliases wiring the post-process chain for the current settings: each
/// stage's input name resolves to the output of the last *enabled* stage
/// before it, so disabling a stage transparently reroutes its consumers.
pub fn chain_aliases(settings: &RenderSettings) -> Vec<(&'static str, &'static str)> {
    let mut head = "composition";
    let mut aliases = vec![("bloom_input", head)];
    if settings.bloom {
        head = "bloom";
    }
    aliases.push(("motion_blur_input", head));
    if settings.motion_blur {
        head = "motion_blur";
    }
    aliases.push(("dof_input", head));
    if settings.dof {
        head = "dof";
    }
    aliases.push(("aa_input", head));
    aliases
}

/// Plain description of one module for plan building: its name, whether it is
/// enabled this frame, and its declared passes.
#[derive(Debug, Clone)]
pub struct ModulePasses {
    pub name: &'static str,
    pub enabled: bool,
    pub decls: Vec<PassDecl>,
}

/// Which semaphore the deferred submission waits on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitSource {
    /// Shadows ran this frame; wait on the shadow submission.
    Shadows,
    /// No shadow submission; wait directly on image acquisition.
    Acquire,
}

/// One observable step of a frame, in execution order. Produced by
/// [`FramePlan::frame_events`] for tests and tracing; [`Renderer::draw_frame`]
/// executes exactly this sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    AnimationDispatch,
    AcquireImage,
    RecordShadowPass(String),
    SubmitShadows,
    RecordDeferredPass(String),
    /// The TAA history refresh, recorded after the frame's composition chain
    /// is final and before presentation.
    HistoryCopy,
    BlitToSwapchain,
    Submit,
    Present,
    FenceWait,
    WaitIdle,
}

/// The derived per-frame recording schedule: pass steps in dependency order,
/// split between the shadow and deferred command buffers.
#[derive(Debug, Clone)]
pub struct FramePlan {
    pub animation: bool,
    /// (module index, pass name) recorded into the shadow command buffer.
    pub shadow_steps: Vec<(usize, String)>,
    /// (module index, pass name) recorded into the deferred command buffer.
    pub deferred_steps: Vec<(usize, String)>,
    /// No enabled pass writes the swapchain; the orchestrator blits the end
    /// of the chain into the swapchain image instead.
    pub blit_fallback: bool,
    pub wait_idle: bool,
}

impl FramePlan {
    /// Derive the schedule for one frame.
    ///
    /// Disabled modules are pruned before the graph is built. Read names are
    /// resolved through `aliases` so chained effects order against the last
    /// enabled producer.
    pub fn build(
        modules: &[ModulePasses],
        aliases: &[(&'static str, &'static str)],
        settings: &RenderSettings,
    ) -> Result<Self> {
        let resolve = |name: &str| -> String {
            aliases
                .iter()
                .find(|(alias, _)| *alias == name)
                .map(|(_, target)| target.to_string())
                .unwrap_or_else(|| name.to_string())
        };

        let mut graph = FrameGraph::new();
        let mut owner = std::collections::HashMap::new();
        let mut writes_swapchain = false;
        for (index, module) in modules.iter().enumerate() {
            if !module.enabled {
                continue;
            }
            for decl in &module.decls {
                let reads = decl.reads.iter().map(|r| resolve(r)).collect::<Vec<_>>();
                let read_refs = reads.iter().map(|s| s.as_str()).collect::<Vec<_>>();
                graph.add_pass(decl.name, &read_refs, &decl.writes)?;
                owner.insert(decl.name.to_string(), index);
                if decl.writes.contains(&"swapchain") {
                    writes_swapchain = true;
                }
            }
        }

        let mut shadow_steps = vec![];
        let mut deferred_steps = vec![];
        for pass in graph.execution_order()? {
            let module = owner[&pass];
            if modules[module].name == "shadows" {
                shadow_steps.push((module, pass));
            } else {
                deferred_steps.push((module, pass));
            }
        }

        Ok(FramePlan {
            animation: settings.animation,
            shadow_steps,
            deferred_steps,
            blit_fallback: !writes_swapchain,
            wait_idle: settings.wait_idle_on_overload,
        })
    }

    /// The semaphore source for the deferred submission this frame.
    pub fn wait_source(&self) -> WaitSource {
        if self.shadow_steps.is_empty() {
            WaitSource::Acquire
        } else {
            WaitSource::Shadows
        }
    }

    /// The observable event sequence of one frame under this plan.
    pub fn frame_events(&self) -> Vec<FrameEvent> {
        let mut events = vec![];
        if self.animation {
            events.push(FrameEvent::AnimationDispatch);
        }
        events.push(FrameEvent::AcquireImage);
        for (_, pass) in &self.shadow_steps {
            events.push(FrameEvent::RecordShadowPass(pass.clone()));
        }
        if !self.shadow_steps.is_empty() {
            events.push(FrameEvent::SubmitShadows);
        }
        for (_, pass) in &self.deferred_steps {
            events.push(FrameEvent::RecordDeferredPass(pass.clone()));
            if pass == "taa" {
                events.push(FrameEvent::HistoryCopy);
            }
        }
        if self.blit_fallback {
            events.push(FrameEvent::BlitToSwapchain);
        }
        events.push(FrameEvent::Submit);
        events.push(FrameEvent::Present);
        events.push(FrameEvent::FenceWait);
        if self.wait_idle {
            events.push(FrameEvent::WaitIdle);
        }
        events
    }
}

/// The engine: initialization, the frame loop, resize and teardown.
pub struct Renderer {
    // Field order is drop order: GPU objects first, the device context after
    // them, the surface and instance last.
    modules: Vec<Box<dyn PassModule>>,
    targets: RenderTargetTable,
    compute: Option<AnimationCompute>,
    swapchain: Swapchain,
    binder: DescriptorBinder,
    model_layout: Arc<SetLayout>,
    sync: FrameSync,
    cmd_pool: vk::CommandPool,
    shadow_cmd: vk::CommandBuffer,
    deferred_cmd: vk::CommandBuffer,
    upload: UploadQueue,
    shaders: ShaderSet,
    settings: RenderSettings,
    planned_settings: RenderSettings,
    plan: FramePlan,
    camera: CameraState,
    frame_count: u64,
    ctx: DeviceContext,
    surface: Surface,
    _debug: Option<DebugMessenger>,
    physical_device: PhysicalDevice,
    instance: Instance,
}

impl Renderer {
    /// Initialize the engine for a window.
    ///
    /// Any failure here (no capable GPU, unsupported surface, failed
    /// allocation, missing shader) aborts initialization; there is no
    /// partial-failure recovery before the render loop starts.
    pub fn new(
        window: &dyn WindowInterface,
        shaders: ShaderSet,
        settings: RenderSettings,
    ) -> Result<Self> {
        let validation = cfg!(debug_assertions);
        let instance = Instance::new(
            &InstanceSettings {
                app_name: "deimos".to_string(),
                validation,
            },
            window,
        )?;
        let debug = if validation {
            Some(DebugMessenger::new(&instance)?)
        } else {
            None
        };
        let mut surface = Surface::new(&instance, window)?;
        let physical_device = PhysicalDevice::select(&instance, &surface)?;
        surface.query_support(&instance, &physical_device)?;

        let device = Device::new(&instance, &physical_device)?;
        let allocator = Allocator::new(&instance, &device, &physical_device)?;
        let queues = Queues::new(device.clone());
        let ctx = DeviceContext {
            allocator,
            queues,
            device: device.clone(),
        };

        let extent = crate::wsi::surface::swapchain_extent(
            surface.capabilities(),
            window.width(),
            window.height(),
        );
        let swapchain = Swapchain::new(&instance, device.clone(), &surface, extent)?;

        let binder = DescriptorBinder::new(device.clone(), 64)?;
        // Per-model bindings shared by the shadow and G-buffer pipelines:
        // transform uniform plus albedo/normal/material textures. The layout
        // is reference counted; whichever owner drops last deallocates it.
        let model_layout = binder.create_layout(&[
            (
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            ),
            (1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
            (2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
            (3, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
        ])?;

        let mut targets = create_standard_targets(&ctx, extent.width, extent.height)?;
        apply_aliases(&mut targets, &settings);

        let mut modules: Vec<Box<dyn PassModule>> = vec![
            Box::new(ShadowsPass::new(&ctx, model_layout.clone())),
            Box::new(DeferredPass::new(&ctx, model_layout.clone())),
            Box::new(SsaoPass::new(&ctx)),
            Box::new(SsrPass::new(&ctx)),
            Box::new(BloomPass::new(&ctx)),
            Box::new(MotionBlurPass::new(&ctx)),
            Box::new(DofPass::new(&ctx)),
            Box::new(FxaaPass::new(&ctx)),
            Box::new(TaaPass::new(&ctx)),
        ];
        for module in &mut modules {
            module.create_render_passes(&ctx, &targets, &swapchain)?;
        }
        for module in &mut modules {
            module.create_framebuffers(&ctx, &swapchain, &mut targets)?;
        }
        for module in &mut modules {
            module.create_uniforms(&ctx, &binder, &targets)?;
        }
        for module in &mut modules {
            module.create_pipelines(&ctx, &shaders, &targets, &swapchain)?;
        }
        initialize_target_layouts(&ctx, &mut targets)?;

        let compute = if shaders.contains("skinning.comp") {
            Some(AnimationCompute::new(&ctx, &binder, &shaders, 1 << 20, 1 << 20)?)
        } else {
            None
        };

        let sync = FrameSync::new(&device)?;
        let cmd_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(device.queue_families().graphics),
                None,
            ).map_err(crate::Error::from)?
        };
        let buffers = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(cmd_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(2),
            ).map_err(crate::Error::from)?
        };

        let plan = build_plan(&modules, &settings)?;
        info!(
            "Renderer ready: {} modules, plan records {} shadow + {} deferred passes",
            modules.len(),
            plan.shadow_steps.len(),
            plan.deferred_steps.len()
        );

        Ok(Renderer {
            modules,
            targets,
            compute,
            swapchain,
            binder,
            model_layout,
            sync,
            cmd_pool,
            shadow_cmd: buffers[0],
            deferred_cmd: buffers[1],
            upload: UploadQueue::new(),
            shaders,
            planned_settings: settings.clone(),
            settings,
            plan,
            camera: CameraState::default(),
            frame_count: 0,
            ctx,
            surface,
            _debug: debug,
            physical_device,
            instance,
        })
    }

    /// The settings consumed at the start of the next frame.
    pub fn settings_mut(&mut self) -> &mut RenderSettings {
        &mut self.settings
    }

    /// Camera matrices for the upcoming frame. Callers update this every
    /// frame before [`Renderer::draw_frame`]; the previous-view matrix inside
    /// is what the temporal passes reproject with.
    pub fn set_camera(&mut self, camera: CameraState) {
        self.camera = camera;
    }

    /// The upload queue: any producer may clone it and enqueue buffer writes
    /// that the orchestrator applies at the next frame start.
    pub fn upload_queue(&self) -> UploadQueue {
        self.upload.clone()
    }

    /// Descriptor layout external model sets must match (see `ModelDraw`).
    pub fn model_set_layout(&self) -> Arc<SetLayout> {
        self.model_layout.clone()
    }

    /// The animation compute pre-pass, when a skinning shader was supplied.
    pub fn animation_compute(&self) -> Option<&AnimationCompute> {
        self.compute.as_ref()
    }

    /// Number of completed fence cycles since startup.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Render and present one frame.
    pub fn draw_frame(&mut self, scene: &DrawList, delta: f32) -> Result<()> {
        self.refresh_configuration()?;

        // CPU-side state first: enabled modules push their uniform writes...
        let frame = FrameContext {
            camera: &self.camera,
            settings: &self.settings,
            upload: &self.upload,
            delta,
        };
        for module in &mut self.modules {
            if module.enabled(&self.settings) {
                module.update(&frame)?;
            }
        }
        // ...and the queue is drained exactly once, before any recording. The
        // previous frame's fence wait already retired all GPU reads of these
        // buffers.
        self.upload.drain()?;

        if self.plan.animation {
            if let Some(compute) = &self.compute {
                compute.dispatch(2, 2, 1)?;
                // Serialize: the geometry pass samples the skinned output.
                compute.wait()?;
            }
        }

        let (image_index, out_of_date) = self.swapchain.acquire(self.sync.acquire.handle())?;
        let image_index = if out_of_date {
            let extent = self.swapchain.extent();
            self.rebuild(extent.width, extent.height)?;
            let (index, still_out_of_date) = self.swapchain.acquire(self.sync.acquire.handle())?;
            if still_out_of_date {
                return Err(crate::Error::Uncategorized("swapchain out of date after rebuild").into());
            }
            index
        } else {
            image_index
        };

        let shadows_ran = !self.plan.shadow_steps.is_empty();
        if shadows_ran {
            self.record_shadow_buffer(image_index, scene)?;
            self.ctx.queues.submit_graphics(
                self.shadow_cmd,
                &[(
                    self.sync.acquire.handle(),
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                )],
                &[self.sync.shadows.handle()],
                None,
            )?;
        }

        self.record_deferred_buffer(image_index, scene)?;

        let wait = match self.plan.wait_source() {
            WaitSource::Shadows => self.sync.shadows.handle(),
            WaitSource::Acquire => self.sync.acquire.handle(),
        };
        self.ctx.queues.submit_graphics(
            self.deferred_cmd,
            &[(wait, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)],
            &[self.sync.rendered.handle()],
            Some(&self.sync.frame),
        )?;

        self.swapchain.present(
            unsafe { self.ctx.queues.present_handle() },
            image_index,
            self.sync.rendered.handle(),
        )?;

        // Lockstep: block until the GPU finished this frame, then reset. This
        // bounds CPU drift to one frame and is what makes the single-buffered
        // uniform discipline above valid.
        self.sync.frame.wait_and_reset()?;
        if self.plan.wait_idle {
            self.ctx.queues.wait_present_idle()?;
        }
        self.frame_count += 1;
        Ok(())
    }

    /// Resize the viewport. A zero-sized or unchanged extent is a no-op; a
    /// real change rebuilds the swapchain, every render target, and every
    /// pass module's framebuffers and pipelines.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let current = self.swapchain.extent();
        if current.width == width && current.height == height {
            return Ok(());
        }
        self.rebuild(width, height)
    }

    fn rebuild(&mut self, width: u32, height: u32) -> Result<()> {
        // Nothing may be torn down while in flight.
        self.ctx.device.wait_idle()?;
        self.surface.query_support(&self.instance, &self.physical_device)?;
        let extent =
            crate::wsi::surface::swapchain_extent(self.surface.capabilities(), width, height);
        info!("Rebuilding swapchain at {}x{}", extent.width, extent.height);

        let new_swapchain =
            self.swapchain.recreate(self.ctx.device.clone(), &self.surface, extent)?;
        // Drop the old swapchain only after the replacement exists.
        self.swapchain = new_swapchain;

        self.targets.clear();
        self.targets = create_standard_targets(&self.ctx, extent.width, extent.height)?;
        apply_aliases(&mut self.targets, &self.settings);

        for module in &mut self.modules {
            module.create_render_passes(&self.ctx, &self.targets, &self.swapchain)?;
        }
        for module in &mut self.modules {
            module.create_framebuffers(&self.ctx, &self.swapchain, &mut self.targets)?;
        }
        for module in &mut self.modules {
            module.create_pipelines(&self.ctx, &self.shaders, &self.targets, &self.swapchain)?;
        }
        for module in &mut self.modules {
            module.rebind(&self.ctx, &self.targets)?;
        }
        initialize_target_layouts(&self.ctx, &mut self.targets)
    }

    /// Re-derive the frame plan and rewire the chain when settings changed
    /// since the last frame.
    fn refresh_configuration(&mut self) -> Result<()> {
        if self.settings == self.planned_settings {
            return Ok(());
        }
        let rewire = chain_aliases(&self.settings) != chain_aliases(&self.planned_settings);
        self.plan = build_plan(&self.modules, &self.settings)?;
        if rewire {
            // Descriptor sets hold resolved image bindings; any chain change
            // must rewrite them, and nothing referencing them may be in
            // flight.
            self.ctx.device.wait_idle()?;
            apply_aliases(&mut self.targets, &self.settings);
            for module in &mut self.modules {
                module.rebind(&self.ctx, &self.targets)?;
            }
        }
        self.planned_settings = self.settings.clone();
        Ok(())
    }

    fn record_shadow_buffer(&mut self, image_index: u32, scene: &DrawList) -> Result<()> {
        let device = self.ctx.device.clone();
        unsafe {
            device.begin_command_buffer(
                self.shadow_cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            ).map_err(crate::Error::from)?;
            let [constant, clamp, slope] = self.settings.depth_bias;
            device.cmd_set_depth_bias(self.shadow_cmd, constant, clamp, slope);
        }
        let steps = self.plan.shadow_steps.clone();
        for (module, pass) in &steps {
            self.modules[*module].draw(pass, self.shadow_cmd, image_index, &mut self.targets, scene)?;
        }
        unsafe {
            device.end_command_buffer(self.shadow_cmd).map_err(crate::Error::from)?;
        }
        Ok(())
    }

    fn record_deferred_buffer(&mut self, image_index: u32, scene: &DrawList) -> Result<()> {
        let device = self.ctx.device.clone();
        unsafe {
            device.begin_command_buffer(
                self.deferred_cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            ).map_err(crate::Error::from)?;
        }
        let steps = self.plan.deferred_steps.clone();
        for (module, pass) in &steps {
            self.modules[*module].draw(pass, self.deferred_cmd, image_index, &mut self.targets, scene)?;
        }
        if self.plan.blit_fallback {
            self.blit_to_swapchain(image_index)?;
        }
        unsafe {
            device.end_command_buffer(self.deferred_cmd).map_err(crate::Error::from)?;
        }
        Ok(())
    }

    /// Present path when neither TAA nor FXAA runs: blit the end of the post
    /// chain into the swapchain image. Blit support for the surface format
    /// was verified at startup.
    fn blit_to_swapchain(&mut self, image_index: u32) -> Result<()> {
        let cmd = self.deferred_cmd;
        let extent = self.swapchain.extent();
        let source = self.targets.get_mut("aa_input")?;
        source.change_layout(cmd, LayoutState::TransferSrc);
        let src_handle = unsafe { source.handle() };

        let swap_image = self.swapchain.image_mut(image_index);
        // The acquired image's previous contents are irrelevant.
        swap_image.set_layout_state(LayoutState::Undefined);
        swap_image.change_layout(cmd, LayoutState::TransferDst);

        let whole = |extent: vk::Extent2D| {
            [
                vk::Offset3D {
                    x: 0,
                    y: 0,
                    z: 0,
                },
                vk::Offset3D {
                    x: extent.width as i32,
                    y: extent.height as i32,
                    z: 1,
                },
            ]
        };
        let region = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: whole(extent),
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: whole(extent),
        };
        unsafe {
            self.ctx.device.cmd_blit_image(
                cmd,
                src_handle,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swap_image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::NEAREST,
            );
        }
        self.swapchain.image_mut(image_index).change_layout(cmd, LayoutState::Present);
        self.targets.get_mut("aa_input")?.change_layout(cmd, LayoutState::ColorRead);
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Nothing may be destroyed while the GPU still references it.
        if let Err(err) = self.ctx.device.wait_idle() {
            error!("wait_idle at shutdown failed: {err}");
        }
        for module in &mut self.modules {
            module.destroy();
        }
        unsafe {
            self.ctx.device.destroy_command_pool(self.cmd_pool, None);
        }
    }
}

fn build_plan(modules: &[Box<dyn PassModule>], settings: &RenderSettings) -> Result<FramePlan> {
    let descriptions = modules
        .iter()
        .map(|module| ModulePasses {
            name: module.name(),
            enabled: module.enabled(settings),
            decls: module.passes(),
        })
        .collect::<Vec<_>>();
    FramePlan::build(&descriptions, &chain_aliases(settings), settings)
}

fn apply_aliases(targets: &mut RenderTargetTable, settings: &RenderSettings) {
    for (alias, target) in chain_aliases(settings) {
        targets.put_alias(alias, target);
    }
}

/// Transition every freshly created render target into its read state so the
/// first frame's consumers observe a defined layout even when a producer pass
/// is disabled.
fn initialize_target_layouts(ctx: &DeviceContext, targets: &mut RenderTargetTable) -> Result<()> {
    let mut names = crate::targets::STANDARD_TARGETS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
    names.push("depth");
    names.extend(crate::pass::shadows::SHADOW_MAP_NAMES);
    ctx.execute_transfer(|cmd| {
        for name in names {
            if let Ok(image) = targets.get_mut(name) {
                let state = if image.aspect() == vk::ImageAspectFlags::DEPTH {
                    LayoutState::DepthRead
                } else {
                    LayoutState::ColorRead
                };
                image.change_layout(cmd, state);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules_for(settings: &RenderSettings) -> Vec<ModulePasses> {
        // Mirrors the decl sets of the real modules; the plan algorithm only
        // sees this plain data.
        let m = |name: &'static str, enabled: bool, decls: Vec<PassDecl>| ModulePasses {
            name,
            enabled,
            decls,
        };
        vec![
            m(
                "shadows",
                settings.shadows,
                vec![PassDecl::new(
                    "shadows",
                    &[],
                    &["shadow_map_0", "shadow_map_1", "shadow_map_2"],
                )],
            ),
            m(
                "deferred",
                true,
                vec![
                    PassDecl::new(
                        "gbuffer",
                        &[],
                        &["depth", "normal", "albedo", "material", "velocity"],
                    ),
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
                ],
            ),
            m(
                "ssao",
                settings.ssao,
                vec![
                    PassDecl::new("ssao", &["depth", "normal"], &["ssao"]),
                    PassDecl::new("ssao_blur", &["ssao"], &["ssao_blur"]),
                ],
            ),
            m(
                "ssr",
                settings.ssr,
                vec![PassDecl::new("ssr", &["normal", "depth", "material", "albedo"], &["ssr"])],
            ),
            m(
                "bloom",
                settings.bloom,
                vec![
                    PassDecl::new("bright_filter", &["bloom_input"], &["bright_filter"]),
                    PassDecl::new("blur_h", &["bright_filter"], &["blur_h"]),
                    PassDecl::new("blur_v", &["blur_h"], &["blur_v"]),
                    PassDecl::new("bloom_combine", &["blur_v", "bloom_input"], &["bloom"]),
                ],
            ),
            m(
                "motion_blur",
                settings.motion_blur,
                vec![PassDecl::new(
                    "motion_blur",
                    &["motion_blur_input", "depth", "velocity"],
                    &["motion_blur"],
                )],
            ),
            m(
                "dof",
                settings.dof,
                vec![PassDecl::new("dof", &["dof_input", "depth"], &["dof"])],
            ),
            m(
                "fxaa",
                settings.fxaa && !settings.taa,
                vec![PassDecl::new("fxaa", &["aa_input"], &["swapchain"])],
            ),
            m(
                "taa",
                settings.taa,
                vec![PassDecl::new(
                    "taa",
                    &["aa_input", "depth", "velocity"],
                    &["swapchain", "composition2"],
                )],
            ),
        ]
    }

    fn plan_for(settings: &RenderSettings) -> FramePlan {
        FramePlan::build(&modules_for(settings), &chain_aliases(settings), settings).unwrap()
    }

    fn deferred_index(plan: &FramePlan, pass: &str) -> usize {
        plan.deferred_steps.iter().position(|(_, name)| name == pass).unwrap()
    }

    #[test]
    fn shadow_presence_selects_the_wait_source() {
        let mut settings = RenderSettings::default();
        assert_eq!(plan_for(&settings).wait_source(), WaitSource::Shadows);
        settings.shadows = false;
        assert_eq!(plan_for(&settings).wait_source(), WaitSource::Acquire);
    }

    #[test]
    fn composition_records_after_its_producers() {
        let settings = RenderSettings::default();
        let plan = plan_for(&settings);
        let composition = deferred_index(&plan, "composition");
        assert!(deferred_index(&plan, "gbuffer") < composition);
        assert!(deferred_index(&plan, "ssao") < composition);
        assert!(deferred_index(&plan, "ssao_blur") < composition);
        assert!(deferred_index(&plan, "ssr") < composition);
    }

    #[test]
    fn disabled_effects_are_fully_pruned() {
        let mut settings = RenderSettings::default();
        settings.ssao = false;
        settings.bloom = false;
        let plan = plan_for(&settings);
        assert!(plan.deferred_steps.iter().all(|(_, name)| name != "ssao"));
        assert!(plan.deferred_steps.iter().all(|(_, name)| !name.starts_with("blur")));
        // TAA now chains straight off the composition output.
        assert!(plan.deferred_steps.iter().any(|(_, name)| name == "taa"));
    }

    #[test]
    fn chain_reroutes_around_disabled_stages() {
        let mut settings = RenderSettings::default();
        settings.bloom = false;
        settings.motion_blur = true;
        let aliases = chain_aliases(&settings);
        assert!(aliases.contains(&("motion_blur_input", "composition")));
        assert!(aliases.contains(&("aa_input", "motion_blur")));
        settings.motion_blur = false;
        let aliases = chain_aliases(&settings);
        assert!(aliases.contains(&("aa_input", "composition")));
    }

    #[test]
    fn blit_fallback_only_without_an_aa_pass() {
        let mut settings = RenderSettings::default();
        assert!(!plan_for(&settings).blit_fallback);
        settings.taa = false;
        settings.fxaa = true;
        assert!(!plan_for(&settings).blit_fallback);
        settings.fxaa = false;
        assert!(plan_for(&settings).blit_fallback);
    }

    #[test]
    fn history_copy_follows_composition_and_precedes_present() {
        let settings = RenderSettings::default();
        let events = plan_for(&settings).frame_events();
        let composition = events
            .iter()
            .position(|e| matches!(e, FrameEvent::RecordDeferredPass(p) if p == "composition"))
            .unwrap();
        let history = events.iter().position(|e| *e == FrameEvent::HistoryCopy).unwrap();
        let present = events.iter().position(|e| *e == FrameEvent::Present).unwrap();
        assert!(composition < history);
        assert!(history < present);
    }

    #[test]
    fn three_frames_make_three_fence_cycles() {
        // Shadows + SSAO + TAA on, as in the end-to-end scenario: every frame
        // presents once, waits its fence once, and writes composition exactly
        // once before refreshing the TAA history.
        let mut settings = RenderSettings::default();
        settings.shadows = true;
        settings.ssao = true;
        settings.taa = true;
        let plan = plan_for(&settings);

        let mut fence_waits = 0;
        let mut presents = 0;
        for _ in 0..3 {
            let events = plan.frame_events();
            let compositions = events
                .iter()
                .filter(|e| matches!(e, FrameEvent::RecordDeferredPass(p) if p == "composition"))
                .count();
            assert_eq!(compositions, 1);
            fence_waits += events.iter().filter(|e| **e == FrameEvent::FenceWait).count();
            presents += events.iter().filter(|e| **e == FrameEvent::Present).count();
        }
        assert_eq!(fence_waits, 3);
        assert_eq!(presents, 3);
    }

    #[test]
    fn overload_override_appends_a_device_drain() {
        let mut settings = RenderSettings::default();
        settings.wait_idle_on_overload = true;
        let events = plan_for(&settings).frame_events();
        assert_eq!(events.last(), Some(&FrameEvent::WaitIdle));
    }
}
