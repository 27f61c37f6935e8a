//! Deimos is a real-time deferred shading renderer built directly on Vulkan.
//!
//! The heart of the crate is the pass-dependency and synchronization core: every
//! visual effect is a [`PassModule`](crate::pass::PassModule) that declares which
//! named render targets it reads and writes, a [`FrameGraph`](crate::graph::FrameGraph)
//! derives the recording order from those declarations, and the
//! [`Renderer`](crate::renderer::Renderer) drives the per-frame fence/semaphore
//! chain that keeps the CPU and GPU in lockstep.
//!
//! # Overview
//!
//! Initialization builds an explicit device context (no global state), negotiates
//! the presentation surface, creates the render target table and every pass module
//! through the same four-phase lifecycle (render passes, framebuffers, pipelines,
//! uniforms):
//! ```no_run
//! use deimos::prelude::*;
//!
//! # fn run(window: winit::window::Window, shaders: ShaderSet) -> anyhow::Result<()> {
//! let settings = RenderSettings::default();
//! let mut renderer = Renderer::new(&window, shaders, settings)?;
//! # let scene = DrawList::default();
//! loop {
//!     renderer.set_camera(CameraState::default());
//!     renderer.draw_frame(&scene, 0.016)?;
//! }
//! # }
//! ```
//!
//! Each frame runs the same strictly ordered state machine: drain the upload
//! queue, dispatch the animation compute pre-pass, acquire a swapchain image,
//! record and submit the shadow command buffer (when enabled), record the
//! deferred command buffer in graph order, submit, present, and wait on the
//! frame fence. See [`renderer`] for the full contract.
//!
//! Shader byte code, meshes and textures are external: they enter through
//! [`ShaderSet`](crate::shaders::ShaderSet) and
//! [`DrawList`](crate::pass::DrawList) as opaque handles.

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;

pub mod prelude;
pub use crate::prelude::*;

pub mod allocator;
pub mod camera;
pub mod compute;
pub mod core;
pub mod descriptor;
pub mod graph;
pub mod pass;
pub mod renderer;
pub mod resource;
pub mod shaders;
pub mod sync;
pub mod targets;
pub mod upload;
pub mod util;
pub mod wsi;
