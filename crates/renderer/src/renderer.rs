//! Frame orchestration.
//!
//! [`Renderer`] owns the rendering context and the layer groups, and turns
//! a [`RenderTree`] into one encoded and presented frame:
//!
//! 1. Begin the frame (rotate the ring, drain releases, run render jobs)
//! 2. Upload render items, then run tweakers and uploads of layer groups
//! 3. Optional 3D pass into an offscreen target
//! 4. Main pass: opaque groups top-down, translucent groups bottom-up,
//!    layer items, debug overlays
//! 5. End encoding, submit and present, end the frame
//!
//! With worker threads every layer-group visit is split into contiguous
//! slices, one per worker, each with its own view of the paint parameters.
//! Work of the render thread inside the main pass records on the last
//! worker's secondary buffer, which is executed last.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use maprender_core::{FrameTimer, RendererConfig, StatsSnapshot};
use maprender_rhi::{GraphicsBackend, ShaderRegistry, TextureHandle};
use maprender_scheduler::{Scheduler, TaskPanic, ThreadedScheduler};

use crate::command_encoder::{DebugGroup, RenderPassDescriptor};
use crate::context::{Context, FrameStatus};
use crate::error::{RenderError, RenderResult};
use crate::frame_resources::thread_slot;
use crate::layer_group::LayerGroup;
use crate::orchestrator::LayerGroupMap;
use crate::paint_parameters::{PaintParameters, RenderPassKind};
use crate::render_tree::RenderTree;
use crate::ubo::GlobalPaintParamsUbo;

/// Name of the worker pool created by [`Renderer::new`].
const ENCODER_POOL_NAME: &str = "maprender-encoder";

/// Paint parameters of every thread slot: the base at slot 0, one view
/// per worker after it.
type SlotParameters<'c> = Vec<Mutex<PaintParameters<'c>>>;

/// Renders layer groups and render trees into frames.
pub struct Renderer {
    context: Context,
    layer_groups: LayerGroupMap,
    debug_layer_groups: LayerGroupMap,
    timer: FrameTimer,
    frame_number: u64,
}

impl Renderer {
    /// Creates a renderer with its own pool of `config.worker_threads`
    /// encoding threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the worker threads
    /// cannot be spawned or a GPU allocation fails.
    pub fn new(
        backend: Arc<dyn GraphicsBackend>,
        shaders: Arc<dyn ShaderRegistry>,
        config: RendererConfig,
    ) -> RenderResult<Self> {
        let scheduler = Self::create_scheduler(backend.as_ref(), &config)?;
        Self::with_scheduler(backend, shaders, config, scheduler)
    }

    /// Creates a renderer encoding on `scheduler`, or on the calling thread
    /// only when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a GPU allocation
    /// fails.
    pub fn with_scheduler(
        backend: Arc<dyn GraphicsBackend>,
        shaders: Arc<dyn ShaderRegistry>,
        config: RendererConfig,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> RenderResult<Self> {
        let context = Context::new(backend, shaders, config, scheduler)?;
        info!(
            "Renderer initialized: {} frame(s) in flight, {} encoding thread(s)",
            context.frame_count(),
            context.worker_threads()
        );
        Ok(Self {
            context,
            layer_groups: LayerGroupMap::new(),
            debug_layer_groups: LayerGroupMap::new(),
            timer: FrameTimer::new(),
            frame_number: 0,
        })
    }

    fn create_scheduler(
        backend: &dyn GraphicsBackend,
        config: &RendererConfig,
    ) -> RenderResult<Option<Arc<dyn Scheduler>>> {
        if config.worker_threads == 0 {
            return Ok(None);
        }
        if !backend.capabilities().secondary_command_buffers {
            debug!("Backend records inline only, not spawning encoding threads");
            return Ok(None);
        }
        let scheduler = ThreadedScheduler::new(config.worker_threads, ENCODER_POOL_NAME)?;
        scheduler.set_panic_handler(Arc::new(|panic: TaskPanic| {
            error!(
                "Encoding task panicked on worker {}: {}",
                panic.thread_index,
                panic.message()
            );
        }));
        Ok(Some(Arc::new(scheduler)))
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Frames submitted so far. Frames skipped at begin are not counted.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[inline]
    pub fn timer(&self) -> &FrameTimer {
        &self.timer
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats().snapshot()
    }

    /// Rebuilds the surface before the next frame.
    pub fn request_surface_update(&self) {
        self.context.request_surface_update();
    }

    // =========================================================================
    // Layer Groups
    // =========================================================================

    /// Adds a layer group. Returns `false` if the name is already taken.
    pub fn add_layer_group(&mut self, group: Box<dyn LayerGroup>) -> bool {
        self.layer_groups.add_layer_group(group)
    }

    pub fn remove_layer_group(&mut self, name: &str) -> Option<Box<dyn LayerGroup>> {
        self.layer_groups.remove_layer_group(name)
    }

    pub fn layer_groups(&self) -> &LayerGroupMap {
        &self.layer_groups
    }

    pub fn layer_groups_mut(&mut self) -> &mut LayerGroupMap {
        &mut self.layer_groups
    }

    /// Adds a group drawn on the render thread after everything else.
    pub fn add_debug_layer_group(&mut self, group: Box<dyn LayerGroup>) -> bool {
        self.debug_layer_groups.add_layer_group(group)
    }

    pub fn remove_debug_layer_group(&mut self, name: &str) -> Option<Box<dyn LayerGroup>> {
        self.debug_layer_groups.remove_layer_group(name)
    }

    // =========================================================================
    // Frame
    // =========================================================================

    /// Encodes and presents one frame.
    ///
    /// Returns [`FrameStatus::Skipped`] when the surface is out of date;
    /// the surface is rebuilt before the next frame.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while encoding. The frame slot is not
    /// advanced and is reused by the next frame.
    pub fn render(&mut self, tree: &RenderTree) -> RenderResult<FrameStatus> {
        self.context.backend().renderable().wait();
        self.timer.begin_frame();

        if self.context.begin_frame()? == FrameStatus::Skipped {
            debug!("Frame {} skipped at begin", self.frame_number);
            return Ok(FrameStatus::Skipped);
        }

        // Alternate frames hand each slice to a different worker.
        let scramble = self.context.config().debug_thread_scramble && self.frame_number % 2 == 1;
        let status = encode_frame(
            &self.context,
            &mut self.layer_groups,
            &mut self.debug_layer_groups,
            tree,
            scramble,
        )?;

        self.context.end_frame();
        self.frame_number += 1;

        let encoding = self.timer.end_frame();
        trace!(
            "Frame {} encoded in {:.3} ms ({:?})",
            self.frame_number,
            encoding.as_secs_f64() * 1000.0,
            status
        );
        Ok(status)
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("layer_groups", &self.layer_groups.len())
            .field("debug_layer_groups", &self.debug_layer_groups.len())
            .field("frame_number", &self.frame_number)
            .finish()
    }
}

/// Records every pass of one frame and presents it.
fn encode_frame(
    context: &Context,
    groups: &mut LayerGroupMap,
    debug_groups: &mut LayerGroupMap,
    tree: &RenderTree,
    scramble: bool,
) -> RenderResult<FrameStatus> {
    let parameters = tree.parameters();
    let scheduler = context.scheduler();
    let workers = context.worker_threads();
    let layer_count = groups.len() as u32;
    let encoder = context.create_command_encoder();

    // - UPLOAD -----------------------------------------------------------------
    {
        let upload = encoder.create_upload_pass("upload");
        for item in tree.source_items().iter().chain(tree.layer_items()) {
            item.upload(&upload)?;
        }
    }
    let layer_upload = encoder.create_upload_pass("layerGroup-upload");

    let mut base = PaintParameters::new(
        context,
        encoder,
        parameters.transform,
        parameters.symbol_fade_change,
        layer_count,
    );
    base.opaque_pass_cutoff = parameters.opaque_pass_cutoff;
    let views: Vec<PaintParameters<'_>> = (0..workers).map(|_| base.view()).collect();
    let slots: SlotParameters<'_> = std::iter::once(base)
        .chain(views)
        .map(Mutex::new)
        .collect();

    // - LAYER GROUP UPLOAD -----------------------------------------------------
    // Tweakers run first so uploads see this frame's uniform values.
    groups.visit_layer_groups_threaded(scheduler, false, scramble, &|group, thread_index, index| {
        if !group.is_enabled() {
            return Ok(());
        }
        let mut params = slots[thread_slot(thread_index)].lock();
        params.current_layer = index as u32;
        group.run_tweakers(&params)
    })?;
    groups.visit_layer_groups_threaded(scheduler, false, scramble, &|group, _, _| {
        if !group.is_enabled() {
            return Ok(());
        }
        group.upload(&layer_upload)
    })?;
    {
        let base = slots[0].lock();
        for group in debug_groups.groups_mut(false) {
            group.run_tweakers(&base)?;
            group.upload(&layer_upload)?;
        }
    }
    drop(layer_upload);

    let globals = parameters
        .transform
        .global_paint_params(parameters.symbol_fade_change);
    context.update_global_uniform(GlobalPaintParamsUbo::INDEX, bytemuck::bytes_of(&globals))?;

    {
        let mut base = slots[0].lock();
        for group in groups.groups_mut(false) {
            if group.is_enabled() {
                group.pre_render(&mut base, None)?;
            }
        }
    }

    // - 3D ---------------------------------------------------------------------
    if let Some(target) = parameters.target_3d
        && groups
            .iter()
            .any(|group| group.is_enabled() && group.has_render_pass(RenderPassKind::Pass3D))
    {
        render_3d_pass(&mut slots[0].lock(), groups, target, layer_count)?;
    }

    // - MAIN PASS --------------------------------------------------------------
    let descriptor = RenderPassDescriptor::surface()
        .with_clear_color(parameters.clear_color)
        .with_clear_depth(1.0)
        .with_clear_stencil(0);
    {
        let mut base = slots[0].lock();
        let pass = base
            .with_encoder(|encoder| encoder.create_render_pass("main buffer", descriptor))
            .ok_or(RenderError::EncoderReleased)??;
        base.set_render_pass(Some(pass));
        base.forget_clipping_masks();
    }
    bind_global_uniforms(context, scheduler, &slots)?;

    // Render-thread work in the main pass records behind every worker.
    let render_thread = workers.checked_sub(1);
    let render_slot = &slots[thread_slot(render_thread)];

    {
        let _group = pass_debug_group(&render_slot.lock(), workers, "drawables-opaque")?;
        groups.visit_layer_groups_threaded(scheduler, true, scramble, &|group, thread_index, index| {
            if !group.is_enabled() {
                return Ok(());
            }
            let mut params = slots[thread_slot(thread_index)].lock();
            params.current_layer = layer_count - index as u32 - 1;
            params.pass = RenderPassKind::Opaque;
            group.render(&mut params, thread_index)
        })?;
    }

    {
        let _group = pass_debug_group(&render_slot.lock(), workers, "drawables-translucent")?;
        groups.visit_layer_groups_threaded(scheduler, false, scramble, &|group, thread_index, index| {
            if !group.is_enabled() {
                return Ok(());
            }
            let mut params = slots[thread_slot(thread_index)].lock();
            params.current_layer = layer_count - index as u32 - 1;
            params.pass = RenderPassKind::Translucent;
            group.render(&mut params, thread_index)
        })?;

        // Layers without drawables, in tree order.
        let mut params = render_slot.lock();
        params.pass = RenderPassKind::Translucent;
        let items = tree.layer_items();
        for (i, item) in items.iter().enumerate() {
            params.current_layer = (items.len() - i - 1) as u32;
            if item.has_render_pass(params.pass) {
                item.render(&mut params, render_thread)?;
            }
        }
    }

    // - DEBUG ------------------------------------------------------------------
    {
        let mut params = render_slot.lock();
        let _group = pass_debug_group(&params, workers, "debug")?;
        for group in debug_groups.groups_mut(false) {
            if group.is_enabled() {
                group.render(&mut params, render_thread)?;
            }
        }
        if parameters.debug_overlays {
            for item in tree.source_items() {
                item.render(&mut params, render_thread)?;
            }
        }

        for (index, group) in groups.groups_mut(false).into_iter().enumerate() {
            if group.is_enabled() {
                params.current_layer = index as u32;
                group.post_render(&mut params, render_thread)?;
            }
        }
    }

    // - PRESENT ----------------------------------------------------------------
    let base = slots
        .into_iter()
        .next()
        .map(Mutex::into_inner)
        .ok_or(RenderError::EncoderReleased)?;
    if let Some(pass) = base.take_render_pass() {
        pass.end_encoding()?;
    }
    base.with_encoder(|encoder| encoder.present())
        .ok_or(RenderError::EncoderReleased)?
}

/// Draws 3D groups bottom-up into `target`, on the render thread.
///
/// The pass records inline on the primary buffer so the secondary buffers
/// stay free for the main pass.
fn render_3d_pass(
    base: &mut PaintParameters<'_>,
    groups: &mut LayerGroupMap,
    target: TextureHandle,
    layer_count: u32,
) -> RenderResult<()> {
    let descriptor = RenderPassDescriptor::offscreen(target)
        .with_clear_depth(1.0)
        .with_clear_stencil(0)
        .inline();
    let pass = base
        .with_encoder(|encoder| encoder.create_render_pass("3d", descriptor))
        .ok_or(RenderError::EncoderReleased)??;
    base.set_render_pass(Some(pass));
    base.forget_clipping_masks();
    base.pass = RenderPassKind::Pass3D;

    for (index, group) in groups.groups_mut(false).into_iter().enumerate() {
        if group.is_enabled() && group.has_render_pass(RenderPassKind::Pass3D) {
            base.current_layer = layer_count - index as u32 - 1;
            group.render(base, None)?;
        }
    }

    if let Some(pass) = base.take_render_pass() {
        pass.end_encoding()?;
    }
    Ok(())
}

/// Binds the global uniforms on every buffer that records in the main pass.
fn bind_global_uniforms(
    context: &Context,
    scheduler: Option<&dyn Scheduler>,
    slots: &SlotParameters<'_>,
) -> RenderResult<()> {
    let bind = |thread_index: Option<usize>| -> RenderResult<()> {
        slots[thread_slot(thread_index)]
            .lock()
            .with_render_pass(|pass| context.bind_global_uniform_buffers(pass, thread_index))
            .ok_or(RenderError::NoRenderPass)?
    };

    let Some(scheduler) = scheduler else {
        return bind(None);
    };
    let error: Mutex<Option<RenderError>> = Mutex::new(None);
    scheduler.each_thread(&|thread| {
        if let Err(e) = bind(Some(thread)) {
            error.lock().get_or_insert(e);
        }
    });
    match error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// A debug group spanning a whole pass. Only recorded inline: with workers
/// each secondary buffer holds a single slice.
fn pass_debug_group<'c>(
    params: &PaintParameters<'c>,
    workers: usize,
    name: &str,
) -> RenderResult<Option<DebugGroup<'c>>> {
    if workers > 0 {
        return Ok(None);
    }
    params
        .with_render_pass(|pass| pass.create_debug_group(None, name))
        .transpose()
}
