//! The rendering context.
//!
//! [`Context`] owns everything that lives longer than one frame: the frame
//! ring, the per-thread descriptor pools, the deferred release queues, the
//! global uniform buffers and the pipeline cache.
//!
//! # Frame Loop
//!
//! ```text
//! begin_frame()   wait fence, reset buffers, run releases, acquire image
//!   ... encode through a CommandEncoder ...
//! submit_frame()  submit upload + primary, present
//! end_frame()     advance to the next slot
//! ```
//!
//! [`Context::begin_frame`] and [`Context::end_frame`] take `&mut self`.
//! Everything used while encoding takes `&self` and may be called from
//! worker threads with their own thread index.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use maprender_core::{RendererConfig, RenderingStats};
use maprender_rhi::process::SHADER_COMPILER;
use maprender_rhi::{
    AcquireOutcome, BufferHandle, BufferUsage, CommandBufferHandle, CommandBufferUsage,
    DescriptorSetCategory, FenceStatus, GpuResource, GraphicsBackend, PipelineHandle,
    PresentOutcome, ProcessGuard, RhiError, ShaderRegistry, SubmitInfo,
};
use maprender_scheduler::{Scheduler, Task, TaskTag};

use crate::command_encoder::{CommandEncoder, RenderPass};
use crate::descriptor_pool::DescriptorPools;
use crate::error::{RenderError, RenderResult};
use crate::frame_resources::{FrameRing, PendingRelease, ReleaseQueue};
use crate::ubo::{ClipUbo, GLOBAL_UBO_COUNT};
use crate::uniform_buffer::UniformBufferArray;

/// Name of the program used to draw tile clipping masks.
pub const CLIPPING_MASK_PROGRAM: &str = "ClippingMaskProgram";

/// Tile extent used by the clipping mask quad.
const CLIP_EXTENT: i16 = 8192;
const CLIP_INDICES: [u16; 6] = [0, 1, 2, 1, 2, 3];
const DUMMY_UNIFORM_SIZE: u64 = 16;

/// Outcome of a frame step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame can be encoded, or was submitted and presented.
    Ready,
    /// The surface was out of date; nothing was rendered this frame.
    Skipped,
}

/// A buffer owned by the context for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticBuffer {
    handle: BufferHandle,
    size: u64,
}

impl StaticBuffer {
    fn new(backend: &dyn GraphicsBackend, usage: BufferUsage, data: &[u8], name: &str) -> RenderResult<Self> {
        let size = data.len() as u64;
        let handle = backend.create_buffer(size, usage, name)?;
        backend.write_buffer(handle, 0, data)?;
        Ok(Self { handle, size })
    }

    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Long-lived rendering state shared by all frames.
pub struct Context {
    backend: Arc<dyn GraphicsBackend>,
    shaders: Arc<dyn ShaderRegistry>,
    config: RendererConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    /// Worker threads encoding into secondary buffers, 0 when unthreaded.
    worker_threads: usize,
    ring: FrameRing,
    releases: ReleaseQueue,
    descriptor_pools: DescriptorPools,
    global_uniforms: Mutex<Option<UniformBufferArray>>,
    pipelines: Mutex<HashMap<String, Option<PipelineHandle>>>,
    dummy_uniform: StaticBuffer,
    clip_vertices: StaticBuffer,
    clip_indices: StaticBuffer,
    stats: Arc<RenderingStats>,
    render_tag: TaskTag,
    /// Render-thread jobs queued without a scheduler.
    local_jobs: Mutex<Vec<Task>>,
    image_index: AtomicU32,
    surface_update_requested: AtomicBool,
    /// Set while a render pass records every thread on the primary buffer.
    inline_encoding: AtomicBool,
    _shader_compiler: ProcessGuard,
}

impl Context {
    /// Creates the context and allocates every frame slot eagerly.
    ///
    /// Secondary command buffers are used when a scheduler is given and the
    /// backend supports them; otherwise all encoding is inline.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any GPU
    /// allocation fails.
    pub fn new(
        backend: Arc<dyn GraphicsBackend>,
        shaders: Arc<dyn ShaderRegistry>,
        config: RendererConfig,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> RenderResult<Self> {
        config.validate()?;

        let capabilities = backend.capabilities();
        let scheduler = match scheduler {
            Some(_) if !capabilities.secondary_command_buffers => {
                warn!(
                    "{:?} backend has no secondary command buffers, encoding on the render thread",
                    backend.kind()
                );
                None
            }
            scheduler => scheduler.filter(|s| s.thread_count() > 0),
        };
        let worker_threads = scheduler.as_ref().map_or(0, |s| s.thread_count());
        let slot_count = worker_threads + 1;
        let frame_count = config.frames_in_flight;

        let shader_compiler = SHADER_COMPILER.acquire();
        let ring = FrameRing::new(backend.as_ref(), frame_count, worker_threads)?;
        let releases = ReleaseQueue::new(Arc::clone(&backend), frame_count, slot_count);
        let descriptor_pools = DescriptorPools::new(
            slot_count,
            config
                .descriptor_pool_sizes
                .scaled_for_threads(worker_threads),
            config.descriptors_per_set,
            config.pool_grow_factor,
        );

        let dummy_uniform = StaticBuffer::new(
            backend.as_ref(),
            BufferUsage::Uniform,
            &[0; DUMMY_UNIFORM_SIZE as usize],
            "dummy-uniform",
        )?;
        let e = CLIP_EXTENT;
        let vertices: [[i16; 2]; 4] = [[0, 0], [e, 0], [0, e], [e, e]];
        let clip_vertices = StaticBuffer::new(
            backend.as_ref(),
            BufferUsage::Vertex,
            bytemuck::cast_slice(&vertices),
            "clip-vertices",
        )?;
        let clip_indices = StaticBuffer::new(
            backend.as_ref(),
            BufferUsage::Index,
            bytemuck::cast_slice(&CLIP_INDICES),
            "clip-indices",
        )?;

        info!(
            "Rendering context created: {:?} backend, {} frame(s) in flight, {} encoding thread(s)",
            backend.kind(),
            frame_count,
            worker_threads
        );

        let context = Self {
            backend,
            shaders,
            config,
            scheduler,
            worker_threads,
            ring,
            releases,
            descriptor_pools,
            global_uniforms: Mutex::new(None),
            pipelines: Mutex::new(HashMap::new()),
            dummy_uniform,
            clip_vertices,
            clip_indices,
            stats: Arc::new(RenderingStats::new()),
            render_tag: TaskTag::new(),
            local_jobs: Mutex::new(Vec::new()),
            image_index: AtomicU32::new(0),
            surface_update_requested: AtomicBool::new(false),
            inline_encoding: AtomicBool::new(false),
            _shader_compiler: shader_compiler,
        };
        let globals =
            UniformBufferArray::new(&context, DescriptorSetCategory::Global, GLOBAL_UBO_COUNT);
        *context.global_uniforms.lock() = Some(globals);

        Ok(context)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn backend(&self) -> &Arc<dyn GraphicsBackend> {
        &self.backend
    }

    #[inline]
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &Arc<RenderingStats> {
        &self.stats
    }

    /// The scheduler used for multi-threaded encoding, if any.
    pub fn scheduler(&self) -> Option<&dyn Scheduler> {
        self.scheduler.as_deref()
    }

    #[inline]
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Number of thread slots: the render thread plus every worker.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.worker_threads + 1
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn current_frame_index(&self) -> usize {
        self.ring.index()
    }

    /// Surface image acquired for the current frame.
    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn release_queue(&self) -> &ReleaseQueue {
        &self.releases
    }

    #[inline]
    pub fn descriptor_pools(&self) -> &DescriptorPools {
        &self.descriptor_pools
    }

    #[inline]
    pub fn dummy_uniform_buffer(&self) -> StaticBuffer {
        self.dummy_uniform
    }

    #[inline]
    pub fn render_tag(&self) -> TaskTag {
        self.render_tag
    }

    pub fn create_command_encoder(&self) -> CommandEncoder<'_> {
        CommandEncoder::new(self)
    }

    // =========================================================================
    // Frame Lifecycle
    // =========================================================================

    /// Asks for the surface to be rebuilt at the start of the next frame.
    pub fn request_surface_update(&self) {
        self.surface_update_requested.store(true, Ordering::Release);
    }

    pub fn is_surface_update_requested(&self) -> bool {
        self.surface_update_requested.load(Ordering::Acquire)
    }

    /// Prepares the current slot for encoding.
    ///
    /// An out-of-date surface triggers a rebuild and one more attempt; if
    /// that fails too the frame is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if command buffers cannot be reset or begun, or the
    /// surface cannot be acquired or rebuilt.
    pub fn begin_frame(&mut self) -> RenderResult<FrameStatus> {
        self.begin_frame_with_retries(1)
    }

    fn begin_frame_with_retries(&mut self, retries: u32) -> RenderResult<FrameStatus> {
        if self.surface_update_requested.swap(false, Ordering::AcqRel) {
            self.recreate_surface()?;
        }

        let frame = self.ring.current();
        match self
            .backend
            .wait_for_fence(frame.fence(), self.config.fence_timeout)
        {
            Ok(FenceStatus::Signaled) => {}
            Ok(FenceStatus::TimedOut) => {
                warn!(
                    "Timed out waiting for frame slot {} after {:?}",
                    self.ring.index(),
                    self.config.fence_timeout
                );
            }
            Err(e) => error!("Wait fence failed: {}", e),
        }

        frame.reset(self.backend.as_ref())?;
        let releases = self.releases.take_frame(self.ring.index());
        self.run_releases(releases);

        if self.backend.has_surface() {
            let outcome = self
                .backend
                .acquire_next_image(frame.surface_semaphore(), self.config.fence_timeout)?;
            let remediate = self.backend.capabilities().remediate_suboptimal_surface;
            let image = match outcome {
                AcquireOutcome::Acquired(image) => Some(image),
                AcquireOutcome::Suboptimal(image) if !remediate => Some(image),
                AcquireOutcome::Suboptimal(_) | AcquireOutcome::OutOfDate => None,
            };
            let Some(image) = image else {
                self.request_surface_update();
                if retries > 0 {
                    debug!("Surface out of date at acquire, retrying frame");
                    return self.begin_frame_with_retries(retries - 1);
                }
                warn!("Surface still out of date, skipping frame");
                self.stats.add_frame_skipped();
                return Ok(FrameStatus::Skipped);
            };
            self.image_index.store(image, Ordering::Release);
        } else {
            self.image_index
                .store(self.ring.index() as u32, Ordering::Release);
        }

        let frame = self.ring.current();
        self.backend
            .begin_command_buffer(frame.upload(), CommandBufferUsage::OneTimeSubmit)?;
        self.backend
            .begin_command_buffer(frame.primary(), CommandBufferUsage::OneTimeSubmit)?;

        self.stats.begin_frame();
        self.run_render_jobs(false);

        // Per-thread global sets are allocated up front so encoding threads
        // never allocate.
        if let Some(globals) = self.global_uniforms.lock().as_mut() {
            globals.descriptor_set_mut().allocate_all(self)?;
        }

        trace!(
            "Began frame slot {} (image {})",
            self.ring.index(),
            self.image_index()
        );
        Ok(FrameStatus::Ready)
    }

    /// Rebuilds the surface once the device is idle.
    ///
    /// Every pending release of every slot runs, and the ring restarts at
    /// slot 0.
    fn recreate_surface(&mut self) -> RenderResult<()> {
        info!("Recreating surface");
        self.backend.wait_idle()?;
        let releases = self.releases.take_all();
        self.run_releases(releases);
        self.backend.recreate_surface()?;
        self.ring.reset_index();
        self.releases.set_current_frame(0);
        Ok(())
    }

    /// Ends the upload and primary buffers, submits them and presents.
    ///
    /// # Errors
    ///
    /// Returns an error if ending, submitting or presenting fails for any
    /// reason other than an out-of-date surface.
    pub fn submit_frame(&self) -> RenderResult<FrameStatus> {
        let frame = self.ring.current();
        self.backend.end_command_buffer(frame.upload())?;
        self.backend.end_command_buffer(frame.primary())?;

        if let Err(e) = self.backend.reset_fence(frame.fence()) {
            error!("Reset fence failed: {}", e);
        }

        let has_surface = self.backend.has_surface();
        let buffers = [frame.upload(), frame.primary()];
        self.backend.submit(&SubmitInfo {
            command_buffers: &buffers,
            wait: has_surface.then(|| frame.surface_semaphore()),
            signal: has_surface.then(|| frame.frame_semaphore()),
            fence: frame.fence(),
        })?;

        if !has_surface {
            self.stats.add_frame_rendered();
            return Ok(FrameStatus::Ready);
        }

        let remediate = self.backend.capabilities().remediate_suboptimal_surface;
        let outcome = match self
            .backend
            .present(self.image_index(), frame.frame_semaphore())
        {
            Ok(outcome) => outcome,
            Err(RhiError::SurfaceLost(reason)) => {
                warn!("Surface lost at present: {}", reason);
                PresentOutcome::OutOfDate
            }
            Err(e) => return Err(e.into()),
        };
        match outcome {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal if !remediate => {}
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                debug!("Surface out of date at present");
                self.request_surface_update();
                self.stats.add_frame_skipped();
                return Ok(FrameStatus::Skipped);
            }
        }

        self.stats.add_frame_rendered();
        Ok(FrameStatus::Ready)
    }

    /// Advances to the next frame slot.
    pub fn end_frame(&mut self) {
        let index = self.ring.advance();
        self.releases.set_current_frame(index);
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    #[inline]
    pub fn primary_command_buffer(&self) -> CommandBufferHandle {
        self.ring.current().primary()
    }

    #[inline]
    pub fn upload_command_buffer(&self) -> CommandBufferHandle {
        self.ring.current().upload()
    }

    /// The command buffer `thread_index` records into.
    ///
    /// Without worker threads, or inside an inline render pass, everything
    /// goes to the primary buffer. Otherwise the render thread records into
    /// the upload buffer and each worker into its own secondary buffer,
    /// begun on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning the secondary buffer fails.
    pub fn command_buffer(&self, thread_index: Option<usize>) -> RenderResult<CommandBufferHandle> {
        let frame = self.ring.current();
        if self.worker_threads == 0 || self.inline_encoding.load(Ordering::Acquire) {
            debug_assert!(
                self.worker_threads == 0 || thread_index.is_none(),
                "worker thread recording inside an inline render pass"
            );
            return Ok(frame.primary());
        }
        let Some(index) = thread_index else {
            return Ok(frame.upload());
        };

        let Some(slot) = frame.secondary(index) else {
            debug_assert!(false, "no secondary buffer for thread {}", index);
            return Ok(frame.primary());
        };
        let mut slot = slot.lock();
        if !slot.begun {
            self.backend
                .begin_command_buffer(slot.buffer, CommandBufferUsage::RenderPassContinue)?;
            slot.begun = true;
        }
        Ok(slot.buffer)
    }

    pub(crate) fn set_inline_encoding(&self, inline: bool) {
        self.inline_encoding.store(inline, Ordering::Release);
    }

    /// Ends every secondary buffer begun this frame, executes them into the
    /// primary in thread order, then ends the render pass.
    ///
    /// # Errors
    ///
    /// Returns an error if ending a secondary buffer fails.
    pub fn end_encoding(&self) -> RenderResult<()> {
        let frame = self.ring.current();
        let mut executed = Vec::with_capacity(self.worker_threads);
        for slot in frame.secondaries() {
            let mut slot = slot.lock();
            if slot.begun {
                self.backend.end_command_buffer(slot.buffer)?;
                executed.push(slot.buffer);
                slot.begun = false;
            }
        }
        if !executed.is_empty() {
            self.backend.execute_commands(frame.primary(), &executed);
        }
        self.backend.end_render_pass(frame.primary());
        Ok(())
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Defers `release` until the current slot comes around again.
    pub fn enqueue_release(&self, thread_index: Option<usize>, release: PendingRelease) {
        self.releases.enqueue(thread_index, release);
    }

    fn run_releases(&self, releases: Vec<PendingRelease>) {
        if !releases.is_empty() {
            trace!("Running {} deferred release(s)", releases.len());
        }
        for release in releases {
            match release {
                PendingRelease::Gpu(resource) => self.backend.release(resource),
                PendingRelease::DescriptorSets {
                    category,
                    thread_index,
                    pool_index,
                    sets,
                } => self
                    .descriptor_pools
                    .get(category, thread_index)
                    .lock()
                    .release(pool_index, sets),
            }
        }
    }

    /// Looks up a program, building it through the shader registry the
    /// first time `name` is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry fails or does not know `name`.
    pub fn pipeline(&self, name: &str) -> RenderResult<PipelineHandle> {
        let mut pipelines = self.pipelines.lock();
        let pipeline = match pipelines.get(name) {
            Some(pipeline) => *pipeline,
            None => {
                let pipeline = self.shaders.build_program(name, self.backend.as_ref())?;
                debug!("Built program '{}': {:?}", name, pipeline);
                pipelines.insert(name.to_string(), pipeline);
                pipeline
            }
        };
        pipeline.ok_or_else(|| RenderError::ProgramNotFound(name.to_string()))
    }

    /// The global uniform buffers, bound at set 0 for every program.
    pub fn global_uniform_buffers(&self) -> MutexGuard<'_, Option<UniformBufferArray>> {
        self.global_uniforms.lock()
    }

    /// Writes `data` into slot `id` of the global uniform buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if buffer creation or the write fails.
    pub fn update_global_uniform(&self, id: usize, data: &[u8]) -> RenderResult<()> {
        match self.global_uniforms.lock().as_mut() {
            Some(globals) => globals.create_or_update(self, id, data),
            None => Ok(()),
        }
    }

    /// Binds the global uniform buffers on the buffer of `thread_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if updating or binding the descriptor set fails.
    pub fn bind_global_uniform_buffers(
        &self,
        render_pass: &RenderPass<'_>,
        thread_index: Option<usize>,
    ) -> RenderResult<()> {
        match self.global_uniforms.lock().as_mut() {
            Some(globals) => globals.bind(self, render_pass, thread_index),
            None => Ok(()),
        }
    }

    /// Draws one stencil quad per tile, writing each tile's stencil value.
    ///
    /// # Errors
    ///
    /// Returns an error if the clipping program is unavailable or the
    /// command buffer cannot be begun.
    pub fn render_tile_clipping_masks(
        &self,
        render_pass: &RenderPass<'_>,
        thread_index: Option<usize>,
        tiles: &[ClipUbo],
    ) -> RenderResult<()> {
        if tiles.is_empty() {
            return Ok(());
        }
        let pipeline = self.pipeline(CLIPPING_MASK_PROGRAM)?;
        let command_buffer = render_pass.command_buffer(thread_index)?;

        self.backend.bind_pipeline(command_buffer, pipeline);
        self.backend
            .bind_vertex_buffer(command_buffer, self.clip_vertices.handle());
        self.backend
            .bind_index_buffer(command_buffer, self.clip_indices.handle());

        for tile in tiles {
            self.backend
                .set_stencil_reference(command_buffer, tile.stencil_ref);
            self.backend
                .push_constants(command_buffer, pipeline, tile.push_constants());
            self.backend
                .draw_indexed(command_buffer, CLIP_INDICES.len() as u32, 1);
        }
        self.stats.add_draw_calls(tiles.len() as u64);
        Ok(())
    }

    // =========================================================================
    // Render-Thread Jobs
    // =========================================================================

    /// Queues `job` to run on the render thread at the next frame start.
    pub fn run_on_render_thread(&self, job: Task) {
        match &self.scheduler {
            Some(scheduler) => scheduler.run_on_render_thread(self.render_tag, job),
            None => self.local_jobs.lock().push(job),
        }
    }

    fn run_render_jobs(&self, close: bool) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.run_render_jobs(self.render_tag, close);
        }
        let jobs = std::mem::take(&mut *self.local_jobs.lock());
        for job in jobs {
            job();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            error!("Wait for idle device failed during teardown: {}", e);
        }

        let releases = self.releases.take_all();
        self.run_releases(releases);
        self.run_render_jobs(true);

        // Remaining objects release straight to the backend from here on.
        self.releases.close();
        drop(self.global_uniforms.lock().take());

        let mut resources = self.descriptor_pools.take_resources();
        resources.extend(self.ring.take_resources());
        resources.extend(
            [self.dummy_uniform, self.clip_vertices, self.clip_indices]
                .map(|buffer| GpuResource::Buffer(buffer.handle())),
        );
        resources.extend(
            self.pipelines
                .lock()
                .drain()
                .filter_map(|(_, pipeline)| pipeline.map(GpuResource::Pipeline)),
        );
        let count = resources.len();
        for resource in resources {
            self.backend.release(resource);
        }

        debug!("Rendering context destroyed ({} GPU object(s) released)", count);
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use maprender_rhi::{HeadlessBackend, Size};

    pub(crate) const TEST_PROGRAMS: [&str; 3] =
        [CLIPPING_MASK_PROGRAM, "FillProgram", "LineProgram"];

    /// Registry that hands out a fixed handle per known program.
    pub(crate) struct TestShaders {
        pub builds: Mutex<Vec<String>>,
    }

    impl TestShaders {
        pub(crate) fn new() -> Self {
            Self {
                builds: Mutex::new(Vec::new()),
            }
        }
    }

    impl ShaderRegistry for TestShaders {
        fn build_program(
            &self,
            name: &str,
            _backend: &dyn GraphicsBackend,
        ) -> maprender_rhi::RhiResult<Option<PipelineHandle>> {
            self.builds.lock().push(name.to_string());
            Ok(TEST_PROGRAMS
                .iter()
                .position(|program| *program == name)
                .map(|index| PipelineHandle::from_raw(0xC11F + index as u64)))
        }
    }

    /// A context over a headless backend, with `threads` encoding threads
    /// backed by a real scheduler.
    pub(crate) fn headless_context(threads: usize) -> (Arc<HeadlessBackend>, Context) {
        let backend = Arc::new(HeadlessBackend::new(Size::new(256, 256)));
        let scheduler: Option<Arc<dyn Scheduler>> = (threads > 0).then(|| {
            Arc::new(
                maprender_scheduler::ThreadedScheduler::new(threads, "test-encoder")
                    .expect("scheduler"),
            ) as Arc<dyn Scheduler>
        });
        let config = RendererConfig::default().with_worker_threads(threads);
        let context = Context::new(
            backend.clone(),
            Arc::new(TestShaders::new()),
            config,
            scheduler,
        )
        .expect("context");
        (backend, context)
    }

    /// Runs `count` empty frames.
    pub(crate) fn rotate_frames(context: &mut Context, count: usize) {
        for _ in 0..count {
            assert_eq!(context.begin_frame().unwrap(), FrameStatus::Ready);
            context.submit_frame().unwrap();
            context.end_frame();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use maprender_rhi::{BufferHandle, HeadlessBackend, RecordedCommand, Size};

    #[test]
    fn test_rotation_drains_only_the_reused_slot() {
        let (backend, mut context) = headless_context(0);
        rotate_frames(&mut context, 1);
        assert_eq!(context.current_frame_index(), 1);

        let buffer = BufferHandle::from_raw(0xAB);
        context.enqueue_release(None, PendingRelease::Gpu(GpuResource::Buffer(buffer)));

        // Slots 2 and 0 leave the release alone.
        rotate_frames(&mut context, 2);
        assert!(!backend.released().contains(&GpuResource::Buffer(buffer)));
        assert_eq!(context.release_queue().pending(), 1);

        // Slot 1 runs it, exactly once.
        rotate_frames(&mut context, 3);
        let runs = backend
            .released()
            .iter()
            .filter(|r| **r == GpuResource::Buffer(buffer))
            .count();
        assert_eq!(runs, 1);
        assert_eq!(context.current_frame_index(), 0);
    }

    #[test]
    fn test_fence_failure_is_not_fatal() {
        let (backend, mut context) = headless_context(0);
        backend.fail_fence_waits(1);
        assert_eq!(context.begin_frame().unwrap(), FrameStatus::Ready);
        backend.time_out_fence_waits(1);
        context.submit_frame().unwrap();
        context.end_frame();
        assert_eq!(context.begin_frame().unwrap(), FrameStatus::Ready);
    }

    #[test]
    fn test_out_of_date_acquire_retries_once() {
        let (backend, mut context) = headless_context(0);
        rotate_frames(&mut context, 1);
        backend.push_acquire_outcome(AcquireOutcome::OutOfDate);

        assert_eq!(context.begin_frame().unwrap(), FrameStatus::Ready);
        assert_eq!(backend.surface_recreations(), 1);
        assert_eq!(context.current_frame_index(), 0);
    }

    #[test]
    fn test_repeated_out_of_date_skips_frame() {
        let (backend, mut context) = headless_context(0);
        backend.push_acquire_outcome(AcquireOutcome::OutOfDate);
        backend.push_acquire_outcome(AcquireOutcome::OutOfDate);

        assert_eq!(context.begin_frame().unwrap(), FrameStatus::Skipped);
        assert!(context.is_surface_update_requested());
        assert_eq!(context.stats().snapshot().frames_skipped, 1);

        // The next frame recreates the surface and proceeds.
        assert_eq!(context.begin_frame().unwrap(), FrameStatus::Ready);
        assert_eq!(backend.surface_recreations(), 2);
    }

    #[test]
    fn test_recreation_drains_every_slot() {
        let (backend, mut context) = headless_context(0);
        rotate_frames(&mut context, 1);
        let buffer = BufferHandle::from_raw(0xCD);
        context.enqueue_release(None, PendingRelease::Gpu(GpuResource::Buffer(buffer)));
        context.request_surface_update();

        rotate_frames(&mut context, 1);
        assert!(backend.released().contains(&GpuResource::Buffer(buffer)));
        assert_eq!(backend.idle_waits(), 1);
        // Slot 0 was used after the reset.
        assert_eq!(context.current_frame_index(), 1);
    }

    #[test]
    fn test_suboptimal_acquire_follows_capability() {
        let (backend, mut context) = headless_context(0);
        backend.push_acquire_outcome(AcquireOutcome::Suboptimal(1));
        assert_eq!(context.begin_frame().unwrap(), FrameStatus::Ready);
        assert_eq!(context.image_index(), 1);
        assert!(!context.is_surface_update_requested());
        assert_eq!(backend.surface_recreations(), 0);
    }

    #[test]
    fn test_present_out_of_date_skips_and_requests_update() {
        let (backend, mut context) = headless_context(0);
        context.begin_frame().unwrap();
        backend.push_present_outcome(PresentOutcome::OutOfDate);
        assert_eq!(context.submit_frame().unwrap(), FrameStatus::Skipped);
        assert!(context.is_surface_update_requested());
    }

    #[test]
    fn test_submission_waits_and_signals() {
        let (backend, mut context) = headless_context(0);
        rotate_frames(&mut context, 1);
        let submission = backend.last_submission().unwrap();
        assert_eq!(submission.command_buffers.len(), 2);
        assert!(submission.wait.is_some());
        assert!(submission.signal.is_some());
        assert_eq!(backend.presents(), 1);
        assert_eq!(context.stats().snapshot().frames_rendered, 1);
    }

    #[test]
    fn test_pipeline_built_once() {
        let backend = Arc::new(HeadlessBackend::new(Size::new(64, 64)));
        let shaders = Arc::new(TestShaders::new());
        let context = Context::new(
            backend,
            shaders.clone(),
            RendererConfig::default().with_worker_threads(0),
            None,
        )
        .unwrap();

        let first = context.pipeline(CLIPPING_MASK_PROGRAM).unwrap();
        let second = context.pipeline(CLIPPING_MASK_PROGRAM).unwrap();
        assert_eq!(first, second);
        assert!(matches!(
            context.pipeline("Unknown"),
            Err(RenderError::ProgramNotFound(_))
        ));
        assert!(context.pipeline("Unknown").is_err());
        assert_eq!(*shaders.builds.lock(), vec![CLIPPING_MASK_PROGRAM, "Unknown"]);
    }

    #[test]
    fn test_secondary_buffers_begun_lazily() {
        let (backend, mut context) = headless_context(2);
        assert_eq!(context.worker_threads(), 2);
        context.begin_frame().unwrap();

        let upload = context.command_buffer(None).unwrap();
        assert_eq!(upload, context.upload_command_buffer());

        let second = context.command_buffer(Some(1)).unwrap();
        assert_eq!(context.command_buffer(Some(1)).unwrap(), second);
        assert_eq!(backend.command_buffer_thread(second), Some(Some(1)));

        context.end_encoding().unwrap();
        let commands = backend.commands(context.primary_command_buffer());
        assert_eq!(
            commands,
            vec![
                RecordedCommand::ExecuteCommands(vec![second]),
                RecordedCommand::EndRenderPass,
            ]
        );
    }

    #[test]
    fn test_unsupported_secondaries_encode_inline() {
        let backend = Arc::new(HeadlessBackend::new(Size::new(64, 64)).with_capabilities(
            maprender_rhi::BackendCapabilities {
                secondary_command_buffers: false,
                remediate_suboptimal_surface: false,
                debug_labels: true,
            },
        ));
        let scheduler: Arc<dyn Scheduler> =
            Arc::new(maprender_scheduler::ThreadedScheduler::new(2, "inline").unwrap());
        let mut context = Context::new(
            backend,
            Arc::new(TestShaders::new()),
            RendererConfig::default(),
            Some(scheduler),
        )
        .unwrap();
        assert_eq!(context.worker_threads(), 0);
        assert!(context.scheduler().is_none());
        context.begin_frame().unwrap();
        assert_eq!(
            context.command_buffer(Some(0)).unwrap(),
            context.primary_command_buffer()
        );
    }

    #[test]
    fn test_render_jobs_run_at_frame_start() {
        let (_backend, mut context) = headless_context(1);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        context.run_on_render_thread(Box::new(move || flag.store(true, Ordering::Release)));
        assert!(!ran.load(Ordering::Acquire));
        context.begin_frame().unwrap();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (backend, mut context) = headless_context(1);
        rotate_frames(&mut context, 2);
        drop(context);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.descriptor_pool_count(), 0);
        assert!(backend.idle_waits() >= 1);
    }

    #[test]
    fn test_context_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Context>();
    }
}
