//! [`GraphicsBackend`] implementation on top of `ash`.
//!
//! Backend handles carry the raw Vulkan handle, so recording never needs a
//! lookup. Objects created by the backend are owned by per-kind maps and
//! destroyed when released or when the backend is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{
    AcquireOutcome, BackendCapabilities, BackendKind, BufferBinding, BufferUsage,
    CommandBufferLevel, CommandBufferUsage, DescriptorSetCategory, FenceStatus, GpuResource,
    GraphicsBackend, PresentOutcome, RenderPassBegin, RenderTarget, Renderable, Size,
    SubmitInfo,
};
use crate::buffer::Buffer;
use crate::command::{CommandBuffer, CommandPool};
use crate::descriptor::{self, DescriptorPool, DescriptorSetLayout, PipelineLayout};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::handle::{
    BufferHandle, CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle, FenceHandle,
    PipelineHandle, SemaphoreHandle,
};
use crate::sync::{Fence, Semaphore};

/// The framebuffers a [`VulkanBackend`] renders into.
///
/// Implemented by the host, which owns the surface and swapchain.
pub trait VulkanTarget: Send + Sync {
    /// Render pass compatible with every framebuffer of the target.
    fn render_pass(&self) -> vk::RenderPass;

    fn framebuffer(&self, image_index: u32) -> vk::Framebuffer;

    fn extent(&self) -> vk::Extent2D;

    /// The swapchain to acquire from and present to, `None` when offscreen.
    fn swapchain(&self) -> Option<vk::SwapchainKHR>;

    /// Rebuilds the swapchain and framebuffers. The device is idle.
    fn recreate(&self) -> RhiResult<()>;

    fn is_available(&self) -> bool {
        true
    }
}

struct TargetRenderable(Arc<dyn VulkanTarget>);

impl Renderable for TargetRenderable {
    fn size(&self) -> Size {
        let extent = self.0.extent();
        Size::new(extent.width, extent.height)
    }

    fn is_available(&self) -> bool {
        self.0.is_available()
    }
}

fn map_fence(handle: FenceHandle) -> vk::Fence {
    vk::Fence::from_raw(handle.raw())
}

fn map_semaphore(handle: SemaphoreHandle) -> vk::Semaphore {
    vk::Semaphore::from_raw(handle.raw())
}

fn map_command_buffer(handle: CommandBufferHandle) -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(handle.raw())
}

fn map_buffer(handle: BufferHandle) -> vk::Buffer {
    vk::Buffer::from_raw(handle.raw())
}

/// Vulkan implementation of [`GraphicsBackend`].
pub struct VulkanBackend {
    target: Arc<dyn VulkanTarget>,
    renderable: TargetRenderable,
    capabilities: BackendCapabilities,
    /// Slot 0 belongs to the render thread, slot `i + 1` to worker `i`.
    command_pools: Vec<Mutex<CommandPool>>,
    set_layouts: Vec<DescriptorSetLayout>,
    pipeline_layout: PipelineLayout,
    current_image: AtomicU32,
    fences: Mutex<HashMap<FenceHandle, Fence>>,
    semaphores: Mutex<HashMap<SemaphoreHandle, Semaphore>>,
    descriptor_pools: Mutex<HashMap<DescriptorPoolHandle, DescriptorPool>>,
    buffers: Mutex<HashMap<BufferHandle, Buffer>>,
    pipelines: Mutex<HashMap<PipelineHandle, vk::Pipeline>>,
    device: Arc<Device>,
}

impl VulkanBackend {
    /// Creates the backend for `worker_threads` encoding threads.
    ///
    /// `descriptors_per_set` is indexed by [`DescriptorSetCategory::set_index`].
    ///
    /// # Errors
    ///
    /// Returns an error if a command pool or layout cannot be created.
    pub fn new(
        device: Arc<Device>,
        target: Arc<dyn VulkanTarget>,
        worker_threads: usize,
        descriptors_per_set: [u32; DescriptorSetCategory::COUNT],
    ) -> RhiResult<Self> {
        let command_pools = (0..=worker_threads)
            .map(|_| CommandPool::new(Arc::clone(&device)).map(Mutex::new))
            .collect::<RhiResult<Vec<_>>>()?;

        let set_layouts = DescriptorSetCategory::ALL
            .iter()
            .map(|&category| {
                DescriptorSetLayout::for_category(
                    Arc::clone(&device),
                    category,
                    descriptors_per_set[category.set_index() as usize],
                )
            })
            .collect::<RhiResult<Vec<_>>>()?;
        let raw_layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(DescriptorSetLayout::handle).collect();
        let pipeline_layout = PipelineLayout::new(Arc::clone(&device), &raw_layouts)?;

        let capabilities = BackendCapabilities {
            debug_labels: device.debug_utils().is_some(),
            ..BackendCapabilities::default()
        };

        info!(
            "Vulkan backend created with {} command pool(s)",
            command_pools.len()
        );

        Ok(Self {
            renderable: TargetRenderable(Arc::clone(&target)),
            target,
            capabilities,
            command_pools,
            set_layouts,
            pipeline_layout,
            current_image: AtomicU32::new(0),
            fences: Mutex::new(HashMap::new()),
            semaphores: Mutex::new(HashMap::new()),
            descriptor_pools: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            device,
        })
    }

    /// Overrides the default capabilities, e.g. to remediate suboptimal
    /// swapchains on platforms that need it.
    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Layout every pipeline registered with the backend must use.
    #[inline]
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout.handle()
    }

    /// Takes ownership of a host-built pipeline.
    pub fn register_pipeline(&self, pipeline: vk::Pipeline) -> PipelineHandle {
        let handle = PipelineHandle::from_raw(pipeline.as_raw());
        self.pipelines.lock().insert(handle, pipeline);
        handle
    }

    fn recorder(&self, buffer: CommandBufferHandle) -> CommandBuffer<'_> {
        CommandBuffer::from_handle(&self.device, map_command_buffer(buffer))
    }

    fn command_pool(&self, thread_index: Option<usize>) -> RhiResult<&Mutex<CommandPool>> {
        let slot = thread_index.map_or(0, |index| index + 1);
        self.command_pools.get(slot).ok_or_else(|| {
            RhiError::InvalidHandle(format!("no command pool for thread slot {}", slot))
        })
    }
}

impl GraphicsBackend for VulkanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn renderable(&self) -> &dyn Renderable {
        &self.renderable
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<FenceHandle> {
        let fence = Fence::new(Arc::clone(&self.device), signaled)?;
        let handle = FenceHandle::from_raw(fence.handle().as_raw());
        self.fences.lock().insert(handle, fence);
        Ok(handle)
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> RhiResult<FenceStatus> {
        let fences = [map_fence(fence)];
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.handle().wait_for_fences(&fences, true, nanos) } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::TimedOut),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        unsafe { self.device.handle().reset_fences(&[map_fence(fence)])? };
        Ok(())
    }

    fn create_semaphore(&self) -> RhiResult<SemaphoreHandle> {
        let semaphore = Semaphore::new(Arc::clone(&self.device))?;
        let handle = SemaphoreHandle::from_raw(semaphore.handle().as_raw());
        self.semaphores.lock().insert(handle, semaphore);
        Ok(handle)
    }

    fn allocate_command_buffer(
        &self,
        level: CommandBufferLevel,
        thread_index: Option<usize>,
    ) -> RhiResult<CommandBufferHandle> {
        let buffer = self.command_pool(thread_index)?.lock().allocate(level)?;
        Ok(CommandBufferHandle::from_raw(buffer.as_raw()))
    }

    fn begin_command_buffer(
        &self,
        buffer: CommandBufferHandle,
        usage: CommandBufferUsage,
    ) -> RhiResult<()> {
        let recorder = self.recorder(buffer);
        match usage {
            CommandBufferUsage::OneTimeSubmit => recorder.begin(),
            CommandBufferUsage::RenderPassContinue => {
                let image = self.current_image.load(Ordering::Acquire);
                recorder.begin_render_pass_continue(
                    self.target.render_pass(),
                    self.target.framebuffer(image),
                )
            }
        }
    }

    fn end_command_buffer(&self, buffer: CommandBufferHandle) -> RhiResult<()> {
        self.recorder(buffer).end()
    }

    fn reset_command_buffer(&self, buffer: CommandBufferHandle) -> RhiResult<()> {
        self.recorder(buffer).reset()
    }

    fn execute_commands(&self, primary: CommandBufferHandle, secondaries: &[CommandBufferHandle]) {
        let raw: Vec<vk::CommandBuffer> = secondaries.iter().copied().map(map_command_buffer).collect();
        self.recorder(primary).execute_commands(&raw);
    }

    fn begin_render_pass(
        &self,
        buffer: CommandBufferHandle,
        begin: &RenderPassBegin,
    ) -> RhiResult<()> {
        if let RenderTarget::Offscreen(_) = begin.target {
            return Err(RhiError::Unsupported {
                backend: BackendKind::Vulkan,
                operation: "offscreen render target",
            });
        }
        if !self.target.is_available() {
            return Err(RhiError::SurfaceLost("render target unavailable".into()));
        }

        self.current_image.store(begin.image_index, Ordering::Release);

        let color = begin.clear.color.unwrap_or([0.0; 4]);
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: begin.clear.depth.unwrap_or(1.0),
                    stencil: begin.clear.stencil.unwrap_or(0),
                },
            },
        ];

        self.recorder(buffer).begin_render_pass(
            self.target.render_pass(),
            self.target.framebuffer(begin.image_index),
            self.target.extent(),
            &clear_values,
            begin.contents,
        );
        Ok(())
    }

    fn end_render_pass(&self, buffer: CommandBufferHandle) {
        self.recorder(buffer).end_render_pass();
    }

    fn clear_stencil(&self, buffer: CommandBufferHandle, value: u32) {
        self.recorder(buffer)
            .clear_stencil(self.target.extent(), value);
    }

    fn push_debug_group(&self, buffer: CommandBufferHandle, label: &str) {
        self.recorder(buffer).push_debug_group(label);
    }

    fn pop_debug_group(&self, buffer: CommandBufferHandle) {
        self.recorder(buffer).pop_debug_group();
    }

    fn insert_debug_marker(&self, buffer: CommandBufferHandle, label: &str) {
        self.recorder(buffer).insert_debug_marker(label);
    }

    fn bind_pipeline(&self, buffer: CommandBufferHandle, pipeline: PipelineHandle) {
        self.recorder(buffer)
            .bind_pipeline(vk::Pipeline::from_raw(pipeline.raw()));
    }

    fn set_stencil_reference(&self, buffer: CommandBufferHandle, reference: u32) {
        self.recorder(buffer).set_stencil_reference(reference);
    }

    fn push_constants(&self, buffer: CommandBufferHandle, _pipeline: PipelineHandle, data: &[u8]) {
        self.recorder(buffer)
            .push_constants(self.pipeline_layout.handle(), data);
    }

    fn bind_vertex_buffer(&self, buffer: CommandBufferHandle, vertices: BufferHandle) {
        self.recorder(buffer).bind_vertex_buffer(map_buffer(vertices));
    }

    fn bind_index_buffer(&self, buffer: CommandBufferHandle, indices: BufferHandle) {
        self.recorder(buffer).bind_index_buffer(map_buffer(indices));
    }

    fn draw_indexed(&self, buffer: CommandBufferHandle, index_count: u32, instance_count: u32) {
        self.recorder(buffer)
            .draw_indexed(index_count, instance_count);
    }

    fn create_descriptor_pool(
        &self,
        category: DescriptorSetCategory,
        max_sets: u32,
        descriptors_per_set: u32,
    ) -> RhiResult<DescriptorPoolHandle> {
        let pool = DescriptorPool::new(
            Arc::clone(&self.device),
            category,
            max_sets,
            descriptors_per_set,
        )?;
        let handle = DescriptorPoolHandle::from_raw(pool.handle().as_raw());
        self.descriptor_pools.lock().insert(handle, pool);
        Ok(handle)
    }

    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        category: DescriptorSetCategory,
        count: usize,
    ) -> RhiResult<Vec<DescriptorSetHandle>> {
        let layout = self.set_layouts[category.set_index() as usize].handle();
        let pools = self.descriptor_pools.lock();
        let pool = pools
            .get(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("descriptor pool {:?}", pool)))?;
        let sets = pool.allocate(layout, count)?;
        Ok(sets
            .into_iter()
            .map(|set| DescriptorSetHandle::from_raw(set.as_raw()))
            .collect())
    }

    fn write_uniform_descriptors(
        &self,
        set: DescriptorSetHandle,
        bindings: &[BufferBinding],
    ) -> RhiResult<()> {
        let writes: Vec<_> = bindings
            .iter()
            .map(|binding| {
                (
                    binding.binding,
                    map_buffer(binding.buffer),
                    binding.offset,
                    binding.size,
                )
            })
            .collect();
        descriptor::write_uniform_buffers(
            &self.device,
            vk::DescriptorSet::from_raw(set.raw()),
            &writes,
        );
        Ok(())
    }

    fn bind_descriptor_set(
        &self,
        buffer: CommandBufferHandle,
        category: DescriptorSetCategory,
        set: DescriptorSetHandle,
    ) {
        self.recorder(buffer).bind_descriptor_set(
            self.pipeline_layout.handle(),
            category.set_index(),
            vk::DescriptorSet::from_raw(set.raw()),
        );
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage, name: &str) -> RhiResult<BufferHandle> {
        let buffer = Buffer::new(Arc::clone(&self.device), usage, size, name)?;
        let handle = BufferHandle::from_raw(buffer.handle().as_raw());
        self.buffers.lock().insert(handle, buffer);
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RhiResult<()> {
        let buffers = self.buffers.lock();
        buffers
            .get(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {:?}", buffer)))?
            .write_data(offset, data)
    }

    fn has_surface(&self) -> bool {
        self.target.swapchain().is_some()
    }

    fn acquire_next_image(
        &self,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> RhiResult<AcquireOutcome> {
        let swapchain = self.target.swapchain().ok_or(RhiError::Unsupported {
            backend: BackendKind::Vulkan,
            operation: "acquire without a swapchain",
        })?;
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let result = unsafe {
            self.device.swapchain_loader().acquire_next_image(
                swapchain,
                nanos,
                map_semaphore(signal),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, false)) => Ok(AcquireOutcome::Acquired(index)),
            Ok((index, true)) => Ok(AcquireOutcome::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                Err(RhiError::SurfaceLost("acquire reported surface lost".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn submit(&self, info: &SubmitInfo<'_>) -> RhiResult<()> {
        let command_buffers: Vec<vk::CommandBuffer> = info
            .command_buffers
            .iter()
            .copied()
            .map(map_command_buffer)
            .collect();
        let waits: Vec<vk::Semaphore> = info.wait.into_iter().map(map_semaphore).collect();
        let stages: Vec<vk::PipelineStageFlags> = waits
            .iter()
            .map(|_| vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .collect();
        let signals: Vec<vk::Semaphore> = info.signal.into_iter().map(map_semaphore).collect();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signals);

        unsafe {
            self.device
                .submit_graphics(&[submit_info], map_fence(info.fence))
        }
    }

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> RhiResult<PresentOutcome> {
        let swapchain = self.target.swapchain().ok_or(RhiError::Unsupported {
            backend: BackendKind::Vulkan,
            operation: "present without a swapchain",
        })?;
        match unsafe {
            self.device
                .present(swapchain, image_index, map_semaphore(wait))
        } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn recreate_surface(&self) -> RhiResult<()> {
        self.device.wait_idle()?;
        self.target.recreate()?;
        self.current_image.store(0, Ordering::Release);
        debug!("Render target recreated");
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }

    fn release(&self, resource: GpuResource) {
        match resource {
            GpuResource::Buffer(buffer) => {
                self.buffers.lock().remove(&buffer);
            }
            GpuResource::Fence(fence) => {
                self.fences.lock().remove(&fence);
            }
            GpuResource::Semaphore(semaphore) => {
                self.semaphores.lock().remove(&semaphore);
            }
            GpuResource::CommandBuffer {
                buffer,
                thread_index,
            } => match self.command_pool(thread_index) {
                Ok(pool) => pool.lock().free(map_command_buffer(buffer)),
                Err(e) => warn!("Leaking command buffer {:?}: {}", buffer, e),
            },
            GpuResource::DescriptorPool(pool) => {
                self.descriptor_pools.lock().remove(&pool);
            }
            GpuResource::Pipeline(pipeline) => {
                if let Some(raw) = self.pipelines.lock().remove(&pipeline) {
                    unsafe { self.device.handle().destroy_pipeline(raw, None) };
                }
            }
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("Failed to wait for device idle: {}", e);
        }
        for (_, pipeline) in self.pipelines.lock().drain() {
            unsafe { self.device.handle().destroy_pipeline(pipeline, None) };
        }
        debug!("Vulkan backend destroyed");
    }
}
