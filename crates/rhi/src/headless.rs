//! A backend that records commands instead of executing them.
//!
//! [`HeadlessBackend`] keeps every recorded command per command buffer and
//! splices executed secondary buffers into their primary at submit time,
//! so the final command order of a frame can be inspected. Failure
//! conditions (out-of-date surfaces, fence timeouts) can be injected.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::backend::{
    AcquireOutcome, BackendCapabilities, BackendKind, BufferBinding, BufferUsage, ClearValues,
    CommandBufferLevel, CommandBufferUsage, DescriptorSetCategory, FenceStatus, GpuResource,
    GraphicsBackend, PresentOutcome, RenderPassBegin, RenderTarget, Renderable, Size,
    SubmitInfo, SubpassContents,
};
use crate::error::{RhiError, RhiResult};
use crate::handle::{
    BufferHandle, CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle, FenceHandle,
    PipelineHandle, SemaphoreHandle,
};

/// A command captured by [`HeadlessBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        target: RenderTarget,
        clear: ClearValues,
        contents: SubpassContents,
    },
    EndRenderPass,
    ExecuteCommands(Vec<CommandBufferHandle>),
    ClearStencil(u32),
    PushDebugGroup(String),
    PopDebugGroup,
    DebugMarker(String),
    BindPipeline(PipelineHandle),
    SetStencilReference(u32),
    PushConstants {
        pipeline: PipelineHandle,
        data: Vec<u8>,
    },
    BindVertexBuffer(BufferHandle),
    BindIndexBuffer(BufferHandle),
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    BindDescriptorSet {
        set_index: u32,
        set: DescriptorSetHandle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
struct CommandBufferRecord {
    level: CommandBufferLevel,
    thread_index: Option<usize>,
    state: RecordingState,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug)]
struct PoolRecord {
    category: DescriptorSetCategory,
    max_sets: u32,
    allocated: u32,
}

/// A queue submission captured by [`HeadlessBackend`].
#[derive(Debug, Clone)]
pub struct Submission {
    pub command_buffers: Vec<CommandBufferHandle>,
    /// Commands of all submitted buffers with secondaries spliced in.
    pub commands: Vec<RecordedCommand>,
    pub wait: Option<SemaphoreHandle>,
    pub signal: Option<SemaphoreHandle>,
    pub fence: FenceHandle,
}

#[derive(Debug, Default)]
struct HeadlessState {
    next_handle: u64,
    fences: HashMap<FenceHandle, bool>,
    semaphores: Vec<SemaphoreHandle>,
    command_buffers: HashMap<CommandBufferHandle, CommandBufferRecord>,
    pools: HashMap<DescriptorPoolHandle, PoolRecord>,
    pool_order: Vec<DescriptorPoolHandle>,
    set_bindings: HashMap<DescriptorSetHandle, Vec<BufferBinding>>,
    descriptor_writes: usize,
    buffers: HashMap<BufferHandle, Vec<u8>>,
    submissions: Vec<Submission>,
    next_image: u32,
    acquire_overrides: VecDeque<AcquireOutcome>,
    present_overrides: VecDeque<PresentOutcome>,
    fence_timeouts: usize,
    fence_failures: usize,
    fence_waits: usize,
    presents: usize,
    surface_recreations: usize,
    idle_waits: usize,
    stray_commands: usize,
    released: Vec<GpuResource>,
}

impl HeadlessState {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn record(&mut self, buffer: CommandBufferHandle, command: RecordedCommand) {
        match self.command_buffers.get_mut(&buffer) {
            Some(record) if record.state == RecordingState::Recording => {
                record.commands.push(command);
            }
            _ => {
                warn!("Command {:?} recorded outside of recording state", command);
                self.stray_commands += 1;
            }
        }
    }

    fn flatten_into(&self, buffer: CommandBufferHandle, out: &mut Vec<RecordedCommand>) {
        let Some(record) = self.command_buffers.get(&buffer) else {
            return;
        };
        for command in &record.commands {
            match command {
                RecordedCommand::ExecuteCommands(secondaries) => {
                    for secondary in secondaries {
                        self.flatten_into(*secondary, out);
                    }
                }
                other => out.push(other.clone()),
            }
        }
    }
}

struct HeadlessRenderable {
    size: Size,
    available: AtomicBool,
}

impl Renderable for HeadlessRenderable {
    fn size(&self) -> Size {
        self.size
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

/// Recording implementation of [`GraphicsBackend`].
pub struct HeadlessBackend {
    capabilities: BackendCapabilities,
    renderable: HeadlessRenderable,
    image_count: u32,
    surface: bool,
    state: Mutex<HeadlessState>,
}

impl HeadlessBackend {
    pub fn new(size: Size) -> Self {
        Self {
            capabilities: BackendCapabilities {
                secondary_command_buffers: true,
                remediate_suboptimal_surface: false,
                debug_labels: true,
            },
            renderable: HeadlessRenderable {
                size,
                available: AtomicBool::new(true),
            },
            image_count: 3,
            surface: true,
            state: Mutex::new(HeadlessState::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_image_count(mut self, image_count: u32) -> Self {
        self.image_count = image_count.max(1);
        self
    }

    /// Renders offscreen: nothing is acquired or presented.
    pub fn without_surface(mut self) -> Self {
        self.surface = false;
        self
    }

    // ---------------------------------------------------------------------
    // Fault injection
    // ---------------------------------------------------------------------

    /// The next acquire returns `outcome` instead of the next image.
    pub fn push_acquire_outcome(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_overrides.push_back(outcome);
    }

    pub fn push_present_outcome(&self, outcome: PresentOutcome) {
        self.state.lock().present_overrides.push_back(outcome);
    }

    /// The next `count` fence waits time out.
    pub fn time_out_fence_waits(&self, count: usize) {
        self.state.lock().fence_timeouts += count;
    }

    /// The next `count` fence waits fail with a device error.
    pub fn fail_fence_waits(&self, count: usize) {
        self.state.lock().fence_failures += count;
    }

    pub fn set_available(&self, available: bool) {
        self.renderable.available.store(available, Ordering::Release);
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn last_submission(&self) -> Option<Submission> {
        self.state.lock().submissions.last().cloned()
    }

    /// Commands recorded into `buffer` since its last reset.
    pub fn commands(&self, buffer: CommandBufferHandle) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .command_buffers
            .get(&buffer)
            .map(|record| record.commands.clone())
            .unwrap_or_default()
    }

    /// Commands of `buffer` with executed secondaries spliced in.
    pub fn flattened_commands(&self, buffer: CommandBufferHandle) -> Vec<RecordedCommand> {
        let state = self.state.lock();
        let mut out = Vec::new();
        state.flatten_into(buffer, &mut out);
        out
    }

    /// Thread slot a command buffer was allocated for.
    pub fn command_buffer_thread(&self, buffer: CommandBufferHandle) -> Option<Option<usize>> {
        self.state
            .lock()
            .command_buffers
            .get(&buffer)
            .map(|record| record.thread_index)
    }

    /// Capacities of the descriptor pools of `category`, in creation order.
    pub fn descriptor_pool_capacities(&self, category: DescriptorSetCategory) -> Vec<u32> {
        let state = self.state.lock();
        state
            .pool_order
            .iter()
            .filter_map(|pool| state.pools.get(pool))
            .filter(|record| record.category == category)
            .map(|record| record.max_sets)
            .collect()
    }

    pub fn descriptor_pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// Number of `write_uniform_descriptors` calls.
    pub fn descriptor_writes(&self) -> usize {
        self.state.lock().descriptor_writes
    }

    pub fn descriptor_bindings(&self, set: DescriptorSetHandle) -> Vec<BufferBinding> {
        self.state
            .lock()
            .set_bindings
            .get(&set)
            .cloned()
            .unwrap_or_default()
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn released(&self) -> Vec<GpuResource> {
        self.state.lock().released.clone()
    }

    pub fn fence_waits(&self) -> usize {
        self.state.lock().fence_waits
    }

    pub fn presents(&self) -> usize {
        self.state.lock().presents
    }

    pub fn surface_recreations(&self) -> usize {
        self.state.lock().surface_recreations
    }

    pub fn idle_waits(&self) -> usize {
        self.state.lock().idle_waits
    }

    /// Commands issued to a buffer that was not recording.
    pub fn stray_commands(&self) -> usize {
        self.state.lock().stray_commands
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn renderable(&self) -> &dyn Renderable {
        &self.renderable
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<FenceHandle> {
        let mut state = self.state.lock();
        let fence = FenceHandle::from_raw(state.next_raw());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: FenceHandle, _timeout: Duration) -> RhiResult<FenceStatus> {
        let mut state = self.state.lock();
        state.fence_waits += 1;
        if state.fence_failures > 0 {
            state.fence_failures -= 1;
            return Err(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST));
        }
        if state.fence_timeouts > 0 {
            state.fence_timeouts -= 1;
            return Ok(FenceStatus::TimedOut);
        }
        match state.fences.get(&fence) {
            Some(true) => Ok(FenceStatus::Signaled),
            Some(false) => Ok(FenceStatus::TimedOut),
            None => Err(RhiError::InvalidHandle(format!("fence {:?}", fence))),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        let mut state = self.state.lock();
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(RhiError::InvalidHandle(format!("fence {:?}", fence))),
        }
    }

    fn create_semaphore(&self) -> RhiResult<SemaphoreHandle> {
        let mut state = self.state.lock();
        let semaphore = SemaphoreHandle::from_raw(state.next_raw());
        state.semaphores.push(semaphore);
        Ok(semaphore)
    }

    fn allocate_command_buffer(
        &self,
        level: CommandBufferLevel,
        thread_index: Option<usize>,
    ) -> RhiResult<CommandBufferHandle> {
        if level == CommandBufferLevel::Secondary && !self.capabilities.secondary_command_buffers {
            return Err(RhiError::Unsupported {
                backend: BackendKind::Headless,
                operation: "secondary command buffers",
            });
        }
        let mut state = self.state.lock();
        let buffer = CommandBufferHandle::from_raw(state.next_raw());
        state.command_buffers.insert(
            buffer,
            CommandBufferRecord {
                level,
                thread_index,
                state: RecordingState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(buffer)
    }

    fn begin_command_buffer(
        &self,
        buffer: CommandBufferHandle,
        usage: CommandBufferUsage,
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        let record = state
            .command_buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("command buffer {:?}", buffer)))?;
        if record.state == RecordingState::Recording {
            return Err(RhiError::CommandBufferState(format!(
                "{:?} is already recording",
                buffer
            )));
        }
        if usage == CommandBufferUsage::RenderPassContinue
            && record.level != CommandBufferLevel::Secondary
        {
            return Err(RhiError::CommandBufferState(
                "render pass continuation requires a secondary buffer".into(),
            ));
        }
        record.state = RecordingState::Recording;
        record.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, buffer: CommandBufferHandle) -> RhiResult<()> {
        let mut state = self.state.lock();
        let record = state
            .command_buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("command buffer {:?}", buffer)))?;
        if record.state != RecordingState::Recording {
            return Err(RhiError::CommandBufferState(format!(
                "{:?} is not recording",
                buffer
            )));
        }
        record.state = RecordingState::Executable;
        Ok(())
    }

    fn reset_command_buffer(&self, buffer: CommandBufferHandle) -> RhiResult<()> {
        let mut state = self.state.lock();
        let record = state
            .command_buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("command buffer {:?}", buffer)))?;
        record.state = RecordingState::Initial;
        record.commands.clear();
        Ok(())
    }

    fn execute_commands(&self, primary: CommandBufferHandle, secondaries: &[CommandBufferHandle]) {
        self.state
            .lock()
            .record(primary, RecordedCommand::ExecuteCommands(secondaries.to_vec()));
    }

    fn begin_render_pass(
        &self,
        buffer: CommandBufferHandle,
        begin: &RenderPassBegin,
    ) -> RhiResult<()> {
        if !self.renderable.is_available() {
            return Err(RhiError::SurfaceLost("headless target unavailable".into()));
        }
        self.state.lock().record(
            buffer,
            RecordedCommand::BeginRenderPass {
                target: begin.target,
                clear: begin.clear,
                contents: begin.contents,
            },
        );
        Ok(())
    }

    fn end_render_pass(&self, buffer: CommandBufferHandle) {
        self.state.lock().record(buffer, RecordedCommand::EndRenderPass);
    }

    fn clear_stencil(&self, buffer: CommandBufferHandle, value: u32) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::ClearStencil(value));
    }

    fn push_debug_group(&self, buffer: CommandBufferHandle, label: &str) {
        if self.capabilities.debug_labels {
            self.state
                .lock()
                .record(buffer, RecordedCommand::PushDebugGroup(label.to_string()));
        }
    }

    fn pop_debug_group(&self, buffer: CommandBufferHandle) {
        if self.capabilities.debug_labels {
            self.state.lock().record(buffer, RecordedCommand::PopDebugGroup);
        }
    }

    fn insert_debug_marker(&self, buffer: CommandBufferHandle, label: &str) {
        if self.capabilities.debug_labels {
            self.state
                .lock()
                .record(buffer, RecordedCommand::DebugMarker(label.to_string()));
        }
    }

    fn bind_pipeline(&self, buffer: CommandBufferHandle, pipeline: PipelineHandle) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::BindPipeline(pipeline));
    }

    fn set_stencil_reference(&self, buffer: CommandBufferHandle, reference: u32) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::SetStencilReference(reference));
    }

    fn push_constants(&self, buffer: CommandBufferHandle, pipeline: PipelineHandle, data: &[u8]) {
        self.state.lock().record(
            buffer,
            RecordedCommand::PushConstants {
                pipeline,
                data: data.to_vec(),
            },
        );
    }

    fn bind_vertex_buffer(&self, buffer: CommandBufferHandle, vertices: BufferHandle) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::BindVertexBuffer(vertices));
    }

    fn bind_index_buffer(&self, buffer: CommandBufferHandle, indices: BufferHandle) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::BindIndexBuffer(indices));
    }

    fn draw_indexed(&self, buffer: CommandBufferHandle, index_count: u32, instance_count: u32) {
        self.state.lock().record(
            buffer,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn create_descriptor_pool(
        &self,
        category: DescriptorSetCategory,
        max_sets: u32,
        descriptors_per_set: u32,
    ) -> RhiResult<DescriptorPoolHandle> {
        let mut state = self.state.lock();
        let pool = DescriptorPoolHandle::from_raw(state.next_raw());
        state.pools.insert(
            pool,
            PoolRecord {
                category,
                max_sets,
                allocated: 0,
            },
        );
        state.pool_order.push(pool);
        debug!(
            "Created headless {} descriptor pool: max_sets={}, descriptors_per_set={}",
            category.name(),
            max_sets,
            descriptors_per_set
        );
        Ok(pool)
    }

    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        category: DescriptorSetCategory,
        count: usize,
    ) -> RhiResult<Vec<DescriptorSetHandle>> {
        let mut state = self.state.lock();
        let record = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("descriptor pool {:?}", pool)))?;
        if record.category != category {
            return Err(RhiError::InvalidHandle(format!(
                "{:?} holds {} sets, not {}",
                pool,
                record.category.name(),
                category.name()
            )));
        }
        let count = count as u32;
        if record.allocated + count > record.max_sets {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        record.allocated += count;
        Ok((0..count)
            .map(|_| DescriptorSetHandle::from_raw(state.next_raw()))
            .collect())
    }

    fn write_uniform_descriptors(
        &self,
        set: DescriptorSetHandle,
        bindings: &[BufferBinding],
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        for binding in bindings {
            if !state.buffers.contains_key(&binding.buffer) {
                return Err(RhiError::InvalidHandle(format!(
                    "buffer {:?} at binding {}",
                    binding.buffer, binding.binding
                )));
            }
        }
        state.descriptor_writes += 1;
        state.set_bindings.insert(set, bindings.to_vec());
        Ok(())
    }

    fn bind_descriptor_set(
        &self,
        buffer: CommandBufferHandle,
        category: DescriptorSetCategory,
        set: DescriptorSetHandle,
    ) {
        self.state.lock().record(
            buffer,
            RecordedCommand::BindDescriptorSet {
                set_index: category.set_index(),
                set,
            },
        );
    }

    fn create_buffer(&self, size: u64, _usage: BufferUsage, name: &str) -> RhiResult<BufferHandle> {
        let mut state = self.state.lock();
        let buffer = BufferHandle::from_raw(state.next_raw());
        state.buffers.insert(buffer, vec![0; size as usize]);
        trace!("Created headless buffer '{}' ({} bytes)", name, size);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state.lock();
        let contents = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {:?}", buffer)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(RhiError::InvalidHandle(format!(
                "write of {} bytes at {} exceeds buffer size {}",
                data.len(),
                offset,
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn has_surface(&self) -> bool {
        self.surface
    }

    fn acquire_next_image(
        &self,
        _signal: SemaphoreHandle,
        _timeout: Duration,
    ) -> RhiResult<AcquireOutcome> {
        if !self.surface {
            return Err(RhiError::Unsupported {
                backend: BackendKind::Headless,
                operation: "acquire without a surface",
            });
        }
        let mut state = self.state.lock();
        if let Some(outcome) = state.acquire_overrides.pop_front() {
            return Ok(outcome);
        }
        let image = state.next_image;
        state.next_image = (image + 1) % self.image_count;
        Ok(AcquireOutcome::Acquired(image))
    }

    fn submit(&self, info: &SubmitInfo<'_>) -> RhiResult<()> {
        let mut state = self.state.lock();
        for buffer in info.command_buffers {
            match state.command_buffers.get(buffer) {
                Some(record) if record.state == RecordingState::Executable => {}
                Some(_) => {
                    return Err(RhiError::CommandBufferState(format!(
                        "{:?} submitted before it was ended",
                        buffer
                    )));
                }
                None => {
                    return Err(RhiError::InvalidHandle(format!(
                        "command buffer {:?}",
                        buffer
                    )));
                }
            }
        }

        let mut commands = Vec::new();
        for buffer in info.command_buffers {
            state.flatten_into(*buffer, &mut commands);
        }
        state.submissions.push(Submission {
            command_buffers: info.command_buffers.to_vec(),
            commands,
            wait: info.wait,
            signal: info.signal,
            fence: info.fence,
        });

        // Work completes immediately.
        if let Some(signaled) = state.fences.get_mut(&info.fence) {
            *signaled = true;
        }
        Ok(())
    }

    fn present(&self, _image_index: u32, _wait: SemaphoreHandle) -> RhiResult<PresentOutcome> {
        let mut state = self.state.lock();
        state.presents += 1;
        Ok(state
            .present_overrides
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn recreate_surface(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.surface_recreations += 1;
        state.next_image = 0;
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.state.lock().idle_waits += 1;
        Ok(())
    }

    fn release(&self, resource: GpuResource) {
        let mut state = self.state.lock();
        match &resource {
            GpuResource::Buffer(buffer) => {
                state.buffers.remove(buffer);
            }
            GpuResource::Fence(fence) => {
                state.fences.remove(fence);
            }
            GpuResource::Semaphore(semaphore) => {
                state.semaphores.retain(|s| s != semaphore);
            }
            GpuResource::CommandBuffer { buffer, .. } => {
                state.command_buffers.remove(buffer);
            }
            GpuResource::DescriptorPool(pool) => {
                state.pools.remove(pool);
                state.pool_order.retain(|p| p != pool);
            }
            GpuResource::Pipeline(_) => {}
        }
        state.released.push(resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HeadlessBackend {
        HeadlessBackend::new(Size::new(512, 512))
    }

    #[test]
    fn test_secondary_commands_spliced_in_order() {
        let backend = backend();
        let primary = backend
            .allocate_command_buffer(CommandBufferLevel::Primary, None)
            .unwrap();
        let first = backend
            .allocate_command_buffer(CommandBufferLevel::Secondary, Some(0))
            .unwrap();
        let second = backend
            .allocate_command_buffer(CommandBufferLevel::Secondary, Some(1))
            .unwrap();

        backend
            .begin_command_buffer(primary, CommandBufferUsage::OneTimeSubmit)
            .unwrap();
        for (buffer, marker) in [(second, "b"), (first, "a")] {
            backend
                .begin_command_buffer(buffer, CommandBufferUsage::RenderPassContinue)
                .unwrap();
            backend.insert_debug_marker(buffer, marker);
            backend.end_command_buffer(buffer).unwrap();
        }
        backend.execute_commands(primary, &[first, second]);
        backend.end_command_buffer(primary).unwrap();

        assert_eq!(
            backend.flattened_commands(primary),
            vec![
                RecordedCommand::DebugMarker("a".into()),
                RecordedCommand::DebugMarker("b".into()),
            ]
        );
    }

    #[test]
    fn test_commands_outside_recording_are_counted() {
        let backend = backend();
        let buffer = backend
            .allocate_command_buffer(CommandBufferLevel::Primary, None)
            .unwrap();
        backend.draw_indexed(buffer, 6, 1);
        assert_eq!(backend.stray_commands(), 1);
        assert!(backend.commands(buffer).is_empty());
    }

    #[test]
    fn test_render_pass_continue_requires_secondary() {
        let backend = backend();
        let primary = backend
            .allocate_command_buffer(CommandBufferLevel::Primary, None)
            .unwrap();
        let result = backend.begin_command_buffer(primary, CommandBufferUsage::RenderPassContinue);
        assert!(matches!(result, Err(RhiError::CommandBufferState(_))));
    }

    #[test]
    fn test_descriptor_pool_capacity_enforced() {
        let backend = backend();
        let pool = backend
            .create_descriptor_pool(DescriptorSetCategory::Layer, 4, 2)
            .unwrap();
        let sets = backend
            .allocate_descriptor_sets(pool, DescriptorSetCategory::Layer, 3)
            .unwrap();
        assert_eq!(sets.len(), 3);
        assert!(
            backend
                .allocate_descriptor_sets(pool, DescriptorSetCategory::Layer, 2)
                .is_err()
        );
    }

    #[test]
    fn test_submit_signals_fence() {
        let backend = backend();
        let fence = backend.create_fence(false).unwrap();
        let buffer = backend
            .allocate_command_buffer(CommandBufferLevel::Primary, None)
            .unwrap();
        backend
            .begin_command_buffer(buffer, CommandBufferUsage::OneTimeSubmit)
            .unwrap();
        backend.end_command_buffer(buffer).unwrap();

        assert_eq!(
            backend.wait_for_fence(fence, Duration::ZERO).unwrap(),
            FenceStatus::TimedOut
        );
        backend
            .submit(&SubmitInfo {
                command_buffers: &[buffer],
                wait: None,
                signal: None,
                fence,
            })
            .unwrap();
        assert_eq!(
            backend.wait_for_fence(fence, Duration::ZERO).unwrap(),
            FenceStatus::Signaled
        );
    }

    #[test]
    fn test_acquire_overrides_and_image_rotation() {
        let backend = backend().with_image_count(2);
        let semaphore = backend.create_semaphore().unwrap();
        backend.push_acquire_outcome(AcquireOutcome::OutOfDate);

        let timeout = Duration::from_secs(1);
        assert_eq!(
            backend.acquire_next_image(semaphore, timeout).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert_eq!(
            backend.acquire_next_image(semaphore, timeout).unwrap(),
            AcquireOutcome::Acquired(0)
        );
        assert_eq!(
            backend.acquire_next_image(semaphore, timeout).unwrap(),
            AcquireOutcome::Acquired(1)
        );
        assert_eq!(
            backend.acquire_next_image(semaphore, timeout).unwrap(),
            AcquireOutcome::Acquired(0)
        );
    }

    #[test]
    fn test_headless_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HeadlessBackend>();
    }
}
