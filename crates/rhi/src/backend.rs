//! The graphics backend interface.
//!
//! The frame pipeline, descriptor pools and encoders only talk to the GPU
//! through [`GraphicsBackend`]. Each supported API provides one
//! implementation; [`crate::headless::HeadlessBackend`] records commands
//! instead of executing them.

use std::time::Duration;

use crate::error::RhiResult;
use crate::handle::{
    BufferHandle, CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle, FenceHandle,
    PipelineHandle, SemaphoreHandle, TextureHandle,
};

/// Graphics API family of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Vulkan,
    Metal,
    OpenGL,
    Headless,
}

/// Optional behaviors that differ between backends and platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Secondary command buffers can be recorded on worker threads and
    /// executed inside a render pass.
    pub secondary_command_buffers: bool,
    /// A suboptimal swapchain is recreated instead of rendered to.
    pub remediate_suboptimal_surface: bool,
    /// Debug groups and markers reach the command stream.
    pub debug_labels: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            secondary_command_buffers: true,
            remediate_suboptimal_surface: cfg!(target_vendor = "apple"),
            debug_labels: true,
        }
    }
}

/// Binding category of a descriptor set.
///
/// Each category is bound at a fixed set index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorSetCategory {
    Global,
    Layer,
    DrawableUniform,
    DrawableImage,
}

impl DescriptorSetCategory {
    pub const COUNT: usize = 4;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Global,
        Self::Layer,
        Self::DrawableUniform,
        Self::DrawableImage,
    ];

    /// Descriptor set index this category is bound at.
    #[inline]
    pub const fn set_index(self) -> u32 {
        match self {
            Self::Global => 0,
            Self::Layer => 1,
            Self::DrawableUniform => 2,
            Self::DrawableImage => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Layer => "layer",
            Self::DrawableUniform => "drawable-uniform",
            Self::DrawableImage => "drawable-image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

/// How a command buffer is begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferUsage {
    OneTimeSubmit,
    /// Secondary buffer recorded entirely inside the current render pass.
    RenderPassContinue,
}

/// Where the commands of a render pass come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpassContents {
    Inline,
    SecondaryCommandBuffers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTarget {
    /// The currently acquired surface image.
    Surface,
    Offscreen(TextureHandle),
}

/// Clear operations issued when a render pass begins. `None` keeps the
/// previous contents.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearValues {
    pub color: Option<[f32; 4]>,
    pub depth: Option<f32>,
    pub stencil: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassBegin {
    pub target: RenderTarget,
    pub image_index: u32,
    pub clear: ClearValues,
    pub contents: SubpassContents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Uniform,
    Vertex,
    Index,
}

/// One uniform buffer binding inside a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub binding: u32,
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

/// Result of waiting on a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// Result of acquiring the next surface image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(u32),
    /// The image can be used, but the surface no longer matches exactly.
    Suboptimal(u32),
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Work handed to the graphics queue.
#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [CommandBufferHandle],
    pub wait: Option<SemaphoreHandle>,
    pub signal: Option<SemaphoreHandle>,
    pub fence: FenceHandle,
}

/// A GPU object whose release was deferred until the GPU no longer uses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuResource {
    Buffer(BufferHandle),
    Fence(FenceHandle),
    Semaphore(SemaphoreHandle),
    CommandBuffer {
        buffer: CommandBufferHandle,
        thread_index: Option<usize>,
    },
    DescriptorPool(DescriptorPoolHandle),
    Pipeline(PipelineHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Something frames are rendered into.
pub trait Renderable: Send + Sync {
    fn size(&self) -> Size;

    /// Blocks until the first frame target is ready.
    fn wait(&self) {}

    /// Whether the backing resource can be rendered to right now.
    fn is_available(&self) -> bool {
        true
    }
}

/// Builds shader programs by name.
pub trait ShaderRegistry: Send + Sync {
    /// Returns the program registered as `name`, or `None` when unknown.
    fn build_program(
        &self,
        name: &str,
        backend: &dyn GraphicsBackend,
    ) -> RhiResult<Option<PipelineHandle>>;
}

/// The interface every graphics API backend implements.
///
/// All methods take `&self`. Recording into a command buffer or descriptor
/// pool must only happen from the thread slot that owns it.
pub trait GraphicsBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities;

    /// The default render target.
    fn renderable(&self) -> &dyn Renderable;

    // ---------------------------------------------------------------------
    // Synchronization
    // ---------------------------------------------------------------------

    fn create_fence(&self, signaled: bool) -> RhiResult<FenceHandle>;

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> RhiResult<FenceStatus>;

    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()>;

    fn create_semaphore(&self) -> RhiResult<SemaphoreHandle>;

    // ---------------------------------------------------------------------
    // Command buffers
    // ---------------------------------------------------------------------

    /// Allocates a command buffer from the pool of `thread_index`
    /// (`None` for the render thread).
    fn allocate_command_buffer(
        &self,
        level: CommandBufferLevel,
        thread_index: Option<usize>,
    ) -> RhiResult<CommandBufferHandle>;

    fn begin_command_buffer(
        &self,
        buffer: CommandBufferHandle,
        usage: CommandBufferUsage,
    ) -> RhiResult<()>;

    fn end_command_buffer(&self, buffer: CommandBufferHandle) -> RhiResult<()>;

    fn reset_command_buffer(&self, buffer: CommandBufferHandle) -> RhiResult<()>;

    /// Executes secondary buffers inside `primary`, in slice order.
    fn execute_commands(&self, primary: CommandBufferHandle, secondaries: &[CommandBufferHandle]);

    fn begin_render_pass(
        &self,
        buffer: CommandBufferHandle,
        begin: &RenderPassBegin,
    ) -> RhiResult<()>;

    fn end_render_pass(&self, buffer: CommandBufferHandle);

    /// Clears the stencil aspect of the current render pass to `value`.
    fn clear_stencil(&self, buffer: CommandBufferHandle, value: u32);

    fn push_debug_group(&self, buffer: CommandBufferHandle, label: &str);

    fn pop_debug_group(&self, buffer: CommandBufferHandle);

    fn insert_debug_marker(&self, buffer: CommandBufferHandle, label: &str);

    fn bind_pipeline(&self, buffer: CommandBufferHandle, pipeline: PipelineHandle);

    fn set_stencil_reference(&self, buffer: CommandBufferHandle, reference: u32);

    fn push_constants(&self, buffer: CommandBufferHandle, pipeline: PipelineHandle, data: &[u8]);

    fn bind_vertex_buffer(&self, buffer: CommandBufferHandle, vertices: BufferHandle);

    fn bind_index_buffer(&self, buffer: CommandBufferHandle, indices: BufferHandle);

    fn draw_indexed(&self, buffer: CommandBufferHandle, index_count: u32, instance_count: u32);

    // ---------------------------------------------------------------------
    // Descriptors
    // ---------------------------------------------------------------------

    fn create_descriptor_pool(
        &self,
        category: DescriptorSetCategory,
        max_sets: u32,
        descriptors_per_set: u32,
    ) -> RhiResult<DescriptorPoolHandle>;

    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        category: DescriptorSetCategory,
        count: usize,
    ) -> RhiResult<Vec<DescriptorSetHandle>>;

    /// Points the bindings of `set` at the given buffers.
    fn write_uniform_descriptors(
        &self,
        set: DescriptorSetHandle,
        bindings: &[BufferBinding],
    ) -> RhiResult<()>;

    fn bind_descriptor_set(
        &self,
        buffer: CommandBufferHandle,
        category: DescriptorSetCategory,
        set: DescriptorSetHandle,
    );

    // ---------------------------------------------------------------------
    // Buffers
    // ---------------------------------------------------------------------

    fn create_buffer(&self, size: u64, usage: BufferUsage, name: &str) -> RhiResult<BufferHandle>;

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RhiResult<()>;

    // ---------------------------------------------------------------------
    // Frames
    // ---------------------------------------------------------------------

    /// Whether frames are presented to a swapchain surface.
    fn has_surface(&self) -> bool;

    fn acquire_next_image(
        &self,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> RhiResult<AcquireOutcome>;

    fn submit(&self, info: &SubmitInfo<'_>) -> RhiResult<()>;

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> RhiResult<PresentOutcome>;

    /// Rebuilds the swapchain after a resize or an out-of-date surface.
    fn recreate_surface(&self) -> RhiResult<()>;

    fn wait_idle(&self) -> RhiResult<()>;

    /// Destroys a resource. Only called once the GPU is done with it.
    fn release(&self, resource: GpuResource);
}
