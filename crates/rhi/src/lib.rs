//! Render hardware interface for the map rendering backend.
//!
//! The frame pipeline is written against [`GraphicsBackend`]. This crate
//! provides:
//! - The backend interface, handles and capability flags
//! - A Vulkan implementation over `ash` and gpu-allocator
//! - A headless implementation that records commands for inspection
//! - Reference-counted process-wide resources

mod error;

pub mod backend;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod handle;
pub mod headless;
pub mod process;
pub mod sync;
pub mod vulkan;

pub use backend::{
    AcquireOutcome, BackendCapabilities, BackendKind, BufferBinding, BufferUsage, ClearValues,
    CommandBufferLevel, CommandBufferUsage, DescriptorSetCategory, FenceStatus, GpuResource,
    GraphicsBackend, PresentOutcome, RenderPassBegin, RenderTarget, Renderable, ShaderRegistry,
    Size, SubmitInfo, SubpassContents,
};
pub use error::{RhiError, RhiResult};
pub use handle::{
    BufferHandle, CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle, FenceHandle,
    PipelineHandle, SemaphoreHandle, TextureHandle,
};
pub use headless::{HeadlessBackend, RecordedCommand, Submission};
pub use process::{ProcessGuard, ProcessResource};
pub use vulkan::{VulkanBackend, VulkanTarget};

// Re-export ash types that users might need
pub use ash::vk;
