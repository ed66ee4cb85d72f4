//! Renderer error types.

use thiserror::Error;

use maprender_rhi::RhiError;
use maprender_scheduler::SchedulerError;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Graphics backend error: {0}")]
    Rhi(#[from] RhiError),

    #[error("Configuration error: {0}")]
    Core(#[from] maprender_core::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// A render pass was requested while another one is still open.
    #[error("A render pass is already active")]
    RenderPassActive,

    /// A draw was issued with no render pass open.
    #[error("No render pass is active")]
    NoRenderPass,

    /// The render thread recorded into a pass whose contents come from
    /// worker secondary buffers.
    #[error("Render pass '{0}' records on worker buffers, a thread index is required")]
    ThreadIndexRequired(String),

    /// Uniform buffers cannot be empty.
    #[error("Uniform data is empty")]
    EmptyUniformData,

    /// A uniform update does not match the size of its buffer.
    #[error("Uniform update of {actual} bytes into a {expected} byte buffer")]
    UniformSizeMismatch { expected: u64, actual: u64 },

    /// The encoder of the frame was dropped while still in use.
    #[error("Frame encoder is no longer available")]
    EncoderReleased,

    /// The render target cannot be rendered to right now.
    #[error("Render target unavailable")]
    TargetUnavailable,

    /// A built-in shader program is missing from the registry.
    #[error("Shader program not found: {0}")]
    ProgramNotFound(String),
}

/// Result type alias for renderer operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;
