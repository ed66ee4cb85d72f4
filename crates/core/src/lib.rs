//! Core utilities shared by the map rendering backend.
//!
//! This crate provides foundational types used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Renderer configuration
//! - Rendering statistics

mod config;
mod error;
mod logging;
mod stats;
mod timer;

pub use config::{DescriptorPoolSizes, RendererConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use stats::{RenderingStats, StatsSnapshot};
pub use timer::FrameTimer;
