//! Multi-threaded frame rendering for the map renderer.
//!
//! This crate drives the frame pipeline on top of a [`GraphicsBackend`]:
//! - Frame resource ring with deferred releases
//! - Growable descriptor pools and lazily allocated descriptor sets
//! - Command encoding with per-thread secondary command buffers
//! - Layer groups distributed across encoding threads in layer order
//! - Incremental stencil clipping of tiles
//!
//! [`GraphicsBackend`]: maprender_rhi::GraphicsBackend

pub mod command_encoder;
pub mod context;
pub mod descriptor_pool;
pub mod descriptor_set;
pub mod error;
pub mod frame_resources;
pub mod layer_group;
pub mod orchestrator;
pub mod paint_parameters;
pub mod render_tree;
pub mod renderer;
pub mod tile;
pub mod ubo;
pub mod uniform_buffer;

pub use command_encoder::{CommandEncoder, DebugGroup, RenderPass, RenderPassDescriptor, UploadPass};
pub use context::{Context, FrameStatus};
pub use error::{RenderError, RenderResult};
pub use layer_group::{LayerGroup, LayerTweaker, LayerUniforms, TileDrawable, TileLayerGroup};
pub use orchestrator::{LayerGroupMap, partition_range};
pub use paint_parameters::{PaintParameters, RenderPassKind, TransformState};
pub use render_tree::{RenderItem, RenderTree, RenderTreeParameters};
pub use renderer::Renderer;
pub use tile::{RenderTile, RenderTiles, UnwrappedTileId, diff_tiles, render_tiles};
