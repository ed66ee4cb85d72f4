//! Shared fixtures for the renderer integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use glam::Mat4;
use parking_lot::Mutex;

use maprender_core::RendererConfig;
use maprender_renderer::context::CLIPPING_MASK_PROGRAM;
use maprender_renderer::{
    RenderPassKind, RenderTile, Renderer, TileDrawable, TileLayerGroup, UnwrappedTileId,
    render_tiles,
};
use maprender_rhi::{
    GraphicsBackend, HeadlessBackend, PipelineHandle, RecordedCommand, RhiResult, ShaderRegistry,
    Size,
};

pub const FILL_PROGRAM: &str = "FillProgram";

/// Registry knowing the clipping program and one fill program.
#[derive(Default)]
pub struct Shaders {
    pub builds: Mutex<Vec<String>>,
}

impl ShaderRegistry for Shaders {
    fn build_program(
        &self,
        name: &str,
        _backend: &dyn GraphicsBackend,
    ) -> RhiResult<Option<PipelineHandle>> {
        self.builds.lock().push(name.to_string());
        Ok(match name {
            CLIPPING_MASK_PROGRAM => Some(PipelineHandle::from_raw(0xC1)),
            FILL_PROGRAM => Some(PipelineHandle::from_raw(0xF1)),
            _ => None,
        })
    }
}

/// Routes renderer logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_ids(true)
        .with_test_writer()
        .try_init();
}

pub fn renderer(config: RendererConfig) -> anyhow::Result<(Arc<HeadlessBackend>, Renderer)> {
    init_tracing();
    let backend = Arc::new(HeadlessBackend::new(Size::new(1024, 768)));
    let renderer = Renderer::new(backend.clone(), Arc::new(Shaders::default()), config)?;
    Ok((backend, renderer))
}

pub fn tile_id(x: u32) -> UnwrappedTileId {
    UnwrappedTileId::new(0, 8, x, 0)
}

/// A group with one clipped fill drawable per tile in `xs`, painted in
/// `pass`. Each drawable pushes its group name as constants.
pub fn fill_group(
    name: &str,
    layer_index: i32,
    xs: std::ops::Range<u32>,
    pass: RenderPassKind,
) -> TileLayerGroup {
    let mut group = TileLayerGroup::new(name, layer_index);
    group.set_tiles(render_tiles(xs.clone().map(|x| {
        RenderTile::new(
            tile_id(x),
            Mat4::from_translation(glam::vec3(x as f32, 0.0, 0.0)),
        )
    })));
    for x in xs {
        group.add_drawable(
            TileDrawable::new(tile_id(x), FILL_PROGRAM, pass).with_push_constants(name.as_bytes()),
        );
    }
    group
}

/// Names of the groups whose fills appear in `commands`, in order, one
/// entry per draw.
pub fn fill_order(commands: &[RecordedCommand]) -> Vec<String> {
    commands
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::PushConstants { data, .. } if data.len() != 64 => {
                Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => None,
        })
        .collect()
}

/// Stencil references set in `commands`, in order.
pub fn stencil_references(commands: &[RecordedCommand]) -> Vec<u32> {
    commands
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::SetStencilReference(reference) => Some(*reference),
            _ => None,
        })
        .collect()
}

pub fn count(commands: &[RecordedCommand], f: impl Fn(&RecordedCommand) -> bool) -> usize {
    commands.iter().filter(|command| f(command)).count()
}
