//! Layer groups: the units the orchestrator schedules across threads.
//!
//! A [`LayerGroup`] paints one style layer. Groups are visited in layer
//! order, each on exactly one thread per pass, so a group may keep mutable
//! per-frame state without locking.

use std::collections::BTreeSet;

use tracing::warn;

use maprender_rhi::DescriptorSetCategory;

use crate::command_encoder::UploadPass;
use crate::error::{RenderError, RenderResult};
use crate::paint_parameters::{PaintParameters, RenderPassKind};
use crate::tile::{RenderTiles, UnwrappedTileId};
use crate::uniform_buffer::UniformBufferArray;

/// One layer's drawables and the hooks run on them each frame.
pub trait LayerGroup: Send {
    fn name(&self) -> &str;

    /// Sort key among all groups; ties keep insertion order.
    fn layer_index(&self) -> i32;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether the group draws anything in `pass`.
    fn has_render_pass(&self, pass: RenderPassKind) -> bool;

    /// Updates per-frame uniform values ahead of the upload.
    fn run_tweakers(&mut self, _params: &PaintParameters<'_>) -> RenderResult<()> {
        Ok(())
    }

    fn upload(&mut self, pass: &UploadPass<'_>) -> RenderResult<()>;

    fn pre_render(
        &mut self,
        _params: &mut PaintParameters<'_>,
        _thread_index: Option<usize>,
    ) -> RenderResult<()> {
        Ok(())
    }

    /// Records the group's draws for `params.pass` on `thread_index`.
    fn render(
        &mut self,
        params: &mut PaintParameters<'_>,
        thread_index: Option<usize>,
    ) -> RenderResult<()>;

    fn post_render(
        &mut self,
        _params: &mut PaintParameters<'_>,
        _thread_index: Option<usize>,
    ) -> RenderResult<()> {
        Ok(())
    }
}

/// Layer-wide uniform values waiting for upload.
#[derive(Debug, Default)]
pub struct LayerUniforms {
    slots: Vec<Option<Vec<u8>>>,
    dirty: BTreeSet<usize>,
}

impl LayerUniforms {
    pub fn set(&mut self, id: usize, data: &[u8]) {
        if self.slots.len() <= id {
            self.slots.resize(id + 1, None);
        }
        if self.slots[id].as_deref() != Some(data) {
            self.slots[id] = Some(data.to_vec());
            self.dirty.insert(id);
        }
    }

    pub fn get(&self, id: usize) -> Option<&[u8]> {
        self.slots.get(id).and_then(|slot| slot.as_deref())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }
}

/// Per-frame hook that rewrites a group's layer uniforms.
pub trait LayerTweaker: Send {
    fn execute(&mut self, uniforms: &mut LayerUniforms, params: &PaintParameters<'_>);
}

impl<F> LayerTweaker for F
where
    F: FnMut(&mut LayerUniforms, &PaintParameters<'_>) + Send,
{
    fn execute(&mut self, uniforms: &mut LayerUniforms, params: &PaintParameters<'_>) {
        self(uniforms, params)
    }
}

/// A draw of one tile's geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct TileDrawable {
    pub tile: UnwrappedTileId,
    pub program: String,
    pub pass: RenderPassKind,
    pub index_count: u32,
    /// Per-draw data sent as push constants.
    pub push_constants: Vec<u8>,
    /// Restricts the draw to the tile's stencil mask.
    pub clipped: bool,
}

impl TileDrawable {
    pub fn new(tile: UnwrappedTileId, program: impl Into<String>, pass: RenderPassKind) -> Self {
        Self {
            tile,
            program: program.into(),
            pass,
            index_count: 6,
            push_constants: Vec::new(),
            clipped: true,
        }
    }

    pub fn with_index_count(mut self, count: u32) -> Self {
        self.index_count = count;
        self
    }

    pub fn with_push_constants(mut self, data: &[u8]) -> Self {
        self.push_constants = data.to_vec();
        self
    }

    pub fn unclipped(mut self) -> Self {
        self.clipped = false;
        self
    }
}

/// A layer group drawing per-tile geometry, clipped to tile boundaries.
pub struct TileLayerGroup {
    name: String,
    layer_index: i32,
    enabled: bool,
    tiles: RenderTiles,
    drawables: Vec<TileDrawable>,
    tweakers: Vec<Box<dyn LayerTweaker>>,
    uniforms: LayerUniforms,
    uniform_buffers: Option<UniformBufferArray>,
}

impl TileLayerGroup {
    pub fn new(name: impl Into<String>, layer_index: i32) -> Self {
        Self {
            name: name.into(),
            layer_index,
            enabled: true,
            tiles: RenderTiles::from([]),
            drawables: Vec::new(),
            tweakers: Vec::new(),
            uniforms: LayerUniforms::default(),
            uniform_buffers: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_layer_index(&mut self, layer_index: i32) {
        self.layer_index = layer_index;
    }

    /// Tiles this group clips against. Every clipped drawable's tile must be
    /// among them.
    pub fn set_tiles(&mut self, tiles: RenderTiles) {
        self.tiles = tiles;
    }

    pub fn tiles(&self) -> &RenderTiles {
        &self.tiles
    }

    pub fn add_drawable(&mut self, drawable: TileDrawable) {
        self.drawables.push(drawable);
    }

    pub fn clear_drawables(&mut self) {
        self.drawables.clear();
    }

    pub fn drawables(&self) -> &[TileDrawable] {
        &self.drawables
    }

    pub fn add_tweaker(&mut self, tweaker: impl LayerTweaker + 'static) {
        self.tweakers.push(Box::new(tweaker));
    }

    pub fn uniforms_mut(&mut self) -> &mut LayerUniforms {
        &mut self.uniforms
    }

    pub fn uniform_buffers(&self) -> Option<&UniformBufferArray> {
        self.uniform_buffers.as_ref()
    }
}

impl LayerGroup for TileLayerGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_index(&self) -> i32 {
        self.layer_index
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn has_render_pass(&self, pass: RenderPassKind) -> bool {
        self.drawables.iter().any(|drawable| drawable.pass == pass)
    }

    fn run_tweakers(&mut self, params: &PaintParameters<'_>) -> RenderResult<()> {
        for tweaker in &mut self.tweakers {
            tweaker.execute(&mut self.uniforms, params);
        }
        Ok(())
    }

    fn upload(&mut self, pass: &UploadPass<'_>) -> RenderResult<()> {
        if !self.uniforms.is_dirty() {
            return Ok(());
        }
        let context = pass.context();
        let count = self.uniforms.len();
        if self.uniform_buffers.as_ref().is_none_or(|ubos| ubos.len() < count) {
            self.uniform_buffers = Some(UniformBufferArray::new(
                context,
                DescriptorSetCategory::Layer,
                count,
            ));
            self.uniforms.dirty.extend(0..count);
        }

        let dirty = std::mem::take(&mut self.uniforms.dirty);
        if let Some(ubos) = self.uniform_buffers.as_mut() {
            for id in dirty {
                if let Some(data) = self.uniforms.slots.get(id).and_then(|slot| slot.as_deref()) {
                    ubos.create_or_update(context, id, data)?;
                }
            }
        }
        Ok(())
    }

    fn render(
        &mut self,
        params: &mut PaintParameters<'_>,
        thread_index: Option<usize>,
    ) -> RenderResult<()> {
        if !self.enabled || !self.has_render_pass(params.pass) {
            return Ok(());
        }
        let context = params.context();
        let _group = params
            .with_render_pass(|render_pass| render_pass.create_debug_group(thread_index, &self.name))
            .ok_or(RenderError::NoRenderPass)??;

        let pass = params.pass;
        if self
            .drawables
            .iter()
            .any(|drawable| drawable.pass == pass && drawable.clipped)
        {
            params.render_tile_clipping_masks(thread_index, &self.tiles)?;
        }

        let command_buffer = params
            .with_render_pass(|render_pass| render_pass.command_buffer(thread_index))
            .ok_or(RenderError::NoRenderPass)??;
        if let Some(ubos) = self.uniform_buffers.as_mut() {
            params
                .with_render_pass(|render_pass| ubos.bind(context, render_pass, thread_index))
                .ok_or(RenderError::NoRenderPass)??;
        }

        let backend = context.backend();
        let mut draws = 0;
        for drawable in self.drawables.iter().filter(|d| d.pass == pass) {
            if drawable.clipped {
                let Some(_) = params.clipping_mask_id(&drawable.tile) else {
                    warn!(
                        "{}: tile {} has no clipping mask, skipping draw",
                        self.name, drawable.tile
                    );
                    continue;
                };
            }
            let pipeline = context.pipeline(&drawable.program)?;
            backend.bind_pipeline(command_buffer, pipeline);
            if drawable.clipped {
                let stencil = params.stencil_mode_for_clipping(&drawable.tile);
                backend.set_stencil_reference(command_buffer, stencil.reference);
            }
            if !drawable.push_constants.is_empty() {
                backend.push_constants(command_buffer, pipeline, &drawable.push_constants);
            }
            backend.draw_indexed(command_buffer, drawable.index_count, 1);
            draws += 1;
        }
        context.stats().add_draw_calls(draws);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_encoder::RenderPassDescriptor;
    use crate::context::test_util::headless_context;
    use crate::paint_parameters::TransformState;
    use crate::tile::{RenderTile, render_tiles};
    use glam::Mat4;
    use maprender_rhi::RecordedCommand;

    fn tile_id(x: u32) -> UnwrappedTileId {
        UnwrappedTileId::new(0, 4, x, 0)
    }

    fn fill_group() -> TileLayerGroup {
        let mut group = TileLayerGroup::new("fill", 0);
        group.set_tiles(render_tiles(
            (0..2).map(|x| RenderTile::new(tile_id(x), Mat4::IDENTITY)),
        ));
        for x in 0..2 {
            group.add_drawable(
                TileDrawable::new(tile_id(x), "FillProgram", RenderPassKind::Opaque)
                    .with_push_constants(&[x as u8; 4]),
            );
        }
        group
    }

    #[test]
    fn test_layer_uniforms_track_changes() {
        let mut uniforms = LayerUniforms::default();
        uniforms.set(1, &[1, 2]);
        assert_eq!(uniforms.len(), 2);
        assert!(uniforms.get(0).is_none());
        assert!(uniforms.is_dirty());

        uniforms.dirty.clear();
        uniforms.set(1, &[1, 2]);
        assert!(!uniforms.is_dirty());
    }

    #[test]
    fn test_render_clips_and_draws_in_pass() {
        let (backend, mut context) = headless_context(0);
        context.begin_frame().unwrap();
        let encoder = context.create_command_encoder();
        let render_pass = encoder
            .create_render_pass("main", RenderPassDescriptor::surface())
            .unwrap();
        let mut params =
            PaintParameters::new(&context, encoder, TransformState::default(), 0.0, 1);
        params.set_render_pass(Some(render_pass));

        let mut group = fill_group();
        params.pass = RenderPassKind::Translucent;
        group.render(&mut params, None).unwrap();
        assert_eq!(context.stats().snapshot().draw_calls, 0);

        params.pass = RenderPassKind::Opaque;
        group.render(&mut params, None).unwrap();
        drop(params.take_render_pass());

        let commands = backend.commands(context.primary_command_buffer());
        let references: Vec<u32> = commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::SetStencilReference(r) => Some(*r),
                _ => None,
            })
            .collect();
        // Two mask draws, then two clipped fills.
        assert_eq!(references, vec![1, 2, 1, 2]);
        assert!(commands.contains(&RecordedCommand::PushDebugGroup("fill".into())));
        assert_eq!(context.stats().snapshot().draw_calls, 4);
    }

    #[test]
    fn test_tweakers_feed_the_upload() {
        let (backend, mut context) = headless_context(0);
        context.begin_frame().unwrap();
        let encoder = context.create_command_encoder();
        let mut group = fill_group();
        group.add_tweaker(|uniforms: &mut LayerUniforms, params: &PaintParameters<'_>| {
            uniforms.set(0, &params.symbol_fade_change.to_le_bytes());
        });

        let upload = encoder.create_upload_pass("upload");
        let params = PaintParameters::new(&context, encoder, TransformState::default(), 0.5, 1);
        group.run_tweakers(&params).unwrap();
        group.upload(&upload).unwrap();

        let ubos = group.uniform_buffers().unwrap();
        let buffer = ubos.get(0).unwrap();
        assert_eq!(
            backend.buffer_contents(buffer.handle()).unwrap(),
            0.5f32.to_le_bytes().to_vec()
        );

        // Unchanged values upload nothing.
        let updates = context.stats().snapshot().num_uniform_updates;
        group.run_tweakers(&params).unwrap();
        group.upload(&upload).unwrap();
        assert_eq!(context.stats().snapshot().num_uniform_updates, updates);
    }

    #[test]
    fn test_missing_program_fails_render() {
        let (_backend, mut context) = headless_context(0);
        context.begin_frame().unwrap();
        let encoder = context.create_command_encoder();
        let render_pass = encoder
            .create_render_pass("main", RenderPassDescriptor::surface())
            .unwrap();
        let mut params =
            PaintParameters::new(&context, encoder, TransformState::default(), 0.0, 1);
        params.set_render_pass(Some(render_pass));

        let mut group = TileLayerGroup::new("broken", 0);
        group.add_drawable(
            TileDrawable::new(tile_id(0), "UnknownProgram", RenderPassKind::Opaque).unclipped(),
        );
        assert!(matches!(
            group.render(&mut params, None),
            Err(RenderError::ProgramNotFound(_))
        ));
    }
}
