//! Per-frame paint parameters and the tile clipping stencil state.
//!
//! One base [`PaintParameters`] owns the frame's encoder and current render
//! pass. Worker threads paint through views made with
//! [`PaintParameters::view`]: a view shares the base's encoder through a weak
//! back-reference and carries its own copy of everything else, including the
//! stencil id map. Views must not outlive the frame.
//!
//! # Stencil Clipping
//!
//! Tile clipping masks are written into the stencil buffer with one id per
//! tile, starting at 1 (0 is the cleared value). Masks already present are
//! reused; new tiles get the next free ids. When the 8-bit id space runs
//! out the stencil buffer is cleared and every tile gets a fresh id.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use glam::Mat4;
use parking_lot::RwLock;
use tracing::{trace, warn};

use maprender_rhi::Size;

use crate::command_encoder::{CommandEncoder, RenderPass};
use crate::context::Context;
use crate::error::{RenderError, RenderResult};
use crate::tile::{RenderTile, UnwrappedTileId, diff_tiles};
use crate::ubo::{ClipUbo, GlobalPaintParamsUbo};

/// Largest id the 8-bit stencil buffer can hold.
pub const MAX_STENCIL_ID: u32 = 255;

/// Depth slices reserved per layer.
pub const NUM_SUBLAYERS: u32 = 3;

/// Depth step between two sublayers.
pub const DEPTH_EPSILON: f32 = 1.0 / (1 << 16) as f32;

/// Sub-pass a layer is currently painted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPassKind {
    Opaque,
    Translucent,
    Pass3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilTest {
    Always,
    Equal { mask: u32 },
    NotEqual { mask: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Replace,
}

/// Stencil state for one draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilMode {
    pub test: StencilTest,
    pub reference: u32,
    pub write_mask: u32,
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
}

impl StencilMode {
    pub const fn disabled() -> Self {
        Self {
            test: StencilTest::Always,
            reference: 0,
            write_mask: 0,
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthFunc {
    Never,
    Less,
    LessEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthMask {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthMode {
    pub func: DepthFunc,
    pub mask: DepthMask,
    pub range: [f32; 2],
}

impl DepthMode {
    pub const fn disabled() -> Self {
        Self {
            func: DepthFunc::Always,
            mask: DepthMask::ReadOnly,
            range: [0.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Unblended,
    AlphaBlended,
}

/// Camera and viewport values the frame is painted with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformState {
    pub projection: Mat4,
    pub size: Size,
    pub zoom: f32,
    pub pixel_ratio: f32,
    pub camera_to_center_distance: f32,
}

impl Default for TransformState {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            size: Size::new(1, 1),
            zoom: 0.0,
            pixel_ratio: 1.0,
            camera_to_center_distance: 1.0,
        }
    }
}

impl TransformState {
    /// Frame-wide values for the global uniform buffer.
    pub fn global_paint_params(&self, symbol_fade_change: f32) -> GlobalPaintParamsUbo {
        let width = self.size.width.max(1) as f32;
        let height = self.size.height.max(1) as f32;
        let world_size = 512.0 * self.zoom.exp2();
        GlobalPaintParamsUbo {
            units_to_pixels: glam::Vec2::new(1.0 / width, -1.0 / height) * 2.0,
            world_size: glam::Vec2::splat(world_size),
            camera_to_center_distance: self.camera_to_center_distance,
            symbol_fade_change,
            aspect_ratio: width / height,
            pixel_ratio: self.pixel_ratio,
            zoom: self.zoom,
            ..Default::default()
        }
    }
}

/// The encoder of a frame and the render pass currently open on it.
pub struct FrameEncoder<'c> {
    encoder: CommandEncoder<'c>,
    render_pass: RwLock<Option<RenderPass<'c>>>,
}

enum EncoderRef<'c> {
    Owned(Arc<FrameEncoder<'c>>),
    View(Weak<FrameEncoder<'c>>),
}

impl<'c> EncoderRef<'c> {
    fn get(&self) -> Option<Arc<FrameEncoder<'c>>> {
        match self {
            Self::Owned(encoder) => Some(Arc::clone(encoder)),
            Self::View(encoder) => encoder.upgrade(),
        }
    }
}

#[derive(Debug, Clone)]
struct StencilState {
    next_stencil_id: u32,
    tile_clipping_mask_ids: BTreeMap<UnwrappedTileId, u32>,
}

impl StencilState {
    fn new() -> Self {
        Self {
            next_stencil_id: 1,
            tile_clipping_mask_ids: BTreeMap::new(),
        }
    }

    fn reset(&mut self) {
        self.next_stencil_id = 1;
        self.tile_clipping_mask_ids.clear();
    }
}

/// Everything a layer needs to paint itself during one frame.
pub struct PaintParameters<'c> {
    context: &'c Context,
    encoder: EncoderRef<'c>,
    pub state: TransformState,
    pub symbol_fade_change: f32,
    /// Sub-pass currently painted.
    pub pass: RenderPassKind,
    /// Depth layer of the layer being painted, counted from the top.
    pub current_layer: u32,
    /// Layers below this index are painted in the opaque pass.
    pub opaque_pass_cutoff: u32,
    depth_range_size: f32,
    stencil: StencilState,
}

impl<'c> PaintParameters<'c> {
    /// Creates the base parameters of a frame, taking ownership of `encoder`.
    pub fn new(
        context: &'c Context,
        encoder: CommandEncoder<'c>,
        state: TransformState,
        symbol_fade_change: f32,
        layer_count: u32,
    ) -> Self {
        let depth_range_size =
            1.0 - (layer_count + 2) as f32 * NUM_SUBLAYERS as f32 * DEPTH_EPSILON;
        Self {
            context,
            encoder: EncoderRef::Owned(Arc::new(FrameEncoder {
                encoder,
                render_pass: RwLock::new(None),
            })),
            state,
            symbol_fade_change,
            pass: RenderPassKind::Opaque,
            current_layer: 0,
            opaque_pass_cutoff: 0,
            depth_range_size,
            stencil: StencilState::new(),
        }
    }

    /// A copy that paints through this frame's encoder without owning it.
    pub fn view(&self) -> Self {
        let encoder = match &self.encoder {
            EncoderRef::Owned(encoder) => Arc::downgrade(encoder),
            EncoderRef::View(encoder) => Weak::clone(encoder),
        };
        Self {
            context: self.context,
            encoder: EncoderRef::View(encoder),
            state: self.state,
            symbol_fade_change: self.symbol_fade_change,
            pass: self.pass,
            current_layer: self.current_layer,
            opaque_pass_cutoff: self.opaque_pass_cutoff,
            depth_range_size: self.depth_range_size,
            stencil: self.stencil.clone(),
        }
    }

    pub fn is_view(&self) -> bool {
        matches!(self.encoder, EncoderRef::View(_))
    }

    #[inline]
    pub fn context(&self) -> &'c Context {
        self.context
    }

    #[inline]
    pub fn depth_range_size(&self) -> f32 {
        self.depth_range_size
    }

    /// Runs `f` with the frame's encoder, if the frame is still alive.
    pub fn with_encoder<R>(&self, f: impl FnOnce(&CommandEncoder<'c>) -> R) -> Option<R> {
        self.encoder.get().map(|frame| f(&frame.encoder))
    }

    /// Runs `f` with the open render pass, if any.
    pub fn with_render_pass<R>(&self, f: impl FnOnce(&RenderPass<'c>) -> R) -> Option<R> {
        let frame = self.encoder.get()?;
        let render_pass = frame.render_pass.read();
        render_pass.as_ref().map(f)
    }

    /// Replaces the open render pass, returning the previous one.
    pub fn set_render_pass(&self, render_pass: Option<RenderPass<'c>>) -> Option<RenderPass<'c>> {
        let frame = self.encoder.get()?;
        let mut current = frame.render_pass.write();
        std::mem::replace(&mut *current, render_pass)
    }

    pub fn take_render_pass(&self) -> Option<RenderPass<'c>> {
        self.set_render_pass(None)
    }

    pub fn has_render_pass(&self) -> bool {
        self.with_render_pass(|_| ()).is_some()
    }

    // =========================================================================
    // Depth and Color
    // =========================================================================

    /// Depth state for sublayer `n` of the current layer.
    pub fn depth_mode_for_sublayer(&self, n: u32, mask: DepthMask) -> DepthMode {
        let depth = self.depth_range_size
            + ((1 + self.current_layer) * NUM_SUBLAYERS + n) as f32 * DEPTH_EPSILON;
        DepthMode {
            func: DepthFunc::LessEqual,
            mask,
            range: [depth, depth],
        }
    }

    /// Depth state for 3D geometry, below every 2D layer.
    pub fn depth_mode_for_3d(&self, mask: DepthMask) -> DepthMode {
        DepthMode {
            func: DepthFunc::LessEqual,
            mask,
            range: [0.0, self.depth_range_size],
        }
    }

    pub fn color_mode_for_render_pass(&self) -> ColorMode {
        match self.pass {
            RenderPassKind::Translucent => ColorMode::AlphaBlended,
            RenderPassKind::Opaque | RenderPassKind::Pass3D => ColorMode::Unblended,
        }
    }

    // =========================================================================
    // Stencil Clipping
    // =========================================================================

    /// Draws stencil masks for `tiles`, reusing masks already drawn.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::NoRenderPass`] if no render pass is open, or
    /// an error if the clipping program or command buffer is unavailable.
    pub fn render_tile_clipping_masks(
        &mut self,
        thread_index: Option<usize>,
        tiles: &[RenderTile],
    ) -> RenderResult<()> {
        let mut ids: Vec<UnwrappedTileId> = tiles.iter().map(|tile| tile.id).collect();
        ids.sort_unstable();
        ids.dedup();

        let masked = &self.stencil.tile_clipping_mask_ids;
        let difference = diff_tiles(masked.keys().copied(), ids.iter().copied());
        if difference.is_unchanged() {
            return Ok(());
        }

        let used = (self.stencil.next_stencil_id - 1) as usize;
        let fresh = if used + difference.added.len() > MAX_STENCIL_ID as usize {
            self.clear_stencil(thread_index)?;
            ids
        } else {
            for id in &difference.removed {
                self.stencil.tile_clipping_mask_ids.remove(id);
            }
            difference.added
        };

        let mut assigned = BTreeMap::new();
        for id in fresh {
            if self.stencil.next_stencil_id > MAX_STENCIL_ID {
                warn!("Out of stencil ids, tile {} is not clipped", id);
                continue;
            }
            let stencil_id = self.stencil.next_stencil_id;
            self.stencil.next_stencil_id += 1;
            self.stencil.tile_clipping_mask_ids.insert(id, stencil_id);
            assigned.insert(id, stencil_id);
        }

        let masks: Vec<ClipUbo> = tiles
            .iter()
            .filter_map(|tile| {
                assigned
                    .remove(&tile.id)
                    .map(|stencil_id| ClipUbo::new(tile.matrix, stencil_id))
            })
            .collect();

        trace!(
            "Drawing {} clipping mask(s), next stencil id {}",
            masks.len(),
            self.stencil.next_stencil_id
        );
        self.context.stats().add_stencil_update();
        let context = self.context;
        self.with_render_pass(|render_pass| {
            context.render_tile_clipping_masks(render_pass, thread_index, &masks)
        })
        .ok_or(RenderError::NoRenderPass)?
    }

    /// Stencil state restricting a draw to the mask of `tile`.
    pub fn stencil_mode_for_clipping(&self, tile: &UnwrappedTileId) -> StencilMode {
        let reference = self.stencil.tile_clipping_mask_ids.get(tile).copied();
        debug_assert!(reference.is_some(), "tile {} has no clipping mask", tile);
        StencilMode {
            test: StencilTest::Equal { mask: 0xFF },
            reference: reference.unwrap_or(0),
            write_mask: 0,
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Replace,
        }
    }

    /// Stencil state for one 3D draw: a fresh id, so overlapping 3D
    /// geometry of the same draw is only painted once.
    ///
    /// Forgets every tile mask.
    ///
    /// # Errors
    ///
    /// Returns an error if the id space is exhausted and the stencil clear
    /// cannot be recorded.
    pub fn stencil_mode_for_3d(&mut self, thread_index: Option<usize>) -> RenderResult<StencilMode> {
        if self.stencil.next_stencil_id > MAX_STENCIL_ID {
            self.clear_stencil(thread_index)?;
        }
        self.stencil.tile_clipping_mask_ids.clear();

        let reference = self.stencil.next_stencil_id;
        self.stencil.next_stencil_id += 1;
        Ok(StencilMode {
            test: StencilTest::NotEqual { mask: 0xFF },
            reference,
            write_mask: 0xFF,
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Replace,
        })
    }

    /// Next id handed to a new mask.
    pub fn next_stencil_id(&self) -> u32 {
        self.stencil.next_stencil_id
    }

    /// The stencil id of `tile`, if it is masked.
    pub fn clipping_mask_id(&self, tile: &UnwrappedTileId) -> Option<u32> {
        self.stencil.tile_clipping_mask_ids.get(tile).copied()
    }

    /// Forgets every mask after the stencil attachment was cleared by a
    /// render pass load.
    pub fn forget_clipping_masks(&mut self) {
        self.stencil.reset();
    }

    fn clear_stencil(&mut self, thread_index: Option<usize>) -> RenderResult<()> {
        self.with_render_pass(|render_pass| render_pass.clear_stencil(thread_index, 0))
            .ok_or(RenderError::NoRenderPass)??;
        self.context.stats().add_stencil_clear();
        self.stencil.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_encoder::RenderPassDescriptor;
    use crate::context::test_util::headless_context;
    use maprender_rhi::RecordedCommand;

    fn tile(x: u32) -> RenderTile {
        RenderTile::new(UnwrappedTileId::new(0, 10, x, 0), Mat4::IDENTITY)
    }

    fn tiles(range: std::ops::Range<u32>) -> Vec<RenderTile> {
        range.map(tile).collect()
    }

    fn count(commands: &[RecordedCommand], f: impl Fn(&RecordedCommand) -> bool) -> usize {
        commands.iter().filter(|c| f(c)).count()
    }

    /// Opens a frame with one render pass and runs `f` on the base
    /// parameters.
    fn with_params(f: impl FnOnce(&mut PaintParameters<'_>)) -> Vec<RecordedCommand> {
        let (backend, mut context) = headless_context(0);
        context.begin_frame().unwrap();
        let encoder = context.create_command_encoder();
        let render_pass = encoder
            .create_render_pass("main", RenderPassDescriptor::surface())
            .unwrap();
        let mut params =
            PaintParameters::new(&context, encoder, TransformState::default(), 0.0, 4);
        params.set_render_pass(Some(render_pass));
        f(&mut params);
        drop(params.take_render_pass());
        backend.commands(context.primary_command_buffer())
    }

    #[test]
    fn test_identical_tiles_reuse_masks() {
        let commands = with_params(|params| {
            params.render_tile_clipping_masks(None, &tiles(0..3)).unwrap();
            params.render_tile_clipping_masks(None, &tiles(0..3)).unwrap();
            assert_eq!(params.next_stencil_id(), 4);
            let stats = params.context().stats().snapshot();
            assert_eq!(stats.stencil_updates, 1);
            assert_eq!(stats.draw_calls, 3);
        });
        assert_eq!(
            count(&commands, |c| matches!(c, RecordedCommand::DrawIndexed { .. })),
            3
        );
    }

    #[test]
    fn test_superset_assigns_only_added_tiles() {
        with_params(|params| {
            params.render_tile_clipping_masks(None, &tiles(0..3)).unwrap();
            let before: Vec<_> = (0..3)
                .map(|x| params.clipping_mask_id(&tile(x).id).unwrap())
                .collect();

            params.render_tile_clipping_masks(None, &tiles(0..5)).unwrap();
            let after: Vec<_> = (0..3)
                .map(|x| params.clipping_mask_id(&tile(x).id).unwrap())
                .collect();
            assert_eq!(before, after);
            assert_eq!(params.clipping_mask_id(&tile(3).id), Some(4));
            assert_eq!(params.clipping_mask_id(&tile(4).id), Some(5));
            assert_eq!(params.context().stats().snapshot().draw_calls, 5);
        });
    }

    #[test]
    fn test_removed_tiles_lose_their_mask() {
        with_params(|params| {
            params.render_tile_clipping_masks(None, &tiles(0..3)).unwrap();
            params.render_tile_clipping_masks(None, &tiles(1..4)).unwrap();
            assert_eq!(params.clipping_mask_id(&tile(0).id), None);
            assert_eq!(params.clipping_mask_id(&tile(1).id), Some(2));
            // Ids of removed tiles are not reused before a clear.
            assert_eq!(params.clipping_mask_id(&tile(3).id), Some(4));
        });
    }

    #[test]
    fn test_overflow_clears_and_renumbers() {
        let commands = with_params(|params| {
            params.render_tile_clipping_masks(None, &tiles(0..200)).unwrap();
            params.render_tile_clipping_masks(None, &tiles(0..260)).unwrap();

            // 200 used + 60 new > 255: clear, then ids from 1 for all tiles.
            assert_eq!(params.clipping_mask_id(&tile(0).id), Some(1));
            assert_eq!(params.clipping_mask_id(&tile(254).id), Some(255));
            assert_eq!(params.clipping_mask_id(&tile(255).id), None);
            let stats = params.context().stats().snapshot();
            assert_eq!(stats.stencil_clears, 1);
            assert_eq!(stats.stencil_updates, 2);
        });
        assert_eq!(
            count(&commands, |c| *c == RecordedCommand::ClearStencil(0)),
            1
        );
    }

    #[test]
    fn test_clipping_mode_uses_tile_id() {
        with_params(|params| {
            params.render_tile_clipping_masks(None, &tiles(0..2)).unwrap();
            let mode = params.stencil_mode_for_clipping(&tile(1).id);
            assert_eq!(mode.test, StencilTest::Equal { mask: 0xFF });
            assert_eq!(mode.reference, 2);
            assert_eq!(mode.write_mask, 0);
        });
    }

    #[test]
    fn test_3d_mode_forgets_masks() {
        with_params(|params| {
            params.render_tile_clipping_masks(None, &tiles(0..2)).unwrap();
            let mode = params.stencil_mode_for_3d(None).unwrap();
            assert_eq!(mode.test, StencilTest::NotEqual { mask: 0xFF });
            assert_eq!(mode.reference, 3);
            assert_eq!(params.clipping_mask_id(&tile(0).id), None);

            // Same tiles again need new masks.
            params.render_tile_clipping_masks(None, &tiles(0..2)).unwrap();
            assert_eq!(params.clipping_mask_id(&tile(0).id), Some(4));
        });
    }

    #[test]
    fn test_3d_mode_clears_when_exhausted() {
        with_params(|params| {
            params.render_tile_clipping_masks(None, &tiles(0..255)).unwrap();
            assert_eq!(params.next_stencil_id(), 256);
            let mode = params.stencil_mode_for_3d(None).unwrap();
            assert_eq!(mode.reference, 1);
            assert_eq!(params.context().stats().snapshot().stencil_clears, 1);
        });
    }

    #[test]
    fn test_views_share_the_render_pass() {
        with_params(|params| {
            params.render_tile_clipping_masks(None, &tiles(0..2)).unwrap();
            let mut view = params.view();
            assert!(view.is_view());
            assert!(view.has_render_pass());
            // The view starts from a copy of the stencil map.
            assert_eq!(view.clipping_mask_id(&tile(1).id), Some(2));
            view.render_tile_clipping_masks(None, &tiles(0..3)).unwrap();
            assert_eq!(params.clipping_mask_id(&tile(2).id), None);
        });
    }

    #[test]
    fn test_masks_without_render_pass_fail() {
        let (_backend, mut context) = headless_context(0);
        context.begin_frame().unwrap();
        let encoder = context.create_command_encoder();
        let mut params =
            PaintParameters::new(&context, encoder, TransformState::default(), 0.0, 1);
        assert!(matches!(
            params.render_tile_clipping_masks(None, &tiles(0..1)),
            Err(RenderError::NoRenderPass)
        ));
    }

    #[test]
    fn test_depth_modes() {
        let (_backend, mut context) = headless_context(0);
        context.begin_frame().unwrap();
        let encoder = context.create_command_encoder();
        let mut params =
            PaintParameters::new(&context, encoder, TransformState::default(), 0.0, 10);
        let range_size = 1.0 - 12.0 * 3.0 * DEPTH_EPSILON;
        assert_eq!(params.depth_range_size(), range_size);

        params.current_layer = 2;
        let mode = params.depth_mode_for_sublayer(1, DepthMask::ReadWrite);
        let expected = range_size + (3 * NUM_SUBLAYERS + 1) as f32 * DEPTH_EPSILON;
        assert_eq!(mode.range, [expected, expected]);
        assert_eq!(
            params.depth_mode_for_3d(DepthMask::ReadOnly).range,
            [0.0, range_size]
        );

        params.pass = RenderPassKind::Translucent;
        assert_eq!(params.color_mode_for_render_pass(), ColorMode::AlphaBlended);
    }
}
