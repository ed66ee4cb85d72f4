//! Immutable per-frame snapshot handed to the renderer.

use std::sync::Arc;

use maprender_rhi::TextureHandle;

use crate::command_encoder::UploadPass;
use crate::error::RenderResult;
use crate::paint_parameters::{PaintParameters, RenderPassKind, TransformState};

/// Something drawn outside of layer groups: source-level overlays and
/// layers without drawables.
pub trait RenderItem: Send + Sync {
    fn name(&self) -> &str;

    fn has_render_pass(&self, pass: RenderPassKind) -> bool;

    fn upload(&self, pass: &UploadPass<'_>) -> RenderResult<()>;

    fn render(&self, params: &mut PaintParameters<'_>, thread_index: Option<usize>) -> RenderResult<()>;
}

/// Frame-wide values of a render tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTreeParameters {
    pub transform: TransformState,
    pub clear_color: [f32; 4],
    pub symbol_fade_change: f32,
    /// Layers below this index are painted in the opaque pass.
    pub opaque_pass_cutoff: u32,
    /// Offscreen target of the 3D pass; without one the pass is skipped.
    pub target_3d: Option<TextureHandle>,
    /// Draws source debug overlays after the translucent pass.
    pub debug_overlays: bool,
}

impl Default for RenderTreeParameters {
    fn default() -> Self {
        Self {
            transform: TransformState::default(),
            clear_color: [0.0, 0.0, 0.0, 0.0],
            symbol_fade_change: 1.0,
            opaque_pass_cutoff: 0,
            target_3d: None,
            debug_overlays: false,
        }
    }
}

/// What to draw this frame, besides the persistent layer groups.
#[derive(Clone, Default)]
pub struct RenderTree {
    parameters: RenderTreeParameters,
    source_items: Vec<Arc<dyn RenderItem>>,
    layer_items: Vec<Arc<dyn RenderItem>>,
}

impl RenderTree {
    pub fn new(parameters: RenderTreeParameters) -> Self {
        Self {
            parameters,
            source_items: Vec::new(),
            layer_items: Vec::new(),
        }
    }

    pub fn with_source_item(mut self, item: Arc<dyn RenderItem>) -> Self {
        self.source_items.push(item);
        self
    }

    /// Adds a layer item, painted after the layer groups in tree order.
    pub fn with_layer_item(mut self, item: Arc<dyn RenderItem>) -> Self {
        self.layer_items.push(item);
        self
    }

    #[inline]
    pub fn parameters(&self) -> &RenderTreeParameters {
        &self.parameters
    }

    pub fn source_items(&self) -> &[Arc<dyn RenderItem>] {
        &self.source_items
    }

    pub fn layer_items(&self) -> &[Arc<dyn RenderItem>] {
        &self.layer_items
    }
}

impl std::fmt::Debug for RenderTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTree")
            .field("parameters", &self.parameters)
            .field(
                "source_items",
                &self.source_items.iter().map(|i| i.name()).collect::<Vec<_>>(),
            )
            .field(
                "layer_items",
                &self.layer_items.iter().map(|i| i.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Overlay;

    impl RenderItem for Overlay {
        fn name(&self) -> &str {
            "overlay"
        }
        fn has_render_pass(&self, pass: RenderPassKind) -> bool {
            pass == RenderPassKind::Translucent
        }
        fn upload(&self, _pass: &UploadPass<'_>) -> RenderResult<()> {
            Ok(())
        }
        fn render(
            &self,
            _params: &mut PaintParameters<'_>,
            _thread_index: Option<usize>,
        ) -> RenderResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tree_keeps_item_order() {
        let overlay: Arc<dyn RenderItem> = Arc::new(Overlay);
        let tree = RenderTree::new(RenderTreeParameters::default())
            .with_layer_item(Arc::clone(&overlay))
            .with_source_item(Arc::clone(&overlay))
            .with_layer_item(overlay);
        assert_eq!(tree.layer_items().len(), 2);
        assert_eq!(tree.source_items().len(), 1);
        assert!(format!("{:?}", tree).contains("overlay"));
    }

    #[test]
    fn test_tree_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RenderTree>();
    }
}
