//! Uniform buffer object definitions for shaders.
//!
//! These structures must match the shader uniform layouts exactly.
//! All structures use `#[repr(C)]` for predictable memory layout and implement
//! `Pod` and `Zeroable` for safe byte casting.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2};

/// Per-tile data of the clipping mask program.
///
/// Only `matrix` is sent, as push constants. The stencil reference is set
/// as dynamic state before each draw.
///
/// # Memory Layout
///
/// - Offset 0: tile matrix (64 bytes)
/// - Offset 64: stencil reference (4 bytes)
/// - Offset 68: padding (12 bytes)
/// - Total size: 80 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ClipUbo {
    /// Tile to clip space.
    pub matrix: Mat4,
    pub stencil_ref: u32,
    pub _padding: [u32; 3],
}

impl ClipUbo {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(matrix: Mat4, stencil_ref: u32) -> Self {
        Self {
            matrix,
            stencil_ref,
            _padding: [0; 3],
        }
    }

    /// The bytes pushed as constants for one clip draw.
    pub fn push_constants(&self) -> &[u8] {
        bytemuck::bytes_of(&self.matrix)
    }
}

/// Frame-wide parameters shared by every program.
///
/// Bound at index [`GlobalPaintParamsUbo::INDEX`] of the global uniform
/// buffer array.
///
/// # Memory Layout
///
/// - Offset 0: pattern atlas size in pixels (8 bytes)
/// - Offset 8: units to pixels (8 bytes)
/// - Offset 16: world size (8 bytes)
/// - Offset 24: camera to center distance, symbol fade change,
///   aspect ratio, pixel ratio, zoom (20 bytes)
/// - Offset 44: padding (4 bytes)
/// - Total size: 48 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GlobalPaintParamsUbo {
    pub pattern_atlas_texsize: Vec2,
    pub units_to_pixels: Vec2,
    pub world_size: Vec2,
    pub camera_to_center_distance: f32,
    pub symbol_fade_change: f32,
    pub aspect_ratio: f32,
    pub pixel_ratio: f32,
    pub zoom: f32,
    pub _padding: f32,
}

impl GlobalPaintParamsUbo {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Slot in the global uniform buffer array.
    pub const INDEX: usize = 0;
}

/// Number of slots in the global uniform buffer array.
pub const GLOBAL_UBO_COUNT: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_ubo_size() {
        // Mat4 (64) + stencil ref (4) + padding (12) = 80 bytes
        assert_eq!(ClipUbo::SIZE, 80);
    }

    #[test]
    fn test_clip_ubo_alignment() {
        // Verify proper alignment for GPU (Mat4 requires 16-byte alignment)
        assert_eq!(std::mem::align_of::<ClipUbo>(), 16);
    }

    #[test]
    fn test_clip_push_constants_are_the_matrix() {
        let ubo = ClipUbo::new(Mat4::from_scale(glam::Vec3::splat(2.0)), 7);
        let bytes = ubo.push_constants();
        assert_eq!(bytes.len(), 64);
        assert_eq!(bytes, bytemuck::bytes_of(&ubo.matrix));
        assert_eq!(ubo.stencil_ref, 7);
    }

    #[test]
    fn test_global_paint_params_size() {
        // 3 Vec2 (24) + 5 f32 (20) + padding (4) = 48 bytes
        assert_eq!(GlobalPaintParamsUbo::SIZE, 48);
    }

    #[test]
    fn test_ubo_pod_zeroable() {
        let params = GlobalPaintParamsUbo {
            pixel_ratio: 2.0,
            ..Default::default()
        };
        let bytes: &[u8] = bytemuck::bytes_of(&params);
        assert_eq!(bytes.len(), GlobalPaintParamsUbo::SIZE);

        let clip = ClipUbo::default();
        let bytes: &[u8] = bytemuck::bytes_of(&clip);
        assert_eq!(bytes.len(), ClipUbo::SIZE);
    }
}
