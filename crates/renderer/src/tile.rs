//! Tile identifiers and visible tile snapshots.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use glam::Mat4;

/// Identifier of a tile, including the world copy it belongs to.
///
/// Ordered by wrap, then zoom, then x and y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnwrappedTileId {
    pub wrap: i16,
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl UnwrappedTileId {
    pub const fn new(wrap: i16, z: u8, x: u32, y: u32) -> Self {
        Self { wrap, z, x, y }
    }
}

impl fmt::Display for UnwrappedTileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)?;
        if self.wrap != 0 {
            write!(f, "@{}", self.wrap)?;
        }
        Ok(())
    }
}

/// A visible tile and the matrix that places it on screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTile {
    pub id: UnwrappedTileId,
    pub matrix: Mat4,
}

impl RenderTile {
    pub fn new(id: UnwrappedTileId, matrix: Mat4) -> Self {
        Self { id, matrix }
    }
}

/// Immutable, shared snapshot of visible tiles sorted by id.
pub type RenderTiles = Arc<[RenderTile]>;

/// Builds a [`RenderTiles`] snapshot, sorted by id with duplicates removed.
pub fn render_tiles(tiles: impl IntoIterator<Item = RenderTile>) -> RenderTiles {
    let mut tiles: Vec<RenderTile> = tiles.into_iter().collect();
    tiles.sort_by(|a, b| a.id.cmp(&b.id));
    tiles.dedup_by(|a, b| a.id == b.id);
    tiles.into()
}

/// Result of comparing two sorted tile id sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileDifference {
    /// Ids only present in the new set.
    pub added: Vec<UnwrappedTileId>,
    /// Ids only present in the previous set.
    pub removed: Vec<UnwrappedTileId>,
    /// Ids present in both.
    pub remainder: Vec<UnwrappedTileId>,
}

impl TileDifference {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compares two id sequences, both sorted ascending, with a single merge pass.
pub fn diff_tiles<P, N>(previous: P, next: N) -> TileDifference
where
    P: IntoIterator<Item = UnwrappedTileId>,
    N: IntoIterator<Item = UnwrappedTileId>,
{
    let mut result = TileDifference::default();
    let mut previous = previous.into_iter().peekable();
    let mut next = next.into_iter().peekable();

    loop {
        match (previous.peek(), next.peek()) {
            (Some(old), Some(new)) => match old.cmp(new) {
                Ordering::Less => {
                    result.removed.push(*old);
                    previous.next();
                }
                Ordering::Greater => {
                    result.added.push(*new);
                    next.next();
                }
                Ordering::Equal => {
                    result.remainder.push(*new);
                    previous.next();
                    next.next();
                }
            },
            (Some(old), None) => {
                result.removed.push(*old);
                previous.next();
            }
            (None, Some(new)) => {
                result.added.push(*new);
                next.next();
            }
            (None, None) => break,
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(x: u32) -> UnwrappedTileId {
        UnwrappedTileId::new(0, 4, x, 0)
    }

    #[test]
    fn test_tile_id_ordering() {
        let west = UnwrappedTileId::new(-1, 0, 0, 0);
        let base = UnwrappedTileId::new(0, 0, 0, 0);
        let deeper = UnwrappedTileId::new(0, 1, 0, 0);
        assert!(west < base);
        assert!(base < deeper);
        assert!(id(1) < id(2));
    }

    #[test]
    fn test_render_tiles_sorted_and_deduplicated() {
        let tiles = render_tiles([
            RenderTile::new(id(3), Mat4::IDENTITY),
            RenderTile::new(id(1), Mat4::IDENTITY),
            RenderTile::new(id(3), Mat4::IDENTITY),
        ]);
        let ids: Vec<_> = tiles.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![id(1), id(3)]);
    }

    #[test]
    fn test_diff_tiles() {
        let diff = diff_tiles([id(1), id(2), id(4)], [id(2), id(3), id(4), id(5)]);
        assert_eq!(diff.added, vec![id(3), id(5)]);
        assert_eq!(diff.removed, vec![id(1)]);
        assert_eq!(diff.remainder, vec![id(2), id(4)]);
        assert!(!diff.is_unchanged());
    }

    #[test]
    fn test_diff_identical_sets_is_unchanged() {
        let diff = diff_tiles([id(1), id(2)], [id(1), id(2)]);
        assert!(diff.is_unchanged());
        assert_eq!(diff.remainder.len(), 2);
    }

    #[test]
    fn test_diff_against_empty() {
        let diff = diff_tiles([], [id(7)]);
        assert_eq!(diff.added, vec![id(7)]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(UnwrappedTileId::new(0, 3, 2, 1).to_string(), "3/2/1");
        assert_eq!(UnwrappedTileId::new(1, 3, 2, 1).to_string(), "3/2/1@1");
    }
}
