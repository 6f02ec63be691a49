//! Axis-aligned integer boxes over a 3D volume.
//!
//! A [`Tile`] is the half-open box `[l, r)` on each axis. Tiles describe the region of the
//! model image touched by a parameter change, the padded region that has to be re-rendered to
//! produce it, and the slicing needed to stitch the result back into the full volume.
//!
//! Tiles may extend past the volume (a particle near an edge has support outside the image);
//! [`Tile::intersection`] and [`Tile::reflect_overhang`] clip them back in.

use ndarray::{Array3, ArrayView3, ArrayViewMut3, s};
use std::fmt;
use std::ops::Range;

/// Half-open integer box `[l, r)` in three dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    /// Lower corner (inclusive)
    pub l: [i64; 3],
    /// Upper corner (exclusive)
    pub r: [i64; 3],
}

impl Tile {
    pub fn new(l: [i64; 3], r: [i64; 3]) -> Self {
        Self { l, r }
    }

    /// Tile covering a whole volume of the given shape.
    pub fn from_shape(shape: [usize; 3]) -> Self {
        Self {
            l: [0; 3],
            r: [shape[0] as i64, shape[1] as i64, shape[2] as i64],
        }
    }

    /// Extent along each axis (zero for inverted axes).
    pub fn shape(&self) -> [i64; 3] {
        [
            (self.r[0] - self.l[0]).max(0),
            (self.r[1] - self.l[1]).max(0),
            (self.r[2] - self.l[2]).max(0),
        ]
    }

    /// Number of voxels inside the tile.
    pub fn size(&self) -> usize {
        self.shape().iter().map(|&n| n as usize).product()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Grow the tile by `pad` voxels on both sides of every axis.
    pub fn pad(&self, pad: [i64; 3]) -> Self {
        Self {
            l: [self.l[0] - pad[0], self.l[1] - pad[1], self.l[2] - pad[2]],
            r: [self.r[0] + pad[0], self.r[1] + pad[1], self.r[2] + pad[2]],
        }
    }

    pub fn translate(&self, delta: [i64; 3]) -> Self {
        Self {
            l: [
                self.l[0] + delta[0],
                self.l[1] + delta[1],
                self.l[2] + delta[2],
            ],
            r: [
                self.r[0] + delta[0],
                self.r[1] + delta[1],
                self.r[2] + delta[2],
            ],
        }
    }

    /// Overlap of two tiles. Disjoint tiles produce an empty tile anchored at the larger
    /// lower corner.
    pub fn intersection(&self, other: &Tile) -> Self {
        let mut l = [0; 3];
        let mut r = [0; 3];
        for axis in 0..3 {
            l[axis] = self.l[axis].max(other.l[axis]);
            r[axis] = self.r[axis].min(other.r[axis]).max(l[axis]);
        }
        Self { l, r }
    }

    /// Smallest tile enclosing every tile in `tiles`, or `None` for an empty slice.
    pub fn bounding(tiles: &[Tile]) -> Option<Self> {
        let first = tiles.first()?;
        Some(tiles.iter().skip(1).fold(*first, |acc, t| Self {
            l: [
                acc.l[0].min(t.l[0]),
                acc.l[1].min(t.l[1]),
                acc.l[2].min(t.l[2]),
            ],
            r: [
                acc.r[0].max(t.r[0]),
                acc.r[1].max(t.r[1]),
                acc.r[2].max(t.r[2]),
            ],
        }))
    }

    /// How far the tile sticks out of `clip` on the low and high side of each axis.
    pub fn overhang(&self, clip: &Tile) -> ([i64; 3], [i64; 3]) {
        let mut low = [0; 3];
        let mut high = [0; 3];
        for axis in 0..3 {
            low[axis] = (clip.l[axis] - self.l[axis]).max(0);
            high[axis] = (self.r[axis] - clip.r[axis]).max(0);
        }
        (low, high)
    }

    /// Clip the tile to `clip`, reflecting any overhang inward.
    ///
    /// Returns `(inner, outer)`: `inner` is the tile clipped to `clip`; `outer` is the tile
    /// padded by its overhang on both sides, then clipped. A region that loses voxels past an
    /// edge therefore gains the same amount of context on the opposite side, which keeps the
    /// rendering support of `inner` intact.
    pub fn reflect_overhang(&self, clip: &Tile) -> (Tile, Tile) {
        let (low, high) = self.overhang(clip);
        let padded = self.pad(low).pad(high);
        (self.intersection(clip), padded.intersection(clip))
    }

    /// Whether two tiles share at least one voxel.
    pub fn overlaps(&self, other: &Tile) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Whether the voxel index lies inside the tile.
    pub fn contains(&self, index: [i64; 3]) -> bool {
        (0..3).all(|axis| index[axis] >= self.l[axis] && index[axis] < self.r[axis])
    }

    /// Per-axis index ranges, clamped at zero. Used to slice `ndarray` volumes.
    pub fn ranges(&self) -> [Range<usize>; 3] {
        let to_range = |axis: usize| {
            let lo = self.l[axis].max(0) as usize;
            let hi = self.r[axis].max(self.l[axis]).max(0) as usize;
            lo..hi
        };
        [to_range(0), to_range(1), to_range(2)]
    }

    /// Borrow the part of `volume` covered by the tile.
    ///
    /// The tile must lie inside the volume; callers clip with [`Tile::intersection`] first.
    pub fn view<'a, T>(&self, volume: &'a Array3<T>) -> ArrayView3<'a, T> {
        let [r0, r1, r2] = self.ranges();
        volume.slice(s![r0, r1, r2])
    }

    pub fn view_mut<'a, T>(&self, volume: &'a mut Array3<T>) -> ArrayViewMut3<'a, T> {
        let [r0, r1, r2] = self.ranges();
        volume.slice_mut(s![r0, r1, r2])
    }

    /// Convert a flat row-major offset inside the tile to an absolute voxel index.
    pub fn unravel(&self, flat: usize) -> [usize; 3] {
        let shape = self.shape();
        let (n1, n2) = (shape[1] as usize, shape[2] as usize);
        let i0 = flat / (n1 * n2);
        let rem = flat % (n1 * n2);
        [
            self.l[0] as usize + i0,
            self.l[1] as usize + rem / n2,
            self.l[2] as usize + rem % n2,
        ]
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tile [{}, {}, {}] -> [{}, {}, {}]",
            self.l[0], self.l[1], self.l[2], self.r[0], self.r[1], self.r[2]
        )
    }
}

/// Regions involved in re-rendering part of the model image.
///
/// `outer` is rendered from scratch, then the sub-box `io` of that buffer (which is `inner` in
/// the buffer's local coordinates) is written over `inner` in the model image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateTiles {
    pub outer: Tile,
    pub inner: Tile,
    pub io: Tile,
}

impl UpdateTiles {
    /// Build the update regions for a changed region `tile` whose rendering needs `pad`
    /// voxels of context, inside a volume of `shape`.
    pub fn for_region(tile: &Tile, pad: [i64; 3], shape: [usize; 3]) -> Self {
        let image = Tile::from_shape(shape);
        let padded = tile.pad(pad);
        let (inner, outer) = padded.reflect_overhang(&image);
        let io = inner.translate([-outer.l[0], -outer.l[1], -outer.l[2]]);
        Self { outer, inner, io }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_and_size() {
        let tile = Tile::new([1, 2, 3], [4, 6, 8]);
        assert_eq!(tile.shape(), [3, 4, 5]);
        assert_eq!(tile.size(), 60);
        assert!(!tile.is_empty());
    }

    #[test]
    fn test_disjoint_intersection_is_empty() {
        let a = Tile::new([0, 0, 0], [2, 2, 2]);
        let b = Tile::new([3, 0, 0], [5, 2, 2]);
        assert!(a.intersection(&b).is_empty());
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_bounding_tile() {
        let tiles = [
            Tile::new([0, 5, 2], [3, 6, 4]),
            Tile::new([-1, 1, 3], [2, 9, 5]),
        ];
        let bound = Tile::bounding(&tiles).unwrap();
        assert_eq!(bound, Tile::new([-1, 1, 2], [3, 9, 5]));
        assert!(Tile::bounding(&[]).is_none());
    }

    #[test]
    fn test_reflect_overhang_at_low_edge() {
        let image = Tile::from_shape([10, 10, 10]);
        let tile = Tile::new([-2, 3, 3], [3, 6, 6]);
        let (inner, outer) = tile.reflect_overhang(&image);
        assert_eq!(inner, Tile::new([0, 3, 3], [3, 6, 6]));
        // Two voxels of overhang on the low side are mirrored onto the high side.
        assert_eq!(outer, Tile::new([0, 3, 3], [5, 6, 6]));
    }

    #[test]
    fn test_reflect_overhang_inside_is_identity() {
        let image = Tile::from_shape([10, 10, 10]);
        let tile = Tile::new([2, 2, 2], [5, 5, 5]);
        let (inner, outer) = tile.reflect_overhang(&image);
        assert_eq!(inner, tile);
        assert_eq!(outer, tile);
    }

    #[test]
    fn test_update_tiles_io_is_local() {
        let tiles = UpdateTiles::for_region(&Tile::new([4, 4, 4], [6, 6, 6]), [1, 1, 1], [12, 12, 12]);
        assert_eq!(tiles.outer, Tile::new([3, 3, 3], [7, 7, 7]));
        assert_eq!(tiles.inner, tiles.outer);
        assert_eq!(tiles.io, Tile::new([0, 0, 0], [4, 4, 4]));
    }

    #[test]
    fn test_view_and_unravel_agree() {
        let mut volume = Array3::<f64>::zeros((4, 5, 6));
        for ((i, j, k), v) in volume.indexed_iter_mut() {
            *v = (100 * i + 10 * j + k) as f64;
        }
        let tile = Tile::new([1, 2, 3], [3, 4, 6]);
        let view = tile.view(&volume);
        for (flat, value) in view.iter().enumerate() {
            let [i, j, k] = tile.unravel(flat);
            assert_eq!(*value, volume[[i, j, k]]);
        }
    }
}
