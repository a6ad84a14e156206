//! # Subdivision Dicing
//!
//! Turns coarse patches into triangles in two phases.
//!
//! 1. **Split**: a [`SplitService`] chooses per-edge tessellation factors and
//!    the core stores the resulting [`SubPatch`] values.
//! 2. **Dice**: every subpatch becomes a grid of triangles whose boundary
//!    rows match the edge factors exactly, so neighbours sharing an edge with
//!    the same factor produce the same boundary vertices.
//!
//! Dicing follows a size-then-fill contract:
//!
//! ```rust,ignore
//! let size = mesh.diced_subpatch_size(id);
//! let mut diced = TessellatedSubPatch::with_size(size);
//! mesh.dice_subpatch(&mut diced, id)?;
//! assert!(diced.is_complete());
//! ```
//!
//! ## Edge numbering
//!
//! Edge `k` of a subpatch runs from corner `k` to corner `k + 1`. Quad
//! corners sit at patch uv `(0,0) (1,0) (1,1) (0,1)`, triangle corners at
//! `(0,0) (1,0) (0,1)`.

mod dice;
mod limit;
mod split;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::bounds::BoundBox;
use crate::error::{GeometryError, GeometryResult};
use crate::mesh::{Mesh, Patch};

pub use dice::TessellatedSubPatch;
pub use limit::{ControlGrid, LimitData};
pub use split::{EdgeLengthSplit, PatchGeometry, SplitService, SubPatchRequest};

/// Edge factor marking the unused fourth edge of a triangular subpatch.
pub const TRIANGLE_EDGE: i32 = -1;

// =============================================================================
// SUBPATCH
// =============================================================================

/// A region of a patch with per-edge tessellation factors.
///
/// Equality compares the parent patch, the edge factors and the corner uvs.
/// Bounds are derived data and ignored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubPatch {
    /// Parent patch index
    pub patch: u32,
    /// Segments per edge; `edge_factors[3] == -1` marks a triangle
    pub edge_factors: [i32; 4],
    /// Corner coordinates in patch uv space
    pub uv: [DVec2; 4],
    /// Bounds of the diced surface
    pub bounds: BoundBox,
}

impl PartialEq for SubPatch {
    fn eq(&self, other: &Self) -> bool {
        self.patch == other.patch && self.edge_factors == other.edge_factors && self.uv == other.uv
    }
}

impl SubPatch {
    /// Creates a quad subpatch.
    pub fn quad(patch: u32, uv: [DVec2; 4], edge_factors: [i32; 4]) -> Self {
        Self {
            patch,
            edge_factors,
            uv,
            bounds: BoundBox::EMPTY,
        }
    }

    /// Creates a triangular subpatch.
    pub fn triangle(patch: u32, uv: [DVec2; 3], edge_factors: [i32; 3]) -> Self {
        Self {
            patch,
            edge_factors: [edge_factors[0], edge_factors[1], edge_factors[2], TRIANGLE_EDGE],
            uv: [uv[0], uv[1], uv[2], DVec2::ZERO],
            bounds: BoundBox::EMPTY,
        }
    }

    /// True for four-sided subpatches.
    #[inline]
    pub fn is_quad(&self) -> bool {
        self.edge_factors[3] != TRIANGLE_EDGE
    }

    /// Number of corners, 3 or 4.
    #[inline]
    pub fn num_corners(&self) -> usize {
        if self.is_quad() {
            4
        } else {
            3
        }
    }

    /// Grows `bounds` by the subpatch bounds.
    pub fn bounds_grow(&self, bounds: &mut BoundBox) {
        bounds.union(&self.bounds);
    }

    /// Checks edge factors and uvs against the parent patch.
    pub(crate) fn validate(&self, patch: &Patch) -> GeometryResult<()> {
        if self.is_quad() != patch.is_quad() {
            return Err(GeometryError::invalid_subpatch(format!(
                "{}-sided subpatch on {}-sided patch {}",
                self.num_corners(),
                patch.num_corners(),
                self.patch
            )));
        }
        for (edge, &factor) in self.edge_factors[..self.num_corners()].iter().enumerate() {
            if factor < 0 {
                return Err(GeometryError::InvalidEdgeFactor { edge, factor });
            }
        }
        if self.uv[..self.num_corners()].iter().any(|uv| !uv.is_finite()) {
            return Err(GeometryError::invalid_subpatch(format!(
                "non-finite uv on subpatch of patch {}",
                self.patch
            )));
        }
        Ok(())
    }
}

// =============================================================================
// DICED SIZE
// =============================================================================

/// Exact output size of dicing one subpatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DicedSize {
    /// Vertices emitted
    pub num_verts: usize,
    /// Triangles emitted
    pub num_tris: usize,
}

impl std::ops::Add for DicedSize {
    type Output = DicedSize;

    fn add(self, rhs: DicedSize) -> DicedSize {
        DicedSize {
            num_verts: self.num_verts + rhs.num_verts,
            num_tris: self.num_tris + rhs.num_tris,
        }
    }
}

impl std::iter::Sum for DicedSize {
    fn sum<I: Iterator<Item = DicedSize>>(iter: I) -> DicedSize {
        iter.fold(DicedSize::default(), |a, b| a + b)
    }
}

impl DicedSize {
    /// Output size for a set of edge factors.
    ///
    /// Quad, with `z` zero edges and inner grid `Mu = max(f0, f2, 2)`,
    /// `Mv = max(f1, f3, 2)`:
    ///
    /// ```text
    /// verts = (4 - z) + sum(max(f - 1, 0)) + (Mu - 1)(Mv - 1)
    /// tris  = sum(f) + 2(Mu - 2) + 2(Mv - 2) + 2(Mu - 2)(Mv - 2)
    /// ```
    ///
    /// Triangle, with `r = max(max(f), 3) - 3` inner lattice rows:
    ///
    /// ```text
    /// verts = (3 - z) + sum(max(f - 1, 0)) + (r + 1)(r + 2) / 2
    /// tris  = sum(f) + 3r + r^2
    /// ```
    ///
    /// All-one factors are emitted without an inner vertex (2 and 1
    /// triangles) and all-zero factors produce nothing.
    pub fn of(edge_factors: [i32; 4]) -> DicedSize {
        let quad = edge_factors[3] != TRIANGLE_EDGE;
        let n = if quad { 4 } else { 3 };
        let ef: Vec<usize> = edge_factors[..n].iter().map(|&f| f.max(0) as usize).collect();

        if ef.iter().all(|&f| f == 0) {
            return DicedSize::default();
        }
        if ef.iter().all(|&f| f == 1) {
            return DicedSize {
                num_verts: n,
                num_tris: n - 2,
            };
        }

        let zero_edges = ef.iter().filter(|&&f| f == 0).count();
        let edge_verts: usize = ef.iter().map(|&f| f.saturating_sub(1)).sum();
        let edge_segments: usize = ef.iter().sum();

        if quad {
            let mu = ef[0].max(ef[2]).max(2);
            let mv = ef[1].max(ef[3]).max(2);
            DicedSize {
                num_verts: (4 - zero_edges) + edge_verts + (mu - 1) * (mv - 1),
                num_tris: edge_segments + 2 * (mu - 2) + 2 * (mv - 2) + 2 * (mu - 2) * (mv - 2),
            }
        } else {
            let r = ef.iter().copied().max().unwrap_or(0).max(3) - 3;
            DicedSize {
                num_verts: (3 - zero_edges) + edge_verts + (r + 1) * (r + 2) / 2,
                num_tris: edge_segments + 3 * r + r * r,
            }
        }
    }
}

// =============================================================================
// MESH INTEGRATION
// =============================================================================

impl Mesh {
    /// Adds a subpatch after validating it against its parent patch.
    pub fn add_subpatch(&mut self, mut subpatch: SubPatch) -> GeometryResult<()> {
        let patch = self
            .patches
            .get(subpatch.patch as usize)
            .copied()
            .ok_or_else(|| {
                GeometryError::index("patch", subpatch.patch as usize, self.patches.len())
            })?;
        subpatch.validate(&patch)?;
        subpatch.bounds = self.subpatch_bounds(&subpatch);
        self.subpatches.push(subpatch);
        self.need_split = false;
        self.need_dice = true;
        Ok(())
    }

    /// Drops all subpatches. The next update splits the patches again.
    pub fn clear_subpatches(&mut self) {
        self.subpatches.clear();
        self.need_split = !self.patches.is_empty();
    }

    /// Output size of dicing subpatch `id`. Unknown ids dice to nothing.
    pub fn diced_subpatch_size(&self, id: usize) -> DicedSize {
        self.subpatches
            .get(id)
            .map_or(DicedSize::default(), |sub| DicedSize::of(sub.edge_factors))
    }

    /// True when patches were edited or split since the last tessellation.
    pub fn has_pending_dice(&self) -> bool {
        self.need_split || self.need_dice
    }
}

#[cfg(test)]
mod tests;
