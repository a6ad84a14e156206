//! # Patch Splitting
//!
//! The split phase asks a [`SplitService`] how each coarse patch should be
//! cut and at which rate each resulting edge is diced. The service only
//! decides; the mesh validates the answer and materializes [`SubPatch`]
//! values with their bounds.
//!
//! Requests are checked as a whole before anything is stored: an edge shared
//! by two subpatches (across patches or inside one) must carry the same
//! factor on both sides, otherwise the boundary would crack when diced.

use std::collections::HashMap;

use config::constants::{
    GeometryConfig, DEFAULT_DICING_RATE, DEGENERATE_AREA_EPSILON, MAX_EDGE_FACTOR,
};
use glam::{DVec2, DVec3};

use super::dice::PatchFrame;
use super::{SubPatch, TRIANGLE_EDGE};
use crate::bounds::BoundBox;
use crate::error::{GeometryError, GeometryResult, Stage};
use crate::mesh::{Mesh, Patch, SubdivisionType};
use crate::services::ServiceError;

// =============================================================================
// SERVICE INTERFACE
// =============================================================================

/// A coarse patch as seen by a split service.
#[derive(Debug, Clone, Copy)]
pub struct PatchGeometry<'a> {
    /// Patch index in the mesh
    pub index: u32,
    /// The patch itself
    pub patch: &'a Patch,
    /// Corner positions, the fourth is zero for triangles
    pub corners: [DVec3; 4],
    /// Subdivision scheme of the owning mesh
    pub subdivision: SubdivisionType,
}

impl PatchGeometry<'_> {
    /// Length of edge `k`, from corner `k` to corner `k + 1`.
    pub fn edge_length(&self, k: usize) -> f64 {
        let n = self.patch.num_corners();
        self.corners[k % n].distance(self.corners[(k + 1) % n])
    }

    /// Squared length of the (unnormalized) patch normal.
    fn area_squared(&self) -> f64 {
        let c = &self.corners;
        let n = if self.patch.is_quad() {
            (c[2] - c[0]).cross(c[3] - c[1])
        } else {
            (c[1] - c[0]).cross(c[2] - c[0])
        };
        n.length_squared()
    }
}

/// One subpatch the split service wants diced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubPatchRequest {
    /// Corner coordinates in patch uv space
    pub uv: [DVec2; 4],
    /// Segments per edge, `[3] == -1` for triangles
    pub edge_factors: [i32; 4],
}

impl SubPatchRequest {
    /// The whole quad patch with the given factors.
    pub fn whole_quad(edge_factors: [i32; 4]) -> Self {
        Self {
            uv: [
                DVec2::new(0.0, 0.0),
                DVec2::new(1.0, 0.0),
                DVec2::new(1.0, 1.0),
                DVec2::new(0.0, 1.0),
            ],
            edge_factors,
        }
    }

    /// The whole triangular patch with the given factors.
    pub fn whole_triangle(edge_factors: [i32; 3]) -> Self {
        Self {
            uv: [
                DVec2::new(0.0, 0.0),
                DVec2::new(1.0, 0.0),
                DVec2::new(0.0, 1.0),
                DVec2::ZERO,
            ],
            edge_factors: [edge_factors[0], edge_factors[1], edge_factors[2], TRIANGLE_EDGE],
        }
    }
}

/// Chooses subpatches and edge factors for coarse patches.
///
/// Called concurrently for different meshes, hence `Send + Sync`.
pub trait SplitService: Send + Sync {
    /// Splits one patch. An empty result leaves the patch undiced.
    fn split(&self, patch: &PatchGeometry<'_>) -> Result<Vec<SubPatchRequest>, ServiceError>;
}

// =============================================================================
// EDGE LENGTH SPLIT
// =============================================================================

/// Keeps every patch whole and dices each edge at a fixed world-space rate.
///
/// Factors depend only on the edge endpoints, so shared edges always agree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeLengthSplit {
    /// Target edge length of a diced segment
    pub dicing_rate: f64,
    /// Upper bound of any factor
    pub max_edge_factor: i32,
}

impl Default for EdgeLengthSplit {
    fn default() -> Self {
        Self::new(DEFAULT_DICING_RATE, MAX_EDGE_FACTOR)
    }
}

impl EdgeLengthSplit {
    /// Creates a splitter with the given rate and factor cap.
    pub fn new(dicing_rate: f64, max_edge_factor: i32) -> Self {
        Self {
            dicing_rate,
            max_edge_factor: max_edge_factor.max(1),
        }
    }

    /// Creates a splitter from a validated configuration.
    pub fn from_config(config: &GeometryConfig) -> Self {
        Self::new(config.dicing_rate, config.max_edge_factor)
    }

    /// Factor for an edge of the given length.
    pub fn edge_factor(&self, length: f64) -> i32 {
        if !length.is_finite() || self.dicing_rate <= 0.0 {
            return 1;
        }
        let segments = (length / self.dicing_rate).ceil();
        (segments.min(self.max_edge_factor as f64) as i32).clamp(1, self.max_edge_factor)
    }
}

impl SplitService for EdgeLengthSplit {
    fn split(&self, patch: &PatchGeometry<'_>) -> Result<Vec<SubPatchRequest>, ServiceError> {
        let factor = |k: usize| self.edge_factor(patch.edge_length(k));
        let request = if patch.patch.is_quad() {
            SubPatchRequest::whole_quad([factor(0), factor(1), factor(2), factor(3)])
        } else {
            SubPatchRequest::whole_triangle([factor(0), factor(1), factor(2)])
        };
        Ok(vec![request])
    }
}

// =============================================================================
// SHARED EDGE CHECK
// =============================================================================

/// Identity of a subpatch edge, independent of which side sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EdgeKey {
    /// Section `[s0, s1]` of the coarse edge `lo < hi`
    Coarse { lo: u32, hi: u32, s0: u64, s1: u64 },
    /// Edge strictly inside one patch, endpoints in uv order
    Interior { patch: u32, a: [u64; 2], b: [u64; 2] },
}

fn uv_bits(uv: DVec2) -> [u64; 2] {
    // Fold -0.0 into 0.0 so both sides hash alike.
    [(uv.x + 0.0).to_bits(), (uv.y + 0.0).to_bits()]
}

fn edge_key(frame: &PatchFrame<'_>, patch: u32, a: DVec2, b: DVec2) -> EdgeKey {
    match frame.shared_coarse_edge(a, b) {
        Some(e) => {
            let (lo, hi, s0, s1) = frame.coarse_edge_key(e, a, b);
            EdgeKey::Coarse {
                lo,
                hi,
                s0: (s0 + 0.0).to_bits(),
                s1: (s1 + 0.0).to_bits(),
            }
        }
        None => {
            let (a, b) = (uv_bits(a), uv_bits(b));
            let (a, b) = if a <= b { (a, b) } else { (b, a) };
            EdgeKey::Interior { patch, a, b }
        }
    }
}

// =============================================================================
// MESH INTEGRATION
// =============================================================================

impl Mesh {
    /// Replaces the subpatches with a fresh split of every patch.
    ///
    /// Degenerate patches are skipped. Nothing is stored unless every
    /// request is valid and shared edges agree. Returns the number of
    /// subpatches created.
    pub fn split_patches(&mut self, service: &dyn SplitService) -> GeometryResult<usize> {
        if self.subdivision_type == SubdivisionType::CatmullClark {
            self.update_limit_data();
        }

        let mut subpatches = Vec::new();
        let mut shared: HashMap<EdgeKey, i32> = HashMap::new();
        let mut degenerate = 0usize;

        for (index, patch) in self.patches.iter().enumerate() {
            let mut corners = [DVec3::ZERO; 4];
            for (corner, &v) in corners.iter_mut().zip(patch.corners()) {
                *corner = self.vertices[v as usize];
            }
            let geometry = PatchGeometry {
                index: index as u32,
                patch,
                corners,
                subdivision: self.subdivision_type,
            };
            if geometry.area_squared() <= DEGENERATE_AREA_EPSILON {
                degenerate += 1;
                continue;
            }

            let requests = service
                .split(&geometry)
                .map_err(|e| GeometryError::service(Stage::Split, e))?;
            let Some(frame) = PatchFrame::new(self, index) else {
                continue;
            };

            for request in requests {
                let mut sub = SubPatch {
                    patch: index as u32,
                    edge_factors: request.edge_factors,
                    uv: request.uv,
                    bounds: BoundBox::EMPTY,
                };
                sub.validate(patch)?;

                let n = sub.num_corners();
                for k in 0..n {
                    let key = edge_key(&frame, sub.patch, sub.uv[k], sub.uv[(k + 1) % n]);
                    let factor = sub.edge_factors[k];
                    if let Some(&first) = shared.get(&key) {
                        if first != factor {
                            return Err(GeometryError::MismatchedEdgeFactor {
                                patch: sub.patch,
                                first,
                                second: factor,
                            });
                        }
                    } else {
                        shared.insert(key, factor);
                    }
                }

                sub.bounds = frame.subpatch_bounds(&sub);
                subpatches.push(sub);
            }
        }

        if degenerate > 0 {
            log::debug!("{}: {} degenerate patches skipped", self.name, degenerate);
        }

        let count = subpatches.len();
        self.subpatches = subpatches;
        self.need_split = false;
        self.need_dice = true;
        Ok(count)
    }
}
