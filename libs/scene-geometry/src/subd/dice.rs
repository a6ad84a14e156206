//! # Subpatch Dicing
//!
//! Fills exact-sized buffers with the triangles of one subpatch and appends
//! the diced output of all subpatches to the mesh.
//!
//! A quad subpatch is an inner `(Mu - 1) x (Mv - 1)` grid of vertices plus
//! one outer row per edge. Each side is closed by stitching the outer row to
//! the nearest inner row, always advancing along the shorter diagonal:
//!
//! ```text
//!   3 ------------- 2
//!   | \  .  .  .  / |
//!   |  . ------- .  |     outer rows: edge factors
//!   |  | inner  |   |     inner grid: Mu x Mv cells
//!   |  . ------- .  |
//!   | /  .  .  .  \ |
//!   0 ------------- 1
//! ```
//!
//! Triangular subpatches use the same scheme around an inner triangular
//! lattice.

use glam::{DVec2, DVec3};
use rayon::prelude::*;

use super::limit::LimitData;
use super::{ControlGrid, DicedSize, SubPatch};
use crate::attribute::{Attribute, AttributeStandard};
use crate::bounds::BoundBox;
use crate::error::{try_reserve, GeometryError, GeometryResult};
use crate::mesh::{CoarseRange, GeometryFlags, Mesh, Patch, SubdivisionType, Triangle};

const QUAD_CORNERS: [DVec2; 4] = [
    DVec2::new(0.0, 0.0),
    DVec2::new(1.0, 0.0),
    DVec2::new(1.0, 1.0),
    DVec2::new(0.0, 1.0),
];

const TRIANGLE_CORNERS: [DVec2; 3] = [
    DVec2::new(0.0, 0.0),
    DVec2::new(1.0, 0.0),
    DVec2::new(0.0, 1.0),
];

/// Resolution of canonical edge parameters. A power of two, so dyadic
/// parameters are kept exactly.
const EDGE_PARAM_STEPS: f64 = 4_294_967_296.0;

/// Snaps an edge parameter to the canonical grid. `1 - (1 - s)` can differ
/// from `s` in the last bit, and both patches of an edge must agree.
#[inline]
fn quantize_param(s: f64) -> f64 {
    (s * EDGE_PARAM_STEPS).round() / EDGE_PARAM_STEPS
}

// =============================================================================
// OUTPUT BUFFER
// =============================================================================

/// Output of dicing one subpatch, allocated once at its exact size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TessellatedSubPatch {
    /// Vertex positions
    pub positions: Vec<DVec3>,
    /// Patch-space coordinates of each vertex
    pub uvs: Vec<DVec2>,
    /// Triangles indexing `positions`, counter-clockwise
    pub triangles: Vec<[u32; 3]>,
    size: DicedSize,
}

impl TessellatedSubPatch {
    /// Allocates a buffer for exactly `size` vertices and triangles.
    pub fn with_size(size: DicedSize) -> Self {
        Self {
            positions: Vec::with_capacity(size.num_verts),
            uvs: Vec::with_capacity(size.num_verts),
            triangles: Vec::with_capacity(size.num_tris),
            size,
        }
    }

    /// Empties the buffer and resizes it for another subpatch.
    pub fn reset(&mut self, size: DicedSize) {
        self.positions.clear();
        self.uvs.clear();
        self.triangles.clear();
        self.positions.reserve_exact(size.num_verts);
        self.uvs.reserve_exact(size.num_verts);
        self.triangles.reserve_exact(size.num_tris);
        self.size = size;
    }

    /// Size the buffer was allocated for.
    pub fn size(&self) -> DicedSize {
        self.size
    }

    /// True when the buffer holds exactly the allocated size.
    pub fn is_complete(&self) -> bool {
        self.positions.len() == self.size.num_verts && self.triangles.len() == self.size.num_tris
    }
}

// =============================================================================
// PATCH EVALUATION
// =============================================================================

/// Where a point of a subpatch lies on its coarse patch.
#[derive(Debug, Clone, Copy)]
enum Site {
    /// A coarse vertex
    Corner(u32),
    /// On the coarse edge `lo < hi`, at parameter `s` from `lo`
    Edge { lo: u32, hi: u32, s: f64 },
    /// Strictly inside the patch
    Interior,
}

/// Evaluates positions on one coarse patch.
///
/// Points on coarse vertices and edges are computed from the coarse
/// vertices alone, in vertex-id order, so every patch touching them agrees
/// to the last bit.
pub(super) struct PatchFrame<'a> {
    patch: &'a Patch,
    vertices: &'a [DVec3],
    grid: Option<&'a ControlGrid>,
    limit: Option<&'a LimitData>,
}

impl<'a> PatchFrame<'a> {
    pub(super) fn new(mesh: &'a Mesh, patch_index: usize) -> Option<Self> {
        let patch = mesh.patches.get(patch_index)?;
        let limit = match mesh.subdivision_type {
            SubdivisionType::CatmullClark => mesh.limit_data.as_ref(),
            _ => None,
        };
        Some(Self {
            patch,
            vertices: &mesh.vertices,
            grid: limit.and_then(|l| l.grid(patch_index)),
            limit,
        })
    }

    fn corners_uv(&self) -> &'static [DVec2] {
        if self.patch.is_quad() {
            &QUAD_CORNERS
        } else {
            &TRIANGLE_CORNERS
        }
    }

    #[inline]
    fn position(&self, v: u32) -> DVec3 {
        self.vertices[v as usize]
    }

    /// True when `uv` lies on coarse edge `e`.
    fn on_edge(&self, e: usize, uv: DVec2) -> bool {
        if self.patch.is_quad() {
            match e {
                0 => uv.y == 0.0,
                1 => uv.x == 1.0,
                2 => uv.y == 1.0,
                _ => uv.x == 0.0,
            }
        } else {
            match e {
                0 => uv.y == 0.0,
                1 => uv.x + uv.y == 1.0,
                _ => uv.x == 0.0,
            }
        }
    }

    /// Parameter of `uv` along coarse edge `e`, from `v[e]` to `v[e + 1]`.
    fn edge_param(&self, e: usize, uv: DVec2) -> f64 {
        if self.patch.is_quad() {
            match e {
                0 => uv.x,
                1 => uv.y,
                2 => 1.0 - uv.x,
                _ => 1.0 - uv.y,
            }
        } else {
            match e {
                0 => uv.x,
                1 => uv.y,
                _ => 1.0 - uv.y,
            }
        }
    }

    /// Inverse of [`edge_param`](Self::edge_param).
    fn edge_uv(&self, e: usize, t: f64) -> DVec2 {
        if self.patch.is_quad() {
            match e {
                0 => DVec2::new(t, 0.0),
                1 => DVec2::new(1.0, t),
                2 => DVec2::new(1.0 - t, 1.0),
                _ => DVec2::new(0.0, 1.0 - t),
            }
        } else {
            match e {
                0 => DVec2::new(t, 0.0),
                1 => DVec2::new(1.0 - t, t),
                _ => DVec2::new(0.0, 1.0 - t),
            }
        }
    }

    /// Coarse vertices of edge `e` in id order, and whether that order
    /// runs against the patch winding.
    fn edge_vertices(&self, e: usize) -> (u32, u32, bool) {
        let n = self.patch.num_corners();
        let (a, b) = (self.patch.v[e], self.patch.v[(e + 1) % n]);
        if a <= b {
            (a, b, false)
        } else {
            (b, a, true)
        }
    }

    /// Canonical parameter of `uv` on edge `e`, measured from the lower id.
    fn canonical_param(&self, e: usize, uv: DVec2) -> f64 {
        let t = self.edge_param(e, uv);
        quantize_param(if self.edge_vertices(e).2 { 1.0 - t } else { t })
    }

    /// Coarse edge both points lie on.
    pub(super) fn shared_coarse_edge(&self, a: DVec2, b: DVec2) -> Option<usize> {
        (0..self.patch.num_corners()).find(|&e| self.on_edge(e, a) && self.on_edge(e, b))
    }

    /// Canonical key of the coarse edge `e` section between `a` and `b`.
    pub(super) fn coarse_edge_key(&self, e: usize, a: DVec2, b: DVec2) -> (u32, u32, f64, f64) {
        let (lo, hi, _) = self.edge_vertices(e);
        let (sa, sb) = (self.canonical_param(e, a), self.canonical_param(e, b));
        (lo, hi, sa.min(sb), sa.max(sb))
    }

    fn classify(&self, uv: DVec2) -> Site {
        if let Some(k) = self.corners_uv().iter().position(|&c| c == uv) {
            return Site::Corner(self.patch.v[k]);
        }
        for e in 0..self.patch.num_corners() {
            if self.on_edge(e, uv) {
                let (lo, hi, _) = self.edge_vertices(e);
                return Site::Edge {
                    lo,
                    hi,
                    s: self.canonical_param(e, uv),
                };
            }
        }
        Site::Interior
    }

    /// Position strictly inside the patch.
    pub(super) fn eval_interior(&self, uv: DVec2) -> DVec3 {
        if let Some(grid) = self.grid {
            return grid.evaluate(uv);
        }
        let p = |k: usize| self.position(self.patch.v[k]);
        if self.patch.is_quad() {
            let bottom = p(0).lerp(p(1), uv.x);
            let top = p(3).lerp(p(2), uv.x);
            bottom.lerp(top, uv.y)
        } else {
            p(0) * (1.0 - uv.x - uv.y) + p(1) * uv.x + p(2) * uv.y
        }
    }

    fn eval_site(&self, site: Site, uv: DVec2) -> DVec3 {
        match site {
            Site::Corner(v) => self
                .limit
                .and_then(|l| l.vertex_limit(v))
                .unwrap_or_else(|| self.position(v)),
            Site::Edge { lo, hi, s } => self
                .limit
                .and_then(|l| l.edge_limit(lo, hi, s))
                .unwrap_or_else(|| self.position(lo).lerp(self.position(hi), s)),
            Site::Interior => self.eval_interior(uv),
        }
    }

    /// Position anywhere on the patch.
    pub(super) fn eval(&self, uv: DVec2) -> DVec3 {
        self.eval_site(self.classify(uv), uv)
    }

    /// Bounds of the surface over a subpatch.
    pub(super) fn subpatch_bounds(&self, sub: &SubPatch) -> BoundBox {
        if let Some(grid) = self.grid {
            return grid.bounds();
        }
        let corners: Vec<DVec3> = sub.uv[..sub.num_corners()]
            .iter()
            .map(|&uv| self.eval(uv))
            .collect();
        BoundBox::from_points(&corners)
    }
}

// =============================================================================
// DICER
// =============================================================================

/// Lexicographic order on uv, used to walk shared edges in one direction.
#[inline]
fn uv_less(a: DVec2, b: DVec2) -> bool {
    a.x < b.x || (a.x == b.x && a.y < b.y)
}

struct Dicer<'f, 'o> {
    frame: &'f PatchFrame<'f>,
    out: &'o mut TessellatedSubPatch,
}

impl Dicer<'_, '_> {
    fn push(&mut self, uv: DVec2, position: DVec3) -> u32 {
        let index = self.out.positions.len() as u32;
        self.out.positions.push(position);
        self.out.uvs.push(uv);
        index
    }

    fn vertex(&mut self, uv: DVec2) -> u32 {
        let position = self.frame.eval(uv);
        self.push(uv, position)
    }

    fn interior_vertex(&mut self, uv: DVec2) -> u32 {
        let position = self.frame.eval_interior(uv);
        self.push(uv, position)
    }

    fn triangle(&mut self, a: u32, b: u32, c: u32) {
        self.out.triangles.push([a, b, c]);
    }

    /// Corner vertices, with the end corner of every zero edge aliased to
    /// its start corner.
    fn corners(&mut self, uv: &[DVec2], ef: &[i32]) -> Vec<u32> {
        let n = ef.len();
        let start = (0..n).find(|&k| ef[(k + n - 1) % n] != 0).unwrap_or(0);
        let mut index = vec![0u32; n];
        for step in 0..n {
            let k = (start + step) % n;
            let prev = (k + n - 1) % n;
            index[k] = if step > 0 && ef[prev] == 0 {
                index[prev]
            } else {
                self.vertex(uv[k])
            };
        }
        index
    }

    /// Outer row of edge `a -> b` with `factor` segments, including both
    /// corners (a single point when the edge is collapsed).
    fn edge_row(&mut self, a: DVec2, b: DVec2, start: u32, end: u32, factor: i32) -> Vec<u32> {
        if factor <= 0 {
            return vec![start];
        }
        let n = factor as usize;
        let mut row = Vec::with_capacity(n + 1);
        row.push(start);

        if let Some(e) = self.frame.shared_coarse_edge(a, b) {
            // On the coarse boundary: step in the canonical parameter.
            let (_, _, lo_s, hi_s) = self.frame.coarse_edge_key(e, a, b);
            let forward = self.frame.canonical_param(e, a) <= self.frame.canonical_param(e, b);
            let (lo, hi, reversed) = self.frame.edge_vertices(e);
            for j in 1..n {
                let i = if forward { j } else { n - j };
                let s = lo_s + (hi_s - lo_s) * (i as f64 / n as f64);
                let t = if reversed { 1.0 - s } else { s };
                let uv = self.frame.edge_uv(e, t);
                let position = self.frame.eval_site(Site::Edge { lo, hi, s }, uv);
                row.push(self.push(uv, position));
            }
        } else {
            // Inside the patch: step in uv from the lexicographically smaller end.
            let forward = !uv_less(b, a);
            let (lo, hi) = if forward { (a, b) } else { (b, a) };
            for j in 1..n {
                let i = if forward { j } else { n - j };
                let uv = lo + (hi - lo) * (i as f64 / n as f64);
                row.push(self.interior_vertex(uv));
            }
        }

        row.push(end);
        row
    }

    /// Closes the band between an outer row and an inner row, both running
    /// in the same direction with the inner row on the left.
    fn stitch(&mut self, outer: &[u32], inner: &[u32]) {
        if outer.is_empty() || inner.is_empty() {
            return;
        }
        let (mut i, mut j) = (0, 0);
        while i + 1 < inner.len() || j + 1 < outer.len() {
            let v0 = inner[i];
            let v1 = outer[j];
            let advance_outer = if j + 1 == outer.len() {
                false
            } else if i + 1 == inner.len() {
                true
            } else {
                let uvs = &self.out.uvs;
                let len1 = (uvs[inner[i] as usize] - uvs[outer[j + 1] as usize]).length_squared();
                let len2 = (uvs[outer[j] as usize] - uvs[inner[i + 1] as usize]).length_squared();
                len1 < len2
            };
            let v2 = if advance_outer {
                j += 1;
                outer[j]
            } else {
                i += 1;
                inner[i]
            };
            self.triangle(v0, v1, v2);
        }
    }

    fn dice_quad(&mut self, sub: &SubPatch) {
        let ef = sub.edge_factors;
        if ef.iter().all(|&f| f == 0) {
            return;
        }
        if ef.iter().all(|&f| f == 1) {
            let c: Vec<u32> = sub.uv.iter().map(|&uv| self.vertex(uv)).collect();
            self.triangle(c[0], c[1], c[2]);
            self.triangle(c[0], c[2], c[3]);
            return;
        }

        let corners = self.corners(&sub.uv, &ef);
        let rows: Vec<Vec<u32>> = (0..4)
            .map(|k| {
                let next = (k + 1) % 4;
                self.edge_row(sub.uv[k], sub.uv[next], corners[k], corners[next], ef[k])
            })
            .collect();

        let mu = ef[0].max(ef[2]).max(2) as usize;
        let mv = ef[1].max(ef[3]).max(2) as usize;
        let local = |i: usize, j: usize| {
            let (s, t) = (i as f64 / mu as f64, j as f64 / mv as f64);
            let bottom = sub.uv[0].lerp(sub.uv[1], s);
            let top = sub.uv[3].lerp(sub.uv[2], s);
            bottom.lerp(top, t)
        };

        // Inner grid, row-major, indices (i, j) for 1 <= i < mu, 1 <= j < mv.
        let width = mu - 1;
        let mut grid = Vec::with_capacity(width * (mv - 1));
        for j in 1..mv {
            for i in 1..mu {
                grid.push(self.interior_vertex(local(i, j)));
            }
        }
        let at = |i: usize, j: usize| grid[(j - 1) * width + (i - 1)];

        let bottom: Vec<u32> = (1..mu).map(|i| at(i, 1)).collect();
        let right: Vec<u32> = (1..mv).map(|j| at(mu - 1, j)).collect();
        let top: Vec<u32> = (1..mu).rev().map(|i| at(i, mv - 1)).collect();
        let left: Vec<u32> = (1..mv).rev().map(|j| at(1, j)).collect();

        for (row, inner) in rows.iter().zip([&bottom, &right, &top, &left]) {
            self.stitch(row, inner);
        }

        for j in 1..mv - 1 {
            for i in 1..mu - 1 {
                let (a, b, c, d) = (at(i, j), at(i + 1, j), at(i + 1, j + 1), at(i, j + 1));
                self.triangle(a, b, c);
                self.triangle(a, c, d);
            }
        }
    }

    fn dice_triangle(&mut self, sub: &SubPatch) {
        let ef = [sub.edge_factors[0], sub.edge_factors[1], sub.edge_factors[2]];
        let uv = [sub.uv[0], sub.uv[1], sub.uv[2]];
        if ef.iter().all(|&f| f == 0) {
            return;
        }
        if ef.iter().all(|&f| f == 1) {
            let c: Vec<u32> = uv.iter().map(|&p| self.vertex(p)).collect();
            self.triangle(c[0], c[1], c[2]);
            return;
        }

        let corners = self.corners(&uv, &ef);
        let rows: Vec<Vec<u32>> = (0..3)
            .map(|k| {
                let next = (k + 1) % 3;
                self.edge_row(uv[k], uv[next], corners[k], corners[next], ef[k])
            })
            .collect();

        let m = ef.iter().copied().max().unwrap_or(0).max(3) as usize;
        let r = m - 3;
        let denom = (r + 3) as f64;

        // Inner lattice (b, c) with b + c <= r; a = r - b - c.
        let mut lattice = Vec::with_capacity((r + 1) * (r + 2) / 2);
        for c in 0..=r {
            for b in 0..=r - c {
                let a = r - b - c;
                let w = [
                    (a + 1) as f64 / denom,
                    (b + 1) as f64 / denom,
                    (c + 1) as f64 / denom,
                ];
                let p = uv[0] * w[0] + uv[1] * w[1] + uv[2] * w[2];
                lattice.push(self.interior_vertex(p));
            }
        }
        let row_start = |c: usize| c * (r + 1) - c * c.saturating_sub(1) / 2;
        let at = |b: usize, c: usize| lattice[row_start(c) + b];

        let inner0: Vec<u32> = (0..=r).map(|t| at(t, 0)).collect();
        let inner1: Vec<u32> = (0..=r).map(|t| at(r - t, t)).collect();
        let inner2: Vec<u32> = (0..=r).map(|t| at(0, r - t)).collect();

        for (row, inner) in rows.iter().zip([&inner0, &inner1, &inner2]) {
            self.stitch(row, inner);
        }

        for c in 0..r {
            for b in 0..r - c {
                self.triangle(at(b, c), at(b + 1, c), at(b, c + 1));
            }
            for b in 0..(r - c).saturating_sub(1) {
                self.triangle(at(b + 1, c), at(b + 1, c + 1), at(b, c + 1));
            }
        }
    }
}

// =============================================================================
// MESH INTEGRATION
// =============================================================================

impl Mesh {
    /// Dices subpatch `id` into a buffer sized by
    /// [`diced_subpatch_size`](Mesh::diced_subpatch_size).
    ///
    /// Output depends only on the subpatch, its patch and the coarse
    /// vertices, so repeated calls are bit-identical.
    pub fn dice_subpatch(&self, diced: &mut TessellatedSubPatch, id: usize) -> GeometryResult<()> {
        let sub = self
            .subpatches
            .get(id)
            .ok_or_else(|| GeometryError::index("subpatch", id, self.subpatches.len()))?;
        let expected = DicedSize::of(sub.edge_factors);
        if diced.size() != expected {
            return Err(GeometryError::invalid_subpatch(format!(
                "buffer sized for {:?}, subpatch {} needs {:?}",
                diced.size(),
                id,
                expected
            )));
        }
        let frame = PatchFrame::new(self, sub.patch as usize).ok_or_else(|| {
            GeometryError::index("patch", sub.patch as usize, self.patches.len())
        })?;

        diced.positions.clear();
        diced.uvs.clear();
        diced.triangles.clear();
        let mut dicer = Dicer {
            frame: &frame,
            out: diced,
        };
        if sub.is_quad() {
            dicer.dice_quad(sub);
        } else {
            dicer.dice_triangle(sub);
        }

        if !diced.is_complete() {
            return Err(GeometryError::invalid_subpatch(format!(
                "subpatch {id} diced to {} verts and {} tris, expected {:?}",
                diced.positions.len(),
                diced.triangles.len(),
                expected
            )));
        }
        Ok(())
    }

    /// Bounds of the surface covered by a subpatch.
    pub(crate) fn subpatch_bounds(&self, sub: &SubPatch) -> BoundBox {
        PatchFrame::new(self, sub.patch as usize)
            .map_or(BoundBox::EMPTY, |frame| frame.subpatch_bounds(sub))
    }

    /// Dices every subpatch and appends the output after the coarse
    /// geometry. A previous dice is discarded first, and displaced coarse
    /// vertices return to their base positions.
    ///
    /// Returns the total size appended.
    pub fn tessellate(&mut self) -> GeometryResult<DicedSize> {
        self.restore_undisplaced();
        self.discard_diced();
        self.coarse = Some(CoarseRange {
            verts: self.vertices.len(),
            tris: self.triangles.len(),
        });
        let coarse = self.element_counts();

        let sizes: Vec<DicedSize> = (0..self.subpatches.len())
            .map(|id| self.diced_subpatch_size(id))
            .collect();
        let total: DicedSize = sizes.iter().copied().sum();
        try_reserve(&mut self.vertices, total.num_verts, "diced vertices")?;
        try_reserve(&mut self.triangles, total.num_tris, "diced triangles")?;

        let diced = {
            let mesh = &*self;
            sizes
                .par_iter()
                .enumerate()
                .map(|(id, &size)| {
                    let mut buf = TessellatedSubPatch::with_size(size);
                    mesh.dice_subpatch(&mut buf, id)?;
                    Ok(buf)
                })
                .collect::<GeometryResult<Vec<_>>>()?
        };

        let mut ptex_uv = Vec::new();
        let mut ptex_face = Vec::new();
        for (sub, buf) in self.subpatches.iter().zip(&diced) {
            let patch = self.patches[sub.patch as usize];
            let base = self.vertices.len() as u32;
            self.vertices.extend_from_slice(&buf.positions);
            self.triangles.extend(buf.triangles.iter().map(|t| Triangle {
                v: t.map(|i| i + base),
                shader: patch.shader,
                smooth: patch.smooth,
            }));
            ptex_uv.extend_from_slice(&buf.uvs);
            ptex_face.extend(std::iter::repeat(sub.patch as f64).take(buf.triangles.len()));
        }

        let diced_counts = self.element_counts();
        self.attributes.resize(&coarse, &diced_counts);
        if let Some(values) = self
            .attributes
            .find_std_mut(AttributeStandard::PtexUv)
            .and_then(Attribute::uvs_mut)
        {
            values[coarse.verts..].copy_from_slice(&ptex_uv);
        }
        if let Some(values) = self
            .attributes
            .find_std_mut(AttributeStandard::PtexFaceId)
            .and_then(Attribute::floats_mut)
        {
            values[coarse.tris..].copy_from_slice(&ptex_face);
        }

        // Derived per-vertex data no longer matches the new vertices.
        self.attributes.remove_std(AttributeStandard::VertexNormal);
        self.attributes.remove_std(AttributeStandard::MotionVertexNormal);

        self.need_dice = false;
        if total.num_tris > 0 {
            self.geometry_flags |= GeometryFlags::TRIANGLES;
        }
        Ok(total)
    }

    /// Splits patches that changed and dices the result. No-op for meshes
    /// without subdivision.
    pub fn prepare_subdivision(
        &mut self,
        split: &dyn super::SplitService,
    ) -> GeometryResult<DicedSize> {
        if self.subdivision_type == SubdivisionType::None || self.patches.is_empty() {
            return Ok(DicedSize::default());
        }
        if self.need_split {
            self.split_patches(split)?;
        }
        if self.need_dice {
            return self.tessellate();
        }
        Ok(DicedSize::default())
    }
}
