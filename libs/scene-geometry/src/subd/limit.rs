//! # Smooth Subdivision Limit Data
//!
//! Bicubic B-spline control grids for Catmull-Clark patches.
//!
//! Around regular vertices (valence four) the Catmull-Clark limit surface of
//! a quad is exactly the uniform bicubic B-spline over its 4x4 neighbourhood,
//! which is what each [`ControlGrid`] holds:
//!
//! ```text
//!   g[3][0] g[3][1] g[3][2] g[3][3]
//!   g[2][0]  p3 ----- p2    g[2][3]
//!   g[1][0]  p0 ----- p1    g[1][3]
//!   g[0][0] g[0][1] g[0][2] g[0][3]
//! ```
//!
//! Missing neighbours (mesh boundary, triangles) are replaced by reflecting
//! the patch across the open edge. Corners of irregular vertices use a
//! parallelogram estimate, which approximates the limit surface there.
//!
//! Shared patch edges and vertices are evaluated from one canonical source
//! (the first patch that owns them) so adjacent patches dice to identical
//! boundary positions.

use std::collections::HashMap;

use glam::{DVec2, DVec3};

use crate::bounds::BoundBox;
use crate::mesh::{Mesh, Patch, SubdivisionType};

/// Grid slots (row, column) beyond each edge, at its start and end corner.
const EDGE_SLOTS: [[(usize, usize); 2]; 4] = [
    [(0, 1), (0, 2)],
    [(1, 3), (2, 3)],
    [(3, 2), (3, 1)],
    [(2, 0), (1, 0)],
];

/// Grid slot diagonal to each patch corner.
const CORNER_SLOTS: [(usize, usize); 4] = [(0, 0), (0, 3), (3, 3), (3, 0)];

/// Grid slot of each patch corner.
const PATCH_SLOTS: [(usize, usize); 4] = [(1, 1), (1, 2), (2, 2), (2, 1)];

/// Patch uv of each quad corner.
const CORNER_UV: [DVec2; 4] = [
    DVec2::new(0.0, 0.0),
    DVec2::new(1.0, 0.0),
    DVec2::new(1.0, 1.0),
    DVec2::new(0.0, 1.0),
];

/// Uniform cubic B-spline basis at `t`.
#[inline]
fn bspline_weights(t: f64) -> [f64; 4] {
    let s = 1.0 - t;
    let t2 = t * t;
    let t3 = t2 * t;
    [
        s * s * s / 6.0,
        (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
        (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
        t3 / 6.0,
    ]
}

/// Evaluates a cubic B-spline curve segment.
#[inline]
pub(crate) fn eval_curve(points: &[DVec3; 4], t: f64) -> DVec3 {
    let w = bspline_weights(t);
    points[0] * w[0] + points[1] * w[1] + points[2] * w[2] + points[3] * w[3]
}

// =============================================================================
// CONTROL GRID
// =============================================================================

/// 4x4 bicubic B-spline control points of one quad patch, `points[row][col]`
/// with rows along v and columns along u.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlGrid {
    /// Control points
    pub points: [[DVec3; 4]; 4],
}

impl ControlGrid {
    /// Surface position at patch uv.
    pub fn evaluate(&self, uv: DVec2) -> DVec3 {
        let wu = bspline_weights(uv.x);
        let wv = bspline_weights(uv.y);
        let mut p = DVec3::ZERO;
        for (row, &wr) in self.points.iter().zip(&wv) {
            let mut acc = DVec3::ZERO;
            for (point, &wc) in row.iter().zip(&wu) {
                acc += *point * wc;
            }
            p += acc * wr;
        }
        p
    }

    /// Bounds of the control points, which contain the surface.
    pub fn bounds(&self) -> BoundBox {
        BoundBox::from_points(self.points.iter().flatten())
    }

    /// Boundary curve of edge `k`, oriented from corner `k` to `k + 1`.
    fn edge_curve(&self, k: usize) -> [DVec3; 4] {
        let g = &self.points;
        let strip = |a: DVec3, b: DVec3, c: DVec3| (a + b * 4.0 + c) / 6.0;
        match k {
            0 => [0, 1, 2, 3].map(|i| strip(g[0][i], g[1][i], g[2][i])),
            1 => [0, 1, 2, 3].map(|j| strip(g[j][1], g[j][2], g[j][3])),
            2 => [3, 2, 1, 0].map(|i| strip(g[1][i], g[2][i], g[3][i])),
            _ => [3, 2, 1, 0].map(|j| strip(g[j][0], g[j][1], g[j][2])),
        }
    }
}

// =============================================================================
// LIMIT DATA
// =============================================================================

/// Cached smooth subdivision data for a mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitData {
    grids: Vec<Option<ControlGrid>>,
    edge_curves: HashMap<(u32, u32), [DVec3; 4]>,
    vertex_limits: HashMap<u32, DVec3>,
}

impl LimitData {
    /// Builds control grids for every quad patch.
    pub fn build(vertices: &[DVec3], patches: &[Patch]) -> Self {
        let mut edges: HashMap<(u32, u32), (usize, usize)> =
            HashMap::with_capacity(patches.len() * 4);
        for (index, patch) in patches.iter().enumerate().filter(|(_, p)| p.is_quad()) {
            for k in 0..4 {
                edges.insert((patch.v[k], patch.v[(k + 1) % 4]), (index, k));
            }
        }

        let mut data = LimitData {
            grids: Vec::with_capacity(patches.len()),
            ..Default::default()
        };

        for patch in patches {
            if !patch.is_quad() {
                data.grids.push(None);
                continue;
            }
            let grid = control_grid(vertices, patches, &edges, patch);

            for k in 0..4 {
                let (a, b) = (patch.v[k], patch.v[(k + 1) % 4]);
                let key = (a.min(b), a.max(b));
                data.edge_curves.entry(key).or_insert_with(|| {
                    let mut curve = grid.edge_curve(k);
                    if a > b {
                        curve.reverse();
                    }
                    curve
                });
                data.vertex_limits
                    .entry(a)
                    .or_insert_with(|| grid.evaluate(CORNER_UV[k]));
            }
            data.grids.push(Some(grid));
        }
        data
    }

    /// Control grid of a patch, `None` for triangles.
    pub fn grid(&self, patch: usize) -> Option<&ControlGrid> {
        self.grids.get(patch).and_then(Option::as_ref)
    }

    /// Number of patches covered.
    pub fn len(&self) -> usize {
        self.grids.len()
    }

    /// True when no patch is covered.
    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }

    /// Limit position of a coarse vertex.
    pub(crate) fn vertex_limit(&self, vertex: u32) -> Option<DVec3> {
        self.vertex_limits.get(&vertex).copied()
    }

    /// Limit position on the edge between coarse vertices `lo < hi` at
    /// parameter `s` measured from `lo`.
    pub(crate) fn edge_limit(&self, lo: u32, hi: u32, s: f64) -> Option<DVec3> {
        self.edge_curves.get(&(lo, hi)).map(|curve| eval_curve(curve, s))
    }
}

/// Gathers the 4x4 neighbourhood of a quad patch.
fn control_grid(
    vertices: &[DVec3],
    patches: &[Patch],
    edges: &HashMap<(u32, u32), (usize, usize)>,
    patch: &Patch,
) -> ControlGrid {
    let c = patch.v;
    let pos = |v: u32| vertices[v as usize];
    let mut g: [[Option<DVec3>; 4]; 4] = [[None; 4]; 4];

    for (k, &(row, col)) in PATCH_SLOTS.iter().enumerate() {
        g[row][col] = Some(pos(c[k]));
    }

    // Vertices across each edge: (beyond start corner, beyond end corner).
    let mut across: [Option<(u32, u32)>; 4] = [None; 4];
    for k in 0..4 {
        let (a, b) = (c[k], c[(k + 1) % 4]);
        if let Some(&(index, m)) = edges.get(&(b, a)) {
            let n = patches[index].v;
            across[k] = Some((n[(m + 2) % 4], n[(m + 3) % 4]));
            let [(r0, c0), (r1, c1)] = EDGE_SLOTS[k];
            g[r0][c0] = Some(pos(n[(m + 2) % 4]));
            g[r1][c1] = Some(pos(n[(m + 3) % 4]));
        }
    }

    // Regular corners: the quad across the edge to the vertex beyond the
    // corner closes the one-ring when its far side meets the previous edge.
    for k in 0..4 {
        let prev = (k + 3) % 4;
        let (Some((beyond, _)), Some((_, expected))) = (across[k], across[prev]) else {
            continue;
        };
        if let Some(&(index, n)) = edges.get(&(beyond, c[k])) {
            let d = patches[index].v;
            if d[(n + 2) % 4] == expected {
                let (row, col) = CORNER_SLOTS[k];
                g[row][col] = Some(pos(d[(n + 3) % 4]));
            }
        }
    }

    // Open edges reflect the patch across the edge.
    for k in 0..4 {
        if across[k].is_some() {
            continue;
        }
        for &(row, col) in &EDGE_SLOTS[k] {
            let (own, inner) = reflect_sources(row, col);
            g[row][col] = Some(reflect(&g, own, inner));
        }
    }

    // Remaining corners.
    for (k, &(row, col)) in CORNER_SLOTS.iter().enumerate() {
        if g[row][col].is_some() {
            continue;
        }
        let dr: isize = if row == 0 { 1 } else { -1 };
        let dc: isize = if col == 0 { 1 } else { -1 };
        let step = |i: usize, d: isize| (i as isize + d) as usize;
        let h1 = (row, step(col, dc));
        let h2 = (row, step(col, 2 * dc));
        let v1 = (step(row, dr), col);
        let v2 = (step(row, 2 * dr), col);

        // Corner k touches edge k and edge k - 1; which of them is the
        // row edge depends on the corner.
        let (row_edge, col_edge) = if k % 2 == 0 { (k, (k + 3) % 4) } else { ((k + 3) % 4, k) };
        let value = if across[col_edge].is_none() {
            reflect(&g, h1, h2)
        } else if across[row_edge].is_none() {
            reflect(&g, v1, v2)
        } else {
            let d = (step(row, dr), step(col, dc));
            get(&g, h1) + get(&g, v1) - get(&g, d)
        };
        g[row][col] = Some(value);
    }

    ControlGrid {
        points: g.map(|row| row.map(|p| p.unwrap_or(DVec3::ZERO))),
    }
}

#[inline]
fn get(g: &[[Option<DVec3>; 4]; 4], (row, col): (usize, usize)) -> DVec3 {
    g[row][col].unwrap_or(DVec3::ZERO)
}

#[inline]
fn reflect(g: &[[Option<DVec3>; 4]; 4], own: (usize, usize), inner: (usize, usize)) -> DVec3 {
    get(g, own) * 2.0 - get(g, inner)
}

/// For a slot on the outer ring, the adjacent patch slot and the one past it.
fn reflect_sources(row: usize, col: usize) -> ((usize, usize), (usize, usize)) {
    match (row, col) {
        (0, c) => ((1, c), (2, c)),
        (3, c) => ((2, c), (1, c)),
        (r, 0) => ((r, 1), (r, 2)),
        (r, _) => ((r, 2), (r, 1)),
    }
}

impl Mesh {
    /// Rebuilds the smooth subdivision data. Only Catmull-Clark meshes
    /// with patches keep any.
    pub fn update_limit_data(&mut self) {
        self.limit_data = if self.subdivision_type == SubdivisionType::CatmullClark
            && !self.patches.is_empty()
        {
            Some(LimitData::build(&self.vertices, &self.patches))
        } else {
            None
        };
    }

    /// Drops the smooth subdivision data.
    pub fn free_limit_data(&mut self) {
        self.limit_data = None;
    }
}
