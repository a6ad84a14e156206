//! # Dicing Tests
//!
//! Size contract, boundary agreement and smooth evaluation.

use super::*;
use crate::attribute::{Attribute, AttributeStandard};
use crate::error::Stage;
use crate::mesh::{SubdivisionType, NO_VERTEX};
use crate::services::ServiceError;
use approx::assert_abs_diff_eq;
use glam::{DVec2, DVec3};

/// Returns the same requests for every patch.
struct FixedSplit(Vec<SubPatchRequest>);

impl SplitService for FixedSplit {
    fn split(&self, _patch: &PatchGeometry<'_>) -> Result<Vec<SubPatchRequest>, ServiceError> {
        Ok(self.0.clone())
    }
}

struct FailingSplit;

impl SplitService for FailingSplit {
    fn split(&self, _patch: &PatchGeometry<'_>) -> Result<Vec<SubPatchRequest>, ServiceError> {
        Err(ServiceError::new("split refused"))
    }
}

fn unit_quad(subdivision: SubdivisionType) -> Mesh {
    let mut mesh = Mesh::new("quad");
    mesh.subdivision_type = subdivision;
    for p in [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]] {
        mesh.add_vertex(DVec3::new(p[0], p[1], 0.0));
    }
    mesh.add_patch([0, 1, 2, 3], 0, true).unwrap();
    mesh
}

fn unit_triangle() -> Mesh {
    let mut mesh = Mesh::new("tri");
    mesh.subdivision_type = SubdivisionType::Linear;
    for p in [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]] {
        mesh.add_vertex(DVec3::new(p[0], p[1], 0.0));
    }
    mesh.add_patch([0, 1, 2, NO_VERTEX], 0, false).unwrap();
    mesh
}

/// Two unit quads side by side sharing the edge 1-4. The patches walk the
/// shared edge in opposite directions.
fn two_quads(subdivision: SubdivisionType) -> Mesh {
    let mut mesh = Mesh::new("pair");
    mesh.subdivision_type = subdivision;
    for y in 0..2 {
        for x in 0..3 {
            let z = if x == 1 { 0.25 * y as f64 + 0.1 } else { 0.0 };
            mesh.add_vertex(DVec3::new(x as f64, y as f64, z));
        }
    }
    mesh.add_patch([0, 1, 4, 3], 0, true).unwrap();
    mesh.add_patch([1, 2, 5, 4], 0, true).unwrap();
    mesh
}

/// 3x3 vertex grid, four quads, center vertex (index 4) raised to z = 1.
fn raised_grid(subdivision: SubdivisionType) -> Mesh {
    let mut mesh = Mesh::new("grid");
    mesh.subdivision_type = subdivision;
    for j in 0..3 {
        for i in 0..3 {
            let z = if i == 1 && j == 1 { 1.0 } else { 0.0 };
            mesh.add_vertex(DVec3::new(i as f64, j as f64, z));
        }
    }
    for j in 0..2u32 {
        for i in 0..2u32 {
            let v0 = j * 3 + i;
            mesh.add_patch([v0, v0 + 1, v0 + 4, v0 + 3], 0, true).unwrap();
        }
    }
    mesh
}

fn dice(mesh: &Mesh, id: usize) -> TessellatedSubPatch {
    let mut diced = TessellatedSubPatch::with_size(mesh.diced_subpatch_size(id));
    mesh.dice_subpatch(&mut diced, id).unwrap();
    diced
}

fn dice_factors(mut mesh: Mesh, request: SubPatchRequest) -> TessellatedSubPatch {
    mesh.split_patches(&FixedSplit(vec![request])).unwrap();
    dice(&mesh, 0)
}

fn signed_area(diced: &TessellatedSubPatch, tri: [u32; 3]) -> f64 {
    let [a, b, c] = tri.map(|i| diced.uvs[i as usize]);
    (b - a).perp_dot(c - a)
}

/// Positions on patch-space line `pred`, ordered along the line.
fn boundary(diced: &TessellatedSubPatch, pred: impl Fn(DVec2) -> bool) -> Vec<DVec3> {
    let mut points: Vec<DVec3> = diced
        .uvs
        .iter()
        .zip(&diced.positions)
        .filter(|(uv, _)| pred(**uv))
        .map(|(_, p)| *p)
        .collect();
    points.sort_by(|a, b| a.y.total_cmp(&b.y));
    points
}

// =============================================================================
// SIZE CONTRACT
// =============================================================================

#[test]
fn test_size_matches_quad_dice_output() {
    let cases = [
        [1, 1, 1, 1],
        [2, 2, 2, 2],
        [3, 1, 4, 2],
        [0, 2, 3, 1],
        [5, 5, 5, 5],
        [1, 8, 1, 8],
        [0, 0, 0, 1],
        [0, 0, 2, 2],
    ];
    for factors in cases {
        let diced = dice_factors(
            unit_quad(SubdivisionType::Linear),
            SubPatchRequest::whole_quad(factors),
        );
        assert!(diced.is_complete(), "factors {factors:?}");
        assert_eq!(diced.size(), DicedSize::of(factors));
        assert_eq!(diced.uvs.len(), diced.positions.len());
        for tri in &diced.triangles {
            assert!(tri.iter().all(|&i| (i as usize) < diced.positions.len()));
        }
    }
}

#[test]
fn test_size_matches_triangle_dice_output() {
    for factors in [[1, 1, 1], [2, 2, 2], [4, 3, 5], [0, 2, 2], [3, 3, 3], [6, 1, 2]] {
        let request = SubPatchRequest::whole_triangle(factors);
        let diced = dice_factors(unit_triangle(), request);
        assert!(diced.is_complete(), "factors {factors:?}");
        assert_eq!(diced.size(), DicedSize::of(request.edge_factors));
    }
}

#[test]
fn test_two_segment_quad_size() {
    let size = DicedSize::of([2, 2, 2, 2]);
    assert_eq!(size.num_verts, 9);
    assert_eq!(size.num_tris, 8);

    let diced = dice_factors(
        unit_quad(SubdivisionType::Linear),
        SubPatchRequest::whole_quad([2, 2, 2, 2]),
    );
    assert_eq!(diced.positions.len(), 9);
    assert_eq!(diced.triangles.len(), 8);
    assert!(diced.uvs.contains(&DVec2::new(0.5, 0.5)));
}

#[test]
fn test_special_factor_sizes() {
    assert_eq!(DicedSize::of([0, 0, 0, 0]), DicedSize::default());
    assert_eq!(
        DicedSize::of([1, 1, 1, 1]),
        DicedSize {
            num_verts: 4,
            num_tris: 2
        }
    );
    assert_eq!(
        DicedSize::of([1, 1, 1, TRIANGLE_EDGE]),
        DicedSize {
            num_verts: 3,
            num_tris: 1
        }
    );
}

#[test]
fn test_all_zero_factors_dice_nothing() {
    let diced = dice_factors(
        unit_quad(SubdivisionType::Linear),
        SubPatchRequest::whole_quad([0, 0, 0, 0]),
    );
    assert!(diced.positions.is_empty());
    assert!(diced.triangles.is_empty());
}

#[test]
fn test_all_one_factors_skip_inner_vertices() {
    let quad = dice_factors(
        unit_quad(SubdivisionType::Linear),
        SubPatchRequest::whole_quad([1, 1, 1, 1]),
    );
    assert_eq!(quad.positions.len(), 4);
    assert_eq!(quad.triangles, vec![[0, 1, 2], [0, 2, 3]]);

    let tri = dice_factors(unit_triangle(), SubPatchRequest::whole_triangle([1, 1, 1]));
    assert_eq!(tri.positions.len(), 3);
    assert_eq!(tri.triangles, vec![[0, 1, 2]]);
}

#[test]
fn test_zero_factor_aliases_end_corner() {
    let diced = dice_factors(
        unit_quad(SubdivisionType::Linear),
        SubPatchRequest::whole_quad([0, 2, 2, 2]),
    );
    assert!(diced.is_complete());
    assert!(diced.uvs.contains(&DVec2::ZERO));
    assert!(!diced.uvs.contains(&DVec2::new(1.0, 0.0)));
}

#[test]
fn test_triangles_wind_counter_clockwise() {
    let quad = dice_factors(
        unit_quad(SubdivisionType::Linear),
        SubPatchRequest::whole_quad([3, 4, 5, 2]),
    );
    for &tri in &quad.triangles {
        assert!(signed_area(&quad, tri) > 0.0, "{tri:?}");
    }

    let tri = dice_factors(unit_triangle(), SubPatchRequest::whole_triangle([2, 3, 4]));
    for &t in &tri.triangles {
        assert!(signed_area(&tri, t) > 0.0, "{t:?}");
    }
    for uv in &tri.uvs {
        assert!(uv.x + uv.y <= 1.0 + 1e-12);
    }
}

#[test]
fn test_dice_rejects_wrong_buffer_size() {
    let mut mesh = unit_quad(SubdivisionType::Linear);
    mesh.split_patches(&FixedSplit(vec![SubPatchRequest::whole_quad([2, 2, 2, 2])]))
        .unwrap();
    let mut diced = TessellatedSubPatch::with_size(DicedSize::of([1, 1, 1, 1]));
    assert!(matches!(
        mesh.dice_subpatch(&mut diced, 0),
        Err(GeometryError::InvalidSubPatch { .. })
    ));
    assert!(matches!(
        mesh.dice_subpatch(&mut diced, 7),
        Err(GeometryError::IndexOutOfRange { .. })
    ));
}

#[test]
fn test_dice_is_deterministic() {
    let mut mesh = raised_grid(SubdivisionType::CatmullClark);
    mesh.split_patches(&FixedSplit(vec![SubPatchRequest::whole_quad([3, 4, 3, 4])]))
        .unwrap();
    let first = dice(&mesh, 2);
    let second = dice(&mesh, 2);
    assert_eq!(first, second);

    let mut reused = TessellatedSubPatch::default();
    reused.reset(mesh.diced_subpatch_size(2));
    mesh.dice_subpatch(&mut reused, 2).unwrap();
    assert_eq!(first, reused);
}

// =============================================================================
// SHARED BOUNDARIES
// =============================================================================

#[test]
fn test_adjacent_patches_share_boundary_vertices() {
    for subdivision in [SubdivisionType::Linear, SubdivisionType::CatmullClark] {
        let mut mesh = two_quads(subdivision);
        let count = mesh.split_patches(&EdgeLengthSplit::new(0.3, 64)).unwrap();
        assert_eq!(count, 2);

        let left = dice(&mesh, 0);
        let right = dice(&mesh, 1);
        // Shared edge is u = 1 on the left patch and u = 0 on the right.
        let a = boundary(&left, |uv| uv.x == 1.0);
        let b = boundary(&right, |uv| uv.x == 0.0);
        assert_eq!(a.len(), 5);
        assert_eq!(a, b, "{subdivision:?}");
    }
}

#[test]
fn test_subpatches_in_one_patch_share_boundary_vertices() {
    let halves = vec![
        SubPatchRequest {
            uv: [
                DVec2::new(0.0, 0.0),
                DVec2::new(0.5, 0.0),
                DVec2::new(0.5, 1.0),
                DVec2::new(0.0, 1.0),
            ],
            edge_factors: [2, 3, 2, 1],
        },
        SubPatchRequest {
            uv: [
                DVec2::new(0.5, 0.0),
                DVec2::new(1.0, 0.0),
                DVec2::new(1.0, 1.0),
                DVec2::new(0.5, 1.0),
            ],
            edge_factors: [2, 1, 2, 3],
        },
    ];
    for subdivision in [SubdivisionType::Linear, SubdivisionType::CatmullClark] {
        let mut mesh = raised_grid(subdivision);
        mesh.split_patches(&FixedSplit(halves.clone())).unwrap();
        assert_eq!(mesh.subpatch_count(), 8);

        let left = dice(&mesh, 0);
        let right = dice(&mesh, 1);
        let a = boundary(&left, |uv| uv.x == 0.5);
        let b = boundary(&right, |uv| uv.x == 0.5);
        assert_eq!(a.len(), 4);
        assert_eq!(a, b, "{subdivision:?}");
    }
}

#[test]
fn test_shared_edge_parameters_agree_off_grid() {
    // Patch 1 walks the shared edge 1-2 backwards, so its parameters go
    // through `1 - (1 - s)`.
    let mut mesh = Mesh::new("strip");
    mesh.subdivision_type = SubdivisionType::Linear;
    for p in [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [2.0, 0.0], [2.0, 1.0]] {
        mesh.add_vertex(DVec3::new(p[0], p[1], 0.0));
    }
    mesh.add_patch([0, 1, 2, 3], 0, true).unwrap();
    mesh.add_patch([1, 4, 5, 2], 0, true).unwrap();

    let left = dice::PatchFrame::new(&mesh, 0).unwrap();
    let right = dice::PatchFrame::new(&mesh, 1).unwrap();
    let (a, b) = (DVec2::new(1.0, 0.3), DVec2::new(1.0, 0.7));
    let (c, d) = (DVec2::new(0.0, 0.3), DVec2::new(0.0, 0.7));
    let e_left = left.shared_coarse_edge(a, b).unwrap();
    let e_right = right.shared_coarse_edge(c, d).unwrap();

    assert_eq!(left.coarse_edge_key(e_left, a, b), right.coarse_edge_key(e_right, c, d));
    assert_eq!(left.eval(a), right.eval(c));
    assert_eq!(left.eval(b), right.eval(d));
}

// =============================================================================
// SMOOTH EVALUATION
// =============================================================================

#[test]
fn test_smooth_grid_pulls_raised_vertex_to_limit() {
    let split = EdgeLengthSplit::new(0.5, 64);

    let mut linear = raised_grid(SubdivisionType::Linear);
    linear.split_patches(&split).unwrap();
    let mut smooth = raised_grid(SubdivisionType::CatmullClark);
    smooth.split_patches(&split).unwrap();

    let flat = dice(&linear, 0);
    let curved = dice(&smooth, 0);
    assert_eq!(flat.size(), curved.size());
    assert_eq!(flat.uvs, curved.uvs);

    // The center is corner 2 of patch 0.
    let corner = flat
        .uvs
        .iter()
        .position(|&uv| uv == DVec2::ONE)
        .unwrap();
    assert_abs_diff_eq!(flat.positions[corner].z, 1.0, epsilon = 1e-12);
    // Regular valence-4 limit: (16 v + 4 sum(e) + sum(f)) / 36.
    assert_abs_diff_eq!(curved.positions[corner].z, 16.0 / 36.0, epsilon = 1e-12);
    assert_abs_diff_eq!(curved.positions[corner].x, 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(curved.positions[corner].y, 1.0, epsilon = 1e-12);
}

#[test]
fn test_lone_smooth_quad_matches_linear() {
    let request = SubPatchRequest::whole_quad([3, 3, 3, 3]);
    let flat = dice_factors(unit_quad(SubdivisionType::Linear), request);
    let smooth = dice_factors(unit_quad(SubdivisionType::CatmullClark), request);
    assert_eq!(flat.triangles, smooth.triangles);
    for (a, b) in flat.positions.iter().zip(&smooth.positions) {
        assert_abs_diff_eq!(a.x, b.x, epsilon = 1e-9);
        assert_abs_diff_eq!(a.y, b.y, epsilon = 1e-9);
        assert_abs_diff_eq!(a.z, b.z, epsilon = 1e-9);
    }
}

#[test]
fn test_limit_data_follows_subdivision_type() {
    let mut mesh = raised_grid(SubdivisionType::CatmullClark);
    mesh.update_limit_data();
    let limit = mesh.limit_data().unwrap();
    assert_eq!(limit.len(), 4);
    assert!(limit.grid(0).is_some());

    mesh.free_limit_data();
    assert!(mesh.limit_data().is_none());

    let mut linear = raised_grid(SubdivisionType::Linear);
    linear.update_limit_data();
    assert!(linear.limit_data().is_none());
}

// =============================================================================
// SPLIT
// =============================================================================

#[test]
fn test_edge_length_split_factors() {
    let split = EdgeLengthSplit::new(0.25, 6);
    assert_eq!(split.edge_factor(1.0), 4);
    assert_eq!(split.edge_factor(0.01), 1);
    assert_eq!(split.edge_factor(100.0), 6);
    assert_eq!(split.edge_factor(f64::NAN), 1);

    let mut mesh = unit_triangle();
    mesh.split_patches(&split).unwrap();
    // Hypotenuse is sqrt(2) long.
    assert_eq!(mesh.subpatches()[0].edge_factors, [4, 6, 4, TRIANGLE_EDGE]);
}

#[test]
fn test_split_rejects_mismatched_shared_edge() {
    let mut mesh = two_quads(SubdivisionType::Linear);
    let result = mesh.split_patches(&FixedSplit(vec![SubPatchRequest::whole_quad([1, 2, 1, 3])]));
    assert!(matches!(
        result,
        Err(GeometryError::MismatchedEdgeFactor {
            patch: 1,
            first: 2,
            second: 3
        })
    ));
    assert_eq!(mesh.subpatch_count(), 0);
    assert!(mesh.has_pending_dice());
}

#[test]
fn test_split_rejects_mismatched_inner_edge() {
    let halves = vec![
        SubPatchRequest {
            uv: [
                DVec2::new(0.0, 0.0),
                DVec2::new(0.5, 0.0),
                DVec2::new(0.5, 1.0),
                DVec2::new(0.0, 1.0),
            ],
            edge_factors: [1, 3, 1, 1],
        },
        SubPatchRequest {
            uv: [
                DVec2::new(0.5, 0.0),
                DVec2::new(1.0, 0.0),
                DVec2::new(1.0, 1.0),
                DVec2::new(0.5, 1.0),
            ],
            edge_factors: [1, 1, 1, 2],
        },
    ];
    let mut mesh = unit_quad(SubdivisionType::Linear);
    assert!(matches!(
        mesh.split_patches(&FixedSplit(halves)),
        Err(GeometryError::MismatchedEdgeFactor { .. })
    ));
}

#[test]
fn test_split_rejects_negative_factor() {
    let mut mesh = unit_quad(SubdivisionType::Linear);
    let result = mesh.split_patches(&FixedSplit(vec![SubPatchRequest::whole_quad([1, -2, 1, 1])]));
    assert!(matches!(
        result,
        Err(GeometryError::InvalidEdgeFactor { edge: 1, factor: -2 })
    ));
}

#[test]
fn test_split_rejects_wrong_patch_shape() {
    let mut mesh = unit_triangle();
    let result = mesh.split_patches(&FixedSplit(vec![SubPatchRequest::whole_quad([1, 1, 1, 1])]));
    assert!(matches!(result, Err(GeometryError::InvalidSubPatch { .. })));
}

#[test]
fn test_split_skips_degenerate_patch() {
    let mut mesh = unit_quad(SubdivisionType::Linear);
    let a = mesh.add_vertex(DVec3::new(2.0, 0.0, 0.0));
    let b = mesh.add_vertex(DVec3::new(3.0, 0.0, 0.0));
    let c = mesh.add_vertex(DVec3::new(4.0, 0.0, 0.0));
    mesh.add_patch([a, b, c, NO_VERTEX], 0, false).unwrap();

    let count = mesh.split_patches(&EdgeLengthSplit::default()).unwrap();
    assert_eq!(count, 1);
    assert_eq!(mesh.subpatches()[0].patch, 0);
}

#[test]
fn test_split_service_failure_is_reported() {
    let mut mesh = unit_quad(SubdivisionType::Linear);
    let result = mesh.split_patches(&FailingSplit);
    assert!(matches!(
        result,
        Err(GeometryError::Service {
            stage: Stage::Split,
            ..
        })
    ));
}

#[test]
fn test_add_subpatch_validates_and_bounds() {
    let mut mesh = unit_quad(SubdivisionType::Linear);
    let request = SubPatchRequest::whole_quad([2, 2, 2, 2]);
    mesh.add_subpatch(SubPatch::quad(0, request.uv, request.edge_factors))
        .unwrap();
    let sub = mesh.subpatches()[0];
    assert_eq!(sub.bounds.min, DVec3::ZERO);
    assert_eq!(sub.bounds.max, DVec3::new(1.0, 1.0, 0.0));

    assert!(mesh
        .add_subpatch(SubPatch::quad(3, request.uv, request.edge_factors))
        .is_err());
    assert!(mesh
        .add_subpatch(SubPatch::quad(0, request.uv, [1, 1, -3, 1]))
        .is_err());
}

// =============================================================================
// TESSELLATION
// =============================================================================

#[test]
fn test_tessellate_appends_after_coarse_range() {
    let mut mesh = unit_quad(SubdivisionType::Linear);
    mesh.patches[0].shader = 2;
    mesh.split_patches(&EdgeLengthSplit::new(0.5, 64)).unwrap();

    let total = mesh.tessellate().unwrap();
    assert_eq!(total, DicedSize::of([2, 2, 2, 2]));
    assert_eq!(mesh.vertex_count(), 4 + 9);
    assert_eq!(mesh.triangle_count(), 8);
    assert!(mesh.triangles().iter().all(|t| t.shader == 2 && t.smooth));
    assert!(mesh
        .triangles()
        .iter()
        .all(|t| t.v.iter().all(|&v| v >= 4)));
    assert!(!mesh.has_pending_dice());

    // Dicing again replaces the previous output.
    mesh.tessellate().unwrap();
    assert_eq!(mesh.vertex_count(), 4 + 9);
    assert_eq!(mesh.triangle_count(), 8);
}

#[test]
fn test_tessellate_fills_ptex_attributes() {
    let mut mesh = two_quads(SubdivisionType::Linear);
    mesh.add_attribute(AttributeStandard::PtexFaceId);
    mesh.add_attribute(AttributeStandard::PtexUv);
    mesh.add_attribute(AttributeStandard::VertexNormal);
    mesh.split_patches(&EdgeLengthSplit::new(2.0, 64)).unwrap();
    mesh.tessellate().unwrap();

    let faces = mesh
        .attributes()
        .find_std(AttributeStandard::PtexFaceId)
        .and_then(Attribute::floats)
        .unwrap();
    assert_eq!(faces, &[0.0, 0.0, 1.0, 1.0]);

    let uvs = mesh
        .attributes()
        .find_std(AttributeStandard::PtexUv)
        .and_then(Attribute::uvs)
        .unwrap();
    assert_eq!(uvs.len(), mesh.vertex_count());
    assert_eq!(uvs[6], DVec2::ZERO);
    assert!(mesh
        .attributes()
        .find_std(AttributeStandard::VertexNormal)
        .is_none());
}

#[test]
fn test_prepare_subdivision() {
    let mut plain = unit_quad(SubdivisionType::None);
    let size = plain.prepare_subdivision(&EdgeLengthSplit::default()).unwrap();
    assert_eq!(size, DicedSize::default());
    assert_eq!(plain.triangle_count(), 0);

    let mut mesh = unit_quad(SubdivisionType::Linear);
    assert!(mesh.has_pending_dice());
    let size = mesh.prepare_subdivision(&EdgeLengthSplit::default()).unwrap();
    assert_eq!(size.num_tris, 2);
    assert_eq!(mesh.triangle_count(), 2);
    assert!(!mesh.has_pending_dice());

    // Nothing pending, nothing to do.
    let size = mesh.prepare_subdivision(&EdgeLengthSplit::default()).unwrap();
    assert_eq!(size, DicedSize::default());
    assert_eq!(mesh.triangle_count(), 2);
}
