//! True displacement of mesh vertices.

use glam::DVec3;

use crate::attribute::{Attribute, AttributeStandard};
use crate::error::{GeometryError, GeometryResult, Stage};
use crate::mesh::{vertex_normals, DisplacementMethod, Mesh};
use crate::scene::ShaderTable;
use crate::services::{DisplacementEvaluator, DisplacementRequest, DisplacementSample, ServiceError};

/// Barycentric coordinates of the three triangle corners.
const CORNER_BARYCENTRIC: [[f64; 2]; 3] = [[1.0, 0.0], [0.0, 1.0], [0.0, 0.0]];

/// True when the mesh moves its vertices with a displacement shader.
pub(super) fn needs_displacement(mesh: &Mesh, shaders: &ShaderTable) -> bool {
    mesh.displacement_method != DisplacementMethod::Bump
        && mesh
            .used_shaders
            .iter()
            .any(|&s| shaders.get(s).is_some_and(|shader| shader.has_displacement))
}

/// Displaces the vertices of one mesh. Returns true when vertices moved.
///
/// Displacement always starts from the undisplaced positions, so running
/// it on every pass does not accumulate. The mesh is only modified once the
/// evaluator succeeded.
pub(super) fn displace(
    mesh: &mut Mesh,
    shaders: &ShaderTable,
    evaluator: &dyn DisplacementEvaluator,
) -> GeometryResult<bool> {
    if !needs_displacement(mesh, shaders) || mesh.triangles.is_empty() {
        return Ok(false);
    }

    let base: Vec<DVec3> = match mesh
        .attributes
        .find_std(AttributeStandard::PositionUndisplaced)
        .and_then(Attribute::vectors)
    {
        Some(undisplaced) if undisplaced.len() == mesh.vertices.len() => undisplaced.to_vec(),
        _ => mesh.vertices.clone(),
    };
    let (normals, _) = vertex_normals(&base, &mesh.triangles);

    // Each vertex is shaded once, through the first displaced triangle using it.
    let mut assigned: Vec<Option<DisplacementSample>> = vec![None; base.len()];
    for (t, tri) in mesh.triangles.iter().enumerate() {
        let shader = mesh.shader_for_slot(tri.shader);
        if !shaders.get(shader).is_some_and(|s| s.has_displacement) {
            continue;
        }
        for (&v, barycentric) in tri.v.iter().zip(CORNER_BARYCENTRIC) {
            let slot = &mut assigned[v as usize];
            if slot.is_none() {
                *slot = Some(DisplacementSample {
                    vertex: v,
                    triangle: t as u32,
                    shader,
                    position: base[v as usize],
                    normal: normals[v as usize],
                    barycentric,
                });
            }
        }
    }
    let samples: Vec<DisplacementSample> = assigned.into_iter().flatten().collect();
    if samples.is_empty() {
        return Ok(false);
    }

    let offsets = evaluator
        .evaluate(&DisplacementRequest {
            mesh_name: &mesh.name,
            samples: &samples,
        })
        .map_err(|e| GeometryError::service(Stage::Displacement, e))?;
    if offsets.len() != samples.len() {
        return Err(GeometryError::service(
            Stage::Displacement,
            ServiceError::new(format!(
                "{} offsets returned for {} samples",
                offsets.len(),
                samples.len()
            )),
        ));
    }

    let mut positions = base.clone();
    let mut rejected = 0usize;
    for (sample, offset) in samples.iter().zip(&offsets) {
        if offset.is_finite() {
            positions[sample.vertex as usize] += *offset * mesh.displacement_scale;
        } else {
            rejected += 1;
        }
    }
    if rejected > 0 {
        log::debug!("{}: ignored {} non-finite displacement offsets", mesh.name, rejected);
    }

    mesh.vertices = positions;
    let undisplaced = mesh.add_attribute(AttributeStandard::PositionUndisplaced);
    if let Some(values) = undisplaced.vectors_mut() {
        for (dst, &p) in values.iter_mut().zip(&base) {
            *dst = p;
        }
    }

    // Normals of the undisplaced surface are stale now.
    mesh.attributes.remove_std(AttributeStandard::FaceNormal);
    mesh.add_face_normals();
    if mesh.displacement_method == DisplacementMethod::True {
        mesh.attributes.remove_std(AttributeStandard::VertexNormal);
        mesh.add_vertex_normals();
    }
    Ok(true)
}
