//! Face and vertex normal derivation.
//!
//! Normals follow triangle winding. Degenerate triangles get a zero face
//! normal and contribute nothing to vertex normals.

use config::constants::DEGENERATE_AREA_EPSILON;
use glam::DVec3;

use super::{Mesh, Triangle};
use crate::attribute::{Attribute, AttributeStandard};

/// Unit normal of a triangle, zero when degenerate.
#[inline]
pub(crate) fn face_normal(a: DVec3, b: DVec3, c: DVec3) -> DVec3 {
    let n = (b - a).cross(c - a);
    if n.length_squared() <= DEGENERATE_AREA_EPSILON {
        DVec3::ZERO
    } else {
        n.normalize()
    }
}

/// Area-weighted vertex normals over `positions`.
///
/// Returns the normals and the number of degenerate triangles skipped.
pub(crate) fn vertex_normals(positions: &[DVec3], triangles: &[Triangle]) -> (Vec<DVec3>, usize) {
    let mut normals = vec![DVec3::ZERO; positions.len()];
    let mut degenerate = 0;

    for tri in triangles {
        let [a, b, c] = tri.v.map(|v| positions[v as usize]);
        // Unnormalized cross product weights by area.
        let n = (b - a).cross(c - a);
        if n.length_squared() <= DEGENERATE_AREA_EPSILON {
            degenerate += 1;
            continue;
        }
        for v in tri.v {
            normals[v as usize] += n;
        }
    }

    for n in &mut normals {
        *n = n.normalize_or_zero();
    }
    (normals, degenerate)
}

impl Mesh {
    /// Recomputes the per-triangle geometric normals.
    pub fn add_face_normals(&mut self) {
        if self.triangles.is_empty() {
            return;
        }
        let normals: Vec<DVec3> = self
            .triangles
            .iter()
            .map(|tri| {
                let [a, b, c] = tri.v.map(|v| self.vertices[v as usize]);
                face_normal(a, b, c)
            })
            .collect();

        let attr = self.add_attribute(AttributeStandard::FaceNormal);
        if let Some(values) = attr.vectors_mut() {
            values.copy_from_slice(&normals);
        }
    }

    /// Computes smooth vertex normals unless they already exist, plus
    /// per-step normals for motion blurred meshes.
    pub fn add_vertex_normals(&mut self) {
        if self.vertices.is_empty() {
            return;
        }

        if self.attributes.find_std(AttributeStandard::VertexNormal).is_none() {
            let (normals, degenerate) = vertex_normals(&self.vertices, &self.triangles);
            if degenerate > 0 {
                log::debug!("{}: {} degenerate triangles skipped for normals", self.name, degenerate);
            }
            let attr = self.add_attribute(AttributeStandard::VertexNormal);
            if let Some(values) = attr.vectors_mut() {
                values.copy_from_slice(&normals);
            }
        }

        if !self.has_motion_blur()
            || self
                .attributes
                .find_std(AttributeStandard::MotionVertexNormal)
                .is_some()
        {
            return;
        }
        let Some(motion) = self
            .attributes
            .find_std(AttributeStandard::MotionVertexPosition)
            .and_then(Attribute::vectors)
        else {
            return;
        };

        let verts = self.vertices.len();
        let mut step_normals = Vec::with_capacity(motion.len());
        for step in motion.chunks_exact(verts) {
            step_normals.extend(vertex_normals(step, &self.triangles).0);
        }

        let attr = self.add_attribute(AttributeStandard::MotionVertexNormal);
        if let Some(values) = attr.vectors_mut() {
            if values.len() == step_normals.len() {
                values.copy_from_slice(&step_normals);
            }
        }
    }
}
