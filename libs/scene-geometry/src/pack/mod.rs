//! # Device Packer
//!
//! Flattens one mesh into its slice of the scene-wide device buffers.
//!
//! Every function writes only into the slices it is given, which the
//! manager carves out of the shared buffers with `split_at_mut`, so meshes
//! pack in parallel without locking. Packing is idempotent: running it
//! twice over the same mesh writes the same bytes.
//!
//! Positions and normals are narrowed from f64 to f32 here and nowhere
//! else.

use bytemuck::{Pod, Zeroable};
use glam::DVec3;

use crate::attribute::{Attribute, AttributeStandard};
use crate::mesh::{vertex_normals, Mesh, NO_VERTEX};
use crate::scene::ShaderTable;

/// Four packed floats, `w` carries the payload noted per buffer.
pub type Float4 = [f32; 4];

/// Packed curve record.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct PackedCurve {
    /// First key in the scene-wide key buffer
    pub first_key: u32,
    /// Number of keys
    pub num_keys: u32,
    /// Device shader id
    pub shader: u32,
    /// Padding to 16 bytes
    pub pad: u32,
}

/// Packed subdivision patch record.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct PackedPatch {
    /// Scene-wide vertex indices, `v[3] == NO_VERTEX` for triangles
    pub v: [u32; 4],
    /// Global shader index
    pub shader: u32,
    /// Padding to 32 bytes
    pub pad: [u32; 3],
}

#[inline]
fn float4(p: DVec3, w: f32) -> Float4 {
    [p.x as f32, p.y as f32, p.z as f32, w]
}

impl Mesh {
    /// Writes three positions per triangle and the vertex index record.
    ///
    /// `tri_verts` holds `3 * triangle_count()` entries and `tri_vindex`
    /// `triangle_count()` entries. The fourth index is the position of the
    /// triangle's first entry in the scene-wide `tri_verts` buffer.
    pub fn pack_verts(&self, tri_verts: &mut [Float4], tri_vindex: &mut [[u32; 4]], vert_offset: usize) {
        let offset = vert_offset as u32;
        let first = self.tri_offset as u32 * 3;

        for (i, ((tri, verts), vindex)) in self
            .triangles
            .iter()
            .zip(tri_verts.chunks_exact_mut(3))
            .zip(tri_vindex.iter_mut())
            .enumerate()
        {
            for (dst, &v) in verts.iter_mut().zip(&tri.v) {
                *dst = float4(self.vertices[v as usize], 0.0);
            }
            *vindex = [
                tri.v[0] + offset,
                tri.v[1] + offset,
                tri.v[2] + offset,
                first + i as u32 * 3,
            ];
        }
    }

    /// Writes the device shader id of every triangle and the normal of
    /// every vertex.
    ///
    /// Normals come from the vertex normal attribute, computed on the fly
    /// when it is missing. Meshes baked with a mirroring transform store
    /// winding-consistent normals, which are flipped back here.
    pub fn pack_normals(&self, shaders: &ShaderTable, tri_shader: &mut [u32], vnormal: &mut [Float4]) {
        // Triangles sharing a shader slot are common; cache the last lookup.
        let mut last: Option<(u32, bool, u32)> = None;
        for (tri, dst) in self.triangles.iter().zip(tri_shader.iter_mut()) {
            *dst = match last {
                Some((slot, smooth, id)) if slot == tri.shader && smooth == tri.smooth => id,
                _ => {
                    let id = shaders.device_shader_id(self.shader_for_slot(tri.shader), tri.smooth);
                    last = Some((tri.shader, tri.smooth, id));
                    id
                }
            };
        }

        let computed;
        let normals = match self
            .attributes
            .find_std(AttributeStandard::VertexNormal)
            .and_then(Attribute::vectors)
        {
            Some(normals) => normals,
            None => {
                log::debug!("{}: packing without vertex normals, deriving them", self.name);
                computed = vertex_normals(&self.vertices, &self.triangles).0;
                computed.as_slice()
            }
        };

        let flip = if self.transform_negative_scaled { -1.0 } else { 1.0 };
        for (dst, &n) in vnormal.iter_mut().zip(normals) {
            *dst = float4(n * flip, 0.0);
        }
    }

    /// Writes curve keys (position and radius) and curve records.
    pub fn pack_curves(
        &self,
        shaders: &ShaderTable,
        curve_keys: &mut [Float4],
        curves: &mut [PackedCurve],
        curvekey_offset: usize,
    ) {
        for (dst, key) in curve_keys.iter_mut().zip(&self.curve_keys) {
            *dst = float4(key.position, key.radius as f32);
        }
        for (dst, curve) in curves.iter_mut().zip(&self.curves) {
            *dst = PackedCurve {
                first_key: curve.first_key + curvekey_offset as u32,
                num_keys: curve.num_keys,
                shader: shaders.device_shader_id(self.shader_for_slot(curve.shader), false),
                pad: 0,
            };
        }
    }

    /// Writes subdivision patch records with scene-wide vertex indices.
    pub fn pack_patches(&self, patches: &mut [PackedPatch], vert_offset: usize) {
        let offset = vert_offset as u32;
        for (dst, patch) in patches.iter_mut().zip(&self.patches) {
            *dst = PackedPatch {
                v: patch.v.map(|v| if v == NO_VERTEX { NO_VERTEX } else { v + offset }),
                shader: self.shader_for_slot(patch.shader),
                pad: [0; 3],
            };
        }
    }
}

#[cfg(test)]
mod tests;
