//! Scene-wide device buffers, mesh packing and object records.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::DMat4;
use rayon::prelude::*;

use super::attributes::OslAttributeMap;
use super::{MeshManager, PassState};
use crate::error::{try_reserve, GeometryError, GeometryResult, Stage};
use crate::mesh::Mesh;
use crate::pack::{Float4, PackedCurve, PackedPatch};
use crate::scene::Scene;
use crate::services::{DeviceBackend, DeviceBuffer};

bitflags! {
    /// Per-object bits read by the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        /// The placement is baked into the mesh vertices
        const TRANSFORM_APPLIED = 1 << 0;
        /// The baked placement mirrors the mesh
        const NEGATIVE_SCALE_APPLIED = 1 << 1;
        /// The object moves during the shutter interval
        const MOTION = 1 << 2;
        /// The mesh carries a volume shader
        const HAS_VOLUME = 1 << 3;
    }
}

/// Per-object record handed to the device.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct ObjectDeviceData {
    /// Rows of the object to world transform, identity when baked
    pub transform: [Float4; 3],
    /// First vertex of the mesh
    pub vert_offset: u32,
    /// First triangle of the mesh
    pub tri_offset: u32,
    /// First curve of the mesh
    pub curve_offset: u32,
    /// First curve key of the mesh
    pub curvekey_offset: u32,
    /// First patch of the mesh
    pub patch_offset: u32,
    /// First row of the object in the attribute map
    pub attribute_map_offset: u32,
    /// [`ObjectFlags`] bits
    pub flags: u32,
    /// Render pass index
    pub pass_id: u32,
}

/// Flattened scene buffers of the last pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceScene {
    /// Three positions per triangle
    pub tri_verts: Vec<Float4>,
    /// Vertex indices and first position per triangle
    pub tri_vindex: Vec<[u32; 4]>,
    /// Device shader id per triangle
    pub tri_shader: Vec<u32>,
    /// Normal per vertex
    pub tri_vnormal: Vec<Float4>,
    /// Curve key position and radius
    pub curve_keys: Vec<Float4>,
    /// Curve records
    pub curves: Vec<PackedCurve>,
    /// Patch records
    pub patches: Vec<PackedPatch>,
    /// Attribute addressing rows `[id, element, offset, type]`
    pub attributes_map: Vec<[u32; 4]>,
    /// Rows per object in `attributes_map`
    pub attributes_map_stride: usize,
    /// Float attribute values
    pub attributes_float: Vec<f32>,
    /// Vector and texture coordinate attribute values
    pub attributes_float3: Vec<Float4>,
    /// Name keyed attribute maps per object
    pub osl_attributes: Vec<OslAttributeMap>,
    /// Per-object records
    pub objects: Vec<ObjectDeviceData>,
    /// Some mesh has a volume shader
    pub has_volume: bool,
    /// Some mesh has a subsurface shader
    pub has_surface_bssrdf: bool,
    /// Every stage of the last pass completed
    pub ready: bool,
    pub(crate) uploaded: bool,
}

/// Clears `buf` and refills it with `len` default values.
pub(super) fn reset_buffer<T: Copy + Default>(
    buf: &mut Vec<T>,
    len: usize,
    what: &'static str,
) -> GeometryResult<()> {
    buf.clear();
    try_reserve(buf, len, what)?;
    buf.resize(len, T::default());
    Ok(())
}

/// Cuts `buf` into consecutive slices of the given lengths.
fn carve<'a, T>(buf: &'a mut [T], lens: impl Iterator<Item = usize>) -> Vec<&'a mut [T]> {
    let mut rest = buf;
    let mut out = Vec::new();
    for len in lens {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
        out.push(head);
        rest = tail;
    }
    out
}

/// One mesh's share of the device buffers.
struct MeshSlices<'a> {
    tri_verts: &'a mut [Float4],
    tri_vindex: &'a mut [[u32; 4]],
    tri_shader: &'a mut [u32],
    tri_vnormal: &'a mut [Float4],
    curve_keys: &'a mut [Float4],
    curves: &'a mut [PackedCurve],
    patches: &'a mut [PackedPatch],
}

/// Totals of the flattened buffers.
#[derive(Debug, Default, Clone, Copy)]
struct SceneTotals {
    verts: usize,
    tris: usize,
    curves: usize,
    curve_keys: usize,
    patches: usize,
}

/// Assigns each mesh its range in the scene-wide buffers.
fn mesh_calc_offset(meshes: &mut [Mesh]) -> SceneTotals {
    let mut totals = SceneTotals::default();
    for mesh in meshes {
        mesh.vert_offset = totals.verts;
        mesh.tri_offset = totals.tris;
        mesh.curve_offset = totals.curves;
        mesh.curvekey_offset = totals.curve_keys;
        mesh.patch_offset = totals.patches;

        totals.verts += mesh.vertex_count();
        totals.tris += mesh.triangle_count();
        totals.curves += mesh.curve_count();
        totals.curve_keys += mesh.curve_key_count();
        totals.patches += mesh.patch_count();
    }
    totals
}

pub(super) fn upload<T: Pod>(
    backend: &mut dyn DeviceBackend,
    buffer: DeviceBuffer,
    data: &[T],
) -> GeometryResult<()> {
    backend
        .upload(buffer, bytemuck::cast_slice(data))
        .map_err(|e| GeometryError::service(Stage::Device, e))
}

impl MeshManager {
    // -------------------------------------------------------------------------
    // Stage 3
    // -------------------------------------------------------------------------

    /// Refreshes derived data of dirty meshes, then packs every mesh into
    /// its own range of the scene buffers in parallel.
    pub(super) fn device_update_mesh(
        &mut self,
        scene: &mut Scene,
        state: &mut PassState,
    ) -> GeometryResult<()> {
        self.pool.install(|| {
            scene
                .meshes
                .par_iter_mut()
                .filter(|mesh| mesh.need_update)
                .for_each(|mesh| {
                    mesh.compute_bounds();
                    mesh.add_face_normals();
                    mesh.add_vertex_normals();
                });
        });

        let totals = mesh_calc_offset(&mut scene.meshes);
        let device = &mut self.device;
        reset_buffer(&mut device.tri_verts, totals.tris * 3, "triangle vertices")?;
        reset_buffer(&mut device.tri_vindex, totals.tris, "triangle indices")?;
        reset_buffer(&mut device.tri_shader, totals.tris, "triangle shaders")?;
        reset_buffer(&mut device.tri_vnormal, totals.verts, "vertex normals")?;
        reset_buffer(&mut device.curve_keys, totals.curve_keys, "curve keys")?;
        reset_buffer(&mut device.curves, totals.curves, "curves")?;
        reset_buffer(&mut device.patches, totals.patches, "patches")?;

        let meshes = &scene.meshes;
        let mut tri_verts = carve(&mut device.tri_verts, meshes.iter().map(|m| m.triangle_count() * 3)).into_iter();
        let mut tri_vindex = carve(&mut device.tri_vindex, meshes.iter().map(Mesh::triangle_count)).into_iter();
        let mut tri_shader = carve(&mut device.tri_shader, meshes.iter().map(Mesh::triangle_count)).into_iter();
        let mut tri_vnormal = carve(&mut device.tri_vnormal, meshes.iter().map(Mesh::vertex_count)).into_iter();
        let mut curve_keys = carve(&mut device.curve_keys, meshes.iter().map(Mesh::curve_key_count)).into_iter();
        let mut curves = carve(&mut device.curves, meshes.iter().map(Mesh::curve_count)).into_iter();
        let mut patches = carve(&mut device.patches, meshes.iter().map(Mesh::patch_count)).into_iter();

        let slices: Vec<MeshSlices<'_>> = meshes
            .iter()
            .map(|_| MeshSlices {
                tri_verts: tri_verts.next().unwrap_or_default(),
                tri_vindex: tri_vindex.next().unwrap_or_default(),
                tri_shader: tri_shader.next().unwrap_or_default(),
                tri_vnormal: tri_vnormal.next().unwrap_or_default(),
                curve_keys: curve_keys.next().unwrap_or_default(),
                curves: curves.next().unwrap_or_default(),
                patches: patches.next().unwrap_or_default(),
            })
            .collect();

        let shaders = &scene.shaders;
        self.pool.install(|| {
            slices
                .into_par_iter()
                .zip(meshes.par_iter())
                .for_each(|(out, mesh)| {
                    mesh.pack_verts(out.tri_verts, out.tri_vindex, mesh.vert_offset);
                    mesh.pack_normals(shaders, out.tri_shader, out.tri_vnormal);
                    mesh.pack_curves(shaders, out.curve_keys, out.curves, mesh.curvekey_offset);
                    mesh.pack_patches(out.patches, mesh.vert_offset);
                });
        });

        state.report.stats.vertices = totals.verts;
        state.report.stats.triangles = totals.tris;
        state.report.stats.curves = totals.curves;
        log::debug!(
            "packed {} vertices, {} triangles, {} curve keys, {} patches",
            totals.verts,
            totals.tris,
            totals.curve_keys,
            totals.patches
        );

        let backend = self.backend.as_mut();
        let device = &self.device;
        upload(backend, DeviceBuffer::TriVerts, &device.tri_verts)?;
        upload(backend, DeviceBuffer::TriVindex, &device.tri_vindex)?;
        upload(backend, DeviceBuffer::TriShader, &device.tri_shader)?;
        upload(backend, DeviceBuffer::TriVnormal, &device.tri_vnormal)?;
        upload(backend, DeviceBuffer::CurveKeys, &device.curve_keys)?;
        upload(backend, DeviceBuffer::Curves, &device.curves)?;
        upload(backend, DeviceBuffer::Patches, &device.patches)?;
        self.device.uploaded = true;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stage 6
    // -------------------------------------------------------------------------

    /// Writes one record per object and hands them to the device.
    pub(super) fn device_update_object(&mut self, scene: &Scene) -> GeometryResult<()> {
        let mut records = Vec::new();
        try_reserve(&mut records, scene.objects.len(), "object records")?;

        let stride = self.device.attributes_map_stride;
        for (i, object) in scene.objects.iter().enumerate() {
            let mesh = scene
                .mesh(object.mesh)
                .ok_or_else(|| GeometryError::index("mesh", object.mesh.0, scene.meshes.len()))?;

            let transform = if mesh.transform_applied {
                DMat4::IDENTITY
            } else {
                object.transform
            };
            let mut flags = ObjectFlags::empty();
            flags.set(ObjectFlags::TRANSFORM_APPLIED, mesh.transform_applied);
            flags.set(ObjectFlags::NEGATIVE_SCALE_APPLIED, mesh.transform_negative_scaled);
            flags.set(ObjectFlags::MOTION, object.use_motion);
            flags.set(ObjectFlags::HAS_VOLUME, mesh.has_volume);

            records.push(ObjectDeviceData {
                transform: [0, 1, 2].map(|r| transform.row(r).as_vec4().to_array()),
                vert_offset: mesh.vert_offset as u32,
                tri_offset: mesh.tri_offset as u32,
                curve_offset: mesh.curve_offset as u32,
                curvekey_offset: mesh.curvekey_offset as u32,
                patch_offset: mesh.patch_offset as u32,
                attribute_map_offset: (i * stride) as u32,
                flags: flags.bits(),
                pass_id: object.pass_id,
            });
        }

        self.backend
            .upload_objects(bytemuck::cast_slice(&records))
            .map_err(|e| GeometryError::service(Stage::Device, e))?;
        self.device.objects = records;
        self.device.uploaded = true;
        Ok(())
    }
}
