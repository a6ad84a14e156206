//! Attribute requests and the two device addressing conventions.
//!
//! Values of every requested attribute are appended to one float and one
//! float3 buffer. The flat table addresses them per object with fixed
//! rows; the name keyed maps address them by attribute name.

use std::collections::HashMap;

use super::device::{reset_buffer, upload};
use super::MeshManager;
use crate::attribute::{
    Attribute, AttributeDescriptor, AttributeRequestSet, AttributeStandard, AttributeType,
    AttributeValues,
};
use crate::error::{try_reserve, GeometryResult};
use crate::mesh::Mesh;
use crate::pack::Float4;
use crate::scene::{Object, Scene, ShaderTable, ShadingSystem};
use crate::services::{AttributeResolver, DeviceBuffer};

/// Name keyed attribute lookup of one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OslAttributeMap {
    /// Attributes stored on triangles
    pub triangle: HashMap<String, AttributeDescriptor>,
    /// Attributes stored on curves
    pub curve: HashMap<String, AttributeDescriptor>,
}

/// Minimal request set of every mesh: what its shaders read, what every
/// mesh provides, and motion data when the mesh is motion blurred.
pub(super) fn mesh_attribute_requests(scene: &Scene) -> Vec<AttributeRequestSet> {
    scene
        .meshes
        .iter()
        .map(|mesh| {
            let mut set = AttributeRequestSet::new();
            for &shader in &mesh.used_shaders {
                if let Some(requests) = scene.shaders.shader_requests(shader) {
                    set.add_set(requests);
                }
            }
            set.add_set(&scene.shaders.global_attributes);
            if mesh.has_motion_blur() {
                set.add(AttributeStandard::MotionVertexPosition);
                set.add(AttributeStandard::MotionVertexNormal);
            }
            set
        })
        .collect()
}

fn float3(x: f64, y: f64, z: f64) -> Float4 {
    [x as f32, y as f32, z as f32, 0.0]
}

/// Appends the values of `attr` and describes where they went.
fn pack_attribute(
    attr: Option<&Attribute>,
    float: &mut Vec<f32>,
    float3s: &mut Vec<Float4>,
) -> AttributeDescriptor {
    let Some(attr) = attr else {
        return AttributeDescriptor::default();
    };
    let offset = match attr.values() {
        AttributeValues::Float(values) => {
            let offset = float.len();
            float.extend(values.iter().map(|&v| v as f32));
            offset
        }
        AttributeValues::Vector(values) => {
            let offset = float3s.len();
            float3s.extend(values.iter().map(|v| float3(v.x, v.y, v.z)));
            offset
        }
        AttributeValues::Uv(values) => {
            let offset = float3s.len();
            float3s.extend(values.iter().map(|v| float3(v.x, v.y, 0.0)));
            offset
        }
    };
    AttributeDescriptor {
        element: Some(attr.element()),
        kind: attr.kind(),
        offset,
    }
}

/// Packs the values of every request and resolves its descriptors.
fn pack_mesh_attributes(
    meshes: &[Mesh],
    requests: &mut [AttributeRequestSet],
    float: &mut Vec<f32>,
    float3s: &mut Vec<Float4>,
) -> GeometryResult<()> {
    let (mut floats, mut vectors) = (0usize, 0usize);
    for (mesh, set) in meshes.iter().zip(requests.iter()) {
        for req in set.iter() {
            let found = [mesh.attributes().find(&req.id), mesh.curve_attributes().find(&req.id)];
            for attr in found.into_iter().flatten() {
                match attr.kind() {
                    AttributeType::Float => floats += attr.len(),
                    AttributeType::Vector | AttributeType::Uv => vectors += attr.len(),
                }
            }
        }
    }

    float.clear();
    float3s.clear();
    try_reserve(float, floats, "float attributes")?;
    try_reserve(float3s, vectors, "vector attributes")?;

    for (mesh, set) in meshes.iter().zip(requests.iter_mut()) {
        for req in set.iter_mut() {
            req.triangle = pack_attribute(mesh.attributes().find(&req.id), float, float3s);
            req.curve = pack_attribute(mesh.curve_attributes().find(&req.id), float, float3s);
        }
    }
    Ok(())
}

fn svm_row(id: u32, desc: &AttributeDescriptor) -> [u32; 4] {
    [
        id,
        desc.element.map_or(0, |e| e.device_code()),
        desc.offset as u32,
        desc.kind.device_code(),
    ]
}

/// Builds the flat addressing table. Each object owns `stride` rows: a
/// triangle row and a curve row per request, then zero rows ending the
/// list. Returns the stride.
pub(super) fn update_svm_attributes(
    shaders: &mut ShaderTable,
    objects: &[Object],
    requests: &[AttributeRequestSet],
    map: &mut Vec<[u32; 4]>,
) -> GeometryResult<usize> {
    let stride = 2 * (requests.iter().map(AttributeRequestSet::len).max().unwrap_or(0) + 1);
    reset_buffer(map, stride * objects.len(), "attribute map")?;

    for (object, rows) in objects.iter().zip(map.chunks_exact_mut(stride)) {
        let Some(set) = requests.get(object.mesh.0) else {
            continue;
        };
        for (req, pair) in set.iter().zip(rows.chunks_exact_mut(2)) {
            let id = shaders.attribute_id(&req.id);
            pair[0] = svm_row(id, &req.triangle);
            pair[1] = svm_row(id, &req.curve);
        }
    }
    Ok(stride)
}

/// Builds the name keyed maps, one per object. Attributes a mesh lacks are
/// left out.
pub(super) fn update_osl_attributes(
    objects: &[Object],
    requests: &[AttributeRequestSet],
) -> Vec<OslAttributeMap> {
    objects
        .iter()
        .map(|object| {
            let mut map = OslAttributeMap::default();
            for req in requests.get(object.mesh.0).into_iter().flat_map(|set| set.iter()) {
                if req.triangle.element.is_some() {
                    map.triangle.insert(req.id.name().to_string(), req.triangle);
                }
                if req.curve.element.is_some() {
                    map.curve.insert(req.id.name().to_string(), req.curve);
                }
            }
            map
        })
        .collect()
}

impl MeshManager {
    /// Packs attribute values and builds the table of the active shading
    /// back-end.
    pub(super) fn device_update_attributes(
        &mut self,
        scene: &mut Scene,
        requests: &mut [AttributeRequestSet],
    ) -> GeometryResult<()> {
        let device = &mut self.device;
        pack_mesh_attributes(
            &scene.meshes,
            requests,
            &mut device.attributes_float,
            &mut device.attributes_float3,
        )?;

        match scene.params.shading_system {
            ShadingSystem::Svm => {
                device.attributes_map_stride = update_svm_attributes(
                    &mut scene.shaders,
                    &scene.objects,
                    requests,
                    &mut device.attributes_map,
                )?;
                device.osl_attributes.clear();
            }
            ShadingSystem::Osl => {
                device.osl_attributes = update_osl_attributes(&scene.objects, requests);
                device.attributes_map.clear();
                device.attributes_map_stride = 0;
            }
        }
        log::debug!(
            "packed {} float and {} vector attribute values",
            device.attributes_float.len(),
            device.attributes_float3.len()
        );

        let backend = self.backend.as_mut();
        let device = &self.device;
        upload(backend, DeviceBuffer::AttributeMap, &device.attributes_map)?;
        upload(backend, DeviceBuffer::AttributeFloat, &device.attributes_float)?;
        upload(backend, DeviceBuffer::AttributeFloat3, &device.attributes_float3)?;
        Ok(())
    }
}
