//! # Mesh Manager Tests
//!
//! Collaborators are replaced by recording mocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use glam::{DMat4, DVec3};
use parking_lot::Mutex;

use super::*;
use crate::mesh::{DisplacementMethod, Mesh, SubdivisionType};
use crate::scene::{Object, SceneParams, ShadingSystem};
use crate::services::{
    BvhInstance, DeviceBuffer, DisplacementRequest, ProgressSignal, SceneBvhRequest, ServiceError,
};
use crate::subd::EdgeLengthSplit;

// =============================================================================
// MOCKS
// =============================================================================

#[derive(Default)]
struct CountingBvh {
    next: AtomicU64,
    built: Mutex<Vec<String>>,
    refits: AtomicUsize,
    scenes: Mutex<Vec<Vec<BvhInstance>>>,
    freed: Mutex<Vec<BvhHandle>>,
}

impl BvhBuilder for CountingBvh {
    fn build_mesh(&self, mesh: &Mesh, _params: &SceneParams) -> Result<BvhHandle, ServiceError> {
        self.built.lock().push(mesh.name.clone());
        Ok(BvhHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn refit_mesh(&self, _handle: BvhHandle, _mesh: &Mesh) -> Result<(), ServiceError> {
        self.refits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn build_scene(&self, request: &SceneBvhRequest<'_>) -> Result<BvhHandle, ServiceError> {
        self.scenes.lock().push(request.instances.to_vec());
        Ok(BvhHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn free(&self, handle: BvhHandle) {
        self.freed.lock().push(handle);
    }
}

struct NoDisplacement;

impl DisplacementEvaluator for NoDisplacement {
    fn evaluate(&self, request: &DisplacementRequest<'_>) -> Result<Vec<DVec3>, ServiceError> {
        Ok(vec![DVec3::ZERO; request.samples.len()])
    }
}

/// Raises every sample by one unit along z.
struct LiftZ;

impl DisplacementEvaluator for LiftZ {
    fn evaluate(&self, request: &DisplacementRequest<'_>) -> Result<Vec<DVec3>, ServiceError> {
        Ok(vec![DVec3::Z; request.samples.len()])
    }
}

/// Cannot load its images.
struct MissingImages;

impl DisplacementEvaluator for MissingImages {
    fn prepare_images(&self, _images: &[u32]) -> Result<(), ServiceError> {
        Err(ServiceError::new("image 7 not found"))
    }

    fn evaluate(&self, request: &DisplacementRequest<'_>) -> Result<Vec<DVec3>, ServiceError> {
        Ok(vec![DVec3::Z; request.samples.len()])
    }
}

#[derive(Default)]
struct BackendLog {
    buffers: HashMap<DeviceBuffer, Vec<u8>>,
    objects: Vec<u8>,
    frees: usize,
}

#[derive(Clone, Default)]
struct RecordingBackend(Arc<Mutex<BackendLog>>);

impl DeviceBackend for RecordingBackend {
    fn upload(&mut self, buffer: DeviceBuffer, bytes: &[u8]) -> Result<(), ServiceError> {
        self.0.lock().buffers.insert(buffer, bytes.to_vec());
        Ok(())
    }

    fn upload_objects(&mut self, bytes: &[u8]) -> Result<(), ServiceError> {
        self.0.lock().objects = bytes.to_vec();
        Ok(())
    }

    fn free_all(&mut self) {
        let mut log = self.0.lock();
        log.buffers.clear();
        log.objects.clear();
        log.frees += 1;
    }
}

struct RejectingBackend;

impl DeviceBackend for RejectingBackend {
    fn upload(&mut self, _: DeviceBuffer, _: &[u8]) -> Result<(), ServiceError> {
        Err(ServiceError::new("device lost"))
    }

    fn upload_objects(&mut self, _: &[u8]) -> Result<(), ServiceError> {
        Err(ServiceError::new("device lost"))
    }

    fn free_all(&mut self) {}
}

/// Cancels once `polls` cancellation checks have passed.
struct CancelAfter {
    polls: AtomicUsize,
}

impl Progress for CancelAfter {
    fn is_cancelled(&self) -> bool {
        self.polls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
    }
}

struct Harness {
    manager: MeshManager,
    bvh: Arc<CountingBvh>,
    backend: RecordingBackend,
}

fn harness() -> Harness {
    let bvh = Arc::new(CountingBvh::default());
    let backend = RecordingBackend::default();
    let config = ManagerConfig::new(1.0e-9, 1.0, 16, 2).unwrap();
    let services = Services::new(
        Arc::new(EdgeLengthSplit::from_config(&config.geometry)),
        bvh.clone(),
        Arc::new(NoDisplacement),
    );
    let manager = MeshManager::new(config, services, Box::new(backend.clone())).unwrap();
    Harness {
        manager,
        bvh,
        backend,
    }
}

fn displacing_harness(evaluator: Arc<dyn DisplacementEvaluator>) -> Harness {
    let bvh = Arc::new(CountingBvh::default());
    let backend = RecordingBackend::default();
    let config = ManagerConfig::new(1.0e-9, 1.0, 16, 2).unwrap();
    let services = Services::new(
        Arc::new(EdgeLengthSplit::from_config(&config.geometry)),
        bvh.clone(),
        evaluator,
    );
    let manager = MeshManager::new(config, services, Box::new(backend.clone())).unwrap();
    Harness {
        manager,
        bvh,
        backend,
    }
}

/// Adds a displacement shader and a truly displaced quad using it.
fn displaced_quad(scene: &mut Scene, name: &str) -> MeshId {
    let mut shader = Shader::new("rock");
    shader.has_displacement = true;
    shader.displacement_images = vec![7];
    let shader = scene.shaders.add(shader);
    let mut mesh = quad(name);
    mesh.used_shaders = vec![shader];
    mesh.displacement_method = DisplacementMethod::True;
    scene.add_mesh(mesh)
}

fn quad(name: &str) -> Mesh {
    let mut mesh = Mesh::new(name);
    for p in [DVec3::ZERO, DVec3::X, DVec3::new(1.0, 1.0, 0.0), DVec3::Y] {
        mesh.add_vertex(p);
    }
    mesh.add_triangle(0, 1, 2, 0, true).unwrap();
    mesh.add_triangle(0, 2, 3, 0, true).unwrap();
    mesh
}

fn place(scene: &mut Scene, mesh: MeshId, offset: DVec3) -> usize {
    let name = format!("obj{}", scene.objects.len());
    scene
        .add_object(Object::new(name, mesh, DMat4::from_translation(offset)))
        .unwrap()
}

// =============================================================================
// PASSES
// =============================================================================

#[test]
fn test_unchanged_scene_is_skipped() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let id = scene.add_mesh(quad("a"));
    place(&mut scene, id, DVec3::ZERO);

    let progress = ProgressSignal::new();
    let first = h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(first.status, UpdateStatus::Completed);
    assert!(h.manager.device().ready);
    let scene_builds = h.bvh.scenes.lock().len();

    let second = h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(second.status, UpdateStatus::Skipped);
    assert_eq!(h.bvh.scenes.lock().len(), scene_builds);
}

#[test]
fn test_tagged_flags_clear_after_pass() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let id = scene.add_mesh(quad("a"));
    place(&mut scene, id, DVec3::ZERO);
    let progress = ProgressSignal::new();
    h.manager.device_update(&mut scene, &progress).unwrap();

    scene.tag_mesh_update(id, true).unwrap();
    let mesh = scene.mesh(id).unwrap();
    assert!(mesh.need_update() && mesh.need_update_rebuild());

    let report = h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(report.status, UpdateStatus::Completed);
    let mesh = scene.mesh(id).unwrap();
    assert!(!mesh.need_update() && !mesh.need_update_rebuild());
    assert!(!scene.flags.mesh_need_update);
    assert!(!scene.flags.object_need_update);
}

#[test]
fn test_shared_mesh_builds_one_structure() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let id = scene.add_mesh(quad("shared"));
    for x in 0..3 {
        place(&mut scene, id, DVec3::new(x as f64 * 2.0, 0.0, 0.0));
    }

    let report = h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    assert_eq!(report.stats.bvh_builds, 1);
    assert_eq!(*h.bvh.built.lock(), vec!["shared".to_string()]);

    let mesh = scene.mesh(id).unwrap();
    assert!(!mesh.transform_applied);
    assert!(mesh.need_build_bvh());
    assert!(mesh.is_instanced());

    let scenes = h.bvh.scenes.lock();
    let instances = &scenes[0];
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|i| i.bvh == mesh.bvh && i.bvh.is_some()));
    assert_eq!(instances[2].transform, DMat4::from_translation(DVec3::new(4.0, 0.0, 0.0)));
}

#[test]
fn test_single_placement_is_baked() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let id = scene.add_mesh(quad("solo"));
    place(&mut scene, id, DVec3::new(0.0, 0.0, 5.0));

    h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    let mesh = scene.mesh(id).unwrap();
    assert!(mesh.transform_applied);
    assert!(!mesh.need_build_bvh());
    assert!(mesh.bvh.is_none());
    assert_eq!(mesh.vertices()[0], DVec3::new(0.0, 0.0, 5.0));
    assert!(h.bvh.built.lock().is_empty());

    let record = h.manager.device().objects[0];
    assert_eq!(record.transform[2], [0.0, 0.0, 1.0, 0.0]);
    assert!(ObjectFlags::from_bits_truncate(record.flags).contains(ObjectFlags::TRANSFORM_APPLIED));
    assert_eq!(h.manager.device().tri_verts[0], [0.0, 0.0, 5.0, 0.0]);

    // A second placement turns the mesh back into an instance.
    place(&mut scene, id, DVec3::X);
    h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    let mesh = scene.mesh(id).unwrap();
    assert!(!mesh.transform_applied);
    assert_eq!(mesh.vertices()[0], DVec3::ZERO);
    assert_eq!(h.bvh.built.lock().len(), 1);
}

#[test]
fn test_subsurface_mesh_keeps_own_structure() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let mut skin = Shader::new("skin");
    skin.has_surface_bssrdf = true;
    let shader = scene.shaders.add(skin);

    let mut mesh = quad("skin");
    mesh.used_shaders = vec![shader];
    let id = scene.add_mesh(mesh);
    place(&mut scene, id, DVec3::ZERO);

    h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    let mesh = scene.mesh(id).unwrap();
    assert!(mesh.transform_applied);
    assert!(mesh.need_build_bvh());
    assert!(mesh.bvh.is_some());
    assert!(h.manager.device().has_surface_bssrdf);
}

#[test]
fn test_dynamic_structures_refit() {
    let mut h = harness();
    let params = SceneParams {
        bvh_type: BvhType::Dynamic,
        ..Default::default()
    };
    let mut scene = Scene::new(params);
    let id = scene.add_mesh(quad("moving"));
    place(&mut scene, id, DVec3::ZERO);
    let progress = ProgressSignal::new();
    h.manager.device_update(&mut scene, &progress).unwrap();
    assert!(!scene.mesh(id).unwrap().transform_applied);

    scene.mesh_mut(id).unwrap().vertices_mut()[2].z = 0.5;
    scene.tag_mesh_update(id, false).unwrap();
    let report = h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(report.stats.bvh_refits, 1);
    assert_eq!(report.stats.bvh_builds, 0);

    scene.tag_mesh_update(id, true).unwrap();
    let report = h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(report.stats.bvh_builds, 1);
    // The replaced structure and the first scene structure were released.
    assert!(h.bvh.freed.lock().len() >= 2);
}

#[test]
fn test_cancelled_pass_leaves_flags_dirty() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let id = scene.add_mesh(quad("a"));
    place(&mut scene, id, DVec3::ZERO);

    let progress = CancelAfter {
        polls: AtomicUsize::new(2),
    };
    let report = h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(report.status, UpdateStatus::Cancelled);
    assert!(!h.manager.device().ready);
    assert!(scene.flags.mesh_need_update);
    assert!(scene.mesh(id).unwrap().need_update());

    let report = h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    assert_eq!(report.status, UpdateStatus::Completed);
    assert!(!scene.mesh(id).unwrap().need_update());
}

#[test]
fn test_packing_offsets_across_meshes() {
    let mut h = harness();
    let params = SceneParams {
        bvh_type: BvhType::Dynamic,
        ..Default::default()
    };
    let mut scene = Scene::new(params);
    let a = scene.add_mesh(quad("a"));
    let b = scene.add_mesh(quad("b"));
    place(&mut scene, a, DVec3::ZERO);
    place(&mut scene, b, DVec3::X);

    let report = h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    assert_eq!(report.stats.vertices, 8);
    assert_eq!(report.stats.triangles, 4);

    let device = h.manager.device();
    assert_eq!(scene.mesh(b).unwrap().vert_offset, 4);
    assert_eq!(scene.mesh(b).unwrap().tri_offset, 2);
    assert_eq!(device.tri_vindex[2], [4, 5, 6, 6]);
    assert_eq!(device.objects[1].vert_offset, 4);
    assert_eq!(device.tri_vnormal.len(), 8);

    let log = h.backend.0.lock();
    let bytes = &log.buffers[&DeviceBuffer::TriVindex];
    assert_eq!(bytes.as_slice(), bytemuck::cast_slice::<[u32; 4], u8>(&device.tri_vindex));
    assert_eq!(log.objects.len(), 2 * std::mem::size_of::<ObjectDeviceData>());
}

#[test]
fn test_subdivided_mesh_is_diced() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let mut mesh = Mesh::new("patch");
    mesh.subdivision_type = SubdivisionType::Linear;
    for p in [DVec3::ZERO, DVec3::X * 2.0, DVec3::new(2.0, 2.0, 0.0), DVec3::Y * 2.0] {
        mesh.add_vertex(p);
    }
    mesh.add_patch([0, 1, 2, 3], 0, true).unwrap();
    let id = scene.add_mesh(mesh);
    place(&mut scene, id, DVec3::ZERO);

    let report = h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    // Edges of length 2 at rate 1 dice into two segments each.
    assert_eq!(report.stats.diced_triangles, 8);
    let mesh = scene.mesh(id).unwrap();
    assert_eq!(mesh.triangle_count(), 8);
    assert_eq!(h.manager.device().patches.len(), 1);
    assert!(!mesh.has_pending_dice());
}

#[test]
fn test_flags_only_update() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let shader = scene.shaders.add(Shader::new("fog"));
    let mut mesh = quad("box");
    mesh.used_shaders = vec![shader];
    let id = scene.add_mesh(mesh);
    place(&mut scene, id, DVec3::ZERO);
    let progress = ProgressSignal::new();
    h.manager.device_update(&mut scene, &progress).unwrap();
    assert!(!h.manager.device().has_volume);
    let scene_builds = h.bvh.scenes.lock().len();

    scene.shaders.get_mut(shader).unwrap().has_volume = true;
    scene.flags.mesh_need_flags_update = true;
    let report = h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(report.status, UpdateStatus::Completed);
    assert!(h.manager.device().has_volume);
    assert!(scene.mesh(id).unwrap().has_volume);
    assert!(!scene.flags.mesh_need_flags_update);
    assert_eq!(h.bvh.scenes.lock().len(), scene_builds);
}

#[test]
fn test_osl_backend_builds_name_maps() {
    let mut h = harness();
    let params = SceneParams {
        shading_system: ShadingSystem::Osl,
        ..Default::default()
    };
    let mut scene = Scene::new(params);
    scene
        .shaders
        .global_attributes
        .add(crate::attribute::AttributeStandard::VertexNormal);
    let id = scene.add_mesh(quad("a"));
    place(&mut scene, id, DVec3::ZERO);

    h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    let device = h.manager.device();
    assert!(device.attributes_map.is_empty());
    assert_eq!(device.osl_attributes.len(), 1);
    let normal = &device.osl_attributes[0].triangle["N"];
    assert_eq!(normal.offset, 0);
    assert_eq!(device.attributes_float3.len(), 4);
}

#[test]
fn test_upload_failure_is_an_error() {
    let config = ManagerConfig::default();
    let services = Services::new(
        Arc::new(EdgeLengthSplit::default()),
        Arc::new(CountingBvh::default()),
        Arc::new(NoDisplacement),
    );
    let mut manager = MeshManager::new(config, services, Box::new(RejectingBackend)).unwrap();
    let mut scene = Scene::new(SceneParams::default());
    let id = scene.add_mesh(quad("a"));
    place(&mut scene, id, DVec3::ZERO);

    let err = manager.device_update(&mut scene, &ProgressSignal::new()).unwrap_err();
    assert!(matches!(
        err,
        GeometryError::Service {
            stage: Stage::Device,
            ..
        }
    ));
    assert!(!manager.device().ready);
    assert!(scene.flags.mesh_need_update);
}

#[test]
fn test_device_free_is_idempotent() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let id = scene.add_mesh(quad("a"));
    place(&mut scene, id, DVec3::ZERO);
    h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    let handle = h.manager.bvh().unwrap();

    h.manager.device_free();
    h.manager.device_free();
    assert_eq!(h.backend.0.lock().frees, 1);
    assert!(h.backend.0.lock().buffers.is_empty());
    assert_eq!(h.bvh.freed.lock().iter().filter(|&&f| f == handle).count(), 1);
    assert!(h.manager.bvh().is_none());
    assert!(!h.manager.device().ready);
}

#[test]
fn test_true_displacement_marks_rebuild() {
    struct Raise;
    impl DisplacementEvaluator for Raise {
        fn evaluate(&self, request: &DisplacementRequest<'_>) -> Result<Vec<DVec3>, ServiceError> {
            Ok(vec![DVec3::Z; request.samples.len()])
        }
    }

    let config = ManagerConfig::default();
    let bvh = Arc::new(CountingBvh::default());
    let services = Services::new(Arc::new(EdgeLengthSplit::default()), bvh.clone(), Arc::new(Raise));
    let mut manager =
        MeshManager::new(config, services, Box::new(RecordingBackend::default())).unwrap();

    let mut scene = Scene::new(SceneParams::default());
    let mut shader = Shader::new("rock");
    shader.has_displacement = true;
    let shader = scene.shaders.add(shader);
    let mut mesh = quad("rock");
    mesh.used_shaders = vec![shader];
    mesh.displacement_method = DisplacementMethod::True;
    let id = scene.add_mesh(mesh);
    place(&mut scene, id, DVec3::ZERO);
    place(&mut scene, id, DVec3::X);

    let report = manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    assert_eq!(report.stats.meshes_displaced, 1);
    assert!(report.is_clean());
    assert_eq!(scene.mesh(id).unwrap().vertices()[1].z, 1.0);
    assert_eq!(manager.device().tri_verts[1], [1.0, 0.0, 1.0, 0.0]);
}

// =============================================================================
// EDITS BETWEEN PASSES
// =============================================================================

#[test]
fn test_patch_added_after_pass_is_diced() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let mut mesh = quad("grow");
    mesh.subdivision_type = SubdivisionType::Linear;
    let id = scene.add_mesh(mesh);
    place(&mut scene, id, DVec3::ZERO);
    let progress = ProgressSignal::new();
    h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(scene.mesh(id).unwrap().triangle_count(), 2);

    let mesh = scene.mesh_mut(id).unwrap();
    let corners = [
        DVec3::new(2.0, 0.0, 0.0),
        DVec3::new(4.0, 0.0, 0.0),
        DVec3::new(4.0, 2.0, 0.0),
        DVec3::new(2.0, 2.0, 0.0),
    ];
    let v: Vec<u32> = corners.iter().map(|&p| mesh.add_vertex(p)).collect();
    mesh.add_patch([v[0], v[1], v[2], v[3]], 0, true).unwrap();
    scene.tag_mesh_update(id, true).unwrap();

    let report = h.manager.device_update(&mut scene, &progress).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.stats.diced_triangles, 8);
    let mesh = scene.mesh(id).unwrap();
    assert_eq!(mesh.vertex_count(), 8 + 9);
    assert_eq!(mesh.triangle_count(), 2 + 8);
    assert_eq!(h.manager.device().tri_vindex.len(), 10);

    // A second pass over the same patches replaces the diced output.
    scene.flags.need_clear_geom_cache = true;
    scene.tag_mesh_update(id, true).unwrap();
    h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(scene.mesh(id).unwrap().triangle_count(), 2 + 8);
}

#[test]
fn test_vertex_edit_refreshes_packed_normals() {
    let mut h = harness();
    let mut scene = Scene::new(SceneParams::default());
    let id = scene.add_mesh(quad("bend"));
    place(&mut scene, id, DVec3::ZERO);
    let progress = ProgressSignal::new();
    h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(h.manager.device().tri_vnormal[1], [0.0, 0.0, 1.0, 0.0]);

    scene
        .mesh_mut(id)
        .unwrap()
        .set_vertex(1, DVec3::new(1.0, 0.0, 1.0))
        .unwrap();
    scene.tag_mesh_update(id, true).unwrap();
    h.manager.device_update(&mut scene, &progress).unwrap();

    let expected = DVec3::new(-1.0, 1.0, 1.0).normalize().as_vec3();
    let normal = h.manager.device().tri_vnormal[1];
    assert_abs_diff_eq!(normal[0], expected.x, epsilon = 1e-6);
    assert_abs_diff_eq!(normal[1], expected.y, epsilon = 1e-6);
    assert_abs_diff_eq!(normal[2], expected.z, epsilon = 1e-6);
}

#[test]
fn test_redice_does_not_displace_twice() {
    let mut h = displacing_harness(Arc::new(LiftZ));
    let mut scene = Scene::new(SceneParams::default());
    let id = displaced_quad(&mut scene, "mixed");
    {
        let mesh = scene.mesh_mut(id).unwrap();
        mesh.subdivision_type = SubdivisionType::Linear;
        mesh.add_patch([0, 1, 2, 3], 0, true).unwrap();
    }
    place(&mut scene, id, DVec3::ZERO);
    let progress = ProgressSignal::new();

    h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(scene.mesh(id).unwrap().vertices()[0].z, 1.0);

    scene.flags.need_clear_geom_cache = true;
    scene.tag_mesh_update(id, true).unwrap();
    let report = h.manager.device_update(&mut scene, &progress).unwrap();
    assert!(report.is_clean());
    let mesh = scene.mesh(id).unwrap();
    assert!(mesh.vertices().iter().all(|p| p.z == 1.0));
    assert_eq!(h.manager.device().tri_verts[0], [0.0, 0.0, 1.0, 0.0]);
}

#[test]
fn test_cancel_after_displacement_resumes_without_drift() {
    let mut h = displacing_harness(Arc::new(LiftZ));
    let mut scene = Scene::new(SceneParams::default());
    let id = displaced_quad(&mut scene, "rock");
    place(&mut scene, id, DVec3::ZERO);

    // Two checks pass, the one after displacement stops the pass.
    let progress = CancelAfter {
        polls: AtomicUsize::new(2),
    };
    let report = h.manager.device_update(&mut scene, &progress).unwrap();
    assert_eq!(report.status, UpdateStatus::Cancelled);
    assert_eq!(report.stats.meshes_displaced, 1);
    assert_eq!(scene.mesh(id).unwrap().vertices()[2].z, 1.0);

    let report = h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    assert_eq!(report.status, UpdateStatus::Completed);
    let mesh = scene.mesh(id).unwrap();
    assert!(mesh.vertices().iter().all(|p| p.z == 1.0));
    assert!(!mesh.need_update());
}

#[test]
fn test_missing_displacement_images_fail_each_mesh() {
    let mut h = displacing_harness(Arc::new(MissingImages));
    let mut scene = Scene::new(SceneParams::default());
    let a = displaced_quad(&mut scene, "a");
    let b = displaced_quad(&mut scene, "b");
    let plain = scene.add_mesh(quad("plain"));
    for id in [a, b, plain] {
        place(&mut scene, id, DVec3::ZERO);
    }

    let report = h.manager.device_update(&mut scene, &ProgressSignal::new()).unwrap();
    assert_eq!(report.status, UpdateStatus::Completed);
    assert_eq!(report.failures.len(), 2);
    assert!(report.failed(a) && report.failed(b));
    assert!(!report.failed(plain));
    assert!(report.failures.iter().all(|f| f.stage == Stage::Displacement));

    for id in [a, b] {
        let mesh = scene.mesh(id).unwrap();
        assert!(mesh.need_update());
        assert_eq!(mesh.vertices()[2], DVec3::new(1.0, 1.0, 0.0));
    }
    assert!(!scene.mesh(plain).unwrap().need_update());
    assert!(scene.flags.mesh_need_update);
}
