//! # Mesh Manager
//!
//! Runs the per-pass scene update. Stages run in a fixed order because
//! later stages read the invalidation left behind by earlier ones:
//!
//! 0. Placements, mesh flags and geometry cache
//! 1. Subdivision, displacement images and displacement
//! 2. Attribute requests
//! 3. Mesh packing and attribute tables
//! 4. Acceleration structures
//! 5. Scene-wide flags
//! 6. Object records
//!
//! Cancellation is polled between stages. A cancelled pass leaves every
//! flag dirty so the next pass redoes the work.
//!
//! Failures of collaborators for one mesh are recorded in the returned
//! [`UpdateReport`] and the mesh keeps its last good geometry. Resource
//! exhaustion aborts the pass with an error and nothing is marked ready.

mod attributes;
mod bvh;
mod device;
mod displace;

use std::sync::Arc;

use glam::DMat4;

use crate::error::{GeometryError, GeometryResult, Stage};
use crate::scene::{BvhType, MeshId, Scene, Shader};
use crate::services::{
    BvhBuilder, BvhHandle, DeviceBackend, DisplacementEvaluator, ObjectGraph, Progress,
    SplitService,
};
use crate::settings::ManagerConfig;

pub use attributes::OslAttributeMap;
pub use device::{DeviceScene, ObjectDeviceData, ObjectFlags};

// =============================================================================
// SERVICES
// =============================================================================

/// Collaborators the manager delegates to.
#[derive(Clone)]
pub struct Services {
    /// Adaptive patch splitting
    pub split: Arc<dyn SplitService>,
    /// Acceleration structure builds
    pub bvh: Arc<dyn BvhBuilder>,
    /// Displacement shading
    pub displacement: Arc<dyn DisplacementEvaluator>,
}

impl Services {
    /// Bundles the collaborators.
    pub fn new(
        split: Arc<dyn SplitService>,
        bvh: Arc<dyn BvhBuilder>,
        displacement: Arc<dyn DisplacementEvaluator>,
    ) -> Self {
        Self {
            split,
            bvh,
            displacement,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Nothing was dirty
    Skipped,
    /// Every stage ran
    Completed,
    /// Stopped between stages, flags left dirty
    Cancelled,
}

/// A collaborator failure that did not stop the pass.
#[derive(Debug)]
pub struct MeshFailure {
    /// Affected mesh, `None` for scene-level failures
    pub mesh: Option<MeshId>,
    /// Stage that failed
    pub stage: Stage,
    /// The failure
    pub error: GeometryError,
}

/// Counters of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Meshes that were dirty at the start of the pass
    pub meshes_updated: usize,
    /// Meshes whose vertices were displaced
    pub meshes_displaced: usize,
    /// Triangles appended by dicing
    pub diced_triangles: usize,
    /// Packed vertices
    pub vertices: usize,
    /// Packed triangles
    pub triangles: usize,
    /// Packed curves
    pub curves: usize,
    /// Mesh structures built
    pub bvh_builds: usize,
    /// Mesh structures refit
    pub bvh_refits: usize,
}

/// Outcome of [`MeshManager::device_update`].
#[derive(Debug)]
pub struct UpdateReport {
    /// How the pass ended
    pub status: UpdateStatus,
    /// Recorded per-mesh failures, in detection order
    pub failures: Vec<MeshFailure>,
    /// Counters
    pub stats: UpdateStats,
}

impl UpdateReport {
    fn new(status: UpdateStatus) -> Self {
        Self {
            status,
            failures: Vec::new(),
            stats: UpdateStats::default(),
        }
    }

    /// True when the pass completed without recorded failures.
    pub fn is_clean(&self) -> bool {
        self.status != UpdateStatus::Cancelled && self.failures.is_empty()
    }

    /// True when a failure was recorded for `mesh`.
    pub fn failed(&self, mesh: MeshId) -> bool {
        self.failures.iter().any(|f| f.mesh == Some(mesh))
    }
}

/// Failure bookkeeping of a running pass.
struct PassState {
    report: UpdateReport,
    failed: Vec<bool>,
}

impl PassState {
    fn new(meshes: usize) -> Self {
        Self {
            report: UpdateReport::new(UpdateStatus::Completed),
            failed: vec![false; meshes],
        }
    }

    /// Records a non-fatal failure, or hands a fatal one back.
    fn record(&mut self, mesh: Option<usize>, stage: Stage, error: GeometryError) -> GeometryResult<()> {
        if error.is_fatal() {
            return Err(error);
        }
        if let Some(flag) = mesh.and_then(|i| self.failed.get_mut(i)) {
            *flag = true;
        }
        self.report.failures.push(MeshFailure {
            mesh: mesh.map(MeshId),
            stage,
            error,
        });
        Ok(())
    }

    fn cancelled(mut self) -> UpdateReport {
        self.report.status = UpdateStatus::Cancelled;
        self.report
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Keeps the meshes of a scene current on the device.
pub struct MeshManager {
    config: ManagerConfig,
    pool: rayon::ThreadPool,
    services: Services,
    backend: Box<dyn DeviceBackend>,
    bvh: Option<BvhHandle>,
    device: DeviceScene,
}

impl std::fmt::Debug for MeshManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshManager")
            .field("config", &self.config)
            .field("threads", &self.pool.current_num_threads())
            .field("bvh", &self.bvh)
            .field("ready", &self.device.ready)
            .finish_non_exhaustive()
    }
}

impl MeshManager {
    /// Creates a manager with its own worker pool.
    pub fn new(
        config: ManagerConfig,
        services: Services,
        backend: Box<dyn DeviceBackend>,
    ) -> GeometryResult<Self> {
        let pool = config.thread_pool()?;
        Ok(Self {
            config,
            pool,
            services,
            backend,
            bvh: None,
            device: DeviceScene::default(),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Flattened buffers of the last pass.
    pub fn device(&self) -> &DeviceScene {
        &self.device
    }

    /// Scene-level acceleration structure.
    pub fn bvh(&self) -> Option<BvhHandle> {
        self.bvh
    }

    /// Schedules a full mesh update on the next pass.
    pub fn tag_update(&self, scene: &mut Scene) {
        scene.flags.mesh_need_update = true;
        scene.flags.object_need_update = true;
    }

    /// Brings the device copy of the scene up to date.
    ///
    /// Returns `Err` only for failures that leave no usable device state,
    /// such as allocation failure or a rejected upload. Everything else is
    /// reported in [`UpdateReport::failures`].
    pub fn device_update(
        &mut self,
        scene: &mut Scene,
        progress: &dyn Progress,
    ) -> GeometryResult<UpdateReport> {
        if !scene.flags.mesh_need_update && !scene.flags.mesh_need_flags_update {
            return Ok(UpdateReport::new(UpdateStatus::Skipped));
        }

        let mut state = PassState::new(scene.meshes.len());

        // Stage 0
        progress.set_status("Updating Meshes", "Placements");
        if scene.flags.mesh_need_flags_update {
            update_mesh_flags(scene);
        }
        apply_placements(scene);
        if scene.flags.need_clear_geom_cache {
            clear_geom_cache(scene);
        }

        let dirty: Vec<bool> = scene.meshes.iter().map(|m| m.need_update).collect();
        state.report.stats.meshes_updated = dirty.iter().filter(|&&d| d).count();
        if !scene.flags.mesh_need_update && state.report.stats.meshes_updated == 0 {
            self.device_update_flags(scene);
            scene.flags.mesh_need_flags_update = false;
            return Ok(state.report);
        }

        self.device.ready = false;
        if progress.is_cancelled() {
            return Ok(state.cancelled());
        }

        // Stage 1
        progress.set_status("Updating Meshes", "Tessellating");
        self.tessellate(scene, &mut state)?;
        if progress.is_cancelled() {
            return Ok(state.cancelled());
        }
        progress.set_status("Updating Meshes", "Displacing");
        self.device_update_displacement_images(scene, &mut state)?;
        self.displace_meshes(scene, &mut state)?;
        if progress.is_cancelled() {
            return Ok(state.cancelled());
        }

        // Stage 2
        progress.set_status("Updating Meshes", "Attributes");
        let mut requests = attributes::mesh_attribute_requests(scene);
        if progress.is_cancelled() {
            return Ok(state.cancelled());
        }

        // Stage 3
        progress.set_status("Updating Meshes", "Packing");
        self.device_update_mesh(scene, &mut state)?;
        self.device_update_attributes(scene, &mut requests)?;
        if progress.is_cancelled() {
            return Ok(state.cancelled());
        }

        // Stage 4
        progress.set_status("Updating Meshes", "Building BVH");
        self.device_update_bvh(scene, &mut state)?;
        if progress.is_cancelled() {
            return Ok(state.cancelled());
        }

        // Stage 5
        self.device_update_flags(scene);

        // Stage 6
        progress.set_status("Updating Meshes", "Objects");
        self.device_update_object(scene)?;

        let mut still_dirty = false;
        for (mesh, &failed) in scene.meshes.iter_mut().zip(&state.failed) {
            if failed {
                still_dirty = true;
            } else {
                mesh.clear_update_flags();
            }
        }
        scene.flags.mesh_need_update = still_dirty;
        scene.flags.mesh_need_flags_update = false;
        scene.flags.object_need_update = false;
        self.device.ready = true;

        let report = state.report;
        if !report.failures.is_empty() {
            let summary: Vec<String> = report
                .failures
                .iter()
                .map(|f| match f.mesh {
                    Some(id) => format!("mesh {}: {}", id.0, f.error),
                    None => format!("scene: {}", f.error),
                })
                .collect();
            log::warn!(
                "mesh update finished with {} failure(s): {}",
                report.failures.len(),
                summary.join("; ")
            );
        }
        log::info!(
            "mesh update: {} meshes, {} vertices, {} triangles, {} curves, {} BVH builds",
            report.stats.meshes_updated,
            report.stats.vertices,
            report.stats.triangles,
            report.stats.curves,
            report.stats.bvh_builds
        );
        Ok(report)
    }

    /// Releases the scene structure and every uploaded buffer. Calling it
    /// again is a no-op.
    pub fn device_free(&mut self) {
        if let Some(handle) = self.bvh.take() {
            self.services.bvh.free(handle);
        }
        if self.device.uploaded {
            self.backend.free_all();
        }
        self.device = DeviceScene::default();
    }

    // -------------------------------------------------------------------------
    // Stage 1
    // -------------------------------------------------------------------------

    fn tessellate(&self, scene: &mut Scene, state: &mut PassState) -> GeometryResult<()> {
        use rayon::prelude::*;

        let split = self.services.split.as_ref();
        let results: Vec<(usize, GeometryResult<usize>)> = self.pool.install(|| {
            scene
                .meshes
                .par_iter_mut()
                .enumerate()
                .filter(|(_, mesh)| mesh.has_pending_dice())
                .map(|(i, mesh)| (i, mesh.prepare_subdivision(split).map(|size| size.num_tris)))
                .collect()
        });

        for (index, result) in results {
            match result {
                Ok(tris) => state.report.stats.diced_triangles += tris,
                Err(err) => state.record(Some(index), Stage::Split, err)?,
            }
        }
        log::debug!("diced {} triangles", state.report.stats.diced_triangles);
        Ok(())
    }

    fn device_update_displacement_images(
        &self,
        scene: &Scene,
        state: &mut PassState,
    ) -> GeometryResult<()> {
        let mut images: Vec<u32> = scene
            .meshes
            .iter()
            .filter(|mesh| mesh.need_update && displace::needs_displacement(mesh, &scene.shaders))
            .flat_map(|mesh| &mesh.used_shaders)
            .filter_map(|&s| scene.shaders.get(s))
            .filter(|shader| shader.has_displacement)
            .flat_map(|shader| shader.displacement_images.iter().copied())
            .collect();
        images.sort_unstable();
        images.dedup();
        if images.is_empty() {
            return Ok(());
        }

        log::debug!("loading {} displacement images", images.len());
        if let Err(err) = self.services.displacement.prepare_images(&images) {
            // Every displaced mesh would sample the missing images.
            for (i, mesh) in scene.meshes.iter().enumerate() {
                if mesh.need_update && displace::needs_displacement(mesh, &scene.shaders) {
                    let error = GeometryError::service(Stage::Displacement, err.clone());
                    state.record(Some(i), Stage::Displacement, error)?;
                }
            }
        }
        Ok(())
    }

    fn displace_meshes(&self, scene: &mut Scene, state: &mut PassState) -> GeometryResult<()> {
        use rayon::prelude::*;

        let evaluator = self.services.displacement.as_ref();
        let Scene { meshes, shaders, .. } = scene;
        let shaders = &*shaders;
        let skip = &state.failed;
        let results: Vec<(usize, GeometryResult<bool>)> = self.pool.install(|| {
            meshes
                .par_iter_mut()
                .enumerate()
                .filter(|(i, mesh)| mesh.need_update && !skip[*i])
                .map(|(i, mesh)| (i, displace::displace(mesh, shaders, evaluator)))
                .collect()
        });

        for (index, result) in results {
            match result {
                Ok(true) => {
                    meshes[index].need_update_rebuild = true;
                    state.report.stats.meshes_displaced += 1;
                }
                Ok(false) => {}
                Err(err) => state.record(Some(index), Stage::Displacement, err)?,
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stage 5
    // -------------------------------------------------------------------------

    fn device_update_flags(&mut self, scene: &Scene) {
        self.device.has_volume = scene.meshes.iter().any(|m| m.has_volume);
        self.device.has_surface_bssrdf = scene.meshes.iter().any(|m| m.has_surface_bssrdf);
    }
}

// =============================================================================
// STAGE 0
// =============================================================================

/// Derives the per-mesh shader flags. Meshes whose subsurface flag flips
/// change acceleration structure placement and are marked for rebuild.
fn update_mesh_flags(scene: &mut Scene) {
    let Scene { meshes, shaders, .. } = scene;
    for mesh in meshes.iter_mut() {
        let used: Vec<&Shader> = mesh.used_shaders.iter().filter_map(|&s| shaders.get(s)).collect();
        let has_volume = used.iter().any(|s| s.has_volume);
        let has_surface_bssrdf = used.iter().any(|s| s.has_surface_bssrdf);
        if has_surface_bssrdf != mesh.has_surface_bssrdf {
            mesh.need_update = true;
            mesh.need_update_rebuild = true;
        }
        mesh.has_volume = has_volume;
        mesh.has_surface_bssrdf = has_surface_bssrdf;
    }
}

/// Bakes the placement of singly placed meshes into their vertices when
/// the scene structure is static, and undoes it otherwise.
fn apply_placements(scene: &mut Scene) {
    let targets: Vec<Option<DMat4>> = (0..scene.meshes.len())
        .map(|i| {
            let id = MeshId(i);
            if scene.params.bvh_type != BvhType::Static || scene.instance_count(id) != 1 {
                return None;
            }
            let object = scene.objects.iter().find(|o| o.mesh == id)?;
            let mesh = &scene.meshes[i];
            (!object.use_motion && !mesh.has_motion_blur()).then_some(object.transform)
        })
        .collect();

    for (mesh, target) in scene.meshes.iter_mut().zip(targets) {
        if mesh.applied_transform().copied() == target {
            continue;
        }
        mesh.unapply_transform();
        if let Some(matrix) = target {
            mesh.apply_transform(&matrix);
        }
        mesh.need_update = true;
        mesh.need_update_rebuild = true;
    }
}

/// Drops cached tessellation so every subdivided mesh is split and diced
/// again.
fn clear_geom_cache(scene: &mut Scene) {
    for mesh in &mut scene.meshes {
        if !mesh.patches.is_empty() {
            mesh.free_limit_data();
            mesh.need_split = true;
            mesh.need_update = true;
        }
    }
    scene.flags.need_clear_geom_cache = false;
}

#[cfg(test)]
mod tests;
