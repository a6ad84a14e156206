//! Acceleration structure stage.
//!
//! A mesh needing its own structure gets exactly one, however many objects
//! place it. Meshes with a baked placement are merged into the scene
//! structure instead and drop any structure they held.

use glam::DMat4;
use rayon::prelude::*;

use super::{MeshManager, PassState};
use crate::error::{GeometryError, GeometryResult, Stage};
use crate::scene::{BvhType, MeshId, Scene};
use crate::services::{BvhHandle, BvhInstance, ObjectGraph, SceneBvhRequest, ServiceError};

#[derive(Debug, Clone, Copy)]
enum BvhJob {
    Build { old: Option<BvhHandle> },
    Refit(BvhHandle),
}

impl MeshManager {
    /// Builds or refits mesh structures, then the scene structure.
    pub(super) fn device_update_bvh(
        &mut self,
        scene: &mut Scene,
        state: &mut PassState,
    ) -> GeometryResult<()> {
        let builder = self.services.bvh.as_ref();
        let dynamic = scene.params.bvh_type == BvhType::Dynamic;

        let users: Vec<usize> = (0..scene.meshes.len())
            .map(|i| scene.instance_count(MeshId(i)))
            .collect();

        let mut jobs = Vec::new();
        for (i, mesh) in scene.meshes.iter_mut().enumerate() {
            if !mesh.need_build_bvh() {
                if let Some(handle) = mesh.bvh.take() {
                    builder.free(handle);
                }
                continue;
            }
            if users[i] == 0 {
                continue;
            }
            match mesh.bvh {
                Some(handle) if dynamic && mesh.need_update && !mesh.need_update_rebuild => {
                    jobs.push((i, BvhJob::Refit(handle)));
                }
                old if mesh.need_update || old.is_none() => {
                    jobs.push((i, BvhJob::Build { old }));
                }
                _ => {}
            }
        }

        let meshes = &scene.meshes;
        let params = &scene.params;
        let results: Vec<(usize, BvhJob, Result<Option<BvhHandle>, ServiceError>)> =
            self.pool.install(|| {
                jobs.par_iter()
                    .map(|&(i, job)| {
                        let result = match job {
                            BvhJob::Build { .. } => builder.build_mesh(&meshes[i], params).map(Some),
                            BvhJob::Refit(handle) => builder.refit_mesh(handle, &meshes[i]).map(|_| None),
                        };
                        (i, job, result)
                    })
                    .collect()
            });

        for (i, job, result) in results {
            match (job, result) {
                (BvhJob::Build { old }, Ok(handle)) => {
                    // The old structure stays valid until its replacement exists.
                    if let Some(old) = old {
                        builder.free(old);
                    }
                    scene.meshes[i].bvh = handle;
                    state.report.stats.bvh_builds += 1;
                }
                (BvhJob::Refit(_), Ok(_)) => state.report.stats.bvh_refits += 1,
                (_, Err(err)) => {
                    state.record(Some(i), Stage::Bvh, GeometryError::service(Stage::Bvh, err))?;
                }
            }
        }
        log::debug!(
            "mesh BVH: {} built, {} refit",
            state.report.stats.bvh_builds,
            state.report.stats.bvh_refits
        );

        let instances: Vec<BvhInstance> = scene
            .objects
            .iter()
            .enumerate()
            .filter_map(|(index, object)| {
                let mesh = scene.mesh(object.mesh)?;
                let transform = if mesh.transform_applied {
                    DMat4::IDENTITY
                } else {
                    object.transform
                };
                Some(BvhInstance {
                    object: index,
                    mesh: object.mesh,
                    bvh: if mesh.need_build_bvh() { mesh.bvh } else { None },
                    transform,
                    prim_offset: mesh.tri_offset,
                    bounds: mesh.bounds.transformed(&transform),
                })
            })
            .collect();

        let request = SceneBvhRequest {
            instances: &instances,
            params: &scene.params,
        };
        match builder.build_scene(&request) {
            Ok(handle) => {
                if let Some(old) = self.bvh.replace(handle) {
                    builder.free(old);
                }
            }
            Err(err) => state.record(None, Stage::Bvh, GeometryError::service(Stage::Bvh, err))?,
        }
        Ok(())
    }
}
