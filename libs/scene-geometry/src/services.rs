//! # Collaborator Services
//!
//! Capability traits for everything the geometry core delegates: patch
//! splitting, acceleration structure builds, displacement shading, shader
//! attribute requests, device upload, the object graph and progress.
//!
//! Implementations are shared across the worker pool, so all traits that
//! are called from parallel stages are `Send + Sync`.

use std::sync::atomic::{AtomicBool, Ordering};

use glam::{DMat4, DVec3};
use parking_lot::Mutex;
use thiserror::Error;

use crate::attribute::{AttributeId, AttributeRequestSet};
use crate::bounds::BoundBox;
use crate::mesh::Mesh;
use crate::scene::{MeshId, SceneParams};

pub use crate::subd::SplitService;

/// Opaque handle of an acceleration structure owned by a [`BvhBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BvhHandle(pub u64);

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    /// Human readable reason
    pub message: String,
}

impl ServiceError {
    /// Creates a service error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// =============================================================================
// SHADING
// =============================================================================

/// Answers which attributes shaders read.
pub trait AttributeResolver: Send + Sync {
    /// Requests of one shader, `None` for unknown shaders.
    fn shader_requests(&self, shader: u32) -> Option<&AttributeRequestSet>;

    /// True when the attribute is needed regardless of shader bindings.
    fn needs_global(&self, _id: &AttributeId) -> bool {
        false
    }
}

/// One vertex handed to the displacement shader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplacementSample {
    /// Vertex index in the mesh
    pub vertex: u32,
    /// A triangle using the vertex
    pub triangle: u32,
    /// Global shader index of that triangle
    pub shader: u32,
    /// Undisplaced position
    pub position: DVec3,
    /// Undisplaced normal
    pub normal: DVec3,
    /// Barycentric coordinates of the vertex in `triangle`
    pub barycentric: [f64; 2],
}

/// A batch of vertices of one mesh to displace.
#[derive(Debug, Clone, Copy)]
pub struct DisplacementRequest<'a> {
    /// Name of the mesh, for diagnostics
    pub mesh_name: &'a str,
    /// Vertices in ascending vertex order
    pub samples: &'a [DisplacementSample],
}

/// Evaluates displacement shaders.
pub trait DisplacementEvaluator: Send + Sync {
    /// Loads images used by displacement shaders before any evaluation.
    fn prepare_images(&self, _images: &[u32]) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Returns one offset per sample, in sample order.
    fn evaluate(&self, request: &DisplacementRequest<'_>) -> Result<Vec<DVec3>, ServiceError>;
}

// =============================================================================
// ACCELERATION STRUCTURES
// =============================================================================

/// One placement in the scene-level structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BvhInstance {
    /// Index of the object
    pub object: usize,
    /// Mesh the object places
    pub mesh: MeshId,
    /// The mesh's own structure, `None` when its primitives are merged
    pub bvh: Option<BvhHandle>,
    /// Object to world transform, identity when already applied
    pub transform: DMat4,
    /// First packed triangle of the mesh
    pub prim_offset: usize,
    /// World-space bounds
    pub bounds: BoundBox,
}

/// Input of the scene-level build.
#[derive(Debug, Clone, Copy)]
pub struct SceneBvhRequest<'a> {
    /// All placements
    pub instances: &'a [BvhInstance],
    /// Build settings
    pub params: &'a SceneParams,
}

/// Builds and refits acceleration structures.
pub trait BvhBuilder: Send + Sync {
    /// Builds the structure of one mesh.
    fn build_mesh(&self, mesh: &Mesh, params: &SceneParams) -> Result<BvhHandle, ServiceError>;

    /// Updates an existing mesh structure after vertices moved.
    fn refit_mesh(&self, handle: BvhHandle, mesh: &Mesh) -> Result<(), ServiceError>;

    /// Builds the top-level structure over all placements.
    fn build_scene(&self, request: &SceneBvhRequest<'_>) -> Result<BvhHandle, ServiceError>;

    /// Releases a structure.
    fn free(&self, handle: BvhHandle);
}

// =============================================================================
// DEVICE
// =============================================================================

/// Flattened buffers handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceBuffer {
    /// Three positions per triangle
    TriVerts,
    /// Vertex indices and first position per triangle
    TriVindex,
    /// Device shader id per triangle
    TriShader,
    /// Normal per vertex
    TriVnormal,
    /// Curve key position and radius
    CurveKeys,
    /// Curve records
    Curves,
    /// Patch records
    Patches,
    /// Attribute addressing table
    AttributeMap,
    /// Float attribute values
    AttributeFloat,
    /// Vector attribute values
    AttributeFloat3,
}

/// Receives packed buffers.
pub trait DeviceBackend: Send {
    /// Replaces the contents of a buffer.
    fn upload(&mut self, buffer: DeviceBuffer, bytes: &[u8]) -> Result<(), ServiceError>;

    /// Replaces the per-object records.
    fn upload_objects(&mut self, bytes: &[u8]) -> Result<(), ServiceError>;

    /// Releases everything uploaded so far.
    fn free_all(&mut self);
}

// =============================================================================
// SCENE QUERIES
// =============================================================================

/// Answers questions about placements.
pub trait ObjectGraph {
    /// Number of objects placing `mesh`.
    fn instance_count(&self, mesh: MeshId) -> usize;
}

/// Status reporting and cancellation of a long update.
pub trait Progress: Sync {
    /// Reports the current stage.
    fn set_status(&self, _status: &str, _substatus: &str) {}

    /// Polled between stages; true stops the pass early.
    fn is_cancelled(&self) -> bool;
}

/// Thread-safe [`Progress`] backed by an atomic cancel flag.
#[derive(Debug, Default)]
pub struct ProgressSignal {
    cancelled: AtomicBool,
    status: Mutex<(String, String)>,
}

impl ProgressSignal {
    /// Creates a signal that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Last reported status and substatus.
    pub fn status(&self) -> (String, String) {
        self.status.lock().clone()
    }
}

impl Progress for ProgressSignal {
    fn set_status(&self, status: &str, substatus: &str) {
        let mut current = self.status.lock();
        current.0.clear();
        current.0.push_str(status);
        current.1.clear();
        current.1.push_str(substatus);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
