//! # Geometry Errors
//!
//! Error types for geometry ingestion, dicing and the scene update pass.
//!
//! Errors fall into four classes:
//!
//! - **Input contract**: bad indices or edge factors, rejected by `add_*`/`set_*`
//! - **Degenerate geometry**: never an error, degrades to empty output
//! - **Service failure**: recorded per mesh in the update report
//! - **Resource exhaustion**: fatal for the current pass

use std::fmt;

use config::constants::ConfigError;
use thiserror::Error;

use crate::services::ServiceError;

/// Result alias used throughout the crate.
pub type GeometryResult<T> = Result<T, GeometryError>;

/// Pipeline stage a failure was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Adaptive patch splitting.
    Split,
    /// Displacement image preparation or evaluation.
    Displacement,
    /// Attribute resolution and packing.
    Attributes,
    /// Mesh tessellation and packing.
    Mesh,
    /// Acceleration structure build.
    Bvh,
    /// Device upload.
    Device,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Split => "split",
            Stage::Displacement => "displacement",
            Stage::Attributes => "attributes",
            Stage::Mesh => "mesh",
            Stage::Bvh => "bvh",
            Stage::Device => "device",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while building or updating scene geometry.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// An element index points outside its array
    #[error("{kind} index {index} out of range (len {len})")]
    IndexOutOfRange {
        /// Element kind, e.g. "vertex"
        kind: &'static str,
        /// Offending index
        index: usize,
        /// Array length at the time of the call
        len: usize,
    },

    /// Malformed curve definition
    #[error("Invalid curve: {message}")]
    InvalidCurve {
        /// What is wrong
        message: String,
    },

    /// Negative or misplaced edge tessellation factor
    #[error("Invalid edge factor {factor} on edge {edge}")]
    InvalidEdgeFactor {
        /// Edge within the subpatch
        edge: usize,
        /// Rejected factor
        factor: i32,
    },

    /// Two subpatches sharing an edge disagree on its factor
    #[error("Shared edge of patch {patch} has factor {first} and {second}")]
    MismatchedEdgeFactor {
        /// Patch whose split produced the second factor
        patch: u32,
        /// Factor seen first
        first: i32,
        /// Conflicting factor
        second: i32,
    },

    /// Malformed subpatch or dicing buffer
    #[error("Invalid subpatch: {message}")]
    InvalidSubPatch {
        /// What is wrong
        message: String,
    },

    /// Allocation failed while reserving storage
    #[error("Out of memory reserving {requested} {what}")]
    OutOfMemory {
        /// Storage being grown
        what: &'static str,
        /// Additional elements requested
        requested: usize,
    },

    /// A collaborator service failed
    #[error("{stage} service failed: {source}")]
    Service {
        /// Stage that called the service
        stage: Stage,
        /// Reported failure
        #[source]
        source: ServiceError,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The worker pool could not be created
    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl GeometryError {
    /// Creates an index out of range error.
    pub fn index(kind: &'static str, index: usize, len: usize) -> Self {
        Self::IndexOutOfRange { kind, index, len }
    }

    /// Creates an invalid curve error.
    pub fn invalid_curve(message: impl Into<String>) -> Self {
        Self::InvalidCurve {
            message: message.into(),
        }
    }

    /// Creates an invalid subpatch error.
    pub fn invalid_subpatch(message: impl Into<String>) -> Self {
        Self::InvalidSubPatch {
            message: message.into(),
        }
    }

    /// Creates an out of memory error.
    pub fn out_of_memory(what: &'static str, requested: usize) -> Self {
        Self::OutOfMemory { what, requested }
    }

    /// Wraps a collaborator failure raised in `stage`.
    pub fn service(stage: Stage, source: ServiceError) -> Self {
        Self::Service { stage, source }
    }

    /// Returns true for failures that abort the whole pass.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::WorkerPool(_))
    }
}

/// Reserves room for `additional` more elements, mapping failure to
/// [`GeometryError::OutOfMemory`].
pub(crate) fn try_reserve<T>(
    vec: &mut Vec<T>,
    additional: usize,
    what: &'static str,
) -> GeometryResult<()> {
    vec.try_reserve(additional)
        .map_err(|_| GeometryError::out_of_memory(what, additional))
}
