//! # Configuration Constants
//!
//! Centralized constants for the scene geometry pipeline. Tessellation
//! parameters, precision values, motion defaults and worker pool sizing are
//! defined here.
//!
//! ## Categories
//!
//! - **Precision**: Floating-point comparison tolerances
//! - **Dicing**: Default tessellation parameters for subdivision patches
//! - **Motion**: Motion blur sampling defaults
//! - **Scheduling**: Worker pool sizing

use std::fmt;

// =============================================================================
// PRECISION CONSTANTS
// =============================================================================

/// Epsilon for floating-point comparisons.
///
/// Used for determining if two floating-point values are "equal" within
/// numerical tolerance.
///
/// # Example
///
/// ```rust
/// use config::constants::EPSILON;
///
/// fn approximately_equal(a: f64, b: f64) -> bool {
///     (a - b).abs() < EPSILON
/// }
///
/// assert!(approximately_equal(1.0, 1.0 + 1e-11));
/// ```
pub const EPSILON: f64 = 1e-10;

/// Squared-area threshold below which a face or patch counts as degenerate.
///
/// Degenerate faces are skipped when accumulating vertex normals and
/// degenerate patches are never split into subpatches.
///
/// # Example
///
/// ```rust
/// use config::constants::DEGENERATE_AREA_EPSILON;
///
/// let doubled_area: f64 = 0.0;
/// assert!(doubled_area * doubled_area <= DEGENERATE_AREA_EPSILON);
/// ```
pub const DEGENERATE_AREA_EPSILON: f64 = 1e-24;

// =============================================================================
// DICING CONSTANTS
// =============================================================================

/// Default dicing rate in object-space units per diced segment.
///
/// The built-in edge-length split service divides each patch edge into
/// `ceil(length / rate)` segments.
///
/// # Example
///
/// ```rust
/// use config::constants::DEFAULT_DICING_RATE;
///
/// let edge_length = 4.0;
/// let segments = (edge_length / DEFAULT_DICING_RATE).ceil() as i32;
/// assert_eq!(segments, 4);
/// ```
pub const DEFAULT_DICING_RATE: f64 = 1.0;

/// Upper bound on a single edge tessellation factor.
///
/// Safety limit to keep a single subpatch from exploding into millions of
/// triangles when the dicing rate is tiny relative to the geometry.
///
/// # Example
///
/// ```rust
/// use config::constants::MAX_EDGE_FACTOR;
///
/// let requested = 10_000;
/// assert_eq!(requested.min(MAX_EDGE_FACTOR), MAX_EDGE_FACTOR);
/// ```
pub const MAX_EDGE_FACTOR: i32 = 128;

// =============================================================================
// MOTION CONSTANTS
// =============================================================================

/// Default number of motion blur time samples per vertex.
///
/// The center step is the static geometry; the remaining steps are stored
/// as motion attributes.
///
/// # Example
///
/// ```rust
/// use config::constants::DEFAULT_MOTION_STEPS;
///
/// let extra_steps = DEFAULT_MOTION_STEPS - 1;
/// assert_eq!(extra_steps, 2);
/// ```
pub const DEFAULT_MOTION_STEPS: u32 = 3;

// =============================================================================
// SCHEDULING CONSTANTS
// =============================================================================

/// Default worker pool size. Zero lets the pool pick one thread per core.
///
/// # Example
///
/// ```rust
/// use config::constants::DEFAULT_WORKER_THREADS;
///
/// assert_eq!(DEFAULT_WORKER_THREADS, 0);
/// ```
pub const DEFAULT_WORKER_THREADS: usize = 0;

// =============================================================================
// VALIDATED CONFIGURATION
// =============================================================================

/// Immutable snapshot of geometry settings that can be shared between crates.
///
/// # Examples
/// ```
/// use config::constants::GeometryConfig;
/// let config = GeometryConfig::default();
/// assert!(config.tolerance > 0.0);
/// assert!(config.max_edge_factor >= 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryConfig {
    /// Numeric tolerance propagated into geometry kernels.
    pub tolerance: f64,
    /// Object-space length of one diced segment.
    pub dicing_rate: f64,
    /// Largest edge tessellation factor a split may request.
    pub max_edge_factor: i32,
    /// Worker pool size, zero for one thread per core.
    pub worker_threads: usize,
}

impl GeometryConfig {
    /// Builds a configuration enforcing strict validation of every value.
    ///
    /// # Examples
    /// ```
    /// use config::constants::GeometryConfig;
    /// let cfg = GeometryConfig::new(1.0e-9, 0.5, 32, 4).expect("valid config");
    /// assert_eq!(cfg.max_edge_factor, 32);
    /// ```
    pub fn new(
        tolerance: f64,
        dicing_rate: f64,
        max_edge_factor: i32,
        worker_threads: usize,
    ) -> Result<Self, ConfigError> {
        if tolerance.is_nan() || tolerance <= 0.0 {
            return Err(ConfigError::InvalidTolerance(tolerance));
        }
        if !dicing_rate.is_finite() || dicing_rate <= 0.0 {
            return Err(ConfigError::InvalidDicingRate(dicing_rate));
        }
        if max_edge_factor < 1 {
            return Err(ConfigError::InvalidEdgeFactor(max_edge_factor));
        }
        Ok(Self {
            tolerance,
            dicing_rate,
            max_edge_factor,
            worker_threads,
        })
    }
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            tolerance: EPSILON,
            dicing_rate: DEFAULT_DICING_RATE,
            max_edge_factor: MAX_EDGE_FACTOR,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

/// Error returned when invalid configuration values are provided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigError {
    /// Raised when tolerance is zero, negative or NaN.
    InvalidTolerance(f64),
    /// Raised when the dicing rate is not a positive finite number.
    InvalidDicingRate(f64),
    /// Raised when the maximum edge factor is below one.
    InvalidEdgeFactor(i32),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidTolerance(value) => {
                write!(f, "tolerance must be positive: {value}")
            }
            ConfigError::InvalidDicingRate(value) => {
                write!(f, "dicing_rate must be positive and finite: {value}")
            }
            ConfigError::InvalidEdgeFactor(value) => {
                write!(f, "max_edge_factor must be >= 1: {value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
