//! Manager-level configuration building on the shared `config` crate.
//!
//! Components read tunables from here instead of literal constants.

use config::constants::GeometryConfig;

use crate::error::GeometryResult;
use crate::subd::EdgeLengthSplit;

/// Configuration of a [`MeshManager`](crate::manager::MeshManager).
///
/// # Examples
/// ```
/// use scene_geometry::settings::ManagerConfig;
/// let cfg = ManagerConfig::default();
/// assert!(cfg.geometry.dicing_rate > 0.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ManagerConfig {
    /// Validated geometry settings.
    pub geometry: GeometryConfig,
}

impl ManagerConfig {
    /// Creates a configuration from explicit values.
    ///
    /// # Examples
    /// ```
    /// use scene_geometry::settings::ManagerConfig;
    /// let cfg = ManagerConfig::new(1.0e-9, 0.25, 64, 2).unwrap();
    /// assert_eq!(cfg.geometry.worker_threads, 2);
    /// assert!(ManagerConfig::new(1.0e-9, -1.0, 64, 2).is_err());
    /// ```
    pub fn new(
        tolerance: f64,
        dicing_rate: f64,
        max_edge_factor: i32,
        worker_threads: usize,
    ) -> GeometryResult<Self> {
        let geometry = GeometryConfig::new(tolerance, dicing_rate, max_edge_factor, worker_threads)?;
        Ok(Self { geometry })
    }

    /// Split service dicing at the configured rate.
    pub fn edge_length_split(&self) -> EdgeLengthSplit {
        EdgeLengthSplit::from_config(&self.geometry)
    }

    /// Builds the bounded worker pool. Zero threads means one per core.
    pub fn thread_pool(&self) -> GeometryResult<rayon::ThreadPool> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.geometry.worker_threads)
            .thread_name(|i| format!("scene-geometry-{i}"))
            .build()?;
        Ok(pool)
    }
}

impl From<GeometryConfig> for ManagerConfig {
    fn from(geometry: GeometryConfig) -> Self {
        Self { geometry }
    }
}
