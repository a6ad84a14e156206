//! # Config Crate
//!
//! Centralized configuration constants for the scene geometry pipeline.
//! All magic numbers and tunable parameters are defined here to ensure
//! consistency across crates and easy configuration management.
//!
//! ## Usage
//!
//! ```rust
//! use config::constants::{EPSILON, DEFAULT_DICING_RATE, MAX_EDGE_FACTOR};
//!
//! // Use EPSILON for floating-point comparisons
//! let value: f64 = 0.00000000001; // 1e-11, smaller than EPSILON (1e-10)
//! assert!(value.abs() < EPSILON);
//!
//! // Clamp a requested tessellation factor
//! let factor = ((12.0 / DEFAULT_DICING_RATE).ceil() as i32).min(MAX_EDGE_FACTOR);
//! assert_eq!(factor, 12);
//! ```
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All constants defined once, used everywhere
//! - **Dependency-Free**: Pure constants and validation, no external crates
//! - **Well-Documented**: Every constant has clear documentation

pub mod constants;
