//! # Scene Geometry
//!
//! Renderable geometry of an offline renderer: per-mesh storage of
//! triangles, curves and subdivision patches, crack-free patch dicing,
//! update tracking, device packing and the scene-wide update pass.
//!
//! ## Architecture
//!
//! ```text
//! Geometry Store → Dicing Engine → Update Tracker → Device Packer → Mesh Manager
//!   (mesh)          (subd)          (mesh::update)    (pack)          (manager)
//! ```
//!
//! Acceleration structures, displacement shading, patch splitting and the
//! device are reached only through the traits in [`services`].
//!
//! ## Usage
//!
//! ```
//! use glam::DVec3;
//! use scene_geometry::Mesh;
//!
//! let mut mesh = Mesh::new("tri");
//! mesh.reserve(3, 1, 0, 0, 0).unwrap();
//! for p in [DVec3::ZERO, DVec3::X, DVec3::Y] {
//!     mesh.add_vertex(p);
//! }
//! mesh.add_triangle(0, 1, 2, 0, true).unwrap();
//! let copy = mesh.split_vertex(1).unwrap();
//! assert_eq!(copy, 3);
//! ```

pub mod attribute;
pub mod bounds;
pub mod error;
pub mod manager;
pub mod mesh;
pub mod pack;
pub mod scene;
pub mod services;
pub mod settings;
pub mod subd;

pub use attribute::{AttributeId, AttributeRequestSet, AttributeStandard};
pub use bounds::BoundBox;
pub use error::{GeometryError, GeometryResult, Stage};
pub use manager::{MeshManager, Services, UpdateReport, UpdateStatus};
pub use mesh::{DisplacementMethod, Mesh, SubdivisionType};
pub use scene::{MeshId, Object, Scene, SceneParams, Shader};
pub use subd::{DicedSize, EdgeLengthSplit, SubPatch};
