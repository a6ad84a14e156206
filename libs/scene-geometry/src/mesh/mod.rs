//! # Mesh Geometry Store
//!
//! Per-mesh arenas of vertices, triangles, curves and subdivision patches,
//! with the attributes that travel alongside them.
//!
//! Cross references are plain `u32` indices into the arenas. Every index is
//! validated when it enters the store (`add_*`/`set_*`), so dicing and
//! packing can index without further checks.
//!
//! All geometry is stored in f64. Narrowing to f32 only happens when the
//! mesh is packed into device buffers.

mod normals;
mod update;

use bitflags::bitflags;
use glam::{DMat4, DVec3};
use serde::{Deserialize, Serialize};

use crate::attribute::{
    Attribute, AttributeElement, AttributeId, AttributeSet, AttributeStandard, AttributeType,
    ElementCounts,
};
use crate::bounds::BoundBox;
use crate::error::{try_reserve, GeometryError, GeometryResult};
use crate::services::{AttributeResolver, BvhHandle};
use crate::subd::{LimitData, SubPatch};

pub(crate) use normals::{face_normal, vertex_normals};

/// Marker in `Patch::v[3]` for a triangular patch.
pub const NO_VERTEX: u32 = u32::MAX;

// =============================================================================
// PRIMITIVES
// =============================================================================

/// A triangle referencing three vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triangle {
    /// Vertex indices, counter-clockwise
    pub v: [u32; 3],
    /// Slot in the mesh's `used_shaders`
    pub shader: u32,
    /// Interpolate vertex normals when shading
    pub smooth: bool,
}

/// A control point of a curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveKey {
    /// Position
    pub position: DVec3,
    /// Curve radius at this key
    pub radius: f64,
}

/// A curve built from a contiguous range of curve keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Curve {
    /// First key index
    pub first_key: u32,
    /// Number of keys, at least two
    pub num_keys: u32,
    /// Slot in the mesh's `used_shaders`
    pub shader: u32,
}

impl Curve {
    /// Number of segments between consecutive keys.
    #[inline]
    pub fn num_segments(&self) -> u32 {
        self.num_keys.saturating_sub(1)
    }

    /// Index range of the keys.
    #[inline]
    pub fn keys(&self) -> std::ops::Range<usize> {
        let first = self.first_key as usize;
        first..first + self.num_keys as usize
    }
}

/// A coarse subdivision face. `v[3] == NO_VERTEX` marks a triangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Corner vertex indices, counter-clockwise
    pub v: [u32; 4],
    /// Slot in the mesh's `used_shaders`
    pub shader: u32,
    /// Interpolate vertex normals when shading
    pub smooth: bool,
}

impl Patch {
    /// True for four-sided patches.
    #[inline]
    pub fn is_quad(&self) -> bool {
        self.v[3] != NO_VERTEX
    }

    /// Number of corners, 3 or 4.
    #[inline]
    pub fn num_corners(&self) -> usize {
        if self.is_quad() {
            4
        } else {
            3
        }
    }

    /// The corner indices that are in use.
    #[inline]
    pub fn corners(&self) -> &[u32] {
        &self.v[..self.num_corners()]
    }
}

/// How shader displacement is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplacementMethod {
    /// Approximated in shading only
    #[default]
    Bump,
    /// Vertices are moved
    True,
    /// Vertices are moved and shading bump is kept
    Both,
}

/// How patches are refined before dicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubdivisionType {
    /// Patches are not diced
    #[default]
    None,
    /// Bilinear interpolation of the patch corners
    Linear,
    /// Catmull-Clark limit surface
    CatmullClark,
}

bitflags! {
    /// Which primitive kinds have been created on a mesh.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct GeometryFlags: u8 {
        /// Triangles (or patches) were added
        const TRIANGLES = 1 << 0;
        /// Curves were added
        const CURVES = 1 << 1;
    }
}

/// Vertex and triangle counts of the coarse geometry that dicing appends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CoarseRange {
    pub verts: usize,
    pub tris: usize,
}

// =============================================================================
// MESH
// =============================================================================

/// Renderable geometry of one mesh.
///
/// # Example
///
/// ```rust
/// use scene_geometry::Mesh;
/// use glam::DVec3;
///
/// let mut mesh = Mesh::new("tri");
/// mesh.reserve(3, 1, 0, 0, 0).unwrap();
/// mesh.add_vertex(DVec3::ZERO);
/// mesh.add_vertex(DVec3::X);
/// mesh.add_vertex(DVec3::Y);
/// mesh.add_triangle(0, 1, 2, 0, true).unwrap();
/// assert_eq!(mesh.triangle_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Mesh {
    /// Display name, used in logs and failure reports
    pub name: String,

    pub(crate) vertices: Vec<DVec3>,
    pub(crate) triangles: Vec<Triangle>,
    pub(crate) curve_keys: Vec<CurveKey>,
    pub(crate) curves: Vec<Curve>,
    pub(crate) patches: Vec<Patch>,
    pub(crate) subpatches: Vec<SubPatch>,
    pub(crate) limit_data: Option<LimitData>,

    pub(crate) attributes: AttributeSet,
    pub(crate) curve_attributes: AttributeSet,

    /// Global shader table indices, addressed by primitive shader slots
    pub used_shaders: Vec<u32>,
    pub(crate) geometry_flags: GeometryFlags,

    /// Bounds of the geometry, refreshed by `compute_bounds`
    pub bounds: BoundBox,
    /// Vertices were moved into the placement's space
    pub transform_applied: bool,
    /// The applied transform mirrors geometry
    pub transform_negative_scaled: bool,
    /// Normal matrix of the applied transform
    pub transform_normal: DMat4,
    pub(crate) applied_transform: Option<DMat4>,

    /// How displacement shaders are applied
    pub displacement_method: DisplacementMethod,
    /// Scale on displacement offsets
    pub displacement_scale: f64,
    /// Patch refinement mode
    pub subdivision_type: SubdivisionType,
    pub(crate) motion_steps: u32,
    /// Render with motion blur when motion data is present
    pub use_motion_blur: bool,

    /// A bound shader has a volume closure
    pub has_volume: bool,
    /// A bound shader has subsurface scattering
    pub has_surface_bssrdf: bool,

    pub(crate) need_update: bool,
    pub(crate) need_update_rebuild: bool,
    pub(crate) need_split: bool,
    pub(crate) need_dice: bool,
    pub(crate) coarse: Option<CoarseRange>,

    /// Acceleration structure built for this mesh
    pub bvh: Option<BvhHandle>,

    /// First vertex in the scene-wide vertex buffers
    pub vert_offset: usize,
    /// First triangle in the scene-wide triangle buffers
    pub tri_offset: usize,
    /// First curve in the scene-wide curve buffer
    pub curve_offset: usize,
    /// First key in the scene-wide curve key buffer
    pub curvekey_offset: usize,
    /// First patch in the scene-wide patch buffer
    pub patch_offset: usize,
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new("")
    }
}

impl Mesh {
    /// Creates an empty mesh. New meshes start out needing an update.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vertices: Vec::new(),
            triangles: Vec::new(),
            curve_keys: Vec::new(),
            curves: Vec::new(),
            patches: Vec::new(),
            subpatches: Vec::new(),
            limit_data: None,
            attributes: AttributeSet::new(),
            curve_attributes: AttributeSet::new(),
            used_shaders: Vec::new(),
            geometry_flags: GeometryFlags::empty(),
            bounds: BoundBox::EMPTY,
            transform_applied: false,
            transform_negative_scaled: false,
            transform_normal: DMat4::IDENTITY,
            applied_transform: None,
            displacement_method: DisplacementMethod::Bump,
            displacement_scale: 1.0,
            subdivision_type: SubdivisionType::None,
            motion_steps: config::constants::DEFAULT_MOTION_STEPS,
            use_motion_blur: false,
            has_volume: false,
            has_surface_bssrdf: false,
            need_update: true,
            need_update_rebuild: false,
            need_split: false,
            need_dice: false,
            coarse: None,
            bvh: None,
            vert_offset: 0,
            tri_offset: 0,
            curve_offset: 0,
            curvekey_offset: 0,
            patch_offset: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Capacity
    // -------------------------------------------------------------------------

    /// Grows capacity to hold at least the given totals. Never shrinks.
    pub fn reserve(
        &mut self,
        verts: usize,
        tris: usize,
        curves: usize,
        curve_keys: usize,
        patches: usize,
    ) -> GeometryResult<()> {
        let additional = verts.saturating_sub(self.vertices.len());
        try_reserve(&mut self.vertices, additional, "vertices")?;
        let additional = tris.saturating_sub(self.triangles.len());
        try_reserve(&mut self.triangles, additional, "triangles")?;
        let additional = curves.saturating_sub(self.curves.len());
        try_reserve(&mut self.curves, additional, "curves")?;
        let additional = curve_keys.saturating_sub(self.curve_keys.len());
        try_reserve(&mut self.curve_keys, additional, "curve keys")?;
        let additional = patches.saturating_sub(self.patches.len());
        try_reserve(&mut self.patches, additional, "patches")?;
        if tris > 0 || patches > 0 {
            self.geometry_flags |= GeometryFlags::TRIANGLES;
        }
        if curves > 0 {
            self.geometry_flags |= GeometryFlags::CURVES;
        }
        Ok(())
    }

    /// Drops all geometry and attributes. Settings and shader bindings stay.
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.triangles.clear();
        self.curve_keys.clear();
        self.curves.clear();
        self.patches.clear();
        self.subpatches.clear();
        self.limit_data = None;
        self.attributes.clear();
        self.curve_attributes.clear();
        self.geometry_flags = GeometryFlags::empty();
        self.bounds = BoundBox::EMPTY;
        self.transform_applied = false;
        self.transform_negative_scaled = false;
        self.transform_normal = DMat4::IDENTITY;
        self.applied_transform = None;
        self.need_split = false;
        self.need_dice = false;
        self.coarse = None;
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Vertex positions.
    #[inline]
    pub fn vertices(&self) -> &[DVec3] {
        &self.vertices
    }

    /// Mutable vertex positions. The vertex count cannot change.
    ///
    /// Counts as an edit: displacement and diced output are dropped first,
    /// so the slice holds only the authored vertices.
    pub fn vertices_mut(&mut self) -> &mut [DVec3] {
        self.geometry_edited();
        &mut self.vertices
    }

    /// Triangles.
    #[inline]
    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    /// Curve keys.
    #[inline]
    pub fn curve_keys(&self) -> &[CurveKey] {
        &self.curve_keys
    }

    /// Curves.
    #[inline]
    pub fn curves(&self) -> &[Curve] {
        &self.curves
    }

    /// Coarse subdivision patches.
    #[inline]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Subpatches produced by the last split.
    #[inline]
    pub fn subpatches(&self) -> &[SubPatch] {
        &self.subpatches
    }

    /// Number of vertices.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of triangles.
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Number of curves.
    #[inline]
    pub fn curve_count(&self) -> usize {
        self.curves.len()
    }

    /// Number of curve keys.
    #[inline]
    pub fn curve_key_count(&self) -> usize {
        self.curve_keys.len()
    }

    /// Number of patches.
    #[inline]
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Number of subpatches.
    #[inline]
    pub fn subpatch_count(&self) -> usize {
        self.subpatches.len()
    }

    /// Total curve segments.
    pub fn curve_segment_count(&self) -> usize {
        self.curves.iter().map(|c| c.num_segments() as usize).sum()
    }

    /// Primitive kinds created on this mesh.
    #[inline]
    pub fn geometry_flags(&self) -> GeometryFlags {
        self.geometry_flags
    }

    /// Triangle attributes.
    #[inline]
    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// Curve attributes.
    #[inline]
    pub fn curve_attributes(&self) -> &AttributeSet {
        &self.curve_attributes
    }

    /// Total motion steps including the center step.
    #[inline]
    pub fn motion_steps(&self) -> u32 {
        self.motion_steps
    }

    /// Cached smooth subdivision control grids.
    #[inline]
    pub fn limit_data(&self) -> Option<&LimitData> {
        self.limit_data.as_ref()
    }

    /// Element counts used to size attributes.
    pub fn element_counts(&self) -> ElementCounts {
        ElementCounts {
            verts: self.vertices.len(),
            tris: self.triangles.len(),
            curves: self.curves.len(),
            curve_keys: self.curve_keys.len(),
            motion_steps: self.motion_steps as usize,
        }
    }

    /// Global shader index of a primitive shader slot. Unbound slots fall
    /// back to the default shader at index 0.
    #[inline]
    pub fn shader_for_slot(&self, slot: u32) -> u32 {
        self.used_shaders.get(slot as usize).copied().unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Attributes
    // -------------------------------------------------------------------------

    /// Adds (or returns) a standard triangle attribute.
    pub fn add_attribute(&mut self, std: AttributeStandard) -> &mut Attribute {
        let counts = self.element_counts();
        self.attributes.add_standard(std, false, &counts)
    }

    /// Adds (or returns) a standard curve attribute.
    pub fn add_curve_attribute(&mut self, std: AttributeStandard) -> &mut Attribute {
        let counts = self.element_counts();
        self.curve_attributes.add_standard(std, true, &counts)
    }

    /// Adds (or returns) a custom triangle attribute.
    pub fn add_named_attribute(
        &mut self,
        name: impl Into<String>,
        element: AttributeElement,
        kind: AttributeType,
    ) -> &mut Attribute {
        let counts = self.element_counts();
        self.attributes.add(AttributeId::Name(name.into()), element, kind, &counts)
    }

    /// Removes a triangle attribute. Returns true if it existed.
    pub fn remove_attribute(&mut self, id: &AttributeId) -> bool {
        self.attributes.remove(id)
    }

    /// Sets the number of motion steps, resizing motion attributes.
    pub fn set_motion_steps(&mut self, steps: u32) {
        let old = self.element_counts();
        self.motion_steps = steps.max(1);
        let new = self.element_counts();
        self.attributes.resize(&old, &new);
        self.curve_attributes.resize(&old, &new);
    }

    /// True when a shader bound to this mesh requests the attribute.
    pub fn need_attribute(&self, resolver: &dyn AttributeResolver, id: &AttributeId) -> bool {
        if resolver.needs_global(id) {
            return true;
        }
        self.used_shaders.iter().any(|&shader| {
            resolver
                .shader_requests(shader)
                .is_some_and(|requests| requests.contains(id))
        })
    }

    // -------------------------------------------------------------------------
    // Vertices
    // -------------------------------------------------------------------------

    /// Adds a vertex and returns its index.
    pub fn add_vertex(&mut self, position: DVec3) -> u32 {
        self.geometry_edited();
        let old = self.element_counts();
        let index = self.vertices.len() as u32;
        self.vertices.push(position);
        self.grow_attributes(&old);
        index
    }

    /// Moves an existing vertex.
    pub fn set_vertex(&mut self, index: u32, position: DVec3) -> GeometryResult<()> {
        self.check_vertex(index)?;
        self.geometry_edited();
        self.vertices[index as usize] = position;
        Ok(())
    }

    /// Duplicates a vertex with all its vertex and motion attribute values.
    ///
    /// Returns the index of the copy. Triangles keep referencing the
    /// original until they are re-pointed with `set_triangle`.
    pub fn split_vertex(&mut self, index: u32) -> GeometryResult<u32> {
        self.check_vertex(index)?;
        self.geometry_edited();
        let counts = self.element_counts();
        let copy = self.vertices.len() as u32;
        self.vertices.push(self.vertices[index as usize]);
        self.attributes.duplicate_vertex(index as usize, &counts);
        Ok(copy)
    }

    // -------------------------------------------------------------------------
    // Triangles
    // -------------------------------------------------------------------------

    /// Appends a triangle.
    pub fn add_triangle(
        &mut self,
        v0: u32,
        v1: u32,
        v2: u32,
        shader: u32,
        smooth: bool,
    ) -> GeometryResult<()> {
        let triangle = self.checked_triangle(v0, v1, v2, shader, smooth)?;
        self.geometry_edited();
        let old = self.element_counts();
        self.triangles.push(triangle);
        self.grow_attributes(&old);
        self.geometry_flags |= GeometryFlags::TRIANGLES;
        Ok(())
    }

    /// Replaces an existing triangle.
    pub fn set_triangle(
        &mut self,
        index: usize,
        v0: u32,
        v1: u32,
        v2: u32,
        shader: u32,
        smooth: bool,
    ) -> GeometryResult<()> {
        let count = self.coarse.map_or(self.triangles.len(), |range| range.tris);
        if index >= count {
            return Err(GeometryError::index("triangle", index, count));
        }
        let triangle = self.checked_triangle(v0, v1, v2, shader, smooth)?;
        self.geometry_edited();
        self.triangles[index] = triangle;
        Ok(())
    }

    fn checked_triangle(
        &self,
        v0: u32,
        v1: u32,
        v2: u32,
        shader: u32,
        smooth: bool,
    ) -> GeometryResult<Triangle> {
        for v in [v0, v1, v2] {
            self.check_vertex(v)?;
        }
        Ok(Triangle {
            v: [v0, v1, v2],
            shader,
            smooth,
        })
    }

    // -------------------------------------------------------------------------
    // Curves
    // -------------------------------------------------------------------------

    /// Adds a curve key and returns its index.
    pub fn add_curve_key(&mut self, position: DVec3, radius: f64) -> u32 {
        let old = self.element_counts();
        let index = self.curve_keys.len() as u32;
        self.curve_keys.push(CurveKey { position, radius });
        let new = self.element_counts();
        self.curve_attributes.resize(&old, &new);
        index
    }

    /// Adds a curve over `num_keys` consecutive keys starting at `first_key`.
    pub fn add_curve(&mut self, first_key: u32, num_keys: u32, shader: u32) -> GeometryResult<()> {
        if num_keys < 2 {
            return Err(GeometryError::invalid_curve(format!(
                "curve needs at least 2 keys, got {num_keys}"
            )));
        }
        let end = first_key as usize + num_keys as usize;
        if end > self.curve_keys.len() {
            return Err(GeometryError::index("curve key", end - 1, self.curve_keys.len()));
        }
        let old = self.element_counts();
        self.curves.push(Curve {
            first_key,
            num_keys,
            shader,
        });
        let new = self.element_counts();
        self.curve_attributes.resize(&old, &new);
        self.geometry_flags |= GeometryFlags::CURVES;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Patches
    // -------------------------------------------------------------------------

    /// Appends a subdivision patch. Pass `NO_VERTEX` as `v3` for a triangle.
    pub fn add_patch(
        &mut self,
        v: [u32; 4],
        shader: u32,
        smooth: bool,
    ) -> GeometryResult<()> {
        let patch = self.checked_patch(v, shader, smooth)?;
        self.geometry_edited();
        self.patches.push(patch);
        self.patches_edited();
        Ok(())
    }

    /// Replaces an existing patch.
    pub fn set_patch(
        &mut self,
        index: usize,
        v: [u32; 4],
        shader: u32,
        smooth: bool,
    ) -> GeometryResult<()> {
        if index >= self.patches.len() {
            return Err(GeometryError::index("patch", index, self.patches.len()));
        }
        let patch = self.checked_patch(v, shader, smooth)?;
        self.geometry_edited();
        self.patches[index] = patch;
        self.patches_edited();
        Ok(())
    }

    fn checked_patch(&self, v: [u32; 4], shader: u32, smooth: bool) -> GeometryResult<Patch> {
        for &index in &v[..3] {
            self.check_vertex(index)?;
        }
        if v[3] != NO_VERTEX {
            self.check_vertex(v[3])?;
        }
        Ok(Patch { v, shader, smooth })
    }

    fn patches_edited(&mut self) {
        self.subpatches.clear();
        self.limit_data = None;
        self.need_split = true;
        self.geometry_flags |= GeometryFlags::TRIANGLES;
    }

    // -------------------------------------------------------------------------
    // Derived data
    // -------------------------------------------------------------------------

    /// Recomputes `bounds` from vertices, curve keys and, with motion blur,
    /// the motion positions. Non-finite points are skipped.
    pub fn compute_bounds(&mut self) {
        let mut bounds = BoundBox::EMPTY;
        let mut skipped = 0usize;

        for &p in &self.vertices {
            skipped += usize::from(!bounds.grow_safe(p));
        }
        for key in &self.curve_keys {
            skipped += usize::from(!bounds.grow_safe_radius(key.position, key.radius));
        }

        if self.use_motion_blur {
            if let Some(motion) = self
                .attributes
                .find_std(AttributeStandard::MotionVertexPosition)
                .and_then(Attribute::vectors)
            {
                for &p in motion {
                    skipped += usize::from(!bounds.grow_safe(p));
                }
            }
            if let Some(motion) = self
                .curve_attributes
                .find_std(AttributeStandard::MotionVertexPosition)
                .and_then(Attribute::vectors)
            {
                let keys = self.curve_keys.len().max(1);
                for (i, &p) in motion.iter().enumerate() {
                    let radius = self.curve_keys.get(i % keys).map_or(0.0, |k| k.radius);
                    skipped += usize::from(!bounds.grow_safe_radius(p, radius));
                }
            }
        }

        if skipped > 0 {
            log::debug!("{}: skipped {} non-finite points in bounds", self.name, skipped);
        }
        self.bounds = if bounds.valid() { bounds } else { BoundBox::EMPTY };
    }

    // -------------------------------------------------------------------------
    // Transforms
    // -------------------------------------------------------------------------

    /// Moves the geometry into the space of its single placement.
    ///
    /// Normal attributes are transformed with the inverse transpose. Stored
    /// normals follow triangle winding, so they are negated under mirroring
    /// transforms and flipped back when packed.
    pub fn apply_transform(&mut self, matrix: &DMat4) {
        self.transform_geometry(matrix);
        self.transform_applied = true;
        self.transform_negative_scaled = matrix.determinant() < 0.0;
        self.transform_normal = matrix.inverse().transpose();
        self.applied_transform = Some(*matrix);
        self.compute_bounds();
    }

    /// Moves the geometry back into object space. No-op when no transform
    /// is applied.
    pub fn unapply_transform(&mut self) {
        if let Some(matrix) = self.applied_transform.take() {
            self.transform_geometry(&matrix.inverse());
            self.transform_applied = false;
            self.transform_negative_scaled = false;
            self.transform_normal = DMat4::IDENTITY;
            self.compute_bounds();
        }
    }

    /// The transform currently baked into the vertices.
    #[inline]
    pub fn applied_transform(&self) -> Option<&DMat4> {
        self.applied_transform.as_ref()
    }

    fn transform_geometry(&mut self, matrix: &DMat4) {
        let normal_matrix = matrix.inverse().transpose();
        let det = matrix.determinant();
        let flip = if det < 0.0 { -1.0 } else { 1.0 };
        let radius_scale = det.abs().cbrt();

        for v in &mut self.vertices {
            *v = matrix.transform_point3(*v);
        }
        for key in &mut self.curve_keys {
            key.position = matrix.transform_point3(key.position);
            key.radius *= radius_scale;
        }

        for std in [
            AttributeStandard::PositionUndisplaced,
            AttributeStandard::MotionVertexPosition,
        ] {
            for set in [&mut self.attributes, &mut self.curve_attributes] {
                if let Some(points) = set.find_std_mut(std).and_then(Attribute::vectors_mut) {
                    for p in points {
                        *p = matrix.transform_point3(*p);
                    }
                }
            }
        }

        for std in [
            AttributeStandard::VertexNormal,
            AttributeStandard::FaceNormal,
            AttributeStandard::MotionVertexNormal,
        ] {
            if let Some(normals) = self.attributes.find_std_mut(std).and_then(Attribute::vectors_mut) {
                for n in normals {
                    *n = normal_matrix.transform_vector3(*n).normalize_or_zero() * flip;
                }
            }
        }

        // Control grids and subpatch bounds were built from the old positions.
        if self.limit_data.is_some() {
            self.update_limit_data();
        }
        for i in 0..self.subpatches.len() {
            let bounds = self.subpatch_bounds(&self.subpatches[i]);
            self.subpatches[i].bounds = bounds;
        }
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Only authored vertices can be referenced. Diced vertices are
    /// replaced on every tessellation.
    #[inline]
    fn check_vertex(&self, index: u32) -> GeometryResult<()> {
        let count = self.coarse.map_or(self.vertices.len(), |range| range.verts);
        if (index as usize) < count {
            Ok(())
        } else {
            Err(GeometryError::index("vertex", index as usize, count))
        }
    }

    fn grow_attributes(&mut self, old: &ElementCounts) {
        let new = self.element_counts();
        self.attributes.resize(old, &new);
    }

    /// Returns the mesh to its authored state before an edit: displaced
    /// positions are restored and diced output is dropped. Vertex normals
    /// are derived from the old geometry and go too.
    fn geometry_edited(&mut self) {
        self.restore_undisplaced();
        self.discard_diced();
        self.attributes.remove_std(AttributeStandard::VertexNormal);
        self.attributes.remove_std(AttributeStandard::MotionVertexNormal);
        if !self.patches.is_empty() {
            self.patches_edited();
        }
    }

    /// Moves displaced vertices back to their stored base positions.
    pub(crate) fn restore_undisplaced(&mut self) {
        if let Some(base) = self
            .attributes
            .find_std(AttributeStandard::PositionUndisplaced)
            .and_then(Attribute::vectors)
        {
            if base.len() == self.vertices.len() {
                self.vertices.copy_from_slice(base);
            }
        }
        self.attributes.remove_std(AttributeStandard::PositionUndisplaced);
    }

    /// Truncates vertices and triangles back to the authored range.
    pub(crate) fn discard_diced(&mut self) {
        if let Some(range) = self.coarse.take() {
            let before = self.element_counts();
            self.vertices.truncate(range.verts);
            self.triangles.truncate(range.tris);
            let after = self.element_counts();
            self.attributes.resize(&before, &after);
        }
    }
}
