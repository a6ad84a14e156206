//! # Mesh Attributes
//!
//! Per-element data carried alongside mesh geometry, and the request sets
//! shaders use to say which attributes they read.
//!
//! ## Storage layout
//!
//! Every attribute is one contiguous array sized by its [`AttributeElement`].
//! Motion elements are stored step-major: all vertices of the first extra
//! time step, then all vertices of the next one.
//!
//! ```text
//! VertexMotion, 3 verts, 2 extra steps:  [s0v0 s0v1 s0v2 | s1v0 s1v1 s1v2]
//! ```

use std::fmt;

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

// =============================================================================
// ATTRIBUTE IDENTITY
// =============================================================================

/// Attributes with a meaning known to the geometry pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttributeStandard {
    /// Smooth per-vertex normal
    VertexNormal,
    /// Geometric per-triangle normal
    FaceNormal,
    /// Texture coordinates per triangle corner
    Uv,
    /// Generated texture coordinates
    Generated,
    /// Vertex positions before true displacement
    PositionUndisplaced,
    /// Vertex (or curve key) positions of the extra motion steps
    MotionVertexPosition,
    /// Vertex normals of the extra motion steps
    MotionVertexNormal,
    /// Parametric position along a curve
    CurveIntercept,
    /// Source face of a diced triangle
    PtexFaceId,
    /// Patch-space coordinates of a diced vertex
    PtexUv,
}

impl AttributeStandard {
    /// Every standard attribute, in device id order.
    pub const ALL: [AttributeStandard; 10] = [
        AttributeStandard::VertexNormal,
        AttributeStandard::FaceNormal,
        AttributeStandard::Uv,
        AttributeStandard::Generated,
        AttributeStandard::PositionUndisplaced,
        AttributeStandard::MotionVertexPosition,
        AttributeStandard::MotionVertexNormal,
        AttributeStandard::CurveIntercept,
        AttributeStandard::PtexFaceId,
        AttributeStandard::PtexUv,
    ];

    /// Name shaders use to look the attribute up.
    pub fn name(self) -> &'static str {
        match self {
            AttributeStandard::VertexNormal => "N",
            AttributeStandard::FaceNormal => "Ng",
            AttributeStandard::Uv => "uv",
            AttributeStandard::Generated => "generated",
            AttributeStandard::PositionUndisplaced => "undisplaced",
            AttributeStandard::MotionVertexPosition => "motion_P",
            AttributeStandard::MotionVertexNormal => "motion_N",
            AttributeStandard::CurveIntercept => "curve_intercept",
            AttributeStandard::PtexFaceId => "ptex_face_id",
            AttributeStandard::PtexUv => "ptex_uv",
        }
    }

    /// Looks up a standard attribute by its shader name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|std| std.name() == name)
    }

    /// Identifier written into device attribute maps. Zero is reserved for
    /// the map terminator.
    pub fn device_id(self) -> u32 {
        self as u32 + 1
    }

    /// Element and value type the attribute is created with.
    pub fn default_layout(self, curves: bool) -> (AttributeElement, AttributeType) {
        use AttributeElement as E;
        use AttributeType as T;
        match self {
            AttributeStandard::VertexNormal => (E::Vertex, T::Vector),
            AttributeStandard::FaceNormal => (E::Face, T::Vector),
            AttributeStandard::Uv if curves => (E::Curve, T::Uv),
            AttributeStandard::Uv => (E::Corner, T::Uv),
            AttributeStandard::Generated if curves => (E::Curve, T::Vector),
            AttributeStandard::Generated => (E::Vertex, T::Vector),
            AttributeStandard::PositionUndisplaced => (E::Vertex, T::Vector),
            AttributeStandard::MotionVertexPosition if curves => (E::CurveKeyMotion, T::Vector),
            AttributeStandard::MotionVertexPosition => (E::VertexMotion, T::Vector),
            AttributeStandard::MotionVertexNormal => (E::VertexMotion, T::Vector),
            AttributeStandard::CurveIntercept => (E::CurveKey, T::Float),
            AttributeStandard::PtexFaceId => (E::Face, T::Float),
            AttributeStandard::PtexUv => (E::Vertex, T::Uv),
        }
    }
}

/// Key of an attribute: either a standard attribute or a custom name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttributeId {
    /// Standard attribute
    Std(AttributeStandard),
    /// Custom attribute, e.g. a named UV map or color layer
    Name(String),
}

impl AttributeId {
    /// Name used by shaders.
    pub fn name(&self) -> &str {
        match self {
            AttributeId::Std(std) => std.name(),
            AttributeId::Name(name) => name,
        }
    }

    /// The standard attribute, if this is one.
    pub fn standard(&self) -> Option<AttributeStandard> {
        match self {
            AttributeId::Std(std) => Some(*std),
            AttributeId::Name(_) => None,
        }
    }
}

impl From<AttributeStandard> for AttributeId {
    fn from(std: AttributeStandard) -> Self {
        AttributeId::Std(std)
    }
}

impl From<&str> for AttributeId {
    fn from(name: &str) -> Self {
        AttributeId::Name(name.to_string())
    }
}

impl From<String> for AttributeId {
    fn from(name: String) -> Self {
        AttributeId::Name(name)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// LAYOUT
// =============================================================================

/// Which mesh element an attribute stores one value for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeElement {
    /// A single value for the whole mesh
    Mesh,
    /// One value per vertex
    Vertex,
    /// One value per vertex per extra motion step
    VertexMotion,
    /// One value per triangle
    Face,
    /// One value per triangle corner
    Corner,
    /// One value per curve
    Curve,
    /// One value per curve key
    CurveKey,
    /// One value per curve key per extra motion step
    CurveKeyMotion,
}

impl AttributeElement {
    /// Code written into device attribute maps.
    pub fn device_code(self) -> u32 {
        match self {
            AttributeElement::Mesh => 1,
            AttributeElement::Vertex => 2,
            AttributeElement::VertexMotion => 3,
            AttributeElement::Face => 4,
            AttributeElement::Corner => 5,
            AttributeElement::Curve => 6,
            AttributeElement::CurveKey => 7,
            AttributeElement::CurveKeyMotion => 8,
        }
    }

    /// True for the step-major motion layouts.
    pub fn is_motion(self) -> bool {
        matches!(
            self,
            AttributeElement::VertexMotion | AttributeElement::CurveKeyMotion
        )
    }
}

/// Value type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    /// Scalar
    Float,
    /// Point, vector, normal or color
    Vector,
    /// Two-component texture coordinate
    Uv,
}

impl AttributeType {
    /// Code written into device attribute maps.
    pub fn device_code(self) -> u32 {
        match self {
            AttributeType::Float => 0,
            AttributeType::Vector => 1,
            AttributeType::Uv => 2,
        }
    }
}

/// Element counts of a mesh, used to size attribute arrays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElementCounts {
    /// Vertices
    pub verts: usize,
    /// Triangles
    pub tris: usize,
    /// Curves
    pub curves: usize,
    /// Curve keys
    pub curve_keys: usize,
    /// Total motion steps including the center step
    pub motion_steps: usize,
}

impl ElementCounts {
    /// Number of extra motion steps stored in motion attributes.
    #[inline]
    pub fn extra_steps(&self) -> usize {
        self.motion_steps.saturating_sub(1)
    }

    /// Elements per step and number of steps for an element kind.
    fn layout(&self, element: AttributeElement) -> (usize, usize) {
        match element {
            AttributeElement::Mesh => (1, 1),
            AttributeElement::Vertex => (self.verts, 1),
            AttributeElement::VertexMotion => (self.verts, self.extra_steps()),
            AttributeElement::Face => (self.tris, 1),
            AttributeElement::Corner => (self.tris * 3, 1),
            AttributeElement::Curve => (self.curves, 1),
            AttributeElement::CurveKey => (self.curve_keys, 1),
            AttributeElement::CurveKeyMotion => (self.curve_keys, self.extra_steps()),
        }
    }

    /// Total values an attribute of `element` holds.
    pub fn element_size(&self, element: AttributeElement) -> usize {
        let (stride, steps) = self.layout(element);
        stride * steps
    }
}

// =============================================================================
// VALUES
// =============================================================================

/// Typed attribute storage.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValues {
    /// Scalars
    Float(Vec<f64>),
    /// Vectors
    Vector(Vec<DVec3>),
    /// Texture coordinates
    Uv(Vec<DVec2>),
}

macro_rules! each_values {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            AttributeValues::Float($v) => $body,
            AttributeValues::Vector($v) => $body,
            AttributeValues::Uv($v) => $body,
        }
    };
}

impl AttributeValues {
    fn with_len(kind: AttributeType, len: usize) -> Self {
        match kind {
            AttributeType::Float => AttributeValues::Float(vec![0.0; len]),
            AttributeType::Vector => AttributeValues::Vector(vec![DVec3::ZERO; len]),
            AttributeType::Uv => AttributeValues::Uv(vec![DVec2::ZERO; len]),
        }
    }

    /// Value type of the storage.
    pub fn kind(&self) -> AttributeType {
        match self {
            AttributeValues::Float(_) => AttributeType::Float,
            AttributeValues::Vector(_) => AttributeType::Vector,
            AttributeValues::Uv(_) => AttributeType::Uv,
        }
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        each_values!(self, v => v.len())
    }

    /// True when no value is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Re-lays out step-major storage from `old` to `new` (stride, steps),
/// keeping overlapping values and zero-filling the rest.
fn relayout<T: Copy + Default>(values: &mut Vec<T>, old: (usize, usize), new: (usize, usize)) {
    if old.1 <= 1 && new.1 <= 1 {
        values.resize(new.0 * new.1, T::default());
        return;
    }
    let (old_stride, old_steps) = old;
    let (new_stride, new_steps) = new;
    let mut out = Vec::with_capacity(new_stride * new_steps);
    for step in 0..new_steps {
        for i in 0..new_stride {
            let value = if step < old_steps && i < old_stride {
                values.get(step * old_stride + i).copied().unwrap_or_default()
            } else {
                T::default()
            };
            out.push(value);
        }
    }
    *values = out;
}

// =============================================================================
// ATTRIBUTE
// =============================================================================

/// A named array of per-element values.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    id: AttributeId,
    element: AttributeElement,
    values: AttributeValues,
}

impl Attribute {
    /// Creates a zero-filled attribute sized for `counts`.
    pub fn new(
        id: AttributeId,
        element: AttributeElement,
        kind: AttributeType,
        counts: &ElementCounts,
    ) -> Self {
        Self {
            id,
            element,
            values: AttributeValues::with_len(kind, counts.element_size(element)),
        }
    }

    /// Attribute key.
    pub fn id(&self) -> &AttributeId {
        &self.id
    }

    /// Element the attribute is stored per.
    pub fn element(&self) -> AttributeElement {
        self.element
    }

    /// Value type.
    pub fn kind(&self) -> AttributeType {
        self.values.kind()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no value is stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Typed storage.
    pub fn values(&self) -> &AttributeValues {
        &self.values
    }

    /// Scalar values, if the attribute is scalar.
    pub fn floats(&self) -> Option<&[f64]> {
        match &self.values {
            AttributeValues::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable scalar values.
    pub fn floats_mut(&mut self) -> Option<&mut [f64]> {
        match &mut self.values {
            AttributeValues::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Vector values, if the attribute is a vector.
    pub fn vectors(&self) -> Option<&[DVec3]> {
        match &self.values {
            AttributeValues::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable vector values.
    pub fn vectors_mut(&mut self) -> Option<&mut [DVec3]> {
        match &mut self.values {
            AttributeValues::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Texture coordinate values.
    pub fn uvs(&self) -> Option<&[DVec2]> {
        match &self.values {
            AttributeValues::Uv(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable texture coordinate values.
    pub fn uvs_mut(&mut self) -> Option<&mut [DVec2]> {
        match &mut self.values {
            AttributeValues::Uv(v) => Some(v),
            _ => None,
        }
    }

    /// Resizes storage from the `old` element counts to `new` ones.
    pub(crate) fn resize(&mut self, old: &ElementCounts, new: &ElementCounts) {
        let from = old.layout(self.element);
        let to = new.layout(self.element);
        each_values!(&mut self.values, v => relayout(v, from, to));
    }

    /// Appends a copy of `vertex` to vertex and vertex-motion storage.
    /// `counts` are the element counts before the vertex was added.
    fn duplicate_vertex(&mut self, vertex: usize, counts: &ElementCounts) {
        match self.element {
            AttributeElement::Vertex => each_values!(&mut self.values, v => {
                let value = v.get(vertex).copied().unwrap_or_default();
                v.push(value);
            }),
            AttributeElement::VertexMotion => {
                let old = counts.layout(self.element);
                let new = (old.0 + 1, old.1);
                each_values!(&mut self.values, v => {
                    relayout(v, old, new);
                    for step in 0..new.1 {
                        let value = v[step * new.0 + vertex];
                        v[step * new.0 + old.0] = value;
                    }
                });
            }
            _ => {}
        }
    }
}

// =============================================================================
// ATTRIBUTE SET
// =============================================================================

/// The attributes of one primitive kind of a mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSet {
    attributes: Vec<Attribute>,
}

impl AttributeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attribute, or returns the existing one with the same key.
    ///
    /// An existing attribute with a different layout is replaced.
    pub fn add(
        &mut self,
        id: impl Into<AttributeId>,
        element: AttributeElement,
        kind: AttributeType,
        counts: &ElementCounts,
    ) -> &mut Attribute {
        let id = id.into();
        let index = match self.attributes.iter().position(|a| a.id == id) {
            Some(i) if self.attributes[i].element == element && self.attributes[i].kind() == kind => i,
            Some(i) => {
                self.attributes[i] = Attribute::new(id, element, kind, counts);
                i
            }
            None => {
                self.attributes.push(Attribute::new(id, element, kind, counts));
                self.attributes.len() - 1
            }
        };
        &mut self.attributes[index]
    }

    /// Adds a standard attribute with its default layout.
    pub fn add_standard(
        &mut self,
        std: AttributeStandard,
        curves: bool,
        counts: &ElementCounts,
    ) -> &mut Attribute {
        let (element, kind) = std.default_layout(curves);
        self.add(std, element, kind, counts)
    }

    /// Finds an attribute by key.
    pub fn find(&self, id: &AttributeId) -> Option<&Attribute> {
        self.attributes.iter().find(|a| &a.id == id)
    }

    /// Finds an attribute by key for mutation.
    pub fn find_mut(&mut self, id: &AttributeId) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| &a.id == id)
    }

    /// Finds a standard attribute.
    pub fn find_std(&self, std: AttributeStandard) -> Option<&Attribute> {
        self.find(&AttributeId::Std(std))
    }

    /// Finds a standard attribute for mutation.
    pub fn find_std_mut(&mut self, std: AttributeStandard) -> Option<&mut Attribute> {
        self.find_mut(&AttributeId::Std(std))
    }

    /// Removes an attribute. Returns true if it existed.
    pub fn remove(&mut self, id: &AttributeId) -> bool {
        let before = self.attributes.len();
        self.attributes.retain(|a| &a.id != id);
        self.attributes.len() != before
    }

    /// Removes a standard attribute. Returns true if it existed.
    pub fn remove_std(&mut self, std: AttributeStandard) -> bool {
        self.remove(&AttributeId::Std(std))
    }

    /// Drops every attribute.
    pub fn clear(&mut self) {
        self.attributes.clear();
    }

    /// Iterates the attributes.
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// True when the set holds no attribute.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Resizes every attribute after the mesh element counts changed.
    pub(crate) fn resize(&mut self, old: &ElementCounts, new: &ElementCounts) {
        for attr in &mut self.attributes {
            attr.resize(old, new);
        }
    }

    /// Copies the values of `vertex` onto a newly appended vertex.
    pub(crate) fn duplicate_vertex(&mut self, vertex: usize, counts: &ElementCounts) {
        for attr in &mut self.attributes {
            attr.duplicate_vertex(vertex, counts);
        }
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Where a requested attribute lives in the device attribute buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDescriptor {
    /// Element layout, `None` when the mesh lacks the attribute
    pub element: Option<AttributeElement>,
    /// Value type
    pub kind: AttributeType,
    /// First value in the float or float3 buffer
    pub offset: usize,
}

impl Default for AttributeDescriptor {
    fn default() -> Self {
        Self {
            element: None,
            kind: AttributeType::Float,
            offset: 0,
        }
    }
}

/// A shader's request for one attribute, resolved per primitive kind.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRequest {
    /// Requested attribute
    pub id: AttributeId,
    /// Resolution against the triangle attributes
    pub triangle: AttributeDescriptor,
    /// Resolution against the curve attributes
    pub curve: AttributeDescriptor,
}

impl AttributeRequest {
    /// Creates an unresolved request.
    pub fn new(id: AttributeId) -> Self {
        Self {
            id,
            triangle: AttributeDescriptor::default(),
            curve: AttributeDescriptor::default(),
        }
    }
}

/// Set of attribute requests without duplicates, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeRequestSet {
    requests: Vec<AttributeRequest>,
}

impl AttributeRequestSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request. Returns false if it was already present.
    pub fn add(&mut self, id: impl Into<AttributeId>) -> bool {
        let id = id.into();
        if self.find(&id).is_some() {
            return false;
        }
        self.requests.push(AttributeRequest::new(id));
        true
    }

    /// Adds every request of `other`.
    pub fn add_set(&mut self, other: &AttributeRequestSet) {
        for req in &other.requests {
            self.add(req.id.clone());
        }
    }

    /// Finds a request by attribute key.
    pub fn find(&self, id: &AttributeId) -> Option<&AttributeRequest> {
        self.requests.iter().find(|r| &r.id == id)
    }

    /// True when the attribute is requested.
    pub fn contains(&self, id: &AttributeId) -> bool {
        self.find(id).is_some()
    }

    /// True when the two sets request different attributes.
    pub fn modified(&self, other: &AttributeRequestSet) -> bool {
        self.requests.len() != other.requests.len()
            || self.requests.iter().any(|r| !other.contains(&r.id))
    }

    /// Iterates the requests.
    pub fn iter(&self) -> impl Iterator<Item = &AttributeRequest> {
        self.requests.iter()
    }

    /// Iterates the requests for resolution.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AttributeRequest> {
        self.requests.iter_mut()
    }

    /// Number of requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// True when nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Drops every request.
    pub fn clear(&mut self) {
        self.requests.clear();
    }
}
