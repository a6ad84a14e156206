//! # Scene Context
//!
//! The explicit session object handed to every update pass: meshes,
//! placements, the flattened shader table and the scene-wide dirty flags.
//!
//! Keeping the flags here rather than in the manager means two scenes never
//! share state and a test can inspect exactly what a call tagged.

use std::collections::HashMap;

use glam::DMat4;
use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeId, AttributeRequestSet, AttributeStandard};
use crate::error::{GeometryError, GeometryResult};
use crate::mesh::Mesh;
use crate::services::{AttributeResolver, ObjectGraph};

/// Bit marking smooth shading in a device shader id.
pub const SHADER_SMOOTH_NORMAL: u32 = 1 << 31;

/// Index of a mesh in [`Scene::meshes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshId(pub usize);

// =============================================================================
// PARAMETERS
// =============================================================================

/// Acceleration structure update strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BvhType {
    /// Rebuilt from scratch, transforms may be baked into meshes
    #[default]
    Static,
    /// Refit when possible, meshes always instanced
    Dynamic,
}

/// Shading back-end that consumes the attribute table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShadingSystem {
    /// Flat addressing table indexed per object
    #[default]
    Svm,
    /// Name keyed maps per object
    Osl,
}

/// Scene-wide build settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SceneParams {
    /// Static or dynamic acceleration structures
    pub bvh_type: BvhType,
    /// Spatial splits in acceleration structure builds
    pub use_spatial_split: bool,
    /// Active shading back-end
    pub shading_system: ShadingSystem,
    /// Keep device data between renders
    pub persistent_data: bool,
}

// =============================================================================
// SHADERS
// =============================================================================

/// What the geometry core needs to know about one shader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shader {
    /// Shader name
    pub name: String,
    /// Attributes read by the shader
    pub attributes: AttributeRequestSet,
    /// Has a displacement output
    pub has_displacement: bool,
    /// Emits light from surfaces
    pub has_surface_emission: bool,
    /// Has a volume output
    pub has_volume: bool,
    /// Uses subsurface scattering
    pub has_surface_bssrdf: bool,
    /// Images sampled by the displacement output
    pub displacement_images: Vec<u32>,
}

impl Shader {
    /// Creates a shader with no features.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Flattened shader table. Index 0 is the default surface shader.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderTable {
    shaders: Vec<Shader>,
    /// Attributes every mesh provides regardless of its shaders
    pub global_attributes: AttributeRequestSet,
    names: HashMap<String, u32>,
}

impl Default for ShaderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderTable {
    /// Creates a table holding only the default shader.
    pub fn new() -> Self {
        Self {
            shaders: vec![Shader::new("default")],
            global_attributes: AttributeRequestSet::new(),
            names: HashMap::new(),
        }
    }

    /// Adds a shader and returns its index.
    pub fn add(&mut self, shader: Shader) -> u32 {
        self.shaders.push(shader);
        (self.shaders.len() - 1) as u32
    }

    /// Shader at `index`.
    #[inline]
    pub fn get(&self, index: u32) -> Option<&Shader> {
        self.shaders.get(index as usize)
    }

    /// Mutable shader at `index`.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut Shader> {
        self.shaders.get_mut(index as usize)
    }

    /// Number of shaders, default included.
    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    /// Never true; the default shader is always present.
    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    /// Device shader id of a global shader index.
    #[inline]
    pub fn device_shader_id(&self, shader: u32, smooth: bool) -> u32 {
        if smooth {
            shader | SHADER_SMOOTH_NORMAL
        } else {
            shader
        }
    }

    /// Stable numeric id of an attribute in the device tables.
    ///
    /// Standard attributes keep their fixed ids; names are numbered after
    /// them in first-seen order.
    pub fn attribute_id(&mut self, id: &AttributeId) -> u32 {
        match id {
            AttributeId::Std(std) => std.device_id(),
            AttributeId::Name(name) => {
                let next = self.names.len() as u32;
                let index = *self.names.entry(name.clone()).or_insert(next);
                AttributeStandard::ALL.len() as u32 + 1 + index
            }
        }
    }
}

impl AttributeResolver for ShaderTable {
    fn shader_requests(&self, shader: u32) -> Option<&AttributeRequestSet> {
        self.get(shader).map(|s| &s.attributes)
    }

    fn needs_global(&self, id: &AttributeId) -> bool {
        self.global_attributes.contains(id)
    }
}

// =============================================================================
// OBJECTS
// =============================================================================

/// A placement of a mesh in the world.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    /// Object name
    pub name: String,
    /// Placed mesh
    pub mesh: MeshId,
    /// Object to world transform
    pub transform: DMat4,
    /// Object motion blur is enabled
    pub use_motion: bool,
    /// Render pass index
    pub pass_id: u32,
}

impl Object {
    /// Places `mesh` with `transform`.
    pub fn new(name: impl Into<String>, mesh: MeshId, transform: DMat4) -> Self {
        Self {
            name: name.into(),
            mesh,
            transform,
            use_motion: false,
            pass_id: 0,
        }
    }
}

// =============================================================================
// SCENE
// =============================================================================

/// Scene-wide dirty flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SceneFlags {
    /// Some mesh needs a device update
    pub mesh_need_update: bool,
    /// Mesh volume and subsurface flags need recomputing
    pub mesh_need_flags_update: bool,
    /// Cached tessellation must be discarded
    pub need_clear_geom_cache: bool,
    /// Light sampling data is stale
    pub light_need_update: bool,
    /// Object records are stale
    pub object_need_update: bool,
}

/// Everything an update pass reads and writes.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    /// Build settings
    pub params: SceneParams,
    /// Mesh arena, indexed by [`MeshId`]
    pub meshes: Vec<Mesh>,
    /// Placements
    pub objects: Vec<Object>,
    /// Shader table
    pub shaders: ShaderTable,
    /// Dirty flags
    pub flags: SceneFlags,
}

impl Scene {
    /// Creates an empty scene.
    pub fn new(params: SceneParams) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    /// Adds a mesh and tags it for update.
    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshId {
        self.meshes.push(mesh);
        let id = MeshId(self.meshes.len() - 1);
        self.flags.mesh_need_update = true;
        self.flags.mesh_need_flags_update = true;
        self.flags.object_need_update = true;
        id
    }

    /// Places a mesh. The mesh must exist.
    pub fn add_object(&mut self, object: Object) -> GeometryResult<usize> {
        if object.mesh.0 >= self.meshes.len() {
            return Err(GeometryError::index("mesh", object.mesh.0, self.meshes.len()));
        }
        self.objects.push(object);
        self.flags.object_need_update = true;
        self.flags.mesh_need_update = true;
        Ok(self.objects.len() - 1)
    }

    /// Mesh by id.
    pub fn mesh(&self, id: MeshId) -> Option<&Mesh> {
        self.meshes.get(id.0)
    }

    /// Mutable mesh by id.
    pub fn mesh_mut(&mut self, id: MeshId) -> Option<&mut Mesh> {
        self.meshes.get_mut(id.0)
    }

    /// Tags a mesh as changed, see [`Mesh::tag_update`].
    pub fn tag_mesh_update(&mut self, id: MeshId, rebuild: bool) -> GeometryResult<()> {
        let len = self.meshes.len();
        let mesh = self
            .meshes
            .get_mut(id.0)
            .ok_or_else(|| GeometryError::index("mesh", id.0, len))?;
        mesh.tag_update(&mut self.flags, &self.shaders, rebuild);
        Ok(())
    }
}

impl ObjectGraph for Scene {
    fn instance_count(&self, mesh: MeshId) -> usize {
        self.objects.iter().filter(|o| o.mesh == mesh).count()
    }
}
