//! Update tracking and placement predicates.
//!
//! A mesh carries two dirty flags. `need_update` marks any change to its
//! data; `need_update_rebuild` additionally marks a change to topology that
//! invalidates an acceleration structure. Both are raised by
//! [`Mesh::tag_update`] and cleared together once a device update pass
//! completes.

use super::Mesh;
use crate::attribute::AttributeStandard;
use crate::scene::{SceneFlags, ShaderTable};

impl Mesh {
    /// Mesh data changed since the last completed pass.
    #[inline]
    pub fn need_update(&self) -> bool {
        self.need_update
    }

    /// Mesh topology changed since the last completed pass.
    #[inline]
    pub fn need_update_rebuild(&self) -> bool {
        self.need_update_rebuild
    }

    /// Marks the mesh dirty and schedules the scene-wide passes that depend
    /// on it.
    ///
    /// Lights are refreshed when topology changes or when a bound shader
    /// emits light, since emissive triangles are sampled as lights.
    pub fn tag_update(&mut self, flags: &mut SceneFlags, shaders: &ShaderTable, rebuild: bool) {
        self.need_update = true;

        if rebuild {
            self.need_update_rebuild = true;
            flags.light_need_update = true;
        } else if self
            .used_shaders
            .iter()
            .any(|&s| shaders.get(s).is_some_and(|shader| shader.has_surface_emission))
        {
            flags.light_need_update = true;
        }

        flags.mesh_need_update = true;
        flags.object_need_update = true;
    }

    /// True when the mesh needs an acceleration structure of its own
    /// instead of having its primitives merged into the scene structure.
    #[inline]
    pub fn need_build_bvh(&self) -> bool {
        !self.transform_applied || self.has_surface_bssrdf
    }

    /// True when the mesh is shared through an instanced structure.
    #[inline]
    pub fn is_instanced(&self) -> bool {
        !self.transform_applied && !self.has_surface_bssrdf
    }

    /// True when motion blur is enabled and motion positions exist.
    pub fn has_motion_blur(&self) -> bool {
        self.use_motion_blur
            && self.motion_steps > 1
            && (self
                .attributes
                .find_std(AttributeStandard::MotionVertexPosition)
                .is_some()
                || self
                    .curve_attributes
                    .find_std(AttributeStandard::MotionVertexPosition)
                    .is_some())
    }

    /// Clears both dirty flags after a completed pass.
    pub(crate) fn clear_update_flags(&mut self) {
        self.need_update = false;
        self.need_update_rebuild = false;
    }
}
