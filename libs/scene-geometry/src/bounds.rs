//! # Bounding Boxes
//!
//! Axis-aligned bounds used for meshes, subpatches and scene placement.

use glam::{DMat4, DVec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box. An empty box has `min > max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundBox {
    /// Minimum corner
    pub min: DVec3,
    /// Maximum corner
    pub max: DVec3,
}

impl Default for BoundBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BoundBox {
    /// The empty box; growing it by any point yields that point.
    pub const EMPTY: Self = Self {
        min: DVec3::INFINITY,
        max: DVec3::NEG_INFINITY,
    };

    /// Creates a box from its corners.
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Creates the smallest box holding every point.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a DVec3>) -> Self {
        let mut bounds = Self::EMPTY;
        for p in points {
            bounds.grow(*p);
        }
        bounds
    }

    /// Grows the box to include `p`.
    #[inline]
    pub fn grow(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Grows the box to include a sphere of `radius` around `p`.
    #[inline]
    pub fn grow_radius(&mut self, p: DVec3, radius: f64) {
        let r = DVec3::splat(radius.abs());
        self.min = self.min.min(p - r);
        self.max = self.max.max(p + r);
    }

    /// Grows the box by `p` unless it has a non-finite component.
    ///
    /// Returns false when the point was skipped.
    #[inline]
    pub fn grow_safe(&mut self, p: DVec3) -> bool {
        if p.is_finite() {
            self.grow(p);
            true
        } else {
            false
        }
    }

    /// Like [`grow_radius`](Self::grow_radius) but skips non-finite input.
    #[inline]
    pub fn grow_safe_radius(&mut self, p: DVec3, radius: f64) -> bool {
        if p.is_finite() && radius.is_finite() {
            self.grow_radius(p, radius);
            true
        } else {
            false
        }
    }

    /// Grows the box to include another box.
    pub fn union(&mut self, other: &BoundBox) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// True when the box holds no point.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// True when the box is non-empty with finite corners.
    #[inline]
    pub fn valid(&self) -> bool {
        !self.is_empty() && self.min.is_finite() && self.max.is_finite()
    }

    /// Extent along each axis, zero for an empty box.
    pub fn size(&self) -> DVec3 {
        if self.is_empty() {
            DVec3::ZERO
        } else {
            self.max - self.min
        }
    }

    /// Center point, origin for an empty box.
    pub fn center(&self) -> DVec3 {
        if self.is_empty() {
            DVec3::ZERO
        } else {
            (self.min + self.max) * 0.5
        }
    }

    /// Bounds of the eight transformed corners.
    pub fn transformed(&self, matrix: &DMat4) -> Self {
        if self.is_empty() {
            return *self;
        }
        let mut out = Self::EMPTY;
        for i in 0..8 {
            let corner = DVec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.grow(matrix.transform_point3(corner));
        }
        out
    }
}
