use crate::joint::Joint;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use transforms::Transform;

/// Stable index of a frame within its configuration's arena.
///
/// Ids are reassigned when frames are deleted or re-sorted; they are
/// indices, not handles that survive structural edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameId(pub(crate) usize);

impl FrameId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for FrameId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in the kinematic tree.
///
/// `rel` is the pose relative to the parent (identity for parent-less
/// frames); `x` is the cached absolute pose, recoverable on demand as
/// `parent.x * rel` whenever `x_good` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    pub name: String,
    pub parent: Option<FrameId>,
    pub children: Vec<FrameId>,
    pub(crate) x: Transform,
    pub(crate) x_good: bool,
    pub rel: Transform,
    /// time-interval coordinate, driven by a `Tau` joint
    pub tau: f64,
    pub joint: Option<Joint>,
    pub shape: Option<Shape>,
    pub inertia: Option<Inertia>,
    /// indices of force exchanges attached to this frame
    pub(crate) forces: Vec<usize>,
}

impl Frame {
    pub(crate) fn new(id: FrameId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent: None,
            children: Vec::new(),
            x: Transform::IDENTITY,
            x_good: true,
            rel: Transform::IDENTITY,
            tau: 0.0,
            joint: None,
            shape: None,
            inertia: None,
            forces: Vec::new(),
        }
    }

    /// The cached absolute pose; only meaningful while the validity flag
    /// is set. Use `Configuration::ensure_x` to recover a stale pose.
    pub fn pose(&self) -> Option<&Transform> {
        if self.x_good {
            Some(&self.x)
        } else {
            None
        }
    }

    pub fn force_indices(&self) -> &[usize] {
        &self.forces
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeType {
    Box,
    Sphere,
    Cylinder,
    Capsule,
    Marker,
    Mesh,
}

/// Collision/visual geometry attached to a frame. The engine never
/// interprets the geometry beyond its sweep radius; the narrow phase is
/// an external backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shape {
    pub shape_type: ShapeType,
    pub size: Vec<f64>,
    pub color: Option<[f64; 4]>,
    pub contact: bool,
}

impl Shape {
    pub fn new(shape_type: ShapeType, size: Vec<f64>) -> Self {
        Self {
            shape_type,
            size,
            color: None,
            contact: false,
        }
    }

    /// Sweep radius used for the cheap proxy pre-check; zero for shapes
    /// without one.
    pub fn radius(&self) -> f64 {
        match self.shape_type {
            ShapeType::Sphere | ShapeType::Cylinder | ShapeType::Capsule => {
                self.size.last().copied().unwrap_or(0.0)
            }
            ShapeType::Box | ShapeType::Marker | ShapeType::Mesh => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inertia {
    pub mass: f64,
    pub com: Vector3<f64>,
    pub matrix: Matrix3<f64>,
}

impl Inertia {
    pub fn from_mass(mass: f64) -> Self {
        Self {
            mass,
            com: Vector3::zeros(),
            matrix: Matrix3::zeros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_frame_pose_is_valid() {
        let f = Frame::new(FrameId(0), "world");
        assert!(f.pose().is_some());
        assert!(f.rel.is_zero(1e-12));
    }

    #[test]
    fn test_shape_radius() {
        let s = Shape::new(ShapeType::Sphere, vec![0.2]);
        assert_eq!(s.radius(), 0.2);
        let b = Shape::new(ShapeType::Box, vec![1.0, 1.0, 1.0]);
        assert_eq!(b.radius(), 0.0);
    }
}
