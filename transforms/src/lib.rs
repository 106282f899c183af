use nalgebra::Vector3;
use rotations::{quaternion::Quaternion, RotationTrait};
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// A rigid transform: rotation followed by translation.
///
/// We use the terminology B_from_A rather than A_to_B so that notation
/// matches matrix multiplication, i.e. `x_C = C_from_B * B_from_A * x_A`.
/// A frame's pose is then world_from_frame; composing a parent pose with a
/// child's relative transform yields the child pose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Transform {
    pub pos: Vector3<f64>,
    pub rot: Quaternion,
}

impl Transform {
    pub const IDENTITY: Self = Self {
        pos: Vector3::new(0.0, 0.0, 0.0),
        rot: Quaternion::IDENTITY,
    };

    pub fn new(pos: Vector3<f64>, rot: Quaternion) -> Self {
        Self { pos, rot }
    }

    pub fn from_position(x: f64, y: f64, z: f64) -> Self {
        Self {
            pos: Vector3::new(x, y, z),
            rot: Quaternion::IDENTITY,
        }
    }

    pub fn from_rotation(rot: Quaternion) -> Self {
        Self {
            pos: Vector3::zeros(),
            rot,
        }
    }

    pub fn identity() -> Self {
        Self::IDENTITY
    }

    /// True if the translation is zero and the rotation is the identity,
    /// within `tol`.
    pub fn is_zero(&self, tol: f64) -> bool {
        self.pos.norm() <= tol
            && (self.rot.x.abs() <= tol
                && self.rot.y.abs() <= tol
                && self.rot.z.abs() <= tol
                && (self.rot.w.abs() - 1.0).abs() <= tol)
    }

    pub fn inv(&self) -> Self {
        let rot = self.rot.inv();
        Self {
            pos: -rot.rotate(self.pos),
            rot,
        }
    }

    /// Relative pose of `b` with respect to `a`: `a.inv() * b`, the
    /// transform a child frame must carry so that `a * rel == b`.
    pub fn difference(a: &Transform, b: &Transform) -> Self {
        a.inv() * *b
    }

    /// Applies the transform to a point.
    pub fn apply(&self, p: Vector3<f64>) -> Vector3<f64> {
        self.rot.rotate(p) + self.pos
    }

    /// Applies only the rotation, for direction vectors.
    pub fn apply_vec(&self, v: Vector3<f64>) -> Vector3<f64> {
        self.rot.rotate(v)
    }

    /// Renormalizes the rotation; identity if degenerate.
    pub fn normalize(&mut self) {
        self.rot = self.rot.normalize().unwrap_or(Quaternion::IDENTITY);
    }

    /// Flat 7-scalar form `[px, py, pz, qx, qy, qz, qw]`, the per-frame
    /// row of the pose table exchanged with physics backends.
    pub fn to_7d(&self) -> [f64; 7] {
        [
            self.pos.x, self.pos.y, self.pos.z, self.rot.x, self.rot.y, self.rot.z, self.rot.w,
        ]
    }

    pub fn from_7d(v: &[f64]) -> Self {
        debug_assert_eq!(v.len(), 7);
        Self {
            pos: Vector3::new(v[0], v[1], v[2]),
            rot: Quaternion::new(v[3], v[4], v[5], v[6]),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul<Transform> for Transform {
    type Output = Transform;

    fn mul(self, rhs: Transform) -> Transform {
        Transform {
            pos: self.rot.rotate(rhs.pos) + self.pos,
            rot: self.rot * rhs.rot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rotations::axis_angle::AxisAngle;
    use std::f64::consts::PI;
    const TOL: f64 = 1e-12;

    fn rot_z(angle: f64) -> Quaternion {
        Quaternion::from(&AxisAngle::new(Vector3::z(), angle).unwrap())
    }

    #[test]
    fn test_compose_and_apply() {
        let a = Transform::new(Vector3::new(1.0, 0.0, 0.0), rot_z(0.5 * PI));
        let b = Transform::from_position(1.0, 0.0, 0.0);
        let p = (a * b).apply(Vector3::zeros());
        assert_abs_diff_eq!(p.x, 1.0, epsilon = TOL);
        assert_abs_diff_eq!(p.y, 1.0, epsilon = TOL);
        assert_abs_diff_eq!(p.z, 0.0, epsilon = TOL);
    }

    #[test]
    fn test_inverse() {
        let t = Transform::new(Vector3::new(0.2, -1.0, 0.7), rot_z(1.1));
        let round = t.inv() * t;
        assert!(round.is_zero(1e-12));
    }

    #[test]
    fn test_difference_recovers_relative_pose() {
        let parent = Transform::new(Vector3::new(3.0, 1.0, 0.0), rot_z(-0.3));
        let rel = Transform::new(Vector3::new(0.5, 0.0, 0.2), rot_z(0.8));
        let child = parent * rel;
        let diff = Transform::difference(&parent, &child);
        assert_abs_diff_eq!(diff.pos.x, rel.pos.x, epsilon = TOL);
        assert_abs_diff_eq!(diff.pos.y, rel.pos.y, epsilon = TOL);
        assert_abs_diff_eq!(diff.pos.z, rel.pos.z, epsilon = TOL);
        assert_abs_diff_eq!(diff.rot.z, rel.rot.z, epsilon = TOL);
        assert_abs_diff_eq!(diff.rot.w, rel.rot.w, epsilon = TOL);
    }

    #[test]
    fn test_7d_round_trip() {
        let t = Transform::new(Vector3::new(0.1, 0.2, 0.3), rot_z(0.4));
        let back = Transform::from_7d(&t.to_7d());
        assert_abs_diff_eq!(back.pos.z, 0.3, epsilon = TOL);
        assert_abs_diff_eq!(back.rot.w, t.rot.w, epsilon = TOL);
    }
}
