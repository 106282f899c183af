use crate::{
    axis_angle::AxisAngle, euler_angles::EulerAngles, rotation_matrix::RotationMatrix,
    RotationTrait,
};
use nalgebra::{SMatrix, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::Mul;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuaternionErrors {
    #[error("cannot normalize a quaternion with zero norm")]
    ZeroNorm,
}

/// A quaternion with vector part `x`, `y`, `z` and scalar part `w`.
///
/// Rotations are represented by unit quaternions; `normalize` is the
/// entry point for turning raw coordinate blocks into rotations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn identity() -> Self {
        Self::IDENTITY
    }

    /// Vector (imaginary) part.
    pub fn imag(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }

    pub fn normalize(&self) -> Result<Self, QuaternionErrors> {
        let n = self.norm();
        if n < f64::EPSILON {
            return Err(QuaternionErrors::ZeroNorm);
        }
        Ok(Self::new(self.x / n, self.y / n, self.z / n, self.w / n))
    }

    /// Angle of the rotation about the given unit axis, assuming the
    /// rotation is (close to) a pure twist about that axis. Canonicalized
    /// to (-pi, pi].
    pub fn angle_about(&self, axis: Vector3<f64>) -> f64 {
        let s = self.imag().dot(&axis);
        let mut angle = 2.0 * s.atan2(self.w);
        if angle > std::f64::consts::PI {
            angle -= 2.0 * std::f64::consts::PI;
        }
        if angle <= -std::f64::consts::PI {
            angle += 2.0 * std::f64::consts::PI;
        }
        angle
    }

    /// The 3x4 matrix mapping quaternion rates to world-frame angular
    /// velocity, `w = J * qdot`, for a unit quaternion. Columns are
    /// ordered like the coordinate block (x, y, z, w).
    pub fn rate_jacobian(&self) -> SMatrix<f64, 3, 4> {
        let (x, y, z, w) = (self.x, self.y, self.z, self.w);
        2.0 * SMatrix::<f64, 3, 4>::new(
            w, -z, y, -x, //
            z, w, -x, -y, //
            -y, x, w, -z,
        )
    }

    /// The 4x3 inverse map, `qdot = T * w`; right inverse of
    /// `rate_jacobian` for a unit quaternion. Rows ordered (x, y, z, w).
    pub fn rate_from_angular(&self) -> SMatrix<f64, 4, 3> {
        let (x, y, z, w) = (self.x, self.y, self.z, self.w);
        0.5 * SMatrix::<f64, 4, 3>::new(
            w, z, -y, //
            -z, w, x, //
            y, -x, w, //
            -x, -y, -z,
        )
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul<Quaternion> for Quaternion {
    type Output = Quaternion;

    fn mul(self, rhs: Quaternion) -> Quaternion {
        Quaternion::new(
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        )
    }
}

impl RotationTrait for Quaternion {
    fn rotate(&self, v: Vector3<f64>) -> Vector3<f64> {
        // v' = v + w*t + im x t with t = 2 im x v
        let im = self.imag();
        let t = 2.0 * im.cross(&v);
        v + self.w * t + im.cross(&t)
    }

    fn transform(&self, v: Vector3<f64>) -> Vector3<f64> {
        self.inv().rotate(v)
    }

    fn inv(&self) -> Self {
        Self::new(-self.x, -self.y, -self.z, self.w)
    }

    fn identity() -> Self {
        Self::IDENTITY
    }
}

impl From<&AxisAngle> for Quaternion {
    fn from(aa: &AxisAngle) -> Self {
        let half = 0.5 * aa.angle;
        let s = half.sin();
        Self::new(
            aa.axis.x * s,
            aa.axis.y * s,
            aa.axis.z * s,
            half.cos(),
        )
    }
}

impl From<&RotationMatrix> for Quaternion {
    /// Shepperd's method, branching on the largest diagonal term.
    fn from(rm: &RotationMatrix) -> Self {
        let m = rm.matrix();
        let trace = m[(0, 0)] + m[(1, 1)] + m[(2, 2)];
        if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            Self::new(
                (m[(2, 1)] - m[(1, 2)]) / s,
                (m[(0, 2)] - m[(2, 0)]) / s,
                (m[(1, 0)] - m[(0, 1)]) / s,
                0.25 * s,
            )
        } else if m[(0, 0)] > m[(1, 1)] && m[(0, 0)] > m[(2, 2)] {
            let s = (1.0 + m[(0, 0)] - m[(1, 1)] - m[(2, 2)]).sqrt() * 2.0;
            Self::new(
                0.25 * s,
                (m[(0, 1)] + m[(1, 0)]) / s,
                (m[(0, 2)] + m[(2, 0)]) / s,
                (m[(2, 1)] - m[(1, 2)]) / s,
            )
        } else if m[(1, 1)] > m[(2, 2)] {
            let s = (1.0 + m[(1, 1)] - m[(0, 0)] - m[(2, 2)]).sqrt() * 2.0;
            Self::new(
                (m[(0, 1)] + m[(1, 0)]) / s,
                0.25 * s,
                (m[(1, 2)] + m[(2, 1)]) / s,
                (m[(0, 2)] - m[(2, 0)]) / s,
            )
        } else {
            let s = (1.0 + m[(2, 2)] - m[(0, 0)] - m[(1, 1)]).sqrt() * 2.0;
            Self::new(
                (m[(0, 2)] + m[(2, 0)]) / s,
                (m[(1, 2)] + m[(2, 1)]) / s,
                0.25 * s,
                (m[(1, 0)] - m[(0, 1)]) / s,
            )
        }
    }
}

impl From<&EulerAngles> for Quaternion {
    fn from(e: &EulerAngles) -> Self {
        let (sr, cr) = (0.5 * e.roll).sin_cos();
        let (sp, cp) = (0.5 * e.pitch).sin_cos();
        let (sy, cy) = (0.5 * e.yaw).sin_cos();
        Self::new(
            sr * cp * cy - cr * sp * sy,
            cr * sp * cy + sr * cp * sy,
            cr * cp * sy - sr * sp * cy,
            cr * cp * cy + sr * sp * sy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;
    const TOL: f64 = 1e-12;

    #[test]
    fn test_normalization() {
        let q = Quaternion::new(1.0, 2.0, 3.0, 4.0).normalize().unwrap();
        assert_abs_diff_eq!(q.x, 0.18257418583505536, epsilon = TOL);
        assert_abs_diff_eq!(q.y, 0.3651483716701107, epsilon = TOL);
        assert_abs_diff_eq!(q.z, 0.5477225575051661, epsilon = TOL);
        assert_abs_diff_eq!(q.w, 0.7302967433402214, epsilon = TOL);
    }

    #[test]
    fn test_zero_norm_rejected() {
        assert!(Quaternion::new(0.0, 0.0, 0.0, 0.0).normalize().is_err());
    }

    #[test]
    fn test_rotate_z_quarter_turn() {
        let q = Quaternion::from(&AxisAngle::new(Vector3::z(), 0.5 * PI).unwrap());
        let v = q.rotate(Vector3::x());
        assert_abs_diff_eq!(v.x, 0.0, epsilon = TOL);
        assert_abs_diff_eq!(v.y, 1.0, epsilon = TOL);
        assert_abs_diff_eq!(v.z, 0.0, epsilon = TOL);
    }

    #[test]
    fn test_transform_is_inverse_rotate() {
        let q = Quaternion::from(&AxisAngle::new(
            Vector3::new(1.0, -2.0, 0.5).normalize(),
            0.7,
        )
        .unwrap());
        let v = Vector3::new(0.3, -1.1, 2.2);
        let back = q.transform(q.rotate(v));
        assert_abs_diff_eq!(back.x, v.x, epsilon = TOL);
        assert_abs_diff_eq!(back.y, v.y, epsilon = TOL);
        assert_abs_diff_eq!(back.z, v.z, epsilon = TOL);
    }

    #[test]
    fn test_mul_matches_sequential_rotation() {
        let a = Quaternion::from(&AxisAngle::new(Vector3::x(), 0.4).unwrap());
        let b = Quaternion::from(&AxisAngle::new(Vector3::z(), -1.2).unwrap());
        let v = Vector3::new(1.0, 2.0, 3.0);
        let lhs = (a * b).rotate(v);
        let rhs = a.rotate(b.rotate(v));
        assert_abs_diff_eq!(lhs.x, rhs.x, epsilon = TOL);
        assert_abs_diff_eq!(lhs.y, rhs.y, epsilon = TOL);
        assert_abs_diff_eq!(lhs.z, rhs.z, epsilon = TOL);
    }

    #[test]
    fn test_angle_about() {
        let q = Quaternion::from(&AxisAngle::new(Vector3::z(), 0.3).unwrap());
        assert_abs_diff_eq!(q.angle_about(Vector3::z()), 0.3, epsilon = TOL);
        let q = Quaternion::from(&AxisAngle::new(Vector3::y(), -2.9).unwrap());
        assert_abs_diff_eq!(q.angle_about(Vector3::y()), -2.9, epsilon = TOL);
    }

    #[test]
    fn test_rate_jacobian_inverts_rate_from_angular() {
        let q = Quaternion::new(0.1, -0.4, 0.2, 0.8).normalize().unwrap();
        let prod = q.rate_jacobian() * q.rate_from_angular();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(prod[(i, j)], expected, epsilon = TOL);
            }
        }
    }

    #[test]
    fn test_rate_jacobian_finite_difference() {
        // rotate a fixed vector, perturb each quaternion coordinate, and
        // compare d(Rv)/dq against w x Rv with w from the rate jacobian
        let q = Quaternion::new(0.3, 0.1, -0.2, 0.9).normalize().unwrap();
        let v = Vector3::new(0.7, -0.2, 1.3);
        let eps = 1e-7;
        let jac = q.rate_jacobian();
        for k in 0..4 {
            let mut dq = [q.x, q.y, q.z, q.w];
            dq[k] += eps;
            let qp = Quaternion::new(dq[0], dq[1], dq[2], dq[3])
                .normalize()
                .unwrap();
            let fd = (qp.rotate(v) - q.rotate(v)) / eps;
            let w = Vector3::new(jac[(0, k)], jac[(1, k)], jac[(2, k)]);
            let analytic = w.cross(&q.rotate(v));
            assert_abs_diff_eq!(fd.x, analytic.x, epsilon = 1e-5);
            assert_abs_diff_eq!(fd.y, analytic.y, epsilon = 1e-5);
            assert_abs_diff_eq!(fd.z, analytic.z, epsilon = 1e-5);
        }
    }
}
