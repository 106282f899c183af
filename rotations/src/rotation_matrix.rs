use crate::{quaternion::Quaternion, RotationTrait};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::Mul;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RotationMatrixErrors {
    #[error("matrix is not orthonormal")]
    NotOrthonormal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RotationMatrix(Matrix3<f64>);

impl RotationMatrix {
    const ORTHONORMAL_TOL: f64 = 1e-9;

    /// Row-major construction, validated for orthonormality.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        m11: f64,
        m12: f64,
        m13: f64,
        m21: f64,
        m22: f64,
        m23: f64,
        m31: f64,
        m32: f64,
        m33: f64,
    ) -> Result<Self, RotationMatrixErrors> {
        let m = Matrix3::new(m11, m12, m13, m21, m22, m23, m31, m32, m33);
        let delta = (m * m.transpose() - Matrix3::identity()).norm();
        if delta > Self::ORTHONORMAL_TOL {
            return Err(RotationMatrixErrors::NotOrthonormal);
        }
        Ok(Self(m))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    /// The i-th column, i.e. the rotated image of the i-th basis vector.
    pub fn column(&self, i: usize) -> Vector3<f64> {
        Vector3::from(self.0.column(i))
    }
}

impl Default for RotationMatrix {
    fn default() -> Self {
        Self(Matrix3::identity())
    }
}

impl Mul<RotationMatrix> for RotationMatrix {
    type Output = RotationMatrix;

    fn mul(self, rhs: RotationMatrix) -> RotationMatrix {
        RotationMatrix(self.0 * rhs.0)
    }
}

impl RotationTrait for RotationMatrix {
    fn rotate(&self, v: Vector3<f64>) -> Vector3<f64> {
        self.0 * v
    }

    fn transform(&self, v: Vector3<f64>) -> Vector3<f64> {
        self.0.transpose() * v
    }

    fn inv(&self) -> Self {
        Self(self.0.transpose())
    }

    fn identity() -> Self {
        Self(Matrix3::identity())
    }
}

impl From<&Quaternion> for RotationMatrix {
    fn from(q: &Quaternion) -> Self {
        let (x, y, z, w) = (q.x, q.y, q.z, q.w);
        Self(Matrix3::new(
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
            2.0 * (x * y + w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - w * x),
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            1.0 - 2.0 * (x * x + y * y),
        ))
    }
}
