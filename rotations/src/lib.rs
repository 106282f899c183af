pub mod axis_angle;
pub mod euler_angles;
pub mod quaternion;
pub mod rotation_matrix;

use nalgebra::Vector3;

pub mod prelude {
    pub use crate::axis_angle::*;
    pub use crate::euler_angles::*;
    pub use crate::quaternion::*;
    pub use crate::rotation_matrix::*;
    pub use crate::RotationTrait;
}

/// Trait defining rotation and transformation operations.
pub trait RotationTrait {
    /// Rotates a vector by the rotation.
    ///
    /// # Arguments
    ///
    /// * `v` - The vector to be rotated.
    ///
    /// # Returns
    ///
    /// The rotated vector.
    fn rotate(&self, v: Vector3<f64>) -> Vector3<f64>;

    /// Transforms a vector by the rotation, i.e. applies the inverse
    /// rotation. Rotating expresses a parent-frame vector that was rotated
    /// along with the frame; transforming expresses a parent-frame vector
    /// in the rotated frame's coordinates.
    ///
    /// # Arguments
    ///
    /// * `v` - The vector to be transformed.
    ///
    /// # Returns
    ///
    /// The transformed vector.
    fn transform(&self, v: Vector3<f64>) -> Vector3<f64>;

    fn inv(&self) -> Self;

    fn identity() -> Self;
}
