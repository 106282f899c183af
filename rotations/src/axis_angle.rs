use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AxisAngleErrors {
    #[error("axis must have nonzero length")]
    ZeroAxis,
}

/// Rotation of `angle` radians about a unit `axis`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxisAngle {
    pub axis: Vector3<f64>,
    pub angle: f64,
}

impl AxisAngle {
    /// Normalizes the given axis.
    pub fn new(axis: Vector3<f64>, angle: f64) -> Result<Self, AxisAngleErrors> {
        let n = axis.norm();
        if n < f64::EPSILON {
            return Err(AxisAngleErrors::ZeroAxis);
        }
        Ok(Self {
            axis: axis / n,
            angle,
        })
    }
}
