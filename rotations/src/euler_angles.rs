use crate::quaternion::Quaternion;
use serde::{Deserialize, Serialize};

/// ZYX (yaw-pitch-roll) Euler angles, the `rpy` convention of robot
/// description markup.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct EulerAngles {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl EulerAngles {
    pub fn new(roll: f64, pitch: f64, yaw: f64) -> Self {
        Self { roll, pitch, yaw }
    }
}

impl From<&Quaternion> for EulerAngles {
    fn from(q: &Quaternion) -> Self {
        let (x, y, z, w) = (q.x, q.y, q.z, q.w);
        let sinp = 2.0 * (w * y - z * x);
        // clamp at the gimbal singularity
        let pitch = if sinp.abs() >= 1.0 {
            0.5 * std::f64::consts::PI * sinp.signum()
        } else {
            sinp.asin()
        };
        Self {
            roll: (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y)),
            pitch,
            yaw: (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_round_trip() {
        let e = EulerAngles::new(0.3, -0.4, 1.2);
        let q = Quaternion::from(&e);
        let back = EulerAngles::from(&q);
        assert_abs_diff_eq!(back.roll, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(back.pitch, -0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(back.yaw, 1.2, epsilon = 1e-12);
    }
}
