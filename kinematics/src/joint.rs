use crate::dof::Dof;
use nalgebra::{DVector, Vector3};
use rotations::quaternion::Quaternion;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use transforms::Transform;

#[derive(Debug, Error)]
pub enum JointErrors {
    #[error("joint coordinate slice has dimension {got}, expected {expected}")]
    WrongDofDimension { got: usize, expected: usize },
    #[error("quaternion coordinate block has zero norm")]
    ZeroQuaternion,
    #[error("unknown generic joint code '{0}'")]
    UnknownGenericCode(char),
}

/// Closed set of joint types. The type determines the coordinate
/// dimension and how coordinates map to the frame's relative transform;
/// the Jacobian accumulation dispatches on the same tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JointType {
    HingeX,
    HingeY,
    HingeZ,
    TransX,
    TransY,
    TransZ,
    TransXY,
    Trans3,
    /// planar: x/y translation then rotation about z
    TransXYPhi,
    /// planar: rotation about z, then x/y translation in the rotated frame
    PhiTransXY,
    QuatBall,
    /// x translation plus quaternion ball
    XBall,
    /// 3 translations plus quaternion ball
    Free,
    /// per-letter generators: xyz/XYZ (signed) translations, abc/ABC
    /// (signed) hinges about the parent axes, w a quaternion block
    Generic(String),
    Rigid,
    /// the time-interval coordinate of a trajectory slice
    Tau,
}

impl JointType {
    pub fn dim(&self) -> usize {
        match self {
            JointType::HingeX | JointType::HingeY | JointType::HingeZ => 1,
            JointType::TransX | JointType::TransY | JointType::TransZ => 1,
            JointType::TransXY => 2,
            JointType::Trans3 => 3,
            JointType::TransXYPhi | JointType::PhiTransXY => 3,
            JointType::QuatBall => 4,
            JointType::XBall => 5,
            JointType::Free => 7,
            JointType::Generic(code) => code
                .chars()
                .map(|c| if c == 'w' { 4 } else { 1 })
                .sum(),
            JointType::Rigid => 0,
            JointType::Tau => 1,
        }
    }

    /// Local axis of the hinge part, for the pure hinge and planar types.
    pub(crate) fn hinge_axis(&self) -> Option<Vector3<f64>> {
        match self {
            JointType::HingeX => Some(Vector3::x()),
            JointType::HingeY => Some(Vector3::y()),
            JointType::HingeZ => Some(Vector3::z()),
            JointType::TransXYPhi | JointType::PhiTransXY => Some(Vector3::z()),
            _ => None,
        }
    }

    pub(crate) fn trans_axis(&self) -> Option<Vector3<f64>> {
        match self {
            JointType::TransX => Some(Vector3::x()),
            JointType::TransY => Some(Vector3::y()),
            JointType::TransZ => Some(Vector3::z()),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), JointErrors> {
        if let JointType::Generic(code) = self {
            for c in code.chars() {
                parse_code(c)?;
            }
        }
        Ok(())
    }
}

/// One generator of a generic joint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum GenericCode {
    Trans(usize, f64),
    Rot(usize, f64),
    Quat,
}

pub(crate) fn parse_code(c: char) -> Result<GenericCode, JointErrors> {
    Ok(match c {
        'x' => GenericCode::Trans(0, 1.0),
        'X' => GenericCode::Trans(0, -1.0),
        'y' => GenericCode::Trans(1, 1.0),
        'Y' => GenericCode::Trans(1, -1.0),
        'z' => GenericCode::Trans(2, 1.0),
        'Z' => GenericCode::Trans(2, -1.0),
        'a' => GenericCode::Rot(0, 1.0),
        'A' => GenericCode::Rot(0, -1.0),
        'b' => GenericCode::Rot(1, 1.0),
        'B' => GenericCode::Rot(1, -1.0),
        'c' => GenericCode::Rot(2, 1.0),
        'C' => GenericCode::Rot(2, -1.0),
        'w' => GenericCode::Quat,
        _ => return Err(JointErrors::UnknownGenericCode(c)),
    })
}

pub(crate) fn unit(k: usize) -> Vector3<f64> {
    match k {
        0 => Vector3::x(),
        1 => Vector3::y(),
        _ => Vector3::z(),
    }
}

fn rot_axis(k: usize, angle: f64) -> Quaternion {
    let half = 0.5 * angle;
    let s = half.sin();
    let a = unit(k);
    Quaternion::new(a.x * s, a.y * s, a.z * s, half.cos())
}

fn quat_from_slice(q: &[f64]) -> Result<Quaternion, JointErrors> {
    Quaternion::new(q[0], q[1], q[2], q[3])
        .normalize()
        .map_err(|_| JointErrors::ZeroQuaternion)
}

/// A joint: one degree of freedom between a frame and its parent.
///
/// The joint lives on the child frame and drives (parts of) that frame's
/// relative transform. Components it does not drive keep their loaded
/// values, so a hinge can sit at a fixed translational offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Joint {
    pub joint_type: JointType,
    pub dof: Dof,
    /// control cost weight exported to the optimizer metric
    pub h: f64,
}

impl Joint {
    pub fn new(joint_type: JointType) -> Result<Self, JointErrors> {
        joint_type.validate()?;
        let dof = Dof::new(joint_type.dim());
        Ok(Self {
            joint_type,
            dof,
            h: 1.0,
        })
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.dof.scale = scale;
        self
    }

    pub fn with_limits(mut self, limits: Vec<(f64, f64)>) -> Self {
        self.dof.limits = limits;
        self
    }

    pub fn with_q0(mut self, q0: DVector<f64>) -> Self {
        self.dof.q0 = Some(q0);
        self
    }

    /// Pushes a coordinate slice into the frame's relative transform (and
    /// time coordinate, for `Tau`).
    pub fn apply_dofs(
        &self,
        q: &[f64],
        rel: &mut Transform,
        tau: &mut f64,
    ) -> Result<(), JointErrors> {
        let expected = self.dof.dim;
        if q.len() != expected {
            return Err(JointErrors::WrongDofDimension {
                got: q.len(),
                expected,
            });
        }
        let s = self.dof.scale;
        match &self.joint_type {
            JointType::HingeX => rel.rot = rot_axis(0, s * q[0]),
            JointType::HingeY => rel.rot = rot_axis(1, s * q[0]),
            JointType::HingeZ => rel.rot = rot_axis(2, s * q[0]),
            JointType::TransX => rel.pos.x = s * q[0],
            JointType::TransY => rel.pos.y = s * q[0],
            JointType::TransZ => rel.pos.z = s * q[0],
            JointType::TransXY => {
                rel.pos.x = s * q[0];
                rel.pos.y = s * q[1];
            }
            JointType::Trans3 => {
                rel.pos = s * Vector3::new(q[0], q[1], q[2]);
            }
            JointType::TransXYPhi => {
                rel.pos.x = s * q[0];
                rel.pos.y = s * q[1];
                rel.rot = rot_axis(2, s * q[2]);
            }
            JointType::PhiTransXY => {
                use rotations::RotationTrait;
                rel.rot = rot_axis(2, s * q[0]);
                rel.pos = rel.rot.rotate(Vector3::new(s * q[1], s * q[2], 0.0));
            }
            JointType::QuatBall => rel.rot = quat_from_slice(&q[0..4])?,
            JointType::XBall => {
                rel.pos.x = s * q[0];
                rel.rot = quat_from_slice(&q[1..5])?;
            }
            JointType::Free => {
                rel.pos = s * Vector3::new(q[0], q[1], q[2]);
                rel.rot = quat_from_slice(&q[3..7])?;
            }
            JointType::Generic(code) => {
                let mut i = 0;
                let mut rot = Quaternion::IDENTITY;
                let mut has_rot = false;
                for c in code.chars() {
                    match parse_code(c)? {
                        GenericCode::Trans(k, sign) => {
                            rel.pos[k] = sign * s * q[i];
                            i += 1;
                        }
                        GenericCode::Rot(k, sign) => {
                            rot = rot * rot_axis(k, sign * s * q[i]);
                            has_rot = true;
                            i += 1;
                        }
                        GenericCode::Quat => {
                            rot = rot * quat_from_slice(&q[i..i + 4])?;
                            has_rot = true;
                            i += 4;
                        }
                    }
                }
                if has_rot {
                    rel.rot = rot;
                }
            }
            JointType::Rigid => {}
            JointType::Tau => *tau = s * q[0],
        }
        Ok(())
    }

    /// Reads the coordinates back out of the frame's relative transform,
    /// the inverse of `apply_dofs` up to quaternion normalization.
    pub fn read_dofs(&self, rel: &Transform, tau: f64) -> Result<DVector<f64>, JointErrors> {
        use rotations::RotationTrait;
        let s = self.dof.scale;
        let q = match &self.joint_type {
            JointType::HingeX => vec![rel.rot.angle_about(Vector3::x()) / s],
            JointType::HingeY => vec![rel.rot.angle_about(Vector3::y()) / s],
            JointType::HingeZ => vec![rel.rot.angle_about(Vector3::z()) / s],
            JointType::TransX => vec![rel.pos.x / s],
            JointType::TransY => vec![rel.pos.y / s],
            JointType::TransZ => vec![rel.pos.z / s],
            JointType::TransXY => vec![rel.pos.x / s, rel.pos.y / s],
            JointType::Trans3 => vec![rel.pos.x / s, rel.pos.y / s, rel.pos.z / s],
            JointType::TransXYPhi => vec![
                rel.pos.x / s,
                rel.pos.y / s,
                rel.rot.angle_about(Vector3::z()) / s,
            ],
            JointType::PhiTransXY => {
                let local = rel.rot.transform(rel.pos);
                vec![
                    rel.rot.angle_about(Vector3::z()) / s,
                    local.x / s,
                    local.y / s,
                ]
            }
            JointType::QuatBall => vec![rel.rot.x, rel.rot.y, rel.rot.z, rel.rot.w],
            JointType::XBall => vec![
                rel.pos.x / s,
                rel.rot.x,
                rel.rot.y,
                rel.rot.z,
                rel.rot.w,
            ],
            JointType::Free => vec![
                rel.pos.x / s,
                rel.pos.y / s,
                rel.pos.z / s,
                rel.rot.x,
                rel.rot.y,
                rel.rot.z,
                rel.rot.w,
            ],
            JointType::Generic(code) => {
                let mut out = Vec::with_capacity(self.dof.dim);
                let mut rem = rel.rot;
                for c in code.chars() {
                    match parse_code(c)? {
                        GenericCode::Trans(k, sign) => out.push(sign * rel.pos[k] / s),
                        GenericCode::Rot(k, sign) => {
                            let theta = rem.angle_about(unit(k));
                            out.push(sign * theta / s);
                            rem = rot_axis(k, -theta) * rem;
                        }
                        GenericCode::Quat => {
                            out.extend([rem.x, rem.y, rem.z, rem.w]);
                            rem = Quaternion::IDENTITY;
                        }
                    }
                }
                out
            }
            JointType::Rigid => Vec::new(),
            JointType::Tau => vec![tau / s],
        };
        Ok(DVector::from_vec(q))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;
    const TOL: f64 = 1e-12;

    fn round_trip(joint_type: JointType, q: &[f64]) -> DVector<f64> {
        let joint = Joint::new(joint_type).unwrap();
        let mut rel = Transform::IDENTITY;
        let mut tau = 0.0;
        joint.apply_dofs(q, &mut rel, &mut tau).unwrap();
        joint.read_dofs(&rel, tau).unwrap()
    }

    #[test]
    fn test_hinge_round_trip() {
        let q = round_trip(JointType::HingeZ, &[0.7]);
        assert_abs_diff_eq!(q[0], 0.7, epsilon = TOL);
        let q = round_trip(JointType::HingeY, &[-2.9]);
        assert_abs_diff_eq!(q[0], -2.9, epsilon = TOL);
    }

    #[test]
    fn test_translation_round_trips() {
        let q = round_trip(JointType::TransY, &[1.3]);
        assert_abs_diff_eq!(q[0], 1.3, epsilon = TOL);
        let q = round_trip(JointType::TransXY, &[0.5, -0.2]);
        assert_abs_diff_eq!(q[0], 0.5, epsilon = TOL);
        assert_abs_diff_eq!(q[1], -0.2, epsilon = TOL);
        let q = round_trip(JointType::Trans3, &[0.1, 0.2, 0.3]);
        assert_abs_diff_eq!(q[2], 0.3, epsilon = TOL);
    }

    #[test]
    fn test_planar_round_trips() {
        let q = round_trip(JointType::TransXYPhi, &[0.5, -0.2, 0.9]);
        assert_abs_diff_eq!(q[0], 0.5, epsilon = TOL);
        assert_abs_diff_eq!(q[1], -0.2, epsilon = TOL);
        assert_abs_diff_eq!(q[2], 0.9, epsilon = TOL);

        let q = round_trip(JointType::PhiTransXY, &[0.9, 0.5, -0.2]);
        assert_abs_diff_eq!(q[0], 0.9, epsilon = TOL);
        assert_abs_diff_eq!(q[1], 0.5, epsilon = TOL);
        assert_abs_diff_eq!(q[2], -0.2, epsilon = TOL);
    }

    #[test]
    fn test_quaternion_joints_normalize() {
        // unnormalized input reads back as its unit version
        let q = round_trip(JointType::QuatBall, &[0.0, 0.0, 2.0, 0.0]);
        assert_abs_diff_eq!(q[2], 1.0, epsilon = TOL);
        assert_abs_diff_eq!(q[3], 0.0, epsilon = TOL);

        let q = round_trip(JointType::Free, &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 1.0]);
        assert_abs_diff_eq!(q[0], 1.0, epsilon = TOL);
        assert_abs_diff_eq!(q[6], 1.0, epsilon = TOL);

        let q = round_trip(JointType::XBall, &[0.4, 0.0, 0.0, 0.0, -1.0]);
        assert_abs_diff_eq!(q[0], 0.4, epsilon = TOL);
        assert_abs_diff_eq!(q[4], -1.0, epsilon = TOL);
    }

    #[test]
    fn test_zero_quaternion_rejected() {
        let joint = Joint::new(JointType::QuatBall).unwrap();
        let mut rel = Transform::IDENTITY;
        let mut tau = 0.0;
        assert!(joint
            .apply_dofs(&[0.0; 4], &mut rel, &mut tau)
            .is_err());
    }

    #[test]
    fn test_generic_round_trip() {
        let q = round_trip(JointType::Generic("xzc".to_string()), &[0.4, -0.7, 1.1]);
        assert_abs_diff_eq!(q[0], 0.4, epsilon = TOL);
        assert_abs_diff_eq!(q[1], -0.7, epsilon = TOL);
        assert_abs_diff_eq!(q[2], 1.1, epsilon = TOL);

        // signed translation
        let q = round_trip(JointType::Generic("Y".to_string()), &[0.6]);
        assert_abs_diff_eq!(q[0], 0.6, epsilon = TOL);
    }

    #[test]
    fn test_generic_dim_counts_quaternion_block() {
        assert_eq!(JointType::Generic("xw".to_string()).dim(), 5);
    }

    #[test]
    fn test_unknown_generic_code_rejected() {
        assert!(Joint::new(JointType::Generic("xq".to_string())).is_err());
    }

    #[test]
    fn test_scale_round_trip() {
        let joint = Joint::new(JointType::HingeZ).unwrap().with_scale(2.0);
        let mut rel = Transform::IDENTITY;
        let mut tau = 0.0;
        joint.apply_dofs(&[0.3], &mut rel, &mut tau).unwrap();
        assert_abs_diff_eq!(
            rel.rot.angle_about(nalgebra::Vector3::z()),
            0.6,
            epsilon = TOL
        );
        let q = joint.read_dofs(&rel, tau).unwrap();
        assert_abs_diff_eq!(q[0], 0.3, epsilon = TOL);
    }

    #[test]
    fn test_hinge_at_translational_offset_keeps_offset() {
        let joint = Joint::new(JointType::HingeZ).unwrap();
        let mut rel = Transform::from_position(1.0, 0.0, 0.0);
        let mut tau = 0.0;
        joint.apply_dofs(&[0.5 * PI], &mut rel, &mut tau).unwrap();
        assert_abs_diff_eq!(rel.pos.x, 1.0, epsilon = TOL);
    }

    #[test]
    fn test_rigid_has_no_coordinates() {
        let q = round_trip(JointType::Rigid, &[]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_tau_drives_time_coordinate() {
        let joint = Joint::new(JointType::Tau).unwrap();
        let mut rel = Transform::IDENTITY;
        let mut tau = 0.0;
        joint.apply_dofs(&[0.25], &mut rel, &mut tau).unwrap();
        assert_abs_diff_eq!(tau, 0.25, epsilon = TOL);
        let q = joint.read_dofs(&rel, tau).unwrap();
        assert_abs_diff_eq!(q[0], 0.25, epsilon = TOL);
    }
}
