use super::Configuration;
use crate::{
    frame::FrameId,
    jacobian::{Jacobian, JacobianAccumulator},
    joint::{parse_code, unit, GenericCode, JointType},
    KinematicsErrors,
};
use nalgebra::{DMatrix, DVector, Vector3};
use rotations::{quaternion::Quaternion, rotation_matrix::RotationMatrix, RotationTrait};

/// One quaternion coordinate block mapped to world angular velocity,
/// normalized by the actual (possibly non-unit) norm of the block so the
/// Jacobian stays correct for unnormalized intermediate coordinates.
fn add_quat_columns(
    acc: &mut JacobianAccumulator,
    world_rot: Quaternion,
    rel_rot: Quaternion,
    col: usize,
    lever: Option<Vector3<f64>>,
    coord_norm: f64,
) {
    let r = RotationMatrix::from(&world_rot);
    let jr = rel_rot.rate_jacobian();
    let n = if coord_norm < f64::EPSILON {
        1.0
    } else {
        coord_norm
    };
    for k in 0..4 {
        let w_local = Vector3::new(jr[(0, k)], jr[(1, k)], jr[(2, k)]);
        let w_world = r.rotate(w_local) / n;
        let v = match lever {
            Some(d) => w_world.cross(&d),
            None => w_world,
        };
        acc.add_column(col + k, v);
    }
}

impl Configuration {
    fn quat_coord_norm(&self, col: usize) -> f64 {
        (0..4).map(|k| self.q[col + k] * self.q[col + k]).sum::<f64>().sqrt()
    }

    /// Position Jacobian of a world point rigidly attached to `frame`:
    /// walk to the root, adding each active ancestor joint's columns.
    fn accum_pos(
        &mut self,
        frame: FrameId,
        pos_world: Vector3<f64>,
    ) -> Result<JacobianAccumulator, KinematicsErrors> {
        self.ensure_q()?;
        self.ensure_x(frame);
        let mut acc = JacobianAccumulator::new(3, self.q.len());
        let mut a = frame;
        loop {
            let Some(parent) = self.frames[a.0].parent else {
                break;
            };
            let active = self.frames[a.0]
                .joint
                .as_ref()
                .map(|j| j.dof.active && j.dof.dim > 0)
                .unwrap_or(false);
            if active {
                let j = self.frames[a.0].joint.as_ref().expect("checked above");
                let rel = self.frames[a.0].rel;
                let parent_x = self.frames[parent.0].x;
                let org = self.frames[a.0].x.pos;
                let r = parent_x.rot;
                let (j_idx, s) = (j.dof.q_index, j.dof.scale);
                match &j.joint_type {
                    JointType::HingeX | JointType::HingeY | JointType::HingeZ => {
                        let axis = r.rotate(j.joint_type.hinge_axis().expect("hinge"));
                        acc.add_column(j_idx, s * axis.cross(&(pos_world - org)));
                    }
                    JointType::TransX | JointType::TransY | JointType::TransZ => {
                        let axis = r.rotate(j.joint_type.trans_axis().expect("translation"));
                        acc.add_column(j_idx, s * axis);
                    }
                    JointType::TransXY => {
                        acc.add_column(j_idx, s * r.rotate(Vector3::x()));
                        acc.add_column(j_idx + 1, s * r.rotate(Vector3::y()));
                    }
                    JointType::Trans3 => {
                        for k in 0..3 {
                            acc.add_column(j_idx + k, s * r.rotate(unit(k)));
                        }
                    }
                    JointType::TransXYPhi => {
                        acc.add_column(j_idx, s * r.rotate(Vector3::x()));
                        acc.add_column(j_idx + 1, s * r.rotate(Vector3::y()));
                        let axis = r.rotate(Vector3::z());
                        acc.add_column(j_idx + 2, s * axis.cross(&(pos_world - org)));
                    }
                    JointType::PhiTransXY => {
                        // phi rotates the subsequent translation as well,
                        // so its lever reaches back to the parent origin
                        let axis = r.rotate(Vector3::z());
                        acc.add_column(j_idx, s * axis.cross(&(pos_world - parent_x.pos)));
                        let rq = r * rel.rot;
                        acc.add_column(j_idx + 1, s * rq.rotate(Vector3::x()));
                        acc.add_column(j_idx + 2, s * rq.rotate(Vector3::y()));
                    }
                    JointType::QuatBall => {
                        let norm = self.quat_coord_norm(j_idx);
                        add_quat_columns(&mut acc, r, rel.rot, j_idx, Some(pos_world - org), norm);
                    }
                    JointType::XBall => {
                        acc.add_column(j_idx, s * r.rotate(Vector3::x()));
                        let norm = self.quat_coord_norm(j_idx + 1);
                        add_quat_columns(
                            &mut acc,
                            r,
                            rel.rot,
                            j_idx + 1,
                            Some(pos_world - org),
                            norm,
                        );
                    }
                    JointType::Free => {
                        for k in 0..3 {
                            acc.add_column(j_idx + k, s * r.rotate(unit(k)));
                        }
                        let norm = self.quat_coord_norm(j_idx + 3);
                        add_quat_columns(
                            &mut acc,
                            r,
                            rel.rot,
                            j_idx + 3,
                            Some(pos_world - org),
                            norm,
                        );
                    }
                    JointType::Generic(code) => {
                        let mut i = j_idx;
                        for c in code.chars() {
                            match parse_code(c)? {
                                GenericCode::Trans(k, sign) => {
                                    acc.add_column(i, sign * s * r.rotate(unit(k)));
                                    i += 1;
                                }
                                GenericCode::Rot(k, sign) => {
                                    let axis = r.rotate(unit(k));
                                    acc.add_column(
                                        i,
                                        sign * s * axis.cross(&(pos_world - org)),
                                    );
                                    i += 1;
                                }
                                GenericCode::Quat => {
                                    let norm = self.quat_coord_norm(i);
                                    add_quat_columns(
                                        &mut acc,
                                        r,
                                        rel.rot,
                                        i,
                                        Some(pos_world - org),
                                        norm,
                                    );
                                    i += 4;
                                }
                            }
                        }
                    }
                    JointType::Rigid | JointType::Tau => {}
                }
            }
            a = parent;
        }
        Ok(acc)
    }

    /// Angular-velocity Jacobian: the same dispatch without the lever-arm
    /// cross product; pure translations contribute nothing.
    fn accum_angular(&mut self, frame: FrameId) -> Result<JacobianAccumulator, KinematicsErrors> {
        self.ensure_q()?;
        self.ensure_x(frame);
        let mut acc = JacobianAccumulator::new(3, self.q.len());
        let mut a = frame;
        loop {
            let Some(parent) = self.frames[a.0].parent else {
                break;
            };
            let active = self.frames[a.0]
                .joint
                .as_ref()
                .map(|j| j.dof.active && j.dof.dim > 0)
                .unwrap_or(false);
            if active {
                let j = self.frames[a.0].joint.as_ref().expect("checked above");
                let rel = self.frames[a.0].rel;
                let r = self.frames[parent.0].x.rot;
                let (j_idx, s) = (j.dof.q_index, j.dof.scale);
                match &j.joint_type {
                    JointType::HingeX | JointType::HingeY | JointType::HingeZ => {
                        let axis = r.rotate(j.joint_type.hinge_axis().expect("hinge"));
                        acc.add_column(j_idx, s * axis);
                    }
                    JointType::TransXYPhi => {
                        let axis = r.rotate(Vector3::z());
                        acc.add_column(j_idx + 2, s * axis);
                    }
                    JointType::PhiTransXY => {
                        let axis = r.rotate(Vector3::z());
                        acc.add_column(j_idx, s * axis);
                    }
                    JointType::QuatBall => {
                        let norm = self.quat_coord_norm(j_idx);
                        add_quat_columns(&mut acc, r, rel.rot, j_idx, None, norm);
                    }
                    JointType::XBall => {
                        let norm = self.quat_coord_norm(j_idx + 1);
                        add_quat_columns(&mut acc, r, rel.rot, j_idx + 1, None, norm);
                    }
                    JointType::Free => {
                        let norm = self.quat_coord_norm(j_idx + 3);
                        add_quat_columns(&mut acc, r, rel.rot, j_idx + 3, None, norm);
                    }
                    JointType::Generic(code) => {
                        let mut i = j_idx;
                        for c in code.chars() {
                            match parse_code(c)? {
                                GenericCode::Trans(_, _) => i += 1,
                                GenericCode::Rot(k, sign) => {
                                    acc.add_column(i, sign * s * r.rotate(unit(k)));
                                    i += 1;
                                }
                                GenericCode::Quat => {
                                    let norm = self.quat_coord_norm(i);
                                    add_quat_columns(&mut acc, r, rel.rot, i, None, norm);
                                    i += 4;
                                }
                            }
                        }
                    }
                    JointType::TransX
                    | JointType::TransY
                    | JointType::TransZ
                    | JointType::TransXY
                    | JointType::Trans3
                    | JointType::Rigid
                    | JointType::Tau => {}
                }
            }
            a = parent;
        }
        Ok(acc)
    }

    /// Linear velocity of a world point attached to `frame`, per unit
    /// joint velocity.
    pub fn jacobian_pos(
        &mut self,
        frame: FrameId,
        pos_world: Vector3<f64>,
    ) -> Result<Jacobian, KinematicsErrors> {
        let acc = self.accum_pos(frame, pos_world)?;
        Ok(acc.emit(self.jacobian_mode))
    }

    /// Angular velocity of `frame` per unit joint velocity.
    pub fn jacobian_angular(&mut self, frame: FrameId) -> Result<Jacobian, KinematicsErrors> {
        let acc = self.accum_angular(frame)?;
        Ok(acc.emit(self.jacobian_mode))
    }

    /// World position of a point rigidly attached to `frame` (at local
    /// offset `rel`), with its Jacobian.
    pub fn kinematics_pos(
        &mut self,
        frame: FrameId,
        rel: Option<Vector3<f64>>,
    ) -> Result<(Vector3<f64>, Jacobian), KinematicsErrors> {
        self.ensure_q()?;
        let x = self.ensure_x(frame);
        let mut pos = x.pos;
        if let Some(r) = rel {
            pos += x.rot.rotate(r);
        }
        let acc = self.accum_pos(frame, pos)?;
        Ok((pos, acc.emit(self.jacobian_mode)))
    }

    /// A frame-fixed direction vector expressed in world coordinates,
    /// with its Jacobian.
    pub fn kinematics_vec(
        &mut self,
        frame: FrameId,
        vec: Vector3<f64>,
    ) -> Result<(Vector3<f64>, Jacobian), KinematicsErrors> {
        self.ensure_q()?;
        let x = self.ensure_x(frame);
        let v = x.rot.rotate(vec);
        let mut acc = self.accum_angular(frame)?;
        acc.cross(v);
        Ok((v, acc.emit(self.jacobian_mode)))
    }

    /// Frame orientation as a quaternion, with the 4-row Jacobian mapping
    /// joint rates to quaternion rates.
    pub fn kinematics_quat(
        &mut self,
        frame: FrameId,
    ) -> Result<(Quaternion, Jacobian), KinematicsErrors> {
        self.ensure_q()?;
        let rot = self.ensure_x(frame).rot;
        let mut acc = self.accum_angular(frame)?;
        let t = rot.rate_from_angular();
        acc.premultiply(&DMatrix::from_fn(4, 3, |i, j| t[(i, j)]));
        Ok((rot, acc.emit(self.jacobian_mode)))
    }

    /// Frame orientation as the three world-frame axis vectors (a
    /// flattened rotation matrix), with the 9-row Jacobian.
    pub fn kinematics_mat(
        &mut self,
        frame: FrameId,
    ) -> Result<(DVector<f64>, Jacobian), KinematicsErrors> {
        self.ensure_q()?;
        let rm = RotationMatrix::from(&self.ensure_x(frame).rot);
        let mut y = DVector::zeros(9);
        for k in 0..3 {
            let col = rm.column(k);
            for r in 0..3 {
                y[3 * k + r] = col[r];
            }
        }
        let base = self.accum_angular(frame)?;
        let mut blocks = Vec::with_capacity(3);
        for k in 0..3 {
            let mut b = base.clone();
            b.cross(rm.column(k));
            blocks.push(b);
        }
        let acc = JacobianAccumulator::stack(blocks);
        Ok((y, acc.emit(self.jacobian_mode)))
    }

    /// The time coordinate of the frame's chain, with its (single-entry)
    /// Jacobian.
    pub fn kinematics_tau(&mut self, frame: FrameId) -> Result<(f64, Jacobian), KinematicsErrors> {
        self.ensure_q()?;
        let mut acc = JacobianAccumulator::new(1, self.q.len());
        let mut a = frame;
        loop {
            if let Some(j) = &self.frames[a.0].joint {
                if j.dof.active && j.joint_type == JointType::Tau {
                    acc.add(0, j.dof.q_index, j.dof.scale);
                }
            }
            match self.frames[a.0].parent {
                Some(p) => a = p,
                None => break,
            }
        }
        Ok((self.frames[a.0].tau, acc.emit(self.jacobian_mode)))
    }

    /// An all-zero value/Jacobian pair of the given dimension, in the
    /// configured output mode.
    pub fn kinematics_zero(
        &mut self,
        n: usize,
    ) -> Result<(DVector<f64>, Jacobian), KinematicsErrors> {
        self.ensure_q()?;
        let acc = JacobianAccumulator::new(n, self.q.len());
        Ok((DVector::zeros(n), acc.emit(self.jacobian_mode)))
    }

    //-- force exchange queries -------------------------------------------

    /// Point of application of an exchange, with the identity-block
    /// Jacobian into its coordinate slice.
    pub fn kin_poa(&mut self, k: usize) -> Result<(Vector3<f64>, Jacobian), KinematicsErrors> {
        self.ensure_q()?;
        let mut acc = JacobianAccumulator::new(3, self.q.len());
        let fex = &self.forces[k];
        if fex.dof.active {
            if let Some(o) = fex.exchange_type.poa_offset() {
                let (qi, s) = (fex.dof.q_index, fex.dof.scale);
                for r in 0..3 {
                    acc.add(r, qi + o + r, s);
                }
            }
        }
        Ok((self.forces[k].poa, acc.emit(self.jacobian_mode)))
    }

    pub fn kin_force(&mut self, k: usize) -> Result<(Vector3<f64>, Jacobian), KinematicsErrors> {
        self.ensure_q()?;
        let mut acc = JacobianAccumulator::new(3, self.q.len());
        let fex = &self.forces[k];
        if fex.dof.active {
            let (qi, s) = (fex.dof.q_index, fex.dof.scale);
            match fex.exchange_type {
                crate::force_exchange::ForceExchangeType::ForceZ => {
                    acc.add(2, qi, s);
                }
                _ => {
                    if let Some(o) = fex.exchange_type.force_offset() {
                        for r in 0..3 {
                            acc.add(r, qi + o + r, s);
                        }
                    }
                }
            }
        }
        Ok((self.forces[k].force, acc.emit(self.jacobian_mode)))
    }

    pub fn kin_torque(&mut self, k: usize) -> Result<(Vector3<f64>, Jacobian), KinematicsErrors> {
        self.ensure_q()?;
        let mut acc = JacobianAccumulator::new(3, self.q.len());
        let fex = &self.forces[k];
        if fex.dof.active {
            if let Some(o) = fex.exchange_type.torque_offset() {
                let (qi, s) = (fex.dof.q_index, fex.dof.scale);
                for r in 0..3 {
                    acc.add(r, qi + o + r, s);
                }
            }
        }
        Ok((self.forces[k].torque, acc.emit(self.jacobian_mode)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dof::DofId,
        force_exchange::ForceExchangeType,
        jacobian::JacobianMode,
        joint::Joint,
    };
    use approx::assert_abs_diff_eq;
    use nalgebra::DVector;
    use std::f64::consts::PI;
    use transforms::Transform;
    const TOL: f64 = 1e-12;

    /// root -> one jointed frame per type (each at a small fixed offset)
    /// -> tip marker.
    fn build_chain(types: &[JointType]) -> (Configuration, FrameId) {
        let mut c = Configuration::new();
        let mut parent = c.add_frame("base");
        for (i, t) in types.iter().enumerate() {
            let f = c.add_frame_with_parent(&format!("link{i}"), parent);
            c.set_rel(
                f,
                Transform::from_position(0.3 + 0.1 * i as f64, -0.1, 0.2),
            );
            c.set_joint(f, Joint::new(t.clone()).unwrap());
            parent = f;
        }
        let tip = c.add_frame_with_parent("tip", parent);
        c.set_rel(tip, Transform::from_position(0.5, 0.0, 0.0));
        (c, tip)
    }

    /// A deterministic, moderately-sized coordinate vector: the read-back
    /// defaults plus a per-coordinate offset (keeps quaternion blocks
    /// away from zero).
    fn nudged_state(c: &mut Configuration) -> DVector<f64> {
        let mut q = c.get_joint_state().unwrap().clone();
        for i in 0..q.len() {
            q[i] += 0.1 + 0.07 * (i as f64 * 1.3).sin();
        }
        q
    }

    fn fd_check_pos(c: &mut Configuration, frame: FrameId, rel: Option<Vector3<f64>>) {
        let q0 = c.get_joint_state().unwrap().clone();
        let jac = c
            .kinematics_pos(frame, rel)
            .unwrap()
            .1
            .to_dense()
            .unwrap();
        let eps = 1e-6;
        for i in 0..q0.len() {
            let mut qp = q0.clone();
            qp[i] += eps;
            let mut qm = q0.clone();
            qm[i] -= eps;
            c.set_joint_state(&qp).unwrap();
            let yp = c.kinematics_pos(frame, rel).unwrap().0;
            c.set_joint_state(&qm).unwrap();
            let ym = c.kinematics_pos(frame, rel).unwrap().0;
            let fd = (yp - ym) / (2.0 * eps);
            for r in 0..3 {
                assert_abs_diff_eq!(jac[(r, i)], fd[r], epsilon = 1e-5);
            }
        }
        c.set_joint_state(&q0).unwrap();
    }

    #[test]
    fn test_two_link_hinge_arm_positions() {
        let mut c = Configuration::new();
        let base = c.add_frame("base");
        let j1 = c.add_frame_with_parent("j1", base);
        c.set_joint(j1, Joint::new(JointType::HingeZ).unwrap());
        let j2 = c.add_frame_with_parent("j2", j1);
        c.set_rel(j2, Transform::from_position(1.0, 0.0, 0.0));
        c.set_joint(j2, Joint::new(JointType::HingeZ).unwrap());
        let tip = c.add_frame_with_parent("tip", j2);
        c.set_rel(tip, Transform::from_position(1.0, 0.0, 0.0));

        c.set_joint_state(&DVector::from_vec(vec![0.0, 0.0])).unwrap();
        let p = c.kinematics_pos(tip, None).unwrap().0;
        assert_abs_diff_eq!(p.x, 2.0, epsilon = TOL);
        assert_abs_diff_eq!(p.y, 0.0, epsilon = TOL);

        c.set_joint_state(&DVector::from_vec(vec![0.5 * PI, 0.0]))
            .unwrap();
        let p = c.kinematics_pos(tip, None).unwrap().0;
        assert_abs_diff_eq!(p.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.y, 2.0, epsilon = 1e-12);

        c.set_joint_state(&DVector::from_vec(vec![0.0, 0.0])).unwrap();
        let jac = c
            .kinematics_pos(tip, None)
            .unwrap()
            .1
            .to_dense()
            .unwrap();
        // rotating the full lever about z vs. only the distal link
        assert_abs_diff_eq!(jac[(0, 0)], 0.0, epsilon = TOL);
        assert_abs_diff_eq!(jac[(1, 0)], 2.0, epsilon = TOL);
        assert_abs_diff_eq!(jac[(0, 1)], 0.0, epsilon = TOL);
        assert_abs_diff_eq!(jac[(1, 1)], 1.0, epsilon = TOL);
        c.check_consistency().unwrap();
    }

    #[test]
    fn test_jacobian_finite_difference_per_type() {
        let cases: Vec<Vec<JointType>> = vec![
            vec![JointType::HingeX],
            vec![JointType::HingeY],
            vec![JointType::HingeZ, JointType::HingeZ],
            vec![JointType::TransX],
            vec![JointType::TransY, JointType::HingeZ],
            vec![JointType::TransZ],
            vec![JointType::TransXY],
            vec![JointType::Trans3, JointType::HingeX],
            vec![JointType::TransXYPhi],
            vec![JointType::PhiTransXY],
            vec![JointType::QuatBall],
            vec![JointType::XBall],
            vec![JointType::Free, JointType::HingeY],
            vec![JointType::Generic("xc".to_string())],
            vec![JointType::Generic("Yb".to_string())],
            vec![JointType::Generic("w".to_string())],
        ];
        for types in cases {
            let (mut c, tip) = build_chain(&types);
            let q = nudged_state(&mut c);
            c.set_joint_state(&q).unwrap();
            fd_check_pos(&mut c, tip, Some(Vector3::new(0.2, -0.3, 0.1)));
            // re-deriving coordinates normalizes the quaternion blocks
            c.calc_dofs_from_config().unwrap();
            c.check_consistency().unwrap();
        }
    }

    #[test]
    fn test_round_trip_per_type() {
        let cases: Vec<Vec<JointType>> = vec![
            vec![JointType::HingeZ],
            vec![JointType::TransX],
            vec![JointType::TransXYPhi],
            vec![JointType::PhiTransXY],
            vec![JointType::QuatBall],
            vec![JointType::Free],
            vec![JointType::Generic("zc".to_string())],
            vec![JointType::Rigid, JointType::HingeY],
        ];
        for types in cases {
            let (mut c, _) = build_chain(&types);
            let mut q = c.get_joint_state().unwrap().clone();
            for i in 0..q.len() {
                q[i] += 0.05 * (i as f64 + 1.0).cos();
            }
            // one sync pass brings quaternion blocks to unit norm; from a
            // valid vector the round trip must be exact
            c.set_joint_state(&q).unwrap();
            c.calc_dofs_from_config().unwrap();
            let q_valid = c.get_joint_state().unwrap().clone();
            c.set_joint_state(&q_valid).unwrap();
            c.calc_dofs_from_config().unwrap();
            let q_read = c.get_joint_state().unwrap().clone();
            for i in 0..q_valid.len() {
                assert_abs_diff_eq!(q_read[i], q_valid[i], epsilon = 1e-6);
            }
            c.check_consistency().unwrap();
        }
    }

    #[test]
    fn test_mimic_joint_scenario() {
        let mut c = Configuration::new();
        let base = c.add_frame("base");
        let j1 = c.add_frame_with_parent("j1", base);
        c.set_joint(j1, Joint::new(JointType::HingeZ).unwrap());
        let j2 = c.add_frame_with_parent("j2", base);
        c.set_joint(j2, Joint::new(JointType::HingeZ).unwrap());
        c.set_mimic(DofId::Joint(j2), DofId::Joint(j1)).unwrap();

        assert_eq!(c.get_joint_state_dimension().unwrap(), 1);
        c.set_joint_state(&DVector::from_vec(vec![0.3])).unwrap();
        c.calc_dofs_from_config().unwrap();
        assert_abs_diff_eq!(c.get_joint_state().unwrap()[0], 0.3, epsilon = TOL);

        // both frames carry the identical relative rotation
        let a1 = c.frame(j1).rel.rot.angle_about(Vector3::z());
        let a2 = c.frame(j2).rel.rot.angle_about(Vector3::z());
        assert_abs_diff_eq!(a1, 0.3, epsilon = TOL);
        assert_abs_diff_eq!(a2, 0.3, epsilon = TOL);
        c.check_consistency().unwrap();
    }

    #[test]
    fn test_mimic_jacobian_accumulates_into_shared_column() {
        // serial chain where the distal hinge mimics the proximal one
        let mut c = Configuration::new();
        let base = c.add_frame("base");
        let j1 = c.add_frame_with_parent("j1", base);
        c.set_joint(j1, Joint::new(JointType::HingeZ).unwrap());
        let j2 = c.add_frame_with_parent("j2", j1);
        c.set_rel(j2, Transform::from_position(1.0, 0.0, 0.0));
        c.set_joint(j2, Joint::new(JointType::HingeZ).unwrap());
        let tip = c.add_frame_with_parent("tip", j2);
        c.set_rel(tip, Transform::from_position(1.0, 0.0, 0.0));
        c.set_mimic(DofId::Joint(j2), DofId::Joint(j1)).unwrap();

        c.set_joint_state(&DVector::from_vec(vec![0.0])).unwrap();
        let jac = c
            .kinematics_pos(tip, None)
            .unwrap()
            .1
            .to_dense()
            .unwrap();
        // both joints rotate together: lever 2 about the root plus lever
        // 1 about the elbow
        assert_abs_diff_eq!(jac[(1, 0)], 3.0, epsilon = TOL);
        fd_check_pos(&mut c, tip, None);
    }

    #[test]
    fn test_kinematics_vec_finite_difference() {
        let (mut c, tip) = build_chain(&[JointType::QuatBall, JointType::HingeY]);
        let q = nudged_state(&mut c);
        c.set_joint_state(&q).unwrap();
        let v_local = Vector3::new(0.0, 0.0, 1.0);
        let jac = c
            .kinematics_vec(tip, v_local)
            .unwrap()
            .1
            .to_dense()
            .unwrap();
        let eps = 1e-6;
        for i in 0..q.len() {
            let mut qp = q.clone();
            qp[i] += eps;
            let mut qm = q.clone();
            qm[i] -= eps;
            c.set_joint_state(&qp).unwrap();
            let yp = c.kinematics_vec(tip, v_local).unwrap().0;
            c.set_joint_state(&qm).unwrap();
            let ym = c.kinematics_vec(tip, v_local).unwrap().0;
            let fd = (yp - ym) / (2.0 * eps);
            for r in 0..3 {
                assert_abs_diff_eq!(jac[(r, i)], fd[r], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_kinematics_quat_finite_difference() {
        let (mut c, tip) = build_chain(&[JointType::HingeZ, JointType::HingeX]);
        let q = DVector::from_vec(vec![0.4, -0.8]);
        c.set_joint_state(&q).unwrap();
        let (rot, jac) = c.kinematics_quat(tip).unwrap();
        let jac = jac.to_dense().unwrap();
        assert_abs_diff_eq!(rot.norm(), 1.0, epsilon = TOL);
        let eps = 1e-6;
        for i in 0..q.len() {
            let mut qp = q.clone();
            qp[i] += eps;
            let mut qm = q.clone();
            qm[i] -= eps;
            c.set_joint_state(&qp).unwrap();
            let rp = c.kinematics_quat(tip).unwrap().0;
            c.set_joint_state(&qm).unwrap();
            let rm = c.kinematics_quat(tip).unwrap().0;
            let fd = [
                (rp.x - rm.x) / (2.0 * eps),
                (rp.y - rm.y) / (2.0 * eps),
                (rp.z - rm.z) / (2.0 * eps),
                (rp.w - rm.w) / (2.0 * eps),
            ];
            for r in 0..4 {
                assert_abs_diff_eq!(jac[(r, i)], fd[r], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_kinematics_mat_matches_axes() {
        let (mut c, tip) = build_chain(&[JointType::HingeZ]);
        c.set_joint_state(&DVector::from_vec(vec![0.5 * PI])).unwrap();
        let (y, jac) = c.kinematics_mat(tip).unwrap();
        assert_eq!(y.len(), 9);
        // first block is the rotated x axis
        assert_abs_diff_eq!(y[0], 0.0, epsilon = TOL);
        assert_abs_diff_eq!(y[1], 1.0, epsilon = TOL);
        let jac = jac.to_dense().unwrap();
        assert_eq!(jac.nrows(), 9);
        // d(axis_x)/dq = z x axis_x = (-1, 0, 0)
        assert_abs_diff_eq!(jac[(0, 0)], -1.0, epsilon = TOL);
        assert_abs_diff_eq!(jac[(1, 0)], 0.0, epsilon = TOL);
    }

    #[test]
    fn test_angular_jacobian_is_hinge_axis() {
        let (mut c, tip) = build_chain(&[JointType::HingeY]);
        c.set_joint_state(&DVector::from_vec(vec![0.3])).unwrap();
        let jac = c.jacobian_angular(tip).unwrap().to_dense().unwrap();
        assert_abs_diff_eq!(jac[(0, 0)], 0.0, epsilon = TOL);
        assert_abs_diff_eq!(jac[(1, 0)], 1.0, epsilon = TOL);
        assert_abs_diff_eq!(jac[(2, 0)], 0.0, epsilon = TOL);
    }

    #[test]
    fn test_jacobian_modes_agree() {
        let (mut c, tip) = build_chain(&[JointType::Free, JointType::HingeZ]);
        let q = nudged_state(&mut c);
        c.set_joint_state(&q).unwrap();
        c.jacobian_mode = JacobianMode::Dense;
        let dense = c
            .kinematics_pos(tip, None)
            .unwrap()
            .1
            .to_dense()
            .unwrap();
        c.jacobian_mode = JacobianMode::Sparse;
        let (_, sparse) = c.kinematics_pos(tip, None).unwrap();
        assert_eq!(sparse.mode(), JacobianMode::Sparse);
        assert_eq!(sparse.to_dense().unwrap(), dense);
        c.jacobian_mode = JacobianMode::RowShifted;
        let (_, banded) = c.kinematics_pos(tip, None).unwrap();
        assert_eq!(banded.mode(), JacobianMode::RowShifted);
        assert_eq!(banded.to_dense().unwrap(), dense);
        c.jacobian_mode = JacobianMode::NoJacobian;
        let (y, none) = c.kinematics_pos(tip, None).unwrap();
        assert!(none.to_dense().is_none());
        assert!(y.x.is_finite());
    }

    #[test]
    fn test_forward_kinematics_idempotent() {
        let (mut c, tip) = build_chain(&[JointType::HingeZ, JointType::TransX]);
        c.set_joint_state(&DVector::from_vec(vec![0.7, 0.2])).unwrap();
        let x1 = c.ensure_x(tip);
        let x2 = c.ensure_x(tip);
        assert_eq!(x1.pos, x2.pos);
        assert_eq!(x1.rot.w, x2.rot.w);
        assert!(c.frame(tip).pose().is_some());
        let p1 = c.kinematics_pos(tip, None).unwrap().0;
        let p2 = c.kinematics_pos(tip, None).unwrap().0;
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_cache_coherence_after_partial_invalidation() {
        let (mut c, tip) = build_chain(&[JointType::HingeZ, JointType::HingeY]);
        c.set_joint_state(&DVector::from_vec(vec![0.3, -0.4])).unwrap();
        c.ensure_x(tip);
        c.check_consistency().unwrap();
        // write a new state; caches go stale, then recover lazily
        c.set_joint_state(&DVector::from_vec(vec![0.5, 0.1])).unwrap();
        assert!(c.frame(tip).pose().is_none());
        c.ensure_x(tip);
        c.check_consistency().unwrap();
    }

    #[test]
    fn test_kinematics_tau() {
        let mut c = Configuration::new();
        let base = c.add_frame("base");
        c.add_tau_joint().unwrap();
        let f = c.add_frame_with_parent("body", base);
        c.set_joint(f, Joint::new(JointType::HingeZ).unwrap());
        c.set_joint_state(&DVector::from_vec(vec![0.25, 1.0])).unwrap();
        let (tau, jac) = c.kinematics_tau(f).unwrap();
        // the tau coordinate precedes the hinge in frame order
        assert_abs_diff_eq!(tau, 0.25, epsilon = TOL);
        let jac = jac.to_dense().unwrap();
        assert_abs_diff_eq!(jac[(0, 0)], 1.0, epsilon = TOL);
        assert_abs_diff_eq!(jac[(0, 1)], 0.0, epsilon = TOL);
    }

    #[test]
    fn test_force_exchange_queries() {
        let mut c = Configuration::new();
        let base = c.add_frame("base");
        let a = c.add_frame_with_parent("a", base);
        c.set_joint(a, Joint::new(JointType::HingeZ).unwrap());
        let b = c.add_frame_with_parent("b", base);
        let k = c
            .add_force_exchange(a, b, ForceExchangeType::ForceTorque)
            .unwrap();

        // hinge(1) + exchange(9)
        assert_eq!(c.get_joint_state_dimension().unwrap(), 10);
        let mut q = DVector::zeros(10);
        q[0] = 0.2;
        for i in 0..9 {
            q[1 + i] = 0.1 * (i + 1) as f64;
        }
        c.set_joint_state(&q).unwrap();

        let (poa, jac) = c.kin_poa(k).unwrap();
        assert_abs_diff_eq!(poa.x, 0.1, epsilon = TOL);
        let jac = jac.to_dense().unwrap();
        assert_abs_diff_eq!(jac[(0, 1)], 1.0, epsilon = TOL);
        assert_abs_diff_eq!(jac[(1, 2)], 1.0, epsilon = TOL);
        assert_abs_diff_eq!(jac[(0, 0)], 0.0, epsilon = TOL);

        let (force, jac) = c.kin_force(k).unwrap();
        assert_abs_diff_eq!(force.x, 0.4, epsilon = TOL);
        let jac = jac.to_dense().unwrap();
        assert_abs_diff_eq!(jac[(0, 4)], 1.0, epsilon = TOL);

        let (torque, jac) = c.kin_torque(k).unwrap();
        assert_abs_diff_eq!(torque.z, 0.9, epsilon = TOL);
        let jac = jac.to_dense().unwrap();
        assert_abs_diff_eq!(jac[(2, 9)], 1.0, epsilon = TOL);
        c.check_consistency().unwrap();
    }

    #[test]
    fn test_kinematics_zero() {
        let (mut c, _) = build_chain(&[JointType::HingeZ]);
        let (y, jac) = c.kinematics_zero(4).unwrap();
        assert_eq!(y.len(), 4);
        let jac = jac.to_dense().unwrap();
        assert_eq!(jac.nrows(), 4);
        assert_eq!(jac.ncols(), 1);
        assert_eq!(jac[(0, 0)], 0.0);
    }
}
