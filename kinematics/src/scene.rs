use crate::{
    configuration::Configuration,
    dof::DofId,
    frame::{Inertia, Shape, ShapeType},
    joint::{Joint, JointType},
    KinematicsErrors,
};
use nalgebra::{DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use thiserror::Error;
use transforms::Transform;

#[derive(Debug, Error)]
pub enum SceneErrors {
    #[error("duplicate frame name '{0}'")]
    DuplicateName(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("joint on '{frame}' declares unknown mimic target '{target}'")]
    MimicTargetNotFound { frame: String, target: String },
    #[error("frame '{frame}' declares unknown parent '{parent}' (parents must be declared first)")]
    ParentNotFound { frame: String, parent: String },
    #[error("{0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("{0}")]
    Serialize(#[from] ron::Error),
}

fn default_scale() -> f64 {
    1.0
}

fn default_h() -> f64 {
    1.0
}

fn default_sdv() -> f64 {
    0.01
}

/// Joint attribute block of a scene node. A `pre` offset expresses the
/// two-frame construct: a fixed transform inserted before the joint axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointDescription {
    pub joint_type: JointType,
    #[serde(default)]
    pub limits: Vec<(f64, f64)>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_h")]
    pub h: f64,
    #[serde(default)]
    pub q0: Option<Vec<f64>>,
    /// mimic target, by frame name
    #[serde(default)]
    pub mimic: Option<String>,
    #[serde(default)]
    pub pre: Option<[f64; 7]>,
    #[serde(default)]
    pub sample_uniform: f64,
    #[serde(default = "default_sdv")]
    pub sample_sdv: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeDescription {
    pub shape_type: ShapeType,
    #[serde(default)]
    pub size: Vec<f64>,
    #[serde(default)]
    pub color: Option<[f64; 4]>,
    #[serde(default)]
    pub contact: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InertiaDescription {
    pub mass: f64,
    #[serde(default)]
    pub com: [f64; 3],
    /// principal moments; the full matrix is diagonal in this format
    #[serde(default)]
    pub diag: [f64; 3],
}

/// One node of the attributed scene graph: a frame with its parent edge
/// and attribute blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameDescription {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// relative pose `[px, py, pz, qx, qy, qz, qw]` (absolute for roots)
    #[serde(default)]
    pub pose: Option<[f64; 7]>,
    #[serde(default)]
    pub joint: Option<JointDescription>,
    #[serde(default)]
    pub shape: Option<ShapeDescription>,
    #[serde(default)]
    pub inertia: Option<InertiaDescription>,
}

/// The persisted scene format: an ordered list of frame nodes, parents
/// declared before their children.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneDescription {
    pub frames: Vec<FrameDescription>,
}

impl SceneDescription {
    pub fn from_ron(s: &str) -> Result<Self, SceneErrors> {
        Ok(ron::from_str(s)?)
    }

    pub fn to_ron(&self) -> Result<String, SceneErrors> {
        Ok(ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::default(),
        )?)
    }

    pub fn load(path: &Path) -> Result<Self, SceneErrors> {
        Self::from_ron(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SceneErrors> {
        fs::write(path, self.to_ron()?)?;
        Ok(())
    }
}

impl Configuration {
    /// Builds a configuration from a scene description. Parents resolve
    /// in declaration order; mimic targets resolve after all frames
    /// exist; a joint's `pre` offset inserts an explicit origin frame.
    pub fn from_scene(desc: &SceneDescription) -> Result<Self, KinematicsErrors> {
        let mut c = Configuration::new();
        let mut mimic_links = Vec::new();
        for node in &desc.frames {
            if c.get_frame(&node.name, false).is_some() {
                return Err(SceneErrors::DuplicateName(node.name.clone()).into());
            }
            let parent = match &node.parent {
                Some(p) => Some(c.get_frame(p, false).ok_or_else(|| {
                    SceneErrors::ParentNotFound {
                        frame: node.name.clone(),
                        parent: p.clone(),
                    }
                })?),
                None => None,
            };
            let mut attach_parent = parent;
            if let (Some(jd), Some(p)) = (&node.joint, parent) {
                if let Some(pre) = &jd.pre {
                    let origin = c.add_frame_with_parent(&format!("{}_origin", node.name), p);
                    c.set_rel(origin, Transform::from_7d(pre));
                    attach_parent = Some(origin);
                }
            }
            let id = match attach_parent {
                Some(p) => c.add_frame_with_parent(&node.name, p),
                None => c.add_frame(&node.name),
            };
            if let Some(pose) = &node.pose {
                c.set_rel(id, Transform::from_7d(pose));
            }
            if let Some(jd) = &node.joint {
                let mut joint = Joint::new(jd.joint_type.clone())?
                    .with_scale(jd.scale)
                    .with_limits(jd.limits.clone());
                joint.h = jd.h;
                joint.dof.sample_uniform = jd.sample_uniform;
                joint.dof.sample_sdv = jd.sample_sdv;
                if let Some(q0) = &jd.q0 {
                    joint.dof.q0 = Some(DVector::from_vec(q0.clone()));
                }
                c.set_joint(id, joint);
                if let Some(target) = &jd.mimic {
                    mimic_links.push((id, node.name.clone(), target.clone()));
                }
            }
            if let Some(sd) = &node.shape {
                let mut shape = Shape::new(sd.shape_type, sd.size.clone());
                shape.color = sd.color;
                shape.contact = sd.contact;
                c.set_shape(id, shape);
            }
            if let Some(ind) = &node.inertia {
                c.set_inertia(
                    id,
                    Inertia {
                        mass: ind.mass,
                        com: Vector3::from(ind.com),
                        matrix: Matrix3::from_diagonal(&Vector3::from(ind.diag)),
                    },
                );
            }
        }
        for (id, frame, target) in mimic_links {
            let t = c
                .get_frame(&target, false)
                .ok_or(SceneErrors::MimicTargetNotFound { frame, target: target.clone() })?;
            let t = c.get_upward_link(t);
            if c.frame(t).joint.is_none() {
                return Err(KinematicsErrors::FrameHasNoJoint(target));
            }
            c.set_mimic(DofId::Joint(id), DofId::Joint(t))?;
        }
        Ok(c)
    }

    /// Serializes the configuration back into the scene format, in
    /// topological order so that the result reloads.
    pub fn to_scene(&self) -> Result<SceneDescription, KinematicsErrors> {
        let order = self.calc_top_sort()?;
        let mut frames = Vec::with_capacity(order.len());
        for id in order {
            let f = self.frame(id);
            let pose = match f.parent {
                Some(_) => {
                    if f.rel.is_zero(1e-12) {
                        None
                    } else {
                        Some(f.rel.to_7d())
                    }
                }
                // roots carry their pose absolutely
                None => f.pose().map(|x| x.to_7d()),
            };
            let joint = f.joint.as_ref().map(|j| JointDescription {
                joint_type: j.joint_type.clone(),
                limits: j.dof.limits.clone(),
                scale: j.dof.scale,
                h: j.h,
                q0: j.dof.q0.as_ref().map(|v| v.iter().copied().collect()),
                mimic: j.dof.mimic.and_then(|m| match m {
                    DofId::Joint(t) => Some(self.frame(t).name.clone()),
                    DofId::Force(_) => None,
                }),
                pre: None,
                sample_uniform: j.dof.sample_uniform,
                sample_sdv: j.dof.sample_sdv,
            });
            let shape = f.shape.as_ref().map(|s| ShapeDescription {
                shape_type: s.shape_type,
                size: s.size.clone(),
                color: s.color,
                contact: s.contact,
            });
            let inertia = f.inertia.as_ref().map(|i| InertiaDescription {
                mass: i.mass,
                com: [i.com.x, i.com.y, i.com.z],
                diag: [i.matrix[(0, 0)], i.matrix[(1, 1)], i.matrix[(2, 2)]],
            });
            frames.push(FrameDescription {
                name: f.name.clone(),
                parent: f.parent.map(|p| self.frame(p).name.clone()),
                pose,
                joint,
                shape,
                inertia,
            });
        }
        Ok(SceneDescription { frames })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::DVector;
    const TOL: f64 = 1e-12;

    const ARM: &str = r#"(
        frames: [
            (name: "base", shape: Some((shape_type: Box, size: [0.2, 0.2, 0.1]))),
            (
                name: "arm",
                parent: Some("base"),
                joint: Some((
                    joint_type: HingeZ,
                    limits: [(-1.5, 1.5)],
                    pre: Some([0.0, 0.0, 0.5, 0.0, 0.0, 0.0, 1.0]),
                )),
                inertia: Some((mass: 2.0, com: [0.0, 0.0, 0.25])),
            ),
            (
                name: "coupler",
                parent: Some("base"),
                joint: Some((joint_type: HingeZ, mimic: Some("arm"))),
            ),
        ],
    )"#;

    #[test]
    fn test_load_with_two_frame_construct_and_mimic() {
        let desc = SceneDescription::from_ron(ARM).unwrap();
        let mut c = Configuration::from_scene(&desc).unwrap();
        // the pre offset became an explicit origin frame
        assert_eq!(c.n_frames(), 4);
        let origin = c.get_frame("arm_origin", false).unwrap();
        assert_abs_diff_eq!(c.frame(origin).rel.pos.z, 0.5, epsilon = TOL);

        // mimic shares the single coordinate
        assert_eq!(c.get_joint_state_dimension().unwrap(), 1);
        c.set_joint_state(&DVector::from_vec(vec![0.4])).unwrap();
        let arm = c.get_frame("arm", false).unwrap();
        let coupler = c.get_frame("coupler", false).unwrap();
        let a1 = c.frame(arm).rel.rot.angle_about(nalgebra::Vector3::z());
        let a2 = c.frame(coupler).rel.rot.angle_about(nalgebra::Vector3::z());
        assert_abs_diff_eq!(a1, 0.4, epsilon = TOL);
        assert_abs_diff_eq!(a2, 0.4, epsilon = TOL);

        let lim = c.get_limits().unwrap();
        assert_abs_diff_eq!(lim[(0, 1)], 1.5, epsilon = TOL);
        assert_abs_diff_eq!(c.frame(arm).inertia.as_ref().unwrap().mass, 2.0, epsilon = TOL);
        c.check_consistency().unwrap();
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let bad = r#"(frames: [(name: "a", parent: Some("nosuch"))])"#;
        let desc = SceneDescription::from_ron(bad).unwrap();
        assert!(matches!(
            Configuration::from_scene(&desc),
            Err(KinematicsErrors::Scene(SceneErrors::ParentNotFound { .. }))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let bad = r#"(frames: [(name: "a"), (name: "a")])"#;
        let desc = SceneDescription::from_ron(bad).unwrap();
        assert!(matches!(
            Configuration::from_scene(&desc),
            Err(KinematicsErrors::Scene(SceneErrors::DuplicateName(_)))
        ));
    }

    #[test]
    fn test_unknown_mimic_target_rejected() {
        let bad = r#"(frames: [
            (name: "base"),
            (name: "a", parent: Some("base"), joint: Some((joint_type: HingeZ, mimic: Some("ghost")))),
        ])"#;
        let desc = SceneDescription::from_ron(bad).unwrap();
        assert!(matches!(
            Configuration::from_scene(&desc),
            Err(KinematicsErrors::Scene(SceneErrors::MimicTargetNotFound { .. }))
        ));
    }

    #[test]
    fn test_round_trip_through_ron() {
        let desc = SceneDescription::from_ron(ARM).unwrap();
        let mut c = Configuration::from_scene(&desc).unwrap();
        let n = c.get_joint_state_dimension().unwrap();

        let text = c.to_scene().unwrap().to_ron().unwrap();
        let mut c2 = Configuration::from_scene(&SceneDescription::from_ron(&text).unwrap()).unwrap();
        assert_eq!(c2.n_frames(), c.n_frames());
        assert_eq!(c2.get_joint_state_dimension().unwrap(), n);
        c2.check_consistency().unwrap();
    }
}
