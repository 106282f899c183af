use crate::{
    configuration::Configuration,
    frame::{FrameId, ShapeType},
    joint::JointType,
    scene::{SceneErrors, ShapeDescription},
    KinematicsErrors,
};
use rotations::euler_angles::EulerAngles;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use transforms::Transform;

/// One node of the generic scene-exchange graph: the frame tree with
/// per-node transform and optional shape/mass metadata. Mesh payloads are
/// not embedded; the shape description carries the parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneGraphNode {
    pub name: String,
    /// pose relative to the parent node, `[px, py, pz, qx, qy, qz, qw]`
    pub transform: [f64; 7],
    pub shape: Option<ShapeDescription>,
    pub mass: Option<f64>,
    pub children: Vec<SceneGraphNode>,
}

fn geometry_markup(out: &mut String, shape: &crate::frame::Shape) {
    out.push_str("    <geometry>\n");
    match shape.shape_type {
        ShapeType::Box => {
            let s = &shape.size;
            let _ = writeln!(
                out,
                "      <box size=\"{} {} {}\" />",
                s.first().copied().unwrap_or(0.0),
                s.get(1).copied().unwrap_or(0.0),
                s.get(2).copied().unwrap_or(0.0)
            );
        }
        ShapeType::Cylinder | ShapeType::Capsule => {
            let n = shape.size.len();
            let _ = writeln!(
                out,
                "      <cylinder length=\"{}\" radius=\"{}\" />",
                shape.size.get(n.wrapping_sub(2)).copied().unwrap_or(0.0),
                shape.size.last().copied().unwrap_or(0.0)
            );
        }
        ShapeType::Sphere => {
            let _ = writeln!(
                out,
                "      <sphere radius=\"{}\" />",
                shape.size.last().copied().unwrap_or(0.0)
            );
        }
        ShapeType::Marker | ShapeType::Mesh => {
            out.push_str("      <!-- geometry omitted -->\n");
        }
    }
    if let Some(c) = shape.color {
        let _ = writeln!(
            out,
            "      <material> <color rgba=\"{} {} {} {}\" /> </material>",
            c[0], c[1], c[2], c[3]
        );
    }
    out.push_str("    </geometry>\n");
}

fn origin_markup(out: &mut String, q: &Transform) {
    let rpy = EulerAngles::from(&q.rot);
    let _ = writeln!(
        out,
        "  <origin xyz=\"{} {} {}\" rpy=\"{} {} {}\" />",
        q.pos.x, q.pos.y, q.pos.z, rpy.roll, rpy.pitch, rpy.yaw
    );
}

fn urdf_joint_type(t: &JointType) -> (&'static str, Option<[f64; 3]>) {
    match t {
        JointType::HingeX => ("revolute", Some([1.0, 0.0, 0.0])),
        JointType::HingeY => ("revolute", Some([0.0, 1.0, 0.0])),
        JointType::HingeZ => ("revolute", Some([0.0, 0.0, 1.0])),
        JointType::TransX => ("prismatic", Some([1.0, 0.0, 0.0])),
        JointType::TransY => ("prismatic", Some([0.0, 1.0, 0.0])),
        JointType::TransZ => ("prismatic", Some([0.0, 0.0, 1.0])),
        JointType::TransXY | JointType::TransXYPhi | JointType::PhiTransXY => ("planar", None),
        JointType::Free => ("floating", None),
        _ => ("fixed", None),
    }
}

impl Configuration {
    /// Frames rigidly attached at or below `id`, not crossing joints.
    fn rigid_sub_frames(&self, id: FrameId) -> Vec<FrameId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            for &c in &self.frame(out[i]).children {
                if self.frame(c).joint.is_none() {
                    out.push(c);
                }
            }
            i += 1;
        }
        out
    }

    /// Writes a robot-description markup document: one link per jointed
    /// frame (visuals collected from its rigid sub-frames), a base link
    /// for everything above the first joints, and one joint element per
    /// link with the accumulated fixed offset as its origin.
    pub fn write_urdf(&self, robot_name: &str) -> Result<String, KinematicsErrors> {
        let ids: Vec<FrameId> = self.frames().iter().map(|f| f.id).collect();
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\"?>\n");
        let _ = writeln!(out, "<robot name=\"{robot_name}\">");

        let mut base_frames = Vec::new();
        for &r in &self.get_roots() {
            base_frames.extend(self.rigid_sub_frames(r));
        }
        out.push_str("<link name=\"base_link\">\n");
        for &id in &base_frames {
            if let Some(shape) = &self.frame(id).shape {
                if shape.shape_type != ShapeType::Marker {
                    out.push_str("  <visual>\n");
                    geometry_markup(&mut out, shape);
                    out.push_str("  </visual>\n");
                }
            }
        }
        out.push_str("</link>\n");

        for &id in &ids {
            if self.frame(id).joint.is_none() {
                continue;
            }
            let name = self.frame(id).name.clone();
            let _ = writeln!(out, "<link name=\"{name}\">");
            for &sub in &self.rigid_sub_frames(id) {
                if let Some(shape) = &self.frame(sub).shape {
                    if shape.shape_type != ShapeType::Marker {
                        out.push_str("  <visual>\n");
                        geometry_markup(&mut out, shape);
                        if sub != id {
                            origin_markup(&mut out, &self.frame(sub).rel);
                        }
                        if let Some(inertia) = &self.frame(sub).inertia {
                            let _ = writeln!(
                                out,
                                "  <inertial> <mass value=\"{}\"/> </inertial>",
                                inertia.mass
                            );
                        }
                        out.push_str("  </visual>\n");
                    }
                }
            }
            out.push_str("</link>\n");

            // accumulate the fixed offset through joint-less ancestors
            let mut q = Transform::IDENTITY;
            let mut p = self.frame(id).parent;
            while let Some(pid) = p {
                if self.frame(pid).joint.is_some() {
                    break;
                }
                q = self.frame(pid).rel * q;
                p = self.frame(pid).parent;
            }
            let joint = self.frame(id).joint.as_ref().expect("checked above");
            let (typ, axis) = urdf_joint_type(&joint.joint_type);
            let limit = joint.dof.limit(0);
            let _ = writeln!(out, "<joint name=\"{name}\" type=\"{typ}\">");
            match p {
                Some(pid) => {
                    let _ = writeln!(out, "  <parent link=\"{}\"/>", self.frame(pid).name);
                }
                None => out.push_str("  <parent link=\"base_link\"/>\n"),
            }
            let _ = writeln!(out, "  <child  link=\"{name}\"/>");
            origin_markup(&mut out, &q);
            if let Some(a) = axis {
                let _ = writeln!(out, "  <axis xyz=\"{} {} {}\" />", a[0], a[1], a[2]);
            }
            if let Some((lo, hi)) = limit {
                let _ = writeln!(out, "  <limit lower=\"{lo}\" upper=\"{hi}\" />");
            }
            out.push_str("</joint>\n");
        }
        out.push_str("</robot>\n");
        Ok(out)
    }

    fn scene_graph_node(&self, id: FrameId) -> SceneGraphNode {
        let f = self.frame(id);
        let transform = match f.parent {
            Some(_) => f.rel.to_7d(),
            None => f.pose().map(|x| x.to_7d()).unwrap_or(f.rel.to_7d()),
        };
        SceneGraphNode {
            name: f.name.clone(),
            transform,
            shape: f.shape.as_ref().map(|s| ShapeDescription {
                shape_type: s.shape_type,
                size: s.size.clone(),
                color: s.color,
                contact: s.contact,
            }),
            mass: f.inertia.as_ref().map(|i| i.mass),
            children: f
                .children
                .iter()
                .map(|&c| self.scene_graph_node(c))
                .collect(),
        }
    }

    /// The frame tree as a generic scene-exchange graph, one tree per
    /// root.
    pub fn to_scene_graph(&self) -> Vec<SceneGraphNode> {
        self.get_roots()
            .iter()
            .map(|&r| self.scene_graph_node(r))
            .collect()
    }

    pub fn write_scene_graph(&self) -> Result<String, KinematicsErrors> {
        let graph = self.to_scene_graph();
        Ok(
            ron::ser::to_string_pretty(&graph, ron::ser::PrettyConfig::default())
                .map_err(SceneErrors::from)?,
        )
    }
}
