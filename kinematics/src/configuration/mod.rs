mod queries;

use crate::{
    dof::{Dof, DofId},
    force_exchange::{ForceExchange, ForceExchangeType},
    frame::{Frame, FrameId, Inertia, Shape},
    jacobian::JacobianMode,
    joint::{Joint, JointType},
    proxy::Proxy,
    KinematicsErrors,
};
use nalgebra::{DMatrix, DVector};
use rand::{rngs::SmallRng, Rng};
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use thiserror::Error;
use transforms::Transform;

/// Agreement tolerance between coordinates and transforms.
pub const CONSISTENCY_TOL: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ConsistencyErrors {
    #[error("frame tree contains a cycle")]
    Cyclic,
    #[error("coordinates and relative transform disagree for '{frame}' scalar {index}: {q} vs {expected}")]
    DofStateMismatch {
        frame: String,
        index: usize,
        q: f64,
        expected: f64,
    },
    #[error("force exchange {0} attachment lists are inconsistent")]
    ForceAttachmentInvalid(usize),
    #[error("frame ids are not consistent with storage order")]
    IdOutOfOrder,
    #[error("dof indexing is not contiguous at '{0}' (q_index {1}, expected {2})")]
    IndexNotContiguous(String, usize, usize),
    #[error("joint on '{0}' has dim {1}, its type requires {2}")]
    JointDimMismatch(String, usize, usize),
    #[error("mimic relationship of dof on '{0}' is not symmetric")]
    MimicAsymmetry(String),
    #[error("mimicking dof on '{0}' disagrees with its target in dim, activation, or index")]
    MimicMismatch(String),
    #[error("cached pose of '{0}' is marked valid while its parent's is not")]
    ParentPoseInvalid(String),
    #[error("proxy references an invalid frame")]
    ProxyFrameInvalid,
    #[error("parent-less frame '{0}' must have zero relative transform and a valid pose")]
    RootStateInvalid(String),
    #[error("rotation of '{0}' is not normalized")]
    RotationNotNormalized(String),
    #[error("cached pose of '{0}' is marked valid but disagrees with parent composition")]
    StalePoseMarkedValid(String),
    #[error("parent/child links are asymmetric at '{0}'")]
    TreeAsymmetry(String),
    #[error("coordinate vector has dimension {got}, expected {expected}")]
    VectorDimension { got: usize, expected: usize },
}

/// The kinematic configuration: owner of all frames, force exchanges,
/// the coordinate vectors, and the cached-state flags.
///
/// All cross-references (parent/child, mimic, exchange pairs) are arena
/// indices, so `Clone` is a deep copy and cloned configurations evolve
/// independently.
#[derive(Debug, Clone)]
pub struct Configuration {
    frames: Vec<Frame>,
    forces: Vec<ForceExchange>,
    q: DVector<f64>,
    q_inactive: DVector<f64>,
    active_dofs: Vec<DofId>,
    proxies: Vec<Proxy>,
    /// output representation for every Jacobian-producing call
    pub jacobian_mode: JacobianMode,
    indexed_dofs_good: bool,
    q_good: bool,
    proxies_good: bool,
    version: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            forces: Vec::new(),
            q: DVector::zeros(0),
            q_inactive: DVector::zeros(0),
            active_dofs: Vec::new(),
            proxies: Vec::new(),
            jacobian_mode: JacobianMode::Dense,
            indexed_dofs_good: false,
            q_good: false,
            proxies_good: false,
            version: 0,
        }
    }

    //-- frame construction and access ------------------------------------

    pub fn add_frame(&mut self, name: &str) -> FrameId {
        let id = FrameId(self.frames.len());
        self.frames.push(Frame::new(id, name));
        self.reset_q();
        id
    }

    pub fn add_frame_with_parent(&mut self, name: &str, parent: FrameId) -> FrameId {
        let id = self.add_frame(name);
        let f = &mut self.frames[id.0];
        f.parent = Some(parent);
        f.x_good = false;
        self.frames[parent.0].children.push(id);
        id
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id.0]
    }

    pub fn n_frames(&self) -> usize {
        self.frames.len()
    }

    /// Looks a frame up by name; with `warn_if_missing` a miss is logged
    /// and `None` returned, so callers can warn-and-continue.
    pub fn get_frame(&self, name: &str, warn_if_missing: bool) -> Option<FrameId> {
        let hit = self.frames.iter().find(|f| f.name == name).map(|f| f.id);
        if hit.is_none() && warn_if_missing {
            tracing::warn!("could not find frame '{name}'");
        }
        hit
    }

    pub fn set_joint(&mut self, id: FrameId, joint: Joint) {
        self.frames[id.0].joint = Some(joint);
        self.reset_q();
    }

    pub fn joint(&self, id: FrameId) -> Option<&Joint> {
        self.frames[id.0].joint.as_ref()
    }

    /// Mutable joint access for limits, weights, and sampling policies.
    /// Changing the joint type or dimension requires `set_joint`.
    pub fn joint_mut(&mut self, id: FrameId) -> Option<&mut Joint> {
        self.frames[id.0].joint.as_mut()
    }

    pub fn set_shape(&mut self, id: FrameId, shape: Shape) {
        self.frames[id.0].shape = Some(shape);
    }

    pub fn set_inertia(&mut self, id: FrameId, inertia: Inertia) {
        self.frames[id.0].inertia = Some(inertia);
    }

    /// Sets the relative transform directly. On a parent-less frame this
    /// sets the absolute pose instead, preserving the root invariant.
    /// Coordinates diverge until resynchronized.
    pub fn set_rel(&mut self, id: FrameId, rel: Transform) {
        self.set_x_bad_in_branch(id);
        let f = &mut self.frames[id.0];
        if f.parent.is_none() {
            f.x = rel;
            f.x_good = true;
        } else {
            f.rel = rel;
        }
        self.q_good = false;
    }

    pub fn set_taus(&mut self, tau: f64) {
        for f in &mut self.frames {
            f.tau = tau;
        }
        self.q_good = false;
    }

    /// All joint dof keys in frame storage order.
    pub fn joint_dofs(&self) -> Vec<DofId> {
        self.frames
            .iter()
            .filter(|f| f.joint.is_some())
            .map(|f| DofId::Joint(f.id))
            .collect()
    }

    //-- force exchanges --------------------------------------------------

    pub fn add_force_exchange(
        &mut self,
        a: FrameId,
        b: FrameId,
        exchange_type: ForceExchangeType,
    ) -> Result<usize, KinematicsErrors> {
        let fex = ForceExchange::new(a, b, exchange_type)?;
        let k = self.forces.len();
        self.forces.push(fex);
        self.frames[a.0].forces.push(k);
        self.frames[b.0].forces.push(k);
        self.reset_q();
        Ok(k)
    }

    pub fn force_exchanges(&self) -> &[ForceExchange] {
        &self.forces
    }

    pub fn force_exchange(&self, k: usize) -> &ForceExchange {
        &self.forces[k]
    }

    pub fn force_exchange_mut(&mut self, k: usize) -> &mut ForceExchange {
        &mut self.forces[k]
    }

    /// Exchange joining the unordered pair, if any.
    pub fn get_force_exchange(&self, a: FrameId, b: FrameId) -> Option<usize> {
        self.forces
            .iter()
            .position(|fex| (fex.a == a && fex.b == b) || (fex.a == b && fex.b == a))
    }

    /// The matched collision proxy of an exchange; cached per
    /// configuration version, recomputed whenever a pose changed.
    pub fn force_exchange_proxy(&mut self, k: usize) -> Option<&Proxy> {
        let v = self.version;
        let idx = match self.forces[k].proxy_cache {
            Some((ver, idx)) if ver == v => idx,
            _ => {
                let idx = self.forces[k].find_proxy(&self.proxies);
                self.forces[k].proxy_cache = Some((v, idx));
                idx
            }
        };
        idx.map(|i| &self.proxies[i])
    }

    /// Seeds the exchange's point of application from its matched proxy;
    /// returns false when no proxy joins the pair. Coordinates diverge
    /// until resynchronized.
    pub fn seed_force_exchange_poa(&mut self, k: usize) -> bool {
        let Some(p) = self.force_exchange_proxy(k).cloned() else {
            return false;
        };
        self.forces[k].init_from_proxy(&p);
        self.q_good = false;
        true
    }

    //-- proxies ----------------------------------------------------------

    /// Ingests a pairwise collision report from the external backend.
    pub fn add_proxies(&mut self, proxies: Vec<Proxy>) -> Result<(), KinematicsErrors> {
        let n = self.frames.len();
        if proxies.iter().any(|p| p.a.0 >= n || p.b.0 >= n) {
            return Err(ConsistencyErrors::ProxyFrameInvalid.into());
        }
        self.proxies = proxies;
        self.proxies_good = true;
        for fex in &mut self.forces {
            fex.proxy_cache = None;
        }
        Ok(())
    }

    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    /// Sum of shape penetrations over the proxy set.
    pub fn get_total_penetration(&self) -> Result<f64, KinematicsErrors> {
        if !self.proxies_good {
            return Err(KinematicsErrors::ProxiesNotComputed);
        }
        let mut total = 0.0;
        for p in &self.proxies {
            let ra = self.frames[p.a.0].shape.as_ref().map_or(0.0, |s| s.radius());
            let rb = self.frames[p.b.0].shape.as_ref().map_or(0.0, |s| s.radius());
            // cheap pre-check before trusting the narrow phase distance
            if p.d > ra + rb + 0.01 {
                continue;
            }
            if p.d < 0.0 {
                total -= p.d;
            }
        }
        Ok(total)
    }

    //-- dof access -------------------------------------------------------

    pub fn dof(&self, d: DofId) -> &Dof {
        match d {
            DofId::Joint(f) => {
                &self.frames[f.0]
                    .joint
                    .as_ref()
                    .expect("joint dof key without joint")
                    .dof
            }
            DofId::Force(k) => &self.forces[k].dof,
        }
    }

    pub(crate) fn dof_mut(&mut self, d: DofId) -> &mut Dof {
        match d {
            DofId::Joint(f) => {
                &mut self.frames[f.0]
                    .joint
                    .as_mut()
                    .expect("joint dof key without joint")
                    .dof
            }
            DofId::Force(k) => &mut self.forces[k].dof,
        }
    }

    fn dof_frame_name(&self, d: DofId) -> String {
        match d {
            DofId::Joint(f) => self.frames[f.0].name.clone(),
            DofId::Force(k) => self.forces[k].name(),
        }
    }

    pub fn active_dofs(&self) -> &[DofId] {
        &self.active_dofs
    }

    fn inactive_dofs(&self) -> Vec<DofId> {
        let mut dofs = Vec::new();
        for f in &self.frames {
            if let Some(j) = &f.joint {
                if !j.dof.active {
                    dofs.push(DofId::Joint(f.id));
                }
            }
        }
        for (k, fex) in self.forces.iter().enumerate() {
            if !fex.dof.active {
                dofs.push(DofId::Force(k));
            }
        }
        dofs
    }

    //-- mimic links ------------------------------------------------------

    /// Couples `d` to `target`: same coordinates, same activation. The
    /// mimicking dof gives up its own storage in the coordinate vector.
    pub fn set_mimic(&mut self, d: DofId, target: DofId) -> Result<(), KinematicsErrors> {
        if d == target {
            return Err(KinematicsErrors::MimicSelf);
        }
        let (dof_dim, target_dim) = (self.dof(d).dim, self.dof(target).dim);
        if dof_dim != target_dim {
            return Err(KinematicsErrors::MimicDimensionMismatch {
                dof: self.dof_frame_name(d),
                dof_dim,
                target: self.dof_frame_name(target),
                target_dim,
            });
        }
        self.clear_mimic(d);
        self.dof_mut(d).mimic = Some(target);
        self.dof_mut(target).mimicers.push(d);
        let active = self.dof(target).active;
        self.dof_mut(d).active = active;
        self.reset_q();
        Ok(())
    }

    pub fn clear_mimic(&mut self, d: DofId) {
        if let Some(t) = self.dof_mut(d).mimic.take() {
            self.dof_mut(t).mimicers.retain(|&m| m != d);
            self.reset_q();
        }
    }

    //-- activation and indexing ------------------------------------------

    /// Clears the coordinate vectors and all index assignments. Called on
    /// every structural edit.
    pub fn reset_q(&mut self) {
        self.q = DVector::zeros(0);
        self.q_inactive = DVector::zeros(0);
        self.active_dofs.clear();
        self.indexed_dofs_good = false;
        self.q_good = false;
    }

    /// Marks exactly the given dofs (plus mimic closure) active,
    /// deactivates all others, and reassigns coordinate indices. The
    /// coordinate vector is invalid afterwards until resynchronized.
    pub fn set_active_dofs(&mut self, dofs: &[DofId]) -> Result<(), KinematicsErrors> {
        for f in &mut self.frames {
            if let Some(j) = &mut f.joint {
                j.dof.active = false;
            }
        }
        for fex in &mut self.forces {
            fex.dof.active = false;
        }
        let mut list: Vec<DofId> = Vec::new();
        for &d in dofs {
            if !list.contains(&d) {
                list.push(d);
            }
            self.dof_mut(d).active = true;
        }
        // activate mimic'ed and mimicking dofs as well
        let mut coupled = Vec::new();
        for &d in &list {
            if let Some(t) = self.dof(d).mimic {
                coupled.push(t);
            }
            coupled.extend(self.dof(d).mimicers.iter().copied());
        }
        for d in coupled {
            self.dof_mut(d).active = true;
            if !list.contains(&d) {
                list.push(d);
            }
        }
        self.reset_q();
        self.active_dofs = list;
        self.assign_indices()
    }

    /// Rebuilds the default active-dof order (joints in frame order, then
    /// exchanges) and assigns indices, unless a valid assignment exists.
    pub(crate) fn ensure_indexed_dofs(&mut self) -> Result<(), KinematicsErrors> {
        if self.indexed_dofs_good {
            return Ok(());
        }
        let mut dofs = Vec::new();
        for f in &self.frames {
            if let Some(j) = &f.joint {
                if j.dof.active {
                    dofs.push(DofId::Joint(f.id));
                }
            }
        }
        for (k, fex) in self.forces.iter().enumerate() {
            if fex.dof.active {
                dofs.push(DofId::Force(k));
            }
        }
        self.active_dofs = dofs;
        self.assign_indices()
    }

    /// Index assignment over the current active order, then a symmetric
    /// pass over the inactive partition. Mimicking dofs inherit their
    /// target's index and never count toward the dimension.
    fn assign_indices(&mut self) -> Result<(), KinematicsErrors> {
        let active = self.active_dofs.clone();
        let mut count = 0;
        for &d in &active {
            if self.dof(d).mimic.is_none() {
                let dim = self.dof(d).dim;
                self.dof_mut(d).q_index = count;
                count += dim;
            }
        }
        for &d in &active {
            if let Some(t) = self.dof(d).mimic {
                if !self.dof(t).active {
                    return Err(KinematicsErrors::ActiveMimicsInactive {
                        dof: self.dof_frame_name(d),
                        target: self.dof_frame_name(t),
                    });
                }
                let qi = self.dof(t).q_index;
                self.dof_mut(d).q_index = qi;
            }
        }
        self.q = DVector::zeros(count);
        self.q_good = false;

        let inactive = self.inactive_dofs();
        let mut count = 0;
        for &d in &inactive {
            if self.dof(d).mimic.is_none() {
                let dim = self.dof(d).dim;
                self.dof_mut(d).q_index = count;
                count += dim;
            }
        }
        for &d in &inactive {
            if let Some(t) = self.dof(d).mimic {
                let qi = self.dof(t).q_index;
                self.dof_mut(d).q_index = qi;
            }
        }
        self.q_inactive = DVector::zeros(count);
        self.indexed_dofs_good = true;
        Ok(())
    }

    /// Activates exactly the joints of the given frames (or all but
    /// those); with `not_those`, force exchanges stay active as well.
    pub fn select_joints(
        &mut self,
        frames: &[FrameId],
        not_those: bool,
    ) -> Result<(), KinematicsErrors> {
        let mut dofs = Vec::new();
        for f in &self.frames {
            if f.joint.is_some() {
                let chosen = frames.contains(&f.id);
                if chosen != not_those {
                    dofs.push(DofId::Joint(f.id));
                }
            }
        }
        if not_those {
            for k in 0..self.forces.len() {
                dofs.push(DofId::Force(k));
            }
        }
        self.set_active_dofs(&dofs)
    }

    /// Names may refer to any frame of a rigid link; the selection climbs
    /// to the upward link carrying the joint.
    pub fn select_joints_by_name(
        &mut self,
        names: &[&str],
        not_those: bool,
    ) -> Result<(), KinematicsErrors> {
        let mut frames = Vec::new();
        for &name in names {
            let f = self
                .get_frame(name, false)
                .ok_or_else(|| KinematicsErrors::FrameNotFound(name.to_string()))?;
            let up = self.get_upward_link(f);
            if self.frames[up.0].joint.is_none() {
                return Err(KinematicsErrors::FrameHasNoJoint(name.to_string()));
            }
            frames.push(up);
        }
        self.select_joints(&frames, not_those)
    }

    pub fn select_joints_by_subtrees(
        &mut self,
        roots: &[FrameId],
        not_those: bool,
    ) -> Result<(), KinematicsErrors> {
        let mut frames = Vec::new();
        for &r in roots {
            frames.extend(self.get_sub_tree(r));
        }
        self.select_joints(&frames, not_those)
    }

    //-- coordinate vector <-> transforms ---------------------------------

    pub fn get_joint_state_dimension(&mut self) -> Result<usize, KinematicsErrors> {
        self.ensure_q()?;
        Ok(self.q.len())
    }

    pub fn get_joint_state(&mut self) -> Result<&DVector<f64>, KinematicsErrors> {
        self.ensure_q()?;
        Ok(&self.q)
    }

    /// Monotone generation counter, bumped on every coordinate or pose
    /// write; external caches compare against it.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn ensure_q(&mut self) -> Result<(), KinematicsErrors> {
        self.ensure_indexed_dofs()?;
        if !self.q_good {
            self.calc_dofs_from_config()?;
        }
        Ok(())
    }

    /// Sets the full active coordinate vector and pushes it into every
    /// active dof's transform. Invalidates proxies and the poses of every
    /// branch below a (non-time) active joint.
    pub fn set_joint_state(&mut self, q: &DVector<f64>) -> Result<(), KinematicsErrors> {
        self.ensure_indexed_dofs()?;
        if q.len() != self.q.len() {
            return Err(KinematicsErrors::JointVectorDimension {
                got: q.len(),
                expected: self.q.len(),
            });
        }
        self.q.copy_from(q);
        self.version += 1;
        self.proxies.clear();
        self.proxies_good = false;
        self.q_good = true;

        let dofs = self.active_dofs.clone();
        for &d in &dofs {
            if let DofId::Joint(fid) = d {
                let time_only = matches!(
                    self.frames[fid.0].joint.as_ref().map(|j| &j.joint_type),
                    Some(JointType::Tau)
                );
                if !time_only {
                    self.set_x_bad_in_branch(fid);
                }
            }
        }
        for &d in &dofs {
            self.apply_dof(d, false)?;
        }
        Ok(())
    }

    /// Sets coordinates for a dof subset, active or inactive; the vector
    /// must have exactly the summed dimension of the non-mimicking dofs.
    pub fn set_dof_state(
        &mut self,
        x: &DVector<f64>,
        dofs: &[DofId],
    ) -> Result<(), KinematicsErrors> {
        self.ensure_q()?;
        let expected: usize = dofs
            .iter()
            .filter(|&&d| self.dof(d).mimic.is_none())
            .map(|&d| self.dof(d).dim)
            .sum();
        if x.len() != expected {
            return Err(KinematicsErrors::DofVectorDimension {
                got: x.len(),
                expected,
            });
        }
        self.version += 1;
        let mut n = 0;
        for &d in dofs {
            let dof = self.dof(d);
            let (active, mimic, dim, qi) = (dof.active, dof.mimic, dof.dim, dof.q_index);
            if mimic.is_none() {
                for k in 0..dim {
                    if active {
                        self.q[qi + k] = x[n + k];
                    } else {
                        self.q_inactive[qi + k] = x[n + k];
                    }
                }
                n += dim;
            }
            if let DofId::Joint(fid) = d {
                let time_only = matches!(
                    self.frames[fid.0].joint.as_ref().map(|j| &j.joint_type),
                    Some(JointType::Tau)
                );
                if !time_only {
                    self.set_x_bad_in_branch(fid);
                }
            }
            self.apply_dof(d, !active)?;
        }
        self.proxies.clear();
        self.proxies_good = false;
        self.q_good = true;
        Ok(())
    }

    pub fn get_dof_state(&mut self, dofs: &[DofId]) -> Result<DVector<f64>, KinematicsErrors> {
        self.ensure_q()?;
        let n: usize = dofs
            .iter()
            .filter(|&&d| self.dof(d).mimic.is_none())
            .map(|&d| self.dof(d).dim)
            .sum();
        let mut x = DVector::zeros(n);
        let mut n = 0;
        for &d in dofs {
            let dof = self.dof(d);
            if dof.mimic.is_some() {
                continue;
            }
            let src = if dof.active { &self.q } else { &self.q_inactive };
            for k in 0..dof.dim {
                x[n + k] = src[dof.q_index + k];
            }
            n += dof.dim;
        }
        Ok(x)
    }

    /// Reads every dof's transform state back into the coordinate
    /// vectors; the inverse direction of `set_joint_state`, used after
    /// direct pose manipulation.
    pub fn calc_dofs_from_config(&mut self) -> Result<(), KinematicsErrors> {
        self.ensure_indexed_dofs()?;
        self.q.fill(0.0);
        self.q_inactive.fill(0.0);

        let active = self.active_dofs.clone();
        let mut n = 0;
        for &d in &active {
            if self.dof(d).mimic.is_some() {
                continue;
            }
            let qd = self.read_dof(d)?;
            let qi = self.dof(d).q_index;
            debug_assert_eq!(qi, n, "dof indexing is inconsistent");
            for k in 0..qd.len() {
                self.q[qi + k] = qd[k];
            }
            n += qd.len();
        }

        for d in self.inactive_dofs() {
            if self.dof(d).mimic.is_some() {
                continue;
            }
            let qd = self.read_dof(d)?;
            let qi = self.dof(d).q_index;
            for k in 0..qd.len() {
                self.q_inactive[qi + k] = qd[k];
            }
        }
        self.q_good = true;
        Ok(())
    }

    fn read_dof(&self, d: DofId) -> Result<DVector<f64>, KinematicsErrors> {
        match d {
            DofId::Joint(fid) => {
                let f = &self.frames[fid.0];
                let joint = f.joint.as_ref().expect("joint dof key without joint");
                Ok(joint.read_dofs(&f.rel, f.tau)?)
            }
            DofId::Force(k) => Ok(self.forces[k].read_dofs()),
        }
    }

    /// Pushes one dof's coordinate slice (from the active or inactive
    /// vector) into its transform state.
    fn apply_dof(&mut self, d: DofId, from_inactive: bool) -> Result<(), KinematicsErrors> {
        let Self {
            frames,
            forces,
            q,
            q_inactive,
            ..
        } = self;
        let src = if from_inactive { &*q_inactive } else { &*q };
        match d {
            DofId::Joint(fid) => {
                let f = &mut frames[fid.0];
                let joint = f.joint.as_ref().expect("joint dof key without joint");
                let (qi, dim) = (joint.dof.q_index, joint.dof.dim);
                joint.apply_dofs(&src.as_slice()[qi..qi + dim], &mut f.rel, &mut f.tau)?;
            }
            DofId::Force(k) => {
                let fex = &mut forces[k];
                let (qi, dim) = (fex.dof.q_index, fex.dof.dim);
                fex.apply_dofs(&src.as_slice()[qi..qi + dim])?;
            }
        }
        Ok(())
    }

    fn apply_dof_values(&mut self, d: DofId, values: &DVector<f64>) -> Result<(), KinematicsErrors> {
        match d {
            DofId::Joint(fid) => {
                let f = &mut self.frames[fid.0];
                let joint = f.joint.as_ref().expect("joint dof key without joint");
                let time_only = joint.joint_type == JointType::Tau;
                joint.apply_dofs(values.as_slice(), &mut f.rel, &mut f.tau)?;
                if !time_only {
                    self.set_x_bad_in_branch(fid);
                }
            }
            DofId::Force(k) => self.forces[k].apply_dofs(values.as_slice())?,
        }
        Ok(())
    }

    //-- frame state ------------------------------------------------------

    /// Sets absolute poses for the given frames from an (n, 7) matrix and
    /// recomputes their relative transforms. Coordinates diverge until
    /// resynchronized.
    pub fn set_frame_state(
        &mut self,
        x: &DMatrix<f64>,
        frames: &[FrameId],
    ) -> Result<(), KinematicsErrors> {
        if x.nrows() != frames.len() || x.ncols() != 7 {
            return Err(KinematicsErrors::FrameStateDimension {
                got: x.nrows(),
                expected: frames.len(),
            });
        }
        for &fid in frames {
            self.set_x_bad_in_branch(fid);
        }
        for (i, &fid) in frames.iter().enumerate() {
            let row: Vec<f64> = x.row(i).iter().copied().collect();
            let f = &mut self.frames[fid.0];
            f.x = Transform::from_7d(&row);
            f.x.normalize();
            f.x_good = true;
        }
        for &fid in frames {
            if let Some(p) = self.frames[fid.0].parent {
                let px = self.ensure_x(p);
                let f = &mut self.frames[fid.0];
                f.rel = Transform::difference(&px, &f.x);
            }
        }
        self.version += 1;
        self.q_good = false;
        self.proxies.clear();
        self.proxies_good = false;
        Ok(())
    }

    /// The (n, 7) pose table of all frames, for backend synchronization.
    pub fn get_frame_state(&mut self) -> DMatrix<f64> {
        let ids: Vec<FrameId> = self.frames.iter().map(|f| f.id).collect();
        self.get_frame_state_of(&ids)
    }

    pub fn get_frame_state_of(&mut self, frames: &[FrameId]) -> DMatrix<f64> {
        let mut x = DMatrix::zeros(frames.len(), 7);
        for (i, &fid) in frames.iter().enumerate() {
            let pose = self.ensure_x(fid).to_7d();
            for k in 0..7 {
                x[(i, k)] = pose[k];
            }
        }
        x
    }

    //-- forward kinematics core ------------------------------------------

    /// Recovers the absolute pose, recursing to the parent if the cached
    /// value is stale. O(depth) on first access, O(1) amortized.
    pub fn ensure_x(&mut self, id: FrameId) -> Transform {
        if self.frames[id.0].x_good {
            return self.frames[id.0].x;
        }
        let parent = self.frames[id.0]
            .parent
            .expect("parent-less frames always carry a valid pose");
        let px = self.ensure_x(parent);
        let f = &mut self.frames[id.0];
        f.x = px * f.rel;
        f.x_good = true;
        f.x
    }

    /// Propagates the stale mark down the branch; recomputation stays
    /// lazy.
    pub(crate) fn set_x_bad_in_branch(&mut self, id: FrameId) {
        let mut stack = vec![id];
        while let Some(f) = stack.pop() {
            self.frames[f.0].x_good = false;
            stack.extend_from_slice(&self.frames[f.0].children);
        }
    }

    //-- randomized initialization ----------------------------------------

    /// Randomizes every active dof according to its sampling policy:
    /// uniform within limits (biasing `q0` to the draw), or Gaussian
    /// around the default, clipped to limits.
    pub fn set_random(&mut self, rng: &mut SmallRng) -> Result<(), KinematicsErrors> {
        self.ensure_indexed_dofs()?;
        let dofs = self.active_dofs.clone();
        for &d in &dofs {
            if self.dof(d).mimic.is_some() {
                continue;
            }
            let dof = self.dof(d).clone();
            let uniform = dof.sample_uniform > 0.0
                && (dof.sample_uniform >= 1.0 || rng.gen::<f64>() < dof.sample_uniform);
            let q = if uniform {
                let mut q = self.read_dof(d)?;
                let mut q0 = dof.q0.clone().unwrap_or_else(|| q.clone());
                for k in 0..dof.dim {
                    if let Some((lo, hi)) = dof.limit(k) {
                        q[k] = rng.gen_range(lo..=hi);
                        q0[k] = q[k];
                    }
                }
                tracing::debug!(
                    dof = %self.dof_frame_name(d),
                    "uniform init within limits"
                );
                // bias subsequent Gaussian draws toward this sample
                self.dof_mut(d).q0 = Some(q0);
                q
            } else {
                let mut q = match &dof.q0 {
                    Some(q0) => q0.clone(),
                    None => self.read_dof(d)?,
                };
                if dof.sample_sdv > 0.0 {
                    let normal =
                        Normal::new(0.0, dof.sample_sdv).expect("sample_sdv must be positive");
                    for k in 0..dof.dim {
                        q[k] += normal.sample(rng);
                    }
                }
                dof.clip_to_limits(&mut q);
                q
            };
            self.apply_dof_values(d, &q)?;
            for m in self.dof(d).mimicers.clone() {
                self.apply_dof_values(m, &q)?;
            }
        }
        self.q_good = false;
        self.check_consistency()?;
        Ok(())
    }

    //-- optimizer-facing exports -----------------------------------------

    /// Per-coordinate (lo, hi) limits; rows with hi < lo are unbounded.
    pub fn get_limits(&mut self) -> Result<DMatrix<f64>, KinematicsErrors> {
        self.ensure_q()?;
        let n = self.q.len();
        let mut lim = DMatrix::zeros(n, 2);
        for i in 0..n {
            lim[(i, 1)] = -1.0;
        }
        for &d in &self.active_dofs.clone() {
            let dof = self.dof(d);
            if dof.mimic.is_some() {
                continue;
            }
            for k in 0..dof.dim {
                if let Some((lo, hi)) = dof.limit(k) {
                    lim[(dof.q_index + k, 0)] = lo;
                    lim[(dof.q_index + k, 1)] = hi;
                }
            }
        }
        Ok(lim)
    }

    /// Diagonal of the control-cost metric: each joint's weight, with the
    /// planar joint's translation coordinates up-weighted.
    pub fn get_ctrl_metric(&mut self) -> Result<DVector<f64>, KinematicsErrors> {
        self.ensure_q()?;
        let mut h = DVector::zeros(self.q.len());
        for &d in &self.active_dofs.clone() {
            let DofId::Joint(fid) = d else { continue };
            let joint = self.frames[fid.0]
                .joint
                .as_ref()
                .expect("joint dof key without joint");
            if joint.dof.mimic.is_some() {
                continue;
            }
            let (qi, w) = (joint.dof.q_index, joint.h);
            if joint.joint_type == JointType::TransXYPhi {
                h[qi] = 10.0 * w;
                h[qi + 1] = 10.0 * w;
                h[qi + 2] = w;
            } else {
                for k in 0..joint.dof.dim {
                    h[qi + k] = w;
                }
            }
        }
        Ok(h)
    }

    //-- topology ---------------------------------------------------------

    pub fn get_roots(&self) -> Vec<FrameId> {
        self.frames
            .iter()
            .filter(|f| f.parent.is_none())
            .map(|f| f.id)
            .collect()
    }

    /// The subtree below (and including) `root`, breadth-first.
    pub fn get_sub_tree(&self, root: FrameId) -> Vec<FrameId> {
        let mut order = vec![root];
        let mut i = 0;
        while i < order.len() {
            order.extend_from_slice(&self.frames[order[i].0].children);
            i += 1;
        }
        order
    }

    /// First frame at or above `id` carrying a joint (or the root of its
    /// rigid chain).
    pub fn get_upward_link(&self, id: FrameId) -> FrameId {
        let mut f = id;
        loop {
            let frame = &self.frames[f.0];
            if frame.joint.is_some() || frame.parent.is_none() {
                return f;
            }
            f = frame.parent.expect("checked above");
        }
    }

    /// Natural frame order: all roots, then breadth-first expansion.
    /// Fails when the parent links are loopy.
    pub fn calc_top_sort(&self) -> Result<Vec<FrameId>, KinematicsErrors> {
        let mut order = self.get_roots();
        let mut i = 0;
        while i < order.len() {
            order.extend_from_slice(&self.frames[order[i].0].children);
            i += 1;
        }
        if order.len() != self.frames.len() {
            return Err(KinematicsErrors::NotTopSortable);
        }
        Ok(order)
    }

    pub fn check_top_sort(&self) -> bool {
        let mut level = vec![0usize; self.frames.len()];
        for f in &self.frames {
            if let Some(p) = f.parent {
                level[f.id.0] = level[p.0] + 1;
            }
        }
        self.frames
            .iter()
            .all(|f| f.parent.map_or(true, |p| level[p.0] < level[f.id.0]))
    }

    /// Re-orders the frame storage topologically and reassigns ids.
    pub fn sort_frames(&mut self) -> Result<(), KinematicsErrors> {
        let order = self.calc_top_sort()?;
        let mut frame_map = vec![None; self.frames.len()];
        for (new, old) in order.iter().enumerate() {
            frame_map[old.0] = Some(new);
        }
        let force_map: Vec<Option<usize>> = (0..self.forces.len()).map(Some).collect();
        self.apply_maps(&frame_map, &force_map);
        self.reset_q();
        Ok(())
    }

    //-- tree editing -----------------------------------------------------

    /// Re-parents `child` under `parent`; with `keep_pose` the absolute
    /// pose is preserved by recomputing the relative transform.
    pub fn set_parent(
        &mut self,
        child: FrameId,
        parent: FrameId,
        keep_pose: bool,
    ) -> Result<(), KinematicsErrors> {
        if child == parent {
            return Err(KinematicsErrors::CycleDetected(
                self.frames[child.0].name.clone(),
            ));
        }
        let mut p = Some(parent);
        while let Some(f) = p {
            if f == child {
                return Err(KinematicsErrors::CycleDetected(
                    self.frames[child.0].name.clone(),
                ));
            }
            p = self.frames[f.0].parent;
        }
        if keep_pose {
            let cx = self.ensure_x(child);
            let px = self.ensure_x(parent);
            self.frames[child.0].rel = Transform::difference(&px, &cx);
        }
        if let Some(old) = self.frames[child.0].parent {
            self.frames[old.0].children.retain(|&c| c != child);
        }
        self.frames[child.0].parent = Some(parent);
        self.frames[parent.0].children.push(child);
        if !keep_pose {
            self.set_x_bad_in_branch(child);
        }
        self.reset_q();
        Ok(())
    }

    /// Detaches `child` from its parent, freezing its absolute pose as a
    /// new root.
    pub fn unlink(&mut self, child: FrameId) {
        if let Some(p) = self.frames[child.0].parent {
            self.ensure_x(child);
            self.frames[p.0].children.retain(|&c| c != child);
            let f = &mut self.frames[child.0];
            f.parent = None;
            f.rel = Transform::IDENTITY;
            f.x_good = true;
            self.reset_q();
        }
    }

    /// Deletes a frame; children are re-parented to its parent with
    /// composed relative transforms (absolute poses preserved), attached
    /// force exchanges are dropped, and ids are reassigned.
    pub fn delete_frame(&mut self, id: FrameId) {
        let children = self.frames[id.0].children.clone();
        for &c in &children {
            self.ensure_x(c);
        }
        let parent = self.frames[id.0].parent;
        let drel = self.frames[id.0].rel;
        match parent {
            Some(p) => {
                for &c in &children {
                    let f = &mut self.frames[c.0];
                    f.rel = drel * f.rel;
                    f.parent = Some(p);
                }
                let pf = &mut self.frames[p.0];
                pf.children.retain(|&c| c != id);
                pf.children.extend_from_slice(&children);
            }
            None => {
                for &c in &children {
                    let f = &mut self.frames[c.0];
                    f.parent = None;
                    f.rel = Transform::IDENTITY;
                }
            }
        }
        self.frames[id.0].children.clear();

        let mut frame_map: Vec<Option<usize>> = Vec::with_capacity(self.frames.len());
        for i in 0..self.frames.len() {
            frame_map.push(match i.cmp(&id.0) {
                std::cmp::Ordering::Less => Some(i),
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => Some(i - 1),
            });
        }
        let mut force_map: Vec<Option<usize>> = Vec::with_capacity(self.forces.len());
        let mut kept = 0;
        for fex in &self.forces {
            if fex.a == id || fex.b == id {
                force_map.push(None);
            } else {
                force_map.push(Some(kept));
                kept += 1;
            }
        }
        self.apply_maps(&frame_map, &force_map);
        self.reset_q();
    }

    /// Clears all frames, exchanges, and proxies.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.forces.clear();
        self.proxies.clear();
        self.proxies_good = false;
        self.reset_q();
    }

    /// Re-orients the edges along the path from `new_root` to the current
    /// root so that `new_root` becomes a root; absolute poses are
    /// preserved and each flipped edge's joint moves to its former
    /// parent.
    pub fn reconfigure_root(&mut self, new_root: FrameId) -> Result<(), KinematicsErrors> {
        let mut path = vec![new_root];
        while let Some(p) = self.frames[path.last().expect("nonempty").0].parent {
            path.push(p);
        }
        if path.len() == 1 {
            return Ok(());
        }
        for &f in &path {
            self.ensure_x(f);
        }
        let moved: Vec<Option<Joint>> = path[..path.len() - 1]
            .iter()
            .map(|&f| self.frames[f.0].joint.take())
            .collect();
        for (i, joint) in moved.into_iter().enumerate() {
            let (c, p) = (path[i], path[i + 1]);
            let cx = self.frames[c.0].x;
            let px = self.frames[p.0].x;
            let pf = &mut self.frames[p.0];
            pf.children.retain(|&x| x != c);
            pf.parent = Some(c);
            pf.rel = Transform::difference(&cx, &px);
            pf.joint = joint;
            self.frames[c.0].children.push(p);
        }
        let rf = &mut self.frames[new_root.0];
        rf.parent = None;
        rf.rel = Transform::IDENTITY;
        rf.x_good = true;

        // joints moved one frame up the old chain; follow with the mimic links
        let mut joint_moves = HashMap::new();
        for i in 0..path.len() - 1 {
            joint_moves.insert(path[i], path[i + 1]);
        }
        self.remap_dof_refs(|d| match d {
            DofId::Joint(f) => Some(DofId::Joint(*joint_moves.get(&f).unwrap_or(&f))),
            other => Some(other),
        });
        self.reset_q();
        Ok(())
    }

    //-- internal remapping -----------------------------------------------

    fn remap_dof_refs(&mut self, map: impl Fn(DofId) -> Option<DofId>) {
        for f in &mut self.frames {
            if let Some(j) = &mut f.joint {
                j.dof.mimic = j.dof.mimic.and_then(&map);
                j.dof.mimicers = j.dof.mimicers.iter().filter_map(|&m| map(m)).collect();
            }
        }
        for fex in &mut self.forces {
            fex.dof.mimic = fex.dof.mimic.and_then(&map);
            fex.dof.mimicers = fex.dof.mimicers.iter().filter_map(|&m| map(m)).collect();
        }
    }

    /// Applies a frame and force-exchange renumbering: `None` entries are
    /// removed, the rest move to their new index. All cross-references
    /// (parents, children, mimic links, exchange pairs, proxies,
    /// attachment lists) follow.
    fn apply_maps(&mut self, frame_map: &[Option<usize>], force_map: &[Option<usize>]) {
        let new_len = frame_map.iter().flatten().count();
        let mut slots: Vec<Option<Frame>> = std::mem::take(&mut self.frames)
            .into_iter()
            .map(Some)
            .collect();
        let mut frames: Vec<Option<Frame>> = (0..new_len).map(|_| None).collect();
        for (old, &new) in frame_map.iter().enumerate() {
            if let Some(new) = new {
                frames[new] = slots[old].take();
            }
        }
        self.frames = frames
            .into_iter()
            .map(|f| f.expect("permutation must be total"))
            .collect();

        let frame_of = |id: FrameId| frame_map[id.0].map(FrameId);
        for (i, f) in self.frames.iter_mut().enumerate() {
            f.id = FrameId(i);
            f.parent = f.parent.and_then(frame_of);
            f.children = f.children.iter().filter_map(|&c| frame_of(c)).collect();
        }

        let mut forces: Vec<ForceExchange> = Vec::new();
        for (old, fex) in std::mem::take(&mut self.forces).into_iter().enumerate() {
            if force_map[old].is_some() {
                let mut fex = fex;
                fex.a = frame_of(fex.a).expect("kept exchange must keep its frames");
                fex.b = frame_of(fex.b).expect("kept exchange must keep its frames");
                forces.push(fex);
            }
        }
        self.forces = forces;

        self.remap_dof_refs(|d| match d {
            DofId::Joint(f) => frame_of(f).map(DofId::Joint),
            DofId::Force(k) => force_map[k].map(DofId::Force),
        });

        self.proxies.retain(|p| {
            frame_map[p.a.0].is_some() && frame_map[p.b.0].is_some()
        });
        for p in &mut self.proxies {
            p.a = frame_of(p.a).expect("retained above");
            p.b = frame_of(p.b).expect("retained above");
        }

        for f in &mut self.frames {
            f.forces.clear();
        }
        for (k, fex) in self.forces.iter().enumerate() {
            let (a, b) = (fex.a, fex.b);
            self.frames[a.0].forces.push(k);
            self.frames[b.0].forces.push(k);
        }
    }

    //-- time coordinate --------------------------------------------------

    /// Attaches a time-interval coordinate to the first root frame.
    pub fn add_tau_joint(&mut self) -> Result<(), KinematicsErrors> {
        let root = *self
            .get_roots()
            .first()
            .ok_or_else(|| KinematicsErrors::FrameNotFound("<root>".to_string()))?;
        let mut joint = Joint::new(JointType::Tau)?;
        joint.h = 0.0;
        self.set_joint(root, joint);
        Ok(())
    }

    pub fn has_tau_joint(&self) -> bool {
        self.get_roots().iter().any(|&r| {
            matches!(
                self.frames[r.0].joint.as_ref().map(|j| &j.joint_type),
                Some(JointType::Tau)
            )
        })
    }

    //-- consistency ------------------------------------------------------

    /// Full validation of every cached-state invariant, independent of
    /// the cached flags. Violations are programming errors; tests treat
    /// them as fatal.
    pub fn check_consistency(&self) -> Result<(), KinematicsErrors> {
        // indexing and coordinate agreement
        if self.q_good {
            let mut count = 0;
            for &d in &self.active_dofs {
                let dof = self.dof(d);
                match dof.mimic {
                    Some(t) => {
                        let target = self.dof(t);
                        if dof.q_index != target.q_index
                            || dof.active != target.active
                            || dof.dim != target.dim
                        {
                            return Err(ConsistencyErrors::MimicMismatch(
                                self.dof_frame_name(d),
                            )
                            .into());
                        }
                    }
                    None => {
                        if dof.q_index != count {
                            return Err(ConsistencyErrors::IndexNotContiguous(
                                self.dof_frame_name(d),
                                dof.q_index,
                                count,
                            )
                            .into());
                        }
                        count += dof.dim;
                    }
                }
            }
            if count != self.q.len() {
                return Err(ConsistencyErrors::VectorDimension {
                    got: self.q.len(),
                    expected: count,
                }
                .into());
            }

            for f in &self.frames {
                let Some(joint) = &f.joint else { continue };
                let jq = joint.read_dofs(&f.rel, f.tau)?;
                let (active, mimic, qi) = (joint.dof.active, joint.dof.mimic, joint.dof.q_index);
                let src = if active {
                    Some(&self.q)
                } else if mimic.is_none() {
                    Some(&self.q_inactive)
                } else {
                    None
                };
                if let Some(src) = src {
                    for k in 0..jq.len() {
                        if (jq[k] - src[qi + k]).abs() > CONSISTENCY_TOL {
                            return Err(ConsistencyErrors::DofStateMismatch {
                                frame: f.name.clone(),
                                index: k,
                                q: src[qi + k],
                                expected: jq[k],
                            }
                            .into());
                        }
                    }
                }
            }
            for fex in &self.forces {
                let fq = fex.read_dofs();
                let (active, mimic, qi) = (fex.dof.active, fex.dof.mimic, fex.dof.q_index);
                let src = if active {
                    Some(&self.q)
                } else if mimic.is_none() {
                    Some(&self.q_inactive)
                } else {
                    None
                };
                if let Some(src) = src {
                    for k in 0..fq.len() {
                        if (fq[k] - src[qi + k]).abs() > CONSISTENCY_TOL {
                            return Err(ConsistencyErrors::DofStateMismatch {
                                frame: fex.name(),
                                index: k,
                                q: src[qi + k],
                                expected: fq[k],
                            }
                            .into());
                        }
                    }
                }
            }
        }

        // tree structure and pose caches
        for (i, f) in self.frames.iter().enumerate() {
            if f.id.0 != i {
                return Err(ConsistencyErrors::IdOutOfOrder.into());
            }
            for &c in &f.children {
                if self.frames[c.0].parent != Some(f.id) {
                    return Err(ConsistencyErrors::TreeAsymmetry(f.name.clone()).into());
                }
            }
            if let Some(p) = f.parent {
                if !self.frames[p.0].children.contains(&f.id) {
                    return Err(ConsistencyErrors::TreeAsymmetry(f.name.clone()).into());
                }
            }
            if let Some(joint) = &f.joint {
                if joint.dof.dim != joint.joint_type.dim() {
                    return Err(ConsistencyErrors::JointDimMismatch(
                        f.name.clone(),
                        joint.dof.dim,
                        joint.joint_type.dim(),
                    )
                    .into());
                }
            }
            if (f.rel.rot.norm() - 1.0).abs() > CONSISTENCY_TOL
                || (f.x_good && (f.x.rot.norm() - 1.0).abs() > CONSISTENCY_TOL)
            {
                return Err(ConsistencyErrors::RotationNotNormalized(f.name.clone()).into());
            }
            match f.parent {
                None => {
                    if !f.x_good || !f.rel.is_zero(CONSISTENCY_TOL) {
                        return Err(ConsistencyErrors::RootStateInvalid(f.name.clone()).into());
                    }
                }
                Some(p) => {
                    if f.x_good {
                        if !self.frames[p.0].x_good {
                            return Err(
                                ConsistencyErrors::ParentPoseInvalid(f.name.clone()).into()
                            );
                        }
                        let test = self.frames[p.0].x * f.rel;
                        if !Transform::difference(&f.x, &test).is_zero(CONSISTENCY_TOL) {
                            return Err(
                                ConsistencyErrors::StalePoseMarkedValid(f.name.clone()).into()
                            );
                        }
                    }
                }
            }
        }

        // mimic symmetry over all dofs
        let mut all_dofs: Vec<DofId> = self.joint_dofs();
        all_dofs.extend((0..self.forces.len()).map(DofId::Force));
        for &d in &all_dofs {
            let dof = self.dof(d);
            if let Some(t) = dof.mimic {
                let target = self.dof(t);
                if dof.dim != target.dim || dof.active != target.active {
                    return Err(ConsistencyErrors::MimicMismatch(self.dof_frame_name(d)).into());
                }
                if self.indexed_dofs_good && dof.q_index != target.q_index {
                    return Err(ConsistencyErrors::MimicMismatch(self.dof_frame_name(d)).into());
                }
                if !target.mimicers.contains(&d) {
                    return Err(ConsistencyErrors::MimicAsymmetry(self.dof_frame_name(d)).into());
                }
            }
            for &m in &dof.mimicers {
                if self.dof(m).mimic != Some(d) {
                    return Err(ConsistencyErrors::MimicAsymmetry(self.dof_frame_name(d)).into());
                }
            }
        }

        // topological sortability
        if self.calc_top_sort().is_err() {
            return Err(ConsistencyErrors::Cyclic.into());
        }

        // proxies and attachment lists
        let n = self.frames.len();
        if self.proxies.iter().any(|p| p.a.0 >= n || p.b.0 >= n) {
            return Err(ConsistencyErrors::ProxyFrameInvalid.into());
        }
        for (k, fex) in self.forces.iter().enumerate() {
            if !self.frames[fex.a.0].forces.contains(&k)
                || !self.frames[fex.b.0].forces.contains(&k)
            {
                return Err(ConsistencyErrors::ForceAttachmentInvalid(k).into());
            }
        }
        Ok(())
    }
}
