use crate::frame::FrameId;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Key of a coordinate-owning capability: the joint attached to a frame,
/// or a force exchange by index into the configuration's exchange list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DofId {
    Joint(FrameId),
    Force(usize),
}

/// The shared contract of every generalized-coordinate owner.
///
/// A `Dof` does not own storage in the coordinate vector; the
/// configuration assigns `q_index` and reads/writes the slice
/// `[q_index, q_index + dim)`. A mimicking dof shares its target's index
/// and activation and never counts toward the vector dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dof {
    pub dim: usize,
    pub q_index: usize,
    pub active: bool,
    pub mimic: Option<DofId>,
    pub mimicers: Vec<DofId>,
    /// per-scalar (lo, hi); empty means unbounded, as does lo > hi
    pub limits: Vec<(f64, f64)>,
    /// default coordinates; also the bias imposed by randomized init
    pub q0: Option<DVector<f64>>,
    /// fraction of randomized initializations drawn uniformly in limits
    pub sample_uniform: f64,
    /// standard deviation of the Gaussian fallback around `q0`
    pub sample_sdv: f64,
    /// scaling between coordinate values and transform magnitudes
    pub scale: f64,
}

impl Dof {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            q_index: 0,
            active: true,
            mimic: None,
            mimicers: Vec::new(),
            limits: Vec::new(),
            q0: None,
            sample_uniform: 0.0,
            sample_sdv: 0.01,
            scale: 1.0,
        }
    }

    /// The k-th scalar's limit interval, if one is declared and valid.
    pub fn limit(&self, k: usize) -> Option<(f64, f64)> {
        self.limits.get(k).copied().filter(|(lo, hi)| hi >= lo)
    }

    pub fn clip_to_limits(&self, q: &mut DVector<f64>) {
        for k in 0..q.len() {
            if let Some((lo, hi)) = self.limit(k) {
                q[k] = q[k].clamp(lo, hi);
            }
        }
    }
}
