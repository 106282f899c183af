use crate::{dof::Dof, frame::FrameId, proxy::Proxy};
use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForceExchangeErrors {
    #[error("force exchange coordinate slice has dimension {got}, expected {expected}")]
    WrongDofDimension { got: usize, expected: usize },
    #[error("force exchange cannot couple a frame with itself")]
    SelfCoupling,
}

/// Which physical quantities the exchange's coordinates encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceExchangeType {
    /// point of application only
    PoaOnly,
    /// point of application + force
    Force,
    /// point of application + force + torque
    ForceTorque,
    /// a single vertical force scalar; poa is seeded from collision
    ForceZ,
}

impl ForceExchangeType {
    pub fn dim(&self) -> usize {
        match self {
            ForceExchangeType::PoaOnly => 3,
            ForceExchangeType::Force => 6,
            ForceExchangeType::ForceTorque => 9,
            ForceExchangeType::ForceZ => 1,
        }
    }

    /// Offset of the force block within the coordinate slice, if the
    /// subtype has one.
    pub(crate) fn force_offset(&self) -> Option<usize> {
        match self {
            ForceExchangeType::Force | ForceExchangeType::ForceTorque => Some(3),
            ForceExchangeType::ForceZ => Some(0),
            ForceExchangeType::PoaOnly => None,
        }
    }

    pub(crate) fn poa_offset(&self) -> Option<usize> {
        match self {
            ForceExchangeType::PoaOnly | ForceExchangeType::Force | ForceExchangeType::ForceTorque => {
                Some(0)
            }
            ForceExchangeType::ForceZ => None,
        }
    }

    pub(crate) fn torque_offset(&self) -> Option<usize> {
        match self {
            ForceExchangeType::ForceTorque => Some(6),
            _ => None,
        }
    }
}

/// A contact/force coupling between an ordered pair of frames.
///
/// Participates in the same activation/indexing machinery as a joint; the
/// coordinates hold the world-frame point of application, force and
/// torque the exchange applies to `a` (and, negated, to `b`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceExchange {
    pub a: FrameId,
    pub b: FrameId,
    pub exchange_type: ForceExchangeType,
    pub dof: Dof,
    pub poa: Vector3<f64>,
    pub force: Vector3<f64>,
    pub torque: Vector3<f64>,
    /// matched proxy index, tagged with the configuration version it was
    /// computed at
    pub(crate) proxy_cache: Option<(u64, Option<usize>)>,
}

impl ForceExchange {
    pub fn new(
        a: FrameId,
        b: FrameId,
        exchange_type: ForceExchangeType,
    ) -> Result<Self, ForceExchangeErrors> {
        if a == b {
            return Err(ForceExchangeErrors::SelfCoupling);
        }
        Ok(Self {
            a,
            b,
            exchange_type,
            dof: Dof::new(exchange_type.dim()),
            poa: Vector3::zeros(),
            force: Vector3::zeros(),
            torque: Vector3::zeros(),
            proxy_cache: None,
        })
    }

    pub fn name(&self) -> String {
        format!("fex-{}-{}", self.a, self.b)
    }

    /// Sign of the coupling as seen from frame `f`: +1 on `a`, -1 on `b`.
    pub fn sign(&self, f: FrameId) -> f64 {
        if f == self.a {
            1.0
        } else {
            -1.0
        }
    }

    pub fn apply_dofs(&mut self, q: &[f64]) -> Result<(), ForceExchangeErrors> {
        let expected = self.dof.dim;
        if q.len() != expected {
            return Err(ForceExchangeErrors::WrongDofDimension {
                got: q.len(),
                expected,
            });
        }
        let s = self.dof.scale;
        if let Some(o) = self.exchange_type.poa_offset() {
            self.poa = s * Vector3::new(q[o], q[o + 1], q[o + 2]);
        }
        match self.exchange_type {
            ForceExchangeType::ForceZ => {
                self.force = Vector3::new(0.0, 0.0, s * q[0]);
            }
            _ => {
                if let Some(o) = self.exchange_type.force_offset() {
                    self.force = s * Vector3::new(q[o], q[o + 1], q[o + 2]);
                }
            }
        }
        if let Some(o) = self.exchange_type.torque_offset() {
            self.torque = s * Vector3::new(q[o], q[o + 1], q[o + 2]);
        }
        Ok(())
    }

    pub fn read_dofs(&self) -> DVector<f64> {
        let s = self.dof.scale;
        let mut q = DVector::zeros(self.dof.dim);
        if let Some(o) = self.exchange_type.poa_offset() {
            for k in 0..3 {
                q[o + k] = self.poa[k] / s;
            }
        }
        match self.exchange_type {
            ForceExchangeType::ForceZ => q[0] = self.force.z / s,
            _ => {
                if let Some(o) = self.exchange_type.force_offset() {
                    for k in 0..3 {
                        q[o + k] = self.force[k] / s;
                    }
                }
            }
        }
        if let Some(o) = self.exchange_type.torque_offset() {
            for k in 0..3 {
                q[o + k] = self.torque[k] / s;
            }
        }
        q
    }

    /// Resets to the neutral coupling: poa midway between the two frame
    /// origins, zero force and torque.
    pub fn set_zero(&mut self, pos_a: Vector3<f64>, pos_b: Vector3<f64>) {
        self.poa = 0.5 * (pos_a + pos_b);
        self.force = Vector3::zeros();
        self.torque = Vector3::zeros();
    }

    /// Seeds the point of application from a matched collision proxy.
    pub fn init_from_proxy(&mut self, p: &Proxy) {
        self.poa = 0.5 * (p.pos_a + p.pos_b);
    }

    /// Nearest-distance proxy joining this exchange's frame pair.
    pub fn find_proxy(&self, proxies: &[Proxy]) -> Option<usize> {
        proxies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.joins(self.a, self.b))
            .min_by(|(_, p), (_, q)| p.d.total_cmp(&q.d))
            .map(|(i, _)| i)
    }
}
