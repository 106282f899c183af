use crate::frame::FrameId;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A pairwise distance record reported by the external collision backend.
///
/// The engine never computes these itself; it stores them, invalidates
/// them on every coordinate write, and consumes them for penetration
/// costs and force-exchange seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub a: FrameId,
    pub b: FrameId,
    /// witness point on `a`, world coordinates
    pub pos_a: Vector3<f64>,
    /// witness point on `b`, world coordinates
    pub pos_b: Vector3<f64>,
    /// contact normal, pointing from `b` toward `a`
    pub normal: Vector3<f64>,
    /// signed distance, negative when penetrating
    pub d: f64,
}

impl Proxy {
    /// The unordered frame pair, for pair-keyed lookups.
    pub fn pair(&self) -> (FrameId, FrameId) {
        if self.a.index() <= self.b.index() {
            (self.a, self.b)
        } else {
            (self.b, self.a)
        }
    }

    pub fn joins(&self, a: FrameId, b: FrameId) -> bool {
        (self.a == a && self.b == b) || (self.a == b && self.b == a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_is_unordered() {
        let p = Proxy {
            a: FrameId(3),
            b: FrameId(1),
            pos_a: Vector3::zeros(),
            pos_b: Vector3::zeros(),
            normal: Vector3::z(),
            d: 0.1,
        };
        assert_eq!(p.pair(), (FrameId(1), FrameId(3)));
        assert!(p.joins(FrameId(1), FrameId(3)));
        assert!(p.joins(FrameId(3), FrameId(1)));
        assert!(!p.joins(FrameId(1), FrameId(2)));
    }
}
