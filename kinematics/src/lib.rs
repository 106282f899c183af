pub mod configuration;
pub mod dof;
pub mod export;
pub mod force_exchange;
pub mod frame;
pub mod jacobian;
pub mod joint;
pub mod proxy;
pub mod scene;

use configuration::ConsistencyErrors;
use force_exchange::ForceExchangeErrors;
use joint::JointErrors;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KinematicsErrors {
    #[error("active dof on frame '{dof}' mimics inactive dof on frame '{target}'")]
    ActiveMimicsInactive { dof: String, target: String },
    #[error("{0}")]
    Consistency(#[from] ConsistencyErrors),
    #[error("reparenting '{0}' would create a cycle")]
    CycleDetected(String),
    #[error("dof state vector has dimension {got}, expected {expected}")]
    DofVectorDimension { got: usize, expected: usize },
    #[error("{0}")]
    ForceExchange(#[from] ForceExchangeErrors),
    #[error("frame '{0}' has no joint")]
    FrameHasNoJoint(String),
    #[error("could not find frame '{0}'")]
    FrameNotFound(String),
    #[error("frame state has {got} rows for {expected} frames")]
    FrameStateDimension { got: usize, expected: usize },
    #[error("{0}")]
    Joint(#[from] JointErrors),
    #[error("joint state vector has dimension {got}, expected {expected}")]
    JointVectorDimension { got: usize, expected: usize },
    #[error("mimic dimension mismatch: dof on frame '{dof}' has dim {dof_dim}, target on frame '{target}' has dim {target_dim}")]
    MimicDimensionMismatch {
        dof: String,
        dof_dim: usize,
        target: String,
        target_dim: usize,
    },
    #[error("a dof cannot mimic itself")]
    MimicSelf,
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("frame tree is not topologically sortable")]
    NotTopSortable,
    #[error("collision proxies have not been computed")]
    ProxiesNotComputed,
    #[error("{0}")]
    Scene(#[from] scene::SceneErrors),
}
