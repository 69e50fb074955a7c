use crate::cg_interface::{NodeId, SimTime};
use thiserror::Error;

/// Errors raised while configuring or running simulations.
///
/// Configuration variants are returned before any engine is built.
/// Invariant variants abort the run they occur in and surface through
/// `SimulationEngine::run`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    // ===== Configuration =====
    #[error("unknown peer selector: {0}")]
    UnknownSelector(String),

    #[error("unknown churn mode: {0}")]
    UnknownChurnMode(String),

    #[error("weights cannot be normalized (total = {total})")]
    NonNormalizableWeights { total: f64 },

    #[error("timeout must be positive, got {0}")]
    InvalidTimeout(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("node {node} is out of range (network size {size})")]
    UnknownNode { node: NodeId, size: usize },

    // ===== Invariants =====
    #[error("simulated time moved backwards: {from} -> {to}")]
    TimeReversal { from: SimTime, to: SimTime },

    #[error("cannot schedule at {at}, clock already at {now}")]
    ScheduledInPast { at: SimTime, now: SimTime },

    #[error("node {0} recorded a first reach twice")]
    DuplicateFirstReach(NodeId),

    #[error("invariant violated: {0}")]
    Invariant(String),

    // ===== Executor =====
    #[error("task {task} failed: {reason}")]
    TaskFailed { task: usize, reason: String },

    #[error("executor: {0}")]
    Executor(String),
}

impl SimError {
    /// Whether this error comes from a bad descriptor rather than from a run
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            SimError::UnknownSelector(_)
                | SimError::UnknownChurnMode(_)
                | SimError::NonNormalizableWeights { .. }
                | SimError::InvalidTimeout(_)
                | SimError::InvalidConfig(_)
                | SimError::UnknownNode { .. }
        )
    }
}

pub type SimResult<T> = Result<T, SimError>;
