//! Error taxonomy of the balance loop.
//!
//! Assembly-time errors ([`PipelineError`], [`ConfigError`]) abort startup.
//! Per-cycle errors never escape the loop: they are mapped to a [`Fault`]
//! (zero actuation, FALLEN) or, for [`InfeasibleProblem`], to a local
//! fallback on the direct feedback law.

use std::time::Duration;

use thiserror::Error;

use crate::frame::SignalKey;

/// Pipeline assembly failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// A transform depends on a key that no upstream stage produces.
    #[error("transform `{transform}` requires `{key}`, which no upstream stage produces")]
    MissingKey { transform: String, key: SignalKey },

    /// A key string is not of the form `block.field`.
    #[error("invalid signal key `{0}`: expected `block.field`")]
    InvalidKey(String),

    /// A transform parameter is out of range.
    #[error("transform `{transform}`: {reason}")]
    InvalidParameter { transform: String, reason: String },
}

/// Missing or malformed sensor data for the current cycle.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid observation at `{key}`: {reason}")]
pub struct InvalidObservation {
    pub key: SignalKey,
    pub reason: String,
}

impl InvalidObservation {
    pub fn missing(key: &SignalKey) -> Self {
        Self {
            key: key.clone(),
            reason: "missing".to_string(),
        }
    }

    pub fn malformed(key: &SignalKey, reason: impl Into<String>) -> Self {
        Self {
            key: key.clone(),
            reason: reason.into(),
        }
    }
}

/// The trajectory optimizer found no acceptable solution within its budget.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("infeasible problem: {status}")]
pub struct InfeasibleProblem {
    /// Solver status or reason, e.g. `PrimalInfeasible` or `MaxTime`.
    pub status: String,
}

impl InfeasibleProblem {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

/// Spine transport failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpineError {
    #[error("no observation within {0:?}")]
    Timeout(Duration),

    #[error("spine disconnected: {0}")]
    Disconnected(String),
}

/// Configuration rejected by validation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Anything that can go wrong while wiring the loop together.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Cycle-fatal faults. Both force the controller into FALLEN.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error(transparent)]
    InvalidObservation(#[from] InvalidObservation),

    #[error("connectivity fault: {0}")]
    Connectivity(SpineError),
}
