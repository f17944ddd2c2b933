//! Error types for experiment orchestration.

use cb_control::ControlError;
use cb_core::CbError;
use cb_eis::EisError;
use cb_instruments::InstrumentError;
use cb_results::ResultsError;
use cb_rig::RigError;
use thiserror::Error;

use crate::context::ExperimentPhase;

/// Errors that abort a characterization run.
///
/// Expected leg terminations (settled voltage, current threshold) are not
/// errors; they arrive as completion codes inside phase outcomes and the
/// orchestrator decides whether each one is acceptable for its phase.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid experiment parameter: {0}")]
    InvalidParameter(#[from] CbError),

    #[error("Phase {phase} exceeded its wall-clock limit")]
    Timeout { phase: &'static str },

    #[error("SOC safety ceiling exceeded at {soc_pct:.1}% during the checkpointed charge")]
    SafetyCeiling { soc_pct: f64 },

    #[error("Illegal phase transition: {from} -> {to}")]
    InvalidTransition {
        from: ExperimentPhase,
        to: ExperimentPhase,
    },

    #[error("Storage for {what} is full ({limit} entries)")]
    CapacityExceeded { what: &'static str, limit: usize },

    #[error("Device error: {0}")]
    Device(InstrumentError),

    #[error("Control loop error: {0}")]
    Control(ControlError),

    #[error(transparent)]
    Rig(RigError),

    #[error(transparent)]
    Eis(EisError),

    #[error("Results storage error: {0}")]
    Results(#[from] ResultsError),

    #[error("Experiment cancelled")]
    Cancelled,
}

pub type RunResult<T> = Result<T, RunError>;

// Cancellation is folded into one variant no matter which layer observed the
// stop request, so callers match a single arm to tell user stops from faults.

impl From<InstrumentError> for RunError {
    fn from(err: InstrumentError) -> Self {
        match err {
            InstrumentError::Cancelled => RunError::Cancelled,
            other => RunError::Device(other),
        }
    }
}

impl From<ControlError> for RunError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Device(InstrumentError::Cancelled) => RunError::Cancelled,
            other => RunError::Control(other),
        }
    }
}

impl From<RigError> for RunError {
    fn from(err: RigError) -> Self {
        match err {
            RigError::Cancelled | RigError::Device(InstrumentError::Cancelled) => {
                RunError::Cancelled
            }
            other => RunError::Rig(other),
        }
    }
}

impl From<EisError> for RunError {
    fn from(err: EisError) -> Self {
        match err {
            EisError::Cancelled => RunError::Cancelled,
            other => RunError::Eis(other),
        }
    }
}
