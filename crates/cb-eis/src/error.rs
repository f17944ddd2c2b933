//! Error types for impedance scheduling.

use cb_instruments::InstrumentError;
use cb_rig::RigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EisError {
    #[error("Invalid scheduler argument: {what}")]
    InvalidArg { what: &'static str },

    /// A source, relay, or thermal command failed.
    #[error("Device error during impedance scheduling: {0}")]
    Device(InstrumentError),

    #[error(transparent)]
    Rig(RigError),

    /// A bounded list (checkpoint schedule or measurement storage) is full.
    #[error("Storage for {what} is full ({limit} entries)")]
    CapacityExceeded { what: &'static str, limit: usize },

    /// A sweep record came back without a column the extraction needs.
    #[error("Sweep record is missing the '{column}' column")]
    MalformedSweep { column: &'static str },

    #[error("Impedance operation cancelled")]
    Cancelled,
}

pub type EisResult<T> = Result<T, EisError>;

// Cancellation is folded into one variant regardless of which layer observed
// it, so callers match a single arm to distinguish stop requests from faults.

impl From<InstrumentError> for EisError {
    fn from(err: InstrumentError) -> Self {
        match err {
            InstrumentError::Cancelled => EisError::Cancelled,
            other => EisError::Device(other),
        }
    }
}

impl From<RigError> for EisError {
    fn from(err: RigError) -> Self {
        match err {
            RigError::Cancelled => EisError::Cancelled,
            other => EisError::Rig(other),
        }
    }
}
