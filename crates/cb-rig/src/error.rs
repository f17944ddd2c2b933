//! Error types for rig-level protocols.

use cb_instruments::InstrumentError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Invalid rig configuration: {what}")]
    InvalidArg { what: &'static str },

    #[error("Device error during rig operation: {0}")]
    Device(#[from] InstrumentError),

    /// Cancellation observed while a protocol step was pending.
    #[error("Rig operation cancelled")]
    Cancelled,
}

pub type RigResult<T> = Result<T, RigError>;
