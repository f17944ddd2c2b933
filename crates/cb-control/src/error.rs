//! Error types for closed-loop control.

use cb_core::CbError;
use cb_instruments::InstrumentError;
use thiserror::Error;

/// Errors surfaced by the control loops.
///
/// Expected terminal conditions (timeout, cancellation-induced abort, current
/// threshold reached) are not errors; they are [`Completion`](crate::Completion)
/// codes in a successful outcome. Only parameter rejection and device failures
/// come back as `Err`.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Invalid control parameter: {0}")]
    InvalidArg(#[from] CbError),

    #[error("Device error during control loop: {0}")]
    Device(#[from] InstrumentError),
}

pub type ControlResult<T> = Result<T, ControlError>;
