//! Error types for instrument operations.

use thiserror::Error;

/// Errors surfaced by the instrument command queues.
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// The queue or the instrument behind it failed to execute a command.
    #[error("Device communication error: {message}")]
    Comm { message: String },

    #[error("Invalid instrument configuration: {what}")]
    InvalidConfig { what: &'static str },

    /// A blocking call observed the cancellation token and aborted mid-flight.
    #[error("Instrument call cancelled")]
    Cancelled,
}

pub type InstrumentResult<T> = Result<T, InstrumentError>;
