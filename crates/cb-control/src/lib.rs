//! cb-control: closed-loop control primitives for one power source.
//!
//! - [`SourceController`]: drive-to-voltage and capacity-transfer polling
//!   loops with cooperative cancellation and wall-clock timeouts.
//! - [`CoulombCounter`]: trapezoidal capacity/energy integration.
//!
//! The controller is a leaf: it knows the [`PowerSource`](cb_instruments::PowerSource)
//! contract and nothing about phases, checkpoints, or persistence.

pub mod error;
pub mod integrator;
pub mod loops;

pub use error::{ControlError, ControlResult};
pub use integrator::{CoulombCounter, Direction};
pub use loops::{
    Completion, ControlOutcome, ControlParams, LoopOptions, LoopSample, MIN_POLL_INTERVAL_S,
    SourceController, VOLTAGE_BAND_V,
};
