//! cb-instruments: the synchronous instrument contract for cellbench.
//!
//! Every instrument on the bench (power source, potentiostat, thermal chamber,
//! relay matrix) sits behind an external priority command queue; the engine sees
//! only the narrow blocking traits defined here. Commands carry a
//! [`CommandPriority`] so safety-critical operations (output disables, relay
//! opens during shutdown) jump the queue ahead of routine polling.
//!
//! [`mock`] provides a deterministic simulated bench driven by an injected
//! clock, used by the integration tests and the CLI demo mode.

pub mod bench;
pub mod error;
pub mod mock;
pub mod potentiostat;
pub mod relay;
pub mod source;
pub mod thermal;
pub mod types;

pub use bench::Bench;
pub use error::{InstrumentError, InstrumentResult};
pub use potentiostat::{GeisConfig, OcvConfig, Potentiostat};
pub use relay::RelayMatrix;
pub use source::PowerSource;
pub use thermal::ThermalChamber;
pub use types::{CommandPriority, SourceStatus, SweepRecord, ZoneReading};
