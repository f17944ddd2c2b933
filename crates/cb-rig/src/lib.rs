//! cb-rig: rig-level safety protocols.
//!
//! - [`DeviceSwitch`]: mutually-exclusive relay hand-off between the power
//!   source and the potentiostat.
//! - [`TemperatureSynchronizer`]: drive thermal zones to setpoint and confirm
//!   a stable dwell. Advisory: a timeout warns and proceeds.

pub mod error;
pub mod switch;
pub mod thermal_sync;

pub use error::{RigError, RigResult};
pub use switch::{ActiveInstrument, DeviceSwitch, RELAY_SETTLE_S, SwitchPins};
pub use thermal_sync::{TemperatureSynchronizer, ThermalReadiness, ThermalSettings};
