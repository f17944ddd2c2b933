//! Thermal chamber contract.

use crate::error::InstrumentResult;
use crate::types::{CommandPriority, ZoneReading};

/// Multi-zone thermal controller behind its command queue.
pub trait ThermalChamber: Send + Sync {
    /// Number of physical zones the chamber exposes.
    fn zone_count(&self) -> usize;

    fn set_setpoint_c(
        &self,
        zone: usize,
        setpoint_c: f64,
        priority: CommandPriority,
    ) -> InstrumentResult<()>;

    /// Start or stop the chamber's control loop.
    fn set_running(&self, running: bool, priority: CommandPriority) -> InstrumentResult<()>;

    /// Read every zone in one queued command.
    fn read_zones(&self, priority: CommandPriority) -> InstrumentResult<Vec<ZoneReading>>;
}
