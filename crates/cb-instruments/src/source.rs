//! Programmable power source contract.

use crate::error::InstrumentResult;
use crate::types::{CommandPriority, SourceStatus};

/// Bidirectional programmable source/sink, as exposed by its command queue.
///
/// All calls are synchronous and may block while queued behind other commands.
/// Implementations must be shareable across threads; interior mutability is the
/// implementation's concern.
pub trait PowerSource: Send + Sync {
    fn status(&self, priority: CommandPriority) -> InstrumentResult<SourceStatus>;

    /// Program the voltage limit (CV level) in volts.
    fn set_voltage(&self, volts: f64, priority: CommandPriority) -> InstrumentResult<()>;

    /// Program the source (charge) current limit in amps.
    fn set_current(&self, amps: f64, priority: CommandPriority) -> InstrumentResult<()>;

    /// Program the sink (discharge) current limit in amps.
    fn set_sink_current(&self, amps: f64, priority: CommandPriority) -> InstrumentResult<()>;

    /// Program the source power limit in watts.
    fn set_power(&self, watts: f64, priority: CommandPriority) -> InstrumentResult<()>;

    /// Program the sink power limit in watts.
    fn set_sink_power(&self, watts: f64, priority: CommandPriority) -> InstrumentResult<()>;

    fn set_output_enabled(&self, enabled: bool, priority: CommandPriority)
    -> InstrumentResult<()>;
}
