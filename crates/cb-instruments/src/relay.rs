//! Relay matrix contract.

use crate::error::InstrumentResult;
use crate::types::CommandPriority;

/// Bank of independently addressable relays.
///
/// Pin numbering is rig wiring, not instrument channel numbering; the
/// switching logic in the rig layer owns the assignment.
pub trait RelayMatrix: Send + Sync {
    fn set_pin(&self, pin: usize, closed: bool, priority: CommandPriority) -> InstrumentResult<()>;
}
