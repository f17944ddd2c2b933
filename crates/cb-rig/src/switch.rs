//! Mutually-exclusive instrument hand-off over the relay matrix.
//!
//! The power source and the potentiostat share one pair of cell terminals;
//! closing both relays at once would connect two drive circuits to the same
//! battery. [`DeviceSwitch`] serializes every hand-off as: disable the
//! abandoned output, open every non-target relay, settle, close the target
//! relay, settle. A close command is never issued before the opposite open
//! command has returned.

use std::sync::Arc;

use cb_core::{CancelToken, Clock, sleep_cancellable};
use cb_instruments::{CommandPriority, PowerSource, RelayMatrix};
use tracing::warn;

use crate::error::{RigError, RigResult};

/// Relay settle time after every topology change (s).
pub const RELAY_SETTLE_S: f64 = 1.0;

const CANCEL_TICK_S: f64 = 0.1;

/// Which instrument currently owns the cell terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveInstrument {
    #[default]
    None,
    Source,
    Potentiostat,
}

/// Relay-matrix wiring of the two instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchPins {
    pub source_pin: usize,
    pub potentiostat_pin: usize,
}

/// Stateful hand-off protocol between the power source and the potentiostat.
pub struct DeviceSwitch {
    relays: Arc<dyn RelayMatrix>,
    source: Arc<dyn PowerSource>,
    clock: Arc<dyn Clock>,
    pins: SwitchPins,
    active: ActiveInstrument,
}

impl DeviceSwitch {
    pub fn new(
        relays: Arc<dyn RelayMatrix>,
        source: Arc<dyn PowerSource>,
        clock: Arc<dyn Clock>,
        pins: SwitchPins,
    ) -> RigResult<Self> {
        if pins.source_pin == pins.potentiostat_pin {
            return Err(RigError::InvalidArg {
                what: "source and potentiostat must use distinct relay pins",
            });
        }
        Ok(Self {
            relays,
            source,
            clock,
            pins,
            active: ActiveInstrument::None,
        })
    }

    pub fn active(&self) -> ActiveInstrument {
        self.active
    }

    /// Hand the cell terminals to `target`.
    ///
    /// If cancellation is observed before the target relay close, the call
    /// stops in the all-open safe state and returns `Cancelled`; the opens and
    /// the output disable still go out (they move the rig toward safety).
    pub fn switch_to(&mut self, target: ActiveInstrument, cancel: &CancelToken) -> RigResult<()> {
        if self.active == target {
            return Ok(());
        }

        // Never move a relay under load: kill the source output first when
        // the source is being abandoned.
        if self.active == ActiveInstrument::Source {
            let priority = if cancel.is_cancelled() {
                CommandPriority::High
            } else {
                CommandPriority::Normal
            };
            match self.source.set_output_enabled(false, priority) {
                Ok(()) => {}
                Err(err) if cancel.is_cancelled() => {
                    warn!("output disable failed during cancelled hand-off: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let target_pin = match target {
            ActiveInstrument::None => None,
            ActiveInstrument::Source => Some(self.pins.source_pin),
            ActiveInstrument::Potentiostat => Some(self.pins.potentiostat_pin),
        };

        for pin in [self.pins.source_pin, self.pins.potentiostat_pin] {
            if Some(pin) != target_pin {
                self.relays.set_pin(pin, false, CommandPriority::Normal)?;
            }
        }
        self.active = ActiveInstrument::None;

        let Some(pin) = target_pin else {
            return Ok(());
        };

        if !sleep_cancellable(self.clock.as_ref(), cancel, RELAY_SETTLE_S, CANCEL_TICK_S) {
            return Err(RigError::Cancelled);
        }
        // A close is a control command, not a safety command; it is refused
        // once cancellation is set.
        if cancel.is_cancelled() {
            return Err(RigError::Cancelled);
        }
        self.relays.set_pin(pin, true, CommandPriority::Normal)?;
        self.active = target;
        if !sleep_cancellable(self.clock.as_ref(), cancel, RELAY_SETTLE_S, CANCEL_TICK_S) {
            return Err(RigError::Cancelled);
        }
        Ok(())
    }

    /// Cleanup path: output off, then every relay open, all at high priority.
    /// Attempts every step even if an earlier one fails; the first failure is
    /// returned.
    pub fn disconnect_all(&mut self) -> RigResult<()> {
        let mut first_err: Option<RigError> = None;
        if let Err(err) = self
            .source
            .set_output_enabled(false, CommandPriority::High)
        {
            first_err.get_or_insert(err.into());
        }
        for pin in [self.pins.source_pin, self.pins.potentiostat_pin] {
            if let Err(err) = self.relays.set_pin(pin, false, CommandPriority::High) {
                first_err.get_or_insert(err.into());
            }
        }
        self.active = ActiveInstrument::None;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use cb_core::TestClock;
    use cb_instruments::mock::{POTENTIOSTAT_PIN, SOURCE_PIN, SimBench, SimCellSpec};

    use super::*;

    fn rig() -> (SimBench, DeviceSwitch, CancelToken) {
        let clock = Arc::new(TestClock::new());
        let sim = SimBench::new(SimCellSpec::default(), clock.clone());
        let bench = sim.bench();
        let switch = DeviceSwitch::new(
            bench.relays.clone(),
            bench.source.clone(),
            clock,
            SwitchPins {
                source_pin: SOURCE_PIN,
                potentiostat_pin: POTENTIOSTAT_PIN,
            },
        )
        .unwrap();
        (sim, switch, CancelToken::new())
    }

    #[test]
    fn switching_connects_only_the_target() {
        let (sim, mut switch, cancel) = rig();
        assert_eq!(switch.active(), ActiveInstrument::None);

        switch.switch_to(ActiveInstrument::Source, &cancel).unwrap();
        assert_eq!(switch.active(), ActiveInstrument::Source);
        assert!(sim.pin_closed(SOURCE_PIN));
        assert!(!sim.pin_closed(POTENTIOSTAT_PIN));

        switch
            .switch_to(ActiveInstrument::Potentiostat, &cancel)
            .unwrap();
        assert_eq!(switch.active(), ActiveInstrument::Potentiostat);
        assert!(!sim.pin_closed(SOURCE_PIN));
        assert!(sim.pin_closed(POTENTIOSTAT_PIN));
    }

    #[test]
    fn hand_off_order_is_disable_open_close() {
        let (sim, mut switch, cancel) = rig();
        switch.switch_to(ActiveInstrument::Source, &cancel).unwrap();
        sim.clear_commands();

        switch
            .switch_to(ActiveInstrument::Potentiostat, &cancel)
            .unwrap();
        let commands = sim.commands();
        let disable = commands
            .iter()
            .position(|c| c.command.starts_with("set_output_enabled false"))
            .unwrap();
        let open = commands
            .iter()
            .position(|c| c.command == format!("set_pin {SOURCE_PIN} closed=false"))
            .unwrap();
        let close = commands
            .iter()
            .position(|c| c.command == format!("set_pin {POTENTIOSTAT_PIN} closed=true"))
            .unwrap();
        assert!(disable < open);
        assert!(open < close);
    }

    #[test]
    fn relays_are_never_closed_simultaneously() {
        let (sim, mut switch, cancel) = rig();
        switch.switch_to(ActiveInstrument::Source, &cancel).unwrap();
        switch
            .switch_to(ActiveInstrument::Potentiostat, &cancel)
            .unwrap();
        switch.switch_to(ActiveInstrument::Source, &cancel).unwrap();
        switch.switch_to(ActiveInstrument::None, &cancel).unwrap();
        assert!(!sim.simultaneous_connection_seen());
    }

    #[test]
    fn switching_to_the_active_instrument_is_a_no_op() {
        let (sim, mut switch, cancel) = rig();
        switch.switch_to(ActiveInstrument::Source, &cancel).unwrap();
        sim.clear_commands();
        switch.switch_to(ActiveInstrument::Source, &cancel).unwrap();
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn cancelled_hand_off_stops_in_the_all_open_state() {
        let (sim, mut switch, cancel) = rig();
        switch.switch_to(ActiveInstrument::Source, &cancel).unwrap();
        cancel.cancel();

        let err = switch
            .switch_to(ActiveInstrument::Potentiostat, &cancel)
            .unwrap_err();
        assert!(matches!(err, RigError::Cancelled));
        assert!(!sim.pin_closed(SOURCE_PIN));
        assert!(!sim.pin_closed(POTENTIOSTAT_PIN));
        assert_eq!(switch.active(), ActiveInstrument::None);
        // The abandoned source was still disabled, at high priority.
        let disable = sim
            .commands()
            .into_iter()
            .filter(|c| c.command.starts_with("set_output_enabled false"))
            .next_back()
            .unwrap();
        assert_eq!(disable.priority, CommandPriority::High);
    }

    #[test]
    fn disconnect_all_opens_everything_at_high_priority() {
        let (sim, mut switch, cancel) = rig();
        switch.switch_to(ActiveInstrument::Source, &cancel).unwrap();
        sim.clear_commands();

        switch.disconnect_all().unwrap();
        assert!(!sim.pin_closed(SOURCE_PIN));
        assert!(!sim.pin_closed(POTENTIOSTAT_PIN));
        assert!(!sim.output_enabled());
        assert_eq!(switch.active(), ActiveInstrument::None);
        assert!(
            sim.commands()
                .iter()
                .all(|c| c.priority == CommandPriority::High)
        );
    }

    #[test]
    fn shared_pin_wiring_is_rejected() {
        let clock = Arc::new(TestClock::new());
        let sim = SimBench::new(SimCellSpec::default(), clock.clone());
        let bench = sim.bench();
        let result = DeviceSwitch::new(
            bench.relays,
            bench.source,
            clock,
            SwitchPins {
                source_pin: 3,
                potentiostat_pin: 3,
            },
        );
        assert!(matches!(result, Err(RigError::InvalidArg { .. })));
    }
}
