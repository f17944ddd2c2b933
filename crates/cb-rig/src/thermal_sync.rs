//! Thermal-chamber synchronization: reach setpoint, then hold a stable dwell.
//!
//! Thermal readiness is advisory. A zone that never settles produces a warning
//! and a `TimedOutProceeding` result, not an error; only cancellation and
//! device failures abort.

use std::sync::Arc;

use cb_core::{CancelToken, Clock, sleep_cancellable};
use cb_instruments::{CommandPriority, ThermalChamber, ZoneReading};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{RigError, RigResult};

const CANCEL_TICK_S: f64 = 0.1;

/// Thermal synchronization configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalSettings {
    /// When false, both operations degrade to a fixed settling delay.
    pub enabled: bool,
    pub setpoint_c: f64,
    /// Per-zone tolerance around the setpoint (°C).
    pub tolerance_c: f64,
    pub poll_interval_s: f64,
    /// Overall bound for both waiting and stabilizing (s).
    pub wait_timeout_s: f64,
    /// Required in-tolerance hold time (s).
    pub dwell_s: f64,
    /// Settling delay used when temperature control is disabled (s).
    pub disabled_settle_s: f64,
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            setpoint_c: 25.0,
            tolerance_c: 1.0,
            poll_interval_s: 2.0,
            wait_timeout_s: 1800.0,
            dwell_s: 60.0,
            disabled_settle_s: 5.0,
        }
    }
}

/// Outcome of a synchronization step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalReadiness {
    Ready,
    /// The overall timeout elapsed; the experiment proceeds anyway.
    TimedOutProceeding,
}

/// Drives every chamber zone to the setpoint and confirms a stable dwell.
pub struct TemperatureSynchronizer {
    thermal: Arc<dyn ThermalChamber>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    settings: ThermalSettings,
}

impl TemperatureSynchronizer {
    pub fn new(
        thermal: Arc<dyn ThermalChamber>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
        settings: ThermalSettings,
    ) -> Self {
        Self {
            thermal,
            clock,
            cancel,
            settings,
        }
    }

    pub fn settings(&self) -> &ThermalSettings {
        &self.settings
    }

    /// Command every zone to the setpoint, start the chamber, and poll until
    /// all zones are within tolerance. Faulted zones count as out of
    /// tolerance.
    pub fn wait_for_setpoint(&self) -> RigResult<ThermalReadiness> {
        if !self.settings.enabled {
            return self.settle_without_control();
        }
        for zone in 0..self.thermal.zone_count() {
            self.thermal
                .set_setpoint_c(zone, self.settings.setpoint_c, CommandPriority::Normal)?;
        }
        self.thermal.set_running(true, CommandPriority::Normal)?;

        let deadline_s = self.clock.now_s() + self.settings.wait_timeout_s;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RigError::Cancelled);
            }
            let readings = self.thermal.read_zones(CommandPriority::Normal)?;
            if self.all_in_tolerance(&readings) {
                info!(
                    setpoint_c = self.settings.setpoint_c,
                    "all thermal zones at setpoint"
                );
                return Ok(ThermalReadiness::Ready);
            }
            if self.clock.now_s() >= deadline_s {
                warn!(
                    setpoint_c = self.settings.setpoint_c,
                    timeout_s = self.settings.wait_timeout_s,
                    "thermal zones did not reach setpoint; proceeding anyway"
                );
                return Ok(ThermalReadiness::TimedOutProceeding);
            }
            if !sleep_cancellable(
                self.clock.as_ref(),
                &self.cancel,
                self.settings.poll_interval_s,
                CANCEL_TICK_S,
            ) {
                return Err(RigError::Cancelled);
            }
        }
    }

    /// Hold until every zone stays within tolerance for the full dwell. Any
    /// zone drifting out restarts the dwell from zero.
    pub fn stabilize(&self) -> RigResult<ThermalReadiness> {
        if !self.settings.enabled {
            return self.settle_without_control();
        }
        let deadline_s = self.clock.now_s() + self.settings.wait_timeout_s;
        let mut dwell_start_s = self.clock.now_s();
        loop {
            if self.cancel.is_cancelled() {
                return Err(RigError::Cancelled);
            }
            let readings = self.thermal.read_zones(CommandPriority::Normal)?;
            let now_s = self.clock.now_s();
            if !self.all_in_tolerance(&readings) {
                dwell_start_s = now_s;
            } else if now_s - dwell_start_s >= self.settings.dwell_s {
                return Ok(ThermalReadiness::Ready);
            }
            if now_s >= deadline_s {
                warn!(
                    dwell_s = self.settings.dwell_s,
                    "thermal dwell did not complete before timeout; proceeding anyway"
                );
                return Ok(ThermalReadiness::TimedOutProceeding);
            }
            if !sleep_cancellable(
                self.clock.as_ref(),
                &self.cancel,
                self.settings.poll_interval_s,
                CANCEL_TICK_S,
            ) {
                return Err(RigError::Cancelled);
            }
        }
    }

    fn all_in_tolerance(&self, readings: &[ZoneReading]) -> bool {
        readings.iter().all(|zone| {
            !zone.fault && (zone.temp_c - self.settings.setpoint_c).abs() <= self.settings.tolerance_c
        })
    }

    fn settle_without_control(&self) -> RigResult<ThermalReadiness> {
        if !sleep_cancellable(
            self.clock.as_ref(),
            &self.cancel,
            self.settings.disabled_settle_s,
            CANCEL_TICK_S,
        ) {
            return Err(RigError::Cancelled);
        }
        Ok(ThermalReadiness::Ready)
    }
}
