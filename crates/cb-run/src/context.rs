//! Run state machine and accumulated run state.

use std::fmt;
use std::mem;

use cb_results::aggregate::RunTotals;
use cb_results::{EisMeasurement, PhaseResult, SeriesSample};
use tracing::debug;

use crate::error::{RunError, RunResult};
use crate::params::ExperimentParams;

/// Phases of a characterization run, in execution order.
///
/// The derived ordering *is* the transition rule: a run only ever moves
/// forward, except for the Phase-3 pair which toggles while checkpoints
/// interleave with charging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExperimentPhase {
    Setup,
    Phase1Discharge,
    Phase1TempWait,
    Phase1TempStabilize,
    Phase2Charge,
    Phase2Discharge,
    Phase3Setup,
    Phase3Charging,
    Phase3EisMeasurement,
    Phase4Discharge,
    Completed,
    Error,
    Cancelled,
}

impl ExperimentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Stable label used for series files and phase results.
    pub fn label(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Phase1Discharge => "phase1_discharge",
            Self::Phase1TempWait => "phase1_temp_wait",
            Self::Phase1TempStabilize => "phase1_temp_stabilize",
            Self::Phase2Charge => "phase2_charge",
            Self::Phase2Discharge => "phase2_discharge",
            Self::Phase3Setup => "phase3_setup",
            Self::Phase3Charging => "phase3_charging",
            Self::Phase3EisMeasurement => "phase3_eis_measurement",
            Self::Phase4Discharge => "phase4_discharge",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(self, to: ExperimentPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to.is_terminal() {
            return true;
        }
        // Checkpoints pause and resume the Phase-3 charge.
        if matches!(
            (self, to),
            (Self::Phase3Charging, Self::Phase3EisMeasurement)
                | (Self::Phase3EisMeasurement, Self::Phase3Charging)
        ) {
            return true;
        }
        to > self
    }
}

impl fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Mutable state threaded through the phases of one run.
///
/// Impedance measurements are held in a pre-sized list; series rows are
/// buffered here and drained to the store at phase boundaries.
pub struct ExperimentContext {
    pub params: ExperimentParams,
    pub run_id: String,
    pub started_at: String,
    pub phases: Vec<PhaseResult>,
    pub totals: RunTotals,
    phase: ExperimentPhase,
    measurements: Vec<EisMeasurement>,
    measurement_limit: usize,
    series: Vec<SeriesSample>,
    last_series_elapsed_s: Option<f64>,
}

impl ExperimentContext {
    pub fn new(params: ExperimentParams, run_id: String, started_at: String) -> Self {
        // Every scheduled target, a final capture past each of them, plus the
        // dynamic allowance. Mirrors the scheduler's own bound.
        let measurement_limit =
            (100.0 / params.eis_interval_pct).ceil() as usize + 1 + params.max_dynamic_targets + 1;
        Self {
            params,
            run_id,
            started_at,
            phases: Vec::new(),
            totals: RunTotals::default(),
            phase: ExperimentPhase::Setup,
            measurements: Vec::with_capacity(measurement_limit),
            measurement_limit,
            series: Vec::new(),
            last_series_elapsed_s: None,
        }
    }

    pub fn phase(&self) -> ExperimentPhase {
        self.phase
    }

    /// Move to `to`, rejecting anything but a legal forward (or Phase-3
    /// toggle) step.
    pub fn transition(&mut self, to: ExperimentPhase) -> RunResult<()> {
        if !self.phase.can_transition_to(to) {
            return Err(RunError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        debug!(from = %self.phase, to = %to, "phase transition");
        self.phase = to;
        Ok(())
    }

    pub fn record_measurement(&mut self, measurement: EisMeasurement) -> RunResult<()> {
        if self.measurements.len() >= self.measurement_limit {
            return Err(RunError::CapacityExceeded {
                what: "impedance measurements",
                limit: self.measurement_limit,
            });
        }
        self.measurements.push(measurement);
        Ok(())
    }

    pub fn measurements(&self) -> &[EisMeasurement] {
        &self.measurements
    }

    /// Cadence gate for series logging. Returns true (and commits the
    /// timestamp) when at least `log_interval_s` has passed since the last
    /// accepted row; the first row of a drained stretch always passes.
    pub fn series_due(&mut self, elapsed_s: f64) -> bool {
        let due = match self.last_series_elapsed_s {
            None => true,
            Some(last) => elapsed_s - last >= self.params.log_interval_s,
        };
        if due {
            self.last_series_elapsed_s = Some(elapsed_s);
        }
        due
    }

    pub fn push_series(&mut self, row: SeriesSample) {
        self.series.push(row);
    }

    /// Drain buffered series rows and reset the cadence gate.
    pub fn take_series(&mut self) -> Vec<SeriesSample> {
        self.last_series_elapsed_s = None;
        mem::take(&mut self.series)
    }
}
