//! Checkpointed charge: the charge loop that pauses at scheduled SOCs for
//! impedance captures.
//!
//! Per poll, in order: cancellation check, wall-clock timeout check, one
//! blocking status read, trapezoidal integration, tracked-SOC update (with
//! upward capacity revision), safety-ceiling check, checkpoint check, schedule
//! extension, debounced current-threshold termination, progress event,
//! cooperative sleep. A checkpoint pause disables the output, hands the cell
//! to the potentiostat, captures, hands back, reprograms the source, and
//! reseeds the integrator so the pause contributes no capacity increment.

use std::fmt;
use std::sync::Arc;

use cb_control::{CoulombCounter, Direction, LoopOptions, MIN_POLL_INTERVAL_S};
use cb_core::{CancelToken, Clock, sleep_cancellable};
use cb_instruments::{Bench, CommandPriority};
use cb_results::{EisMeasurement, TemperatureSample};
use cb_rig::{ActiveInstrument, DeviceSwitch};
use tracing::{debug, info, warn};

use crate::capture::{CaptureConfig, EisCapture};
use crate::error::{EisError, EisResult};
use crate::targets::TargetSchedule;

/// Band below a target SOC within which its checkpoint fires (%).
pub const SOC_CHECKPOINT_TOLERANCE_PCT: f64 = 1.0;

/// The forced final capture is skipped when the last stored measurement is
/// already within this window of the final SOC (%).
pub const FORCED_FINAL_SKIP_PCT: f64 = 2.0 * SOC_CHECKPOINT_TOLERANCE_PCT;

/// Tracked SOC above this revises the capacity estimate upward (%).
pub const CAPACITY_REVISION_TRIGGER_PCT: f64 = 110.0;

/// Consecutive below-threshold polls required to end the charge.
pub const TERMINATION_DEBOUNCE_SAMPLES: u32 = 3;

/// Granularity at which sleeps observe the cancellation token (s).
const CANCEL_TICK_S: f64 = 0.1;

/// Inputs to the checkpointed charge phase. Read-only to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeParams {
    /// CV level for the charge (V).
    pub charge_voltage_v: f64,
    /// CC limit for the charge (A).
    pub charge_current_a: f64,
    /// Current magnitude below which the charge is considered complete (A).
    pub current_threshold_a: f64,
    /// Initial battery-capacity estimate, normally the measured charge
    /// capacity of the conditioning cycle (mAh).
    pub estimated_capacity_mah: f64,
    /// Tracked SOC above which the phase is aborted outright (%).
    pub soc_safety_ceiling_pct: f64,
    /// Wall-clock deadline for the whole phase (s).
    pub timeout_s: f64,
}

/// How the checkpointed charge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeCompletion {
    /// Current stayed below threshold for the full debounce window.
    Completed,
    Timeout,
    /// Cancellation observed mid-phase.
    Aborted,
    /// Tracked SOC exceeded the configured safety ceiling.
    SafetyCeiling,
}

impl fmt::Display for ChargeCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChargeCompletion::Completed => "completed",
            ChargeCompletion::Timeout => "timeout",
            ChargeCompletion::Aborted => "aborted",
            ChargeCompletion::SafetyCeiling => "safety ceiling exceeded",
        })
    }
}

/// Result of the charge phase, written once at loop exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeOutcome {
    pub completion: ChargeCompletion,
    /// Capacity accumulated across the phase, pauses excluded (mAh).
    pub capacity_mah: f64,
    pub energy_wh: f64,
    pub elapsed_s: f64,
    /// Final capacity estimate after any revisions (mAh).
    pub estimated_capacity_mah: f64,
    /// Tracked SOC when the loop ended (%).
    pub final_soc_pct: f64,
    pub start_voltage_v: f64,
    pub end_voltage_v: f64,
}

/// Progress events emitted while the charge runs.
#[derive(Debug, Clone)]
pub enum ChargeEvent {
    /// One poll of the charge loop.
    Sample {
        elapsed_s: f64,
        voltage_v: f64,
        current_a: f64,
        soc_pct: f64,
        capacity_mah: f64,
    },
    CheckpointStarted {
        target_soc_pct: f64,
        actual_soc_pct: f64,
    },
    CheckpointCompleted { measurement: EisMeasurement },
    /// Retries exhausted; charging continues without this checkpoint.
    CheckpointFailed {
        target_soc_pct: f64,
        error: String,
    },
    /// The schedule grew past 100% because charge current was still flowing.
    ScheduleExtended { new_target_pct: f64 },
    /// Capacity estimate revised upward after tracked SOC exceeded the
    /// revision trigger.
    CapacityRevised { estimated_capacity_mah: f64 },
}

/// Runs the charge phase of a characterization: bulk charge with impedance
/// checkpoints at scheduled SOCs, dynamic schedule extension, and a forced
/// final capture.
pub struct EisScheduler {
    bench: Bench,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    options: LoopOptions,
    schedule: TargetSchedule,
    capture: EisCapture,
    measurements: Vec<EisMeasurement>,
    measurement_limit: usize,
    run_start_s: f64,
}

impl EisScheduler {
    /// `run_start_s` anchors recorded elapsed times to the run epoch.
    pub fn new(
        bench: Bench,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
        schedule: TargetSchedule,
        capture_config: CaptureConfig,
        options: LoopOptions,
        run_start_s: f64,
    ) -> Self {
        let options = LoopOptions {
            poll_interval_s: options.poll_interval_s.max(MIN_POLL_INTERVAL_S),
            stabilize_delay_s: options.stabilize_delay_s.max(0.0),
        };
        // Room for every seeded target, every possible dynamic target, and
        // the forced final capture.
        let measurement_limit = schedule.targets_pct().len() + schedule.max_dynamic() + 1;
        let capture = EisCapture::new(
            bench.potentiostat.clone(),
            clock.clone(),
            cancel.clone(),
            capture_config,
        );
        Self {
            bench,
            clock,
            cancel,
            options,
            schedule,
            capture,
            measurements: Vec::with_capacity(measurement_limit),
            measurement_limit,
            run_start_s,
        }
    }

    /// Measurements stored so far, in capture order.
    pub fn measurements(&self) -> &[EisMeasurement] {
        &self.measurements
    }

    pub fn into_measurements(self) -> Vec<EisMeasurement> {
        self.measurements
    }

    pub fn schedule(&self) -> &TargetSchedule {
        &self.schedule
    }

    /// Capture the 0% SOC measurement before any charging.
    ///
    /// Consumes the first scheduled target and leaves the potentiostat
    /// connected; [`EisScheduler::run_charge`] hands back to the source. A
    /// capture that exhausts its retries is logged and skipped; only
    /// cancellation and hand-off failures abort.
    pub fn initial_capture(
        &mut self,
        switch: &mut DeviceSwitch,
        mut events: Option<&mut dyn FnMut(ChargeEvent)>,
    ) -> EisResult<()> {
        let Some(target) = self.schedule.next_target() else {
            return Err(EisError::InvalidArg {
                what: "checkpoint schedule is empty",
            });
        };
        if self.cancel.is_cancelled() {
            return Err(EisError::Cancelled);
        }
        switch.switch_to(ActiveInstrument::Potentiostat, &self.cancel)?;
        self.capture_checkpoint(target, 0.0, &mut events)?;
        self.schedule.advance();
        Ok(())
    }

    /// Charge with impedance checkpoints until debounced current-threshold
    /// termination, timeout, cancellation, or the SOC safety ceiling.
    pub fn run_charge(
        &mut self,
        switch: &mut DeviceSwitch,
        params: &ChargeParams,
        mut events: Option<&mut dyn FnMut(ChargeEvent)>,
    ) -> EisResult<ChargeOutcome> {
        validate_params(params)?;
        if self.cancel.is_cancelled() {
            return Ok(aborted_before_start(params));
        }

        switch.switch_to(ActiveInstrument::Source, &self.cancel)?;
        let status = self.bench.source.status(CommandPriority::Normal)?;
        let start_voltage_v = status.voltage_v;
        self.program_and_enable(params)?;
        sleep_cancellable(
            self.clock.as_ref(),
            &self.cancel,
            self.options.stabilize_delay_s,
            CANCEL_TICK_S,
        );

        let t0 = self.clock.now_s();
        let mut counter = CoulombCounter::new(Direction::Charge);
        let mut estimated_mah = params.estimated_capacity_mah;
        let mut revisions: u32 = 0;
        let mut below_threshold_streak: u32 = 0;
        let mut extension_ceiling_logged = false;
        let mut soc_pct = 0.0;
        let mut end_voltage_v = start_voltage_v;

        let mut completion = loop {
            if self.cancel.is_cancelled() {
                break ChargeCompletion::Aborted;
            }
            if self.clock.now_s() - t0 >= params.timeout_s {
                break ChargeCompletion::Timeout;
            }
            let status = match self.bench.source.status(CommandPriority::Normal) {
                Ok(status) => status,
                Err(err) => {
                    self.disable_output_best_effort();
                    return Err(err.into());
                }
            };
            let now_s = self.clock.now_s();
            end_voltage_v = status.voltage_v;
            counter.observe(now_s, status.voltage_v, status.current_a);

            soc_pct = (counter.capacity_mah() / estimated_mah * 100.0).max(0.0);
            if soc_pct > CAPACITY_REVISION_TRIGGER_PCT {
                // The estimate was too low: accept the accumulated charge as
                // the new reference. The revised estimate is always larger
                // than the previous one, so tracked SOC never jumps upward.
                estimated_mah = counter.capacity_mah() * (100.0 / CAPACITY_REVISION_TRIGGER_PCT);
                soc_pct = CAPACITY_REVISION_TRIGGER_PCT;
                revisions += 1;
                if revisions == 1 {
                    warn!(
                        estimated_capacity_mah = estimated_mah,
                        "tracked SOC exceeded revision trigger, revising capacity estimate upward"
                    );
                } else {
                    debug!(
                        estimated_capacity_mah = estimated_mah,
                        revisions, "capacity estimate revised again"
                    );
                }
                emit(
                    &mut events,
                    ChargeEvent::CapacityRevised {
                        estimated_capacity_mah: estimated_mah,
                    },
                );
            }
            if soc_pct > params.soc_safety_ceiling_pct {
                warn!(
                    soc_pct,
                    ceiling_pct = params.soc_safety_ceiling_pct,
                    "SOC safety ceiling exceeded, aborting charge"
                );
                break ChargeCompletion::SafetyCeiling;
            }

            if let Some(target) = self.schedule.next_target() {
                if soc_pct >= target - SOC_CHECKPOINT_TOLERANCE_PCT {
                    match self.checkpoint_pause(switch, params, target, soc_pct, &mut events) {
                        Ok(()) => {
                            // The pause must not integrate as charge time.
                            counter.reseed();
                            below_threshold_streak = 0;
                            continue;
                        }
                        Err(EisError::Cancelled) => break ChargeCompletion::Aborted,
                        Err(err) => {
                            self.disable_output_best_effort();
                            return Err(err);
                        }
                    }
                }
            }

            let below_threshold = status.current_a.abs() < params.current_threshold_a;
            if self.schedule.next_target().is_none() && !below_threshold {
                if self.schedule.can_extend() {
                    let new_target_pct = self.schedule.extend_beyond_full()?;
                    if self.schedule.dynamic_count() == 1 {
                        info!(
                            new_target_pct,
                            "charge current still above threshold past the last checkpoint, extending schedule"
                        );
                    } else {
                        debug!(new_target_pct, "schedule extended again");
                    }
                    emit(&mut events, ChargeEvent::ScheduleExtended { new_target_pct });
                } else if !extension_ceiling_logged {
                    extension_ceiling_logged = true;
                    warn!(
                        max_dynamic = self.schedule.max_dynamic(),
                        "dynamic checkpoint bound reached, charging on without further checkpoints"
                    );
                }
            }

            if below_threshold {
                below_threshold_streak += 1;
                if below_threshold_streak >= TERMINATION_DEBOUNCE_SAMPLES {
                    break ChargeCompletion::Completed;
                }
            } else {
                below_threshold_streak = 0;
            }

            emit(
                &mut events,
                ChargeEvent::Sample {
                    elapsed_s: now_s - t0,
                    voltage_v: status.voltage_v,
                    current_a: status.current_a,
                    soc_pct,
                    capacity_mah: counter.capacity_mah(),
                },
            );
            sleep_cancellable(
                self.clock.as_ref(),
                &self.cancel,
                self.options.poll_interval_s,
                CANCEL_TICK_S,
            );
        };

        let disable_priority = match completion {
            ChargeCompletion::Aborted | ChargeCompletion::SafetyCeiling => CommandPriority::High,
            _ => CommandPriority::Normal,
        };
        self.bench
            .source
            .set_output_enabled(false, disable_priority)?;

        if completion == ChargeCompletion::Completed {
            match self.forced_final_capture(switch, soc_pct, &mut events) {
                Ok(()) => {}
                Err(EisError::Cancelled) => completion = ChargeCompletion::Aborted,
                Err(err) => return Err(err),
            }
        }

        info!(
            completion = %completion,
            capacity_mah = counter.capacity_mah(),
            estimated_capacity_mah = estimated_mah,
            final_soc_pct = soc_pct,
            checkpoints = self.measurements.len(),
            "checkpointed charge finished"
        );
        Ok(ChargeOutcome {
            completion,
            capacity_mah: counter.capacity_mah(),
            energy_wh: counter.energy_wh(),
            elapsed_s: self.clock.now_s() - t0,
            estimated_capacity_mah: estimated_mah,
            final_soc_pct: soc_pct,
            start_voltage_v,
            end_voltage_v,
        })
    }

    /// Pause charging, hand off, capture, hand back, resume charging.
    fn checkpoint_pause(
        &mut self,
        switch: &mut DeviceSwitch,
        params: &ChargeParams,
        target_soc_pct: f64,
        actual_soc_pct: f64,
        events: &mut Option<&mut dyn FnMut(ChargeEvent)>,
    ) -> EisResult<()> {
        self.bench
            .source
            .set_output_enabled(false, CommandPriority::Normal)?;
        switch.switch_to(ActiveInstrument::Potentiostat, &self.cancel)?;
        self.capture_checkpoint(target_soc_pct, actual_soc_pct, events)?;
        self.schedule.advance();
        switch.switch_to(ActiveInstrument::Source, &self.cancel)?;
        self.program_and_enable(params)?;
        if !sleep_cancellable(
            self.clock.as_ref(),
            &self.cancel,
            self.options.stabilize_delay_s,
            CANCEL_TICK_S,
        ) {
            return Err(EisError::Cancelled);
        }
        Ok(())
    }

    /// Capture at the actual final SOC unless the last stored measurement is
    /// already within [`FORCED_FINAL_SKIP_PCT`] of it.
    fn forced_final_capture(
        &mut self,
        switch: &mut DeviceSwitch,
        final_soc_pct: f64,
        events: &mut Option<&mut dyn FnMut(ChargeEvent)>,
    ) -> EisResult<()> {
        if let Some(last) = self.measurements.last() {
            if (final_soc_pct - last.actual_soc_pct).abs() <= FORCED_FINAL_SKIP_PCT {
                debug!(
                    final_soc_pct,
                    last_soc_pct = last.actual_soc_pct,
                    "skipping forced final capture, last measurement is close enough"
                );
                return Ok(());
            }
        }
        switch.switch_to(ActiveInstrument::Potentiostat, &self.cancel)?;
        self.capture_checkpoint(final_soc_pct, final_soc_pct, events)
    }

    /// One capture with the potentiostat already connected. Success stores
    /// the measurement; retry exhaustion logs the data loss and returns `Ok`
    /// so charging can continue. Cancellation propagates.
    fn capture_checkpoint(
        &mut self,
        target_soc_pct: f64,
        actual_soc_pct: f64,
        events: &mut Option<&mut dyn FnMut(ChargeEvent)>,
    ) -> EisResult<()> {
        emit(
            events,
            ChargeEvent::CheckpointStarted {
                target_soc_pct,
                actual_soc_pct,
            },
        );
        let elapsed_s = self.clock.now_s() - self.run_start_s;
        let temperatures = self.zone_snapshot(elapsed_s);
        match self
            .capture
            .capture(target_soc_pct, actual_soc_pct, elapsed_s, temperatures)
        {
            Ok(measurement) => {
                self.push_measurement(measurement.clone())?;
                info!(
                    target_soc_pct,
                    actual_soc_pct,
                    ocv_v = measurement.ocv_v,
                    retries = measurement.retry_count,
                    "impedance checkpoint captured"
                );
                emit(events, ChargeEvent::CheckpointCompleted { measurement });
            }
            Err(EisError::Cancelled) => return Err(EisError::Cancelled),
            Err(err) => {
                warn!(
                    target_soc_pct,
                    error = %err,
                    "impedance checkpoint lost, charging continues"
                );
                emit(
                    events,
                    ChargeEvent::CheckpointFailed {
                        target_soc_pct,
                        error: err.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    fn program_and_enable(&self, params: &ChargeParams) -> EisResult<()> {
        self.bench
            .source
            .set_voltage(params.charge_voltage_v, CommandPriority::Normal)?;
        self.bench
            .source
            .set_current(params.charge_current_a, CommandPriority::Normal)?;
        self.bench
            .source
            .set_output_enabled(true, CommandPriority::Normal)?;
        Ok(())
    }

    fn push_measurement(&mut self, measurement: EisMeasurement) -> EisResult<()> {
        if self.measurements.len() >= self.measurement_limit {
            return Err(EisError::CapacityExceeded {
                what: "impedance measurements",
                limit: self.measurement_limit,
            });
        }
        self.measurements.push(measurement);
        Ok(())
    }

    /// Best-effort chamber snapshot attached to each measurement. A thermal
    /// read failure must not cost the impedance data.
    fn zone_snapshot(&self, elapsed_s: f64) -> Vec<TemperatureSample> {
        match self.bench.thermal.read_zones(CommandPriority::Normal) {
            Ok(zones) => zones
                .iter()
                .map(|z| TemperatureSample {
                    elapsed_s,
                    zone: z.zone,
                    temp_c: z.temp_c,
                    fault: z.fault,
                })
                .collect(),
            Err(err) => {
                debug!(error = %err, "zone snapshot unavailable for checkpoint");
                Vec::new()
            }
        }
    }

    fn disable_output_best_effort(&self) {
        if let Err(err) = self
            .bench
            .source
            .set_output_enabled(false, CommandPriority::High)
        {
            warn!("failed to disable source output on error exit: {err}");
        }
    }
}

fn emit(events: &mut Option<&mut dyn FnMut(ChargeEvent)>, event: ChargeEvent) {
    if let Some(cb) = events.as_deref_mut() {
        cb(event);
    }
}

fn aborted_before_start(params: &ChargeParams) -> ChargeOutcome {
    ChargeOutcome {
        completion: ChargeCompletion::Aborted,
        capacity_mah: 0.0,
        energy_wh: 0.0,
        elapsed_s: 0.0,
        estimated_capacity_mah: params.estimated_capacity_mah,
        final_soc_pct: 0.0,
        start_voltage_v: 0.0,
        end_voltage_v: 0.0,
    }
}

fn validate_params(params: &ChargeParams) -> EisResult<()> {
    if !params.charge_voltage_v.is_finite() || params.charge_voltage_v <= 0.0 {
        return Err(EisError::InvalidArg {
            what: "charge voltage must be positive",
        });
    }
    if !params.charge_current_a.is_finite() || params.charge_current_a <= 0.0 {
        return Err(EisError::InvalidArg {
            what: "charge current must be positive",
        });
    }
    if !params.current_threshold_a.is_finite() || params.current_threshold_a < 0.0 {
        return Err(EisError::InvalidArg {
            what: "current threshold must be non-negative",
        });
    }
    if !params.estimated_capacity_mah.is_finite() || params.estimated_capacity_mah <= 0.0 {
        return Err(EisError::InvalidArg {
            what: "estimated capacity must be positive",
        });
    }
    if !params.soc_safety_ceiling_pct.is_finite() || params.soc_safety_ceiling_pct <= 100.0 {
        return Err(EisError::InvalidArg {
            what: "SOC safety ceiling must exceed 100%",
        });
    }
    if !params.timeout_s.is_finite() || params.timeout_s <= 0.0 {
        return Err(EisError::InvalidArg {
            what: "timeout must be positive",
        });
    }
    Ok(())
}
