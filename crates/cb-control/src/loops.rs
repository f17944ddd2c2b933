//! Closed-loop source control: drive-to-voltage and capacity-transfer.
//!
//! Both operations share one polling skeleton. Per iteration, in order:
//! cancellation check, wall-clock timeout check, one blocking status read,
//! trapezoidal integration (the first sample only seeds), stop-rule
//! evaluation, optional progress callback, cooperative sleep. The source
//! output is disabled on every exit path; cancellation-induced exits disable
//! at [`CommandPriority::High`] so the command jumps the instrument queue.

use std::fmt;
use std::sync::Arc;

use cb_core::{CancelToken, Clock, ensure_non_negative, ensure_positive, sleep_cancellable};
use cb_instruments::{CommandPriority, PowerSource, SourceStatus};
use tracing::{info, warn};

use crate::error::ControlResult;
use crate::integrator::{CoulombCounter, Direction};

/// Voltage settle band for target detection (V).
pub const VOLTAGE_BAND_V: f64 = 0.050;

/// Smallest permitted polling interval (s); configured values are clamped up.
pub const MIN_POLL_INTERVAL_S: f64 = 0.1;

/// Granularity at which sleeps observe the cancellation token (s).
const CANCEL_TICK_S: f64 = 0.1;

/// Timing knobs shared by both control operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopOptions {
    /// Poll period (s); clamped to [`MIN_POLL_INTERVAL_S`].
    pub poll_interval_s: f64,
    /// Delay between enabling the output and the first sample (s).
    pub stabilize_delay_s: f64,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            poll_interval_s: 0.5,
            stabilize_delay_s: 2.0,
        }
    }
}

/// Inputs to one control leg. Read-only to the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlParams {
    /// Voltage target (drive) or voltage bound (transfer) (V).
    pub target_voltage_v: f64,
    /// Programmed source/sink current magnitude (A).
    pub current_a: f64,
    /// Current magnitude below which the leg is considered settled (A).
    pub current_threshold_a: f64,
    /// Wall-clock deadline for the leg (s).
    pub timeout_s: f64,
}

/// How a control leg ended. All four are ordinary outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Timeout,
    /// Cancellation observed mid-loop.
    Aborted,
    /// Current fell below threshold before the capacity target was reached.
    CurrentThresholdReached,
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Completion::Success => "success",
            Completion::Timeout => "timeout",
            Completion::Aborted => "aborted",
            Completion::CurrentThresholdReached => "current threshold reached",
        })
    }
}

/// Result of one control leg, written once at loop exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlOutcome {
    pub completion: Completion,
    /// Signed transferred capacity (mAh); negative for discharge legs.
    pub capacity_mah: f64,
    /// Signed transferred energy (Wh); negative for discharge legs.
    pub energy_wh: f64,
    pub elapsed_s: f64,
    pub start_voltage_v: f64,
    pub end_voltage_v: f64,
    pub end_current_a: f64,
}

/// Per-poll progress payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSample {
    pub elapsed_s: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    /// Signed capacity transferred so far in this leg (mAh).
    pub transferred_mah: f64,
}

/// Closed-loop controller for one power source.
pub struct SourceController {
    source: Arc<dyn PowerSource>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    options: LoopOptions,
}

impl SourceController {
    pub fn new(
        source: Arc<dyn PowerSource>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
        options: LoopOptions,
    ) -> Self {
        let options = LoopOptions {
            poll_interval_s: options.poll_interval_s.max(MIN_POLL_INTERVAL_S),
            stabilize_delay_s: options.stabilize_delay_s.max(0.0),
        };
        Self {
            source,
            clock,
            cancel,
            options,
        }
    }

    /// Effective options after clamping.
    pub fn options(&self) -> LoopOptions {
        self.options
    }

    /// Charge or discharge until the terminal voltage settles at the target.
    ///
    /// Direction is taken from the sign of `target - current`. If the cell is
    /// already within [`VOLTAGE_BAND_V`] of the target, returns `Success` with
    /// zero elapsed time without touching the source. Termination requires the
    /// voltage inside the band *and* the current magnitude below threshold.
    pub fn drive_to_voltage(
        &self,
        params: &ControlParams,
        progress: Option<&mut dyn FnMut(LoopSample)>,
    ) -> ControlResult<ControlOutcome> {
        validate_params(params)?;
        let status = self.source.status(CommandPriority::Normal)?;
        if self.cancel.is_cancelled() {
            return Ok(aborted_before_start(status));
        }
        let start_voltage_v = status.voltage_v;
        let error_v = params.target_voltage_v - start_voltage_v;
        if error_v.abs() < VOLTAGE_BAND_V {
            return Ok(ControlOutcome {
                completion: Completion::Success,
                capacity_mah: 0.0,
                energy_wh: 0.0,
                elapsed_s: 0.0,
                start_voltage_v,
                end_voltage_v: start_voltage_v,
                end_current_a: status.current_a,
            });
        }

        let direction = if error_v > 0.0 {
            Direction::Charge
        } else {
            Direction::Discharge
        };
        let target_v = params.target_voltage_v;
        let threshold_a = params.current_threshold_a;
        let outcome = self.run_loop(
            direction,
            params,
            start_voltage_v,
            &mut |status, _transferred_mah| {
                let settled = (status.voltage_v - target_v).abs() < VOLTAGE_BAND_V
                    && status.current_a.abs() < threshold_a;
                settled.then_some(Completion::Success)
            },
            progress,
        )?;
        info!(
            completion = %outcome.completion,
            end_voltage_v = outcome.end_voltage_v,
            capacity_mah = outcome.capacity_mah,
            "voltage target loop finished"
        );
        Ok(outcome)
    }

    /// Move a fixed amount of charge in the given direction.
    ///
    /// Terminates with `Success` once the accumulated magnitude reaches
    /// `target_mah`, or with `CurrentThresholdReached` if the current settles
    /// below threshold first (the voltage bound was hit short of the target).
    pub fn transfer_capacity(
        &self,
        params: &ControlParams,
        direction: Direction,
        target_mah: f64,
        progress: Option<&mut dyn FnMut(LoopSample)>,
    ) -> ControlResult<ControlOutcome> {
        validate_params(params)?;
        ensure_positive(target_mah, "transfer capacity target")?;
        let status = self.source.status(CommandPriority::Normal)?;
        if self.cancel.is_cancelled() {
            return Ok(aborted_before_start(status));
        }

        let threshold_a = params.current_threshold_a;
        let outcome = self.run_loop(
            direction,
            params,
            status.voltage_v,
            &mut |status, transferred_mah| {
                if transferred_mah.abs() >= target_mah {
                    Some(Completion::Success)
                } else if status.current_a.abs() < threshold_a {
                    Some(Completion::CurrentThresholdReached)
                } else {
                    None
                }
            },
            progress,
        )?;
        let delta_mah = outcome.capacity_mah.abs() - target_mah;
        info!(
            completion = %outcome.completion,
            target_mah,
            delta_mah,
            "capacity transfer finished"
        );
        Ok(outcome)
    }

    /// Shared polling skeleton. The stop rule sees the latest status and the
    /// signed accumulated capacity, and decides whether (and how) to finish.
    fn run_loop(
        &self,
        direction: Direction,
        params: &ControlParams,
        start_voltage_v: f64,
        stop_rule: &mut dyn FnMut(&SourceStatus, f64) -> Option<Completion>,
        mut progress: Option<&mut dyn FnMut(LoopSample)>,
    ) -> ControlResult<ControlOutcome> {
        self.source
            .set_voltage(params.target_voltage_v, CommandPriority::Normal)?;
        match direction {
            Direction::Charge => self
                .source
                .set_current(params.current_a, CommandPriority::Normal)?,
            Direction::Discharge => self
                .source
                .set_sink_current(params.current_a, CommandPriority::Normal)?,
        }
        self.source
            .set_output_enabled(true, CommandPriority::Normal)?;
        sleep_cancellable(
            self.clock.as_ref(),
            &self.cancel,
            self.options.stabilize_delay_s,
            CANCEL_TICK_S,
        );

        let t0 = self.clock.now_s();
        let mut counter = CoulombCounter::new(direction);
        let mut end_voltage_v = start_voltage_v;
        let mut end_current_a = 0.0;
        let completion = loop {
            if self.cancel.is_cancelled() {
                break Completion::Aborted;
            }
            if self.clock.now_s() - t0 >= params.timeout_s {
                break Completion::Timeout;
            }
            let status = match self.source.status(CommandPriority::Normal) {
                Ok(status) => status,
                Err(err) => {
                    self.disable_output_best_effort();
                    return Err(err.into());
                }
            };
            let now_s = self.clock.now_s();
            end_voltage_v = status.voltage_v;
            end_current_a = status.current_a;
            counter.observe(now_s, status.voltage_v, status.current_a);
            if let Some(done) = stop_rule(&status, counter.capacity_mah()) {
                break done;
            }
            if let Some(cb) = progress.as_mut() {
                cb(LoopSample {
                    elapsed_s: now_s - t0,
                    voltage_v: status.voltage_v,
                    current_a: status.current_a,
                    transferred_mah: counter.capacity_mah(),
                });
            }
            sleep_cancellable(
                self.clock.as_ref(),
                &self.cancel,
                self.options.poll_interval_s,
                CANCEL_TICK_S,
            );
        };

        let disable_priority = if completion == Completion::Aborted {
            CommandPriority::High
        } else {
            CommandPriority::Normal
        };
        self.source.set_output_enabled(false, disable_priority)?;

        Ok(ControlOutcome {
            completion,
            capacity_mah: counter.capacity_mah(),
            energy_wh: counter.energy_wh(),
            elapsed_s: self.clock.now_s() - t0,
            start_voltage_v,
            end_voltage_v,
            end_current_a,
        })
    }

    fn disable_output_best_effort(&self) {
        if let Err(err) = self
            .source
            .set_output_enabled(false, CommandPriority::High)
        {
            warn!("failed to disable source output on error exit: {err}");
        }
    }
}

fn aborted_before_start(status: SourceStatus) -> ControlOutcome {
    ControlOutcome {
        completion: Completion::Aborted,
        capacity_mah: 0.0,
        energy_wh: 0.0,
        elapsed_s: 0.0,
        start_voltage_v: status.voltage_v,
        end_voltage_v: status.voltage_v,
        end_current_a: status.current_a,
    }
}

fn validate_params(params: &ControlParams) -> ControlResult<()> {
    ensure_positive(params.target_voltage_v, "target voltage")?;
    ensure_positive(params.current_a, "loop current")?;
    ensure_non_negative(params.current_threshold_a, "current threshold")?;
    ensure_positive(params.timeout_s, "loop timeout")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use cb_core::{CbError, TestClock};
    use cb_instruments::mock::{SOURCE_PIN, SimBench, SimCellSpec};

    use super::*;
    use crate::error::ControlError;

    fn charge_for_ocv(ocv_v: f64) -> f64 {
        let spec = SimCellSpec::default();
        (ocv_v - spec.v_empty_v) / (spec.v_full_v - spec.v_empty_v) * spec.capacity_mah
    }

    fn rig(initial_charge_mah: f64) -> (SimBench, Arc<TestClock>, SourceController, CancelToken) {
        let clock = Arc::new(TestClock::new());
        let sim = SimBench::new(
            SimCellSpec {
                initial_charge_mah,
                ..SimCellSpec::default()
            },
            clock.clone(),
        );
        let bench = sim.bench();
        bench
            .relays
            .set_pin(SOURCE_PIN, true, CommandPriority::Normal)
            .unwrap();
        sim.clear_commands();
        let cancel = CancelToken::new();
        let controller = SourceController::new(
            bench.source.clone(),
            clock.clone(),
            cancel.clone(),
            LoopOptions::default(),
        );
        (sim, clock, controller, cancel)
    }

    #[test]
    fn drive_to_voltage_charges_to_target() {
        let (sim, _clock, controller, _cancel) = rig(charge_for_ocv(3.70));
        let initial_mah = sim.charge_mah();
        let params = ControlParams {
            target_voltage_v: 4.2,
            current_a: 0.5,
            current_threshold_a: 0.05,
            timeout_s: 3600.0,
        };
        let mut samples = Vec::new();
        let mut on_sample = |s: LoopSample| samples.push(s);
        let outcome = controller
            .drive_to_voltage(&params, Some(&mut on_sample))
            .unwrap();

        assert_eq!(outcome.completion, Completion::Success);
        assert!(outcome.capacity_mah > 0.0);
        assert!(outcome.energy_wh > 0.0);
        assert!(outcome.elapsed_s > 0.0);
        assert!((outcome.end_voltage_v - 4.2).abs() < VOLTAGE_BAND_V);
        assert!(outcome.end_current_a.abs() < 0.05);
        assert!((outcome.start_voltage_v - 3.70).abs() < 0.05);
        assert!(!sim.output_enabled());

        // The integrator tracks the charge the cell actually took (the
        // stabilization window before the first sample is not integrated).
        let cell_delta_mah = sim.charge_mah() - initial_mah;
        assert!((outcome.capacity_mah - cell_delta_mah).abs() < 0.5);

        assert!(!samples.is_empty());
        assert!(
            samples
                .windows(2)
                .all(|w| w[1].elapsed_s > w[0].elapsed_s
                    && w[1].transferred_mah >= w[0].transferred_mah)
        );
    }

    #[test]
    fn drive_within_band_returns_immediately_without_commands() {
        let (sim, _clock, controller, _cancel) = rig(charge_for_ocv(4.18));
        let params = ControlParams {
            target_voltage_v: 4.2,
            current_a: 0.5,
            current_threshold_a: 0.05,
            timeout_s: 3600.0,
        };
        let outcome = controller.drive_to_voltage(&params, None).unwrap();

        assert_eq!(outcome.completion, Completion::Success);
        assert_eq!(outcome.elapsed_s, 0.0);
        assert_eq!(outcome.capacity_mah, 0.0);
        let mutating = sim
            .commands()
            .into_iter()
            .filter(|c| c.instrument == "source" && c.command != "status")
            .count();
        assert_eq!(mutating, 0);
    }

    #[test]
    fn drive_times_out_when_target_unreachable() {
        let (sim, _clock, controller, _cancel) = rig(0.0);
        let params = ControlParams {
            target_voltage_v: 4.2,
            current_a: 0.01,
            current_threshold_a: 0.005,
            timeout_s: 30.0,
        };
        let outcome = controller.drive_to_voltage(&params, None).unwrap();

        assert_eq!(outcome.completion, Completion::Timeout);
        assert!(outcome.elapsed_s >= 30.0);
        assert!(!sim.output_enabled());
    }

    #[test]
    fn cancel_mid_loop_aborts_without_further_control_commands() {
        let (sim, _clock, controller, cancel) = rig(0.0);
        let params = ControlParams {
            target_voltage_v: 4.2,
            current_a: 0.5,
            current_threshold_a: 0.05,
            timeout_s: 3600.0,
        };
        let mut seen = 0_u32;
        let mut on_sample = |_s: LoopSample| {
            seen += 1;
            if seen == 3 {
                cancel.cancel();
            }
        };
        let outcome = controller
            .drive_to_voltage(&params, Some(&mut on_sample))
            .unwrap();

        assert_eq!(outcome.completion, Completion::Aborted);
        let commands = sim.commands();
        // Only the initial leg programming ever mutates source settings.
        let programming = commands
            .iter()
            .filter(|c| {
                c.command.starts_with("set_voltage") || c.command.starts_with("set_current")
            })
            .count();
        assert_eq!(programming, 2);
        // The exit disable goes out at high priority.
        let last = commands.last().unwrap();
        assert_eq!(last.instrument, "source");
        assert!(last.command.starts_with("set_output_enabled false"));
        assert_eq!(last.priority, CommandPriority::High);
        assert!(!sim.output_enabled());
    }

    #[test]
    fn cancel_before_start_issues_no_mutations() {
        let (sim, _clock, controller, cancel) = rig(0.0);
        cancel.cancel();
        let params = ControlParams {
            target_voltage_v: 4.2,
            current_a: 0.5,
            current_threshold_a: 0.05,
            timeout_s: 3600.0,
        };
        let outcome = controller.drive_to_voltage(&params, None).unwrap();
        assert_eq!(outcome.completion, Completion::Aborted);
        assert_eq!(outcome.elapsed_s, 0.0);
        let mutating = sim
            .commands()
            .into_iter()
            .filter(|c| c.instrument == "source" && c.command != "status")
            .count();
        assert_eq!(mutating, 0);
    }

    #[test]
    fn cancel_before_start_wins_over_an_in_band_target() {
        // The cell already sits inside the settle band; a pending stop must
        // still report Aborted, not Success.
        let (sim, _clock, controller, cancel) = rig(charge_for_ocv(4.18));
        cancel.cancel();
        let params = ControlParams {
            target_voltage_v: 4.2,
            current_a: 0.5,
            current_threshold_a: 0.05,
            timeout_s: 3600.0,
        };
        let outcome = controller.drive_to_voltage(&params, None).unwrap();

        assert_eq!(outcome.completion, Completion::Aborted);
        assert_eq!(outcome.elapsed_s, 0.0);
        let mutating = sim
            .commands()
            .into_iter()
            .filter(|c| c.instrument == "source" && c.command != "status")
            .count();
        assert_eq!(mutating, 0);
    }

    #[test]
    fn transfer_reaches_capacity_target_with_success() {
        let (sim, _clock, controller, _cancel) = rig(50.0);
        let params = ControlParams {
            target_voltage_v: 3.0,
            current_a: 1.0,
            current_threshold_a: 0.05,
            timeout_s: 600.0,
        };
        let outcome = controller
            .transfer_capacity(&params, Direction::Discharge, 20.0, None)
            .unwrap();

        assert_eq!(outcome.completion, Completion::Success);
        // Signed discharge capacity, just past the target by at most one poll.
        assert!(outcome.capacity_mah <= -20.0);
        assert!(outcome.capacity_mah > -20.5);
        assert!(outcome.energy_wh < 0.0);
        assert!(!sim.output_enabled());
    }

    #[test]
    fn transfer_stops_at_current_threshold_short_of_target() {
        let (sim, _clock, controller, _cancel) = rig(10.0);
        let params = ControlParams {
            target_voltage_v: 3.0,
            current_a: 0.2,
            current_threshold_a: 0.05,
            timeout_s: 1200.0,
        };
        let outcome = controller
            .transfer_capacity(&params, Direction::Discharge, 40.0, None)
            .unwrap();

        assert_eq!(outcome.completion, Completion::CurrentThresholdReached);
        assert!(outcome.capacity_mah.abs() < 40.0);
        assert!(outcome.capacity_mah < -8.0);
        assert!(!sim.output_enabled());
    }

    #[test]
    fn poll_interval_is_clamped_to_minimum() {
        let (_sim, clock, _controller, cancel) = rig(0.0);
        let sim = SimBench::new(SimCellSpec::default(), clock.clone());
        let controller = SourceController::new(
            sim.bench().source,
            clock,
            cancel,
            LoopOptions {
                poll_interval_s: 0.01,
                stabilize_delay_s: -1.0,
            },
        );
        assert_eq!(controller.options().poll_interval_s, MIN_POLL_INTERVAL_S);
        assert_eq!(controller.options().stabilize_delay_s, 0.0);
    }

    #[test]
    fn invalid_params_are_rejected_before_any_io() {
        let (sim, _clock, controller, _cancel) = rig(0.0);
        let params = ControlParams {
            target_voltage_v: 4.2,
            current_a: 0.0,
            current_threshold_a: 0.05,
            timeout_s: 3600.0,
        };
        let err = controller.drive_to_voltage(&params, None).unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidArg(CbError::NotPositive { .. })
        ));
        let err = controller
            .transfer_capacity(&params, Direction::Charge, 10.0, None)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidArg { .. }));
        assert!(sim.commands().is_empty());
    }
}
