//! Four-phase characterization run.
//!
//! The orchestrator owns the sequencing: conditioning discharge and thermal
//! soak, a full capacity-measurement cycle, the checkpointed charge with
//! impedance captures, and the final discharge to 50% SOC. Every instrument
//! action goes through the layers below; this module decides only order,
//! bookkeeping, and when an outcome ends the run.

use std::sync::Arc;

use cb_control::{
    Completion, ControlOutcome, ControlParams, ControlResult, Direction, LoopSample,
    SourceController,
};
use cb_core::{CancelToken, Clock, sleep_cancellable};
use cb_eis::{ChargeCompletion, ChargeEvent, EisScheduler, TargetSchedule};
use cb_instruments::{Bench, CommandPriority};
use cb_results::{
    PhaseResult, RunManifest, RunStatus, RunStore, RunSummary, SeriesSample, compose_summary,
    compute_run_id,
};
use cb_rig::{ActiveInstrument, DeviceSwitch, TemperatureSynchronizer, ThermalReadiness};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::context::{ExperimentContext, ExperimentPhase};
use crate::error::{RunError, RunResult};
use crate::observer::RunObserver;
use crate::params::ExperimentParams;

/// Protocol identifier recorded in every manifest.
pub const RUN_KIND: &str = "characterization";

const CANCEL_TICK_S: f64 = 0.1;

/// Sequences one characterization run over a bench of instruments.
pub struct ExperimentOrchestrator {
    bench: Bench,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    params: ExperimentParams,
}

impl ExperimentOrchestrator {
    pub fn new(
        bench: Bench,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
        params: ExperimentParams,
    ) -> Self {
        Self {
            bench,
            clock,
            cancel,
            params,
        }
    }

    pub fn params(&self) -> &ExperimentParams {
        &self.params
    }

    /// Execute the full experiment and persist everything into `store`.
    ///
    /// A manifest and settings snapshot are written before the first
    /// instrument command; the summary and final manifest are written on
    /// every exit path that got that far, success or not. Cancellation
    /// before the first write leaves the store untouched.
    pub fn run(
        &self,
        store: &RunStore,
        observer: &mut dyn RunObserver,
    ) -> RunResult<RunSummary> {
        self.params.validate()?;
        if self.cancel.is_cancelled() {
            info!("cancel requested before start, nothing to do");
            return Err(RunError::Cancelled);
        }

        let started_at = Utc::now().to_rfc3339();
        let run_id = compute_run_id(&self.params, RUN_KIND, &started_at);
        let manifest = RunManifest {
            run_id: run_id.clone(),
            kind: RUN_KIND.to_string(),
            started_at: started_at.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            status: RunStatus::InProgress,
        };
        store.save_manifest(&manifest)?;
        store.save_settings(&run_id, &self.params)?;
        info!(run_id = %run_id, "characterization run starting");

        let mut ctx = ExperimentContext::new(self.params.clone(), run_id, started_at);
        // Held for the rest of the run: forces the bench into its safe state
        // on every exit path, including panics.
        let _shutdown = BenchShutdown {
            bench: self.bench.clone(),
            pins: [self.params.source_pin, self.params.potentiostat_pin],
        };
        let result = self.execute_phases(&mut ctx, store, observer);

        let (status, terminal) = match &result {
            Ok(()) => (RunStatus::Completed, ExperimentPhase::Completed),
            Err(RunError::Cancelled) => (RunStatus::Cancelled, ExperimentPhase::Cancelled),
            Err(_) => (RunStatus::Failed, ExperimentPhase::Error),
        };
        if let Err(err) = ctx.transition(terminal) {
            warn!(error = %err, "terminal transition rejected");
        }
        observer.phase_changed(terminal);
        observer.progress(1.0);
        match &result {
            Ok(()) => observer.status("Experiment complete"),
            Err(RunError::Cancelled) => observer.status("Experiment cancelled"),
            Err(err) => observer.status(&format!("Experiment failed: {err}")),
        }

        let summary = compose_summary(
            &ctx.run_id,
            status,
            Utc::now().to_rfc3339(),
            ctx.phases.clone(),
            &ctx.totals,
            ctx.measurements(),
        );
        // A storage failure must not mask the error that ended the run.
        match store.save_summary(&summary) {
            Ok(()) => {}
            Err(err) if result.is_err() => {
                warn!(error = %err, "failed to persist the summary of an unfinished run");
            }
            Err(err) => return Err(err.into()),
        }
        match store.save_manifest(&RunManifest { status, ..manifest }) {
            Ok(()) => {}
            Err(err) if result.is_err() => {
                warn!(error = %err, "failed to update the manifest of an unfinished run");
            }
            Err(err) => return Err(err.into()),
        }

        match &result {
            Ok(()) => info!(run_id = %ctx.run_id, "characterization run completed"),
            Err(err) => info!(run_id = %ctx.run_id, error = %err, "characterization run ended early"),
        }
        result.map(|()| summary)
    }

    fn execute_phases(
        &self,
        ctx: &mut ExperimentContext,
        store: &RunStore,
        observer: &mut dyn RunObserver,
    ) -> RunResult<()> {
        let run_start_s = self.clock.now_s();
        let mut switch = DeviceSwitch::new(
            self.bench.relays.clone(),
            self.bench.source.clone(),
            self.clock.clone(),
            self.params.switch_pins(),
        )?;
        let controller = SourceController::new(
            self.bench.source.clone(),
            self.clock.clone(),
            self.cancel.clone(),
            self.params.loop_options(),
        );

        observer.phase_changed(ExperimentPhase::Setup);
        observer.progress(phase_fraction(ExperimentPhase::Setup));
        observer.status("Connecting power source");
        switch.switch_to(ActiveInstrument::Source, &self.cancel)?;

        // Phase 1: drain to the empty voltage so coulomb counting starts
        // from a known point, then soak at the test temperature.
        self.enter_phase(ctx, observer, ExperimentPhase::Phase1Discharge)?;
        observer.status("Phase 1: discharging to the empty voltage");
        let outcome = self.drive_leg(
            ctx,
            store,
            observer,
            &controller,
            "phase1_discharge",
            &self.params.discharge_leg(),
            run_start_s,
        )?;
        require_leg_success(&outcome, "phase1_discharge")?;

        self.enter_phase(ctx, observer, ExperimentPhase::Phase1TempWait)?;
        observer.status("Phase 1: waiting for the thermal setpoint");
        let sync = TemperatureSynchronizer::new(
            self.bench.thermal.clone(),
            self.clock.clone(),
            self.cancel.clone(),
            self.params.thermal,
        );
        if sync.wait_for_setpoint()? == ThermalReadiness::TimedOutProceeding {
            observer.status("Thermal setpoint not reached, proceeding");
        }
        self.enter_phase(ctx, observer, ExperimentPhase::Phase1TempStabilize)?;
        observer.status("Phase 1: confirming thermal dwell");
        if sync.stabilize()? == ThermalReadiness::TimedOutProceeding {
            observer.status("Thermal dwell not confirmed, proceeding");
        }

        // Phase 2: one full cycle. The charge seeds the Phase-3 SOC
        // estimate; the discharge is the capacity baseline for Phase 4.
        self.enter_phase(ctx, observer, ExperimentPhase::Phase2Charge)?;
        observer.status("Phase 2: charging to full");
        let outcome = self.drive_leg(
            ctx,
            store,
            observer,
            &controller,
            "phase2_charge",
            &self.params.charge_leg(),
            run_start_s,
        )?;
        require_leg_success(&outcome, "phase2_charge")?;
        let estimated_seed_mah = outcome.capacity_mah.abs();
        ctx.totals.charge_capacity_mah = Some(outcome.capacity_mah.abs());
        ctx.totals.charge_energy_wh = Some(outcome.energy_wh.abs());
        self.settle(observer)?;

        self.enter_phase(ctx, observer, ExperimentPhase::Phase2Discharge)?;
        observer.status("Phase 2: discharging to empty");
        let outcome = self.drive_leg(
            ctx,
            store,
            observer,
            &controller,
            "phase2_discharge",
            &self.params.discharge_leg(),
            run_start_s,
        )?;
        require_leg_success(&outcome, "phase2_discharge")?;
        let discharge_baseline_mah = outcome.capacity_mah.abs();
        ctx.totals.discharge_capacity_mah = Some(discharge_baseline_mah);
        ctx.totals.discharge_energy_wh = Some(outcome.energy_wh.abs());
        self.settle(observer)?;

        // Phase 3: baseline impedance at empty, then the checkpointed charge.
        self.enter_phase(ctx, observer, ExperimentPhase::Phase3Setup)?;
        observer.status("Phase 3: impedance baseline at empty");
        let schedule =
            TargetSchedule::new(self.params.eis_interval_pct, self.params.max_dynamic_targets)?;
        let mut scheduler = EisScheduler::new(
            self.bench.clone(),
            self.clock.clone(),
            self.cancel.clone(),
            schedule,
            self.params.capture_config(),
            self.params.loop_options(),
            run_start_s,
        );
        let charge_params = self.params.eis_charge(estimated_seed_mah);
        // Event handling failures are parked here so the charge still winds
        // down through its own safe exit before the run aborts.
        let mut deferred: Option<RunError> = None;
        let mut on_event = |event: ChargeEvent| {
            if deferred.is_some() {
                return;
            }
            if let Err(err) = self.handle_charge_event(event, ctx, store, observer, run_start_s) {
                deferred = Some(err);
            }
        };
        scheduler.initial_capture(&mut switch, Some(&mut on_event))?;
        let outcome = scheduler.run_charge(&mut switch, &charge_params, Some(&mut on_event));

        if let Err(err) = self.flush_series(ctx, store, "phase3_charge") {
            if outcome.is_ok() && deferred.is_none() {
                return Err(err);
            }
            warn!(error = %err, "failed to persist charge series rows");
        }
        let outcome = outcome?;
        if let Some(err) = deferred {
            return Err(err);
        }
        ctx.phases.push(PhaseResult {
            label: "phase3_charge".to_string(),
            capacity_mah: outcome.capacity_mah.abs(),
            energy_wh: outcome.energy_wh.abs(),
            start_voltage_v: outcome.start_voltage_v,
            end_voltage_v: outcome.end_voltage_v,
            duration_s: outcome.elapsed_s,
            completion: outcome.completion.to_string(),
        });
        ctx.totals.estimated_capacity_mah = Some(outcome.estimated_capacity_mah);
        match outcome.completion {
            ChargeCompletion::Completed => {}
            ChargeCompletion::Aborted => return Err(RunError::Cancelled),
            ChargeCompletion::Timeout => {
                return Err(RunError::Timeout {
                    phase: "phase3_charge",
                });
            }
            ChargeCompletion::SafetyCeiling => {
                return Err(RunError::SafetyCeiling {
                    soc_pct: outcome.final_soc_pct,
                });
            }
        }
        // The forced final capture may have left the potentiostat connected.
        switch.switch_to(ActiveInstrument::Source, &self.cancel)?;

        // Phase 4: discharge exactly half of the measured capacity, leaving
        // the cell parked near 50% SOC.
        self.enter_phase(ctx, observer, ExperimentPhase::Phase4Discharge)?;
        let target_mah = discharge_baseline_mah / 2.0;
        ctx.totals.phase4_target_mah = Some(target_mah);
        observer.status(&format!("Phase 4: discharging {target_mah:.1} mAh to 50% SOC"));
        let outcome = self.transfer_leg(
            ctx,
            store,
            observer,
            &controller,
            "phase4_discharge",
            &self.params.discharge_leg(),
            target_mah,
            run_start_s,
        )?;
        ctx.totals.phase4_actual_mah = Some(outcome.capacity_mah.abs());
        require_leg_success(&outcome, "phase4_discharge")?;
        Ok(())
    }

    /// Voltage-seeking leg with series logging.
    #[allow(clippy::too_many_arguments)]
    fn drive_leg(
        &self,
        ctx: &mut ExperimentContext,
        store: &RunStore,
        observer: &mut dyn RunObserver,
        controller: &SourceController,
        label: &'static str,
        params: &ControlParams,
        run_start_s: f64,
    ) -> RunResult<ControlOutcome> {
        let leg_offset_s = self.clock.now_s() - run_start_s;
        let mut on_sample = |s: LoopSample| {
            let elapsed_s = leg_offset_s + s.elapsed_s;
            if !ctx.series_due(elapsed_s) {
                return;
            }
            let row = SeriesSample {
                elapsed_s,
                voltage_v: s.voltage_v,
                current_a: s.current_a,
                power_w: s.voltage_v * s.current_a,
                soc_pct: None,
                zone_temps_c: self.zone_temps_best_effort(),
            };
            observer.series_sample(label, &row);
            ctx.push_series(row);
        };
        let result = controller.drive_to_voltage(params, Some(&mut on_sample));
        self.finish_leg(ctx, store, label, result)
    }

    /// Capacity-transfer leg with series logging and progress reporting.
    #[allow(clippy::too_many_arguments)]
    fn transfer_leg(
        &self,
        ctx: &mut ExperimentContext,
        store: &RunStore,
        observer: &mut dyn RunObserver,
        controller: &SourceController,
        label: &'static str,
        params: &ControlParams,
        target_mah: f64,
        run_start_s: f64,
    ) -> RunResult<ControlOutcome> {
        let leg_offset_s = self.clock.now_s() - run_start_s;
        let base = phase_fraction(ExperimentPhase::Phase4Discharge);
        let mut on_sample = |s: LoopSample| {
            let done = (s.transferred_mah.abs() / target_mah).min(1.0);
            observer.progress(base + (1.0 - base) * done);
            let elapsed_s = leg_offset_s + s.elapsed_s;
            if !ctx.series_due(elapsed_s) {
                return;
            }
            let row = SeriesSample {
                elapsed_s,
                voltage_v: s.voltage_v,
                current_a: s.current_a,
                power_w: s.voltage_v * s.current_a,
                soc_pct: None,
                zone_temps_c: self.zone_temps_best_effort(),
            };
            observer.series_sample(label, &row);
            ctx.push_series(row);
        };
        let result =
            controller.transfer_capacity(params, Direction::Discharge, target_mah, Some(&mut on_sample));
        self.finish_leg(ctx, store, label, result)
    }

    /// Record the leg outcome and drain its series rows to the store.
    fn finish_leg(
        &self,
        ctx: &mut ExperimentContext,
        store: &RunStore,
        label: &'static str,
        result: ControlResult<ControlOutcome>,
    ) -> RunResult<ControlOutcome> {
        match result {
            Ok(outcome) => {
                self.flush_series(ctx, store, label)?;
                ctx.phases.push(PhaseResult {
                    label: label.to_string(),
                    capacity_mah: outcome.capacity_mah.abs(),
                    energy_wh: outcome.energy_wh.abs(),
                    start_voltage_v: outcome.start_voltage_v,
                    end_voltage_v: outcome.end_voltage_v,
                    duration_s: outcome.elapsed_s,
                    completion: outcome.completion.to_string(),
                });
                info!(
                    label,
                    completion = %outcome.completion,
                    capacity_mah = outcome.capacity_mah,
                    elapsed_s = outcome.elapsed_s,
                    "leg finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                if let Err(flush_err) = self.flush_series(ctx, store, label) {
                    warn!(error = %flush_err, "failed to persist series rows");
                }
                Err(err.into())
            }
        }
    }

    fn flush_series(
        &self,
        ctx: &mut ExperimentContext,
        store: &RunStore,
        label: &str,
    ) -> RunResult<()> {
        let rows = ctx.take_series();
        if rows.is_empty() {
            return Ok(());
        }
        store.append_series(&ctx.run_id, label, &rows)?;
        Ok(())
    }

    /// Transition into `phase` and report it, refusing when a stop has
    /// already been requested.
    fn enter_phase(
        &self,
        ctx: &mut ExperimentContext,
        observer: &mut dyn RunObserver,
        phase: ExperimentPhase,
    ) -> RunResult<()> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        ctx.transition(phase)?;
        observer.phase_changed(phase);
        observer.progress(phase_fraction(phase));
        Ok(())
    }

    fn handle_charge_event(
        &self,
        event: ChargeEvent,
        ctx: &mut ExperimentContext,
        store: &RunStore,
        observer: &mut dyn RunObserver,
        run_start_s: f64,
    ) -> RunResult<()> {
        match event {
            ChargeEvent::Sample {
                voltage_v,
                current_a,
                soc_pct,
                ..
            } => {
                let base = phase_fraction(ExperimentPhase::Phase3Charging);
                let span = phase_fraction(ExperimentPhase::Phase4Discharge) - base;
                observer.progress(base + span * (soc_pct.min(100.0) / 100.0));
                let elapsed_s = self.clock.now_s() - run_start_s;
                if !ctx.series_due(elapsed_s) {
                    return Ok(());
                }
                let row = SeriesSample {
                    elapsed_s,
                    voltage_v,
                    current_a,
                    power_w: voltage_v * current_a,
                    soc_pct: Some(soc_pct),
                    zone_temps_c: self.zone_temps_best_effort(),
                };
                observer.series_sample("phase3_charge", &row);
                ctx.push_series(row);
            }
            ChargeEvent::CheckpointStarted {
                target_soc_pct,
                actual_soc_pct,
            } => {
                ctx.transition(ExperimentPhase::Phase3EisMeasurement)?;
                observer.phase_changed(ExperimentPhase::Phase3EisMeasurement);
                observer.status(&format!(
                    "EIS checkpoint at {actual_soc_pct:.1}% SOC (target {target_soc_pct:.0}%)"
                ));
            }
            ChargeEvent::CheckpointCompleted { measurement } => {
                if let Err(err) = store.append_eis(&ctx.run_id, &measurement) {
                    warn!(error = %err, "failed to persist impedance measurement");
                }
                observer.eis_measurement(&measurement);
                ctx.record_measurement(measurement)?;
                ctx.transition(ExperimentPhase::Phase3Charging)?;
                observer.phase_changed(ExperimentPhase::Phase3Charging);
            }
            ChargeEvent::CheckpointFailed {
                target_soc_pct,
                error,
            } => {
                observer.status(&format!(
                    "EIS checkpoint at {target_soc_pct:.0}% SOC lost: {error}"
                ));
                ctx.transition(ExperimentPhase::Phase3Charging)?;
                observer.phase_changed(ExperimentPhase::Phase3Charging);
            }
            ChargeEvent::ScheduleExtended { new_target_pct } => {
                observer.status(&format!(
                    "Capacity underestimated, checkpoint added at {new_target_pct:.0}% SOC"
                ));
            }
            ChargeEvent::CapacityRevised {
                estimated_capacity_mah,
            } => {
                ctx.totals.estimated_capacity_mah = Some(estimated_capacity_mah);
                observer.status(&format!(
                    "Capacity estimate revised to {estimated_capacity_mah:.1} mAh"
                ));
            }
        }
        Ok(())
    }

    fn settle(&self, observer: &mut dyn RunObserver) -> RunResult<()> {
        if self.params.settle_s <= 0.0 {
            return Ok(());
        }
        observer.status("Resting cell");
        if !sleep_cancellable(
            self.clock.as_ref(),
            &self.cancel,
            self.params.settle_s,
            CANCEL_TICK_S,
        ) {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    fn zone_temps_best_effort(&self) -> Vec<f64> {
        match self.bench.thermal.read_zones(CommandPriority::Normal) {
            Ok(readings) => readings.iter().map(|r| r.temp_c).collect(),
            Err(err) => {
                debug!(error = %err, "zone read failed, series row has no temperatures");
                Vec::new()
            }
        }
    }
}

/// Overall progress reached when a phase begins. Within Phase 3 and Phase 4
/// the gaps are interpolated from SOC and transferred capacity.
fn phase_fraction(phase: ExperimentPhase) -> f64 {
    match phase {
        ExperimentPhase::Setup => 0.0,
        ExperimentPhase::Phase1Discharge => 0.05,
        ExperimentPhase::Phase1TempWait => 0.12,
        ExperimentPhase::Phase1TempStabilize => 0.16,
        ExperimentPhase::Phase2Charge => 0.2,
        ExperimentPhase::Phase2Discharge => 0.35,
        ExperimentPhase::Phase3Setup
        | ExperimentPhase::Phase3Charging
        | ExperimentPhase::Phase3EisMeasurement => 0.5,
        ExperimentPhase::Phase4Discharge => 0.85,
        ExperimentPhase::Completed | ExperimentPhase::Error | ExperimentPhase::Cancelled => 1.0,
    }
}

fn require_leg_success(outcome: &ControlOutcome, phase: &'static str) -> RunResult<()> {
    match outcome.completion {
        Completion::Success | Completion::CurrentThresholdReached => Ok(()),
        Completion::Timeout => Err(RunError::Timeout { phase }),
        Completion::Aborted => Err(RunError::Cancelled),
    }
}

/// Forces the bench into its safe state when dropped.
///
/// Each step is attempted even if an earlier one fails: output off, both
/// relays open, chamber stopped.
struct BenchShutdown {
    bench: Bench,
    pins: [usize; 2],
}

impl Drop for BenchShutdown {
    fn drop(&mut self) {
        if let Err(err) = self
            .bench
            .source
            .set_output_enabled(false, CommandPriority::High)
        {
            warn!(error = %err, "shutdown: failed to disable source output");
        }
        for pin in self.pins {
            if let Err(err) = self.bench.relays.set_pin(pin, false, CommandPriority::High) {
                warn!(error = %err, pin, "shutdown: failed to open relay");
            }
        }
        if let Err(err) = self
            .bench
            .thermal
            .set_running(false, CommandPriority::High)
        {
            warn!(error = %err, "shutdown: failed to stop the thermal chamber");
        }
    }
}
