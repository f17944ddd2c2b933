//! End-to-end characterization runs against the simulated bench.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cb_core::{CancelToken, TestClock};
use cb_instruments::mock::{POTENTIOSTAT_PIN, SOURCE_PIN, SimBench, SimCellSpec};
use cb_results::{EisMeasurement, RunStatus, RunStore, SeriesSample};
use cb_rig::ThermalSettings;
use cb_run::{
    ExperimentOrchestrator, ExperimentParams, ExperimentPhase, NoopObserver, RUN_KIND, RunError,
    RunObserver,
};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("{}_{}", prefix, nanos));
    dir
}

fn sim_params() -> ExperimentParams {
    ExperimentParams {
        eis_interval_pct: 50.0,
        phase_timeout_s: 3600.0,
        settle_s: 5.0,
        log_interval_s: 1.0,
        source_pin: SOURCE_PIN,
        potentiostat_pin: POTENTIOSTAT_PIN,
        thermal: ThermalSettings {
            setpoint_c: 30.0,
            tolerance_c: 1.0,
            poll_interval_s: 2.0,
            wait_timeout_s: 600.0,
            dwell_s: 10.0,
            ..ThermalSettings::default()
        },
        ..ExperimentParams::default()
    }
}

fn rig(initial_charge_mah: f64) -> (SimBench, Arc<TestClock>, CancelToken) {
    let clock = Arc::new(TestClock::new());
    let sim = SimBench::new(
        SimCellSpec {
            initial_charge_mah,
            ..SimCellSpec::default()
        },
        clock.clone(),
    );
    (sim, clock, CancelToken::new())
}

#[derive(Default)]
struct RecordingObserver {
    phases: Vec<ExperimentPhase>,
    progress: Vec<f64>,
    statuses: Vec<String>,
    series_rows: Vec<(String, SeriesSample)>,
    eis_rows: Vec<EisMeasurement>,
}

impl RunObserver for RecordingObserver {
    fn status(&mut self, text: &str) {
        self.statuses.push(text.to_string());
    }

    fn progress(&mut self, fraction: f64) {
        self.progress.push(fraction);
    }

    fn phase_changed(&mut self, phase: ExperimentPhase) {
        self.phases.push(phase);
    }

    fn series_sample(&mut self, label: &str, sample: &SeriesSample) {
        self.series_rows.push((label.to_string(), sample.clone()));
    }

    fn eis_measurement(&mut self, measurement: &EisMeasurement) {
        self.eis_rows.push(measurement.clone());
    }
}

#[test]
fn full_characterization_completes() {
    let (sim, clock, cancel) = rig(20.0);
    let store = RunStore::new(unique_temp_dir("cb_run_full")).expect("create store");
    let orchestrator = ExperimentOrchestrator::new(sim.bench(), clock, cancel, sim_params());
    let mut observer = RecordingObserver::default();

    let summary = orchestrator.run(&store, &mut observer).expect("run");

    assert_eq!(summary.status, RunStatus::Completed);
    let labels: Vec<&str> = summary.phases.iter().map(|p| p.label.as_str()).collect();
    assert_eq!(
        labels,
        [
            "phase1_discharge",
            "phase2_charge",
            "phase2_discharge",
            "phase3_charge",
            "phase4_discharge"
        ]
    );
    assert_eq!(summary.phases[3].completion, "completed");

    let ce = summary.coulombic_efficiency_pct.expect("coulombic efficiency");
    assert!(ce > 95.0 && ce < 101.0, "coulombic efficiency {ce}");
    let ee = summary.energy_efficiency_pct.expect("energy efficiency");
    assert!(ee > 70.0 && ee < 100.0, "energy efficiency {ee}");
    let estimated = summary.estimated_capacity_mah.expect("capacity estimate");
    assert!(
        estimated > 48.0 && estimated < 51.0,
        "capacity estimate {estimated}"
    );
    let final_soc = summary.final_soc_pct.expect("final SOC");
    assert!(
        final_soc > 45.0 && final_soc <= 50.5,
        "final SOC {final_soc}"
    );
    // Baseline at empty, mid-charge, and full at minimum.
    assert!(summary.eis_points.len() >= 3, "{:?}", summary.eis_points);
    assert_eq!(summary.eis_points[0].target_soc_pct, 0.0);

    // Everything the run produced is on disk.
    let run_id = &summary.run_id;
    assert!(store.has_run(run_id));
    let manifest = store.load_manifest(run_id).expect("manifest");
    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.kind, RUN_KIND);
    assert_eq!(store.load_summary(run_id).expect("summary"), summary);
    let eis = store.load_eis(run_id).expect("eis");
    assert_eq!(eis.len(), summary.eis_points.len());
    let series_labels = store.series_labels(run_id).expect("series labels");
    for label in [
        "phase1_discharge",
        "phase2_charge",
        "phase2_discharge",
        "phase3_charge",
        "phase4_discharge",
    ] {
        assert!(
            series_labels.iter().any(|l| l == label),
            "missing series {label}"
        );
    }
    let phase3 = store
        .load_series(run_id, "phase3_charge")
        .expect("phase3 series");
    assert!(!phase3.is_empty());
    assert!(phase3.iter().all(|r| r.soc_pct.is_some()));
    assert!(phase3.iter().all(|r| r.zone_temps_c.len() == 2));

    // The rig ends in its safe state.
    assert!(!sim.output_enabled());
    assert!(!sim.pin_closed(SOURCE_PIN));
    assert!(!sim.pin_closed(POTENTIOSTAT_PIN));
    assert!(!sim.simultaneous_connection_seen());

    // The observer saw an orderly progression.
    assert_eq!(observer.phases.first(), Some(&ExperimentPhase::Setup));
    assert_eq!(observer.phases.last(), Some(&ExperimentPhase::Completed));
    assert!(
        observer
            .phases
            .contains(&ExperimentPhase::Phase3EisMeasurement)
    );
    assert!(observer.progress.windows(2).all(|w| w[1] >= w[0] - 1e-9));
    assert_eq!(observer.progress.last(), Some(&1.0));
    assert_eq!(observer.eis_rows.len(), summary.eis_points.len());
    assert!(!observer.series_rows.is_empty());
    assert!(!observer.statuses.is_empty());
}

#[test]
fn phase_timeout_fails_the_run_but_persists_results() {
    let (sim, clock, cancel) = rig(45.0);
    let store = RunStore::new(unique_temp_dir("cb_run_timeout")).expect("create store");
    let params = ExperimentParams {
        phase_timeout_s: 20.0,
        ..sim_params()
    };
    let orchestrator = ExperimentOrchestrator::new(sim.bench(), clock, cancel, params);

    let err = orchestrator
        .run(&store, &mut NoopObserver)
        .expect_err("run must time out in phase 1");
    assert!(matches!(
        err,
        RunError::Timeout {
            phase: "phase1_discharge"
        }
    ));

    let runs = store.list_runs().expect("list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    let summary = store.load_summary(&runs[0].run_id).expect("summary");
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.phases.len(), 1);
    assert_eq!(summary.phases[0].completion, "timeout");
    assert!(summary.coulombic_efficiency_pct.is_none());

    assert!(!sim.output_enabled());
    assert!(!sim.pin_closed(SOURCE_PIN));
}

#[test]
fn invalid_params_are_rejected_before_any_io() {
    let (sim, clock, cancel) = rig(20.0);
    let store = RunStore::new(unique_temp_dir("cb_run_invalid")).expect("create store");
    let params = ExperimentParams {
        charge_voltage_v: 2.0,
        ..sim_params()
    };
    let orchestrator = ExperimentOrchestrator::new(sim.bench(), clock, cancel, params);

    let err = orchestrator
        .run(&store, &mut NoopObserver)
        .expect_err("validation must fail");
    assert!(matches!(err, RunError::InvalidParameter { .. }));
    assert!(store.list_runs().expect("list runs").is_empty());
    assert!(sim.commands().is_empty());
}
