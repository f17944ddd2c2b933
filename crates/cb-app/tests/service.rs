//! Service-level integration: the busy gate and the event stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cb_app::{AppError, ExperimentService, ServiceEvent};
use cb_core::{SystemClock, TestClock};
use cb_instruments::mock::{POTENTIOSTAT_PIN, SOURCE_PIN, SimBench, SimCellSpec};
use cb_results::{RunStatus, RunStore};
use cb_run::{ExperimentParams, ExperimentPhase};

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
    let mut params = ExperimentParams {
        eis_interval_pct: 50.0,
        phase_timeout_s: 3600.0,
        settle_s: 5.0,
        log_interval_s: 1.0,
        source_pin: SOURCE_PIN,
        potentiostat_pin: POTENTIOSTAT_PIN,
        ..ExperimentParams::default()
    };
    params.thermal.setpoint_c = 30.0;
    params.thermal.wait_timeout_s = 600.0;
    params.thermal.dwell_s = 10.0;
    params
}

/// Virtual-clock service over a fresh simulated cell.
fn test_service(prefix: &str, initial_charge_mah: f64) -> (ExperimentService, SimBench) {
    let clock = Arc::new(TestClock::new());
    let sim = SimBench::new(
        SimCellSpec {
            initial_charge_mah,
            ..SimCellSpec::default()
        },
        clock.clone(),
    );
    let store = RunStore::new(unique_temp_dir(prefix)).expect("run store");
    let service = ExperimentService::new(sim.bench(), clock, store);
    (service, sim)
}

#[test]
fn completed_run_streams_events_and_releases_the_gate() {
    let (service, _sim) = test_service("cb_app_full", 20.0);

    let handle = service
        .start_characterization(sim_params())
        .expect("first start");

    // Blocks until the worker drops its sender, i.e. until the run is over.
    let events: Vec<ServiceEvent> = handle.events().iter().collect();
    assert!(matches!(
        events.first(),
        Some(ServiceEvent::PhaseChanged {
            phase: ExperimentPhase::Setup
        })
    ));
    assert!(events.iter().any(|e| matches!(
        e,
        ServiceEvent::PhaseChanged {
            phase: ExperimentPhase::Phase3Charging
        }
    )));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServiceEvent::Series { label, .. } if label == "phase3_charge"))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServiceEvent::Eis { .. }))
    );
    assert!(matches!(
        events.last(),
        Some(ServiceEvent::Finished { .. })
    ));

    let summary = handle.wait().expect("run outcome");
    assert_eq!(summary.status, RunStatus::Completed);
    assert!(service.store().has_run(&summary.run_id));
    assert!(!service.is_busy());

    // The gate reopens for the next run.
    let second = service
        .start_characterization(sim_params())
        .expect("second start after release")
        .wait()
        .expect("second run outcome");
    assert_eq!(second.status, RunStatus::Completed);
    assert_ne!(second.run_id, summary.run_id);
}

#[test]
fn busy_gate_rejects_a_second_start() {
    // Real clock: the worker parks in the relay settle long enough for the
    // main thread to observe the gate.
    let clock = Arc::new(SystemClock::new());
    let sim = SimBench::new(SimCellSpec::default(), clock.clone());
    let store = RunStore::new(unique_temp_dir("cb_app_busy")).expect("run store");
    let service = ExperimentService::new(sim.bench(), clock, store);

    let handle = service
        .start_characterization(sim_params())
        .expect("first start");
    // First event proves the worker is inside the run.
    handle
        .events()
        .recv_timeout(Duration::from_secs(10))
        .expect("worker started");
    assert!(service.is_busy());
    assert!(matches!(
        service.start_characterization(sim_params()),
        Err(AppError::Busy)
    ));

    handle.stop();
    let err = handle.wait().expect_err("stopped run reports cancellation");
    assert!(matches!(err, AppError::Cancelled));
    assert!(!service.is_busy());

    // The interrupted run still persisted its record and parked the bench.
    let runs = service.store().list_runs().expect("list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Cancelled);
    assert!(!sim.output_enabled());
    assert!(!sim.pin_closed(SOURCE_PIN));
    assert!(!sim.pin_closed(POTENTIOSTAT_PIN));
}

#[test]
fn abort_blocks_until_the_bench_is_safe() {
    let clock = Arc::new(SystemClock::new());
    let sim = SimBench::new(SimCellSpec::default(), clock.clone());
    let store = RunStore::new(unique_temp_dir("cb_app_abort")).expect("run store");
    let service = ExperimentService::new(sim.bench(), clock, store);

    let handle = service
        .start_characterization(sim_params())
        .expect("start");
    handle
        .events()
        .recv_timeout(Duration::from_secs(10))
        .expect("worker started");

    let err = handle.abort().expect_err("aborted run reports cancellation");
    assert!(matches!(err, AppError::Cancelled));
    // abort() has joined the worker, so the shutdown already happened.
    assert!(!sim.output_enabled());
    assert!(!sim.pin_closed(SOURCE_PIN));
    assert!(!service.is_busy());
}

#[test]
fn rejected_parameters_leave_the_service_idle() {
    let (service, sim) = test_service("cb_app_reject", 20.0);

    let mut params = sim_params();
    params.charge_voltage_v = 2.0;
    let err = service
        .start_characterization(params)
        .expect_err("inverted window must be rejected");
    assert!(matches!(err, AppError::Validation(_)));
    assert!(!service.is_busy());
    assert!(service.store().list_runs().expect("list runs").is_empty());
    assert!(sim.commands().is_empty());
}
