//! Experiment execution service.
//!
//! [`ExperimentService`] runs characterizations on a background worker thread
//! and streams progress to the caller over a channel, so a CLI or UI can render
//! updates without blocking the control loops. A busy gate admits one run at a
//! time per service; the flag is released by an RAII guard on every worker exit
//! path, including panics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::{self, JoinHandle};

use cb_core::{CancelToken, Clock};
use cb_instruments::Bench;
use cb_results::{EisMeasurement, RunStore, RunSummary, SeriesSample};
use cb_run::{ExperimentOrchestrator, ExperimentParams, ExperimentPhase, RunObserver};
use tracing::info;

use crate::error::{AppError, AppResult};

/// Messages streamed from the run worker to the caller.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Status { text: String },
    Progress { fraction: f64 },
    PhaseChanged { phase: ExperimentPhase },
    Series { label: String, sample: SeriesSample },
    Eis { measurement: EisMeasurement },
    /// Terminal: the run ended with a persisted summary.
    Finished { summary: RunSummary },
    /// Terminal: the run ended in an error (cancellation included).
    Failed { message: String },
}

/// Handle to an in-flight characterization run.
///
/// Dropping the handle detaches the run; the worker keeps driving the
/// experiment and releases the busy gate when it finishes on its own.
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancelToken,
    events: Receiver<ServiceEvent>,
    worker: JoinHandle<AppResult<RunSummary>>,
}

impl RunHandle {
    /// Event stream for this run. Disconnects once the worker exits.
    pub fn events(&self) -> &Receiver<ServiceEvent> {
        &self.events
    }

    /// Request an orderly stop and return immediately. The run winds down
    /// through its normal safe-shutdown path.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Flag an emergency and stop. The run records the flag so post-run
    /// analysis can tell a safety trip from an operator stop.
    pub fn emergency_stop(&self) {
        self.cancel.emergency_stop();
    }

    /// Block until the worker exits and return the run outcome.
    pub fn wait(self) -> AppResult<RunSummary> {
        match self.worker.join() {
            Ok(result) => result,
            Err(_) => Err(AppError::Run("experiment worker panicked".to_string())),
        }
    }

    /// Stop the run and block until the bench has reached its safe state.
    pub fn abort(self) -> AppResult<RunSummary> {
        self.cancel.cancel();
        self.wait()
    }
}

/// Runs experiments against one bench, one at a time.
///
/// The busy gate is owned by the service instance: construct one service per
/// bench. Two services built over clones of the same `Bench` would gate
/// independently and could drive the hardware concurrently.
pub struct ExperimentService {
    bench: Bench,
    clock: Arc<dyn Clock>,
    store: Arc<RunStore>,
    busy: Arc<AtomicBool>,
}

impl ExperimentService {
    pub fn new(bench: Bench, clock: Arc<dyn Clock>, store: RunStore) -> Self {
        Self {
            bench,
            clock,
            store: Arc::new(store),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Result store this service persists runs into.
    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Whether a run currently holds the bench.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start a characterization run on a worker thread.
    ///
    /// Parameters are validated before the busy gate is claimed, so a rejected
    /// start leaves the service idle and the bench untouched. A start while a
    /// run is active returns [`AppError::Busy`].
    pub fn start_characterization(&self, params: ExperimentParams) -> AppResult<RunHandle> {
        params.validate()?;
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::Busy);
        }
        // Claimed. From here the guard owns the flag and clears it when the
        // worker exits, whatever the exit path.
        let guard = BusyGuard {
            flag: Arc::clone(&self.busy),
        };

        let cancel = CancelToken::new();
        let orchestrator = ExperimentOrchestrator::new(
            self.bench.clone(),
            Arc::clone(&self.clock),
            cancel.clone(),
            params,
        );
        let store = Arc::clone(&self.store);
        let (tx, rx) = channel();

        let worker = thread::spawn(move || {
            let _busy = guard;
            let mut observer = ChannelObserver { tx: tx.clone() };
            let result = orchestrator.run(&store, &mut observer);
            match &result {
                Ok(summary) => {
                    info!(run_id = %summary.run_id, "experiment worker finished");
                    let _ = tx.send(ServiceEvent::Finished {
                        summary: summary.clone(),
                    });
                }
                Err(err) => {
                    let _ = tx.send(ServiceEvent::Failed {
                        message: err.to_string(),
                    });
                }
            }
            result.map_err(AppError::from)
        });

        Ok(RunHandle {
            cancel,
            events: rx,
            worker,
        })
    }
}

/// Clears the busy flag when the worker exits.
struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Forwards run callbacks into the event channel.
///
/// Send failures are ignored: a caller that dropped its handle detached the
/// run, and the experiment must keep going regardless.
struct ChannelObserver {
    tx: Sender<ServiceEvent>,
}

impl RunObserver for ChannelObserver {
    fn status(&mut self, text: &str) {
        let _ = self.tx.send(ServiceEvent::Status {
            text: text.to_string(),
        });
    }

    fn progress(&mut self, fraction: f64) {
        let _ = self.tx.send(ServiceEvent::Progress { fraction });
    }

    fn phase_changed(&mut self, phase: ExperimentPhase) {
        let _ = self.tx.send(ServiceEvent::PhaseChanged { phase });
    }

    fn series_sample(&mut self, label: &str, sample: &SeriesSample) {
        let _ = self.tx.send(ServiceEvent::Series {
            label: label.to_string(),
            sample: sample.clone(),
        });
    }

    fn eis_measurement(&mut self, measurement: &EisMeasurement) {
        let _ = self.tx.send(ServiceEvent::Eis {
            measurement: measurement.clone(),
        });
    }
}
