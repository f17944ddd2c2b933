//! Progress reporting hooks for a running experiment.

use cb_results::{EisMeasurement, SeriesSample};

use crate::context::ExperimentPhase;

/// Receives progress callbacks from [`ExperimentOrchestrator::run`].
///
/// Callbacks arrive on the thread driving the run, between instrument
/// commands. Implementations must return promptly and must never issue
/// instrument commands of their own; anything slow belongs on another thread
/// fed from here.
///
/// [`ExperimentOrchestrator::run`]: crate::ExperimentOrchestrator::run
pub trait RunObserver {
    /// Human-readable status line, suitable for direct display.
    fn status(&mut self, _text: &str) {}

    /// Overall progress in `[0, 1]`, monotonically non-decreasing.
    fn progress(&mut self, _fraction: f64) {}

    fn phase_changed(&mut self, _phase: ExperimentPhase) {}

    /// A series row accepted by the log-interval gate, tagged with the
    /// series label it will be persisted under.
    fn series_sample(&mut self, _label: &str, _sample: &SeriesSample) {}

    /// An impedance checkpoint that captured successfully.
    fn eis_measurement(&mut self, _measurement: &EisMeasurement) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}
