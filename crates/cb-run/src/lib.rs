//! cb-run: the four-phase characterization experiment.
//!
//! Ties the lower layers together: conditioning and thermal soak, the
//! capacity-measurement cycle, the checkpointed charge with impedance
//! captures, and the final discharge to 50% SOC, with results persisted
//! through `cb-results` on every exit path.

pub mod context;
pub mod error;
pub mod observer;
pub mod orchestrator;
pub mod params;

pub use context::{ExperimentContext, ExperimentPhase};
pub use error::{RunError, RunResult};
pub use observer::{NoopObserver, RunObserver};
pub use orchestrator::{ExperimentOrchestrator, RUN_KIND};
pub use params::ExperimentParams;
