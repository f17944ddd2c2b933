//! Impedance checkpoint scheduling for battery characterization.
//!
//! Builds the SOC checkpoint schedule, captures OCV + GEIS pairs with full
//! retry, and runs the checkpointed charge loop that pauses at each target to
//! hand the cell to the potentiostat.

mod capture;
mod error;
mod scheduler;
mod targets;

pub use capture::{CaptureConfig, EIS_RETRY_CEILING, EIS_RETRY_DELAY_S, EisCapture};
pub use error::{EisError, EisResult};
pub use scheduler::{
    CAPACITY_REVISION_TRIGGER_PCT, ChargeCompletion, ChargeEvent, ChargeOutcome, ChargeParams,
    EisScheduler, FORCED_FINAL_SKIP_PCT, SOC_CHECKPOINT_TOLERANCE_PCT,
    TERMINATION_DEBOUNCE_SAMPLES,
};
pub use targets::{MAX_DYNAMIC_TARGETS, TargetSchedule};
