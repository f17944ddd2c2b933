//! Potentiostat contract: blocking OCV capture and galvanostatic impedance
//! sweeps.

use cb_core::CancelToken;
use serde::{Deserialize, Serialize};

use crate::error::InstrumentResult;
use crate::types::SweepRecord;

/// Variable names the engine expects in an OCV capture record.
pub const OCV_TIME_S: &str = "time_s";
pub const OCV_EWE_V: &str = "ewe_v";

/// Variable names the engine expects in a GEIS sweep record.
pub const GEIS_FREQ_HZ: &str = "freq_hz";
pub const GEIS_RE_Z_OHM: &str = "re_z_ohm";
pub const GEIS_IM_Z_OHM: &str = "im_z_ohm";

/// Open-circuit-voltage capture configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OcvConfig {
    /// Rest duration before the final reading (s).
    pub duration_s: f64,
    /// Sampling period during the rest (s).
    pub sample_period_s: f64,
}

impl Default for OcvConfig {
    fn default() -> Self {
        Self {
            duration_s: 10.0,
            sample_period_s: 1.0,
        }
    }
}

/// Galvanostatic impedance sweep configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeisConfig {
    /// AC excitation amplitude (A).
    pub amplitude_a: f64,
    /// First (highest) excitation frequency (Hz).
    pub freq_start_hz: f64,
    /// Last (lowest) excitation frequency (Hz).
    pub freq_end_hz: f64,
    pub points_per_decade: u32,
}

impl Default for GeisConfig {
    fn default() -> Self {
        Self {
            amplitude_a: 0.05,
            freq_start_hz: 10_000.0,
            freq_end_hz: 0.1,
            points_per_decade: 6,
        }
    }
}

/// Impedance analyzer behind its command queue.
///
/// Both calls block for the full measurement duration. The cancellation token
/// is observed inside the instrument call so a stop request aborts a sweep
/// mid-flight rather than waiting minutes for it to finish.
pub trait Potentiostat: Send + Sync {
    fn measure_ocv(
        &self,
        config: &OcvConfig,
        cancel: &CancelToken,
    ) -> InstrumentResult<SweepRecord>;

    fn measure_geis(
        &self,
        config: &GeisConfig,
        cancel: &CancelToken,
    ) -> InstrumentResult<SweepRecord>;
}
