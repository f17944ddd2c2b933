//! Retryable OCV + impedance capture.
//!
//! A capture is the pair of measurements taken at one checkpoint: an
//! open-circuit rest ending in the terminal OCV reading, then a galvanostatic
//! impedance sweep. Either half failing fails the attempt, and a retry always
//! re-runs the full pair so the spectrum and its OCV come from the same rest
//! state.

use std::sync::Arc;

use cb_core::{CancelToken, Clock, sleep_cancellable};
use cb_instruments::potentiostat::{GEIS_FREQ_HZ, GEIS_IM_Z_OHM, GEIS_RE_Z_OHM, OCV_EWE_V};
use cb_instruments::{GeisConfig, OcvConfig, Potentiostat, SweepRecord};
use cb_results::{EisMeasurement, TemperatureSample};
use tracing::warn;

use crate::error::{EisError, EisResult};

/// Retries allowed beyond the first attempt of a capture.
pub const EIS_RETRY_CEILING: u32 = 2;

/// Fixed delay between capture attempts (s).
pub const EIS_RETRY_DELAY_S: f64 = 5.0;

/// Granularity at which the retry delay observes cancellation (s).
const CANCEL_TICK_S: f64 = 0.1;

/// Measurement programs for both halves of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CaptureConfig {
    pub ocv: OcvConfig,
    pub geis: GeisConfig,
}

/// Extracted payload of one successful attempt.
struct CapturedPair {
    ocv_v: f64,
    freq_hz: Vec<f64>,
    re_z_ohm: Vec<f64>,
    im_z_ohm: Vec<f64>,
}

/// Runs OCV + impedance pairs against a connected potentiostat.
///
/// The caller is responsible for the relay hand-off; this type assumes the
/// potentiostat already has exclusive cell access when [`EisCapture::capture`]
/// is invoked.
pub struct EisCapture {
    potentiostat: Arc<dyn Potentiostat>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    config: CaptureConfig,
}

impl EisCapture {
    pub fn new(
        potentiostat: Arc<dyn Potentiostat>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
        config: CaptureConfig,
    ) -> Self {
        Self {
            potentiostat,
            clock,
            cancel,
            config,
        }
    }

    /// Capture one measurement, retrying the full pair on failure.
    ///
    /// `retry_count` on the returned measurement counts the failed attempts
    /// before the one that succeeded. Cancellation aborts immediately and is
    /// never retried.
    pub fn capture(
        &self,
        target_soc_pct: f64,
        actual_soc_pct: f64,
        elapsed_s: f64,
        temperatures: Vec<TemperatureSample>,
    ) -> EisResult<EisMeasurement> {
        let mut failed_attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(EisError::Cancelled);
            }
            match self.attempt() {
                Ok(pair) => {
                    return Ok(EisMeasurement {
                        target_soc_pct,
                        actual_soc_pct,
                        elapsed_s,
                        captured_at: chrono::Utc::now().to_rfc3339(),
                        ocv_v: pair.ocv_v,
                        freq_hz: pair.freq_hz,
                        re_z_ohm: pair.re_z_ohm,
                        im_z_ohm: pair.im_z_ohm,
                        retry_count: failed_attempts,
                        temperatures,
                    });
                }
                Err(EisError::Cancelled) => return Err(EisError::Cancelled),
                Err(err) if failed_attempts < EIS_RETRY_CEILING => {
                    failed_attempts += 1;
                    warn!(
                        error = %err,
                        attempt = failed_attempts,
                        target_soc_pct,
                        "impedance capture failed, retrying the full pair"
                    );
                    if !sleep_cancellable(
                        self.clock.as_ref(),
                        &self.cancel,
                        EIS_RETRY_DELAY_S,
                        CANCEL_TICK_S,
                    ) {
                        return Err(EisError::Cancelled);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt(&self) -> EisResult<CapturedPair> {
        let ocv_record = self.potentiostat.measure_ocv(&self.config.ocv, &self.cancel)?;
        let ocv_v = terminal_ocv(&ocv_record)?;
        let geis_record = self
            .potentiostat
            .measure_geis(&self.config.geis, &self.cancel)?;
        Ok(CapturedPair {
            ocv_v,
            freq_hz: column(&geis_record, GEIS_FREQ_HZ)?,
            re_z_ohm: column(&geis_record, GEIS_RE_Z_OHM)?,
            im_z_ohm: column(&geis_record, GEIS_IM_Z_OHM)?,
        })
    }
}

/// Terminal OCV is the last sample of the rest period.
fn terminal_ocv(record: &SweepRecord) -> EisResult<f64> {
    record
        .column(OCV_EWE_V)
        .and_then(|col| col.last().copied())
        .ok_or(EisError::MalformedSweep { column: OCV_EWE_V })
}

fn column(record: &SweepRecord, name: &'static str) -> EisResult<Vec<f64>> {
    record
        .column(name)
        .map(|col| col.to_vec())
        .ok_or(EisError::MalformedSweep { column: name })
}
