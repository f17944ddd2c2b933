//! Experiment configuration.

use cb_control::{ControlParams, LoopOptions};
use cb_core::{CbError, ensure_finite, ensure_non_negative, ensure_positive};
use cb_eis::{CaptureConfig, ChargeParams, MAX_DYNAMIC_TARGETS};
use cb_instruments::{GeisConfig, OcvConfig};
use cb_rig::{SwitchPins, ThermalSettings};
use serde::{Deserialize, Serialize};

use crate::error::RunResult;

/// All configuration of one characterization run.
///
/// Serialized verbatim into the run's settings snapshot, so every knob the
/// run used is recoverable from the store. Unknown fields in a loaded snapshot
/// fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentParams {
    /// CV level for charge legs (V).
    pub charge_voltage_v: f64,
    /// CV level for discharge legs (V).
    pub discharge_voltage_v: f64,
    /// Programmed current magnitude for charge legs (A).
    pub charge_current_a: f64,
    /// Programmed current magnitude for discharge legs (A).
    pub discharge_current_a: f64,
    /// Current magnitude below which a leg is considered settled (A).
    pub current_threshold_a: f64,
    /// SOC spacing of impedance checkpoints (%).
    pub eis_interval_pct: f64,
    /// Bound on dynamic checkpoints appended past 100% SOC.
    pub max_dynamic_targets: usize,
    /// Tracked SOC above which the checkpointed charge is aborted (%).
    pub soc_safety_ceiling_pct: f64,
    /// Wall-clock limit applied to each phase independently (s).
    pub phase_timeout_s: f64,
    /// Rest between Phase-2 legs (s).
    pub settle_s: f64,
    /// Cadence of persisted series rows (s).
    pub log_interval_s: f64,
    /// Control loop poll period (s).
    pub poll_interval_s: f64,
    /// Delay between enabling an output and the first sample (s).
    pub stabilize_delay_s: f64,
    /// Relay pin wired to the power source.
    pub source_pin: usize,
    /// Relay pin wired to the potentiostat.
    pub potentiostat_pin: usize,
    pub thermal: ThermalSettings,
    pub ocv: OcvConfig,
    pub geis: GeisConfig,
}

impl Default for ExperimentParams {
    fn default() -> Self {
        Self {
            charge_voltage_v: 4.2,
            discharge_voltage_v: 3.0,
            charge_current_a: 1.0,
            discharge_current_a: 1.0,
            current_threshold_a: 0.05,
            eis_interval_pct: 25.0,
            max_dynamic_targets: MAX_DYNAMIC_TARGETS,
            soc_safety_ceiling_pct: 150.0,
            phase_timeout_s: 21_600.0,
            settle_s: 30.0,
            log_interval_s: 1.0,
            poll_interval_s: 0.5,
            stabilize_delay_s: 2.0,
            source_pin: 0,
            potentiostat_pin: 1,
            thermal: ThermalSettings::default(),
            ocv: OcvConfig::default(),
            geis: GeisConfig::default(),
        }
    }
}

impl ExperimentParams {
    /// Reject anything a phase would later refuse, before any instrument I/O.
    pub fn validate(&self) -> RunResult<()> {
        ensure_positive(self.charge_voltage_v, "charge voltage")?;
        ensure_positive(self.discharge_voltage_v, "discharge voltage")?;
        if self.charge_voltage_v <= self.discharge_voltage_v {
            return Err(CbError::Constraint {
                what: "charge voltage must exceed discharge voltage",
            }
            .into());
        }
        ensure_positive(self.charge_current_a, "charge current")?;
        ensure_positive(self.discharge_current_a, "discharge current")?;
        ensure_non_negative(self.current_threshold_a, "current threshold")?;
        ensure_positive(self.eis_interval_pct, "EIS checkpoint interval")?;
        if self.eis_interval_pct > 100.0 {
            return Err(CbError::Constraint {
                what: "EIS checkpoint interval must be in (0, 100]",
            }
            .into());
        }
        ensure_finite(self.soc_safety_ceiling_pct, "SOC safety ceiling")?;
        if self.soc_safety_ceiling_pct <= 100.0 {
            return Err(CbError::Constraint {
                what: "SOC safety ceiling must exceed 100%",
            }
            .into());
        }
        ensure_positive(self.phase_timeout_s, "phase timeout")?;
        ensure_non_negative(self.settle_s, "settle time")?;
        ensure_positive(self.log_interval_s, "log interval")?;
        ensure_non_negative(self.poll_interval_s, "poll interval")?;
        ensure_non_negative(self.stabilize_delay_s, "stabilize delay")?;
        if self.source_pin == self.potentiostat_pin {
            return Err(CbError::Constraint {
                what: "source and potentiostat must use different relay pins",
            }
            .into());
        }
        if self.thermal.enabled {
            ensure_positive(self.thermal.tolerance_c, "thermal tolerance")?;
            ensure_positive(self.thermal.poll_interval_s, "thermal poll interval")?;
            ensure_positive(self.thermal.wait_timeout_s, "thermal wait timeout")?;
            ensure_non_negative(self.thermal.dwell_s, "thermal dwell")?;
            ensure_finite(self.thermal.setpoint_c, "thermal setpoint")?;
        }
        ensure_non_negative(self.thermal.disabled_settle_s, "disabled-thermal settle")?;
        ensure_positive(self.ocv.duration_s, "OCV rest duration")?;
        ensure_positive(self.ocv.sample_period_s, "OCV sample period")?;
        ensure_positive(self.geis.amplitude_a, "GEIS amplitude")?;
        ensure_positive(self.geis.freq_start_hz, "GEIS start frequency")?;
        ensure_positive(self.geis.freq_end_hz, "GEIS end frequency")?;
        if self.geis.freq_end_hz >= self.geis.freq_start_hz {
            return Err(CbError::Constraint {
                what: "GEIS sweep must run from high to low frequency",
            }
            .into());
        }
        if self.geis.points_per_decade == 0 {
            return Err(CbError::Constraint {
                what: "GEIS points per decade must be at least 1",
            }
            .into());
        }
        Ok(())
    }

    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            poll_interval_s: self.poll_interval_s,
            stabilize_delay_s: self.stabilize_delay_s,
        }
    }

    pub fn switch_pins(&self) -> SwitchPins {
        SwitchPins {
            source_pin: self.source_pin,
            potentiostat_pin: self.potentiostat_pin,
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            ocv: self.ocv,
            geis: self.geis,
        }
    }

    /// Leg parameters for a charge toward `charge_voltage_v`.
    pub fn charge_leg(&self) -> ControlParams {
        ControlParams {
            target_voltage_v: self.charge_voltage_v,
            current_a: self.charge_current_a,
            current_threshold_a: self.current_threshold_a,
            timeout_s: self.phase_timeout_s,
        }
    }

    /// Leg parameters for a discharge toward `discharge_voltage_v`.
    pub fn discharge_leg(&self) -> ControlParams {
        ControlParams {
            target_voltage_v: self.discharge_voltage_v,
            current_a: self.discharge_current_a,
            current_threshold_a: self.current_threshold_a,
            timeout_s: self.phase_timeout_s,
        }
    }

    /// Phase-3 charge parameters around a measured capacity estimate.
    pub fn eis_charge(&self, estimated_capacity_mah: f64) -> ChargeParams {
        ChargeParams {
            charge_voltage_v: self.charge_voltage_v,
            charge_current_a: self.charge_current_a,
            current_threshold_a: self.current_threshold_a,
            estimated_capacity_mah,
            soc_safety_ceiling_pct: self.soc_safety_ceiling_pct,
            timeout_s: self.phase_timeout_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;

    #[test]
    fn defaults_pass_validation() {
        ExperimentParams::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_voltage_window() {
        let params = ExperimentParams {
            charge_voltage_v: 2.8,
            ..ExperimentParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(RunError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn rejects_shared_relay_pin() {
        let params = ExperimentParams {
            potentiostat_pin: 0,
            ..ExperimentParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(RunError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn rejects_safety_ceiling_at_or_below_full() {
        let params = ExperimentParams {
            soc_safety_ceiling_pct: 100.0,
            ..ExperimentParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(RunError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_checkpoint_interval() {
        for interval in [0.0, -10.0, 150.0, f64::NAN] {
            let params = ExperimentParams {
                eis_interval_pct: interval,
                ..ExperimentParams::default()
            };
            assert!(params.validate().is_err(), "interval {interval} accepted");
        }
    }

    #[test]
    fn nan_values_surface_as_non_finite_rejections() {
        let params = ExperimentParams {
            charge_current_a: f64::NAN,
            ..ExperimentParams::default()
        };
        let err = params.validate().unwrap_err();
        assert!(matches!(
            err,
            RunError::InvalidParameter(CbError::NonFinite { .. })
        ));
        assert!(format!("{err}").contains("charge current"));
    }

    #[test]
    fn disabled_thermal_skips_thermal_range_checks() {
        let params = ExperimentParams {
            thermal: ThermalSettings {
                enabled: false,
                tolerance_c: 0.0,
                ..ThermalSettings::default()
            },
            ..ExperimentParams::default()
        };
        params.validate().unwrap();
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let params: ExperimentParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params, ExperimentParams::default());

        let params: ExperimentParams =
            serde_json::from_str(r#"{"charge_voltage_v": 4.1}"#).unwrap();
        assert_eq!(params.charge_voltage_v, 4.1);
        assert_eq!(params.eis_interval_pct, 25.0);
    }
}
