//! Result data types.

use serde::{Deserialize, Serialize};

pub type RunId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    /// Experiment protocol identifier (currently always "characterization").
    pub kind: String,
    /// RFC 3339 start timestamp.
    pub started_at: String,
    pub engine_version: String,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Final record of one control leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    /// Stable leg label, e.g. "phase2_charge"; also names the series file.
    pub label: String,
    /// Transferred capacity magnitude (mAh).
    pub capacity_mah: f64,
    /// Transferred energy magnitude (Wh).
    pub energy_wh: f64,
    pub start_voltage_v: f64,
    pub end_voltage_v: f64,
    pub duration_s: f64,
    /// Free-text completion classification ("success", "timeout", ...).
    pub completion: String,
}

/// One persisted zone temperature reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    pub elapsed_s: f64,
    pub zone: usize,
    pub temp_c: f64,
    pub fault: bool,
}

/// One impedance checkpoint. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EisMeasurement {
    pub target_soc_pct: f64,
    pub actual_soc_pct: f64,
    /// Seconds into the charge when the checkpoint fired.
    pub elapsed_s: f64,
    /// RFC 3339 wall-clock capture timestamp.
    pub captured_at: String,
    pub ocv_v: f64,
    pub freq_hz: Vec<f64>,
    pub re_z_ohm: Vec<f64>,
    pub im_z_ohm: Vec<f64>,
    /// Retries consumed before the capture succeeded (0 = first try).
    pub retry_count: u32,
    /// Chamber snapshot at capture time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub temperatures: Vec<TemperatureSample>,
}

impl EisMeasurement {
    pub fn points(&self) -> usize {
        self.freq_hz.len()
    }
}

/// One live time-series row, recorded at the log interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSample {
    pub elapsed_s: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soc_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zone_temps_c: Vec<f64>,
}

/// Condensed checkpoint row carried in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EisSummaryPoint {
    pub target_soc_pct: f64,
    pub actual_soc_pct: f64,
    pub ocv_v: f64,
    pub retry_count: u32,
}

/// End-of-run composite written on every exit path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub completed_at: String,
    pub phases: Vec<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_capacity_mah: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discharge_capacity_mah: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coulombic_efficiency_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_efficiency_pct: Option<f64>,
    /// Estimated battery capacity after Phase-3 revisions (mAh).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_capacity_mah: Option<f64>,
    /// SOC estimate after the Phase-4 half-capacity discharge (%).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_soc_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eis_points: Vec<EisSummaryPoint>,
}
