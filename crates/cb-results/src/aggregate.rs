//! Per-run efficiency and summary computation.

use crate::types::{EisMeasurement, EisSummaryPoint, PhaseResult, RunStatus, RunSummary};

/// Capacity totals the orchestrator accumulates while phases execute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTotals {
    /// Phase-2 charge leg (mAh / Wh, magnitudes).
    pub charge_capacity_mah: Option<f64>,
    pub charge_energy_wh: Option<f64>,
    /// Phase-2 discharge leg (mAh / Wh, magnitudes).
    pub discharge_capacity_mah: Option<f64>,
    pub discharge_energy_wh: Option<f64>,
    /// Estimated battery capacity after Phase-3 revisions (mAh).
    pub estimated_capacity_mah: Option<f64>,
    /// Phase-4 target and achieved discharge (mAh, magnitudes).
    pub phase4_target_mah: Option<f64>,
    pub phase4_actual_mah: Option<f64>,
}

/// Discharged over charged capacity, in percent.
pub fn coulombic_efficiency_pct(charge_mah: f64, discharge_mah: f64) -> Option<f64> {
    let charge = charge_mah.abs();
    if charge <= 0.0 {
        return None;
    }
    Some(discharge_mah.abs() / charge * 100.0)
}

/// Discharged over charged energy, in percent.
pub fn energy_efficiency_pct(charge_wh: f64, discharge_wh: f64) -> Option<f64> {
    let charge = charge_wh.abs();
    if charge <= 0.0 {
        return None;
    }
    Some(discharge_wh.abs() / charge * 100.0)
}

/// SOC estimate after discharging `actual_mah` where `target_mah` was half the
/// measured capacity: `50 % - overshoot/estimated`.
pub fn final_soc_pct(actual_mah: f64, target_mah: f64, estimated_capacity_mah: f64) -> Option<f64> {
    if estimated_capacity_mah <= 0.0 {
        return None;
    }
    Some(50.0 - (actual_mah.abs() - target_mah.abs()) / estimated_capacity_mah * 100.0)
}

/// Compose the end-of-run summary from phase results, accumulated totals, and
/// the stored measurements.
pub fn compose_summary(
    run_id: &str,
    status: RunStatus,
    completed_at: String,
    phases: Vec<PhaseResult>,
    totals: &RunTotals,
    measurements: &[EisMeasurement],
) -> RunSummary {
    let coulombic_efficiency_pct = match (totals.charge_capacity_mah, totals.discharge_capacity_mah)
    {
        (Some(charge), Some(discharge)) => coulombic_efficiency_pct(charge, discharge),
        _ => None,
    };
    let energy_efficiency_pct = match (totals.charge_energy_wh, totals.discharge_energy_wh) {
        (Some(charge), Some(discharge)) => energy_efficiency_pct(charge, discharge),
        _ => None,
    };
    let final_soc_pct = match (
        totals.phase4_actual_mah,
        totals.phase4_target_mah,
        totals.estimated_capacity_mah,
    ) {
        (Some(actual), Some(target), Some(estimated)) => final_soc_pct(actual, target, estimated),
        _ => None,
    };
    let eis_points = measurements
        .iter()
        .map(|m| EisSummaryPoint {
            target_soc_pct: m.target_soc_pct,
            actual_soc_pct: m.actual_soc_pct,
            ocv_v: m.ocv_v,
            retry_count: m.retry_count,
        })
        .collect();

    RunSummary {
        run_id: run_id.to_string(),
        status,
        completed_at,
        phases,
        charge_capacity_mah: totals.charge_capacity_mah,
        discharge_capacity_mah: totals.discharge_capacity_mah,
        coulombic_efficiency_pct,
        energy_efficiency_pct,
        estimated_capacity_mah: totals.estimated_capacity_mah,
        final_soc_pct,
        eis_points,
    }
}

#[cfg(test)]
mod tests {
    use cb_core::{Tolerances, nearly_equal};

    use super::*;

    fn close(a: f64, b: f64) -> bool {
        nearly_equal(a, b, Tolerances::default())
    }

    #[test]
    fn coulombic_efficiency_for_1000_950_is_95() {
        let eff = coulombic_efficiency_pct(1000.0, 950.0).unwrap();
        assert!(close(eff, 95.0));
    }

    #[test]
    fn efficiencies_use_magnitudes() {
        // Discharge legs integrate negative; the ratio must not care.
        let eff = coulombic_efficiency_pct(1000.0, -950.0).unwrap();
        assert!(close(eff, 95.0));
        let eff = energy_efficiency_pct(4.0, -3.6).unwrap();
        assert!(close(eff, 90.0));
    }

    #[test]
    fn zero_charge_has_no_efficiency() {
        assert_eq!(coulombic_efficiency_pct(0.0, 950.0), None);
        assert_eq!(energy_efficiency_pct(0.0, 1.0), None);
    }

    #[test]
    fn final_soc_is_50_when_discharge_hits_target() {
        let soc = final_soc_pct(500.0, 500.0, 1000.0).unwrap();
        assert!(close(soc, 50.0));
    }

    #[test]
    fn final_soc_drops_below_50_on_overshoot() {
        // 20 mAh over on a 1000 mAh battery: 2 % low.
        let soc = final_soc_pct(520.0, 500.0, 1000.0).unwrap();
        assert!(close(soc, 48.0));
    }

    #[test]
    fn summary_composition_fills_derived_fields() {
        let totals = RunTotals {
            charge_capacity_mah: Some(1000.0),
            charge_energy_wh: Some(4.0),
            discharge_capacity_mah: Some(950.0),
            discharge_energy_wh: Some(3.6),
            estimated_capacity_mah: Some(1000.0),
            phase4_target_mah: Some(475.0),
            phase4_actual_mah: Some(475.0),
        };
        let measurements = vec![EisMeasurement {
            target_soc_pct: 0.0,
            actual_soc_pct: 0.0,
            elapsed_s: 0.0,
            captured_at: "2026-03-01T00:00:00Z".to_string(),
            ocv_v: 3.0,
            freq_hz: vec![1000.0],
            re_z_ohm: vec![0.05],
            im_z_ohm: vec![-0.01],
            retry_count: 1,
            temperatures: Vec::new(),
        }];
        let summary = compose_summary(
            "run-1",
            RunStatus::Completed,
            "2026-03-01T06:00:00Z".to_string(),
            Vec::new(),
            &totals,
            &measurements,
        );

        assert_eq!(summary.status, RunStatus::Completed);
        assert!(close(summary.coulombic_efficiency_pct.unwrap(), 95.0));
        assert!(close(summary.energy_efficiency_pct.unwrap(), 90.0));
        assert!(close(summary.final_soc_pct.unwrap(), 50.0));
        assert_eq!(summary.eis_points.len(), 1);
        assert_eq!(summary.eis_points[0].retry_count, 1);
    }

    #[test]
    fn summary_tolerates_missing_phases() {
        let summary = compose_summary(
            "run-2",
            RunStatus::Cancelled,
            "2026-03-01T00:10:00Z".to_string(),
            Vec::new(),
            &RunTotals::default(),
            &[],
        );
        assert_eq!(summary.coulombic_efficiency_pct, None);
        assert_eq!(summary.final_soc_pct, None);
        assert!(summary.eis_points.is_empty());
    }
}
