//! CSV rendering of stored run data.
//!
//! Pure string builders; callers decide whether the result lands in a file or
//! on stdout.

use cb_results::{EisMeasurement, SeriesSample};

/// Render one phase series as CSV.
///
/// Zone temperature columns are sized to the widest row, so a series recorded
/// with intermittent chamber faults still lines up.
pub fn series_csv(rows: &[SeriesSample]) -> String {
    let zones = rows.iter().map(|r| r.zone_temps_c.len()).max().unwrap_or(0);
    let mut csv = String::from("elapsed_s,voltage_v,current_a,power_w,soc_pct");
    for zone in 0..zones {
        csv.push_str(&format!(",zone{zone}_temp_c"));
    }
    csv.push('\n');
    for row in rows {
        let soc = row.soc_pct.map(|v| format!("{v:.2}")).unwrap_or_default();
        csv.push_str(&format!(
            "{:.3},{:.4},{:.4},{:.4},{}",
            row.elapsed_s, row.voltage_v, row.current_a, row.power_w, soc
        ));
        for zone in 0..zones {
            match row.zone_temps_c.get(zone) {
                Some(temp) => csv.push_str(&format!(",{temp:.2}")),
                None => csv.push(','),
            }
        }
        csv.push('\n');
    }
    csv
}

/// Render one impedance checkpoint as CSV: the frequency sweep with derived
/// modulus and phase per point.
pub fn eis_csv(measurement: &EisMeasurement) -> String {
    let mut csv = String::from("freq_hz,re_z_ohm,im_z_ohm,z_mod_ohm,z_phase_deg\n");
    for ((freq, re), im) in measurement
        .freq_hz
        .iter()
        .zip(&measurement.re_z_ohm)
        .zip(&measurement.im_z_ohm)
    {
        let z_mod = (re * re + im * im).sqrt();
        let phase_deg = im.atan2(*re).to_degrees();
        csv.push_str(&format!(
            "{freq:.4},{re:.6},{im:.6},{z_mod:.6},{phase_deg:.3}\n"
        ));
    }
    csv
}

/// Render the checkpoint overview of a run as CSV, one row per capture.
pub fn eis_overview_csv(measurements: &[EisMeasurement]) -> String {
    let mut csv =
        String::from("checkpoint,target_soc_pct,actual_soc_pct,elapsed_s,ocv_v,points,retries\n");
    for (index, m) in measurements.iter().enumerate() {
        csv.push_str(&format!(
            "{index},{:.1},{:.1},{:.1},{:.4},{},{}\n",
            m.target_soc_pct,
            m.actual_soc_pct,
            m.elapsed_s,
            m.ocv_v,
            m.points(),
            m.retry_count
        ));
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(elapsed_s: f64, zone_temps_c: Vec<f64>) -> SeriesSample {
        SeriesSample {
            elapsed_s,
            voltage_v: 3.7,
            current_a: -1.0,
            power_w: -3.7,
            soc_pct: Some(42.5),
            zone_temps_c,
        }
    }

    fn measurement() -> EisMeasurement {
        EisMeasurement {
            target_soc_pct: 25.0,
            actual_soc_pct: 25.4,
            elapsed_s: 120.0,
            captured_at: "2026-08-25T12:00:00+00:00".into(),
            ocv_v: 3.62,
            freq_hz: vec![1000.0, 100.0],
            re_z_ohm: vec![0.05, 0.06],
            im_z_ohm: vec![-0.01, -0.02],
            retry_count: 1,
            temperatures: Vec::new(),
        }
    }

    #[test]
    fn series_header_matches_the_widest_row() {
        let rows = vec![sample(0.0, vec![25.0]), sample(1.0, vec![25.0, 26.0])];
        let csv = series_csv(&rows);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("elapsed_s,voltage_v,current_a,power_w,soc_pct,zone0_temp_c,zone1_temp_c")
        );
        // The narrow row pads its missing zone with an empty field.
        let first = lines.next().expect("first row");
        assert_eq!(first.matches(',').count(), 6);
        assert!(first.ends_with(",25.00,"));
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn series_without_soc_leaves_the_field_empty() {
        let mut row = sample(2.0, Vec::new());
        row.soc_pct = None;
        let csv = series_csv(&[row]);
        assert!(csv.ends_with(",-3.7000,\n"), "csv was: {csv:?}");
    }

    #[test]
    fn eis_rows_carry_modulus_and_phase() {
        let csv = eis_csv(&measurement());
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("freq_hz,re_z_ohm,im_z_ohm,z_mod_ohm,z_phase_deg")
        );
        let first = lines.next().expect("first point");
        let fields: Vec<&str> = first.split(',').collect();
        assert_eq!(fields[0], "1000.0000");
        // |Z| = sqrt(0.05^2 + 0.01^2), phase = atan2(-0.01, 0.05).
        let z_mod: f64 = fields[3].parse().expect("modulus");
        assert!((z_mod - 0.050990).abs() < 1e-6);
        let phase: f64 = fields[4].parse().expect("phase");
        assert!((phase - (-11.310)).abs() < 1e-3);
    }

    #[test]
    fn overview_indexes_checkpoints_in_order() {
        let csv = eis_overview_csv(&[measurement(), measurement()]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0,25.0,25.4,"));
        assert!(lines[2].starts_with("1,"));
        assert!(lines[1].ends_with(",2,1"));
    }

    #[test]
    fn empty_inputs_render_header_only() {
        assert_eq!(series_csv(&[]).lines().count(), 1);
        assert_eq!(eis_csv(&measurement()).lines().count(), 3);
        assert_eq!(eis_overview_csv(&[]).lines().count(), 1);
    }
}
