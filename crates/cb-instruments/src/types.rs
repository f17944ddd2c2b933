//! Shared instrument data types.

use serde::{Deserialize, Serialize};

/// Priority level attached to every queued instrument command.
///
/// `High` is reserved for safety-relevant commands (output disables and relay
/// opens on shutdown paths); `Low` is for background sampling that may lag
/// behind control traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum CommandPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Instantaneous power-source readback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceStatus {
    /// Terminal voltage (V).
    pub voltage_v: f64,
    /// Terminal current (A); positive while charging the cell, negative while
    /// discharging it.
    pub current_a: f64,
    /// Terminal power (W), signed like the current.
    pub power_w: f64,
    pub output_enabled: bool,
}

/// One thermal-zone reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneReading {
    pub zone: usize,
    pub temp_c: f64,
    /// True when the controller reported a sensor/loop fault for this zone;
    /// the reading must then not be trusted as in-tolerance.
    pub fault: bool,
}

/// Structured result of a blocking potentiostat sweep: named variables with
/// one data column per variable, all columns the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRecord {
    pub variable_names: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl SweepRecord {
    pub fn new(variable_names: Vec<String>, columns: Vec<Vec<f64>>) -> Self {
        Self {
            variable_names,
            columns,
        }
    }

    /// Number of data points per variable (0 for an empty record).
    pub fn points(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn variables(&self) -> usize {
        self.variable_names.len()
    }

    /// Column lookup by variable name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.variable_names
            .iter()
            .position(|n| n == name)
            .and_then(|idx| self.columns.get(idx))
            .map(|c| c.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(CommandPriority::Low < CommandPriority::Normal);
        assert!(CommandPriority::Normal < CommandPriority::High);
        assert_eq!(CommandPriority::default(), CommandPriority::Normal);
    }

    #[test]
    fn sweep_record_column_lookup() {
        let record = SweepRecord::new(
            vec!["freq_hz".to_string(), "re_z_ohm".to_string()],
            vec![vec![1000.0, 100.0], vec![0.05, 0.06]],
        );
        assert_eq!(record.points(), 2);
        assert_eq!(record.variables(), 2);
        assert_eq!(record.column("re_z_ohm"), Some(&[0.05, 0.06][..]));
        assert_eq!(record.column("missing"), None);
    }

    #[test]
    fn empty_sweep_has_zero_points() {
        let record = SweepRecord::new(Vec::new(), Vec::new());
        assert_eq!(record.points(), 0);
        assert_eq!(record.variables(), 0);
    }
}
