//! Experiment settings persistence.
//!
//! Settings are the full [`ExperimentParams`] block serialized as YAML.
//! Missing keys fall back to their defaults on load, so a settings file only
//! needs to name the values it overrides.

use std::path::Path;

use cb_run::ExperimentParams;
use tracing::info;

use crate::error::{AppError, AppResult};

/// Load experiment settings from a YAML file.
pub fn load_settings(path: &Path) -> AppResult<ExperimentParams> {
    let content = std::fs::read_to_string(path).map_err(|e| AppError::SettingsFileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let params: ExperimentParams = serde_yaml::from_str(&content)
        .map_err(|e| AppError::Settings(format!("Failed to parse settings: {e}")))?;
    info!(path = %path.display(), "loaded experiment settings");
    Ok(params)
}

/// Save experiment settings to a YAML file.
pub fn save_settings(path: &Path, params: &ExperimentParams) -> AppResult<()> {
    let content = serde_yaml::to_string(params)
        .map_err(|e| AppError::Settings(format!("Failed to serialize settings: {e}")))?;
    std::fs::write(path, content).map_err(|e| AppError::SettingsFileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    info!(path = %path.display(), "saved experiment settings");
    Ok(())
}

/// Check settings without touching any instrument.
pub fn validate_settings(params: &ExperimentParams) -> AppResult<()> {
    params.validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn unique_temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("cb-app-{name}-{nanos}.yaml"))
    }

    #[test]
    fn settings_survive_a_yaml_round_trip() {
        let path = unique_temp_path("roundtrip");
        let mut params = ExperimentParams::default();
        params.charge_current_a = 0.75;
        params.eis_interval_pct = 20.0;
        params.thermal.setpoint_c = 35.0;

        save_settings(&path, &params).expect("save");
        let loaded = load_settings(&path).expect("load");
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, params);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let path = unique_temp_path("partial");
        std::fs::write(&path, "charge_voltage_v: 4.1\n").expect("write");
        let loaded = load_settings(&path).expect("load");
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.charge_voltage_v, 4.1);
        assert_eq!(
            loaded.discharge_voltage_v,
            ExperimentParams::default().discharge_voltage_v
        );
    }

    #[test]
    fn missing_file_reports_the_path() {
        let path = unique_temp_path("missing");
        let err = load_settings(&path).expect_err("load must fail");
        match err {
            AppError::SettingsFileRead { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn malformed_yaml_is_a_settings_error() {
        let path = unique_temp_path("malformed");
        std::fs::write(&path, "charge_voltage_v: [not a number\n").expect("write");
        let err = load_settings(&path).expect_err("load must fail");
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, AppError::Settings(_)));
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut params = ExperimentParams::default();
        params.discharge_voltage_v = 5.0;
        assert!(matches!(
            validate_settings(&params),
            Err(AppError::Validation(_))
        ));
        assert!(validate_settings(&ExperimentParams::default()).is_ok());
    }
}
