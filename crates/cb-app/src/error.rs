//! Application-level error type.
//!
//! Engine errors are flattened into a small set of variants so callers (CLIs,
//! UIs) match on outcome categories instead of re-exporting every engine enum.

use std::path::PathBuf;

use cb_results::ResultsError;
use cb_run::RunError;

/// Errors surfaced by the service layer.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Another experiment already holds the bench.
    #[error("An experiment is already running")]
    Busy,

    #[error("Failed to read settings file: {path}")]
    SettingsFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write settings file: {path}")]
    SettingsFileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Experiment cancelled")]
    Cancelled,

    #[error("Experiment failed: {0}")]
    Run(String),

    #[error("Results storage error: {0}")]
    Results(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<RunError> for AppError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Cancelled => AppError::Cancelled,
            RunError::InvalidParameter { .. } => AppError::Validation(err.to_string()),
            other => AppError::Run(other.to_string()),
        }
    }
}

impl From<ResultsError> for AppError {
    fn from(err: ResultsError) -> Self {
        match err {
            ResultsError::RunNotFound { run_id } => AppError::RunNotFound(run_id),
            other => AppError::Results(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use cb_core::ensure_positive;

    use super::*;

    #[test]
    fn cancellation_keeps_its_own_variant() {
        let err = AppError::from(RunError::Cancelled);
        assert!(matches!(err, AppError::Cancelled));
    }

    #[test]
    fn parameter_errors_fold_into_validation() {
        let invalid = ensure_positive(-0.5, "charge voltage").unwrap_err();
        let err = AppError::from(RunError::from(invalid));
        match err {
            AppError::Validation(msg) => assert!(msg.contains("charge voltage")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn missing_runs_keep_the_run_id() {
        let err = AppError::from(ResultsError::RunNotFound {
            run_id: "abc123".into(),
        });
        match err {
            AppError::RunNotFound(id) => assert_eq!(id, "abc123"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
