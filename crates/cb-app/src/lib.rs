//! cb-app: the caller-facing application layer.
//!
//! Bundles everything a frontend needs to run the bench: settings files,
//! background run execution with progress events, and CSV export of stored
//! results. CLIs and UIs depend on this crate instead of wiring the engine
//! crates together themselves.

pub mod error;
pub mod export;
pub mod service;
pub mod settings;

pub use error::{AppError, AppResult};
pub use service::{ExperimentService, RunHandle, ServiceEvent};
pub use settings::{load_settings, save_settings, validate_settings};
