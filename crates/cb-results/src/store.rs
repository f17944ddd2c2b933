//! Run storage API.
//!
//! One directory per run: `manifest.json`, `settings.json`, `summary.json`,
//! one `series_<label>.jsonl` per control leg, and `eis.jsonl` with one
//! measurement per line. Series and EIS files are append-only so a run that
//! dies mid-phase keeps everything recorded up to that point.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::types::{EisMeasurement, RunManifest, RunSummary, SeriesSample};
use crate::{ResultsError, ResultsResult};

#[derive(Clone)]
pub struct RunStore {
    root_dir: PathBuf,
}

impl RunStore {
    pub fn new(root_dir: PathBuf) -> ResultsResult<Self> {
        if !root_dir.exists() {
            fs::create_dir_all(&root_dir)?;
        }
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root_dir.join(run_id)
    }

    pub fn has_run(&self, run_id: &str) -> bool {
        self.run_dir(run_id).join("manifest.json").exists()
    }

    /// Write (or rewrite) the run manifest, creating the run directory.
    pub fn save_manifest(&self, manifest: &RunManifest) -> ResultsResult<()> {
        let run_dir = self.run_dir(&manifest.run_id);
        fs::create_dir_all(&run_dir)?;
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(run_dir.join("manifest.json"), json)?;
        Ok(())
    }

    /// Snapshot the configured parameters next to the manifest.
    pub fn save_settings<S: Serialize>(&self, run_id: &str, settings: &S) -> ResultsResult<()> {
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir)?;
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(run_dir.join("settings.json"), json)?;
        Ok(())
    }

    pub fn save_summary(&self, summary: &RunSummary) -> ResultsResult<()> {
        let run_dir = self.run_dir(&summary.run_id);
        fs::create_dir_all(&run_dir)?;
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(run_dir.join("summary.json"), json)?;
        Ok(())
    }

    /// Append time-series rows for one leg.
    pub fn append_series(
        &self,
        run_id: &str,
        label: &str,
        samples: &[SeriesSample],
    ) -> ResultsResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut content = String::new();
        for sample in samples {
            content.push_str(&serde_json::to_string(sample)?);
            content.push('\n');
        }
        self.append(run_id, &format!("series_{label}.jsonl"), &content)
    }

    /// Append one impedance measurement.
    pub fn append_eis(&self, run_id: &str, measurement: &EisMeasurement) -> ResultsResult<()> {
        let mut line = serde_json::to_string(measurement)?;
        line.push('\n');
        self.append(run_id, "eis.jsonl", &line)
    }

    fn append(&self, run_id: &str, file_name: &str, content: &str) -> ResultsResult<()> {
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(file_name))?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    pub fn load_manifest(&self, run_id: &str) -> ResultsResult<RunManifest> {
        let path = self.run_dir(run_id).join("manifest.json");
        if !path.exists() {
            return Err(ResultsError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load_summary(&self, run_id: &str) -> ResultsResult<RunSummary> {
        let path = self.run_dir(run_id).join("summary.json");
        if !path.exists() {
            return Err(ResultsError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load_series(&self, run_id: &str, label: &str) -> ResultsResult<Vec<SeriesSample>> {
        let path = self.run_dir(run_id).join(format!("series_{label}.jsonl"));
        if !path.exists() {
            return Err(ResultsError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        let content = fs::read_to_string(path)?;
        let mut samples = Vec::new();
        for line in content.lines() {
            if !line.trim().is_empty() {
                samples.push(serde_json::from_str(line)?);
            }
        }
        Ok(samples)
    }

    pub fn load_eis(&self, run_id: &str) -> ResultsResult<Vec<EisMeasurement>> {
        let path = self.run_dir(run_id).join("eis.jsonl");
        if !path.exists() {
            // A run with no surviving checkpoints is still a valid run.
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        let mut measurements = Vec::new();
        for line in content.lines() {
            if !line.trim().is_empty() {
                measurements.push(serde_json::from_str(line)?);
            }
        }
        Ok(measurements)
    }

    /// Leg labels that have a series file in this run.
    pub fn series_labels(&self, run_id: &str) -> ResultsResult<Vec<String>> {
        let run_dir = self.run_dir(run_id);
        let mut labels = Vec::new();
        if !run_dir.exists() {
            return Ok(labels);
        }
        for entry in fs::read_dir(run_dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(label) = name
                .strip_prefix("series_")
                .and_then(|rest| rest.strip_suffix(".jsonl"))
            {
                labels.push(label.to_string());
            }
        }
        labels.sort();
        Ok(labels)
    }

    pub fn list_runs(&self) -> ResultsResult<Vec<RunManifest>> {
        let mut runs = Vec::new();
        if !self.root_dir.exists() {
            return Ok(runs);
        }
        for entry in fs::read_dir(&self.root_dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                let run_id = entry.file_name().to_string_lossy().to_string();
                if let Ok(manifest) = self.load_manifest(&run_id) {
                    runs.push(manifest);
                }
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    pub fn delete_run(&self, run_id: &str) -> ResultsResult<()> {
        let run_dir = self.run_dir(run_id);
        if run_dir.exists() {
            fs::remove_dir_all(run_dir)?;
        }
        Ok(())
    }
}
