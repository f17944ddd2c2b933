use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use cb_app::{
    AppError, AppResult, ExperimentService, ServiceEvent, export, load_settings, save_settings,
    validate_settings,
};
use cb_core::SystemClock;
use cb_instruments::mock::{SimBench, SimCellSpec};
use cb_results::{RunStatus, RunStore, RunSummary};
use cb_run::ExperimentParams;

#[derive(Parser)]
#[command(name = "cb-cli")]
#[command(about = "CellBench CLI - Battery characterization bench", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default settings file
    InitSettings {
        /// Destination path for the settings YAML file
        settings_path: PathBuf,
    },
    /// Validate an experiment settings file
    Validate {
        /// Path to the settings YAML file
        settings_path: PathBuf,
    },
    /// Run a characterization experiment on the simulated bench
    Run {
        /// Path to the settings YAML file
        settings_path: PathBuf,
        /// Directory run results are stored in
        data_dir: PathBuf,
        /// Initial cell charge handed to the simulated cell (mAh)
        #[arg(long)]
        initial_charge_mah: Option<f64>,
    },
    /// List stored runs
    Runs {
        /// Directory run results are stored in
        data_dir: PathBuf,
    },
    /// Show details of a stored run
    ShowRun {
        /// Directory run results are stored in
        data_dir: PathBuf,
        /// Run ID to display
        run_id: String,
    },
    /// Export one phase series from a run as CSV
    ExportSeries {
        /// Directory run results are stored in
        data_dir: PathBuf,
        /// Run ID
        run_id: String,
        /// Series label (e.g., phase2_charge, phase4_discharge)
        label: String,
        /// Output CSV file path (optional, defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Export impedance checkpoint data from a run as CSV
    ExportEis {
        /// Directory run results are stored in
        data_dir: PathBuf,
        /// Run ID
        run_id: String,
        /// Checkpoint index; omitted exports the one-row-per-checkpoint overview
        #[arg(long)]
        checkpoint: Option<usize>,
        /// Output CSV file path (optional, defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> AppResult<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitSettings { settings_path } => cmd_init_settings(&settings_path),
        Commands::Validate { settings_path } => cmd_validate(&settings_path),
        Commands::Run {
            settings_path,
            data_dir,
            initial_charge_mah,
        } => cmd_run(&settings_path, &data_dir, initial_charge_mah.unwrap_or(0.0)),
        Commands::Runs { data_dir } => cmd_runs(&data_dir),
        Commands::ShowRun { data_dir, run_id } => cmd_show_run(&data_dir, &run_id),
        Commands::ExportSeries {
            data_dir,
            run_id,
            label,
            output,
        } => cmd_export_series(&data_dir, &run_id, &label, output.as_deref()),
        Commands::ExportEis {
            data_dir,
            run_id,
            checkpoint,
            output,
        } => cmd_export_eis(&data_dir, &run_id, checkpoint, output.as_deref()),
    }
}

fn cmd_init_settings(settings_path: &Path) -> AppResult<()> {
    if settings_path.exists() {
        return Err(AppError::Settings(format!(
            "refusing to overwrite existing file: {}",
            settings_path.display()
        )));
    }
    save_settings(settings_path, &ExperimentParams::default())?;
    println!("✓ Wrote default settings to {}", settings_path.display());
    Ok(())
}

fn cmd_validate(settings_path: &Path) -> AppResult<()> {
    println!("Validating settings: {}", settings_path.display());
    let params = load_settings(settings_path)?;
    validate_settings(&params)?;
    println!("✓ Settings are valid");
    println!(
        "  charge to {:.2} V at {:.2} A, discharge to {:.2} V at {:.2} A",
        params.charge_voltage_v,
        params.charge_current_a,
        params.discharge_voltage_v,
        params.discharge_current_a
    );
    println!(
        "  impedance checkpoints every {:.0}% SOC, up to {} dynamic targets",
        params.eis_interval_pct, params.max_dynamic_targets
    );
    if params.thermal.enabled {
        println!(
            "  thermal setpoint {:.1} C, tolerance {:.1} C",
            params.thermal.setpoint_c, params.thermal.tolerance_c
        );
    } else {
        println!("  thermal synchronization disabled");
    }
    Ok(())
}

fn cmd_run(settings_path: &Path, data_dir: &Path, initial_charge_mah: f64) -> AppResult<()> {
    let params = load_settings(settings_path)?;
    let store = RunStore::new(data_dir.to_path_buf())?;

    println!("Running characterization on the simulated bench");
    println!("  settings: {}", settings_path.display());
    println!("  results:  {}", data_dir.display());

    let clock = Arc::new(SystemClock::new());
    let sim = SimBench::new(
        SimCellSpec {
            initial_charge_mah,
            ..SimCellSpec::default()
        },
        clock.clone(),
    );
    let service = ExperimentService::new(sim.bench(), clock, store);
    let handle = service.start_characterization(params)?;

    let mut fraction = 0.0f64;
    let mut phase = String::from("setup");
    let mut status = String::new();
    let mut last_emit = Instant::now();
    for event in handle.events().iter() {
        match event {
            ServiceEvent::Status { text } => status = text,
            ServiceEvent::Progress { fraction: f } => fraction = f,
            ServiceEvent::PhaseChanged { phase: p } => {
                phase = p.to_string();
                render_progress(fraction, &phase, &status);
                last_emit = Instant::now();
                continue;
            }
            ServiceEvent::Eis { measurement } => {
                clear_progress_line();
                println!(
                    "  ✓ impedance checkpoint at {:.1}% SOC: {} points, OCV {:.3} V",
                    measurement.actual_soc_pct,
                    measurement.points(),
                    measurement.ocv_v
                );
                render_progress(fraction, &phase, &status);
                last_emit = Instant::now();
                continue;
            }
            ServiceEvent::Series { .. } => {}
            ServiceEvent::Finished { .. } | ServiceEvent::Failed { .. } => break,
        }
        if last_emit.elapsed().as_millis() >= 100 {
            render_progress(fraction, &phase, &status);
            last_emit = Instant::now();
        }
    }
    clear_progress_line();

    let summary = handle.wait()?;
    println!("✓ Run completed: {}", summary.run_id);
    println!();
    print_summary(&summary);
    Ok(())
}

fn clear_progress_line() {
    print!("\r{}\r", " ".repeat(180));
    let _ = io::stdout().flush();
}

fn render_progress(fraction: f64, phase: &str, status: &str) {
    let width = 28usize;
    let filled = ((fraction * width as f64).round() as usize).min(width);
    let bar = format!(
        "{}{}",
        "#".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    print!(
        "\r[{}] {:>5.1}%  phase={}  {}",
        bar,
        fraction * 100.0,
        phase,
        status
    );
    let _ = io::stdout().flush();
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::InProgress => "in progress",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn print_summary(summary: &RunSummary) {
    println!("  Status:    {}", status_label(summary.status));
    println!("  Completed: {}", summary.completed_at);
    println!();
    println!(
        "  {:<18} {:>12} {:>9} {:>8} {:>8} {:>9}  completion",
        "phase", "capacity_mah", "energy_wh", "v_start", "v_end", "time_s"
    );
    for phase in &summary.phases {
        println!(
            "  {:<18} {:>12.2} {:>9.3} {:>8.3} {:>8.3} {:>9.1}  {}",
            phase.label,
            phase.capacity_mah,
            phase.energy_wh,
            phase.start_voltage_v,
            phase.end_voltage_v,
            phase.duration_s,
            phase.completion
        );
    }
    println!();
    if let Some(ce) = summary.coulombic_efficiency_pct {
        println!("  Coulombic efficiency: {:.1}%", ce);
    }
    if let Some(ee) = summary.energy_efficiency_pct {
        println!("  Energy efficiency:    {:.1}%", ee);
    }
    if let Some(capacity) = summary.estimated_capacity_mah {
        println!("  Estimated capacity:   {:.1} mAh", capacity);
    }
    if let Some(soc) = summary.final_soc_pct {
        println!("  Final SOC:            {:.1}%", soc);
    }
    if !summary.eis_points.is_empty() {
        println!();
        println!("  Impedance checkpoints:");
        for (index, point) in summary.eis_points.iter().enumerate() {
            println!(
                "    [{index}] target {:>5.1}%  actual {:>5.1}%  OCV {:.3} V  retries {}",
                point.target_soc_pct, point.actual_soc_pct, point.ocv_v, point.retry_count
            );
        }
    }
}

fn cmd_runs(data_dir: &Path) -> AppResult<()> {
    let store = RunStore::new(data_dir.to_path_buf())?;
    let runs = store.list_runs()?;
    if runs.is_empty() {
        println!("No runs stored in {}", data_dir.display());
        return Ok(());
    }
    println!("{} run(s) in {}:", runs.len(), data_dir.display());
    for manifest in &runs {
        println!(
            "  {}  {:<11} {}  {}",
            manifest.run_id,
            status_label(manifest.status),
            manifest.started_at,
            manifest.kind
        );
    }
    Ok(())
}

fn cmd_show_run(data_dir: &Path, run_id: &str) -> AppResult<()> {
    let store = RunStore::new(data_dir.to_path_buf())?;
    let manifest = store.load_manifest(run_id)?;
    let summary = store.load_summary(run_id)?;

    println!("Run: {}", manifest.run_id);
    println!("  Kind:      {}", manifest.kind);
    println!("  Started:   {}", manifest.started_at);
    println!("  Engine:    {}", manifest.engine_version);
    print_summary(&summary);

    let labels = store.series_labels(run_id)?;
    if !labels.is_empty() {
        println!();
        println!("  Series: {}", labels.join(", "));
    }
    Ok(())
}

fn cmd_export_series(
    data_dir: &Path,
    run_id: &str,
    label: &str,
    output: Option<&Path>,
) -> AppResult<()> {
    let store = RunStore::new(data_dir.to_path_buf())?;
    let rows = store.load_series(run_id, label)?;
    let csv = export::series_csv(&rows);

    if let Some(output_path) = output {
        std::fs::write(output_path, &csv)?;
        println!(
            "✓ Exported {} samples to {}",
            rows.len(),
            output_path.display()
        );
    } else {
        print!("{}", csv);
    }
    Ok(())
}

fn cmd_export_eis(
    data_dir: &Path,
    run_id: &str,
    checkpoint: Option<usize>,
    output: Option<&Path>,
) -> AppResult<()> {
    let store = RunStore::new(data_dir.to_path_buf())?;
    let measurements = store.load_eis(run_id)?;

    let (csv, what) = match checkpoint {
        Some(index) => {
            let measurement = measurements.get(index).ok_or_else(|| {
                AppError::Validation(format!(
                    "checkpoint {} out of range ({} recorded)",
                    index,
                    measurements.len()
                ))
            })?;
            (
                export::eis_csv(measurement),
                format!("{} sweep points", measurement.points()),
            )
        }
        None => (
            export::eis_overview_csv(&measurements),
            format!("{} checkpoints", measurements.len()),
        ),
    };

    if let Some(output_path) = output {
        std::fs::write(output_path, &csv)?;
        println!("✓ Exported {} to {}", what, output_path.display());
    } else {
        print!("{}", csv);
    }
    Ok(())
}
