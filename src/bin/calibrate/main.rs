// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Command Line
//
// Usage:
//   calibrate optimize --config calibration.toml
//   calibrate generate --config calibration.toml --amount 137000
//   calibrate synthesize --config calibration.toml --start-date 2019-11-19
//
// Log verbosity follows RUST_LOG (default: info).

mod report;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use report::{OptimizeReport, RunSettings};
use traffic_calibrator::{
    register_calibrators, write_calibrators, AmountOptimizer, CalibrationConfig,
    CalibratorSynthesizer, ExternalPipeline, RunState, SensorStore, SqliteSensorStore,
    SystemRunner,
};

const RESULTS_DIR: &str = "calibration-results";

// ─── CLI ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "calibrate", version, about = "Calibrate generated traffic demand against sensor counts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search the total trip amount whose simulation matches the real counts.
    Optimize {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run one generation pass for a fixed amount.
    Generate {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        amount: u64,
    },
    /// Write the calibrator file from historical sensor data.
    Synthesize {
        #[arg(short, long)]
        config: PathBuf,
        /// YYYY-MM-DD; overrides the configured start date.
        #[arg(long)]
        start_date: Option<String>,
    },
}

// ─── Main ───────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Optimize { config } => optimize(&config),
        Command::Generate { config, amount } => generate(&config, amount).map(|_| true),
        Command::Synthesize { config, start_date } => {
            synthesize(&config, start_date.as_deref()).map(|_| true)
        }
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(path: &Path) -> Result<CalibrationConfig> {
    CalibrationConfig::from_file(path)
        .with_context(|| format!("loading configuration {}", path.display()))
}

fn open_store(config: &CalibrationConfig) -> Result<SqliteSensorStore> {
    let stores = &config.store;
    let store = SqliteSensorStore::open(&stores.path)
        .with_context(|| format!("opening {}", stores.path.display()))?;
    for named in [&stores.real, &stores.simulated] {
        store
            .attach(&named.name, &named.path)
            .with_context(|| format!("attaching store {} ({})", named.name, named.path.display()))?;
    }
    store
        .init_schema(&stores.simulated.name)
        .context("preparing simulated store")?;
    Ok(store)
}

// ─── Subcommands ────────────────────────────────────────────────────────────

/// Returns false when the run ended above the amount ceiling.
fn optimize(config_path: &Path) -> Result<bool> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let sensor_count = match config.store.sensor_count {
        Some(n) => n,
        None => store
            .max_sensor_id(&config.store.real.name)
            .context("querying sensor count from the real store")?,
    };
    let pipeline = ExternalPipeline::new(&config, SystemRunner)?;
    let mut optimizer = AmountOptimizer::new(
        &store,
        pipeline,
        config.store.real.name.clone(),
        config.store.simulated.name.clone(),
        sensor_count,
        config.optimizer.clone(),
    );

    let started = Instant::now();
    let outcome = optimizer.run().context("optimizer run failed")?;
    let state = outcome.state;
    info!(
        state = state.label(),
        amount = outcome.final_amount,
        iterations = outcome.iterations,
        "optimization finished"
    );

    let settings = RunSettings {
        config_file: config_path.to_path_buf(),
        real_store: config.store.real.name.clone(),
        simulated_store: config.store.simulated.name.clone(),
        sensor_count,
        initial_amount: config.optimizer.initial_amount,
        tolerance_difference: config.optimizer.tolerance_difference,
        tolerance_step: config.optimizer.tolerance_step,
        amount_ceiling: config.optimizer.amount_ceiling,
    };
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string();
    let report = OptimizeReport::new(timestamp, settings, outcome, started.elapsed().as_millis());
    let path = report.save(Path::new(RESULTS_DIR))?;
    println!("{}: amount {} after {} iteration(s)", state.label(), report.final_amount, report.iterations);
    println!("report saved to {}", path.display());

    if state == RunState::AbortedLimit {
        warn!("{}", state.description());
        return Ok(false);
    }
    Ok(true)
}

fn generate(config_path: &Path, amount: u64) -> Result<()> {
    let config = load_config(config_path)?;
    let mut pipeline = ExternalPipeline::new(&config, SystemRunner)?;
    let files = pipeline
        .generate(amount)
        .with_context(|| format!("generating demand for {} trips", amount))?;
    for file in files {
        println!("{}", file.display());
    }
    Ok(())
}

fn synthesize(config_path: &Path, start_date: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let calibrator = &config.calibrator;
    let synthesizer = CalibratorSynthesizer::new(&store, config.store.real.name.clone(), calibrator)?;

    let start_date = start_date.or(calibrator.start_date.as_deref());
    let document = synthesizer
        .synthesize_from_trips(&calibrator.trips_files, start_date)
        .context("synthesizing calibrator flows")?;
    write_calibrators(&document, &calibrator.output)
        .with_context(|| format!("writing {}", calibrator.output.display()))?;

    if let Some(sumocfg) = &calibrator.sumo_config {
        register_calibrators(sumocfg, &calibrator.output)
            .with_context(|| format!("registering calibrators in {}", sumocfg.display()))?;
    }
    println!(
        "{} flow(s) on {} edge(s) written to {}",
        document.flows.len(),
        document.edges.len(),
        calibrator.output.display()
    );
    Ok(())
}
