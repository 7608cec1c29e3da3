// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator

pub mod allocator;
pub mod calibrator_xml;
pub mod collaborator;
pub mod config;
pub mod demand;
pub mod error;
pub mod optimizer;
pub mod store;
pub mod synthesizer;
pub mod types;

pub use allocator::{allocate, allocate_window};
pub use calibrator_xml::{register_additional_file, register_calibrators, write_calibrators};
pub use collaborator::{CommandRunner, ExternalPipeline, SimulationCycle, SystemRunner};
pub use config::CalibrationConfig;
pub use error::{CalibrationError, Result};
pub use optimizer::{AmountOptimizer, OptimizationOutcome, OptimizationState, RunState};
pub use store::{read_aggregate, SensorStore, SqliteSensorStore};
pub use synthesizer::{simulation_horizon, CalibratorSynthesizer};
pub use types::*;
