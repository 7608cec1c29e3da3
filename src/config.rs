// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Configuration
//
// One TOML file describes a calibration setup. Each component receives the
// section it needs at construction; nothing is read from globals.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CalibrationError, Result};
use crate::store::validate_store_name;
use crate::types::{
    DemandBand, DemandProfile, MonitoredEdge, SubWindow, VehicleClass, VehicleClassMix,
    VehicleTypeParams, DAY_SECONDS,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub store: StoreConfig,
    pub demand: DemandConfig,
    pub generator: CommandConfig,
    pub simulator: SimulatorConfig,
    pub loader: CommandConfig,
    pub optimizer: OptimizerConfig,
    pub calibrator: CalibratorConfig,
}

// ─── Sections ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Primary database the named stores are attached to.
    pub path: PathBuf,
    pub real: NamedStore,
    pub simulated: NamedStore,
    /// Number of sensors to compare. Queried from the real store when unset.
    pub sensor_count: Option<u32>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            real: NamedStore {
                name: "real".to_string(),
                path: PathBuf::from("real.db"),
            },
            simulated: NamedStore {
                name: "simulated".to_string(),
                path: PathBuf::from("simulated.db"),
            },
            sensor_count: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedStore {
    pub name: String,
    pub path: PathBuf,
}

/// Explicit vehicle class shares; cars take the remainder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassShares {
    pub truck: f64,
    pub bus: f64,
    pub motorcycle: f64,
    pub bicycle: f64,
    pub pedestrian: f64,
}

impl ClassShares {
    pub fn mix(&self) -> Result<VehicleClassMix> {
        let mut explicit = BTreeMap::new();
        explicit.insert(VehicleClass::Truck, self.truck);
        explicit.insert(VehicleClass::Bus, self.bus);
        explicit.insert(VehicleClass::Motorcycle, self.motorcycle);
        explicit.insert(VehicleClass::Bicycle, self.bicycle);
        explicit.insert(VehicleClass::Pedestrian, self.pedestrian);
        VehicleClassMix::from_explicit(&explicit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandConfig {
    pub net_file: PathBuf,
    /// Directory the merged per-class trip files are written to.
    pub output_dir: PathBuf,
    pub begin: u32,
    pub end: u32,
    pub fringe_factor: f64,
    pub base_seed: u64,
    pub classes: ClassShares,
    /// Replaces the built-in day profile when set.
    pub profile: Option<Vec<DemandBand>>,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            net_file: PathBuf::from("osm.net.xml"),
            output_dir: PathBuf::from("."),
            begin: 0,
            end: DAY_SECONDS,
            fringe_factor: 5.0,
            base_seed: 1,
            classes: ClassShares::default(),
            profile: None,
        }
    }
}

impl DemandConfig {
    pub fn window(&self) -> Result<SubWindow> {
        SubWindow::new(self.begin, self.end)
    }

    pub fn demand_profile(&self) -> Result<DemandProfile> {
        match &self.profile {
            Some(bands) => DemandProfile::new(bands.clone()),
            None => Ok(DemandProfile::default_day()),
        }
    }
}

/// An external program and the arguments placed before the ones the
/// calibrator adds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Scenario configuration passed with `-c`.
    pub config: PathBuf,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            program: "sumo".to_string(),
            args: Vec::new(),
            config: PathBuf::from("osm.sumocfg"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub initial_amount: u64,
    /// First step size; half the initial amount when unset.
    pub initial_step: Option<i64>,
    pub tolerance_difference: i64,
    pub tolerance_step: i64,
    pub amount_ceiling: u64,
    /// Regenerate for the initial amount before the first comparison.
    pub prime_simulation: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            initial_amount: 100_000,
            initial_step: None,
            tolerance_difference: 2_000,
            tolerance_step: 100,
            amount_ceiling: 200_000,
            prime_simulation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibratorConfig {
    /// Generated trip files; the latest departure fixes the horizon.
    pub trips_files: Vec<PathBuf>,
    pub output: PathBuf,
    /// Simulator master configuration to register the output file in.
    pub sumo_config: Option<PathBuf>,
    /// `YYYY-MM-DD`; the earliest store timestamp is used when unset.
    pub start_date: Option<String>,
    pub probe_frequency: u32,
    pub probe_output: String,
    pub calibrator_output: String,
    pub edges: Vec<MonitoredEdge>,
    pub vehicle_type: VehicleTypeParams,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            trips_files: vec![PathBuf::from("osm.passenger.trips.xml")],
            output: PathBuf::from("calibrator.xml"),
            sumo_config: None,
            start_date: None,
            probe_frequency: 3_600,
            probe_output: "routeprobe_output.xml".to_string(),
            calibrator_output: "calibrator_output.xml".to_string(),
            edges: Vec::new(),
            vehicle_type: VehicleTypeParams::default(),
        }
    }
}

// ─── Loading ────────────────────────────────────────────────────────────────

impl CalibrationConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| CalibrationError::io(path, e))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: CalibrationConfig = toml::from_str(content)
            .map_err(|e| CalibrationError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject setups no run could succeed with. Edge lists are only
    /// required by the synthesizer and are checked there.
    pub fn validate(&self) -> Result<()> {
        validate_store_name(&self.store.real.name)?;
        validate_store_name(&self.store.simulated.name)?;
        if self.store.real.name == self.store.simulated.name {
            return Err(CalibrationError::config("real and simulated stores share a name"));
        }
        if self.store.sensor_count == Some(0) {
            return Err(CalibrationError::config("sensor_count must be positive"));
        }
        self.demand.window()?;
        self.demand.demand_profile()?;
        self.demand.classes.mix()?;
        if !(self.demand.fringe_factor > 0.0) {
            return Err(CalibrationError::config(format!(
                "fringe factor {} must be positive",
                self.demand.fringe_factor
            )));
        }
        if self.optimizer.tolerance_difference <= 0 || self.optimizer.tolerance_step <= 0 {
            return Err(CalibrationError::config("optimizer tolerances must be positive"));
        }
        if i64::try_from(self.optimizer.initial_amount).is_err()
            || i64::try_from(self.optimizer.amount_ceiling).is_err()
        {
            return Err(CalibrationError::config(format!(
                "optimizer amounts must not exceed {}",
                i64::MAX
            )));
        }
        if self.optimizer.initial_step.is_some_and(|step| step == 0 || step == i64::MIN) {
            return Err(CalibrationError::config(format!(
                "initial_step must be non-zero and within ±{}",
                i64::MAX
            )));
        }
        if let Some(date) = &self.calibrator.start_date {
            crate::synthesizer::parse_start_date(date)?;
        }
        if self.calibrator.probe_frequency == 0 {
            return Err(CalibrationError::config("probe_frequency must be positive"));
        }
        for (section, program) in [
            ("generator", &self.generator.program),
            ("simulator", &self.simulator.program),
            ("loader", &self.loader.program),
        ] {
            if program.trim().is_empty() {
                return Err(CalibrationError::config(format!("[{}] program is not set", section)));
            }
        }
        Ok(())
    }
}
