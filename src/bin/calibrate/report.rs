// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Run Report
//
// Structured output of an optimizer run, written as pretty JSON.

use serde::Serialize;
use std::path::{Path, PathBuf};

use anyhow::Context;
use traffic_calibrator::optimizer::{IterationRecord, OptimizationOutcome};
use traffic_calibrator::RunState;

#[derive(Debug, Clone, Serialize)]
pub struct RunSettings {
    pub config_file: PathBuf,
    pub real_store: String,
    pub simulated_store: String,
    pub sensor_count: u32,
    pub initial_amount: u64,
    pub tolerance_difference: i64,
    pub tolerance_step: i64,
    pub amount_ceiling: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizeReport {
    pub version: String,
    pub timestamp: String,
    pub settings: RunSettings,
    pub state: RunState,
    pub state_label: String,
    pub description: String,
    pub final_amount: u64,
    pub iterations: u32,
    pub real_total: u64,
    pub last_difference: Option<i64>,
    pub elapsed_ms: u128,
    pub history: Vec<IterationRecord>,
}

impl OptimizeReport {
    pub fn new(
        timestamp: String,
        settings: RunSettings,
        outcome: OptimizationOutcome,
        elapsed_ms: u128,
    ) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp,
            settings,
            state: outcome.state,
            state_label: outcome.state.label().to_string(),
            description: outcome.state.description().to_string(),
            final_amount: outcome.final_amount,
            iterations: outcome.iterations,
            real_total: outcome.real_total,
            last_difference: outcome.last_difference,
            elapsed_ms,
            history: outcome.history,
        }
    }

    /// Write to `<dir>/optimize-<timestamp>.json`, returning the path.
    pub fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("optimize-{}.json", self.timestamp));
        let json = serde_json::to_string_pretty(self).context("serializing run report")?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}
