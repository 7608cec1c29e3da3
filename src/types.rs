// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Type Definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CalibrationError, Result};

/// Seconds in one simulated day.
pub const DAY_SECONDS: u32 = 86_400;

const SHARE_EPSILON: f64 = 1e-9;

const DEFAULT_DAY_WEIGHTS: [(u32, u32, f64); 5] = [
    (0, 18_000, 0.063),
    (18_000, 32_400, 0.258),
    (32_400, 61_200, 0.464),
    (61_200, 72_000, 0.138),
    (72_000, DAY_SECONDS, 0.076),
];

// ─── Demand Profile ─────────────────────────────────────────────────────────

/// One band of a demand profile: `[start, end)` in seconds with its share of
/// the generated trips.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemandBand {
    pub start: u32,
    pub end: u32,
    pub share: f64,
}

impl DemandBand {
    pub fn new(start: u32, end: u32, share: f64) -> Self {
        Self { start, end, share }
    }

    pub fn duration(&self) -> u32 {
        self.end - self.start
    }
}

/// Day-long piecewise distribution of trip generation across rush-hour bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandProfile {
    bands: Vec<DemandBand>,
}

impl DemandProfile {
    /// Night, morning rush, day, evening rush, late evening.
    ///
    /// The published weights sum to 0.999; they are scaled so the shares
    /// sum to 1.
    pub fn default_day() -> Self {
        let total: f64 = DEFAULT_DAY_WEIGHTS.iter().map(|&(_, _, w)| w).sum();
        Self {
            bands: DEFAULT_DAY_WEIGHTS
                .iter()
                .map(|&(start, end, w)| DemandBand::new(start, end, w / total))
                .collect(),
        }
    }

    /// Build a profile, checking that the bands are ordered, contiguous,
    /// cover the whole day and carry shares summing to 1.
    pub fn new(bands: Vec<DemandBand>) -> Result<Self> {
        let first = bands
            .first()
            .ok_or_else(|| CalibrationError::config("demand profile has no bands"))?;
        if first.start != 0 {
            return Err(CalibrationError::config("demand profile must start at second 0"));
        }
        let mut cursor = 0;
        for band in &bands {
            if band.start != cursor || band.end <= band.start {
                return Err(CalibrationError::config(format!(
                    "demand band [{}, {}) is not contiguous with the previous band",
                    band.start, band.end
                )));
            }
            if !(0.0..=1.0).contains(&band.share) {
                return Err(CalibrationError::config(format!(
                    "demand band share {} outside [0, 1]",
                    band.share
                )));
            }
            cursor = band.end;
        }
        if cursor != DAY_SECONDS {
            return Err(CalibrationError::config(format!(
                "demand profile ends at {} instead of {}",
                cursor, DAY_SECONDS
            )));
        }
        let total: f64 = bands.iter().map(|b| b.share).sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(CalibrationError::config(format!(
                "demand profile shares sum to {} instead of 1",
                total
            )));
        }
        Ok(Self { bands })
    }

    pub fn bands(&self) -> &[DemandBand] {
        &self.bands
    }
}

impl Default for DemandProfile {
    fn default() -> Self {
        Self::default_day()
    }
}

// ─── Sub-Window ─────────────────────────────────────────────────────────────

/// Part of the day trips are generated for, `[begin, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubWindow {
    begin: u32,
    end: u32,
}

impl SubWindow {
    /// Windows starting in the last second of the day, ending in the first,
    /// or inverted leave nothing to allocate.
    pub fn new(begin: u32, end: u32) -> Result<Self> {
        if begin >= DAY_SECONDS - 1 || end <= 1 || begin >= end || end > DAY_SECONDS {
            return Err(CalibrationError::config(format!(
                "invalid generation window [{}, {})",
                begin, end
            )));
        }
        Ok(Self { begin, end })
    }

    pub fn full_day() -> Self {
        Self { begin: 0, end: DAY_SECONDS }
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn end(&self) -> u32 {
        self.end
    }
}

// ─── Allocated Intervals ────────────────────────────────────────────────────

/// A demand profile clipped to a sub-window with shares renormalized over the
/// overlap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocatedIntervals {
    pub(crate) intervals: Vec<DemandBand>,
}

impl AllocatedIntervals {
    pub fn intervals(&self) -> &[DemandBand] {
        &self.intervals
    }

    pub fn total_share(&self) -> f64 {
        self.intervals.iter().map(|i| i.share).sum()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

// ─── Vehicle Classes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Truck,
    Bus,
    Motorcycle,
    Bicycle,
    Pedestrian,
}

impl VehicleClass {
    /// Class name understood by the trip generator and the simulator.
    pub fn sumo_class(&self) -> &'static str {
        match self {
            Self::Car => "passenger",
            Self::Truck => "truck",
            Self::Bus => "bus",
            Self::Motorcycle => "motorcycle",
            Self::Bicycle => "bicycle",
            Self::Pedestrian => "pedestrian",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Car => "car",
            Self::Truck => "truck",
            Self::Bus => "bus",
            Self::Motorcycle => "motorcycle",
            Self::Bicycle => "bicycle",
            Self::Pedestrian => "pedestrian",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Share of generated trips per vehicle class. Cars take whatever the
/// explicitly configured classes leave over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleClassMix {
    shares: BTreeMap<VehicleClass, f64>,
}

impl VehicleClassMix {
    pub fn cars_only() -> Self {
        let mut shares = BTreeMap::new();
        shares.insert(VehicleClass::Car, 1.0);
        Self { shares }
    }

    pub fn from_explicit(explicit: &BTreeMap<VehicleClass, f64>) -> Result<Self> {
        let mut shares = BTreeMap::new();
        let mut assigned = 0.0;
        for (&class, &share) in explicit {
            if class == VehicleClass::Car {
                continue;
            }
            if !(0.0..=1.0).contains(&share) {
                return Err(CalibrationError::config(format!(
                    "share {} for {} outside [0, 1]",
                    share, class
                )));
            }
            if share > 0.0 {
                shares.insert(class, share);
                assigned += share;
            }
        }
        let remainder = 1.0 - assigned;
        if remainder < -SHARE_EPSILON {
            return Err(CalibrationError::config(format!(
                "explicit vehicle class shares sum to {} (> 1)",
                assigned
            )));
        }
        shares.insert(VehicleClass::Car, remainder.max(0.0));
        Ok(Self { shares })
    }

    pub fn share(&self, class: VehicleClass) -> f64 {
        self.shares.get(&class).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (VehicleClass, f64)> + '_ {
        self.shares.iter().map(|(&c, &s)| (c, s))
    }
}

impl Default for VehicleClassMix {
    fn default() -> Self {
        Self::cars_only()
    }
}

// ─── Sensor Aggregate ───────────────────────────────────────────────────────

/// Vehicle counts per sensor; slot `i` belongs to sensor id `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorAggregate {
    counts: Vec<u64>,
}

impl SensorAggregate {
    pub fn new(counts: Vec<u64>) -> Self {
        Self { counts }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Signed `Σ(self[i] - real[i])`. Positive means this aggregate overshoots
    /// `real`. Sensors missing on either side count as zero.
    pub fn signed_difference(&self, real: &SensorAggregate) -> i64 {
        let n = self.counts.len().max(real.counts.len());
        (0..n)
            .map(|i| {
                let sim = self.counts.get(i).copied().unwrap_or(0) as i64;
                let obs = real.counts.get(i).copied().unwrap_or(0) as i64;
                sim - obs
            })
            .sum()
    }
}

// ─── Calibrator Output ──────────────────────────────────────────────────────

/// An edge whose traffic is forced toward measured counts by a calibrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredEdge {
    pub edge_id: String,
    pub position: f64,
    pub sensor_id: u32,
}

/// First edge id that appears more than once. Calibrators and route probes
/// are named after the edge, so ids must be unique.
pub fn duplicate_edge_id(edges: &[MonitoredEdge]) -> Option<&str> {
    let mut seen = std::collections::HashSet::new();
    edges
        .iter()
        .map(|e| e.edge_id.as_str())
        .find(|id| !seen.insert(*id))
}

/// One hour of measured traffic for a calibrated edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibratorFlow {
    pub edge_id: String,
    pub position: f64,
    pub sensor_id: u32,
    pub interval_begin: u32,
    pub interval_end: u32,
    pub vehicles_per_hour: u64,
    pub mean_speed: f64,
}

/// Dynamics of the vehicles calibrators insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleTypeParams {
    pub id: String,
    pub accel: f64,
    pub decel: f64,
    pub sigma: f64,
    pub length: f64,
    pub max_speed: f64,
}

impl Default for VehicleTypeParams {
    fn default() -> Self {
        Self {
            id: "calibrator_vehicle".to_string(),
            accel: 2.6,
            decel: 4.5,
            sigma: 0.5,
            length: 5.0,
            max_speed: 70.0,
        }
    }
}

/// Everything written to the calibrator additional file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibratorDocument {
    pub vehicle_type: VehicleTypeParams,
    pub edges: Vec<MonitoredEdge>,
    pub flows: Vec<CalibratorFlow>,
    /// Measurement frequency of the route probes, seconds.
    pub probe_frequency: u32,
    pub probe_output: String,
    pub calibrator_output: String,
}

impl CalibratorDocument {
    /// Flows belonging to one edge, in emission order.
    pub fn flows_for<'a>(&'a self, edge_id: &'a str) -> impl Iterator<Item = &'a CalibratorFlow> + 'a {
        self.flows.iter().filter(move |f| f.edge_id == edge_id)
    }
}
