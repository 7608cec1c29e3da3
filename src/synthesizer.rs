// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Calibrator Flow Synthesizer
//
// Walks the simulated horizon hour by hour for every monitored edge and
// turns the historical sensor rows of that hour into a calibrator flow.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::collaborator::attr_value;
use crate::config::CalibratorConfig;
use crate::error::{CalibrationError, Result};
use crate::store::SensorStore;
use crate::types::{
    duplicate_edge_id, CalibratorDocument, CalibratorFlow, MonitoredEdge, VehicleTypeParams,
};

const HOUR_SECONDS: u32 = 3_600;

// ─── Horizon ────────────────────────────────────────────────────────────────

/// Latest `depart` over all trips in `trip_files`, rounded to whole seconds.
pub fn simulation_horizon(trip_files: &[PathBuf]) -> Result<u32> {
    let mut latest: Option<f64> = None;
    for path in trip_files {
        if let Some(depart) = latest_departure(path)? {
            latest = Some(latest.map_or(depart, |l: f64| l.max(depart)));
        }
    }
    let latest = latest.ok_or_else(|| {
        CalibrationError::config("generated trip files contain no departures")
    })?;
    Ok(latest.round().max(0.0) as u32)
}

fn latest_departure(path: &Path) -> Result<Option<f64>> {
    let file = File::open(path).map_err(|e| CalibrationError::io(path, e))?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut latest: Option<f64> = None;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"trip" => {
                if let Some(raw) = attr_value(&e, b"depart")? {
                    let depart: f64 = raw.trim().parse().map_err(|_| {
                        CalibrationError::config(format!(
                            "trip in {} has non-numeric depart {:?}",
                            path.display(),
                            raw
                        ))
                    })?;
                    latest = Some(latest.map_or(depart, |l| l.max(depart)));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(latest)
}

/// Whole simulated hours in `horizon` seconds, rounded to nearest.
pub fn simulation_hours(horizon: u32) -> u32 {
    (f64::from(horizon) / f64::from(HOUR_SECONDS)).round() as u32
}

// ─── Start Date ─────────────────────────────────────────────────────────────

/// Parse a `YYYY-MM-DD` date. Anything else is a configuration error.
pub fn parse_start_date(raw: &str) -> Result<NaiveDate> {
    let bytes = raw.as_bytes();
    let shaped = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !shaped {
        return Err(CalibrationError::config(format!(
            "start date {:?} is not in YYYY-MM-DD format",
            raw
        )));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| CalibrationError::config(format!("start date {:?}: {}", raw, e)))
}

fn midnight(date: NaiveDate) -> Result<NaiveDateTime> {
    date.and_hms_opt(0, 0, 0)
        .ok_or_else(|| CalibrationError::config(format!("no midnight on {}", date)))
}

// ─── Synthesizer ────────────────────────────────────────────────────────────

pub struct CalibratorSynthesizer<'a, S: SensorStore + ?Sized> {
    store: &'a S,
    store_name: String,
    edges: Vec<MonitoredEdge>,
    vehicle_type: VehicleTypeParams,
    probe_frequency: u32,
    probe_output: String,
    calibrator_output: String,
}

impl<'a, S: SensorStore + ?Sized> CalibratorSynthesizer<'a, S> {
    pub fn new(store: &'a S, store_name: impl Into<String>, config: &CalibratorConfig) -> Result<Self> {
        if config.edges.is_empty() {
            return Err(CalibrationError::config("no monitored edges configured"));
        }
        if let Some(edge) = config.edges.iter().find(|e| e.edge_id.trim().is_empty()) {
            return Err(CalibrationError::config(format!(
                "monitored edge for sensor {} has an empty id",
                edge.sensor_id
            )));
        }
        if let Some(id) = duplicate_edge_id(&config.edges) {
            return Err(CalibrationError::config(format!(
                "edge {} is monitored more than once",
                id
            )));
        }
        Ok(Self {
            store,
            store_name: store_name.into(),
            edges: config.edges.clone(),
            vehicle_type: config.vehicle_type.clone(),
            probe_frequency: config.probe_frequency,
            probe_output: config.probe_output.clone(),
            calibrator_output: config.calibrator_output.clone(),
        })
    }

    /// Midnight of the override date, or of the earliest stored day.
    pub fn start_instant(&self, start_override: Option<&str>) -> Result<NaiveDateTime> {
        let date = match start_override {
            Some(raw) => parse_start_date(raw)?,
            None => self
                .store
                .earliest_timestamp(&self.store_name)?
                .ok_or_else(|| {
                    CalibrationError::config(format!(
                        "store {} holds no rows to derive a start date from",
                        self.store_name
                    ))
                })?
                .date(),
        };
        midnight(date)
    }

    /// Build the calibrator document for `horizon` simulated seconds
    /// starting at wall-clock `start`. Hours without rows get no flow.
    pub fn synthesize(&self, horizon: u32, start: NaiveDateTime) -> Result<CalibratorDocument> {
        let hours = simulation_hours(horizon);
        info!(horizon, hours, start = %start, edges = self.edges.len(), "synthesizing calibrator flows");

        let mut flows = Vec::new();
        for edge in &self.edges {
            let mut emitted = 0usize;
            for hour in 0..hours {
                let begin = start + Duration::seconds(i64::from(hour * HOUR_SECONDS));
                let end = begin + Duration::seconds(i64::from(HOUR_SECONDS));
                let Some(stats) =
                    self.store.window_stats(&self.store_name, edge.sensor_id, begin, end)?
                else {
                    warn!(edge = %edge.edge_id, hour, "no historical rows, hour skipped");
                    continue;
                };
                flows.push(CalibratorFlow {
                    edge_id: edge.edge_id.clone(),
                    position: edge.position,
                    sensor_id: edge.sensor_id,
                    interval_begin: hour * HOUR_SECONDS,
                    interval_end: (hour + 1) * HOUR_SECONDS,
                    vehicles_per_hour: stats.count,
                    mean_speed: stats.mean_speed,
                });
                emitted += 1;
            }
            debug!(edge = %edge.edge_id, emitted, skipped = hours as usize - emitted, "edge done");
        }

        Ok(CalibratorDocument {
            vehicle_type: self.vehicle_type.clone(),
            edges: self.edges.clone(),
            flows,
            probe_frequency: self.probe_frequency,
            probe_output: self.probe_output.clone(),
            calibrator_output: self.calibrator_output.clone(),
        })
    }

    /// Horizon from the trip files, start from the override or the store.
    pub fn synthesize_from_trips(
        &self,
        trip_files: &[PathBuf],
        start_override: Option<&str>,
    ) -> Result<CalibratorDocument> {
        let horizon = simulation_horizon(trip_files)?;
        let start = self.start_instant(start_override)?;
        self.synthesize(horizon, start)
    }
}
