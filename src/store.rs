// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Sensor Store
//
// Real and simulated sensor data share one schema: an `entity` table with a
// row per observed passage. Each store is a SQLite database attached to a
// single shared connection under its own schema name.

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

use crate::error::{CalibrationError, Result};
use crate::types::SensorAggregate;

/// Text layout of the `time` column. Lexicographic order equals time order.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Row count and mean speed of one sensor inside a time window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub count: u64,
    pub mean_speed: f64,
}

/// Queries the calibration loop runs against a sensor store.
pub trait SensorStore {
    /// Rows recorded by `sensor_id` over the whole store.
    fn count_for_sensor(&self, store: &str, sensor_id: u32) -> Result<u64>;

    /// Delete every row. Returns the number of rows removed.
    fn clear(&self, store: &str) -> Result<usize>;

    /// Count and mean speed of `sensor_id` in `[begin, end)`, or `None` when
    /// the window holds no rows.
    fn window_stats(
        &self,
        store: &str,
        sensor_id: u32,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Option<WindowStats>>;

    fn earliest_timestamp(&self, store: &str) -> Result<Option<NaiveDateTime>>;

    /// Highest sensor id present, 0 for an empty store.
    fn max_sensor_id(&self, store: &str) -> Result<u32>;
}

/// Per-sensor counts for sensors `1..=sensor_count`.
///
/// Sensors are queried one at a time; the first failing query discards the
/// whole aggregate.
pub fn read_aggregate<S: SensorStore + ?Sized>(
    store: &S,
    name: &str,
    sensor_count: u32,
) -> Result<SensorAggregate> {
    let counts = (1..=sensor_count)
        .map(|sensor_id| store.count_for_sensor(name, sensor_id))
        .collect::<Result<Vec<u64>>>()?;
    debug!(store = name, total = counts.iter().sum::<u64>(), "aggregate read");
    Ok(SensorAggregate::new(counts))
}

/// Store names are spliced into SQL as schema names, so only plain
/// identifiers are accepted.
pub fn validate_store_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CalibrationError::config(format!("invalid store name {:?}", name)))
    }
}

fn parse_time(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
        .map_err(|e| CalibrationError::config(format!("unparseable timestamp {:?}: {}", raw, e)))
}

// ─── SQLite Store ───────────────────────────────────────────────────────────

pub struct SqliteSensorStore {
    conn: Connection,
}

impl SqliteSensorStore {
    /// Open the primary database. Named stores are attached afterwards.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    /// Attach the database at `path` under `name`.
    pub fn attach<P: AsRef<Path>>(&self, name: &str, path: P) -> Result<()> {
        validate_store_name(name)?;
        let path = path.as_ref().to_string_lossy().into_owned();
        self.conn
            .execute(&format!("ATTACH DATABASE ?1 AS \"{}\"", name), params![path])?;
        debug!(store = name, %path, "store attached");
        Ok(())
    }

    /// Create the `entity` table in `store` if it is missing.
    pub fn init_schema(&self, store: &str) -> Result<()> {
        validate_store_name(store)?;
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{s}\".entity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor_id INTEGER NOT NULL,
                time TEXT NOT NULL,
                speed REAL
            );
            CREATE INDEX IF NOT EXISTS \"{s}\".entity_sensor_time ON entity(sensor_id, time);",
            s = store
        ))?;
        Ok(())
    }

    pub fn insert_entity(
        &self,
        store: &str,
        sensor_id: u32,
        time: NaiveDateTime,
        speed: f64,
    ) -> Result<()> {
        validate_store_name(store)?;
        self.conn.execute(
            &format!(
                "INSERT INTO \"{}\".entity (sensor_id, time, speed) VALUES (?1, ?2, ?3)",
                store
            ),
            params![sensor_id, time.format(TIME_FORMAT).to_string(), speed],
        )?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl SensorStore for SqliteSensorStore {
    fn count_for_sensor(&self, store: &str, sensor_id: u32) -> Result<u64> {
        validate_store_name(store)?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\".entity WHERE sensor_id = ?1", store),
            params![sensor_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn clear(&self, store: &str) -> Result<usize> {
        validate_store_name(store)?;
        let removed = self
            .conn
            .execute(&format!("DELETE FROM \"{}\".entity", store), params![])?;
        Ok(removed)
    }

    fn window_stats(
        &self,
        store: &str,
        sensor_id: u32,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Option<WindowStats>> {
        validate_store_name(store)?;
        let (count, mean): (i64, Option<f64>) = self.conn.query_row(
            &format!(
                "SELECT COUNT(*), AVG(speed) FROM \"{}\".entity
                 WHERE sensor_id = ?1 AND time >= ?2 AND time < ?3",
                store
            ),
            params![
                sensor_id,
                begin.format(TIME_FORMAT).to_string(),
                end.format(TIME_FORMAT).to_string()
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if count <= 0 {
            return Ok(None);
        }
        Ok(Some(WindowStats {
            count: count as u64,
            mean_speed: mean.unwrap_or(0.0),
        }))
    }

    fn earliest_timestamp(&self, store: &str) -> Result<Option<NaiveDateTime>> {
        validate_store_name(store)?;
        let raw: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT MIN(time) FROM \"{}\".entity", store),
                params![],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        raw.as_deref().map(parse_time).transpose()
    }

    fn max_sensor_id(&self, store: &str) -> Result<u32> {
        validate_store_name(store)?;
        let max: Option<i64> = self.conn.query_row(
            &format!("SELECT MAX(sensor_id) FROM \"{}\".entity", store),
            params![],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0).max(0) as u32)
    }
}
