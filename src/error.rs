// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Error Taxonomy

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the calibration loop and its collaborators.
///
/// An empty historical window is deliberately absent: the synthesizer
/// recovers from it locally by skipping the hour. Reaching the amount
/// ceiling is a terminal state of the optimizer, not an error either.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("sensor store error: {0}")]
    Connectivity(#[from] rusqlite::Error),
    #[error("{program} exited with {status}")]
    ProcessFailure { program: String, status: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl CalibrationError {
    pub fn config(msg: impl Into<String>) -> Self {
        CalibrationError::Configuration(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CalibrationError::Io { path: path.into(), source }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, CalibrationError::Configuration(_))
    }
}

impl From<quick_xml::events::attributes::AttrError> for CalibrationError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        CalibrationError::Xml(quick_xml::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, CalibrationError>;
