//! Per-floor calibration table
//!
//! Maps a location hierarchy key (e.g. `USA>Texas>Austin>Building1>Floor2`)
//! to the geographic origin of the floor plan and a linear scale factor in
//! degrees per coordinate unit. Reads happen for every event; writes are
//! rare administrative additions, so a read-write lock is enough.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// Scale factor used when an entry is added without one
pub const DEFAULT_SCALE_FACTOR: f64 = 0.00001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloorCalibration {
    pub origin_lat: f64,
    pub origin_lng: f64,
    pub scale_factor: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("location hierarchy must not be empty")]
    EmptyKey,
    #[error("{field} must be a finite number, got {value}")]
    NonFinite { field: &'static str, value: f64 },
}

fn require_finite(field: &'static str, value: f64) -> Result<f64, CalibrationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalibrationError::NonFinite { field, value })
    }
}

#[derive(Debug, Default)]
pub struct CalibrationTable {
    floors: RwLock<FxHashMap<String, FloorCalibration>>,
}

impl CalibrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the calibration for a floor
    pub fn lookup(&self, location_hierarchy: &str) -> Option<FloorCalibration> {
        self.floors.read().get(location_hierarchy).copied()
    }

    /// Insert or overwrite the entry for `location_hierarchy`.
    ///
    /// Entries are never removed; an existing entry is replaced in place.
    pub fn add(
        &self,
        location_hierarchy: &str,
        origin_lat: f64,
        origin_lng: f64,
        scale_factor: Option<f64>,
    ) -> Result<FloorCalibration, CalibrationError> {
        if location_hierarchy.trim().is_empty() {
            return Err(CalibrationError::EmptyKey);
        }

        let calibration = FloorCalibration {
            origin_lat: require_finite("originLat", origin_lat)?,
            origin_lng: require_finite("originLng", origin_lng)?,
            scale_factor: require_finite(
                "scaleFactor",
                scale_factor.unwrap_or(DEFAULT_SCALE_FACTOR),
            )?,
        };

        let replaced =
            self.floors.write().insert(location_hierarchy.to_string(), calibration).is_some();

        info!(
            location_hierarchy = %location_hierarchy,
            origin_lat = calibration.origin_lat,
            origin_lng = calibration.origin_lng,
            scale_factor = calibration.scale_factor,
            replaced = replaced,
            "floor_calibration_added"
        );

        Ok(calibration)
    }

    pub fn len(&self) -> usize {
        self.floors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.floors.read().is_empty()
    }

    /// Copy of all entries, sorted by key (for the status endpoint)
    pub fn snapshot(&self) -> BTreeMap<String, FloorCalibration> {
        self.floors.read().iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}
