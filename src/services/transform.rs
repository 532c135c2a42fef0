//! Coordinate transform engine
//!
//! Converts a feed event into a geo-tagged record:
//! `latitude = originLat + y * scaleFactor`, `longitude = originLng + x * scaleFactor`.
//! Missing calibration or coordinates are a soft failure: the record is still
//! built with empty coordinates and is rejected later by [`validate`].

use crate::domain::calibration::CalibrationTable;
use crate::domain::types::{
    RawEvent, RecordProperties, TransformedRecord, BLE_DEVICES, DEFAULT_UNIT, RECORD_SOURCE,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),
}

/// Why a record ended up without coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateGap {
    /// No `locationHierarchy` on the event
    MissingHierarchy,
    /// No `locationCoordinate`, or one of its axes is absent
    MissingCoordinate,
    /// Hierarchy has no calibration entry
    UnmappedFloor,
    /// Calibration applied but the result overflowed
    NonFiniteResult,
}

impl CoordinateGap {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinateGap::MissingHierarchy => "missing_hierarchy",
            CoordinateGap::MissingCoordinate => "missing_coordinate",
            CoordinateGap::UnmappedFloor => "unmapped_floor",
            CoordinateGap::NonFiniteResult => "non_finite_result",
        }
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// Check required fields and the event-type tag
fn check_input(event: &RawEvent) -> Result<(&str, &str), TransformError> {
    let missing: Vec<&str> = [
        ("eventType", &event.event_type),
        ("deviceId", &event.device_id),
        ("lastSeen", &event.last_seen),
    ]
    .into_iter()
    .filter(|(_, value)| present(value).is_none())
    .map(|(name, _)| name)
    .collect();

    if !missing.is_empty() {
        return Err(TransformError::InvalidInput(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    let event_type = event.event_type.as_deref().unwrap_or_default();
    if event_type != BLE_DEVICES {
        return Err(TransformError::InvalidInput(format!("unexpected event type {event_type}")));
    }

    Ok((event.device_id.as_deref().unwrap_or_default(), event.last_seen.as_deref().unwrap_or_default()))
}

/// Parse an ISO-8601 timestamp into Unix seconds (sub-second part floored).
///
/// Accepts RFC 3339 with an offset, a naive date-time (taken as UTC) or a
/// bare date (UTC midnight).
pub fn parse_unix_seconds(iso: &str) -> Result<i64, TransformError> {
    let iso = iso.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(iso) {
        return Ok(dt.timestamp());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(iso, format) {
            return Ok(naive.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(iso, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc().timestamp());
        }
    }

    Err(TransformError::InvalidTimestamp(iso.to_string()))
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Compute (latitude, longitude); each axis independently falls back to `None`
fn geo_coordinates(table: &CalibrationTable, event: &RawEvent) -> (Option<f64>, Option<f64>) {
    let (Some(hierarchy), Some(coord)) =
        (present(&event.location_hierarchy), event.location_coordinate.as_ref())
    else {
        return (None, None);
    };
    let Some(cal) = table.lookup(hierarchy) else {
        return (None, None);
    };

    let latitude = coord.y.and_then(|y| finite(cal.origin_lat + y * cal.scale_factor));
    let longitude = coord.x.and_then(|x| finite(cal.origin_lng + x * cal.scale_factor));
    (latitude, longitude)
}

/// Classify why `event` would produce a record without coordinates.
///
/// Returns `None` when both axes resolve.
pub fn coordinate_gap(table: &CalibrationTable, event: &RawEvent) -> Option<CoordinateGap> {
    let Some(hierarchy) = present(&event.location_hierarchy) else {
        return Some(CoordinateGap::MissingHierarchy);
    };
    let Some(coord) = event.location_coordinate.as_ref() else {
        return Some(CoordinateGap::MissingCoordinate);
    };
    if table.lookup(hierarchy).is_none() {
        return Some(CoordinateGap::UnmappedFloor);
    }
    if coord.x.is_none() || coord.y.is_none() {
        return Some(CoordinateGap::MissingCoordinate);
    }
    match geo_coordinates(table, event) {
        (Some(_), Some(_)) => None,
        _ => Some(CoordinateGap::NonFiniteResult),
    }
}

/// Transform a feed event into a sink record
pub fn transform(
    table: &CalibrationTable,
    event: &RawEvent,
) -> Result<TransformedRecord, TransformError> {
    let (device_id, last_seen) = check_input(event).inspect_err(|e| {
        warn!(device_id = %event.device_label(), error = %e, "transform_invalid_input");
    })?;

    let timestamp = parse_unix_seconds(last_seen).inspect_err(|e| {
        warn!(device_id = %device_id, error = %e, "transform_invalid_timestamp");
    })?;

    let (latitude, longitude) = geo_coordinates(table, event);
    if latitude.is_none() || longitude.is_none() {
        if let Some(gap) = coordinate_gap(table, event) {
            warn!(
                device_id = %device_id,
                location_hierarchy = %event.location_hierarchy.as_deref().unwrap_or(""),
                reason = gap.as_str(),
                "transform_coordinates_unresolved"
            );
        }
    }

    let unit = event
        .location_coordinate
        .as_ref()
        .and_then(|c| c.unit.as_deref())
        .filter(|u| !u.is_empty())
        .unwrap_or(DEFAULT_UNIT);

    let record = TransformedRecord {
        identifier: device_id.to_string(),
        timestamp,
        latitude,
        longitude,
        source: RECORD_SOURCE.to_string(),
        properties: RecordProperties {
            rssi: event.rssi,
            location_hierarchy: event.location_hierarchy.clone(),
            unit: unit.to_string(),
        },
    };

    debug!(
        device_id = %record.identifier,
        timestamp = record.timestamp,
        latitude = ?record.latitude,
        longitude = ?record.longitude,
        "transform_complete"
    );

    Ok(record)
}

/// Gate before delivery: all required fields present and numerically valid
pub fn validate(record: &TransformedRecord) -> bool {
    if record.identifier.is_empty() || record.source.is_empty() {
        warn!(device_id = %record.identifier, "record_missing_required_fields");
        return false;
    }
    if record.timestamp <= 0 {
        warn!(device_id = %record.identifier, timestamp = record.timestamp, "record_invalid_timestamp");
        return false;
    }
    match (record.latitude, record.longitude) {
        (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => true,
        (latitude, longitude) => {
            warn!(
                device_id = %record.identifier,
                latitude = ?latitude,
                longitude = ?longitude,
                "record_invalid_coordinates"
            );
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchErrorKind {
    Transformation,
    Validation,
}

#[derive(Debug)]
pub struct BatchError {
    pub kind: BatchErrorKind,
    pub event: RawEvent,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct BatchTransform {
    pub records: Vec<TransformedRecord>,
    pub errors: Vec<BatchError>,
}

/// Transform and validate a batch, keeping only records that pass validation
pub fn transform_batch(table: &CalibrationTable, events: &[RawEvent]) -> BatchTransform {
    let mut batch = BatchTransform::default();

    for event in events {
        match transform(table, event) {
            Ok(record) if validate(&record) => batch.records.push(record),
            Ok(_) => batch.errors.push(BatchError {
                kind: BatchErrorKind::Validation,
                event: event.clone(),
                message: "transformed record failed validation".to_string(),
            }),
            Err(e) => batch.errors.push(BatchError {
                kind: BatchErrorKind::Transformation,
                event: event.clone(),
                message: e.to_string(),
            }),
        }
    }

    tracing::info!(
        total = events.len(),
        successful = batch.records.len(),
        errors = batch.errors.len(),
        "transform_batch_complete"
    );

    batch
}
