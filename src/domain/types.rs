//! Shared types for the bridge: feed events, sink records, connection state

use serde::{Deserialize, Serialize};

/// Only feed events carrying this tag are processed
pub const BLE_DEVICES: &str = "BLE_DEVICES";

/// Value of `source` on every record sent to the sink
pub const RECORD_SOURCE: &str = "Cisco Spaces Middleware";

/// Unit assumed when the feed omits `locationCoordinate.unit`
pub const DEFAULT_UNIT: &str = "FEET";

/// Floor-local position as reported by the feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationCoordinate {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Device sighting as received from the feed.
///
/// Every field is optional on the wire; the transform engine decides which
/// ones are required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub rssi: Option<i64>,
    #[serde(default)]
    pub location_hierarchy: Option<String>,
    #[serde(default)]
    pub location_coordinate: Option<LocationCoordinate>,
}

impl RawEvent {
    /// Device id for log fields, empty when absent
    pub fn device_label(&self) -> &str {
        self.device_id.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_hierarchy: Option<String>,
    pub unit: String,
}

/// Geo-tagged record sent to the sink.
///
/// `latitude`/`longitude` are `None` when the floor is not calibrated or the
/// computation produced a non-finite value; such records never pass
/// validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub identifier: String,
    /// Unix seconds
    pub timestamp: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub source: String,
    pub properties: RecordProperties,
}

/// Lifecycle state of the feed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the feed connection for the status surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    pub is_connected: bool,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    /// Reconnect ceiling reached; the feed stays down until restart
    pub gave_up: bool,
}

/// Outcome of delivering one record to the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Static view of the delivery client for the status surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkStatus {
    pub base_url: String,
    pub has_api_key: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_from_feed_json() {
        let json = r#"{
            "eventType": "BLE_DEVICES",
            "deviceId": "aa:bb:cc:dd:ee:ff",
            "lastSeen": "2026-01-05T16:41:30.048Z",
            "rssi": -67,
            "locationHierarchy": "USA>Texas>Austin>Building1>Floor2",
            "locationCoordinate": {"x": 100, "y": 200, "unit": "FEET"}
        }"#;

        let event: RawEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type.as_deref(), Some(BLE_DEVICES));
        assert_eq!(event.device_label(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(event.rssi, Some(-67));
        let coord = event.location_coordinate.unwrap();
        assert_eq!(coord.x, Some(100.0));
        assert_eq!(coord.y, Some(200.0));
    }

    #[test]
    fn test_raw_event_tolerates_missing_fields() {
        let event: RawEvent = serde_json::from_str(r#"{"eventType": "BLE_DEVICES"}"#).unwrap();
        assert!(event.device_id.is_none());
        assert!(event.location_coordinate.is_none());
        assert_eq!(event.device_label(), "");
    }

    #[test]
    fn test_record_wire_shape() {
        let record = TransformedRecord {
            identifier: "dev-1".to_string(),
            timestamp: 1_767_630_090,
            latitude: Some(30.2692),
            longitude: None,
            source: RECORD_SOURCE.to_string(),
            properties: RecordProperties {
                rssi: None,
                location_hierarchy: Some("A>B".to_string()),
                unit: DEFAULT_UNIT.to_string(),
            },
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["identifier"], "dev-1");
        assert!(value["longitude"].is_null());
        assert_eq!(value["properties"]["locationHierarchy"], "A>B");
        assert!(value["properties"].get("rssi").is_none());
    }
}
