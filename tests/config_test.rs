//! Integration tests for configuration loading

use geofeed_bridge::infra::config::{ConfigError, DEFAULT_SINK_URL};
use geofeed_bridge::infra::{Config, LogFormat};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[feed]
discovery_url = "https://partners.example.com/api/partners/v1/firehose/events"
access_token = "feed-token"
connect_timeout_ms = 5000

[reconnect]
max_attempts = 4
base_delay_ms = 2000

[sink]
base_url = "http://localhost:3001/ingest"
api_key = "sink-key"
max_retries = 5
retry_delay_ms = 250

[pipeline]
channel_capacity = 64
max_in_flight = 8

[http]
port = 9090

[metrics]
interval_secs = 15

[logging]
format = "json"

[[floors]]
location_hierarchy = "USA>Texas>Austin>Building1>Floor2"
origin_lat = 30.2672
origin_lng = -97.7431

[[floors]]
location_hierarchy = "USA>Texas>Austin>Building1>Floor3"
origin_lat = 30.2680
origin_lng = -97.7440
scale_factor = 0.00002
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.feed_access_token(), Some("feed-token"));
    assert_eq!(config.feed_event_type(), "BLE_DEVICES");
    assert_eq!(config.feed_connect_timeout(), Duration::from_millis(5000));
    assert_eq!(config.reconnect_max_attempts(), 4);
    assert_eq!(config.reconnect_base_delay(), Duration::from_millis(2000));
    assert_eq!(config.sink_base_url(), "http://localhost:3001/ingest");
    assert_eq!(config.sink_max_retries(), 5);
    assert_eq!(config.sink_retry_delay(), Duration::from_millis(250));
    assert_eq!(config.channel_capacity(), 64);
    assert_eq!(config.max_in_flight(), 8);
    assert_eq!(config.http_port(), 9090);
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.log_format(), LogFormat::Json);

    let table = config.calibration_table().unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.lookup("USA>Texas>Austin>Building1>Floor2").unwrap().scale_factor, 0.00001);
    assert_eq!(table.lookup("USA>Texas>Austin>Building1>Floor3").unwrap().scale_factor, 0.00002);

    let credentials = config.require_credentials().unwrap();
    assert_eq!(credentials.sink_api_key, "sink-key");
}

#[test]
fn test_partial_file_keeps_defaults() {
    let temp_file = write_config(
        r#"
[sink]
api_key = "sink-key"
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.sink_base_url(), DEFAULT_SINK_URL);
    assert_eq!(config.sink_max_retries(), 3);
    assert_eq!(config.reconnect_max_attempts(), 10);
    assert_eq!(config.max_in_flight(), 32);
    assert_eq!(config.floors().len(), 1, "default Austin floor is kept");
    assert_eq!(config.require_credentials(), Err(ConfigError::Missing("FEED_ACCESS_TOKEN")));
}

#[test]
fn test_env_overrides_file_values() {
    let temp_file = write_config(
        r#"
[feed]
access_token = "from-file"

[sink]
base_url = "http://file-sink/ingest"
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap().with_overrides(|name| match name {
        "FEED_ACCESS_TOKEN" => Some("from-env".to_string()),
        "SINK_INGESTION_URL" => Some("http://env-sink/ingest".to_string()),
        _ => None,
    });

    assert_eq!(config.feed_access_token(), Some("from-env"));
    assert_eq!(config.sink_base_url(), "http://env-sink/ingest");
}

#[test]
fn test_invalid_floor_rejected() {
    let temp_file = write_config(
        r#"
[[floors]]
location_hierarchy = ""
origin_lat = 1.0
origin_lng = 2.0
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();
    assert!(config.calibration_table().is_err());
}

#[test]
fn test_malformed_file_is_an_error() {
    let temp_file = write_config("[sink\nbase_url = ");
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.sink_base_url(), DEFAULT_SINK_URL);
    assert_eq!(config.http_port(), 8080);
    assert_eq!(config.log_format(), LogFormat::Text);
}
