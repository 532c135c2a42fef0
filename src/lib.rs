//! Geofeed bridge library
//!
//! Streams BLE positioning events from a WebSocket feed, converts floor
//! coordinates to latitude/longitude, and forwards the records to an
//! ingestion API. Modules are exposed for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
