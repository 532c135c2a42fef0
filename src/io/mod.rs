//! IO modules - external system interfaces
//!
//! - `feed` - WebSocket feed connection manager (credential exchange, reconnect)
//! - `delivery` - HTTP delivery client for the ingestion API
//! - `status_server` - Status and Prometheus metrics HTTP endpoint

pub mod delivery;
pub mod feed;
pub mod status_server;

// Re-export commonly used types
pub use delivery::{DeliveryClient, HttpIngestTransport, IngestTransport, RetryPolicy};
pub use feed::{FeedConnector, FeedHandle, FeedManager, FeedTransport, ReconnectPolicy, WsFeedConnector};
pub use status_server::{start_status_server, StatusContext};
