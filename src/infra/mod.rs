//! Infrastructure - configuration, metrics and shutdown signals
//!
//! - `config` - Application configuration (TOML loading, env overrides, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `shutdown` - SIGINT/SIGTERM handling

pub mod config;
pub mod metrics;
pub mod shutdown;

// Re-export commonly used types
pub use config::{Config, LogFormat};
pub use metrics::Metrics;
pub use shutdown::shutdown_signal;
