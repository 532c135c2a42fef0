//! Services - event processing
//!
//! - `transform` - Floor coordinate to lat/lng transform and record validation
//! - `pipeline` - Per-event transform, validate and deliver

pub mod pipeline;
pub mod transform;

pub use pipeline::{EventPipeline, ProcessOutcome};
