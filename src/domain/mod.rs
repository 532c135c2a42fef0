//! Domain models - feed events, sink records, floor calibration
//!
//! - `types` - `RawEvent`, `TransformedRecord`, connection and delivery status
//! - `calibration` - per-floor origin/scale table used by the transform

pub mod calibration;
pub mod types;

pub use calibration::{CalibrationError, CalibrationTable, FloorCalibration};
pub use types::{ConnectionState, DeliveryResult, FeedStatus, RawEvent, TransformedRecord};
