//! Monitoring core for PlusLife continuous sensors
//!
//! Decodes the sensor's binary telemetry frames, tracks a rolling reading
//! history with trend analysis, and runs the threshold alerting state
//! machine. Transport and notification delivery live in `pluslife-link`;
//! this crate is the pure, single-writer pipeline between them:
//!
//! ```text
//! fragments → FrameDecoder → HistoryEngine → AlertMachine → AlertEvent
//! ```
//!
//! Key constraints:
//! - No heap allocation in the reading path
//! - Deterministic: all timing decisions are made from explicit timestamps
//! - One pipeline per sensor, never shared mutably
//!
//! ```no_run
//! use pluslife_core::{
//!     alert::ThresholdConfig,
//!     pipeline::{PipelineConfig, SensorPipeline},
//!     frame::RawFrame,
//!     reading::SensorId,
//! };
//!
//! let config = PipelineConfig::new(ThresholdConfig::default());
//! let mut pipeline: SensorPipeline = SensorPipeline::new(
//!     SensorId::new("pluslife_01").unwrap(),
//!     config,
//! );
//!
//! // Bytes as they arrive from the GATT characteristic
//! let output = pipeline.handle_fragment(RawFrame::new(&[0u8; 4], 1000));
//! for event in output.events() {
//!     // Hand off to the dispatcher
//! }
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod alert;
pub mod buffer;
pub mod errors;
pub mod frame;
pub mod history;
pub mod pipeline;
pub mod reading;
pub mod time;

// Public API
pub use alert::{AlertEvent, AlertKind, AlertMachine, AlertState, ThresholdConfig};
pub use errors::{ConfigError, DecodeError};
pub use frame::{FrameDecoder, RawFrame};
pub use history::{HistoryConfig, HistoryEngine};
pub use pipeline::{PipelineConfig, SensorPipeline, StatusSnapshot};
pub use reading::{QualityFlag, Reading, SensorId, TrendDirection, TrendSnapshot};

/// Crate version, for status surfaces and notification payloads.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
