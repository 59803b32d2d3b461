//! Reading and trend types shared across the pipeline
//!
//! ## Overview
//!
//! A [`Reading`] is the immutable record produced by the frame decoder and
//! consumed by the history engine. It is `Copy` and small (~32 bytes) so the
//! history window can hold a full day of samples in a fixed array without
//! heap allocation.
//!
//! [`TrendSnapshot`] is derived state, recomputed on every insert and never
//! stored independently; it is always recomputable from the window.
//!
//! ## Identity
//!
//! Sensor identifiers are short device addresses ("F4:12:FA:xx" style) or
//! configured labels. They are stored inline in a fixed array to keep
//! `Reading` heap-free, matching the rest of the hot path.

use core::fmt;

/// Maximum length for inline sensor IDs
pub const MAX_SENSOR_ID: usize = 23;

/// Inline, heap-free sensor identifier
///
/// Long enough for a BLE MAC address plus a short suffix. IDs that do not
/// fit are rejected at construction, never truncated.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorId {
    len: u8,
    data: [u8; MAX_SENSOR_ID],
}

impl SensorId {
    /// Create from a string slice; `None` if it exceeds [`MAX_SENSOR_ID`]
    pub fn new(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() > MAX_SENSOR_ID {
            return None;
        }

        let mut data = [0u8; MAX_SENSOR_ID];
        data[..bytes.len()].copy_from_slice(bytes);

        Some(Self {
            len: bytes.len() as u8,
            data,
        })
    }

    /// Get as string slice
    pub fn as_str(&self) -> &str {
        // Only valid UTF-8 is stored by new()
        core::str::from_utf8(&self.data[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for SensorId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Confidence flag attached by the sensor to each sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum QualityFlag {
    /// Sample passed the sensor's internal checks
    Ok = 0,
    /// Sample usable but the sensor flagged reduced confidence
    LowConfidence = 1,
    /// Sensor is still calibrating; value is provisional
    Calibrating = 2,
}

impl QualityFlag {
    /// Map the wire byte to a flag
    ///
    /// Codes the firmware has not documented are treated as low confidence
    /// rather than rejected: the value itself validated against the frame
    /// checksum, only its confidence annotation is unknown.
    pub fn from_wire(code: u8) -> Self {
        match code {
            0 => QualityFlag::Ok,
            2 => QualityFlag::Calibrating,
            _ => QualityFlag::LowConfidence,
        }
    }
}

/// One decoded, validated sensor sample
///
/// Immutable once constructed. `(sensor_id, sample_timestamp)` is unique
/// within a window; the decoder drops duplicate sequence numbers before a
/// second copy can be built.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Reading {
    /// Sensor the sample came from
    pub sensor_id: SensorId,
    /// When the sensor took the sample, in milliseconds
    pub sample_timestamp: crate::time::Timestamp,
    /// Concentration in display units (wire carries tenths)
    pub value: f32,
    /// Sensor-reported confidence
    pub quality: QualityFlag,
    /// Sequence number from the frame header, for ordering diagnostics
    pub raw_sequence_number: u16,
}

/// Classified direction of the recent rate of change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TrendDirection {
    /// Rate above the steady band
    Rising,
    /// Rate below the negative steady band
    Falling,
    /// Rate within the steady band
    Steady,
    /// Not enough points, or a data gap broke the trend
    Unknown,
}

/// Derived trend state, recomputed on every accepted reading
///
/// Never persisted on its own; the history window is the source of truth.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TrendSnapshot {
    /// Value of the newest accepted reading
    pub current_value: f32,
    /// Regression slope over the lookback, in units per minute
    pub rate_of_change_per_minute: f32,
    /// Classification of the rate
    pub direction: TrendDirection,
    /// Seconds since the previous accepted reading, 0 when on schedule
    pub data_gap_seconds: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_id_roundtrip() {
        let id = SensorId::new("F4:12:FA:6E:90:01").unwrap();
        assert_eq!(id.as_str(), "F4:12:FA:6E:90:01");
    }

    #[test]
    fn sensor_id_too_long() {
        assert!(SensorId::new("this_identifier_is_much_too_long_to_store").is_none());
    }

    #[test]
    fn quality_from_wire() {
        assert_eq!(QualityFlag::from_wire(0), QualityFlag::Ok);
        assert_eq!(QualityFlag::from_wire(1), QualityFlag::LowConfidence);
        assert_eq!(QualityFlag::from_wire(2), QualityFlag::Calibrating);
        // Undocumented codes degrade to low confidence
        assert_eq!(QualityFlag::from_wire(9), QualityFlag::LowConfidence);
    }

    #[test]
    fn reading_is_small() {
        // The window stores a day of these in a fixed array
        assert!(core::mem::size_of::<Reading>() <= 48);
    }
}
