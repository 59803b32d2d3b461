//! Error types for the monitoring core
//!
//! ## Design
//!
//! Errors here follow the same rules as the rest of the hot path:
//!
//! 1. **Small and Copy**: variants carry a few integers, no String. A
//!    rejected frame is routine, not exceptional, and its error may sit in
//!    a bounded output buffer next to alert events.
//!
//! 2. **Non-fatal by policy**: a [`DecodeError`] discards exactly one frame
//!    and never stops the pipeline, and never fabricates a reading. The
//!    link layer logs every rejection; undetected monitoring failure is the
//!    worst-case outcome for this system.
//!
//! 3. **Strict on versions**: an unknown protocol version is a hard
//!    rejection. Best-effort parsing of an unrecognized layout could invent
//!    clinically wrong values.

use thiserror_no_std::Error;

/// Errors from decoding raw telemetry frames
///
/// Each error accounts for exactly one discarded frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// CRC trailer did not match the frame contents
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// CRC computed over header and payload
        expected: u16,
        /// CRC carried in the frame trailer
        actual: u16,
    },

    /// Protocol version this decoder does not understand
    #[error("unknown protocol version {version}")]
    UnknownVersion {
        /// Version byte from the frame header
        version: u8,
    },

    /// Frame incomplete: reassembly timed out or the declared length is
    /// impossible
    #[error("truncated frame: expected {expected} bytes, have {have}")]
    Truncated {
        /// Bytes the header declared
        expected: usize,
        /// Bytes actually assembled
        have: usize,
    },

    /// Sequence number older than the last accepted frame
    #[error("out-of-order frame: sequence {sequence} after {last}")]
    OutOfOrder {
        /// Sequence number of the rejected frame
        sequence: u16,
        /// Last accepted sequence number
        last: u16,
    },

    /// Re-delivery of an already accepted sequence number
    #[error("duplicate frame: sequence {sequence}")]
    Duplicate {
        /// Repeated sequence number
        sequence: u16,
    },
}

/// Errors from validating pipeline configuration
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Thresholds are not strictly ordered
    /// (urgent_low < low < high < urgent_high)
    #[error("thresholds out of order")]
    ThresholdOrder,

    /// Hysteresis margin is zero, negative or not finite
    #[error("invalid hysteresis margin")]
    HysteresisMargin,

    /// Margin is wide enough to overlap an adjacent threshold
    #[error("hysteresis margin overlaps adjacent threshold")]
    MarginOverlap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_stay_small() {
        // Rejections are buffered alongside events; keep them cheap to copy
        assert!(core::mem::size_of::<DecodeError>() <= 24);
    }

    #[test]
    fn display_names_the_sequence() {
        let err = DecodeError::OutOfOrder {
            sequence: 7,
            last: 12,
        };
        let text = format!("{}", err);
        assert!(text.contains('7'));
        assert!(text.contains("12"));
    }
}
