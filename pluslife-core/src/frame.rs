//! Binary telemetry frame decoding
//!
//! ## Wire format
//!
//! The sensor notifies readings on a vendor GATT characteristic. Each frame
//! is a fixed header, a version-specific payload and a CRC trailer:
//!
//! ```text
//! ┌─────────┬──────────┬──────────┬─────────────┬──────────┐
//! │ version │  length  │ sequence │   payload   │  crc16   │
//! │  (1B)   │ (2B BE)  │ (2B BE)  │ (length B)  │ (2B BE)  │
//! └─────────┴──────────┴──────────┴─────────────┴──────────┘
//! ```
//!
//! Version 1 payload (11 bytes):
//!
//! ```text
//! ┌──────────────────┬──────────────┬─────────┐
//! │ sample_timestamp │    value     │ quality │
//! │    (8B BE, ms)   │ (2B BE, ×10) │  (1B)   │
//! └──────────────────┴──────────────┴─────────┘
//! ```
//!
//! The layout is a vendor contract: any version byte other than 1 is a hard
//! rejection, never a best-effort parse.
//!
//! ## Reassembly
//!
//! BLE notifications are MTU-limited, so one frame may arrive split across
//! several deliveries and a delivery may carry the tail of one frame plus
//! the head of the next. The decoder keeps a small per-link byte buffer and
//! extracts complete frames from it. A partial frame that does not complete
//! within a timeout is discarded, so a misbehaving peer cannot pin memory
//! or wedge the stream.
//!
//! ## Ordering
//!
//! Sequence numbers are compared with serial arithmetic (u16 wraparound).
//! Re-delivered and stale sequence numbers are dropped without touching
//! history; the decoder never reorders.

use crc::{Crc, CRC_16_IBM_3740};
use heapless::Vec;

use crate::errors::DecodeError;
use crate::reading::{QualityFlag, Reading, SensorId};
use crate::time::{delta_ms, Timestamp};

/// Frame header length: version, length, sequence
pub const FRAME_HEADER_LEN: usize = 5;

/// CRC trailer length
pub const FRAME_TRAILER_LEN: usize = 2;

/// The only protocol version this decoder understands
pub const PROTOCOL_V1: u8 = 1;

/// Version 1 payload length
pub const V1_PAYLOAD_LEN: usize = 11;

/// Upper bound on any declared payload length
///
/// Larger declarations are rejected immediately instead of buffered, which
/// keeps the reassembly buffer bounded against a corrupt length field.
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Maximum bytes a single frame can occupy
pub const MAX_FRAME_LEN: usize = FRAME_HEADER_LEN + MAX_PAYLOAD_LEN + FRAME_TRAILER_LEN;

/// Largest fragment one transport delivery may carry
///
/// A delivery can hold a backlog of complete frames, not just one, so the
/// reassembly buffer must absorb a whole delivery on top of whatever
/// partial frame the previous delivery left behind. Transports size their
/// reads against this bound.
pub const MAX_DELIVERY_LEN: usize = 512;

/// Reassembly buffer capacity: one leftover partial frame plus one delivery
const ASSEMBLY_CAPACITY: usize = MAX_FRAME_LEN + MAX_DELIVERY_LEN;

/// Default time a partial frame may sit in the buffer before discard
pub const DEFAULT_REASSEMBLY_TIMEOUT_MS: u64 = 5_000;

/// CRC-16/IBM-3740 over header and payload
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// One transport delivery: opaque bytes plus arrival time
///
/// Ephemeral; owned by the decoder only until parsed or rejected.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    /// Fragment bytes exactly as delivered
    pub bytes: &'a [u8],
    /// When the fragment arrived, from the link's clock
    pub arrived_at: Timestamp,
}

impl<'a> RawFrame<'a> {
    /// Wrap a delivered fragment
    pub fn new(bytes: &'a [u8], arrived_at: Timestamp) -> Self {
        Self { bytes, arrived_at }
    }
}

/// `true` if sequence `a` is newer than `b` under u16 wraparound
fn sequence_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Stateful per-link frame decoder
///
/// Owns the reassembly buffer and the last accepted sequence number. One
/// decoder per link; never shared.
pub struct FrameDecoder {
    sensor_id: SensorId,
    assembly: Vec<u8, ASSEMBLY_CAPACITY>,
    assembly_started: Timestamp,
    last_sequence: Option<u16>,
    reassembly_timeout_ms: u64,
}

impl FrameDecoder {
    /// Create a decoder for one sensor link
    pub fn new(sensor_id: SensorId) -> Self {
        Self {
            sensor_id,
            assembly: Vec::new(),
            assembly_started: 0,
            last_sequence: None,
            reassembly_timeout_ms: DEFAULT_REASSEMBLY_TIMEOUT_MS,
        }
    }

    /// Override the partial-frame discard timeout
    pub fn with_reassembly_timeout(mut self, timeout_ms: u64) -> Self {
        self.reassembly_timeout_ms = timeout_ms;
        self
    }

    /// Feed one delivered fragment
    ///
    /// Returns the first complete reading the fragment produced, if any.
    /// Call [`FrameDecoder::poll`] afterwards until it yields `Ok(None)`:
    /// a single delivery can complete more than one frame.
    ///
    /// A returned error accounts for one discarded frame; the decoder is
    /// ready for the next fragment regardless.
    pub fn decode(&mut self, frame: RawFrame<'_>) -> Result<Option<Reading>, DecodeError> {
        // A partial frame that stalled past the timeout is abandoned first.
        // The incoming fragment still gets buffered; the CRC check will
        // resynchronize if it landed mid-frame.
        let stale = if !self.assembly.is_empty()
            && delta_ms(self.assembly_started, frame.arrived_at) > self.reassembly_timeout_ms
        {
            let have = self.assembly.len();
            let expected = self.declared_total().unwrap_or(FRAME_HEADER_LEN);
            self.assembly.clear();
            Some(DecodeError::Truncated { expected, have })
        } else {
            None
        };

        if self.assembly.is_empty() {
            self.assembly_started = frame.arrived_at;
        }

        if self.assembly.extend_from_slice(frame.bytes).is_err() {
            // The fragment exceeds one delivery, or the caller stopped
            // draining. Drop the backlog; the CRC check resynchronizes on
            // whatever arrives next.
            let have = self.assembly.len();
            self.assembly.clear();
            return Err(DecodeError::Truncated {
                expected: have + frame.bytes.len(),
                have,
            });
        }

        if let Some(err) = stale {
            return Err(err);
        }

        self.poll(frame.arrived_at)
    }

    /// Extract the next complete frame from the buffer, if any
    pub fn poll(&mut self, _now: Timestamp) -> Result<Option<Reading>, DecodeError> {
        if self.assembly.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([self.assembly[1], self.assembly[2]]) as usize;
        if length > MAX_PAYLOAD_LEN {
            // Corrupt length field; nothing downstream of it can be trusted
            let have = self.assembly.len();
            self.assembly.clear();
            return Err(DecodeError::Truncated {
                expected: FRAME_HEADER_LEN + length + FRAME_TRAILER_LEN,
                have,
            });
        }

        let total = FRAME_HEADER_LEN + length + FRAME_TRAILER_LEN;
        if self.assembly.len() < total {
            // Waiting on more fragments; the timeout covers a stall here
            return Ok(None);
        }

        let result = self.parse_complete(length, total);
        self.consume(total);
        result.map(Some)
    }

    /// Forget link state after a reconnect
    ///
    /// Drops any partial frame and the sequence watermark: the device
    /// restarts numbering on a new connection, and stale state would
    /// misclassify every new frame as out of order.
    pub fn reset_link(&mut self) {
        self.assembly.clear();
        self.last_sequence = None;
    }

    /// Total frame length the buffered header declares, if readable
    fn declared_total(&self) -> Option<usize> {
        if self.assembly.len() < FRAME_HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes([self.assembly[1], self.assembly[2]]) as usize;
        Some(FRAME_HEADER_LEN + length + FRAME_TRAILER_LEN)
    }

    /// Validate and parse the first `total` buffered bytes as one frame
    fn parse_complete(&mut self, length: usize, total: usize) -> Result<Reading, DecodeError> {
        let frame = &self.assembly[..total];
        let body = &frame[..FRAME_HEADER_LEN + length];

        let actual = u16::from_be_bytes([frame[total - 2], frame[total - 1]]);
        let expected = CRC16.checksum(body);
        if expected != actual {
            return Err(DecodeError::ChecksumMismatch { expected, actual });
        }

        let version = frame[0];
        if version != PROTOCOL_V1 {
            return Err(DecodeError::UnknownVersion { version });
        }

        let sequence = u16::from_be_bytes([frame[3], frame[4]]);
        if let Some(last) = self.last_sequence {
            if sequence == last {
                return Err(DecodeError::Duplicate { sequence });
            }
            if !sequence_newer(sequence, last) {
                return Err(DecodeError::OutOfOrder { sequence, last });
            }
        }

        if length != V1_PAYLOAD_LEN {
            return Err(DecodeError::Truncated {
                expected: V1_PAYLOAD_LEN,
                have: length,
            });
        }

        let payload = &frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length];
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&payload[..8]);
        let sample_timestamp = u64::from_be_bytes(ts_bytes);
        let tenths = u16::from_be_bytes([payload[8], payload[9]]);
        let quality = QualityFlag::from_wire(payload[10]);

        self.last_sequence = Some(sequence);

        Ok(Reading {
            sensor_id: self.sensor_id,
            sample_timestamp,
            value: tenths as f32 / 10.0,
            quality,
            raw_sequence_number: sequence,
        })
    }

    /// Drop the first `count` buffered bytes, keeping any following frame
    fn consume(&mut self, count: usize) {
        let mut rest: Vec<u8, ASSEMBLY_CAPACITY> = Vec::new();
        // Cannot overflow: rest is at most what was already buffered
        let _ = rest.extend_from_slice(&self.assembly[count..]);
        self.assembly = rest;
    }
}

/// Encode one version-1 frame
///
/// The inverse of the decoder, used by device simulators and tests. Values
/// are carried as tenths of a unit and clamp to the u16 range.
pub fn encode_reading(
    sequence: u16,
    sample_timestamp: Timestamp,
    value: f32,
    quality: QualityFlag,
) -> Vec<u8, MAX_FRAME_LEN> {
    let mut out: Vec<u8, MAX_FRAME_LEN> = Vec::new();
    let tenths = (value * 10.0 + 0.5).clamp(0.0, u16::MAX as f32) as u16;

    // Infallible: a v1 frame is far below MAX_FRAME_LEN
    let _ = out.push(PROTOCOL_V1);
    let _ = out.extend_from_slice(&(V1_PAYLOAD_LEN as u16).to_be_bytes());
    let _ = out.extend_from_slice(&sequence.to_be_bytes());
    let _ = out.extend_from_slice(&sample_timestamp.to_be_bytes());
    let _ = out.extend_from_slice(&tenths.to_be_bytes());
    let _ = out.push(quality as u8);

    let crc = CRC16.checksum(&out);
    let _ = out.extend_from_slice(&crc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(SensorId::new("test").unwrap())
    }

    #[test]
    fn decode_whole_frame() {
        let mut dec = decoder();
        let bytes = encode_reading(1, 60_000, 98.5, QualityFlag::Ok);

        let reading = dec.decode(RawFrame::new(&bytes, 0)).unwrap().unwrap();
        assert_eq!(reading.sample_timestamp, 60_000);
        assert_eq!(reading.value, 98.5);
        assert_eq!(reading.quality, QualityFlag::Ok);
        assert_eq!(reading.raw_sequence_number, 1);

        // Nothing left over
        assert!(dec.poll(0).unwrap().is_none());
    }

    #[test]
    fn decode_fragmented_frame() {
        let mut dec = decoder();
        let bytes = encode_reading(7, 120_000, 101.0, QualityFlag::LowConfidence);

        // Split mid-header and mid-payload
        assert!(dec.decode(RawFrame::new(&bytes[..3], 0)).unwrap().is_none());
        assert!(dec.decode(RawFrame::new(&bytes[3..9], 10)).unwrap().is_none());
        let reading = dec.decode(RawFrame::new(&bytes[9..], 20)).unwrap().unwrap();

        assert_eq!(reading.raw_sequence_number, 7);
        assert_eq!(reading.quality, QualityFlag::LowConfidence);
    }

    #[test]
    fn two_frames_in_one_delivery() {
        let mut dec = decoder();
        let mut bytes: std::vec::Vec<u8> = encode_reading(1, 1000, 90.0, QualityFlag::Ok).to_vec();
        bytes.extend_from_slice(&encode_reading(2, 2000, 91.0, QualityFlag::Ok));

        let first = dec.decode(RawFrame::new(&bytes, 0)).unwrap().unwrap();
        assert_eq!(first.raw_sequence_number, 1);

        let second = dec.poll(0).unwrap().unwrap();
        assert_eq!(second.raw_sequence_number, 2);
        assert!(dec.poll(0).unwrap().is_none());
    }

    #[test]
    fn backlog_delivery_decodes_every_frame() {
        let mut dec = decoder();
        let mut bytes: std::vec::Vec<u8> = std::vec::Vec::new();
        for seq in 1..=4u16 {
            bytes.extend_from_slice(&encode_reading(seq, seq as u64 * 1000, 90.0, QualityFlag::Ok));
        }

        // Four complete frames in one transport delivery
        let mut sequences = std::vec::Vec::new();
        if let Some(r) = dec.decode(RawFrame::new(&bytes, 0)).unwrap() {
            sequences.push(r.raw_sequence_number);
        }
        while let Some(r) = dec.poll(0).unwrap() {
            sequences.push(r.raw_sequence_number);
        }
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[test]
    fn full_sized_delivery_decodes_every_frame() {
        let mut dec = decoder();
        let frame_len = FRAME_HEADER_LEN + V1_PAYLOAD_LEN + FRAME_TRAILER_LEN;
        let count = (MAX_DELIVERY_LEN / frame_len) as u16;

        let mut bytes: std::vec::Vec<u8> = std::vec::Vec::new();
        for seq in 1..=count {
            bytes.extend_from_slice(&encode_reading(seq, seq as u64 * 1000, 90.0, QualityFlag::Ok));
        }
        assert!(bytes.len() <= MAX_DELIVERY_LEN);

        let mut decoded = 0;
        if dec.decode(RawFrame::new(&bytes, 0)).unwrap().is_some() {
            decoded += 1;
        }
        while dec.poll(0).unwrap().is_some() {
            decoded += 1;
        }
        assert_eq!(decoded, count as usize);
    }

    #[test]
    fn oversized_delivery_reported_and_recovered() {
        let mut dec = decoder();
        let flood = [0u8; MAX_DELIVERY_LEN + MAX_FRAME_LEN + 1];

        assert_eq!(
            dec.decode(RawFrame::new(&flood, 0)),
            Err(DecodeError::Truncated {
                expected: flood.len(),
                have: 0,
            })
        );

        // The backlog is gone; the next good frame decodes
        let good = encode_reading(1, 1000, 90.0, QualityFlag::Ok);
        assert!(dec.decode(RawFrame::new(&good, 1)).unwrap().is_some());
    }

    #[test]
    fn checksum_mismatch_rejected() {
        let mut dec = decoder();
        let mut bytes = encode_reading(1, 1000, 90.0, QualityFlag::Ok);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        match dec.decode(RawFrame::new(&bytes, 0)) {
            Err(DecodeError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {:?}", other),
        }

        // The bad frame is gone; the next good one decodes
        let good = encode_reading(2, 2000, 91.0, QualityFlag::Ok);
        assert!(dec.decode(RawFrame::new(&good, 1)).unwrap().is_some());
    }

    #[test]
    fn unknown_version_rejected() {
        let mut dec = decoder();
        let mut bytes = encode_reading(1, 1000, 90.0, QualityFlag::Ok);
        bytes[0] = 9;
        // Fix the CRC so only the version is wrong
        let body_len = bytes.len() - FRAME_TRAILER_LEN;
        let crc = CRC16.checksum(&bytes[..body_len]).to_be_bytes();
        bytes[body_len] = crc[0];
        bytes[body_len + 1] = crc[1];

        assert_eq!(
            dec.decode(RawFrame::new(&bytes, 0)),
            Err(DecodeError::UnknownVersion { version: 9 })
        );
    }

    #[test]
    fn duplicate_sequence_dropped() {
        let mut dec = decoder();
        let bytes = encode_reading(5, 1000, 90.0, QualityFlag::Ok);

        assert!(dec.decode(RawFrame::new(&bytes, 0)).unwrap().is_some());
        assert_eq!(
            dec.decode(RawFrame::new(&bytes, 1)),
            Err(DecodeError::Duplicate { sequence: 5 })
        );
    }

    #[test]
    fn stale_sequence_dropped() {
        let mut dec = decoder();
        let newer = encode_reading(10, 2000, 91.0, QualityFlag::Ok);
        let older = encode_reading(3, 1000, 90.0, QualityFlag::Ok);

        assert!(dec.decode(RawFrame::new(&newer, 0)).unwrap().is_some());
        assert_eq!(
            dec.decode(RawFrame::new(&older, 1)),
            Err(DecodeError::OutOfOrder {
                sequence: 3,
                last: 10
            })
        );
    }

    #[test]
    fn sequence_wraparound_accepted() {
        let mut dec = decoder();
        let near_max = encode_reading(u16::MAX, 1000, 90.0, QualityFlag::Ok);
        let wrapped = encode_reading(0, 2000, 91.0, QualityFlag::Ok);

        assert!(dec.decode(RawFrame::new(&near_max, 0)).unwrap().is_some());
        assert!(dec.decode(RawFrame::new(&wrapped, 1)).unwrap().is_some());
    }

    #[test]
    fn stalled_partial_frame_discarded() {
        let mut dec = decoder().with_reassembly_timeout(1_000);
        let bytes = encode_reading(1, 1000, 90.0, QualityFlag::Ok);

        // First half arrives, then the link goes quiet past the timeout
        assert!(dec.decode(RawFrame::new(&bytes[..8], 0)).unwrap().is_none());

        let fresh = encode_reading(2, 2000, 91.0, QualityFlag::Ok);
        match dec.decode(RawFrame::new(&fresh, 5_000)) {
            Err(DecodeError::Truncated { .. }) => {}
            other => panic!("expected truncated, got {:?}", other),
        }

        // The fresh frame was buffered and decodes on the next poll
        let reading = dec.poll(5_000).unwrap().unwrap();
        assert_eq!(reading.raw_sequence_number, 2);
    }

    #[test]
    fn absurd_declared_length_rejected() {
        let mut dec = decoder();
        // version 1, declared length 0xFFFF, sequence 1
        let bytes = [PROTOCOL_V1, 0xFF, 0xFF, 0x00, 0x01];

        match dec.decode(RawFrame::new(&bytes, 0)) {
            Err(DecodeError::Truncated { expected, .. }) => {
                assert!(expected > MAX_FRAME_LEN);
            }
            other => panic!("expected truncated, got {:?}", other),
        }
    }

    #[test]
    fn reset_link_clears_watermark() {
        let mut dec = decoder();
        let late = encode_reading(500, 1000, 90.0, QualityFlag::Ok);
        let early = encode_reading(1, 2000, 91.0, QualityFlag::Ok);

        assert!(dec.decode(RawFrame::new(&late, 0)).unwrap().is_some());
        dec.reset_link();
        // A rebooted device starts numbering from scratch
        assert!(dec.decode(RawFrame::new(&early, 1)).unwrap().is_some());
    }
}
