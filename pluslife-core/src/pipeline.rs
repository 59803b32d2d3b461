//! Per-sensor processing pipeline
//!
//! ## Overview
//!
//! [`SensorPipeline`] wires the three stages together behind one synchronous
//! entry point:
//!
//! ```text
//! handle_fragment ─► FrameDecoder ─► HistoryEngine ─► AlertMachine
//!                         │               │                │
//!                      rejects         snapshot          events
//! ```
//!
//! The pipeline is the single writer for all three stages. The link layer
//! owns it, feeds it fragments and periodic ticks, and forwards the returned
//! events to the dispatcher. Nothing in here allocates, blocks or spawns;
//! every decision is a function of the bytes and timestamps passed in, which
//! is what makes session replay and the tests deterministic.

use heapless::Vec;

use crate::alert::{AlertEvent, AlertMachine, AlertState, ThresholdConfig};
use crate::errors::{ConfigError, DecodeError};
use crate::frame::{FrameDecoder, RawFrame};
use crate::history::{HistoryConfig, HistoryEngine, DEFAULT_WINDOW_CAPACITY};
use crate::reading::{Reading, SensorId, TrendSnapshot};
use crate::time::Timestamp;

/// Upper bound on events and rejects from a single delivery
///
/// One frame yields at most one event, and an MTU-limited delivery cannot
/// complete more than a handful of frames. Overflow is counted, not grown.
pub const MAX_OUTPUTS_PER_FRAGMENT: usize = 8;

/// Full pipeline configuration
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// History retention and trend tuning
    pub history: HistoryConfig,
    /// Alerting thresholds and timing
    pub thresholds: ThresholdConfig,
}

impl PipelineConfig {
    /// Configuration with default history tuning
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self {
            history: HistoryConfig::default(),
            thresholds,
        }
    }

    /// Reject configurations that cannot run coherently
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(ThresholdConfig::default())
    }
}

/// Counters across the life of one pipeline
///
/// Cheap to copy into a status snapshot; never reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PipelineStats {
    /// Frames that decoded successfully
    pub frames_accepted: u64,
    /// Frames rejected by the decoder, all causes
    pub frames_rejected: u64,
    /// Rejections that were re-deliveries of an accepted sequence
    pub duplicates: u64,
    /// Rejections with a stale sequence number
    pub out_of_order: u64,
    /// Rejections with a bad CRC
    pub checksum_failures: u64,
    /// Readings dropped by history as stale or duplicate timestamps
    pub stale_samples: u64,
    /// Alert events handed to the caller
    pub alerts_emitted: u64,
    /// Events or rejects lost to a full per-fragment output buffer
    pub outputs_dropped: u64,
}

/// What one fragment (or tick) produced
#[derive(Debug, Default)]
pub struct PipelineOutput {
    events: Vec<AlertEvent, MAX_OUTPUTS_PER_FRAGMENT>,
    rejects: Vec<DecodeError, MAX_OUTPUTS_PER_FRAGMENT>,
    accepted: usize,
}

impl PipelineOutput {
    /// Alert events to dispatch, in emission order
    pub fn events(&self) -> &[AlertEvent] {
        &self.events
    }

    /// Decode rejections, for logging and counters
    pub fn rejects(&self) -> &[DecodeError] {
        &self.rejects
    }

    /// Readings accepted into history by this call
    pub fn accepted(&self) -> usize {
        self.accepted
    }
}

/// Point-in-time view of one session, for status surfaces
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StatusSnapshot {
    /// Sensor this session belongs to
    pub sensor_id: SensorId,
    /// Newest accepted reading
    pub latest: Option<Reading>,
    /// Trend derived from the newest reading
    pub trend: Option<TrendSnapshot>,
    /// Current alerting state
    pub alert_state: AlertState,
    /// Readings currently retained in the window
    pub retained_readings: usize,
    /// Lifetime counters
    pub stats: PipelineStats,
}

/// Decoder, history and alerting for one sensor link
///
/// Single writer; the owning session task is the only caller.
pub struct SensorPipeline<const N: usize = DEFAULT_WINDOW_CAPACITY> {
    sensor_id: SensorId,
    decoder: FrameDecoder,
    history: HistoryEngine<N>,
    alerts: AlertMachine,
    stats: PipelineStats,
}

impl<const N: usize> SensorPipeline<N> {
    /// Build a pipeline for one sensor
    pub fn new(sensor_id: SensorId, config: PipelineConfig) -> Self {
        Self {
            sensor_id,
            decoder: FrameDecoder::new(sensor_id),
            history: HistoryEngine::new(config.history),
            alerts: AlertMachine::new(config.thresholds),
            stats: PipelineStats::default(),
        }
    }

    /// Sensor this pipeline serves
    pub fn sensor_id(&self) -> SensorId {
        self.sensor_id
    }

    /// Process one transport delivery
    ///
    /// Drains every complete frame the delivery produced. Decode errors are
    /// reported and counted but never stop the drain: one corrupt frame
    /// must not shadow a good one behind it.
    pub fn handle_fragment(&mut self, frame: RawFrame<'_>) -> PipelineOutput {
        let mut out = PipelineOutput::default();
        let arrived_at = frame.arrived_at;

        match self.decoder.decode(frame) {
            Ok(Some(reading)) => self.accept(reading, &mut out),
            Ok(None) => {}
            Err(err) => self.reject(err, &mut out),
        }

        loop {
            match self.decoder.poll(arrived_at) {
                Ok(Some(reading)) => self.accept(reading, &mut out),
                Ok(None) => break,
                Err(err) => self.reject(err, &mut out),
            }
        }

        out
    }

    /// Periodic wakeup without new data
    ///
    /// Drives snooze expiry and re-notification of a standing alert while
    /// the sensor is quiet. The session calls this once per tick interval.
    pub fn tick(&mut self, now: Timestamp) -> Option<AlertEvent> {
        let current = self.history.latest().map(|r| r.value);
        let event = self.alerts.tick(self.sensor_id, current, now);
        if event.is_some() {
            self.stats.alerts_emitted += 1;
        }
        event
    }

    /// Record a link interruption
    ///
    /// Called by the session after every reconnect, before any new
    /// fragment: drops partial reassembly state and the sequence watermark,
    /// and marks the next reading as following a gap.
    pub fn mark_link_gap(&mut self) {
        self.decoder.reset_link();
        self.history.mark_link_gap();
    }

    /// Suppress the current alert until `until`
    pub fn snooze(&mut self, until: Timestamp) -> bool {
        self.alerts.snooze(until)
    }

    /// End a snooze early, settling against the latest reading
    pub fn clear_snooze(&mut self, now: Timestamp) -> Option<AlertEvent> {
        let current = self.history.latest().map(|r| r.value);
        let event = self.alerts.clear_snooze(self.sensor_id, current, now);
        if event.is_some() {
            self.stats.alerts_emitted += 1;
        }
        event
    }

    /// Current alerting state
    pub fn alert_state(&self) -> AlertState {
        self.alerts.state()
    }

    /// Lifetime counters
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Consistent point-in-time view for status surfaces
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            sensor_id: self.sensor_id,
            latest: self.history.latest().copied(),
            trend: self.history.snapshot(),
            alert_state: self.alerts.state(),
            retained_readings: self.history.len(),
            stats: self.stats,
        }
    }

    /// Readings within `duration_ms` of the newest, oldest first
    pub fn window_iter(&self, duration_ms: u64) -> impl Iterator<Item = &Reading> {
        self.history.window_iter(duration_ms)
    }

    fn accept(&mut self, reading: Reading, out: &mut PipelineOutput) {
        self.stats.frames_accepted += 1;

        // The decoder dedups by sequence; history still guards the
        // timestamp axis, since a rebooted device reuses sequence space
        let fresh = self
            .history
            .latest()
            .map(|l| reading.sample_timestamp > l.sample_timestamp)
            .unwrap_or(true);
        if !fresh {
            self.stats.stale_samples += 1;
            return;
        }

        self.history.insert(reading);
        out.accepted += 1;

        if let Some(event) =
            self.alerts
                .evaluate(self.sensor_id, reading.value, reading.sample_timestamp)
        {
            self.stats.alerts_emitted += 1;
            if out.events.push(event).is_err() {
                self.stats.outputs_dropped += 1;
            }
        }
    }

    fn reject(&mut self, err: DecodeError, out: &mut PipelineOutput) {
        self.stats.frames_rejected += 1;
        match err {
            DecodeError::Duplicate { .. } => self.stats.duplicates += 1,
            DecodeError::OutOfOrder { .. } => self.stats.out_of_order += 1,
            DecodeError::ChecksumMismatch { .. } => self.stats.checksum_failures += 1,
            _ => {}
        }
        if out.rejects.push(err).is_err() {
            self.stats.outputs_dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_reading;
    use crate::reading::{QualityFlag, TrendDirection};

    const MINUTE: u64 = 60_000;

    fn sensor() -> SensorId {
        SensorId::new("pluslife_01").unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig::new(ThresholdConfig {
            urgent_low: 55.0,
            low: 70.0,
            high: 140.0,
            urgent_high: 250.0,
            hysteresis_margin: 10.0,
            debounce_ms: 2 * MINUTE,
            renotify_interval_ms: 30 * MINUTE,
        })
    }

    fn pipeline() -> SensorPipeline<64> {
        SensorPipeline::new(sensor(), config())
    }

    fn feed(p: &mut SensorPipeline<64>, seq: u16, ts: u64, value: f32) -> PipelineOutput {
        let bytes = encode_reading(seq, ts, value, QualityFlag::Ok);
        p.handle_fragment(RawFrame::new(&bytes, ts))
    }

    #[test]
    fn fragment_to_alert_end_to_end() {
        let mut p = pipeline();
        let values = [90.0, 92.0, 88.0, 150.0, 151.0, 152.0];

        let mut events = std::vec::Vec::new();
        for (i, v) in values.iter().enumerate() {
            let out = feed(&mut p, i as u16 + 1, i as u64 * MINUTE, *v);
            assert_eq!(out.accepted(), 1);
            events.extend_from_slice(out.events());
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, crate::alert::AlertKind::High);
        assert_eq!(p.stats().frames_accepted, 6);
        assert_eq!(p.stats().alerts_emitted, 1);
    }

    #[test]
    fn rejects_reported_without_stopping_the_drain() {
        let mut p = pipeline();

        // A corrupt frame followed by a good one, delivered together
        let mut bytes: std::vec::Vec<u8> =
            encode_reading(1, MINUTE, 90.0, QualityFlag::Ok).to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        bytes.extend_from_slice(&encode_reading(2, 2 * MINUTE, 91.0, QualityFlag::Ok));

        let out = p.handle_fragment(RawFrame::new(&bytes, 0));
        assert_eq!(out.rejects().len(), 1);
        assert_eq!(out.accepted(), 1);
        assert_eq!(p.stats().checksum_failures, 1);
        assert_eq!(p.stats().frames_rejected, 1);
        assert_eq!(p.stats().frames_accepted, 1);
    }

    #[test]
    fn duplicate_sequence_counted() {
        let mut p = pipeline();
        feed(&mut p, 5, MINUTE, 90.0);
        let out = feed(&mut p, 5, MINUTE, 90.0);

        assert!(out.events().is_empty());
        assert_eq!(out.accepted(), 0);
        assert_eq!(p.stats().duplicates, 1);
    }

    #[test]
    fn reboot_reusing_sequence_space_cannot_rewrite_history() {
        let mut p = pipeline();
        feed(&mut p, 100, 10 * MINUTE, 90.0);

        // Device reboots; the session resets the link, the device restarts
        // numbering and replays an old timestamp
        p.mark_link_gap();
        let out = feed(&mut p, 1, 10 * MINUTE, 999.0);

        assert_eq!(out.accepted(), 0);
        assert_eq!(p.stats().stale_samples, 1);
        assert_eq!(p.snapshot().latest.unwrap().value, 90.0);
    }

    #[test]
    fn link_gap_resets_trend_direction() {
        let mut p = pipeline();
        feed(&mut p, 1, 0, 100.0);
        feed(&mut p, 2, MINUTE, 102.0);
        feed(&mut p, 3, 2 * MINUTE, 104.0);

        p.mark_link_gap();
        // Fresh sequence numbering after reconnect decodes fine
        feed(&mut p, 1, 3 * MINUTE, 106.0);

        let snap = p.snapshot();
        assert_eq!(snap.trend.unwrap().direction, TrendDirection::Unknown);
        assert_eq!(snap.retained_readings, 4);
    }

    #[test]
    fn tick_renotifies_quiet_sensor() {
        let mut p = pipeline();
        feed(&mut p, 1, 0, 100.0);
        feed(&mut p, 2, MINUTE, 150.0);
        let out = feed(&mut p, 3, 2 * MINUTE, 151.0);
        assert_eq!(out.events().len(), 1);

        assert!(p.tick(10 * MINUTE).is_none());
        let event = p.tick(40 * MINUTE).unwrap();
        assert!(event.is_renotify);
        assert_eq!(p.stats().alerts_emitted, 2);
    }

    #[test]
    fn snooze_and_clear_through_the_pipeline() {
        let mut p = pipeline();
        feed(&mut p, 1, 0, 100.0);
        feed(&mut p, 2, MINUTE, 150.0);
        feed(&mut p, 3, 2 * MINUTE, 151.0);

        assert!(p.snooze(60 * MINUTE));
        let out = feed(&mut p, 4, 3 * MINUTE, 180.0);
        assert!(out.events().is_empty());

        // Clearing settles against the latest reading, still high
        let event = p.clear_snooze(5 * MINUTE).unwrap();
        assert!(!event.is_renotify);
        assert!(matches!(p.alert_state(), AlertState::Active { .. }));
    }

    #[test]
    fn snapshot_reflects_the_session() {
        let mut p = pipeline();
        feed(&mut p, 1, 0, 100.0);
        feed(&mut p, 2, MINUTE, 101.0);

        let snap = p.snapshot();
        assert_eq!(snap.sensor_id.as_str(), "pluslife_01");
        assert_eq!(snap.latest.unwrap().value, 101.0);
        assert_eq!(snap.retained_readings, 2);
        assert_eq!(snap.alert_state, AlertState::Normal);
        assert_eq!(snap.stats.frames_accepted, 2);
    }

    #[test]
    fn empty_fragment_is_harmless() {
        let mut p = pipeline();
        let out = p.handle_fragment(RawFrame::new(&[], 0));

        assert!(out.events().is_empty());
        assert!(out.rejects().is_empty());
        assert_eq!(out.accepted(), 0);
    }
}
