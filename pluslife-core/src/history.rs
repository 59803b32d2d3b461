//! Rolling reading history and trend analysis
//!
//! ## Overview
//!
//! The history engine owns one [`ReadingBuffer`] per sensor session and
//! derives a [`TrendSnapshot`] on every accepted reading:
//!
//! - **Rate of change**: least-squares slope over the readings inside a
//!   bounded lookback (15 minutes by default), reported per minute. A
//!   single point yields `Unknown`, never a fabricated zero slope.
//! - **Gap detection**: an interval longer than twice the expected sampling
//!   interval is a data gap. Gaps reset the trend direction to `Unknown`
//!   and fence the regression off from pre-gap points, but history is kept.
//! - **Retention**: readings older than the retention window (24h default)
//!   are evicted on insert.
//!
//! ## Ordering and uniqueness
//!
//! Readings are inserted in arrival order. A reading whose sample timestamp
//! is not newer than the current newest is dropped, which keeps
//! `(sensor_id, sample_timestamp)` unique in the window: re-delivery can
//! never overwrite an accepted sample.

use libm::fabsf;

use crate::buffer::ReadingBuffer;
use crate::reading::{Reading, TrendDirection, TrendSnapshot};
use crate::time::{delta_ms, Timestamp};

/// Default window capacity; a day of samples at the fastest plausible rate
pub const DEFAULT_WINDOW_CAPACITY: usize = 2048;

/// Tuning for history retention and trend computation
#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    /// Readings older than this are evicted (ms)
    pub retention_ms: u64,
    /// Nominal sensor sampling interval (ms); gaps are declared at 2×
    pub expected_interval_ms: u64,
    /// Regression lookback for rate of change (ms)
    pub lookback_ms: u64,
    /// Rates within ±band (units/minute) classify as steady
    pub steady_band_per_minute: f32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_ms: 24 * 60 * 60 * 1_000,
            expected_interval_ms: 60_000,
            lookback_ms: 15 * 60_000,
            steady_band_per_minute: 0.5,
        }
    }
}

impl HistoryConfig {
    /// Interval beyond which a data gap is declared
    pub fn gap_threshold_ms(&self) -> u64 {
        self.expected_interval_ms.saturating_mul(2)
    }
}

/// Per-session reading history with derived trend state
pub struct HistoryEngine<const N: usize = DEFAULT_WINDOW_CAPACITY> {
    window: ReadingBuffer<N>,
    config: HistoryConfig,
    last_snapshot: Option<TrendSnapshot>,
    /// Earliest sample timestamp the regression may use
    ///
    /// Advanced to the first post-gap reading so a trend is never computed
    /// across a gap.
    trend_anchor: Timestamp,
    /// Set by the link layer after a reconnect; forces the next insert to
    /// be treated as following a gap even if the timestamps look contiguous
    link_gap_pending: bool,
}

impl<const N: usize> HistoryEngine<N> {
    /// Create an empty history with the given tuning
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            window: ReadingBuffer::new(),
            config,
            last_snapshot: None,
            trend_anchor: 0,
            link_gap_pending: false,
        }
    }

    /// Insert an accepted reading and recompute the trend
    ///
    /// Duplicate or stale sample timestamps are dropped; the returned
    /// snapshot is then unchanged from the previous insert.
    pub fn insert(&mut self, reading: Reading) -> TrendSnapshot {
        if let Some(last) = self.window.last() {
            if reading.sample_timestamp <= last.sample_timestamp {
                #[cfg(feature = "log")]
                log::debug!(
                    "dropping stale sample at {} (newest {})",
                    reading.sample_timestamp,
                    last.sample_timestamp
                );
                return self
                    .last_snapshot
                    .unwrap_or_else(|| Self::lone_snapshot(&reading));
            }
        }

        let previous_ts = self.window.last().map(|r| r.sample_timestamp);
        let gap_ms = previous_ts
            .map(|ts| delta_ms(ts, reading.sample_timestamp))
            .unwrap_or(0);
        let gapped = self.link_gap_pending
            || (previous_ts.is_some() && gap_ms > self.config.gap_threshold_ms());

        if gapped {
            self.trend_anchor = reading.sample_timestamp;
            self.link_gap_pending = false;
        }

        self.window.push(reading);
        self.evict_expired(reading.sample_timestamp);

        let rate = self.regression_rate(reading.sample_timestamp);
        let direction = if gapped {
            TrendDirection::Unknown
        } else {
            match rate {
                None => TrendDirection::Unknown,
                Some(r) if fabsf(r) <= self.config.steady_band_per_minute => {
                    TrendDirection::Steady
                }
                Some(r) if r > 0.0 => TrendDirection::Rising,
                Some(_) => TrendDirection::Falling,
            }
        };

        let snapshot = TrendSnapshot {
            current_value: reading.value,
            rate_of_change_per_minute: rate.unwrap_or(0.0),
            direction,
            data_gap_seconds: if gapped { (gap_ms / 1_000) as u32 } else { 0 },
        };

        self.last_snapshot = Some(snapshot);
        snapshot
    }

    /// Flag a link interruption before the next reading
    ///
    /// Readings lost while disconnected are a gap to be reported, never
    /// interpolated over.
    pub fn mark_link_gap(&mut self) {
        self.link_gap_pending = true;
    }

    /// Most recent snapshot, if any reading has been accepted
    pub fn snapshot(&self) -> Option<TrendSnapshot> {
        self.last_snapshot
    }

    /// Newest accepted reading
    pub fn latest(&self) -> Option<&Reading> {
        self.window.last()
    }

    /// Number of readings currently retained
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Check whether any reading is retained
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Readings within `duration_ms` of the newest, oldest first
    ///
    /// A fresh, finite iterator on every call; callers can restart at will.
    pub fn window_iter(&self, duration_ms: u64) -> impl Iterator<Item = &Reading> {
        let cutoff = self
            .window
            .last()
            .map(|r| r.sample_timestamp.saturating_sub(duration_ms))
            .unwrap_or(0);
        self.window
            .iter()
            .filter(move |r| r.sample_timestamp >= cutoff)
    }

    /// Drop readings older than the retention window
    fn evict_expired(&mut self, newest_ts: Timestamp) {
        let cutoff = newest_ts.saturating_sub(self.config.retention_ms);
        while let Some(first) = self.window.first() {
            if first.sample_timestamp >= cutoff {
                break;
            }
            self.window.pop_oldest();
        }
    }

    /// Least-squares slope in units/minute over the trend lookback
    ///
    /// `None` with fewer than two usable points.
    fn regression_rate(&self, newest_ts: Timestamp) -> Option<f32> {
        let lookback_start = newest_ts.saturating_sub(self.config.lookback_ms);
        let start = lookback_start.max(self.trend_anchor);

        let mut n = 0.0f32;
        let mut sum_x = 0.0f32;
        let mut sum_y = 0.0f32;
        let mut sum_xx = 0.0f32;
        let mut sum_xy = 0.0f32;

        for r in self.window.iter() {
            if r.sample_timestamp < start {
                continue;
            }
            // Minutes relative to the window start keep x small and the
            // f32 sums well conditioned
            let x = delta_ms(start, r.sample_timestamp) as f32 / 60_000.0;
            let y = r.value;
            n += 1.0;
            sum_x += x;
            sum_y += y;
            sum_xx += x * x;
            sum_xy += x * y;
        }

        if n < 2.0 {
            return None;
        }

        let denom = n * sum_xx - sum_x * sum_x;
        if denom == 0.0 {
            return None;
        }

        Some((n * sum_xy - sum_x * sum_y) / denom)
    }

    /// Snapshot for a reading dropped before any was accepted
    fn lone_snapshot(reading: &Reading) -> TrendSnapshot {
        TrendSnapshot {
            current_value: reading.value,
            rate_of_change_per_minute: 0.0,
            direction: TrendDirection::Unknown,
            data_gap_seconds: 0,
        }
    }
}

impl<const N: usize> Default for HistoryEngine<N> {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}
