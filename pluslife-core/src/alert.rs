//! Threshold alerting state machine
//!
//! ## Overview
//!
//! Each accepted reading drives one step of a per-sensor state machine:
//!
//! ```text
//!            crossing                debounce elapsed
//!  Normal ──────────────► Pending ────────────────────► Active
//!    ▲                       │                            │
//!    │   back past margin    │ back in range              │ re-notify
//!    └───────────────────────┴────────────◄───────────────┘ interval
//! ```
//!
//! Two mechanisms defend against notification storms from noisy data, and
//! both are load-bearing:
//!
//! - **Debounce**: a crossing must persist for the configured duration
//!   before it becomes Active. A single outlier sample never alerts.
//! - **Hysteresis**: once Active, the state holds until the value crosses
//!   back past the threshold by a margin. A value oscillating on the
//!   boundary cannot flap between Active and Normal.
//!
//! Urgent kinds preempt their plain counterpart in the same direction at
//! any point, including through a snooze. Every Active entry emits exactly
//! one [`AlertEvent`]; a long-running Active re-notifies at a minimum
//! interval; Snoozed emits nothing.
//!
//! ## Timing model
//!
//! Debounce is measured on sample timestamps, so the machine is fully
//! deterministic and replayable. Snooze expiry and re-notification are
//! checked both on samples and on an external tick, which covers the case
//! where the sensor goes quiet while an alert is standing. All timestamps
//! share one epoch.

use crate::errors::ConfigError;
use crate::reading::SensorId;
use crate::time::{delta_ms, Timestamp};

/// Which side of the normal band a kind sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdSide {
    /// Low and urgent-low: value fell below a floor
    Below,
    /// High and urgent-high: value rose above a ceiling
    Above,
}

/// Alert classification, by threshold crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AlertKind {
    /// Below the urgent low floor
    UrgentLow,
    /// Below the low floor
    Low,
    /// Above the high ceiling
    High,
    /// Above the urgent high ceiling
    UrgentHigh,
}

impl AlertKind {
    /// Direction of the crossing
    pub fn side(&self) -> ThresholdSide {
        match self {
            AlertKind::UrgentLow | AlertKind::Low => ThresholdSide::Below,
            AlertKind::High | AlertKind::UrgentHigh => ThresholdSide::Above,
        }
    }

    /// Severity rank; urgent kinds preempt plain ones on the same side
    pub fn severity(&self) -> u8 {
        match self {
            AlertKind::Low | AlertKind::High => 0,
            AlertKind::UrgentLow | AlertKind::UrgentHigh => 1,
        }
    }

    /// Stable name for payloads and logs
    pub fn label(&self) -> &'static str {
        match self {
            AlertKind::UrgentLow => "urgent_low",
            AlertKind::Low => "low",
            AlertKind::High => "high",
            AlertKind::UrgentHigh => "urgent_high",
        }
    }
}

/// Alerting thresholds and timing, immutable for a session
///
/// Supplied by the configuration loader at session start; changing it means
/// restarting the session.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ThresholdConfig {
    /// Floor for urgent-low alerts
    pub urgent_low: f32,
    /// Floor for low alerts
    pub low: f32,
    /// Ceiling for high alerts
    pub high: f32,
    /// Ceiling for urgent-high alerts
    pub urgent_high: f32,
    /// Margin a value must clear past its threshold before release
    pub hysteresis_margin: f32,
    /// Minimum persistence before a crossing becomes Active (ms)
    pub debounce_ms: u64,
    /// Minimum interval between notifications for one standing alert (ms)
    pub renotify_interval_ms: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            urgent_low: 55.0,
            low: 70.0,
            high: 180.0,
            urgent_high: 250.0,
            hysteresis_margin: 10.0,
            debounce_ms: 5 * 60_000,
            renotify_interval_ms: 30 * 60_000,
        }
    }
}

impl ThresholdConfig {
    /// Reject configurations that cannot alert coherently
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.urgent_low < self.low && self.low < self.high && self.high < self.urgent_high) {
            return Err(ConfigError::ThresholdOrder);
        }
        if !self.hysteresis_margin.is_finite() || self.hysteresis_margin <= 0.0 {
            return Err(ConfigError::HysteresisMargin);
        }
        if self.low + self.hysteresis_margin >= self.high - self.hysteresis_margin {
            return Err(ConfigError::MarginOverlap);
        }
        Ok(())
    }

    /// Worst threshold the value currently violates, if any
    pub fn classify(&self, value: f32) -> Option<AlertKind> {
        if value <= self.urgent_low {
            Some(AlertKind::UrgentLow)
        } else if value <= self.low {
            Some(AlertKind::Low)
        } else if value >= self.urgent_high {
            Some(AlertKind::UrgentHigh)
        } else if value >= self.high {
            Some(AlertKind::High)
        } else {
            None
        }
    }
}

/// Alerting state for one sensor session
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", rename_all = "snake_case"))]
pub enum AlertState {
    /// Value inside the normal band
    Normal,
    /// Crossing observed, waiting out the debounce
    Pending {
        /// Threshold being violated
        kind: AlertKind,
        /// Debounce anchor: last sample known not to violate
        since: Timestamp,
    },
    /// Confirmed alert
    Active {
        /// Threshold being violated
        kind: AlertKind,
        /// When the crossing was anchored
        since: Timestamp,
        /// Last time an event was emitted for this alert
        last_notified: Timestamp,
    },
    /// Alerting suppressed by the user until an expiry
    Snoozed {
        /// Kind that was snoozed
        kind: AlertKind,
        /// When suppression ends
        until: Timestamp,
    },
}

/// One notification-worthy transition
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AlertEvent {
    /// Threshold crossed
    pub kind: AlertKind,
    /// Sensor the alert belongs to
    pub sensor_id: SensorId,
    /// Value that drove the transition
    pub value: f32,
    /// When the transition happened
    pub timestamp: Timestamp,
    /// `true` for periodic re-notification of a standing alert
    pub is_renotify: bool,
}

/// The per-sensor alerting state machine
///
/// Single writer: driven only by its session's pipeline, in sample order.
pub struct AlertMachine {
    config: ThresholdConfig,
    state: AlertState,
    /// Newest evaluated sample timestamp, anchors debounce for the next
    /// crossing
    last_sample: Option<Timestamp>,
}

impl AlertMachine {
    /// Create a machine in the Normal state
    pub fn new(config: ThresholdConfig) -> Self {
        Self {
            config,
            state: AlertState::Normal,
            last_sample: None,
        }
    }

    /// Current state
    pub fn state(&self) -> AlertState {
        self.state
    }

    /// Configured thresholds
    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Step the machine with a new sample
    ///
    /// At most one event per step.
    pub fn evaluate(
        &mut self,
        sensor_id: SensorId,
        value: f32,
        ts: Timestamp,
    ) -> Option<AlertEvent> {
        let target = self.config.classify(value);

        let event = match self.state {
            AlertState::Normal => match target {
                Some(kind) => self.enter_pending(sensor_id, kind, value, ts),
                None => None,
            },

            AlertState::Pending { kind, since } => match target {
                // Same side continues the incident: escalation and
                // demotion both keep the original debounce anchor
                Some(t) if t.side() == kind.side() => {
                    self.settle_pending(sensor_id, t, since, value, ts)
                }
                // Swung across the whole band; restart on the other side
                Some(t) => self.enter_pending(sensor_id, t, value, ts),
                None => {
                    self.state = AlertState::Normal;
                    None
                }
            },

            AlertState::Active {
                kind,
                since,
                last_notified,
            } => match self.hysteresis_classify(kind, value) {
                None => {
                    self.state = AlertState::Normal;
                    match target {
                        Some(t) => self.enter_pending(sensor_id, t, value, ts),
                        None => None,
                    }
                }
                Some(held) if held.severity() > kind.severity() => {
                    // Preemption: urgent entry is a new Active, new event
                    self.state = AlertState::Active {
                        kind: held,
                        since: ts,
                        last_notified: ts,
                    };
                    Some(AlertEvent {
                        kind: held,
                        sensor_id,
                        value,
                        timestamp: ts,
                        is_renotify: false,
                    })
                }
                Some(held) => {
                    // Still Active (possibly demoted from urgent within
                    // the margin). Re-notify only while the threshold is
                    // genuinely violated.
                    let due = target == Some(held)
                        && delta_ms(last_notified, ts) >= self.config.renotify_interval_ms;
                    self.state = AlertState::Active {
                        kind: held,
                        since,
                        last_notified: if due { ts } else { last_notified },
                    };
                    due.then(|| AlertEvent {
                        kind: held,
                        sensor_id,
                        value,
                        timestamp: ts,
                        is_renotify: true,
                    })
                }
            },

            AlertState::Snoozed { kind, until } => {
                if ts >= until {
                    self.wake_from_snooze(sensor_id, target, value, ts)
                } else if let Some(t) = target {
                    // An urgent crossing breaks through a plain snooze
                    if t.side() == kind.side() && t.severity() > kind.severity() {
                        self.enter_pending(sensor_id, t, value, ts)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        };

        self.last_sample = Some(ts);
        event
    }

    /// Periodic check without a new sample
    ///
    /// Handles snooze expiry and re-notification while the sensor is quiet.
    /// `current_value` is the latest retained reading, if any.
    pub fn tick(
        &mut self,
        sensor_id: SensorId,
        current_value: Option<f32>,
        now: Timestamp,
    ) -> Option<AlertEvent> {
        match self.state {
            AlertState::Snoozed { until, .. } if now >= until => {
                let target = current_value.and_then(|v| self.config.classify(v));
                let value = current_value.unwrap_or(0.0);
                self.wake_from_snooze(sensor_id, target, value, now)
            }
            AlertState::Active {
                kind,
                since,
                last_notified,
            } => {
                let value = current_value?;
                let violating = self.config.classify(value) == Some(kind);
                if violating && delta_ms(last_notified, now) >= self.config.renotify_interval_ms {
                    self.state = AlertState::Active {
                        kind,
                        since,
                        last_notified: now,
                    };
                    Some(AlertEvent {
                        kind,
                        sensor_id,
                        value,
                        timestamp: now,
                        is_renotify: true,
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Suppress the current alert until `until`
    ///
    /// Returns `false` when there is nothing to snooze.
    pub fn snooze(&mut self, until: Timestamp) -> bool {
        let kind = match self.state {
            AlertState::Pending { kind, .. }
            | AlertState::Active { kind, .. }
            | AlertState::Snoozed { kind, .. } => kind,
            AlertState::Normal => return false,
        };
        self.state = AlertState::Snoozed { kind, until };
        true
    }

    /// End a snooze early
    ///
    /// Settles exactly like a natural expiry: the current value decides
    /// whether the machine returns to Normal or straight to Active with
    /// one event. No effect when not snoozed.
    pub fn clear_snooze(
        &mut self,
        sensor_id: SensorId,
        current_value: Option<f32>,
        now: Timestamp,
    ) -> Option<AlertEvent> {
        if !matches!(self.state, AlertState::Snoozed { .. }) {
            return None;
        }
        let target = current_value.and_then(|v| self.config.classify(v));
        let value = current_value.unwrap_or(0.0);
        self.wake_from_snooze(sensor_id, target, value, now)
    }

    /// Begin (or restart) a pending crossing
    ///
    /// The debounce anchor is the previous sample when it is recent enough
    /// to witness the crossing's onset; after a long silence the anchor is
    /// the crossing sample itself, so sparse data still earns a full
    /// debounce interval.
    fn enter_pending(
        &mut self,
        sensor_id: SensorId,
        kind: AlertKind,
        value: f32,
        ts: Timestamp,
    ) -> Option<AlertEvent> {
        let since = match self.last_sample {
            Some(prev) if delta_ms(prev, ts) <= self.config.debounce_ms => prev,
            _ => ts,
        };
        self.settle_pending(sensor_id, kind, since, value, ts)
    }

    /// Promote a pending crossing once the debounce has elapsed
    fn settle_pending(
        &mut self,
        sensor_id: SensorId,
        kind: AlertKind,
        since: Timestamp,
        value: f32,
        ts: Timestamp,
    ) -> Option<AlertEvent> {
        if delta_ms(since, ts) >= self.config.debounce_ms {
            self.state = AlertState::Active {
                kind,
                since,
                last_notified: ts,
            };
            Some(AlertEvent {
                kind,
                sensor_id,
                value,
                timestamp: ts,
                is_renotify: false,
            })
        } else {
            self.state = AlertState::Pending { kind, since };
            None
        }
    }

    /// Settle the state after a snooze ends
    ///
    /// A value still out of range goes straight to Active: the condition
    /// persisted through the snooze, it is not a fresh crossing to debounce.
    fn wake_from_snooze(
        &mut self,
        sensor_id: SensorId,
        target: Option<AlertKind>,
        value: f32,
        ts: Timestamp,
    ) -> Option<AlertEvent> {
        match target {
            Some(kind) => {
                self.state = AlertState::Active {
                    kind,
                    since: ts,
                    last_notified: ts,
                };
                Some(AlertEvent {
                    kind,
                    sensor_id,
                    value,
                    timestamp: ts,
                    is_renotify: false,
                })
            }
            None => {
                self.state = AlertState::Normal;
                None
            }
        }
    }

    /// Reclassify a value while Active, with release margins applied
    ///
    /// The boundary that made the alert Active (and, for urgent kinds, the
    /// urgent boundary) is shifted toward normal by the hysteresis margin,
    /// so the value must clearly cross back before the state lets go.
    fn hysteresis_classify(&self, current: AlertKind, value: f32) -> Option<AlertKind> {
        let c = &self.config;
        match current.side() {
            ThresholdSide::Above => {
                let urgent_floor = if current == AlertKind::UrgentHigh {
                    c.urgent_high - c.hysteresis_margin
                } else {
                    c.urgent_high
                };
                if value >= urgent_floor {
                    Some(AlertKind::UrgentHigh)
                } else if value > c.high - c.hysteresis_margin {
                    Some(AlertKind::High)
                } else {
                    None
                }
            }
            ThresholdSide::Below => {
                let urgent_ceiling = if current == AlertKind::UrgentLow {
                    c.urgent_low + c.hysteresis_margin
                } else {
                    c.urgent_low
                };
                if value <= urgent_ceiling {
                    Some(AlertKind::UrgentLow)
                } else if value < c.low + c.hysteresis_margin {
                    Some(AlertKind::Low)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    fn sensor() -> SensorId {
        SensorId::new("test").unwrap()
    }

    fn config() -> ThresholdConfig {
        ThresholdConfig {
            urgent_low: 55.0,
            low: 70.0,
            high: 140.0,
            urgent_high: 250.0,
            hysteresis_margin: 10.0,
            debounce_ms: 2 * MINUTE,
            renotify_interval_ms: 30 * MINUTE,
        }
    }

    fn machine() -> AlertMachine {
        AlertMachine::new(config())
    }

    #[test]
    fn config_validation() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.low = 300.0;
        assert_eq!(bad.validate(), Err(ConfigError::ThresholdOrder));

        let mut bad = config();
        bad.hysteresis_margin = -1.0;
        assert_eq!(bad.validate(), Err(ConfigError::HysteresisMargin));

        let mut bad = config();
        bad.hysteresis_margin = 40.0;
        assert_eq!(bad.validate(), Err(ConfigError::MarginOverlap));
    }

    #[test]
    fn debounce_scenario_exact_event_count() {
        // [90, 92, 88, 150, 151, 152] at one minute spacing, high = 140,
        // debounce = 2 min: Pending at 150, Active at 151, one event.
        let mut m = machine();
        let values = [90.0, 92.0, 88.0, 150.0, 151.0, 152.0];
        let mut events = Vec::new();

        for (i, v) in values.iter().enumerate() {
            if let Some(e) = m.evaluate(sensor(), *v, i as u64 * MINUTE) {
                events.push(e);
            }
            match i {
                0..=2 => assert_eq!(m.state(), AlertState::Normal),
                3 => assert!(matches!(
                    m.state(),
                    AlertState::Pending {
                        kind: AlertKind::High,
                        ..
                    }
                )),
                _ => assert!(matches!(
                    m.state(),
                    AlertState::Active {
                        kind: AlertKind::High,
                        ..
                    }
                )),
            }
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertKind::High);
        assert_eq!(events[0].timestamp, 4 * MINUTE);
        assert!(!events[0].is_renotify);
    }

    #[test]
    fn short_crossing_never_alerts() {
        let mut m = machine();
        assert!(m.evaluate(sensor(), 100.0, 0).is_none());
        // One outlier sample, back in range on the next
        assert!(m.evaluate(sensor(), 200.0, MINUTE).is_none());
        assert!(m.evaluate(sensor(), 101.0, 2 * MINUTE).is_none());
        assert_eq!(m.state(), AlertState::Normal);
    }

    #[test]
    fn hysteresis_holds_at_boundary() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        let event = m.evaluate(sensor(), 150.0, 2 * MINUTE);
        assert!(event.is_some());

        // Dips just under the threshold but not past the margin
        assert!(m.evaluate(sensor(), 139.0, 3 * MINUTE).is_none());
        assert!(matches!(m.state(), AlertState::Active { .. }));

        assert!(m.evaluate(sensor(), 131.0, 4 * MINUTE).is_none());
        assert!(matches!(m.state(), AlertState::Active { .. }));

        // Past high - margin: released
        assert!(m.evaluate(sensor(), 130.0, 5 * MINUTE).is_none());
        assert_eq!(m.state(), AlertState::Normal);
    }

    #[test]
    fn low_side_hysteresis() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 65.0, MINUTE);
        assert!(m.evaluate(sensor(), 64.0, 2 * MINUTE).is_some());

        // Must reach low + margin before release
        assert!(m.evaluate(sensor(), 75.0, 3 * MINUTE).is_none());
        assert!(matches!(m.state(), AlertState::Active { .. }));
        m.evaluate(sensor(), 80.0, 4 * MINUTE);
        assert_eq!(m.state(), AlertState::Normal);
    }

    #[test]
    fn urgent_preempts_active_plain() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        assert!(m.evaluate(sensor(), 151.0, 2 * MINUTE).is_some());

        // Urgent crossing emits immediately, no second debounce
        let event = m.evaluate(sensor(), 260.0, 3 * MINUTE).unwrap();
        assert_eq!(event.kind, AlertKind::UrgentHigh);
        assert!(!event.is_renotify);
        assert!(matches!(
            m.state(),
            AlertState::Active {
                kind: AlertKind::UrgentHigh,
                ..
            }
        ));
    }

    #[test]
    fn urgent_preempts_pending_without_new_anchor() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        // Escalates while pending; the debounce anchor survives, and the
        // elapsed time already satisfies it, so this sample promotes
        assert!(m.evaluate(sensor(), 255.0, 2 * MINUTE).is_some());
        assert!(matches!(
            m.state(),
            AlertState::Active {
                kind: AlertKind::UrgentHigh,
                ..
            }
        ));
    }

    #[test]
    fn demotion_from_urgent_is_silent() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 260.0, MINUTE);
        assert!(m.evaluate(sensor(), 260.0, 2 * MINUTE).is_some());

        // Falls below urgent - margin, still above high: stays Active(High)
        assert!(m.evaluate(sensor(), 200.0, 3 * MINUTE).is_none());
        assert!(matches!(
            m.state(),
            AlertState::Active {
                kind: AlertKind::High,
                ..
            }
        ));
    }

    #[test]
    fn renotify_after_interval() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        assert!(m.evaluate(sensor(), 151.0, 2 * MINUTE).is_some());

        // Still high within the interval: quiet
        assert!(m.evaluate(sensor(), 155.0, 10 * MINUTE).is_none());

        // Past the re-notify interval: exactly one more event
        let event = m.evaluate(sensor(), 156.0, 33 * MINUTE).unwrap();
        assert!(event.is_renotify);
        assert_eq!(event.kind, AlertKind::High);
        assert!(m.evaluate(sensor(), 157.0, 34 * MINUTE).is_none());
    }

    #[test]
    fn renotify_on_tick_when_sensor_quiet() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        assert!(m.evaluate(sensor(), 151.0, 2 * MINUTE).is_some());

        assert!(m.tick(sensor(), Some(151.0), 10 * MINUTE).is_none());
        let event = m.tick(sensor(), Some(151.0), 40 * MINUTE).unwrap();
        assert!(event.is_renotify);
    }

    #[test]
    fn snooze_suppresses_and_expires() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        assert!(m.evaluate(sensor(), 151.0, 2 * MINUTE).is_some());

        assert!(m.snooze(60 * MINUTE));
        // Nothing during the snooze, even past the re-notify interval
        assert!(m.evaluate(sensor(), 180.0, 40 * MINUTE).is_none());
        assert!(m.tick(sensor(), Some(180.0), 50 * MINUTE).is_none());

        // Expiry with the value still high: straight back to Active,
        // one event
        let event = m.evaluate(sensor(), 181.0, 61 * MINUTE).unwrap();
        assert_eq!(event.kind, AlertKind::High);
        assert!(matches!(m.state(), AlertState::Active { .. }));
    }

    #[test]
    fn snooze_expiry_with_normal_value() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        m.evaluate(sensor(), 151.0, 2 * MINUTE);
        m.snooze(10 * MINUTE);

        assert!(m.tick(sensor(), Some(100.0), 11 * MINUTE).is_none());
        assert_eq!(m.state(), AlertState::Normal);
    }

    #[test]
    fn urgent_breaks_through_snooze() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        m.evaluate(sensor(), 151.0, 2 * MINUTE);
        m.snooze(60 * MINUTE);

        // Plain high stays suppressed, urgent does not
        assert!(m.evaluate(sensor(), 200.0, 3 * MINUTE).is_none());
        let event = m.evaluate(sensor(), 255.0, 5 * MINUTE).unwrap();
        assert_eq!(event.kind, AlertKind::UrgentHigh);
    }

    #[test]
    fn clear_snooze_reinstates_standing_alert() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        m.evaluate(sensor(), 151.0, 2 * MINUTE);
        m.snooze(60 * MINUTE);

        // Value still high: clearing works like an expiry, one event
        let event = m.clear_snooze(sensor(), Some(152.0), 5 * MINUTE).unwrap();
        assert_eq!(event.kind, AlertKind::High);
        assert!(!event.is_renotify);
        assert!(matches!(m.state(), AlertState::Active { .. }));
    }

    #[test]
    fn clear_snooze_with_recovered_value() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        m.evaluate(sensor(), 151.0, 2 * MINUTE);
        m.snooze(60 * MINUTE);

        assert!(m.clear_snooze(sensor(), Some(100.0), 5 * MINUTE).is_none());
        assert_eq!(m.state(), AlertState::Normal);
        // Not snoozed any more: clearing again is a no-op
        assert!(m.clear_snooze(sensor(), Some(100.0), 6 * MINUTE).is_none());
        assert_eq!(m.state(), AlertState::Normal);
    }

    #[test]
    fn snooze_from_normal_refused() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        assert!(!m.snooze(60 * MINUTE));
        assert_eq!(m.state(), AlertState::Normal);
    }

    #[test]
    fn sparse_samples_still_debounce() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        // An hour of silence, then a crossing: the stale sample cannot
        // witness persistence, so this is Pending, not Active
        assert!(m.evaluate(sensor(), 150.0, 60 * MINUTE).is_none());
        assert!(matches!(m.state(), AlertState::Pending { .. }));

        assert!(m.evaluate(sensor(), 151.0, 62 * MINUTE).is_some());
    }

    #[test]
    fn swing_from_high_to_low_restarts_debounce() {
        let mut m = machine();
        m.evaluate(sensor(), 100.0, 0);
        m.evaluate(sensor(), 150.0, MINUTE);
        assert!(m.evaluate(sensor(), 151.0, 2 * MINUTE).is_some());

        // Crashes to the low side: old alert releases, new side debounces
        assert!(m.evaluate(sensor(), 60.0, 3 * MINUTE).is_none());
        assert!(matches!(
            m.state(),
            AlertState::Pending {
                kind: AlertKind::Low,
                ..
            }
        ));
        let event = m.evaluate(sensor(), 60.0, 5 * MINUTE).unwrap();
        assert_eq!(event.kind, AlertKind::Low);
    }
}
