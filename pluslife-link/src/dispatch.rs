//! Alert fan-out with per-channel retries
//!
//! ## Overview
//!
//! The dispatcher sits between the sensor sessions and the delivery
//! channels. Sessions hand it alert events through a bounded queue and
//! never wait on delivery; the dispatcher fans each event out to every
//! channel concurrently, retrying transient failures per channel:
//!
//! ```text
//!  session ─try_send─► queue ─► worker ─┬─► channel A (retries)
//!                        │              └─► channel B (retries)
//!                   coalescing
//! ```
//!
//! ## Backpressure and coalescing
//!
//! The queue is bounded and submissions for a `(sensor, kind)` pair that is
//! already queued or in flight are coalesced away: during an incident the
//! alert machine re-notifies on its own schedule, so queueing the same
//! alert twice adds noise, not information. A submission that still finds
//! the queue full is dropped and counted, never allowed to grow the queue.
//!
//! ## Failure policy
//!
//! [`DeliveryError::ChannelUnavailable`] is transient and retried with
//! exponential backoff up to the channel's retry budget;
//! [`DeliveryError::Rejected`] is terminal for the attempt. A job that
//! fails on every channel is reported through the failure stream so an
//! operator surface can escalate it. Delivery failure never feeds back
//! into alert state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use pluslife_core::{AlertEvent, TrendSnapshot};

/// Delivery failures a channel can report
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Transient: the channel could not be reached; worth retrying
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Terminal: the channel understood the request and refused it
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Whether another attempt can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::ChannelUnavailable(_))
    }
}

/// One delivery backend
///
/// Implementations must be safe to call concurrently; the dispatcher
/// shares each channel across in-flight jobs.
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Stable name for logs and failure reports
    fn name(&self) -> &str;

    /// Deliver one payload
    async fn send(&self, payload: &NotificationPayload) -> Result<(), DeliveryError>;
}

/// What a channel delivers
///
/// Self-contained: everything a human-facing message needs, so channels
/// never reach back into pipeline state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NotificationPayload {
    /// Sensor the alert belongs to
    pub sensor_id: String,
    /// Alert kind label, e.g. `urgent_low`
    pub kind: String,
    /// Value that drove the transition
    pub value: f32,
    /// Transition timestamp (ms)
    pub timestamp: u64,
    /// Re-notification of a standing alert
    pub is_renotify: bool,
    /// Rate of change at emission time, if known (units/minute)
    pub rate_of_change_per_minute: Option<f32>,
    /// Pre-rendered one-line summary
    pub summary: String,
}

impl NotificationPayload {
    /// Build a payload from an alert event and the trend at emission time
    pub fn from_event(event: &AlertEvent, trend: Option<TrendSnapshot>) -> Self {
        let kind = event.kind.label().to_string();
        let summary = if event.is_renotify {
            format!(
                "{}: still {} at {:.1}",
                event.sensor_id, kind, event.value
            )
        } else {
            format!("{}: {} alert at {:.1}", event.sensor_id, kind, event.value)
        };
        Self {
            sensor_id: event.sensor_id.as_str().to_string(),
            kind,
            value: event.value,
            timestamp: event.timestamp,
            is_renotify: event.is_renotify,
            rate_of_change_per_minute: trend.map(|t| t.rate_of_change_per_minute),
            summary,
        }
    }

    /// Key used for queue coalescing
    fn coalesce_key(&self) -> (String, String) {
        (self.sensor_id.clone(), self.kind.clone())
    }
}

/// Retry budget and backoff for one delivery attempt sequence
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per channel, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt
    pub base_delay: Duration,
    /// Ceiling on the backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based)
    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift.min(31));
        delay.min(self.max_delay)
    }
}

/// A job that exhausted every channel
///
/// Reported through the failure stream; consumers typically log it and
/// push it to a fallback surface.
#[derive(Debug)]
pub struct DeliveryFailure {
    /// The payload that could not be delivered
    pub payload: NotificationPayload,
    /// Terminal error per channel, by channel name
    pub channel_errors: Vec<(String, DeliveryError)>,
}

/// What happened to a submitted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted into the queue
    Queued,
    /// Identical alert already queued or in flight
    Coalesced,
    /// Queue full; the event was discarded
    Dropped,
}

/// Session-side handle for submitting events
#[derive(Clone)]
pub struct DispatcherHandle {
    queue: mpsc::Sender<NotificationPayload>,
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
}

impl DispatcherHandle {
    /// Submit one payload without blocking
    pub fn submit(&self, payload: NotificationPayload) -> SubmitOutcome {
        let key = payload.coalesce_key();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(key.clone()) {
                debug!(sensor = %payload.sensor_id, kind = %payload.kind, "coalesced duplicate alert");
                return SubmitOutcome::Coalesced;
            }
        }

        match self.queue.try_send(payload) {
            Ok(()) => SubmitOutcome::Queued,
            Err(err) => {
                // Undo the reservation so a later submission is not
                // coalesced against a job that never existed
                self.in_flight.lock().unwrap().remove(&key);
                match err {
                    mpsc::error::TrySendError::Full(p) => {
                        warn!(sensor = %p.sensor_id, kind = %p.kind, "dispatch queue full, dropping alert");
                        SubmitOutcome::Dropped
                    }
                    mpsc::error::TrySendError::Closed(p) => {
                        error!(sensor = %p.sensor_id, kind = %p.kind, "dispatcher gone, dropping alert");
                        SubmitOutcome::Dropped
                    }
                }
            }
        }
    }
}

/// Fan-out worker owning the delivery channels
pub struct Dispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    retry: RetryPolicy,
    queue: mpsc::Receiver<NotificationPayload>,
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
    failures: mpsc::Sender<DeliveryFailure>,
}

impl Dispatcher {
    /// Default queue depth; an incident produces a handful of events, not
    /// hundreds
    pub const DEFAULT_QUEUE_DEPTH: usize = 32;

    /// Build a dispatcher and its handles
    ///
    /// Returns the dispatcher itself (run it with [`Dispatcher::run`]),
    /// the submission handle for sessions, and the failure stream.
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        retry: RetryPolicy,
    ) -> (Self, DispatcherHandle, mpsc::Receiver<DeliveryFailure>) {
        let (queue_tx, queue_rx) = mpsc::channel(Self::DEFAULT_QUEUE_DEPTH);
        let (failure_tx, failure_rx) = mpsc::channel(16);
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let handle = DispatcherHandle {
            queue: queue_tx,
            in_flight: in_flight.clone(),
        };
        let dispatcher = Self {
            channels,
            retry,
            queue: queue_rx,
            in_flight,
            failures: failure_tx,
        };
        (dispatcher, handle, failure_rx)
    }

    /// Drain the queue until every handle is dropped
    ///
    /// One event is fanned out at a time; within an event, channels run
    /// concurrently. Alert volume is human-scale, so sequencing events
    /// keeps delivery ordering sane without costing anything.
    pub async fn run(mut self) {
        while let Some(payload) = self.queue.recv().await {
            self.deliver(payload).await;
        }
        debug!("dispatch queue closed, worker exiting");
    }

    async fn deliver(&mut self, payload: NotificationPayload) {
        let key = payload.coalesce_key();
        let payload = Arc::new(payload);

        let mut set: JoinSet<(String, Result<(), DeliveryError>)> = JoinSet::new();
        for channel in &self.channels {
            let channel = channel.clone();
            let payload = payload.clone();
            let retry = self.retry;
            set.spawn(async move {
                let name = channel.name().to_string();
                let result = send_with_retry(channel.as_ref(), &payload, &retry).await;
                (name, result)
            });
        }

        let mut delivered = 0usize;
        let mut channel_errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((name, Err(err))) => {
                    warn!(channel = %name, %err, "channel failed after retries");
                    channel_errors.push((name, err));
                }
                Err(err) => error!(%err, "delivery task panicked"),
            }
        }

        // The alert may be re-notified from now on
        self.in_flight.lock().unwrap().remove(&key);

        if delivered == 0 && !self.channels.is_empty() {
            error!(
                sensor = %payload.sensor_id,
                kind = %payload.kind,
                "alert exhausted every delivery channel"
            );
            let failure = DeliveryFailure {
                payload: (*payload).clone(),
                channel_errors,
            };
            if self.failures.try_send(failure).is_err() {
                error!("failure stream full, delivery failure only logged");
            }
        } else if !channel_errors.is_empty() {
            // Partial failure: the alert counts as delivered
            info!(
                sensor = %payload.sensor_id,
                kind = %payload.kind,
                delivered,
                failed = channel_errors.len(),
                "alert delivered on a subset of channels"
            );
        }
    }
}

/// One channel's attempt sequence with exponential backoff
async fn send_with_retry(
    channel: &dyn NotificationChannel,
    payload: &NotificationPayload,
    retry: &RetryPolicy,
) -> Result<(), DeliveryError> {
    let mut last_error = None;
    for attempt in 0..retry.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(retry.delay_for(attempt)).await;
        }

        match channel.send(payload).await {
            Ok(()) => {
                if attempt > 0 {
                    debug!(channel = channel.name(), attempt, "delivered after retry");
                }
                return Ok(());
            }
            Err(err) if err.is_retryable() => {
                debug!(channel = channel.name(), attempt, %err, "transient delivery failure");
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error
        .unwrap_or_else(|| DeliveryError::ChannelUnavailable("no attempts made".to_string())))
}
