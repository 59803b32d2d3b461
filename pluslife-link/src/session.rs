//! Sensor link session management
//!
//! ## Overview
//!
//! A [`SensorSession`] owns one link to one sensor and everything behind
//! it: the transport, the decode pipeline, and the alerting state. The run
//! loop is a single `select` over three inputs, so per-sensor processing
//! is strictly ordered with no shared mutable state:
//!
//! ```text
//!            ┌ fragment stream ──► pipeline.handle_fragment
//!  select! ──┼ tick interval ────► pipeline.tick (snooze expiry, renotify)
//!            └ commands ─────────► snooze / clear / disconnect
//! ```
//!
//! ## Reconnection
//!
//! Link loss is routine for a body-worn BLE sensor. The session retries
//! with exponential backoff (1s doubling to a 60s cap) until an explicit
//! disconnect, publishing every state change on a watch channel so status
//! surfaces can observe it. After a reconnect the pipeline is told about
//! the link gap before any new fragment: readings lost while disconnected
//! are reported as a gap, never papered over.
//!
//! ## Cancellation
//!
//! There are no detached timers. Debounce rides on sample timestamps,
//! snooze and re-notify expiries are checked on ticks, and backoff sleeps
//! live inside the select loop. Dropping the session therefore cancels
//! every pending expiry atomically; nothing can fire after teardown.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use pluslife_core::{
    pipeline::{PipelineConfig, SensorPipeline},
    time::{SystemTime, TimeSource},
    RawFrame, SensorId, StatusSnapshot,
};

use crate::dispatch::{DispatcherHandle, NotificationPayload};
use crate::LinkError;

/// Observable connection state, published on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No link and none being attempted
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Link up, fragments flowing
    Connected,
    /// Link lost, backoff and retry in progress
    Reconnecting,
}

/// Transport to one sensor's GATT notification characteristic
///
/// The session drives this through connect, subscribe, and disconnect.
/// `subscribe` hands back the notification stream; the stream closing is
/// how the transport signals link loss.
#[async_trait::async_trait]
pub trait GattTransport: Send {
    /// Establish the link
    async fn connect(&mut self, address: &str) -> Result<(), LinkError>;

    /// Subscribe to the vendor characteristic and stream its notifications
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, LinkError>;

    /// Tear the link down
    async fn disconnect(&mut self);
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transport address of the sensor (or its bridge)
    pub address: String,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Reconnect delay ceiling
    pub backoff_cap: Duration,
    /// Interval between pipeline ticks while connected
    pub tick_interval: Duration,
    /// Tear the session down after this long without an accepted reading
    pub idle_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Defaults for the given address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            tick_interval: Duration::from_secs(15),
            idle_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

/// Commands a session accepts while running
#[derive(Debug, Clone, Copy)]
pub enum SessionCommand {
    /// Suppress the current alert for a duration
    Snooze(Duration),
    /// End a snooze early
    ClearSnooze,
    /// Tear the session down; the only way it stops retrying
    Disconnect,
}

/// Caller-side handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<LinkState>,
    status: watch::Receiver<StatusSnapshot>,
}

impl SessionHandle {
    /// Send a command; `false` if the session is gone
    pub async fn command(&self, command: SessionCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Current link state
    pub fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch link state transitions
    pub fn link_state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Latest pipeline snapshot, for the status surface
    pub fn status(&self) -> StatusSnapshot {
        *self.status.borrow()
    }

    /// Watch status updates
    pub fn status_watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }
}

enum LoopExit {
    LinkLost,
    Teardown,
    Idle,
}

/// One sensor's link, pipeline and alerting, driven by [`SensorSession::run`]
pub struct SensorSession<T: GattTransport> {
    transport: T,
    pipeline: SensorPipeline,
    config: SessionConfig,
    clock: Box<dyn TimeSource + Send + Sync>,
    dispatcher: DispatcherHandle,
    commands: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<LinkState>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl<T: GattTransport> SensorSession<T> {
    /// Build a session and its handle
    pub fn new(
        sensor_id: SensorId,
        transport: T,
        pipeline_config: PipelineConfig,
        config: SessionConfig,
        dispatcher: DispatcherHandle,
    ) -> (Self, SessionHandle) {
        let pipeline = SensorPipeline::new(sensor_id, pipeline_config);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let (status_tx, status_rx) = watch::channel(pipeline.snapshot());

        let session = Self {
            transport,
            pipeline,
            config,
            clock: Box::new(SystemTime),
            dispatcher,
            commands: command_rx,
            state_tx,
            status_tx,
        };
        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
            status: status_rx,
        };
        (session, handle)
    }

    /// Replace the wall clock, for tests
    pub fn with_clock(mut self, clock: impl TimeSource + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Run until explicit disconnect or idle timeout
    ///
    /// Connectivity failures never end the loop; they feed the backoff.
    pub async fn run(mut self) {
        let sensor = self.pipeline.sensor_id();
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            self.state_tx.send_replace(if ever_connected {
                LinkState::Reconnecting
            } else {
                LinkState::Connecting
            });

            let stream = match self.establish().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%sensor, %err, attempt, "link attempt failed");
                    if !self.backoff(attempt).await {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            info!(%sensor, address = %self.config.address, "link established");
            attempt = 0;
            if ever_connected {
                // Anything the sensor sampled while we were away is a gap
                self.pipeline.mark_link_gap();
            }
            ever_connected = true;
            self.state_tx.send_replace(LinkState::Connected);

            match self.pump(stream).await {
                LoopExit::LinkLost => {
                    warn!(%sensor, "link lost, reconnecting");
                }
                LoopExit::Idle => {
                    info!(%sensor, "idle timeout, tearing session down");
                    break;
                }
                LoopExit::Teardown => break,
            }
        }

        self.transport.disconnect().await;
        self.state_tx.send_replace(LinkState::Disconnected);
        info!(%sensor, "session ended");
    }

    async fn establish(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        self.transport.connect(&self.config.address).await?;
        self.transport.subscribe().await
    }

    /// Process one connected stretch; returns why it ended
    async fn pump(&mut self, mut stream: mpsc::Receiver<Vec<u8>>) -> LoopExit {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_data = tokio::time::Instant::now();

        loop {
            tokio::select! {
                fragment = stream.recv() => match fragment {
                    Some(bytes) => {
                        if self.handle_fragment(&bytes) {
                            last_data = tokio::time::Instant::now();
                        }
                    }
                    None => return LoopExit::LinkLost,
                },

                _ = ticker.tick() => {
                    let now = self.clock.now();
                    if let Some(event) = self.pipeline.tick(now) {
                        self.forward(event);
                    }
                    self.publish_status();

                    if let Some(idle) = self.config.idle_timeout {
                        if last_data.elapsed() >= idle {
                            return LoopExit::Idle;
                        }
                    }
                }

                command = self.commands.recv() => match command {
                    Some(SessionCommand::Snooze(duration)) => {
                        let until = self.clock.now() + duration.as_millis() as u64;
                        if self.pipeline.snooze(until) {
                            info!(sensor = %self.pipeline.sensor_id(), ?duration, "alert snoozed");
                        } else {
                            debug!(sensor = %self.pipeline.sensor_id(), "nothing to snooze");
                        }
                        self.publish_status();
                    }
                    Some(SessionCommand::ClearSnooze) => {
                        if let Some(event) = self.pipeline.clear_snooze(self.clock.now()) {
                            self.forward(event);
                        }
                        self.publish_status();
                    }
                    Some(SessionCommand::Disconnect) | None => return LoopExit::Teardown,
                },
            }
        }
    }

    /// Returns whether the fragment produced at least one accepted reading
    fn handle_fragment(&mut self, bytes: &[u8]) -> bool {
        let arrived_at = self.clock.now();
        let output = self.pipeline.handle_fragment(RawFrame::new(bytes, arrived_at));

        for reject in output.rejects() {
            warn!(sensor = %self.pipeline.sensor_id(), error = %reject, "frame rejected");
        }
        for event in output.events() {
            self.forward(*event);
        }
        self.publish_status();
        output.accepted() > 0
    }

    fn forward(&self, event: pluslife_core::AlertEvent) {
        let trend = self.pipeline.snapshot().trend;
        let payload = NotificationPayload::from_event(&event, trend);
        // Outcome logging happens inside the dispatcher; nothing here may
        // block the decode path
        let _ = self.dispatcher.submit(payload);
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.pipeline.snapshot());
    }

    /// Sleep out the backoff; returns `false` if disconnect was requested
    async fn backoff(&mut self, attempt: u32) -> bool {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self
            .config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_cap);
        debug!(?delay, attempt, "reconnect backoff");

        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Disconnect) | None => {
                        info!("disconnect requested during backoff");
                        return false;
                    }
                    Some(SessionCommand::Snooze(duration)) => {
                        let until = self.clock.now() + duration.as_millis() as u64;
                        self.pipeline.snooze(until);
                        self.publish_status();
                    }
                    Some(SessionCommand::ClearSnooze) => {
                        if let Some(event) = self.pipeline.clear_snooze(self.clock.now()) {
                            self.forward(event);
                        }
                        self.publish_status();
                    }
                },
            }
        }
    }
}

/// Transport that speaks to a BLE bridge over TCP
///
/// Running the BLE radio in-process is a deployment liability on headless
/// hosts, so the radio side lives in a small bridge daemon that relays the
/// sensor's GATT notifications verbatim over a local socket. Each TCP read
/// is one transport delivery; the decoder handles fragmentation either way.
pub struct TcpBridgeTransport {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
}

impl TcpBridgeTransport {
    /// Read buffer size; one read never exceeds what the decoder's
    /// reassembly buffer absorbs in a single delivery
    const READ_BUF: usize = pluslife_core::frame::MAX_DELIVERY_LEN;

    /// Bridge transport with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            stream: None,
            connect_timeout,
        }
    }
}

impl Default for TcpBridgeTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait::async_trait]
impl GattTransport for TcpBridgeTransport {
    async fn connect(&mut self, address: &str) -> Result<(), LinkError> {
        let connect = TcpStream::connect(address);
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
                    LinkError::NotFound {
                        address: address.to_string(),
                    }
                }
                _ => LinkError::ConnectionLost(err.to_string()),
            })?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| LinkError::ConnectionLost("subscribe before connect".to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut buf = [0u8; TcpBridgeTransport::READ_BUF];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            // Session dropped the stream; stop reading
                            break;
                        }
                    }
                    Err(err) => {
                        error!(%err, "bridge socket read failed");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn disconnect(&mut self) {
        // If subscribed, the reader task ends when the session drops the
        // receiver and its send fails
        self.stream = None;
    }
}
