//! Sensor link management and notification delivery
//!
//! ## Overview
//!
//! This crate wraps the synchronous pipeline from `pluslife-core` in the
//! async plumbing a long-running monitor needs:
//!
//! ```text
//!  GattTransport ──► SensorSession ──► Dispatcher ──► NotificationChannel
//!  (BLE bridge)      (owns pipeline)   (fan-out,       (Mailgun, webhook)
//!                                       retries)
//! ```
//!
//! - [`session`] owns one link to one sensor: connect, subscribe,
//!   reconnect with bounded backoff, and drive the decode pipeline in
//!   strict arrival order.
//! - [`dispatch`] fans alert events out to delivery channels with
//!   per-channel retries and a bounded, coalescing job queue.
//! - [`channels`] provides the concrete delivery backends.
//!
//! Multiple sensors mean multiple sessions; they share nothing mutable, so
//! running them in parallel needs no coordination beyond spawning.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod channels;
pub mod dispatch;
pub mod session;

pub use channels::{MailgunChannel, MailgunRegion, WebhookChannel};
pub use dispatch::{
    DeliveryError, DeliveryFailure, Dispatcher, DispatcherHandle, NotificationChannel,
    NotificationPayload, RetryPolicy, SubmitOutcome,
};
pub use session::{
    GattTransport, LinkState, SensorSession, SessionCommand, SessionConfig, SessionHandle,
    TcpBridgeTransport,
};

use thiserror::Error;

/// Link-level failures
///
/// Connectivity problems are never fatal to the session: every variant
/// feeds the reconnect loop except an explicit disconnect.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The device was not found during discovery
    #[error("device not found: {address}")]
    NotFound {
        /// Address that failed discovery
        address: String,
    },

    /// Connect or subscribe did not complete in time
    #[error("link operation timed out")]
    Timeout,

    /// The device refused our bond
    #[error("authentication rejected by device")]
    AuthenticationRejected,

    /// An established link dropped
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}
