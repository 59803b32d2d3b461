//! Concrete notification channels
//!
//! Two delivery backends ship with the service:
//!
//! - [`WebhookChannel`] posts the payload as JSON to an arbitrary URL, for
//!   push services and home-automation hooks.
//! - [`MailgunChannel`] sends a plain-text plus HTML email through the
//!   Mailgun API.
//!
//! Error mapping is uniform: HTTP 4xx means the request itself is wrong
//! and retrying is pointless ([`DeliveryError::Rejected`]); 5xx and
//! transport failures are transient
//! ([`DeliveryError::ChannelUnavailable`]). The dispatcher owns retry
//! scheduling; channels only classify.

use std::time::Duration;

use email_address::EmailAddress;
use reqwest::multipart::Form;
use tracing::debug;

use crate::dispatch::{DeliveryError, NotificationChannel, NotificationPayload};

fn classify(err: reqwest::Error) -> DeliveryError {
    match err.status() {
        Some(status) if status.is_client_error() => DeliveryError::Rejected(err.to_string()),
        _ => DeliveryError::ChannelUnavailable(err.to_string()),
    }
}

/// Generic JSON webhook delivery
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Channel posting to `url`
    pub fn new(url: impl Into<String>) -> Result<Self, DeliveryError> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(DeliveryError::Rejected(format!(
                "webhook URL must be http(s): {url}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| DeliveryError::ChannelUnavailable(err.to_string()))?;
        Ok(Self { url, client })
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(classify)?;
        response.error_for_status().map_err(classify)?;
        debug!(url = %self.url, kind = %payload.kind, "webhook delivered");
        Ok(())
    }
}

/// Mailgun API region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailgunRegion {
    /// api.eu.mailgun.net
    Eu,
    /// api.mailgun.net
    Us,
}

impl MailgunRegion {
    fn base_url(&self) -> &'static str {
        match self {
            Self::Eu => "https://api.eu.mailgun.net/v3",
            Self::Us => "https://api.mailgun.net/v3",
        }
    }

    /// Parse from configuration text
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "eu" => Some(Self::Eu),
            "us" => Some(Self::Us),
            _ => None,
        }
    }
}

/// Email delivery through Mailgun
pub struct MailgunChannel {
    region: MailgunRegion,
    domain: String,
    api_key: String,
    sender: EmailAddress,
    recipient: EmailAddress,
    client: reqwest::Client,
}

/// Display name on outgoing mail
const SENDER_NAME: &str = "PlusLife Monitor";

impl MailgunChannel {
    /// Channel sending from `sender` to `recipient` via `domain`
    pub fn new(
        region: MailgunRegion,
        domain: impl Into<String>,
        api_key: impl Into<String>,
        sender: EmailAddress,
        recipient: EmailAddress,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| DeliveryError::ChannelUnavailable(err.to_string()))?;
        Ok(Self {
            region,
            domain: domain.into(),
            api_key: api_key.into(),
            sender,
            recipient,
            client,
        })
    }

    fn subject(payload: &NotificationPayload) -> String {
        if payload.is_renotify {
            format!("Reminder: sensor {} still {}", payload.sensor_id, payload.kind)
        } else {
            format!("Sensor {} alert: {}", payload.sensor_id, payload.kind)
        }
    }

    fn text_body(payload: &NotificationPayload) -> String {
        let mut body = format!(
            "{}\n\nSensor: {}\nReading: {:.1}\n",
            payload.summary, payload.sensor_id, payload.value
        );
        if let Some(rate) = payload.rate_of_change_per_minute {
            body.push_str(&format!("Rate of change: {:+.2}/min\n", rate));
        }
        body
    }

    /// Best-effort escalation mail after an alert exhausted every channel
    ///
    /// A fresh attempt with a distinct subject, so the operator learns
    /// that notifications themselves are failing.
    pub async fn send_error(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        let form = Form::new()
            .text("from", format!("{} <{}>", SENDER_NAME, self.sender))
            .text("to", self.recipient.to_string())
            .text(
                "subject",
                format!("Delivery failure for sensor {}", payload.sensor_id),
            )
            .text(
                "text",
                format!(
                    "An alert could not be delivered on any channel.\n\n{}",
                    Self::text_body(payload)
                ),
            );

        let url = format!("{}/{}/messages", self.region.base_url(), self.domain);
        let response = self
            .client
            .post(url)
            .basic_auth("api", Some(&self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(classify)?;
        response.error_for_status().map_err(classify)?;
        Ok(())
    }

    fn html_body(payload: &NotificationPayload) -> String {
        let rate = payload
            .rate_of_change_per_minute
            .map(|r| format!("<li>Rate of change: {:+.2}/min</li>", r))
            .unwrap_or_default();
        format!(
            "<h2>{}</h2>\n<ul>\n<li>Sensor: {}</li>\n<li>Reading: {:.1}</li>\n{}</ul>\n",
            payload.summary, payload.sensor_id, payload.value, rate
        )
    }
}

#[async_trait::async_trait]
impl NotificationChannel for MailgunChannel {
    fn name(&self) -> &str {
        "mailgun"
    }

    async fn send(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        let form = Form::new()
            .text("from", format!("{} <{}>", SENDER_NAME, self.sender))
            .text("to", self.recipient.to_string())
            .text("subject", Self::subject(payload))
            .text("text", Self::text_body(payload))
            .text("html", Self::html_body(payload));

        let url = format!("{}/{}/messages", self.region.base_url(), self.domain);
        let response = self
            .client
            .post(url)
            .basic_auth("api", Some(&self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(classify)?;
        response.error_for_status().map_err(classify)?;
        debug!(recipient = %self.recipient, kind = %payload.kind, "mail delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(is_renotify: bool) -> NotificationPayload {
        NotificationPayload {
            sensor_id: "pluslife_01".to_string(),
            kind: "urgent_low".to_string(),
            value: 52.0,
            timestamp: 60_000,
            is_renotify,
            rate_of_change_per_minute: Some(-2.5),
            summary: "pluslife_01: urgent_low alert at 52.0".to_string(),
        }
    }

    #[test]
    fn webhook_rejects_non_http_url() {
        assert!(WebhookChannel::new("ftp://nope").is_err());
        assert!(WebhookChannel::new("https://example.com/hook").is_ok());
    }

    #[test]
    fn region_parsing() {
        assert_eq!(MailgunRegion::parse("eu"), Some(MailgunRegion::Eu));
        assert_eq!(MailgunRegion::parse("US"), Some(MailgunRegion::Us));
        assert_eq!(MailgunRegion::parse("mars"), None);
    }

    #[test]
    fn mail_bodies_carry_the_reading() {
        let p = payload(false);
        let text = MailgunChannel::text_body(&p);
        assert!(text.contains("52.0"));
        assert!(text.contains("-2.50/min"));

        let html = MailgunChannel::html_body(&p);
        assert!(html.contains("<li>Reading: 52.0</li>"));
    }

    #[test]
    fn renotify_subject_differs() {
        assert!(MailgunChannel::subject(&payload(true)).starts_with("Reminder"));
        assert!(MailgunChannel::subject(&payload(false)).starts_with("Sensor"));
    }
}
