//! Environment-based service configuration
//!
//! Everything is loaded once at startup into an immutable [`Config`];
//! changing thresholds or credentials means restarting the service, which
//! restarts the affected session with the new snapshot.

use std::str::FromStr;
use std::time::Duration;

use email_address::EmailAddress;
use thiserror::Error;

use pluslife_core::{SensorId, ThresholdConfig};
use pluslife_link::MailgunRegion;

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable is missing or unparseable
    #[error("invalid environment variable {name}: {cause}")]
    InvalidEnvVar {
        /// Variable name
        name: String,
        /// Underlying parse or lookup failure
        cause: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Threshold values cannot alert coherently
    #[error("invalid thresholds: {0}")]
    Thresholds(pluslife_core::ConfigError),

    /// Neither webhook nor Mailgun is configured
    #[error("no notification channel configured, set WEBHOOK_URL and/or the MAILGUN_* variables")]
    NoChannels,
}

/// Mailgun credentials and addressing
#[derive(Debug, Clone)]
pub struct MailgunConfig {
    /// API region
    pub region: MailgunRegion,
    /// Sending domain
    pub domain: String,
    /// API key
    pub api_key: String,
    /// From address
    pub sender: EmailAddress,
    /// To address
    pub recipient: EmailAddress,
}

/// Immutable service configuration snapshot
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the BLE bridge socket
    pub bridge_addr: String,
    /// Identity of the monitored sensor
    pub sensor_id: SensorId,
    /// Alerting thresholds and timing
    pub thresholds: ThresholdConfig,
    /// Session tick interval
    pub tick_interval: Duration,
    /// Idle teardown, `None` to run forever
    pub idle_timeout: Option<Duration>,
    /// Webhook delivery target, if configured
    pub webhook_url: Option<String>,
    /// Mailgun delivery, if configured
    pub mailgun: Option<MailgunConfig>,
}

impl Config {
    /// Load from the process environment
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let bridge_addr = required("BRIDGE_ADDR")?;

        let sensor_id = optional("SENSOR_ID")?.unwrap_or_else(|| "pluslife_01".to_string());
        let sensor_id = SensorId::new(&sensor_id).ok_or_else(|| ConfigError::InvalidEnvVar {
            name: "SENSOR_ID".to_string(),
            cause: format!("sensor id too long: {sensor_id}").into(),
        })?;

        let defaults = ThresholdConfig::default();
        let thresholds = ThresholdConfig {
            urgent_low: parse_or("URGENT_LOW", defaults.urgent_low)?,
            low: parse_or("LOW_THRESHOLD", defaults.low)?,
            high: parse_or("HIGH_THRESHOLD", defaults.high)?,
            urgent_high: parse_or("URGENT_HIGH", defaults.urgent_high)?,
            hysteresis_margin: parse_or("HYSTERESIS_MARGIN", defaults.hysteresis_margin)?,
            debounce_ms: duration_or("DEBOUNCE", defaults.debounce_ms)?,
            renotify_interval_ms: duration_or("RENOTIFY_INTERVAL", defaults.renotify_interval_ms)?,
        };
        thresholds.validate().map_err(ConfigError::Thresholds)?;

        let tick_interval = Duration::from_millis(duration_or("TICK_INTERVAL", 15_000)?);
        let idle_timeout = match optional("IDLE_TIMEOUT")?.as_deref() {
            None => Some(Duration::from_secs(30 * 60)),
            Some("none") => None,
            Some(text) => Some(parse_duration("IDLE_TIMEOUT", text)?),
        };

        let webhook_url = optional("WEBHOOK_URL")?;
        let mailgun = mailgun_from_env()?;
        if webhook_url.is_none() && mailgun.is_none() {
            return Err(ConfigError::NoChannels);
        }

        Ok(Self {
            bridge_addr,
            sensor_id,
            thresholds,
            tick_interval,
            idle_timeout,
            webhook_url,
            mailgun,
        })
    }
}

/// The Mailgun group is all-or-nothing: one variable set without the rest
/// is a misconfiguration, not a disabled channel.
fn mailgun_from_env() -> Result<Option<MailgunConfig>, ConfigError> {
    let group = [
        "MAILGUN_DOMAIN",
        "MAILGUN_API_KEY",
        "SENDER_EMAIL",
        "NOTIFY_EMAIL",
    ];
    let set: Vec<&str> = group
        .iter()
        .copied()
        .filter(|name| std::env::var(name).is_ok())
        .collect();
    if set.is_empty() {
        return Ok(None);
    }
    if set.len() < group.len() {
        let missing: Vec<&str> = group.iter().copied().filter(|n| !set.contains(n)).collect();
        return Err(ConfigError::InvalidEnvVar {
            name: missing.join(", "),
            cause: "partial Mailgun configuration".into(),
        });
    }

    let region = match optional("MAILGUN_REGION")?.as_deref() {
        None => MailgunRegion::Eu,
        Some(text) => {
            MailgunRegion::parse(text).ok_or_else(|| ConfigError::InvalidEnvVar {
                name: "MAILGUN_REGION".to_string(),
                cause: format!("expected eu or us, got {text}").into(),
            })?
        }
    };

    Ok(Some(MailgunConfig {
        region,
        domain: required("MAILGUN_DOMAIN")?,
        api_key: required("MAILGUN_API_KEY")?,
        sender: email("SENDER_EMAIL")?,
        recipient: email("NOTIFY_EMAIL")?,
    }))
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|err| ConfigError::InvalidEnvVar {
        name: name.to_string(),
        cause: Box::new(err),
    })
}

fn optional(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(ConfigError::InvalidEnvVar {
            name: name.to_string(),
            cause: Box::new(err),
        }),
    }
}

fn parse_or(name: &str, default: f32) -> Result<f32, ConfigError> {
    match optional(name)? {
        None => Ok(default),
        Some(text) => text.parse().map_err(|err| ConfigError::InvalidEnvVar {
            name: name.to_string(),
            cause: Box::new(err),
        }),
    }
}

fn duration_or(name: &str, default_ms: u64) -> Result<u64, ConfigError> {
    match optional(name)? {
        None => Ok(default_ms),
        Some(text) => Ok(parse_duration(name, &text)?.as_millis() as u64),
    }
}

fn parse_duration(name: &str, text: &str) -> Result<Duration, ConfigError> {
    duration_str::parse(text).map_err(|err| ConfigError::InvalidEnvVar {
        name: name.to_string(),
        cause: format!("failed to parse duration {text}: {err}").into(),
    })
}

fn email(name: &str) -> Result<EmailAddress, ConfigError> {
    let text = required(name)?;
    EmailAddress::from_str(&text).map_err(|err| ConfigError::InvalidEnvVar {
        name: name.to_string(),
        cause: Box::new(err),
    })
}
