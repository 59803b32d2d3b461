//! PlusLife monitoring service
//!
//! Wires the pieces together: load configuration from the environment,
//! build the delivery channels and dispatcher, and run one sensor session
//! against the BLE bridge until shutdown.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use pluslife_core::pipeline::PipelineConfig;
use pluslife_link::{
    Dispatcher, MailgunChannel, NotificationChannel, RetryPolicy, SensorSession, SessionCommand,
    SessionConfig, TcpBridgeTransport, WebhookChannel,
};

mod config;

use config::{Config, ConfigError};

#[tokio::main]
async fn main() {
    if let Err(err) = dotenv::dotenv() {
        if !err.not_found() {
            panic!("error loading .env file: {}", err);
        }
    }

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::filter::LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(stderr_layer)
        .try_init()
        .expect("failed to configure logging");

    if let Err(err) = run().await {
        error!(%err, "startup failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ConfigError> {
    let config = Config::try_from_env()?;
    info!(
        bridge = %config.bridge_addr,
        sensor = %config.sensor_id,
        version = pluslife_core::VERSION,
        "starting monitor"
    );

    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    let mut fallback_mail = None;

    if let Some(url) = &config.webhook_url {
        let webhook = WebhookChannel::new(url.clone()).map_err(|err| {
            ConfigError::InvalidEnvVar {
                name: "WEBHOOK_URL".to_string(),
                cause: Box::new(err),
            }
        })?;
        channels.push(Arc::new(webhook));
        info!(%url, "webhook channel configured");
    }

    if let Some(mailgun) = &config.mailgun {
        let channel = MailgunChannel::new(
            mailgun.region,
            mailgun.domain.clone(),
            mailgun.api_key.clone(),
            mailgun.sender.clone(),
            mailgun.recipient.clone(),
        )
        .map_err(|err| ConfigError::InvalidEnvVar {
            name: "MAILGUN_DOMAIN".to_string(),
            cause: Box::new(err),
        })?;
        let channel = Arc::new(channel);
        fallback_mail = Some(channel.clone());
        channels.push(channel);
        info!(domain = %mailgun.domain, recipient = %mailgun.recipient, "mailgun channel configured");
    }

    let (dispatcher, dispatch_handle, mut failures) =
        Dispatcher::new(channels, RetryPolicy::default());
    tokio::spawn(dispatcher.run());

    // Escalate undeliverable alerts: always log, and when mail is
    // configured, try one fresh error mail so the operator hears that
    // notifications themselves are failing
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            error!(
                sensor = %failure.payload.sensor_id,
                kind = %failure.payload.kind,
                errors = ?failure.channel_errors,
                payload = %serde_json::to_string(&failure.payload).unwrap_or_default(),
                "alert undeliverable on every channel"
            );
            if let Some(mail) = &fallback_mail {
                let _ = mail.send_error(&failure.payload).await;
            }
        }
    });

    let mut session_config = SessionConfig::new(config.bridge_addr.clone());
    session_config.tick_interval = config.tick_interval;
    session_config.idle_timeout = config.idle_timeout;

    let (session, handle) = SensorSession::new(
        config.sensor_id,
        TcpBridgeTransport::default(),
        PipelineConfig::new(config.thresholds),
        session_config,
        dispatch_handle,
    );
    let mut session_task = tokio::spawn(session.run());

    tokio::select! {
        result = &mut session_task => {
            // Idle teardown or a panic; either way the service is done
            if let Err(err) = result {
                error!(%err, "session task failed");
            } else {
                info!("session ended");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            handle.command(SessionCommand::Disconnect).await;
            let _ = session_task.await;
        }
    }

    Ok(())
}
