use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use c3_sdk::time::relative_time;
use c3_sdk::{Alert, AlertLevel, Client, ClientSettings, DeliveryStatus, DeviceConfiguration};

mod simulate;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if env_or("C3_LOG_JSON", false) {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = DeviceConfiguration::from_env().context("invalid device configuration")?;
    let settings = match ClientSettings::load_from_file() {
        Ok(settings) => settings,
        Err(e) => {
            info!(error = %e, "No settings file, using environment.");
            ClientSettings::from_env()?
        }
    };
    info!(?config, transport = %settings.transport.kind(), "Device starting.");

    let sample_every = Duration::from_secs(env_or("C3_SAMPLE_INTERVAL_SECS", 10));
    let poll_every = Duration::from_secs(env_or("C3_POLL_INTERVAL_SECS", 5));
    let alert_threshold: f64 = env_or("C3_ALERT_TEMPERATURE", 30.0);

    let mut client = Client::new(config, settings)?;
    client.on_command(|command| {
        info!(
            command_id = %command.command_id,
            name = %command.name,
            issued = %relative_time(command.issued_at, Utc::now()),
            "Handling command."
        );
    });

    client
        .connect_with_backoff()
        .await
        .context("could not reach the backend")?;
    let registration = client.register_device().await?;
    info!(status = ?registration.status, "Device registered.");

    let mut stream = client.create_stream()?;
    let mut sample_interval = time::interval(sample_every);
    let mut poll_interval = time::interval(poll_every);

    loop {
        tokio::select! {
            _ = sample_interval.tick() => {
                if !stream.client().is_connected() {
                    if let Err(e) = stream.client().connect_with_backoff().await {
                        error!(error = %e, "Still offline; skipping sample.");
                        continue;
                    }
                }
                let readings = simulate::sample_readings();
                let temperature = readings["temperature"].as_f64().unwrap_or_default();
                match stream.send(readings).await {
                    Ok(report) if report.status == DeliveryStatus::Queued => {
                        warn!(message_id = report.message_id, "Telemetry queued for later delivery.");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to send telemetry."),
                }

                if temperature > alert_threshold {
                    let alert = Alert::new(
                        AlertLevel::High,
                        format!("temperature {temperature:.1} above {alert_threshold:.1}"),
                    );
                    match stream.client().send_alert(alert).await {
                        Ok(report) => info!(status = ?report.status, attempts = report.attempts, "Alert raised."),
                        Err(e) => error!(error = %e, "Alert not delivered."),
                    }
                }
            }
            _ = poll_interval.tick() => {
                if stream.client().is_connected() {
                    if let Err(e) = stream.client().poll(Duration::from_millis(250)).await {
                        warn!(error = %e, "Polling for commands failed.");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(sent = stream.sent(), "Shutting down.");
                break;
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}
