//! Microphone Broadcast Sender
//!
//! Captures one microphone and fans it out to every receiver admitted into
//! the session pool.
//!
//! Usage: `sender [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_broadcast::{
    audio::{capture::CpalCapture, device::list_devices},
    config::AppConfig,
    network::{DeviceCandidate, UdpTransport},
    pipeline::BroadcastPipeline,
    session::SessionPool,
    telemetry::{EventHub, LoggingSubscriber},
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

fn load_config() -> Result<AppConfig> {
    match std::env::args().nth(1) {
        Some(path) => AppConfig::load(&PathBuf::from(&path))
            .with_context(|| format!("failed to load config from {}", path)),
        None => AppConfig::load_or_default().context("failed to load default config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting mic broadcast sender");

    let config = load_config()?;

    println!("\n=== Available Input Devices ===");
    for device in list_devices().iter().filter(|d| d.is_input) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Mono: {}", device.supports_mono);
    }
    println!();

    let events = Arc::new(EventHub::new());
    events.subscribe(Arc::new(LoggingSubscriber));

    let transport = Arc::new(UdpTransport::bind(&config.network).context("failed to bind UDP transport")?);
    tracing::info!("Sending from {}", transport.local_addr()?);

    let pool = SessionPool::new(transport, config.session.clone(), Arc::clone(&events));

    if config.network.receivers.is_empty() {
        tracing::warn!("No receivers configured; broadcasting to an empty pool");
    }
    for (index, address) in config.network.receivers.iter().enumerate() {
        let pool = pool.clone();
        let candidate = DeviceCandidate::new(address.clone(), format!("receiver-{}", index));
        tokio::spawn(async move {
            match pool.request_admission(candidate.clone()).await {
                Ok(id) => tracing::info!("Admitted {} as session {}", candidate, id),
                Err(e) => tracing::warn!("Could not admit {}: {}", candidate, e),
            }
        });
    }

    let capture = CpalCapture::new(config.audio.input_device.clone(), config.audio.sample_rate);
    let mut pipeline = BroadcastPipeline::new(pool.clone(), Box::new(capture), config.clone());
    pipeline
        .start_broadcast(config.codec.profile)
        .await
        .context("failed to start broadcast")?;

    tracing::info!(
        "Broadcasting {} samples/frame at {} Hz ({}) - press Ctrl+C to stop",
        config.audio.frame_size,
        config.audio.sample_rate,
        config.codec.profile
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut stats = tokio::time::interval(STATS_INTERVAL);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
            _ = stats.tick() => {
                while let Some(e) = pipeline.capture_error() {
                    tracing::error!("Capture error: {}", e);
                }
                let snapshot = serde_json::json!({
                    "profile": pipeline.profile(),
                    "dropped_frames": pipeline.dropped_frames(),
                    "pool": pool.snapshot(),
                    "telemetry": pipeline.telemetry_snapshot(),
                });
                tracing::info!(target: "stats", "{}", snapshot);
            }
        }
    }

    tracing::info!("Shutting down...");
    pipeline.stop_broadcast().await;
    pool.shutdown().await;

    Ok(())
}
