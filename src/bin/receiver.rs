//! Microphone Broadcast Receiver
//!
//! Receives chunk datagrams from a sender, reassembles and plays them on the
//! configured output device.
//!
//! Usage: `receiver [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_broadcast::{
    audio::{device::list_devices, playback::CpalRender},
    config::AppConfig,
    network::UdpReceiver,
    pipeline::PlaybackPipeline,
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

    tracing::info!("Starting mic broadcast receiver");

    let config = load_config()?;

    println!("\n=== Available Output Devices ===");
    for device in list_devices().iter().filter(|d| !d.is_input) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
    }
    println!();

    let events = Arc::new(EventHub::new());
    events.subscribe(Arc::new(LoggingSubscriber));

    let mut socket = UdpReceiver::bind(&config.network).context("failed to bind UDP receiver")?;
    tracing::info!("Listening on {}", socket.local_addr()?);

    let render = CpalRender::new(
        config.audio.output_device.clone(),
        config.audio.sample_rate,
        config.playback.render_ring_capacity,
    );
    let ring = render.ring();
    let mut pipeline = PlaybackPipeline::new(Box::new(render), config.clone(), events);
    let datagrams = pipeline.connect().await.context("failed to start playback")?;

    tracing::info!("Waiting for audio - press Ctrl+C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    let mut backlog_drops: u64 = 0;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
            received = socket.recv() => match received {
                Ok((datagram, _from)) => match datagrams.try_send(datagram) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => backlog_drops += 1,
                    Err(TrySendError::Closed(_)) => {
                        tracing::error!("Playback task stopped unexpectedly");
                        break;
                    }
                },
                Err(e) => tracing::warn!("Receive error: {}", e),
            },
            _ = stats.tick() => {
                let snapshot = serde_json::json!({
                    "backlog_drops": backlog_drops,
                    "render_ring": ring.stats(),
                    "playback": pipeline.snapshot(),
                });
                tracing::info!(target: "stats", "{}", snapshot);
            }
        }
    }

    tracing::info!("Shutting down...");
    drop(datagrams);
    pipeline.disconnect().await;

    Ok(())
}
