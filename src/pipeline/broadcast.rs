//! Sender side: capture → encode → chunk → fan-out
//!
//! The capture context encodes frames and posts them over a bounded channel.
//! A single control task drains that channel, chunks each packet at the
//! transport MTU and writes the chunks to every active session concurrently.

use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::capture::{Capture, CapturedPacket, FrameSink, SharedProfile};
use crate::codec::CompressionProfile;
use crate::config::AppConfig;
use crate::error::{AudioError, Result, SessionError};
use crate::network::Transport;
use crate::protocol::{split, Chunk};
use crate::session::SessionPool;
use crate::telemetry::{AlertKind, EventHub, Telemetry, TelemetryEvent, TelemetrySnapshot};

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

/// Broadcast orchestrator owning the capture collaborator
pub struct BroadcastPipeline<T: Transport> {
    pool: SessionPool<T>,
    capture: Box<dyn Capture>,
    config: AppConfig,
    profile: SharedProfile,
    /// Packet ids keep increasing across stop/start
    next_packet_id: Arc<AtomicU32>,
    telemetry: Arc<Mutex<Telemetry>>,
    running: Option<Running>,
}

impl<T: Transport> BroadcastPipeline<T> {
    pub fn new(pool: SessionPool<T>, capture: Box<dyn Capture>, config: AppConfig) -> Self {
        Self {
            profile: SharedProfile::new(config.codec.profile),
            next_packet_id: Arc::new(AtomicU32::new(0)),
            telemetry: Arc::new(Mutex::new(Telemetry::new(config.telemetry.clone()))),
            pool,
            capture,
            config,
            running: None,
        }
    }

    pub fn pool(&self) -> &SessionPool<T> {
        &self.pool
    }

    pub fn events(&self) -> &Arc<EventHub> {
        self.pool.events()
    }

    pub fn is_broadcasting(&self) -> bool {
        self.running.is_some()
    }

    pub fn profile(&self) -> CompressionProfile {
        self.profile.get()
    }

    /// Takes effect from the next captured frame
    pub fn set_profile(&self, profile: CompressionProfile) {
        if self.profile.get() != profile {
            tracing::info!(%profile, "compression profile changed");
        }
        self.profile.set(profile);
    }

    /// Battery level reported by the platform, if any
    pub fn set_battery(&self, percent: Option<f64>) {
        self.telemetry.lock().set_battery(percent);
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.lock().snapshot()
    }

    /// Next stream error reported by the capture device, if any
    pub fn capture_error(&mut self) -> Option<AudioError> {
        self.capture.take_error()
    }

    /// Frames dropped at the capture hand-off since the broadcast started
    pub fn dropped_frames(&self) -> u64 {
        self.running
            .as_ref()
            .map_or(0, |r| r.dropped.load(Ordering::Relaxed))
    }

    /// Start capturing and fanning out. A no-op while already broadcasting.
    pub async fn start_broadcast(&mut self, profile: CompressionProfile) -> Result<()> {
        if self.running.is_some() {
            tracing::debug!("broadcast already running");
            return Ok(());
        }

        self.pool
            .transport()
            .check_available()
            .await
            .map_err(|e| SessionError::TransportUnavailable(e.to_string()))?;

        self.profile.set(profile);
        let audio = &self.config.audio;
        let (tx, rx) = mpsc::channel(audio.channel_capacity.max(1));
        let sink = FrameSink::new(
            self.profile.clone(),
            Arc::clone(&self.next_packet_id),
            tx,
            audio.frame_size,
            audio.sample_rate,
        );
        let dropped = sink.dropped_counter();

        self.capture.start(sink).map_err(|e| match e {
            AudioError::MicrophoneUnavailable(_) => e,
            other => AudioError::MicrophoneUnavailable(other.to_string()),
        })?;

        let cancel = CancellationToken::new();
        let fanout = Fanout {
            pool: self.pool.clone(),
            profile: self.profile.clone(),
            telemetry: Arc::clone(&self.telemetry),
            adaptive: self.config.codec.adaptive_profile,
            frame_duration: audio.frame_duration(),
            suggestion_cooldown: self.config.telemetry.latency_window as u64,
            cycles: 0,
            last_suggestion: None,
        };
        let poll = Duration::from_millis(self.config.telemetry.signal_poll_interval_ms.max(1));
        let task = tokio::spawn(fanout.run(cancel.clone(), rx, poll));

        self.running = Some(Running {
            cancel,
            task,
            dropped,
        });
        tracing::info!(%profile, mtu = self.pool.transport().mtu(), "broadcast started");
        Ok(())
    }

    /// Stop capture and drain every session. A no-op when not broadcasting.
    pub async fn stop_broadcast(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        self.capture.stop();
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::error!(error = %e, "broadcast task failed");
        }
        self.pool.drain_all();

        tracing::info!(
            dropped_frames = running.dropped.load(Ordering::Relaxed),
            "broadcast stopped"
        );
    }
}

/// State of the control task
struct Fanout<T: Transport> {
    pool: SessionPool<T>,
    profile: SharedProfile,
    telemetry: Arc<Mutex<Telemetry>>,
    adaptive: bool,
    frame_duration: Duration,
    /// Cycles to wait between profile suggestions
    suggestion_cooldown: u64,
    cycles: u64,
    last_suggestion: Option<u64>,
}

impl<T: Transport> Fanout<T> {
    async fn run(mut self, cancel: CancellationToken, mut rx: mpsc::Receiver<CapturedPacket>, poll: Duration) {
        let mut signal_poll = interval(poll);
        signal_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                captured = rx.recv() => match captured {
                    Some(captured) => self.send_frame(captured, &cancel).await,
                    None => break,
                },

                _ = signal_poll.tick() => self.sample_signal().await,
            }
        }
        tracing::debug!(cycles = self.cycles, "broadcast task exiting");
    }

    /// One frame cycle: chunk, write to every active session, update telemetry.
    ///
    /// Cancellation abandons writes still in flight; their leases release
    /// the in-flight slot when dropped.
    async fn send_frame(&mut self, captured: CapturedPacket, cancel: &CancellationToken) {
        self.cycles += 1;
        let started = Instant::now();
        let packet_id = captured.packet.packet_id();

        let chunks = match split(&captured.packet, self.pool.transport().mtu()) {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!(packet_id, error = %e, "packet could not be chunked");
                return;
            }
        };
        let datagrams: Vec<Bytes> = chunks.iter().map(Chunk::encode).collect();
        let processing = captured.encode_time + started.elapsed();

        let leases = self.pool.begin_writes();
        let sessions = leases.len();

        let fanout = join_all(leases.into_iter().map(|lease| {
            let datagrams = &datagrams;
            async move {
                let mut round_trips = Vec::with_capacity(datagrams.len());
                for datagram in datagrams {
                    let sent_at = Instant::now();
                    match lease.write(datagram.clone()).await {
                        Ok(ack) => {
                            round_trips.extend(ack.acked_at.map(|at| at.saturating_duration_since(sent_at)))
                        }
                        Err(e) => {
                            lease.fail(&e);
                            return None;
                        }
                    }
                }
                lease.succeed();
                Some(mean(&round_trips))
            }
        }));

        let outcomes = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(packet_id, sessions, "fan-out cancelled");
                return;
            }

            outcomes = fanout => outcomes,
        };

        let delivered = outcomes.iter().filter(|o| o.is_some()).count();
        tracing::trace!(packet_id, chunks = datagrams.len(), sessions, delivered, "frame sent");

        let alerts = {
            let mut telemetry = self.telemetry.lock();
            telemetry.record_processing_time(processing);
            telemetry.record_cpu(100.0 * processing.as_secs_f64() / self.frame_duration.as_secs_f64().max(1e-6));
            for latency in outcomes.into_iter().flatten().flatten() {
                telemetry.record_transport_latency(latency);
            }
            telemetry.record_audio_latency(captured.captured_at.elapsed());
            telemetry.evaluate()
        };

        let events = Arc::clone(self.pool.events());
        for alert in alerts {
            if alert.kind == AlertKind::TransportLatency {
                self.suggest_lower_profile();
            }
            events.publish(TelemetryEvent::Alert(alert));
        }
    }

    fn suggest_lower_profile(&mut self) {
        if self
            .last_suggestion
            .is_some_and(|at| self.cycles - at < self.suggestion_cooldown)
        {
            return;
        }
        let current = self.profile.get();
        let Some(suggested) = current.next_lower_quality() else {
            return;
        };
        self.last_suggestion = Some(self.cycles);

        if self.adaptive {
            self.profile.set(suggested);
            tracing::info!(from = %current, to = %suggested, "transport latency high, lowering profile");
        }
        self.pool.events().publish(TelemetryEvent::ProfileSuggested {
            current,
            suggested,
            applied: self.adaptive,
        });
    }

    async fn sample_signal(&self) {
        let weakest = self.pool.poll_signal().await;
        let mut telemetry = self.telemetry.lock();
        match weakest {
            Some(rssi) => telemetry.record_rssi(rssi),
            None => telemetry.clear_signal(),
        }
    }
}

/// Mean acknowledgement round trip of one session's writes
fn mean(round_trips: &[Duration]) -> Option<Duration> {
    let count = u32::try_from(round_trips.len()).ok().filter(|n| *n > 0)?;
    Some(round_trips.iter().sum::<Duration>() / count)
}
