//! Receiver side: chunk reassembly → decode → jitter buffer → render
//!
//! Datagrams are fed in through the sender returned by
//! [`PlaybackPipeline::connect`]. A control task reassembles and decodes
//! them, and a fixed-cadence render tick hands one frame per frame duration
//! to the renderer, covering gaps with the last frame or silence.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::buffer::{AudioFrame, InsertOutcome, JitterBuffer, JitterBufferStats};
use crate::audio::playback::Render;
use crate::codec::{DecoderStats, EncodedPacket, PcmDecoder};
use crate::config::AppConfig;
use crate::error::{AudioError, Result};
use crate::protocol::{Chunk, Reassembler, ReassemblerStats};
use crate::telemetry::{DropReason, EventHub, Telemetry, TelemetryEvent, TelemetrySnapshot, UnderrunFill};

/// Counters published by the playback task
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaybackStats {
    pub frames_rendered: u64,
    pub underruns: u64,
    pub repeated_frames: u64,
    pub silent_frames: u64,
    pub malformed_chunks: u64,
    pub malformed_packets: u64,
    pub packets_timed_out: u64,
    pub late_frames: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackSnapshot {
    pub connected: bool,
    pub stats: PlaybackStats,
    pub jitter: Option<JitterBufferStats>,
    pub reassembly: Option<ReassemblerStats>,
    pub decoder: Option<DecoderStats>,
    pub telemetry: TelemetrySnapshot,
}

#[derive(Default)]
struct Shared {
    stats: PlaybackStats,
    jitter: Option<JitterBufferStats>,
    reassembly: Option<ReassemblerStats>,
    decoder: Option<DecoderStats>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<Box<dyn Render>>,
    tx: mpsc::Sender<Bytes>,
}

/// Playback orchestrator owning the render collaborator
pub struct PlaybackPipeline {
    config: AppConfig,
    events: Arc<EventHub>,
    render: Option<Box<dyn Render>>,
    telemetry: Arc<Mutex<Telemetry>>,
    shared: Arc<Mutex<Shared>>,
    running: Option<Running>,
}

impl PlaybackPipeline {
    pub fn new(render: Box<dyn Render>, config: AppConfig, events: Arc<EventHub>) -> Self {
        Self {
            telemetry: Arc::new(Mutex::new(Telemetry::new(config.telemetry.clone()))),
            shared: Arc::new(Mutex::new(Shared::default())),
            render: Some(render),
            running: None,
            config,
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn is_connected(&self) -> bool {
        self.running.is_some()
    }

    /// Start rendering; returns the sender chunk datagrams are fed into.
    ///
    /// Connecting again while connected returns the same stream.
    pub async fn connect(&mut self) -> Result<mpsc::Sender<Bytes>> {
        if let Some(running) = &self.running {
            return Ok(running.tx.clone());
        }

        let mut render = self
            .render
            .take()
            .ok_or_else(|| AudioError::StreamError("renderer lost after a playback task failure".into()))?;
        if let Err(e) = render.start() {
            self.render = Some(render);
            return Err(e.into());
        }

        let playback = &self.config.playback;
        let audio = &self.config.audio;
        // Room for a full jitter buffer of maximally fragmented packets
        let (tx, rx) = mpsc::channel(playback.jitter_capacity.max(1) * 64);
        let cancel = CancellationToken::new();

        *self.shared.lock() = Shared::default();
        let receiver = Receiver {
            reassembler: Reassembler::new(playback.reassembly_timeout()),
            decoder: PcmDecoder::new(audio.sample_rate),
            jitter: JitterBuffer::new(playback.jitter_capacity, playback.min_delay, playback.max_delay),
            render,
            telemetry: Arc::clone(&self.telemetry),
            shared: Arc::clone(&self.shared),
            events: Arc::clone(&self.events),
            frame_size: audio.frame_size,
            sample_rate: audio.sample_rate,
            max_repeats: playback.max_delay as u64,
            adapt_every: self.config.telemetry.health_window.max(1) as u64,
            last_rendered: None,
            started: false,
            starved: 0,
            ticks: 0,
            arrivals: 0,
        };
        let task = tokio::spawn(receiver.run(cancel.clone(), rx, audio.frame_duration()));

        self.running = Some(Running {
            cancel,
            task,
            tx: tx.clone(),
        });
        tracing::info!(frame_ms = audio.frame_duration().as_millis() as u64, "playback connected");
        Ok(tx)
    }

    /// Stop rendering and discard buffered audio. A no-op when not connected.
    pub async fn disconnect(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        drop(running.tx);

        match running.task.await {
            Ok(mut render) => {
                render.stop();
                self.render = Some(render);
            }
            Err(e) => tracing::error!(error = %e, "playback task failed"),
        }
        tracing::info!("playback disconnected");
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let shared = self.shared.lock();
        PlaybackSnapshot {
            connected: self.running.is_some(),
            stats: shared.stats.clone(),
            jitter: shared.jitter.clone(),
            reassembly: shared.reassembly.clone(),
            decoder: shared.decoder.clone(),
            telemetry: self.telemetry.lock().snapshot(),
        }
    }
}

/// State of the playback control task
struct Receiver {
    reassembler: Reassembler,
    decoder: PcmDecoder,
    jitter: JitterBuffer,
    render: Box<dyn Render>,
    telemetry: Arc<Mutex<Telemetry>>,
    shared: Arc<Mutex<Shared>>,
    events: Arc<EventHub>,
    frame_size: usize,
    sample_rate: u32,
    /// Consecutive starved ticks covered by repeating the last frame
    max_repeats: u64,
    adapt_every: u64,
    last_rendered: Option<AudioFrame>,
    /// Whether any frame has arrived yet
    started: bool,
    starved: u64,
    ticks: u64,
    arrivals: u64,
}

impl Receiver {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<Bytes>,
        frame_duration: Duration,
    ) -> Box<dyn Render> {
        let mut metronome = interval(frame_duration.max(Duration::from_millis(1)));
        metronome.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.reassembler.next_deadline();
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = metronome.tick() => self.render_tick(),

                datagram = rx.recv() => match datagram {
                    Some(datagram) => self.on_datagram(datagram),
                    None => break,
                },

                _ = wait_until(deadline) => self.expire(),
            }
        }

        self.jitter.reset();
        self.reassembler.clear();
        tracing::debug!(ticks = self.ticks, "playback task exiting");
        self.render
    }

    fn on_datagram(&mut self, datagram: Bytes) {
        let now = Instant::now();
        let chunk = match Chunk::decode(datagram) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "discarding malformed chunk");
                self.shared.lock().stats.malformed_chunks += 1;
                self.publish_drop(None, DropReason::MalformedChunk);
                return;
            }
        };
        let packet_id = chunk.packet_id;

        match self.reassembler.insert(chunk, now) {
            Ok(Some(packet)) => self.on_packet(packet, now),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(packet_id, error = %e, "chunk rejected");
                self.shared.lock().stats.malformed_chunks += 1;
                self.publish_drop(Some(packet_id), DropReason::MalformedChunk);
            }
        }
        self.shared.lock().reassembly = Some(self.reassembler.stats());
    }

    fn on_packet(&mut self, packet: EncodedPacket, now: Instant) {
        let packet_id = packet.packet_id();
        let decoded = self.decoder.decode(&packet);
        self.shared.lock().decoder = Some(self.decoder.stats());
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(packet_id, error = %e, "discarding malformed packet");
                self.shared.lock().stats.malformed_packets += 1;
                self.publish_drop(Some(packet_id), DropReason::MalformedPacket);
                return;
            }
        };

        self.started = true;
        self.arrivals += 1;
        let health = {
            let mut telemetry = self.telemetry.lock();
            telemetry.record_arrival(now);
            telemetry.buffer_health()
        };

        match self.jitter.insert(frame) {
            InsertOutcome::Buffered | InsertOutcome::Duplicate => {}
            InsertOutcome::Late => {
                self.shared.lock().stats.late_frames += 1;
                self.publish_drop(Some(packet_id), DropReason::Late);
            }
            InsertOutcome::Overflowed { dropped } => {
                self.publish_drop(Some(dropped), DropReason::Overflow);
            }
        }

        if self.arrivals % self.adapt_every == 0 {
            let before = self.jitter.target_delay();
            self.jitter.adapt(health);
            if self.jitter.target_delay() != before {
                tracing::debug!(health, target = self.jitter.target_delay(), "jitter target adjusted");
            }
        }
        self.shared.lock().jitter = Some(self.jitter.stats());
    }

    /// One render slot: the next frame, or a fill when starved
    fn render_tick(&mut self) {
        self.ticks += 1;

        if let Some(frame) = self.jitter.pop() {
            self.render.on_frame_ready(&frame);
            self.last_rendered = Some(frame);
            self.starved = 0;
            let mut shared = self.shared.lock();
            shared.stats.frames_rendered += 1;
            shared.jitter = Some(self.jitter.stats());
            return;
        }

        let silence_len = self.last_rendered.as_ref().map_or(self.frame_size, |f| f.len());
        if !self.started {
            // Nothing has arrived yet; keep the output clocked
            self.render
                .on_frame_ready(&AudioFrame::silence(silence_len, self.sample_rate, 0));
            return;
        }

        self.starved += 1;
        let fill = match &self.last_rendered {
            Some(last) if self.starved <= self.max_repeats => {
                self.render.on_frame_ready(last);
                UnderrunFill::RepeatLast
            }
            _ => {
                let sequence = self.last_rendered.as_ref().map_or(0, |f| f.sequence());
                self.render
                    .on_frame_ready(&AudioFrame::silence(silence_len, self.sample_rate, sequence));
                UnderrunFill::Silence
            }
        };

        {
            let mut shared = self.shared.lock();
            shared.stats.underruns += 1;
            match fill {
                UnderrunFill::RepeatLast => shared.stats.repeated_frames += 1,
                UnderrunFill::Silence => shared.stats.silent_frames += 1,
            }
        }
        tracing::trace!(tick = self.ticks, ?fill, "underrun");
        self.events.publish(TelemetryEvent::Underrun {
            tick: self.ticks,
            fill,
        });
    }

    fn expire(&mut self) {
        let expired = self.reassembler.expire(Instant::now());
        if expired.is_empty() {
            return;
        }
        self.shared.lock().stats.packets_timed_out += expired.len() as u64;
        for packet_id in expired {
            self.publish_drop(Some(packet_id), DropReason::PacketTimeout);
        }
        self.shared.lock().reassembly = Some(self.reassembler.stats());
    }

    fn publish_drop(&self, packet_id: Option<u32>, reason: DropReason) {
        self.events
            .publish(TelemetryEvent::PacketDropped { packet_id, reason });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::RecordingRender;
    use crate::codec::{CompressionProfile, PcmEncoder};
    use crate::protocol::split;
    use crate::telemetry::ChannelSubscriber;

    const FRAME: usize = 480; // 10 ms at 48 kHz

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.audio.frame_size = FRAME;
        config.playback.min_delay = 2;
        config
    }

    fn datagrams(encoder: &mut PcmEncoder, value: i16) -> Vec<Bytes> {
        let frame = AudioFrame::new(vec![value; FRAME], 48000, 0);
        let packet = encoder.encode(&frame, CompressionProfile::None);
        split(&packet, 256)
            .unwrap()
            .iter()
            .map(Chunk::encode)
            .collect()
    }

    fn setup() -> (PlaybackPipeline, RecordingRender, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let render = RecordingRender::new();
        let events = Arc::new(EventHub::new());
        let (subscriber, rx) = ChannelSubscriber::new();
        events.subscribe(Arc::new(subscriber));
        (
            PlaybackPipeline::new(Box::new(render.clone()), config(), events),
            render,
            rx,
        )
    }

    fn rendered_values(render: &RecordingRender) -> Vec<i16> {
        render.frames().iter().map(|f| f.samples()[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_render_in_packet_order() {
        let (mut pipeline, render, _rx) = setup();
        let tx = pipeline.connect().await.unwrap();
        let mut encoder = PcmEncoder::new();

        let first = datagrams(&mut encoder, 100);
        let second = datagrams(&mut encoder, 200);
        let third = datagrams(&mut encoder, 300);
        // Second packet's chunks arrive first and reversed
        for d in second.into_iter().rev().chain(first).chain(third) {
            tx.send(d).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(35)).await;

        let values: Vec<i16> = rendered_values(&render)
            .into_iter()
            .filter(|v| *v != 0)
            .collect();
        assert_eq!(values, vec![100, 200, 300]);
        assert!(render.frames().iter().all(|f| f.len() == FRAME));

        pipeline.disconnect().await;
        assert!(!render.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_underrun_repeats_last_frame_then_silence() {
        let (mut pipeline, render, mut events) = setup();
        let tx = pipeline.connect().await.unwrap();
        let mut encoder = PcmEncoder::new();

        for value in [10, 20] {
            for d in datagrams(&mut encoder, value) {
                tx.send(d).await.unwrap();
            }
        }
        // 2 frames play, then 8 repeats, then silence
        tokio::time::sleep(Duration::from_millis(135)).await;
        pipeline.disconnect().await;

        let values = rendered_values(&render);
        let start = values.iter().position(|v| *v == 10).unwrap();
        let tail = &values[start..];
        assert_eq!(&tail[..2], &[10, 20]);
        assert!(tail[2..10].iter().all(|v| *v == 20));
        assert!(tail[10..].iter().all(|v| *v == 0));

        let mut fills = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TelemetryEvent::Underrun { fill, .. } = event {
                fills.push(fill);
            }
        }
        assert_eq!(fills[0], UnderrunFill::RepeatLast);
        assert_eq!(fills.iter().filter(|f| **f == UnderrunFill::RepeatLast).count(), 8);
        assert_eq!(*fills.last().unwrap(), UnderrunFill::Silence);
        assert_eq!(pipeline.snapshot().stats.frames_rendered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_packet_times_out() {
        let (mut pipeline, _render, mut events) = setup();
        let tx = pipeline.connect().await.unwrap();
        let mut encoder = PcmEncoder::new();

        let chunks = datagrams(&mut encoder, 5);
        assert!(chunks.len() > 1);
        tx.send(chunks[0].clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let dropped = loop {
            match events.try_recv() {
                Ok(TelemetryEvent::PacketDropped { packet_id, reason }) => break (packet_id, reason),
                Ok(_) => continue,
                Err(e) => panic!("no drop event: {:?}", e),
            }
        };
        assert_eq!(dropped, (Some(0), DropReason::PacketTimeout));
        assert_eq!(pipeline.snapshot().stats.packets_timed_out, 1);
        pipeline.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_datagram_is_counted_not_fatal() {
        let (mut pipeline, render, _events) = setup();
        let tx = pipeline.connect().await.unwrap();
        let mut encoder = PcmEncoder::new();

        tx.send(Bytes::from_static(b"junk")).await.unwrap();
        for value in [7, 8] {
            for d in datagrams(&mut encoder, value) {
                tx.send(d).await.unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(35)).await;

        assert_eq!(pipeline.snapshot().stats.malformed_chunks, 1);
        assert!(rendered_values(&render).contains(&7));
        pipeline.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_disconnect_are_idempotent() {
        let (mut pipeline, render, _events) = setup();
        let first = pipeline.connect().await.unwrap();
        let second = pipeline.connect().await.unwrap();
        assert!(first.same_channel(&second));
        assert!(render.is_running());

        pipeline.disconnect().await;
        pipeline.disconnect().await;
        assert!(!pipeline.is_connected());
        assert!(first.send(Bytes::new()).await.is_err());

        // The renderer is handed back and can be reused
        pipeline.connect().await.unwrap();
        assert!(render.is_running());
        pipeline.disconnect().await;
    }
}
