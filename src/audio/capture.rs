//! Audio capture from the microphone
//!
//! The capture callback is the real-time context: it quantizes and encodes
//! each frame, then posts the packet through a bounded channel without ever
//! blocking. Everything else happens on the control context.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::audio::buffer::AudioFrame;
use crate::audio::device::{get_default_input_device, get_device_by_id, AudioDevice};
use crate::codec::{CompressionProfile, EncodedPacket, PcmEncoder};
use crate::error::AudioError;

/// A packet produced by the capture context
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub packet: EncodedPacket,
    /// When the frame was complete at the capture callback
    pub captured_at: Instant,
    /// Time spent quantizing and encoding
    pub encode_time: Duration,
}

/// Profile shared between the control and capture contexts.
///
/// Read once per frame, so a change never lands mid-packet.
#[derive(Debug, Clone)]
pub struct SharedProfile(Arc<AtomicU8>);

impl SharedProfile {
    pub fn new(profile: CompressionProfile) -> Self {
        Self(Arc::new(AtomicU8::new(profile.as_u8())))
    }

    pub fn get(&self) -> CompressionProfile {
        CompressionProfile::from_u8(self.0.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set(&self, profile: CompressionProfile) {
        self.0.store(profile.as_u8(), Ordering::Release);
    }
}

/// Receiving end of the capture callback.
///
/// Accumulates raw samples into fixed-size frames, encodes them with the
/// current profile and posts them with `try_send`. Packet ids continue from
/// `next_packet_id`, which outlives the sink across capture restarts.
pub struct FrameSink {
    encoder: PcmEncoder,
    next_packet_id: Arc<AtomicU32>,
    profile: SharedProfile,
    tx: mpsc::Sender<CapturedPacket>,
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    sequence: u32,
    dropped: Arc<AtomicU64>,
}

impl FrameSink {
    pub fn new(
        profile: SharedProfile,
        next_packet_id: Arc<AtomicU32>,
        tx: mpsc::Sender<CapturedPacket>,
        frame_size: usize,
        sample_rate: u32,
    ) -> Self {
        Self {
            encoder: PcmEncoder::starting_at(next_packet_id.load(Ordering::Acquire)),
            next_packet_id,
            profile,
            tx,
            frame_size: frame_size.max(1),
            sample_rate,
            pending: Vec::with_capacity(frame_size * 2),
            sequence: 0,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of packets dropped because the control context fell behind
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// Feed raw callback data, emitting every complete frame
    pub fn push_samples(&mut self, data: &[f32]) {
        self.pending.extend_from_slice(data);
        while self.pending.len() >= self.frame_size {
            let frame = AudioFrame::from_f32(
                &self.pending[..self.frame_size],
                self.sample_rate,
                self.sequence,
            );
            self.pending.drain(..self.frame_size);
            self.sequence = self.sequence.wrapping_add(1);
            self.push_frame(frame);
        }
    }

    /// Encode a complete frame and post it. Returns false if it was dropped.
    pub fn push_frame(&mut self, frame: AudioFrame) -> bool {
        let captured_at = Instant::now();
        let packet = self.encoder.encode(&frame, self.profile.get());
        self.next_packet_id
            .store(self.encoder.next_packet_id(), Ordering::Release);
        let captured = CapturedPacket {
            packet,
            captured_at,
            encode_time: captured_at.elapsed(),
        };

        match self.tx.try_send(captured) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Capture collaborator: delivers frames at a fixed cadence to a sink
pub trait Capture: Send {
    /// Begin delivering frames; fails if the microphone cannot be opened
    fn start(&mut self, sink: FrameSink) -> Result<(), AudioError>;

    /// Stop delivering frames and release the device
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Next asynchronous stream error, if any was reported since the last call
    fn take_error(&mut self) -> Option<AudioError> {
        None
    }
}

/// Microphone capture through cpal
pub struct CpalCapture {
    /// Device identifier, default input when None
    device_id: Option<String>,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Channel for stream errors
    error_rx: Option<Receiver<AudioError>>,

    /// Stream configuration
    config: StreamConfig,
}

impl CpalCapture {
    pub fn new(device_id: Option<String>, sample_rate: u32) -> Self {
        Self {
            device_id,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            config: StreamConfig {
                channels: crate::constants::CHANNELS,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
        }
    }

    fn open_device(&self) -> Result<AudioDevice, AudioError> {
        match &self.device_id {
            Some(id) => get_device_by_id(id),
            None => get_default_input_device(),
        }
        .map_err(|e| AudioError::MicrophoneUnavailable(e.to_string()))
    }
}

impl Capture for CpalCapture {
    fn start(&mut self, mut sink: FrameSink) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = self.open_device()?;
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let config = self.config.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let callback_running = running.clone();

                let stream = cpal_device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if callback_running.load(Ordering::Relaxed) {
                            sink.push_samples(data);
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::MicrophoneUnavailable(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::MicrophoneUnavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(AudioError::StreamError("capture thread exited".into()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn take_error(&mut self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture driven by hand, for tests and file playback
pub struct ManualCapture {
    slot: Arc<Mutex<Option<FrameSink>>>,
    errors: Arc<Mutex<VecDeque<AudioError>>>,
    unavailable: Option<String>,
}

/// Pushes frames into a started [`ManualCapture`]
#[derive(Clone)]
pub struct ManualCaptureHandle {
    slot: Arc<Mutex<Option<FrameSink>>>,
    errors: Arc<Mutex<VecDeque<AudioError>>>,
}

impl ManualCapture {
    pub fn new() -> (Self, ManualCaptureHandle) {
        let slot = Arc::new(Mutex::new(None));
        let errors = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                slot: Arc::clone(&slot),
                errors: Arc::clone(&errors),
                unavailable: None,
            },
            ManualCaptureHandle { slot, errors },
        )
    }

    /// A capture whose `start` always fails, as a denied microphone does
    pub fn unavailable(reason: &str) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            errors: Arc::new(Mutex::new(VecDeque::new())),
            unavailable: Some(reason.to_string()),
        }
    }
}

impl Capture for ManualCapture {
    fn start(&mut self, sink: FrameSink) -> Result<(), AudioError> {
        if let Some(reason) = &self.unavailable {
            return Err(AudioError::MicrophoneUnavailable(reason.clone()));
        }
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(sink);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.slot.lock().take();
    }

    fn is_running(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn take_error(&mut self) -> Option<AudioError> {
        self.errors.lock().pop_front()
    }
}

impl ManualCaptureHandle {
    /// Deliver one frame; false if capture is stopped or the frame was dropped
    pub fn push_frame(&self, frame: AudioFrame) -> bool {
        match self.slot.lock().as_mut() {
            Some(sink) => sink.push_frame(frame),
            None => false,
        }
    }

    /// Deliver raw float samples
    pub fn push_samples(&self, data: &[f32]) -> bool {
        match self.slot.lock().as_mut() {
            Some(sink) => {
                sink.push_samples(data);
                true
            }
            None => false,
        }
    }

    /// Report a stream error, as a device unplugged mid-capture would
    pub fn report_error(&self, error: AudioError) {
        self.errors.lock().push_back(error);
    }
}
