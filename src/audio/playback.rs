//! Audio rendering to the speaker
//!
//! The control context hands finished frames to a [`Render`]; the cpal
//! implementation moves them through a lock-free ring into the output
//! callback. Played frames travel back through a second queue so their
//! sample buffers are freed on the control context, never in the callback.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{create_shared_buffer, AudioFrame, SharedRingBuffer};
use crate::audio::device::{get_default_output_device, get_device_by_id, AudioDevice};
use crate::codec::dequantize;
use crate::error::AudioError;

/// Render collaborator: consumes one frame per render tick
pub trait Render: Send {
    fn start(&mut self) -> Result<(), AudioError>;

    /// Must not block
    fn on_frame_ready(&mut self, frame: &AudioFrame);

    fn stop(&mut self);
}

/// Speaker output through cpal
pub struct CpalRender {
    device_id: Option<String>,
    config: StreamConfig,
    ring: SharedRingBuffer,
    /// Frames the output callback has finished with
    spent: Arc<ArrayQueue<AudioFrame>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalRender {
    pub fn new(device_id: Option<String>, sample_rate: u32, ring_capacity: usize) -> Self {
        Self {
            device_id,
            config: StreamConfig {
                channels: crate::constants::CHANNELS,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            ring: create_shared_buffer(ring_capacity),
            // Ring contents plus the frame being played: never full
            spent: Arc::new(ArrayQueue::new(ring_capacity.max(1) + 2)),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    fn open_device(&self) -> Result<AudioDevice, AudioError> {
        match &self.device_id {
            Some(id) => get_device_by_id(id),
            None => get_default_output_device(),
        }
    }

    /// Handle to the ring counters that stays valid once boxed
    pub fn ring(&self) -> SharedRingBuffer {
        Arc::clone(&self.ring)
    }

    fn collect_spent(&self) {
        while self.spent.pop().is_some() {}
    }
}

/// Output-callback side of [`CpalRender`]
struct OutputFeed {
    ring: SharedRingBuffer,
    spent: Arc<ArrayQueue<AudioFrame>>,
    current: Option<AudioFrame>,
    cursor: usize,
}

impl OutputFeed {
    fn new(ring: SharedRingBuffer, spent: Arc<ArrayQueue<AudioFrame>>) -> Self {
        Self {
            ring,
            spent,
            current: None,
            cursor: 0,
        }
    }

    /// Fill one output buffer; silence once the ring runs dry.
    ///
    /// An empty ring is polled at most once per callback, so each starved
    /// callback counts as one ring underrun.
    fn fill(&mut self, data: &mut [f32]) {
        let mut starved = false;
        for out in data.iter_mut() {
            if !starved && self.current.as_ref().map_or(true, |f| self.cursor >= f.len()) {
                self.retire();
                self.current = self.ring.pop();
                self.cursor = 0;
                starved = self.current.is_none();
            }
            *out = match &self.current {
                Some(frame) if self.cursor < frame.len() => {
                    let value = dequantize(frame.samples()[self.cursor]);
                    self.cursor += 1;
                    value
                }
                _ => 0.0,
            };
        }
    }

    fn retire(&mut self) {
        if let Some(frame) = self.current.take() {
            // Sized to hold everything in flight
            let _ = self.spent.push(frame);
        }
    }
}

impl Render for CpalRender {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = self.open_device()?;
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = self.running.clone();
        let ring = self.ring.clone();
        let spent = self.spent.clone();
        let config = self.config.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("speaker-render".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let mut feed = OutputFeed::new(ring, spent);

                let stream = cpal_device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| feed.fill(data),
                    |err| tracing::warn!(error = %err, "output stream error"),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
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
                Err(AudioError::StreamError("render thread exited".into()))
            }
        }
    }

    fn on_frame_ready(&mut self, frame: &AudioFrame) {
        self.collect_spent();
        if !self.ring.push(frame.clone()) {
            tracing::trace!(sequence = frame.sequence(), "render ring full, frame dropped");
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.collect_spent();
    }
}

impl Drop for CpalRender {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keeps every rendered frame, for tests and offline use
#[derive(Clone, Default)]
pub struct RecordingRender {
    frames: Arc<Mutex<Vec<AudioFrame>>>,
    running: Arc<AtomicBool>,
}

impl RecordingRender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Render for RecordingRender {
    fn start(&mut self) -> Result<(), AudioError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_frame_ready(&mut self, frame: &AudioFrame) {
        self.frames.lock().push(frame.clone());
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_render() {
        let mut render = RecordingRender::new();
        let recorded = render.clone();
        render.start().unwrap();
        render.on_frame_ready(&AudioFrame::silence(4, 48000, 0));
        render.on_frame_ready(&AudioFrame::silence(4, 48000, 1));
        assert!(recorded.is_running());
        assert_eq!(recorded.frames().len(), 2);
        render.stop();
        assert!(!recorded.is_running());
    }

    fn output_feed(ring_capacity: usize) -> (OutputFeed, SharedRingBuffer, Arc<ArrayQueue<AudioFrame>>) {
        let ring = create_shared_buffer(ring_capacity);
        let spent = Arc::new(ArrayQueue::new(ring_capacity + 2));
        (OutputFeed::new(ring.clone(), spent.clone()), ring, spent)
    }

    #[test]
    fn test_output_feed_plays_frames_back_to_back() {
        let (mut feed, ring, _spent) = output_feed(4);
        ring.push(AudioFrame::new(vec![i16::MAX; 3], 48000, 0));
        ring.push(AudioFrame::new(vec![0; 2], 48000, 1));

        let mut out = [1.0f32; 7];
        feed.fill(&mut out);
        assert_eq!(&out[..3], &[1.0; 3]);
        assert_eq!(&out[3..], &[0.0; 4]);
        assert_eq!(ring.stats().underruns, 1);
    }

    #[test]
    fn test_output_feed_hands_played_frames_back() {
        let (mut feed, ring, spent) = output_feed(4);
        let frame = AudioFrame::new(vec![100; 4], 48000, 0);
        ring.push(frame.clone());

        let mut out = [0.0f32; 4];
        feed.fill(&mut out);
        assert!(spent.is_empty());
        // The next callback finds the frame used up and retires it
        feed.fill(&mut out);
        assert_eq!(spent.pop(), Some(frame));
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_starved_callback_counts_one_underrun() {
        let (mut feed, ring, _spent) = output_feed(2);
        let mut out = [0.5f32; 64];
        feed.fill(&mut out);
        feed.fill(&mut out);
        assert!(out.iter().all(|v| *v == 0.0));
        assert_eq!(ring.stats().underruns, 2);
    }
}
