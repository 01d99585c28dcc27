//! Audio frames, the lock-free render ring and the playback jitter buffer
//!
//! The ring buffer is the only structure shared with the real-time render
//! callback; the jitter buffer lives on the control context.

use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::codec::quantize;

/// Immutable block of mono 16-bit samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
    /// Monotonic sequence (capture counter, or packet id after decode)
    sequence: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, sequence: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            sequence,
        }
    }

    /// Quantize floating-point capture data
    pub fn from_f32(samples: &[f32], sample_rate: u32, sequence: u32) -> Self {
        Self::new(
            samples.iter().map(|&s| quantize(s)).collect(),
            sample_rate,
            sequence,
        )
    }

    /// A silent frame of `len` samples
    pub fn silence(len: usize, sample_rate: u32, sequence: u32) -> Self {
        Self::new(vec![0; len], sample_rate, sequence)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Mono only
    pub fn channels(&self) -> u16 {
        crate::constants::CHANNELS
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Same samples, new sequence number
    pub fn with_sequence(&self, sequence: u32) -> Self {
        Self {
            samples: Arc::clone(&self.samples),
            sample_rate: self.sample_rate,
            sequence,
        }
    }

    /// Get frame duration in microseconds
    pub fn duration_us(&self) -> u64 {
        (self.len() as u64 * 1_000_000) / self.sample_rate.max(1) as u64
    }
}

/// Lock-free ring buffer for audio frames
pub struct RingBuffer {
    queue: ArrayQueue<AudioFrame>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl RingBuffer {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame into the buffer
    /// Returns false if buffer is full (overflow)
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop a frame from the buffer
    /// Returns None if buffer is empty (underrun)
    pub fn pop(&self) -> Option<AudioFrame> {
        match self.queue.pop() {
            Some(frame) => Some(frame),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            queued: self.queue.len(),
            overflows: self.overflow_count.load(Ordering::Relaxed),
            underruns: self.underrun_count.load(Ordering::Relaxed),
        }
    }
}

/// Render ring counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingStats {
    pub queued: usize,
    pub overflows: usize,
    pub underruns: usize,
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}

/// Outcome of inserting into the jitter buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Buffered,
    /// Older than the last frame handed to playback
    Late,
    Duplicate,
    /// Buffer was full; the oldest buffered frame was dropped to make room
    Overflowed { dropped: u32 },
}

/// Jitter buffer releasing frames in packet id order
pub struct JitterBuffer {
    frames: BTreeMap<u32, AudioFrame>,
    capacity: usize,
    /// Frames required before playback starts (and restarts after draining)
    min_delay: usize,
    max_delay: usize,
    /// Adaptive fill target, within [min_delay, max_delay]
    target_delay: usize,
    /// Last packet id handed to playback
    last_played: Option<u32>,
    /// Whether the prefill target has been met since the last drain
    primed: bool,
    received: usize,
    late: usize,
    dropped: usize,
}

impl JitterBuffer {
    pub fn new(capacity: usize, min_delay: usize, max_delay: usize) -> Self {
        let capacity = capacity.max(1);
        let max_delay = max_delay.clamp(min_delay, capacity);
        Self {
            frames: BTreeMap::new(),
            capacity,
            min_delay,
            max_delay,
            target_delay: min_delay,
            last_played: None,
            primed: false,
            received: 0,
            late: 0,
            dropped: 0,
        }
    }

    /// Insert a decoded frame keyed by its sequence (packet id)
    pub fn insert(&mut self, frame: AudioFrame) -> InsertOutcome {
        let seq = frame.sequence();

        if self.last_played.is_some_and(|last| seq <= last) {
            self.late += 1;
            return InsertOutcome::Late;
        }
        if self.frames.contains_key(&seq) {
            return InsertOutcome::Duplicate;
        }

        self.received += 1;
        self.frames.insert(seq, frame);

        if self.frames.len() > self.capacity {
            if let Some((dropped, _)) = self.frames.pop_first() {
                self.dropped += 1;
                // Playback must not go backwards past a dropped frame
                self.last_played = Some(self.last_played.map_or(dropped, |l| l.max(dropped)));
                return InsertOutcome::Overflowed { dropped };
            }
        }
        InsertOutcome::Buffered
    }

    /// Next frame in packet order once the buffer is primed.
    ///
    /// Returns None while prefilling or when drained; draining resets the
    /// prefill requirement.
    pub fn pop(&mut self) -> Option<AudioFrame> {
        if !self.primed {
            if self.frames.len() < self.target_delay.max(1) {
                return None;
            }
            self.primed = true;
        }

        match self.frames.pop_first() {
            Some((seq, frame)) => {
                self.last_played = Some(seq);
                Some(frame)
            }
            None => {
                self.primed = false;
                None
            }
        }
    }

    /// Move the target depth from buffer health (0-100)
    pub fn adapt(&mut self, health: f64) {
        if health < 50.0 && self.target_delay < self.max_delay {
            self.target_delay += 1;
        } else if health > 90.0 && self.target_delay > self.min_delay {
            self.target_delay -= 1;
        }
    }

    /// Reset the jitter buffer
    pub fn reset(&mut self) {
        self.frames.clear();
        self.last_played = None;
        self.primed = false;
        self.target_delay = self.min_delay;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn target_delay(&self) -> usize {
        self.target_delay
    }

    /// Get statistics
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level: self.frames.len(),
            capacity: self.capacity,
            target_delay: self.target_delay,
            received: self.received,
            late: self.late,
            dropped: self.dropped,
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JitterBufferStats {
    pub level: usize,
    pub capacity: usize,
    pub target_delay: usize,
    pub received: usize,
    pub late: usize,
    pub dropped: usize,
}
