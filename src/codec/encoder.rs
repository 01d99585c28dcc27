//! PCM encoder
//!
//! Runs on the capture context: pure buffer transforms, no locks, no I/O.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::{CompressionProfile, EncodedPacket, PacketHeader, BYTES_PER_SAMPLE};
use crate::audio::buffer::AudioFrame;

/// Decimating, quantizing encoder with a monotonic packet counter
#[derive(Debug, Default)]
pub struct PcmEncoder {
    /// Id given to the next packet
    next_packet_id: u32,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total payload bytes produced
    bytes_produced: u64,
    /// Total input bytes at 16-bit, for the compression ratio
    bytes_consumed: u64,
}

impl PcmEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering packets at `packet_id`
    pub fn starting_at(packet_id: u32) -> Self {
        Self {
            next_packet_id: packet_id,
            ..Self::default()
        }
    }

    /// Encode one frame with the given profile.
    ///
    /// Never fails: every frame, including an empty one, has an encoding.
    pub fn encode(&mut self, frame: &AudioFrame, profile: CompressionProfile) -> EncodedPacket {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);

        let payload = encode_samples(frame.samples(), profile);

        self.frames_encoded += 1;
        self.bytes_produced += payload.len() as u64;
        self.bytes_consumed += (frame.len() * BYTES_PER_SAMPLE) as u64;

        EncodedPacket {
            header: PacketHeader {
                packet_id,
                profile,
                original_sample_count: frame.len() as u32,
            },
            payload,
        }
    }

    /// Id the next packet will carry
    pub fn next_packet_id(&self) -> u32 {
        self.next_packet_id
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
            compression_ratio: if self.bytes_produced > 0 {
                self.bytes_consumed as f32 / self.bytes_produced as f32
            } else {
                1.0
            },
        }
    }

    /// Reset statistics
    pub fn reset_stats(&mut self) {
        self.frames_encoded = 0;
        self.bytes_produced = 0;
        self.bytes_consumed = 0;
    }
}

/// Keep every Nth sample, round to the profile's step, write little-endian
pub fn encode_samples(samples: &[i16], profile: CompressionProfile) -> Bytes {
    let factor = profile.decimation_factor();
    let step = profile.quantization_step();

    let mut buf = BytesMut::with_capacity(profile.kept_samples(samples.len()) * BYTES_PER_SAMPLE);
    for &sample in samples.iter().step_by(factor) {
        buf.put_i16_le(quantize_step(sample, step));
    }
    buf.freeze()
}

fn quantize_step(sample: i16, step: i32) -> i16 {
    if step <= 1 {
        return sample;
    }
    let rounded = (sample as i32 + step / 2).div_euclid(step) * step;
    rounded.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Encoder statistics
#[derive(Debug, Clone, Serialize)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
    pub compression_ratio: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<i16>) -> AudioFrame {
        AudioFrame::new(samples, 48000, 0)
    }

    #[test]
    fn test_packet_ids_are_monotonic() {
        let mut encoder = PcmEncoder::new();
        let f = frame(vec![0; 16]);
        let a = encoder.encode(&f, CompressionProfile::None);
        let b = encoder.encode(&f, CompressionProfile::High);
        assert_eq!(a.packet_id(), 0);
        assert_eq!(b.packet_id(), 1);
        assert_eq!(encoder.next_packet_id(), 2);
    }

    #[test]
    fn test_medium_halves_samples() {
        let mut encoder = PcmEncoder::new();
        let f = frame((0..4096).map(|i| i as i16).collect());
        let packet = encoder.encode(&f, CompressionProfile::Medium);
        assert_eq!(packet.header.original_sample_count, 4096);
        assert_eq!(packet.len(), 2048 * 2);
    }

    #[test]
    fn test_decimation_keeps_every_nth_sample() {
        let payload = encode_samples(&[10, 20, 30, 40, 50], CompressionProfile::High);
        assert_eq!(&payload[..], &[10u8, 0, 50, 0]);
    }

    #[test]
    fn test_low_profile_rounds_to_step() {
        let payload = encode_samples(&[5, -5, 32767, -32768], CompressionProfile::Low);
        let values: Vec<i16> = payload
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(values, vec![4, -4, 32767, -32768]);
    }

    #[test]
    fn test_empty_frame_encodes() {
        let mut encoder = PcmEncoder::new();
        let packet = encoder.encode(&frame(vec![]), CompressionProfile::High);
        assert!(packet.is_empty());
        assert_eq!(packet.header.original_sample_count, 0);
    }

    #[test]
    fn test_stats() {
        let mut encoder = PcmEncoder::new();
        let f = frame(vec![1; 400]);
        encoder.encode(&f, CompressionProfile::High);
        let stats = encoder.stats();
        assert_eq!(stats.frames_encoded, 1);
        assert_eq!(stats.bytes_produced, 200);
        assert!((stats.compression_ratio - 4.0).abs() < 1e-6);

        encoder.reset_stats();
        assert_eq!(encoder.stats().frames_encoded, 0);
    }
}
