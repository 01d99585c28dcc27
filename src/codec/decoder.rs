//! PCM decoder
//!
//! Rebuilds a frame of the original length by sample-hold upsampling.

use bytes::Buf;
use serde::Serialize;

use super::{CompressionProfile, EncodedPacket, BYTES_PER_SAMPLE};
use crate::audio::buffer::AudioFrame;
use crate::error::CodecError;

/// Sample-hold decoder
#[derive(Debug)]
pub struct PcmDecoder {
    sample_rate: u32,
    /// Frames decoded
    frames_decoded: u64,
    /// Packets rejected as malformed
    frames_malformed: u64,
    /// Total samples produced
    samples_produced: u64,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_decoded: 0,
            frames_malformed: 0,
            samples_produced: 0,
        }
    }

    /// Decode a packet into a frame carrying the packet id as its sequence
    pub fn decode(&mut self, packet: &EncodedPacket) -> Result<AudioFrame, CodecError> {
        let samples = match decode_samples(packet) {
            Ok(samples) => samples,
            Err(e) => {
                self.frames_malformed += 1;
                return Err(e);
            }
        };

        self.frames_decoded += 1;
        self.samples_produced += samples.len() as u64;

        Ok(AudioFrame::new(samples, self.sample_rate, packet.packet_id()))
    }

    /// Get sample rate
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_malformed: self.frames_malformed,
            samples_produced: self.samples_produced,
        }
    }
}

/// Validate the header against the payload and upsample
pub fn decode_samples(packet: &EncodedPacket) -> Result<Vec<i16>, CodecError> {
    let header = &packet.header;
    let malformed = |reason: String| CodecError::MalformedPacket {
        packet_id: header.packet_id,
        reason,
    };

    if packet.payload.len() % BYTES_PER_SAMPLE != 0 {
        return Err(malformed(format!(
            "payload length {} is not a whole number of samples",
            packet.payload.len()
        )));
    }

    let original = header.original_sample_count as usize;
    let kept = packet.payload.len() / BYTES_PER_SAMPLE;
    let expected = header.profile.kept_samples(original);
    if kept != expected {
        return Err(malformed(format!(
            "{} samples at profile {} cannot carry {} original samples (expected {})",
            kept, header.profile, original, expected
        )));
    }

    Ok(upsample(packet.payload.clone(), header.profile, original))
}

fn upsample(mut payload: impl Buf, profile: CompressionProfile, original: usize) -> Vec<i16> {
    let factor = profile.decimation_factor();
    let mut samples = Vec::with_capacity(original);
    while payload.remaining() >= BYTES_PER_SAMPLE {
        let value = payload.get_i16_le();
        let repeat = factor.min(original - samples.len());
        samples.extend(std::iter::repeat(value).take(repeat));
    }
    samples
}

/// Decoder statistics
#[derive(Debug, Clone, Serialize)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_malformed: u64,
    pub samples_produced: u64,
}
