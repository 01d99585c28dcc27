//! PCM compression codec
//!
//! Frames are carried as 16-bit fixed point. A [`CompressionProfile`] picks a
//! decimation factor (applied per sample, never per byte) and a quantization
//! step; decoding restores the original frame length by sample-hold.

pub mod decoder;
pub mod encoder;

pub use decoder::{DecoderStats, PcmDecoder};
pub use encoder::{EncoderStats, PcmEncoder};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes per encoded sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Quality/size tradeoff selected per packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionProfile {
    None = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl CompressionProfile {
    pub const ALL: [CompressionProfile; 4] = [
        CompressionProfile::None,
        CompressionProfile::Low,
        CompressionProfile::Medium,
        CompressionProfile::High,
    ];

    /// Keep every Nth sample
    pub fn decimation_factor(self) -> usize {
        match self {
            CompressionProfile::None | CompressionProfile::Low => 1,
            CompressionProfile::Medium => 2,
            CompressionProfile::High => 4,
        }
    }

    /// Fixed-point values are rounded to a multiple of this step
    pub fn quantization_step(self) -> i32 {
        match self {
            CompressionProfile::Low => 4,
            _ => 1,
        }
    }

    /// Number of samples kept from a frame of `original` samples
    pub fn kept_samples(self, original: usize) -> usize {
        original.div_ceil(self.decimation_factor())
    }

    /// The next profile trading quality for size, if any
    pub fn next_lower_quality(self) -> Option<CompressionProfile> {
        match self {
            CompressionProfile::None => Some(CompressionProfile::Low),
            CompressionProfile::Low => Some(CompressionProfile::Medium),
            CompressionProfile::Medium => Some(CompressionProfile::High),
            CompressionProfile::High => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionProfile::None),
            1 => Some(CompressionProfile::Low),
            2 => Some(CompressionProfile::Medium),
            3 => Some(CompressionProfile::High),
            _ => None,
        }
    }
}

impl Default for CompressionProfile {
    fn default() -> Self {
        CompressionProfile::Medium
    }
}

impl fmt::Display for CompressionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionProfile::None => "none",
            CompressionProfile::Low => "low",
            CompressionProfile::Medium => "medium",
            CompressionProfile::High => "high",
        };
        f.write_str(name)
    }
}

/// Packet header fields that travel with every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_id: u32,
    pub profile: CompressionProfile,
    pub original_sample_count: u32,
}

/// One encoded audio frame before fragmentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl EncodedPacket {
    pub fn packet_id(&self) -> u32 {
        self.header.packet_id
    }

    pub fn profile(&self) -> CompressionProfile {
        self.header.profile
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Clamp to [-1.0, 1.0] and scale to i16.
///
/// The negative side scales by 32768 and the positive side by 32767, so
/// `dequantize(quantize(x))` is the identity on every value `dequantize` can
/// produce.
pub fn quantize(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Inverse of [`quantize`]
pub fn dequantize(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_extremes() {
        assert_eq!(quantize(1.0), i16::MAX);
        assert_eq!(quantize(-1.0), i16::MIN);
        assert_eq!(quantize(2.5), i16::MAX);
        assert_eq!(quantize(-7.0), i16::MIN);
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn test_dequantize_inverts_quantize() {
        for value in [i16::MIN, -16384, -1, 0, 1, 12345, i16::MAX] {
            assert_eq!(quantize(dequantize(value)), value);
        }
    }

    #[test]
    fn test_profile_factors() {
        let factors: Vec<usize> = CompressionProfile::ALL
            .iter()
            .map(|p| p.decimation_factor())
            .collect();
        assert_eq!(factors, vec![1, 1, 2, 4]);
        assert_eq!(CompressionProfile::Medium.kept_samples(4096), 2048);
        assert_eq!(CompressionProfile::High.kept_samples(10), 3);
    }

    #[test]
    fn test_profile_u8() {
        for profile in CompressionProfile::ALL {
            assert_eq!(CompressionProfile::from_u8(profile.as_u8()), Some(profile));
        }
        assert_eq!(CompressionProfile::from_u8(9), None);
    }

    #[test]
    fn test_next_lower_quality_terminates() {
        let mut profile = CompressionProfile::None;
        let mut steps = 0;
        while let Some(next) = profile.next_lower_quality() {
            profile = next;
            steps += 1;
        }
        assert_eq!(profile, CompressionProfile::High);
        assert_eq!(steps, 3);
    }
}
