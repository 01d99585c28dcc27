//! Benchmarks for the per-frame hot path
//!
//! Encode runs on the capture context and split on the control context, both
//! once per 4096-sample frame; decode and merge run once per received packet.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mic_broadcast::audio::AudioFrame;
use mic_broadcast::codec::{CompressionProfile, PcmDecoder, PcmEncoder};
use mic_broadcast::constants::{DEFAULT_FRAME_SIZE, DEFAULT_MTU, DEFAULT_SAMPLE_RATE};
use mic_broadcast::protocol::{merge, split};
use std::hint::black_box;

/// A 440 Hz tone at half scale
fn tone_frame() -> AudioFrame {
    let samples: Vec<f32> = (0..DEFAULT_FRAME_SIZE)
        .map(|i| 0.5 * (i as f32 * 440.0 * std::f32::consts::TAU / DEFAULT_SAMPLE_RATE as f32).sin())
        .collect();
    AudioFrame::from_f32(&samples, DEFAULT_SAMPLE_RATE, 0)
}

fn bench_encode(c: &mut Criterion) {
    let frame = tone_frame();
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(frame.len() as u64));

    for profile in CompressionProfile::ALL {
        group.bench_with_input(BenchmarkId::from_parameter(profile), &profile, |b, &profile| {
            let mut encoder = PcmEncoder::new();
            b.iter(|| black_box(encoder.encode(black_box(&frame), profile)))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = tone_frame();
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(frame.len() as u64));

    for profile in CompressionProfile::ALL {
        let packet = PcmEncoder::new().encode(&frame, profile);
        group.bench_with_input(BenchmarkId::from_parameter(profile), &packet, |b, packet| {
            let mut decoder = PcmDecoder::new(DEFAULT_SAMPLE_RATE);
            b.iter(|| black_box(decoder.decode(black_box(packet))))
        });
    }

    group.finish();
}

fn bench_split_merge(c: &mut Criterion) {
    let frame = tone_frame();
    let mut group = c.benchmark_group("chunking");

    for profile in CompressionProfile::ALL {
        let packet = PcmEncoder::new().encode(&frame, profile);
        group.throughput(Throughput::Bytes(packet.len() as u64));

        group.bench_with_input(BenchmarkId::new("split", profile), &packet, |b, packet| {
            b.iter(|| black_box(split(black_box(packet), DEFAULT_MTU)))
        });

        let chunks = match split(&packet, DEFAULT_MTU) {
            Ok(chunks) => chunks,
            Err(e) => panic!("split failed: {}", e),
        };
        // Worst case for ordering: every chunk arrives reversed
        let reversed: Vec<_> = chunks.into_iter().rev().collect();
        group.bench_with_input(BenchmarkId::new("merge", profile), &reversed, |b, chunks| {
            b.iter(|| black_box(merge(black_box(chunks.clone()))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_split_merge);
criterion_main!(benches);
