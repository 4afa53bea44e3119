//! Audio Performance Benchmarks
//!
//! For real-time audio, a block of samples must be produced before the
//! next block is due. The time budget is `block_size / sample_rate`.
//!
//! | Sample Rate | Block 64  | Block 128 | Block 256 | Block 512 |
//! |-------------|-----------|-----------|-----------|-----------|
//! | 44.1 kHz    | 1.45 ms   | 2.90 ms   | 5.80 ms   | 11.61 ms  |
//! | 48 kHz      | 1.33 ms   | 2.67 ms   | 5.33 ms   | 10.67 ms  |
//! | 96 kHz      | 0.67 ms   | 1.33 ms   | 2.67 ms   | 5.33 ms   |
//!
//! These benchmarks validate the full chain (tone generator → vibrato →
//! overdrive → reverb → whirl) stays well under budget.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tonewheel_engine::patch::{DrawbarPatch, Program};
use tonewheel_engine::prelude::*;
use tonewheel_engine::{key_on_event, EngineConfig};

const SAMPLE_RATES: [f64; 3] = [44100.0, 48000.0, 96000.0];
const BLOCK_SIZES: [usize; 4] = [64, 128, 256, 512];

fn build_playing_engine(sample_rate: f64, block_size: usize, chord_size: usize) -> Engine {
    let config = EngineConfig {
        sample_rate,
        block_size,
        oscillator: OscillatorConfig {
            sample_rate,
            ..OscillatorConfig::default()
        },
        ..EngineConfig::default()
    };
    let mut engine = Engine::build(&config).expect("engine builds");

    let mut program = Program::default();
    program.upper_drawbars = DrawbarPatch {
        positions: [8, 8, 8, 0, 0, 0, 0, 0, 0],
    };
    engine.load_program(&program);

    for key in 0..chord_size {
        engine
            .message_queue()
            .push(key_on_event(Manual::Upper, 24 + key));
    }
    engine
}

fn bench_full_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_process_block");
    for &sr in &SAMPLE_RATES {
        for &block_size in &BLOCK_SIZES {
            let mut engine = build_playing_engine(sr, block_size, 6);
            let mut left = vec![0.0f32; block_size];
            let mut right = vec![0.0f32; block_size];
            // prime the first block so the queued key-on events are applied
            engine.process_block(&mut left, &mut right);

            group.throughput(Throughput::Elements(block_size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("sr_{sr}"), block_size),
                &block_size,
                |b, _| {
                    b.iter(|| {
                        engine.process_block(black_box(&mut left), black_box(&mut right));
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_polyphony_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_chord_size");
    for chord in [1usize, 6, 13, 25] {
        let mut engine = build_playing_engine(48000.0, 128, chord);
        let mut left = vec![0.0f32; 128];
        let mut right = vec![0.0f32; 128];
        engine.process_block(&mut left, &mut right);

        group.bench_with_input(BenchmarkId::from_parameter(chord), &chord, |b, _| {
            b.iter(|| {
                engine.process_block(black_box(&mut left), black_box(&mut right));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_full_chain, bench_polyphony_scaling);
criterion_main!(benches);
