//! Per-frame latency benchmarks for the Vocana signal path
//!
//! Run with: cargo bench --bench latency

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use vocana_core::features::{ErbExtractor, ErbFilterbank, FeatureExtractor, SpectralExtractor};
use vocana_core::inference::{CancelSignal, InferenceHost, MockSession, ModelShape};
use vocana_core::{AnalysisFrame, Config, Pipeline, TransformEngine};

fn sine(len: usize, sample_rate: u32) -> Vec<f32> {
    (0..len)
        .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin())
        .collect()
}

fn transform_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform");

    for profile in ["balanced", "low_latency"].iter() {
        let config = Config::load(profile).unwrap();
        let engine = TransformEngine::new(&config.stream).unwrap();
        let frame = AnalysisFrame::new(sine(engine.fft_size(), config.stream.sample_rate));
        let mut state = engine.new_synthesis_state();
        let mut out = Vec::with_capacity(engine.hop_size());

        group.bench_with_input(BenchmarkId::new("forward_inverse", profile), profile, |b, _| {
            b.iter(|| {
                let spectrum = engine.forward(black_box(&frame)).unwrap();
                out.clear();
                engine.inverse_into(&spectrum, &mut state, &mut out).unwrap();
                black_box(&out);
            });
        });
    }

    group.finish();
}

fn feature_benchmark(c: &mut Criterion) {
    let config = Config::balanced();
    let engine = TransformEngine::new(&config.stream).unwrap();
    let frame = AnalysisFrame::new(sine(engine.fft_size(), config.stream.sample_rate));
    let spectrum = engine.forward(&frame).unwrap();

    let bank = Arc::new(
        ErbFilterbank::new(
            config.stream.sample_rate,
            config.stream.fft_size,
            config.features.erb_band_count,
        )
        .unwrap(),
    );
    let mut erb = ErbExtractor::new(bank, &config.features);
    let mut spectral =
        SpectralExtractor::new(config.stream.sample_rate, config.stream.fft_size, &config.features);

    c.bench_function("features_erb", |b| b.iter(|| black_box(erb.extract(&spectrum))));
    c.bench_function("features_spectral", |b| {
        b.iter(|| black_box(spectral.extract(&spectrum)))
    });
}

fn pipeline_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");

    for profile in ["balanced", "low_latency"].iter() {
        let mut config = Config::load(profile).unwrap();
        config.inference.timeout_ms = 1000;
        let engine = Arc::new(TransformEngine::new(&config.stream).unwrap());
        let host = InferenceHost::spawn(
            Box::new(MockSession::new(ModelShape::from_config(&config))),
            config.inference.queue_depth,
        )
        .unwrap();
        let mut pipeline =
            Pipeline::new(0, &config, engine, host.client(), CancelSignal::never()).unwrap();
        let hop = sine(config.stream.hop_size, config.stream.sample_rate);

        group.bench_with_input(BenchmarkId::new("ingest_hop", profile), profile, |b, _| {
            b.iter(|| {
                black_box(pipeline.ingest(black_box(&hop)).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, transform_benchmark, feature_benchmark, pipeline_benchmark);
criterion_main!(benches);
