//! End-to-end properties of the streaming signal path.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vocana_core::features::ErbFilterbank;
use vocana_core::inference::{
    CancelSignal, InferenceHost, InferenceSession, MockSession, ModelShape, Stage, Tensor,
    TensorMap, DF_COEFS, GAIN_MASK,
};
use vocana_core::{
    Config, DegradationKind, FrameFeatures, FrameOutcome, IngestOutput, Orchestrator, Pipeline,
    SpectrumFrame, TransformEngine, VocanaError,
};

fn relaxed_config() -> Config {
    let mut config = Config::balanced();
    config.inference.timeout_ms = 2000;
    config
}

fn spawn_host(config: &Config, session: Box<dyn InferenceSession>) -> InferenceHost {
    InferenceHost::spawn(session, config.inference.queue_depth).unwrap()
}

fn mock_host(config: &Config) -> InferenceHost {
    spawn_host(config, Box::new(MockSession::new(ModelShape::from_config(config))))
}

fn new_pipeline(config: &Config, host: &InferenceHost) -> Pipeline {
    let engine = Arc::new(TransformEngine::new(&config.stream).unwrap());
    Pipeline::new(1, config, engine, host.client(), CancelSignal::never()).unwrap()
}

/// Feed `signal` one hop at a time and collect every emitted sample
fn run_stream(pipeline: &mut Pipeline, signal: &[f32], hop: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(signal.len());
    for batch in signal.chunks(hop) {
        if let IngestOutput::Processed(samples) = pipeline.ingest(batch).unwrap() {
            out.extend(samples);
        }
    }
    out
}

fn rms(x: &[f32]) -> f32 {
    (x.iter().map(|s| s * s).sum::<f32>() / x.len() as f32).sqrt()
}

struct AlwaysFails;

impl InferenceSession for AlwaysFails {
    fn run(&mut self, stage: Stage, _inputs: &TensorMap) -> vocana_core::Result<TensorMap> {
        Err(VocanaError::InferenceRuntime {
            stage: stage.name().to_string(),
            reason: "model unavailable".to_string(),
        })
    }

    fn backend(&self) -> &str {
        "always-fails"
    }
}

/// Identity model whose ERB decoder returns gains far outside [0, 1]
struct Overdriven(MockSession);

impl InferenceSession for Overdriven {
    fn run(&mut self, stage: Stage, inputs: &TensorMap) -> vocana_core::Result<TensorMap> {
        let mut out = self.0.run(stage, inputs)?;
        if stage == Stage::ErbDecoder {
            let mask = &out[GAIN_MASK];
            let wild: Vec<f32> = (0..mask.numel())
                .map(|i| if i % 2 == 0 { 4.0 } else { -2.0 })
                .collect();
            let tensor = Tensor::new(mask.shape().to_vec(), wild)?;
            out.insert(GAIN_MASK.to_string(), Arc::new(tensor));
        }
        Ok(out)
    }

    fn backend(&self) -> &str {
        "overdriven"
    }
}

/// Identity model whose deep-filter decoder emits NaN coefficients
struct NanCoefs(MockSession);

impl InferenceSession for NanCoefs {
    fn run(&mut self, stage: Stage, inputs: &TensorMap) -> vocana_core::Result<TensorMap> {
        let mut out = self.0.run(stage, inputs)?;
        if stage == Stage::DeepFilterDecoder {
            let coefs = &out[DF_COEFS];
            let tensor = Tensor::new(coefs.shape().to_vec(), vec![f32::NAN; coefs.numel()])?;
            out.insert(DF_COEFS.to_string(), Arc::new(tensor));
        }
        Ok(out)
    }

    fn backend(&self) -> &str {
        "nan-coefs"
    }
}

/// Every output sample is the input delayed by the pipeline latency
fn assert_pass_through(pipeline: &Pipeline, signal: &[f32], out: &[f32]) {
    let delay = pipeline.latency_samples();
    assert_eq!(out.len(), signal.len());
    for i in delay..out.len() {
        assert!(
            (out[i] - signal[i - delay]).abs() < 1e-4,
            "sample {} expected {} got {}",
            i,
            signal[i - delay],
            out[i]
        );
    }
}

#[test]
fn identity_model_reconstructs_noise_after_latency() {
    let config = relaxed_config();
    let host = mock_host(&config);
    let mut pipeline = new_pipeline(&config, &host);
    let hop = config.stream.hop_size;
    let delay = pipeline.latency_samples();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let signal: Vec<f32> = (0..hop * 40).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let out = run_stream(&mut pipeline, &signal, hop);

    assert_eq!(out.len(), signal.len());
    for i in delay..out.len() {
        assert!(
            (out[i] - signal[i - delay]).abs() < 1e-3,
            "sample {} expected {} got {}",
            i,
            signal[i - delay],
            out[i]
        );
    }
    assert_eq!(pipeline.inference_failures(), 0);
}

#[test]
fn silence_in_gives_silence_out() {
    let config = relaxed_config();
    let host = mock_host(&config);
    let mut pipeline = new_pipeline(&config, &host);

    let out = run_stream(&mut pipeline, &vec![0.0; 480 * 12], 480);
    assert_eq!(out.len(), 480 * 12);
    assert!(out.iter().all(|&s| s == 0.0));
}

#[test]
fn sine_energy_preserved_through_identity_model() {
    let config = relaxed_config();
    let host = mock_host(&config);
    let mut pipeline = new_pipeline(&config, &host);
    let hop = config.stream.hop_size;
    let delay = pipeline.latency_samples();

    let sr = config.stream.sample_rate as f32;
    let signal: Vec<f32> = (0..hop * 10)
        .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / sr).sin())
        .collect();
    let out = run_stream(&mut pipeline, &signal, hop);

    let steady_out = &out[delay..];
    let steady_in = &signal[..signal.len() - delay];
    let ratio = rms(steady_out) / rms(steady_in);
    assert!((ratio - 1.0).abs() < 0.1, "rms ratio {}", ratio);
}

#[test]
fn applied_gains_stay_within_unit_range() {
    let config = relaxed_config();
    let shape = ModelShape::from_config(&config);
    let host = spawn_host(&config, Box::new(Overdriven(MockSession::new(shape))));
    let bank = Arc::new(
        ErbFilterbank::new(
            config.stream.sample_rate,
            config.stream.fft_size,
            config.features.erb_band_count,
        )
        .unwrap(),
    );
    let mut orchestrator =
        Orchestrator::new(&config, bank, host.client(), CancelSignal::never()).unwrap();

    let features = FrameFeatures {
        erb: vec![0.0; shape.erb_bands],
        spec: vec![0.0; shape.df_bins * 2],
    };
    let spectrum = SpectrumFrame::from_parts(
        &vec![1.0; config.freq_bins()],
        &vec![0.0; config.freq_bins()],
    )
    .unwrap();

    let processed = orchestrator
        .process(&features, &spectrum, orchestrator.initial_state())
        .unwrap();
    assert!(matches!(
        processed.outcome,
        FrameOutcome::Enhanced {
            gains_applied: true,
            ..
        }
    ));
    assert_eq!(processed.bin_gains.len(), config.freq_bins());
    assert!(processed.bin_gains.iter().all(|g| (0.0..=1.0).contains(g)));
    // Above the deep-filter bins the output is the gained input
    for f in shape.df_bins..config.freq_bins() {
        let bin = processed.spectrum.bins()[f];
        assert!(bin.re >= 0.0 && bin.re <= 1.0 + 1e-6);
    }
}

#[test]
fn streams_sharing_a_host_do_not_leak_state() {
    let config = relaxed_config();
    let host = mock_host(&config);
    let mut a = new_pipeline(&config, &host);
    let mut b = new_pipeline(&config, &host);
    let hop = config.stream.hop_size;

    let mut rng = StdRng::seed_from_u64(7);
    let signal: Vec<f32> = (0..hop * 20).map(|_| rng.gen_range(-0.3..0.3)).collect();
    let mut other = StdRng::seed_from_u64(8);
    let distractor: Vec<f32> = (0..hop * 20).map(|_| other.gen_range(-0.9..0.9)).collect();

    // Interleave a third, unrelated stream between the two identical ones
    let mut c = new_pipeline(&config, &host);
    let mut out_a = Vec::new();
    let mut out_b = Vec::new();
    for (batch, noise) in signal.chunks(hop).zip(distractor.chunks(hop)) {
        if let IngestOutput::Processed(s) = a.ingest(batch).unwrap() {
            out_a.extend(s);
        }
        c.ingest(noise).unwrap();
        if let IngestOutput::Processed(s) = b.ingest(batch).unwrap() {
            out_b.extend(s);
        }
    }

    assert_eq!(out_a, out_b);
    assert_eq!(a.recurrent_state(), b.recurrent_state());
}

#[test]
fn circuit_breaker_trips_and_recovers() {
    let config = relaxed_config();
    let host = mock_host(&config);
    let mut pipeline = new_pipeline(&config, &host);
    let threshold = config.buffer.overflow_threshold;
    let oversized = vec![0.0f32; config.buffer.max_buffer_samples + 1200];
    let t0 = Instant::now();

    for _ in 1..threshold {
        let out = pipeline.ingest_at(&oversized, t0).unwrap();
        assert!(matches!(out, IngestOutput::Processed(_)));
    }
    assert_eq!(pipeline.ingest_at(&oversized, t0).unwrap(), IngestOutput::Suspended);

    let telemetry = pipeline.telemetry();
    assert_eq!(telemetry.breaker_trips(), 1);
    assert_eq!(telemetry.overflow_count(), u64::from(threshold));

    let during = t0 + Duration::from_millis(config.buffer.circuit_breaker_cooldown_ms / 2);
    assert_eq!(pipeline.ingest_at(&[0.0; 480], during).unwrap(), IngestOutput::Suspended);

    let after = t0 + Duration::from_millis(config.buffer.circuit_breaker_cooldown_ms + 1);
    assert!(matches!(
        pipeline.ingest_at(&[0.0; 480], after).unwrap(),
        IngestOutput::Processed(_)
    ));
    assert_eq!(telemetry.breaker_trips(), 1);
}

#[test]
fn failing_model_passes_audio_through() {
    let config = relaxed_config();
    let host = spawn_host(&config, Box::new(AlwaysFails));
    let mut pipeline = new_pipeline(&config, &host);
    let hop = config.stream.hop_size;
    let delay = pipeline.latency_samples();
    let initial = pipeline.recurrent_state().cloned();

    let mut rng = StdRng::seed_from_u64(42);
    let signal: Vec<f32> = (0..hop * 8).map(|_| rng.gen_range(-0.5..0.5)).collect();

    let mut out = Vec::new();
    let mut last_failures = 0;
    for batch in signal.chunks(hop) {
        if let IngestOutput::Processed(s) = pipeline.ingest(batch).unwrap() {
            out.extend(s);
        }
        let failures = pipeline.inference_failures();
        assert!(failures > last_failures);
        last_failures = failures;
    }

    assert_eq!(last_failures, 8);
    for i in delay..out.len() {
        assert!((out[i] - signal[i - delay]).abs() < 1e-4);
    }

    // Hidden tensors never advanced; only the filter lookback moved
    let now = pipeline.recurrent_state().unwrap();
    let initial = initial.unwrap();
    for stage in Stage::ALL {
        assert_eq!(now.slot(stage), initial.slot(stage));
    }
    assert_eq!(pipeline.telemetry().inference_failures(), 8);
}

#[test]
fn low_snr_frames_are_attenuated() {
    let config = relaxed_config();
    let shape = ModelShape::from_config(&config);
    let session = MockSession::new(shape).with_lsnr(config.inference.lsnr.min_db - 10.0);
    let calls = session.call_counter();
    let host = spawn_host(&config, Box::new(session));
    let mut pipeline = new_pipeline(&config, &host);

    let mut rng = StdRng::seed_from_u64(3);
    let signal: Vec<f32> = (0..480 * 4).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let out = run_stream(&mut pipeline, &signal, 480);

    assert!(out.iter().all(|&s| s == 0.0));
    // Only the encoder runs on attenuated frames
    assert_eq!(calls.load(Ordering::Relaxed), 4);
}

#[test]
fn huge_input_burst_stays_finite_and_recovers() {
    let config = relaxed_config();
    let host = mock_host(&config);
    let mut pipeline = new_pipeline(&config, &host);
    let hop = config.stream.hop_size;

    let mut signal = vec![1.0e38f32; hop * 6];
    signal.extend(std::iter::repeat(0.1f32).take(hop * 40));
    let out = run_stream(&mut pipeline, &signal, hop);

    assert_eq!(out.len(), signal.len());
    assert!(out.iter().all(|s| s.is_finite()));

    // Once the burst has left the analysis window the steady level returns
    for (i, s) in out.iter().enumerate().skip(hop * 10) {
        assert!((s - 0.1).abs() < 1e-3, "sample {} is {}", i, s);
    }
    assert!(pipeline.events().count(DegradationKind::InputRejected) >= 6);
    let state = pipeline.recurrent_state().unwrap();
    for tensor in Stage::ALL.iter().filter_map(|&stage| state.slot(stage)) {
        assert!(tensor.data().iter().all(|v| v.is_finite()));
    }
    assert!(state
        .lookback()
        .iter()
        .flatten()
        .all(|c| c.re.is_finite() && c.im.is_finite()));
}

#[test]
fn nan_filter_coefficients_pass_audio_through() {
    let config = relaxed_config();
    let shape = ModelShape::from_config(&config);
    let host = spawn_host(&config, Box::new(NanCoefs(MockSession::new(shape))));
    let mut pipeline = new_pipeline(&config, &host);
    let hop = config.stream.hop_size;
    let initial = pipeline.recurrent_state().cloned().unwrap();

    let mut rng = StdRng::seed_from_u64(11);
    let signal: Vec<f32> = (0..hop * 8).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let out = run_stream(&mut pipeline, &signal, hop);

    assert_pass_through(&pipeline, &signal, &out);
    assert_eq!(pipeline.inference_failures(), 8);
    assert_eq!(pipeline.events().count(DegradationKind::InferenceFallback), 8);
    let now = pipeline.recurrent_state().unwrap();
    for stage in Stage::ALL {
        assert_eq!(now.slot(stage), initial.slot(stage));
    }
}

#[test]
fn slow_model_times_out_into_pass_through() {
    let mut config = Config::balanced();
    config.inference.timeout_ms = 5;
    let shape = ModelShape::from_config(&config);
    let session = MockSession::new(shape).with_latency(Duration::from_millis(50));
    let host = spawn_host(&config, Box::new(session));
    let mut pipeline = new_pipeline(&config, &host);
    let hop = config.stream.hop_size;

    let mut rng = StdRng::seed_from_u64(21);
    let signal: Vec<f32> = (0..hop * 6).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let out = run_stream(&mut pipeline, &signal, hop);

    assert_pass_through(&pipeline, &signal, &out);
    let snapshot = pipeline.telemetry().snapshot();
    assert_eq!(snapshot.inference_failures, 6);
    assert_eq!(snapshot.inference_timeouts, 6);
}
