use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use vocana_core::inference::{CancelSignal, InferenceHost, InferenceSession, MockSession, ModelShape};
use vocana_core::{
    Config, IngestOutput, Pipeline, StreamWorker, TransformEngine, VocanaError, WorkerOutput,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Built-in profile (balanced, low_latency, robust) or a config file name
    #[arg(short, long, default_value = "balanced")]
    profile: String,

    /// Explicit TOML config path; takes precedence over --profile
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    /// Print the resolved configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    #[arg(long)]
    samplerate: Option<u32>,

    #[arg(long)]
    hop: Option<usize>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Directory holding enc.onnx, erb_dec.onnx and df_dec.onnx
    #[arg(long)]
    models: Option<PathBuf>,

    /// Raw mono f32 little-endian input file
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Raw mono f32 little-endian output file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run a synthetic real-time benchmark for this many seconds
    #[arg(long)]
    bench: Option<u64>,

    /// Print file-mode telemetry as JSON when done
    #[arg(long)]
    stats: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("vocana={},vocana_core={}", level, level).into()),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load(&args.profile)?,
    }
    .with_overrides(args.samplerate, args.hop, args.timeout_ms);
    config.validate().context("Invalid configuration after overrides")?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Vocana starting");
    info!("Profile: {} ({})", config.profile.name, config.profile.description);

    let session = build_session(&args, &config)?;
    let host = InferenceHost::spawn(session, config.inference.queue_depth)?;
    let engine = Arc::new(TransformEngine::new(&config.stream)?);

    if let Some(seconds) = args.bench {
        return run_benchmark(&config, engine, &host, Duration::from_secs(seconds));
    }

    match (&args.input, &args.output) {
        (Some(input), Some(output)) => {
            process_file(&config, engine, &host, input, output, args.stats)
        }
        (None, None) => {
            info!("Nothing to do: pass --input/--output or --bench");
            Ok(())
        }
        _ => bail!("--input and --output must be given together"),
    }
}

fn build_session(args: &Args, config: &Config) -> Result<Box<dyn InferenceSession>> {
    let shape = ModelShape::from_config(config);
    match &args.models {
        #[cfg(feature = "onnx")]
        Some(dir) => {
            let threads = std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(1);
            let session = vocana_core::inference::OrtSession::load(dir, threads)
                .with_context(|| format!("Failed to load models from {:?}", dir))?;
            Ok(Box::new(session))
        }
        #[cfg(not(feature = "onnx"))]
        Some(dir) => {
            bail!(
                "Model directory {:?} given but this build has no ONNX support (enable the `onnx` feature)",
                dir
            )
        }
        None => {
            warn!("No model directory given, using the identity session");
            Ok(Box::new(MockSession::new(shape)))
        }
    }
}

fn read_samples(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    if bytes.len() % 4 != 0 {
        bail!("{:?} is not raw f32 audio ({} bytes)", path, bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn write_samples(path: &Path, samples: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))
}

/// Offline file processing, aligned so output sample `n` matches input sample `n`
fn process_file(
    config: &Config,
    engine: Arc<TransformEngine>,
    host: &InferenceHost,
    input: &Path,
    output: &Path,
    stats: bool,
) -> Result<()> {
    let samples = read_samples(input)?;
    let hop = engine.hop_size();
    let latency = engine.latency_samples();
    info!(
        "Processing {} samples ({:.2}s) from {:?}",
        samples.len(),
        samples.len() as f64 / config.stream.sample_rate as f64,
        input
    );

    let mut pipeline = Pipeline::new(0, config, engine, host.client(), CancelSignal::never())?;
    let mut enhanced = Vec::with_capacity(samples.len() + latency + hop);

    let tail = vec![0.0f32; latency + hop];
    for batch in samples.chunks(hop).chain(tail.chunks(hop)) {
        match pipeline.ingest(batch)? {
            IngestOutput::Processed(out) => enhanced.extend_from_slice(&out),
            IngestOutput::Buffering => {}
            IngestOutput::Suspended => enhanced.extend_from_slice(batch),
            IngestOutput::Rejected => enhanced.extend(std::iter::repeat(0.0).take(batch.len())),
        }
    }

    let aligned: Vec<f32> = enhanced
        .into_iter()
        .skip(latency)
        .take(samples.len())
        .collect();
    write_samples(output, &aligned)?;
    info!("Wrote {} samples to {:?}", aligned.len(), output);

    if stats {
        println!("{}", serde_json::to_string_pretty(&pipeline.telemetry().snapshot())?);
    }
    pipeline.close();
    Ok(())
}

fn run_benchmark(
    config: &Config,
    engine: Arc<TransformEngine>,
    host: &InferenceHost,
    duration: Duration,
) -> Result<()> {
    info!("Vocana streaming benchmark: {:?}", duration);

    let hop = engine.hop_size();
    let frame_period = Duration::from_secs_f64(hop as f64 / config.stream.sample_rate as f64);
    let handle = StreamWorker::spawn(config, engine, host.client())?;

    let mut phase = 0.0f32;
    let step = 2.0 * std::f32::consts::PI * 1000.0 / config.stream.sample_rate as f32;
    let started = Instant::now();
    let mut next_deadline = started;
    let mut submitted = 0u64;
    let mut backpressured = 0u64;
    let mut received = 0u64;

    while started.elapsed() < duration {
        let batch: Vec<f32> = (0..hop)
            .map(|_| {
                phase = (phase + step) % (2.0 * std::f32::consts::PI);
                0.3 * phase.sin()
            })
            .collect();

        match handle.submit(&batch) {
            Ok(()) => submitted += 1,
            Err(VocanaError::Backpressure { .. }) => backpressured += 1,
            Err(e) => return Err(e).context("Stream worker stopped during benchmark"),
        }
        while let Some(out) = handle.try_output() {
            if matches!(out, WorkerOutput::Processed(_)) {
                received += 1;
            }
        }

        next_deadline += frame_period;
        if let Some(wait) = next_deadline.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }

    let snapshot = handle.telemetry().snapshot();
    info!("Benchmark results:");
    info!("  Batches submitted: {}", submitted);
    info!("  Batches backpressured: {}", backpressured);
    info!("  Batches processed: {}", received);
    info!("  Frames processed: {}", snapshot.frames_processed);
    info!("  Average frame latency: {:.1}us", snapshot.latency.avg_us);
    info!("  P99 frame latency: {:.1}us", snapshot.latency.p99_us);
    info!("  Inference failures: {}", snapshot.inference_failures);

    let budget_us = frame_period.as_micros() as f64;
    if snapshot.latency.p99_us > budget_us {
        warn!(
            "P99 latency {:.1}us exceeds the {:.1}us hop period",
            snapshot.latency.p99_us, budget_us
        );
    } else {
        info!("Real-time capable: P99 within the {:.1}us hop period", budget_us);
    }

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    handle.close();
    Ok(())
}
