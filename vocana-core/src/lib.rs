//! # Vocana Core
//!
//! Streaming speech noise suppression built around a three-stage recurrent
//! deep-filter model.
//!
//! This library provides:
//! - Windowed STFT analysis and COLA-normalized overlap-add synthesis
//! - ERB band and normalized complex spectral features
//! - A recurrent inference orchestrator that passes model state by value
//! - Bounded input buffering with crossfaded overflow recovery and a circuit breaker
//! - Per-stream worker threads with non-blocking hand-off
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use vocana_core::{Config, IngestOutput, Pipeline, TransformEngine};
//! use vocana_core::inference::{CancelSignal, InferenceHost, MockSession, ModelShape};
//!
//! # fn main() -> vocana_core::Result<()> {
//! let config = Config::balanced();
//! let engine = Arc::new(TransformEngine::new(&config.stream)?);
//! let host = InferenceHost::spawn(
//!     Box::new(MockSession::new(ModelShape::from_config(&config))),
//!     config.inference.queue_depth,
//! )?;
//!
//! let mut pipeline = Pipeline::new(1, &config, engine, host.client(), CancelSignal::never())?;
//! match pipeline.ingest(&vec![0.0f32; 960])? {
//!     IngestOutput::Processed(samples) => assert_eq!(samples.len(), 960),
//!     other => println!("no output yet: {:?}", other),
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod features;
pub mod inference;
pub mod orchestrator;
pub mod pipeline;
pub mod telemetry;
pub mod transform;
pub mod worker;

pub use buffer::{BufferManager, CircuitBreakerState, Ingest, OverflowInfo};
pub use config::{
    BufferConfig, Config, FeatureConfig, InferenceConfig, LsnrConfig, ProfileConfig, StreamConfig,
    WindowKind, WorkerConfig,
};
pub use error::{Result, VocanaError};
pub use events::{DegradationEvent, DegradationKind, DegradationLog};
pub use orchestrator::{
    FrameFeatures, FrameOutcome, Orchestrator, OrchestratorState, Processed, RecurrentState,
};
pub use pipeline::{IngestOutput, Pipeline};
pub use telemetry::{StreamTelemetry, TelemetrySnapshot};
pub use transform::{AnalysisFrame, SpectrumFrame, SynthesisState, TransformEngine};
pub use worker::{StreamHandle, StreamWorker, WorkerOutput};
