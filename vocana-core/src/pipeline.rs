//! # Pipeline Coordinator
//!
//! Per-stream composition of the buffer manager, transform engine, feature
//! extractors and inference orchestrator:
//!
//! ```text
//! ingest -> buffer -> forward -> features -> orchestrator -> inverse -> output
//! ```
//!
//! The pipeline owns the stream's only live `RecurrentState` and threads it
//! through the orchestrator frame by frame.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::buffer::{BufferManager, Ingest};
use crate::config::Config;
use crate::error::{Result, VocanaError};
use crate::events::{DegradationKind, DegradationLog, DEFAULT_EVENT_CAPACITY};
use crate::features::{
    ErbExtractor, ErbFilterbank, Extraction, FeatureExtractor, SpectralExtractor, SpectralStats,
};
use crate::inference::{CancelSignal, InferenceClient};
use crate::orchestrator::{FrameFeatures, FrameOutcome, Orchestrator, RecurrentState};
use crate::telemetry::StreamTelemetry;
use crate::transform::{AnalysisFrame, SpectrumFrame, SynthesisState, TransformEngine};

/// What one `ingest` call produced
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutput {
    /// Reconstructed samples, one hop per completed frame
    Processed(Vec<f32>),
    /// Not enough samples for a frame yet
    Buffering,
    /// Circuit breaker open; the caller should pass audio through
    Suspended,
    /// Batch contained non-finite samples and was dropped
    Rejected,
}

pub struct Pipeline {
    stream_id: u64,
    engine: Arc<TransformEngine>,
    buffer: BufferManager,
    synthesis: SynthesisState,
    erb: ErbExtractor,
    spectral: SpectralExtractor,
    orchestrator: Orchestrator,
    state: Option<RecurrentState>,
    telemetry: Arc<StreamTelemetry>,
    events: DegradationLog,
    frame_index: u64,
    last_stats: Option<SpectralStats>,
    closed: bool,
}

impl Pipeline {
    pub fn new(
        stream_id: u64,
        config: &Config,
        engine: Arc<TransformEngine>,
        client: InferenceClient,
        cancel: CancelSignal,
    ) -> Result<Self> {
        config.validate()?;
        if engine.fft_size() != config.stream.fft_size || engine.hop_size() != config.stream.hop_size {
            return Err(VocanaError::config(
                "stream",
                format!("fft={} hop={}", config.stream.fft_size, config.stream.hop_size),
                "transform engine was built for a different geometry",
            ));
        }

        let bank = Arc::new(ErbFilterbank::new(
            config.stream.sample_rate,
            config.stream.fft_size,
            config.features.erb_band_count,
        )?);
        let orchestrator = Orchestrator::new(config, Arc::clone(&bank), client, cancel)?;
        let state = orchestrator.initial_state();

        info!(
            "Stream {} pipeline ready: {} Hz, fft={}, hop={}, latency={} samples",
            stream_id,
            config.stream.sample_rate,
            engine.fft_size(),
            engine.hop_size(),
            engine.latency_samples()
        );

        Ok(Self {
            stream_id,
            buffer: BufferManager::new(&config.stream, &config.buffer)?,
            synthesis: engine.new_synthesis_state(),
            erb: ErbExtractor::new(bank, &config.features),
            spectral: SpectralExtractor::new(
                config.stream.sample_rate,
                config.stream.fft_size,
                &config.features,
            ),
            orchestrator,
            state: Some(state),
            telemetry: StreamTelemetry::new(stream_id),
            events: DegradationLog::new(stream_id, DEFAULT_EVENT_CAPACITY),
            frame_index: 0,
            last_stats: None,
            closed: false,
            engine,
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn telemetry(&self) -> Arc<StreamTelemetry> {
        Arc::clone(&self.telemetry)
    }

    pub fn events(&self) -> DegradationLog {
        self.events.clone()
    }

    /// Delay from input to output in samples
    pub fn latency_samples(&self) -> usize {
        self.engine.latency_samples()
    }

    pub fn recurrent_state(&self) -> Option<&RecurrentState> {
        self.state.as_ref()
    }

    pub fn last_stats(&self) -> Option<&SpectralStats> {
        self.last_stats.as_ref()
    }

    pub fn inference_failures(&self) -> u64 {
        self.orchestrator.failures()
    }

    pub fn ingest(&mut self, samples: &[f32]) -> Result<IngestOutput> {
        self.ingest_at(samples, Instant::now())
    }

    /// Ingest with an explicit clock reading for the circuit breaker
    pub fn ingest_at(&mut self, samples: &[f32], now: Instant) -> Result<IngestOutput> {
        if self.closed {
            return Err(VocanaError::StreamClosed);
        }

        let frames = match self.buffer.append_at(samples, now) {
            Ok(Ingest::Ready { frames, overflow }) => {
                if let Some(info) = overflow {
                    self.telemetry.record_overflow();
                    self.events.record(
                        self.frame_index,
                        DegradationKind::Overflow,
                        format!(
                            "projected {} samples, dropped {} ({} consecutive)",
                            info.projected, info.dropped, info.consecutive
                        ),
                    );
                }
                frames
            }
            Ok(Ingest::Suspended { until, tripped_now }) => {
                if tripped_now {
                    self.telemetry.record_overflow();
                    self.telemetry.record_breaker_trip();
                    self.events.record(
                        self.frame_index,
                        DegradationKind::BreakerTripped,
                        format!(
                            "suspended for {:?}",
                            until.saturating_duration_since(now)
                        ),
                    );
                }
                return Ok(IngestOutput::Suspended);
            }
            Err(e) => {
                self.telemetry.record_rejected_batch();
                self.events
                    .record(self.frame_index, DegradationKind::InputRejected, e.to_string());
                return Ok(IngestOutput::Rejected);
            }
        };

        if frames.is_empty() {
            return Ok(IngestOutput::Buffering);
        }

        let mut output = Vec::with_capacity(frames.len() * self.engine.hop_size());
        for frame in &frames {
            self.process_frame(frame, &mut output)?;
        }
        Ok(IngestOutput::Processed(output))
    }

    fn process_frame(&mut self, frame: &AnalysisFrame, output: &mut Vec<f32>) -> Result<()> {
        let started = Instant::now();
        let hop = self.engine.hop_size();

        let spectrum = match self.engine.forward(frame) {
            Ok(spectrum) => spectrum,
            Err(e) => {
                self.events
                    .record(self.frame_index, DegradationKind::InputRejected, e.to_string());
                // Silence for this frame while the pending overlap drains
                let silence = SpectrumFrame::zeros(self.engine.freq_bins());
                if self
                    .engine
                    .inverse_into(&silence, &mut self.synthesis, output)
                    .is_err()
                {
                    output.extend(std::iter::repeat(0.0).take(hop));
                }
                self.frame_index += 1;
                return Ok(());
            }
        };

        let erb = self.erb.extract(&spectrum);
        self.note_substitution(&erb);
        let spec = self.spectral.extract(&spectrum);
        self.note_substitution(&spec);
        self.last_stats = self.spectral.stats(&spectrum).ok();

        let features = FrameFeatures {
            erb: erb.values,
            spec: spec.values,
        };
        let state = self
            .state
            .take()
            .unwrap_or_else(|| self.orchestrator.initial_state());
        let processed = self.orchestrator.process(&features, &spectrum, state)?;
        self.state = Some(processed.state);

        if let FrameOutcome::PassThrough { error } = &processed.outcome {
            let timed_out = matches!(error, VocanaError::ResourceExhausted { .. });
            self.telemetry.record_inference_failure(timed_out);
            self.events.record(
                self.frame_index,
                DegradationKind::InferenceFallback,
                error.to_string(),
            );
        }

        let emitted = match self
            .engine
            .inverse_into(&processed.spectrum, &mut self.synthesis, output)
        {
            Ok(()) => true,
            Err(e) => {
                self.events.record(
                    self.frame_index,
                    DegradationKind::InferenceFallback,
                    format!("synthesis failed, emitting unfiltered frame: {}", e),
                );
                self.engine
                    .inverse_into(&spectrum, &mut self.synthesis, output)
                    .is_ok()
            }
        };
        if !emitted {
            output.extend(std::iter::repeat(0.0).take(hop));
        }

        let latency_us = started.elapsed().as_micros() as u64;
        self.telemetry.record_frame(latency_us);
        debug!(
            "stream {} frame {} processed in {}us",
            self.stream_id, self.frame_index, latency_us
        );
        self.frame_index += 1;
        Ok(())
    }

    fn note_substitution(&mut self, extraction: &Extraction) {
        if let Some(error) = &extraction.substituted {
            self.telemetry.record_feature_substitution();
            self.events.record(
                self.frame_index,
                DegradationKind::FeatureSubstituted,
                error.to_string(),
            );
        }
    }

    /// Tear down: release buffered samples and recurrent state
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.orchestrator.close();
        self.buffer.clear();
        self.state = None;
        info!("Stream {} closed after {} frames", self.stream_id, self.frame_index);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{InferenceHost, MockSession, ModelShape};

    fn pipeline(config: &Config) -> (InferenceHost, Pipeline) {
        let engine = Arc::new(TransformEngine::new(&config.stream).unwrap());
        let host = InferenceHost::spawn(
            Box::new(MockSession::new(ModelShape::from_config(config))),
            config.inference.queue_depth,
        )
        .unwrap();
        let pipeline = Pipeline::new(0, config, engine, host.client(), CancelSignal::never()).unwrap();
        (host, pipeline)
    }

    fn relaxed() -> Config {
        let mut config = Config::balanced();
        config.inference.timeout_ms = 1000;
        config
    }

    #[test]
    fn test_buffering_then_processed() {
        let (_host, mut pipeline) = pipeline(&relaxed());
        assert_eq!(pipeline.ingest(&[0.0; 100]).unwrap(), IngestOutput::Buffering);

        match pipeline.ingest(&[0.0; 400]).unwrap() {
            IngestOutput::Processed(out) => assert_eq!(out.len(), 480),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pipeline.telemetry().frames_processed(), 1);
        assert!(pipeline.last_stats().is_some());
    }

    #[test]
    fn test_rejected_batch_is_counted() {
        let (_host, mut pipeline) = pipeline(&relaxed());
        let out = pipeline.ingest(&[f32::INFINITY; 10]).unwrap();
        assert_eq!(out, IngestOutput::Rejected);
        assert_eq!(pipeline.telemetry().rejected_batches(), 1);
        assert_eq!(pipeline.events().count(DegradationKind::InputRejected), 1);
    }

    #[test]
    fn test_closed_pipeline_rejects_ingest() {
        let (_host, mut pipeline) = pipeline(&relaxed());
        pipeline.close();
        assert!(pipeline.recurrent_state().is_none());
        assert_eq!(pipeline.ingest(&[0.0; 480]).unwrap_err(), VocanaError::StreamClosed);
    }

    #[test]
    fn test_mismatched_engine_is_rejected() {
        let config = relaxed();
        let engine = Arc::new(TransformEngine::new(&Config::low_latency().stream).unwrap());
        let host = InferenceHost::spawn(
            Box::new(MockSession::new(ModelShape::from_config(&config))),
            4,
        )
        .unwrap();
        assert!(Pipeline::new(0, &config, engine, host.client(), CancelSignal::never()).is_err());
    }
}
