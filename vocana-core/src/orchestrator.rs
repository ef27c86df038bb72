//! # Inference Orchestrator
//!
//! Drives the three model stages for one stream and applies their output:
//!
//! ```text
//! Idle -> Encoding -> ErbGainDecoding -> DeepFilterDecoding -> Applying -> Idle
//!                                                        (teardown) -> Closed
//! ```
//!
//! [`RecurrentState`] is a value: `process` takes the previous state and
//! returns the next one. Stage outputs are staged and committed only when
//! every stage succeeded, so a failed frame returns the previous hidden
//! tensors untouched and the spectrum passes through unfiltered.

use num_complex::Complex32;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::{Config, LsnrConfig};
use crate::error::{Result, VocanaError};
use crate::features::ErbFilterbank;
use crate::inference::{
    CancelSignal, InferenceClient, ModelShape, Stage, Tensor, TensorMap, DF_COEFS, EMBEDDING,
    FEAT_ERB, FEAT_SPEC, GAIN_MASK, LSNR, STATE_IN, STATE_OUT,
};
use crate::transform::SpectrumFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Encoding,
    ErbGainDecoding,
    DeepFilterDecoding,
    Applying,
    Closed,
}

/// Hidden tensors per stage plus the noisy-spectrum lookback of the deep filter
///
/// Tensors are shared behind `Arc` and replaced wholesale, never mutated, so
/// a clone handed to one call cannot observe writes made for another.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    slots: [Option<Arc<Tensor>>; 3],
    /// Last `filter_order` noisy frames over the deep-filter bins, oldest first
    lookback: Arc<VecDeque<Vec<Complex32>>>,
}

impl RecurrentState {
    /// Zero state for a fresh stream
    pub fn initial(shape: &ModelShape) -> Self {
        let slot = |stage: Stage| {
            (shape.hidden(stage) > 0).then(|| Arc::new(Tensor::zeros(shape.state_shape(stage))))
        };
        let lookback = (0..shape.filter_order)
            .map(|_| vec![Complex32::new(0.0, 0.0); shape.df_bins])
            .collect();
        Self {
            slots: [
                slot(Stage::Encoder),
                slot(Stage::ErbDecoder),
                slot(Stage::DeepFilterDecoder),
            ],
            lookback: Arc::new(lookback),
        }
    }

    pub fn slot(&self, stage: Stage) -> Option<&Arc<Tensor>> {
        self.slots[stage.index()].as_ref()
    }

    pub fn lookback(&self) -> &VecDeque<Vec<Complex32>> {
        &self.lookback
    }

    /// True if both states hold tensors of identical shapes
    pub fn same_layout(&self, other: &RecurrentState) -> bool {
        self.slots.iter().zip(other.slots.iter()).all(|(a, b)| match (a, b) {
            (Some(a), Some(b)) => a.shape() == b.shape(),
            (None, None) => true,
            _ => false,
        }) && self.lookback.len() == other.lookback.len()
    }

    fn advance_lookback(&self, noisy: &[Complex32], df_bins: usize) -> Arc<VecDeque<Vec<Complex32>>> {
        let mut next = (*self.lookback).clone();
        if next.pop_front().is_some() {
            next.push_back(noisy[..df_bins].to_vec());
        }
        Arc::new(next)
    }
}

/// Features for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameFeatures {
    pub erb: Vec<f32>,
    /// Interleaved `[re, im]` per deep-filter bin
    pub spec: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Model output applied
    Enhanced {
        lsnr: Option<f32>,
        gains_applied: bool,
        filter_applied: bool,
    },
    /// Local SNR below the floor; frame fully attenuated
    Attenuated { lsnr: f32 },
    /// Stage failure; spectrum passed through and hidden state left unchanged
    PassThrough { error: VocanaError },
}

impl FrameOutcome {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, FrameOutcome::PassThrough { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Processed {
    pub spectrum: SpectrumFrame,
    pub state: RecurrentState,
    pub outcome: FrameOutcome,
    /// Effective per-bin gain applied before deep filtering
    pub bin_gains: Vec<f32>,
}

/// Outputs of one successful run, not yet committed
struct StagedFrame {
    lsnr: Option<f32>,
    band_gains: Option<Vec<f32>>,
    coefs: Option<Vec<f32>>,
    slots: [Option<Arc<Tensor>>; 3],
}

pub struct Orchestrator {
    shape: ModelShape,
    freq_bins: usize,
    lsnr: LsnrConfig,
    timeout: Duration,
    client: InferenceClient,
    cancel: CancelSignal,
    bank: Arc<ErbFilterbank>,
    phase: OrchestratorState,
    failures: u64,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        bank: Arc<ErbFilterbank>,
        client: InferenceClient,
        cancel: CancelSignal,
    ) -> Result<Self> {
        let shape = ModelShape::from_config(config);
        let freq_bins = config.freq_bins();
        if bank.freq_bins() != freq_bins || bank.band_count() != shape.erb_bands {
            return Err(VocanaError::config(
                "erb_band_count",
                bank.band_count(),
                "filterbank does not match stream geometry",
            ));
        }
        if shape.df_bins > freq_bins {
            return Err(VocanaError::config("df_bins", shape.df_bins, "exceeds spectrum bins"));
        }
        if shape.filter_order == 0 {
            return Err(VocanaError::config("filter_order", 0, "must be positive"));
        }

        Ok(Self {
            shape,
            freq_bins,
            lsnr: config.inference.lsnr.clone(),
            timeout: Duration::from_millis(config.inference.timeout_ms),
            client,
            cancel,
            bank,
            phase: OrchestratorState::Idle,
            failures: 0,
        })
    }

    pub fn shape(&self) -> &ModelShape {
        &self.shape
    }

    pub fn initial_state(&self) -> RecurrentState {
        RecurrentState::initial(&self.shape)
    }

    pub fn phase(&self) -> OrchestratorState {
        self.phase
    }

    /// Frames that fell back to pass-through
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn close(&mut self) {
        self.phase = OrchestratorState::Closed;
    }

    /// Run all stages for one frame and apply the result
    ///
    /// Only a closed orchestrator returns `Err`; every stage failure degrades
    /// to pass-through.
    pub fn process(
        &mut self,
        features: &FrameFeatures,
        spectrum: &SpectrumFrame,
        state: RecurrentState,
    ) -> Result<Processed> {
        if self.phase == OrchestratorState::Closed {
            return Err(VocanaError::StreamClosed);
        }
        if spectrum.len() != self.freq_bins {
            let error = VocanaError::shape("orchestrator spectrum", self.freq_bins, spectrum.len());
            return Ok(self.fallback(spectrum, state, None, error));
        }
        if !spectrum.is_finite() {
            let error = VocanaError::InputValidation {
                reason: "non-finite spectrum".to_string(),
            };
            return Ok(self.fallback(spectrum, state, None, error));
        }

        let lookback = state.advance_lookback(spectrum.bins(), self.shape.df_bins);

        let staged = match self.run_stages(features, &state) {
            Ok(staged) => staged,
            Err(error) => return Ok(self.fallback(spectrum, state, Some(lookback), error)),
        };

        self.transition(OrchestratorState::Applying);
        let processed = self.apply(spectrum, staged, Arc::clone(&lookback));
        if !processed.spectrum.is_finite() {
            let error = VocanaError::runtime(
                Stage::DeepFilterDecoder.name(),
                "filtered spectrum is not finite",
            );
            return Ok(self.fallback(spectrum, state, Some(lookback), error));
        }
        self.transition(OrchestratorState::Idle);
        Ok(processed)
    }

    fn transition(&mut self, next: OrchestratorState) {
        trace!("orchestrator {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn run_stages(&mut self, features: &FrameFeatures, state: &RecurrentState) -> Result<StagedFrame> {
        let deadline = Instant::now() + self.timeout;
        let shape = self.shape;
        if features.erb.len() != shape.erb_bands {
            return Err(VocanaError::shape("feat_erb", shape.erb_bands, features.erb.len()));
        }
        if features.spec.len() != shape.df_bins * 2 {
            return Err(VocanaError::shape("feat_spec", shape.df_bins * 2, features.spec.len()));
        }

        let mut slots = state.slots.clone();

        self.transition(OrchestratorState::Encoding);
        let mut inputs = TensorMap::new();
        inputs.insert(
            FEAT_ERB.to_string(),
            Arc::new(Tensor::new(vec![1, 1, 1, shape.erb_bands], features.erb.clone())?),
        );
        inputs.insert(
            FEAT_SPEC.to_string(),
            Arc::new(Tensor::new(
                vec![1, 2, 1, shape.df_bins],
                planar_spec(&features.spec),
            )?),
        );
        let enc = self.call(Stage::Encoder, inputs, state, deadline)?;
        let emb = expect_tensor(&enc, Stage::Encoder, EMBEDDING, &shape.embedding_shape())?;
        let lsnr = match enc.get(LSNR) {
            Some(t) if t.numel() >= 1 && t.data()[0].is_finite() => Some(t.data()[0]),
            Some(_) => return Err(VocanaError::runtime(Stage::Encoder.name(), "malformed lsnr")),
            None => None,
        };
        slots[Stage::Encoder.index()] = next_slot(&enc, Stage::Encoder, state)?;

        let (run_erb, run_df) = match lsnr {
            Some(l) if l < self.lsnr.min_db => (false, false),
            Some(l) => (l <= self.lsnr.max_db_erb, l <= self.lsnr.max_db_df),
            None => (true, true),
        };

        let mut band_gains = None;
        if run_erb {
            self.transition(OrchestratorState::ErbGainDecoding);
            let mut inputs = TensorMap::new();
            inputs.insert(EMBEDDING.to_string(), Arc::clone(&emb));
            let out = self.call(Stage::ErbDecoder, inputs, state, deadline)?;
            let mask = expect_tensor(&out, Stage::ErbDecoder, GAIN_MASK, &shape.mask_shape())?;
            band_gains = Some(mask.data().iter().map(|g| g.clamp(0.0, 1.0)).collect());
            slots[Stage::ErbDecoder.index()] = next_slot(&out, Stage::ErbDecoder, state)?;
        }

        let mut coefs = None;
        if run_df {
            self.transition(OrchestratorState::DeepFilterDecoding);
            let mut inputs = TensorMap::new();
            inputs.insert(EMBEDDING.to_string(), Arc::clone(&emb));
            let out = self.call(Stage::DeepFilterDecoder, inputs, state, deadline)?;
            let taps = expect_tensor(&out, Stage::DeepFilterDecoder, DF_COEFS, &shape.coefs_shape())?;
            coefs = Some(taps.data().to_vec());
            slots[Stage::DeepFilterDecoder.index()] = next_slot(&out, Stage::DeepFilterDecoder, state)?;
        }

        Ok(StagedFrame {
            lsnr,
            band_gains,
            coefs,
            slots,
        })
    }

    fn call(
        &self,
        stage: Stage,
        mut inputs: TensorMap,
        state: &RecurrentState,
        deadline: Instant,
    ) -> Result<TensorMap> {
        if let Some(h0) = state.slot(stage) {
            inputs.insert(STATE_IN.to_string(), Arc::clone(h0));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(VocanaError::ResourceExhausted {
                stage: stage.name().to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        self.client.run(stage, inputs, remaining, &self.cancel)
    }

    fn apply(
        &self,
        spectrum: &SpectrumFrame,
        staged: StagedFrame,
        lookback: Arc<VecDeque<Vec<Complex32>>>,
    ) -> Processed {
        let shape = &self.shape;
        let mut bins = spectrum.bins().to_vec();
        let mut bin_gains = vec![1.0f32; self.freq_bins];

        let outcome = match staged.lsnr {
            Some(l) if l < self.lsnr.min_db => {
                bins.fill(Complex32::new(0.0, 0.0));
                bin_gains.fill(0.0);
                FrameOutcome::Attenuated { lsnr: l }
            }
            lsnr => {
                let gains_applied = match &staged.band_gains {
                    Some(band_gains) => self.bank.expand_gains(band_gains, &mut bin_gains).is_ok(),
                    None => false,
                };
                if gains_applied {
                    for (bin, g) in bins.iter_mut().zip(&bin_gains) {
                        *bin *= *g;
                    }
                } else {
                    bin_gains.fill(1.0);
                }

                let filter_applied = match &staged.coefs {
                    Some(coefs) => {
                        apply_deep_filter(&mut bins, &lookback, coefs, shape.df_bins, shape.filter_order);
                        true
                    }
                    None => false,
                };

                FrameOutcome::Enhanced {
                    lsnr,
                    gains_applied,
                    filter_applied,
                }
            }
        };

        debug!("frame applied: {:?}", outcome);
        Processed {
            spectrum: SpectrumFrame::new(bins),
            state: RecurrentState {
                slots: staged.slots,
                lookback,
            },
            outcome,
            bin_gains,
        }
    }

    fn fallback(
        &mut self,
        spectrum: &SpectrumFrame,
        state: RecurrentState,
        lookback: Option<Arc<VecDeque<Vec<Complex32>>>>,
        error: VocanaError,
    ) -> Processed {
        self.failures += 1;
        self.transition(OrchestratorState::Idle);
        debug!("inference fallback #{}: {}", self.failures, error);

        let state = match lookback {
            Some(lookback) => RecurrentState {
                slots: state.slots,
                lookback,
            },
            None => state,
        };
        Processed {
            bin_gains: vec![1.0; spectrum.len()],
            spectrum: spectrum.clone(),
            state,
            outcome: FrameOutcome::PassThrough { error },
        }
    }
}

/// Deep filter over the noisy lookback; overwrites the first `df_bins` bins
///
/// Coefficient layout is `[bin][tap][re, im]`; tap `order - 1` weights the
/// current frame.
fn apply_deep_filter(
    bins: &mut [Complex32],
    lookback: &VecDeque<Vec<Complex32>>,
    coefs: &[f32],
    df_bins: usize,
    order: usize,
) {
    let df_bins = df_bins.min(bins.len());
    for (f, bin) in bins.iter_mut().enumerate().take(df_bins) {
        let mut acc = Complex32::new(0.0, 0.0);
        for (k, frame) in lookback.iter().enumerate().take(order) {
            let base = (f * order + k) * 2;
            let tap = Complex32::new(coefs[base], coefs[base + 1]);
            acc += frame[f] * tap;
        }
        *bin = acc;
    }
}

/// Interleaved `[re, im]` pairs to `[re..., im...]`
fn planar_spec(interleaved: &[f32]) -> Vec<f32> {
    let n = interleaved.len() / 2;
    let mut planar = vec![0.0; n * 2];
    for (i, pair) in interleaved.chunks_exact(2).enumerate() {
        planar[i] = pair[0];
        planar[n + i] = pair[1];
    }
    planar
}

/// Look up a stage output and check it against the negotiated shape
///
/// Size-1 axes are ignored, so `[1, 1, 256]` and `[1, 256]` both match an
/// embedding of 256, but every other axis must agree in order.
fn expect_tensor(
    outputs: &TensorMap,
    stage: Stage,
    name: &str,
    expected: &[usize],
) -> Result<Arc<Tensor>> {
    let tensor = outputs
        .get(name)
        .ok_or_else(|| VocanaError::runtime(stage.name(), format!("missing output '{}'", name)))?;
    if squeezed(tensor.shape()) != squeezed(expected) {
        return Err(VocanaError::shape(
            &format!("{} output '{}'", stage, name),
            format!("{:?}", expected),
            format!("{:?}", tensor.shape()),
        ));
    }
    if !tensor.is_finite() {
        return Err(VocanaError::runtime(
            stage.name(),
            format!("output '{}' is not finite", name),
        ));
    }
    Ok(Arc::clone(tensor))
}

fn squeezed(shape: &[usize]) -> Vec<usize> {
    shape.iter().copied().filter(|&d| d != 1).collect()
}

/// Validate the returned hidden state against the previous one
fn next_slot(outputs: &TensorMap, stage: Stage, state: &RecurrentState) -> Result<Option<Arc<Tensor>>> {
    let Some(previous) = state.slot(stage) else {
        return Ok(None);
    };
    let h1 = outputs
        .get(STATE_OUT)
        .ok_or_else(|| VocanaError::runtime(stage.name(), "missing output 'h1'"))?;
    if h1.shape() != previous.shape() {
        return Err(VocanaError::shape(
            &format!("{} hidden state", stage),
            format!("{:?}", previous.shape()),
            format!("{:?}", h1.shape()),
        ));
    }
    if !h1.is_finite() {
        return Err(VocanaError::runtime(stage.name(), "hidden state is not finite"));
    }
    Ok(Some(Arc::clone(h1)))
}
