//! # Transform Engine
//!
//! Short-time Fourier analysis and overlap-add synthesis.
//!
//! The engine holds only immutable tables (FFT plans, windows and the
//! window-sum table), so a single `Arc<TransformEngine>` can serve every
//! stream. Per-stream overlap state lives in [`SynthesisState`].
//!
//! Reconstruction divides each output sample by the accumulated
//! `analysis * synthesis` window sum at its hop position. Entries below
//! `cola_epsilon` are normalized to 1.0 instead of divided by near-zero.

use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{StreamConfig, WindowKind};
use crate::error::{Result, VocanaError};

/// One windowed block of `fft_size` real samples
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisFrame {
    samples: Vec<f32>,
}

impl AnalysisFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One-sided complex spectrum of a frame (`fft_size / 2 + 1` bins)
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFrame {
    bins: Vec<Complex32>,
}

impl SpectrumFrame {
    pub fn new(bins: Vec<Complex32>) -> Self {
        Self { bins }
    }

    pub fn zeros(len: usize) -> Self {
        Self {
            bins: vec![Complex32::new(0.0, 0.0); len],
        }
    }

    /// Build a spectrum from separate real and imaginary sequences
    pub fn from_parts(re: &[f32], im: &[f32]) -> Result<Self> {
        if re.len() != im.len() {
            return Err(VocanaError::shape(
                "spectrum real/imag",
                format!("{} imaginary values", re.len()),
                im.len(),
            ));
        }
        Ok(Self {
            bins: re
                .iter()
                .zip(im)
                .map(|(&r, &i)| Complex32::new(r, i))
                .collect(),
        })
    }

    pub fn bins(&self) -> &[Complex32] {
        &self.bins
    }

    pub fn bins_mut(&mut self) -> &mut [Complex32] {
        &mut self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn real(&self) -> Vec<f32> {
        self.bins.iter().map(|c| c.re).collect()
    }

    pub fn imag(&self) -> Vec<f32> {
        self.bins.iter().map(|c| c.im).collect()
    }

    pub fn is_finite(&self) -> bool {
        self.bins.iter().all(|c| c.re.is_finite() && c.im.is_finite())
    }

    /// Expand to a full `fft_size` spectrum using conjugate symmetry
    pub fn to_full_spectrum(&self, fft_size: usize) -> Result<Vec<Complex32>> {
        let half = fft_size / 2 + 1;
        if fft_size == 0 || self.bins.len() != half {
            return Err(VocanaError::shape(
                "full spectrum mirror",
                format!("{} bins for fft_size {}", half, fft_size),
                self.bins.len(),
            ));
        }

        let mut full = vec![Complex32::new(0.0, 0.0); fft_size];
        full[..half].copy_from_slice(&self.bins);
        for k in half..fft_size {
            let mirror = fft_size - k;
            // mirror is in 1..half for every k in half..fft_size
            full[k] = self.bins[mirror].conj();
        }
        Ok(full)
    }
}

/// Per-stream overlap-add state with reusable scratch buffers
///
/// Every buffer here is fully overwritten before it is read.
pub struct SynthesisState {
    overlap: Vec<f32>,
    accumulator: Vec<f32>,
    spectrum_scratch: Vec<Complex32>,
    time_buffer: Vec<f32>,
    fft_scratch: Vec<Complex32>,
}

impl SynthesisState {
    /// Pending overlap tail carried into the next frame
    pub fn overlap(&self) -> &[f32] {
        &self.overlap
    }
}

/// Immutable analysis/synthesis tables shared across streams
pub struct TransformEngine {
    fft_size: usize,
    hop_size: usize,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    analysis_window: Vec<f32>,
    synthesis_window: Vec<f32>,
    /// Reciprocal of the accumulated window sum for each hop position
    inv_window_sum: Vec<f32>,
    degenerate_positions: usize,
}

impl TransformEngine {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let fft_size = config.fft_size;
        let hop_size = config.hop_size;
        if fft_size == 0 || fft_size % 2 != 0 {
            return Err(VocanaError::config("fft_size", fft_size, "must be positive and even"));
        }
        if hop_size == 0 || hop_size > fft_size {
            return Err(VocanaError::config("hop_size", hop_size, "must be in 1..=fft_size"));
        }

        let window = build_window(config.window, fft_size);
        if let Some(index) = window.iter().position(|w| !w.is_finite()) {
            return Err(VocanaError::NonFiniteWindow { index });
        }
        let analysis_window = window.clone();
        let synthesis_window = window;

        let mut inv_window_sum = vec![0.0f32; hop_size];
        let mut degenerate_positions = 0;
        for (i, slot) in inv_window_sum.iter_mut().enumerate() {
            let sum: f32 = (i..fft_size)
                .step_by(hop_size)
                .map(|n| analysis_window[n] * synthesis_window[n])
                .sum();
            *slot = if sum < config.cola_epsilon {
                degenerate_positions += 1;
                1.0
            } else {
                1.0 / sum
            };
        }

        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);

        info!(
            "Transform engine: fft={}, hop={}, window={:?}, degenerate hop positions={}",
            fft_size, hop_size, config.window, degenerate_positions
        );

        Ok(Self {
            fft_size,
            hop_size,
            forward,
            inverse,
            analysis_window,
            synthesis_window,
            inv_window_sum,
            degenerate_positions,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn freq_bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    /// Algorithmic delay between input and reconstructed output, in samples
    pub fn latency_samples(&self) -> usize {
        self.fft_size - self.hop_size
    }

    pub fn analysis_window(&self) -> &[f32] {
        &self.analysis_window
    }

    /// Hop positions whose window sum fell below epsilon
    pub fn degenerate_positions(&self) -> usize {
        self.degenerate_positions
    }

    pub fn new_synthesis_state(&self) -> SynthesisState {
        SynthesisState {
            overlap: vec![0.0; self.fft_size - self.hop_size],
            accumulator: vec![0.0; self.fft_size],
            spectrum_scratch: self.inverse.make_input_vec(),
            time_buffer: self.inverse.make_output_vec(),
            fft_scratch: self.inverse.make_scratch_vec(),
        }
    }

    /// Window and transform one analysis frame
    pub fn forward(&self, frame: &AnalysisFrame) -> Result<SpectrumFrame> {
        if frame.len() != self.fft_size {
            return Err(VocanaError::shape("forward transform", self.fft_size, frame.len()));
        }

        let mut windowed: Vec<f32> = frame
            .samples()
            .iter()
            .zip(&self.analysis_window)
            .map(|(x, w)| x * w)
            .collect();
        let mut spectrum = self.forward.make_output_vec();
        let mut scratch = self.forward.make_scratch_vec();
        self.forward
            .process_with_scratch(&mut windowed, &mut spectrum, &mut scratch)
            .map_err(|e| VocanaError::shape("forward transform", self.fft_size, e))?;

        if let Some(bin) = spectrum
            .iter()
            .position(|c| !c.re.is_finite() || !c.im.is_finite())
        {
            return Err(VocanaError::InputValidation {
                reason: format!("forward transform overflowed at bin {}", bin),
            });
        }
        Ok(SpectrumFrame::new(spectrum))
    }

    /// Inverse transform, overlap-add and normalize; returns `hop_size` samples
    pub fn inverse(&self, spectrum: &SpectrumFrame, state: &mut SynthesisState) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(self.hop_size);
        self.inverse_into(spectrum, state, &mut out)?;
        Ok(out)
    }

    /// Like [`inverse`](Self::inverse) but appends the hop to `out`
    ///
    /// On error neither `state` nor `out` is modified.
    pub fn inverse_into(
        &self,
        spectrum: &SpectrumFrame,
        state: &mut SynthesisState,
        out: &mut Vec<f32>,
    ) -> Result<()> {
        let bins = self.freq_bins();
        if spectrum.len() != bins {
            return Err(VocanaError::shape("inverse transform", bins, spectrum.len()));
        }
        if state.overlap.len() != self.fft_size - self.hop_size
            || state.accumulator.len() != self.fft_size
            || state.spectrum_scratch.len() != bins
            || state.time_buffer.len() != self.fft_size
        {
            return Err(VocanaError::shape(
                "synthesis state",
                format!("buffers for fft_size {}", self.fft_size),
                "state built by a different engine",
            ));
        }

        if !spectrum.is_finite() {
            return Err(VocanaError::InputValidation {
                reason: "inverse transform given a non-finite spectrum".to_string(),
            });
        }

        state.spectrum_scratch.copy_from_slice(spectrum.bins());
        // A real signal has purely real DC and Nyquist bins
        state.spectrum_scratch[0].im = 0.0;
        state.spectrum_scratch[bins - 1].im = 0.0;

        self.inverse
            .process_with_scratch(
                &mut state.spectrum_scratch,
                &mut state.time_buffer,
                &mut state.fft_scratch,
            )
            .map_err(|e| VocanaError::shape("inverse transform", bins, e))?;

        let scale = 1.0 / self.fft_size as f32;
        let overlap_len = state.overlap.len();
        for (n, acc) in state.accumulator.iter_mut().enumerate() {
            let carried = if n < overlap_len { state.overlap[n] } else { 0.0 };
            *acc = carried + state.time_buffer[n] * scale * self.synthesis_window[n];
        }
        // Scratch only so far; the overlap is committed below
        if state.accumulator.iter().any(|a| !a.is_finite()) {
            return Err(VocanaError::InputValidation {
                reason: "inverse transform overflowed".to_string(),
            });
        }

        out.extend(
            state.accumulator[..self.hop_size]
                .iter()
                .zip(&self.inv_window_sum)
                .map(|(a, inv)| a * inv),
        );
        state
            .overlap
            .copy_from_slice(&state.accumulator[self.hop_size..]);

        debug!("inverse transform emitted {} samples", self.hop_size);
        Ok(())
    }
}

fn build_window(kind: WindowKind, size: usize) -> Vec<f32> {
    let n = size as f32;
    match kind {
        WindowKind::Hann => (0..size)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / n).cos())
            .collect(),
        WindowKind::SqrtHann => (0..size)
            .map(|i| (0.5 - 0.5 * (2.0 * PI * i as f32 / n).cos()).sqrt())
            .collect(),
        WindowKind::Vorbis => {
            let half = n / 2.0;
            (0..size)
                .map(|i| {
                    let s = (0.5 * PI * (i as f32 + 0.5) / half).sin();
                    (0.5 * PI * s * s).sin()
                })
                .collect()
        }
    }
}
