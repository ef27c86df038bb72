//! Complex spectral features for the deep-filter path.
//!
//! The first `df_bins` bins are divided by a running RMS magnitude, giving
//! unit-scale complex values laid out as interleaved `[re, im]` pairs. These
//! are the only spectral values the model sees.
//!
//! [`SpectralStats`] is diagnostic: per-frame summary statistics on log power
//! plus the per-bin log magnitude, floored at the variance floor.

use serde::{Deserialize, Serialize};

use super::{FeatureExtractor, LastValid};
use crate::config::FeatureConfig;
use crate::error::{Result, VocanaError};
use crate::transform::SpectrumFrame;

/// Initial running magnitude, interpolated low to high bin
const UNIT_NORM_INIT: [f32; 2] = [0.001, 0.0001];

/// Fraction of energy below the rolloff frequency
const ROLLOFF_FRACTION: f32 = 0.85;

/// Summary statistics of one spectrum frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectralStats {
    /// Magnitude-weighted mean frequency (Hz)
    pub centroid_hz: f32,
    /// Geometric over arithmetic mean of power, in [0, 1]
    pub flatness: f32,
    /// RMS change of log power against the previous frame
    pub flux: f32,
    /// Frequency below which 85% of the energy lies (Hz)
    pub rolloff_hz: f32,
    /// Total frame energy (dB)
    pub energy_db: f32,
    /// `10 * log10(max(|X|^2, variance_floor))` for every bin
    #[serde(default)]
    pub log_magnitude_db: Vec<f32>,
}

pub struct SpectralExtractor {
    df_bins: usize,
    freq_bins: usize,
    bin_hz: f32,
    alpha: f32,
    variance_floor: f32,
    /// Running mean power per bin
    unit_state: Vec<f32>,
    prev_log_power: Vec<f32>,
    last: LastValid,
}

impl SpectralExtractor {
    pub fn new(sample_rate: u32, fft_size: usize, config: &FeatureConfig) -> Self {
        let freq_bins = fft_size / 2 + 1;
        let df_bins = config.df_bins.min(freq_bins);
        let mut extractor = Self {
            df_bins,
            freq_bins,
            bin_hz: sample_rate as f32 / fft_size.max(1) as f32,
            alpha: config.norm_alpha,
            variance_floor: config.variance_floor,
            unit_state: vec![0.0; df_bins],
            prev_log_power: vec![(1e-10f32).ln(); freq_bins],
            last: LastValid::zeros(df_bins * 2),
        };
        extractor.reset();
        extractor
    }

    pub fn df_bins(&self) -> usize {
        self.df_bins
    }

    /// Summary statistics; updates the flux reference frame
    pub fn stats(&mut self, spectrum: &SpectrumFrame) -> Result<SpectralStats> {
        if spectrum.len() != self.freq_bins {
            return Err(VocanaError::shape("spectral stats", self.freq_bins, spectrum.len()));
        }

        let bins = spectrum.bins();
        let mut weighted = 0.0f32;
        let mut magnitude_sum = 0.0f32;
        let mut energy = 0.0f32;
        let mut log_sum = 0.0f32;
        let mut flux = 0.0f32;
        let mut log_magnitude_db = Vec::with_capacity(bins.len());

        for (i, c) in bins.iter().enumerate() {
            let power = c.norm_sqr();
            let magnitude = power.sqrt();
            log_magnitude_db.push(10.0 * power.max(self.variance_floor).log10());
            weighted += i as f32 * self.bin_hz * magnitude;
            magnitude_sum += magnitude;
            energy += power;

            let log_power = power.max(1e-10).ln();
            log_sum += log_power;
            let diff = log_power - self.prev_log_power[i];
            flux += diff * diff;
            self.prev_log_power[i] = log_power;
        }

        let n = bins.len() as f32;
        let arithmetic_mean = energy / n;
        let geometric_mean = (log_sum / n).exp();

        let threshold = energy * ROLLOFF_FRACTION;
        let mut cumulative = 0.0f32;
        let mut rolloff_bin = bins.len().saturating_sub(1);
        for (i, c) in bins.iter().enumerate() {
            cumulative += c.norm_sqr();
            if cumulative >= threshold {
                rolloff_bin = i;
                break;
            }
        }

        Ok(SpectralStats {
            centroid_hz: if magnitude_sum > 1e-10 {
                weighted / magnitude_sum
            } else {
                0.0
            },
            flatness: if arithmetic_mean > 1e-10 {
                (geometric_mean / arithmetic_mean).clamp(0.0, 1.0)
            } else {
                0.0
            },
            flux: (flux / n).sqrt(),
            rolloff_hz: if energy > 1e-10 {
                rolloff_bin as f32 * self.bin_hz
            } else {
                0.0
            },
            energy_db: 10.0 * (energy + 1e-10).log10(),
            log_magnitude_db,
        })
    }
}

impl FeatureExtractor for SpectralExtractor {
    fn width(&self) -> usize {
        self.df_bins * 2
    }

    fn compute(&mut self, spectrum: &SpectrumFrame) -> Result<Vec<f32>> {
        if spectrum.len() != self.freq_bins {
            return Err(VocanaError::shape("spectral features", self.freq_bins, spectrum.len()));
        }
        let head = &spectrum.bins()[..self.df_bins];
        if !head.iter().all(|c| c.re.is_finite() && c.im.is_finite()) {
            return Err(VocanaError::InputValidation {
                reason: "non-finite spectrum bins".to_string(),
            });
        }

        let a = self.alpha;
        let mut out = Vec::with_capacity(self.df_bins * 2);
        for (c, state) in head.iter().zip(self.unit_state.iter_mut()) {
            *state = a * *state + (1.0 - a) * c.norm_sqr();
            let norm = state.max(self.variance_floor).sqrt();
            out.push(c.re / norm);
            out.push(c.im / norm);
        }
        Ok(out)
    }

    fn reset(&mut self) {
        let n = self.unit_state.len();
        for (i, s) in self.unit_state.iter_mut().enumerate() {
            let t = if n > 1 { i as f32 / (n - 1) as f32 } else { 0.0 };
            let magnitude = UNIT_NORM_INIT[0] + t * (UNIT_NORM_INIT[1] - UNIT_NORM_INIT[0]);
            *s = magnitude * magnitude;
        }
        self.prev_log_power.fill((1e-10f32).ln());
        self.last.reset();
    }

    fn name(&self) -> &'static str {
        "spectral"
    }

    fn last_valid(&mut self) -> &mut LastValid {
        &mut self.last
    }
}
