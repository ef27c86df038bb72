//! ERB filterbank and band-power features.
//!
//! Band centers are spaced evenly on the Glasberg-Moore ERB scale between
//! 0 Hz and Nyquist. Each FFT bin is split between its two neighbouring
//! centers with linear (triangular) weights, so the weights of every bin sum
//! to one: expanding a unit band gain yields a unit gain on every bin.

use std::sync::Arc;
use tracing::{debug, info};

use super::{FeatureExtractor, LastValid};
use crate::config::FeatureConfig;
use crate::error::{Result, VocanaError};
use crate::transform::SpectrumFrame;

const ERB_A: f32 = 24.7;
const ERB_Q: f32 = 9.265;

/// Initial running mean of band log power, interpolated low to high band (dB)
const MEAN_NORM_INIT: [f32; 2] = [-60.0, -90.0];
const VAR_NORM_INIT: f32 = 1.0;

#[inline]
pub fn freq_to_erb(freq_hz: f32) -> f32 {
    ERB_Q * (1.0 + freq_hz / (ERB_A * ERB_Q)).ln()
}

#[inline]
pub fn erb_to_freq(n_erb: f32) -> f32 {
    ERB_A * ERB_Q * ((n_erb / ERB_Q).exp() - 1.0)
}

/// Sparse triangular filterbank mapping bins to ERB bands
#[derive(Debug)]
pub struct ErbFilterbank {
    band_count: usize,
    freq_bins: usize,
    centers_hz: Arc<[f32]>,
    /// Lower neighbouring band of each bin
    lower_band: Vec<usize>,
    /// Weight of the lower band; the upper band gets `1 - w`
    lower_weight: Vec<f32>,
    /// Total weight each band receives across all bins
    band_weight: Vec<f32>,
    /// Bin closest to each center, used when a band collects no weight
    nearest_bin: Vec<usize>,
}

impl ErbFilterbank {
    pub fn new(sample_rate: u32, fft_size: usize, band_count: usize) -> Result<Self> {
        let freq_bins = fft_size / 2 + 1;
        if band_count == 0 || band_count > freq_bins {
            return Err(VocanaError::config(
                "erb_band_count",
                band_count,
                &format!("must be in 1..={}", freq_bins),
            ));
        }
        if sample_rate == 0 || fft_size == 0 {
            return Err(VocanaError::config("sample_rate", sample_rate, "must be positive"));
        }

        let nyquist = sample_rate as f32 / 2.0;
        let bin_hz = sample_rate as f32 / fft_size as f32;

        let centers: Vec<f32> = if band_count == 1 {
            vec![0.0]
        } else {
            let erb_high = freq_to_erb(nyquist);
            let step = erb_high / (band_count - 1) as f32;
            (0..band_count)
                .map(|i| erb_to_freq(i as f32 * step))
                .collect()
        };

        let mut lower_band = Vec::with_capacity(freq_bins);
        let mut lower_weight = Vec::with_capacity(freq_bins);
        let mut band_weight = vec![0.0f32; band_count];

        for bin in 0..freq_bins {
            let f = bin as f32 * bin_hz;
            if band_count == 1 {
                lower_band.push(0);
                lower_weight.push(1.0);
                band_weight[0] += 1.0;
                continue;
            }

            let j = centers
                .partition_point(|&c| c <= f)
                .saturating_sub(1)
                .min(band_count - 2);
            let span = centers[j + 1] - centers[j];
            let w = if span > 0.0 {
                ((centers[j + 1] - f) / span).clamp(0.0, 1.0)
            } else {
                1.0
            };
            lower_band.push(j);
            lower_weight.push(w);
            band_weight[j] += w;
            band_weight[j + 1] += 1.0 - w;
        }

        let nearest_bin = centers
            .iter()
            .map(|&c| ((c / bin_hz).round() as usize).min(freq_bins - 1))
            .collect();

        info!(
            "ERB filterbank: {} bands over {} bins ({} Hz..{} Hz)",
            band_count,
            freq_bins,
            centers.first().copied().unwrap_or(0.0),
            centers.last().copied().unwrap_or(0.0)
        );

        Ok(Self {
            band_count,
            freq_bins,
            centers_hz: centers.into(),
            lower_band,
            lower_weight,
            band_weight,
            nearest_bin,
        })
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn freq_bins(&self) -> usize {
        self.freq_bins
    }

    /// Cached band center frequencies in Hz
    pub fn centers_hz(&self) -> Arc<[f32]> {
        Arc::clone(&self.centers_hz)
    }

    /// Weighted mean power per band
    pub fn band_power(&self, spectrum: &SpectrumFrame, out: &mut [f32]) -> Result<()> {
        if spectrum.len() != self.freq_bins {
            return Err(VocanaError::shape("erb band power", self.freq_bins, spectrum.len()));
        }
        if out.len() != self.band_count {
            return Err(VocanaError::shape("erb band power output", self.band_count, out.len()));
        }

        out.fill(0.0);
        for (bin, c) in spectrum.bins().iter().enumerate() {
            let power = c.norm_sqr();
            let j = self.lower_band[bin];
            let w = self.lower_weight[bin];
            out[j] += w * power;
            if j + 1 < self.band_count {
                out[j + 1] += (1.0 - w) * power;
            }
        }

        for (band, value) in out.iter_mut().enumerate() {
            let weight = self.band_weight[band];
            *value = if weight > 1e-6 {
                *value / weight
            } else {
                spectrum.bins()[self.nearest_bin[band]].norm_sqr()
            };
        }
        Ok(())
    }

    /// Interpolate per-band gains onto every frequency bin
    pub fn expand_gains(&self, band_gains: &[f32], out: &mut [f32]) -> Result<()> {
        if band_gains.len() != self.band_count {
            return Err(VocanaError::shape("erb gain expansion", self.band_count, band_gains.len()));
        }
        if out.len() != self.freq_bins {
            return Err(VocanaError::shape("erb gain expansion output", self.freq_bins, out.len()));
        }

        for (bin, gain) in out.iter_mut().enumerate() {
            let j = self.lower_band[bin];
            let w = self.lower_weight[bin];
            let upper = band_gains.get(j + 1).copied().unwrap_or(band_gains[j]);
            *gain = w * band_gains[j] + (1.0 - w) * upper;
        }
        Ok(())
    }
}

/// Mean/variance-normalized log band power
pub struct ErbExtractor {
    bank: Arc<ErbFilterbank>,
    alpha: f32,
    variance_floor: f32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    power: Vec<f32>,
    last: LastValid,
}

impl ErbExtractor {
    pub fn new(bank: Arc<ErbFilterbank>, config: &FeatureConfig) -> Self {
        let bands = bank.band_count();
        let mut extractor = Self {
            bank,
            alpha: config.norm_alpha,
            variance_floor: config.variance_floor,
            mean: vec![0.0; bands],
            variance: vec![VAR_NORM_INIT; bands],
            power: vec![0.0; bands],
            last: LastValid::zeros(bands),
        };
        extractor.reset();
        extractor
    }

    pub fn filterbank(&self) -> &Arc<ErbFilterbank> {
        &self.bank
    }
}

impl FeatureExtractor for ErbExtractor {
    fn width(&self) -> usize {
        self.bank.band_count()
    }

    fn compute(&mut self, spectrum: &SpectrumFrame) -> Result<Vec<f32>> {
        self.bank.band_power(spectrum, &mut self.power)?;
        if self.power.iter().any(|p| !p.is_finite()) {
            return Err(VocanaError::InputValidation {
                reason: "non-finite band power".to_string(),
            });
        }

        let a = self.alpha;
        let mut out = Vec::with_capacity(self.power.len());
        for ((p, mean), var) in self
            .power
            .iter()
            .zip(self.mean.iter_mut())
            .zip(self.variance.iter_mut())
        {
            let x = 10.0 * (p + 1e-10).log10();
            *mean = a * *mean + (1.0 - a) * x;
            let diff = x - *mean;
            *var = a * *var + (1.0 - a) * diff * diff;
            out.push(diff / var.max(self.variance_floor).sqrt());
        }
        debug!("erb features computed for {} bands", out.len());
        Ok(out)
    }

    fn reset(&mut self) {
        let bands = self.mean.len();
        for (i, m) in self.mean.iter_mut().enumerate() {
            let t = if bands > 1 { i as f32 / (bands - 1) as f32 } else { 0.0 };
            *m = MEAN_NORM_INIT[0] + t * (MEAN_NORM_INIT[1] - MEAN_NORM_INIT[0]);
        }
        self.variance.fill(VAR_NORM_INIT);
        self.last.reset();
    }

    fn name(&self) -> &'static str {
        "erb"
    }

    fn last_valid(&mut self) -> &mut LastValid {
        &mut self.last
    }
}
