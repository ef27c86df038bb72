//! # Feature Extraction
//!
//! Two extractors run on every spectrum frame:
//! - [`erb::ErbExtractor`]: normalized log power in ERB-spaced bands
//! - [`spectral::SpectralExtractor`]: unit-normalized complex values of the
//!   low-frequency bins, plus summary statistics
//!
//! A malformed frame never aborts a stream. The extractor hands back the
//! previous valid vector (zeros before the first one) and reports the
//! substitution so the caller can count and log it.

pub mod erb;
pub mod spectral;

pub use erb::{ErbExtractor, ErbFilterbank};
pub use spectral::{SpectralExtractor, SpectralStats};

use tracing::debug;

use crate::error::{Result, VocanaError};
use crate::transform::SpectrumFrame;

/// Result of extracting one frame's features
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub values: Vec<f32>,
    /// Set when `values` is a substitute for a malformed frame
    pub substituted: Option<VocanaError>,
}

impl Extraction {
    pub fn is_substituted(&self) -> bool {
        self.substituted.is_some()
    }
}

/// Fixed-width feature extractor with per-stream normalization state
pub trait FeatureExtractor: Send {
    /// Output width; constant for the extractor's lifetime
    fn width(&self) -> usize;

    /// Compute features, failing on malformed input without touching state
    fn compute(&mut self, spectrum: &SpectrumFrame) -> Result<Vec<f32>>;

    /// Reset normalization state to its initial values
    fn reset(&mut self);

    fn name(&self) -> &'static str;

    fn last_valid(&mut self) -> &mut LastValid;

    /// Compute features, substituting the last valid vector on failure
    fn extract(&mut self, spectrum: &SpectrumFrame) -> Extraction {
        let width = self.width();
        let name = self.name();
        let computed = self.compute(spectrum).and_then(|values| {
            if values.len() != width {
                Err(VocanaError::shape(name, width, values.len()))
            } else if values.iter().any(|v| !v.is_finite()) {
                Err(VocanaError::InputValidation {
                    reason: format!("{} produced non-finite features", name),
                })
            } else {
                Ok(values)
            }
        });
        self.last_valid().resolve(name, computed)
    }
}

/// Last feature vector that passed validation
#[derive(Debug, Clone)]
pub struct LastValid {
    values: Vec<f32>,
}

impl LastValid {
    pub fn zeros(width: usize) -> Self {
        Self {
            values: vec![0.0; width],
        }
    }

    pub fn resolve(&mut self, name: &str, computed: Result<Vec<f32>>) -> Extraction {
        match computed {
            Ok(values) => {
                self.values.clone_from(&values);
                Extraction {
                    values,
                    substituted: None,
                }
            }
            Err(e) => {
                debug!("{} extractor substituted previous frame: {}", name, e);
                Extraction {
                    values: self.values.clone(),
                    substituted: Some(e),
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.values.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failure_substitutes_zeros() {
        let mut last = LastValid::zeros(3);
        let out = last.resolve("test", Err(VocanaError::shape("test", 3, 2)));
        assert_eq!(out.values, vec![0.0; 3]);
        assert!(out.is_substituted());
    }

    #[test]
    fn test_failure_substitutes_previous_valid() {
        let mut last = LastValid::zeros(2);
        let ok = last.resolve("test", Ok(vec![1.0, 2.0]));
        assert!(!ok.is_substituted());

        let bad = last.resolve(
            "test",
            Err(VocanaError::InputValidation {
                reason: "nan".into(),
            }),
        );
        assert_eq!(bad.values, vec![1.0, 2.0]);
    }
}
