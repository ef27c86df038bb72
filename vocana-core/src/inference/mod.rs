//! # Inference Runtime Boundary
//!
//! The neural network runtime is opaque: it takes named float tensors for a
//! stage and returns named float tensors. This module defines that contract
//! and the plumbing that serializes calls through one dedicated thread.
//!
//! ## Stage contract
//!
//! | Stage | Inputs | Outputs |
//! |---|---|---|
//! | `enc` | `feat_erb [1,1,1,E]`, `feat_spec [1,2,1,F]`, `h0` | `emb [1,1,D]`, `lsnr [1,1,1]` (optional), `h1` |
//! | `erb_dec` | `emb`, `h0` | `m [1,1,1,E]`, `h1` |
//! | `df_dec` | `emb`, `h0` | `coefs [1,1,F,order,2]`, `h1` |
//!
//! `h0`/`h1` are `[1,1,H]` and only exchanged when the stage's hidden width
//! is non-zero.

pub mod host;
pub mod mock;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use host::{cancel_pair, CancelSignal, CancelTrigger, InferenceClient, InferenceHost};
pub use mock::MockSession;
#[cfg(feature = "onnx")]
pub use onnx::OrtSession;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Result, VocanaError};

pub const FEAT_ERB: &str = "feat_erb";
pub const FEAT_SPEC: &str = "feat_spec";
pub const EMBEDDING: &str = "emb";
pub const LSNR: &str = "lsnr";
pub const GAIN_MASK: &str = "m";
pub const DF_COEFS: &str = "coefs";
pub const STATE_IN: &str = "h0";
pub const STATE_OUT: &str = "h1";

/// Dense row-major float tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(VocanaError::shape(
                "tensor",
                format!("{} elements for shape {:?}", expected, shape),
                data.len(),
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Named tensors for one stage call
pub type TensorMap = BTreeMap<String, Arc<Tensor>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Encoder,
    ErbDecoder,
    DeepFilterDecoder,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Encoder, Stage::ErbDecoder, Stage::DeepFilterDecoder];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Encoder => "enc",
            Stage::ErbDecoder => "erb_dec",
            Stage::DeepFilterDecoder => "df_dec",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Stage::Encoder => 0,
            Stage::ErbDecoder => 1,
            Stage::DeepFilterDecoder => 2,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque tensor-in/tensor-out model runtime
pub trait InferenceSession: Send {
    fn run(&mut self, stage: Stage, inputs: &TensorMap) -> Result<TensorMap>;

    /// Human-readable backend name for logs
    fn backend(&self) -> &str;
}

/// Tensor dimensions agreed between the orchestrator and the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub erb_bands: usize,
    pub df_bins: usize,
    pub filter_order: usize,
    pub embedding_dim: usize,
    /// Hidden width per stage, indexed by [`Stage::index`]
    pub hidden: [usize; 3],
}

impl ModelShape {
    pub fn from_config(config: &Config) -> Self {
        Self {
            erb_bands: config.features.erb_band_count,
            df_bins: config.features.df_bins,
            filter_order: config.inference.filter_order,
            embedding_dim: config.inference.embedding_dim,
            hidden: [
                config.inference.encoder_hidden,
                config.inference.erb_hidden,
                config.inference.df_hidden,
            ],
        }
    }

    pub fn hidden(&self, stage: Stage) -> usize {
        self.hidden[stage.index()]
    }

    pub fn state_shape(&self, stage: Stage) -> Vec<usize> {
        vec![1, 1, self.hidden(stage)]
    }

    pub fn embedding_shape(&self) -> Vec<usize> {
        vec![1, 1, self.embedding_dim]
    }

    pub fn mask_shape(&self) -> Vec<usize> {
        vec![1, 1, 1, self.erb_bands]
    }

    pub fn coefs_shape(&self) -> Vec<usize> {
        vec![1, 1, self.df_bins, self.filter_order, 2]
    }
}
