//! Shape-correct stand-in for a real model runtime.
//!
//! Every stage returns tensors of exactly the negotiated shapes with
//! identity behaviour: unit gains, a deep filter that passes the current
//! frame through, a zero embedding, and hidden state carried forward
//! unchanged. Used for benchmarking and for testing the signal path
//! independently of any trained model.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    InferenceSession, ModelShape, Stage, Tensor, TensorMap, DF_COEFS, EMBEDDING, GAIN_MASK, LSNR,
    STATE_IN, STATE_OUT,
};
use crate::error::{Result, VocanaError};

pub struct MockSession {
    shape: ModelShape,
    lsnr_db: f32,
    latency: Option<Duration>,
    calls: Arc<AtomicU64>,
}

impl MockSession {
    pub fn new(shape: ModelShape) -> Self {
        Self {
            shape,
            lsnr_db: 20.0,
            latency: None,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Local SNR reported by the encoder stage
    pub fn with_lsnr(mut self, lsnr_db: f32) -> Self {
        self.lsnr_db = lsnr_db;
        self
    }

    /// Sleep this long inside every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Shared call counter, readable after the session moves to its host thread
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.calls)
    }

    fn carried_state(&self, stage: Stage, inputs: &TensorMap) -> Result<Option<Arc<Tensor>>> {
        let hidden = self.shape.hidden(stage);
        if hidden == 0 {
            return Ok(None);
        }
        match inputs.get(STATE_IN) {
            Some(h0) if h0.numel() == hidden => Ok(Some(Arc::clone(h0))),
            Some(h0) => Err(VocanaError::runtime(
                stage.name(),
                format!("h0 has {} elements, expected {}", h0.numel(), hidden),
            )),
            None => Ok(Some(Arc::new(Tensor::zeros(self.shape.state_shape(stage))))),
        }
    }
}

impl InferenceSession for MockSession {
    fn run(&mut self, stage: Stage, inputs: &TensorMap) -> Result<TensorMap> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let mut outputs = TensorMap::new();
        if let Some(h1) = self.carried_state(stage, inputs)? {
            outputs.insert(STATE_OUT.to_string(), h1);
        }

        match stage {
            Stage::Encoder => {
                outputs.insert(
                    EMBEDDING.to_string(),
                    Arc::new(Tensor::zeros(self.shape.embedding_shape())),
                );
                outputs.insert(
                    LSNR.to_string(),
                    Arc::new(Tensor::new(vec![1, 1, 1], vec![self.lsnr_db])?),
                );
            }
            Stage::ErbDecoder => {
                let shape = self.shape.mask_shape();
                let len = shape.iter().product();
                outputs.insert(GAIN_MASK.to_string(), Arc::new(Tensor::new(shape, vec![1.0; len])?));
            }
            Stage::DeepFilterDecoder => {
                let order = self.shape.filter_order;
                let mut coefs = vec![0.0; self.shape.df_bins * order * 2];
                for bin in 0..self.shape.df_bins {
                    // Newest tap is the current frame
                    coefs[(bin * order + order - 1) * 2] = 1.0;
                }
                outputs.insert(
                    DF_COEFS.to_string(),
                    Arc::new(Tensor::new(self.shape.coefs_shape(), coefs)?),
                );
            }
        }
        Ok(outputs)
    }

    fn backend(&self) -> &str {
        "mock"
    }
}
