//! ONNX Runtime backend loading one graph per stage.
//!
//! Expects `enc.onnx`, `erb_dec.onnx` and `df_dec.onnx` in a model
//! directory. Inputs are fed by name from whatever the graph declares, so a
//! stateless export without `h0` works unchanged.

use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{InferenceSession, Stage, Tensor, TensorMap};
use crate::error::{Result, VocanaError};

struct StageSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

pub struct OrtSession {
    stages: [StageSession; 3],
}

impl OrtSession {
    pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self> {
        let load = |stage: Stage| -> Result<StageSession> {
            let path = model_dir.join(format!("{}.onnx", stage.name()));
            if !path.is_file() {
                return Err(VocanaError::Io {
                    path: path.display().to_string(),
                    reason: "model file not found".to_string(),
                });
            }

            let ort_err = |e: ort::Error| VocanaError::runtime(stage.name(), e);
            let session = Session::builder()
                .map_err(ort_err)?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(ort_err)?
                .with_intra_threads(intra_threads.max(1))
                .map_err(ort_err)?
                .commit_from_file(&path)
                .map_err(ort_err)?;

            let input_names: Vec<String> =
                session.inputs().iter().map(|i| i.name().to_string()).collect();
            let output_names: Vec<String> =
                session.outputs().iter().map(|o| o.name().to_string()).collect();
            info!(
                "Loaded {} from {:?}: inputs={:?} outputs={:?}",
                stage, path, input_names, output_names
            );

            Ok(StageSession {
                session,
                input_names,
                output_names,
            })
        };

        Ok(Self {
            stages: [
                load(Stage::Encoder)?,
                load(Stage::ErbDecoder)?,
                load(Stage::DeepFilterDecoder)?,
            ],
        })
    }
}

impl InferenceSession for OrtSession {
    fn run(&mut self, stage: Stage, inputs: &TensorMap) -> Result<TensorMap> {
        let ort_err = |e: ort::Error| VocanaError::runtime(stage.name(), e);
        let StageSession {
            session,
            input_names,
            output_names,
        } = &mut self.stages[stage.index()];

        let mut feeds = Vec::with_capacity(input_names.len());
        for name in input_names.iter() {
            let tensor = inputs.get(name.as_str()).ok_or_else(|| {
                VocanaError::runtime(stage.name(), format!("missing input '{}'", name))
            })?;
            let value = ort::value::Tensor::from_array((tensor.shape().to_vec(), tensor.data().to_vec()))
                .map_err(ort_err)?;
            feeds.push((name.clone(), value.into_dyn()));
        }

        let outputs = session.run(feeds).map_err(ort_err)?;

        let mut result = TensorMap::new();
        for name in output_names.iter() {
            let (shape, data) = outputs[name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(ort_err)?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            result.insert(name.clone(), Arc::new(Tensor::new(dims, data.to_vec())?));
        }
        debug!("{} produced {} outputs", stage, result.len());
        Ok(result)
    }

    fn backend(&self) -> &str {
        "onnxruntime"
    }
}
