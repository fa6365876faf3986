// src/rl/inference.rs
//
// Inference backend interface and a dense affine backend.
//
// A backend maps a named set of float vectors to another named set. The
// environment feeds the flattened observation under `OBS_INPUT` and reads the
// action from `ACTIONS_OUTPUT` (or the first output when that name is absent).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Input tensor name carrying the flattened observation.
pub const OBS_INPUT: &str = "obs";

/// Preferred output tensor name for the raw policy action.
pub const ACTIONS_OUTPUT: &str = "actions";

/// Named float tensors (flattened). Ordered by name.
pub type TensorMap = BTreeMap<String, Vec<f32>>;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("missing input tensor '{0}'")]
    MissingInput(String),
    #[error("input '{name}' has width {found}, expected {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("non-finite value in output '{0}'")]
    NonFinite(String),
    #[error("failed to read policy file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid policy: {0}")]
    InvalidModel(String),
}

/// Synchronous policy evaluation.
pub trait InferenceBackend: Send {
    /// Evaluate the policy. Fails on missing or mis-shaped inputs.
    fn forward(&mut self, inputs: &TensorMap) -> Result<TensorMap, InferenceError>;

    /// Width of the observation input, when the model declares one.
    fn input_width(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Tanh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffineHead {
    /// Row-major `[out][in]`.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default)]
    pub activation: Activation,
}

/// `y = act(W x + b)` per named output head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearBackend {
    #[serde(default = "default_input_name")]
    pub input: String,
    pub input_width: usize,
    pub outputs: BTreeMap<String, AffineHead>,
}

fn default_input_name() -> String {
    OBS_INPUT.to_string()
}

impl LinearBackend {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, InferenceError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| InferenceError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> Result<Self, InferenceError> {
        let backend: LinearBackend = serde_json::from_str(json)?;
        backend.validate()?;
        Ok(backend)
    }

    /// Zero-weight heads producing `bias` regardless of input.
    pub fn constant(input_width: usize, outputs: &[(&str, Vec<f32>)]) -> Self {
        let outputs = outputs
            .iter()
            .map(|(name, bias)| {
                (
                    name.to_string(),
                    AffineHead {
                        weights: vec![vec![0.0; input_width]; bias.len()],
                        bias: bias.clone(),
                        activation: Activation::Identity,
                    },
                )
            })
            .collect();
        Self {
            input: OBS_INPUT.to_string(),
            input_width,
            outputs,
        }
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.outputs.is_empty() {
            return Err(InferenceError::InvalidModel("no output heads".to_string()));
        }
        for (name, head) in &self.outputs {
            if head.weights.len() != head.bias.len() {
                return Err(InferenceError::InvalidModel(format!(
                    "head '{}': {} weight rows but {} biases",
                    name,
                    head.weights.len(),
                    head.bias.len()
                )));
            }
            if let Some((row, w)) = head
                .weights
                .iter()
                .enumerate()
                .find(|(_, w)| w.len() != self.input_width)
            {
                return Err(InferenceError::InvalidModel(format!(
                    "head '{}': row {} has {} columns, expected {}",
                    name,
                    row,
                    w.len(),
                    self.input_width
                )));
            }
        }
        Ok(())
    }
}

impl InferenceBackend for LinearBackend {
    fn forward(&mut self, inputs: &TensorMap) -> Result<TensorMap, InferenceError> {
        let x = inputs
            .get(&self.input)
            .ok_or_else(|| InferenceError::MissingInput(self.input.clone()))?;
        if x.len() != self.input_width {
            return Err(InferenceError::ShapeMismatch {
                name: self.input.clone(),
                expected: self.input_width,
                found: x.len(),
            });
        }

        let mut out = TensorMap::new();
        for (name, head) in &self.outputs {
            let y: Vec<f32> = head
                .weights
                .iter()
                .zip(&head.bias)
                .map(|(row, b)| {
                    let z = row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f32>() + b;
                    match head.activation {
                        Activation::Identity => z,
                        Activation::Tanh => z.tanh(),
                    }
                })
                .collect();
            if y.iter().any(|v| !v.is_finite()) {
                return Err(InferenceError::NonFinite(name.clone()));
            }
            out.insert(name.clone(), y);
        }
        Ok(out)
    }

    fn input_width(&self) -> Option<usize> {
        Some(self.input_width)
    }
}
