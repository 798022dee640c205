use burn::module::{Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::{Detection, ObjectLabel};
use thiserror::Error;

use crate::loss::DetectionLosses;
use crate::postprocess::PostProcess;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelInputError {
    #[error("detector received an empty image batch")]
    EmptyBatch,
    #[error("detector received malformed {what}: expected {expected}, got {actual}")]
    Shape {
        what: &'static str,
        expected: String,
        actual: String,
    },
}

/// Raw set prediction: ordered boxes `[N, Q, 4]` in 0..1 and class logits `[N, Q, C]`.
#[derive(Debug, Clone)]
pub struct DetectorOutput<B: Backend> {
    pub boxes: Tensor<B, 3>,
    pub logits: Tensor<B, 3>,
}

impl<B: Backend> DetectorOutput<B> {
    pub fn batch_size(&self) -> usize {
        self.boxes.dims()[0]
    }
}

/// Per-call forward switches.
#[derive(Debug, Clone)]
pub struct ForwardOptions<B: Backend> {
    /// Reference boxes `[N, Q, 4]` replacing the learned ones.
    pub proposals: Option<Tensor<B, 3>>,
    /// Std of Gaussian noise added to the decoder queries.
    pub query_noise: Option<f64>,
}

impl<B: Backend> Default for ForwardOptions<B> {
    fn default() -> Self {
        Self {
            proposals: None,
            query_noise: None,
        }
    }
}

impl<B: Backend> ForwardOptions<B> {
    pub fn with_proposals(mut self, proposals: Tensor<B, 3>) -> Self {
        self.proposals = Some(proposals);
        self
    }

    pub fn with_query_noise(mut self, std: f64) -> Self {
        self.query_noise = Some(std);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Snapshot of every parameter tensor of a model, in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelParameters {
    pub tensors: Vec<NamedTensor>,
}

impl ModelParameters {
    pub fn push<B: Backend, const D: usize>(
        &mut self,
        name: impl Into<String>,
        param: &Param<Tensor<B, D>>,
    ) {
        let tensor = param.val();
        let shape = tensor.dims().to_vec();
        let values = tensor.into_data().to_vec::<f32>().unwrap_or_default();
        self.tensors.push(NamedTensor {
            name: name.into(),
            shape,
            values,
        });
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn scalar_count(&self) -> usize {
        self.tensors.iter().map(|t| t.values.len()).sum()
    }

    /// Largest elementwise difference; `f32::INFINITY` when layouts differ.
    pub fn max_abs_diff(&self, other: &ModelParameters) -> f32 {
        if self.tensors.len() != other.tensors.len() {
            return f32::INFINITY;
        }
        let mut worst = 0.0f32;
        for (a, b) in self.tensors.iter().zip(other.tensors.iter()) {
            if a.name != b.name || a.shape != b.shape {
                return f32::INFINITY;
            }
            for (x, y) in a.values.iter().zip(b.values.iter()) {
                worst = worst.max((x - y).abs());
            }
        }
        worst
    }

    pub fn bit_identical(&self, other: &ModelParameters) -> bool {
        self.tensors.len() == other.tensors.len()
            && self.tensors.iter().zip(other.tensors.iter()).all(|(a, b)| {
                a.name == b.name
                    && a.shape == b.shape
                    && a.values.len() == b.values.len()
                    && a
                        .values
                        .iter()
                        .zip(b.values.iter())
                        .all(|(x, y)| x.to_bits() == y.to_bits())
            })
    }
}

/// What the semi-supervised orchestration needs from a detector.
pub trait Detector<B: Backend>: Module<B> {
    fn forward_detector(
        &self,
        images: Tensor<B, 4>,
        options: ForwardOptions<B>,
    ) -> Result<DetectorOutput<B>, ModelInputError>;

    /// Set-prediction loss against per-image targets (one entry per batch item).
    fn loss(
        &self,
        output: &DetectorOutput<B>,
        targets: &[Vec<ObjectLabel>],
    ) -> Result<DetectionLosses<B>, ModelInputError>;

    /// Top-k decoding into per-image detections.
    fn decode(&self, output: &DetectorOutput<B>, post: PostProcess) -> Vec<Vec<Detection>>;

    /// `self ← momentum·self + (1 − momentum)·source` over every parameter.
    fn ema_blend(self, source: &Self, momentum: f64) -> Self;

    fn parameters(&self) -> ModelParameters;

    fn num_classes(&self) -> usize;

    fn num_queries(&self) -> usize;

    /// Step at which a stage-wise head switches from one-to-many to one-to-one matching.
    fn warm_up_step(&self) -> Option<usize>;
}
