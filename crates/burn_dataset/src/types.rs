//! Error definitions and shared data structures for burn_dataset.

use data_contracts::{BoxTransform, ImageBuffer, ObjectLabel, SampleId, StreamKind};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, BurnDatasetError>;

#[derive(Debug, Error)]
pub enum BurnDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest validation failed at {path}: {msg}")]
    Validation { path: PathBuf, msg: String },
    #[error("SemiBalanceSampler: {0}")]
    Sampler(String),
    #[error("batch contains varying image sizes: {first:?} vs {other:?}")]
    VaryingImageSize { first: (u32, u32), other: (u32, u32) },
    #[error("batch prefetcher stopped: {0}")]
    SourceClosed(String),
    #[error("{0}")]
    Other(String),
}

/// A sample materialised for one training step.
///
/// `weak` and `strong` are two views of the same image. Annotations stay in the original
/// frame; `strong_from_original` and `weak_to_strong` map boxes between frames.
#[derive(Debug, Clone)]
pub struct AugmentedSample {
    pub id: SampleId,
    pub stream: StreamKind,
    pub weak: ImageBuffer,
    pub strong: ImageBuffer,
    pub weak_to_strong: BoxTransform,
    pub strong_from_original: BoxTransform,
    pub annotations: Option<Vec<ObjectLabel>>,
}

impl AugmentedSample {
    /// Ground truth expressed in the strong-view frame.
    pub fn strong_targets(&self) -> Vec<ObjectLabel> {
        self.annotations
            .iter()
            .flatten()
            .map(|label| ObjectLabel {
                bbox: self.strong_from_original.apply(label.bbox),
                class_id: label.class_id,
            })
            .collect()
    }
}

/// How many times each stream has been fully consumed and reshuffled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamEpochs {
    pub labeled: u64,
    pub unlabeled: u64,
}
