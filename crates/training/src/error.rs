use burn_dataset::BurnDatasetError;
use models::ModelInputError;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainError>;

/// Every variant names the component that raised it.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("{component}: invalid configuration: {message}")]
    Configuration {
        component: &'static str,
        message: String,
    },
    #[error("{component}: bad model input: {source}")]
    ModelInput {
        component: &'static str,
        #[source]
        source: ModelInputError,
    },
    #[error("{component}: io error at {path}: {source}")]
    Io {
        component: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CheckpointManager: {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
    #[error("CheckpointManager: recorder failed: {0}")]
    Recorder(String),
    #[error("dataset: {0}")]
    Dataset(#[source] BurnDatasetError),
    #[error("IterBasedRunner: non-finite loss {value} at iteration {iteration}")]
    NonFiniteLoss { iteration: usize, value: f32 },
}

impl TrainError {
    pub fn config(component: &'static str, message: impl Into<String>) -> Self {
        TrainError::Configuration {
            component,
            message: message.into(),
        }
    }

    pub fn model_input(component: &'static str, source: ModelInputError) -> Self {
        TrainError::ModelInput { component, source }
    }

    pub fn io(component: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            component,
            path: path.into(),
            source,
        }
    }
}

impl From<BurnDatasetError> for TrainError {
    fn from(err: BurnDatasetError) -> Self {
        match err {
            BurnDatasetError::Sampler(message) => TrainError::Configuration {
                component: "SemiBalanceSampler",
                message,
            },
            other => TrainError::Dataset(other),
        }
    }
}
