#![recursion_limit = "256"]
//! Semi-supervised Mean Teacher training for query-based detectors.
//!
//! The runner pulls mixed labeled/unlabeled batches, builds the supervised and
//! pseudo-labelled losses through [`DinoDetrSsod`], steps the student and lets the
//! [`MeanTeacherUpdater`] move the teacher. Checkpoints, evaluation and hooks run at
//! configured intervals.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod experiment;
pub mod hooks;
pub mod lr_schedule;
pub mod mean_teacher;
pub mod metrics;
pub mod pair;
pub mod progress;
pub mod pseudo_label;
pub mod registry;
pub mod runner;
pub mod wrapper;

pub use checkpoint::{CheckpointManager, CheckpointMeta, CheckpointPayload};
pub use config::SsodConfig;
pub use error::{TrainError, TrainResult};
pub use evaluator::{EvalReport, InferenceTarget, StageAwareEvaluator};
pub use experiment::{evaluate_checkpoint, run_experiment, EvalOptions, RunOptions};
pub use hooks::{HookRegistry, TrainingHook};
pub use mean_teacher::{EmaOutcome, MeanTeacherUpdater};
pub use pair::ModelPair;
pub use progress::TrainingProgress;
pub use runner::{IterBasedRunner, RunSummary, StopHandle};
pub use wrapper::{DinoDetrSsod, StepStats};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type ADBackend = burn::backend::Autodiff<TrainBackend>;
