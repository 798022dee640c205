//! Stage-aware evaluation of the student/teacher pair.

use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_dataset::{collate_images, BurnDatasetError};
use data_contracts::{ImageBuffer, ObjectLabel, Sample};
use models::{Detector, ForwardOptions, ModelInputError, PostProcess};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::EvaluationConfig;
use crate::error::{TrainError, TrainResult};
use crate::metrics::{evaluate_detections, DetectionMetrics};
use crate::pair::ModelPair;

const COMPONENT: &str = "StageAwareEvaluator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceTarget {
    #[default]
    Student,
    Teacher,
}

impl InferenceTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceTarget::Student => "student",
            InferenceTarget::Teacher => "teacher",
        }
    }
}

impl fmt::Display for InferenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InferenceTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "student" => Ok(InferenceTarget::Student),
            "teacher" => Ok(InferenceTarget::Teacher),
            other => Err(format!("unknown inference target `{other}` (student|teacher)")),
        }
    }
}

/// Before the head's warm-up step a stage-wise head is still in its one-to-many stage and its
/// output needs class-wise NMS; afterwards raw one-to-one predictions are used.
///
/// `curr_step` counts the optimizer iterations completed when the model runs. Pseudo-labelling
/// in the step with 0-based index `i` passes `i`; evaluation after iteration `n` (and of an
/// `iter_n` checkpoint) passes `n`. The same teacher weights thus get the same post-processing
/// on both paths.
pub fn stage_post_process(
    warm_up_step: Option<usize>,
    curr_step: usize,
    base: PostProcess,
    nms_iou: f32,
) -> PostProcess {
    match warm_up_step {
        Some(warm_up) if curr_step < warm_up => base.with_nms(nms_iou),
        _ => PostProcess {
            nms_iou: None,
            ..base
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMetrics {
    pub target: InferenceTarget,
    pub nms_applied: bool,
    pub metrics: DetectionMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub curr_step: usize,
    pub results: Vec<TargetMetrics>,
}

impl EvalReport {
    pub fn get(&self, target: InferenceTarget) -> Option<&TargetMetrics> {
        self.results.iter().find(|r| r.target == target)
    }
}

#[derive(Debug, Clone)]
pub struct StageAwareEvaluator {
    samples: Arc<[Sample]>,
    cfg: EvaluationConfig,
    num_classes: usize,
    batch_size: usize,
    inference_on: InferenceTarget,
    sub_modules: bool,
}

impl StageAwareEvaluator {
    pub fn new(
        samples: Arc<[Sample]>,
        cfg: EvaluationConfig,
        num_classes: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            samples,
            cfg,
            num_classes,
            batch_size: batch_size.max(1),
            inference_on: InferenceTarget::Student,
            sub_modules: false,
        }
    }

    pub fn with_inference_on(mut self, target: InferenceTarget) -> Self {
        self.inference_on = target;
        self
    }

    /// Score student and teacher in one pass.
    pub fn with_sub_modules(mut self, enabled: bool) -> Self {
        self.sub_modules = enabled;
        self
    }

    pub fn with_stage_wise(mut self, enabled: bool) -> Self {
        self.cfg.stage_wise = enabled;
        self
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.cfg
    }

    pub fn targets(&self) -> Vec<InferenceTarget> {
        if self.sub_modules {
            vec![InferenceTarget::Student, InferenceTarget::Teacher]
        } else {
            vec![self.inference_on]
        }
    }

    /// Stage-wise evaluation needs the teacher head to expose its warm-up step.
    pub fn check_stage_wise<B: Backend, D: Detector<B>>(
        &self,
        teacher: &D,
    ) -> TrainResult<Option<usize>> {
        if !self.cfg.stage_wise {
            return Ok(None);
        }
        teacher.warm_up_step().map(Some).ok_or_else(|| {
            TrainError::config(
                COMPONENT,
                "stage-wise evaluation requires the teacher head to expose warm_up_step",
            )
        })
    }

    pub fn evaluate_pair<B, M>(
        &self,
        pair: &ModelPair<B, M>,
        curr_step: usize,
        device: &B::Device,
    ) -> TrainResult<EvalReport>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + Detector<B>,
        M::InnerModule: Detector<B::InnerBackend>,
    {
        let warm_up = self.check_stage_wise::<B::InnerBackend, _>(pair.teacher())?;
        let mut results = Vec::new();
        for target in self.targets() {
            let entry = match target {
                InferenceTarget::Student => {
                    let student = pair.student().valid();
                    self.evaluate_model::<B::InnerBackend, _>(
                        &student, target, warm_up, curr_step, device,
                    )?
                }
                InferenceTarget::Teacher => {
                    self.evaluate_model::<B::InnerBackend, _>(
                        pair.teacher(),
                        target,
                        warm_up,
                        curr_step,
                        device,
                    )?
                }
            };
            results.push(entry);
        }
        Ok(EvalReport { curr_step, results })
    }

    pub fn evaluate_model<B: Backend, D: Detector<B>>(
        &self,
        model: &D,
        target: InferenceTarget,
        warm_up: Option<usize>,
        curr_step: usize,
        device: &B::Device,
    ) -> TrainResult<TargetMetrics> {
        let base = PostProcess {
            max_per_image: self.cfg.max_per_image,
            nms_iou: None,
        };
        let post = stage_post_process(warm_up, curr_step, base, self.cfg.nms_iou);

        let mut predictions = Vec::with_capacity(self.samples.len());
        let mut ground_truth: Vec<Vec<ObjectLabel>> = Vec::with_capacity(self.samples.len());
        for chunk in self.samples.chunks(self.batch_size) {
            let views: Vec<&ImageBuffer> = chunk.iter().map(|s| &s.image).collect();
            let images = collate_images::<B>(&views, device).map_err(|e| match e {
                BurnDatasetError::VaryingImageSize { first, other } => TrainError::model_input(
                    COMPONENT,
                    ModelInputError::Shape {
                        what: "image batch",
                        expected: format!("all images {}x{}", first.0, first.1),
                        actual: format!("{}x{}", other.0, other.1),
                    },
                ),
                other => other.into(),
            })?;
            let output = model
                .forward_detector(images, ForwardOptions::default())
                .map_err(|e| TrainError::model_input(COMPONENT, e))?;
            predictions.extend(model.decode(&output, post));
            ground_truth.extend(chunk.iter().map(|s| s.annotations.clone().unwrap_or_default()));
        }

        let metrics = evaluate_detections(
            &predictions,
            &ground_truth,
            self.num_classes,
            self.cfg.iou_thr,
            self.cfg.score_thr,
        );
        tracing::info!(
            model = %target,
            curr_step,
            map50 = metrics.map50,
            map = metrics.map,
            precision = metrics.precision,
            recall = metrics.recall,
            nms = post.nms_iou.is_some(),
            "evaluation finished"
        );
        Ok(TargetMetrics {
            target,
            nms_applied: post.nms_iou.is_some(),
            metrics,
        })
    }
}
