//! The semi-supervised wrapper: supervised loss on labeled items, pseudo-labelled loss on
//! unlabeled items, combined with `unsup_weight`.

use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use burn_dataset::{collate_images, BurnDatasetError, MixedBatch};
use data_contracts::{BoxTransform, ImageBuffer, ObjectLabel};
use models::{Detector, ForwardOptions, LossWeights, ModelInputError, PostProcess};
use serde::Serialize;

use crate::config::SsodTrainConfig;
use crate::error::{TrainError, TrainResult};
use crate::evaluator::stage_post_process;
use crate::pair::ModelPair;
use crate::pseudo_label::{generate, PseudoLabelFilter};

const COMPONENT: &str = "DinoDetrSsod";

/// Per-step numbers reported to hooks. Loss terms are `None` when their sub-batch was empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepStats {
    pub labeled: usize,
    pub unlabeled: usize,
    pub gt_count: usize,
    pub sup_class: Option<f32>,
    pub sup_bbox: Option<f32>,
    pub unsup_class: Option<f32>,
    pub unsup_bbox: Option<f32>,
    pub total: Option<f32>,
    pub pseudo_raw: usize,
    pub pseudo_kept: usize,
    /// Teacher output was NMS-filtered before pseudo-labelling.
    pub pseudo_nms: bool,
}

pub struct StepLoss<B: Backend> {
    /// `None` means no supervision this step; the optimizer must not be stepped.
    pub total: Option<Tensor<B, 1>>,
    pub stats: StepStats,
}

pub(crate) fn scalar_value<B: Backend>(t: &Tensor<B, 1>) -> f32 {
    t.clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .into_iter()
        .next()
        .unwrap_or(f32::NAN)
}

fn collate<B: Backend>(images: &[&ImageBuffer], device: &B::Device) -> TrainResult<Tensor<B, 4>> {
    collate_images::<B>(images, device).map_err(|e| match e {
        BurnDatasetError::VaryingImageSize { first, other } => TrainError::model_input(
            COMPONENT,
            ModelInputError::Shape {
                what: "image batch",
                expected: format!("all images {}x{}", first.0, first.1),
                actual: format!("{}x{}", other.0, other.1),
            },
        ),
        other => other.into(),
    })
}

#[derive(Debug, Clone)]
pub struct DinoDetrSsod {
    cfg: SsodTrainConfig,
    filter: PseudoLabelFilter,
    loss_weights: LossWeights,
    nms_iou: f32,
}

impl DinoDetrSsod {
    pub fn new(cfg: SsodTrainConfig) -> Self {
        let filter = PseudoLabelFilter {
            score_threshold: cfg.pseudo_label_initial_score_thr,
            min_box_size: cfg.min_pseduo_box_size,
        };
        Self {
            cfg,
            filter,
            loss_weights: LossWeights::default(),
            nms_iou: 0.7,
        }
    }

    pub fn with_nms_iou(mut self, iou: f32) -> Self {
        self.nms_iou = iou;
        self
    }

    pub fn config(&self) -> &SsodTrainConfig {
        &self.cfg
    }

    pub fn filter(&self) -> PseudoLabelFilter {
        self.filter
    }

    /// Builds the step's loss graph on the student. `completed_iters` is the number of optimizer
    /// iterations finished before this step (its 0-based index) and only selects the teacher's
    /// post-processing for stage-wise heads, see [`stage_post_process`].
    pub fn forward_train<B, M>(
        &self,
        pair: &ModelPair<B, M>,
        batch: &MixedBatch,
        completed_iters: usize,
        device: &B::Device,
    ) -> TrainResult<StepLoss<B>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + Detector<B>,
        M::InnerModule: Detector<B::InnerBackend>,
    {
        let student = pair.student();
        let mut stats = StepStats {
            labeled: batch.labeled.len(),
            unlabeled: batch.unlabeled.len(),
            ..Default::default()
        };
        let input_err = |e: ModelInputError| TrainError::model_input(COMPONENT, e);

        let sup = if batch.labeled.is_empty() {
            None
        } else {
            let views: Vec<&ImageBuffer> = batch.labeled.iter().map(|s| &s.strong).collect();
            let images = collate::<B>(&views, device)?;
            let targets: Vec<Vec<ObjectLabel>> =
                batch.labeled.iter().map(|s| s.strong_targets()).collect();
            stats.gt_count = targets.iter().map(Vec::len).sum();
            let output = student
                .forward_detector(images, ForwardOptions::default())
                .map_err(input_err)?;
            let losses = student.loss(&output, &targets).map_err(input_err)?;
            stats.sup_class = Some(scalar_value(&losses.class));
            stats.sup_bbox = Some(scalar_value(&losses.bbox));
            Some(losses.total(self.loss_weights))
        };

        let unsup = if batch.unlabeled.is_empty() {
            None
        } else {
            let teacher = pair.teacher();
            let weak: Vec<&ImageBuffer> = batch.unlabeled.iter().map(|s| &s.weak).collect();
            let weak_images = collate::<B::InnerBackend>(&weak, device)?;
            let transforms: Vec<BoxTransform> =
                batch.unlabeled.iter().map(|s| s.weak_to_strong).collect();
            let post = stage_post_process(
                teacher.warm_up_step(),
                completed_iters,
                PostProcess {
                    max_per_image: teacher.num_queries(),
                    nms_iou: None,
                },
                self.nms_iou,
            );
            let pseudo = generate(teacher, weak_images, &transforms, self.filter, post)
                .map_err(input_err)?;
            stats.pseudo_raw = pseudo.raw_count;
            stats.pseudo_kept = pseudo.kept_count;
            stats.pseudo_nms = post.nms_iou.is_some();

            let strong: Vec<&ImageBuffer> = batch.unlabeled.iter().map(|s| &s.strong).collect();
            let images = collate::<B>(&strong, device)?;
            let mut options = ForwardOptions::default();
            if self.cfg.use_teacher_proposal {
                let proposals = Tensor::<B, 3>::from_data(
                    TensorData::new(
                        pseudo.proposals.clone(),
                        [batch.unlabeled.len(), pseudo.queries, 4],
                    ),
                    device,
                );
                options = options.with_proposals(proposals);
            }
            if self.cfg.aug_query {
                options = options.with_query_noise(self.cfg.aug_query_std);
            }
            let output = student
                .forward_detector(images, options)
                .map_err(input_err)?;
            let losses = student
                .loss(&output, &pseudo.targets())
                .map_err(input_err)?;
            stats.unsup_class = Some(scalar_value(&losses.class));
            stats.unsup_bbox = Some(scalar_value(&losses.bbox));
            Some(losses.total(self.loss_weights))
        };

        let weight = self.cfg.unsup_weight;
        let total = match (sup, unsup) {
            (Some(s), Some(_)) if weight == 0.0 => Some(s),
            (Some(s), Some(u)) => Some(s + u.mul_scalar(weight)),
            (Some(s), None) => Some(s),
            (None, Some(u)) if weight > 0.0 => Some(u.mul_scalar(weight)),
            (None, _) => None,
        };
        stats.total = total.as_ref().map(scalar_value);

        Ok(StepLoss { total, stats })
    }
}
