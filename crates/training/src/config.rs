//! TOML experiment configuration.

use burn_dataset::AugmentConfig;
use models::QueryDetectorConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{TrainError, TrainResult};
use crate::evaluator::InferenceTarget;
use crate::registry::{EvaluationSpec, HookSpec, RunnerSpec, SamplerSpec, WrapperSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsodConfig {
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    pub data: DataConfig,
    #[serde(default)]
    pub model: QueryDetectorConfig,
    #[serde(default)]
    pub semi_wrapper: WrapperSpec,
    #[serde(default)]
    pub mean_teacher: MeanTeacherConfig,
    #[serde(default)]
    pub custom_hooks: Vec<HookSpec>,
    #[serde(default)]
    pub runner: RunnerSpec,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub lr_config: LrConfig,
    #[serde(default)]
    pub evaluation: EvaluationSpec,
    #[serde(default)]
    pub checkpoint_config: CheckpointConfig,
    #[serde(default)]
    pub log_config: LogConfig,
    /// Seeds the backend RNG used for parameter init.
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub labeled: PathBuf,
    pub unlabeled: PathBuf,
    #[serde(default)]
    pub val: Option<PathBuf>,
    pub classes: Vec<String>,
    #[serde(default = "default_samples_per_gpu")]
    pub samples_per_gpu: usize,
    /// Prefetch depth; 0 materialises batches on the training thread.
    #[serde(default = "default_workers_per_gpu")]
    pub workers_per_gpu: usize,
    #[serde(default)]
    pub sampler: SamplerSpec,
    #[serde(default)]
    pub augmentation: AugmentConfig,
}

fn default_samples_per_gpu() -> usize {
    5
}

fn default_workers_per_gpu() -> usize {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsodTrainConfig {
    pub use_teacher_proposal: bool,
    pub pseudo_label_initial_score_thr: f32,
    pub min_pseduo_box_size: f32,
    pub unsup_weight: f32,
    pub aug_query: bool,
    pub aug_query_std: f64,
}

impl Default for SsodTrainConfig {
    fn default() -> Self {
        Self {
            use_teacher_proposal: false,
            pseudo_label_initial_score_thr: 0.4,
            min_pseduo_box_size: 0.0,
            unsup_weight: 4.0,
            aug_query: false,
            aug_query_std: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SsodTestConfig {
    pub inference_on: InferenceTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanTeacherConfig {
    pub momentum: f64,
    pub interval: usize,
    pub warm_up: usize,
    /// Hard-copy the student into the teacher once when warm-up ends.
    pub copy_on_activation: bool,
}

impl Default for MeanTeacherConfig {
    fn default() -> Self {
        Self {
            momentum: 0.999,
            interval: 1,
            warm_up: 0,
            copy_on_activation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub weight_decay: f32,
    pub grad_clip_norm: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            weight_decay: 1e-4,
            grad_clip_norm: Some(0.1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrConfig {
    /// Milestones (0-based step index) at which the rate is multiplied by `gamma`.
    pub step: Vec<usize>,
    pub gamma: f64,
    pub warmup_iters: usize,
    pub warmup_ratio: f64,
}

impl Default for LrConfig {
    fn default() -> Self {
        Self {
            step: vec![16_000, 20_000],
            gamma: 0.1,
            warmup_iters: 0,
            warmup_ratio: 0.001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Iterations between evaluations; 0 disables periodic evaluation.
    pub interval: usize,
    pub iou_thr: f32,
    /// Score threshold for precision/recall.
    pub score_thr: f32,
    pub max_per_image: usize,
    /// Switch post-processing around the teacher head's warm-up step.
    pub stage_wise: bool,
    pub nms_iou: f32,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            interval: 50,
            iou_thr: 0.5,
            score_thr: 0.3,
            max_per_image: 100,
            stage_wise: false,
            nms_iou: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub interval: usize,
    pub max_keep_ckpts: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 50,
            max_keep_ckpts: Some(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub interval: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { interval: 50 }
    }
}

fn check(ok: bool, component: &'static str, message: impl FnOnce() -> String) -> TrainResult<()> {
    if ok {
        Ok(())
    } else {
        Err(TrainError::config(component, message()))
    }
}

impl SsodConfig {
    pub fn from_toml_str(raw: &str) -> TrainResult<Self> {
        let cfg: SsodConfig =
            toml::from_str(raw).map_err(|e| TrainError::config("config", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> TrainResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| TrainError::io("config", path, e))?;
        let mut cfg = Self::from_toml_str(&raw)?;
        cfg.resolve_relative_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        Ok(cfg)
    }

    /// Manifest paths are relative to the config file's directory.
    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.data.labeled);
        resolve(&mut self.data.unlabeled);
        if let Some(val) = self.data.val.as_mut() {
            resolve(val);
        }
    }

    pub fn max_iters(&self) -> usize {
        self.runner.max_iters()
    }

    pub fn validate(&self) -> TrainResult<()> {
        check(!self.data.classes.is_empty(), "data", || {
            "classes must list at least one category".to_string()
        })?;
        check(self.data.samples_per_gpu >= 1, "data", || {
            "samples_per_gpu must be at least 1".to_string()
        })?;

        let ratio = &self.data.sampler.config().sample_ratio;
        check(ratio.len() == 2, "SemiBalanceSampler", || {
            format!(
                "sample_ratio needs one weight per stream (labeled, unlabeled), got {}",
                ratio.len()
            )
        })?;
        check(
            ratio.iter().all(|w| w.is_finite() && *w > 0.0),
            "SemiBalanceSampler",
            || format!("sample_ratio weights must be positive and finite, got {ratio:?}"),
        )?;

        let train = self.semi_wrapper.train_cfg();
        check(
            train.unsup_weight.is_finite() && train.unsup_weight >= 0.0,
            "DinoDetrSsod",
            || format!("unsup_weight must be >= 0, got {}", train.unsup_weight),
        )?;
        check(
            (0.0..=1.0).contains(&train.pseudo_label_initial_score_thr),
            "DinoDetrSsod",
            || {
                format!(
                    "pseudo_label_initial_score_thr must be in [0, 1], got {}",
                    train.pseudo_label_initial_score_thr
                )
            },
        )?;
        check(
            train.min_pseduo_box_size.is_finite() && train.min_pseduo_box_size >= 0.0,
            "DinoDetrSsod",
            || {
                format!(
                    "min_pseduo_box_size must be >= 0, got {}",
                    train.min_pseduo_box_size
                )
            },
        )?;
        check(
            !train.aug_query || (train.aug_query_std.is_finite() && train.aug_query_std > 0.0),
            "DinoDetrSsod",
            || format!("aug_query_std must be > 0, got {}", train.aug_query_std),
        )?;

        let mt = &self.mean_teacher;
        check(
            mt.momentum.is_finite() && (0.0..1.0).contains(&mt.momentum),
            "MeanTeacher",
            || format!("momentum must be in [0, 1), got {}", mt.momentum),
        )?;
        check(mt.interval >= 1, "MeanTeacher", || {
            "interval must be at least 1".to_string()
        })?;

        check(self.max_iters() >= 1, "IterBasedRunner", || {
            "max_iters must be at least 1".to_string()
        })?;
        check(
            self.optimizer.lr.is_finite() && self.optimizer.lr > 0.0,
            "optimizer",
            || format!("lr must be > 0, got {}", self.optimizer.lr),
        )?;
        if let Some(clip) = self.optimizer.grad_clip_norm {
            check(clip.is_finite() && clip > 0.0, "optimizer", || {
                format!("grad_clip_norm must be > 0, got {clip}")
            })?;
        }
        check(
            self.lr_config.gamma.is_finite() && self.lr_config.gamma > 0.0,
            "lr_config",
            || format!("gamma must be > 0, got {}", self.lr_config.gamma),
        )?;
        check(
            (0.0..=1.0).contains(&self.lr_config.warmup_ratio),
            "lr_config",
            || {
                format!(
                    "warmup_ratio must be in [0, 1], got {}",
                    self.lr_config.warmup_ratio
                )
            },
        )?;
        check(self.checkpoint_config.interval >= 1, "CheckpointHook", || {
            "interval must be at least 1".to_string()
        })?;
        if let Some(keep) = self.checkpoint_config.max_keep_ckpts {
            check(keep >= 1, "CheckpointHook", || {
                "max_keep_ckpts must be at least 1 when set".to_string()
            })?;
        }
        let eval = self.evaluation.config();
        check((0.0..=1.0).contains(&eval.iou_thr), "evaluation", || {
            format!("iou_thr must be in [0, 1], got {}", eval.iou_thr)
        })?;
        check(self.log_config.interval >= 1, "TextLoggerHook", || {
            "log interval must be at least 1".to_string()
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data]
        labeled = "labeled.json"
        unlabeled = "unlabeled.json"
        classes = ["polyp"]
    "#;

    #[test]
    fn defaults_follow_reference_experiment() {
        let cfg = SsodConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.data.sampler.config().sample_ratio, vec![1.0, 4.0]);
        assert!(cfg.data.sampler.config().by_prob);
        let train = cfg.semi_wrapper.train_cfg();
        assert_eq!(train.pseudo_label_initial_score_thr, 0.4);
        assert_eq!(train.unsup_weight, 4.0);
        assert!(!train.use_teacher_proposal);
        assert_eq!(cfg.semi_wrapper.test_cfg().inference_on, InferenceTarget::Student);
        assert_eq!(cfg.mean_teacher.momentum, 0.999);
        assert_eq!(cfg.max_iters(), 20_000);
        assert_eq!(cfg.checkpoint_config.max_keep_ckpts, Some(5));
        assert!(cfg.evaluation.sub_modules());
    }

    #[test]
    fn ratio_length_mismatch_is_a_configuration_error() {
        let raw = format!(
            "{MINIMAL}\n[data.sampler]\ntype = \"SemiBalanceSampler\"\n\
             sample_ratio = [1.0, 2.0, 3.0]\n"
        );
        let err = SsodConfig::from_toml_str(&raw).unwrap_err();
        assert!(matches!(
            err,
            TrainError::Configuration {
                component: "SemiBalanceSampler",
                ..
            }
        ));
    }

    #[test]
    fn momentum_out_of_range_is_rejected() {
        let raw = format!("{MINIMAL}\n[mean_teacher]\nmomentum = 1.0\n");
        let err = SsodConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("MeanTeacher"));
    }

    #[test]
    fn unknown_wrapper_type_is_rejected() {
        let raw = format!("{MINIMAL}\n[semi_wrapper]\ntype = \"SoftTeacher\"\n");
        assert!(SsodConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    fn shipped_config_parses() {
        let raw = include_str!("../../../configs/dino_ssod.toml");
        let cfg = SsodConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.model.num_classes, cfg.data.classes.len());
        assert_eq!(cfg.custom_hooks.len(), 2);
        assert_eq!(cfg.semi_wrapper.test_cfg().inference_on, InferenceTarget::Teacher);
        assert!(cfg.model.stage_wise);
    }
}
