//! Builds every component from an `SsodConfig` and runs or scores an experiment.

use burn::grad_clipping::GradientClippingConfig;
use burn::optim::AdamWConfig;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_dataset::{
    load_manifest, BatchPrefetcher, BatchSource, SemiBalanceSampler, SemiDataset,
    SyncBatchSource, ViewPipeline,
};
use models::{Detector, QueryDetector};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::checkpoint::{
    load_checkpoint, parse_iteration, restore_pair, restore_teacher, CheckpointManager,
};
use crate::config::SsodConfig;
use crate::error::{TrainError, TrainResult};
use crate::evaluator::{EvalReport, InferenceTarget, StageAwareEvaluator};
use crate::hooks::HookRegistry;
use crate::lr_schedule::StepLrSchedule;
use crate::mean_teacher::MeanTeacherUpdater;
use crate::pair::ModelPair;
use crate::runner::{IterBasedRunner, RunSummary, RunnerComponents, RunnerSettings, StopHandle};
use crate::wrapper::DinoDetrSsod;
use crate::ADBackend;

/// CLI-level overrides applied on top of the config.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub work_dir: PathBuf,
    pub resume_from: Option<PathBuf>,
    pub max_iters: Option<usize>,
    pub seed: Option<u64>,
    /// Checkpoint whose teacher section initialises the teacher.
    pub teacher_init: Option<PathBuf>,
    pub stop: Option<StopHandle>,
}

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub checkpoint: PathBuf,
    pub inference_on: InferenceTarget,
    pub stage_wise: bool,
    /// Where to write `eval_{step}_{timestamp}.json`; nothing is written when `None`.
    pub save_dir: Option<PathBuf>,
}

/// Seeds flow into the sampler, the view pipeline and the backend unless they set their own.
pub fn apply_overrides(cfg: &mut SsodConfig, max_iters: Option<usize>, seed: Option<u64>) {
    if let Some(max_iters) = max_iters {
        cfg.runner.set_max_iters(max_iters);
    }
    if seed.is_some() {
        cfg.seed = seed;
    }
    if let Some(seed) = cfg.seed {
        cfg.data.sampler.config_mut().seed.get_or_insert(seed);
        cfg.data.augmentation.seed.get_or_insert(seed);
    }
}

type InnerBackend = <ADBackend as AutodiffBackend>::InnerBackend;

fn device() -> <ADBackend as Backend>::Device {
    Default::default()
}

fn batch_source(cfg: &SsodConfig, dataset: SemiDataset) -> TrainResult<Box<dyn BatchSource>> {
    let sampler = SemiBalanceSampler::new(
        cfg.data.sampler.config(),
        dataset.labeled.len(),
        dataset.unlabeled.len(),
    )?;
    let pipeline = ViewPipeline::new(cfg.data.augmentation.clone());
    tracing::info!(
        labeled = dataset.labeled.len(),
        unlabeled = dataset.unlabeled.len(),
        p_labeled = sampler.labeled_probability(),
        by_prob = sampler.by_prob(),
        views = %pipeline.describe(),
        "data pipeline ready"
    );
    let batch_size = cfg.data.samples_per_gpu;
    Ok(if cfg.data.workers_per_gpu == 0 {
        Box::new(SyncBatchSource::new(sampler, dataset, pipeline, batch_size))
    } else {
        Box::new(BatchPrefetcher::spawn(
            sampler,
            dataset,
            pipeline,
            batch_size,
            cfg.data.workers_per_gpu,
        ))
    })
}

fn build_evaluator(
    cfg: &SsodConfig,
    inference_on: InferenceTarget,
) -> TrainResult<Option<StageAwareEvaluator>> {
    let Some(val) = &cfg.data.val else {
        return Ok(None);
    };
    let samples = load_manifest(val)?.into_samples();
    tracing::info!(path = %val.display(), samples = samples.len(), "validation set loaded");
    Ok(Some(
        StageAwareEvaluator::new(
            Arc::from(samples),
            cfg.evaluation.config().clone(),
            cfg.model.num_classes,
            cfg.data.samples_per_gpu,
        )
        .with_inference_on(inference_on)
        .with_sub_modules(cfg.evaluation.sub_modules()),
    ))
}

/// Trains per `cfg`, writing checkpoints and step records under `opts.work_dir`.
pub fn run_experiment(mut cfg: SsodConfig, opts: RunOptions) -> TrainResult<RunSummary> {
    apply_overrides(&mut cfg, opts.max_iters, opts.seed);
    cfg.validate()?;
    let work_dir = opts.work_dir.clone();
    fs::create_dir_all(&work_dir).map_err(|e| TrainError::io("IterBasedRunner", &work_dir, e))?;
    match toml::to_string_pretty(&cfg) {
        Ok(dumped) => {
            let dump_path = work_dir.join("config.toml");
            fs::write(&dump_path, dumped).map_err(|e| TrainError::io("config", &dump_path, e))?;
        }
        Err(e) => tracing::warn!(error = %e, "could not dump resolved config"),
    }

    if let Some(seed) = cfg.seed {
        ADBackend::seed(seed);
    }
    let device = device();

    let dataset = SemiDataset::from_manifests(&cfg.data.labeled, &cfg.data.unlabeled)?;
    if dataset.categories != cfg.data.classes {
        return Err(TrainError::config(
            "NumClassCheckHook",
            format!(
                "manifest categories {:?} differ from data.classes {:?}",
                dataset.categories, cfg.data.classes
            ),
        ));
    }
    let dataset_classes = dataset.categories.clone();
    let mut source = batch_source(&cfg, dataset)?;

    let student = QueryDetector::<ADBackend>::new(cfg.model.clone(), &device);
    let mut pair = ModelPair::from_student(student);
    if let Some(path) = &opts.teacher_init {
        let payload = load_checkpoint(path)?;
        let (student, teacher) = pair.into_parts();
        let teacher = restore_teacher::<InnerBackend, _>(&payload, teacher, &device)?;
        tracing::info!(path = %path.display(), "teacher initialised from checkpoint");
        pair = ModelPair::new(student, teacher);
    }

    let clip = cfg.optimizer.grad_clip_norm.map(GradientClippingConfig::Norm);
    let optim = AdamWConfig::new()
        .with_weight_decay(cfg.optimizer.weight_decay)
        .with_grad_clipping(clip)
        .init::<ADBackend, QueryDetector<ADBackend>>();

    let train_cfg = cfg.semi_wrapper.train_cfg().clone();
    let eval_cfg = cfg.evaluation.config().clone();
    let evaluator = if eval_cfg.interval == 0 {
        tracing::info!("evaluation.interval is 0; periodic evaluation disabled");
        None
    } else {
        build_evaluator(&cfg, cfg.semi_wrapper.test_cfg().inference_on)?
    };
    let parts = RunnerComponents {
        wrapper: DinoDetrSsod::new(train_cfg).with_nms_iou(eval_cfg.nms_iou),
        updater: MeanTeacherUpdater::new(&cfg.mean_teacher)?,
        schedule: StepLrSchedule::new(
            cfg.optimizer.lr,
            cfg.lr_config.gamma,
            cfg.lr_config.step.clone(),
        )
        .with_warmup(cfg.lr_config.warmup_iters, cfg.lr_config.warmup_ratio),
        hooks: HookRegistry::from_specs(&cfg.custom_hooks, &work_dir, cfg.log_config.interval),
        checkpoints: CheckpointManager::new(&work_dir, cfg.checkpoint_config.max_keep_ckpts),
        evaluator,
        settings: RunnerSettings {
            max_iters: cfg.max_iters(),
            checkpoint_interval: cfg.checkpoint_config.interval,
            eval_interval: eval_cfg.interval,
        },
        dataset_classes,
        work_dir,
    };

    let mut runner = IterBasedRunner::new(pair, optim, parts, device)?;
    if let Some(stop) = opts.stop {
        runner = runner.with_stop_handle(stop);
    }
    if let Some(path) = &opts.resume_from {
        runner = runner.resume_from(path)?;
    }
    let outcome = runner.run(source.as_mut())?;
    Ok(outcome.summary)
}

/// Scores a checkpoint on `data.val`. `curr_step` comes from the `iter_N` file name, falling
/// back to the iteration stored in the checkpoint.
pub fn evaluate_checkpoint(
    cfg: &SsodConfig,
    opts: &EvalOptions,
) -> TrainResult<(EvalReport, Option<PathBuf>)> {
    let device = device();
    let evaluator = build_evaluator(cfg, opts.inference_on)?
        .ok_or_else(|| {
            TrainError::config("StageAwareEvaluator", "data.val must name a manifest")
        })?
        .with_sub_modules(false)
        .with_stage_wise(opts.stage_wise || cfg.evaluation.config().stage_wise);

    let payload = load_checkpoint(&opts.checkpoint)?;
    let curr_step = parse_iteration(&opts.checkpoint).unwrap_or(payload.meta.iteration);
    let template = QueryDetector::<ADBackend>::new(cfg.model.clone(), &device);
    let pair = ModelPair::from_student(template);
    let pair = restore_pair(&payload, pair, &device)?;
    tracing::info!(
        checkpoint = %opts.checkpoint.display(),
        curr_step,
        model = %opts.inference_on,
        warm_up_step = ?pair.teacher().warm_up_step(),
        "evaluating checkpoint"
    );
    let report = evaluator.evaluate_pair(&pair, curr_step, &device)?;

    let saved = match &opts.save_dir {
        Some(dir) => Some(write_report(dir, &report)?),
        None => None,
    };
    Ok((report, saved))
}

fn write_report(dir: &Path, report: &EvalReport) -> TrainResult<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| TrainError::io("StageAwareEvaluator", dir, e))?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let path = dir.join(format!("eval_{}_{timestamp}.json", report.curr_step));
    let json = serde_json::to_vec_pretty(report)
        .map_err(|e| TrainError::io("StageAwareEvaluator", &path, std::io::Error::other(e)))?;
    fs::write(&path, json).map_err(|e| TrainError::io("StageAwareEvaluator", &path, e))?;
    Ok(path)
}
