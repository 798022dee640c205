use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn_dataset::{
    load_manifest, BatchSource, SemiBalanceSampler, SemiDataset, SyncBatchSource, ViewPipeline,
};
use data_contracts::{ManifestSample, ObjectLabel, SampleManifest};
use models::{Detector, QueryDetector, QueryDetectorConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use training::checkpoint::{capture, load_checkpoint, restore, CheckpointPayload};
use training::config::{EvaluationConfig, MeanTeacherConfig};
use training::registry::{EvaluationSpec, HookSpec};
use training::{
    run_experiment, ADBackend, EmaOutcome, InferenceTarget, MeanTeacherUpdater, ModelPair,
    RunOptions, SsodConfig, StageAwareEvaluator, StopHandle, TrainError, TrainingProgress,
};

const CONFIG: &str = r#"
[data]
labeled = "labeled.json"
unlabeled = "unlabeled.json"
val = "val.json"
classes = ["polyp", "tool"]
samples_per_gpu = 3
workers_per_gpu = 0

[data.sampler]
type = "SemiBalanceSampler"
sample_ratio = [1.0, 2.0]
by_prob = false
seed = 1

[data.augmentation]
seed = 2

[model]
num_classes = 2
num_queries = 4
hidden = 16
depth = 1
grid = 2

[mean_teacher]
momentum = 0.9
interval = 1
warm_up = 0

[runner]
type = "IterBasedRunner"
max_iters = 4

[optimizer]
lr = 0.001

[checkpoint_config]
interval = 2

[evaluation]
type = "SubModulesDistEvalHook"
interval = 2

[[custom_hooks]]
type = "NumClassCheckHook"

[[custom_hooks]]
type = "StepRecord"
normalize = true
"#;

fn manifest(ids: std::ops::Range<u64>, labeled: bool) -> SampleManifest {
    SampleManifest {
        schema_version: Default::default(),
        categories: vec!["polyp".to_string(), "tool".to_string()],
        samples: ids
            .map(|id| ManifestSample {
                id,
                width: 8,
                height: 8,
                pixels: (0..3 * 64).map(|i| ((i as u64 + id) % 7) as f32 / 7.0).collect(),
                annotations: labeled.then(|| {
                    vec![ObjectLabel {
                        bbox: [0.1, 0.2, 0.5, 0.7],
                        class_id: (id % 2) as usize,
                    }]
                }),
            })
            .collect(),
    }
}

fn write_manifest(dir: &Path, name: &str, manifest: &SampleManifest) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_vec(manifest).unwrap()).unwrap();
    path
}

fn experiment(dir: &Path) -> SsodConfig {
    write_manifest(dir, "labeled.json", &manifest(0..4, true));
    write_manifest(dir, "unlabeled.json", &manifest(100..110, false));
    write_manifest(dir, "val.json", &manifest(200..203, true));
    let path = dir.join("ssod.toml");
    fs::write(&path, CONFIG).unwrap();
    SsodConfig::load(&path).unwrap()
}

fn options(work_dir: &Path) -> RunOptions {
    RunOptions {
        work_dir: work_dir.to_path_buf(),
        ..Default::default()
    }
}

fn checkpoint_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".ckpt"))
        .collect();
    names.sort();
    names
}

fn small_model() -> QueryDetectorConfig {
    QueryDetectorConfig {
        num_classes: 2,
        num_queries: 4,
        hidden: 16,
        depth: 1,
        grid: 2,
        ..Default::default()
    }
}

fn small_pair(
    device: &<ADBackend as Backend>::Device,
) -> ModelPair<ADBackend, QueryDetector<ADBackend>> {
    ModelPair::from_student(QueryDetector::<ADBackend>::new(small_model(), device))
}

fn sync_source(dir: &Path, cfg: &SsodConfig) -> SyncBatchSource {
    let dataset =
        SemiDataset::from_manifests(&dir.join("labeled.json"), &dir.join("unlabeled.json"))
            .unwrap();
    let sampler = SemiBalanceSampler::new(
        cfg.data.sampler.config(),
        dataset.labeled.len(),
        dataset.unlabeled.len(),
    )
    .unwrap();
    SyncBatchSource::new(sampler, dataset, ViewPipeline::identity(), 3)
}

#[test]
fn retention_keeps_only_the_final_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    cfg.runner.set_max_iters(100);
    cfg.checkpoint_config.interval = 50;
    cfg.checkpoint_config.max_keep_ckpts = Some(1);
    cfg.evaluation = EvaluationSpec::DistEvalHook(EvaluationConfig {
        interval: 50,
        ..Default::default()
    });
    let work = dir.path().join("work");

    let summary = run_experiment(cfg, options(&work)).unwrap();

    assert_eq!(summary.final_iteration, 100);
    assert_eq!(summary.evaluations.len(), 2);
    assert_eq!(checkpoint_names(&work), vec!["iter_100.ckpt".to_string()]);
    let records = fs::read_to_string(work.join("step_record.jsonl")).unwrap();
    assert_eq!(records.lines().count(), 100);
}

#[test]
fn teacher_is_frozen_during_warm_up_then_tracks_student() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = experiment(dir.path());
    let mut source = sync_source(dir.path(), &cfg);
    let device = <ADBackend as Backend>::Device::default();

    let mut pair = small_pair(&device);
    let mut optim = AdamWConfig::new().init::<ADBackend, QueryDetector<ADBackend>>();
    let wrapper = training::DinoDetrSsod::new(cfg.semi_wrapper.train_cfg().clone());
    let mut updater = MeanTeacherUpdater::new(&MeanTeacherConfig {
        momentum: 0.9,
        interval: 1,
        warm_up: 10,
        copy_on_activation: false,
    })
    .unwrap();
    let mut progress = TrainingProgress::new(20, 10, 1e-3);
    let initial = pair.teacher().parameters();

    for index in 0..20 {
        let batch = source.next_batch().unwrap();
        let step = wrapper.forward_train(&pair, &batch, index, &device).unwrap();
        let total = step.total.expect("labeled items are always present");
        let grads = GradientsParams::from_grads(total.backward(), pair.student());
        pair = pair.update_student(|m| optim.step(1e-3, m, grads));

        let before = pair.teacher().parameters();
        let (next, outcome) = updater.after_step(pair, index, &mut progress);
        pair = next;
        let after = pair.teacher().parameters();

        if index < 10 {
            assert_eq!(outcome, EmaOutcome::Skipped, "iteration {}", index + 1);
            assert!(after.bit_identical(&initial), "iteration {}", index + 1);
        } else {
            assert_eq!(outcome, EmaOutcome::Blended, "iteration {}", index + 1);
            assert!(!after.bit_identical(&before), "iteration {}", index + 1);
        }
    }
    assert_eq!(progress.ema_updates, 10);
    assert_eq!(progress.warm_up_remaining, 0);
}

#[test]
fn zero_unsup_weight_gives_exactly_the_supervised_loss() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    let mut source = sync_source(dir.path(), &cfg);
    let device = <ADBackend as Backend>::Device::default();
    let pair = small_pair(&device);

    let training::registry::WrapperSpec::DinoDetrSsod { train_cfg, .. } = &mut cfg.semi_wrapper;
    train_cfg.unsup_weight = 0.0;
    train_cfg.pseudo_label_initial_score_thr = 0.0;
    let wrapper = training::DinoDetrSsod::new(train_cfg.clone());

    let batch = source.next_batch().unwrap();
    assert!(!batch.labeled.is_empty() && !batch.unlabeled.is_empty());
    let mixed = wrapper.forward_train(&pair, &batch, 0, &device).unwrap();

    let mut labeled_only = batch.clone();
    labeled_only.unlabeled.clear();
    let sup = wrapper.forward_train(&pair, &labeled_only, 0, &device).unwrap();

    assert_eq!(mixed.stats.total, sup.stats.total);
    assert!(mixed.stats.total.is_some());
    assert!(mixed.stats.unsup_class.is_some());
    assert!(mixed.stats.pseudo_raw > 0);
}

#[test]
fn class_count_mismatch_fails_before_the_first_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    cfg.model.num_classes = 3;
    let work = dir.path().join("work");

    let err = run_experiment(cfg, options(&work)).unwrap_err();

    assert!(matches!(
        err,
        TrainError::Configuration {
            component: "NumClassCheckHook",
            ..
        }
    ));
    assert!(checkpoint_names(&work).is_empty());
}

#[test]
fn manifest_categories_must_match_data_classes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = experiment(dir.path());
    let wide = |ids, labeled| {
        let mut m = manifest(ids, labeled);
        m.categories.extend(["blood".to_string(), "mucosa".to_string()]);
        for sample in &mut m.samples {
            for label in sample.annotations.iter_mut().flatten() {
                label.class_id = 3;
            }
        }
        m
    };
    write_manifest(dir.path(), "labeled.json", &wide(0..4, true));
    write_manifest(dir.path(), "unlabeled.json", &wide(100..110, false));
    let work = dir.path().join("work");

    let err = run_experiment(cfg, options(&work)).unwrap_err();

    match &err {
        TrainError::Configuration { component, message } => {
            assert_eq!(*component, "NumClassCheckHook");
            assert!(message.contains("mucosa"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(checkpoint_names(&work).is_empty());
}

#[test]
fn unlabeled_manifest_with_other_categories_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = experiment(dir.path());
    let mut other = manifest(100..110, false);
    other.categories.reverse();
    write_manifest(dir.path(), "unlabeled.json", &other);
    let work = dir.path().join("work");

    let err = run_experiment(cfg, options(&work)).unwrap_err();

    assert!(matches!(err, TrainError::Dataset(_)), "{err}");
    assert!(checkpoint_names(&work).is_empty());
}

#[test]
fn zero_eval_interval_disables_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    cfg.evaluation = EvaluationSpec::DistEvalHook(EvaluationConfig {
        interval: 0,
        ..Default::default()
    });
    cfg.runner.set_max_iters(2);
    let work = dir.path().join("work");

    let summary = run_experiment(cfg, options(&work)).unwrap();

    assert_eq!(summary.final_iteration, 2);
    assert!(summary.evaluations.is_empty());
    assert_eq!(checkpoint_names(&work), vec!["iter_2.ckpt".to_string()]);
}

#[test]
fn unlabeled_only_batch_is_weighted_or_unsupervised() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    let mut source = sync_source(dir.path(), &cfg);
    let device = <ADBackend as Backend>::Device::default();
    let pair = small_pair(&device);

    let training::registry::WrapperSpec::DinoDetrSsod { train_cfg, .. } = &mut cfg.semi_wrapper;
    train_cfg.pseudo_label_initial_score_thr = 0.0;
    let with_weight = |weight: f32| {
        let mut train = train_cfg.clone();
        train.unsup_weight = weight;
        training::DinoDetrSsod::new(train)
    };

    let mut batch = source.next_batch().unwrap();
    batch.labeled.clear();
    assert!(!batch.unlabeled.is_empty());

    let unit = with_weight(1.0).forward_train(&pair, &batch, 0, &device).unwrap();
    let doubled = with_weight(2.0).forward_train(&pair, &batch, 0, &device).unwrap();
    let unit_total = unit.stats.total.unwrap();
    let doubled_total = doubled.stats.total.unwrap();
    assert!(doubled.total.is_some());
    assert!(unit_total.is_finite() && unit_total > 0.0);
    assert!((doubled_total - 2.0 * unit_total).abs() <= 1e-4 * doubled_total.max(1.0));
    assert_eq!(unit.stats.sup_class, None);

    let silent = with_weight(0.0).forward_train(&pair, &batch, 0, &device).unwrap();
    assert!(silent.total.is_none());
    assert_eq!(silent.stats.total, None);
    assert_eq!(silent.stats.unsup_class, unit.stats.unsup_class);
}

#[test]
fn unsupervised_steps_are_skipped_but_the_teacher_keeps_updating() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    cfg.data.samples_per_gpu = 1;
    let sampler = cfg.data.sampler.config_mut();
    sampler.by_prob = true;
    sampler.sample_ratio = vec![1.0, 9.0];
    let training::registry::WrapperSpec::DinoDetrSsod { train_cfg, .. } = &mut cfg.semi_wrapper;
    train_cfg.unsup_weight = 0.0;
    cfg.runner.set_max_iters(30);
    cfg.checkpoint_config.interval = 30;
    cfg.evaluation = EvaluationSpec::DistEvalHook(EvaluationConfig {
        interval: 0,
        ..Default::default()
    });
    let work = dir.path().join("work");

    let summary = run_experiment(cfg, options(&work)).unwrap();

    assert_eq!(summary.final_iteration, 30);
    assert!(summary.skipped_steps > 0);
    assert_eq!(summary.ema_updates, 30);
    let records = fs::read_to_string(work.join("step_record.jsonl")).unwrap();
    let unsupervised = records
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
        .filter(|line| line["total"].is_null())
        .count();
    assert_eq!(unsupervised, summary.skipped_steps);
    let meta = load_checkpoint(&work.join("iter_30.ckpt")).unwrap().meta;
    assert_eq!(meta.progress.ema_updates, 30);
}

#[test]
fn pseudo_labels_and_evaluation_switch_stage_together() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    let mut source = sync_source(dir.path(), &cfg);
    let device = <ADBackend as Backend>::Device::default();
    let model = QueryDetectorConfig {
        stage_wise: true,
        warm_up_step: 2,
        ..small_model()
    };
    let pair = ModelPair::from_student(QueryDetector::<ADBackend>::new(model, &device));

    let training::registry::WrapperSpec::DinoDetrSsod { train_cfg, .. } = &mut cfg.semi_wrapper;
    train_cfg.pseudo_label_initial_score_thr = 0.0;
    let wrapper = training::DinoDetrSsod::new(train_cfg.clone());
    let val = load_manifest(&dir.path().join("val.json")).unwrap().into_samples();
    let evaluator = StageAwareEvaluator::new(Arc::from(val), EvaluationConfig::default(), 2, 3)
        .with_inference_on(InferenceTarget::Teacher)
        .with_stage_wise(true);

    let batch = source.next_batch().unwrap();
    let mut stages = Vec::new();
    for completed in 0..4 {
        let step = wrapper.forward_train(&pair, &batch, completed, &device).unwrap();
        let report = evaluator.evaluate_pair(&pair, completed, &device).unwrap();
        assert_eq!(step.stats.pseudo_nms, report.results[0].nms_applied, "{completed}");
        stages.push(step.stats.pseudo_nms);
    }
    assert_eq!(stages, vec![true, true, false, false]);
}

#[test]
fn ratio_mismatch_fails_before_the_first_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    cfg.data.sampler.config_mut().sample_ratio = vec![1.0, 2.0, 3.0];
    let work = dir.path().join("work");

    let err = run_experiment(cfg, options(&work)).unwrap_err();

    assert!(matches!(
        err,
        TrainError::Configuration {
            component: "SemiBalanceSampler",
            ..
        }
    ));
    assert!(!work.exists() || checkpoint_names(&work).is_empty());
}

#[test]
fn stage_wise_evaluation_needs_a_warm_up_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    cfg.evaluation = EvaluationSpec::SubModulesDistEvalHook(EvaluationConfig {
        interval: 2,
        stage_wise: true,
        ..Default::default()
    });
    let work = dir.path().join("work");

    let err = run_experiment(cfg, options(&work)).unwrap_err();

    assert!(matches!(
        err,
        TrainError::Configuration {
            component: "StageAwareEvaluator",
            ..
        }
    ));
    assert!(checkpoint_names(&work).is_empty());
}

#[test]
fn checkpoint_round_trip_is_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = experiment(dir.path());
    let mut source = sync_source(dir.path(), &cfg);
    let device = <ADBackend as Backend>::Device::default();

    let mut pair = small_pair(&device);
    let mut optim = AdamWConfig::new().init::<ADBackend, QueryDetector<ADBackend>>();
    let wrapper = training::DinoDetrSsod::new(cfg.semi_wrapper.train_cfg().clone());
    let batch = source.next_batch().unwrap();
    let total = wrapper
        .forward_train(&pair, &batch, 0, &device)
        .unwrap()
        .total
        .unwrap();
    let grads = GradientsParams::from_grads(total.backward(), pair.student());
    pair = pair.update_student(|m| optim.step(1e-2, m, grads));
    assert!(!pair
        .student()
        .parameters()
        .bit_identical(&pair.teacher().parameters()));

    let mut progress = TrainingProgress::new(10, 0, 1e-2);
    progress.iteration = 7;
    progress.ema_updates = 3;
    let payload = capture(&pair, &optim, &progress).unwrap();
    let bytes = payload.encode().unwrap();
    let decoded = CheckpointPayload::decode(&bytes, Path::new("iter_7.ckpt")).unwrap();

    let fresh = small_pair(&device);
    let fresh_optim = AdamWConfig::new().init::<ADBackend, QueryDetector<ADBackend>>();
    let (restored, _optim, restored_progress) =
        restore(&decoded, fresh, fresh_optim, &device).unwrap();

    assert!(restored
        .student()
        .parameters()
        .bit_identical(&pair.student().parameters()));
    assert!(restored
        .teacher()
        .parameters()
        .bit_identical(&pair.teacher().parameters()));
    assert_eq!(restored_progress, progress);
}

#[test]
fn corrupt_checkpoint_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = experiment(dir.path());
    let work = dir.path().join("work");
    run_experiment(cfg, options(&work)).unwrap();

    let path = work.join("iter_4.ckpt");
    let mut bytes = fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x55;
    fs::write(&path, bytes).unwrap();

    let err = load_checkpoint(&path).unwrap_err();
    assert!(matches!(err, TrainError::Checkpoint { .. }));
}

#[test]
fn resume_continues_from_the_next_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = experiment(dir.path());
    let work = dir.path().join("work");
    let first = run_experiment(cfg.clone(), options(&work)).unwrap();
    assert_eq!(first.final_iteration, 4);
    assert_eq!(
        checkpoint_names(&work),
        vec!["iter_2.ckpt".to_string(), "iter_4.ckpt".to_string()]
    );

    let resumed = run_experiment(
        cfg,
        RunOptions {
            resume_from: Some(work.join("iter_4.ckpt")),
            max_iters: Some(6),
            ..options(&work)
        },
    )
    .unwrap();

    assert_eq!(resumed.final_iteration, 6);
    assert_eq!(resumed.ema_updates, 6);
    let meta = load_checkpoint(&work.join("iter_6.ckpt")).unwrap().meta;
    assert_eq!(meta.progress.iteration, 6);
    assert_eq!(meta.progress.ema_updates, 6);
}

#[test]
fn stop_request_checkpoints_then_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = experiment(dir.path());
    cfg.runner.set_max_iters(50);
    cfg.custom_hooks = vec![HookSpec::NumClassCheckHook];
    let work = dir.path().join("work");
    let stop = StopHandle::new();
    stop.request_stop();

    let summary = run_experiment(
        cfg,
        RunOptions {
            stop: Some(stop),
            ..options(&work)
        },
    )
    .unwrap();

    assert!(summary.stopped_early);
    assert_eq!(summary.final_iteration, 1);
    assert_eq!(checkpoint_names(&work), vec!["iter_1.ckpt".to_string()]);
}

#[test]
fn copy_on_activation_hard_copies_at_warm_up_end() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = experiment(dir.path());
    let mut source = sync_source(dir.path(), &cfg);
    let device = <ADBackend as Backend>::Device::default();

    let mut pair = small_pair(&device);
    let mut optim = AdamWConfig::new().init::<ADBackend, QueryDetector<ADBackend>>();
    let wrapper = training::DinoDetrSsod::new(cfg.semi_wrapper.train_cfg().clone());
    let mut updater = MeanTeacherUpdater::new(&MeanTeacherConfig {
        momentum: 0.5,
        interval: 1,
        warm_up: 2,
        copy_on_activation: true,
    })
    .unwrap();
    let mut progress = TrainingProgress::new(3, 2, 1e-3);

    let mut outcomes = Vec::new();
    for index in 0..3 {
        let batch = source.next_batch().unwrap();
        let total = wrapper
            .forward_train(&pair, &batch, index, &device)
            .unwrap()
            .total
            .unwrap();
        let grads = GradientsParams::from_grads(total.backward(), pair.student());
        pair = pair.update_student(|m| optim.step(1e-2, m, grads));
        let (next, outcome) = updater.after_step(pair, index, &mut progress);
        pair = next;
        outcomes.push(outcome);
    }

    assert_eq!(
        outcomes,
        vec![EmaOutcome::Skipped, EmaOutcome::Skipped, EmaOutcome::HardCopied]
    );
    assert!(pair
        .teacher()
        .parameters()
        .bit_identical(&pair.student().parameters()));
    assert_eq!(progress.ema_updates, 0);
}
