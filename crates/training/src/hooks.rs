//! Training hooks, invoked by the runner in registration order.

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{TrainError, TrainResult};
use crate::evaluator::EvalReport;
use crate::progress::TrainingProgress;
use crate::registry::HookSpec;
use crate::wrapper::StepStats;

/// What the runner knows before the first step.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub model_num_classes: usize,
    pub dataset_classes: Vec<String>,
    pub work_dir: PathBuf,
    pub max_iters: usize,
    pub start_iteration: usize,
}

pub trait TrainingHook: Send {
    fn name(&self) -> &'static str;

    fn before_run(&mut self, _info: &RunInfo) -> TrainResult<()> {
        Ok(())
    }

    fn on_step_start(&mut self, _progress: &TrainingProgress) -> TrainResult<()> {
        Ok(())
    }

    fn on_step_end(&mut self, _progress: &TrainingProgress, _stats: &StepStats) -> TrainResult<()> {
        Ok(())
    }

    fn on_checkpoint(&mut self, _progress: &TrainingProgress, _path: &Path) -> TrainResult<()> {
        Ok(())
    }

    fn on_eval(&mut self, _progress: &TrainingProgress, _report: &EvalReport) -> TrainResult<()> {
        Ok(())
    }
}

/// Fails the run before the first step when the model head and the dataset disagree on the
/// number of categories.
#[derive(Debug, Default)]
pub struct NumClassCheckHook;

impl TrainingHook for NumClassCheckHook {
    fn name(&self) -> &'static str {
        "NumClassCheckHook"
    }

    fn before_run(&mut self, info: &RunInfo) -> TrainResult<()> {
        if info.model_num_classes != info.dataset_classes.len() {
            return Err(TrainError::config(
                "NumClassCheckHook",
                format!(
                    "model head predicts {} classes but the dataset declares {} ({:?})",
                    info.model_num_classes,
                    info.dataset_classes.len(),
                    info.dataset_classes
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Window {
    steps: usize,
    total: f64,
    sup: f64,
    sup_steps: usize,
    unsup: f64,
    unsup_steps: usize,
    pseudo_kept: usize,
    unlabeled: usize,
}

/// Logs windowed loss averages every `interval` iterations.
#[derive(Debug)]
pub struct TextLoggerHook {
    interval: usize,
    window: Window,
}

impl TextLoggerHook {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            window: Window::default(),
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }
}

fn mean(sum: f64, n: usize) -> Option<f64> {
    (n > 0).then(|| sum / n as f64)
}

impl TrainingHook for TextLoggerHook {
    fn name(&self) -> &'static str {
        "TextLoggerHook"
    }

    fn before_run(&mut self, info: &RunInfo) -> TrainResult<()> {
        tracing::info!(
            max_iters = info.max_iters,
            start = info.start_iteration,
            work_dir = %info.work_dir.display(),
            classes = ?info.dataset_classes,
            "training started"
        );
        Ok(())
    }

    fn on_step_end(&mut self, progress: &TrainingProgress, stats: &StepStats) -> TrainResult<()> {
        let w = &mut self.window;
        w.steps += 1;
        w.total += stats.total.unwrap_or(0.0) as f64;
        if let (Some(c), Some(b)) = (stats.sup_class, stats.sup_bbox) {
            w.sup += (c + b) as f64;
            w.sup_steps += 1;
        }
        if let (Some(c), Some(b)) = (stats.unsup_class, stats.unsup_bbox) {
            w.unsup += (c + b) as f64;
            w.unsup_steps += 1;
        }
        w.pseudo_kept += stats.pseudo_kept;
        w.unlabeled += stats.unlabeled;

        if progress.iteration % self.interval == 0 {
            let w = std::mem::take(&mut self.window);
            tracing::info!(
                iter = progress.iteration,
                max_iters = progress.max_iters,
                lr = progress.learning_rate,
                loss = mean(w.total, w.steps),
                sup_loss = mean(w.sup, w.sup_steps),
                unsup_loss = mean(w.unsup, w.unsup_steps),
                pseudo_per_image = mean(w.pseudo_kept as f64, w.unlabeled),
                ema_updates = progress.ema_updates,
                "train"
            );
        }
        Ok(())
    }

    fn on_checkpoint(&mut self, progress: &TrainingProgress, path: &Path) -> TrainResult<()> {
        tracing::info!(iter = progress.iteration, path = %path.display(), "saved checkpoint");
        Ok(())
    }

    fn on_eval(&mut self, _progress: &TrainingProgress, report: &EvalReport) -> TrainResult<()> {
        for result in &report.results {
            tracing::info!(
                iter = report.curr_step,
                model = %result.target,
                map50 = result.metrics.map50,
                map = result.metrics.map,
                "eval"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct StepLine<'a> {
    iteration: usize,
    learning_rate: f64,
    #[serde(flatten)]
    stats: &'a StepStats,
    pseudo_kept_per_image: Option<f64>,
    pseudo_raw_per_image: Option<f64>,
}

/// Appends one JSON line per step. With `normalize`, pseudo-label counts are also reported per
/// unlabeled image.
pub struct StepRecord {
    normalize: bool,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl StepRecord {
    pub const DEFAULT_FILE: &'static str = "step_record.jsonl";

    pub fn new(normalize: bool, path: impl Into<PathBuf>) -> Self {
        Self {
            normalize,
            path: path.into(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrainingHook for StepRecord {
    fn name(&self) -> &'static str {
        "StepRecord"
    }

    fn before_run(&mut self, _info: &RunInfo) -> TrainResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TrainError::io("StepRecord", parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TrainError::io("StepRecord", &self.path, e))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn on_step_end(&mut self, progress: &TrainingProgress, stats: &StepStats) -> TrainResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let per_image = |count: usize| {
            (self.normalize && stats.unlabeled > 0).then(|| count as f64 / stats.unlabeled as f64)
        };
        let line = StepLine {
            iteration: progress.iteration,
            learning_rate: progress.learning_rate,
            stats,
            pseudo_kept_per_image: per_image(stats.pseudo_kept),
            pseudo_raw_per_image: per_image(stats.pseudo_raw),
        };
        let json = serde_json::to_string(&line).map_err(|e| {
            TrainError::io("StepRecord", &self.path, std::io::Error::other(e))
        })?;
        writeln!(writer, "{json}").map_err(|e| TrainError::io("StepRecord", &self.path, e))?;
        Ok(())
    }

    fn on_checkpoint(&mut self, _progress: &TrainingProgress, _path: &Path) -> TrainResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| TrainError::io("StepRecord", &self.path, e))?;
        }
        Ok(())
    }
}

impl Drop for StepRecord {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

/// Ordered hook list.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Box<dyn TrainingHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds hooks from config entries. A `TextLoggerHook` at `log_interval` is appended when
    /// none is configured.
    pub fn from_specs(specs: &[HookSpec], work_dir: &Path, log_interval: usize) -> Self {
        let mut registry = Self::new();
        for spec in specs {
            match spec {
                HookSpec::NumClassCheckHook => registry.register(NumClassCheckHook),
                HookSpec::TextLoggerHook { interval } => {
                    registry.register(TextLoggerHook::new(interval.unwrap_or(log_interval)))
                }
                HookSpec::StepRecord { normalize, path } => {
                    let path = match path {
                        Some(p) if p.is_absolute() => p.clone(),
                        Some(p) => work_dir.join(p),
                        None => work_dir.join(StepRecord::DEFAULT_FILE),
                    };
                    registry.register(StepRecord::new(*normalize, path))
                }
            }
        }
        if !registry.names().contains(&"TextLoggerHook") {
            registry.register(TextLoggerHook::new(log_interval));
        }
        registry
    }

    pub fn register(&mut self, hook: impl TrainingHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn before_run(&mut self, info: &RunInfo) -> TrainResult<()> {
        self.hooks.iter_mut().try_for_each(|h| h.before_run(info))
    }

    pub fn on_step_start(&mut self, progress: &TrainingProgress) -> TrainResult<()> {
        self.hooks.iter_mut().try_for_each(|h| h.on_step_start(progress))
    }

    pub fn on_step_end(
        &mut self,
        progress: &TrainingProgress,
        stats: &StepStats,
    ) -> TrainResult<()> {
        self.hooks
            .iter_mut()
            .try_for_each(|h| h.on_step_end(progress, stats))
    }

    pub fn on_checkpoint(&mut self, progress: &TrainingProgress, path: &Path) -> TrainResult<()> {
        self.hooks
            .iter_mut()
            .try_for_each(|h| h.on_checkpoint(progress, path))
    }

    pub fn on_eval(&mut self, progress: &TrainingProgress, report: &EvalReport) -> TrainResult<()> {
        self.hooks
            .iter_mut()
            .try_for_each(|h| h.on_eval(progress, report))
    }
}
