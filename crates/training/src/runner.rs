//! `IterBasedRunner`: the iteration loop tying sampler, wrapper, optimizer, Mean Teacher,
//! checkpoints, evaluation and hooks together.

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn_dataset::BatchSource;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::checkpoint::{capture, load_checkpoint, restore, CheckpointManager};
use crate::error::{TrainError, TrainResult};
use crate::evaluator::{EvalReport, StageAwareEvaluator};
use crate::hooks::{HookRegistry, RunInfo};
use crate::lr_schedule::StepLrSchedule;
use crate::mean_teacher::{EmaOutcome, MeanTeacherUpdater};
use crate::pair::ModelPair;
use crate::progress::TrainingProgress;
use crate::wrapper::DinoDetrSsod;
use models::Detector;

/// Cooperative stop request, honoured between iterations.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub max_iters: usize,
    pub checkpoint_interval: usize,
    /// 0 disables periodic evaluation.
    pub eval_interval: usize,
}

/// Everything the runner drives besides the model pair and optimizer.
pub struct RunnerComponents {
    pub wrapper: DinoDetrSsod,
    pub updater: MeanTeacherUpdater,
    pub schedule: StepLrSchedule,
    pub hooks: HookRegistry,
    pub checkpoints: CheckpointManager,
    pub evaluator: Option<StageAwareEvaluator>,
    pub settings: RunnerSettings,
    pub dataset_classes: Vec<String>,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub final_iteration: usize,
    pub ema_updates: usize,
    pub checkpoints: Vec<PathBuf>,
    pub evaluations: Vec<EvalReport>,
    pub stopped_early: bool,
    /// Steps that produced no supervision and skipped the optimizer.
    pub skipped_steps: usize,
}

pub struct RunOutcome<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    pub pair: ModelPair<B, M>,
    pub progress: TrainingProgress,
    pub summary: RunSummary,
}

pub struct IterBasedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    pair: ModelPair<B, M>,
    optim: O,
    parts: RunnerComponents,
    progress: TrainingProgress,
    stop: StopHandle,
    device: B::Device,
}

/// Save, prune oldest-first, then notify hooks. A failed write ends the run.
fn save_checkpoint<B, M, O>(
    manager: &CheckpointManager,
    hooks: &mut HookRegistry,
    written: &mut Vec<PathBuf>,
    pair: &ModelPair<B, M>,
    optim: &O,
    progress: &mut TrainingProgress,
) -> TrainResult<PathBuf>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
    M::InnerModule: Detector<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    let previous = progress.last_checkpoint.replace(progress.iteration);
    let path = match capture(pair, optim, progress).and_then(|payload| manager.write(&payload)) {
        Ok(path) => path,
        Err(err) => {
            progress.last_checkpoint = previous;
            tracing::error!(iter = progress.iteration, error = %err, "checkpoint write failed");
            return Err(err);
        }
    };
    for removed in manager.prune()? {
        written.retain(|p| p != &removed);
    }
    written.push(path.clone());
    hooks.on_checkpoint(progress, &path)?;
    Ok(path)
}

impl<B, M, O> IterBasedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
    M::InnerModule: Detector<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(
        pair: ModelPair<B, M>,
        optim: O,
        parts: RunnerComponents,
        device: B::Device,
    ) -> TrainResult<Self> {
        let s = parts.settings;
        if s.max_iters == 0 || s.checkpoint_interval == 0 {
            return Err(TrainError::config(
                "IterBasedRunner",
                format!("max_iters and checkpoint_interval must be at least 1, got {s:?}"),
            ));
        }
        let progress = TrainingProgress::new(
            s.max_iters,
            parts.updater.warm_up(),
            parts.schedule.lr_at(0),
        );
        Ok(Self {
            pair,
            optim,
            parts,
            progress,
            stop: StopHandle::new(),
            device,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn progress(&self) -> &TrainingProgress {
        &self.progress
    }

    pub fn pair(&self) -> &ModelPair<B, M> {
        &self.pair
    }

    /// Restores student, teacher, optimizer and progress; the run continues with the next
    /// iteration. `max_iters` stays the one configured for this run.
    pub fn resume_from(mut self, path: &Path) -> TrainResult<Self> {
        let payload = load_checkpoint(path)?;
        let (pair, optim, mut progress) = restore(&payload, self.pair, self.optim, &self.device)?;
        progress.max_iters = self.parts.settings.max_iters;
        tracing::info!(
            path = %path.display(),
            iter = progress.iteration,
            ema_updates = progress.ema_updates,
            "resumed from checkpoint"
        );
        self.pair = pair;
        self.optim = optim;
        self.progress = progress;
        Ok(self)
    }

    pub fn run(self, source: &mut dyn BatchSource) -> TrainResult<RunOutcome<B, M>> {
        let Self {
            mut pair,
            mut optim,
            parts,
            mut progress,
            stop,
            device,
        } = self;
        let RunnerComponents {
            wrapper,
            mut updater,
            schedule,
            mut hooks,
            checkpoints,
            evaluator,
            settings,
            dataset_classes,
            work_dir,
        } = parts;

        let info = RunInfo {
            model_num_classes: pair.student().num_classes(),
            dataset_classes,
            work_dir,
            max_iters: settings.max_iters,
            start_iteration: progress.iteration,
        };
        hooks.before_run(&info)?;
        if let Some(evaluator) = &evaluator {
            evaluator.check_stage_wise::<B::InnerBackend, _>(pair.teacher())?;
        }

        let mut summary = RunSummary::default();

        while !progress.is_finished() {
            let index = progress.iteration;
            hooks.on_step_start(&progress)?;

            let batch = source.next_batch()?;
            let lr = schedule.lr_at(index);
            progress.learning_rate = lr;

            // `index` iterations are complete; evaluation below sees `index + 1`.
            let step = wrapper.forward_train(&pair, &batch, index, &device)?;
            if let Some(value) = step.stats.total {
                if !value.is_finite() {
                    tracing::error!(iter = index + 1, value, "non-finite loss");
                    return Err(TrainError::NonFiniteLoss {
                        iteration: index + 1,
                        value,
                    });
                }
            }
            match step.total {
                Some(total) => {
                    let grads = GradientsParams::from_grads(total.backward(), pair.student());
                    pair = pair.update_student(|student| optim.step(lr, student, grads));
                }
                None => {
                    summary.skipped_steps += 1;
                    tracing::debug!(iter = index + 1, "no supervision this step");
                }
            }

            let (next, outcome) = updater.after_step(pair, index, &mut progress);
            pair = next;
            if outcome == EmaOutcome::HardCopied {
                tracing::info!(iter = index + 1, "teacher initialised from student");
            }

            progress.iteration += 1;
            hooks.on_step_end(&progress, &step.stats)?;

            if progress.iteration % settings.checkpoint_interval == 0 {
                save_checkpoint(
                    &checkpoints,
                    &mut hooks,
                    &mut summary.checkpoints,
                    &pair,
                    &optim,
                    &mut progress,
                )?;
            }

            if let Some(evaluator) = &evaluator {
                if settings.eval_interval > 0 && progress.iteration % settings.eval_interval == 0 {
                    let report = evaluator.evaluate_pair(&pair, progress.iteration, &device)?;
                    hooks.on_eval(&progress, &report)?;
                    summary.evaluations.push(report);
                }
            }

            if stop.is_stop_requested() && !progress.is_finished() {
                tracing::warn!(iter = progress.iteration, "stop requested");
                summary.stopped_early = true;
                break;
            }
        }

        if progress.last_checkpoint != Some(progress.iteration) {
            save_checkpoint(
                &checkpoints,
                &mut hooks,
                &mut summary.checkpoints,
                &pair,
                &optim,
                &mut progress,
            )?;
        }

        summary.final_iteration = progress.iteration;
        summary.ema_updates = progress.ema_updates;
        tracing::info!(
            iter = progress.iteration,
            ema_updates = progress.ema_updates,
            stopped_early = summary.stopped_early,
            "training finished"
        );
        Ok(RunOutcome {
            pair,
            progress,
            summary,
        })
    }
}
