//! Argument structs and entry points behind the `train` and `eval` binaries.

use clap::Parser;
use cli_support::{ConfigArgs, WorkDirArgs};
use std::path::PathBuf;

use crate::config::SsodConfig;
use crate::evaluator::InferenceTarget;
use crate::experiment::{evaluate_checkpoint, run_experiment, EvalOptions, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Semi-supervised Mean Teacher training from a TOML config")]
pub struct TrainArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    #[command(flatten)]
    pub work_dir: WorkDirArgs,
    /// Resume student, teacher, optimizer and progress from an `iter_N.ckpt`.
    #[arg(long)]
    pub resume_from: Option<PathBuf>,
    /// Overrides `runner.max_iters`.
    #[arg(long)]
    pub max_iters: Option<usize>,
    /// Seeds the backend, sampler and view pipeline.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Initialise the teacher from another checkpoint's teacher weights.
    #[arg(long)]
    pub teacher_init: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(name = "eval", about = "Score a training checkpoint on the validation manifest")]
pub struct EvalArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Checkpoint to score; `curr_step` is taken from its `iter_N` name.
    #[arg(long)]
    pub checkpoint: PathBuf,
    /// Which model of the pair to score.
    #[arg(long, default_value_t = InferenceTarget::Teacher)]
    pub inference_on: InferenceTarget,
    #[command(flatten)]
    pub work_dir: WorkDirArgs,
    /// Force stage-wise post-processing even if the config leaves it off.
    #[arg(long)]
    pub stage_wise: bool,
    /// Print metrics only; skip writing `eval_{step}_{timestamp}.json`.
    #[arg(long)]
    pub no_save: bool,
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let cfg = SsodConfig::load(&args.config.config)?;
    let work_dir = args
        .work_dir
        .resolve(cfg.work_dir.as_ref(), &args.config.config);
    let opts = RunOptions {
        work_dir: work_dir.clone(),
        resume_from: args.resume_from,
        max_iters: args.max_iters,
        seed: args.seed,
        teacher_init: args.teacher_init,
        stop: None,
    };
    let summary = run_experiment(cfg, opts)?;
    println!(
        "Finished at iteration {} ({} EMA updates); checkpoints in {}",
        summary.final_iteration,
        summary.ema_updates,
        work_dir.display()
    );
    if let Some(last) = summary.checkpoints.last() {
        println!("Latest checkpoint: {}", last.display());
    }
    Ok(())
}

pub fn run_eval(args: EvalArgs) -> anyhow::Result<()> {
    let cfg = SsodConfig::load(&args.config.config)?;
    let save_dir = (!args.no_save).then(|| {
        args.work_dir
            .resolve(cfg.work_dir.as_ref(), &args.config.config)
    });
    let opts = EvalOptions {
        checkpoint: args.checkpoint,
        inference_on: args.inference_on,
        stage_wise: args.stage_wise,
        save_dir,
    };
    let (report, saved) = evaluate_checkpoint(&cfg, &opts)?;
    for result in &report.results {
        let m = &result.metrics;
        println!(
            "[{}] step {} mAP@0.5={:.4} mAP@[.5:.95]={:.4} precision={:.3} recall={:.3} nms={}",
            result.target,
            report.curr_step,
            m.map50,
            m.map,
            m.precision,
            m.recall,
            result.nms_applied
        );
        for class in &m.classwise {
            println!("  class {:>3}: AP@0.5={:.4}", class.class_id, class.ap50);
        }
    }
    if let Some(path) = saved {
        println!("Saved metrics to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_defaults_to_teacher() {
        let args = EvalArgs::try_parse_from([
            "eval",
            "--config",
            "c.toml",
            "--checkpoint",
            "work/iter_50.ckpt",
        ])
        .unwrap();
        assert_eq!(args.inference_on, InferenceTarget::Teacher);
        assert!(!args.stage_wise);
        assert!(!args.no_save);
    }

    #[test]
    fn train_overrides_parse() {
        let args = TrainArgs::try_parse_from([
            "train",
            "--config",
            "c.toml",
            "--max-iters",
            "100",
            "--seed",
            "4",
        ])
        .unwrap();
        assert_eq!(args.max_iters, Some(100));
        assert_eq!(args.seed, Some(4));
        assert!(args.resume_from.is_none());
    }
}
