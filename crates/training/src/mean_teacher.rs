//! Mean Teacher: the teacher tracks an EMA of the student after warm-up.

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use models::Detector;

use crate::config::MeanTeacherConfig;
use crate::error::{TrainError, TrainResult};
use crate::pair::ModelPair;
use crate::progress::TrainingProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeacherPhase {
    WarmingUp,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmaOutcome {
    Skipped,
    HardCopied,
    Blended,
}

#[derive(Debug, Clone)]
pub struct MeanTeacherUpdater {
    momentum: f64,
    interval: usize,
    warm_up: usize,
    copy_on_activation: bool,
    phase: TeacherPhase,
}

impl MeanTeacherUpdater {
    pub fn new(cfg: &MeanTeacherConfig) -> TrainResult<Self> {
        if !(cfg.momentum.is_finite() && (0.0..1.0).contains(&cfg.momentum)) {
            return Err(TrainError::config(
                "MeanTeacher",
                format!("momentum must be in [0, 1), got {}", cfg.momentum),
            ));
        }
        if cfg.interval == 0 {
            return Err(TrainError::config("MeanTeacher", "interval must be at least 1"));
        }
        Ok(Self {
            momentum: cfg.momentum,
            interval: cfg.interval,
            warm_up: cfg.warm_up,
            copy_on_activation: cfg.copy_on_activation,
            phase: TeacherPhase::WarmingUp,
        })
    }

    pub fn phase(&self) -> TeacherPhase {
        self.phase
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn warm_up(&self) -> usize {
        self.warm_up
    }

    /// Call strictly after the optimizer step of 0-based step `index`.
    ///
    /// Steps `0..warm_up` leave the teacher untouched. From `warm_up` on, the teacher is
    /// blended on every step with `index % interval == 0`; with `copy_on_activation` the
    /// step at `index == warm_up` hard-copies the student instead.
    pub fn after_step<B, M>(
        &mut self,
        pair: ModelPair<B, M>,
        index: usize,
        progress: &mut TrainingProgress,
    ) -> (ModelPair<B, M>, EmaOutcome)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + Detector<B>,
        M::InnerModule: Detector<B::InnerBackend>,
    {
        if index < self.warm_up {
            self.phase = TeacherPhase::WarmingUp;
            progress.warm_up_remaining = self.warm_up - index - 1;
            return (pair, EmaOutcome::Skipped);
        }
        if self.phase == TeacherPhase::WarmingUp {
            tracing::info!(step = index, "mean teacher active");
        }
        self.phase = TeacherPhase::Active;
        progress.warm_up_remaining = 0;

        if self.copy_on_activation && index == self.warm_up {
            return (pair.hard_copy(), EmaOutcome::HardCopied);
        }
        if index % self.interval != 0 {
            return (pair, EmaOutcome::Skipped);
        }
        progress.ema_updates += 1;
        (pair.ema_update(self.momentum), EmaOutcome::Blended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_momentum_of_one_and_zero_interval() {
        let bad_momentum = MeanTeacherConfig {
            momentum: 1.0,
            ..Default::default()
        };
        assert!(MeanTeacherUpdater::new(&bad_momentum).is_err());
        let bad_interval = MeanTeacherConfig {
            interval: 0,
            ..Default::default()
        };
        assert!(MeanTeacherUpdater::new(&bad_interval).is_err());
        let ok = MeanTeacherUpdater::new(&MeanTeacherConfig::default()).unwrap();
        assert_eq!(ok.phase(), TeacherPhase::WarmingUp);
    }
}
