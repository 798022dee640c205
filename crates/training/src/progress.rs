use serde::{Deserialize, Serialize};

/// Run-level counters, serialised into every checkpoint and restored on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Completed optimizer iterations.
    pub iteration: usize,
    pub ema_updates: usize,
    pub warm_up_remaining: usize,
    pub max_iters: usize,
    pub learning_rate: f64,
    pub last_checkpoint: Option<usize>,
}

impl TrainingProgress {
    pub fn new(max_iters: usize, warm_up: usize, learning_rate: f64) -> Self {
        Self {
            iteration: 0,
            ema_updates: 0,
            warm_up_remaining: warm_up,
            max_iters,
            learning_rate,
            last_checkpoint: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.iteration >= self.max_iters
    }
}
