/// Step decay with optional linear warm-up.
///
/// `lr(i) = base · gamma^(#milestones ≤ i)`, scaled during the first `warmup_iters` steps by
/// `1 − (1 − i / warmup_iters)(1 − warmup_ratio)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLrSchedule {
    base: f64,
    gamma: f64,
    milestones: Vec<usize>,
    warmup_iters: usize,
    warmup_ratio: f64,
}

impl StepLrSchedule {
    pub fn new(base: f64, gamma: f64, mut milestones: Vec<usize>) -> Self {
        milestones.sort_unstable();
        Self {
            base,
            gamma,
            milestones,
            warmup_iters: 0,
            warmup_ratio: 1.0,
        }
    }

    pub fn with_warmup(mut self, iters: usize, ratio: f64) -> Self {
        self.warmup_iters = iters;
        self.warmup_ratio = ratio;
        self
    }

    pub fn lr_at(&self, index: usize) -> f64 {
        let decays = self.milestones.iter().filter(|m| **m <= index).count();
        let lr = self.base * self.gamma.powi(decays as i32);
        if index < self.warmup_iters {
            let k = (1.0 - index as f64 / self.warmup_iters as f64) * (1.0 - self.warmup_ratio);
            lr * (1.0 - k)
        } else {
            lr
        }
    }
}
