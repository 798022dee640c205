//! Semi-balanced batch composition over a labeled and an unlabeled pool.

use crate::types::{BurnDatasetError, DatasetResult, StreamEpochs};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// `[labeled, unlabeled]` mixing weights.
    pub sample_ratio: Vec<f64>,
    /// Draw each slot independently instead of a fixed split per batch.
    pub by_prob: bool,
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_ratio: vec![1.0, 4.0],
            by_prob: true,
            seed: None,
        }
    }
}

/// Pool indices chosen for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub labeled: Vec<usize>,
    pub unlabeled: Vec<usize>,
    pub epochs: StreamEpochs,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.labeled.len() + self.unlabeled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Labeled count for a deterministic split: `round(B·a/(a+b))`, clamped to `[1, B-1]` when
/// `B ≥ 2` so neither stream disappears.
pub fn deterministic_split(batch_size: usize, labeled_weight: f64, unlabeled_weight: f64) -> usize {
    if batch_size == 0 {
        return 0;
    }
    let share = labeled_weight / (labeled_weight + unlabeled_weight);
    let count = (batch_size as f64 * share).round() as usize;
    if batch_size >= 2 {
        count.clamp(1, batch_size - 1)
    } else {
        count.min(batch_size)
    }
}

/// One stream's shuffled order with its own RNG, recycled epoch-style.
#[derive(Debug, Clone)]
struct StreamPool {
    order: Vec<usize>,
    cursor: usize,
    epoch: u64,
    rng: StdRng,
}

impl StreamPool {
    fn new(len: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut rng);
        Self {
            order,
            cursor: 0,
            epoch: 0,
            rng,
        }
    }

    fn next(&mut self) -> usize {
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            self.epoch += 1;
        }
        let idx = self.order[self.cursor];
        self.cursor += 1;
        idx
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Clone)]
pub struct SemiBalanceSampler {
    labeled: StreamPool,
    unlabeled: StreamPool,
    labeled_weight: f64,
    unlabeled_weight: f64,
    by_prob: bool,
    mix_rng: StdRng,
}

impl SemiBalanceSampler {
    /// The ratio must name exactly one weight per stream (labeled, unlabeled).
    pub fn new(
        cfg: &SamplerConfig,
        labeled_len: usize,
        unlabeled_len: usize,
    ) -> DatasetResult<Self> {
        if cfg.sample_ratio.len() != 2 {
            return Err(BurnDatasetError::Sampler(format!(
                "sample_ratio must hold exactly 2 weights (labeled, unlabeled), got {}",
                cfg.sample_ratio.len()
            )));
        }
        let (a, b) = (cfg.sample_ratio[0], cfg.sample_ratio[1]);
        if !(a.is_finite() && b.is_finite() && a > 0.0 && b > 0.0) {
            return Err(BurnDatasetError::Sampler(format!(
                "sample_ratio weights must be positive and finite, got [{a}, {b}]"
            )));
        }
        if labeled_len == 0 {
            return Err(BurnDatasetError::Sampler("labeled pool is empty".to_string()));
        }
        if unlabeled_len == 0 {
            return Err(BurnDatasetError::Sampler("unlabeled pool is empty".to_string()));
        }
        let seed = cfg.seed.unwrap_or_else(|| rand::rng().random());
        Ok(Self {
            labeled: StreamPool::new(labeled_len, seed),
            unlabeled: StreamPool::new(unlabeled_len, seed.wrapping_add(1)),
            labeled_weight: a,
            unlabeled_weight: b,
            by_prob: cfg.by_prob,
            mix_rng: StdRng::seed_from_u64(seed.wrapping_add(2)),
        })
    }

    pub fn labeled_probability(&self) -> f64 {
        self.labeled_weight / (self.labeled_weight + self.unlabeled_weight)
    }

    pub fn by_prob(&self) -> bool {
        self.by_prob
    }

    pub fn pool_sizes(&self) -> (usize, usize) {
        (self.labeled.len(), self.unlabeled.len())
    }

    pub fn epochs(&self) -> StreamEpochs {
        StreamEpochs {
            labeled: self.labeled.epoch,
            unlabeled: self.unlabeled.epoch,
        }
    }

    /// Labeled slot count for the next batch.
    fn labeled_slots(&mut self, batch_size: usize) -> usize {
        if self.by_prob {
            let p = self.labeled_probability();
            (0..batch_size)
                .filter(|_| self.mix_rng.random::<f64>() < p)
                .count()
        } else {
            deterministic_split(batch_size, self.labeled_weight, self.unlabeled_weight)
        }
    }

    pub fn next_plan(&mut self, batch_size: usize) -> BatchPlan {
        let labeled_count = self.labeled_slots(batch_size);
        let labeled = (0..labeled_count).map(|_| self.labeled.next()).collect();
        let unlabeled = (0..batch_size - labeled_count)
            .map(|_| self.unlabeled.next())
            .collect();
        BatchPlan {
            labeled,
            unlabeled,
            epochs: self.epochs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(ratio: Vec<f64>, by_prob: bool) -> SamplerConfig {
        SamplerConfig {
            sample_ratio: ratio,
            by_prob,
            seed: Some(42),
        }
    }

    #[test]
    fn split_rounds_half_away_from_zero_and_clamps() {
        assert_eq!(deterministic_split(5, 1.0, 4.0), 1);
        assert_eq!(deterministic_split(10, 1.0, 4.0), 2);
        assert_eq!(deterministic_split(2, 1.0, 4.0), 1);
        assert_eq!(deterministic_split(4, 1.0, 1.0), 2);
        assert_eq!(deterministic_split(3, 1.0, 1.0), 2);
        assert_eq!(deterministic_split(4, 100.0, 1.0), 3);
        assert_eq!(deterministic_split(1, 1.0, 4.0), 0);
        assert_eq!(deterministic_split(0, 1.0, 4.0), 0);
    }

    #[test]
    fn rejects_bad_ratios_and_empty_pools() {
        assert!(SemiBalanceSampler::new(&cfg(vec![1.0], false), 3, 3).is_err());
        assert!(SemiBalanceSampler::new(&cfg(vec![1.0, 2.0, 3.0], false), 3, 3).is_err());
        assert!(SemiBalanceSampler::new(&cfg(vec![0.0, 1.0], false), 3, 3).is_err());
        assert!(SemiBalanceSampler::new(&cfg(vec![1.0, f64::NAN], false), 3, 3).is_err());
        assert!(SemiBalanceSampler::new(&cfg(vec![1.0, 4.0], false), 0, 3).is_err());
        assert!(SemiBalanceSampler::new(&cfg(vec![1.0, 4.0], false), 3, 0).is_err());
    }

    #[test]
    fn deterministic_batches_have_fixed_composition() {
        let mut sampler = SemiBalanceSampler::new(&cfg(vec![1.0, 4.0], false), 3, 7).unwrap();
        for _ in 0..20 {
            let plan = sampler.next_plan(5);
            assert_eq!(plan.labeled.len(), 1);
            assert_eq!(plan.unlabeled.len(), 4);
        }
    }

    #[test]
    fn each_epoch_visits_every_item_once() {
        let mut sampler = SemiBalanceSampler::new(&cfg(vec![1.0, 1.0], false), 4, 6).unwrap();
        let mut labeled = Vec::new();
        for _ in 0..4 {
            labeled.extend(sampler.next_plan(2).labeled);
        }
        labeled.sort_unstable();
        assert_eq!(labeled, vec![0, 1, 2, 3]);
        assert_eq!(sampler.epochs().labeled, 0);
        sampler.next_plan(2);
        assert_eq!(sampler.epochs().labeled, 1);
        // Unlabeled pool of 6 consumed 5 times: still in its first epoch.
        assert_eq!(sampler.epochs().unlabeled, 0);
    }

    #[test]
    fn probabilistic_fraction_converges() {
        let mut sampler = SemiBalanceSampler::new(&cfg(vec![1.0, 4.0], true), 10, 40).unwrap();
        let mut labeled = 0usize;
        let mut total = 0usize;
        while total < 100_000 {
            let plan = sampler.next_plan(5);
            labeled += plan.labeled.len();
            total += plan.len();
        }
        let frac = labeled as f64 / total as f64;
        assert!((frac - 0.2).abs() < 0.01, "labeled fraction {frac}");
    }
}
