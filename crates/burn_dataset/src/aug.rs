//! Weak/strong view generation.
//!
//! The weak view only applies geometry (horizontal flip). The strong view picks its own flip
//! and adds photometric jitter and per-pixel noise, so pseudo-labels predicted on the weak view
//! must be mapped through `weak_to_strong` before they supervise the strong view.

use crate::types::AugmentedSample;
use data_contracts::{BoxTransform, ImageBuffer, Sample, StreamKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Probability of flipping the weak view.
    pub weak_flip_prob: f32,
    /// Probability of flipping the strong view.
    pub strong_flip_prob: f32,
    /// Max brightness/contrast deviation on the strong view.
    pub color_jitter_strength: f32,
    /// Max absolute additive noise on the strong view (0-1 range).
    pub noise_strength: f32,
    /// Per-sample deterministic views when set.
    pub seed: Option<u64>,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            weak_flip_prob: 0.5,
            strong_flip_prob: 0.5,
            color_jitter_strength: 0.2,
            noise_strength: 0.02,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewPipeline {
    cfg: AugmentConfig,
}

impl ViewPipeline {
    pub fn new(cfg: AugmentConfig) -> Self {
        Self { cfg }
    }

    /// No flips, no jitter: both views equal the input image.
    pub fn identity() -> Self {
        Self::new(AugmentConfig {
            weak_flip_prob: 0.0,
            strong_flip_prob: 0.0,
            color_jitter_strength: 0.0,
            noise_strength: 0.0,
            seed: Some(0),
        })
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.cfg
    }

    pub fn describe(&self) -> String {
        format!(
            "weak_flip_p={:.2} strong_flip_p={:.2} jitter={:.2} noise={:.3} seed={}",
            self.cfg.weak_flip_prob,
            self.cfg.strong_flip_prob,
            self.cfg.color_jitter_strength,
            self.cfg.noise_strength,
            self.cfg
                .seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }

    /// `draw` distinguishes repeated visits of the same sample across epochs.
    pub fn augment(&self, sample: &Sample, stream: StreamKind, draw: u64) -> AugmentedSample {
        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.cfg.seed {
            let mixed =
                seed ^ sample.id.0.rotate_left(17) ^ draw.wrapping_mul(0x9E37_79B9_7F4A_7C15);
            seeded_rng = StdRng::seed_from_u64(mixed);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };

        let weak_flip = pick_flip(self.cfg.weak_flip_prob, rng);
        let strong_flip = pick_flip(self.cfg.strong_flip_prob, rng);

        let weak = apply_geometry(&sample.image, weak_flip);
        let mut strong = apply_geometry(&sample.image, strong_flip);
        jitter(&mut strong, self.cfg.color_jitter_strength, rng);
        noise(&mut strong, self.cfg.noise_strength, rng);

        AugmentedSample {
            id: sample.id,
            stream,
            weak,
            strong,
            weak_to_strong: weak_flip.inverse().then(strong_flip),
            strong_from_original: strong_flip,
            annotations: sample.annotations.clone(),
        }
    }
}

fn pick_flip(prob: f32, rng: &mut dyn rand::RngCore) -> BoxTransform {
    if prob > 0.0 && rng.random_range(0.0..1.0) < prob {
        BoxTransform::HorizontalFlip
    } else {
        BoxTransform::Identity
    }
}

pub(crate) fn apply_geometry(image: &ImageBuffer, transform: BoxTransform) -> ImageBuffer {
    match transform {
        BoxTransform::Identity => image.clone(),
        BoxTransform::HorizontalFlip => hflip(image),
    }
}

pub(crate) fn hflip(image: &ImageBuffer) -> ImageBuffer {
    let w = image.width as usize;
    let h = image.height as usize;
    let mut out = image.clone();
    for c in 0..ImageBuffer::CHANNELS {
        for y in 0..h {
            let row = (c * h + y) * w;
            if let Some(src) = image.chw.get(row..row + w) {
                for (x, v) in src.iter().enumerate() {
                    out.chw[row + (w - 1 - x)] = *v;
                }
            }
        }
    }
    out
}

fn jitter(image: &mut ImageBuffer, strength: f32, rng: &mut dyn rand::RngCore) {
    if strength <= 0.0 {
        return;
    }
    let bright = 1.0 + rng.random_range(-strength..strength);
    let contrast = 1.0 + rng.random_range(-strength..strength);
    for v in image.chw.iter_mut() {
        let x = ((*v - 0.5) * contrast + 0.5) * bright;
        *v = x.clamp(0.0, 1.0);
    }
}

fn noise(image: &mut ImageBuffer, strength: f32, rng: &mut dyn rand::RngCore) {
    if strength <= 0.0 {
        return;
    }
    for v in image.chw.iter_mut() {
        *v = (*v + rng.random_range(-strength..strength)).clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_contracts::ObjectLabel;

    fn gradient_sample() -> Sample {
        let mut image = ImageBuffer::filled(4, 2, 0.0);
        for (i, v) in image.chw.iter_mut().enumerate() {
            *v = (i % 4) as f32 / 4.0;
        }
        Sample::labeled(
            3,
            image,
            vec![ObjectLabel {
                bbox: [0.0, 0.0, 0.25, 1.0],
                class_id: 0,
            }],
        )
    }

    #[test]
    fn hflip_mirrors_rows() {
        let sample = gradient_sample();
        let flipped = hflip(&sample.image);
        assert_eq!(&flipped.chw[0..4], &[0.75, 0.5, 0.25, 0.0]);
        assert_eq!(hflip(&flipped), sample.image);
    }

    #[test]
    fn forced_flips_compose_to_identity_between_views() {
        let pipeline = ViewPipeline::new(AugmentConfig {
            weak_flip_prob: 1.0,
            strong_flip_prob: 1.0,
            color_jitter_strength: 0.0,
            noise_strength: 0.0,
            seed: Some(1),
        });
        let aug = pipeline.augment(&gradient_sample(), StreamKind::Labeled, 0);
        assert_eq!(aug.weak_to_strong, BoxTransform::Identity);
        assert_eq!(aug.weak, aug.strong);
        let targets = aug.strong_targets();
        assert!((targets[0].bbox[0] - 0.75).abs() < 1e-6);
        assert!((targets[0].bbox[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn seeded_views_are_reproducible() {
        let pipeline = ViewPipeline::new(AugmentConfig {
            seed: Some(9),
            ..Default::default()
        });
        let sample = gradient_sample();
        let a = pipeline.augment(&sample, StreamKind::Unlabeled, 4);
        let b = pipeline.augment(&sample, StreamKind::Unlabeled, 4);
        assert_eq!(a.strong, b.strong);
        assert_eq!(a.weak_to_strong, b.weak_to_strong);
    }
}
