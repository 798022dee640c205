//! Dataset loading, semi-supervised batch composition and Burn-compatible batching.
//!
//! This crate provides:
//! - Loading and validating sample manifests into labeled/unlabeled pools
//! - Weak/strong view generation with box transforms between views
//! - The semi-balanced sampler mixing both pools at a configured ratio
//! - Mixed batches, image collation and a background batch prefetcher

pub mod aug;
pub mod batch;
pub mod manifest;
pub mod prefetch;
pub mod sampler;
pub mod types;

pub use aug::{AugmentConfig, ViewPipeline};
pub use batch::{collate_images, materialize, MixedBatch};
pub use manifest::{load_manifest, SemiDataset};
pub use prefetch::{BatchPrefetcher, BatchSource, SyncBatchSource};
pub use sampler::{deterministic_split, BatchPlan, SamplerConfig, SemiBalanceSampler};
pub use types::*;
