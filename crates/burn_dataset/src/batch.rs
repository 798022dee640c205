//! Mixed labeled/unlabeled batches and Burn collation.

use crate::aug::ViewPipeline;
use crate::manifest::SemiDataset;
use crate::sampler::BatchPlan;
use crate::types::{AugmentedSample, BurnDatasetError, DatasetResult, StreamEpochs};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use data_contracts::{ImageBuffer, StreamKind};
use rayon::prelude::*;

/// One step's input: labeled items first, then unlabeled, each in sampler order.
#[derive(Debug, Clone, Default)]
pub struct MixedBatch {
    pub labeled: Vec<AugmentedSample>,
    pub unlabeled: Vec<AugmentedSample>,
    pub epochs: StreamEpochs,
}

impl MixedBatch {
    pub fn len(&self) -> usize {
        self.labeled.len() + self.unlabeled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Materialise the views for every planned index on the rayon pool. `draw` salts the
/// per-sample RNG so revisits of a sample get fresh views.
pub fn materialize(
    dataset: &SemiDataset,
    pipeline: &ViewPipeline,
    plan: &BatchPlan,
    draw: u64,
) -> DatasetResult<MixedBatch> {
    let pick = |stream: StreamKind, indices: &[usize]| -> DatasetResult<Vec<AugmentedSample>> {
        let pool = match stream {
            StreamKind::Labeled => &dataset.labeled,
            StreamKind::Unlabeled => &dataset.unlabeled,
        };
        indices
            .par_iter()
            .map(|&idx| {
                pool.get(idx)
                    .map(|sample| pipeline.augment(sample, stream, draw))
                    .ok_or_else(|| {
                        BurnDatasetError::Other(format!(
                            "{} index {idx} outside pool of {}",
                            stream.as_str(),
                            pool.len()
                        ))
                    })
            })
            .collect()
    };
    Ok(MixedBatch {
        labeled: pick(StreamKind::Labeled, &plan.labeled)?,
        unlabeled: pick(StreamKind::Unlabeled, &plan.unlabeled)?,
        epochs: plan.epochs,
    })
}

/// Stack same-sized CHW images into `[N, 3, H, W]`.
pub fn collate_images<B: Backend>(
    images: &[&ImageBuffer],
    device: &B::Device,
) -> DatasetResult<Tensor<B, 4>> {
    let Some(first) = images.first() else {
        return Err(BurnDatasetError::Other("cannot collate an empty image list".to_string()));
    };
    let size = first.size();
    let mut buf = Vec::with_capacity(images.len() * first.expected_len());
    for image in images {
        if image.size() != size {
            return Err(BurnDatasetError::VaryingImageSize {
                first: size,
                other: image.size(),
            });
        }
        buf.extend_from_slice(&image.chw);
    }
    let (width, height) = size;
    let data = TensorData::new(
        buf,
        [
            images.len(),
            ImageBuffer::CHANNELS,
            height as usize,
            width as usize,
        ],
    );
    Ok(Tensor::<B, 4>::from_data(data, device))
}
