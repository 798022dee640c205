//! Batch sources: a synchronous one and a background prefetcher.

use crate::aug::ViewPipeline;
use crate::batch::{materialize, MixedBatch};
use crate::manifest::SemiDataset;
use crate::sampler::SemiBalanceSampler;
use crate::types::{BurnDatasetError, DatasetResult};
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Anything that can hand the trainer its next mixed batch.
pub trait BatchSource: Send {
    fn next_batch(&mut self) -> DatasetResult<MixedBatch>;
}

/// Samples and materialises on the caller's thread.
pub struct SyncBatchSource {
    sampler: SemiBalanceSampler,
    dataset: SemiDataset,
    pipeline: ViewPipeline,
    batch_size: usize,
    draws: u64,
}

impl SyncBatchSource {
    pub fn new(
        sampler: SemiBalanceSampler,
        dataset: SemiDataset,
        pipeline: ViewPipeline,
        batch_size: usize,
    ) -> Self {
        Self {
            sampler,
            dataset,
            pipeline,
            batch_size,
            draws: 0,
        }
    }
}

impl BatchSource for SyncBatchSource {
    fn next_batch(&mut self) -> DatasetResult<MixedBatch> {
        let plan = self.sampler.next_plan(self.batch_size);
        let batch = materialize(&self.dataset, &self.pipeline, &plan, self.draws)?;
        self.draws += 1;
        Ok(batch)
    }
}

/// Producer thread owning the sampler; batches arrive through a bounded channel of `depth`.
///
/// The producer stops on the first materialisation error (forwarded to the consumer), when
/// the prefetcher is dropped, or when the consumer hangs up.
pub struct BatchPrefetcher {
    rx: Option<Receiver<DatasetResult<MixedBatch>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BatchPrefetcher {
    pub fn spawn(
        mut sampler: SemiBalanceSampler,
        dataset: SemiDataset,
        pipeline: ViewPipeline,
        batch_size: usize,
        depth: usize,
    ) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut draw = 0u64;
            while !stop_flag.load(Ordering::Relaxed) {
                let plan = sampler.next_plan(batch_size);
                let result = materialize(&dataset, &pipeline, &plan, draw);
                draw += 1;
                let failed = result.is_err();
                if let Err(e) = &result {
                    tracing::error!(error = %e, "batch prefetcher failed to materialise a batch");
                }
                if tx.send(result).is_err() || failed {
                    break;
                }
            }
            tracing::debug!(batches = draw, "batch prefetcher exiting");
        });
        Self {
            rx: Some(rx),
            stop,
            handle: Some(handle),
        }
    }
}

impl BatchSource for BatchPrefetcher {
    fn next_batch(&mut self) -> DatasetResult<MixedBatch> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| BurnDatasetError::SourceClosed("receiver already dropped".to_string()))?;
        rx.recv()
            .map_err(|_| BurnDatasetError::SourceClosed("producer thread exited".to_string()))?
    }
}

impl Drop for BatchPrefetcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the receiver unblocks a producer waiting on a full channel.
        drop(self.rx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("batch prefetcher thread panicked");
            }
        }
    }
}
