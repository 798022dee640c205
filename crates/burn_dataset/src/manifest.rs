//! Loading sample manifests from disk.

use crate::types::{BurnDatasetError, DatasetResult};
use data_contracts::{Sample, SampleManifest};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub fn load_manifest(path: &Path) -> DatasetResult<SampleManifest> {
    let raw = fs::read(path).map_err(|source| BurnDatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let manifest: SampleManifest =
        serde_json::from_slice(&raw).map_err(|source| BurnDatasetError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    manifest
        .validate()
        .map_err(|e| BurnDatasetError::Validation {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?;
    Ok(manifest)
}

/// Labeled and unlabeled pools plus the dataset's category names.
#[derive(Debug, Clone)]
pub struct SemiDataset {
    pub categories: Vec<String>,
    pub labeled: Arc<[Sample]>,
    pub unlabeled: Arc<[Sample]>,
}

impl SemiDataset {
    pub fn new(categories: Vec<String>, labeled: Vec<Sample>, unlabeled: Vec<Sample>) -> Self {
        Self {
            categories,
            labeled: labeled.into(),
            unlabeled: unlabeled.into(),
        }
    }

    /// Every labeled-manifest sample must carry annotations; the unlabeled manifest's
    /// annotations, if any, are dropped.
    pub fn from_manifests(labeled: &Path, unlabeled: &Path) -> DatasetResult<Self> {
        let labeled_manifest = load_manifest(labeled)?;
        let unlabeled_manifest = load_manifest(unlabeled)?;
        if let Some(missing) = labeled_manifest
            .samples
            .iter()
            .find(|s| s.annotations.is_none())
        {
            return Err(BurnDatasetError::Validation {
                path: labeled.to_path_buf(),
                msg: format!("sample {} in labeled manifest has no annotations", missing.id),
            });
        }
        if unlabeled_manifest.categories != labeled_manifest.categories {
            return Err(BurnDatasetError::Validation {
                path: unlabeled.to_path_buf(),
                msg: format!(
                    "categories {:?} differ from the labeled manifest's {:?}",
                    unlabeled_manifest.categories, labeled_manifest.categories
                ),
            });
        }
        let categories = labeled_manifest.categories.clone();
        let unlabeled_samples = unlabeled_manifest
            .into_samples()
            .into_iter()
            .map(|mut s| {
                s.annotations = None;
                s
            })
            .collect();
        Ok(Self::new(
            categories,
            labeled_manifest.into_samples(),
            unlabeled_samples,
        ))
    }

    pub fn num_classes(&self) -> usize {
        self.categories.len()
    }
}
