use crate::detection::{ObjectLabel, ValidationError};
use crate::sample::{ImageBuffer, Sample, SampleId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SampleManifestSchemaVersion {
    #[default]
    V1,
}

/// One entry of a sample manifest. `annotations: null` marks an unlabeled image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSample {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    /// CHW pixels in [0, 1].
    pub pixels: Vec<f32>,
    #[serde(default)]
    pub annotations: Option<Vec<ObjectLabel>>,
}

/// A labeled or unlabeled pool on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleManifest {
    #[serde(default)]
    pub schema_version: SampleManifestSchemaVersion,
    pub categories: Vec<String>,
    pub samples: Vec<ManifestSample>,
}

impl ManifestSample {
    pub fn into_sample(self) -> Sample {
        Sample {
            id: SampleId(self.id),
            image: ImageBuffer {
                width: self.width,
                height: self.height,
                chw: self.pixels,
            },
            annotations: self.annotations,
        }
    }
}

impl SampleManifest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::with_capacity(self.samples.len());
        for entry in &self.samples {
            if !seen.insert(entry.id) {
                return Err(ValidationError::DuplicateId(entry.id));
            }
            let expected = ImageBuffer::CHANNELS * entry.width as usize * entry.height as usize;
            if expected == 0 {
                return Err(ValidationError::EmptyImage { id: entry.id });
            }
            if entry.pixels.len() != expected {
                return Err(ValidationError::PixelCount {
                    id: entry.id,
                    width: entry.width,
                    height: entry.height,
                    expected,
                    actual: entry.pixels.len(),
                });
            }
            for label in entry.annotations.iter().flatten() {
                label.validate(self.categories.len())?;
            }
        }
        Ok(())
    }

    pub fn labeled_count(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.annotations.is_some())
            .count()
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
            .into_iter()
            .map(ManifestSample::into_sample)
            .collect()
    }
}
