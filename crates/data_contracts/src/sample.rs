use crate::detection::{BoxXyxy, ObjectLabel, ValidationError};
use serde::{Deserialize, Serialize};

/// Stable identifier of a sample across epochs and reshuffles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleId(pub u64);

impl std::fmt::Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which pool a sample is drawn from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Labeled,
    Unlabeled,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Labeled => "labeled",
            StreamKind::Unlabeled => "unlabeled",
        }
    }
}

/// Three-channel image in CHW layout, normalized to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub chw: Vec<f32>,
}

impl ImageBuffer {
    pub const CHANNELS: usize = 3;

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            chw: vec![value; Self::CHANNELS * width as usize * height as usize],
        }
    }

    pub fn expected_len(&self) -> usize {
        Self::CHANNELS * self.width as usize * self.height as usize
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Geometric relation between two views of the same image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoxTransform {
    #[default]
    Identity,
    HorizontalFlip,
}

impl BoxTransform {
    pub fn apply(&self, bbox: BoxXyxy) -> BoxXyxy {
        match self {
            BoxTransform::Identity => bbox,
            BoxTransform::HorizontalFlip => [1.0 - bbox[2], bbox[1], 1.0 - bbox[0], bbox[3]],
        }
    }

    /// Transform that maps `self`'s output frame back to its input frame.
    pub fn inverse(&self) -> Self {
        *self
    }

    /// `other` applied after `self`.
    pub fn then(&self, other: BoxTransform) -> Self {
        match (self, other) {
            (BoxTransform::Identity, t) => t,
            (t, BoxTransform::Identity) => *t,
            (BoxTransform::HorizontalFlip, BoxTransform::HorizontalFlip) => BoxTransform::Identity,
        }
    }
}

/// One image plus its annotations; `annotations` is `None` for unlabeled samples.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub id: SampleId,
    pub image: ImageBuffer,
    pub annotations: Option<Vec<ObjectLabel>>,
}

impl Sample {
    pub fn labeled(id: u64, image: ImageBuffer, annotations: Vec<ObjectLabel>) -> Self {
        Self {
            id: SampleId(id),
            image,
            annotations: Some(annotations),
        }
    }

    pub fn unlabeled(id: u64, image: ImageBuffer) -> Self {
        Self {
            id: SampleId(id),
            image,
            annotations: None,
        }
    }

    pub fn is_labeled(&self) -> bool {
        self.annotations.is_some()
    }

    pub fn validate(&self, num_classes: usize) -> Result<(), ValidationError> {
        if self.image.width == 0 || self.image.height == 0 {
            return Err(ValidationError::EmptyImage { id: self.id.0 });
        }
        if self.image.chw.len() != self.image.expected_len() {
            return Err(ValidationError::PixelCount {
                id: self.id.0,
                width: self.image.width,
                height: self.image.height,
                expected: self.image.expected_len(),
                actual: self.image.chw.len(),
            });
        }
        for label in self.annotations.iter().flatten() {
            label.validate(num_classes)?;
        }
        Ok(())
    }
}
