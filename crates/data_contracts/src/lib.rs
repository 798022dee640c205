//! Shared data contracts for samples, detections, pseudo-labels and sample manifests.

pub mod detection;
pub mod manifest;
pub mod sample;

pub use detection::{
    box_area, iou_xyxy, BoxXyxy, Detection, LabelSource, ObjectLabel, PseudoLabel,
    ValidationError,
};
pub use manifest::{ManifestSample, SampleManifest, SampleManifestSchemaVersion};
pub use sample::{BoxTransform, ImageBuffer, Sample, SampleId, StreamKind};
