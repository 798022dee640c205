use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized box `[x0, y0, x1, y1]` in 0..1.
pub type BoxXyxy = [f32; 4];

/// Where a supervision target came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    GroundTruth,
    Teacher,
}

/// A ground-truth (or promoted) object annotation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ObjectLabel {
    pub bbox: BoxXyxy,
    pub class_id: usize,
}

/// A single predicted instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub bbox: BoxXyxy,
    pub class_id: usize,
    pub score: f32,
}

/// A detection promoted to supervision for the student. Lives for one step only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PseudoLabel {
    pub bbox: BoxXyxy,
    pub class_id: usize,
    pub score: f32,
    pub source: LabelSource,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("bbox invalid order or out of range: {0:?}")]
    InvalidBbox(BoxXyxy),
    #[error("score out of range: {0}")]
    InvalidScore(f32),
    #[error("class id {class_id} outside {num_classes} categories")]
    UnknownClass { class_id: usize, num_classes: usize },
    #[error("sample {id}: expected {expected} pixels for {width}x{height}, found {actual}")]
    PixelCount {
        id: u64,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("sample {id}: image has zero size")]
    EmptyImage { id: u64 },
    #[error("duplicate sample id {0}")]
    DuplicateId(u64),
}

fn validate_bbox(bbox: BoxXyxy) -> Result<(), ValidationError> {
    let in_range = bbox.iter().all(|v| !v.is_nan() && *v >= 0.0 && *v <= 1.0);
    if !in_range || bbox[0] > bbox[2] || bbox[1] > bbox[3] {
        return Err(ValidationError::InvalidBbox(bbox));
    }
    Ok(())
}

/// Area of a normalized box; degenerate or inverted boxes have zero area.
pub fn box_area(bbox: BoxXyxy) -> f32 {
    (bbox[2] - bbox[0]).max(0.0) * (bbox[3] - bbox[1]).max(0.0)
}

pub fn iou_xyxy(a: BoxXyxy, b: BoxXyxy) -> f32 {
    let ax0 = a[0].min(a[2]);
    let ay0 = a[1].min(a[3]);
    let ax1 = a[0].max(a[2]);
    let ay1 = a[1].max(a[3]);
    let bx0 = b[0].min(b[2]);
    let by0 = b[1].min(b[3]);
    let bx1 = b[0].max(b[2]);
    let by1 = b[1].max(b[3]);

    let inter_w = (ax1.min(bx1) - ax0.max(bx0)).max(0.0);
    let inter_h = (ay1.min(by1) - ay0.max(by0)).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (ax1 - ax0) * (ay1 - ay0);
    let area_b = (bx1 - bx0) * (by1 - by0);
    let denom = area_a + area_b - inter_area;
    if denom <= 0.0 {
        0.0
    } else {
        inter_area / denom
    }
}

impl ObjectLabel {
    pub fn validate(&self, num_classes: usize) -> Result<(), ValidationError> {
        validate_bbox(self.bbox)?;
        if self.class_id >= num_classes {
            return Err(ValidationError::UnknownClass {
                class_id: self.class_id,
                num_classes,
            });
        }
        Ok(())
    }
}

impl Detection {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_bbox(self.bbox)?;
        if self.score.is_nan() || !(0.0..=1.0).contains(&self.score) {
            return Err(ValidationError::InvalidScore(self.score));
        }
        Ok(())
    }

    pub fn area(&self) -> f32 {
        box_area(self.bbox)
    }
}

impl PseudoLabel {
    /// Promote a teacher detection, keeping its box, class and score.
    pub fn from_teacher(det: &Detection) -> Self {
        Self {
            bbox: det.bbox,
            class_id: det.class_id,
            score: det.score,
            source: LabelSource::Teacher,
        }
    }

    pub fn as_target(&self) -> ObjectLabel {
        ObjectLabel {
            bbox: self.bbox,
            class_id: self.class_id,
        }
    }
}

impl From<&PseudoLabel> for ObjectLabel {
    fn from(label: &PseudoLabel) -> Self {
        label.as_target()
    }
}
