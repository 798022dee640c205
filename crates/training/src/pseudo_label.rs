//! Teacher detections promoted to student supervision.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::{BoxTransform, Detection, PseudoLabel};
use models::{Detector, ForwardOptions, ModelInputError, PostProcess};

/// Keeps a detection iff `score ≥ score_threshold` and `area ≥ min_box_size`
/// (area of the normalised box). Nothing else is filtered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PseudoLabelFilter {
    pub score_threshold: f32,
    pub min_box_size: f32,
}

impl PseudoLabelFilter {
    pub fn keeps(&self, det: &Detection) -> bool {
        det.score >= self.score_threshold && det.area() >= self.min_box_size
    }

    pub fn apply(&self, dets: &[Detection]) -> Vec<Detection> {
        dets.iter().filter(|d| self.keeps(d)).copied().collect()
    }
}

/// Output of one pseudo-labelling pass over the unlabeled sub-batch.
#[derive(Debug, Clone)]
pub struct PseudoLabelBatch {
    /// Per image, in the strong-view frame. May be empty for an image.
    pub labels: Vec<Vec<PseudoLabel>>,
    pub raw_count: usize,
    pub kept_count: usize,
    /// Teacher boxes `[N, Q, 4]` mapped into the strong-view frame, flattened.
    pub proposals: Vec<f32>,
    pub queries: usize,
}

impl PseudoLabelBatch {
    pub fn targets(&self) -> Vec<Vec<data_contracts::ObjectLabel>> {
        self.labels
            .iter()
            .map(|image| image.iter().map(PseudoLabel::as_target).collect())
            .collect()
    }
}

/// Runs the teacher on weak views and filters its detections.
///
/// `weak_to_strong` holds one transform per image; kept boxes and the raw teacher boxes are
/// mapped through it so they line up with the strong views the student sees.
pub fn generate<B, T>(
    teacher: &T,
    weak_images: Tensor<B, 4>,
    weak_to_strong: &[BoxTransform],
    filter: PseudoLabelFilter,
    post: PostProcess,
) -> Result<PseudoLabelBatch, ModelInputError>
where
    B: Backend,
    T: Detector<B>,
{
    let batch = weak_images.dims()[0];
    if weak_to_strong.len() != batch {
        return Err(ModelInputError::Shape {
            what: "weak-to-strong transforms",
            expected: format!("{batch} transforms"),
            actual: format!("{} transforms", weak_to_strong.len()),
        });
    }
    let output = teacher.forward_detector(weak_images, ForwardOptions::default())?;
    let detections = teacher.decode(&output, post);

    let mut raw_count = 0;
    let mut kept_count = 0;
    let labels: Vec<Vec<PseudoLabel>> = detections
        .iter()
        .zip(weak_to_strong.iter())
        .map(|(dets, transform)| {
            raw_count += dets.len();
            let kept: Vec<PseudoLabel> = filter
                .apply(dets)
                .iter()
                .map(|d| {
                    let mut label = PseudoLabel::from_teacher(d);
                    label.bbox = transform.apply(label.bbox);
                    label
                })
                .collect();
            kept_count += kept.len();
            kept
        })
        .collect();

    let [_, queries, _] = output.boxes.dims();
    let mut proposals = output
        .boxes
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    for (b, transform) in weak_to_strong.iter().enumerate() {
        for q in 0..queries {
            let base = (b * queries + q) * 4;
            if let Some(slot) = proposals.get_mut(base..base + 4) {
                let mapped = transform.apply([slot[0], slot[1], slot[2], slot[3]]);
                slot.copy_from_slice(&mapped);
            }
        }
    }

    Ok(PseudoLabelBatch {
        labels,
        raw_count,
        kept_count,
        proposals,
        queries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(score: f32, bbox: [f32; 4]) -> Detection {
        Detection {
            bbox,
            class_id: 0,
            score,
        }
    }

    #[test]
    fn filter_keeps_exactly_score_and_area_passing() {
        let filter = PseudoLabelFilter {
            score_threshold: 0.4,
            min_box_size: 0.01,
        };
        let dets = vec![
            det(0.4, [0.0, 0.0, 0.2, 0.2]),    // on threshold, area 0.04
            det(0.39, [0.0, 0.0, 0.5, 0.5]),   // score too low
            det(0.9, [0.0, 0.0, 0.05, 0.05]),  // area 0.0025
            det(0.9, [0.1, 0.1, 0.2, 0.2]),    // area ~0.01
            det(0.95, [0.5, 0.5, 0.9, 0.9]),
        ];
        let kept = filter.apply(&dets);
        let expected: Vec<Detection> = dets
            .iter()
            .copied()
            .filter(|d| d.score >= 0.4 && d.area() >= 0.01)
            .collect();
        assert_eq!(kept, expected);
        assert!(kept.iter().any(|d| d.score == 0.4));
        assert!(!kept.iter().any(|d| d.score == 0.39));
    }

    #[test]
    fn zero_thresholds_keep_everything() {
        let filter = PseudoLabelFilter {
            score_threshold: 0.0,
            min_box_size: 0.0,
        };
        let dets = vec![det(0.0, [0.3, 0.3, 0.3, 0.3]), det(1.0, [0.0, 0.0, 1.0, 1.0])];
        assert_eq!(filter.apply(&dets).len(), 2);
    }
}
