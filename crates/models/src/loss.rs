use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use data_contracts::{iou_xyxy, BoxXyxy, ObjectLabel};

use crate::detector::{DetectorOutput, ModelInputError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub class: f32,
    pub bbox: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            class: 1.0,
            bbox: 5.0,
        }
    }
}

/// Loss terms of one forward pass; each is a single-element tensor.
#[derive(Debug, Clone)]
pub struct DetectionLosses<B: Backend> {
    pub class: Tensor<B, 1>,
    pub bbox: Tensor<B, 1>,
    /// Number of (query, target) pairs that received box supervision.
    pub matched: usize,
}

impl<B: Backend> DetectionLosses<B> {
    pub fn total(&self, weights: LossWeights) -> Tensor<B, 1> {
        self.class.clone().mul_scalar(weights.class) + self.bbox.clone().mul_scalar(weights.bbox)
    }
}

fn l1(a: BoxXyxy, b: BoxXyxy) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

/// One-to-one assignment of targets to queries.
///
/// Targets are visited in order; each takes the free query with the highest IoU, ties broken
/// by smaller L1 distance and then by lower query index. Targets beyond the query count stay
/// unmatched. Returns `(query, target)` pairs per image.
pub fn greedy_match(
    pred_boxes: &[f32],
    batch: usize,
    queries: usize,
    targets: &[Vec<ObjectLabel>],
) -> Vec<Vec<(usize, usize)>> {
    let mut out = Vec::with_capacity(batch);
    for b in 0..batch {
        let mut used = vec![false; queries];
        let mut pairs = Vec::new();
        let image_targets = targets.get(b).map(|t| t.as_slice()).unwrap_or(&[]);
        for (t, label) in image_targets.iter().enumerate() {
            let mut best: Option<(usize, f32, f32)> = None;
            for (q, taken) in used.iter().enumerate() {
                if *taken {
                    continue;
                }
                let base = (b * queries + q) * 4;
                let Some(slice) = pred_boxes.get(base..base + 4) else {
                    continue;
                };
                let pb = [slice[0], slice[1], slice[2], slice[3]];
                let iou = iou_xyxy(pb, label.bbox);
                let dist = l1(pb, label.bbox);
                let better = match best {
                    None => true,
                    Some((_, best_iou, best_dist)) => {
                        iou > best_iou || (iou == best_iou && dist < best_dist)
                    }
                };
                if better {
                    best = Some((q, iou, dist));
                }
            }
            if let Some((q, _, _)) = best {
                used[q] = true;
                pairs.push((q, t));
            }
        }
        out.push(pairs);
    }
    out
}

/// Sigmoid binary cross-entropy classification loss plus L1 box loss over matched queries.
///
/// Unmatched queries are pushed towards "no object" (all-zero class targets). The box term is
/// normalized by the matched count and is a zero tensor when nothing matched.
pub fn set_prediction_loss<B: Backend>(
    output: &DetectorOutput<B>,
    targets: &[Vec<ObjectLabel>],
) -> Result<DetectionLosses<B>, ModelInputError> {
    let [batch, queries, num_classes] = output.logits.dims();
    if targets.len() != batch {
        return Err(ModelInputError::Shape {
            what: "targets",
            expected: format!("{batch} target lists"),
            actual: format!("{} target lists", targets.len()),
        });
    }
    let device = output.logits.device();
    let pred_boxes = output
        .boxes
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    let matches = greedy_match(&pred_boxes, batch, queries, targets);

    let mut cls_targets = vec![0.0f32; batch * queries * num_classes];
    let mut box_targets = vec![0.0f32; batch * queries * 4];
    let mut box_weights = vec![0.0f32; batch * queries * 4];
    let mut matched = 0usize;
    for (b, pairs) in matches.iter().enumerate() {
        for &(q, t) in pairs {
            let label = targets[b][t];
            if label.class_id < num_classes {
                cls_targets[(b * queries + q) * num_classes + label.class_id] = 1.0;
            }
            let base = (b * queries + q) * 4;
            box_targets[base..base + 4].copy_from_slice(&label.bbox);
            box_weights[base..base + 4].fill(1.0);
            matched += 1;
        }
    }

    let cls_targets = Tensor::<B, 3>::from_data(
        TensorData::new(cls_targets, [batch, queries, num_classes]),
        &device,
    );
    let logits = output.logits.clone();
    // Stable BCE with logits: max(x, 0) - x*y + log(1 + exp(-|x|)).
    let class = (logits.clone().clamp_min(0.0) - logits.clone() * cls_targets
        + logits.abs().neg().exp().log1p())
    .mean();

    let bbox = if matched > 0 {
        let box_targets =
            Tensor::<B, 3>::from_data(TensorData::new(box_targets, [batch, queries, 4]), &device);
        let box_weights =
            Tensor::<B, 3>::from_data(TensorData::new(box_weights, [batch, queries, 4]), &device);
        ((output.boxes.clone() - box_targets).abs() * box_weights)
            .sum()
            .div_scalar(matched as f32)
    } else {
        Tensor::<B, 1>::zeros([1], &device)
    };

    Ok(DetectionLosses {
        class,
        bbox,
        matched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(bbox: BoxXyxy) -> ObjectLabel {
        ObjectLabel { bbox, class_id: 0 }
    }

    #[test]
    fn greedy_match_is_one_to_one() {
        // Two queries, both closest to the same box.
        let preds = vec![0.1, 0.1, 0.5, 0.5, 0.12, 0.1, 0.5, 0.5];
        let targets = vec![vec![label([0.1, 0.1, 0.5, 0.5]), label([0.1, 0.1, 0.5, 0.5])]];
        let m = greedy_match(&preds, 1, 2, &targets);
        assert_eq!(m[0], vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn extra_targets_stay_unmatched() {
        let preds = vec![0.0, 0.0, 1.0, 1.0];
        let targets = vec![vec![label([0.0, 0.0, 1.0, 1.0]), label([0.2, 0.2, 0.4, 0.4])]];
        let m = greedy_match(&preds, 1, 1, &targets);
        assert_eq!(m[0].len(), 1);
    }
}
