use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use data_contracts::{iou_xyxy, Detection};

use crate::detector::DetectorOutput;

/// Decoding knobs applied after the forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostProcess {
    /// Keep at most this many detections per image, highest score first.
    pub max_per_image: usize,
    /// Class-wise NMS IoU threshold; `None` keeps raw one-to-one predictions.
    pub nms_iou: Option<f32>,
}

impl Default for PostProcess {
    fn default() -> Self {
        Self {
            max_per_image: 100,
            nms_iou: None,
        }
    }
}

impl PostProcess {
    pub fn with_nms(mut self, iou: f32) -> Self {
        self.nms_iou = Some(iou);
        self
    }
}

/// Best class per query, sorted by score. Scores are sigmoid probabilities.
pub fn decode_detections<B: Backend>(
    output: &DetectorOutput<B>,
    post: PostProcess,
) -> Vec<Vec<Detection>> {
    let [batch, queries, num_classes] = output.logits.dims();
    let scores = sigmoid(output.logits.clone())
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    let boxes = output
        .boxes
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    if num_classes == 0 {
        return vec![Vec::new(); batch];
    }

    let mut out = Vec::with_capacity(batch);
    for b in 0..batch {
        let mut dets = Vec::with_capacity(queries);
        for q in 0..queries {
            let row = (b * queries + q) * num_classes;
            let Some(class_scores) = scores.get(row..row + num_classes) else {
                continue;
            };
            let (class_id, score) = class_scores
                .iter()
                .copied()
                .enumerate()
                .fold((0usize, f32::MIN), |best, (c, s)| if s > best.1 { (c, s) } else { best });
            let base = (b * queries + q) * 4;
            let Some(bx) = boxes.get(base..base + 4) else {
                continue;
            };
            let x0 = bx[0].min(bx[2]).clamp(0.0, 1.0);
            let x1 = bx[0].max(bx[2]).clamp(0.0, 1.0);
            let y0 = bx[1].min(bx[3]).clamp(0.0, 1.0);
            let y1 = bx[1].max(bx[3]).clamp(0.0, 1.0);
            dets.push(Detection {
                bbox: [x0, y0, x1, y1],
                class_id,
                score: score.clamp(0.0, 1.0),
            });
        }
        dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(iou) = post.nms_iou {
            dets = class_wise_nms(dets, iou);
        }
        dets.truncate(post.max_per_image);
        out.push(dets);
    }
    out
}

/// Greedy NMS within each class. Input order is kept for survivors.
pub fn class_wise_nms(dets: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut kept: Vec<Detection> = Vec::with_capacity(dets.len());
    for det in dets {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && iou_xyxy(k.bbox, det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}
