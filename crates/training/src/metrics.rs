//! Detection metrics: per-class AP (all-point interpolation), mAP@0.5, COCO-style
//! mAP@[0.5:0.95] and precision/recall at a score threshold.

use data_contracts::{iou_xyxy, BoxXyxy, Detection, ObjectLabel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassAp {
    pub class_id: usize,
    pub num_gt: usize,
    pub ap50: f32,
    /// Mean over IoU thresholds 0.50:0.05:0.95.
    pub ap: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetrics {
    pub map50: f32,
    pub map: f32,
    pub precision: f32,
    pub recall: f32,
    pub classwise: Vec<ClassAp>,
    pub num_images: usize,
    pub num_gt: usize,
    pub num_detections: usize,
}

const COCO_IOUS: [f32; 10] = [0.5, 0.55, 0.6, 0.65, 0.7, 0.75, 0.8, 0.85, 0.9, 0.95];

/// Area under the monotone precision envelope.
fn all_point_ap(tp: &[bool], num_gt: usize) -> f32 {
    if num_gt == 0 {
        return 0.0;
    }
    let mut recalls = Vec::with_capacity(tp.len());
    let mut precisions = Vec::with_capacity(tp.len());
    let mut hits = 0usize;
    for (i, is_tp) in tp.iter().enumerate() {
        if *is_tp {
            hits += 1;
        }
        recalls.push(hits as f32 / num_gt as f32);
        precisions.push(hits as f32 / (i + 1) as f32);
    }
    for i in (0..precisions.len().saturating_sub(1)).rev() {
        precisions[i] = precisions[i].max(precisions[i + 1]);
    }
    let mut ap = 0.0;
    let mut prev_recall = 0.0;
    for (r, p) in recalls.iter().zip(precisions.iter()) {
        ap += (r - prev_recall) * p;
        prev_recall = *r;
    }
    ap
}

/// Greedy matching in descending score order; each prediction takes the unmatched ground
/// truth with the highest IoU at or above `iou_thr`.
fn match_class(
    preds: &[(f32, usize, BoxXyxy)],
    gts: &[Vec<BoxXyxy>],
    iou_thr: f32,
) -> Vec<bool> {
    let mut used: Vec<Vec<bool>> = gts.iter().map(|g| vec![false; g.len()]).collect();
    preds
        .iter()
        .map(|(_, image, bbox)| {
            let mut best: Option<(usize, f32)> = None;
            for (g, gt) in gts[*image].iter().enumerate() {
                if used[*image][g] {
                    continue;
                }
                let iou = iou_xyxy(*bbox, *gt);
                if iou >= iou_thr && best.map(|(_, b)| iou > b).unwrap_or(true) {
                    best = Some((g, iou));
                }
            }
            match best {
                Some((g, _)) => {
                    used[*image][g] = true;
                    true
                }
                None => false,
            }
        })
        .collect()
}

pub fn evaluate_detections(
    predictions: &[Vec<Detection>],
    ground_truth: &[Vec<ObjectLabel>],
    num_classes: usize,
    iou_thr: f32,
    score_thr: f32,
) -> DetectionMetrics {
    let num_images = predictions.len().min(ground_truth.len());
    let mut classwise = Vec::new();
    let mut num_gt_total = 0usize;
    let mut tp_at_thr = 0usize;
    let mut det_at_thr = 0usize;

    for class_id in 0..num_classes {
        let gts: Vec<Vec<BoxXyxy>> = ground_truth[..num_images]
            .iter()
            .map(|labels| {
                labels
                    .iter()
                    .filter(|l| l.class_id == class_id)
                    .map(|l| l.bbox)
                    .collect()
            })
            .collect();
        let num_gt: usize = gts.iter().map(Vec::len).sum();
        let mut preds: Vec<(f32, usize, BoxXyxy)> = predictions[..num_images]
            .iter()
            .enumerate()
            .flat_map(|(image, dets)| {
                dets.iter()
                    .filter(move |d| d.class_id == class_id)
                    .map(move |d| (d.score, image, d.bbox))
            })
            .collect();
        preds.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let tp50 = match_class(&preds, &gts, iou_thr);
        for ((score, _, _), hit) in preds.iter().zip(tp50.iter()) {
            if *score >= score_thr {
                det_at_thr += 1;
                if *hit {
                    tp_at_thr += 1;
                }
            }
        }
        num_gt_total += num_gt;
        if num_gt == 0 {
            continue;
        }
        let ap50 = all_point_ap(&match_class(&preds, &gts, 0.5), num_gt);
        let ap = COCO_IOUS
            .iter()
            .map(|thr| all_point_ap(&match_class(&preds, &gts, *thr), num_gt))
            .sum::<f32>()
            / COCO_IOUS.len() as f32;
        classwise.push(ClassAp {
            class_id,
            num_gt,
            ap50,
            ap,
        });
    }

    let mean = |f: fn(&ClassAp) -> f32| {
        if classwise.is_empty() {
            0.0
        } else {
            classwise.iter().map(f).sum::<f32>() / classwise.len() as f32
        }
    };
    DetectionMetrics {
        map50: mean(|c| c.ap50),
        map: mean(|c| c.ap),
        precision: if det_at_thr > 0 {
            tp_at_thr as f32 / det_at_thr as f32
        } else {
            0.0
        },
        recall: if num_gt_total > 0 {
            tp_at_thr as f32 / num_gt_total as f32
        } else {
            0.0
        },
        num_images,
        num_gt: num_gt_total,
        num_detections: predictions[..num_images].iter().map(Vec::len).sum(),
        classwise,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gt(bbox: BoxXyxy, class_id: usize) -> ObjectLabel {
        ObjectLabel { bbox, class_id }
    }

    fn det(bbox: BoxXyxy, class_id: usize, score: f32) -> Detection {
        Detection {
            bbox,
            class_id,
            score,
        }
    }

    #[test]
    fn perfect_predictions_score_one() {
        let gts = vec![vec![gt([0.1, 0.1, 0.4, 0.4], 0), gt([0.5, 0.5, 0.9, 0.9], 1)]];
        let preds = vec![vec![
            det([0.1, 0.1, 0.4, 0.4], 0, 0.9),
            det([0.5, 0.5, 0.9, 0.9], 1, 0.8),
        ]];
        let m = evaluate_detections(&preds, &gts, 2, 0.5, 0.3);
        assert!((m.map50 - 1.0).abs() < 1e-6);
        assert!((m.map - 1.0).abs() < 1e-6);
        assert!((m.precision - 1.0).abs() < 1e-6);
        assert!((m.recall - 1.0).abs() < 1e-6);
        assert_eq!(m.classwise.len(), 2);
    }

    #[test]
    fn false_positive_ranked_first_halves_precision_area() {
        let gts = vec![vec![gt([0.1, 0.1, 0.4, 0.4], 0)]];
        let preds = vec![vec![
            det([0.6, 0.6, 0.9, 0.9], 0, 0.9),
            det([0.1, 0.1, 0.4, 0.4], 0, 0.8),
        ]];
        let m = evaluate_detections(&preds, &gts, 1, 0.5, 0.0);
        assert!((m.map50 - 0.5).abs() < 1e-6);
        assert!((m.precision - 0.5).abs() < 1e-6);
        assert!((m.recall - 1.0).abs() < 1e-6);
    }

    #[test]
    fn duplicate_detections_count_once() {
        let gts = vec![vec![gt([0.1, 0.1, 0.4, 0.4], 0)]];
        let preds = vec![vec![
            det([0.1, 0.1, 0.4, 0.4], 0, 0.9),
            det([0.1, 0.1, 0.4, 0.41], 0, 0.8),
        ]];
        let m = evaluate_detections(&preds, &gts, 1, 0.5, 0.0);
        assert!((m.map50 - 1.0).abs() < 1e-6);
        assert!((m.precision - 0.5).abs() < 1e-6);
    }

    #[test]
    fn classes_without_ground_truth_are_skipped() {
        let gts = vec![vec![gt([0.1, 0.1, 0.4, 0.4], 0)]];
        let preds = vec![vec![det([0.1, 0.1, 0.4, 0.4], 0, 0.9)]];
        let m = evaluate_detections(&preds, &gts, 3, 0.5, 0.3);
        assert_eq!(m.classwise.len(), 1);
        assert!((m.map50 - 1.0).abs() < 1e-6);
    }
}
