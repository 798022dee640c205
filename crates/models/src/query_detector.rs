use burn::module::{Module, Param};
use burn::nn;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::module::adaptive_avg_pool2d;
use burn::tensor::{Distribution, Tensor};
use data_contracts::{Detection, ObjectLabel};
use serde::{Deserialize, Serialize};

use crate::detector::{
    Detector, DetectorOutput, ForwardOptions, ModelInputError, ModelParameters,
};
use crate::ema::{blend_linear, blend_param};
use crate::loss::{set_prediction_loss, DetectionLosses};
use crate::postprocess::{decode_detections, PostProcess};

const INVERSE_SIGMOID_EPS: f32 = 1e-5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryDetectorConfig {
    pub num_classes: usize,
    pub num_queries: usize,
    pub hidden: usize,
    pub depth: usize,
    /// Side of the pooled feature grid fed to the stem.
    pub grid: usize,
    /// Head switches from one-to-many to one-to-one at `warm_up_step`.
    pub stage_wise: bool,
    pub warm_up_step: usize,
}

impl Default for QueryDetectorConfig {
    fn default() -> Self {
        Self {
            num_classes: 3,
            num_queries: 30,
            hidden: 128,
            depth: 2,
            grid: 4,
            stage_wise: false,
            warm_up_step: 0,
        }
    }
}

/// Pooled-image encoder plus a set of learned queries, each predicting one box and class.
///
/// Boxes are refined from reference points: `sigmoid(inverse_sigmoid(ref) + delta)`. The
/// reference is either learned or supplied per call as proposals.
#[derive(Debug, Module)]
pub struct QueryDetector<B: Backend> {
    stem: nn::Linear<B>,
    blocks: Vec<nn::Linear<B>>,
    decoder: nn::Linear<B>,
    box_head: nn::Linear<B>,
    class_head: nn::Linear<B>,
    query_embed: Param<Tensor<B, 2>>,
    reference_points: Param<Tensor<B, 2>>,
    num_classes: usize,
    num_queries: usize,
    hidden: usize,
    grid: usize,
    stage_wise: bool,
    warm_up_step: usize,
}

fn inverse_sigmoid<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let x = x.clamp(INVERSE_SIGMOID_EPS, 1.0 - INVERSE_SIGMOID_EPS);
    (x.clone() / x.neg().add_scalar(1.0)).log()
}

/// Reorder/clamp to enforce x0 <= x1, y0 <= y1 within [0,1] using arithmetic.
fn order_corners<B: Backend>(boxes: Tensor<B, 3>) -> Tensor<B, 3> {
    let [batch, queries, _] = boxes.dims();
    let x0 = boxes.clone().slice([0..batch, 0..queries, 0..1]);
    let y0 = boxes.clone().slice([0..batch, 0..queries, 1..2]);
    let x1 = boxes.clone().slice([0..batch, 0..queries, 2..3]);
    let y1 = boxes.slice([0..batch, 0..queries, 3..4]);

    let dx = x0.clone() - x1.clone();
    let dy = y0.clone() - y1.clone();
    let half = 0.5;

    let x_min = ((x0.clone() + x1.clone() - dx.clone().abs()) * half).clamp(0.0, 1.0);
    let x_max = ((x0 + x1 + dx.abs()) * half).clamp(0.0, 1.0);
    let y_min = ((y0.clone() + y1.clone() - dy.clone().abs()) * half).clamp(0.0, 1.0);
    let y_max = ((y0 + y1 + dy.abs()) * half).clamp(0.0, 1.0);

    Tensor::cat(vec![x_min, y_min, x_max, y_max], 2)
}

impl<B: Backend> QueryDetector<B> {
    pub fn new(cfg: QueryDetectorConfig, device: &B::Device) -> Self {
        let grid = cfg.grid.max(1);
        let hidden = cfg.hidden.max(1);
        let num_queries = cfg.num_queries.max(1);
        let num_classes = cfg.num_classes.max(1);
        let input_dim = 3 * grid * grid;

        let stem = nn::LinearConfig::new(input_dim, hidden).init(device);
        let mut blocks = Vec::new();
        for _ in 0..cfg.depth {
            blocks.push(nn::LinearConfig::new(hidden, hidden).init(device));
        }
        let decoder = nn::LinearConfig::new(hidden, hidden).init(device);
        let box_head = nn::LinearConfig::new(hidden, 4).init(device);
        let class_head = nn::LinearConfig::new(hidden, num_classes).init(device);
        let query_embed = Param::from_tensor(Tensor::random(
            [num_queries, hidden],
            Distribution::Normal(0.0, 1.0),
            device,
        ));
        // Reference boxes start spread over the image in logit space.
        let reference_points = Param::from_tensor(Tensor::random(
            [num_queries, 4],
            Distribution::Uniform(-2.0, 2.0),
            device,
        ));

        Self {
            stem,
            blocks,
            decoder,
            box_head,
            class_head,
            query_embed,
            reference_points,
            num_classes,
            num_queries,
            hidden,
            grid,
            stage_wise: cfg.stage_wise,
            warm_up_step: cfg.warm_up_step,
        }
    }

    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        options: ForwardOptions<B>,
    ) -> Result<DetectorOutput<B>, ModelInputError> {
        let [batch, channels, height, width] = images.dims();
        if batch == 0 {
            return Err(ModelInputError::EmptyBatch);
        }
        if channels != 3 || height == 0 || width == 0 {
            return Err(ModelInputError::Shape {
                what: "images",
                expected: "[N, 3, H, W] with H, W > 0".to_string(),
                actual: format!("{:?}", [batch, channels, height, width]),
            });
        }
        let queries = self.num_queries;
        let hidden = self.hidden;

        let pooled = adaptive_avg_pool2d(images, [self.grid, self.grid])
            .reshape([batch, 3 * self.grid * self.grid]);
        let mut x = relu(self.stem.forward(pooled));
        for block in &self.blocks {
            x = relu(block.forward(x));
        }

        let mut query = self.query_embed.val();
        if let Some(std) = options.query_noise.filter(|s| *s > 0.0) {
            let noise = Tensor::random(
                [queries, hidden],
                Distribution::Normal(0.0, std),
                &query.device(),
            );
            query = query + noise;
        }

        let h = x.unsqueeze_dim::<3>(1).expand([batch, queries, hidden])
            + query.unsqueeze_dim::<3>(0).expand([batch, queries, hidden]);
        let h = relu(self.decoder.forward(h));
        let logits = self.class_head.forward(h.clone());
        let delta = self.box_head.forward(h);

        let reference = match options.proposals {
            Some(proposals) => {
                let dims = proposals.dims();
                if dims != [batch, queries, 4] {
                    return Err(ModelInputError::Shape {
                        what: "proposals",
                        expected: format!("{:?}", [batch, queries, 4]),
                        actual: format!("{dims:?}"),
                    });
                }
                inverse_sigmoid(proposals)
            }
            None => self
                .reference_points
                .val()
                .unsqueeze_dim::<3>(0)
                .expand([batch, queries, 4]),
        };
        let boxes = order_corners(sigmoid(reference + delta));

        Ok(DetectorOutput { boxes, logits })
    }
}

impl<B: Backend> Detector<B> for QueryDetector<B> {
    fn forward_detector(
        &self,
        images: Tensor<B, 4>,
        options: ForwardOptions<B>,
    ) -> Result<DetectorOutput<B>, ModelInputError> {
        self.forward(images, options)
    }

    fn loss(
        &self,
        output: &DetectorOutput<B>,
        targets: &[Vec<ObjectLabel>],
    ) -> Result<DetectionLosses<B>, ModelInputError> {
        set_prediction_loss(output, targets)
    }

    fn decode(&self, output: &DetectorOutput<B>, post: PostProcess) -> Vec<Vec<Detection>> {
        decode_detections(output, post)
    }

    fn ema_blend(self, source: &Self, momentum: f64) -> Self {
        let mut target = self;
        target.stem = blend_linear(target.stem, &source.stem, momentum);
        target.blocks = target
            .blocks
            .into_iter()
            .zip(source.blocks.iter())
            .map(|(t, s)| blend_linear(t, s, momentum))
            .collect();
        target.decoder = blend_linear(target.decoder, &source.decoder, momentum);
        target.box_head = blend_linear(target.box_head, &source.box_head, momentum);
        target.class_head = blend_linear(target.class_head, &source.class_head, momentum);
        target.query_embed = blend_param(target.query_embed, &source.query_embed, momentum);
        target.reference_points =
            blend_param(target.reference_points, &source.reference_points, momentum);
        target
    }

    fn parameters(&self) -> ModelParameters {
        let mut params = ModelParameters::default();
        let linear = |name: &str, layer: &nn::Linear<B>, params: &mut ModelParameters| {
            params.push(format!("{name}.weight"), &layer.weight);
            if let Some(bias) = &layer.bias {
                params.push(format!("{name}.bias"), bias);
            }
        };
        linear("stem", &self.stem, &mut params);
        for (i, block) in self.blocks.iter().enumerate() {
            linear(&format!("blocks.{i}"), block, &mut params);
        }
        linear("decoder", &self.decoder, &mut params);
        linear("box_head", &self.box_head, &mut params);
        linear("class_head", &self.class_head, &mut params);
        params.push("query_embed", &self.query_embed);
        params.push("reference_points", &self.reference_points);
        params
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn num_queries(&self) -> usize {
        self.num_queries
    }

    fn warm_up_step(&self) -> Option<usize> {
        self.stage_wise.then_some(self.warm_up_step)
    }
}
