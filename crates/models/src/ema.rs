//! Elementwise exponential moving average over Burn parameters.

use burn::module::Param;
use burn::nn;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// `momentum·target + (1 − momentum)·source`. Momentum 0 copies `source` exactly.
pub fn blend_tensor<B: Backend, const D: usize>(
    target: Tensor<B, D>,
    source: Tensor<B, D>,
    momentum: f64,
) -> Tensor<B, D> {
    if momentum == 0.0 {
        return source;
    }
    if momentum == 1.0 {
        return target;
    }
    target.mul_scalar(momentum) + source.mul_scalar(1.0 - momentum)
}

/// Blend in place of the target parameter, keeping its id so records stay stable.
pub fn blend_param<B: Backend, const D: usize>(
    target: Param<Tensor<B, D>>,
    source: &Param<Tensor<B, D>>,
    momentum: f64,
) -> Param<Tensor<B, D>> {
    let source = source.val();
    target.map(|t| {
        let source = source.clone().to_device(&t.device());
        blend_tensor(t, source, momentum)
    })
}

pub fn blend_linear<B: Backend>(
    mut target: nn::Linear<B>,
    source: &nn::Linear<B>,
    momentum: f64,
) -> nn::Linear<B> {
    target.weight = blend_param(target.weight, &source.weight, momentum);
    target.bias = match (target.bias, source.bias.as_ref()) {
        (Some(t), Some(s)) => Some(blend_param(t, s, momentum)),
        (bias, _) => bias,
    };
    target
}
