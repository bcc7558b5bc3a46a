use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::*;

use super::config::NormKind;

/// `None` stands for the identity.
pub fn build_norm<B: Backend>(kind: NormKind, d_model: usize, device: &B::Device) -> Option<LayerNorm<B>> {
    match kind {
        NormKind::Identity => None,
        NormKind::LayerNorm => Some(LayerNormConfig::new(d_model).init(device)),
    }
}

pub fn apply_norm<B: Backend, const D: usize>(norm: &Option<LayerNorm<B>>, x: Tensor<B, D>) -> Tensor<B, D> {
    match norm {
        Some(norm) => norm.forward(x),
        None => x,
    }
}
