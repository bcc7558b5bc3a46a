//! Multi-head reconstruction loss.
//!
//! Combines three masked objectives over the predicted feature vector
//! `[batch, seq - 1, width]`:
//! - numeric MSE, averaged per sequence then across sequences, summed over features
//! - delta MSE over the trailing column, one fused average over the batch
//! - per-feature cross-entropy through the [`EmbeddingPredictor`] heads
//!
//! `total = mse_weight * mse + ce_weight * ce + delta_weight * delta`.

use burn::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

use super::batch::{PaddedBatch, TIME_PAD};
use super::config::{FeatureLayout, ModelConfig};
use super::embedding_predictor::EmbeddingPredictor;
use super::error::ConfigError;
use super::loss_utils::{
    check_loss_value, log_numerical_properties, masked_mse_fused, masked_mse_per_sequence,
    CrossEntropySpec, MaskedLoss, MODEL_CROSS_ENTROPY,
};

pub const TOTAL_MSE_KEY: &str = "total_mse_loss";
pub const TOTAL_CE_KEY: &str = "total_CE_loss";
pub const DELTA_KEY: &str = "delta_loss";
pub const TOTAL_KEY: &str = "total_loss";

const RESERVED_KEYS: [&str; 4] = [TOTAL_MSE_KEY, TOTAL_CE_KEY, DELTA_KEY, TOTAL_KEY];

/// Component name -> host-side value.
///
/// Always holds the four aggregate keys plus one key per categorical feature.
/// Component entries are unweighted; an undefined component (no valid
/// position anywhere in the batch) is `NaN`. `total_loss` is `NaN` only when
/// every component is undefined, while the tensor total stays a zero that
/// carries no gradient signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossBreakdown(BTreeMap<String, f32>);

impl LossBreakdown {
    pub fn get(&self, key: &str) -> Option<f32> {
        self.0.get(key).copied()
    }

    pub fn total_mse_loss(&self) -> f32 {
        self.0[TOTAL_MSE_KEY]
    }

    pub fn total_ce_loss(&self) -> f32 {
        self.0[TOTAL_CE_KEY]
    }

    pub fn delta_loss(&self) -> f32 {
        self.0[DELTA_KEY]
    }

    pub fn total_loss(&self) -> f32 {
        self.0[TOTAL_KEY]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, f32> {
        self.0
    }
}

/// Differentiable scalar for the optimizer plus the diagnostic breakdown.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    /// Shape [1]
    pub total_loss: Tensor<B, 1>,
    pub breakdown: LossBreakdown,
}

/// Weights and column layout of the reconstruction objective
#[derive(Debug, Clone)]
pub struct ReconstructionLoss {
    layout: FeatureLayout,
    pub mse_weight: f32,
    pub ce_weight: f32,
    pub delta_weight: f32,
    criterion: CrossEntropySpec,
}

impl ReconstructionLoss {
    pub fn new(model: &ModelConfig, layout: FeatureLayout) -> Result<Self, ConfigError> {
        for (name, _) in &layout.categorical {
            if RESERVED_KEYS.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "categorical feature name `{}` collides with a loss breakdown key",
                    name
                )));
            }
        }
        Ok(Self {
            layout,
            mse_weight: model.mse_weight,
            ce_weight: model.ce_weight,
            delta_weight: model.delta_weight,
            criterion: MODEL_CROSS_ENTROPY,
        })
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    pub fn criterion(&self) -> CrossEntropySpec {
        self.criterion
    }

    /// Evaluate the loss.
    ///
    /// pred shape: [batch, seq - 1, input_dim], prediction for timestep `i + 1`
    /// at position `i`
    /// time_steps shape: [batch, seq], the (normalised) time axis the model
    /// consumed, `-1` padded
    /// embedding_distribution: logits from `predictor.forward(pred)`
    pub fn compute<B: Backend>(
        &self,
        predictor: &EmbeddingPredictor<B>,
        pred: Tensor<B, 3>,
        embedding_distribution: &BTreeMap<String, Tensor<B, 3>>,
        batch: &PaddedBatch<B>,
        time_steps: &Tensor<B, 2>,
    ) -> Result<LossOutput<B>, ConfigError> {
        let [b, steps, width] = pred.dims();
        if width != self.layout.input_dim() {
            return Err(ConfigError::width("predicted feature vector", self.layout.input_dim(), width));
        }
        let batch_dims = batch.dims();
        if batch_dims != [b, steps + 1] {
            return Err(ConfigError::shape("ground-truth batch", &[b, steps + 1], &batch_dims));
        }
        if time_steps.dims() != batch_dims {
            return Err(ConfigError::shape("time steps", &batch_dims, &time_steps.dims()));
        }
        if predictor.categorical_len() != self.layout.categorical_len() {
            return Err(ConfigError::width(
                "embedding predictor categorical region",
                self.layout.categorical_len(),
                predictor.categorical_len(),
            ));
        }

        log::debug!(
            "Reconstruction loss: batch={}, steps={}, width={}, categorical={}, numeric={}",
            b,
            steps,
            width,
            self.layout.num_categorical(),
            self.layout.num_numeric()
        );
        if log::log_enabled!(log::Level::Debug) {
            log_numerical_properties(&pred, "predicted feature vector");
        }

        let device = pred.device();
        let mut breakdown = BTreeMap::new();

        // ------ numeric
        let feature_width = self.layout.feature_width();
        let mut numeric_losses = Vec::with_capacity(self.layout.num_numeric());
        let mut remaining = self.layout.num_numeric();
        for name in &self.layout.numeric {
            // Column is recomputed from the countdown, not read from the layout.
            let column = feature_width - remaining;
            let gt = batch.numeric_feature(name)?.clone().narrow(1, 1, steps);
            let pred_val = pred.clone().narrow(2, column, 1).reshape([b, steps]);
            let mask = gt.clone().not_equal_elem(0.0).float();

            let loss = masked_mse_per_sequence(pred_val, gt, mask);
            if !loss.is_defined() {
                log::warn!("numeric feature `{}` has no valid positions in this batch", name);
            }
            numeric_losses.push(loss);
            remaining -= 1;
        }
        let total_mse = sum_defined(&numeric_losses, &device);

        // ------ delta
        let delta = match self.layout.delta_column() {
            Some(column) => {
                let next = time_steps.clone().narrow(1, 1, steps);
                let prev = time_steps.clone().narrow(1, 0, steps);
                let mask = next.clone().not_equal_elem(TIME_PAD).float();
                let gt_delta = next - prev;
                let pred_delta = pred.clone().narrow(2, column, 1).reshape([b, steps]);

                let loss = masked_mse_fused(pred_delta, gt_delta, mask);
                if !loss.is_defined() {
                    log::warn!("delta loss has no valid positions in this batch");
                }
                Some(loss)
            }
            None => None,
        };

        // ------ categorical
        let ce_losses = predictor.loss_with(embedding_distribution, batch, self.criterion)?;
        let mut categorical = Vec::with_capacity(ce_losses.len());
        for (name, _) in &self.layout.categorical {
            let loss = ce_losses
                .get(name)
                .ok_or_else(|| ConfigError::MissingFeature(name.clone()))?;
            if !loss.is_defined() {
                log::warn!("categorical feature `{}` has only padding labels in this batch", name);
            }
            breakdown.insert(name.clone(), loss.scalar());
            categorical.push(loss.clone());
        }
        let total_ce = sum_defined(&categorical, &device);

        let delta_value = delta
            .as_ref()
            .map(|d| d.value.clone())
            .unwrap_or_else(|| Tensor::zeros([1], &device));
        let total_loss = total_mse.value.clone().mul_scalar(self.mse_weight)
            + total_ce.value.clone().mul_scalar(self.ce_weight)
            + delta_value.mul_scalar(self.delta_weight);

        breakdown.insert(TOTAL_MSE_KEY.to_string(), total_mse.scalar());
        breakdown.insert(TOTAL_CE_KEY.to_string(), total_ce.scalar());
        breakdown.insert(
            DELTA_KEY.to_string(),
            delta.as_ref().map_or(0.0, MaskedLoss::scalar),
        );

        let components = numeric_losses.len() + categorical.len() + usize::from(delta.is_some());
        let any_defined = numeric_losses
            .iter()
            .chain(&categorical)
            .chain(delta.as_ref())
            .any(MaskedLoss::is_defined);
        let total_value = if components > 0 && !any_defined {
            log::warn!("no loss component has a valid position in this batch; total loss is undefined");
            f32::NAN
        } else {
            let value = total_loss.clone().into_scalar().elem::<f32>();
            check_loss_value(TOTAL_KEY, value);
            value
        };
        breakdown.insert(TOTAL_KEY.to_string(), total_value);

        log::debug!("Loss breakdown: {:?}", breakdown);

        Ok(LossOutput {
            total_loss,
            breakdown: LossBreakdown(breakdown),
        })
    }
}

/// Sum of the defined components.
///
/// The result is undefined only when there is at least one component and none
/// of them is defined; an empty set sums to a defined zero.
fn sum_defined<B: Backend>(losses: &[MaskedLoss<B>], device: &B::Device) -> MaskedLoss<B> {
    let mut value = Tensor::zeros([1], device);
    let mut valid_count = 0;
    for loss in losses.iter().filter(|l| l.is_defined()) {
        value = value + loss.value.clone();
        valid_count += loss.valid_count;
    }
    if losses.is_empty() {
        valid_count = 1;
    }
    MaskedLoss { value, valid_count }
}
