//! Turns a [`PaddedBatch`] into the dense model input.

use burn::module::{Ignored, Module};
use burn::prelude::*;

use super::batch::{PaddedBatch, TIME_PAD};
use super::config::{DataConfig, FeatureLayout};
use super::error::ConfigError;
use super::rng::{DeterministicEmbedding, DeterministicRngContext};

/// Per-feature clipping bound and vocabulary
#[derive(Debug, Clone)]
struct CategoricalSpec {
    name: String,
    /// Largest id passed to the embedding table
    max_id: i64,
}

/// Embeds categorical ids, concatenates numeric channels and rescales time.
///
/// Output layout per timestep: `[emb(cat_0) | ... | emb(cat_{n-1}) | num_0 | ... | num_{m-1}]`
#[derive(Module, Debug)]
pub struct FeatureProcessor<B: Backend> {
    pub embeddings: Vec<DeterministicEmbedding<B>>,
    categorical: Ignored<Vec<CategoricalSpec>>,
    numeric: Ignored<Vec<String>>,
    min_time: Ignored<f32>,
    max_time: Ignored<f32>,
}

impl<B: Backend> FeatureProcessor<B> {
    /// # Arguments
    /// * `init_seed_offset` - Table `i` initialises from `init_seed_offset + i`
    pub fn new(
        layout: &FeatureLayout,
        data: &DataConfig,
        rng_ctx: &DeterministicRngContext<B>,
        init_seed_offset: u64,
    ) -> Result<Self, ConfigError> {
        data.validate_consistent()?;
        if data.embeddings.len() != layout.num_categorical() {
            return Err(ConfigError::width(
                "categorical features in layout",
                data.embeddings.len(),
                layout.num_categorical(),
            ));
        }

        let embeddings = data
            .embeddings
            .iter()
            .enumerate()
            .map(|(i, feature)| {
                rng_ctx.create_embedding(feature.max_value, layout.emb_dim, init_seed_offset + i as u64)
            })
            .collect();
        let categorical = data
            .embeddings
            .iter()
            .map(|feature| CategoricalSpec {
                name: feature.name.clone(),
                max_id: feature.in_size.min(feature.max_value - 1) as i64,
            })
            .collect();

        Ok(Self {
            embeddings,
            categorical: Ignored(categorical),
            numeric: Ignored(data.numeric_values.clone()),
            min_time: Ignored(data.min_time),
            max_time: Ignored(data.max_time),
        })
    }

    /// Width of the processed feature vector
    pub fn output_dim(&self) -> usize {
        let emb_dim = self
            .embeddings
            .first()
            .map(|e| e.weight.val().dims()[1])
            .unwrap_or(0);
        self.embeddings.len() * emb_dim + self.numeric.len()
    }

    /// Returns `(features [batch, seq, output_dim], time_steps [batch, seq])`.
    ///
    /// Time steps are mapped to `(t - min_time) / (max_time - min_time)`;
    /// padded positions keep the `-1` sentinel.
    pub fn forward(&self, batch: &PaddedBatch<B>) -> Result<(Tensor<B, 3>, Tensor<B, 2>), ConfigError> {
        let [b, seq] = batch.dims();
        let mut channels: Vec<Tensor<B, 3>> = Vec::with_capacity(self.embeddings.len() + 1);

        for (spec, table) in self.categorical.iter().zip(&self.embeddings) {
            let ids = batch.categorical_feature(&spec.name)?;
            if ids.dims() != [b, seq] {
                return Err(ConfigError::shape(&spec.name, &[b, seq], &ids.dims()));
            }
            let clipped = ids.clone().clamp(0, spec.max_id);
            channels.push(table.forward_2d(clipped));
        }

        if !self.numeric.is_empty() {
            let mut numeric = Vec::with_capacity(self.numeric.len());
            for name in self.numeric.iter() {
                let values = batch.numeric_feature(name)?;
                if values.dims() != [b, seq] {
                    return Err(ConfigError::shape(name, &[b, seq], &values.dims()));
                }
                numeric.push(values.clone());
            }
            channels.push(Tensor::stack(numeric, 2));
        }

        let features = if channels.is_empty() {
            Tensor::zeros([b, seq, 0], &batch.device())
        } else {
            Tensor::cat(channels, 2)
        };

        Ok((features, self.normalize_time(batch.time_steps.clone())))
    }

    fn normalize_time(&self, time_steps: Tensor<B, 2>) -> Tensor<B, 2> {
        let padding = time_steps.clone().equal_elem(TIME_PAD);
        let span = *self.max_time - *self.min_time;
        time_steps
            .sub_scalar(*self.min_time)
            .div_scalar(span)
            .mask_fill(padding, TIME_PAD)
    }
}
