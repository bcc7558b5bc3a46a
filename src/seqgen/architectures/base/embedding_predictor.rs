//! Per-feature classification heads over the categorical region of the
//! predicted feature vector.

use burn::module::{Ignored, Module};
use burn::prelude::*;
use std::collections::BTreeMap;

use super::batch::PaddedBatch;
use super::config::{DataConfig, FeatureLayout};
use super::error::ConfigError;
use super::loss_utils::{masked_cross_entropy, CrossEntropySpec, MaskedLoss, HEAD_CROSS_ENTROPY};
use super::rng::{DeterministicLinear, DeterministicRngContext};

/// One `features_emb_dim -> max_value` head per categorical feature.
#[derive(Module, Debug)]
pub struct EmbeddingPredictor<B: Backend> {
    /// Heads in configuration order
    pub heads: Vec<DeterministicLinear<B>>,
    /// (feature name, vocabulary size), same order as `heads`
    features: Ignored<Vec<(String, usize)>>,
    emb_dim: Ignored<usize>,
    /// Loss configuration of [`EmbeddingPredictor::loss`]
    criterion: Ignored<CrossEntropySpec>,
}

impl<B: Backend> EmbeddingPredictor<B> {
    /// # Arguments
    /// * `init_seed_offset` - Head `i` initialises from `init_seed_offset + i`
    pub fn new(
        layout: &FeatureLayout,
        data: &DataConfig,
        rng_ctx: &DeterministicRngContext<B>,
        init_seed_offset: u64,
    ) -> Result<Self, ConfigError> {
        if layout.num_categorical() != data.embeddings.len() {
            return Err(ConfigError::width(
                "categorical features in layout",
                data.embeddings.len(),
                layout.num_categorical(),
            ));
        }

        let mut heads = Vec::with_capacity(data.embeddings.len());
        let mut features = Vec::with_capacity(data.embeddings.len());
        for (i, (feature, (name, _))) in data.embeddings.iter().zip(&layout.categorical).enumerate() {
            if &feature.name != name {
                return Err(ConfigError::Invalid(format!(
                    "categorical feature order differs between layout (`{}`) and data config (`{}`)",
                    name, feature.name
                )));
            }
            if feature.max_value < 2 {
                return Err(ConfigError::EmptyVocabulary {
                    name: feature.name.clone(),
                    max_value: feature.max_value,
                });
            }
            heads.push(rng_ctx.create_linear(
                layout.emb_dim,
                feature.max_value,
                true,
                init_seed_offset + i as u64,
            ));
            features.push((feature.name.clone(), feature.max_value));
        }

        Ok(Self {
            heads,
            features: Ignored(features),
            emb_dim: Ignored(layout.emb_dim),
            criterion: Ignored(HEAD_CROSS_ENTROPY),
        })
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|(name, _)| name.as_str())
    }

    /// Width of the categorical region the heads read from
    pub fn categorical_len(&self) -> usize {
        self.heads.len() * *self.emb_dim
    }

    /// Logits for every categorical feature.
    ///
    /// x_recon shape: [batch, seq, width] with `width >= categorical_len`
    /// output: feature name -> [batch, seq, vocab_size]
    pub fn forward(&self, x_recon: Tensor<B, 3>) -> Result<BTreeMap<String, Tensor<B, 3>>, ConfigError> {
        let [_, _, width] = x_recon.dims();
        if width < self.categorical_len() {
            return Err(ConfigError::width(
                "predicted vector (categorical region)",
                self.categorical_len(),
                width,
            ));
        }

        let emb_dim = *self.emb_dim;
        Ok(self
            .features
            .iter()
            .zip(&self.heads)
            .enumerate()
            .map(|(i, ((name, _), head))| {
                let block = x_recon.clone().narrow(2, i * emb_dim, emb_dim);
                (name.clone(), head.forward_3d(block))
            })
            .collect())
    }

    /// Per-feature cross-entropy against labels shifted by one timestep,
    /// without label smoothing.
    pub fn loss(
        &self,
        embedding_distribution: &BTreeMap<String, Tensor<B, 3>>,
        batch: &PaddedBatch<B>,
    ) -> Result<BTreeMap<String, MaskedLoss<B>>, ConfigError> {
        self.loss_with(embedding_distribution, batch, *self.criterion)
    }

    /// Per-feature cross-entropy with an explicit cross-entropy configuration.
    pub fn loss_with(
        &self,
        embedding_distribution: &BTreeMap<String, Tensor<B, 3>>,
        batch: &PaddedBatch<B>,
        spec: CrossEntropySpec,
    ) -> Result<BTreeMap<String, MaskedLoss<B>>, ConfigError> {
        let mut losses = BTreeMap::new();
        for name in self.feature_names() {
            let logits = embedding_distribution
                .get(name)
                .ok_or_else(|| ConfigError::MissingFeature(name.to_string()))?;
            let [b, steps, vocab] = logits.dims();

            let labels = batch.categorical_feature(name)?;
            let [lb, seq] = labels.dims();
            if lb != b || seq != steps + 1 {
                return Err(ConfigError::shape(
                    format!("labels for `{}`", name),
                    &[b, steps + 1],
                    &[lb, seq],
                ));
            }
            let shifted = labels.clone().narrow(1, 1, steps);

            let loss = masked_cross_entropy(
                logits.clone().reshape([b * steps, vocab]),
                shifted.reshape([b * steps]),
                spec,
            )?;
            losses.insert(name.to_string(), loss);
        }
        Ok(losses)
    }
}
