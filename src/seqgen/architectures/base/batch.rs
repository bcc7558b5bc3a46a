//! Padded batch of variable-length event sequences.
//!
//! Tensor layout is batch-first:
//! - categorical features: `[batch, seq]` integer ids, `0` = padding
//! - numeric features: `[batch, seq]` reals, `0.0` = padding
//! - time steps: `[batch, seq]` reals, `-1.0` = padding

use burn::prelude::*;
use std::collections::BTreeMap;

use super::config::DataConfig;
use super::error::ConfigError;

/// Padding sentinel for categorical ids and numeric values
pub const FEATURE_PAD: i64 = 0;
/// Padding sentinel for raw time steps
pub const TIME_PAD: f32 = -1.0;

#[derive(Debug, Clone)]
pub struct PaddedBatch<B: Backend> {
    pub categorical: BTreeMap<String, Tensor<B, 2, Int>>,
    pub numeric: BTreeMap<String, Tensor<B, 2>>,
    pub time_steps: Tensor<B, 2>,
    /// Valid length of every sequence
    pub seq_lens: Vec<usize>,
}

impl<B: Backend> PaddedBatch<B> {
    pub fn new(time_steps: Tensor<B, 2>, seq_lens: Vec<usize>) -> Self {
        Self {
            categorical: BTreeMap::new(),
            numeric: BTreeMap::new(),
            time_steps,
            seq_lens,
        }
    }

    pub fn with_categorical(mut self, name: impl Into<String>, ids: Tensor<B, 2, Int>) -> Self {
        self.categorical.insert(name.into(), ids);
        self
    }

    pub fn with_numeric(mut self, name: impl Into<String>, values: Tensor<B, 2>) -> Self {
        self.numeric.insert(name.into(), values);
        self
    }

    /// `[batch, seq]` of the padded time axis
    pub fn dims(&self) -> [usize; 2] {
        self.time_steps.dims()
    }

    pub fn batch_size(&self) -> usize {
        self.dims()[0]
    }

    pub fn max_len(&self) -> usize {
        self.dims()[1]
    }

    pub fn device(&self) -> B::Device {
        self.time_steps.device()
    }

    pub fn categorical_feature(&self, name: &str) -> Result<&Tensor<B, 2, Int>, ConfigError> {
        self.categorical
            .get(name)
            .ok_or_else(|| ConfigError::MissingFeature(name.to_string()))
    }

    pub fn numeric_feature(&self, name: &str) -> Result<&Tensor<B, 2>, ConfigError> {
        self.numeric
            .get(name)
            .ok_or_else(|| ConfigError::MissingFeature(name.to_string()))
    }

    /// Check that every configured feature is present and shaped like the time axis.
    pub fn validate(&self, data: &DataConfig) -> Result<(), ConfigError> {
        let dims = self.dims();
        if self.seq_lens.len() != dims[0] {
            return Err(ConfigError::width("seq_lens", dims[0], self.seq_lens.len()));
        }
        if let Some(&len) = self.seq_lens.iter().find(|&&l| l == 0 || l > dims[1]) {
            return Err(ConfigError::Invalid(format!(
                "sequence length {} outside 1..={}",
                len, dims[1]
            )));
        }
        for feature in &data.embeddings {
            let ids = self.categorical_feature(&feature.name)?;
            if ids.dims() != dims {
                return Err(ConfigError::shape(&feature.name, &dims, &ids.dims()));
            }
        }
        for name in &data.numeric_values {
            let values = self.numeric_feature(name)?;
            if values.dims() != dims {
                return Err(ConfigError::shape(name, &dims, &values.dims()));
            }
        }
        Ok(())
    }
}

/// Right-pad variable-length rows into a `[rows, max_len]` tensor.
pub fn pad_rows_f32<B: Backend>(rows: &[Vec<f32>], pad: f32, device: &B::Device) -> Tensor<B, 2> {
    let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(rows.len() * max_len);
    for row in rows {
        flat.extend_from_slice(row);
        flat.extend(std::iter::repeat(pad).take(max_len - row.len()));
    }
    Tensor::from_data(TensorData::new(flat, [rows.len(), max_len]), device)
}

/// Right-pad variable-length id rows with [`FEATURE_PAD`].
pub fn pad_rows_i64<B: Backend>(rows: &[Vec<i64>], device: &B::Device) -> Tensor<B, 2, Int> {
    let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(rows.len() * max_len);
    for row in rows {
        flat.extend_from_slice(row);
        flat.extend(std::iter::repeat(FEATURE_PAD).take(max_len - row.len()));
    }
    Tensor::from_data(TensorData::new(flat, [rows.len(), max_len]), device)
}
