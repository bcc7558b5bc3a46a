//! Synthetic batches for tests, benchmarks and the demo binary.
//!
//! Values are drawn from a seeded `StdRng`, so the same arguments always
//! produce the same batch.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::seqgen::architectures::base::batch::{pad_rows_f32, pad_rows_i64, PaddedBatch, TIME_PAD};
use crate::seqgen::architectures::base::config::DataConfig;

/// Build a padded batch with the given sequence lengths.
///
/// Categorical ids are drawn from `1..=in` (never the padding id), numeric
/// values from `(0.1, 1.1)` (never the padding value), and time steps are
/// strictly increasing within `[min_time, max_time]`.
pub fn synthetic_batch<B: Backend>(
    data: &DataConfig,
    seq_lens: &[usize],
    seed: u64,
    device: &B::Device,
) -> PaddedBatch<B> {
    let mut rng = StdRng::seed_from_u64(seed);
    let span = data.max_time - data.min_time;

    let time_rows: Vec<Vec<f32>> = seq_lens
        .iter()
        .map(|&len| {
            (0..len)
                .map(|i| data.min_time + span * i as f32 / len.max(1) as f32)
                .collect()
        })
        .collect();
    let mut batch = PaddedBatch::new(pad_rows_f32(&time_rows, TIME_PAD, device), seq_lens.to_vec());

    for feature in &data.embeddings {
        let upper = feature.in_size.min(feature.max_value - 1).max(1) as i64;
        let rows: Vec<Vec<i64>> = seq_lens
            .iter()
            .map(|&len| (0..len).map(|_| rng.gen_range(1..=upper)).collect())
            .collect();
        batch = batch.with_categorical(feature.name.clone(), pad_rows_i64(&rows, device));
    }

    for name in &data.numeric_values {
        let rows: Vec<Vec<f32>> = seq_lens
            .iter()
            .map(|&len| (0..len).map(|_| 0.1 + rng.r#gen::<f32>()).collect())
            .collect();
        batch = batch.with_numeric(name.clone(), pad_rows_f32(&rows, 0.0, device));
    }

    batch
}

/// Flatten a tensor to a host vector.
pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap_or_default()
}
