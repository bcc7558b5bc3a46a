//! Sequence encoders producing one global latent per sequence.
//!
//! Recurrent encoders (GRU, LSTM) read the hidden state at the last valid
//! position of every sequence. The transformer encoder reads position 0.

use burn::module::{Ignored, Module};
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::LayerNorm;
use burn::prelude::*;
use burn::tensor::activation;

use super::config::{EncoderKind, ModelConfig};
use super::error::ConfigError;
use super::norm::{apply_norm, build_norm};
use super::rng::{DeterministicLinear, DeterministicRngContext};

const SEED_STRIDE_PER_LAYER: u64 = 10;

/// Plain GRU layer (reset gate applied to the projected hidden state).
#[derive(Module, Debug)]
pub struct GruLayer<B: Backend> {
    pub x2h: DeterministicLinear<B>,
    pub h2h: DeterministicLinear<B>,
    hidden_size: Ignored<usize>,
}

impl<B: Backend> GruLayer<B> {
    pub fn new(input_size: usize, hidden_size: usize, rng_ctx: &DeterministicRngContext<B>, offset: u64) -> Self {
        let bound = 1.0 / (hidden_size as f32).sqrt();
        Self {
            x2h: rng_ctx.create_uniform_linear(input_size, 3 * hidden_size, true, bound, offset),
            h2h: rng_ctx.create_uniform_linear(hidden_size, 3 * hidden_size, true, bound, offset + 1),
            hidden_size: Ignored(hidden_size),
        }
    }

    /// input shape: [batch, seq, input_size], output shape: [batch, seq, hidden_size]
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq_len, _] = input.dims();
        let hidden = *self.hidden_size;
        let x_all = self.x2h.forward_3d(input);
        let mut h = Tensor::zeros([batch, hidden], &x_all.device());
        let mut steps = Vec::with_capacity(seq_len);

        for t in 0..seq_len {
            let x_t = x_all.clone().narrow(1, t, 1).reshape([batch, 3 * hidden]);
            let h_t = self.h2h.forward(h.clone());
            let gate = |proj: &Tensor<B, 2>, i: usize| proj.clone().narrow(1, i * hidden, hidden);

            let reset = activation::sigmoid(gate(&x_t, 0) + gate(&h_t, 0));
            let update = activation::sigmoid(gate(&x_t, 1) + gate(&h_t, 1));
            let candidate = (gate(&x_t, 2) + reset * gate(&h_t, 2)).tanh();

            h = update.clone() * h + (update.neg() + 1.0) * candidate;
            steps.push(h.clone());
        }
        stack_steps(steps, batch, hidden, &x_all.device())
    }
}

/// Plain LSTM layer, gate order (input, forget, cell, output).
#[derive(Module, Debug)]
pub struct LstmLayer<B: Backend> {
    pub x2h: DeterministicLinear<B>,
    pub h2h: DeterministicLinear<B>,
    hidden_size: Ignored<usize>,
}

impl<B: Backend> LstmLayer<B> {
    pub fn new(input_size: usize, hidden_size: usize, rng_ctx: &DeterministicRngContext<B>, offset: u64) -> Self {
        let bound = 1.0 / (hidden_size as f32).sqrt();
        Self {
            x2h: rng_ctx.create_uniform_linear(input_size, 4 * hidden_size, true, bound, offset),
            h2h: rng_ctx.create_uniform_linear(hidden_size, 4 * hidden_size, true, bound, offset + 1),
            hidden_size: Ignored(hidden_size),
        }
    }

    /// input shape: [batch, seq, input_size], output shape: [batch, seq, hidden_size]
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq_len, _] = input.dims();
        let hidden = *self.hidden_size;
        let x_all = self.x2h.forward_3d(input);
        let device = x_all.device();
        let mut h = Tensor::zeros([batch, hidden], &device);
        let mut c = Tensor::zeros([batch, hidden], &device);
        let mut steps = Vec::with_capacity(seq_len);

        for t in 0..seq_len {
            let gates = x_all.clone().narrow(1, t, 1).reshape([batch, 4 * hidden]) + self.h2h.forward(h);
            let gate = |i: usize| gates.clone().narrow(1, i * hidden, hidden);

            let input_gate = activation::sigmoid(gate(0));
            let forget_gate = activation::sigmoid(gate(1));
            let cell_gate = gate(2).tanh();
            let output_gate = activation::sigmoid(gate(3));

            c = forget_gate * c + input_gate * cell_gate;
            h = output_gate * c.clone().tanh();
            steps.push(h.clone());
        }
        stack_steps(steps, batch, hidden, &device)
    }
}

fn stack_steps<B: Backend>(steps: Vec<Tensor<B, 2>>, batch: usize, hidden: usize, device: &B::Device) -> Tensor<B, 3> {
    if steps.is_empty() {
        Tensor::zeros([batch, 0, hidden], device)
    } else {
        Tensor::stack(steps, 1)
    }
}

/// Input projection followed by a stock transformer encoder stack.
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    pub proj: DeterministicLinear<B>,
    pub encoder: TransformerEncoder<B>,
    pub norm: Option<LayerNorm<B>>,
}

/// Encoder selected by [`EncoderKind`].
///
/// Exactly one of `gru_layers`, `lstm_layers` and `transformer` is populated.
#[derive(Module, Debug)]
pub struct SequenceEncoder<B: Backend> {
    pub gru_layers: Vec<GruLayer<B>>,
    pub lstm_layers: Vec<LstmLayer<B>>,
    pub transformer: Option<TransformerBlock<B>>,
    pub pre_norm: Option<LayerNorm<B>>,
    pub post_norm: Option<LayerNorm<B>>,
    kind: Ignored<EncoderKind>,
    input_dim: Ignored<usize>,
    hidden_size: Ignored<usize>,
}

impl<B: Backend> SequenceEncoder<B> {
    pub fn new(
        config: &ModelConfig,
        input_dim: usize,
        rng_ctx: &DeterministicRngContext<B>,
        init_seed_offset: u64,
    ) -> Result<Self, ConfigError> {
        config.validate_consistent()?;
        let hidden = config.encoder_hidden;
        let device = rng_ctx.device();

        let layer_input = |layer: usize| if layer == 0 { input_dim } else { hidden };
        let layer_offset = |layer: usize| init_seed_offset + SEED_STRIDE_PER_LAYER * layer as u64;

        let mut encoder = Self {
            gru_layers: Vec::new(),
            lstm_layers: Vec::new(),
            transformer: None,
            pre_norm: build_norm(config.pre_encoder_norm, input_dim, device),
            post_norm: build_norm(config.post_encoder_norm, hidden, device),
            kind: Ignored(config.encoder),
            input_dim: Ignored(input_dim),
            hidden_size: Ignored(hidden),
        };

        match config.encoder {
            EncoderKind::Gru => {
                encoder.gru_layers = (0..config.encoder_num_layers)
                    .map(|l| GruLayer::new(layer_input(l), hidden, rng_ctx, layer_offset(l)))
                    .collect();
            }
            EncoderKind::Lstm => {
                encoder.lstm_layers = (0..config.encoder_num_layers)
                    .map(|l| LstmLayer::new(layer_input(l), hidden, rng_ctx, layer_offset(l)))
                    .collect();
            }
            EncoderKind::Transformer => {
                let proj = rng_ctx.create_linear(
                    input_dim,
                    hidden,
                    true,
                    init_seed_offset + SEED_STRIDE_PER_LAYER * config.encoder_num_layers as u64,
                );
                let stack = TransformerEncoderConfig::new(
                    hidden,
                    config.transformer_ff_dim,
                    config.encoder_num_heads,
                    config.encoder_num_layers,
                )
                .init(device);
                encoder.pre_norm = None;
                encoder.post_norm = None;
                encoder.transformer = Some(TransformerBlock {
                    proj,
                    encoder: stack,
                    norm: build_norm(config.encoder_norm, hidden, device),
                });
            }
        }

        Ok(encoder)
    }

    pub fn kind(&self) -> EncoderKind {
        *self.kind
    }

    pub fn hidden_size(&self) -> usize {
        *self.hidden_size
    }

    /// Global latent for every sequence.
    ///
    /// x shape: [batch, seq, input_dim]
    /// output shape: [batch, encoder_hidden]
    pub fn forward(&self, x: Tensor<B, 3>, seq_lens: &[usize]) -> Result<Tensor<B, 2>, ConfigError> {
        let [batch, seq_len, width] = x.dims();
        if width != *self.input_dim {
            return Err(ConfigError::width("encoder input", *self.input_dim, width));
        }
        if seq_lens.len() != batch {
            return Err(ConfigError::width("seq_lens", batch, seq_lens.len()));
        }

        if let Some(block) = &self.transformer {
            let projected = block.proj.forward_3d(x);
            let encoded = block.encoder.forward(TransformerEncoderInput::new(projected));
            let encoded = apply_norm(&block.norm, encoded);
            return Ok(encoded.narrow(1, 0, 1).reshape([batch, self.hidden_size()]));
        }

        let mut hidden = apply_norm(&self.pre_norm, x);
        for layer in &self.gru_layers {
            hidden = layer.forward(hidden);
        }
        for layer in &self.lstm_layers {
            hidden = layer.forward(hidden);
        }

        let latent = gather_last_valid(hidden, seq_lens, seq_len)?;
        Ok(apply_norm(&self.post_norm, latent))
    }
}

/// Pick `all_hidden[i, seq_lens[i] - 1, :]` for every sequence `i`.
pub fn gather_last_valid<B: Backend>(
    all_hidden: Tensor<B, 3>,
    seq_lens: &[usize],
    max_len: usize,
) -> Result<Tensor<B, 2>, ConfigError> {
    let [batch, _, hidden] = all_hidden.dims();
    if let Some(&len) = seq_lens.iter().find(|&&l| l == 0 || l > max_len) {
        return Err(ConfigError::Invalid(format!(
            "sequence length {} outside 1..={}",
            len, max_len
        )));
    }

    let indices: Vec<i64> = seq_lens
        .iter()
        .flat_map(|&len| std::iter::repeat((len - 1) as i64).take(hidden))
        .collect();
    let indices = Tensor::<B, 3, Int>::from_data(
        TensorData::new(indices, [batch, 1, hidden]),
        &all_hidden.device(),
    );
    Ok(all_hidden.gather(1, indices).reshape([batch, hidden]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seqgen::architectures::base::config::NormKind;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ctx() -> DeterministicRngContext<TestBackend> {
        DeterministicRngContext::new(5, Default::default())
    }

    #[test]
    fn test_gather_last_valid() {
        let device = Default::default();
        let all = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]], [[4.0, 4.0], [5.0, 5.0], [6.0, 6.0]]],
            &device,
        );
        let last = gather_last_valid(all, &[3, 1], 3).unwrap();
        assert_eq!(last.into_data().to_vec::<f32>().unwrap(), vec![3.0, 3.0, 4.0, 4.0]);
    }

    #[test]
    fn test_gru_latent_ignores_padding_after_length() {
        let config = ModelConfig {
            encoder_hidden: 4,
            encoder_num_layers: 2,
            ..ModelConfig::default()
        };
        let encoder = SequenceEncoder::new(&config, 3, &ctx(), 500).unwrap();
        let device = Default::default();

        let a = Tensor::<TestBackend, 3>::from_floats([[[0.1, 0.2, 0.3], [0.4, 0.5, 0.6], [0.0, 0.0, 0.0]]], &device);
        let b = Tensor::<TestBackend, 3>::from_floats([[[0.1, 0.2, 0.3], [0.4, 0.5, 0.6], [9.0, 9.0, 9.0]]], &device);

        let la = encoder.forward(a, &[2]).unwrap().into_data().to_vec::<f32>().unwrap();
        let lb = encoder.forward(b, &[2]).unwrap().into_data().to_vec::<f32>().unwrap();
        assert_eq!(la, lb);
        assert_eq!(la.len(), 4);
    }

    #[test]
    fn test_lstm_encoder_shape() {
        let config = ModelConfig {
            encoder: EncoderKind::Lstm,
            encoder_hidden: 5,
            post_encoder_norm: NormKind::LayerNorm,
            ..ModelConfig::default()
        };
        let encoder = SequenceEncoder::new(&config, 3, &ctx(), 500).unwrap();
        assert_eq!(encoder.lstm_layers.len(), 1);
        assert!(encoder.gru_layers.is_empty());

        let x = Tensor::<TestBackend, 3>::ones([2, 4, 3], &Default::default());
        let latent = encoder.forward(x, &[4, 2]).unwrap();
        assert_eq!(latent.dims(), [2, 5]);
    }

    #[test]
    fn test_transformer_encoder_shape() {
        let config = ModelConfig {
            encoder: EncoderKind::Transformer,
            encoder_hidden: 4,
            encoder_num_heads: 2,
            transformer_ff_dim: 8,
            ..ModelConfig::default()
        };
        let encoder = SequenceEncoder::new(&config, 3, &ctx(), 500).unwrap();
        assert!(encoder.transformer.is_some());

        let x = Tensor::<TestBackend, 3>::ones([2, 4, 3], &Default::default());
        assert_eq!(encoder.forward(x, &[4, 2]).unwrap().dims(), [2, 4]);
    }

    #[test]
    fn test_input_width_checked() {
        let encoder = SequenceEncoder::new(&ModelConfig::default(), 3, &ctx(), 500).unwrap();
        let x = Tensor::<TestBackend, 3>::ones([1, 2, 4], &Default::default());
        assert_eq!(
            encoder.forward(x, &[2]).unwrap_err(),
            ConfigError::width("encoder input", 3, 4)
        );
    }
}
