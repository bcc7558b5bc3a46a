//! End-to-end generative model over event sequences.

use burn::module::{Ignored, Module};
use burn::nn::attention::generate_autoregressive_mask;
use burn::nn::transformer::{TransformerDecoder, TransformerDecoderConfig, TransformerDecoderInput};
use burn::nn::{Dropout, DropoutConfig, LayerNorm};
use burn::prelude::*;
use std::collections::BTreeMap;

use super::batch::PaddedBatch;
use super::config::{DataConfig, DecoderKind, FeatureLayout, ModelConfig};
use super::decoder::DecoderGru;
use super::embedding_predictor::EmbeddingPredictor;
use super::encoder::SequenceEncoder;
use super::error::ConfigError;
use super::loss::{LossOutput, ReconstructionLoss};
use super::norm::{apply_norm, build_norm};
use super::processor::FeatureProcessor;
use super::rng::{DeterministicLinear, DeterministicRngContext};

/// Local seed offsets available to one component.
pub const SEED_SERIES_WIDTH: u64 = 1 << 32;

pub const DECODER_SEED_SERIES: u64 = 1;
pub const EMBEDDING_SEED_SERIES: u64 = 2;
pub const PREDICTOR_SEED_SERIES: u64 = 3;
pub const OUT_PROJ_SEED_SERIES: u64 = 4;
pub const DECODER_PROJ_SEED_SERIES: u64 = 5;
pub const ENCODER_SEED_SERIES: u64 = 6;

/// Context reserved for one component; its local offsets start at zero.
pub fn component_rng<B: Backend>(rng_ctx: &DeterministicRngContext<B>, series: u64) -> DeterministicRngContext<B> {
    rng_ctx.fork(series.wrapping_mul(SEED_SERIES_WIDTH))
}

/// Input projection followed by a causal stock transformer decoder attending
/// to the global latent as a one-token memory.
#[derive(Module, Debug)]
pub struct TransformerDecoderBlock<B: Backend> {
    pub proj: DeterministicLinear<B>,
    pub decoder: TransformerDecoder<B>,
    pub norm: Option<LayerNorm<B>>,
}

impl<B: Backend> TransformerDecoderBlock<B> {
    /// x shape: [batch, seq, input_dim], latent shape: [batch, decoder_hidden]
    pub fn forward(&self, x: Tensor<B, 3>, latent: &Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, seq_len, _] = x.dims();
        let target = self.proj.forward_3d(x);
        let mask = generate_autoregressive_mask::<B>(batch, seq_len, &target.device());
        let memory = latent.clone().unsqueeze_dim::<3>(1);

        let decoded = self
            .decoder
            .forward(TransformerDecoderInput::new(target, memory).target_mask_attn(mask));
        apply_norm(&self.norm, decoded)
    }
}

/// Everything a training step needs from one forward pass.
#[derive(Debug, Clone)]
pub struct SeqGenOutput<B: Backend> {
    /// Model input, delta channel included: [batch, seq, input_dim]
    pub x: Tensor<B, 3>,
    /// Normalised time axis: [batch, seq]
    pub time_steps: Tensor<B, 2>,
    /// Next-step prediction: [batch, seq - 1, input_dim]
    pub pred: Tensor<B, 3>,
    /// Per-feature logits: [batch, seq - 1, max_value]
    pub emb_dist: BTreeMap<String, Tensor<B, 3>>,
    /// Global latent after dropout: [batch, encoder_hidden]
    pub latent: Tensor<B, 2>,
}

#[derive(Module, Debug)]
pub struct SeqGen<B: Backend> {
    pub processor: FeatureProcessor<B>,
    pub encoder: SequenceEncoder<B>,
    pub gru_decoder: Option<DecoderGru<B>>,
    pub transformer_decoder: Option<TransformerDecoderBlock<B>>,
    pub global_dropout: Dropout,
    pub out_proj: DeterministicLinear<B>,
    pub embedding_predictor: EmbeddingPredictor<B>,
    criterion: Ignored<ReconstructionLoss>,
    data: Ignored<DataConfig>,
}

impl<B: Backend> SeqGen<B> {
    pub fn new(model: &ModelConfig, data: &DataConfig, device: &B::Device) -> Result<Self, ConfigError> {
        let layout = FeatureLayout::new(model, data)?;
        let rng_ctx = DeterministicRngContext::<B>::new(model.seed, device.clone());
        let input_dim = layout.input_dim();

        let processor = FeatureProcessor::new(&layout, data, &component_rng(&rng_ctx, EMBEDDING_SEED_SERIES), 0)?;
        let encoder = SequenceEncoder::new(model, input_dim, &component_rng(&rng_ctx, ENCODER_SEED_SERIES), 0)?;

        let (gru_decoder, transformer_decoder) = match model.decoder {
            DecoderKind::Gru => {
                let decoder = DecoderGru::new(
                    input_dim,
                    model.decoder_hidden,
                    model.encoder_hidden,
                    model.decoder_num_layers,
                    true,
                    &component_rng(&rng_ctx, DECODER_SEED_SERIES),
                    0,
                )?;
                (Some(decoder), None)
            }
            DecoderKind::Transformer => {
                let block = TransformerDecoderBlock {
                    proj: component_rng(&rng_ctx, DECODER_PROJ_SEED_SERIES).create_linear(
                        input_dim,
                        model.decoder_hidden,
                        true,
                        0,
                    ),
                    decoder: TransformerDecoderConfig::new(
                        model.decoder_hidden,
                        model.transformer_ff_dim,
                        model.decoder_heads,
                        model.decoder_num_layers,
                    )
                    .init(device),
                    norm: build_norm(model.decoder_norm, model.decoder_hidden, device),
                };
                (None, Some(block))
            }
        };

        let out_proj =
            component_rng(&rng_ctx, OUT_PROJ_SEED_SERIES).create_linear(model.decoder_hidden, input_dim, true, 0);
        let embedding_predictor = EmbeddingPredictor::new(&layout, data, &component_rng(&rng_ctx, PREDICTOR_SEED_SERIES), 0)?;
        let criterion = ReconstructionLoss::new(model, layout)?;

        let seq_gen = Self {
            processor,
            encoder,
            gru_decoder,
            transformer_decoder,
            global_dropout: DropoutConfig::new(model.after_enc_dropout).init(),
            out_proj,
            embedding_predictor,
            criterion: Ignored(criterion),
            data: Ignored(data.clone()),
        };

        log::info!(
            "SeqGen: encoder={:?}, decoder={:?}, input_dim={}, parameters={}",
            model.encoder,
            model.decoder,
            input_dim,
            seq_gen.num_params()
        );
        Ok(seq_gen)
    }

    pub fn layout(&self) -> &FeatureLayout {
        self.criterion.layout()
    }

    pub fn input_dim(&self) -> usize {
        self.layout().input_dim()
    }

    /// Append `[diff(t), 0]` as the trailing input channel.
    fn with_delta_channel(&self, x: Tensor<B, 3>, time_steps: &Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, seq_len] = time_steps.dims();
        let next = time_steps.clone().narrow(1, 1, seq_len - 1);
        let prev = time_steps.clone().narrow(1, 0, seq_len - 1);
        let delta = Tensor::cat(vec![next - prev, Tensor::zeros([batch, 1], &x.device())], 1);
        Tensor::cat(vec![x, delta.unsqueeze_dim::<3>(2)], 2)
    }

    pub fn forward(&self, batch: &PaddedBatch<B>) -> Result<SeqGenOutput<B>, ConfigError> {
        batch.validate(&self.data)?;
        let [_, seq_len] = batch.dims();
        if seq_len < 2 {
            return Err(ConfigError::TooSmall {
                what: "padded sequence length".to_string(),
                min: 2,
                actual: seq_len,
            });
        }

        let (features, time_steps) = self.processor.forward(batch)?;
        let x = if self.layout().use_deltas {
            self.with_delta_channel(features, &time_steps)
        } else {
            features
        };

        let latent = self.encoder.forward(x.clone(), &batch.seq_lens)?;
        let latent = self.global_dropout.forward(latent);

        let dec_out = match (&self.gru_decoder, &self.transformer_decoder) {
            (Some(decoder), _) => decoder.forward(x.clone(), &latent, None)?,
            (None, Some(decoder)) => decoder.forward(x.clone(), &latent),
            (None, None) => return Err(ConfigError::Invalid("model has no decoder".to_string())),
        };

        let pred = self.out_proj.forward_3d(dec_out).narrow(1, 0, seq_len - 1);
        let emb_dist = self.embedding_predictor.forward(pred.clone())?;

        Ok(SeqGenOutput {
            x,
            time_steps,
            pred,
            emb_dist,
            latent,
        })
    }

    pub fn loss(&self, output: &SeqGenOutput<B>, batch: &PaddedBatch<B>) -> Result<LossOutput<B>, ConfigError> {
        self.criterion.compute(
            &self.embedding_predictor,
            output.pred.clone(),
            &output.emb_dist,
            batch,
            &output.time_steps,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seqgen::architectures::base::config::{EmbeddingFeature, EncoderKind};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn data() -> DataConfig {
        DataConfig {
            embeddings: vec![EmbeddingFeature::new("mcc", 3, 4)],
            numeric_values: vec!["amount".to_string()],
            min_time: 0.0,
            max_time: 10.0,
        }
    }

    fn batch() -> PaddedBatch<TestBackend> {
        let device = Default::default();
        PaddedBatch::new(
            Tensor::from_floats([[0.0, 1.0, 2.0, 4.0], [0.0, 3.0, -1.0, -1.0]], &device),
            vec![4, 2],
        )
        .with_categorical("mcc", Tensor::from_ints([[1, 2, 3, 1], [2, 2, 0, 0]], &device))
        .with_numeric("amount", Tensor::from_floats([[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 0.0, 0.0]], &device))
    }

    #[test]
    fn test_forward_shapes() {
        let config = ModelConfig {
            features_emb_dim: 2,
            ..ModelConfig::default()
        };
        let model = SeqGen::<TestBackend>::new(&config, &data(), &Default::default()).unwrap();
        let out = model.forward(&batch()).unwrap();

        assert_eq!(model.input_dim(), 4);
        assert_eq!(out.x.dims(), [2, 4, 4]);
        assert_eq!(out.pred.dims(), [2, 3, 4]);
        assert_eq!(out.emb_dist["mcc"].dims(), [2, 3, 4]);
        assert_eq!(out.latent.dims(), [2, 3]);
    }

    #[test]
    fn test_delta_channel() {
        let config = ModelConfig {
            features_emb_dim: 2,
            ..ModelConfig::default()
        };
        let model = SeqGen::<TestBackend>::new(&config, &data(), &Default::default()).unwrap();
        let out = model.forward(&batch()).unwrap();

        let delta = out.x.narrow(2, 3, 1).into_data().to_vec::<f32>().unwrap();
        let expected = [0.1, 0.1, 0.2, 0.0, 0.3, -1.3, 0.0, 0.0];
        for (got, want) in delta.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{delta:?}");
        }
    }

    #[test]
    fn test_transformer_decoder_model() {
        let config = ModelConfig {
            features_emb_dim: 2,
            encoder: EncoderKind::Transformer,
            decoder: DecoderKind::Transformer,
            encoder_hidden: 4,
            decoder_hidden: 4,
            encoder_num_heads: 2,
            decoder_heads: 2,
            transformer_ff_dim: 8,
            ..ModelConfig::default()
        };
        let model = SeqGen::<TestBackend>::new(&config, &data(), &Default::default()).unwrap();
        assert!(model.gru_decoder.is_none());

        let b = batch();
        let out = model.forward(&b).unwrap();
        assert_eq!(out.pred.dims(), [2, 3, 4]);
        let loss = model.loss(&out, &b).unwrap();
        assert!(loss.breakdown.total_loss().is_finite());
    }

    #[test]
    fn test_single_step_batch_rejected() {
        let model = SeqGen::<TestBackend>::new(&ModelConfig::default(), &data(), &Default::default()).unwrap();
        let device = Default::default();
        let b = PaddedBatch::new(Tensor::from_floats([[0.0]], &device), vec![1])
            .with_categorical("mcc", Tensor::from_ints([[1]], &device))
            .with_numeric("amount", Tensor::from_floats([[1.0]], &device));
        assert!(matches!(model.forward(&b), Err(ConfigError::TooSmall { .. })));
    }

    #[test]
    fn test_component_seed_series_do_not_overlap() {
        let ctx = DeterministicRngContext::<TestBackend>::new(u64::MAX - 3, Default::default());
        let seeds: Vec<u64> = [
            DECODER_SEED_SERIES,
            EMBEDDING_SEED_SERIES,
            PREDICTOR_SEED_SERIES,
            OUT_PROJ_SEED_SERIES,
            DECODER_PROJ_SEED_SERIES,
            ENCODER_SEED_SERIES,
        ]
        .iter()
        .map(|series| component_rng(&ctx, *series).seed)
        .collect();

        for (i, a) in seeds.iter().enumerate() {
            for b in &seeds[i + 1..] {
                assert!(b.wrapping_sub(*a) >= SEED_SERIES_WIDTH);
                assert!(a.wrapping_sub(*b) >= SEED_SERIES_WIDTH);
            }
        }

        // Decoder layer 10 and the 102nd predictor head stay inside their own series.
        let decoder = component_rng(&ctx, DECODER_SEED_SERIES);
        let embeddings = component_rng(&ctx, EMBEDDING_SEED_SERIES);
        let heads = component_rng(&ctx, PREDICTOR_SEED_SERIES);
        assert_ne!(decoder.seed.wrapping_add(100), embeddings.seed);
        assert_ne!(heads.seed.wrapping_add(101), component_rng(&ctx, DECODER_PROJ_SEED_SERIES).seed);
    }

    #[test]
    fn test_deep_decoder_builds_and_runs() {
        let config = ModelConfig {
            features_emb_dim: 2,
            decoder_num_layers: 11,
            ..ModelConfig::default()
        };
        let model = SeqGen::<TestBackend>::new(&config, &data(), &Default::default()).unwrap();
        let decoder = model.gru_decoder.as_ref().unwrap();
        assert_eq!(decoder.num_layers(), 11);

        assert!(model.forward(&batch()).is_ok());
    }
}
