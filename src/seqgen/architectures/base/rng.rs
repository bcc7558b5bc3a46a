//! Deterministic parameter initialisation.
//!
//! Every learnable tensor in the crate is drawn from a `StdRng` seeded from
//! `DeterministicRngContext::seed` plus a fixed offset, so two models built from
//! the same configuration hold bit-identical weights.
//!
//! SEED OFFSET POLICY:
//! - each model component draws from its own series, a context forked at
//!   `series * SEED_SERIES_WIDTH` (see `model.rs`)
//! - inside a series, offsets are local: decoder cell `l` uses `+10·l` (one slot
//!   per projection), feature `i` uses `+i`, encoder layer `l` uses `+10·l`
//! - no component uses more than `SEED_SERIES_WIDTH` local offsets, so series
//!   never overlap

use burn::{
    module::{Module, Param},
    tensor::{backend::Backend, Int, Tensor},
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Linear layer holding pre-initialised weights.
///
/// Weight layout is `[output_dim, input_dim]`, matching the layout used by
/// reference checkpoints so fixtures can be loaded without transposing.
#[derive(Module, Debug)]
pub struct DeterministicLinear<B: Backend> {
    /// Weight matrix of shape [output_dim, input_dim]
    pub weight: Param<Tensor<B, 2>>,
    /// Optional bias vector of shape [output_dim]
    pub bias: Option<Param<Tensor<B, 1>>>,
}

impl<B: Backend> DeterministicLinear<B> {
    pub fn new(weight: Tensor<B, 2>, bias: Option<Tensor<B, 1>>) -> Self {
        Self {
            weight: Param::from_tensor(weight),
            bias: bias.map(Param::from_tensor),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.val().dims()[1]
    }

    pub fn output_dim(&self) -> usize {
        self.weight.val().dims()[0]
    }

    /// Forward pass through the linear layer
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let output = input.matmul(self.weight.val().transpose());
        match &self.bias {
            Some(bias) => output.add(bias.val().unsqueeze()),
            None => output,
        }
    }

    /// Applies the layer to the last dimension of a `[batch, seq, input_dim]` tensor
    pub fn forward_3d(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq, input_dim] = input.dims();
        let output = self.forward(input.reshape([batch * seq, input_dim]));
        output.reshape([batch, seq, self.output_dim()])
    }
}

/// Embedding table holding pre-initialised weights
#[derive(Module, Debug)]
pub struct DeterministicEmbedding<B: Backend> {
    /// Embedding weight matrix of shape [vocab_size, embedding_dim]
    pub weight: Param<Tensor<B, 2>>,
}

impl<B: Backend> DeterministicEmbedding<B> {
    pub fn new(weight: Tensor<B, 2>) -> Self {
        Self {
            weight: Param::from_tensor(weight),
        }
    }

    /// `[batch, seq]` ids to `[batch, seq, embedding_dim]` vectors
    pub fn forward_2d(&self, indices: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch, seq] = indices.dims();
        let embedding_dim = self.weight.val().dims()[1];

        if batch == 0 || seq == 0 {
            return Tensor::zeros([batch, seq, embedding_dim], &self.weight.device());
        }

        let flat = indices.reshape([batch * seq]);
        self.weight
            .val()
            .select(0, flat)
            .reshape([batch, seq, embedding_dim])
    }
}

/// Seeded source of initial parameter values
#[derive(Debug, Clone)]
pub struct DeterministicRngContext<B: Backend> {
    pub seed: u64,
    device: B::Device,
}

impl<B: Backend> DeterministicRngContext<B> {
    pub fn new(seed: u64, device: B::Device) -> Self {
        Self { seed, device }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Context for one seed series: `seed + offset`, wrapping.
    pub fn fork(&self, offset: u64) -> Self {
        Self::new(self.seed.wrapping_add(offset), self.device.clone())
    }

    fn rng(&self, offset: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed.wrapping_add(offset))
    }

    /// Linear layer with weights (and bias) drawn from `U[-bound, bound]`.
    pub fn create_uniform_linear(
        &self,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        bound: f32,
        offset: u64,
    ) -> DeterministicLinear<B> {
        let mut rng = self.rng(offset);
        let weight = self.generate_uniform_tensor([output_dim, input_dim], &mut rng, bound);
        let bias = bias.then(|| self.generate_uniform_tensor([output_dim], &mut rng, bound));
        DeterministicLinear::new(weight, bias)
    }

    /// Linear layer using the usual `1/sqrt(fan_in)` uniform bound.
    pub fn create_linear(
        &self,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        offset: u64,
    ) -> DeterministicLinear<B> {
        let bound = 1.0 / (input_dim.max(1) as f32).sqrt();
        self.create_uniform_linear(input_dim, output_dim, bias, bound, offset)
    }

    /// Embedding table drawn from `N(0, 1)`.
    pub fn create_embedding(
        &self,
        vocab_size: usize,
        embedding_dim: usize,
        offset: u64,
    ) -> DeterministicEmbedding<B> {
        let mut rng = self.rng(offset);
        let weight = self.generate_normal_tensor([vocab_size, embedding_dim], &mut rng, 0.0, 1.0);
        DeterministicEmbedding::new(weight)
    }

    /// Uniform f32 tensor in `[-bound, bound)` drawn from the provided rng
    pub fn generate_uniform_tensor<const D: usize>(
        &self,
        shape: [usize; D],
        rng: &mut StdRng,
        bound: f32,
    ) -> Tensor<B, D> {
        let total_elements: usize = shape.iter().product();
        let data: Vec<f32> = (0..total_elements)
            .map(|_| (rng.r#gen::<f32>() * 2.0 - 1.0) * bound)
            .collect();

        Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape(shape)
    }

    /// Normal f32 tensor drawn from the provided rng
    pub fn generate_normal_tensor<const D: usize>(
        &self,
        shape: [usize; D],
        rng: &mut StdRng,
        mean: f32,
        std: f32,
    ) -> Tensor<B, D> {
        let total_elements: usize = shape.iter().product();
        let data: Vec<f32> = (0..total_elements)
            .map(|_| {
                let z: f32 = StandardNormal.sample(rng);
                mean + std * z
            })
            .collect();

        Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape(shape)
    }
}
