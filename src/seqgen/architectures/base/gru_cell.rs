//! GRU cell conditioned on a sequence-level global context.
//!
//! Before the usual gated update, the previous hidden state is concatenated with
//! the global context and mixed through an affine map and GELU. The mixed state
//! then replaces the previous hidden state everywhere in the GRU equations:
//!
//! ```text
//! h_mix     = gelu(W_mix [g ; h_{t-1}] + b_mix)
//! r         = sigmoid(x_r + h_r)
//! z         = sigmoid(x_z + h_z)
//! n         = tanh(x_n + r * h_n)
//! h_t       = z * h_mix + (1 - z) * n
//! ```
//!
//! where `(x_r, x_z, x_n) = chunk3(W_x x + b_x)` and
//! `(h_r, h_z, h_n) = chunk3(W_h h_mix + b_h)`.

use burn::module::{Ignored, Module};
use burn::prelude::*;
use burn::tensor::activation;

use super::error::ConfigError;
use super::rng::{DeterministicLinear, DeterministicRngContext};

/// One recurrent cell of the global-conditioned decoder.
#[derive(Module, Debug)]
pub struct GlobalGruCell<B: Backend> {
    /// input -> 3 * hidden (reset, update, candidate)
    pub x2h: DeterministicLinear<B>,
    /// mixed hidden -> 3 * hidden (reset, update, candidate)
    pub h2h: DeterministicLinear<B>,
    /// [global ; hidden] -> hidden
    pub mix_global: DeterministicLinear<B>,
    input_size: Ignored<usize>,
    hidden_size: Ignored<usize>,
    global_hidden_size: Ignored<usize>,
}

impl<B: Backend> GlobalGruCell<B> {
    /// Create a cell with every weight and bias drawn from
    /// `U[-1/sqrt(hidden_size), 1/sqrt(hidden_size)]`.
    ///
    /// # Arguments
    /// * `rng_ctx` - The deterministic RNG context for parameter initialization
    /// * `init_seed_offset` - Seed offset; the three projections use `+0`, `+1`, `+2`
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        global_hidden_size: usize,
        bias: bool,
        rng_ctx: &DeterministicRngContext<B>,
        init_seed_offset: u64,
    ) -> Self {
        let bound = 1.0 / (hidden_size as f32).sqrt();

        let x2h = rng_ctx.create_uniform_linear(
            input_size,
            3 * hidden_size,
            bias,
            bound,
            init_seed_offset,
        );
        let h2h = rng_ctx.create_uniform_linear(
            hidden_size,
            3 * hidden_size,
            bias,
            bound,
            init_seed_offset + 1,
        );
        // The mixing projection always carries a bias.
        let mix_global = rng_ctx.create_uniform_linear(
            global_hidden_size + hidden_size,
            hidden_size,
            true,
            bound,
            init_seed_offset + 2,
        );

        Self {
            x2h,
            h2h,
            mix_global,
            input_size: Ignored(input_size),
            hidden_size: Ignored(hidden_size),
            global_hidden_size: Ignored(global_hidden_size),
        }
    }

    pub fn input_size(&self) -> usize {
        *self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        *self.hidden_size
    }

    pub fn global_hidden_size(&self) -> usize {
        *self.global_hidden_size
    }

    /// Advance one timestep.
    ///
    /// input shape: [batch, input_size]
    /// global_context shape: [batch, global_hidden_size]
    /// previous_hidden shape: [batch, hidden_size], zeros when `None`
    /// output shape: [batch, hidden_size]
    ///
    /// # Errors
    /// Any width or batch mismatch between the three inputs and the cell.
    pub fn forward(
        &self,
        input: Tensor<B, 2>,
        global_context: &Tensor<B, 2>,
        previous_hidden: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>, ConfigError> {
        let [batch, input_width] = input.dims();
        if input_width != self.input_size() {
            return Err(ConfigError::width("cell input", self.input_size(), input_width));
        }
        let global_dims = global_context.dims();
        if global_dims != [batch, self.global_hidden_size()] {
            return Err(ConfigError::shape(
                "cell global context",
                &[batch, self.global_hidden_size()],
                &global_dims,
            ));
        }
        let hx = match previous_hidden {
            Some(h) => {
                let dims = h.dims();
                if dims != [batch, self.hidden_size()] {
                    return Err(ConfigError::shape("cell hidden state", &[batch, self.hidden_size()], &dims));
                }
                h
            }
            None => Tensor::zeros([batch, self.hidden_size()], &input.device()),
        };

        let mixed = Tensor::cat(vec![global_context.clone(), hx], 1);
        let h_mix = activation::gelu(self.mix_global.forward(mixed));

        let x_t = self.x2h.forward(input);
        let h_t = self.h2h.forward(h_mix.clone());

        let hidden = self.hidden_size();
        let gate = |t: &Tensor<B, 2>, i: usize| t.clone().narrow(1, i * hidden, hidden);
        let (x_reset, x_update, x_new) = (gate(&x_t, 0), gate(&x_t, 1), gate(&x_t, 2));
        let (h_reset, h_update, h_new) = (gate(&h_t, 0), gate(&h_t, 1), gate(&h_t, 2));

        let reset_gate = activation::sigmoid(x_reset + h_reset);
        let update_gate = activation::sigmoid(x_update + h_update);
        let new_gate = (x_new + reset_gate * h_new).tanh();

        Ok(update_gate.clone() * h_mix + (update_gate.neg() + 1.0) * new_gate)
    }
}
