//! Multi-layer decoder built from [`GlobalGruCell`]s.

use burn::module::{Ignored, Module};
use burn::prelude::*;

use super::error::ConfigError;
use super::gru_cell::GlobalGruCell;
use super::rng::DeterministicRngContext;

/// Seed slots reserved per layer (three projections, rounded up)
const SEED_STRIDE_PER_LAYER: u64 = 10;

/// Stack of global-conditioned GRU cells unrolled over a whole sequence.
///
/// Every layer receives the same global context at every timestep. Within one
/// timestep layers run bottom to top: layer 0 reads the input, layer `l > 0`
/// reads the freshly updated state of layer `l - 1`.
#[derive(Module, Debug)]
pub struct DecoderGru<B: Backend> {
    pub cells: Vec<GlobalGruCell<B>>,
    input_size: Ignored<usize>,
    hidden_size: Ignored<usize>,
    global_hidden_size: Ignored<usize>,
}

impl<B: Backend> DecoderGru<B> {
    /// # Arguments
    /// * `rng_ctx` - The deterministic RNG context for parameter initialization
    /// * `init_seed_offset` - Layer `l` initialises from `init_seed_offset + 10 * l`
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        global_hidden_size: usize,
        num_layers: usize,
        bias: bool,
        rng_ctx: &DeterministicRngContext<B>,
        init_seed_offset: u64,
    ) -> Result<Self, ConfigError> {
        for (what, value) in [
            ("decoder input size", input_size),
            ("decoder hidden size", hidden_size),
            ("decoder global hidden size", global_hidden_size),
            ("decoder layers", num_layers),
        ] {
            if value == 0 {
                return Err(ConfigError::TooSmall {
                    what: what.to_string(),
                    min: 1,
                    actual: 0,
                });
            }
        }

        let cells = (0..num_layers)
            .map(|layer| {
                let layer_input = if layer == 0 { input_size } else { hidden_size };
                GlobalGruCell::new(
                    layer_input,
                    hidden_size,
                    global_hidden_size,
                    bias,
                    rng_ctx,
                    init_seed_offset + SEED_STRIDE_PER_LAYER * layer as u64,
                )
            })
            .collect();

        Ok(Self {
            cells,
            input_size: Ignored(input_size),
            hidden_size: Ignored(hidden_size),
            global_hidden_size: Ignored(global_hidden_size),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    pub fn hidden_size(&self) -> usize {
        *self.hidden_size
    }

    /// Unroll the stack.
    ///
    /// input shape: [batch, seq, input_size]
    /// global_context shape: [batch, global_hidden_size]
    /// initial_hidden shape: [num_layers, batch, hidden_size], zeros when `None`
    /// output shape: [batch, seq, hidden_size] (top layer at every timestep)
    pub fn forward(
        &self,
        input: Tensor<B, 3>,
        global_context: &Tensor<B, 2>,
        initial_hidden: Option<Tensor<B, 3>>,
    ) -> Result<Tensor<B, 3>, ConfigError> {
        let mut layers = self.unroll(input, global_context, initial_hidden, false)?;
        Ok(layers.pop().unwrap_or_else(|| unreachable!("decoder has at least one layer")))
    }

    /// Same unroll as [`forward`](Self::forward), returning every layer's output
    /// sequence, bottom layer first.
    pub fn forward_all_layers(
        &self,
        input: Tensor<B, 3>,
        global_context: &Tensor<B, 2>,
        initial_hidden: Option<Tensor<B, 3>>,
    ) -> Result<Vec<Tensor<B, 3>>, ConfigError> {
        self.unroll(input, global_context, initial_hidden, true)
    }

    fn unroll(
        &self,
        input: Tensor<B, 3>,
        global_context: &Tensor<B, 2>,
        initial_hidden: Option<Tensor<B, 3>>,
        keep_all_layers: bool,
    ) -> Result<Vec<Tensor<B, 3>>, ConfigError> {
        let [batch, seq_len, input_width] = input.dims();
        let num_layers = self.num_layers();
        let hidden_size = self.hidden_size();
        let device = input.device();

        if input_width != *self.input_size {
            return Err(ConfigError::width("decoder input", *self.input_size, input_width));
        }
        let global_dims = global_context.dims();
        if global_dims != [batch, *self.global_hidden_size] {
            return Err(ConfigError::shape(
                "decoder global context",
                &[batch, *self.global_hidden_size],
                &global_dims,
            ));
        }

        let mut hidden: Vec<Tensor<B, 2>> = match initial_hidden {
            Some(h0) => {
                let dims = h0.dims();
                if dims != [num_layers, batch, hidden_size] {
                    return Err(ConfigError::shape(
                        "decoder initial hidden state",
                        &[num_layers, batch, hidden_size],
                        &dims,
                    ));
                }
                (0..num_layers)
                    .map(|l| h0.clone().narrow(0, l, 1).reshape([batch, hidden_size]))
                    .collect()
            }
            None => (0..num_layers)
                .map(|_| Tensor::zeros([batch, hidden_size], &device))
                .collect(),
        };

        log::debug!(
            "Unrolling decoder: batch={}, seq={}, layers={}, hidden={}",
            batch,
            seq_len,
            num_layers,
            hidden_size
        );

        let tracked = if keep_all_layers { num_layers } else { 1 };
        let mut outs: Vec<Vec<Tensor<B, 2>>> = vec![Vec::with_capacity(seq_len); tracked];

        for t in 0..seq_len {
            let x_t = input.clone().narrow(1, t, 1).reshape([batch, input_width]);
            for layer in 0..num_layers {
                let cell_input = if layer == 0 {
                    x_t.clone()
                } else {
                    hidden[layer - 1].clone()
                };
                hidden[layer] =
                    self.cells[layer].forward(cell_input, global_context, Some(hidden[layer].clone()))?;
            }

            if keep_all_layers {
                for (layer, out) in outs.iter_mut().enumerate() {
                    out.push(hidden[layer].clone());
                }
            } else {
                outs[0].push(hidden[num_layers - 1].clone());
            }
        }

        Ok(outs
            .into_iter()
            .map(|steps| {
                if steps.is_empty() {
                    Tensor::zeros([batch, 0, hidden_size], &device)
                } else {
                    Tensor::stack(steps, 1)
                }
            })
            .collect())
    }
}
