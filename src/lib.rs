//! seq-gen-rs: generative models over variable-length event sequences.
//!
//! The core pieces are the global-conditioned GRU decoder
//! ([`GlobalGruCell`], [`DecoderGru`]) and the masked multi-head reconstruction
//! loss ([`ReconstructionLoss`]). [`SeqGen`] wires them together with a feature
//! processor, a sequence encoder and per-feature classification heads.

pub mod seqgen;

pub use seqgen::architectures::base::batch::PaddedBatch;
pub use seqgen::architectures::base::config::{DataConfig, ModelConfig};
pub use seqgen::architectures::base::decoder::DecoderGru;
pub use seqgen::architectures::base::error::{ConfigError, Result, SeqGenError};
pub use seqgen::architectures::base::gru_cell::GlobalGruCell;
pub use seqgen::architectures::base::loss::{LossBreakdown, LossOutput, ReconstructionLoss};
pub use seqgen::architectures::base::model::{SeqGen, SeqGenOutput};
pub use seqgen::settings::{settings, Settings};

/// Seeded synthetic batches for tests, benchmarks and the demo binary
pub mod test_utils;
