//! Event-sequence generative model components

pub mod architectures;
pub mod settings;
