//! Base architecture modules

pub mod batch;
pub mod config;
pub mod decoder;
pub mod embedding_predictor;
pub mod encoder;
pub mod error;
pub mod gru_cell;
pub mod loss;
pub mod loss_utils;
pub mod model;
pub mod norm;
pub mod processor;
pub mod rng;
