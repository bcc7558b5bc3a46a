//! Model architectures

pub mod base;
