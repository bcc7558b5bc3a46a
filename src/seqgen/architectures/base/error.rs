//! Error types for model construction, configuration loading and loss evaluation.

use thiserror::Error;

/// Configuration errors: raised at construction or first use, never coerced.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("width mismatch for {what}: expected {expected}, got {actual}")]
    WidthMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("feature `{0}` is configured but missing from the batch")]
    MissingFeature(String),

    #[error("feature `{name}` has invalid vocabulary size {max_value} (need at least 2 classes)")]
    EmptyVocabulary { name: String, max_value: usize },

    #[error("feature `{0}` is declared more than once")]
    DuplicateFeature(String),

    #[error("{what} must be at least {min}, got {actual}")]
    TooSmall {
        what: String,
        min: usize,
        actual: usize,
    },

    #[error("categorical block for `{name}` ({start}..{end}) lies outside the categorical region 0..{region}")]
    BlockOutOfRange {
        name: String,
        start: usize,
        end: usize,
        region: usize,
    },

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid time range: max_time ({max_time}) must be greater than min_time ({min_time})")]
    InvalidTimeRange { min_time: f32, max_time: f32 },

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn width(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::WidthMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    pub fn shape(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum SeqGenError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to parse configuration file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

pub type Result<T, E = SeqGenError> = std::result::Result<T, E>;
