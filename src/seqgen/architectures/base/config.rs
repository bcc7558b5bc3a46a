//! Model and data configuration.
//!
//! Layer families, normalisations and the decoder type are closed enums resolved
//! when the configuration is parsed. Nothing is looked up by name at model
//! construction time.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;

use super::error::{ConfigError, Result};

/// Sequence encoder family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderKind {
    #[serde(rename = "GRU", alias = "gru")]
    Gru,
    #[serde(rename = "LSTM", alias = "lstm")]
    Lstm,
    #[serde(rename = "TR", alias = "transformer")]
    Transformer,
}

impl Default for EncoderKind {
    fn default() -> Self {
        Self::Gru
    }
}

/// Sequence decoder family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoderKind {
    #[serde(rename = "GRU", alias = "gru")]
    Gru,
    #[serde(rename = "TR", alias = "transformer")]
    Transformer,
}

impl Default for DecoderKind {
    fn default() -> Self {
        Self::Gru
    }
}

/// Normalisation applied around the encoder and decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    Identity,
    LayerNorm,
}

impl Default for NormKind {
    fn default() -> Self {
        Self::Identity
    }
}

/// Configuration for the generative model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Width of the embedding applied to every categorical feature
    #[serde(default = "default_emb_dim")]
    pub features_emb_dim: usize,

    // ------ Encoder
    #[serde(default)]
    pub encoder: EncoderKind,
    #[serde(default = "default_hidden")]
    pub encoder_hidden: usize,
    #[serde(default = "default_one")]
    pub encoder_num_layers: usize,
    /// Only used by the transformer encoder
    #[serde(default = "default_one")]
    pub encoder_num_heads: usize,

    // ------ Decoder
    #[serde(default)]
    pub decoder: DecoderKind,
    #[serde(default = "default_hidden")]
    pub decoder_hidden: usize,
    #[serde(default = "default_one")]
    pub decoder_num_layers: usize,
    /// Only used by the transformer decoder
    #[serde(default = "default_one")]
    pub decoder_heads: usize,

    /// Feed-forward width inside transformer layers
    #[serde(default = "default_ff_dim")]
    pub transformer_ff_dim: usize,

    // ------ Normalisations
    #[serde(default)]
    pub pre_encoder_norm: NormKind,
    #[serde(default)]
    pub post_encoder_norm: NormKind,
    #[serde(default)]
    pub decoder_norm: NormKind,
    #[serde(default)]
    pub encoder_norm: NormKind,

    /// Dropout applied to the global latent
    #[serde(default = "default_dropout")]
    pub after_enc_dropout: f64,

    // ------ Time
    /// Append the inter-event delta as an extra input channel and predict it
    #[serde(default = "default_true")]
    pub use_deltas: bool,
    #[serde(default = "default_delta_weight")]
    pub delta_weight: f32,

    // ------ Loss
    #[serde(default = "default_weight")]
    pub mse_weight: f32,
    #[serde(rename = "CE_weight", alias = "ce_weight", default = "default_weight")]
    pub ce_weight: f32,

    /// Base seed for deterministic parameter initialisation
    #[serde(default)]
    pub seed: u64,
}

fn default_emb_dim() -> usize { 8 }
fn default_hidden() -> usize { 3 }
fn default_one() -> usize { 1 }
fn default_ff_dim() -> usize { 2048 }
fn default_dropout() -> f64 { 0.05 }
fn default_true() -> bool { true }
fn default_delta_weight() -> f32 { 5.0 }
fn default_weight() -> f32 { 1.0 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            features_emb_dim: default_emb_dim(),
            encoder: EncoderKind::default(),
            encoder_hidden: default_hidden(),
            encoder_num_layers: default_one(),
            encoder_num_heads: default_one(),
            decoder: DecoderKind::default(),
            decoder_hidden: default_hidden(),
            decoder_num_layers: default_one(),
            decoder_heads: default_one(),
            transformer_ff_dim: default_ff_dim(),
            pre_encoder_norm: NormKind::default(),
            post_encoder_norm: NormKind::default(),
            decoder_norm: NormKind::default(),
            encoder_norm: NormKind::default(),
            after_enc_dropout: default_dropout(),
            use_deltas: default_true(),
            delta_weight: default_delta_weight(),
            mse_weight: default_weight(),
            ce_weight: default_weight(),
            seed: 0,
        }
    }
}

impl ModelConfig {
    /// Generative GRU/GRU setup used for the transaction datasets.
    pub fn rosbank() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate_consistent()?;
        Ok(config)
    }

    /// Validate consistency of configuration
    pub fn validate_consistent(&self) -> Result<(), ConfigError> {
        let positive = [
            ("features_emb_dim", self.features_emb_dim),
            ("encoder_hidden", self.encoder_hidden),
            ("encoder_num_layers", self.encoder_num_layers),
            ("decoder_hidden", self.decoder_hidden),
            ("decoder_num_layers", self.decoder_num_layers),
        ];
        for (what, value) in positive {
            if value == 0 {
                return Err(ConfigError::TooSmall {
                    what: what.to_string(),
                    min: 1,
                    actual: value,
                });
            }
        }

        if self.encoder == EncoderKind::Transformer
            && (self.encoder_num_heads == 0 || self.encoder_hidden % self.encoder_num_heads != 0)
        {
            return Err(ConfigError::Invalid(format!(
                "encoder_hidden ({}) must be divisible by encoder_num_heads ({})",
                self.encoder_hidden, self.encoder_num_heads
            )));
        }
        if self.decoder == DecoderKind::Transformer
            && (self.decoder_heads == 0 || self.decoder_hidden % self.decoder_heads != 0)
        {
            return Err(ConfigError::Invalid(format!(
                "decoder_hidden ({}) must be divisible by decoder_heads ({})",
                self.decoder_hidden, self.decoder_heads
            )));
        }
        // The transformer decoder attends over the latent as memory.
        if self.decoder == DecoderKind::Transformer && self.decoder_hidden != self.encoder_hidden {
            return Err(ConfigError::width(
                "transformer decoder memory (encoder_hidden)",
                self.decoder_hidden,
                self.encoder_hidden,
            ));
        }
        if !(0.0..1.0).contains(&self.after_enc_dropout) {
            return Err(ConfigError::Invalid(format!(
                "after_enc_dropout must be in [0, 1), got {}",
                self.after_enc_dropout
            )));
        }
        Ok(())
    }
}

/// One categorical feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingFeature {
    pub name: String,
    /// Ids above this value are clipped at the input
    #[serde(rename = "in")]
    pub in_size: usize,
    /// Vocabulary size of the embedding table and of the reconstruction head
    pub max_value: usize,
}

impl EmbeddingFeature {
    pub fn new(name: impl Into<String>, in_size: usize, max_value: usize) -> Self {
        Self {
            name: name.into(),
            in_size,
            max_value,
        }
    }
}

/// Which columns of a batch are categorical, which are numeric, and how time is scaled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Categorical features, in the order their blocks appear in the predicted vector
    #[serde(default)]
    pub embeddings: Vec<EmbeddingFeature>,
    /// Numeric features, in the order their columns appear in the predicted vector
    #[serde(default)]
    pub numeric_values: Vec<String>,
    #[serde(default)]
    pub min_time: f32,
    #[serde(default = "default_max_time")]
    pub max_time: f32,
}

fn default_max_time() -> f32 { 1.0 }

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            embeddings: Vec::new(),
            numeric_values: Vec::new(),
            min_time: 0.0,
            max_time: default_max_time(),
        }
    }
}

impl DataConfig {
    /// Age-group transactions: one categorical MCC-group feature and the amount.
    pub fn age() -> Self {
        Self {
            embeddings: vec![EmbeddingFeature::new("small_group", 202, 203)],
            numeric_values: vec!["amount_rur".to_string()],
            min_time: 0.0,
            max_time: 729.0,
        }
    }

    /// ICU time series: three categorical descriptors and 38 vitals/labs.
    pub fn physionet() -> Self {
        let numeric = [
            "Age", "Height", "Weight", "Albumin", "ALP", "ALT", "AST", "Bilirubin", "BUN",
            "Cholesterol", "Creatinine", "DiasABP", "FiO2", "GCS", "Glucose", "HCO3", "HCT",
            "HR", "K", "Lactate", "Mg", "MAP", "Na", "NIDiasABP", "NIMAP", "NISysABP",
            "PaCO2", "PaO2", "pH", "Platelets", "RespRate", "SaO2", "SysABP", "Temp",
            "TroponinI", "TroponinT", "Urine", "WBC",
        ];
        Self {
            embeddings: vec![
                EmbeddingFeature::new("Gender", 3, 4),
                EmbeddingFeature::new("ICUType", 5, 5),
                EmbeddingFeature::new("MechVent", 2, 4),
            ],
            numeric_values: numeric.iter().map(|s| s.to_string()).collect(),
            min_time: 0.0,
            max_time: 1.0,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate_consistent()?;
        Ok(config)
    }

    pub fn embedding_names(&self) -> impl Iterator<Item = &str> {
        self.embeddings.iter().map(|e| e.name.as_str())
    }

    pub fn is_categorical(&self, name: &str) -> bool {
        self.embeddings.iter().any(|e| e.name == name)
    }

    /// Validate consistency of configuration
    pub fn validate_consistent(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for name in self.embedding_names().chain(self.numeric_values.iter().map(String::as_str)) {
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateFeature(name.to_string()));
            }
        }
        for feature in &self.embeddings {
            if feature.max_value < 2 {
                return Err(ConfigError::EmptyVocabulary {
                    name: feature.name.clone(),
                    max_value: feature.max_value,
                });
            }
        }
        if self.max_time <= self.min_time {
            return Err(ConfigError::InvalidTimeRange {
                min_time: self.min_time,
                max_time: self.max_time,
            });
        }
        Ok(())
    }
}

/// Column map of the predicted feature vector.
///
/// `[cat_0 | cat_1 | ... | cat_{n-1} | num_0 | ... | num_{m-1} | delta?]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureLayout {
    pub emb_dim: usize,
    /// One block per categorical feature, in configuration order
    pub categorical: Vec<(String, Range<usize>)>,
    pub numeric: Vec<String>,
    pub use_deltas: bool,
}

impl FeatureLayout {
    pub fn new(model: &ModelConfig, data: &DataConfig) -> Result<Self, ConfigError> {
        model.validate_consistent()?;
        data.validate_consistent()?;

        let emb_dim = model.features_emb_dim;
        let categorical: Vec<(String, Range<usize>)> = data
            .embeddings
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i * emb_dim..(i + 1) * emb_dim))
            .collect();

        let layout = Self {
            emb_dim,
            categorical,
            numeric: data.numeric_values.clone(),
            use_deltas: model.use_deltas,
        };
        layout.check_blocks()?;
        Ok(layout)
    }

    fn check_blocks(&self) -> Result<(), ConfigError> {
        let region = self.categorical_len();
        for (name, block) in &self.categorical {
            if block.end > region || block.len() != self.emb_dim {
                return Err(ConfigError::BlockOutOfRange {
                    name: name.clone(),
                    start: block.start,
                    end: block.end,
                    region,
                });
            }
        }
        Ok(())
    }

    pub fn num_categorical(&self) -> usize {
        self.categorical.len()
    }

    pub fn num_numeric(&self) -> usize {
        self.numeric.len()
    }

    /// Width of the categorical region
    pub fn categorical_len(&self) -> usize {
        self.num_categorical() * self.emb_dim
    }

    /// Width of the processed features before the optional delta channel
    pub fn feature_width(&self) -> usize {
        self.categorical_len() + self.num_numeric()
    }

    /// Width of the model input and of the predicted vector
    pub fn input_dim(&self) -> usize {
        self.feature_width() + usize::from(self.use_deltas)
    }

    /// Trailing delta column, if deltas are predicted
    pub fn delta_column(&self) -> Option<usize> {
        self.use_deltas.then(|| self.feature_width())
    }

    pub fn block(&self, name: &str) -> Option<Range<usize>> {
        self.categorical
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r.clone())
    }
}
