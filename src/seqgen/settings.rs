//! Runtime settings for the seq-gen binary and test harness.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default `env_logger` filter; `RUST_LOG` still takes precedence.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Base seed for parameter initialisation, overrides the model file's seed
    pub seed: Option<u64>,

    /// JSON file holding a `ModelConfig`; the built-in preset is used when unset
    pub model_config_path: Option<PathBuf>,

    /// JSON file holding a `DataConfig`; the built-in preset is used when unset
    pub data_config_path: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            seed: None,
            model_config_path: None,
            data_config_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestingSettings {
    /// Run the full-size preset checks (`SEQGEN__TESTING__RUN_SLOW_TESTS=true`).
    pub run_slow_tests: bool,

    /// Running in continuous integration; benchmarks shorten their measurement.
    pub ci: bool,
}

impl Default for TestingSettings {
    fn default() -> Self {
        Self {
            run_slow_tests: false,
            ci: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub model: ModelSettings,
    pub testing: TestingSettings,
}

impl Settings {
    /// Defaults, then `seqgen.toml` (optional), then `SEQGEN__SECTION__KEY`
    /// environment variables.
    pub fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("model.seed", None::<u64>)?
            .set_default("model.model_config_path", None::<String>)?
            .set_default("model.data_config_path", None::<String>)?
            .set_default("testing.run_slow_tests", false)?
            .set_default("testing.ci", false)?
            .add_source(File::with_name("seqgen").required(false))
            .add_source(Environment::with_prefix("SEQGEN").prefix_separator("__").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Get the global settings instance, initializing it if necessary.
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        Settings::new().unwrap_or_else(|err| {
            log::warn!("Falling back to default settings: {}", err);
            Settings::default()
        })
    })
}
