//! Configuration management for the conversion queue

use crate::error::{ConversionError, Result};
use crate::executor::ExecutorSettings;
use crate::models::RequestKind;
use crate::pipeline::PipelineCatalog;
use crate::staging::AssetLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `ATLAS_QUEUE__WORKER__EXECUTABLE`
pub const ENV_PREFIX: &str = "ATLAS_QUEUE";

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub polling: PollingConfig,
    pub logging: LoggingConfigSerde,
}

/// External converter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub executable: PathBuf,
    pub pipeline_directory: PathBuf,
    /// Pipeline file stem; the first pipeline is used when unset
    pub active_pipeline: Option<String>,
    pub default_request: RequestKind,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("client3D"),
            pipeline_directory: data_root().join("pipelines"),
            active_pipeline: None,
            default_request: RequestKind::default(),
        }
    }
}

impl WorkerConfig {
    pub fn pipeline_catalog(&self) -> PipelineCatalog {
        PipelineCatalog::new(&self.pipeline_directory)
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub source_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub output_directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base_dir = data_root();

        Self {
            source_directory: base_dir.join("original-images"),
            temp_directory: base_dir.join("temp-images"),
            output_directory: base_dir.join("generated-models"),
        }
    }
}

impl StorageConfig {
    pub fn layout(&self) -> AssetLayout {
        AssetLayout::new(
            &self.source_directory,
            &self.temp_directory,
            &self.output_directory,
        )
    }
}

/// Polling intervals and retry bounds, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub poll_interval_ms: u64,
    pub refresh_interval_ms: u64,
    pub validation_retry_interval_ms: u64,
    pub output_wait_timeout_ms: Option<u64>,
    pub max_output_waits: Option<u32>,
    pub max_validation_attempts: Option<u32>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            refresh_interval_ms: 1000,
            validation_retry_interval_ms: 1000,
            output_wait_timeout_ms: None,
            max_output_waits: None,
            max_validation_attempts: None,
        }
    }
}

impl PollingConfig {
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            refresh_interval: Duration::from_millis(self.refresh_interval_ms),
            validation_retry_interval: Duration::from_millis(self.validation_retry_interval_ms),
            output_wait_timeout: self.output_wait_timeout_ms.map(Duration::from_millis),
            max_output_waits: self.max_output_waits,
            max_validation_attempts: self.max_validation_attempts,
        }
    }
}

/// Serializable logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfigSerde {
    pub level: String,
    /// `console` or `file`
    pub output_type: String,
    /// Directory for rolling log files when `output_type` is `file`
    pub output_path: Option<PathBuf>,
    /// Emit JSON lines instead of human-readable text
    pub structured: bool,
}

impl Default for LoggingConfigSerde {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output_type: "console".to_string(),
            output_path: None,
            structured: false,
        }
    }
}

fn data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("atlas-queue")
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a configuration manager with a custom path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = Self::load_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Update the configuration
    pub fn update_config(&mut self, config: AppConfig) -> Result<()> {
        self.config = config;
        self.save()
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConversionError::ConfigError {
                message: format!("Failed to create config directory: {}", e),
            })?;
        }

        let config_str =
            toml::to_string_pretty(&self.config).map_err(|e| ConversionError::ConfigError {
                message: format!("Failed to serialize config: {}", e),
            })?;

        std::fs::write(&self.config_path, config_str).map_err(|e| {
            ConversionError::ConfigError {
                message: format!("Failed to write config file: {}", e),
            }
        })?;

        tracing::info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ConversionError::ConfigError {
                message: "Could not determine config directory".to_string(),
            })?
            .join("atlas-queue");

        Ok(config_dir.join("config.toml"))
    }

    /// Layer the config file (if any) and environment overrides over the defaults
    fn load_config(path: &Path) -> Result<AppConfig> {
        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConversionError::ConfigError {
                message: format!("Failed to read config file: {}", e),
            })?;

        let config: AppConfig =
            settings
                .try_deserialize()
                .map_err(|e| ConversionError::ConfigError {
                    message: format!("Failed to parse config file: {}", e),
                })?;

        if path.exists() {
            tracing::info!("Configuration loaded from {:?}", path);
        } else {
            tracing::info!("Using default configuration");
        }
        Ok(config)
    }
}
