//! Configuration management for docpipe.
//!
//! Supports three-layer configuration loading:
//! 1. Built-in defaults
//! 2. TOML config file
//! 3. Environment variable overrides (`DB_URL`, `OBJECT_STORE_*`,
//!    `LLM_DEFAULT_PROVIDER`, `PROVIDER_<NAME>_*`, `MAX_FILE_SIZE`,
//!    `ALLOWED_MIME_TYPES`, `LOG_LEVEL`)

mod env_overrides;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 10 MiB default upload ceiling.
const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Top-level configuration for the docpipe service.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Relational store connection.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// S3-compatible object store settings.
    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    /// LLM provider credentials and dispatch settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Upload limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Pipeline worker settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relational store connection.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Connection string, e.g. `sqlite:docpipe.db`.
    #[serde(default)]
    pub url: String,
}

/// S3-compatible object store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectStoreConfig {
    /// Custom endpoint for S3-compatible stores (MinIO etc.). Empty uses AWS.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Store region.
    #[serde(default = "default_region")]
    pub region: String,

    /// Bucket holding document bytes.
    #[serde(default)]
    pub bucket: String,

    /// Access key (optional when ambient credentials are available).
    #[serde(default)]
    pub access_key: Option<String>,

    /// Secret key.
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Path-style addressing, required by most S3-compatible endpoints.
    #[serde(default)]
    pub force_path_style: bool,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            bucket: String::new(),
            access_key: None,
            secret_key: None,
            force_path_style: false,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Credentials and default model for one provider.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// API key for the provider.
    #[serde(default)]
    pub api_key: String,

    /// Model identifier; empty selects the provider's built-in default.
    #[serde(default)]
    pub model: String,

    /// Override base URL (testing, proxies, self-hosted gateways).
    #[serde(default)]
    pub base_url: Option<String>,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Provider tag used when a single provider is enough: "anthropic" or "openai".
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Anthropic credentials, when configured.
    #[serde(default)]
    pub anthropic: Option<ProviderConfig>,

    /// OpenAI-compatible credentials, when configured.
    #[serde(default)]
    pub openai: Option<ProviderConfig>,

    /// Per-call timeout in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Enable multi-provider fan-out for high-stakes documents.
    #[serde(default = "default_true")]
    pub multi_provider: bool,

    /// Weight of the primary provider in weighted voting.
    #[serde(default = "default_primary_weight")]
    pub primary_weight: f64,

    /// Weight of the secondary provider in weighted voting.
    #[serde(default = "default_secondary_weight")]
    pub secondary_weight: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            anthropic: None,
            openai: None,
            call_timeout_secs: default_call_timeout(),
            multi_provider: true,
            primary_weight: default_primary_weight(),
            secondary_weight: default_secondary_weight(),
        }
    }
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_call_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_primary_weight() -> f64 {
    0.55
}

fn default_secondary_weight() -> f64 {
    0.45
}

/// Upload limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Maximum upload size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// MIME types accepted by the enqueue entry point.
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_mime_types: default_allowed_mime_types(),
        }
    }
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_allowed_mime_types() -> Vec<String> {
    vec![
        "application/pdf".to_string(),
        "image/jpeg".to_string(),
        "image/png".to_string(),
        "image/webp".to_string(),
    ]
}

/// Pipeline worker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Maximum documents processed concurrently.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Delivery attempts per document before marking it FAILED.
    #[serde(default = "default_step_retries")]
    pub delivery_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            delivery_attempts: default_step_retries(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

fn default_step_retries() -> u32 {
    3
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token → user id map; the seam the external session
    /// service plugs into.
    #[serde(default)]
    pub api_tokens: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_tokens: HashMap::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8300
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace|debug|info|warn|error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    /// and validate.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_string(),
        })?;

        let mut config: Config =
            toml::from_str(&contents).map_err(|source| ConfigError::ParseError { source })?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults plus environment variables only.
    ///
    /// The deployment mode for containerized installs where no config
    /// file is mounted.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::MissingField {
                field: "database.url".to_string(),
            });
        }

        match self.llm.default_provider.as_str() {
            "anthropic" | "openai" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "llm.default_provider".to_string(),
                    message: format!("unknown provider '{other}', expected anthropic or openai"),
                });
            }
        }

        if self.limits.max_file_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.max_file_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.limits.allowed_mime_types.is_empty() {
            return Err(ConfigError::MissingField {
                field: "limits.allowed_mime_types".to_string(),
            });
        }

        let weight_sum = self.llm.primary_weight + self.llm.secondary_weight;
        if !(0.99..=1.01).contains(&weight_sum) {
            return Err(ConfigError::InvalidValue {
                field: "llm.primary_weight".to_string(),
                message: format!("provider weights must sum to 1.0, got {weight_sum}"),
            });
        }

        Ok(())
    }

    /// The provider config for a tag, when present.
    pub fn provider(&self, tag: &str) -> Option<&ProviderConfig> {
        match tag {
            "anthropic" => self.llm.anthropic.as_ref(),
            "openai" => self.llm.openai.as_ref(),
            _ => None,
        }
    }
}
