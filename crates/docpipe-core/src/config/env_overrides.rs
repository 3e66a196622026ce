//! Environment variable overrides for configuration.

use super::{Config, ProviderConfig};
use crate::error::ConfigError;
use std::env;

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Uses the flat deployment keys (`DB_URL`, `OBJECT_STORE_BUCKET`, …)
    /// rather than a nested prefix scheme, matching what the surrounding
    /// infrastructure injects.
    pub(super) fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = env::var("DB_URL") {
            self.database.url = val;
        }

        // Object store
        if let Ok(val) = env::var("OBJECT_STORE_ENDPOINT") {
            self.object_store.endpoint = Some(val);
        }
        if let Ok(val) = env::var("OBJECT_STORE_REGION") {
            self.object_store.region = val;
        }
        if let Ok(val) = env::var("OBJECT_STORE_BUCKET") {
            self.object_store.bucket = val;
        }
        if let Ok(val) = env::var("OBJECT_STORE_ACCESS_KEY") {
            self.object_store.access_key = Some(val);
        }
        if let Ok(val) = env::var("OBJECT_STORE_SECRET_KEY") {
            self.object_store.secret_key = Some(val);
        }
        if let Ok(val) = env::var("OBJECT_STORE_FORCE_PATH_STYLE") {
            self.object_store.force_path_style = parse_env_bool("OBJECT_STORE_FORCE_PATH_STYLE", &val)?;
        }

        // LLM providers
        if let Ok(val) = env::var("LLM_DEFAULT_PROVIDER") {
            self.llm.default_provider = val.to_lowercase();
        }
        apply_provider_env(&mut self.llm.anthropic, "ANTHROPIC");
        apply_provider_env(&mut self.llm.openai, "OPENAI");

        // Limits
        if let Ok(val) = env::var("MAX_FILE_SIZE") {
            self.limits.max_file_size = parse_env_u64("MAX_FILE_SIZE", &val)?;
        }
        if let Ok(val) = env::var("ALLOWED_MIME_TYPES") {
            self.limits.allowed_mime_types = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Logging. "fatal" is accepted for compatibility and maps to
        // the closest tracing level.
        if let Ok(val) = env::var("LOG_LEVEL") {
            let level = val.to_lowercase();
            self.logging.level = if level == "fatal" {
                "error".to_string()
            } else {
                level
            };
        }

        Ok(())
    }
}

/// Apply `PROVIDER_<NAME>_API_KEY` / `PROVIDER_<NAME>_MODEL` overrides,
/// creating the provider section when the key is set.
fn apply_provider_env(slot: &mut Option<ProviderConfig>, name: &str) {
    let api_key = env::var(format!("PROVIDER_{name}_API_KEY")).ok();
    let model = env::var(format!("PROVIDER_{name}_MODEL")).ok();

    if api_key.is_none() && model.is_none() {
        return;
    }

    let provider = slot.get_or_insert_with(ProviderConfig::default);
    if let Some(key) = api_key {
        provider.api_key = key;
    }
    if let Some(model) = model {
        provider.model = model;
    }
}

fn parse_env_u64(name: &str, val: &str) -> Result<u64, ConfigError> {
    val.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        field: name.to_string(),
        message: format!("'{val}' is not a valid integer"),
    })
}

fn parse_env_bool(name: &str, val: &str) -> Result<bool, ConfigError> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("'{val}' is not a valid boolean"),
        }),
    }
}
