//! Error types for the docpipe core library.
//!
//! Each module has its own error enum to provide clear error boundaries.
//! The library uses `thiserror` for structured, typed errors.

/// Errors from assembling the service configuration, whichever layer
/// (file, environment, defaults) the offending value came from.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting the service cannot run without was never provided.
    #[error("config is missing '{field}'")]
    MissingField {
        /// Dotted path of the absent setting.
        field: String,
    },

    /// A setting was provided but cannot be used as given.
    #[error("config field '{field}' is invalid: {message}")]
    InvalidValue {
        /// Dotted path of the bad setting, or the environment key.
        field: String,
        /// What made the value unusable.
        message: String,
    },

    /// No configuration file exists at the requested path.
    #[error("no config file at {path}")]
    FileNotFound {
        /// The path the loader was pointed at.
        path: String,
    },

    /// The configuration file is not valid TOML.
    #[error("config file is not valid TOML: {source}")]
    ParseError {
        /// The underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },
}

/// Errors from interacting with vision LLM providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP request to the LLM endpoint failed.
    #[error("LLM HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// LLM API returned an error response.
    #[error("LLM API error (status {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the API.
        message: String,
    },

    /// LLM provider rate limit hit.
    #[error("LLM rate limited{}", match .retry_after_secs {
        Some(secs) => format!(", retry after {secs}s"),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying, if the API provided a hint.
        retry_after_secs: Option<u64>,
    },

    /// A provider call exceeded its deadline.
    #[error("LLM call timed out after {seconds}s")]
    Timeout {
        /// The deadline that was exceeded.
        seconds: u64,
    },

    /// LLM response could not be parsed.
    #[error("failed to parse LLM response: {0}")]
    Parse(String),

    /// The provider cannot accept the submitted media type.
    #[error("provider '{provider}' does not support media type '{mime_type}'")]
    UnsupportedMedia {
        /// The provider that rejected the input.
        provider: String,
        /// The MIME type it cannot process.
        mime_type: String,
    },

    /// No LLM provider configured.
    #[error("no LLM provider configured")]
    NotConfigured,
}

impl LlmError {
    /// Whether a failed call may succeed on retry.
    ///
    /// Rate limits, timeouts, 5xx responses, and network-level failures
    /// are transient. Authentication failures, malformed input, parse
    /// failures, and unsupported media are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Request(e) => !e.is_builder(),
            Self::Parse(_) | Self::UnsupportedMedia { .. } | Self::NotConfigured => false,
        }
    }

    /// The retry-after hint in seconds, when the provider supplied one.
    pub fn retry_hint_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Errors from the object store adapter.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    /// Uploading an object failed.
    #[error("object upload failed for '{key}': {message}")]
    Upload {
        /// The object key.
        key: String,
        /// Details from the underlying client.
        message: String,
    },

    /// Downloading an object failed.
    #[error("object download failed for '{key}': {message}")]
    Download {
        /// The object key.
        key: String,
        /// Details from the underlying client.
        message: String,
    },

    /// Deleting an object failed.
    #[error("object deletion failed for '{key}': {message}")]
    Delete {
        /// The object key.
        key: String,
        /// Details from the underlying client.
        message: String,
    },

    /// Generating a signed URL failed.
    #[error("failed to presign '{key}': {message}")]
    Presign {
        /// The object key.
        key: String,
        /// Details from the underlying client.
        message: String,
    },
}

/// Errors from SQLite storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to connect to the database.
    #[error("database connection error: {source}")]
    Connection {
        /// The underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },

    /// Database migration failed.
    #[error("database migration error: {source}")]
    Migration {
        /// The underlying migration error.
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    /// A database query failed.
    #[error("database query error: {source}")]
    Query {
        /// The underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_missing_field_message() {
        let err = ConfigError::MissingField {
            field: "database.url".to_string(),
        };
        assert_eq!(err.to_string(), "config is missing 'database.url'");
    }

    #[test]
    fn config_error_invalid_value_message() {
        let err = ConfigError::InvalidValue {
            field: "llm.default_provider".to_string(),
            message: "unknown provider 'cohere', expected anthropic or openai".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "config field 'llm.default_provider' is invalid: unknown provider 'cohere', expected anthropic or openai"
        );
    }

    #[test]
    fn config_error_file_not_found_message() {
        let err = ConfigError::FileNotFound {
            path: "/etc/docpipe/config.toml".to_string(),
        };
        assert_eq!(err.to_string(), "no config file at /etc/docpipe/config.toml");
    }

    #[test]
    fn llm_error_rate_limited_with_hint() {
        let err = LlmError::RateLimited {
            retry_after_secs: Some(30),
        };
        assert_eq!(err.to_string(), "LLM rate limited, retry after 30s");
        assert!(err.is_retryable());
        assert_eq!(err.retry_hint_secs(), Some(30));
    }

    #[test]
    fn llm_error_rate_limited_without_hint() {
        let err = LlmError::RateLimited {
            retry_after_secs: None,
        };
        assert_eq!(err.to_string(), "LLM rate limited");
        assert_eq!(err.retry_hint_secs(), None);
    }

    #[test]
    fn llm_error_timeout_is_retryable() {
        let err = LlmError::Timeout { seconds: 30 };
        assert_eq!(err.to_string(), "LLM call timed out after 30s");
        assert!(err.is_retryable());
    }

    #[test]
    fn llm_error_5xx_is_retryable_4xx_is_not() {
        let server = LlmError::Api {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(server.is_retryable());

        let auth = LlmError::Api {
            status: 401,
            message: "invalid key".to_string(),
        };
        assert!(!auth.is_retryable());
    }

    #[test]
    fn llm_error_parse_not_retryable() {
        let err = LlmError::Parse("unexpected JSON structure".to_string());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "failed to parse LLM response: unexpected JSON structure"
        );
    }

    #[test]
    fn llm_error_unsupported_media_message() {
        let err = LlmError::UnsupportedMedia {
            provider: "openai".to_string(),
            mime_type: "application/pdf".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "provider 'openai' does not support media type 'application/pdf'"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn object_store_error_messages() {
        let err = ObjectStoreError::Upload {
            key: "documents/u1/1_a.pdf".to_string(),
            message: "access denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "object upload failed for 'documents/u1/1_a.pdf': access denied"
        );
    }
}
