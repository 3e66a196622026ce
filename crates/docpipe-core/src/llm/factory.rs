//! Provider construction and caching.
//!
//! Builds [`VisionProvider`] instances from configuration once at
//! startup and hands out shared `Arc` handles. The registry also knows
//! the fan-out order (default provider first) and which providers can
//! take native PDF input.

use std::sync::Arc;

use super::anthropic::AnthropicProvider;
use super::openai_compat::OpenAiCompatProvider;
use super::VisionProvider;
use crate::config::Config;
use crate::error::LlmError;

/// Cached provider set for the lifetime of the process.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn VisionProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Build providers from configuration.
    ///
    /// A provider is constructed when its section exists with a
    /// non-empty API key. The default provider sorts first, which
    /// makes it the "primary" in weighted voting. Errors with
    /// [`LlmError::NotConfigured`] when no provider is usable.
    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        let mut providers: Vec<Arc<dyn VisionProvider>> = Vec::new();

        if let Some(section) = &config.llm.anthropic {
            if !section.api_key.is_empty() {
                let provider = match &section.base_url {
                    Some(url) => AnthropicProvider::with_base_url(
                        section.api_key.clone(),
                        section.model.clone(),
                        url.clone(),
                    ),
                    None => AnthropicProvider::new(section.api_key.clone(), section.model.clone()),
                };
                providers.push(Arc::new(provider));
            }
        }

        if let Some(section) = &config.llm.openai {
            if !section.api_key.is_empty() {
                let provider = match &section.base_url {
                    Some(url) => OpenAiCompatProvider::with_base_url(
                        section.api_key.clone(),
                        section.model.clone(),
                        url.clone(),
                        "openai".to_string(),
                    ),
                    None => {
                        OpenAiCompatProvider::new(section.api_key.clone(), section.model.clone())
                    }
                };
                providers.push(Arc::new(provider));
            }
        }

        if providers.is_empty() {
            return Err(LlmError::NotConfigured);
        }

        providers.sort_by_key(|p| p.name() != config.llm.default_provider);
        Ok(Self { providers })
    }

    /// Build a registry directly from provider handles (tests, embedding).
    pub fn from_providers(providers: Vec<Arc<dyn VisionProvider>>) -> Result<Self, LlmError> {
        if providers.is_empty() {
            return Err(LlmError::NotConfigured);
        }
        Ok(Self { providers })
    }

    /// The primary provider.
    pub fn primary(&self) -> Arc<dyn VisionProvider> {
        Arc::clone(&self.providers[0])
    }

    /// Look up a provider by tag.
    pub fn get(&self, tag: &str) -> Option<Arc<dyn VisionProvider>> {
        self.providers
            .iter()
            .find(|p| p.name() == tag)
            .map(Arc::clone)
    }

    /// All providers in fan-out order (primary first).
    pub fn all(&self) -> Vec<Arc<dyn VisionProvider>> {
        self.providers.iter().map(Arc::clone).collect()
    }

    /// Providers that accept native PDF input, in fan-out order.
    pub fn pdf_capable(&self) -> Vec<Arc<dyn VisionProvider>> {
        self.providers
            .iter()
            .filter(|p| p.supports_pdf())
            .map(Arc::clone)
            .collect()
    }

    /// Number of usable providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty (never true after construction).
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
