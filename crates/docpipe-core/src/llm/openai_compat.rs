//! OpenAI-compatible vision provider.
//!
//! Works with OpenAI and any endpoint speaking the chat completions
//! format. Images travel as `image_url` data URLs; native PDF is not
//! supported and is rejected before any HTTP call so the dispatcher
//! can route PDFs to a capable provider.

use serde::{Deserialize, Serialize};

use super::{RawCompletion, TokenUsage, VisionProvider, VisionRequest};
use crate::error::LlmError;

/// The OpenAI API base URL.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default model when the config does not name one.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Vision provider using the OpenAI chat completions API format.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    provider_name: String,
}

impl OpenAiCompatProvider {
    /// Create a new provider against the OpenAI cloud endpoint.
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, OPENAI_BASE_URL.to_string(), "openai".to_string())
    }

    /// Create a new provider with a custom base URL and display name.
    pub fn with_base_url(
        api_key: String,
        model: String,
        base_url: String,
        provider_name: String,
    ) -> Self {
        let model = if model.is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            model
        };
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model,
            provider_name,
        }
    }
}

#[async_trait::async_trait]
impl VisionProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn supports_pdf(&self) -> bool {
        false
    }

    async fn complete(&self, request: VisionRequest) -> Result<RawCompletion, LlmError> {
        if let Some(file) = &request.file {
            if file.is_pdf() {
                return Err(LlmError::UnsupportedMedia {
                    provider: self.provider_name.clone(),
                    mime_type: file.mime_type().to_string(),
                });
            }
        }

        tracing::debug!(
            provider = %self.provider_name,
            model = %self.model,
            max_tokens = request.max_tokens,
            has_file = request.file.is_some(),
            "LLM request",
        );

        let mut user_content = Vec::new();
        if let Some(file) = &request.file {
            user_content.push(UserContent::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", file.mime_type(), file.to_base64()),
                },
            });
        }
        user_content.push(UserContent::Text {
            text: request.prompt.clone(),
        });

        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage::System {
                    content: &request.system,
                },
                ChatMessage::User {
                    content: user_content,
                },
            ],
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                return Err(LlmError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }

            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: body,
            });
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("failed to parse response: {e}")))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let usage = body.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            input_tokens: u.prompt_tokens.unwrap_or(0),
            output_tokens: u.completion_tokens.unwrap_or(0),
        });

        tracing::debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            chars = text.len(),
            "LLM response",
        );

        Ok(RawCompletion {
            text,
            usage,
            model: body.model,
        })
    }
}

// --- Internal Serde types ---

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum ChatMessage<'a> {
    System { content: &'a str },
    User { content: Vec<UserContent> },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContent {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::DocumentPayload;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> OpenAiCompatProvider {
        OpenAiCompatProvider::with_base_url(
            "test-key".into(),
            String::new(),
            server.uri(),
            "openai".into(),
        )
    }

    #[tokio::test]
    async fn complete_success_with_image() {
        let server = MockServer::start().await;

        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"is_valid\": true}"}}],
            "model": "gpt-4o",
            "usage": {"prompt_tokens": 800, "completion_tokens": 12}
        });

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("data:image/png;base64,"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .expect(1)
            .mount(&server)
            .await;

        let resp = provider(&server)
            .complete(VisionRequest {
                system: "system".into(),
                prompt: "validate".into(),
                file: Some(DocumentPayload::new(vec![0x89, 0x50], "image/png")),
                max_tokens: 512,
            })
            .await
            .expect("complete");

        assert_eq!(resp.text, "{\"is_valid\": true}");
        assert_eq!(resp.model, "gpt-4o");
        assert_eq!(resp.usage.input_tokens, 800);
        assert_eq!(resp.usage.output_tokens, 12);
    }

    #[tokio::test]
    async fn pdf_rejected_without_http_call() {
        // No mock server needed: the provider must fail fast.
        let provider = OpenAiCompatProvider::new("key".into(), String::new());
        let err = provider
            .complete(VisionRequest {
                system: String::new(),
                prompt: "extract".into(),
                file: Some(DocumentPayload::new(b"%PDF-1.4".to_vec(), "application/pdf")),
                max_tokens: 512,
            })
            .await
            .unwrap_err();

        match err {
            LlmError::UnsupportedMedia {
                provider,
                mime_type,
            } => {
                assert_eq!(provider, "openai");
                assert_eq!(mime_type, "application/pdf");
            }
            other => panic!("expected UnsupportedMedia, got: {other}"),
        }
    }

    #[tokio::test]
    async fn error_429_maps_to_rate_limited() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .append_header("retry-after", "20")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let err = provider(&server)
            .complete(VisionRequest {
                system: String::new(),
                prompt: "hello".into(),
                file: None,
                max_tokens: 64,
            })
            .await
            .unwrap_err();

        match err {
            LlmError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, Some(20)),
            other => panic!("expected RateLimited, got: {other}"),
        }
    }

    #[tokio::test]
    async fn error_500_maps_to_api_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .complete(VisionRequest {
                system: String::new(),
                prompt: "hello".into(),
                file: None,
                max_tokens: 64,
            })
            .await
            .unwrap_err();

        match err {
            LlmError::Api { status, .. } => {
                assert_eq!(status, 500);
                assert!(err_is_retryable(status));
            }
            other => panic!("expected Api, got: {other}"),
        }
    }

    fn err_is_retryable(status: u16) -> bool {
        LlmError::Api {
            status,
            message: String::new(),
        }
        .is_retryable()
    }

    #[test]
    fn provider_identity() {
        let provider = OpenAiCompatProvider::new("key".into(), String::new());
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.model(), DEFAULT_MODEL);
        assert!(!provider.supports_pdf());
    }
}
