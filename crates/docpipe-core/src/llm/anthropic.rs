//! Anthropic native vision provider.
//!
//! Uses the Anthropic Messages API, which has a distinct request
//! format, authentication mechanism, and response structure from
//! OpenAI-compatible endpoints. Accepts both images and native PDFs
//! (as `document` content blocks).

use serde::{Deserialize, Serialize};

use super::{RawCompletion, TokenUsage, VisionProvider, VisionRequest};
use crate::error::LlmError;

/// The Anthropic Messages API base URL.
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

/// The Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default model when the config does not name one.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Vision provider using the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with the default base URL.
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, ANTHROPIC_BASE_URL.to_string())
    }

    /// Create a new Anthropic provider with a custom base URL (for testing).
    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Self {
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
        }
    }
}

#[async_trait::async_trait]
impl VisionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn supports_pdf(&self) -> bool {
        true
    }

    async fn complete(&self, request: VisionRequest) -> Result<RawCompletion, LlmError> {
        tracing::debug!(
            provider = "anthropic",
            model = %self.model,
            max_tokens = request.max_tokens,
            has_file = request.file.is_some(),
            "LLM request",
        );

        let mut content = Vec::new();
        if let Some(file) = &request.file {
            let source = BlockSource {
                source_type: "base64",
                media_type: file.mime_type().to_string(),
                data: file.to_base64(),
            };
            if file.is_pdf() {
                content.push(ContentPart::Document { source });
            } else {
                content.push(ContentPart::Image { source });
            }
        }
        content.push(ContentPart::Text {
            text: request.prompt.clone(),
        });

        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system: if request.system.is_empty() {
                None
            } else {
                Some(&request.system)
            },
            messages: vec![AnthropicMessage {
                role: "user",
                content,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();

            if status == 429 || status == 529 {
                let retry_after = if status == 529 {
                    Some(30) // Anthropic "overloaded" default
                } else {
                    response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                };
                return Err(LlmError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }

            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);

            return Err(LlmError::Api { status, message });
        }

        let body: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("failed to parse Anthropic response: {e}")))?;

        let text = body
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        let usage = body.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            input_tokens: u.input_tokens.unwrap_or(0),
            output_tokens: u.output_tokens.unwrap_or(0),
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
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentPart {
    Text { text: String },
    Image { source: BlockSource },
    Document { source: BlockSource },
}

#[derive(Serialize)]
struct BlockSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: String,
    data: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicErrorDetail,
}

#[derive(Deserialize)]
struct AnthropicErrorDetail {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentType;
    use crate::llm::DocumentPayload;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> AnthropicProvider {
        AnthropicProvider::with_base_url("test-key".into(), String::new(), server.uri())
    }

    fn image() -> DocumentPayload {
        DocumentPayload::new(vec![0xFF, 0xD8, 0xFF], "image/jpeg")
    }

    fn pdf() -> DocumentPayload {
        DocumentPayload::new(b"%PDF-1.4".to_vec(), "application/pdf")
    }

    #[tokio::test]
    async fn complete_success() {
        let server = MockServer::start().await;

        let body = serde_json::json!({
            "content": [{"type": "text", "text": "{\"document_type\": \"INVOICE\", \"confidence\": 0.95, \"reasoning\": \"header says invoice\"}"}],
            "model": "claude-sonnet-4-5",
            "usage": {"input_tokens": 1500, "output_tokens": 40}
        });

        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        let resp = provider(&server)
            .complete(VisionRequest {
                system: "system".into(),
                prompt: "classify".into(),
                file: Some(image()),
                max_tokens: 1024,
            })
            .await
            .expect("complete");

        assert!(resp.text.contains("INVOICE"));
        assert_eq!(resp.model, "claude-sonnet-4-5");
        assert_eq!(resp.usage.input_tokens, 1500);
        assert_eq!(resp.usage.output_tokens, 40);
    }

    #[tokio::test]
    async fn classify_end_to_end() {
        let server = MockServer::start().await;

        let body = serde_json::json!({
            "content": [{"type": "text", "text": "```json\n{\"document_type\": \"RECEIPT\", \"confidence\": 0.88, \"reasoning\": \"itemized purchase\"}\n```"}],
            "model": "claude-sonnet-4-5",
            "usage": {"input_tokens": 900, "output_tokens": 35}
        });

        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        let classification = provider(&server).classify(&image()).await.expect("classify");
        assert_eq!(classification.document_type, DocumentType::Receipt);
        assert!((classification.confidence - 0.88).abs() < 1e-9);
        assert_eq!(classification.meta.provider, "anthropic");
        assert_eq!(classification.meta.prompt_id, "classify.v1");
        assert!(classification.meta.raw_response.contains("RECEIPT"));
    }

    #[tokio::test]
    async fn pdf_sent_as_document_block() {
        let server = MockServer::start().await;

        let body = serde_json::json!({
            "content": [{"type": "text", "text": "{}"}],
            "model": "claude-sonnet-4-5"
        });

        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_string_contains("\"type\":\"document\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server)
            .complete(VisionRequest {
                system: String::new(),
                prompt: "extract".into(),
                file: Some(pdf()),
                max_tokens: 1024,
            })
            .await
            .expect("complete");
    }

    #[tokio::test]
    async fn error_429_maps_to_rate_limited() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(
                ResponseTemplate::new(429)
                    .append_header("retry-after", "45")
                    .set_body_json(serde_json::json!({
                        "error": {"type": "rate_limit_error", "message": "Too many requests"}
                    })),
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
            LlmError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, Some(45)),
            other => panic!("expected RateLimited, got: {other}"),
        }
    }

    #[tokio::test]
    async fn error_529_maps_to_rate_limited_with_default_retry() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_json(serde_json::json!({
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
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
            LlmError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, Some(30)),
            other => panic!("expected RateLimited, got: {other}"),
        }
    }

    #[tokio::test]
    async fn error_401_maps_to_api_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"type": "authentication_error", "message": "Invalid API key"}
            })))
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
            LlmError::Api { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("Invalid API key"));
            }
            other => panic!("expected Api, got: {other}"),
        }
    }

    #[test]
    fn provider_identity() {
        let provider = AnthropicProvider::new("key".into(), String::new());
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.model(), DEFAULT_MODEL);
        assert!(provider.supports_pdf());
    }
}
