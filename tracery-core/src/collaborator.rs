//! Collaborator module: the external intelligence service behind the pipeline
//!
//! Provides a `Collaborator` trait with implementations for:
//! - **HTTP**: a Messages-style JSON API (Anthropic-compatible) via `reqwest`
//! - **Disabled**: always unavailable; every pipeline stage takes its fallback path
//!
//! Every stage talks to the collaborator through [`ask`], which shapes the
//! request, performs exactly one round trip and decodes the reply with
//! [`decode_response`]. Nothing here retries.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::CollaboratorConfig;

const API_VERSION: &str = "2023-06-01";

// ============================================================================
// Collaborator trait
// ============================================================================

/// Abstraction over the language-understanding service.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Send one prompt and return the raw text of the reply.
    async fn complete(&self, system: &str, user: &str) -> Result<String, CollaboratorError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

/// Collaborator failures. Always recovered by the calling stage's fallback.
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Collaborator returned an empty response")]
    EmptyResponse,

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Response is not valid JSON for this stage: {0}")]
    Decode(String),

    #[error("Response violates the stage schema: {0}")]
    Schema(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Collaborator is disabled")]
    Unavailable,
}

// ============================================================================
// Request shaping / response decoding
// ============================================================================

/// Serialize `request` as the user message, call the collaborator once and
/// decode the reply into the stage's typed response.
pub async fn ask<Req, Resp>(
    collaborator: &dyn Collaborator,
    system: &str,
    request: &Req,
) -> Result<Resp, CollaboratorError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let payload =
        serde_json::to_string_pretty(request).map_err(|e| CollaboratorError::Encode(e.to_string()))?;
    let raw = collaborator.complete(system, &payload).await?;
    decode_response(&raw)
}

/// Remove a surrounding markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Decode a collaborator reply into `T`.
///
/// Fenced replies are unwrapped first; if the remainder still is not valid
/// JSON, the outermost `{...}` slice is tried before giving up.
pub fn decode_response<T: DeserializeOwned>(raw: &str) -> Result<T, CollaboratorError> {
    let body = strip_code_fences(raw);
    if body.is_empty() {
        return Err(CollaboratorError::EmptyResponse);
    }

    match serde_json::from_str(body) {
        Ok(value) => Ok(value),
        Err(first) => match (body.find('{'), body.rfind('}')) {
            (Some(start), Some(end)) if start < end => serde_json::from_str(&body[start..=end])
                .map_err(|e| CollaboratorError::Decode(e.to_string())),
            _ => Err(CollaboratorError::Decode(first.to_string())),
        },
    }
}

// ============================================================================
// Config / factory
// ============================================================================

/// HTTP collaborator client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
}

impl ClientConfig {
    /// Resolve the API key from the environment variable named in `config`.
    pub fn from_config(config: &CollaboratorConfig) -> Self {
        Self {
            api_key: std::env::var(&config.api_key_env).unwrap_or_default(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout_seconds: config.timeout_seconds,
        }
    }
}

/// Create the configured backend. Unknown backend names fall back to HTTP.
pub fn create_collaborator(
    config: &CollaboratorConfig,
) -> Result<Box<dyn Collaborator>, CollaboratorError> {
    match config.backend.as_str() {
        "disabled" => Ok(Box::new(DisabledCollaborator)),
        _ => Ok(Box::new(HttpCollaborator::with_base_url(
            ClientConfig::from_config(config),
            config.base_url.clone(),
        )?)),
    }
}

// ============================================================================
// Messages API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// HttpCollaborator
// ============================================================================

/// Calls a Messages-style completion endpoint.
#[derive(Debug, Clone)]
pub struct HttpCollaborator {
    client: Client,
    config: ClientConfig,
    base_url: String,
}

impl HttpCollaborator {
    pub fn new(config: ClientConfig) -> Result<Self, CollaboratorError> {
        Self::with_base_url(config, "https://api.anthropic.com".to_string())
    }

    /// Create a client with a custom base URL (for testing / self-hosted gateways)
    pub fn with_base_url(config: ClientConfig, base_url: String) -> Result<Self, CollaboratorError> {
        if config.api_key.is_empty() {
            return Err(CollaboratorError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Collaborator for HttpCollaborator {
    async fn complete(&self, system: &str, user: &str) -> Result<String, CollaboratorError> {
        let url = format!("{}/v1/messages", self.base_url);

        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system,
            messages: vec![Message {
                role: "user",
                content: user,
            }],
        };

        tracing::debug!(prompt_len = user.len(), model = %self.config.model, "Calling collaborator");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Collaborator API error");

            return Err(CollaboratorError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: MessagesResponse = response.json().await?;

        let text: String = body
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(CollaboratorError::EmptyResponse);
        }

        Ok(text)
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ============================================================================
// DisabledCollaborator
// ============================================================================

/// Always unavailable. Every stage degrades to its local fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCollaborator;

#[async_trait]
impl Collaborator for DisabledCollaborator {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable)
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Labels {
        labels: Vec<String>,
    }

    fn test_config(api_key: &str) -> ClientConfig {
        ClientConfig {
            api_key: api_key.to_string(),
            model: "test-model".to_string(),
            max_tokens: 512,
            timeout_seconds: 5,
        }
    }

    fn text_reply(text: &str) -> serde_json::Value {
        serde_json::json!({
            "content": [{ "type": "text", "text": text }]
        })
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_decode_fenced_and_prose_wrapped() {
        let fenced: Labels = decode_response("```json\n{\"labels\": [\"Home\"]}\n```").unwrap();
        assert_eq!(fenced.labels, vec!["Home"]);

        let prose: Labels =
            decode_response("Sure! Here it is:\n{\"labels\": [\"Cart\"]}\nHope that helps.")
                .unwrap();
        assert_eq!(prose.labels, vec!["Cart"]);
    }

    #[test]
    fn test_decode_failures() {
        assert!(matches!(
            decode_response::<Labels>("```json\n```"),
            Err(CollaboratorError::EmptyResponse)
        ));
        assert!(matches!(
            decode_response::<Labels>("no json here"),
            Err(CollaboratorError::Decode(_))
        ));
        assert!(matches!(
            decode_response::<Labels>("{\"labels\": 3}"),
            Err(CollaboratorError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_sends_messages_request() {
        let mock_server = MockServer::start().await;
        let client = HttpCollaborator::with_base_url(test_config("test-key"), mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "max_tokens": 512,
                "system": "label screens",
                "messages": [{ "role": "user", "content": "{}" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("{\"ok\":true}")))
            .expect(1)
            .mount(&mock_server)
            .await;

        let text = client.complete("label screens", "{}").await.unwrap();
        assert_eq!(text, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_ask_decodes_fenced_reply() {
        let mock_server = MockServer::start().await;
        let client =
            HttpCollaborator::with_base_url(test_config("test-key"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(text_reply("```json\n{\"labels\": [\"Checkout\"]}\n```")),
            )
            .mount(&mock_server)
            .await;

        let labels: Labels = ask(&client, "system", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(labels.labels, vec!["Checkout"]);
    }

    #[tokio::test]
    async fn test_api_error_is_not_retried() {
        let mock_server = MockServer::start().await;
        let client =
            HttpCollaborator::with_base_url(test_config("test-key"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_json(serde_json::json!({
                "type": "error",
                "error": { "type": "overloaded_error", "message": "Overloaded" }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.complete("s", "u").await {
            Err(CollaboratorError::Api { code, message }) => {
                assert_eq!(code, 529);
                assert_eq!(message, "Overloaded");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_content_is_an_error() {
        let mock_server = MockServer::start().await;
        let client =
            HttpCollaborator::with_base_url(test_config("test-key"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "content": [] })),
            )
            .mount(&mock_server)
            .await;

        assert!(matches!(
            client.complete("s", "u").await,
            Err(CollaboratorError::EmptyResponse)
        ));
    }

    #[test]
    fn test_missing_api_key() {
        match HttpCollaborator::new(test_config("")) {
            Err(CollaboratorError::MissingApiKey) => {}
            _ => panic!("Expected MissingApiKey error"),
        }
    }

    #[tokio::test]
    async fn test_disabled_backend() {
        let config = CollaboratorConfig {
            backend: "disabled".to_string(),
            ..Default::default()
        };
        let collaborator = create_collaborator(&config).unwrap();
        assert_eq!(collaborator.name(), "disabled");
        assert!(matches!(
            collaborator.complete("s", "u").await,
            Err(CollaboratorError::Unavailable)
        ));
    }
}
