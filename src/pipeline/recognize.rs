//! Recognition: send one page image plus instructions to a vision model and
//! return its raw text reply.
//!
//! Parsing the reply into fields happens in [`crate::pipeline::extract`]; this
//! module only moves bytes. It is the single stage with network I/O.
//!
//! ## Backends
//!
//! * [`HttpRecognizer`] speaks the OpenAI chat-completions wire format
//!   directly: a system message naming the fields, a user message carrying
//!   the instruction text and the page as a `data:image/png;base64,` URL,
//!   bearer authentication. This is the default.
//! * [`ProviderRecognizer`] goes through an `edgequake-llm` provider, which
//!   covers Anthropic, Gemini, Ollama and the rest.
//!
//! Both make exactly one attempt per call. A reply that arrives but is not
//! usable JSON is *not* an error here; only transport failures are.

use crate::config::ExtractionConfig;
use crate::error::ScanError;
use crate::pipeline::encode;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Everything a backend needs to make one recognition call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionRequest {
    pub system_prompt: String,
    pub instruction: String,
    /// Bare base64 image payload.
    pub image_base64: String,
    pub image_mime: String,
}

impl RecognitionRequest {
    pub fn image_data_url(&self) -> String {
        encode::to_data_url(&self.image_mime, &self.image_base64)
    }
}

/// A vision-model backend.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Return the model's reply text verbatim.
    async fn recognize(&self, request: &RecognitionRequest) -> Result<String, ScanError>;

    /// Short human-readable label (endpoint or provider/model) for logs.
    fn describe(&self) -> String;
}

// ── HTTP chat-completions backend ────────────────────────────────────────────

/// Calls an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct HttpRecognizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: usize,
    temperature: Option<f32>,
}

impl fmt::Debug for HttpRecognizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRecognizer")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl HttpRecognizer {
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ScanError::InvalidConfig(format!("HTTP client: {e}")))?;

        if config.api_key.is_none() {
            warn!(
                "No API key configured; calling {} without authentication",
                config.endpoint
            );
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn service_error(&self, detail: impl Into<String>) -> ScanError {
        ScanError::RecognitionService {
            endpoint: self.endpoint.clone(),
            detail: detail.into(),
        }
    }
}

/// Chat-completions request body for one page.
pub(crate) fn build_request_body(
    model: &str,
    max_tokens: usize,
    temperature: Option<f32>,
    request: &RecognitionRequest,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [
            { "role": "system", "content": request.system_prompt },
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": request.instruction },
                    { "type": "image_url", "image_url": { "url": request.image_data_url() } }
                ]
            }
        ],
        "max_tokens": max_tokens,
    });
    if let Some(t) = temperature {
        body["temperature"] = json!(t);
    }
    body
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn recognize(&self, request: &RecognitionRequest) -> Result<String, ScanError> {
        let start = Instant::now();
        let body = build_request_body(&self.model, self.max_tokens, self.temperature, request);

        let mut http = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| self.service_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = format!("HTTP {}: {}", status, truncate(text.trim(), 300));
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ScanError::RecognitionAuth {
                    endpoint: self.endpoint.clone(),
                    detail,
                },
                _ => self.service_error(detail),
            });
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| self.service_error(format!("invalid response body: {e}")))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.service_error("response contained no choices"))?;

        let content = choice.message.content.unwrap_or_default();
        debug!(
            "{}: {} chars in {:?}",
            self.model,
            content.len(),
            start.elapsed()
        );
        Ok(content)
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.endpoint, self.model)
    }
}

// ── edgequake-llm provider backend ───────────────────────────────────────────

/// Delegates to an `edgequake-llm` provider.
pub struct ProviderRecognizer {
    provider: Arc<dyn LLMProvider>,
    label: String,
    max_tokens: usize,
    temperature: Option<f32>,
}

impl fmt::Debug for ProviderRecognizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRecognizer")
            .field("label", &self.label)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl ProviderRecognizer {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            label: label.into(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    fn build_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: self.temperature,
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Recognizer for ProviderRecognizer {
    async fn recognize(&self, request: &RecognitionRequest) -> Result<String, ScanError> {
        let image = ImageData::new(request.image_base64.clone(), request.image_mime.as_str())
            .with_detail("high");
        let messages = vec![
            ChatMessage::system(request.system_prompt.as_str()),
            ChatMessage::user_with_images(request.instruction.as_str(), vec![image]),
        ];
        let options = self.build_options();

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| ScanError::RecognitionService {
                endpoint: self.label.clone(),
                detail: e.to_string(),
            })?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.label, response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

// ── Resolution ───────────────────────────────────────────────────────────────

/// Pick the backend the config asks for.
///
/// Precedence: a pre-built recognizer, then a pre-built provider, then a
/// provider named in `provider_name`, then the HTTP endpoint.
pub fn resolve_recognizer(config: &ExtractionConfig) -> Result<Arc<dyn Recognizer>, ScanError> {
    if let Some(recognizer) = &config.recognizer {
        return Ok(Arc::clone(recognizer));
    }

    if let Some(provider) = &config.provider {
        let label = format!("provider ({})", config.model);
        return Ok(Arc::new(ProviderRecognizer::new(
            Arc::clone(provider),
            label,
            config,
        )));
    }

    if let Some(name) = &config.provider_name {
        let provider = ProviderFactory::create_llm_provider(name, &config.model).map_err(|e| {
            ScanError::ProviderNotConfigured {
                provider: name.clone(),
                hint: format!("{e}. Set the API key environment variable for '{name}'."),
            }
        })?;
        let label = format!("{}/{}", name, config.model);
        return Ok(Arc::new(ProviderRecognizer::new(provider, label, config)));
    }

    Ok(Arc::new(HttpRecognizer::from_config(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RecognitionRequest {
        RecognitionRequest {
            system_prompt: "Extract: total".into(),
            instruction: "Extract the requested fields from this image.".into(),
            image_base64: "AAAA".into(),
            image_mime: "image/png".into(),
        }
    }

    #[test]
    fn request_body_carries_prompt_instruction_and_image() {
        let body = build_request_body("gpt-4.1-mini", 1000, None, &request());
        assert_eq!(body["model"], "gpt-4.1-mini");
        assert_eq!(body["max_tokens"], 1000);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "Extract: total");
        let parts = &body["messages"][1]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn request_body_includes_temperature_when_set() {
        let body = build_request_body("m", 10, Some(0.5), &request());
        assert_eq!(body["temperature"], 0.5);
    }

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc…");
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = ExtractionConfig::builder()
            .api_key("sk-secret")
            .build()
            .unwrap();
        let recognizer = HttpRecognizer::from_config(&config).unwrap();
        let printed = format!("{recognizer:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn default_resolution_is_http() {
        let config = ExtractionConfig::builder().api_key("k").build().unwrap();
        let recognizer = resolve_recognizer(&config).unwrap();
        assert!(recognizer.describe().contains("api.openai.com"));
    }
}
