use crate::core::error::ServiceError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Sampling temperature; provider default when unset.
    #[serde(default)]
    pub temperature: Option<f32>,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    /// Cheaper model for the extraction passes; falls back to `model`.
    pub fast_model: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub fast_model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub fast_model: Option<String>,
}

fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    2
}

/// Which model of the configured provider to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Fast,
    Powerful,
}

fn pick<'a>(tier: ModelTier, model: &'a str, fast_model: Option<&'a str>) -> &'a str {
    match tier {
        ModelTier::Fast => fast_model.unwrap_or(model),
        ModelTier::Powerful => model,
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;
}

pub fn create_llm(config: &LlmConfig, tier: ModelTier) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "gemini" => {
            let cfg = config.gemini.as_ref().context("Gemini config missing")?;
            let model = pick(tier, &cfg.model, cfg.fast_model.as_deref());
            Ok(Arc::new(GeminiClient::new(&cfg.api_key, model, config.temperature)))
        }
        "ollama" => {
            let cfg = config.ollama.as_ref().context("Ollama config missing")?;
            let model = pick(tier, &cfg.model, cfg.fast_model.as_deref());
            Ok(Arc::new(OllamaClient::new(&cfg.base_url, model, config.temperature)))
        }
        "openai" => {
            let cfg = config.openai.as_ref().context("OpenAI config missing")?;
            let model = pick(tier, &cfg.model, cfg.fast_model.as_deref());
            Ok(Arc::new(OpenAIClient::new(
                &cfg.api_key,
                model,
                cfg.base_url.as_deref(),
                config.temperature,
            )))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.provider)),
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success HTTP answer onto the retry taxonomy.
pub(crate) fn classify_status(
    provider: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> ServiceError {
    let message = format!("{} API error ({}): {}", provider, status, body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        ServiceError::RateLimited {
            message,
            retry_after: parse_retry_after(headers),
        }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ServiceError::Transport(message)
    } else {
        ServiceError::Rejected(message)
    }
}

pub(crate) fn transport(provider: &str, err: reqwest::Error) -> anyhow::Error {
    ServiceError::Transport(format!("{} request failed: {}", provider, err)).into()
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str, temperature: Option<f32>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

impl GeminiResponse {
    fn into_text(self) -> Result<String, ServiceError> {
        if let Some(err) = self.error {
            return Err(ServiceError::Transport(format!("Gemini API returned error: {}", err.message)));
        }

        let first = self
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ServiceError::Transport("Gemini response has no candidates".to_string()))?;

        if let Some(part) = first.content.and_then(|c| c.parts.into_iter().next()) {
            return Ok(part.text);
        }

        let reason = first.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
        match reason.as_str() {
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "RECITATION" => Err(ServiceError::Rejected(
                format!("Gemini refused the request. Finish reason: {}", reason),
            )),
            _ => Err(ServiceError::Transport(format!(
                "Gemini response empty. Finish reason: {}",
                reason
            ))),
        }
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: user.to_string() }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart { text: system.to_string() }],
            }),
            generation_config: self.temperature.map(|temperature| GeminiGenerationConfig { temperature }),
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| transport("Gemini", e))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let response_text = resp.text().await.map_err(|e| transport("Gemini", e))?;
        if !status.is_success() {
            return Err(classify_status("Gemini", status, &headers, &response_text).into());
        }

        let result: GeminiResponse = serde_json::from_str(&response_text).map_err(|e| {
            ServiceError::Transport(format!("Failed to parse Gemini response: {}. Body: {}", e, response_text))
        })?;
        Ok(result.into_text()?)
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str, temperature: Option<f32>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

fn messages(system: &str, user: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage { role: "system".to_string(), content: system.to_string() },
        ChatMessage { role: "user".to_string(), content: user.to_string() },
    ]
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: messages(system, user),
            stream: false,
            options: self.temperature.map(|temperature| OllamaOptions { temperature }),
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| transport("Ollama", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let headers = resp.headers().clone();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(classify_status("Ollama", status, &headers, &error_text).into());
        }

        let result: OllamaResponse = resp.json().await.map_err(|e| transport("Ollama", e))?;
        Ok(result.message.content)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    temperature: Option<f32>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>, temperature: Option<f32>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature,
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: messages(system, user),
            temperature: self.temperature,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| transport("OpenAI", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let headers = resp.headers().clone();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(classify_status("OpenAI", status, &headers, &error_text).into());
        }

        let result: OpenAIResponse = resp.json().await.map_err(|e| transport("OpenAI", e))?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::Transport("OpenAI response empty or missing content".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_gemini_safety_block_is_rejected() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(result.into_text(), Err(ServiceError::Rejected(_))));
    }

    #[test]
    fn test_gemini_empty_parts_is_transient() {
        let json = r#"{
            "candidates": [
                {
                    "content": { "role": "model" },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(result.into_text(), Err(ServiceError::Transport(_))));
    }

    #[test]
    fn test_gemini_response_parsing_success() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "Hello world" }
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.into_text().unwrap(), "Hello world");
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello there"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.choices[0].message.content.as_deref(), Some("Hello there"));
    }

    #[test]
    fn test_status_classification() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));

        match classify_status("X", StatusCode::TOO_MANY_REQUESTS, &headers, "quota") {
            ServiceError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected {:?}", other),
        }

        let empty = HeaderMap::new();
        assert!(matches!(
            classify_status("X", StatusCode::BAD_GATEWAY, &empty, ""),
            ServiceError::Transport(_)
        ));
        assert!(matches!(
            classify_status("X", StatusCode::UNAUTHORIZED, &empty, ""),
            ServiceError::Rejected(_)
        ));
    }

    #[test]
    fn test_temperature_is_sent_only_when_configured() {
        let unset = OpenAIRequest {
            model: "m".to_string(),
            messages: messages("s", "u"),
            temperature: None,
        };
        assert!(!serde_json::to_string(&unset).unwrap().contains("temperature"));

        let set = OllamaRequest {
            model: "m".to_string(),
            messages: messages("s", "u"),
            stream: false,
            options: Some(OllamaOptions { temperature: 0.5 }),
        };
        assert!(serde_json::to_string(&set).unwrap().contains(r#""options":{"temperature":0.5}"#));
    }

    #[test]
    fn test_fast_tier_falls_back_to_main_model() {
        assert_eq!(pick(ModelTier::Fast, "big", None), "big");
        assert_eq!(pick(ModelTier::Fast, "big", Some("small")), "small");
        assert_eq!(pick(ModelTier::Powerful, "big", Some("small")), "big");
    }
}
