use crate::core::error::ServiceError;
use crate::core::models::WordTiming;
use crate::services::llm::{classify_status, transport};
use crate::utils::audio::{decode_wav_bytes, PcmClip};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpeechConfig {
    /// Root of the self-hosted speech server (synthesis, alignment, conversion).
    pub base_url: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Lines rendered in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            language: default_language(),
            concurrency: default_concurrency(),
            retry_count: default_retry_count(),
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}
fn default_concurrency() -> usize {
    2
}
fn default_retry_count() -> usize {
    3
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice_reference: &Path) -> Result<PcmClip>;
}

#[async_trait]
pub trait Aligner: Send + Sync {
    async fn align(&self, text: &str, audio: &Path) -> Result<Vec<WordTiming>>;
}

#[async_trait]
pub trait VoiceConverter: Send + Sync {
    /// Returns `source` re-voiced in the style of `style_reference`.
    async fn convert(&self, source: &Path, style_reference: &Path) -> Result<PcmClip>;
}

/// Client for a speech server exposing `/health`, `/synthesize`, `/align`
/// and `/convert`.
#[derive(Debug, Clone)]
pub struct HttpSpeechClient {
    base_url: Url,
    language: String,
    client: Client,
}

#[derive(Deserialize)]
struct AlignResponse {
    #[serde(default)]
    words: Vec<AlignedWord>,
}

#[derive(Deserialize)]
struct AlignedWord {
    word: String,
    start: f64,
    end: f64,
}

fn seconds_to_ms(s: f64) -> u64 {
    (s.max(0.0) * 1000.0).round() as u64
}

impl HttpSpeechClient {
    pub fn new(config: &SpeechConfig) -> Result<Self> {
        let raw = config
            .base_url
            .as_deref()
            .context("speech.base_url is not configured")?;
        // Trailing slash so `join` appends instead of replacing the last segment.
        let base_url = Url::parse(&format!("{}/", raw.trim_end_matches('/')))
            .with_context(|| format!("Invalid speech.base_url: {}", raw))?;
        Ok(Self {
            base_url,
            language: config.language.clone(),
            client: Client::new(),
        })
    }

    /// Builds the client and checks the server answers.
    pub async fn connect(config: &SpeechConfig) -> Result<Self> {
        let client = Self::new(config)?;
        let url = client.endpoint("health")?;
        let resp = client
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Speech server not reachable at {}", url))?;
        if !resp.status().is_success() {
            return Err(anyhow!("Speech server health check failed: {}", resp.status()));
        }
        info!("Speech server ready at {}", client.base_url);
        Ok(client)
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        Ok(self.base_url.join(name)?)
    }

    async fn file_part(path: &Path) -> Result<multipart::Part> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());
        Ok(multipart::Part::bytes(bytes)
            .file_name(name)
            .mime_str("audio/wav")
            .context("Invalid mime type")?)
    }

    async fn post(&self, name: &str, form: multipart::Form) -> Result<Vec<u8>> {
        let url = self.endpoint(name)?;
        debug!("POST {}", url);
        let resp = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport("Speech", e))?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status("Speech", status, &headers, &body).into());
        }
        Ok(resp.bytes().await.map_err(|e| transport("Speech", e))?.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechClient {
    async fn synthesize(&self, text: &str, voice_reference: &Path) -> Result<PcmClip> {
        let form = multipart::Form::new()
            .text("text", text.to_string())
            .text("language", self.language.clone())
            .part("reference", Self::file_part(voice_reference).await?);
        let bytes = self.post("synthesize", form).await?;
        decode_wav_bytes(&bytes)
            .map_err(|e| ServiceError::Transport(format!("Synthesis returned bad audio: {}", e)).into())
    }
}

#[async_trait]
impl Aligner for HttpSpeechClient {
    async fn align(&self, text: &str, audio: &Path) -> Result<Vec<WordTiming>> {
        let form = multipart::Form::new()
            .text("text", text.to_string())
            .text("language", self.language.clone())
            .part("audio", Self::file_part(audio).await?);
        let bytes = self.post("align", form).await?;
        let parsed: AlignResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ServiceError::Transport(format!("Alignment returned bad JSON: {}", e)))?;
        Ok(parsed
            .words
            .into_iter()
            .map(|w| WordTiming {
                word: w.word,
                start_ms: seconds_to_ms(w.start),
                end_ms: seconds_to_ms(w.end),
            })
            .collect())
    }
}

#[async_trait]
impl VoiceConverter for HttpSpeechClient {
    async fn convert(&self, source: &Path, style_reference: &Path) -> Result<PcmClip> {
        let form = multipart::Form::new()
            .part("source", Self::file_part(source).await?)
            .part("reference", Self::file_part(style_reference).await?);
        let bytes = self.post("convert", form).await?;
        decode_wav_bytes(&bytes)
            .map_err(|e| ServiceError::Transport(format!("Conversion returned bad audio: {}", e)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_keep_base_path() {
        let config = SpeechConfig {
            base_url: Some("http://localhost:9000/api".to_string()),
            ..Default::default()
        };
        let client = HttpSpeechClient::new(&config).unwrap();
        assert_eq!(
            client.endpoint("align").unwrap().as_str(),
            "http://localhost:9000/api/align"
        );
    }

    #[test]
    fn test_missing_base_url_is_an_error() {
        assert!(HttpSpeechClient::new(&SpeechConfig::default()).is_err());
    }

    #[test]
    fn test_alignment_seconds_become_millis() {
        let json = r#"{"words": [{"word": "Hello", "start": 0.12, "end": 0.5}]}"#;
        let parsed: AlignResponse = serde_json::from_str(json).unwrap();
        assert_eq!(seconds_to_ms(parsed.words[0].start), 120);
        assert_eq!(seconds_to_ms(parsed.words[0].end), 500);
    }
}
