use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::llm::LlmConfig;
use crate::services::speech::SpeechConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    pub llm: LlmConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub scenario: ScenarioConfig,

    #[serde(default)]
    pub timeline: TimelineConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScenarioConfig {
    /// Speaker label reserved for the narrator voice.
    #[serde(default = "default_narrator_label")]
    pub narrator_label: String,
    /// Emotion given to any line the emotion stage leaves unmapped.
    #[serde(default = "default_neutral_emotion")]
    pub neutral_emotion: String,

    #[serde(default = "default_true")]
    pub checkpoint_script: bool,
    #[serde(default = "default_true")]
    pub checkpoint_ambient: bool,
    /// Off by default: the emotion pass is cheap to redo.
    #[serde(default)]
    pub checkpoint_emotion: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            narrator_label: default_narrator_label(),
            neutral_emotion: default_neutral_emotion(),
            checkpoint_script: true,
            checkpoint_ambient: true,
            checkpoint_emotion: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimelineConfig {
    /// Tried in order when a line's audio is not under its expected name.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
        }
    }
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_narrator_label() -> String {
    "Narrator".to_string()
}
fn default_neutral_emotion() -> String {
    "neutral".to_string()
}
fn default_true() -> bool {
    true
}
fn default_extensions() -> Vec<String> {
    vec![
        ".wav".to_string(),
        ".mp3".to_string(),
        ".ogg".to_string(),
        ".flac".to_string(),
    ]
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let yaml = r#"
llm:
  provider: gemini
  gemini:
    api_key: "k"
    model: "gemini-2.5-flash"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.input_folder, "input");
        assert_eq!(config.output_folder, "output");
        assert_eq!(config.llm.retry_count, 3);
        assert_eq!(config.scenario.narrator_label, "Narrator");
        assert!(config.scenario.checkpoint_script);
        assert!(config.scenario.checkpoint_ambient);
        assert!(!config.scenario.checkpoint_emotion);
        assert_eq!(config.timeline.extensions[0], ".wav");
        assert!(config.speech.base_url.is_none());
    }

    #[test]
    fn test_emotion_checkpoint_can_be_enabled() {
        let yaml = r#"
llm:
  provider: ollama
  ollama:
    base_url: "http://localhost:11434"
    model: "qwen3"
scenario:
  checkpoint_emotion: true
  narrator_label: "Рассказчик"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.scenario.checkpoint_emotion);
        assert_eq!(config.scenario.narrator_label, "Рассказчик");
        assert_eq!(config.scenario.neutral_emotion, "neutral");
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("config.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
