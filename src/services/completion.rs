use crate::core::error::PipelineError;
use crate::services::llm::LlmClient;
use crate::services::retry::{with_retry, RetryPolicy};
use crate::utils::text::extract_json;
use anyhow::Result;
use log::debug;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub const SYSTEM_JSON_ONLY: &str = "You are a literary assistant. Reply with valid JSON only.";

/// A reply shape the completion service can be asked for.
pub trait Structured: DeserializeOwned + Send {
    /// Stage label used in logs and validation errors.
    const STAGE: &'static str;

    /// JSON skeleton shown to the model.
    fn schema_hint() -> &'static str;

    /// Post-parse checks serde cannot express.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Completion collaborator: retries transport failures, then validates the
/// reply against `T` before handing it back.
#[derive(Debug, Clone)]
pub struct CompletionService {
    llm: Arc<dyn LlmClient>,
    policy: RetryPolicy,
}

impl CompletionService {
    pub fn new(llm: Arc<dyn LlmClient>, policy: RetryPolicy) -> Self {
        Self { llm, policy }
    }

    pub async fn complete<T: Structured>(&self, system: &str, prompt: &str) -> Result<T, PipelineError> {
        let llm = &self.llm;
        let reply = with_retry(&self.policy, T::STAGE, move || llm.chat(system, prompt))
            .await
            .map_err(|e| PipelineError::validation(T::STAGE, format!("{:#}", e)))?;
        parse_structured(&reply)
    }
}

pub fn parse_structured<T: Structured>(reply: &str) -> Result<T, PipelineError> {
    let json = extract_json(reply)
        .ok_or_else(|| PipelineError::validation(T::STAGE, "reply contains no JSON"))?;
    let value: T = serde_json::from_str(&json).map_err(|e| {
        debug!("[{}] unparsable reply: {}", T::STAGE, json);
        PipelineError::validation(T::STAGE, format!("schema mismatch: {}", e))
    })?;
    value
        .validate()
        .map_err(|reason| PipelineError::validation(T::STAGE, reason))?;
    Ok(value)
}
