//! Process-wide collaborator handles, built once and passed down by reference.

use crate::core::config::Config;
use crate::core::error::PipelineError;
use crate::services::completion::CompletionService;
use crate::services::llm::{create_llm, ModelTier};
use crate::services::retry::RetryPolicy;
use crate::services::speech::{Aligner, HttpSpeechClient, SpeechConfig, SpeechSynthesizer, VoiceConverter};
use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

type Factory<T> = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<T>>> + Send + Sync>;

/// A heavy collaborator that is configured up front and brought up on first
/// `acquire`. Failed attempts are not remembered, so a later call retries.
pub struct ServiceSlot<T: ?Sized> {
    name: &'static str,
    factory: Factory<T>,
    handle: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized + Send + Sync + 'static> ServiceSlot<T> {
    pub fn new<F, Fut>(name: &'static str, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<T>>> + Send + 'static,
    {
        Self {
            name,
            factory: Box::new(move || -> BoxFuture<'static, Result<Arc<T>>> { Box::pin(factory()) }),
            handle: Mutex::new(None),
        }
    }

    /// Slot that hands out an existing handle.
    pub fn ready(name: &'static str, handle: Arc<T>) -> Self {
        Self {
            name,
            factory: Box::new(|| -> BoxFuture<'static, Result<Arc<T>>> {
                Box::pin(async { Err(anyhow!("factory not used")) })
            }),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Slot whose `acquire` always fails.
    pub fn unavailable(name: &'static str, reason: &'static str) -> Self {
        Self::new(name, move || async move { Err::<Arc<T>, _>(anyhow!(reason)) })
    }

    pub async fn acquire(&self) -> Result<Arc<T>, PipelineError> {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }
        match (self.factory)().await {
            Ok(handle) => {
                info!("Service '{}' acquired", self.name);
                *guard = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                warn!("Service '{}' failed to start: {:#}", self.name, e);
                Err(PipelineError::ServiceUnavailable {
                    name: self.name.to_string(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    pub async fn release(&self) {
        if self.handle.lock().await.take().is_some() {
            info!("Service '{}' released", self.name);
        }
    }
}

pub struct Services {
    /// Recon, ambient, emotion and summary passes.
    pub fast: CompletionService,
    /// Patches and script generation.
    pub powerful: CompletionService,
    pub speech: ServiceSlot<dyn SpeechSynthesizer>,
    pub aligner: ServiceSlot<dyn Aligner>,
    pub converter: ServiceSlot<dyn VoiceConverter>,
    pub speech_retry: RetryPolicy,
}

fn http_slot<T: ?Sized + Send + Sync + 'static>(
    name: &'static str,
    config: &SpeechConfig,
    cast: fn(HttpSpeechClient) -> Arc<T>,
) -> ServiceSlot<T> {
    let config = config.clone();
    ServiceSlot::new(name, move || {
        let config = config.clone();
        async move {
            let client = HttpSpeechClient::connect(&config).await?;
            Ok::<_, anyhow::Error>(cast(client))
        }
    })
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        let policy = RetryPolicy::new(config.llm.retry_count, config.llm.retry_delay_seconds);
        let fast = CompletionService::new(create_llm(&config.llm, ModelTier::Fast)?, policy);
        let powerful = CompletionService::new(create_llm(&config.llm, ModelTier::Powerful)?, policy);

        Ok(Self {
            fast,
            powerful,
            speech: http_slot("speech", &config.speech, |c| Arc::new(c) as Arc<dyn SpeechSynthesizer>),
            aligner: http_slot("aligner", &config.speech, |c| Arc::new(c) as Arc<dyn Aligner>),
            converter: http_slot("converter", &config.speech, |c| Arc::new(c) as Arc<dyn VoiceConverter>),
            speech_retry: RetryPolicy::new(config.speech.retry_count, config.llm.retry_delay_seconds),
        })
    }

    /// Completion only; every speech slot reports unavailable.
    pub fn new(fast: CompletionService, powerful: CompletionService) -> Self {
        Self {
            fast,
            powerful,
            speech: ServiceSlot::unavailable("speech", "not configured"),
            aligner: ServiceSlot::unavailable("aligner", "not configured"),
            converter: ServiceSlot::unavailable("converter", "not configured"),
            speech_retry: RetryPolicy::default(),
        }
    }

    pub fn with_speech(mut self, speech: Arc<dyn SpeechSynthesizer>, aligner: Arc<dyn Aligner>) -> Self {
        self.speech = ServiceSlot::ready("speech", speech);
        self.aligner = ServiceSlot::ready("aligner", aligner);
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn VoiceConverter>) -> Self {
        self.converter = ServiceSlot::ready("converter", converter);
        self
    }

    pub fn with_speech_retry(mut self, policy: RetryPolicy) -> Self {
        self.speech_retry = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Backend: Send + Sync {
        fn id(&self) -> usize;
    }

    struct Fixed(usize);
    impl Backend for Fixed {
        fn id(&self) -> usize {
            self.0
        }
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let slot: ServiceSlot<dyn Backend> = ServiceSlot::new("backend", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Arc::new(Fixed(n)) as Arc<dyn Backend>) }
        });

        let a = slot.acquire().await.unwrap();
        let b = slot.acquire().await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        slot.release().await;
        let c = slot.acquire().await.unwrap();
        assert_eq!(c.id(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_typed_and_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let slot: ServiceSlot<dyn Backend> = ServiceSlot::new("flaky", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(anyhow!("cold start"))
                } else {
                    Ok(Arc::new(Fixed(n)) as Arc<dyn Backend>)
                }
            }
        });

        match slot.acquire().await {
            Err(PipelineError::ServiceUnavailable { name, .. }) => assert_eq!(name, "flaky"),
            _ => panic!("expected ServiceUnavailable"),
        }
        assert!(slot.acquire().await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
