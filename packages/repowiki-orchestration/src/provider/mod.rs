//! Provider adapter
//!
//! One `Provider` implementation per LLM backend, selected by the job's bound
//! provider name. Every backend reports failures through `ProviderError`, so
//! stages never special-case a vendor.

pub mod google;
pub mod local;
pub mod openai;
pub mod openrouter;

use crate::config::RetryPolicy;
use crate::error::OrchestratorError;
use crate::job::CredentialRef;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub use google::GoogleProvider;
pub use local::LocalProvider;
pub use openai::{OpenAiCompatibleClient, OpenAiProvider};
pub use openrouter::OpenRouterProvider;

/// Normalized provider failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{provider}: authentication failed: {message}")]
    Auth { provider: String, message: String },

    #[error("{provider}: rate limited: {message}")]
    RateLimited { provider: String, message: String },

    #[error("{provider}: timed out: {message}")]
    Timeout { provider: String, message: String },

    #[error("{provider}: upstream unavailable ({status}): {message}")]
    Unavailable {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: request rejected ({status}): {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: malformed response: {message}")]
    Malformed { provider: String, message: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Unavailable { .. }
        )
    }

    pub fn provider(&self) -> &str {
        match self {
            ProviderError::Auth { provider, .. }
            | ProviderError::RateLimited { provider, .. }
            | ProviderError::Timeout { provider, .. }
            | ProviderError::Unavailable { provider, .. }
            | ProviderError::Rejected { provider, .. }
            | ProviderError::Malformed { provider, .. } => provider,
        }
    }

    pub fn missing_credential(provider: &str) -> Self {
        ProviderError::Auth {
            provider: provider.to_string(),
            message: "no API key configured".to_string(),
        }
    }

    pub fn malformed(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::Malformed {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Map an HTTP status + body onto the taxonomy
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let provider = provider.to_string();
        let message = summarize_body(body);
        match status {
            401 | 403 => ProviderError::Auth { provider, message },
            408 => ProviderError::Timeout { provider, message },
            429 => ProviderError::RateLimited { provider, message },
            500..=599 => ProviderError::Unavailable {
                provider,
                status,
                message,
            },
            _ => ProviderError::Rejected {
                provider,
                status,
                message,
            },
        }
    }

    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        let provider = provider.to_string();
        if err.is_timeout() {
            ProviderError::Timeout {
                provider,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            ProviderError::from_status(&provider, status.as_u16(), &err.to_string())
        } else if err.is_decode() {
            ProviderError::Malformed {
                provider,
                message: err.to_string(),
            }
        } else {
            // connect / request building failures
            ProviderError::Unavailable {
                provider,
                status: 0,
                message: err.to_string(),
            }
        }
    }
}

impl From<ProviderError> for OrchestratorError {
    fn from(err: ProviderError) -> Self {
        let provider = err.provider().to_string();
        let message = err.to_string();
        match err {
            ProviderError::Auth { .. } => OrchestratorError::ProviderAuth { provider, message },
            e if e.is_transient() => OrchestratorError::ProviderTransient { provider, message },
            _ => OrchestratorError::ProviderResponse { provider, message },
        }
    }
}

/// Pull a short message out of an error body (JSON `error.message` if present)
fn summarize_body(body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.pointer("/message"))
                .or_else(|| v.get("error").filter(|e| e.is_string()))
                .and_then(|m| m.as_str().map(str::to_string))
        });
    let text = from_json.unwrap_or_else(|| body.trim().to_string());
    text.chars().take(200).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            temperature: 0.2,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// LLM capability interface
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether calls need an API key
    fn requires_credential(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: Option<&str>,
    ) -> Result<String, ProviderError>;

    /// One vector per input text, in input order
    async fn embed(
        &self,
        texts: &[String],
        model: &str,
        credential: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, ProviderError>;
}

pub(crate) fn require_credential<'a>(
    provider: &str,
    credential: Option<&'a str>,
) -> Result<&'a str, ProviderError> {
    credential
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ProviderError::missing_credential(provider))
}

/// Providers by name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// google, openai, openrouter and local
    pub fn with_defaults() -> std::result::Result<Self, OrchestratorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(OrchestratorError::config)?;

        let mut registry = Self::new();
        registry.register(Arc::new(GoogleProvider::new(http.clone())));
        registry.register(Arc::new(OpenAiProvider::new(http.clone())));
        registry.register(Arc::new(OpenRouterProvider::new(http)));
        registry.register(Arc::new(LocalProvider::new()));
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let backoff = policy.base_backoff.saturating_mul(1u32 << attempt.min(16));
                warn!(
                    operation,
                    provider = e.provider(),
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient provider error, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Engine-wide embedder used by the embed stage
pub struct Embedder {
    provider: Arc<dyn Provider>,
    model: String,
    credential: CredentialRef,
    retry: RetryPolicy,
    batch_size: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, retry: RetryPolicy) -> Self {
        let credential = CredentialRef::default_for(provider.name());
        Self {
            provider,
            model: model.into(),
            credential,
            retry,
            batch_size: 64,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn embed(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, OrchestratorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let credential = self.credential.resolve()?;
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let out = with_retry(self.retry, "embed", || {
                self.provider.embed(batch, &self.model, credential.as_deref())
            })
            .await?;
            if out.len() != batch.len() {
                return Err(ProviderError::malformed(
                    self.provider.name(),
                    format!("expected {} embeddings, got {}", batch.len(), out.len()),
                )
                .into());
            }
            vectors.extend(out);
        }
        Ok(vectors)
    }
}
