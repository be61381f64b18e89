//! OpenRouter (aggregator over many upstream models, OpenAI-compatible)

use super::{CompletionRequest, OpenAiCompatibleClient, Provider, ProviderError};
use async_trait::async_trait;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterProvider {
    client: OpenAiCompatibleClient,
}

impl OpenRouterProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client: OpenAiCompatibleClient::new("openrouter", http, base_url)
                .with_header("X-Title", "repowiki"),
        }
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: Option<&str>,
    ) -> Result<String, ProviderError> {
        self.client.chat(request, credential).await
    }

    /// OpenRouter routes chat models only
    async fn embed(
        &self,
        _texts: &[String],
        _model: &str,
        _credential: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Rejected {
            provider: "openrouter".to_string(),
            status: 400,
            message: "embeddings are not available through openrouter".to_string(),
        })
    }
}
