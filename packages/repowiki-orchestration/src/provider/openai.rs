//! OpenAI and OpenAI-compatible chat completion APIs

use super::{require_credential, CompletionRequest, Provider, ProviderError};
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Shared client for `/chat/completions` and `/embeddings` style APIs
pub struct OpenAiCompatibleClient {
    name: &'static str,
    http: reqwest::Client,
    base_url: String,
    extra_headers: Vec<(&'static str, String)>,
}

impl OpenAiCompatibleClient {
    pub fn new(name: &'static str, http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            name,
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.extra_headers.push((name, value.into()));
        self
    }

    async fn post(&self, path: &str, key: &str, body: Value) -> Result<Value, ProviderError> {
        let mut request = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(key)
            .json(&body);
        for (name, value) in &self.extra_headers {
            request = request.header(*name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(self.name, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(self.name, e))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(self.name, status.as_u16(), &text));
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::malformed(self.name, e.to_string()))
    }

    pub async fn chat(
        &self,
        request: &CompletionRequest,
        credential: Option<&str>,
    ) -> Result<String, ProviderError> {
        let key = require_credential(self.name, credential)?;
        let value = self.post("chat/completions", key, chat_body(request)).await?;
        parse_chat(self.name, &value)
    }

    pub async fn embeddings(
        &self,
        texts: &[String],
        model: &str,
        credential: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let key = require_credential(self.name, credential)?;
        let value = self
            .post("embeddings", key, json!({ "model": model, "input": texts }))
            .await?;
        parse_embeddings(self.name, &value)
    }
}

pub(crate) fn chat_body(request: &CompletionRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": request.prompt }));
    json!({
        "model": request.model,
        "messages": messages,
        "temperature": request.temperature,
    })
}

pub(crate) fn parse_chat(provider: &str, value: &Value) -> Result<String, ProviderError> {
    // Some routers return 200 with an error object
    if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
        let status = value
            .pointer("/error/code")
            .and_then(Value::as_u64)
            .unwrap_or(400) as u16;
        return Err(ProviderError::from_status(
            provider,
            status,
            &json!({ "message": message }).to_string(),
        ));
    }
    let content = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::malformed(provider, "missing choices[0].message.content"))?;
    if content.trim().is_empty() {
        return Err(ProviderError::malformed(provider, "empty completion"));
    }
    Ok(content.to_string())
}

pub(crate) fn parse_embeddings(provider: &str, value: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = value
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::malformed(provider, "missing data"))?;

    let mut indexed: Vec<(u64, Vec<f32>)> = data
        .iter()
        .enumerate()
        .map(|(pos, item)| {
            let index = item
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(pos as u64);
            let vector = item
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| ProviderError::malformed(provider, "item without embedding"))?
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect();
            Ok((index, vector))
        })
        .collect::<Result<_, ProviderError>>()?;
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

pub struct OpenAiProvider {
    client: OpenAiCompatibleClient,
}

impl OpenAiProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client: OpenAiCompatibleClient::new("openai", http, base_url),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: Option<&str>,
    ) -> Result<String, ProviderError> {
        self.client.chat(request, credential).await
    }

    async fn embed(
        &self,
        texts: &[String],
        model: &str,
        credential: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.client.embeddings(texts, model, credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_body() {
        let req = CompletionRequest::new("gpt-4o", "Summarize").with_system("Be brief");
        let body = chat_body(&req);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Summarize");
    }

    #[test]
    fn test_parse_chat() {
        let value = json!({ "choices": [{ "message": { "role": "assistant", "content": "ok" } }] });
        assert_eq!(parse_chat("openai", &value).unwrap(), "ok");

        let empty = json!({ "choices": [] });
        assert!(matches!(
            parse_chat("openai", &empty).unwrap_err(),
            ProviderError::Malformed { .. }
        ));
    }

    #[test]
    fn test_parse_chat_error_object() {
        let value = json!({ "error": { "code": 429, "message": "Rate limit exceeded" } });
        let err = parse_chat("openrouter", &value).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.provider(), "openrouter");
    }

    #[test]
    fn test_parse_embeddings_reorders_by_index() {
        let value = json!({
            "data": [
                { "index": 1, "embedding": [1.0] },
                { "index": 0, "embedding": [0.0] }
            ]
        });
        let vectors = parse_embeddings("openai", &value).unwrap();
        assert_eq!(vectors, vec![vec![0.0], vec![1.0]]);
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_error() {
        let provider = OpenAiProvider::new(reqwest::Client::new());
        let err = provider
            .embed(&["x".to_string()], "text-embedding-3-small", Some(""))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth { .. }));
    }
}
