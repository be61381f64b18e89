//! Google Generative Language API (Gemini)

use super::{require_credential, CompletionRequest, Provider, ProviderError};
use async_trait::async_trait;
use serde_json::{json, Value};

const NAME: &str = "google";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleProvider {
    http: reqwest::Client,
    base_url: String,
}

impl GoogleProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, path: &str, key: &str, body: Value) -> Result<Value, ProviderError> {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(NAME, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(NAME, e))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(NAME, status.as_u16(), &text));
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::malformed(NAME, e.to_string()))
    }
}

fn model_path(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

pub(crate) fn completion_body(request: &CompletionRequest) -> Value {
    let mut body = json!({
        "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
        "generationConfig": { "temperature": request.temperature },
    });
    if let Some(system) = &request.system {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    body
}

pub(crate) fn parse_completion(value: &Value) -> Result<String, ProviderError> {
    let parts = value
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            let reason = value
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("no candidates");
            ProviderError::malformed(NAME, reason)
        })?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        return Err(ProviderError::malformed(NAME, "empty completion"));
    }
    Ok(text)
}

pub(crate) fn parse_embeddings(value: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let embeddings = value
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::malformed(NAME, "missing embeddings"))?;
    embeddings
        .iter()
        .map(|e| {
            e.get("values")
                .and_then(Value::as_array)
                .map(|vals| {
                    vals.iter()
                        .filter_map(Value::as_f64)
                        .map(|v| v as f32)
                        .collect()
                })
                .ok_or_else(|| ProviderError::malformed(NAME, "embedding without values"))
        })
        .collect()
}

#[async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: Option<&str>,
    ) -> Result<String, ProviderError> {
        let key = require_credential(NAME, credential)?;
        let path = format!("{}:generateContent", model_path(&request.model));
        let value = self.post(&path, key, completion_body(request)).await?;
        parse_completion(&value)
    }

    async fn embed(
        &self,
        texts: &[String],
        model: &str,
        credential: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let key = require_credential(NAME, credential)?;
        let model = model_path(model);
        let requests: Vec<Value> = texts
            .iter()
            .map(|t| json!({ "model": model, "content": { "parts": [{ "text": t }] } }))
            .collect();
        let path = format!("{}:batchEmbedContents", model);
        let value = self
            .post(&path, key, json!({ "requests": requests }))
            .await?;
        parse_embeddings(&value)
    }
}
