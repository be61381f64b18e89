//! Offline provider
//!
//! Deterministic, credential-free embeddings and completions. Used as the
//! default in development and by the test suite; vectors are stable across
//! processes so cache hits survive restarts.

use super::{CompletionRequest, Provider, ProviderError};
use async_trait::async_trait;

/// Dimension of hash embeddings
pub const LOCAL_EMBEDDING_DIM: usize = 256;

#[derive(Debug, Default, Clone)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }
}

/// Hash `text` into a fixed-size vector with components in `[0, 1)`.
pub fn hash_embedding(model: &str, text: &str) -> Vec<f32> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(model.as_bytes());
    hasher.update(&[0]);
    hasher.update(text.as_bytes());

    let mut bytes = [0u8; LOCAL_EMBEDDING_DIM * 4];
    hasher.finalize_xof().fill(&mut bytes);

    bytes
        .chunks_exact(4)
        .map(|c| {
            let v = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
            (v % 1000) as f32 / 1000.0
        })
        .collect()
}

fn render_template(request: &CompletionRequest) -> String {
    let mut title = "Overview".to_string();
    let mut bullets = Vec::new();
    for line in request.prompt.lines() {
        if line.trim() == "Excerpts:" {
            break;
        }
        if let Some(rest) = line.strip_prefix("Section: ") {
            title = rest.trim().to_string();
        } else if let Some(item) = line.strip_prefix("- ") {
            bullets.push(item.trim());
        }
    }

    let digest = blake3::hash(request.prompt.as_bytes());
    let mut out = format!("# {}\n\n", title);
    if bullets.is_empty() {
        out.push_str("This section has no source files.\n");
    } else {
        out.push_str("Files covered:\n\n");
        for item in bullets {
            out.push_str("- `");
            out.push_str(item);
            out.push_str("`\n");
        }
    }
    out.push_str(&format!("\n<!-- local:{} -->\n", &digest.to_hex()[..12]));
    out
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn requires_credential(&self) -> bool {
        false
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        _credential: Option<&str>,
    ) -> Result<String, ProviderError> {
        Ok(render_template(request))
    }

    async fn embed(
        &self,
        texts: &[String],
        model: &str,
        _credential: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| hash_embedding(model, t)).collect())
    }
}
