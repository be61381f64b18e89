use crate::error::Result;
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageInput, StageMetrics, StageOutput};
use crate::provider::Embedder;
use crate::stages::extract::ExtractOutput;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub path: String,
    pub index: usize,
    pub text: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedOutput {
    pub embedder: String,
    pub model: String,
    pub items: Vec<EmbeddedChunk>,
}

/// Embed stage: one vector per chunk from the engine-wide embedder
pub struct EmbedStage {
    embedder: Arc<Embedder>,
}

impl EmbedStage {
    pub fn new(embedder: Arc<Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl StageHandler for EmbedStage {
    fn stage(&self) -> Stage {
        Stage::Embed
    }

    fn config(&self, _ctx: &StageContext) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("embedder".to_string(), self.embedder.provider_name().to_string()),
            ("model".to_string(), self.embedder.model().to_string()),
        ])
    }

    async fn execute(&self, input: StageInput, ctx: &StageContext) -> Result<StageOutput> {
        let extracted: ExtractOutput = bincode::deserialize(&input.payload)?;
        let texts: Vec<String> = extracted.chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;

        let items: Vec<EmbeddedChunk> = extracted
            .chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk {
                path: chunk.path,
                index: chunk.index,
                text: chunk.text,
                vector,
            })
            .collect();

        info!(
            job_id = %ctx.job_id,
            embedder = self.embedder.provider_name(),
            model = self.embedder.model(),
            vectors = items.len(),
            "embedded chunks"
        );

        let output = EmbedOutput {
            embedder: self.embedder.provider_name().to_string(),
            model: self.embedder.model().to_string(),
            items,
        };
        Ok(StageOutput {
            metrics: StageMetrics {
                items_in: texts.len(),
                items_out: output.items.len(),
                skipped: 0,
            },
            cache_data: bincode::serialize(&output)?,
        })
    }
}
