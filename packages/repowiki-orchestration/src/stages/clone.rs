use crate::cache::Fingerprint;
use crate::error::{OrchestratorError, Result};
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageInput, StageMetrics, StageOutput, COMMIT_KEY};
use crate::stages::fetcher::RepoFetcher;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Clone stage
///
/// `prepare` resolves the repository's current revision; the cache key is
/// `(url, repo_type, revision)`, so an unchanged remote never reclones.
pub struct CloneStage {
    fetcher: Arc<dyn RepoFetcher>,
}

impl CloneStage {
    pub fn new(fetcher: Arc<dyn RepoFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl StageHandler for CloneStage {
    fn stage(&self) -> Stage {
        Stage::Clone
    }

    fn config(&self, _ctx: &StageContext) -> BTreeMap<String, String> {
        BTreeMap::from([("fetcher".to_string(), self.fetcher.name().to_string())])
    }

    async fn prepare(&self, mut input: StageInput, ctx: &StageContext) -> Result<StageInput> {
        let revision = self.fetcher.resolve_revision(&ctx.repo).await?;
        input.fingerprint = Fingerprint::builder()
            .str_field(&ctx.repo.url)
            .str_field(ctx.repo.repo_type.as_str())
            .str_field(&revision)
            .finish();
        input
            .metadata
            .insert(COMMIT_KEY.to_string(), Value::from(revision.clone()));
        input.payload = revision.into_bytes();
        Ok(input)
    }

    async fn execute(&self, input: StageInput, ctx: &StageContext) -> Result<StageOutput> {
        let revision = String::from_utf8_lossy(&input.payload).into_owned();
        let snapshot = self.fetcher.fetch(&ctx.repo, &revision).await?;
        // The cache key and the job's commit both name `revision`
        if snapshot.revision != revision {
            warn!(
                job_id = %ctx.job_id,
                expected = %revision,
                actual = %snapshot.revision,
                "fetched revision differs from resolved revision"
            );
            return Err(OrchestratorError::RevisionChanged {
                expected: revision,
                actual: snapshot.revision,
            });
        }

        info!(
            job_id = %ctx.job_id,
            revision = %snapshot.revision,
            files = snapshot.files.len(),
            bytes = snapshot.total_bytes(),
            "repository fetched"
        );

        let metrics = StageMetrics {
            items_in: 1,
            items_out: snapshot.files.len(),
            skipped: 0,
        };
        Ok(StageOutput {
            cache_data: bincode::serialize(&snapshot)?,
            metrics,
        })
    }
}
