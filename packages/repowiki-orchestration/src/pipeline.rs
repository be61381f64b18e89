//! Ingestion pipeline
//!
//! A fixed sequence `clone → extract → embed → generate`. Each stage turns the
//! previous stage's payload into its own, and every payload goes through the
//! artifact cache keyed by `(stage, input fingerprint, stage config)`.
//!
//! Payloads are bincode-encoded. Stages only put deterministic collections
//! (sorted `Vec`s, `BTreeMap`s) in them so that identical inputs produce
//! identical bytes, which keeps downstream fingerprints stable.

use crate::cache::{ArtifactCache, CacheKey, Fingerprint};
use crate::config::{ExtractConfig, RetryPolicy};
use crate::error::{OrchestratorError, Result};
use crate::job::{ProviderBinding, RepoType, Stage};
use crate::provider::{Embedder, ProviderRegistry};
use crate::stages::{
    CloneStage, EmbedStage, ExtractStage, GenerateStage, RepoFetcher, RepoRef, WikiOutput,
};
use async_trait::async_trait;
use repowiki_storage::{JobPatch, JobRecord, JobStatus, JobStore, UpdateOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

pub const COMMIT_KEY: &str = "commit";
pub const PAGES_KEY: &str = "pages";
pub const WIKI_KEY: &str = "wiki_key";

/// Per-job values shared by all stages
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: Uuid,
    pub repo: RepoRef,
    pub binding: ProviderBinding,
}

impl StageContext {
    pub fn from_record(record: &JobRecord) -> Result<Self> {
        let repo_type = RepoType::parse(&record.repo_type)?;
        Ok(Self {
            job_id: record.id,
            repo: RepoRef::new(record.repo_url.clone(), repo_type),
            binding: ProviderBinding::from_metadata(&record.metadata)?,
        })
    }
}

/// Stage input
pub struct StageInput {
    /// Previous stage's payload (empty for the first stage)
    pub payload: Vec<u8>,
    pub fingerprint: Fingerprint,
    /// Discovered during `prepare`; merged into job metadata
    pub metadata: Map<String, Value>,
}

impl StageInput {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            fingerprint: Fingerprint::of(&payload),
            payload,
            metadata: Map::new(),
        }
    }
}

/// Stage output
pub struct StageOutput {
    pub cache_data: Vec<u8>, // Serialized output (bincode)
    pub metrics: StageMetrics,
}

/// Stage metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub items_in: usize,
    pub items_out: usize,
    pub skipped: usize,
}

/// Stage handler trait (pluggable stages)
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    /// Configuration that changes this stage's output; part of the cache key
    fn config(&self, ctx: &StageContext) -> BTreeMap<String, String>;

    /// Settle the input fingerprint before the cache lookup
    async fn prepare(&self, input: StageInput, _ctx: &StageContext) -> Result<StageInput> {
        Ok(input)
    }

    /// Runs only on a cache miss
    async fn execute(&self, input: StageInput, ctx: &StageContext) -> Result<StageOutput>;
}

/// Writes progress labels onto the running job.
///
/// Every write is guarded on `running`; a conflict means this executor no
/// longer owns the job and the pipeline stops.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Option<Arc<dyn JobStore>>,
    job_id: Uuid,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, job_id: Uuid) -> Self {
        Self {
            store: Some(store),
            job_id,
        }
    }

    /// Reporter that records nothing
    pub fn detached() -> Self {
        Self {
            store: None,
            job_id: Uuid::nil(),
        }
    }

    pub async fn report(&self, label: &str, metadata: Map<String, Value>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut patch = JobPatch::progress(label);
        patch.metadata = metadata;
        match store.update(self.job_id, patch, JobStatus::Running).await? {
            UpdateOutcome::Updated(_) => Ok(()),
            UpdateOutcome::Conflict { current } => Err(OrchestratorError::InvalidStateTransition {
                from: current.to_string(),
                to: format!("running ({})", label),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub cache_hit: bool,
    pub duration_ms: u64,
    pub bytes: usize,
    /// `None` on a cache hit
    pub metrics: Option<StageMetrics>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// `commit`, `pages` and `wiki_key`
    pub metadata: Map<String, Value>,
    pub reports: Vec<StageReport>,
}

impl PipelineOutcome {
    pub fn report(&self, stage: Stage) -> Option<&StageReport> {
        self.reports.iter().find(|r| r.stage == stage)
    }

    pub fn cache_hits(&self) -> usize {
        self.reports.iter().filter(|r| r.cache_hit).count()
    }
}

pub struct IngestionPipeline {
    stages: Vec<Arc<dyn StageHandler>>,
    cache: Arc<ArtifactCache>,
}

impl IngestionPipeline {
    pub fn new(
        fetcher: Arc<dyn RepoFetcher>,
        embedder: Arc<Embedder>,
        providers: ProviderRegistry,
        cache: Arc<ArtifactCache>,
        extract: ExtractConfig,
        retry: RetryPolicy,
    ) -> Self {
        let stages: Vec<Arc<dyn StageHandler>> = vec![
            Arc::new(CloneStage::new(fetcher)),
            Arc::new(ExtractStage::new(extract)),
            Arc::new(EmbedStage::new(embedder)),
            Arc::new(GenerateStage::new(providers, retry)),
        ];
        Self { stages, cache }
    }

    /// Custom handlers; they must cover `Stage::ALL` in order
    pub fn with_stages(stages: Vec<Arc<dyn StageHandler>>, cache: Arc<ArtifactCache>) -> Result<Self> {
        let order: Vec<Stage> = stages.iter().map(|s| s.stage()).collect();
        if order != Stage::ALL {
            return Err(OrchestratorError::config(format!(
                "pipeline stages must be {:?}, got {:?}",
                Stage::ALL,
                order
            )));
        }
        Ok(Self { stages, cache })
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Run every stage for `record`, reporting progress between stages.
    pub async fn run(&self, record: &JobRecord, reporter: &ProgressReporter) -> Result<PipelineOutcome> {
        let ctx = StageContext::from_record(record)?;
        let mut input = StageInput::new(Vec::new());
        let mut metadata = Map::new();
        let mut reports = Vec::with_capacity(self.stages.len());
        let mut last_key = None;

        for handler in &self.stages {
            let stage = handler.stage();
            reporter.report(stage.progress_label(), Map::new()).await?;
            let started = Instant::now();

            let mut prepared = handler.prepare(input, &ctx).await?;
            let discovered = std::mem::take(&mut prepared.metadata);
            if !discovered.is_empty() {
                reporter
                    .report(stage.progress_label(), discovered.clone())
                    .await?;
                metadata.extend(discovered);
            }

            let key = CacheKey::new(stage, prepared.fingerprint, handler.config(&ctx));
            debug!(
                job_id = %ctx.job_id,
                stage = %stage,
                key = %key.digest().short(),
                "stage cache lookup"
            );

            let mut metrics = None;
            let slot = &mut metrics;
            let ctx_ref = &ctx;
            let cached = self
                .cache
                .lookup_or_compute(&key, move || async move {
                    let output = handler.execute(prepared, ctx_ref).await?;
                    *slot = Some(output.metrics);
                    Ok(output.cache_data)
                })
                .await?;

            let duration_ms = started.elapsed().as_millis() as u64;
            info!(
                job_id = %ctx.job_id,
                stage = %stage,
                cache_hit = cached.hit,
                duration_ms,
                bytes = cached.payload.len(),
                "stage finished"
            );
            reports.push(StageReport {
                stage,
                cache_hit: cached.hit,
                duration_ms,
                bytes: cached.payload.len(),
                metrics,
            });

            last_key = Some(key);
            input = StageInput {
                payload: cached.payload,
                fingerprint: cached.fingerprint,
                metadata: Map::new(),
            };
        }

        let key = last_key.ok_or_else(|| OrchestratorError::internal("pipeline has no stages"))?;
        let wiki: WikiOutput = bincode::deserialize(&input.payload)?;
        metadata.insert(PAGES_KEY.into(), Value::from(wiki.pages.len()));
        metadata.insert(WIKI_KEY.into(), Value::from(self.cache.object_name(&key)));

        Ok(PipelineOutcome { metadata, reports })
    }
}
