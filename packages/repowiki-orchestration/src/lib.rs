/*
 * Repowiki Orchestration - Background Job Engine
 *
 * Turns repository URLs into generated wikis, one job at a time per worker.
 *
 * Architecture:
 * - Job State Machine (queued → running → completed | failed, CAS updates)
 * - Job Queue (FIFO admission, in-memory or redis backend)
 * - Worker Pool (MAX_JOB_WORKERS executors, per-repository locks)
 * - Ingestion Pipeline (clone → extract → embed → generate)
 * - Artifact Cache (content-addressed, blake3 keys)
 * - Provider Adapter (google, openai, openrouter, local)
 * - Status API (axum)
 */

// Public modules
pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod stages;
pub mod worker;

// Re-exports
pub use api::{ApiError, StatusApi};
pub use cache::{ArtifactCache, CacheKey, CacheStatsSnapshot, Cached, Fingerprint};
pub use config::{
    CacheBackendKind, EngineConfig, ExtractConfig, QueueBackendKind, RetryPolicy,
    StoreBackendKind,
};
pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use job::{CredentialPolicy, CredentialRef, JobStateMachine, ProviderBinding, RepoType, Stage};
pub use pipeline::{
    IngestionPipeline, PipelineOutcome, ProgressReporter, StageContext, StageHandler, StageInput,
    StageMetrics, StageOutput, StageReport,
};
pub use provider::{Embedder, Provider, ProviderError, ProviderRegistry};
pub use queue::{InMemoryQueue, JobQueue, QueueBackend, RecoveryReport, SubmitRequest};
pub use stages::{MemoryFetcher, RepoFetcher, WikiOutput, WikiPage};
pub use worker::{PoolHandle, RepoGuard, RepoLocks, WorkerPool};

#[cfg(feature = "redis")]
pub use queue::RedisQueue;
