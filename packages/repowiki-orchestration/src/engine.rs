//! Engine wiring
//!
//! Builds the job store, queue backend, artifact cache, providers and
//! pipeline described by an `EngineConfig`. Any component can be replaced
//! before `build` (tests swap in memory stores and fetchers).

use crate::api::StatusApi;
use crate::cache::ArtifactCache;
use crate::config::{CacheBackendKind, EngineConfig, QueueBackendKind, StoreBackendKind};
use crate::error::{OrchestratorError, Result};
use crate::pipeline::IngestionPipeline;
use crate::provider::{Embedder, ProviderRegistry};
use crate::queue::{InMemoryQueue, JobQueue, QueueBackend, RecoveryReport};
use crate::stages::{DefaultFetcher, RepoFetcher};
use crate::worker::{PoolHandle, WorkerPool};
use axum::Router;
use repowiki_storage::{
    FsObjectStore, GcsObjectStore, JobStore, MemoryJobStore, MemoryObjectStore, ObjectStore,
    SqliteJobStore,
};
use std::sync::Arc;
use tracing::{info, warn};

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn JobStore>>,
    objects: Option<Arc<dyn ObjectStore>>,
    backend: Option<Arc<dyn QueueBackend>>,
    fetcher: Option<Arc<dyn RepoFetcher>>,
    providers: Option<ProviderRegistry>,
}

impl EngineBuilder {
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn with_queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn RepoFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Some(providers);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.store)?,
        };
        let objects = match self.objects {
            Some(objects) => objects,
            None => open_object_store(&config.cache)?,
        };
        let backend = match self.backend {
            Some(backend) => backend,
            None => open_queue_backend(&config.queue).await?,
        };
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(DefaultFetcher::new()));
        let providers = match self.providers {
            Some(providers) => providers,
            None => ProviderRegistry::with_defaults()?,
        };

        for (name, what) in [
            (&config.default_provider, "DEFAULT_PROVIDER"),
            (&config.embedder, "EMBEDDER"),
        ] {
            if !providers.contains(name) {
                return Err(OrchestratorError::config(format!(
                    "{} names unknown provider '{}' (known: {})",
                    what,
                    name,
                    providers.names().join(", ")
                )));
            }
        }
        let embed_provider = providers
            .get(&config.embedder)
            .ok_or_else(|| OrchestratorError::config("embedder provider missing"))?;
        let embedder = Arc::new(Embedder::new(
            embed_provider,
            config.embedding_model.clone(),
            config.retry,
        ));

        let cache = Arc::new(ArtifactCache::new(objects, config.cache_prefix.clone()));
        let pipeline = Arc::new(IngestionPipeline::new(
            fetcher,
            embedder,
            providers.clone(),
            cache.clone(),
            config.extract.clone(),
            config.retry,
        ));
        let queue = Arc::new(
            JobQueue::new(store, backend, providers)
                .with_default_binding(config.default_provider.clone(), config.default_model.clone())
                .with_credential_policy(config.credentials.clone()),
        );

        info!(
            store = queue.store().backend_name(),
            queue = queue.backend_name(),
            cache = %cache.location(),
            embedder = %config.embedder,
            "engine ready"
        );

        Ok(Engine {
            config,
            queue,
            pipeline,
            cache,
        })
    }
}

fn open_store(kind: &StoreBackendKind) -> Result<Arc<dyn JobStore>> {
    Ok(match kind {
        StoreBackendKind::Memory => Arc::new(MemoryJobStore::new()),
        StoreBackendKind::Sqlite { path } => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(SqliteJobStore::open(path)?)
        }
    })
}

fn open_object_store(kind: &CacheBackendKind) -> Result<Arc<dyn ObjectStore>> {
    Ok(match kind {
        CacheBackendKind::Memory => Arc::new(MemoryObjectStore::new()),
        CacheBackendKind::Filesystem { root } => Arc::new(FsObjectStore::new(root.clone())?),
        CacheBackendKind::Gcs { bucket } => Arc::new(GcsObjectStore::new(bucket.clone())?),
    })
}

async fn open_queue_backend(kind: &QueueBackendKind) -> Result<Arc<dyn QueueBackend>> {
    match kind {
        QueueBackendKind::InMemory => Ok(Arc::new(InMemoryQueue::new())),
        #[cfg(feature = "redis")]
        QueueBackendKind::Redis { url, key } => {
            Ok(Arc::new(crate::queue::RedisQueue::connect(url, key.clone()).await?))
        }
        #[cfg(not(feature = "redis"))]
        QueueBackendKind::Redis { .. } => {
            warn!("REDIS_URL is set but the redis feature is disabled, using in-memory queue");
            Ok(Arc::new(InMemoryQueue::new()))
        }
    }
}

/// A configured engine: queue + pipeline + cache over one job store
pub struct Engine {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    pipeline: Arc<IngestionPipeline>,
    cache: Arc<ArtifactCache>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            objects: None,
            backend: None,
            fetcher: None,
            providers: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.queue.store()
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    /// Fail interrupted jobs and refill a non-durable queue
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = self.queue.recover().await?;
        if !report.interrupted.is_empty() {
            warn!(
                count = report.interrupted.len(),
                "jobs were running when the engine last stopped"
            );
        }
        Ok(report)
    }

    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(self.config.max_workers, self.queue.clone(), self.pipeline.clone())
    }

    pub fn router(&self, pool: Option<PoolHandle>) -> Router {
        let api = StatusApi::new(self.queue.clone(), self.cache.clone());
        match pool {
            Some(pool) => api.with_pool(pool).router(),
            None => api.router(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::MemoryFetcher;

    #[tokio::test]
    async fn test_in_memory_engine_builds() {
        let engine = Engine::builder(EngineConfig::in_memory())
            .with_fetcher(Arc::new(MemoryFetcher::new()))
            .build()
            .await
            .unwrap();
        assert_eq!(engine.queue().backend_name(), "memory");
        assert!(engine.cache().location().starts_with("memory://"));
        assert_eq!(engine.queue().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_embedder_is_config_error() {
        let mut config = EngineConfig::in_memory();
        config.embedder = "nope".to_string();
        let err = Engine::builder(config).build().await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Config(_)));
        assert!(err.to_string().contains("EMBEDDER"));
    }

    #[tokio::test]
    async fn test_sqlite_store_created_under_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::in_memory();
        config.store = StoreBackendKind::Sqlite {
            path: dir.path().join("nested/jobs.sqlite3"),
        };
        let engine = Engine::builder(config).build().await.unwrap();
        assert_eq!(engine.store().backend_name(), "sqlite");
        assert!(dir.path().join("nested/jobs.sqlite3").exists());
    }
}
