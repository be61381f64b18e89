//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use repowiki_orchestration::provider::{CompletionRequest, LocalProvider};
use repowiki_orchestration::{
    Engine, EngineConfig, InMemoryQueue, MemoryFetcher, Provider, ProviderError, ProviderRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use repowiki_storage::{JobPatch, JobRecord, JobStatus, JobStore, MemoryJobStore, UpdateOutcome};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const URL: &str = "https://example.com/a.git";
pub const MISSING_URL: &str = "https://example.com/missing.git";

pub fn fixture_fetcher() -> MemoryFetcher {
    let fetcher = MemoryFetcher::new();
    for url in [
        URL,
        "https://example.com/b.git",
        "https://example.com/c.git",
    ] {
        fetcher.insert(
            url,
            [
                ("README.md", format!("Fixture project served from {}.", url)),
                ("src/lib.rs", "pub fn add(a: i32, b: i32) -> i32 { a + b }".to_string()),
                ("docs/guide.md", "Run `cargo test` to check the build.".to_string()),
            ],
        );
    }
    fetcher
}

/// A store transition seen by `RecordingStore`
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub id: Uuid,
    pub expected: JobStatus,
    pub status: JobStatus,
    pub error: Option<String>,
}

/// `MemoryJobStore` that records every successful write
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryJobStore,
    log: Mutex<Vec<Observed>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Vec<Observed> {
        self.log.lock().clone()
    }

    /// Ids in the order they were claimed (`queued → running`)
    pub fn claims(&self) -> Vec<Uuid> {
        self.log
            .lock()
            .iter()
            .filter(|o| o.expected == JobStatus::Queued && o.status == JobStatus::Running)
            .map(|o| o.id)
            .collect()
    }

    /// Distinct statuses a job passed through, in order
    pub fn statuses(&self, id: Uuid) -> Vec<JobStatus> {
        let mut out: Vec<JobStatus> = Vec::new();
        for o in self.log.lock().iter().filter(|o| o.id == id) {
            if out.last() != Some(&o.status) {
                out.push(o.status);
            }
        }
        out
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn create(&self, record: JobRecord) -> repowiki_storage::Result<Uuid> {
        let observed = Observed {
            id: record.id,
            expected: record.status,
            status: record.status,
            error: record.error.clone(),
        };
        let id = self.inner.create(record).await?;
        self.log.lock().push(observed);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> repowiki_storage::Result<JobRecord> {
        self.inner.get(id).await
    }

    async fn list(&self) -> repowiki_storage::Result<Vec<JobRecord>> {
        self.inner.list().await
    }

    async fn list_by_status(&self, status: JobStatus) -> repowiki_storage::Result<Vec<JobRecord>> {
        self.inner.list_by_status(status).await
    }

    async fn update(
        &self,
        id: Uuid,
        patch: JobPatch,
        expected: JobStatus,
    ) -> repowiki_storage::Result<UpdateOutcome> {
        let outcome = self.inner.update(id, patch, expected).await?;
        if let UpdateOutcome::Updated(record) = &outcome {
            self.log.lock().push(Observed {
                id,
                expected,
                status: record.status,
                error: record.error.clone(),
            });
        }
        Ok(outcome)
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<RecordingStore>,
    pub backend: Arc<InMemoryQueue>,
    pub fetcher: MemoryFetcher,
}

pub async fn harness(workers: usize) -> Harness {
    harness_with_providers(workers, None).await
}

/// `providers` replaces the default registry when set
pub async fn harness_with_providers(workers: usize, providers: Option<ProviderRegistry>) -> Harness {
    let store = Arc::new(RecordingStore::new());
    let backend = Arc::new(InMemoryQueue::new());
    let fetcher = fixture_fetcher();
    let mut builder = Engine::builder(EngineConfig::in_memory().with_workers(workers))
        .with_store(store.clone())
        .with_queue_backend(backend.clone())
        .with_fetcher(Arc::new(fetcher.clone()));
    if let Some(providers) = providers {
        builder = builder.with_providers(providers);
    }
    let engine = builder.build().await.unwrap();
    Harness {
        engine,
        store,
        backend,
        fetcher,
    }
}

/// Poll until the job is completed or failed
pub async fn wait_for_terminal(store: &dyn JobStore, id: Uuid) -> JobRecord {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let record = store.get(id).await.unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {} did not finish", id))
}

/// How a `ScriptedProvider` answers completions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    RejectCredentials,
    RateLimited,
    Panic,
}

/// Completion provider with a fixed failure mode; embeddings are never asked of it
pub struct ScriptedProvider {
    name: &'static str,
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &'static str, script: Script) -> Self {
        Self {
            name,
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn requires_credential(&self) -> bool {
        false
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
        _credential: Option<&str>,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::RejectCredentials => Err(ProviderError::Auth {
                provider: self.name.to_string(),
                message: "API key not valid\nrequest id 7f3a".to_string(),
            }),
            Script::RateLimited => Err(ProviderError::RateLimited {
                provider: self.name.to_string(),
                message: "quota exceeded".to_string(),
            }),
            Script::Panic => panic!("{} lost its connection pool", self.name),
        }
    }

    async fn embed(
        &self,
        _texts: &[String],
        _model: &str,
        _credential: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::malformed(self.name, "embeddings not scripted"))
    }
}

/// Local provider plus one scripted provider per failure mode
pub fn scripted_registry() -> (ProviderRegistry, Vec<Arc<ScriptedProvider>>) {
    let scripted = vec![
        Arc::new(ScriptedProvider::new("bad-key", Script::RejectCredentials)),
        Arc::new(ScriptedProvider::new("throttled", Script::RateLimited)),
        Arc::new(ScriptedProvider::new("crashing", Script::Panic)),
    ];
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(LocalProvider::new()));
    for provider in &scripted {
        registry.register(provider.clone());
    }
    (registry, scripted)
}
