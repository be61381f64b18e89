//! Job queue
//!
//! Admission (`submit`) validates a request, persists a `queued` record and
//! pushes its id onto a `QueueBackend`. Workers pull ids in FIFO order with
//! `dispatch_next`, which parks until an id arrives or shutdown begins.
//!
//! Durability is a backend property. With the in-memory backend undispatched
//! ids are lost on restart and `recover` re-enqueues them from the job store;
//! the redis backend keeps them across restarts.

use crate::error::{OrchestratorError, Result};
use crate::job::{
    CredentialPolicy, CredentialRef, JobStateMachine, ProviderBinding, RepoType, INTERRUPTED_ERROR,
};
use crate::pipeline::{COMMIT_KEY, PAGES_KEY, WIKI_KEY};
use crate::provider::ProviderRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use repowiki_storage::{JobRecord, JobStatus, JobStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RETRY_OF_KEY: &str = "retry_of";

/// Metadata keys that must never hold a literal secret
const SECRET_KEYS: &[&str] = &["api_key", "apikey", "token", "access_token", "secret"];

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether queued ids survive a process restart
    fn is_durable(&self) -> bool;

    async fn push(&self, id: Uuid) -> Result<()>;

    /// Oldest id, without waiting
    async fn pop(&self) -> Result<Option<Uuid>>;

    /// Oldest id, waiting for one if empty. `None` once `cancel` fires.
    async fn wait(&self, cancel: &CancellationToken) -> Result<Option<Uuid>>;

    async fn len(&self) -> Result<usize>;
}

/// Process-local FIFO
#[derive(Default)]
pub struct InMemoryQueue {
    items: Mutex<VecDeque<Uuid>>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn push(&self, id: Uuid) -> Result<()> {
        self.items.lock().push_back(id);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Uuid>> {
        Ok(self.items.lock().pop_front())
    }

    async fn wait(&self, cancel: &CancellationToken) -> Result<Option<Uuid>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            // Register before checking so a push between check and await is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.items.lock().pop_front();
            if let Some(id) = next {
                return Ok(Some(id));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.lock().len())
    }
}

#[cfg(feature = "redis")]
pub use redis_backend::RedisQueue;

#[cfg(feature = "redis")]
mod redis_backend {
    use super::*;
    use redis::AsyncCommands;
    use std::time::Duration;

    const POLL_INTERVAL: Duration = Duration::from_millis(500);

    fn queue_error(err: redis::RedisError) -> OrchestratorError {
        OrchestratorError::internal(format!("redis queue: {}", err))
    }

    /// Redis list: `LPUSH` on submit, `RPOP` on dispatch
    pub struct RedisQueue {
        conn: redis::aio::MultiplexedConnection,
        key: String,
    }

    impl RedisQueue {
        pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self> {
            let client = redis::Client::open(url).map_err(OrchestratorError::config)?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(OrchestratorError::config)?;
            Ok(Self {
                conn,
                key: key.into(),
            })
        }
    }

    #[async_trait]
    impl QueueBackend for RedisQueue {
        fn name(&self) -> &'static str {
            "redis"
        }

        fn is_durable(&self) -> bool {
            true
        }

        async fn push(&self, id: Uuid) -> Result<()> {
            let mut conn = self.conn.clone();
            let _: () = conn
                .lpush(&self.key, id.to_string())
                .await
                .map_err(queue_error)?;
            Ok(())
        }

        async fn pop(&self) -> Result<Option<Uuid>> {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.rpop(&self.key, None).await.map_err(queue_error)?;
            match raw {
                None => Ok(None),
                Some(raw) => match Uuid::parse_str(&raw) {
                    Ok(id) => Ok(Some(id)),
                    Err(_) => {
                        warn!(key = %self.key, value = %raw, "dropping malformed queue entry");
                        Ok(None)
                    }
                },
            }
        }

        async fn wait(&self, cancel: &CancellationToken) -> Result<Option<Uuid>> {
            loop {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                if let Some(id) = self.pop().await? {
                    return Ok(Some(id));
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        }

        async fn len(&self) -> Result<usize> {
            let mut conn = self.conn.clone();
            conn.llen(&self.key).await.map_err(queue_error)
        }
    }
}

/// `POST /api/jobs` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub repo_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SubmitRequest {
    pub fn new(repo_url: impl Into<String>, repo_type: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            repo_type: repo_type.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What `recover` did at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `running → failed`
    pub interrupted: Vec<Uuid>,
    /// Pushed back onto a non-durable queue
    pub requeued: Vec<Uuid>,
}

fn default_model_for(provider: &str) -> Option<&'static str> {
    match provider {
        "google" => Some("gemini-2.0-flash"),
        "openai" => Some("gpt-4o"),
        "openrouter" => Some("openai/gpt-4o"),
        "local" => Some("local-template"),
        _ => None,
    }
}

fn metadata_string(metadata: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match metadata.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(OrchestratorError::validation(format!(
            "metadata.{} must be a string",
            key
        ))),
    }
}

pub struct JobQueue {
    store: Arc<dyn JobStore>,
    backend: Arc<dyn QueueBackend>,
    providers: ProviderRegistry,
    default_provider: String,
    default_model: String,
    credentials: CredentialPolicy,
    /// Serializes the queued-duplicate check with the create that follows it
    admission: tokio::sync::Mutex<()>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        backend: Arc<dyn QueueBackend>,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            store,
            backend,
            providers,
            default_provider: "google".to_string(),
            default_model: "gemini-2.0-flash".to_string(),
            credentials: CredentialPolicy::default(),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    /// Credential references submissions may name
    pub fn with_credential_policy(mut self, credentials: CredentialPolicy) -> Self {
        self.credentials = credentials;
        self
    }

    /// Binding applied when a submission names no provider
    pub fn with_default_binding(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.default_provider = provider.into();
        self.default_model = model.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    /// Resolve the provider binding and reject literal secrets
    fn bind(&self, metadata: &mut Map<String, Value>) -> Result<ProviderBinding> {
        if let Some(key) = SECRET_KEYS.iter().find(|k| metadata.contains_key(**k)) {
            return Err(OrchestratorError::validation(format!(
                "metadata.{} is not accepted; pass a credential reference in metadata.{} (env:NAME or file:/path)",
                key,
                ProviderBinding::CREDENTIAL_KEY
            )));
        }

        let provider = metadata_string(metadata, ProviderBinding::PROVIDER_KEY)?
            .map(|p| p.to_lowercase())
            .unwrap_or_else(|| self.default_provider.clone());
        if !self.providers.contains(&provider) {
            return Err(OrchestratorError::validation(format!(
                "unknown provider '{}' (available: {})",
                provider,
                self.providers.names().join(", ")
            )));
        }

        let model = match metadata_string(metadata, ProviderBinding::MODEL_KEY)? {
            Some(model) => model,
            None if provider == self.default_provider => self.default_model.clone(),
            None => default_model_for(&provider)
                .map(str::to_string)
                .ok_or_else(|| {
                    OrchestratorError::validation(format!(
                        "metadata.model is required for provider '{}'",
                        provider
                    ))
                })?,
        };

        let conventional = CredentialRef::default_for(&provider);
        let credential = match metadata_string(metadata, ProviderBinding::CREDENTIAL_KEY)? {
            Some(raw) => {
                let credential = CredentialRef::parse(&raw)?;
                if credential != conventional && !self.credentials.permits(&credential) {
                    return Err(OrchestratorError::validation(format!(
                        "credential reference '{}' is not in the configured allowlist",
                        credential
                    )));
                }
                credential
            }
            None => conventional,
        };

        let binding = ProviderBinding {
            provider,
            model,
            credential,
        };
        binding.write_to(metadata);
        Ok(binding)
    }

    /// Validate, persist as `queued` and enqueue. Never waits on execution.
    ///
    /// An identical request that is still queued is returned instead of
    /// creating a second job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobRecord> {
        let repo_url = request.repo_url.trim().to_string();
        if repo_url.is_empty() {
            return Err(OrchestratorError::validation("repo_url must not be empty"));
        }
        let repo_type = RepoType::parse(&request.repo_type)?;

        let mut metadata = request.metadata;
        let binding = self.bind(&mut metadata)?;

        // Held across check and create so identical concurrent submissions
        // collapse into one job
        let _admission = self.admission.lock().await;
        let queued = self.store.list_by_status(JobStatus::Queued).await?;
        if let Some(existing) = queued.into_iter().find(|r| {
            r.repo_url == repo_url
                && r.repo_type == repo_type.as_str()
                && r.metadata_str(ProviderBinding::PROVIDER_KEY) == Some(binding.provider.as_str())
                && r.metadata_str(ProviderBinding::MODEL_KEY) == Some(binding.model.as_str())
        }) {
            debug!(job_id = %existing.id, repo_url = %repo_url, "identical job already queued");
            return Ok(existing);
        }

        let record = JobRecord::new_queued(repo_url, repo_type.as_str(), metadata);
        self.store.create(record.clone()).await?;
        self.backend.push(record.id).await?;

        info!(
            job_id = %record.id,
            repo_url = %record.repo_url,
            repo_type = %record.repo_type,
            provider = %binding.provider,
            model = %binding.model,
            "job admitted"
        );
        Ok(record)
    }

    /// Next job id in admission order; waits while the queue is empty.
    ///
    /// Returns `None` once `cancel` fires.
    pub async fn dispatch_next(&self, cancel: &CancellationToken) -> Result<Option<Uuid>> {
        self.backend.wait(cancel).await
    }

    /// Put a dispatched id back at the tail, for a job that could not be
    /// claimed because the store failed
    pub async fn requeue(&self, id: Uuid) -> Result<()> {
        self.backend.push(id).await
    }

    /// Non-blocking variant of `dispatch_next`
    pub async fn try_dispatch_next(&self) -> Result<Option<Uuid>> {
        self.backend.pop().await
    }

    /// Submit a fresh job carrying a terminal job's request and binding
    pub async fn resubmit(&self, id: Uuid) -> Result<JobRecord> {
        let previous = self.store.get(id).await.map_err(|e| {
            if e.is_not_found() {
                OrchestratorError::JobNotFound(id.to_string())
            } else {
                e.into()
            }
        })?;
        if !previous.status.is_terminal() {
            return Err(OrchestratorError::InvalidStateTransition {
                from: previous.status.to_string(),
                to: "retry".to_string(),
            });
        }

        let mut metadata = previous.metadata;
        for key in [COMMIT_KEY, PAGES_KEY, WIKI_KEY] {
            metadata.remove(key);
        }
        metadata.insert(RETRY_OF_KEY.to_string(), Value::from(id.to_string()));

        self.submit(SubmitRequest {
            repo_url: previous.repo_url,
            repo_type: previous.repo_type,
            metadata,
        })
        .await
    }

    /// Startup recovery.
    ///
    /// Jobs left `running` by a previous process fail with an interruption
    /// error. On a non-durable queue, `queued` jobs are pushed again in
    /// admission order.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for record in self.store.list_by_status(JobStatus::Running).await? {
            let id = record.id;
            let mut machine = JobStateMachine::new(record);
            let transition = machine.fail(INTERRUPTED_ERROR)?;
            if machine.apply(self.store.as_ref(), transition).await? {
                warn!(job_id = %id, "job interrupted by restart, marked failed");
                report.interrupted.push(id);
            }
        }

        if !self.backend.is_durable() {
            for record in self.store.list_by_status(JobStatus::Queued).await? {
                self.backend.push(record.id).await?;
                report.requeued.push(record.id);
            }
        }

        info!(
            interrupted = report.interrupted.len(),
            requeued = report.requeued.len(),
            backend = self.backend.name(),
            "queue recovery finished"
        );
        Ok(report)
    }
}
