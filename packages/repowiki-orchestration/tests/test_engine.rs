//! End-to-end engine tests: admission, dispatch, execution and recovery
//!
//! Every test runs fully in-process (memory fetcher, local provider).

mod common;

use async_trait::async_trait;
use common::{
    harness, harness_with_providers, scripted_registry, wait_for_terminal, Harness, MISSING_URL,
    URL,
};
use repowiki_orchestration::job::INTERRUPTED_ERROR;
use repowiki_orchestration::pipeline::{COMMIT_KEY, PAGES_KEY, WIKI_KEY};
use repowiki_orchestration::queue::RETRY_OF_KEY;
use repowiki_orchestration::{
    Engine, EngineConfig, QueueBackend, Stage, StoreBackendKind, SubmitRequest,
};
use repowiki_storage::{
    JobPatch, JobRecord, JobStatus, JobStore, MemoryJobStore, StorageError, UpdateOutcome,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn test_submitted_job_completes() {
    let h = harness(2).await;
    let queue = h.engine.queue();

    let submitted = queue.submit(SubmitRequest::new(URL, "git")).await.unwrap();
    assert_eq!(submitted.status, JobStatus::Queued);
    assert!(submitted.error.is_none());

    let pool = h.engine.start_workers();
    let done = wait_for_terminal(h.engine.store().as_ref(), submitted.id).await;
    pool.shutdown().await;

    assert_eq!(done.id, submitted.id);
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.error.is_none());
    assert_eq!(done.progress.as_deref(), Some("done"));
    assert_eq!(done.metadata_str("provider"), Some("local"));
    assert_eq!(done.metadata_str("model"), Some("local-template"));
    assert!(done.metadata_str(COMMIT_KEY).unwrap().starts_with("tree:"));
    // Overview + docs + src
    assert_eq!(done.metadata[PAGES_KEY], Value::from(3));
    assert!(done.metadata_str(WIKI_KEY).is_some());
    assert!(done.created_at <= done.updated_at);
}

#[tokio::test]
async fn test_unreachable_repo_fails_with_clone_error() {
    let h = harness(1).await;
    let request = SubmitRequest::new(MISSING_URL, "git")
        .with_metadata("provider", "local")
        .with_metadata("model", "local-template-xl");
    let submitted = h.engine.queue().submit(request).await.unwrap();

    let pool = h.engine.start_workers();
    let done = wait_for_terminal(h.engine.store().as_ref(), submitted.id).await;
    pool.shutdown().await;

    assert_eq!(done.status, JobStatus::Failed);
    let error = done.error.clone().unwrap();
    assert!(error.starts_with("clone failed"), "{}", error);
    assert_eq!(done.progress.as_deref(), Some("error"));
    assert_eq!(done.metadata_str("provider"), Some("local"));
    assert_eq!(done.metadata_str("model"), Some("local-template-xl"));
    assert!(done.metadata.get(COMMIT_KEY).is_none());
}

#[tokio::test]
async fn test_status_only_moves_forward() {
    let h = harness(3).await;
    let queue = h.engine.queue();
    let mut ids = Vec::new();
    for url in [URL, "https://example.com/b.git", "https://example.com/c.git", MISSING_URL] {
        ids.push(queue.submit(SubmitRequest::new(url, "git")).await.unwrap().id);
    }

    let pool = h.engine.start_workers();
    for id in &ids {
        wait_for_terminal(h.engine.store().as_ref(), *id).await;
    }
    pool.shutdown().await;

    for id in &ids {
        let statuses = h.store.statuses(*id);
        assert_eq!(statuses.len(), 3, "{:?}", statuses);
        assert_eq!(statuses[0], JobStatus::Queued);
        assert_eq!(statuses[1], JobStatus::Running);
        assert!(statuses[2].is_terminal());
    }

    // error is set exactly when the job failed, at every write
    for observed in h.store.log() {
        assert_eq!(
            observed.error.is_some(),
            observed.status == JobStatus::Failed,
            "{:?}",
            observed
        );
    }
}

#[tokio::test]
async fn test_duplicate_dispatch_has_single_executor() {
    let h = harness(4).await;
    let submitted = h
        .engine
        .queue()
        .submit(SubmitRequest::new(URL, "git"))
        .await
        .unwrap();
    for _ in 0..5 {
        h.backend.push(submitted.id).await.unwrap();
    }

    let pool = h.engine.start_workers();
    let done = wait_for_terminal(h.engine.store().as_ref(), submitted.id).await;
    pool.shutdown().await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(h.store.claims(), vec![submitted.id]);
    assert_eq!(h.fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_single_worker_claims_in_admission_order() {
    let h = harness(1).await;
    let queue = h.engine.queue();
    let mut ids = Vec::new();
    for url in [
        "https://example.com/c.git",
        URL,
        "https://example.com/b.git",
    ] {
        ids.push(queue.submit(SubmitRequest::new(url, "git")).await.unwrap().id);
    }

    let pool = h.engine.start_workers();
    for id in &ids {
        wait_for_terminal(h.engine.store().as_ref(), *id).await;
    }
    pool.shutdown().await;

    assert_eq!(h.store.claims(), ids);
}

#[tokio::test]
async fn test_second_submission_hits_embed_cache() {
    let h = harness(2).await;
    let queue = h.engine.queue();
    let cache = h.engine.cache();
    let pool = h.engine.start_workers();

    let first = queue.submit(SubmitRequest::new(URL, "git")).await.unwrap();
    let first = wait_for_terminal(h.engine.store().as_ref(), first.id).await;
    let after_first = cache.stats();
    assert_eq!(after_first.stage(Stage::Embed).hits, 0);
    assert_eq!(after_first.stage(Stage::Embed).misses, 1);

    let second = queue.submit(SubmitRequest::new(URL, "git")).await.unwrap();
    assert_ne!(second.id, first.id);
    let second = wait_for_terminal(h.engine.store().as_ref(), second.id).await;
    pool.shutdown().await;

    let after_second = cache.stats();
    assert_eq!(after_second.stage(Stage::Embed).hits, 1);
    assert_eq!(after_second.stage(Stage::Embed).misses, 1);
    assert_eq!(after_second.writes, after_first.writes);
    assert_eq!(h.fetcher.fetch_count(), 1);
    assert_eq!(first.metadata[WIKI_KEY], second.metadata[WIKI_KEY]);
}

#[tokio::test]
async fn test_shutdown_never_leaves_running_jobs() {
    let h = harness(2).await;
    let queue = h.engine.queue();
    let mut ids = Vec::new();
    for url in [URL, "https://example.com/b.git", "https://example.com/c.git"] {
        ids.push(queue.submit(SubmitRequest::new(url, "git")).await.unwrap().id);
    }

    let pool = h.engine.start_workers();
    tokio::task::yield_now().await;
    pool.shutdown().await;

    for id in ids {
        let record = h.engine.store().get(id).await.unwrap();
        assert_ne!(record.status, JobStatus::Running);
    }
}

#[tokio::test]
async fn test_retry_submits_fresh_job() {
    let h = harness(1).await;
    let queue = h.engine.queue();
    let pool = h.engine.start_workers();

    let failed = queue
        .submit(SubmitRequest::new(MISSING_URL, "git"))
        .await
        .unwrap();
    let failed = wait_for_terminal(h.engine.store().as_ref(), failed.id).await;
    assert_eq!(failed.status, JobStatus::Failed);

    h.fetcher.insert(MISSING_URL, [("README.md", "Now it exists.")]);
    let retried = queue.resubmit(failed.id).await.unwrap();
    assert_ne!(retried.id, failed.id);
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(
        retried.metadata_str(RETRY_OF_KEY),
        Some(failed.id.to_string().as_str())
    );

    let done = wait_for_terminal(h.engine.store().as_ref(), retried.id).await;
    pool.shutdown().await;
    assert_eq!(done.status, JobStatus::Completed);

    // the original record is untouched
    let original = h.engine.store().get(failed.id).await.unwrap();
    assert_eq!(original.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_restart_recovers_queued_jobs_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        store: StoreBackendKind::Sqlite {
            path: dir.path().join("jobs.sqlite3"),
        },
        ..EngineConfig::in_memory()
    };
    let fetcher = common::fixture_fetcher();

    let id = {
        let engine = Engine::builder(config.clone())
            .with_fetcher(Arc::new(fetcher.clone()))
            .build()
            .await
            .unwrap();
        engine
            .queue()
            .submit(SubmitRequest::new(URL, "git"))
            .await
            .unwrap()
            .id
    };

    let engine = Engine::builder(config)
        .with_fetcher(Arc::new(fetcher))
        .build()
        .await
        .unwrap();
    assert_eq!(engine.queue().len().await.unwrap(), 0);

    let report = engine.recover().await.unwrap();
    assert_eq!(report.requeued, vec![id]);
    assert!(report.interrupted.is_empty());

    let pool = engine.start_workers();
    let done = wait_for_terminal(engine.store().as_ref(), id).await;
    pool.shutdown().await;
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_recover_fails_interrupted_jobs() {
    let h = harness(1).await;
    let submitted = h
        .engine
        .queue()
        .submit(SubmitRequest::new(URL, "git"))
        .await
        .unwrap();
    // simulate a crash mid-run: claimed, never finished
    assert_eq!(h.engine.queue().try_dispatch_next().await.unwrap(), Some(submitted.id));
    h.engine
        .store()
        .update(
            submitted.id,
            repowiki_storage::JobPatch::status(JobStatus::Running),
            JobStatus::Queued,
        )
        .await
        .unwrap();

    let report = h.engine.recover().await.unwrap();
    assert_eq!(report.interrupted, vec![submitted.id]);
    assert!(report.requeued.is_empty());

    let record = h.engine.store().get(submitted.id).await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.as_deref(), Some(INTERRUPTED_ERROR));
}

/// Run a job bound to `provider`, then a local job for the same repository.
///
/// One worker: if the first job leaked its repository lock the second would
/// never finish.
async fn fail_then_follow(h: &Harness, provider: &str) -> (JobRecord, JobRecord) {
    let queue = h.engine.queue();
    let failing = queue
        .submit(
            SubmitRequest::new(URL, "git")
                .with_metadata("provider", provider)
                .with_metadata("model", "scripted-1"),
        )
        .await
        .unwrap();
    let follow = queue.submit(SubmitRequest::new(URL, "git")).await.unwrap();
    assert_ne!(failing.id, follow.id);

    let pool = h.engine.start_workers();
    let failing = wait_for_terminal(h.engine.store().as_ref(), failing.id).await;
    let follow = wait_for_terminal(h.engine.store().as_ref(), follow.id).await;
    pool.shutdown().await;

    assert_eq!(follow.status, JobStatus::Completed);
    (failing, follow)
}

fn failure_text(record: &JobRecord) -> String {
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.progress.as_deref(), Some("error"));
    let error = record.error.clone().unwrap();
    assert!(!error.is_empty());
    assert!(!error.contains('\n'), "{:?}", error);
    error
}

#[tokio::test]
async fn test_rejected_credentials_fail_the_job() {
    let (registry, scripted) = scripted_registry();
    let h = harness_with_providers(1, Some(registry)).await;

    let (failed, _) = fail_then_follow(&h, "bad-key").await;
    let error = failure_text(&failed);
    assert!(error.starts_with("provider bad-key rejected the credentials"), "{}", error);
    assert!(error.contains("API key not valid"), "{}", error);
    assert!(!error.contains("7f3a"), "{}", error);
    assert_eq!(failed.metadata_str("provider"), Some("bad-key"));
    // authentication failures are not retried
    assert_eq!(scripted[0].calls(), 1);
}

#[tokio::test]
async fn test_exhausted_transient_retries_fail_the_job() {
    let (registry, scripted) = scripted_registry();
    let h = harness_with_providers(1, Some(registry)).await;
    let retries = h.engine.config().retry.max_retries as usize;

    let (failed, _) = fail_then_follow(&h, "throttled").await;
    assert_eq!(
        failure_text(&failed),
        "provider throttled is rate limited or unavailable; retries exhausted"
    );
    assert_eq!(scripted[1].calls(), retries + 1);
}

#[tokio::test]
async fn test_pipeline_panic_fails_the_job() {
    let (registry, scripted) = scripted_registry();
    let h = harness_with_providers(1, Some(registry)).await;

    let (failed, _) = fail_then_follow(&h, "crashing").await;
    assert_eq!(failure_text(&failed), "internal error");
    assert_eq!(scripted[2].calls(), 1);
    // nothing half-finished was recorded for the generate stage
    assert!(failed.metadata.get(WIKI_KEY).is_none());
}

/// Memory store whose first `n` claims fail the way a locked database does
struct FlakyClaims {
    inner: MemoryJobStore,
    remaining: AtomicUsize,
}

impl FlakyClaims {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            remaining: AtomicUsize::new(failures),
        }
    }

    fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for FlakyClaims {
    async fn create(&self, record: JobRecord) -> repowiki_storage::Result<Uuid> {
        self.inner.create(record).await
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
        let claim = expected == JobStatus::Queued && patch.status == Some(JobStatus::Running);
        if claim
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StorageError::database("database is locked"));
        }
        self.inner.update(id, patch, expected).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test]
async fn test_store_error_on_claim_requeues_job() {
    let store = Arc::new(FlakyClaims::new(2));
    let engine = Engine::builder(EngineConfig::in_memory().with_workers(1))
        .with_store(store.clone())
        .with_fetcher(Arc::new(common::fixture_fetcher()))
        .build()
        .await
        .unwrap();
    let submitted = engine
        .queue()
        .submit(SubmitRequest::new(URL, "git"))
        .await
        .unwrap();

    let pool = engine.start_workers();
    let done = wait_for_terminal(engine.store().as_ref(), submitted.id).await;
    pool.shutdown().await;

    assert_eq!(store.remaining(), 0);
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(engine.queue().len().await.unwrap(), 0);
}
