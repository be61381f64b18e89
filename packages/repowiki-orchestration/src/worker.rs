//! Worker pool
//!
//! `MAX_JOB_WORKERS` long-running tasks, each looping:
//!
//! ```text
//! dispatch_next ──► claim (queued → running, CAS) ──► repo lock ──► pipeline
//!       ▲                    │ conflict: skip                         │
//!       └────────────────────┴──────── completed / failed ◄───────────┘
//! ```
//!
//! The claim is a guarded store update, so a job id dispatched twice still has
//! exactly one executor. Pipeline errors and panics become a `failed` record;
//! they never end the worker loop. A job the store could not load or claim is
//! still `queued` and goes back on the queue.

use crate::error::OrchestratorError;
use crate::job::{JobStateMachine, PROGRESS_WAITING};
use crate::pipeline::{IngestionPipeline, ProgressReporter};
use crate::queue::JobQueue;
use dashmap::DashMap;
use futures::future::join_all;
use repowiki_storage::JobStore;
use serde_json::Map;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delay after a queue backend error before dispatching again
const DISPATCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Delay after requeueing a job the store could not load or claim
const STORE_ERROR_BACKOFF: Duration = Duration::from_millis(250);

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// One async mutex per repository URL.
///
/// Entries exist only while some job holds or waits for the lock.
#[derive(Default)]
pub struct RepoLocks {
    locks: Arc<LockMap>,
}

/// Exclusive access to one repository; released on drop
pub struct RepoGuard {
    guard: Option<OwnedMutexGuard<()>>,
    repo: String,
    locks: Arc<LockMap>,
}

impl Drop for RepoGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone of the Arc, so count 1 means the map is the last owner
        self.locks
            .remove_if(&self.repo, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, repo: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(repo.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, repo: &str, guard: OwnedMutexGuard<()>) -> RepoGuard {
        RepoGuard {
            guard: Some(guard),
            repo: repo.to_string(),
            locks: self.locks.clone(),
        }
    }

    pub fn try_acquire(&self, repo: &str) -> Option<RepoGuard> {
        let guard = self.lock_for(repo).try_lock_owned().ok()?;
        Some(self.guard(repo, guard))
    }

    pub async fn acquire(&self, repo: &str) -> RepoGuard {
        let guard = self.lock_for(repo).lock_owned().await;
        self.guard(repo, guard)
    }

    /// Repositories currently locked or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// What the worker loop does with an id after `execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Execution {
    Finished,
    /// The store failed before the job was claimed; it is still `queued`
    Requeue,
}

/// Runs one dispatched job to a terminal state
struct JobExecutor {
    queue: Arc<JobQueue>,
    store: Arc<dyn JobStore>,
    pipeline: Arc<IngestionPipeline>,
    locks: RepoLocks,
}

impl JobExecutor {
    async fn execute(&self, id: Uuid) -> Execution {
        let record = match self.store.get(id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                warn!(job_id = %id, "dispatched job not found, skipping");
                return Execution::Finished;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to load dispatched job");
                return Execution::Requeue;
            }
        };

        let mut machine = JobStateMachine::new(record);
        let Ok(claim) = machine.start() else {
            debug!(job_id = %id, status = %machine.record().status, "job no longer queued, skipping");
            return Execution::Finished;
        };
        match machine.apply(self.store.as_ref(), claim).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %id, "job claimed by another executor, skipping");
                return Execution::Finished;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to claim job");
                return Execution::Requeue;
            }
        }

        let repo_url = machine.record().repo_url.clone();
        info!(job_id = %id, repo_url = %repo_url, "job started");

        let reporter = ProgressReporter::new(self.store.clone(), id);
        let _repo_guard = match self.locks.try_acquire(&repo_url) {
            Some(guard) => guard,
            None => {
                debug!(job_id = %id, repo_url = %repo_url, "waiting for repository lock");
                if let Err(e) = reporter.report(PROGRESS_WAITING, Map::new()).await {
                    warn!(job_id = %id, error = %e, "failed to report waiting state");
                }
                self.locks.acquire(&repo_url).await
            }
        };

        let started = Instant::now();
        let pipeline = self.pipeline.clone();
        let record = machine.record().clone();
        let result = tokio::spawn(async move { pipeline.run(&record, &reporter).await })
            .await
            .unwrap_or_else(|e| {
                Err(OrchestratorError::internal(format!(
                    "pipeline task aborted: {}",
                    e
                )))
            });
        let duration_ms = started.elapsed().as_millis() as u64;

        let transition = match result {
            Ok(outcome) => {
                info!(
                    job_id = %id,
                    duration_ms,
                    cache_hits = outcome.cache_hits(),
                    "job completed"
                );
                machine.complete(outcome.metadata)
            }
            Err(e) => {
                error!(
                    job_id = %id,
                    duration_ms,
                    category = %e.category(),
                    error = %e,
                    "job failed"
                );
                machine.fail(e.user_message())
            }
        };

        let applied = match transition {
            Ok(t) => machine.apply(self.store.as_ref(), t).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(true) => {}
            Ok(false) => warn!(
                job_id = %id,
                status = %machine.record().status,
                "job left running state before its result was recorded"
            ),
            Err(e) => error!(job_id = %id, error = %e, "failed to record job result"),
        }
        Execution::Finished
    }

    async fn run(self: Arc<Self>, index: usize, cancel: CancellationToken, active: Arc<AtomicUsize>) {
        debug!(worker = index, "worker started");
        loop {
            match self.queue.dispatch_next(&cancel).await {
                Ok(Some(id)) => {
                    active.fetch_add(1, Ordering::SeqCst);
                    let execution = self.execute(id).await;
                    active.fetch_sub(1, Ordering::SeqCst);

                    if execution == Execution::Requeue {
                        match self.queue.requeue(id).await {
                            Ok(()) => warn!(worker = index, job_id = %id, "job requeued after store error"),
                            Err(e) => error!(
                                worker = index,
                                job_id = %id,
                                error = %e,
                                "failed to requeue job, startup recovery will pick it up"
                            ),
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(STORE_ERROR_BACKOFF) => {}
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(worker = index, error = %e, "dispatch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(DISPATCH_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!(worker = index, "worker stopped");
    }
}

/// Cheap view of a running pool for status reporting
#[derive(Clone)]
pub struct PoolHandle {
    size: usize,
    active: Arc<AtomicUsize>,
}

impl PoolHandle {
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently executing a job
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

pub struct WorkerPool {
    handle: PoolHandle,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) on the current runtime
    pub fn start(size: usize, queue: Arc<JobQueue>, pipeline: Arc<IngestionPipeline>) -> Self {
        let size = size.max(1);
        let executor = Arc::new(JobExecutor {
            store: queue.store().clone(),
            queue,
            pipeline,
            locks: RepoLocks::new(),
        });
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        let workers = (0..size)
            .map(|index| {
                tokio::spawn(executor.clone().run(index, cancel.clone(), active.clone()))
            })
            .collect();

        info!(workers = size, "worker pool started");
        Self {
            handle: PoolHandle { size, active },
            cancel,
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.handle.size
    }

    pub fn active_workers(&self) -> usize {
        self.handle.active_workers()
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Stop dispatching and wait for in-flight jobs to reach a terminal state
    pub async fn shutdown(self) {
        info!(active = self.active_workers(), "worker pool draining");
        self.cancel.cancel();
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}
