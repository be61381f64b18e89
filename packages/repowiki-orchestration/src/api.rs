//! HTTP status API
//!
//! Thin axum layer over the job queue and job store. Handlers hold no job
//! state of their own; everything is read from or written through the store.
//!
//! | Route                        | Method | Result                          |
//! |------------------------------|--------|---------------------------------|
//! | `/api/jobs`                  | POST   | created record (`queued`)       |
//! | `/api/jobs`                  | GET    | records, newest first           |
//! | `/api/jobs/:id`              | GET    | record or 404                   |
//! | `/api/jobs/:id/retry`        | POST   | new record, 409 if not terminal |
//! | `/api/jobs/:id/wiki`         | GET    | generated wiki or 404           |
//! | `/health`                    | GET    | pool, queue and cache counters  |
//! | `/lang/config`               | GET    | static language configuration   |

use crate::cache::{ArtifactCache, CacheStatsSnapshot};
use crate::error::OrchestratorError;
use crate::pipeline::WIKI_KEY;
use crate::queue::{JobQueue, SubmitRequest};
use crate::stages::WikiOutput;
use crate::worker::PoolHandle;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use repowiki_storage::{JobRecord, JobStatus, JobStore};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Error body: `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.user_message() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Shared handler state
#[derive(Clone)]
pub struct StatusApi {
    queue: Arc<JobQueue>,
    cache: Arc<ArtifactCache>,
    pool: Option<PoolHandle>,
}

impl StatusApi {
    pub fn new(queue: Arc<JobQueue>, cache: Arc<ArtifactCache>) -> Self {
        Self {
            queue,
            cache,
            pool: None,
        }
    }

    /// Report worker counts on `/health`
    pub fn with_pool(mut self, pool: PoolHandle) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/api/jobs", post(submit_job).get(list_jobs))
            .route("/api/jobs/:id", get(get_job))
            .route("/api/jobs/:id/retry", post(retry_job))
            .route("/api/jobs/:id/wiki", get(get_wiki))
            .route("/health", get(health))
            .route("/lang/config", get(lang_config))
            .with_state(self)
    }

    async fn record(&self, id: &str) -> ApiResult<JobRecord> {
        let not_found = || OrchestratorError::JobNotFound(id.to_string());
        let id = Uuid::parse_str(id).map_err(|_| not_found())?;
        self.queue.store().get(id).await.map_err(|e| {
            if e.is_not_found() {
                ApiError(not_found())
            } else {
                ApiError(e.into())
            }
        })
    }
}

async fn submit_job(
    State(api): State<StatusApi>,
    body: std::result::Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let Json(request) =
        body.map_err(|e| ApiError(OrchestratorError::validation(e.body_text())))?;
    let record = api.queue.submit(request).await?;
    info!(job_id = %record.id, repo_url = %record.repo_url, "job submitted");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_jobs(State(api): State<StatusApi>) -> ApiResult<Json<Vec<JobRecord>>> {
    let records = api
        .queue
        .store()
        .list()
        .await
        .map_err(OrchestratorError::from)?;
    Ok(Json(records))
}

async fn get_job(State(api): State<StatusApi>, Path(id): Path<String>) -> ApiResult<Json<JobRecord>> {
    Ok(Json(api.record(&id).await?))
}

async fn retry_job(
    State(api): State<StatusApi>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let previous = api.record(&id).await?;
    let record = api.queue.resubmit(previous.id).await?;
    info!(job_id = %record.id, retry_of = %previous.id, "job resubmitted");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_wiki(State(api): State<StatusApi>, Path(id): Path<String>) -> ApiResult<Json<WikiOutput>> {
    let record = api.record(&id).await?;
    let missing = || ApiError(OrchestratorError::JobNotFound(format!("wiki for {}", record.id)));

    if record.status != JobStatus::Completed {
        return Err(missing());
    }
    let name = record.metadata_str(WIKI_KEY).ok_or_else(missing)?;
    let payload = api.cache.get_by_name(name).await?.ok_or_else(missing)?;
    let wiki: WikiOutput = bincode::deserialize(&payload).map_err(OrchestratorError::from)?;
    Ok(Json(wiki))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    workers: Option<WorkerHealth>,
    queue: QueueHealth,
    store: &'static str,
    cache: CacheHealth,
}

#[derive(Serialize)]
struct WorkerHealth {
    size: usize,
    active: usize,
}

#[derive(Serialize)]
struct QueueHealth {
    backend: &'static str,
    durable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct CacheHealth {
    location: String,
    #[serde(flatten)]
    stats: CacheStatsSnapshot,
}

/// 200 while the queue backend answers, 503 otherwise
async fn health(State(api): State<StatusApi>) -> (StatusCode, Json<HealthResponse>) {
    let (pending, queue_error) = match api.queue.len().await {
        Ok(n) => (Some(n), None),
        Err(e) => (None, Some(e.user_message())),
    };
    let healthy = queue_error.is_none();

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        workers: api.pool.as_ref().map(|p| WorkerHealth {
            size: p.size(),
            active: p.active_workers(),
        }),
        queue: QueueHealth {
            backend: api.queue.backend_name(),
            durable: api.queue.is_durable(),
            pending,
            error: queue_error,
        },
        store: api.queue.store().backend_name(),
        cache: CacheHealth {
            location: api.cache.location(),
            stats: api.cache.stats(),
        },
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Forwarded verbatim by the frontend proxy; unrelated to jobs
async fn lang_config() -> Json<Value> {
    Json(json!({
        "supported_languages": {
            "en": "English",
            "ja": "Japanese (日本語)",
            "zh": "Mandarin Chinese (中文)",
            "zh-tw": "Traditional Chinese (繁體中文)",
            "es": "Spanish (Español)",
            "kr": "Korean (한국어)",
            "vi": "Vietnamese (Tiếng Việt)",
            "pt-br": "Brazilian Portuguese (Português Brasileiro)",
            "fr": "Français (French)",
            "ru": "Русский (Russian)"
        },
        "default": "en"
    }))
}
