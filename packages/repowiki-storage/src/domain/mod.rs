//! Domain layer for job persistence and artifact objects
//!
//! # Domain Models
//!
//! - `JobRecord`: one ingestion request and its lifecycle fields
//! - `JobStatus`: `queued | running | completed | failed`
//! - `JobPatch`: partial update applied under a status guard
//!
//! # Port Traits
//!
//! - `JobStore`: source of truth for job records, compare-and-set updates
//! - `ObjectStore`: bucket-level blob storage used by the artifact cache
//!
//! # Examples
//!
//! ```rust,ignore
//! use repowiki_storage::domain::{JobPatch, JobRecord, JobStatus, JobStore};
//!
//! async fn claim(store: &dyn JobStore, record: JobRecord) -> Result<()> {
//!     let id = store.create(record).await?;
//!     let outcome = store
//!         .update(id, JobPatch::status(JobStatus::Running), JobStatus::Queued)
//!         .await?;
//!     assert!(outcome.is_updated());
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// Job lifecycle status
///
/// `queued → running → {completed | failed}`. `completed` and `failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted job record
///
/// Wire shape served by the status API:
/// `{id, repo_url, repo_type, status, progress, error, created_at, updated_at, metadata}`.
/// Timestamps are fractional Unix seconds.
///
/// # Invariants
///
/// - `created_at <= updated_at`
/// - `error.is_some()` if and only if `status == Failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub repo_url: String,
    pub repo_type: String,
    pub status: JobStatus,
    pub progress: Option<String>,
    pub error: Option<String>,
    #[serde(with = "epoch_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "epoch_seconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl JobRecord {
    /// Create a new `queued` record with a fresh id
    pub fn new_queued(
        repo_url: impl Into<String>,
        repo_type: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repo_url: repo_url.into(),
            repo_type: repo_type.into(),
            status: JobStatus::Queued,
            progress: None,
            error: None,
            created_at: now,
            updated_at: now,
            metadata,
        }
    }

    /// Metadata value as string (e.g. `provider`, `model`)
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Apply a patch, bumping `updated_at` monotonically.
    ///
    /// Keeps the error/status invariant: a non-failed record never carries an
    /// error, a failed record always does.
    pub fn apply(&mut self, patch: JobPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = Some(progress);
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        for (key, value) in patch.metadata {
            self.metadata.insert(key, value);
        }

        if self.status == JobStatus::Failed {
            if self.error.is_none() {
                self.error = Some("job failed".to_string());
            }
        } else {
            self.error = None;
        }

        self.updated_at = now.max(self.updated_at);
    }
}

/// Partial update for a job record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<String>,
    pub error: Option<String>,
    /// Merged into existing metadata (key-wise overwrite)
    pub metadata: Map<String, Value>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: impl Into<String>) -> Self {
        Self {
            progress: Some(progress.into()),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = Some(progress.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a guarded update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Guard matched; the stored record after the patch
    Updated(JobRecord),
    /// Guard did not match; nothing was written
    Conflict { current: JobStatus },
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }

    pub fn into_record(self) -> Option<JobRecord> {
        match self {
            UpdateOutcome::Updated(record) => Some(record),
            UpdateOutcome::Conflict { .. } => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Traits
// ═══════════════════════════════════════════════════════════════════════════

/// Job store port
///
/// Owns job records exclusively. Executors never share records in memory;
/// they mutate through `update`, whose `expected` status guard is the only
/// concurrency-control primitive.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record. Fails with `Conflict` if the id exists.
    async fn create(&self, record: JobRecord) -> Result<Uuid>;

    /// Fetch a record. Fails with `JobNotFound` for unknown ids.
    async fn get(&self, id: Uuid) -> Result<JobRecord>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<JobRecord>>;

    /// Records in the given status, oldest first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>>;

    /// Compare-and-set update guarded by the current status.
    ///
    /// The guard check and the write are atomic with respect to other
    /// `update` calls on the same id.
    async fn update(&self, id: Uuid, patch: JobPatch, expected: JobStatus)
        -> Result<UpdateOutcome>;

    /// Backend name for diagnostics
    fn backend_name(&self) -> &'static str;
}

/// Object store port (bucket-level)
///
/// Object names are opaque `/`-separated paths; callers apply their own
/// prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.get(name).await?.is_some())
    }

    /// Human-readable location (`gs://bucket`, `file:///path`, `memory://`)
    fn location(&self) -> String;
}

// ═══════════════════════════════════════════════════════════════════════════
// Serde helpers
// ═══════════════════════════════════════════════════════════════════════════

/// `DateTime<Utc>` as fractional Unix seconds
pub mod epoch_seconds {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        let micros = (secs * 1_000_000.0).round() as i64;
        Utc.timestamp_micros(micros)
            .single()
            .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", secs)))
    }
}
