//! SQLite job store
//!
//! File-based persistent storage for job records. Survives restarts, which
//! is what startup recovery relies on.
//!
//! Timestamps are stored as INTEGER microseconds so ordering is numeric.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{JobPatch, JobRecord, JobStatus, JobStore, UpdateOutcome};
use crate::{Result, StorageError};

const SELECT_COLUMNS: &str = "id, repo_url, repo_type, status, progress, error, created_at, updated_at, metadata";

/// SQLite-based JobStore implementation
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open (or create) a store at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path.as_ref()).map_err(|e| {
            warn!(path = %db_path.as_ref().display(), error = %e, "failed to open job store");
            e
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        debug!(path = %db_path.as_ref().display(), "job store opened");
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                repo_url TEXT NOT NULL,
                repo_type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_created
             ON jobs(status, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_created
             ON jobs(created_at)",
            [],
        )?;

        Ok(())
    }
}

/// Raw row before conversion; conversion errors are storage errors, not
/// rusqlite errors.
struct JobRow {
    id: String,
    repo_url: String,
    repo_type: String,
    status: String,
    progress: Option<String>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
    metadata: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_url: row.get(1)?,
            repo_type: row.get(2)?,
            status: row.get(3)?,
            progress: row.get(4)?,
            error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            metadata: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<JobRecord> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StorageError::serialization(format!("bad job id {}: {}", self.id, e)))?;
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            StorageError::serialization(format!("bad job status {}: {}", self.id, self.status))
        })?;
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata)?;

        Ok(JobRecord {
            id,
            repo_url: self.repo_url,
            repo_type: self.repo_type,
            status,
            progress: self.progress,
            error: self.error,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
            metadata,
        })
    }
}

/// Row conversion that logs the offending id before surfacing the error
fn decode(row: JobRow) -> Result<JobRecord> {
    let id = row.id.clone();
    row.into_record().map_err(|e| {
        warn!(job_id = %id, error = %e, "unreadable job row");
        e
    })
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::serialization(format!("timestamp out of range: {}", micros)))
}

fn load(conn: &Connection, id: Uuid) -> Result<Option<JobRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", SELECT_COLUMNS),
            params![id.to_string()],
            JobRow::from_row,
        )
        .optional()?;
    row.map(decode).transpose()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, record: JobRecord) -> Result<Uuid> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs
             (id, repo_url, repo_type, status, progress, error, created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                &record.repo_url,
                &record.repo_type,
                record.status.as_str(),
                &record.progress,
                &record.error,
                record.created_at.timestamp_micros(),
                record.updated_at.timestamp_micros(),
                metadata,
            ],
        )?;
        if inserted == 0 {
            return Err(StorageError::conflict(format!(
                "Job already exists: {}",
                record.id
            )));
        }
        Ok(record.id)
    }

    async fn get(&self, id: Uuid) -> Result<JobRecord> {
        let conn = self.conn.lock();
        load(&conn, id)?.ok_or_else(|| StorageError::job_not_found(id))
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs ORDER BY created_at DESC, rowid DESC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode).collect()
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![status.as_str()], JobRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode).collect()
    }

    async fn update(
        &self,
        id: Uuid,
        patch: JobPatch,
        expected: JobStatus,
    ) -> Result<UpdateOutcome> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let mut record = load(&tx, id)?.ok_or_else(|| StorageError::job_not_found(id))?;
        if record.status != expected {
            return Ok(UpdateOutcome::Conflict {
                current: record.status,
            });
        }

        record.apply(patch, Utc::now());
        let metadata = serde_json::to_string(&record.metadata)?;

        // Guard repeated in the WHERE clause so the write is a CAS even if
        // another connection touches the file.
        let changed = tx.execute(
            "UPDATE jobs
             SET status = ?1, progress = ?2, error = ?3, updated_at = ?4, metadata = ?5
             WHERE id = ?6 AND status = ?7",
            params![
                record.status.as_str(),
                &record.progress,
                &record.error,
                record.updated_at.timestamp_micros(),
                metadata,
                id.to_string(),
                expected.as_str(),
            ],
        )?;
        tx.commit()?;

        if changed == 0 {
            let current = self.current_status(&conn, id)?;
            debug!(job_id = %id, expected = %expected, current = %current, "guarded update lost a race");
            return Ok(UpdateOutcome::Conflict { current });
        }
        Ok(UpdateOutcome::Updated(record))
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

impl SqliteJobStore {
    fn current_status(&self, conn: &Connection, id: Uuid) -> Result<JobStatus> {
        load(conn, id)?
            .map(|r| r.status)
            .ok_or_else(|| StorageError::job_not_found(id))
    }
}
