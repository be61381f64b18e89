//! In-memory adapters
//!
//! Used for tests and for deployments that accept losing job history on
//! restart.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{JobPatch, JobRecord, JobStatus, JobStore, ObjectStore, UpdateOutcome};
use crate::{Result, StorageError};

#[derive(Default)]
struct JobTable {
    records: HashMap<Uuid, JobRecord>,
    /// Admission order
    order: Vec<Uuid>,
}

/// HashMap-backed job store
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    table: Arc<RwLock<JobTable>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, record: JobRecord) -> Result<Uuid> {
        let mut table = self.table.write();
        if table.records.contains_key(&record.id) {
            return Err(StorageError::conflict(format!(
                "Job already exists: {}",
                record.id
            )));
        }
        let id = record.id;
        table.order.push(id);
        table.records.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<JobRecord> {
        self.table
            .read()
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::job_not_found(id))
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        let table = self.table.read();
        let mut records: Vec<(usize, JobRecord)> = table
            .order
            .iter()
            .enumerate()
            .filter_map(|(seq, id)| table.records.get(id).map(|r| (seq, r.clone())))
            .collect();
        records.sort_by(|(sa, a), (sb, b)| b.created_at.cmp(&a.created_at).then(sb.cmp(sa)));
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        let table = self.table.read();
        let mut records: Vec<JobRecord> = table
            .order
            .iter()
            .filter_map(|id| table.records.get(id))
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        // order is admission order; stable sort keeps it for equal timestamps
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn update(
        &self,
        id: Uuid,
        patch: JobPatch,
        expected: JobStatus,
    ) -> Result<UpdateOutcome> {
        let mut table = self.table.write();
        let record = table
            .records
            .get_mut(&id)
            .ok_or_else(|| StorageError::job_not_found(id))?;

        if record.status != expected {
            return Ok(UpdateOutcome::Conflict {
                current: record.status,
            });
        }

        record.apply(patch, Utc::now());
        Ok(UpdateOutcome::Updated(record.clone()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// HashMap-backed object store
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Overwrite raw bytes (tests use this to simulate corruption)
    pub fn insert_raw(&self, name: &str, bytes: Vec<u8>) {
        self.objects.write().insert(name.to_string(), bytes);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().get(name).cloned())
    }

    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.write().insert(name.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.objects.write().remove(name);
        Ok(())
    }

    fn location(&self) -> String {
        "memory://".to_string()
    }
}
