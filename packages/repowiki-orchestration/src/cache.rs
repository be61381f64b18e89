//! Artifact cache
//!
//! Content-addressed store for stage outputs on top of an `ObjectStore`.
//!
//! # Key derivation
//!
//! ```text
//! blake3( "repowiki-cache-v1" | stage | input fingerprint | sorted (k, v) config )
//!   → object name "{prefix}/{stage}/{hex}"
//! ```
//!
//! Every field is length-prefixed, so no two distinct tuples hash the same
//! byte stream.
//!
//! # Integrity
//!
//! Entries are a bincode `CacheEntry` envelope carrying the blake3 hash of the
//! payload. A read whose hash does not verify drops the entry and counts as a
//! miss. A write that finds a *different* payload under the same key logs the
//! corruption, drops the entry and rewrites it.

use crate::error::{OrchestratorError, Result};
use crate::job::Stage;
use chrono::Utc;
use repowiki_storage::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const ENVELOPE_VERSION: u32 = 1;
const KEY_DOMAIN: &[u8] = b"repowiki-cache-v1";

/// 32-byte blake3 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn builder() -> FingerprintBuilder {
        FingerprintBuilder {
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// First 12 hex chars, for logs
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental fingerprint over length-prefixed fields
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
}

impl FingerprintBuilder {
    pub fn field(mut self, bytes: &[u8]) -> Self {
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn str_field(self, s: &str) -> Self {
        self.field(s.as_bytes())
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(*self.hasher.finalize().as_bytes())
    }
}

/// Cache key: `(stage, input fingerprint, configuration)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub stage: Stage,
    pub input: Fingerprint,
    /// Sorted by construction
    pub config: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(stage: Stage, input: Fingerprint, config: BTreeMap<String, String>) -> Self {
        Self {
            stage,
            input,
            config,
        }
    }

    pub fn digest(&self) -> Fingerprint {
        let mut builder = Fingerprint::builder()
            .field(KEY_DOMAIN)
            .str_field(self.stage.as_str())
            .field(self.input.as_bytes())
            .field(&(self.config.len() as u64).to_le_bytes());
        for (k, v) in &self.config {
            builder = builder.str_field(k).str_field(v);
        }
        builder.finish()
    }

    pub fn object_name(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", self.stage.as_str(), self.digest().to_hex())
        } else {
            format!("{}/{}/{}", prefix, self.stage.as_str(), self.digest().to_hex())
        }
    }
}

/// Stored envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version: u32,
    pub stage: String,
    pub content_hash: Fingerprint,
    pub payload: Vec<u8>,
    /// Unix micros
    pub created_at: i64,
}

impl CacheEntry {
    pub fn new(stage: Stage, payload: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            stage: stage.as_str().to_string(),
            content_hash: Fingerprint::of(&payload),
            payload,
            created_at: Utc::now().timestamp_micros(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and verify. `None` for anything that fails to verify.
    pub fn decode_verified(bytes: &[u8]) -> Option<Self> {
        let entry: CacheEntry = bincode::deserialize(bytes).ok()?;
        if entry.version != ENVELOPE_VERSION {
            return None;
        }
        if Fingerprint::of(&entry.payload) != entry.content_hash {
            return None;
        }
        Some(entry)
    }
}

#[derive(Debug, Default)]
struct StageCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cache access counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
    corrupted: AtomicU64,
    stages: [StageCounters; 4],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
    pub corrupted: u64,
    pub stages: BTreeMap<String, StageStatsSnapshot>,
}

impl CacheStatsSnapshot {
    pub fn stage(&self, stage: Stage) -> StageStatsSnapshot {
        self.stages.get(stage.as_str()).copied().unwrap_or_default()
    }
}

impl CacheStats {
    fn hit(&self, stage: Stage) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.stages[stage.index()].hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self, stage: Stage) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.stages[stage.index()]
            .misses
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            stages: Stage::ALL
                .iter()
                .map(|stage| {
                    let c = &self.stages[stage.index()];
                    (
                        stage.as_str().to_string(),
                        StageStatsSnapshot {
                            hits: c.hits.load(Ordering::Relaxed),
                            misses: c.misses.load(Ordering::Relaxed),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// Identical content already stored; nothing written
    Unchanged,
    /// Different or unreadable content was dropped and replaced
    Rewritten,
}

/// Result of `lookup_or_compute`
#[derive(Debug, Clone)]
pub struct Cached {
    pub payload: Vec<u8>,
    /// Fingerprint of `payload`; the next stage's input fingerprint
    pub fingerprint: Fingerprint,
    pub hit: bool,
}

pub struct ArtifactCache {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    stats: CacheStats,
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            stats: CacheStats::default(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn location(&self) -> String {
        let base = self.store.location();
        if base.ends_with('/') {
            format!("{}{}", base, self.prefix)
        } else {
            format!("{}/{}", base, self.prefix)
        }
    }

    pub fn object_name(&self, key: &CacheKey) -> String {
        key.object_name(&self.prefix)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Cached payload for `key`, or `None` on miss.
    ///
    /// Fails only with `CacheIo` when the backing store is unreachable.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let name = self.object_name(key);
        let found = self.read_verified(&name).await?;
        match &found {
            Some(_) => self.stats.hit(key.stage),
            None => self.stats.miss(key.stage),
        }
        Ok(found)
    }

    /// Verified payload by object name (e.g. a `wiki_key` stored on a job)
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.read_verified(name).await
    }

    async fn read_verified(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let raw = self.store.get(name).await.map_err(|e| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            OrchestratorError::CacheIo(e.to_string())
        })?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match CacheEntry::decode_verified(&raw) {
            Some(entry) => Ok(Some(entry.payload)),
            None => {
                self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
                warn!(object = %name, "cache entry failed verification, dropping");
                if let Err(e) = self.store.delete(name).await {
                    warn!(object = %name, error = %e, "failed to drop corrupted cache entry");
                }
                Ok(None)
            }
        }
    }

    /// Idempotent write.
    ///
    /// Same-key writes must carry identical content; anything else is treated
    /// as corruption and the stored entry is replaced.
    pub async fn put(&self, key: &CacheKey, payload: Vec<u8>) -> Result<PutOutcome> {
        let name = self.object_name(key);
        let entry = CacheEntry::new(key.stage, payload);

        let existing = self.store.get(&name).await.map_err(|e| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            OrchestratorError::CacheIo(e.to_string())
        })?;

        let outcome = match existing.as_deref().map(CacheEntry::decode_verified) {
            None => PutOutcome::Written,
            Some(Some(stored)) if stored.content_hash == entry.content_hash => {
                debug!(object = %name, "identical cache entry already present");
                return Ok(PutOutcome::Unchanged);
            }
            Some(_) => {
                self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    object = %name,
                    stage = %key.stage,
                    "conflicting cache entry for identical key, rewriting"
                );
                self.store.delete(&name).await.map_err(|e| {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    OrchestratorError::CacheIo(e.to_string())
                })?;
                PutOutcome::Rewritten
            }
        };

        self.store.put(&name, entry.encode()?).await.map_err(|e| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            OrchestratorError::CacheIo(e.to_string())
        })?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    /// Return the cached payload or compute, store and return it.
    ///
    /// Cache I/O failures never fail the caller: they are logged and the
    /// payload is computed without the cache. Errors from `compute` propagate.
    pub async fn lookup_or_compute<F, Fut>(&self, key: &CacheKey, compute: F) -> Result<Cached>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        match self.get(key).await {
            Ok(Some(payload)) => {
                return Ok(Cached {
                    fingerprint: Fingerprint::of(&payload),
                    payload,
                    hit: true,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(stage = %key.stage, error = %e, "cache read failed, recomputing without cache");
            }
        }

        let payload = compute().await?;

        if let Err(e) = self.put(key, payload.clone()).await {
            warn!(stage = %key.stage, error = %e, "cache write failed, continuing");
        }

        Ok(Cached {
            fingerprint: Fingerprint::of(&payload),
            payload,
            hit: false,
        })
    }
}
