//! Engine configuration
//!
//! Every knob has a documented default. A missing variable is never fatal;
//! a malformed one is logged and replaced by its default.

use crate::job::CredentialPolicy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Where admitted-but-undispatched job ids live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackendKind {
    /// Lost on restart; startup recovery re-enqueues from the job store
    InMemory,
    /// Redis list (`LPUSH` / `RPOP`)
    Redis { url: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackendKind {
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackendKind {
    Memory,
    Filesystem { root: PathBuf },
    Gcs { bucket: String },
}

/// Extract stage knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractConfig {
    pub max_file_bytes: u64,
    /// Words per chunk
    pub chunk_size: usize,
    /// Words shared by consecutive chunks
    pub chunk_overlap: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 256 * 1024,
            chunk_size: 350,
            chunk_overlap: 100,
        }
    }
}

/// Bounded retry for transient provider failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Backoff before retry `n` is `base_backoff * 2^n`
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_workers: usize,
    pub queue: QueueBackendKind,
    pub store: StoreBackendKind,
    pub cache: CacheBackendKind,
    pub cache_prefix: String,
    pub default_provider: String,
    pub default_model: String,
    pub embedder: String,
    pub embedding_model: String,
    pub retry: RetryPolicy,
    pub port: u16,
    pub extract: ExtractConfig,
    pub credentials: CredentialPolicy,
}

pub const DEFAULT_CACHE_PREFIX: &str = "adalflow/repos";
pub const DEFAULT_QUEUE_KEY: &str = "job_queue";

/// `min(8, 2 * cpus)`
pub fn default_worker_count() -> usize {
    (num_cpus::get() * 2).clamp(1, 8)
}

fn adalflow_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".adalflow")
}

impl EngineConfig {
    /// Load from the process environment (and `.env` if present)
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_workers = parse_or(&var, "MAX_JOB_WORKERS", default_worker_count());
        let max_workers = if max_workers == 0 {
            warn!("MAX_JOB_WORKERS=0 is not allowed, using 1");
            1
        } else {
            max_workers
        };

        let queue = match var("REDIS_URL") {
            Some(url) => QueueBackendKind::Redis {
                url,
                key: var("JOB_QUEUE_KEY").unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string()),
            },
            None => QueueBackendKind::InMemory,
        };

        let store = match var("JOB_STORE").as_deref() {
            Some("memory") => StoreBackendKind::Memory,
            Some("sqlite") | None => StoreBackendKind::Sqlite {
                path: var("JOB_STORE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| adalflow_dir().join("jobs.sqlite3")),
            },
            Some(other) => {
                warn!(value = %other, "unknown JOB_STORE, using sqlite");
                StoreBackendKind::Sqlite {
                    path: var("JOB_STORE_PATH")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| adalflow_dir().join("jobs.sqlite3")),
                }
            }
        };

        let cache = match var("CACHE_BUCKET") {
            Some(bucket) => CacheBackendKind::Gcs { bucket },
            None => CacheBackendKind::Filesystem {
                root: var("CACHE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| adalflow_dir().join("artifacts")),
            },
        };

        let defaults = ExtractConfig::default();
        let extract = ExtractConfig {
            max_file_bytes: parse_or(&var, "EXTRACT_MAX_FILE_BYTES", defaults.max_file_bytes),
            chunk_size: parse_or(&var, "CHUNK_SIZE", defaults.chunk_size).max(1),
            chunk_overlap: parse_or(&var, "CHUNK_OVERLAP", defaults.chunk_overlap),
        };
        let extract = if extract.chunk_overlap >= extract.chunk_size {
            warn!(
                chunk_size = extract.chunk_size,
                chunk_overlap = extract.chunk_overlap,
                "CHUNK_OVERLAP must be smaller than CHUNK_SIZE, using 0"
            );
            ExtractConfig {
                chunk_overlap: 0,
                ..extract
            }
        } else {
            extract
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: parse_or(&var, "PROVIDER_MAX_RETRIES", retry_defaults.max_retries),
            base_backoff: Duration::from_millis(parse_or(
                &var,
                "PROVIDER_BACKOFF_MS",
                retry_defaults.base_backoff.as_millis() as u64,
            )),
        };

        let mut credentials = CredentialPolicy::default();
        if let Some(extra) = var("CREDENTIAL_ENV_ALLOWLIST") {
            for name in split_list(&extra) {
                if !credentials.env.contains(&name) {
                    credentials.env.push(name);
                }
            }
        }
        if let Some(dirs) = var("CREDENTIAL_DIRS") {
            let dirs: Vec<PathBuf> = split_list(&dirs)
                .into_iter()
                .map(PathBuf::from)
                .filter(|dir| {
                    let absolute = dir.is_absolute();
                    if !absolute {
                        warn!(dir = %dir.display(), "CREDENTIAL_DIRS entries must be absolute, ignoring");
                    }
                    absolute
                })
                .collect();
            credentials.dirs = dirs;
        }

        Self {
            max_workers,
            queue,
            store,
            cache,
            cache_prefix: var("CACHE_PREFIX").unwrap_or_else(|| DEFAULT_CACHE_PREFIX.to_string()),
            default_provider: var("DEFAULT_PROVIDER")
                .map(|p| p.to_lowercase())
                .unwrap_or_else(|| "google".to_string()),
            default_model: var("DEFAULT_MODEL").unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            embedder: var("EMBEDDER")
                .map(|p| p.to_lowercase())
                .unwrap_or_else(|| "local".to_string()),
            embedding_model: var("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-004".to_string()),
            retry,
            port: parse_or(&var, "PORT", 8001),
            extract,
            credentials,
        }
    }

    /// Fully in-process configuration (tests, local experiments)
    pub fn in_memory() -> Self {
        Self {
            max_workers: 2,
            queue: QueueBackendKind::InMemory,
            store: StoreBackendKind::Memory,
            cache: CacheBackendKind::Memory,
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            default_provider: "local".to_string(),
            default_model: "local-template".to_string(),
            embedder: "local".to_string(),
            embedding_model: "local-hash-256".to_string(),
            retry: RetryPolicy {
                max_retries: 2,
                base_backoff: Duration::from_millis(1),
            },
            port: 0,
            extract: ExtractConfig::default(),
            credentials: CredentialPolicy::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    /// Non-secret summary for startup logs and `/health`
    pub fn summary(&self) -> HashMap<&'static str, String> {
        let mut out = HashMap::new();
        out.insert("max_workers", self.max_workers.to_string());
        out.insert(
            "queue",
            match &self.queue {
                QueueBackendKind::InMemory => "memory".to_string(),
                QueueBackendKind::Redis { key, .. } => format!("redis ({})", key),
            },
        );
        out.insert(
            "store",
            match &self.store {
                StoreBackendKind::Memory => "memory".to_string(),
                StoreBackendKind::Sqlite { path } => format!("sqlite ({})", path.display()),
            },
        );
        out.insert(
            "cache",
            match &self.cache {
                CacheBackendKind::Memory => "memory".to_string(),
                CacheBackendKind::Filesystem { root } => format!("file://{}", root.display()),
                CacheBackendKind::Gcs { bucket } => format!("gs://{}", bucket),
            },
        );
        out.insert("cache_prefix", self.cache_prefix.clone());
        out.insert(
            "default_binding",
            format!("{}/{}", self.default_provider, self.default_model),
        );
        out.insert(
            "embedder",
            format!("{}/{}", self.embedder, self.embedding_model),
        );
        out
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T, V>(var: &V, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "malformed value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.max_workers, default_worker_count());
        assert!(config.max_workers >= 1 && config.max_workers <= 8);
        assert_eq!(config.queue, QueueBackendKind::InMemory);
        assert!(matches!(config.store, StoreBackendKind::Sqlite { .. }));
        assert!(matches!(config.cache, CacheBackendKind::Filesystem { .. }));
        assert_eq!(config.cache_prefix, "adalflow/repos");
        assert_eq!(config.default_provider, "google");
        assert_eq!(config.default_model, "gemini-2.0-flash");
        assert_eq!(config.embedder, "local");
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.port, 8001);
        assert_eq!(config.extract, ExtractConfig::default());
    }

    #[test]
    fn test_explicit_values() {
        let config = config_from(&[
            ("MAX_JOB_WORKERS", "3"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("CACHE_BUCKET", "wiki-cache"),
            ("CACHE_PREFIX", "custom/prefix"),
            ("JOB_STORE", "memory"),
            ("DEFAULT_PROVIDER", "OpenAI"),
            ("DEFAULT_MODEL", "gpt-4o"),
            ("PROVIDER_BACKOFF_MS", "10"),
        ]);
        assert_eq!(config.max_workers, 3);
        assert_eq!(
            config.queue,
            QueueBackendKind::Redis {
                url: "redis://localhost:6379".to_string(),
                key: "job_queue".to_string()
            }
        );
        assert_eq!(
            config.cache,
            CacheBackendKind::Gcs {
                bucket: "wiki-cache".to_string()
            }
        );
        assert_eq!(config.cache_prefix, "custom/prefix");
        assert_eq!(config.store, StoreBackendKind::Memory);
        assert_eq!(config.default_provider, "openai");
        assert_eq!(config.default_model, "gpt-4o");
        assert_eq!(config.retry.base_backoff, Duration::from_millis(10));
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = config_from(&[
            ("MAX_JOB_WORKERS", "lots"),
            ("PORT", "-1"),
            ("CHUNK_SIZE", "abc"),
        ]);
        assert_eq!(config.max_workers, default_worker_count());
        assert_eq!(config.port, 8001);
        assert_eq!(config.extract.chunk_size, 350);
    }

    #[test]
    fn test_zero_workers_clamped() {
        assert_eq!(config_from(&[("MAX_JOB_WORKERS", "0")]).max_workers, 1);
    }

    #[test]
    fn test_overlap_not_smaller_than_chunk() {
        let config = config_from(&[("CHUNK_SIZE", "50"), ("CHUNK_OVERLAP", "50")]);
        assert_eq!(config.extract.chunk_size, 50);
        assert_eq!(config.extract.chunk_overlap, 0);
    }

    #[test]
    fn test_credential_allowlists() {
        let config = config_from(&[]);
        assert_eq!(config.credentials, CredentialPolicy::default());

        let config = config_from(&[
            ("CREDENTIAL_ENV_ALLOWLIST", "TEAM_OPENAI_KEY, GOOGLE_API_KEY,"),
            ("CREDENTIAL_DIRS", "/var/lib/repowiki/keys,relative/dir"),
        ]);
        assert!(config.credentials.env.contains(&"TEAM_OPENAI_KEY".to_string()));
        assert!(config.credentials.env.contains(&"OPENAI_API_KEY".to_string()));
        assert_eq!(
            config.credentials.env.iter().filter(|n| *n == "GOOGLE_API_KEY").count(),
            1
        );
        assert_eq!(
            config.credentials.dirs,
            vec![PathBuf::from("/var/lib/repowiki/keys")]
        );
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = config_from(&[("REDIS_URL", "  "), ("CACHE_BUCKET", "")]);
        assert_eq!(config.queue, QueueBackendKind::InMemory);
        assert!(matches!(config.cache, CacheBackendKind::Filesystem { .. }));
    }
}
