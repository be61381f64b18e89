//! repowiki-storage - Job records and artifact objects
//!
//! ## Core Principles
//!
//! 1. **Single owner**: the job store owns every `JobRecord`; executors only
//!    mutate through guarded `update` calls
//! 2. **Compare-and-set**: `update(id, patch, expected)` is the only
//!    concurrency-control primitive for job state
//! 3. **Opaque objects**: the object store knows nothing about cache layout
//!
//! ## Backends
//!
//! | Port          | Adapters                                        |
//! |---------------|-------------------------------------------------|
//! | `JobStore`    | `MemoryJobStore`, `SqliteJobStore` (`sqlite`)   |
//! | `ObjectStore` | `MemoryObjectStore`, `FsObjectStore`, `GcsObjectStore` (`gcs`) |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use repowiki_storage::{JobPatch, JobRecord, JobStatus, JobStore, SqliteJobStore};
//!
//! let store = SqliteJobStore::open("jobs.sqlite3")?;
//! let id = store.create(JobRecord::new_queued(url, "github", metadata)).await?;
//!
//! // Claim: only one caller wins
//! let outcome = store
//!     .update(id, JobPatch::status(JobStatus::Running), JobStatus::Queued)
//!     .await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{JobPatch, JobRecord, JobStatus, JobStore, ObjectStore, UpdateOutcome};
pub use infrastructure::{FsObjectStore, MemoryJobStore, MemoryObjectStore};

#[cfg(feature = "gcs")]
pub use infrastructure::GcsObjectStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteJobStore;
