//! Infrastructure layer - Storage adapters
//!
//! - Job stores: in-memory, SQLite
//! - Object stores: in-memory, filesystem, GCS

pub mod fs_object_store;
pub mod memory;

#[cfg(feature = "gcs")]
pub mod gcs;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use fs_object_store::FsObjectStore;
pub use memory::{MemoryJobStore, MemoryObjectStore};

#[cfg(feature = "gcs")]
pub use gcs::GcsObjectStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;
