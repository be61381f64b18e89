//! Filesystem object store
//!
//! Objects live under a root directory; object names map to relative paths.
//! Writes go to a temp file first and are renamed into place, so readers
//! never observe a partial object.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::domain::ObjectStore;
use crate::{Result, StorageError};

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::object_store(format!(
                "invalid object name: {:?}",
                name
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();

        assert!(store.get("adalflow/repos/clone/ab").await.unwrap().is_none());
        store
            .put("adalflow/repos/clone/ab", b"payload".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.get("adalflow/repos/clone/ab").await.unwrap(),
            Some(b"payload".to_vec())
        );
        assert!(dir.path().join("adalflow/repos/clone/ab").exists());

        store.delete("adalflow/repos/clone/ab").await.unwrap();
        assert!(store.get("adalflow/repos/clone/ab").await.unwrap().is_none());
        // deleting twice is fine
        store.delete("adalflow/repos/clone/ab").await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        store.put("k", b"one".to_vec()).await.unwrap();
        store.put("k", b"two".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        assert!(store.put("../outside", vec![1]).await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
        assert!(store.get("").await.is_err());
    }
}
