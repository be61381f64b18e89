//! Google Cloud Storage object store (JSON API)
//!
//! Authentication: `GOOGLE_OAUTH_ACCESS_TOKEN` if set, otherwise a token from
//! the GCE metadata server. Tokens are cached until shortly before expiry.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::domain::ObjectStore;
use crate::{Result, StorageError};

const STORAGE_API: &str = "https://storage.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

pub struct GcsObjectStore {
    bucket: String,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl GcsObjectStore {
    pub fn new(bucket: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(StorageError::config("GCS bucket name is empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            bucket,
            client,
            token: Mutex::new(None),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn access_token(&self) -> Result<String> {
        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            if !token.is_empty() {
                return Ok(token);
            }
        }

        if let Some(cached) = self.token.lock().clone() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value);
            }
        }

        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "GCS metadata server unreachable");
                StorageError::object_store(format!("GCS credentials unavailable: {}", e))
                    .with_source(e)
            })?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "GCS metadata server refused a token");
            return Err(StorageError::object_store(format!(
                "GCS credentials unavailable: metadata server returned {}",
                response.status()
            )));
        }
        let token: MetadataToken = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        debug!(expires_in = token.expires_in, "GCS access token refreshed");
        *self.token.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    /// `{api}/{segments...}`, each segment percent-encoded on its own
    fn api_url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(STORAGE_API)
            .map_err(|e| StorageError::config(format!("bad storage API URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::config("storage API URL cannot take a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Object names may contain `/`; they travel as a single path segment
    fn object_url(&self, name: &str) -> Result<reqwest::Url> {
        self.api_url(["storage", "v1", "b", self.bucket.as_str(), "o", name])
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.object_url(name)?)
            .query(&[("alt", "media")])
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => {
                warn!(bucket = %self.bucket, object = name, %status, "GCS get failed");
                Err(StorageError::object_store(format!(
                    "GCS get {} failed: {}",
                    name, status
                )))
            }
        }
    }

    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let token = self.access_token().await?;
        let url = self.api_url(["upload", "storage", "v1", "b", self.bucket.as_str(), "o"])?;
        let response = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", name)])
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(bucket = %self.bucket, object = name, status = %response.status(), "GCS put failed");
            return Err(StorageError::object_store(format!(
                "GCS put {} failed: {}",
                name,
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .client
            .delete(self.object_url(name)?)
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => {
                warn!(bucket = %self.bucket, object = name, %status, "GCS delete failed");
                Err(StorageError::object_store(format!(
                    "GCS delete {} failed: {}",
                    name, status
                )))
            }
        }
    }

    fn location(&self) -> String {
        format!("gs://{}", self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_keeps_name_in_one_segment() {
        let store = GcsObjectStore::new("wiki-cache").unwrap();
        let url = store.object_url("adalflow/repos/clone/ab12").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/wiki-cache/o/adalflow%2Frepos%2Fclone%2Fab12"
        );
        let url = store.object_url("a b?c#d").unwrap();
        assert!(url.as_str().ends_with("/o/a%20b%3Fc%23d"), "{}", url);
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_upload_url() {
        let store = GcsObjectStore::new("wiki-cache").unwrap();
        let url = store
            .api_url(["upload", "storage", "v1", "b", "wiki-cache", "o"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/upload/storage/v1/b/wiki-cache/o"
        );
    }

    #[test]
    fn test_empty_bucket_rejected() {
        assert!(GcsObjectStore::new("").is_err());
    }

    #[test]
    fn test_location() {
        let store = GcsObjectStore::new("wiki-cache").unwrap();
        assert_eq!(store.location(), "gs://wiki-cache");
        assert!(store
            .object_url("x/y")
            .unwrap()
            .as_str()
            .ends_with("/b/wiki-cache/o/x%2Fy"));
    }
}
