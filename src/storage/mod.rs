//! Durable storage access for query output.
//!
//! Uses the `object_store` crate uniformly: S3 for real deployments, a local
//! directory or memory for development and tests. One [`ObjectStorage`] is
//! bound to the bucket of the configured output location.

mod path;

pub use path::S3Path;

use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{QuarryError, Result};

/// Object storage bound to one bucket.
#[derive(Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("store", &self.store.to_string())
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl ObjectStorage {
    /// Wraps an existing store.
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Connects to S3. Credentials come from the standard AWS environment
    /// variables.
    pub fn s3(bucket: &str, region: &str) -> Result<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region)
            .build()
            .map_err(|e| QuarryError::config(format!("S3: {e}")))?;
        Ok(Self::new(Arc::new(store), bucket))
    }

    /// Uses a local directory; keys map to files below `root/<bucket>`.
    pub fn local(root: &Path, bucket: &str) -> Result<Self> {
        let dir = root.join(bucket);
        std::fs::create_dir_all(&dir).map_err(|e| {
            QuarryError::config(format!(
                "Failed to create storage directory '{}': {e}",
                dir.display()
            ))
        })?;
        let store = LocalFileSystem::new_with_prefix(&dir)
            .map_err(|e| QuarryError::config(format!("LocalFileSystem: {e}")))?;
        Ok(Self::new(Arc::new(store), bucket))
    }

    /// Keeps objects in memory.
    pub fn in_memory(bucket: &str) -> Self {
        Self::new(Arc::new(InMemory::new()), bucket)
    }

    /// Bucket this storage is bound to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_path(&self, path: &S3Path) -> Result<ObjectPath> {
        if path.bucket() != self.bucket {
            return Err(QuarryError::storage(format!(
                "{path} is outside bucket '{}'",
                self.bucket
            )));
        }
        ObjectPath::parse(path.key())
            .map_err(|e| QuarryError::storage(format!("Invalid object key for {path}: {e}")))
    }

    /// Lists objects below `prefix`, sorted by key. Empty objects (directory
    /// markers) are skipped.
    pub async fn list(&self, prefix: &S3Path) -> Result<Vec<S3Path>> {
        let key = self.object_path(prefix)?;
        let prefix_key = (!key.as_ref().is_empty()).then_some(key);

        let mut stream = self.store.list(prefix_key.as_ref());
        let mut paths = Vec::new();
        while let Some(result) = stream.next().await {
            let meta =
                result.map_err(|e| QuarryError::storage(format!("Failed to list {prefix}: {e}")))?;
            if meta.size == 0 {
                continue;
            }
            paths.push(S3Path::parse(&format!("s3://{}/{}", self.bucket, meta.location))?);
        }

        paths.sort_by(|a, b| a.key().cmp(b.key()));
        debug!("Listed {} objects under {}", paths.len(), prefix);
        Ok(paths)
    }

    /// Reads a whole object.
    pub async fn read(&self, path: &S3Path) -> Result<Bytes> {
        let key = self.object_path(path)?;
        let result = self
            .store
            .get(&key)
            .await
            .map_err(|e| QuarryError::storage(format!("Failed to read {path}: {e}")))?;
        result
            .bytes()
            .await
            .map_err(|e| QuarryError::storage(format!("Failed to read {path}: {e}")))
    }

    /// Writes a whole object, replacing any existing one.
    pub async fn write(&self, path: &S3Path, data: Bytes) -> Result<()> {
        let key = self.object_path(path)?;
        self.store
            .put(&key, data.into())
            .await
            .map_err(|e| QuarryError::storage(format!("Failed to write {path}: {e}")))?;
        Ok(())
    }

    /// Deletes every object below `prefix`. Returns how many were deleted.
    pub async fn delete_prefix(&self, prefix: &S3Path) -> Result<usize> {
        let key = self.object_path(prefix)?;
        let prefix_key = (!key.as_ref().is_empty()).then_some(key);

        let mut stream = self.store.list(prefix_key.as_ref());
        let mut locations = Vec::new();
        while let Some(result) = stream.next().await {
            let meta =
                result.map_err(|e| QuarryError::storage(format!("Failed to list {prefix}: {e}")))?;
            locations.push(meta.location);
        }
        drop(stream);

        for location in &locations {
            self.store.delete(location).await.map_err(|e| {
                QuarryError::storage(format!("Failed to delete s3://{}/{location}: {e}", self.bucket))
            })?;
        }
        debug!("Deleted {} objects under {}", locations.len(), prefix);
        Ok(locations.len())
    }
}
