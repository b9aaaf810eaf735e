//! Blob storage backends for snapshot payloads.
//!
//! Keys are slash-separated relative paths (`snapshots/<user_id>/<file>`); a key
//! that normalizes outside the backend root is rejected before it reaches a
//! driver. Both drivers guarantee atomic `put` (readers never observe a partial
//! object), idempotent `delete`, and lexicographic `list` order.

mod local;
mod s3;

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    config::{Config, StorageKind},
    utils::{normalize_path, PathKind},
    CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use local::*;
pub use s3::*;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A blob store for snapshot payloads and metadata.
///
/// Implementations are internally thread-safe; callers share them behind an
/// `Arc` and issue concurrent operations freely.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Writes a whole object atomically.
    async fn put(&self, key: &str, data: Bytes) -> CubicleResult<()>;

    /// Streams a local file into the store.
    ///
    /// Large files may be uploaded in parts, but the object only becomes
    /// observable once complete.
    async fn put_file(&self, key: &str, path: &Path) -> CubicleResult<()>;

    /// Reads a whole object. Fails with `NotFound` for missing keys.
    async fn get(&self, key: &str) -> CubicleResult<Bytes>;

    /// Streams an object into a local file, atomically replacing it.
    async fn get_to_file(&self, key: &str, path: &Path) -> CubicleResult<()>;

    /// Lists keys under a prefix in lexicographic order.
    async fn list(&self, prefix: &str) -> CubicleResult<Vec<String>>;

    /// Deletes an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> CubicleResult<()>;

    /// Whether an object exists.
    async fn exists(&self, key: &str) -> CubicleResult<bool>;

    /// Cheap readiness check used by `/health/ready`.
    async fn probe(&self) -> CubicleResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Opens the storage backend selected by configuration.
pub async fn open_backend(config: &Config) -> CubicleResult<Arc<dyn StorageBackend>> {
    match config.get_storage_backend() {
        StorageKind::Local => {
            let backend = LocalStorage::new(config.get_storage_root().clone()).await?;
            Ok(Arc::new(backend))
        }
        StorageKind::S3 => {
            let backend =
                S3Storage::new(config.get_s3(), *config.get_multipart_threshold_bytes()).await?;
            Ok(Arc::new(backend))
        }
    }
}

/// Normalizes a storage key, rejecting traversal and absolute shapes.
pub(crate) fn normalize_key(key: &str) -> CubicleResult<String> {
    normalize_path(key, PathKind::Relative)
}
