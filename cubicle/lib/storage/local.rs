//! Blob storage under a local filesystem root.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use walkdir::WalkDir;

use super::{normalize_key, StorageBackend};
use crate::{
    utils::{sibling_temp_path, write_atomic},
    CubicleError, CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A storage backend that keeps blobs as files under a configured root.
///
/// `put` writes to a temporary file in the destination directory and renames it
/// into place, so a partially written object is never observable.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalStorage {
    /// Creates the backend, creating the root directory if needed.
    pub async fn new(root: PathBuf) -> CubicleResult<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> CubicleResult<PathBuf> {
        Ok(self.root.join(normalize_key(key)?))
    }

    async fn ensure_parent(&self, path: &Path) -> CubicleResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn put(&self, key: &str, data: Bytes) -> CubicleResult<()> {
        let path = self.key_path(key)?;
        self.ensure_parent(&path).await?;
        write_atomic(&path, &data).await
    }

    async fn put_file(&self, key: &str, source: &Path) -> CubicleResult<()> {
        let path = self.key_path(key)?;
        self.ensure_parent(&path).await?;

        let tmp = sibling_temp_path(&path);
        fs::copy(source, &tmp).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> CubicleResult<Bytes> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CubicleError::NotFound(format!("no such key: {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> CubicleResult<()> {
        let path = self.key_path(key)?;
        if !fs::try_exists(&path).await? {
            return Err(CubicleError::NotFound(format!("no such key: {}", key)));
        }

        let tmp = sibling_temp_path(dest);
        fs::copy(&path, &tmp).await?;
        if let Err(e) = fs::rename(&tmp, dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> CubicleResult<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        // The walk is synchronous; run it off the async threads.
        let keys = tokio::task::spawn_blocking(move || -> CubicleResult<Vec<String>> {
            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                // Skip in-flight temporaries.
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await??;

        Ok(keys)
    }

    async fn delete(&self, key: &str) -> CubicleResult<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> CubicleResult<bool> {
        let path = self.key_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn probe(&self) -> CubicleResult<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() -> anyhow::Result<()> {
        let (_dir, storage) = backend().await;

        storage
            .put("snapshots/u_a/one.tar.zst", Bytes::from_static(b"payload"))
            .await?;
        assert_eq!(storage.get("snapshots/u_a/one.tar.zst").await?, "payload");
        assert!(storage.exists("snapshots/u_a/one.tar.zst").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, storage) = backend().await;
        assert!(matches!(
            storage.get("snapshots/u_a/absent").await,
            Err(CubicleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> anyhow::Result<()> {
        let (_dir, storage) = backend().await;
        storage.put("k", Bytes::from_static(b"x")).await?;
        storage.delete("k").await?;
        storage.delete("k").await?;
        assert!(!storage.exists("k").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_is_lexicographic_and_prefix_scoped() -> anyhow::Result<()> {
        let (_dir, storage) = backend().await;
        for key in ["snapshots/u_a/b", "snapshots/u_a/a", "snapshots/u_b/c"] {
            storage.put(key, Bytes::from_static(b"x")).await?;
        }

        let keys = storage.list("snapshots/u_a/").await?;
        assert_eq!(keys, vec!["snapshots/u_a/a", "snapshots/u_a/b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let (_dir, storage) = backend().await;
        assert!(storage.get("../../etc/passwd").await.is_err());
        assert!(storage
            .put("/abs/key", Bytes::from_static(b"x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_put_file_round_trip() -> anyhow::Result<()> {
        let (_dir, storage) = backend().await;
        let src = tempfile::NamedTempFile::new()?;
        tokio::fs::write(src.path(), b"archive bytes").await?;

        storage.put_file("snapshots/u_a/s.tar.zst", src.path()).await?;
        assert_eq!(
            storage.get("snapshots/u_a/s.tar.zst").await?,
            "archive bytes"
        );

        let out = tempfile::tempdir()?;
        let dest = out.path().join("restored");
        storage.get_to_file("snapshots/u_a/s.tar.zst", &dest).await?;
        assert_eq!(tokio::fs::read(&dest).await?, b"archive bytes");
        Ok(())
    }
}
