//! Snapshot lifecycle: create, restore, list, delete, retention.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use chrono::Utc;
use rand::distributions::{Alphanumeric, DistString};
use tokio::fs;
use tracing::{info, warn};

use super::{
    meta_key, pack_workspace, payload_key, unpack_archive, Snapshot, SNAPSHOT_COMPRESSION,
    SNAPSHOT_META_SUFFIX,
};
use crate::{
    config::Config,
    metrics::Metrics,
    storage::StorageBackend,
    utils::{new_snapshot_id, validate_id, with_retry, RetryPolicy},
    CubicleError, CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates, restores, and expires workspace snapshots against a storage backend.
///
/// The engine never touches a live workspace during `create`; the caller holds
/// the per-sandbox write gate so no writer is admitted while the archive is
/// taken. `create` and `restore` are both all-or-nothing.
pub struct SnapshotEngine {
    backend: Arc<dyn StorageBackend>,
    metrics: Arc<Metrics>,
    retention: usize,
    compression_level: i32,
    preserve_mtime: bool,
    retry: RetryPolicy,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotEngine {
    /// Creates an engine from configuration.
    pub fn new(config: &Config, backend: Arc<dyn StorageBackend>, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            metrics,
            retention: *config.get_snapshot_retention(),
            compression_level: *config.get_snapshot_compression_level(),
            preserve_mtime: *config.get_restore_preserve_mtime(),
            retry: RetryPolicy::backend(),
        }
    }

    /// Archives `source_workspace_path` into a new snapshot owned by `user_id`.
    ///
    /// Retention is enforced afterwards; a retention failure is logged and does
    /// not roll back the snapshot.
    pub async fn create(
        &self,
        user_id: &str,
        sandbox_id: Option<&str>,
        source_workspace_path: &Path,
    ) -> CubicleResult<Snapshot> {
        validate_id(user_id, "user_id")?;
        if let Some(id) = sandbox_id {
            validate_id(id, "sandbox_id")?;
        }
        if !fs::try_exists(source_workspace_path).await? {
            return Err(CubicleError::NotFound(format!(
                "workspace not found: {}",
                source_workspace_path.display()
            )));
        }

        let snapshot_id = new_snapshot_id();
        let spool = tempfile::Builder::new()
            .prefix(&format!(".{}-", snapshot_id))
            .suffix(".tar.zst")
            .tempfile()?;
        let spool_path = spool.path().to_path_buf();

        let workspace = source_workspace_path.to_path_buf();
        let level = self.compression_level;
        let summary = tokio::task::spawn_blocking(move || {
            pack_workspace(&workspace, &spool_path, level)
        })
        .await??;

        let key = payload_key(user_id, &snapshot_id);
        with_retry(self.retry, "snapshot.upload", || {
            self.backend.put_file(&key, spool.path())
        })
        .await?;

        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            user_id: user_id.to_string(),
            sandbox_id: sandbox_id.map(str::to_string),
            size_bytes: summary.size_bytes,
            created_at: Utc::now(),
            source_workspace_path: source_workspace_path.to_path_buf(),
            compression: SNAPSHOT_COMPRESSION.to_string(),
            digest: summary.digest,
        };

        let meta = Bytes::from(serde_json::to_vec(&snapshot)?);
        let mkey = meta_key(user_id, &snapshot_id);
        with_retry(self.retry, "snapshot.upload_meta", || {
            self.backend.put(&mkey, meta.clone())
        })
        .await?;

        self.metrics.snapshot_created_total.inc();
        self.metrics
            .snapshot_size_bytes
            .observe(snapshot.size_bytes as f64);
        info!(
            user_id,
            snapshot_id,
            size_bytes = snapshot.size_bytes,
            "snapshot created"
        );

        if let Err(e) = self.enforce_retention(user_id, self.retention).await {
            warn!(user_id, error = %e, "retention enforcement failed");
        }

        Ok(snapshot)
    }

    /// Replaces `target_workspace_path` with the contents of a snapshot.
    ///
    /// The archive is extracted into a sibling directory first; the live
    /// workspace is swapped in a final rename and is left intact when anything
    /// before that fails.
    pub async fn restore(
        &self,
        user_id: &str,
        snapshot_id: &str,
        target_workspace_path: &Path,
    ) -> CubicleResult<()> {
        validate_id(user_id, "user_id")?;
        validate_id(snapshot_id, "snapshot_id")?;

        let key = payload_key(user_id, snapshot_id);
        let spool = tempfile::Builder::new()
            .prefix(&format!(".{}-", snapshot_id))
            .suffix(".tar.zst")
            .tempfile()?;
        with_retry(self.retry, "snapshot.download", || {
            self.backend.get_to_file(&key, spool.path())
        })
        .await
        .map_err(|e| match e {
            CubicleError::NotFound(_) => {
                CubicleError::NotFound(format!("snapshot not found: {}", snapshot_id))
            }
            other => other,
        })?;

        let staging = sibling_dir(target_workspace_path, "restore");
        let archive = spool.path().to_path_buf();
        let staging_clone = staging.clone();
        let preserve = self.preserve_mtime;
        let unpacked = tokio::task::spawn_blocking(move || {
            unpack_archive(&archive, &staging_clone, preserve)
        })
        .await?;

        if let Err(e) = unpacked {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        self.swap_workspace(target_workspace_path, &staging).await?;
        self.metrics.snapshot_restored_total.inc();
        info!(user_id, snapshot_id, "snapshot restored");
        Ok(())
    }

    /// Lists a user's snapshots, newest first.
    pub async fn list(&self, user_id: &str) -> CubicleResult<Vec<Snapshot>> {
        validate_id(user_id, "user_id")?;

        let prefix = format!("{}/{}/", super::SNAPSHOT_KEY_PREFIX, user_id);
        let keys = with_retry(self.retry, "snapshot.list", || self.backend.list(&prefix)).await?;

        let mut snapshots = Vec::new();
        for key in keys.iter().filter(|k| k.ends_with(SNAPSHOT_META_SUFFIX)) {
            match self.backend.get(key).await {
                Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(e) => warn!(key, error = %e, "skipping unreadable snapshot metadata"),
                },
                Err(CubicleError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.snapshot_id.cmp(&a.snapshot_id))
        });
        Ok(snapshots)
    }

    /// Deletes a snapshot's payload and metadata. Idempotent.
    pub async fn delete(&self, user_id: &str, snapshot_id: &str) -> CubicleResult<()> {
        validate_id(user_id, "user_id")?;
        validate_id(snapshot_id, "snapshot_id")?;

        let pkey = payload_key(user_id, snapshot_id);
        let mkey = meta_key(user_id, snapshot_id);
        with_retry(self.retry, "snapshot.delete", || self.backend.delete(&pkey)).await?;
        with_retry(self.retry, "snapshot.delete_meta", || {
            self.backend.delete(&mkey)
        })
        .await?;
        Ok(())
    }

    /// Deletes snapshots beyond the `keep` most recent for `user_id`.
    pub async fn enforce_retention(&self, user_id: &str, keep: usize) -> CubicleResult<()> {
        let snapshots = self.list(user_id).await?;
        for snapshot in snapshots.iter().skip(keep) {
            self.delete(user_id, &snapshot.snapshot_id).await?;
            info!(
                user_id,
                snapshot_id = %snapshot.snapshot_id,
                "retention: deleted snapshot"
            );
        }
        Ok(())
    }

    /// Whether the payload for a snapshot exists.
    pub async fn exists(&self, user_id: &str, snapshot_id: &str) -> CubicleResult<bool> {
        validate_id(user_id, "user_id")?;
        validate_id(snapshot_id, "snapshot_id")?;
        self.backend.exists(&payload_key(user_id, snapshot_id)).await
    }

    /// Swaps the freshly extracted staging directory into place.
    async fn swap_workspace(&self, live: &Path, staging: &Path) -> CubicleResult<()> {
        let aside = sibling_dir(live, "old");

        let live_existed = fs::try_exists(live).await?;
        if live_existed {
            fs::rename(live, &aside).await?;
        }

        if let Err(e) = fs::rename(staging, live).await {
            // Put the live workspace back before reporting failure.
            if live_existed {
                let _ = fs::rename(&aside, live).await;
            }
            let _ = fs::remove_dir_all(staging).await;
            return Err(e.into());
        }

        if live_existed {
            if let Err(e) = fs::remove_dir_all(&aside).await {
                warn!(path = %aside.display(), error = %e, "failed to remove replaced workspace");
            }
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn sibling_dir(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "workspace".to_string());
    let suffix = Alphanumeric.sample_string(&mut rand::thread_rng(), 8);
    path.with_file_name(format!(".{}.{}-{}", name, tag, suffix))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    async fn engine(retention: usize) -> (tempfile::TempDir, SnapshotEngine) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            LocalStorage::new(dir.path().join("store"))
                .await
                .unwrap(),
        );
        // A fast compression level keeps tests snappy.
        let config: Config = serde_yaml::from_str(&format!(
            "snapshot_retention: {}\nsnapshot_compression_level: 3",
            retention
        ))
        .unwrap();
        let metrics = Metrics::new().unwrap();
        let engine = SnapshotEngine::new(&config, backend, metrics);
        (dir, engine)
    }

    #[tokio::test]
    async fn test_create_restore_round_trip() -> anyhow::Result<()> {
        let (dir, engine) = engine(5).await;
        let workspace = dir.path().join("ws");
        fs::create_dir_all(workspace.join("work")).await?;
        fs::write(workspace.join("work/a.txt"), b"one").await?;

        let snapshot = engine.create("u_a", Some("sbx_1"), &workspace).await?;
        assert_eq!(snapshot.get_user_id(), "u_a");
        assert!(*snapshot.get_size_bytes() > 0);

        fs::write(workspace.join("work/a.txt"), b"two").await?;
        engine
            .restore("u_a", snapshot.get_snapshot_id(), &workspace)
            .await?;
        assert_eq!(fs::read(workspace.join("work/a.txt")).await?, b"one");

        let listed = engine.list("u_a").await?;
        assert_eq!(listed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_missing_is_not_found() {
        let (dir, engine) = engine(5).await;
        let workspace = dir.path().join("ws");
        let result = engine
            .restore("u_a", "snap_2025_01_01_000000_none", &workspace)
            .await;
        assert!(matches!(result, Err(CubicleError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_restore_does_not_cross_users() -> anyhow::Result<()> {
        let (dir, engine) = engine(5).await;
        let workspace = dir.path().join("ws");
        fs::create_dir_all(&workspace).await?;
        fs::write(workspace.join("a.txt"), b"owned").await?;

        let snapshot = engine.create("u_a", None, &workspace).await?;
        let result = engine
            .restore("u_b", snapshot.get_snapshot_id(), &workspace)
            .await;
        assert!(matches!(result, Err(CubicleError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() -> anyhow::Result<()> {
        let (dir, engine) = engine(3).await;
        let workspace = dir.path().join("ws");
        fs::create_dir_all(&workspace).await?;

        let mut ids = Vec::new();
        for i in 0..5 {
            fs::write(workspace.join("a.txt"), format!("v{}", i)).await?;
            let snapshot = engine.create("u_a", None, &workspace).await?;
            ids.push(snapshot.get_snapshot_id().clone());
            // Snapshot ids embed second-resolution timestamps; keep creation
            // ordering unambiguous for the assertion below.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let listed = engine.list("u_a").await?;
        assert_eq!(listed.len(), 3);
        let listed_ids: Vec<_> = listed.iter().map(|s| s.get_snapshot_id().clone()).collect();
        assert_eq!(listed_ids[0], ids[4]);
        assert!(!listed_ids.contains(&ids[0]));
        assert!(!listed_ids.contains(&ids[1]));

        assert!(!engine.exists("u_a", &ids[0]).await?);
        assert!(engine.exists("u_a", &ids[4]).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> anyhow::Result<()> {
        let (dir, engine) = engine(5).await;
        let workspace = dir.path().join("ws");
        fs::create_dir_all(&workspace).await?;
        let snapshot = engine.create("u_a", None, &workspace).await?;

        engine.delete("u_a", snapshot.get_snapshot_id()).await?;
        engine.delete("u_a", snapshot.get_snapshot_id()).await?;
        assert!(engine.list("u_a").await?.is_empty());
        Ok(())
    }
}
