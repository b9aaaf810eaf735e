//! The sandbox supervisor task.
//!
//! Periodically samples resource usage into the quota buckets and destroys
//! sandboxes whose keepalive deadline has passed and that have no running
//! background job.

use std::{path::PathBuf, sync::Arc, time::Instant};

use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::SandboxManager;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Spawns the supervisor loop.
///
/// The returned handle aborts the loop when dropped by the caller at shutdown.
pub fn spawn_reaper(manager: Arc<SandboxManager>) -> JoinHandle<()> {
    let period =
        std::time::Duration::from_secs(*manager.config().get_reaper_interval_seconds());
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            sweep(&manager).await;
        }
    })
}

/// One supervision pass over every live sandbox.
pub async fn sweep(manager: &Arc<SandboxManager>) {
    let now = Instant::now();
    for sandbox in manager.all() {
        // Account usage first so admission sees fresh numbers.
        if let Some(sample) = manager.driver().sample(&sandbox.handle).await {
            manager
                .quota()
                .record_memory(&sandbox.sandbox_id, sample.memory_bytes);
        }
        match workspace_size(sandbox.workspace_root.clone()).await {
            Ok(bytes) => manager.quota().record_storage(&sandbox.sandbox_id, bytes),
            Err(e) => debug!(sandbox_id = %sandbox.sandbox_id, error = %e, "storage sample failed"),
        }

        if sandbox.past_deadline(now) && !sandbox.has_running_jobs() {
            info!(
                sandbox_id = %sandbox.sandbox_id,
                user_id = %sandbox.user_id,
                "keepalive expired, reaping sandbox"
            );
            if let Err(e) = manager
                .destroy(&sandbox.user_id, &sandbox.sandbox_id, None)
                .await
            {
                warn!(sandbox_id = %sandbox.sandbox_id, error = %e, "reap failed");
            }
        }
    }
}

/// Total size of regular files under a workspace.
async fn workspace_size(root: PathBuf) -> std::io::Result<u64> {
    tokio::task::spawn_blocking(move || {
        let mut total = 0u64;
        for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_file() {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
        total
    })
    .await
    .map_err(std::io::Error::other)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::Config,
        isolation::{IsolationDriver, ProcessDriver},
        metrics::Metrics,
        quota::QuotaManager,
        runtime::CreateOptions,
    };

    async fn manager(keepalive_secs: u64) -> (tempfile::TempDir, Arc<SandboxManager>) {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = serde_yaml::from_str(&format!(
            "workspaces_root: {}\nisolation_backend: process\nkeepalive_ttl_seconds: {}",
            dir.path().join("workspaces").display(),
            keepalive_secs
        ))
        .unwrap();
        let metrics = Metrics::new().unwrap();
        let driver: Arc<dyn IsolationDriver> = Arc::new(ProcessDriver::new(
            config.get_process_allowed_commands().clone(),
        ));
        let quota = Arc::new(QuotaManager::new(config.get_quota().clone(), metrics.clone()));
        let manager = Arc::new(
            SandboxManager::new(config, driver.clone(), driver, quota, metrics).unwrap(),
        );
        (dir, manager)
    }

    #[tokio::test]
    async fn test_sweep_reaps_expired_sandboxes() -> anyhow::Result<()> {
        let (_dir, manager) = manager(0).await;
        let sandbox = manager.create("u_a", CreateOptions::default()).await?;
        let workspace = sandbox.workspace_root.clone();

        // TTL of zero expires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        sweep(&manager).await;

        assert!(manager.get(&sandbox.sandbox_id).is_err());
        assert!(!workspace.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_spares_live_and_busy_sandboxes() -> anyhow::Result<()> {
        let (_dir, manager) = manager(0).await;
        let busy = manager.create("u_a", CreateOptions::default()).await?;
        manager
            .start_background("u_a", &busy.sandbox_id, vec!["sleep".into(), "30".into()])
            .await?;

        let (_dir2, manager2) = manager_alive().await;
        let alive = manager2.create("u_b", CreateOptions::default()).await?;

        tokio::time::sleep(Duration::from_millis(50)).await;
        sweep(&manager).await;
        sweep(&manager2).await;

        // Expired but has a running job: spared.
        assert!(manager.get(&busy.sandbox_id).is_ok());
        // Deadline not reached: spared.
        assert!(manager2.get(&alive.sandbox_id).is_ok());
        Ok(())
    }

    async fn manager_alive() -> (tempfile::TempDir, Arc<SandboxManager>) {
        manager(3600).await
    }

    #[tokio::test]
    async fn test_sweep_records_storage() -> anyhow::Result<()> {
        let (_dir, manager) = manager(3600).await;
        let sandbox = manager.create("u_a", CreateOptions::default()).await?;
        manager
            .write_file(
                "u_a",
                &sandbox.sandbox_id,
                "blob.bin",
                bytes::Bytes::from(vec![0u8; 2048]),
            )
            .await?;

        sweep(&manager).await;
        let usage = manager.usage("u_a", &sandbox.sandbox_id)?;
        assert!(usage.storage_bytes >= 2048);
        Ok(())
    }
}
