//! Shared state for the HTTP façade.
//!
//! Everything is built once at service start and handed down as explicit
//! handles; no component reaches for module-level state.

use std::sync::Arc;

use crate::{
    config::Config,
    isolation::{select_driver, ContainerDriver, IsolationDriver, ProcessDriver},
    metrics::Metrics,
    proxy::PreviewProxy,
    quota::QuotaManager,
    runtime::SandboxManager,
    snapshot::SnapshotEngine,
    storage::{open_backend, StorageBackend},
    CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Shared handles for every request handler.
#[derive(Clone)]
pub struct AppState {
    /// The control-plane configuration.
    pub config: Arc<Config>,

    /// The sandbox runtime.
    pub manager: Arc<SandboxManager>,

    /// The snapshot engine.
    pub snapshots: Arc<SnapshotEngine>,

    /// The preview proxy.
    pub proxy: Arc<PreviewProxy>,

    /// The metric registry handle.
    pub metrics: Arc<Metrics>,

    /// The snapshot storage backend.
    pub storage: Arc<dyn StorageBackend>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AppState {
    /// Builds the full component graph from configuration.
    pub async fn new(config: Config) -> CubicleResult<Self> {
        let metrics = Metrics::new()?;
        let storage = open_backend(&config).await?;
        let driver = select_driver(&config).await?;

        // Fallback replicas prefer the container driver; without a container
        // daemon the process driver keeps promotion functional.
        let container = ContainerDriver::new(config.get_container().clone());
        let fallback_driver: Arc<dyn IsolationDriver> = if container.available().await {
            Arc::new(container)
        } else {
            Arc::new(ProcessDriver::new(
                config.get_process_allowed_commands().clone(),
            ))
        };

        let quota = Arc::new(QuotaManager::new(
            config.get_quota().clone(),
            metrics.clone(),
        ));
        let manager = Arc::new(SandboxManager::new(
            config.clone(),
            driver,
            fallback_driver,
            quota,
            metrics.clone(),
        )?);
        let snapshots = Arc::new(SnapshotEngine::new(
            &config,
            storage.clone(),
            metrics.clone(),
        ));
        let proxy = Arc::new(PreviewProxy::new(
            &config,
            manager.clone(),
            metrics.clone(),
        )?);

        Ok(Self {
            config: Arc::new(config),
            manager,
            snapshots,
            proxy,
            metrics,
            storage,
        })
    }
}
