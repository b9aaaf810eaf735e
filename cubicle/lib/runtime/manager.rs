//! The sandbox manager: lifecycle, exec, file operations, previews, background
//! jobs, keepalive, and fallback promotion.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{BackgroundJob, JobStatus, Sandbox, SandboxState, UpstreamDescriptor};
use crate::{
    config::Config,
    isolation::{
        DriverKind, DriverStream, ExecOutcome, ExecRequest, IsolationDriver,
        PortMapping, ProvisionSpec, ResourceCaps,
    },
    metrics::Metrics,
    quota::{QuotaManager, QuotaUsage},
    snapshot::{Snapshot, SnapshotEngine},
    utils::{new_job_id, new_sandbox_id, resolve_in_workspace, validate_id, write_atomic},
    CubicleError, CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options accepted at sandbox creation.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Use this identifier instead of generating one.
    pub sandbox_id: Option<String>,

    /// Resource caps for the isolation driver.
    pub caps: Option<ResourceCaps>,
}

/// One entry of a workspace directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceEntry {
    /// File or directory name.
    pub name: String,

    /// Whether the entry is a directory.
    pub is_dir: bool,

    /// Size in bytes for regular files.
    pub size_bytes: u64,
}

/// A registered preview target, as reported by listings.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewTarget {
    /// The owning sandbox.
    pub sandbox_id: String,

    /// The exposed port.
    pub port: u16,

    /// Where traffic is currently dialed.
    pub upstream: UpstreamDescriptor,
}

/// Summary of one sandbox for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    /// The sandbox identifier.
    pub sandbox_id: String,

    /// Current lifecycle state.
    pub state: SandboxState,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// The workspace path on the host.
    pub workspace: PathBuf,

    /// The isolation driver the sandbox runs on.
    pub driver_kind: DriverKind,
}

/// Hands out host ports for fallback replicas, cycling through a range.
pub struct PortAllocator {
    start: u16,
    end: u16,
    next: parking_lot::Mutex<u16>,
}

/// Owns every live sandbox and serializes per-sandbox mutations.
pub struct SandboxManager {
    config: Config,
    driver: Arc<dyn IsolationDriver>,
    fallback_driver: Arc<dyn IsolationDriver>,
    quota: Arc<QuotaManager>,
    metrics: Arc<Metrics>,
    sandboxes: DashMap<String, Arc<Sandbox>>,
    promotions: DashMap<(String, u16), Arc<tokio::sync::Mutex<()>>>,
    port_allocator: PortAllocator,
    probe_client: reqwest::Client,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PortAllocator {
    /// Creates an allocator over an inclusive port range.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            next: parking_lot::Mutex::new(start),
        }
    }

    /// Returns the next port, wrapping at the end of the range.
    pub fn allocate(&self) -> u16 {
        let mut next = self.next.lock();
        let port = *next;
        *next = if port >= self.end { self.start } else { port + 1 };
        port
    }
}

impl SandboxManager {
    /// Creates the manager.
    ///
    /// `driver` runs sandboxes; `fallback_driver` provisions preview replicas
    /// during promotion (the container driver where available).
    pub fn new(
        config: Config,
        driver: Arc<dyn IsolationDriver>,
        fallback_driver: Arc<dyn IsolationDriver>,
        quota: Arc<QuotaManager>,
        metrics: Arc<Metrics>,
    ) -> CubicleResult<Self> {
        let probe_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                *config.get_health_probe_timeout_seconds(),
            ))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(CubicleError::custom)?;
        let port_allocator = PortAllocator::new(
            *config.get_fallback_port_start(),
            *config.get_fallback_port_end(),
        );

        Ok(Self {
            config,
            driver,
            fallback_driver,
            quota,
            metrics,
            sandboxes: DashMap::new(),
            promotions: DashMap::new(),
            port_allocator,
            probe_client,
        })
    }

    /// The isolation driver sandboxes run on.
    pub fn driver(&self) -> &Arc<dyn IsolationDriver> {
        &self.driver
    }

    /// The control-plane configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The default exec timeout from configuration.
    pub fn default_exec_timeout(&self) -> Duration {
        Duration::from_secs(*self.config.get_exec_timeout_seconds())
    }

    /// Creates a sandbox for `user_id` and starts it.
    pub async fn create(&self, user_id: &str, options: CreateOptions) -> CubicleResult<Arc<Sandbox>> {
        validate_id(user_id, "user_id")?;
        let sandbox_id = match options.sandbox_id {
            Some(id) => {
                validate_id(&id, "sandbox_id")?;
                id
            }
            None => new_sandbox_id(),
        };
        if self.sandboxes.contains_key(&sandbox_id) {
            return Err(CubicleError::PreconditionFailed(format!(
                "sandbox {} already exists",
                sandbox_id
            )));
        }

        let workspace_root = self
            .config
            .get_workspaces_root()
            .join(user_id)
            .join(&sandbox_id);

        let spec = ProvisionSpec::builder()
            .sandbox_id(sandbox_id.clone())
            .user_id(user_id.to_string())
            .workspace_root(workspace_root.clone())
            .caps(options.caps.unwrap_or_else(|| ResourceCaps::builder().build()))
            .build();
        let handle = self.driver.provision(spec).await?;
        if let Err(e) = self.driver.start(&handle).await {
            let _ = self.driver.destroy(&handle, true).await;
            return Err(e);
        }

        let sandbox = Arc::new(Sandbox::new(
            sandbox_id.clone(),
            user_id.to_string(),
            workspace_root,
            handle,
            Duration::from_secs(*self.config.get_keepalive_ttl_seconds()),
        ));
        sandbox.set_state(SandboxState::Running);

        self.quota.register(&sandbox_id);
        self.sandboxes.insert(sandbox_id.clone(), sandbox.clone());
        self.metrics.sandbox_created_total.inc();
        self.metrics.sandbox_active.inc();
        info!(user_id, sandbox_id, driver = %sandbox.handle.kind, "sandbox created");

        Ok(sandbox)
    }

    /// Looks up a sandbox without an ownership check (proxy resolution path).
    pub fn get(&self, sandbox_id: &str) -> CubicleResult<Arc<Sandbox>> {
        self.sandboxes
            .get(sandbox_id)
            .map(|s| s.clone())
            .ok_or_else(|| CubicleError::NotFound(format!("sandbox not found: {}", sandbox_id)))
    }

    /// Looks up a sandbox and verifies ownership.
    ///
    /// A sandbox owned by someone else is reported exactly like a missing one.
    pub fn get_owned(&self, user_id: &str, sandbox_id: &str) -> CubicleResult<Arc<Sandbox>> {
        let sandbox = self.get(sandbox_id)?;
        if sandbox.user_id != user_id {
            return Err(CubicleError::NotFound(format!(
                "sandbox not found: {}",
                sandbox_id
            )));
        }
        Ok(sandbox)
    }

    /// Lists a user's sandboxes.
    pub fn list(&self, user_id: &str) -> Vec<SandboxInfo> {
        self.sandboxes
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| SandboxInfo {
                sandbox_id: entry.sandbox_id.clone(),
                state: entry.state(),
                created_at: entry.created_at,
                workspace: entry.workspace_root.clone(),
                driver_kind: entry.handle.kind,
            })
            .collect()
    }

    /// All live sandboxes (supervision).
    pub(crate) fn all(&self) -> Vec<Arc<Sandbox>> {
        self.sandboxes.iter().map(|entry| entry.clone()).collect()
    }

    /// Runs one command inside a sandbox.
    ///
    /// State check and quota admission happen under the short critical section;
    /// the driver call runs outside it, holding only the shared write gate so
    /// snapshot creation can pause writers.
    pub async fn exec(
        &self,
        user_id: &str,
        sandbox_id: &str,
        argv: Vec<String>,
        stdin: Option<Bytes>,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> CubicleResult<ExecOutcome> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        sandbox.require_running()?;
        if argv.is_empty() {
            return Err(CubicleError::InvalidArgument("argv cannot be empty".into()));
        }

        self.quota.admit_exec(sandbox_id)?;
        let command_label = argv[0].clone();
        let timer = std::time::Instant::now();

        let result = {
            let _writers = sandbox.write_gate.read().await;
            self.driver
                .exec(
                    &sandbox.handle,
                    ExecRequest {
                        argv,
                        stdin,
                        timeout: Some(timeout.unwrap_or_else(|| self.default_exec_timeout())),
                        cancel,
                    },
                )
                .await
        };
        self.quota.release_exec(sandbox_id);

        self.metrics
            .sandbox_exec_duration_seconds
            .observe(timer.elapsed().as_secs_f64());
        self.metrics
            .sandbox_exec_total
            .with_label_values(&[sandbox_id, &command_label])
            .inc();
        self.quota
            .record_cpu(sandbox_id, timer.elapsed().as_secs());

        match result {
            Ok(outcome) => Ok(outcome),
            // A timeout is a structured result for the caller, not a failure.
            Err(CubicleError::TimedOut(_)) => Ok(ExecOutcome {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: -1,
                timed_out: true,
            }),
            Err(e) => Err(e),
        }
    }

    /// Writes a file inside the workspace, atomically.
    pub async fn write_file(
        &self,
        user_id: &str,
        sandbox_id: &str,
        path: &str,
        data: Bytes,
    ) -> CubicleResult<()> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        sandbox.require_running()?;
        let target = resolve_in_workspace(&sandbox.workspace_root, path)?;

        let _writers = sandbox.write_gate.read().await;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&target, &data).await
    }

    /// Reads a file from the workspace.
    pub async fn read_file(
        &self,
        user_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> CubicleResult<Bytes> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        let target = resolve_in_workspace(&sandbox.workspace_root, path)?;
        match fs::read(&target).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CubicleError::NotFound(format!("file not found: {}", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists a workspace directory.
    pub async fn list_dir(
        &self,
        user_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> CubicleResult<Vec<WorkspaceEntry>> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        let target = if path.is_empty() || path == "." {
            sandbox.workspace_root.clone()
        } else {
            resolve_in_workspace(&sandbox.workspace_root, path)?
        };

        let mut read_dir = match fs::read_dir(&target).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CubicleError::NotFound(format!(
                    "directory not found: {}",
                    path
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(WorkspaceEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: meta.is_dir(),
                size_bytes: if meta.is_file() { meta.len() } else { 0 },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Deletes a file or empty directory from the workspace. Idempotent.
    pub async fn delete_file(
        &self,
        user_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> CubicleResult<()> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        sandbox.require_running()?;
        let target = resolve_in_workspace(&sandbox.workspace_root, path)?;

        let _writers = sandbox.write_gate.read().await;
        let result = match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir(&target).await,
            Ok(_) => fs::remove_file(&target).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        result.map_err(Into::into)
    }

    /// Installs or overwrites the upstream for a preview port.
    pub fn register_preview(
        &self,
        user_id: &str,
        sandbox_id: &str,
        port: u16,
        upstream: Option<UpstreamDescriptor>,
    ) -> CubicleResult<UpstreamDescriptor> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        sandbox.require_running()?;
        if port == 0 {
            return Err(CubicleError::InvalidArgument(
                "preview port must be in [1, 65535]".to_string(),
            ));
        }

        let upstream =
            upstream.unwrap_or_else(|| UpstreamDescriptor::local(port, sandbox.handle.kind));
        upstream.validate()?;
        sandbox.register_port(port, upstream.clone());
        info!(sandbox_id, port, upstream = %upstream.base_url(), "preview registered");
        Ok(upstream)
    }

    /// Resolves a preview target for the proxy. Lookup only.
    pub fn resolve_preview(&self, sandbox_id: &str, port: u16) -> Option<UpstreamDescriptor> {
        let sandbox = self.sandboxes.get(sandbox_id)?;
        sandbox.ports().get(&port).cloned()
    }

    /// Lists every registered preview target.
    pub fn list_previews(&self) -> Vec<PreviewTarget> {
        let mut targets = Vec::new();
        for entry in self.sandboxes.iter() {
            for (port, upstream) in entry.ports().iter() {
                targets.push(PreviewTarget {
                    sandbox_id: entry.sandbox_id.clone(),
                    port: *port,
                    upstream: upstream.clone(),
                });
            }
        }
        targets.sort_by(|a, b| (&a.sandbox_id, a.port).cmp(&(&b.sandbox_id, b.port)));
        targets
    }

    /// Starts a background job running `argv` inside the sandbox.
    pub async fn start_background(
        &self,
        user_id: &str,
        sandbox_id: &str,
        argv: Vec<String>,
    ) -> CubicleResult<String> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        sandbox.require_running()?;
        if argv.is_empty() {
            return Err(CubicleError::InvalidArgument("argv cannot be empty".into()));
        }

        let job_id = new_job_id();
        let cancel = CancellationToken::new();
        let status = Arc::new(parking_lot::Mutex::new(JobStatus::Running));
        let job = Arc::new(BackgroundJob {
            job_id: job_id.clone(),
            command: argv.clone(),
            started_at: Utc::now(),
            status: status.clone(),
            cancel: cancel.clone(),
        });
        sandbox.add_job(job);

        let driver = self.driver.clone();
        let handle = sandbox.handle.clone();
        let job_label = job_id.clone();
        let sandbox_label = sandbox_id.to_string();
        tokio::spawn(async move {
            let request = ExecRequest {
                argv,
                stdin: None,
                timeout: None,
                cancel: cancel.clone(),
            };
            let outcome = driver.exec(&handle, request).await;
            let mut status = status.lock();
            *status = match outcome {
                Ok(_) if cancel.is_cancelled() => JobStatus::Stopped,
                Ok(outcome) => JobStatus::Exited {
                    exit_code: outcome.exit_code,
                },
                Err(e) => {
                    warn!(sandbox_id = %sandbox_label, job_id = %job_label, error = %e, "background job failed");
                    JobStatus::Failed {
                        message: e.to_string(),
                    }
                }
            };
        });

        Ok(job_id)
    }

    /// Stops a background job. Idempotent; a finished job reports its last
    /// observed status.
    pub async fn stop_background(
        &self,
        user_id: &str,
        sandbox_id: &str,
        job_id: &str,
    ) -> CubicleResult<JobStatus> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        let job = sandbox
            .job(job_id)
            .ok_or_else(|| CubicleError::NotFound(format!("job not found: {}", job_id)))?;

        if *job.status.lock() == JobStatus::Running {
            job.cancel.cancel();
            // Give the exec task a moment to observe cancellation.
            for _ in 0..50 {
                if *job.status.lock() != JobStatus::Running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        let status = job.status.lock().clone();
        Ok(status)
    }

    /// Extends a sandbox's keepalive deadline.
    pub fn keepalive(&self, user_id: &str, sandbox_id: &str, ttl: Duration) -> CubicleResult<()> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        sandbox.extend_deadline(ttl);
        Ok(())
    }

    /// Attaches a host path inside the sandbox.
    pub async fn mount(
        &self,
        user_id: &str,
        sandbox_id: &str,
        host_path: &Path,
        guest_path: &str,
        read_only: bool,
    ) -> CubicleResult<()> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        sandbox.require_running()?;
        if !host_path.is_absolute() {
            return Err(CubicleError::InvalidArgument(
                "mount host path must be absolute".to_string(),
            ));
        }
        self.driver
            .mount(&sandbox.handle, host_path, guest_path, read_only)
            .await
    }

    /// Opens an interactive terminal stream into the sandbox.
    pub async fn open_terminal(
        &self,
        user_id: &str,
        sandbox_id: &str,
    ) -> CubicleResult<DriverStream> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;
        sandbox.require_running()?;
        self.driver.open_stream(&sandbox.handle).await
    }

    /// Takes a snapshot of a sandbox's workspace with writers paused.
    pub async fn snapshot(
        &self,
        user_id: &str,
        sandbox_id: Option<&str>,
        engine: &SnapshotEngine,
    ) -> CubicleResult<Snapshot> {
        let sandbox = self.resolve_snapshot_target(user_id, sandbox_id)?;

        // Exclusive gate: no exec or file writer is admitted during create.
        let _paused = sandbox.write_gate.write().await;
        engine
            .create(user_id, Some(&sandbox.sandbox_id), &sandbox.workspace_root)
            .await
    }

    /// Restores a snapshot into a sandbox's workspace with writers paused.
    pub async fn restore(
        &self,
        user_id: &str,
        snapshot_id: &str,
        sandbox_id: &str,
        engine: &SnapshotEngine,
    ) -> CubicleResult<()> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;

        let _paused = sandbox.write_gate.write().await;
        engine
            .restore(user_id, snapshot_id, &sandbox.workspace_root)
            .await
    }

    /// Destroys a sandbox: stops jobs, tears down fallback replicas and the
    /// driver handle, releases ports and quota, removes the workspace.
    ///
    /// When `snapshot_engine` is provided the workspace is archived first.
    pub async fn destroy(
        &self,
        user_id: &str,
        sandbox_id: &str,
        snapshot_engine: Option<&SnapshotEngine>,
    ) -> CubicleResult<()> {
        let sandbox = self.get_owned(user_id, sandbox_id)?;

        if let Some(engine) = snapshot_engine {
            if let Err(e) = self.snapshot(user_id, Some(sandbox_id), engine).await {
                warn!(sandbox_id, error = %e, "pre-destroy snapshot failed");
            }
        }

        for job in sandbox.jobs() {
            job.cancel.cancel();
        }

        {
            let mut fallbacks = sandbox.fallbacks.lock().await;
            for (_, handle) in fallbacks.drain() {
                let _ = self.fallback_driver.stop(&handle).await;
                // Replicas share the sandbox workspace; never remove it here.
                let _ = self.fallback_driver.destroy(&handle, false).await;
            }
        }

        sandbox.release_ports();
        let _ = self.driver.stop(&sandbox.handle).await;
        self.driver.destroy(&sandbox.handle, true).await?;

        sandbox.set_state(SandboxState::Destroyed);
        self.sandboxes.remove(sandbox_id);
        self.quota.unregister(sandbox_id);
        self.metrics.sandbox_active.dec();
        info!(user_id, sandbox_id, "sandbox destroyed");
        Ok(())
    }

    /// Moves a preview target onto a container-backed replica of the workspace.
    ///
    /// Called by the proxy once an upstream burns its error budget. At most one
    /// promotion per `(sandbox, port)` runs at a time; losers of the race adopt
    /// the winner's upstream. The previous fallback replica is stopped only
    /// after the new upstream answers a health probe.
    pub async fn promote_to_fallback(
        &self,
        sandbox_id: &str,
        port: u16,
    ) -> CubicleResult<UpstreamDescriptor> {
        let sandbox = self.get(sandbox_id)?;
        let lock = self
            .promotions
            .entry((sandbox_id.to_string(), port))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let current = sandbox.ports().get(&port).cloned().ok_or_else(|| {
            CubicleError::NotFound(format!(
                "no preview registered for {}:{}",
                sandbox_id, port
            ))
        })?;

        // Another promoter may have already swapped the upstream while this
        // caller waited on the lock.
        if current.driver_kind == self.fallback_driver.kind()
            && self.probe_upstream(&current).await.is_ok()
        {
            return Ok(current);
        }

        let host_port = self.port_allocator.allocate();
        let replica_id = format!("{}-fb-{}", sandbox_id, port);
        let serve_port = match self.fallback_driver.kind() {
            // Containers serve on the guest port and publish it to the host.
            DriverKind::Container => port,
            // Process replicas bind the host port directly.
            _ => host_port,
        };

        let spec = ProvisionSpec::builder()
            .sandbox_id(replica_id.clone())
            .user_id(sandbox.user_id.clone())
            .workspace_root(sandbox.workspace_root.clone())
            .publish_ports(vec![PortMapping {
                host: host_port,
                guest: serve_port,
            }])
            .build();
        let handle = self.fallback_driver.provision(spec).await?;
        if let Err(e) = self.fallback_driver.start(&handle).await {
            let _ = self.fallback_driver.destroy(&handle, false).await;
            return Err(e);
        }

        // Serve the workspace inside the replica.
        let mut serve = self.config.get_fallback_serve_command().clone();
        serve.push(serve_port.to_string());
        let serve_cancel = CancellationToken::new();
        {
            let driver = self.fallback_driver.clone();
            let handle = handle.clone();
            let cancel = serve_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = driver
                    .exec(
                        &handle,
                        ExecRequest {
                            argv: serve,
                            stdin: None,
                            timeout: None,
                            cancel,
                        },
                    )
                    .await
                {
                    error!(replica = %handle.sandbox_id, error = %e, "fallback serve command failed");
                }
            });
        }

        let new_upstream = UpstreamDescriptor {
            host: "127.0.0.1".to_string(),
            port: host_port,
            scheme: "http".to_string(),
            driver_kind: self.fallback_driver.kind(),
        };

        match self.probe_until_healthy(&new_upstream).await {
            Ok(()) => {
                sandbox.register_port(port, new_upstream.clone());
                let mut fallbacks = sandbox.fallbacks.lock().await;
                if let Some(old) = fallbacks.insert(port, handle) {
                    let _ = self.fallback_driver.stop(&old).await;
                    let _ = self.fallback_driver.destroy(&old, false).await;
                }
                info!(
                    sandbox_id,
                    port,
                    upstream = %new_upstream.base_url(),
                    "preview promoted to fallback"
                );
                Ok(new_upstream)
            }
            Err(e) => {
                serve_cancel.cancel();
                let _ = self.fallback_driver.destroy(&handle, false).await;
                Err(CubicleError::Upstream(format!(
                    "fallback replica never became healthy: {}",
                    e
                )))
            }
        }
    }

    /// Per-sandbox quota usage.
    pub fn usage(&self, user_id: &str, sandbox_id: &str) -> CubicleResult<QuotaUsage> {
        self.get_owned(user_id, sandbox_id)?;
        self.quota.usage(sandbox_id)
    }

    /// The quota manager (supervision).
    pub(crate) fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    /// One HTTP probe against an upstream; any response counts as alive.
    async fn probe_upstream(&self, upstream: &UpstreamDescriptor) -> CubicleResult<()> {
        self.probe_client
            .get(format!("{}/", upstream.base_url()))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| CubicleError::Upstream(format!("probe failed: {}", e)))
    }

    /// Probes a freshly promoted upstream until it answers or the budget runs
    /// out.
    async fn probe_until_healthy(&self, upstream: &UpstreamDescriptor) -> CubicleResult<()> {
        let mut last = CubicleError::Upstream("no probe attempted".to_string());
        for _ in 0..20 {
            match self.probe_upstream(upstream).await {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err(last)
    }

    fn resolve_snapshot_target(
        &self,
        user_id: &str,
        sandbox_id: Option<&str>,
    ) -> CubicleResult<Arc<Sandbox>> {
        match sandbox_id {
            Some(id) => self.get_owned(user_id, id),
            None => {
                let mut owned: Vec<_> = self
                    .sandboxes
                    .iter()
                    .filter(|entry| entry.user_id == user_id)
                    .map(|entry| entry.clone())
                    .collect();
                match owned.len() {
                    1 => Ok(owned.remove(0)),
                    0 => Err(CubicleError::NotFound(format!(
                        "user {} has no sandbox to snapshot",
                        user_id
                    ))),
                    _ => Err(CubicleError::InvalidArgument(
                        "user has multiple sandboxes; specify sandbox_id".to_string(),
                    )),
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::ProcessDriver;

    async fn manager() -> (tempfile::TempDir, Arc<SandboxManager>) {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = serde_yaml::from_str(&format!(
            "workspaces_root: {}\nisolation_backend: process",
            dir.path().join("workspaces").display()
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
    async fn test_create_exec_destroy() -> anyhow::Result<()> {
        let (_dir, manager) = manager().await;
        let sandbox = manager.create("u_a", CreateOptions::default()).await?;
        assert_eq!(sandbox.state(), SandboxState::Running);
        assert!(sandbox.workspace_root.exists());

        let outcome = manager
            .exec(
                "u_a",
                &sandbox.sandbox_id,
                vec!["echo".into(), "hello".into()],
                None,
                Some(Duration::from_secs(5)),
                CancellationToken::new(),
            )
            .await?;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout, "hello\n");
        assert!(!outcome.timed_out);

        let workspace = sandbox.workspace_root.clone();
        manager.destroy("u_a", &sandbox.sandbox_id, None).await?;
        assert!(!workspace.exists());
        assert!(manager.get(&sandbox.sandbox_id).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_file_round_trip_and_traversal() -> anyhow::Result<()> {
        let (_dir, manager) = manager().await;
        let sandbox = manager.create("u_a", CreateOptions::default()).await?;
        let sid = sandbox.sandbox_id.clone();

        manager
            .write_file("u_a", &sid, "work/a.txt", Bytes::from_static(b"one"))
            .await?;
        assert_eq!(manager.read_file("u_a", &sid, "work/a.txt").await?, "one");

        let entries = manager.list_dir("u_a", &sid, "work").await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");

        // Traversal and absolute paths are rejected and nothing changes.
        let bad = manager
            .write_file("u_a", &sid, "../../etc/passwd", Bytes::from_static(b"x"))
            .await;
        assert!(matches!(bad, Err(CubicleError::InvalidArgument(_))));
        let bad = manager.read_file("u_a", &sid, "/etc/passwd").await;
        assert!(matches!(bad, Err(CubicleError::InvalidArgument(_))));

        manager.delete_file("u_a", &sid, "work/a.txt").await?;
        manager.delete_file("u_a", &sid, "work/a.txt").await?;
        assert!(matches!(
            manager.read_file("u_a", &sid, "work/a.txt").await,
            Err(CubicleError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_ownership_is_opaque() -> anyhow::Result<()> {
        let (_dir, manager) = manager().await;
        let sandbox = manager.create("u_a", CreateOptions::default()).await?;

        let result = manager.read_file("u_b", &sandbox.sandbox_id, "a.txt").await;
        assert!(matches!(result, Err(CubicleError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_preview_registry() -> anyhow::Result<()> {
        let (_dir, manager) = manager().await;
        let sandbox = manager.create("u_a", CreateOptions::default()).await?;
        let sid = sandbox.sandbox_id.clone();

        let upstream = manager.register_preview("u_a", &sid, 3000, None)?;
        assert_eq!(upstream.port, 3000);
        assert_eq!(
            manager.resolve_preview(&sid, 3000).unwrap().base_url(),
            "http://127.0.0.1:3000"
        );
        assert!(manager.resolve_preview(&sid, 4000).is_none());

        assert!(matches!(
            manager.register_preview("u_a", &sid, 0, None),
            Err(CubicleError::InvalidArgument(_))
        ));

        let targets = manager.list_previews();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].port, 3000);
        Ok(())
    }

    #[tokio::test]
    async fn test_background_job_lifecycle() -> anyhow::Result<()> {
        let (_dir, manager) = manager().await;
        let sandbox = manager.create("u_a", CreateOptions::default()).await?;
        let sid = sandbox.sandbox_id.clone();

        let job_id = manager
            .start_background("u_a", &sid, vec!["sleep".into(), "30".into()])
            .await?;
        assert!(sandbox.has_running_jobs());

        let status = manager.stop_background("u_a", &sid, &job_id).await?;
        assert_eq!(status, JobStatus::Stopped);
        assert!(!sandbox.has_running_jobs());

        // Stopping again reports the last observed status.
        let status = manager.stop_background("u_a", &sid, &job_id).await?;
        assert_eq!(status, JobStatus::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn test_background_job_records_exit() -> anyhow::Result<()> {
        let (_dir, manager) = manager().await;
        let sandbox = manager.create("u_a", CreateOptions::default()).await?;
        let sid = sandbox.sandbox_id.clone();

        let job_id = manager
            .start_background("u_a", &sid, vec!["true".into()])
            .await?;
        // Let the short-lived job finish.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = manager.stop_background("u_a", &sid, &job_id).await?;
        assert_eq!(status, JobStatus::Exited { exit_code: 0 });
        Ok(())
    }

    #[tokio::test]
    async fn test_exec_timeout_is_structured() -> anyhow::Result<()> {
        let (_dir, manager) = manager().await;
        let sandbox = manager.create("u_a", CreateOptions::default()).await?;

        let outcome = manager
            .exec(
                "u_a",
                &sandbox.sandbox_id,
                vec!["sleep".into(), "5".into()],
                None,
                Some(Duration::from_millis(100)),
                CancellationToken::new(),
            )
            .await?;
        assert!(outcome.timed_out);
        Ok(())
    }

    #[tokio::test]
    async fn test_port_allocator_wraps() {
        let allocator = PortAllocator::new(33000, 33002);
        assert_eq!(allocator.allocate(), 33000);
        assert_eq!(allocator.allocate(), 33001);
        assert_eq!(allocator.allocate(), 33002);
        assert_eq!(allocator.allocate(), 33000);
    }

    #[tokio::test]
    async fn test_snapshot_target_resolution() -> anyhow::Result<()> {
        let (_dir, manager) = manager().await;
        assert!(matches!(
            manager.resolve_snapshot_target("u_a", None),
            Err(CubicleError::NotFound(_))
        ));

        let first = manager.create("u_a", CreateOptions::default()).await?;
        let resolved = manager.resolve_snapshot_target("u_a", None)?;
        assert_eq!(resolved.sandbox_id, first.sandbox_id);

        manager.create("u_a", CreateOptions::default()).await?;
        assert!(matches!(
            manager.resolve_snapshot_target("u_a", None),
            Err(CubicleError::InvalidArgument(_))
        ));
        Ok(())
    }
}
