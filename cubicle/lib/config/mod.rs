//! Typed configuration for the control plane.
//!
//! Configuration is loaded in three layers: built-in defaults, an optional YAML
//! file (unknown keys are rejected), and the environment variables documented on
//! [`Config::apply_env`]. The merged result is an immutable object handed down to
//! every component at service start.

mod defaults;

use std::{collections::HashMap, path::{Path, PathBuf}, str::FromStr};

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{CubicleError, CubicleResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The storage backend driver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Blobs under a local filesystem root.
    #[default]
    Local,

    /// An S3-compatible object store.
    S3,
}

/// The isolation backend driver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    /// Probe microVM, then container, then fall back to process.
    #[default]
    Auto,

    /// Lightweight virtual machines.
    #[serde(rename = "microvm")]
    MicroVm,

    /// Containers driven through the container CLI.
    Container,

    /// Filesystem-scoped child processes, no kernel isolation.
    Process,
}

/// Per-sandbox quota limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[serde(default, deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct QuotaLimits {
    /// Executions allowed in the rolling one-hour window.
    max_exec_per_hour: u32,

    /// Concurrently running executions.
    max_concurrent_exec: u32,

    /// Estimated resident memory in bytes.
    max_memory_bytes: u64,

    /// Workspace storage in bytes.
    max_storage_bytes: u64,

    /// Network egress bytes in the rolling one-hour window.
    max_egress_bytes_per_hour: u64,

    /// CPU seconds in the rolling one-hour window.
    max_cpu_seconds_per_hour: u64,
}

/// Settings for the S3-compatible storage driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[serde(default, deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct S3Settings {
    /// Endpoint URL, e.g. `https://s3.example.com`.
    endpoint: Option<String>,

    /// Bucket holding snapshot payloads.
    bucket: Option<String>,

    /// Static access key.
    access_key: Option<String>,

    /// Static secret key.
    secret_key: Option<String>,

    /// Region name; S3-compatible stores usually accept anything.
    region: String,
}

/// Settings for the microVM driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default, Getters)]
#[serde(default, deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct MicroVmSettings {
    /// Path to the VM monitor binary.
    exe_path: Option<PathBuf>,

    /// Path to the guest kernel image.
    kernel_path: Option<PathBuf>,

    /// Path to the guest root filesystem image.
    rootfs_path: Option<PathBuf>,
}

/// Settings for the container driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[serde(default, deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct ContainerSettings {
    /// Image used for sandboxes and fallback replicas.
    image: String,

    /// Prefix for container names and hostnames.
    name_prefix: String,

    /// Restart policy passed to the container CLI.
    restart_policy: String,

    /// Guest path the workspace is bind-mounted at.
    workspace_guest_path: String,
}

/// The complete control-plane configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
#[serde(default, deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct Config {
    /// Which storage backend serves snapshot blobs.
    storage_backend: StorageKind,

    /// Root directory for the local storage backend.
    storage_root: PathBuf,

    /// S3 driver settings, used when `storage_backend` is `s3`.
    s3: S3Settings,

    /// Which isolation backend runs sandboxes.
    isolation_backend: IsolationKind,

    /// Root under which per-user workspaces are created.
    workspaces_root: PathBuf,

    /// Number of snapshots retained per user.
    snapshot_retention: usize,

    /// zstd level for snapshot archives.
    snapshot_compression_level: i32,

    /// Preserve archived file mtimes on restore.
    restore_preserve_mtime: bool,

    /// Threshold above which the S3 driver switches to multipart upload.
    multipart_threshold_bytes: u64,

    /// Default timeout for a single exec.
    exec_timeout_seconds: u64,

    /// Timeout for dialing a preview upstream.
    proxy_upstream_timeout_seconds: u64,

    /// Consecutive upstream failures tolerated before fallback promotion.
    proxy_error_budget: u32,

    /// Keepalive TTL granted at sandbox creation.
    keepalive_ttl_seconds: u64,

    /// Interval between supervisor sweeps.
    reaper_interval_seconds: u64,

    /// Per-sandbox quota limits.
    quota: QuotaLimits,

    /// MicroVM driver settings.
    microvm: MicroVmSettings,

    /// Container driver settings.
    container: ContainerSettings,

    /// Commands the process driver is allowed to run.
    process_allowed_commands: Vec<String>,

    /// Command a fallback replica serves the workspace with.
    fallback_serve_command: Vec<String>,

    /// First port handed to fallback replicas.
    fallback_port_start: u16,

    /// Last port handed to fallback replicas.
    fallback_port_end: u16,

    /// Timeout for preview upstream health probes.
    health_probe_timeout_seconds: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Config {
    /// Loads configuration from an optional YAML file, then applies environment
    /// overrides.
    pub async fn load(path: Option<&Path>) -> CubicleResult<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path).await?;
                serde_yaml::from_str(&contents)?
            }
            None => Self::default(),
        };
        config.apply_env(&std::env::vars().collect::<HashMap<_, _>>())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the recognized environment variables on top of this configuration.
    ///
    /// Recognized: `STORAGE_BACKEND`, `STORAGE_ROOT`, `S3_ENDPOINT`, `S3_BUCKET`,
    /// `S3_ACCESS_KEY`, `S3_SECRET_KEY`, `ISOLATION_BACKEND`, `WORKSPACES_ROOT`,
    /// `SNAPSHOT_RETENTION`, `EXEC_TIMEOUT_SECONDS`,
    /// `PROXY_UPSTREAM_TIMEOUT_SECONDS`.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> CubicleResult<()> {
        if let Some(v) = vars.get("STORAGE_BACKEND") {
            self.storage_backend = v.parse()?;
        }
        if let Some(v) = vars.get("STORAGE_ROOT") {
            self.storage_root = PathBuf::from(v);
        }
        if let Some(v) = vars.get("S3_ENDPOINT") {
            self.s3.endpoint = Some(v.clone());
        }
        if let Some(v) = vars.get("S3_BUCKET") {
            self.s3.bucket = Some(v.clone());
        }
        if let Some(v) = vars.get("S3_ACCESS_KEY") {
            self.s3.access_key = Some(v.clone());
        }
        if let Some(v) = vars.get("S3_SECRET_KEY") {
            self.s3.secret_key = Some(v.clone());
        }
        if let Some(v) = vars.get("ISOLATION_BACKEND") {
            self.isolation_backend = v.parse()?;
        }
        if let Some(v) = vars.get("WORKSPACES_ROOT") {
            self.workspaces_root = PathBuf::from(v);
        }
        if let Some(v) = vars.get("SNAPSHOT_RETENTION") {
            self.snapshot_retention = parse_number(v, "SNAPSHOT_RETENTION")?;
        }
        if let Some(v) = vars.get("EXEC_TIMEOUT_SECONDS") {
            self.exec_timeout_seconds = parse_number(v, "EXEC_TIMEOUT_SECONDS")?;
        }
        if let Some(v) = vars.get("PROXY_UPSTREAM_TIMEOUT_SECONDS") {
            self.proxy_upstream_timeout_seconds = parse_number(v, "PROXY_UPSTREAM_TIMEOUT_SECONDS")?;
        }
        Ok(())
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> CubicleResult<()> {
        if self.storage_backend == StorageKind::S3 && self.s3.bucket.is_none() {
            return Err(CubicleError::InvalidArgument(
                "S3_BUCKET is required when STORAGE_BACKEND=s3".to_string(),
            ));
        }
        if self.snapshot_retention == 0 {
            return Err(CubicleError::InvalidArgument(
                "snapshot_retention must be at least 1".to_string(),
            ));
        }
        if self.fallback_port_start > self.fallback_port_end {
            return Err(CubicleError::InvalidArgument(
                "fallback port range is empty".to_string(),
            ));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn parse_number<T: FromStr>(value: &str, name: &str) -> CubicleResult<T> {
    value.parse().map_err(|_| {
        CubicleError::InvalidArgument(format!("{} must be a number, got {:?}", name, value))
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_exec_per_hour: DEFAULT_QUOTA_EXEC_PER_HOUR,
            max_concurrent_exec: DEFAULT_QUOTA_CONCURRENT_EXEC,
            max_memory_bytes: DEFAULT_QUOTA_MEMORY_BYTES,
            max_storage_bytes: DEFAULT_QUOTA_STORAGE_BYTES,
            max_egress_bytes_per_hour: DEFAULT_QUOTA_EGRESS_BYTES_PER_HOUR,
            max_cpu_seconds_per_hour: DEFAULT_QUOTA_CPU_SECONDS_PER_HOUR,
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_CONTAINER_IMAGE.to_string(),
            name_prefix: DEFAULT_CONTAINER_NAME_PREFIX.to_string(),
            restart_policy: DEFAULT_CONTAINER_RESTART_POLICY.to_string(),
            workspace_guest_path: DEFAULT_CONTAINER_WORKSPACE.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_backend: StorageKind::Local,
            storage_root: DEFAULT_STORAGE_ROOT.clone(),
            s3: S3Settings::default(),
            isolation_backend: IsolationKind::Auto,
            workspaces_root: DEFAULT_WORKSPACES_ROOT.clone(),
            snapshot_retention: DEFAULT_SNAPSHOT_RETENTION,
            snapshot_compression_level: DEFAULT_SNAPSHOT_COMPRESSION_LEVEL,
            restore_preserve_mtime: true,
            multipart_threshold_bytes: DEFAULT_MULTIPART_THRESHOLD_BYTES,
            exec_timeout_seconds: DEFAULT_EXEC_TIMEOUT_SECONDS,
            proxy_upstream_timeout_seconds: DEFAULT_PROXY_UPSTREAM_TIMEOUT_SECONDS,
            proxy_error_budget: DEFAULT_PROXY_ERROR_BUDGET,
            keepalive_ttl_seconds: DEFAULT_KEEPALIVE_TTL_SECONDS,
            reaper_interval_seconds: DEFAULT_REAPER_INTERVAL_SECONDS,
            quota: QuotaLimits::default(),
            microvm: MicroVmSettings::default(),
            container: ContainerSettings::default(),
            process_allowed_commands: DEFAULT_PROCESS_ALLOWED_COMMANDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback_serve_command: DEFAULT_FALLBACK_SERVE_COMMAND
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback_port_start: DEFAULT_FALLBACK_PORT_START,
            fallback_port_end: DEFAULT_FALLBACK_PORT_END,
            health_probe_timeout_seconds: DEFAULT_HEALTH_PROBE_TIMEOUT_SECONDS,
        }
    }
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: None,
            access_key: None,
            secret_key: None,
            region: "us-east-1".to_string(),
        }
    }
}

impl FromStr for StorageKind {
    type Err = CubicleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageKind::Local),
            "s3" => Ok(StorageKind::S3),
            other => Err(CubicleError::InvalidArgument(format!(
                "unknown storage backend {:?}; expected local or s3",
                other
            ))),
        }
    }
}

impl FromStr for IsolationKind {
    type Err = CubicleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(IsolationKind::Auto),
            "microvm" => Ok(IsolationKind::MicroVm),
            "container" => Ok(IsolationKind::Container),
            "process" => Ok(IsolationKind::Process),
            other => Err(CubicleError::InvalidArgument(format!(
                "unknown isolation backend {:?}; expected auto, microvm, container, or process",
                other
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
