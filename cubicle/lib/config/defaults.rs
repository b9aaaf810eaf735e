//! Default values for the control-plane configuration.

use std::{path::PathBuf, sync::LazyLock};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default root under which per-user workspaces live.
pub static DEFAULT_WORKSPACES_ROOT: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/srv/workspaces"));

/// The default root for the local storage backend.
pub static DEFAULT_STORAGE_ROOT: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/srv/snapshots"));

/// The default number of snapshots retained per user.
pub const DEFAULT_SNAPSHOT_RETENTION: usize = 5;

/// The default zstd compression level for snapshot archives.
pub const DEFAULT_SNAPSHOT_COMPRESSION_LEVEL: i32 = 10;

/// Objects at or above this size are uploaded with multipart upload.
pub const DEFAULT_MULTIPART_THRESHOLD_BYTES: u64 = 16 * 1024 * 1024;

/// The minimum multipart part size accepted by S3-compatible stores.
pub const MULTIPART_MIN_PART_BYTES: u64 = 5 * 1024 * 1024;

/// The maximum number of parts in one multipart upload.
pub const MULTIPART_MAX_PARTS: u64 = 10_000;

/// The default timeout for a single exec.
pub const DEFAULT_EXEC_TIMEOUT_SECONDS: u64 = 30;

/// The default timeout for dialing a preview upstream.
pub const DEFAULT_PROXY_UPSTREAM_TIMEOUT_SECONDS: u64 = 5;

/// Consecutive upstream failures tolerated before fallback promotion.
pub const DEFAULT_PROXY_ERROR_BUDGET: u32 = 3;

/// The default keepalive TTL granted to a sandbox at creation.
pub const DEFAULT_KEEPALIVE_TTL_SECONDS: u64 = 900;

/// How often the supervisor sweeps for expired sandboxes.
pub const DEFAULT_REAPER_INTERVAL_SECONDS: u64 = 30;

/// The default per-sandbox execution cap in the rolling one-hour window.
pub const DEFAULT_QUOTA_EXEC_PER_HOUR: u32 = 120;

/// The default per-sandbox concurrent execution cap.
pub const DEFAULT_QUOTA_CONCURRENT_EXEC: u32 = 8;

/// The default per-sandbox memory estimate cap.
pub const DEFAULT_QUOTA_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// The default per-sandbox workspace storage cap.
pub const DEFAULT_QUOTA_STORAGE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// The default per-sandbox network egress cap in the rolling window.
pub const DEFAULT_QUOTA_EGRESS_BYTES_PER_HOUR: u64 = 1024 * 1024 * 1024;

/// The default per-sandbox CPU-seconds cap in the rolling window.
pub const DEFAULT_QUOTA_CPU_SECONDS_PER_HOUR: u64 = 3600;

/// First port handed out to fallback preview replicas.
pub const DEFAULT_FALLBACK_PORT_START: u16 = 33000;

/// Last port handed out to fallback preview replicas.
pub const DEFAULT_FALLBACK_PORT_END: u16 = 33999;

/// The default image for the container driver and fallback replicas.
pub const DEFAULT_CONTAINER_IMAGE: &str = "ubuntu:22.04";

/// The guest path the workspace is bind-mounted at inside containers.
pub const DEFAULT_CONTAINER_WORKSPACE: &str = "/workspace";

/// The prefix for container hostnames and names.
pub const DEFAULT_CONTAINER_NAME_PREFIX: &str = "cubicle";

/// The default container restart policy.
pub const DEFAULT_CONTAINER_RESTART_POLICY: &str = "no";

/// Commands the process driver accepts when no deployment allow-list is set.
pub const DEFAULT_PROCESS_ALLOWED_COMMANDS: &[&str] = &[
    "sh", "bash", "echo", "cat", "ls", "env", "true", "false", "sleep", "python3", "node",
];

/// The command a fallback replica serves the workspace with; the allocated
/// port is appended as the final argument.
pub const DEFAULT_FALLBACK_SERVE_COMMAND: &[&str] = &["python3", "-m", "http.server", "--bind", "0.0.0.0"];

/// The timeout for preview upstream health probes.
pub const DEFAULT_HEALTH_PROBE_TIMEOUT_SECONDS: u64 = 2;
